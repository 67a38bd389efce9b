//! Chromium automation over the DevTools protocol in pipe mode.
//!
//! `pipecdp` launches a local Chromium with `--remote-debugging-pipe` and
//! speaks NUL-framed CDP JSON over a pair of anonymous pipes inherited on
//! file descriptors 3 and 4: no WebSocket, no debugging port. On top of
//! the transport sits a session multiplexer (one CDP session per attached
//! target) and the [`Browser`] → [`Tab`] → [`Elem`] object model.
//!
//! ```no_run
//! use std::time::Duration;
//! use pipecdp::{Browser, Config};
//!
//! #[tokio::main]
//! async fn main() -> pipecdp::Result<()> {
//!     let browser = Browser::start(Config::default()).await?;
//!     let tab = browser.navigate("https://example.com").await?;
//!     tab.wait_for_event("Page.loadEventFired", Duration::from_secs(10))
//!         .await?;
//!     if let Some(heading) = tab.find_elem("h1").await? {
//!         println!("{}", heading.text().await?);
//!     }
//!     browser.close().await;
//!     Ok(())
//! }
//! ```
//!
//! The browser process is supervised: its exit tears the transport down
//! (failing everything outstanding with a connection-lost error), a dead
//! transport walks a SIGTERM/SIGKILL ladder, and on Linux the child is
//! additionally bound to the driver's lifetime with
//! `prctl(PR_SET_PDEATHSIG)` so a crashed driver leaves no orphan.
//!
//! Executable discovery honors `PIPECDP_CHROME_PATH` and falls back to the
//! usual Chromium names on `PATH`. Diagnostics go through [`tracing`];
//! `RUST_LOG` (with a `tracing-subscriber` in the host application)
//! controls verbosity and nothing else.

mod browser;
mod config;
mod elem;
mod error;
mod launcher;
mod mux;
pub mod protocol;
mod tab;
#[cfg(test)]
mod test_support;
mod transport;

pub use browser::Browser;
pub use config::{default_chrome_path, Config, CHROME_PATH_ENV};
pub use elem::Elem;
pub use error::{Error, Result};
pub use mux::HandlerId;
pub use tab::Tab;
