//! Browser: owns the supervisor, transport, and multiplexer, tracks page
//! targets, and hands out [`Tab`]s as they attach.

use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::launcher::{self, DataDir, Supervisor, KILL_GRACE, TERM_GRACE};
use crate::mux::{HandlerId, Multiplexer, TargetLifecycle, BROWSER_SESSION};
use crate::tab::{Tab, TabInner};
use crate::transport::Transport;

/// Time allowed for the browser to exit voluntarily after `Browser.close`.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// A running Chromium instance reachable over the debugging pipe.
///
/// Cheap to clone; all clones drive the same browser. Dropping the last
/// clone closes the transport, which walks the supervisor's kill ladder,
/// but [`close`](Browser::close) is the orderly path and should be
/// preferred.
#[derive(Clone)]
pub struct Browser {
    inner: Arc<BrowserInner>,
}

pub(crate) struct BrowserInner {
    config: Config,
    mux: Arc<Multiplexer>,
    supervisor: Option<Supervisor>,
    data_dir: Mutex<Option<DataDir>>,
    targets: DashMap<String, Arc<TabInner>>,
    tab_order: Mutex<Vec<String>>,
    attach_tx: watch::Sender<u64>,
    attach_rx: watch::Receiver<u64>,
    closed: AtomicBool,
}

impl Browser {
    /// Launch Chromium per `config` and attach to its first page target.
    ///
    /// On any failure the child is torn down, the pipes are closed, and a
    /// driver-allocated temp profile dir is removed before returning.
    pub async fn start(config: Config) -> Result<Browser> {
        let mut data_dir = DataDir::prepare(&config)?;
        let launched = match launcher::launch(&config, data_dir.path()) {
            Ok(launched) => launched,
            Err(err) => {
                data_dir.cleanup();
                return Err(err);
            }
        };

        let (transport, inbound) =
            Transport::spawn(Box::new(launched.reader), Box::new(launched.writer));
        let mux = Multiplexer::spawn(transport.clone(), inbound);
        let supervisor = Supervisor::spawn(
            launched.child,
            launched.pid,
            transport.closed_token(),
            TERM_GRACE,
            KILL_GRACE,
        );

        let browser = Self::assemble(config, mux, Some(supervisor), Some(data_dir));
        match browser.bootstrap().await {
            Ok(()) => Ok(browser),
            Err(err) => {
                warn!(target: "pipecdp::browser", %err, "startup failed, cleaning up");
                browser.close().await;
                Err(err)
            }
        }
    }

    /// Attach over already-established stream halves, without a child
    /// process. The test harness speaks the browser side.
    #[cfg(test)]
    pub(crate) async fn start_with_pipes(
        config: Config,
        reader: crate::transport::BoxedRead,
        writer: crate::transport::BoxedWrite,
    ) -> Result<Browser> {
        let data_dir = DataDir::prepare(&config)?;
        let (transport, inbound) = Transport::spawn(reader, writer);
        let mux = Multiplexer::spawn(transport, inbound);
        let browser = Self::assemble(config, mux, None, Some(data_dir));
        browser.bootstrap().await?;
        Ok(browser)
    }

    fn assemble(
        config: Config,
        mux: Arc<Multiplexer>,
        supervisor: Option<Supervisor>,
        data_dir: Option<DataDir>,
    ) -> Browser {
        let (attach_tx, attach_rx) = watch::channel(0u64);
        let inner = Arc::new(BrowserInner {
            config,
            mux,
            supervisor,
            data_dir: Mutex::new(data_dir),
            targets: DashMap::new(),
            tab_order: Mutex::new(Vec::new()),
            attach_tx,
            attach_rx,
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        inner
            .mux
            .set_lifecycle_hook(Box::new(move |mux, lifecycle| {
                if let Some(inner) = weak.upgrade() {
                    inner.apply_lifecycle(mux, lifecycle);
                }
            }));

        Browser { inner }
    }

    /// Enable discovery and flat auto-attach, then wait for the first page
    /// target to arrive as an attached session.
    async fn bootstrap(&self) -> Result<()> {
        self.send("Target.setDiscoverTargets", json!({"discover": true}))
            .await?;
        self.send(
            "Target.setAutoAttach",
            json!({
                "autoAttach": true,
                "waitForDebuggerOnStart": false,
                "flatten": true,
            }),
        )
        .await?;

        let startup = self.inner.config.startup_timeout;
        let first = self
            .inner
            .wait_for_attach(startup, |inner| inner.first_attached_tab())
            .await?;
        info!(
            target: "pipecdp::browser",
            target_id = %first.target_id(),
            "first tab attached"
        );
        Ok(())
    }

    /// Issue a browser-session command and await its result.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        self.inner
            .mux
            .call(
                BROWSER_SESSION,
                method,
                params,
                self.inner.config.command_timeout,
            )
            .await
    }

    /// Navigate a tab to `url`, creating one if none exists. Returns
    /// without waiting for the load; pair with
    /// [`Tab::wait_for_event`] when load completion matters.
    pub async fn navigate(&self, url: &str) -> Result<Tab> {
        let tab = match self.first_tab() {
            Some(tab) => tab,
            None => self.create_tab("about:blank").await?,
        };
        tab.navigate(url).await?;
        Ok(tab)
    }

    /// Open a new page target and wait for its session to attach.
    pub async fn create_tab(&self, url: &str) -> Result<Tab> {
        let result = self
            .send("Target.createTarget", json!({"url": url}))
            .await?;
        let target_id = result["targetId"]
            .as_str()
            .ok_or_else(|| Error::protocol(0, "createTarget returned no targetId", None))?
            .to_string();

        let deadline = self.inner.config.command_timeout;
        let inner = self
            .inner
            .wait_for_attach(deadline, |browser| {
                browser
                    .targets
                    .get(&target_id)
                    .map(|entry| Arc::clone(entry.value()))
            })
            .await?;
        Ok(Tab::from_inner(inner))
    }

    /// Register a persistent handler for browser-session events.
    pub fn on<F, Fut>(&self, method: &str, handler: F) -> Result<HandlerId>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let handler: Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync> =
            Arc::new(move |params| Box::pin(handler(params)));
        self.inner.mux.on(BROWSER_SESSION, method, handler)
    }

    /// Remove a handler registered with [`on`](Browser::on).
    pub fn off(&self, handler: HandlerId) -> bool {
        self.inner.mux.off(BROWSER_SESSION, handler)
    }

    /// Wait for a browser-session event.
    pub async fn wait_for_event(&self, method: &str, deadline: Duration) -> Result<Value> {
        self.inner
            .mux
            .wait_for_event(BROWSER_SESSION, method, None, deadline)
            .await
    }

    /// Attached tabs in attach order.
    pub fn tabs(&self) -> Vec<Tab> {
        let order = self.inner.tab_order.lock();
        order
            .iter()
            .filter_map(|target_id| {
                self.inner
                    .targets
                    .get(target_id)
                    .map(|entry| Tab::from_inner(Arc::clone(entry.value())))
            })
            .filter(|tab| tab.is_attached())
            .collect()
    }

    /// The earliest-attached page tab still alive.
    pub fn first_tab(&self) -> Option<Tab> {
        self.tabs().into_iter().next()
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.supervisor.as_ref().and_then(Supervisor::pid)
    }

    /// Exit status of the browser process, once reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.inner
            .supervisor
            .as_ref()
            .and_then(Supervisor::exit_status)
    }

    /// Close the browser: `Browser.close`, transport shutdown, supervisor
    /// reap, data-dir policy. Idempotent; the second call is a no-op.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(target: "pipecdp::browser", "closing browser");

        let goodbye = self.inner.mux.call(
            BROWSER_SESSION,
            "Browser.close",
            Value::Null,
            CLOSE_GRACE,
        );
        if let Err(err) = goodbye.await {
            debug!(target: "pipecdp::browser", %err, "Browser.close not acknowledged");
        }

        if let Some(supervisor) = &self.inner.supervisor {
            // Give the browser a moment to exit on its own before the
            // transport closure triggers the supervisor's kill ladder.
            let _ = supervisor.reaped(CLOSE_GRACE).await;
        }
        self.inner.mux.close();
        if let Some(supervisor) = &self.inner.supervisor {
            let reap_limit = TERM_GRACE + KILL_GRACE + Duration::from_secs(2);
            if supervisor.reaped(reap_limit).await.is_none() {
                warn!(target: "pipecdp::browser", "browser was not reaped within the grace ladder");
            }
        }

        if let Some(mut data_dir) = self.inner.data_dir.lock().take() {
            data_dir.cleanup();
        }
    }
}

impl BrowserInner {
    /// Runs inline on the dispatch task for every `Target.*` lifecycle
    /// event, ahead of handler fan-out, so tab state is current before any
    /// later frame or command is processed.
    fn apply_lifecycle(&self, mux: &Multiplexer, lifecycle: &TargetLifecycle) {
        match lifecycle {
            TargetLifecycle::Created(info) => {
                debug!(
                    target: "pipecdp::browser",
                    target_id = %info.target_id,
                    kind = %info.target_type,
                    url = %info.url,
                    attached = info.attached,
                    context = ?info.browser_context_id,
                    "target created"
                );
            }
            TargetLifecycle::Attached { session_id, info } => {
                if info.target_type != "page" {
                    return;
                }
                let tab = TabInner::attached(
                    Arc::clone(&self.mux),
                    info.target_id.clone(),
                    session_id.clone(),
                    info.url.clone(),
                    self.config.command_timeout,
                );
                tab.install_session_handlers();
                tab.spawn_enable_default_domains();
                self.targets.insert(info.target_id.clone(), tab);
                self.tab_order.lock().push(info.target_id.clone());
                self.attach_tx.send_modify(|seq| *seq += 1);
            }
            TargetLifecycle::Detached { session_id } => {
                for entry in self.targets.iter() {
                    if entry.value().session_matches(session_id) {
                        entry.value().mark_detached();
                    }
                }
            }
            TargetLifecycle::Destroyed { target_id } => {
                if let Some((_, tab)) = self.targets.remove(target_id) {
                    if let Some(session_id) = tab.take_session() {
                        // A destroy can arrive without a preceding detach.
                        mux.detach_session(&session_id);
                    }
                    tab.mark_detached();
                }
                self.tab_order.lock().retain(|tid| tid != target_id);
            }
            TargetLifecycle::InfoChanged(info) => {
                if let Some(tab) = self.targets.get(&info.target_id) {
                    tab.value().set_url(info.url.clone());
                }
            }
        }
    }

    fn first_attached_tab(&self) -> Option<Arc<TabInner>> {
        let order = self.tab_order.lock();
        order.iter().find_map(|target_id| {
            self.targets
                .get(target_id)
                .map(|entry| Arc::clone(entry.value()))
                .filter(|tab| tab.is_attached())
        })
    }

    /// Wait for `pick` to produce a tab, re-checking on every attach, until
    /// `deadline`.
    async fn wait_for_attach<F>(&self, deadline: Duration, pick: F) -> Result<Arc<TabInner>>
    where
        F: Fn(&BrowserInner) -> Option<Arc<TabInner>>,
    {
        let closed = self.mux.closed_token();
        let mut rx = self.attach_rx.clone();
        let wait = async {
            loop {
                rx.borrow_and_update();
                if let Some(tab) = pick(self) {
                    return Ok(tab);
                }
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() {
                            return Err(Error::ConnectionLost);
                        }
                    }
                    _ = closed.cancelled() => return Err(Error::ConnectionLost),
                }
            }
        };
        timeout(deadline, wait)
            .await
            .map_err(|_| Error::Timeout(deadline))?
    }
}

impl Drop for BrowserInner {
    fn drop(&mut self) {
        // Last handle gone without close(): shutting the transport unblocks
        // everything and hands the child to the supervisor's ladder. The
        // data-dir policy still applies on this path; close() has already
        // taken the dir on an orderly shutdown.
        self.mux.close();
        if let Some(mut data_dir) = self.data_dir.lock().take() {
            data_dir.cleanup();
        }
    }
}
