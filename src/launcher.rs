//! Process supervision: pipe construction, Chromium launch with inherited
//! descriptors 3/4, parent-death linkage, and the shutdown ladder.

use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tempfile::TempDir;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};

/// Descriptors fixed by `--remote-debugging-pipe`: the child reads commands
/// on 3 and writes frames on 4.
const CHILD_READ_FD: RawFd = 3;
const CHILD_WRITE_FD: RawFd = 4;

/// Grace allowed for a voluntary exit after the transport goes down.
pub(crate) const TERM_GRACE: Duration = Duration::from_secs(5);
/// Grace between SIGTERM and SIGKILL.
pub(crate) const KILL_GRACE: Duration = Duration::from_secs(3);

pub(crate) struct LaunchedChrome {
    pub child: Child,
    pub pid: Option<u32>,
    pub reader: pipe::Receiver,
    pub writer: pipe::Sender,
}

/// Create both pipe pairs and spawn Chromium with the child ends installed
/// on fds 3/4. The parent keeps the other ends, wrapped for async use.
///
/// The pipes are opened close-on-exec so the child keeps only the two fds
/// dup'd onto 3/4. Were the parent-side ends inherited too, the child
/// would hold a write end of its own command pipe and its fd 3 could
/// never observe EOF when the driver closes the transport.
pub(crate) fn launch(config: &Config, user_data_dir: &Path) -> Result<LaunchedChrome> {
    // Parent writes p2c, child reads it on fd 3; child writes c2p on fd 4.
    let (p2c_read, p2c_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(launch_err)?;
    let (c2p_read, c2p_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(launch_err)?;

    let child_read = p2c_read.as_raw_fd();
    let child_write = c2p_write.as_raw_fd();

    let argv = config.build_argv(user_data_dir);
    debug!(target: "pipecdp::launcher", path = %config.chrome_path.display(), args = ?argv, "spawning chromium");

    let mut command = Command::new(&config.chrome_path);
    command
        .args(&argv)
        .envs(&config.env)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        // Inherited stderr fills up and deadlocks against pipe
        // back-pressure; the browser's own log goes to the data dir.
        .stderr(Stdio::null())
        .kill_on_drop(true);

    unsafe {
        command.pre_exec(move || {
            install_child_fd(child_read, CHILD_READ_FD)?;
            install_child_fd(child_write, CHILD_WRITE_FD)?;
            // If the driver dies without running cleanup, the kernel
            // delivers SIGTERM to the browser. Linux-only; elsewhere the
            // supervisor ladder is the only teardown path.
            #[cfg(target_os = "linux")]
            nix::sys::prctl::set_pdeathsig(Signal::SIGTERM).map_err(std::io::Error::from)?;
            Ok(())
        });
    }

    let child = command.spawn().map_err(Error::Launch)?;
    let pid = child.id();
    info!(target: "pipecdp::launcher", pid, "chromium launched in pipe mode");

    // The child holds its own copies now.
    drop(p2c_read);
    drop(c2p_write);

    let reader = pipe::Receiver::from_owned_fd(c2p_read).map_err(Error::Launch)?;
    let writer = pipe::Sender::from_owned_fd(p2c_write).map_err(Error::Launch)?;

    Ok(LaunchedChrome {
        child,
        pid,
        reader,
        writer,
    })
}

fn launch_err(errno: nix::errno::Errno) -> Error {
    Error::Launch(errno.into())
}

/// Expose `src` to the child on `dst` across the exec. A dup2 onto another
/// fd clears close-on-exec on the copy while the close-on-exec originals
/// go away; when the fds already coincide the flag is cleared in place,
/// since dup2 would be a no-op there.
fn install_child_fd(src: RawFd, dst: RawFd) -> std::io::Result<()> {
    if src == dst {
        fcntl(src, FcntlArg::F_SETFD(FdFlag::empty())).map_err(std::io::Error::from)?;
    } else {
        nix::unistd::dup2(src, dst).map_err(std::io::Error::from)?;
    }
    Ok(())
}

/// Watches the child. Child exit closes the transport; transport loss walks
/// the wait → SIGTERM → SIGKILL ladder so no browser process survives the
/// driver.
pub(crate) struct Supervisor {
    pid: Option<u32>,
    exit: watch::Receiver<Option<ExitStatus>>,
}

impl Supervisor {
    pub fn spawn(
        mut child: Child,
        pid: Option<u32>,
        transport_closed: CancellationToken,
        term_grace: Duration,
        kill_grace: Duration,
    ) -> Self {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => {
                    debug!(target: "pipecdp::launcher", ?status, "browser exited");
                    transport_closed.cancel();
                    status.ok()
                }
                _ = transport_closed.cancelled() => {
                    match timeout(term_grace, child.wait()).await {
                        Ok(status) => status.ok(),
                        Err(_) => {
                            warn!(target: "pipecdp::launcher", pid, "browser ignored pipe closure, sending SIGTERM");
                            send_signal(pid, Signal::SIGTERM);
                            match timeout(kill_grace, child.wait()).await {
                                Ok(status) => status.ok(),
                                Err(_) => {
                                    warn!(target: "pipecdp::launcher", pid, "browser ignored SIGTERM, sending SIGKILL");
                                    send_signal(pid, Signal::SIGKILL);
                                    child.wait().await.ok()
                                }
                            }
                        }
                    }
                }
            };
            let _ = tx.send(status);
        });
        Self { pid, exit: rx }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status, if the child has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.exit.borrow()
    }

    /// Wait up to `limit` for the child to be reaped.
    pub async fn reaped(&self, limit: Duration) -> Option<ExitStatus> {
        let mut rx = self.exit.clone();
        timeout(limit, async move {
            loop {
                if let Some(status) = *rx.borrow_and_update() {
                    return Some(status);
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await
        .ok()
        .flatten()
    }
}

fn send_signal(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    if let Err(err) = kill(Pid::from_raw(pid as i32), signal) {
        debug!(target: "pipecdp::launcher", %pid, ?signal, %err, "signal not delivered");
    }
}

/// The profile directory and its cleanup policy. A driver-allocated temp
/// dir is always removed; a caller-provided dir only under
/// `clean_data_dir`.
pub(crate) enum DataDir {
    Temp { dir: Option<TempDir>, path: PathBuf },
    User { path: PathBuf, clean: bool },
}

impl DataDir {
    pub fn prepare(config: &Config) -> Result<Self> {
        match &config.user_data_dir {
            Some(path) => {
                if config.clean_data_dir {
                    remove_existing(path)?;
                }
                std::fs::create_dir_all(path).map_err(Error::Launch)?;
                Ok(DataDir::User {
                    path: path.clone(),
                    clean: config.clean_data_dir,
                })
            }
            None => {
                let dir = tempfile::Builder::new()
                    .prefix("pipecdp-profile-")
                    .tempdir()
                    .map_err(Error::Launch)?;
                let path = dir.path().to_path_buf();
                debug!(target: "pipecdp::launcher", path = %path.display(), "allocated temp profile dir");
                Ok(DataDir::Temp {
                    dir: Some(dir),
                    path,
                })
            }
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            DataDir::Temp { path, .. } | DataDir::User { path, .. } => path,
        }
    }

    /// Apply the close-time policy. Safe to call once; drop covers the
    /// temp-dir case on early exits.
    pub fn cleanup(&mut self) {
        match self {
            DataDir::Temp { dir, .. } => {
                if let Some(dir) = dir.take() {
                    if let Err(err) = dir.close() {
                        warn!(target: "pipecdp::launcher", %err, "failed to remove temp profile dir");
                    }
                }
            }
            DataDir::User { path, clean } => {
                if *clean {
                    if let Err(err) = remove_existing(path) {
                        warn!(target: "pipecdp::launcher", %err, "failed to clean user data dir");
                    }
                }
            }
        }
    }
}

fn remove_existing(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(Error::Launch(err)),
    }
}
