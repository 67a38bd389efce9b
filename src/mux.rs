//! Session multiplexer: correlates responses to outstanding command ids and
//! fans events out to per-session handlers and one-shot waiters.
//!
//! A single dispatch task consumes parsed frames from the transport. Handler
//! bodies never run on the dispatch path; they are spawned onto the runtime
//! so a slow or panicking handler cannot stall the reader. Target lifecycle
//! events on the browser session are applied inline, in arrival order, so a
//! detach is observable before any later frame is processed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{Command, CommandError, Incoming};
use crate::transport::Transport;

/// Session id of the browser-level session.
pub(crate) const BROWSER_SESSION: &str = "";

/// A persistent event handler. Receives the event params; the returned
/// future runs as its own task.
pub type EventHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

/// Token returned by handler registration, used for removal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct HandlerId(u64);

pub(crate) type Predicate = Box<dyn Fn(&Value) -> bool + Send>;

/// Target lifecycle notifications surfaced to the owning browser, parsed
/// from `Target.*` events on the browser session.
#[derive(Clone, Debug)]
pub(crate) enum TargetLifecycle {
    Created(TargetInfo),
    Attached { session_id: String, info: TargetInfo },
    Detached { session_id: String },
    Destroyed { target_id: String },
    InfoChanged(TargetInfo),
}

#[derive(Clone, Debug, Deserialize)]
pub(crate) struct TargetInfo {
    #[serde(rename = "targetId")]
    pub target_id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub attached: bool,
    #[serde(rename = "browserContextId")]
    pub browser_context_id: Option<String>,
}

pub(crate) type LifecycleHook = Box<dyn Fn(&Multiplexer, &TargetLifecycle) + Send + Sync>;

struct HandlerEntry {
    id: u64,
    handler: EventHandler,
}

struct Waiter {
    id: u64,
    predicate: Option<Predicate>,
    tx: oneshot::Sender<Value>,
}

/// Per-session dispatch state.
pub(crate) struct SessionState {
    handlers: Mutex<HashMap<String, Vec<HandlerEntry>>>,
    waiters: Mutex<HashMap<String, Vec<Waiter>>>,
    detached: CancellationToken,
}

impl SessionState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            detached: CancellationToken::new(),
        })
    }
}

struct PendingCall {
    session_id: String,
    tx: oneshot::Sender<Result<Value>>,
}

pub(crate) struct Multiplexer {
    transport: Transport,
    next_id: AtomicU64,
    next_token: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCall>>,
    sessions: DashMap<String, Arc<SessionState>>,
    lifecycle: Mutex<Option<LifecycleHook>>,
    closed: CancellationToken,
}

impl Multiplexer {
    /// Wire a multiplexer onto a running transport and start its dispatch
    /// task.
    pub fn spawn(transport: Transport, inbound: mpsc::Receiver<Incoming>) -> Arc<Self> {
        let closed = transport.closed_token();
        let mux = Arc::new(Self {
            transport,
            next_id: AtomicU64::new(0),
            next_token: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            sessions: DashMap::new(),
            lifecycle: Mutex::new(None),
            closed,
        });
        mux.sessions
            .insert(BROWSER_SESSION.to_string(), SessionState::new());
        tokio::spawn(Self::dispatch_loop(Arc::clone(&mux), inbound));
        mux
    }

    /// Install the hook invoked inline for every target lifecycle event on
    /// the browser session. At most one hook; the browser owns it.
    pub fn set_lifecycle_hook(&self, hook: LifecycleHook) {
        *self.lifecycle.lock() = Some(hook);
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn close(&self) {
        self.transport.close();
    }

    /// Send one command on a session and await its response, the deadline,
    /// session detach, or transport loss, whichever resolves first.
    pub async fn call(
        &self,
        session_id: &str,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value> {
        let session = self.session(session_id)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().insert(
            id,
            PendingCall {
                session_id: session_id.to_string(),
                tx,
            },
        );

        let command = Command::new(
            id,
            method,
            params,
            (!session_id.is_empty()).then(|| session_id.to_string()),
        );
        let frame = match command.encode() {
            Ok(frame) => frame,
            Err(err) => {
                self.pending.lock().remove(&id);
                return Err(err);
            }
        };
        if let Err(err) = self.transport.send(frame).await {
            self.pending.lock().remove(&id);
            return Err(err);
        }

        let settled = async {
            tokio::select! {
                biased;
                outcome = &mut rx => match outcome {
                    Ok(outcome) => outcome,
                    Err(_) => Err(Error::ConnectionLost),
                },
                _ = session.detached.cancelled() => {
                    self.pending.lock().remove(&id);
                    Err(Error::DetachedTab)
                }
                _ = self.closed.cancelled() => {
                    self.pending.lock().remove(&id);
                    Err(Error::ConnectionLost)
                }
            }
        };
        match tokio::time::timeout(deadline, settled).await {
            Ok(outcome) => outcome,
            Err(_) => {
                if self.pending.lock().remove(&id).is_some() {
                    Err(Error::Timeout(deadline))
                } else {
                    // The response won the race with the deadline.
                    match rx.try_recv() {
                        Ok(outcome) => outcome,
                        Err(_) => Err(Error::ConnectionLost),
                    }
                }
            }
        }
    }

    /// Register a persistent handler for `method` events on a session.
    pub fn on(&self, session_id: &str, method: &str, handler: EventHandler) -> Result<HandlerId> {
        let session = self.session(session_id)?;
        let id = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        session
            .handlers
            .lock()
            .entry(method.to_string())
            .or_default()
            .push(HandlerEntry { id, handler });
        Ok(HandlerId(id))
    }

    /// Remove a previously registered handler. Returns whether it existed.
    pub fn off(&self, session_id: &str, handler: HandlerId) -> bool {
        let Some(session) = self.lookup(session_id) else {
            return false;
        };
        let mut table = session.handlers.lock();
        let mut removed = false;
        table.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|entry| entry.id != handler.0);
            removed |= entries.len() != before;
            !entries.is_empty()
        });
        removed
    }

    /// Park until a `method` event whose predicate matches arrives on the
    /// session, or until the deadline.
    pub async fn wait_for_event(
        &self,
        session_id: &str,
        method: &str,
        predicate: Option<Predicate>,
        deadline: Duration,
    ) -> Result<Value> {
        let session = self.session(session_id)?;

        let id = self.next_token.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, mut rx) = oneshot::channel();
        session
            .waiters
            .lock()
            .entry(method.to_string())
            .or_default()
            .push(Waiter { id, predicate, tx });

        let settled = async {
            tokio::select! {
                biased;
                event = &mut rx => event.map_err(|_| Error::ConnectionLost),
                _ = session.detached.cancelled() => Err(Error::DetachedTab),
                _ = self.closed.cancelled() => Err(Error::ConnectionLost),
            }
        };
        match tokio::time::timeout(deadline, settled).await {
            Ok(outcome) => outcome,
            Err(_) => {
                if Self::remove_waiter(&session, method, id) {
                    Err(Error::Timeout(deadline))
                } else {
                    // Resolved while the deadline fired; take the event.
                    rx.try_recv().map_err(|_| Error::Timeout(deadline))
                }
            }
        }
    }

    /// Tear down a session: every pending command and parked waiter on it
    /// resolves with [`Error::DetachedTab`], and later frames for it are
    /// dropped with a warning.
    pub fn detach_session(&self, session_id: &str) {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return;
        };
        session.detached.cancel();
        session.handlers.lock().clear();
        session.waiters.lock().clear();

        let stranded: Vec<PendingCall> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, call)| call.session_id == session_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id))
                .collect()
        };
        for call in stranded {
            let _ = call.tx.send(Err(Error::DetachedTab));
        }
    }

    #[cfg(test)]
    pub fn session_exists(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    fn session(&self, session_id: &str) -> Result<Arc<SessionState>> {
        self.lookup(session_id).ok_or(Error::DetachedTab)
    }

    fn lookup(&self, session_id: &str) -> Option<Arc<SessionState>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn remove_waiter(session: &SessionState, method: &str, waiter_id: u64) -> bool {
        let mut table = session.waiters.lock();
        let Some(mut list) = table.remove(method) else {
            return false;
        };
        let before = list.len();
        list.retain(|waiter| waiter.id != waiter_id);
        let removed = list.len() != before;
        if !list.is_empty() {
            table.insert(method.to_string(), list);
        }
        removed
    }

    async fn dispatch_loop(self: Arc<Self>, mut inbound: mpsc::Receiver<Incoming>) {
        while let Some(frame) = inbound.recv().await {
            match frame {
                Incoming::Response {
                    id, result, error, ..
                } => self.complete(id, result, error),
                Incoming::Event {
                    method,
                    params,
                    session_id,
                } => self.dispatch_event(&method, params, session_id),
            }
        }
        self.fail_outstanding();
    }

    fn complete(&self, id: u64, result: Option<Value>, error: Option<CommandError>) {
        let Some(call) = self.pending.lock().remove(&id) else {
            // Timed-out or cancelled command; late responses are dropped.
            debug!(target: "pipecdp::mux", id, "response for unknown command id");
            return;
        };
        let outcome = match error {
            Some(error) => Err(error.into()),
            None => Ok(result.unwrap_or_else(|| Value::Object(Default::default()))),
        };
        let _ = call.tx.send(outcome);
    }

    fn dispatch_event(&self, method: &str, params: Value, session_id: Option<String>) {
        let key = session_id.unwrap_or_default();
        if key == BROWSER_SESSION {
            self.apply_target_lifecycle(method, &params);
        }

        let Some(session) = self.lookup(&key) else {
            warn!(
                target: "pipecdp::mux",
                method,
                session = %key,
                "event for unknown session dropped"
            );
            return;
        };

        let handlers: Vec<EventHandler> = session
            .handlers
            .lock()
            .get(method)
            .map(|entries| entries.iter().map(|e| Arc::clone(&e.handler)).collect())
            .unwrap_or_default();
        for handler in handlers {
            let future = handler(params.clone());
            let method = method.to_string();
            tokio::spawn(async move {
                if std::panic::AssertUnwindSafe(future)
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    warn!(target: "pipecdp::mux", method = %method, "event handler panicked");
                }
            });
        }

        let mut table = session.waiters.lock();
        if let Some(parked) = table.remove(method) {
            let mut kept = Vec::with_capacity(parked.len());
            for waiter in parked {
                let matches = waiter
                    .predicate
                    .as_ref()
                    .map(|predicate| predicate(&params))
                    .unwrap_or(true);
                if matches {
                    let _ = waiter.tx.send(params.clone());
                } else {
                    kept.push(waiter);
                }
            }
            if !kept.is_empty() {
                table.insert(method.to_string(), kept);
            }
        }
    }

    /// Inline target bookkeeping: sessions are minted on attach and torn
    /// down on detach before any handler or later frame can observe them.
    fn apply_target_lifecycle(&self, method: &str, params: &Value) {
        let lifecycle = match method {
            "Target.targetCreated" => parse_info(params).map(TargetLifecycle::Created),
            "Target.targetInfoChanged" => parse_info(params).map(TargetLifecycle::InfoChanged),
            "Target.attachedToTarget" => {
                let session_id = params["sessionId"].as_str().map(str::to_string);
                match (session_id, parse_info(params)) {
                    (Some(session_id), Some(info)) => {
                        Some(TargetLifecycle::Attached { session_id, info })
                    }
                    _ => None,
                }
            }
            "Target.detachedFromTarget" => params["sessionId"]
                .as_str()
                .map(|sid| TargetLifecycle::Detached {
                    session_id: sid.to_string(),
                }),
            "Target.targetDestroyed" => {
                params["targetId"]
                    .as_str()
                    .map(|tid| TargetLifecycle::Destroyed {
                        target_id: tid.to_string(),
                    })
            }
            _ => None,
        };
        let Some(lifecycle) = lifecycle else {
            return;
        };

        if let TargetLifecycle::Attached { session_id, .. } = &lifecycle {
            self.sessions
                .entry(session_id.clone())
                .or_insert_with(SessionState::new);
        }

        if let Some(hook) = self.lifecycle.lock().as_ref() {
            hook(self, &lifecycle);
        }

        if let TargetLifecycle::Detached { session_id } = &lifecycle {
            self.detach_session(session_id);
        }
    }

    /// Transport is gone: complete everything outstanding, exactly once,
    /// with a connection-lost error. Waiters observe the closed token.
    fn fail_outstanding(&self) {
        let stranded: Vec<PendingCall> = self.pending.lock().drain().map(|(_, c)| c).collect();
        if !stranded.is_empty() {
            debug!(
                target: "pipecdp::mux",
                count = stranded.len(),
                "failing outstanding commands after transport loss"
            );
        }
        for call in stranded {
            let _ = call.tx.send(Err(Error::ConnectionLost));
        }
    }
}

fn parse_info(params: &Value) -> Option<TargetInfo> {
    serde_json::from_value(params["targetInfo"].clone()).ok()
}
