//! Tab: a CDP session bound to one page target.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::debug;

use crate::elem::Elem;
use crate::error::{Error, Result};
use crate::mux::{HandlerId, Multiplexer, Predicate};

/// Polling floor and ceiling for the selector waits.
const POLL_FLOOR: Duration = Duration::from_millis(50);
const POLL_CEILING: Duration = Duration::from_millis(200);

/// An attached page target. Cheap to clone; clones share the session.
///
/// A tab moves to the terminal *detached* state when its target is closed
/// or destroyed, after which every operation fails with
/// [`Error::DetachedTab`].
#[derive(Clone)]
pub struct Tab {
    inner: Arc<TabInner>,
}

pub(crate) struct TabInner {
    mux: Arc<Multiplexer>,
    target_id: String,
    session_id: Mutex<Option<String>>,
    detached: AtomicBool,
    url: Mutex<String>,
    frame_id: Mutex<Option<String>>,
    doc_node: Mutex<Option<i64>>,
    command_timeout: Duration,
}

impl TabInner {
    pub(crate) fn attached(
        mux: Arc<Multiplexer>,
        target_id: String,
        session_id: String,
        url: String,
        command_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            mux,
            target_id,
            session_id: Mutex::new(Some(session_id)),
            detached: AtomicBool::new(false),
            url: Mutex::new(url),
            frame_id: Mutex::new(None),
            doc_node: Mutex::new(None),
            command_timeout,
        })
    }

    /// Invalidate the document cache on every frame navigation; a root
    /// frame navigation also moves the tab's url.
    pub(crate) fn install_session_handlers(self: &Arc<Self>) {
        let Some(session_id) = self.session_id.lock().clone() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let handler: Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync> =
            Arc::new(move |params| {
                let weak = weak.clone();
                Box::pin(async move {
                    let Some(tab) = weak.upgrade() else { return };
                    tab.doc_node.lock().take();
                    let frame = &params["frame"];
                    if frame["parentId"].is_null() {
                        if let Some(url) = frame["url"].as_str() {
                            *tab.url.lock() = url.to_string();
                        }
                        if let Some(frame_id) = frame["id"].as_str() {
                            *tab.frame_id.lock() = Some(frame_id.to_string());
                        }
                    }
                })
            });
        let _ = self.mux.on(&session_id, "Page.frameNavigated", handler);
    }

    /// The domains every fresh session gets, fired off the dispatch path.
    pub(crate) fn spawn_enable_default_domains(self: &Arc<Self>) {
        let tab = Arc::clone(self);
        tokio::spawn(async move {
            for method in ["Page.enable", "DOM.enable", "Runtime.enable", "Log.enable"] {
                if let Err(err) = tab.call(method, Value::Null).await {
                    debug!(target: "pipecdp::tab", method, %err, "domain enable failed");
                    break;
                }
            }
        });
    }

    pub(crate) fn session_matches(&self, session_id: &str) -> bool {
        self.session_id
            .lock()
            .as_deref()
            .is_some_and(|sid| sid == session_id)
    }

    pub(crate) fn mark_detached(&self) {
        self.detached.store(true, Ordering::SeqCst);
        self.session_id.lock().take();
    }

    pub(crate) fn take_session(&self) -> Option<String> {
        self.session_id.lock().take()
    }

    pub(crate) fn set_url(&self, url: String) {
        if !url.is_empty() {
            *self.url.lock() = url;
        }
    }

    pub(crate) fn is_attached(&self) -> bool {
        !self.detached.load(Ordering::SeqCst)
    }

    pub(crate) fn target_id(&self) -> &str {
        &self.target_id
    }

    fn session(&self) -> Result<String> {
        if self.detached.load(Ordering::SeqCst) {
            return Err(Error::DetachedTab);
        }
        self.session_id.lock().clone().ok_or(Error::DetachedTab)
    }

    pub(crate) async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let session = self.session()?;
        self.mux
            .call(&session, method, params, self.command_timeout)
            .await
    }

    /// Document root node id, fetched once per attachment and dropped on
    /// every frame navigation.
    pub(crate) async fn doc_root(&self) -> Result<i64> {
        if let Some(node) = *self.doc_node.lock() {
            return Ok(node);
        }
        let result = self.call("DOM.getDocument", Value::Null).await?;
        let node = result["root"]["nodeId"]
            .as_i64()
            .ok_or_else(|| Error::protocol(0, "getDocument returned no root node", None))?;
        *self.doc_node.lock() = Some(node);
        Ok(node)
    }
}

impl Tab {
    pub(crate) fn from_inner(inner: Arc<TabInner>) -> Self {
        Self { inner }
    }

    pub fn target_id(&self) -> String {
        self.inner.target_id.clone()
    }

    pub fn url(&self) -> String {
        self.inner.url.lock().clone()
    }

    /// Root frame id, once a navigation has reported one.
    pub fn frame_id(&self) -> Option<String> {
        self.inner.frame_id.lock().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.inner.is_attached()
    }

    /// Issue a command on this tab's session and await the result.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value> {
        self.inner.call(method, params).await
    }

    /// Issue `Page.navigate`. Returns as soon as navigation is accepted;
    /// callers that need the load wait on `Page.loadEventFired`.
    pub async fn navigate(&self, url: &str) -> Result<()> {
        let result = self.send("Page.navigate", json!({"url": url})).await?;
        if let Some(frame_id) = result["frameId"].as_str() {
            *self.inner.frame_id.lock() = Some(frame_id.to_string());
        }
        self.inner.set_url(url.to_string());
        Ok(())
    }

    /// Evaluate a JS expression in the page. A thrown exception surfaces as
    /// [`Error::Protocol`]; otherwise the `RemoteObject` result is
    /// returned.
    pub async fn eval(&self, expression: &str, return_by_value: bool) -> Result<Value> {
        let result = self
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": return_by_value,
                    "awaitPromise": true,
                }),
            )
            .await?;
        throw_exception_details(&result)?;
        Ok(result["result"].clone())
    }

    /// First element matching a CSS selector, if any.
    pub async fn find_elem(&self, selector: &str) -> Result<Option<Elem>> {
        let root = self.inner.doc_root().await?;
        let result = self
            .send(
                "DOM.querySelector",
                json!({"nodeId": root, "selector": selector}),
            )
            .await?;
        let node_id = result["nodeId"].as_i64().unwrap_or(0);
        // Node id zero is the protocol's "no match".
        Ok((node_id != 0).then(|| Elem::new(Arc::downgrade(&self.inner), node_id, None)))
    }

    /// Every element matching a CSS selector.
    pub async fn find_elems(&self, selector: &str) -> Result<Vec<Elem>> {
        let root = self.inner.doc_root().await?;
        let result = self
            .send(
                "DOM.querySelectorAll",
                json!({"nodeId": root, "selector": selector}),
            )
            .await?;
        let ids = result["nodeIds"].as_array().cloned().unwrap_or_default();
        Ok(ids
            .iter()
            .filter_map(Value::as_i64)
            .filter(|id| *id != 0)
            .map(|id| Elem::new(Arc::downgrade(&self.inner), id, None))
            .collect())
    }

    /// Poll for a selector match with exponential backoff until `deadline`.
    pub async fn wait_for_elem(&self, selector: &str, deadline: Duration) -> Result<Elem> {
        let mut found = self.wait_for_elems_min(selector, deadline, 1).await?;
        Ok(found.remove(0))
    }

    /// Poll until at least `min_count` elements match the selector.
    pub async fn wait_for_elems(
        &self,
        selector: &str,
        deadline: Duration,
        min_count: usize,
    ) -> Result<Vec<Elem>> {
        self.wait_for_elems_min(selector, deadline, min_count.max(1))
            .await
    }

    async fn wait_for_elems_min(
        &self,
        selector: &str,
        deadline: Duration,
        min_count: usize,
    ) -> Result<Vec<Elem>> {
        let end = Instant::now() + deadline;
        let mut backoff = POLL_FLOOR;
        loop {
            let found = self.find_elems(selector).await?;
            if found.len() >= min_count {
                return Ok(found);
            }
            let now = Instant::now();
            if now >= end {
                return Err(Error::Timeout(deadline));
            }
            let nap = backoff.min(end - now);
            tokio::time::sleep(nap).await;
            backoff = (backoff * 2).min(POLL_CEILING);
        }
    }

    /// Wait for an event on this tab's session.
    pub async fn wait_for_event(&self, method: &str, deadline: Duration) -> Result<Value> {
        let session = self.inner.session()?;
        self.inner
            .mux
            .wait_for_event(&session, method, None, deadline)
            .await
    }

    /// Wait for an event whose params satisfy `predicate`.
    pub async fn wait_for_event_matching<P>(
        &self,
        method: &str,
        predicate: P,
        deadline: Duration,
    ) -> Result<Value>
    where
        P: Fn(&Value) -> bool + Send + 'static,
    {
        let session = self.inner.session()?;
        let predicate: Predicate = Box::new(predicate);
        self.inner
            .mux
            .wait_for_event(&session, method, Some(predicate), deadline)
            .await
    }

    /// Register a persistent handler for events on this tab's session.
    pub fn on<F, Fut>(&self, method: &str, handler: F) -> Result<HandlerId>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let session = self.inner.session()?;
        let handler: Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync> =
            Arc::new(move |params| Box::pin(handler(params)));
        self.inner.mux.on(&session, method, handler)
    }

    /// Remove a handler registered with [`on`](Tab::on).
    pub fn off(&self, handler: HandlerId) -> bool {
        match self.inner.session() {
            Ok(session) => self.inner.mux.off(&session, handler),
            Err(_) => false,
        }
    }

    /// Ask the browser to close this target. Tolerates a target that is
    /// already gone.
    pub async fn close(&self) {
        let result = self
            .inner
            .mux
            .call(
                crate::mux::BROWSER_SESSION,
                "Target.closeTarget",
                json!({"targetId": self.inner.target_id}),
                self.inner.command_timeout,
            )
            .await;
        if let Err(err) = result {
            debug!(
                target: "pipecdp::tab",
                target_id = %self.inner.target_id,
                %err,
                "closeTarget not acknowledged"
            );
        }
    }
}

/// Map `exceptionDetails` in a `Runtime` result to a protocol error.
pub(crate) fn throw_exception_details(result: &Value) -> Result<()> {
    let details = &result["exceptionDetails"];
    if details.is_null() {
        return Ok(());
    }
    let message = details["exception"]["description"]
        .as_str()
        .or_else(|| details["text"].as_str())
        .unwrap_or("JavaScript exception")
        .to_string();
    Err(Error::Protocol {
        code: details["exceptionId"].as_i64().unwrap_or(0),
        message,
        data: Some(details.clone()),
    })
}
