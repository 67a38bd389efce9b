//! In-memory CDP endpoint used by the module tests.
//!
//! [`FakeChrome`] terminates the driver's pipe pair inside the process:
//! commands written by the driver surface on a queue (or are answered by a
//! scripted responder), and tests push response/event frames back. The
//! `Internal.barrier` round trip gives tests an ordering fence: any frame
//! emitted before the barrier response has been dispatched once the barrier
//! call returns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::mux::{Multiplexer, BROWSER_SESSION};
use crate::protocol::FRAME_DELIMITER;
use crate::transport::{BoxedRead, BoxedWrite};

/// Sentinel understood by the writer task: stop writing and drop the pipe,
/// as a real browser does after `Browser.close`.
const CLOSE_SENTINEL: &str = "__fake_chrome_close";

pub(crate) type Responder = Box<dyn FnMut(&Value) -> Vec<Value> + Send>;

pub(crate) struct FakeChrome {
    outgoing: mpsc::UnboundedSender<Value>,
    commands: tokio::sync::Mutex<mpsc::UnboundedReceiver<Value>>,
    responder: Arc<Mutex<Option<Responder>>>,
    shutdown: CancellationToken,
}

impl FakeChrome {
    /// Spin up the endpoint. Returns the handle plus the stream halves to
    /// hand to [`Transport::spawn`](crate::transport::Transport::spawn).
    pub fn start() -> (Self, BoxedRead, BoxedWrite) {
        let (driver_side, chrome_side) = duplex(1 << 20);
        let (driver_read, driver_write) = tokio::io::split(driver_side);
        let (mut chrome_read, mut chrome_write) = tokio::io::split(chrome_side);

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Value>();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel::<Value>();
        let responder: Arc<Mutex<Option<Responder>>> = Arc::new(Mutex::new(None));
        let shutdown = CancellationToken::new();

        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    frame = outgoing_rx.recv() => frame,
                    _ = writer_shutdown.cancelled() => None,
                };
                let Some(frame) = frame else { break };
                if frame.as_str() == Some(CLOSE_SENTINEL) {
                    break;
                }
                let mut bytes = serde_json::to_vec(&frame).expect("encodable frame");
                bytes.push(FRAME_DELIMITER);
                if chrome_write.write_all(&bytes).await.is_err() {
                    break;
                }
            }
            // Dropping the write half delivers EOF to the driver's reader.
        });

        let reader_responder = Arc::clone(&responder);
        let reader_outgoing = outgoing_tx.clone();
        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut buf: Vec<u8> = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let read = tokio::select! {
                    read = chrome_read.read(&mut chunk) => read,
                    _ = reader_shutdown.cancelled() => break,
                };
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&chunk[..n]);
                while let Some(pos) = buf.iter().position(|b| *b == FRAME_DELIMITER) {
                    let frame: Vec<u8> = buf.drain(..=pos).collect();
                    let frame = &frame[..frame.len() - 1];
                    if frame.is_empty() {
                        continue;
                    }
                    let cmd: Value =
                        serde_json::from_slice(frame).expect("driver sent invalid JSON");
                    if cmd["method"] == "Internal.barrier" {
                        let _ = reader_outgoing.send(json!({"id": cmd["id"], "result": {}}));
                        continue;
                    }
                    let scripted = {
                        let mut guard = reader_responder.lock();
                        guard.as_mut().map(|responder| responder(&cmd))
                    };
                    match scripted {
                        Some(frames) => {
                            for frame in frames {
                                let _ = reader_outgoing.send(frame);
                            }
                        }
                        None => {
                            let _ = commands_tx.send(cmd);
                        }
                    }
                }
            }
        });

        (
            Self {
                outgoing: outgoing_tx,
                commands: tokio::sync::Mutex::new(commands_rx),
                responder,
                shutdown,
            },
            Box::new(driver_read),
            Box::new(driver_write),
        )
    }

    /// Next unscripted command written by the driver.
    pub async fn next_command(&self) -> Value {
        self.commands
            .lock()
            .await
            .recv()
            .await
            .expect("driver hung up")
    }

    pub fn respond_ok(&self, id: u64, result: Value) {
        let _ = self.outgoing.send(json!({"id": id, "result": result}));
    }

    pub fn respond_error(&self, id: u64, code: i64, message: &str) {
        let _ = self
            .outgoing
            .send(json!({"id": id, "error": {"code": code, "message": message}}));
    }

    pub fn emit_event(&self, method: &str, params: Value, session_id: Option<&str>) {
        let mut frame = json!({"method": method, "params": params});
        if let Some(sid) = session_id {
            frame["sessionId"] = Value::String(sid.to_string());
        }
        let _ = self.outgoing.send(frame);
    }

    pub fn set_responder(&self, responder: Responder) {
        *self.responder.lock() = Some(responder);
    }

    /// Drop both pipe halves, as a crashed browser would.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Ordering fence: completes only after every frame emitted before it
    /// was read off the pipe and dispatched.
    pub async fn barrier(&self, mux: &Multiplexer) {
        mux.call(
            BROWSER_SESSION,
            "Internal.barrier",
            Value::Null,
            Duration::from_secs(5),
        )
        .await
        .expect("barrier round trip");
    }
}

/// Knobs for the scripted browser emulation.
#[derive(Default)]
pub(crate) struct ScriptState {
    next_target: u32,
    targets: Vec<String>,
    discovered: bool,
    auto_attach: bool,
    query_results: HashMap<String, Vec<i64>>,
    eval_results: HashMap<String, Value>,
    function_results: Vec<(String, Value)>,
    attributes: HashMap<i64, Vec<String>>,
    describe_results: HashMap<i64, Value>,
    request_node_results: HashMap<String, i64>,
    fail_next: HashMap<String, (i64, String)>,
    commands: Vec<Value>,
}

#[derive(Clone)]
pub(crate) struct ScriptHandle {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptHandle {
    pub fn set_query_result(&self, selector: &str, node_ids: Vec<i64>) {
        self.state
            .lock()
            .query_results
            .insert(selector.to_string(), node_ids);
    }

    pub fn set_eval_result(&self, expression: &str, payload: Value) {
        self.state
            .lock()
            .eval_results
            .insert(expression.to_string(), payload);
    }

    /// Result payload for `Runtime.callFunctionOn` whose declaration
    /// contains `needle`.
    pub fn set_function_result(&self, needle: &str, payload: Value) {
        self.state
            .lock()
            .function_results
            .push((needle.to_string(), payload));
    }

    pub fn set_attributes(&self, node_id: i64, pairs: &[&str]) {
        self.state.lock().attributes.insert(
            node_id,
            pairs.iter().map(|s| s.to_string()).collect(),
        );
    }

    pub fn set_describe_result(&self, node_id: i64, node: Value) {
        self.state.lock().describe_results.insert(node_id, node);
    }

    pub fn set_request_node_result(&self, object_id: &str, node_id: i64) {
        self.state
            .lock()
            .request_node_results
            .insert(object_id.to_string(), node_id);
    }

    /// Make the next command with this method fail with a CDP error.
    pub fn fail_next(&self, method: &str, code: i64, message: &str) {
        self.state
            .lock()
            .fail_next
            .insert(method.to_string(), (code, message.to_string()));
    }

    /// Every non-barrier command seen so far, in arrival order.
    pub fn commands(&self) -> Vec<Value> {
        self.state.lock().commands.clone()
    }

    pub fn commands_named(&self, method: &str) -> Vec<Value> {
        self.commands()
            .into_iter()
            .filter(|cmd| cmd["method"] == method)
            .collect()
    }
}

fn target_created(target_id: &str, url: &str) -> Value {
    json!({
        "method": "Target.targetCreated",
        "params": {"targetInfo": {
            "targetId": target_id,
            "type": "page",
            "title": "",
            "url": url,
            "attached": false,
        }}
    })
}

fn attached_to_target(target_id: &str, url: &str) -> Value {
    json!({
        "method": "Target.attachedToTarget",
        "params": {
            "sessionId": format!("S-{target_id}"),
            "targetInfo": {
                "targetId": target_id,
                "type": "page",
                "title": "",
                "url": url,
                "attached": true,
            },
            "waitingForDebugger": false,
        }
    })
}

/// A [`FakeChrome`] with a responder that emulates just enough of a real
/// browser for the Browser/Tab/Elem tests: target discovery and flat
/// auto-attach, target create/close, navigation, and canned DOM/input
/// answers driven by [`ScriptHandle`].
pub(crate) fn scripted_browser() -> (FakeChrome, BoxedRead, BoxedWrite, ScriptHandle) {
    let (chrome, reader, writer) = FakeChrome::start();
    let state = Arc::new(Mutex::new(ScriptState::default()));
    let handle = ScriptHandle {
        state: Arc::clone(&state),
    };

    chrome.set_responder(Box::new(move |cmd: &Value| {
        let mut state = state.lock();
        state.commands.push(cmd.clone());

        let id = cmd["id"].as_u64().expect("command id");
        let method = cmd["method"].as_str().expect("command method");
        let params = &cmd["params"];
        let session = cmd["sessionId"].as_str();
        let reply = |result: Value| json!({"id": id, "result": result});

        if let Some((code, message)) = state.fail_next.remove(method) {
            return vec![json!({"id": id, "error": {"code": code, "message": message}})];
        }

        match method {
            "Browser.getVersion" => vec![reply(json!({
                "protocolVersion": "1.3",
                "product": "HeadlessChrome/126.0.0.0",
            }))],
            "Target.setDiscoverTargets" => {
                let mut frames = vec![reply(json!({}))];
                if !state.discovered {
                    state.discovered = true;
                    state.next_target += 1;
                    let tid = format!("T{}", state.next_target);
                    state.targets.push(tid.clone());
                    frames.push(target_created(&tid, "about:blank"));
                }
                frames
            }
            "Target.setAutoAttach" => {
                let mut frames = vec![reply(json!({}))];
                if !state.auto_attach {
                    state.auto_attach = true;
                    for tid in state.targets.clone() {
                        frames.push(attached_to_target(&tid, "about:blank"));
                    }
                }
                frames
            }
            "Target.createTarget" => {
                state.next_target += 1;
                let tid = format!("T{}", state.next_target);
                let url = params["url"].as_str().unwrap_or("about:blank").to_string();
                state.targets.push(tid.clone());
                vec![
                    reply(json!({"targetId": tid})),
                    target_created(&tid, &url),
                    attached_to_target(&tid, &url),
                ]
            }
            "Target.closeTarget" => {
                let tid = params["targetId"].as_str().unwrap_or_default().to_string();
                state.targets.retain(|t| *t != tid);
                vec![
                    reply(json!({"success": true})),
                    json!({
                        "method": "Target.detachedFromTarget",
                        "params": {"sessionId": format!("S-{tid}"), "targetId": tid},
                    }),
                    json!({
                        "method": "Target.targetDestroyed",
                        "params": {"targetId": tid},
                    }),
                ]
            }
            "Browser.close" => vec![reply(json!({})), Value::String(CLOSE_SENTINEL.into())],
            "Page.enable" | "DOM.enable" | "Runtime.enable" | "Log.enable" => {
                vec![reply(json!({}))]
            }
            "Page.navigate" => {
                let url = params["url"].as_str().unwrap_or_default();
                let tid = session
                    .and_then(|s| s.strip_prefix("S-"))
                    .unwrap_or("T?")
                    .to_string();
                let mut navigated = json!({
                    "method": "Page.frameNavigated",
                    "params": {"frame": {"id": format!("F-{tid}"), "url": url}},
                });
                navigated["sessionId"] = Value::String(session.unwrap_or_default().to_string());
                vec![
                    reply(json!({"frameId": format!("F-{tid}"), "loaderId": "L1"})),
                    navigated,
                ]
            }
            "DOM.getDocument" => vec![reply(json!({
                "root": {"nodeId": 1, "backendNodeId": 1001, "nodeName": "#document"}
            }))],
            "DOM.querySelector" => {
                let selector = params["selector"].as_str().unwrap_or_default();
                let node = state
                    .query_results
                    .get(selector)
                    .and_then(|ids| ids.first().copied())
                    .unwrap_or(0);
                vec![reply(json!({"nodeId": node}))]
            }
            "DOM.querySelectorAll" => {
                let selector = params["selector"].as_str().unwrap_or_default();
                let ids = state.query_results.get(selector).cloned().unwrap_or_default();
                vec![reply(json!({"nodeIds": ids}))]
            }
            "Runtime.evaluate" => {
                let expression = params["expression"].as_str().unwrap_or_default();
                let payload = state
                    .eval_results
                    .get(expression)
                    .cloned()
                    .unwrap_or_else(|| json!({"result": {"type": "undefined"}}));
                vec![reply(payload)]
            }
            "Runtime.callFunctionOn" => {
                let declaration = params["functionDeclaration"].as_str().unwrap_or_default();
                let payload = state
                    .function_results
                    .iter()
                    .find(|(needle, _)| declaration.contains(needle))
                    .map(|(_, payload)| payload.clone())
                    .unwrap_or_else(|| json!({"result": {"type": "undefined"}}));
                vec![reply(payload)]
            }
            "DOM.getBoxModel" => vec![reply(json!({
                "model": {
                    "content": [10.0, 10.0, 110.0, 10.0, 110.0, 60.0, 10.0, 60.0],
                    "width": 100,
                    "height": 50,
                }
            }))],
            "DOM.getAttributes" => {
                let node = params["nodeId"].as_i64().unwrap_or_default();
                let attrs = state.attributes.get(&node).cloned().unwrap_or_default();
                vec![reply(json!({"attributes": attrs}))]
            }
            "DOM.resolveNode" => {
                let node = params["nodeId"].as_i64().unwrap_or_default();
                vec![reply(json!({
                    "object": {"type": "object", "objectId": format!("obj-{node}")}
                }))]
            }
            "DOM.describeNode" => {
                let node = params["nodeId"].as_i64().unwrap_or_default();
                let description = state.describe_results.get(&node).cloned().unwrap_or_else(
                    || json!({"nodeId": node, "backendNodeId": node + 1000, "children": []}),
                );
                vec![reply(json!({"node": description}))]
            }
            "DOM.requestNode" => {
                let object_id = params["objectId"].as_str().unwrap_or_default();
                let node = state.request_node_results.get(object_id).copied().unwrap_or(0);
                vec![reply(json!({"nodeId": node}))]
            }
            "DOM.scrollIntoViewIfNeeded" | "DOM.focus" | "Input.dispatchMouseEvent"
            | "Input.dispatchKeyEvent" | "Input.insertText" => vec![reply(json!({}))],
            other => vec![json!({
                "id": id,
                "error": {"code": -32601, "message": format!("'{other}' wasn't found")},
            })],
        }
    }));

    (chrome, reader, writer, handle)
}
