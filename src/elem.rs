//! Elem: a remote DOM node handle scoped to a tab's session.

use std::sync::{Arc, Weak};

use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Error, Result};
use crate::tab::{throw_exception_details, Tab, TabInner};

/// A DOM node on a page, addressed by its CDP node id.
///
/// Holds a non-owning reference to its tab: once the tab detaches, every
/// operation fails with [`Error::DetachedTab`]. A node that no longer
/// exists on the page surfaces the browser's own protocol error unchanged.
#[derive(Clone, Debug)]
pub struct Elem {
    tab: Weak<TabInner>,
    node_id: i64,
    backend_node_id: Option<i64>,
}

impl Elem {
    pub(crate) fn new(tab: Weak<TabInner>, node_id: i64, backend_node_id: Option<i64>) -> Self {
        Self {
            tab,
            node_id,
            backend_node_id,
        }
    }

    pub fn node_id(&self) -> i64 {
        self.node_id
    }

    pub fn backend_node_id(&self) -> Option<i64> {
        self.backend_node_id
    }

    /// The owning tab, provided it is still attached.
    fn tab(&self) -> Result<Arc<TabInner>> {
        let tab = self.tab.upgrade().ok_or(Error::DetachedTab)?;
        if !tab.is_attached() {
            return Err(Error::DetachedTab);
        }
        Ok(tab)
    }

    /// Click the geometric center of the node's content box.
    ///
    /// When the click navigated the originating frame away (the node is
    /// gone with it), the root [`Tab`] is returned so the caller can keep
    /// working against the new document.
    pub async fn click(&self) -> Result<Option<Tab>> {
        let tab = self.tab()?;

        let (x, y) = self.center_point(&tab).await?;
        for kind in ["mousePressed", "mouseReleased"] {
            tab.call(
                "Input.dispatchMouseEvent",
                json!({
                    "type": kind,
                    "x": x,
                    "y": y,
                    "button": "left",
                    "clickCount": 1,
                }),
            )
            .await?;
        }

        // Probe whether the node survived the click; a protocol error here
        // means its frame was torn down by a navigation.
        match tab
            .call("DOM.describeNode", json!({"nodeId": self.node_id}))
            .await
        {
            Ok(_) => Ok(None),
            Err(Error::Protocol { .. }) => Ok(Some(Tab::from_inner(tab))),
            Err(err) => Err(err),
        }
    }

    async fn center_point(&self, tab: &Arc<TabInner>) -> Result<(f64, f64)> {
        let result = tab
            .call("DOM.getBoxModel", json!({"nodeId": self.node_id}))
            .await?;
        let model = &result["model"];
        let quad = if model["content"].is_array() {
            &model["content"]
        } else {
            &model["border"]
        };
        let corner = |idx: usize| quad[idx].as_f64().unwrap_or_default();
        let x = (corner(0) + corner(2) + corner(4) + corner(6)) / 4.0;
        let y = (corner(1) + corner(3) + corner(5) + corner(7)) / 4.0;
        Ok((x, y))
    }

    /// Type text into the node, one key event pair per code point, with a
    /// char payload for printable characters. Order is preserved.
    pub async fn type_text(&self, text: &str) -> Result<()> {
        let tab = self.tab()?;
        tab.call("DOM.focus", json!({"nodeId": self.node_id})).await?;
        for ch in text.chars() {
            let key = ch.to_string();
            let mut down = json!({"type": "keyDown", "key": key});
            if !ch.is_control() {
                down["text"] = Value::String(key.clone());
                down["unmodifiedText"] = Value::String(key.clone());
            }
            tab.call("Input.dispatchKeyEvent", down).await?;
            tab.call("Input.dispatchKeyEvent", json!({"type": "keyUp", "key": key}))
                .await?;
        }
        Ok(())
    }

    /// The node's rendered text (`innerText`).
    pub async fn text(&self) -> Result<String> {
        let tab = self.tab()?;
        let object_id = self.resolve_object(&tab).await?;
        let result = call_function_on(
            &tab,
            &object_id,
            "function() { return this.innerText || ''; }",
            Vec::new(),
            true,
        )
        .await?;
        Ok(result["result"]["value"].as_str().unwrap_or_default().to_string())
    }

    /// An attribute value, or `None` when the attribute is absent.
    pub async fn get_attr(&self, name: &str) -> Result<Option<String>> {
        let tab = self.tab()?;
        let result = tab
            .call("DOM.getAttributes", json!({"nodeId": self.node_id}))
            .await?;
        let attrs = result["attributes"].as_array().cloned().unwrap_or_default();
        // Interleaved name/value pairs.
        Ok(attrs
            .chunks_exact(2)
            .find(|pair| pair[0].as_str() == Some(name))
            .and_then(|pair| pair[1].as_str().map(str::to_string)))
    }

    /// The node's outer HTML.
    pub async fn html(&self) -> Result<String> {
        let tab = self.tab()?;
        let result = tab
            .call("DOM.getOuterHTML", json!({"nodeId": self.node_id}))
            .await?;
        Ok(result["outerHTML"].as_str().unwrap_or_default().to_string())
    }

    pub async fn scroll_into_view(&self) -> Result<()> {
        let tab = self.tab()?;
        tab.call("DOM.scrollIntoViewIfNeeded", json!({"nodeId": self.node_id}))
            .await?;
        Ok(())
    }

    pub async fn focus(&self) -> Result<()> {
        let tab = self.tab()?;
        tab.call("DOM.focus", json!({"nodeId": self.node_id})).await?;
        Ok(())
    }

    /// Assign the node's `value` property and fire an `input` event.
    /// Falls back to key events when the node cannot be resolved to a
    /// remote object.
    pub async fn set_value(&self, value: &str) -> Result<()> {
        let tab = self.tab()?;
        match self.resolve_object(&tab).await {
            Ok(object_id) => {
                call_function_on(
                    &tab,
                    &object_id,
                    "function(v) { this.value = v; this.dispatchEvent(new Event('input', {bubbles: true})); }",
                    vec![json!({"value": value})],
                    false,
                )
                .await?;
                Ok(())
            }
            Err(err) => {
                debug!(target: "pipecdp::elem", node_id = self.node_id, %err, "falling back to key events");
                self.type_text(value).await
            }
        }
    }

    /// Parent element, or `None` at the document root.
    pub async fn parent(&self) -> Result<Option<Elem>> {
        let tab = self.tab()?;
        let object_id = self.resolve_object(&tab).await?;
        let result = call_function_on(
            &tab,
            &object_id,
            "function() { return this.parentElement; }",
            Vec::new(),
            false,
        )
        .await?;
        let Some(parent_object) = result["result"]["objectId"].as_str() else {
            return Ok(None);
        };
        let result = tab
            .call("DOM.requestNode", json!({"objectId": parent_object}))
            .await?;
        let node_id = result["nodeId"].as_i64().unwrap_or(0);
        Ok((node_id != 0).then(|| Elem::new(self.tab.clone(), node_id, None)))
    }

    /// Child nodes, via `DOM.describeNode`.
    pub async fn children(&self) -> Result<Vec<Elem>> {
        let tab = self.tab()?;
        let result = tab
            .call(
                "DOM.describeNode",
                json!({"nodeId": self.node_id, "depth": 1}),
            )
            .await?;
        let children = result["node"]["children"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        Ok(children
            .iter()
            .filter_map(|child| {
                let node_id = child["nodeId"].as_i64().filter(|id| *id != 0)?;
                Some(Elem::new(
                    self.tab.clone(),
                    node_id,
                    child["backendNodeId"].as_i64(),
                ))
            })
            .collect())
    }

    async fn resolve_object(&self, tab: &Arc<TabInner>) -> Result<String> {
        let result = tab
            .call("DOM.resolveNode", json!({"nodeId": self.node_id}))
            .await?;
        result["object"]["objectId"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                Error::protocol(0, format!("node {} has no remote object", self.node_id), None)
            })
    }
}

async fn call_function_on(
    tab: &Arc<TabInner>,
    object_id: &str,
    declaration: &str,
    arguments: Vec<Value>,
    return_by_value: bool,
) -> Result<Value> {
    let result = tab
        .call(
            "Runtime.callFunctionOn",
            json!({
                "objectId": object_id,
                "functionDeclaration": declaration,
                "arguments": arguments,
                "returnByValue": return_by_value,
                "awaitPromise": true,
            }),
        )
        .await?;
    throw_exception_details(&result)?;
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::tests::{settle, start_scripted};
    use crate::browser::Browser;
    use crate::test_support::{FakeChrome, ScriptHandle};

    async fn elem_fixture() -> (Browser, FakeChrome, ScriptHandle, Elem) {
        let (browser, chrome, script) = start_scripted().await;
        script.set_query_result("button", vec![42]);
        let tab = browser.first_tab().unwrap();
        let elem = tab.find_elem("button").await.unwrap().unwrap();
        (browser, chrome, script, elem)
    }

    #[tokio::test]
    async fn click_presses_and_releases_at_the_box_center() {
        let (_browser, _chrome, script, elem) = elem_fixture().await;
        let navigated = elem.click().await.unwrap();
        assert!(navigated.is_none());

        let clicks = script.commands_named("Input.dispatchMouseEvent");
        assert_eq!(clicks.len(), 2);
        assert_eq!(clicks[0]["params"]["type"], "mousePressed");
        assert_eq!(clicks[1]["params"]["type"], "mouseReleased");
        for click in &clicks {
            // Center of the scripted content quad.
            assert_eq!(click["params"]["x"], 60.0);
            assert_eq!(click["params"]["y"], 35.0);
            assert_eq!(click["params"]["button"], "left");
            assert_eq!(click["params"]["clickCount"], 1);
        }
    }

    #[tokio::test]
    async fn type_text_preserves_order_with_down_up_pairs() {
        let (_browser, _chrome, script, elem) = elem_fixture().await;
        elem.type_text("ab").await.unwrap();

        let keys = script.commands_named("Input.dispatchKeyEvent");
        let shape: Vec<(String, Option<String>)> = keys
            .iter()
            .map(|cmd| {
                (
                    cmd["params"]["type"].as_str().unwrap().to_string(),
                    cmd["params"]["text"].as_str().map(str::to_string),
                )
            })
            .collect();
        assert_eq!(
            shape,
            vec![
                ("keyDown".to_string(), Some("a".to_string())),
                ("keyUp".to_string(), None),
                ("keyDown".to_string(), Some("b".to_string())),
                ("keyUp".to_string(), None),
            ]
        );
    }

    #[tokio::test]
    async fn text_reads_inner_text_through_the_remote_object() {
        let (_browser, _chrome, script, elem) = elem_fixture().await;
        script.set_function_result(
            "innerText",
            json!({"result": {"type": "string", "value": "Hello"}}),
        );
        assert_eq!(elem.text().await.unwrap(), "Hello");
    }

    #[tokio::test]
    async fn get_attr_walks_the_interleaved_pairs() {
        let (_browser, _chrome, script, elem) = elem_fixture().await;
        script.set_attributes(42, &["href", "/x", "id", "main"]);

        assert_eq!(elem.get_attr("href").await.unwrap().as_deref(), Some("/x"));
        assert_eq!(elem.get_attr("id").await.unwrap().as_deref(), Some("main"));
        assert_eq!(elem.get_attr("class").await.unwrap(), None);
    }

    #[tokio::test]
    async fn parent_resolves_through_request_node() {
        let (_browser, _chrome, script, elem) = elem_fixture().await;
        script.set_function_result(
            "parentElement",
            json!({"result": {"type": "object", "objectId": "obj-parent"}}),
        );
        script.set_request_node_result("obj-parent", 7);

        let parent = elem.parent().await.unwrap().expect("parent");
        assert_eq!(parent.node_id(), 7);
    }

    #[tokio::test]
    async fn parent_of_root_is_none() {
        let (_browser, _chrome, script, elem) = elem_fixture().await;
        script.set_function_result(
            "parentElement",
            json!({"result": {"type": "object", "subtype": "null"}}),
        );
        assert!(elem.parent().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn children_come_from_describe_node() {
        let (_browser, _chrome, script, elem) = elem_fixture().await;
        script.set_describe_result(
            42,
            json!({
                "nodeId": 42,
                "backendNodeId": 1042,
                "children": [
                    {"nodeId": 43, "backendNodeId": 1043},
                    {"nodeId": 44, "backendNodeId": 1044},
                ],
            }),
        );

        let children = elem.children().await.unwrap();
        let ids: Vec<i64> = children.iter().map(Elem::node_id).collect();
        assert_eq!(ids, vec![43, 44]);
        assert_eq!(children[0].backend_node_id(), Some(1043));
    }

    #[tokio::test]
    async fn stale_node_surfaces_the_protocol_error_unchanged() {
        let (_browser, _chrome, script, elem) = elem_fixture().await;
        script.fail_next("DOM.getBoxModel", -32000, "Could not find node with given id");

        match elem.click().await {
            Err(crate::Error::Protocol { code, message, .. }) => {
                assert_eq!(code, -32000);
                assert!(message.contains("Could not find node"));
            }
            Err(other) => panic!("expected protocol error, got {other:?}"),
            Ok(_) => panic!("expected protocol error, got success"),
        }
    }

    #[tokio::test]
    async fn operations_on_a_detached_tab_fail_fast() {
        let (browser, chrome, script, _elem) = elem_fixture().await;
        let tab = browser.create_tab("about:blank").await.unwrap();
        script.set_query_result("input", vec![50]);
        let field = tab.find_elem("input").await.unwrap().unwrap();

        tab.close().await;
        settle(&browser, &chrome).await;

        assert!(matches!(field.click().await, Err(crate::Error::DetachedTab)));
        assert!(matches!(
            field.type_text("x").await,
            Err(crate::Error::DetachedTab)
        ));
        assert!(matches!(field.text().await, Err(crate::Error::DetachedTab)));
    }

    #[tokio::test]
    async fn click_that_destroys_the_frame_returns_the_root_tab() {
        let (_browser, _chrome, script, elem) = elem_fixture().await;
        // The node's frame is gone after the click, as when a form
        // submission navigated the page.
        script.fail_next("DOM.describeNode", -32000, "Could not find node with given id");

        let root = elem.click().await.unwrap().expect("root tab");
        assert_eq!(root.target_id(), "T1");
        assert!(root.is_attached());
    }
}
