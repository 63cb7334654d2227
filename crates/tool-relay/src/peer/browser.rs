//! The browser-automation surface a provider exposes as tools (spec §6
//! "Peer-facing provider interface").
//!
//! A `BrowserController` implementation does the actual driving of the
//! embedded browser; `register_browser_tools` wires each of its operations
//! into a [`PeerMultiplexer`] as a named tool, following the same
//! name-keyed dispatch the multiplexer already uses for every other
//! handler (no separate executor hierarchy).

use async_trait::async_trait;
use serde_json::Value;

use super::{HandlerValue, PeerMultiplexer};
use crate::error::PeerError;
use crate::protocol::ToolDescriptor;

/// The browser operations a provider may expose (spec §6). Each failure is
/// surfaced to the caller as an `execution` error.
#[async_trait]
pub trait BrowserController: Send + Sync {
    async fn snapshot(&self) -> Result<String, PeerError>;
    async fn click(&self, selector: &str) -> Result<(), PeerError>;
    async fn fill(&self, selector: &str, value: &str) -> Result<(), PeerError>;
    async fn type_text(&self, text: &str) -> Result<(), PeerError>;
    async fn hover(&self, selector: &str) -> Result<(), PeerError>;
    async fn press(&self, key: &str) -> Result<(), PeerError>;
    async fn scroll(&self, direction: &str, amount: Option<f64>) -> Result<(), PeerError>;
    async fn get_text(&self, selector: &str) -> Result<String, PeerError>;
    async fn get_attribute(&self, selector: &str, attr: &str) -> Result<Option<String>, PeerError>;
    async fn is_visible(&self, selector: &str) -> Result<bool, PeerError>;
    async fn get_url(&self) -> Result<String, PeerError>;
    async fn get_title(&self) -> Result<String, PeerError>;
    async fn screenshot(&self) -> Result<String, PeerError>;
    async fn wait(&self, ms: u64) -> Result<(), PeerError>;
    async fn evaluate(&self, script: &str) -> Result<Value, PeerError>;
}

fn param_str<'a>(params: &'a Value, name: &str) -> Result<&'a str, PeerError> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| PeerError::new(crate::error::ErrorKind::InvalidParams, format!("missing param: {name}")))
}

fn param_u64(params: &Value, name: &str) -> Result<u64, PeerError> {
    params
        .get(name)
        .and_then(Value::as_u64)
        .ok_or_else(|| PeerError::new(crate::error::ErrorKind::InvalidParams, format!("missing param: {name}")))
}

fn descriptor(name: &str, description: &str, schema: Value) -> ToolDescriptor {
    ToolDescriptor {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: schema,
        capabilities: Some(vec!["browser".to_string()]),
        metadata: None,
    }
}

/// Register every [`BrowserController`] operation as a tool on `peer`.
pub fn register_browser_tools(peer: &PeerMultiplexer, controller: std::sync::Arc<dyn BrowserController>) {
    macro_rules! register {
        ($name:literal, $description:literal, $schema:expr, $body:expr) => {{
            let controller = std::sync::Arc::clone(&controller);
            peer.register_handler(
                $name,
                Some(descriptor($name, $description, $schema)),
                move |params: Value| {
                    let controller = std::sync::Arc::clone(&controller);
                    async move { ($body)(controller, params).await }
                },
            );
        }};
    }

    register!(
        "snapshot",
        "Capture an accessibility/DOM snapshot of the current page",
        serde_json::json!({"type": "object", "properties": {}}),
        |c: std::sync::Arc<dyn BrowserController>, _p: Value| async move {
            Ok::<_, PeerError>(HandlerValue::Text(c.snapshot().await?))
        }
    );
    register!(
        "click",
        "Click an element matching a selector",
        serde_json::json!({"type": "object", "properties": {"selector": {"type": "string"}}, "required": ["selector"]}),
        |c: std::sync::Arc<dyn BrowserController>, p: Value| async move {
            let selector = param_str(&p, "selector")?;
            c.click(selector).await?;
            Ok::<_, PeerError>(HandlerValue::Json(serde_json::json!({})))
        }
    );
    register!(
        "fill",
        "Fill an input element matching a selector with a value",
        serde_json::json!({"type": "object", "properties": {"selector": {"type": "string"}, "value": {"type": "string"}}, "required": ["selector", "value"]}),
        |c: std::sync::Arc<dyn BrowserController>, p: Value| async move {
            let selector = param_str(&p, "selector")?;
            let value = param_str(&p, "value")?;
            c.fill(selector, value).await?;
            Ok::<_, PeerError>(HandlerValue::Json(serde_json::json!({})))
        }
    );
    register!(
        "type",
        "Type text into the currently focused element",
        serde_json::json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}),
        |c: std::sync::Arc<dyn BrowserController>, p: Value| async move {
            let text = param_str(&p, "text")?;
            c.type_text(text).await?;
            Ok::<_, PeerError>(HandlerValue::Json(serde_json::json!({})))
        }
    );
    register!(
        "hover",
        "Hover an element matching a selector",
        serde_json::json!({"type": "object", "properties": {"selector": {"type": "string"}}, "required": ["selector"]}),
        |c: std::sync::Arc<dyn BrowserController>, p: Value| async move {
            let selector = param_str(&p, "selector")?;
            c.hover(selector).await?;
            Ok::<_, PeerError>(HandlerValue::Json(serde_json::json!({})))
        }
    );
    register!(
        "press",
        "Press a single key",
        serde_json::json!({"type": "object", "properties": {"key": {"type": "string"}}, "required": ["key"]}),
        |c: std::sync::Arc<dyn BrowserController>, p: Value| async move {
            let key = param_str(&p, "key")?;
            c.press(key).await?;
            Ok::<_, PeerError>(HandlerValue::Json(serde_json::json!({})))
        }
    );
    register!(
        "scroll",
        "Scroll the page in a direction, optionally by an amount",
        serde_json::json!({"type": "object", "properties": {"direction": {"type": "string"}, "amount": {"type": "number"}}, "required": ["direction"]}),
        |c: std::sync::Arc<dyn BrowserController>, p: Value| async move {
            let direction = param_str(&p, "direction")?;
            let amount = p.get("amount").and_then(Value::as_f64);
            c.scroll(direction, amount).await?;
            Ok::<_, PeerError>(HandlerValue::Json(serde_json::json!({})))
        }
    );
    register!(
        "getText",
        "Read the text content of an element",
        serde_json::json!({"type": "object", "properties": {"selector": {"type": "string"}}, "required": ["selector"]}),
        |c: std::sync::Arc<dyn BrowserController>, p: Value| async move {
            let selector = param_str(&p, "selector")?;
            Ok::<_, PeerError>(HandlerValue::Text(c.get_text(selector).await?))
        }
    );
    register!(
        "getAttribute",
        "Read an attribute of an element, if present",
        serde_json::json!({"type": "object", "properties": {"selector": {"type": "string"}, "attr": {"type": "string"}}, "required": ["selector", "attr"]}),
        |c: std::sync::Arc<dyn BrowserController>, p: Value| async move {
            let selector = param_str(&p, "selector")?;
            let attr = param_str(&p, "attr")?;
            Ok::<_, PeerError>(HandlerValue::Json(serde_json::json!(c.get_attribute(selector, attr).await?)))
        }
    );
    register!(
        "isVisible",
        "Report whether an element matching a selector is visible",
        serde_json::json!({"type": "object", "properties": {"selector": {"type": "string"}}, "required": ["selector"]}),
        |c: std::sync::Arc<dyn BrowserController>, p: Value| async move {
            let selector = param_str(&p, "selector")?;
            Ok::<_, PeerError>(HandlerValue::Json(serde_json::json!(c.is_visible(selector).await?)))
        }
    );
    register!(
        "getUrl",
        "Read the current page URL",
        serde_json::json!({"type": "object", "properties": {}}),
        |c: std::sync::Arc<dyn BrowserController>, _p: Value| async move {
            Ok::<_, PeerError>(HandlerValue::Text(c.get_url().await?))
        }
    );
    register!(
        "getTitle",
        "Read the current page title",
        serde_json::json!({"type": "object", "properties": {}}),
        |c: std::sync::Arc<dyn BrowserController>, _p: Value| async move {
            Ok::<_, PeerError>(HandlerValue::Text(c.get_title().await?))
        }
    );
    register!(
        "screenshot",
        "Capture a base64-encoded PNG screenshot of the page",
        serde_json::json!({"type": "object", "properties": {}}),
        |c: std::sync::Arc<dyn BrowserController>, _p: Value| async move {
            Ok::<_, PeerError>(HandlerValue::Text(c.screenshot().await?))
        }
    );
    register!(
        "wait",
        "Wait for a duration in milliseconds",
        serde_json::json!({"type": "object", "properties": {"ms": {"type": "integer"}}, "required": ["ms"]}),
        |c: std::sync::Arc<dyn BrowserController>, p: Value| async move {
            let ms = param_u64(&p, "ms")?;
            c.wait(ms).await?;
            Ok::<_, PeerError>(HandlerValue::Json(serde_json::json!({})))
        }
    );
    register!(
        "evaluate",
        "Evaluate a script in the page context",
        serde_json::json!({"type": "object", "properties": {"script": {"type": "string"}}, "required": ["script"]}),
        |c: std::sync::Arc<dyn BrowserController>, p: Value| async move {
            let script = param_str(&p, "script")?;
            Ok::<_, PeerError>(HandlerValue::Json(c.evaluate(script).await?))
        }
    );
}

/// A test double recording calls instead of driving a real browser.
#[derive(Default)]
pub struct StubBrowserController {
    pub url: std::sync::Mutex<String>,
}

#[async_trait]
impl BrowserController for StubBrowserController {
    async fn snapshot(&self) -> Result<String, PeerError> {
        Ok("<html>stub</html>".to_string())
    }

    async fn click(&self, _selector: &str) -> Result<(), PeerError> {
        Ok(())
    }

    async fn fill(&self, _selector: &str, _value: &str) -> Result<(), PeerError> {
        Ok(())
    }

    async fn type_text(&self, _text: &str) -> Result<(), PeerError> {
        Ok(())
    }

    async fn hover(&self, _selector: &str) -> Result<(), PeerError> {
        Ok(())
    }

    async fn press(&self, _key: &str) -> Result<(), PeerError> {
        Ok(())
    }

    async fn scroll(&self, _direction: &str, _amount: Option<f64>) -> Result<(), PeerError> {
        Ok(())
    }

    async fn get_text(&self, _selector: &str) -> Result<String, PeerError> {
        Ok("stub text".to_string())
    }

    async fn get_attribute(&self, _selector: &str, _attr: &str) -> Result<Option<String>, PeerError> {
        Ok(None)
    }

    async fn is_visible(&self, _selector: &str) -> Result<bool, PeerError> {
        Ok(true)
    }

    async fn get_url(&self) -> Result<String, PeerError> {
        Ok(self.url.lock().unwrap().clone())
    }

    async fn get_title(&self) -> Result<String, PeerError> {
        Ok("stub title".to_string())
    }

    async fn screenshot(&self) -> Result<String, PeerError> {
        Ok("data:image/png;base64,AAAA".to_string())
    }

    async fn wait(&self, _ms: u64) -> Result<(), PeerError> {
        Ok(())
    }

    async fn evaluate(&self, _script: &str) -> Result<Value, PeerError> {
        Ok(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::peer::Role;

    #[tokio::test]
    async fn stub_controller_reports_canned_values() {
        let stub = StubBrowserController::default();
        assert!(stub.is_visible("#x").await.unwrap());
        assert_eq!(stub.get_title().await.unwrap(), "stub title");
    }

    #[tokio::test]
    async fn register_browser_tools_populates_catalogue() {
        let peer = PeerMultiplexer::new(PeerConfig::new("http://localhost:8765"), Role::Provider);
        let stub: std::sync::Arc<dyn BrowserController> = std::sync::Arc::new(StubBrowserController::default());
        register_browser_tools(&peer, stub);
        let tools = peer.tool_names();
        assert!(tools.contains(&"click".to_string()));
        assert!(tools.contains(&"getAttribute".to_string()));
        assert_eq!(tools.len(), 15);
    }
}
