//! Minimal Chrome DevTools Protocol client.
//!
//! Just enough of the protocol to drive an already-open tab: page discovery
//! over `/json/list` and `Runtime.evaluate` over the page's own WebSocket.

mod page;

use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::automator::AutomatorError;

pub use page::CdpPage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// DevTools client errors.
#[derive(Debug, Error)]
pub enum CdpError {
    #[error("Browser not available at {0}. Start it with --remote-debugging-port=9222")]
    BrowserNotAvailable(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("CDP error: {message} (code: {code})")]
    Protocol { code: i64, message: String },

    #[error("JavaScript error: {0}")]
    JavaScript(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Session closed")]
    SessionClosed,
}

impl From<tokio_tungstenite::tungstenite::Error> for CdpError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        CdpError::WebSocket(e.to_string())
    }
}

impl From<CdpError> for AutomatorError {
    fn from(e: CdpError) -> Self {
        match e {
            CdpError::WebSocket(_) | CdpError::ConnectionFailed(_) | CdpError::SessionClosed => {
                AutomatorError::Transport(e.to_string())
            }
            other => AutomatorError::Page(other.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
struct CdpRequest<'a> {
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CdpResponse {
    id: Option<u64>,
    result: Option<Value>,
    error: Option<CdpErrorResponse>,
}

#[derive(Debug, Deserialize)]
struct CdpErrorResponse {
    code: i64,
    message: String,
}

/// Target entry from the `/json/list` endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub page_type: String,
    #[serde(default)]
    pub title: String,
    pub url: String,
    pub web_socket_debugger_url: Option<String>,
}

impl PageInfo {
    pub fn is_page(&self) -> bool {
        self.page_type == "page"
    }
}

/// List the browser's targets, most recently focused first.
pub async fn list_targets(http: &reqwest::Client, endpoint: &str) -> Result<Vec<PageInfo>, CdpError> {
    let url = format!("{}/json/list", endpoint.trim_end_matches('/'));
    debug!("Listing targets from {}", url);

    let targets = http
        .get(&url)
        .send()
        .await
        .map_err(|e| CdpError::BrowserNotAvailable(format!("{}: {}", endpoint, e)))?
        .json()
        .await
        .map_err(|e| CdpError::BrowserNotAvailable(format!("{}: {}", endpoint, e)))?;

    Ok(targets)
}

/// WebSocket session with a single page target.
pub struct CdpConnection {
    ws: Mutex<WsStream>,
    next_id: AtomicU64,
}

impl CdpConnection {
    pub async fn connect(ws_url: &str) -> Result<Self, CdpError> {
        let (ws, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| CdpError::ConnectionFailed(format!("{}: {}", ws_url, e)))?;

        debug!("CDP connected to {}", ws_url);
        Ok(Self {
            ws: Mutex::new(ws),
            next_id: AtomicU64::new(1),
        })
    }

    /// Send a command and wait for its reply. Events arriving in between are
    /// skipped. No timeout: a page that never answers keeps the caller waiting.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, CdpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let json = serde_json::to_string(&CdpRequest { id, method, params })?;
        trace!("CDP send: {}", json);

        let mut ws = self.ws.lock().await;
        ws.send(Message::Text(json.into())).await?;

        while let Some(msg) = ws.next().await {
            match msg? {
                Message::Text(text) => {
                    trace!("CDP recv: {}", text);
                    let response: CdpResponse = serde_json::from_str(&text)?;
                    if response.id != Some(id) {
                        continue;
                    }
                    if let Some(error) = response.error {
                        return Err(CdpError::Protocol {
                            code: error.code,
                            message: error.message,
                        });
                    }
                    return Ok(response.result.unwrap_or(Value::Null));
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        Err(CdpError::SessionClosed)
    }

    /// Evaluate an expression in the page and return its value.
    pub async fn evaluate(&self, expression: &str) -> Result<Value, CdpError> {
        let result = self
            .call(
                "Runtime.evaluate",
                Some(json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                })),
            )
            .await?;

        if let Some(exception) = result.get("exceptionDetails") {
            let text = exception["exception"]["description"]
                .as_str()
                .or_else(|| exception["text"].as_str())
                .unwrap_or("Unknown error");
            return Err(CdpError::JavaScript(text.to_string()));
        }

        Ok(result["result"]["value"].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_info_parses_devtools_listing() {
        let listing = r#"[
            {"id": "A1", "type": "page", "title": "Omni", "url": "https://omni.variational.io/",
             "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/page/A1"},
            {"id": "W1", "type": "service_worker", "url": "https://omni.variational.io/sw.js"}
        ]"#;
        let pages: Vec<PageInfo> = serde_json::from_str(listing).unwrap();

        assert_eq!(pages.len(), 2);
        assert!(pages[0].is_page());
        assert!(!pages[1].is_page());
        assert_eq!(pages[1].title, "");
        assert!(pages[1].web_socket_debugger_url.is_none());
    }

    #[test]
    fn test_request_omits_missing_params() {
        let json = serde_json::to_string(&CdpRequest {
            id: 7,
            method: "Runtime.enable",
            params: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"id":7,"method":"Runtime.enable"}"#);
    }

    #[test]
    fn test_error_response_parses() {
        let response: CdpResponse =
            serde_json::from_str(r#"{"id":3,"error":{"code":-32000,"message":"No node"}}"#).unwrap();
        assert_eq!(response.id, Some(3));
        assert_eq!(response.error.unwrap().code, -32000);
        assert!(response.result.is_none());
    }

    #[test]
    fn test_dropped_socket_maps_to_transport_error() {
        assert!(AutomatorError::from(CdpError::SessionClosed).is_transport());
        assert!(AutomatorError::from(CdpError::WebSocket("reset".to_string())).is_transport());

        let script = AutomatorError::from(CdpError::JavaScript("x is undefined".to_string()));
        assert!(matches!(script, AutomatorError::Page(_)));
    }
}
