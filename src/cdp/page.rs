//! [`Page`] over a live browser tab.
//!
//! Every operation is one `Runtime.evaluate` call. Elements handed back to the
//! automator are tagged with a `data-omni-ref` attribute so later calls can
//! find them again.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::automator::{AutomatorError, Element, Page};

use super::CdpConnection;

const PRELUDE: &str = r#"
const reg = (el) => {
  if (!el.dataset.omniRef) {
    window.__omniRefSeq = (window.__omniRefSeq || 0) + 1;
    el.dataset.omniRef = String(window.__omniRefSeq);
  }
  return { handle: el.dataset.omniRef, text: (el.textContent || '').trim(), disabled: !!el.disabled };
};
const byRef = (ref) => {
  const el = document.querySelector('[data-omni-ref="' + ref + '"]');
  if (!el) throw new Error('element ' + ref + ' is detached');
  return el;
};
"#;

/// Browser tab driven through the DevTools protocol.
pub struct CdpPage {
    conn: CdpConnection,
}

impl CdpPage {
    pub fn new(conn: CdpConnection) -> Self {
        Self { conn }
    }

    async fn run<T: DeserializeOwned>(&self, body: &str) -> Result<T, AutomatorError> {
        let expression = format!("(() => {{{}\n{}\n}})()", PRELUDE, body);
        let value = self.conn.evaluate(&expression).await?;
        serde_json::from_value(value).map_err(|e| AutomatorError::Page(format!("unexpected page reply: {}", e)))
    }
}

/// JSON-encode a string for embedding in a script.
fn js(value: &str) -> String {
    Value::from(value).to_string()
}

#[async_trait]
impl Page for CdpPage {
    async fn query(&self, selector: &str) -> Result<Option<Element>, AutomatorError> {
        self.run(&format!(
            "const el = document.querySelector({}); return el ? reg(el) : null;",
            js(selector)
        ))
        .await
    }

    async fn query_all(&self, selector: &str) -> Result<Vec<Element>, AutomatorError> {
        self.run(&format!(
            "return Array.from(document.querySelectorAll({})).map(reg);",
            js(selector)
        ))
        .await
    }

    async fn query_within(&self, scope: &Element, selector: &str) -> Result<Vec<Element>, AutomatorError> {
        self.run(&format!(
            "return Array.from(byRef({}).querySelectorAll({})).map(reg);",
            js(&scope.handle.0),
            js(selector)
        ))
        .await
    }

    async fn closest(&self, element: &Element, selector: &str) -> Result<Option<Element>, AutomatorError> {
        self.run(&format!(
            "const el = byRef({}).closest({}); return el ? reg(el) : null;",
            js(&element.handle.0),
            js(selector)
        ))
        .await
    }

    async fn click(&self, element: &Element) -> Result<(), AutomatorError> {
        self.run::<bool>(&format!("byRef({}).click(); return true;", js(&element.handle.0)))
            .await
            .map(|_| ())
    }

    async fn focus(&self, element: &Element) -> Result<(), AutomatorError> {
        self.run::<bool>(&format!("byRef({}).focus(); return true;", js(&element.handle.0)))
            .await
            .map(|_| ())
    }

    async fn set_value(&self, element: &Element, value: &str, notify: bool) -> Result<(), AutomatorError> {
        self.run::<bool>(&format!(
            "const el = byRef({}); el.value = {}; \
             if ({}) el.dispatchEvent(new Event('input', {{ bubbles: true }})); return true;",
            js(&element.handle.0),
            js(value),
            notify
        ))
        .await
        .map(|_| ())
    }
}
