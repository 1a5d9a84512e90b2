//! Page automator: turns an abstract order into clicks on the Variational Omni
//! trading page.
//!
//! The automator only sees the page through the [`Page`] trait, so the same
//! click sequence runs against a real browser tab (DevTools protocol) or the
//! in-process [`SimulatedPage`].
//!
//! Open order:
//! 1. Switch the size unit toggle to `$` if needed
//! 2. Select the direction (ask button for BUY, bid button for SELL)
//! 3. Fill the quantity input and fire its `input` event
//! 4. Poll for an enabled submit button and click it
//!
//! Close order: click the position's close button, wait for the dialog to
//! settle, verify the confirmation button label, click it.
//!
//! A successful result only says the clicks went through; the venue's own
//! order confirmation is never read.

mod simulated;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::models::{OrderRequest, OrderResult, OrderType, TradeSide};
use crate::protocol::{Request, Response};

pub use simulated::{PageAction, SimulatedPage};
#[cfg(test)]
pub use simulated::ACTION_LOG_CAPACITY;

/// Attempts made to find an enabled control before giving up.
pub const CONTROL_POLL_ATTEMPTS: u32 = 10;
/// Spacing between control lookups.
pub const CONTROL_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Wait between clicking a position's close button and looking for the confirmation.
pub const CLOSE_SETTLE_DELAY: Duration = Duration::from_millis(1000);

const CURRENCY_SWITCH_DELAY: Duration = Duration::from_millis(1000);
const DIRECTION_SWITCH_DELAY: Duration = Duration::from_millis(500);
const INPUT_FOCUS_DELAY: Duration = Duration::from_millis(500);
const SUBMIT_SETTLE_DELAY: Duration = Duration::from_millis(1000);

/// Size unit the quantity input must be in.
pub const TARGET_CURRENCY: &str = "$";

pub const CURRENCY_TOGGLE: &str = r#"[data-testid="input-mode-toggle"]"#;
pub const ASK_PRICE: &str = r#"[data-testid="ask-price-display"]"#;
pub const BID_PRICE: &str = r#"[data-testid="bid-price-display"]"#;
pub const QUANTITY_INPUT: &str = r#"[data-testid="quantity-input"]"#;
pub const SUBMIT_BUTTON: &str = r#"[data-testid="submit-button"]"#;
pub const POSITION_ROW: &str = r#"[data-testid="positions-table-row"]"#;
pub const CONFIRM_CLOSE_BUTTON: &str = r#"[data-testid="close-position-button"]"#;
pub const STYLED_CLOSE_BUTTON: &str = r#"button[class*="border-azure"][class*="text-azure"]"#;
pub const PRICE_ELEMENTS: &str =
    r#".price, [data-testid="price"], .last-price, .current-price, [class*="price"]"#;

/// Labels of the submit button when it has no test id.
const SUBMIT_LABELS: &[&str] = &["买 BTC", "卖 BTC", "买入", "卖出", "输入大小"];
/// Exact label of a position's close button.
const CLOSE_LABEL: &str = "关闭";
/// Labels accepted on the styled close buttons.
const STYLED_CLOSE_LABELS: &[&str] = &["关闭", "平仓", "交易"];
/// Labels the close confirmation button must carry.
pub const CONFIRM_LABELS: &[&str] = &["卖出平仓", "确认平仓"];

pub const READY_MESSAGE: &str = "Variational Omni automator ready";

/// Errors raised while driving the page.
#[derive(Debug, Error)]
pub enum AutomatorError {
    #[error("{0} not found. Make sure the Variational Omni trading page is fully loaded")]
    ControlNotFound(String),

    #[error("{0} stayed disabled. Check that the order can be placed")]
    ControlDisabled(String),

    #[error("Confirmation button label mismatch: expected one of {expected:?}, found \"{found}\"")]
    ConfirmationMismatch {
        expected: &'static [&'static str],
        found: String,
    },

    #[error("Page error: {0}")]
    Page(String),

    /// The connection to the page dropped. Never folded into an order result.
    #[error("Page connection lost: {0}")]
    Transport(String),
}

impl AutomatorError {
    pub fn is_transport(&self) -> bool {
        matches!(self, AutomatorError::Transport(_))
    }
}

/// Reference to an element inside a page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(transparent)]
pub struct ElementHandle(pub String);

/// Snapshot of an element at lookup time.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Element {
    pub handle: ElementHandle,
    /// Trimmed text content
    pub text: String,
    pub disabled: bool,
}

/// DOM operations the automator needs from a page.
#[async_trait]
pub trait Page: Send + Sync {
    /// First element matching a CSS selector.
    async fn query(&self, selector: &str) -> Result<Option<Element>, AutomatorError>;

    /// All elements matching a CSS selector, in document order.
    async fn query_all(&self, selector: &str) -> Result<Vec<Element>, AutomatorError>;

    /// Descendants of `scope` matching a selector.
    async fn query_within(&self, scope: &Element, selector: &str) -> Result<Vec<Element>, AutomatorError>;

    /// Nearest ancestor (or the element itself) matching a selector.
    async fn closest(&self, element: &Element, selector: &str) -> Result<Option<Element>, AutomatorError>;

    async fn click(&self, element: &Element) -> Result<(), AutomatorError>;

    async fn focus(&self, element: &Element) -> Result<(), AutomatorError>;

    /// Set an input's value, optionally dispatching a bubbling `input` event.
    async fn set_value(&self, element: &Element, value: &str, notify: bool) -> Result<(), AutomatorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Submit,
    ClosePosition,
    ConfirmClose,
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Control::Submit => f.write_str("Submit button"),
            Control::ClosePosition => f.write_str("Close position button"),
            Control::ConfirmClose => f.write_str("Close confirmation button"),
        }
    }
}

/// Drives one trading page.
#[derive(Clone)]
pub struct PageAutomator {
    page: Arc<dyn Page>,
}

impl PageAutomator {
    pub fn new(page: Arc<dyn Page>) -> Self {
        Self { page }
    }

    /// Dispatch a request from the coordinator. Only a lost page connection
    /// is returned as an error; every other failure is an answer.
    pub async fn handle(&self, request: &Request) -> Result<Response, AutomatorError> {
        let response = match request {
            Request::Ping => Response::ok().with_message(READY_MESSAGE),
            Request::ExecuteMarketOrder(order) => self.execute_order(order).await?.into(),
            Request::GetCurrentPrice { symbol } => match self.current_price().await {
                Ok(Some(price)) => Response::ok().with_price(price, symbol.clone()),
                Ok(None) => Response::failure("No price found on the page"),
                Err(e) if e.is_transport() => return Err(e),
                Err(e) => Response::failure(e.to_string()),
            },
            other => Response::failure(format!("Unknown action: {}", other.action())),
        };
        Ok(response)
    }

    /// Place an order. Page failures are folded into a rejected result; a
    /// lost connection is returned as is.
    pub async fn execute_order(&self, order: &OrderRequest) -> Result<OrderResult, AutomatorError> {
        info!(
            order_type = %order.order_type,
            side = %order.side,
            amount = %order.amount,
            symbol = %order.symbol,
            "Executing market order"
        );

        let outcome = match order.order_type {
            OrderType::Open => self.open_position(order).await,
            OrderType::Close => self.close_position().await,
        };

        match outcome {
            Ok(result) => Ok(result),
            Err(e) if e.is_transport() => {
                warn!(order_type = %order.order_type, error = %e, "Lost the page while ordering");
                Err(e)
            }
            Err(e) => {
                warn!(order_type = %order.order_type, error = %e, "Order failed on page");
                Ok(OrderResult::rejected(e.to_string()))
            }
        }
    }

    async fn open_position(&self, order: &OrderRequest) -> Result<OrderResult, AutomatorError> {
        match self.ensure_currency().await {
            Err(e) if e.is_transport() => return Err(e),
            Err(e) => warn!(error = %e, "Could not verify size unit, continuing"),
            Ok(()) => {}
        }

        if let Some(direction) = order.direction {
            match self.select_direction(direction).await {
                Err(e) if e.is_transport() => return Err(e),
                Err(e) => warn!(error = %e, "Could not select direction, continuing"),
                Ok(()) => {}
            }
        }

        match self.page.query(QUANTITY_INPUT).await? {
            Some(input) => {
                self.page.set_value(&input, "", false).await?;
                self.page.focus(&input).await?;
                sleep(INPUT_FOCUS_DELAY).await;
                self.page.set_value(&input, &order.amount.to_string(), true).await?;
                debug!(amount = %order.amount, "Quantity set");
            }
            None => debug!("Quantity input not found, submitting directly"),
        }

        let submit = self.wait_for_enabled(Control::Submit).await?;
        self.page.click(&submit).await?;
        sleep(SUBMIT_SETTLE_DELAY).await;

        let side = order.direction.unwrap_or(order.side);
        Ok(OrderResult::submitted(
            "VARIATIONAL",
            format!("Variational Omni {} order submitted", side),
        ))
    }

    async fn close_position(&self) -> Result<OrderResult, AutomatorError> {
        let close = self.wait_for_enabled(Control::ClosePosition).await?;
        self.page.click(&close).await?;
        sleep(CLOSE_SETTLE_DELAY).await;

        let confirm = self
            .locate(Control::ConfirmClose)
            .await?
            .ok_or_else(|| AutomatorError::ControlNotFound(Control::ConfirmClose.to_string()))?;

        if !CONFIRM_LABELS.iter().any(|label| confirm.text.contains(label)) {
            return Err(AutomatorError::ConfirmationMismatch {
                expected: CONFIRM_LABELS,
                found: confirm.text,
            });
        }
        if confirm.disabled {
            return Err(AutomatorError::ControlDisabled(Control::ConfirmClose.to_string()));
        }

        self.page.click(&confirm).await?;
        sleep(SUBMIT_SETTLE_DELAY).await;

        Ok(OrderResult::submitted(
            "VARIATIONAL_CLOSE",
            "Variational Omni close order submitted",
        ))
    }

    /// Flip the size unit toggle to dollars. A missing toggle is not an error.
    async fn ensure_currency(&self) -> Result<(), AutomatorError> {
        let Some(toggle) = self.page.query(CURRENCY_TOGGLE).await? else {
            debug!("Size unit toggle not found, keeping current unit");
            return Ok(());
        };
        let Some(label) = self.page.query_within(&toggle, "span").await?.into_iter().next() else {
            debug!("Size unit label not found, keeping current unit");
            return Ok(());
        };

        if label.text == TARGET_CURRENCY {
            return Ok(());
        }

        debug!(current = %label.text, "Switching size unit to dollars");
        self.page.click(&toggle).await?;
        sleep(CURRENCY_SWITCH_DELAY).await;
        Ok(())
    }

    async fn select_direction(&self, direction: TradeSide) -> Result<(), AutomatorError> {
        let price_selector = match direction {
            TradeSide::Buy => ASK_PRICE,
            TradeSide::Sell => BID_PRICE,
        };

        let button = match self.page.query(price_selector).await? {
            Some(price) => self.page.closest(&price, "button").await?,
            None => None,
        };
        let Some(button) = button else {
            debug!(direction = %direction, "Direction button not found, continuing");
            return Ok(());
        };

        self.page.click(&button).await?;
        sleep(DIRECTION_SWITCH_DELAY).await;
        Ok(())
    }

    /// Poll for an enabled control, [`CONTROL_POLL_ATTEMPTS`] times,
    /// [`CONTROL_POLL_INTERVAL`] apart.
    async fn wait_for_enabled(&self, control: Control) -> Result<Element, AutomatorError> {
        let mut failure = AutomatorError::ControlNotFound(control.to_string());

        for attempt in 1..=CONTROL_POLL_ATTEMPTS {
            match self.locate(control).await {
                Ok(Some(element)) if !element.disabled => return Ok(element),
                Ok(Some(_)) => failure = AutomatorError::ControlDisabled(control.to_string()),
                Ok(None) => failure = AutomatorError::ControlNotFound(control.to_string()),
                Err(e) if e.is_transport() => return Err(e),
                Err(e) => failure = e,
            }

            debug!(attempt, control = %control, reason = %failure, "Control not ready");
            if attempt < CONTROL_POLL_ATTEMPTS {
                sleep(CONTROL_POLL_INTERVAL).await;
            }
        }

        Err(failure)
    }

    async fn locate(&self, control: Control) -> Result<Option<Element>, AutomatorError> {
        match control {
            Control::Submit => {
                if let Some(button) = self.page.query(SUBMIT_BUTTON).await? {
                    return Ok(Some(button));
                }
                let buttons = self.page.query_all("button").await?;
                Ok(buttons
                    .into_iter()
                    .find(|b| SUBMIT_LABELS.iter().any(|label| b.text.contains(label))))
            }
            Control::ClosePosition => {
                let buttons = self.page.query_all("button").await?;
                if let Some(button) = buttons.into_iter().find(|b| b.text == CLOSE_LABEL) {
                    return Ok(Some(button));
                }

                for row in self.page.query_all(POSITION_ROW).await? {
                    let buttons = self.page.query_within(&row, "button").await?;
                    if let Some(button) = buttons.into_iter().find(|b| b.text == CLOSE_LABEL) {
                        return Ok(Some(button));
                    }
                }

                let styled = self.page.query_all(STYLED_CLOSE_BUTTON).await?;
                Ok(styled
                    .into_iter()
                    .find(|b| STYLED_CLOSE_LABELS.contains(&b.text.as_str())))
            }
            Control::ConfirmClose => {
                if let Some(button) = self.page.query(CONFIRM_CLOSE_BUTTON).await? {
                    return Ok(Some(button));
                }
                let buttons = self.page.query_all("button").await?;
                Ok(buttons
                    .into_iter()
                    .find(|b| CONFIRM_LABELS.iter().any(|label| b.text.contains(label))))
            }
        }
    }

    /// First number shown by a price-like element.
    async fn current_price(&self) -> Result<Option<Decimal>, AutomatorError> {
        let elements = self.page.query_all(PRICE_ELEMENTS).await?;
        Ok(elements.iter().find_map(|e| extract_number(&e.text)))
    }
}

/// First unsigned decimal number in a string, e.g. `"Mark 64250.5 USD"` -> 64250.5.
fn extract_number(text: &str) -> Option<Decimal> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let rest = &text[start..];

    let mut end = 0;
    let mut seen_dot = false;
    for (i, c) in rest.char_indices() {
        if c.is_ascii_digit() {
            end = i + 1;
        } else if c == '.' && !seen_dot {
            seen_dot = true;
        } else {
            break;
        }
    }

    rest[..end].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn automator(page: &Arc<SimulatedPage>) -> PageAutomator {
        PageAutomator::new(page.clone())
    }

    fn clicks(page: &SimulatedPage) -> Vec<String> {
        page.actions()
            .into_iter()
            .filter_map(|a| match a {
                PageAction::Click(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_extract_number() {
        assert_eq!(extract_number("Mark 64250.5 USD"), Some(dec!(64250.5)));
        assert_eq!(extract_number("$12."), Some(dec!(12)));
        assert_eq!(extract_number("no digits"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_order_clicks_through_the_form() {
        let page = Arc::new(SimulatedPage::variational());
        let order = OrderRequest::open(TradeSide::Sell, dec!(20), "BTCUSDT").with_direction(TradeSide::Sell);

        let result = automator(&page).execute_order(&order).await.unwrap();

        assert!(result.success, "{:?}", result.error);
        assert!(result.order_id.unwrap().starts_with("VARIATIONAL_"));
        assert_eq!(clicks(&page), vec!["currency-toggle", "bid-button", "submit"]);
        assert_eq!(page.input_value(), "20");
        assert_eq!(page.currency(), "$");
        assert_eq!(page.open_positions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_currency_already_in_dollars_is_left_alone() {
        let page = Arc::new(SimulatedPage::variational());
        page.set_text("currency-label", "$");

        let result = automator(&page)
            .execute_order(&OrderRequest::open(TradeSide::Buy, dec!(5), "BTCUSDT"))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(clicks(&page), vec!["submit"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_falls_back_to_label_match() {
        let page = Arc::new(SimulatedPage::variational());
        page.set_test_id("submit", None);

        let result = automator(&page)
            .execute_order(&OrderRequest::open(TradeSide::Buy, dec!(5), "BTCUSDT"))
            .await
            .unwrap();

        assert!(result.success);
        assert!(clicks(&page).contains(&"submit".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_waits_until_enabled() {
        let page = Arc::new(SimulatedPage::variational());
        page.disable_for_lookups("submit", 4);

        let started = tokio::time::Instant::now();
        let result = automator(&page)
            .execute_order(&OrderRequest::open(TradeSide::Buy, dec!(5), "BTCUSDT"))
            .await
            .unwrap();

        assert!(result.success);
        // four disabled lookups cost four poll intervals
        assert!(started.elapsed() >= CONTROL_POLL_INTERVAL * 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_submit_fails_after_bounded_polling() {
        let page = Arc::new(SimulatedPage::variational());
        page.remove("submit");

        let started = tokio::time::Instant::now();
        let result = automator(&page)
            .execute_order(&OrderRequest::open(TradeSide::Buy, dec!(5), "BTCUSDT"))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.error.unwrap().contains("Submit button not found"));
        assert_eq!(page.lookups("button"), CONTROL_POLL_ATTEMPTS as usize);
        assert!(started.elapsed() >= CONTROL_POLL_INTERVAL * (CONTROL_POLL_ATTEMPTS - 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_submit_reports_disabled() {
        let page = Arc::new(SimulatedPage::variational());
        page.set_disabled("submit", true);

        let result = automator(&page)
            .execute_order(&OrderRequest::open(TradeSide::Buy, dec!(5), "BTCUSDT"))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.error.unwrap().contains("stayed disabled"));
        assert_eq!(page.open_positions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_runs_two_phase_confirmation() {
        let page = Arc::new(SimulatedPage::variational());
        let automator = automator(&page);

        automator
            .execute_order(&OrderRequest::open(TradeSide::Buy, dec!(5), "BTCUSDT"))
            .await
            .unwrap();
        let result = automator
            .execute_order(&OrderRequest::close(TradeSide::Sell, dec!(5), "BTCUSDT"))
            .await
            .unwrap();

        assert!(result.success, "{:?}", result.error);
        assert!(result.order_id.unwrap().starts_with("VARIATIONAL_CLOSE_"));
        assert_eq!(page.open_positions(), 0);
        assert!(clicks(&page).ends_with(&["close-button".to_string(), "confirm-button".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_rejects_unexpected_confirmation_label() {
        let page = Arc::new(SimulatedPage::variational());
        page.set_text("confirm-button", "取消");
        let automator = automator(&page);

        automator
            .execute_order(&OrderRequest::open(TradeSide::Buy, dec!(5), "BTCUSDT"))
            .await
            .unwrap();
        let result = automator
            .execute_order(&OrderRequest::close(TradeSide::Sell, dec!(5), "BTCUSDT"))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.error.unwrap().contains("label mismatch"));
        assert_eq!(page.open_positions(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_without_position_fails() {
        let page = Arc::new(SimulatedPage::variational());

        let result = automator(&page)
            .execute_order(&OrderRequest::close(TradeSide::Sell, dec!(5), "BTCUSDT"))
            .await
            .unwrap();

        assert!(!result.success);
        assert!(result.error.unwrap().contains("Close position button not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_answers_ping_price_and_unknown() {
        let page = Arc::new(SimulatedPage::variational());
        let automator = automator(&page);

        let pong = automator.handle(&Request::Ping).await.unwrap();
        assert!(pong.success);
        assert_eq!(pong.message.as_deref(), Some(READY_MESSAGE));

        let price = automator
            .handle(&Request::GetCurrentPrice { symbol: "BTCUSDT".to_string() })
            .await
            .unwrap();
        assert_eq!(price.price, Some(dec!(64250.50)));

        let unknown = automator.handle(&Request::StopAllTrading).await.unwrap();
        assert!(!unknown.success);
        assert!(unknown.error.unwrap().contains("stopAllTrading"));
    }

    struct DroppedPage;

    #[async_trait]
    impl Page for DroppedPage {
        async fn query(&self, _: &str) -> Result<Option<Element>, AutomatorError> {
            Err(AutomatorError::Transport("Session closed".to_string()))
        }

        async fn query_all(&self, _: &str) -> Result<Vec<Element>, AutomatorError> {
            Err(AutomatorError::Transport("Session closed".to_string()))
        }

        async fn query_within(&self, _: &Element, _: &str) -> Result<Vec<Element>, AutomatorError> {
            Err(AutomatorError::Transport("Session closed".to_string()))
        }

        async fn closest(&self, _: &Element, _: &str) -> Result<Option<Element>, AutomatorError> {
            Err(AutomatorError::Transport("Session closed".to_string()))
        }

        async fn click(&self, _: &Element) -> Result<(), AutomatorError> {
            Err(AutomatorError::Transport("Session closed".to_string()))
        }

        async fn focus(&self, _: &Element) -> Result<(), AutomatorError> {
            Err(AutomatorError::Transport("Session closed".to_string()))
        }

        async fn set_value(&self, _: &Element, _: &str, _: bool) -> Result<(), AutomatorError> {
            Err(AutomatorError::Transport("Session closed".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_connection_is_not_a_rejection() {
        let automator = PageAutomator::new(Arc::new(DroppedPage));

        let open = automator
            .execute_order(&OrderRequest::open(TradeSide::Buy, dec!(5), "BTCUSDT"))
            .await;
        assert!(matches!(open, Err(AutomatorError::Transport(_))));

        let close = automator
            .handle(&Request::ExecuteMarketOrder(OrderRequest::close(TradeSide::Sell, dec!(5), "BTCUSDT")))
            .await;
        assert!(matches!(close, Err(AutomatorError::Transport(_))));

        let price = automator
            .handle(&Request::GetCurrentPrice { symbol: "BTCUSDT".to_string() })
            .await;
        assert!(price.is_err());

        // ping never touches the page
        assert!(automator.handle(&Request::Ping).await.unwrap().success);
    }
}
