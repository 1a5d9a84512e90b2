//! In-process model of the Variational Omni order form.
//!
//! Used by `run --simulate` and by tests. It understands the small CSS subset
//! the automator uses (tag, `.class`, `[attr="v"]`, `[attr*="v"]`, comma
//! lists) and reacts to clicks the way the real page does: submitting opens a
//! position row, its close button reveals the confirmation button, confirming
//! closes the position.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{AutomatorError, Element, ElementHandle, Page};

/// Most recent page actions kept for inspection.
pub const ACTION_LOG_CAPACITY: usize = 256;

/// Something the automator did to the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageAction {
    Click(String),
    Focus(String),
    Fill(String, String),
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    tag: String,
    classes: Vec<String>,
    attrs: BTreeMap<String, String>,
    text: String,
    value: String,
    disabled: bool,
    present: bool,
    parent: Option<usize>,
}

impl Node {
    fn new(name: &str, tag: &str) -> Self {
        Self {
            name: name.to_string(),
            tag: tag.to_string(),
            classes: Vec::new(),
            attrs: BTreeMap::new(),
            text: String::new(),
            value: String::new(),
            disabled: false,
            present: true,
            parent: None,
        }
    }

    fn test_id(mut self, id: &str) -> Self {
        self.attrs.insert("data-testid".to_string(), id.to_string());
        self
    }

    fn class(mut self, class: &str) -> Self {
        self.classes.extend(class.split_whitespace().map(str::to_string));
        self
    }

    fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    fn child_of(mut self, parent: usize) -> Self {
        self.parent = Some(parent);
        self
    }

    fn hidden(mut self) -> Self {
        self.present = false;
        self
    }

    fn attr(&self, name: &str) -> Option<String> {
        match name {
            "class" => Some(self.classes.join(" ")),
            _ => self.attrs.get(name).cloned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum AttrMatch {
    Equals(String, String),
    Contains(String, String),
}

/// One compound selector, e.g. `button[class*="x"]`.
#[derive(Debug, Clone, Default, PartialEq)]
struct Compound {
    tag: Option<String>,
    classes: Vec<String>,
    attrs: Vec<AttrMatch>,
}

impl Compound {
    fn parse(input: &str) -> Self {
        let mut compound = Compound::default();
        let boundary = |c: char| c == '.' || c == '[';

        let mut rest = input.trim();
        let tag_end = rest.find(boundary).unwrap_or(rest.len());
        if tag_end > 0 {
            compound.tag = Some(rest[..tag_end].to_ascii_lowercase());
        }
        rest = &rest[tag_end..];

        while !rest.is_empty() {
            if let Some(r) = rest.strip_prefix('.') {
                let end = r.find(boundary).unwrap_or(r.len());
                compound.classes.push(r[..end].to_string());
                rest = &r[end..];
            } else if let Some(r) = rest.strip_prefix('[') {
                let end = r.find(']').unwrap_or(r.len());
                if let Some(m) = parse_attr(&r[..end]) {
                    compound.attrs.push(m);
                }
                rest = r.get(end + 1..).unwrap_or("");
            } else {
                break;
            }
        }

        compound
    }

    fn matches(&self, node: &Node) -> bool {
        if let Some(tag) = &self.tag {
            if &node.tag != tag {
                return false;
            }
        }
        if !self.classes.iter().all(|c| node.classes.contains(c)) {
            return false;
        }
        self.attrs.iter().all(|m| match m {
            AttrMatch::Equals(name, value) => node.attr(name).as_deref() == Some(value.as_str()),
            AttrMatch::Contains(name, value) => node.attr(name).is_some_and(|v| v.contains(value.as_str())),
        })
    }
}

fn parse_attr(body: &str) -> Option<AttrMatch> {
    let unquote = |v: &str| v.trim().trim_matches('"').trim_matches('\'').to_string();

    if let Some((name, value)) = body.split_once("*=") {
        return Some(AttrMatch::Contains(name.trim().to_string(), unquote(value)));
    }
    body.split_once('=')
        .map(|(name, value)| AttrMatch::Equals(name.trim().to_string(), unquote(value)))
}

fn parse_selector(selector: &str) -> Vec<Compound> {
    selector.split(',').map(Compound::parse).collect()
}

#[derive(Debug, Default)]
struct Dom {
    nodes: Vec<Node>,
    actions: VecDeque<PageAction>,
    lookups: HashMap<String, usize>,
    disabled_lookups: HashMap<String, u32>,
    open_positions: u32,
    disconnected: bool,
}

impl Dom {
    fn push(&mut self, node: Node) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    fn record(&mut self, action: PageAction) {
        if self.actions.len() == ACTION_LOG_CAPACITY {
            self.actions.pop_front();
        }
        self.actions.push_back(action);
    }

    fn ensure_connected(&self) -> Result<(), AutomatorError> {
        if self.disconnected {
            return Err(AutomatorError::Transport("page closed".to_string()));
        }
        Ok(())
    }

    fn index(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    fn node_mut(&mut self, name: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.name == name)
    }

    fn attached(&self, idx: usize) -> bool {
        let mut cursor = Some(idx);
        while let Some(i) = cursor {
            if !self.nodes[i].present {
                return false;
            }
            cursor = self.nodes[i].parent;
        }
        true
    }

    fn is_descendant(&self, idx: usize, ancestor: usize) -> bool {
        let mut cursor = self.nodes[idx].parent;
        while let Some(i) = cursor {
            if i == ancestor {
                return true;
            }
            cursor = self.nodes[i].parent;
        }
        false
    }

    fn text_content(&self, idx: usize) -> String {
        let mut text = self.nodes[idx].text.clone();
        for child in 0..self.nodes.len() {
            if self.nodes[child].parent == Some(idx) && self.nodes[child].present {
                text.push_str(&self.text_content(child));
            }
        }
        text
    }

    fn snapshot(&mut self, idx: usize) -> Element {
        let name = self.nodes[idx].name.clone();
        let mut disabled = self.nodes[idx].disabled;
        if let Some(remaining) = self.disabled_lookups.get_mut(&name) {
            if *remaining > 0 {
                *remaining -= 1;
                disabled = true;
            }
        }
        Element {
            handle: ElementHandle(name),
            text: self.text_content(idx).trim().to_string(),
            disabled,
        }
    }

    fn select(&mut self, selector: &str, within: Option<usize>) -> Vec<Element> {
        let compounds = parse_selector(selector);
        let matched: Vec<usize> = (0..self.nodes.len())
            .filter(|&i| self.attached(i))
            .filter(|&i| within.map_or(true, |scope| self.is_descendant(i, scope)))
            .filter(|&i| compounds.iter().any(|c| c.matches(&self.nodes[i])))
            .collect();
        matched.into_iter().map(|i| self.snapshot(i)).collect()
    }

    fn resolve(&self, element: &Element) -> Result<usize, AutomatorError> {
        self.index(&element.handle.0)
            .filter(|&i| self.attached(i))
            .ok_or_else(|| AutomatorError::Page(format!("element {} is detached", element.handle.0)))
    }

    fn set_present(&mut self, name: &str, present: bool) {
        if let Some(node) = self.node_mut(name) {
            node.present = present;
        }
    }

    fn on_click(&mut self, name: &str) {
        match name {
            "currency-toggle" => {
                if let Some(label) = self.node_mut("currency-label") {
                    label.text = super::TARGET_CURRENCY.to_string();
                }
            }
            "submit" => {
                self.open_positions += 1;
                self.set_present("position-row", true);
                self.set_present("close-button", true);
            }
            "close-button" => self.set_present("confirm-button", true),
            "confirm-button" => {
                self.open_positions = self.open_positions.saturating_sub(1);
                self.set_present("confirm-button", false);
                if self.open_positions == 0 {
                    self.set_present("position-row", false);
                }
            }
            _ => {}
        }
    }
}

/// Simulated trading page.
#[derive(Debug, Default)]
pub struct SimulatedPage {
    dom: Mutex<Dom>,
}

impl SimulatedPage {
    /// A freshly loaded BTC perpetual order form with no open position.
    pub fn variational() -> Self {
        let mut dom = Dom::default();

        let toggle = dom.push(Node::new("currency-toggle", "button").test_id("input-mode-toggle"));
        dom.push(Node::new("currency-label", "span").text("BTC").child_of(toggle));

        let ask = dom.push(Node::new("ask-button", "button"));
        dom.push(
            Node::new("ask-price", "span")
                .test_id("ask-price-display")
                .class("price")
                .text("64250.50")
                .child_of(ask),
        );
        let bid = dom.push(Node::new("bid-button", "button"));
        dom.push(
            Node::new("bid-price", "span")
                .test_id("bid-price-display")
                .class("price")
                .text("64249.50")
                .child_of(bid),
        );

        dom.push(Node::new("quantity-input", "input").test_id("quantity-input"));
        dom.push(Node::new("submit", "button").test_id("submit-button").text("买 BTC"));

        let row = dom.push(Node::new("position-row", "tr").test_id("positions-table-row").hidden());
        dom.push(Node::new("position-symbol", "td").text("BTC-PERP").child_of(row));
        dom.push(
            Node::new("close-button", "button")
                .class("border-azure text-azure")
                .text("关闭")
                .child_of(row),
        );

        dom.push(
            Node::new("confirm-button", "button")
                .test_id("close-position-button")
                .text("卖出平仓")
                .hidden(),
        );

        Self { dom: Mutex::new(dom) }
    }

    fn dom(&self) -> MutexGuard<'_, Dom> {
        self.dom.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The last [`ACTION_LOG_CAPACITY`] things the automator did, oldest first.
    pub fn actions(&self) -> Vec<PageAction> {
        self.dom().actions.iter().cloned().collect()
    }

    /// Times `selector` was passed verbatim to a document-level query.
    pub fn lookups(&self, selector: &str) -> usize {
        self.dom().lookups.get(selector).copied().unwrap_or(0)
    }

    pub fn input_value(&self) -> String {
        let dom = self.dom();
        dom.index("quantity-input")
            .map(|i| dom.nodes[i].value.clone())
            .unwrap_or_default()
    }

    /// Size unit currently shown by the toggle.
    pub fn currency(&self) -> String {
        let dom = self.dom();
        dom.index("currency-label")
            .map(|i| dom.nodes[i].text.clone())
            .unwrap_or_default()
    }

    pub fn open_positions(&self) -> u32 {
        self.dom().open_positions
    }

    pub fn set_text(&self, name: &str, text: &str) {
        if let Some(node) = self.dom().node_mut(name) {
            node.text = text.to_string();
        }
    }

    pub fn set_disabled(&self, name: &str, disabled: bool) {
        if let Some(node) = self.dom().node_mut(name) {
            node.disabled = disabled;
        }
    }

    pub fn set_test_id(&self, name: &str, test_id: Option<&str>) {
        if let Some(node) = self.dom().node_mut(name) {
            match test_id {
                Some(id) => {
                    node.attrs.insert("data-testid".to_string(), id.to_string());
                }
                None => {
                    node.attrs.remove("data-testid");
                }
            }
        }
    }

    /// Detach an element from the page.
    pub fn remove(&self, name: &str) {
        self.dom().set_present(name, false);
    }

    /// Fail every page call as if the tab had been closed.
    pub fn set_disconnected(&self, disconnected: bool) {
        self.dom().disconnected = disconnected;
    }

    /// Report an element as disabled for its next `lookups` appearances.
    pub fn disable_for_lookups(&self, name: &str, lookups: u32) {
        self.dom().disabled_lookups.insert(name.to_string(), lookups);
    }
}

#[async_trait]
impl Page for SimulatedPage {
    async fn query(&self, selector: &str) -> Result<Option<Element>, AutomatorError> {
        Ok(self.query_all(selector).await?.into_iter().next())
    }

    async fn query_all(&self, selector: &str) -> Result<Vec<Element>, AutomatorError> {
        let mut dom = self.dom();
        dom.ensure_connected()?;
        *dom.lookups.entry(selector.to_string()).or_default() += 1;
        Ok(dom.select(selector, None))
    }

    async fn query_within(&self, scope: &Element, selector: &str) -> Result<Vec<Element>, AutomatorError> {
        let mut dom = self.dom();
        dom.ensure_connected()?;
        let scope = dom.resolve(scope)?;
        Ok(dom.select(selector, Some(scope)))
    }

    async fn closest(&self, element: &Element, selector: &str) -> Result<Option<Element>, AutomatorError> {
        let mut dom = self.dom();
        dom.ensure_connected()?;
        let compounds = parse_selector(selector);

        let mut cursor = Some(dom.resolve(element)?);
        while let Some(i) = cursor {
            if compounds.iter().any(|c| c.matches(&dom.nodes[i])) {
                return Ok(Some(dom.snapshot(i)));
            }
            cursor = dom.nodes[i].parent;
        }
        Ok(None)
    }

    async fn click(&self, element: &Element) -> Result<(), AutomatorError> {
        let mut dom = self.dom();
        dom.ensure_connected()?;
        let idx = dom.resolve(element)?;
        let name = dom.nodes[idx].name.clone();

        dom.record(PageAction::Click(name.clone()));
        if !dom.nodes[idx].disabled {
            dom.on_click(&name);
        }
        Ok(())
    }

    async fn focus(&self, element: &Element) -> Result<(), AutomatorError> {
        let mut dom = self.dom();
        dom.ensure_connected()?;
        let idx = dom.resolve(element)?;
        let name = dom.nodes[idx].name.clone();
        dom.record(PageAction::Focus(name));
        Ok(())
    }

    async fn set_value(&self, element: &Element, value: &str, notify: bool) -> Result<(), AutomatorError> {
        let mut dom = self.dom();
        dom.ensure_connected()?;
        let idx = dom.resolve(element)?;
        dom.nodes[idx].value = value.to_string();
        if notify {
            let name = dom.nodes[idx].name.clone();
            dom.record(PageAction::Fill(name, value.to_string()));
        }
        Ok(())
    }
}
