//! Capability-based access to a live page.
//!
//! A backend implements [`PageDriver`] and lists what it can do in
//! [`PageDriver::capabilities`]; every operation has a default body that
//! returns [`DriverError::Unsupported`]. Callers go through the dispatch
//! functions in this module, which pick the first strategy the backend
//! supports (for example reading markup through `evaluate` when the backend
//! has no native `content`).

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::dom;
use crate::error::{DriverError, DriverResult};
use crate::types::clip;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Navigate,
    CurrentUrl,
    Title,
    Content,
    Query,
    WaitVisible,
    Click,
    Fill,
    Evaluate,
    ElementScript,
    Events,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Navigate => "navigate",
            Self::CurrentUrl => "current_url",
            Self::Title => "title",
            Self::Content => "content",
            Self::Query => "query",
            Self::WaitVisible => "wait_visible",
            Self::Click => "click",
            Self::Fill => "fill",
            Self::Evaluate => "evaluate",
            Self::ElementScript => "element_script",
            Self::Events => "events",
        };
        f.write_str(name)
    }
}

/// How the oracle addresses an element: a CSS selector, or `text=...` for
/// an element by its visible text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    Css(String),
    Text(String),
}

impl Locator {
    pub fn parse(selector: &str) -> Self {
        let selector = selector.trim();
        match selector.strip_prefix("text=") {
            Some(text) => {
                let text = text.trim();
                let unquoted = text
                    .strip_prefix('"')
                    .and_then(|t| t.strip_suffix('"'))
                    .or_else(|| text.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')))
                    .unwrap_or(text);
                Self::Text(unquoted.to_string())
            }
            None => Self::Css(selector.to_string()),
        }
    }

    /// XPath equivalent. CSS locators are not translated and yield `//*[false()]`.
    pub fn to_xpath(&self) -> String {
        match self {
            Self::Text(text) => {
                let literal = xpath_literal(text);
                format!(
                    "//*[not(self::script or self::style)][normalize-space(text())={literal}] \
                     | //input[@type='submit' or @type='button' or @type='reset'][@value={literal}]"
                )
            }
            Self::Css(_) => "//*[false()]".to_string(),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Css(selector) => f.write_str(selector),
            Self::Text(text) => write!(f, "text={text}"),
        }
    }
}

fn xpath_literal(text: &str) -> String {
    if !text.contains('\'') {
        format!("'{text}'")
    } else if !text.contains('"') {
        format!("\"{text}\"")
    } else {
        let parts: Vec<String> = text.split('\'').map(|p| format!("'{p}'")).collect();
        format!("concat({})", parts.join(", \"'\", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogEvent {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Default)]
struct EventBuffers {
    dialogs: Vec<DialogEvent>,
    console: VecDeque<String>,
}

/// Events drained from an [`EventLog`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainedEvents {
    pub dialogs: Vec<DialogEvent>,
    pub console: Vec<String>,
}

/// Dialog and console events recorded by page listeners between two
/// evidence collections. Listeners run on the backend's event thread, so the
/// buffers sit behind a mutex; cloning shares the same buffers.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    inner: Arc<Mutex<EventBuffers>>,
}

const CONSOLE_BUFFER: usize = 100;
const CONSOLE_LINE_CHARS: usize = 300;

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn buffers(&self) -> MutexGuard<'_, EventBuffers> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_dialog(&self, kind: impl Into<String>, message: impl Into<String>) {
        self.buffers().dialogs.push(DialogEvent {
            kind: kind.into(),
            message: message.into(),
        });
    }

    pub fn record_console(&self, line: &str) {
        let mut buffers = self.buffers();
        if buffers.console.len() == CONSOLE_BUFFER {
            buffers.console.pop_front();
        }
        buffers
            .console
            .push_back(clip(line, CONSOLE_LINE_CHARS).to_string());
    }

    /// Take everything recorded so far, leaving the log empty.
    pub fn drain(&self) -> DrainedEvents {
        let mut buffers = self.buffers();
        DrainedEvents {
            dialogs: std::mem::take(&mut buffers.dialogs),
            console: buffers.console.drain(..).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        let buffers = self.buffers();
        buffers.dialogs.is_empty() && buffers.console.is_empty()
    }
}

/// A live page. Only the control loop talks to it, one call at a time.
pub trait PageDriver: Send {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    fn unsupported(&self, capability: Capability) -> DriverError {
        DriverError::Unsupported {
            driver: self.name().to_string(),
            capability,
        }
    }

    /// Navigate and wait until the document has loaded.
    fn navigate(&mut self, _url: &str) -> DriverResult<()> {
        Err(self.unsupported(Capability::Navigate))
    }

    fn current_url(&mut self) -> DriverResult<String> {
        Err(self.unsupported(Capability::CurrentUrl))
    }

    fn title(&mut self) -> DriverResult<String> {
        Err(self.unsupported(Capability::Title))
    }

    fn content(&mut self) -> DriverResult<String> {
        Err(self.unsupported(Capability::Content))
    }

    /// Number of elements the locator matches.
    fn count(&mut self, _locator: &Locator) -> DriverResult<usize> {
        Err(self.unsupported(Capability::Query))
    }

    fn wait_visible(&mut self, _locator: &Locator, _timeout: Duration) -> DriverResult<()> {
        Err(self.unsupported(Capability::WaitVisible))
    }

    /// Click the first match.
    fn click(&mut self, _locator: &Locator, _timeout: Duration) -> DriverResult<()> {
        Err(self.unsupported(Capability::Click))
    }

    /// Set the value of the first match. Uniqueness is checked by [`fill_unique`].
    fn fill(&mut self, _locator: &Locator, _text: &str) -> DriverResult<()> {
        Err(self.unsupported(Capability::Fill))
    }

    fn evaluate(&mut self, _script: &str) -> DriverResult<Value> {
        Err(self.unsupported(Capability::Evaluate))
    }

    /// Call a JS function declaration with `this` bound to the first match.
    fn call_on_element(
        &mut self,
        _locator: &Locator,
        _function: &str,
        _args: Vec<Value>,
    ) -> DriverResult<Value> {
        Err(self.unsupported(Capability::ElementScript))
    }

    fn events(&self) -> Option<&EventLog> {
        None
    }

    fn close(&mut self) -> DriverResult<()> {
        Ok(())
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn as_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn evaluate(driver: &mut dyn PageDriver, script: &str) -> DriverResult<Value> {
    if driver.supports(Capability::Evaluate) {
        return driver.evaluate(script);
    }
    Err(driver.unsupported(Capability::Evaluate))
}

pub fn evaluate_string(driver: &mut dyn PageDriver, script: &str) -> DriverResult<String> {
    evaluate(driver, script).map(as_string)
}

pub fn navigate(driver: &mut dyn PageDriver, url: &str) -> DriverResult<()> {
    if driver.supports(Capability::Navigate) {
        return driver.navigate(url);
    }
    Err(driver.unsupported(Capability::Navigate))
}

pub fn page_url(driver: &mut dyn PageDriver) -> DriverResult<String> {
    if driver.supports(Capability::CurrentUrl) {
        return driver.current_url();
    }
    if driver.supports(Capability::Evaluate) {
        return evaluate_string(driver, dom::LOCATION_JS);
    }
    Err(driver.unsupported(Capability::CurrentUrl))
}

pub fn page_title(driver: &mut dyn PageDriver) -> DriverResult<String> {
    if driver.supports(Capability::Title) {
        return driver.title();
    }
    if driver.supports(Capability::Evaluate) {
        return evaluate_string(driver, dom::TITLE_JS);
    }
    Err(driver.unsupported(Capability::Title))
}

pub fn page_content(driver: &mut dyn PageDriver) -> DriverResult<String> {
    if driver.supports(Capability::Content) {
        return driver.content();
    }
    if driver.supports(Capability::Evaluate) {
        return evaluate_string(driver, dom::OUTER_HTML_JS);
    }
    Err(driver.unsupported(Capability::Content))
}

pub fn count_matches(driver: &mut dyn PageDriver, locator: &Locator) -> DriverResult<usize> {
    if driver.supports(Capability::Query) {
        return driver.count(locator);
    }
    if driver.supports(Capability::Evaluate) {
        let value = driver.evaluate(&dom::count_expression(locator))?;
        return value
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| DriverError::Script(format!("element count was not a number: {value}")));
    }
    Err(driver.unsupported(Capability::Query))
}

/// Wait until the first match is visible, polling through `evaluate` when
/// the backend has no native wait.
pub fn wait_visible(
    driver: &mut dyn PageDriver,
    locator: &Locator,
    timeout: Duration,
) -> DriverResult<()> {
    if driver.supports(Capability::WaitVisible) {
        return driver.wait_visible(locator, timeout);
    }
    if !driver.supports(Capability::Evaluate) {
        return Err(driver.unsupported(Capability::WaitVisible));
    }

    let script = dom::visible_expression(locator);
    let deadline = Instant::now() + timeout;
    loop {
        if driver.evaluate(&script)?.as_bool() == Some(true) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(DriverError::Timeout {
                what: format!("'{locator}' to be visible"),
                timeout,
            });
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

pub fn click_first(
    driver: &mut dyn PageDriver,
    locator: &Locator,
    timeout: Duration,
) -> DriverResult<()> {
    if driver.supports(Capability::Click) {
        return driver.click(locator, timeout);
    }
    if driver.supports(Capability::ElementScript) || driver.supports(Capability::Evaluate) {
        return call_on_element(driver, locator, dom::CLICK_FN, Vec::new()).map(|_| ());
    }
    Err(driver.unsupported(Capability::Click))
}

/// Fill the single element the locator matches. Zero matches and more than
/// one match are both refused before anything is typed.
pub fn fill_unique(driver: &mut dyn PageDriver, locator: &Locator, text: &str) -> DriverResult<()> {
    match count_matches(driver, locator)? {
        0 => return Err(DriverError::NotFound(locator.to_string())),
        1 => {}
        count => {
            return Err(DriverError::Ambiguous {
                selector: locator.to_string(),
                count,
            });
        }
    }

    if driver.supports(Capability::Fill) {
        return driver.fill(locator, text);
    }
    if driver.supports(Capability::ElementScript) || driver.supports(Capability::Evaluate) {
        return call_on_element(driver, locator, dom::FILL_FN, vec![Value::from(text)]).map(|_| ());
    }
    Err(driver.unsupported(Capability::Fill))
}

pub fn call_on_element(
    driver: &mut dyn PageDriver,
    locator: &Locator,
    function: &str,
    args: Vec<Value>,
) -> DriverResult<Value> {
    if driver.supports(Capability::ElementScript) {
        return driver.call_on_element(locator, function, args);
    }
    if driver.supports(Capability::Evaluate) {
        return driver.evaluate(&dom::element_call_expression(locator, function, &args));
    }
    Err(driver.unsupported(Capability::ElementScript))
}

/// Drain recorded events, or nothing when the backend has no listeners.
pub fn drain_events(driver: &dyn PageDriver) -> DrainedEvents {
    if driver.supports(Capability::Events) {
        if let Some(log) = driver.events() {
            return log.drain();
        }
    }
    DrainedEvents::default()
}
