use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result};
use headless_chrome::browser::tab::element::Element;
use headless_chrome::protocol::cdp::Page;
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::driver::{Capability, EventLog, Locator, PageDriver};
use crate::error::{DriverError, DriverResult};

#[derive(Debug, Clone)]
pub struct BrowserOptions {
    pub headless: bool,
    /// DevTools endpoint of an already running Chrome to attach to first.
    pub attach: Option<String>,
    pub chrome_path: Option<PathBuf>,
    /// How long a dialog stays open before it is accepted.
    pub dialog_pause: Duration,
    /// Must exceed the longest oracle round-trip or Chrome drops the session.
    pub idle_timeout: Duration,
    /// Tab-wide wait used by page loads. Element waits never change it.
    pub navigation_timeout: Duration,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            headless: false,
            attach: None,
            chrome_path: None,
            dialog_pause: Duration::ZERO,
            idle_timeout: Duration::from_secs(600),
            navigation_timeout: DEFAULT_NAVIGATION_TIMEOUT,
        }
    }
}

pub const DEFAULT_NAVIGATION_TIMEOUT: Duration = Duration::from_secs(20);

const CHROME_CAPABILITIES: &[Capability] = &[
    Capability::Navigate,
    Capability::CurrentUrl,
    Capability::Title,
    Capability::Content,
    Capability::Click,
    Capability::Evaluate,
    Capability::ElementScript,
    Capability::Events,
];

/// Chrome over the DevTools protocol. Created once per run.
///
/// Selector counting, visibility waits and filling go through the
/// `evaluate`/`element_script` fallbacks in [`crate::driver`].
pub struct ChromeDriver {
    browser: Option<Browser>,
    tab: Arc<Tab>,
    events: EventLog,
}

impl ChromeDriver {
    pub fn launch(options: &BrowserOptions) -> Result<Self> {
        if let Some(endpoint) = &options.attach {
            info!("[Hands] Attempting to attach to existing Chrome at {}...", endpoint);
            match Browser::connect(endpoint.clone()) {
                Ok(browser) => {
                    info!("[Hands] Attached to existing Chrome.");
                    let existing = browser
                        .get_tabs()
                        .lock()
                        .ok()
                        .and_then(|tabs| tabs.first().cloned());
                    let tab = match existing {
                        Some(tab) => {
                            debug!("[Hands] Using existing tab.");
                            tab
                        }
                        None => browser.new_tab()?,
                    };
                    return Self::with_tab(browser, tab, options);
                }
                Err(e) => warn!("[Hands] Could not attach ({:#}). Launching Chrome instead.", e),
            }
        }

        let launch = LaunchOptions {
            headless: options.headless,
            path: options.chrome_path.clone(),
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-infobars"),
            ],
            idle_browser_timeout: options.idle_timeout,
            ..Default::default()
        };

        info!(
            "[Hands] Starting Chrome ({})...",
            if options.headless { "headless" } else { "headed" }
        );
        let browser = Browser::new(launch).context("Browser launch failed")?;
        let tab = browser.new_tab()?;
        Self::with_tab(browser, tab, options)
    }

    fn with_tab(browser: Browser, tab: Arc<Tab>, options: &BrowserOptions) -> Result<Self> {
        tab.set_default_timeout(options.navigation_timeout);
        let events = EventLog::new();
        install_monitors(&tab, events.clone(), options.dialog_pause)?;
        info!("[Hands] Chrome ready.");
        Ok(Self {
            browser: Some(browser),
            tab,
            events,
        })
    }

    fn first_match(&self, locator: &Locator) -> DriverResult<Element<'_>> {
        let found = match locator {
            Locator::Css(selector) => self.tab.find_element(selector),
            Locator::Text(_) => self.tab.find_element_by_xpath(&locator.to_xpath()),
        };
        found.map_err(|_| DriverError::NotFound(locator.to_string()))
    }

    /// Like [`Self::first_match`] but polls until `timeout` for the element
    /// to appear.
    fn first_match_within(
        &self,
        locator: &Locator,
        timeout: Duration,
    ) -> DriverResult<Element<'_>> {
        let found = match locator {
            Locator::Css(selector) => {
                self.tab.wait_for_element_with_custom_timeout(selector, timeout)
            }
            Locator::Text(_) => self
                .tab
                .wait_for_xpath_with_custom_timeout(&locator.to_xpath(), timeout),
        };
        found.map_err(|_| DriverError::NotFound(locator.to_string()))
    }

    fn ensure_open(&self) -> DriverResult<()> {
        if self.browser.is_some() {
            Ok(())
        } else {
            Err(DriverError::Closed)
        }
    }
}

fn backend(e: anyhow::Error) -> DriverError {
    DriverError::Backend(format!("{e:#}"))
}

impl PageDriver for ChromeDriver {
    fn name(&self) -> &str {
        "chrome"
    }

    fn capabilities(&self) -> &[Capability] {
        CHROME_CAPABILITIES
    }

    fn navigate(&mut self, url: &str) -> DriverResult<()> {
        self.ensure_open()?;
        self.tab
            .navigate_to(url)
            .and_then(|tab| tab.wait_until_navigated())
            .map(|_| ())
            .map_err(|e| DriverError::Navigation(format!("{e:#}")))
    }

    fn current_url(&mut self) -> DriverResult<String> {
        self.ensure_open()?;
        Ok(self.tab.get_url())
    }

    fn title(&mut self) -> DriverResult<String> {
        self.ensure_open()?;
        self.tab.get_title().map_err(backend)
    }

    fn content(&mut self) -> DriverResult<String> {
        self.ensure_open()?;
        self.tab.get_content().map_err(backend)
    }

    fn click(&mut self, locator: &Locator, timeout: Duration) -> DriverResult<()> {
        self.ensure_open()?;
        let element = self.first_match_within(locator, timeout)?;
        element.click().map(|_| ()).map_err(backend)
    }

    fn evaluate(&mut self, script: &str) -> DriverResult<Value> {
        self.ensure_open()?;
        let result = self
            .tab
            .evaluate(script, false)
            .map_err(|e| DriverError::Script(format!("{e:#}")))?;
        Ok(result.value.unwrap_or(Value::Null))
    }

    fn call_on_element(
        &mut self,
        locator: &Locator,
        function: &str,
        args: Vec<Value>,
    ) -> DriverResult<Value> {
        self.ensure_open()?;
        let element = self.first_match(locator)?;
        let result = element
            .call_js_fn(function, args, false)
            .map_err(|e| DriverError::Script(format!("{e:#}")))?;
        Ok(result.value.unwrap_or(Value::Null))
    }

    fn events(&self) -> Option<&EventLog> {
        Some(&self.events)
    }

    fn close(&mut self) -> DriverResult<()> {
        if let Some(browser) = self.browser.take() {
            info!("[Hands] Closing browser.");
            drop(browser);
        }
        Ok(())
    }
}

impl Drop for ChromeDriver {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Record dialogs and console errors into `events`. A dialog blocks the page
/// until it is handled, so acceptance happens on a short-lived thread after
/// the message has been stored.
fn install_monitors(tab: &Arc<Tab>, events: EventLog, dialog_pause: Duration) -> Result<()> {
    tab.enable_runtime().context("Failed to enable Runtime domain")?;
    tab.enable_log().context("Failed to enable Log domain")?;

    let weak_tab: Weak<Tab> = Arc::downgrade(tab);
    tab.add_event_listener(Arc::new(move |event: &Event| match event {
        Event::PageJavascriptDialogOpening(dialog) => {
            let params = serde_json::to_value(&dialog.params).unwrap_or_default();
            let kind = params["type"].as_str().unwrap_or("dialog").to_string();
            let message = params["message"].as_str().unwrap_or_default().to_string();
            info!("[Hands] [DIALOG {}] {}", kind, message);
            events.record_dialog(kind, message);
            accept_dialog(weak_tab.clone(), dialog_pause);
        }
        Event::RuntimeConsoleAPICalled(call) => {
            let params = serde_json::to_value(&call.params).unwrap_or_default();
            let level = params["type"].as_str().unwrap_or_default();
            if level == "error" || level == "warning" {
                events.record_console(&console_text(&params["args"]));
            }
        }
        Event::RuntimeExceptionThrown(thrown) => {
            let params = serde_json::to_value(&thrown.params).unwrap_or_default();
            let details = &params["exceptionDetails"];
            let text = details["exception"]["description"]
                .as_str()
                .or_else(|| details["text"].as_str())
                .unwrap_or("uncaught exception");
            events.record_console(text);
        }
        Event::LogEntryAdded(entry) => {
            let params = serde_json::to_value(&entry.params).unwrap_or_default();
            let level = params["entry"]["level"].as_str().unwrap_or_default();
            if level == "error" || level == "warning" {
                events.record_console(params["entry"]["text"].as_str().unwrap_or_default());
            }
        }
        _ => {}
    }))
    .context("Failed to install page monitors")?;

    Ok(())
}

fn accept_dialog(tab: Weak<Tab>, pause: Duration) {
    std::thread::spawn(move || {
        if !pause.is_zero() {
            std::thread::sleep(pause);
        }
        let Some(tab) = tab.upgrade() else {
            return;
        };
        if let Err(e) = tab.call_method(Page::HandleJavaScriptDialog {
            accept: true,
            prompt_text: None,
        }) {
            warn!("[Hands] Failed to dismiss dialog: {:#}", e);
        }
    });
}

fn console_text(args: &Value) -> String {
    args.as_array()
        .map(|args| {
            args.iter()
                .map(|arg| match &arg["value"] {
                    Value::String(s) => s.clone(),
                    Value::Null => arg["description"].as_str().unwrap_or_default().to_string(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}
