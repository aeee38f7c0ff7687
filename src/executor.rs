use std::time::Duration;

use tracing::{debug, info};

use crate::dom::{self, SubmitOutcome};
use crate::driver::{self, Locator, PageDriver};
use crate::error::{DriverError, DriverResult};
use crate::evidence::{EvidenceCollector, EvidenceSettings};
use crate::types::{ActionRequest, clip};

#[derive(Debug, Clone, Copy)]
pub struct ActionSettings {
    /// Bound on waiting for an element to become visible, and on the click itself.
    pub element_timeout: Duration,
    /// Pause after a click so handlers and navigations can fire.
    pub click_settle: Duration,
    /// Pause between filling a field and submitting its form.
    pub pre_submit_delay: Duration,
    /// Pause after typing (and submitting) before evidence is collected.
    pub type_settle: Duration,
    pub evidence: EvidenceSettings,
}

impl Default for ActionSettings {
    fn default() -> Self {
        Self {
            element_timeout: Duration::from_secs(5),
            click_settle: Duration::from_millis(1000),
            pre_submit_delay: Duration::from_millis(300),
            type_settle: Duration::from_millis(500),
            evidence: EvidenceSettings::default(),
        }
    }
}

/// Runs one [`ActionRequest`] against the page and describes what happened.
///
/// Every outcome, failures included, comes back as feedback text for the
/// oracle; a bad selector never aborts the run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ActionExecutor {
    settings: ActionSettings,
    collector: EvidenceCollector,
}

impl ActionExecutor {
    pub fn new(settings: ActionSettings) -> Self {
        Self {
            settings,
            collector: EvidenceCollector::new(settings.evidence),
        }
    }

    pub fn settings(&self) -> &ActionSettings {
        &self.settings
    }

    pub fn execute(&self, driver: &mut dyn PageDriver, action: &ActionRequest) -> String {
        debug!("[Executor] {}", action.describe());
        match action {
            ActionRequest::Goto { url } => self.goto(driver, url),
            ActionRequest::GetHtml => self.get_html(driver),
            ActionRequest::Click { selector } => self.click(driver, selector),
            ActionRequest::TypeText {
                selector,
                text,
                submit,
            } => self.type_text(driver, selector, text.as_deref(), *submit),
            ActionRequest::Finish(report) => {
                format!("Nothing to execute: findings report with {} entries", report.len())
            }
        }
    }

    pub fn goto(&self, driver: &mut dyn PageDriver, url: &str) -> String {
        if url.trim().is_empty() {
            return "Error: 'url' is required for goto".to_string();
        }
        let url_before = current_url(driver);
        match driver::navigate(driver, url.trim()) {
            Ok(()) => {
                let evidence = self.collector.collect(driver, &url_before).render();
                format!("Navigated to {}\n{}", current_url(driver), evidence)
            }
            Err(e) => format!("Navigation to '{url}' failed: {e}"),
        }
    }

    pub fn get_html(&self, driver: &mut dyn PageDriver) -> String {
        let length = driver::page_content(driver)
            .map(|html| html.chars().count())
            .unwrap_or(0);
        let filled = filled_fields(driver);
        if filled.is_empty() {
            format!("Got HTML ({length} chars)")
        } else {
            format!("Got HTML ({length} chars)\nCurrent input values: {filled}")
        }
    }

    pub fn click(&self, driver: &mut dyn PageDriver, selector: &str) -> String {
        if selector.trim().is_empty() {
            return "Error: 'selector' is required for click".to_string();
        }
        let locator = Locator::parse(selector);
        let url_before = current_url(driver);
        let timeout = self.settings.element_timeout;

        let clicked = driver::wait_visible(driver, &locator, timeout)
            .and_then(|()| driver::click_first(driver, &locator, timeout));
        if clicked.is_ok() {
            std::thread::sleep(self.settings.click_settle);
        }

        let evidence = self.collector.collect(driver, &url_before).render();
        match clicked {
            Ok(()) => {
                info!("[Executor] Clicked '{}'", selector);
                format!("Clicked '{selector}'.\n{evidence}")
            }
            Err(e) => format!("Click failed on '{selector}': {e}\n{evidence}"),
        }
    }

    pub fn type_text(
        &self,
        driver: &mut dyn PageDriver,
        selector: &str,
        text: Option<&str>,
        submit: bool,
    ) -> String {
        let (false, Some(text)) = (selector.trim().is_empty(), text) else {
            return "Error: 'selector' and 'text' are required for type_text".to_string();
        };
        let locator = Locator::parse(selector);
        let url_before = current_url(driver);

        let typed = self.fill_and_submit(driver, &locator, text, submit);
        std::thread::sleep(self.settings.type_settle);
        let evidence = self.collector.collect(driver, &url_before).render();

        match typed {
            Ok(summary) => format!("{summary}\n{evidence}"),
            Err(DriverError::Ambiguous { count, .. }) => format!(
                "Type failed on '{selector}': selector is ambiguous ({count} elements match); \
                 use a selector that matches exactly one field.\n{evidence}"
            ),
            Err(e) => format!("Type failed on '{selector}': {e}\n{evidence}"),
        }
    }

    fn fill_and_submit(
        &self,
        driver: &mut dyn PageDriver,
        locator: &Locator,
        text: &str,
        submit: bool,
    ) -> DriverResult<String> {
        driver::wait_visible(driver, locator, self.settings.element_timeout)?;
        driver::fill_unique(driver, locator, text)?;
        let mut summary = format!("Typed '{}' into '{}'.", clip(text, 200), locator);

        if submit {
            std::thread::sleep(self.settings.pre_submit_delay);
            let result = driver::call_on_element(driver, locator, dom::AUTO_SUBMIT_FN, Vec::new())?;
            match SubmitOutcome::from_value(&result) {
                Some(SubmitOutcome::Clicked { label }) => {
                    summary.push_str(&format!(" Clicked form submit: {label}."));
                }
                Some(SubmitOutcome::Submitted) => summary.push_str(" Submitted form via JS."),
                Some(SubmitOutcome::NoForm) => summary.push_str(
                    " No enclosing form found; payload injected but not submitted.",
                ),
                None => {
                    return Err(DriverError::Script(format!(
                        "unexpected auto-submit result: {result}"
                    )));
                }
            }
        }
        Ok(summary)
    }
}

/// Current URL, or an empty string when the backend cannot tell.
pub fn current_url(driver: &mut dyn PageDriver) -> String {
    driver::page_url(driver).unwrap_or_default()
}

/// `name="value"` pairs for every filled field, or an empty string.
pub fn filled_fields(driver: &mut dyn PageDriver) -> String {
    driver::evaluate_string(driver, dom::FILLED_FIELDS_JS).unwrap_or_default()
}
