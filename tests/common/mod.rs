#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use mayhem_agent::brain::Oracle;
use mayhem_agent::dom;
use mayhem_agent::driver::{Capability, EventLog, Locator, PageDriver};
use mayhem_agent::error::{DriverError, DriverResult, OracleError};
use mayhem_agent::evidence::EvidenceSettings;
use mayhem_agent::executor::ActionSettings;

#[derive(Debug, Clone, Default)]
pub struct FakeElement {
    pub selector: String,
    pub form: Option<String>,
    pub visible: bool,
    pub value: String,
    pub password: bool,
    /// Alert raised when the element is clicked.
    pub alert: Option<String>,
}

impl FakeElement {
    pub fn new(selector: &str) -> Self {
        Self {
            selector: selector.to_string(),
            visible: true,
            ..Self::default()
        }
    }

    pub fn in_form(mut self, form: &str) -> Self {
        self.form = Some(form.to_string());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn password(mut self) -> Self {
        self.password = true;
        self
    }

    pub fn alerting(mut self, message: &str) -> Self {
        self.alert = Some(message.to_string());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeForm {
    pub name: String,
    pub submit_label: Option<String>,
    pub submitted: bool,
}

/// In-memory page shared between a [`FakeDriver`] and the test inspecting it.
#[derive(Debug, Default)]
pub struct FakePage {
    pub url: String,
    pub title: String,
    pub html: String,
    pub elements: Vec<FakeElement>,
    pub forms: Vec<FakeForm>,
    pub signals: Vec<String>,
    pub unreachable: Vec<String>,
    pub log: Vec<String>,
    pub closed: bool,
}

impl FakePage {
    fn matching(&self, locator: &Locator) -> impl Iterator<Item = &FakeElement> {
        let key = locator.to_string();
        self.elements.iter().filter(move |e| e.selector == key)
    }

    fn first_mut(&mut self, locator: &Locator) -> Option<&mut FakeElement> {
        let key = locator.to_string();
        self.elements.iter_mut().find(|e| e.selector == key)
    }

    fn filled_summary(&self) -> String {
        self.elements
            .iter()
            .filter(|e| !e.value.is_empty())
            .map(|e| {
                let shown = if e.password {
                    "***".to_string()
                } else {
                    e.value.chars().take(40).collect()
                };
                format!("{}={}", e.selector.trim_start_matches('#'), json!(shown))
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn form(&self, name: &str) -> Option<&FakeForm> {
        self.forms.iter().find(|f| f.name == name)
    }

    pub fn value_of(&self, selector: &str) -> Option<&str> {
        self.elements
            .iter()
            .find(|e| e.selector == selector)
            .map(|e| e.value.as_str())
    }
}

#[derive(Clone)]
pub struct PageHandle(Arc<Mutex<FakePage>>);

impl PageHandle {
    pub fn lock(&self) -> MutexGuard<'_, FakePage> {
        self.0.lock().unwrap()
    }
}

/// A scripted backend implementing every capability natively.
pub struct FakeDriver {
    page: Arc<Mutex<FakePage>>,
    events: EventLog,
}

impl FakeDriver {
    pub fn new(page: FakePage) -> (Self, PageHandle) {
        let page = Arc::new(Mutex::new(page));
        let handle = PageHandle(page.clone());
        (
            Self {
                page,
                events: EventLog::new(),
            },
            handle,
        )
    }

    pub fn event_log(&self) -> EventLog {
        self.events.clone()
    }

    fn page(&self) -> MutexGuard<'_, FakePage> {
        self.page.lock().unwrap()
    }

    fn open_page(&self) -> DriverResult<MutexGuard<'_, FakePage>> {
        let page = self.page();
        if page.closed {
            Err(DriverError::Closed)
        } else {
            Ok(page)
        }
    }
}

const ALL: &[Capability] = &[
    Capability::Navigate,
    Capability::CurrentUrl,
    Capability::Title,
    Capability::Content,
    Capability::Query,
    Capability::WaitVisible,
    Capability::Click,
    Capability::Fill,
    Capability::Evaluate,
    Capability::ElementScript,
    Capability::Events,
];

impl PageDriver for FakeDriver {
    fn name(&self) -> &str {
        "fake"
    }

    fn capabilities(&self) -> &[Capability] {
        ALL
    }

    fn navigate(&mut self, url: &str) -> DriverResult<()> {
        let mut page = self.open_page()?;
        page.log.push(format!("goto {url}"));
        if page.unreachable.iter().any(|u| u == url) {
            return Err(DriverError::Navigation(format!("net::ERR_NAME_NOT_RESOLVED at {url}")));
        }
        page.url = url.to_string();
        Ok(())
    }

    fn current_url(&mut self) -> DriverResult<String> {
        Ok(self.open_page()?.url.clone())
    }

    fn title(&mut self) -> DriverResult<String> {
        Ok(self.open_page()?.title.clone())
    }

    fn content(&mut self) -> DriverResult<String> {
        Ok(self.open_page()?.html.clone())
    }

    fn count(&mut self, locator: &Locator) -> DriverResult<usize> {
        Ok(self.open_page()?.matching(locator).count())
    }

    fn wait_visible(&mut self, locator: &Locator, timeout: Duration) -> DriverResult<()> {
        let page = self.open_page()?;
        match page.matching(locator).next() {
            Some(element) if element.visible => Ok(()),
            Some(_) => Err(DriverError::Timeout {
                what: format!("'{locator}' to be visible"),
                timeout,
            }),
            None => Err(DriverError::NotFound(locator.to_string())),
        }
    }

    fn click(&mut self, locator: &Locator, _timeout: Duration) -> DriverResult<()> {
        let mut page = self.open_page()?;
        let alert = page
            .first_mut(locator)
            .ok_or_else(|| DriverError::NotFound(locator.to_string()))?
            .alert
            .clone();
        page.log.push(format!("click {locator}"));
        if let Some(message) = alert {
            self.events.record_dialog("alert", message);
        }
        Ok(())
    }

    fn fill(&mut self, locator: &Locator, text: &str) -> DriverResult<()> {
        let mut page = self.open_page()?;
        let element = page
            .first_mut(locator)
            .ok_or_else(|| DriverError::NotFound(locator.to_string()))?;
        element.value = text.to_string();
        page.log.push(format!("fill {locator}"));
        Ok(())
    }

    fn evaluate(&mut self, script: &str) -> DriverResult<Value> {
        let page = self.open_page()?;
        if script == dom::PAGE_SIGNALS_JS {
            let signals = serde_json::to_string(&page.signals).unwrap();
            Ok(Value::String(signals))
        } else if script == dom::FILLED_FIELDS_JS {
            Ok(Value::String(page.filled_summary()))
        } else {
            Err(DriverError::Script(format!("unexpected script: {script}")))
        }
    }

    /// Stands in for the browser running `dom::AUTO_SUBMIT_FN`: a form with a
    /// `submit_label` behaves as if it had a visible submit button, any other
    /// form is submitted directly. Button matching and visibility are only
    /// exercised against Chrome in `browser_forms.rs`.
    fn call_on_element(
        &mut self,
        locator: &Locator,
        function: &str,
        _args: Vec<Value>,
    ) -> DriverResult<Value> {
        if function != dom::AUTO_SUBMIT_FN {
            return Err(DriverError::Script("unexpected element script".into()));
        }
        let mut page = self.open_page()?;
        let form_name = page
            .first_mut(locator)
            .ok_or_else(|| DriverError::NotFound(locator.to_string()))?
            .form
            .clone();
        let Some(form_name) = form_name else {
            return Ok(Value::String(json!({"status": "no_form"}).to_string()));
        };
        let form = page
            .forms
            .iter_mut()
            .find(|f| f.name == form_name)
            .ok_or_else(|| DriverError::Script(format!("form {form_name} missing")))?;
        form.submitted = true;
        let outcome = match &form.submit_label {
            Some(label) => json!({"status": "clicked", "label": label}),
            None => json!({"status": "submitted"}),
        };
        page.log.push(format!("submit {form_name}"));
        Ok(Value::String(outcome.to_string()))
    }

    fn events(&self) -> Option<&EventLog> {
        Some(&self.events)
    }

    fn close(&mut self) -> DriverResult<()> {
        let mut page = self.page();
        page.closed = true;
        page.log.push("close".into());
        Ok(())
    }
}

/// Two independent forms: a search form with a submit button and a comment
/// form without one.
pub fn two_form_page() -> FakePage {
    FakePage {
        url: "https://shop.test/".into(),
        title: "Shop".into(),
        html: "<html><body><form id=search>...</form><form id=comment>...</form></body></html>"
            .into(),
        elements: vec![
            FakeElement::new("#q").in_form("search"),
            FakeElement::new("#comment").in_form("comment"),
            FakeElement::new("#newsletter"),
            FakeElement::new("#password").in_form("search").password(),
            FakeElement::new("input.tag").in_form("comment"),
            FakeElement::new("input.tag").in_form("comment"),
            FakeElement::new("text=Preview").alerting("1"),
            FakeElement::new("#later").hidden(),
        ],
        forms: vec![
            FakeForm {
                name: "search".into(),
                submit_label: Some("Search".into()),
                submitted: false,
            },
            FakeForm {
                name: "comment".into(),
                submit_label: None,
                submitted: false,
            },
        ],
        ..FakePage::default()
    }
}

/// Action settings without settle delays.
pub fn fast_actions() -> ActionSettings {
    ActionSettings {
        element_timeout: Duration::from_millis(50),
        click_settle: Duration::ZERO,
        pre_submit_delay: Duration::ZERO,
        type_settle: Duration::ZERO,
        evidence: EvidenceSettings::default(),
    }
}

/// Replies with canned text and records every observation it receives.
pub struct ScriptedOracle {
    replies: VecDeque<Result<String, OracleError>>,
    seen: Arc<Mutex<Vec<String>>>,
}

impl ScriptedOracle {
    pub fn new<I, S>(replies: I) -> (Self, Arc<Mutex<Vec<String>>>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                replies: replies.into_iter().map(|r| Ok(r.into())).collect(),
                seen: seen.clone(),
            },
            seen,
        )
    }

    pub fn push_error(&mut self, error: OracleError) {
        self.replies.push_back(Err(error));
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    async fn ask(&mut self, message: &str) -> Result<String, OracleError> {
        self.seen.lock().unwrap().push(message.to_string());
        self.replies
            .pop_front()
            .unwrap_or_else(|| Err(OracleError::EmptyResponse("script exhausted".into())))
    }
}
