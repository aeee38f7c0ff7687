use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single browser action the oracle asks the agent to perform.
///
/// Fields default to empty so a request with a missing argument still
/// deserializes; the executor answers it with a feedback line instead of
/// counting it as a parse failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionRequest {
    Goto {
        #[serde(default)]
        url: String,
    },
    Click {
        #[serde(default)]
        selector: String,
    },
    TypeText {
        #[serde(default)]
        selector: String,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        submit: bool,
    },
    GetHtml,
    /// Terminal turn: the oracle is done and hands over its findings.
    #[serde(skip)]
    Finish(FindingsReport),
}

impl ActionRequest {
    pub fn is_finish(&self) -> bool {
        matches!(self, ActionRequest::Finish(_))
    }

    /// Short one-line description used in logs and in the next observation.
    pub fn describe(&self) -> String {
        match self {
            ActionRequest::Goto { url } => format!("goto url={url:?}"),
            ActionRequest::Click { selector } => format!("click selector={selector:?}"),
            ActionRequest::TypeText {
                selector,
                text,
                submit,
            } => format!(
                "type_text selector={selector:?} text={:?} submit={submit}",
                text.as_deref().unwrap_or_default()
            ),
            ActionRequest::GetHtml => "get_html".to_string(),
            ActionRequest::Finish(report) => {
                format!("finish with {} finding(s)", report.len())
            }
        }
    }
}

/// One parsed oracle turn: the action plus the rationale that came with it.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub thinking: Option<String>,
    pub request: ActionRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub title: String,
    pub severity: Severity,
    pub category: String,
    pub details: VulnerabilityDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VulnerabilityDetails {
    pub description: String,
    pub impact: String,
    pub recommendation: String,
    #[serde(
        rename = "codeSnippet",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub code_snippet: Option<String>,
}

/// The terminal payload exactly as the oracle sent it.
///
/// Entries are kept as raw JSON so the persisted report is the oracle's
/// array verbatim; [`FindingsReport::findings`] gives the typed view of the
/// entries that match the schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindingsReport {
    entries: Vec<Value>,
}

impl FindingsReport {
    pub fn new(entries: Vec<Value>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[Value] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries that deserialize as a [`Vulnerability`]. Malformed entries are
    /// skipped here but still persisted.
    pub fn findings(&self) -> Vec<Vulnerability> {
        self.entries
            .iter()
            .filter_map(|entry| serde_json::from_value(entry.clone()).ok())
            .collect()
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({ "vulnerabilities": self.entries })
    }
}

/// What happened on the previous step, echoed back in the next observation.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub index: usize,
    pub action: String,
    pub feedback: String,
}

/// A message in the conversation history sent to the oracle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 5;
pub const OBSERVATION_HTML_MAX_CHARS: usize = 15_000;
pub const EVIDENCE_HTML_MAX_CHARS: usize = 3_000;
pub const CONSOLE_TAIL: usize = 5;
pub const PAGE_SIGNAL_LIMIT: usize = 5;

/// Longest prefix of `text` holding at most `max_chars` characters.
pub fn clip(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Prefix bare hosts with `https://`.
pub fn normalize_target(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with("http://")
        || trimmed.starts_with("https://")
        || trimmed.starts_with("file://")
        || trimmed.starts_with("data:")
        || trimmed.starts_with("about:")
    {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}
