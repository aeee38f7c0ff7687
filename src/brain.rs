use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::error::OracleError;
use crate::types::ChatMessage;

pub const DEFAULT_ORACLE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
pub const DEFAULT_MODEL: &str = "gemini-2.5-pro";
pub const DEFAULT_HISTORY_WINDOW: usize = 20;

pub const SYSTEM_PROMPT: &str = r#"You are a senior security QA engineer testing a web application that you own and have explicit permission to test.

Goal:
1) Find out whether the application is vulnerable to common input-handling issues (SQLi, reflected/stored XSS, auth/session flaws, broken access control).
2) Give a clear reproduction path and evidence for every finding.

Each turn you receive the result of your previous action, the current URL, the page HTML and the values currently typed into form fields.

Actions:
  click      - requires "selector"
  type_text  - requires "selector" and "text"; set "submit": true to submit the form that owns the field
  goto       - requires "url"; only to reach a page you have not tested yet
  get_html   - no extra fields

Selectors:
- Prefer text selectors such as "text=Sign In" or "text=Submit".
- Otherwise use a unique id (#id) or an attribute selector (input[name='q']). A selector used with type_text must match exactly one field.

Rules:
- Try several payload variations on each input before moving on.
- Test every form on a page, including edit buttons, before leaving it.
- After injecting a payload do not reload or navigate away. Submit right away with "submit": true on the last field you fill.
- Move on as soon as an exploit clearly does not work.

OUTPUT FORMAT
Return EXACTLY one JSON object per turn with a very brief "thinking" field.
{"thinking":"Try reflected XSS in the search box.","action":"type_text","selector":"input[name='q']","text":"<script>alert(1)</script>","submit":true}
{"thinking":"Open the login form.","action":"click","selector":"text=Sign In"}

When testing is finished, return the final report instead, using exactly this schema:
{
  "vulnerabilities": [
    {
      "title": "One-line summary of the finding",
      "severity": "critical | high | medium | low",
      "category": "SQL Injection | Cross-Site Scripting | CSRF Protection | Authentication | Authorization | Encryption | Input Validation | File Upload | Session Management | API Security",
      "details": {
        "description": "What you did and what happened (2-3 sentences).",
        "impact": "Why this matters to the business or user.",
        "recommendation": "One concrete fix or mitigation.",
        "codeSnippet": "Optional evidence snippet or repro command."
      }
    }
  ]
}
Every entry must include each field above and use one of the four severity strings exactly as written. Do not return any other JSON shape."#;

/// The decision service consulted once per step.
#[async_trait]
pub trait Oracle: Send {
    /// Send one observation and return the raw reply text.
    async fn ask(&mut self, message: &str) -> Result<String, OracleError>;
}

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
    /// Messages kept after the system prompt.
    pub history_window: usize,
}

impl OracleConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_ORACLE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            timeout: Duration::from_secs(120),
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }
}

/// Chat client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct ChatOracle {
    client: Client,
    config: OracleConfig,
    conversation: Vec<ChatMessage>,
}

impl ChatOracle {
    pub fn new(config: OracleConfig) -> Result<Self, OracleError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            config,
            conversation: vec![ChatMessage::new("system", SYSTEM_PROMPT)],
        })
    }

    pub fn conversation(&self) -> &[ChatMessage] {
        &self.conversation
    }

    fn trim_history(&mut self) {
        let keep = self.config.history_window;
        let excess = self.conversation.len().saturating_sub(keep + 1);
        if excess > 0 {
            self.conversation.drain(1..1 + excess);
        }
        // History must resume on a user turn.
        while self.conversation.len() > 2 && self.conversation[1].role == "assistant" {
            self.conversation.remove(1);
        }
    }

    async fn complete(&self) -> Result<String, OracleError> {
        let messages: Vec<Value> = self
            .conversation
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&json!({
                "model": self.config.model,
                "messages": messages,
                "temperature": self.config.temperature,
            }))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let json_resp: Value = serde_json::from_str(&body).unwrap_or(Value::Null);

        if !status.is_success() {
            let message = json_resp["error"]["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| body.chars().take(300).collect());
            warn!("[Brain] API error ({}): {}", status, message);
            return Err(OracleError::Api {
                status: status.as_u16(),
                message,
            });
        }

        json_resp["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| OracleError::EmptyResponse(body.chars().take(300).collect()))
    }
}

#[async_trait]
impl Oracle for ChatOracle {
    async fn ask(&mut self, message: &str) -> Result<String, OracleError> {
        self.conversation.push(ChatMessage::new("user", message));
        self.trim_history();

        match self.complete().await {
            Ok(content) => {
                debug!("[Brain] LLM says: {}", content);
                self.conversation.push(ChatMessage::new("assistant", content.clone()));
                Ok(content)
            }
            Err(e) => {
                // Keep user/assistant turns paired for the next attempt.
                self.conversation.pop();
                info!("[Brain] Oracle call failed: {}", e);
                Err(e)
            }
        }
    }
}
