//! Turns free-text oracle replies into a [`Decision`].
//!
//! The oracle is a text generator, not a structured-output API: replies may
//! arrive fenced in markdown or preceded by prose. The parser strips one
//! fence, then tries the whole text and finally only its last line as JSON.

use serde_json::{Map, Value};

use crate::error::ParseError;
use crate::types::{ActionRequest, Decision, FindingsReport, clip};

/// Action names accepted from the oracle. `input_text` is an alias of `type_text`.
pub const ALLOWED_ACTIONS: &[&str] = &["get_html", "click", "type_text", "input_text", "goto"];

const PREVIEW_CHARS: usize = 500;

pub fn parse_response(raw: &str) -> Result<Decision, ParseError> {
    let cleaned = strip_code_fence(raw);
    let last_line = cleaned.lines().last().map(str::trim).unwrap_or_default();

    // A malformed action is reported only if no later candidate parses.
    let mut rejected = None;
    for candidate in [cleaned, last_line] {
        let Ok(Value::Object(object)) = serde_json::from_str::<Value>(candidate) else {
            continue;
        };
        match accept(object) {
            Ok(Some(decision)) => return Ok(decision),
            Ok(None) => {}
            Err(e) => {
                rejected.get_or_insert(e);
            }
        }
    }

    Err(rejected.unwrap_or_else(|| ParseError::Unrecognized {
        preview: clip(raw, PREVIEW_CHARS).to_string(),
    }))
}

/// Remove one leading fence (with its language tag) and one trailing fence.
pub fn strip_code_fence(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        text = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

/// `Ok(None)` means the object is JSON but carries nothing we recognise.
fn accept(mut object: Map<String, Value>) -> Result<Option<Decision>, ParseError> {
    let thinking = object
        .get("thinking")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(String::from);

    if let Some(report) = object.get("vulnerabilities") {
        let entries = match report {
            Value::Array(entries) => entries.clone(),
            Value::Object(_) => vec![report.clone()],
            other => {
                return Err(ParseError::MalformedReport(format!(
                    "'vulnerabilities' must be an array, got {other}"
                )));
            }
        };
        return Ok(Some(Decision {
            thinking,
            request: ActionRequest::Finish(FindingsReport::new(entries)),
        }));
    }

    // A lone vulnerability object without the wrapping array.
    if object.contains_key("severity") && !object.contains_key("action") {
        let mut entry = object;
        entry.remove("thinking");
        return Ok(Some(Decision {
            thinking,
            request: ActionRequest::Finish(FindingsReport::new(vec![Value::Object(entry)])),
        }));
    }

    let Some(action) = object.get("action").and_then(Value::as_str).map(String::from) else {
        return Ok(None);
    };
    if !ALLOWED_ACTIONS.contains(&action.as_str()) {
        return Ok(None);
    }
    if action == "input_text" {
        object.insert("action".into(), Value::from("type_text"));
    }

    let request: ActionRequest =
        serde_json::from_value(Value::Object(object)).map_err(|e| ParseError::InvalidAction {
            action: action.clone(),
            reason: e.to_string(),
        })?;

    Ok(Some(Decision { thinking, request }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn type_text(selector: &str, text: &str) -> ActionRequest {
        ActionRequest::TypeText {
            selector: selector.into(),
            text: Some(text.into()),
            submit: false,
        }
    }

    #[test]
    fn parses_fenced_type_text() {
        let raw = "```json\n{\"action\":\"type_text\",\"selector\":\"#q\",\"text\":\"x\"}\n```";
        let decision = parse_response(raw).unwrap();
        assert_eq!(decision.request, type_text("#q", "x"));
        assert_eq!(decision.thinking, None);
    }

    #[test]
    fn fences_and_whitespace_do_not_change_the_action() {
        let bodies = [
            r##"{"thinking":"look","action":"click","selector":"text=Sign In"}"##,
            r##"{"action":"goto","url":"https://example.com/search?q=1"}"##,
            r##"{"action":"get_html"}"##,
            r##"{"action":"type_text","selector":"input[name='q']","text":"<b>","submit":true}"##,
        ];
        for body in bodies {
            let plain = parse_response(body).unwrap();
            for wrapped in [
                format!("```json\n{body}\n```"),
                format!("```\n{body}\n```"),
                format!("{body}\n\n   \t"),
                format!("```json\n{body}\n```  \n"),
            ] {
                assert_eq!(parse_response(&wrapped).unwrap(), plain, "wrapped: {wrapped:?}");
            }
        }
    }

    #[test]
    fn input_text_is_an_alias_for_type_text() {
        let a = parse_response(r##"{"action":"input_text","selector":"#q","text":"x"}"##).unwrap();
        let b = parse_response(r##"{"action":"type_text","selector":"#q","text":"x"}"##).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn falls_back_to_the_last_line_after_prose() {
        let raw = "I will click the login button now.\n{\"thinking\":\"login\",\"action\":\"click\",\"selector\":\"#login\"}";
        let decision = parse_response(raw).unwrap();
        assert_eq!(
            decision.request,
            ActionRequest::Click {
                selector: "#login".into()
            }
        );
        assert_eq!(decision.thinking.as_deref(), Some("login"));
    }

    #[test]
    fn prose_before_a_fenced_block_still_parses() {
        let raw = "Next step:\n```json\n{\"action\":\"get_html\"}\n```";
        assert_eq!(parse_response(raw).unwrap().request, ActionRequest::GetHtml);
    }

    #[test]
    fn vulnerabilities_end_the_run_even_with_thinking() {
        let raw = r#"{"thinking":"done","vulnerabilities":[{"title":"Reflected XSS","severity":"high","category":"Cross-Site Scripting","details":{"description":"d","impact":"i","recommendation":"r"}}]}"#;
        let decision = parse_response(raw).unwrap();
        assert_eq!(decision.thinking.as_deref(), Some("done"));
        let ActionRequest::Finish(report) = decision.request else {
            panic!("expected a findings report");
        };
        assert_eq!(report.len(), 1);
        assert_eq!(report.findings()[0].details.code_snippet, None);
    }

    #[test]
    fn report_wins_over_an_action_in_the_same_object() {
        let raw = r##"{"action":"click","selector":"#x","vulnerabilities":[]}"##;
        assert!(parse_response(raw).unwrap().request.is_finish());
    }

    #[test]
    fn single_vulnerability_object_is_wrapped() {
        let raw = r#"{"title":"SQLi","severity":"critical","category":"SQL Injection","details":{"description":"d","impact":"i","recommendation":"r"}}"#;
        let ActionRequest::Finish(report) = parse_response(raw).unwrap().request else {
            panic!("expected a findings report");
        };
        assert_eq!(report.entries()[0]["title"], json!("SQLi"));
    }

    #[test]
    fn unknown_actions_and_prose_are_rejected_with_a_preview() {
        let raw = format!("{{\"action\":\"screenshot\"}}\n{}", "x".repeat(900));
        match parse_response(&raw) {
            Err(ParseError::Unrecognized { preview }) => {
                assert_eq!(preview.chars().count(), 500);
                assert!(preview.starts_with("{\"action\":\"screenshot\"}"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(parse_response("I am not sure what to do.").is_err());
        assert!(parse_response("").is_err());
    }

    #[test]
    fn wrongly_typed_fields_are_invalid_actions() {
        let err = parse_response(r#"{"action":"click","selector":42}"#).unwrap_err();
        assert!(matches!(err, ParseError::InvalidAction { ref action, .. } if action == "click"));
    }

    #[test]
    fn a_bad_object_on_the_last_line_is_still_an_invalid_action() {
        let raw = "Trying the button next.\n{\"action\":\"click\",\"selector\":42}";
        let err = parse_response(raw).unwrap_err();
        assert!(matches!(err, ParseError::InvalidAction { ref action, .. } if action == "click"));
    }

    #[test]
    fn missing_arguments_still_parse() {
        let decision = parse_response(r#"{"action":"goto"}"#).unwrap();
        assert_eq!(decision.request, ActionRequest::Goto { url: String::new() });
    }

    #[test]
    fn one_line_fence_is_stripped() {
        assert_eq!(strip_code_fence("```json{\"a\":1}```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  {\"a\":1}  "), "{\"a\":1}");
    }
}
