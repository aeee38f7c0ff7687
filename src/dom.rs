use serde::Deserialize;
use serde_json::Value;

use crate::driver::Locator;

/// Summarises filled `input`/`textarea` values as `name="value"` pairs.
/// Password values are masked and every value is cut to 40 characters.
pub const FILLED_FIELDS_JS: &str = r#"
(() => {
  const filled = [];
  for (const el of document.querySelectorAll('input, textarea')) {
    const val = el.value;
    if (!val) continue;
    const id = el.name || el.id || el.type || 'input';
    const shown = el.type === 'password' ? '***' : val.substring(0, 40);
    filled.push(id + '=' + JSON.stringify(shown));
  }
  return filled.join(', ');
})()
"#;

/// Collects visible error banners plus the first reflected marker in the
/// body text. Returns a JSON array (as a string) of at most five entries.
pub const PAGE_SIGNALS_JS: &str = r#"
(() => {
  const markers = [];
  const selectors = [
    '.error', '.alert', '.warning', '.danger', '.flash',
    '[role="alert"]', '.notice', '.message', '.toast',
    '.notification', '.err', '.field-error', '.form-error',
  ];
  for (const sel of selectors) {
    for (const el of document.querySelectorAll(sel)) {
      const t = (el.textContent || '').trim();
      if (t && t.length < 500) markers.push(t.substring(0, 200));
    }
  }
  const body = document.body ? document.body.innerText : '';
  const lower = body.toLowerCase();
  const patterns = ['<script', 'onerror=', 'javascript:', 'sql', 'syntax',
                    'error', 'exception', 'stack trace', 'unexpected'];
  for (const p of patterns) {
    const idx = lower.indexOf(p);
    if (idx !== -1) {
      markers.push('REFLECTED: ...' + body.substring(Math.max(0, idx - 30), idx + 60) + '...');
      break;
    }
  }
  return JSON.stringify(markers.slice(0, 5));
})()
"#;

pub const OUTER_HTML_JS: &str =
    "document.documentElement ? document.documentElement.outerHTML : ''";

pub const LOCATION_JS: &str = "window.location.href";

pub const TITLE_JS: &str = "document.title";

/// Called with `this` bound to the target control. Sets the value through the
/// native setter so framework-managed inputs notice, then fires input/change.
pub const FILL_FN: &str = r#"
function(value) {
  this.scrollIntoView({block: 'center'});
  this.focus();
  let proto = null;
  if (this instanceof HTMLTextAreaElement) proto = HTMLTextAreaElement.prototype;
  else if (this instanceof HTMLInputElement) proto = HTMLInputElement.prototype;
  else if (this instanceof HTMLSelectElement) proto = HTMLSelectElement.prototype;
  const desc = proto ? Object.getOwnPropertyDescriptor(proto, 'value') : null;
  if (desc && desc.set) {
    desc.set.call(this, value);
  } else if (this.isContentEditable) {
    this.textContent = value;
  } else {
    throw new Error('element <' + this.tagName.toLowerCase() + '> cannot be filled');
  }
  this.dispatchEvent(new Event('input', {bubbles: true}));
  this.dispatchEvent(new Event('change', {bubbles: true}));
  return true;
}
"#;

pub const CLICK_FN: &str = r#"
function() {
  this.scrollIntoView({block: 'center'});
  this.click();
  return true;
}
"#;

/// Called with `this` bound to the control that was just filled. Only the
/// form owning that control is touched: its own submit control is clicked
/// when visible, otherwise the form is submitted natively.
pub const AUTO_SUBMIT_FN: &str = r#"
function() {
  const form = this.form || this.closest('form');
  if (!form) return JSON.stringify({status: 'no_form'});
  let btn = form.querySelector("input[type='submit'], button[type='submit'], input[type='image']");
  if (!btn) btn = form.querySelector("button:not([type='button']):not([type='reset'])");
  if (btn && btn.offsetParent !== null) {
    btn.scrollIntoView({behavior: 'instant', block: 'center'});
    btn.click();
    const label = (btn.textContent || btn.value || 'submit').trim();
    return JSON.stringify({status: 'clicked', label: label});
  }
  if (typeof form.requestSubmit === 'function') {
    try { form.requestSubmit(); } catch (e) { form.submit(); }
  } else {
    form.submit();
  }
  return JSON.stringify({status: 'submitted'});
}
"#;

/// Result of [`AUTO_SUBMIT_FN`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Clicked { label: String },
    Submitted,
    NoForm,
}

impl SubmitOutcome {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(raw) => serde_json::from_str(raw).ok(),
            other => serde_json::from_value(other.clone()).ok(),
        }
    }
}

/// JS expression yielding every element the locator matches, as an array.
pub fn matches_expression(locator: &Locator) -> String {
    match locator {
        Locator::Css(selector) => format!(
            "Array.from(document.querySelectorAll({}))",
            js_string(selector)
        ),
        Locator::Text(_) => format!(
            "(() => {{ const r = document.evaluate({}, document, null, \
             XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null); const out = []; \
             for (let i = 0; i < r.snapshotLength; i++) out.push(r.snapshotItem(i)); \
             return out; }})()",
            js_string(&locator.to_xpath())
        ),
    }
}

pub fn count_expression(locator: &Locator) -> String {
    format!("{}.length", matches_expression(locator))
}

/// True when the first match is rendered and not hidden.
pub fn visible_expression(locator: &Locator) -> String {
    format!(
        "(() => {{ const el = {}[0]; if (!el) return false; \
         const s = getComputedStyle(el); \
         if (s.display === 'none' || s.visibility === 'hidden') return false; \
         const r = el.getBoundingClientRect(); return r.width > 0 && r.height > 0; }})()",
        matches_expression(locator)
    )
}

/// Apply `function` to the first match with `args`, for drivers that can
/// evaluate scripts but cannot call functions on a resolved element.
pub fn element_call_expression(locator: &Locator, function: &str, args: &[Value]) -> String {
    let args = Value::Array(args.to_vec());
    format!(
        "(() => {{ const el = {}[0]; if (!el) throw new Error('no element matches ' + {}); \
         return ({}).apply(el, {}); }})()",
        matches_expression(locator),
        js_string(&locator.to_string()),
        function.trim(),
        args
    )
}

fn js_string(text: &str) -> String {
    Value::from(text).to_string()
}
