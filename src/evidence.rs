//! Side-effect snapshots taken right after an action.
//!
//! Each probe is independent and yields a [`Probe`]; a failing probe is
//! logged and left out of the rendered text so the other probes still report.

use tracing::debug;

use crate::dom;
use crate::driver::{self, PageDriver};
use crate::types::{CONSOLE_TAIL, EVIDENCE_HTML_MAX_CHARS, PAGE_SIGNAL_LIMIT, clip};

pub const NO_EFFECTS: &str = "No notable side-effects observed.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    Found(String),
    Empty,
    Failed(String),
}

impl Probe {
    fn found(text: String) -> Self {
        if text.is_empty() {
            Probe::Empty
        } else {
            Probe::Found(text)
        }
    }

    fn prefixed(self, prefix: &str) -> Self {
        match self {
            Probe::Found(text) => Probe::Found(format!("{prefix}{text}")),
            other => other,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Probe::Found(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Probe::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evidence {
    pub dialogs: Probe,
    pub console: Probe,
    pub navigation: Probe,
    pub title: Probe,
    pub signals: Probe,
    pub html: Probe,
}

impl Evidence {
    pub fn probes(&self) -> [(&'static str, &Probe); 6] {
        [
            ("dialogs", &self.dialogs),
            ("console", &self.console),
            ("navigation", &self.navigation),
            ("title", &self.title),
            ("signals", &self.signals),
            ("html", &self.html),
        ]
    }

    pub fn has_signal(&self) -> bool {
        self.probes().iter().any(|(_, probe)| probe.text().is_some())
    }

    /// Human-readable evidence, never empty.
    pub fn render(&self) -> String {
        let lines: Vec<&str> = self
            .probes()
            .iter()
            .filter_map(|(_, probe)| probe.text())
            .collect();
        if lines.is_empty() {
            NO_EFFECTS.to_string()
        } else {
            lines.join("\n")
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EvidenceSettings {
    pub console_tail: usize,
    pub signal_limit: usize,
    pub html_chars: usize,
}

impl Default for EvidenceSettings {
    fn default() -> Self {
        Self {
            console_tail: CONSOLE_TAIL,
            signal_limit: PAGE_SIGNAL_LIMIT,
            html_chars: EVIDENCE_HTML_MAX_CHARS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EvidenceCollector {
    settings: EvidenceSettings,
}

impl EvidenceCollector {
    pub fn new(settings: EvidenceSettings) -> Self {
        Self { settings }
    }

    /// Snapshot the page and empty the dialog and console buffers.
    pub fn collect(&self, driver: &mut dyn PageDriver, url_before: &str) -> Evidence {
        let events = driver::drain_events(driver);

        let dialogs = Probe::found(
            events
                .dialogs
                .iter()
                .map(|d| format!("[{}] {}", d.kind, d.message))
                .collect::<Vec<_>>()
                .join("; "),
        )
        .prefixed("JS DIALOGS triggered: ");

        let tail_start = events.console.len().saturating_sub(self.settings.console_tail);
        let console =
            Probe::found(events.console[tail_start..].join("; ")).prefixed("Console errors: ");

        let navigation = match driver::page_url(driver) {
            Ok(url) if url != url_before => {
                Probe::Found(format!("URL changed: {url_before} -> {url}"))
            }
            Ok(_) => Probe::Empty,
            Err(e) => Probe::Failed(e.to_string()),
        };

        let title = match driver::page_title(driver) {
            Ok(title) => Probe::found(title).prefixed("Page title: "),
            Err(e) => Probe::Failed(e.to_string()),
        };

        let signals = match driver::evaluate_string(driver, dom::PAGE_SIGNALS_JS) {
            Ok(raw) => match serde_json::from_str::<Vec<String>>(&raw) {
                Ok(markers) => Probe::found(
                    markers
                        .iter()
                        .take(self.settings.signal_limit)
                        .map(|m| clip(m, 200))
                        .collect::<Vec<_>>()
                        .join(" | "),
                )
                .prefixed("Page signals: "),
                Err(e) => Probe::Failed(format!("unreadable page signals: {e}")),
            },
            Err(e) => Probe::Failed(e.to_string()),
        };

        let html = match driver::page_content(driver) {
            Ok(html) if !html.is_empty() => Probe::Found(format!(
                "HTML after action (first {} chars):\n{}",
                self.settings.html_chars,
                clip(&html, self.settings.html_chars)
            )),
            Ok(_) => Probe::Empty,
            Err(e) => Probe::Failed(e.to_string()),
        };

        let evidence = Evidence {
            dialogs,
            console,
            navigation,
            title,
            signals,
            html,
        };
        for (name, probe) in evidence.probes() {
            if let Probe::Failed(reason) = probe {
                debug!("[Evidence] {} probe failed: {}", name, reason);
            }
        }
        evidence
    }
}
