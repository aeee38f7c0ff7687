//! The persisted findings report and its status reader.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::types::FindingsReport;

pub const DEFAULT_REPORT_PATH: &str = "results/scan_results.json";

pub fn default_report_path() -> PathBuf {
    PathBuf::from(DEFAULT_REPORT_PATH)
}

/// Write `{"vulnerabilities": [...]}` as pretty JSON, creating parent
/// directories as needed.
pub fn write_report(path: &Path, report: &FindingsReport) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_string_pretty(&report.to_json())?;
    fs::write(path, body)
}

/// Remove a report left over from an earlier run.
pub fn clear_report(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReportStatus {
    Pending,
    Complete(Value),
    Error(String),
}

impl ReportStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ReportStatus::Pending => "pending",
            ReportStatus::Complete(_) => "complete",
            ReportStatus::Error(_) => "error",
        }
    }
}

pub fn read_status(path: &Path) -> ReportStatus {
    let body = match fs::read_to_string(path) {
        Ok(body) => body,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return ReportStatus::Pending,
        Err(e) => return ReportStatus::Error(e.to_string()),
    };
    match serde_json::from_str(&body) {
        Ok(value) => ReportStatus::Complete(value),
        Err(e) => ReportStatus::Error(e.to_string()),
    }
}
