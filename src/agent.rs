//! The step loop: observe, ask the oracle, parse, execute, repeat.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::brain::Oracle;
use crate::driver::{self, PageDriver};
use crate::error::AgentError;
use crate::executor::{self, ActionExecutor};
use crate::parser;
use crate::report;
use crate::types::{
    ActionRequest, DEFAULT_MAX_CONSECUTIVE_ERRORS, FindingsReport, OBSERVATION_HTML_MAX_CHARS,
    StepRecord, clip,
};
use crate::voice::Narrator;

pub const COMPLETION_NOTICE: &str = "Vulnerability scan complete. Results have been saved.";
pub const STOP_NOTICE: &str = "Too many errors in a row. Stopping.";

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub max_consecutive_errors: u32,
    pub observation_html_chars: usize,
    pub inter_step_delay: Duration,
    /// Wait for each thinking clip to finish before executing the action.
    pub sync_narration: bool,
    pub narration_timeout: Duration,
    /// Threat summary included in the first observation only.
    pub brief: Option<String>,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            observation_html_chars: OBSERVATION_HTML_MAX_CHARS,
            inter_step_delay: Duration::ZERO,
            sync_narration: false,
            narration_timeout: Duration::from_secs(30),
            brief: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Init,
    AwaitingDecision,
    Executing,
    Finished,
    Aborted,
}

/// Consecutive step failures, compared against a fixed cap.
#[derive(Debug, Clone, Copy)]
pub struct ErrorCounter {
    count: u32,
    cap: u32,
}

impl ErrorCounter {
    pub fn new(cap: u32) -> Self {
        Self {
            count: 0,
            cap: cap.max(1),
        }
    }

    /// Returns the new count.
    pub fn record_failure(&mut self) -> u32 {
        self.count += 1;
        self.count
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn cap(&self) -> u32 {
        self.cap
    }

    pub fn exhausted(&self) -> bool {
        self.count >= self.cap
    }
}

/// The one browser context of a run.
///
/// Driver calls block, so each one runs on the blocking pool with the driver
/// moved in and handed back afterwards. Calls never overlap.
pub struct Session {
    driver: Option<Box<dyn PageDriver>>,
    step: usize,
    last: Option<StepRecord>,
    state: LoopState,
}

impl Session {
    pub fn new(driver: Box<dyn PageDriver>) -> Self {
        Self {
            driver: Some(driver),
            step: 0,
            last: None,
            state: LoopState::Init,
        }
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn last_step(&self) -> Option<&StepRecord> {
        self.last.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.driver.is_some()
    }

    pub async fn with_driver<T, F>(&mut self, f: F) -> Result<T, AgentError>
    where
        F: FnOnce(&mut dyn PageDriver) -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut driver = self.driver.take().ok_or(AgentError::SessionClosed)?;
        let (driver, out) = tokio::task::spawn_blocking(move || {
            let out = f(driver.as_mut());
            (driver, out)
        })
        .await
        .map_err(|e| AgentError::DriverTask(e.to_string()))?;
        self.driver = Some(driver);
        Ok(out)
    }

    /// Load the target page. A failed load is not fatal: it becomes the
    /// feedback of step 0 so the oracle sees it in the first observation.
    pub async fn open(&mut self, url: &str) -> Result<(), AgentError> {
        info!("[Agent] Navigating to {} ...", url);
        let target = url.to_string();
        let navigated = self
            .with_driver(move |d| driver::navigate(d, &target))
            .await?;
        match navigated {
            Ok(()) => {
                let landed = self.with_driver(executor::current_url).await?;
                info!("[Agent] Page loaded: {}", landed);
            }
            Err(e) => {
                warn!("[Agent] Initial navigation failed: {}", e);
                self.last = Some(StepRecord {
                    index: 0,
                    action: format!("goto url={url:?}"),
                    feedback: format!("Navigation to '{url}' failed: {e}"),
                });
            }
        }
        Ok(())
    }

    pub async fn close(&mut self) {
        let Some(mut driver) = self.driver.take() else {
            return;
        };
        let closed = tokio::task::spawn_blocking(move || driver.close()).await;
        match closed {
            Ok(Ok(())) => info!("[Agent] Browser closed."),
            Ok(Err(e)) => warn!("[Agent] Browser close failed: {}", e),
            Err(e) => warn!("[Agent] Browser close task failed: {}", e),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Finished {
        report_path: PathBuf,
        findings: FindingsReport,
    },
    Interrupted,
}

/// Text sent to the oracle for one step.
pub fn build_observation(
    previous: Option<&StepRecord>,
    advisory: Option<&str>,
    brief: Option<&str>,
    url: &str,
    html: &str,
    filled: &str,
    html_limit: usize,
) -> String {
    let mut out = String::new();
    if let Some(brief) = brief.map(str::trim).filter(|b| !b.is_empty()) {
        out.push_str(&format!("Threat brief:\n{brief}\n\n"));
    }
    match previous {
        Some(step) => out.push_str(&format!(
            "Previous action (step {}): {}\nResult: {}\n\n",
            step.index, step.action, step.feedback
        )),
        None => out.push_str("No actions taken yet.\n\n"),
    }
    if let Some(advisory) = advisory {
        out.push_str(&format!(
            "The previous response caused an error: {advisory}. \
             Please try a different approach. Return ONLY JSON.\n\n"
        ));
    }
    out.push_str(&format!(
        "Current page URL: {url}\nHTML (first {html_limit} chars):\n{}\n",
        clip(html, html_limit)
    ));
    if !filled.is_empty() {
        out.push_str(&format!("\nCurrent input values: {filled}\n"));
    }
    out.push_str("\nWhat is the next action? Return ONLY the JSON object.");
    out
}

enum StepOutcome {
    Executed,
    Finished(FindingsReport),
    Interrupted,
}

pub struct ControlLoop<O: Oracle> {
    oracle: O,
    narrator: Narrator,
    executor: ActionExecutor,
    settings: LoopSettings,
    report_path: PathBuf,
}

impl<O: Oracle> ControlLoop<O> {
    pub fn new(
        oracle: O,
        narrator: Narrator,
        executor: ActionExecutor,
        settings: LoopSettings,
        report_path: PathBuf,
    ) -> Self {
        Self {
            oracle,
            narrator,
            executor,
            settings,
            report_path,
        }
    }

    pub fn narrator(&self) -> &Narrator {
        &self.narrator
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// Run until the oracle reports findings, the error cap is reached or
    /// `stop` flips to true. The session is closed on every exit path.
    pub async fn run(
        &mut self,
        session: &mut Session,
        mut stop: watch::Receiver<bool>,
    ) -> Result<RunOutcome, AgentError> {
        let result = self.drive(session, &mut stop).await;
        session.state = match &result {
            Ok(RunOutcome::Finished { .. }) => LoopState::Finished,
            _ => LoopState::Aborted,
        };
        session.close().await;
        result
    }

    /// Let queued narration finish, then stop the playback worker. After an
    /// interrupt nothing is drained and the worker is detached right away.
    pub async fn shutdown(mut self, interrupted: bool) {
        let timeout = if interrupted {
            Duration::ZERO
        } else {
            self.narrator.drain(self.settings.narration_timeout).await;
            self.settings.narration_timeout
        };
        let mut narrator = std::mem::replace(&mut self.narrator, Narrator::silent());
        let _ = tokio::task::spawn_blocking(move || narrator.stop(timeout)).await;
    }

    async fn drive(
        &mut self,
        session: &mut Session,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<RunOutcome, AgentError> {
        let mut errors = ErrorCounter::new(self.settings.max_consecutive_errors);
        let mut advisory: Option<String> = None;

        loop {
            if *stop.borrow() {
                info!("[Agent] Interrupted.");
                return Ok(RunOutcome::Interrupted);
            }
            session.step += 1;

            match self.step(session, advisory.take(), stop).await {
                Ok(StepOutcome::Executed) => errors.reset(),
                Ok(StepOutcome::Finished(findings)) => {
                    report::write_report(&self.report_path, &findings).map_err(|source| {
                        AgentError::Report {
                            path: self.report_path.clone(),
                            source,
                        }
                    })?;
                    info!(
                        "[Agent] Done! {} finding(s) saved to {}",
                        findings.len(),
                        self.report_path.display()
                    );
                    self.narrator.say(COMPLETION_NOTICE).await;
                    return Ok(RunOutcome::Finished {
                        report_path: self.report_path.clone(),
                        findings,
                    });
                }
                Ok(StepOutcome::Interrupted) => {
                    info!("[Agent] Interrupted during step {}.", session.step);
                    return Ok(RunOutcome::Interrupted);
                }
                Err(e) => {
                    let count = errors.record_failure();
                    error!(
                        "[Agent] [Step {}] Error ({}/{}): {}",
                        session.step,
                        count,
                        errors.cap(),
                        e
                    );
                    if errors.exhausted() {
                        self.narrator.say(STOP_NOTICE).await;
                        warn!("[Agent] Too many consecutive errors; stopping.");
                        return Err(AgentError::TooManyConsecutiveErrors {
                            count,
                            last_error: e.to_string(),
                        });
                    }
                    advisory = Some(e.to_string());
                }
            }

            if !self.settings.inter_step_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.inter_step_delay) => {}
                    _ = stopped(stop) => {}
                }
            }
        }
    }

    async fn step(
        &mut self,
        session: &mut Session,
        advisory: Option<String>,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<StepOutcome, AgentError> {
        let index = session.step;
        let limit = self.settings.observation_html_chars;
        let (url, html, filled) = session
            .with_driver(move |d| {
                let html = driver::page_content(d).unwrap_or_default();
                (
                    executor::current_url(d),
                    clip(&html, limit).to_string(),
                    executor::filled_fields(d),
                )
            })
            .await?;

        let brief = if index == 1 {
            self.settings.brief.as_deref()
        } else {
            None
        };
        let observation = build_observation(
            session.last.as_ref(),
            advisory.as_deref(),
            brief,
            &url,
            &html,
            &filled,
            limit,
        );

        session.state = LoopState::AwaitingDecision;
        let raw = tokio::select! {
            reply = self.oracle.ask(&observation) => reply?,
            _ = stopped(stop) => return Ok(StepOutcome::Interrupted),
        };
        info!("[Agent] --- Step {} ---", index);
        debug!("[Agent] Oracle: {}", raw);

        let decision = parser::parse_response(&raw)?;
        if let ActionRequest::Finish(findings) = decision.request {
            return Ok(StepOutcome::Finished(findings));
        }

        if let Some(thinking) = &decision.thinking {
            info!("[Agent] Thinking: {}", thinking);
            let narrated = async {
                self.narrator.say(thinking).await;
                if self.settings.sync_narration {
                    self.narrator.drain(self.settings.narration_timeout).await;
                }
            };
            tokio::select! {
                _ = narrated => {}
                _ = stopped(stop) => return Ok(StepOutcome::Interrupted),
            }
        }

        session.state = LoopState::Executing;
        let executor = self.executor;
        let request = decision.request.clone();
        let feedback = session
            .with_driver(move |d| executor.execute(d, &request))
            .await?;
        info!("[Agent] Result: {}", feedback);

        session.last = Some(StepRecord {
            index,
            action: decision.request.describe(),
            feedback,
        });
        Ok(StepOutcome::Executed)
    }
}

/// Resolves once `stop` reads true; never resolves if the sender is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}
