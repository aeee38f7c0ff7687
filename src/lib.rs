//! Autonomous adversarial testing of a single web page.
//!
//! A run keeps one Chrome tab open, asks an oracle for the next browser
//! action, executes it, reports the side effects back and repeats until the
//! oracle hands over a findings report or too many steps fail in a row.

pub mod agent;
pub mod brain;
pub mod config;
pub mod dom;
pub mod driver;
pub mod error;
pub mod evidence;
pub mod executor;
pub mod hands;
pub mod parser;
pub mod report;
pub mod types;
pub mod voice;

use tokio::sync::watch;
use tracing::{info, warn};

pub use agent::{ControlLoop, LoopState, RunOutcome, Session};
pub use brain::{ChatOracle, Oracle};
pub use config::Config;
pub use driver::PageDriver;
pub use error::AgentError;
pub use types::ActionRequest;

use crate::executor::ActionExecutor;
use crate::hands::{BrowserOptions, ChromeDriver};
use crate::types::normalize_target;
use crate::voice::Narrator;

/// Test one page end to end in a fresh Chrome session.
///
/// The oracle credential is checked before any browser is started.
pub async fn attack_page(
    url: &str,
    config: &Config,
    stop: watch::Receiver<bool>,
) -> Result<RunOutcome, AgentError> {
    let oracle = ChatOracle::new(config.oracle.resolve()?)?;
    let narrator = config.narration.start();
    let driver = launch_chrome(&config.browser).await?;
    attack_with(url, oracle, Box::new(driver), narrator, config, stop).await
}

/// [`attack_page`] with the collaborators supplied by the caller.
pub async fn attack_with<O: Oracle>(
    url: &str,
    oracle: O,
    driver: Box<dyn PageDriver>,
    narrator: Narrator,
    config: &Config,
    stop: watch::Receiver<bool>,
) -> Result<RunOutcome, AgentError> {
    let target = normalize_target(url);
    if let Err(e) = report::clear_report(&config.report_path) {
        warn!(
            "[Agent] Could not clear old report {}: {}",
            config.report_path.display(),
            e
        );
    }

    narrator.say(&format!("Starting chaos test on {target}")).await;

    let mut session = Session::new(driver);
    let mut control = ControlLoop::new(
        oracle,
        narrator,
        ActionExecutor::new(config.actions),
        config.run.clone(),
        config.report_path.clone(),
    );

    let result = match session.open(&target).await {
        Ok(()) => control.run(&mut session, stop).await,
        Err(e) => {
            session.close().await;
            Err(e)
        }
    };
    control
        .shutdown(matches!(result, Ok(RunOutcome::Interrupted)))
        .await;
    result
}

/// Perform a single action on `url` and return its feedback.
pub async fn perform(
    url: &str,
    request: ActionRequest,
    config: &Config,
) -> Result<String, AgentError> {
    let driver = launch_chrome(&config.browser).await?;
    let mut session = Session::new(Box::new(driver));
    session.open(&normalize_target(url)).await?;
    if let Some(step) = session.last_step() {
        let feedback = step.feedback.clone();
        session.close().await;
        return Ok(feedback);
    }

    let executor = ActionExecutor::new(config.actions);
    info!("[Agent] {}", request.describe());
    let feedback = session
        .with_driver(move |d| executor.execute(d, &request))
        .await;
    session.close().await;
    feedback
}

async fn launch_chrome(options: &BrowserOptions) -> Result<ChromeDriver, AgentError> {
    let options = options.clone();
    tokio::task::spawn_blocking(move || ChromeDriver::launch(&options))
        .await
        .map_err(|e| AgentError::DriverTask(e.to_string()))?
        .map_err(|e| AgentError::Launch(format!("{e:#}")))
}
