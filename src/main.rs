use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dotenvy::dotenv;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mayhem_agent::config::{Config, GEMINI_KEY_VAR, NARRATION_KEY_VAR, ORACLE_KEY_VAR};
use mayhem_agent::report::{self, DEFAULT_REPORT_PATH, ReportStatus};
use mayhem_agent::{ActionRequest, AgentError, RunOutcome};

#[derive(Parser)]
#[command(name = "mayhem", version, about = "Oracle-driven adversarial testing of a web page")]
struct Cli {
    /// Log level used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Test one page until the oracle reports findings.
    Run(RunArgs),
    /// Perform a single browser action and print its feedback.
    Act(ActArgs),
    /// Print the state of the findings report: pending, complete or error.
    Status {
        #[arg(long, default_value = DEFAULT_REPORT_PATH)]
        results: PathBuf,
    },
}

#[derive(Args)]
struct BrowserArgs {
    #[arg(long)]
    headless: bool,

    /// DevTools WebSocket URL of a running Chrome to attach to.
    #[arg(long, env = "CHROME_WS_URL")]
    attach: Option<String>,

    #[arg(long, env = "CHROME_PATH")]
    chrome_path: Option<PathBuf>,

    /// Milliseconds a JS dialog stays open before it is accepted.
    #[arg(long, default_value_t = 0)]
    dialog_pause_ms: u64,

    /// Seconds a page load may take.
    #[arg(long, default_value_t = 20)]
    navigation_timeout: u64,
}

#[derive(Args)]
struct RunArgs {
    /// Page to test; bare hosts get https://.
    url: String,

    #[command(flatten)]
    browser: BrowserArgs,

    #[arg(long, default_value = DEFAULT_REPORT_PATH)]
    results: PathBuf,

    #[arg(long, default_value_t = 5)]
    max_errors: u32,

    /// Seconds to pause between steps.
    #[arg(long, default_value_t = 0)]
    step_delay: u64,

    /// Extra context for the first observation.
    #[arg(long)]
    brief: Option<String>,

    #[arg(long, env = ORACLE_KEY_VAR, hide_env_values = true)]
    oracle_key: Option<String>,

    #[arg(long, env = GEMINI_KEY_VAR, hide_env_values = true, hide = true)]
    gemini_key: Option<String>,

    #[arg(long, env = "ORACLE_BASE_URL")]
    oracle_url: Option<String>,

    #[arg(long, env = "ORACLE_MODEL")]
    model: Option<String>,

    #[arg(long, default_value_t = 120)]
    oracle_timeout: u64,

    #[arg(long)]
    no_narration: bool,

    /// Finish speaking each thought before acting on it.
    #[arg(long)]
    sync_narration: bool,

    #[arg(long, env = NARRATION_KEY_VAR, hide_env_values = true)]
    narration_key: Option<String>,

    #[arg(long, env = "ELEVENLABS_VOICE_ID")]
    voice: Option<String>,

    /// Audio player command, e.g. "mpg123 -q".
    #[arg(long, env = "MAYHEM_PLAYER")]
    player: Option<String>,
}

#[derive(Args)]
struct ActArgs {
    url: String,

    #[command(flatten)]
    browser: BrowserArgs,

    #[command(subcommand)]
    action: ActCommand,
}

#[derive(Subcommand)]
enum ActCommand {
    GetHtml,
    Click {
        selector: String,
    },
    Type {
        selector: String,
        text: String,
        /// Submit the form that owns the field.
        #[arg(long)]
        submit: bool,
    },
}

impl BrowserArgs {
    fn apply(self, config: &mut Config) {
        config.browser.headless = self.headless;
        config.browser.attach = self.attach;
        config.browser.chrome_path = self.chrome_path;
        config.browser.dialog_pause = Duration::from_millis(self.dialog_pause_ms);
        config.browser.navigation_timeout = Duration::from_secs(self.navigation_timeout);
    }
}

impl RunArgs {
    fn into_config(self) -> (String, Config) {
        let mut config = Config::default();
        self.browser.apply(&mut config);

        config.oracle.api_key = self.oracle_key;
        config.oracle.fallback_key = self.gemini_key;
        if let Some(url) = self.oracle_url {
            config.oracle.base_url = url;
        }
        if let Some(model) = self.model {
            config.oracle.model = model;
        }
        config.oracle.timeout = Duration::from_secs(self.oracle_timeout);

        config.narration.enabled = !self.no_narration;
        config.narration.api_key = self.narration_key;
        config.narration.player = self.player;
        if let Some(voice) = self.voice {
            config.narration.voice_id = voice;
        }

        config.run.max_consecutive_errors = self.max_errors;
        config.run.inter_step_delay = Duration::from_secs(self.step_delay);
        config.run.sync_narration = self.sync_narration;
        config.run.brief = self.brief;
        config.report_path = self.results;

        (self.url, config)
    }
}

impl From<ActCommand> for ActionRequest {
    fn from(command: ActCommand) -> Self {
        match command {
            ActCommand::GetHtml => ActionRequest::GetHtml,
            ActCommand::Click { selector } => ActionRequest::Click { selector },
            ActCommand::Type {
                selector,
                text,
                submit,
            } => ActionRequest::TypeText {
                selector,
                text: Some(text),
                submit,
            },
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let level: tracing::Level = level.parse().context("Invalid log level")?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("Fatal: {e:#}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Act(args) => match act(args).await {
            Ok(feedback) => {
                println!("{feedback}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Fatal: {:#}", e);
                ExitCode::FAILURE
            }
        },
        Command::Status { results } => {
            let status = report::read_status(&results);
            match &status {
                ReportStatus::Error(reason) => warn!("{}: {}", results.display(), reason),
                ReportStatus::Complete(value) => info!(
                    "{} finding(s) in {}",
                    value["vulnerabilities"].as_array().map_or(0, Vec::len),
                    results.display()
                ),
                ReportStatus::Pending => {}
            }
            println!("{}", status.label());
            ExitCode::SUCCESS
        }
    }
}

async fn run(args: RunArgs) -> ExitCode {
    let (url, config) = args.into_config();

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("[Agent] Interrupted by user; stopping after the current step.");
            let _ = stop_tx.send(true);
        }
    });

    match mayhem_agent::attack_page(&url, &config, stop_rx).await {
        Ok(RunOutcome::Finished {
            report_path,
            findings,
        }) => {
            info!(
                "[Agent] Finished with {} finding(s); report at {}",
                findings.len(),
                report_path.display()
            );
            ExitCode::SUCCESS
        }
        Ok(RunOutcome::Interrupted) => {
            info!("[Agent] Interrupted by user.");
            ExitCode::from(130)
        }
        Err(e @ AgentError::TooManyConsecutiveErrors { .. }) => {
            error!("[Agent] Aborted: {}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Fatal: {:#}", anyhow::Error::from(e));
            ExitCode::FAILURE
        }
    }
}

async fn act(args: ActArgs) -> Result<String> {
    let mut config = Config::default();
    args.browser.apply(&mut config);
    let request = ActionRequest::from(args.action);
    let label = request.describe();
    mayhem_agent::perform(&args.url, request, &config)
        .await
        .with_context(|| format!("{label} failed on {}", args.url))
}
