use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::LoopSettings;
use crate::brain::{DEFAULT_HISTORY_WINDOW, DEFAULT_MODEL, DEFAULT_ORACLE_URL, OracleConfig};
use crate::error::AgentError;
use crate::executor::ActionSettings;
use crate::hands::BrowserOptions;
use crate::report;
use crate::voice::{
    ClipPlayer, CommandPlayer, DEFAULT_QUEUE_CAPACITY, DEFAULT_VOICE_ID, ELEVENLABS_API,
    ElevenLabsSynth, Narrator, SpeechSynth,
};

pub const ORACLE_KEY_VAR: &str = "ORACLE_API_KEY";
/// Older deployments keep the oracle credential here.
pub const GEMINI_KEY_VAR: &str = "GEMINI_API_KEY";
pub const NARRATION_KEY_VAR: &str = "ELEVENLABS_API_KEY";

/// Oracle connection settings before the credential has been checked.
#[derive(Debug, Clone)]
pub struct OracleSettings {
    pub api_key: Option<String>,
    /// Used when `api_key` is unset or blank.
    pub fallback_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
    pub history_window: usize,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            fallback_key: None,
            base_url: DEFAULT_ORACLE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            timeout: Duration::from_secs(120),
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }
}

impl OracleSettings {
    /// Fails when no credential is configured.
    pub fn resolve(&self) -> Result<OracleConfig, AgentError> {
        let api_key = [&self.api_key, &self.fallback_key]
            .into_iter()
            .filter_map(|key| key.as_deref().map(str::trim))
            .find(|k| !k.is_empty())
            .ok_or(AgentError::OracleUnavailable(ORACLE_KEY_VAR))?;
        Ok(OracleConfig {
            api_key: api_key.to_string(),
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
            timeout: self.timeout,
            history_window: self.history_window,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NarrationConfig {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub base_url: String,
    pub voice_id: String,
    /// Player command line; the platform default is used when unset.
    pub player: Option<String>,
    pub queue_capacity: usize,
}

impl Default for NarrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            base_url: ELEVENLABS_API.to_string(),
            voice_id: DEFAULT_VOICE_ID.to_string(),
            player: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl NarrationConfig {
    pub fn start(&self) -> Narrator {
        if !self.enabled {
            return Narrator::silent();
        }
        let synth = self
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .map(|key| {
                Arc::new(
                    ElevenLabsSynth::new(key)
                        .with_base_url(self.base_url.as_str())
                        .with_voice(self.voice_id.as_str()),
                ) as Arc<dyn SpeechSynth>
            });
        let player = match &self.player {
            Some(command) => CommandPlayer::parse(command),
            None => CommandPlayer::platform_default(),
        }
        .map(|p| Box::new(p) as Box<dyn ClipPlayer>);
        Narrator::start(synth, player, self.queue_capacity)
    }
}

/// Everything one run needs, assembled from the command line and environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub oracle: OracleSettings,
    pub narration: NarrationConfig,
    pub browser: BrowserOptions,
    pub run: LoopSettings,
    pub actions: ActionSettings,
    pub report_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            oracle: OracleSettings::default(),
            narration: NarrationConfig::default(),
            browser: BrowserOptions::default(),
            run: LoopSettings::default(),
            actions: ActionSettings::default(),
            report_path: report::default_report_path(),
        }
    }
}
