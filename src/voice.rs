//! Spoken narration of the run.
//!
//! [`Narrator::say`] synthesizes a clip and queues it; one worker thread plays
//! queued clips in order, deleting each after playback. The producer never
//! waits on playback. When no speech service or audio player is configured
//! the text is only logged.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::NarrationError;

/// Text-to-speech backend producing an MP3 clip.
#[async_trait]
pub trait SpeechSynth: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, NarrationError>;
}

/// Plays one clip to completion.
pub trait ClipPlayer: Send + 'static {
    fn play(&self, clip: &Path) -> Result<(), NarrationError>;
}

pub const ELEVENLABS_API: &str = "https://api.elevenlabs.io";
/// "Daniel", a steady broadcaster voice.
pub const DEFAULT_VOICE_ID: &str = "onwK4e9ZLuTAKqWW03F9";
pub const DEFAULT_SPEECH_MODEL: &str = "eleven_multilingual_v2";
/// Upper bound on one synthesis request, body included.
pub const DEFAULT_SPEECH_TIMEOUT: Duration = Duration::from_secs(20);

pub struct ElevenLabsSynth {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    voice_id: String,
    model_id: String,
    speed: f32,
    timeout: Duration,
}

impl ElevenLabsSynth {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: ELEVENLABS_API.to_string(),
            voice_id: DEFAULT_VOICE_ID.to_string(),
            model_id: DEFAULT_SPEECH_MODEL.to_string(),
            speed: 1.2,
            timeout: DEFAULT_SPEECH_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_voice(mut self, voice_id: impl Into<String>) -> Self {
        self.voice_id = voice_id.into();
        self
    }

    pub fn with_speed(mut self, speed: f32) -> Self {
        self.speed = speed.clamp(0.7, 1.2);
        self
    }
}

#[async_trait]
impl SpeechSynth for ElevenLabsSynth {
    fn name(&self) -> &str {
        "ElevenLabs"
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, NarrationError> {
        let url = format!(
            "{}/v1/text-to-speech/{}?output_format=mp3_44100_128",
            self.base_url, self.voice_id
        );
        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .header("xi-api-key", &self.api_key)
            .header("Accept", "audio/mpeg")
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.model_id,
                "voice_settings": { "speed": self.speed },
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NarrationError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Plays clips with an external command such as `afplay` or `mpg123 -q`.
#[derive(Debug, Clone)]
pub struct CommandPlayer {
    program: String,
    args: Vec<String>,
}

impl CommandPlayer {
    /// Parse a command line like `"mpg123 -q"`; the clip path is appended.
    pub fn parse(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace().map(String::from);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    /// `afplay` on macOS; elsewhere playback must be configured explicitly.
    pub fn platform_default() -> Option<Self> {
        if cfg!(target_os = "macos") {
            Self::parse("afplay")
        } else {
            None
        }
    }
}

impl ClipPlayer for CommandPlayer {
    fn play(&self, clip: &Path) -> Result<(), NarrationError> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(clip)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(NarrationError::Player(format!("{} exited with {status}", self.program)))
        }
    }
}

enum Clip {
    Play(PathBuf),
    Stop,
}

pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Producer side of the narration pipeline, owned by one run.
pub struct Narrator {
    synth: Option<Arc<dyn SpeechSynth>>,
    queue: Option<mpsc::Sender<Clip>>,
    pending: watch::Sender<usize>,
    worker: Option<JoinHandle<()>>,
}

impl Narrator {
    /// A narrator that only logs.
    pub fn silent() -> Self {
        let (pending, _) = watch::channel(0);
        Self {
            synth: None,
            queue: None,
            pending,
            worker: None,
        }
    }

    /// Start the playback worker. Falls back to [`Narrator::silent`] when
    /// either half of the pipeline is missing.
    pub fn start(
        synth: Option<Arc<dyn SpeechSynth>>,
        player: Option<Box<dyn ClipPlayer>>,
        capacity: usize,
    ) -> Self {
        let (Some(synth), Some(player)) = (synth, player) else {
            info!("[Voice] Narration disabled; thinking is logged only.");
            return Self::silent();
        };

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (pending, _) = watch::channel(0usize);
        let worker_pending = pending.clone();
        let worker = std::thread::Builder::new()
            .name("narration".into())
            .spawn(move || playback_worker(rx, player, worker_pending));

        match worker {
            Ok(handle) => {
                info!("[Voice] Narrating with {}.", synth.name());
                Self {
                    synth: Some(synth),
                    queue: Some(tx),
                    pending,
                    worker: Some(handle),
                }
            }
            Err(e) => {
                warn!("[Voice] Could not start playback worker: {}", e);
                Self::silent()
            }
        }
    }

    pub fn is_audible(&self) -> bool {
        self.queue.is_some()
    }

    /// Clips queued or playing right now.
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Speak `text`. Never fails: problems are logged and the text dropped.
    pub async fn say(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let (Some(synth), Some(queue)) = (&self.synth, &self.queue) else {
            info!("[Voice] (muted) {}", text);
            return;
        };

        let audio = match synth.synthesize(text).await {
            Ok(audio) => audio,
            Err(e) => {
                warn!("[Voice] TTS error: {}", e);
                return;
            }
        };
        let clip = match write_clip(&audio) {
            Ok(path) => path,
            Err(e) => {
                warn!("[Voice] Could not store clip: {}", e);
                return;
            }
        };

        self.pending.send_modify(|n| *n += 1);
        if let Err(e) = queue.try_send(Clip::Play(clip)) {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            let clip = match e {
                mpsc::error::TrySendError::Full(clip) | mpsc::error::TrySendError::Closed(clip) => {
                    clip
                }
            };
            if let Clip::Play(path) = clip {
                let _ = std::fs::remove_file(path);
            }
            warn!("[Voice] Narration queue unavailable; dropped: {}", text);
            return;
        }
        debug!("[Voice] Queued: {}", text);
    }

    /// Wait until every queued clip has finished playing, up to `timeout`.
    /// Returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut rx = self.pending.subscribe();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0)).await,
            Ok(Ok(_))
        )
    }

    /// Queue the stop sentinel behind any pending clips and join the worker
    /// for at most `timeout`. A worker still playing after that is left to
    /// finish on its own.
    pub fn stop(&mut self, timeout: Duration) {
        if let Some(queue) = self.queue.take() {
            let _ = queue.try_send(Clip::Stop);
        }
        let Some(worker) = self.worker.take() else {
            return;
        };
        let deadline = Instant::now() + timeout;
        while !worker.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        if worker.is_finished() {
            let _ = worker.join();
            debug!("[Voice] Playback worker stopped.");
        } else {
            warn!("[Voice] Playback worker still busy; detaching.");
        }
    }
}

impl Drop for Narrator {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            let _ = queue.try_send(Clip::Stop);
        }
    }
}

fn write_clip(audio: &[u8]) -> std::io::Result<PathBuf> {
    let mut file = tempfile::Builder::new()
        .prefix("mayhem-tts-")
        .suffix(".mp3")
        .tempfile()?;
    file.write_all(audio)?;
    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

fn playback_worker(
    mut rx: mpsc::Receiver<Clip>,
    player: Box<dyn ClipPlayer>,
    pending: watch::Sender<usize>,
) {
    while let Some(clip) = rx.blocking_recv() {
        let Clip::Play(path) = clip else {
            break;
        };
        if let Err(e) = player.play(&path) {
            warn!("[Voice] Playback failed: {}", e);
        }
        let _ = std::fs::remove_file(&path);
        pending.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FakeSynth;

    #[async_trait]
    impl SpeechSynth for FakeSynth {
        fn name(&self) -> &str {
            "fake"
        }

        async fn synthesize(&self, text: &str) -> Result<Vec<u8>, NarrationError> {
            Ok(text.as_bytes().to_vec())
        }
    }

    #[derive(Clone, Default)]
    struct RecordingPlayer {
        played: Arc<Mutex<Vec<String>>>,
        delay: Duration,
    }

    impl ClipPlayer for RecordingPlayer {
        fn play(&self, clip: &Path) -> Result<(), NarrationError> {
            std::thread::sleep(self.delay);
            let text = std::fs::read_to_string(clip)?;
            self.played.lock().unwrap().push(text);
            Ok(())
        }
    }

    #[tokio::test]
    async fn clips_play_in_order_and_drain() {
        let player = RecordingPlayer {
            delay: Duration::from_millis(30),
            ..Default::default()
        };
        let played = player.played.clone();
        let mut narrator = Narrator::start(Some(Arc::new(FakeSynth)), Some(Box::new(player)), 8);
        assert!(narrator.is_audible());

        narrator.say("one").await;
        narrator.say("two").await;
        narrator.say("three").await;
        assert!(narrator.drain(Duration::from_secs(5)).await);
        assert_eq!(narrator.pending(), 0);
        assert_eq!(*played.lock().unwrap(), vec!["one", "two", "three"]);

        narrator.stop(Duration::from_secs(1));
        assert!(!narrator.is_audible());
    }

    #[tokio::test]
    async fn say_does_not_wait_for_playback() {
        let player = RecordingPlayer {
            delay: Duration::from_millis(400),
            ..Default::default()
        };
        let narrator = Narrator::start(Some(Arc::new(FakeSynth)), Some(Box::new(player)), 8);
        let started = Instant::now();
        narrator.say("slow clip").await;
        assert!(started.elapsed() < Duration::from_millis(300));
        assert!(!narrator.drain(Duration::from_millis(50)).await);
        assert!(narrator.drain(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn missing_player_means_log_only() {
        let narrator = Narrator::start(Some(Arc::new(FakeSynth)), None, 8);
        assert!(!narrator.is_audible());
        narrator.say("hello").await;
        assert!(narrator.drain(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn elevenlabs_posts_text_with_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/v1/text-to-speech/{DEFAULT_VOICE_ID}")))
            .and(header("xi-api-key", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ID3mp3".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let synth = ElevenLabsSynth::new("secret").with_base_url(server.uri());
        assert_eq!(synth.synthesize("hi").await.unwrap(), b"ID3mp3".to_vec());
    }

    #[tokio::test]
    async fn elevenlabs_errors_carry_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let synth = ElevenLabsSynth::new("nope").with_base_url(server.uri());
        match synth.synthesize("hi").await {
            Err(NarrationError::Api { status, body }) => {
                assert_eq!(status, 401);
                assert_eq!(body, "bad key");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn stalled_speech_service_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"late".to_vec())
                    .set_delay(Duration::from_secs(10)),
            )
            .mount(&server)
            .await;

        let synth = ElevenLabsSynth::new("k")
            .with_base_url(server.uri())
            .with_timeout(Duration::from_millis(200));
        let started = Instant::now();
        assert!(matches!(
            synth.synthesize("hi").await,
            Err(NarrationError::Http(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(5));

        let player = RecordingPlayer::default();
        let played = player.played.clone();
        let narrator = Narrator::start(Some(Arc::new(synth)), Some(Box::new(player)), 4);
        let started = Instant::now();
        narrator.say("thinking").await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(narrator.pending(), 0);
        assert!(played.lock().unwrap().is_empty());
    }

    #[test]
    fn player_command_is_split() {
        let player = CommandPlayer::parse("mpg123 -q").unwrap();
        assert_eq!(player.program, "mpg123");
        assert_eq!(player.args, vec!["-q"]);
        assert!(CommandPlayer::parse("   ").is_none());
    }
}
