//! Streaming ASR: a sliding window over the session's rolling buffer, sent
//! to a Whisper-compatible transcription endpoint, with utterance tracking
//! and server-side silence finalization.

use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::multipart;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::audio::resample::rms;
use crate::audio::ring::RollingBuffer;
use crate::audio::{wav, AudioError, PIPELINE_SAMPLE_RATE};
use crate::backoff;
use crate::config::Settings;

const MAX_RETRIES: u32 = 3;

#[derive(Error, Debug)]
pub enum AsrError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("audio error: {0}")]
    Audio(#[from] AudioError),
}

impl AsrError {
    /// Transport-level failures and 5xx responses are worth retrying;
    /// client protocol errors are not.
    fn is_transient(&self) -> bool {
        match self {
            AsrError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            AsrError::Api { status, .. } => *status >= 500,
            AsrError::Audio(_) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AsrConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub language: String,
    pub window: Duration,
    pub slide: Duration,
    pub silence: Duration,
    pub silence_rms: f64,
    pub request_timeout: Duration,
}

impl AsrConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            base_url: settings.whisper_base_url.clone(),
            api_key: settings.whisper_api_key().to_string(),
            model: settings.whisper_model.clone(),
            language: settings.whisper_language.clone(),
            window: settings.asr_window(),
            slide: settings.asr_slide(),
            silence: settings.asr_silence(),
            silence_rms: settings.asr_silence_rms,
            request_timeout: Duration::from_secs(10),
        }
    }

    fn window_samples(&self) -> usize {
        (PIPELINE_SAMPLE_RATE as u64 * self.window.as_millis() as u64 / 1000) as usize
    }

    fn silence_samples(&self) -> usize {
        (PIPELINE_SAMPLE_RATE as u64 * self.silence.as_millis() as u64 / 1000) as usize
    }
}

/// One transcript emission. Partials grow monotonically inside an utterance;
/// the final carries the full accumulated utterance text.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub chunk_index: u64,
    pub is_final: bool,
    /// Transcription round-trip for the window that produced this event;
    /// zero for finals triggered by silence or flush.
    pub latency_ms: u64,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    text: String,
}

/// Client for the `POST /audio/transcriptions` multipart contract.
pub struct WhisperClient {
    client: reqwest::Client,
    config: AsrConfig,
}

impl WhisperClient {
    pub fn new(config: AsrConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self { client, config }
    }

    /// Transcribe one WAV window, retrying transient failures with backoff.
    pub async fn transcribe(&self, wav_data: Vec<u8>) -> Result<String, AsrError> {
        let mut attempt = 0u32;
        loop {
            match self.call_endpoint(wav_data.clone()).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                    log::warn!("[ASR-RETRY] attempt {}: {}", attempt + 1, e);
                    tokio::time::sleep(backoff::delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn call_endpoint(&self, wav_data: Vec<u8>) -> Result<String, AsrError> {
        let url = format!(
            "{}/audio/transcriptions",
            self.config.base_url.trim_end_matches('/')
        );

        let part = multipart::Part::bytes(wav_data)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(AsrError::Request)?;
        let form = multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone())
            .text("language", self.config.language.clone());

        let mut request = self.client.post(&url).multipart(form);
        if !self.config.api_key.is_empty() {
            request = request.bearer_auth(&self.config.api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AsrError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: TranscriptionResponse = response.json().await?;
        Ok(body.text.trim().to_string())
    }
}

/// Utterance-scoped transcript accumulator.
///
/// A new window result either extends the current utterance (whitespace-
/// normalized prefix growth) or starts a new one, finalizing the old.
#[derive(Default)]
pub struct UtteranceTracker {
    current: String,
}

fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

impl UtteranceTracker {
    /// Feed a window transcript. Returns the previous utterance's text when
    /// the new transcript starts a fresh utterance.
    pub fn observe(&mut self, text: &str) -> Option<String> {
        let incoming = normalize(text);
        if incoming.is_empty() {
            return None;
        }

        if self.current.is_empty() || incoming.starts_with(&self.current) {
            self.current = incoming;
            None
        } else {
            let finished = std::mem::replace(&mut self.current, incoming);
            Some(finished)
        }
    }

    /// Finalize the current utterance, if any.
    pub fn take(&mut self) -> Option<String> {
        if self.current.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.current))
        }
    }

    pub fn is_active(&self) -> bool {
        !self.current.is_empty()
    }

    pub fn current(&self) -> &str {
        &self.current
    }
}

/// The per-session ASR windower task.
pub struct StreamingAsr {
    session_id: String,
    config: AsrConfig,
    client: WhisperClient,
    ring: Arc<RollingBuffer>,
    events: mpsc::Sender<Transcript>,
}

impl StreamingAsr {
    pub fn new(
        session_id: impl Into<String>,
        config: AsrConfig,
        ring: Arc<RollingBuffer>,
        events: mpsc::Sender<Transcript>,
    ) -> Self {
        let client = WhisperClient::new(config.clone());
        Self {
            session_id: session_id.into(),
            config,
            client,
            ring,
            events,
        }
    }

    /// Run the sliding-window loop until cancelled, then flush the pending
    /// utterance as a final.
    pub async fn run(self, cancel: CancellationToken) {
        let mut tracker = UtteranceTracker::default();
        let mut chunk_index = 0u64;
        let mut ticker = tokio::time::interval(self.config.slide);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        log::info!(
            "[ASR-START] session={} window={}ms slide={}ms silence={}ms",
            self.session_id,
            self.config.window.as_millis(),
            self.config.slide.as_millis(),
            self.config.silence.as_millis()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.on_tick(&mut tracker, &mut chunk_index).await;
                }
            }
        }

        // Session end: flush whatever was being said.
        if let Some(text) = tracker.take() {
            self.emit_final(text, chunk_index, 0).await;
        }
        log::info!(
            "[ASR-STOP] session={} chunks={}",
            self.session_id,
            chunk_index
        );
    }

    async fn on_tick(&self, tracker: &mut UtteranceTracker, chunk_index: &mut u64) {
        // Silence-based finalization comes first so a pause between
        // utterances closes the previous one before a new window opens it.
        if tracker.is_active() {
            let tail = self.ring.tail(self.config.silence_samples());
            if tail.len() >= self.config.silence_samples()
                && rms(&tail) < self.config.silence_rms
            {
                if let Some(text) = tracker.take() {
                    log::info!(
                        "[ASR-SILENCE] session={} finalizing \"{}\"",
                        self.session_id,
                        text
                    );
                    self.emit_final(text, *chunk_index, 0).await;
                }
                return;
            }
        }

        let window_samples = self.config.window_samples();
        if self.ring.len() < window_samples {
            return;
        }
        let window = self.ring.tail(window_samples);

        // Skip transcription entirely while the channel is quiet; the remote
        // call would only return empty text.
        if rms(&window) < self.config.silence_rms {
            return;
        }

        let wav_data = match wav::encode(&window, PIPELINE_SAMPLE_RATE) {
            Ok(data) => data,
            Err(e) => {
                log::error!("[ASR-ERROR] session={} wav encode: {}", self.session_id, e);
                return;
            }
        };

        *chunk_index += 1;
        let started = Instant::now();
        match self.client.transcribe(wav_data).await {
            Ok(text) if !text.is_empty() => {
                log::info!(
                    "[ASR] session={} chunk {} → \"{}\" ({}ms)",
                    self.session_id,
                    chunk_index,
                    text,
                    started.elapsed().as_millis()
                );
                let elapsed_ms = started.elapsed().as_millis() as u64;
                if let Some(finished) = tracker.observe(&text) {
                    self.emit_final(finished, *chunk_index, 0).await;
                }
                if tracker.is_active() {
                    self.emit_partial(tracker.current().to_string(), *chunk_index, elapsed_ms)
                        .await;
                }
            }
            Ok(_) => {
                log::debug!("[ASR] session={} chunk {} → (empty)", self.session_id, chunk_index);
            }
            Err(e) => {
                log::error!(
                    "[ASR-FAILED] session={} chunk {}: {}",
                    self.session_id,
                    chunk_index,
                    e
                );
            }
        }
    }

    async fn emit_partial(&self, text: String, chunk_index: u64, latency_ms: u64) {
        let _ = self
            .events
            .send(Transcript {
                text,
                chunk_index,
                is_final: false,
                latency_ms,
            })
            .await;
    }

    async fn emit_final(&self, text: String, chunk_index: u64, latency_ms: u64) {
        let _ = self
            .events
            .send(Transcript {
                text,
                chunk_index,
                is_final: true,
                latency_ms,
            })
            .await;
    }
}
