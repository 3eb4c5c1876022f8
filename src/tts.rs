//! Streaming TTS: sentence-bounded segmentation, synthesis with provider
//! failover, and 20 ms framing onto the audio track + datagram fan-out.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::audio::resample::{downmix_to_mono, resample, samples_to_bytes};
use crate::audio::{wav, AudioError, BYTES_PER_FRAME, FRAME_DURATION_MS, PIPELINE_SAMPLE_RATE};
use crate::backoff;
use crate::config::{voice_description, Settings};

const PRIMARY_RETRIES: u32 = 2;

/// Approximate token budget per segment (4 chars ≈ 1 token).
const SEGMENT_TOKEN_BUDGET: usize = 25;
const SEGMENT_CHAR_BUDGET: usize = SEGMENT_TOKEN_BUDGET * 4;

#[derive(Error, Debug)]
pub enum TtsError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("all providers failed: {0}")]
    Exhausted(String),
}

impl TtsError {
    fn is_transient(&self) -> bool {
        match self {
            TtsError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            TtsError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub primary_base_url: String,
    pub fallback_base_url: Option<String>,
    pub voice: String,
    pub language: String,
    pub target_sentences: usize,
    pub request_timeout: Duration,
}

impl TtsConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            primary_base_url: settings.parler_tts_base_url.clone(),
            fallback_base_url: settings.xtts_tts_base_url.clone(),
            voice: settings.tts_voice.clone(),
            language: settings.tts_language.clone(),
            target_sentences: settings.tts_chunk_size_sentences,
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Split a response into synthesis segments bounded by sentence terminators,
/// targeting `target_sentences` sentences and ~15–25 tokens per segment.
/// Overlong sentences split at the last whitespace before the budget, or
/// hard if there is none.
pub fn segment_text(text: &str, target_sentences: usize) -> Vec<String> {
    let target = target_sentences.max(1);
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut sentences_in_current = 0usize;

    for sentence in split_sentences(text) {
        for piece in split_overlong(&sentence) {
            let candidate_len = if current.is_empty() {
                piece.len()
            } else {
                current.len() + 1 + piece.len()
            };

            if !current.is_empty()
                && (sentences_in_current >= target || candidate_len > SEGMENT_CHAR_BUDGET)
            {
                segments.push(std::mem::take(&mut current));
                sentences_in_current = 0;
            }

            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(&piece);
            sentences_in_current += 1;
        }
    }

    if !current.is_empty() {
        segments.push(current);
    }
    segments
}

/// Sentence-terminator split, keeping the terminator with its sentence.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        if ch == '\n' {
            if !current.trim().is_empty() {
                sentences.push(current.trim().to_string());
            }
            current.clear();
            continue;
        }
        current.push(ch);
        if matches!(ch, '.' | '!' | '?' | ';') {
            if !current.trim().is_empty() {
                sentences.push(current.trim().to_string());
            }
            current.clear();
        }
    }
    if !current.trim().is_empty() {
        sentences.push(current.trim().to_string());
    }
    sentences
}

/// Break a single sentence that exceeds the character budget.
fn split_overlong(sentence: &str) -> Vec<String> {
    if sentence.len() <= SEGMENT_CHAR_BUDGET {
        return vec![sentence.to_string()];
    }

    let mut pieces = Vec::new();
    let mut rest = sentence;
    while rest.len() > SEGMENT_CHAR_BUDGET {
        // Hard-split position, backed off to a char boundary.
        let mut limit = SEGMENT_CHAR_BUDGET;
        while !rest.is_char_boundary(limit) {
            limit -= 1;
        }
        let cut = rest[..limit]
            .rfind(char::is_whitespace)
            .filter(|&i| i > 0)
            .unwrap_or(limit);
        pieces.push(rest[..cut].trim().to_string());
        rest = rest[cut..].trim_start();
    }
    if !rest.is_empty() {
        pieces.push(rest.to_string());
    }
    pieces
}

/// Sink for synthesized frames. The coordinator implements this to fan each
/// frame out to the audio track and the datagram channel.
#[async_trait]
pub trait FrameEmitter: Send + Sync {
    async fn emit_frame(&self, pcm: &[u8], segment: u32, frame: u32);
}

/// Client for the synthesis endpoints: primary (`POST /tts`), with a single
/// fallback attempt (`POST /synthesize`) after the primary's retries are
/// exhausted.
pub struct TtsClient {
    client: reqwest::Client,
    config: TtsConfig,
}

impl TtsClient {
    pub fn new(config: TtsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .expect("Failed to create HTTP client");
        Self { client, config }
    }

    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>, TtsError> {
        let mut attempt = 0u32;
        let primary_err = loop {
            match self.call_primary(text).await {
                Ok(wav) => return Ok(wav),
                Err(e) if e.is_transient() && attempt < PRIMARY_RETRIES => {
                    log::warn!("[TTS-RETRY] attempt {}: {}", attempt + 1, e);
                    tokio::time::sleep(backoff::delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => break e,
            }
        };

        if self.config.fallback_base_url.is_some() {
            log::warn!(
                "[TTS-FAILOVER] primary failed ({}), trying fallback",
                primary_err
            );
            match self.call_fallback(text).await {
                Ok(wav) => return Ok(wav),
                Err(e) => {
                    return Err(TtsError::Exhausted(format!(
                        "primary: {primary_err}; fallback: {e}"
                    )))
                }
            }
        }
        Err(TtsError::Exhausted(primary_err.to_string()))
    }

    async fn call_primary(&self, text: &str) -> Result<Vec<u8>, TtsError> {
        let url = format!("{}/tts", self.config.primary_base_url.trim_end_matches('/'));
        let payload = json!({
            "text": text,
            "description": voice_description(&self.config.voice),
        });
        self.post_for_wav(&url, payload).await
    }

    async fn call_fallback(&self, text: &str) -> Result<Vec<u8>, TtsError> {
        let base = self.config.fallback_base_url.as_deref().unwrap_or_default();
        let url = format!("{}/synthesize", base.trim_end_matches('/'));
        let payload = json!({
            "text": text,
            "voice": self.config.voice,
            "language": self.config.language,
            "format": "wav",
        });
        self.post_for_wav(&url, payload).await
    }

    async fn post_for_wav(
        &self,
        url: &str,
        payload: serde_json::Value,
    ) -> Result<Vec<u8>, TtsError> {
        let response = self.client.post(url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(TtsError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Normalize a decoded synthesis payload to pipeline-rate mono and cut it
/// into 640-byte frames, zero-padding the last.
pub fn frames_from_wav(payload: &[u8]) -> Result<Vec<Vec<u8>>, TtsError> {
    let decoded = wav::decode(payload)?;
    let mono = downmix_to_mono(&decoded.samples, decoded.channels);
    let samples = resample(&mono, decoded.sample_rate, PIPELINE_SAMPLE_RATE);
    let bytes = samples_to_bytes(&samples);

    let mut frames = Vec::with_capacity(bytes.len() / BYTES_PER_FRAME + 1);
    for chunk in bytes.chunks(BYTES_PER_FRAME) {
        let mut frame = chunk.to_vec();
        frame.resize(BYTES_PER_FRAME, 0);
        frames.push(frame);
    }
    Ok(frames)
}

/// Per-session synthesis driver. The queue consumer loop lives in the
/// coordinator; this type turns one response text into emitted frames.
pub struct StreamingTts {
    session_id: String,
    client: TtsClient,
    config: TtsConfig,
}

impl StreamingTts {
    pub fn new(session_id: impl Into<String>, config: TtsConfig) -> Self {
        Self {
            session_id: session_id.into(),
            client: TtsClient::new(config.clone()),
            config,
        }
    }

    /// Synthesize and stream one response. Returns `(segments_completed,
    /// frames_emitted)`. Cancellable at segment and frame boundaries; the
    /// in-flight synthesis request is aborted on cancel.
    pub async fn process_text(
        &self,
        text: &str,
        emitter: &dyn FrameEmitter,
        cancel: &CancellationToken,
    ) -> (u64, u64) {
        if text.trim().is_empty() {
            log::warn!("[TTS] session={} empty text", self.session_id);
            return (0, 0);
        }

        let segments = segment_text(text, self.config.target_sentences);
        log::info!(
            "[TTS-SEGMENTS] session={} {} segments from \"{}\"",
            self.session_id,
            segments.len(),
            crate::util::preview(text, 50)
        );

        let mut completed = 0u64;
        let mut total_frames = 0u64;
        for (i, segment) in segments.iter().enumerate() {
            let segment_num = (i + 1) as u32;
            if cancel.is_cancelled() {
                break;
            }
            match self
                .process_segment(segment, segment_num, emitter, cancel)
                .await
            {
                Some(frames) => {
                    completed += 1;
                    total_frames += frames;
                }
                None => break, // cancelled mid-segment
            }
        }
        (completed, total_frames)
    }

    /// Returns `None` when cancelled, otherwise the frame count.
    async fn process_segment(
        &self,
        segment: &str,
        segment_num: u32,
        emitter: &dyn FrameEmitter,
        cancel: &CancellationToken,
    ) -> Option<u64> {
        let started = Instant::now();

        let payload = tokio::select! {
            _ = cancel.cancelled() => return None,
            result = self.client.synthesize(segment) => match result {
                Ok(payload) => payload,
                Err(e) => {
                    log::warn!(
                        "[TTS-SKIP] session={} segment={} skipped: {}",
                        self.session_id,
                        segment_num,
                        e
                    );
                    return Some(0);
                }
            },
        };

        let frames = match frames_from_wav(&payload) {
            Ok(frames) => frames,
            Err(e) => {
                log::warn!(
                    "[TTS-SKIP] session={} segment={} bad audio: {}",
                    self.session_id,
                    segment_num,
                    e
                );
                return Some(0);
            }
        };

        let mut emitted = 0u64;
        let pace = Duration::from_millis(FRAME_DURATION_MS);
        for (j, frame) in frames.iter().enumerate() {
            if cancel.is_cancelled() {
                return None;
            }
            emitter.emit_frame(frame, segment_num, (j + 1) as u32).await;
            emitted += 1;

            // Real-time pacing between frames, still responsive to barge-in.
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(pace) => {}
            }
        }

        log::info!(
            "[TTS-SEGMENT-END] session={} segment={} frames={} time={}ms",
            self.session_id,
            segment_num,
            emitted,
            started.elapsed().as_millis()
        );
        Some(emitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_single_sentence() {
        let segments = segment_text("Space is big.", 2);
        assert_eq!(segments, vec!["Space is big.".to_string()]);
    }

    #[test]
    fn test_segment_pairs_sentences() {
        let segments = segment_text("One. Two. Three. Four.", 2);
        assert_eq!(segments, vec!["One. Two.", "Three. Four."]);
    }

    #[test]
    fn test_segment_respects_token_budget() {
        let long_a = "This sentence is quite long and carries a lot of words in it for testing.";
        let long_b = "Here is another similarly long sentence to go with the first one today.";
        let segments = segment_text(&format!("{long_a} {long_b}"), 2);
        // Combined they exceed the ~100 char budget, so they must not merge
        assert_eq!(segments.len(), 2);
    }

    #[test]
    fn test_segment_splits_overlong_sentence_on_whitespace() {
        let words = "word ".repeat(60);
        let segments = segment_text(&words, 2);
        assert!(segments.len() > 1);
        for s in &segments {
            assert!(s.len() <= SEGMENT_CHAR_BUDGET);
            assert!(!s.starts_with(' ') && !s.ends_with(' '));
        }
    }

    #[test]
    fn test_segment_hard_splits_without_whitespace() {
        let blob = "x".repeat(250);
        let segments = segment_text(&blob, 2);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0].len(), SEGMENT_CHAR_BUDGET);
    }

    #[test]
    fn test_segment_newline_is_boundary() {
        let segments = segment_text("First line\nSecond line", 1);
        assert_eq!(segments, vec!["First line", "Second line"]);
    }

    #[test]
    fn test_segment_semicolon_and_marks() {
        let segments = segment_text("First; second! Third?", 1);
        assert_eq!(segments, vec!["First;", "second!", "Third?"]);
    }

    #[test]
    fn test_segment_empty() {
        assert!(segment_text("", 2).is_empty());
        assert!(segment_text("   \n  ", 2).is_empty());
    }

    #[test]
    fn test_frames_from_wav_padding() {
        // 1000 samples at 16 kHz = 3 full frames + 40-sample remainder
        let samples = vec![1234i16; 1000];
        let payload = wav::encode(&samples, 16000).unwrap();
        let frames = frames_from_wav(&payload).unwrap();

        assert_eq!(frames.len(), 4);
        assert!(frames.iter().all(|f| f.len() == BYTES_PER_FRAME));
        // Last frame padded with zeros past the 40 real samples
        let last = &frames[3];
        assert_eq!(&last[80..], &vec![0u8; BYTES_PER_FRAME - 80][..]);
    }

    #[test]
    fn test_frames_from_wav_duration_law() {
        // T seconds of audio must produce ceil(T * 50) frames
        for n_samples in [16000usize, 8000, 4800, 321] {
            let samples = vec![0i16; n_samples];
            let payload = wav::encode(&samples, 16000).unwrap();
            let frames = frames_from_wav(&payload).unwrap();
            let expected = (n_samples + 319) / 320;
            assert_eq!(frames.len(), expected, "n_samples={n_samples}");
        }
    }

    #[test]
    fn test_frames_from_wav_resamples_provider_rate() {
        // A 24 kHz payload of 0.5 s should produce 25 frames at 16 kHz
        let samples = vec![500i16; 12000];
        let payload = wav::encode(&samples, 24000).unwrap();
        let frames = frames_from_wav(&payload).unwrap();
        assert_eq!(frames.len(), 25);
    }
}
