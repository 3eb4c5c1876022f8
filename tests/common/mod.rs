//! Shared test fixtures: an in-process mock of the three provider endpoints
//! and a room handle that records everything the pipeline publishes.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures_util::StreamExt;
use serde_json::json;

use voxbridge::transport::{Datagram, RoomHandle, TransportError};
use voxbridge::Settings;

/// Behavior knobs for the mock providers, adjustable per test.
pub struct MockState {
    /// Text returned by the transcription endpoint.
    pub asr_text: Mutex<String>,
    /// Number of leading transcription calls to fail with 503.
    pub asr_failures: AtomicU32,
    pub asr_calls: AtomicU32,

    /// Full response streamed by the chat endpoint, split into word deltas.
    pub llm_text: Mutex<String>,
    /// Delay between SSE deltas.
    pub llm_delta_delay_ms: u64,
    pub llm_calls: AtomicU32,

    /// Duration of synthesized audio returned per segment.
    pub tts_audio_ms: u64,
    pub tts_calls: AtomicU32,
}

impl MockState {
    pub fn new() -> Self {
        Self {
            asr_text: Mutex::new("tell me a fact about space".to_string()),
            asr_failures: AtomicU32::new(0),
            asr_calls: AtomicU32::new(0),
            llm_text: Mutex::new("The moon orbits the Earth. It is very far away.".to_string()),
            llm_delta_delay_ms: 0,
            llm_calls: AtomicU32::new(0),
            tts_audio_ms: 100,
            tts_calls: AtomicU32::new(0),
        }
    }
}

async fn transcriptions(State(state): State<Arc<MockState>>) -> Response {
    state.asr_calls.fetch_add(1, Ordering::SeqCst);
    let failures = state.asr_failures.load(Ordering::SeqCst);
    if failures > 0 {
        state.asr_failures.fetch_sub(1, Ordering::SeqCst);
        return (StatusCode::SERVICE_UNAVAILABLE, "overloaded").into_response();
    }
    let text = state.asr_text.lock().unwrap().clone();
    Json(json!({ "text": text })).into_response()
}

async fn chat_completions(State(state): State<Arc<MockState>>) -> Response {
    state.llm_calls.fetch_add(1, Ordering::SeqCst);
    let text = state.llm_text.lock().unwrap().clone();
    let delay = Duration::from_millis(state.llm_delta_delay_ms);

    let mut events: Vec<String> = text
        .split_inclusive(' ')
        .map(|word| {
            let chunk = json!({ "choices": [{ "delta": { "content": word } }] });
            format!("data: {chunk}\n\n")
        })
        .collect();
    events.push("data: [DONE]\n\n".to_string());

    let stream = futures_util::stream::iter(events).then(move |event| async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok::<_, Infallible>(Bytes::from(event))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn tts(State(state): State<Arc<MockState>>) -> Response {
    state.tts_calls.fetch_add(1, Ordering::SeqCst);
    let n_samples = (16_000 * state.tts_audio_ms / 1000) as usize;
    let samples: Vec<i16> = (0..n_samples)
        .map(|i| ((i as f32 * 0.2).sin() * 8000.0) as i16)
        .collect();
    let wav = encode_wav(&samples, 16_000);

    Response::builder()
        .header(header::CONTENT_TYPE, "audio/wav")
        .body(Body::from(wav))
        .unwrap()
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// Spawn the mock provider server; returns its base URL.
pub async fn spawn_mock_providers(state: Arc<MockState>) -> String {
    let router = Router::new()
        .route("/audio/transcriptions", post(transcriptions))
        .route("/chat/completions", post(chat_completions))
        .route("/tts", post(tts))
        .route("/health", get(health))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

fn encode_wav(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

/// Settings tuned for fast tests, pointed at the mock providers.
pub fn test_settings(base_url: &str) -> Settings {
    Settings {
        whisper_base_url: base_url.to_string(),
        llm_base_url: base_url.to_string(),
        parler_tts_base_url: base_url.to_string(),
        xtts_tts_base_url: None,
        asr_window_ms: 100,
        asr_slide_ms: 50,
        asr_silence_ms: 100,
        asr_silence_rms: 250.0,
        enable_metrics: false,
        ..Settings::default()
    }
}

#[derive(Debug, Clone)]
pub enum RoomEvent {
    Datagram { datagram: Datagram, reliable: bool },
    TrackFrame { bytes: usize },
}

/// Records everything the pipeline publishes to the participant.
pub struct MockRoom {
    pub events: Mutex<Vec<RoomEvent>>,
}

impl MockRoom {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn datagrams(&self) -> Vec<Datagram> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                RoomEvent::Datagram { datagram, .. } => Some(datagram.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count_tts_chunks(&self) -> usize {
        self.datagrams()
            .iter()
            .filter(|d| matches!(d, Datagram::TtsChunk { .. }))
            .count()
    }

    pub fn track_frames(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, RoomEvent::TrackFrame { .. }))
            .count()
    }

    /// Audio fan-out goes over the unreliable channel; everything else is
    /// reliable.
    pub fn channel_usage_ok(&self) -> bool {
        self.events.lock().unwrap().iter().all(|e| match e {
            RoomEvent::Datagram { datagram, reliable } => match datagram {
                Datagram::TtsChunk { .. } => !reliable,
                _ => *reliable,
            },
            RoomEvent::TrackFrame { .. } => true,
        })
    }

    /// Every outbound track frame is 20 ms of PCM16 at 16 kHz (640 bytes).
    pub fn track_frames_sized(&self, expected: usize) -> bool {
        self.events.lock().unwrap().iter().all(|e| match e {
            RoomEvent::TrackFrame { bytes } => *bytes == expected,
            _ => true,
        })
    }

    /// Poll until `pred` holds over the published datagrams, or time out.
    pub async fn wait_for<F>(&self, pred: F, timeout: Duration) -> bool
    where
        F: Fn(&[Datagram]) -> bool,
    {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if pred(&self.datagrams()) {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl RoomHandle for MockRoom {
    async fn publish_data(&self, data: Vec<u8>, reliable: bool) -> Result<(), TransportError> {
        if let Ok(datagram) = Datagram::from_bytes(&data) {
            self.events
                .lock()
                .unwrap()
                .push(RoomEvent::Datagram { datagram, reliable });
        }
        Ok(())
    }

    async fn write_audio_frame(&self, pcm: Vec<u8>) -> Result<(), TransportError> {
        self.events
            .lock()
            .unwrap()
            .push(RoomEvent::TrackFrame { bytes: pcm.len() });
        Ok(())
    }
}

/// 10 ms of 48 kHz stereo at the given amplitude.
pub fn stereo_frame(amplitude: i16) -> voxbridge::transport::PcmFrame {
    voxbridge::transport::PcmFrame {
        samples: vec![amplitude; 960],
        sample_rate: 48_000,
        channels: 2,
        samples_per_channel: 480,
    }
}

/// Push `ms` milliseconds of audio into the session in 10 ms frames.
pub fn push_audio(ctx: &voxbridge::pipeline::SessionContext, amplitude: i16, ms: u64) {
    for _ in 0..(ms / 10) {
        ctx.push_frame(stereo_frame(amplitude));
    }
}
