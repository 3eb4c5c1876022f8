//! Per-session latency accounting with a JSONL audit trail and a rolling
//! aggregate window for the `/metrics` surface.

use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use serde_json::json;

/// Latency budgets per stage, reported as met/not-met booleans.
const TARGET_ASR_MS: f64 = 500.0;
const TARGET_LLM_MS: f64 = 300.0;
const TARGET_TTS_MS: f64 = 200.0;
const TARGET_E2E_MS: f64 = 1000.0;

const ROLLING_WINDOW: usize = 100;

/// Accumulated measurements for one live session.
#[derive(Debug)]
pub struct SessionMetrics {
    pub session_id: String,
    started: Instant,
    pub asr_chunks: u64,
    asr_latency_total_ms: f64,
    pub asr_finals: u64,
    pub llm_requests: u64,
    pub llm_tokens: u64,
    llm_latency_total_ms: f64,
    pub tts_segments: u64,
    pub tts_frames: u64,
    tts_latency_total_ms: f64,
    e2e_latencies_ms: Vec<f64>,
    pub barge_ins: u64,
    pub errors: u64,
}

impl SessionMetrics {
    fn new(session_id: String) -> Self {
        Self {
            session_id,
            started: Instant::now(),
            asr_chunks: 0,
            asr_latency_total_ms: 0.0,
            asr_finals: 0,
            llm_requests: 0,
            llm_tokens: 0,
            llm_latency_total_ms: 0.0,
            tts_segments: 0,
            tts_frames: 0,
            tts_latency_total_ms: 0.0,
            e2e_latencies_ms: Vec::new(),
            barge_ins: 0,
            errors: 0,
        }
    }

    fn avg_asr(&self) -> f64 {
        self.asr_latency_total_ms / self.asr_chunks.max(1) as f64
    }

    fn avg_llm(&self) -> f64 {
        self.llm_latency_total_ms / self.llm_requests.max(1) as f64
    }

    fn avg_tts(&self) -> f64 {
        self.tts_latency_total_ms / self.tts_segments.max(1) as f64
    }

    fn avg_e2e(&self) -> f64 {
        if self.e2e_latencies_ms.is_empty() {
            0.0
        } else {
            self.e2e_latencies_ms.iter().sum::<f64>() / self.e2e_latencies_ms.len() as f64
        }
    }

    fn summary(&self) -> serde_json::Value {
        json!({
            "session_id": self.session_id,
            "duration_s": round2(self.started.elapsed().as_secs_f64()),
            "asr": {
                "chunks": self.asr_chunks,
                "finals": self.asr_finals,
                "avg_latency_ms": round2(self.avg_asr()),
            },
            "llm": {
                "requests": self.llm_requests,
                "tokens": self.llm_tokens,
                "avg_latency_ms": round2(self.avg_llm()),
            },
            "tts": {
                "segments": self.tts_segments,
                "frames": self.tts_frames,
                "avg_latency_ms": round2(self.avg_tts()),
            },
            "e2e": {
                "measurements": self.e2e_latencies_ms.len(),
                "avg_latency_ms": round2(self.avg_e2e()),
                "min_latency_ms": round2(self.e2e_latencies_ms.iter().cloned().fold(f64::NAN, f64::min)),
                "max_latency_ms": round2(self.e2e_latencies_ms.iter().cloned().fold(f64::NAN, f64::max)),
            },
            "barge_ins": self.barge_ins,
            "errors": self.errors,
        })
    }
}

fn round2(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        (v * 100.0).round() / 100.0
    }
}

#[derive(Default)]
struct RollingWindow {
    asr: VecDeque<f64>,
    llm: VecDeque<f64>,
    tts: VecDeque<f64>,
    e2e: VecDeque<f64>,
}

fn push_windowed(window: &mut VecDeque<f64>, value: f64) {
    if window.len() == ROLLING_WINDOW {
        window.pop_front();
    }
    window.push_back(value);
}

fn avg(window: &VecDeque<f64>) -> f64 {
    if window.is_empty() {
        0.0
    } else {
        window.iter().sum::<f64>() / window.len() as f64
    }
}

struct MetricsInner {
    active: HashMap<String, SessionMetrics>,
    window: RollingWindow,
    total_sessions: u64,
    total_errors: u64,
    total_barge_ins: u64,
}

/// Aggregate snapshot for the observability surface.
#[derive(Debug, Serialize)]
pub struct AggregateMetrics {
    pub active_sessions: usize,
    pub total_sessions: u64,
    pub total_errors: u64,
    pub total_barge_ins: u64,
    pub avg_latencies_ms: LatencyAverages,
    pub latency_targets: LatencyTargets,
}

#[derive(Debug, Serialize)]
pub struct LatencyAverages {
    pub asr: f64,
    pub llm: f64,
    pub tts: f64,
    pub e2e: f64,
}

#[derive(Debug, Serialize)]
pub struct LatencyTargets {
    pub asr: TargetStatus,
    pub llm: TargetStatus,
    pub tts: TargetStatus,
    pub e2e: TargetStatus,
}

#[derive(Debug, Serialize)]
pub struct TargetStatus {
    pub target_ms: f64,
    pub met: bool,
}

/// Collects per-session metrics, appends one JSON line per finished session
/// to the metrics file, and keeps a rolling window of recent averages.
pub struct MetricsManager {
    save_path: Option<PathBuf>,
    inner: Mutex<MetricsInner>,
}

impl MetricsManager {
    pub fn new(save_path: Option<PathBuf>) -> Self {
        if let Some(path) = &save_path {
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    log::warn!("[METRICS] cannot create {}: {}", parent.display(), e);
                }
            }
        }
        log::info!("[METRICS-MANAGER] save_path={:?}", save_path);
        Self {
            save_path,
            inner: Mutex::new(MetricsInner {
                active: HashMap::new(),
                window: RollingWindow::default(),
                total_sessions: 0,
                total_errors: 0,
                total_barge_ins: 0,
            }),
        }
    }

    pub fn create_session(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .active
            .insert(session_id.to_string(), SessionMetrics::new(session_id.to_string()));
        inner.total_sessions += 1;
    }

    pub fn record_asr_chunk(&self, session_id: &str, latency_ms: f64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(m) = inner.active.get_mut(session_id) {
            m.asr_chunks += 1;
            m.asr_latency_total_ms += latency_ms;
        }
    }

    pub fn record_asr_final(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(m) = inner.active.get_mut(session_id) {
            m.asr_finals += 1;
        }
    }

    pub fn record_llm(&self, session_id: &str, tokens: u64, latency_ms: f64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(m) = inner.active.get_mut(session_id) {
            m.llm_requests += 1;
            m.llm_tokens += tokens;
            m.llm_latency_total_ms += latency_ms;
        }
    }

    pub fn record_tts_response(&self, session_id: &str, segments: u64, frames: u64, latency_ms: f64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(m) = inner.active.get_mut(session_id) {
            m.tts_segments += segments;
            m.tts_frames += frames;
            m.tts_latency_total_ms += latency_ms;
        }
    }

    pub fn record_e2e(&self, session_id: &str, latency_ms: f64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(m) = inner.active.get_mut(session_id) {
            m.e2e_latencies_ms.push(latency_ms);
        }
    }

    pub fn record_barge_in(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(m) = inner.active.get_mut(session_id) {
            m.barge_ins += 1;
        }
    }

    pub fn record_error(&self, session_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(m) = inner.active.get_mut(session_id) {
            m.errors += 1;
        }
    }

    /// Close out a session: fold its averages into the rolling window and
    /// append the summary line to the metrics file.
    pub fn finalize_session(&self, session_id: &str) {
        let summary = {
            let mut inner = self.inner.lock().unwrap();
            let Some(metrics) = inner.active.remove(session_id) else {
                return;
            };

            if metrics.asr_chunks > 0 {
                let v = metrics.avg_asr();
                push_windowed(&mut inner.window.asr, v);
            }
            if metrics.llm_requests > 0 {
                let v = metrics.avg_llm();
                push_windowed(&mut inner.window.llm, v);
            }
            if metrics.tts_segments > 0 {
                let v = metrics.avg_tts();
                push_windowed(&mut inner.window.tts, v);
            }
            if !metrics.e2e_latencies_ms.is_empty() {
                let v = metrics.avg_e2e();
                push_windowed(&mut inner.window.e2e, v);
            }
            inner.total_errors += metrics.errors;
            inner.total_barge_ins += metrics.barge_ins;

            metrics.summary()
        };

        log::info!("[METRICS-SUMMARY] {}", summary);
        self.append_line(&summary);
    }

    fn append_line(&self, summary: &serde_json::Value) {
        let Some(path) = &self.save_path else {
            return;
        };
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let mut record = summary.clone();
        if let Some(obj) = record.as_object_mut() {
            obj.insert("timestamp".to_string(), json!(timestamp));
        }

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{}", record));
        if let Err(e) = result {
            log::error!("[METRICS] failed to save: {}", e);
        }
    }

    pub fn aggregate(&self) -> AggregateMetrics {
        let inner = self.inner.lock().unwrap();
        let asr = avg(&inner.window.asr);
        let llm = avg(&inner.window.llm);
        let tts = avg(&inner.window.tts);
        let e2e = avg(&inner.window.e2e);

        AggregateMetrics {
            active_sessions: inner.active.len(),
            total_sessions: inner.total_sessions,
            total_errors: inner.total_errors,
            total_barge_ins: inner.total_barge_ins,
            avg_latencies_ms: LatencyAverages {
                asr: round2(asr),
                llm: round2(llm),
                tts: round2(tts),
                e2e: round2(e2e),
            },
            latency_targets: LatencyTargets {
                asr: TargetStatus {
                    target_ms: TARGET_ASR_MS,
                    met: asr < TARGET_ASR_MS,
                },
                llm: TargetStatus {
                    target_ms: TARGET_LLM_MS,
                    met: llm < TARGET_LLM_MS,
                },
                tts: TargetStatus {
                    target_ms: TARGET_TTS_MS,
                    met: tts < TARGET_TTS_MS,
                },
                e2e: TargetStatus {
                    target_ms: TARGET_E2E_MS,
                    met: e2e < TARGET_E2E_MS,
                },
            },
        }
    }
}
