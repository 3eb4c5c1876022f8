//! The pipeline coordinator: owns the session registry, wires the three
//! streaming stages together per session, and handles barge-in and
//! teardown.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use base64::Engine;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::asr::{AsrConfig, StreamingAsr, Transcript};
use crate::audio::ingress::AudioIngress;
use crate::config::Settings;
use crate::error::{PipelineError, Result};
use crate::llm::{LlmClient, LlmConfig, LlmOutcome};
use crate::metrics::MetricsManager;
use crate::pipeline::session::SessionContext;
use crate::transport::{Datagram, RoomHandle};
use crate::tts::{FrameEmitter, StreamingTts, TtsConfig};

/// How long a barge-in waits for the TTS consumer to wind down before the
/// task is abandoned to die at its next cancellation point.
const BARGE_IN_GRACE: Duration = Duration::from_millis(200);

/// Deadline for enqueueing a finalized response before it is dropped.
const TTS_ENQUEUE_DEADLINE: Duration = Duration::from_millis(500);

/// Per-frame budget for each fan-out sink (audio track, datagram).
const FRAME_PUBLISH_TIMEOUT: Duration = Duration::from_millis(200);

/// Bound on task shutdown waits during session teardown.
const TEARDOWN_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Cadence of the idle-session sweep.
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Orchestrates ASR → LLM → TTS per session and enforces the concurrent
/// session quota.
pub struct PipelineCoordinator {
    settings: Arc<Settings>,
    metrics: Arc<MetricsManager>,
    sessions: Mutex<HashMap<String, Arc<SessionContext>>>,
}

impl PipelineCoordinator {
    pub fn new(settings: Arc<Settings>, metrics: Arc<MetricsManager>) -> Self {
        log::info!("[COORDINATOR-INIT] max_sessions={}", settings.max_concurrent_sessions);
        Self {
            settings,
            metrics,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Create a session for a newly joined participant and start its stage
    /// tasks. Fails synchronously on quota or duplicate id, leaving no
    /// partial state behind.
    pub fn create_session(
        &self,
        session_id: &str,
        room: Arc<dyn RoomHandle>,
    ) -> Result<Arc<SessionContext>> {
        let ctx = {
            let mut sessions = self.sessions.lock().unwrap();
            if sessions.contains_key(session_id) {
                return Err(PipelineError::SessionExists(session_id.to_string()));
            }
            if sessions.len() >= self.settings.max_concurrent_sessions {
                return Err(PipelineError::SessionQuota {
                    active: sessions.len(),
                    limit: self.settings.max_concurrent_sessions,
                });
            }

            let (ctx, frame_rx) = SessionContext::new(session_id, room, &self.settings);
            sessions.insert(session_id.to_string(), ctx.clone());
            self.metrics.create_session(session_id);
            self.start_stage_tasks(&ctx, frame_rx);
            ctx
        };

        log::info!("[PIPELINE-START] session={}", session_id);
        Ok(ctx)
    }

    fn start_stage_tasks(
        &self,
        ctx: &Arc<SessionContext>,
        frame_rx: mpsc::Receiver<crate::transport::PcmFrame>,
    ) {
        // Audio ingress: transport frames → rolling buffer.
        let ingress = AudioIngress::new(
            ctx.session_id.clone(),
            ctx.ring.clone(),
            ctx.ingress_stats.clone(),
            self.settings.log_frames_every,
        );
        let ingress_handle = tokio::spawn(ingress.run(frame_rx, ctx.shutdown.child_token()));

        // ASR windower feeding the transcript driver.
        let (transcript_tx, transcript_rx) = mpsc::channel::<Transcript>(32);
        let asr = StreamingAsr::new(
            ctx.session_id.clone(),
            AsrConfig::from_settings(&self.settings),
            ctx.ring.clone(),
            transcript_tx,
        );
        let asr_handle = tokio::spawn(asr.run(ctx.shutdown.child_token()));

        let driver_handle = tokio::spawn(transcript_driver(
            ctx.clone(),
            self.metrics.clone(),
            Arc::new(LlmClient::new(LlmConfig::from_settings(&self.settings))),
            transcript_rx,
        ));

        {
            let mut tasks = ctx.tasks.lock().unwrap();
            tasks.push(ingress_handle);
            tasks.push(asr_handle);
            tasks.push(driver_handle);
        }

        // TTS consumer draining the finalized-response queue.
        let tts_handle = spawn_tts_consumer(ctx.clone(), self.metrics.clone(), &self.settings);
        *ctx.tts_task.lock().unwrap() = Some(tts_handle);
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<SessionContext>> {
        self.sessions.lock().unwrap().get(session_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Route one inbound reliable datagram from the participant.
    pub async fn handle_inbound_datagram(&self, session_id: &str, data: &[u8]) {
        match Datagram::from_bytes(data) {
            Ok(Datagram::BargeIn) => {
                if let Err(e) = self.handle_barge_in(session_id).await {
                    log::warn!("[DATA-RX] barge-in for {} failed: {}", session_id, e);
                }
            }
            Ok(other) => {
                log::warn!(
                    "[DATA-RX] session={} unexpected inbound datagram: {:?}",
                    session_id,
                    other
                );
            }
            Err(e) => {
                log::warn!("[DATA-RX] session={} malformed datagram: {}", session_id, e);
            }
        }
    }

    /// User speech over agent speech: stop the agent within the grace budget
    /// and get ready for the next utterance.
    pub async fn handle_barge_in(&self, session_id: &str) -> Result<()> {
        let Some(ctx) = self.get_session(session_id) else {
            log::warn!("[BARGE-IN] no active session for {}", session_id);
            return Err(PipelineError::SessionNotFound(session_id.to_string()));
        };
        if !ctx.is_active.load(Ordering::SeqCst) {
            log::warn!("[BARGE-IN] session {} already inactive", session_id);
            return Ok(());
        }

        log::warn!("[BARGE-IN] user interrupted agent in {}", session_id);
        ctx.counters.barge_ins.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_barge_in(session_id);

        // 1. Stop the TTS consumer, bounded by the grace period.
        ctx.tts_cancel.lock().unwrap().cancel();
        let consumer = ctx.tts_task.lock().unwrap().take();
        if let Some(handle) = consumer {
            if tokio::time::timeout(BARGE_IN_GRACE, handle).await.is_err() {
                // The task dies at its next frame boundary; we stop waiting.
                log::warn!("[BARGE-IN] TTS consumer abandoned after grace period");
            }
        }

        // 2. Cancel any in-flight LLM generation.
        ctx.cancel_llm();

        // 3. Discard queued responses.
        let flushed = ctx.tts_queue.clear();
        if flushed > 0 {
            log::info!("[BARGE-IN] flushed {} queued responses", flushed);
        }

        // 4. The agent is no longer speaking.
        ctx.is_agent_speaking.store(false, Ordering::SeqCst);
        ctx.awaiting_first_frame.store(false, Ordering::SeqCst);

        // 5. Tell the client.
        ctx.publish(&Datagram::AgentInterrupted, true).await;

        // 6. Fresh consumer for the next response.
        let handle = spawn_tts_consumer(ctx.clone(), self.metrics.clone(), &self.settings);
        *ctx.tts_task.lock().unwrap() = Some(handle);

        log::info!("[BARGE-IN] ready for new input from {}", session_id);
        Ok(())
    }

    /// Tear down a session: cancel and join its tasks, drain queues, and
    /// write the final metrics record.
    pub async fn destroy_session(&self, session_id: &str) -> Result<()> {
        let Some(ctx) = self.sessions.lock().unwrap().remove(session_id) else {
            return Err(PipelineError::SessionNotFound(session_id.to_string()));
        };

        ctx.is_active.store(false, Ordering::SeqCst);
        ctx.shutdown.cancel();

        let mut handles: Vec<JoinHandle<()>> = ctx.tasks.lock().unwrap().drain(..).collect();
        if let Some(tts) = ctx.tts_task.lock().unwrap().take() {
            handles.push(tts);
        }
        for handle in handles {
            if tokio::time::timeout(TEARDOWN_JOIN_TIMEOUT, handle).await.is_err() {
                log::warn!("[PIPELINE-END] session={} task join timed out", session_id);
            }
        }

        ctx.tts_queue.clear();
        self.metrics.finalize_session(session_id);

        log::info!(
            "[PIPELINE-END] session={} barge_ins={} errors={}",
            session_id,
            ctx.counters.barge_ins.load(Ordering::Relaxed),
            ctx.counters.errors.load(Ordering::Relaxed)
        );
        Ok(())
    }

    /// Reclaim sessions that have gone silent past the configured expiry,
    /// as if the participant disconnected.
    pub async fn sweep_idle(&self) {
        let expiry = self.settings.session_expiry();
        let expired: Vec<String> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .iter()
                .filter(|(_, ctx)| ctx.idle_for() > expiry)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for session_id in expired {
            log::info!("[SESSION-EXPIRED] session={} idle past limit", session_id);
            let _ = self.destroy_session(&session_id).await;
        }
    }

    /// Background sweep loop; runs until cancelled.
    pub async fn run_expiry_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.sweep_idle().await,
            }
        }
    }

    /// Destroy every active session (process shutdown).
    pub async fn shutdown_all(&self) {
        let ids: Vec<String> = self.sessions.lock().unwrap().keys().cloned().collect();
        for id in ids {
            let _ = self.destroy_session(&id).await;
        }
    }
}

/// Consumes transcript events for one session: publishes partials/finals and
/// launches the LLM exchange on each non-empty final.
async fn transcript_driver(
    ctx: Arc<SessionContext>,
    metrics: Arc<MetricsManager>,
    llm: Arc<LlmClient>,
    mut events: mpsc::Receiver<Transcript>,
) {
    while let Some(transcript) = events.recv().await {
        if !ctx.is_active.load(Ordering::SeqCst) {
            break;
        }

        if !transcript.is_final {
            ctx.counters.asr_chunks.fetch_add(1, Ordering::Relaxed);
            metrics.record_asr_chunk(&ctx.session_id, transcript.latency_ms as f64);
            ctx.publish(
                &Datagram::AsrPartial {
                    text: transcript.text,
                },
                true,
            )
            .await;
            continue;
        }

        metrics.record_asr_final(&ctx.session_id);
        ctx.publish(
            &Datagram::AsrFinal {
                text: transcript.text.clone(),
            },
            true,
        )
        .await;

        // Empty finals (flush artifacts) never reach the LLM.
        if transcript.text.trim().is_empty() {
            continue;
        }

        *ctx.last_asr_final.lock().unwrap() = Some(Instant::now());
        log::info!(
            "[ASR-FINAL] session={} triggering LLM for \"{}\"",
            ctx.session_id,
            transcript.text
        );

        let token = ctx.restart_llm_token();
        let handle = tokio::spawn(run_llm_exchange(
            ctx.clone(),
            metrics.clone(),
            llm.clone(),
            transcript.text,
            token,
        ));
        ctx.tasks.lock().unwrap().push(handle);
    }
}

/// One LLM exchange: stream tokens, publish partials and the final, commit
/// history, and enqueue the response for synthesis. Cancellation emits and
/// commits nothing.
async fn run_llm_exchange(
    ctx: Arc<SessionContext>,
    metrics: Arc<MetricsManager>,
    llm: Arc<LlmClient>,
    user_text: String,
    cancel: CancellationToken,
) {
    let messages = ctx.history.lock().unwrap().build_messages(&user_text);

    let (partial_tx, mut partial_rx) = mpsc::channel::<String>(8);
    let forwarder = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            while let Some(text) = partial_rx.recv().await {
                ctx.publish(&Datagram::LlmPartial { text }, true).await;
            }
        })
    };

    let started = Instant::now();
    let outcome = llm.stream_chat(messages, partial_tx, cancel).await;
    // Let queued partials flush before the final so the reliable channel
    // stays monotonic.
    let _ = forwarder.await;

    match outcome {
        Ok(LlmOutcome::Complete { text, tokens }) => {
            let elapsed_ms = started.elapsed().as_millis() as f64;
            ctx.counters.llm_tokens.fetch_add(tokens, Ordering::Relaxed);
            metrics.record_llm(&ctx.session_id, tokens, elapsed_ms);

            ctx.publish(&Datagram::LlmFinal { text: text.clone() }, true)
                .await;
            log::info!(
                "[LLM-FINAL] session={} tokens={} time={:.0}ms",
                ctx.session_id,
                tokens,
                elapsed_ms
            );

            // A stream that closed with no content commits no turn and
            // synthesizes nothing.
            if text.trim().is_empty() {
                return;
            }

            ctx.history.lock().unwrap().commit_turn(&user_text, &text);
            ctx.is_agent_speaking.store(true, Ordering::SeqCst);
            ctx.awaiting_first_frame.store(true, Ordering::SeqCst);

            if !ctx.tts_queue.push(text, TTS_ENQUEUE_DEADLINE).await {
                log::warn!(
                    "[TTS-QUEUE] session={} queue full, response dropped",
                    ctx.session_id
                );
            }
        }
        Ok(LlmOutcome::Cancelled) => {
            log::info!("[LLM-CANCELLED] session={}", ctx.session_id);
        }
        Err(e) => {
            ctx.counters.errors.fetch_add(1, Ordering::Relaxed);
            metrics.record_error(&ctx.session_id);
            log::error!("[LLM-ERROR] session={}: {}", ctx.session_id, e);
        }
    }
}

/// Fans each synthesized frame out to the audio track and the unreliable
/// datagram channel, and closes the end-to-end latency measurement on the
/// first frame of a response.
struct SessionEmitter {
    ctx: Arc<SessionContext>,
    metrics: Arc<MetricsManager>,
}

#[async_trait::async_trait]
impl FrameEmitter for SessionEmitter {
    async fn emit_frame(&self, pcm: &[u8], segment: u32, frame: u32) {
        self.ctx.counters.tts_frames.fetch_add(1, Ordering::Relaxed);

        if self.ctx.awaiting_first_frame.swap(false, Ordering::SeqCst) {
            let last_final = *self.ctx.last_asr_final.lock().unwrap();
            if let Some(t0) = last_final {
                let e2e_ms = t0.elapsed().as_millis() as f64;
                self.metrics.record_e2e(&self.ctx.session_id, e2e_ms);
                log::info!(
                    "[E2E-LATENCY] session={} speech→voice {:.0}ms",
                    self.ctx.session_id,
                    e2e_ms
                );
            }
        }

        // Neither sink may stall the other past the per-frame budget.
        let track = self.ctx.room.write_audio_frame(pcm.to_vec());
        match tokio::time::timeout(FRAME_PUBLISH_TIMEOUT, track).await {
            Ok(Err(e)) => {
                self.ctx.counters.errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("[TTS-TRACK] session={} {}", self.ctx.session_id, e);
            }
            Err(_) => {
                log::warn!("[TTS-TRACK] session={} frame publish timed out", self.ctx.session_id);
            }
            Ok(Ok(())) => {}
        }

        let chunk = Datagram::TtsChunk {
            audio: base64::engine::general_purpose::STANDARD.encode(pcm),
            segment,
            frame,
        };
        let publish = self.ctx.publish(&chunk, false);
        if tokio::time::timeout(FRAME_PUBLISH_TIMEOUT, publish).await.is_err() {
            log::warn!("[TTS-EMIT] session={} datagram publish timed out", self.ctx.session_id);
        }

        if frame % 25 == 0 {
            log::debug!(
                "[TTS-EMIT] session={} segment={} frame={}",
                self.ctx.session_id,
                segment,
                frame
            );
        }
    }
}

/// Start a TTS consumer for the session and return its handle. The consumer
/// owns a fresh cancellation token; barge-in cancels it and spawns a
/// replacement.
fn spawn_tts_consumer(
    ctx: Arc<SessionContext>,
    metrics: Arc<MetricsManager>,
    settings: &Settings,
) -> JoinHandle<()> {
    let token = ctx.restart_tts_token();
    let tts = StreamingTts::new(ctx.session_id.clone(), TtsConfig::from_settings(settings));
    let emitter = SessionEmitter {
        ctx: ctx.clone(),
        metrics: metrics.clone(),
    };

    tokio::spawn(async move {
        log::info!("[TTS-CONSUMER-START] session={}", ctx.session_id);
        loop {
            let text = tokio::select! {
                _ = token.cancelled() => break,
                text = ctx.tts_queue.pop() => text,
            };

            log::info!(
                "[TTS-QUEUE-POP] session={} queue_length={} text=\"{}\"",
                ctx.session_id,
                ctx.tts_queue.len(),
                crate::util::preview(&text, 50)
            );

            let started = Instant::now();
            let (segments, frames) = tts.process_text(&text, &emitter, &token).await;
            metrics.record_tts_response(
                &ctx.session_id,
                segments,
                frames,
                started.elapsed().as_millis() as f64,
            );

            if ctx.tts_queue.is_empty() {
                ctx.is_agent_speaking.store(false, Ordering::SeqCst);
            }
        }
        log::info!("[TTS-CONSUMER-STOP] session={}", ctx.session_id);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use async_trait::async_trait;

    struct NullRoom;

    #[async_trait]
    impl RoomHandle for NullRoom {
        async fn publish_data(
            &self,
            _data: Vec<u8>,
            _reliable: bool,
        ) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn write_audio_frame(&self, _pcm: Vec<u8>) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    fn coordinator(max_sessions: usize) -> Arc<PipelineCoordinator> {
        let mut settings = Settings::default();
        settings.max_concurrent_sessions = max_sessions;
        Arc::new(PipelineCoordinator::new(
            Arc::new(settings),
            Arc::new(MetricsManager::new(None)),
        ))
    }

    #[tokio::test]
    async fn test_create_and_destroy_session() {
        let coordinator = coordinator(5);
        let ctx = coordinator
            .create_session("s1", Arc::new(NullRoom))
            .unwrap();
        assert_eq!(coordinator.session_count(), 1);
        assert!(ctx.is_active.load(Ordering::SeqCst));

        coordinator.destroy_session("s1").await.unwrap();
        assert_eq!(coordinator.session_count(), 0);
        assert!(!ctx.is_active.load(Ordering::SeqCst));
        assert!(ctx.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_quota_enforced() {
        let coordinator = coordinator(1);
        coordinator.create_session("s1", Arc::new(NullRoom)).unwrap();

        let err = coordinator
            .create_session("s2", Arc::new(NullRoom))
            .unwrap_err();
        assert!(matches!(err, PipelineError::SessionQuota { active: 1, limit: 1 }));
        // The rejected session left no state behind
        assert_eq!(coordinator.session_count(), 1);
        assert!(coordinator.get_session("s2").is_none());

        coordinator.destroy_session("s1").await.unwrap();
        // Slot freed: a new session fits again
        coordinator.create_session("s3", Arc::new(NullRoom)).unwrap();
        coordinator.destroy_session("s3").await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected() {
        let coordinator = coordinator(5);
        coordinator.create_session("dup", Arc::new(NullRoom)).unwrap();
        let err = coordinator
            .create_session("dup", Arc::new(NullRoom))
            .unwrap_err();
        assert!(matches!(err, PipelineError::SessionExists(_)));
        coordinator.destroy_session("dup").await.unwrap();
    }

    #[tokio::test]
    async fn test_destroy_unknown_session() {
        let coordinator = coordinator(5);
        assert!(matches!(
            coordinator.destroy_session("ghost").await,
            Err(PipelineError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_barge_in_flushes_queue_and_counts() {
        let coordinator = coordinator(5);
        let ctx = coordinator
            .create_session("s1", Arc::new(NullRoom))
            .unwrap();

        // Simulate a speaking agent with queued responses
        ctx.is_agent_speaking.store(true, Ordering::SeqCst);
        ctx.tts_queue
            .push("pending answer".into(), Duration::from_millis(10))
            .await;

        coordinator.handle_barge_in("s1").await.unwrap();

        assert!(ctx.tts_queue.is_empty());
        assert!(!ctx.is_agent_speaking.load(Ordering::SeqCst));
        assert_eq!(ctx.counters.barge_ins.load(Ordering::Relaxed), 1);
        // A replacement consumer is installed
        assert!(ctx.tts_task.lock().unwrap().is_some());

        coordinator.destroy_session("s1").await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_inbound_datagram_is_dropped() {
        let coordinator = coordinator(5);
        let ctx = coordinator
            .create_session("s1", Arc::new(NullRoom))
            .unwrap();

        coordinator.handle_inbound_datagram("s1", b"{garbage").await;
        coordinator
            .handle_inbound_datagram("s1", br#"{"type":"llm_partial","text":"x"}"#)
            .await;
        // Neither counted as a barge-in
        assert_eq!(ctx.counters.barge_ins.load(Ordering::Relaxed), 0);

        coordinator.destroy_session("s1").await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_sweep_reclaims_session() {
        let mut settings = Settings::default();
        settings.max_concurrent_sessions = 5;
        settings.session_expiry_minutes = 0; // everything is instantly idle
        let coordinator = Arc::new(PipelineCoordinator::new(
            Arc::new(settings),
            Arc::new(MetricsManager::new(None)),
        ));

        coordinator.create_session("s1", Arc::new(NullRoom)).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator.sweep_idle().await;
        assert_eq!(coordinator.session_count(), 0);
    }
}
