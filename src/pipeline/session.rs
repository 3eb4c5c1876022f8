//! Per-session state: counters, rolling buffer, bounded TTS queue,
//! cancellation handles, and the conversation history.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::ingress::IngressStats;
use crate::audio::ring::RollingBuffer;
use crate::audio::MAX_BUFFER_SAMPLES;
use crate::config::Settings;
use crate::llm::ConversationHistory;
use crate::transport::{Datagram, PcmFrame, RoomHandle};

/// Finalized responses wait here for the TTS consumer. Bounded FIFO with
/// asyncio-queue semantics: `push` blocks up to a deadline when full, then
/// drops; `pop` waits for the next item; `clear` flushes everything.
pub struct TtsQueue {
    items: Mutex<VecDeque<String>>,
    capacity: usize,
    added: Notify,
    removed: Notify,
}

impl TtsQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
            added: Notify::new(),
            removed: Notify::new(),
        }
    }

    /// Enqueue a response. Waits up to `deadline` for space, then gives up
    /// and returns false.
    pub async fn push(&self, text: String, deadline: Duration) -> bool {
        let give_up = Instant::now() + deadline;
        loop {
            let waiter = self.removed.notified();
            {
                let mut items = self.items.lock().unwrap();
                if items.len() < self.capacity {
                    items.push_back(text);
                    self.added.notify_one();
                    return true;
                }
            }
            let now = Instant::now();
            if now >= give_up {
                return false;
            }
            if tokio::time::timeout(give_up - now, waiter).await.is_err() {
                return false;
            }
        }
    }

    /// Wait for the next response. Callers pair this with a cancellation
    /// token in a `select!`.
    pub async fn pop(&self) -> String {
        loop {
            let waiter = self.added.notified();
            {
                let mut items = self.items.lock().unwrap();
                if let Some(text) = items.pop_front() {
                    self.removed.notify_one();
                    return text;
                }
            }
            waiter.await;
        }
    }

    /// Discard all queued responses. Returns the number flushed.
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock().unwrap();
        let flushed = items.len();
        items.clear();
        self.removed.notify_waiters();
        flushed
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Event counters for one session.
#[derive(Default)]
pub struct SessionCounters {
    pub asr_chunks: AtomicU64,
    pub llm_tokens: AtomicU64,
    pub tts_frames: AtomicU64,
    pub barge_ins: AtomicU64,
    pub errors: AtomicU64,
}

/// All state owned by one participant's pipeline session.
pub struct SessionContext {
    pub session_id: String,
    pub created_at: Instant,
    pub room: Arc<dyn RoomHandle>,
    pub ring: Arc<RollingBuffer>,
    pub ingress_stats: Arc<IngressStats>,
    pub counters: SessionCounters,
    pub tts_queue: Arc<TtsQueue>,
    pub history: Mutex<ConversationHistory>,

    /// Set on each ASR final; start of the end-to-end latency clock.
    pub last_asr_final: Mutex<Option<Instant>>,
    /// Armed when a response is enqueued; the first emitted frame closes the
    /// end-to-end measurement.
    pub awaiting_first_frame: AtomicBool,
    /// Updated on every inbound frame; drives idle expiry.
    pub last_audio: Mutex<Instant>,

    pub is_agent_speaking: AtomicBool,
    pub is_active: AtomicBool,

    /// Parent token for everything the session spawns.
    pub shutdown: CancellationToken,
    /// Handle for the in-flight LLM exchange, replaced per request.
    pub llm_cancel: Mutex<CancellationToken>,
    /// Handle for the current TTS consumer, replaced on barge-in restart.
    pub tts_cancel: Mutex<CancellationToken>,

    frame_tx: mpsc::Sender<PcmFrame>,
    pub tasks: Mutex<Vec<JoinHandle<()>>>,
    pub tts_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Capacity of the finalized-response queue.
pub const TTS_QUEUE_CAPACITY: usize = 16;

/// Inbound PCM frames buffered between the transport and the ingress task.
const FRAME_CHANNEL_CAPACITY: usize = 100;

impl SessionContext {
    pub fn new(
        session_id: impl Into<String>,
        room: Arc<dyn RoomHandle>,
        settings: &Settings,
    ) -> (Arc<Self>, mpsc::Receiver<PcmFrame>) {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();
        let ctx = Arc::new(Self {
            session_id: session_id.into(),
            created_at: Instant::now(),
            room,
            ring: Arc::new(RollingBuffer::new(MAX_BUFFER_SAMPLES)),
            ingress_stats: Arc::new(IngressStats::default()),
            counters: SessionCounters::default(),
            tts_queue: Arc::new(TtsQueue::new(TTS_QUEUE_CAPACITY)),
            history: Mutex::new(ConversationHistory::new(settings.memory_context_tokens)),
            last_asr_final: Mutex::new(None),
            awaiting_first_frame: AtomicBool::new(false),
            last_audio: Mutex::new(Instant::now()),
            is_agent_speaking: AtomicBool::new(false),
            is_active: AtomicBool::new(true),
            llm_cancel: Mutex::new(shutdown.child_token()),
            tts_cancel: Mutex::new(shutdown.child_token()),
            shutdown,
            frame_tx,
            tasks: Mutex::new(Vec::new()),
            tts_task: Mutex::new(None),
        });
        (ctx, frame_rx)
    }

    /// Hand one decoded transport frame to the ingress task. Frames arriving
    /// after shutdown, or while ingress is saturated, are silently dropped.
    pub fn push_frame(&self, frame: PcmFrame) {
        if !self.is_active.load(Ordering::SeqCst) {
            return;
        }
        *self.last_audio.lock().unwrap() = Instant::now();
        let _ = self.frame_tx.try_send(frame);
    }

    /// Publish one datagram to the participant; failures are counted, never
    /// propagated.
    pub async fn publish(&self, datagram: &Datagram, reliable: bool) {
        if let Err(e) = self.room.publish_data(datagram.to_bytes(), reliable).await {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            log::warn!(
                "[PUBLISH-ERROR] session={} {}",
                self.session_id,
                e
            );
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_audio.lock().unwrap().elapsed()
    }

    /// Swap in a fresh cancellation handle for the next LLM exchange,
    /// cancelling any in-flight one.
    pub fn restart_llm_token(&self) -> CancellationToken {
        let fresh = self.shutdown.child_token();
        let old = {
            let mut guard = self.llm_cancel.lock().unwrap();
            std::mem::replace(&mut *guard, fresh.clone())
        };
        old.cancel();
        fresh
    }

    pub fn cancel_llm(&self) {
        self.llm_cancel.lock().unwrap().cancel();
    }

    /// Swap in a fresh cancellation handle for a new TTS consumer,
    /// cancelling the current one.
    pub fn restart_tts_token(&self) -> CancellationToken {
        let fresh = self.shutdown.child_token();
        let old = {
            let mut guard = self.tts_cancel.lock().unwrap();
            std::mem::replace(&mut *guard, fresh.clone())
        };
        old.cancel();
        fresh
    }
}
