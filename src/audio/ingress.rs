//! Ingress task: transport PCM frames → 16 kHz mono rolling buffer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::resample::{downmix_to_mono, resample};
use super::ring::RollingBuffer;
use super::PIPELINE_SAMPLE_RATE;
use crate::transport::PcmFrame;

/// Shared ingress counters, readable while the task runs.
#[derive(Default)]
pub struct IngressStats {
    pub frames: AtomicU64,
    pub malformed: AtomicU64,
}

/// Consumes decoded PCM frames for one session, normalizes them to the
/// pipeline rate, and appends to the session's rolling buffer.
///
/// Ingress never fails the session: malformed frames are counted and
/// dropped, and frames arriving after shutdown are discarded with the
/// channel.
pub struct AudioIngress {
    session_id: String,
    ring: Arc<RollingBuffer>,
    stats: Arc<IngressStats>,
    log_every: u64,
}

impl AudioIngress {
    pub fn new(
        session_id: impl Into<String>,
        ring: Arc<RollingBuffer>,
        stats: Arc<IngressStats>,
        log_every: u64,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            ring,
            stats,
            log_every: log_every.max(1),
        }
    }

    /// Normalize one frame and append it. Returns the number of pipeline-rate
    /// samples appended (0 for malformed frames).
    pub fn process_frame(&self, frame: &PcmFrame) -> usize {
        if !frame.is_well_formed() {
            let dropped = self.stats.malformed.fetch_add(1, Ordering::Relaxed) + 1;
            log::warn!(
                "[INGRESS] session={} dropped malformed frame ({} total): {} samples, {}ch @ {}Hz",
                self.session_id,
                dropped,
                frame.samples.len(),
                frame.channels,
                frame.sample_rate
            );
            return 0;
        }

        let mono = downmix_to_mono(&frame.samples, frame.channels);
        let resampled = resample(&mono, frame.sample_rate, PIPELINE_SAMPLE_RATE);
        let appended = resampled.len();
        self.ring.append(&resampled);

        let count = self.stats.frames.fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.log_every == 0 {
            log::info!(
                "[INGRESS] session={} frame={} rate={}Hz ch={} buffer={} samples",
                self.session_id,
                count,
                frame.sample_rate,
                frame.channels,
                self.ring.len()
            );
        }
        appended
    }

    /// Drive the ingress loop until the channel closes or the session is
    /// cancelled.
    pub async fn run(self, mut rx: mpsc::Receiver<PcmFrame>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        self.process_frame(&frame);
                    }
                    None => break,
                },
            }
        }
        log::info!(
            "[INGRESS-STOP] session={} frames={} malformed={}",
            self.session_id,
            self.stats.frames.load(Ordering::Relaxed),
            self.stats.malformed.load(Ordering::Relaxed)
        );
    }
}
