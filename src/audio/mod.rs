//! Audio plumbing at the pipeline boundaries: rolling capture buffer,
//! rate/channel normalization, WAV container codec, and the ingress task
//! feeding the buffer from transport frames.

pub mod ingress;
pub mod resample;
pub mod ring;
pub mod wav;

use thiserror::Error;

pub use ingress::AudioIngress;
pub use ring::RollingBuffer;

/// Everything downstream of ingress runs at 16 kHz mono PCM16.
pub const PIPELINE_SAMPLE_RATE: u32 = 16_000;

/// Outbound frame duration on the audio track.
pub const FRAME_DURATION_MS: u64 = 20;

/// Samples per outbound frame (320 at 16 kHz / 20 ms).
pub const SAMPLES_PER_FRAME: usize =
    (PIPELINE_SAMPLE_RATE as usize * FRAME_DURATION_MS as usize) / 1000;

/// Bytes per outbound frame (640, 16-bit samples).
pub const BYTES_PER_FRAME: usize = SAMPLES_PER_FRAME * 2;

/// Rolling buffer capacity: one second of pipeline-rate audio.
pub const MAX_BUFFER_SAMPLES: usize = PIPELINE_SAMPLE_RATE as usize;

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("WAV encode error: {0}")]
    WavEncode(String),

    #[error("WAV decode error: {0}")]
    WavDecode(String),

    #[error("unsupported audio format: {0}")]
    Unsupported(String),
}
