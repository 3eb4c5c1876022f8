//! voxbridge: streaming voice-agent pipeline server.
//!
//! For each participant joining a room, the coordinator runs three
//! overlapping streams: sliding-window ASR over the participant's audio,
//! token-streaming LLM responses, and sentence-chunked TTS synthesis fanned
//! out to an audio track and a datagram channel, with bounded-latency
//! barge-in cancellation throughout.

pub mod asr;
pub mod audio;
pub mod backoff;
pub mod config;
pub mod context;
pub mod error;
pub mod health;
pub mod http;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod transport;
pub mod tts;
mod util;

pub use config::Settings;
pub use context::ServerContext;
pub use error::{PipelineError, Result};
pub use pipeline::PipelineCoordinator;
