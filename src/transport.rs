//! Contracts between the pipeline core and the real-time media transport.
//!
//! The transport (SFU, WebRTC room, token plumbing) lives outside this crate.
//! The core consumes decoded PCM through [`PcmFrame`] and talks back through
//! a [`RoomHandle`]: reliable/unreliable datagrams plus an outbound mono
//! audio track.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("publish failed: {0}")]
    Publish(String),

    #[error("audio track write failed: {0}")]
    Track(String),

    #[error("room closed")]
    Closed,
}

/// One decoded audio frame as delivered by the transport. Arbitrary source
/// rate and channel count; interleaved signed 16-bit samples.
#[derive(Debug, Clone)]
pub struct PcmFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
    pub samples_per_channel: usize,
}

impl PcmFrame {
    /// A frame is malformed when its sample count does not match the declared
    /// channel layout. Such frames are counted and dropped by ingress.
    pub fn is_well_formed(&self) -> bool {
        self.channels >= 1
            && self.sample_rate > 0
            && self.samples.len() == self.samples_per_channel * self.channels as usize
    }
}

/// Handle to the room the agent participates in. Implemented by the
/// surrounding transport layer; the pipeline only ever sees this trait.
#[async_trait]
pub trait RoomHandle: Send + Sync {
    /// Publish a datagram to the participant. `reliable` selects the ordered
    /// channel; unreliable is used for bulk audio fan-out.
    async fn publish_data(&self, data: Vec<u8>, reliable: bool) -> Result<(), TransportError>;

    /// Write one 20 ms PCM16 mono frame (16 kHz, 640 bytes) to the outbound
    /// audio track. The transport may upsample.
    async fn write_audio_frame(&self, pcm: Vec<u8>) -> Result<(), TransportError>;
}

/// Wire schema for the session↔client datagram channel. UTF-8 JSON, tagged
/// by `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Datagram {
    AsrPartial {
        text: String,
    },
    AsrFinal {
        text: String,
    },
    LlmPartial {
        text: String,
    },
    LlmFinal {
        text: String,
    },
    TtsChunk {
        /// base64 PCM16 mono 16 kHz, one 20 ms frame
        audio: String,
        segment: u32,
        frame: u32,
    },
    AgentInterrupted,
    /// Client → server: user started speaking over the agent.
    BargeIn,
}

impl Datagram {
    pub fn to_bytes(&self) -> Vec<u8> {
        // The schema is all owned strings and integers; serialization cannot
        // fail for any constructible value.
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_wire_names() {
        let partial = Datagram::AsrPartial {
            text: "hello".to_string(),
        };
        let json = String::from_utf8(partial.to_bytes()).unwrap();
        assert!(json.contains("\"type\":\"asr_partial\""));
        assert!(json.contains("\"text\":\"hello\""));

        let chunk = Datagram::TtsChunk {
            audio: "AAAA".to_string(),
            segment: 1,
            frame: 3,
        };
        let json = String::from_utf8(chunk.to_bytes()).unwrap();
        assert!(json.contains("\"type\":\"tts_chunk\""));
        assert!(json.contains("\"segment\":1"));
        assert!(json.contains("\"frame\":3"));
    }

    #[test]
    fn test_barge_in_round_trip() {
        let parsed = Datagram::from_bytes(br#"{"type":"barge_in"}"#).unwrap();
        assert_eq!(parsed, Datagram::BargeIn);

        let parsed = Datagram::from_bytes(br#"{"type":"agent_interrupted"}"#).unwrap();
        assert_eq!(parsed, Datagram::AgentInterrupted);
    }

    #[test]
    fn test_malformed_datagram_is_error() {
        assert!(Datagram::from_bytes(b"not json").is_err());
        assert!(Datagram::from_bytes(br#"{"type":"unknown_kind"}"#).is_err());
    }

    #[test]
    fn test_frame_well_formed() {
        let good = PcmFrame {
            samples: vec![0; 960],
            sample_rate: 48000,
            channels: 2,
            samples_per_channel: 480,
        };
        assert!(good.is_well_formed());

        let bad = PcmFrame {
            samples: vec![0; 100],
            sample_rate: 48000,
            channels: 2,
            samples_per_channel: 480,
        };
        assert!(!bad.is_well_formed());
    }
}
