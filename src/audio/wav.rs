//! WAV container codec for the service boundaries: ASR windows go out as
//! WAV uploads, TTS synthesis comes back as WAV payloads.

use std::io::Cursor;

use super::AudioError;

/// Encode mono PCM16 samples into a WAV container.
pub fn encode(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, AudioError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| AudioError::WavEncode(e.to_string()))?;
        for &s in samples {
            writer
                .write_sample(s)
                .map_err(|e| AudioError::WavEncode(e.to_string()))?;
        }
        writer
            .finalize()
            .map_err(|e| AudioError::WavEncode(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

/// Decoded WAV payload: interleaved samples plus the declared format.
pub struct DecodedWav {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

/// Decode a WAV payload to PCM16. Float and 24/32-bit sources are narrowed
/// to 16-bit; compressed formats are rejected.
pub fn decode(bytes: &[u8]) -> Result<DecodedWav, AudioError> {
    let mut reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| AudioError::WavDecode(e.to_string()))?;
    let spec = reader.spec();

    let samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .collect::<Result<_, _>>()
            .map_err(|e| AudioError::WavDecode(e.to_string()))?,
        (hound::SampleFormat::Int, bits) if bits <= 32 => {
            let shift = bits.saturating_sub(16);
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| (v >> shift) as i16))
                .collect::<Result<_, _>>()
                .map_err(|e| AudioError::WavDecode(e.to_string()))?
        }
        (hound::SampleFormat::Float, _) => reader
            .samples::<f32>()
            .map(|s| s.map(|v| (v.clamp(-1.0, 1.0) * i16::MAX as f32) as i16))
            .collect::<Result<_, _>>()
            .map_err(|e| AudioError::WavDecode(e.to_string()))?,
        (fmt, bits) => {
            return Err(AudioError::Unsupported(format!(
                "{fmt:?} at {bits} bits"
            )))
        }
    };

    Ok(DecodedWav {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let samples: Vec<i16> = (0..800).map(|i| ((i % 100) * 300 - 15000) as i16).collect();
        let wav = encode(&samples, 16000).unwrap();

        let decoded = decode(&wav).unwrap();
        assert_eq!(decoded.sample_rate, 16000);
        assert_eq!(decoded.channels, 1);
        assert_eq!(decoded.samples, samples);
    }

    #[test]
    fn test_encode_produces_riff_header() {
        let wav = encode(&[0i16; 160], 16000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode(b"definitely not a wav file").is_err());
    }

    #[test]
    fn test_decode_float_narrows() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 22050,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            writer.write_sample(0.5f32).unwrap();
            writer.write_sample(-0.5f32).unwrap();
            writer.finalize().unwrap();
        }

        let decoded = decode(&cursor.into_inner()).unwrap();
        assert_eq!(decoded.sample_rate, 22050);
        assert_eq!(decoded.samples.len(), 2);
        assert!(decoded.samples[0] > 16000 && decoded.samples[0] < 16500);
        assert!(decoded.samples[1] < -16000 && decoded.samples[1] > -16500);
    }
}
