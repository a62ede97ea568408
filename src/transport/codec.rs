//! Opus Codec
//!
//! Mono, 48 kHz, 20ms Frames. Ein Encoder pro lokalem Mikrofon, ein
//! Decoder pro eingehendem Track.

use super::audio::{FRAME_SIZE, SAMPLE_RATE};
use opus::{Application, Bitrate, Channels, Decoder, Encoder};
use thiserror::Error;

/// Sprach-Bitrate
const BITRATE: i32 = 32_000;

const MAX_PACKET_SIZE: usize = 512;

/// Längster Opus-Frame (120ms)
const MAX_DECODED_SAMPLES: usize = FRAME_SIZE * 6;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Failed to create Opus codec: {0}")]
    Init(String),

    #[error("Expected {expected} samples, got {got}")]
    FrameSize { expected: usize, got: usize },

    #[error("Opus encode error: {0}")]
    Encode(String),

    #[error("Opus decode error: {0}")]
    Decode(String),
}

pub struct VoiceEncoder {
    encoder: Encoder,
}

impl VoiceEncoder {
    pub fn new() -> Result<Self, CodecError> {
        let mut encoder = Encoder::new(SAMPLE_RATE, Channels::Mono, Application::Voip)
            .map_err(|e| CodecError::Init(e.to_string()))?;
        encoder
            .set_bitrate(Bitrate::Bits(BITRATE))
            .map_err(|e| CodecError::Init(e.to_string()))?;
        Ok(Self { encoder })
    }

    /// Kodiert genau einen Frame (`FRAME_SIZE` Samples)
    pub fn encode(&mut self, frame: &[f32]) -> Result<Vec<u8>, CodecError> {
        if frame.len() != FRAME_SIZE {
            return Err(CodecError::FrameSize {
                expected: FRAME_SIZE,
                got: frame.len(),
            });
        }

        let mut packet = vec![0u8; MAX_PACKET_SIZE];
        let len = self
            .encoder
            .encode_float(frame, &mut packet)
            .map_err(|e| CodecError::Encode(e.to_string()))?;
        packet.truncate(len);
        Ok(packet)
    }
}

pub struct VoiceDecoder {
    decoder: Decoder,
}

impl VoiceDecoder {
    pub fn new() -> Result<Self, CodecError> {
        let decoder = Decoder::new(SAMPLE_RATE, Channels::Mono)
            .map_err(|e| CodecError::Init(e.to_string()))?;
        Ok(Self { decoder })
    }

    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<f32>, CodecError> {
        let mut samples = vec![0f32; MAX_DECODED_SAMPLES];
        let len = self
            .decoder
            .decode_float(packet, &mut samples, false)
            .map_err(|e| CodecError::Decode(e.to_string()))?;
        samples.truncate(len);
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_frame() {
        let mut encoder = VoiceEncoder::new().unwrap();
        let mut decoder = VoiceDecoder::new().unwrap();

        let frame: Vec<f32> = (0..FRAME_SIZE)
            .map(|i| (i as f32 * 440.0 * 2.0 * std::f32::consts::PI / SAMPLE_RATE as f32).sin() * 0.3)
            .collect();

        let packet = encoder.encode(&frame).unwrap();
        assert!(!packet.is_empty());
        assert!(packet.len() < MAX_PACKET_SIZE);

        let decoded = decoder.decode(&packet).unwrap();
        assert_eq!(decoded.len(), FRAME_SIZE);
    }

    #[test]
    fn test_partial_frame_rejected() {
        let mut encoder = VoiceEncoder::new().unwrap();
        assert!(matches!(
            encoder.encode(&[0.0; 100]),
            Err(CodecError::FrameSize { got: 100, .. })
        ));
    }
}
