//! Audio frame types
//!
//! The capture collaborator pushes fixed-size PCM16 mono frames into the
//! recognizer session. Frames are passed by value and never stored beyond
//! the session's transmit buffer.

use std::time::Instant;

/// Default capture sample rate in Hz
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

/// Default frame duration in milliseconds
pub const DEFAULT_FRAME_MS: u32 = 20;

/// Bytes per PCM16 mono sample
pub const BYTES_PER_SAMPLE: u32 = 2;

/// Expected byte length of one frame at the given rate and duration.
/// 20 ms at 16 kHz mono 16-bit = 640 bytes.
pub fn frame_bytes(sample_rate: u32, frame_ms: u32) -> usize {
    (sample_rate * frame_ms / 1000 * BYTES_PER_SAMPLE) as usize
}

/// One PCM16 little-endian mono audio frame
#[derive(Clone)]
pub struct AudioFrame {
    /// Raw PCM16 bytes, little-endian
    pub data: Vec<u8>,
    /// Capture sequence number for ordering
    pub sequence: u64,
    /// Monotonic capture timestamp
    pub captured_at: Instant,
}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("bytes", &self.data.len())
            .field("sequence", &self.sequence)
            .finish()
    }
}

impl AudioFrame {
    pub fn new(data: Vec<u8>, sequence: u64) -> Self {
        Self {
            data,
            sequence,
            captured_at: Instant::now(),
        }
    }

    /// A zero-PCM frame of the given duration, used for keep-alive
    pub fn silence(duration_ms: u32, sample_rate: u32) -> Self {
        Self::new(vec![0u8; frame_bytes(sample_rate, duration_ms)], 0)
    }

    /// Frame duration in milliseconds at the given sample rate
    pub fn duration_ms(&self, sample_rate: u32) -> u64 {
        (self.data.len() as u64 * 1000) / (sample_rate as u64 * BYTES_PER_SAMPLE as u64)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
