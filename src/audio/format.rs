//! # Audio Format
//!
//! Describes the raw PCM stream clients send (16 kHz, 16-bit, mono by default) and
//! derives the sizes the rest of the engine needs from it: bytes per second, the
//! chunk size for a given duration, and the 44-byte RIFF header used whenever audio
//! leaves the process as a file.
//!
//! ## Chunk size
//! `sample_rate * bytes_per_sample * channels * duration`, so 100 ms of the default
//! format is `16000 * 2 * 1 * 0.1 = 3200` bytes.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Length of the canonical PCM WAV header.
pub const WAV_HEADER_LEN: usize = 44;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Samples per second per channel
    pub sample_rate: u32,

    /// Bits per sample (16 for the PCM the clients stream)
    pub bits_per_sample: u16,

    /// Number of interleaved channels
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            bits_per_sample: 16,
            channels: 1,
        }
    }
}

impl AudioFormat {
    /// Bytes occupied by one sample across all channels (WAV "block align").
    pub fn frame_size(&self) -> usize {
        (self.bits_per_sample as usize / 8) * self.channels as usize
    }

    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.frame_size()
    }

    /// Number of bytes covering `duration` of audio, rounded down to whole frames.
    pub fn chunk_size(&self, duration: Duration) -> usize {
        let frame = self.frame_size().max(1);
        let bytes = (self.bytes_per_second() as u128 * duration.as_millis()) / 1000;
        (bytes as usize / frame) * frame
    }

    /// Playback duration of `len` bytes in this format.
    pub fn duration_of(&self, len: usize) -> Duration {
        let bps = self.bytes_per_second();
        if bps == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros((len as u64 * 1_000_000) / bps as u64)
    }

    /// Prefix raw PCM with a RIFF/WAVE header describing this format.
    ///
    /// Input that already starts with a RIFF header is returned unchanged.
    pub fn wrap_wav(&self, pcm: &[u8]) -> Vec<u8> {
        if is_wav(pcm) {
            return pcm.to_vec();
        }

        let data_len = pcm.len().min(u32::MAX as usize - 36) as u32;
        let mut header = [0u8; WAV_HEADER_LEN];

        header[0..4].copy_from_slice(b"RIFF");
        LittleEndian::write_u32(&mut header[4..8], 36 + data_len);
        header[8..12].copy_from_slice(b"WAVE");

        header[12..16].copy_from_slice(b"fmt ");
        LittleEndian::write_u32(&mut header[16..20], 16);
        LittleEndian::write_u16(&mut header[20..22], 1); // PCM
        LittleEndian::write_u16(&mut header[22..24], self.channels);
        LittleEndian::write_u32(&mut header[24..28], self.sample_rate);
        LittleEndian::write_u32(&mut header[28..32], self.bytes_per_second() as u32);
        LittleEndian::write_u16(&mut header[32..34], self.frame_size() as u16);
        LittleEndian::write_u16(&mut header[34..36], self.bits_per_sample);

        header[36..40].copy_from_slice(b"data");
        LittleEndian::write_u32(&mut header[40..44], data_len);

        let mut wav = Vec::with_capacity(WAV_HEADER_LEN + pcm.len());
        wav.extend_from_slice(&header);
        wav.extend_from_slice(pcm);
        wav
    }
}

pub fn is_wav(data: &[u8]) -> bool {
    data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WAVE"
}
