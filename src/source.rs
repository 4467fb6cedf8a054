// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Module for input sample staging.

use seq_macro::seq;

/// Interleaved PCM container formats accepted by the encoder.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SampleFormat {
    /// Unsigned 8-bit; re-centered by subtracting 128.
    U8,
    /// Signed 16-bit little-endian.
    S16,
    /// Signed 32-bit little-endian (holds 17..=32 raw bits).
    S32,
}

impl SampleFormat {
    /// Width of the storage container in bits.
    pub const fn container_bits(self) -> u32 {
        match self {
            Self::U8 => 8,
            Self::S16 => 16,
            Self::S32 => 32,
        }
    }

    /// Width of the storage container in bytes.
    pub const fn bytes_per_sample(self) -> usize {
        (self.container_bits() / 8) as usize
    }
}

/// Converts interleaved container bytes into sign-normalized samples.
///
/// The right shift of `container_bits - bits_per_raw_sample` brings every
/// format into the signed raw-sample range.
pub fn normalize_samples(
    bytes: &[u8],
    format: SampleFormat,
    bits_per_raw_sample: u32,
    dest: &mut Vec<i32>,
) {
    let shift = format.container_bits() - bits_per_raw_sample;
    dest.clear();
    match format {
        SampleFormat::U8 => {
            dest.extend(bytes.iter().map(|&b| (i32::from(b) - 128) >> shift));
        }
        SampleFormat::S16 => {
            dest.extend(
                bytes
                    .chunks_exact(2)
                    .map(|c| i32::from(i16::from_le_bytes([c[0], c[1]])) >> shift),
            );
        }
        SampleFormat::S32 => {
            dest.extend(
                bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]) >> shift),
            );
        }
    }
}

// The deinterleaver runs once per frame over every input sample, so
// channel-specific unrolled implementations are generated with `seq_macro`
// in the hope that LLVM auto-vectorizes them.

#[inline]
#[allow(dead_code)]
fn deinterleave_gen(
    interleaved: &[i32],
    channels: usize,
    channel_stride: usize,
    samples: usize,
    dest: &mut [i32],
) {
    for t in 0..samples {
        for ch in 0..channels {
            dest[channel_stride * ch + t] = interleaved[channels * t + ch];
        }
    }
}

seq!(N in 2..=8 {
    #[inline]
    #[allow(dead_code)]
    #[allow(clippy::identity_op)]
    #[allow(clippy::erasing_op)]
    fn deinterleave_ch~N(
        interleaved: &[i32],
        channel_stride: usize,
        samples: usize,
        dest: &mut [i32],
    ) {
        for t in 0..samples {
            seq!(CH in 0..N {
                dest[channel_stride * CH + t] = interleaved[N * t + CH];
            });
        }
    }
});

/// Deinterleaves samples into channel rows `channel_stride` apart.
pub fn deinterleave(
    interleaved: &[i32],
    channels: usize,
    channel_stride: usize,
    samples: usize,
    dest: &mut [i32],
) {
    debug_assert!(interleaved.len() >= channels * samples);
    seq!(CH in 2..=8 {
        if channels == CH {
            return deinterleave_ch~CH(interleaved, channel_stride, samples, dest);
        }
    });
    if channels == 1 {
        dest[..samples].copy_from_slice(&interleaved[..samples]);
        return;
    }
    deinterleave_gen(interleaved, channels, channel_stride, samples, dest);
}

/// Source of interleaved PCM bytes.
pub trait Source {
    /// Returns the container format of the samples.
    fn sample_format(&self) -> SampleFormat;
    /// Returns the number of valid bits per sample, when narrower than the
    /// container.
    fn bits_per_raw_sample(&self) -> Option<u32> {
        None
    }
    /// Returns the number of channels.
    fn channels(&self) -> usize;
    /// Returns sampling rate in Hz.
    fn sample_rate(&self) -> usize;
    /// Reads up to `samples` interleaved samples; empty at end of stream.
    fn read_frame(&mut self, samples: usize) -> &[u8];
}

/// Source with preloaded sample bytes.
#[derive(Clone, Debug)]
pub struct MemSource {
    bytes: Vec<u8>,
    sample_format: SampleFormat,
    bits_per_raw_sample: Option<u32>,
    channels: usize,
    sample_rate: usize,
    read_head: usize,
}

impl MemSource {
    pub fn from_bytes(
        bytes: Vec<u8>,
        sample_format: SampleFormat,
        channels: usize,
        sample_rate: usize,
    ) -> Self {
        Self {
            bytes,
            sample_format,
            bits_per_raw_sample: None,
            channels,
            sample_rate,
            read_head: 0,
        }
    }

    /// Builds a 16-bit source from already-decoded samples (used by tests).
    pub fn from_i16_samples(samples: &[i16], channels: usize, sample_rate: usize) -> Self {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        Self::from_bytes(bytes, SampleFormat::S16, channels, sample_rate)
    }

    #[must_use]
    pub fn with_bits_per_raw_sample(mut self, bits: u32) -> Self {
        self.bits_per_raw_sample = Some(bits);
        self
    }
}

impl Source for MemSource {
    fn sample_format(&self) -> SampleFormat {
        self.sample_format
    }

    fn bits_per_raw_sample(&self) -> Option<u32> {
        self.bits_per_raw_sample
    }

    fn channels(&self) -> usize {
        self.channels
    }

    fn sample_rate(&self) -> usize {
        self.sample_rate
    }

    fn read_frame(&mut self, samples: usize) -> &[u8] {
        let frame_bytes = samples * self.channels * self.sample_format.bytes_per_sample();
        let begin = self.read_head.min(self.bytes.len());
        let end = (begin + frame_bytes).min(self.bytes.len());
        self.read_head = end;
        &self.bytes[begin..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u8_recentering() {
        let bytes = [0u8, 128, 255];
        let mut dest = Vec::new();
        normalize_samples(&bytes, SampleFormat::U8, 8, &mut dest);
        assert_eq!(dest, vec![-128, 0, 127]);
    }

    #[test]
    fn s16_narrow_raw_width() {
        // 12 valid bits in a 16-bit container
        let samples: [i16; 3] = [0x7FF0, -0x10, 0x0010];
        let mut bytes = Vec::new();
        for s in samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        let mut dest = Vec::new();
        normalize_samples(&bytes, SampleFormat::S16, 12, &mut dest);
        assert_eq!(dest, vec![0x7FF, -1, 1]);
    }

    #[test]
    fn s32_full_width() {
        let mut bytes = Vec::new();
        for s in [i32::MAX, i32::MIN, -5] {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        let mut dest = Vec::new();
        normalize_samples(&bytes, SampleFormat::S32, 32, &mut dest);
        assert_eq!(dest, vec![i32::MAX, i32::MIN, -5]);
    }

    #[test]
    fn deinterleaving_to_strided_rows() {
        let channels = 3;
        let samples = 50;
        let stride = 64;
        let mut interleaved = Vec::new();
        for t in 0..samples {
            for ch in 0..channels {
                interleaved.push((ch * 1000 + t) as i32);
            }
        }
        let mut dest = vec![0i32; channels * stride];
        deinterleave(&interleaved, channels, stride, samples, &mut dest);
        for ch in 0..channels {
            for t in 0..samples {
                assert_eq!(dest[ch * stride + t], (ch * 1000 + t) as i32);
            }
        }
    }

    #[test]
    fn mem_source_chunking() {
        let samples: Vec<i16> = (0..100).collect();
        let mut src = MemSource::from_i16_samples(&samples, 2, 8000);
        assert_eq!(src.read_frame(30).len(), 30 * 2 * 2);
        assert_eq!(src.read_frame(30).len(), 20 * 2 * 2);
        assert!(src.read_frame(30).is_empty());
    }
}
