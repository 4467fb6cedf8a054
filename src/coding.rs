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

//! Controller connecting coding algorithms: the per-stream encoder context
//! and the per-frame pipeline.

use log::debug;

use super::block::Lanes;
use super::config;
use super::config::SpecificConfig;
use super::config::Stage;
use super::constant::NUM_STAGES;
use super::error::EncodeError;
use super::error::FormatError;
use super::error::FormatErrorReason;
use super::error::VerifyError;
use super::partition::Partitioner;
use super::search;
use super::search::SearchScratch;
use super::source;
use super::source::SampleFormat;
use super::source::Source;
use super::writer;

static CRC_32: crc::Crc<u32, crc::Table<16>> =
    crc::Crc::<u32, crc::Table<16>>::new(&crc::CRC_32_ISO_HDLC);

/// Encoder context for one ALS stream.
///
/// All working buffers are allocated at construction, sized by
/// `channels * (frame_length + channel_offset)`, and reused per frame. The
/// context is single-threaded; independent streams use disjoint contexts.
pub struct Encoder {
    sconf: SpecificConfig,
    stages: [Stage; NUM_STAGES],
    sample_format: SampleFormat,
    lanes: Lanes,
    scratch: SearchScratch,
    part: Partitioner,
    /// Interleaved sign-normalized samples of the current frame.
    sample_buf: Vec<i32>,
    crc: crc::Digest<'static, u32, crc::Table<16>>,
    ra_counter: usize,
    flushed: bool,
}

impl Encoder {
    /// Creates an encoder for a stream of the given format.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::Config`] when the options are inconsistent.
    pub fn new(
        options: &config::Encoder,
        sample_format: SampleFormat,
        bits_per_raw_sample: Option<u32>,
        sample_rate: usize,
        channels: usize,
    ) -> Result<Self, EncodeError> {
        let sconf = SpecificConfig::from_options(
            options,
            sample_format,
            bits_per_raw_sample,
            sample_rate,
            channels,
        )?;
        let stages = config::build_stages(&sconf, options.compression_level);
        debug!("derived stream configuration: {sconf:?}");

        let lanes = Lanes::new(
            channels,
            sconf.frame_length,
            sconf.history_len(),
            sconf.long_term_prediction,
        );
        let scratch = SearchScratch::new(&sconf, lanes.channel_size);
        let part = Partitioner::new(&sconf);
        let sample_buf = Vec::with_capacity(sconf.frame_length * channels);

        Ok(Self {
            sconf,
            stages,
            sample_format,
            lanes,
            scratch,
            part,
            sample_buf,
            crc: CRC_32.digest(),
            ra_counter: 0,
            flushed: false,
        })
    }

    /// Creates an encoder matching a [`Source`]'s stream parameters.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::Config`] when the options are inconsistent.
    pub fn for_source<T: Source>(
        options: &config::Encoder,
        src: &T,
    ) -> Result<Self, EncodeError> {
        Self::new(
            options,
            src.sample_format(),
            src.bits_per_raw_sample(),
            src.sample_rate(),
            src.channels(),
        )
    }

    /// The derived stream configuration.
    pub fn sconf(&self) -> &SpecificConfig {
        &self.sconf
    }

    /// Number of interleaved samples the encoder consumes per frame.
    pub fn frame_length(&self) -> usize {
        self.sconf.frame_length
    }

    /// Current stream header (`AudioSpecificConfig` + `ALSSpecificConfig`).
    ///
    /// Until [`finish`] runs, the total sample count is written as the
    /// "unknown" marker and the CRC field as its running value; the muxer
    /// rewrites the header from the flush packet.
    ///
    /// [`finish`]: Encoder::finish
    pub fn extradata(&self) -> Vec<u8> {
        let mut sconf = self.sconf.clone();
        if !self.flushed {
            sconf.samples = u64::from(u32::MAX);
        }
        let crc = self
            .sconf
            .crc_enabled
            .then(|| self.crc.clone().finalize());
        let mut sink = super::bitsink::ByteSink::new();
        writer::write_specific_config(&sconf, crc, &mut sink)
            .expect("unbounded sink cannot overflow");
        sink.into_bytes()
    }

    /// Byte offset of `ALSSpecificConfig` inside [`extradata`].
    ///
    /// [`extradata`]: Encoder::extradata
    pub fn config_offset(&self) -> usize {
        writer::config_offset(&self.sconf)
    }

    /// Encodes one frame of interleaved little-endian PCM bytes into one
    /// packet. Every frame must be `frame_length` samples long except the
    /// last, which may be shorter.
    ///
    /// # Errors
    ///
    /// Returns [`EncodeError::Format`] when the byte count does not form a
    /// whole number of inter-channel samples, and [`EncodeError::Overflow`]
    /// when the frame exceeds its packet budget; the frame is discarded and
    /// the context stays usable.
    pub fn encode_frame(&mut self, bytes: &[u8]) -> Result<Vec<u8>, EncodeError> {
        let sample_stride = self.sconf.channels * self.sample_format.bytes_per_sample();
        if bytes.is_empty() || bytes.len() % sample_stride != 0 {
            return Err(FormatError::by_reason(FormatErrorReason::InvalidFile(
                "frame bytes do not form whole inter-channel samples".to_owned(),
            ))
            .into());
        }
        let frame_size = bytes.len() / sample_stride;
        if frame_size > self.sconf.frame_length {
            return Err(VerifyError::new("frame", "longer than the configured frame length").into());
        }

        // random-access bookkeeping: the first block of an RA frame is the
        // stream's re-entry point
        let ra_frame = self.sconf.ra_distance > 0 && self.ra_counter == 0;
        for c in 0..self.sconf.channels {
            self.part.blocks[c][0].ra_block = ra_frame;
        }
        if self.sconf.ra_distance > 0 {
            self.ra_counter += 1;
            if self.ra_counter == self.sconf.ra_distance {
                self.ra_counter = 0;
            }
        }

        if self.sconf.crc_enabled {
            self.update_crc(bytes);
        }

        self.stage_samples(bytes, frame_size);

        self.part.select_difference_coding_mode(
            &self.sconf,
            &self.stages[config::STAGE_JOINT_STEREO],
            &mut self.lanes,
            &mut self.scratch,
            frame_size,
            ra_frame,
        );
        self.part.block_partitioning(
            &self.sconf,
            &self.stages[config::STAGE_BLOCK_SWITCHING],
            frame_size,
        );
        self.final_refinement(frame_size);

        // a packet budget of 32 bits per sample and channel always fits
        // except on pathological input
        let mut sink = super::bitsink::ByteSink::with_limit(
            self.sconf.frame_length * self.sconf.channels * 32,
        );
        writer::write_frame(&self.sconf, &self.part, &self.lanes, &mut sink)?;

        self.sconf.samples += frame_size as u64;
        self.lanes.carry_history(frame_size);
        Ok(sink.into_bytes())
    }

    /// Flushes the stream and returns the finalized header, meant to be
    /// attached as side data so the muxer can rewrite the file header.
    pub fn finish(&mut self) -> Vec<u8> {
        self.flushed = true;
        self.extradata()
    }

    fn update_crc(&mut self, bytes: &[u8]) {
        if self.sconf.resolution == 2 {
            // 24-bit samples ride in 32-bit containers; the checksum covers
            // the three meaningful bytes of each sample
            for chunk in bytes.chunks_exact(4) {
                let v = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) >> 8;
                self.crc.update(&v.to_le_bytes()[0..3]);
            }
        } else {
            self.crc.update(bytes);
        }
    }

    /// Deinterleaves and sign-normalizes the frame into the raw lanes.
    fn stage_samples(&mut self, bytes: &[u8], frame_size: usize) {
        source::normalize_samples(
            bytes,
            self.sample_format,
            self.sconf.bits_per_raw_sample,
            &mut self.sample_buf,
        );
        let stride = self.lanes.channel_size;
        let offset = self.lanes.channel_offset;
        source::deinterleave(
            &self.sample_buf,
            self.sconf.channels,
            stride,
            frame_size,
            &mut self.lanes.raw[offset..],
        );
    }

    /// Final stage: re-runs the parameter search on the blocks the chosen
    /// partitioning actually produced.
    fn final_refinement(&mut self, _frame_size: usize) {
        let stage = &self.stages[config::STAGE_FINAL];
        for b in 0..(1usize << self.sconf.block_switching) {
            let mut c = 0;
            while c < self.sconf.channels {
                let independent = self.part.independent_bs[c];
                if b < self.part.num_blocks[c] {
                    let block = &mut self.part.blocks[c][b];
                    search::find_block_params(
                        &self.sconf,
                        stage,
                        &mut self.lanes,
                        &mut self.scratch,
                        block,
                        c,
                    );
                    if !independent {
                        let block = &mut self.part.blocks[c + 1][b];
                        search::find_block_params(
                            &self.sconf,
                            stage,
                            &mut self.lanes,
                            &mut self.scratch,
                            block,
                            c + 1,
                        );
                    }
                }
                c += if independent { 1 } else { 2 };
            }
        }
    }
}

/// Encodes a whole [`Source`] into a raw ALS file held in memory.
///
/// This is the main one-shot entry point of the library; streaming callers
/// drive [`Encoder`] and a [`muxer::AlsWriter`] themselves.
///
/// [`muxer::AlsWriter`]: crate::muxer::AlsWriter
///
/// # Errors
///
/// Propagates configuration and encoding errors; I/O into the in-memory
/// file cannot fail.
///
/// # Examples
///
/// ```
/// use alsenc::config;
/// use alsenc::source::MemSource;
///
/// let samples: Vec<i16> = vec![0; 4096];
/// let source = MemSource::from_i16_samples(&samples, 2, 44100);
/// let file = alsenc::encode_to_vec(&config::Encoder::default(), source).unwrap();
/// // the muxer strips the AudioSpecificConfig preamble from the header
/// assert_eq!(&file[0..4], b"ALS\0");
/// ```
pub fn encode_to_vec<T: Source>(
    options: &config::Encoder,
    mut src: T,
) -> Result<Vec<u8>, EncodeError> {
    let mut encoder = Encoder::for_source(options, &src)?;
    let mut file = std::io::Cursor::new(Vec::new());
    let mut mux = super::muxer::AlsWriter::new(&mut file, &encoder.extradata(), encoder.config_offset())
        .expect("in-memory write cannot fail");

    loop {
        let frame = src.read_frame(encoder.frame_length()).to_owned();
        if frame.is_empty() {
            break;
        }
        let packet = encoder.encode_frame(&frame)?;
        mux.write_packet(&packet).expect("in-memory write cannot fail");
    }

    let extradata = encoder.finish();
    mux.finalize(&extradata, encoder.config_offset())
        .expect("in-memory write cannot fail");
    Ok(file.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sigen;
    use crate::sigen::Signal;

    fn encoder_with(level: usize, channels: usize, rate: usize) -> Encoder {
        let options = config::Encoder {
            compression_level: level,
            ..config::Encoder::default()
        };
        Encoder::new(&options, SampleFormat::S16, None, rate, channels).unwrap()
    }

    fn frame_bytes(samples: &[i32]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(samples.len() * 2);
        for &s in samples {
            bytes.extend_from_slice(&(s as i16).to_le_bytes());
        }
        bytes
    }

    #[test]
    fn silent_frame_is_constant_blocks() {
        let mut enc = encoder_with(1, 1, 48_000);
        let n = enc.frame_length();
        let packet = enc.encode_frame(&frame_bytes(&vec![0i32; n])).unwrap();
        assert!(!packet.is_empty());
        assert!(enc.part.blocks[0][0].constant);
        assert_eq!(enc.part.blocks[0][0].constant_value, 0);
        assert_eq!(enc.part.num_blocks[0], 1);
        // a zero constant block is a single byte
        assert_eq!(packet.len(), 1);
    }

    #[test]
    fn partition_lengths_cover_every_frame() {
        let mut enc = encoder_with(2, 2, 48_000);
        let n = enc.frame_length();
        let signal = sigen::Sine::new(80, 0.4)
            .noise(0.05)
            .to_vec_quantized(16, n * 2 * 3);

        for frame in signal.chunks(n * 2) {
            enc.encode_frame(&frame_bytes(frame)).unwrap();
            for c in 0..2 {
                let total: usize = enc.part.blocks[c]
                    .iter()
                    .take(enc.part.num_blocks[c])
                    .map(|b| b.length)
                    .sum();
                assert_eq!(total, frame.len() / 2);
            }
        }
    }

    #[test]
    fn short_last_frame() {
        let mut enc = encoder_with(1, 1, 48_000);
        let n = enc.frame_length();
        let signal = sigen::Sine::new(100, 0.8).to_vec_quantized(16, n - 1);
        let packet = enc.encode_frame(&frame_bytes(&signal)).unwrap();
        assert!(!packet.is_empty());
        assert_eq!(enc.sconf.samples, (n - 1) as u64);
        let total: usize = enc.part.blocks[0]
            .iter()
            .take(enc.part.num_blocks[0])
            .map(|b| b.length)
            .sum();
        assert_eq!(total, n - 1);
    }

    #[test]
    fn ra_frames_follow_the_distance() {
        let options = config::Encoder {
            ra_distance: 3,
            ..config::Encoder::default()
        };
        let mut enc = Encoder::new(&options, SampleFormat::S16, None, 48_000, 1).unwrap();
        let n = enc.frame_length();
        let signal = sigen::Noise::with_seed(7, 0.3).to_vec_quantized(16, n);

        let mut ra_flags = Vec::new();
        for _frame in 0..10 {
            enc.encode_frame(&frame_bytes(&signal)).unwrap();
            ra_flags.push(enc.part.blocks[0][0].ra_block);
        }
        let expected: Vec<bool> = (0..10).map(|i| i % 3 == 0).collect();
        assert_eq!(ra_flags, expected);
    }

    #[test]
    fn levels_trade_speed_for_size() {
        let n = 4096;
        let signal = sigen::Sine::new(60, 0.5)
            .noise(0.02)
            .to_vec_quantized(16, n * 4);

        let mut sizes = Vec::new();
        for level in 0..3 {
            let mut enc = encoder_with(level, 1, 48_000);
            let mut total = 0usize;
            for frame in signal.chunks(enc.frame_length()) {
                total += enc.encode_frame(&frame_bytes(frame)).unwrap().len();
            }
            sizes.push(total);
        }
        // higher levels may only pay off within a small tolerance (denser
        // tools carry more side information on short streams)
        assert!(sizes[1] <= sizes[0] + 64, "sizes={sizes:?}");
        assert!(sizes[2] <= sizes[1] + sizes[1] / 10 + 64, "sizes={sizes:?}");
        // and all of them beat raw PCM
        assert!(sizes.iter().all(|&s| s < n * 4 * 2));
    }

    #[test]
    fn crc_is_folded_over_input_bytes() {
        let mut enc = encoder_with(1, 1, 48_000);
        let n = enc.frame_length();
        let signal = sigen::Noise::with_seed(3, 0.2).to_vec_quantized(16, n * 2);
        let bytes = frame_bytes(&signal);

        enc.encode_frame(&bytes[..n * 2]).unwrap();
        enc.encode_frame(&bytes[n * 2..]).unwrap();
        let extradata = enc.finish();

        let expected = CRC_32.checksum(&bytes);
        let tail = &extradata[extradata.len() - 4..];
        assert_eq!(tail, expected.to_be_bytes());
    }

    #[test]
    fn lsb_shifted_input_is_detected() {
        let mut enc = encoder_with(1, 1, 48_000);
        let n = enc.frame_length();
        let signal: Vec<i32> = sigen::Noise::with_seed(11, 0.1)
            .to_vec_quantized(12, n)
            .iter()
            .map(|v| v << 4)
            .collect();
        enc.encode_frame(&frame_bytes(&signal)).unwrap();
        for b in 0..enc.part.num_blocks[0] {
            assert_eq!(enc.part.blocks[0][b].shift_lsbs, 4);
        }
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut enc = encoder_with(0, 1, 48_000);
        let n = enc.frame_length();
        let err = enc.encode_frame(&frame_bytes(&vec![0i32; n + 1]));
        assert!(matches!(err, Err(EncodeError::Config(_))));

        // ragged byte counts are rejected before staging
        let err = enc.encode_frame(&[0u8; 3]);
        assert!(matches!(err, Err(EncodeError::Format(_))));
    }

    #[test]
    fn high_rate_sine_uses_predictor() {
        // mono 24-bit at 96 kHz: second coefficient table, real prediction
        let options = config::Encoder::default();
        let mut enc =
            Encoder::new(&options, SampleFormat::S32, Some(24), 96_000, 1).unwrap();
        assert_eq!(enc.sconf().coef_table, 1);

        let n = enc.frame_length();
        let signal = sigen::Sine::new(96, 0.5).to_vec_quantized(24, n);
        let mut bytes = Vec::with_capacity(n * 4);
        for &v in &signal {
            bytes.extend_from_slice(&(v << 8).to_le_bytes());
        }
        let packet = enc.encode_frame(&bytes).unwrap();

        let block = &enc.part.blocks[0][0];
        assert!(!block.constant);
        assert!(block.opt_order > 0);
        assert!(block.ent().rice_param[0] > 0);
        assert!(packet.len() < n * 3);
    }

    #[test]
    fn block_switching_splits_busy_frames() {
        let options = config::Encoder {
            compression_level: 2,
            ..config::Encoder::default()
        };
        let mut enc = Encoder::new(&options, SampleFormat::S16, None, 48_000, 2).unwrap();
        assert!(enc.sconf().block_switching > 0);

        // music-like PRBS: quiet opening, loud close, per channel
        let n = enc.frame_length();
        let quiet = sigen::Noise::with_seed(21, 0.01);
        let loud = sigen::Sine::new(70, 0.6).noise(0.3);
        let signal = quiet.concat(n / 2, loud).to_vec_quantized(16, n);

        let mut interleaved = Vec::with_capacity(n * 2);
        for &v in &signal {
            interleaved.push(v);
            interleaved.push(v / 2);
        }
        enc.encode_frame(&frame_bytes(&interleaved)).unwrap();

        assert!(
            (0..2).any(|c| enc.part.num_blocks[c] > 1),
            "a split-statistics frame should subdivide"
        );
        for c in 0..2 {
            let total: usize = enc.part.blocks[c]
                .iter()
                .take(enc.part.num_blocks[c])
                .map(|b| b.length)
                .sum();
            assert_eq!(total, n);
        }
    }

    #[test]
    fn whole_stream_roundtrip_layout() {
        let options = config::Encoder::default();
        let signal = sigen::Sine::new(50, 0.3).to_vec_quantized(16, 8192);
        let samples_i16: Vec<i16> = signal.iter().map(|&v| v as i16).collect();
        let src = crate::source::MemSource::from_i16_samples(&samples_i16, 1, 44_100);
        let file = encode_to_vec(&options, src).unwrap();

        // header present and rewritten with the true sample count
        assert_eq!(&file[0..4], b"ALS\0");
        let total = u32::from_be_bytes([file[8], file[9], file[10], file[11]]);
        assert_eq!(total, 8192);
    }
}
