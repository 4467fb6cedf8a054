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

#![doc = include_str!("../README.md")]
// Note that clippy attributes should be in sync with those declared in "main.rs"
#![warn(clippy::all, clippy::nursery, clippy::pedantic, clippy::cargo)]
// Some of clippy::pedantic rules are actually useful, so use it with a lot of
// ad-hoc exceptions.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::missing_const_for_fn,
    clippy::multiple_crate_versions,
    clippy::must_use_candidate,
    clippy::wildcard_dependencies
)]
// Some from restriction lint-group
#![warn(
    clippy::clone_on_ref_ptr,
    clippy::create_dir,
    clippy::dbg_macro,
    clippy::empty_structs_with_brackets,
    clippy::exit,
    clippy::if_then_some_else_none,
    clippy::let_underscore_must_use,
    clippy::lossy_float_literal,
    clippy::print_stdout,
    clippy::rc_buffer,
    clippy::rc_mutex,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::separated_literal_suffix,
    clippy::str_to_string,
    clippy::string_add,
    clippy::string_to_string,
    clippy::try_err,
    clippy::unnecessary_self_imports
)]

pub(crate) mod bgmc;
pub mod bitsink;
pub(crate) mod block;
pub(crate) mod coding;
pub mod config;
pub mod constant;
pub mod error;
pub(crate) mod lpc;
pub(crate) mod ltp;
pub mod muxer;
pub(crate) mod partition;
pub(crate) mod rice;
pub(crate) mod search;
pub mod sigen;
pub mod source;
pub(crate) mod tables;
pub(crate) mod writer;

// import global entry points
pub use coding::encode_to_vec;
pub use coding::Encoder;

#[cfg(test)]
mod test {
    // end-to-end, but structure-transparent tests.
    use super::*;
    use rstest::rstest;

    use crate::sigen::Signal;
    use crate::source::MemSource;
    use crate::source::SampleFormat;

    const CONFIGS: [&str; 4] = [
        "",
        r"
compression_level = 0
        ",
        r"
compression_level = 2
        ",
        r"
ra_distance = 1
ra_flag = 'frames'
        ",
    ];

    #[rstest]
    fn e2e_with_generated_sinusoids(
        #[values(1, 2, 3)] channels: usize,
        #[values(CONFIGS[0], CONFIGS[1], CONFIGS[2], CONFIGS[3])] config_src: &str,
    ) {
        let signal_len = 16123;
        let bits_per_sample = 16;
        let sample_rate = 16000;

        let config: config::Encoder = toml::from_str(config_src).expect("config parsing error");

        let mut channel_signals = vec![];
        for ch in 0..channels {
            channel_signals.push(
                sigen::Sine::new(36 + ch, 0.3)
                    .noise(0.02)
                    .to_vec_quantized(bits_per_sample, signal_len),
            );
        }
        let mut interleaved: Vec<i16> = Vec::with_capacity(signal_len * channels);
        for t in 0..signal_len {
            for s in &channel_signals {
                interleaved.push(s[t] as i16);
            }
        }

        let source = MemSource::from_i16_samples(&interleaved, channels, sample_rate);
        let file = encode_to_vec(&config, source).expect("encoder error");

        // well-formed header, rewritten with the true sample count
        assert_eq!(&file[0..4], b"ALS\0");
        let rate = u32::from_be_bytes([file[4], file[5], file[6], file[7]]);
        assert_eq!(rate as usize, sample_rate);
        let total = u32::from_be_bytes([file[8], file[9], file[10], file[11]]);
        assert_eq!(total as usize, signal_len);
        let wire_channels = u16::from_be_bytes([file[12], file[13]]);
        assert_eq!(wire_channels as usize + 1, channels);

        // sinusoids compress well below raw PCM
        assert!(file.len() < signal_len * channels * 2);
    }

    #[rstest]
    fn e2e_sample_formats(#[values(SampleFormat::U8, SampleFormat::S32)] format: SampleFormat) {
        let signal_len = 5000;
        let signal = sigen::Sine::new(50, 0.4).to_vec_quantized(8, signal_len);

        let mut bytes = Vec::new();
        match format {
            SampleFormat::U8 => {
                for &v in &signal {
                    bytes.push((v + 128) as u8);
                }
            }
            SampleFormat::S32 => {
                for &v in &signal {
                    bytes.extend_from_slice(&(v << 24).to_le_bytes());
                }
            }
            SampleFormat::S16 => unreachable!(),
        }

        let source = MemSource::from_bytes(bytes, format, 1, 8000);
        let file =
            encode_to_vec(&config::Encoder::default(), source).expect("encoder error");
        assert_eq!(&file[0..4], b"ALS\0");
        let total = u32::from_be_bytes([file[8], file[9], file[10], file[11]]);
        assert_eq!(total as usize, signal_len);
    }
}
