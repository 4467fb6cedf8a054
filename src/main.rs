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

// Note that clippy attributes should be in sync with those declared in "lib.rs"
#![warn(clippy::all, clippy::nursery, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::use_self,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::multiple_crate_versions,
    clippy::must_use_candidate
)]

use std::fs::File;
use std::io::BufWriter;

use clap::Parser;
use nom::bytes::complete::tag;
use nom::bytes::complete::take;
use nom::number::complete::le_u16;
use nom::number::complete::le_u32;
use nom::IResult;

use alsenc::config;
use alsenc::constant::ExitCode;
use alsenc::error::Verify;
use alsenc::muxer::AlsWriter;
use alsenc::source::MemSource;
use alsenc::source::SampleFormat;
use alsenc::source::Source;
use alsenc::Encoder;

/// MPEG-4 ALS encoder.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path for the output ALS file.
    #[clap(short, long)]
    output: String,
    /// Path for the input WAV file.
    source: String,
    /// If set, load config from the specified file.
    #[clap(short, long)]
    config: Option<String>,
    /// Compression level (0..=2), overriding the config file.
    #[clap(short, long)]
    level: Option<usize>,
    /// If set, dump the config used to the specified path.
    #[clap(long)]
    dump_config: Option<String>,
}

struct WavContents {
    sample_format: SampleFormat,
    bits_per_raw_sample: u32,
    channels: usize,
    sample_rate: usize,
    data: Vec<u8>,
}

fn wav_chunk_header(input: &[u8]) -> IResult<&[u8], ([u8; 4], u32)> {
    let (input, id) = take(4usize)(input)?;
    let (input, size) = le_u32(input)?;
    Ok((input, ([id[0], id[1], id[2], id[3]], size)))
}

fn wav_fmt_chunk(input: &[u8]) -> IResult<&[u8], (u16, u16, u32, u16)> {
    let (input, format) = le_u16(input)?;
    let (input, channels) = le_u16(input)?;
    let (input, sample_rate) = le_u32(input)?;
    let (input, _byte_rate) = le_u32(input)?;
    let (input, _block_align) = le_u16(input)?;
    let (input, bits_per_sample) = le_u16(input)?;
    Ok((input, (format, channels, sample_rate, bits_per_sample)))
}

fn parse_wav(bytes: &[u8]) -> IResult<&[u8], WavContents> {
    let (input, _) = tag(b"RIFF")(bytes)?;
    let (input, _file_size) = le_u32(input)?;
    let (mut input, _) = tag(b"WAVE")(input)?;

    let mut fmt: Option<(u16, u16, u32, u16)> = None;
    loop {
        let (rest, (id, size)) = wav_chunk_header(input)?;
        let padded = size as usize + (size as usize & 1);
        let (rest, chunk) = take(padded)(rest)?;
        match &id {
            b"fmt " => {
                let (_, parsed) = wav_fmt_chunk(chunk)?;
                fmt = Some(parsed);
            }
            b"data" => {
                let (format, channels, sample_rate, bits) = fmt.ok_or_else(|| {
                    nom::Err::Failure(nom::error::Error::new(
                        bytes,
                        nom::error::ErrorKind::Verify,
                    ))
                })?;
                let fail = || {
                    nom::Err::Failure(nom::error::Error::new(
                        bytes,
                        nom::error::ErrorKind::Verify,
                    ))
                };
                if format != 1 || channels == 0 {
                    return Err(fail());
                }
                let data = &chunk[..size as usize];
                let (sample_format, data) = match bits {
                    8 => (SampleFormat::U8, data.to_vec()),
                    16 => (SampleFormat::S16, data.to_vec()),
                    24 => {
                        // repack 3-byte samples into left-justified 32-bit
                        // containers
                        let mut packed = Vec::with_capacity(data.len() / 3 * 4);
                        for s in data.chunks_exact(3) {
                            packed.extend_from_slice(&[0, s[0], s[1], s[2]]);
                        }
                        (SampleFormat::S32, packed)
                    }
                    32 => (SampleFormat::S32, data.to_vec()),
                    _ => return Err(fail()),
                };
                return Ok((
                    rest,
                    WavContents {
                        sample_format,
                        bits_per_raw_sample: u32::from(bits),
                        channels: usize::from(channels),
                        sample_rate: sample_rate as usize,
                        data,
                    },
                ));
            }
            _ => {}
        }
        input = rest;
    }
}

#[allow(clippy::expect_used)]
#[allow(clippy::exit)]
fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut encoder_config = args.config.map_or_else(config::Encoder::default, |path| {
        let conf_str = std::fs::read_to_string(path).expect("Config file read error.");
        toml::from_str(&conf_str).expect("Config file syntax error.")
    });
    if let Some(level) = args.level {
        encoder_config.compression_level = level;
    }

    if let Err(e) = encoder_config.verify() {
        eprintln!("Error: {}", e.within("encoder_config"));
        std::process::exit(ExitCode::InvalidConfig as i32);
    }

    let wav_bytes = std::fs::read(&args.source).expect("Failed to read input file.");
    let (_, wav) = parse_wav(&wav_bytes).expect("Failed to parse WAV input.");
    let raw_size = wav.data.len();

    let mut source =
        MemSource::from_bytes(wav.data, wav.sample_format, wav.channels, wav.sample_rate)
            .with_bits_per_raw_sample(wav.bits_per_raw_sample);

    let mut encoder = Encoder::for_source(&encoder_config, &source).expect("Encoder init failed.");

    if let Some(path) = args.dump_config {
        std::fs::write(path, toml::to_string(&encoder_config).unwrap())
            .expect("File write failed.");
    }

    let file = File::create(args.output).expect("Failed to create a file.");
    let mut writer = BufWriter::new(file);
    let mut mux = AlsWriter::new(&mut writer, &encoder.extradata(), encoder.config_offset())
        .expect("Header write failed.");

    loop {
        let frame = source.read_frame(encoder.frame_length()).to_owned();
        if frame.is_empty() {
            break;
        }
        let packet = encoder.encode_frame(&frame).expect("Encoding failed.");
        mux.write_packet(&packet).expect("Packet write failed.");
    }

    let extradata = encoder.finish();
    let encoded_size = mux
        .finalize(&extradata, encoder.config_offset())
        .expect("Header rewrite failed.");

    eprintln!(
        "{} samples, {} -> {} bytes ({:.1}%)",
        encoder.sconf().samples,
        raw_size,
        encoded_size,
        encoded_size as f64 * 100.0 / raw_size as f64,
    );
}
