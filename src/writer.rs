// Copyright 2022-2024 Google LLC
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

//! Bitstream assembly: blocks, frames and the stream configuration.

use super::bgmc;
use super::bitsink::BitSink;
use super::bitsink::ByteSink;
use super::block::Block;
use super::block::Lanes;
use super::config::RaFlag;
use super::config::SpecificConfig;
use super::constant::AOT_ALS;
use super::error::SinkFull;
use super::lpc;
use super::ltp;
use super::partition::Partitioner;
use super::rice;
use super::search::ra_progressive_params;

/// Writes one block. `res` is the block's slice of its current signal.
pub(crate) fn write_block<S: BitSink>(
    sconf: &SpecificConfig,
    block: &Block,
    res: &[i32],
    dest: &mut S,
) -> Result<(), SinkFull> {
    // block_type
    dest.write_lsbs(u32::from(!block.constant), 1)?;

    if block.constant {
        dest.write_lsbs(u32::from(block.constant_value != 0), 1)?;
        dest.write_lsbs(u32::from(block.js_block), 1)?;
        dest.write_lsbs(0u32, 5)?; // reserved
        if block.constant_value != 0 {
            let const_val_bits = if sconf.floating {
                24
            } else {
                sconf.bits_per_raw_sample
            };
            dest.write_twoc(block.constant_value, const_val_bits as usize)?;
        }
    } else {
        let ltp_info = block.ltp();
        let ent = block.ent();
        let sub_blocks = ent.sub_blocks;

        dest.write_lsbs(u32::from(block.js_block), 1)?;

        // ec_sub
        if sconf.sb_part && sconf.bgmc {
            dest.write_lsbs(bgmc::ceil_log2(sub_blocks), 2)?;
        } else if sconf.sb_part || sconf.bgmc {
            dest.write_lsbs(u32::from(sub_blocks > 1), 1)?;
        }

        // s[k], sx[k]
        let wide = u32::from(sconf.max_rice_param() > 15);
        if sconf.bgmc {
            let combined =
                |sb: usize| (ent.rice_param[sb] << 4 | ent.bgmc_param[sb]) as i32;
            dest.write_lsbs(combined(0) as u32, (8 + wide) as usize)?;
            for sb in 1..sub_blocks {
                rice::write_sr(dest, combined(sb) - combined(sb - 1), 2)?;
            }
        } else {
            dest.write_lsbs(ent.rice_param[0], (4 + wide) as usize)?;
            for sb in 1..sub_blocks {
                rice::write_sr(
                    dest,
                    ent.rice_param[sb] as i32 - ent.rice_param[sb - 1] as i32,
                    0,
                )?;
            }
        }

        // shift_lsbs and shift_pos
        dest.write_lsbs(u32::from(block.shift_lsbs > 0), 1)?;
        if block.shift_lsbs > 0 {
            dest.write_lsbs(block.shift_lsbs - 1, 4)?;
        }

        // opt_order and quantized coefficients
        if !sconf.rlslms {
            if sconf.adapt_order {
                dest.write_lsbs(block.opt_order as u32, block.bits_adapt_order as usize)?;
            }
            if sconf.coef_table == 3 {
                for i in 0..block.opt_order {
                    dest.write_lsbs((64 + block.q_parcor[i]) as u32, 7)?;
                }
            } else {
                for i in 0..block.opt_order {
                    let (offset, rice_param) = lpc::parcor_rice_spec(i, sconf.coef_table);
                    rice::write_sr(dest, block.q_parcor[i] - offset, rice_param)?;
                }
            }
        }

        // LTP flag, gains and lag
        if sconf.long_term_prediction {
            dest.write_lsbs(u32::from(ltp_info.use_ltp), 1)?;
            if ltp_info.use_ltp {
                rice::write_sr(dest, ltp_info.gain[0] >> 3, 1)?;
                rice::write_sr(dest, ltp_info.gain[1] >> 3, 2)?;
                rice::write_ur(dest, ltp::map_to_index(ltp_info.gain[2]), 2)?;
                rice::write_sr(dest, ltp_info.gain[3] >> 3, 2)?;
                rice::write_sr(dest, ltp_info.gain[4] >> 3, 1)?;

                let lag_bits = ltp::lag_bits(sconf.sample_rate);
                let lag_offset = 4.max(block.opt_order + 1);
                dest.write_lsbs((ltp_info.lag - lag_offset) as u32, lag_bits as usize)?;
            }
        }

        write_residuals(sconf, block, ent, res, dest)?;
    }

    dest.align_to_byte()?;
    Ok(())
}

/// Writes the residuals of a non-constant block, Rice or two-pass BGMC.
fn write_residuals<S: BitSink>(
    sconf: &SpecificConfig,
    block: &Block,
    ent: &super::block::EntropyInfo,
    res: &[i32],
    dest: &mut S,
) -> Result<(), SinkFull> {
    let sub_blocks = ent.sub_blocks;
    let sb_length = block.length / sub_blocks;
    let max_param = sconf.max_rice_param();

    // progressively predicted head of a random-access block
    let mut head = 0usize;
    if block.ra_block && block.opt_order > 0 {
        let params = ra_progressive_params(
            sconf.bits_per_raw_sample,
            ent.rice_param[0],
            max_param,
        );
        rice::write_sr(dest, res[0], params[0])?;
        head = 1;
        if block.opt_order > 1 {
            let v = if sb_length <= 1 { 0 } else { res[1] };
            rice::write_sr(dest, v, params[1])?;
            head = 2;
            if block.opt_order > 2 {
                let v = if sb_length <= 2 { 0 } else { res[2] };
                rice::write_sr(dest, v, params[2])?;
                head = 3;
            }
        }
        head = head.min(sb_length);
    }

    if sconf.bgmc {
        let mut params = [bgmc::CoarseParams::default(); 8];
        let mut enc = bgmc::MsbEncoder::new();
        for sb in 0..sub_blocks {
            params[sb] =
                bgmc::coarse_params(ent.rice_param[sb], ent.bgmc_param[sb], block.length);
            let start = sb * sb_length + if sb == 0 { head } else { 0 };
            enc.encode_msbs(
                dest,
                &res[start..(sb + 1) * sb_length],
                params[sb],
                ent.bgmc_param[sb],
            )?;
        }
        enc.finish(dest)?;
        for sb in 0..sub_blocks {
            let start = sb * sb_length + if sb == 0 { head } else { 0 };
            bgmc::write_lsbs(
                dest,
                &res[start..(sb + 1) * sb_length],
                params[sb],
                ent.rice_param[sb],
            )?;
        }
    } else {
        for sb in 0..sub_blocks {
            let start = sb * sb_length + if sb == 0 { head } else { 0 };
            for &v in &res[start..(sb + 1) * sb_length] {
                rice::write_sr(dest, v, ent.rice_param[sb])?;
            }
        }
    }
    Ok(())
}

/// Writes one frame into `dest` and returns its size in bytes.
///
/// When frame-level random-access unit sizes are enabled the leading
/// 32-bit slot is reserved first and back-patched with the frame size.
pub(crate) fn write_frame(
    sconf: &SpecificConfig,
    part: &Partitioner,
    lanes: &Lanes,
    dest: &mut ByteSink,
) -> Result<usize, SinkFull> {
    let ra_slot = sconf.ra_flag == RaFlag::Frames && sconf.ra_distance == 1;
    if ra_slot {
        dest.write_lsbs(0u32, 32)?;
    }

    let bs_info_len = 1usize << 3.max(sconf.block_switching);

    let mut c = 0;
    while c < sconf.channels {
        if sconf.block_switching > 0 {
            let mut bs_info = part.bs_info[c];
            if sconf.joint_stereo && part.independent_bs[c] {
                bs_info |= 1 << 31;
            }
            dest.write_msbs(bs_info, bs_info_len)?;
        }

        for b in 0..part.num_blocks[c] {
            if part.independent_bs[c] {
                write_channel_block(sconf, part, lanes, c, b, dest)?;
            } else {
                write_channel_block(sconf, part, lanes, c, b, dest)?;
                write_channel_block(sconf, part, lanes, c + 1, b, dest)?;
            }
        }

        if !part.independent_bs[c] {
            c += 1;
        }
        c += 1;
    }

    dest.align_to_byte()?;
    let bytes = dest.bit_length() / 8;
    if ra_slot {
        dest.patch_u32(0, bytes as u32);
    }
    Ok(bytes)
}

fn write_channel_block(
    sconf: &SpecificConfig,
    part: &Partitioner,
    lanes: &Lanes,
    c: usize,
    b: usize,
    dest: &mut ByteSink,
) -> Result<(), SinkFull> {
    let block = &part.blocks[c][b];
    let pos = lanes.pos(block.start);
    let cur = lanes.channel(block.cur_lane, c);
    write_block(sconf, block, &cur[pos..pos + block.length], dest)
}

/// Writes the `AudioSpecificConfig` preamble and returns its bit length.
fn write_audio_specific_config<S: BitSink>(
    sconf: &SpecificConfig,
    dest: &mut S,
) -> Result<usize, SinkFull> {
    // object type 36 escapes the 5-bit field
    dest.write_lsbs(31u32, 5)?;
    dest.write_lsbs(AOT_ALS - 32, 6)?;
    // explicit sampling frequency
    dest.write_lsbs(0x0Fu32, 4)?;
    dest.write_lsbs(sconf.sample_rate as u32, 24)?;
    // channel config: defined inside ALSSpecificConfig
    dest.write_lsbs(0u32, 4)?;
    Ok(5 + 6 + 4 + 24 + 4)
}

/// Byte offset of `ALSSpecificConfig` within the stream header.
pub fn config_offset(sconf: &SpecificConfig) -> usize {
    let mut counter = super::bitsink::BitCounter::new();
    let bits = write_audio_specific_config(sconf, &mut counter)
        .expect("counting cannot fail");
    (bits + 7) >> 3
}

/// Writes the full stream header: `AudioSpecificConfig` followed by the
/// byte-aligned `ALSSpecificConfig`.
pub(crate) fn write_specific_config(
    sconf: &SpecificConfig,
    crc: Option<u32>,
    dest: &mut ByteSink,
) -> Result<(), SinkFull> {
    write_audio_specific_config(sconf, dest)?;
    dest.align_to_byte()?;

    dest.write_lsbs(u32::from_be_bytes(*b"ALS\0"), 32)?;
    dest.write_lsbs(sconf.sample_rate as u32, 32)?;
    dest.write_lsbs(u32::try_from(sconf.samples).unwrap_or(u32::MAX), 32)?;
    dest.write_lsbs((sconf.channels - 1) as u32, 16)?;
    dest.write_lsbs(1u32, 3)?; // file_type: wav
    dest.write_lsbs(sconf.resolution, 3)?;
    dest.write_lsbs(u32::from(sconf.floating), 1)?;
    dest.write_lsbs(u32::from(sconf.msb_first), 1)?;
    dest.write_lsbs((sconf.frame_length - 1) as u32, 16)?;
    dest.write_lsbs(sconf.ra_distance as u32, 8)?;
    dest.write_lsbs(sconf.ra_flag as u32, 2)?;
    dest.write_lsbs(u32::from(sconf.adapt_order), 1)?;
    dest.write_lsbs(sconf.coef_table as u32, 2)?;
    dest.write_lsbs(u32::from(sconf.long_term_prediction), 1)?;
    dest.write_lsbs(sconf.max_order as u32, 10)?;
    let bs_code = if sconf.block_switching > 0 {
        1.max(sconf.block_switching as u32 - 2)
    } else {
        0
    };
    dest.write_lsbs(bs_code, 2)?;
    dest.write_lsbs(u32::from(sconf.bgmc), 1)?;
    dest.write_lsbs(u32::from(sconf.sb_part), 1)?;
    dest.write_lsbs(u32::from(sconf.joint_stereo), 1)?;
    dest.write_lsbs(u32::from(sconf.mc_coding), 1)?;
    dest.write_lsbs(u32::from(sconf.chan_config), 1)?;
    dest.write_lsbs(u32::from(sconf.chan_sort), 1)?;
    dest.write_lsbs(u32::from(sconf.crc_enabled), 1)?;
    dest.write_lsbs(u32::from(sconf.rlslms), 1)?;
    dest.write_lsbs(0u32, 5)?; // reserved
    dest.write_lsbs(0u32, 1)?; // aux_data_enabled
    dest.align_to_byte()?;
    dest.write_lsbs(0u32, 32)?; // original header size
    dest.write_lsbs(0u32, 32)?; // original trailer size
    if sconf.crc_enabled {
        dest.write_lsbs(crc.unwrap_or(0), 32)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Lane;
    use crate::config;
    use crate::config::Stage;
    use crate::search;
    use crate::search::SearchScratch;
    use crate::source::SampleFormat;

    fn sconf_16bit() -> SpecificConfig {
        SpecificConfig::from_options(
            &config::Encoder::default(),
            SampleFormat::S16,
            None,
            48_000,
            1,
        )
        .unwrap()
    }

    fn final_stage(sconf: &SpecificConfig, level: usize) -> Stage {
        config::build_stages(sconf, level)[config::STAGE_FINAL]
    }

    #[test]
    fn constant_block_layout() {
        let sconf = sconf_16bit();
        let mut block = Block::new(sconf.max_order);
        block.constant = true;
        block.constant_value = 0;
        block.length = 64;

        let mut sink = ByteSink::new();
        write_block(&sconf, &block, &[], &mut sink).unwrap();
        // type 0, nonzero 0, js 0, 5 reserved, padded to a byte
        assert_eq!(sink.as_byte_slice(), &[0u8]);

        block.constant_value = -3;
        let mut sink = ByteSink::new();
        write_block(&sconf, &block, &[], &mut sink).unwrap();
        assert_eq!(sink.bit_length(), 24);
        // 0 (type), 1 (nonzero), 0 (js), 00000, then -3 in 16 bits
        assert_eq!(sink.as_byte_slice(), &[0b0100_0000, 0xFF, 0xFD]);
    }

    #[test]
    fn zero_constant_block_is_one_byte() {
        let sconf = sconf_16bit();
        let mut block = Block::new(sconf.max_order);
        block.constant = true;
        block.constant_value = 0;
        block.length = 4096;
        let mut sink = ByteSink::new();
        write_block(&sconf, &block, &[], &mut sink).unwrap();
        assert_eq!(sink.bit_length(), 8);
    }

    #[test]
    fn written_bits_match_searched_count() {
        // the search reports byte-aligned block sizes; writing the block
        // must produce exactly that many bits on the exact-count paths
        let sconf = sconf_16bit();
        let stage = final_stage(&sconf, 1);
        let mut lanes = Lanes::new(1, sconf.frame_length, sconf.history_len(), false);
        let mut scratch = SearchScratch::new(&sconf, lanes.channel_size);

        let pos = lanes.pos(0);
        {
            let raw = lanes.channel_mut(Lane::Raw, 0);
            for t in 0..sconf.frame_length {
                let sine = 4000.0 * (2.0 * std::f64::consts::PI * t as f64 / 41.0).sin();
                raw[pos + t] = sine as i32 + ((t * 37) % 13) as i32;
            }
        }

        for ra_block in [false, true] {
            let mut block = Block::new(sconf.max_order);
            block.length = sconf.frame_length;
            block.ra_block = ra_block;
            let predicted =
                search::find_block_params(&sconf, &stage, &mut lanes, &mut scratch, &mut block, 0);

            let cur = lanes.channel(block.cur_lane, 0);
            let mut sink = ByteSink::new();
            write_block(&sconf, &block, &cur[pos..pos + block.length], &mut sink).unwrap();
            assert_eq!(
                sink.bit_length() as u32,
                predicted,
                "ra_block={ra_block}"
            );
        }
    }

    #[test]
    fn written_bits_match_searched_count_bgmc() {
        let mut sconf = sconf_16bit();
        sconf.bgmc = true;
        let mut stage = final_stage(&sconf, 2);
        stage.param_algorithm = config::ParamSearch::BgmcExact;
        stage.ecsub_algorithm = config::SubdivisionSearch::BgmcExact;
        stage.adapt_order = false;
        // a single sub-block keeps the counted and streamed coder states
        // identical; multi-sub-block counts flush per sub-block
        stage.sb_part = false;

        let mut lanes = Lanes::new(1, sconf.frame_length, sconf.history_len(), false);
        let mut scratch = SearchScratch::new(&sconf, lanes.channel_size);
        let pos = lanes.pos(0);
        {
            let raw = lanes.channel_mut(Lane::Raw, 0);
            for t in 0..sconf.frame_length {
                raw[pos + t] = (3000.0
                    * (2.0 * std::f64::consts::PI * t as f64 / 100.0).sin())
                    as i32
                    + ((t * 97) % 29) as i32;
            }
        }

        let mut block = Block::new(sconf.max_order);
        block.length = sconf.frame_length;
        let predicted =
            search::find_block_params(&sconf, &stage, &mut lanes, &mut scratch, &mut block, 0);

        let cur = lanes.channel(block.cur_lane, 0);
        let mut sink = ByteSink::new();
        write_block(&sconf, &block, &cur[pos..pos + block.length], &mut sink).unwrap();
        assert_eq!(sink.bit_length() as u32, predicted);
    }

    #[test]
    fn specific_config_magic_and_fields() {
        let mut sconf = sconf_16bit();
        sconf.samples = 48_000;
        let mut sink = ByteSink::new();
        write_specific_config(&sconf, Some(0xDEAD_BEEF), &mut sink).unwrap();
        let bytes = sink.as_byte_slice();

        let offset = config_offset(&sconf);
        assert_eq!(offset, 6);
        assert_eq!(&bytes[offset..offset + 4], b"ALS\0");
        // sample rate follows the magic
        assert_eq!(
            &bytes[offset + 4..offset + 8],
            &48_000u32.to_be_bytes()
        );
        // total samples next
        assert_eq!(
            &bytes[offset + 8..offset + 12],
            &48_000u32.to_be_bytes()
        );
        // channels - 1 in 16 bits
        assert_eq!(&bytes[offset + 12..offset + 14], &[0, 0]);
        // crc is the trailing word
        assert_eq!(&bytes[bytes.len() - 4..], &0xDEAD_BEEFu32.to_be_bytes());
    }

    #[test]
    fn config_sizes() {
        // fixed part is SPECIFIC_CONFIG_SIZE bytes plus the preamble
        let sconf = sconf_16bit();
        let mut sink = ByteSink::new();
        write_specific_config(&sconf, None, &mut sink).unwrap();
        let expected = config_offset(&sconf)
            + crate::constant::SPECIFIC_CONFIG_SIZE
            + if sconf.crc_enabled { 4 } else { 0 };
        assert_eq!(sink.as_byte_slice().len(), expected);
    }

    #[test]
    fn overflow_discards_frame_cleanly() {
        let sconf = sconf_16bit();
        let mut block = Block::new(sconf.max_order);
        block.constant = true;
        block.constant_value = 1234;
        block.length = 64;

        let mut sink = ByteSink::with_limit(8);
        assert!(write_block(&sconf, &block, &[], &mut sink).is_err());
    }
}
