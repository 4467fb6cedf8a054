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

//! Per-block parameter search: constant and LSB-shift tests, PARCOR order
//! selection, residual generation, entropy parameter search, and the LTP
//! pay-off check.

use log::warn;

use super::bgmc;
use super::bitsink::BitCounter;
use super::bitsink::BitSink;
use super::block::Block;
use super::block::Lane;
use super::block::Lanes;
use super::config::BitCount;
use super::config::OrderSearch;
use super::config::ParamSearch;
use super::config::SpecificConfig;
use super::config::Stage;
use super::config::SubdivisionSearch;
use super::lpc;
use super::ltp;
use super::rice;

/// Reusable scratch buffers of the per-block search, sized at init.
#[derive(Clone, Debug)]
pub(crate) struct SearchScratch {
    /// Autocorrelation coefficients, `max_order + 1`.
    pub acf: Vec<f64>,
    /// Double-precision PARCOR coefficients.
    pub parcor: Vec<f64>,
    /// Prediction error after each order.
    pub parcor_error: Vec<f64>,
    /// Reconstructed 21-bit PARCOR coefficients.
    pub r_parcor: Vec<i32>,
    /// Direct-form LPC coefficients (conversion scratch).
    pub lpc: Vec<i32>,
    /// Windowed signal for autocorrelation.
    pub windowed: Vec<f64>,
    /// Weighted signal for the LTP lag search, lane-sized.
    pub corr: Vec<f64>,
    /// Analysis window per block-switching level.
    pub windows: Vec<Vec<f64>>,
}

impl SearchScratch {
    pub fn new(sconf: &SpecificConfig, lane_size: usize) -> Self {
        let max_order = sconf.max_order;
        let window = if sconf.sample_rate <= 48_000 {
            lpc::Window::SineRect { param: 4.0 }
        } else {
            lpc::Window::HannRect { param: 4.0 }
        };
        let mut windows = Vec::new();
        for level in 0..=sconf.block_switching {
            // window lengths are rounded up to even
            let block_length = (sconf.frame_length >> level) + (sconf.frame_length >> level & 1);
            windows.push(window.weights(block_length));
        }
        Self {
            acf: vec![0.0; max_order + 1],
            parcor: vec![0.0; max_order.max(1)],
            parcor_error: vec![0.0; max_order.max(1)],
            r_parcor: vec![0; max_order.max(1)],
            lpc: vec![0; max_order.max(1)],
            windowed: vec![0.0; sconf.frame_length],
            corr: vec![0.0; lane_size],
            windows,
        }
    }
}

/// Rice parameters of the progressively predicted head of a random-access
/// sub-block; shared by the bit counter and the block writer.
#[inline]
pub(crate) fn ra_progressive_params(bits_per_raw_sample: u32, s: u32, max_param: u32) -> [u32; 3] {
    [
        bits_per_raw_sample - 4,
        (s + 3).min(max_param),
        (s + 1).min(max_param),
    ]
}

/// Counts the bits of one sub-block's residuals with given parameters.
#[allow(clippy::too_many_arguments)]
pub(crate) fn subblock_count_exact(
    res: &[i32],
    block_length: usize,
    s: u32,
    sx: u32,
    sconf: &SpecificConfig,
    ra_subblock: bool,
    order: usize,
    use_bgmc: bool,
) -> u32 {
    let mut count = 0u32;
    let mut len = 0usize;
    let sb_length = res.len();

    if ra_subblock && order > 0 {
        let params = ra_progressive_params(sconf.bits_per_raw_sample, s, sconf.max_rice_param());
        count += rice::rice_count(res[0], params[0]);
        len += 1;
        if order > 1 {
            let v = if sb_length <= 1 { 0 } else { res[1] };
            count += rice::rice_count(v, params[1]);
            len += 1;
            if order > 2 {
                let v = if sb_length <= 2 { 0 } else { res[2] };
                count += rice::rice_count(v, params[2]);
                len += 1;
            }
        }
    }
    let len = len.min(sb_length);
    let tail = &res[len..];

    if use_bgmc {
        let params = bgmc::coarse_params(s, sx, block_length);
        let mut counter = BitCounter::new();
        let mut enc = bgmc::MsbEncoder::new();
        enc.encode_msbs(&mut counter, tail, params, sx)
            .expect("counting cannot fail");
        enc.finish(&mut counter).expect("counting cannot fail");
        bgmc::write_lsbs(&mut counter, tail, params, s).expect("counting cannot fail");
        count += counter.bit_length() as u32;
    } else {
        for &v in tail {
            count += rice::rice_count(v, s);
        }
    }

    count
}

/// Counts the bits of the entropy parameters of a block: the sub-block
/// selector, the first parameter field, and the parameter deltas.
pub(crate) fn param_count(
    sub_blocks: usize,
    s: &[u32],
    sx: &[u32],
    sconf: &SpecificConfig,
    use_bgmc: bool,
) -> u32 {
    let mut count = if use_bgmc { 8 } else { 4 } + u32::from(sconf.max_rice_param() > 15);
    let delta_k = if use_bgmc { 2 } else { 0 };
    for sb in 1..sub_blocks {
        let diff = if use_bgmc {
            ((s[sb] << 4 | sx[sb]) as i32) - ((s[sb - 1] << 4 | sx[sb - 1]) as i32)
        } else {
            s[sb] as i32 - s[sb - 1] as i32
        };
        count += rice::rice_count(diff, delta_k);
    }

    count
        + if sconf.sb_part && sconf.bgmc {
            2
        } else {
            u32::from(sconf.sb_part || sconf.bgmc)
        }
}

/// Counts residual plus entropy-parameter bits of a whole block.
#[allow(clippy::too_many_arguments)]
pub(crate) fn block_count_exact(
    res: &[i32],
    sub_blocks: usize,
    s: &[u32],
    sx: &[u32],
    sconf: &SpecificConfig,
    ra_block: bool,
    order: usize,
    use_bgmc: bool,
) -> u32 {
    let sb_length = res.len() / sub_blocks;
    let mut count = 0;
    for sb in 0..sub_blocks {
        count += subblock_count_exact(
            &res[sb * sb_length..(sb + 1) * sb_length],
            res.len(),
            s[sb],
            sx.get(sb).copied().unwrap_or(0),
            sconf,
            sb == 0 && ra_block,
            order,
            use_bgmc,
        );
    }
    count + param_count(sub_blocks, s, sx, sconf, use_bgmc)
}

/// Splits an estimated combined BGMC parameter into `(s, sx)`.
fn estimate_bgmc_params(sum: u64, n: usize, max_param: u32) -> (u32, u32) {
    // 0.5 + log2(1.386)
    const OFFSET: f64 = 0.970_927_257_475_126_6;
    if sum == 0 {
        return (0, 0);
    }
    let tmp = (16.0 * ((sum as f64).log2() - (n as f64).log2() + OFFSET)) as i64;
    let tmp = tmp.clamp(0, i64::from(max_param << 4 | 0xF)) as u32;
    (tmp >> 4, tmp & 0xF)
}

fn max_sub_blocks(stage: &Stage, length: usize) -> usize {
    if !stage.sb_part || length & 0x3 != 0 || length < 16 {
        1
    } else {
        4
    }
}

/// Deepest BGMC partition level; every sub-block must divide the block
/// evenly or trailing residuals would fall off the sub-block grid.
fn max_bgmc_partition(stage: &Stage, length: usize) -> usize {
    if max_sub_blocks(stage, length) == 1 {
        0
    } else if length & 0x7 == 0 {
        3
    } else {
        2
    }
}

fn find_rice_params_est(
    stage: &Stage,
    sconf: &SpecificConfig,
    res: &[i32],
    ra_block: bool,
    order: usize,
    ent: &mut super::block::EntropyInfo,
) {
    let sb_max = max_sub_blocks(stage, res.len());
    let sb_length = res.len() / sb_max;
    let max_param = sconf.max_rice_param();

    let mut sum = [0u64; 5];
    let mut param = [0u32; 5];
    for sb in 0..sb_max {
        for &v in &res[sb * sb_length..(sb + 1) * sb_length] {
            sum[sb] += u64::from(rice::encode_signbit(v));
        }
        sum[4] += sum[sb];
        param[sb] = rice::estimate_param(sum[sb], sb_length, max_param);
    }
    param[4] = rice::estimate_param(sum[4], res.len(), max_param);

    let count1 = if stage.count_algorithm == BitCount::Exact {
        block_count_exact(res, 1, &param[4..5], &[], sconf, ra_block, order, false)
    } else {
        rice::estimate_count(sum[4], res.len(), param[4]) as u32
            + 4
            + u32::from(max_param > 15)
    };

    let p0 = param[0];
    if sb_max == 1 || (p0 == param[1] && p0 == param[2] && p0 == param[3]) {
        ent.sub_blocks = 1;
        ent.rice_param[0] = param[4];
        ent.bits_ec_param_and_res = count1;
        return;
    }

    let count4 = if stage.count_algorithm == BitCount::Exact {
        block_count_exact(res, 4, &param[..4], &[], sconf, ra_block, order, false)
    } else {
        let mut count = 0u32;
        for sb in 0..sb_max {
            count += rice::estimate_count(sum[sb], sb_length, param[sb]) as u32;
            if sb == 0 {
                count += 4 + u32::from(max_param > 15);
            } else {
                count += rice::rice_count(param[sb] as i32 - param[sb - 1] as i32, 0);
            }
        }
        count
    };

    if count1 <= count4 {
        ent.sub_blocks = 1;
        ent.rice_param[0] = param[4];
        ent.bits_ec_param_and_res = count1;
    } else {
        ent.sub_blocks = 4;
        ent.rice_param[..4].copy_from_slice(&param[..4]);
        ent.bits_ec_param_and_res = count4;
    }
}

fn find_rice_params_exact(
    sconf: &SpecificConfig,
    stage: &Stage,
    res: &[i32],
    ra_block: bool,
    order: usize,
    ent: &mut super::block::EntropyInfo,
) {
    let sb_max = max_sub_blocks(stage, res.len());
    let sb_length = res.len() / sb_max;
    let max_param = sconf.max_rice_param();

    let mut param = [0u32; 4];
    let mut count = [0u32; 4];
    let mut best_k = max_param / 3;

    for sb in 0..sb_max {
        let sub = &res[sb * sb_length..(sb + 1) * sb_length];
        let ra_sub = sb == 0 && ra_block;
        let sub_count =
            |k| subblock_count_exact(sub, res.len(), k, 0, sconf, ra_sub, order, false);

        // probe k and k + 1 to pick a walking direction, then descend
        let mut k = best_k.min(max_param - 1);
        let c1 = sub_count(k);
        let c2 = sub_count(k + 1);
        let mut cur;
        let step: i64;
        if c2 < c1 {
            best_k = k + 1;
            cur = c2;
            step = 1;
            k += 2;
        } else {
            best_k = k;
            cur = c1;
            step = -1;
            k = k.wrapping_sub(1);
        }

        while k <= max_param {
            let c = sub_count(k);
            if c < cur {
                best_k = k;
                cur = c;
            } else {
                break;
            }
            k = if step > 0 { k + 1 } else { k.wrapping_sub(1) };
        }
        param[sb] = best_k;
        count[sb] = cur;
    }

    let p0 = param[0];
    if sb_max == 1 || (p0 == param[1] && p0 == param[2] && p0 == param[3]) {
        ent.sub_blocks = 1;
        ent.rice_param[0] = param[0];
        ent.bits_ec_param_and_res =
            block_count_exact(res, 1, &param[..1], &[], sconf, ra_block, order, false);
        return;
    }

    let avg = [(param[0] + param[1] + param[2] + param[3]) >> 2];
    let count1 = block_count_exact(res, 1, &avg, &[], sconf, ra_block, order, false);
    let count4 =
        count[0] + count[1] + count[2] + count[3] + param_count(4, &param, &[], sconf, false);

    if count1 <= count4 {
        ent.sub_blocks = 1;
        ent.rice_param[0] = avg[0];
        ent.bits_ec_param_and_res = count1;
    } else {
        ent.sub_blocks = 4;
        ent.rice_param[..4].copy_from_slice(&param);
        ent.bits_ec_param_and_res = count4;
    }
}

fn find_bgmc_params_est(
    sconf: &SpecificConfig,
    stage: &Stage,
    res: &[i32],
    ra_block: bool,
    order: usize,
    ent: &mut super::block::EntropyInfo,
) {
    let p_max = max_bgmc_partition(stage, res.len());
    let max_param = sconf.max_rice_param();

    let mut s = [[0u32; 8]; 4];
    let mut sx = [[0u32; 8]; 4];
    let mut sum = [[0u64; 8]; 4];
    let mut p_best = p_max;
    let mut count_best = u32::MAX;

    for p in (0..=p_max).rev() {
        let num_subblocks = 1usize << p;
        let sb_length = res.len() / num_subblocks;
        let mut count = 0u32;

        for sb in 0..num_subblocks {
            sum[p][sb] = if p == p_max {
                res[sb * sb_length..(sb + 1) * sb_length]
                    .iter()
                    .map(|&v| u64::from(v.unsigned_abs()))
                    .sum()
            } else {
                sum[p + 1][sb << 1] + sum[p + 1][(sb << 1) + 1]
            };
            let (si, sxi) = estimate_bgmc_params(sum[p][sb], sb_length, max_param);
            s[p][sb] = si;
            sx[p][sb] = sxi;

            if stage.ecsub_algorithm == SubdivisionSearch::RiceEstimate {
                let k = rice::estimate_param(sum[p][sb], sb_length, max_param);
                count += rice::estimate_count(sum[p][sb], sb_length, k) as u32;
            }
        }

        if stage.ecsub_algorithm == SubdivisionSearch::BgmcExact {
            count = block_count_exact(
                res,
                num_subblocks,
                &s[p],
                &sx[p],
                sconf,
                ra_block,
                order,
                true,
            );
        }

        if count <= count_best {
            count_best = count;
            p_best = p;
        }
    }

    ent.sub_blocks = 1 << p_best;
    for sb in 0..ent.sub_blocks {
        ent.rice_param[sb] = s[p_best][sb];
        ent.bgmc_param[sb] = sx[p_best][sb];
    }

    if stage.ecsub_algorithm == SubdivisionSearch::RiceEstimate
        && stage.count_algorithm == BitCount::Exact
    {
        ent.bits_ec_param_and_res = block_count_exact(
            res,
            ent.sub_blocks,
            &ent.rice_param,
            &ent.bgmc_param,
            sconf,
            ra_block,
            order,
            true,
        );
    } else {
        ent.bits_ec_param_and_res = count_best;
    }
}

fn find_bgmc_params_exact(
    sconf: &SpecificConfig,
    stage: &Stage,
    res: &[i32],
    ra_block: bool,
    order: usize,
    ent: &mut super::block::EntropyInfo,
) {
    let p_max = max_bgmc_partition(stage, res.len());

    let mut s = [[0u32; 8]; 4];
    let mut sx = [[0u32; 8]; 4];
    let mut p_best = p_max;
    let mut count_best = u32::MAX;

    for p in (0..=p_max).rev() {
        let num_subblocks = 1usize << p;
        let sb_length = res.len() / num_subblocks;

        for sb in 0..num_subblocks {
            let sub = &res[sb * sb_length..(sb + 1) * sb_length];
            let ra_sub = sb == 0 && ra_block;
            let sub_count = |s0: i32| {
                subblock_count_exact(
                    sub,
                    res.len(),
                    (s0 >> 4) as u32,
                    (s0 & 0xF) as u32,
                    sconf,
                    ra_sub,
                    order,
                    true,
                )
            };

            // seed from the neighbor sub-block or the parent partition
            let s0: i32 = if sb > 0 {
                ((s[p][sb - 1] << 4 | sx[p][sb - 1]) as i32).clamp(5, 250)
            } else if p < p_max {
                ((s[p + 1][sb >> 1] << 4 | sx[p + 1][sb >> 1]) as i32).clamp(5, 250)
            } else {
                127
            };

            // probe +-5 to choose a direction
            let c_mid = sub_count(s0);
            let c_up = sub_count(s0 + 5);
            let c_down = sub_count(s0 - 5);

            let mut best_s0 = s0;
            if c_up < c_mid || c_down < c_mid {
                let step: i32 = if c_up < c_mid { 1 } else { -1 };
                let mut best_count = c_mid;
                let mut dry = 0;
                let mut cand = s0 + step;
                while (0..256).contains(&cand) {
                    let c = sub_count(cand);
                    if c < best_count {
                        best_s0 = cand;
                        best_count = c;
                        dry = 0;
                    } else {
                        dry += 1;
                        if dry > 5 {
                            break;
                        }
                    }
                    cand += step;
                }
            } else {
                // the minimum hides between the probes; scan around the seed
                let mut best_count = c_mid;
                for cand in s0 - 4..s0 + 5 {
                    let c = sub_count(cand);
                    if c < best_count {
                        best_s0 = cand;
                        best_count = c;
                    }
                }
            }

            s[p][sb] = (best_s0 >> 4) as u32;
            sx[p][sb] = (best_s0 & 0xF) as u32;
        }

        let count = block_count_exact(
            res,
            num_subblocks,
            &s[p],
            &sx[p],
            sconf,
            ra_block,
            order,
            true,
        );
        if count < count_best {
            count_best = count;
            p_best = p;
        }
    }

    ent.sub_blocks = 1 << p_best;
    for sb in 0..ent.sub_blocks {
        ent.rice_param[sb] = s[p_best][sb];
        ent.bgmc_param[sb] = sx[p_best][sb];
    }
    ent.bits_ec_param_and_res = count_best;
}

/// Chooses the sub-block division and entropy parameters of a block.
pub(crate) fn find_block_entropy_params(
    sconf: &SpecificConfig,
    stage: &Stage,
    res: &[i32],
    ra_block: bool,
    order: usize,
    ent: &mut super::block::EntropyInfo,
) {
    match stage.param_algorithm {
        ParamSearch::BgmcEstimate => {
            find_bgmc_params_est(sconf, stage, res, ra_block, order, ent);
        }
        ParamSearch::BgmcExact => {
            find_bgmc_params_exact(sconf, stage, res, ra_block, order, ent);
        }
        ParamSearch::RiceEstimate => {
            find_rice_params_est(stage, sconf, res, ra_block, order, ent);
        }
        ParamSearch::RiceExact => {
            find_rice_params_exact(sconf, stage, res, ra_block, order, ent);
        }
    }
}

fn test_const_value(stage: &Stage, sconf: &SpecificConfig, block: &mut Block, cur: &[i32]) {
    if !stage.check_constant {
        block.constant = false;
        return;
    }

    let val = cur[0];
    block.constant = cur.iter().all(|&v| v == val);
    block.bits_const_block = 0;
    if block.constant {
        block.constant_value = val;
        block.bits_const_block += 6; // const_block flag + reserved
        if val != 0 {
            block.bits_const_block += if sconf.floating {
                24
            } else {
                sconf.bits_per_raw_sample
            };
        }
    }
}

fn test_zero_lsb(
    stage: &Stage,
    sconf: &SpecificConfig,
    lanes: &mut Lanes,
    block: &mut Block,
    channel: usize,
) {
    block.shift_lsbs = 0;
    if !stage.check_lsbs {
        return;
    }

    let pos = lanes.pos(block.start);
    let mut common = 0i32;
    {
        let cur = lanes.channel(block.cur_lane, channel);
        for &v in &cur[pos..pos + block.length] {
            common |= v;
            if common & 1 != 0 {
                return;
            }
        }
    }
    if common == 0 {
        return;
    }
    // shift_pos is a 4-bit field, so at most 16 bits can be stripped
    block.shift_lsbs = common.trailing_zeros().min(15);

    // shift history too: the predictor reaches across the block boundary
    let (src, lsb) = lanes.split_src_dst(block.cur_lane, Lane::Lsb, channel);
    for i in pos - sconf.max_order..pos + block.length {
        lsb[i] = src[i] >> block.shift_lsbs;
    }
    block.cur_lane = Lane::Lsb;
}

/// Computes PARCOR coefficients of the block up to `max_order` and fills
/// the quantized forms plus cumulative code lengths.
fn compute_block_parcor(
    sconf: &SpecificConfig,
    scratch: &mut SearchScratch,
    block: &mut Block,
    cur: &[i32],
    pos: usize,
    max_order: usize,
) {
    let window = &scratch.windows[block.div_block.max(0) as usize];
    let len = block.length;
    scratch.windowed.resize(len, 0.0);
    lpc::apply_window(&cur[pos..pos + len], window, &mut scratch.windowed[..len]);
    lpc::auto_correlation(&scratch.windowed[..len], max_order, &mut scratch.acf);
    lpc::compute_ref_coefs(
        &scratch.acf,
        max_order,
        &mut scratch.parcor,
        &mut scratch.parcor_error,
    );
    quantize_block_parcor(sconf, scratch, block, max_order);
}

fn quantize_block_parcor(
    sconf: &SpecificConfig,
    scratch: &mut SearchScratch,
    block: &mut Block,
    max_order: usize,
) {
    block.bits_parcor[0] = 0;
    for i in 0..max_order {
        let (q, r, bits) = lpc::quantize_parcor(scratch.parcor[i], i, sconf.coef_table);
        block.q_parcor[i] = q;
        scratch.r_parcor[i] = r;
        block.bits_parcor[i + 1] = block.bits_parcor[i] + bits;
    }
}

/// Runs short-term prediction for the block and leaves the residual in the
/// residual lane. Falls back to a first-order predictor when the PARCOR to
/// LPC conversion overflows.
fn generate_residuals(
    sconf: &SpecificConfig,
    stage: &Stage,
    lanes: &mut Lanes,
    scratch: &mut SearchScratch,
    block: &mut Block,
    channel: usize,
) {
    let pos = lanes.pos(block.start);
    let (cur, res) = lanes.split_src_dst(block.cur_lane, Lane::Res, channel);
    let ok = lpc::compute_residuals(
        &scratch.r_parcor,
        &mut scratch.lpc,
        cur,
        pos,
        block.length,
        block.opt_order,
        block.ra_block,
        &mut res[pos..pos + block.length],
    )
    .is_ok();

    if !ok {
        // 32-bit overflow in the coefficient conversion; use a first-order
        // predictor with a preset reflection coefficient instead
        warn!("PARCOR conversion overflowed, falling back to first order");
        if stage.adapt_order {
            block.opt_order = 1;
        }
        scratch.parcor[..block.opt_order].fill(0.0);
        scratch.parcor[0] = -0.9;
        quantize_block_parcor(sconf, scratch, block, block.opt_order);
        lpc::compute_residuals(
            &scratch.r_parcor,
            &mut scratch.lpc,
            cur,
            pos,
            block.length,
            block.opt_order,
            block.ra_block,
            &mut res[pos..pos + block.length],
        )
        .expect("first-order conversion cannot overflow");
    }

    // zero unused coefficients of short random-access blocks: without
    // adaptive order every coefficient up to max_order hits the bitstream
    if block.ra_block && !sconf.adapt_order {
        for i in block.opt_order.min(block.length)..sconf.max_order {
            block.q_parcor[i] = 0;
            scratch.r_parcor[i] = 0;
        }
    }

    block.cur_lane = Lane::Res;
}

/// Bit count of the block at a fixed order, used by the exact order search.
#[allow(clippy::too_many_arguments)]
fn block_size_fixed_order(
    sconf: &SpecificConfig,
    stage: &Stage,
    lanes: &mut Lanes,
    scratch: &mut SearchScratch,
    block: &mut Block,
    channel: usize,
    order: usize,
) -> Option<u32> {
    let save_lane = block.cur_lane;
    let pos = lanes.pos(block.start);

    if order > 0 {
        let (cur, res) = lanes.split_src_dst(block.cur_lane, Lane::Res, channel);
        lpc::compute_residuals(
            &scratch.r_parcor,
            &mut scratch.lpc,
            cur,
            pos,
            block.length,
            order,
            block.ra_block,
            &mut res[pos..pos + block.length],
        )
        .ok()?;
        block.cur_lane = Lane::Res;
    }

    let use_ltp = usize::from(block.ltp_info[usize::from(block.js_block)].use_ltp);
    {
        let cur = lanes.channel(block.cur_lane, channel);
        let res = &cur[pos..pos + block.length];
        let ent = &mut block.ent_info[use_ltp];
        find_block_entropy_params(sconf, stage, res, block.ra_block, order, ent);
    }

    let mut count = block.bits_misc
        + block.bits_adapt_order
        + block.bits_parcor[order]
        + block.ent_info[use_ltp].bits_ec_param_and_res;
    count += (8 - (count & 7)) & 7;

    block.cur_lane = save_lane;
    Some(count)
}

/// Picks the prediction order, either by exact bit counts per order or by
/// the error-based estimate with valley detection.
fn find_adapt_order(
    sconf: &SpecificConfig,
    stage: &Stage,
    lanes: &mut Lanes,
    scratch: &mut SearchScratch,
    block: &mut Block,
    channel: usize,
    max_order: usize,
) {
    let valley_detect = stage.adapt_search_algorithm == OrderSearch::ValleyDetect;
    let valley_threshold = 2.max(max_order / 6);
    let exact_count = stage.adapt_count_algorithm == BitCount::Exact;

    let mut best = 0usize;
    let mut count = vec![u32::MAX; max_order + 1];

    for i in 0..=max_order {
        count[i] = if exact_count {
            block_size_fixed_order(sconf, stage, lanes, scratch, block, channel, i)
                .unwrap_or(u32::MAX)
        } else if i > 0 && scratch.parcor_error[i - 1] >= 1.0 {
            let estimate = f64::from(
                block.bits_misc + block.bits_adapt_order + block.bits_parcor[i],
            ) + 0.5 * scratch.parcor_error[i - 1].log2() * block.length as f64;
            estimate as u32
        } else {
            u32::MAX
        };

        if count[i] < count[best] {
            best = i;
        } else if valley_detect && (i - best) > valley_threshold {
            break;
        }
    }
    block.opt_order = best;
}

/// Checks whether long-term prediction pays off for the block, switching
/// the block to the LTP residual when it does.
fn check_ltp(
    sconf: &SpecificConfig,
    stage: &Stage,
    lanes: &mut Lanes,
    scratch: &mut SearchScratch,
    block: &mut Block,
    channel: usize,
    bit_count: &mut u32,
) {
    let pos = lanes.pos(block.start);
    let save_lane = block.cur_lane;
    let js = usize::from(block.js_block);

    {
        let cur = lanes.channel(block.cur_lane, channel);
        ltp::find_block_params(
            cur,
            pos,
            block.length,
            block.opt_order,
            sconf.sample_rate,
            stage.ltp_coeff_algorithm,
            &mut scratch.corr,
            &mut block.ltp_info[js],
        );
    }
    {
        let (cur, out) = lanes.split_src_dst(block.cur_lane, Lane::Ltp, channel);
        ltp::generate_residuals(
            &block.ltp_info[js],
            cur,
            pos,
            block.length,
            &mut out[pos..pos + block.length],
        );
    }

    block.cur_lane = Lane::Ltp;
    block.ltp_info[js].use_ltp = true;
    {
        let cur = lanes.channel(Lane::Ltp, channel);
        let res = &cur[pos..pos + block.length];
        find_block_entropy_params(
            sconf,
            stage,
            res,
            block.ra_block,
            block.opt_order,
            &mut block.ent_info[1],
        );
    }
    block.ltp_info[js].bits_ltp = ltp::side_info_bits(&block.ltp_info[js], sconf.sample_rate);

    let mut bit_count_ltp = block.bits_misc
        + block.bits_adapt_order
        + block.bits_parcor[block.opt_order]
        + block.ent_info[1].bits_ec_param_and_res
        + block.ltp_info[js].bits_ltp;
    bit_count_ltp += (8 - (bit_count_ltp & 7)) & 7;

    if bit_count_ltp < *bit_count {
        *bit_count = bit_count_ltp;
    } else {
        block.ltp_info[js].use_ltp = false;
        block.ltp_info[js].bits_ltp = 1;
        block.cur_lane = save_lane;
    }
}

/// Runs the full per-block search and returns the encoded size of the
/// block in bits (byte-aligned, as blocks are written).
pub(crate) fn find_block_params(
    sconf: &SpecificConfig,
    stage: &Stage,
    lanes: &mut Lanes,
    scratch: &mut SearchScratch,
    block: &mut Block,
    channel: usize,
) -> u32 {
    block.cur_lane = if block.js_block { Lane::Diff } else { Lane::Raw };
    block.bits_misc = 1; // block_type

    let pos = lanes.pos(block.start);
    let len = block.length;
    {
        let cur = lanes.channel(block.cur_lane, channel);
        let window = &cur[pos..pos + len];
        test_const_value(stage, sconf, block, window);
    }

    if !block.constant {
        test_zero_lsb(stage, sconf, lanes, block, channel);
        block.bits_misc += 1; // shift_lsbs flag
        if block.shift_lsbs > 0 {
            block.bits_misc += 4; // shift_pos
        }
    }

    block.bits_misc += 1; // js_block

    if block.constant {
        return block.bits_misc + block.bits_const_block;
    }

    block.bits_adapt_order = if sconf.adapt_order {
        let limit = (i64::try_from(block.length >> 3).unwrap_or(i64::MAX) - 1)
            .clamp(2, sconf.max_order as i64 + 1);
        bgmc::ceil_log2(limit as usize)
    } else {
        0
    };

    let mut max_order = stage.max_order;
    if sconf.max_order > 0 {
        if sconf.adapt_order {
            max_order = max_order.min((1 << block.bits_adapt_order) - 1);
        }
        let cur = lanes.channel(block.cur_lane, channel);
        compute_block_parcor(sconf, scratch, block, cur, pos, max_order);
    }

    if sconf.max_order > 0 && sconf.adapt_order && stage.adapt_order {
        find_adapt_order(sconf, stage, lanes, scratch, block, channel, max_order);
    } else {
        block.opt_order = max_order;
    }

    if block.opt_order > 0 {
        generate_residuals(sconf, stage, lanes, scratch, block, channel);
    }

    let js = usize::from(block.js_block);
    block.ltp_info[js].use_ltp = false;
    {
        let cur = lanes.channel(block.cur_lane, channel);
        let res = &cur[pos..pos + block.length];
        find_block_entropy_params(
            sconf,
            stage,
            res,
            block.ra_block,
            block.opt_order,
            &mut block.ent_info[0],
        );
    }

    block.ltp_info[js].bits_ltp = u32::from(sconf.long_term_prediction);
    let mut bit_count = block.bits_misc
        + block.bits_adapt_order
        + block.bits_parcor[block.opt_order]
        + block.ent_info[0].bits_ec_param_and_res
        + block.ltp_info[js].bits_ltp;
    bit_count += (8 - (bit_count & 7)) & 7;

    if sconf.long_term_prediction {
        check_ltp(sconf, stage, lanes, scratch, block, channel, &mut bit_count);
    }

    bit_count
}
