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

//! Per-block encoder state and the per-channel signal lanes.

use super::constant::LTP_TAPS;
use super::constant::MAX_SUB_BLOCKS;

/// Which per-channel signal a block is currently being coded from.
///
/// Blocks never hold pointers into the lanes; they carry this selector plus
/// their start offset instead.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Lane {
    /// Raw (sign-normalized) input samples.
    #[default]
    Raw,
    /// Channel-pair difference signal.
    Diff,
    /// LSB-shifted working signal.
    Lsb,
    /// Short-term prediction residual.
    Res,
    /// Long-term prediction residual.
    Ltp,
}

/// Long-term predictor decision for one block.
#[derive(Clone, Debug, Default)]
pub struct LtpInfo {
    pub use_ltp: bool,
    /// Lag in samples, within `[max(4, opt_order + 1), 2048)`.
    pub lag: usize,
    /// Five gain taps, premultiplied by 8 (tap 2 holds a table value).
    pub gain: [i32; LTP_TAPS],
    /// Bit count for the `use_ltp` flag, gains and lag.
    pub bits_ltp: u32,
}

/// Entropy-coder decision for one block.
#[derive(Clone, Debug)]
pub struct EntropyInfo {
    /// Number of sub-blocks: 1, 2, 4 or 8.
    pub sub_blocks: usize,
    /// Rice parameter per sub-block (high nibble of the BGMC parameter).
    pub rice_param: [u32; MAX_SUB_BLOCKS],
    /// BGMC sub-parameter per sub-block (low nibble).
    pub bgmc_param: [u32; MAX_SUB_BLOCKS],
    /// Bit count for the entropy parameters plus all residuals.
    pub bits_ec_param_and_res: u32,
}

impl Default for EntropyInfo {
    fn default() -> Self {
        Self {
            sub_blocks: 1,
            rice_param: [0; MAX_SUB_BLOCKS],
            bgmc_param: [0; MAX_SUB_BLOCKS],
            bits_ec_param_and_res: 0,
        }
    }
}

/// State of one block of one channel during the per-frame search.
#[derive(Clone, Debug, Default)]
pub struct Block {
    /// Set on the first block of a random-access frame only.
    pub ra_block: bool,
    /// All samples equal `constant_value`.
    pub constant: bool,
    pub constant_value: i32,
    /// Start offset of the block within the frame.
    pub start: usize,
    /// Length of the block in samples.
    pub length: usize,
    /// Subdivision level; `length == frame_length >> div_block`. Negative
    /// for the truncated trailing block of a short last frame.
    pub div_block: i32,
    /// Chosen prediction order.
    pub opt_order: usize,
    /// Block is coded from the difference signal.
    pub js_block: bool,
    /// Number of common trailing zero bits stripped from the samples.
    pub shift_lsbs: u32,
    /// Signal the block is currently being coded from.
    pub cur_lane: Lane,
    /// 7-bit quantized PARCOR coefficients, sized `max_order`.
    pub q_parcor: Vec<i32>,
    /// One set per `js_block` state.
    pub ltp_info: [LtpInfo; 2],
    /// One set per `use_ltp` state.
    pub ent_info: [EntropyInfo; 2],
    /// Bit count for the constant-block fields.
    pub bits_const_block: u32,
    /// Bit count for `block_type`, `js_block` and `shift_lsbs`.
    pub bits_misc: u32,
    /// Bit count of the `opt_order` field when adaptive order is used.
    pub bits_adapt_order: u32,
    /// Cumulative PARCOR code lengths; entry `k` counts coefficients `< k`.
    pub bits_parcor: Vec<u32>,
}

impl Block {
    pub fn new(max_order: usize) -> Self {
        Self {
            q_parcor: vec![0; max_order],
            bits_parcor: vec![0; max_order + 1],
            ..Self::default()
        }
    }

    /// Entropy info for the currently selected LTP state.
    pub fn ent(&self) -> &EntropyInfo {
        &self.ent_info[usize::from(self.ltp_info[usize::from(self.js_block)].use_ltp)]
    }

    /// LTP info for the currently selected joint-stereo state.
    pub fn ltp(&self) -> &LtpInfo {
        &self.ltp_info[usize::from(self.js_block)]
    }
}

/// All per-channel signal lanes of one frame, plus history.
///
/// Every lane stores `channels * channel_size` samples; sample `t` of
/// channel `c` lives at `c * channel_size + channel_offset + t`, and the
/// `channel_offset` samples before it are the history carried across
/// frames. The difference lane is indexed by channel pair (`c >> 1`).
#[derive(Clone, Debug)]
pub struct Lanes {
    pub raw: Vec<i32>,
    pub dif: Vec<i32>,
    pub lsb: Vec<i32>,
    pub res: Vec<i32>,
    pub ltp: Vec<i32>,
    pub channels: usize,
    pub channel_size: usize,
    pub channel_offset: usize,
}

impl Lanes {
    pub fn new(channels: usize, frame_length: usize, history: usize, use_ltp: bool) -> Self {
        // lane rows are padded to a multiple of four samples
        let channel_offset = (history + 3) & !3;
        let channel_size = (frame_length + channel_offset + 3) & !3;
        let pairs = channels.div_ceil(2);
        Self {
            raw: vec![0; channels * channel_size],
            dif: vec![0; pairs * channel_size],
            lsb: vec![0; channels * channel_size],
            res: vec![0; channels * channel_size],
            ltp: if use_ltp {
                vec![0; channels * channel_size]
            } else {
                Vec::new()
            },
            channels,
            channel_size,
            channel_offset,
        }
    }

    /// In-lane index of sample `t` (may be negative into the history).
    #[inline]
    pub fn pos(&self, t: usize) -> usize {
        self.channel_offset + t
    }

    #[inline]
    fn row(&self, c: usize) -> std::ops::Range<usize> {
        c * self.channel_size..(c + 1) * self.channel_size
    }

    /// Full lane row of channel `c` (history plus frame window).
    pub fn channel(&self, lane: Lane, c: usize) -> &[i32] {
        match lane {
            Lane::Raw => &self.raw[self.row(c)],
            Lane::Diff => &self.dif[self.row(c >> 1)],
            Lane::Lsb => &self.lsb[self.row(c)],
            Lane::Res => &self.res[self.row(c)],
            Lane::Ltp => &self.ltp[self.row(c)],
        }
    }

    pub fn channel_mut(&mut self, lane: Lane, c: usize) -> &mut [i32] {
        let row = match lane {
            Lane::Diff => self.row(c >> 1),
            Lane::Raw | Lane::Lsb | Lane::Res | Lane::Ltp => self.row(c),
        };
        match lane {
            Lane::Raw => &mut self.raw[row],
            Lane::Diff => &mut self.dif[row],
            Lane::Lsb => &mut self.lsb[row],
            Lane::Res => &mut self.res[row],
            Lane::Ltp => &mut self.ltp[row],
        }
    }

    /// Borrows a source lane row and a distinct destination lane row of
    /// channel `c` at once.
    ///
    /// # Panics
    ///
    /// Panics if `src` and `dst` name the same lane, or if `dst` is the raw
    /// or difference lane (those are only written during staging).
    pub fn split_src_dst(&mut self, src: Lane, dst: Lane, c: usize) -> (&[i32], &mut [i32]) {
        assert_ne!(src, dst);
        let row = self.row(c);
        let src_row = match src {
            Lane::Diff => self.row(c >> 1),
            Lane::Raw | Lane::Lsb | Lane::Res | Lane::Ltp => row.clone(),
        };
        let Self {
            raw,
            dif,
            lsb,
            res,
            ltp,
            ..
        } = self;
        match (src, dst) {
            (Lane::Raw, Lane::Lsb) => (&raw[src_row], &mut lsb[row]),
            (Lane::Diff, Lane::Lsb) => (&dif[src_row], &mut lsb[row]),
            (Lane::Raw, Lane::Res) => (&raw[src_row], &mut res[row]),
            (Lane::Diff, Lane::Res) => (&dif[src_row], &mut res[row]),
            (Lane::Lsb, Lane::Res) => (&lsb[src_row], &mut res[row]),
            (Lane::Raw, Lane::Ltp) => (&raw[src_row], &mut ltp[row]),
            (Lane::Diff, Lane::Ltp) => (&dif[src_row], &mut ltp[row]),
            (Lane::Lsb, Lane::Ltp) => (&lsb[src_row], &mut ltp[row]),
            (Lane::Res, Lane::Ltp) => (&res[src_row], &mut ltp[row]),
            _ => panic!("destination must be a derived lane distinct from the source"),
        }
    }

    /// Computes the difference signal of the pair starting at even channel
    /// `c` over `history` samples of context plus the frame window.
    pub fn gen_dif_signal(&mut self, c: usize, frame_size: usize, history: usize) {
        let from = self.pos(0) - history;
        let to = self.pos(frame_size);
        let row1 = self.row(c).start;
        let row2 = self.row(c + 1).start;
        let dif_row = self.row(c >> 1).start;
        let Self { raw, dif, .. } = self;
        for i in from..to {
            dif[dif_row + i] = raw[row2 + i] - raw[row1 + i];
        }
    }

    /// Copies the tail of each raw lane in front of the next frame's window.
    pub fn carry_history(&mut self, frame_size: usize) {
        let hist = self.channel_offset;
        for c in 0..self.channels {
            let row = self.row(c);
            let lane = &mut self.raw[row];
            for i in 0..hist {
                lane[i] = lane[frame_size + i];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lane_layout() {
        let lanes = Lanes::new(2, 100, 10, false);
        assert_eq!(lanes.channel_offset, 12);
        assert_eq!(lanes.channel_size % 4, 0);
        assert!(lanes.channel_size >= 112);
        assert_eq!(lanes.raw.len(), 2 * lanes.channel_size);
        assert_eq!(lanes.dif.len(), lanes.channel_size);
        assert!(lanes.ltp.is_empty());
    }

    #[test]
    fn history_carrying() {
        let mut lanes = Lanes::new(1, 16, 4, false);
        let frame_size = 16;
        let pos = lanes.pos(0);
        {
            let raw = lanes.channel_mut(Lane::Raw, 0);
            for t in 0..frame_size {
                raw[pos + t] = t as i32 + 1;
            }
        }
        lanes.carry_history(frame_size);
        let raw = lanes.channel(Lane::Raw, 0);
        // the last `channel_offset` samples now precede the window
        for i in 0..lanes.channel_offset {
            assert_eq!(raw[i], raw[frame_size + i]);
        }
        assert_eq!(raw[pos - 1], 16);
    }

    #[test]
    fn split_borrow_of_source_and_residual() {
        let mut lanes = Lanes::new(2, 8, 0, false);
        lanes.channel_mut(Lane::Raw, 1)[3] = 42;
        let (src, res) = lanes.split_src_dst(Lane::Raw, Lane::Res, 1);
        res[0] = src[3];
        assert_eq!(lanes.channel(Lane::Res, 1)[0], 42);
    }

    #[test]
    fn entropy_selection_follows_ltp_state() {
        let mut block = Block::new(4);
        block.ent_info[0].bits_ec_param_and_res = 100;
        block.ent_info[1].bits_ec_param_and_res = 50;
        assert_eq!(block.ent().bits_ec_param_and_res, 100);
        block.ltp_info[0].use_ltp = true;
        assert_eq!(block.ent().bits_ec_param_and_res, 50);
        block.js_block = true;
        assert_eq!(block.ent().bits_ec_param_and_res, 100);
    }
}
