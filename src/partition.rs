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

//! Block partitioning: the `bs_info` tree, per-node size tables, merge
//! strategies and the joint-stereo channel-pair selection.
//!
//! `bs_info` is a 31-bit word; bit `30 - n` set means node `n` is split
//! into children `2n + 1` and `2n + 2`. Leaves visited in pre-order are the
//! actual blocks of the frame.

use super::block::Block;
use super::block::Lanes;
use super::config::MergeSearch;
use super::constant::MAX_BLOCKS;
use super::config::SpecificConfig;
use super::config::Stage;
use super::search::find_block_params;
use super::search::SearchScratch;

/// Returns whether node `n` is split.
#[inline]
pub fn bs_bit(bs_info: u32, n: usize) -> bool {
    n < 31 && (bs_info << n) & 0x4000_0000 != 0
}

/// Collects the pre-order leaves of `bs_info` as `(node, level)` pairs.
pub fn collect_leaves(bs_info: u32, n: usize, level: usize, dest: &mut Vec<(usize, usize)>) {
    if bs_bit(bs_info, n) {
        collect_leaves(bs_info, 2 * n + 1, level + 1, dest);
        collect_leaves(bs_info, 2 * n + 2, level + 1, dest);
    } else {
        dest.push((n, level));
    }
}

/// Sums the per-node sizes of all leaves below node `n`.
fn subtree_size(bs_info: u32, n: usize, sizes: &[u32]) -> u32 {
    if bs_bit(bs_info, n) {
        subtree_size(bs_info, 2 * n + 1, sizes) + subtree_size(bs_info, 2 * n + 2, sizes)
    } else {
        sizes[n]
    }
}

/// Clears the split bit of node `n` and its whole subtree.
fn clear_subtree(bs_info: &mut u32, n: usize) {
    if n < 31 {
        *bs_info &= !(1 << (30 - n));
        clear_subtree(bs_info, 2 * n + 1);
        clear_subtree(bs_info, 2 * n + 2);
    }
}

/// Prunes the tree bottom-up: children are merged into their parent as soon
/// as both are leaves and the parent codes fewer bits.
fn merge_bottomup(bs_info: &mut u32, n: usize, sizes1: &[u32], sizes2: Option<&[u32]>) {
    if !bs_bit(*bs_info, n) {
        return;
    }
    let a = 2 * n + 1;
    let b = 2 * n + 2;

    if bs_bit(*bs_info, a) && bs_bit(*bs_info, b) {
        merge_bottomup(bs_info, a, sizes1, sizes2);
        merge_bottomup(bs_info, b, sizes1, sizes2);
    }

    if !bs_bit(*bs_info, a) && !bs_bit(*bs_info, b) {
        let mut sum_n = sizes1[n];
        let mut sum_a = sizes1[a];
        let mut sum_b = sizes1[b];
        if let Some(sizes2) = sizes2 {
            sum_n += sizes2[n];
            sum_a += sizes2[a];
            sum_b += sizes2[b];
        }
        // ties collapse into the coarser form
        if sum_a + sum_b >= sum_n {
            clear_subtree(bs_info, n);
        }
    }
}

/// Prunes the tree by full search: both subtrees are optimized first, then
/// the collapsed subtrees compete against the undivided node.
fn merge_fullsearch(bs_info: &mut u32, n: usize, sizes1: &[u32], sizes2: Option<&[u32]>) {
    if !bs_bit(*bs_info, n) {
        return;
    }
    let a = 2 * n + 1;
    let b = 2 * n + 2;

    if bs_bit(*bs_info, a) {
        merge_fullsearch(bs_info, a, sizes1, sizes2);
    }
    if bs_bit(*bs_info, b) {
        merge_fullsearch(bs_info, b, sizes1, sizes2);
    }

    let mut sum_n = sizes1[n];
    let mut sum_a = subtree_size(*bs_info, a, sizes1);
    let mut sum_b = subtree_size(*bs_info, b, sizes1);
    if let Some(sizes2) = sizes2 {
        sum_n += sizes2[n];
        sum_a += subtree_size(*bs_info, a, sizes2);
        sum_b += subtree_size(*bs_info, b, sizes2);
    }
    // ties collapse into the coarser form
    if sum_a + sum_b >= sum_n {
        clear_subtree(bs_info, n);
    }
}

/// Lays out the leaves of `bs_info` as concrete blocks of a channel and
/// returns their number.
///
/// A short last frame keeps the block structure of the bitstream but
/// shrinks trailing blocks to absorb the shortfall; the last non-empty
/// leaf may be shorter and later leaves are dropped.
pub(crate) fn set_blocks(
    sconf: &SpecificConfig,
    blocks: &mut [Block],
    bs_info: u32,
    frame_size: usize,
) -> usize {
    let mut leaves = Vec::with_capacity(blocks.len());
    collect_leaves(bs_info, 0, 0, &mut leaves);

    let mut start = 0usize;
    for (block, &(_, level)) in blocks.iter_mut().zip(&leaves) {
        block.div_block = level as i32;
        block.length = sconf.frame_length >> level;
        block.start = start;
        start += block.length;
    }
    let mut num_blocks = leaves.len();

    if frame_size != sconf.frame_length {
        let mut remaining = frame_size;
        for (b, block) in blocks.iter_mut().enumerate().take(num_blocks) {
            if remaining <= block.length {
                block.div_block = -1;
                block.length = remaining;
                num_blocks = b + 1;
                break;
            }
            remaining -= block.length;
        }
    }

    num_blocks
}

/// Per-frame partition-search state, reused across frames.
pub(crate) struct Partitioner {
    /// Block descriptors per channel, indexed in leaf order.
    pub blocks: Vec<Vec<Block>>,
    /// Chosen partitioning tree per channel.
    pub bs_info: Vec<u32>,
    /// Number of blocks laid out per channel.
    pub num_blocks: Vec<usize>,
    /// Channel does not share its tree with its pair partner.
    pub independent_bs: Vec<bool>,
    /// Encoded size of every candidate block, indexed by tree node.
    bs_sizes: Vec<Vec<u32>>,
    /// Candidate sizes when coding from the difference signal.
    js_sizes: Vec<Vec<u32>>,
    /// Chosen difference-coding role per node: 0 none, 1 first channel,
    /// 2 second channel.
    js_infos: Vec<Vec<u8>>,
}

impl Partitioner {
    pub fn new(sconf: &SpecificConfig) -> Self {
        let channels = sconf.channels;
        let pairs = channels.div_ceil(2);
        let num_nodes = (2 << sconf.block_switching) - 1;
        let max_blocks = MAX_BLOCKS.min(1 << sconf.block_switching);
        Self {
            blocks: (0..channels)
                .map(|_| (0..max_blocks).map(|_| Block::new(sconf.max_order)).collect())
                .collect(),
            bs_info: vec![0; channels],
            num_blocks: vec![1; channels],
            independent_bs: vec![true; channels],
            bs_sizes: vec![vec![0; num_nodes]; channels],
            js_sizes: vec![vec![0; num_nodes]; pairs],
            js_infos: vec![vec![0; num_nodes]; pairs],
        }
    }

    /// Evaluates every candidate block of every level for one channel,
    /// filling the node-indexed size tables.
    fn gen_block_sizes(
        &mut self,
        sconf: &SpecificConfig,
        stage: &Stage,
        lanes: &mut Lanes,
        scratch: &mut SearchScratch,
        channel: usize,
        frame_size: usize,
    ) {
        let levels = if sconf.block_switching > 0 {
            sconf.block_switching
        } else {
            0
        };

        let mut full_tree = 0u32;
        for level in 0..=levels {
            let num_blocks = 1usize << level;
            let base = num_blocks - 1;
            let level_tree = full_tree;
            if level < levels {
                for n in base..base + num_blocks {
                    full_tree |= 1 << (30 - n);
                }
            }

            let laid_out = set_blocks(sconf, &mut self.blocks[channel], level_tree, frame_size);
            self.num_blocks[channel] = laid_out;

            for b in 0..num_blocks {
                let node = base + b;
                if b >= laid_out || self.blocks[channel][b].length == 0 {
                    self.bs_sizes[channel][node] = 0;
                    if sconf.joint_stereo && channel & 1 == 0 && channel + 1 < sconf.channels {
                        self.js_sizes[channel >> 1][node] = 0;
                    }
                    continue;
                }

                let size = {
                    let block = &mut self.blocks[channel][b];
                    block.js_block = false;
                    find_block_params(sconf, stage, lanes, scratch, block, channel)
                };
                self.bs_sizes[channel][node] = size;

                if sconf.joint_stereo && channel & 1 == 0 && channel + 1 < sconf.channels {
                    let js_size = {
                        let block = &mut self.blocks[channel][b];
                        block.js_block = true;
                        let size = find_block_params(sconf, stage, lanes, scratch, block, channel);
                        block.js_block = false;
                        size
                    };
                    self.js_sizes[channel >> 1][node] = js_size;
                }
            }
        }
        self.bs_info[channel] = full_tree;
    }

    /// Marks every node where difference coding beats one of the two
    /// independent signals, remembering which channel takes the difference.
    fn gen_js_infos(&mut self, sconf: &SpecificConfig, channel: usize) {
        let pair = channel >> 1;
        let num_nodes = (2 << sconf.block_switching) - 1;
        for node in 0..num_nodes {
            let block_size = self.bs_sizes[channel][node];
            let buddy_size = self.bs_sizes[channel + 1][node];
            let js_size = self.js_sizes[pair][node];
            self.js_infos[pair][node] =
                if js_size > 0 && (js_size < block_size || js_size < buddy_size) {
                    // the larger of the pair is replaced by the difference
                    if block_size > buddy_size {
                        1
                    } else {
                        2
                    }
                } else {
                    0
                };
        }
    }

    /// Swaps difference-signal sizes into the per-channel tables according
    /// to `js_infos`. Calling it twice restores the independent sizes.
    fn swap_js_sizes(&mut self, sconf: &SpecificConfig, channel: usize) {
        let pair = channel >> 1;
        let num_nodes = (2 << sconf.block_switching) - 1;
        for node in 0..num_nodes {
            match self.js_infos[pair][node] {
                1 => std::mem::swap(
                    &mut self.bs_sizes[channel][node],
                    &mut self.js_sizes[pair][node],
                ),
                2 => std::mem::swap(
                    &mut self.bs_sizes[channel + 1][node],
                    &mut self.js_sizes[pair][node],
                ),
                _ => {}
            }
        }
    }

    fn reset_js(&mut self, sconf: &SpecificConfig, channel: usize) {
        self.swap_js_sizes(sconf, channel);
        let pair = channel >> 1;
        self.js_infos[pair].fill(0);
        for block in self.blocks[channel].iter_mut() {
            block.js_block = false;
        }
        for block in self.blocks[channel + 1].iter_mut() {
            block.js_block = false;
        }
    }

    /// Applies the chosen tree's `js_infos` to the laid-out blocks of a
    /// shared-tree pair.
    fn apply_js_flags(&mut self, channel: usize) {
        let pair = channel >> 1;
        let mut leaves = Vec::new();
        collect_leaves(self.bs_info[channel], 0, 0, &mut leaves);
        for (b, &(node, _)) in leaves.iter().enumerate().take(self.num_blocks[channel]) {
            let info = self.js_infos[pair][node];
            self.blocks[channel][b].js_block = info == 1;
            self.blocks[channel + 1][b].js_block = info == 2;
        }
    }

    /// Merges the size tables into the cheapest tree for `c1` (and `c2`
    /// when coding a shared-tree pair), lays out the blocks, and returns
    /// the total bit count of the chosen partition.
    fn get_partition(
        &mut self,
        sconf: &SpecificConfig,
        stage: &Stage,
        c1: usize,
        c2: usize,
        frame_size: usize,
    ) -> u32 {
        let mut bs_info = self.bs_info[c1];
        {
            let sizes2 = (c1 != c2).then(|| self.bs_sizes[c2].as_slice());
            let sizes1 = self.bs_sizes[c1].as_slice();
            match stage.merge_algorithm {
                MergeSearch::BottomUp => merge_bottomup(&mut bs_info, 0, sizes1, sizes2),
                MergeSearch::FullSearch => merge_fullsearch(&mut bs_info, 0, sizes1, sizes2),
            }
        }
        self.bs_info[c1] = bs_info;
        self.num_blocks[c1] = set_blocks(sconf, &mut self.blocks[c1], bs_info, frame_size);
        if c1 != c2 {
            self.bs_info[c2] = bs_info;
            self.num_blocks[c2] = set_blocks(sconf, &mut self.blocks[c2], bs_info, frame_size);
            self.apply_js_flags(c1);
        }

        let mut bit_count = subtree_size(bs_info, 0, &self.bs_sizes[c1]);
        if c1 != c2 {
            bit_count += subtree_size(bs_info, 0, &self.bs_sizes[c2]);
        }
        bit_count
    }

    /// Stage 1: chooses between independent and difference coding for each
    /// channel pair and fills all per-node size tables.
    pub fn select_difference_coding_mode(
        &mut self,
        sconf: &SpecificConfig,
        stage: &Stage,
        lanes: &mut Lanes,
        scratch: &mut SearchScratch,
        frame_size: usize,
        ra_frame: bool,
    ) {
        let channels = sconf.channels;

        let mut c = 0;
        if sconf.joint_stereo {
            while c + 1 < channels {
                self.independent_bs[c] = false;
                self.independent_bs[c + 1] = false;
                c += 2;
            }
        }
        while c < channels {
            self.independent_bs[c] = true;
            c += 1;
        }

        if sconf.joint_stereo {
            // random-access frames never predict into the previous frame
            let history = if ra_frame { 0 } else { lanes.channel_offset };
            let mut c = 0;
            while c + 1 < channels {
                lanes.gen_dif_signal(c, frame_size, history);
                c += 2;
            }
        }

        for c in 0..channels {
            self.gen_block_sizes(sconf, stage, lanes, scratch, c, frame_size);
        }

        if sconf.joint_stereo {
            let mut c = 0;
            while c + 1 < channels {
                self.gen_js_infos(sconf, c);
                c += 2;
            }
        }
    }

    /// Stage 2: finds the best partitioning per channel (or shared-tree
    /// pair) and resolves the independent-versus-joint decision.
    pub fn block_partitioning(
        &mut self,
        sconf: &SpecificConfig,
        stage: &Stage,
        frame_size: usize,
    ) {
        let channels = sconf.channels;
        let bs_info_len = 1u32 << 3.max(sconf.block_switching);

        let mut c = 0;
        while c + 1 < channels {
            if sconf.joint_stereo {
                let full_tree = self.bs_info[c];

                let mut bits_ind = self.get_partition(sconf, stage, c, c, frame_size);
                bits_ind += self.get_partition(sconf, stage, c + 1, c + 1, frame_size);
                let bs_info_c1 = self.bs_info[c];
                let bs_info_c2 = self.bs_info[c + 1];

                self.bs_info[c] = full_tree;
                self.swap_js_sizes(sconf, c);
                let bits_dep = self.get_partition(sconf, stage, c, c + 1, frame_size);

                if bits_ind + bs_info_len < bits_dep {
                    self.reset_js(sconf, c);
                    self.independent_bs[c] = true;
                    self.independent_bs[c + 1] = true;
                    self.bs_info[c] = bs_info_c1;
                    self.bs_info[c + 1] = bs_info_c2;
                    self.num_blocks[c] =
                        set_blocks(sconf, &mut self.blocks[c], bs_info_c1, frame_size);
                    self.num_blocks[c + 1] =
                        set_blocks(sconf, &mut self.blocks[c + 1], bs_info_c2, frame_size);
                }
            } else {
                self.get_partition(sconf, stage, c, c, frame_size);
                self.get_partition(sconf, stage, c + 1, c + 1, frame_size);
            }
            c += 2;
        }
        if c < channels {
            self.get_partition(sconf, stage, c, c, frame_size);
        }
    }
}
