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

//! Codec-wide constants.

/// Exit code: Invalid config
pub enum ExitCode {
    #[allow(dead_code)]
    Normal = 0,
    InvalidConfig = -1,
}

/// Number of encoding stages (joint-stereo, block-switching, final).
pub const NUM_STAGES: usize = 3;

/// Minimum frame length accepted by `ALSSpecificConfig`.
///
/// A frame length of 1 is reserved for signalling plain PCM elsewhere, so
/// the encoder never produces it.
pub const MIN_FRAME_LENGTH: usize = 2;

/// Maximum frame length (`frame_length - 1` is a 16-bit field).
pub const MAX_FRAME_LENGTH: usize = 65536;

/// Maximum number of blocks a frame can be split into (5 levels).
pub const MAX_BLOCKS: usize = 32;

/// Maximum depth of the block-switching tree.
pub const MAX_BLOCK_SWITCHING: usize = 5;

/// Maximum prediction order storable in the 10-bit `max_order` field.
pub const MAX_PREDICTION_ORDER: usize = 1023;

/// Maximum lag value searched by the long-term predictor.
pub const MAX_LTP_LAG: usize = 2048;

/// Number of taps of the long-term predictor filter.
pub const LTP_TAPS: usize = 5;

/// Maximum Rice parameter for streams with more than 16 bits per sample.
pub const MAX_RICE_PARAM_WIDE: u32 = 31;

/// Maximum Rice parameter for streams with up to 16 bits per sample.
pub const MAX_RICE_PARAM_NARROW: u32 = 15;

/// Maximum distance between random-access frames.
///
/// The field is 8 bits on the wire, but output buffering concerns limit the
/// practical distance the same way the reference implementations do.
pub const MAX_RA_DISTANCE: usize = 7;

/// Maximum number of entropy-coding sub-blocks within one block.
pub const MAX_SUB_BLOCKS: usize = 8;

/// Size in bytes of the fixed-width portion of `ALSSpecificConfig`.
pub const SPECIFIC_CONFIG_SIZE: usize = 30;

/// Number of fractional bits in reconstructed PARCOR and LPC coefficients.
pub const COEF_SHIFT: u32 = 20;

/// MPEG-4 audio object type of ALS.
pub const AOT_ALS: u32 = 36;
