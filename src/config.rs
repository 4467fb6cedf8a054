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

//! Encoder configuration structs.

use serde::Deserialize;
use serde::Serialize;

use super::constant::MAX_BLOCK_SWITCHING;
use super::constant::MAX_FRAME_LENGTH;
use super::constant::MAX_PREDICTION_ORDER;
use super::constant::MAX_RA_DISTANCE;
use super::constant::MAX_RICE_PARAM_NARROW;
use super::constant::MAX_RICE_PARAM_WIDE;
use super::constant::MIN_FRAME_LENGTH;
use super::constant::NUM_STAGES;
use super::error::verify_range;
use super::error::verify_true;
use super::error::Verify;
use super::error::VerifyError;
use super::ltp::GainEstimation;
use super::source::SampleFormat;

/// Configuration for encoder.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Encoder {
    /// Compression level, 0 (fastest) to 2 (densest).
    pub compression_level: usize,
    /// If set, overrides the rate-dependent default frame length.
    pub frame_length: Option<usize>,
    /// Distance between random-access frames; 0 disables random access.
    pub ra_distance: usize,
    /// Where the sizes of random-access units are stored.
    pub ra_flag: RaFlag,
    /// If set, overrides the level's maximum prediction order.
    pub max_order: Option<usize>,
    /// If set, forces BGMC entropy coding on or off.
    pub bgmc: Option<bool>,
}

#[allow(clippy::derivable_impls)]
impl Default for Encoder {
    fn default() -> Self {
        Self {
            compression_level: 1,
            frame_length: None,
            ra_distance: 0,
            ra_flag: RaFlag::None,
            max_order: None,
            bgmc: None,
        }
    }
}

impl Verify for Encoder {
    fn verify(&self) -> Result<(), VerifyError> {
        verify_range!("compression_level", self.compression_level, ..=2)?;
        if let Some(frame_length) = self.frame_length {
            verify_range!(
                "frame_length",
                frame_length,
                MIN_FRAME_LENGTH..=MAX_FRAME_LENGTH
            )?;
        }
        if let Some(max_order) = self.max_order {
            verify_range!("max_order", max_order, ..=MAX_PREDICTION_ORDER)?;
        }
        verify_true!(
            "ra_flag",
            !(self.ra_flag == RaFlag::Frames && self.ra_distance != 1),
            "frame-level ra unit sizes require ra_distance == 1"
        )?;
        verify_true!(
            "ra_flag",
            self.ra_flag != RaFlag::Header,
            "header-stored ra unit sizes are not implemented"
        )?;
        Ok(())
    }
}

/// Where random-access unit sizes are stored in the stream.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RaFlag {
    /// Not stored.
    None = 0,
    /// Stored at the beginning of each random-access frame.
    Frames = 1,
    /// Stored in the stream header.
    Header = 2,
}

/// Immutable per-stream configuration, mirroring `ALSSpecificConfig`.
#[derive(Clone, Debug)]
pub struct SpecificConfig {
    pub sample_rate: usize,
    pub channels: usize,
    /// Total sample count; finalized when the stream is flushed.
    pub samples: u64,
    /// 0: 8-bit, 1: 16-bit, 2: 24-bit, 3: 32-bit.
    pub resolution: u32,
    pub bits_per_raw_sample: u32,
    pub floating: bool,
    pub msb_first: bool,
    pub frame_length: usize,
    pub ra_distance: usize,
    pub ra_flag: RaFlag,
    pub adapt_order: bool,
    pub coef_table: usize,
    pub long_term_prediction: bool,
    pub max_order: usize,
    /// Block-switching depth, 0 (off) to 5.
    pub block_switching: usize,
    pub bgmc: bool,
    pub sb_part: bool,
    pub joint_stereo: bool,
    pub mc_coding: bool,
    pub chan_config: bool,
    pub chan_sort: bool,
    pub crc_enabled: bool,
    pub rlslms: bool,
}

/// Per-level tool selection (the fields `get_specific_config` derives).
struct LevelPreset {
    adapt_order: bool,
    long_term_prediction: bool,
    max_order: usize,
    block_switching: usize,
    bgmc: bool,
    sb_part: bool,
    joint_stereo: bool,
    crc_enabled: bool,
}

const LEVEL_PRESETS: [LevelPreset; 3] = [
    LevelPreset {
        adapt_order: false,
        long_term_prediction: false,
        max_order: 4,
        block_switching: 0,
        bgmc: false,
        sb_part: false,
        joint_stereo: false,
        crc_enabled: false,
    },
    LevelPreset {
        adapt_order: false,
        long_term_prediction: false,
        max_order: 10,
        block_switching: 0,
        bgmc: false,
        sb_part: true,
        joint_stereo: true,
        crc_enabled: true,
    },
    LevelPreset {
        adapt_order: true,
        long_term_prediction: true,
        max_order: 32,
        block_switching: 1,
        bgmc: true,
        sb_part: true,
        joint_stereo: true,
        crc_enabled: true,
    },
];

impl SpecificConfig {
    /// Derives the stream configuration from the encoder options and the
    /// input stream parameters.
    ///
    /// # Errors
    ///
    /// Returns `VerifyError` when the options are inconsistent.
    pub fn from_options(
        options: &Encoder,
        sample_format: SampleFormat,
        bits_per_raw_sample: Option<u32>,
        sample_rate: usize,
        channels: usize,
    ) -> Result<Self, VerifyError> {
        options.verify()?;
        verify_range!("channels", channels, 1..=65536)?;
        verify_range!("sample_rate", sample_rate, 1..=0xFFFF_FFFFusize)?;

        let preset = &LEVEL_PRESETS[options.compression_level];

        let resolution = match sample_format {
            SampleFormat::U8 => 0,
            SampleFormat::S16 => 1,
            SampleFormat::S32 => {
                if bits_per_raw_sample.unwrap_or(32) <= 24 {
                    2
                } else {
                    3
                }
            }
        };
        let bits_per_raw_sample = bits_per_raw_sample.unwrap_or((resolution + 1) * 8);
        verify_range!(
            "bits_per_raw_sample",
            bits_per_raw_sample,
            1..=(sample_format.container_bits())
        )?;

        let mut frame_length = options.frame_length.unwrap_or_else(|| {
            let base = if sample_rate <= 24_000 {
                1024
            } else if sample_rate <= 48_000 {
                2048
            } else if sample_rate <= 96_000 {
                4096
            } else {
                8192
            };
            // longer frames give block switching room to subdivide
            base << (preset.block_switching >> 1)
        });
        frame_length = frame_length.clamp(MIN_FRAME_LENGTH, MAX_FRAME_LENGTH);

        // limit the switching depth so every level divides the frame evenly
        let mut block_switching = preset.block_switching.min(MAX_BLOCK_SWITCHING);
        while block_switching > 0 && frame_length % (1 << block_switching) != 0 {
            block_switching -= 1;
        }

        let max_order = options
            .max_order
            .unwrap_or(preset.max_order)
            .min(MAX_PREDICTION_ORDER);

        Ok(Self {
            sample_rate,
            channels,
            samples: 0,
            resolution,
            bits_per_raw_sample,
            floating: false,
            msb_first: false,
            frame_length,
            ra_distance: options.ra_distance.min(MAX_RA_DISTANCE),
            ra_flag: options.ra_flag,
            adapt_order: preset.adapt_order,
            coef_table: usize::from(sample_rate > 48_000) + usize::from(sample_rate > 96_000),
            long_term_prediction: preset.long_term_prediction,
            max_order,
            block_switching,
            bgmc: options.bgmc.unwrap_or(preset.bgmc),
            sb_part: preset.sb_part,
            joint_stereo: preset.joint_stereo && channels >= 2,
            mc_coding: false,
            chan_config: false,
            chan_sort: false,
            crc_enabled: preset.crc_enabled,
            rlslms: false,
        })
    }

    /// Largest Rice parameter usable for residuals at this resolution.
    pub const fn max_rice_param(&self) -> u32 {
        if self.resolution > 1 {
            MAX_RICE_PARAM_WIDE
        } else {
            MAX_RICE_PARAM_NARROW
        }
    }

    /// Number of samples each channel keeps as history, rounded for lanes.
    pub fn history_len(&self) -> usize {
        if self.long_term_prediction {
            self.max_order.max(super::constant::MAX_LTP_LAG)
        } else {
            self.max_order
        }
    }
}

/// Algorithm choosing the entropy-coding sub-block partitioning.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubdivisionSearch {
    RiceEstimate,
    RiceExact,
    BgmcExact,
}

/// Algorithm choosing the per-sub-block entropy parameters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParamSearch {
    RiceEstimate,
    RiceExact,
    BgmcEstimate,
    BgmcExact,
}

/// How bit counts returned by searches are obtained.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BitCount {
    Estimate,
    Exact,
}

/// Adaptive prediction-order search strategy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OrderSearch {
    /// Stop when the bit count has risen for a while.
    ValleyDetect,
    /// Evaluate every order.
    Full,
}

/// Block-partition merge strategy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MergeSearch {
    BottomUp,
    FullSearch,
}

/// Grouped encoding algorithms and options of one search stage.
#[derive(Clone, Copy, Debug)]
pub struct Stage {
    /// Check for constant sample values during this stage.
    pub check_constant: bool,
    /// Check for shared zero LSBs during this stage.
    pub check_lsbs: bool,
    /// Use the adaptive order search during this stage.
    pub adapt_order: bool,
    /// Maximum prediction order to use during this stage.
    pub max_order: usize,
    /// Try entropy-coder sub-block partitioning during this stage.
    pub sb_part: bool,
    pub ecsub_algorithm: SubdivisionSearch,
    pub param_algorithm: ParamSearch,
    pub count_algorithm: BitCount,
    pub adapt_search_algorithm: OrderSearch,
    pub adapt_count_algorithm: BitCount,
    pub ltp_coeff_algorithm: GainEstimation,
    pub merge_algorithm: MergeSearch,
}

/// Index of the joint-stereo search stage.
pub const STAGE_JOINT_STEREO: usize = 0;
/// Index of the block-switching search stage.
pub const STAGE_BLOCK_SWITCHING: usize = 1;
/// Index of the final parameter refinement stage.
pub const STAGE_FINAL: usize = 2;

fn stage_preset(level: usize, stage: usize) -> Stage {
    let fast = Stage {
        check_constant: false,
        check_lsbs: false,
        adapt_order: false,
        max_order: 0,
        sb_part: false,
        ecsub_algorithm: SubdivisionSearch::RiceEstimate,
        param_algorithm: ParamSearch::RiceEstimate,
        count_algorithm: BitCount::Estimate,
        adapt_search_algorithm: OrderSearch::ValleyDetect,
        adapt_count_algorithm: BitCount::Estimate,
        ltp_coeff_algorithm: GainEstimation::Fixed,
        merge_algorithm: MergeSearch::BottomUp,
    };
    match (level, stage) {
        (0, STAGE_BLOCK_SWITCHING) => Stage {
            max_order: 4,
            ..fast
        },
        (0, _) => fast,
        (1, STAGE_JOINT_STEREO) => Stage {
            check_constant: true,
            check_lsbs: true,
            max_order: 5,
            count_algorithm: BitCount::Exact,
            merge_algorithm: MergeSearch::FullSearch,
            ..fast
        },
        (1, _) => Stage {
            check_constant: true,
            check_lsbs: true,
            ecsub_algorithm: SubdivisionSearch::RiceExact,
            param_algorithm: ParamSearch::RiceExact,
            count_algorithm: BitCount::Exact,
            merge_algorithm: MergeSearch::FullSearch,
            ..fast
        },
        _ => Stage {
            check_constant: true,
            check_lsbs: true,
            ecsub_algorithm: SubdivisionSearch::BgmcExact,
            param_algorithm: ParamSearch::BgmcEstimate,
            count_algorithm: BitCount::Exact,
            ltp_coeff_algorithm: GainEstimation::Cholesky,
            merge_algorithm: MergeSearch::FullSearch,
            ..fast
        },
    }
}

/// Builds the per-stage options for a stream, applying the config-derived
/// overrides the same way for every level.
pub fn build_stages(sconf: &SpecificConfig, level: usize) -> [Stage; NUM_STAGES] {
    let mut stages = [
        stage_preset(level, STAGE_JOINT_STEREO),
        stage_preset(level, STAGE_BLOCK_SWITCHING),
        stage_preset(level, STAGE_FINAL),
    ];

    for stage in &mut stages {
        stage.adapt_order = sconf.adapt_order;
        stage.sb_part = sconf.sb_part;
    }

    // early stages may cap the search order to stay cheap
    if level > 1 {
        stages[STAGE_JOINT_STEREO].max_order = sconf.max_order;
    } else {
        stages[STAGE_JOINT_STEREO].max_order =
            sconf.max_order.min(stages[STAGE_JOINT_STEREO].max_order);
    }
    if level > 0 {
        stages[STAGE_BLOCK_SWITCHING].max_order = sconf.max_order;
    } else {
        stages[STAGE_BLOCK_SWITCHING].max_order = sconf
            .max_order
            .min(stages[STAGE_BLOCK_SWITCHING].max_order);
    }
    stages[STAGE_FINAL].max_order = sconf.max_order;

    // BGMC forced on a level that never searches BGMC parameters
    if sconf.bgmc && level < 2 {
        stages[STAGE_FINAL].ecsub_algorithm = SubdivisionSearch::RiceEstimate;
        stages[STAGE_FINAL].param_algorithm = ParamSearch::BgmcEstimate;
    }

    stages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization() {
        let config = Encoder::default();
        assert!(toml::to_string(&config).is_ok());
    }

    #[test]
    fn deserialization() {
        let src = "
compression_level = 2
ra_distance = 3
";
        let config: Encoder = toml::from_str(src).expect("Parse error.");
        assert_eq!(config.compression_level, 2);
        assert_eq!(config.ra_distance, 3);

        // the rest stays default
        assert_eq!(config.frame_length, None);
        assert_eq!(config.ra_flag, RaFlag::None);
    }

    #[test]
    fn if_empty_source_yields_default_config() {
        let empty_src = "";
        let config: Encoder = toml::from_str(empty_src).expect("Parse error.");
        let default_config: Encoder = Encoder::default();
        assert_eq!(
            toml::to_string(&config).unwrap(),
            toml::to_string(&default_config).unwrap()
        );
    }

    #[test]
    fn config_verification() {
        let mut config = Encoder {
            compression_level: 3,
            ..Encoder::default()
        };
        assert!(config.verify().is_err());
        config.compression_level = 2;
        assert!(config.verify().is_ok());
        config.frame_length = Some(1);
        assert!(config.verify().is_err());
        config.frame_length = Some(4096);
        config.ra_flag = RaFlag::Frames;
        config.ra_distance = 3;
        assert!(config.verify().is_err());
        config.ra_distance = 1;
        assert!(config.verify().is_ok());
        config.ra_flag = RaFlag::Header;
        assert!(config.verify().is_err());
    }

    #[test]
    fn level_defaults() {
        let sconf = SpecificConfig::from_options(
            &Encoder::default(),
            SampleFormat::S16,
            None,
            44_100,
            2,
        )
        .unwrap();
        assert_eq!(sconf.resolution, 1);
        assert_eq!(sconf.bits_per_raw_sample, 16);
        assert_eq!(sconf.max_order, 10);
        assert!(sconf.joint_stereo);
        assert!(sconf.crc_enabled);
        assert!(!sconf.bgmc);
        assert_eq!(sconf.frame_length, 2048);
        assert_eq!(sconf.coef_table, 0);
        assert_eq!(sconf.max_rice_param(), 15);
    }

    #[test]
    fn level_two_tools() {
        let options = Encoder {
            compression_level: 2,
            ..Encoder::default()
        };
        let sconf =
            SpecificConfig::from_options(&options, SampleFormat::S32, Some(24), 96_000, 1)
                .unwrap();
        assert_eq!(sconf.resolution, 2);
        assert!(sconf.adapt_order);
        assert!(sconf.long_term_prediction);
        assert!(sconf.bgmc);
        assert_eq!(sconf.block_switching, 1);
        assert_eq!(sconf.coef_table, 1);
        assert_eq!(sconf.max_rice_param(), 31);
        // joint stereo needs a channel pair
        assert!(!sconf.joint_stereo);
        assert_eq!(sconf.history_len(), 2048);
    }

    #[test]
    fn block_switching_divides_frame() {
        let options = Encoder {
            compression_level: 2,
            frame_length: Some(4098),
            ..Encoder::default()
        };
        let sconf =
            SpecificConfig::from_options(&options, SampleFormat::S16, None, 48_000, 2).unwrap();
        // 4098 = 2 * 3 * 683: only one halving divides evenly
        assert_eq!(sconf.block_switching, 1);
    }

    #[test]
    fn stage_overrides() {
        let options = Encoder {
            compression_level: 1,
            max_order: Some(20),
            ..Encoder::default()
        };
        let sconf =
            SpecificConfig::from_options(&options, SampleFormat::S16, None, 48_000, 2).unwrap();
        let stages = build_stages(&sconf, 1);
        assert_eq!(stages[STAGE_JOINT_STEREO].max_order, 5);
        assert_eq!(stages[STAGE_BLOCK_SWITCHING].max_order, 20);
        assert_eq!(stages[STAGE_FINAL].max_order, 20);
        assert!(stages[STAGE_FINAL].sb_part);
    }

    #[test]
    fn forced_bgmc_downgrades_search() {
        let options = Encoder {
            compression_level: 1,
            bgmc: Some(true),
            ..Encoder::default()
        };
        let sconf =
            SpecificConfig::from_options(&options, SampleFormat::S16, None, 48_000, 2).unwrap();
        assert!(sconf.bgmc);
        let stages = build_stages(&sconf, 1);
        assert_eq!(
            stages[STAGE_FINAL].param_algorithm,
            ParamSearch::BgmcEstimate
        );
        assert_eq!(
            stages[STAGE_FINAL].ecsub_algorithm,
            SubdivisionSearch::RiceEstimate
        );
    }
}
