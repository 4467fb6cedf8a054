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

//! Block Gilbert-Moore coding (BGMC).
//!
//! Residuals are split at bit position `k` into MSBs and LSBs. MSBs are
//! driven through an arithmetic coder whose cumulative-frequency rows are
//! selected by the sub-parameter `sx` and subsampled by `delta`; MSBs
//! outside the coarse alphabet escape through the outermost intervals and
//! re-send their remainder as a signed Rice code in the LSB pass.

use super::bitsink::BitSink;
use super::error::SinkFull;
use super::rice;
use super::tables::bgmc_cf_row;
use super::tables::BGMC_MAX;

const FREQ_BITS: u32 = 14;
const VALUE_BITS: u32 = 18;
const TOP_VALUE: u32 = (1 << VALUE_BITS) - 1;
const FIRST_QTR: u32 = TOP_VALUE / 4 + 1;
const HALF: u32 = 2 * FIRST_QTR;
const THIRD_QTR: u32 = 3 * FIRST_QTR;

/// Ceiling of the base-2 logarithm, with `ceil_log2(1) == 0`.
#[inline]
pub const fn ceil_log2(x: usize) -> u32 {
    if x <= 1 {
        0
    } else {
        usize::BITS - (x - 1).leading_zeros()
    }
}

/// Derived per-sub-block coding parameters of the MSB/LSB split.
#[derive(Clone, Copy, Debug, Default)]
pub struct CoarseParams {
    /// LSB width; residuals are split at this bit position.
    pub k: u32,
    /// Subsampling shift into the cumulative-frequency row.
    pub delta: u32,
    /// Number of in-range coarse MSB symbols, `BGMC_MAX[sx] >> delta`.
    pub max: u32,
}

/// Computes the MSB/LSB split for Rice parameter `s`, sub-parameter `sx`
/// and the surrounding block length.
pub fn coarse_params(s: u32, sx: u32, block_length: usize) -> CoarseParams {
    let b = ((ceil_log2(block_length).saturating_sub(3)) >> 1).min(5);
    let k = s.saturating_sub(b);
    let delta = 5 - (s - k);
    let max = u32::from(BGMC_MAX[sx as usize]) >> delta;
    CoarseParams { k, delta, max }
}

/// Arithmetic coder state for one frame-level MSB pass.
///
/// The coder is initialized once per block, streams the MSBs of all
/// sub-blocks, and is flushed before the LSB pass starts.
#[derive(Clone, Debug)]
pub struct MsbEncoder {
    low: u32,
    high: u32,
    follow: u32,
}

impl Default for MsbEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl MsbEncoder {
    pub const fn new() -> Self {
        Self {
            low: 0,
            high: TOP_VALUE,
            follow: 0,
        }
    }

    #[inline]
    fn put_bit_and_follow<S: BitSink>(&mut self, dest: &mut S, bit: u32) -> Result<(), SinkFull> {
        dest.write_lsbs(bit, 1)?;
        while self.follow > 0 {
            dest.write_lsbs(bit ^ 1, 1)?;
            self.follow -= 1;
        }
        Ok(())
    }

    /// Narrows the code range to the interval `[cf_lo, cf_hi)` counts out
    /// of `1 << FREQ_BITS`, emitting settled bits.
    fn encode_interval<S: BitSink>(
        &mut self,
        dest: &mut S,
        cf_hi: u32,
        cf_lo: u32,
    ) -> Result<(), SinkFull> {
        debug_assert!(cf_hi > cf_lo);
        let range = u64::from(self.high - self.low) + 1;
        self.high = self.low + ((range * u64::from(cf_hi)) >> FREQ_BITS) as u32 - 1;
        self.low += ((range * u64::from(cf_lo)) >> FREQ_BITS) as u32;

        loop {
            if self.high < HALF {
                self.put_bit_and_follow(dest, 0)?;
            } else if self.low >= HALF {
                self.put_bit_and_follow(dest, 1)?;
                self.low -= HALF;
                self.high -= HALF;
            } else if self.low >= FIRST_QTR && self.high < THIRD_QTR {
                self.follow += 1;
                self.low -= FIRST_QTR;
                self.high -= FIRST_QTR;
            } else {
                break;
            }
            self.low <<= 1;
            self.high = (self.high << 1) + 1;
        }
        Ok(())
    }

    /// Encodes the MSB halves of `residuals` for one sub-block.
    ///
    /// # Errors
    ///
    /// Propagates [`SinkFull`] from the sink.
    pub fn encode_msbs<S: BitSink>(
        &mut self,
        dest: &mut S,
        residuals: &[i32],
        params: CoarseParams,
        sx: u32,
    ) -> Result<(), SinkFull> {
        let cf = bgmc_cf_row(sx as usize);
        let len = cf.len();
        let abs_max = ((params.max + 1) >> 1) as i32;
        let delta = params.delta as usize;

        for &res in residuals {
            let msb = res >> params.k;
            let (hi, lo) = if msb <= -abs_max {
                (cf[0], cf[2])
            } else if msb >= abs_max {
                (cf[len - 3], cf[len - 1])
            } else {
                let j = (msb + abs_max - 1) as usize;
                (cf[2 + (j << delta)], cf[2 + ((j + 1) << delta)])
            };
            self.encode_interval(dest, u32::from(hi), u32::from(lo))?;
        }
        Ok(())
    }

    /// Flushes the coder, disambiguating the final interval.
    ///
    /// # Errors
    ///
    /// Propagates [`SinkFull`] from the sink.
    pub fn finish<S: BitSink>(mut self, dest: &mut S) -> Result<(), SinkFull> {
        self.follow += 1;
        let bit = u32::from(self.low >= FIRST_QTR);
        self.put_bit_and_follow(dest, bit)
    }
}

/// Encodes the LSB halves (and escape remainders) of `residuals`.
///
/// In-range residuals contribute their `k` low bits verbatim; escaped
/// residuals are shifted back towards zero by the escape offset and
/// re-sent as a signed Rice code with parameter `s`.
///
/// # Errors
///
/// Propagates [`SinkFull`] from the sink.
pub fn write_lsbs<S: BitSink>(
    dest: &mut S,
    residuals: &[i32],
    params: CoarseParams,
    s: u32,
) -> Result<(), SinkFull> {
    let k = params.k;
    let lsb_mask = (1i32 << k) - 1;
    let abs_max = ((params.max + 1) >> 1) as i32;
    let high_offset = -(abs_max << k);
    let low_offset = (abs_max - 1) << k;

    for &res in residuals {
        let msb = res >> k;
        if msb >= abs_max || msb <= -abs_max {
            let adjusted = res + if msb >= abs_max { high_offset } else { low_offset };
            rice::write_sr(dest, adjusted, s)?;
        } else if k > 0 {
            dest.write_lsbs((res & lsb_mask) as u32, k as usize)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitsink::BitCounter;
    use crate::bitsink::ByteSink;

    /// Arithmetic decoder mirroring `MsbEncoder`, for round-trip tests.
    struct MsbDecoder<'a> {
        bytes: &'a [u8],
        bitpos: usize,
        low: u32,
        high: u32,
        value: u32,
    }

    impl<'a> MsbDecoder<'a> {
        fn new(bytes: &'a [u8]) -> Self {
            let mut dec = Self {
                bytes,
                bitpos: 0,
                low: 0,
                high: TOP_VALUE,
                value: 0,
            };
            for _ in 0..VALUE_BITS {
                dec.value = (dec.value << 1) | dec.next_bit();
            }
            dec
        }

        fn next_bit(&mut self) -> u32 {
            let bit = self
                .bytes
                .get(self.bitpos / 8)
                .map_or(0, |b| u32::from(b >> (7 - self.bitpos % 8)) & 1);
            self.bitpos += 1;
            bit
        }

        /// Decodes one coarse symbol; returns the decoded MSB value or the
        /// escape sides as `i32::MIN` / `i32::MAX`.
        fn decode_msb(&mut self, params: CoarseParams, sx: u32) -> i32 {
            let cf = bgmc_cf_row(sx as usize);
            let len = cf.len();
            let abs_max = ((params.max + 1) >> 1) as i32;
            let delta = params.delta as usize;

            let range = u64::from(self.high - self.low) + 1;
            let target =
                (((u64::from(self.value - self.low) + 1) << FREQ_BITS) - 1) / range;
            let target = target as u32;

            // resolve the interval: low tail, subsampled central, high tail
            let (ret, hi, lo) = if target < u32::from(cf[len - 3]) {
                (i32::MAX, cf[len - 3], cf[len - 1])
            } else if target >= u32::from(cf[2]) {
                (i32::MIN, cf[0], cf[2])
            } else {
                let mut j = 0usize;
                while u32::from(cf[2 + ((j + 1) << delta)]) > target {
                    j += 1;
                }
                (
                    j as i32 + 1 - abs_max,
                    cf[2 + (j << delta)],
                    cf[2 + ((j + 1) << delta)],
                )
            };

            let range = u64::from(self.high - self.low) + 1;
            self.high = self.low + ((range * u64::from(hi)) >> FREQ_BITS) as u32 - 1;
            self.low += ((range * u64::from(lo)) >> FREQ_BITS) as u32;
            loop {
                if self.high < HALF {
                    // nothing
                } else if self.low >= HALF {
                    self.low -= HALF;
                    self.high -= HALF;
                    self.value -= HALF;
                } else if self.low >= FIRST_QTR && self.high < THIRD_QTR {
                    self.low -= FIRST_QTR;
                    self.high -= FIRST_QTR;
                    self.value -= FIRST_QTR;
                } else {
                    break;
                }
                self.low <<= 1;
                self.high = (self.high << 1) + 1;
                self.value = (self.value << 1) | self.next_bit();
            }
            ret
        }
    }

    #[test]
    fn ceil_log2_values() {
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(4), 2);
        assert_eq!(ceil_log2(4096), 12);
        assert_eq!(ceil_log2(4097), 13);
    }

    #[test]
    fn coarse_params_derivation() {
        // block of 4096: b = clip((12 - 3) >> 1, 0, 5) = 4
        let p = coarse_params(6, 0, 4096);
        assert_eq!(p.k, 2);
        assert_eq!(p.delta, 1);
        assert_eq!(p.max, u32::from(BGMC_MAX[0]) >> 1);

        // s below b: no LSB split
        let p = coarse_params(2, 11, 4096);
        assert_eq!(p.k, 0);
        assert_eq!(p.delta, 3);

        // delta never exceeds 5
        for s in 0..32 {
            for len in [16usize, 256, 4096, 65536] {
                let p = coarse_params(s, 15, len);
                assert!(p.delta <= 5);
                assert!(p.max >= 3);
            }
        }
    }

    #[test]
    fn msb_roundtrip() {
        for sx in [0u32, 5, 13] {
            for delta in [0u32, 2, 5] {
                let params = CoarseParams {
                    k: 0,
                    delta,
                    max: u32::from(BGMC_MAX[sx as usize]) >> delta,
                };
                let abs_max = ((params.max + 1) >> 1) as i32;
                let msbs: Vec<i32> = (-200..200)
                    .map(|t: i32| (t * 7 + 3) % abs_max.max(2))
                    .collect();

                let mut sink = ByteSink::new();
                let mut enc = MsbEncoder::new();
                enc.encode_msbs(&mut sink, &msbs, params, sx).unwrap();
                enc.finish(&mut sink).unwrap();
                sink.align_to_byte().unwrap();

                let mut dec = MsbDecoder::new(sink.as_byte_slice());
                for &expected in &msbs {
                    assert_eq!(
                        dec.decode_msb(params, sx),
                        expected,
                        "sx={sx} delta={delta}"
                    );
                }
            }
        }
    }

    #[test]
    fn escapes_roundtrip_through_tails() {
        let sx = 3u32;
        let params = coarse_params(8, sx, 1024);
        let abs_max = ((params.max + 1) >> 1) as i32;
        let msbs = [0, abs_max, -abs_max, abs_max + 17, -abs_max - 9, 1];

        let mut sink = ByteSink::new();
        let mut enc = MsbEncoder::new();
        let residuals: Vec<i32> = msbs.iter().map(|&m| m << params.k).collect();
        enc.encode_msbs(&mut sink, &residuals, params, sx).unwrap();
        enc.finish(&mut sink).unwrap();
        sink.align_to_byte().unwrap();

        let mut dec = MsbDecoder::new(sink.as_byte_slice());
        for &m in &msbs {
            let got = dec.decode_msb(params, sx);
            if m >= abs_max {
                assert_eq!(got, i32::MAX);
            } else if m <= -abs_max {
                assert_eq!(got, i32::MIN);
            } else {
                assert_eq!(got, m);
            }
        }
    }

    #[test]
    fn counter_agrees_with_sink() {
        let params = coarse_params(7, 9, 256);
        let residuals: Vec<i32> = (0..256).map(|t: i32| (t * 31 % 257) - 128).collect();

        let mut sink = ByteSink::new();
        let mut enc = MsbEncoder::new();
        enc.encode_msbs(&mut sink, &residuals, params, 9).unwrap();
        enc.finish(&mut sink).unwrap();
        write_lsbs(&mut sink, &residuals, params, 7).unwrap();

        let mut counter = BitCounter::new();
        let mut enc = MsbEncoder::new();
        enc.encode_msbs(&mut counter, &residuals, params, 9).unwrap();
        enc.finish(&mut counter).unwrap();
        write_lsbs(&mut counter, &residuals, params, 7).unwrap();

        assert_eq!(sink.bit_length(), counter.bit_length());
    }

    #[test]
    fn lsb_pass_width() {
        let params = CoarseParams {
            k: 3,
            delta: 2,
            max: 31,
        };
        // all in range: exactly k bits each
        let residuals = [0i32, 7, -8, 5, -1];
        let mut sink = ByteSink::new();
        write_lsbs(&mut sink, &residuals, params, 4).unwrap();
        assert_eq!(sink.bit_length(), residuals.len() * 3);
    }
}
