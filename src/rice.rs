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

//! Signed and unsigned Rice codes in the ALS flavor.
//!
//! Quotients are written as zero-terminated unary; signed values fold the
//! sign bit into the LSB before splitting. The remainder mapping of the
//! signed code differs from a plain sign-folded code and must match the
//! decoder's expectation exactly.

use super::bitsink::BitSink;
use super::error::SinkFull;

/// Encodes the sign bit into the LSB (for Rice coding).
///
/// Wraps at the 32-bit boundary; a residual of `i32::MIN` maps onto the
/// same folded value the decoder unfolds.
#[inline]
pub const fn encode_signbit(v: i32) -> u32 {
    let is_negative = if v < 0 { 1 } else { 0 };
    v.unsigned_abs().wrapping_mul(2).wrapping_sub(is_negative)
}

/// Recovers a sign bit from its LSB.
#[inline]
#[allow(dead_code)]
pub const fn decode_signbit(v: u32) -> i32 {
    let is_negative = v % 2 == 1;
    if is_negative {
        -(((v >> 1) + 1) as i32)
    } else {
        (v >> 1) as i32
    }
}

/// Counts bits needed to write `v` using signed Rice coding with param `k`.
#[inline]
pub const fn rice_count(v: i32, k: u32) -> u32 {
    (encode_signbit(v) >> k) + 1 + k
}

/// Counts bits needed to write `v` using unsigned Rice coding with param `k`.
#[inline]
pub const fn urice_count(v: u32, k: u32) -> u32 {
    (v >> k) + 1 + k
}

/// Writes an unsigned Rice code.
///
/// # Errors
///
/// Propagates [`SinkFull`] from the sink.
#[inline]
pub fn write_ur<S: BitSink>(dest: &mut S, v: u32, k: u32) -> Result<(), SinkFull> {
    dest.write_unary(v >> k)?;
    if k > 0 {
        dest.write_lsbs(v & ((1u32 << k) - 1), k as usize)?;
    }
    Ok(())
}

/// Writes a signed Rice code.
///
/// # Errors
///
/// Propagates [`SinkFull`] from the sink.
#[inline]
pub fn write_sr<S: BitSink>(dest: &mut S, v: i32, k: u32) -> Result<(), SinkFull> {
    let v0 = encode_signbit(v);
    let q0 = v0 >> k;
    dest.write_unary(q0)?;
    if k > 0 {
        let carry = u32::from(v0 & 1 == 0);
        let remainder = (v0 >> 1).wrapping_sub(q0.wrapping_sub(carry) << (k - 1));
        dest.write_lsbs(remainder & ((1u32 << k) - 1), k as usize)?;
    }
    Ok(())
}

/// Estimated bit count of `n` sign-folded values with sum `sum` at param `k`.
#[inline]
pub const fn estimate_count(sum: u64, n: usize, k: u32) -> u64 {
    (n as u64 * (k as u64 + 1)) + (sum.saturating_sub(n as u64 >> 1) >> k)
}

/// Estimates the best Rice parameter using the sum of sign-folded samples.
pub fn estimate_param(sum: u64, n: usize, max_param: u32) -> u32 {
    if sum <= (n as u64) >> 1 {
        return 0;
    }

    let mean = ((sum - ((n as u64) >> 1)) / n as u64).max(1);
    let k = 63 - mean.leading_zeros();

    k.min(max_param)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitsink::ByteSink;

    fn encode_bits(v: i32, k: u32) -> String {
        let mut sink = ByteSink::new();
        write_sr(&mut sink, v, k).unwrap();
        let total = sink.bit_length();
        let mut s = String::new();
        for i in 0..total {
            let byte = sink.as_byte_slice()[i / 8];
            s.push(if byte & (0x80 >> (i % 8)) != 0 { '1' } else { '0' });
        }
        s
    }

    #[test]
    fn signbit_folding() {
        assert_eq!(encode_signbit(0), 0);
        assert_eq!(encode_signbit(1), 2);
        assert_eq!(encode_signbit(-1), 1);
        assert_eq!(encode_signbit(-5), 9);
        for v in -1000..1000 {
            assert_eq!(decode_signbit(encode_signbit(v)), v);
        }
    }

    #[test]
    fn count_matches_written_bits() {
        for k in 0..6 {
            for v in -300..300 {
                let mut sink = ByteSink::new();
                write_sr(&mut sink, v, k).unwrap();
                assert_eq!(sink.bit_length() as u32, rice_count(v, k));
            }
            for v in 0..600u32 {
                let mut sink = ByteSink::new();
                write_ur(&mut sink, v, k).unwrap();
                assert_eq!(sink.bit_length() as u32, urice_count(v, k));
            }
        }
    }

    #[test]
    fn signed_code_is_prefix_free() {
        for k in 0..4 {
            let words: Vec<String> = (-64..64).map(|v| encode_bits(v, k)).collect();
            for (i, a) in words.iter().enumerate() {
                for (j, b) in words.iter().enumerate() {
                    if i != j {
                        assert!(!b.starts_with(a.as_str()), "k={k}: {a} prefixes {b}");
                    }
                }
            }
        }
    }

    #[test]
    fn parameter_estimation() {
        // all-zero signal wants parameter zero
        assert_eq!(estimate_param(0, 64, 15), 0);

        // folded sum of n samples around magnitude 2^k wants roughly k
        let n = 256usize;
        for k in 1..12u32 {
            let sum = (n as u64) << k;
            let est = estimate_param(sum, n, 15);
            assert!(
                (i64::from(est) - i64::from(k)).abs() <= 1,
                "k={k} est={est}"
            );
        }

        // clipped at max_param
        assert_eq!(estimate_param(u64::from(u32::MAX) * 2, 4, 15), 15);
    }

    #[test]
    fn estimated_count_tracks_exact_count() {
        let signal: Vec<i32> = (0..128).map(|t| (t * 37 % 61) - 30).collect();
        let sum: u64 = signal.iter().map(|&v| u64::from(encode_signbit(v))).sum();
        for k in 0..6 {
            let exact: u64 = signal.iter().map(|&v| u64::from(rice_count(v, k))).sum();
            let est = estimate_count(sum, signal.len(), k);
            let diff = exact.abs_diff(est);
            // the estimate drops only sub-quotient rounding, so it stays close
            assert!(diff <= signal.len() as u64, "k={k} exact={exact} est={est}");
        }
    }
}
