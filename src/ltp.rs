// Copyright 2023-2024 Google LLC
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

//! Long-term prediction: lag search over a weighted residual signal and
//! 5-tap gain selection, either fixed or from the normal equations.

use super::block::LtpInfo;
use super::constant::LTP_TAPS;
use super::constant::MAX_LTP_LAG;
use super::rice;
use super::tables::LTP_GAIN_VALUES;

/// Number of bits of the `lag` field at a given sampling rate.
#[inline]
pub fn lag_bits(sample_rate: usize) -> u32 {
    8 + u32::from(sample_rate >= 96_000) + u32::from(sample_rate >= 192_000)
}

/// Maps an LTP center-tap gain to the nearest gain-table index.
pub fn map_to_index(gain: i32) -> u32 {
    let mut best_index = 0u32;
    let mut min_diff = (i32::from(LTP_GAIN_VALUES[0][0]) - gain).abs();
    for i in 1..16u32 {
        let v = i32::from(LTP_GAIN_VALUES[(i >> 2) as usize][(i & 3) as usize]);
        let diff = (v - gain).abs();
        if diff == 0 {
            return i;
        } else if diff < min_diff {
            min_diff = diff;
            best_index = i;
        } else {
            return best_index;
        }
    }
    best_index
}

/// Bit count of the LTP side information as emitted by the block writer.
pub fn side_info_bits(info: &LtpInfo, sample_rate: usize) -> u32 {
    1 + lag_bits(sample_rate)
        + rice::rice_count(info.gain[0] >> 3, 1)
        + rice::rice_count(info.gain[1] >> 3, 2)
        + rice::urice_count(map_to_index(info.gain[2]), 2)
        + rice::rice_count(info.gain[3] >> 3, 2)
        + rice::rice_count(info.gain[4] >> 3, 1)
}

/// Weights the working signal for autocorrelation detection.
///
/// `x *= 1 / (sqrt(|x|) / (5 sqrt(mean)) + 1)` with the mean taken over
/// `[-lag_max, len)`. Large excursions are compressed so a strong transient
/// does not mask the periodic structure.
fn weight_signal(cur: &[i32], pos: usize, len: usize, lag_max: usize, corr: &mut [f64]) {
    let mut sum = 0u64;
    for i in pos - lag_max..pos + len {
        sum += u64::from(cur[i].unsigned_abs());
    }
    let mean = sum as f64 / (len + lag_max) as f64;
    let mean_quot = mean.sqrt() * 5.0;

    for i in pos - lag_max - 2..pos + len {
        let x = f64::from(cur[i]);
        corr[i] = x / (x.abs().sqrt() / mean_quot + 1.0);
    }
}

/// Finds the lag with the largest positive normalized autocorrelation.
fn best_lag(corr: &[f64], pos: usize, len: usize, lag_max: usize, start: usize) -> usize {
    let energy = {
        let mut sum = 1.0f64;
        for i in pos..pos + len {
            sum += corr[i] * corr[i];
        }
        sum
    };

    let mut i_max = start;
    let mut autoc_max = f64::NEG_INFINITY;
    for lag in start..lag_max {
        let mut sum = 1.0f64;
        for i in pos + lag..pos + len {
            sum += corr[i] * corr[i - lag];
        }
        let autoc = sum / energy;
        if autoc > 0.0 && autoc > autoc_max {
            autoc_max = autoc;
            i_max = lag;
        }
    }
    i_max
}

/// Solves the 5x5 symmetric system `cov * x = rhs` by Cholesky
/// factorization, ridging the diagonal when the matrix is near-singular.
fn solve_normal_equations(cov: &[[f64; LTP_TAPS]; LTP_TAPS], rhs: &[f64; LTP_TAPS]) -> [f64; LTP_TAPS] {
    let mut ridge = 0.0f64;
    loop {
        let mut l = [[0.0f64; LTP_TAPS]; LTP_TAPS];
        let mut ok = true;
        'decompose: for i in 0..LTP_TAPS {
            for j in 0..=i {
                let mut sum = cov[i][j] + if i == j { ridge } else { 0.0 };
                for t in 0..j {
                    sum -= l[i][t] * l[j][t];
                }
                if i == j {
                    if sum <= 0.0 {
                        ok = false;
                        break 'decompose;
                    }
                    l[i][j] = sum.sqrt();
                } else {
                    l[i][j] = sum / l[j][j];
                }
            }
        }
        if ok {
            let mut y = [0.0f64; LTP_TAPS];
            for i in 0..LTP_TAPS {
                let mut sum = rhs[i];
                for t in 0..i {
                    sum -= l[i][t] * y[t];
                }
                y[i] = sum / l[i][i];
            }
            let mut x = [0.0f64; LTP_TAPS];
            for i in (0..LTP_TAPS).rev() {
                let mut sum = y[i];
                for t in i + 1..LTP_TAPS {
                    sum -= l[t][i] * x[t];
                }
                x[i] = sum / l[i][i];
            }
            return x;
        }
        ridge = if ridge == 0.0 { f64::EPSILON } else { ridge * 10.0 };
        if ridge > 1e12 {
            return [0.0; LTP_TAPS];
        }
    }
}

fn quantize_gains(coeff: &[f64; LTP_TAPS], gain: &mut [i32; LTP_TAPS]) {
    // taps 0, 1, 3, 4: linear quantization to an 8-step grid
    for (icc, g) in gain.iter_mut().enumerate() {
        let q = (coeff[icc] * 16.0).round() as i32;
        *g = if icc & 1 == 1 {
            q.clamp(-8, 7) * 8
        } else {
            q.clamp(-6, 5) * 8
        };
    }

    // tap 2: roughly logarithmic vector quantization
    let quant = (coeff[2] * 256.0).round() as i32;
    gain[2] = 0;
    for i in (1..16usize).rev() {
        let a = i32::from(LTP_GAIN_VALUES[i >> 2][i & 3]);
        let b = i32::from(LTP_GAIN_VALUES[(i - 1) >> 2][(i - 1) & 3]);
        if quant > a + b {
            gain[2] = a;
            return;
        }
    }
}

fn gains_from_cholesky(
    corr: &[f64],
    pos: usize,
    len: usize,
    taumax: usize,
    gain: &mut [i32; LTP_TAPS],
) {
    let mut cov = [[0.0f64; LTP_TAPS]; LTP_TAPS];
    let mut rhs = [0.0f64; LTP_TAPS];

    let lag_base = pos - 2 - taumax;
    for smp in 0..len.saturating_sub(2) {
        for i in 0..LTP_TAPS {
            for j in i..LTP_TAPS {
                cov[i][j] += corr[lag_base + smp + i] * corr[lag_base + smp + j];
            }
        }
        let v = corr[pos + smp];
        for i in 0..LTP_TAPS {
            rhs[i] += v * corr[lag_base + smp + i];
        }
    }
    for i in 0..LTP_TAPS {
        for j in 0..i {
            cov[i][j] = cov[j][i];
        }
    }

    let coeff = solve_normal_equations(&cov, &rhs);
    quantize_gains(&coeff, gain);
}

/// Gain selection strategy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GainEstimation {
    /// The fixed taps `[8, 8, 16, 8, 8]`.
    Fixed,
    /// Solve the 5x5 normal equations of the weighted signal.
    Cholesky,
}

/// Searches lag and gains for one block and fills `info`.
///
/// `cur` is the full channel lane, `pos` the in-lane block start and `len`
/// the block length; `corr` is the weighted-signal scratch sized like the
/// lane.
pub fn find_block_params(
    cur: &[i32],
    pos: usize,
    len: usize,
    opt_order: usize,
    sample_rate: usize,
    algorithm: GainEstimation,
    corr: &mut [f64],
    info: &mut LtpInfo,
) {
    let start = 4.max(opt_order + 1);
    let end = MAX_LTP_LAG.min(len);
    let mut lag =
        256usize << (usize::from(sample_rate >= 96_000) + usize::from(sample_rate >= 192_000));
    if lag + start + 3 > end {
        lag = end.saturating_sub(start + 3);
    }
    let lag_max = (lag + start).min(end).min(pos.saturating_sub(2));

    if len <= start || lag == 0 || lag_max <= start {
        info.gain = [0; LTP_TAPS];
        info.lag = start;
        return;
    }

    weight_signal(cur, pos, len, lag_max, corr);
    info.lag = best_lag(corr, pos, len, lag_max, start);

    match algorithm {
        GainEstimation::Fixed => info.gain = [8, 8, 16, 8, 8],
        GainEstimation::Cholesky => {
            gains_from_cholesky(corr, pos, len, info.lag, &mut info.gain);
        }
    }
}

/// Generates the long-term predicted residual for one block.
///
/// The first `max(lag - 2, 0)` samples are copied verbatim; the filter only
/// reaches samples of the same block, so a random-access block stays
/// decodable without prior context.
pub fn generate_residuals(info: &LtpInfo, cur: &[i32], pos: usize, len: usize, out: &mut [i32]) {
    let lag = info.lag;
    let offset = lag.saturating_sub(2).min(len);

    out[..offset].copy_from_slice(&cur[pos..pos + offset]);

    for n in offset..len {
        let center = n as i64 - lag as i64;
        let begin = (center - 2).max(0);
        let end = center + 3;
        let mut tab = (5 - (end - begin)) as usize;

        let mut y: i64 = 1 << 6;
        let mut base = begin;
        while base < end {
            y += i64::from(info.gain[tab]) * i64::from(cur[pos + base as usize]);
            base += 1;
            tab += 1;
        }
        out[n] = cur[pos + n] - ((y >> 7) as i32);
    }
}
