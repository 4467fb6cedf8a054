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

//! Short-term prediction: analysis windows, autocorrelation, PARCOR
//! (reflection) coefficients, quantization, and residual generation.

use serde::Deserialize;
use serde::Serialize;

use super::constant::COEF_SHIFT;
use super::rice;
use super::tables::PARCOR_RICE_TABLE;
use super::tables::PARCOR_SCALED_VALUES;

/// Analysis window applied before autocorrelation.
///
/// Both windows taper `1/param` of the block at each end and stay flat in
/// between; the sine flank is used for sampling rates up to 48 kHz and the
/// Hann flank above.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Window {
    SineRect { param: f64 },
    HannRect { param: f64 },
}

impl Default for Window {
    fn default() -> Self {
        Self::SineRect { param: 4.0 }
    }
}

impl Window {
    /// Computes the window weights for a block of `len` samples.
    pub fn weights(&self, len: usize) -> Vec<f64> {
        let (param, hann) = match *self {
            Self::SineRect { param } => (param, false),
            Self::HannRect { param } => (param, true),
        };
        let taper = ((len as f64 / param).round() as usize).min(len / 2);
        let mut ret = vec![1.0f64; len];
        for t in 0..taper {
            let x = (t + 1) as f64 / (taper + 1) as f64;
            let w = if hann {
                0.5 * (1.0 - (std::f64::consts::PI * x).cos())
            } else {
                (0.5 * std::f64::consts::PI * x).sin()
            };
            ret[t] = w;
            ret[len - 1 - t] = w;
        }
        ret
    }
}

/// Multiplies `signal` by `window` into `dest` (f64), zero-padding when the
/// block is shorter than the window.
pub fn apply_window(signal: &[i32], window: &[f64], dest: &mut [f64]) {
    debug_assert!(dest.len() >= signal.len());
    for (t, p) in dest.iter_mut().enumerate() {
        *p = if t < signal.len() {
            f64::from(signal[t]) * window.get(t).copied().unwrap_or(0.0)
        } else {
            0.0
        };
    }
}

/// Computes autocorrelation coefficients for lags `0..=max_order`.
pub fn auto_correlation(signal: &[f64], max_order: usize, dest: &mut [f64]) {
    debug_assert!(dest.len() > max_order);
    for (lag, p) in dest.iter_mut().enumerate().take(max_order + 1) {
        let mut sum = 0.0f64;
        for i in lag..signal.len() {
            sum += signal[i] * signal[i - lag];
        }
        *p = sum;
    }
}

/// Computes PARCOR (reflection) coefficients from autocorrelation, along
/// with the prediction error after each order.
///
/// This is the generator-polynomial form of the Levinson-Durbin recursion;
/// `error[i]` holds the residual energy of the order-`i + 1` predictor and
/// drives both the valley-detect order search and the bit estimate.
pub fn compute_ref_coefs(autoc: &[f64], max_order: usize, ref_coefs: &mut [f64], error: &mut [f64]) {
    debug_assert!(autoc.len() > max_order);

    let mut gen0 = vec![0.0f64; max_order];
    let mut gen1 = vec![0.0f64; max_order];
    for i in 0..max_order {
        gen0[i] = autoc[i + 1];
        gen1[i] = autoc[i + 1];
    }

    let mut err = autoc[0];
    for i in 0..max_order {
        if i > 0 {
            for j in 0..max_order - i {
                gen1[j] = gen1[j + 1] + ref_coefs[i - 1] * gen0[j];
                gen0[j] = gen1[j + 1] * ref_coefs[i - 1] + gen0[j];
            }
        }
        ref_coefs[i] = -gen1[0] / if err == 0.0 { 1.0 } else { err };
        err += gen1[0] * ref_coefs[i];
        error[i] = err;
    }
}

/// Quantizes and rescales a single PARCOR coefficient.
///
/// Returns the 7-bit quantized coefficient, the 21-bit reconstruction, and
/// the number of bits its Rice code takes with the given `coef_table`.
pub fn quantize_parcor(parcor: f64, index: usize, coef_table: usize) -> (i32, i32, u32) {
    let sign = if index == 0 { 1 } else { -1 };

    // compand coefficient for index 0 or 1
    let companded = if index < 2 {
        (2.0 * (f64::from(sign) * parcor + 1.0)).sqrt() - 1.0
    } else {
        parcor
    };

    let q = ((64.0 * companded).floor() as i32).clamp(-64, 63);

    let r = if index < 2 {
        sign * 32 * PARCOR_SCALED_VALUES[(q + 64) as usize]
    } else {
        (q << 14) + (1 << 13)
    };

    (q, r, parcor_rice_count(q, index, coef_table))
}

/// Counts the bits of the Rice code of quantized coefficient `q` at `index`.
pub fn parcor_rice_count(q: i32, index: usize, coef_table: usize) -> u32 {
    let (offset, rice_param) = parcor_rice_spec(index, coef_table);
    rice::rice_count(q - offset, rice_param)
}

/// Returns `(offset, rice_param)` for a coefficient index.
pub fn parcor_rice_spec(index: usize, coef_table: usize) -> (i32, u32) {
    if index < 20 {
        PARCOR_RICE_TABLE[coef_table][index]
    } else if index < 127 {
        ((index & 1) as i32, 2)
    } else {
        (0, 1)
    }
}

/// Error signalling 32-bit overflow during PARCOR to LPC conversion.
///
/// The caller recovers by falling back to a first-order predictor; this is
/// part of the codec contract, not an optimization.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CoefOverflow;

/// Extends direct-form LPC coefficients `cof[0..k]` by the reflection
/// coefficient `par[k]`, in 20-bit fractional fixed point.
///
/// # Errors
///
/// Returns [`CoefOverflow`] when an intermediate exceeds the signed 32-bit
/// range. Intermediates are held in 64 bits so the check is exact.
pub fn parcor_to_lpc(k: usize, par: &[i32], cof: &mut [i32]) -> Result<(), CoefOverflow> {
    const ROUND: i64 = 1 << (COEF_SHIFT - 1);

    let mut i = 0usize;
    let mut j = k.wrapping_sub(1);
    while i < j && j < par.len() {
        let tmp1 =
            i64::from(cof[i]) + ((i64::from(par[k]) * i64::from(cof[j]) + ROUND) >> COEF_SHIFT);
        if tmp1 > i64::from(i32::MAX) || tmp1 < i64::from(i32::MIN) {
            return Err(CoefOverflow);
        }
        let tmp2 =
            i64::from(cof[j]) + ((i64::from(par[k]) * i64::from(cof[i]) + ROUND) >> COEF_SHIFT);
        if tmp2 > i64::from(i32::MAX) || tmp2 < i64::from(i32::MIN) {
            return Err(CoefOverflow);
        }
        cof[j] = tmp2 as i32;
        cof[i] = tmp1 as i32;
        i += 1;
        j -= 1;
    }
    if i == j && k > 0 {
        let tmp1 =
            i64::from(cof[i]) + ((i64::from(par[k]) * i64::from(cof[j]) + ROUND) >> COEF_SHIFT);
        if tmp1 > i64::from(i32::MAX) || tmp1 < i64::from(i32::MIN) {
            return Err(CoefOverflow);
        }
        cof[i] = tmp1 as i32;
    }

    cof[k] = par[k];

    Ok(())
}

#[inline]
fn predict(lpc: &[i32], lane: &[i32], pos: usize, order: usize) -> i32 {
    let mut y: i64 = 1 << (COEF_SHIFT - 1);
    for j in 1..=order {
        y += i64::from(lpc[j - 1]) * i64::from(lane[pos - j]);
    }
    (y >> COEF_SHIFT) as i32
}

/// Generates the short-term prediction residual for one block.
///
/// `lane[start..start + len]` is the block; samples before `start` are the
/// history the predictor may reach into. `r_parcor` holds reconstructed
/// 21-bit coefficients, and `lpc` is the conversion scratch buffer.
///
/// For random-access blocks the predictor order grows progressively from
/// zero so the block decodes without prior context.
///
/// # Errors
///
/// Returns [`CoefOverflow`] from the PARCOR conversion; no residuals are
/// valid in that case.
#[allow(clippy::too_many_arguments)]
pub fn compute_residuals(
    r_parcor: &[i32],
    lpc: &mut [i32],
    lane: &[i32],
    start: usize,
    len: usize,
    order: usize,
    ra_block: bool,
    res: &mut [i32],
) -> Result<(), CoefOverflow> {
    debug_assert!(order > 0);
    debug_assert!(res.len() >= len);

    let mut i = 0usize;
    if ra_block {
        let ra_order = order.min(len);

        // copy first residual sample verbatim
        res[0] = lane[start];
        i = 1;

        parcor_to_lpc(0, r_parcor, lpc)?;
        while i < ra_order {
            res[i] = lane[start + i] + predict(lpc, lane, start + i, i);
            parcor_to_lpc(i, r_parcor, lpc)?;
            i += 1;
        }
    } else {
        for j in 0..order {
            parcor_to_lpc(j, r_parcor, lpc)?;
        }
    }

    while i < len {
        res[i] = lane[start + i] + predict(lpc, lane, start + i, order);
        i += 1;
    }
    Ok(())
}
