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

//! Abstract interface for bit-based output.

use std::ops::Shl;

use num_traits::ToBytes;

use super::error::SinkFull;

/// Alias trait for the bit-addressible integers.
pub trait PackedBits: ToBytes + Into<u64> + Shl<usize, Output = Self> + Copy {}

impl<T: ToBytes + Into<u64> + Shl<usize, Output = T> + Copy> PackedBits for T {}

/// Storage-agnostic interface trait for bit-based output.
///
/// All writers are fallible; the concrete sinks either never fail
/// ([`BitCounter`]) or fail when a preset capacity is exhausted
/// ([`ByteSink`] with a limit).
pub trait BitSink: Sized {
    /// Puts zeros until the length aligns to the byte boundary.
    ///
    /// # Errors
    ///
    /// Returns [`SinkFull`] when the sink has a capacity limit and it is
    /// exceeded.
    fn align_to_byte(&mut self) -> Result<usize, SinkFull>;

    /// Writes `n` LSBs to the sink.
    ///
    /// # Errors
    ///
    /// Returns [`SinkFull`] on capacity exhaustion.
    fn write_lsbs<T: PackedBits>(&mut self, val: T, n: usize) -> Result<(), SinkFull>;

    /// Writes `n` MSBs to the sink.
    ///
    /// # Errors
    ///
    /// Returns [`SinkFull`] on capacity exhaustion.
    fn write_msbs<T: PackedBits>(&mut self, val: T, n: usize) -> Result<(), SinkFull>;

    /// Writes `val` in `n`-bit two's complement format.
    ///
    /// # Errors
    ///
    /// Returns [`SinkFull`] on capacity exhaustion.
    #[inline]
    fn write_twoc<T: Into<i64>>(&mut self, val: T, n: usize) -> Result<(), SinkFull> {
        let val: i64 = val.into();
        let shifted = (val << (64 - n)) as u64;
        self.write_msbs(shifted, n)
    }

    /// Writes a run of `n` one-bits followed by a single zero bit.
    ///
    /// This is the unary prefix used by Rice codes.
    ///
    /// # Errors
    ///
    /// Returns [`SinkFull`] on capacity exhaustion.
    fn write_unary(&mut self, n: u32) -> Result<(), SinkFull> {
        let mut rest = n;
        while rest > 31 {
            self.write_lsbs(0x7FFF_FFFFu32, 31)?;
            rest -= 31;
        }
        let terminated = ((1u64 << (rest + 1)) - 1) ^ 1;
        self.write_lsbs(terminated, rest as usize + 1)
    }

    /// Returns the number of bits written so far.
    fn bit_length(&self) -> usize;
}

/// Sink that only counts bits. Used for exact bit counting of code paths
/// that are too irregular for analytic counts (e.g. the arithmetic coder).
#[derive(Clone, Debug, Default)]
pub struct BitCounter {
    bits: usize,
}

impl BitCounter {
    pub const fn new() -> Self {
        Self { bits: 0 }
    }
}

impl BitSink for BitCounter {
    #[inline]
    fn align_to_byte(&mut self) -> Result<usize, SinkFull> {
        let npad = (8 - self.bits % 8) % 8;
        self.bits += npad;
        Ok(npad)
    }

    #[inline]
    fn write_lsbs<T: PackedBits>(&mut self, _val: T, n: usize) -> Result<(), SinkFull> {
        self.bits += n;
        Ok(())
    }

    #[inline]
    fn write_msbs<T: PackedBits>(&mut self, _val: T, n: usize) -> Result<(), SinkFull> {
        self.bits += n;
        Ok(())
    }

    #[inline]
    fn write_unary(&mut self, n: u32) -> Result<(), SinkFull> {
        self.bits += n as usize + 1;
        Ok(())
    }

    #[inline]
    fn bit_length(&self) -> usize {
        self.bits
    }
}

/// Byte-vector sink with an optional capacity limit.
///
/// Packets are sized `frame_length * channels * 32` bits; a frame that does
/// not fit is a hard error rather than a reallocation, so that pathological
/// inputs fail fast without corrupting encoder state.
pub struct ByteSink {
    bytes: Vec<u8>,
    bitlength: usize,
    limit_bits: Option<usize>,
}

impl Default for ByteSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteSink {
    /// Creates a new unbounded `ByteSink`.
    pub const fn new() -> Self {
        Self {
            bytes: Vec::new(),
            bitlength: 0,
            limit_bits: None,
        }
    }

    /// Creates a new `ByteSink` that errors beyond `limit_bits` bits.
    pub fn with_limit(limit_bits: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(limit_bits / 8 + 1),
            bitlength: 0,
            limit_bits: Some(limit_bits),
        }
    }

    /// Clears the sink, removing all written bits but keeping the limit.
    pub fn clear(&mut self) {
        self.bytes.clear();
        self.bitlength = 0;
    }

    /// Returns the written bits as a byte slice. The tail byte is padded
    /// with zeros.
    pub fn as_byte_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the sink and returns the written bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Overwrites the four bytes at `byte_pos` with `val` (big-endian).
    ///
    /// Used to back-patch length slots that are reserved before their value
    /// is known. The patched region must already be written.
    ///
    /// # Panics
    ///
    /// Panics if the region `byte_pos..byte_pos + 4` has not been written.
    pub fn patch_u32(&mut self, byte_pos: usize, val: u32) {
        assert!((byte_pos + 4) * 8 <= self.bitlength);
        self.bytes[byte_pos..byte_pos + 4].copy_from_slice(&val.to_be_bytes());
    }

    /// Returns the remaining number of bits in the last byte.
    #[inline]
    fn tail_len(&self) -> usize {
        let r = self.bitlength % 8;
        if r == 0 {
            0
        } else {
            8 - r
        }
    }

    #[inline]
    fn check_capacity(&self, additional: usize) -> Result<(), SinkFull> {
        match self.limit_bits {
            Some(limit) if self.bitlength + additional > limit => Err(SinkFull),
            _ => Ok(()),
        }
    }

    /// Returns bits in a string for tests.
    #[cfg(test)]
    fn to_debug_bitstring(&self) -> String {
        let mut ret = String::new();
        for b in &self.bytes {
            ret.push_str(&format!("{b:08b}_"));
        }
        ret.pop();
        ret
    }

    /// Appends first `n` bits (from MSB) of `val` to the sink.
    #[inline]
    fn push_u64_msbs(&mut self, val: u64, n: usize) {
        let mut val: u64 = val;
        let mut n = n;
        let nbitlength = self.bitlength + n;
        let r = self.tail_len();

        if r != 0 {
            let b: u8 = ((val >> (64 - r)) & ((1 << r) - 1)) as u8;
            let tail = self.bytes.len() - 1;
            self.bytes[tail] |= b;
            val <<= r;
            n = n.saturating_sub(r);
        }
        while n >= 8 {
            let b: u8 = (val >> (64 - 8) & 0xFFu64) as u8;
            self.bytes.push(b);
            val <<= 8;
            n -= 8;
        }
        if n > 0 {
            let b: u8 = ((val >> (64 - n)) << (8 - n)) as u8;
            self.bytes.push(b);
        }
        self.bitlength = nbitlength;
    }
}

impl BitSink for ByteSink {
    #[inline]
    fn align_to_byte(&mut self) -> Result<usize, SinkFull> {
        let r = self.tail_len();
        self.check_capacity(r)?;
        self.bitlength += r;
        Ok(r)
    }

    #[inline]
    fn write_msbs<T: PackedBits>(&mut self, val: T, n: usize) -> Result<(), SinkFull> {
        if n == 0 {
            return Ok(());
        }
        self.check_capacity(n)?;
        let initial_shift = 64 - (std::mem::size_of::<T>() * 8);
        let val: u64 = val.into();
        self.push_u64_msbs(val << initial_shift, n);
        Ok(())
    }

    #[inline]
    fn write_lsbs<T: PackedBits>(&mut self, val: T, n: usize) -> Result<(), SinkFull> {
        if n == 0 {
            return Ok(());
        }
        self.check_capacity(n)?;
        let val: u64 = val.into();
        self.push_u64_msbs(val << (64 - n), n);
        Ok(())
    }

    #[inline]
    fn bit_length(&self) -> usize {
        self.bitlength
    }
}
