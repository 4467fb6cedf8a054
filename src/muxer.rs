// Copyright 2023 Google LLC
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

//! Raw ALS file framing.
//!
//! A raw ALS file is the `ALSSpecificConfig` (the stream header without the
//! `AudioSpecificConfig` preamble) followed by the frame packets verbatim.
//! The header carries the total sample count and CRC, which are only known
//! at the end of the stream, so it is rewritten in place on close.

use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;

use log::warn;

/// Writer for the raw `.als` container.
pub struct AlsWriter<'a, W: Write + Seek> {
    sink: &'a mut W,
    header_size: usize,
}

impl<'a, W: Write + Seek> AlsWriter<'a, W> {
    /// Starts a file by writing `extradata[config_offset..]` as the header.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the sink.
    pub fn new(
        sink: &'a mut W,
        extradata: &[u8],
        config_offset: usize,
    ) -> std::io::Result<Self> {
        let header = &extradata[config_offset..];
        sink.write_all(header)?;
        Ok(Self {
            sink,
            header_size: header.len(),
        })
    }

    /// Appends one frame packet unmodified.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the sink.
    pub fn write_packet(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.sink.write_all(data)
    }

    /// Rewrites the header from the finalized `extradata` and returns the
    /// total file size.
    ///
    /// A header whose size changed since [`new`] cannot be patched in
    /// place; the first write is kept and a warning is logged, leaving
    /// decodability to the decoder's tolerance for unknown sample counts.
    ///
    /// [`new`]: AlsWriter::new
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the sink.
    pub fn finalize(
        mut self,
        extradata: &[u8],
        config_offset: usize,
    ) -> std::io::Result<u64> {
        let file_size = self.sink.stream_position()?;
        let header = &extradata[config_offset..];
        if header.len() != self.header_size {
            warn!(
                "ALS header size changed ({} -> {} bytes), unable to rewrite header",
                self.header_size,
                header.len()
            );
            return Ok(file_size);
        }
        self.sink.seek(SeekFrom::Start(0))?;
        self.sink.write_all(header)?;
        self.sink.seek(SeekFrom::Start(file_size))?;
        self.sink.flush()?;
        Ok(file_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::io::Read;

    #[test]
    fn header_then_packets() {
        let extradata = b"PREFIXHEADER".to_vec();
        let mut file = Cursor::new(Vec::new());
        let mut mux = AlsWriter::new(&mut file, &extradata, 6).unwrap();
        mux.write_packet(b"frame0").unwrap();
        mux.write_packet(b"frame1").unwrap();
        let size = mux.finalize(b"PREFIXheader", 6).unwrap();

        assert_eq!(size, 18);
        assert_eq!(file.into_inner(), b"headerframe0frame1");
    }

    #[test]
    fn size_mismatch_keeps_first_header() {
        let mut file = Cursor::new(Vec::new());
        let mut mux = AlsWriter::new(&mut file, b"HDR", 0).unwrap();
        mux.write_packet(b"p").unwrap();
        // grown header: first write is kept
        mux.finalize(b"LONGHDR", 0).unwrap();
        assert_eq!(file.into_inner(), b"HDRp");
    }

    #[test]
    fn rewrite_on_disk() {
        let mut file = tempfile::tempfile().expect("temp file creation failed");
        {
            let mut mux = AlsWriter::new(&mut file, b"0000body", 0).unwrap();
            mux.write_packet(b"DATA").unwrap();
            mux.finalize(b"1234body", 0).unwrap();
        }
        let mut contents = Vec::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, b"1234bodyDATA");
    }
}
