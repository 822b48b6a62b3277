// Copyright (c) 2017-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Simple ivf muxer for VP9 streams.

use bitstream_io::{BitWrite, BitWriter, LittleEndian};
use std::io;

/// Codec tag written into the file header.
pub const FOURCC: [u8; 4] = *b"VP90";

/// Writes the 32 byte file header.
///
/// # Errors
///
/// Returns any error of the underlying writer.
pub fn write_ivf_header(
  output_file: &mut dyn io::Write, width: usize, height: usize,
  framerate_num: usize, framerate_den: usize,
) -> io::Result<()> {
  let mut bw = BitWriter::endian(output_file, LittleEndian);
  bw.write_bytes(b"DKIF")?;
  bw.write_from::<u16>(0)?; // version
  bw.write_from::<u16>(32)?; // header size
  bw.write_bytes(&FOURCC)?;
  bw.write_from::<u16>(width as u16)?;
  bw.write_from::<u16>(height as u16)?;
  bw.write_from::<u32>(framerate_num as u32)?;
  bw.write_from::<u32>(framerate_den as u32)?;
  bw.write_from::<u32>(0)?; // frame count, unknown when streaming
  bw.write_from::<u32>(0)
}

/// Writes one frame with its 12 byte header.
///
/// # Errors
///
/// Returns any error of the underlying writer.
pub fn write_ivf_frame(
  output_file: &mut dyn io::Write, pts: u64, data: &[u8],
) -> io::Result<()> {
  let mut bw = BitWriter::endian(output_file, LittleEndian);
  bw.write_from::<u32>(data.len() as u32)?;
  bw.write_from::<u64>(pts)?;
  bw.write_bytes(data)
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn header_layout() {
    let mut out = Vec::new();
    write_ivf_header(&mut out, 352, 288, 30, 1).unwrap();
    assert_eq!(out.len(), 32);
    assert_eq!(&out[0..4], b"DKIF");
    assert_eq!(&out[8..12], b"VP90");
    assert_eq!(&out[12..14], &352u16.to_le_bytes());
    assert_eq!(&out[16..20], &30u32.to_le_bytes());
  }

  #[test]
  fn frame_layout() {
    let mut out = Vec::new();
    write_ivf_frame(&mut out, 7, &[1, 2, 3]).unwrap();
    assert_eq!(out.len(), 15);
    assert_eq!(&out[0..4], &3u32.to_le_bytes());
    assert_eq!(&out[4..12], &7u64.to_le_bytes());
    assert_eq!(&out[12..], &[1, 2, 3]);
  }
}
