// Copyright (c) 2018-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::io::Read;

use crate::decoder::{DecodeError, Decoder, LumaFrame, VideoDetails};
use vpxrc::Rational;

impl<R: Read> Decoder for y4m::Decoder<R> {
  fn get_video_details(&self) -> VideoDetails {
    let framerate = self.get_framerate();
    VideoDetails {
      width: self.get_width(),
      height: self.get_height(),
      bit_depth: self.get_colorspace().get_bit_depth(),
      time_base: Rational::new(framerate.den as u64, framerate.num as u64),
    }
  }

  fn read_frame(&mut self) -> Result<LumaFrame, DecodeError> {
    let (width, height) = (self.get_width(), self.get_height());
    let frame = y4m::Decoder::read_frame(self)?;
    let luma = frame.get_y_plane();
    if luma.len() < width * height {
      return Err(DecodeError::BadInput);
    }
    Ok(LumaFrame { width, height, data: luma[..width * height].into() })
  }
}

impl From<y4m::Error> for DecodeError {
  fn from(e: y4m::Error) -> DecodeError {
    match e {
      y4m::Error::EOF => DecodeError::EOF,
      y4m::Error::BadInput => DecodeError::BadInput,
      y4m::Error::UnknownColorspace => DecodeError::UnknownColorspace,
      y4m::Error::ParseError(_) => DecodeError::ParseError,
      y4m::Error::IoError(e) => DecodeError::IoError(e),
      // Note that this error code has nothing to do with the system
      // running out of memory, it means the y4m decoder has exceeded its
      // memory allocation limit.
      y4m::Error::OutOfMemory => DecodeError::MemoryLimitExceeded,
    }
  }
}
