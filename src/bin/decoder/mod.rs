// Copyright (c) 2001-2016, Alliance for Open Media. All rights reserved
// Copyright (c) 2017-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::io;

use vpxrc::prelude::*;

pub mod y4m;

/// Luma plane of one input picture, tightly packed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LumaFrame {
  pub width: usize,
  pub height: usize,
  pub data: Box<[u8]>,
}

impl LumaFrame {
  pub fn blank(width: usize, height: usize) -> Self {
    LumaFrame { width, height, data: vec![128; width * height].into() }
  }

  pub fn row(&self, y: usize) -> &[u8] {
    &self.data[y * self.width..(y + 1) * self.width]
  }
}

impl SourceFrame for LumaFrame {
  fn width(&self) -> usize {
    self.width
  }

  fn height(&self) -> usize {
    self.height
  }
}

pub trait Decoder {
  fn get_video_details(&self) -> VideoDetails;
  fn read_frame(&mut self) -> Result<LumaFrame, DecodeError>;
}

#[derive(Debug)]
#[allow(clippy::upper_case_acronyms)]
pub enum DecodeError {
  EOF,
  BadInput,
  UnknownColorspace,
  ParseError,
  IoError(io::Error),
  MemoryLimitExceeded,
}

#[derive(Debug, Clone, Copy)]
pub struct VideoDetails {
  pub width: usize,
  pub height: usize,
  pub bit_depth: usize,
  pub time_base: Rational,
}

impl Default for VideoDetails {
  fn default() -> Self {
    VideoDetails {
      width: 640,
      height: 480,
      bit_depth: 8,
      time_base: Rational { num: 1, den: 30 },
    }
  }
}
