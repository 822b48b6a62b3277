// Copyright (c) 2019, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::ops::{Add, AddAssign};
use std::sync::Arc;

use crate::api::FrameType;
use crate::recode::SearchState;

/// Default distance between golden frame refreshes.
pub const DEFAULT_GF_INTERVAL: usize = 7;

/// Statistics for the frames from one keyframe to the next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KfGroupStats {
  pub boost: u32,
  /// Share of the group's blocks with no motion, 0..=100.
  pub zero_motion_pct: u32,
  /// Complexity of the group relative to the whole clip, near 1.0 on
  /// average. Scales the group's share of the bit budget.
  pub weight: f64,
}

/// Statistics for one golden frame group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GfGroupStats {
  /// Frames until the next golden refresh.
  pub interval: usize,
  pub boost: u32,
  pub use_alt_ref: bool,
}

/// Source of per-group boost decisions.
///
/// Results depend only on the frame range asked about.
pub trait StatsPrimitive {
  fn kf_group(&self, start: u64, frames: usize) -> KfGroupStats;

  fn gf_group(&self, start: u64, max_interval: usize) -> GfGroupStats;

  /// Frames from `start` to the next natural keyframe, at most
  /// `max_interval`.
  fn frames_to_key(&self, _start: u64, max_interval: usize) -> usize {
    max_interval
  }
}

impl<T: StatsPrimitive + ?Sized> StatsPrimitive for Arc<T> {
  fn kf_group(&self, start: u64, frames: usize) -> KfGroupStats {
    (**self).kf_group(start, frames)
  }

  fn gf_group(&self, start: u64, max_interval: usize) -> GfGroupStats {
    (**self).gf_group(start, max_interval)
  }

  fn frames_to_key(&self, start: u64, max_interval: usize) -> usize {
    (**self).frames_to_key(start, max_interval)
  }
}

/// Fixed boosts for single pass encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultStats {
  pub kf_boost: u32,
  pub gf_boost: u32,
  pub gf_interval: usize,
}

impl Default for DefaultStats {
  fn default() -> Self {
    DefaultStats {
      kf_boost: 2000,
      gf_boost: 1000,
      gf_interval: DEFAULT_GF_INTERVAL,
    }
  }
}

impl StatsPrimitive for DefaultStats {
  fn kf_group(&self, _start: u64, _frames: usize) -> KfGroupStats {
    KfGroupStats { boost: self.kf_boost, zero_motion_pct: 0, weight: 1.0 }
  }

  fn gf_group(&self, _start: u64, max_interval: usize) -> GfGroupStats {
    let interval = self.gf_interval.min(max_interval).max(1);
    GfGroupStats {
      interval,
      boost: self.gf_boost,
      use_alt_ref: interval > 1,
    }
  }
}

/// Running totals over an encode session.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionStats {
  pub frames: u64,
  pub shown_frames: u64,
  pub key_frames: u64,
  pub hidden_alt_refs: u64,
  pub bytes: u64,
  /// Sum of coded quantizer indices, for averaging.
  pub qindex_sum: u64,
  pub recodes: u64,
  pub aborted_searches: u64,
  pub target_bits: u64,
  /// Summed luma squared error of shown frames.
  pub sse: u64,
  /// Luma samples covered by `sse`.
  pub samples: u64,
}

impl SessionStats {
  pub fn record(
    &mut self, frame_type: FrameType, show_frame: bool, bytes: usize,
    qindex: u8, target_bits: u64, recodes: u32, state: SearchState,
  ) {
    self.frames += 1;
    if show_frame {
      self.shown_frames += 1;
    } else {
      self.hidden_alt_refs += 1;
    }
    if frame_type == FrameType::KEY {
      self.key_frames += 1;
    }
    self.bytes += bytes as u64;
    self.qindex_sum += qindex as u64;
    self.target_bits += target_bits;
    self.recodes += recodes as u64;
    if state == SearchState::AbortedNonconvergent {
      self.aborted_searches += 1;
    }
  }

  pub fn record_error(&mut self, sse: u64, samples: u64) {
    self.sse += sse;
    self.samples += samples;
  }

  pub fn avg_qindex(&self) -> f64 {
    if self.frames == 0 {
      return 0.0;
    }
    self.qindex_sum as f64 / self.frames as f64
  }

  /// Luma PSNR over every shown frame.
  pub fn psnr(&self) -> f64 {
    mse_to_psnr(self.samples, 255.0, self.sse)
  }
}

impl Add<&Self> for SessionStats {
  type Output = Self;

  fn add(self, rhs: &SessionStats) -> Self::Output {
    let mut lhs = self;
    lhs += rhs;
    lhs
  }
}

impl AddAssign<&Self> for SessionStats {
  fn add_assign(&mut self, rhs: &SessionStats) {
    self.frames += rhs.frames;
    self.shown_frames += rhs.shown_frames;
    self.key_frames += rhs.key_frames;
    self.hidden_alt_refs += rhs.hidden_alt_refs;
    self.bytes += rhs.bytes;
    self.qindex_sum += rhs.qindex_sum;
    self.recodes += rhs.recodes;
    self.aborted_searches += rhs.aborted_searches;
    self.target_bits += rhs.target_bits;
    self.sse += rhs.sse;
    self.samples += rhs.samples;
  }
}

const MAX_PSNR: f64 = 100.0;

/// PSNR in dB for `sse` accumulated over `samples` values of range `peak`.
pub fn mse_to_psnr(samples: u64, peak: f64, sse: u64) -> f64 {
  if samples == 0 {
    return 0.0;
  }
  if sse == 0 {
    return MAX_PSNR;
  }
  let psnr = 10.0 * ((samples as f64 * peak * peak) / sse as f64).log10();
  psnr.min(MAX_PSNR)
}
