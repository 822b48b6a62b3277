// Copyright (c) 2020-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::fmt;

use crate::api::Rational;
use crate::encoder::INTER_REFS;
use crate::quantize::quantizer_to_qindex;
use crate::rate::BoostWindow;
use crate::recode::{InterpFilter, RecodeMode, DEFAULT_MAX_RECODES};

pub(crate) const MAX_MAX_KEY_FRAME_INTERVAL: u64 = i32::MAX as u64 / 3;

/// Encoder settings which shape the coded stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(
  feature = "serialize",
  derive(serde::Serialize, serde::Deserialize)
)]
pub struct EncoderConfig {
  // output size
  /// Width of the frames in pixels.
  pub width: usize,
  /// Height of the frames in pixels.
  pub height: usize,
  /// Duration of one frame, the inverse of the frame rate.
  pub time_base: Rational,

  // buffering
  /// Reconstruction buffers allocated when the session starts.
  pub frame_buffers: usize,
  /// Source frames held back for alt-ref coding.
  pub lag_in_frames: usize,

  // frame types
  /// Insert keyframes on the interval and on scene cuts.
  pub auto_key: bool,
  /// The *maximum* interval between two keyframes.
  pub max_key_frame_interval: u64,
  /// Code hidden alt-ref frames from the lookahead.
  pub play_alternate: bool,
  /// Code a second, lower level alt-ref inside long golden groups.
  pub multi_arf: bool,

  // quantizer
  /// Lowest quantizer index the rate control may pick.
  pub best_quality: u8,
  /// Highest quantizer index the rate control may pick.
  pub worst_quality: u8,
  /// Frames allowed to be re-encoded.
  pub recode: RecodeMode,
  /// Re-encodes allowed per frame in each search direction.
  pub max_recodes: u32,
  /// Try every interpolation filter and keep the cheapest.
  pub search_interp_filter: bool,
  /// Filter used when no search is made.
  pub interp_filter: InterpFilter,
  /// Accept activity maps through `Context::set_active_map`.
  pub active_map: bool,

  // boosts
  /// Boost range over which keyframe quality moves between the low and
  /// high motion curves.
  pub kf_boost_window: BoostWindow,
  /// Same for golden and alt-ref frames.
  pub gf_boost_window: BoostWindow,
}

impl Default for EncoderConfig {
  fn default() -> Self {
    EncoderConfig {
      width: 640,
      height: 480,
      time_base: Rational::new(1, 30),
      frame_buffers: INTER_REFS + 1,
      lag_in_frames: 16,
      auto_key: true,
      max_key_frame_interval: 240,
      play_alternate: true,
      multi_arf: false,
      best_quality: 0,
      worst_quality: 255,
      recode: RecodeMode::default(),
      max_recodes: DEFAULT_MAX_RECODES,
      search_interp_filter: false,
      interp_filter: InterpFilter::default(),
      active_map: false,
      kf_boost_window: BoostWindow::KEY,
      gf_boost_window: BoostWindow::GOLDEN,
    }
  }
}

impl EncoderConfig {
  /// Sets the quantizer range on the 0..=63 user scale.
  pub fn with_quantizer_range(mut self, min_q: u8, max_q: u8) -> Self {
    self.best_quality = quantizer_to_qindex(min_q.min(max_q));
    self.worst_quality = quantizer_to_qindex(max_q.max(min_q));
    self
  }

  /// Frames per second implied by the time base.
  pub fn frame_rate(&self) -> f64 {
    Rational::from_reciprocal(self.time_base).as_f64()
  }

  /// Reference map entries the configured alt-ref layout needs.
  pub fn ref_map_len(&self) -> usize {
    if self.multi_arf {
      INTER_REFS + 1
    } else {
      INTER_REFS
    }
  }

  /// Fewest reconstruction buffers that leave one free for coding.
  pub fn min_frame_buffers(&self) -> usize {
    self.ref_map_len() + 1
  }
}

impl fmt::Display for EncoderConfig {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let pairs = [
      ("size", format!("{}x{}", self.width, self.height)),
      ("fps", format!("{:.3}", self.frame_rate())),
      ("lag_in_frames", self.lag_in_frames.to_string()),
      ("max_key_frame_interval", self.max_key_frame_interval.to_string()),
      ("auto_key", self.auto_key.to_string()),
      ("play_alternate", self.play_alternate.to_string()),
      ("multi_arf", self.multi_arf.to_string()),
      (
        "quality",
        format!("{}..={}", self.best_quality, self.worst_quality),
      ),
      ("recode", format!("{:?}", self.recode)),
      ("max_recodes", self.max_recodes.to_string()),
    ];
    for (key, value) in pairs.iter() {
      writeln!(f, "{key:>23}: {value}")?;
    }
    Ok(())
  }
}
