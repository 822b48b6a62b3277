// Copyright (c) 2020-2023, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::sync::Arc;

use crate::twopass::{Error, TwoPassStats};

/// How the frame size target is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(
  feature = "serialize",
  derive(serde::Serialize, serde::Deserialize)
)]
pub enum RateMode {
  /// Variable bitrate around the target.
  #[default]
  Vbr,
  /// Constant bitrate, steered by the buffer model.
  Cbr,
  /// Bitrate capped, quality floored at `cq_level`.
  ConstrainedQuality {
    /// Quantizer index no frame goes below.
    cq_level: u8,
  },
  /// Every frame at one quantizer index.
  FixedQ {
    /// The quantizer index.
    qindex: u8,
  },
}

/// Rate control configuration
#[derive(Clone, Debug)]
#[cfg_attr(
  feature = "serialize",
  derive(serde::Serialize, serde::Deserialize)
)]
pub struct RateControlConfig {
  /// Rate control mode.
  pub mode: RateMode,
  /// Target bitrate in bits per second.
  pub bitrate: i32,
  /// Buffer fullness at the start, in milliseconds of target rate.
  pub starting_buffer_ms: i64,
  /// Buffer fullness CBR steers toward; zero means an eighth of the
  /// target rate.
  pub optimal_buffer_ms: i64,
  /// Buffer size; zero means an eighth of the target rate.
  pub maximum_buffer_ms: i64,
  /// Keyframe size cap as a percentage of the average frame; zero
  /// disables it.
  pub max_intra_bitrate_pct: u32,
  /// Smallest frame budget as a percentage of the average frame.
  pub two_pass_vbr_min_section: u32,
  /// First pass statistics driving the boost decisions.
  #[cfg_attr(feature = "serialize", serde(skip))]
  pub second_pass: Option<Arc<TwoPassStats>>,
}

impl Default for RateControlConfig {
  fn default() -> Self {
    RateControlConfig {
      mode: RateMode::Vbr,
      bitrate: 256_000,
      starting_buffer_ms: 4000,
      optimal_buffer_ms: 5000,
      maximum_buffer_ms: 6000,
      max_intra_bitrate_pct: 0,
      two_pass_vbr_min_section: 0,
      second_pass: None,
    }
  }
}

impl RateControlConfig {
  /// Create a default rate control configuration
  ///
  /// By default the encoder is in single pass mode.
  pub fn new() -> Self {
    Default::default()
  }

  /// Create a second pass configuration from a serialized stats stream.
  ///
  /// # Errors
  ///
  /// Returns an error if the stream is malformed.
  pub fn from_stats_slice(bytes: &[u8]) -> Result<Self, Error> {
    Ok(Self::default().with_second_pass(TwoPassStats::from_slice(bytes)?))
  }

  /// Set the rate control mode.
  pub const fn with_mode(mut self, mode: RateMode) -> Self {
    self.mode = mode;
    self
  }

  /// Target bitrate, in bits per second.
  pub const fn with_bitrate(mut self, bitrate: i32) -> Self {
    self.bitrate = bitrate;
    self
  }

  /// Enable the second pass encoding mode
  pub fn with_second_pass(mut self, stats: TwoPassStats) -> Self {
    self.second_pass = Some(Arc::new(stats));
    self
  }

  /// Whether first pass statistics were supplied.
  pub fn is_second_pass(&self) -> bool {
    self.second_pass.is_some()
  }
}
