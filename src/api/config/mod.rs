// Copyright (c) 2020-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use thiserror::Error;

use crate::api::lookahead::MAX_LAG_BUFFERS;
use crate::api::{Context, EncodeSession, EncoderError};
use crate::encoder::{BitstreamPacker, EncodePrimitive, MAX_FRAME_BUFFERS};

mod encoder;
pub use encoder::*;

mod rate;
pub use rate::{RateControlConfig, RateMode};

/// Enumeration of possible invalid configuration errors.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
#[non_exhaustive]
pub enum InvalidConfig {
  /// The width is invalid.
  #[error("invalid width {0} (expected >= 16, <= 65535)")]
  InvalidWidth(usize),
  /// The height is invalid.
  #[error("invalid height {0} (expected >= 16, <= 65535)")]
  InvalidHeight(usize),
  /// Maximal keyframe interval is invalid.
  #[error("invalid max keyframe interval {actual} (expected >= 1, <= {max})")]
  InvalidMaxKeyFrameInterval {
    /// The actual value.
    actual: u64,
    /// The maximal supported value.
    max: u64,
  },
  /// Framerate numerator is invalid.
  #[error("invalid framerate numerator {actual} (expected > 0, <= {max})")]
  InvalidFrameRateNum {
    /// The actual value.
    actual: u64,
    /// The maximal supported value.
    max: u64,
  },
  /// Framerate denominator is invalid.
  #[error("invalid framerate denominator {actual} (expected > 0, <= {max})")]
  InvalidFrameRateDen {
    /// The actual value.
    actual: u64,
    /// The maximal supported value.
    max: u64,
  },
  /// Lookahead depth is invalid.
  #[error("invalid lag in frames {actual} (expected <= {max})")]
  InvalidLagInFrames {
    /// The actual value.
    actual: usize,
    /// The maximal supported value.
    max: usize,
  },
  /// Reconstruction buffer count is invalid.
  #[error("invalid frame buffer count {actual} (expected >= {min}, <= {max})")]
  InvalidFrameBuffers {
    /// The actual value.
    actual: usize,
    /// The minimal supported value for the alt-ref layout.
    min: usize,
    /// The maximal supported value.
    max: usize,
  },
  /// The quantizer range is empty.
  #[error("invalid quantizer range {best}..={worst}")]
  InvalidQuantizerRange {
    /// Lowest quantizer index.
    best: u8,
    /// Highest quantizer index.
    worst: u8,
  },
  /// A quality level lies outside the quantizer range.
  #[error("quantizer index {0} lies outside the allowed range")]
  QuantizerOutOfRange(u8),
  /// A boost window is empty.
  #[error("invalid {name} boost window {low}..{high} (expected low < high)")]
  InvalidBoostWindow {
    /// Which window.
    name: &'static str,
    /// Lower edge.
    low: u32,
    /// Upper edge.
    high: u32,
  },
  /// A buffer level is negative.
  #[error("invalid buffer size {0} ms (expected >= 0)")]
  InvalidBufferSize(i64),
  /// Percentage outside 0..=100.
  #[error("invalid {name} percentage {actual} (expected <= 100)")]
  InvalidPercentage {
    /// Which setting.
    name: &'static str,
    /// The actual value.
    actual: u32,
  },
  /// The rate control needs a target bitrate in order to produce results
  #[error("The rate control requires a target bitrate")]
  TargetBitrateNeeded,
  /// Second pass statistics were gathered at another frame size.
  #[error("Mismatch in the rate control configuration")]
  RateControlConfigurationMismatch,
  /// Activity map does not match the macroblock grid.
  #[error("invalid active map of {rows}x{cols} macroblocks")]
  InvalidActiveMap {
    /// Rows supplied.
    rows: usize,
    /// Columns supplied.
    cols: usize,
  },
  /// Activity maps were not enabled in the configuration.
  #[error("active maps are disabled")]
  ActiveMapDisabled,
  /// A setting fixed at session creation was changed.
  #[error("{0} cannot change during a session")]
  FixedSetting(&'static str),
}

/// Contains the encoder configuration.
#[derive(Clone, Debug, Default)]
pub struct Config {
  /// Settings which impact the produced bitstream.
  pub(crate) enc: EncoderConfig,
  /// Rate control configuration
  pub(crate) rate_control: RateControlConfig,
}

impl Config {
  /// Create a default configuration
  ///
  /// same as `Default::default()`
  pub fn new() -> Self {
    Config::default()
  }

  /// Set the encoder configuration
  pub fn with_encoder_config(mut self, enc: EncoderConfig) -> Self {
    self.enc = enc;
    self
  }

  /// Set the rate control configuration
  ///
  /// The default configuration is single pass
  pub fn with_rate_control(mut self, rate_control: RateControlConfig) -> Self {
    self.rate_control = rate_control;
    self
  }

  /// The encoder configuration.
  pub fn encoder_config(&self) -> &EncoderConfig {
    &self.enc
  }

  /// The rate control configuration.
  pub fn rate_control(&self) -> &RateControlConfig {
    &self.rate_control
  }

  /// Creates a [`Context`] with this configuration, coding through
  /// `primitive` and packing through `packer`.
  ///
  /// # Errors
  ///
  /// Returns `EncoderError::Config` if the config is invalid, or the
  /// error reported while allocating the reconstruction buffers.
  ///
  /// [`Context`]: struct.Context.html
  pub fn new_context<E, P>(
    &self, primitive: E, packer: P,
  ) -> Result<Context<E, P>, EncoderError>
  where
    E: EncodePrimitive,
    P: BitstreamPacker,
  {
    self.validate()?;
    let inner = EncodeSession::new(self, primitive, packer)?;
    Ok(Context { inner, is_flushing: false })
  }

  /// Validates the configuration.
  ///
  /// # Errors
  ///
  /// Returns the first `InvalidConfig` found.
  pub fn validate(&self) -> Result<(), InvalidConfig> {
    use InvalidConfig::*;

    let config = &self.enc;

    if config.width < 16 || config.width > u16::MAX as usize {
      return Err(InvalidWidth(config.width));
    }
    if config.height < 16 || config.height > u16::MAX as usize {
      return Err(InvalidHeight(config.height));
    }

    if config.max_key_frame_interval == 0
      || config.max_key_frame_interval > MAX_MAX_KEY_FRAME_INTERVAL
    {
      return Err(InvalidMaxKeyFrameInterval {
        actual: config.max_key_frame_interval,
        max: MAX_MAX_KEY_FRAME_INTERVAL,
      });
    }

    if config.time_base.num == 0 || config.time_base.num > u32::MAX as u64 {
      return Err(InvalidFrameRateNum {
        actual: config.time_base.num,
        max: u32::MAX as u64,
      });
    }
    if config.time_base.den == 0 || config.time_base.den > u32::MAX as u64 {
      return Err(InvalidFrameRateDen {
        actual: config.time_base.den,
        max: u32::MAX as u64,
      });
    }

    if config.lag_in_frames > MAX_LAG_BUFFERS {
      return Err(InvalidLagInFrames {
        actual: config.lag_in_frames,
        max: MAX_LAG_BUFFERS,
      });
    }

    let min = config.min_frame_buffers();
    if config.frame_buffers < min || config.frame_buffers > MAX_FRAME_BUFFERS
    {
      return Err(InvalidFrameBuffers {
        actual: config.frame_buffers,
        min,
        max: MAX_FRAME_BUFFERS,
      });
    }

    if config.best_quality > config.worst_quality {
      return Err(InvalidQuantizerRange {
        best: config.best_quality,
        worst: config.worst_quality,
      });
    }

    for (name, window) in
      [("keyframe", config.kf_boost_window), ("golden", config.gf_boost_window)]
    {
      if window.low >= window.high {
        return Err(InvalidBoostWindow {
          name,
          low: window.low,
          high: window.high,
        });
      }
    }

    self.validate_rate_control()
  }

  fn validate_rate_control(&self) -> Result<(), InvalidConfig> {
    use InvalidConfig::*;

    let config = &self.enc;
    let rc = &self.rate_control;
    let in_range =
      |q: u8| (config.best_quality..=config.worst_quality).contains(&q);

    match rc.mode {
      RateMode::FixedQ { qindex } if !in_range(qindex) => {
        return Err(QuantizerOutOfRange(qindex));
      }
      RateMode::ConstrainedQuality { cq_level } if !in_range(cq_level) => {
        return Err(QuantizerOutOfRange(cq_level));
      }
      RateMode::FixedQ { .. } => {}
      _ if rc.bitrate <= 0 => return Err(TargetBitrateNeeded),
      _ => {}
    }

    for ms in
      [rc.starting_buffer_ms, rc.optimal_buffer_ms, rc.maximum_buffer_ms]
    {
      if ms < 0 {
        return Err(InvalidBufferSize(ms));
      }
    }
    if rc.two_pass_vbr_min_section > 100 {
      return Err(InvalidPercentage {
        name: "two pass minimum section",
        actual: rc.two_pass_vbr_min_section,
      });
    }

    if let Some(stats) = &rc.second_pass {
      let header = stats.header();
      if header.width as usize != config.width
        || header.height as usize != config.height
      {
        return Err(RateControlConfigurationMismatch);
      }
    }

    Ok(())
  }
}
