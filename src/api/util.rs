// Copyright (c) 2018-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.
#![deny(missing_docs)]

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::api::InvalidConfig;
use crate::recode::SearchState;

/// A rational number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rational {
  /// Numerator.
  pub num: u64,
  /// Denominator.
  pub den: u64,
}

impl Rational {
  /// Creates a rational number from the given numerator and denominator.
  pub const fn new(num: u64, den: u64) -> Self {
    Rational { num, den }
  }

  /// Returns a rational number that is the reciprocal of the given one.
  pub const fn from_reciprocal(reciprocal: Self) -> Self {
    Rational { num: reciprocal.den, den: reciprocal.num }
  }

  /// Returns the rational number as a floating-point number.
  pub fn as_f64(self) -> f64 {
    self.num as f64 / self.den as f64
  }
}

#[cfg(feature = "serialize")]
impl serde::Serialize for Rational {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    (self.num, self.den).serialize(serializer)
  }
}

#[cfg(feature = "serialize")]
impl<'a> serde::Deserialize<'a> for Rational {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'a>,
  {
    let (num, den) = serde::Deserialize::deserialize(deserializer)?;

    Ok(Rational::new(num, den))
  }
}

/// Possible types of a frame.
#[allow(non_camel_case_types)]
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum FrameType {
  /// Key frame.
  KEY = 0,
  /// Inter-frame.
  INTER = 1,
}

impl fmt::Display for FrameType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    use self::FrameType::*;
    match self {
      KEY => write!(f, "Key frame"),
      INTER => write!(f, "Inter frame"),
    }
  }
}

/// Errors that end an encode session.
///
/// Once one is returned, every later call on the session returns it
/// again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncoderError {
  /// Every reconstruction buffer is referenced.
  #[error("frame buffer pool exhausted ({slots} slots all referenced)")]
  PoolExhausted {
    /// Size of the pool.
    slots: usize,
  },
  /// A buffer could not be allocated.
  #[error("failed to allocate {what}")]
  AllocationFailed {
    /// What was being allocated.
    what: &'static str,
  },
  /// A frame larger than the size latched by the first frame.
  #[error(
    "frame size {width}x{height} exceeds the initial {max_width}x{max_height}"
  )]
  DimensionMismatch {
    /// Width of the offending frame.
    width: usize,
    /// Height of the offending frame.
    height: usize,
    /// Width of the first frame.
    max_width: usize,
    /// Height of the first frame.
    max_height: usize,
  },
  /// The encode primitive or the packer reported a failure.
  #[error("encode primitive failed: {0}")]
  Primitive(String),
  /// The session could not be created from the configuration.
  #[error("invalid configuration")]
  Config(#[from] InvalidConfig),
}

/// Status that can be returned by [`Context`] functions.
///
/// [`Context`]: struct.Context.html
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum EncoderStatus {
  /// The encoder needs more data to produce an output packet.
  ///
  /// Returned by [`Context::receive_packet()`] until the lookahead is
  /// full, unless the encoder is being flushed.
  ///
  /// [`Context::receive_packet()`]: struct.Context.html#method.receive_packet
  #[error("need more data")]
  NeedMoreData,
  /// A frame was sent after the encoder had been flushed.
  #[error("enough data")]
  EnoughData,
  /// Every frame sent before the flush has been emitted.
  #[error("limit reached")]
  LimitReached,
  /// A hidden frame was encoded; it is emitted with the next shown frame.
  #[error("encoded")]
  Encoded,
  /// The lookahead already holds `lag_in_frames` frames.
  ///
  /// Call [`Context::receive_packet()`] and send the frame again.
  ///
  /// [`Context::receive_packet()`]: struct.Context.html#method.receive_packet
  #[error("lookahead full")]
  LookaheadFull,
  /// Fatal error; the session cannot continue.
  #[error("failure")]
  Failure(#[from] EncoderError),
}

/// Represents a packet.
///
/// A packet contains one shown frame together with the hidden alt-ref
/// frames coded just before it.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
  /// The packet data.
  pub data: Vec<u8>,
  /// Display order number of the shown frame.
  pub input_frameno: u64,
  /// Type of the shown frame.
  pub frame_type: FrameType,
  /// Quantizer index the shown frame was coded with.
  pub qindex: u8,
  /// Hidden frames packed ahead of the shown frame.
  pub hidden_frames: usize,
  /// Size target of the shown frame, in bits.
  pub target_bits: i64,
  /// Re-encodes spent on the shown frame.
  pub recodes: u32,
  /// How the quantizer search for the shown frame ended.
  pub search_state: SearchState,
  /// Luma PSNR of the shown frame.
  pub psnr: f64,
}

impl fmt::Display for Packet {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "Frame {} - {} - {} bytes",
      self.input_frameno,
      self.frame_type,
      self.data.len()
    )
  }
}

/// Optional per-frame settings sent along with a source frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameParameters {
  /// Code the frame as a keyframe.
  pub force_keyframe: bool,
  /// Presentation interval in units of 1/10_000_000 s. Derived from the
  /// frame count and the time base when absent.
  pub timestamps: Option<(i64, i64)>,
}

/// Types which can be converted into frames.
///
/// This trait is used in [`Context::send_frame`] to allow for passing in
/// frames with optional frame parameters.
///
/// [`Context::send_frame`]: struct.Context.html#method.send_frame
pub trait IntoFrame<S> {
  /// Converts the type into a tuple of frame and parameters.
  fn into(self) -> (Option<Arc<S>>, Option<FrameParameters>);
}

impl<S> IntoFrame<S> for Option<Arc<S>> {
  fn into(self) -> (Option<Arc<S>>, Option<FrameParameters>) {
    (self, None)
  }
}

impl<S> IntoFrame<S> for Arc<S> {
  fn into(self) -> (Option<Arc<S>>, Option<FrameParameters>) {
    (Some(self), None)
  }
}

impl<S> IntoFrame<S> for (Arc<S>, FrameParameters) {
  fn into(self) -> (Option<Arc<S>>, Option<FrameParameters>) {
    (Some(self.0), Some(self.1))
  }
}

impl<S> IntoFrame<S> for (Arc<S>, Option<FrameParameters>) {
  fn into(self) -> (Option<Arc<S>>, Option<FrameParameters>) {
    (Some(self.0), self.1)
  }
}
