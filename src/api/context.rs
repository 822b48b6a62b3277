// Copyright (c) 2018-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.
#![deny(missing_docs)]

use crate::api::config::*;
use crate::api::internal::*;
use crate::api::util::*;

use crate::encoder::*;
use crate::stats::SessionStats;

/// The encoder context.
///
/// Contains the encoding state.
pub struct Context<E: EncodePrimitive, P: BitstreamPacker> {
  pub(crate) inner: EncodeSession<E, P>,
  pub(crate) is_flushing: bool,
}

impl<E: EncodePrimitive, P: BitstreamPacker> Context<E, P> {
  /// Sends the frame for encoding.
  ///
  /// The frame is queued in the lookahead; nothing is coded until
  /// [`receive_packet`] is called.
  ///
  /// Passing `None` is equivalent to calling [`flush`].
  ///
  /// # Errors
  ///
  /// - [`EncoderStatus::EnoughData`] if the encoder has been flushed.
  /// - [`EncoderStatus::LookaheadFull`] if `lag_in_frames` frames are
  ///   already waiting; drain a packet and send the frame again.
  /// - [`EncoderStatus::Failure`] if the frame is larger than the first
  ///   one, or the session already failed.
  ///
  /// [`receive_packet`]: #method.receive_packet
  /// [`flush`]: #method.flush
  #[inline]
  pub fn send_frame<F>(&mut self, frame: F) -> Result<(), EncoderStatus>
  where
    F: IntoFrame<E::Source>,
  {
    let (frame, params) = frame.into();

    match frame {
      None => {
        self.is_flushing = true;
        Ok(())
      }
      Some(_) if self.is_flushing => Err(EncoderStatus::EnoughData),
      Some(frame) => self.inner.send_frame(frame, params),
    }
  }

  /// Encodes the next frame and returns the encoded data.
  ///
  /// This method is where the main encoding work is done.
  ///
  /// # Errors
  ///
  /// - [`EncoderStatus::NeedMoreData`] until the lookahead is full.
  /// - [`EncoderStatus::Encoded`] after coding a hidden alt-ref; its
  ///   bytes come out with the next packet.
  /// - [`EncoderStatus::LimitReached`] once a flushed stream is drained.
  /// - [`EncoderStatus::Failure`] on a fatal error. Every later call
  ///   returns the same failure.
  #[inline]
  pub fn receive_packet(&mut self) -> Result<Packet, EncoderStatus> {
    self.inner.receive_packet(self.is_flushing)
  }

  /// Flushes the encoder.
  ///
  /// Flushing signals the end of the video. After the encoder has been
  /// flushed, no additional frames are accepted.
  #[inline]
  pub fn flush(&mut self) {
    self.is_flushing = true;
  }

  /// Sets the macroblock activity map attached to frames sent from now on.
  /// `None` switches the map off.
  ///
  /// # Errors
  ///
  /// Returns `InvalidConfig::ActiveMapDisabled` unless the configuration
  /// enables active maps, and `InvalidConfig::InvalidActiveMap` when the
  /// grid does not match the frame size in macroblocks.
  pub fn set_active_map(
    &mut self, rows: usize, cols: usize, map: Option<&[u8]>,
  ) -> Result<(), InvalidConfig> {
    self.inner.set_active_map(rows, cols, map)
  }

  /// Restricts the references the next frame may predict from.
  pub fn use_as_reference(&mut self, flags: RefFlags) {
    self.inner.use_as_reference(flags)
  }

  /// Overrides the references the next shown inter frame refreshes.
  pub fn update_reference(&mut self, flags: RefFlags) {
    self.inner.update_reference(flags)
  }

  /// Quantizer index of the last coded frame.
  pub fn last_qindex(&self) -> u8 {
    self.inner.last_qindex()
  }

  /// Applies a new configuration to the running session.
  ///
  /// Rate targets, buffer levels, quantizer limits and keyframe settings
  /// take effect with the next frame.
  ///
  /// # Errors
  ///
  /// Returns `InvalidConfig` if the configuration is invalid or changes a
  /// setting fixed at creation (frame buffers, lag, alt-ref layout).
  pub fn change_config(&mut self, cfg: &Config) -> Result<(), InvalidConfig> {
    self.inner.change_config(cfg)
  }

  /// Running totals over the frames coded so far.
  pub fn stats(&self) -> &SessionStats {
    self.inner.stats()
  }

  /// The encoder configuration in effect.
  pub fn config(&self) -> &EncoderConfig {
    &self.inner.config
  }
}
