// Copyright (c) 2018-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::api::{EncoderStatus, InvalidConfig};
use crate::util::mb_count;

/// Hard limit on buffered source frames.
pub const MAX_LAG_BUFFERS: usize = 25;

/// Per-frame flags supplied with the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags {
  /// Code the frame as a keyframe.
  pub force_keyframe: bool,
}

/// Macroblock activity map; a zero entry marks an inactive 16x16 block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveMap {
  rows: usize,
  cols: usize,
  map: Box<[u8]>,
}

impl ActiveMap {
  /// Builds a map for a `width`x`height` frame.
  ///
  /// # Errors
  ///
  /// Returns `InvalidConfig::InvalidActiveMap` if `map` does not hold one
  /// entry per macroblock or its grid does not match the frame.
  pub fn new(
    width: usize, height: usize, rows: usize, cols: usize, map: &[u8],
  ) -> Result<Self, InvalidConfig> {
    if rows != mb_count(height) || cols != mb_count(width) {
      return Err(InvalidConfig::InvalidActiveMap { rows, cols });
    }
    if map.len() != rows * cols {
      return Err(InvalidConfig::InvalidActiveMap { rows, cols });
    }
    Ok(ActiveMap { rows, cols, map: map.into() })
  }

  /// Macroblock rows.
  pub const fn rows(&self) -> usize {
    self.rows
  }

  /// Macroblock columns.
  pub const fn cols(&self) -> usize {
    self.cols
  }

  /// Whether the macroblock at `mb_row`, `mb_col` is coded.
  pub fn is_active(&self, mb_row: usize, mb_col: usize) -> bool {
    self.map[mb_row * self.cols + mb_col] != 0
  }

  /// Number of active macroblocks.
  pub fn active_count(&self) -> usize {
    self.map.iter().filter(|&&m| m != 0).count()
  }
}

/// A source frame waiting in the lookahead.
#[derive(Debug)]
pub struct PendingFrame<S> {
  /// The picture.
  pub source: Arc<S>,
  /// Display order position, counted from the first frame sent.
  pub input_frameno: u64,
  /// Presentation start, in 1/10_000_000 s.
  pub ts_start: i64,
  /// Presentation end.
  pub ts_end: i64,
  /// Flags sent with the frame.
  pub flags: FrameFlags,
  /// Activity map in effect when the frame was sent.
  pub active_map: Option<Arc<ActiveMap>>,
  /// Already coded as a hidden alt-ref; popping it yields the overlay.
  pub coded_as_alt_ref: bool,
}

/// FIFO of source frames with random-access peeks for alt-ref coding.
#[derive(Debug)]
pub struct LookaheadQueue<S> {
  frames: VecDeque<PendingFrame<S>>,
  depth: usize,
}

impl<S> LookaheadQueue<S> {
  /// `lag_in_frames` of zero still buffers one frame.
  pub fn new(lag_in_frames: usize) -> Self {
    let depth = lag_in_frames.clamp(1, MAX_LAG_BUFFERS);
    LookaheadQueue { frames: VecDeque::with_capacity(depth), depth }
  }

  /// Frames held before the head may be coded.
  pub fn depth(&self) -> usize {
    self.depth
  }

  /// Frames buffered.
  pub fn len(&self) -> usize {
    self.frames.len()
  }

  /// No frame is buffered.
  pub fn is_empty(&self) -> bool {
    self.frames.is_empty()
  }

  /// `depth` frames are buffered.
  pub fn is_full(&self) -> bool {
    self.frames.len() >= self.depth
  }

  /// Appends a frame in display order.
  ///
  /// # Errors
  ///
  /// Returns `EncoderStatus::LookaheadFull` when `depth` frames are
  /// already waiting. The frame is handed back untouched in that case.
  pub fn push(
    &mut self, frame: PendingFrame<S>,
  ) -> Result<(), (EncoderStatus, PendingFrame<S>)> {
    if self.is_full() {
      return Err((EncoderStatus::LookaheadFull, frame));
    }
    self.frames.push_back(frame);
    Ok(())
  }

  /// Frame `offset` positions behind the head, if buffered.
  pub fn peek(&self, offset: usize) -> Option<&PendingFrame<S>> {
    self.frames.get(offset)
  }

  /// Removes the head. Without `flush` this only happens once the queue
  /// holds `depth` frames, so alt-ref targets stay reachable.
  pub fn pop(&mut self, flush: bool) -> Option<PendingFrame<S>> {
    if flush || self.is_full() {
      self.frames.pop_front()
    } else {
      None
    }
  }

  /// Flags the frame at `offset` as coded into the alt-ref buffer.
  pub fn mark_alt_ref(&mut self, offset: usize) -> bool {
    match self.frames.get_mut(offset) {
      Some(f) if !f.coded_as_alt_ref => {
        f.coded_as_alt_ref = true;
        true
      }
      _ => false,
    }
  }

  /// Display order number of the head frame.
  pub fn head_frameno(&self) -> Option<u64> {
    self.frames.front().map(|f| f.input_frameno)
  }
}
