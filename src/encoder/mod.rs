// Copyright (c) 2018-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Seams between the control loop and the pixel-level coding tools.
//!
//! The session never touches pixels. It hands an [`EncodePrimitive`] the
//! source frame, the quantizer and the reference buffers, and gets back a
//! payload plus a reconstruction written into a pool slot.

pub mod pool;
pub mod reference;

pub use self::pool::*;
pub use self::reference::*;

use crate::api::{ActiveMap, EncoderError, FrameType};
use crate::recode::InterpFilter;

/// Minimal view of an input picture.
pub trait SourceFrame {
  fn width(&self) -> usize;
  fn height(&self) -> usize;
}

/// Per-attempt coding parameters handed to the primitive.
#[derive(Debug, Clone, Copy)]
pub struct EncodeParams<'a> {
  pub frame_type: FrameType,
  pub qindex: u8,
  pub interp_filter: InterpFilter,
  pub show_frame: bool,
  /// References the primitive may predict from.
  pub usable_refs: RefFlags,
  pub active_map: Option<&'a ActiveMap>,
  /// The frame is the display-order copy of an already coded alt-ref.
  pub is_src_frame_alt_ref: bool,
}

/// Read-only view of the three reference roles for one encode.
#[derive(Debug)]
pub struct ReferenceSet<'a, R> {
  pub last: &'a R,
  pub golden: &'a R,
  pub alt_ref: &'a R,
}

impl<'a, R> ReferenceSet<'a, R> {
  pub fn get(&self, role: RefFrame) -> &'a R {
    match role {
      RefFrame::Last => self.last,
      RefFrame::Golden => self.golden,
      RefFrame::AltRef => self.alt_ref,
    }
  }
}

/// What one call to [`EncodePrimitive::encode_frame`] measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeOutcome {
  /// Bits spent, when the primitive can tell without a pack.
  pub bits: Option<u64>,
  /// Luma sum of squared error between source and reconstruction.
  pub error: u64,
}

/// The transform, prediction and entropy coding tools.
///
/// Implementations must be deterministic: identical inputs produce
/// identical payloads and reconstructions.
pub trait EncodePrimitive {
  type Source: SourceFrame;
  type Recon;

  /// Allocates one reconstruction buffer. Called only while the session
  /// is being created.
  ///
  /// # Errors
  ///
  /// Returns `EncoderError::AllocationFailed` if the buffer cannot be
  /// created.
  fn alloc_recon(
    &mut self, width: usize, height: usize,
  ) -> Result<Self::Recon, EncoderError>;

  /// Codes `source` with `params` into `output`, writing the
  /// reconstruction into `recon`.
  ///
  /// # Errors
  ///
  /// Any error is fatal for the session.
  fn encode_frame(
    &mut self, source: &Self::Source, params: &EncodeParams,
    refs: &ReferenceSet<Self::Recon>, recon: &mut Self::Recon,
    output: &mut Vec<u8>,
  ) -> Result<EncodeOutcome, EncoderError>;
}

/// Frame level syntax values handed to the packer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
  pub frame_type: FrameType,
  pub show_frame: bool,
  pub qindex: u8,
  pub interp_filter: InterpFilter,
  pub refresh: RefFlags,
  /// Map slots overwritten by this frame, one bit per slot.
  pub refresh_mask: u8,
  /// Map slot read for each of LAST, GOLDEN and ALTREF.
  pub ref_slots: [u8; 3],
  pub width: usize,
  pub height: usize,
}

/// Produces the final bitstream bytes for a frame.
pub trait BitstreamPacker {
  /// Wraps `payload` with the frame header. A `dummy` pack only measures
  /// the size and must not change packer state.
  ///
  /// # Errors
  ///
  /// Any error is fatal for the session.
  fn pack(
    &mut self, header: &FrameHeader, payload: &[u8], dummy: bool,
  ) -> Result<Vec<u8>, EncoderError>;
}
