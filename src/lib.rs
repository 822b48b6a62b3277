// Copyright (c) 2017-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Frame level control loop of a VP9-style encoder.
//!
//! The crate decides how each frame is coded: its type, the references it
//! reads and refreshes, its size target and the quantizer that meets it.
//! Pixel work is left to an [`EncodePrimitive`] and bitstream writing to a
//! [`BitstreamPacker`], both supplied by the caller.

pub mod util;
pub mod encoder;
pub mod quantize;
pub mod rate;
pub mod recode;
pub mod scheduler;
pub mod stats;
pub mod twopass;

mod api;

pub use api::*;
pub use encoder::{
  BitstreamPacker, EncodeOutcome, EncodeParams, EncodePrimitive,
  FrameHeader, RefFlags, RefFrame, ReferenceSet, SourceFrame,
};
pub use recode::{InterpFilter, RecodeMode, SearchState};
pub use twopass::{FirstPassStats, StatsHeader, TwoPassStats};

/// Commonly used types and traits.
pub mod prelude {
  pub use crate::api::*;
  pub use crate::encoder::{
    BitstreamPacker, EncodeOutcome, EncodeParams, EncodePrimitive,
    FrameHeader, RefFlags, RefFrame, ReferenceSet, SourceFrame,
  };
  pub use crate::recode::InterpFilter;
}
