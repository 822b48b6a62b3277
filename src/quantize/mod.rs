// Copyright (c) 2017-2022, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

#![allow(non_upper_case_globals)]

mod tables;

pub use tables::*;

pub const QINDEX_RANGE: usize = 256;
pub const MINQ: usize = 0;
pub const MAXQ: usize = 255;

/// Highest value on the user-facing quantizer scale.
pub const MAX_USER_QUANTIZER: u8 = 63;

pub fn ac_q(qindex: u8) -> u16 {
  ac_qlookup[qindex as usize]
}

pub fn dc_q(qindex: u8) -> u16 {
  dc_qlookup[qindex as usize]
}

/// Converts a quantizer index into the real quantizer step it selects.
///
/// The mapping is strictly increasing over the whole index range, which
/// every search over it relies on.
pub fn qindex_to_q(qindex: u8) -> f64 {
  ac_q(qindex) as f64 / 4.0
}

/// Maps the user-facing 0..=63 scale onto a quantizer index.
pub fn quantizer_to_qindex(quantizer: u8) -> u8 {
  q_trans[quantizer.min(MAX_USER_QUANTIZER) as usize]
}

/// Inverse of [`quantizer_to_qindex`]: the smallest user quantizer whose
/// index is at least `qindex`.
pub fn qindex_to_quantizer(qindex: u8) -> u8 {
  q_trans
    .iter()
    .position(|&qi| qi >= qindex)
    .unwrap_or(MAX_USER_QUANTIZER as usize) as u8
}

/// Index delta that moves a quantizer of `qstart` to one of `qtarget`,
/// searching only between `best` and `worst`.
pub fn compute_qdelta(best: u8, worst: u8, qstart: f64, qtarget: f64) -> i32 {
  let find = |q: f64| {
    let mut index = worst;
    for i in best..worst {
      index = i;
      if qindex_to_q(i) >= q {
        break;
      }
    }
    index as i32
  };
  find(qtarget) - find(qstart)
}

// Cubic fit of the lowest index allowed for a given worst index.
fn calculate_minq_index(maxq: f64, x3: f64, x2: f64, x1: f64) -> u8 {
  let minqtarget = (((x3 * maxq + x2) * maxq + x1) * maxq).min(maxq);

  // Below q 2.0 the next step is lossless.
  if minqtarget <= 2.0 {
    return 0;
  }
  (0..QINDEX_RANGE)
    .find(|&i| minqtarget <= qindex_to_q(i as u8))
    .unwrap_or(MAXQ) as u8
}

/// Lowest admissible quantizer index per active worst index.
///
/// The curves are built once per session and read-only afterwards.
#[derive(Clone)]
pub struct MinqTables {
  pub kf_low_motion: [u8; QINDEX_RANGE],
  pub kf_high_motion: [u8; QINDEX_RANGE],
  pub gf_low_motion: [u8; QINDEX_RANGE],
  pub gf_high_motion: [u8; QINDEX_RANGE],
  pub inter: [u8; QINDEX_RANGE],
}

impl MinqTables {
  pub fn new() -> Self {
    let mut tables = MinqTables {
      kf_low_motion: [0; QINDEX_RANGE],
      kf_high_motion: [0; QINDEX_RANGE],
      gf_low_motion: [0; QINDEX_RANGE],
      gf_high_motion: [0; QINDEX_RANGE],
      inter: [0; QINDEX_RANGE],
    };
    for i in 0..QINDEX_RANGE {
      let maxq = qindex_to_q(i as u8);
      tables.kf_low_motion[i] =
        calculate_minq_index(maxq, 0.000001, -0.0004, 0.15);
      tables.kf_high_motion[i] =
        calculate_minq_index(maxq, 0.000002, -0.0012, 0.5);
      tables.gf_low_motion[i] =
        calculate_minq_index(maxq, 0.0000015, -0.0009, 0.33);
      tables.gf_high_motion[i] =
        calculate_minq_index(maxq, 0.0000021, -0.00125, 0.45);
      tables.inter[i] =
        calculate_minq_index(maxq, 0.00000271, -0.00113, 0.697);
    }
    tables
  }
}

impl Default for MinqTables {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for MinqTables {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MinqTables").finish_non_exhaustive()
  }
}

/// Rate-distortion multiplier for a frame coded at `qindex`.
pub fn rd_mult(qindex: u8) -> i64 {
  let q = dc_q(qindex) as i64;
  (88 * q * q / 25).max(1)
}

pub const RD_DIV: i64 = 1;

/// Combined rate-distortion cost. `rate` is in 1/256 bit units.
pub fn rd_cost(rdmult: i64, rddiv: i64, rate: i64, dist: i64) -> i64 {
  ((128 + rate * rdmult) >> 8) + rddiv * dist
}
