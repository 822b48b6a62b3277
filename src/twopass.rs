// Copyright (c) 2019-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! First pass statistics: storage format and second pass group analysis.
//!
//! The stream starts with a header (`VPXS` magic, format version, frame
//! dimensions) followed by one fixed-size little-endian record per frame.

use itertools::Itertools;
use std::iter;
use thiserror::Error;

use crate::stats::{
  GfGroupStats, KfGroupStats, StatsPrimitive, DEFAULT_GF_INTERVAL,
};

pub const TWOPASS_MAGIC: [u8; 4] = *b"VPXS";
pub const TWOPASS_VERSION: u32 = 1;
pub const TWOPASS_HEADER_SZ: usize = 16;
pub const TWOPASS_RECORD_SZ: usize = 64;

const IIFACTOR: f64 = 12.5;
const GF_RMAX: f64 = 96.0;
const KF_RMAX: f64 = 128.0;
const MIN_DECAY_FACTOR: f64 = 0.1;
const MIN_GF_INTERVAL: usize = 4;
const MIN_KF_BOOST: u32 = 300;
const MAX_KF_BOOST: u32 = 6000;
const MIN_GF_BOOST: u32 = 100;
const MAX_GF_BOOST: u32 = 5000;
const MIN_ARF_BOOST: u32 = 150;

/// First pass stream errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
  #[error("not a first pass stats stream")]
  InvalidMagic,
  #[error("incompatible stats version {0}")]
  InvalidVersion(u32),
  #[error("stats stream truncated with {0} bytes of a partial record")]
  Truncated(usize),
  #[error("the stats content is invalid: {0}")]
  Corrupted(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct StatsHeader {
  pub width: u32,
  pub height: u32,
}

impl StatsHeader {
  pub fn to_bytes(self) -> [u8; TWOPASS_HEADER_SZ] {
    let mut out = [0u8; TWOPASS_HEADER_SZ];
    out[0..4].copy_from_slice(&TWOPASS_MAGIC);
    out[4..8].copy_from_slice(&TWOPASS_VERSION.to_le_bytes());
    out[8..12].copy_from_slice(&self.width.to_le_bytes());
    out[12..16].copy_from_slice(&self.height.to_le_bytes());
    out
  }
}

/// First pass measurements for one frame.
///
/// Errors are per-frame sums; percentages are fractions of the frame's
/// macroblocks in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct FirstPassStats {
  pub frame: u64,
  pub intra_error: f64,
  /// Best of intra and inter error against the previous frame.
  pub coded_error: f64,
  pub pcnt_inter: f64,
  pub pcnt_motion: f64,
  pub pcnt_second_ref: f64,
  /// Blocks where intra and inter errors were close.
  pub pcnt_neutral: f64,
  /// Display duration in timebase ticks.
  pub duration: f64,
}

impl FirstPassStats {
  pub fn to_bytes(&self) -> [u8; TWOPASS_RECORD_SZ] {
    let mut out = [0u8; TWOPASS_RECORD_SZ];
    let fields = [
      self.intra_error,
      self.coded_error,
      self.pcnt_inter,
      self.pcnt_motion,
      self.pcnt_second_ref,
      self.pcnt_neutral,
      self.duration,
    ];
    out[0..8].copy_from_slice(&self.frame.to_le_bytes());
    for (chunk, v) in out[8..].chunks_exact_mut(8).zip(fields) {
      chunk.copy_from_slice(&v.to_le_bytes());
    }
    out
  }

  fn from_bytes(buf: &[u8; TWOPASS_RECORD_SZ]) -> Result<Self, Error> {
    let word = |i: usize| {
      let mut b = [0u8; 8];
      b.copy_from_slice(&buf[i * 8..i * 8 + 8]);
      b
    };
    let f = |i: usize| f64::from_le_bytes(word(i));
    let stats = FirstPassStats {
      frame: u64::from_le_bytes(word(0)),
      intra_error: f(1),
      coded_error: f(2),
      pcnt_inter: f(3),
      pcnt_motion: f(4),
      pcnt_second_ref: f(5),
      pcnt_neutral: f(6),
      duration: f(7),
    };
    let values = [
      stats.intra_error,
      stats.coded_error,
      stats.pcnt_inter,
      stats.pcnt_motion,
      stats.pcnt_second_ref,
      stats.pcnt_neutral,
      stats.duration,
    ];
    if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
      return Err(Error::Corrupted(format!(
        "frame {} has a negative or non-finite measurement",
        stats.frame
      )));
    }
    Ok(stats)
  }

  fn zero_motion(&self) -> f64 {
    (self.pcnt_inter - self.pcnt_motion).max(0.0)
  }
}

/// Incremental reader for a stats stream delivered in arbitrary chunks.
#[derive(Debug)]
pub struct StatsDeserializer {
  buffer: [u8; TWOPASS_RECORD_SZ],
  fill: usize,
  header: Option<StatsHeader>,
}

impl Default for StatsDeserializer {
  fn default() -> Self {
    StatsDeserializer { buffer: [0; TWOPASS_RECORD_SZ], fill: 0, header: None }
  }
}

impl StatsDeserializer {
  // Copies bytes from `buf[consumed..]` until the internal buffer holds
  // `goal` bytes. Returns the new consumed position.
  fn buffer_fill(&mut self, buf: &[u8], consumed: usize, goal: usize) -> usize {
    let mut consumed = consumed;
    while self.fill < goal && consumed < buf.len() {
      self.buffer[self.fill] = buf[consumed];
      self.fill += 1;
      consumed += 1;
    }
    consumed
  }

  fn parse_header(&self) -> Result<StatsHeader, Error> {
    if self.buffer[0..4] != TWOPASS_MAGIC {
      return Err(Error::InvalidMagic);
    }
    let word = |i: usize| {
      let mut b = [0u8; 4];
      b.copy_from_slice(&self.buffer[i..i + 4]);
      u32::from_le_bytes(b)
    };
    let version = word(4);
    if version != TWOPASS_VERSION {
      return Err(Error::InvalidVersion(version));
    }
    let header = StatsHeader { width: word(8), height: word(12) };
    if header.width == 0 || header.height == 0 {
      return Err(Error::Corrupted("zero frame dimension".to_string()));
    }
    Ok(header)
  }

  /// Consumes `data`, appending every completed record to `out`.
  ///
  /// # Errors
  ///
  /// Returns an error for a bad header or a corrupt record.
  pub fn push(
    &mut self, data: &[u8], out: &mut Vec<FirstPassStats>,
  ) -> Result<(), Error> {
    let mut consumed = 0;
    while consumed < data.len() {
      if self.header.is_none() {
        consumed = self.buffer_fill(data, consumed, TWOPASS_HEADER_SZ);
        if self.fill < TWOPASS_HEADER_SZ {
          break;
        }
        self.header = Some(self.parse_header()?);
        self.fill = 0;
        continue;
      }
      consumed = self.buffer_fill(data, consumed, TWOPASS_RECORD_SZ);
      if self.fill < TWOPASS_RECORD_SZ {
        break;
      }
      out.push(FirstPassStats::from_bytes(&self.buffer)?);
      self.fill = 0;
    }
    Ok(())
  }

  /// Ends the stream.
  ///
  /// # Errors
  ///
  /// Returns `Error::Truncated` if a partial header or record is left.
  pub fn finish(self) -> Result<StatsHeader, Error> {
    match self.header {
      Some(header) if self.fill == 0 => Ok(header),
      _ => Err(Error::Truncated(self.fill)),
    }
  }
}

/// Second pass boost decisions derived from first pass statistics.
#[derive(Debug, Clone)]
pub struct TwoPassStats {
  header: StatsHeader,
  frames: Box<[FirstPassStats]>,
  mean_coded_error: f64,
}

impl TwoPassStats {
  /// Parses a complete stats stream.
  ///
  /// # Errors
  ///
  /// Returns an error for a malformed stream or one without frames.
  pub fn from_slice(data: &[u8]) -> Result<Self, Error> {
    let mut de = StatsDeserializer::default();
    let mut frames = Vec::new();
    de.push(data, &mut frames)?;
    let header = de.finish()?;
    Self::new(header, frames)
  }

  /// # Errors
  ///
  /// Returns `Error::Corrupted` if `frames` is empty or out of order.
  pub fn new(
    header: StatsHeader, frames: Vec<FirstPassStats>,
  ) -> Result<Self, Error> {
    if frames.is_empty() {
      return Err(Error::Corrupted("no frames".to_string()));
    }
    if frames.iter().enumerate().any(|(i, f)| f.frame != i as u64) {
      return Err(Error::Corrupted("frames out of order".to_string()));
    }
    let mean_coded_error = frames.iter().map(|f| f.coded_error).sum::<f64>()
      / frames.len() as f64;
    Ok(TwoPassStats { header, frames: frames.into(), mean_coded_error })
  }

  pub fn header(&self) -> StatsHeader {
    self.header
  }

  pub fn len(&self) -> usize {
    self.frames.len()
  }

  pub fn is_empty(&self) -> bool {
    self.frames.is_empty()
  }

  fn range(&self, start: u64, frames: usize) -> &[FirstPassStats] {
    let start = (start as usize).min(self.frames.len());
    let end = start.saturating_add(frames).min(self.frames.len());
    &self.frames[start..end]
  }

  fn frame_boost(f: &FirstPassStats, rmax: f64) -> f64 {
    (IIFACTOR * f.intra_error / f.coded_error.max(1.0)).min(rmax)
  }

  fn decay_rate(f: &FirstPassStats) -> f64 {
    // Motion erodes prediction quality faster than a static background.
    let motion_penalty = 0.5 * f.pcnt_motion * (1.0 - f.zero_motion());
    (f.pcnt_inter - motion_penalty).clamp(0.0, 1.0)
  }

  // Scene cut between `prev` and `cur`, confirmed by `next`.
  fn is_scene_cut(
    prev: &FirstPassStats, cur: &FirstPassStats, next: Option<&FirstPassStats>,
  ) -> bool {
    if cur.pcnt_second_ref >= 0.10
      || next.is_some_and(|n| n.pcnt_second_ref >= 0.10)
    {
      return false;
    }
    if cur.pcnt_inter < 0.05 {
      return true;
    }
    let coded = cur.coded_error.max(1.0);
    let intra = cur.intra_error.max(1.0);
    (cur.pcnt_inter - cur.pcnt_neutral) < 0.35
      && cur.intra_error / coded < 2.5
      && ((prev.coded_error - cur.coded_error).abs() / coded > 0.40
        || (prev.intra_error - cur.intra_error).abs() / intra > 0.40
        || next.is_some_and(|n| n.intra_error / n.coded_error.max(1.0) > 3.5))
  }
}

impl StatsPrimitive for TwoPassStats {
  fn kf_group(&self, start: u64, frames: usize) -> KfGroupStats {
    let group = self.range(start, frames);
    if group.is_empty() {
      return KfGroupStats {
        boost: MIN_KF_BOOST,
        zero_motion_pct: 0,
        weight: 1.0,
      };
    }

    let mut decay_accumulator = 1.0;
    let mut boost_score = 0.0;
    for (i, f) in group.iter().enumerate().skip(1) {
      let r = Self::frame_boost(f, KF_RMAX);
      decay_accumulator =
        (decay_accumulator * Self::decay_rate(f)).max(MIN_DECAY_FACTOR);
      let increment = decay_accumulator * r;
      boost_score += increment;
      if i > MIN_GF_INTERVAL && increment < 1.0 {
        break;
      }
    }
    let boost = ((boost_score * 100.0) as u32 >> 4)
      .max(frames as u32 * 3)
      .clamp(MIN_KF_BOOST, MAX_KF_BOOST);

    let zero_motion = group.iter().map(FirstPassStats::zero_motion).sum::<f64>()
      / group.len() as f64;
    let group_error = group.iter().map(|f| f.coded_error).sum::<f64>()
      / group.len() as f64;
    let weight = if self.mean_coded_error > 0.0 {
      (group_error / self.mean_coded_error).clamp(0.5, 2.0)
    } else {
      1.0
    };

    KfGroupStats {
      boost,
      zero_motion_pct: (zero_motion * 100.0).round().clamp(0.0, 100.0) as u32,
      weight,
    }
  }

  fn gf_group(&self, start: u64, max_interval: usize) -> GfGroupStats {
    let max_interval = max_interval.max(1);
    // The group's first frame is the golden frame itself.
    let group = self.range(start + 1, max_interval);
    if group.is_empty() {
      let interval = DEFAULT_GF_INTERVAL.min(max_interval);
      return GfGroupStats {
        interval,
        boost: MIN_GF_BOOST,
        use_alt_ref: false,
      };
    }

    let mut decay_accumulator = 1.0;
    let mut boost_score = 0.0;
    let mut interval = group.len();
    for (i, f) in group.iter().enumerate() {
      let r = Self::frame_boost(f, GF_RMAX);
      decay_accumulator =
        (decay_accumulator * Self::decay_rate(f)).max(MIN_DECAY_FACTOR);
      boost_score += decay_accumulator * r;
      let len = i + 1;
      if len >= MIN_GF_INTERVAL
        && (decay_accumulator < 0.5 || f.pcnt_inter < 0.3)
      {
        interval = len;
        break;
      }
    }
    let boost =
      ((boost_score * 100.0) as u32 >> 4).clamp(MIN_GF_BOOST, MAX_GF_BOOST);
    GfGroupStats {
      interval,
      boost,
      use_alt_ref: interval >= MIN_GF_INTERVAL && boost >= MIN_ARF_BOOST,
    }
  }

  fn frames_to_key(&self, start: u64, max_interval: usize) -> usize {
    let frames = self.range(start, max_interval + 1);
    let next = frames.iter().skip(2).map(Some).chain(iter::once(None));
    frames
      .iter()
      .tuple_windows()
      .zip(next)
      .position(|((prev, cur), next)| Self::is_scene_cut(prev, cur, next))
      .map_or(max_interval, |i| i + 1)
  }
}
