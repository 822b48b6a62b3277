// Copyright (c) 2019-2023, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use log::{debug, trace};

use crate::api::config::{EncoderConfig, RateControlConfig, RateMode};
use crate::api::FrameType;
use crate::quantize::{compute_qdelta, qindex_to_q, MinqTables};
use crate::recode::QRegulator;
use crate::scheduler::FrameRole;
use crate::stats::{GfGroupStats, KfGroupStats};
use crate::util::{clamp, mb_count, rescale};

// Frame classes that keep their own rate correction factor.
pub const FRAME_KEY: usize = 0;
pub const FRAME_GOLDEN: usize = 1;
pub const FRAME_INTER: usize = 2;
pub const FRAME_NCLASSES: usize = 3;

/// Bits of headroom added around every frame size target.
pub const FRAME_OVERHEAD_BITS: i64 = 200;

// Bits-per-macroblock values are kept in this fixed point.
const BPER_MB_NORMBITS: u32 = 9;

const MIN_BPB_FACTOR: f64 = 0.005;
const MAX_BPB_FACTOR: f64 = 50.0;

// Timestamps are in units of 1/10_000_000 s.
pub const TICKS_PER_SEC: i64 = 10_000_000;

const MAX_GF_INTERVAL: usize = 16;

/// Boost range over which the minimum quantizer blends between the high
/// motion and the low motion curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
  feature = "serialize",
  derive(serde::Serialize, serde::Deserialize)
)]
pub struct BoostWindow {
  pub low: u32,
  pub high: u32,
}

impl BoostWindow {
  pub const KEY: BoostWindow = BoostWindow { low: 400, high: 5000 };
  pub const GOLDEN: BoostWindow = BoostWindow { low: 400, high: 2000 };
}

/// Lowest quantizer allowed at worst index `q` for a frame with `boost`.
///
/// Above the window the low motion curve applies, below it the high motion
/// one, and inside it the two are linearly blended.
pub fn get_active_quality(
  q: u8, boost: u32, window: BoostWindow, low_motion: &[u8],
  high_motion: &[u8],
) -> u8 {
  let q = q as usize;
  if boost > window.high {
    low_motion[q]
  } else if boost < window.low {
    high_motion[q]
  } else {
    let gap = (window.high - window.low) as i32;
    let offset = (window.high - boost) as i32;
    let qdiff = high_motion[q] as i32 - low_motion[q] as i32;
    let adjustment = (offset * qdiff + (gap >> 1)) / gap;
    (low_motion[q] as i32 + adjustment) as u8
  }
}

/// How aggressively one size observation moves a correction factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Damping {
  /// First recode attempts.
  Light,
  /// Recodes once the search has started to bisect.
  Medium,
  /// The final update once a frame is committed.
  Heavy,
}

impl Damping {
  fn adjustment_limit(self) -> f64 {
    match self {
      Damping::Light => 0.75,
      Damping::Medium => 0.375,
      Damping::Heavy => 0.25,
    }
  }
}

/// Estimated bits per macroblock, in `BPER_MB_NORMBITS` fixed point.
pub fn bits_per_mb(frame_type: FrameType, qindex: u8, factor: f64) -> i64 {
  let q = qindex_to_q(qindex);
  let mut enumerator: i64 =
    if frame_type == FrameType::KEY { 3_000_000 } else { 2_500_000 };
  enumerator += ((enumerator as f64 * q) as i64) >> 12;
  (0.5 + enumerator as f64 * factor / q) as i64
}

pub fn estimate_bits_at_q(
  frame_type: FrameType, qindex: u8, mbs: usize, factor: f64,
) -> i64 {
  (bits_per_mb(frame_type, qindex, factor) * mbs as i64) >> BPER_MB_NORMBITS
}

/// Tracks the frame rate implied by the source timestamps.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameRateEstimator {
  first_ts: Option<i64>,
  last_start: i64,
  last_end: i64,
}

impl FrameRateEstimator {
  /// Feeds one frame's timestamps. Returns the new frame rate when it
  /// should change from `current`.
  pub fn update(
    &mut self, ts_start: i64, ts_end: i64, current: f64,
  ) -> Option<f64> {
    let mut step = 0;
    let this_duration;
    let first = match self.first_ts {
      Some(first) if first != ts_start => {
        let last_duration = self.last_end - self.last_start;
        this_duration = ts_end - self.last_end;
        // Step update when the duration moves by 10%.
        if last_duration != 0 {
          step = (this_duration - last_duration) * 10 / last_duration;
        }
        first
      }
      Some(first) => {
        this_duration = ts_end - ts_start;
        step = 1;
        first
      }
      None => {
        self.first_ts = Some(ts_start);
        this_duration = ts_end - ts_start;
        step = 1;
        ts_start
      }
    };
    self.last_start = ts_start;
    self.last_end = ts_end;

    if this_duration <= 0 {
      return None;
    }
    let ticks = TICKS_PER_SEC as f64;
    if step != 0 {
      return Some(ticks / this_duration as f64);
    }
    // Blend into the average over the last second, or over everything
    // seen so far when that is shorter.
    let interval = ((ts_end - first) as f64).min(ticks);
    let mut avg_duration = ticks / current;
    avg_duration *= interval - avg_duration + this_duration as f64;
    avg_duration /= interval;
    Some(ticks / avg_duration)
  }
}

/// Per-frame size target and quantizer range handed to the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameBudget {
  pub target_bits: i64,
  pub under_shoot_limit: i64,
  pub over_shoot_limit: i64,
  pub q: u8,
  pub q_low: u8,
  pub q_high: u8,
}

pub struct RCState {
  mode: RateMode,
  // Target bit-rate in bits per second.
  target_bandwidth: i64,
  frame_rate: f64,
  av_per_frame_bandwidth: i64,
  min_frame_bandwidth: i64,
  two_pass_vbr_min_section: i64,
  max_intra_bitrate_pct: i64,
  max_gf_interval: usize,
  key_freq: u64,
  play_alternate: bool,
  lag_in_frames: usize,
  // Buffer model, in bits.
  starting_buffer_level: i64,
  optimal_buffer_level: i64,
  maximum_buffer_size: i64,
  // Absolute quantizer limits.
  best_quality: u8,
  worst_quality: u8,
  cq_level: u8,
  // Auto constrained quality level, never below `cq_level`.
  cq_target_quality: u8,
  kf_window: BoostWindow,
  gf_window: BoostWindow,
  small_frame: bool,
  mbs: usize,
  minq: MinqTables,

  bits_off_target: i64,
  buffer_level: i64,
  rolling_target_bits: i64,
  rolling_actual_bits: i64,
  long_rolling_target_bits: i64,
  long_rolling_actual_bits: i64,
  total_actual_bits: i64,
  total_target_vs_actual: i64,
  active_best_quality: u8,
  active_worst_quality: u8,
  rate_correction_factors: [f64; FRAME_NCLASSES],
  last_boosted_qindex: u8,
  avg_frame_qindex: u8,
  last_q: [u8; 2],
  ni_frames: u64,
  tot_q: f64,
  avg_q: f64,
  // Group budgets.
  kf_group_bits: i64,
  kf_bits: i64,
  kf_frames_left: usize,
  kf_boost: u32,
  kf_zero_motion_pct: u32,
  gf_group_bits: i64,
  gf_bits: i64,
  gf_boost: u32,
  this_frame_target: i64,
}

impl std::fmt::Debug for RCState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RCState")
      .field("mode", &self.mode)
      .field("frame_rate", &self.frame_rate)
      .field("buffer_level", &self.buffer_level)
      .field("active_best_quality", &self.active_best_quality)
      .field("active_worst_quality", &self.active_worst_quality)
      .field("rate_correction_factors", &self.rate_correction_factors)
      .finish_non_exhaustive()
  }
}

fn frame_class(role: &FrameRole) -> usize {
  if role.frame_type == FrameType::KEY {
    FRAME_KEY
  } else if role.refresh.golden || role.refresh.alt_ref {
    FRAME_GOLDEN
  } else {
    FRAME_INTER
  }
}

impl RCState {
  pub fn new(enc: &EncoderConfig, rc: &RateControlConfig) -> RCState {
    let worst = enc.worst_quality;
    let mut state = RCState {
      mode: rc.mode,
      target_bandwidth: 0,
      frame_rate: 0.0,
      av_per_frame_bandwidth: 0,
      min_frame_bandwidth: 0,
      two_pass_vbr_min_section: 0,
      max_intra_bitrate_pct: 0,
      max_gf_interval: MAX_GF_INTERVAL,
      key_freq: 0,
      play_alternate: false,
      lag_in_frames: 0,
      starting_buffer_level: 0,
      optimal_buffer_level: 0,
      maximum_buffer_size: 0,
      best_quality: enc.best_quality,
      worst_quality: worst,
      cq_level: worst,
      cq_target_quality: worst,
      kf_window: enc.kf_boost_window,
      gf_window: enc.gf_boost_window,
      small_frame: false,
      mbs: 1,
      minq: MinqTables::new(),
      bits_off_target: 0,
      buffer_level: 0,
      rolling_target_bits: 0,
      rolling_actual_bits: 0,
      long_rolling_target_bits: 0,
      long_rolling_actual_bits: 0,
      total_actual_bits: 0,
      total_target_vs_actual: 0,
      active_best_quality: enc.best_quality,
      active_worst_quality: worst,
      rate_correction_factors: [1.0; FRAME_NCLASSES],
      last_boosted_qindex: worst,
      avg_frame_qindex: worst,
      last_q: [worst; 2],
      ni_frames: 0,
      tot_q: 0.0,
      avg_q: qindex_to_q(worst),
      kf_group_bits: 0,
      kf_bits: 0,
      kf_frames_left: 0,
      kf_boost: 0,
      kf_zero_motion_pct: 0,
      gf_group_bits: 0,
      gf_bits: 0,
      gf_boost: 0,
      this_frame_target: 0,
    };
    state.apply_config(enc, rc);
    state.bits_off_target = state.starting_buffer_level;
    state.buffer_level = state.starting_buffer_level;
    state.rolling_target_bits = state.av_per_frame_bandwidth;
    state.rolling_actual_bits = state.av_per_frame_bandwidth;
    state.long_rolling_target_bits = state.av_per_frame_bandwidth;
    state.long_rolling_actual_bits = state.av_per_frame_bandwidth;
    debug!(
      "rate control: {:?} at {} bps, {:.2} fps, {} bits per frame",
      state.mode,
      state.target_bandwidth,
      state.frame_rate,
      state.av_per_frame_bandwidth
    );
    state
  }

  /// Re-derives bandwidth, buffer levels and quantizer limits after a
  /// configuration change. Learned state is kept; active quantizers and the
  /// buffer are only pulled back inside the new limits.
  pub fn reconfigure(&mut self, enc: &EncoderConfig, rc: &RateControlConfig) {
    self.apply_config(enc, rc);
    self.bits_off_target = self.bits_off_target.min(self.maximum_buffer_size);
    self.buffer_level = self.bits_off_target;
  }

  fn apply_config(&mut self, enc: &EncoderConfig, rc: &RateControlConfig) {
    let bps = rc.bitrate as i64;
    self.mode = rc.mode;
    self.target_bandwidth = bps;
    self.two_pass_vbr_min_section = rc.two_pass_vbr_min_section as i64;
    self.max_intra_bitrate_pct = rc.max_intra_bitrate_pct as i64;
    self.key_freq = enc.max_key_frame_interval;
    self.play_alternate = enc.play_alternate;
    self.lag_in_frames = enc.lag_in_frames;

    self.starting_buffer_level = rescale(rc.starting_buffer_ms, bps, 1000);
    self.optimal_buffer_level = match rc.optimal_buffer_ms {
      0 => bps / 8,
      ms => rescale(ms, bps, 1000),
    };
    self.maximum_buffer_size = match rc.maximum_buffer_ms {
      0 => bps / 8,
      ms => rescale(ms, bps, 1000),
    };

    self.best_quality = enc.best_quality;
    self.worst_quality = enc.worst_quality;
    self.active_worst_quality =
      clamp(self.active_worst_quality, enc.best_quality, enc.worst_quality);
    self.active_best_quality =
      clamp(self.active_best_quality, enc.best_quality, enc.worst_quality);
    self.cq_level = match rc.mode {
      RateMode::ConstrainedQuality { cq_level } => cq_level,
      RateMode::FixedQ { qindex } => qindex,
      _ => enc.worst_quality,
    };
    self.cq_target_quality = self.cq_level;

    self.kf_window = enc.kf_boost_window;
    self.gf_window = enc.gf_boost_window;
    self.small_frame = enc.width * enc.height <= 352 * 288;
    self.mbs = (mb_count(enc.width) * mb_count(enc.height)).max(1);

    self.new_frame_rate(1.0 / enc.time_base.as_f64());
  }

  /// Rederives the per-frame bandwidth for a new frame rate.
  pub fn new_frame_rate(&mut self, frame_rate: f64) {
    let frame_rate = if frame_rate < 0.1 { 30.0 } else { frame_rate };
    self.frame_rate = frame_rate;
    self.av_per_frame_bandwidth =
      (self.target_bandwidth as f64 / frame_rate) as i64;
    self.min_frame_bandwidth = (self.av_per_frame_bandwidth
      * self.two_pass_vbr_min_section
      / 100)
      .max(FRAME_OVERHEAD_BITS);

    let mut max_gf_interval = MAX_GF_INTERVAL;
    // Longest interval for genuinely static scenes.
    let mut static_max = (self.key_freq >> 1) as usize;
    if self.play_alternate && self.lag_in_frames > 0 {
      max_gf_interval = max_gf_interval.min(self.lag_in_frames - 1);
      static_max = static_max.min(self.lag_in_frames - 1);
    }
    self.max_gf_interval = max_gf_interval.min(static_max).max(1);
  }

  pub fn mode(&self) -> RateMode {
    self.mode
  }

  pub fn frame_rate(&self) -> f64 {
    self.frame_rate
  }

  pub fn av_per_frame_bandwidth(&self) -> i64 {
    self.av_per_frame_bandwidth
  }

  pub fn min_frame_bandwidth(&self) -> i64 {
    self.min_frame_bandwidth
  }

  pub fn max_gf_interval(&self) -> usize {
    self.max_gf_interval
  }

  pub fn starting_buffer_level(&self) -> i64 {
    self.starting_buffer_level
  }

  pub fn optimal_buffer_level(&self) -> i64 {
    self.optimal_buffer_level
  }

  pub fn maximum_buffer_size(&self) -> i64 {
    self.maximum_buffer_size
  }

  pub fn buffer_level(&self) -> i64 {
    self.buffer_level
  }

  pub fn best_quality(&self) -> u8 {
    self.best_quality
  }

  pub fn worst_quality(&self) -> u8 {
    self.worst_quality
  }

  pub fn active_best_quality(&self) -> u8 {
    self.active_best_quality
  }

  pub fn active_worst_quality(&self) -> u8 {
    self.active_worst_quality
  }

  pub fn avg_frame_qindex(&self) -> u8 {
    self.avg_frame_qindex
  }

  pub fn last_boosted_qindex(&self) -> u8 {
    self.last_boosted_qindex
  }

  pub fn last_q(&self, frame_type: FrameType) -> u8 {
    self.last_q[frame_type as usize]
  }

  pub fn avg_q(&self) -> f64 {
    self.avg_q
  }

  pub fn cq_level(&self) -> u8 {
    self.cq_level
  }

  pub fn cq_target_quality(&self) -> u8 {
    self.cq_target_quality
  }

  pub fn rate_correction_factor(&self, class: usize) -> f64 {
    self.rate_correction_factors[class]
  }

  pub fn rolling_actual_bits(&self) -> i64 {
    self.rolling_actual_bits
  }

  pub fn rolling_target_bits(&self) -> i64 {
    self.rolling_target_bits
  }

  pub fn long_rolling_actual_bits(&self) -> i64 {
    self.long_rolling_actual_bits
  }

  pub fn long_rolling_target_bits(&self) -> i64 {
    self.long_rolling_target_bits
  }

  pub fn total_actual_bits(&self) -> i64 {
    self.total_actual_bits
  }

  pub fn total_target_vs_actual(&self) -> i64 {
    self.total_target_vs_actual
  }

  pub fn kf_group_bits(&self) -> i64 {
    self.kf_group_bits
  }

  pub fn gf_group_bits(&self) -> i64 {
    self.gf_group_bits
  }

  pub fn this_frame_target(&self) -> i64 {
    self.this_frame_target
  }

  /// Shares out the budget of a new keyframe group of `frames` frames,
  /// keyframe included.
  pub fn start_kf_group(&mut self, stats: &KfGroupStats, frames: usize) {
    let frames = frames.max(1);
    self.kf_boost = stats.boost;
    self.kf_zero_motion_pct = stats.zero_motion_pct;
    self.kf_frames_left = frames - 1;
    self.kf_group_bits = (self.av_per_frame_bandwidth as f64
      * frames as f64
      * stats.weight) as i64;

    let boost = stats.boost.max(100) as i64;
    let denom = boost + 100 * (frames as i64 - 1);
    let mut kf_bits = boost * self.kf_group_bits / denom.max(1);
    if self.max_intra_bitrate_pct > 0 {
      let cap = self.av_per_frame_bandwidth * self.max_intra_bitrate_pct / 100;
      kf_bits = kf_bits.min(cap);
    }
    self.kf_bits = kf_bits.max(self.min_frame_bandwidth);
    self.kf_group_bits = (self.kf_group_bits - self.kf_bits).max(0);

    if let RateMode::ConstrainedQuality { cq_level } = self.mode {
      self.cq_target_quality = cq_level.max(self.estimate_cq());
    }
    debug!(
      "kf group: {} frames, boost {}, {} bits ({} for the keyframe)",
      frames,
      stats.boost,
      self.kf_group_bits + self.kf_bits,
      self.kf_bits
    );
  }

  /// Takes the budget of the next golden frame group out of the keyframe
  /// group.
  pub fn start_gf_group(&mut self, stats: &GfGroupStats) {
    let interval = stats.interval.max(1) as i64;
    let frames_left = (self.kf_frames_left as i64).max(interval);
    self.gf_boost = stats.boost;
    self.gf_group_bits = self.kf_group_bits * interval / frames_left;
    self.kf_group_bits = (self.kf_group_bits - self.gf_group_bits).max(0);

    let boost = stats.boost.max(100) as i64;
    self.gf_bits = (boost * self.gf_group_bits / (boost + 100 * interval))
      .max(self.min_frame_bandwidth);
    self.gf_group_bits = (self.gf_group_bits - self.gf_bits).max(0);
    debug!(
      "gf group: {} frames, boost {}, alt-ref {}, {} bits boosted",
      stats.interval, stats.boost, stats.use_alt_ref, self.gf_bits
    );
  }

  // Quantizer the inter budget of the group would need, for the auto
  // constrained quality level.
  fn estimate_cq(&self) -> u8 {
    let target = self.av_per_frame_bandwidth;
    let factor = self.rate_correction_factors[FRAME_INTER];
    let mbs = self.mbs;
    (self.best_quality..=self.worst_quality)
      .find(|&q| estimate_bits_at_q(FrameType::INTER, q, mbs, factor) <= target)
      .unwrap_or(self.worst_quality)
  }

  /// Bit target for the frame described by `role`.
  pub fn frame_target(&mut self, role: &FrameRole) -> i64 {
    let target = if let RateMode::FixedQ { .. } = self.mode {
      self.av_per_frame_bandwidth
    } else if role.frame_type == FrameType::KEY {
      self.kf_bits
    } else if role.is_src_frame_alt_ref {
      // The alt-ref already paid for this picture.
      0
    } else if role.refresh.alt_ref && !role.show_frame {
      let level = role.arf_level.map_or(0, |l| role.max_arf_level - l);
      self.gf_bits >> level
    } else if role.refresh.golden {
      self.gf_bits
    } else {
      let frames = role.gf_frames_left.max(1) as i64;
      let mut target = self.gf_group_bits / frames;
      if self.mode == RateMode::Cbr {
        let adjust = (self.buffer_level - self.optimal_buffer_level) / 8;
        let bound = target / 2;
        target += clamp(adjust, -bound, bound);
      }
      target
    };
    let min_target =
      self.min_frame_bandwidth.max(self.av_per_frame_bandwidth >> 5);
    self.this_frame_target = target.max(min_target);
    trace!("frame target {} bits", self.this_frame_target);
    self.this_frame_target
  }

  /// Encoded sizes outside `(under, over)` trigger a recode.
  pub fn frame_size_bounds(&self, role: &FrameRole, target: i64) -> (i64, i64) {
    if let RateMode::FixedQ { .. } = self.mode {
      return (0, i64::MAX);
    }
    let (mut under, mut over) = if role.frame_type == FrameType::KEY
      || role.refresh.golden
      || role.refresh.alt_ref
    {
      (target * 7 / 8, target * 9 / 8)
    } else {
      match self.mode {
        RateMode::Cbr | RateMode::ConstrainedQuality { .. } => {
          (target * 2 / 8, target * 11 / 8)
        }
        _ => (target * 5 / 8, target * 11 / 8),
      }
    };
    // Keep a usable range for tiny targets.
    over += FRAME_OVERHEAD_BITS;
    under = (under - FRAME_OVERHEAD_BITS).max(0);
    (under, over.max(1))
  }

  // Buffer driven worst quantizer for constant bitrate.
  fn cbr_active_worst(&self, role: &FrameRole) -> u8 {
    if role.frame_type == FrameType::KEY {
      return self.worst_quality;
    }
    let worst = self.worst_quality as i64;
    let avg = self.avg_frame_qindex as i64;
    let critical_level = self.optimal_buffer_level >> 3;
    let mut active_worst = worst.min(avg * 5 / 4);
    if self.buffer_level > self.optimal_buffer_level {
      // At most ~30% down.
      let max_adjustment_down = active_worst / 3;
      if max_adjustment_down > 0 {
        let step = (self.maximum_buffer_size - self.optimal_buffer_level)
          / max_adjustment_down;
        if step > 0 {
          let excess = self.buffer_level - self.optimal_buffer_level;
          active_worst -= excess / step;
        }
      }
    } else if self.buffer_level > critical_level {
      let step = self.optimal_buffer_level - critical_level;
      if step > 0 {
        let adjustment = (worst - avg)
          * (self.optimal_buffer_level - self.buffer_level)
          / step;
        active_worst = avg + adjustment;
      }
    } else {
      active_worst = worst;
    }
    clamp(active_worst, 0, worst) as u8
  }

  fn qdelta(&self, qstart: f64, qtarget: f64) -> i32 {
    compute_qdelta(self.best_quality, self.worst_quality, qstart, qtarget)
  }

  fn active_best(&self, role: &FrameRole) -> u8 {
    let mut q = self.active_worst_quality;
    let t = &self.minq;
    if role.frame_type == FrameType::KEY {
      if role.key_frame_forced {
        // Stay close to the ambient quality to avoid a visible pop.
        let qindex = self.last_boosted_qindex;
        let last_boosted_q = qindex_to_q(qindex);
        let delta = self.qdelta(last_boosted_q, last_boosted_q * 0.75);
        let best = (qindex as i32 + delta).max(self.best_quality as i32);
        return best as u8;
      }
      let best = get_active_quality(
        q,
        self.kf_boost,
        self.kf_window,
        &t.kf_low_motion,
        &t.kf_high_motion,
      );
      let mut q_adj_factor = 1.0;
      if self.small_frame {
        q_adj_factor -= 0.25;
      }
      q_adj_factor += 0.05 - 0.001 * self.kf_zero_motion_pct as f64;
      let q_val = qindex_to_q(best);
      let delta = self.qdelta(q_val, q_val * q_adj_factor);
      return clamp(best as i32 + delta, 0, 255) as u8;
    }

    let cq = matches!(self.mode, RateMode::ConstrainedQuality { .. });
    if !role.is_src_frame_alt_ref
      && (role.refresh.golden || role.refresh.alt_ref)
    {
      if role.frames_since_key > 1 && self.avg_frame_qindex < q {
        q = self.avg_frame_qindex;
      }
      if cq && q < self.cq_target_quality {
        q = self.cq_target_quality;
      }
      let best = get_active_quality(
        q,
        self.gf_boost,
        self.gf_window,
        &t.gf_low_motion,
        &t.gf_high_motion,
      );
      return if cq { (best as u32 * 15 / 16) as u8 } else { best };
    }

    if let RateMode::FixedQ { qindex } = self.mode {
      return qindex;
    }
    let best = t.inter[q as usize];
    if cq && best < self.cq_target_quality {
      // Strong undershoot lets the user level through.
      if self.rolling_actual_bits < self.min_frame_bandwidth {
        return self.cq_level;
      }
      return self.cq_target_quality;
    }
    best
  }

  /// Sets the active quantizer range for `role` and picks the first
  /// quantizer to try. Returns `(q, q_low, q_high)`.
  pub fn pick_q_and_bounds(&mut self, role: &FrameRole) -> (u8, u8, u8) {
    self.active_worst_quality = match self.mode {
      RateMode::Cbr => self.cbr_active_worst(role),
      _ => self.worst_quality,
    };
    self.active_best_quality = self.active_best(role);

    if self.active_worst_quality > self.worst_quality {
      self.active_worst_quality = self.worst_quality;
    }
    if self.active_best_quality < self.best_quality {
      self.active_best_quality = self.best_quality;
    }
    if self.active_best_quality > self.worst_quality {
      self.active_best_quality = self.worst_quality;
    }
    if self.active_worst_quality < self.active_best_quality {
      self.active_worst_quality = self.active_best_quality;
    }

    let class = frame_class(role);
    let q = if let RateMode::FixedQ { .. } = self.mode {
      self.active_best_quality
    } else if role.frame_type == FrameType::KEY && role.key_frame_forced {
      clamp(
        self.last_boosted_qindex,
        self.active_best_quality,
        self.active_worst_quality,
      )
    } else {
      self.regulate_q(
        class,
        role.frame_type,
        self.this_frame_target,
        self.active_best_quality,
        self.active_worst_quality,
      )
    };

    if let Some(level) = role.arf_level {
      if role.frame_type != FrameType::KEY {
        // Pyramid levels step the quantizer in 20% increments.
        let current_q = qindex_to_q(self.active_worst_quality);
        let depth = (role.max_arf_level - level) as f64;
        let new_q = current_q * (1.0 - 0.2 * depth);
        let q = clamp(
          self.active_worst_quality as i32 + self.qdelta(current_q, new_q),
          self.best_quality as i32,
          self.worst_quality as i32,
        ) as u8;
        return (q, q, q);
      }
    }
    (q, self.active_best_quality, self.active_worst_quality)
  }

  /// Target, size limits and quantizer range for the next frame.
  pub fn compute_target_and_bounds(&mut self, role: &FrameRole) -> FrameBudget {
    let target_bits = self.frame_target(role);
    let (under_shoot_limit, over_shoot_limit) =
      self.frame_size_bounds(role, target_bits);
    let (q, q_low, q_high) = self.pick_q_and_bounds(role);
    trace!(
      "budget {} bits [{}, {}], q {} in [{}, {}]",
      target_bits,
      under_shoot_limit,
      over_shoot_limit,
      q,
      q_low,
      q_high
    );
    FrameBudget {
      target_bits,
      under_shoot_limit,
      over_shoot_limit,
      q,
      q_low,
      q_high,
    }
  }

  /// Quantizer in `best..=worst` whose size estimate is closest to
  /// `target_bits`.
  pub fn regulate_q(
    &self, class: usize, frame_type: FrameType, target_bits: i64, best: u8,
    worst: u8,
  ) -> u8 {
    let factor = self.rate_correction_factors[class];
    let target_bits_per_mb =
      (target_bits << BPER_MB_NORMBITS) / self.mbs as i64;
    let mut q = worst;
    let mut last_error = i64::MAX;
    for i in best..=worst {
      let bits_per_mb_at_q = bits_per_mb(frame_type, i, factor);
      if bits_per_mb_at_q <= target_bits_per_mb {
        q = if target_bits_per_mb - bits_per_mb_at_q <= last_error {
          i
        } else {
          i - 1
        };
        break;
      }
      last_error = bits_per_mb_at_q - target_bits_per_mb;
    }
    q
  }

  /// Moves the correction factor of `class` toward the ratio between the
  /// size seen at `q` and the size the model predicted.
  pub fn update_rate_correction_factor(
    &mut self, class: usize, frame_type: FrameType, q: u8, projected_bits: i64,
    damping: Damping,
  ) {
    let mut factor = self.rate_correction_factors[class];
    let estimate = estimate_bits_at_q(frame_type, q, self.mbs, factor);
    let mut correction = 100;
    if estimate > 0 {
      correction = 100 * projected_bits / estimate;
    }
    let limit = damping.adjustment_limit();
    if correction > 102 {
      let correction = (100.0 + (correction - 100) as f64 * limit) as i64;
      factor = (factor * correction as f64 / 100.0).min(MAX_BPB_FACTOR);
    } else if correction < 99 {
      let correction = (100.0 - (100 - correction) as f64 * limit) as i64;
      factor = (factor * correction as f64 / 100.0).max(MIN_BPB_FACTOR);
    }
    self.rate_correction_factors[class] = factor;
  }

  /// Rate model view for the search of one frame.
  pub fn regulator(&mut self, role: &FrameRole) -> FrameRegulator<'_> {
    let class = frame_class(role);
    FrameRegulator { class, frame_type: role.frame_type, rc: self }
  }

  /// Folds the committed frame into the model.
  pub fn update_after_frame(
    &mut self, role: &FrameRole, qindex: u8, actual_bits: i64,
  ) {
    let class = frame_class(role);
    self.update_rate_correction_factor(
      class,
      role.frame_type,
      qindex,
      actual_bits,
      Damping::Heavy,
    );
    let key = role.frame_type == FrameType::KEY;
    self.last_q[role.frame_type as usize] = qindex;

    if qindex < self.last_boosted_qindex
      || key
      || role.refresh.alt_ref
      || (role.refresh.golden && !role.is_src_frame_alt_ref)
    {
      self.last_boosted_qindex = qindex;
    }
    if !key {
      self.avg_frame_qindex = ((2
        + 3 * self.avg_frame_qindex as u32
        + qindex as u32)
        >> 2) as u8;
    }
    if !key && !role.refresh.golden && !role.refresh.alt_ref {
      self.ni_frames += 1;
      self.tot_q += qindex_to_q(qindex);
      self.avg_q = self.tot_q / self.ni_frames as f64;
    }

    // Hidden frames are pure overhead.
    if role.show_frame {
      self.bits_off_target += self.av_per_frame_bandwidth - actual_bits;
    } else {
      self.bits_off_target -= actual_bits;
    }
    self.bits_off_target = self.bits_off_target.min(self.maximum_buffer_size);

    if !key {
      let target = self.this_frame_target;
      self.rolling_target_bits =
        (self.rolling_target_bits * 3 + target + 2) / 4;
      self.rolling_actual_bits =
        (self.rolling_actual_bits * 3 + actual_bits + 2) / 4;
      self.long_rolling_target_bits =
        (self.long_rolling_target_bits * 31 + target + 16) / 32;
      self.long_rolling_actual_bits =
        (self.long_rolling_actual_bits * 31 + actual_bits + 16) / 32;
    }
    self.total_actual_bits += actual_bits;
    self.total_target_vs_actual += self.this_frame_target - actual_bits;
    self.buffer_level = self.bits_off_target;

    let miss = self.this_frame_target - actual_bits;
    if key {
      self.kf_group_bits = (self.kf_group_bits + miss).max(0);
    } else if role.refresh.golden || role.refresh.alt_ref {
      self.gf_group_bits = (self.gf_group_bits + miss).max(0);
    } else {
      self.gf_group_bits = (self.gf_group_bits - actual_bits).max(0);
    }
    if role.show_frame && !key {
      self.kf_frames_left = self.kf_frames_left.saturating_sub(1);
    }
  }
}

/// [`QRegulator`] backed by the session's rate model for one frame class.
pub struct FrameRegulator<'a> {
  rc: &'a mut RCState,
  class: usize,
  frame_type: FrameType,
}

impl QRegulator for FrameRegulator<'_> {
  fn update_correction(
    &mut self, q: u8, projected_bits: i64, damping: Damping,
  ) {
    self.rc.update_rate_correction_factor(
      self.class,
      self.frame_type,
      q,
      projected_bits,
      damping,
    );
  }

  fn regulate_q(&self, target_bits: i64, best: u8, worst: u8) -> u8 {
    self.rc.regulate_q(self.class, self.frame_type, target_bits, best, worst)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::api::config::{EncoderConfig, RateControlConfig};
  use crate::api::Rational;
  use crate::encoder::RefFlags;
  use quickcheck::quickcheck;

  fn configs(mode: RateMode) -> (EncoderConfig, RateControlConfig) {
    let enc = EncoderConfig {
      width: 352,
      height: 288,
      time_base: Rational::new(1, 30),
      lag_in_frames: 16,
      ..Default::default()
    };
    let rc = RateControlConfig { mode, bitrate: 300_000, ..Default::default() };
    (enc, rc)
  }

  fn inter_role() -> FrameRole {
    FrameRole {
      frame_type: FrameType::INTER,
      show_frame: true,
      refresh: RefFlags::LAST_ONLY,
      is_src_frame_alt_ref: false,
      key_frame_forced: false,
      arf_level: None,
      max_arf_level: 0,
      source_offset: 0,
      gf_frames_left: 4,
      frames_since_key: 3,
      alt_ref_entry: None,
    }
  }

  fn key_role() -> FrameRole {
    FrameRole {
      frame_type: FrameType::KEY,
      refresh: RefFlags::ALL,
      frames_since_key: 0,
      ..inter_role()
    }
  }

  #[test]
  fn buffer_levels_scale_with_bitrate() {
    let (enc, mut rc) = configs(RateMode::Cbr);
    rc.starting_buffer_ms = 4000;
    rc.optimal_buffer_ms = 0;
    rc.maximum_buffer_ms = 6000;
    let state = RCState::new(&enc, &rc);
    assert_eq!(state.starting_buffer_level(), 1_200_000);
    assert_eq!(state.optimal_buffer_level(), 300_000 / 8);
    assert_eq!(state.maximum_buffer_size(), 1_800_000);
    assert_eq!(state.buffer_level(), 1_200_000);
  }

  #[test]
  fn frame_rate_floor_and_gf_interval() {
    let (enc, rc) = configs(RateMode::Vbr);
    let mut state = RCState::new(&enc, &rc);
    assert_eq!(state.av_per_frame_bandwidth(), 10_000);
    assert_eq!(state.min_frame_bandwidth(), FRAME_OVERHEAD_BITS);
    assert_eq!(state.max_gf_interval(), 15);
    state.new_frame_rate(0.0);
    assert_eq!(state.frame_rate(), 30.0);

    let (mut enc, rc) = configs(RateMode::Vbr);
    enc.max_key_frame_interval = 10;
    let state = RCState::new(&enc, &rc);
    assert_eq!(state.max_gf_interval(), 5);
  }

  #[test]
  fn min_section_raises_min_frame_bandwidth() {
    let (enc, mut rc) = configs(RateMode::Vbr);
    rc.two_pass_vbr_min_section = 50;
    let state = RCState::new(&enc, &rc);
    assert_eq!(state.min_frame_bandwidth(), 5_000);
  }

  #[test]
  fn bits_per_mb_falls_with_q() {
    for q in 1..=255u8 {
      assert!(
        bits_per_mb(FrameType::INTER, q, 1.0)
          <= bits_per_mb(FrameType::INTER, q - 1, 1.0)
      );
    }
    assert!(
      bits_per_mb(FrameType::KEY, 100, 1.0)
        > bits_per_mb(FrameType::INTER, 100, 1.0)
    );
  }

  #[test]
  fn regulate_q_stays_in_range() {
    let (enc, rc) = configs(RateMode::Vbr);
    let state = RCState::new(&enc, &rc);
    let huge =
      state.regulate_q(FRAME_INTER, FrameType::INTER, 1 << 40, 20, 200);
    assert_eq!(huge, 20);
    let tiny = state.regulate_q(FRAME_INTER, FrameType::INTER, 1, 20, 200);
    assert_eq!(tiny, 200);
    let mid = state.regulate_q(FRAME_INTER, FrameType::INTER, 10_000, 0, 255);
    assert!(mid > 0 && mid < 255);
    let per_mb = (10_000 << BPER_MB_NORMBITS) / 396;
    assert!(bits_per_mb(FrameType::INTER, mid + 1, 1.0) <= per_mb);
    assert!(bits_per_mb(FrameType::INTER, mid - 1, 1.0) > per_mb);
  }

  #[test]
  fn correction_factor_follows_overshoot() {
    let (enc, rc) = configs(RateMode::Vbr);
    let mut state = RCState::new(&enc, &rc);
    let est = estimate_bits_at_q(FrameType::INTER, 120, 396, 1.0);
    state.update_rate_correction_factor(
      FRAME_INTER,
      FrameType::INTER,
      120,
      est * 2,
      Damping::Light,
    );
    assert_eq!(state.rate_correction_factor(FRAME_INTER), 1.75);
    state.update_rate_correction_factor(
      FRAME_GOLDEN,
      FrameType::INTER,
      120,
      0,
      Damping::Heavy,
    );
    assert_eq!(state.rate_correction_factor(FRAME_GOLDEN), 0.75);
    for _ in 0..200 {
      state.update_rate_correction_factor(
        FRAME_KEY,
        FrameType::KEY,
        120,
        1 << 40,
        Damping::Light,
      );
    }
    assert_eq!(state.rate_correction_factor(FRAME_KEY), MAX_BPB_FACTOR);
  }

  #[test]
  fn active_quality_blends_inside_window() {
    let low = [10u8; 256];
    let high = [50u8; 256];
    let w = BoostWindow::GOLDEN;
    assert_eq!(get_active_quality(100, 5000, w, &low, &high), 10);
    assert_eq!(get_active_quality(100, 100, w, &low, &high), 50);
    assert_eq!(get_active_quality(100, 2000, w, &low, &high), 10);
    assert_eq!(get_active_quality(100, 400, w, &low, &high), 50);
    assert_eq!(get_active_quality(100, 1200, w, &low, &high), 30);
  }

  #[test]
  fn size_bounds_per_frame_class() {
    let (enc, rc) = configs(RateMode::Vbr);
    let state = RCState::new(&enc, &rc);
    assert_eq!(state.frame_size_bounds(&inter_role(), 8000), (4800, 11200));
    assert_eq!(state.frame_size_bounds(&key_role(), 8000), (6800, 9200));
    assert_eq!(state.frame_size_bounds(&inter_role(), 0), (0, 200));

    let (enc, rc) = configs(RateMode::ConstrainedQuality { cq_level: 80 });
    let state = RCState::new(&enc, &rc);
    assert_eq!(state.frame_size_bounds(&inter_role(), 8000), (1800, 11200));

    let (enc, rc) = configs(RateMode::FixedQ { qindex: 60 });
    let state = RCState::new(&enc, &rc);
    assert_eq!(state.frame_size_bounds(&inter_role(), 8000), (0, i64::MAX));
  }

  #[test]
  fn forced_key_stays_near_last_boosted() {
    let (enc, rc) = configs(RateMode::Vbr);
    let mut state = RCState::new(&enc, &rc);
    state.last_boosted_qindex = 100;
    let role = FrameRole { key_frame_forced: true, ..key_role() };
    let (q, q_low, q_high) = state.pick_q_and_bounds(&role);
    assert_eq!(q, 100);
    assert!(q_low < 100);
    assert!(q_high >= 100);
  }

  #[test]
  fn fixed_q_pins_quantizer() {
    let (enc, rc) = configs(RateMode::FixedQ { qindex: 60 });
    let mut state = RCState::new(&enc, &rc);
    let budget = state.compute_target_and_bounds(&inter_role());
    assert_eq!(budget.q, 60);
    assert_eq!(budget.target_bits, state.av_per_frame_bandwidth());
  }

  #[test]
  fn multi_arf_levels_lower_q() {
    let (enc, rc) = configs(RateMode::Vbr);
    let mut state = RCState::new(&enc, &rc);
    let arf = FrameRole {
      show_frame: false,
      refresh: RefFlags { last: false, golden: false, alt_ref: true },
      arf_level: Some(0),
      max_arf_level: 2,
      ..inter_role()
    };
    let (q0, lo, hi) = state.pick_q_and_bounds(&arf);
    assert_eq!((lo, hi), (q0, q0));
    let plain =
      FrameRole { arf_level: Some(2), max_arf_level: 2, ..inter_role() };
    let (q2, _, _) = state.pick_q_and_bounds(&plain);
    assert!(q0 < q2);
  }

  #[test]
  fn shown_and_hidden_frames_move_the_buffer() {
    let (enc, mut rc) = configs(RateMode::Vbr);
    rc.maximum_buffer_ms = 60_000;
    let mut state = RCState::new(&enc, &rc);
    let start = state.buffer_level();
    state.frame_target(&inter_role());
    state.update_after_frame(&inter_role(), 80, 4_000);
    assert_eq!(state.buffer_level(), start + 6_000);
    let hidden = FrameRole {
      show_frame: false,
      refresh: RefFlags { last: false, golden: false, alt_ref: true },
      ..inter_role()
    };
    state.update_after_frame(&hidden, 60, 20_000);
    assert_eq!(state.buffer_level(), start - 14_000);
    assert_eq!(state.total_actual_bits(), 24_000);
    assert_eq!(state.last_boosted_qindex(), 60);
    assert_eq!(state.rolling_actual_bits(), (8_500 * 3 + 20_000 + 2) / 4);
  }

  #[test]
  fn avg_qindex_tracks_inter_frames_only() {
    let (enc, rc) = configs(RateMode::Vbr);
    let mut state = RCState::new(&enc, &rc);
    assert_eq!(state.avg_frame_qindex(), 255);
    state.update_after_frame(&key_role(), 40, 50_000);
    assert_eq!(state.avg_frame_qindex(), 255);
    assert_eq!(state.last_q(FrameType::KEY), 40);
    state.update_after_frame(&inter_role(), 100, 5_000);
    assert_eq!(state.avg_frame_qindex(), ((2 + 3 * 255 + 100) >> 2) as u8);
    assert_eq!(state.avg_q(), qindex_to_q(100));
  }

  #[test]
  fn group_budgets_follow_boost() {
    let (enc, rc) = configs(RateMode::Vbr);
    let mut state = RCState::new(&enc, &rc);
    let kf = KfGroupStats { boost: 2000, zero_motion_pct: 0, weight: 1.0 };
    state.start_kf_group(&kf, 30);
    let key_target = state.frame_target(&key_role());
    assert_eq!(key_target, 2000 * 300_000 / (2000 + 2900));
    let gf = GfGroupStats { interval: 5, boost: 1000, use_alt_ref: true };
    state.start_gf_group(&gf);
    let inter = state.frame_target(&inter_role());
    assert!(inter > 0 && inter < key_target);
  }

  #[test]
  fn frame_rate_estimator_steps_and_averages() {
    let mut est = FrameRateEstimator::default();
    let d = TICKS_PER_SEC / 30;
    assert_eq!(est.update(0, d, 30.0), Some(TICKS_PER_SEC as f64 / d as f64));
    let steady = est.update(d, 2 * d, 30.0).unwrap();
    assert!((steady - 30.0).abs() < 0.1);
    // Doubling the frame duration is a step change.
    let halved = est.update(2 * d, 4 * d, 30.0).unwrap();
    assert!((halved - 15.0).abs() < 0.1);
  }

  quickcheck! {
    fn bounds_are_ordered(
      best: u8, worst: u8, boost: u16, key: bool, forced: bool, avg: u8
    ) -> bool {
      let (mut enc, rc) = configs(RateMode::Vbr);
      enc.best_quality = best.min(worst);
      enc.worst_quality = best.max(worst);
      let mut state = RCState::new(&enc, &rc);
      state.avg_frame_qindex = avg;
      state.last_boosted_qindex = avg;
      let kf = KfGroupStats {
        boost: boost as u32, zero_motion_pct: 50, weight: 1.0
      };
      state.start_kf_group(&kf, 20);
      let role = if key {
        FrameRole { key_frame_forced: forced, ..key_role() }
      } else {
        inter_role()
      };
      let b = state.compute_target_and_bounds(&role);
      enc.best_quality <= b.q_low
        && b.q_low <= b.q
        && b.q <= b.q_high
        && b.q_high <= enc.worst_quality
        && state.active_best_quality() <= state.active_worst_quality()
    }
  }
}
