// Copyright (c) 2020-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! Per-frame quantizer search.
//!
//! [`QuantizerSearch::observe`] is a pure transition: it consumes the size
//! and error of one encode and decides the next quantizer. [`search`] runs
//! it against an encode callback and layers the interpolation filter
//! search on top.

use std::fmt;

use arrayvec::ArrayVec;
use log::{debug, trace};

use crate::api::{EncoderError, FrameType};
use crate::encoder::RefFlags;
use crate::quantize::{rd_cost, rd_mult, RD_DIV};
use crate::rate::{Damping, FrameBudget};
use crate::util::clamp;

/// Recodes allowed in each direction before a frame is accepted as is.
pub const DEFAULT_MAX_RECODES: u32 = 10;

// Inner regulation attempts per recode.
const MAX_REGULATE_RETRIES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchState {
  Searching,
  Converged,
  /// The recode budget ran out; the last encode is kept.
  AbortedNonconvergent,
}

impl fmt::Display for SearchState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      SearchState::Searching => "searching",
      SearchState::Converged => "converged",
      SearchState::AbortedNonconvergent => "aborted",
    })
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(
  feature = "serialize",
  derive(serde::Serialize, serde::Deserialize)
)]
pub enum InterpFilter {
  #[default]
  EightTap,
  EightTapSharp,
  EightTapSmooth,
  Switchable,
}

/// Candidates tried, in order, when filter search is enabled.
pub const FILTERS_TO_SEARCH: [InterpFilter; 4] = [
  InterpFilter::EightTap,
  InterpFilter::EightTapSharp,
  InterpFilter::EightTapSmooth,
  InterpFilter::Switchable,
];

/// Which frames may be re-encoded to hit their size target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(
  feature = "serialize",
  derive(serde::Serialize, serde::Deserialize)
)]
pub enum RecodeMode {
  Never,
  KeyFramesOnly,
  KeyGoldenAltRef,
  #[default]
  Always,
}

impl RecodeMode {
  pub fn allows(self, frame_type: FrameType, refresh: RefFlags) -> bool {
    let key = frame_type == FrameType::KEY;
    match self {
      RecodeMode::Never => false,
      RecodeMode::KeyFramesOnly => key,
      RecodeMode::KeyGoldenAltRef => key || refresh.golden || refresh.alt_ref,
      RecodeMode::Always => true,
    }
  }
}

/// Constrained quality floor for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CqLimits {
  /// Automatic level the floor normally sits at.
  pub cq_target: u8,
  /// User level the floor drops to under severe undershoot.
  pub cq_level: u8,
  pub min_frame_bandwidth: i64,
}

/// Inputs of one frame's search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchParams {
  pub q: u8,
  pub q_low: u8,
  pub q_high: u8,
  pub target_bits: i64,
  pub under_shoot_limit: i64,
  pub over_shoot_limit: i64,
  /// Reconstruction error of the frame before a forced keyframe. When set,
  /// the keyframe is matched to it instead of to its size target.
  pub ambient_err: Option<u64>,
  pub cq: Option<CqLimits>,
  pub recode_allowed: bool,
  /// Alt-ref overlays are never recoded.
  pub is_src_frame_alt_ref: bool,
  pub max_recodes: u32,
}

impl SearchParams {
  pub fn from_budget(budget: &FrameBudget) -> Self {
    SearchParams {
      q: budget.q,
      q_low: budget.q_low,
      q_high: budget.q_high,
      target_bits: budget.target_bits,
      under_shoot_limit: budget.under_shoot_limit,
      over_shoot_limit: budget.over_shoot_limit,
      ambient_err: None,
      cq: None,
      recode_allowed: true,
      is_src_frame_alt_ref: false,
      max_recodes: DEFAULT_MAX_RECODES,
    }
  }
}

/// What one encode measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Observation {
  pub projected_bits: i64,
  /// Luma squared error of the reconstruction.
  pub error: u64,
}

/// Rate model consulted while searching.
pub trait QRegulator {
  /// Learns from `projected_bits` spent at quantizer `q`.
  fn update_correction(&mut self, q: u8, projected_bits: i64, damping: Damping);

  /// Quantizer in `best..=worst` expected to spend closest to
  /// `target_bits`.
  fn regulate_q(&self, target_bits: i64, best: u8, worst: u8) -> u8;
}

/// Result of one [`QuantizerSearch::observe`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
  pub state: SearchState,
  pub q: u8,
  pub q_low: u8,
  pub q_high: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
  Up,
  Down,
}

/// State of the encode, measure and adjust loop for one frame.
#[derive(Debug, Clone)]
pub struct QuantizerSearch {
  params: SearchParams,
  state: SearchState,
  q: u8,
  q_low: u8,
  q_high: u8,
  // Floor used when regulating; constrained quality may lower it once.
  active_best: u8,
  overshoot_seen: bool,
  undershoot_seen: bool,
  loop_count: u32,
  recodes_up: u32,
  recodes_down: u32,
}

impl QuantizerSearch {
  pub fn new(params: SearchParams) -> Self {
    debug_assert!(params.q_low <= params.q_high);
    let q = clamp(params.q, params.q_low, params.q_high);
    QuantizerSearch {
      params,
      state: SearchState::Searching,
      q,
      q_low: params.q_low,
      q_high: params.q_high,
      active_best: params.q_low,
      overshoot_seen: false,
      undershoot_seen: false,
      loop_count: 0,
      recodes_up: 0,
      recodes_down: 0,
    }
  }

  /// Starts over from the initial quantizer and bounds.
  pub fn restart(&mut self) {
    *self = QuantizerSearch::new(self.params);
  }

  pub fn state(&self) -> SearchState {
    self.state
  }

  /// Quantizer for the next encode, or of the accepted one once the search
  /// has ended.
  pub fn q(&self) -> u8 {
    self.q
  }

  pub fn q_low(&self) -> u8 {
    self.q_low
  }

  pub fn q_high(&self) -> u8 {
    self.q_high
  }

  pub fn loop_count(&self) -> u32 {
    self.loop_count
  }

  pub fn recodes(&self) -> u32 {
    self.recodes_up + self.recodes_down
  }

  fn transition(&self) -> Transition {
    Transition {
      state: self.state,
      q: self.q,
      q_low: self.q_low,
      q_high: self.q_high,
    }
  }

  fn recode_loop_test(&mut self, projected: i64) -> bool {
    let p = &self.params;
    if !p.recode_allowed {
      return false;
    }
    let q = self.q;
    if (projected > p.over_shoot_limit && q < p.q_high)
      || (projected < p.under_shoot_limit && q > p.q_low)
    {
      return true;
    }
    if let Some(cq) = p.cq {
      if q > cq.cq_target && projected < (p.target_bits * 7) >> 3 {
        return true;
      }
      if q > cq.cq_level
        && projected < cq.min_frame_bandwidth
        && self.active_best > cq.cq_level
      {
        // Severe undershoot: let the floor drop to the user level.
        self.active_best = cq.cq_level;
        return true;
      }
    }
    false
  }

  // Still outside the size band with q at the outer limit it would have to
  // move past.
  fn pinned_outside_band(&self, projected: i64) -> bool {
    let p = &self.params;
    if !p.recode_allowed || p.is_src_frame_alt_ref || p.ambient_err.is_some()
    {
      return false;
    }
    (projected > p.over_shoot_limit && self.q >= p.q_high)
      || (projected < p.under_shoot_limit && self.q <= p.q_low)
  }

  // Forced keyframe: match the reconstruction error of the frames before
  // it rather than the size target.
  fn match_key_frame(&mut self, ambient_err: u64, obs: &Observation) {
    let over = self.params.over_shoot_limit.max(1);
    let under = self.params.under_shoot_limit;
    let projected = obs.projected_bits;
    let high_err_target = ambient_err as f64;
    let low_err_target = (ambient_err >> 1) as f64;
    let kf_err = obs.error.max(1) as f64;

    let q = self.q as f64;
    let mut new_q = q;
    if (kf_err > high_err_target && projected <= over)
      || (kf_err > low_err_target && projected <= under)
    {
      self.q_high = if self.q > self.q_low { self.q - 1 } else { self.q_low };
      let mid = (self.q_high as f64 + self.q_low as f64) / 2.0;
      new_q = (q * high_err_target / kf_err).min(mid);
    } else if kf_err < low_err_target && projected >= under {
      self.q_low = if self.q < self.q_high { self.q + 1 } else { self.q_high };
      let mid = (self.q_high as f64 + self.q_low as f64 + 1.0) / 2.0;
      new_q = (q * low_err_target / kf_err).min(mid);
    }
    self.q =
      clamp(new_q.floor(), self.q_low as f64, self.q_high as f64) as u8;
  }

  fn adjust_for_size<R: QRegulator>(
    &mut self, projected: i64, regulator: &mut R,
  ) {
    let p = self.params;
    let bisect = self.loop_count > 1;
    let mut retries = 0;
    if projected > p.target_bits {
      self.q_low = if self.q < self.q_high { self.q + 1 } else { self.q_high };
      if self.undershoot_seen || bisect {
        regulator.update_correction(self.q, projected, Damping::Medium);
        self.q = ((self.q_high as u32 + self.q_low as u32 + 1) / 2) as u8;
      } else {
        regulator.update_correction(self.q, projected, Damping::Light);
        self.q =
          regulator.regulate_q(p.target_bits, self.active_best, p.q_high);
        while self.q < self.q_low && retries < MAX_REGULATE_RETRIES {
          regulator.update_correction(self.q, projected, Damping::Light);
          self.q =
            regulator.regulate_q(p.target_bits, self.active_best, p.q_high);
          retries += 1;
        }
      }
      self.overshoot_seen = true;
    } else {
      self.q_high = if self.q > self.q_low { self.q - 1 } else { self.q_low };
      if self.overshoot_seen || bisect {
        regulator.update_correction(self.q, projected, Damping::Medium);
        self.q = ((self.q_high as u32 + self.q_low as u32) / 2) as u8;
      } else {
        regulator.update_correction(self.q, projected, Damping::Light);
        self.q =
          regulator.regulate_q(p.target_bits, self.active_best, p.q_high);
        // Substantial undershoot with the auto level above the user one.
        if p.cq.is_some() && self.q < self.q_low {
          self.q_low = self.q;
        }
        while self.q > self.q_high && retries < MAX_REGULATE_RETRIES {
          regulator.update_correction(self.q, projected, Damping::Light);
          self.q =
            regulator.regulate_q(p.target_bits, self.active_best, p.q_high);
          retries += 1;
        }
      }
      self.undershoot_seen = true;
    }
    self.q = clamp(self.q, self.q_low, self.q_high);
  }

  /// Feeds the result of encoding at [`q`](Self::q) and picks the next
  /// quantizer.
  ///
  /// Returns `Converged` once the quantizer stops moving, and
  /// `AbortedNonconvergent` when another move would exceed the recode
  /// budget of its direction or the size band is missed with the quantizer
  /// already at the limit it would have to cross. In both cases `q` is the
  /// quantizer of the last encode.
  pub fn observe<R: QRegulator>(
    &mut self, obs: &Observation, regulator: &mut R,
  ) -> Transition {
    debug_assert_eq!(self.state, SearchState::Searching);
    let before = (self.q, self.q_low, self.q_high, self.active_best);
    let last_q = self.q;

    let mut again = if let Some(ambient_err) = self.params.ambient_err {
      self.match_key_frame(ambient_err, obs);
      self.q != last_q
    } else if self.recode_loop_test(obs.projected_bits) {
      self.adjust_for_size(obs.projected_bits, regulator);
      self.q != last_q
    } else {
      false
    };
    if self.params.is_src_frame_alt_ref {
      again = false;
    }
    trace!(
      "search: q {} -> {} in [{}, {}], {} bits (target {}, band {}..{})",
      last_q,
      self.q,
      self.q_low,
      self.q_high,
      obs.projected_bits,
      self.params.target_bits,
      self.params.under_shoot_limit,
      self.params.over_shoot_limit
    );

    if !again {
      (self.q, self.q_low, self.q_high, self.active_best) = before;
      self.state = if self.pinned_outside_band(obs.projected_bits) {
        debug!(
          "size band unreachable at q {}: {} bits against {}..{}",
          self.q,
          obs.projected_bits,
          self.params.under_shoot_limit,
          self.params.over_shoot_limit
        );
        SearchState::AbortedNonconvergent
      } else {
        SearchState::Converged
      };
      return self.transition();
    }

    let direction =
      if self.q > last_q { Direction::Up } else { Direction::Down };
    let used = match direction {
      Direction::Up => &mut self.recodes_up,
      Direction::Down => &mut self.recodes_down,
    };
    if *used >= self.params.max_recodes {
      (self.q, self.q_low, self.q_high, self.active_best) = before;
      self.state = SearchState::AbortedNonconvergent;
      debug!(
        "recode budget spent at q {}: {} bits against target {}",
        self.q, obs.projected_bits, self.params.target_bits
      );
      return self.transition();
    }
    *used += 1;
    self.loop_count += 1;
    self.transition()
  }
}

/// Final choice of a frame's search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SearchOutcome {
  pub q: u8,
  pub filter: InterpFilter,
  pub state: SearchState,
  /// Re-encodes caused by missed size targets.
  pub recodes: u32,
  /// Calls made to the encode callback.
  pub encodes: u32,
  /// Measurement of the accepted encode.
  pub observation: Observation,
}

/// Runs the quantizer search, once per filter in `filters`, encoding with
/// `encode(q, filter)`.
///
/// With more than one filter each candidate gets a full search and the one
/// with the lowest rate-distortion cost wins; the frame is coded once more
/// with it unless it was the last one tried.
///
/// # Errors
///
/// Any error from `encode` is returned immediately.
pub fn search<R, F>(
  params: SearchParams, filters: &[InterpFilter], regulator: &mut R,
  mut encode: F,
) -> Result<SearchOutcome, EncoderError>
where
  R: QRegulator,
  F: FnMut(u8, InterpFilter) -> Result<Observation, EncoderError>,
{
  let mut qs = QuantizerSearch::new(params);
  let searching_filters = filters.len() > 1;
  let mut filter = filters.first().copied().unwrap_or_default();
  let mut costs: ArrayVec<i64, 4> = ArrayVec::new();
  let mut recodes = 0;
  let mut encodes = 0;

  loop {
    let obs = encode(qs.q(), filter)?;
    encodes += 1;
    let step = qs.observe(&obs, regulator);
    if step.state == SearchState::Searching {
      continue;
    }
    recodes += qs.recodes();

    if searching_filters && costs.len() < filters.len() {
      let rate = obs.projected_bits << 8;
      costs.push(rd_cost(rd_mult(step.q), RD_DIV, rate, obs.error as i64));
      if costs.len() < filters.len() {
        filter = filters[costs.len()];
        qs.restart();
        continue;
      }
      let best = costs
        .iter()
        .enumerate()
        .min_by_key(|&(_, &cost)| cost)
        .map_or(0, |(i, _)| i);
      trace!("filter costs {:?}, best {:?}", costs, filters[best]);
      if best != filters.len() - 1 {
        filter = filters[best];
        qs.restart();
        continue;
      }
    }

    return Ok(SearchOutcome {
      q: step.q,
      filter,
      state: step.state,
      recodes,
      encodes,
      observation: obs,
    });
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use quickcheck::{quickcheck, TestResult};

  // Size model the regulator believes in: bits fall as 1/(q + 1).
  struct ModelRegulator {
    factor: f64,
  }

  impl ModelRegulator {
    fn new(factor: f64) -> Self {
      ModelRegulator { factor }
    }

    fn bits(&self, q: u8) -> i64 {
      (self.factor * 1_000_000.0 / (q as f64 + 1.0)) as i64
    }
  }

  impl QRegulator for ModelRegulator {
    fn update_correction(&mut self, q: u8, projected: i64, _: Damping) {
      let ratio = projected as f64 / self.bits(q).max(1) as f64;
      self.factor *= ratio.clamp(0.5, 2.0);
    }

    fn regulate_q(&self, target: i64, best: u8, worst: u8) -> u8 {
      (best..=worst).find(|&q| self.bits(q) <= target).unwrap_or(worst)
    }
  }

  fn params(q: u8, target: i64) -> SearchParams {
    SearchParams {
      q,
      q_low: 0,
      q_high: 255,
      target_bits: target,
      under_shoot_limit: target * 5 / 8 - 200,
      over_shoot_limit: target * 11 / 8 + 200,
      ambient_err: None,
      cq: None,
      recode_allowed: true,
      is_src_frame_alt_ref: false,
      max_recodes: DEFAULT_MAX_RECODES,
    }
  }

  fn obs(bits: i64, error: u64) -> Observation {
    Observation { projected_bits: bits, error }
  }

  #[test]
  fn in_band_frame_converges_at_once() {
    let mut qs = QuantizerSearch::new(params(60, 10_000));
    let mut reg = ModelRegulator::new(0.6);
    let t = qs.observe(&obs(10_500, 0), &mut reg);
    assert_eq!(t.state, SearchState::Converged);
    assert_eq!(t.q, 60);
    assert_eq!(qs.recodes(), 0);
  }

  #[test]
  fn forced_key_lowers_q_when_worse_than_ambient() {
    let p = SearchParams {
      q_low: 10,
      q_high: 120,
      over_shoot_limit: 2_000,
      under_shoot_limit: 800,
      ambient_err: Some(1_000),
      ..params(50, 1_500)
    };
    let mut qs = QuantizerSearch::new(p);
    let mut reg = ModelRegulator::new(1.0);
    let t = qs.observe(&obs(1_600, 1_500), &mut reg);
    assert_eq!(t.state, SearchState::Searching);
    assert_eq!(t.q_high, 49);
    assert!(t.q < 50);
    // 50 * 1000 / 1500 capped at the midpoint of [10, 49].
    assert_eq!(t.q, 29);
  }

  #[test]
  fn forced_key_raises_q_when_much_better() {
    let p = SearchParams {
      q_low: 10,
      q_high: 120,
      over_shoot_limit: 2_000,
      under_shoot_limit: 800,
      ambient_err: Some(1_000),
      ..params(50, 1_500)
    };
    let mut qs = QuantizerSearch::new(p);
    let mut reg = ModelRegulator::new(1.0);
    let t = qs.observe(&obs(1_000, 250), &mut reg);
    assert_eq!(t.q_low, 51);
    // 50 * 500 / 250 = 100, capped at (120 + 51 + 1) / 2.
    assert_eq!(t.q, 86);
    let t = qs.observe(&obs(900, 700), &mut reg);
    assert_eq!(t.state, SearchState::Converged);
    assert_eq!(t.q, 86);
  }

  #[test]
  fn overshoot_then_undershoot_bisects() {
    let mut qs = QuantizerSearch::new(params(40, 10_000));
    let mut reg = ModelRegulator::new(0.41);
    let t = qs.observe(&obs(20_000, 0), &mut reg);
    assert_eq!(t.q_low, 41);
    assert!(t.q >= 41);
    let first = t.q;
    let t = qs.observe(&obs(3_000, 0), &mut reg);
    assert_eq!(t.q_high, first - 1);
    assert_eq!(t.q, ((first as u32 - 1 + 41) / 2) as u8);
  }

  #[test]
  fn overlay_never_recodes() {
    let p = SearchParams { is_src_frame_alt_ref: true, ..params(40, 10_000) };
    let mut qs = QuantizerSearch::new(p);
    let mut reg = ModelRegulator::new(1.0);
    let t = qs.observe(&obs(90_000, 0), &mut reg);
    assert_eq!(t.state, SearchState::Converged);
    assert_eq!(t.q, 40);
  }

  #[test]
  fn recode_disabled_accepts_first_encode() {
    let p = SearchParams { recode_allowed: false, ..params(40, 10_000) };
    let mut qs = QuantizerSearch::new(p);
    let mut reg = ModelRegulator::new(1.0);
    let t = qs.observe(&obs(90_000, 0), &mut reg);
    assert_eq!(t.state, SearchState::Converged);
  }

  #[test]
  fn pinned_quantizer_does_not_recode() {
    let p = SearchParams { q_low: 70, q_high: 70, ..params(70, 10_000) };
    let mut qs = QuantizerSearch::new(p);
    let mut reg = ModelRegulator::new(1.0);
    let t = qs.observe(&obs(90_000, 0), &mut reg);
    assert_eq!(t.state, SearchState::AbortedNonconvergent);
    assert_eq!(t.q, 70);
    assert_eq!(qs.recodes(), 0);
  }

  #[test]
  fn pinned_quantizer_in_band_converges() {
    let p = SearchParams { q_low: 70, q_high: 70, ..params(70, 10_000) };
    let mut qs = QuantizerSearch::new(p);
    let mut reg = ModelRegulator::new(1.0);
    let t = qs.observe(&obs(11_000, 0), &mut reg);
    assert_eq!(t.state, SearchState::Converged);
  }

  #[test]
  fn severe_cq_undershoot_lowers_floor_once() {
    let cq =
      CqLimits { cq_target: 100, cq_level: 40, min_frame_bandwidth: 500 };
    let p = SearchParams {
      q_low: 90,
      under_shoot_limit: 0,
      cq: Some(cq),
      ..params(100, 10_000)
    };
    let mut qs = QuantizerSearch::new(p);
    let mut reg = ModelRegulator::new(0.01);
    let t = qs.observe(&obs(100, 0), &mut reg);
    assert_eq!(t.state, SearchState::Searching);
    // The regulator now may go below the auto level and q_low follows.
    assert!(t.q < 90);
    assert_eq!(t.q_low, t.q);
    assert!(t.q >= 40);
  }

  #[test]
  fn unreachable_target_aborts_after_budget() {
    let p = SearchParams { max_recodes: 4, ..params(40, 10_000) };
    let mut reg = ModelRegulator::new(0.41);
    let mut tried = Vec::new();
    let outcome = search(p, &[InterpFilter::EightTap], &mut reg, |q, _| {
      tried.push(q);
      Ok(obs(15_000, 0))
    })
    .unwrap();
    assert_eq!(outcome.state, SearchState::AbortedNonconvergent);
    assert_eq!(outcome.recodes, 4);
    assert_eq!(outcome.encodes, 5);
    assert_eq!(Some(&outcome.q), tried.last());
    assert!(tried.windows(2).all(|w| w[0] < w[1]));
  }

  #[test]
  fn size_above_target_at_any_q_aborts() {
    // Every encode is half again over target whatever the quantizer.
    let p = params(40, 10_000);
    assert_eq!(p.max_recodes, DEFAULT_MAX_RECODES);
    let mut reg = ModelRegulator::new(0.41);
    let mut tried = Vec::new();
    let outcome = search(p, &[InterpFilter::EightTap], &mut reg, |q, _| {
      tried.push(q);
      Ok(obs(15_000, 0))
    })
    .unwrap();
    assert_eq!(outcome.state, SearchState::AbortedNonconvergent);
    assert!(outcome.recodes <= DEFAULT_MAX_RECODES);
    assert_eq!(outcome.encodes as usize, tried.len());
    assert_eq!(Some(&outcome.q), tried.last());
    assert_eq!(outcome.q, 255);
  }

  // Regulates straight to the worst quantizer.
  struct WorstRegulator;

  impl QRegulator for WorstRegulator {
    fn update_correction(&mut self, _: u8, _: i64, _: Damping) {}

    fn regulate_q(&self, _: i64, _: u8, worst: u8) -> u8 {
      worst
    }
  }

  #[test]
  fn overshoot_at_worst_quantizer_aborts() {
    let mut qs = QuantizerSearch::new(params(40, 10_000));
    let t = qs.observe(&obs(15_000, 0), &mut WorstRegulator);
    assert_eq!(t.state, SearchState::Searching);
    assert_eq!(t.q, 255);
    let t = qs.observe(&obs(15_000, 0), &mut WorstRegulator);
    assert_eq!(t.state, SearchState::AbortedNonconvergent);
    assert_eq!(t.q, 255);
    assert_eq!(qs.recodes(), 1);
  }

  #[test]
  fn encode_errors_propagate() {
    let mut reg = ModelRegulator::new(1.0);
    let err = EncoderError::Primitive("out of scratch memory".into());
    let r = search(
      params(40, 10_000),
      &[InterpFilter::EightTap],
      &mut reg,
      |_, _| Err(err.clone()),
    );
    assert_eq!(r, Err(err));
  }

  #[test]
  fn filter_search_recodes_with_the_cheapest() {
    let mut reg = ModelRegulator::new(1.0);
    let mut seen = Vec::new();
    let p = params(40, 10_000);
    let outcome = search(p, &FILTERS_TO_SEARCH, &mut reg, |_, f| {
      seen.push(f);
      let error = if f == InterpFilter::EightTapSharp { 10 } else { 1_000 };
      Ok(obs(10_000, error))
    })
    .unwrap();
    assert_eq!(outcome.filter, InterpFilter::EightTapSharp);
    assert_eq!(seen.len(), 5);
    assert_eq!(seen[4], InterpFilter::EightTapSharp);
  }

  #[test]
  fn filter_search_keeps_last_candidate() {
    let mut reg = ModelRegulator::new(1.0);
    let mut calls = 0;
    let p = params(40, 10_000);
    let outcome = search(p, &FILTERS_TO_SEARCH, &mut reg, |_, f| {
      calls += 1;
      let error = if f == InterpFilter::Switchable { 10 } else { 1_000 };
      Ok(obs(10_000, error))
    })
    .unwrap();
    assert_eq!(outcome.filter, InterpFilter::Switchable);
    assert_eq!(calls, 4);
  }

  #[test]
  fn recode_modes() {
    let gf = RefFlags { last: false, golden: true, alt_ref: false };
    assert!(!RecodeMode::Never.allows(FrameType::KEY, RefFlags::ALL));
    assert!(RecodeMode::KeyFramesOnly.allows(FrameType::KEY, RefFlags::ALL));
    assert!(!RecodeMode::KeyFramesOnly.allows(FrameType::INTER, gf));
    assert!(RecodeMode::KeyGoldenAltRef.allows(FrameType::INTER, gf));
    let plain = RefFlags::LAST_ONLY;
    assert!(!RecodeMode::KeyGoldenAltRef.allows(FrameType::INTER, plain));
    assert!(RecodeMode::Always.allows(FrameType::INTER, plain));
  }

  quickcheck! {
    fn bounds_hold_after_every_step(
      q: u8, sizes: Vec<u16>, errors: Vec<u16>, forced: bool
    ) -> bool {
      let mut p = params(q, 20_000);
      if forced {
        p.ambient_err = Some(2_000);
      }
      let mut qs = QuantizerSearch::new(p);
      let mut reg = ModelRegulator::new(1.0);
      for (i, &s) in sizes.iter().enumerate() {
        let e = errors.get(i).copied().unwrap_or(0);
        let t = qs.observe(&obs(s as i64 * 2, e as u64), &mut reg);
        if !(t.q_low <= t.q && t.q <= t.q_high) {
          return false;
        }
        if t.state != SearchState::Searching {
          break;
        }
      }
      true
    }

    fn monotonic_sizes_converge(
      start: u8, q_target: u8, slope: u8
    ) -> TestResult {
      let slope = 20 + slope as i64 % 40;
      let size = move |q: u8| slope * (256 - q as i64) + 2_000;
      let mut reg = ModelRegulator::new(0.5);
      let p = params(start, size(q_target));
      let outcome = search(p, &[InterpFilter::EightTap], &mut reg, |q, _| {
        Ok(obs(size(q), 0))
      })
      .unwrap();
      TestResult::from_bool(
        outcome.state == SearchState::Converged
          && outcome.encodes <= 2 * 255 + 3,
      )
    }
  }
}
