// Copyright (c) 2018-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::fmt;

use arrayvec::ArrayVec;
use log::debug;

use crate::api::config::EncoderConfig;
use crate::api::lookahead::PendingFrame;
use crate::api::FrameType;
use crate::encoder::{RefFlags, INTER_REFS};
use crate::stats::{GfGroupStats, KfGroupStats, StatsPrimitive};

/// Most alt-refs coded ahead of one golden frame group.
pub const MAX_ALT_REFS: usize = 2;

/// How the next frame is coded and which references it refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRole {
  pub frame_type: FrameType,
  pub show_frame: bool,
  pub refresh: RefFlags,
  /// Display-order copy of a frame already coded as an alt-ref.
  pub is_src_frame_alt_ref: bool,
  /// Keyframe placed only because the maximum interval was reached.
  pub key_frame_forced: bool,
  /// Pyramid level, for strategies that code several alt-refs.
  pub arf_level: Option<u8>,
  pub max_arf_level: u8,
  /// Position of the source in the lookahead; zero is the head.
  pub source_offset: usize,
  /// Frames left in the golden group, this one included.
  pub gf_frames_left: usize,
  pub frames_since_key: u64,
  /// Map entry ALTREF must resolve to for this frame.
  pub alt_ref_entry: Option<usize>,
}

/// One alt-ref to code right after a golden frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AltRefPlan {
  /// Lookahead offset of the source, counted from the frame after the
  /// golden frame.
  pub offset: usize,
  pub level: u8,
  pub map_entry: Option<usize>,
}

/// Alt-ref layout of a golden frame group.
pub trait GfStrategy: fmt::Debug + Send {
  /// Alt-refs for a group of `interval` frames, in coding order.
  fn alt_refs(&self, interval: usize) -> ArrayVec<AltRefPlan, MAX_ALT_REFS>;

  fn max_arf_level(&self) -> u8;

  /// ALTREF map entry for the frame `pos` frames after the golden frame.
  fn alt_ref_entry(&self, pos: usize, interval: usize) -> Option<usize>;

  /// Whether a plain golden refresh swaps the GOLDEN and ALTREF entries.
  fn swap_golden(&self) -> bool;

  /// Reference map entries the strategy needs.
  fn map_len(&self) -> usize;
}

/// One alt-ref at the end of each group.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleAltRef;

impl GfStrategy for SingleAltRef {
  fn alt_refs(&self, interval: usize) -> ArrayVec<AltRefPlan, MAX_ALT_REFS> {
    let mut plans = ArrayVec::new();
    plans.push(AltRefPlan { offset: interval - 1, level: 0, map_entry: None });
    plans
  }

  fn max_arf_level(&self) -> u8 {
    0
  }

  fn alt_ref_entry(&self, _pos: usize, _interval: usize) -> Option<usize> {
    None
  }

  fn swap_golden(&self) -> bool {
    true
  }

  fn map_len(&self) -> usize {
    INTER_REFS
  }
}

/// A second alt-ref at the middle of long groups, kept in its own map
/// entry. Frames step down in quality by pyramid level.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiAltRef;

impl MultiAltRef {
  const FAR_ENTRY: usize = 2;
  const MID_ENTRY: usize = 3;

  fn mid_offset(interval: usize) -> Option<usize> {
    (interval >= 4).then_some((interval - 1) / 2)
  }
}

impl GfStrategy for MultiAltRef {
  fn alt_refs(&self, interval: usize) -> ArrayVec<AltRefPlan, MAX_ALT_REFS> {
    let mut plans = ArrayVec::new();
    plans.push(AltRefPlan {
      offset: interval - 1,
      level: 0,
      map_entry: Some(Self::FAR_ENTRY),
    });
    if let Some(offset) = Self::mid_offset(interval) {
      plans.push(AltRefPlan {
        offset,
        level: 1,
        map_entry: Some(Self::MID_ENTRY),
      });
    }
    plans
  }

  fn max_arf_level(&self) -> u8 {
    2
  }

  fn alt_ref_entry(&self, pos: usize, interval: usize) -> Option<usize> {
    match Self::mid_offset(interval) {
      Some(mid) if pos <= mid + 1 => Some(Self::MID_ENTRY),
      _ => Some(Self::FAR_ENTRY),
    }
  }

  fn swap_golden(&self) -> bool {
    false
  }

  fn map_len(&self) -> usize {
    INTER_REFS + 1
  }
}

/// Role of a shown frame plus the groups it opens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FramePlan {
  pub role: FrameRole,
  /// Statistics and length of a keyframe group starting here.
  pub kf_group: Option<(KfGroupStats, usize)>,
  pub gf_group: Option<GfGroupStats>,
  /// Last frame before a forced keyframe; its error is the quality the
  /// keyframe aims for.
  pub record_ambient_err: bool,
}

/// Decides each frame's type and reference refreshes.
pub struct FrameTypeScheduler {
  strategy: Box<dyn GfStrategy>,
  stats: Box<dyn StatsPrimitive + Send>,
  auto_key: bool,
  key_freq: usize,
  play_alternate: bool,
  frames_coded: u64,
  frames_since_key: u64,
  frames_since_golden: u64,
  frames_to_key: usize,
  next_key_frame_forced: bool,
  frames_till_gf_update_due: usize,
  gf_interval: usize,
  pending_alt_refs: ArrayVec<AltRefPlan, MAX_ALT_REFS>,
  source_alt_ref_active: bool,
}

impl fmt::Debug for FrameTypeScheduler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FrameTypeScheduler")
      .field("strategy", &self.strategy)
      .field("frames_since_key", &self.frames_since_key)
      .field("frames_since_golden", &self.frames_since_golden)
      .field("frames_till_gf_update_due", &self.frames_till_gf_update_due)
      .field("pending_alt_refs", &self.pending_alt_refs)
      .finish_non_exhaustive()
  }
}

impl FrameTypeScheduler {
  pub fn new(
    config: &EncoderConfig, stats: Box<dyn StatsPrimitive + Send>,
  ) -> Self {
    let strategy: Box<dyn GfStrategy> = if config.multi_arf {
      Box::new(MultiAltRef)
    } else {
      Box::new(SingleAltRef)
    };
    FrameTypeScheduler {
      strategy,
      stats,
      auto_key: config.auto_key,
      key_freq: config.max_key_frame_interval.max(1) as usize,
      play_alternate: config.play_alternate && config.lag_in_frames > 1,
      frames_coded: 0,
      frames_since_key: 0,
      frames_since_golden: 0,
      frames_to_key: 0,
      next_key_frame_forced: false,
      frames_till_gf_update_due: 0,
      gf_interval: 1,
      pending_alt_refs: ArrayVec::new(),
      source_alt_ref_active: false,
    }
  }

  /// Picks up new keyframe and alt-ref settings; counters are kept.
  pub fn reconfigure(&mut self, config: &EncoderConfig) {
    self.auto_key = config.auto_key;
    self.key_freq = config.max_key_frame_interval.max(1) as usize;
    self.play_alternate = config.play_alternate && config.lag_in_frames > 1;
    if !self.play_alternate {
      self.pending_alt_refs.clear();
    }
  }

  pub fn strategy(&self) -> &dyn GfStrategy {
    self.strategy.as_ref()
  }

  pub fn frames_since_key(&self) -> u64 {
    self.frames_since_key
  }

  pub fn frames_since_golden(&self) -> u64 {
    self.frames_since_golden
  }

  pub fn frames_till_gf_update_due(&self) -> usize {
    self.frames_till_gf_update_due
  }

  pub fn source_alt_ref_pending(&self) -> bool {
    !self.pending_alt_refs.is_empty()
  }

  pub fn source_alt_ref_active(&self) -> bool {
    self.source_alt_ref_active
  }

  /// Whether the keyframe that ends the current group is forced by the
  /// interval.
  pub fn next_key_frame_forced(&self) -> bool {
    self.next_key_frame_forced
  }

  /// Role of the pending alt-ref, if one is due and its source is among
  /// the `buffered` frames. A target past the end of a draining queue is
  /// dropped.
  pub fn next_alt_ref(&mut self, buffered: usize) -> Option<FrameRole> {
    let plan = *self.pending_alt_refs.first()?;
    if plan.offset >= buffered {
      debug!("alt-ref at offset {} is past the end of the stream", plan.offset);
      self.pending_alt_refs.clear();
      return None;
    }
    let multi = self.strategy.max_arf_level() > 0;
    Some(FrameRole {
      frame_type: FrameType::INTER,
      show_frame: false,
      refresh: RefFlags { last: false, golden: false, alt_ref: true },
      is_src_frame_alt_ref: false,
      key_frame_forced: false,
      arf_level: multi.then_some(plan.level),
      max_arf_level: self.strategy.max_arf_level(),
      source_offset: plan.offset,
      gf_frames_left: self.frames_till_gf_update_due,
      frames_since_key: self.frames_since_key,
      alt_ref_entry: plan.map_entry,
    })
  }

  /// Plans the head frame of the lookahead, which is about to be shown.
  pub fn plan_shown<S>(
    &mut self, frame: &PendingFrame<S>, max_gf_interval: usize,
  ) -> FramePlan {
    let frameno = frame.input_frameno;
    let first = self.frames_coded == 0;
    let user_forced = frame.flags.force_keyframe;
    let interval_due = self.auto_key && self.frames_to_key == 0;
    let key = first || user_forced || interval_due;

    let mut kf_group = None;
    let mut key_frame_forced = false;
    if key {
      key_frame_forced = interval_due
        && !first
        && !user_forced
        && self.next_key_frame_forced;
      let len = if self.auto_key {
        self.stats.frames_to_key(frameno, self.key_freq).clamp(1, self.key_freq)
      } else {
        self.key_freq
      };
      self.next_key_frame_forced = self.auto_key && len >= self.key_freq;
      self.frames_to_key = len;
      self.frames_since_key = 0;
      self.pending_alt_refs.clear();
      kf_group = Some((self.stats.kf_group(frameno, len), len));
      debug!(
        "keyframe at {}: group of {} frames{}",
        frameno,
        len,
        if key_frame_forced { ", forced" } else { "" }
      );
    }

    // Keyframes are never overlays.
    let overlay = frame.coded_as_alt_ref && !key;
    let golden = key || self.frames_till_gf_update_due == 0;
    let mut gf_group = None;
    if golden {
      let horizon =
        if self.auto_key { self.frames_to_key } else { usize::MAX };
      let max = max_gf_interval.min(horizon).max(1);
      let gf = self.stats.gf_group(frameno, max);
      let mut interval = gf.interval.clamp(1, max);
      let alt_ref = self.play_alternate && gf.use_alt_ref;
      if alt_ref && interval >= horizon {
        // The alt-ref source would be the next keyframe.
        interval = (horizon - 1).max(1);
      }
      self.frames_till_gf_update_due = interval;
      self.gf_interval = interval;
      self.pending_alt_refs.clear();
      if alt_ref && interval > 1 {
        self.pending_alt_refs = self.strategy.alt_refs(interval);
      }
      gf_group = Some(GfGroupStats { interval, ..gf });
    }

    let refresh = if key {
      RefFlags::ALL
    } else {
      RefFlags { last: !overlay, golden, alt_ref: false }
    };
    let pos = self.gf_interval - self.frames_till_gf_update_due;
    let multi = self.strategy.max_arf_level() > 0;
    let role = FrameRole {
      frame_type: if key { FrameType::KEY } else { FrameType::INTER },
      show_frame: true,
      refresh,
      is_src_frame_alt_ref: overlay,
      key_frame_forced,
      arf_level: (multi && !key).then_some(self.strategy.max_arf_level()),
      max_arf_level: self.strategy.max_arf_level(),
      source_offset: 0,
      gf_frames_left: self.frames_till_gf_update_due,
      frames_since_key: self.frames_since_key,
      alt_ref_entry: if key {
        None
      } else {
        self.strategy.alt_ref_entry(pos, self.gf_interval)
      },
    };
    let record_ambient_err =
      !key && self.next_key_frame_forced && self.frames_to_key == 1;
    FramePlan { role, kf_group, gf_group, record_ambient_err }
  }

  /// Advances the counters once the frame in `role` is committed.
  pub fn frame_done(&mut self, role: &FrameRole) {
    self.frames_coded += 1;
    if !role.show_frame {
      if !self.pending_alt_refs.is_empty() {
        self.pending_alt_refs.remove(0);
      }
      self.source_alt_ref_active = true;
      return;
    }
    self.frames_to_key = self.frames_to_key.saturating_sub(1);
    if role.frame_type == FrameType::KEY {
      self.frames_since_key = 0;
    } else {
      self.frames_since_key += 1;
    }
    if role.refresh.golden {
      self.frames_since_golden = 0;
      if self.pending_alt_refs.is_empty() {
        self.source_alt_ref_active = false;
      }
    } else {
      self.frames_since_golden += 1;
    }
    self.frames_till_gf_update_due =
      self.frames_till_gf_update_due.saturating_sub(1);
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::api::lookahead::FrameFlags;
  use crate::stats::DefaultStats;
  use pretty_assertions::assert_eq;
  use std::sync::Arc;

  fn config(key_interval: u64, lag: usize, multi_arf: bool) -> EncoderConfig {
    EncoderConfig {
      max_key_frame_interval: key_interval,
      lag_in_frames: lag,
      multi_arf,
      ..Default::default()
    }
  }

  fn frame(n: u64) -> PendingFrame<()> {
    PendingFrame {
      source: Arc::new(()),
      input_frameno: n,
      ts_start: n as i64,
      ts_end: n as i64 + 1,
      flags: FrameFlags::default(),
      active_map: None,
      coded_as_alt_ref: false,
    }
  }

  fn stats(gf_interval: usize) -> Box<DefaultStats> {
    Box::new(DefaultStats { gf_interval, ..Default::default() })
  }

  #[test]
  fn keyframes_on_interval() {
    let mut s = FrameTypeScheduler::new(&config(4, 0, false), stats(7));
    let mut types = Vec::new();
    for n in 0..5 {
      let plan = s.plan_shown(&frame(n), 16);
      types.push(plan.role.frame_type);
      s.frame_done(&plan.role);
      if plan.role.frame_type == FrameType::KEY {
        assert_eq!(s.frames_since_key(), 0);
      }
    }
    use FrameType::*;
    assert_eq!(types, vec![KEY, INTER, INTER, INTER, KEY]);
  }

  #[test]
  fn only_interval_keyframes_are_forced() {
    let mut s = FrameTypeScheduler::new(&config(3, 0, false), stats(7));
    let mut forced = Vec::new();
    let mut ambient = Vec::new();
    for n in 0..7 {
      let mut f = frame(n);
      f.flags.force_keyframe = n == 5;
      let plan = s.plan_shown(&f, 16);
      forced.push(plan.role.key_frame_forced);
      ambient.push(plan.record_ambient_err);
      s.frame_done(&plan.role);
    }
    // Keys at 0 (first), 3 (interval), 5 (user) and 6 is inter.
    assert_eq!(forced, vec![false, false, false, true, false, false, false]);
    assert_eq!(ambient, vec![false, false, true, false, false, false, false]);
  }

  #[test]
  fn user_flag_forces_a_keyframe() {
    let mut cfg = config(100, 0, false);
    cfg.auto_key = false;
    let mut s = FrameTypeScheduler::new(&cfg, stats(7));
    let plan = s.plan_shown(&frame(0), 16);
    s.frame_done(&plan.role);
    let mut f = frame(1);
    f.flags.force_keyframe = true;
    let plan = s.plan_shown(&f, 16);
    assert_eq!(plan.role.frame_type, FrameType::KEY);
    assert!(!plan.role.key_frame_forced);
    assert!(plan.kf_group.is_some());
  }

  #[test]
  fn golden_refresh_on_interval() {
    let mut s = FrameTypeScheduler::new(&config(100, 0, false), stats(3));
    let mut goldens = Vec::new();
    for n in 0..7 {
      let plan = s.plan_shown(&frame(n), 16);
      goldens.push(plan.role.refresh.golden);
      assert!(!s.source_alt_ref_pending());
      s.frame_done(&plan.role);
    }
    assert_eq!(goldens, vec![true, false, false, true, false, false, true]);
  }

  #[test]
  fn alt_ref_is_coded_hidden_after_golden() {
    let mut s = FrameTypeScheduler::new(&config(100, 8, false), stats(4));
    assert!(s.next_alt_ref(8).is_none());
    let key = s.plan_shown(&frame(0), 7);
    assert_eq!(key.gf_group.map(|g| g.interval), Some(4));
    s.frame_done(&key.role);
    assert_eq!(s.frames_till_gf_update_due(), 3);

    let arf = s.next_alt_ref(8).unwrap();
    assert!(!arf.show_frame);
    assert_eq!(
      arf.refresh,
      RefFlags { last: false, golden: false, alt_ref: true }
    );
    assert_eq!(arf.source_offset, 3);
    s.frame_done(&arf);
    assert!(!s.source_alt_ref_pending());
    assert!(s.source_alt_ref_active());
    assert!(s.next_alt_ref(8).is_none());

    for n in 1..4 {
      let plan = s.plan_shown(&frame(n), 7);
      assert_eq!(plan.role.refresh, RefFlags::LAST_ONLY);
      s.frame_done(&plan.role);
    }
    let mut overlay = frame(4);
    overlay.coded_as_alt_ref = true;
    let plan = s.plan_shown(&overlay, 7);
    assert!(plan.role.is_src_frame_alt_ref);
    assert_eq!(
      plan.role.refresh,
      RefFlags { last: false, golden: true, alt_ref: false }
    );
    assert!(plan.gf_group.is_some());
  }

  #[test]
  fn alt_ref_stops_short_of_the_next_keyframe() {
    let mut s = FrameTypeScheduler::new(&config(8, 16, false), stats(16));
    let key = s.plan_shown(&frame(0), 15);
    assert_eq!(key.gf_group.map(|g| g.interval), Some(7));
    s.frame_done(&key.role);
    let arf = s.next_alt_ref(16).unwrap();
    // Source is frame 7, the last one before the keyframe at 8.
    assert_eq!(arf.source_offset, 6);
    s.frame_done(&arf);

    for n in 1..8 {
      let mut f = frame(n);
      f.coded_as_alt_ref = n == 7;
      let plan = s.plan_shown(&f, 15);
      assert_eq!(plan.role.frame_type, FrameType::INTER);
      assert_eq!(plan.role.is_src_frame_alt_ref, n == 7);
      s.frame_done(&plan.role);
    }
    let plan = s.plan_shown(&frame(8), 15);
    assert_eq!(plan.role.frame_type, FrameType::KEY);
    assert!(!plan.role.is_src_frame_alt_ref);
  }

  #[test]
  fn keyframe_is_never_an_overlay() {
    let mut s = FrameTypeScheduler::new(&config(100, 8, false), stats(4));
    let key = s.plan_shown(&frame(0), 7);
    s.frame_done(&key.role);
    let mut f = frame(1);
    f.coded_as_alt_ref = true;
    f.flags.force_keyframe = true;
    let plan = s.plan_shown(&f, 7);
    assert_eq!(plan.role.frame_type, FrameType::KEY);
    assert!(!plan.role.is_src_frame_alt_ref);
    assert_eq!(plan.role.refresh, RefFlags::ALL);
  }

  #[test]
  fn unreachable_alt_ref_is_dropped() {
    let mut s = FrameTypeScheduler::new(&config(100, 8, false), stats(4));
    let key = s.plan_shown(&frame(0), 7);
    s.frame_done(&key.role);
    assert!(s.next_alt_ref(2).is_none());
    assert!(!s.source_alt_ref_pending());
  }

  #[test]
  fn multi_alt_ref_codes_two_levels() {
    let mut s = FrameTypeScheduler::new(&config(100, 10, true), stats(6));
    assert_eq!(s.strategy().map_len(), 4);
    assert!(!s.strategy().swap_golden());
    let key = s.plan_shown(&frame(0), 9);
    s.frame_done(&key.role);

    let far = s.next_alt_ref(10).unwrap();
    assert_eq!((far.source_offset, far.arf_level), (5, Some(0)));
    assert_eq!(far.alt_ref_entry, Some(2));
    s.frame_done(&far);
    let mid = s.next_alt_ref(10).unwrap();
    assert_eq!((mid.source_offset, mid.arf_level), (2, Some(1)));
    assert_eq!(mid.alt_ref_entry, Some(3));
    s.frame_done(&mid);
    assert!(s.next_alt_ref(10).is_none());

    let entries: Vec<_> = (1..6)
      .map(|n| {
        let plan = s.plan_shown(&frame(n), 9);
        assert_eq!(plan.role.arf_level, Some(2));
        s.frame_done(&plan.role);
        plan.role.alt_ref_entry
      })
      .collect();
    assert_eq!(entries, vec![Some(3), Some(3), Some(3), Some(2), Some(2)]);
  }

  #[test]
  fn gf_interval_never_crosses_the_next_key() {
    let mut s = FrameTypeScheduler::new(&config(5, 0, false), stats(7));
    let plan = s.plan_shown(&frame(0), 16);
    assert_eq!(plan.gf_group.map(|g| g.interval), Some(5));
    assert_eq!(plan.kf_group.map(|(_, len)| len), Some(5));
  }
}
