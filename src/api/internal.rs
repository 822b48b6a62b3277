// Copyright (c) 2018-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::mem;
use std::sync::Arc;

use arrayvec::ArrayVec;
use log::{debug, info};

use crate::api::config::{Config, EncoderConfig, RateControlConfig, RateMode};
use crate::api::lookahead::{
  ActiveMap, FrameFlags, LookaheadQueue, PendingFrame,
};
use crate::api::{
  EncoderError, EncoderStatus, FrameParameters, FrameType, InvalidConfig,
  Packet,
};
use crate::encoder::*;
use crate::rate::{FrameRateEstimator, RCState, TICKS_PER_SEC};
use crate::recode::{
  self, CqLimits, InterpFilter, Observation, SearchOutcome, SearchParams,
  FILTERS_TO_SEARCH,
};
use crate::scheduler::{FrameRole, FrameTypeScheduler};
use crate::stats::{mse_to_psnr, DefaultStats, SessionStats, StatsPrimitive};

/// The frame being coded, either popped from the lookahead or borrowed
/// from it as an alt-ref source.
struct CurrentFrame<S> {
  source: Arc<S>,
  input_frameno: u64,
  active_map: Option<Arc<ActiveMap>>,
}

/// Owns every piece of encoder state for one stream.
pub(crate) struct EncodeSession<E: EncodePrimitive, P> {
  pub(crate) config: EncoderConfig,
  rc_config: RateControlConfig,
  primitive: E,
  packer: P,
  pool: FrameBufferPool<E::Recon>,
  ref_map: ReferenceFrameMap,
  lookahead: LookaheadQueue<E::Source>,
  scheduler: FrameTypeScheduler,
  rc_state: RCState,
  frame_rate: FrameRateEstimator,
  filters: ArrayVec<InterpFilter, 4>,
  active_map: Option<Arc<ActiveMap>>,
  /// Size of the first frame; later frames may not exceed it.
  initial_size: Option<(usize, usize)>,
  /// Frames sent so far.
  frame_count: u64,
  /// Shown frames emitted so far.
  output_frameno: u64,
  /// Error of the frame before a forced keyframe.
  ambient_err: Option<u64>,
  next_ref_flags: Option<RefFlags>,
  next_refresh: Option<RefFlags>,
  last_qindex: u8,
  /// Hidden frames waiting for the next shown frame.
  packet_data: Vec<u8>,
  hidden_frames: usize,
  payload: Vec<u8>,
  failure: Option<EncoderError>,
  stats: SessionStats,
}

impl<E: EncodePrimitive, P: BitstreamPacker> EncodeSession<E, P> {
  pub fn new(
    cfg: &Config, mut primitive: E, packer: P,
  ) -> Result<Self, EncoderError> {
    let enc = cfg.enc;
    let mut pool = FrameBufferPool::new(enc.frame_buffers, || {
      primitive.alloc_recon(enc.width, enc.height)
    })?;

    let stats: Box<dyn StatsPrimitive + Send> =
      match &cfg.rate_control.second_pass {
        Some(stats) => Box::new(stats.clone()),
        None => Box::new(DefaultStats::default()),
      };
    let scheduler = FrameTypeScheduler::new(&enc, stats);
    let ref_map = ReferenceFrameMap::new(
      &mut pool,
      scheduler.strategy().map_len(),
      scheduler.strategy().swap_golden(),
    )?;

    let filters = if enc.search_interp_filter {
      FILTERS_TO_SEARCH.into_iter().collect()
    } else {
      [enc.interp_filter].into_iter().collect()
    };

    info!(
      "session {}x{} at {:.3} fps, {:?}, {} frame buffers",
      enc.width,
      enc.height,
      enc.frame_rate(),
      cfg.rate_control.mode,
      enc.frame_buffers
    );

    Ok(EncodeSession {
      config: enc,
      rc_config: cfg.rate_control.clone(),
      primitive,
      packer,
      pool,
      ref_map,
      lookahead: LookaheadQueue::new(enc.lag_in_frames),
      scheduler,
      rc_state: RCState::new(&enc, &cfg.rate_control),
      frame_rate: FrameRateEstimator::default(),
      filters,
      active_map: None,
      initial_size: None,
      frame_count: 0,
      output_frameno: 0,
      ambient_err: None,
      next_ref_flags: None,
      next_refresh: None,
      last_qindex: 0,
      packet_data: Vec::new(),
      hidden_frames: 0,
      payload: Vec::new(),
      failure: None,
      stats: SessionStats::default(),
    })
  }

  fn check_failure(&self) -> Result<(), EncoderStatus> {
    match &self.failure {
      Some(err) => Err(EncoderStatus::Failure(err.clone())),
      None => Ok(()),
    }
  }

  fn fail(&mut self, err: EncoderError) -> EncoderStatus {
    self.failure = Some(err.clone());
    EncoderStatus::Failure(err)
  }

  fn default_timestamps(&self, frameno: u64) -> (i64, i64) {
    let tb = self.config.time_base;
    let step = (TICKS_PER_SEC as u64 * tb.num / tb.den) as i64;
    let start = frameno as i64 * step;
    (start, start + step)
  }

  pub fn send_frame(
    &mut self, source: Arc<E::Source>, params: Option<FrameParameters>,
  ) -> Result<(), EncoderStatus> {
    self.check_failure()?;
    let (width, height) = (source.width(), source.height());
    let (max_width, max_height) = self
      .initial_size
      .unwrap_or((self.config.width, self.config.height));
    if width > max_width || height > max_height {
      let err = EncoderError::DimensionMismatch {
        width,
        height,
        max_width,
        max_height,
      };
      return Err(self.fail(err));
    }
    self.initial_size.get_or_insert((width, height));

    let params = params.unwrap_or_default();
    let (ts_start, ts_end) = params
      .timestamps
      .unwrap_or_else(|| self.default_timestamps(self.frame_count));
    let frame = PendingFrame {
      source,
      input_frameno: self.frame_count,
      ts_start,
      ts_end,
      flags: FrameFlags { force_keyframe: params.force_keyframe },
      active_map: if self.config.active_map {
        self.active_map.clone()
      } else {
        None
      },
      coded_as_alt_ref: false,
    };
    self.lookahead.push(frame).map_err(|(status, _)| status)?;
    self.frame_count += 1;
    Ok(())
  }

  pub fn receive_packet(
    &mut self, flush: bool,
  ) -> Result<Packet, EncoderStatus> {
    self.check_failure()?;
    match self.encode_next(flush) {
      Err(EncoderStatus::Failure(err)) => Err(self.fail(err)),
      other => other,
    }
  }

  fn encode_next(&mut self, flush: bool) -> Result<Packet, EncoderStatus> {
    if self.lookahead.is_empty() {
      return Err(if flush {
        EncoderStatus::LimitReached
      } else {
        EncoderStatus::NeedMoreData
      });
    }
    if !flush && !self.lookahead.is_full() {
      return Err(EncoderStatus::NeedMoreData);
    }

    let mut record_ambient_err = false;
    let (mut role, cur) =
      match self.scheduler.next_alt_ref(self.lookahead.len()) {
        Some(role) => {
          let Some(frame) = self.lookahead.peek(role.source_offset) else {
            return Err(EncoderStatus::NeedMoreData);
          };
          let cur = CurrentFrame {
            source: frame.source.clone(),
            input_frameno: frame.input_frameno,
            active_map: frame.active_map.clone(),
          };
          self.lookahead.mark_alt_ref(role.source_offset);
          (role, cur)
        }
        None => {
          let Some(frame) = self.lookahead.pop(flush) else {
            return Err(EncoderStatus::NeedMoreData);
          };
          let current = self.rc_state.frame_rate();
          if let Some(rate) =
            self.frame_rate.update(frame.ts_start, frame.ts_end, current)
          {
            self.rc_state.new_frame_rate(rate);
          }
          let plan = self
            .scheduler
            .plan_shown(&frame, self.rc_state.max_gf_interval());
          if let Some((stats, frames)) = plan.kf_group {
            self.rc_state.start_kf_group(&stats, frames);
          }
          if let Some(stats) = plan.gf_group {
            self.rc_state.start_gf_group(&stats);
          }
          record_ambient_err = plan.record_ambient_err;
          let cur = CurrentFrame {
            source: frame.source,
            input_frameno: frame.input_frameno,
            active_map: frame.active_map,
          };
          (plan.role, cur)
        }
      };

    if role.frame_type != FrameType::KEY && role.show_frame {
      if let Some(refresh) = self.next_refresh.take() {
        role.refresh = refresh;
      }
    }
    if let Some(entry) = role.alt_ref_entry {
      self.ref_map.set_alt_idx(entry);
    }

    let budget = self.rc_state.compute_target_and_bounds(&role);
    let cq = match self.rc_state.mode() {
      RateMode::ConstrainedQuality { .. } => Some(CqLimits {
        cq_target: self.rc_state.cq_target_quality(),
        cq_level: self.rc_state.cq_level(),
        min_frame_bandwidth: self.rc_state.min_frame_bandwidth(),
      }),
      _ => None,
    };
    let params = SearchParams {
      ambient_err: if role.key_frame_forced { self.ambient_err } else { None },
      cq,
      recode_allowed: self.config.recode.allows(role.frame_type, role.refresh),
      is_src_frame_alt_ref: role.is_src_frame_alt_ref,
      max_recodes: self.config.max_recodes,
      ..SearchParams::from_budget(&budget)
    };

    let inflight = self.pool.acquire_free_slot()?;
    let coded = self.code_frame(&role, &cur, params, &inflight);
    if coded.is_ok() {
      self.ref_map.commit(
        &mut self.pool,
        &inflight,
        role.frame_type,
        role.refresh,
      );
    }
    self.pool.release(inflight);
    let (outcome, data) = coded?;

    let actual_bits = data.len() as i64 * 8;
    self.rc_state.update_after_frame(&role, outcome.q, actual_bits);
    self.scheduler.frame_done(&role);
    if record_ambient_err {
      self.ambient_err = Some(outcome.observation.error);
    }
    self.last_qindex = outcome.q;
    self.stats.record(
      role.frame_type,
      role.show_frame,
      data.len(),
      outcome.q,
      budget.target_bits.max(0) as u64,
      outcome.recodes,
      outcome.state,
    );

    debug!(
      "frame {} {}{}: q {} ({}), {} bits for {} target, {} recodes",
      cur.input_frameno,
      role.frame_type,
      if role.show_frame { "" } else { " (hidden)" },
      outcome.q,
      outcome.state,
      actual_bits,
      budget.target_bits,
      outcome.recodes
    );

    if !role.show_frame {
      self.packet_data.extend_from_slice(&data);
      self.hidden_frames += 1;
      return Err(EncoderStatus::Encoded);
    }

    let samples = (cur.source.width() * cur.source.height()) as u64;
    self.stats.record_error(outcome.observation.error, samples);
    let mut packet_data = mem::take(&mut self.packet_data);
    packet_data.extend_from_slice(&data);
    self.output_frameno += 1;
    Ok(Packet {
      data: packet_data,
      input_frameno: cur.input_frameno,
      frame_type: role.frame_type,
      qindex: outcome.q,
      hidden_frames: mem::take(&mut self.hidden_frames),
      target_bits: budget.target_bits,
      recodes: outcome.recodes,
      search_state: outcome.state,
      psnr: mse_to_psnr(samples, 255.0, outcome.observation.error),
    })
  }

  /// Runs the quantizer search into `inflight` and packs the result.
  fn code_frame(
    &mut self, role: &FrameRole, cur: &CurrentFrame<E::Source>,
    params: SearchParams, inflight: &BufferHandle,
  ) -> Result<(SearchOutcome, Vec<u8>), EncoderError> {
    let roles = self.ref_map.role_slots();
    let allowed = match self.next_ref_flags.take() {
      _ if role.frame_type == FrameType::KEY => RefFlags::NONE,
      Some(flags) => flags,
      None => RefFlags::ALL,
    };
    let usable_refs = self.ref_map.usable_refs(allowed);
    let (width, height) = (cur.source.width(), cur.source.height());
    let refresh_mask =
      self.ref_map.refresh_mask(role.frame_type, role.refresh);
    let ref_slots = self.ref_map.ref_map_indices();
    let header = |qindex: u8, interp_filter: InterpFilter| FrameHeader {
      frame_type: role.frame_type,
      show_frame: role.show_frame,
      qindex,
      interp_filter,
      refresh: role.refresh,
      refresh_mask,
      ref_slots,
      width,
      height,
    };

    let EncodeSession {
      primitive, packer, pool, rc_state, payload, filters, ..
    } = self;
    let mut regulator = rc_state.regulator(role);
    let source = cur.source.as_ref();
    let active_map = cur.active_map.as_deref();

    let outcome =
      recode::search(params, filters, &mut regulator, |qindex, filter| {
        let enc_params = EncodeParams {
          frame_type: role.frame_type,
          qindex,
          interp_filter: filter,
          show_frame: role.show_frame,
          usable_refs,
          active_map,
          is_src_frame_alt_ref: role.is_src_frame_alt_ref,
        };
        let (recon, refs) = pool.split_for_encode(inflight, roles);
        payload.clear();
        let measured =
          primitive.encode_frame(source, &enc_params, &refs, recon, payload)?;
        let bits = match measured.bits {
          Some(bits) => bits,
          None => {
            let sized = packer.pack(&header(qindex, filter), payload, true)?;
            sized.len() as u64 * 8
          }
        };
        Ok(Observation {
          projected_bits: bits as i64,
          error: measured.error,
        })
      })?;

    let data =
      packer.pack(&header(outcome.q, outcome.filter), payload, false)?;
    Ok((outcome, data))
  }

  /// Replaces the activity map attached to frames sent from now on.
  pub fn set_active_map(
    &mut self, rows: usize, cols: usize, map: Option<&[u8]>,
  ) -> Result<(), InvalidConfig> {
    if !self.config.active_map {
      return Err(InvalidConfig::ActiveMapDisabled);
    }
    let (width, height) = self
      .initial_size
      .unwrap_or((self.config.width, self.config.height));
    self.active_map = match map {
      Some(map) => {
        Some(Arc::new(ActiveMap::new(width, height, rows, cols, map)?))
      }
      None => None,
    };
    Ok(())
  }

  /// Limits the references the next frame may predict from.
  pub fn use_as_reference(&mut self, flags: RefFlags) {
    self.next_ref_flags = Some(flags);
  }

  /// Overrides which references the next shown inter frame refreshes.
  pub fn update_reference(&mut self, flags: RefFlags) {
    self.next_refresh = Some(flags);
  }

  pub fn last_qindex(&self) -> u8 {
    self.last_qindex
  }

  pub fn stats(&self) -> &SessionStats {
    &self.stats
  }

  pub fn rc_state(&self) -> &RCState {
    &self.rc_state
  }

  pub fn pool(&self) -> &FrameBufferPool<E::Recon> {
    &self.pool
  }

  pub fn ref_map(&self) -> &ReferenceFrameMap {
    &self.ref_map
  }

  /// Applies new rate and frame type settings mid-stream.
  pub fn change_config(&mut self, cfg: &Config) -> Result<(), InvalidConfig> {
    cfg.validate()?;
    let enc = &cfg.enc;
    if enc.frame_buffers != self.config.frame_buffers {
      return Err(InvalidConfig::FixedSetting("frame_buffers"));
    }
    if enc.multi_arf != self.config.multi_arf {
      return Err(InvalidConfig::FixedSetting("multi_arf"));
    }
    if enc.lag_in_frames != self.config.lag_in_frames {
      return Err(InvalidConfig::FixedSetting("lag_in_frames"));
    }
    self.rc_state.reconfigure(enc, &cfg.rate_control);
    self.scheduler.reconfigure(enc);
    self.filters = if enc.search_interp_filter {
      FILTERS_TO_SEARCH.into_iter().collect()
    } else {
      [enc.interp_filter].into_iter().collect()
    };
    if !enc.active_map {
      self.active_map = None;
    }
    self.config = *enc;
    self.rc_config = cfg.rate_control.clone();
    Ok(())
  }

  pub fn rate_control_config(&self) -> &RateControlConfig {
    &self.rc_config
  }

  pub fn frame_count(&self) -> u64 {
    self.frame_count
  }

  pub fn output_frameno(&self) -> u64 {
    self.output_frameno
  }
}
