// Copyright (c) 2018-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use super::*;

use crate::encoder::*;
use crate::recode::SearchState;

use interpolate_name::interpolate_test;
use pretty_assertions::assert_eq;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

#[derive(Debug)]
struct Picture {
  width: usize,
  height: usize,
  /// Payload bytes at quantizer index zero.
  detail: u64,
}

impl SourceFrame for Picture {
  fn width(&self) -> usize {
    self.width
  }

  fn height(&self) -> usize {
    self.height
  }
}

#[derive(Debug, Default, Clone, Copy)]
struct Recon {
  qindex: u8,
  writes: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Call {
  frame_type: FrameType,
  show_frame: bool,
  qindex: u8,
  usable_refs: RefFlags,
  active_mbs: Option<usize>,
  overlay: bool,
  /// Every reference buffer has been written by an earlier encode.
  refs_written: bool,
}

type Log<T> = Rc<RefCell<Vec<T>>>;

#[derive(Default)]
struct MockEncoder {
  calls: Log<Call>,
  fail_alloc: bool,
}

impl EncodePrimitive for MockEncoder {
  type Source = Picture;
  type Recon = Recon;

  fn alloc_recon(
    &mut self, _width: usize, _height: usize,
  ) -> Result<Recon, EncoderError> {
    if self.fail_alloc {
      return Err(EncoderError::AllocationFailed { what: "recon buffer" });
    }
    Ok(Recon::default())
  }

  fn encode_frame(
    &mut self, source: &Picture, params: &EncodeParams,
    refs: &ReferenceSet<Recon>, recon: &mut Recon, output: &mut Vec<u8>,
  ) -> Result<EncodeOutcome, EncoderError> {
    let refs_written = RefFrame::ALL.iter().all(|&r| refs.get(r).writes > 0);
    self.calls.borrow_mut().push(Call {
      frame_type: params.frame_type,
      show_frame: params.show_frame,
      qindex: params.qindex,
      usable_refs: params.usable_refs,
      active_mbs: params.active_map.map(ActiveMap::active_count),
      overlay: params.is_src_frame_alt_ref,
      refs_written,
    });
    let len = source.detail * (256 - params.qindex as u64) / 256 + 1;
    output.extend((0..len).map(|i| i as u8));
    recon.qindex = params.qindex;
    recon.writes += 1;
    let samples = (source.width * source.height) as u64;
    Ok(EncodeOutcome {
      bits: None,
      error: (params.qindex as u64 + 1) * samples / 8,
    })
  }
}

#[derive(Default)]
struct MockPacker {
  headers: Log<FrameHeader>,
}

impl BitstreamPacker for MockPacker {
  fn pack(
    &mut self, header: &FrameHeader, payload: &[u8], dummy: bool,
  ) -> Result<Vec<u8>, EncoderError> {
    if !dummy {
      self.headers.borrow_mut().push(*header);
    }
    let mut data = Vec::with_capacity(payload.len() + 3);
    data.extend([header.frame_type as u8, header.show_frame as u8]);
    data.push(header.qindex);
    data.extend_from_slice(payload);
    Ok(data)
  }
}

struct Harness {
  ctx: Context<MockEncoder, MockPacker>,
  calls: Log<Call>,
  headers: Log<FrameHeader>,
}

fn setup(enc: EncoderConfig, rc: RateControlConfig) -> Harness {
  let encoder = MockEncoder::default();
  let packer = MockPacker::default();
  let calls = encoder.calls.clone();
  let headers = packer.headers.clone();
  let cfg = Config::new().with_encoder_config(enc).with_rate_control(rc);
  let ctx = cfg.new_context(encoder, packer).unwrap();
  Harness { ctx, calls, headers }
}

fn small_config() -> EncoderConfig {
  EncoderConfig { width: 64, height: 64, ..Default::default() }
}

fn picture(width: usize, height: usize) -> Arc<Picture> {
  Arc::new(Picture { width, height, detail: 600 })
}

#[derive(Debug, Default)]
struct Drained {
  packets: Vec<Packet>,
  hidden: usize,
}

fn receive_available<E, P>(ctx: &mut Context<E, P>, out: &mut Drained)
where
  E: EncodePrimitive,
  P: BitstreamPacker,
{
  loop {
    match ctx.receive_packet() {
      Ok(packet) => out.packets.push(packet),
      Err(EncoderStatus::Encoded) => out.hidden += 1,
      Err(EncoderStatus::NeedMoreData) | Err(EncoderStatus::LimitReached) => {
        break
      }
      Err(e) => panic!("unexpected status {:?}", e),
    }
  }
}

fn encode_frames(h: &mut Harness, limit: u64) -> Drained {
  let mut out = Drained::default();
  for _ in 0..limit {
    h.ctx.send_frame(picture(64, 64)).unwrap();
    receive_available(&mut h.ctx, &mut out);
  }
  h.ctx.flush();
  receive_available(&mut h.ctx, &mut out);
  out
}

#[test]
fn keyframes_follow_the_interval() {
  let enc = EncoderConfig {
    max_key_frame_interval: 4,
    lag_in_frames: 0,
    ..small_config()
  };
  let mut h = setup(enc, RateControlConfig::default());
  let out = encode_frames(&mut h, 9);

  let keys: Vec<_> = out
    .packets
    .iter()
    .filter(|p| p.frame_type == FrameType::KEY)
    .map(|p| p.input_frameno)
    .collect();
  assert_eq!(keys, vec![0, 4, 8]);
  assert_eq!(out.hidden, 0);
  assert_eq!(h.ctx.stats().key_frames, 3);
}

#[test]
fn every_frame_comes_out_once_in_order() {
  let enc = EncoderConfig { lag_in_frames: 8, ..small_config() };
  let mut h = setup(enc, RateControlConfig::default());
  let out = encode_frames(&mut h, 20);

  let order: Vec<_> = out.packets.iter().map(|p| p.input_frameno).collect();
  assert_eq!(order, (0..20).collect::<Vec<_>>());
  let merged: usize = out.packets.iter().map(|p| p.hidden_frames).sum();
  assert_eq!(merged, out.hidden);
  assert_eq!(h.ctx.stats().shown_frames, 20);
  assert_eq!(h.ctx.stats().hidden_alt_refs, out.hidden as u64);
  assert_eq!(h.ctx.receive_packet(), Err(EncoderStatus::LimitReached));
}

#[test]
fn alt_ref_rides_with_the_next_packet() {
  let enc = EncoderConfig { lag_in_frames: 8, ..small_config() };
  let mut h = setup(enc, RateControlConfig::default());
  for _ in 0..8 {
    h.ctx.send_frame(picture(64, 64)).unwrap();
  }
  let key = h.ctx.receive_packet().unwrap();
  assert_eq!(key.frame_type, FrameType::KEY);
  assert_eq!(key.hidden_frames, 0);

  // The lookahead refills before the alt-ref target is reachable.
  assert_eq!(h.ctx.receive_packet(), Err(EncoderStatus::NeedMoreData));
  h.ctx.send_frame(picture(64, 64)).unwrap();
  assert_eq!(h.ctx.receive_packet(), Err(EncoderStatus::Encoded));

  {
    let headers = h.headers.borrow();
    let hdr = headers.last().unwrap();
    assert!(!hdr.show_frame);
    assert!(hdr.refresh.alt_ref && !hdr.refresh.last);
  }

  let next = h.ctx.receive_packet().unwrap();
  assert_eq!(next.input_frameno, 1);
  assert_eq!(next.hidden_frames, 1);
  // Hidden frame bytes lead, tagged as not shown.
  assert_eq!(&next.data[..2], &[FrameType::INTER as u8, 0]);
  assert!(next.data.len() > 3);
}

#[test]
fn keyframes_are_not_used_as_alt_refs() {
  let enc = EncoderConfig {
    max_key_frame_interval: 8,
    lag_in_frames: 16,
    ..small_config()
  };
  let mut h = setup(enc, RateControlConfig::default());
  let out = encode_frames(&mut h, 17);

  let keys: Vec<_> = out
    .packets
    .iter()
    .filter(|p| p.frame_type == FrameType::KEY)
    .map(|p| (p.input_frameno, p.hidden_frames))
    .collect();
  assert_eq!(keys, vec![(0, 0), (8, 0), (16, 0)]);
  assert!(out.hidden > 0);

  let calls = h.calls.borrow();
  assert!(calls
    .iter()
    .filter(|c| c.frame_type == FrameType::KEY)
    .all(|c| !c.overlay));
  // Alt-ref sources come back as shown inter overlays.
  let overlays: Vec<_> = calls.iter().filter(|c| c.overlay).collect();
  assert!(!overlays.is_empty());
  assert!(overlays
    .iter()
    .all(|c| c.frame_type == FrameType::INTER && c.show_frame));
}

#[interpolate_test(single_arf, false)]
#[interpolate_test(multi_arf, true)]
fn references_stay_counted(multi_arf: bool) {
  let mut enc =
    EncoderConfig { lag_in_frames: 10, multi_arf, ..small_config() };
  enc.frame_buffers = enc.min_frame_buffers();
  let mut h = setup(enc, RateControlConfig::default());
  let map_len = enc.ref_map_len() as u32;

  let check = |ctx: &Context<MockEncoder, MockPacker>| {
    assert_eq!(ctx.inner.pool().total_refs(), map_len);
    assert!(ctx.inner.pool().free_slots() >= 1);
  };
  check(&h.ctx);

  let mut hidden = 0;
  for n in 0..40 {
    if n < 30 {
      h.ctx.send_frame(picture(64, 64)).unwrap();
    } else {
      h.ctx.flush();
    }
    loop {
      let status = h.ctx.receive_packet();
      check(&h.ctx);
      match status {
        Ok(_) => {}
        Err(EncoderStatus::Encoded) => hidden += 1,
        Err(EncoderStatus::NeedMoreData) | Err(EncoderStatus::LimitReached) => {
          break
        }
        Err(e) => panic!("unexpected status {:?}", e),
      }
    }
  }
  assert!(hidden > 0);
  if multi_arf {
    assert!(hidden > 3);
  }

  let calls = h.calls.borrow();
  assert!(calls
    .iter()
    .filter(|c| c.frame_type == FrameType::INTER)
    .all(|c| c.refs_written));
  assert!(calls
    .iter()
    .filter(|c| c.frame_type == FrameType::KEY)
    .all(|c| c.usable_refs == RefFlags::NONE));
}

#[test]
fn larger_frame_ends_the_session() {
  let mut h = setup(small_config(), RateControlConfig::default());
  h.ctx.send_frame(picture(48, 48)).unwrap();

  let err = EncoderError::DimensionMismatch {
    width: 64,
    height: 48,
    max_width: 48,
    max_height: 48,
  };
  let failure = Err(EncoderStatus::Failure(err));
  assert_eq!(h.ctx.send_frame(picture(64, 48)), failure);
  assert_eq!(h.ctx.send_frame(picture(32, 32)), failure);
  assert_eq!(h.ctx.receive_packet().map(|_| ()), failure);
}

#[test]
fn first_frame_must_fit_the_configured_size() {
  let mut h = setup(small_config(), RateControlConfig::default());
  let status = h.ctx.send_frame(picture(80, 64));
  assert!(matches!(
    status,
    Err(EncoderStatus::Failure(EncoderError::DimensionMismatch {
      max_width: 64,
      ..
    }))
  ));
}

#[test]
fn smaller_frames_are_accepted() {
  let enc = EncoderConfig { lag_in_frames: 0, ..small_config() };
  let mut h = setup(enc, RateControlConfig::default());
  let mut out = Drained::default();
  for size in [64, 48, 32] {
    h.ctx.send_frame(picture(size, size)).unwrap();
    receive_available(&mut h.ctx, &mut out);
  }
  assert_eq!(out.packets.len(), 3);
  let widths: Vec<_> = h.headers.borrow().iter().map(|hdr| hdr.width).collect();
  assert_eq!(widths, vec![64, 48, 32]);
}

#[test]
fn full_lookahead_refuses_frames() {
  let enc = EncoderConfig { lag_in_frames: 2, ..small_config() };
  let mut h = setup(enc, RateControlConfig::default());
  h.ctx.send_frame(picture(64, 64)).unwrap();
  h.ctx.send_frame(picture(64, 64)).unwrap();
  assert_eq!(
    h.ctx.send_frame(picture(64, 64)),
    Err(EncoderStatus::LookaheadFull)
  );
  let packet = h.ctx.receive_packet().unwrap();
  assert_eq!(packet.input_frameno, 0);
  h.ctx.send_frame(picture(64, 64)).unwrap();
}

#[test]
fn flushed_context_takes_no_frames() {
  let mut h = setup(small_config(), RateControlConfig::default());
  h.ctx.send_frame(picture(64, 64)).unwrap();
  h.ctx.send_frame(None).unwrap();
  assert_eq!(
    h.ctx.send_frame(picture(64, 64)),
    Err(EncoderStatus::EnoughData)
  );
  assert!(h.ctx.receive_packet().is_ok());
  assert_eq!(h.ctx.receive_packet(), Err(EncoderStatus::LimitReached));
  assert_eq!(h.ctx.receive_packet(), Err(EncoderStatus::LimitReached));
}

#[test]
fn empty_context_needs_data() {
  let mut h = setup(small_config(), RateControlConfig::default());
  assert_eq!(h.ctx.receive_packet(), Err(EncoderStatus::NeedMoreData));
}

#[test]
fn failed_allocation_is_reported() {
  let encoder = MockEncoder { fail_alloc: true, ..Default::default() };
  let cfg = Config::new().with_encoder_config(small_config());
  let result = cfg.new_context(encoder, MockPacker::default());
  assert!(matches!(
    result,
    Err(EncoderError::AllocationFailed { what: "recon buffer" })
  ));
}

#[test]
fn invalid_config_is_reported() {
  let enc = EncoderConfig { frame_buffers: 2, ..small_config() };
  let cfg = Config::new().with_encoder_config(enc);
  let result =
    cfg.new_context(MockEncoder::default(), MockPacker::default());
  assert!(matches!(
    result,
    Err(EncoderError::Config(InvalidConfig::InvalidFrameBuffers { .. }))
  ));
}

#[test]
fn fixed_q_pins_plain_inter_frames() {
  let enc = EncoderConfig { lag_in_frames: 0, ..small_config() };
  let rc = RateControlConfig::new().with_mode(RateMode::FixedQ { qindex: 60 });
  let mut h = setup(enc, rc);
  encode_frames(&mut h, 6);

  let headers = h.headers.borrow();
  let plain: Vec<_> = headers
    .iter()
    .filter(|hdr| hdr.frame_type == FrameType::INTER && !hdr.refresh.golden)
    .map(|hdr| hdr.qindex)
    .collect();
  assert_eq!(plain, vec![60; 5]);
  // No recodes: one encode per frame.
  assert_eq!(h.calls.borrow().len(), 6);
}

#[test]
fn searches_always_terminate() {
  let enc =
    EncoderConfig { lag_in_frames: 4, max_recodes: 3, ..small_config() };
  let rc = RateControlConfig::new().with_bitrate(64_000);
  let mut h = setup(enc, rc);
  let out = encode_frames(&mut h, 12);

  assert_eq!(out.packets.len(), 12);
  for packet in &out.packets {
    assert_ne!(packet.search_state, SearchState::Searching);
    assert!(packet.recodes <= 2 * 3);
    assert!(packet.psnr > 0.0);
  }
  // Each packet holds the final encode of its shown frame.
  let calls = h.calls.borrow();
  let last_shown = calls.iter().rev().find(|c| c.show_frame).unwrap();
  let last = out.packets.last().unwrap();
  assert_eq!(last.qindex, last_shown.qindex);
  assert_eq!(h.ctx.last_qindex(), last.qindex);
}

#[test]
fn reference_restriction_applies_once() {
  let enc = EncoderConfig { lag_in_frames: 0, ..small_config() };
  let mut h = setup(enc, RateControlConfig::new().with_mode(RateMode::FixedQ {
    qindex: 100,
  }));
  let mut out = Drained::default();
  h.ctx.send_frame(picture(64, 64)).unwrap();
  receive_available(&mut h.ctx, &mut out);

  h.ctx.use_as_reference(RefFlags::LAST_ONLY);
  for _ in 0..2 {
    h.ctx.send_frame(picture(64, 64)).unwrap();
    receive_available(&mut h.ctx, &mut out);
  }
  let refs: Vec<_> = h.calls.borrow().iter().map(|c| c.usable_refs).collect();
  assert_eq!(refs[0], RefFlags::NONE);
  assert_eq!(refs[1], RefFlags::LAST_ONLY);
  assert_ne!(refs[2], RefFlags::LAST_ONLY);
}

#[test]
fn refresh_override_reaches_the_header() {
  let enc = EncoderConfig { lag_in_frames: 0, ..small_config() };
  let mut h = setup(enc, RateControlConfig::default());
  let mut out = Drained::default();
  h.ctx.send_frame(picture(64, 64)).unwrap();
  receive_available(&mut h.ctx, &mut out);

  let golden_only = RefFlags { last: false, golden: true, alt_ref: false };
  h.ctx.update_reference(golden_only);
  h.ctx.send_frame(picture(64, 64)).unwrap();
  receive_available(&mut h.ctx, &mut out);

  let headers = h.headers.borrow();
  assert_eq!(headers[0].refresh, RefFlags::ALL);
  assert_eq!(headers[1].refresh, golden_only);
  assert_eq!(h.ctx.inner.pool().total_refs(), 3);
}

#[test]
fn active_map_is_checked_and_attached() {
  let mut h = setup(small_config(), RateControlConfig::default());
  assert_eq!(
    h.ctx.set_active_map(4, 4, Some(&[1u8; 16][..])),
    Err(InvalidConfig::ActiveMapDisabled)
  );

  let enc = EncoderConfig {
    active_map: true,
    lag_in_frames: 0,
    ..small_config()
  };
  let mut h = setup(enc, RateControlConfig::default());
  assert_eq!(
    h.ctx.set_active_map(3, 4, Some(&[1u8; 12][..])),
    Err(InvalidConfig::InvalidActiveMap { rows: 3, cols: 4 })
  );
  let mut map = [1u8; 16];
  map[..6].fill(0);
  h.ctx.set_active_map(4, 4, Some(&map[..])).unwrap();
  let mut out = Drained::default();
  h.ctx.send_frame(picture(64, 64)).unwrap();
  receive_available(&mut h.ctx, &mut out);
  h.ctx.set_active_map(4, 4, None).unwrap();
  h.ctx.send_frame(picture(64, 64)).unwrap();
  receive_available(&mut h.ctx, &mut out);

  let calls = h.calls.borrow();
  assert_eq!(calls.first().and_then(|c| c.active_mbs), Some(10));
  assert_eq!(calls.last().and_then(|c| c.active_mbs), None);
}

#[test]
fn fixed_settings_cannot_change() {
  let mut h = setup(small_config(), RateControlConfig::default());
  let grown = EncoderConfig { frame_buffers: 6, ..small_config() };
  let cfg = Config::new().with_encoder_config(grown);
  assert_eq!(
    h.ctx.change_config(&cfg),
    Err(InvalidConfig::FixedSetting("frame_buffers"))
  );

  let rc = RateControlConfig::new().with_bitrate(512_000);
  let cfg = Config::new()
    .with_encoder_config(small_config())
    .with_rate_control(rc);
  h.ctx.change_config(&cfg).unwrap();
  assert_eq!(h.ctx.inner.rate_control_config().bitrate, 512_000);
  assert_eq!(*h.ctx.config(), small_config());
}

#[test]
fn random_content_keeps_the_session_consistent() {
  use rand::{Rng, SeedableRng};
  use rand_chacha::ChaChaRng;

  let mut ra = ChaChaRng::from_seed([0; 32]);
  let enc = EncoderConfig { lag_in_frames: 12, ..small_config() };
  let rc = RateControlConfig::new().with_bitrate(200_000);
  let mut h = setup(enc, rc);

  let mut out = Drained::default();
  for _ in 0..40 {
    let detail = ra.gen_range(50..4000);
    let pic = Picture { width: 64, height: 64, detail };
    h.ctx.send_frame(Arc::new(pic)).unwrap();
    receive_available(&mut h.ctx, &mut out);
  }
  h.ctx.flush();
  receive_available(&mut h.ctx, &mut out);

  let order: Vec<_> = out.packets.iter().map(|p| p.input_frameno).collect();
  assert_eq!(order, (0..40).collect::<Vec<_>>());
  assert!(out.packets.iter().all(|p| p.search_state != SearchState::Searching));
  assert_eq!(h.ctx.inner.pool().total_refs(), enc.ref_map_len() as u32);
}
