// Copyright (c) 2019-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

//! A small block coder standing in for the pixel tools.
//!
//! Every 16x16 luma block is predicted either from its mean or from the
//! co-located block of a usable reference, and the residual is scalar
//! quantized with a step that follows the quantizer index.

use crate::decoder::LumaFrame;
use vpxrc::prelude::*;
use vpxrc::quantize::ac_q;
use vpxrc::twopass::FirstPassStats;

const MB_SIZE: usize = 16;
const MAX_LEVEL: i32 = 127;
// First pass motion search offsets, tried on both axes.
const SEARCH_OFFSETS: [isize; 5] = [0, -2, 2, -4, 4];

#[derive(Debug, Clone, Copy)]
struct Block {
  x: usize,
  y: usize,
  w: usize,
  h: usize,
}

impl Block {
  fn grid(width: usize, height: usize) -> impl Iterator<Item = Block> {
    (0..height).step_by(MB_SIZE).flat_map(move |y| {
      (0..width).step_by(MB_SIZE).map(move |x| Block {
        x,
        y,
        w: MB_SIZE.min(width - x),
        h: MB_SIZE.min(height - y),
      })
    })
  }

  fn pixels(self, frame: &LumaFrame) -> impl Iterator<Item = u8> + '_ {
    (self.y..self.y + self.h).flat_map(move |y| {
      frame.row(y)[self.x..self.x + self.w].iter().copied()
    })
  }

  fn mean(self, frame: &LumaFrame) -> u8 {
    let sum: u64 = self.pixels(frame).map(u64::from).sum();
    (sum / (self.w * self.h) as u64) as u8
  }

  fn deviation(self, frame: &LumaFrame, value: u8) -> u64 {
    self.pixels(frame).map(|p| u64::from(p.abs_diff(value))).sum()
  }

  fn sad(self, a: &LumaFrame, b: &LumaFrame) -> u64 {
    moved_sad(a, self, b, self)
  }

  fn shifted(
    self, dx: isize, dy: isize, width: usize, height: usize,
  ) -> Option<Block> {
    let x = self.x.checked_add_signed(dx)?;
    let y = self.y.checked_add_signed(dy)?;
    if x + self.w > width || y + self.h > height {
      return None;
    }
    Some(Block { x, y, ..self })
  }
}

fn same_size(a: &LumaFrame, b: &LumaFrame) -> bool {
  a.width == b.width && a.height == b.height
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
  Intra(u8),
  Inter(RefFrame),
  // Inactive block, LAST is kept as is
  Copy,
}

impl Mode {
  const fn code(self) -> u8 {
    match self {
      Mode::Intra(_) => 0,
      Mode::Inter(RefFrame::Last) => 1,
      Mode::Inter(RefFrame::Golden) => 2,
      Mode::Inter(RefFrame::AltRef) => 3,
      Mode::Copy => 4,
    }
  }
}

fn quantize(residual: i32, step: i32) -> i32 {
  let level = (residual.abs() + step / 2) / step;
  (level * residual.signum()).clamp(-MAX_LEVEL, MAX_LEVEL)
}

#[derive(Debug, Default)]
pub struct ModelEncoder;

impl ModelEncoder {
  fn choose_mode(
    source: &LumaFrame, block: Block, params: &EncodeParams,
    refs: &ReferenceSet<LumaFrame>,
  ) -> Mode {
    let inter = params.frame_type == FrameType::INTER;
    let (mb_row, mb_col) = (block.y / MB_SIZE, block.x / MB_SIZE);
    if let Some(map) = params.active_map.filter(|_| inter) {
      if mb_row < map.rows()
        && mb_col < map.cols()
        && !map.is_active(mb_row, mb_col)
      {
        return Mode::Copy;
      }
    }

    let dc = block.mean(source);
    let mut best = (Mode::Intra(dc), block.deviation(source, dc));
    if !inter {
      return best.0;
    }
    for role in RefFrame::ALL {
      let reference = refs.get(role);
      if !params.usable_refs.contains(role) || !same_size(reference, source)
      {
        continue;
      }
      let cost = block.sad(source, reference);
      if cost < best.1 {
        best = (Mode::Inter(role), cost);
      }
    }
    best.0
  }
}

impl EncodePrimitive for ModelEncoder {
  type Source = LumaFrame;
  type Recon = LumaFrame;

  fn alloc_recon(
    &mut self, width: usize, height: usize,
  ) -> Result<LumaFrame, EncoderError> {
    Ok(LumaFrame::blank(width, height))
  }

  fn encode_frame(
    &mut self, source: &LumaFrame, params: &EncodeParams,
    refs: &ReferenceSet<LumaFrame>, recon: &mut LumaFrame,
    output: &mut Vec<u8>,
  ) -> Result<EncodeOutcome, EncoderError> {
    let (width, height) = (source.width, source.height);
    if !same_size(recon, source) {
      *recon = LumaFrame::blank(width, height);
    }
    let step = i32::from(ac_q(params.qindex) / 8).max(1);
    let mut error = 0u64;
    let mut tokens = Vec::with_capacity(2 * MB_SIZE * MB_SIZE);

    for block in Block::grid(width, height) {
      let mode = Self::choose_mode(source, block, params, refs);
      output.push(mode.code());
      if let Mode::Intra(dc) = mode {
        output.push(dc);
      }

      tokens.clear();
      let mut run = 0usize;
      for y in block.y..block.y + block.h {
        for x in block.x..block.x + block.w {
          let idx = y * width + x;
          let pred = match mode {
            Mode::Intra(dc) => dc,
            Mode::Inter(role) => refs.get(role).data[idx],
            Mode::Copy if same_size(refs.last, source) => {
              refs.last.data[idx]
            }
            Mode::Copy => 128,
          };
          let src = i32::from(source.data[idx]);
          let level = match mode {
            Mode::Copy => 0,
            _ => quantize(src - i32::from(pred), step),
          };
          let rec = (i32::from(pred) + level * step).clamp(0, 255);
          recon.data[idx] = rec as u8;
          error += (src - rec).pow(2) as u64;

          if mode == Mode::Copy {
            continue;
          }
          if level == 0 {
            run += 1;
            continue;
          }
          // (run, level): `run` zero levels followed by `level`; trailing
          // zeros are implied
          while run > usize::from(u8::MAX) {
            tokens.extend([u8::MAX, 0]);
            run -= usize::from(u8::MAX) + 1;
          }
          tokens.extend([run as u8, level as i8 as u8]);
          run = 0;
        }
      }
      if mode != Mode::Copy {
        let count = (tokens.len() / 2) as u16;
        output.extend_from_slice(&count.to_le_bytes());
        output.extend_from_slice(&tokens);
      }
    }

    Ok(EncodeOutcome { bits: None, error })
  }
}

const fn filter_index(filter: InterpFilter) -> u8 {
  match filter {
    InterpFilter::EightTap => 0,
    InterpFilter::EightTapSharp => 1,
    InterpFilter::EightTapSmooth => 2,
    InterpFilter::Switchable => 3,
  }
}

/// Writes a compact frame header ahead of the block payload.
#[derive(Debug, Default)]
pub struct ModelPacker;

impl BitstreamPacker for ModelPacker {
  fn pack(
    &mut self, header: &FrameHeader, payload: &[u8], _dummy: bool,
  ) -> Result<Vec<u8>, EncoderError> {
    let inter = header.frame_type == FrameType::INTER;
    let mut out = Vec::with_capacity(payload.len() + 10);
    out.push(
      0x80
        | (inter as u8) << 4
        | (header.show_frame as u8) << 3
        | filter_index(header.interp_filter),
    );
    out.push(header.qindex);
    if inter {
      out.push(header.refresh_mask);
      let slots = header
        .ref_slots
        .iter()
        .fold(0u16, |acc, &slot| acc << 3 | u16::from(slot & 7));
      out.extend_from_slice(&slots.to_le_bytes());
    } else {
      for dim in [header.width, header.height] {
        let dim = u16::try_from(dim).map_err(|_| {
          EncoderError::Primitive(format!("frame dimension {dim} too large"))
        })?;
        out.extend_from_slice(&dim.to_le_bytes());
      }
    }
    let len = u32::try_from(payload.len()).map_err(|_| {
      EncoderError::Primitive("frame payload too large".to_string())
    })?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
  }
}

/// Measures the statistics a second pass plans with.
#[derive(Debug, Default)]
pub struct FirstPassAnalyzer {
  frames: u64,
  prev: Option<LumaFrame>,
  prev2: Option<LumaFrame>,
}

impl FirstPassAnalyzer {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn frames(&self) -> u64 {
    self.frames
  }

  pub fn analyze(&mut self, frame: LumaFrame) -> FirstPassStats {
    let (width, height) = (frame.width, frame.height);
    let prev = self.prev.as_ref().filter(|p| same_size(p, &frame));
    let prev2 = self.prev2.as_ref().filter(|p| same_size(p, &frame));

    let mut stats = FirstPassStats {
      frame: self.frames,
      duration: 1.0,
      ..Default::default()
    };
    let mut blocks = 0usize;
    let (mut inter, mut motion, mut second, mut neutral) = (0, 0, 0, 0);
    for block in Block::grid(width, height) {
      blocks += 1;
      let intra = block.deviation(&frame, block.mean(&frame));
      stats.intra_error += intra as f64;
      let Some(prev) = prev else {
        stats.coded_error += intra as f64;
        continue;
      };

      let mut best = (block.sad(&frame, prev), false);
      for dy in SEARCH_OFFSETS {
        for dx in SEARCH_OFFSETS {
          let Some(moved) = block.shifted(dx, dy, width, height) else {
            continue;
          };
          let cost = moved_sad(&frame, block, prev, moved);
          if cost < best.0 {
            best = (cost, true);
          }
        }
      }
      let (inter_error, moving) = best;
      let second_error = prev2.map(|p| block.sad(&frame, p));

      stats.coded_error += intra.min(inter_error) as f64;
      if inter_error < intra {
        inter += 1;
        motion += moving as usize;
        if second_error.is_some_and(|e| e < inter_error) {
          second += 1;
        }
      }
      if intra.abs_diff(inter_error) <= intra / 16 {
        neutral += 1;
      }
    }

    let blocks = blocks.max(1) as f64;
    stats.pcnt_inter = inter as f64 / blocks;
    stats.pcnt_motion = motion as f64 / blocks;
    stats.pcnt_second_ref = second as f64 / blocks;
    stats.pcnt_neutral = neutral as f64 / blocks;

    self.frames += 1;
    self.prev2 = self.prev.take();
    self.prev = Some(frame);
    stats
  }
}

// SAD between `block` of `a` and `other` of `b`, both of the same size.
fn moved_sad(
  a: &LumaFrame, block: Block, b: &LumaFrame, other: Block,
) -> u64 {
  block
    .pixels(a)
    .zip(other.pixels(b))
    .map(|(p, q)| u64::from(p.abs_diff(q)))
    .sum()
}

#[cfg(test)]
mod test {
  use super::*;

  fn textured(width: usize, height: usize, shift: usize) -> LumaFrame {
    let data = (0..height)
      .flat_map(|y| {
        (0..width).map(move |x| (64 + ((x + shift) * 7 + y * 13) % 64) as u8)
      })
      .collect();
    LumaFrame { width, height, data }
  }

  fn params<'a>(frame_type: FrameType, qindex: u8) -> EncodeParams<'a> {
    EncodeParams {
      frame_type,
      qindex,
      interp_filter: InterpFilter::EightTap,
      show_frame: true,
      usable_refs: if frame_type == FrameType::KEY {
        RefFlags::NONE
      } else {
        RefFlags::ALL
      },
      active_map: None,
      is_src_frame_alt_ref: false,
    }
  }

  fn encode(
    source: &LumaFrame, params: &EncodeParams, refs: [&LumaFrame; 3],
  ) -> (Vec<u8>, LumaFrame, EncodeOutcome) {
    let refs =
      ReferenceSet { last: refs[0], golden: refs[1], alt_ref: refs[2] };
    let mut recon = LumaFrame::blank(source.width, source.height);
    let mut out = Vec::new();
    let outcome = ModelEncoder
      .encode_frame(source, params, &refs, &mut recon, &mut out)
      .unwrap();
    (out, recon, outcome)
  }

  #[test]
  fn lowest_quantizer_reconstructs_exactly() {
    let source = textured(32, 32, 0);
    let blank = LumaFrame::blank(32, 32);
    let (out, recon, outcome) =
      encode(&source, &params(FrameType::KEY, 0), [&blank; 3]);
    assert_eq!(recon, source);
    assert_eq!(outcome.error, 0);
    assert_eq!(out[0], Mode::Intra(0).code());
  }

  #[test]
  fn coarser_quantizers_lose_detail() {
    let source = textured(32, 32, 0);
    let blank = LumaFrame::blank(32, 32);
    let (fine, _, fine_outcome) =
      encode(&source, &params(FrameType::KEY, 40), [&blank; 3]);
    let (coarse, _, coarse_outcome) =
      encode(&source, &params(FrameType::KEY, 200), [&blank; 3]);
    assert!(coarse.len() < fine.len());
    assert!(coarse_outcome.error > fine_outcome.error);
  }

  #[test]
  fn unchanged_frame_predicts_from_last() {
    let source = textured(16, 16, 0);
    let blank = LumaFrame::blank(16, 16);
    let p = params(FrameType::INTER, 100);
    let (out, recon, outcome) = encode(&source, &p, [&source, &blank, &blank]);
    // mode, then zero tokens
    assert_eq!(out, vec![Mode::Inter(RefFrame::Last).code(), 0, 0]);
    assert_eq!(recon, source);
    assert_eq!(outcome.error, 0);
  }

  #[test]
  fn unusable_references_are_skipped() {
    let source = textured(16, 16, 0);
    let blank = LumaFrame::blank(16, 16);
    let mut p = params(FrameType::INTER, 100);
    p.usable_refs = RefFlags { last: false, golden: true, alt_ref: true };
    let (out, _, _) = encode(&source, &p, [&source, &blank, &blank]);
    assert_ne!(out[0], Mode::Inter(RefFrame::Last).code());
  }

  #[test]
  fn inactive_blocks_keep_last() {
    let source = textured(32, 16, 0);
    let last = LumaFrame::blank(32, 16);
    let map = ActiveMap::new(32, 16, 1, 2, &[0, 1]).unwrap();
    let mut p = params(FrameType::INTER, 0);
    p.active_map = Some(&map);
    let (out, recon, _) = encode(&source, &p, [&last; 3]);
    assert_eq!(out[0], Mode::Copy.code());
    assert!((0..16).all(|y| recon.row(y)[..16] == last.row(y)[..16]));
    assert!((0..16).all(|y| recon.row(y)[16..] == source.row(y)[16..]));
  }

  fn header(frame_type: FrameType) -> FrameHeader {
    FrameHeader {
      frame_type,
      show_frame: false,
      qindex: 77,
      interp_filter: InterpFilter::EightTapSmooth,
      refresh: RefFlags::ALL,
      refresh_mask: 0b101,
      ref_slots: [0, 1, 2],
      width: 352,
      height: 288,
    }
  }

  #[test]
  fn key_header_carries_the_size() {
    let out =
      ModelPacker.pack(&header(FrameType::KEY), &[9, 9], false).unwrap();
    assert_eq!(out[0], 0x80 | 2);
    assert_eq!(out[1], 77);
    assert_eq!(&out[2..4], &352u16.to_le_bytes());
    assert_eq!(&out[4..6], &288u16.to_le_bytes());
    assert_eq!(&out[6..10], &2u32.to_le_bytes());
    assert_eq!(&out[10..], &[9, 9]);
  }

  #[test]
  fn inter_header_carries_the_slots() {
    let out =
      ModelPacker.pack(&header(FrameType::INTER), &[], true).unwrap();
    assert_eq!(out[0], 0x80 | 0x10 | 2);
    assert_eq!(out[2], 0b101);
    assert_eq!(&out[3..5], &0b000_001_010u16.to_le_bytes());
    assert_eq!(out.len(), 9);
  }

  #[test]
  fn first_frame_has_nothing_to_predict_from() {
    let mut analyzer = FirstPassAnalyzer::new();
    let stats = analyzer.analyze(textured(64, 64, 0));
    assert_eq!(stats.frame, 0);
    assert_eq!(stats.pcnt_inter, 0.0);
    assert_eq!(stats.coded_error, stats.intra_error);
    assert!(stats.intra_error > 0.0);
  }

  #[test]
  fn static_and_moving_content() {
    let mut analyzer = FirstPassAnalyzer::new();
    analyzer.analyze(textured(64, 64, 0));
    let still = analyzer.analyze(textured(64, 64, 0));
    assert_eq!(still.frame, 1);
    assert_eq!(still.pcnt_inter, 1.0);
    assert_eq!(still.pcnt_motion, 0.0);
    assert_eq!(still.coded_error, 0.0);

    let moving = analyzer.analyze(textured(64, 64, 2));
    assert!(moving.pcnt_motion > 0.0);
    assert!(moving.coded_error < moving.intra_error);
    assert_eq!(analyzer.frames(), 3);
  }
}
