// Copyright (c) 2018-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use std::fmt;
use std::time::Instant;
use vpxrc::prelude::*;
use vpxrc::quantize::qindex_to_quantizer;

#[derive(Debug, Clone, Copy)]
pub struct FrameSummary {
  // Frame size in bytes, hidden frames included
  pub size: usize,
  pub input_frameno: u64,
  pub frame_type: FrameType,
  pub hidden_frames: usize,
  pub qindex: u8,
  pub recodes: u32,
  // Luma PSNR
  pub psnr: f64,
}

impl From<&Packet> for FrameSummary {
  fn from(packet: &Packet) -> Self {
    Self {
      size: packet.data.len(),
      input_frameno: packet.input_frameno,
      frame_type: packet.frame_type,
      hidden_frames: packet.hidden_frames,
      qindex: packet.qindex,
      recodes: packet.recodes,
      psnr: packet.psnr,
    }
  }
}

impl fmt::Display for FrameSummary {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "Input Frame {} - {} - {} bytes - q {}{}{}",
      self.input_frameno,
      self.frame_type,
      self.size,
      qindex_to_quantizer(self.qindex),
      if self.hidden_frames > 0 {
        format!(" - {} hidden", self.hidden_frames)
      } else {
        String::new()
      },
      if self.recodes > 0 {
        format!(" - {} recodes", self.recodes)
      } else {
        String::new()
      }
    )
  }
}

#[derive(Debug, Clone)]
pub struct ProgressInfo {
  // Frame rate of the video
  frame_rate: Rational,
  // The length of the whole video, in frames, if known
  total_frames: Option<usize>,
  // The time the encode was started
  time_started: Instant,
  // List of frames encoded so far
  frame_info: Vec<FrameSummary>,
  // Video size so far in bytes, cached since it is read on every update
  encoded_size: usize,
  // Whether to display PSNR statistics at the end of the encode
  show_psnr: bool,
}

impl ProgressInfo {
  pub fn new(
    frame_rate: Rational, total_frames: Option<usize>, show_psnr: bool,
  ) -> Self {
    Self {
      frame_rate,
      total_frames,
      time_started: Instant::now(),
      frame_info: Vec::with_capacity(total_frames.unwrap_or_default()),
      encoded_size: 0,
      show_psnr,
    }
  }

  pub fn add_frame(&mut self, frame: FrameSummary) {
    self.encoded_size += frame.size;
    self.frame_info.push(frame);
  }

  pub fn frames_encoded(&self) -> usize {
    self.frame_info.len()
  }

  pub fn encoding_fps(&self) -> f64 {
    let duration = self.time_started.elapsed().as_secs_f64();
    if duration == 0.0 {
      return 0.0;
    }
    self.frame_info.len() as f64 / duration
  }

  pub fn video_fps(&self) -> f64 {
    self.frame_rate.as_f64()
  }

  // Returns the bitrate of the frames so far, in bits/second
  pub fn bitrate(&self) -> usize {
    if self.frame_info.is_empty() {
      return 0;
    }
    let bits = self.encoded_size * 8;
    let seconds = self.frame_info.len() as f64 / self.video_fps();
    (bits as f64 / seconds) as usize
  }

  // Estimates the final filesize in bytes, if the number of frames is known
  pub fn estimated_size(&self) -> usize {
    match (self.total_frames, self.frames_encoded()) {
      (Some(frames), encoded) if encoded > 0 => {
        self.encoded_size * frames / encoded
      }
      _ => 0,
    }
  }

  // Number of frames of given type which appear in the video
  fn get_frame_type_count(&self, frame_type: FrameType) -> usize {
    self
      .frame_info
      .iter()
      .filter(|frame| frame.frame_type == frame_type)
      .count()
  }

  fn get_frame_type_avg_size(&self, frame_type: FrameType) -> usize {
    let count = self.get_frame_type_count(frame_type);
    if count == 0 {
      return 0;
    }
    self
      .frame_info
      .iter()
      .filter(|frame| frame.frame_type == frame_type)
      .map(|frame| frame.size)
      .sum::<usize>()
      / count
  }

  pub fn hidden_frames(&self) -> usize {
    self.frame_info.iter().map(|frame| frame.hidden_frames).sum()
  }

  pub fn print_summary(&self) {
    info!("{}", self);
    info!("----------");
    self.print_frame_type_summary(FrameType::KEY);
    self.print_frame_type_summary(FrameType::INTER);
    info!("{:17} {:>6}", "Hidden alt-refs:", self.hidden_frames());
    if self.show_psnr {
      self.print_video_psnr();
    }
  }

  fn print_frame_type_summary(&self, frame_type: FrameType) {
    let count = self.get_frame_type_count(frame_type);
    let size = self.get_frame_type_avg_size(frame_type);
    info!(
      "{:17} {:>6}    avg size: {:>7} B",
      format!("{}:", frame_type),
      count,
      size
    );
  }

  pub fn mean_psnr(&self) -> f64 {
    if self.frame_info.is_empty() {
      return 0.0;
    }
    self.frame_info.iter().map(|fi| fi.psnr).sum::<f64>()
      / self.frame_info.len() as f64
  }

  fn print_video_psnr(&self) {
    info!("----------");
    info!("Mean PSNR: Y: {:.4}", self.mean_psnr());
  }
}

impl fmt::Display for ProgressInfo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if let Some(total_frames) = self.total_frames {
      write!(
        f,
        "encoded {}/{} frames, {:.3} fps, {:.2} Kb/s, est. size: {:.2} MB",
        self.frames_encoded(),
        total_frames,
        self.encoding_fps(),
        self.bitrate() as f64 / 1000f64,
        self.estimated_size() as f64 / (1024 * 1024) as f64,
      )
    } else {
      write!(
        f,
        "encoded {} frames, {:.3} fps, {:.2} Kb/s",
        self.frames_encoded(),
        self.encoding_fps(),
        self.bitrate() as f64 / 1000f64
      )
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn summary(frame_type: FrameType, size: usize, psnr: f64) -> FrameSummary {
    FrameSummary {
      size,
      input_frameno: 0,
      frame_type,
      hidden_frames: 0,
      qindex: 100,
      recodes: 0,
      psnr,
    }
  }

  #[test]
  fn averages_per_frame_type() {
    let mut progress = ProgressInfo::new(Rational::new(30, 1), None, true);
    progress.add_frame(summary(FrameType::KEY, 3000, 40.0));
    progress.add_frame(summary(FrameType::INTER, 100, 36.0));
    progress.add_frame(summary(FrameType::INTER, 300, 35.0));
    assert_eq!(progress.get_frame_type_avg_size(FrameType::INTER), 200);
    assert_eq!(progress.get_frame_type_count(FrameType::KEY), 1);
    assert_eq!(progress.mean_psnr(), 37.0);
    // 3400 bytes over a tenth of a second.
    assert_eq!(progress.bitrate(), 272_000);
  }

  #[test]
  fn empty_progress_has_no_rates() {
    let progress = ProgressInfo::new(Rational::new(30, 1), Some(10), false);
    assert_eq!(progress.bitrate(), 0);
    assert_eq!(progress.estimated_size(), 0);
    assert_eq!(progress.mean_psnr(), 0.0);
  }
}
