// Copyright (c) 2017-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

// Safety lints
#![deny(bare_trait_objects)]
#![deny(clippy::large_stack_arrays)]
// Performance lints
#![warn(clippy::inefficient_to_string)]
#![warn(clippy::needless_collect)]
#![warn(clippy::or_fun_call)]
#![warn(clippy::trivially_copy_pass_by_ref)]
// Correctness lints
#![deny(clippy::case_sensitive_file_extension_comparisons)]
#![deny(clippy::manual_instant_elapsed)]
// Clarity/formatting lints
#![warn(clippy::checked_conversions)]
#![allow(clippy::comparison_chain)]
#![warn(clippy::implicit_clone)]
#![warn(clippy::manual_let_else)]
#![warn(clippy::match_bool)]
#![warn(clippy::needless_borrow)]
#![allow(clippy::needless_range_loop)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::upper_case_acronyms)]
// Documentation lints
#![warn(clippy::doc_markdown)]

#[macro_use]
extern crate log;

mod common;
mod decoder;
mod error;
mod model;
mod muxer;
mod stats;

use crate::common::*;
use crate::decoder::{DecodeError, Decoder, LumaFrame, VideoDetails};
use crate::error::*;
use crate::model::{FirstPassAnalyzer, ModelEncoder, ModelPacker};
use crate::muxer::Muxer;
use crate::stats::*;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::process::exit;
use std::sync::Arc;
use vpxrc::prelude::*;
use vpxrc::twopass::StatsHeader;

type Session = Context<ModelEncoder, ModelPacker>;

struct Source<D: Decoder> {
  limit: usize,
  count: usize,
  input: D,
}

impl<D: Decoder> Source<D> {
  const fn new(limit: usize, input: D) -> Self {
    Self { limit, input, count: 0 }
  }

  fn skip(&mut self, frames: usize) -> Result<(), CliError> {
    for _ in 0..frames {
      if self.input.read_frame().is_err() {
        return Err(CliError::new("Skipped more frames than in the input"));
      }
    }
    Ok(())
  }

  // The next input frame, or `None` once the input or the limit is
  // exhausted.
  fn read_frame(&mut self) -> Option<LumaFrame> {
    if self.limit != 0 && self.count == self.limit {
      return None;
    }
    match self.input.read_frame() {
      Ok(frame) => {
        self.count += 1;
        Some(frame)
      }
      Err(DecodeError::EOF) => None,
      Err(e) => {
        warn!("Input ended early after {} frames: {:?}", self.count, e);
        None
      }
    }
  }
}

// Encode and write a frame.
// Returns frame information in a `Result`.
fn process_frame<D: Decoder>(
  ctx: &mut Session, output: &mut dyn Muxer, source: &mut Source<D>,
) -> Result<Option<Vec<FrameSummary>>, CliError> {
  let mut frame_summaries = Vec::new();
  match ctx.receive_packet() {
    Ok(pkt) => {
      output
        .write_frame(pkt.input_frameno, &pkt.data)
        .map_err(|e| e.context("Unable to write the output file"))?;
      frame_summaries.push(FrameSummary::from(&pkt));
    }
    Err(EncoderStatus::NeedMoreData) => match source.read_frame() {
      Some(frame) => ctx
        .send_frame(Arc::new(frame))
        .map_err(|e| e.context("Failed to send a frame"))?,
      None => ctx.flush(),
    },
    // Hidden frames ride along with the next packet
    Err(EncoderStatus::Encoded) => {}
    Err(EncoderStatus::LimitReached) => return Ok(None),
    Err(e) => return Err(e.context("Failed to encode video")),
  }
  Ok(Some(frame_summaries))
}

fn do_encode<D: Decoder>(
  cfg: Config, verbose: Verboseness, mut progress: ProgressInfo,
  output: &mut dyn Muxer, mut source: Source<D>,
) -> Result<(), CliError> {
  let mut ctx: Session = cfg
    .new_context(ModelEncoder, ModelPacker)
    .map_err(|e| e.context("Invalid encoder settings"))?;

  while let Some(frame_info) =
    process_frame(&mut ctx, &mut *output, &mut source)?
  {
    for frame in frame_info {
      progress.add_frame(frame);
      match verbose {
        Verboseness::Verbose => info!("{} - {}", frame, progress),
        // A one-line progress indicator that overrides itself
        Verboseness::Normal => eprint!("\r{progress}                    "),
        Verboseness::Quiet => {}
      }
    }
  }
  output.flush().map_err(|e| e.context("Unable to flush the output file"))?;

  if verbose != Verboseness::Quiet {
    if verbose == Verboseness::Normal {
      // Clear out the temporary progress indicator
      eprintln!();
    }
    progress.print_summary();
    let stats = ctx.stats();
    info!(
      "avg qindex: {:.1}, recodes: {}, aborted searches: {}",
      stats.avg_qindex(),
      stats.recodes,
      stats.aborted_searches
    );
  }
  Ok(())
}

fn do_first_pass<D: Decoder>(
  mut source: Source<D>, stats_file: File, details: VideoDetails,
  verbose: Verboseness,
) -> Result<(), CliError> {
  let header = StatsHeader {
    width: u32::try_from(details.width)
      .map_err(|_| CliError::new("Frame width out of range"))?,
    height: u32::try_from(details.height)
      .map_err(|_| CliError::new("Frame height out of range"))?,
  };
  let mut out = BufWriter::new(stats_file);
  out
    .write_all(&header.to_bytes())
    .map_err(|e| e.context("Unable to write to two-pass data file"))?;

  let mut analyzer = FirstPassAnalyzer::new();
  while let Some(frame) = source.read_frame() {
    let stats = analyzer.analyze(frame);
    if verbose == Verboseness::Verbose {
      info!(
        "First pass frame {} - intra {:.0} - coded {:.0} - inter {:.2}",
        stats.frame, stats.intra_error, stats.coded_error, stats.pcnt_inter
      );
    }
    out
      .write_all(&stats.to_bytes())
      .map_err(|e| e.context("Unable to write to two-pass data file"))?;
  }
  out
    .flush()
    .map_err(|e| e.context("Unable to write to two-pass data file"))?;

  if analyzer.frames() == 0 {
    return Err(CliError::new("No input frames to analyze"));
  }
  if verbose != Verboseness::Quiet {
    info!("Wrote first pass statistics for {} frames", analyzer.frames());
  }
  Ok(())
}

fn main() {
  init_logger();

  run().unwrap_or_else(|e| {
    error::print_error(&e);
    exit(1);
  });
}

fn init_logger() {
  use std::str::FromStr;
  fn level_colored(l: log::Level) -> console::StyledObject<&'static str> {
    use console::style;
    use log::Level;
    match l {
      Level::Trace => style("??").dim(),
      Level::Debug => style("? ").dim(),
      Level::Info => style("> ").green(),
      Level::Warn => style("! ").yellow(),
      Level::Error => style("!!").red(),
    }
  }

  let level = std::env::var("VPXRC_LOG")
    .ok()
    .and_then(|l| log::LevelFilter::from_str(&l).ok())
    .unwrap_or(log::LevelFilter::Info);

  let logger = fern::Dispatch::new()
    .format(move |out, message, record| {
      out.finish(format_args!(
        "{level} {message}",
        level = level_colored(record.level()),
        message = message,
      ));
    })
    // Dependencies only report warnings
    .level(log::LevelFilter::Warn)
    .level_for("vpxrc", level)
    .chain(std::io::stderr())
    .apply();
  if logger.is_err() {
    eprintln!("A logger was already installed");
  }
}

fn run() -> Result<(), error::CliError> {
  let cli = parse_cli()?;

  // Largest frame a VP9 header can describe plus the y4m frame header
  let limit = y4m::Limits {
    bytes: 65536usize
      .saturating_mul(65536)
      .saturating_mul(3)
      .saturating_div(2)
      .saturating_add(1024),
  };
  let input: Box<dyn Read> = cli.input;
  let y4m_dec = match y4m::Decoder::new_with_limits(input, limit) {
    Err(e) => {
      return Err(CliError::new(match e {
        y4m::Error::ParseError(_) => {
          "Could not parse input video. Is it a y4m file?"
        }
        y4m::Error::IoError(_) => {
          "Could not read input file. Check that the path is correct and \
           you have read permissions."
        }
        y4m::Error::UnknownColorspace => {
          "Unknown colorspace or unsupported bit depth."
        }
        y4m::Error::OutOfMemory => "The video's frame size exceeds the limit.",
        y4m::Error::EOF => "Unexpected end of input.",
        y4m::Error::BadInput => "Bad y4m input parameters provided.",
      }))
    }
    Ok(d) => d,
  };
  let video_info = y4m_dec.get_video_details();
  if video_info.bit_depth != 8 {
    return Err(CliError::new("Only 8-bit input is supported"));
  }

  let mut enc = cli.enc;
  enc.width = video_info.width;
  enc.height = video_info.height;
  enc.time_base = video_info.time_base;

  let mut source = Source::new(cli.limit, y4m_dec);
  source.skip(cli.skip)?;

  if cli.verbose != Verboseness::Quiet {
    info!(
      "Using y4m decoder: {}x{}p @ {}/{} fps",
      video_info.width,
      video_info.height,
      video_info.time_base.den,
      video_info.time_base.num,
    );
  }

  match cli.pass {
    Pass::First(stats_file) => {
      do_first_pass(source, stats_file, video_info, cli.verbose)
    }
    Pass::Encode(mut output) => {
      output
        .write_header(
          enc.width,
          enc.height,
          enc.time_base.den as usize,
          enc.time_base.num as usize,
        )
        .map_err(|e| e.context("Unable to write the output file"))?;

      let cfg =
        Config::new().with_encoder_config(enc).with_rate_control(cli.rc);
      if cli.verbose != Verboseness::Quiet {
        info!("Encoding settings:\n{}", enc);
        if cfg.rate_control().is_second_pass() {
          info!("Using first pass statistics");
        }
      }

      let progress = ProgressInfo::new(
        Rational::from_reciprocal(enc.time_base),
        if cli.limit == 0 { None } else { Some(cli.limit) },
        cli.show_psnr,
      );
      do_encode(cfg, cli.verbose, progress, &mut *output, source)
    }
  }
}
