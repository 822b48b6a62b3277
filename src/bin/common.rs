// Copyright (c) 2017-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use crate::error::*;
use crate::muxer::{create_muxer, Muxer};
use clap::{Parser, ValueEnum};
use std::fs::File;
use std::io::{self, Read};
use std::path::PathBuf;
use vpxrc::quantize::{quantizer_to_qindex, MAX_USER_QUANTIZER};
use vpxrc::recode::DEFAULT_MAX_RECODES;
use vpxrc::twopass::TwoPassStats;
use vpxrc::*;

/// Rate controlled VP9 style encoder
#[derive(Parser, Debug)]
#[command(name = "vpxrc", version)]
#[command(about = "Encodes y4m input through the vpxrc control loop")]
pub struct CliOptions {
  /// Uncompressed YUV4MPEG2 video input
  #[arg(value_name = "INPUT")]
  input: String,
  /// Compressed output in an IVF container
  #[arg(short, long, required_unless_present = "first_pass")]
  output: Option<String>,
  /// Maximum number of frames to encode
  #[arg(short, long, default_value_t = 0)]
  limit: usize,
  /// Skip n number of frames and encode
  #[arg(long, default_value_t = 0)]
  skip: usize,
  /// Rate control mode
  #[arg(long, value_enum, default_value_t = RateModeArg::Vbr)]
  rate_mode: RateModeArg,
  /// Target bitrate in kbps
  #[arg(short, long, default_value_t = 256)]
  bitrate: i32,
  /// Quantizer (0-63) used by fixed-q
  #[arg(
    long,
    default_value_t = 32,
    value_parser = clap::value_parser!(u8).range(0..=63)
  )]
  quantizer: u8,
  /// Best quantizer (0-63) the rate control may pick
  #[arg(
    long,
    default_value_t = 0,
    value_parser = clap::value_parser!(u8).range(0..=63)
  )]
  min_quantizer: u8,
  /// Worst quantizer (0-63) the rate control may pick
  #[arg(
    long,
    default_value_t = MAX_USER_QUANTIZER,
    value_parser = clap::value_parser!(u8).range(0..=63)
  )]
  max_quantizer: u8,
  /// Quality floor (0-63) used by cq
  #[arg(
    long,
    default_value_t = 24,
    value_parser = clap::value_parser!(u8).range(0..=63)
  )]
  cq_level: u8,
  /// Maximum interval between keyframes
  #[arg(short = 'I', long, default_value_t = 240)]
  keyint: u64,
  /// Only place keyframes on the first frame and on request
  #[arg(long)]
  no_auto_key: bool,
  /// Frames held back for alt-ref coding
  #[arg(long, default_value_t = 16)]
  lag_in_frames: usize,
  /// Do not code hidden alt-ref frames
  #[arg(long)]
  no_alt_ref: bool,
  /// Code a second alt-ref level inside long golden groups
  #[arg(long)]
  multi_arf: bool,
  /// Reconstruction buffers, defaults to the fewest the layout needs
  #[arg(long)]
  frame_buffers: Option<usize>,
  /// Frames allowed to be re-encoded
  #[arg(long, value_enum, default_value_t = RecodeArg::Always)]
  recode: RecodeArg,
  /// Re-encodes allowed per frame in each direction
  #[arg(long, default_value_t = DEFAULT_MAX_RECODES)]
  max_recodes: u32,
  /// Try every interpolation filter and keep the cheapest
  #[arg(long)]
  search_filter: bool,
  /// Analyze the input and write first pass statistics to this file
  #[arg(long, value_name = "STATS_FILE", conflicts_with = "second_pass")]
  first_pass: Option<PathBuf>,
  /// Drive the rate control with first pass statistics from this file
  #[arg(long, value_name = "STATS_FILE")]
  second_pass: Option<PathBuf>,
  /// Verbose logging; outputs info for every frame
  #[arg(short, long, conflicts_with = "quiet")]
  verbose: bool,
  /// Do not output any status message
  #[arg(short, long)]
  quiet: bool,
  /// Calculate and display PSNR metrics
  #[arg(long)]
  psnr: bool,
  /// Overwrite output file
  #[arg(short = 'y')]
  overwrite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RateModeArg {
  /// Variable bitrate
  Vbr,
  /// Constant bitrate
  Cbr,
  /// Constrained quality
  Cq,
  /// Fixed quantizer
  FixedQ,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RecodeArg {
  Never,
  /// Keyframes only
  Key,
  /// Keyframes, golden frames and alt-refs
  Golden,
  Always,
}

impl From<RecodeArg> for RecodeMode {
  fn from(arg: RecodeArg) -> Self {
    match arg {
      RecodeArg::Never => RecodeMode::Never,
      RecodeArg::Key => RecodeMode::KeyFramesOnly,
      RecodeArg::Golden => RecodeMode::KeyGoldenAltRef,
      RecodeArg::Always => RecodeMode::Always,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verboseness {
  Quiet,
  Normal,
  Verbose,
}

pub enum Pass {
  /// Analyze only, writing statistics.
  First(File),
  /// Encode, optionally with statistics from an earlier run.
  Encode(Box<dyn Muxer>),
}

pub struct CliSettings {
  pub input: Box<dyn Read>,
  pub pass: Pass,
  pub enc: EncoderConfig,
  pub rc: RateControlConfig,
  pub limit: usize,
  pub skip: usize,
  pub verbose: Verboseness,
  pub show_psnr: bool,
}

pub fn parse_cli() -> Result<CliSettings, CliError> {
  let opts = CliOptions::parse();
  CliSettings::from_options(opts)
}

impl CliSettings {
  fn from_options(opts: CliOptions) -> Result<Self, CliError> {
    let verbose = if opts.quiet {
      Verboseness::Quiet
    } else if opts.verbose {
      Verboseness::Verbose
    } else {
      Verboseness::Normal
    };

    let input: Box<dyn Read> = match opts.input.as_str() {
      "-" => Box::new(io::stdin()),
      f => Box::new(
        File::open(f).map_err(|e| e.context("Cannot open input file"))?,
      ),
    };

    let pass = match (&opts.first_pass, &opts.output) {
      (Some(path), _) => Pass::First(File::create(path).map_err(|e| {
        e.context("Unable to open file for writing two-pass data")
      })?),
      (None, Some(output)) => {
        Pass::Encode(create_muxer(output, opts.overwrite)?)
      }
      (None, None) => {
        return Err(CliError::new("An output file is required"));
      }
    };

    let rc = parse_rate_control(&opts)?;
    Ok(CliSettings {
      input,
      pass,
      enc: parse_config(&opts),
      rc,
      limit: opts.limit,
      skip: opts.skip,
      verbose,
      show_psnr: opts.psnr,
    })
  }
}

fn parse_config(opts: &CliOptions) -> EncoderConfig {
  let mut cfg = EncoderConfig::default()
    .with_quantizer_range(opts.min_quantizer, opts.max_quantizer);
  cfg.max_key_frame_interval = opts.keyint;
  cfg.auto_key = !opts.no_auto_key;
  cfg.lag_in_frames = opts.lag_in_frames;
  cfg.play_alternate = !opts.no_alt_ref;
  cfg.multi_arf = opts.multi_arf;
  let min_buffers = cfg.min_frame_buffers();
  cfg.frame_buffers = opts.frame_buffers.unwrap_or(min_buffers);
  cfg.recode = opts.recode.into();
  cfg.max_recodes = opts.max_recodes;
  cfg.search_interp_filter = opts.search_filter;
  cfg
}

fn parse_rate_control(
  opts: &CliOptions,
) -> Result<RateControlConfig, CliError> {
  let mode = match opts.rate_mode {
    RateModeArg::Vbr => RateMode::Vbr,
    RateModeArg::Cbr => RateMode::Cbr,
    RateModeArg::Cq => RateMode::ConstrainedQuality {
      cq_level: quantizer_to_qindex(opts.cq_level),
    },
    RateModeArg::FixedQ => {
      RateMode::FixedQ { qindex: quantizer_to_qindex(opts.quantizer) }
    }
  };
  let mut rc = RateControlConfig::new()
    .with_mode(mode)
    .with_bitrate(opts.bitrate.saturating_mul(1000));

  if let Some(path) = &opts.second_pass {
    let mut buf = Vec::new();
    File::open(path)
      .and_then(|mut f| f.read_to_end(&mut buf))
      .map_err(|e| e.context("Unable to read the two-pass data file"))?;
    let stats = TwoPassStats::from_slice(&buf)
      .map_err(|e| e.context("Corrupted first pass data"))?;
    rc = rc.with_second_pass(stats);
  }
  Ok(rc)
}

#[cfg(test)]
mod test {
  use super::*;

  fn options(args: &[&str]) -> CliOptions {
    let argv = ["vpxrc", "in.y4m"].iter().chain(args);
    CliOptions::try_parse_from(argv).unwrap()
  }

  #[test]
  fn command_is_well_formed() {
    use clap::CommandFactory;
    CliOptions::command().debug_assert();
  }

  #[test]
  fn output_is_required_for_encoding() {
    let argv = ["vpxrc", "in.y4m"];
    assert!(CliOptions::try_parse_from(argv).is_err());
    let argv = ["vpxrc", "in.y4m", "--first-pass", "stats.bin"];
    assert!(CliOptions::try_parse_from(argv).is_ok());
  }

  #[test]
  fn user_quantizers_map_to_indices() {
    let opts = options(&[
      "-o",
      "out.ivf",
      "--rate-mode",
      "fixed-q",
      "--quantizer",
      "63",
    ]);
    let rc = parse_rate_control(&opts).unwrap();
    assert_eq!(rc.mode, RateMode::FixedQ { qindex: 255 });

    let cfg = parse_config(&opts);
    assert_eq!((cfg.best_quality, cfg.worst_quality), (0, 255));
  }

  #[test]
  fn layout_picks_enough_buffers() {
    let opts = options(&["-o", "out.ivf", "--multi-arf", "--recode", "key"]);
    let cfg = parse_config(&opts);
    assert_eq!(cfg.frame_buffers, cfg.min_frame_buffers());
    assert_eq!(cfg.recode, RecodeMode::KeyFramesOnly);
  }

  #[test]
  fn bitrate_is_given_in_kbps() {
    let opts = options(&["-o", "out.ivf", "-b", "800"]);
    let rc = parse_rate_control(&opts).unwrap();
    assert_eq!(rc.bitrate, 800_000);
    assert!(!rc.is_second_pass());
  }
}
