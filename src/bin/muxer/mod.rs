// Copyright (c) 2017-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

mod ivf;

pub use self::ivf::IvfMuxer;

use crate::error::*;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::io::Write;
use std::path::Path;

pub trait Muxer {
  fn write_header(
    &mut self, width: usize, height: usize, framerate_num: usize,
    framerate_den: usize,
  ) -> io::Result<()>;

  fn write_frame(&mut self, pts: u64, data: &[u8]) -> io::Result<()>;

  fn flush(&mut self) -> io::Result<()>;
}

pub fn create_muxer(
  path: &str, overwrite: bool,
) -> Result<Box<dyn Muxer>, CliError> {
  if !overwrite {
    check_file(path)?;
  }

  let ext = Path::new(path)
    .extension()
    .and_then(OsStr::to_str)
    .map(str::to_lowercase)
    // Default to "ivf" because things like `/dev/null` need to work.
    .unwrap_or_else(|| "ivf".into());

  match &ext[..] {
    "ivf" => IvfMuxer::open(path),
    _ => Err(CliError::new(&format!(
      "{} is not a supported extension, please change to .ivf",
      ext
    ))),
  }
}

fn check_file(path: &str) -> Result<(), CliError> {
  if is_file(path) {
    eprint!("File '{}' already exists. Overwrite ? [y/N] ", path);
    io::stdout().flush().map_err(|e| e.context("Cannot flush stdout"))?;

    let mut option_input = String::new();
    io::stdin()
      .read_line(&mut option_input)
      .map_err(|e| e.context("Failed to read option"))?;

    match option_input.as_str().trim() {
      "y" | "Y" => return Ok(()),
      _ => return Err(CliError::new("Not overwriting, exiting.")),
    };
  }
  Ok(())
}

#[cfg(unix)]
fn is_file<P: AsRef<Path>>(path: P) -> bool {
  use std::os::unix::fs::*;
  fs::metadata(path)
    .map(|meta| {
      !meta.file_type().is_char_device() && !meta.file_type().is_socket()
    })
    .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_file<P: AsRef<Path>>(path: P) -> bool {
  fs::metadata(path).is_ok()
}
