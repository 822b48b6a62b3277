// Copyright (c) 2017-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

pub fn clamp<T: PartialOrd>(input: T, min: T, max: T) -> T {
  if input < min {
    min
  } else if input > max {
    max
  } else {
    input
  }
}

/// Scales `val` by `num / denom` using 64-bit intermediates.
#[inline]
pub const fn rescale(val: i64, num: i64, denom: i64) -> i64 {
  val * num / denom
}

/// Number of 16x16 macroblocks along a dimension of `len` pixels.
#[inline]
pub const fn mb_count(len: usize) -> usize {
  (len + 15) >> 4
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn clamp_orders_bounds() {
    assert_eq!(clamp(-3, 0, 10), 0);
    assert_eq!(clamp(13, 0, 10), 10);
    assert_eq!(clamp(7u8, 0, 10), 7);
  }

  #[test]
  fn mb_count_rounds_up() {
    assert_eq!(mb_count(16), 1);
    assert_eq!(mb_count(17), 2);
    assert_eq!(mb_count(352), 22);
    assert_eq!(mb_count(288), 18);
  }
}
