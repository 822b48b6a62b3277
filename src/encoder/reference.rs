// Copyright (c) 2018-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use arrayvec::ArrayVec;
use std::fmt;

use crate::api::{EncoderError, FrameType};
use crate::encoder::{BufferHandle, FrameBufferPool};

/// Number of reference map entries a frame header can address.
pub const REF_FRAMES: usize = 8;
/// Map entries used when a single alt-ref is coded per group.
pub const INTER_REFS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefFrame {
  Last,
  Golden,
  AltRef,
}

impl RefFrame {
  pub const ALL: [RefFrame; 3] =
    [RefFrame::Last, RefFrame::Golden, RefFrame::AltRef];
}

impl fmt::Display for RefFrame {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RefFrame::Last => write!(f, "LAST"),
      RefFrame::Golden => write!(f, "GOLDEN"),
      RefFrame::AltRef => write!(f, "ALTREF"),
    }
  }
}

/// One flag per reference role. Used both for the roles a frame refreshes
/// and for the roles it may predict from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct RefFlags {
  pub last: bool,
  pub golden: bool,
  pub alt_ref: bool,
}

impl RefFlags {
  pub const NONE: RefFlags =
    RefFlags { last: false, golden: false, alt_ref: false };
  pub const ALL: RefFlags =
    RefFlags { last: true, golden: true, alt_ref: true };
  pub const LAST_ONLY: RefFlags =
    RefFlags { last: true, golden: false, alt_ref: false };

  /// LAST = 1, GOLDEN = 2, ALTREF = 4.
  pub const fn bits(self) -> u8 {
    self.last as u8 | (self.golden as u8) << 1 | (self.alt_ref as u8) << 2
  }

  pub const fn from_bits(bits: u8) -> Option<RefFlags> {
    if bits > 7 {
      return None;
    }
    Some(RefFlags {
      last: bits & 1 != 0,
      golden: bits & 2 != 0,
      alt_ref: bits & 4 != 0,
    })
  }

  pub const fn contains(self, role: RefFrame) -> bool {
    match role {
      RefFrame::Last => self.last,
      RefFrame::Golden => self.golden,
      RefFrame::AltRef => self.alt_ref,
    }
  }

  pub const fn any(self) -> bool {
    self.last || self.golden || self.alt_ref
  }
}

/// Binds the LAST, GOLDEN and ALTREF roles to pool slots.
///
/// Each map entry owns one counted handle, so a slot's count is the number
/// of entries pointing at it plus any in-flight use. Roles resolve to map
/// entries through `lst_idx`, `gld_idx` and `alt_idx`.
#[derive(Debug)]
pub struct ReferenceFrameMap {
  map: ArrayVec<BufferHandle, REF_FRAMES>,
  lst_idx: usize,
  gld_idx: usize,
  alt_idx: usize,
  swap_golden: bool,
}

impl ReferenceFrameMap {
  /// Creates a map of `map_len` entries all aliasing one blank slot.
  ///
  /// With `swap_golden` set, a golden refresh without an alt-ref refresh
  /// writes the ALTREF entry and swaps the two roles, keeping the previous
  /// golden frame available as ALTREF.
  ///
  /// # Errors
  ///
  /// Returns `EncoderError::PoolExhausted` if no slot is free.
  ///
  /// # Panics
  ///
  /// Panics if `map_len` is outside `INTER_REFS..=REF_FRAMES`.
  pub fn new<R>(
    pool: &mut FrameBufferPool<R>, map_len: usize, swap_golden: bool,
  ) -> Result<Self, EncoderError> {
    assert!((INTER_REFS..=REF_FRAMES).contains(&map_len));
    let blank = pool.acquire_free_slot()?;
    let mut map = ArrayVec::new();
    for _ in 1..map_len {
      map.push(pool.retain(&blank));
    }
    map.push(blank);
    Ok(ReferenceFrameMap {
      map,
      lst_idx: 0,
      gld_idx: 1,
      alt_idx: 2,
      swap_golden,
    })
  }

  pub fn len(&self) -> usize {
    self.map.len()
  }

  pub fn is_empty(&self) -> bool {
    self.map.is_empty()
  }

  /// Map entry currently bound to `role`.
  pub fn map_index(&self, role: RefFrame) -> usize {
    match role {
      RefFrame::Last => self.lst_idx,
      RefFrame::Golden => self.gld_idx,
      RefFrame::AltRef => self.alt_idx,
    }
  }

  /// Pool slot currently bound to `role`.
  pub fn slot(&self, role: RefFrame) -> usize {
    self.map[self.map_index(role)].index()
  }

  /// Pool slots for LAST, GOLDEN and ALTREF, in that order.
  pub fn role_slots(&self) -> [usize; 3] {
    RefFrame::ALL.map(|r| self.slot(r))
  }

  pub fn ref_map_indices(&self) -> [u8; 3] {
    RefFrame::ALL.map(|r| self.map_index(r) as u8)
  }

  /// Points ALTREF at another map entry. Used when several alt-refs are
  /// kept alive inside one group.
  ///
  /// # Panics
  ///
  /// Panics if `index` is out of range or is the LAST or GOLDEN entry.
  pub fn set_alt_idx(&mut self, index: usize) {
    assert!(index < self.map.len());
    assert!(index != self.lst_idx && index != self.gld_idx);
    self.alt_idx = index;
  }

  /// Restricts `allowed` to roles that do not duplicate a lower role.
  pub fn usable_refs(&self, allowed: RefFlags) -> RefFlags {
    let [lst, gld, alt] = self.role_slots();
    RefFlags {
      last: allowed.last,
      golden: allowed.golden && gld != lst,
      alt_ref: allowed.alt_ref && alt != lst && alt != gld,
    }
  }

  /// Map entries a frame with these flags overwrites, one bit per entry.
  pub fn refresh_mask(&self, frame_type: FrameType, refresh: RefFlags) -> u8 {
    if frame_type == FrameType::KEY {
      return ((1u16 << self.map.len()) - 1) as u8;
    }
    let bit = |on: bool, idx: usize| (on as u8) << idx;
    if self.swap_golden && refresh.golden && !refresh.alt_ref {
      bit(refresh.last, self.lst_idx) | bit(true, self.alt_idx)
    } else {
      bit(refresh.last, self.lst_idx)
        | bit(refresh.golden, self.gld_idx)
        | bit(refresh.alt_ref, self.alt_idx)
    }
  }

  /// Makes `to` resolve to the slot `from` resolves to. Aliasing roles
  /// that already share a slot changes nothing.
  pub fn alias<R>(
    &mut self, pool: &mut FrameBufferPool<R>, from: RefFrame, to: RefFrame,
  ) {
    if self.slot(from) == self.slot(to) {
      return;
    }
    let src = self.map_index(from);
    let dst = self.map_index(to);
    let handle = pool.retain(&self.map[src]);
    let old = std::mem::replace(&mut self.map[dst], handle);
    pool.release(old);
  }

  fn rebind<R>(
    &mut self, pool: &mut FrameBufferPool<R>, entry: usize,
    new: &BufferHandle,
  ) {
    let handle = pool.retain(new);
    let old = std::mem::replace(&mut self.map[entry], handle);
    pool.release(old);
  }

  /// Binds the freshly coded frame in `new` to the roles it refreshes.
  ///
  /// Keyframes overwrite every entry. A golden refresh without an alt-ref
  /// refresh goes through the ALTREF entry and swaps the two roles when
  /// golden swapping is enabled. Every rebind retains the new slot before
  /// releasing the old one; the caller still owns `new`.
  pub fn commit<R>(
    &mut self, pool: &mut FrameBufferPool<R>, new: &BufferHandle,
    frame_type: FrameType, refresh: RefFlags,
  ) {
    if frame_type == FrameType::KEY {
      for entry in 0..self.map.len() {
        self.rebind(pool, entry, new);
      }
      return;
    }
    if self.swap_golden && refresh.golden && !refresh.alt_ref {
      self.rebind(pool, self.alt_idx, new);
      std::mem::swap(&mut self.gld_idx, &mut self.alt_idx);
    } else {
      if refresh.alt_ref {
        self.rebind(pool, self.alt_idx, new);
      }
      if refresh.golden {
        self.rebind(pool, self.gld_idx, new);
      }
    }
    if refresh.last {
      self.rebind(pool, self.lst_idx, new);
    }
  }

  /// Gives every held reference back to the pool.
  pub fn release_all<R>(self, pool: &mut FrameBufferPool<R>) {
    for handle in self.map {
      pool.release(handle);
    }
  }
}
