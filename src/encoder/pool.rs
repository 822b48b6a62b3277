// Copyright (c) 2019-2024, The rav1e contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License and
// the Alliance for Open Media Patent License 1.0. If the BSD 2 Clause License
// was not distributed with this source code in the LICENSE file, you can
// obtain it at www.aomedia.org/license/software. If the Alliance for Open
// Media Patent License 1.0 was not distributed with this source code in the
// PATENTS file, you can obtain it at www.aomedia.org/license/patent.

use arrayvec::ArrayVec;

use crate::api::EncoderError;
use crate::encoder::ReferenceSet;

/// Upper bound on reconstruction buffers a session may allocate.
pub const MAX_FRAME_BUFFERS: usize = 12;

#[derive(Debug)]
struct Slot<R> {
  buf: R,
  refs: u32,
}

/// One counted reference to a pool slot.
///
/// Handles are neither `Clone` nor `Copy`: a second reference is only
/// obtained through [`FrameBufferPool::retain`], and every handle must be
/// given back through [`FrameBufferPool::release`].
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub struct BufferHandle {
  index: usize,
}

impl BufferHandle {
  pub const fn index(&self) -> usize {
    self.index
  }
}

/// Fixed arena of reference-counted reconstruction buffers.
#[derive(Debug)]
pub struct FrameBufferPool<R> {
  slots: ArrayVec<Slot<R>, MAX_FRAME_BUFFERS>,
}

impl<R> FrameBufferPool<R> {
  /// Allocates `count` buffers up front with `alloc`.
  ///
  /// # Errors
  ///
  /// Returns `EncoderError::AllocationFailed` if `count` exceeds
  /// [`MAX_FRAME_BUFFERS`], or the first error `alloc` reports.
  pub fn new<F>(count: usize, mut alloc: F) -> Result<Self, EncoderError>
  where
    F: FnMut() -> Result<R, EncoderError>,
  {
    if count > MAX_FRAME_BUFFERS {
      return Err(EncoderError::AllocationFailed { what: "frame buffer pool" });
    }
    let mut slots = ArrayVec::new();
    for _ in 0..count {
      slots.push(Slot { buf: alloc()?, refs: 0 });
    }
    Ok(FrameBufferPool { slots })
  }

  /// Takes the first unreferenced slot and marks it in flight.
  ///
  /// # Errors
  ///
  /// Returns `EncoderError::PoolExhausted` when every slot is referenced.
  pub fn acquire_free_slot(&mut self) -> Result<BufferHandle, EncoderError> {
    let index = self
      .slots
      .iter()
      .position(|s| s.refs == 0)
      .ok_or(EncoderError::PoolExhausted { slots: self.slots.len() })?;
    self.slots[index].refs = 1;
    Ok(BufferHandle { index })
  }

  /// Adds one reference to the slot behind `handle`.
  pub fn retain(&mut self, handle: &BufferHandle) -> BufferHandle {
    self.slots[handle.index].refs += 1;
    BufferHandle { index: handle.index }
  }

  /// Drops one reference. The slot becomes free again at zero.
  pub fn release(&mut self, handle: BufferHandle) {
    let slot = &mut self.slots[handle.index];
    debug_assert!(slot.refs > 0);
    slot.refs = slot.refs.saturating_sub(1);
  }

  pub fn get(&self, handle: &BufferHandle) -> &R {
    &self.slots[handle.index].buf
  }

  /// Mutable access to an in-flight buffer nobody else references.
  pub fn get_mut(&mut self, handle: &BufferHandle) -> &mut R {
    let slot = &mut self.slots[handle.index];
    debug_assert_eq!(slot.refs, 1);
    &mut slot.buf
  }

  pub fn ref_count(&self, index: usize) -> u32 {
    self.slots[index].refs
  }

  /// Sum of all reference counts.
  pub fn total_refs(&self) -> u32 {
    self.slots.iter().map(|s| s.refs).sum()
  }

  pub fn free_slots(&self) -> usize {
    self.slots.iter().filter(|s| s.refs == 0).count()
  }

  pub fn len(&self) -> usize {
    self.slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.slots.is_empty()
  }

  /// Borrows the in-flight buffer mutably next to the three references
  /// given as slot indices (LAST, GOLDEN, ALTREF).
  ///
  /// # Panics
  ///
  /// Panics if a reference index is out of range or names the in-flight
  /// slot. An acquired slot is never mapped to a role, so this only
  /// happens on a bookkeeping bug.
  pub fn split_for_encode(
    &mut self, inflight: &BufferHandle, roles: [usize; 3],
  ) -> (&mut R, ReferenceSet<'_, R>) {
    let split = inflight.index;
    assert!(
      roles.iter().all(|&r| r != split && r < self.slots.len()),
      "reference roles {:?} overlap in-flight slot {}",
      roles,
      split
    );
    let (head, rest) = self.slots.split_at_mut(split);
    let (cur, tail) = rest.split_at_mut(1);
    let (head, tail) = (&*head, &*tail);
    let refs = ReferenceSet {
      last: pick(head, tail, split, roles[0]),
      golden: pick(head, tail, split, roles[1]),
      alt_ref: pick(head, tail, split, roles[2]),
    };
    (&mut cur[0].buf, refs)
  }
}

fn pick<'a, R>(
  head: &'a [Slot<R>], tail: &'a [Slot<R>], split: usize, index: usize,
) -> &'a R {
  if index < split {
    &head[index].buf
  } else {
    &tail[index - split - 1].buf
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use quickcheck::{quickcheck, TestResult};

  fn pool(count: usize) -> FrameBufferPool<usize> {
    let mut n = 0;
    FrameBufferPool::new(count, || {
      n += 1;
      Ok(n)
    })
    .unwrap()
  }

  #[test]
  fn acquire_takes_first_free_slot() {
    let mut p = pool(3);
    let a = p.acquire_free_slot().unwrap();
    let b = p.acquire_free_slot().unwrap();
    assert_eq!(a.index(), 0);
    assert_eq!(b.index(), 1);
    p.release(a);
    let c = p.acquire_free_slot().unwrap();
    assert_eq!(c.index(), 0);
    p.release(b);
    p.release(c);
    assert_eq!(p.total_refs(), 0);
  }

  #[test]
  fn exhausted_pool_is_an_error() {
    let mut p = pool(2);
    let a = p.acquire_free_slot().unwrap();
    let b = p.acquire_free_slot().unwrap();
    assert_eq!(
      p.acquire_free_slot(),
      Err(EncoderError::PoolExhausted { slots: 2 })
    );
    p.release(a);
    p.release(b);
  }

  #[test]
  fn retained_slot_stays_busy_until_last_release() {
    let mut p = pool(1);
    let a = p.acquire_free_slot().unwrap();
    let b = p.retain(&a);
    assert_eq!(p.ref_count(0), 2);
    p.release(a);
    assert!(p.acquire_free_slot().is_err());
    p.release(b);
    assert_eq!(p.free_slots(), 1);
  }

  #[test]
  fn oversized_pool_is_rejected() {
    let r = FrameBufferPool::new(MAX_FRAME_BUFFERS + 1, || Ok(0u8));
    assert!(matches!(r, Err(EncoderError::AllocationFailed { .. })));
  }

  #[test]
  fn split_for_encode_hands_out_disjoint_buffers() {
    let mut p = pool(4);
    let refs: Vec<_> = (0..3).map(|_| p.acquire_free_slot().unwrap()).collect();
    let cur = p.acquire_free_slot().unwrap();
    {
      let (recon, set) = p.split_for_encode(&cur, [2, 0, 0]);
      *recon = *set.last + *set.golden;
      assert_eq!(*set.alt_ref, 1);
    }
    assert_eq!(*p.get(&cur), 4);
    p.release(cur);
    refs.into_iter().for_each(|h| p.release(h));
  }

  #[derive(Clone, Copy, Debug)]
  enum Op {
    Acquire,
    Retain(usize),
    Release(usize),
  }

  impl quickcheck::Arbitrary for Op {
    fn arbitrary(g: &mut quickcheck::Gen) -> Self {
      let n = usize::arbitrary(g) % 16;
      match u8::arbitrary(g) % 3 {
        0 => Op::Acquire,
        1 => Op::Retain(n),
        _ => Op::Release(n),
      }
    }
  }

  quickcheck! {
    fn refcounts_match_live_handles(ops: Vec<Op>) -> TestResult {
      let mut p = pool(4);
      let mut live: Vec<BufferHandle> = Vec::new();
      for op in ops {
        match op {
          Op::Acquire => {
            if let Ok(h) = p.acquire_free_slot() {
              live.push(h);
            }
          }
          Op::Retain(i) if !live.is_empty() => {
            let h = p.retain(&live[i % live.len()]);
            live.push(h);
          }
          Op::Release(i) if !live.is_empty() => {
            let h = live.swap_remove(i % live.len());
            p.release(h);
          }
          _ => {}
        }
        if p.total_refs() as usize != live.len() {
          return TestResult::failed();
        }
        for idx in 0..p.len() {
          let held = live.iter().filter(|h| h.index() == idx).count();
          if p.ref_count(idx) as usize != held {
            return TestResult::failed();
          }
        }
      }
      live.into_iter().for_each(|h| p.release(h));
      TestResult::from_bool(p.free_slots() == p.len())
    }
  }
}
