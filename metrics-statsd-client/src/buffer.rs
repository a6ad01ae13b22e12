use std::{
    cell::UnsafeCell,
    fmt,
    ops::{Deref, DerefMut},
    sync::{
        atomic::{
            AtomicU8, AtomicUsize,
            Ordering::{AcqRel, Acquire, Relaxed, Release},
        },
        Arc,
    },
};

use crossbeam_utils::Backoff;
use tracing::warn;

use crate::builder::OverflowPolicy;

const UNLOCKED: u8 = 0;
const LOCKED_FOR_WRITE: u8 = 1;
const NEEDS_FLUSH: u8 = 2;

// Extra room reserved past the packet size, so the metric that crosses the threshold doesn't reallocate.
const SLOT_HEADROOM: usize = 200;

/// A byte region owned by whichever party won the transition into its current state.
struct Slot {
    state: AtomicU8,
    buf: UnsafeCell<Vec<u8>>,
}

impl Slot {
    fn new(capacity: usize) -> Self {
        Self { state: AtomicU8::new(UNLOCKED), buf: UnsafeCell::new(Vec::with_capacity(capacity)) }
    }

    fn try_transition(&self, from: u8, to: u8) -> Result<(), u8> {
        self.state.compare_exchange(from, to, Acquire, Relaxed).map(drop)
    }

    fn set_state(&self, from: u8, to: u8) {
        let previous = self.state.swap(to, AcqRel);
        debug_assert_eq!(previous, from, "slot was not in the expected state");
    }

    /// Returns the slot contents.
    ///
    /// # Safety
    ///
    /// The caller must own the slot, either through a `WriteGuard` or a `FlushToken` for it, or through a successful
    /// transition out of `UNLOCKED` that has not yet been undone.
    #[allow(clippy::mut_from_ref)]
    unsafe fn buf_mut(&self) -> &mut Vec<u8> {
        &mut *self.buf.get()
    }
}

// SAFETY: The contents of a slot are only ever reached by the single owner of its `LOCKED_FOR_WRITE` or `NEEDS_FLUSH`
// state, and ownership changes hands through acquire/release transitions of `state`.
unsafe impl Sync for Slot {}

struct Slots {
    slots: [Slot; 2],
    active: AtomicUsize,
    // Flush tokens handed out and not yet given back, plus claims that are about to become one.
    in_flight: AtomicUsize,
    max_packet_size: usize,
    overflow: OverflowPolicy,
}

impl Slots {
    fn token(self: &Arc<Self>, index: usize, len: usize) -> FlushToken {
        FlushToken { slots: Arc::clone(self), index, len, flushed: false }
    }

    /// Undoes a claim of a slot for flushing that did not turn into a token.
    fn unclaim(&self, slot: &Slot) {
        slot.set_state(NEEDS_FLUSH, UNLOCKED);
        self.in_flight.fetch_sub(1, Release);
    }

    /// Hands a slot waiting to be flushed back to writers, dropping the first `flushed` bytes.
    fn hand_back(&self, index: usize, flushed: usize) {
        let slot = &self.slots[index];

        // SAFETY: Called by the token that owns the slot, while it is still in `NEEDS_FLUSH`.
        unsafe { slot.buf_mut().drain(..flushed) };
        slot.set_state(NEEDS_FLUSH, UNLOCKED);
        self.in_flight.fetch_sub(1, Release);

        // Writers may have been rotated onto the other slot while it was itself still waiting on a flush. Point them
        // at this one instead of leaving them waiting on the network.
        let other = index ^ 1;
        if self.slots[other].state.load(Acquire) == NEEDS_FLUSH {
            let _ = self.active.compare_exchange(other, index, AcqRel, Relaxed);
        }
    }
}

/// Two buffer slots, one of which accepts writers at any given time.
///
/// Writers claim the active slot by moving it from `UNLOCKED` to `LOCKED_FOR_WRITE`, append their encoded metric, and
/// then release it. Once a release leaves the slot holding more than the maximum packet size, the slot is moved to
/// `NEEDS_FLUSH` and writers are pointed at the other slot while the full one is written out. When a slot is handed
/// back while the active one is still waiting on its own flush, writers are pointed back at the free slot.
///
/// Ownership of a slot is always represented by a value: a [`WriteGuard`] while writing, and a [`FlushToken`] while
/// flushing. Neither can be duplicated, and both give the slot back when they are released or dropped.
pub(crate) struct DoubleBuffer {
    inner: Arc<Slots>,
}

impl DoubleBuffer {
    /// Creates a new `DoubleBuffer`.
    pub fn new(max_packet_size: usize, overflow: OverflowPolicy) -> Self {
        let capacity = max_packet_size + SLOT_HEADROOM;
        let inner = Slots {
            slots: [Slot::new(capacity), Slot::new(capacity)],
            active: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_packet_size,
            overflow,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Returns the number of slots currently waiting to be flushed.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Acquire)
    }

    /// Acquires exclusive write access to the active slot.
    ///
    /// Spins, and eventually yields, while the active slot is held by another writer or waiting to be flushed. When
    /// the overflow policy is [`OverflowPolicy::Drop`] and the active slot stays stuck waiting on a flush, `None` is
    /// returned instead so that the caller can shed the metric.
    pub fn acquire_for_write(&self) -> Option<WriteGuard<'_>> {
        let inner = &self.inner;
        let backoff = Backoff::new();
        loop {
            let index = inner.active.load(Acquire);
            let slot = &inner.slots[index];
            match slot.try_transition(UNLOCKED, LOCKED_FOR_WRITE) {
                Ok(()) => {
                    // The slot may have been rotated out, flushed, and reset between reading the index and claiming
                    // it. Only the active slot takes writes.
                    if inner.active.load(Acquire) != index {
                        slot.set_state(LOCKED_FOR_WRITE, UNLOCKED);
                        continue;
                    }

                    // SAFETY: We just won `UNLOCKED` -> `LOCKED_FOR_WRITE`.
                    let start_len = unsafe { slot.buf_mut().len() };
                    return Some(WriteGuard { buffers: self, index, start_len, released: false });
                }
                Err(NEEDS_FLUSH) if inner.overflow == OverflowPolicy::Drop && backoff.is_completed() => return None,
                Err(_) => backoff.snooze(),
            }
        }
    }

    fn release_write(&self, index: usize, start_len: usize) -> Option<FlushToken> {
        let inner = &self.inner;
        let slot = &inner.slots[index];

        // SAFETY: Called with the slot still held in `LOCKED_FOR_WRITE` by the releasing guard.
        let len = unsafe { slot.buf_mut().len() };
        if len <= inner.max_packet_size {
            slot.set_state(LOCKED_FOR_WRITE, UNLOCKED);
            return None;
        }

        // Everything before this writer's metric fit, so that is what gets flushed. The new metric stays behind for
        // the next flush, unless it is too big to ever fit by itself.
        let flush_len = if start_len == 0 { len } else { start_len };

        inner.in_flight.fetch_add(1, AcqRel);
        inner.active.store(index ^ 1, Release);
        slot.set_state(LOCKED_FOR_WRITE, NEEDS_FLUSH);
        Some(inner.token(index, flush_len))
    }

    /// Rotates the active slot out for flushing, regardless of how full it is.
    ///
    /// Returns `None` if the active slot is empty, or if it is already waiting to be flushed.
    pub fn force_flush_rotation(&self) -> Option<FlushToken> {
        let inner = &self.inner;
        let backoff = Backoff::new();
        loop {
            let index = inner.active.load(Acquire);
            let slot = &inner.slots[index];

            inner.in_flight.fetch_add(1, AcqRel);
            match slot.try_transition(UNLOCKED, NEEDS_FLUSH) {
                Ok(()) => {
                    if inner.active.load(Acquire) != index {
                        inner.unclaim(slot);
                        continue;
                    }

                    // SAFETY: We just won `UNLOCKED` -> `NEEDS_FLUSH`.
                    let len = unsafe { slot.buf_mut().len() };
                    if len == 0 {
                        inner.unclaim(slot);
                        return None;
                    }

                    inner.active.store(index ^ 1, Release);
                    return Some(inner.token(index, len));
                }
                Err(state) => {
                    inner.in_flight.fetch_sub(1, Release);
                    if state == NEEDS_FLUSH {
                        return None;
                    }
                    backoff.snooze();
                }
            }
        }
    }

    /// Claims the inactive slot for flushing if it still holds bytes.
    ///
    /// A partial flush leaves the metric that overflowed the slot behind, in a slot that is no longer active. This
    /// picks that tail up without waiting for the slot to become active again.
    pub fn claim_inactive(&self) -> Option<FlushToken> {
        let inner = &self.inner;
        let index = inner.active.load(Acquire) ^ 1;
        let slot = &inner.slots[index];

        inner.in_flight.fetch_add(1, AcqRel);
        if slot.try_transition(UNLOCKED, NEEDS_FLUSH).is_err() {
            inner.in_flight.fetch_sub(1, Release);
            return None;
        }

        // SAFETY: We just won `UNLOCKED` -> `NEEDS_FLUSH`.
        let len = unsafe { slot.buf_mut().len() };
        if len == 0 || inner.active.load(Acquire) == index {
            inner.unclaim(slot);
            return None;
        }

        Some(inner.token(index, len))
    }

    /// Returns the bytes covered by the given flush token.
    ///
    /// The bytes always end on a line boundary.
    pub fn contents<'a>(&'a self, token: &'a FlushToken) -> &'a [u8] {
        debug_assert!(Arc::ptr_eq(&self.inner, &token.slots), "token belongs to another buffer");

        // SAFETY: The token proves that the slot is in `NEEDS_FLUSH`, and only the token holder touches it.
        let buf = unsafe { self.inner.slots[token.index].buf_mut() };
        &buf[..token.len]
    }

    /// Hands a flushed slot back to writers.
    ///
    /// Bytes past the flushed boundary are moved to the front of the slot and kept.
    pub fn complete_flush(&self, mut token: FlushToken) {
        debug_assert!(Arc::ptr_eq(&self.inner, &token.slots), "token belongs to another buffer");
        token.flushed = true;
        drop(token);
    }
}

/// Exclusive write access to a slot.
///
/// Dereferences to the slot contents. Writers must only ever append whole lines.
pub(crate) struct WriteGuard<'a> {
    buffers: &'a DoubleBuffer,
    index: usize,
    start_len: usize,
    released: bool,
}

impl WriteGuard<'_> {
    /// Releases the slot.
    ///
    /// If the slot grew past the maximum packet size, it is rotated out and the returned token must be flushed.
    #[must_use]
    pub fn release(mut self) -> Option<FlushToken> {
        self.released = true;
        self.buffers.release_write(self.index, self.start_len)
    }
}

impl Deref for WriteGuard<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        // SAFETY: The guard owns the slot until it is released or dropped.
        unsafe { self.buffers.inner.slots[self.index].buf_mut() }
    }
}

impl DerefMut for WriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: The guard owns the slot until it is released or dropped.
        unsafe { self.buffers.inner.slots[self.index].buf_mut() }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        // An unreleased guard (a writer that panicked midway) still has to give the slot back. Anything past the
        // point where it started writing may be a partial line, so cut it off.
        if !self.released {
            let slot = &self.buffers.inner.slots[self.index];

            // SAFETY: Still held in `LOCKED_FOR_WRITE` by this guard.
            unsafe { slot.buf_mut().truncate(self.start_len) };
            slot.set_state(LOCKED_FOR_WRITE, UNLOCKED);
        }
    }
}

/// Ownership of a slot that is waiting to be flushed.
///
/// Obtained from [`WriteGuard::release`], [`DoubleBuffer::force_flush_rotation`] or
/// [`DoubleBuffer::claim_inactive`], and given back through [`DoubleBuffer::complete_flush`]. A token dropped without
/// completing its flush still hands the slot back, with its contents intact, so they go out with a later flush.
#[must_use]
pub(crate) struct FlushToken {
    slots: Arc<Slots>,
    index: usize,
    len: usize,
    flushed: bool,
}

impl FlushToken {
    /// Returns the number of bytes to flush.
    pub fn len(&self) -> usize {
        self.len
    }
}

impl fmt::Debug for FlushToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlushToken").field("index", &self.index).field("len", &self.len).finish_non_exhaustive()
    }
}

impl Drop for FlushToken {
    fn drop(&mut self) {
        let flushed = if self.flushed {
            self.len
        } else {
            warn!(payload_len = self.len, "Flush token dropped before its slot was flushed, keeping the contents.");
            0
        };
        self.slots.hand_back(self.index, flushed);
    }
}
