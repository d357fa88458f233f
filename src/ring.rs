use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::frame::Frame;
use crate::gateway::ConfigError;

/// Bounded single-producer/single-consumer ring of [`Frame`] slots.
///
/// Each channel owns two of these: a TX ring (main level produces, the
/// transmit interrupt consumes) and an RX ring (the receive interrupt
/// produces, main level consumes). Slot storage is lent by the caller at
/// attach time; capacity is the storage length.
///
/// The protocol splits "acquire a slot" from "hand it over": [`grant`] returns
/// a writable slot that stays invisible to the consumer until [`commit`]
/// publishes it, and [`peek`] returns the oldest visible slot which stays
/// owned by the consumer until [`release`] returns it to the free pool. This
/// lets the producing side fill a slot field by field before it becomes
/// eligible for the other context.
///
/// Calling a producer operation again before its commit is harmless and
/// yields the same slot, but the reference returned by the previous call must
/// no longer be alive.
///
/// Full and empty are told apart by comparing the two free-running indices
/// against the capacity; no sentinel value ever lives inside a slot.
///
/// [`grant`]: FrameRing::grant
/// [`commit`]: FrameRing::commit
/// [`peek`]: FrameRing::peek
/// [`release`]: FrameRing::release
pub struct FrameRing<'q> {
    slots: UnsafeCell<*mut Frame>,
    capacity: UnsafeCell<usize>,
    /// Count of slots ever committed. Written by the producer only.
    tail: AtomicUsize,
    /// Count of slots ever released. Written by the consumer only.
    head: AtomicUsize,
    storage: PhantomData<&'q mut [Frame]>,
}

// SAFETY: the ring is shared between exactly one producer context and one
// consumer context (single-core: interrupts preempt main, never the other way
// round). The producer writes only `tail`, the consumer writes only `head`,
// and slot `i % capacity` is reachable by at most one role at a time: the
// producer while `head <= i < tail` does not hold, the consumer while it
// does. Slot contents written before the Release store of `tail` are visible
// after the matching Acquire load; the same edge covers `head` in the other
// direction. `slots`/`capacity` are written only through `attach`/`detach`,
// which the channel state machine confines to main level while the bus is not
// involved in traffic.
unsafe impl Sync for FrameRing<'_> {}

impl<'q> FrameRing<'q> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: UnsafeCell::new(ptr::null_mut()),
            capacity: UnsafeCell::new(0),
            tail: AtomicUsize::new(0),
            head: AtomicUsize::new(0),
            storage: PhantomData,
        }
    }

    /// Lends `storage` to the ring and resets it to empty. Storage must hold
    /// at least one frame.
    pub(crate) fn attach(&self, storage: &'q mut [Frame]) -> Result<(), ConfigError> {
        if storage.is_empty() {
            return Err(ConfigError::EmptyQueue);
        }

        // SAFETY: attach runs on main level while no interrupt traffic uses
        // this ring (callers hold the bus out of `On`).
        unsafe {
            *self.capacity.get() = storage.len();
            *self.slots.get() = storage.as_mut_ptr();
        }
        self.tail.store(0, Ordering::Relaxed);
        self.head.store(0, Ordering::Relaxed);
        Ok(())
    }

    /// Forgets the lent storage. The ring rejects all traffic afterwards.
    pub(crate) fn detach(&self) {
        // SAFETY: as for `attach`.
        unsafe {
            *self.capacity.get() = 0;
            *self.slots.get() = ptr::null_mut();
        }
        self.tail.store(0, Ordering::Relaxed);
        self.head.store(0, Ordering::Relaxed);
    }

    pub fn is_attached(&self) -> bool {
        self.capacity() != 0
    }

    /// Slot count of the lent storage; 0 while unattached.
    pub fn capacity(&self) -> usize {
        // SAFETY: written only while no other context uses the ring.
        unsafe { *self.capacity.get() }
    }

    /// Number of committed but not yet released frames.
    pub fn len(&self) -> usize {
        self.tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.head.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.is_attached() && self.len() == self.capacity()
    }

    /// Producer: returns an exclusive, not-yet-visible slot to write into, or
    /// `None` when every slot is taken. Never blocks; the caller decides the
    /// drop/backpressure policy.
    pub fn grant(&self) -> Option<&mut Frame> {
        let capacity = self.capacity();
        if capacity == 0 {
            return None;
        }

        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) == capacity {
            return None;
        }

        // SAFETY: `tail % capacity` is outside the consumer's
        // `[head, tail)` window, so this slot is exclusively the
        // producer's until `commit`.
        Some(unsafe { &mut *(*self.slots.get()).add(tail % capacity) })
    }

    /// Producer: publishes the slot returned by the last [`grant`] to the
    /// consumer. A commit without a preceding successful grant is a no-op.
    ///
    /// [`grant`]: FrameRing::grant
    pub fn commit(&self) {
        let capacity = self.capacity();
        if capacity == 0 {
            return;
        }

        let tail = self.tail.load(Ordering::Relaxed);
        if tail.wrapping_sub(self.head.load(Ordering::Acquire)) < capacity {
            self.tail.store(tail.wrapping_add(1), Ordering::Release);
        }
    }

    /// Consumer: returns the oldest visible slot without removing it, or
    /// `None` when nothing is committed.
    pub fn peek(&self) -> Option<&Frame> {
        let capacity = self.capacity();
        if capacity == 0 {
            return None;
        }

        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if tail == head {
            return None;
        }

        // SAFETY: `head % capacity` is inside `[head, tail)`, the consumer's
        // window, until `release`.
        Some(unsafe { &*(*self.slots.get()).add(head % capacity) })
    }

    /// Consumer: returns the oldest visible slot to the producer's free pool.
    /// A release on an empty ring is a no-op.
    pub fn release(&self) {
        let head = self.head.load(Ordering::Relaxed);
        if self.tail.load(Ordering::Acquire) != head {
            self.head.store(head.wrapping_add(1), Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use embedded_can::StandardId;

    use crate::{ConfigError, Frame, FrameRing};

    fn frame(id: u16, byte: u8) -> Frame {
        Frame::new(StandardId::new(id).unwrap(), &[byte]).unwrap()
    }

    #[test]
    fn rejects_empty_storage() {
        let mut storage: [Frame; 0] = [];
        let ring = FrameRing::new();

        assert_eq!(ring.attach(&mut storage), Err(ConfigError::EmptyQueue));
        assert!(!ring.is_attached());
    }

    #[test]
    fn unattached_ring_rejects_traffic() {
        let ring = FrameRing::new();

        assert!(ring.grant().is_none());
        assert!(ring.peek().is_none());
        ring.commit();
        ring.release();
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn commits_are_consumed_in_order() {
        let mut storage = [Frame::EMPTY; 4];
        let ring = FrameRing::new();
        ring.attach(&mut storage).unwrap();

        for id in 1..=4u16 {
            let slot = ring.grant().unwrap();
            slot.copy_from(&frame(id, id as u8));
            ring.commit();
        }

        for id in 1..=4u16 {
            let slot = ring.peek().unwrap();
            assert_eq!(slot.id(), StandardId::new(id).unwrap().into());
            assert_eq!(slot.data(), &[id as u8]);
            ring.release();
        }

        assert!(ring.peek().is_none());
    }

    #[test]
    fn full_ring_refuses_grants_until_drained() {
        let mut storage = [Frame::EMPTY; 2];
        let ring = FrameRing::new();
        ring.attach(&mut storage).unwrap();

        for id in 1..=2u16 {
            ring.grant().unwrap().copy_from(&frame(id, 0));
            ring.commit();
        }

        assert!(ring.is_full());
        assert!(ring.grant().is_none());

        ring.peek().unwrap();
        ring.release();

        let slot = ring.grant().unwrap();
        slot.copy_from(&frame(3, 0));
        ring.commit();

        // FIFO order survives the wrap-around
        assert_eq!(ring.peek().unwrap().id(), StandardId::new(2).unwrap().into());
        ring.release();
        assert_eq!(ring.peek().unwrap().id(), StandardId::new(3).unwrap().into());
    }

    #[test]
    fn granted_but_uncommitted_slot_stays_invisible() {
        let mut storage = [Frame::EMPTY; 2];
        let ring = FrameRing::new();
        ring.attach(&mut storage).unwrap();

        ring.grant().unwrap().copy_from(&frame(0x55, 0xAA));
        assert!(ring.peek().is_none());

        ring.commit();
        assert_eq!(ring.peek().unwrap().data(), &[0xAA]);
    }

    #[test]
    fn regrant_before_commit_returns_the_same_slot() {
        let mut storage = [Frame::EMPTY; 2];
        let ring = FrameRing::new();
        ring.attach(&mut storage).unwrap();

        ring.grant().unwrap().copy_from(&frame(0x11, 1));
        let again = ring.grant().unwrap();
        assert_eq!(again.id(), StandardId::new(0x11).unwrap().into());
    }

    #[test]
    fn consumed_slot_is_not_recycled_before_release() {
        let mut storage = [Frame::EMPTY; 2];
        let ring = FrameRing::new();
        ring.attach(&mut storage).unwrap();

        for id in 1..=2u16 {
            ring.grant().unwrap().copy_from(&frame(id, id as u8));
            ring.commit();
        }

        // Consumer holds the oldest slot; the producer must not reuse it.
        assert_eq!(ring.peek().unwrap().data(), &[1]);
        assert!(ring.grant().is_none());

        ring.release();
        ring.grant().unwrap().copy_from(&frame(3, 3));
        ring.commit();

        assert_eq!(ring.peek().unwrap().data(), &[2]);
    }

    #[test]
    fn detach_resets_the_ring() {
        let mut storage = [Frame::EMPTY; 2];
        let ring = FrameRing::new();
        ring.attach(&mut storage).unwrap();

        ring.grant().unwrap().copy_from(&frame(1, 1));
        ring.commit();

        ring.detach();
        assert!(!ring.is_attached());
        assert!(ring.peek().is_none());
        assert!(ring.grant().is_none());
    }
}
