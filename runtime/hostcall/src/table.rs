//! Slot table - the shared arena both sides synchronize on
//!
//! # Architecture
//! A fixed array of [`CallSlot`]s. Callers claim a slot with a single CAS
//! (`Free -> Reserved`), scanning from a rotating hint so concurrent callers
//! start at different slots. There is no lock across slots: every operation
//! touches exactly one slot's state word.
//!
//! # Ownership
//! A successful [`SlotTable::acquire`] returns a [`SlotHandle`], the only
//! proof of ownership for that slot generation. The handle is not `Clone`;
//! dropping it on any path hands the slot back through a legal transition:
//!
//! - `Reserved`: a `Default` packet is published with the abandoned bit set,
//!   the dispatcher answers it and frees the slot
//! - `Submitted`: the abandoned bit is set, the dispatcher frees the slot
//!   once it has completed it
//! - `Completed`: the slot is freed immediately
//!
//! # Cancellation
//! There is none. A submitted packet is always served; a caller waiting on
//! a slot the host never completes waits forever.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam::utils::Backoff;

use crate::error::{HostcallError, Result};
use crate::packet::{CallPacket, ReplyPacket, ReplyStatus};
use crate::service::ServiceId;
use crate::slot::{CallSlot, SlotFlags, SlotState, StateWord};

/// Snapshot of table counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableStats {
    /// Successful acquisitions
    pub acquired: u64,
    /// Acquisitions that found every slot busy
    pub exhausted: u64,
    /// Explicit releases by callers
    pub released: u64,
    /// Handles dropped without an explicit release
    pub abandoned: u64,
}

#[derive(Default)]
struct TableCounters {
    acquired: AtomicU64,
    exhausted: AtomicU64,
    released: AtomicU64,
    abandoned: AtomicU64,
}

/// Fixed-capacity arena of call slots
pub struct SlotTable {
    slots: Box<[CallSlot]>,
    hint: AtomicUsize,
    counters: TableCounters,
}

impl SlotTable {
    /// Create a table of `capacity` free slots
    ///
    /// # Errors
    /// Returns `HostcallError::InvalidCapacity` if `capacity` is zero
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(HostcallError::InvalidCapacity);
        }
        let slots = (0..capacity).map(|_| CallSlot::new()).collect();
        log::debug!("slot table created with {} slots", capacity);
        Ok(Self {
            slots,
            hint: AtomicUsize::new(0),
            counters: TableCounters::default(),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Claim one free slot.
    ///
    /// Single attempt: every slot is tried once starting from the rotating
    /// hint. Retrying is the caller's policy (see `Backpressure`).
    ///
    /// # Errors
    /// Returns `HostcallError::TableExhausted` if no slot was free
    pub fn acquire(&self) -> Result<SlotHandle<'_>> {
        let capacity = self.slots.len();
        let start = self.hint.fetch_add(1, Ordering::Relaxed) % capacity;

        for offset in 0..capacity {
            let index = (start + offset) % capacity;
            if let Some(generation) = self.slots[index].try_reserve() {
                self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                log::trace!("slot {} reserved (generation {})", index, generation);
                return Ok(SlotHandle {
                    table: self,
                    index,
                    generation,
                });
            }
        }

        self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
        Err(HostcallError::TableExhausted { capacity })
    }

    /// Return a completed slot to `Free`.
    ///
    /// # Errors
    /// Returns `HostcallError::SlotStateViolation` if the slot is not
    /// `Completed`. The handle is then dropped, which hands the slot back
    /// through its drop path.
    pub fn release(&self, handle: SlotHandle<'_>) -> Result<()> {
        debug_assert!(core::ptr::eq(self, handle.table), "handle from another table");
        let slot = &self.slots[handle.index];
        match slot.release(handle.generation) {
            Ok(()) => {
                self.counters.released.fetch_add(1, Ordering::Relaxed);
                log::trace!("slot {} released", handle.index);
                core::mem::forget(handle);
                Ok(())
            }
            Err(found) => Err(HostcallError::SlotStateViolation {
                slot: handle.index,
                expected: SlotState::Completed,
                found: found.state(),
            }),
        }
    }

    /// Number of slots currently `Reserved` or `Submitted`
    pub fn in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.state(), SlotState::Reserved | SlotState::Submitted))
            .count()
    }

    /// State of slot `index`, `None` if out of range
    pub fn slot_state(&self, index: usize) -> Option<SlotState> {
        self.slots.get(index).map(CallSlot::state)
    }

    pub fn stats(&self) -> TableStats {
        TableStats {
            acquired: self.counters.acquired.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            released: self.counters.released.load(Ordering::Relaxed),
            abandoned: self.counters.abandoned.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn slots(&self) -> &[CallSlot] {
        &self.slots
    }
}

/// A published reply and how the dispatcher produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub reply: ReplyPacket,
    pub status: ReplyStatus,
}

/// Exclusive ownership of one slot generation
#[must_use = "dropping a handle abandons the slot"]
pub struct SlotHandle<'t> {
    table: &'t SlotTable,
    index: usize,
    generation: u64,
}

impl<'t> SlotHandle<'t> {
    /// Index of the slot in its table
    pub fn index(&self) -> usize {
        self.index
    }

    /// Generation this handle owns
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn slot(&self) -> &'t CallSlot {
        &self.table.slots[self.index]
    }

    fn violation(&self, expected: SlotState, found: StateWord) -> HostcallError {
        if found.generation() != self.generation {
            HostcallError::CrossDelivery {
                slot: self.index,
                expected: self.generation,
                found: found.generation(),
            }
        } else {
            HostcallError::SlotStateViolation {
                slot: self.index,
                expected,
                found: found.state(),
            }
        }
    }

    /// Write `packet` and publish it to the dispatcher
    ///
    /// # Errors
    /// Returns `HostcallError::SlotStateViolation` if the slot was already
    /// submitted
    pub fn submit(&mut self, packet: &CallPacket) -> Result<()> {
        self.slot()
            .publish(self.generation, packet, SlotFlags::empty())
            .map_err(|found| self.violation(SlotState::Reserved, found))?;
        log::trace!("slot {} submitted {}", self.index, packet.service_id());
        Ok(())
    }

    /// The reply and its status if the dispatcher has completed this slot
    ///
    /// # Errors
    /// - `CrossDelivery` if the slot no longer belongs to this handle's
    ///   generation
    /// - `MalformedReply` if the status bits hold no known status
    pub fn try_completion(&self) -> Result<Option<Completion>> {
        let polled = self
            .slot()
            .poll_reply(self.generation)
            .map_err(|found| self.violation(SlotState::Completed, found))?;
        match polled {
            None => Ok(None),
            Some((reply, Some(status))) => Ok(Some(Completion { reply, status })),
            Some((_, None)) => Err(HostcallError::MalformedReply { slot: self.index }),
        }
    }

    /// The reply words if the dispatcher has completed this slot
    ///
    /// # Errors
    /// As [`SlotHandle::try_completion`]
    pub fn try_reply(&self) -> Result<Option<ReplyPacket>> {
        Ok(self.try_completion()?.map(|completion| completion.reply))
    }

    /// Spin until the dispatcher completes this slot.
    ///
    /// Never yields the thread and never gives up: the only exit is the
    /// state tag flipping to `Completed`.
    pub fn wait_completion(&self) -> Result<Completion> {
        let backoff = Backoff::new();
        loop {
            if let Some(completion) = self.try_completion()? {
                return Ok(completion);
            }
            backoff.spin();
        }
    }

    /// [`SlotHandle::wait_completion`], reply words only
    pub fn wait_reply(&self) -> Result<ReplyPacket> {
        Ok(self.wait_completion()?.reply)
    }
}

impl SlotHandle<'_> {
    fn release_on_drop(&self, slot: &CallSlot) {
        match slot.release(self.generation) {
            Ok(()) => log::debug!("slot {} freed on drop", self.index),
            Err(found) => log::debug!(
                "slot {} not freed on drop: {:?} (generation {}, handle {})",
                self.index,
                found.state(),
                found.generation(),
                self.generation
            ),
        }
    }
}

impl Drop for SlotHandle<'_> {
    fn drop(&mut self) {
        let slot = self.slot();
        let current = slot.load(Ordering::Acquire);
        if current.generation() != self.generation {
            return;
        }
        self.table.counters.abandoned.fetch_add(1, Ordering::Relaxed);

        match current.state() {
            SlotState::Reserved => {
                let noop = CallPacket::new(ServiceId::Default, [0; 8]);
                if slot.publish(self.generation, &noop, SlotFlags::ABANDONED).is_ok() {
                    log::debug!("slot {} abandoned before submission", self.index);
                }
            }
            SlotState::Submitted => {
                if slot.abandon(self.generation).is_ok() {
                    log::debug!("slot {} abandoned while submitted", self.index);
                } else {
                    // Completion raced ahead of us
                    self.release_on_drop(slot);
                }
            }
            SlotState::Completed => self.release_on_drop(slot),
            SlotState::Free => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn serve_all(table: &SlotTable, reply: ReplyPacket) -> usize {
        let mut served = 0;
        for slot in table.slots() {
            if let Some(generation) = slot.try_claim() {
                slot.complete(generation, reply, ReplyStatus::Ok);
                served += 1;
            }
        }
        served
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(SlotTable::new(0), Err(HostcallError::InvalidCapacity)));
    }

    #[test]
    fn test_acquire_distinct_slots_until_exhausted() {
        let table = SlotTable::new(4).unwrap();
        let handles: Vec<_> = (0..4).map(|_| table.acquire().unwrap()).collect();

        let indices: HashSet<_> = handles.iter().map(SlotHandle::index).collect();
        assert_eq!(indices.len(), 4);
        assert_eq!(table.in_flight(), 4);

        assert_eq!(
            table.acquire().err(),
            Some(HostcallError::TableExhausted { capacity: 4 })
        );
        assert_eq!(table.stats().exhausted, 1);
    }

    #[test]
    fn test_submit_complete_release() {
        let table = SlotTable::new(2).unwrap();
        let mut handle = table.acquire().unwrap();
        handle
            .submit(&CallPacket::new(ServiceId::FunctionCall, [7; 8]))
            .unwrap();
        assert_eq!(handle.try_reply().unwrap(), None);

        assert_eq!(serve_all(&table, ReplyPacket::new(1, 2)), 1);
        assert_eq!(handle.wait_reply().unwrap(), ReplyPacket::new(1, 2));

        let index = handle.index();
        table.release(handle).unwrap();
        assert_eq!(table.slot_state(index), Some(SlotState::Free));
        assert_eq!(table.stats().released, 1);
        assert_eq!(table.stats().abandoned, 0);
    }

    #[test]
    fn test_release_before_completion_is_rejected() {
        let table = SlotTable::new(1).unwrap();
        let mut handle = table.acquire().unwrap();
        handle.submit(&CallPacket::new(ServiceId::Default, [0; 8])).unwrap();

        let result = table.release(handle);
        assert_eq!(
            result,
            Err(HostcallError::SlotStateViolation {
                slot: 0,
                expected: SlotState::Completed,
                found: SlotState::Submitted,
            })
        );

        // The handle was abandoned; serving the slot frees it
        assert_eq!(serve_all(&table, ReplyPacket::ZERO), 1);
        assert_eq!(table.slot_state(0), Some(SlotState::Free));
    }

    #[test]
    fn test_double_submit_rejected() {
        let table = SlotTable::new(1).unwrap();
        let mut handle = table.acquire().unwrap();
        let packet = CallPacket::new(ServiceId::Default, [0; 8]);
        handle.submit(&packet).unwrap();
        assert!(matches!(
            handle.submit(&packet),
            Err(HostcallError::SlotStateViolation { found: SlotState::Submitted, .. })
        ));
    }

    #[test]
    fn test_dropped_reserved_handle_goes_through_dispatcher() {
        let table = SlotTable::new(1).unwrap();
        drop(table.acquire().unwrap());

        // Not free yet: the legal path runs through the dispatcher
        assert_eq!(table.slot_state(0), Some(SlotState::Submitted));
        assert!(table.acquire().is_err());

        assert_eq!(serve_all(&table, ReplyPacket::ZERO), 1);
        assert_eq!(table.slot_state(0), Some(SlotState::Free));
        assert!(table.acquire().is_ok());
    }

    #[test]
    fn test_dropped_completed_handle_frees_slot() {
        let table = SlotTable::new(1).unwrap();
        let mut handle = table.acquire().unwrap();
        handle.submit(&CallPacket::new(ServiceId::Default, [0; 8])).unwrap();
        serve_all(&table, ReplyPacket::ZERO);
        drop(handle);
        assert_eq!(table.slot_state(0), Some(SlotState::Free));
        assert_eq!(table.stats().abandoned, 1);
    }

    #[test]
    fn test_completion_carries_status() {
        let table = SlotTable::new(1).unwrap();
        let mut handle = table.acquire().unwrap();
        handle.submit(&CallPacket::new(ServiceId::Other(9), [0; 8])).unwrap();
        assert_eq!(handle.try_completion().unwrap(), None);

        let slot = &table.slots()[handle.index()];
        let generation = slot.try_claim().unwrap();
        slot.complete(generation, ReplyPacket::UNKNOWN_SERVICE, ReplyStatus::UnknownService);

        assert_eq!(
            handle.wait_completion().unwrap(),
            Completion {
                reply: ReplyPacket::UNKNOWN_SERVICE,
                status: ReplyStatus::UnknownService,
            }
        );
        table.release(handle).unwrap();
    }

    #[test]
    fn test_failed_drop_release_leaves_slot_untouched() {
        let table = SlotTable::new(1).unwrap();
        let mut handle = table.acquire().unwrap();
        handle.submit(&CallPacket::new(ServiceId::Default, [0; 8])).unwrap();

        // Not Completed yet: the release is refused and only logged
        handle.release_on_drop(&table.slots()[0]);
        assert_eq!(table.slot_state(0), Some(SlotState::Submitted));

        serve_all(&table, ReplyPacket::ZERO);
        handle.release_on_drop(&table.slots()[0]);
        assert_eq!(table.slot_state(0), Some(SlotState::Free));
        core::mem::forget(handle);
    }

    #[test]
    fn test_unserved_slot_never_completes() {
        let table = SlotTable::new(1).unwrap();
        let mut handle = table.acquire().unwrap();
        handle.submit(&CallPacket::new(ServiceId::Printf, [0; 8])).unwrap();

        let backoff = Backoff::new();
        for _ in 0..10_000 {
            assert_eq!(handle.try_reply().unwrap(), None);
            backoff.spin();
        }
        assert_eq!(table.slot_state(0), Some(SlotState::Submitted));
    }
}
