//! Call slots and their state word
//!
//! # State word
//! Every transition of a slot is a single compare-and-swap on one `u64`:
//!
//! ```text
//! bits 0..=1   state tag (Free, Reserved, Submitted, Completed)
//! bit  2       CLAIMED    - a dispatcher is serving the packet
//! bit  3       ABANDONED  - the caller dropped its handle before the reply
//! bits 4..=7   reply status, set by the Submitted -> Completed flip
//! bits 8..=63  generation - bumped on every Free -> Reserved
//! ```
//!
//! The generation makes every CAS immune to ABA: a handle or a dispatcher
//! holding a stale generation can never move a slot that was recycled.
//!
//! # Memory ordering
//! Packet and reply words are Relaxed atomics. They are published by the
//! Release CAS that flips the tag (`Reserved -> Submitted`,
//! `Submitted -> Completed`) and observed through an Acquire load or CAS of
//! the state word, so neither side ever reads a half-written record.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use static_assertions::const_assert;

use crate::packet::{
    CallPacket, ReplyPacket, ReplyStatus, PACKET_WORDS, REPLY_WORDS, UNINITIALIZED_WORD,
};

/// Lifecycle of a slot: `Free -> Reserved -> Submitted -> Completed -> Free`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SlotState {
    /// Available to any caller
    Free = 0,
    /// Owned by a caller that is writing its packet
    Reserved = 1,
    /// Packet published, waiting for the dispatcher
    Submitted = 2,
    /// Reply published, waiting for the caller to consume it
    Completed = 3,
}

impl SlotState {
    const fn from_tag(tag: u64) -> Self {
        match tag {
            0 => SlotState::Free,
            1 => SlotState::Reserved,
            2 => SlotState::Submitted,
            _ => SlotState::Completed,
        }
    }
}

bitflags! {
    /// Auxiliary bits of the state word
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct SlotFlags: u64 {
        const CLAIMED   = 1 << 2;
        const ABANDONED = 1 << 3;
    }
}

const TAG_MASK: u64 = 0b11;
const STATUS_SHIFT: u32 = 4;
const STATUS_MASK: u64 = 0b1111 << STATUS_SHIFT;
const GENERATION_SHIFT: u32 = 8;
const GENERATION_MASK: u64 = u64::MAX >> GENERATION_SHIFT;

const fn next_generation(generation: u64) -> u64 {
    generation.wrapping_add(1) & GENERATION_MASK
}

/// Decoded snapshot of a slot's state word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StateWord(u64);

impl StateWord {
    pub(crate) const fn new(state: SlotState, generation: u64) -> Self {
        Self(((generation & GENERATION_MASK) << GENERATION_SHIFT) | state as u64)
    }

    pub(crate) const fn state(self) -> SlotState {
        SlotState::from_tag(self.0 & TAG_MASK)
    }

    pub(crate) const fn generation(self) -> u64 {
        self.0 >> GENERATION_SHIFT
    }

    pub(crate) fn flags(self) -> SlotFlags {
        SlotFlags::from_bits_truncate(self.0)
    }

    /// Reply status, meaningful once `Completed`; `None` for unknown bits
    pub(crate) const fn status(self) -> Option<ReplyStatus> {
        ReplyStatus::from_bits((self.0 & STATUS_MASK) >> STATUS_SHIFT)
    }

    fn with_status(self, status: ReplyStatus) -> Self {
        Self((self.0 & !STATUS_MASK) | ((status as u64) << STATUS_SHIFT))
    }

    fn with_state(self, state: SlotState) -> Self {
        Self((self.0 & !TAG_MASK) | state as u64)
    }

    fn with_flags(self, flags: SlotFlags) -> Self {
        Self(self.0 | flags.bits())
    }

    fn without_flags(self, flags: SlotFlags) -> Self {
        Self(self.0 & !flags.bits())
    }

    fn is(self, state: SlotState, generation: u64) -> bool {
        self.state() == state && self.generation() == generation
    }
}

/// One in-flight call: packet, reply and state tag.
///
/// Aligned to a cache line so neighbouring slots never share one.
#[repr(C, align(64))]
pub struct CallSlot {
    state: AtomicU64,
    packet: [AtomicU64; PACKET_WORDS],
    reply: [AtomicU64; REPLY_WORDS],
}

const_assert!(core::mem::align_of::<CallSlot>() == 64);
const_assert!(core::mem::size_of::<CallSlot>() % 64 == 0);

impl CallSlot {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU64::new(StateWord::new(SlotState::Free, 0).0),
            packet: core::array::from_fn(|_| AtomicU64::new(0)),
            reply: core::array::from_fn(|_| AtomicU64::new(UNINITIALIZED_WORD)),
        }
    }

    /// Current state tag
    pub fn state(&self) -> SlotState {
        self.load(Ordering::Acquire).state()
    }

    /// Current generation
    pub fn generation(&self) -> u64 {
        self.load(Ordering::Acquire).generation()
    }

    pub(crate) fn load(&self, order: Ordering) -> StateWord {
        StateWord(self.state.load(order))
    }

    fn transition(&self, current: StateWord, new: StateWord, success: Ordering) -> Result<(), StateWord> {
        self.state
            .compare_exchange(current.0, new.0, success, Ordering::Relaxed)
            .map(|_| ())
            .map_err(StateWord)
    }

    /// `Free -> Reserved`, returning the new generation
    pub(crate) fn try_reserve(&self) -> Option<u64> {
        let current = self.load(Ordering::Relaxed);
        if current.state() != SlotState::Free {
            return None;
        }
        let generation = next_generation(current.generation());
        self.transition(
            current,
            StateWord::new(SlotState::Reserved, generation),
            Ordering::Acquire,
        )
        .ok()
        .map(|_| generation)
    }

    /// Write `packet` and publish it: `Reserved -> Submitted`
    pub(crate) fn publish(
        &self,
        generation: u64,
        packet: &CallPacket,
        flags: SlotFlags,
    ) -> Result<(), StateWord> {
        let reserved = StateWord::new(SlotState::Reserved, generation);
        let current = self.load(Ordering::Relaxed);
        if current != reserved {
            return Err(current);
        }

        for (word, value) in self.packet.iter().zip(packet.encode()) {
            word.store(value, Ordering::Relaxed);
        }
        for word in &self.reply {
            word.store(UNINITIALIZED_WORD, Ordering::Relaxed);
        }

        let submitted = StateWord::new(SlotState::Submitted, generation).with_flags(flags);
        self.transition(reserved, submitted, Ordering::Release)
    }

    /// Mark an unclaimed `Submitted` slot as being served, returning its generation
    pub(crate) fn try_claim(&self) -> Option<u64> {
        let mut current = self.load(Ordering::Relaxed);
        loop {
            if current.state() != SlotState::Submitted || current.flags().contains(SlotFlags::CLAIMED)
            {
                return None;
            }
            match self.state.compare_exchange_weak(
                current.0,
                current.with_flags(SlotFlags::CLAIMED).0,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(current.generation()),
                Err(actual) => current = StateWord(actual),
            }
        }
    }

    pub(crate) fn read_packet(&self) -> [u64; PACKET_WORDS] {
        core::array::from_fn(|i| self.packet[i].load(Ordering::Relaxed))
    }

    /// Write `reply` and flip `Submitted -> Completed`, publishing `status`
    /// in the same CAS.
    ///
    /// Returns `true` when the caller had abandoned the slot and it was
    /// returned to `Free` here.
    pub(crate) fn complete(&self, generation: u64, reply: ReplyPacket, status: ReplyStatus) -> bool {
        // Only the claim holder moves a claimed slot out of Submitted
        let mut current = self.load(Ordering::Relaxed);
        if !current.is(SlotState::Submitted, generation)
            || !current.flags().contains(SlotFlags::CLAIMED)
        {
            log::error!(
                "complete: slot is not claimed ({:?}, generation {})",
                current.state(),
                current.generation()
            );
            return false;
        }

        for (word, value) in self.reply.iter().zip(reply.words()) {
            word.store(value, Ordering::Relaxed);
        }

        loop {
            let completed = current
                .with_state(SlotState::Completed)
                .with_status(status)
                .without_flags(SlotFlags::CLAIMED);
            match self.state.compare_exchange_weak(
                current.0,
                completed.0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return completed.flags().contains(SlotFlags::ABANDONED)
                        && self.release(generation).is_ok();
                }
                Err(actual) => current = StateWord(actual),
            }
        }
    }

    /// Observe the reply and its status for `generation` if it has been
    /// published
    pub(crate) fn poll_reply(
        &self,
        generation: u64,
    ) -> Result<Option<(ReplyPacket, Option<ReplyStatus>)>, StateWord> {
        let current = self.load(Ordering::Acquire);
        if current.generation() != generation {
            return Err(current);
        }
        if current.state() != SlotState::Completed {
            return Ok(None);
        }
        let reply = ReplyPacket(core::array::from_fn(|i| self.reply[i].load(Ordering::Relaxed)));
        Ok(Some((reply, current.status())))
    }

    /// Set the abandoned bit on a `Submitted` slot
    pub(crate) fn abandon(&self, generation: u64) -> Result<(), StateWord> {
        let mut current = self.load(Ordering::Relaxed);
        loop {
            if !current.is(SlotState::Submitted, generation) {
                return Err(current);
            }
            match self.state.compare_exchange_weak(
                current.0,
                current.with_flags(SlotFlags::ABANDONED).0,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = StateWord(actual),
            }
        }
    }

    /// `Completed -> Free`
    pub(crate) fn release(&self, generation: u64) -> Result<(), StateWord> {
        let mut current = self.load(Ordering::Relaxed);
        loop {
            if !current.is(SlotState::Completed, generation) {
                return Err(current);
            }
            match self.state.compare_exchange_weak(
                current.0,
                StateWord::new(SlotState::Free, generation).0,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = StateWord(actual),
            }
        }
    }
}
