//! Hostcall error types

use thiserror::Error;

use crate::service::ServiceId;
use crate::slot::SlotState;

/// Errors surfaced by the slot table, the encoder and the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostcallError {
    #[error("No handler registered for service id {id:#x}")]
    UnknownService { id: u32 },

    #[error("Slot table exhausted (capacity: {capacity})")]
    TableExhausted { capacity: usize },

    #[error("Service {service} failed with code {code:#x}")]
    HandlerFailure { service: ServiceId, code: u32 },

    #[error("Slot {slot} completed without an initialized reply")]
    MalformedReply { slot: usize },

    #[error("Malformed packet: service word {word:#x} does not fit in 32 bits")]
    MalformedPacket { word: u64 },

    #[error("Slot {slot} is {found:?}, expected {expected:?}")]
    SlotStateViolation {
        slot: usize,
        expected: SlotState,
        found: SlotState,
    },

    #[error("Slot {slot} was reused (generation {found}, caller holds {expected})")]
    CrossDelivery { slot: usize, expected: u64, found: u64 },

    #[error("A handler is already registered for {id}")]
    DuplicateService { id: ServiceId },

    #[error("Slot table capacity must be at least 1")]
    InvalidCapacity,

    #[error("A global hostcall table is already installed")]
    AlreadyInstalled,

    #[error("No global hostcall table is installed")]
    NotInstalled,

    #[error("Failed to spawn dispatcher thread: {0}")]
    Spawn(String),
}

pub type Result<T> = core::result::Result<T, HostcallError>;

/// Service-defined failure reported by a handler.
///
/// The code travels back to the caller in the second reply word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[error("service error code {code:#x}")]
pub struct ServiceError {
    pub code: u32,
}

impl ServiceError {
    /// Reported when a handler panics
    pub const PANICKED: Self = Self { code: u32::MAX };

    pub const fn new(code: u32) -> Self {
        Self { code }
    }
}
