//! KaaL Hostcall - device-to-host service calls over a shared slot table
//!
//! # Purpose
//! Lets many non-preemptible device threads request host-side services
//! (formatted output, remote function invocation, ...) and spin until the
//! host writes a 2-word reply back into the exact slot they used.
//!
//! # Integration Points
//! - Device side: [`Caller`], [`preview`] and the C entry point
//!   [`hostcall_preview`]
//! - Host side: [`Dispatcher`] with a [`ServiceRegistry`] of
//!   [`ServiceHandler`]s
//! - Shared: [`SlotTable`], sized by [`HostcallConfig`]
//!
//! # Architecture
//! ```text
//!  device thread                 slot table                dispatcher
//!  ─────────────                 ──────────                ──────────
//!  acquire ──────────────► Free -> Reserved
//!  write packet, publish ──► Reserved -> Submitted ──────► claim
//!                                                          run handler
//!  spin on state tag ◄──── Submitted -> Completed ◄─────── write reply
//!  read reply, release ──► Completed -> Free
//! ```
//!
//! # Design
//! - One packed atomic state word per slot, every transition a single CAS
//! - Payload words are Relaxed; the state flip publishes them (Release/Acquire)
//! - The reply status rides in the state word, so handler replies are never
//!   mistaken for protocol errors
//! - Generation counter in the state word, so a recycled slot is never
//!   mistaken for the one a caller is waiting on
//! - Readiness and completion are polled memory; there is no interrupt
//! - A submitted call cannot be cancelled
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use kaal_hostcall::{
//!     Backpressure, CallPacket, Caller, Dispatcher, HostcallConfig, ReplyPacket,
//!     ServiceError, ServiceId, ServiceRegistry, SlotTable,
//! };
//!
//! let table = Arc::new(SlotTable::new(16).unwrap());
//! let mut registry = ServiceRegistry::new();
//! registry
//!     .register(ServiceId::Other(7), |p: &CallPacket| -> Result<ReplyPacket, ServiceError> {
//!         Ok(ReplyPacket::new(p.arg(0) + p.arg(1), 0))
//!     })
//!     .unwrap();
//!
//! let running = Dispatcher::new(table.clone(), registry)
//!     .spawn(&HostcallConfig::default())
//!     .unwrap();
//!
//! let caller = Caller::new(table, Backpressure::FailFast);
//! assert_eq!(caller.call(ServiceId::Other(7), [2, 3, 0, 0, 0, 0, 0, 0]), Ok([5, 0]));
//! running.shutdown();
//! ```

pub mod caller;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod packet;
pub mod service;
pub mod slot;
pub mod table;

pub use caller::{global, hostcall_preview, install_global, preview, Caller, Long2};
pub use config::{Backpressure, HostcallConfig};
pub use dispatcher::{Dispatcher, DispatcherHandle, DispatcherStats, ServiceHandler, ServiceRegistry};
pub use error::{HostcallError, Result, ServiceError};
pub use packet::{
    CallPacket, ReplyPacket, ReplyStatus, Sentinel, ARG_WORDS, PACKET_WORDS, REPLY_SENTINEL,
    REPLY_WORDS, TABLE_EXHAUSTED_WORD, UNINITIALIZED_WORD, UNKNOWN_SERVICE_WORD,
};
pub use service::{ServiceId, SERVICE_ID_DEFAULT, SERVICE_ID_FUNCTION_CALL, SERVICE_ID_PRINTF};
pub use slot::{CallSlot, SlotState};
pub use table::{Completion, SlotHandle, SlotTable, TableStats};
