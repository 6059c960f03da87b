//! Device-side call surface
//!
//! # Purpose
//! Turns a `(service, args)` request into a published packet, spins until
//! the dispatcher answers it and hands back the 2-word reply.
//!
//! # Integration Points
//! - [`Caller`]: owned handle over a shared [`SlotTable`], used by host-side
//!   simulations and tests
//! - [`preview`] / [`hostcall_preview`]: the fixed-width device ABI, routed
//!   through a process-wide caller installed with [`install_global`]
//!
//! # Design
//! - One attempt per call: a dispatched packet is never resent
//! - No cancellation: once submitted, the caller waits for the reply
//! - Waiting never yields the thread (device threads are not preemptible)

use std::sync::{Arc, OnceLock};

use crossbeam::utils::Backoff;

use crate::config::Backpressure;
use crate::error::{HostcallError, Result};
use crate::packet::{CallPacket, ReplyPacket, ReplyStatus, ARG_WORDS, REPLY_WORDS};
use crate::service::ServiceId;
use crate::table::{Completion, SlotHandle, SlotTable};

/// Issues calls against a slot table
#[derive(Clone)]
pub struct Caller {
    table: Arc<SlotTable>,
    backpressure: Backpressure,
}

impl Caller {
    pub fn new(table: Arc<SlotTable>, backpressure: Backpressure) -> Self {
        Self {
            table,
            backpressure,
        }
    }

    pub fn table(&self) -> &Arc<SlotTable> {
        &self.table
    }

    pub fn backpressure(&self) -> Backpressure {
        self.backpressure
    }

    /// Acquire a slot, retrying according to the backpressure policy
    ///
    /// # Errors
    /// Returns `HostcallError::TableExhausted` once the policy gives up
    pub fn acquire(&self) -> Result<SlotHandle<'_>> {
        let attempts = match self.backpressure {
            Backpressure::FailFast => return self.table.acquire(),
            Backpressure::Bounded { attempts } => Some(attempts.max(1)),
            Backpressure::Unbounded => None,
        };

        let backoff = Backoff::new();
        let mut tried = 0u32;
        loop {
            match self.table.acquire() {
                Err(HostcallError::TableExhausted { capacity }) => {
                    tried = tried.saturating_add(1);
                    if attempts.is_some_and(|limit| tried >= limit) {
                        log::debug!("giving up after {} acquire attempts", tried);
                        return Err(HostcallError::TableExhausted { capacity });
                    }
                    backoff.spin();
                }
                other => return other,
            }
        }
    }

    /// Run one call and return the raw reply with its status
    ///
    /// # Errors
    /// Slot-level failures only: exhaustion under the backpressure policy,
    /// a slot that changed hands underneath the caller, or unknown status
    /// bits.
    pub fn call_raw(&self, packet: &CallPacket) -> Result<(usize, Completion)> {
        let mut handle = self.acquire()?;
        handle.submit(packet)?;
        let completion = handle.wait_completion()?;
        let index = handle.index();
        self.table.release(handle)?;
        Ok((index, completion))
    }

    /// Run one call and classify its reply by the status the dispatcher
    /// published. A handler's reply comes back as-is, even when its words
    /// look like a sentinel.
    ///
    /// # Errors
    /// - `UnknownService` if no handler is registered for `service`
    /// - `HandlerFailure` with the handler's code
    /// - `MalformedReply` if the slot completed with unknown status bits
    /// - `TableExhausted` if no slot could be acquired
    pub fn call(&self, service: ServiceId, args: [u64; ARG_WORDS]) -> Result<[u64; REPLY_WORDS]> {
        let (_, Completion { reply, status }) = self.call_raw(&CallPacket::new(service, args))?;
        match status {
            ReplyStatus::Ok => Ok(reply.words()),
            ReplyStatus::UnknownService => Err(HostcallError::UnknownService { id: service.raw() }),
            ReplyStatus::HandlerFailure => Err(HostcallError::HandlerFailure {
                service,
                code: reply.words()[1] as u32,
            }),
        }
    }

    /// Device ABI semantics: every outcome is a reply pair
    pub fn preview(&self, service_id: u32, args: [u64; ARG_WORDS]) -> ReplyPacket {
        let packet = CallPacket::new(ServiceId::from_raw(service_id), args);
        match self.call_raw(&packet) {
            Ok((_, completion)) => completion.reply,
            Err(HostcallError::TableExhausted { .. }) => ReplyPacket::TABLE_EXHAUSTED,
            Err(err) => {
                log::error!("preview({:#x}) failed: {}", service_id, err);
                ReplyPacket::UNINITIALIZED
            }
        }
    }
}

static GLOBAL: OnceLock<Caller> = OnceLock::new();

/// Install the process-wide caller used by [`preview`]
///
/// # Errors
/// Returns `HostcallError::AlreadyInstalled` on a second call
pub fn install_global(table: Arc<SlotTable>, backpressure: Backpressure) -> Result<()> {
    GLOBAL
        .set(Caller::new(table, backpressure))
        .map_err(|_| HostcallError::AlreadyInstalled)?;
    log::info!("global hostcall caller installed ({:?})", backpressure);
    Ok(())
}

/// The process-wide caller
///
/// # Errors
/// Returns `HostcallError::NotInstalled` before [`install_global`]
pub fn global() -> Result<&'static Caller> {
    GLOBAL.get().ok_or(HostcallError::NotInstalled)
}

/// Fixed-width device entry point: 8 argument words in, 2 words out.
///
/// Errors come back as sentinel replies, never as a panic. Before
/// [`install_global`] every call returns the table-exhausted sentinel.
#[allow(clippy::too_many_arguments)]
pub fn preview(
    service_id: u32,
    arg0: u64,
    arg1: u64,
    arg2: u64,
    arg3: u64,
    arg4: u64,
    arg5: u64,
    arg6: u64,
    arg7: u64,
) -> (u64, u64) {
    let args = [arg0, arg1, arg2, arg3, arg4, arg5, arg6, arg7];
    match global() {
        Ok(caller) => caller.preview(service_id, args).into(),
        Err(err) => {
            log::error!("preview({:#x}): {}", service_id, err);
            ReplyPacket::TABLE_EXHAUSTED.into()
        }
    }
}

/// Two 64-bit words returned by value across the C ABI
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Long2 {
    pub x: u64,
    pub y: u64,
}

impl From<(u64, u64)> for Long2 {
    fn from((x, y): (u64, u64)) -> Self {
        Self { x, y }
    }
}

/// C entry point for [`preview`]
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub extern "C" fn hostcall_preview(
    service_id: u32,
    arg0: u64,
    arg1: u64,
    arg2: u64,
    arg3: u64,
    arg4: u64,
    arg5: u64,
    arg6: u64,
    arg7: u64,
) -> Long2 {
    preview(service_id, arg0, arg1, arg2, arg3, arg4, arg5, arg6, arg7).into()
}
