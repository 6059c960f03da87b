//! KaaL Hostcall Services - the built-in host-side handlers
//!
//! # Purpose
//! Implements the services every hostcall dispatcher is expected to carry:
//! - [`FunctionTable`]: `FunctionCall`, invoke a host function by id
//! - [`PrintfService`]: `Printf`, formatted output streamed over several calls
//!
//! # Integration Points
//! - Depends on: `kaal-hostcall` (packets, `ServiceHandler`, `Caller`)
//! - Provides to: anything that builds a `ServiceRegistry`

pub mod format;
pub mod function_call;
pub mod printf;

use std::sync::Arc;

use kaal_hostcall::{ServiceId, ServiceRegistry};

pub use format::{format, FormatError};
pub use function_call::{FunctionCallError, FunctionTable, HostFunction, FUNCTION_ARGS};
pub use printf::{
    device_printf, ChunkKind, Control, ControlFlags, PrintfArg, PrintfError, PrintfLimits,
    PrintfService, PrintfWriter, SharedBuffer,
};

/// Register `FunctionCall` and `Printf` on `registry`
///
/// # Errors
/// `DuplicateService` if either id already has a handler
pub fn register_builtins(
    registry: &mut ServiceRegistry,
    functions: FunctionTable,
    printf: Arc<PrintfService>,
) -> kaal_hostcall::Result<()> {
    registry.register(ServiceId::FunctionCall, functions)?;
    registry.register_arc(ServiceId::Printf, printf)?;
    Ok(())
}
