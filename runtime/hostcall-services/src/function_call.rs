//! `FunctionCall` service: invoke host functions by id
//!
//! The device sends the id of the function it wants (in practice the
//! device-side function pointer) in `args[0]` and up to seven argument
//! words after it. The host looks the id up in a [`FunctionTable`] built
//! at startup and replies with the function's two result words.

use std::collections::BTreeMap;

use kaal_hostcall::{CallPacket, ReplyPacket, ServiceError, ServiceHandler};
use thiserror::Error;

/// Argument words a host function receives
pub const FUNCTION_ARGS: usize = 7;

/// A host function callable from the device
pub type HostFunction = dyn Fn(&[u64; FUNCTION_ARGS]) -> [u64; 2] + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FunctionCallError {
    #[error("no host function registered for id {id:#x}")]
    UnknownFunction { id: u64 },

    #[error("host function {id:#x} is already registered")]
    DuplicateFunction { id: u64 },
}

impl FunctionCallError {
    /// Code reported in the handler-failure reply
    pub const fn code(&self) -> u32 {
        match self {
            FunctionCallError::UnknownFunction { .. } => 1,
            FunctionCallError::DuplicateFunction { .. } => 2,
        }
    }
}

impl From<FunctionCallError> for ServiceError {
    fn from(err: FunctionCallError) -> Self {
        ServiceError::new(err.code())
    }
}

/// Host functions keyed by device function id
#[derive(Default)]
pub struct FunctionTable {
    functions: BTreeMap<u64, Box<HostFunction>>,
}

impl FunctionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` under `id`
    ///
    /// # Errors
    /// Returns `FunctionCallError::DuplicateFunction` if `id` is taken
    pub fn register<F>(&mut self, id: u64, function: F) -> Result<(), FunctionCallError>
    where
        F: Fn(&[u64; FUNCTION_ARGS]) -> [u64; 2] + Send + Sync + 'static,
    {
        if self.functions.contains_key(&id) {
            return Err(FunctionCallError::DuplicateFunction { id });
        }
        self.functions.insert(id, Box::new(function));
        log::debug!("host function {:#x} registered", id);
        Ok(())
    }

    pub fn contains(&self, id: u64) -> bool {
        self.functions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Invoke function `id` directly
    pub fn invoke(&self, id: u64, args: &[u64; FUNCTION_ARGS]) -> Result<[u64; 2], FunctionCallError> {
        let function = self
            .functions
            .get(&id)
            .ok_or(FunctionCallError::UnknownFunction { id })?;
        Ok(function(args))
    }
}

impl ServiceHandler for FunctionTable {
    fn handle(&self, packet: &CallPacket) -> Result<ReplyPacket, ServiceError> {
        let id = packet.arg(0);
        let mut args = [0u64; FUNCTION_ARGS];
        args.copy_from_slice(&packet.args()[1..]);

        self.invoke(id, &args).map(ReplyPacket).map_err(|err| {
            log::warn!("function call: {}", err);
            err.into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kaal_hostcall::ServiceId;

    #[test]
    fn test_invoke_registered_function() {
        let mut table = FunctionTable::new();
        table.register(0x40, |a| [a[0] * a[1], a[6]]).unwrap();

        let packet = CallPacket::new(ServiceId::FunctionCall, [0x40, 6, 7, 0, 0, 0, 0, 9]);
        assert_eq!(table.handle(&packet), Ok(ReplyPacket::new(42, 9)));
    }

    #[test]
    fn test_unknown_function_code() {
        let table = FunctionTable::new();
        let packet = CallPacket::new(ServiceId::FunctionCall, [0x99, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(table.handle(&packet), Err(ServiceError::new(1)));
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut table = FunctionTable::new();
        table.register(1, |_| [0, 0]).unwrap();
        assert_eq!(
            table.register(1, |_| [1, 1]),
            Err(FunctionCallError::DuplicateFunction { id: 1 })
        );
        assert_eq!(table.len(), 1);
    }
}
