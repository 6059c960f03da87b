//! Service identifiers
//!
//! The identifier space is open: `0..=2` are the built-in services, every
//! other value is carried as [`ServiceId::Other`] and is unknown to a
//! dispatcher until a handler is registered for it. Conversion from the raw
//! `u32` never folds an unknown value into [`ServiceId::Default`].

use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};

/// Raw identifier of the reserved no-op service
pub const SERVICE_ID_DEFAULT: u32 = 0;
/// Raw identifier of the generic remote invocation service
pub const SERVICE_ID_FUNCTION_CALL: u32 = 1;
/// Raw identifier of the formatted output service
pub const SERVICE_ID_PRINTF: u32 = 2;

/// Identifies which host-side handler processes a call.
///
/// Equality, ordering and hashing go through [`ServiceId::raw`], so
/// `ServiceId::Other(1)` and `ServiceId::FunctionCall` are the same service.
#[derive(Debug, Clone, Copy)]
pub enum ServiceId {
    /// Reserved, answered with an all-zero reply
    Default,
    /// Generic remote invocation through a host function table
    FunctionCall,
    /// Formatted output, possibly spread over several calls
    Printf,
    /// Any identifier outside the built-in set
    Other(u32),
}

impl ServiceId {
    /// The wire value of this identifier
    pub const fn raw(self) -> u32 {
        match self {
            ServiceId::Default => SERVICE_ID_DEFAULT,
            ServiceId::FunctionCall => SERVICE_ID_FUNCTION_CALL,
            ServiceId::Printf => SERVICE_ID_PRINTF,
            ServiceId::Other(id) => id,
        }
    }

    /// Decode a wire value
    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            SERVICE_ID_DEFAULT => ServiceId::Default,
            SERVICE_ID_FUNCTION_CALL => ServiceId::FunctionCall,
            SERVICE_ID_PRINTF => ServiceId::Printf,
            other => ServiceId::Other(other),
        }
    }

    /// Whether this identifier is one of the built-in services
    pub const fn is_builtin(self) -> bool {
        self.raw() <= SERVICE_ID_PRINTF
    }

    /// Human readable name used in logs and tooling
    pub const fn name(self) -> &'static str {
        match ServiceId::from_raw(self.raw()) {
            ServiceId::Default => "default",
            ServiceId::FunctionCall => "function-call",
            ServiceId::Printf => "printf",
            ServiceId::Other(_) => "unregistered",
        }
    }
}

impl From<u32> for ServiceId {
    fn from(raw: u32) -> Self {
        ServiceId::from_raw(raw)
    }
}

impl From<ServiceId> for u32 {
    fn from(id: ServiceId) -> Self {
        id.raw()
    }
}

impl PartialEq for ServiceId {
    fn eq(&self, other: &Self) -> bool {
        self.raw() == other.raw()
    }
}

impl Eq for ServiceId {}

impl PartialOrd for ServiceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ServiceId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw().cmp(&other.raw())
    }
}

impl Hash for ServiceId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw().hash(state);
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_builtin() {
            write!(f, "{}({})", self.name(), self.raw())
        } else {
            write!(f, "service({:#x})", self.raw())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_round_trip() {
        assert_eq!(ServiceId::from(0), ServiceId::Default);
        assert_eq!(ServiceId::from(1), ServiceId::FunctionCall);
        assert_eq!(ServiceId::from(2), ServiceId::Printf);
        assert_eq!(u32::from(ServiceId::Printf), 2);
    }

    #[test]
    fn test_unknown_ids_never_become_default() {
        for raw in [3u32, 17, 0xFFFF_FFFF] {
            let id = ServiceId::from(raw);
            assert!(matches!(id, ServiceId::Other(r) if r == raw));
            assert_ne!(id, ServiceId::Default);
            assert!(!id.is_builtin());
        }
    }

    #[test]
    fn test_other_with_builtin_value_is_the_builtin() {
        assert_eq!(ServiceId::Other(1), ServiceId::FunctionCall);
        assert_eq!(ServiceId::Other(2).name(), "printf");
        assert!(ServiceId::Other(0).is_builtin());
    }

    #[test]
    fn test_display() {
        assert_eq!(ServiceId::Printf.to_string(), "printf(2)");
        assert_eq!(ServiceId::Other(0x42).to_string(), "service(0x42)");
    }
}
