//! Call and reply packets
//!
//! # Wire layout
//! A call packet occupies [`PACKET_WORDS`] 64-bit words in its slot:
//!
//! ```text
//! word 0      service id, zero-extended to 64 bits
//! word 1..=8  args[0..8], meaning defined per service
//! ```
//!
//! A reply is always [`REPLY_WORDS`] words. How the dispatcher produced it
//! travels separately as a [`ReplyStatus`] in the slot's state word, so a
//! handler may return any two words. The sentinel patterns (see
//! [`Sentinel`]) only matter on the fixed-width ABI, where the status is not
//! visible.

use crate::error::{HostcallError, Result};
use crate::service::ServiceId;

/// Number of argument words carried by every call
pub const ARG_WORDS: usize = 8;
/// Number of words a call packet occupies in a slot
pub const PACKET_WORDS: usize = ARG_WORDS + 1;
/// Number of words in every reply
pub const REPLY_WORDS: usize = 2;

/// First word of every protocol-level error reply
pub const REPLY_SENTINEL: u64 = u64::MAX;
/// Second word of the unknown-service reply
pub const UNKNOWN_SERVICE_WORD: u64 = u64::MAX;
/// Second word of the table-exhausted reply
pub const TABLE_EXHAUSTED_WORD: u64 = u64::MAX - 1;
/// Fill pattern of a reply region the dispatcher has not written yet
pub const UNINITIALIZED_WORD: u64 = 0xBAAD_F00D_BAAD_F00D;

/// A request for a host-side service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPacket {
    service_id: ServiceId,
    args: [u64; ARG_WORDS],
}

impl CallPacket {
    /// Create a packet. Unused argument words are left as given.
    pub const fn new(service_id: ServiceId, args: [u64; ARG_WORDS]) -> Self {
        Self { service_id, args }
    }

    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    pub fn args(&self) -> &[u64; ARG_WORDS] {
        &self.args
    }

    /// Argument word `index`, panics if `index >= ARG_WORDS`
    pub fn arg(&self, index: usize) -> u64 {
        self.args[index]
    }

    /// Encode into the slot word layout
    pub fn encode(&self) -> [u64; PACKET_WORDS] {
        let mut words = [0u64; PACKET_WORDS];
        words[0] = u64::from(self.service_id.raw());
        words[1..].copy_from_slice(&self.args);
        words
    }

    /// Decode from the slot word layout
    ///
    /// # Errors
    /// Returns `HostcallError::MalformedPacket` if the service word does not
    /// fit in 32 bits.
    pub fn decode(words: &[u64; PACKET_WORDS]) -> Result<Self> {
        let raw = u32::try_from(words[0])
            .map_err(|_| HostcallError::MalformedPacket { word: words[0] })?;
        let mut args = [0u64; ARG_WORDS];
        args.copy_from_slice(&words[1..]);
        Ok(Self::new(ServiceId::from_raw(raw), args))
    }
}

/// Reserved reply patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    /// The dispatcher has no handler for the requested service
    UnknownService,
    /// No slot could be acquired (only produced by the ABI surface)
    TableExhausted,
    /// The handler reported a service-defined error code
    HandlerFailure(u32),
    /// The reply region still holds the submission fill pattern
    Uninitialized,
}

/// How the dispatcher produced a reply, published with the `Completed` flip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplyStatus {
    /// The handler's own reply, whatever its words
    Ok = 0,
    /// No handler was registered, the reply is the unknown-service sentinel
    UnknownService = 1,
    /// The handler failed, the reply carries its code in the second word
    HandlerFailure = 2,
}

impl ReplyStatus {
    pub const fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            0 => Some(ReplyStatus::Ok),
            1 => Some(ReplyStatus::UnknownService),
            2 => Some(ReplyStatus::HandlerFailure),
            _ => None,
        }
    }
}

/// The two-word result of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyPacket(pub [u64; REPLY_WORDS]);

impl ReplyPacket {
    pub const UNKNOWN_SERVICE: Self = Self([REPLY_SENTINEL, UNKNOWN_SERVICE_WORD]);
    pub const TABLE_EXHAUSTED: Self = Self([REPLY_SENTINEL, TABLE_EXHAUSTED_WORD]);
    pub const UNINITIALIZED: Self = Self([UNINITIALIZED_WORD, UNINITIALIZED_WORD]);
    pub const ZERO: Self = Self([0, 0]);

    pub const fn new(first: u64, second: u64) -> Self {
        Self([first, second])
    }

    /// Reply reporting a service-defined failure.
    ///
    /// The code is 32 bits wide so it can never collide with the other
    /// sentinel words.
    pub const fn handler_failure(code: u32) -> Self {
        Self([REPLY_SENTINEL, code as u64])
    }

    pub const fn words(&self) -> [u64; REPLY_WORDS] {
        self.0
    }

    /// Classify reserved reply patterns, `None` for an ordinary reply
    pub fn sentinel(&self) -> Option<Sentinel> {
        match self.0 {
            [REPLY_SENTINEL, UNKNOWN_SERVICE_WORD] => Some(Sentinel::UnknownService),
            [REPLY_SENTINEL, TABLE_EXHAUSTED_WORD] => Some(Sentinel::TableExhausted),
            [REPLY_SENTINEL, code] => u32::try_from(code).ok().map(Sentinel::HandlerFailure),
            [UNINITIALIZED_WORD, UNINITIALIZED_WORD] => Some(Sentinel::Uninitialized),
            _ => None,
        }
    }

    /// The reply words, or the sentinel they encode
    pub fn check(self) -> core::result::Result<[u64; REPLY_WORDS], Sentinel> {
        match self.sentinel() {
            Some(sentinel) => Err(sentinel),
            None => Ok(self.0),
        }
    }
}

impl From<[u64; REPLY_WORDS]> for ReplyPacket {
    fn from(words: [u64; REPLY_WORDS]) -> Self {
        Self(words)
    }
}

impl From<ReplyPacket> for (u64, u64) {
    fn from(reply: ReplyPacket) -> Self {
        (reply.0[0], reply.0[1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let packet = CallPacket::new(ServiceId::Printf, [10, 11, 12, 13, 14, 15, 16, 17]);
        let words = packet.encode();
        assert_eq!(words[0], 2);
        assert_eq!(&words[1..], &[10, 11, 12, 13, 14, 15, 16, 17]);
        assert_eq!(CallPacket::decode(&words).unwrap(), packet);
    }

    #[test]
    fn test_decode_rejects_wide_service_word() {
        let mut words = [0u64; PACKET_WORDS];
        words[0] = 1 << 32;
        assert_eq!(
            CallPacket::decode(&words),
            Err(HostcallError::MalformedPacket { word: 1 << 32 })
        );
    }

    #[test]
    fn test_decode_keeps_unknown_service() {
        let mut words = [0u64; PACKET_WORDS];
        words[0] = 0xFFFF_FFFF;
        let packet = CallPacket::decode(&words).unwrap();
        assert_eq!(packet.service_id(), ServiceId::Other(0xFFFF_FFFF));
    }

    #[test]
    fn test_sentinel_classification() {
        assert_eq!(ReplyPacket::UNKNOWN_SERVICE.sentinel(), Some(Sentinel::UnknownService));
        assert_eq!(ReplyPacket::TABLE_EXHAUSTED.sentinel(), Some(Sentinel::TableExhausted));
        assert_eq!(ReplyPacket::UNINITIALIZED.sentinel(), Some(Sentinel::Uninitialized));
        assert_eq!(
            ReplyPacket::handler_failure(7).sentinel(),
            Some(Sentinel::HandlerFailure(7))
        );
        assert_eq!(
            ReplyPacket::handler_failure(u32::MAX).sentinel(),
            Some(Sentinel::HandlerFailure(u32::MAX))
        );
        assert_eq!(ReplyPacket::new(42, 0).sentinel(), None);
        assert_eq!(ReplyPacket::new(u64::MAX, 1 << 40).sentinel(), None);
        assert_eq!(ReplyPacket::new(UNINITIALIZED_WORD, 0).sentinel(), None);
    }

    #[test]
    fn test_reply_status_bits() {
        for status in [ReplyStatus::Ok, ReplyStatus::UnknownService, ReplyStatus::HandlerFailure] {
            assert_eq!(ReplyStatus::from_bits(status as u64), Some(status));
        }
        assert_eq!(ReplyStatus::from_bits(3), None);
    }

    #[test]
    fn test_check() {
        assert_eq!(ReplyPacket::new(3, 4).check(), Ok([3, 4]));
        assert_eq!(
            ReplyPacket::handler_failure(2).check(),
            Err(Sentinel::HandlerFailure(2))
        );
    }
}
