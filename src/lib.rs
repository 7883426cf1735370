//! Session engine for native TLS stacks in the Secure Transport mould.
//!
//! The native library owns the TLS protocol machinery behind an opaque
//! session handle and calls back out for transport I/O. This crate wraps
//! one such handle in a [`Session`]: it bridges the callbacks onto a
//! byte-stream [`IOCallbacks`] transport, drives the handshake as a
//! retryable state machine, and manages certificate and identity handles
//! over the session's lifetime.
//!
//! Nothing here blocks or spawns. Every operation that cannot complete
//! against the transport returns [`Poll::PendingRead`] or
//! [`Poll::PendingWrite`] and is retried by the caller once the transport
//! is ready again.

#![warn(missing_docs)]

mod callback;
mod cert;
mod context;
mod engine;
mod error;
mod ssl;
mod trust;

pub use callback::*;
pub use cert::*;
pub use context::*;
pub use engine::*;
pub use error::{AlertDescription, Error, ErrorKind, Poll, PollResult, Result};
pub use ssl::*;

/// Largest amount of plaintext one TLS record can carry.
///
/// A useful default read size: one decrypt call never produces more
/// than this many bytes.
pub const TLS_MAX_RECORD_SIZE: usize = 2usize.pow(14);

/// Which end of the connection a session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Initiates the handshake and authenticates the server.
    Client,
    /// Accepts the handshake and presents a certificate.
    Server,
}

/// A TLS protocol version as the native engine reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// TLS 1.0
    TlsV1_0,
    /// TLS 1.1
    TlsV1_1,
    /// TLS 1.2
    TlsV1_2,
    /// TLS 1.3
    TlsV1_3,
    /// The engine reported something this crate does not know about.
    Unknown,
}

/// Bit set of protocol versions a session is allowed to negotiate.
///
/// The empty set leaves the engine's own defaults in place.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnabledProtocols(u8);

impl EnabledProtocols {
    /// No version pinned; the engine's defaults apply.
    pub const SYSTEM_DEFAULT: Self = Self(0);
    /// TLS 1.0
    pub const TLS1_0: Self = Self(1 << 0);
    /// TLS 1.1
    pub const TLS1_1: Self = Self(1 << 1);
    /// TLS 1.2
    pub const TLS1_2: Self = Self(1 << 2);
    /// TLS 1.3
    pub const TLS1_3: Self = Self(1 << 3);

    /// Whether any version is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every version in `other` is also in `self`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Lowest and highest enabled versions, or `None` when nothing is
    /// pinned. Gaps in the set collapse because the engine only takes a
    /// contiguous min/max range.
    pub(crate) fn bounds(self) -> Option<(ProtocolVersion, ProtocolVersion)> {
        const ORDER: [(EnabledProtocols, ProtocolVersion); 4] = [
            (EnabledProtocols::TLS1_0, ProtocolVersion::TlsV1_0),
            (EnabledProtocols::TLS1_1, ProtocolVersion::TlsV1_1),
            (EnabledProtocols::TLS1_2, ProtocolVersion::TlsV1_2),
            (EnabledProtocols::TLS1_3, ProtocolVersion::TlsV1_3),
        ];

        let min = ORDER.iter().find(|(flag, _)| self.contains(*flag))?;
        let max = ORDER.iter().rev().find(|(flag, _)| self.contains(*flag))?;
        Some((min.1, max.1))
    }
}

impl std::ops::BitOr for EnabledProtocols {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for EnabledProtocols {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_case::test_case;

    #[test_case(EnabledProtocols::SYSTEM_DEFAULT => None; "empty set leaves engine defaults")]
    #[test_case(EnabledProtocols::TLS1_2 => Some((ProtocolVersion::TlsV1_2, ProtocolVersion::TlsV1_2)); "single version pins both ends")]
    #[test_case(EnabledProtocols::TLS1_0 | EnabledProtocols::TLS1_2 => Some((ProtocolVersion::TlsV1_0, ProtocolVersion::TlsV1_2)); "gap collapses into the range")]
    #[test_case(EnabledProtocols::TLS1_0 | EnabledProtocols::TLS1_1 | EnabledProtocols::TLS1_2 | EnabledProtocols::TLS1_3 => Some((ProtocolVersion::TlsV1_0, ProtocolVersion::TlsV1_3)); "full set spans all versions")]
    fn protocol_bounds(
        protocols: EnabledProtocols,
    ) -> Option<(ProtocolVersion, ProtocolVersion)> {
        protocols.bounds()
    }

    #[test]
    fn protocol_set_contains() {
        let set = EnabledProtocols::TLS1_2 | EnabledProtocols::TLS1_3;
        assert!(set.contains(EnabledProtocols::TLS1_2));
        assert!(set.contains(EnabledProtocols::TLS1_2 | EnabledProtocols::TLS1_3));
        assert!(!set.contains(EnabledProtocols::TLS1_0));
        assert!(!set.is_empty());
        assert!(EnabledProtocols::default().is_empty());
    }
}
