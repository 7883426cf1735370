//! Error and retry vocabulary for session operations.

use std::io;

use thiserror::Error;

use crate::engine::{self, OsStatus};

/// The `Result::Ok` of a non-blocking session operation.
///
/// Nothing in this crate blocks on the transport. When the engine cannot
/// make progress the operation returns one of the `Pending` variants and
/// the caller retries the same call once the transport is ready in the
/// indicated direction.
#[derive(Debug, PartialEq, Eq)]
pub enum Poll<T> {
    /// The transport could not take more bytes; retry once it is
    /// writable.
    PendingWrite,
    /// The transport had no bytes to give; retry once it is readable.
    PendingRead,
    /// The operation completed.
    Ready(T),
}

/// Failure of a session operation.
#[derive(Debug, Error)]
pub enum Error {
    /// The engine reported a fatal status. The session is unusable and
    /// should be dropped.
    #[error("fatal: {0}")]
    Fatal(ErrorKind),

    /// The transport failed inside an I/O callback. The failure is
    /// captured there and rethrown here once the native call returns.
    #[error("transport: {0}")]
    Io(#[from] io::Error),

    /// The session's state does not allow the call.
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),

    /// The platform or the session's role cannot do what was asked.
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// The local identity configuration is unusable.
    #[error("authentication: {0}")]
    Authentication(String),
}

impl Error {
    pub(crate) fn fatal(status: OsStatus) -> Self {
        Self::Fatal(ErrorKind::from(status))
    }

    /// The TLS alert this error maps to, when it is a fatal engine
    /// status.
    pub fn alert(&self) -> Option<AlertDescription> {
        match self {
            Self::Fatal(kind) => Some(kind.alert()),
            _ => None,
        }
    }
}

/// Classification of a fatal engine status.
///
/// Each variant keeps the raw status it was built from, so nothing is
/// lost when an unrecognized code falls through to [`Self::Internal`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ErrorKind {
    /// The peer's certificate is malformed, unsupported or failed
    /// signature checks.
    #[error("bad certificate (status {0})")]
    BadCertificate(OsStatus),

    /// The peer's certificate is outside its validity window.
    #[error("certificate expired or not yet valid (status {0})")]
    CertificateExpired(OsStatus),

    /// The peer's chain is anchored in an unknown or missing root.
    #[error("unknown certificate authority (status {0})")]
    UnknownCa(OsStatus),

    /// The certificate was rejected without a more specific reason.
    #[error("certificate unknown (status {0})")]
    CertificateUnknown(OsStatus),

    /// No protocol version acceptable to both peers.
    #[error("protocol version not acceptable (status {0})")]
    ProtocolVersion(OsStatus),

    /// A message arrived that the protocol state does not allow.
    #[error("unexpected message (status {0})")]
    UnexpectedMessage(OsStatus),

    /// The peer refused to renegotiate.
    #[error("renegotiation refused (status {0})")]
    NoRenegotiation(OsStatus),

    /// The connection was torn down.
    #[error("connection closed (status {0})")]
    ConnectionClosed(OsStatus),

    /// Any engine status without a more specific classification.
    #[error("internal error (status {0})")]
    Internal(OsStatus),
}

impl ErrorKind {
    /// The raw engine status this kind was built from.
    pub fn status(&self) -> OsStatus {
        match self {
            Self::BadCertificate(s)
            | Self::CertificateExpired(s)
            | Self::UnknownCa(s)
            | Self::CertificateUnknown(s)
            | Self::ProtocolVersion(s)
            | Self::UnexpectedMessage(s)
            | Self::NoRenegotiation(s)
            | Self::ConnectionClosed(s)
            | Self::Internal(s) => *s,
        }
    }

    /// The TLS alert description that corresponds to this failure.
    pub fn alert(&self) -> AlertDescription {
        match self {
            Self::BadCertificate(_) => AlertDescription::BadCertificate,
            Self::CertificateExpired(_) => AlertDescription::CertificateExpired,
            Self::UnknownCa(_) => AlertDescription::UnknownCa,
            Self::CertificateUnknown(_) => AlertDescription::CertificateUnknown,
            Self::ProtocolVersion(_) => AlertDescription::ProtocolVersion,
            Self::UnexpectedMessage(_) => AlertDescription::UnexpectedMessage,
            Self::NoRenegotiation(_) => AlertDescription::NoRenegotiation,
            Self::ConnectionClosed(_) => AlertDescription::CloseNotify,
            Self::Internal(_) => AlertDescription::InternalError,
        }
    }
}

impl From<OsStatus> for ErrorKind {
    fn from(status: OsStatus) -> Self {
        debug_assert!(
            !matches!(
                status,
                engine::ERR_SEC_SUCCESS
                    | engine::ERR_SSL_WOULD_BLOCK
                    | engine::ERR_SSL_PEER_AUTH_COMPLETED
                    | engine::ERR_SSL_CLIENT_CERT_REQUESTED
                    | engine::ERR_SSL_CLIENT_HELLO_RECEIVED
            ),
            "Attempting to build an ErrorKind from non-error status {status}"
        );

        match status {
            engine::ERR_SSL_BAD_CERT
            | engine::ERR_SSL_X_CERT_CHAIN_INVALID
            | engine::ERR_SSL_PEER_BAD_CERT => Self::BadCertificate(status),
            engine::ERR_SSL_CERT_EXPIRED | engine::ERR_SSL_CERT_NOT_YET_VALID => {
                Self::CertificateExpired(status)
            }
            engine::ERR_SSL_UNKNOWN_ROOT_CERT
            | engine::ERR_SSL_NO_ROOT_CERT
            | engine::ERR_SSL_PEER_UNKNOWN_CA => Self::UnknownCa(status),
            engine::ERR_SSL_PEER_CERT_UNKNOWN | engine::ERR_SSL_HOST_NAME_MISMATCH => {
                Self::CertificateUnknown(status)
            }
            engine::ERR_SSL_PROTOCOL
            | engine::ERR_SSL_NEGOTIATION
            | engine::ERR_SSL_PEER_PROTOCOL_VERSION => Self::ProtocolVersion(status),
            engine::ERR_SSL_PEER_UNEXPECTED_MSG | engine::ERR_SSL_UNEXPECTED_RECORD => {
                Self::UnexpectedMessage(status)
            }
            engine::ERR_SSL_PEER_NO_RENEGOTIATION => Self::NoRenegotiation(status),
            engine::ERR_SSL_CLOSED_GRACEFUL
            | engine::ERR_SSL_CLOSED_ABORT
            | engine::ERR_SSL_CLOSED_NO_NOTIFY => Self::ConnectionClosed(status),
            _ => Self::Internal(status),
        }
    }
}

/// TLS alert descriptions (RFC 5246 section 7.2) that classified errors
/// map onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AlertDescription {
    /// close_notify(0)
    CloseNotify = 0,
    /// unexpected_message(10)
    UnexpectedMessage = 10,
    /// handshake_failure(40)
    HandshakeFailure = 40,
    /// bad_certificate(42)
    BadCertificate = 42,
    /// certificate_expired(45)
    CertificateExpired = 45,
    /// certificate_unknown(46)
    CertificateUnknown = 46,
    /// unknown_ca(48)
    UnknownCa = 48,
    /// protocol_version(70)
    ProtocolVersion = 70,
    /// internal_error(80)
    InternalError = 80,
    /// no_renegotiation(100)
    NoRenegotiation = 100,
}

impl AlertDescription {
    /// Wire value of the alert.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Return of a session operation that may need a transport retry.
pub type PollResult<T> = std::result::Result<Poll<T>, Error>;

/// Return of a session operation that either works or fails.
pub type Result<T> = std::result::Result<T, Error>;
