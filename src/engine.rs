//! Abstraction over the native TLS engine.
//!
//! The engine owns the protocol state machine behind opaque handles and
//! reports every outcome as a flat `OSStatus`-style integer. [`Session`]
//! interprets those integers; implementations of the traits here only
//! ferry them out of the native library unchanged.
//!
//! [`Session`]: crate::Session

use std::sync::Arc;
use std::time::SystemTime;

use crate::callback::SessionIo;
use crate::error::Result;
use crate::{ProtocolVersion, Side};

/// Flat status code as the native engine reports it.
pub type OsStatus = i32;

/// The operation completed.
pub const ERR_SEC_SUCCESS: OsStatus = 0;
/// Transport I/O failed underneath the engine.
pub const ERR_SEC_IO: OsStatus = -36;
/// A parameter passed to the engine was unusable.
pub const ERR_SEC_PARAM: OsStatus = -50;
/// Generic TLS protocol failure.
pub const ERR_SSL_PROTOCOL: OsStatus = -9800;
/// The peers could not agree on protocol parameters.
pub const ERR_SSL_NEGOTIATION: OsStatus = -9801;
/// The peer sent a fatal alert.
pub const ERR_SSL_FATAL_ALERT: OsStatus = -9802;
/// The operation needs transport I/O that is not ready yet; retry.
pub const ERR_SSL_WOULD_BLOCK: OsStatus = -9803;
/// The connection closed with a proper close-notify exchange.
pub const ERR_SSL_CLOSED_GRACEFUL: OsStatus = -9805;
/// The connection was torn down without a close-notify.
pub const ERR_SSL_CLOSED_ABORT: OsStatus = -9806;
/// The peer's certificate chain does not verify.
pub const ERR_SSL_X_CERT_CHAIN_INVALID: OsStatus = -9807;
/// The peer's certificate is malformed or unusable.
pub const ERR_SSL_BAD_CERT: OsStatus = -9808;
/// The engine hit an internal failure.
pub const ERR_SSL_INTERNAL: OsStatus = -9810;
/// The peer's chain is anchored in a root the engine does not trust.
pub const ERR_SSL_UNKNOWN_ROOT_CERT: OsStatus = -9812;
/// The peer's chain carries no root at all.
pub const ERR_SSL_NO_ROOT_CERT: OsStatus = -9813;
/// The peer's certificate has expired.
pub const ERR_SSL_CERT_EXPIRED: OsStatus = -9814;
/// The peer's certificate is not valid yet.
pub const ERR_SSL_CERT_NOT_YET_VALID: OsStatus = -9815;
/// The transport closed mid-record without a close-notify.
pub const ERR_SSL_CLOSED_NO_NOTIFY: OsStatus = -9816;
/// The peer sent a message the protocol state does not allow.
pub const ERR_SSL_PEER_UNEXPECTED_MSG: OsStatus = -9819;
/// The peer alerted that our certificate is bad.
pub const ERR_SSL_PEER_BAD_CERT: OsStatus = -9825;
/// The peer alerted certificate-unknown.
pub const ERR_SSL_PEER_CERT_UNKNOWN: OsStatus = -9829;
/// The peer alerted unknown certificate authority.
pub const ERR_SSL_PEER_UNKNOWN_CA: OsStatus = -9831;
/// The peer alerted an unacceptable protocol version.
pub const ERR_SSL_PEER_PROTOCOL_VERSION: OsStatus = -9836;
/// The peer alerted an internal error on its side.
pub const ERR_SSL_PEER_INTERNAL_ERROR: OsStatus = -9838;
/// The peer refused to renegotiate.
pub const ERR_SSL_PEER_NO_RENEGOTIATION: OsStatus = -9840;
/// Handshake pause: the peer's certificate chain is ready for trust
/// evaluation.
pub const ERR_SSL_PEER_AUTH_COMPLETED: OsStatus = -9841;
/// Handshake pause: the server asked this client for a certificate.
pub const ERR_SSL_CLIENT_CERT_REQUESTED: OsStatus = -9842;
/// The presented certificate does not match the expected host name.
pub const ERR_SSL_HOST_NAME_MISMATCH: OsStatus = -9843;
/// A record arrived that does not fit the connection state.
pub const ERR_SSL_UNEXPECTED_RECORD: OsStatus = -9849;
/// Handshake pause: a client hello arrived and a server certificate can
/// now be chosen.
pub const ERR_SSL_CLIENT_HELLO_RECEIVED: OsStatus = -9851;

/// An IANA cipher suite identifier, as negotiated on the wire.
pub type CipherSuite = u16;

/// Session-wide toggles applied before the first handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOption {
    /// Pause the handshake once the peer's certificate chain has arrived,
    /// instead of letting the engine evaluate trust on its own.
    BreakOnServerAuth,
    /// Pause a client handshake when the server requests a certificate.
    BreakOnCertRequested,
    /// Pause a server handshake once the client's certificate chain has
    /// arrived.
    BreakOnClientAuth,
    /// Pause a server handshake as soon as the client hello is in, so a
    /// certificate can be chosen for the requested name.
    BreakOnClientHello,
    /// Permit renegotiation of an established session.
    AllowRenegotiation,
}

/// Factory for native TLS sessions.
///
/// One engine handle is shared by every [`Context`] built on it; sessions
/// it produces are independent of each other.
///
/// [`Context`]: crate::Context
pub trait TlsEngine: Send + Sync {
    /// Allocates a fresh native session playing `side`.
    fn new_session(&self, side: Side) -> Result<Box<dyn EngineSession>>;

    /// Whether the platform can renegotiate an established session.
    fn supports_renegotiation(&self) -> bool;
}

/// One opaque native session handle.
///
/// All methods returning [`OsStatus`] hand back the engine's code
/// verbatim; callers match on the constants in this module. The engine
/// calls the registered [`SessionIo`] from inside [`handshake`],
/// [`read`] and [`write`], on the thread that made the call.
///
/// Dropping the boxed session releases the native handle.
///
/// [`handshake`]: Self::handshake
/// [`read`]: Self::read
/// [`write`]: Self::write
pub trait EngineSession: Send {
    /// Registers the transport callbacks the engine moves ciphertext
    /// through.
    fn set_io(&mut self, io: Arc<dyn SessionIo>) -> OsStatus;

    /// Lowest protocol version the session may negotiate.
    fn set_protocol_version_min(&mut self, version: ProtocolVersion) -> OsStatus;

    /// Highest protocol version the session may negotiate.
    fn set_protocol_version_max(&mut self, version: ProtocolVersion) -> OsStatus;

    /// Turns a [`SessionOption`] on or off.
    fn set_session_option(&mut self, option: SessionOption, on: bool) -> OsStatus;

    /// Restricts negotiation to exactly these cipher suites.
    fn set_enabled_ciphers(&mut self, suites: &[CipherSuite]) -> OsStatus;

    /// Host name the peer's certificate must match; also sent as SNI.
    fn set_peer_domain_name(&mut self, name: &str) -> OsStatus;

    /// Distinguished names sent to clients when requesting a certificate.
    fn set_certificate_authorities(&mut self, names: &[String]) -> OsStatus;

    /// Installs the local identity and the intermediates sent with it.
    /// The engine retains its own references to the handles.
    fn set_certificate(
        &mut self,
        identity: &dyn NativeIdentity,
        chain: &[CertificateRef],
    ) -> OsStatus;

    /// Advances the handshake by one native step.
    fn handshake(&mut self) -> OsStatus;

    /// Schedules a renegotiation of an established session.
    fn rehandshake(&mut self) -> OsStatus;

    /// Decrypts up to `buf.len()` application bytes, returning how many
    /// landed in `buf` alongside the step's status.
    fn read(&mut self, buf: &mut [u8]) -> (usize, OsStatus);

    /// Encrypts bytes from `buf`, returning how many were consumed
    /// alongside the step's status.
    fn write(&mut self, buf: &[u8]) -> (usize, OsStatus);

    /// Cipher suite negotiated by the most recent handshake.
    fn negotiated_cipher(&mut self) -> CipherSuite;

    /// Protocol version negotiated by the most recent handshake.
    fn negotiated_protocol_version(&mut self) -> ProtocolVersion;

    /// Copies the peer's trust object out of the session, if the peer
    /// presented a certificate.
    fn copy_peer_trust(&mut self) -> Option<TrustRef>;

    /// Distinguished names the peer will accept a client certificate
    /// from. Empty when the peer sent no hints.
    fn copy_distinguished_names(&mut self) -> Vec<String>;

    /// Host name the client asked for in its hello, if any.
    fn copy_requested_peer_name(&mut self) -> Option<String>;
}

/// Owned reference to a native certificate handle.
///
/// Dropping the box releases the native reference.
pub trait NativeCertificate: Send {
    /// DER encoding of the certificate.
    fn der(&self) -> &[u8];
}

/// Owned reference to a native identity, a certificate paired with its
/// private key.
///
/// Dropping the box releases the native reference.
pub trait NativeIdentity: Send {
    /// Copies the identity's leaf certificate out as a fresh handle.
    fn certificate(&self) -> CertificateRef;
}

/// Owned reference to a native trust object holding the peer's chain.
///
/// Dropping the box releases the native reference.
pub trait PeerTrust: Send {
    /// Overrides the anchors the chain is evaluated against.
    fn set_anchor_certificates(&mut self, anchors: &[CertificateRef]) -> OsStatus;

    /// Evaluates validity as of `date` instead of the current time.
    fn set_verify_date(&mut self, date: SystemTime) -> OsStatus;

    /// Number of certificates in the chain.
    fn certificate_count(&self) -> usize;

    /// Copies the certificate at `index` out as a fresh handle. Index 0
    /// is the end-entity certificate.
    fn certificate_at(&self, index: usize) -> Option<CertificateRef>;
}

/// Boxed native certificate handle.
pub type CertificateRef = Box<dyn NativeCertificate>;

/// Boxed native identity handle.
pub type IdentityRef = Box<dyn NativeIdentity>;

/// Boxed native trust handle.
pub type TrustRef = Box<dyn PeerTrust>;
