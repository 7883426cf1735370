//! Callback seams between the native engine and the embedding
//! application.
//!
//! The engine pulls and pushes ciphertext through two registered
//! functions while a handshake, read or write call is on the stack.
//! [`IoBridge`] sits behind those functions: it adapts an
//! [`IOCallbacks`] transport to the status codes the engine understands
//! and guarantees that nothing unwinds across the native boundary. A
//! transport failure is parked in a mailbox and rethrown by the session
//! once the native call returns.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::cert::Certificate;
use crate::engine::{self, OsStatus};
use crate::Side;

/// Return of an [`IOCallbacks`] operation.
#[derive(Debug)]
pub enum IOCallbackResult<T> {
    /// Success
    Ok(T),
    /// The transport cannot make progress right now; retry once it is
    /// ready again.
    WouldBlock,
    /// Unrecoverable transport failure.
    Err(io::Error),
}

/// The byte-stream transport a session moves ciphertext over.
///
/// Both directions are non-blocking: report [`IOCallbackResult::WouldBlock`]
/// instead of waiting. `recv` returning `Ok(0)` means the peer closed the
/// stream cleanly.
pub trait IOCallbacks: Send + 'static {
    /// Reads up to `buf.len()` ciphertext bytes into `buf`, returning how
    /// many arrived.
    fn recv(&mut self, buf: &mut [u8]) -> IOCallbackResult<usize>;

    /// Writes ciphertext bytes from `buf`, returning how many were
    /// accepted.
    fn send(&mut self, buf: &[u8]) -> IOCallbackResult<usize>;
}

/// The two entry points a session registers into the engine.
///
/// The engine invokes these re-entrantly from inside its own calls, on
/// the same thread that drove the session. Implementations must never
/// panic across this boundary and must answer with the engine's own
/// status vocabulary.
pub trait SessionIo: Send + Sync {
    /// Moves up to `buf.len()` ciphertext bytes from the transport into
    /// `buf`.
    fn read(&self, buf: &mut [u8]) -> (usize, OsStatus);

    /// Moves ciphertext bytes from `buf` into the transport.
    fn write(&self, buf: &[u8]) -> (usize, OsStatus);
}

/// Which transport direction last reported "would block".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Blocked {
    Recv,
    Send,
}

const BLOCKED_NONE: u8 = 0;
const BLOCKED_RECV: u8 = 1;
const BLOCKED_SEND: u8 = 2;

/// Adapter between an [`IOCallbacks`] transport and the engine's
/// callback contract.
///
/// Shared between the session (which owns it) and the engine session
/// (which holds it as its registered [`SessionIo`]).
pub(crate) struct IoBridge<IOCB: IOCallbacks> {
    io: Mutex<IOCB>,
    /// Single-slot mailbox for a transport failure raised inside a
    /// native call.
    last_error: Mutex<Option<io::Error>>,
    saw_clean_eof: AtomicBool,
    closed: AtomicBool,
    blocked: AtomicU8,
}

// A panicking transport must not poison the callback path.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<IOCB: IOCallbacks> IoBridge<IOCB> {
    pub(crate) fn new(io: IOCB) -> Self {
        Self {
            io: Mutex::new(io),
            last_error: Mutex::new(None),
            saw_clean_eof: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            blocked: AtomicU8::new(BLOCKED_NONE),
        }
    }

    /// Takes the captured transport failure, leaving the mailbox empty.
    pub(crate) fn take_error(&self) -> Option<io::Error> {
        lock(&self.last_error).take()
    }

    /// Whether the transport has reported a clean end-of-stream.
    pub(crate) fn saw_clean_eof(&self) -> bool {
        self.saw_clean_eof.load(Ordering::Acquire)
    }

    /// Direction of the most recent "would block" answer, if any
    /// transport call has blocked since the last one that made progress.
    pub(crate) fn blocked(&self) -> Option<Blocked> {
        match self.blocked.load(Ordering::Acquire) {
            BLOCKED_RECV => Some(Blocked::Recv),
            BLOCKED_SEND => Some(Blocked::Send),
            _ => None,
        }
    }

    /// After this, every callback answers closed-abort without touching
    /// the transport.
    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

impl<IOCB: IOCallbacks> SessionIo for IoBridge<IOCB> {
    fn read(&self, buf: &mut [u8]) -> (usize, OsStatus) {
        if self.closed.load(Ordering::Acquire) {
            return (0, engine::ERR_SSL_CLOSED_ABORT);
        }

        match lock(&self.io).recv(buf) {
            IOCallbackResult::Ok(0) => {
                self.saw_clean_eof.store(true, Ordering::Release);
                (0, engine::ERR_SSL_CLOSED_GRACEFUL)
            }
            IOCallbackResult::Ok(n) => {
                self.blocked.store(BLOCKED_NONE, Ordering::Release);
                (n, engine::ERR_SEC_SUCCESS)
            }
            IOCallbackResult::WouldBlock => {
                self.blocked.store(BLOCKED_RECV, Ordering::Release);
                (0, engine::ERR_SSL_WOULD_BLOCK)
            }
            IOCallbackResult::Err(err) => {
                *lock(&self.last_error) = Some(err);
                (0, engine::ERR_SEC_IO)
            }
        }
    }

    fn write(&self, buf: &[u8]) -> (usize, OsStatus) {
        if self.closed.load(Ordering::Acquire) {
            return (0, engine::ERR_SSL_CLOSED_ABORT);
        }

        match lock(&self.io).send(buf) {
            IOCallbackResult::Ok(n) if n == buf.len() => {
                self.blocked.store(BLOCKED_NONE, Ordering::Release);
                (n, engine::ERR_SEC_SUCCESS)
            }
            // Short write. The engine treats it like a block and retries
            // the remainder.
            IOCallbackResult::Ok(n) => {
                self.blocked.store(BLOCKED_SEND, Ordering::Release);
                (n, engine::ERR_SSL_WOULD_BLOCK)
            }
            IOCallbackResult::WouldBlock => {
                self.blocked.store(BLOCKED_SEND, Ordering::Release);
                (0, engine::ERR_SSL_WOULD_BLOCK)
            }
            IOCallbackResult::Err(err) => {
                *lock(&self.last_error) = Some(err);
                (0, engine::ERR_SEC_IO)
            }
        }
    }
}

/// Application authority over peer certificate chains.
///
/// Whatever the native evaluation concluded, this decision alone accepts
/// or rejects the peer.
pub trait CertValidator: Send + Sync {
    /// `chain[0]` is the peer's end-entity certificate. Return `true` to
    /// accept the peer.
    fn validate(&self, chain: &[Certificate], side: Side, target_host: Option<&str>) -> bool;
}

/// Shared reference to a [`CertValidator`].
pub type CertValidatorArg = Arc<dyn CertValidator>;

/// Picks the certificate a client offers when the server requests one.
pub trait ClientCertSelector: Send + Sync {
    /// `issuers` holds the distinguished names the server will accept,
    /// possibly empty. `None` offers no certificate.
    fn select(&self, issuers: &[String]) -> Option<Certificate>;
}

/// Shared reference to a [`ClientCertSelector`].
pub type ClientCertSelectorArg = Arc<dyn ClientCertSelector>;

/// Picks the certificate a server presents for a requested host name.
pub trait ServerCertSelector: Send + Sync {
    /// `server_name` is the SNI host name from the client hello, when it
    /// sent one. `None` from the selector aborts the handshake.
    fn select(&self, server_name: Option<&str>) -> Option<Certificate>;
}

/// Shared reference to a [`ServerCertSelector`].
pub type ServerCertSelectorArg = Arc<dyn ServerCertSelector>;
