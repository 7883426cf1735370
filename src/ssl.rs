//! TLS session state machine over a native engine handle.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Buf, BytesMut};

use crate::callback::{Blocked, IOCallbacks, IoBridge, SessionIo};
use crate::cert::{self, Certificate};
use crate::context::Policy;
use crate::engine::{self, CipherSuite, EngineSession, OsStatus, SessionOption, TlsEngine};
use crate::error::{Error, Poll, PollResult, Result};
use crate::trust::{self, TrustPolicy};
use crate::{ProtocolVersion, Side, TLS_MAX_RECORD_SIZE};

/// Stores configurations we want to initialize a [`Session`] with.
pub struct SessionConfig<IOCB: IOCallbacks> {
    /// I/O callback handlers
    pub io: IOCB,
    /// Host name the peer is expected to present, for client sessions.
    /// Also sent as SNI, except when it is a literal IP address.
    pub target_host: Option<String>,
}

impl<IOCB: IOCallbacks> SessionConfig<IOCB> {
    /// Creates a default `Self` around a transport.
    pub fn new(io: IOCB) -> Self {
        Self {
            io,
            target_host: None,
        }
    }

    /// When `cond` is True call `func` on `Self`
    pub fn when<F>(self, cond: bool, func: F) -> Self
    where
        F: FnOnce(Self) -> Self,
    {
        if cond {
            func(self)
        } else {
            self
        }
    }

    /// When `maybe` is `Some(_)` call `func` on `Self` and the contained
    /// value
    pub fn when_some<F, T>(self, maybe: Option<T>, func: F) -> Self
    where
        F: FnOnce(Self, T) -> Self,
    {
        if let Some(value) = maybe {
            func(self, value)
        } else {
            self
        }
    }

    /// Sets [`Self::target_host`]
    pub fn with_target_host(mut self, host: &str) -> Self {
        self.target_host = Some(host.to_string());
        self
    }
}

/// Negotiated parameters of an established connection, computed once
/// when the handshake first completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    cipher_suite: CipherSuite,
    protocol_version: ProtocolVersion,
    peer_name: Option<String>,
}

impl ConnectionInfo {
    /// Cipher suite negotiated for the connection.
    pub fn cipher_suite(&self) -> CipherSuite {
        self.cipher_suite
    }

    /// Protocol version negotiated for the connection.
    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    /// Host name associated with the connection: the configured target
    /// for clients, the requested (SNI) name for servers.
    pub fn peer_name(&self) -> Option<&str> {
        self.peer_name.as_deref()
    }
}

/// One TLS connection endpoint, wrapping a native engine session around
/// a byte-stream transport.
///
/// [`start_handshake`] allocates and configures the native session, then
/// [`try_handshake`] is repeated until it returns [`Poll::Ready`]; trust
/// evaluation and certificate selection run at the engine's pause points
/// along the way. [`finish_handshake`] seals the result, after which
/// [`try_read`] and [`try_write`] move application data. A server may
/// later call [`renegotiate`] and keep reading; the renegotiation rides
/// along inside the record calls.
///
/// Sessions have no threads of their own. Every operation runs on the
/// caller and either completes, fails, or asks to be retried once the
/// transport is ready.
///
/// [`start_handshake`]: Self::start_handshake
/// [`try_handshake`]: Self::try_handshake
/// [`finish_handshake`]: Self::finish_handshake
/// [`try_read`]: Self::try_read
/// [`try_write`]: Self::try_write
/// [`renegotiate`]: Self::renegotiate
pub struct Session<IOCB: IOCallbacks> {
    engine: Arc<dyn TlsEngine>,
    side: Side,
    policy: Policy,
    target_host: Option<String>,

    /// `None` until [`Self::start_handshake`] allocates the native
    /// session.
    ssl: Option<Box<dyn EngineSession>>,
    io: Arc<IoBridge<IOCB>>,

    handshake_started: AtomicBool,
    /// Excludes overlapping record calls on the native handle. Shared
    /// with the [`IoGuard`] that clears it.
    pending_io: Arc<AtomicBool>,
    handshake_finished: bool,
    renegotiating: bool,
    authenticated: bool,
    closed: bool,

    local_certificate: Option<Certificate>,
    remote_certificate: Option<Certificate>,
    connection_info: Option<ConnectionInfo>,
    requested_peer_name: Option<String>,
}

/// Holds the single-flight record slot. Dropping it clears the flag on
/// every exit path, unwinding included.
struct IoGuard {
    flag: Arc<AtomicBool>,
}

impl Drop for IoGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

fn ensure_success(status: OsStatus) -> Result<()> {
    match status {
        engine::ERR_SEC_SUCCESS => Ok(()),
        e => Err(Error::fatal(e)),
    }
}

impl<IOCB: IOCallbacks> Session<IOCB> {
    pub(crate) fn new(
        engine: Arc<dyn TlsEngine>,
        side: Side,
        policy: Policy,
        config: SessionConfig<IOCB>,
    ) -> Self {
        Self {
            engine,
            side,
            policy,
            target_host: config.target_host,
            ssl: None,
            io: Arc::new(IoBridge::new(config.io)),
            handshake_started: AtomicBool::new(false),
            pending_io: Arc::new(AtomicBool::new(false)),
            handshake_finished: false,
            renegotiating: false,
            authenticated: false,
            closed: false,
            local_certificate: None,
            remote_certificate: None,
            connection_info: None,
            requested_peer_name: None,
        }
    }

    /// Allocates the native session and configures it for the first
    /// handshake step.
    ///
    /// One-shot: a second call fails with an invalid-operation error no
    /// matter how the first one went. A server session with neither a
    /// certificate nor a certificate selector fails here, before any
    /// bytes move.
    pub fn start_handshake(&mut self) -> Result<()> {
        if self
            .handshake_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::InvalidOperation("the handshake was already started"));
        }

        if self.side == Side::Server
            && self.policy.server_cert_selector.is_none()
            && self.policy.certificate.is_none()
        {
            return Err(Error::Authentication(
                "server session has no certificate and no selector to provide one".to_string(),
            ));
        }

        log::debug!("starting handshake as {:?}", self.side);

        let mut ssl = self.engine.new_session(self.side)?;
        ensure_success(ssl.set_io(Arc::clone(&self.io) as Arc<dyn SessionIo>))?;

        if let Some((min, max)) = self.policy.protocols.bounds() {
            ensure_success(ssl.set_protocol_version_min(min))?;
            ensure_success(ssl.set_protocol_version_max(max))?;
        }

        // Trust decisions and certificate selection happen in this
        // crate, not inside the engine.
        for option in [
            SessionOption::BreakOnCertRequested,
            SessionOption::BreakOnClientAuth,
            SessionOption::BreakOnServerAuth,
        ] {
            ensure_success(ssl.set_session_option(option, true))?;
        }

        if let Some(suites) = self.policy.ciphers.as_deref() {
            ensure_success(ssl.set_enabled_ciphers(suites))?;
        }

        match self.side {
            Side::Server => {
                if let Some(issuers) = self.policy.client_cert_issuers.as_deref() {
                    ensure_success(ssl.set_certificate_authorities(issuers))?;
                }
            }
            Side::Client => {
                if let Some(host) = self.target_host.as_deref() {
                    // Literal addresses never go out as SNI.
                    if host.parse::<IpAddr>().is_err() {
                        ensure_success(ssl.set_peer_domain_name(host))?;
                    }
                }
            }
        }

        if self.policy.allow_renegotiation && self.engine.supports_renegotiation() {
            ensure_success(ssl.set_session_option(SessionOption::AllowRenegotiation, true))?;
        }

        self.ssl = Some(ssl);

        // Server certificate strategy: a selector defers the choice to
        // the client-hello pause; a lone pre-selected certificate goes
        // in right away.
        if self.side == Side::Server {
            if self.policy.server_cert_selector.is_some() {
                let status = self
                    .ssl_mut()?
                    .set_session_option(SessionOption::BreakOnClientHello, true);
                ensure_success(status)?;
            } else if let Some(certificate) = self.policy.certificate.clone() {
                self.set_local_certificate(&certificate)?;
            }
        }

        Ok(())
    }

    /// Advances the handshake.
    ///
    /// Runs native steps until the handshake completes, needs the
    /// transport, or fails. The engine's pause points are serviced
    /// in-line: peer-auth-completed runs trust evaluation,
    /// client-cert-requested consults the client certificate selector,
    /// client-hello-received picks the server certificate for the
    /// requested name.
    ///
    /// Fails with a not-supported error once the handshake has finished,
    /// unless a renegotiation is in progress.
    pub fn try_handshake(&mut self) -> PollResult<()> {
        if self.handshake_finished && !self.renegotiating {
            return Err(Error::NotSupported("the handshake has already completed"));
        }

        loop {
            // Stale transport failures must not masquerade as this
            // step's outcome.
            let _ = self.io.take_error();

            let status = self.ssl_mut()?.handshake();

            if let Some(err) = self.io.take_error() {
                return Err(err.into());
            }

            match status {
                engine::ERR_SEC_SUCCESS => {
                    self.cache_connection_info()?;
                    self.handshake_finished = true;
                    self.renegotiating = false;
                    log::debug!("handshake complete");
                    return Ok(Poll::Ready(()));
                }
                engine::ERR_SSL_WOULD_BLOCK => return Ok(self.pending()),
                engine::ERR_SSL_PEER_AUTH_COMPLETED => self.peer_auth_completed()?,
                engine::ERR_SSL_CLIENT_CERT_REQUESTED => self.client_cert_requested()?,
                engine::ERR_SSL_CLIENT_HELLO_RECEIVED => self.client_hello_received()?,
                e => return Err(Error::fatal(e)),
            }
        }
    }

    /// Seals a completed handshake and marks the session authenticated.
    pub fn finish_handshake(&mut self) -> Result<()> {
        if !self.handshake_finished {
            return Err(Error::InvalidOperation("the handshake has not completed"));
        }
        self.cache_connection_info()?;
        self.authenticated = true;
        Ok(())
    }

    /// Starts a server-initiated renegotiation.
    ///
    /// The renegotiation itself is driven by subsequent [`Self::try_read`]
    /// and [`Self::try_write`] calls, which service its pause points the
    /// same way the initial handshake did.
    pub fn renegotiate(&mut self) -> Result<()> {
        if self.side != Side::Server || !self.engine.supports_renegotiation() {
            return Err(Error::NotSupported(
                "renegotiation needs a server session on an engine that supports it",
            ));
        }
        if !self.handshake_finished {
            return Err(Error::InvalidOperation("no established session to renegotiate"));
        }

        let status = self.ssl_mut()?.rehandshake();
        if let Some(err) = self.io.take_error() {
            return Err(err.into());
        }
        match status {
            engine::ERR_SEC_SUCCESS | engine::ERR_SSL_WOULD_BLOCK => {
                log::debug!("renegotiation scheduled");
                self.renegotiating = true;
                Ok(())
            }
            e => Err(Error::fatal(e)),
        }
    }

    /// Decrypts application bytes into the spare capacity of `data_out`.
    ///
    /// Reserves room for one record when `data_out` is full. On
    /// [`Poll::Ready`] the buffer has grown by the returned length;
    /// `Ready(0)` is end of stream.
    pub fn try_read(&mut self, data_out: &mut BytesMut) -> PollResult<usize> {
        if data_out.capacity() == data_out.len() {
            data_out.reserve(TLS_MAX_RECORD_SIZE);
        }
        let offset = data_out.len();
        data_out.resize(data_out.capacity(), 0);

        let result = self.try_read_slice(&mut data_out[offset..]);
        match &result {
            Ok(Poll::Ready(n)) => data_out.truncate(offset + n),
            _ => data_out.truncate(offset),
        }
        result
    }

    /// Decrypts application bytes into `data_out`, returning how many
    /// arrived. `Ready(0)` is end of stream.
    ///
    /// Only one record operation may be in flight at a time; an
    /// overlapping call fails with an invalid-operation error instead of
    /// touching the native handle.
    pub fn try_read_slice(&mut self, data_out: &mut [u8]) -> PollResult<usize> {
        let _guard = self.begin_io()?;
        self.read_step(data_out)
    }

    /// Encrypts and consumes bytes from the front of `data_in`.
    pub fn try_write(&mut self, data_in: &mut BytesMut) -> PollResult<usize> {
        match self.try_write_slice(data_in.as_ref()) {
            Ok(Poll::Ready(n)) => {
                data_in.advance(n);
                Ok(Poll::Ready(n))
            }
            other => other,
        }
    }

    /// Encrypts bytes from `data_in`, returning how many the engine
    /// consumed. A partial count means the rest must be resubmitted once
    /// the transport drains.
    ///
    /// Subject to the same single-flight rule as
    /// [`Self::try_read_slice`].
    pub fn try_write_slice(&mut self, data_in: &[u8]) -> PollResult<usize> {
        let _guard = self.begin_io()?;
        self.write_step(data_in)
    }

    /// Marks the session closed. Record operations fail from here on and
    /// any late native callback answers closed-abort without touching
    /// the transport.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        log::debug!("closing session");
        self.closed = true;
        self.io.set_closed();
    }

    /// Which end of the connection this session plays.
    pub fn side(&self) -> Side {
        self.side
    }

    /// True once [`Self::finish_handshake`] has sealed a completed
    /// handshake. Never reverts to false, renegotiation included.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// True once the handshake has completed.
    pub fn is_handshake_finished(&self) -> bool {
        self.handshake_finished
    }

    /// True while a scheduled renegotiation has not completed yet.
    pub fn is_renegotiating(&self) -> bool {
        self.renegotiating
    }

    /// True once [`Self::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Negotiated connection parameters, available from the moment the
    /// handshake first completes (or pauses for trust evaluation).
    pub fn connection_info(&self) -> Option<&ConnectionInfo> {
        self.connection_info.as_ref()
    }

    /// The peer's end-entity certificate as seen by the most recent
    /// trust evaluation. Present even when the validator rejected it.
    pub fn remote_certificate(&self) -> Option<&Certificate> {
        self.remote_certificate.as_ref()
    }

    /// The local certificate currently installed in the session, if any.
    pub fn local_certificate(&self) -> Option<&Certificate> {
        self.local_certificate.as_ref()
    }

    fn begin_io(&self) -> Result<IoGuard> {
        if self
            .pending_io
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::InvalidOperation(
                "another read or write is already in progress",
            ));
        }
        Ok(IoGuard {
            flag: Arc::clone(&self.pending_io),
        })
    }

    fn read_step(&mut self, data_out: &mut [u8]) -> PollResult<usize> {
        let _ = self.io.take_error();

        let (n, status) = self.ssl_mut()?.read(data_out);

        if let Some(err) = self.io.take_error() {
            return Err(err.into());
        }

        match status {
            engine::ERR_SEC_SUCCESS => {
                self.renegotiating = false;
                Ok(Poll::Ready(n))
            }
            engine::ERR_SSL_WOULD_BLOCK => Ok(self.pending()),
            engine::ERR_SSL_CLOSED_GRACEFUL => Ok(Poll::Ready(0)),
            // The engine reports an abort when the transport hit EOF
            // between records; from the peer that is an orderly shutdown
            // that skipped the close-notify.
            engine::ERR_SSL_CLOSED_ABORT | engine::ERR_SSL_CLOSED_NO_NOTIFY
                if self.io.saw_clean_eof() =>
            {
                Ok(Poll::Ready(0))
            }
            engine::ERR_SSL_PEER_AUTH_COMPLETED => {
                self.peer_auth_completed()?;
                Ok(self.pending())
            }
            engine::ERR_SSL_CLIENT_CERT_REQUESTED => {
                self.client_cert_requested()?;
                Ok(self.pending())
            }
            e => Err(Error::fatal(e)),
        }
    }

    fn write_step(&mut self, data_in: &[u8]) -> PollResult<usize> {
        let _ = self.io.take_error();

        let (n, status) = self.ssl_mut()?.write(data_in);

        if let Some(err) = self.io.take_error() {
            return Err(err.into());
        }

        match status {
            engine::ERR_SEC_SUCCESS => {
                self.renegotiating = false;
                Ok(Poll::Ready(n))
            }
            // The engine may consume part of the buffer before blocking;
            // report what went through so it is not resubmitted.
            engine::ERR_SSL_WOULD_BLOCK if n > 0 => Ok(Poll::Ready(n)),
            engine::ERR_SSL_WOULD_BLOCK => Ok(self.pending()),
            engine::ERR_SSL_PEER_AUTH_COMPLETED => {
                self.peer_auth_completed()?;
                Ok(self.pending())
            }
            engine::ERR_SSL_CLIENT_CERT_REQUESTED => {
                self.client_cert_requested()?;
                Ok(self.pending())
            }
            e => Err(Error::fatal(e)),
        }
    }

    fn pending<T>(&self) -> Poll<T> {
        match self.io.blocked() {
            Some(Blocked::Send) => Poll::PendingWrite,
            _ => Poll::PendingRead,
        }
    }

    fn ssl_mut(&mut self) -> Result<&mut dyn EngineSession> {
        if self.closed {
            return Err(Error::InvalidOperation("the session is closed"));
        }
        match self.ssl.as_deref_mut() {
            Some(ssl) => Ok(ssl),
            None => Err(Error::InvalidOperation("the handshake was never started")),
        }
    }

    /// Computed once; later completions (renegotiations included) keep
    /// the original parameters.
    fn cache_connection_info(&mut self) -> Result<()> {
        if self.connection_info.is_some() {
            return Ok(());
        }

        let peer_name = match self.side {
            Side::Client => self.target_host.clone(),
            Side::Server => self.requested_peer_name.clone(),
        };
        let (cipher_suite, protocol_version) = {
            let ssl = self.ssl_mut()?;
            (ssl.negotiated_cipher(), ssl.negotiated_protocol_version())
        };

        self.connection_info = Some(ConnectionInfo {
            cipher_suite,
            protocol_version,
            peer_name,
        });
        Ok(())
    }

    fn peer_auth_completed(&mut self) -> Result<()> {
        self.cache_connection_info()?;

        let trust = self.ssl_mut()?.copy_peer_trust();
        let outcome = trust::evaluate_trust(
            trust,
            self.policy.keychain.as_deref(),
            &TrustPolicy {
                side: self.side,
                target_host: self.target_host.as_deref(),
                validator: self.policy.validator.as_ref(),
                anchors: &self.policy.trust_anchors,
                verify_date: self.policy.verify_date,
            },
        );

        // Replaced wholesale on every evaluation, rejection included, so
        // callers can see which certificate was turned down.
        self.remote_certificate = outcome.remote_certificate;
        outcome.verdict
    }

    fn client_cert_requested(&mut self) -> Result<()> {
        self.peer_auth_completed()?;

        let issuers = self.ssl_mut()?.copy_distinguished_names();
        let Some(selector) = self.policy.client_cert_selector.clone() else {
            log::debug!("peer requested a client certificate; no selector is configured");
            return Ok(());
        };

        if let Some(certificate) = selector.select(&issuers) {
            self.set_local_certificate(&certificate)?;
        }
        Ok(())
    }

    fn client_hello_received(&mut self) -> Result<()> {
        self.requested_peer_name = self.ssl_mut()?.copy_requested_peer_name();

        let certificate = match self.policy.server_cert_selector.clone() {
            Some(selector) => selector.select(self.requested_peer_name.as_deref()),
            None => self.policy.certificate.clone(),
        };
        let Some(certificate) = certificate else {
            return Err(Error::Authentication(
                "no server certificate available for the requested host name".to_string(),
            ));
        };
        self.set_local_certificate(&certificate)
    }

    /// Resolves `certificate` into a native identity and installs it
    /// with its intermediates.
    fn set_local_certificate(&mut self, certificate: &Certificate) -> Result<()> {
        let Some(keychain) = self.policy.keychain.clone() else {
            return Err(Error::Authentication(
                "no credential store configured to resolve identities".to_string(),
            ));
        };

        let (identity, intermediates) =
            cert::identity_with_intermediates(keychain.as_ref(), certificate)?;
        if identity.certificate().der().is_empty() {
            return Err(Error::Authentication(
                "credential store produced an identity without a certificate".to_string(),
            ));
        }

        let status = self.ssl_mut()?.set_certificate(identity.as_ref(), &intermediates);
        ensure_success(status)?;

        self.local_certificate = Some(certificate.clone());
        // The handles drop here; the engine keeps its own references.
        Ok(())
    }
}

impl<IOCB: IOCallbacks> Drop for Session<IOCB> {
    fn drop(&mut self) {
        // Quiesce the callbacks before the native handle goes away.
        self.io.set_closed();
        if let Some(ssl) = self.ssl.take() {
            drop(ssl);
        }
    }
}
