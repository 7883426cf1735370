//! Session factory and the policy snapshot behind it.

use std::sync::Arc;
use std::time::SystemTime;

use crate::callback::{
    CertValidatorArg, ClientCertSelectorArg, IOCallbacks, ServerCertSelectorArg,
};
use crate::cert::{Certificate, KeychainArg};
use crate::engine::{CipherSuite, TlsEngine};
use crate::ssl::{Session, SessionConfig};
use crate::{EnabledProtocols, Side};

/// Produces a [`Context`] once fully configured.
pub struct ContextBuilder {
    engine: Arc<dyn TlsEngine>,
    side: Side,
    policy: Policy,
}

/// Immutable configuration snapshot.
///
/// Cloned into every session a [`Context`] creates, so later changes to
/// a builder never affect sessions already running.
#[derive(Clone, Default)]
pub(crate) struct Policy {
    pub protocols: EnabledProtocols,
    pub allow_renegotiation: bool,
    pub ciphers: Option<Vec<CipherSuite>>,
    pub certificate: Option<Certificate>,
    pub client_cert_issuers: Option<Vec<String>>,
    pub trust_anchors: Vec<Certificate>,
    pub verify_date: Option<SystemTime>,
    pub validator: Option<CertValidatorArg>,
    pub client_cert_selector: Option<ClientCertSelectorArg>,
    pub server_cert_selector: Option<ServerCertSelectorArg>,
    pub keychain: Option<KeychainArg>,
}

impl ContextBuilder {
    /// Creates a builder for sessions playing `side` on `engine`.
    pub fn new(engine: Arc<dyn TlsEngine>, side: Side) -> Self {
        Self {
            engine,
            side,
            policy: Policy::default(),
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

    /// Restricts the protocol versions sessions may negotiate. The empty
    /// set keeps the engine's defaults.
    pub fn with_protocols(mut self, protocols: EnabledProtocols) -> Self {
        self.policy.protocols = protocols;
        self
    }

    /// Permits renegotiation of established sessions, where the engine
    /// supports it. Only servers may initiate one.
    pub fn with_renegotiation(mut self) -> Self {
        self.policy.allow_renegotiation = true;
        self
    }

    /// Restricts negotiation to exactly these cipher suites.
    pub fn with_enabled_ciphers(mut self, suites: Vec<CipherSuite>) -> Self {
        self.policy.ciphers = Some(suites);
        self
    }

    /// Pre-selects the local certificate.
    pub fn with_certificate(mut self, certificate: Certificate) -> Self {
        self.policy.certificate = Some(certificate);
        self
    }

    /// Distinguished names a server sends as hints when it requests a
    /// client certificate.
    pub fn with_client_cert_issuers(mut self, issuers: Vec<String>) -> Self {
        self.policy.client_cert_issuers = Some(issuers);
        self
    }

    /// Overrides the anchors peer chains are evaluated against.
    pub fn with_trust_anchors(mut self, anchors: Vec<Certificate>) -> Self {
        self.policy.trust_anchors = anchors;
        self
    }

    /// Evaluates peer certificate validity as of `date` instead of the
    /// current time.
    pub fn with_verify_date(mut self, date: SystemTime) -> Self {
        self.policy.verify_date = Some(date);
        self
    }

    /// Application authority over peer certificate chains.
    pub fn with_validator(mut self, validator: CertValidatorArg) -> Self {
        self.policy.validator = Some(validator);
        self
    }

    /// Source of the certificate a client offers on request.
    pub fn with_client_cert_selector(mut self, selector: ClientCertSelectorArg) -> Self {
        self.policy.client_cert_selector = Some(selector);
        self
    }

    /// Source of the certificate a server presents, chosen by requested
    /// host name.
    pub fn with_server_cert_selector(mut self, selector: ServerCertSelectorArg) -> Self {
        self.policy.server_cert_selector = Some(selector);
        self
    }

    /// Credential store used to resolve certificates into identities.
    pub fn with_keychain(mut self, keychain: KeychainArg) -> Self {
        self.policy.keychain = Some(keychain);
        self
    }

    /// Finalizes the builder into a [`Context`].
    pub fn build(self) -> Context {
        Context {
            engine: self.engine,
            side: self.side,
            policy: self.policy,
        }
    }
}

/// A reusable bundle of engine and policy that vends [`Session`]s.
pub struct Context {
    engine: Arc<dyn TlsEngine>,
    side: Side,
    policy: Policy,
}

impl Context {
    /// Which end of the connection sessions from this context play.
    pub fn side(&self) -> Side {
        self.side
    }

    /// Creates a session around `config`'s transport.
    ///
    /// The native session itself is not allocated until
    /// [`Session::start_handshake`].
    pub fn new_session<IOCB: IOCallbacks>(&self, config: SessionConfig<IOCB>) -> Session<IOCB> {
        Session::new(
            Arc::clone(&self.engine),
            self.side,
            self.policy.clone(),
            config,
        )
    }
}
