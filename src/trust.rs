//! Peer-trust evaluation at handshake pause points.
//!
//! When the engine pauses with peer-auth-completed the session copies
//! the peer's trust object out and runs it through here. The native
//! evaluation result is advisory; the application's [`CertValidator`]
//! alone accepts or rejects the peer.
//!
//! [`CertValidator`]: crate::CertValidator

use std::time::SystemTime;

use bytes::Bytes;

use crate::callback::CertValidatorArg;
use crate::cert::{Certificate, Keychain};
use crate::engine::{self, TrustRef};
use crate::error::{Error, ErrorKind, Result};
use crate::Side;

/// Everything trust evaluation needs besides the trust object itself.
pub(crate) struct TrustPolicy<'a> {
    pub side: Side,
    pub target_host: Option<&'a str>,
    pub validator: Option<&'a CertValidatorArg>,
    pub anchors: &'a [Certificate],
    pub verify_date: Option<SystemTime>,
}

/// What an evaluation produced.
///
/// The leaf is reported even when the verdict is a rejection, so the
/// session can expose which certificate was turned down.
pub(crate) struct TrustOutcome {
    pub remote_certificate: Option<Certificate>,
    pub verdict: Result<()>,
}

impl TrustOutcome {
    fn rejected(status: engine::OsStatus) -> Self {
        Self {
            remote_certificate: None,
            verdict: Err(Error::fatal(status)),
        }
    }
}

/// Evaluates the peer's chain and asks the application for the verdict.
///
/// A missing or empty trust object is fatal for clients, which must
/// always authenticate the server. Servers tolerate it: an absent chain
/// just means the client declined to present a certificate.
///
/// Every native handle copied out of `trust` is released before this
/// returns, whatever the outcome.
pub(crate) fn evaluate_trust(
    trust: Option<TrustRef>,
    keychain: Option<&dyn Keychain>,
    policy: &TrustPolicy<'_>,
) -> TrustOutcome {
    let Some(mut trust) = trust else {
        return missing_chain(policy.side);
    };

    if !policy.anchors.is_empty() {
        match keychain {
            Some(keychain) => match convert_anchors(keychain, policy.anchors) {
                Ok(anchors) => {
                    let status = trust.set_anchor_certificates(&anchors);
                    if status != engine::ERR_SEC_SUCCESS {
                        return TrustOutcome::rejected(status);
                    }
                }
                Err(err) => {
                    return TrustOutcome {
                        remote_certificate: None,
                        verdict: Err(err),
                    }
                }
            },
            None => {
                log::warn!("trust anchors are configured but no keychain can convert them");
            }
        }
    }

    if let Some(date) = policy.verify_date {
        let status = trust.set_verify_date(date);
        if status != engine::ERR_SEC_SUCCESS {
            return TrustOutcome::rejected(status);
        }
    }

    let count = trust.certificate_count();
    if count == 0 {
        return missing_chain(policy.side);
    }
    if count > 1 {
        log::debug!("peer trust holds {count} certificates; index 0 is taken as the leaf");
    }

    let mut chain = Vec::with_capacity(count);
    for index in 0..count {
        match trust.certificate_at(index) {
            Some(cert) => chain.push(Certificate::from_der(Bytes::copy_from_slice(cert.der()))),
            None => return TrustOutcome::rejected(engine::ERR_SEC_PARAM),
        }
    }

    let leaf = chain[0].clone();
    let accepted = match policy.validator {
        Some(validator) => validator.validate(&chain, policy.side, policy.target_host),
        None => {
            log::debug!("no validator configured; peer chain accepted as presented");
            true
        }
    };

    let verdict = if accepted {
        Ok(())
    } else {
        Err(Error::Fatal(ErrorKind::CertificateUnknown(
            engine::ERR_SSL_PEER_CERT_UNKNOWN,
        )))
    };

    TrustOutcome {
        remote_certificate: Some(leaf),
        verdict,
    }
}

fn missing_chain(side: Side) -> TrustOutcome {
    match side {
        Side::Client => TrustOutcome {
            remote_certificate: None,
            verdict: Err(Error::Fatal(ErrorKind::CertificateUnknown(
                engine::ERR_SSL_PEER_CERT_UNKNOWN,
            ))),
        },
        Side::Server => {
            log::debug!("peer presented no certificate");
            TrustOutcome {
                remote_certificate: None,
                verdict: Ok(()),
            }
        }
    }
}

fn convert_anchors(
    keychain: &dyn Keychain,
    anchors: &[Certificate],
) -> Result<Vec<engine::CertificateRef>> {
    let mut converted = Vec::with_capacity(anchors.len());
    for anchor in anchors {
        converted.push(keychain.certificate(anchor)?);
    }
    Ok(converted)
}
