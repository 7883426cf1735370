//! Certificates and the credential-store adapter.
//!
//! The embedding application hands certificates over as DER bytes,
//! optionally with a private key and intermediates attached. Before the
//! engine can use one it must become a native identity handle: either
//! imported fresh (key in hand) or found in the credential store by
//! DER comparison.

use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::engine::{CertificateRef, IdentityRef};
use crate::error::{Error, Result};

/// A certificate as the embedding application supplies it.
#[derive(Clone)]
pub struct Certificate {
    der: Bytes,
    private_key: Option<Bytes>,
    intermediates: Vec<Certificate>,
}

impl Certificate {
    /// Wraps a DER-encoded certificate.
    pub fn from_der(der: impl Into<Bytes>) -> Self {
        Self {
            der: der.into(),
            private_key: None,
            intermediates: Vec::new(),
        }
    }

    /// Attaches the private key, making the certificate importable as an
    /// identity.
    pub fn with_private_key(mut self, key: impl Into<Bytes>) -> Self {
        self.private_key = Some(key.into());
        self
    }

    /// Attaches the intermediates to send alongside the leaf.
    pub fn with_intermediates(mut self, intermediates: Vec<Certificate>) -> Self {
        self.intermediates = intermediates;
        self
    }

    /// DER encoding of the certificate.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Whether a private key is attached.
    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    /// The attached private key, if any.
    pub fn private_key(&self) -> Option<&[u8]> {
        self.private_key.as_deref()
    }

    /// Intermediates attached to the certificate.
    pub fn intermediates(&self) -> &[Certificate] {
        &self.intermediates
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        certificates_equal(self.der(), other.der())
    }
}

impl Eq for Certificate {}

impl std::fmt::Debug for Certificate {
    // Key material stays out of logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("der_len", &self.der.len())
            .field("has_private_key", &self.private_key.is_some())
            .field("intermediates", &self.intermediates.len())
            .finish()
    }
}

/// The credential store identities are imported into and searched in.
pub trait Keychain: Send + Sync {
    /// Imports `certificate` and its private key as a native identity.
    /// `password` protects the bundle in transit; it is never empty.
    fn import_identity(&self, certificate: &Certificate, password: &str) -> Result<IdentityRef>;

    /// Identities currently in the store, in search order.
    fn identities(&self) -> Vec<IdentityRef>;

    /// Wraps a certificate's DER bytes in a native certificate handle.
    fn certificate(&self, certificate: &Certificate) -> Result<CertificateRef>;
}

/// Shared reference to a [`Keychain`].
pub type KeychainArg = Arc<dyn Keychain>;

/// Equality used by the credential-store search: same backing buffer, or
/// byte-for-byte identical DER.
pub(crate) fn certificates_equal(a: &[u8], b: &[u8]) -> bool {
    if std::ptr::eq(a.as_ptr(), b.as_ptr()) && a.len() == b.len() {
        return true;
    }
    a == b
}

/// Transit password for identity import. The importer rejects empty
/// passwords, so sixteen random bytes are hex-coded into a throwaway
/// one.
fn random_password() -> String {
    let mut raw = [0u8; 16];
    let mut rng = OsRng;
    rng.fill_bytes(&mut raw);
    raw.iter().map(|b| format!("{b:02x}")).collect()
}

/// Resolves the native identity for `certificate`.
///
/// With a private key attached the certificate is imported directly.
/// Without one the store is searched for an identity whose leaf matches
/// the certificate's DER. `None` if the search comes up empty.
pub(crate) fn find_identity(
    keychain: &dyn Keychain,
    certificate: &Certificate,
) -> Result<Option<IdentityRef>> {
    if certificate.has_private_key() {
        let password = random_password();
        return keychain.import_identity(certificate, &password).map(Some);
    }

    for identity in keychain.identities() {
        let candidate = identity.certificate();
        if certificates_equal(candidate.der(), certificate.der()) {
            return Ok(Some(identity));
        }
        // Non-matching handles are released as they go out of scope.
    }

    Ok(None)
}

/// [`find_identity`], but an empty search is an error.
pub(crate) fn require_identity(
    keychain: &dyn Keychain,
    certificate: &Certificate,
) -> Result<IdentityRef> {
    find_identity(keychain, certificate)?.ok_or(Error::InvalidOperation(
        "no identity in the credential store matches the certificate",
    ))
}

/// Resolves the identity plus native handles for the attached
/// intermediates.
///
/// On failure every handle created so far drops before the error
/// propagates; nothing leaks to the caller.
pub(crate) fn identity_with_intermediates(
    keychain: &dyn Keychain,
    certificate: &Certificate,
) -> Result<(IdentityRef, Vec<CertificateRef>)> {
    let identity = require_identity(keychain, certificate)?;

    let mut chain = Vec::with_capacity(certificate.intermediates().len());
    for intermediate in certificate.intermediates() {
        chain.push(keychain.certificate(intermediate)?);
    }

    Ok((identity, chain))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::engine::NativeCertificate;
    use crate::engine::NativeIdentity;

    /// Tracks how many native handles are alive.
    #[derive(Default)]
    struct HandleCounter {
        alive: AtomicUsize,
    }

    impl HandleCounter {
        fn track(self: &Arc<Self>, der: &[u8]) -> TestHandle {
            self.alive.fetch_add(1, Ordering::SeqCst);
            TestHandle {
                der: der.to_vec(),
                counter: Arc::clone(self),
            }
        }

        fn alive(&self) -> usize {
            self.alive.load(Ordering::SeqCst)
        }
    }

    struct TestHandle {
        der: Vec<u8>,
        counter: Arc<HandleCounter>,
    }

    impl Drop for TestHandle {
        fn drop(&mut self) {
            self.counter.alive.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl NativeCertificate for TestHandle {
        fn der(&self) -> &[u8] {
            &self.der
        }
    }

    impl NativeIdentity for TestHandle {
        fn certificate(&self) -> CertificateRef {
            Box::new(self.counter.track(&self.der))
        }
    }

    /// Keychain whose store contents and failure points are scripted.
    struct TestKeychain {
        counter: Arc<HandleCounter>,
        stored: Vec<Vec<u8>>,
        imported_with: Mutex<Vec<String>>,
        fail_on_der: Option<Vec<u8>>,
    }

    impl TestKeychain {
        fn new() -> Self {
            Self {
                counter: Arc::new(HandleCounter::default()),
                stored: Vec::new(),
                imported_with: Mutex::new(Vec::new()),
                fail_on_der: None,
            }
        }
    }

    impl Keychain for TestKeychain {
        fn import_identity(
            &self,
            certificate: &Certificate,
            password: &str,
        ) -> Result<IdentityRef> {
            assert!(!password.is_empty());
            self.imported_with
                .lock()
                .unwrap()
                .push(password.to_string());
            Ok(Box::new(self.counter.track(certificate.der())))
        }

        fn identities(&self) -> Vec<IdentityRef> {
            self.stored
                .iter()
                .map(|der| Box::new(self.counter.track(der)) as IdentityRef)
                .collect()
        }

        fn certificate(&self, certificate: &Certificate) -> Result<CertificateRef> {
            if self.fail_on_der.as_deref() == Some(certificate.der()) {
                return Err(Error::Authentication(
                    "credential store rejected the certificate".to_string(),
                ));
            }
            Ok(Box::new(self.counter.track(certificate.der())))
        }
    }

    #[test]
    fn der_equality() {
        let a = Certificate::from_der(Bytes::from_static(b"\x30\x82leaf"));
        let b = Certificate::from_der(Bytes::copy_from_slice(b"\x30\x82leaf"));
        let c = Certificate::from_der(Bytes::from_static(b"\x30\x82other"));

        // Clones share the backing buffer; the pointer fast path covers
        // them, byte comparison covers the rest.
        assert_eq!(a, a.clone());
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn private_key_triggers_import_with_fresh_password() {
        let keychain = TestKeychain::new();
        let cert = Certificate::from_der(Bytes::from_static(b"leaf")).with_private_key(
            Bytes::from_static(b"key"),
        );

        let identity = find_identity(&keychain, &cert).unwrap().unwrap();
        assert_eq!(identity.certificate().der(), b"leaf");

        let passwords = keychain.imported_with.lock().unwrap();
        assert_eq!(passwords.len(), 1);
        // 16 random bytes, hex-coded.
        assert_eq!(passwords[0].len(), 32);
        assert!(passwords[0].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn store_search_matches_on_der() {
        let mut keychain = TestKeychain::new();
        keychain.stored.push(b"first".to_vec());
        keychain.stored.push(b"second".to_vec());

        let wanted = Certificate::from_der(Bytes::from_static(b"second"));
        let identity = find_identity(&keychain, &wanted).unwrap().unwrap();
        assert_eq!(identity.certificate().der(), b"second");
        assert!(keychain.imported_with.lock().unwrap().is_empty());

        drop(identity);
        assert_eq!(keychain.counter.alive(), 0);
    }

    #[test]
    fn missing_identity_is_an_error_only_when_required() {
        let keychain = TestKeychain::new();
        let cert = Certificate::from_der(Bytes::from_static(b"absent"));

        assert!(find_identity(&keychain, &cert).unwrap().is_none());
        assert!(matches!(
            require_identity(&keychain, &cert),
            Err(Error::InvalidOperation(_))
        ));
    }

    #[test]
    fn failed_intermediate_conversion_releases_every_handle() {
        let mut keychain = TestKeychain::new();
        keychain.stored.push(b"leaf".to_vec());
        keychain.fail_on_der = Some(b"inter2".to_vec());

        let cert = Certificate::from_der(Bytes::from_static(b"leaf")).with_intermediates(vec![
            Certificate::from_der(Bytes::from_static(b"inter1")),
            Certificate::from_der(Bytes::from_static(b"inter2")),
        ]);

        let Err(err) = identity_with_intermediates(&keychain, &cert) else {
            panic!("conversion must fail on the second intermediate");
        };
        assert!(matches!(err, Error::Authentication(_)));
        // The identity and the first intermediate were created before the
        // failure; both must be gone.
        assert_eq!(keychain.counter.alive(), 0);
    }

    #[test]
    fn intermediates_convert_in_order() {
        let mut keychain = TestKeychain::new();
        keychain.stored.push(b"leaf".to_vec());

        let cert = Certificate::from_der(Bytes::from_static(b"leaf")).with_intermediates(vec![
            Certificate::from_der(Bytes::from_static(b"inter1")),
            Certificate::from_der(Bytes::from_static(b"inter2")),
        ]);

        let (identity, chain) = identity_with_intermediates(&keychain, &cert).unwrap();
        assert_eq!(identity.certificate().der(), b"leaf");
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].der(), b"inter1");
        assert_eq!(chain[1].der(), b"inter2");

        drop(identity);
        drop(chain);
        assert_eq!(keychain.counter.alive(), 0);
    }
}
