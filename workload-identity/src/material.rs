//! Immutable, versioned identity material.
//!
//! A [`Snapshot`] pairs one [`TrustBundle`] with one [`IdentityCredential`] of
//! the same version. Snapshots are published whole and never edited in place.

use crate::authority::AuthorityMaterial;
use crate::cert::error::{CertificateError, PrivateKeyError};
use crate::cert::{Certificate, PrivateKey, MAX_CERT_CHAIN_LENGTH};
use crate::prelude::debug;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use rustls::{InconsistentKeys, RootCertStore};
use std::sync::Arc;
use time::OffsetDateTime;

/// Errors raised while turning authority output into usable material.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum MaterialError {
    /// The authority returned no certificates for the identity chain.
    #[error("identity certificate chain is empty")]
    EmptyChain,

    /// The authority returned no trust bundle roots, or none were usable.
    #[error("trust bundle contains no usable root certificates")]
    EmptyBundle,

    /// The identity chain exceeds the accepted length.
    #[error("identity certificate chain is too long (max {max})")]
    ChainTooLong {
        /// Maximum accepted chain length.
        max: usize,
    },

    /// A certificate failed to parse.
    #[error("invalid certificate: {0}")]
    Certificate(#[from] CertificateError),

    /// The private key failed to decode.
    #[error("invalid private key: {0}")]
    PrivateKey(#[from] PrivateKeyError),

    /// The private key does not belong to the leaf certificate.
    #[error("private key does not match the leaf certificate public key")]
    KeyMismatch,

    /// The leaf certificate is already past its `not_after`.
    #[error("identity certificate expired at {not_after}")]
    Expired {
        /// End of the validity window.
        not_after: OffsetDateTime,
    },

    /// The authority response could not be decoded into certificates/keys.
    #[error("malformed authority response: {0}")]
    Malformed(String),

    /// No `rustls` crypto provider is installed.
    #[error("rustls crypto provider is not installed")]
    NoCryptoProvider,

    /// `rustls` rejected the key material.
    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Root certificates used to validate peer chains.
///
/// Invariant: never empty.
#[derive(Debug)]
pub struct TrustBundle {
    version: u64,
    authorities: Vec<Certificate>,
    roots: Arc<RootCertStore>,
}

impl TrustBundle {
    /// Builds a bundle from DER-encoded root certificates.
    ///
    /// # Errors
    ///
    /// Returns [`MaterialError::EmptyBundle`] if `roots` is empty or none of the
    /// certificates are usable as trust anchors, and
    /// [`MaterialError::Certificate`] if any of them fails to parse.
    pub fn from_der<I, B>(version: u64, roots: I) -> Result<Self, MaterialError>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let authorities = roots
            .into_iter()
            .map(|der| Certificate::try_from(der.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        if authorities.is_empty() {
            return Err(MaterialError::EmptyBundle);
        }

        let mut store = RootCertStore::empty();
        let (added, ignored) = store.add_parsable_certificates(
            authorities
                .iter()
                .map(|c| CertificateDer::from(c.as_bytes().to_vec())),
        );
        debug!("loaded trust bundle: version={version}, added={added}, ignored={ignored}");

        if store.is_empty() {
            return Err(MaterialError::EmptyBundle);
        }

        Ok(Self {
            version,
            authorities,
            roots: Arc::new(store),
        })
    }

    /// Version of the snapshot this bundle belongs to.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The root certificates, as delivered by the authority.
    pub fn authorities(&self) -> &[Certificate] {
        &self.authorities
    }

    /// The roots as a ready-to-use `rustls` store.
    pub fn roots(&self) -> &Arc<RootCertStore> {
        &self.roots
    }

    /// Number of root certificates.
    pub fn len(&self) -> usize {
        self.authorities.len()
    }

    /// Always `false`; a bundle cannot be constructed empty.
    pub fn is_empty(&self) -> bool {
        self.authorities.is_empty()
    }

    fn same_roots<B: AsRef<[u8]>>(&self, roots: &[B]) -> bool {
        self.authorities.len() == roots.len()
            && self
                .authorities
                .iter()
                .zip(roots)
                .all(|(held, new)| held.as_bytes() == new.as_ref())
    }
}

/// This workload's own certificate chain and the matching private key.
///
/// Invariant: the key belongs to the leaf certificate, and the chain is never
/// exposed without it.
pub struct IdentityCredential {
    version: u64,
    chain: Vec<Certificate>,
    key: PrivateKey,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    certified_key: Arc<CertifiedKey>,
}

impl std::fmt::Debug for IdentityCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityCredential")
            .field("version", &self.version)
            .field("chain_len", &self.chain.len())
            .field("key", &self.key)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl IdentityCredential {
    /// Builds a credential from a leaf-first DER chain and a PKCS#8 key.
    ///
    /// The validity window is taken from the leaf. Expiry is not checked here;
    /// see [`IdentityCredential::is_expired_at`].
    ///
    /// # Errors
    ///
    /// Returns [`MaterialError`] if the chain is empty or too long, anything
    /// fails to parse, or the key does not match the leaf.
    pub fn from_der<B: AsRef<[u8]>>(
        version: u64,
        chain: &[B],
        private_key: &[u8],
    ) -> Result<Self, MaterialError> {
        if chain.is_empty() {
            return Err(MaterialError::EmptyChain);
        }
        if chain.len() > MAX_CERT_CHAIN_LENGTH {
            return Err(MaterialError::ChainTooLong {
                max: MAX_CERT_CHAIN_LENGTH,
            });
        }

        let chain = chain
            .iter()
            .map(|der| Certificate::try_from(der.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let key = PrivateKey::try_from(private_key)?;

        let (not_before, not_after) = chain[0].validity()?;
        let certified_key = certified_key(&chain, &key)?;

        Ok(Self {
            version,
            chain,
            key,
            not_before,
            not_after,
            certified_key,
        })
    }

    /// Version of the snapshot this credential belongs to.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The leaf-first certificate chain.
    pub fn cert_chain(&self) -> &[Certificate] {
        &self.chain
    }

    /// The leaf certificate.
    pub fn leaf(&self) -> &Certificate {
        &self.chain[0]
    }

    /// The private key matching the leaf.
    pub fn private_key(&self) -> &PrivateKey {
        &self.key
    }

    /// Start of the leaf validity window.
    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    /// End of the leaf validity window.
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Length of the validity window.
    pub fn lifetime(&self) -> time::Duration {
        self.not_after - self.not_before
    }

    /// `true` once `now` is past `not_after`.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now > self.not_after
    }

    /// The chain and signing key in the form `rustls` presents during a handshake.
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }

    fn same_material<B: AsRef<[u8]>>(&self, chain: &[B], private_key: &[u8]) -> bool {
        self.key.as_bytes() == private_key
            && self.chain.len() == chain.len()
            && self
                .chain
                .iter()
                .zip(chain)
                .all(|(held, new)| held.as_bytes() == new.as_ref())
    }
}

/// One published version of identity material.
#[derive(Debug)]
pub struct Snapshot {
    version: u64,
    bundle: Arc<TrustBundle>,
    credential: Arc<IdentityCredential>,
}

impl Snapshot {
    /// Validates authority output and assembles a snapshot tagged `version`.
    ///
    /// # Errors
    ///
    /// Returns [`MaterialError`] for malformed or inconsistent material, and
    /// [`MaterialError::Expired`] if the leaf is already expired at `now`.
    pub fn from_material(
        version: u64,
        material: &AuthorityMaterial,
        now: OffsetDateTime,
    ) -> Result<Self, MaterialError> {
        let credential =
            IdentityCredential::from_der(version, &material.cert_chain, &material.private_key)?;
        if credential.is_expired_at(now) {
            return Err(MaterialError::Expired {
                not_after: credential.not_after(),
            });
        }

        let bundle = TrustBundle::from_der(version, &material.trust_bundle)?;

        Ok(Self {
            version,
            bundle: Arc::new(bundle),
            credential: Arc::new(credential),
        })
    }

    /// The snapshot version. Bundle and credential carry the same number.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The trust bundle of this version.
    pub fn bundle(&self) -> &Arc<TrustBundle> {
        &self.bundle
    }

    /// The identity credential of this version.
    pub fn credential(&self) -> &Arc<IdentityCredential> {
        &self.credential
    }

    /// `true` if `material` would produce exactly this snapshot's content.
    pub fn same_material(&self, material: &AuthorityMaterial) -> bool {
        self.credential
            .same_material(&material.cert_chain, &material.private_key)
            && self.bundle.same_roots(&material.trust_bundle)
    }
}

fn certified_key(chain: &[Certificate], key: &PrivateKey) -> Result<Arc<CertifiedKey>, MaterialError> {
    let provider = crate::crypto::default_provider().ok_or(MaterialError::NoCryptoProvider)?;

    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.as_bytes().to_vec()));
    let signing_key = provider.key_provider.load_private_key(key_der)?;

    let cert_chain = chain
        .iter()
        .map(|c| CertificateDer::from(c.as_bytes().to_vec()))
        .collect();
    let certified = CertifiedKey::new(cert_chain, signing_key);

    match certified.keys_match() {
        // Some providers cannot expose the public half of a key; accept those.
        Ok(()) | Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {}
        Err(rustls::Error::InconsistentKeys(InconsistentKeys::KeyMismatch)) => {
            return Err(MaterialError::KeyMismatch)
        }
        Err(e) => return Err(MaterialError::Rustls(e)),
    }

    Ok(Arc::new(certified))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_harness::{unrelated_key_der, LeafSpec, TestCa};

    fn material(ca: &TestCa, spec: LeafSpec) -> AuthorityMaterial {
        let leaf = ca.issue(spec);
        AuthorityMaterial::new(leaf.chain(), leaf.key_der, vec![ca.root_der()])
    }

    #[test]
    fn snapshot_from_valid_material() {
        let ca = TestCa::new("example.org");
        let m = material(&ca, LeafSpec::spiffe("spiffe://example.org/workload-a"));

        let snap = Snapshot::from_material(7, &m, OffsetDateTime::now_utc()).unwrap();

        assert_eq!(snap.version(), 7);
        assert_eq!(snap.bundle().version(), 7);
        assert_eq!(snap.credential().version(), 7);
        assert_eq!(snap.bundle().len(), 1);
        assert!(!snap.bundle().roots().is_empty());
        assert_eq!(snap.credential().certified_key().cert.len(), 1);
        assert!(snap.same_material(&m));
    }

    #[test]
    fn key_mismatch_is_rejected() {
        let ca = TestCa::new("example.org");
        let leaf = ca.issue(LeafSpec::spiffe("spiffe://example.org/a"));
        let m = AuthorityMaterial::new(leaf.chain(), unrelated_key_der(), vec![ca.root_der()]);

        let err = Snapshot::from_material(1, &m, OffsetDateTime::now_utc()).unwrap_err();
        assert!(matches!(err, MaterialError::KeyMismatch), "got {err:?}");
    }

    #[test]
    fn expired_leaf_is_rejected() {
        let ca = TestCa::new("example.org");
        let m = material(
            &ca,
            LeafSpec::spiffe("spiffe://example.org/a")
                .valid_around_now(time::Duration::hours(2), time::Duration::hours(-1)),
        );

        let err = Snapshot::from_material(1, &m, OffsetDateTime::now_utc()).unwrap_err();
        assert!(matches!(err, MaterialError::Expired { .. }), "got {err:?}");
    }

    #[test]
    fn empty_chain_and_bundle_are_rejected() {
        let ca = TestCa::new("example.org");
        let leaf = ca.issue(LeafSpec::spiffe("spiffe://example.org/a"));

        let no_chain = AuthorityMaterial::new(Vec::new(), leaf.key_der.clone(), vec![ca.root_der()]);
        assert!(matches!(
            Snapshot::from_material(1, &no_chain, OffsetDateTime::now_utc()),
            Err(MaterialError::EmptyChain)
        ));

        let no_bundle = AuthorityMaterial::new(leaf.chain(), leaf.key_der, Vec::new());
        assert!(matches!(
            Snapshot::from_material(1, &no_bundle, OffsetDateTime::now_utc()),
            Err(MaterialError::EmptyBundle)
        ));
    }

    #[test]
    fn overlong_chain_is_rejected() {
        let ca = TestCa::new("example.org");
        let leaf = ca.issue(LeafSpec::spiffe("spiffe://example.org/a"));
        let chain = vec![leaf.cert_der.clone(); MAX_CERT_CHAIN_LENGTH + 1];

        let err = IdentityCredential::from_der(1, &chain, &leaf.key_der).unwrap_err();
        assert!(matches!(err, MaterialError::ChainTooLong { max } if max == MAX_CERT_CHAIN_LENGTH));
    }

    #[test]
    fn same_material_detects_rotation() {
        let ca = TestCa::new("example.org");
        let first = material(&ca, LeafSpec::spiffe("spiffe://example.org/a"));
        let second = material(&ca, LeafSpec::spiffe("spiffe://example.org/a"));

        let snap = Snapshot::from_material(1, &first, OffsetDateTime::now_utc()).unwrap();
        assert!(snap.same_material(&first));
        assert!(!snap.same_material(&second));
    }
}
