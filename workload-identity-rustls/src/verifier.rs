//! rustls verifiers that validate peers against the live trust bundle and then
//! apply an [`Authorizer`].
//!
//! Both verifiers read the bundle at the start of every callback. Validation
//! happens first; the peer identity is resolved and authorized only for chains
//! that passed.

use crate::authorizer::Authorizer;
use crate::error::{Error, Result};
use crate::prelude::{debug, warn};
use crate::resolve::{PeerIdentity, ResolveCache};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ParsedCertificate, WebPkiClientVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use workload_identity::{IdentitySource, TrustBundle};

pub(crate) fn other_err<E>(e: E) -> rustls::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rustls::Error::Other(rustls::OtherError(Arc::new(e)))
}

pub(crate) fn crypto_provider() -> Result<Arc<CryptoProvider>> {
    workload_identity::crypto::default_provider()
        .ok_or_else(|| Error::VerifierBuilder("no rustls crypto provider is installed".into()))
}

/// Access to the current trust bundle.
///
/// Lets verifiers be tested against a fixed bundle without running a source.
pub(crate) trait BundleProvider: Send + Sync + 'static {
    fn current_bundle(&self) -> Arc<TrustBundle>;
}

impl BundleProvider for IdentitySource {
    fn current_bundle(&self) -> Arc<TrustBundle> {
        IdentitySource::current_bundle(self)
    }
}

fn full_chain(
    end_entity: &CertificateDer<'_>,
    intermediates: &[CertificateDer<'_>],
) -> Vec<CertificateDer<'static>> {
    std::iter::once(end_entity)
        .chain(intermediates)
        .map(|c| c.clone().into_owned())
        .collect()
}

/// Resolves and authorizes a validated chain.
struct PeerCheck {
    authorizer: Arc<dyn Authorizer>,
    cache: ResolveCache,
}

impl PeerCheck {
    fn new(authorizer: Arc<dyn Authorizer>) -> Self {
        Self {
            authorizer,
            cache: ResolveCache::new(),
        }
    }

    fn authorize(
        &self,
        role: &str,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
    ) -> std::result::Result<PeerIdentity, rustls::Error> {
        let peer = self.cache.resolve(&full_chain(end_entity, intermediates));
        if self.authorizer.authorize(&peer) {
            debug!("authorized {role} peer {peer}");
            Ok(peer)
        } else {
            warn!("rejected {role} peer {peer}: not authorized");
            Err(other_err(Error::UnauthorizedPeer(peer.id().to_owned())))
        }
    }
}

// ------------ Server verifier (client side) ------------

/// Validates server chains. There is no host name check: the server's
/// identity lives in its URI SAN and is handled by the authorizer.
pub(crate) struct PeerServerVerifier {
    bundles: Arc<dyn BundleProvider>,
    provider: Arc<CryptoProvider>,
    check: PeerCheck,
}

impl PeerServerVerifier {
    pub(crate) fn new(
        bundles: Arc<dyn BundleProvider>,
        authorizer: Arc<dyn Authorizer>,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            bundles,
            provider,
            check: PeerCheck::new(authorizer),
        }
    }
}

impl fmt::Debug for PeerServerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerServerVerifier")
            .field("cache", &self.check.cache)
            .finish_non_exhaustive()
    }
}

impl ServerCertVerifier for PeerServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let bundle = self.bundles.current_bundle();
        let cert = ParsedCertificate::try_from(end_entity)?;

        rustls::client::verify_server_cert_signed_by_trust_anchor(
            &cert,
            bundle.roots(),
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )
        .inspect_err(|e| debug!("server chain rejected by bundle v{}: {e}", bundle.version()))?;

        self.check.authorize("server", end_entity, intermediates)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ------------ Client verifier (server side) ------------

type CachedClientVerifier = (u64, Arc<dyn ClientCertVerifier>);

/// Validates client chains. A client certificate is mandatory.
///
/// The webpki verifier for a bundle is built once per bundle version and
/// replaced when the version changes.
pub(crate) struct PeerClientVerifier {
    bundles: Arc<dyn BundleProvider>,
    provider: Arc<CryptoProvider>,
    check: PeerCheck,
    cached: Mutex<Option<CachedClientVerifier>>,
}

impl PeerClientVerifier {
    pub(crate) fn new(
        bundles: Arc<dyn BundleProvider>,
        authorizer: Arc<dyn Authorizer>,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            bundles,
            provider,
            check: PeerCheck::new(authorizer),
            cached: Mutex::new(None),
        }
    }

    fn inner(&self) -> Result<Arc<dyn ClientCertVerifier>> {
        let bundle = self.bundles.current_bundle();
        let mut cached = self.cached.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some((version, verifier)) = cached.as_ref() {
            if *version == bundle.version() {
                return Ok(Arc::clone(verifier));
            }
        }

        let verifier = WebPkiClientVerifier::builder_with_provider(
            Arc::clone(bundle.roots()),
            Arc::clone(&self.provider),
        )
        .build()
        .map_err(|e| Error::VerifierBuilder(e.to_string()))?;

        debug!("built client verifier for bundle v{}", bundle.version());
        *cached = Some((bundle.version(), Arc::clone(&verifier)));
        Ok(verifier)
    }
}

impl fmt::Debug for PeerClientVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let version = self
            .cached
            .lock()
            .ok()
            .and_then(|c| c.as_ref().map(|(v, _)| *v));
        f.debug_struct("PeerClientVerifier")
            .field("cached_bundle_version", &version)
            .finish_non_exhaustive()
    }
}

impl ClientCertVerifier for PeerClientVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        let inner = self.inner().map_err(other_err)?;
        let verified = inner
            .verify_client_cert(end_entity, intermediates, now)
            .inspect_err(|e| debug!("client chain rejected: {e}"))?;

        self.check.authorize("client", end_entity, intermediates)?;
        Ok(verified)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authorizer;
    use std::sync::atomic::{AtomicU64, Ordering};
    use test_harness::{LeafSpec, TestCa};

    /// A bundle provider whose bundle can be swapped by tests.
    struct FixedBundles {
        bundle: Mutex<Arc<TrustBundle>>,
        reads: AtomicU64,
    }

    impl FixedBundles {
        fn new(version: u64, ca: &TestCa) -> Arc<Self> {
            Arc::new(Self {
                bundle: Mutex::new(Arc::new(TrustBundle::from_der(version, [ca.root_der()]).unwrap())),
                reads: AtomicU64::new(0),
            })
        }

        fn replace(&self, version: u64, ca: &TestCa) {
            *self.bundle.lock().unwrap() =
                Arc::new(TrustBundle::from_der(version, [ca.root_der()]).unwrap());
        }
    }

    impl BundleProvider for FixedBundles {
        fn current_bundle(&self) -> Arc<TrustBundle> {
            self.reads.fetch_add(1, Ordering::Relaxed);
            Arc::clone(&self.bundle.lock().unwrap())
        }
    }

    fn der(ca: &TestCa, path: &str) -> CertificateDer<'static> {
        CertificateDer::from(ca.issue_workload(path).cert_der)
    }

    fn downcast(err: &rustls::Error) -> Option<&Error> {
        match err {
            rustls::Error::Other(other) => other.0.downcast_ref::<Error>(),
            _ => None,
        }
    }

    fn server_verifier(bundles: Arc<FixedBundles>, auth: impl Authorizer) -> PeerServerVerifier {
        PeerServerVerifier::new(bundles, Arc::new(auth), crypto_provider().unwrap())
    }

    fn client_verifier(bundles: Arc<FixedBundles>, auth: impl Authorizer) -> PeerClientVerifier {
        PeerClientVerifier::new(bundles, Arc::new(auth), crypto_provider().unwrap())
    }

    fn verify_server(v: &PeerServerVerifier, leaf: &CertificateDer<'_>) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let name = ServerName::try_from("not-checked.invalid").unwrap();
        v.verify_server_cert(leaf, &[], &name, &[], UnixTime::now())
    }

    #[test]
    fn server_chain_to_bundle_is_accepted_without_name_check() {
        let ca = TestCa::new("example.org");
        let v = server_verifier(FixedBundles::new(1, &ca), authorizer::any());

        assert!(verify_server(&v, &der(&ca, "/server")).is_ok());
    }

    #[test]
    fn server_chain_from_foreign_ca_is_rejected() {
        let trusted = TestCa::new("example.org");
        let foreign = TestCa::new("example.org");
        let v = server_verifier(FixedBundles::new(1, &trusted), authorizer::any());

        let err = verify_server(&v, &der(&foreign, "/server")).unwrap_err();
        assert!(matches!(err, rustls::Error::InvalidCertificate(_)), "{err:?}");
    }

    #[test]
    fn server_authorizer_runs_after_validation() {
        let ca = TestCa::new("example.org");
        let v = server_verifier(
            FixedBundles::new(1, &ca),
            authorizer::exact(["spiffe://example.org/expected"]).unwrap(),
        );

        assert!(verify_server(&v, &der(&ca, "/expected")).is_ok());

        let err = verify_server(&v, &der(&ca, "/other")).unwrap_err();
        assert!(matches!(
            downcast(&err),
            Some(Error::UnauthorizedPeer(id)) if id == "spiffe://example.org/other"
        ));
    }

    #[test]
    fn server_verifier_follows_bundle_replacement() {
        let old_ca = TestCa::new("example.org");
        let new_ca = TestCa::new("example.org");
        let bundles = FixedBundles::new(1, &old_ca);
        let v = server_verifier(Arc::clone(&bundles), authorizer::any());

        let new_leaf = der(&new_ca, "/server");
        assert!(verify_server(&v, &new_leaf).is_err());

        bundles.replace(2, &new_ca);
        assert!(verify_server(&v, &new_leaf).is_ok());
    }

    #[test]
    fn client_verifier_is_cached_per_bundle_version() {
        let ca = TestCa::new("example.org");
        let bundles = FixedBundles::new(1, &ca);
        let v = client_verifier(Arc::clone(&bundles), authorizer::any());

        let first = v.inner().unwrap();
        let again = v.inner().unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        bundles.replace(2, &ca);
        let rebuilt = v.inner().unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));
        assert!(v.client_auth_mandatory());
        assert!(v.root_hint_subjects().is_empty());
    }

    #[test]
    fn client_chain_is_validated_then_authorized() {
        let ca = TestCa::new("example.org");
        let foreign = TestCa::new("example.org");
        let v = client_verifier(
            FixedBundles::new(1, &ca),
            authorizer::trust_domains(["example.org"]).unwrap(),
        );

        assert!(v.verify_client_cert(&der(&ca, "/client"), &[], UnixTime::now()).is_ok());
        assert!(v
            .verify_client_cert(&der(&foreign, "/client"), &[], UnixTime::now())
            .is_err());

        let cn_only = CertificateDer::from(ca.issue(LeafSpec::common_name("legacy")).cert_der);
        let err = v.verify_client_cert(&cn_only, &[], UnixTime::now()).unwrap_err();
        assert!(matches!(downcast(&err), Some(Error::UnauthorizedPeer(id)) if id == "legacy"));
    }

    #[test]
    fn verifiers_read_bundle_per_callback() {
        let ca = TestCa::new("example.org");
        let bundles = FixedBundles::new(1, &ca);
        let v = server_verifier(Arc::clone(&bundles), authorizer::any());
        let leaf = der(&ca, "/server");

        verify_server(&v, &leaf).unwrap();
        verify_server(&v, &leaf).unwrap();
        assert_eq!(bundles.reads.load(Ordering::Relaxed), 2);
    }
}
