use crate::authorizer::Authorizer;
use crate::error::Result;
use crate::verifier::{crypto_provider, BundleProvider, PeerServerVerifier};
use rustls::client::ResolvesClientCert;
use rustls::ClientConfig;
use std::sync::Arc;
use workload_identity::IdentitySource;

/// Function type for customizing a `ClientConfig`.
type ClientConfigCustomizer = Box<dyn FnOnce(&mut ClientConfig) + Send>;

/// Builds a [`rustls::ClientConfig`] backed by a live [`IdentitySource`].
///
/// The resulting configuration:
///
/// * presents the source's current credential as the client certificate
/// * validates the server chain against the source's current trust bundle
/// * authorizes the server by its resolved [`crate::PeerIdentity`]
///
/// Material is read at the start of every handshake, so a rotation is picked
/// up by the next connection without rebuilding the config. There is no host
/// name verification; the server name only drives SNI.
///
/// # Examples
///
/// ```no_run
/// use workload_identity::IdentitySource;
/// use workload_identity_rustls::{authorizer, mtls_client};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = IdentitySource::connect("unix:///tmp/spire-agent/public/api.sock").await?;
///
/// let client_config = mtls_client(source)
///     .authorize(authorizer::exact(["spiffe://example.org/myservice"])?)
///     .with_alpn_protocols([b"h2"])
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientConfigBuilder {
    source: IdentitySource,
    authorizer: Arc<dyn Authorizer>,
    alpn_protocols: Vec<Vec<u8>>,
    config_customizer: Option<ClientConfigCustomizer>,
}

impl std::fmt::Debug for ClientConfigBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfigBuilder")
            .field("source", &self.source)
            .field("authorizer", &"<Arc<dyn Authorizer>>")
            .field("alpn_protocols", &self.alpn_protocols)
            .field("config_customizer", &self.config_customizer.is_some())
            .finish()
    }
}

impl ClientConfigBuilder {
    /// Creates a new builder.
    ///
    /// Defaults:
    /// - Authorization: any peer that chains to the bundle
    /// - ALPN protocols: none
    pub fn new(source: IdentitySource) -> Self {
        Self {
            source,
            authorizer: Arc::new(crate::authorizer::any()),
            alpn_protocols: Vec::new(),
            config_customizer: None,
        }
    }

    /// Sets the authorization policy for the server identity.
    ///
    /// Accepts any type that implements [`Authorizer`], including closures.
    #[must_use]
    pub fn authorize<A: Authorizer>(mut self, authorizer: A) -> Self {
        self.authorizer = Arc::new(authorizer);
        self
    }

    /// Sets the ALPN protocols, most preferred first.
    #[must_use]
    pub fn with_alpn_protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u8]>,
    {
        self.alpn_protocols = protocols.into_iter().map(|p| p.as_ref().to_vec()).collect();
        self
    }

    /// Applies a customizer to the `ClientConfig` after everything else is set.
    ///
    /// Do not replace the verifier or the certificate resolver; both carry the
    /// identity checks.
    #[must_use]
    pub fn with_config_customizer<F>(mut self, customizer: F) -> Self
    where
        F: FnOnce(&mut ClientConfig) + Send + 'static,
    {
        self.config_customizer = Some(Box::new(customizer));
        self
    }

    /// Builds the `rustls::ClientConfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if no crypto provider can be installed or the
    /// provider rejects the default protocol versions.
    pub fn build(self) -> Result<ClientConfig> {
        let provider = crypto_provider()?;

        let resolver: Arc<dyn ResolvesClientCert> =
            Arc::new(resolve_client::CredentialResolver {
                source: self.source.clone(),
            });

        let verifier = Arc::new(PeerServerVerifier::new(
            Arc::new(self.source) as Arc<dyn BundleProvider>,
            self.authorizer,
            Arc::clone(&provider),
        ));

        let mut cfg = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_cert_resolver(resolver);

        cfg.alpn_protocols = self.alpn_protocols;

        if let Some(customizer) = self.config_customizer {
            customizer(&mut cfg);
        }

        Ok(cfg)
    }
}

mod resolve_client {
    use crate::prelude::{debug, error};
    use rustls::client::ResolvesClientCert;
    use rustls::sign::CertifiedKey;
    use std::sync::Arc;
    use workload_identity::IdentitySource;

    #[derive(Clone, Debug)]
    pub(crate) struct CredentialResolver {
        pub source: IdentitySource,
    }

    impl ResolvesClientCert for CredentialResolver {
        fn resolve(
            &self,
            _root_hint_subjects: &[&[u8]],
            _sigschemes: &[rustls::SignatureScheme],
        ) -> Option<Arc<CertifiedKey>> {
            match self.source.current_credential() {
                Ok(credential) => {
                    debug!("presenting client credential v{}", credential.version());
                    Some(credential.certified_key())
                }
                Err(e) => {
                    error!("no client credential to present: {e}");
                    None
                }
            }
        }

        fn has_certs(&self) -> bool {
            true
        }
    }
}
