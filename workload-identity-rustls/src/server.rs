use crate::authorizer::Authorizer;
use crate::error::Result;
use crate::verifier::{crypto_provider, BundleProvider, PeerClientVerifier};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::ServerConfig;
use std::sync::Arc;
use workload_identity::IdentitySource;

/// Function type for customizing a `ServerConfig`.
type ServerConfigCustomizer = Box<dyn FnOnce(&mut ServerConfig) + Send>;

/// Per-connection hook: inspects the `ClientHello` and optionally returns a
/// config to use instead of the default.
pub type ClientHelloHook =
    Arc<dyn Fn(&ClientHello<'_>) -> Option<Arc<ServerConfig>> + Send + Sync>;

/// Builds a [`rustls::ServerConfig`] backed by a live [`IdentitySource`].
///
/// The resulting configuration:
///
/// * presents the source's current credential as the server certificate
/// * requires a client certificate and validates it against the current
///   trust bundle
/// * authorizes the client by its resolved [`crate::PeerIdentity`]
///
/// # Examples
///
/// ```no_run
/// use workload_identity::IdentitySource;
/// use workload_identity_rustls::{authorizer, mtls_server};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = IdentitySource::connect("file:///var/run/identity").await?;
///
/// let server_config = mtls_server(source)
///     .authorize(authorizer::trust_domains(["example.org"])?)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ServerConfigBuilder {
    source: IdentitySource,
    authorizer: Arc<dyn Authorizer>,
    alpn_protocols: Vec<Vec<u8>>,
    config_customizer: Option<ServerConfigCustomizer>,
    client_hello_hook: Option<ClientHelloHook>,
}

impl std::fmt::Debug for ServerConfigBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfigBuilder")
            .field("source", &self.source)
            .field("authorizer", &"<Arc<dyn Authorizer>>")
            .field("alpn_protocols", &self.alpn_protocols)
            .field("config_customizer", &self.config_customizer.is_some())
            .field("client_hello_hook", &self.client_hello_hook.is_some())
            .finish()
    }
}

impl ServerConfigBuilder {
    /// Creates a new builder.
    ///
    /// Defaults:
    /// - Authorization: any client that chains to the bundle
    /// - ALPN protocols: none
    /// - Per-connection hook: none
    pub fn new(source: IdentitySource) -> Self {
        Self {
            source,
            authorizer: Arc::new(crate::authorizer::any()),
            alpn_protocols: Vec::new(),
            config_customizer: None,
            client_hello_hook: None,
        }
    }

    /// Sets the authorization policy for client identities.
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

    /// Applies a customizer to the `ServerConfig` after everything else is set.
    ///
    /// Do not replace the verifier or the certificate resolver.
    #[must_use]
    pub fn with_config_customizer<F>(mut self, customizer: F) -> Self
    where
        F: FnOnce(&mut ServerConfig) + Send + 'static,
    {
        self.config_customizer = Some(Box::new(customizer));
        self
    }

    /// Installs a hook that can pick a different config per connection.
    ///
    /// Only honored by acceptors that read the `ClientHello` first, such as
    /// the one built from [`ServerConfigBuilder::build_selector`].
    #[must_use]
    pub fn config_for_client<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ClientHello<'_>) -> Option<Arc<ServerConfig>> + Send + Sync + 'static,
    {
        self.client_hello_hook = Some(Arc::new(hook));
        self
    }

    /// Builds the `rustls::ServerConfig`.
    ///
    /// Any per-connection hook is ignored; use
    /// [`ServerConfigBuilder::build_selector`] to keep it.
    ///
    /// # Errors
    ///
    /// Returns an error if no crypto provider can be installed or the
    /// provider rejects the default protocol versions.
    pub fn build(self) -> Result<ServerConfig> {
        self.build_parts().map(|(cfg, _)| cfg)
    }

    /// Builds the default config together with the per-connection hook.
    ///
    /// # Errors
    ///
    /// Same as [`ServerConfigBuilder::build`].
    pub fn build_selector(self) -> Result<ServerConfigSelector> {
        let (cfg, hook) = self.build_parts()?;
        Ok(ServerConfigSelector {
            default: Arc::new(cfg),
            hook,
        })
    }

    fn build_parts(self) -> Result<(ServerConfig, Option<ClientHelloHook>)> {
        let provider = crypto_provider()?;

        let resolver: Arc<dyn ResolvesServerCert> =
            Arc::new(resolve_server::CredentialResolver {
                source: self.source.clone(),
            });

        let verifier = Arc::new(PeerClientVerifier::new(
            Arc::new(self.source) as Arc<dyn BundleProvider>,
            self.authorizer,
            Arc::clone(&provider),
        ));

        let mut cfg = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_client_cert_verifier(verifier)
            .with_cert_resolver(resolver);

        cfg.alpn_protocols = self.alpn_protocols;

        if let Some(customizer) = self.config_customizer {
            customizer(&mut cfg);
        }

        Ok((cfg, self.client_hello_hook))
    }
}

/// A default server config plus an optional per-connection override.
#[derive(Clone)]
pub struct ServerConfigSelector {
    default: Arc<ServerConfig>,
    hook: Option<ClientHelloHook>,
}

impl std::fmt::Debug for ServerConfigSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfigSelector")
            .field("hook", &self.hook.is_some())
            .finish_non_exhaustive()
    }
}

impl ServerConfigSelector {
    /// A selector that always returns `default`.
    pub fn new(default: Arc<ServerConfig>) -> Self {
        Self {
            default,
            hook: None,
        }
    }

    /// The config used when the hook is absent or declines.
    pub fn default_config(&self) -> &Arc<ServerConfig> {
        &self.default
    }

    /// Picks the config for a connection given its `ClientHello`.
    pub fn select(&self, hello: &ClientHello<'_>) -> Arc<ServerConfig> {
        self.hook
            .as_ref()
            .and_then(|hook| hook(hello))
            .unwrap_or_else(|| Arc::clone(&self.default))
    }
}

impl From<Arc<ServerConfig>> for ServerConfigSelector {
    fn from(default: Arc<ServerConfig>) -> Self {
        Self::new(default)
    }
}

mod resolve_server {
    use crate::prelude::{debug, error};
    use rustls::server::ResolvesServerCert;
    use rustls::sign::CertifiedKey;
    use std::sync::Arc;
    use workload_identity::IdentitySource;

    #[derive(Clone, Debug)]
    pub(crate) struct CredentialResolver {
        pub source: IdentitySource,
    }

    impl ResolvesServerCert for CredentialResolver {
        fn resolve(
            &self,
            _client_hello: rustls::server::ClientHello<'_>,
        ) -> Option<Arc<CertifiedKey>> {
            match self.source.current_credential() {
                Ok(credential) => {
                    debug!("presenting server credential v{}", credential.version());
                    Some(credential.certified_key())
                }
                Err(e) => {
                    error!("no server credential to present: {e}");
                    None
                }
            }
        }
    }
}
