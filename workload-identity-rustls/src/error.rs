/// Result type used by this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by `workload-identity-rustls`.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The peer identity was rejected by the authorizer.
    #[error("peer identity is not authorized: {0}")]
    UnauthorizedPeer(String),

    /// Failed to build a `rustls` verifier.
    #[error("rustls verifier builder error: {0}")]
    VerifierBuilder(String),

    /// A `rustls` error occurred.
    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),

    /// Invalid authorizer configuration.
    #[error("invalid authorizer configuration: {0}")]
    AuthorizerConfig(#[from] AuthorizerConfigError),
}

/// Errors from building an authorizer out of strings.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum AuthorizerConfigError {
    /// An identity in an allow list is not an absolute URI.
    #[error("invalid peer identity {0:?}: {1}")]
    InvalidIdentity(String, String),

    /// A trust domain name is empty or contains invalid characters.
    #[error("invalid trust domain {0:?}")]
    InvalidTrustDomain(String),
}
