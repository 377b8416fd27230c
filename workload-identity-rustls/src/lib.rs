#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! # workload-identity-rustls
//!
//! Builders for [`rustls::ClientConfig`] and [`rustls::ServerConfig`] backed
//! by a live [`workload_identity::IdentitySource`].
//!
//! Every handshake reads the source's current snapshot: the local credential
//! is presented from it and the peer chain is validated against its trust
//! bundle. When the source rotates, the **next** handshake uses the new
//! material; established connections are untouched.
//!
//! Peers are validated first and authorized second. Authorization works on a
//! [`PeerIdentity`] resolved from the validated leaf: the first URI SAN, else
//! the subject common name, else [`UNKNOWN_IDENTITY`].
//!
//! The default authorizer accepts any peer that chains to the bundle.
//! Production deployments should pass [`authorizer::exact`] or
//! [`authorizer::trust_domains`].
//!
//! ## Feature flags
//!
//! Exactly **one** `rustls` crypto provider must be enabled:
//!
//! * `ring` (default)
//! * `aws-lc-rs`

#[cfg(all(feature = "ring", feature = "aws-lc-rs"))]
compile_error!("Enable only one crypto provider feature: `ring` or `aws-lc-rs`.");

#[cfg(not(any(feature = "ring", feature = "aws-lc-rs")))]
compile_error!("Enable one crypto provider feature: `ring` (default) or `aws-lc-rs`.");

pub mod authorizer;
pub mod resolve;

mod error;

mod observability;
mod prelude;

mod client;
mod server;
mod verifier;

pub use authorizer::{any, exact, trust_domains, Authorizer};
pub use client::ClientConfigBuilder;
pub use error::{AuthorizerConfigError, Error, Result};
pub use resolve::{peer_identity, resolve_id, PeerIdentity, UNKNOWN_IDENTITY};
pub use server::{ClientHelloHook, ServerConfigBuilder, ServerConfigSelector};

use workload_identity::IdentitySource;

/// Constructor for the mTLS client builder.
///
/// # Examples
///
/// ```no_run
/// use workload_identity::IdentitySource;
/// use workload_identity_rustls::{authorizer, mtls_client};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = IdentitySource::connect("file:///var/run/identity").await?;
///
/// let client_config = mtls_client(source)
///     .authorize(authorizer::exact(["spiffe://example.org/myservice"])?)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub fn mtls_client(source: IdentitySource) -> ClientConfigBuilder {
    ClientConfigBuilder::new(source)
}

/// Constructor for the mTLS server builder.
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
pub fn mtls_server(source: IdentitySource) -> ServerConfigBuilder {
    ServerConfigBuilder::new(source)
}
