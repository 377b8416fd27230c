#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! # workload-identity
//!
//! A live-refreshing holder of a workload's X.509 identity (certificate chain +
//! private key) and the trust bundle used to validate peers.
//!
//! [`IdentitySource`] fetches material from an external identity authority,
//! publishes it as immutable, versioned [`Snapshot`]s and keeps it fresh in a
//! background task. Readers never block and never observe a chain from one
//! version paired with the key of another.
//!
//! TLS integration lives in the `workload-identity-rustls` and
//! `workload-identity-tokio` crates, which read the current snapshot at the
//! start of every handshake.
//!
//! ## Feature flags
//!
//! Exactly **one** `rustls` crypto provider must be enabled:
//!
//! * `ring` (default)
//! * `aws-lc-rs`
//!
//! Observability:
//!
//! * `logging` (default): emit records through the `log` facade
//! * `tracing`: emit `tracing` events instead
//!
//! Authorities:
//!
//! * `workload-api`: fetch identities from a SPIFFE Workload API endpoint
//!
//! ## Example
//!
//! ```no_run
//! use workload_identity::IdentitySource;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let source = IdentitySource::connect("file:///var/run/identity").await?;
//!
//! let credential = source.current_credential()?;
//! println!("identity version {}", credential.version());
//!
//! source.close().await;
//! # Ok(())
//! # }
//! ```

#[cfg(all(feature = "ring", feature = "aws-lc-rs"))]
compile_error!("Enable only one crypto provider feature: `ring` or `aws-lc-rs`.");

#[cfg(not(any(feature = "ring", feature = "aws-lc-rs")))]
compile_error!("Enable one crypto provider feature: `ring` (default) or `aws-lc-rs`.");

pub mod authority;
pub mod cert;
pub mod crypto;
pub mod material;
pub mod source;

mod observability;
mod prelude;

pub use authority::{Authority, AuthorityError, AuthorityMaterial, DirectoryAuthority, StaticAuthority};
pub use cert::{Certificate, PrivateKey, SanEntry};
pub use material::{IdentityCredential, MaterialError, Snapshot, TrustBundle};
pub use source::{
    IdentitySource, IdentitySourceBuilder, ReconnectConfig, RefreshConfig, RotationUpdates,
    SourceError,
};

#[cfg(feature = "workload-api")]
pub use authority::WorkloadApiAuthority;
