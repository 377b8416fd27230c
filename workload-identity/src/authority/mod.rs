//! Identity authorities: where identity material comes from.
//!
//! An [`Authority`] hands out the current certificate chain, private key and
//! trust bundle on request. The [`crate::IdentitySource`] owns exactly one
//! authority and calls [`Authority::fetch`] for the initial fetch and every
//! refresh after that.

mod directory;
mod static_authority;
#[cfg(feature = "workload-api")]
mod workload_api;

pub use directory::DirectoryAuthority;
pub use static_authority::StaticAuthority;
#[cfg(feature = "workload-api")]
pub use workload_api::WorkloadApiAuthority;

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use zeroize::Zeroize;

/// Boxed future returned by [`Authority::fetch`].
pub type AuthorityFuture<'a> =
    Pin<Box<dyn Future<Output = Result<AuthorityMaterial, AuthorityError>> + Send + 'a>>;

/// An external issuer of identity material.
///
/// Implementations must be cheap to call repeatedly. The source serializes
/// calls to `fetch`, so an implementation never sees two concurrent fetches
/// from the same source.
pub trait Authority: fmt::Debug + Send + Sync + 'static {
    /// Fetches the current chain, key and trust bundle.
    fn fetch(&self) -> AuthorityFuture<'_>;

    /// Releases any connection held to the authority.
    ///
    /// Called once when the owning source closes. The default does nothing.
    fn close(&self) {}
}

/// Raw material as delivered by an authority, before validation.
///
/// All certificates are DER encoded. The chain is leaf first. The key is
/// PKCS#8 DER and is zeroized on drop.
#[derive(Clone)]
pub struct AuthorityMaterial {
    /// Leaf-first identity certificate chain.
    pub cert_chain: Vec<Vec<u8>>,
    /// PKCS#8 private key for the leaf.
    pub private_key: Vec<u8>,
    /// Root certificates of the trust bundle.
    pub trust_bundle: Vec<Vec<u8>>,
}

impl AuthorityMaterial {
    /// Bundles the three pieces of raw material together.
    pub fn new(cert_chain: Vec<Vec<u8>>, private_key: Vec<u8>, trust_bundle: Vec<Vec<u8>>) -> Self {
        Self {
            cert_chain,
            private_key,
            trust_bundle,
        }
    }
}

impl fmt::Debug for AuthorityMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorityMaterial")
            .field("cert_chain_len", &self.cert_chain.len())
            .field("private_key", &"<redacted>")
            .field("trust_bundle_len", &self.trust_bundle.len())
            .finish()
    }
}

impl Drop for AuthorityMaterial {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// Errors returned by an [`Authority`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum AuthorityError {
    /// The authority cannot be reached right now.
    #[error("authority unavailable: {0}")]
    Unavailable(String),

    /// Reading authority files failed.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// File that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The authority answered, but the answer does not decode.
    #[error("malformed authority response: {0}")]
    MalformedResponse(String),

    /// The authority address is not a valid URL or path.
    #[error("invalid authority address: {0}")]
    InvalidAddress(String),

    /// The authority address uses a scheme this build cannot serve.
    #[error("unsupported authority address scheme: {0}")]
    UnsupportedScheme(String),

    /// Workload API client error.
    #[error("workload API error: {0}")]
    WorkloadApi(String),

    /// A fetch did not complete in time.
    #[error("authority fetch timed out after {0:?}")]
    Timeout(Duration),

    /// The authority has been closed.
    #[error("authority is closed")]
    Closed,
}

impl AuthorityError {
    /// `true` if the authority responded with something that cannot be used,
    /// as opposed to not responding at all.
    pub fn is_malformed_response(&self) -> bool {
        matches!(self, AuthorityError::MalformedResponse(_))
    }
}

/// Builds an authority from an address string.
///
/// * `unix://...` and `tcp://...` connect to a SPIFFE Workload API endpoint
///   (requires the `workload-api` feature).
/// * `file:///dir` or a bare path reads PEM files from a directory.
///
/// # Errors
///
/// Returns [`AuthorityError::InvalidAddress`] for empty or unparsable input and
/// [`AuthorityError::UnsupportedScheme`] for other schemes.
pub fn from_address(address: &str) -> Result<Arc<dyn Authority>, AuthorityError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(AuthorityError::InvalidAddress("address is empty".into()));
    }

    if !address.contains("://") {
        return Ok(Arc::new(DirectoryAuthority::new(address)));
    }

    let url = Url::parse(address).map_err(|e| AuthorityError::InvalidAddress(e.to_string()))?;
    match url.scheme() {
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|()| AuthorityError::InvalidAddress(address.to_owned()))?;
            Ok(Arc::new(DirectoryAuthority::new(path)))
        }
        #[cfg(feature = "workload-api")]
        "unix" | "tcp" => Ok(Arc::new(WorkloadApiAuthority::new(address))),
        other => Err(AuthorityError::UnsupportedScheme(other.to_owned())),
    }
}

/// Owns the source's authority and closes it exactly once.
#[derive(Debug)]
pub(crate) struct AuthorityGuard {
    authority: Arc<dyn Authority>,
    released: AtomicBool,
}

impl AuthorityGuard {
    pub(crate) fn new(authority: Arc<dyn Authority>) -> Self {
        Self {
            authority,
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn get(&self) -> &Arc<dyn Authority> {
        &self.authority
    }

    pub(crate) fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.authority.close();
        }
    }
}

impl Drop for AuthorityGuard {
    fn drop(&mut self) {
        self.release();
    }
}
