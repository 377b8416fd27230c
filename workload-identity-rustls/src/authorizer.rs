//! Authorization predicates over authenticated peer identities.

use crate::error::{AuthorizerConfigError, Result};
use crate::resolve::{trust_domain_of, PeerIdentity};
use spiffe::TrustDomain;
use std::collections::BTreeSet;
use std::sync::Arc;
use url::Url;

/// Authorization policy for peer identities.
///
/// Authorization runs **after** the peer chain has been verified against the
/// current trust bundle. Implementations must be thread-safe.
pub trait Authorizer: Send + Sync + 'static {
    /// Returns `true` if the peer is authorized.
    fn authorize(&self, peer: &PeerIdentity) -> bool;
}

impl<F> Authorizer for F
where
    F: Fn(&PeerIdentity) -> bool + Send + Sync + 'static,
{
    fn authorize(&self, peer: &PeerIdentity) -> bool {
        self(peer)
    }
}

impl Authorizer for Arc<dyn Authorizer> {
    fn authorize(&self, peer: &PeerIdentity) -> bool {
        (**self).authorize(peer)
    }
}

impl Authorizer for Box<dyn Authorizer> {
    fn authorize(&self, peer: &PeerIdentity) -> bool {
        (**self).authorize(peer)
    }
}

/// Accepts every authenticated peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Any;

impl Authorizer for Any {
    fn authorize(&self, _peer: &PeerIdentity) -> bool {
        true
    }
}

/// Accepts only the listed identities.
#[derive(Debug, Clone)]
pub struct Exact {
    allowed: Arc<BTreeSet<String>>,
}

impl Exact {
    /// Creates an allow list. An empty list authorizes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorizerConfigError::InvalidIdentity`] if an entry is not
    /// an absolute URI.
    pub fn new<I, S>(ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed = BTreeSet::new();
        for id in ids {
            let id = id.as_ref().trim();
            Url::parse(id)
                .map_err(|e| AuthorizerConfigError::InvalidIdentity(id.to_owned(), e.to_string()))?;
            allowed.insert(id.to_owned());
        }
        Ok(Self {
            allowed: Arc::new(allowed),
        })
    }
}

impl Authorizer for Exact {
    fn authorize(&self, peer: &PeerIdentity) -> bool {
        self.allowed.contains(peer.id())
    }
}

/// Accepts any `spiffe://` identity from the listed trust domains.
#[derive(Debug, Clone)]
pub struct TrustDomains {
    allowed: Arc<BTreeSet<String>>,
}

impl TrustDomains {
    /// Creates a trust domain allow list. An empty list authorizes nothing.
    ///
    /// Accepts bare names (`example.org`) or `spiffe://example.org`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorizerConfigError::InvalidTrustDomain`] for empty names or
    /// names with characters outside `[a-z0-9._-]`.
    pub fn new<I, S>(domains: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed = BTreeSet::new();
        for domain in domains {
            allowed.insert(normalize_trust_domain(domain.as_ref())?);
        }
        Ok(Self {
            allowed: Arc::new(allowed),
        })
    }
}

impl Authorizer for TrustDomains {
    fn authorize(&self, peer: &PeerIdentity) -> bool {
        trust_domain_of(peer.id()).is_some_and(|td| self.allowed.contains(&td))
    }
}

// Names are case-folded and may carry the `spiffe://` prefix or a trailing
// slash; the rest is checked by `spiffe::TrustDomain`.
fn normalize_trust_domain(raw: &str) -> std::result::Result<String, AuthorizerConfigError> {
    let name = raw.trim().trim_end_matches('/').to_ascii_lowercase();
    if name.is_empty() {
        return Err(AuthorizerConfigError::InvalidTrustDomain(raw.to_owned()));
    }

    TrustDomain::new(&name)
        .map(|td| td.to_string())
        .map_err(|_| AuthorizerConfigError::InvalidTrustDomain(raw.to_owned()))
}

/// Accepts any authenticated peer.
///
/// Useful when authorization happens at another layer. Verification against
/// the trust bundle still applies.
pub fn any() -> Any {
    Any
}

/// Accepts only the given identities.
///
/// # Errors
///
/// Returns an error if any identity is not an absolute URI.
///
/// # Examples
///
/// ```rust
/// use workload_identity_rustls::authorizer;
///
/// let auth = authorizer::exact([
///     "spiffe://example.org/payments",
///     "spiffe://example.org/checkout",
/// ])?;
/// # Ok::<(), workload_identity_rustls::Error>(())
/// ```
pub fn exact<I, S>(ids: I) -> Result<Exact>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    Exact::new(ids)
}

/// Accepts any identity from the given trust domains.
///
/// # Errors
///
/// Returns an error if any trust domain name is invalid.
///
/// # Examples
///
/// ```rust
/// use workload_identity_rustls::authorizer;
///
/// let auth = authorizer::trust_domains(["example.org", "partner.example"])?;
/// # Ok::<(), workload_identity_rustls::Error>(())
/// ```
pub fn trust_domains<I, S>(domains: I) -> Result<TrustDomains>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    TrustDomains::new(domains)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::CertificateDer;
    use test_harness::{LeafSpec, TestCa};

    fn peer(spec: LeafSpec) -> PeerIdentity {
        let ca = TestCa::new("example.org");
        let leaf = ca.issue(spec);
        PeerIdentity::from_chain(&[CertificateDer::from(leaf.cert_der)])
    }

    #[test]
    fn exact_matches_whole_identity() {
        let auth = exact(["spiffe://example.org/service1", "spiffe://example.org/service2"]).unwrap();

        assert!(auth.authorize(&peer(LeafSpec::spiffe("spiffe://example.org/service1"))));
        assert!(!auth.authorize(&peer(LeafSpec::spiffe("spiffe://example.org/service3"))));
        assert!(!auth.authorize(&peer(LeafSpec::spiffe("spiffe://other.org/service1"))));
    }

    #[test]
    fn exact_rejects_relative_entries() {
        assert!(matches!(
            exact(["not-a-uri"]),
            Err(crate::Error::AuthorizerConfig(AuthorizerConfigError::InvalidIdentity(..)))
        ));
    }

    #[test]
    fn trust_domains_match_host() {
        let auth = trust_domains(["example.org", "spiffe://Partner.example/"]).unwrap();

        assert!(auth.authorize(&peer(LeafSpec::spiffe("spiffe://example.org/a"))));
        assert!(auth.authorize(&peer(LeafSpec::spiffe("spiffe://partner.example/b"))));
        assert!(!auth.authorize(&peer(LeafSpec::spiffe("spiffe://third.org/a"))));
        assert!(!auth.authorize(&peer(LeafSpec::common_name("example.org"))));
    }

    #[test]
    fn trust_domains_reject_invalid_names() {
        assert!(trust_domains([""]).is_err());
        assert!(trust_domains(["bad domain"]).is_err());
        assert!(trust_domains(["ex@mple.org"]).is_err());
        assert!(trust_domains(["spiffe://"]).is_err());
        assert!(trust_domains(["spiffe://example.org/path/../x"]).is_err());
    }

    #[test]
    fn trust_domains_accept_spiffe_ids() {
        let auth = trust_domains(["spiffe://example.org/some/workload"]).unwrap();
        assert!(auth.authorize(&peer(LeafSpec::spiffe("spiffe://example.org/a"))));
    }

    #[test]
    fn trust_domains_ignore_malformed_peer_ids() {
        let auth = trust_domains(["example.org"]).unwrap();
        assert!(!auth.authorize(&peer(LeafSpec::spiffe("spiffe://example.org/a//b"))));
        assert!(!auth.authorize(&peer(LeafSpec::spiffe("https://example.org/a"))));
    }

    #[test]
    fn empty_allow_lists_authorize_nothing() {
        let p = peer(LeafSpec::spiffe("spiffe://example.org/a"));
        assert!(!exact(Vec::<String>::new()).unwrap().authorize(&p));
        assert!(!trust_domains(Vec::<String>::new()).unwrap().authorize(&p));
    }

    #[test]
    fn closures_and_boxes_are_authorizers() {
        let p = peer(LeafSpec::spiffe("spiffe://example.org/api/orders"));

        let by_path = |peer: &PeerIdentity| peer.id().contains("/api/");
        assert!(by_path.authorize(&p));

        let boxed: Box<dyn Authorizer> = Box::new(any());
        assert!(boxed.authorize(&PeerIdentity::unknown()));

        let shared: Arc<dyn Authorizer> = Arc::new(by_path);
        assert!(shared.authorize(&p));
    }
}
