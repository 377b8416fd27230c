//! Peer identity resolution.
//!
//! The identity of a peer is read from the leaf of its validated chain:
//! the first URI SAN, else the subject common name, else [`UNKNOWN_IDENTITY`].
//! Resolution never validates anything; it only runs on chains that already
//! passed verification.

use rustls::pki_types::CertificateDer;
use rustls::CommonState;
use spiffe::SpiffeId;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher as _};
use std::sync::{Arc, Mutex, PoisonError};
use workload_identity::cert::{common_name_from_der, first_uri_san_from_der};

/// Identity reported for peers whose leaf carries neither a URI SAN nor a
/// common name.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// The resolved identity of an authenticated peer, with its chain.
///
/// Only produced from chains that passed verification, or from connections
/// whose handshake completed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerIdentity {
    id: Arc<str>,
    chain: Arc<[CertificateDer<'static>]>,
}

impl PeerIdentity {
    pub(crate) fn from_chain(chain: &[CertificateDer<'_>]) -> Self {
        let id = chain
            .first()
            .and_then(|leaf| resolve_leaf(leaf.as_ref()))
            .unwrap_or_else(|| UNKNOWN_IDENTITY.to_owned());
        Self::with_id(id, chain)
    }

    fn with_id(id: impl Into<Arc<str>>, chain: &[CertificateDer<'_>]) -> Self {
        Self {
            id: id.into(),
            chain: chain.iter().map(|c| c.clone().into_owned()).collect(),
        }
    }

    /// The sentinel identity with an empty chain.
    pub fn unknown() -> Self {
        Self {
            id: Arc::from(UNKNOWN_IDENTITY),
            chain: Arc::from(Vec::new()),
        }
    }

    /// The identity string, e.g. `spiffe://example.org/payments`.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The peer's certificate chain, leaf first.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// `true` for the `unknown` sentinel.
    pub fn is_unknown(&self) -> bool {
        &*self.id == UNKNOWN_IDENTITY
    }

    /// The trust domain of a `spiffe://` identity, `None` for anything else.
    pub fn trust_domain(&self) -> Option<String> {
        trust_domain_of(&self.id)
    }
}

impl std::fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

/// Resolves the identity of the peer on a connection whose handshake completed.
///
/// Returns [`PeerIdentity::unknown`] while the handshake is still running or if
/// the peer presented no certificates.
pub fn peer_identity(conn: &CommonState) -> PeerIdentity {
    if conn.is_handshaking() {
        return PeerIdentity::unknown();
    }
    match conn.peer_certificates() {
        Some(chain) if !chain.is_empty() => PeerIdentity::from_chain(chain),
        _ => PeerIdentity::unknown(),
    }
}

/// Resolves the identity string of a DER leaf certificate.
///
/// Returns [`UNKNOWN_IDENTITY`] if the bytes do not parse or carry no usable name.
pub fn resolve_id(leaf_der: &[u8]) -> String {
    resolve_leaf(leaf_der).unwrap_or_else(|| UNKNOWN_IDENTITY.to_owned())
}

// A leaf whose SAN extension cannot be read resolves to nothing rather than
// to its common name.
fn resolve_leaf(leaf_der: &[u8]) -> Option<String> {
    match first_uri_san_from_der(leaf_der) {
        Ok(Some(uri)) => Some(uri),
        Ok(None) => common_name_from_der(leaf_der),
        Err(_) => None,
    }
}

/// Trust domain of `id`, or `None` unless it is a well-formed SPIFFE ID.
pub(crate) fn trust_domain_of(id: &str) -> Option<String> {
    SpiffeId::new(id).ok().map(|id| id.trust_domain().to_string())
}

const CERT_PREFIX_LEN: usize = 32;

/// Certificate fingerprint used only as a cache key.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
struct CertFingerprint {
    hash: u64,
    len: usize,
    prefix: [u8; CERT_PREFIX_LEN],
}

fn cert_fingerprint(cert: &[u8]) -> CertFingerprint {
    let mut hasher = DefaultHasher::new();
    cert.hash(&mut hasher);

    let mut prefix = [0u8; CERT_PREFIX_LEN];
    prefix.iter_mut().zip(cert).for_each(|(d, &s)| *d = s);

    CertFingerprint {
        hash: hasher.finish(),
        len: cert.len(),
        prefix,
    }
}

/// Memoizes leaf resolution by certificate fingerprint, evicting the least
/// recently used entry when full.
pub(crate) struct ResolveCache {
    inner: Mutex<Lru>,
}

struct Lru {
    entries: HashMap<CertFingerprint, Arc<str>>,
    order: VecDeque<CertFingerprint>,
    capacity: usize,
}

impl Lru {
    fn touch(&mut self, key: CertFingerprint) {
        if let Some(pos) = self.order.iter().position(|k| *k == key) {
            self.order.remove(pos);
        }
        self.order.push_back(key);
    }
}

impl std::fmt::Debug for ResolveCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self
            .inner
            .lock()
            .map(|g| g.entries.len())
            .unwrap_or_default();
        f.debug_struct("ResolveCache").field("len", &len).finish()
    }
}

impl ResolveCache {
    pub(crate) const CAPACITY: usize = 64;

    pub(crate) fn new() -> Self {
        Self::with_capacity(Self::CAPACITY)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Lru {
                entries: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
                capacity,
            }),
        }
    }

    /// Resolves `chain`, consulting the cache for its leaf.
    pub(crate) fn resolve(&self, chain: &[CertificateDer<'_>]) -> PeerIdentity {
        let Some(leaf) = chain.first() else {
            return PeerIdentity::unknown();
        };
        let key = cert_fingerprint(leaf.as_ref());

        // A poisoned cache only holds resolved strings; keep using it.
        let mut lru = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(id) = lru.entries.get(&key).cloned() {
            lru.touch(key);
            return PeerIdentity::with_id(id, chain);
        }

        let id: Arc<str> = Arc::from(resolve_id(leaf.as_ref()));
        if lru.entries.len() >= lru.capacity {
            if let Some(oldest) = lru.order.pop_front() {
                lru.entries.remove(&oldest);
            }
        }
        lru.entries.insert(key, Arc::clone(&id));
        lru.order.push_back(key);

        PeerIdentity::with_id(id, chain)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }
}
