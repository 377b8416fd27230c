use crate::authority::{Authority, AuthorityError, AuthorityMaterial, AuthorityFuture};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// An in-process authority whose material is set by the caller.
///
/// Useful for tests and for embedding material obtained by other means.
/// Clones share state, so one handle can be given to the source while another
/// is kept to [`rotate`](Self::rotate) material or simulate an outage.
#[derive(Debug, Clone)]
pub struct StaticAuthority {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    material: Mutex<Option<AuthorityMaterial>>,
    unavailable: AtomicBool,
    fetches: AtomicU64,
    closes: AtomicU64,
}

impl StaticAuthority {
    /// Creates an authority that serves `material`.
    pub fn new(material: AuthorityMaterial) -> Self {
        Self::with_material(Some(material))
    }

    /// Creates an authority with no material; every fetch fails.
    pub fn unavailable() -> Self {
        Self::with_material(None)
    }

    fn with_material(material: Option<AuthorityMaterial>) -> Self {
        Self {
            inner: Arc::new(Inner {
                material: Mutex::new(material),
                unavailable: AtomicBool::new(false),
                fetches: AtomicU64::new(0),
                closes: AtomicU64::new(0),
            }),
        }
    }

    /// Replaces the material returned by subsequent fetches.
    pub fn rotate(&self, material: AuthorityMaterial) {
        let mut guard = self
            .inner
            .material
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = Some(material);
    }

    /// Makes subsequent fetches fail with [`AuthorityError::Unavailable`]
    /// (or succeed again with `false`).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::Release);
    }

    /// Number of fetches attempted so far.
    pub fn fetch_count(&self) -> u64 {
        self.inner.fetches.load(Ordering::Acquire)
    }

    /// `true` once the owning source has released this authority.
    pub fn is_closed(&self) -> bool {
        self.close_count() > 0
    }

    /// Number of times [`Authority::close`] was called.
    pub fn close_count(&self) -> u64 {
        self.inner.closes.load(Ordering::Acquire)
    }

    fn current(&self) -> Result<AuthorityMaterial, AuthorityError> {
        self.inner.fetches.fetch_add(1, Ordering::AcqRel);

        if self.is_closed() {
            return Err(AuthorityError::Closed);
        }
        if self.inner.unavailable.load(Ordering::Acquire) {
            return Err(AuthorityError::Unavailable("static authority offline".into()));
        }

        self.inner
            .material
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| AuthorityError::Unavailable("no material configured".into()))
    }
}

impl Authority for StaticAuthority {
    fn fetch(&self) -> AuthorityFuture<'_> {
        let result = self.current();
        Box::pin(async move { result })
    }

    fn close(&self) {
        self.inner.closes.fetch_add(1, Ordering::AcqRel);
    }
}
