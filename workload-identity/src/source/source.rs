use super::builder::{IdentitySourceBuilder, Settings};
use super::error::SourceError;
use super::supervisor::{fetch_with_timeout, initial_fetch_with_retry, run_refresh_loop};
use crate::authority::{self, Authority, AuthorityGuard};
use crate::material::{IdentityCredential, Snapshot, TrustBundle};
use crate::prelude::{info, warn};
use arc_swap::ArcSwap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Receives rotation notifications from an [`IdentitySource`].
///
/// Each notification carries the version of the newly published snapshot.
/// The initial fetch is not notified. A slow receiver may skip intermediate
/// versions but always observes the latest one.
///
/// # Examples
///
/// ```no_run
/// # use workload_identity::IdentitySource;
/// # async fn example(source: IdentitySource) -> Result<(), Box<dyn std::error::Error>> {
/// let mut updates = source.on_rotation();
/// let version = updates.changed().await?;
/// println!("rotated to version {version}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct RotationUpdates {
    rx: watch::Receiver<u64>,
    cancel: CancellationToken,
}

impl RotationUpdates {
    /// Waits for the next rotation and returns the new version.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] once the source is closed or dropped.
    pub async fn changed(&mut self) -> Result<u64, SourceError> {
        tokio::select! {
            biased;
            r = self.rx.changed() => r.map_err(|_| SourceError::Closed)?,
            () = self.cancel.cancelled() => return Err(SourceError::Closed),
        }
        Ok(*self.rx.borrow_and_update())
    }

    /// The latest published version, without waiting.
    pub fn last(&self) -> u64 {
        *self.rx.borrow()
    }

    /// Waits until the version satisfies `f`.
    ///
    /// Returns immediately if the current version already does.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] once the source is closed or dropped.
    pub async fn wait_for<F>(&mut self, mut f: F) -> Result<u64, SourceError>
    where
        F: FnMut(&u64) -> bool,
    {
        let current = self.last();
        if f(&current) {
            return Ok(current);
        }
        loop {
            let version = self.changed().await?;
            if f(&version) {
                return Ok(version);
            }
        }
    }
}

/// Live source of this workload's identity credential and trust bundle.
///
/// `IdentitySource` performs an initial fetch before it is returned from
/// [`IdentitySourceBuilder::build`] or [`IdentitySource::connect`], then keeps
/// the material fresh in a background task:
///
/// * a refresh is scheduled when the credential reaches its low-water mark,
/// * failed refreshes are retried with jittered exponential backoff,
/// * each new version is published atomically as a whole [`Snapshot`].
///
/// Reads are lock-free and never wait on the authority. If the authority goes
/// away, readers keep getting the last good snapshot until the credential
/// expires, after which [`IdentitySource::current_credential`] fails.
///
/// Clones share the same state. Dropping the last clone stops the background
/// task and releases the authority.
#[derive(Clone, Debug)]
pub struct IdentitySource {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    snapshot: ArcSwap<Snapshot>,
    authority: AuthorityGuard,
    settings: Settings,

    closed: AtomicBool,
    cancel: CancellationToken,
    // Single-flight guard around fetch + publish.
    refresh_lock: Mutex<()>,
    reschedule: Arc<Notify>,

    update_tx: watch::Sender<u64>,
    update_rx: watch::Receiver<u64>,

    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("version", &self.snapshot.load().version())
            .field("authority", self.authority.get())
            .field("settings", &self.settings)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl IdentitySource {
    /// Returns a builder around `authority`.
    pub fn builder<A: Authority>(authority: A) -> IdentitySourceBuilder {
        IdentitySourceBuilder::new(authority)
    }

    /// Connects to the authority at `address` with default settings.
    ///
    /// See [`crate::authority::from_address`] for the accepted forms.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::AuthorityUnreachable`] for an unusable address or
    /// an authority that does not answer in time, and
    /// [`SourceError::InvalidMaterial`] for unusable material.
    pub async fn connect(address: &str) -> Result<Self, SourceError> {
        let authority = authority::from_address(address)?;
        IdentitySourceBuilder::from_arc(authority).build().await
    }

    /// The current trust bundle.
    ///
    /// Never fails: the bundle stays usable after the credential expires so
    /// peers can still be validated.
    pub fn current_bundle(&self) -> Arc<TrustBundle> {
        Arc::clone(self.inner.snapshot.load().bundle())
    }

    /// The current credential.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::CredentialExpired`] if the newest credential is
    /// already past its `not_after`.
    pub fn current_credential(&self) -> Result<Arc<IdentityCredential>, SourceError> {
        let snapshot = self.inner.snapshot.load();
        let credential = snapshot.credential();
        if credential.is_expired_at(OffsetDateTime::now_utc()) {
            return Err(SourceError::CredentialExpired {
                not_after: credential.not_after(),
            });
        }
        Ok(Arc::clone(credential))
    }

    /// The current snapshot (bundle and credential of one version).
    ///
    /// Unlike [`IdentitySource::current_credential`] this does not check expiry.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.snapshot.load_full()
    }

    /// Version of the current snapshot.
    pub fn version(&self) -> u64 {
        self.inner.snapshot.load().version()
    }

    /// Returns a handle that is notified on every rotation.
    pub fn on_rotation(&self) -> RotationUpdates {
        RotationUpdates {
            rx: self.inner.update_rx.clone(),
            cancel: self.inner.cancel.clone(),
        }
    }

    /// Fetches from the authority now, outside the regular schedule.
    ///
    /// Concurrent calls (and the background task) share a single fetch at a
    /// time. Returns the version current after the fetch; this equals the
    /// previous version if the authority returned unchanged material.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Closed`] after [`IdentitySource::close`], and the
    /// fetch or validation error otherwise. A failed refresh leaves the current
    /// snapshot in place.
    pub async fn refresh(&self) -> Result<u64, SourceError> {
        let before = self.version();
        let version = self.inner.refresh_once().await?;
        if version != before {
            self.inner.reschedule.notify_one();
        }
        Ok(version)
    }

    /// `true` if the source is open and holds an unexpired credential.
    ///
    /// This is a best-effort check; the answer may change right after it is
    /// returned.
    pub fn is_healthy(&self) -> bool {
        !self.is_closed() && self.current_credential().is_ok()
    }

    /// `true` once [`IdentitySource::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stops background refresh, waits for the task and releases the authority.
    ///
    /// Already-obtained snapshots stay valid, and reads keep returning the
    /// last snapshot. Idempotent.
    pub async fn close(&self) {
        if !self.begin_close() {
            return;
        }

        if let Some(handle) = self.inner.supervisor.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Error joining refresh supervisor during close: error={}", e);
            }
        }
        self.inner.authority.release();
        info!("Identity source closed");
    }

    /// Like [`IdentitySource::close`], but aborts the task after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::ShutdownTimeout`] if the task had to be aborted.
    pub async fn close_with_timeout(&self, timeout: Duration) -> Result<(), SourceError> {
        if !self.begin_close() {
            return Ok(());
        }

        let handle = self.inner.supervisor.lock().await.take();
        let result = match handle {
            None => Ok(()),
            Some(mut handle) => match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => {
                    warn!("Error joining refresh supervisor during close: error={}", e);
                    Ok(())
                }
                Err(_) => {
                    warn!("Close timeout exceeded; aborting refresh supervisor");
                    handle.abort();
                    let _ = handle.await;
                    Err(SourceError::ShutdownTimeout(timeout))
                }
            },
        };

        self.inner.authority.release();
        result
    }

    /// Closes using the timeout configured on the builder, or waits
    /// indefinitely if none was set.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::ShutdownTimeout`] if the configured timeout is exceeded.
    pub async fn close_configured(&self) -> Result<(), SourceError> {
        if let Some(timeout) = self.inner.settings.shutdown_timeout {
            self.close_with_timeout(timeout).await
        } else {
            self.close().await;
            Ok(())
        }
    }

    fn begin_close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.cancel.cancel();
        true
    }

    pub(super) async fn build_with(
        authority: Arc<dyn Authority>,
        settings: Settings,
    ) -> Result<Self, SourceError> {
        let guard = AuthorityGuard::new(authority);
        let cancel = CancellationToken::new();

        // On failure the guard is dropped here, which closes the authority.
        let initial = initial_fetch_with_retry(guard.get().as_ref(), &settings, &cancel).await?;
        let version = initial.version();
        info!(
            "Initial identity fetched: version={}, not_after={}",
            version,
            initial.credential().not_after()
        );

        let (update_tx, update_rx) = watch::channel(version);
        let reschedule = Arc::new(Notify::new());

        let inner = Arc::new(Inner {
            snapshot: ArcSwap::from_pointee(initial),
            authority: guard,
            settings,
            closed: AtomicBool::new(false),
            cancel: cancel.clone(),
            refresh_lock: Mutex::new(()),
            reschedule: Arc::clone(&reschedule),
            update_tx,
            update_rx,
            supervisor: Mutex::new(None),
        });

        let task = tokio::spawn(run_refresh_loop(Arc::downgrade(&inner), cancel, reschedule));
        *inner.supervisor.lock().await = Some(task);

        Ok(IdentitySource { inner })
    }
}

impl Inner {
    pub(crate) fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn next_refresh_delay(&self) -> Duration {
        let snapshot = self.snapshot.load();
        self.settings
            .refresh
            .delay_until_refresh(snapshot.credential(), OffsetDateTime::now_utc())
    }

    /// Fetches, validates and publishes one snapshot.
    ///
    /// Unchanged material is not republished and does not bump the version.
    pub(crate) async fn refresh_once(&self) -> Result<u64, SourceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SourceError::Closed);
        }
        let _guard = self.refresh_lock.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(SourceError::Closed);
        }

        let material =
            fetch_with_timeout(self.authority.get().as_ref(), self.settings.fetch_timeout).await?;

        let current = self.snapshot.load_full();
        if current.same_material(&material) {
            return Ok(current.version());
        }

        let next = Snapshot::from_material(current.version() + 1, &material, OffsetDateTime::now_utc())?;
        let version = next.version();
        let not_after = next.credential().not_after();

        self.snapshot.store(Arc::new(next));
        self.update_tx.send_replace(version);
        info!("Identity rotated: version={}, not_after={}", version, not_after);

        Ok(version)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Do not block in Drop; the task exits on its next wake-up.
        self.cancel.cancel();
    }
}
