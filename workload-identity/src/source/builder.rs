use super::error::SourceError;
use super::source::IdentitySource;
use crate::authority::Authority;
use crate::material::IdentityCredential;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Lower bound applied to `min_backoff` and `min_refresh_interval`.
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Retry backoff between failed fetches.
///
/// Delays double from `min_backoff` up to `max_backoff`, with up to 10% jitter.
/// If `min_backoff > max_backoff`, they are swapped. Neither bound goes below
/// [`MIN_RETRY_DELAY`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay after the first failure.
    pub min_backoff: Duration,
    /// Upper bound on the delay.
    pub max_backoff: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl ReconnectConfig {
    pub(crate) fn normalize(mut self) -> Self {
        if self.min_backoff > self.max_backoff {
            std::mem::swap(&mut self.min_backoff, &mut self.max_backoff);
        }
        self.min_backoff = self.min_backoff.max(MIN_RETRY_DELAY);
        self.max_backoff = self.max_backoff.max(self.min_backoff);
        self
    }
}

/// When to refresh a credential that is still valid.
///
/// The next refresh is scheduled when the remaining lifetime of the current
/// credential drops to `low_water_mark` of its total lifetime, clamped into
/// `[min_refresh_interval, max_refresh_interval]`. The interval bounds are
/// floored at [`MIN_RETRY_DELAY`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RefreshConfig {
    /// Fraction of the lifetime that may remain before refreshing, in `(0, 1)`.
    pub low_water_mark: f64,
    /// Shortest delay between refreshes. Also the poll interval for an
    /// authority that keeps returning the same material near expiry.
    pub min_refresh_interval: Duration,
    /// Longest delay between refreshes, regardless of lifetime.
    pub max_refresh_interval: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            low_water_mark: 0.5,
            min_refresh_interval: Duration::from_secs(1),
            max_refresh_interval: Duration::from_secs(300),
        }
    }
}

impl RefreshConfig {
    pub(crate) fn normalize(mut self) -> Self {
        if !self.low_water_mark.is_finite() || self.low_water_mark <= 0.0 || self.low_water_mark >= 1.0
        {
            self.low_water_mark = RefreshConfig::default().low_water_mark;
        }
        if self.min_refresh_interval > self.max_refresh_interval {
            std::mem::swap(&mut self.min_refresh_interval, &mut self.max_refresh_interval);
        }
        self.min_refresh_interval = self.min_refresh_interval.max(MIN_RETRY_DELAY);
        self.max_refresh_interval = self.max_refresh_interval.max(self.min_refresh_interval);
        self
    }

    /// Time to wait from `now` before refreshing `credential`.
    pub fn delay_until_refresh(&self, credential: &IdentityCredential, now: OffsetDateTime) -> Duration {
        let refresh_at = credential.not_after() - credential.lifetime() * self.low_water_mark;
        let wait = Duration::try_from(refresh_at - now).unwrap_or(Duration::ZERO);
        wait.clamp(self.min_refresh_interval, self.max_refresh_interval)
    }
}

/// Builder for [`IdentitySource`].
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use workload_identity::{DirectoryAuthority, IdentitySource};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let source = IdentitySource::builder(DirectoryAuthority::new("/var/run/identity"))
///     .initial_fetch_timeout(Duration::from_secs(5))
///     .refresh_low_water_mark(0.3)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct IdentitySourceBuilder {
    authority: Arc<dyn Authority>,
    initial_fetch_timeout: Duration,
    fetch_timeout: Duration,
    reconnect: ReconnectConfig,
    refresh: RefreshConfig,
    shutdown_timeout: Option<Duration>,
}

impl Debug for IdentitySourceBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentitySourceBuilder")
            .field("authority", &self.authority)
            .field("initial_fetch_timeout", &self.initial_fetch_timeout)
            .field("fetch_timeout", &self.fetch_timeout)
            .field("reconnect", &self.reconnect)
            .field("refresh", &self.refresh)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

impl IdentitySourceBuilder {
    /// Creates a builder around an authority.
    pub fn new<A: Authority>(authority: A) -> Self {
        Self::from_arc(Arc::new(authority))
    }

    /// Creates a builder around a shared authority.
    pub fn from_arc(authority: Arc<dyn Authority>) -> Self {
        Self {
            authority,
            initial_fetch_timeout: Duration::from_secs(15),
            fetch_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
            refresh: RefreshConfig::default(),
            shutdown_timeout: Some(Duration::from_secs(30)),
        }
    }

    /// Total time allowed for the initial fetch, retries included.
    #[must_use]
    pub const fn initial_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.initial_fetch_timeout = timeout;
        self
    }

    /// Time allowed for a single fetch from the authority.
    #[must_use]
    pub const fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Sets the retry backoff range.
    #[must_use]
    pub const fn reconnect_backoff(mut self, min_backoff: Duration, max_backoff: Duration) -> Self {
        self.reconnect = ReconnectConfig {
            min_backoff,
            max_backoff,
        };
        self
    }

    /// Replaces the whole refresh policy.
    #[must_use]
    pub const fn refresh(mut self, refresh: RefreshConfig) -> Self {
        self.refresh = refresh;
        self
    }

    /// Sets the remaining-lifetime fraction that triggers a refresh.
    ///
    /// Values outside `(0, 1)` fall back to `0.5`.
    #[must_use]
    pub const fn refresh_low_water_mark(mut self, low_water_mark: f64) -> Self {
        self.refresh.low_water_mark = low_water_mark;
        self
    }

    /// Bounds the delay between scheduled refreshes.
    #[must_use]
    pub const fn refresh_interval_bounds(mut self, min: Duration, max: Duration) -> Self {
        self.refresh.min_refresh_interval = min;
        self.refresh.max_refresh_interval = max;
        self
    }

    /// Sets how long [`IdentitySource::close_configured`] waits for the
    /// background task. `None` waits indefinitely.
    #[must_use]
    pub const fn shutdown_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Performs the initial fetch and starts background refresh.
    ///
    /// # Errors
    ///
    /// * [`SourceError::AuthorityUnreachable`] if no material could be fetched
    ///   within the initial fetch timeout.
    /// * [`SourceError::InvalidMaterial`] if the authority answered with
    ///   material that cannot be used.
    pub async fn build(self) -> Result<IdentitySource, SourceError> {
        let settings = Settings {
            initial_fetch_timeout: self.initial_fetch_timeout,
            fetch_timeout: self.fetch_timeout,
            reconnect: self.reconnect.normalize(),
            refresh: self.refresh.normalize(),
            shutdown_timeout: self.shutdown_timeout,
        };
        IdentitySource::build_with(self.authority, settings).await
    }
}

/// Normalized builder settings.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Settings {
    pub(crate) initial_fetch_timeout: Duration,
    pub(crate) fetch_timeout: Duration,
    pub(crate) reconnect: ReconnectConfig,
    pub(crate) refresh: RefreshConfig,
    pub(crate) shutdown_timeout: Option<Duration>,
}
