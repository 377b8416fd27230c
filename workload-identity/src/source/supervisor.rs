//! Initial fetch and the background refresh loop.

use super::builder::Settings;
use super::error::SourceError;
use super::source::Inner;
use crate::authority::{Authority, AuthorityError, AuthorityMaterial};
use crate::material::Snapshot;
use crate::prelude::{debug, info, warn};
use std::sync::{Arc, Weak};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// Consecutive identical failures logged at WARN before dropping to DEBUG.
pub(crate) const MAX_CONSECUTIVE_SAME_ERROR: u32 = 3;

/// Failure categories for log suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrorKey {
    /// The authority did not answer.
    Unreachable,
    /// The authority answered with unusable material.
    Rejected,
}

impl ErrorKey {
    pub(crate) fn of(err: &SourceError) -> Self {
        if err.is_transient() {
            ErrorKey::Unreachable
        } else {
            ErrorKey::Rejected
        }
    }
}

/// Counts consecutive failures of the same kind.
///
/// The first [`MAX_CONSECUTIVE_SAME_ERROR`] occurrences of a kind are reported
/// as warnings; repeats after that are reported at debug level until the kind
/// changes or the tracker is reset.
#[derive(Debug)]
pub(crate) struct ErrorTracker {
    last_error_kind: Option<ErrorKey>,
    consecutive_same_error: u32,
    max_consecutive: u32,
}

impl ErrorTracker {
    pub(crate) fn new(max_consecutive: u32) -> Self {
        Self {
            last_error_kind: None,
            consecutive_same_error: 0,
            max_consecutive,
        }
    }

    /// Records a failure and returns whether it should be logged at WARN.
    pub(crate) fn record_error(&mut self, error_kind: ErrorKey) -> bool {
        let should_warn = self.last_error_kind != Some(error_kind)
            || self.consecutive_same_error < self.max_consecutive;

        if self.last_error_kind == Some(error_kind) {
            self.consecutive_same_error += 1;
        } else {
            self.consecutive_same_error = 1;
            self.last_error_kind = Some(error_kind);
        }

        should_warn
    }

    pub(crate) fn reset(&mut self) {
        self.consecutive_same_error = 0;
        self.last_error_kind = None;
    }

    pub(crate) fn consecutive_count(&self) -> u32 {
        self.consecutive_same_error
    }
}

/// Sleeps for `dur`; returns `true` if cancelled first.
pub(crate) async fn sleep_or_cancel(token: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        () = token.cancelled() => true,
        () = sleep(dur) => false,
    }
}

/// Doubles `current` up to `max` and adds 0-10% jitter.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn next_backoff(current: Duration, max: Duration) -> Duration {
    let cur = current.as_millis().min(u128::from(u64::MAX)) as u64;
    let max = max.as_millis().min(u128::from(u64::MAX)) as u64;

    let base = (cur.saturating_mul(2)).min(max);
    if base == 0 {
        return Duration::from_millis(0);
    }

    let jitter = base / 10;
    let add = if jitter > 0 {
        fastrand::u64(0..=jitter)
    } else {
        0
    };

    Duration::from_millis((base.saturating_add(add)).min(max))
}

/// Fetches once from `authority`, bounded by `timeout`.
pub(crate) async fn fetch_with_timeout(
    authority: &dyn Authority,
    timeout: Duration,
) -> Result<AuthorityMaterial, AuthorityError> {
    match tokio::time::timeout(timeout, authority.fetch()).await {
        Ok(result) => result,
        Err(_) => Err(AuthorityError::Timeout(timeout)),
    }
}

/// Fetches and validates the first snapshot, retrying with backoff until
/// `settings.initial_fetch_timeout` elapses.
///
/// Malformed material fails immediately; only unreachable authorities are
/// retried.
pub(crate) async fn initial_fetch_with_retry(
    authority: &dyn Authority,
    settings: &Settings,
    cancel: &CancellationToken,
) -> Result<Snapshot, SourceError> {
    let deadline = Instant::now() + settings.initial_fetch_timeout;
    let mut backoff = settings.reconnect.min_backoff;
    let mut error_tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt_timeout = settings.fetch_timeout.min(remaining);

        let err = match fetch_with_timeout(authority, attempt_timeout).await {
            Ok(material) => {
                return Snapshot::from_material(1, &material, OffsetDateTime::now_utc())
                    .map_err(SourceError::from);
            }
            Err(e) => SourceError::from(e),
        };

        if !err.is_transient() {
            return Err(err);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            warn!(
                "Initial fetch gave up after {:?}: error={}",
                settings.initial_fetch_timeout, err
            );
            return Err(err);
        }

        if error_tracker.record_error(ErrorKey::of(&err)) {
            warn!(
                "Initial fetch failed; retrying: error={}, backoff_ms={}",
                err,
                backoff.as_millis()
            );
        } else {
            debug!(
                "Initial fetch failed (repeated); retrying: error={}, backoff_ms={}, consecutive_failures={}",
                err,
                backoff.as_millis(),
                error_tracker.consecutive_count()
            );
        }

        if sleep_or_cancel(cancel, backoff.min(remaining)).await {
            return Err(SourceError::Closed);
        }
        backoff = next_backoff(backoff, settings.reconnect.max_backoff);
    }
}

/// Keeps the source fresh until cancelled or until the last handle is dropped.
///
/// Holds only a weak reference between iterations so an abandoned source can
/// be dropped while the loop is asleep.
pub(crate) async fn run_refresh_loop(
    weak: Weak<Inner>,
    cancel: CancellationToken,
    reschedule: Arc<Notify>,
) {
    let supervisor_id = fastrand::u64(..);
    info!("Starting refresh supervisor: id={}", supervisor_id);

    let mut error_tracker = ErrorTracker::new(MAX_CONSECUTIVE_SAME_ERROR);
    let mut backoff: Option<Duration> = None;

    loop {
        let (delay, reconnect) = {
            let Some(inner) = weak.upgrade() else {
                debug!("Identity source dropped; stopping refresh supervisor");
                return;
            };
            let delay = backoff.unwrap_or_else(|| inner.next_refresh_delay());
            (delay, inner.settings().reconnect)
        };
        debug!("Next refresh in {}ms", delay.as_millis());

        tokio::select! {
            () = cancel.cancelled() => {
                debug!("Cancellation signal received; stopping refresh supervisor");
                return;
            }
            () = reschedule.notified() => {
                // A manual refresh published new material; recompute the schedule.
                backoff = None;
                continue;
            }
            () = sleep(delay) => {}
        }

        let Some(inner) = weak.upgrade() else {
            return;
        };

        let result = tokio::select! {
            () = cancel.cancelled() => return,
            r = inner.refresh_once() => r,
        };

        match result {
            Ok(version) => {
                if error_tracker.consecutive_count() > 0 {
                    info!(
                        "Refresh recovered after {} consecutive failures",
                        error_tracker.consecutive_count()
                    );
                }
                error_tracker.reset();
                backoff = None;
                debug!("Refresh completed: version={}", version);
            }
            Err(SourceError::Closed) => return,
            Err(e) => {
                let next = backoff.map_or(reconnect.min_backoff, |b| {
                    next_backoff(b, reconnect.max_backoff)
                });
                if error_tracker.record_error(ErrorKey::of(&e)) {
                    warn!(
                        "Refresh failed; serving last-known-good material: error={}, backoff_ms={}",
                        e,
                        next.as_millis()
                    );
                } else {
                    debug!(
                        "Refresh failed (repeated): error={}, backoff_ms={}, consecutive_failures={}",
                        e,
                        next.as_millis(),
                        error_tracker.consecutive_count()
                    );
                }
                backoff = Some(next);
            }
        }
    }
}
