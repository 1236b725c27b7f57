//! The retry controller: how many times to retry a failed request, how long
//! to wait between attempts, and which errors are worth retrying at all.
//!
//! Grounded on `dropbox-toolbox`'s `UploadOpts` (which carries a retry count
//! and backoff knobs alongside chunk size) and on `dropbox-sdk-rust`'s own
//! token-refresh-and-retry-once loop in `client_helpers.rs`, generalized from
//! "retry once after refreshing a token" to "retry up to N times against an
//! explicit delay schedule."

use std::time::Duration;

use crate::error::Error;

/// An ordered list of delays to wait between retry attempts. `delays[0]` is
/// the wait before the first retry, `delays[1]` before the second, and so
/// on; once exhausted, no further retries are attempted regardless of the
/// error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDelays(Vec<Duration>);

impl RetryDelays {
    /// An explicit, arbitrary delay schedule.
    pub fn new(delays: Vec<Duration>) -> Self {
        Self(delays)
    }

    /// No retries at all: every failure is terminal.
    pub fn none() -> Self {
        Self(Vec::new())
    }

    /// Retry `count` times, waiting `delay` between each attempt.
    pub fn fixed(delay: Duration, count: usize) -> Self {
        Self(std::iter::repeat(delay).take(count).collect())
    }

    /// Retry `count` times with exponential backoff, starting at `initial`
    /// and doubling each time up to `max`.
    pub fn exponential(initial: Duration, max: Duration, count: usize) -> Self {
        let mut delays = Vec::with_capacity(count);
        let mut current = initial;
        for _ in 0..count {
            delays.push(current);
            current = (current * 2).min(max);
        }
        Self(delays)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The delay to wait before the `attempt`-th retry (0-indexed), or
    /// `None` if the schedule is exhausted.
    pub fn get(&self, attempt: usize) -> Option<Duration> {
        self.0.get(attempt).copied()
    }
}

impl Default for RetryDelays {
    /// Three retries with a short fixed delay: a reasonable default for
    /// transient network blips without a caller having to think about it.
    fn default() -> Self {
        Self::fixed(Duration::from_millis(500), 3)
    }
}

/// Decides whether a given error is worth retrying at all, independent of
/// whether the schedule still has attempts left. Lets callers override the
/// default 4xx/5xx classification in [`crate::error::Error::default_should_retry`]
/// without having to reimplement the schedule bookkeeping.
///
/// Takes the attempt count, matching spec.md §6's
/// `onShouldRetry(err, attempt, options) -> bool` host callback.
pub trait ShouldRetry: Send + Sync {
    fn should_retry(&self, error: &Error, attempt: usize, network_online: bool) -> bool;
}

/// The default predicate: defers entirely to
/// [`crate::error::Error::default_should_retry`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRetryPredicate;

impl ShouldRetry for DefaultRetryPredicate {
    fn should_retry(&self, error: &Error, _attempt: usize, network_online: bool) -> bool {
        error.default_should_retry(network_online)
    }
}

/// Adapts a host-supplied `onShouldRetry` closure (spec.md §6) to
/// [`ShouldRetry`], so [`RetryController`] doesn't need to special-case
/// whether its predicate came from a callback or a built-in default.
pub struct CallbackPredicate(pub std::sync::Arc<dyn Fn(&Error, usize, bool) -> bool + Send + Sync>);

impl ShouldRetry for CallbackPredicate {
    fn should_retry(&self, error: &Error, attempt: usize, network_online: bool) -> bool {
        (self.0)(error, attempt, network_online)
    }
}

impl ShouldRetry for Box<dyn ShouldRetry> {
    fn should_retry(&self, error: &Error, attempt: usize, network_online: bool) -> bool {
        (**self).should_retry(error, attempt, network_online)
    }
}

/// Combines a delay schedule with a retry predicate to decide, given a
/// failure and how many retries have already been attempted, whether to
/// retry and if so after how long.
pub struct RetryController<P = DefaultRetryPredicate> {
    delays: RetryDelays,
    predicate: P,
}

impl RetryController<DefaultRetryPredicate> {
    pub fn new(delays: RetryDelays) -> Self {
        Self { delays, predicate: DefaultRetryPredicate }
    }
}

impl<P: ShouldRetry> RetryController<P> {
    pub fn with_predicate(delays: RetryDelays, predicate: P) -> Self {
        Self { delays, predicate }
    }

    /// Given the error just observed, how many retries have already been
    /// attempted since the last recorded progress, and whether the network
    /// is currently reachable, decide whether to retry. Returns the delay to
    /// wait before retrying, or `None` if the attempt should be given up as
    /// terminal.
    pub fn decide(&self, error: &Error, attempts_since_progress: usize, network_online: bool) -> Option<Duration> {
        if !self.predicate.should_retry(error, attempts_since_progress, network_online) {
            return None;
        }
        self.delays.get(attempts_since_progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HttpExchange;

    fn server_error() -> Error {
        Error::Http {
            exchange: HttpExchange::new("PATCH", "https://example.test/files/a").with_status(500),
            body: String::new(),
        }
    }

    #[test]
    fn exponential_delays_double_up_to_max() {
        let delays = RetryDelays::exponential(Duration::from_millis(100), Duration::from_millis(350), 5);
        assert_eq!(delays.get(0), Some(Duration::from_millis(100)));
        assert_eq!(delays.get(1), Some(Duration::from_millis(200)));
        assert_eq!(delays.get(2), Some(Duration::from_millis(350)));
        assert_eq!(delays.get(3), Some(Duration::from_millis(350)));
        assert_eq!(delays.get(5), None);
    }

    #[test]
    fn controller_stops_once_schedule_is_exhausted() {
        let controller = RetryController::new(RetryDelays::fixed(Duration::from_millis(10), 2));
        assert!(controller.decide(&server_error(), 0, true).is_some());
        assert!(controller.decide(&server_error(), 1, true).is_some());
        assert!(controller.decide(&server_error(), 2, true).is_none());
    }

    #[test]
    fn controller_defers_to_predicate_before_consulting_schedule() {
        let controller = RetryController::new(RetryDelays::fixed(Duration::from_millis(10), 5));
        let e = Error::Configuration("bad".to_owned());
        assert!(controller.decide(&e, 0, true).is_none());
    }

    struct AlwaysRetry;
    impl ShouldRetry for AlwaysRetry {
        fn should_retry(&self, _error: &Error, _attempt: usize, _network_online: bool) -> bool {
            true
        }
    }

    #[test]
    fn custom_predicate_overrides_default_classification() {
        let controller = RetryController::with_predicate(RetryDelays::fixed(Duration::from_millis(10), 1), AlwaysRetry);
        let e = Error::Configuration("bad".to_owned());
        assert!(controller.decide(&e, 0, true).is_some());
    }

    #[test]
    fn callback_predicate_adapts_a_host_supplied_closure() {
        let predicate = CallbackPredicate(std::sync::Arc::new(|_: &Error, attempt: usize, _online: bool| attempt < 2));
        let controller = RetryController::with_predicate(RetryDelays::fixed(Duration::from_millis(10), 5), predicate);
        assert!(controller.decide(&server_error(), 0, true).is_some());
        assert!(controller.decide(&server_error(), 1, true).is_some());
        assert!(controller.decide(&server_error(), 2, true).is_none());
    }
}
