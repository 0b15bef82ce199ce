//! Multi-window sliding rate throttler.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::limit::ThrottleLimit;
use crate::error::{Result, SluiceError};

/// Outcome of a single non-blocking admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The execution was admitted and recorded.
    Admitted,
    /// The execution was not admitted; a new one fits after this delay.
    Delayed(Duration),
}

/// Circular log of admitted execution timestamps.
///
/// Slots that were never written hold `None` and never restrict admission.
#[derive(Debug)]
struct ExecutionLog {
    slots: Vec<Option<Instant>>,
    write_position: usize,
}

impl ExecutionLog {
    fn new(capacity: usize) -> Result<Self> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity).map_err(|e| {
            SluiceError::InvalidArgument(format!(
                "cannot allocate execution log of {} slots: {}",
                capacity, e
            ))
        })?;
        slots.resize(capacity, None);

        Ok(Self {
            slots,
            write_position: 0,
        })
    }

    /// Latest "next available" instant across all limited entries.
    ///
    /// Each limit with count `k` looks back `k` slots from the write position.
    fn next_available(&self, limits: &[ThrottleLimit]) -> Option<Instant> {
        let len = self.slots.len();

        limits
            .iter()
            .filter(|limit| !limit.is_unlimited())
            .filter_map(|limit| {
                let index = (self.write_position + len - limit.max_count()) % len;
                self.slots[index].map(|stamp| {
                    stamp
                        .checked_add(limit.window())
                        .unwrap_or_else(far_future)
                })
            })
            .max()
    }

    /// Store `now` at the write position and return the slot it filled.
    fn record(&mut self, now: Instant) -> usize {
        let position = self.write_position;
        self.slots[position] = Some(now);
        self.write_position = (position + 1) % self.slots.len();
        position
    }
}

fn far_future() -> Instant {
    // Roughly 30 years, matching how tokio itself bounds "never".
    Instant::now() + Duration::from_secs(86400 * 365 * 30)
}

/// Admission gate enforcing one or more `(window, max_count)` limits at once.
///
/// All limits share a single circular buffer sized to the largest
/// `max_count`. Callers are suspended until admitting one more execution
/// would not exceed any limit; the tightest limit governs.
///
/// The throttler is thread-safe and can be shared across tasks with `Arc`.
#[derive(Debug)]
pub struct RateThrottler {
    /// Configured limits, in construction order
    limits: Vec<ThrottleLimit>,
    /// Length of the shared execution log
    capacity: usize,
    /// Execution log, absent when every limit is unlimited
    log: Option<Mutex<ExecutionLog>>,
}

impl RateThrottler {
    /// Create a new throttler from a set of limits.
    ///
    /// Fails with [`SluiceError::InvalidArgument`] if no limits are given.
    pub fn new<I>(limits: I) -> Result<Self>
    where
        I: IntoIterator<Item = ThrottleLimit>,
    {
        let limits: Vec<ThrottleLimit> = limits.into_iter().collect();
        if limits.is_empty() {
            return Err(SluiceError::InvalidArgument(
                "at least one limit is required".to_string(),
            ));
        }

        let capacity = limits
            .iter()
            .map(ThrottleLimit::max_count)
            .max()
            .unwrap_or(0);
        let log = if capacity > 0 {
            Some(Mutex::new(ExecutionLog::new(capacity)?))
        } else {
            None
        };

        debug!(
            limits = limits.len(),
            capacity = capacity,
            "Creating rate throttler"
        );

        Ok(Self {
            limits,
            capacity,
            log,
        })
    }

    /// Create a throttler from `(window, max_count)` pairs.
    ///
    /// Fails if the list is empty or any count is negative or too large.
    pub fn from_pairs(pairs: &[(Duration, i64)]) -> Result<Self> {
        let limits = pairs
            .iter()
            .map(|&(window, max_count)| ThrottleLimit::new(window, max_count))
            .collect::<Result<Vec<_>>>()?;
        Self::new(limits)
    }

    /// Wait until an execution may proceed, then record it.
    ///
    /// Returns immediately when every limit is unlimited. Otherwise the caller
    /// sleeps until the governing limit frees up and re-checks. If `cancel`
    /// fires while sleeping, fails with [`SluiceError::Cancelled`] and records
    /// nothing.
    pub async fn wait_for_permission(&self, cancel: &CancellationToken) -> Result<()> {
        let Some(log) = &self.log else {
            return Ok(());
        };

        loop {
            let next_available = match Self::check_and_record(&self.limits, log) {
                Ok(()) => return Ok(()),
                Err(next_available) => next_available,
            };

            trace!(
                delay_ms = u64::try_from(
                    next_available
                        .saturating_duration_since(Instant::now())
                        .as_millis()
                )
                .unwrap_or(u64::MAX),
                "Throttled, waiting for permission"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Wait for permission cancelled");
                    return Err(SluiceError::Cancelled);
                }
                _ = tokio::time::sleep_until(next_available) => {}
            }
        }
    }

    /// Attempt a single admission without waiting.
    pub fn try_acquire(&self) -> Admission {
        let Some(log) = &self.log else {
            return Admission::Admitted;
        };

        match Self::check_and_record(&self.limits, log) {
            Ok(()) => Admission::Admitted,
            Err(next_available) => {
                Admission::Delayed(next_available.saturating_duration_since(Instant::now()))
            }
        }
    }

    /// Time until an execution would be admitted, without recording one.
    pub fn time_until_available(&self) -> Duration {
        let Some(log) = &self.log else {
            return Duration::ZERO;
        };

        let log = log.lock();
        match log.next_available(&self.limits) {
            Some(next_available) => next_available.saturating_duration_since(Instant::now()),
            None => Duration::ZERO,
        }
    }

    /// Wait for permission, then run `operation` to completion.
    ///
    /// On cancellation the operation is dropped without being polled.
    pub async fn execute<F>(&self, cancel: &CancellationToken, operation: F) -> Result<F::Output>
    where
        F: Future,
    {
        self.wait_for_permission(cancel).await?;
        Ok(operation.await)
    }

    /// Get the configured limits.
    pub fn limits(&self) -> &[ThrottleLimit] {
        &self.limits
    }

    /// Get the length of the shared execution log.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether every configured limit is unlimited.
    pub fn is_unlimited(&self) -> bool {
        self.log.is_none()
    }

    /// The check-and-record step. The lock is held only for its duration.
    fn check_and_record(
        limits: &[ThrottleLimit],
        log: &Mutex<ExecutionLog>,
    ) -> std::result::Result<(), Instant> {
        let mut log = log.lock();
        let now = Instant::now();

        match log.next_available(limits) {
            Some(next_available) if now < next_available => Err(next_available),
            _ => {
                let position = log.record(now);
                trace!(position = position, "Execution admitted");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    #[test]
    fn test_no_limits_rejected() {
        let err = RateThrottler::new(Vec::new()).unwrap_err();
        assert!(matches!(err, SluiceError::InvalidArgument(_)));
    }

    #[test]
    fn test_negative_count_rejected() {
        let err = RateThrottler::from_pairs(&[(ms(100), 2), (ms(1000), -3)]).unwrap_err();
        assert!(matches!(err, SluiceError::InvalidArgument(_)));
    }

    #[test]
    fn test_huge_max_count_rejected() {
        let err = RateThrottler::from_pairs(&[(ms(1000), i64::MAX)]).unwrap_err();
        assert!(matches!(err, SluiceError::InvalidArgument(_)));

        let err = RateThrottler::from_pairs(&[(ms(1000), 3), (ms(1000), 99_999_999_999)])
            .unwrap_err();
        assert!(matches!(err, SluiceError::InvalidArgument(_)));
    }

    #[test]
    fn test_record_returns_filled_slot() {
        let mut log = ExecutionLog::new(2).unwrap();
        let now = Instant::now();

        assert_eq!(log.record(now), 0);
        assert_eq!(log.record(now), 1);
        assert_eq!(log.record(now), 0);
        assert_eq!(log.write_position, 1);
    }

    #[test]
    fn test_capacity_is_max_count() {
        let throttler = RateThrottler::from_pairs(&[(ms(1000), 2), (ms(10_000), 5)]).unwrap();
        assert_eq!(throttler.capacity(), 5);
        assert_eq!(throttler.limits().len(), 2);
        assert!(!throttler.is_unlimited());
    }

    #[test]
    fn test_all_zero_counts_is_unlimited() {
        let throttler = RateThrottler::from_pairs(&[(ms(1000), 0), (ms(50), 0)]).unwrap();
        assert!(throttler.is_unlimited());
        assert_eq!(throttler.capacity(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_never_waits() {
        let throttler = RateThrottler::from_pairs(&[(ms(1000), 0)]).unwrap();
        let cancel = CancellationToken::new();
        let start = Instant::now();

        for _ in 0..1000 {
            throttler.wait_for_permission(&cancel).await.unwrap();
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(throttler.try_acquire(), Admission::Admitted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cold_start_admits_up_to_max_count() {
        let throttler = RateThrottler::from_pairs(&[(ms(1000), 3)]).unwrap();
        let cancel = CancellationToken::new();
        let start = Instant::now();

        for _ in 0..3 {
            throttler.wait_for_permission(&cancel).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        throttler.wait_for_permission(&cancel).await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= ms(1000), "admitted too early: {:?}", elapsed);
        assert!(elapsed < ms(1010), "admitted too late: {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_call_waits_for_window() {
        let throttler = RateThrottler::from_pairs(&[(ms(100), 1)]).unwrap();
        let cancel = CancellationToken::new();
        let start = Instant::now();

        throttler.wait_for_permission(&cancel).await.unwrap();
        tokio::time::advance(ms(10)).await;
        throttler.wait_for_permission(&cancel).await.unwrap();

        assert!(start.elapsed() >= ms(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_after_window_is_immediate() {
        let throttler = RateThrottler::from_pairs(&[(ms(100), 1)]).unwrap();
        let cancel = CancellationToken::new();

        throttler.wait_for_permission(&cancel).await.unwrap();
        tokio::time::advance(ms(150)).await;

        let before = Instant::now();
        throttler.wait_for_permission(&cancel).await.unwrap();
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_stays_pending_until_window_expires() {
        let throttler = RateThrottler::from_pairs(&[(ms(100), 1)]).unwrap();
        let cancel = CancellationToken::new();
        throttler.wait_for_permission(&cancel).await.unwrap();

        let mut wait = task::spawn(throttler.wait_for_permission(&cancel));
        assert_pending!(wait.poll());

        tokio::time::advance(ms(50)).await;
        assert_pending!(wait.poll());

        tokio::time::advance(ms(60)).await;
        assert_ready_ok!(wait.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tightest_limit_governs() {
        let throttler = RateThrottler::from_pairs(&[(ms(1000), 2), (ms(10_000), 5)]).unwrap();
        let cancel = CancellationToken::new();
        let start = Instant::now();
        let mut admitted_at = Vec::new();

        for _ in 0..6 {
            throttler.wait_for_permission(&cancel).await.unwrap();
            admitted_at.push(start.elapsed());
        }

        // Two per second until the five-per-ten-seconds limit takes over.
        let expected_secs = [0, 0, 1, 1, 2, 10];
        for (elapsed, secs) in admitted_at.iter().zip(expected_secs) {
            assert!(*elapsed >= Duration::from_secs(secs), "{:?}", admitted_at);
            assert!(*elapsed < Duration::from_secs(secs) + ms(10), "{:?}", admitted_at);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_records_nothing() {
        let throttler = RateThrottler::from_pairs(&[(ms(1000), 1)]).unwrap();
        let start = Instant::now();
        throttler
            .wait_for_permission(&CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ms(100)).await;
            canceller.cancel();
        });

        let err = throttler.wait_for_permission(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(start.elapsed() < ms(1000));

        // Still throttled against the first execution only.
        let remaining = throttler.time_until_available();
        assert!(remaining > ms(800) && remaining <= ms(900), "{:?}", remaining);

        throttler
            .wait_for_permission(&CancellationToken::new())
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= ms(1000) && elapsed < ms(1010), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_token_does_not_block_free_capacity() {
        let throttler = RateThrottler::from_pairs(&[(ms(1000), 1)]).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        throttler.wait_for_permission(&cancel).await.unwrap();
        assert!(throttler.wait_for_permission(&cancel).await.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire() {
        let throttler = RateThrottler::from_pairs(&[(ms(1000), 1)]).unwrap();

        assert_eq!(throttler.try_acquire(), Admission::Admitted);
        assert_eq!(throttler.try_acquire(), Admission::Delayed(ms(1000)));

        tokio::time::advance(ms(400)).await;
        assert_eq!(throttler.try_acquire(), Admission::Delayed(ms(600)));

        tokio::time::advance(ms(600)).await;
        assert_eq!(throttler.try_acquire(), Admission::Admitted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_until_available_does_not_record() {
        let throttler = RateThrottler::from_pairs(&[(ms(1000), 1)]).unwrap();

        assert_eq!(throttler.time_until_available(), Duration::ZERO);
        assert_eq!(throttler.time_until_available(), Duration::ZERO);
        assert_eq!(throttler.try_acquire(), Admission::Admitted);
        assert_eq!(throttler.time_until_available(), ms(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_runs_operation_after_admission() {
        let throttler = RateThrottler::from_pairs(&[(ms(1000), 1)]).unwrap();
        let cancel = CancellationToken::new();

        let value = throttler.execute(&cancel, async { 42 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_skips_operation_on_cancel() {
        let throttler = RateThrottler::from_pairs(&[(ms(1000), 1)]).unwrap();
        assert_eq!(throttler.try_acquire(), Admission::Admitted);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let ran = AtomicBool::new(false);

        let result = throttler
            .execute(&cancel, async {
                ran.store(true, Ordering::SeqCst);
            })
            .await;

        assert!(result.unwrap_err().is_cancelled());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_respect_window() {
        let throttler = Arc::new(RateThrottler::from_pairs(&[(ms(100), 2)]).unwrap());
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let throttler = Arc::clone(&throttler);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    throttler.wait_for_permission(&cancel).await.unwrap();
                    start.elapsed()
                })
            })
            .collect();

        let mut admitted_at: Vec<Duration> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        admitted_at.sort();

        for pair in admitted_at.windows(3) {
            assert!(pair[2] - pair[0] >= ms(100), "{:?}", admitted_at);
        }
    }
}
