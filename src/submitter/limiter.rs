use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const INDETERMINATE_WINDOW: Duration = Duration::from_secs(180);
const INDETERMINATE_THRESHOLD: usize = 10;

struct LimiterState {
    limit: usize,
    events: VecDeque<Instant>,
}

/// Adaptive claim size.
///
/// Indeterminate responses (rate limiting, gateway timeouts, fee too low)
/// shrink the next batch; the configured size returns once the window
/// passes without new ones.
pub struct ProcessingLimiter {
    batch_size: usize,
    window: Duration,
    threshold: usize,
    state: Mutex<LimiterState>,
}

impl ProcessingLimiter {
    pub fn new(batch_size: usize) -> Self {
        Self::with_window(batch_size, INDETERMINATE_WINDOW, INDETERMINATE_THRESHOLD)
    }

    pub fn with_window(batch_size: usize, window: Duration, threshold: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            window,
            threshold: threshold.max(1),
            state: Mutex::new(LimiterState {
                limit: batch_size,
                events: VecDeque::new(),
            }),
        }
    }

    fn prune(&self, state: &mut LimiterState, now: Instant) {
        while let Some(oldest) = state.events.front() {
            if now.duration_since(*oldest) > self.window {
                state.events.pop_front();
            } else {
                break;
            }
        }
        if state.events.is_empty() && state.limit != self.batch_size {
            info!(limit = self.batch_size, "processing limit restored");
            state.limit = self.batch_size;
        }
    }

    /// How many rows the next claim may take.
    pub fn limit(&self) -> usize {
        let mut state = self.state.lock();
        self.prune(&mut state, Instant::now());
        state.limit
    }

    /// Records the result of one processed batch.
    pub fn record_batch(&self, in_flight: usize, indeterminate: usize) {
        if indeterminate == 0 {
            return;
        }
        let now = Instant::now();
        let mut state = self.state.lock();
        self.prune(&mut state, now);
        state.events.extend(std::iter::repeat(now).take(indeterminate));

        let limit = if state.events.len() >= self.threshold {
            1
        } else {
            in_flight.saturating_sub(indeterminate).clamp(1, self.batch_size)
        };
        if limit != state.limit {
            warn!(limit, indeterminate, recent = state.events.len(), "⚠️ processing limit reduced");
        }
        state.limit = limit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_at_batch_size() {
        assert_eq!(ProcessingLimiter::new(8).limit(), 8);
        assert_eq!(ProcessingLimiter::new(0).limit(), 1);
    }

    #[test]
    fn test_indeterminate_responses_shrink_limit() {
        let limiter = ProcessingLimiter::new(8);
        limiter.record_batch(8, 3);
        assert_eq!(limiter.limit(), 5);
        limiter.record_batch(5, 5);
        assert_eq!(limiter.limit(), 1);
        limiter.record_batch(8, 0);
        assert_eq!(limiter.limit(), 1, "clean batches do not reset the window");
    }

    #[test]
    fn test_threshold_drops_to_one() {
        let limiter = ProcessingLimiter::with_window(20, Duration::from_secs(60), 10);
        limiter.record_batch(20, 4);
        assert_eq!(limiter.limit(), 16);
        limiter.record_batch(20, 6);
        assert_eq!(limiter.limit(), 1);
    }

    #[test]
    fn test_resets_after_window() {
        let limiter = ProcessingLimiter::with_window(8, Duration::from_millis(20), 10);
        limiter.record_batch(8, 7);
        assert_eq!(limiter.limit(), 1);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(limiter.limit(), 8);
    }
}
