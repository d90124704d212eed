//! Exponential backoff generator and the stateful expiration predicate
//! built on top of it (§3, §9 design note: "a small finite state
//! machine: (next_deadline, interval_iter)").

use std::time::{Duration, Instant};

/// Yields `retries_before_backoff` intervals of `base`, then doubles
/// each step up to `ceiling`, then holds at `ceiling` forever.
#[derive(Clone, Debug)]
pub struct BackoffSchedule {
    retries_before_backoff: u32,
    base: Duration,
    ceiling: Duration,
    step: u32,
}

impl BackoffSchedule {
    pub fn new(retries_before_backoff: u32, base: Duration, ceiling: Duration) -> Self {
        Self {
            retries_before_backoff,
            base,
            ceiling,
            step: 0,
        }
    }

    fn next_interval(&mut self) -> Duration {
        let interval = if self.step < self.retries_before_backoff {
            self.base
        } else {
            let doublings = self.step - self.retries_before_backoff + 1;
            let factor = 1u32.checked_shl(doublings).unwrap_or(u32::MAX);
            self.base.checked_mul(factor).unwrap_or(self.ceiling).min(self.ceiling)
        };
        self.step = self.step.saturating_add(1);
        interval
    }
}

/// Ticks `true` exactly when the next backoff interval has elapsed
/// since the previous `true`. The first evaluation is always `true`
/// (§3: "its first evaluation always returns ready").
#[derive(Clone, Debug)]
pub struct ExpirationPredicate {
    schedule: BackoffSchedule,
    next_deadline: Option<Instant>,
}

impl ExpirationPredicate {
    pub fn new(schedule: BackoffSchedule) -> Self {
        Self {
            schedule,
            next_deadline: None,
        }
    }

    /// Returns `true` and advances the internal deadline iff `now` is
    /// at or past the current deadline (or this is the first poll).
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.next_deadline {
            None => {
                self.next_deadline = Some(now + self.schedule.next_interval());
                true
            }
            Some(deadline) if now >= deadline => {
                self.next_deadline = Some(now + self.schedule.next_interval());
                true
            }
            Some(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_poll_is_always_ready() {
        let schedule = BackoffSchedule::new(2, Duration::from_secs(1), Duration::from_secs(10));
        let mut predicate = ExpirationPredicate::new(schedule);
        assert!(predicate.poll(Instant::now()));
    }

    #[test]
    fn backoff_monotonicity_matches_r_r_2r_4r_10r_10r() {
        let base = Duration::from_secs(1);
        let ceiling = Duration::from_secs(10);
        let mut schedule = BackoffSchedule::new(2, base, ceiling);

        let intervals: Vec<Duration> = (0..7).map(|_| schedule.next_interval()).collect();
        assert_eq!(
            intervals,
            vec![
                base,
                base,
                base * 2,
                base * 4,
                base * 8,
                ceiling,
                ceiling,
            ]
        );
    }

    #[test]
    fn expiration_predicate_waits_between_ready_ticks() {
        let schedule = BackoffSchedule::new(1, Duration::from_millis(100), Duration::from_secs(1));
        let mut predicate = ExpirationPredicate::new(schedule);
        let t0 = Instant::now();
        assert!(predicate.poll(t0));
        assert!(!predicate.poll(t0 + Duration::from_millis(50)));
        assert!(predicate.poll(t0 + Duration::from_millis(120)));
    }
}
