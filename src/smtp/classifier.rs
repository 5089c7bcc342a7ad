//! Retry classification: maps a send result to `Success` /
//! `TransientFailure` / `PermanentFailure` and computes the next backoff.
//!
//! Connection/IO failures are treated as retryable, authentication
//! failures and non-retryable reply codes surface immediately, generalized
//! to the full SMTP reply-code taxonomy.

use crate::error::RelayError;
use chrono::Duration;
use rand::Rng;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

/// Classifies a completed send attempt. `code` is the SMTP reply code
/// when the transport returned one; `error` carries a transport-level
/// failure (connect refused, TLS handshake, timeout) when there wasn't a
/// reply at all.
pub fn classify(code: Option<u16>, error: Option<&RelayError>) -> Outcome {
    if let Some(code) = code {
        return match code {
            200..=299 => Outcome::Success,
            400..=499 => Outcome::TransientFailure,
            // 521/554 and friends are permanent by convention; treat the
            // rest of the 5xx range as permanent too.
            500..=599 => Outcome::PermanentFailure,
            _ => Outcome::TransientFailure,
        };
    }

    match error {
        None => Outcome::Success,
        Some(RelayError::SmtpPermanent(_)) => Outcome::PermanentFailure,
        Some(RelayError::SmtpTransport(e)) if e.is_permanent() => Outcome::PermanentFailure,
        Some(_) => Outcome::TransientFailure,
    }
}

/// A literal per-attempt delay table used by the dispatch loop to compute
/// a deferred message's next `deferred_ts`, plus a jitter fraction so
/// retries across many messages don't thunder on the same tick. Retry
/// `n` waits `schedule[n]`; once `n` runs past the end of the table the
/// message is permanently failed.
pub struct RetrySchedule {
    schedule: Vec<std::time::Duration>,
    jitter_fraction: f64,
}

impl RetrySchedule {
    pub fn new(schedule: Vec<std::time::Duration>, jitter_fraction: f64) -> Self {
        Self { schedule, jitter_fraction: jitter_fraction.clamp(0.0, 1.0) }
    }

    /// Returns the delay before the `retry_count`-th retry, or `None` once
    /// the schedule is exhausted (caller treats the message as permanently
    /// failed at that point).
    pub fn delay_for(&self, retry_count: u32, rng: &mut impl Rng) -> Option<Duration> {
        let base_delay = *self.schedule.get(retry_count as usize)?;
        let base_secs = base_delay.as_secs_f64();
        let jitter_range = (base_secs * self.jitter_fraction).max(0.0);
        let jitter = rng.gen_range(-jitter_range..=jitter_range);
        let total = (base_secs + jitter).max(0.0);
        Some(Duration::milliseconds((total * 1000.0) as i64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn classifies_2xx_4xx_5xx() {
        assert_eq!(classify(Some(250), None), Outcome::Success);
        assert_eq!(classify(Some(421), None), Outcome::TransientFailure);
        assert_eq!(classify(Some(550), None), Outcome::PermanentFailure);
    }

    #[test]
    fn classifies_transport_errors_as_transient_by_default() {
        let err = RelayError::internal("connect refused");
        assert_eq!(classify(None, Some(&err)), Outcome::TransientFailure);
    }

    fn secs_schedule(secs: &[u64]) -> Vec<std::time::Duration> {
        secs.iter().map(|s| std::time::Duration::from_secs(*s)).collect()
    }

    #[test]
    fn delay_follows_the_literal_schedule_with_jitter() {
        let schedule = RetrySchedule::new(secs_schedule(&[1, 5, 60]), 0.1);
        let mut rng = StdRng::seed_from_u64(42);
        let first = schedule.delay_for(0, &mut rng).unwrap();
        let second = schedule.delay_for(1, &mut rng).unwrap();
        assert!(first.num_milliseconds() > 0);
        assert!(second.num_milliseconds() > first.num_milliseconds() / 2);
    }

    #[test]
    fn default_schedule_first_entry_is_sixty_seconds() {
        let schedule = RetrySchedule::new(secs_schedule(&[60, 300, 900, 3600, 7200]), 0.0);
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(schedule.delay_for(0, &mut rng).unwrap(), Duration::seconds(60));
    }

    #[test]
    fn exhausts_past_the_end_of_the_table() {
        let schedule = RetrySchedule::new(secs_schedule(&[1, 5]), 0.0);
        let mut rng = StdRng::seed_from_u64(1);
        assert!(schedule.delay_for(0, &mut rng).is_some());
        assert!(schedule.delay_for(1, &mut rng).is_some());
        assert!(schedule.delay_for(2, &mut rng).is_none());
        assert!(schedule.delay_for(10, &mut rng).is_none());
    }
}
