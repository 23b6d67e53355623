use chrono::{DateTime, Duration, Utc};

/// Retry delay, in minutes, after the n-th consecutive failure (index 0 = first failure).
pub const BACKOFF_MINUTES: [i64; 5] = [1, 2, 5, 15, 30];

/// Default number of failed attempts after which an outbox entry becomes FAILED.
pub const DEFAULT_MAX_FAIL_COUNT: i64 = 5;

/// What happens to an entry after a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Stay PENDING; not eligible before `send_after`.
    RetryAt {
        fail_count: i64,
        send_after: DateTime<Utc>,
    },
    /// Ceiling reached: terminal FAILED.
    GiveUp { fail_count: i64 },
}

/// Fixed, un-jittered delay after `fail_count` failures. Counts past the table clamp
/// to its last entry.
pub fn backoff_delay(fail_count: i64) -> Duration {
    let index = (fail_count.max(1) - 1) as usize;
    let minutes = BACKOFF_MINUTES
        .get(index)
        .copied()
        .unwrap_or(BACKOFF_MINUTES[BACKOFF_MINUTES.len() - 1]);
    Duration::minutes(minutes)
}

/// Decide the follow-up for an entry that had `previous_fail_count` failures before
/// the attempt that just failed.
pub fn next_retry(previous_fail_count: i64, max_fail_count: i64, now: DateTime<Utc>) -> RetryDecision {
    let fail_count = previous_fail_count + 1;
    if fail_count >= max_fail_count {
        RetryDecision::GiveUp { fail_count }
    } else {
        RetryDecision::RetryAt {
            fail_count,
            send_after: now + backoff_delay(fail_count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_table() {
        assert_eq!(backoff_delay(1), Duration::minutes(1));
        assert_eq!(backoff_delay(2), Duration::minutes(2));
        assert_eq!(backoff_delay(3), Duration::minutes(5));
        assert_eq!(backoff_delay(4), Duration::minutes(15));
        assert_eq!(backoff_delay(5), Duration::minutes(30));
        assert_eq!(backoff_delay(12), Duration::minutes(30));
        assert_eq!(backoff_delay(0), Duration::minutes(1));
    }

    #[test]
    fn test_fifth_failure_gives_up() {
        let now = Utc::now();
        for previous in 0..4 {
            match next_retry(previous, DEFAULT_MAX_FAIL_COUNT, now) {
                RetryDecision::RetryAt { fail_count, send_after } => {
                    assert_eq!(fail_count, previous + 1);
                    assert_eq!(send_after, now + backoff_delay(previous + 1));
                }
                other => panic!("attempt {} should retry, got {:?}", previous + 1, other),
            }
        }
        assert_eq!(
            next_retry(4, DEFAULT_MAX_FAIL_COUNT, now),
            RetryDecision::GiveUp { fail_count: 5 }
        );
    }

    #[test]
    fn test_raised_ceiling_uses_thirty_minutes() {
        let now = Utc::now();
        assert_eq!(
            next_retry(4, 7, now),
            RetryDecision::RetryAt {
                fail_count: 5,
                send_after: now + Duration::minutes(30)
            }
        );
    }
}
