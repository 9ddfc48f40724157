use std::fmt::Display;
use std::thread;
use std::time::Duration;
use tracing::warn;

pub const RETRY_COUNT: u32 = 3;
pub const RETRY_WAIT: Duration = Duration::from_secs(2);

/// Fixed attempt count with a fixed pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: RETRY_COUNT,
            delay: RETRY_WAIT,
        }
    }
}

impl RetryPolicy {
    pub fn immediate(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            delay: Duration::ZERO,
        }
    }
}

/// Calls `op` until it succeeds or `policy.attempts` calls have failed, in
/// which case the last error is returned. At least one call is always made.
pub fn run_with_retry<T, E, F>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Result<T, E>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) => {
                warn!(attempt, attempts, error = %err, "{} failed, retrying", what);
                if !policy.delay.is_zero() {
                    thread::sleep(policy.delay);
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Instant;

    #[test]
    fn first_success_calls_once() {
        let calls = Cell::new(0);
        let result: Result<&str, String> = run_with_retry(&RetryPolicy::default(), "op", || {
            calls.set(calls.get() + 1);
            Ok("success")
        });
        assert_eq!(result, Ok("success"));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn recovers_on_last_attempt() {
        let calls = Cell::new(0);
        let result: Result<u32, String> = run_with_retry(&RetryPolicy::immediate(3), "op", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err("transient".into())
            } else {
                Ok(calls.get())
            }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn persistent_failure_returns_last_error_after_three_calls() {
        let calls = Cell::new(0);
        let result: Result<(), String> = run_with_retry(&RetryPolicy::immediate(3), "op", || {
            calls.set(calls.get() + 1);
            Err(format!("always fails {}", calls.get()))
        });
        assert_eq!(result, Err("always fails 3".to_string()));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn waits_between_attempts_only() {
        let policy = RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(20),
        };
        let start = Instant::now();
        let _: Result<(), &str> = run_with_retry(&policy, "op", || Err("nope"));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_millis(1000));
    }

    #[test]
    fn zero_attempts_still_calls_once() {
        let calls = Cell::new(0);
        let _: Result<(), &str> = run_with_retry(&RetryPolicy::immediate(0), "op", || {
            calls.set(calls.get() + 1);
            Err("nope")
        });
        assert_eq!(calls.get(), 1);
    }
}
