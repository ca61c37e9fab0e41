//! Bounded retry with a fixed delay between attempts.

use std::thread;
use std::time::Duration;

/// A fixed-delay retry policy.
///
/// Used by [`Machine::conn`](crate::Machine::conn) to ride out the window
/// between spawning the emulator and its sockets starting to listen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (at least one is always made).
    pub attempts: u32,
    /// Pause between consecutive attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy with `attempts` tries spaced `delay` apart.
    pub const fn fixed(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Number of attempts actually made by [`run`](Self::run).
    pub const fn max_attempts(&self) -> u32 {
        if self.attempts == 0 { 1 } else { self.attempts }
    }

    /// Runs `op` until it succeeds or the attempts are used up.
    ///
    /// `op` receives the 1-based attempt number. The error from the last
    /// attempt is returned on exhaustion. No delay follows the final attempt.
    pub fn run<T, E>(&self, mut op: impl FnMut(u32) -> Result<T, E>) -> Result<T, E> {
        let max = self.max_attempts();
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(v) => return Ok(v),
                Err(e) if attempt >= max => return Err(e),
                Err(_) => {
                    attempt += 1;
                    thread::sleep(self.delay);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    /// Three attempts, one second apart.
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(1))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn stops_at_first_success() {
        let mut calls = 0;
        let res: Result<u32, ()> = RetryPolicy::fixed(5, Duration::ZERO).run(|n| {
            calls += 1;
            if n == 2 { Ok(n) } else { Err(()) }
        });
        assert_eq!(res, Ok(2));
        assert_eq!(calls, 2);
    }

    #[test]
    fn returns_last_error_on_exhaustion() {
        let res: Result<(), u32> = RetryPolicy::fixed(3, Duration::ZERO).run(Err);
        assert_eq!(res, Err(3));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let mut calls = 0;
        let _: Result<(), ()> = RetryPolicy::fixed(0, Duration::ZERO).run(|_| {
            calls += 1;
            Err(())
        });
        assert_eq!(calls, 1);
    }

    #[test]
    fn sleeps_between_attempts_only() {
        let start = Instant::now();
        let _: Result<(), ()> = RetryPolicy::fixed(3, Duration::from_millis(20)).run(|_| Err(()));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_millis(60 + 200));
    }

    #[test]
    fn default_is_three_one_second_attempts() {
        assert_eq!(
            RetryPolicy::default(),
            RetryPolicy::fixed(3, Duration::from_secs(1))
        );
    }
}
