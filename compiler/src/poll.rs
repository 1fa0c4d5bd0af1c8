// poll.rs — Cancellation-aware polling
//
// Every blocking wait in the runtime goes through `poll_until`: it checks the
// cancellation token, makes one non-blocking attempt, and backs off (spin,
// then yield, then sleep) before trying again. An attempt either completes
// in full or leaves no trace, so cancellation never interrupts a transfer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::PollConfig;

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Marker error: the wait was abandoned because the token fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

/// Escalating backoff between poll attempts.
#[derive(Debug)]
pub struct Backoff {
    cfg: PollConfig,
    step: u32,
}

impl Backoff {
    pub fn new(cfg: PollConfig) -> Self {
        Backoff { cfg, step: 0 }
    }

    /// Wait a little before the next attempt.
    pub fn snooze(&mut self) {
        if self.step < self.cfg.spin_limit {
            std::hint::spin_loop();
        } else if self.step < self.cfg.spin_limit.saturating_add(self.cfg.yield_limit) {
            thread::yield_now();
        } else {
            thread::sleep(Duration::from_micros(self.cfg.park_micros));
        }
        self.step = self.step.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }

    /// True once spinning and yielding are exhausted.
    pub fn is_parking(&self) -> bool {
        self.step >= self.cfg.spin_limit.saturating_add(self.cfg.yield_limit)
    }
}

/// Repeat `attempt` until it yields a value, fails, or `cancel` fires.
///
/// The token is checked before every attempt, including the first.
pub fn poll_until<R, E>(
    cancel: &CancelToken,
    cfg: &PollConfig,
    mut attempt: impl FnMut() -> Result<Option<R>, E>,
) -> Result<R, E>
where
    E: From<Cancelled>,
{
    let mut backoff = Backoff::new(*cfg);
    loop {
        if cancel.is_cancelled() {
            return Err(Cancelled.into());
        }
        if let Some(value) = attempt()? {
            return Ok(value);
        }
        backoff.snooze();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum FakeError {
        Cancelled,
        Closed,
    }

    impl From<Cancelled> for FakeError {
        fn from(_: Cancelled) -> Self {
            FakeError::Cancelled
        }
    }

    /// A counter standing in for a channel's `available_to_read`.
    struct FakeChannel {
        available: usize,
        block: usize,
    }

    impl FakeChannel {
        fn try_read(&mut self) -> Result<Option<usize>, FakeError> {
            if self.available >= self.block {
                self.available -= self.block;
                Ok(Some(self.block))
            } else {
                Ok(None)
            }
        }
    }

    fn fast() -> PollConfig {
        PollConfig {
            spin_limit: 2,
            yield_limit: 2,
            park_micros: 1,
        }
    }

    #[test]
    fn returns_once_attempt_succeeds() {
        let cancel = CancelToken::new();
        let mut tries = 0;
        let got = poll_until(&cancel, &fast(), || -> Result<Option<u32>, FakeError> {
            tries += 1;
            Ok((tries == 5).then_some(7))
        });
        assert_eq!(got, Ok(7));
        assert_eq!(tries, 5);
    }

    #[test]
    fn cancelled_before_first_attempt() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut ch = FakeChannel {
            available: 4,
            block: 4,
        };
        let got = poll_until(&cancel, &fast(), || ch.try_read());
        assert_eq!(got, Err(FakeError::Cancelled));
        assert_eq!(ch.available, 4);
    }

    #[test]
    fn cancellation_while_waiting_leaves_state_untouched() {
        let cancel = CancelToken::new();
        let mut ch = FakeChannel {
            available: 0,
            block: 2,
        };
        let mut tries = 0;
        let got = poll_until(&cancel, &fast(), || {
            tries += 1;
            if tries == 10 {
                cancel.cancel();
            }
            ch.try_read()
        });
        assert_eq!(got, Err(FakeError::Cancelled));
        assert_eq!(ch.available, 0);
        assert_eq!(tries, 10);
    }

    #[test]
    fn attempt_error_propagates() {
        let cancel = CancelToken::new();
        let got: Result<(), _> = poll_until(&cancel, &fast(), || Err(FakeError::Closed));
        assert_eq!(got, Err(FakeError::Closed));
    }

    #[test]
    fn backoff_escalates_to_parking() {
        let mut b = Backoff::new(fast());
        for _ in 0..4 {
            assert!(!b.is_parking());
            b.snooze();
        }
        assert!(b.is_parking());
        b.reset();
        assert!(!b.is_parking());
    }

    #[test]
    fn token_clones_share_state() {
        let a = CancelToken::new();
        let b = a.clone();
        b.cancel();
        assert!(a.is_cancelled());
    }
}
