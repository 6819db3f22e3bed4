use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How a rank waits for a peer's flag to advance.
///
/// The waiter busy-spins for `spin_iterations` polls, then yields its time slice
/// for `yield_iterations` polls, then sleeps `sleep_micros` between polls until
/// the flag advances. There is no timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitPolicy {
    pub spin_iterations: u32,
    pub yield_iterations: u32,
    pub sleep_micros: u64,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        WaitPolicy {
            spin_iterations: 256,
            yield_iterations: 64,
            sleep_micros: 50,
        }
    }
}

impl WaitPolicy {
    pub fn with_spin_iterations(mut self, spin_iterations: u32) -> Self {
        self.spin_iterations = spin_iterations;
        self
    }

    pub fn with_yield_iterations(mut self, yield_iterations: u32) -> Self {
        self.yield_iterations = yield_iterations;
        self
    }

    pub fn with_sleep_micros(mut self, sleep_micros: u64) -> Self {
        self.sleep_micros = sleep_micros;
        self
    }

    pub(crate) fn backoff(&self) -> Backoff<'_> {
        Backoff {
            policy: self,
            polls: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Spin,
    Yield,
    Sleep,
}

/// Escalating wait between two polls of one flag.
pub(crate) struct Backoff<'a> {
    policy: &'a WaitPolicy,
    polls: u64,
}

impl Backoff<'_> {
    pub(crate) fn phase(&self) -> Phase {
        let spin = u64::from(self.policy.spin_iterations);
        let yields = spin + u64::from(self.policy.yield_iterations);
        if self.polls < spin {
            Phase::Spin
        } else if self.polls < yields {
            Phase::Yield
        } else {
            Phase::Sleep
        }
    }

    pub(crate) fn snooze(&mut self) {
        match self.phase() {
            Phase::Spin => std::hint::spin_loop(),
            Phase::Yield => std::thread::yield_now(),
            Phase::Sleep => std::thread::sleep(Duration::from_micros(self.policy.sleep_micros)),
        }
        self.polls = self.polls.saturating_add(1);
    }
}
