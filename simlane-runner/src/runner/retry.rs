// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::config::RetryPolicy;
use rand::{RngExt, distr::OpenClosed01};
use std::time::Duration;

/// The retries left in one run.
#[derive(Debug)]
pub(super) struct RetrySchedule {
    policy: RetryPolicy,
    used: u32,
}

/// The next attempt, and how long to wait before starting it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) struct ScheduledRetry {
    pub(super) next_attempt: usize,
    pub(super) delay: Duration,
}

impl RetrySchedule {
    pub(super) fn new(policy: RetryPolicy) -> Self {
        Self { policy, used: 0 }
    }

    /// Takes a retry after `attempt` from the budget, or returns `None` if
    /// the budget is spent.
    pub(super) fn after(&mut self, attempt: usize) -> Option<ScheduledRetry> {
        if self.used >= self.policy.count() {
            return None;
        }
        self.used += 1;

        let backoff = self.policy.backoff();
        let mut delay = backoff.base_delay(self.used);
        if backoff.has_jitter() {
            // Range (0.5, 1].
            let jitter: f64 = rand::rng().sample(OpenClosed01);
            delay = delay.mul_f64(0.5 + jitter / 2.);
        }
        Some(ScheduledRetry {
            next_attempt: attempt + 1,
            delay,
        })
    }
}
