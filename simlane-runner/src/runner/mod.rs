// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Running tests across lanes.
//!
//! The main structure in this module is [`Orchestrator`]. Each attempt packs
//! the universe into an [`Assignment`](crate::partition::Assignment), spawns
//! one task per populated lane, and folds the lanes' reports into an
//! [`ExitStatus`] that decides whether to try again.

mod lane;
mod orchestrator;
mod retry;
mod status;

pub use lane::{LaneReport, LaneStateChange};
pub use orchestrator::*;
pub use status::*;

use crate::{config::SandboxPolicy, monitor::WatchdogIntervals};
use std::time::Duration;

/// Settings every lane runs with.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LanePolicy {
    /// The watchdog intervals.
    pub watchdogs: WatchdogIntervals,

    /// How long a workload may take to exit, and its output to drain, once
    /// the lane is done with it.
    pub termination_grace: Duration,

    /// Sandbox step limits.
    pub sandbox: SandboxPolicy,
}
