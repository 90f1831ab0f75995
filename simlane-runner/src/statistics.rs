// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Counters accumulated across every attempt of a run.
//!
//! Lanes finish concurrently, so the orchestrator hands each one a
//! [`StatisticsHandle`]. A lane's terminal outcome is recorded with a single
//! [`StatisticsHandle::record_lane`] call, under one lock.

use crate::{
    monitor::{LaneState, WatchdogKind},
    runner::{ExitStatus, LaneReport},
};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

/// A phase of a lane's life, timed separately.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Creating the instance.
    Create,

    /// Booting the instance.
    Boot,

    /// Installing the workload.
    Install,

    /// Launching the workload.
    Launch,

    /// From launch until the workload exited and its output ended.
    Execute,

    /// Deleting the instance.
    Delete,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create instance",
            Self::Boot => "boot instance",
            Self::Install => "install workload",
            Self::Launch => "launch workload",
            Self::Execute => "execute tests",
            Self::Delete => "delete instance",
        };
        f.write_str(s)
    }
}

/// How long one phase of one lane took.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PhaseTiming {
    /// The 1-based attempt.
    pub attempt: usize,

    /// The lane index.
    pub lane: usize,

    /// The phase.
    pub phase: Phase,

    /// When the phase started.
    pub start_time: DateTime<Local>,

    /// How long the phase took, across all tries.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,

    /// The number of tries made.
    pub tries: u32,

    /// The error, if the phase failed.
    pub error: Option<String>,
}

/// Infrastructure failures, by kind.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct InfrastructureCounters {
    /// Lanes whose instance could not be created.
    pub create_failures: usize,

    /// Lanes whose instance did not boot.
    pub boot_failures: usize,

    /// Lanes where the workload could not be installed.
    pub install_failures: usize,

    /// Lanes where the workload could not be launched.
    pub launch_failures: usize,

    /// Lanes whose instance lost the workload.
    pub simulator_crashes: usize,

    /// Lanes whose workload crashed.
    pub app_crashes: usize,

    /// Instances that could not be deleted. These never change a lane's
    /// outcome.
    pub delete_failures: usize,
}

impl InfrastructureCounters {
    /// Returns the total, not counting delete failures.
    pub fn total(&self) -> usize {
        self.create_failures
            + self.boot_failures
            + self.install_failures
            + self.launch_failures
            + self.simulator_crashes
            + self.app_crashes
    }
}

/// Lanes timed out, by watchdog.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct TimeoutCounters {
    /// Lanes that went silent.
    pub no_output: usize,

    /// Lanes that ran out of time.
    pub max_execution: usize,
}

impl TimeoutCounters {
    /// Returns the total.
    pub fn total(&self) -> usize {
        self.no_output + self.max_execution
    }
}

/// Counters for a whole run.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Statistics {
    /// Attempts started.
    pub attempts: usize,

    /// Attempts beyond the first.
    pub retries: usize,

    /// Lanes that finished, in any state.
    pub lanes: usize,

    /// Test cases that reported a result.
    pub tests_run: usize,

    /// Test cases that passed.
    pub passed: usize,

    /// Test cases that failed.
    pub failures: usize,

    /// Test cases that errored.
    pub errors: usize,

    /// Lanes that were interrupted.
    pub interrupted_lanes: usize,

    /// Infrastructure failures.
    pub infrastructure: InfrastructureCounters,

    /// Timeouts, counted apart from test failures.
    pub timeouts: TimeoutCounters,

    /// Structural parse anomalies.
    pub parse_anomalies: usize,

    /// Lines no pattern recognized.
    pub unrecognized_lines: usize,

    /// Suites whose counts disagreed with their summary line.
    pub count_mismatches: usize,

    /// Per-lane phase timings, in the order lanes finished.
    pub phases: Vec<PhaseTiming>,
}

impl Statistics {
    fn record_lane(&mut self, report: &LaneReport) {
        self.lanes += 1;

        let totals = report.tree.totals();
        self.tests_run += totals.tests;
        self.failures += totals.failures;
        self.errors += totals.errors;
        self.passed += totals.tests - totals.failures - totals.errors;

        self.parse_anomalies += report.tree.anomalies().len();
        self.unrecognized_lines += report.tree.unrecognized_lines();
        self.count_mismatches += report.tree.count_mismatches().count();

        match report.state {
            LaneState::Crashed => {
                let infra = &mut self.infrastructure;
                match report.status {
                    ExitStatus::SimulatorCreationFailed => infra.create_failures += 1,
                    ExitStatus::SimulatorBootFailed => infra.boot_failures += 1,
                    ExitStatus::InstallAppFailed => infra.install_failures += 1,
                    ExitStatus::LaunchAppFailed => infra.launch_failures += 1,
                    ExitStatus::SimulatorCrashed => infra.simulator_crashes += 1,
                    _ => infra.app_crashes += 1,
                }
            }
            LaneState::TimedOut => match report.timed_out_by {
                Some(WatchdogKind::MaxExecution) => self.timeouts.max_execution += 1,
                Some(WatchdogKind::NoOutput) | None => self.timeouts.no_output += 1,
            },
            LaneState::Interrupted => self.interrupted_lanes += 1,
            _ => {}
        }

        if report.delete_error.is_some() {
            self.infrastructure.delete_failures += 1;
        }
        self.phases.extend(report.phases.iter().cloned());
    }
}

/// A shared handle to the run's [`Statistics`].
#[derive(Clone, Debug, Default)]
pub struct StatisticsHandle {
    inner: Arc<Mutex<Statistics>>,
}

impl StatisticsHandle {
    /// Creates a handle to empty statistics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the start of an attempt.
    pub fn record_attempt(&self) {
        self.lock().attempts += 1;
    }

    /// Records a retry.
    pub fn record_retry(&self) {
        self.lock().retries += 1;
    }

    /// Records a lane's terminal outcome. Call exactly once per lane.
    pub fn record_lane(&self, report: &LaneReport) {
        self.lock().record_lane(report);
    }

    /// Returns a copy of the current counters.
    pub fn snapshot(&self) -> Statistics {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Statistics> {
        // Counters stay meaningful even if another lane panicked mid-update.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
