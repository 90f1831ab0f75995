// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The per-lane lifecycle state machine and its watchdogs.
//!
//! A [`LaneMonitor`] is driven by the lane executor: sandbox progress, raw
//! output arrival, parse events, process exit and watchdog deadlines. It owns
//! the lane's [`LaneState`]; everything else only reads it.

use crate::{
    errors::{DisplayErrorChain, SandboxError, SandboxStep},
    parser::{CloseSummary, ParseEvent, PhaseListener},
    sandbox::WorkloadExit,
    time::far_future_duration,
};
use serde::Serialize;
use std::{fmt, time::Duration};
use tokio::time::Instant;
use tracing::debug;

/// The state of one lane.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaneState {
    /// Nothing requested yet.
    Idle,

    /// The sandbox instance is being created, booted and prepared.
    Launching,

    /// The workload process exists.
    AppLaunched,

    /// The workload reported that tests started.
    TestsRunning,

    /// The workload finished cleanly. Individual tests may still have failed.
    Completed,

    /// The sandbox or workload failed.
    Crashed,

    /// A watchdog fired.
    TimedOut,

    /// The run was interrupted.
    Interrupted,
}

impl LaneState {
    /// Returns true for states the lane never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Crashed | Self::TimedOut | Self::Interrupted
        )
    }
}

impl fmt::Display for LaneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Launching => "launching",
            Self::AppLaunched => "app launched",
            Self::TestsRunning => "tests running",
            Self::Completed => "completed",
            Self::Crashed => "crashed",
            Self::TimedOut => "timed out",
            Self::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// Which watchdog.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WatchdogKind {
    /// Reset whenever output arrives.
    NoOutput,

    /// A fixed budget from the moment tests start running.
    MaxExecution,
}

impl fmt::Display for WatchdogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOutput => f.write_str("no output"),
            Self::MaxExecution => f.write_str("max execution time"),
        }
    }
}

/// The intervals for both watchdogs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WatchdogIntervals {
    /// How long the workload may stay silent.
    pub no_output: Duration,

    /// How long tests may run in total.
    pub max_execution: Duration,
}

/// The state of a watchdog.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WatchdogState {
    /// Not started.
    Disarmed,

    /// Running.
    Armed {
        /// When the watchdog fires.
        deadline: Instant,
    },

    /// The watchdog fired.
    Fired,

    /// The watchdog was cancelled before it fired.
    Cancelled,
}

/// A single timeout policy.
#[derive(Clone, Debug)]
pub struct Watchdog {
    kind: WatchdogKind,
    interval: Duration,
    state: WatchdogState,
    cancellations: usize,
}

impl Watchdog {
    fn new(kind: WatchdogKind, interval: Duration) -> Self {
        Self {
            kind,
            interval,
            state: WatchdogState::Disarmed,
            cancellations: 0,
        }
    }

    /// Returns which watchdog this is.
    pub fn kind(&self) -> WatchdogKind {
        self.kind
    }

    /// Returns the current state.
    pub fn state(&self) -> WatchdogState {
        self.state
    }

    /// Returns how many times the watchdog was cancelled: never more than once.
    pub fn cancellations(&self) -> usize {
        self.cancellations
    }

    /// Returns the deadline if armed.
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            WatchdogState::Armed { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Starts the watchdog, or restarts it if already armed. Has no effect once
    /// fired or cancelled.
    fn arm(&mut self, now: Instant) {
        if matches!(
            self.state,
            WatchdogState::Disarmed | WatchdogState::Armed { .. }
        ) {
            let deadline = now
                .checked_add(self.interval)
                .unwrap_or_else(|| now + far_future_duration());
            self.state = WatchdogState::Armed { deadline };
        }
    }

    /// Pushes the deadline out if armed.
    fn reset(&mut self, now: Instant) {
        if self.deadline().is_some() {
            self.arm(now);
        }
    }

    /// Returns true if this call fired the watchdog.
    fn fire(&mut self) -> bool {
        if self.deadline().is_some() {
            self.state = WatchdogState::Fired;
            true
        } else {
            false
        }
    }

    fn cancel(&mut self) {
        if matches!(
            self.state,
            WatchdogState::Disarmed | WatchdogState::Armed { .. }
        ) {
            self.state = WatchdogState::Cancelled;
            self.cancellations += 1;
        }
    }
}

/// Why a lane ended up [`LaneState::Crashed`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CrashCause {
    /// A sandbox step failed.
    Setup {
        /// The step.
        step: SandboxStep,

        /// The error, with its causes.
        message: String,
    },

    /// The sandbox lost track of the workload.
    SimulatorLost {
        /// What the sandbox reported.
        reason: String,
    },

    /// The workload exited abnormally.
    AbnormalExit {
        /// How it exited.
        exit: WorkloadExit,
    },

    /// The workload exited cleanly but its output stopped mid-suite or mid-case.
    IncompleteOutput {
        /// Suites and cases left open.
        unterminated: usize,
    },

    /// The workload exited cleanly without reporting that any tests started.
    NoTestsStarted,
}

impl fmt::Display for CrashCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setup { message, .. } => f.write_str(message),
            Self::SimulatorLost { reason } => write!(f, "sandbox lost the workload: {reason}"),
            Self::AbnormalExit { exit } => write!(f, "workload {exit}"),
            Self::IncompleteOutput { unterminated } => write!(
                f,
                "workload exited with {unterminated} suites or cases still open"
            ),
            Self::NoTestsStarted => f.write_str("workload exited before any tests started"),
        }
    }
}

/// Something the lane executor must do in response to a transition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[must_use]
pub enum MonitorAction {
    /// Terminate the workload process.
    TerminateWorkload,
}

/// The lifecycle state machine for one lane.
#[derive(Debug)]
pub struct LaneMonitor {
    lane: usize,
    state: LaneState,
    no_output: Watchdog,
    max_execution: Watchdog,
    launched: bool,
    stream_closed: Option<CloseSummary>,
    exit: Option<WorkloadExit>,
    crash: Option<CrashCause>,
    timed_out_by: Option<WatchdogKind>,
    termination_requests: usize,
}

impl LaneMonitor {
    /// Creates a monitor in the [`LaneState::Idle`] state.
    pub fn new(lane: usize, intervals: WatchdogIntervals) -> Self {
        Self {
            lane,
            state: LaneState::Idle,
            no_output: Watchdog::new(WatchdogKind::NoOutput, intervals.no_output),
            max_execution: Watchdog::new(WatchdogKind::MaxExecution, intervals.max_execution),
            launched: false,
            stream_closed: None,
            exit: None,
            crash: None,
            timed_out_by: None,
            termination_requests: 0,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> LaneState {
        self.state
    }

    /// Returns why the lane crashed, if it did.
    pub fn crash_cause(&self) -> Option<&CrashCause> {
        self.crash.as_ref()
    }

    /// Returns the watchdog that timed the lane out, if any.
    pub fn timed_out_by(&self) -> Option<WatchdogKind> {
        self.timed_out_by
    }

    /// Returns the workload's exit, once observed.
    pub fn exit(&self) -> Option<&WorkloadExit> {
        self.exit.as_ref()
    }

    /// Returns a watchdog.
    pub fn watchdog(&self, kind: WatchdogKind) -> &Watchdog {
        match kind {
            WatchdogKind::NoOutput => &self.no_output,
            WatchdogKind::MaxExecution => &self.max_execution,
        }
    }

    /// Returns how many times termination of the workload was requested.
    pub fn termination_requests(&self) -> usize {
        self.termination_requests
    }

    /// Returns the earliest armed watchdog deadline.
    pub fn next_deadline(&self) -> Option<(Instant, WatchdogKind)> {
        [&self.no_output, &self.max_execution]
            .into_iter()
            .filter_map(|watchdog| Some((watchdog.deadline()?, watchdog.kind)))
            .min_by_key(|(deadline, _)| *deadline)
    }

    /// The orchestrator asked for an instance.
    pub fn on_boot_requested(&mut self) {
        if self.state == LaneState::Idle {
            self.transition(LaneState::Launching);
        }
    }

    /// A sandbox step failed for good.
    pub fn on_setup_failed(&mut self, error: &SandboxError) {
        if !self.state.is_terminal() {
            self.crash = Some(CrashCause::Setup {
                step: error.step(),
                message: DisplayErrorChain::new(error).to_string(),
            });
            self.transition(LaneState::Crashed);
        }
    }

    /// The workload process was observed.
    pub fn on_launched(&mut self) {
        if self.state == LaneState::Launching {
            self.launched = true;
            self.transition(LaneState::AppLaunched);
            self.no_output.arm(Instant::now());
        }
    }

    /// A chunk of output arrived.
    pub fn on_output_received(&mut self) {
        if !self.state.is_terminal() {
            self.no_output.reset(Instant::now());
        }
    }

    /// The output stream ended and the parser was closed.
    pub fn on_stream_closed(&mut self, summary: CloseSummary) {
        if self.stream_closed.is_none() {
            self.stream_closed = Some(summary);
            self.maybe_complete();
        }
    }

    /// The workload process exited.
    pub fn on_process_exit(&mut self, exit: &WorkloadExit) {
        if self.exit.is_some() {
            return;
        }
        self.exit = Some(exit.clone());
        if self.state.is_terminal() {
            return;
        }

        match exit {
            WorkloadExit::Lost(reason) => {
                self.crash = Some(CrashCause::SimulatorLost {
                    reason: reason.clone(),
                });
                self.transition(LaneState::Crashed);
            }
            exit if !exit.is_clean() => {
                self.crash = Some(CrashCause::AbnormalExit { exit: exit.clone() });
                self.transition(LaneState::Crashed);
            }
            _ => self.maybe_complete(),
        }
    }

    /// A watchdog deadline passed. Returns an action the first time only.
    pub fn on_watchdog_fired(&mut self, kind: WatchdogKind) -> Option<MonitorAction> {
        if self.state.is_terminal() {
            debug!(lane = self.lane, %kind, "watchdog fired after the lane finished");
            return None;
        }
        if self.time_out(kind) {
            self.request_termination()
        } else {
            None
        }
    }

    /// Fires `kind` and moves to `TimedOut`. Returns false if the watchdog
    /// had already fired or been cancelled.
    fn time_out(&mut self, kind: WatchdogKind) -> bool {
        let fired = match kind {
            WatchdogKind::NoOutput => self.no_output.fire(),
            WatchdogKind::MaxExecution => self.max_execution.fire(),
        };
        if fired {
            self.timed_out_by = Some(kind);
            self.transition(LaneState::TimedOut);
        }
        fired
    }

    /// The run is being interrupted.
    pub fn on_interrupt(&mut self) -> Option<MonitorAction> {
        if self.state.is_terminal() {
            return None;
        }
        self.transition(LaneState::Interrupted);
        if self.launched && self.exit.is_none() {
            self.request_termination()
        } else {
            None
        }
    }

    fn request_termination(&mut self) -> Option<MonitorAction> {
        self.termination_requests += 1;
        Some(MonitorAction::TerminateWorkload)
    }

    fn expired_watchdog(&self) -> Option<WatchdogKind> {
        let (deadline, kind) = self.next_deadline()?;
        (deadline <= Instant::now()).then_some(kind)
    }

    fn maybe_complete(&mut self) {
        let (Some(summary), Some(exit)) = (self.stream_closed, &self.exit) else {
            return;
        };
        if self.state.is_terminal() || !exit.is_clean() {
            return;
        }
        // A deadline that has already passed wins over completion. The
        // workload is gone, so there is nothing to terminate.
        if let Some(kind) = self.expired_watchdog() {
            self.time_out(kind);
            return;
        }

        if summary.unterminated > 0 {
            self.crash = Some(CrashCause::IncompleteOutput {
                unterminated: summary.unterminated,
            });
            self.transition(LaneState::Crashed);
        } else if self.state != LaneState::TestsRunning {
            self.crash = Some(CrashCause::NoTestsStarted);
            self.transition(LaneState::Crashed);
        } else {
            self.transition(LaneState::Completed);
        }
    }

    fn transition(&mut self, to: LaneState) {
        debug!(lane = self.lane, from = %self.state, to = %to, "lane state changed");
        self.state = to;
        if to.is_terminal() {
            self.no_output.cancel();
            self.max_execution.cancel();
        }
    }
}

impl PhaseListener for LaneMonitor {
    fn on_parse_event(&mut self, event: &ParseEvent) {
        if self.state == LaneState::AppLaunched && event.is_test_activity() {
            self.transition(LaneState::TestsRunning);
            self.max_execution.arm(Instant::now());
        }
    }
}
