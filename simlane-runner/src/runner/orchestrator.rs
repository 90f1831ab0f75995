// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    ExitStatus, LanePolicy,
    lane::{LaneContext, LaneReport, LaneStateChange, cancelled, run_lane},
    retry::{RetrySchedule, ScheduledRetry},
};
use crate::{
    config::{FailureTolerance, LaneCount, RetryPolicy, SimlaneProfile},
    errors::{OrchestratorBuildError, PackError},
    partition::{Assignment, pack},
    sandbox::SimulatorControl,
    signal::{ShutdownEvent, SignalHandler, SignalHandlerKind},
    statistics::{Statistics, StatisticsHandle},
    universe::TestUniverse,
};
use camino::Utf8PathBuf;
use simlane_metadata::TestIdentifier;
use std::{collections::BTreeSet, num::NonZeroUsize, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinSet,
};
use tracing::{debug, info, warn};

/// Orchestrator options.
#[derive(Debug, Default)]
pub struct OrchestratorBuilder {
    lanes: Option<LaneCount>,
    retries: Option<RetryPolicy>,
    failure_tolerance: Option<FailureTolerance>,
    only_retry_failed: Option<bool>,
    lane_policy: Option<LanePolicy>,
    artifact: Option<Utf8PathBuf>,
    launch_args: Vec<String>,
    launch_env: Vec<(String, String)>,
}

impl OrchestratorBuilder {
    /// Sets the number of lanes, overriding the profile.
    pub fn set_lanes(&mut self, lanes: LaneCount) -> &mut Self {
        self.lanes = Some(lanes);
        self
    }

    /// Sets the retry policy, overriding the profile.
    pub fn set_retries(&mut self, retries: RetryPolicy) -> &mut Self {
        self.retries = Some(retries);
        self
    }

    /// Sets the failure tolerance, overriding the profile.
    pub fn set_failure_tolerance(&mut self, tolerance: FailureTolerance) -> &mut Self {
        self.failure_tolerance = Some(tolerance);
        self
    }

    /// Sets whether retries only run the tests that did not pass.
    pub fn set_only_retry_failed(&mut self, only_retry_failed: bool) -> &mut Self {
        self.only_retry_failed = Some(only_retry_failed);
        self
    }

    /// Sets the lane policy, overriding the profile.
    pub fn set_lane_policy(&mut self, policy: LanePolicy) -> &mut Self {
        self.lane_policy = Some(policy);
        self
    }

    /// Sets the artifact each lane installs before launching the workload.
    pub fn set_artifact(&mut self, artifact: impl Into<Utf8PathBuf>) -> &mut Self {
        self.artifact = Some(artifact.into());
        self
    }

    /// Sets extra arguments passed to every workload.
    pub fn set_launch_args(&mut self, args: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.launch_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an environment variable for every workload.
    pub fn add_launch_env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.launch_env.push((key.into(), value.into()));
        self
    }

    /// Creates a new orchestrator.
    ///
    /// Must be called from within a tokio runtime, since the signal handler
    /// registers with it.
    pub fn build(
        self,
        profile: &SimlaneProfile<'_>,
        signal_handler: SignalHandlerKind,
    ) -> Result<Orchestrator, OrchestratorBuildError> {
        let signal_handler = signal_handler.build()?;
        let (cancel, _) = watch::channel(false);

        Ok(Orchestrator {
            lane_count: self.lanes.unwrap_or_else(|| profile.lanes()).compute(),
            retries: self.retries.unwrap_or_else(|| profile.error_retries()),
            failure_tolerance: self
                .failure_tolerance
                .unwrap_or_else(|| profile.failure_tolerance()),
            only_retry_failed: self
                .only_retry_failed
                .unwrap_or_else(|| profile.only_retry_failed()),
            lane_policy: self.lane_policy.unwrap_or_else(|| profile.lane_policy()),
            artifact: self.artifact,
            launch_args: self.launch_args,
            launch_env: self.launch_env,
            signal_handler,
            signals_done: false,
            cancel: Arc::new(cancel),
        })
    }
}

/// Asks a running [`Orchestrator`] to stop.
#[derive(Clone, Debug)]
pub struct InterruptHandle {
    cancel: Arc<watch::Sender<bool>>,
}

impl InterruptHandle {
    /// Interrupts the run: running workloads are terminated and every
    /// unfinished lane ends as [`Interrupted`](crate::monitor::LaneState::Interrupted).
    pub fn interrupt(&self) {
        self.cancel.send_replace(true);
    }
}

/// Something that happened during a run.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum OrchestratorEvent<'a> {
    /// An attempt started.
    AttemptStarted {
        /// The 1-based attempt.
        attempt: usize,

        /// The packed assignment.
        assignment: &'a Assignment,
    },

    /// The no-split configuration does not fit the universe.
    ConfigurationError {
        /// The 1-based attempt.
        attempt: usize,

        /// The error.
        error: &'a PackError,
    },

    /// A lane changed state.
    LaneStateChanged(LaneStateChange),

    /// A lane finished.
    LaneFinished(&'a LaneReport),

    /// An attempt finished.
    AttemptFinished {
        /// The 1-based attempt.
        attempt: usize,

        /// The attempt's status.
        status: ExitStatus,

        /// How many tests did not pass.
        failing: usize,
    },

    /// Another attempt will start after a delay.
    RetryScheduled {
        /// The 1-based number of the next attempt.
        next_attempt: usize,

        /// The delay.
        delay: Duration,
    },

    /// The run is being interrupted.
    Interrupted {
        /// The signal, if a signal caused the interruption.
        signal: Option<ShutdownEvent>,
    },
}

/// One attempt, summarized.
#[derive(Clone, Debug)]
pub struct AttemptSummary {
    /// The 1-based attempt.
    pub attempt: usize,

    /// The attempt's status.
    pub status: ExitStatus,

    /// The assignment used, unless packing failed.
    pub assignment: Option<Assignment>,

    /// The reports of the lanes that ran, by lane index.
    pub lanes: Vec<LaneReport>,

    /// Tests that did not pass in this attempt.
    pub failing: BTreeSet<TestIdentifier>,

    /// The packing error, if packing failed.
    pub configuration_error: Option<PackError>,
}

/// The result of a whole run.
#[derive(Clone, Debug)]
pub struct RunSummary {
    /// The last attempt's status, which is the run's status.
    pub final_status: ExitStatus,

    /// Every attempt, in order.
    pub attempts: Vec<AttemptSummary>,

    /// Counters accumulated across attempts.
    pub statistics: Statistics,
}

impl RunSummary {
    /// Returns the last attempt, if any ran.
    pub fn last_attempt(&self) -> Option<&AttemptSummary> {
        self.attempts.last()
    }
}

/// Runs a universe of tests across lanes, retrying as configured.
///
/// Created using [`OrchestratorBuilder::build`].
#[derive(Debug)]
pub struct Orchestrator {
    lane_count: NonZeroUsize,
    retries: RetryPolicy,
    failure_tolerance: FailureTolerance,
    only_retry_failed: bool,
    lane_policy: LanePolicy,
    artifact: Option<Utf8PathBuf>,
    launch_args: Vec<String>,
    launch_env: Vec<(String, String)>,
    signal_handler: SignalHandler,
    signals_done: bool,
    cancel: Arc<watch::Sender<bool>>,
}

impl Orchestrator {
    /// Returns the number of lanes requested.
    pub fn lane_count(&self) -> NonZeroUsize {
        self.lane_count
    }

    /// Returns a handle that can interrupt the run.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            cancel: self.cancel.clone(),
        }
    }

    /// Runs the filtered universe to completion.
    ///
    /// The callback is called with each event as it happens. If a lane task
    /// panics, the panic is propagated.
    pub async fn run<S, F>(
        mut self,
        sandbox: Arc<S>,
        universe: &TestUniverse,
        mut callback: F,
    ) -> RunSummary
    where
        S: SimulatorControl,
        F: FnMut(OrchestratorEvent<'_>),
    {
        let statistics = StatisticsHandle::new();
        let tolerance = self.failure_tolerance.resolve(universe.filtered_count());
        let mut retries = RetrySchedule::new(self.retries);
        let mut restricted: Option<TestUniverse> = None;
        let mut attempts: Vec<AttemptSummary> = Vec::new();

        let final_status = loop {
            let attempt = attempts.len() + 1;
            if self.is_cancelled() {
                break ExitStatus::Interrupted;
            }

            statistics.record_attempt();
            let active = restricted.as_ref().unwrap_or(universe);
            let summary = self
                .run_attempt(attempt, &sandbox, active, &statistics, &mut callback)
                .await;
            let status = summary.status;
            callback(OrchestratorEvent::AttemptFinished {
                attempt,
                status,
                failing: summary.failing.len(),
            });
            info!(attempt, %status, failing = summary.failing.len(), "attempt finished");

            let wants_retry = self.wants_retry(status, summary.failing.len(), tolerance);
            let next = if wants_retry { retries.after(attempt) } else { None };
            let failing = summary.failing.clone();
            attempts.push(summary);

            let Some(retry) = next else {
                if wants_retry {
                    debug!(attempt, "no retries left");
                }
                break status;
            };

            statistics.record_retry();
            restricted = (self.only_retry_failed && !failing.is_empty())
                .then(|| universe.restricted_to(failing));
            if !self.wait_for_retry(retry, &mut callback).await {
                break ExitStatus::Interrupted;
            }
        };

        RunSummary {
            final_status,
            attempts,
            statistics: statistics.snapshot(),
        }
    }

    fn wants_retry(&self, status: ExitStatus, failing: usize, tolerance: usize) -> bool {
        match status {
            ExitStatus::TestsFailed if failing > tolerance => {
                info!(
                    failing,
                    tolerance, "more tests failed than tolerated, not retrying"
                );
                false
            }
            ExitStatus::TestsFailed => true,
            status => status.is_retryable(),
        }
    }

    async fn run_attempt<S, F>(
        &mut self,
        attempt: usize,
        sandbox: &Arc<S>,
        universe: &TestUniverse,
        statistics: &StatisticsHandle,
        callback: &mut F,
    ) -> AttemptSummary
    where
        S: SimulatorControl,
        F: FnMut(OrchestratorEvent<'_>),
    {
        let assignment = match pack(universe, self.lane_count) {
            Ok(assignment) => assignment,
            Err(error) => {
                warn!(attempt, %error, "cannot pack tests into lanes");
                callback(OrchestratorEvent::ConfigurationError {
                    attempt,
                    error: &error,
                });
                return AttemptSummary {
                    attempt,
                    status: ExitStatus::ConfigurationError,
                    assignment: None,
                    lanes: Vec::new(),
                    failing: BTreeSet::new(),
                    configuration_error: Some(error),
                };
            }
        };
        info!(
            attempt,
            lanes = assignment.populated_count(),
            tests = assignment.test_count(),
            makespan = assignment.makespan(),
            "starting attempt"
        );
        callback(OrchestratorEvent::AttemptStarted {
            attempt,
            assignment: &assignment,
        });

        let assignment = Arc::new(assignment);
        let (events_sender, mut events) = mpsc::unbounded_channel();
        let mut lanes = JoinSet::new();
        for lane in assignment.populated() {
            let cx = LaneContext {
                sandbox: sandbox.clone(),
                assignment: assignment.clone(),
                policy: self.lane_policy,
                attempt,
                artifact: self.artifact.clone(),
                launch_args: self.launch_args.clone(),
                launch_env: self.launch_env.clone(),
                cancel: self.cancel.subscribe(),
                events: events_sender.clone(),
            };
            lanes.spawn(run_lane(cx, lane.index()));
        }
        drop(events_sender);

        let mut reports = Vec::new();
        let mut events_done = false;
        while !(lanes.is_empty() && events_done) {
            tokio::select! {
                biased;

                event = events.recv(), if !events_done => match event {
                    Some(event) => callback(OrchestratorEvent::LaneStateChanged(event)),
                    None => events_done = true,
                },
                joined = lanes.join_next(), if !lanes.is_empty() => match joined {
                    Some(Ok(report)) => {
                        statistics.record_lane(&report);
                        callback(OrchestratorEvent::LaneFinished(&report));
                        reports.push(report);
                    }
                    Some(Err(join_error)) => {
                        if join_error.is_panic() {
                            std::panic::resume_unwind(join_error.into_panic());
                        }
                    }
                    None => {}
                },
                signal = self.signal_handler.recv(), if !self.signals_done => match signal {
                    Some(signal) => self.interrupt(Some(signal), callback),
                    None => self.signals_done = true,
                },
            }
        }

        reports.sort_by_key(|report| report.lane);
        let status = ExitStatus::aggregate(reports.iter().map(|report| report.status));
        let failing = reports
            .iter()
            .flat_map(|report| report.failing.iter().cloned())
            .collect();
        let assignment = Arc::try_unwrap(assignment).unwrap_or_else(|shared| (*shared).clone());

        AttemptSummary {
            attempt,
            status,
            assignment: Some(assignment),
            lanes: reports,
            failing,
            configuration_error: None,
        }
    }

    /// Announces `retry` and waits out its delay. Returns false if the run was
    /// interrupted meanwhile.
    async fn wait_for_retry<F>(&mut self, retry: ScheduledRetry, callback: &mut F) -> bool
    where
        F: FnMut(OrchestratorEvent<'_>),
    {
        let ScheduledRetry {
            next_attempt,
            delay,
        } = retry;
        if delay.is_zero() {
            return !self.is_cancelled();
        }
        callback(OrchestratorEvent::RetryScheduled {
            next_attempt,
            delay,
        });
        debug!(next_attempt, ?delay, "waiting before retrying");

        let mut cancel = self.cancel.subscribe();
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return true,
                () = cancelled(&mut cancel) => return false,
                signal = self.signal_handler.recv(), if !self.signals_done => match signal {
                    Some(signal) => {
                        self.interrupt(Some(signal), callback);
                        return false;
                    }
                    None => self.signals_done = true,
                },
            }
        }
    }

    fn interrupt<F>(&self, signal: Option<ShutdownEvent>, callback: &mut F)
    where
        F: FnMut(OrchestratorEvent<'_>),
    {
        if self.is_cancelled() {
            return;
        }
        match signal {
            Some(signal) => warn!(%signal, "signal received, interrupting run"),
            None => warn!("interrupting run"),
        }
        self.cancel.send_replace(true);
        callback(OrchestratorEvent::Interrupted { signal });
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}
