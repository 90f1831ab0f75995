// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{ExitStatus, LanePolicy};
use crate::{
    config::StepPolicy,
    errors::{DisplayErrorChain, SandboxError, SandboxStep},
    monitor::{CrashCause, LaneMonitor, LaneState, MonitorAction, WatchdogKind},
    parser::{OutputStreamParser, Outcome, ResultTree},
    partition::Assignment,
    sandbox::{BoxedSandboxError, LaunchRequest, SimulatorControl, WorkloadExit},
    statistics::{Phase, PhaseTiming},
    time::{far_future_duration, stopwatch},
};
use camino::Utf8PathBuf;
use futures::StreamExt;
use serde::Serialize;
use simlane_metadata::TestIdentifier;
use std::{collections::BTreeSet, future::Future, sync::Arc};
use tokio::{
    sync::{mpsc::UnboundedSender, watch},
    time::Instant,
};
use tracing::{debug, instrument, warn};

/// Everything a lane reports once it is done.
#[derive(Clone, Debug, Serialize)]
pub struct LaneReport {
    /// The 1-based attempt.
    pub attempt: usize,

    /// The lane index.
    pub lane: usize,

    /// The tests assigned to the lane.
    pub tests: Vec<TestIdentifier>,

    /// The terminal state.
    pub state: LaneState,

    /// The lane's status.
    pub status: ExitStatus,

    /// Why the lane crashed, if it did.
    pub crash: Option<CrashCause>,

    /// Which watchdog fired, if one did.
    pub timed_out_by: Option<WatchdogKind>,

    /// How the workload exited, if it was launched and its exit was observed.
    pub exit: Option<WorkloadExit>,

    /// Assigned tests that did not pass, including tests that never reported
    /// a result.
    pub failing: BTreeSet<TestIdentifier>,

    /// The parsed output.
    pub tree: ResultTree,

    /// How long each phase took.
    pub phases: Vec<PhaseTiming>,

    /// The error from deleting the instance, if deletion failed.
    pub delete_error: Option<String>,
}

/// A lane changed state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LaneStateChange {
    /// The 1-based attempt.
    pub attempt: usize,

    /// The lane index.
    pub lane: usize,

    /// The new state.
    pub state: LaneState,
}

/// What a lane task needs, shared by every lane of an attempt.
pub(super) struct LaneContext<S> {
    pub(super) sandbox: Arc<S>,
    pub(super) assignment: Arc<Assignment>,
    pub(super) policy: LanePolicy,
    pub(super) attempt: usize,
    pub(super) artifact: Option<Utf8PathBuf>,
    pub(super) launch_args: Vec<String>,
    pub(super) launch_env: Vec<(String, String)>,
    pub(super) cancel: watch::Receiver<bool>,
    pub(super) events: UnboundedSender<LaneStateChange>,
}

enum StepOutcome<T> {
    Done(T),
    Failed(SandboxError),
    Cancelled,
}

struct LaneRun<'a, S: SimulatorControl> {
    cx: &'a mut LaneContext<S>,
    lane: usize,
    monitor: LaneMonitor,
    reported_state: LaneState,
    phases: Vec<PhaseTiming>,
}

#[instrument(level = "debug", skip_all, fields(attempt = cx.attempt, lane = lane))]
pub(super) async fn run_lane<S: SimulatorControl>(mut cx: LaneContext<S>, lane: usize) -> LaneReport {
    let tests = cx
        .assignment
        .lanes()
        .get(lane)
        .map(|assigned| assigned.tests().to_vec())
        .unwrap_or_default();
    let watchdogs = cx.policy.watchdogs;
    let attempt = cx.attempt;

    let mut run = LaneRun {
        cx: &mut cx,
        lane,
        monitor: LaneMonitor::new(lane, watchdogs),
        reported_state: LaneState::Idle,
        phases: Vec::new(),
    };
    let (tree, delete_error) = run.execute(&tests).await;
    let LaneRun {
        monitor, phases, ..
    } = run;

    let outcomes = tree.test_outcomes();
    let failing: BTreeSet<_> = tests
        .iter()
        .filter(|test| outcomes.get(*test) != Some(&Outcome::Passed))
        .cloned()
        .collect();
    let status = ExitStatus::for_lane(monitor.state(), monitor.crash_cause(), !failing.is_empty());
    debug!(state = %monitor.state(), %status, failing = failing.len(), "lane finished");

    LaneReport {
        attempt,
        lane,
        tests,
        state: monitor.state(),
        status,
        crash: monitor.crash_cause().cloned(),
        timed_out_by: monitor.timed_out_by(),
        exit: monitor.exit().cloned(),
        failing,
        tree,
        phases,
        delete_error,
    }
}

impl<S: SimulatorControl> LaneRun<'_, S> {
    async fn execute(&mut self, tests: &[TestIdentifier]) -> (ResultTree, Option<String>) {
        self.monitor.on_boot_requested();
        self.report_state();

        let sandbox = self.cx.sandbox.clone();
        let lane = self.lane;
        let instance = match self
            .run_step(SandboxStep::Create, || sandbox.create_instance(lane))
            .await
        {
            Some(instance) => instance,
            None => return (ResultTree::default(), None),
        };

        let tree = self.prepare_and_run(&instance, tests).await;
        let delete_error = self.delete(instance).await;
        (tree, delete_error)
    }

    async fn prepare_and_run(
        &mut self,
        instance: &S::Instance,
        tests: &[TestIdentifier],
    ) -> ResultTree {
        let sandbox = self.cx.sandbox.clone();
        if self
            .run_step(SandboxStep::Boot, || sandbox.boot_instance(instance))
            .await
            .is_none()
        {
            return ResultTree::default();
        }

        if let Some(artifact) = self.cx.artifact.clone() {
            if self
                .run_step(SandboxStep::Install, || {
                    sandbox.install_workload(instance, &artifact)
                })
                .await
                .is_none()
            {
                return ResultTree::default();
            }
        } else {
            debug!("no artifact to install");
        }

        let request = LaunchRequest {
            lane: self.lane,
            attempt: self.cx.attempt,
            tests: tests.to_vec(),
            args: self.cx.launch_args.clone(),
            env: self.cx.launch_env.clone(),
        };
        let Some(workload) = self
            .run_step(SandboxStep::Launch, || {
                sandbox.launch_workload(instance, &request)
            })
            .await
        else {
            return ResultTree::default();
        };

        debug!(pid = ?workload.pid, "workload launched");
        self.monitor.on_launched();
        self.report_state();

        let watch = stopwatch();
        let tree = self
            .supervise(instance, workload.output.0, workload.exit.0)
            .await;
        let snapshot = watch.snapshot();
        self.phases.push(PhaseTiming {
            attempt: self.cx.attempt,
            lane: self.lane,
            phase: Phase::Execute,
            start_time: snapshot.start_time,
            duration: snapshot.duration,
            tries: 1,
            error: self.monitor.crash_cause().map(ToString::to_string),
        });
        tree
    }

    /// Feeds output to the parser and monitor until the workload has exited
    /// and its output has ended, or the lane has given up on it.
    async fn supervise(
        &mut self,
        instance: &S::Instance,
        mut output: futures::stream::BoxStream<'static, std::io::Result<bytes::Bytes>>,
        mut exit: futures::future::BoxFuture<'static, WorkloadExit>,
    ) -> ResultTree {
        let mut parser = OutputStreamParser::new();
        let mut output_done = false;
        let mut exited = false;
        // Set once the lane is terminal or the workload has exited: the
        // remaining output gets this long to drain.
        let mut drain_deadline: Option<Instant> = None;
        let far_future = Instant::now() + far_future_duration();

        loop {
            if output_done && exited {
                break;
            }
            if drain_deadline.is_none() && (exited || self.monitor.state().is_terminal()) {
                drain_deadline = Some(Instant::now() + self.cx.policy.termination_grace);
            }
            let watchdog = self.monitor.next_deadline();
            let terminal = self.monitor.state().is_terminal();

            tokio::select! {
                biased;

                () = cancelled(&mut self.cx.cancel), if !terminal => {
                    if let Some(MonitorAction::TerminateWorkload) = self.monitor.on_interrupt() {
                        self.cx.sandbox.terminate_instance(instance);
                    }
                    self.report_state();
                }
                chunk = output.next(), if !output_done => match chunk {
                    Some(Ok(bytes)) => {
                        self.monitor.on_output_received();
                        parser.feed(&bytes, &mut self.monitor);
                        self.report_state();
                    }
                    Some(Err(error)) => {
                        warn!(%error, "error reading workload output");
                    }
                    None => {
                        output_done = true;
                        let summary = parser.close(&mut self.monitor);
                        self.monitor.on_stream_closed(summary);
                        self.report_state();
                    }
                },
                status = &mut exit, if !exited => {
                    exited = true;
                    debug!(exit = %status, "workload exited");
                    self.monitor.on_process_exit(&status);
                    self.report_state();
                }
                () = tokio::time::sleep_until(watchdog.map_or(far_future, |(deadline, _)| deadline)), if watchdog.is_some() => {
                    if let Some((_, kind)) = watchdog {
                        warn!(watchdog = %kind, "watchdog fired, terminating workload");
                        if let Some(MonitorAction::TerminateWorkload) = self.monitor.on_watchdog_fired(kind) {
                            self.cx.sandbox.terminate_instance(instance);
                        }
                        self.report_state();
                    }
                }
                () = tokio::time::sleep_until(drain_deadline.unwrap_or(far_future)), if drain_deadline.is_some() => {
                    if !exited {
                        warn!("workload did not exit after termination");
                    } else {
                        debug!("workload output did not end after exit");
                    }
                    break;
                }
            }
        }

        if !output_done {
            let summary = parser.close(&mut self.monitor);
            self.monitor.on_stream_closed(summary);
        }
        if !self.monitor.state().is_terminal() {
            self.monitor
                .on_process_exit(&WorkloadExit::Lost("workload did not exit".to_owned()));
        }
        self.report_state();
        parser.into_tree()
    }

    /// Runs a sandbox step with its retry and timeout policy. Returns `None`
    /// if the lane is done, having recorded why.
    async fn run_step<T, F, Fut>(&mut self, step: SandboxStep, mut f: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BoxedSandboxError>>,
    {
        let policy: StepPolicy = self.cx.policy.sandbox.step(step);
        let watch = stopwatch();
        let mut tries = 0;

        let outcome = loop {
            tries += 1;
            let result = tokio::select! {
                biased;

                () = cancelled(&mut self.cx.cancel) => break StepOutcome::Cancelled,
                result = tokio::time::timeout(policy.timeout, f()) => result,
            };
            let error = match result {
                Ok(Ok(value)) => break StepOutcome::Done(value),
                Ok(Err(error)) => SandboxError::new(step, error),
                Err(_) => SandboxError::timed_out(step, policy.timeout),
            };
            if tries >= policy.max_tries.get() {
                break StepOutcome::Failed(error);
            }
            warn!(
                %step,
                tries,
                error = %DisplayErrorChain::new(&error),
                "sandbox step failed, trying again",
            );
        };

        let snapshot = watch.snapshot();
        let mut timing = PhaseTiming {
            attempt: self.cx.attempt,
            lane: self.lane,
            phase: phase_for(step),
            start_time: snapshot.start_time,
            duration: snapshot.duration,
            tries,
            error: None,
        };

        match outcome {
            StepOutcome::Done(value) => {
                self.phases.push(timing);
                Some(value)
            }
            StepOutcome::Failed(error) => {
                warn!(error = %DisplayErrorChain::new(&error), "sandbox step failed");
                timing.error = Some(DisplayErrorChain::new(&error).to_string());
                self.phases.push(timing);
                self.monitor.on_setup_failed(&error);
                self.report_state();
                None
            }
            StepOutcome::Cancelled => {
                timing.error = Some("interrupted".to_owned());
                self.phases.push(timing);
                // Nothing is running yet, so there is nothing to terminate.
                let _ = self.monitor.on_interrupt();
                self.report_state();
                None
            }
        }
    }

    async fn delete(&mut self, instance: S::Instance) -> Option<String> {
        let policy = self.cx.policy.sandbox;
        if policy.keep_instances {
            debug!("keeping instance");
            return None;
        }

        let watch = stopwatch();
        let result =
            tokio::time::timeout(policy.delete_timeout, self.cx.sandbox.delete_instance(instance))
                .await;
        let error = match result {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(SandboxError::new(SandboxStep::Delete, error)),
            Err(_) => Some(SandboxError::timed_out(
                SandboxStep::Delete,
                policy.delete_timeout,
            )),
        }
        .map(|error| DisplayErrorChain::new(&error).to_string());
        if let Some(error) = &error {
            warn!(%error, "error deleting instance");
        }

        let snapshot = watch.snapshot();
        self.phases.push(PhaseTiming {
            attempt: self.cx.attempt,
            lane: self.lane,
            phase: Phase::Delete,
            start_time: snapshot.start_time,
            duration: snapshot.duration,
            tries: 1,
            error: error.clone(),
        });
        error
    }

    fn report_state(&mut self) {
        let state = self.monitor.state();
        if state != self.reported_state {
            self.reported_state = state;
            // The orchestrator may have stopped listening.
            let _ = self.cx.events.send(LaneStateChange {
                attempt: self.cx.attempt,
                lane: self.lane,
                state,
            });
        }
    }
}

fn phase_for(step: SandboxStep) -> Phase {
    match step {
        SandboxStep::Create => Phase::Create,
        SandboxStep::Boot => Phase::Boot,
        SandboxStep::Install => Phase::Install,
        SandboxStep::Launch => Phase::Launch,
        SandboxStep::Delete => Phase::Delete,
    }
}

/// Resolves once the run is cancelled. Never resolves if the sender is gone.
pub(super) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let is_cancelled = cancel.wait_for(|&cancelled| cancelled).await.is_ok();
    if !is_cancelled {
        std::future::pending::<()>().await;
    }
}
