// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use bytes::Bytes;
use camino::Utf8Path;
use debug_ignore::DebugIgnore;
use futures::{
    FutureExt, StreamExt,
    channel::{mpsc, oneshot},
};
use itertools::Itertools;
use simlane_metadata::TestIdentifier;
use simlane_runner::{
    config::{LaneCount, SandboxPolicy, SimlaneConfig, StepPolicy},
    monitor::WatchdogIntervals,
    runner::{LanePolicy, Orchestrator, OrchestratorBuilder},
    sandbox::{BoxedSandboxError, LaunchRequest, LaunchedWorkload, SimulatorControl, WorkloadExit},
    signal::SignalHandlerKind,
    universe::TestUniverse,
};
use std::{
    collections::BTreeSet,
    fmt::Write,
    io,
    num::NonZeroUsize,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

pub(crate) const NO_OUTPUT_TIMEOUT: Duration = Duration::from_secs(60);
pub(crate) const MAX_EXECUTION_TIMEOUT: Duration = Duration::from_secs(600);

pub(crate) fn id(s: &str) -> TestIdentifier {
    s.parse().expect("valid test identifier")
}

pub(crate) fn ids(tests: &[&str]) -> BTreeSet<TestIdentifier> {
    tests.iter().map(|s| id(s)).collect()
}

pub(crate) fn universe(tests: &[&str]) -> TestUniverse {
    TestUniverse::new(tests.iter().map(|s| id(s))).expect("no duplicate tests")
}

pub(crate) fn lane_policy() -> LanePolicy {
    let step = StepPolicy::once(Duration::from_secs(60));
    LanePolicy {
        watchdogs: WatchdogIntervals {
            no_output: NO_OUTPUT_TIMEOUT,
            max_execution: MAX_EXECUTION_TIMEOUT,
        },
        termination_grace: Duration::from_secs(5),
        sandbox: SandboxPolicy {
            create: step,
            boot: step,
            install: step,
            launch: step,
            delete_timeout: Duration::from_secs(60),
            keep_instances: false,
        },
    }
}

/// Builds an orchestrator on top of the default profile, with two lanes and
/// the test lane policy.
pub(crate) fn orchestrator(configure: impl FnOnce(&mut OrchestratorBuilder)) -> Orchestrator {
    let config = SimlaneConfig::default_config();
    let profile = config
        .profile(SimlaneConfig::DEFAULT_PROFILE)
        .expect("default profile exists");
    let mut builder = OrchestratorBuilder::default();
    builder
        .set_lanes(LaneCount::Count(NonZeroUsize::new(2).expect("2 is non-zero")))
        .set_lane_policy(lane_policy());
    configure(&mut builder);
    builder
        .build(&profile, SignalHandlerKind::Noop)
        .expect("orchestrator built")
}

/// What a fake workload does once launched.
#[derive(Clone, Debug)]
pub(crate) enum Behavior {
    /// Reports a result for every test. The listed tests fail.
    Report { failing: BTreeSet<TestIdentifier> },

    /// Prints nothing until terminated.
    Silent,

    /// Starts its first test, then dies with SIGSEGV.
    Crash,
}

impl Behavior {
    pub(crate) fn pass() -> Self {
        Self::Report {
            failing: BTreeSet::new(),
        }
    }
}

type Script = Box<dyn Fn(&LaunchRequest) -> Behavior + Send + Sync>;

#[derive(Debug, Default)]
pub(crate) struct FakeLog {
    pub(crate) launches: Vec<LaunchRequest>,
    pub(crate) terminations: usize,
    pub(crate) deletions: usize,
}

/// A sandbox whose workloads follow a script instead of running anything.
pub(crate) struct FakeSimulator {
    script: Script,
    failing_creates: AtomicUsize,
    log: Mutex<FakeLog>,
}

impl FakeSimulator {
    pub(crate) fn new(script: impl Fn(&LaunchRequest) -> Behavior + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            failing_creates: AtomicUsize::new(0),
            log: Mutex::new(FakeLog::default()),
        }
    }

    /// Makes the next `count` instance creations fail.
    pub(crate) fn fail_creates(self, count: usize) -> Self {
        self.failing_creates.store(count, Ordering::SeqCst);
        self
    }

    pub(crate) fn log(&self) -> MutexGuard<'_, FakeLog> {
        self.log.lock().expect("log lock not poisoned")
    }
}

struct Running {
    output: mpsc::UnboundedSender<io::Result<Bytes>>,
    exit: oneshot::Sender<WorkloadExit>,
}

pub(crate) struct FakeInstance {
    running: Mutex<Option<Running>>,
}

impl SimulatorControl for FakeSimulator {
    type Instance = FakeInstance;

    async fn create_instance(&self, _lane: usize) -> Result<FakeInstance, BoxedSandboxError> {
        let fail = self
            .failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err("no capacity for another instance".into());
        }
        Ok(FakeInstance {
            running: Mutex::new(None),
        })
    }

    async fn boot_instance(&self, _instance: &FakeInstance) -> Result<(), BoxedSandboxError> {
        Ok(())
    }

    async fn install_workload(
        &self,
        _instance: &FakeInstance,
        _artifact: &Utf8Path,
    ) -> Result<(), BoxedSandboxError> {
        Ok(())
    }

    async fn launch_workload(
        &self,
        instance: &FakeInstance,
        request: &LaunchRequest,
    ) -> Result<LaunchedWorkload, BoxedSandboxError> {
        let behavior = (self.script)(request);
        self.log().launches.push(request.clone());

        let (output, output_receiver) = mpsc::unbounded::<io::Result<Bytes>>();
        let (exit, exit_receiver) = oneshot::channel::<WorkloadExit>();
        match behavior {
            Behavior::Report { failing } => {
                let _ = output.unbounded_send(Ok(xctest_output(&request.tests, &failing).into()));
                let code = i32::from(request.tests.iter().any(|test| failing.contains(test)));
                let _ = exit.send(WorkloadExit::Exited(code));
            }
            Behavior::Silent => {
                *instance.running.lock().expect("lock not poisoned") =
                    Some(Running { output, exit });
            }
            Behavior::Crash => {
                if let Some(first) = request.tests.first() {
                    let text = format!(
                        "Test Suite '{suite}' started at 2024-03-01 10:15:42.000\n\
                         Test Case '-[{suite} {case}]' started.\n",
                        suite = first.suite(),
                        case = first.case(),
                    );
                    let _ = output.unbounded_send(Ok(text.into()));
                }
                let _ = exit.send(WorkloadExit::Signaled(11));
            }
        }

        Ok(LaunchedWorkload {
            pid: None,
            output: DebugIgnore(output_receiver.boxed()),
            exit: DebugIgnore(
                exit_receiver
                    .map(|exit| {
                        exit.unwrap_or_else(|_| WorkloadExit::Lost("fake workload dropped".to_owned()))
                    })
                    .boxed(),
            ),
        })
    }

    fn terminate_instance(&self, instance: &FakeInstance) {
        self.log().terminations += 1;
        if let Some(running) = instance.running.lock().expect("lock not poisoned").take() {
            drop(running.output);
            let _ = running.exit.send(WorkloadExit::Signaled(15));
        }
    }

    async fn delete_instance(&self, _instance: FakeInstance) -> Result<(), BoxedSandboxError> {
        self.log().deletions += 1;
        Ok(())
    }
}

/// Renders XCTest console output for `tests`, failing the tests in `failing`.
pub(crate) fn xctest_output(tests: &[TestIdentifier], failing: &BTreeSet<TestIdentifier>) -> String {
    let mut out = String::new();
    for (suite, cases) in &tests.iter().chunk_by(|test| test.suite()) {
        let cases: Vec<_> = cases.collect();
        let failures = cases.iter().filter(|test| failing.contains(**test)).count();
        writeln!(out, "Test Suite '{suite}' started at 2024-03-01 10:15:42.000").unwrap();
        for test in &cases {
            let case = test.case();
            writeln!(out, "Test Case '-[{suite} {case}]' started.").unwrap();
            if failing.contains(*test) {
                writeln!(out, "/src/{suite}.m:10: error: -[{suite} {case}] : expected failure")
                    .unwrap();
                writeln!(out, "Test Case '-[{suite} {case}]' failed (0.010 seconds).").unwrap();
            } else {
                writeln!(out, "Test Case '-[{suite} {case}]' passed (0.010 seconds).").unwrap();
            }
        }
        let status = if failures > 0 { "failed" } else { "passed" };
        writeln!(out, "Test Suite '{suite}' {status} at 2024-03-01 10:15:43.000.").unwrap();
        writeln!(
            out,
            "     Executed {} test{}, with {failures} failure{} (0 unexpected) in 0.010 (0.011) seconds",
            cases.len(),
            if cases.len() == 1 { "" } else { "s" },
            if failures == 1 { "" } else { "s" },
        )
        .unwrap();
    }
    out
}
