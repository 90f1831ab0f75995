// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use pretty_assertions::assert_eq;
use simlane_runner::{
    config::{FailureTolerance, LaneCount, RetryPolicy},
    errors::PackError,
    monitor::{CrashCause, LaneState, WatchdogKind},
    runner::{ExitStatus, LaneStateChange, OrchestratorEvent},
    sandbox::WorkloadExit,
    universe::{NoSplitGroup, TestSelector},
};
use std::{collections::BTreeSet, num::NonZeroUsize, sync::Arc, time::Duration};
use tokio::time::Instant;

const TESTS: &[&str] = &["A/t1", "A/t2", "B/t1", "B/t2"];

fn one_lane() -> LaneCount {
    LaneCount::Count(NonZeroUsize::MIN)
}

#[tokio::test(start_paused = true)]
async fn all_lanes_pass() {
    let sandbox = Arc::new(FakeSimulator::new(|_| Behavior::pass()));
    let orchestrator = orchestrator(|_| {});

    let mut changes: Vec<LaneStateChange> = Vec::new();
    let summary = orchestrator
        .run(sandbox.clone(), &universe(TESTS), |event| {
            if let OrchestratorEvent::LaneStateChanged(change) = event {
                changes.push(change);
            }
        })
        .await;

    assert_eq!(summary.final_status, ExitStatus::AllPassed);
    assert_eq!(summary.attempts.len(), 1);
    let attempt = &summary.attempts[0];
    assert_eq!(attempt.lanes.len(), 2);
    assert!(attempt.failing.is_empty());
    for report in &attempt.lanes {
        assert_eq!(report.state, LaneState::Completed);
        assert_eq!(report.exit, Some(WorkloadExit::Exited(0)));
        assert!(report.tree.anomalies().is_empty());
    }

    let lane0: Vec<_> = changes
        .iter()
        .filter(|change| change.lane == 0)
        .map(|change| change.state)
        .collect();
    assert_eq!(
        lane0,
        [
            LaneState::Launching,
            LaneState::AppLaunched,
            LaneState::TestsRunning,
            LaneState::Completed,
        ]
    );

    let log = sandbox.log();
    let launched: BTreeSet<_> = log
        .launches
        .iter()
        .flat_map(|request| request.tests.iter().cloned())
        .collect();
    assert_eq!(launched, ids(TESTS));
    assert_eq!(log.deletions, 2);
    assert_eq!(log.terminations, 0);

    let stats = &summary.statistics;
    assert_eq!(stats.attempts, 1);
    assert_eq!(stats.retries, 0);
    assert_eq!(stats.tests_run, 4);
    assert_eq!(stats.passed, 4);
    assert_eq!(stats.infrastructure.total(), 0);
    assert_eq!(stats.count_mismatches, 0);
}

#[tokio::test(start_paused = true)]
async fn silent_workload_times_out() {
    let sandbox = Arc::new(FakeSimulator::new(|_| Behavior::Silent));
    let orchestrator = orchestrator(|builder| {
        builder.set_lanes(one_lane());
    });

    let start = Instant::now();
    let summary = orchestrator
        .run(sandbox.clone(), &universe(TESTS), |_| {})
        .await;

    assert!(start.elapsed() >= NO_OUTPUT_TIMEOUT);
    assert_eq!(summary.final_status, ExitStatus::TestTimeout);
    let report = &summary.attempts[0].lanes[0];
    assert_eq!(report.state, LaneState::TimedOut);
    assert_eq!(report.timed_out_by, Some(WatchdogKind::NoOutput));
    assert_eq!(report.exit, Some(WorkloadExit::Signaled(15)));
    assert_eq!(report.failing, ids(TESTS));
    assert_eq!(sandbox.log().terminations, 1);

    let stats = &summary.statistics;
    assert_eq!(stats.timeouts.no_output, 1);
    assert_eq!(stats.timeouts.max_execution, 0);
    assert_eq!(stats.tests_run, 0);
}

#[tokio::test(start_paused = true)]
async fn timeout_is_retried() {
    let sandbox = Arc::new(FakeSimulator::new(|request| {
        if request.attempt == 1 {
            Behavior::Silent
        } else {
            Behavior::pass()
        }
    }));
    let orchestrator = orchestrator(|builder| {
        builder.set_retries(RetryPolicy::immediate(1));
    });

    let summary = orchestrator
        .run(sandbox.clone(), &universe(TESTS), |_| {})
        .await;

    assert_eq!(summary.final_status, ExitStatus::AllPassed);
    let statuses: Vec<_> = summary.attempts.iter().map(|a| a.status).collect();
    assert_eq!(statuses, [ExitStatus::TestTimeout, ExitStatus::AllPassed]);
    assert_eq!(summary.statistics.retries, 1);
    assert_eq!(summary.statistics.timeouts.no_output, 2);
}

#[tokio::test(start_paused = true)]
async fn infrastructure_failures_are_retried() {
    let sandbox = Arc::new(FakeSimulator::new(|_| Behavior::pass()).fail_creates(2));
    let orchestrator = orchestrator(|builder| {
        builder
            .set_lanes(one_lane())
            .set_retries(RetryPolicy::immediate(2));
    });

    let summary = orchestrator
        .run(sandbox.clone(), &universe(TESTS), |_| {})
        .await;

    assert_eq!(summary.final_status, ExitStatus::AllPassed);
    let statuses: Vec<_> = summary.attempts.iter().map(|a| a.status).collect();
    assert_eq!(
        statuses,
        [
            ExitStatus::SimulatorCreationFailed,
            ExitStatus::SimulatorCreationFailed,
            ExitStatus::AllPassed,
        ]
    );
    let crash = summary.attempts[0].lanes[0].crash.as_ref();
    assert!(
        matches!(crash, Some(CrashCause::Setup { message, .. }) if message.contains("no capacity")),
        "unexpected crash cause: {crash:?}"
    );

    let stats = &summary.statistics;
    assert_eq!(stats.attempts, 3);
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.infrastructure.create_failures, 2);
    assert_eq!(stats.tests_run, 4);

    let log = sandbox.log();
    assert_eq!(log.launches.len(), 1);
    // Instances that were never created are not deleted.
    assert_eq!(log.deletions, 1);
}

#[tokio::test(start_paused = true)]
async fn retries_run_out() {
    let sandbox = Arc::new(FakeSimulator::new(|_| Behavior::pass()).fail_creates(10));
    let orchestrator = orchestrator(|builder| {
        builder
            .set_lanes(one_lane())
            .set_retries(RetryPolicy::immediate(1));
    });

    let summary = orchestrator.run(sandbox, &universe(TESTS), |_| {}).await;

    assert_eq!(summary.final_status, ExitStatus::SimulatorCreationFailed);
    assert_eq!(summary.attempts.len(), 2);
    assert_eq!(summary.statistics.retries, 1);
    assert_eq!(summary.final_status.exit_code(), 2);
}

#[tokio::test(start_paused = true)]
async fn workload_crash() {
    let sandbox = Arc::new(FakeSimulator::new(|_| Behavior::Crash));
    let orchestrator = orchestrator(|builder| {
        builder.set_lanes(one_lane());
    });

    let summary = orchestrator.run(sandbox, &universe(TESTS), |_| {}).await;

    assert_eq!(summary.final_status, ExitStatus::AppCrashed);
    let report = &summary.attempts[0].lanes[0];
    assert_eq!(report.state, LaneState::Crashed);
    assert_eq!(
        report.crash,
        Some(CrashCause::AbnormalExit {
            exit: WorkloadExit::Signaled(11)
        })
    );
    // The interrupted case is closed as errored; the rest never ran.
    assert_eq!(report.failing, ids(TESTS));
    assert_eq!(report.tree.totals().errors, 1);
    assert_eq!(summary.statistics.infrastructure.app_crashes, 1);
}

#[tokio::test(start_paused = true)]
async fn failures_beyond_tolerance_stop_the_run() {
    let sandbox = Arc::new(FakeSimulator::new(|_| Behavior::Report {
        failing: ids(&["A/t2", "B/t1"]),
    }));
    let orchestrator = orchestrator(|builder| {
        builder
            .set_retries(RetryPolicy::immediate(3))
            .set_failure_tolerance(FailureTolerance::Count(1));
    });

    let summary = orchestrator.run(sandbox, &universe(TESTS), |_| {}).await;

    assert_eq!(summary.final_status, ExitStatus::TestsFailed);
    assert_eq!(summary.attempts.len(), 1);
    assert_eq!(summary.attempts[0].failing, ids(&["A/t2", "B/t1"]));
    assert_eq!(summary.statistics.retries, 0);
    assert_eq!(summary.statistics.failures, 2);
    assert_eq!(summary.statistics.passed, 2);
}

#[tokio::test(start_paused = true)]
async fn only_failed_tests_are_retried() {
    let sandbox = Arc::new(FakeSimulator::new(|request| {
        if request.attempt == 1 {
            Behavior::Report {
                failing: ids(&["A/t2"]),
            }
        } else {
            Behavior::pass()
        }
    }));
    let orchestrator = orchestrator(|builder| {
        builder
            .set_retries(RetryPolicy::immediate(1))
            .set_failure_tolerance(FailureTolerance::Count(1))
            .set_only_retry_failed(true);
    });

    let summary = orchestrator
        .run(sandbox.clone(), &universe(TESTS), |_| {})
        .await;

    assert_eq!(summary.final_status, ExitStatus::AllPassed);
    assert_eq!(summary.attempts.len(), 2);
    let second = summary.attempts[1]
        .assignment
        .as_ref()
        .expect("second attempt was packed");
    assert_eq!(second.test_count(), 1);
    assert_eq!(second.populated_count(), 1);

    let log = sandbox.log();
    let retried: Vec<_> = log
        .launches
        .iter()
        .filter(|request| request.attempt == 2)
        .flat_map(|request| request.tests.iter().cloned())
        .collect();
    assert_eq!(retried, [id("A/t2")]);
    assert_eq!(summary.statistics.tests_run, 5);
}

#[tokio::test(start_paused = true)]
async fn failing_tests_within_tolerance_rerun_everything() {
    let sandbox = Arc::new(FakeSimulator::new(|request| {
        if request.attempt == 1 {
            Behavior::Report {
                failing: ids(&["B/t2"]),
            }
        } else {
            Behavior::pass()
        }
    }));
    let orchestrator = orchestrator(|builder| {
        builder
            .set_retries(RetryPolicy::immediate(1))
            .set_failure_tolerance(FailureTolerance::Percent(25.0));
    });

    let summary = orchestrator
        .run(sandbox.clone(), &universe(TESTS), |_| {})
        .await;

    assert_eq!(summary.final_status, ExitStatus::AllPassed);
    assert_eq!(summary.statistics.tests_run, 8);
}

#[tokio::test(start_paused = true)]
async fn unknown_no_split_member_is_a_configuration_error() {
    let sandbox = Arc::new(FakeSimulator::new(|_| Behavior::pass()));
    let orchestrator = orchestrator(|builder| {
        builder.set_retries(RetryPolicy::immediate(3));
    });
    let selector: TestSelector = "Missing/t1".parse().expect("valid selector");
    let universe =
        universe(TESTS).with_no_split_groups(vec![NoSplitGroup::new("login", vec![selector])]);

    let mut reported = Vec::new();
    let summary = orchestrator
        .run(sandbox.clone(), &universe, |event| {
            if let OrchestratorEvent::ConfigurationError { error, .. } = event {
                reported.push(error.clone());
            }
        })
        .await;

    assert_eq!(summary.final_status, ExitStatus::ConfigurationError);
    assert_eq!(summary.attempts.len(), 1);
    assert!(summary.attempts[0].assignment.is_none());
    let expected = PackError::UnknownNoSplitMember {
        group: "login".to_owned(),
        entry: "Missing/t1".to_owned(),
    };
    assert_eq!(summary.attempts[0].configuration_error, Some(expected.clone()));
    assert_eq!(reported, [expected]);
    assert!(sandbox.log().launches.is_empty());
    assert_eq!(summary.statistics.retries, 0);
}

#[tokio::test(start_paused = true)]
async fn interrupt_terminates_running_lanes() {
    let sandbox = Arc::new(FakeSimulator::new(|_| Behavior::Silent));
    let orchestrator = orchestrator(|builder| {
        builder.set_retries(RetryPolicy::immediate(3));
    });
    let handle = orchestrator.interrupt_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        handle.interrupt();
    });

    let start = Instant::now();
    let summary = orchestrator
        .run(sandbox.clone(), &universe(TESTS), |_| {})
        .await;

    assert!(start.elapsed() < NO_OUTPUT_TIMEOUT);
    assert_eq!(summary.final_status, ExitStatus::Interrupted);
    assert_eq!(summary.attempts.len(), 1);
    for report in &summary.attempts[0].lanes {
        assert_eq!(report.state, LaneState::Interrupted);
    }
    let log = sandbox.log();
    assert_eq!(log.terminations, 2);
    assert_eq!(log.deletions, 2);
    assert_eq!(summary.statistics.interrupted_lanes, 2);
    assert_eq!(summary.statistics.retries, 0);
}

#[tokio::test(start_paused = true)]
async fn retry_waits_out_the_delay() {
    let sandbox = Arc::new(FakeSimulator::new(|_| Behavior::pass()).fail_creates(1));
    let orchestrator = orchestrator(|builder| {
        builder.set_lanes(one_lane()).set_retries(RetryPolicy::fixed(1, Duration::from_secs(30)));
    });

    let mut delays = Vec::new();
    let start = Instant::now();
    let summary = orchestrator
        .run(sandbox, &universe(TESTS), |event| {
            if let OrchestratorEvent::RetryScheduled {
                next_attempt,
                delay,
            } = event
            {
                delays.push((next_attempt, delay));
            }
        })
        .await;

    assert!(start.elapsed() >= Duration::from_secs(30));
    assert_eq!(summary.final_status, ExitStatus::AllPassed);
    assert_eq!(delays, [(2, Duration::from_secs(30))]);
}

#[tokio::test(start_paused = true)]
async fn interrupt_during_retry_delay() {
    let sandbox = Arc::new(FakeSimulator::new(|_| Behavior::pass()).fail_creates(10));
    let orchestrator = orchestrator(|builder| {
        builder.set_lanes(one_lane()).set_retries(RetryPolicy::fixed(3, Duration::from_secs(600)));
    });
    let handle = orchestrator.interrupt_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        handle.interrupt();
    });

    let summary = orchestrator.run(sandbox, &universe(TESTS), |_| {}).await;

    assert_eq!(summary.final_status, ExitStatus::Interrupted);
    assert_eq!(summary.attempts.len(), 1);
    assert_eq!(summary.attempts[0].status, ExitStatus::SimulatorCreationFailed);
}
