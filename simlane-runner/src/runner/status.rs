// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    errors::SandboxStep,
    monitor::{CrashCause, LaneState},
};
use serde::Serialize;
use simlane_metadata::SimlaneExitCode;
use std::fmt;

/// The result of a lane, an attempt, or a whole run.
///
/// When several lanes disagree, the attempt takes the status with the highest
/// [`rank`](Self::rank).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitStatus {
    /// Every test passed.
    AllPassed,

    /// Some tests failed.
    TestsFailed,

    /// A watchdog fired.
    TestTimeout,

    /// The workload crashed.
    AppCrashed,

    /// The sandbox instance lost the workload.
    SimulatorCrashed,

    /// The workload could not be launched.
    LaunchAppFailed,

    /// The workload could not be installed.
    InstallAppFailed,

    /// The sandbox instance did not boot.
    SimulatorBootFailed,

    /// The sandbox instance could not be created.
    SimulatorCreationFailed,

    /// The run was interrupted.
    Interrupted,

    /// The configuration is invalid for this universe.
    ConfigurationError,
}

impl ExitStatus {
    /// Returns the precedence of this status. Higher wins.
    pub fn rank(self) -> u8 {
        match self {
            Self::AllPassed => 0,
            Self::TestsFailed => 1,
            Self::TestTimeout => 2,
            Self::AppCrashed => 3,
            Self::SimulatorCrashed => 4,
            Self::LaunchAppFailed => 5,
            Self::InstallAppFailed => 6,
            Self::SimulatorBootFailed => 7,
            Self::SimulatorCreationFailed => 8,
            Self::Interrupted => 9,
            Self::ConfigurationError => 10,
        }
    }

    /// Returns the process exit code for this status.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::AllPassed => SimlaneExitCode::ALL_PASSED,
            Self::TestsFailed => SimlaneExitCode::TESTS_FAILED,
            Self::TestTimeout => SimlaneExitCode::TEST_TIMEOUT,
            Self::AppCrashed => SimlaneExitCode::APP_CRASHED,
            Self::SimulatorCrashed => SimlaneExitCode::SIMULATOR_CRASHED,
            Self::LaunchAppFailed => SimlaneExitCode::LAUNCH_APP_FAILED,
            Self::InstallAppFailed => SimlaneExitCode::INSTALL_APP_FAILED,
            Self::SimulatorBootFailed => SimlaneExitCode::SIMULATOR_BOOT_FAILED,
            Self::SimulatorCreationFailed => SimlaneExitCode::SIMULATOR_CREATION_FAILED,
            Self::Interrupted => SimlaneExitCode::INTERRUPTED,
            Self::ConfigurationError => SimlaneExitCode::CONFIGURATION_ERROR,
        }
    }

    /// Returns true for failures of the sandbox or workload mechanics, as
    /// opposed to test results.
    pub fn is_infrastructure(self) -> bool {
        matches!(
            self,
            Self::AppCrashed
                | Self::SimulatorCrashed
                | Self::LaunchAppFailed
                | Self::InstallAppFailed
                | Self::SimulatorBootFailed
                | Self::SimulatorCreationFailed
        )
    }

    /// Returns true if another attempt may fix this status, retries
    /// permitting. Test failures are handled by the failure tolerance instead.
    pub fn is_retryable(self) -> bool {
        self.is_infrastructure() || self == Self::TestTimeout
    }

    /// Combines statuses, keeping the highest-ranked one. An empty iterator
    /// yields [`ExitStatus::AllPassed`].
    pub fn aggregate(statuses: impl IntoIterator<Item = Self>) -> Self {
        statuses
            .into_iter()
            .max_by_key(|status| status.rank())
            .unwrap_or(Self::AllPassed)
    }

    /// Returns the status for a lane in a terminal state.
    pub(crate) fn for_lane(
        state: LaneState,
        crash: Option<&CrashCause>,
        any_test_failed: bool,
    ) -> Self {
        match state {
            LaneState::Completed if any_test_failed => Self::TestsFailed,
            LaneState::Completed => Self::AllPassed,
            LaneState::TimedOut => Self::TestTimeout,
            LaneState::Interrupted => Self::Interrupted,
            LaneState::Crashed => match crash {
                Some(CrashCause::Setup { step, .. }) => match step {
                    SandboxStep::Create => Self::SimulatorCreationFailed,
                    SandboxStep::Boot => Self::SimulatorBootFailed,
                    SandboxStep::Install => Self::InstallAppFailed,
                    SandboxStep::Launch => Self::LaunchAppFailed,
                    // Deletion failures never crash a lane.
                    SandboxStep::Delete => Self::AppCrashed,
                },
                Some(CrashCause::SimulatorLost { .. }) => Self::SimulatorCrashed,
                Some(_) | None => Self::AppCrashed,
            },
            // A lane that never reached a terminal state did not finish its work.
            LaneState::Idle
            | LaneState::Launching
            | LaneState::AppLaunched
            | LaneState::TestsRunning => Self::AppCrashed,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AllPassed => "all tests passed",
            Self::TestsFailed => "tests failed",
            Self::TestTimeout => "test timeout",
            Self::AppCrashed => "app crashed",
            Self::SimulatorCrashed => "simulator crashed",
            Self::LaunchAppFailed => "launch app failed",
            Self::InstallAppFailed => "install app failed",
            Self::SimulatorBootFailed => "simulator boot failed",
            Self::SimulatorCreationFailed => "simulator creation failed",
            Self::Interrupted => "interrupted",
            Self::ConfigurationError => "configuration error",
        };
        f.write_str(s)
    }
}
