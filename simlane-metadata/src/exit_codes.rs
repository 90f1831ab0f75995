// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

/// Documented exit codes for `simlane` runs.
///
/// The codes from `ALL_PASSED` through `SIMULATOR_BOOT_FAILED` and
/// `CONFIGURATION_ERROR` correspond one-to-one to the final status of a run.
/// When several lanes fail in different ways, the reported code is chosen by a
/// fixed precedence, so the same set of lane outcomes always produces the same
/// code.
///
/// Unknown/unexpected failures result in
/// [`UNEXPECTED_ERROR`](Self::UNEXPECTED_ERROR), since 1 is already taken by
/// [`TESTS_FAILED`](Self::TESTS_FAILED).
pub enum SimlaneExitCode {}

impl SimlaneExitCode {
    /// Every test in the final attempt passed.
    pub const ALL_PASSED: i32 = 0;

    /// One or more tests failed, and no infrastructure failure occurred.
    pub const TESTS_FAILED: i32 = 1;

    /// A sandbox instance could not be created.
    pub const SIMULATOR_CREATION_FAILED: i32 = 2;

    /// A sandbox instance went away while tests were running.
    pub const SIMULATOR_CRASHED: i32 = 3;

    /// The workload could not be installed into a sandbox instance.
    pub const INSTALL_APP_FAILED: i32 = 4;

    /// The workload could not be launched inside a sandbox instance.
    pub const LAUNCH_APP_FAILED: i32 = 5;

    /// A lane stopped producing output, or ran past its execution budget.
    pub const TEST_TIMEOUT: i32 = 6;

    /// The worker process exited abnormally.
    pub const APP_CRASHED: i32 = 7;

    /// The run was interrupted, e.g. by Ctrl-C.
    pub const INTERRUPTED: i32 = 8;

    /// A sandbox instance was created but failed to boot.
    pub const SIMULATOR_BOOT_FAILED: i32 = 13;

    /// The test universe or its no-split groups were inconsistent.
    pub const CONFIGURATION_ERROR: i32 = 20;

    /// No tests were selected to run, but no other errors occurred.
    pub const NO_TESTS_RUN: i32 = 21;

    /// A user issue happened while setting up a simlane invocation: bad
    /// arguments, an unreadable test list, or an invalid config file.
    pub const SETUP_ERROR: i32 = 96;

    /// An unexpected error occurred inside simlane itself.
    pub const UNEXPECTED_ERROR: i32 = 101;
}
