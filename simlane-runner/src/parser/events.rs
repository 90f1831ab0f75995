// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use chrono::NaiveDateTime;
use serde::Serialize;
use simlane_metadata::TestIdentifier;
use smol_str::SmolStr;

/// Where a test failure was reported.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FailureLocation {
    /// The source file.
    pub file: String,

    /// The 1-based line number.
    pub line: u32,
}

/// One failure reported for a test case.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CaseFailure {
    /// Where the failure was reported, if the line said.
    pub location: Option<FailureLocation>,

    /// The failure message.
    pub message: String,
}

/// The counts a suite's trailer line reports.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct ReportedCounts {
    /// Tests executed.
    pub tests: usize,

    /// Expected failures: assertion failures.
    pub failures: usize,

    /// Unexpected failures: errors such as uncaught exceptions.
    pub errors: usize,

    /// The reported duration in seconds.
    pub duration: f64,
}

/// Whether the workload reported a suite as passed or failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SuiteStatus {
    /// The suite passed.
    Passed,

    /// The suite failed.
    Failed,
}

/// A classified line of workload output.
///
/// Events are delivered to a [`PhaseListener`] in the order their lines
/// arrived.
#[derive(Clone, Debug, PartialEq)]
pub enum ParseEvent {
    /// A suite started.
    SuiteStarted {
        /// The suite name.
        name: SmolStr,

        /// The workload's timestamp, if it could be parsed.
        timestamp: Option<NaiveDateTime>,
    },

    /// A suite ended.
    SuiteEnded {
        /// The suite name.
        name: SmolStr,

        /// The status the workload reported.
        status: SuiteStatus,

        /// The workload's timestamp, if it could be parsed.
        timestamp: Option<NaiveDateTime>,

        /// The counts from the trailer line following the end line, if any.
        reported: Option<ReportedCounts>,
    },

    /// A test case started.
    CaseStarted {
        /// The test.
        test: TestIdentifier,
    },

    /// A test case passed.
    CasePassed {
        /// The test.
        test: TestIdentifier,

        /// The reported duration in seconds.
        duration: f64,
    },

    /// A test case failed, or reported one more failure.
    CaseFailed {
        /// The test, or `None` if the line only applies to the running case.
        test: Option<TestIdentifier>,

        /// The failure, if the line carried one.
        failure: Option<CaseFailure>,

        /// The reported duration, if the line carried one.
        duration: Option<f64>,
    },

    /// The workload printed a crash signature.
    CaseCrashed {
        /// The signature line.
        signature: String,
    },

    /// A line no pattern recognized.
    Unrecognized {
        /// The line, without its terminator.
        line: String,
    },
}

impl ParseEvent {
    /// Returns true if this event means tests have started running.
    pub fn is_test_activity(&self) -> bool {
        matches!(self, Self::SuiteStarted { .. } | Self::CaseStarted { .. })
    }
}

/// Receives classified events as they are parsed.
///
/// [`ParseEvent::SuiteEnded`] arrives late. The parser holds a suite end line
/// back until the next non-blank line, so that a trailer line following it
/// can be folded into the event's `reported` counts. If the workload goes
/// quiet right after a suite ends without a trailer, the event is delivered
/// only once more output arrives or the stream is closed. Every other event
/// is delivered as soon as its line is complete.
pub trait PhaseListener {
    /// Called once per event, in arrival order.
    fn on_parse_event(&mut self, event: &ParseEvent);
}

impl PhaseListener for () {
    fn on_parse_event(&mut self, _event: &ParseEvent) {}
}

impl PhaseListener for Vec<ParseEvent> {
    fn on_parse_event(&mut self, event: &ParseEvent) {
        self.push(event.clone());
    }
}

impl<T: PhaseListener + ?Sized> PhaseListener for &mut T {
    fn on_parse_event(&mut self, event: &ParseEvent) {
        (**self).on_parse_event(event)
    }
}
