// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Classifies single lines of XCTest console output.

use super::events::{CaseFailure, FailureLocation, ParseEvent, ReportedCounts, SuiteStatus};
use chrono::NaiveDateTime;
use regex::{Captures, Regex};
use simlane_metadata::TestIdentifier;
use smol_str::SmolStr;
use std::sync::LazyLock;

/// The result of classifying one line.
#[derive(Clone, Debug, PartialEq)]
pub enum Classified {
    /// The line is an event in its own right.
    Event(ParseEvent),

    /// The summary line XCTest prints right after a suite ends.
    Trailer(ReportedCounts),
}

type Constructor = fn(&Captures<'_>, &str) -> Option<Classified>;

#[derive(Debug)]
struct Pattern {
    name: &'static str,
    regex: Regex,
    build: Constructor,
}

/// An ordered table of line patterns. The first pattern that matches a line
/// and accepts its captures wins; lines nothing accepts are
/// [`ParseEvent::Unrecognized`].
#[derive(Debug)]
pub struct PatternClassifier {
    patterns: Vec<Pattern>,
}

impl PatternClassifier {
    /// Returns the classifier for XCTest console output.
    pub fn xctest() -> &'static Self {
        static XCTEST: LazyLock<PatternClassifier> = LazyLock::new(PatternClassifier::new_xctest);
        &XCTEST
    }

    fn new_xctest() -> Self {
        let table: [(&'static str, &'static str, Constructor); 11] = [
            (
                "suite-started",
                r"^\s*Test Suite '(?P<name>.+)' started at (?P<ts>.+?)\.?$",
                suite_started,
            ),
            (
                "suite-ended",
                r"^\s*Test Suite '(?P<name>.+)' (?P<status>passed|failed) at (?P<ts>.+?)\.?$",
                suite_ended,
            ),
            (
                "suite-trailer",
                r"^\s*Executed (?P<tests>\d+) tests?, with (?P<failures>\d+) failures? \((?P<unexpected>\d+) unexpected\) in (?P<duration>[\d.]+) \((?P<wall>[\d.]+)\) seconds",
                suite_trailer,
            ),
            (
                "case-started",
                r"^\s*Test Case '-\[(?P<suite>\S+) (?P<case>\S+)\]' started\.?$",
                case_started,
            ),
            (
                "case-finished",
                r"^\s*Test Case '-\[(?P<suite>\S+) (?P<case>\S+)\]' (?P<status>passed|failed) \((?P<duration>[\d.]+) seconds\)\.?",
                case_finished,
            ),
            (
                "case-failed",
                r"^(?P<file>.*):(?P<line>\d+): error: -\[(?P<suite>\S+) (?P<case>\S+)\] : (?P<message>.*)$",
                case_failed,
            ),
            (
                "ui-case-failed",
                r"Assertion Failure: ?(?P<file>[^:]*):(?P<line>\d+): (?P<message>.*)$",
                ui_case_failed,
            ),
            ("fatal-error", r"fatal error: .*$", crashed_whole_line),
            ("stack-trace", r"(?P<signature>stack trace for .*)$", crashed_signature),
            (
                "assertion-crash",
                r"^\*\*\* Assertion failure in .*, .*:\d+$",
                crashed_whole_line,
            ),
            ("compiler-error", r"^/.*:\d+: error: .*$", crashed_whole_line),
        ];

        let patterns = table
            .into_iter()
            .map(|(name, pattern, build)| Pattern {
                name,
                regex: Regex::new(pattern).expect("built-in pattern is valid"),
                build,
            })
            .collect();
        Self { patterns }
    }

    /// Classifies one line, without its line terminator.
    pub fn classify(&self, line: &str) -> Classified {
        for pattern in &self.patterns {
            if let Some(captures) = pattern.regex.captures(line)
                && let Some(classified) = (pattern.build)(&captures, line)
            {
                return classified;
            }
        }
        Classified::Event(ParseEvent::Unrecognized {
            line: line.to_owned(),
        })
    }

    /// Returns the name of the first pattern that matches `line`, for
    /// diagnostics.
    pub fn pattern_name(&self, line: &str) -> Option<&'static str> {
        self.patterns
            .iter()
            .find(|pattern| pattern.regex.is_match(line))
            .map(|pattern| pattern.name)
    }
}

fn parse_timestamp(ts: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_and_remainder(ts, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|(timestamp, _)| timestamp)
}

/// Forms a test identifier from the `-[Suite case]` captures, dropping any
/// Swift module prefix from the suite.
fn test_identifier(captures: &Captures<'_>) -> TestIdentifier {
    let suite = &captures["suite"];
    let suite = suite.rsplit_once('.').map_or(suite, |(_, suite)| suite);
    TestIdentifier::new(suite, &captures["case"])
}

fn suite_started(captures: &Captures<'_>, _line: &str) -> Option<Classified> {
    Some(Classified::Event(ParseEvent::SuiteStarted {
        name: SmolStr::new(&captures["name"]),
        timestamp: parse_timestamp(&captures["ts"]),
    }))
}

fn suite_ended(captures: &Captures<'_>, _line: &str) -> Option<Classified> {
    let status = match &captures["status"] {
        "passed" => SuiteStatus::Passed,
        _ => SuiteStatus::Failed,
    };
    Some(Classified::Event(ParseEvent::SuiteEnded {
        name: SmolStr::new(&captures["name"]),
        status,
        timestamp: parse_timestamp(&captures["ts"]),
        reported: None,
    }))
}

fn suite_trailer(captures: &Captures<'_>, _line: &str) -> Option<Classified> {
    let tests: usize = captures["tests"].parse().ok()?;
    let failures: usize = captures["failures"].parse().ok()?;
    let unexpected: usize = captures["unexpected"].parse().ok()?;
    let duration: f64 = captures["duration"].parse().ok()?;
    Some(Classified::Trailer(ReportedCounts {
        tests,
        // XCTest counts unexpected failures (errors) in the failure total.
        failures: failures.saturating_sub(unexpected),
        errors: unexpected,
        duration,
    }))
}

fn case_started(captures: &Captures<'_>, _line: &str) -> Option<Classified> {
    Some(Classified::Event(ParseEvent::CaseStarted {
        test: test_identifier(captures),
    }))
}

fn case_finished(captures: &Captures<'_>, _line: &str) -> Option<Classified> {
    let test = test_identifier(captures);
    let duration: f64 = captures["duration"].parse().ok()?;
    let event = match &captures["status"] {
        "passed" => ParseEvent::CasePassed { test, duration },
        _ => ParseEvent::CaseFailed {
            test: Some(test),
            failure: None,
            duration: Some(duration),
        },
    };
    Some(Classified::Event(event))
}

fn failure_location(captures: &Captures<'_>) -> Option<FailureLocation> {
    let file = captures["file"].trim();
    let line = captures["line"].parse().ok()?;
    Some(FailureLocation {
        file: file.to_owned(),
        line,
    })
}

fn case_failed(captures: &Captures<'_>, _line: &str) -> Option<Classified> {
    Some(Classified::Event(ParseEvent::CaseFailed {
        test: Some(test_identifier(captures)),
        failure: Some(CaseFailure {
            location: failure_location(captures),
            message: captures["message"].to_owned(),
        }),
        duration: None,
    }))
}

fn ui_case_failed(captures: &Captures<'_>, _line: &str) -> Option<Classified> {
    Some(Classified::Event(ParseEvent::CaseFailed {
        test: None,
        failure: Some(CaseFailure {
            location: failure_location(captures),
            message: captures["message"].trim().to_owned(),
        }),
        duration: None,
    }))
}

fn crashed_whole_line(_captures: &Captures<'_>, line: &str) -> Option<Classified> {
    Some(Classified::Event(ParseEvent::CaseCrashed {
        signature: line.trim().to_owned(),
    }))
}

fn crashed_signature(captures: &Captures<'_>, _line: &str) -> Option<Classified> {
    Some(Classified::Event(ParseEvent::CaseCrashed {
        signature: captures["signature"].trim().to_owned(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn classify(line: &str) -> Classified {
        PatternClassifier::xctest().classify(line)
    }

    fn event(line: &str) -> ParseEvent {
        match classify(line) {
            Classified::Event(event) => event,
            other => panic!("expected an event for {line:?}, got {other:?}"),
        }
    }

    #[test]
    fn suite_lines() {
        assert_eq!(
            event("Test Suite 'LoginTests' started at 2024-03-01 10:15:42.123"),
            ParseEvent::SuiteStarted {
                name: "LoginTests".into(),
                timestamp: parse_timestamp("2024-03-01 10:15:42.123"),
            }
        );
        assert!(parse_timestamp("2024-03-01 10:15:42.123").is_some());

        assert_eq!(
            event("Test Suite 'All tests' failed at 2024-03-01 10:16:00.000."),
            ParseEvent::SuiteEnded {
                name: "All tests".into(),
                status: SuiteStatus::Failed,
                timestamp: parse_timestamp("2024-03-01 10:16:00.000"),
                reported: None,
            }
        );
    }

    #[test]
    fn trailer_splits_unexpected_failures() {
        assert_eq!(
            classify("\t Executed 12 tests, with 3 failures (1 unexpected) in 4.250 (4.301) seconds"),
            Classified::Trailer(ReportedCounts {
                tests: 12,
                failures: 2,
                errors: 1,
                duration: 4.25,
            })
        );
        assert_eq!(
            classify("Executed 1 test, with 0 failures (0 unexpected) in 0.001 (0.002) seconds"),
            Classified::Trailer(ReportedCounts {
                tests: 1,
                failures: 0,
                errors: 0,
                duration: 0.001,
            })
        );
    }

    #[test]
    fn case_lines() {
        let test = TestIdentifier::new("LoginTests", "testValid");
        assert_eq!(
            event("Test Case '-[LoginTests testValid]' started."),
            ParseEvent::CaseStarted { test: test.clone() }
        );
        assert_eq!(
            event("Test Case '-[LoginTests testValid]' passed (0.105 seconds)."),
            ParseEvent::CasePassed {
                test: test.clone(),
                duration: 0.105,
            }
        );
        assert_eq!(
            event("Test Case '-[LoginTests testValid]' failed (1.5 seconds)."),
            ParseEvent::CaseFailed {
                test: Some(test),
                failure: None,
                duration: Some(1.5),
            }
        );
    }

    #[test]
    fn swift_module_prefix_is_stripped() {
        assert_eq!(
            event("Test Case '-[MyAppTests.LoginTests testValid]' started."),
            ParseEvent::CaseStarted {
                test: TestIdentifier::new("LoginTests", "testValid"),
            }
        );
    }

    #[test]
    fn failure_with_location() {
        assert_eq!(
            event(
                "/src/LoginTests.m:42: error: -[LoginTests testInvalid] : ((result) is true) failed"
            ),
            ParseEvent::CaseFailed {
                test: Some(TestIdentifier::new("LoginTests", "testInvalid")),
                failure: Some(CaseFailure {
                    location: Some(FailureLocation {
                        file: "/src/LoginTests.m".to_owned(),
                        line: 42,
                    }),
                    message: "((result) is true) failed".to_owned(),
                }),
                duration: None,
            }
        );
    }

    #[test]
    fn ui_test_failure() {
        assert_eq!(
            event("    t =    10.52s Assertion Failure: LoginUITests.swift:88: Button not hittable"),
            ParseEvent::CaseFailed {
                test: None,
                failure: Some(CaseFailure {
                    location: Some(FailureLocation {
                        file: "LoginUITests.swift".to_owned(),
                        line: 88,
                    }),
                    message: "Button not hittable".to_owned(),
                }),
                duration: None,
            }
        );
    }

    #[test_case(
        "fatal error: unexpectedly found nil while unwrapping an Optional value",
        "fatal error: unexpectedly found nil while unwrapping an Optional value"
        ; "fatal error"
    )]
    #[test_case(
        "Printing stack trace for thread 0x1234",
        "stack trace for thread 0x1234"
        ; "stack trace"
    )]
    #[test_case(
        "*** Assertion failure in -[UIView layoutSubviews], /Library/UIView.m:4922",
        "*** Assertion failure in -[UIView layoutSubviews], /Library/UIView.m:4922"
        ; "assertion crash"
    )]
    #[test_case(
        "/tmp/build/Helper.swift:12: error: index out of range",
        "/tmp/build/Helper.swift:12: error: index out of range"
        ; "path error"
    )]
    fn crash_signatures(line: &str, signature: &str) {
        assert_eq!(
            event(line),
            ParseEvent::CaseCrashed {
                signature: signature.to_owned(),
            }
        );
    }

    #[test]
    fn case_failure_wins_over_path_error() {
        // Both the case-failure and the bare path-error patterns match this line.
        let line = "/src/A.m:3: error: -[A testB] : boom";
        assert_eq!(
            PatternClassifier::xctest().pattern_name(line),
            Some("case-failed")
        );
        assert!(matches!(event(line), ParseEvent::CaseFailed { .. }));
    }

    #[test]
    fn unrecognized() {
        assert_eq!(
            event("2024-03-01 10:15:42.200 MyApp[123:456] loading fixtures"),
            ParseEvent::Unrecognized {
                line: "2024-03-01 10:15:42.200 MyApp[123:456] loading fixtures".to_owned(),
            }
        );
    }
}
