// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    classifier::{Classified, PatternClassifier},
    events::{ParseEvent, PhaseListener},
    tree::{LineContext, ResultTree, TreeBuilder},
};
use bytes::{Buf, BytesMut};
use tracing::debug;

/// What [`OutputStreamParser::close`] found.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CloseSummary {
    /// Nodes that were still open and had to be force-closed.
    pub unterminated: usize,
}

#[derive(Debug)]
struct PendingSuiteEnd {
    event: ParseEvent,
    line_number: usize,
    line: String,
}

/// Incrementally parses a workload's console output into a [`ResultTree`].
///
/// Bytes may arrive in arbitrary chunks, including partial lines and partial
/// UTF-8 sequences. Every classified event is applied to the tree and then
/// handed to the listener, in line order.
#[derive(Debug)]
pub struct OutputStreamParser {
    classifier: &'static PatternClassifier,
    buffer: BytesMut,
    // The length of the buffer prefix known to hold no newline.
    scanned: usize,
    builder: TreeBuilder,
    // A suite end line is held back by one line so its trailer can be folded in.
    pending_suite_end: Option<PendingSuiteEnd>,
    line_number: usize,
    summary: Option<CloseSummary>,
}

impl Default for OutputStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputStreamParser {
    /// Creates a parser for XCTest console output.
    pub fn new() -> Self {
        Self {
            classifier: PatternClassifier::xctest(),
            buffer: BytesMut::new(),
            scanned: 0,
            builder: TreeBuilder::default(),
            pending_suite_end: None,
            line_number: 0,
            summary: None,
        }
    }

    /// Feeds a chunk of output.
    ///
    /// Feeding after [`close`](Self::close) is ignored.
    pub fn feed(&mut self, chunk: &[u8], listener: &mut impl PhaseListener) {
        if self.summary.is_some() {
            debug!(len = chunk.len(), "ignoring output fed after the stream closed");
            return;
        }

        self.buffer.extend_from_slice(chunk);
        while let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(self.scanned + offset);
            self.buffer.advance(1);
            self.scanned = 0;
            self.process_line(&line, listener);
        }
        self.scanned = self.buffer.len();
    }

    /// Ends the stream: processes any unterminated final line, then
    /// force-closes every node still open. Calling this more than once
    /// returns the first summary.
    pub fn close(&mut self, listener: &mut impl PhaseListener) -> CloseSummary {
        if let Some(summary) = self.summary {
            return summary;
        }

        if !self.buffer.is_empty() {
            let line = self.buffer.split();
            self.scanned = 0;
            self.process_line(&line, listener);
        }
        self.flush_pending(listener);

        let summary = CloseSummary {
            unterminated: self.builder.force_close_all(),
        };
        if summary.unterminated > 0 {
            debug!(
                unterminated = summary.unterminated,
                "stream ended with open suites or cases"
            );
        }
        self.summary = Some(summary);
        summary
    }

    /// Returns true once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.summary.is_some()
    }

    /// Returns the number of suites and cases currently open.
    pub fn open_count(&self) -> usize {
        self.builder.open_count()
    }

    /// Returns the tree built so far.
    pub fn tree(&self) -> &ResultTree {
        self.builder.tree()
    }

    /// Consumes the parser, returning its tree.
    pub fn into_tree(self) -> ResultTree {
        self.builder.into_tree()
    }

    fn process_line(&mut self, raw: &[u8], listener: &mut impl PhaseListener) {
        self.line_number += 1;
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = String::from_utf8_lossy(raw);
        if line.trim().is_empty() {
            return;
        }
        let cx = LineContext {
            line_number: self.line_number,
            line: &line,
        };

        match self.classifier.classify(&line) {
            Classified::Trailer(counts) => match self.pending_suite_end.take() {
                Some(mut pending) => {
                    if let ParseEvent::SuiteEnded { reported, .. } = &mut pending.event {
                        *reported = Some(counts);
                    }
                    self.emit(pending, listener);
                }
                None => self.builder.orphan_trailer(cx),
            },
            Classified::Event(event) => {
                self.flush_pending(listener);
                if matches!(event, ParseEvent::SuiteEnded { .. }) {
                    self.pending_suite_end = Some(PendingSuiteEnd {
                        event,
                        line_number: self.line_number,
                        line: line.into_owned(),
                    });
                } else {
                    self.builder.apply(&event, cx);
                    listener.on_parse_event(&event);
                }
            }
        }
    }

    fn flush_pending(&mut self, listener: &mut impl PhaseListener) {
        if let Some(pending) = self.pending_suite_end.take() {
            self.emit(pending, listener);
        }
    }

    fn emit(&mut self, pending: PendingSuiteEnd, listener: &mut impl PhaseListener) {
        let cx = LineContext {
            line_number: pending.line_number,
            line: &pending.line,
        };
        self.builder.apply(&pending.event, cx);
        listener.on_parse_event(&pending.event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{
        AnomalyKind, CaseFailure, FailureLocation, NodeKind, Outcome, ReportedCounts,
        ResultCounts,
    };
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use simlane_metadata::TestIdentifier;
    use test_strategy::proptest;

    fn parse(input: &str) -> ResultTree {
        let mut parser = OutputStreamParser::new();
        parser.feed(input.as_bytes(), &mut ());
        parser.close(&mut ());
        parser.into_tree()
    }

    fn id(suite: &str, case: &str) -> TestIdentifier {
        TestIdentifier::new(suite, case)
    }

    #[test]
    fn single_passing_case() {
        let tree = parse(indoc! {"
            Test Suite 'S' started at 2024-03-01 10:15:42.000
            Test Case '-[S t1]' started.
            Test Case '-[S t1]' passed (0.100 seconds).
            Test Suite 'S' passed at 2024-03-01 10:15:42.100.
                 Executed 1 test, with 0 failures (0 unexpected) in 0.100 (0.101) seconds
        "});

        assert_eq!(tree.roots().len(), 1);
        let suite = tree.node(tree.roots()[0]);
        assert_eq!(suite.display_name(), "S");
        assert_eq!(suite.outcome(), Some(Outcome::Passed));
        assert_eq!(
            suite.counts(),
            ResultCounts {
                tests: 1,
                failures: 0,
                errors: 0
            }
        );
        assert_eq!(suite.count_mismatch(), None);
        assert!(suite.end_time().is_some());

        assert_eq!(suite.children().len(), 1);
        let case = tree.node(suite.children()[0]);
        assert_eq!(case.test(), Some(&id("S", "t1")));
        assert_eq!(case.outcome(), Some(Outcome::Passed));
        assert_eq!(case.parent(), Some(tree.roots()[0]));
        assert!(
            matches!(case.kind(), NodeKind::Case { reported_duration: Some(d), .. } if *d == 0.1)
        );

        assert_eq!(tree.anomalies(), &[]);
    }

    #[test]
    fn byte_at_a_time() {
        let input = indoc! {"
            Test Suite 'S' started at 2024-03-01 10:15:42.000\r
            Test Case '-[S t1]' started.\r
            Test Case '-[S t1]' passed (0.100 seconds).\r
            Test Suite 'S' passed at 2024-03-01 10:15:42.100.\r
                 Executed 1 test, with 0 failures (0 unexpected) in 0.100 (0.101) seconds"
        };
        let mut parser = OutputStreamParser::new();
        let mut events = Vec::new();
        for byte in input.as_bytes() {
            parser.feed(std::slice::from_ref(byte), &mut events);
        }
        // The trailer has no newline, and the suite end waits for it.
        assert_eq!(events.len(), 3);
        assert_eq!(parser.close(&mut events), CloseSummary { unterminated: 0 });
        assert_eq!(events.len(), 4);
        assert!(matches!(
            &events[3],
            ParseEvent::SuiteEnded {
                reported: Some(ReportedCounts { tests: 1, .. }),
                ..
            }
        ));
        assert_eq!(parser.tree().anomalies(), &[]);
    }

    #[test]
    fn nested_suites_roll_up_counts() {
        let tree = parse(indoc! {"
            Test Suite 'All tests' started at 2024-03-01 10:15:42.000
            Test Suite 'A' started at 2024-03-01 10:15:42.000
            Test Case '-[A t1]' started.
            Test Case '-[A t1]' passed (0.001 seconds).
            Test Case '-[A t2]' started.
            /src/A.m:10: error: -[A t2] : ((x) == (y)) failed
            Test Case '-[A t2]' failed (0.002 seconds).
            Test Suite 'A' failed at 2024-03-01 10:15:42.010.
                 Executed 2 tests, with 1 failure (0 unexpected) in 0.003 (0.004) seconds
            Test Suite 'B' started at 2024-03-01 10:15:42.010
            Test Case '-[B t1]' started.
            Test Case '-[B t1]' passed (0.001 seconds).
            Test Suite 'B' passed at 2024-03-01 10:15:42.020.
                 Executed 1 test, with 0 failures (0 unexpected) in 0.001 (0.001) seconds
            Test Suite 'All tests' failed at 2024-03-01 10:15:42.020.
                 Executed 3 tests, with 1 failure (0 unexpected) in 0.004 (0.005) seconds
        "});

        assert_eq!(tree.anomalies(), &[]);
        assert_eq!(tree.count_mismatches().count(), 0);
        let root = tree.node(tree.roots()[0]);
        assert_eq!(root.outcome(), Some(Outcome::Failed));
        assert_eq!(
            root.counts(),
            ResultCounts {
                tests: 3,
                failures: 1,
                errors: 0
            }
        );
        assert_eq!(root.children().len(), 2);

        let failed = tree
            .cases()
            .find(|case| case.test() == Some(&id("A", "t2")))
            .expect("A/t2 parsed");
        assert_eq!(failed.outcome(), Some(Outcome::Failed));
        assert_eq!(
            failed.failures(),
            &[CaseFailure {
                location: Some(FailureLocation {
                    file: "/src/A.m".to_owned(),
                    line: 10,
                }),
                message: "((x) == (y)) failed".to_owned(),
            }]
        );
        // The duration line merged into the already-failed case.
        assert!(
            matches!(failed.kind(), NodeKind::Case { reported_duration: Some(d), .. } if *d == 0.002)
        );

        assert_eq!(
            tree.totals(),
            ResultCounts {
                tests: 3,
                failures: 1,
                errors: 0
            }
        );
    }

    #[test]
    fn multiple_failures_are_kept_in_order() {
        let tree = parse(indoc! {"
            Test Suite 'A' started at 2024-03-01 10:15:42.000
            Test Case '-[A t1]' started.
            /src/A.m:10: error: -[A t1] : first
            /src/A.m:11: error: -[A t1] : second
            Test Case '-[A t1]' failed (0.002 seconds).
            Test Suite 'A' failed at 2024-03-01 10:15:42.010.
        "});
        let case = tree.cases().next().expect("one case");
        let messages: Vec<_> = case.failures().iter().map(|f| f.message.as_str()).collect();
        assert_eq!(messages, ["first", "second"]);
        assert_eq!(tree.node(tree.roots()[0]).counts().failures, 1);
        assert_eq!(tree.anomalies(), &[]);
    }

    #[test]
    fn corrupted_trailer_records_mismatch() {
        let good = indoc! {"
            Test Suite 'S' started at 2024-03-01 10:15:42.000
            Test Case '-[S t1]' started.
            Test Case '-[S t1]' passed (0.100 seconds).
            Test Case '-[S t2]' started.
            Test Case '-[S t2]' passed (0.100 seconds).
            Test Suite 'S' passed at 2024-03-01 10:15:42.100.
                 Executed 2 tests, with 0 failures (0 unexpected) in 0.200 (0.201) seconds
        "};
        let bad = good.replace("Executed 2 tests, with 0 failures", "Executed 3 tests, with 1 failure");

        let good_tree = parse(good);
        let bad_tree = parse(&bad);
        assert_eq!(good_tree.count_mismatches().count(), 0);

        let mismatches: Vec<_> = bad_tree.count_mismatches().collect();
        assert_eq!(mismatches.len(), 1);
        let (suite, mismatch) = mismatches[0];
        assert_eq!(suite.display_name(), "S");
        assert_eq!(
            mismatch.local,
            ResultCounts {
                tests: 2,
                failures: 0,
                errors: 0
            }
        );
        assert_eq!(mismatch.reported.tests, 3);
        assert_eq!(mismatch.reported.failures, 1);

        // Same structure and outcomes either way.
        assert_eq!(bad_tree.len(), good_tree.len());
        assert_eq!(bad_tree.test_outcomes(), good_tree.test_outcomes());
        assert_eq!(
            suite.outcome(),
            good_tree.node(good_tree.roots()[0]).outcome()
        );
    }

    #[test]
    fn crash_mid_case() {
        let tree = parse(indoc! {"
            Test Suite 'S' started at 2024-03-01 10:15:42.000
            Test Case '-[S t1]' started.
            fatal error: unexpectedly found nil while unwrapping an Optional value
        "});
        let case = tree.cases().next().expect("one case");
        assert_eq!(case.outcome(), Some(Outcome::Errored));
        assert_eq!(
            case.crash(),
            Some("fatal error: unexpectedly found nil while unwrapping an Optional value")
        );
        assert!(!case.is_unterminated());

        let suite = tree.node(tree.roots()[0]);
        assert_eq!(suite.outcome(), Some(Outcome::Errored));
        assert!(suite.is_unterminated());
        assert_eq!(suite.counts().errors, 1);
    }

    #[test]
    fn close_forces_open_nodes() {
        let mut parser = OutputStreamParser::new();
        parser.feed(
            indoc! {"
                Test Suite 'S' started at 2024-03-01 10:15:42.000
                Test Case '-[S t1]' started.
            "}
            .as_bytes(),
            &mut (),
        );
        assert_eq!(parser.open_count(), 2);
        let summary = parser.close(&mut ());
        assert_eq!(summary, CloseSummary { unterminated: 2 });
        assert_eq!(parser.close(&mut ()), summary, "close is idempotent");
        assert!(parser.is_closed());

        parser.feed(b"Test Case '-[S t2]' started.\n", &mut ());
        let tree = parser.into_tree();
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.unterminated_count(), 2);
        assert!(tree.iter().all(|(_, node)| node.outcome() == Some(Outcome::Errored)));
    }

    #[test]
    fn mismatched_end_closes_upward() {
        let tree = parse(indoc! {"
            Test Suite 'Outer' started at 2024-03-01 10:15:42.000
            Test Suite 'Inner' started at 2024-03-01 10:15:42.000
            Test Case '-[Inner t1]' started.
            Test Suite 'Outer' passed at 2024-03-01 10:15:42.100.
        "});

        assert_eq!(
            tree.anomalies()
                .iter()
                .map(|anomaly| anomaly.kind.clone())
                .collect::<Vec<_>>(),
            [AnomalyKind::UnmatchedEnd {
                name: "Outer".to_owned(),
                closed: 2,
                recovered: true,
            }]
        );
        assert_eq!(tree.anomalies()[0].line_number, 4);

        let outer = tree.node(tree.roots()[0]);
        // The recovered errors still reach the outer suite.
        assert_eq!(outer.outcome(), Some(Outcome::Failed));
        assert_eq!(outer.counts().errors, 1);
        assert_eq!(tree.unterminated_count(), 0);
    }

    #[test]
    fn end_without_start_empties_stack() {
        let tree = parse(indoc! {"
            Test Suite 'S' started at 2024-03-01 10:15:42.000
            Test Suite 'Other' passed at 2024-03-01 10:15:42.100.
        "});
        assert_eq!(
            tree.anomalies()[0].kind,
            AnomalyKind::UnmatchedEnd {
                name: "Other".to_owned(),
                closed: 1,
                recovered: false,
            }
        );
        assert_eq!(
            tree.node(tree.roots()[0]).outcome(),
            Some(Outcome::Errored)
        );
    }

    #[test]
    fn case_started_while_case_open() {
        let tree = parse(indoc! {"
            Test Suite 'S' started at 2024-03-01 10:15:42.000
            Test Case '-[S t1]' started.
            Test Case '-[S t2]' started.
            Test Case '-[S t2]' passed (0.100 seconds).
            Test Suite 'S' failed at 2024-03-01 10:15:42.100.
        "});
        let outcomes = tree.test_outcomes();
        assert_eq!(outcomes[&id("S", "t1")], Outcome::Errored);
        assert_eq!(outcomes[&id("S", "t2")], Outcome::Passed);
        assert_eq!(
            tree.anomalies()[0].kind,
            AnomalyKind::CaseInterrupted { test: id("S", "t1") }
        );
    }

    #[test]
    fn ui_failure_applies_to_open_case() {
        let tree = parse(indoc! {"
            Test Suite 'LoginUITests' started at 2024-03-01 10:15:42.000
            Test Case '-[LoginUITests testTap]' started.
                t =    10.52s Assertion Failure: LoginUITests.swift:88: Button not hittable
            Test Case '-[LoginUITests testTap]' failed (10.600 seconds).
            Test Suite 'LoginUITests' failed at 2024-03-01 10:15:52.700.
        "});
        let case = tree.cases().next().expect("one case");
        assert_eq!(case.outcome(), Some(Outcome::Failed));
        assert_eq!(case.failures()[0].message, "Button not hittable");
        assert_eq!(tree.anomalies(), &[]);
    }

    #[test]
    fn long_line_in_small_chunks() {
        let line = format!(
            "Test Suite '{}' started at 2024-03-01 10:15:42.000\n",
            "S".repeat(2000)
        );
        let mut parser = OutputStreamParser::new();
        for (idx, chunk) in line.as_bytes().chunks(3).enumerate() {
            parser.feed(chunk, &mut ());
            if idx * 3 + chunk.len() < line.len() {
                // Everything buffered so far has been searched once.
                assert_eq!(parser.scanned, parser.buffer.len());
            }
        }
        assert_eq!(parser.buffer.len(), 0);
        assert_eq!(parser.scanned, 0);
        assert_eq!(parser.open_count(), 1);
    }

    #[test]
    fn chatty_output_is_only_counted() {
        let input: String = (0..5000)
            .map(|idx| format!("loading fixture {idx}\n"))
            .collect();
        let tree = parse(&input);
        assert_eq!(tree.unrecognized_lines(), 5000);
        assert_eq!(tree.anomalies(), &[]);
    }

    #[test]
    fn unrecognized_and_orphan_lines() {
        let mut events = Vec::new();
        let mut parser = OutputStreamParser::new();
        parser.feed(
            indoc! {"
                2024-03-01 10:15:42.200 MyApp[123:456] loading fixtures

                Executed 1 test, with 0 failures (0 unexpected) in 0.1 (0.1) seconds
                fatal error: boom
            "}
            .as_bytes(),
            &mut events,
        );
        parser.close(&mut events);
        let tree = parser.into_tree();

        assert!(tree.is_empty());
        assert_eq!(tree.unrecognized_lines(), 1);
        let kinds: Vec<_> = tree.anomalies().iter().map(|a| a.kind.clone()).collect();
        assert_eq!(kinds, [AnomalyKind::OrphanTrailer, AnomalyKind::OrphanFailure]);
        // The blank line still counts toward line numbers.
        assert_eq!(tree.anomalies()[0].line_number, 3);
        // The trailer is not an event of its own.
        assert_eq!(events.len(), 2);
    }

    #[test]
    fn events_follow_line_order() {
        let mut events = Vec::new();
        let mut parser = OutputStreamParser::new();
        parser.feed(
            indoc! {"
                Test Suite 'S' started at 2024-03-01 10:15:42.000
                Test Suite 'S' passed at 2024-03-01 10:15:42.100.
                Test Suite 'T' started at 2024-03-01 10:15:42.100
            "}
            .as_bytes(),
            &mut events,
        );
        parser.close(&mut events);
        let names: Vec<_> = events
            .iter()
            .map(|event| match event {
                ParseEvent::SuiteStarted { name, .. } => format!("start {name}"),
                ParseEvent::SuiteEnded { name, reported, .. } => {
                    format!("end {name} {}", reported.is_some())
                }
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        assert_eq!(names, ["start S", "end S false", "start T"]);
    }

    #[test]
    fn suite_end_is_held_until_next_line() {
        let mut events = Vec::new();
        let mut parser = OutputStreamParser::new();
        parser.feed(
            indoc! {"
                Test Suite 'S' started at 2024-03-01 10:15:42.000
                Test Suite 'S' passed at 2024-03-01 10:15:42.100.
            "}
            .as_bytes(),
            &mut events,
        );
        assert_eq!(events.len(), 1, "only the start is delivered so far");

        parser.feed(
            b"Executed 0 tests, with 0 failures (0 unexpected) in 0.0 (0.0) seconds\n",
            &mut events,
        );
        parser.close(&mut events);
        assert_eq!(events.len(), 2);
        match &events[1] {
            ParseEvent::SuiteEnded { name, reported, .. } => {
                assert_eq!(name, "S");
                assert!(reported.is_some(), "trailer is folded into the end event");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    fn line_strategy() -> impl Strategy<Value = &'static str> {
        prop::sample::select(vec![
            "Test Suite 'A' started at 2024-03-01 10:15:42.000",
            "Test Suite 'B' started at 2024-03-01 10:15:42.000",
            "Test Suite 'A' passed at 2024-03-01 10:15:42.000.",
            "Test Suite 'B' failed at 2024-03-01 10:15:42.000.",
            "Executed 1 test, with 0 failures (0 unexpected) in 0.1 (0.1) seconds",
            "Test Case '-[A t1]' started.",
            "Test Case '-[A t1]' passed (0.1 seconds).",
            "Test Case '-[B t2]' started.",
            "Test Case '-[B t2]' failed (0.1 seconds).",
            "/src/B.m:3: error: -[B t2] : boom",
            "fatal error: boom",
            "some app logging",
        ])
    }

    #[proptest(cases = 64)]
    fn every_node_closed_after_close(
        #[strategy(prop::collection::vec(line_strategy(), 0..40))] lines: Vec<&'static str>,
        #[strategy(1usize..16)] chunk_size: usize,
    ) {
        let input = lines.join("\n");
        let mut parser = OutputStreamParser::new();
        for chunk in input.as_bytes().chunks(chunk_size) {
            parser.feed(chunk, &mut ());
        }
        parser.close(&mut ());
        let tree = parser.into_tree();

        for (_, node) in tree.iter() {
            prop_assert!(node.outcome().is_some());
            prop_assert!(node.end_time().is_some());
        }
        let closed_cases = tree.cases().count();
        let counted: usize = tree.roots().iter().map(|&root| {
            let node = tree.node(root);
            if node.is_suite() { node.counts().tests } else { 1 }
        }).sum();
        prop_assert_eq!(counted, closed_cases);
    }
}
