// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::events::{CaseFailure, ParseEvent, ReportedCounts, SuiteStatus};
use chrono::{DateTime, Local, NaiveDateTime};
use serde::Serialize;
use simlane_metadata::TestIdentifier;
use smol_str::SmolStr;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Identifies a node within its [`ResultTree`].
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct NodeId(usize);

/// How a closed node finished.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    /// Passed.
    Passed,

    /// Failed an assertion.
    Failed,

    /// Crashed, was cut off, or never reported a result.
    Errored,
}

/// Test counts accumulated from closed children.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ResultCounts {
    /// Cases closed.
    pub tests: usize,

    /// Cases that failed.
    pub failures: usize,

    /// Cases that errored.
    pub errors: usize,
}

impl ResultCounts {
    fn record(&mut self, outcome: Outcome) {
        self.tests += 1;
        match outcome {
            Outcome::Passed => {}
            Outcome::Failed => self.failures += 1,
            Outcome::Errored => self.errors += 1,
        }
    }

    fn add(&mut self, other: ResultCounts) {
        self.tests += other.tests;
        self.failures += other.failures;
        self.errors += other.errors;
    }

    /// Returns true if these counts agree with a trailer's counts.
    pub fn matches(&self, reported: &ReportedCounts) -> bool {
        self.tests == reported.tests
            && self.failures == reported.failures
            && self.errors == reported.errors
    }
}

/// Locally counted results that disagree with a suite's trailer.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CountMismatch {
    /// What the parser counted.
    pub local: ResultCounts,

    /// What the trailer reported.
    pub reported: ReportedCounts,
}

/// What a node represents.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum NodeKind {
    /// A test suite.
    Suite {
        /// The suite name.
        name: SmolStr,

        /// The counts from the suite's trailer line, kept apart from the local counts.
        reported: Option<ReportedCounts>,

        /// Set if the local counts disagree with `reported`.
        count_mismatch: Option<CountMismatch>,
    },

    /// A test case.
    Case {
        /// The test.
        test: TestIdentifier,

        /// Every failure reported for the case, the primary one first.
        failures: Vec<CaseFailure>,

        /// The crash signature, if the case crashed.
        crash: Option<String>,

        /// The duration the workload reported, in seconds.
        reported_duration: Option<f64>,
    },
}

/// A suite or case in a [`ResultTree`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResultNode {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    counts: ResultCounts,
    start_time: DateTime<Local>,
    end_time: Option<DateTime<Local>>,
    reported_start: Option<NaiveDateTime>,
    outcome: Option<Outcome>,
    unterminated: bool,
}

impl ResultNode {
    fn new(kind: NodeKind, parent: Option<NodeId>, reported_start: Option<NaiveDateTime>) -> Self {
        Self {
            kind,
            parent,
            children: Vec::new(),
            counts: ResultCounts::default(),
            start_time: Local::now(),
            end_time: None,
            reported_start,
            outcome: None,
            unterminated: false,
        }
    }

    /// Returns what this node represents.
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// Returns the suite name, or the case's `Suite/case` form.
    pub fn display_name(&self) -> String {
        match &self.kind {
            NodeKind::Suite { name, .. } => name.to_string(),
            NodeKind::Case { test, .. } => test.to_string(),
        }
    }

    /// Returns the test if this is a case.
    pub fn test(&self) -> Option<&TestIdentifier> {
        match &self.kind {
            NodeKind::Case { test, .. } => Some(test),
            NodeKind::Suite { .. } => None,
        }
    }

    /// Returns true if this is a suite.
    pub fn is_suite(&self) -> bool {
        matches!(self.kind, NodeKind::Suite { .. })
    }

    /// Returns the parent suite. This is a back-link only; the tree owns every node.
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Returns the children, in arrival order.
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Returns the counts accumulated from closed children.
    pub fn counts(&self) -> ResultCounts {
        self.counts
    }

    /// Returns when the node was opened.
    pub fn start_time(&self) -> DateTime<Local> {
        self.start_time
    }

    /// Returns when the node was closed.
    pub fn end_time(&self) -> Option<DateTime<Local>> {
        self.end_time
    }

    /// Returns the workload's own start timestamp, if it printed one.
    pub fn reported_start(&self) -> Option<NaiveDateTime> {
        self.reported_start
    }

    /// Returns the outcome, or `None` while the node is open.
    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    /// Returns true once the node has been closed.
    pub fn is_closed(&self) -> bool {
        self.outcome.is_some()
    }

    /// Returns true if the node was still open when the stream ended.
    pub fn is_unterminated(&self) -> bool {
        self.unterminated
    }

    /// Returns the failures recorded for a case.
    pub fn failures(&self) -> &[CaseFailure] {
        match &self.kind {
            NodeKind::Case { failures, .. } => failures,
            NodeKind::Suite { .. } => &[],
        }
    }

    /// Returns the crash signature recorded for a case.
    pub fn crash(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Case { crash, .. } => crash.as_deref(),
            NodeKind::Suite { .. } => None,
        }
    }

    /// Returns the count mismatch recorded for a suite.
    pub fn count_mismatch(&self) -> Option<&CountMismatch> {
        match &self.kind {
            NodeKind::Suite { count_mismatch, .. } => count_mismatch.as_ref(),
            NodeKind::Case { .. } => None,
        }
    }

    fn is_case_for(&self, test: &TestIdentifier) -> bool {
        self.test() == Some(test)
    }

    fn is_suite_named(&self, suite: &str) -> bool {
        matches!(&self.kind, NodeKind::Suite { name, .. } if name == suite)
    }
}

/// What went wrong with a line.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AnomalyKind {
    /// An end event did not match the innermost open node, so open nodes were
    /// closed as errored until one matched (or none were left).
    UnmatchedEnd {
        /// The suite or test named by the end event.
        name: String,

        /// How many nodes were closed to recover.
        closed: usize,

        /// Whether a matching node was eventually found.
        recovered: bool,
    },

    /// A case started while another case was still open; the open case was
    /// closed as errored.
    CaseInterrupted {
        /// The case that was cut off.
        test: TestIdentifier,
    },

    /// A failure or crash line arrived with no case to attach it to.
    OrphanFailure,

    /// A suite trailer line arrived without a suite end line before it.
    OrphanTrailer,
}

/// A line that could not be placed in the tree as-is.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ParseAnomaly {
    /// The 1-based line number within the stream.
    pub line_number: usize,

    /// The line, without its terminator.
    pub line: String,

    /// What went wrong.
    pub kind: AnomalyKind,
}

/// The suites and cases parsed from one lane's output.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ResultTree {
    nodes: Vec<ResultNode>,
    roots: Vec<NodeId>,
    anomalies: Vec<ParseAnomaly>,
    unrecognized_lines: usize,
}

impl ResultTree {
    /// Returns the node with the given ID.
    pub fn node(&self, id: NodeId) -> &ResultNode {
        &self.nodes[id.0]
    }

    /// Returns the top-level nodes, in arrival order.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Iterates over every node in creation order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &ResultNode)> + '_ {
        self.nodes.iter().enumerate().map(|(idx, node)| (NodeId(idx), node))
    }

    /// Iterates over every case node.
    pub fn cases(&self) -> impl Iterator<Item = &ResultNode> + '_ {
        self.nodes.iter().filter(|node| !node.is_suite())
    }

    /// Returns the number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if nothing was parsed.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the structural anomalies, in line order.
    pub fn anomalies(&self) -> &[ParseAnomaly] {
        &self.anomalies
    }

    /// Returns the number of non-blank lines no pattern recognized. Only the
    /// count is kept.
    pub fn unrecognized_lines(&self) -> usize {
        self.unrecognized_lines
    }

    /// Iterates over suites whose counts disagree with their trailer.
    pub fn count_mismatches(&self) -> impl Iterator<Item = (&ResultNode, &CountMismatch)> + '_ {
        self.nodes
            .iter()
            .filter_map(|node| node.count_mismatch().map(|mismatch| (node, mismatch)))
    }

    /// Returns the counts over every closed case.
    pub fn totals(&self) -> ResultCounts {
        let mut counts = ResultCounts::default();
        for outcome in self.cases().filter_map(|case| case.outcome) {
            counts.record(outcome);
        }
        counts
    }

    /// Returns the outcome of every closed case. If a test ran more than once,
    /// its last outcome wins.
    pub fn test_outcomes(&self) -> BTreeMap<TestIdentifier, Outcome> {
        self.cases()
            .filter_map(|case| Some((case.test()?.clone(), case.outcome?)))
            .collect()
    }

    /// Returns the number of nodes that were still open when the stream ended.
    pub fn unterminated_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.unterminated).count()
    }
}

/// The line an event came from, for anomaly records.
#[derive(Clone, Copy, Debug)]
pub(super) struct LineContext<'a> {
    pub(super) line_number: usize,
    pub(super) line: &'a str,
}

/// Builds a [`ResultTree`] from events, keeping a stack of open nodes.
#[derive(Debug, Default)]
pub(super) struct TreeBuilder {
    tree: ResultTree,
    stack: Vec<NodeId>,
    last_closed_case: Option<NodeId>,
}

impl TreeBuilder {
    pub(super) fn tree(&self) -> &ResultTree {
        &self.tree
    }

    pub(super) fn into_tree(self) -> ResultTree {
        self.tree
    }

    pub(super) fn open_count(&self) -> usize {
        self.stack.len()
    }

    pub(super) fn apply(&mut self, event: &ParseEvent, cx: LineContext<'_>) {
        match event {
            ParseEvent::SuiteStarted { name, timestamp } => {
                self.interrupt_open_case(cx);
                self.push(
                    NodeKind::Suite {
                        name: name.clone(),
                        reported: None,
                        count_mismatch: None,
                    },
                    *timestamp,
                );
            }
            ParseEvent::SuiteEnded {
                name,
                status,
                reported,
                ..
            } => self.end_suite(name, *status, *reported, cx),
            ParseEvent::CaseStarted { test } => {
                self.interrupt_open_case(cx);
                self.push(
                    NodeKind::Case {
                        test: test.clone(),
                        failures: Vec::new(),
                        crash: None,
                        reported_duration: None,
                    },
                    None,
                );
            }
            ParseEvent::CasePassed { test, duration } => {
                if let Some(id) = self.take_open_case(test, cx) {
                    self.set_case_details(id, None, Some(*duration), None);
                    self.close(id, Outcome::Passed, false);
                }
            }
            ParseEvent::CaseFailed {
                test,
                failure,
                duration,
            } => self.case_failed(test.as_ref(), failure.as_ref(), *duration, cx),
            ParseEvent::CaseCrashed { signature } => match self.top_case() {
                Some(id) => {
                    self.stack.pop();
                    self.set_case_details(id, None, None, Some(signature.clone()));
                    self.close(id, Outcome::Errored, false);
                }
                None => self.anomaly(cx, AnomalyKind::OrphanFailure),
            },
            ParseEvent::Unrecognized { .. } => self.tree.unrecognized_lines += 1,
        }
    }

    pub(super) fn orphan_trailer(&mut self, cx: LineContext<'_>) {
        self.anomaly(cx, AnomalyKind::OrphanTrailer);
    }

    /// Closes every open node as errored and unterminated. Returns how many
    /// nodes were closed.
    pub(super) fn force_close_all(&mut self) -> usize {
        let mut closed = 0;
        while let Some(id) = self.stack.pop() {
            self.close(id, Outcome::Errored, true);
            closed += 1;
        }
        closed
    }

    /// Cases are always leaves: anything that starts while a case is open
    /// closes it as errored.
    fn interrupt_open_case(&mut self, cx: LineContext<'_>) {
        if let Some(top) = self.top_case() {
            self.stack.pop();
            self.close(top, Outcome::Errored, false);
            if let Some(test) = self.tree.nodes[top.0].test().cloned() {
                self.anomaly(cx, AnomalyKind::CaseInterrupted { test });
            }
        }
    }

    fn end_suite(
        &mut self,
        name: &str,
        status: SuiteStatus,
        reported: Option<ReportedCounts>,
        cx: LineContext<'_>,
    ) {
        let Some(id) = self.unwind_to(name, |node| node.is_suite_named(name), cx) else {
            return;
        };
        self.stack.pop();

        let node = &mut self.tree.nodes[id.0];
        let counts = node.counts;
        let outcome = if status == SuiteStatus::Failed || counts.failures > 0 || counts.errors > 0
        {
            Outcome::Failed
        } else {
            Outcome::Passed
        };
        if let NodeKind::Suite {
            reported: reported_slot,
            count_mismatch,
            ..
        } = &mut node.kind
        {
            *reported_slot = reported;
            if let Some(reported) = reported
                && !counts.matches(&reported)
            {
                warn!(
                    suite = name,
                    local = ?counts,
                    ?reported,
                    "suite results do not match the suite's summary line",
                );
                *count_mismatch = Some(CountMismatch {
                    local: counts,
                    reported,
                });
            }
        }
        self.close(id, outcome, false);
    }

    fn case_failed(
        &mut self,
        test: Option<&TestIdentifier>,
        failure: Option<&CaseFailure>,
        duration: Option<f64>,
        cx: LineContext<'_>,
    ) {
        let top_case = self.top_case();
        let top_matches = match (top_case, test) {
            (Some(id), Some(test)) => self.tree.nodes[id.0].is_case_for(test),
            (Some(_), None) => true,
            (None, _) => false,
        };
        if let Some(id) = top_case
            && top_matches
        {
            self.stack.pop();
            self.set_case_details(id, failure.cloned(), duration, None);
            self.close(id, Outcome::Failed, false);
            return;
        }

        // A further line about a case that already failed.
        if let Some(id) = self.recently_failed_case(test) {
            self.set_case_details(id, failure.cloned(), duration, None);
            return;
        }

        match test {
            Some(test) => {
                if let Some(id) = self.take_open_case(test, cx) {
                    self.set_case_details(id, failure.cloned(), duration, None);
                    self.close(id, Outcome::Failed, false);
                }
            }
            None => self.anomaly(cx, AnomalyKind::OrphanFailure),
        }
    }

    /// Returns the most recently closed case if it failed, is still in the
    /// innermost open suite, and (if given) is for `test`.
    fn recently_failed_case(&self, test: Option<&TestIdentifier>) -> Option<NodeId> {
        let id = self.last_closed_case?;
        let node = &self.tree.nodes[id.0];
        let same_parent = node.parent == self.stack.last().copied();
        let same_test = test.is_none_or(|test| node.is_case_for(test));
        (same_parent && same_test && node.outcome == Some(Outcome::Failed)).then_some(id)
    }

    /// Pops the open case for `test`, unwinding any nodes above it.
    fn take_open_case(&mut self, test: &TestIdentifier, cx: LineContext<'_>) -> Option<NodeId> {
        let id = self.unwind_to(&test.to_string(), |node| node.is_case_for(test), cx)?;
        self.stack.pop();
        Some(id)
    }

    /// Closes open nodes as errored until the top of the stack satisfies
    /// `matches`, and returns it without popping it. Records an anomaly if any
    /// node had to be closed or nothing matched.
    fn unwind_to(
        &mut self,
        name: &str,
        matches: impl Fn(&ResultNode) -> bool,
        cx: LineContext<'_>,
    ) -> Option<NodeId> {
        let mut closed = 0;
        let mut found = None;
        while let Some(&top) = self.stack.last() {
            if matches(&self.tree.nodes[top.0]) {
                found = Some(top);
                break;
            }
            self.stack.pop();
            self.close(top, Outcome::Errored, false);
            closed += 1;
        }

        if closed > 0 || found.is_none() {
            self.anomaly(
                cx,
                AnomalyKind::UnmatchedEnd {
                    name: name.to_owned(),
                    closed,
                    recovered: found.is_some(),
                },
            );
        }
        found
    }

    fn top_case(&self) -> Option<NodeId> {
        let &top = self.stack.last()?;
        (!self.tree.nodes[top.0].is_suite()).then_some(top)
    }

    fn push(&mut self, kind: NodeKind, reported_start: Option<NaiveDateTime>) -> NodeId {
        let parent = self.stack.last().copied();
        let id = NodeId(self.tree.nodes.len());
        self.tree
            .nodes
            .push(ResultNode::new(kind, parent, reported_start));
        match parent {
            Some(parent) => self.tree.nodes[parent.0].children.push(id),
            None => self.tree.roots.push(id),
        }
        self.stack.push(id);
        id
    }

    fn set_case_details(
        &mut self,
        id: NodeId,
        failure: Option<CaseFailure>,
        duration: Option<f64>,
        signature: Option<String>,
    ) {
        if let NodeKind::Case {
            failures,
            crash,
            reported_duration,
            ..
        } = &mut self.tree.nodes[id.0].kind
        {
            failures.extend(failure);
            if duration.is_some() {
                *reported_duration = duration;
            }
            if signature.is_some() {
                *crash = signature;
            }
        }
    }

    /// Closes a node that has already been popped, and rolls its results up
    /// into its parent.
    fn close(&mut self, id: NodeId, outcome: Outcome, unterminated: bool) {
        let node = &mut self.tree.nodes[id.0];
        node.end_time = Some(Local::now());
        node.outcome = Some(outcome);
        node.unterminated = unterminated;
        let counts = node.counts;
        let is_suite = node.is_suite();
        let parent = node.parent;

        if !is_suite {
            self.last_closed_case = Some(id);
        }
        if let Some(parent) = parent {
            let parent_counts = &mut self.tree.nodes[parent.0].counts;
            if is_suite {
                parent_counts.add(counts);
            } else {
                parent_counts.record(outcome);
            }
        }
    }

    fn anomaly(&mut self, cx: LineContext<'_>, kind: AnomalyKind) {
        debug!(
            line_number = cx.line_number,
            line = cx.line,
            ?kind,
            "parse anomaly"
        );
        self.tree.anomalies.push(ParseAnomaly {
            line_number: cx.line_number,
            line: cx.line.to_owned(),
            kind,
        });
    }
}
