// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The set of tests a run may schedule, along with the filters, no-split
//! groups and historical durations that shape how they are packed.
//!
//! A [`TestUniverse`] is immutable once built. Each attempt of a run packs the
//! same universe (or a restricted copy of it, see
//! [`TestUniverse::restricted_to`]).

use crate::errors::{
    TestDurationsReadError, TestListReadError, TestSelectorParseError, UniverseBuildError,
};
use serde::{Deserialize, Deserializer};
use simlane_metadata::TestIdentifier;
use smol_str::SmolStr;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
    io::{self, BufRead},
    str::FromStr,
};

/// The duration estimate, in seconds, used for tests with no historical data.
pub const DEFAULT_TEST_DURATION: f64 = 1.0;

/// Selects tests by full identifier or by suite.
///
/// The string form is either `Suite/case` (one test) or `Suite` (every case of
/// that suite).
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum TestSelector {
    /// Every case in the named suite.
    Suite(SmolStr),

    /// Exactly one test.
    Test(TestIdentifier),
}

impl TestSelector {
    /// Returns true if `id` is selected.
    pub fn matches(&self, id: &TestIdentifier) -> bool {
        match self {
            Self::Suite(suite) => id.suite() == suite,
            Self::Test(test) => test == id,
        }
    }
}

impl FromStr for TestSelector {
    type Err = TestSelectorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TestSelectorParseError::Empty);
        }
        if s.contains('/') {
            Ok(Self::Test(s.parse()?))
        } else {
            Ok(Self::Suite(s.into()))
        }
    }
}

impl fmt::Display for TestSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Suite(suite) => write!(f, "{suite}"),
            Self::Test(test) => write!(f, "{test}"),
        }
    }
}

impl<'de> Deserialize<'de> for TestSelector {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Include and exclude rules applied to the universe before packing.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TestFilter {
    include: Vec<TestSelector>,
    exclude: Vec<TestSelector>,
    only: Option<BTreeSet<TestIdentifier>>,
}

impl TestFilter {
    /// Creates a new filter. An empty include list includes everything.
    pub fn new(include: Vec<TestSelector>, exclude: Vec<TestSelector>) -> Self {
        Self {
            include,
            exclude,
            only: None,
        }
    }

    /// Returns true if `id` passes the filter.
    ///
    /// Exclusions win over inclusions.
    pub fn is_match(&self, id: &TestIdentifier) -> bool {
        if let Some(only) = &self.only
            && !only.contains(id)
        {
            return false;
        }
        let included = self.include.is_empty() || self.include.iter().any(|s| s.matches(id));
        included && !self.exclude.iter().any(|s| s.matches(id))
    }

    /// Returns the include list.
    pub fn include(&self) -> &[TestSelector] {
        &self.include
    }

    /// Returns the exclude list.
    pub fn exclude(&self) -> &[TestSelector] {
        &self.exclude
    }
}

/// A named set of tests that must run in the same lane.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NoSplitGroup {
    name: String,
    entries: Vec<TestSelector>,
}

impl NoSplitGroup {
    /// Creates a new group.
    pub fn new(name: impl Into<String>, entries: Vec<TestSelector>) -> Self {
        Self {
            name: name.into(),
            entries,
        }
    }

    /// Returns the name of the group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the entries of the group, in configuration order.
    pub fn entries(&self) -> &[TestSelector] {
        &self.entries
    }
}

/// Historical duration estimates for tests, in seconds.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TestDurations {
    durations: HashMap<TestIdentifier, f64>,
}

impl TestDurations {
    /// Reads durations from a JSON object mapping `Suite/case` to seconds.
    pub fn from_json(reader: impl io::Read) -> Result<Self, TestDurationsReadError> {
        let raw: HashMap<String, f64> =
            serde_json::from_reader(reader).map_err(TestDurationsReadError::Json)?;
        raw.into_iter()
            .map(|(key, value)| {
                let test: TestIdentifier = key
                    .parse()
                    .map_err(TestDurationsReadError::InvalidIdentifier)?;
                Ok((test, value))
            })
            .collect::<Result<Vec<_>, _>>()
            .and_then(Self::from_pairs)
    }

    /// Builds durations from `(test, seconds)` pairs.
    pub fn from_pairs(
        pairs: impl IntoIterator<Item = (TestIdentifier, f64)>,
    ) -> Result<Self, TestDurationsReadError> {
        let mut durations = HashMap::new();
        for (test, value) in pairs {
            if !value.is_finite() || value < 0.0 {
                return Err(TestDurationsReadError::InvalidDuration { test, value });
            }
            durations.insert(test, value);
        }
        Ok(Self { durations })
    }

    /// Returns the recorded duration for `id`, if any.
    pub fn get(&self, id: &TestIdentifier) -> Option<f64> {
        self.durations.get(id).copied()
    }

    /// Returns the estimate used when packing `id`.
    pub fn estimate(&self, id: &TestIdentifier) -> f64 {
        self.get(id).unwrap_or(DEFAULT_TEST_DURATION)
    }

    /// Returns the number of recorded durations.
    pub fn len(&self) -> usize {
        self.durations.len()
    }

    /// Returns true if there are no recorded durations.
    pub fn is_empty(&self) -> bool {
        self.durations.is_empty()
    }
}

/// The full set of tests known to a run.
#[derive(Clone, Debug)]
pub struct TestUniverse {
    tests: Vec<TestIdentifier>,
    durations: TestDurations,
    no_split: Vec<NoSplitGroup>,
    filter: TestFilter,
}

impl TestUniverse {
    /// Creates a universe from the given tests, in listing order.
    ///
    /// Listing order matters: it is the order tests keep within a no-split
    /// group, and the tie-break when two packing items weigh the same.
    pub fn new(
        tests: impl IntoIterator<Item = TestIdentifier>,
    ) -> Result<Self, UniverseBuildError> {
        let tests: Vec<_> = tests.into_iter().collect();
        let mut seen = HashSet::with_capacity(tests.len());
        for test in &tests {
            if !seen.insert(test) {
                return Err(UniverseBuildError::DuplicateTest(test.clone()));
            }
        }

        Ok(Self {
            tests,
            durations: TestDurations::default(),
            no_split: Vec::new(),
            filter: TestFilter::default(),
        })
    }

    /// Sets historical durations.
    pub fn with_durations(mut self, durations: TestDurations) -> Self {
        self.durations = durations;
        self
    }

    /// Sets the no-split groups.
    pub fn with_no_split_groups(mut self, groups: Vec<NoSplitGroup>) -> Self {
        self.no_split = groups;
        self
    }

    /// Sets the include and exclude filter.
    pub fn with_filter(mut self, filter: TestFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Returns a copy of this universe in which only `tests` pass the filter.
    ///
    /// No-split groups still resolve against the full list, so a group may
    /// end up with fewer members (or none) after restriction.
    pub fn restricted_to(&self, tests: BTreeSet<TestIdentifier>) -> Self {
        let mut restricted = self.clone();
        restricted.filter.only = Some(tests);
        restricted
    }

    /// Returns every test, in listing order, ignoring the filter.
    pub fn tests(&self) -> &[TestIdentifier] {
        &self.tests
    }

    /// Returns true if `id` is listed, whether or not it passes the filter.
    pub fn contains(&self, id: &TestIdentifier) -> bool {
        self.tests.contains(id)
    }

    /// Returns the tests that pass the filter, with their listing positions.
    pub fn filtered(&self) -> impl Iterator<Item = (usize, &TestIdentifier)> + '_ {
        self.tests
            .iter()
            .enumerate()
            .filter(|(_, id)| self.filter.is_match(id))
    }

    /// Returns the number of tests that pass the filter.
    pub fn filtered_count(&self) -> usize {
        self.filtered().count()
    }

    /// Returns the historical durations.
    pub fn durations(&self) -> &TestDurations {
        &self.durations
    }

    /// Returns the no-split groups.
    pub fn no_split_groups(&self) -> &[NoSplitGroup] {
        &self.no_split
    }

    /// Returns the filter.
    pub fn filter(&self) -> &TestFilter {
        &self.filter
    }
}

/// Reads a list of tests, one `Suite/case` per line.
///
/// Blank lines and lines starting with `#` are skipped.
pub fn read_test_list(reader: impl BufRead) -> Result<Vec<TestIdentifier>, TestListReadError> {
    let mut tests = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line.map_err(TestListReadError::Read)?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let test = line.parse().map_err(|err| TestListReadError::InvalidLine {
            line_number: idx + 1,
            err,
        })?;
        tests.push(test);
    }
    Ok(tests)
}
