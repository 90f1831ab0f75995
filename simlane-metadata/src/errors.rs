// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::{error, fmt};

/// An error that occurs while parsing a [`TestIdentifier`](crate::TestIdentifier)
/// from its `Suite/case` string form.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestIdentifierParseError {
    input: String,
    kind: TestIdentifierParseErrorKind,
}

impl TestIdentifierParseError {
    pub(crate) fn new(input: impl Into<String>, kind: TestIdentifierParseErrorKind) -> Self {
        Self {
            input: input.into(),
            kind,
        }
    }

    /// Returns the input that failed to parse.
    pub fn input(&self) -> &str {
        &self.input
    }

    /// Returns the reason the input was rejected.
    pub fn kind(&self) -> TestIdentifierParseErrorKind {
        self.kind
    }
}

/// The reason a test identifier failed to parse.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum TestIdentifierParseErrorKind {
    /// The input had no `/` separating the suite from the case.
    MissingSeparator,

    /// The suite name was empty.
    EmptySuite,

    /// The case name was empty.
    EmptyCase,

    /// The case name contained a further `/`.
    ExtraSeparator,
}

impl fmt::Display for TestIdentifierParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let reason = match self.kind {
            TestIdentifierParseErrorKind::MissingSeparator => "expected `Suite/case`",
            TestIdentifierParseErrorKind::EmptySuite => "suite name is empty",
            TestIdentifierParseErrorKind::EmptyCase => "case name is empty",
            TestIdentifierParseErrorKind::ExtraSeparator => "case name contains `/`",
        };
        write!(f, "invalid test identifier `{}`: {reason}", self.input)
    }
}

impl error::Error for TestIdentifierParseError {}
