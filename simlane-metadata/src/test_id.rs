// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::{TestIdentifierParseError, TestIdentifierParseErrorKind};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smol_str::SmolStr;
use std::{fmt, str::FromStr};

/// Identifies a single test case within a test bundle.
///
/// The string form is `Suite/case`. Identifiers are unique within a bundle,
/// and are ordered by suite name first, then case name.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TestIdentifier {
    suite: SmolStr,
    case: SmolStr,
}

impl TestIdentifier {
    /// Creates a new identifier from a suite name and a case name.
    ///
    /// Neither part is validated; use [`FromStr`] to parse untrusted input.
    pub fn new(suite: impl Into<SmolStr>, case: impl Into<SmolStr>) -> Self {
        Self {
            suite: suite.into(),
            case: case.into(),
        }
    }

    /// Returns the suite (test class) name.
    #[inline]
    pub fn suite(&self) -> &str {
        &self.suite
    }

    /// Returns the case (test method) name.
    #[inline]
    pub fn case(&self) -> &str {
        &self.case
    }
}

impl fmt::Display for TestIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.suite, self.case)
    }
}

impl FromStr for TestIdentifier {
    type Err = TestIdentifierParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((suite, case)) = s.split_once('/') else {
            return Err(TestIdentifierParseError::new(
                s,
                TestIdentifierParseErrorKind::MissingSeparator,
            ));
        };
        if suite.is_empty() {
            return Err(TestIdentifierParseError::new(
                s,
                TestIdentifierParseErrorKind::EmptySuite,
            ));
        }
        if case.is_empty() {
            return Err(TestIdentifierParseError::new(
                s,
                TestIdentifierParseErrorKind::EmptyCase,
            ));
        }
        if case.contains('/') {
            return Err(TestIdentifierParseError::new(
                s,
                TestIdentifierParseErrorKind::ExtraSeparator,
            ));
        }
        Ok(Self::new(suite, case))
    }
}

impl Serialize for TestIdentifier {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TestIdentifier {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(feature = "proptest1")]
mod proptest_impls {
    use super::*;
    use proptest::prelude::*;

    impl Arbitrary for TestIdentifier {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            ("[A-Z][a-zA-Z0-9]{0,8}", "test[a-zA-Z0-9_]{0,8}")
                .prop_map(|(suite, case)| TestIdentifier::new(suite, case))
                .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn parse_and_display() {
        let id: TestIdentifier = "LoginTests/testValidPassword".parse().unwrap();
        assert_eq!(id.suite(), "LoginTests");
        assert_eq!(id.case(), "testValidPassword");
        assert_eq!(id.to_string(), "LoginTests/testValidPassword");
    }

    #[test_case("LoginTests", TestIdentifierParseErrorKind::MissingSeparator ; "no separator")]
    #[test_case("/testFoo", TestIdentifierParseErrorKind::EmptySuite ; "empty suite")]
    #[test_case("LoginTests/", TestIdentifierParseErrorKind::EmptyCase ; "empty case")]
    #[test_case("A/b/c", TestIdentifierParseErrorKind::ExtraSeparator ; "extra separator")]
    fn parse_failures(input: &str, kind: TestIdentifierParseErrorKind) {
        let err = input
            .parse::<TestIdentifier>()
            .expect_err("input should fail to parse");
        assert_eq!(err.kind(), kind);
        assert_eq!(err.input(), input);
    }

    #[test]
    fn ordering_is_suite_then_case() {
        let mut ids = vec![
            TestIdentifier::new("B", "a"),
            TestIdentifier::new("A", "z"),
            TestIdentifier::new("A", "b"),
        ];
        ids.sort();
        let strings: Vec<_> = ids.iter().map(|id| id.to_string()).collect();
        assert_eq!(strings, ["A/b", "A/z", "B/a"]);
    }

    #[test]
    fn serde_as_string() {
        let id = TestIdentifier::new("NetworkTests", "testRetry");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""NetworkTests/testRetry""#);

        let back: TestIdentifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        serde_json::from_str::<TestIdentifier>(r#""NoSeparator""#)
            .expect_err("missing separator is rejected");
    }
}
