// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::FailureToleranceParseError;
use serde::Deserialize;
use std::{fmt, str::FromStr};

/// Type for the `failure-tolerance` config key and the `--failure-tolerance`
/// flag.
///
/// The tolerance is the number of distinct failing tests an attempt may have
/// and still be retried. An attempt with more failing tests than this ends the
/// run immediately.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FailureTolerance {
    /// An absolute number of failing tests.
    Count(usize),

    /// A percentage of the filtered test universe, resolved to a count when
    /// the run starts.
    Percent(f64),
}

impl Default for FailureTolerance {
    fn default() -> Self {
        Self::Count(0)
    }
}

impl FailureTolerance {
    /// Resolves this tolerance into an absolute count for a universe of
    /// `total_tests` tests.
    ///
    /// Percentages round down, so `10%` of 15 tests tolerates a single failure.
    pub fn resolve(self, total_tests: usize) -> usize {
        match self {
            Self::Count(count) => count,
            Self::Percent(percent) => (total_tests as f64 * percent / 100.).floor() as usize,
        }
    }
}

impl FromStr for FailureTolerance {
    type Err = FailureToleranceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(percent) = s.strip_suffix('%') {
            let percent = percent
                .trim()
                .parse::<f64>()
                .map_err(|err| FailureToleranceParseError::new(s, err.to_string()))?;
            return Self::validate_percent(percent)
                .map_err(|message| FailureToleranceParseError::new(s, message));
        }

        s.parse::<usize>()
            .map(Self::Count)
            .map_err(|err| FailureToleranceParseError::new(s, err.to_string()))
    }
}

impl FailureTolerance {
    fn validate_percent(percent: f64) -> Result<Self, &'static str> {
        if !(0.0..=100.0).contains(&percent) {
            return Err("percentage must be between 0% and 100%");
        }
        Ok(Self::Percent(percent))
    }
}

impl fmt::Display for FailureTolerance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(count) => write!(f, "{count}"),
            Self::Percent(percent) => write!(f, "{percent}%"),
        }
    }
}

impl<'de> Deserialize<'de> for FailureTolerance {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = FailureTolerance;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(
                    formatter,
                    "a non-negative integer or a percentage string such as \"10%\""
                )
            }

            // Note that TOML uses i64, not u64.
            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                usize::try_from(v).map(FailureTolerance::Count).map_err(|_| {
                    serde::de::Error::invalid_value(serde::de::Unexpected::Signed(v), &self)
                })
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                usize::try_from(v).map(FailureTolerance::Count).map_err(|_| {
                    serde::de::Error::invalid_value(serde::de::Unexpected::Unsigned(v), &self)
                })
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v.ends_with('%') {
                    v.parse().map_err(serde::de::Error::custom)
                } else {
                    Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(v),
                        &self,
                    ))
                }
            }
        }

        deserializer.deserialize_any(V)
    }
}
