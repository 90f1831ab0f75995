// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::LaneCountParseError;
use serde::Deserialize;
use std::{fmt, num::NonZeroUsize, str::FromStr, sync::LazyLock};
use tracing::warn;

/// Type for the `lanes` config key and the `--lanes` flag.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LaneCount {
    /// Run with a specified number of lanes.
    Count(NonZeroUsize),

    /// Run with one lane per logical CPU.
    NumCpus,
}

impl LaneCount {
    /// Gets the actual number of lanes computed at runtime.
    pub fn compute(self) -> NonZeroUsize {
        match self {
            Self::Count(lanes) => lanes,
            Self::NumCpus => get_num_cpus(),
        }
    }
}

/// Gets the number of available CPUs and caches the value.
pub fn get_num_cpus() -> NonZeroUsize {
    static NUM_CPUS: LazyLock<NonZeroUsize> =
        LazyLock::new(|| match std::thread::available_parallelism() {
            Ok(count) => count,
            Err(err) => {
                warn!("unable to determine num-cpus ({err}), assuming 1 logical CPU");
                NonZeroUsize::MIN
            }
        });

    *NUM_CPUS
}

impl FromStr for LaneCount {
    type Err = LaneCountParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "num-cpus" {
            return Ok(Self::NumCpus);
        }

        s.parse::<NonZeroUsize>()
            .map(Self::Count)
            .map_err(|_| LaneCountParseError::new(s))
    }
}

impl fmt::Display for LaneCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(lanes) => write!(f, "{lanes}"),
            Self::NumCpus => write!(f, "num-cpus"),
        }
    }
}

impl<'de> Deserialize<'de> for LaneCount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = LaneCount;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a positive integer or the string \"num-cpus\"")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v == "num-cpus" {
                    Ok(LaneCount::NumCpus)
                } else {
                    Err(serde::de::Error::invalid_value(
                        serde::de::Unexpected::Str(v),
                        &self,
                    ))
                }
            }

            // Note that TOML uses i64, not u64.
            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                usize::try_from(v)
                    .ok()
                    .and_then(NonZeroUsize::new)
                    .map(LaneCount::Count)
                    .ok_or_else(|| {
                        serde::de::Error::invalid_value(serde::de::Unexpected::Signed(v), &self)
                    })
            }
        }

        deserializer.deserialize_any(V)
    }
}
