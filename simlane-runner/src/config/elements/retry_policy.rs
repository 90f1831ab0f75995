// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, de};
use std::{fmt, time::Duration};

/// Type for the `error-retries` config key: how many attempts a run may make
/// beyond the first, and how long to wait before each of them.
///
/// In config, either a bare count (`error-retries = 2`, retried immediately)
/// or a table:
///
/// ```toml
/// error-retries = { count = 3, backoff = "exponential", delay = "30s", max-delay = "5m" }
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RetryPolicy {
    count: u32,
    backoff: Backoff,
}

/// The wait before each retry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Backoff {
    /// Start the next attempt right away.
    #[default]
    Immediate,

    /// Wait the same delay before every retry.
    Fixed {
        /// The delay.
        delay: Duration,

        /// Shorten each delay by a random amount, up to half.
        jitter: bool,
    },

    /// Wait `initial` before the first retry, doubling for each retry after.
    Exponential {
        /// The delay before the first retry.
        initial: Duration,

        /// The longest delay, if any.
        max: Option<Duration>,

        /// Shorten each delay by a random amount, up to half.
        jitter: bool,
    },
}

impl RetryPolicy {
    /// Creates a policy that retries `count` times without waiting.
    pub fn immediate(count: u32) -> Self {
        Self {
            count,
            backoff: Backoff::Immediate,
        }
    }

    /// Creates a policy that waits `delay` before each of `count` retries.
    pub fn fixed(count: u32, delay: Duration) -> Self {
        let backoff = if delay.is_zero() {
            Backoff::Immediate
        } else {
            Backoff::Fixed {
                delay,
                jitter: false,
            }
        };
        Self { count, backoff }
    }

    /// Creates a policy with the given backoff.
    pub fn with_backoff(count: u32, backoff: Backoff) -> Self {
        Self { count, backoff }
    }

    /// Returns the number of retries allowed.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Returns the backoff between attempts.
    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Returns the same backoff with a different retry count.
    pub fn with_count(self, count: u32) -> Self {
        Self { count, ..self }
    }
}

impl Backoff {
    /// Returns the delay before the `retry`th retry, counting from 1, without
    /// jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        match *self {
            Self::Immediate => Duration::ZERO,
            Self::Fixed { delay, .. } => delay,
            Self::Exponential { initial, max, .. } => {
                let delay = 2u32
                    .checked_pow(retry.saturating_sub(1))
                    .and_then(|factor| initial.checked_mul(factor))
                    .unwrap_or(Duration::MAX);
                max.map_or(delay, |max| delay.min(max))
            }
        }
    }

    /// Returns true if delays are shortened at random.
    pub fn has_jitter(&self) -> bool {
        match *self {
            Self::Immediate => false,
            Self::Fixed { jitter, .. } | Self::Exponential { jitter, .. } => jitter,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum BackoffKind {
    Fixed,
    Exponential,
}

/// The table form of `error-retries`, before validation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RetryTable {
    count: u32,
    #[serde(default)]
    backoff: Option<BackoffKind>,
    #[serde(default, with = "humantime_serde")]
    delay: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    max_delay: Option<Duration>,
    #[serde(default)]
    jitter: bool,
}

impl TryFrom<RetryTable> for RetryPolicy {
    type Error = &'static str;

    fn try_from(table: RetryTable) -> Result<Self, Self::Error> {
        let RetryTable {
            count,
            backoff,
            delay,
            max_delay,
            jitter,
        } = table;
        if max_delay.is_some_and(|max| max.is_zero()) {
            return Err("`max-delay` cannot be zero");
        }

        let backoff = match backoff.unwrap_or(BackoffKind::Fixed) {
            BackoffKind::Fixed => {
                if max_delay.is_some() {
                    return Err("`max-delay` only applies to exponential backoff");
                }
                match delay.filter(|delay| !delay.is_zero()) {
                    Some(delay) => Backoff::Fixed { delay, jitter },
                    None if jitter => {
                        return Err("`jitter` cannot be true if `delay` isn't specified or is zero");
                    }
                    None => Backoff::Immediate,
                }
            }
            BackoffKind::Exponential => {
                if count == 0 {
                    return Err("`count` cannot be zero with exponential backoff");
                }
                let initial = delay.ok_or("exponential backoff requires a `delay`")?;
                if initial.is_zero() {
                    return Err("`delay` cannot be zero with exponential backoff");
                }
                if max_delay.is_some_and(|max| max < initial) {
                    return Err("`max-delay` cannot be less than `delay`");
                }
                Backoff::Exponential {
                    initial,
                    max: max_delay,
                    jitter,
                }
            }
        };
        Ok(Self { count, backoff })
    }
}

pub(in crate::config) fn deserialize_retry_policy<'de, D>(
    deserializer: D,
) -> Result<Option<RetryPolicy>, D::Error>
where
    D: de::Deserializer<'de>,
{
    struct V;

    impl<'de2> de::Visitor<'de2> for V {
        type Value = Option<RetryPolicy>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str(
                "a retry count (2) or a table ({ count = 3, backoff = \"exponential\", delay = \"30s\" })",
            )
        }

        // TOML integers are i64.
        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            let count = u32::try_from(v).map_err(|_| {
                de::Error::invalid_value(de::Unexpected::Signed(v), &"a non-negative retry count")
            })?;
            Ok(Some(RetryPolicy::immediate(count)))
        }

        fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
        where
            A: de::MapAccess<'de2>,
        {
            let table = RetryTable::deserialize(de::value::MapAccessDeserializer::new(map))?;
            RetryPolicy::try_from(table)
                .map(Some)
                .map_err(de::Error::custom)
        }
    }

    deserializer.deserialize_any(V)
}
