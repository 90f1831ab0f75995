// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

mod stopwatch;

pub(crate) use stopwatch::*;

use std::time::Duration;

/// A duration that is effectively "never": roughly 30 years.
///
/// Cribbed from tokio. 1000 years overflows on macOS, 100 years overflows on
/// FreeBSD.
pub(crate) const fn far_future_duration() -> Duration {
    Duration::from_secs(86400 * 365 * 30)
}
