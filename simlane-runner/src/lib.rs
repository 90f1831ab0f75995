// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Core functionality for simlane, a runner that spreads a universe of tests
//! across parallel sandboxed lanes.
//!
//! The flow of a run:
//!
//! 1. A [`TestUniverse`](universe::TestUniverse) is built from a test list,
//!    historical durations, no-split groups and a filter.
//! 2. [`pack`](partition::pack) distributes it over lanes, longest tests first.
//! 3. The [`Orchestrator`](runner::Orchestrator) drives one task per lane. Each
//!    lane creates a sandbox instance through a
//!    [`SimulatorControl`](sandbox::SimulatorControl), launches the workload,
//!    and feeds its output to an
//!    [`OutputStreamParser`](parser::OutputStreamParser) while a
//!    [`LaneMonitor`](monitor::LaneMonitor) watches for silence and overruns.
//! 4. Lane results are folded into an [`ExitStatus`](runner::ExitStatus) that
//!    decides whether another attempt runs.

pub mod config;
pub mod errors;
pub mod monitor;
pub mod parser;
pub mod partition;
pub mod runner;
pub mod sandbox;
pub mod signal;
pub mod statistics;
mod time;
pub mod universe;
