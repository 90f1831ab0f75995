// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command-line front end for simlane.
//!
//! `simlane plan` prints how a test list would be spread across lanes.
//! `simlane run` runs it: each lane starts the given runner command in its
//! own scratch directory, and failed attempts are retried according to the
//! active profile.

#![warn(missing_docs)]

mod dispatch;
mod errors;
mod output;
mod reporter;

#[doc(hidden)]
pub use dispatch::*;
#[doc(hidden)]
pub use errors::*;
#[doc(hidden)]
pub use output::{OutputContext, StderrStyles};
