// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

#![warn(missing_docs)]

//! Stable types shared between `simlane` and the tools that consume its
//! results: test identifiers and documented process exit codes.

mod errors;
mod exit_codes;
mod test_id;

pub use errors::*;
pub use exit_codes::*;
pub use test_id::*;
