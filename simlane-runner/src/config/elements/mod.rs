// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Individual configuration elements.

mod failure_tolerance;
mod lane_count;
mod retry_policy;
mod sandbox_policy;

pub use failure_tolerance::*;
pub use lane_count::*;
pub use retry_policy::*;
pub use sandbox_policy::*;
