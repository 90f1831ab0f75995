// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration support for simlane.
//!
//! See the default config in `default-config.toml` for the available keys.

mod elements;
mod imp;

pub use elements::*;
pub use imp::*;
