// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

mod fixtures;
mod orchestrator;
