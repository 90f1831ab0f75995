// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Parsing workload console output into a tree of suite and case results.
//!
//! [`OutputStreamParser`] accepts raw byte chunks, splits them into lines,
//! classifies each line with a [`PatternClassifier`], and builds a
//! [`ResultTree`]. Classified events are also forwarded to a
//! [`PhaseListener`] as they arrive, which is how the lane's lifecycle
//! monitor learns that tests have started.

mod classifier;
mod events;
mod stream;
mod tree;

pub use classifier::*;
pub use events::*;
pub use stream::*;
pub use tree::{
    AnomalyKind, CountMismatch, NodeId, NodeKind, Outcome, ParseAnomaly, ResultCounts,
    ResultNode, ResultTree,
};
