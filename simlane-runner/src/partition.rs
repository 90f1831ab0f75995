// Copyright (c) The simlane Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Packing tests into lanes.
//!
//! Tests are weighted by their historical durations and packed with the
//! longest-processing-time-first heuristic: heaviest item first, each into
//! the currently lightest lane. No-split groups are packed as a single item
//! whose weight is the sum of their members.

use crate::{errors::PackError, universe::TestUniverse};
use simlane_metadata::TestIdentifier;
use std::{
    collections::{HashMap, hash_map::Entry},
    num::NonZeroUsize,
};
use tracing::debug;

/// The tests assigned to one lane.
#[derive(Clone, Debug, PartialEq)]
pub struct LaneAssignment {
    index: usize,
    tests: Vec<TestIdentifier>,
    weight: f64,
}

impl LaneAssignment {
    /// Returns the index of the lane, starting at 0.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the tests in the order they were assigned.
    pub fn tests(&self) -> &[TestIdentifier] {
        &self.tests
    }

    /// Returns the sum of the duration estimates of the tests, in seconds.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Returns true if no tests were assigned to this lane.
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }
}

/// The result of packing a universe into lanes.
///
/// Always holds the requested number of lanes; lanes past the number of
/// packed items are empty.
#[derive(Clone, Debug, PartialEq)]
pub struct Assignment {
    lanes: Vec<LaneAssignment>,
}

impl Assignment {
    /// Returns every lane, including empty ones.
    pub fn lanes(&self) -> &[LaneAssignment] {
        &self.lanes
    }

    /// Returns the lanes that have at least one test.
    pub fn populated(&self) -> impl Iterator<Item = &LaneAssignment> + '_ {
        self.lanes.iter().filter(|lane| !lane.is_empty())
    }

    /// Returns the number of lanes that have at least one test.
    pub fn populated_count(&self) -> usize {
        self.populated().count()
    }

    /// Returns the total number of tests across all lanes.
    pub fn test_count(&self) -> usize {
        self.lanes.iter().map(|lane| lane.tests.len()).sum()
    }

    /// Returns the lane `test` was assigned to, if any.
    pub fn lane_of(&self, test: &TestIdentifier) -> Option<usize> {
        self.lanes
            .iter()
            .find(|lane| lane.tests.contains(test))
            .map(|lane| lane.index)
    }

    /// Returns the weight of the heaviest lane: the expected makespan.
    pub fn makespan(&self) -> f64 {
        self.lanes
            .iter()
            .map(|lane| lane.weight)
            .fold(0.0, f64::max)
    }
}

/// A single unit of packing: one test, or every selected member of a no-split
/// group.
#[derive(Debug)]
struct PackItem<'a> {
    members: Vec<&'a TestIdentifier>,
    weight: f64,
}

/// Packs the filtered tests of `universe` into `lane_count` lanes.
///
/// Packing is deterministic. Items of equal weight keep their listing order
/// (by first member). An item goes to the lightest lane; among lanes of equal
/// weight, to the one holding the fewest items, then the lowest-indexed.
pub fn pack(universe: &TestUniverse, lane_count: NonZeroUsize) -> Result<Assignment, PackError> {
    let membership = resolve_no_split_groups(universe)?;

    let mut items: Vec<PackItem<'_>> = Vec::new();
    let mut group_items: HashMap<usize, usize> = HashMap::new();
    for (_, test) in universe.filtered() {
        let weight = universe.durations().estimate(test);
        match membership.get(test) {
            Some(&group_idx) => match group_items.entry(group_idx) {
                Entry::Occupied(entry) => {
                    let item = &mut items[*entry.get()];
                    item.members.push(test);
                    item.weight += weight;
                }
                Entry::Vacant(entry) => {
                    entry.insert(items.len());
                    items.push(PackItem {
                        members: vec![test],
                        weight,
                    });
                }
            },
            None => items.push(PackItem {
                members: vec![test],
                weight,
            }),
        }
    }

    // Stable, so equal weights keep listing order.
    items.sort_by(|a, b| b.weight.total_cmp(&a.weight));

    let mut lanes: Vec<LaneAssignment> = (0..lane_count.get())
        .map(|index| LaneAssignment {
            index,
            tests: Vec::new(),
            weight: 0.0,
        })
        .collect();

    // Items per lane, so zero-weight items still spread out.
    let mut item_counts = vec![0usize; lanes.len()];
    for item in &items {
        let mut target = 0;
        for (idx, lane) in lanes.iter().enumerate().skip(1) {
            let current = &lanes[target];
            let lighter = lane.weight < current.weight;
            let as_light_but_emptier =
                lane.weight == current.weight && item_counts[idx] < item_counts[target];
            if lighter || as_light_but_emptier {
                target = idx;
            }
        }
        let lane = &mut lanes[target];
        lane.tests.extend(item.members.iter().map(|&test| test.clone()));
        lane.weight += item.weight;
        item_counts[target] += 1;
    }

    let assignment = Assignment { lanes };
    debug!(
        lanes = lane_count.get(),
        items = items.len(),
        tests = assignment.test_count(),
        populated = assignment.populated_count(),
        makespan = assignment.makespan(),
        "packed tests into lanes"
    );
    Ok(assignment)
}

/// Maps each test in a no-split group to the index of its group.
///
/// Groups resolve against every listed test, not just the filtered ones: a
/// filter may leave a group with fewer members, but an entry matching nothing
/// at all is a configuration error.
fn resolve_no_split_groups(
    universe: &TestUniverse,
) -> Result<HashMap<&TestIdentifier, usize>, PackError> {
    let groups = universe.no_split_groups();
    let mut membership = HashMap::new();

    for (group_idx, group) in groups.iter().enumerate() {
        for entry in group.entries() {
            let mut matched = false;
            for test in universe.tests().iter().filter(|test| entry.matches(test)) {
                matched = true;
                match membership.entry(test) {
                    Entry::Vacant(vacant) => {
                        vacant.insert(group_idx);
                    }
                    Entry::Occupied(occupied) if *occupied.get() != group_idx => {
                        return Err(PackError::MemberInMultipleGroups {
                            test: test.clone(),
                            first: groups[*occupied.get()].name().to_owned(),
                            second: group.name().to_owned(),
                        });
                    }
                    // Listed twice in the same group.
                    Entry::Occupied(_) => {}
                }
            }
            if !matched {
                return Err(PackError::UnknownNoSplitMember {
                    group: group.name().to_owned(),
                    entry: entry.to_string(),
                });
            }
        }
    }

    Ok(membership)
}
