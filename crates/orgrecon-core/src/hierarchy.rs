use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::record::StructureRecord;

/// Upper bound on any parent-link walk.
pub const MAX_WALK_DEPTH: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OrphanReference {
    pub code: String,
    pub missing_parent: String,
}

/// Structural findings over one structure set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct HierarchyReport {
    /// Arrow-joined cycle paths, one per distinct cycle.
    pub cycles: Vec<String>,
    pub cycle_members: BTreeSet<String>,
    pub self_references: Vec<String>,
    pub orphans: Vec<OrphanReference>,
    pub roots: Vec<String>,
    pub duplicate_codes: Vec<String>,
}

impl HierarchyReport {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.cycles.is_empty()
            && self.self_references.is_empty()
            && self.orphans.is_empty()
            && self.duplicate_codes.is_empty()
    }
}

/// Code-indexed view of a structure set with a parent to children index.
///
/// Built once per operation; traversal goes through code lookups only.
#[derive(Debug)]
pub struct Hierarchy<'a> {
    order: Vec<&'a str>,
    nodes: HashMap<&'a str, &'a StructureRecord>,
    children: HashMap<&'a str, Vec<&'a str>>,
    duplicates: Vec<String>,
}

impl<'a> Hierarchy<'a> {
    /// Indexes `records` in input order. For a repeated code the first record wins.
    #[must_use]
    pub fn new(records: &'a [StructureRecord]) -> Self {
        let mut order = Vec::with_capacity(records.len());
        let mut nodes = HashMap::with_capacity(records.len());
        let mut duplicates = Vec::new();
        for record in records {
            let code = record.code.as_str();
            if nodes.contains_key(code) {
                duplicates.push(code.to_string());
                continue;
            }
            nodes.insert(code, record);
            order.push(code);
        }

        let mut children: HashMap<&'a str, Vec<&'a str>> = HashMap::new();
        for &code in &order {
            let record: &'a StructureRecord = nodes[code];
            if let Some(parent) = parent_of(record) {
                if parent != code {
                    children.entry(parent).or_default().push(code);
                }
            }
        }

        Self { order, nodes, children, duplicates }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    #[must_use]
    pub fn contains(&self, code: &str) -> bool {
        self.nodes.contains_key(code)
    }

    #[must_use]
    pub fn get(&self, code: &str) -> Option<&'a StructureRecord> {
        self.nodes.get(code).copied()
    }

    #[must_use]
    pub fn children(&self, code: &str) -> &[&'a str] {
        self.children.get(code).map_or(&[], Vec::as_slice)
    }

    /// Codes without a parent, in input order.
    #[must_use]
    pub fn roots(&self) -> Vec<&'a str> {
        self.order.iter().copied().filter(|code| parent_of(self.nodes[code]).is_none()).collect()
    }

    /// Parent chain of `code`, nearest first.
    ///
    /// Stops at a root, a missing parent, a self reference, or on re-entering the chain.
    #[must_use]
    pub fn ancestors(&self, code: &str) -> Vec<&'a str> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let Some(mut current) = self.get(code).map(|record| record.code.as_str()) else {
            return chain;
        };
        seen.insert(current);
        while chain.len() < MAX_WALK_DEPTH {
            let Some(parent) = self.next_hop(current) else {
                break;
            };
            if !seen.insert(parent) {
                break;
            }
            chain.push(parent);
            current = parent;
        }
        chain
    }

    /// Distance from the root, `None` for unknown codes and nodes on or below a
    /// cycle or a dangling reference.
    #[must_use]
    pub fn depth(&self, code: &str) -> Option<usize> {
        let record = self.nodes.get(code)?;
        let ancestors = self.ancestors(code);
        let top = ancestors.last().copied().unwrap_or(record.code.as_str());
        if parent_of(self.nodes[top]).is_none() {
            Some(ancestors.len())
        } else {
            None
        }
    }

    /// Every distinct parent cycle as `A -> B -> ... -> A`, following parent links.
    ///
    /// Each code starts its own walk with a walk-local path. A parent absent from
    /// the set ends the walk without a finding; self references are reported by
    /// [`Hierarchy::self_references`] instead. Rotations of a cycle already
    /// reported are dropped.
    #[must_use]
    pub fn detect_cycles(&self) -> Vec<String> {
        let mut reported = HashSet::new();
        let mut cycles = Vec::new();
        for &start in &self.order {
            let Some(cycle) = self.walk_for_cycle(start) else {
                continue;
            };
            if reported.insert(canonical_rotation(&cycle)) {
                let mut closed = cycle.clone();
                closed.push(cycle[0]);
                cycles.push(closed.join(" -> "));
            }
        }
        cycles
    }

    fn walk_for_cycle(&self, start: &'a str) -> Option<Vec<&'a str>> {
        let mut path: Vec<&'a str> = Vec::new();
        let mut position: HashMap<&'a str, usize> = HashMap::new();
        let mut current = start;
        loop {
            if let Some(&first) = position.get(current) {
                return Some(path[first..].to_vec());
            }
            if path.len() >= MAX_WALK_DEPTH {
                tracing::warn!(start, depth = path.len(), "hierarchy walk exceeded depth limit");
                return None;
            }
            position.insert(current, path.len());
            path.push(current);
            current = self.next_hop(current)?;
        }
    }

    /// Parent of `code` when it is a different, known structure.
    fn next_hop(&self, code: &str) -> Option<&'a str> {
        let parent = parent_of(self.nodes.get(code)?)?;
        if parent == code {
            return None;
        }
        self.get(parent).map(|record| record.code.as_str())
    }

    #[must_use]
    pub fn self_references(&self) -> Vec<&'a str> {
        self.order
            .iter()
            .copied()
            .filter(|code| parent_of(self.nodes[code]) == Some(*code))
            .collect()
    }

    /// Structures whose parent code matches no structure in the set.
    #[must_use]
    pub fn orphans(&self) -> Vec<OrphanReference> {
        self.order
            .iter()
            .filter_map(|code| {
                let parent = parent_of(self.nodes[code])?;
                if self.nodes.contains_key(parent) {
                    return None;
                }
                Some(OrphanReference {
                    code: (*code).to_string(),
                    missing_parent: parent.to_string(),
                })
            })
            .collect()
    }

    #[must_use]
    pub fn report(&self) -> HierarchyReport {
        let cycles = self.detect_cycles();
        let cycle_members = cycles
            .iter()
            .flat_map(|cycle| cycle.split(" -> ").map(str::to_string))
            .collect();
        HierarchyReport {
            cycles,
            cycle_members,
            self_references: self.self_references().into_iter().map(str::to_string).collect(),
            orphans: self.orphans(),
            roots: self.roots().into_iter().map(str::to_string).collect(),
            duplicate_codes: self.duplicates.clone(),
        }
    }
}

/// Runs every structural check over `records`.
#[must_use]
pub fn validate_hierarchy(records: &[StructureRecord]) -> HierarchyReport {
    Hierarchy::new(records).report()
}

/// Cycle strings only; empty when the parent graph is acyclic.
#[must_use]
pub fn detect_cycles(records: &[StructureRecord]) -> Vec<String> {
    Hierarchy::new(records).detect_cycles()
}

fn parent_of(record: &StructureRecord) -> Option<&str> {
    record.parent_code.as_deref().map(str::trim).filter(|parent| !parent.is_empty())
}

fn canonical_rotation(cycle: &[&str]) -> Vec<String> {
    let start = cycle
        .iter()
        .enumerate()
        .min_by_key(|(_, code)| **code)
        .map_or(0, |(index, _)| index);
    cycle[start..].iter().chain(&cycle[..start]).map(|code| (*code).to_string()).collect()
}
