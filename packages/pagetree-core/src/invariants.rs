//! Structural audit of the canonical nested set.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::ids::NodeId;
use crate::node::{Bounds, Node};

/// Checks the canonical rows of a tree (drafts are skipped):
///
/// * at most one root, and exactly one when any canonical row exists;
/// * every bound value in `1..=2n` is used exactly once;
/// * every interval has odd, positive `right - left`;
/// * intervals nest without partial overlap, and each node's `parent` is the
///   nearest interval containing it.
pub fn check_canonical(nodes: &[Node]) -> Result<()> {
    let mut rows: Vec<(NodeId, Option<NodeId>, Bounds)> = nodes
        .iter()
        .filter_map(|n| n.bounds().map(|b| (n.id, n.parent(), b)))
        .collect();
    if rows.is_empty() {
        return Ok(());
    }
    rows.sort_by_key(|(_, _, b)| b.left);

    let roots = rows.iter().filter(|(_, parent, _)| parent.is_none()).count();
    if roots != 1 {
        return Err(violation(format!("expected exactly one root, found {roots}")));
    }

    let max = 2 * rows.len() as i64;
    let mut seen = HashSet::with_capacity(rows.len() * 2);
    for (id, _, bounds) in &rows {
        let span = bounds.right - bounds.left;
        if span < 1 || span % 2 == 0 {
            return Err(violation(format!(
                "node {id} has invalid bounds ({}, {})",
                bounds.left, bounds.right
            )));
        }
        for value in [bounds.left, bounds.right] {
            if !(1..=max).contains(&value) {
                return Err(violation(format!(
                    "node {id} bound {value} outside 1..={max}"
                )));
            }
            if !seen.insert(value) {
                return Err(violation(format!("bound {value} used twice (node {id})")));
            }
        }
    }

    let mut open: Vec<(NodeId, Bounds)> = Vec::new();
    for (id, parent, bounds) in &rows {
        while open.last().is_some_and(|(_, b)| b.right < bounds.left) {
            open.pop();
        }
        match open.last() {
            Some((enclosing, outer)) => {
                if outer.right < bounds.right {
                    return Err(violation(format!(
                        "node {id} partially overlaps node {enclosing}"
                    )));
                }
                if *parent != Some(*enclosing) {
                    return Err(violation(format!(
                        "node {id} is nested in {enclosing} but its parent is {}",
                        parent.map_or_else(|| "none".to_string(), |p| p.to_string())
                    )));
                }
            }
            None => {
                if parent.is_some() {
                    return Err(violation(format!("node {id} lies outside the root")));
                }
            }
        }
        open.push((*id, *bounds));
    }
    Ok(())
}

fn violation(msg: String) -> Error {
    tracing::warn!("nested set check failed: {msg}");
    Error::InvariantViolation(msg)
}
