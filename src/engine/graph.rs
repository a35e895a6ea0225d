use std::collections::{BTreeSet, HashMap, HashSet};

use crate::types::TaskId;

/// Detects a cycle in a dependency graph (task -> tasks it depends on) using
/// DFS with recursion-stack marking. Returns the offending path.
pub(crate) fn detect_cycle(dependencies: &HashMap<TaskId, BTreeSet<TaskId>>) -> Option<Vec<TaskId>> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    // Sorted roots keep the reported path deterministic.
    let mut roots: Vec<&TaskId> = dependencies.keys().collect();
    roots.sort();

    for node in roots {
        if dfs_cycle(*node, dependencies, &mut visited, &mut rec_stack, &mut path) {
            // Drop the lead-in so the path starts and ends on the same node.
            if let Some(closing) = path.last().copied() {
                let start = path.iter().position(|n| *n == closing).unwrap_or(0);
                path.drain(..start);
            }
            return Some(path);
        }
    }

    None
}

fn dfs_cycle(
    node: TaskId,
    graph: &HashMap<TaskId, BTreeSet<TaskId>>,
    visited: &mut HashSet<TaskId>,
    rec_stack: &mut HashSet<TaskId>,
    path: &mut Vec<TaskId>,
) -> bool {
    if rec_stack.contains(&node) {
        path.push(node);
        return true;
    }

    if visited.contains(&node) {
        return false;
    }

    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(deps) = graph.get(&node) {
        for dep in deps {
            if dfs_cycle(*dep, graph, visited, rec_stack, path) {
                return true;
            }
        }
    }

    rec_stack.remove(&node);
    path.pop();
    false
}
