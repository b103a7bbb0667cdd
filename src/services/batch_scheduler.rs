use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::domain::models::{ExecutionBatch, Plan, WorkItem};

/// Splits a plan into dependency-ordered batches of items that may run in
/// parallel.
#[derive(Debug, Clone, Default)]
pub struct BatchScheduler;

// DFS with a recursion stack; every back edge closes one cycle.
fn collect_cycles<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
    cycles: &mut Vec<Vec<String>>,
) {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    if let Some(neighbors) = graph.get(node) {
        for &neighbor in neighbors {
            if !visited.contains(neighbor) {
                collect_cycles(neighbor, graph, visited, rec_stack, path, cycles);
            } else if rec_stack.contains(neighbor) {
                if let Some(start) = path.iter().position(|&id| id == neighbor) {
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|id| (*id).to_string()).collect();
                    cycle.push(neighbor.to_string());
                    cycles.push(cycle);
                }
            }
        }
    }

    rec_stack.remove(node);
    path.pop();
}

/// Rotation-independent identity of a closed path.
fn cycle_key(cycle: &[String]) -> Vec<String> {
    let open = &cycle[..cycle.len().saturating_sub(1)];
    let Some(min_pos) = open
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(pos, _)| pos)
    else {
        return Vec::new();
    };
    open[min_pos..].iter().chain(&open[..min_pos]).cloned().collect()
}

impl BatchScheduler {
    pub fn new() -> Self {
        Self
    }

    /// Schedule every item of `plan` that is not already complete.
    pub fn schedule_plan(&self, plan: &Plan) -> Vec<ExecutionBatch> {
        self.schedule(plan.items(), &plan.completed_ids())
    }

    /// Build batches from `items`, treating ids in `completed` as done.
    ///
    /// Each batch holds every remaining item whose dependencies are satisfied
    /// by `completed` and earlier batches, ordered by priority then input
    /// order. A dependency naming no known item counts as satisfied. When
    /// nothing is ready but items remain, the rest become one final batch
    /// flagged `forced`.
    pub fn schedule(&self, items: &[WorkItem], completed: &HashSet<String>) -> Vec<ExecutionBatch> {
        let known: HashSet<&str> = items.iter().map(|item| item.id.as_str()).collect();
        for item in items {
            for dep in &item.dependencies {
                if !known.contains(dep.as_str()) && !completed.contains(dep) {
                    warn!(
                        item_id = %item.id,
                        dependency = %dep,
                        "dependency names an unknown item; treating it as satisfied"
                    );
                }
            }
        }

        let mut done: HashSet<&str> = completed.iter().map(String::as_str).collect();
        let mut remaining: Vec<&WorkItem> = items
            .iter()
            .filter(|item| !completed.contains(&item.id))
            .collect();
        let mut batches = Vec::new();

        while !remaining.is_empty() {
            let (mut ready, blocked): (Vec<&WorkItem>, Vec<&WorkItem>) =
                remaining.into_iter().partition(|item| {
                    item.dependencies.iter().all(|dep| {
                        done.contains(dep.as_str()) || !known.contains(dep.as_str())
                    })
                });

            if ready.is_empty() {
                let mut rest = blocked;
                rest.sort_by_key(|item| item.priority);
                let ids: Vec<&str> = rest.iter().map(|item| item.id.as_str()).collect();
                let cycles = self.detect_cycles(items);
                warn!(
                    batch = batches.len(),
                    items = ?ids,
                    cycles = ?cycles,
                    "no item is ready; scheduling the remainder as one forced batch"
                );
                let mut batch =
                    ExecutionBatch::new(batches.len(), rest.into_iter().cloned().collect());
                batch.forced = true;
                batches.push(batch);
                break;
            }

            ready.sort_by_key(|item| item.priority);
            for item in &ready {
                done.insert(item.id.as_str());
            }
            debug!(batch = batches.len(), size = ready.len(), "batch scheduled");
            batches.push(ExecutionBatch::new(
                batches.len(),
                ready.into_iter().cloned().collect(),
            ));
            remaining = blocked;
        }

        batches
    }

    /// Report every distinct dependency cycle as a closed path, e.g.
    /// `[X, Y, X]`. Edges point from an item to its dependencies; unknown
    /// dependencies are ignored.
    pub fn detect_cycles(&self, items: &[WorkItem]) -> Vec<Vec<String>> {
        let known: HashSet<&str> = items.iter().map(|item| item.id.as_str()).collect();
        let graph: HashMap<&str, Vec<&str>> = items
            .iter()
            .map(|item| {
                let deps = item
                    .dependencies
                    .iter()
                    .map(String::as_str)
                    .filter(|dep| known.contains(dep))
                    .collect();
                (item.id.as_str(), deps)
            })
            .collect();

        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();
        let mut found = Vec::new();

        for item in items {
            if !visited.contains(item.id.as_str()) {
                collect_cycles(
                    item.id.as_str(),
                    &graph,
                    &mut visited,
                    &mut rec_stack,
                    &mut path,
                    &mut found,
                );
            }
        }

        let mut seen = HashSet::new();
        found.retain(|cycle| seen.insert(cycle_key(cycle)));
        found
    }
}
