use std::collections::{HashMap, HashSet};

use cascade::domain::models::{Priority, WorkItem};
use cascade::services::BatchScheduler;
use proptest::prelude::*;

fn priority(n: u8) -> Priority {
    match n % 3 {
        0 => Priority::High,
        1 => Priority::Medium,
        _ => Priority::Low,
    }
}

/// Items `s0..sN` where each may depend only on lower-numbered items.
fn acyclic_items(edges: &[(u8, Vec<usize>)]) -> Vec<WorkItem> {
    edges
        .iter()
        .enumerate()
        .map(|(i, (p, deps))| {
            let deps: Vec<String> = deps
                .iter()
                .filter(|_| i > 0)
                .map(|d| format!("s{}", d % i))
                .collect();
            WorkItem::new(format!("s{i}"), format!("Item {i}"))
                .with_priority(priority(*p))
                .with_dependencies(deps)
        })
        .collect()
}

/// Items whose dependencies may point anywhere, including themselves.
fn arbitrary_items(edges: &[(u8, Vec<usize>)]) -> Vec<WorkItem> {
    let n = edges.len();
    edges
        .iter()
        .enumerate()
        .map(|(i, (p, deps))| {
            let deps: Vec<String> = deps.iter().map(|d| format!("s{}", d % n)).collect();
            WorkItem::new(format!("s{i}"), format!("Item {i}"))
                .with_priority(priority(*p))
                .with_dependencies(deps)
        })
        .collect()
}

fn edges_strategy() -> impl Strategy<Value = Vec<(u8, Vec<usize>)>> {
    prop::collection::vec((any::<u8>(), prop::collection::vec(0usize..64, 0..4)), 1..30)
}

proptest! {
    /// Property: every item lands in exactly one batch
    #[test]
    fn prop_every_item_scheduled_once(edges in edges_strategy()) {
        let items = arbitrary_items(&edges);
        let batches = BatchScheduler::new().schedule(&items, &HashSet::new());

        let mut seen = HashSet::new();
        for batch in &batches {
            for item in &batch.items {
                prop_assert!(seen.insert(item.id.clone()), "{} scheduled twice", item.id);
            }
        }
        prop_assert_eq!(seen.len(), items.len());
    }

    /// Property: in an acyclic plan every dependency runs in an earlier batch
    #[test]
    fn prop_dependencies_precede_dependents(edges in edges_strategy()) {
        let items = acyclic_items(&edges);
        let batches = BatchScheduler::new().schedule(&items, &HashSet::new());

        let position: HashMap<&str, usize> = batches
            .iter()
            .flat_map(|batch| batch.items.iter().map(move |item| (item.id.as_str(), batch.index)))
            .collect();
        for batch in &batches {
            prop_assert!(!batch.forced);
            for item in &batch.items {
                for dep in &item.dependencies {
                    prop_assert!(position[dep.as_str()] < batch.index,
                        "{} in batch {} depends on {} in batch {}",
                        item.id, batch.index, dep, position[dep.as_str()]);
                }
            }
        }
    }

    /// Property: batches are ordered by priority, stable within a priority
    #[test]
    fn prop_batches_sorted_by_priority(edges in edges_strategy()) {
        let items = arbitrary_items(&edges);
        let input_order: HashMap<String, usize> =
            items.iter().enumerate().map(|(i, item)| (item.id.clone(), i)).collect();

        for batch in BatchScheduler::new().schedule(&items, &HashSet::new()) {
            for pair in batch.items.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                prop_assert!(a.priority <= b.priority);
                if a.priority == b.priority {
                    prop_assert!(input_order[&a.id] < input_order[&b.id]);
                }
            }
        }
    }

    /// Property: only the final batch can be forced
    #[test]
    fn prop_forced_batch_is_last(edges in edges_strategy()) {
        let items = arbitrary_items(&edges);
        let batches = BatchScheduler::new().schedule(&items, &HashSet::new());
        for batch in batches.iter().rev().skip(1) {
            prop_assert!(!batch.forced);
        }
        for (i, batch) in batches.iter().enumerate() {
            prop_assert_eq!(batch.index, i);
        }
    }

    /// Property: completed items are never rescheduled
    #[test]
    fn prop_completed_items_skipped(edges in edges_strategy(), done in prop::collection::vec(0usize..64, 0..10)) {
        let items = acyclic_items(&edges);
        let completed: HashSet<String> =
            done.iter().map(|d| format!("s{}", d % items.len())).collect();

        let scheduled: usize = BatchScheduler::new()
            .schedule(&items, &completed)
            .iter()
            .map(|batch| {
                for item in &batch.items {
                    assert!(!completed.contains(&item.id));
                }
                batch.items.len()
            })
            .sum();
        prop_assert_eq!(scheduled, items.len() - completed.len());
    }
}
