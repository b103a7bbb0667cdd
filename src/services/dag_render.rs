//! Text and Mermaid renderings of a plan's dependency graph.

use std::collections::HashSet;
use std::fmt::Write;

use crate::domain::models::{ItemStatus, Plan};
use crate::services::batch_scheduler::BatchScheduler;

fn status_marker(status: ItemStatus) -> char {
    match status {
        ItemStatus::Pending => ' ',
        ItemStatus::InProgress => '~',
        ItemStatus::Complete => 'x',
        ItemStatus::Failed => '!',
    }
}

/// Render every item grouped by batch, with dependency arrows and a trailing
/// cycle report.
pub fn render_dag(plan: &Plan) -> String {
    let scheduler = BatchScheduler::new();
    let batches = scheduler.schedule(plan.items(), &HashSet::new());
    let mut out = String::new();

    if !plan.goal.is_empty() {
        let _ = writeln!(out, "Goal: {}", plan.goal);
    }
    let _ = writeln!(out, "{} items in {} batches\n", plan.len(), batches.len());

    for batch in &batches {
        let forced = if batch.forced { " [forced]" } else { "" };
        let _ = writeln!(
            out,
            "Batch {} ({} item{}){forced}",
            batch.index + 1,
            batch.len(),
            if batch.len() == 1 { "" } else { "s" }
        );
        for item in &batch.items {
            let _ = writeln!(
                out,
                "  [{}] {}  {} ({})",
                status_marker(item.status),
                item.id,
                item.title,
                item.priority
            );
            if !item.dependencies.is_empty() {
                let _ = writeln!(out, "        <- {}", item.dependencies.join(", "));
            }
        }
        out.push('\n');
    }

    let cycles = scheduler.detect_cycles(plan.items());
    if !cycles.is_empty() {
        out.push_str("Cycles:\n");
        for cycle in cycles {
            let _ = writeln!(out, "  {}", cycle.join(" -> "));
        }
    }

    out.trim_end().to_string()
}

fn node_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Render a Mermaid `graph TD` block. Edges point from a dependency to its
/// dependent.
pub fn render_mermaid(plan: &Plan) -> String {
    let mut out = String::from("graph TD\n");
    let known: HashSet<&str> = plan.items().iter().map(|item| item.id.as_str()).collect();

    for item in plan.items() {
        let label = format!("{}: {}", item.id, item.title).replace('"', "#quot;");
        let _ = writeln!(out, "    {}[\"{label}\"]", node_id(&item.id));
    }
    for item in plan.items() {
        for dep in item.dependencies.iter().filter(|dep| known.contains(dep.as_str())) {
            let _ = writeln!(out, "    {} --> {}", node_id(dep), node_id(&item.id));
        }
    }

    out.push_str("    classDef complete fill:#d4edda,stroke:#28a745\n");
    out.push_str("    classDef failed fill:#f8d7da,stroke:#dc3545\n");
    out.push_str("    classDef in_progress fill:#fff3cd,stroke:#ffc107\n");
    for item in plan.items() {
        if item.status != ItemStatus::Pending {
            let _ = writeln!(out, "    class {} {}", node_id(&item.id), item.status);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{PlanKind, WorkItem};

    fn plan() -> Plan {
        Plan::new(
            PlanKind::Feature,
            "demo",
            vec![
                WorkItem::new("s-1", "Schema").with_status(ItemStatus::Complete),
                WorkItem::new("s-2", "Say \"hi\"").with_dependencies(["s-1"]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_render_dag_groups_by_batch() {
        let text = render_dag(&plan());
        assert!(text.starts_with("Goal: demo"));
        assert!(text.contains("Batch 1 (1 item)\n  [x] s-1  Schema (medium)"));
        assert!(text.contains("Batch 2 (1 item)"));
        assert!(text.contains("<- s-1"));
        assert!(!text.contains("Cycles:"));
    }

    #[test]
    fn test_render_dag_lists_cycles() {
        let plan = Plan::new(
            PlanKind::Project,
            "",
            vec![
                WorkItem::new("x", "X").with_dependencies(["y"]),
                WorkItem::new("y", "Y").with_dependencies(["x"]),
            ],
        )
        .unwrap();
        let text = render_dag(&plan);
        assert!(text.contains("[forced]"));
        assert!(text.contains("Cycles:\n  x -> y -> x"));
    }

    #[test]
    fn test_render_mermaid_edges_and_classes() {
        let text = render_mermaid(&plan());
        assert!(text.starts_with("graph TD\n"));
        assert!(text.contains("    s_2[\"s-2: Say #quot;hi#quot;\"]"));
        assert!(text.contains("    s_1 --> s_2"));
        assert!(text.contains("    class s_1 complete"));
    }
}
