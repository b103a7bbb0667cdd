//! Table output formatting for CLI commands
//!
//! Renders stage state, retry state and batch results with comfy-table.
//! Colors are dropped for `NO_COLOR` and dumb terminals, with a text icon in
//! their place.

use std::env;

use comfy_table::{presets, Attribute, Cell, Color, ContentArrangement, Table};

use crate::domain::models::{BatchResult, StageStateDocument, StageStatus};
use crate::services::retry_manager::RetrySummary;

use super::truncate;

/// Table formatter for CLI output
pub struct TableFormatter {
    /// Whether to use colors in output
    use_colors: bool,
    /// Maximum width for tables (None = auto)
    max_width: Option<u16>,
}

impl TableFormatter {
    pub fn new() -> Self {
        Self {
            use_colors: supports_color(),
            max_width: None,
        }
    }

    pub fn with_config(use_colors: bool, max_width: Option<u16>) -> Self {
        Self {
            use_colors,
            max_width,
        }
    }

    /// One row per stage, in execution order.
    pub fn format_stages(&self, doc: &StageStateDocument) -> String {
        let mut table = self.create_base_table();
        table.set_header(header(&["Stage", "Status", "Started", "Completed", "Notes"]));

        for (stage, state) in &doc.stages {
            let notes = if !state.errors.is_empty() {
                state.errors.join("; ")
            } else {
                state.skip_reason.clone().unwrap_or_default()
            };
            table.add_row(vec![
                Cell::new(stage.as_str()),
                self.stage_status_cell(state.status),
                Cell::new(format_time(state.started_at)),
                Cell::new(format_time(state.completed_at)),
                Cell::new(truncate(&notes, 60)),
            ]);
        }

        table.to_string()
    }

    pub fn format_retries(&self, summary: &RetrySummary) -> String {
        let mut table = self.create_base_table();
        table.set_header(header(&["Item", "Attempts", "Exhausted", "Last Error", "Agents"]));

        for item in &summary.items {
            let exhausted = if item.exhausted {
                self.colored("yes", Color::Red)
            } else {
                Cell::new("no")
            };
            let last_error = match (&item.last_error_type, &item.last_error) {
                (Some(kind), Some(message)) => format!("{kind}: {}", truncate(message, 50)),
                (Some(kind), None) => kind.to_string(),
                _ => "-".to_string(),
            };
            table.add_row(vec![
                Cell::new(&item.item_id),
                Cell::new(format!("{}/{}", item.attempts, summary.max_retries)),
                exhausted,
                Cell::new(last_error),
                Cell::new(item.agents.join(" → ")),
            ]);
        }

        table.to_string()
    }

    pub fn format_batch_results(&self, batches: &[BatchResult]) -> String {
        let mut table = self.create_base_table();
        table.set_header(header(&["Batch", "Completed", "Failed", "Retried", "Duration"]));

        for batch in batches {
            let failed = if batch.failed.is_empty() {
                Cell::new("-")
            } else {
                self.colored(&batch.failed.join(", "), Color::Red)
            };
            table.add_row(vec![
                Cell::new(batch.batch_index + 1),
                Cell::new(batch.completed.len()),
                failed,
                Cell::new(if batch.retried.is_empty() {
                    "-".to_string()
                } else {
                    batch.retried.join(", ")
                }),
                Cell::new(format!("{:.1}s", batch.duration.as_secs_f64())),
            ]);
        }

        table.to_string()
    }

    fn stage_status_cell(&self, status: StageStatus) -> Cell {
        if self.use_colors {
            Cell::new(status.to_string()).fg(stage_status_color(status))
        } else {
            Cell::new(format!("{} {status}", stage_status_icon(status)))
        }
    }

    fn colored(&self, text: &str, color: Color) -> Cell {
        if self.use_colors {
            Cell::new(text).fg(color)
        } else {
            Cell::new(text)
        }
    }

    fn create_base_table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic);
        if let Some(width) = self.max_width {
            table.set_width(width);
        }
        table
    }
}

impl Default for TableFormatter {
    fn default() -> Self {
        Self::new()
    }
}

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .map(|name| Cell::new(name).add_attribute(Attribute::Bold))
        .collect()
}

fn format_time(ts: Option<chrono::DateTime<chrono::Utc>>) -> String {
    ts.map_or_else(|| "-".to_string(), |ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// Check if terminal supports colors
fn supports_color() -> bool {
    // Respect NO_COLOR environment variable
    if env::var("NO_COLOR").is_ok() {
        return false;
    }
    if env::var("TERM").is_ok_and(|term| term == "dumb") {
        return false;
    }
    console::colors_enabled()
}

const fn stage_status_color(status: StageStatus) -> Color {
    match status {
        StageStatus::Completed => Color::Green,
        StageStatus::InProgress => Color::Cyan,
        StageStatus::Failed => Color::Red,
        StageStatus::Skipped => Color::DarkGrey,
        StageStatus::Pending => Color::Yellow,
    }
}

const fn stage_status_icon(status: StageStatus) -> &'static str {
    match status {
        StageStatus::Completed => "✓",
        StageStatus::InProgress => "▶",
        StageStatus::Failed => "✗",
        StageStatus::Skipped => "⊘",
        StageStatus::Pending => "○",
    }
}
