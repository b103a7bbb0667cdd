//! Progress display for a run using indicatif
//!
//! One bar counts finished items across the whole plan; one spinner per
//! running item shows its agent and attempt. Both are driven entirely by the
//! `ExecutionEvent`s the executors emit.

use std::collections::HashMap;
use std::time::Duration;

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::services::batch_executor::ExecutionEvent;

const PROGRESS_TEMPLATE: &str = "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}";
const SPINNER_TEMPLATE: &str = "  {spinner:.green} {msg}";

const PROGRESS_CHARS: &str = "█▓▒░ ";
const SPINNER_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ";

/// Channel capacity between the executors and the display.
const EVENT_BUFFER: usize = 256;

pub fn create_progress_bar(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template(PROGRESS_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars(PROGRESS_CHARS);
    pb.set_style(style);
    pb
}

pub fn create_spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template(SPINNER_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars(SPINNER_CHARS);
    spinner.set_style(style);
    spinner.enable_steady_tick(Duration::from_millis(80));
    spinner
}

/// Live view of a run fed by execution events.
pub struct ExecutionProgress {
    multi: MultiProgress,
    overall: ProgressBar,
    items: HashMap<String, ProgressBar>,
}

impl ExecutionProgress {
    pub fn new(total_items: u64) -> Self {
        let multi = MultiProgress::new();
        let overall = multi.add(create_progress_bar(total_items));
        Self {
            multi,
            overall,
            items: HashMap::new(),
        }
    }

    /// Same bookkeeping with nothing drawn.
    pub fn hidden(total_items: u64) -> Self {
        let progress = Self::new(total_items);
        progress.multi.set_draw_target(ProgressDrawTarget::hidden());
        progress
    }

    /// Spawn a consumer and hand back the sender for the executors.
    pub fn spawn(self) -> (mpsc::Sender<ExecutionEvent>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let handle = tokio::spawn(async move {
            let mut progress = self;
            while let Some(event) = rx.recv().await {
                progress.apply(&event);
            }
            progress.finish();
        });
        (tx, handle)
    }

    pub fn apply(&mut self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::BatchStarted {
                batch_index,
                item_count,
            } => {
                self.overall
                    .set_message(format!("batch {} ({item_count} items)", batch_index + 1));
            }
            ExecutionEvent::ItemStarted {
                item_id,
                agent,
                attempt,
            } => {
                let spinner = self.spinner(item_id);
                spinner.set_message(format!("{item_id} · {agent} · attempt {attempt}"));
            }
            ExecutionEvent::ItemRetrying {
                item_id,
                attempt,
                delay_ms,
                error,
            } => {
                let spinner = self.spinner(item_id);
                spinner.set_message(format!(
                    "{item_id} · retry {attempt} in {delay_ms}ms · {}",
                    super::truncate(error, 60)
                ));
            }
            ExecutionEvent::ItemCompleted { item_id, attempts } => {
                self.finish_item(
                    item_id,
                    format!("{} {item_id} ({attempts} attempt(s))", style("✓").green()),
                );
            }
            ExecutionEvent::ItemFailed {
                item_id,
                error,
                error_type,
            } => {
                self.finish_item(
                    item_id,
                    format!(
                        "{} {item_id} [{error_type}] {}",
                        style("✗").red(),
                        super::truncate(error, 60)
                    ),
                );
            }
            ExecutionEvent::BatchCompleted {
                batch_index,
                completed,
                failed,
                duration_secs,
            } => {
                self.overall.set_message(format!(
                    "batch {} done: {completed} ok, {failed} failed in {duration_secs:.1}s",
                    batch_index + 1
                ));
            }
        }
    }

    pub fn position(&self) -> u64 {
        self.overall.position()
    }

    fn spinner(&mut self, item_id: &str) -> &ProgressBar {
        let multi = &self.multi;
        self.items
            .entry(item_id.to_string())
            .or_insert_with(|| multi.add(create_spinner()))
    }

    fn finish_item(&mut self, item_id: &str, message: String) {
        if let Some(spinner) = self.items.remove(item_id) {
            spinner.finish_and_clear();
        }
        self.overall.inc(1);
        self.overall.println(message);
    }

    fn finish(&self) {
        for spinner in self.items.values() {
            spinner.finish_and_clear();
        }
        self.overall.finish_and_clear();
    }
}
