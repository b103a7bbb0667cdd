//! Command-line interface: argument types, handlers and output formatting.

pub mod commands;
pub mod output;
mod types;

use anyhow::Result;
use console::style;

use crate::domain::models::Config;

pub use commands::Workspace;
pub use types::{Cli, Commands, LockCommands, RetryCommands, StageCommands};

/// Run the parsed command against a loaded configuration.
pub async fn execute(cli: Cli, config: Config) -> Result<()> {
    let workspace = Workspace::new(&cli.project_dir, config);
    let json = cli.json;

    match cli.command {
        Commands::Run {
            strategy,
            max_concurrency,
            stop_on_first_failure,
        } => {
            let options = commands::run::RunOptions {
                strategy,
                max_concurrency,
                stop_on_first_failure,
            };
            commands::run::handle_run(workspace, options, json).await
        }
        Commands::Status => commands::status::handle_status(&workspace, json),
        Commands::Batches { mermaid } => commands::batches::handle_batches(&workspace, mermaid, json),
        Commands::Stage(StageCommands::Show) => commands::stage::handle_show(&workspace, json),
        Commands::Stage(StageCommands::ResumeFrom { stage }) => {
            commands::stage::handle_resume_from(&workspace, stage, json)
        }
        Commands::Retry(RetryCommands::Show) => commands::retry::handle_show(&workspace, json),
        Commands::Retry(RetryCommands::Reset { item_id, all }) => {
            commands::retry::handle_reset(&workspace, item_id, all, json)
        }
        Commands::Locks(LockCommands::Cleanup { older_than }) => {
            commands::locks::handle_cleanup(&workspace, older_than, json)
        }
    }
}

/// Print `err` with its cause chain and exit with status 1.
pub fn handle_error(err: &anyhow::Error, json: bool) -> ! {
    if json {
        let causes: Vec<String> = err.chain().skip(1).map(ToString::to_string).collect();
        let body = serde_json::json!({
            "error": err.to_string(),
            "causes": causes,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&body).unwrap_or_default()
        );
    } else {
        eprintln!("{} {err}", style("error:").red().bold());
        for cause in err.chain().skip(1) {
            eprintln!("  caused by: {cause}");
        }
    }
    std::process::exit(1)
}
