//! Cascade CLI entry point.

use clap::Parser;

use cascade::cli::{self, Cli};
use cascade::infrastructure::config::ConfigLoader;
use cascade::infrastructure::logging::{LogConfig, LoggerImpl};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json = cli.json;

    let config = match ConfigLoader::load_from_dir(&cli.project_dir) {
        Ok(config) => config,
        Err(err) => cli::handle_error(&err, json),
    };

    let _logger = match LoggerImpl::init(&LogConfig::from(&config.logging)) {
        Ok(logger) => logger,
        Err(err) => cli::handle_error(&err, json),
    };

    if let Err(err) = cli::execute(cli, config).await {
        cli::handle_error(&err, json);
    }
}
