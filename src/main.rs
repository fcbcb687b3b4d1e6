mod cli;
mod runner;

use clap::Parser;
use cli::{Cli, Commands};
use mediafetch::config::Config;
use mediafetch::observability;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    observability::init_tracing(config.debug_log);

    match cli.command {
        Commands::Run(args) => runner::run(&config, args).await?,
        Commands::Queue => runner::show_queue(&config)?,
        Commands::History => runner::show_history(&config)?,
        Commands::ClearHistory => runner::clear_history(&config)?,
        Commands::Config => println!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}
