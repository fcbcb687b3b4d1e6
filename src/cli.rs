use clap::{Parser, Subcommand};
use mediafetch::transport::TransportKind;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "mediafetch")]
#[command(about = "Resilient media download client", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to $MEDIAFETCH_CONFIG or config/mediafetch.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Queue downloads and run until the queue drains
    Run(RunArgs),
    /// Print the persisted queue
    Queue,
    /// List completed downloads
    History,
    /// Delete all completed-download records
    ClearHistory,
    /// Print the effective configuration as TOML
    Config,
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Item to download; repeat for several. Without items the persisted queue is resumed.
    #[arg(long = "item")]
    pub items: Vec<String>,

    #[arg(long, default_value = "mp3")]
    pub format: String,

    #[arg(long, default_value = "best")]
    pub quality: String,

    /// Display title, defaults to the item id
    #[arg(long)]
    pub title: Option<String>,

    /// Force a transport for these jobs (event-stream or direct-stream)
    #[arg(long)]
    pub transport: Option<TransportKind>,
}
