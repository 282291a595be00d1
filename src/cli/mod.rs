pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the crawl worker pool
    Run {
        /// Number of parallel workers (overrides configuration)
        #[arg(short, long)]
        workers: Option<usize>,

        /// Configuration profile to use
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Enqueue a crawl task (development/testing)
    Enqueue {
        /// Product id the task observes
        #[arg(long)]
        product_id: i64,

        /// Product page URL
        #[arg(long)]
        url: String,

        /// Platform name (coupang, naver_shopping, smart_store, ...)
        #[arg(long)]
        platform: String,

        /// Task priority (normal or high)
        #[arg(long, default_value = "normal")]
        priority: String,

        /// Requesting user id
        #[arg(long, default_value_t = 0)]
        user_id: i64,
    },

    /// Show queue depths
    Stats,

    /// Clear queues (development/testing)
    Clear {
        /// Which queues to clear (tasks, results, dead_letter, all)
        #[arg(default_value = "tasks")]
        queue: String,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to manage
        #[arg(required = false)]
        profile: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run { workers, profile } => {
            commands::run(workers, profile).await
        },
        Commands::Enqueue { product_id, url, platform, priority, user_id } => {
            commands::enqueue(product_id, url, platform, priority, user_id).await
        },
        Commands::Stats => {
            commands::stats().await
        },
        Commands::Clear { queue } => {
            info!("Clearing queues: {}", queue);
            commands::clear(queue).await
        },
        Commands::Config { profile, list } => {
            if list {
                commands::list_profiles().await
            } else if let Some(profile_name) = profile {
                commands::manage_profile(profile_name).await
            } else {
                commands::show_config().await
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }
}
