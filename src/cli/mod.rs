pub mod commands;
pub mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use crate::crawler::task::TaskType;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to a file (the platform data directory when no path is given)
    #[arg(long, global = true, num_args = 0..=1)]
    pub log_file: Option<Option<PathBuf>>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tasks for one or more URLs and wait for them to finish
    Run {
        /// Target URLs
        #[arg(required = true)]
        urls: Vec<String>,

        /// Task type (visit, scrape, click, screenshot, custom, recorded_flow)
        #[arg(short = 't', long = "type", default_value = "visit")]
        task_type: TaskType,

        /// Task priority (higher runs first)
        #[arg(short, long, default_value_t = 5)]
        priority: i32,

        /// Configuration profile to use
        #[arg(long, default_value = "default")]
        profile: String,

        /// Number of concurrent workers
        #[arg(short, long)]
        workers: Option<usize>,

        /// Per-attempt timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Stream every event to stdout as JSON lines
        #[arg(long)]
        events: bool,
    },

    /// Run the tasks listed in a YAML file as one batch
    Batch {
        /// YAML file with a `tasks` list
        #[arg(required = true)]
        file: PathBuf,

        /// Configuration profile to use
        #[arg(long, default_value = "default")]
        profile: String,

        /// Stream every event to stdout as JSON lines
        #[arg(long)]
        events: bool,
    },

    /// Re-run tasks left queued by the last shutdown
    Resume {
        /// Configuration profile to use
        #[arg(long, default_value = "default")]
        profile: String,
    },

    /// Run every watchdog once and print the result
    Health {
        /// Configuration profile to use
        #[arg(long, default_value = "default")]
        profile: String,
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
        Commands::Run { urls, task_type, priority, profile, workers, timeout, events } => {
            info!("Running {} URLs with profile {}", urls.len(), profile);
            let options = commands::RunOptions { task_type, priority, workers, timeout, events };
            commands::run(urls, profile, options).await
        },
        Commands::Batch { file, profile, events } => {
            info!("Running batch file {}", file.display());
            commands::batch(file, profile, events).await
        },
        Commands::Resume { profile } => {
            info!("Resuming saved tasks with profile {}", profile);
            commands::resume(profile).await
        },
        Commands::Health { profile } => commands::health(profile).await,
        Commands::Config { profile, list } => {
            if list {
                info!("Listing all configuration profiles");
                commands::list_profiles()
            } else if let Some(profile_name) = profile {
                info!("Managing configuration profile: {}", profile_name);
                commands::manage_profile(profile_name)
            } else {
                info!("Showing current configuration");
                commands::show_config()
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

    #[test]
    fn test_run_parses_type_and_urls() {
        let cli = Cli::try_parse_from([
            "orchestrator",
            "run",
            "https://example.com/a",
            "https://example.com/b",
            "--type",
            "scrape",
            "--workers",
            "3",
        ])
        .unwrap();

        match cli.command {
            Commands::Run { urls, task_type, workers, .. } => {
                assert_eq!(urls.len(), 2);
                assert_eq!(task_type, TaskType::Scrape);
                assert_eq!(workers, Some(3));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_unknown_task_type_rejected() {
        assert!(Cli::try_parse_from(["orchestrator", "run", "https://example.com", "-t", "dance"]).is_err());
    }
}
