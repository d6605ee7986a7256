//! Cadence: autonomous content scheduler
//!
//! Main binary with subcommands:
//! - `daemon`: Run the scheduler with dry-run collaborators
//! - `triggers`: Show when the daily windows fire next

use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cadence_scheduler::CivilClock;

mod config;
mod daemon;
mod dry_run;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Autonomous content scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl-C
    Daemon {
        /// Scheduler config (JSON). Missing file means defaults.
        #[arg(long, env = "CADENCE_CONFIG")]
        config: Option<PathBuf>,

        /// Schedules to seed the store with (JSON array)
        #[arg(long, env = "CADENCE_SCHEDULES")]
        schedules: Option<PathBuf>,

        /// Override the configured user
        #[arg(long, env = "CADENCE_USER_ID")]
        user_id: Option<String>,

        /// Status log interval in seconds
        #[arg(long, default_value = "300")]
        status_interval: u64,
    },

    /// Print the next content and analytics trigger times
    Triggers {
        /// Scheduler config (JSON). Missing file means defaults.
        #[arg(long, env = "CADENCE_CONFIG")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "cadence=info,cadence_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            config,
            schedules,
            user_id,
            status_interval,
        } => {
            daemon::run(daemon::DaemonConfig {
                config_path: config,
                schedules_path: schedules,
                user_id,
                status_interval,
            })
            .await
        }

        Commands::Triggers { config } => print_triggers(config),
    }
}

fn print_triggers(config_path: Option<PathBuf>) -> Result<()> {
    let config =
        config::load_config(config_path.as_deref(), None).map_err(|e| miette::miette!("{}", e))?;
    let clock = CivilClock::new(config.utc_offset_minutes).map_err(|e| miette::miette!("{}", e))?;
    let now = Utc::now();

    println!("now: {} (UTC {})", clock.local(now).format("%a %Y-%m-%d %H:%M %:z"), now);
    for (name, hour) in [
        ("content", config.content_hour),
        ("analytics", config.analytics_hour),
    ] {
        let at = clock
            .daily_trigger(now, hour, 0)
            .map_err(|e| miette::miette!("{}", e))?;
        println!(
            "{name}: {} (UTC {}), plus up to {} min jitter",
            clock.local(at).format("%a %Y-%m-%d %H:%M %:z"),
            at,
            config.trigger_jitter_minutes.saturating_sub(1)
        );
    }
    Ok(())
}
