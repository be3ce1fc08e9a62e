use anyhow::Result;
use clap::{Parser, Subcommand};
use mpgreet_core::config::Config;
use mpgreet_core::core_greet::determine_flow_type;
use mpgreet_core::logging::{init_logging_with_config, LogConfig, LogLevel};
use mpgreet_core::metrics::init_metrics;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

mod simulation;

use simulation::Simulation;

#[derive(Parser, Debug)]
#[command(name = "mpgreet")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long)]
    json_logs: bool,

    /// TOML configuration file; MPGREET_* variables are used otherwise
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run start, include, exclude and refresh across in-process members
    Simulate {
        /// Number of participants
        #[arg(short, long, default_value_t = 4)]
        members: usize,

        /// Milliseconds per timer tick
        #[arg(long, default_value_t = 1)]
        tick_ms: u64,
    },
    /// Classify a membership change
    Classify {
        /// Member proposing the change
        #[arg(long)]
        owner: String,

        /// Current members, comma separated
        #[arg(long, value_delimiter = ',')]
        old: Vec<String>,

        /// Requested members, comma separated
        #[arg(long, value_delimiter = ',')]
        new: Vec<String>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    Ok(match path {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    })
}

async fn simulate(config: Config, members: usize, tick: Duration) -> Result<()> {
    if members < 3 {
        anyhow::bail!("a simulation needs at least 3 members, got {}", members);
    }
    let ids: Vec<String> = (1..=members).map(|i| i.to_string()).collect();
    let sim = Simulation::new(&ids, config, tick)?;

    let split = (members + 1) / 2;
    let initial: BTreeSet<String> = ids[..split].iter().cloned().collect();
    let everyone: BTreeSet<String> = ids.iter().cloned().collect();
    let mut remaining = everyone.clone();
    remaining.remove(&ids[members - 1]);

    let steps = [
        (&ids[0], &initial),
        (&ids[1], &everyone),
        (&ids[0], &remaining),
        (&ids[1], &remaining),
    ];
    for (proposer, target) in steps {
        let report = sim.run(proposer, target).await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;

    let mut log_config = LogConfig::from_section(&config.logging)?;
    if let Some(level) = &args.log_level {
        log_config.level = level.parse().unwrap_or_else(|e| {
            eprintln!("{}, using 'info'", e);
            LogLevel::Info
        });
    }
    if args.json_logs {
        log_config = log_config.json_format(true);
    }
    init_logging_with_config(log_config)?;
    init_metrics();

    info!("mpgreet CLI started");

    match args.command {
        Some(Command::Simulate { members, tick_ms }) => {
            simulate(config, members, Duration::from_millis(tick_ms.max(1))).await?;
        }
        Some(Command::Classify { owner, old, new }) => {
            let old: BTreeSet<String> = old.into_iter().collect();
            let new: BTreeSet<String> = new.into_iter().collect();
            match determine_flow_type(&owner, &old, &new) {
                Ok((flow, members)) => println!("{} {:?}", flow, members),
                Err(e) => {
                    warn!("Cannot classify change: {}", e);
                    println!("{}", e);
                }
            }
        }
        None => {
            info!("No command specified. Use --help for usage information.");
        }
    }

    Ok(())
}
