use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::Level;

/// Orca - Byzantine fault tolerant oracle reporting
#[derive(Parser)]
#[command(name = "orca")]
#[command(about = "Orca oracle cluster and utilities")]
#[command(version)]
pub struct Cli {
    /// Log level
    #[arg(long, global = true, default_value = "info")]
    pub log_level: Level,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a local cluster until interrupted
    Run {
        /// Path to cluster configuration file
        #[arg(short, long, default_value = "cluster.json")]
        config: PathBuf,
    },

    /// Write a sample cluster configuration
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "cluster.json")]
        output: PathBuf,

        /// Number of oracles
        #[arg(long, default_value_t = 4)]
        oracles: usize,

        /// Number of faulty oracles tolerated
        #[arg(long, default_value_t = 1)]
        faulty: usize,

        /// Seed the keys and config digest are derived from
        #[arg(long, default_value = "orca")]
        seed: String,
    },

    /// Generate a new keypair
    Keygen,

    /// Show each oracle's persisted state
    Inspect {
        /// Path to cluster configuration file
        #[arg(short, long, default_value = "cluster.json")]
        config: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_init() {
        let cli = Cli::parse_from(["orca", "init", "--oracles", "7", "--faulty", "2"]);
        match cli.command {
            Commands::Init {
                oracles, faulty, ..
            } => {
                assert_eq!(oracles, 7);
                assert_eq!(faulty, 2);
            }
            _ => panic!("expected init"),
        }
        assert_eq!(cli.log_level, Level::INFO);
    }

    #[test]
    fn test_parse_log_level() {
        let cli = Cli::parse_from(["orca", "run", "--log-level", "debug"]);
        assert_eq!(cli.log_level, Level::DEBUG);
        assert!(matches!(cli.command, Commands::Run { .. }));
    }
}
