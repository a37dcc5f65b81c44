use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::FmtSubscriber;

mod cli;
mod cluster;
mod config;
mod plugin;
mod transmitter;

use cli::{Cli, Commands};
use cluster::{inspect, LocalCluster};
use config::{generate_sample_config, ClusterConfig};
use orca_protocol::CertifiedPrepareOrCommit;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Run { config } => {
            run_cluster(config).await?;
        }
        Commands::Init {
            output,
            oracles,
            faulty,
            seed,
        } => {
            init_config(output, oracles, faulty, &seed)?;
        }
        Commands::Keygen => {
            generate_keypair();
        }
        Commands::Inspect { config } => {
            show_status(config)?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<ClusterConfig> {
    if !path.exists() {
        error!(
            "Configuration file not found: {:?}. Run 'orca init' to create one.",
            path
        );
        return Err(anyhow::anyhow!("Configuration file not found"));
    }
    info!("Loading configuration from {:?}", path);
    ClusterConfig::load(path)
}

/// Run a local cluster until Ctrl-C
async fn run_cluster(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let cluster = LocalCluster::new(config)?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupted, shutting down"),
            Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
        }
        shutdown.cancel();
    });

    cluster.run(cancel).await
}

/// Write a sample cluster configuration
fn init_config(output: PathBuf, oracles: usize, faulty: usize, seed: &str) -> Result<()> {
    let config = generate_sample_config(oracles, faulty, seed);
    config.shared_config()?;
    config.save(&output)?;

    println!("\nConfiguration file created: {}", output.display());
    println!("  Oracles:       {}", oracles);
    println!("  Faulty:        {}", faulty);
    println!("  Config digest: {}", config.config_digest);
    println!("\nTo start the cluster, run:");
    println!("  orca run --config {}", output.display());

    Ok(())
}

/// Generate a new keypair
fn generate_keypair() {
    let keypair = orca_core::KeyPair::generate();

    println!("Generated new keypair:");
    println!("  Public key:  {}", keypair.public.to_hex());
    println!("  Secret key:  {}", keypair.secret.to_hex());
    println!("\nWARNING: Keep your secret key safe! Do not share it with anyone.");
}

/// Print each oracle's persisted pacemaker state and certified round
fn show_status(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    for status in inspect(&config)? {
        let epoch = match status.state {
            Some(state) => format!(
                "epoch {} (wished {})",
                state.epoch, state.highest_sent_new_epoch_wish
            ),
            None => "no pacemaker state".to_string(),
        };
        let certified = match status.cert {
            Some(CertifiedPrepareOrCommit::Commit(cc)) => format!("committed seq {}", cc.seq_nr),
            Some(CertifiedPrepareOrCommit::Prepare(cp)) => format!(
                "prepared seq {} in epoch {}",
                cp.seq_nr, cp.prepare_epoch
            ),
            None => "nothing certified".to_string(),
        };
        println!("Oracle {}: {}, {}", status.id, epoch, certified);
    }
    Ok(())
}
