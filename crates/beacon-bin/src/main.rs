use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use preimage_beacon::types::{PaymentHash, Preimage};
use preimage_beacon::{Config, ConfigArgs, PreimageBeacon, Store};
use tracing::{info, info_span, Instrument};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(version, about = "Preimage beacon operator tool")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check that every stored preimage decodes and matches its payment hash
    Check,
    /// Print the preimage recorded for a payment hash
    Lookup { payment_hash: PaymentHash },
    /// Record a preimage, refusing one that conflicts with the store
    Add { preimage: Preimage },
    /// Open the store and serve the beacon until interrupted
    Run,
}

pub struct ExitMessage(String);

#[tokio::main]
pub async fn main() -> Result<(), ExitMessage> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .pretty()
        .try_init()
        .map_err(|err| ExitMessage(format!("failed to initialize logger: {}", err)))?;

    let cli = Cli::parse();
    let config = Config::load(cli.config).map_err(|err| ExitMessage(err.to_string()))?;
    let store_path = config.beacon.store_path();

    match cli.command {
        Command::Check => {
            if !store_path.exists() {
                return ExitMessage::err(format!("no store at {:?}", store_path));
            }
            Store::check_validate(&store_path).map_err(|err| {
                ExitMessage(format!("store {:?} is invalid:\n{}", store_path, err))
            })?;
            println!("store {:?} is valid", store_path);
        }
        Command::Lookup { payment_hash } => {
            let beacon = open_beacon(&store_path, &config)?;
            match beacon
                .lookup(&payment_hash)
                .map_err(|err| ExitMessage(err.to_string()))?
            {
                Some(preimage) => println!("{}", preimage),
                None => return ExitMessage::err(format!("no preimage for {}", payment_hash)),
            }
        }
        Command::Add { preimage } => {
            let beacon = open_beacon(&store_path, &config)?;
            beacon
                .publish(preimage)
                .map_err(|err| ExitMessage(err.to_string()))?;
            println!("{}", preimage.hash());
        }
        Command::Run => {
            let span = info_span!("beacon", base_dir = ?config.base_dir);
            let beacon = Arc::new(span.in_scope(|| open_beacon(&store_path, &config))?);
            async {
                beacon.spawn_pruner(Duration::from_secs(config.beacon.prune_interval_seconds));
                info!(store = ?store_path, "Preimage beacon started");

                signal_listener().await;
                beacon.stop().await;
            }
            .instrument(span)
            .await;
        }
    }
    Ok(())
}

fn open_beacon(store_path: &Path, config: &Config) -> Result<PreimageBeacon<Store>, ExitMessage> {
    let store = Store::new(store_path).map_err(|err| ExitMessage(err.to_string()))?;
    Ok(PreimageBeacon::new(store, &config.beacon))
}

impl Debug for ExitMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Exit because {}", self.0)
    }
}

impl ExitMessage {
    pub fn err(message: String) -> Result<(), ExitMessage> {
        Err(ExitMessage(message))
    }
}

#[cfg(target_family = "unix")]
async fn signal_listener() {
    use tokio::signal::unix::{signal, SignalKind};
    let (Ok(mut sigterm), Ok(mut sigint)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) else {
        tracing::error!("Failed to listen for shutdown signals");
        return;
    };

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        _ = sigint.recv() => info!("SIGINT received, shutting down"),
    };
}

#[cfg(not(target_family = "unix"))]
async fn signal_listener() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl-c received, shutting down"),
        Err(err) => tracing::error!("Failed to listen for Ctrl-c: {}", err),
    }
}
