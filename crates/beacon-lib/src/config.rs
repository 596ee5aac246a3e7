use std::{fs::File, io::BufReader, path::PathBuf};

use clap_serde_derive::{clap, ClapSerde};
use home::home_dir;
use serde::Deserialize;
use tracing::debug;

use crate::{Error, Result};

const DEFAULT_BASE_DIR_NAME: &str = ".preimage-beacon";
const DEFAULT_CONFIG_FILE_NAME: &str = "config.yml";
const DEFAULT_STORE_DIR_NAME: &str = "store";

/// Default number of registry shards.
pub const DEFAULT_REGISTRY_SHARDS: usize = 16;
/// Default interval between sweeps for abandoned subscriptions.
pub const DEFAULT_PRUNE_INTERVAL_SECONDS: u64 = 60;
/// Blocks before the incoming HTLC expiry at which a held forward is failed.
pub const DEFAULT_SAFETY_MARGIN_BLOCKS: u32 = 10;
/// Block interval used to turn remaining blocks into a wall-clock timeout.
/// Must stay below the real average block interval.
pub const DEFAULT_ASSUMED_BLOCK_INTERVAL_SECONDS: u64 = 60;
/// Upper bound on how long any forward is held.
pub const DEFAULT_MAX_HOLD_SECONDS: u64 = 60 * 60;

// Use prefix `beacon-`/`BEACON_`
#[derive(ClapSerde, Debug, Clone)]
pub struct BeaconConfig {
    /// beacon base directory
    #[arg(
        name = "BEACON_BASE_DIR",
        long = "beacon-base-dir",
        env,
        help = "base directory for the beacon [default: $BASE_DIR]"
    )]
    pub base_dir: Option<PathBuf>,

    #[default(DEFAULT_REGISTRY_SHARDS)]
    #[arg(
        name = "BEACON_REGISTRY_SHARDS",
        long = "beacon-registry-shards",
        env,
        help = format!("number of lock shards for pending subscriptions [default: {}]", DEFAULT_REGISTRY_SHARDS)
    )]
    pub registry_shards: usize,

    #[default(DEFAULT_PRUNE_INTERVAL_SECONDS)]
    #[arg(
        name = "BEACON_PRUNE_INTERVAL_SECONDS",
        long = "beacon-prune-interval-seconds",
        env,
        help = format!("interval in seconds between sweeps for abandoned subscriptions, 0 disables them [default: {}]", DEFAULT_PRUNE_INTERVAL_SECONDS)
    )]
    pub prune_interval_seconds: u64,
}

impl BeaconConfig {
    pub fn base_dir(&self) -> PathBuf {
        self.base_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn store_path(&self) -> PathBuf {
        self.base_dir().join(DEFAULT_STORE_DIR_NAME)
    }
}

// Use prefix `gate-`/`GATE_`
#[derive(ClapSerde, Debug, Clone)]
pub struct GateConfig {
    #[default(DEFAULT_SAFETY_MARGIN_BLOCKS)]
    #[arg(
        name = "GATE_SAFETY_MARGIN_BLOCKS",
        long = "gate-safety-margin-blocks",
        env,
        help = format!("fail a held forward this many blocks before its incoming expiry [default: {}]", DEFAULT_SAFETY_MARGIN_BLOCKS)
    )]
    pub safety_margin_blocks: u32,

    #[default(DEFAULT_ASSUMED_BLOCK_INTERVAL_SECONDS)]
    #[arg(
        name = "GATE_ASSUMED_BLOCK_INTERVAL_SECONDS",
        long = "gate-assumed-block-interval-seconds",
        env,
        help = format!("block interval used to estimate the hold deadline [default: {}]", DEFAULT_ASSUMED_BLOCK_INTERVAL_SECONDS)
    )]
    pub assumed_block_interval_seconds: u64,

    #[default(DEFAULT_MAX_HOLD_SECONDS)]
    #[arg(
        name = "GATE_MAX_HOLD_SECONDS",
        long = "gate-max-hold-seconds",
        env,
        help = format!("maximum time in seconds a forward is held [default: {}]", DEFAULT_MAX_HOLD_SECONDS)
    )]
    pub max_hold_seconds: u64,

    /// Hold forwards while no interceptor is registered instead of failing fast.
    #[default(false)]
    #[arg(
        name = "GATE_REQUIRE_INTERCEPTOR",
        long = "gate-require-interceptor",
        env,
        help = "hold forwards until an interceptor decides, even if none is registered [default: false]"
    )]
    pub require_interceptor: bool,
}

fn get_base_dir() -> Result<PathBuf> {
    let mut path = home_dir()
        .ok_or_else(|| Error::Config("cannot determine home directory".to_string()))?;
    path.push(DEFAULT_BASE_DIR_NAME);
    Ok(path)
}

/// Command line options shared by every tool that loads a [`Config`].
#[derive(clap::Args)]
pub struct ConfigArgs {
    // If the user has not set a config file but set `base_dir` we use
    // `config.yml` under the base dir.
    /// config file
    #[arg(short, long = "config", help = "config file [default: $BASE_DIR/config.yml]")]
    pub config_path: Option<PathBuf>,

    /// base directory
    #[arg(short = 'd', long = "dir", help = format!("base directory for all [default: ~/{}]", DEFAULT_BASE_DIR_NAME))]
    pub base_dir: Option<PathBuf>,

    #[command(flatten)]
    pub beacon: <BeaconConfig as ClapSerde>::Opt,

    #[command(flatten)]
    pub gate: <GateConfig as ClapSerde>::Opt,
}

#[derive(Deserialize)]
struct SerializedConfig {
    beacon: Option<<BeaconConfig as ClapSerde>::Opt>,
    gate: Option<<GateConfig as ClapSerde>::Opt>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub base_dir: PathBuf,
    pub beacon: BeaconConfig,
    pub gate: GateConfig,
}

impl Config {
    /// Merge command line options over the YAML config file, if one exists.
    pub fn load(mut args: ConfigArgs) -> Result<Self> {
        let base_dir = match args.base_dir.clone() {
            Some(dir) => dir,
            None => get_base_dir()?,
        };

        let config_file = args
            .config_path
            .clone()
            .unwrap_or_else(|| base_dir.join(DEFAULT_CONFIG_FILE_NAME));

        let config_from_file = match File::open(&config_file) {
            Ok(file) => Some(
                serde_yaml::from_reader::<_, SerializedConfig>(BufReader::new(file)).map_err(
                    |err| Error::Config(format!("invalid config file {:?}: {}", config_file, err)),
                )?,
            ),
            Err(err) => {
                debug!("No config file at {:?}: {}", config_file, err);
                None
            }
        };

        let (beacon, gate) = match config_from_file {
            Some(SerializedConfig { beacon, gate }) => (
                beacon.map(|c| BeaconConfig::from(c).merge(&mut args.beacon)),
                gate.map(|c| GateConfig::from(c).merge(&mut args.gate)),
            ),
            None => (None, None),
        };

        let mut beacon = beacon.unwrap_or_else(|| BeaconConfig::from(&mut args.beacon));
        if beacon.base_dir.is_none() {
            beacon.base_dir = Some(base_dir.clone());
        }

        Ok(Self {
            beacon,
            gate: gate.unwrap_or_else(|| GateConfig::from(&mut args.gate)),
            base_dir,
        })
    }
}
