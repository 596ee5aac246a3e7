use thiserror::Error;

use crate::{
    beacon::{BeaconError, StoreError},
    gate::GateError,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Beacon error: {0}")]
    Beacon(#[from] BeaconError),
    #[error("Interception gate error: {0}")]
    Gate(#[from] GateError),
    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
