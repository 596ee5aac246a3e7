use thiserror::Error;

use super::StoreError;
use crate::types::{PaymentHash, Preimage};

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum BeaconError {
    #[error("Witness store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("Conflicting preimage for {payment_hash}: stored {existing}, attempted {attempted}")]
    ConflictingPreimage {
        payment_hash: PaymentHash,
        existing: Preimage,
        attempted: Preimage,
    },
    #[error("Preimage beacon is stopped")]
    Stopped,
}

pub type BeaconResult<T> = std::result::Result<T, BeaconError>;
