use thiserror::Error;

use super::ForwardState;
use crate::{
    beacon::BeaconError,
    types::{CircuitKey, PaymentHash},
};

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum GateError {
    #[error("Preimage hashes to {preimage_hash}, expected {payment_hash}")]
    PreimageMismatch {
        payment_hash: PaymentHash,
        preimage_hash: PaymentHash,
    },
    #[error("Forward {circuit_key} is already resolved as {state}")]
    DoubleResolution {
        circuit_key: CircuitKey,
        state: ForwardState,
    },
    #[error("Forward {0} timed out waiting for an interceptor decision")]
    InterceptionTimeout(CircuitKey),
    #[error("No interceptor registered")]
    NoInterceptor,
    #[error("An interceptor is already registered")]
    InterceptorAlreadyRegistered,
    #[error("Forward {0} is already held")]
    DuplicateForward(CircuitKey),
    #[error("Forward {circuit_key} expires too soon: auto-fail height {auto_fail_height}, current height {current_height}")]
    ExpiryTooSoon {
        circuit_key: CircuitKey,
        auto_fail_height: u32,
        current_height: u32,
    },
    #[error("Interceptor error: {0}")]
    Interceptor(String),
    #[error("Interception gate is stopped")]
    Stopped,
    #[error("Beacon error: {0}")]
    Beacon(#[from] BeaconError),
}

pub type GateResult<T> = std::result::Result<T, GateError>;
