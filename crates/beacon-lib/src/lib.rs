pub mod config;
pub use config::{BeaconConfig, Config, ConfigArgs, GateConfig};

#[cfg(test)]
pub mod tests;

use rand::Rng;

pub mod beacon;
pub use beacon::{PreimageBeacon, Subscription, WitnessBeacon, WitnessStore};

pub mod gate;
pub use gate::{ForwardHandle, InterceptedForward, InterceptedPacket, InterceptionGate, Interceptor};

pub mod events;
pub use events::{HtlcEvent, HtlcEventPublisher};

pub mod store;
pub use store::Store;

mod errors;
pub use errors::{Error, Result};

pub mod tasks;

pub mod types;
use types::{Hash256, Preimage};

pub fn gen_rand_sha256_hash() -> Hash256 {
    let mut rng = rand::thread_rng();
    let mut result = [0u8; 32];
    rng.fill(&mut result[..]);
    result.into()
}

pub fn gen_rand_preimage() -> Preimage {
    gen_rand_sha256_hash().into()
}
