mod error;
mod preimage_beacon;
mod store;
mod subscription;

pub use error::{BeaconError, BeaconResult};
pub use preimage_beacon::{PreimageBeacon, WitnessBeacon};
pub use store::{StoreError, WitnessStore};
pub use subscription::Subscription;
