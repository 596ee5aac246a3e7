use thiserror::Error;

use crate::types::{PaymentHash, Preimage};

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(String),
    #[error("Codec error: {0}")]
    Codec(String),
}

/// Durable mapping from payment hash to preimage.
pub trait WitnessStore {
    fn get_preimage(&self, payment_hash: &PaymentHash) -> Result<Option<Preimage>, StoreError>;
    /// Persist all preimages in one atomic write. Returns once the write is durable.
    fn insert_preimages(&self, preimages: &[Preimage]) -> Result<(), StoreError>;
}

impl<T: WitnessStore + ?Sized> WitnessStore for std::sync::Arc<T> {
    fn get_preimage(&self, payment_hash: &PaymentHash) -> Result<Option<Preimage>, StoreError> {
        (**self).get_preimage(payment_hash)
    }

    fn insert_preimages(&self, preimages: &[Preimage]) -> Result<(), StoreError> {
        (**self).insert_preimages(preimages)
    }
}
