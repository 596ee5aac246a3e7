mod native;
pub use native::{Batch, DbDirection, IteratorMode, Store};

use std::collections::HashSet;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info};

use super::schema::*;
use crate::beacon::{StoreError, WitnessStore};
use crate::types::{Hash256, PaymentHash, Preimage};

pub(crate) fn serialize_to_vec<T: ?Sized + Serialize>(
    value: &T,
    field_name: &str,
) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(value)
        .map_err(|e| StoreError::Codec(format!("serialization of {} failed: {}", field_name, e)))
}

pub(crate) fn deserialize_from<'a, T>(slice: &'a [u8], field_name: &str) -> Result<T, StoreError>
where
    T: serde::Deserialize<'a>,
{
    bincode::deserialize(slice)
        .map_err(|e| StoreError::Codec(format!("deserialization of {} failed: {}", field_name, e)))
}

pub enum KeyValue {
    Preimage(PaymentHash, Preimage),
}

pub trait StoreKeyValue {
    fn key(&self) -> Vec<u8>;
    fn value(&self) -> Result<Vec<u8>, StoreError>;
}

impl StoreKeyValue for KeyValue {
    fn key(&self) -> Vec<u8> {
        match self {
            KeyValue::Preimage(payment_hash, _) => {
                [&[PREIMAGE_PREFIX], payment_hash.as_ref()].concat()
            }
        }
    }

    fn value(&self) -> Result<Vec<u8>, StoreError> {
        match self {
            KeyValue::Preimage(_, preimage) => serialize_to_vec(preimage, "Preimage"),
        }
    }
}

impl Store {
    /// Scan every stored witness and check that it decodes and hashes to its key.
    pub fn check_validate<P: AsRef<Path>>(path: P) -> Result<(), String> {
        let db = Self::open_db(path.as_ref()).map_err(|e| e.to_string())?;
        let mut errors = HashSet::new();
        let mut count = 0usize;

        for (key, value) in db.prefix_iterator(&[PREIMAGE_PREFIX]) {
            count += 1;
            let payment_hash = match Hash256::try_from(&key[1..]) {
                Ok(hash) => hash,
                Err(e) => {
                    errors.insert(format!(
                        "Invalid PREIMAGE_PREFIX key {}: {}",
                        hex::encode(&key),
                        e
                    ));
                    continue;
                }
            };
            match deserialize_from::<Preimage>(&value, "Preimage") {
                Ok(preimage) if preimage.matches(&payment_hash) => {}
                Ok(_) => {
                    errors.insert(format!("Preimage does not hash to {}", payment_hash));
                }
                Err(e) => {
                    errors.insert(format!("Failed to deserialize PREIMAGE_PREFIX: {}", e));
                }
            }
        }

        if errors.is_empty() {
            info!(count, "All witnesses in the store are valid.");
            Ok(())
        } else {
            let errors: Vec<String> = errors.into_iter().collect();
            Err(errors.join("\n"))
        }
    }
}

impl WitnessStore for Store {
    fn get_preimage(&self, payment_hash: &PaymentHash) -> Result<Option<Preimage>, StoreError> {
        let key = [&[PREIMAGE_PREFIX], payment_hash.as_ref()].concat();
        self.get(key)?
            .map(|value| deserialize_from(value.as_ref(), "Preimage"))
            .transpose()
    }

    fn insert_preimages(&self, preimages: &[Preimage]) -> Result<(), StoreError> {
        if preimages.is_empty() {
            return Ok(());
        }
        let mut batch = self.batch();
        for preimage in preimages {
            batch.put_kv(KeyValue::Preimage(preimage.hash(), *preimage))?;
        }
        batch.commit()?;
        debug!(count = preimages.len(), "Persisted preimages");
        Ok(())
    }
}
