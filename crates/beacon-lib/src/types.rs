//! Primitive types shared by the beacon and the interception gate.

use bitcoin::hashes::{sha256::Hash as Sha256, Hash as _};
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as, IfIsHumanReadable};

// ============================================================
// Hash256
// ============================================================

/// A 256-bit value. Used as payment hash and as the raw bytes of a preimage.
#[serde_as]
#[derive(Copy, Clone, Serialize, Deserialize, Hash, Eq, PartialEq, Ord, PartialOrd, Default)]
pub struct Hash256(#[serde_as(as = "IfIsHumanReadable<Hex>")] [u8; 32]);

/// The public digest identifying an HTLC.
pub type PaymentHash = Hash256;

impl Hash256 {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl From<Hash256> for [u8; 32] {
    fn from(val: Hash256) -> Self {
        val.0
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Hash256 {
    type Error = anyhow::Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() != 32 {
            return Err(anyhow::anyhow!("Invalid hash length"));
        }
        let mut data = [0u8; 32];
        data.copy_from_slice(value);
        Ok(Hash256(data))
    }
}

impl ::core::fmt::LowerHex for Hash256 {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        if f.alternate() {
            write!(f, "0x")?;
        }
        write!(f, "{}", hex::encode(self.0))
    }
}

impl ::core::fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "Hash256({:#x})", self)
    }
}

impl ::core::fmt::Display for Hash256 {
    fn fmt(&self, f: &mut ::core::fmt::Formatter) -> ::core::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl std::str::FromStr for Hash256 {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim_start_matches("0x");
        let bytes = hex::decode(s)?;
        Hash256::try_from(bytes.as_slice())
    }
}

// ============================================================
// Preimage
// ============================================================

/// The secret whose SHA-256 digest is a payment hash.
#[derive(Copy, Clone, Serialize, Deserialize, Hash, Eq, PartialEq, Debug)]
pub struct Preimage(Hash256);

impl Preimage {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(Hash256(bytes))
    }

    /// The payment hash this preimage unlocks.
    pub fn hash(&self) -> PaymentHash {
        Sha256::hash(self.0.as_ref()).to_byte_array().into()
    }

    /// Whether this preimage unlocks `payment_hash`.
    pub fn matches(&self, payment_hash: &PaymentHash) -> bool {
        self.hash() == *payment_hash
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl From<[u8; 32]> for Preimage {
    fn from(value: [u8; 32]) -> Self {
        Self::new(value)
    }
}

impl From<Hash256> for Preimage {
    fn from(value: Hash256) -> Self {
        Self(value)
    }
}

impl From<Preimage> for Hash256 {
    fn from(value: Preimage) -> Self {
        value.0
    }
}

impl std::fmt::Display for Preimage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::str::FromStr for Preimage {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

// ============================================================
// Forwarding context
// ============================================================

/// Which in-flight HTLC a waiter cares about.
#[derive(Clone, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ForwardContext {
    pub short_channel_id: u64,
    pub htlc_index: u64,
    /// Opaque custom records carried by the onion.
    pub custom_records: Vec<u8>,
}

impl ForwardContext {
    pub fn new(short_channel_id: u64, htlc_index: u64, custom_records: Vec<u8>) -> Self {
        Self {
            short_channel_id,
            htlc_index,
            custom_records,
        }
    }
}

/// Key a waiter registers under. Several keys may share a payment hash.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub payment_hash: PaymentHash,
    pub context: ForwardContext,
}

impl SubscriptionKey {
    pub fn new(payment_hash: PaymentHash, context: ForwardContext) -> Self {
        Self {
            payment_hash,
            context,
        }
    }
}

/// Identifies an incoming HTLC: the channel it arrived on and its index there.
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct CircuitKey {
    pub short_channel_id: u64,
    pub htlc_index: u64,
}

impl CircuitKey {
    pub fn new(short_channel_id: u64, htlc_index: u64) -> Self {
        Self {
            short_channel_id,
            htlc_index,
        }
    }
}

impl std::fmt::Display for CircuitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.short_channel_id, self.htlc_index)
    }
}

/// Delivered to a subscriber once the preimage for its hash is known.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WitnessUpdate {
    pub payment_hash: PaymentHash,
    pub preimage: Preimage,
}

impl WitnessUpdate {
    pub fn new(preimage: Preimage) -> Self {
        Self {
            payment_hash: preimage.hash(),
            preimage,
        }
    }
}
