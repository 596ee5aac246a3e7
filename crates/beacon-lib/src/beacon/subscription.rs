//! Pending subscriptions and the handle returned to each waiter.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError, Weak,
    },
};

use tokio::sync::oneshot;
use tracing::trace;

use crate::types::{ForwardContext, PaymentHash, SubscriptionKey, WitnessUpdate};

pub(crate) struct Registration {
    id: u64,
    context: ForwardContext,
    sender: oneshot::Sender<WitnessUpdate>,
}

impl Registration {
    /// Hand the update to the waiter. The waiter may already be gone.
    pub(crate) fn deliver(self, update: WitnessUpdate) -> bool {
        self.sender.send(update).is_ok()
    }
}

pub(crate) type Shard = HashMap<PaymentHash, Vec<Registration>>;

/// Pending registrations, sharded by payment hash.
pub(crate) struct Registry {
    shards: Box<[Mutex<Shard>]>,
    next_id: AtomicU64,
}

impl Registry {
    pub(crate) fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(Shard::new())).collect(),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn shard_index(&self, payment_hash: &PaymentHash) -> usize {
        let bytes = payment_hash.as_bytes();
        let prefix = u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]);
        (prefix % self.shards.len() as u64) as usize
    }

    pub(crate) fn lock_shard(&self, index: usize) -> MutexGuard<'_, Shard> {
        // A panic while holding a shard lock leaves the map itself consistent.
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(
        shard: &mut Shard,
        id: u64,
        key: &SubscriptionKey,
    ) -> oneshot::Receiver<WitnessUpdate> {
        let (sender, receiver) = oneshot::channel();
        shard
            .entry(key.payment_hash)
            .or_default()
            .push(Registration {
                id,
                context: key.context.clone(),
                sender,
            });
        receiver
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Remove a single registration. Returns false if it was already detached.
    pub(crate) fn remove(&self, payment_hash: &PaymentHash, id: u64) -> bool {
        let mut shard = self.lock_shard(self.shard_index(payment_hash));
        let Some(registrations) = shard.get_mut(payment_hash) else {
            return false;
        };
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        let removed = registrations.len() != before;
        if registrations.is_empty() {
            shard.remove(payment_hash);
        }
        removed
    }

    /// Drop every registration matching `predicate`, shard by shard.
    pub(crate) fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&Registration) -> bool,
    {
        let mut removed = 0;
        for index in 0..self.shards.len() {
            let mut shard = self.lock_shard(index);
            shard.retain(|_, registrations| {
                let before = registrations.len();
                registrations.retain(|r| !predicate(r));
                removed += before - registrations.len();
                !registrations.is_empty()
            });
        }
        removed
    }

    pub(crate) fn remove_channel(&self, short_channel_id: u64) -> usize {
        self.remove_where(|r| r.context.short_channel_id == short_channel_id)
    }

    /// Registrations whose handle was dropped without being cancelled.
    pub(crate) fn remove_abandoned(&self) -> usize {
        self.remove_where(|r| r.sender.is_closed())
    }

    pub(crate) fn clear(&self) -> usize {
        self.remove_where(|_| true)
    }

    pub(crate) fn len(&self) -> usize {
        (0..self.shards.len())
            .map(|index| self.lock_shard(index).values().map(Vec::len).sum::<usize>())
            .sum()
    }
}

/// A waiter's handle on a single preimage delivery.
///
/// At most one [`WitnessUpdate`] is ever delivered. Dropping the handle
/// cancels it.
#[derive(Debug)]
pub struct Subscription {
    key: SubscriptionKey,
    id: u64,
    updates: Option<oneshot::Receiver<WitnessUpdate>>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub(crate) fn pending(
        key: SubscriptionKey,
        id: u64,
        updates: oneshot::Receiver<WitnessUpdate>,
        registry: Weak<Registry>,
    ) -> Self {
        Self {
            key,
            id,
            updates: Some(updates),
            registry,
        }
    }

    /// A subscription whose preimage was already known when it was created.
    pub(crate) fn resolved(key: SubscriptionKey, update: WitnessUpdate) -> Self {
        let (sender, receiver) = oneshot::channel();
        // The receiver is alive, send cannot fail.
        let _ = sender.send(update);
        Self {
            key,
            id: 0,
            updates: Some(receiver),
            registry: Weak::new(),
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Whether the handle still waits on a beacon registration, as opposed
    /// to having been prefilled on creation or cancelled.
    pub fn is_registered(&self) -> bool {
        self.registry.strong_count() > 0
    }

    /// Wait for the preimage.
    ///
    /// Returns `None` if the subscription was cancelled before delivery, its
    /// channel was released, or the beacon stopped. Cancel safe.
    pub async fn recv(&mut self) -> Option<WitnessUpdate> {
        let updates = self.updates.as_mut()?;
        let update = updates.await.ok();
        self.updates = None;
        update
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<WitnessUpdate> {
        let updates = self.updates.as_mut()?;
        match updates.try_recv() {
            Ok(update) => {
                self.updates = None;
                Some(update)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.updates = None;
                None
            }
        }
    }

    /// Withdraw the registration.
    ///
    /// Returns true if the registration was removed before a publish picked
    /// it up. Once a publish has detached it the delivery wins: the update
    /// stays readable through [`Subscription::recv`]. Idempotent.
    pub fn cancel(&mut self) -> bool {
        let registry = std::mem::take(&mut self.registry);
        match registry.upgrade() {
            Some(registry) => {
                let removed = registry.remove(&self.key.payment_hash, self.id);
                trace!(
                    payment_hash = ?self.key.payment_hash,
                    id = self.id,
                    removed,
                    "Cancelled subscription"
                );
                removed
            }
            None => false,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
