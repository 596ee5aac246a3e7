use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tracing::{debug, error, info, info_span, trace};

use super::{
    subscription::{Registration, Registry},
    BeaconError, BeaconResult, Subscription, WitnessStore,
};
use crate::{
    config::BeaconConfig,
    events::{HtlcEvent, HtlcEventPublisher},
    tasks::TaskGroup,
    types::{PaymentHash, Preimage, SubscriptionKey, WitnessUpdate},
};

/// What links and the interception gate need from a preimage beacon.
pub trait WitnessBeacon: Send + Sync {
    /// Register interest in the preimage of `key.payment_hash`.
    ///
    /// If the preimage is already durable the returned subscription carries
    /// it immediately.
    fn subscribe_updates(&self, key: SubscriptionKey) -> BeaconResult<Subscription>;

    fn lookup_preimage(&self, payment_hash: &PaymentHash) -> BeaconResult<Option<Preimage>>;

    /// Durably record `preimages` and wake every waiter on their hashes.
    fn add_preimages(&self, preimages: &[Preimage]) -> BeaconResult<()>;
}

/// Central registry distributing discovered preimages to waiters.
pub struct PreimageBeacon<S> {
    store: S,
    registry: Arc<Registry>,
    publisher: HtlcEventPublisher,
    tasks: TaskGroup,
    stopped: AtomicBool,
}

impl<S> PreimageBeacon<S>
where
    S: WitnessStore + Send + Sync + 'static,
{
    pub fn new(store: S, config: &BeaconConfig) -> Self {
        Self::new_with_publisher(store, config, HtlcEventPublisher::default())
    }

    pub fn new_with_publisher(
        store: S,
        config: &BeaconConfig,
        publisher: HtlcEventPublisher,
    ) -> Self {
        Self {
            store,
            registry: Arc::new(Registry::new(config.registry_shards)),
            publisher,
            tasks: TaskGroup::new(),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn publisher(&self) -> &HtlcEventPublisher {
        &self.publisher
    }

    pub fn publish(&self, preimage: Preimage) -> BeaconResult<()> {
        self.add_preimages(&[preimage])
    }

    pub fn subscribe(&self, key: SubscriptionKey) -> BeaconResult<Subscription> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(BeaconError::Stopped);
        }
        let payment_hash = key.payment_hash;
        // Store lookup and registration share the shard lock `add_preimages`
        // holds across its store write.
        let mut shard = self.registry.lock_shard(self.registry.shard_index(&payment_hash));
        // `stop` sets the flag before clearing the shards.
        if self.stopped.load(Ordering::Acquire) {
            return Err(BeaconError::Stopped);
        }
        if let Some(preimage) = self.store.get_preimage(&payment_hash)? {
            drop(shard);
            trace!(payment_hash = ?payment_hash, "Subscription resolved on creation");
            return Ok(Subscription::resolved(key, WitnessUpdate::new(preimage)));
        }
        let id = self.registry.next_id();
        let updates = Registry::register(&mut shard, id, &key);
        drop(shard);
        trace!(
            payment_hash = ?payment_hash,
            short_channel_id = key.context.short_channel_id,
            htlc_index = key.context.htlc_index,
            id,
            "Registered subscription"
        );
        Ok(Subscription::pending(
            key,
            id,
            updates,
            Arc::downgrade(&self.registry),
        ))
    }

    pub fn lookup(&self, payment_hash: &PaymentHash) -> BeaconResult<Option<Preimage>> {
        Ok(self.store.get_preimage(payment_hash)?)
    }

    pub fn add_preimages(&self, preimages: &[Preimage]) -> BeaconResult<()> {
        let _span = info_span!("add_preimages", count = preimages.len()).entered();

        let by_hash: BTreeMap<PaymentHash, Preimage> =
            preimages.iter().map(|p| (p.hash(), *p)).collect();
        if by_hash.is_empty() {
            return Ok(());
        }

        // Shards are locked in ascending index order.
        let shard_indexes: BTreeSet<usize> = by_hash
            .keys()
            .map(|hash| self.registry.shard_index(hash))
            .collect();
        let mut shards: BTreeMap<usize, _> = shard_indexes
            .into_iter()
            .map(|index| (index, self.registry.lock_shard(index)))
            .collect();

        let mut new_preimages = Vec::with_capacity(by_hash.len());
        for (payment_hash, preimage) in by_hash.iter() {
            match self.store.get_preimage(payment_hash)? {
                Some(existing) if existing == *preimage => {
                    trace!(payment_hash = ?payment_hash, "Preimage already known");
                }
                Some(existing) => {
                    error!(
                        payment_hash = ?payment_hash,
                        "Stored preimage differs from the one being published, refusing to overwrite"
                    );
                    return Err(BeaconError::ConflictingPreimage {
                        payment_hash: *payment_hash,
                        existing,
                        attempted: *preimage,
                    });
                }
                None => new_preimages.push(*preimage),
            }
        }

        self.store.insert_preimages(&new_preimages)?;

        let mut deliveries: Vec<(Registration, WitnessUpdate)> = Vec::new();
        for (payment_hash, preimage) in by_hash.iter() {
            let index = self.registry.shard_index(payment_hash);
            if let Some(registrations) = shards.get_mut(&index).and_then(|s| s.remove(payment_hash))
            {
                let update = WitnessUpdate {
                    payment_hash: *payment_hash,
                    preimage: *preimage,
                };
                deliveries.extend(registrations.into_iter().map(|r| (r, update)));
            }
        }
        drop(shards);

        let waiters = deliveries.len();
        for (registration, update) in deliveries {
            if !registration.deliver(update) {
                trace!(payment_hash = ?update.payment_hash, "Subscriber went away before delivery");
            }
        }

        for preimage in new_preimages.iter() {
            self.publisher.publish(HtlcEvent::PreimageAdded {
                payment_hash: preimage.hash(),
            });
        }
        debug!(
            new = new_preimages.len(),
            waiters, "Published preimages to subscribers"
        );
        Ok(())
    }

    /// Drop all registrations belonging to a channel, e.g. on link teardown.
    pub fn release_channel(&self, short_channel_id: u64) -> usize {
        let released = self.registry.remove_channel(short_channel_id);
        if released > 0 {
            debug!(short_channel_id, released, "Released channel subscriptions");
        }
        released
    }

    /// Reclaim registrations whose handle no longer exists.
    pub fn prune_abandoned(&self) -> usize {
        let pruned = self.registry.remove_abandoned();
        if pruned > 0 {
            debug!(pruned, "Pruned abandoned subscriptions");
        }
        pruned
    }

    pub fn pending_subscriptions(&self) -> usize {
        self.registry.len()
    }

    /// Run [`PreimageBeacon::prune_abandoned`] every `interval` until stopped.
    /// A zero interval disables the pruner. Returns whether it was started.
    pub fn spawn_pruner(self: &Arc<Self>, interval: Duration) -> bool {
        if interval.is_zero() {
            debug!("Subscription pruner disabled");
            return false;
        }
        let beacon = Arc::downgrade(self);
        let token = self.tasks.token();
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(beacon) = beacon.upgrade() else { break };
                        beacon.prune_abandoned();
                    }
                }
            }
        });
        true
    }

    /// Drop every pending registration and wait for background tasks to finish.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let dropped = self.registry.clear();
        self.tasks.close().await;
        info!(dropped, "Preimage beacon stopped");
    }
}

impl<S> WitnessBeacon for PreimageBeacon<S>
where
    S: WitnessStore + Send + Sync + 'static,
{
    fn subscribe_updates(&self, key: SubscriptionKey) -> BeaconResult<Subscription> {
        self.subscribe(key)
    }

    fn lookup_preimage(&self, payment_hash: &PaymentHash) -> BeaconResult<Option<Preimage>> {
        self.lookup(payment_hash)
    }

    fn add_preimages(&self, preimages: &[Preimage]) -> BeaconResult<()> {
        PreimageBeacon::add_preimages(self, preimages)
    }
}
