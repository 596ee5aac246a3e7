use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
    },
    time::Duration,
};

use tokio::sync::oneshot;
use tracing::{debug, info, info_span, warn};

use super::{
    FailureCode, ForwardResolution, ForwardState, GateError, GateResult, InterceptedForward,
    InterceptedPacket,
};
use crate::{
    beacon::{Subscription, WitnessBeacon},
    config::GateConfig,
    events::{HtlcEvent, HtlcEventPublisher},
    tasks::TaskGroup,
    types::{CircuitKey, ForwardContext, PaymentHash, SubscriptionKey},
};

/// External decision maker for held forwards.
///
/// Called without any gate lock held. It should hand the forward off and
/// return quickly; the verdict comes later through the forward itself.
pub trait Interceptor: Send + Sync {
    fn intercept(&self, forward: InterceptedForward) -> anyhow::Result<()>;
}

impl<F> Interceptor for F
where
    F: Fn(InterceptedForward) -> anyhow::Result<()> + Send + Sync,
{
    fn intercept(&self, forward: InterceptedForward) -> anyhow::Result<()> {
        self(forward)
    }
}

// Lock order: `interceptor` before `held`. Neither is held while a forward
// resolves or while the interceptor runs.
pub(crate) struct GateInner {
    config: GateConfig,
    beacon: Arc<dyn WitnessBeacon>,
    interceptor: RwLock<Option<Arc<dyn Interceptor>>>,
    held: Mutex<HashMap<CircuitKey, InterceptedForward>>,
    best_height: AtomicU32,
    publisher: HtlcEventPublisher,
    tasks: TaskGroup,
    stopped: AtomicBool,
}

impl GateInner {
    fn read_interceptor(&self) -> RwLockReadGuard<'_, Option<Arc<dyn Interceptor>>> {
        self.interceptor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_interceptor(&self) -> RwLockWriteGuard<'_, Option<Arc<dyn Interceptor>>> {
        self.interceptor
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_held(&self) -> MutexGuard<'_, HashMap<CircuitKey, InterceptedForward>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn held_forwards(&self) -> Vec<InterceptedForward> {
        self.lock_held().values().cloned().collect()
    }

    fn hold_timeout(&self, blocks_remaining: u32) -> Duration {
        let estimate =
            u64::from(blocks_remaining).saturating_mul(self.config.assumed_block_interval_seconds);
        Duration::from_secs(estimate.min(self.config.max_hold_seconds))
    }

    /// Hand still-pending forwards to a newly installed interceptor.
    fn replay(&self, interceptor: &dyn Interceptor, forwards: Vec<InterceptedForward>) {
        for forward in forwards {
            if forward.state().is_terminal() {
                continue;
            }
            if let Err(err) = interceptor.intercept(forward.clone()) {
                warn!(
                    circuit_key = %forward.circuit_key(),
                    error = %err,
                    "Interceptor refused replayed forward, resuming it"
                );
                forward.withdraw();
            }
        }
    }

    pub(crate) fn forward_resolved(&self, packet: &InterceptedPacket, state: ForwardState) {
        self.lock_held().remove(&packet.incoming_circuit);
        self.publisher.publish(HtlcEvent::ForwardResolved {
            circuit_key: packet.incoming_circuit,
            payment_hash: packet.payment_hash,
            state,
        });
        debug!(
            circuit_key = %packet.incoming_circuit,
            payment_hash = ?packet.payment_hash,
            state = %state,
            "Forward left the gate"
        );
    }
}

/// Holds forwarded HTLCs while an external interceptor decides their fate.
#[derive(Clone)]
pub struct InterceptionGate {
    inner: Arc<GateInner>,
}

impl InterceptionGate {
    pub fn new(config: GateConfig, beacon: Arc<dyn WitnessBeacon>, current_height: u32) -> Self {
        Self::new_with_publisher(config, beacon, current_height, HtlcEventPublisher::default())
    }

    pub fn new_with_publisher(
        config: GateConfig,
        beacon: Arc<dyn WitnessBeacon>,
        current_height: u32,
        publisher: HtlcEventPublisher,
    ) -> Self {
        Self {
            inner: Arc::new(GateInner {
                config,
                beacon,
                interceptor: RwLock::new(None),
                held: Mutex::new(HashMap::new()),
                best_height: AtomicU32::new(current_height),
                publisher,
                tasks: TaskGroup::new(),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn publisher(&self) -> &HtlcEventPublisher {
        &self.inner.publisher
    }

    pub fn current_height(&self) -> u32 {
        self.inner.best_height.load(Ordering::Acquire)
    }

    pub fn has_interceptor(&self) -> bool {
        self.inner.read_interceptor().is_some()
    }

    /// Hold `packet` and hand it to the registered interceptor.
    ///
    /// Returns immediately; the link learns the outcome from the returned
    /// handle. Fails with [`GateError::NoInterceptor`] when nobody is
    /// registered and interception is optional, in which case the link
    /// resolves the HTLC itself. Must be called within a Tokio runtime.
    pub fn intercept(&self, mut packet: InterceptedPacket) -> GateResult<ForwardHandle> {
        let inner = &self.inner;
        let circuit_key = packet.incoming_circuit;
        let payment_hash = packet.payment_hash;
        let _span = info_span!("intercept", circuit_key = %circuit_key, payment_hash = ?payment_hash)
            .entered();

        if inner.stopped.load(Ordering::Acquire) {
            return Err(GateError::Stopped);
        }

        let current_height = self.current_height();
        packet.auto_fail_height = packet
            .incoming_expiry
            .saturating_sub(inner.config.safety_margin_blocks);
        if current_height >= packet.auto_fail_height {
            warn!(
                auto_fail_height = packet.auto_fail_height,
                current_height, "Refusing to hold a forward this close to expiry"
            );
            return Err(GateError::ExpiryTooSoon {
                circuit_key,
                auto_fail_height: packet.auto_fail_height,
                current_height,
            });
        }
        let timeout = inner.hold_timeout(packet.auto_fail_height - current_height);

        let (forward, resolution) =
            InterceptedForward::new(packet, Arc::clone(&inner.beacon), Arc::downgrade(inner));

        let interceptor = {
            let guard = inner.read_interceptor();
            if guard.is_none() && !inner.config.require_interceptor {
                debug!("No interceptor registered, leaving forward to the link");
                return Err(GateError::NoInterceptor);
            }
            let interceptor = (*guard).clone();
            let mut held = inner.lock_held();
            // `stop` flips the flag under this lock before draining `held`.
            if inner.stopped.load(Ordering::Acquire) {
                return Err(GateError::Stopped);
            }
            if held.contains_key(&circuit_key) {
                warn!("Forward is already held");
                return Err(GateError::DuplicateForward(circuit_key));
            }
            held.insert(circuit_key, forward.clone());
            interceptor
        };

        forward.arm_deadline(&inner.tasks, timeout);
        inner.publisher.publish(HtlcEvent::ForwardIntercepted {
            circuit_key,
            payment_hash,
        });
        debug!(timeout_secs = timeout.as_secs(), "Holding forward");

        if let Some(interceptor) = interceptor {
            if let Err(err) = interceptor.intercept(forward.clone()) {
                warn!(error = %err, "Interceptor refused forward, withdrawing it");
                forward.withdraw();
                return Err(GateError::Interceptor(err.to_string()));
            }
        }

        Ok(ForwardHandle {
            circuit_key,
            payment_hash,
            resolution,
        })
    }

    /// Subscribe to the preimage of an HTLC that is resolved on chain and
    /// offer the HTLC to the registered interceptor.
    ///
    /// The offered forward is not held by the gate: settling it publishes
    /// the preimage through the beacon, which delivers it to the returned
    /// subscription. Failing or resuming it leaves the subscription waiting.
    /// Nothing is offered when the preimage is already known or no
    /// interceptor is registered.
    pub fn subscribe_intercepted(&self, packet: InterceptedPacket) -> GateResult<Subscription> {
        let inner = &self.inner;
        let circuit_key = packet.incoming_circuit;
        let _span = info_span!(
            "subscribe_intercepted",
            circuit_key = %circuit_key,
            payment_hash = ?packet.payment_hash
        )
        .entered();

        if inner.stopped.load(Ordering::Acquire) {
            return Err(GateError::Stopped);
        }

        let key = SubscriptionKey::new(
            packet.payment_hash,
            ForwardContext::new(
                circuit_key.short_channel_id,
                circuit_key.htlc_index,
                packet.custom_records.clone(),
            ),
        );
        let subscription = inner.beacon.subscribe_updates(key)?;
        if !subscription.is_registered() {
            return Ok(subscription);
        }

        let interceptor = (*inner.read_interceptor()).clone();
        let Some(interceptor) = interceptor else {
            return Ok(subscription);
        };
        let (forward, _resolution) =
            InterceptedForward::new(packet, Arc::clone(&inner.beacon), Weak::new());
        if let Err(err) = interceptor.intercept(forward) {
            warn!(error = %err, "Interceptor refused on-chain HTLC");
            return Err(GateError::Interceptor(err.to_string()));
        }
        debug!("Offered on-chain HTLC to the interceptor");
        Ok(subscription)
    }

    /// Install the interceptor and replay every held forward to it.
    pub fn register_interceptor(&self, interceptor: Arc<dyn Interceptor>) -> GateResult<()> {
        let replay = {
            let mut slot = self.inner.write_interceptor();
            if slot.is_some() {
                return Err(GateError::InterceptorAlreadyRegistered);
            }
            *slot = Some(Arc::clone(&interceptor));
            self.inner.held_forwards()
        };
        info!(held = replay.len(), "Interceptor registered");
        self.inner.replay(interceptor.as_ref(), replay);
        Ok(())
    }

    /// Remove the interceptor. Unless interception is required, every held
    /// forward is resumed. Returns whether an interceptor was registered.
    pub fn clear_interceptor(&self) -> bool {
        let (cleared, resumed) = {
            let mut slot = self.inner.write_interceptor();
            let cleared = slot.take().is_some();
            let resumed = if cleared && !self.inner.config.require_interceptor {
                self.inner.held_forwards()
            } else {
                Vec::new()
            };
            (cleared, resumed)
        };
        let resumed = resumed.iter().filter(|forward| forward.withdraw()).count();
        if cleared {
            info!(resumed, "Interceptor cleared");
        }
        cleared
    }

    /// Replace the interceptor, or clear it with `None`.
    pub fn set_interceptor(&self, interceptor: Option<Arc<dyn Interceptor>>) {
        let Some(interceptor) = interceptor else {
            self.clear_interceptor();
            return;
        };
        let replay = {
            let mut slot = self.inner.write_interceptor();
            *slot = Some(Arc::clone(&interceptor));
            self.inner.held_forwards()
        };
        info!(held = replay.len(), "Interceptor replaced");
        self.inner.replay(interceptor.as_ref(), replay);
    }

    /// Record a new best height and time out forwards that reached their
    /// auto-fail height. Returns how many were timed out.
    pub fn notify_block_height(&self, height: u32) -> usize {
        self.inner.best_height.store(height, Ordering::Release);
        let expired = self
            .inner
            .held_forwards()
            .into_iter()
            .filter(|forward| forward.packet().auto_fail_height <= height)
            .filter(|forward| forward.expire())
            .count();
        if expired > 0 {
            debug!(height, expired, "Timed out forwards on new block");
        }
        expired
    }

    /// Look up a held forward, e.g. to resolve it from an RPC.
    pub fn forward(&self, circuit_key: &CircuitKey) -> Option<InterceptedForward> {
        self.inner.lock_held().get(circuit_key).cloned()
    }

    pub fn pending_forwards(&self) -> Vec<InterceptedPacket> {
        let mut packets: Vec<InterceptedPacket> = self
            .inner
            .held_forwards()
            .into_iter()
            .filter(|forward| !forward.state().is_terminal())
            .map(|forward| forward.packet().clone())
            .collect();
        packets.sort_by_key(|packet| packet.incoming_circuit);
        packets
    }

    /// Fail every held forward and stop the deadline timers.
    pub async fn stop(&self) {
        self.inner.write_interceptor().take();
        let held = {
            let held = self.inner.lock_held();
            if self.inner.stopped.swap(true, Ordering::AcqRel) {
                return;
            }
            held.values().cloned().collect::<Vec<_>>()
        };
        let failed = held
            .iter()
            .filter(|forward| forward.abort(FailureCode::TemporaryNodeFailure))
            .count();
        self.inner.tasks.close().await;
        info!(failed, "Interception gate stopped");
    }
}

/// The link's side of a held forward.
#[derive(Debug)]
pub struct ForwardHandle {
    circuit_key: CircuitKey,
    payment_hash: PaymentHash,
    resolution: oneshot::Receiver<ForwardResolution>,
}

impl ForwardHandle {
    pub fn circuit_key(&self) -> CircuitKey {
        self.circuit_key
    }

    pub fn payment_hash(&self) -> PaymentHash {
        self.payment_hash
    }

    /// Wait for the forward to leave the gate. Returns `None` only if the
    /// forward was dropped unresolved.
    pub async fn resolution(self) -> Option<ForwardResolution> {
        self.resolution.await.ok()
    }

    pub fn try_resolution(&mut self) -> Option<ForwardResolution> {
        self.resolution.try_recv().ok()
    }
}
