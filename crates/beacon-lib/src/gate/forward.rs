use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use tokio::{sync::oneshot, task::AbortHandle};
use tracing::{debug, error, warn};

use super::{interception_gate::GateInner, GateError, GateResult};
use crate::{
    beacon::WitnessBeacon,
    tasks::TaskGroup,
    types::{CircuitKey, PaymentHash, Preimage},
};

/// The HTLC a channel link hands to the gate.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InterceptedPacket {
    pub incoming_circuit: CircuitKey,
    pub outgoing_short_channel_id: u64,
    pub payment_hash: PaymentHash,
    pub incoming_amount: u128,
    pub outgoing_amount: u128,
    pub incoming_expiry: u32,
    pub outgoing_expiry: u32,
    /// Onion packet for the next hop.
    pub onion_blob: Vec<u8>,
    pub custom_records: Vec<u8>,
    /// Height at which the gate gives up on the forward. Set on intercept.
    pub auto_fail_height: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Display, AsRefStr)]
pub enum ForwardState {
    Pending,
    Settled,
    Failed,
    Resumed,
    TimedOut,
}

impl ForwardState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ForwardState::Pending)
    }
}

/// Failure codes an interceptor may return upstream without building an onion itself.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Display, Serialize, Deserialize)]
pub enum FailureCode {
    TemporaryChannelFailure,
    TemporaryNodeFailure,
    IncorrectOrUnknownPaymentDetails,
    ExpiryTooSoon,
    InvalidOnionPayload,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FailureReason {
    Code(FailureCode),
    /// An already encrypted failure onion.
    Onion(Vec<u8>),
    InterceptionTimeout,
}

/// What the channel link does with a forward once it leaves the gate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ForwardResolution {
    Settle { preimage: Preimage },
    Fail(FailureReason),
    /// Forward the HTLC as if it had never been intercepted.
    Resume,
}

struct ForwardSlot {
    state: ForwardState,
    resolver: Option<oneshot::Sender<ForwardResolution>>,
    deadline: Option<AbortHandle>,
}

impl ForwardSlot {
    /// Move to `state` and hand back the link's resolver.
    fn finish(&mut self, state: ForwardState) -> Option<oneshot::Sender<ForwardResolution>> {
        self.state = state;
        if let Some(deadline) = self.deadline.take() {
            deadline.abort();
        }
        self.resolver.take()
    }
}

/// A forward held by the gate, waiting for exactly one of
/// [`settle`](Self::settle), [`fail`](Self::fail) or [`resume`](Self::resume).
///
/// Clones share the same state: whichever resolves first wins and every later
/// attempt fails with [`GateError::DoubleResolution`].
#[derive(Clone)]
pub struct InterceptedForward {
    packet: Arc<InterceptedPacket>,
    slot: Arc<Mutex<ForwardSlot>>,
    beacon: Arc<dyn WitnessBeacon>,
    gate: Weak<GateInner>,
}

impl std::fmt::Debug for InterceptedForward {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptedForward")
            .field("packet", &self.packet)
            .field("state", &self.state())
            .finish()
    }
}

impl InterceptedForward {
    pub(crate) fn new(
        packet: InterceptedPacket,
        beacon: Arc<dyn WitnessBeacon>,
        gate: Weak<GateInner>,
    ) -> (Self, oneshot::Receiver<ForwardResolution>) {
        let (resolver, resolution) = oneshot::channel();
        let forward = Self {
            packet: Arc::new(packet),
            slot: Arc::new(Mutex::new(ForwardSlot {
                state: ForwardState::Pending,
                resolver: Some(resolver),
                deadline: None,
            })),
            beacon,
            gate,
        };
        (forward, resolution)
    }

    pub fn packet(&self) -> &InterceptedPacket {
        &self.packet
    }

    pub fn circuit_key(&self) -> CircuitKey {
        self.packet.incoming_circuit
    }

    pub fn payment_hash(&self) -> PaymentHash {
        self.packet.payment_hash
    }

    pub fn state(&self) -> ForwardState {
        self.lock_slot().state
    }

    fn lock_slot(&self) -> MutexGuard<'_, ForwardSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_pending(&self, state: ForwardState) -> GateResult<()> {
        match state {
            ForwardState::Pending => Ok(()),
            ForwardState::TimedOut => Err(GateError::InterceptionTimeout(self.circuit_key())),
            state => {
                warn!(
                    circuit_key = %self.circuit_key(),
                    state = %state,
                    "Forward resolved more than once"
                );
                Err(GateError::DoubleResolution {
                    circuit_key: self.circuit_key(),
                    state,
                })
            }
        }
    }

    /// Settle with `preimage`, publishing it through the beacon first.
    ///
    /// A mismatched preimage or a beacon error leaves the forward pending.
    pub fn settle(&self, preimage: Preimage) -> GateResult<()> {
        let mut slot = self.lock_slot();
        self.check_pending(slot.state)?;

        let preimage_hash = preimage.hash();
        if preimage_hash != self.packet.payment_hash {
            error!(
                circuit_key = %self.circuit_key(),
                payment_hash = ?self.packet.payment_hash,
                preimage_hash = ?preimage_hash,
                "Interceptor settled forward with a preimage for another hash"
            );
            return Err(GateError::PreimageMismatch {
                payment_hash: self.packet.payment_hash,
                preimage_hash,
            });
        }

        self.beacon.add_preimages(&[preimage])?;
        let resolver = slot.finish(ForwardState::Settled);
        drop(slot);
        self.complete(
            resolver,
            ForwardState::Settled,
            ForwardResolution::Settle { preimage },
        );
        Ok(())
    }

    pub fn fail(&self, reason: FailureReason) -> GateResult<()> {
        self.resolve(ForwardState::Failed, ForwardResolution::Fail(reason))
    }

    pub fn fail_with_code(&self, code: FailureCode) -> GateResult<()> {
        self.fail(FailureReason::Code(code))
    }

    /// Let the link forward the HTLC as usual.
    pub fn resume(&self) -> GateResult<()> {
        self.resolve(ForwardState::Resumed, ForwardResolution::Resume)
    }

    fn resolve(&self, state: ForwardState, resolution: ForwardResolution) -> GateResult<()> {
        let mut slot = self.lock_slot();
        self.check_pending(slot.state)?;
        let resolver = slot.finish(state);
        drop(slot);
        self.complete(resolver, state, resolution);
        Ok(())
    }

    /// Resolve on the gate's behalf. Returns false if the forward was
    /// already resolved.
    fn force(&self, state: ForwardState, resolution: ForwardResolution) -> bool {
        let mut slot = self.lock_slot();
        if slot.state.is_terminal() {
            return false;
        }
        let resolver = slot.finish(state);
        drop(slot);
        self.complete(resolver, state, resolution);
        true
    }

    pub(crate) fn expire(&self) -> bool {
        let expired = self.force(
            ForwardState::TimedOut,
            ForwardResolution::Fail(FailureReason::InterceptionTimeout),
        );
        if expired {
            warn!(
                circuit_key = %self.circuit_key(),
                payment_hash = ?self.payment_hash(),
                auto_fail_height = self.packet.auto_fail_height,
                "Forward timed out waiting for a decision"
            );
        }
        expired
    }

    /// Hand the forward back to the link for local resolution.
    pub(crate) fn withdraw(&self) -> bool {
        self.force(ForwardState::Resumed, ForwardResolution::Resume)
    }

    pub(crate) fn abort(&self, code: FailureCode) -> bool {
        self.force(
            ForwardState::Failed,
            ForwardResolution::Fail(FailureReason::Code(code)),
        )
    }

    pub(crate) fn arm_deadline(&self, tasks: &TaskGroup, timeout: Duration) {
        let forward = self.clone();
        let timer = tasks.spawn(async move {
            tokio::time::sleep(timeout).await;
            forward.expire();
        });
        let mut slot = self.lock_slot();
        if slot.state.is_terminal() {
            timer.abort();
        } else {
            slot.deadline = Some(timer.abort_handle());
        }
    }

    fn complete(
        &self,
        resolver: Option<oneshot::Sender<ForwardResolution>>,
        state: ForwardState,
        resolution: ForwardResolution,
    ) {
        if let Some(resolver) = resolver {
            if resolver.send(resolution).is_err() {
                debug!(
                    circuit_key = %self.circuit_key(),
                    "Link stopped waiting for the forward resolution"
                );
            }
        }
        if let Some(gate) = self.gate.upgrade() {
            gate.forward_resolved(&self.packet, state);
        }
    }
}
