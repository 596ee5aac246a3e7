//! Publish-subscribe notifications for preimage and forward lifecycle events.

use std::sync::Arc;

use ractor::{port::OutputPortSubscriber, OutputPort};

use crate::{
    gate::ForwardState,
    types::{CircuitKey, PaymentHash},
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum HtlcEvent {
    /// A preimage became durable for the first time.
    PreimageAdded { payment_hash: PaymentHash },
    /// A forward entered the interception gate.
    ForwardIntercepted {
        circuit_key: CircuitKey,
        payment_hash: PaymentHash,
    },
    /// A held forward reached a terminal state.
    ForwardResolved {
        circuit_key: CircuitKey,
        payment_hash: PaymentHash,
        state: ForwardState,
    },
}

/// Fans [`HtlcEvent`]s out to subscribed actors.
#[derive(Default, Clone, Debug)]
pub struct HtlcEventPublisher(Arc<OutputPort<HtlcEvent>>);

impl HtlcEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn publish(&self, event: HtlcEvent) {
        self.0.send(event);
    }

    pub fn subscribe(&self, subscriber: OutputPortSubscriber<HtlcEvent>) {
        subscriber.subscribe_to_port(&self.0);
    }
}
