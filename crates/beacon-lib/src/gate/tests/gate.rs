use std::{sync::Arc, time::Duration};

use ractor::Actor;

use crate::{
    beacon::{BeaconError, PreimageBeacon, WitnessBeacon},
    config::{BeaconConfig, GateConfig},
    events::HtlcEvent,
    gate::{
        FailureCode, FailureReason, ForwardResolution, ForwardState, GateError, InterceptedForward,
        InterceptionGate, Interceptor,
    },
    gen_rand_preimage,
    tests::{
        channel_interceptor, gate_config, generate_beacon, mock_packet, HtlcEventTestSubscriber,
        MockWitnessStore, TempDir,
    },
    types::{CircuitKey, ForwardContext, SubscriptionKey, WitnessUpdate},
    Store,
};

const HEIGHT: u32 = 100;
const EXPIRY: u32 = 200;

fn setup(config: GateConfig) -> (InterceptionGate, Arc<PreimageBeacon<Store>>, TempDir) {
    let (beacon, dir) = generate_beacon();
    let gate = InterceptionGate::new(config, Arc::clone(&beacon) as Arc<dyn WitnessBeacon>, HEIGHT);
    (gate, beacon, dir)
}

async fn next_forward(
    receiver: &mut tokio::sync::mpsc::UnboundedReceiver<InterceptedForward>,
) -> InterceptedForward {
    tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("forward handed to interceptor")
        .expect("interceptor channel open")
}

#[tokio::test]
async fn test_settle_publishes_preimage_to_independent_subscribers() {
    let (gate, beacon, _dir) = setup(gate_config(false));
    let (interceptor, mut forwards) = channel_interceptor();
    gate.register_interceptor(interceptor).unwrap();

    let preimage = gen_rand_preimage();
    let payment_hash = preimage.hash();
    // Another outgoing HTLC of the same multi-path payment.
    let mut sibling = beacon
        .subscribe(SubscriptionKey::new(
            payment_hash,
            ForwardContext::new(77, 3, vec![]),
        ))
        .unwrap();

    let circuit_key = CircuitKey::new(1, 0);
    let handle = gate
        .intercept(mock_packet(circuit_key, payment_hash, EXPIRY))
        .unwrap();
    assert_eq!(handle.circuit_key(), circuit_key);
    assert_eq!(gate.pending_forwards().len(), 1);

    let forward = next_forward(&mut forwards).await;
    assert_eq!(forward.packet().auto_fail_height, EXPIRY - 10);
    forward.settle(preimage).unwrap();

    assert_eq!(forward.state(), ForwardState::Settled);
    assert_eq!(
        handle.resolution().await,
        Some(ForwardResolution::Settle { preimage })
    );
    assert_eq!(sibling.recv().await, Some(WitnessUpdate::new(preimage)));
    assert_eq!(beacon.lookup(&payment_hash).unwrap(), Some(preimage));
    assert!(gate.pending_forwards().is_empty());
    assert!(gate.forward(&circuit_key).is_none());
}

#[tokio::test]
async fn test_on_chain_subscription_is_offered_to_interceptor() {
    let (gate, beacon, _dir) = setup(gate_config(false));
    let (interceptor, mut forwards) = channel_interceptor();
    gate.register_interceptor(interceptor).unwrap();

    let preimage = gen_rand_preimage();
    let circuit_key = CircuitKey::new(1, 5);
    let mut packet = mock_packet(circuit_key, preimage.hash(), EXPIRY);
    packet.custom_records = vec![2];
    let mut subscription = gate.subscribe_intercepted(packet).unwrap();
    assert_eq!(subscription.key().context, ForwardContext::new(1, 5, vec![2]));
    assert_eq!(subscription.try_recv(), None);

    let forward = next_forward(&mut forwards).await;
    assert_eq!(forward.circuit_key(), circuit_key);
    forward.settle(preimage).unwrap();

    assert_eq!(
        subscription.recv().await,
        Some(WitnessUpdate::new(preimage))
    );
    assert_eq!(beacon.lookup(&preimage.hash()).unwrap(), Some(preimage));
    assert!(gate.pending_forwards().is_empty());
}

#[tokio::test]
async fn test_on_chain_subscription_skips_interceptor_when_not_needed() {
    let (gate, beacon, _dir) = setup(gate_config(false));

    // Nobody to offer it to.
    let pending = gen_rand_preimage();
    let mut waiting = gate
        .subscribe_intercepted(mock_packet(CircuitKey::new(2, 0), pending.hash(), EXPIRY))
        .unwrap();
    assert_eq!(waiting.try_recv(), None);

    let (interceptor, mut forwards) = channel_interceptor();
    gate.register_interceptor(interceptor).unwrap();

    // Already known preimages resolve the subscription right away.
    let known = gen_rand_preimage();
    beacon.publish(known).unwrap();
    let mut resolved = gate
        .subscribe_intercepted(mock_packet(CircuitKey::new(2, 1), known.hash(), EXPIRY))
        .unwrap();
    assert_eq!(resolved.try_recv(), Some(WitnessUpdate::new(known)));
    assert!(forwards.try_recv().is_err());

    beacon.publish(pending).unwrap();
    assert_eq!(waiting.recv().await, Some(WitnessUpdate::new(pending)));
}

#[tokio::test]
async fn test_on_chain_subscription_refused_by_interceptor() {
    let (gate, beacon, _dir) = setup(gate_config(false));
    let refusing = |_forward: InterceptedForward| -> anyhow::Result<()> {
        Err(anyhow::anyhow!("not accepting"))
    };
    gate.register_interceptor(Arc::new(refusing)).unwrap();

    let preimage = gen_rand_preimage();
    assert!(matches!(
        gate.subscribe_intercepted(mock_packet(CircuitKey::new(3, 0), preimage.hash(), EXPIRY)),
        Err(GateError::Interceptor(_))
    ));
    assert_eq!(beacon.pending_subscriptions(), 0);
}

#[tokio::test]
async fn test_second_resolution_is_rejected() {
    let (gate, beacon, _dir) = setup(gate_config(false));
    let (interceptor, mut forwards) = channel_interceptor();
    gate.register_interceptor(interceptor).unwrap();

    let preimage = gen_rand_preimage();
    let circuit_key = CircuitKey::new(1, 1);
    let handle = gate
        .intercept(mock_packet(circuit_key, preimage.hash(), EXPIRY))
        .unwrap();
    let forward = next_forward(&mut forwards).await;

    forward
        .fail_with_code(FailureCode::TemporaryChannelFailure)
        .unwrap();
    assert_eq!(
        forward.settle(preimage),
        Err(GateError::DoubleResolution {
            circuit_key,
            state: ForwardState::Failed,
        })
    );
    assert_eq!(
        forward.clone().resume(),
        Err(GateError::DoubleResolution {
            circuit_key,
            state: ForwardState::Failed,
        })
    );

    assert_eq!(
        handle.resolution().await,
        Some(ForwardResolution::Fail(FailureReason::Code(
            FailureCode::TemporaryChannelFailure
        )))
    );
    // The rejected settle never reached the beacon.
    assert_eq!(beacon.lookup(&preimage.hash()).unwrap(), None);
}

#[tokio::test]
async fn test_settle_then_fail_keeps_settlement() {
    let (gate, _beacon, _dir) = setup(gate_config(false));
    let (interceptor, mut forwards) = channel_interceptor();
    gate.register_interceptor(interceptor).unwrap();

    let preimage = gen_rand_preimage();
    let circuit_key = CircuitKey::new(1, 2);
    let mut handle = gate
        .intercept(mock_packet(circuit_key, preimage.hash(), EXPIRY))
        .unwrap();
    let forward = next_forward(&mut forwards).await;

    forward.settle(preimage).unwrap();
    assert!(matches!(
        forward.fail(FailureReason::Onion(vec![1, 2, 3])),
        Err(GateError::DoubleResolution {
            state: ForwardState::Settled,
            ..
        })
    ));
    assert_eq!(
        handle.try_resolution(),
        Some(ForwardResolution::Settle { preimage })
    );
}

#[tokio::test]
async fn test_mismatched_preimage_keeps_forward_pending() {
    let (gate, beacon, _dir) = setup(gate_config(false));
    let (interceptor, mut forwards) = channel_interceptor();
    gate.register_interceptor(interceptor).unwrap();

    let preimage = gen_rand_preimage();
    let wrong = gen_rand_preimage();
    let mut handle = gate
        .intercept(mock_packet(CircuitKey::new(1, 3), preimage.hash(), EXPIRY))
        .unwrap();
    let forward = next_forward(&mut forwards).await;

    assert_eq!(
        forward.settle(wrong),
        Err(GateError::PreimageMismatch {
            payment_hash: preimage.hash(),
            preimage_hash: wrong.hash(),
        })
    );
    assert_eq!(forward.state(), ForwardState::Pending);
    assert_eq!(handle.try_resolution(), None);
    assert_eq!(beacon.lookup(&wrong.hash()).unwrap(), None);

    forward.settle(preimage).unwrap();
    assert_eq!(
        handle.resolution().await,
        Some(ForwardResolution::Settle { preimage })
    );
}

#[tokio::test]
async fn test_beacon_failure_keeps_forward_pending() {
    let store = Arc::new(MockWitnessStore::default());
    let beacon: Arc<dyn WitnessBeacon> = Arc::new(PreimageBeacon::new(
        Arc::clone(&store),
        &BeaconConfig::default(),
    ));
    let gate = InterceptionGate::new(gate_config(false), beacon, HEIGHT);
    let (interceptor, mut forwards) = channel_interceptor();
    gate.register_interceptor(interceptor).unwrap();

    let preimage = gen_rand_preimage();
    let handle = gate
        .intercept(mock_packet(CircuitKey::new(2, 0), preimage.hash(), EXPIRY))
        .unwrap();
    let forward = next_forward(&mut forwards).await;

    store.set_fail_writes(true);
    assert!(matches!(
        forward.settle(preimage),
        Err(GateError::Beacon(BeaconError::StoreUnavailable(_)))
    ));
    assert_eq!(forward.state(), ForwardState::Pending);

    store.set_fail_writes(false);
    forward.settle(preimage).unwrap();
    assert_eq!(
        handle.resolution().await,
        Some(ForwardResolution::Settle { preimage })
    );
}

#[tokio::test]
async fn test_no_interceptor_fails_fast() {
    let (gate, _beacon, _dir) = setup(gate_config(false));
    let payment_hash = gen_rand_preimage().hash();

    assert!(matches!(
        gate.intercept(mock_packet(CircuitKey::new(3, 0), payment_hash, EXPIRY)),
        Err(GateError::NoInterceptor)
    ));
    assert!(gate.pending_forwards().is_empty());
}

#[tokio::test]
async fn test_required_interceptor_holds_and_replays() {
    let (gate, _beacon, _dir) = setup(gate_config(true));
    let payment_hash = gen_rand_preimage().hash();

    let circuit_key = CircuitKey::new(3, 1);
    let handle = gate
        .intercept(mock_packet(circuit_key, payment_hash, EXPIRY))
        .unwrap();
    let pending = gate.pending_forwards();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].incoming_circuit, circuit_key);

    let (interceptor, mut forwards) = channel_interceptor();
    gate.register_interceptor(interceptor).unwrap();
    let forward = next_forward(&mut forwards).await;
    assert_eq!(forward.circuit_key(), circuit_key);

    forward.resume().unwrap();
    assert_eq!(handle.resolution().await, Some(ForwardResolution::Resume));
}

#[tokio::test]
async fn test_clearing_interceptor_resumes_held_forwards() {
    let (gate, _beacon, _dir) = setup(gate_config(false));
    let (interceptor, mut forwards) = channel_interceptor();
    gate.register_interceptor(interceptor).unwrap();

    let preimage = gen_rand_preimage();
    let handle = gate
        .intercept(mock_packet(CircuitKey::new(4, 0), preimage.hash(), EXPIRY))
        .unwrap();
    let forward = next_forward(&mut forwards).await;

    assert!(gate.clear_interceptor());
    assert!(!gate.clear_interceptor());
    assert!(!gate.has_interceptor());

    assert_eq!(handle.resolution().await, Some(ForwardResolution::Resume));
    assert_eq!(forward.state(), ForwardState::Resumed);
    assert!(matches!(
        forward.settle(preimage),
        Err(GateError::DoubleResolution {
            state: ForwardState::Resumed,
            ..
        })
    ));
}

#[tokio::test]
async fn test_single_interceptor_slot() {
    let (gate, _beacon, _dir) = setup(gate_config(true));
    let (first, mut first_forwards) = channel_interceptor();
    let (second, mut second_forwards) = channel_interceptor();

    gate.register_interceptor(Arc::clone(&first)).unwrap();
    assert!(matches!(
        gate.register_interceptor(Arc::clone(&second)),
        Err(GateError::InterceptorAlreadyRegistered)
    ));

    let payment_hash = gen_rand_preimage().hash();
    let handle = gate
        .intercept(mock_packet(CircuitKey::new(5, 0), payment_hash, EXPIRY))
        .unwrap();
    next_forward(&mut first_forwards).await;

    // Swapping hands the still-held forward to the new interceptor.
    gate.set_interceptor(Some(second));
    let forward = next_forward(&mut second_forwards).await;
    forward
        .fail_with_code(FailureCode::IncorrectOrUnknownPaymentDetails)
        .unwrap();
    assert_eq!(
        handle.resolution().await,
        Some(ForwardResolution::Fail(FailureReason::Code(
            FailureCode::IncorrectOrUnknownPaymentDetails
        )))
    );

    gate.set_interceptor(None);
    assert!(!gate.has_interceptor());
}

#[tokio::test]
async fn test_interceptor_error_withdraws_forward() {
    let (gate, _beacon, _dir) = setup(gate_config(false));
    let interceptor: Arc<dyn Interceptor> =
        Arc::new(|_forward: InterceptedForward| -> anyhow::Result<()> {
            Err(anyhow::anyhow!("interceptor busy"))
        });
    gate.register_interceptor(interceptor).unwrap();

    let result = gate.intercept(mock_packet(
        CircuitKey::new(6, 0),
        gen_rand_preimage().hash(),
        EXPIRY,
    ));

    assert_eq!(
        result.err(),
        Some(GateError::Interceptor("interceptor busy".to_string()))
    );
    assert!(gate.pending_forwards().is_empty());
}

#[tokio::test]
async fn test_duplicate_forward_is_rejected() {
    let (gate, _beacon, _dir) = setup(gate_config(false));
    let (interceptor, mut forwards) = channel_interceptor();
    gate.register_interceptor(interceptor).unwrap();

    let circuit_key = CircuitKey::new(7, 0);
    let payment_hash = gen_rand_preimage().hash();
    let _handle = gate
        .intercept(mock_packet(circuit_key, payment_hash, EXPIRY))
        .unwrap();
    assert!(matches!(
        gate.intercept(mock_packet(circuit_key, payment_hash, EXPIRY)),
        Err(GateError::DuplicateForward(key)) if key == circuit_key
    ));

    next_forward(&mut forwards).await.resume().unwrap();
    // Once resolved the circuit may be intercepted again.
    assert!(gate
        .intercept(mock_packet(circuit_key, payment_hash, EXPIRY))
        .is_ok());
}

#[tokio::test]
async fn test_forward_too_close_to_expiry_is_refused() {
    let (gate, _beacon, _dir) = setup(gate_config(false));
    let (interceptor, _forwards) = channel_interceptor();
    gate.register_interceptor(interceptor).unwrap();

    let circuit_key = CircuitKey::new(8, 0);
    assert_eq!(
        gate.intercept(mock_packet(circuit_key, gen_rand_preimage().hash(), HEIGHT + 10))
            .err(),
        Some(GateError::ExpiryTooSoon {
            circuit_key,
            auto_fail_height: HEIGHT,
            current_height: HEIGHT,
        })
    );
    assert!(gate.pending_forwards().is_empty());
}

#[tokio::test]
async fn test_block_height_times_out_forward() {
    let (gate, _beacon, _dir) = setup(gate_config(false));
    let (interceptor, mut forwards) = channel_interceptor();
    gate.register_interceptor(interceptor).unwrap();

    let preimage = gen_rand_preimage();
    let circuit_key = CircuitKey::new(9, 0);
    let handle = gate
        .intercept(mock_packet(circuit_key, preimage.hash(), EXPIRY))
        .unwrap();
    let forward = next_forward(&mut forwards).await;

    assert_eq!(gate.notify_block_height(EXPIRY - 11), 0);
    assert_eq!(forward.state(), ForwardState::Pending);
    assert_eq!(gate.notify_block_height(EXPIRY - 10), 1);
    assert_eq!(gate.current_height(), EXPIRY - 10);

    assert_eq!(forward.state(), ForwardState::TimedOut);
    assert_eq!(
        handle.resolution().await,
        Some(ForwardResolution::Fail(FailureReason::InterceptionTimeout))
    );
    assert_eq!(
        forward.settle(preimage),
        Err(GateError::InterceptionTimeout(circuit_key))
    );
    assert!(gate.pending_forwards().is_empty());
}

#[tokio::test]
async fn test_wall_clock_deadline_times_out_forward() {
    let config = GateConfig {
        max_hold_seconds: 1,
        ..gate_config(false)
    };
    let (gate, _beacon, _dir) = setup(config);
    let (interceptor, mut forwards) = channel_interceptor();
    gate.register_interceptor(interceptor).unwrap();

    let handle = gate
        .intercept(mock_packet(
            CircuitKey::new(10, 0),
            gen_rand_preimage().hash(),
            EXPIRY,
        ))
        .unwrap();
    let forward = next_forward(&mut forwards).await;

    let resolution = tokio::time::timeout(Duration::from_secs(5), handle.resolution())
        .await
        .expect("forward timed out in time");
    assert_eq!(
        resolution,
        Some(ForwardResolution::Fail(FailureReason::InterceptionTimeout))
    );
    assert_eq!(forward.state(), ForwardState::TimedOut);
}

#[tokio::test]
async fn test_stop_fails_held_forwards() {
    let (gate, _beacon, _dir) = setup(gate_config(true));
    let handle = gate
        .intercept(mock_packet(
            CircuitKey::new(11, 0),
            gen_rand_preimage().hash(),
            EXPIRY,
        ))
        .unwrap();

    gate.stop().await;

    assert_eq!(
        handle.resolution().await,
        Some(ForwardResolution::Fail(FailureReason::Code(
            FailureCode::TemporaryNodeFailure
        )))
    );
    assert!(matches!(
        gate.intercept(mock_packet(
            CircuitKey::new(11, 1),
            gen_rand_preimage().hash(),
            EXPIRY,
        )),
        Err(GateError::Stopped)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_forwards_racing_stop_are_all_resolved() {
    let (gate, _beacon, _dir) = setup(gate_config(true));

    let mut links = Vec::new();
    for i in 0..64u64 {
        let gate = gate.clone();
        links.push(tokio::spawn(async move {
            gate.intercept(mock_packet(
                CircuitKey::new(20, i),
                gen_rand_preimage().hash(),
                EXPIRY,
            ))
        }));
    }
    gate.stop().await;

    for link in links {
        match link.await.unwrap() {
            Ok(handle) => {
                let resolution = tokio::time::timeout(Duration::from_secs(5), handle.resolution())
                    .await
                    .expect("held forward resolved after stop");
                assert_eq!(
                    resolution,
                    Some(ForwardResolution::Fail(FailureReason::Code(
                        FailureCode::TemporaryNodeFailure
                    )))
                );
            }
            Err(err) => assert_eq!(err, GateError::Stopped),
        }
    }
    assert!(gate.pending_forwards().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolvers_only_one_wins() {
    let (gate, _beacon, _dir) = setup(gate_config(false));
    let (interceptor, mut forwards) = channel_interceptor();
    gate.register_interceptor(interceptor).unwrap();

    let preimage = gen_rand_preimage();
    let handle = gate
        .intercept(mock_packet(CircuitKey::new(12, 0), preimage.hash(), EXPIRY))
        .unwrap();
    let forward = next_forward(&mut forwards).await;

    let mut resolvers = Vec::new();
    for i in 0..16 {
        let forward = forward.clone();
        resolvers.push(tokio::spawn(async move {
            match i % 3 {
                0 => forward.settle(preimage),
                1 => forward.fail_with_code(FailureCode::TemporaryNodeFailure),
                _ => forward.resume(),
            }
        }));
    }
    let mut wins = 0;
    for resolver in resolvers {
        match resolver.await.unwrap() {
            Ok(()) => wins += 1,
            Err(GateError::DoubleResolution { .. }) => {}
            Err(err) => panic!("unexpected error {:?}", err),
        }
    }

    assert_eq!(wins, 1);
    assert!(forward.state().is_terminal());
    assert!(handle.resolution().await.is_some());
}

#[tokio::test]
async fn test_forward_resolved_event() {
    let (beacon, _dir) = generate_beacon();
    let gate = InterceptionGate::new(gate_config(false), beacon, HEIGHT);
    let (interceptor, mut forwards) = channel_interceptor();
    gate.register_interceptor(interceptor).unwrap();

    let preimage = gen_rand_preimage();
    let circuit_key = CircuitKey::new(13, 0);
    let expected = HtlcEvent::ForwardResolved {
        circuit_key,
        payment_hash: preimage.hash(),
        state: ForwardState::Settled,
    };
    let (subscriber_ref, subscriber_handle) =
        Actor::spawn(None, HtlcEventTestSubscriber, expected)
            .await
            .unwrap();
    gate.publisher().subscribe(Box::new(subscriber_ref));

    let _handle = gate
        .intercept(mock_packet(circuit_key, preimage.hash(), EXPIRY))
        .unwrap();
    next_forward(&mut forwards).await.settle(preimage).unwrap();

    ractor::concurrency::timeout(Duration::from_millis(500), subscriber_handle)
        .await
        .expect("Test actor failed in exit")
        .unwrap();
}
