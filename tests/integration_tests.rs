use epochcomm::config::Config;
use epochcomm::transport::mock::build_world;
use epochcomm::transport::Transport;
use epochcomm::CommunicationLayer;
use std::sync::{Arc, Mutex};
use std::thread;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn layer_for(rank_transport: impl Transport + 'static, config: Config) -> CommunicationLayer {
    CommunicationLayer::new(Arc::new(rank_transport), config)
}

/// Scenario 1: P=2, tag 7, rank 0 sends "hello" to rank 1. After `flush(7)`
/// returns at rank 1, its callback must have received exactly the payload.
#[test]
fn ping_pong_delivers_exact_payload() {
    init_tracing();
    let world = build_world(2);
    let mut endpoints = world.into_iter();
    let t0 = endpoints.next().unwrap();
    let t1 = endpoints.next().unwrap();

    let received: Arc<Mutex<Vec<(Vec<u8>, i32)>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = Arc::clone(&received);

    let h1 = thread::spawn(move || {
        let layer = layer_for(t1, Config::default());
        layer.init();
        layer
            .register_callback(7, move |bytes, source| {
                received_clone.lock().unwrap().push((bytes.to_vec(), source));
            })
            .unwrap();
        layer.flush(7).unwrap();
        layer.finalize().unwrap();
    });

    let h0 = thread::spawn(move || {
        let layer = layer_for(t0, Config::default());
        layer.init();
        layer.register_callback(7, |_, _| {}).unwrap();
        layer.send(b"hello", 1, 7).unwrap();
        layer.flush(7).unwrap();
        layer.finalize().unwrap();
    });

    h0.join().unwrap();
    h1.join().unwrap();

    let got = received.lock().unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0], (b"hello".to_vec(), 0));
}

/// Scenario 2: P=4, tag 1, each rank sends N messages of 16 bytes to rank
/// `(self + 1) mod P`. Every rank's callback must fire exactly N times with
/// data from `(self - 1 + P) mod P`.
#[test]
fn ring_all_to_all_delivers_every_message_exactly_once() {
    init_tracing();
    const P: i32 = 4;
    const N: usize = 200;

    let world = build_world(P);
    let counts: Vec<Arc<Mutex<usize>>> = (0..P).map(|_| Arc::new(Mutex::new(0))).collect();
    let sources: Vec<Arc<Mutex<Vec<i32>>>> = (0..P).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();

    let handles: Vec<_> = world
        .into_iter()
        .enumerate()
        .map(|(rank, transport)| {
            let count = Arc::clone(&counts[rank]);
            let srcs = Arc::clone(&sources[rank]);
            thread::spawn(move || {
                let self_rank = rank as i32;
                let layer = layer_for(transport, Config::default());
                layer.init();
                layer
                    .register_callback(1, move |_bytes, source| {
                        *count.lock().unwrap() += 1;
                        srcs.lock().unwrap().push(source);
                    })
                    .unwrap();

                let dst = (self_rank + 1) % P;
                for i in 0..N {
                    let payload = (i as u64).to_le_bytes();
                    layer.send(&payload, dst, 1).unwrap();
                }
                layer.flush(1).unwrap();
                layer.finalize().unwrap();
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    for rank in 0..P as usize {
        assert_eq!(*counts[rank].lock().unwrap(), N);
        let expected_source = (rank as i32 - 1 + P) % P;
        assert!(sources[rank]
            .lock()
            .unwrap()
            .iter()
            .all(|&s| s == expected_source));
    }
}

/// Scenario 3: P=3, several producer threads per rank push small records to
/// random destinations on one tag; after a single controller `flush`, every
/// payload sent has arrived exactly once, none lost or duplicated.
#[test]
fn concurrent_producers_to_random_destinations_deliver_without_loss_or_duplication() {
    init_tracing();
    const P: i32 = 3;
    const PRODUCERS: usize = 4;
    const RECORDS_PER_PRODUCER: usize = 300;

    let world = build_world(P);
    let received_counts: Vec<Arc<Mutex<usize>>> = (0..P).map(|_| Arc::new(Mutex::new(0))).collect();

    let handles: Vec<_> = world
        .into_iter()
        .enumerate()
        .map(|(rank, transport)| {
            let count = Arc::clone(&received_counts[rank]);
            thread::spawn(move || {
                let self_rank = rank as i32;
                let layer = Arc::new(layer_for(transport, Config::default()));
                layer.init();
                layer
                    .register_callback(2, move |bytes, _source| {
                        assert_eq!(bytes.len(), 8);
                        *count.lock().unwrap() += 1;
                    })
                    .unwrap();

                let producer_handles: Vec<_> = (0..PRODUCERS)
                    .map(|p| {
                        let layer = Arc::clone(&layer);
                        thread::spawn(move || {
                            for i in 0..RECORDS_PER_PRODUCER {
                                // Deterministic pseudo-random destination,
                                // cheap and reproducible without adding a
                                // rand dependency for a single test.
                                let dst = ((self_rank as usize * 131 + p * 17 + i) % P as usize) as i32;
                                let payload = (i as u64).to_le_bytes();
                                layer.send(&payload, dst, 2).unwrap();
                            }
                        })
                    })
                    .collect();
                for h in producer_handles {
                    h.join().unwrap();
                }

                layer.flush(2).unwrap();
                layer.finalize().unwrap();
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let total_sent = PRODUCERS * RECORDS_PER_PRODUCER * P as usize;
    let total_received: usize = received_counts.iter().map(|c| *c.lock().unwrap()).sum();
    assert_eq!(total_received, total_sent);
}

/// Scenario 4: both ranks call `flush(1)` then `flush(2)` in the same
/// order; both return in finite time (matching flush order across peers
/// does not deadlock).
#[test]
fn matching_flush_order_across_peers_completes() {
    init_tracing();
    let world = build_world(2);
    let mut endpoints = world.into_iter();
    let t0 = endpoints.next().unwrap();
    let t1 = endpoints.next().unwrap();

    let run_rank = |transport, tag_a: u32, tag_b: u32| {
        let layer = layer_for(transport, Config::default());
        layer.init();
        layer.register_callback(tag_a, |_, _| {}).unwrap();
        layer.register_callback(tag_b, |_, _| {}).unwrap();
        layer.flush(tag_a).unwrap();
        layer.flush(tag_b).unwrap();
        layer.finalize().unwrap();
    };

    let h0 = thread::spawn(move || run_rank(t0, 1, 2));
    let h1 = thread::spawn(move || run_rank(t1, 1, 2));
    h0.join().unwrap();
    h1.join().unwrap();
}

/// Scenario 5: `finish(1)` from both sides, then `send(_, _, _, 1)` must
/// raise an invalid-argument error.
#[test]
fn send_after_finish_is_rejected() {
    init_tracing();
    let world = build_world(2);
    let mut endpoints = world.into_iter();
    let t0 = endpoints.next().unwrap();
    let t1 = endpoints.next().unwrap();

    let run_rank = |transport| {
        let layer = layer_for(transport, Config::default());
        layer.init();
        layer.register_callback(1, |_, _| {}).unwrap();
        layer.finish(1).unwrap();

        let err = layer.send(b"late", 1, 1).unwrap_err();
        assert!(matches!(err, epochcomm::CommError::InvalidArgument(_)));

        layer.finalize().unwrap();
    };

    let h0 = thread::spawn(move || run_rank(t0));
    let h1 = thread::spawn(move || run_rank(t1));
    h0.join().unwrap();
    h1.join().unwrap();
}

/// Scenario 6: P=1 single-process loopback, many sends of varied sizes with
/// periodic flush, must deliver every payload exactly once, in order.
#[test]
fn single_process_loopback_delivers_every_varied_size_payload() {
    init_tracing();
    const TOTAL: usize = 4000;
    const FLUSH_EVERY: usize = 200;

    let world = build_world(1);
    let transport = world.into_iter().next().unwrap();
    let layer = layer_for(transport, Config::default());
    layer.init();

    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let received_clone = Arc::clone(&received);
    layer
        .register_callback(3, move |bytes, source| {
            assert_eq!(source, 0);
            received_clone.lock().unwrap().push(bytes.to_vec());
        })
        .unwrap();

    let mut expected = Vec::with_capacity(TOTAL);
    for i in 0..TOTAL {
        let size = 1 + (i % 64);
        let payload: Vec<u8> = (0..size).map(|b| (b as u8).wrapping_add(i as u8)).collect();
        layer.send(&payload, 0, 3).unwrap();
        expected.push(payload);

        if (i + 1) % FLUSH_EVERY == 0 {
            layer.flush(3).unwrap();
        }
    }
    layer.flush(3).unwrap();
    layer.finalize().unwrap();

    let got = received.lock().unwrap();
    assert_eq!(got.len(), TOTAL);
    assert_eq!(*got, expected);
}

/// Boundary test: an append equal to the buffer capacity fills exactly
/// (`Full`-with-write) and the payload still arrives intact end to end.
#[test]
fn payload_equal_to_buffer_capacity_is_delivered() {
    init_tracing();
    let config = Config::new(16, 2, 1, 8, 8, false);
    let world = build_world(1);
    let transport = world.into_iter().next().unwrap();
    let layer = layer_for(transport, config);
    layer.init();

    let received: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let received_clone = Arc::clone(&received);
    layer
        .register_callback(4, move |bytes, _| {
            *received_clone.lock().unwrap() = Some(bytes.to_vec());
        })
        .unwrap();

    let payload = vec![9u8; 16];
    layer.send(&payload, 0, 4).unwrap();
    layer.flush(4).unwrap();
    layer.finalize().unwrap();

    assert_eq!(received.lock().unwrap().as_deref(), Some(payload.as_slice()));
}

/// Boundary test: a payload larger than the configured buffer capacity is
/// rejected up front rather than silently split.
#[test]
fn payload_larger_than_capacity_is_rejected() {
    init_tracing();
    let config = Config::new(16, 2, 1, 8, 8, false);
    let world = build_world(1);
    let transport = world.into_iter().next().unwrap();
    let layer = layer_for(transport, config);
    layer.init();
    layer.register_callback(5, |_, _| {}).unwrap();

    let err = layer.send(&vec![1u8; 17], 0, 5).unwrap_err();
    assert!(matches!(err, epochcomm::CommError::InvalidArgument(_)));

    layer.finalize().unwrap();
}

/// Boundary test: a zero-byte send is rejected.
#[test]
fn zero_length_send_is_rejected() {
    init_tracing();
    let world = build_world(1);
    let transport = world.into_iter().next().unwrap();
    let layer = layer_for(transport, Config::default());
    layer.init();
    layer.register_callback(6, |_, _| {}).unwrap();

    let err = layer.send(&[], 0, 6).unwrap_err();
    assert!(matches!(err, epochcomm::CommError::InvalidArgument(_)));

    layer.finalize().unwrap();
}
