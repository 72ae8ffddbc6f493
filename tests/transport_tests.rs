//! End-to-end tests over the in-process loopback network.
//!
//! Each test wires two or three transports to one `FakeNetwork` and drives
//! them by polling, the way a dispatch thread would in production.

use std::sync::Arc;

use oprpc::{Driver, FakeNetwork, Op, OpState, Transport, TransportConfig};

const MAX_POLLS: usize = 500;

fn new_transport(network: &Arc<FakeNetwork>, id: u64) -> Transport<oprpc::FakeDriver> {
    Transport::new(network.new_driver(), id, TransportConfig::default())
}

#[test]
fn test_round_trip() {
    let network = FakeNetwork::with_max_payload(1032);
    let client = new_transport(&network, 1);
    let server = new_transport(&network, 2);

    let op = client.alloc_op();
    op.append(b"ping").unwrap();
    client
        .send_request(&op, server.driver().local_address())
        .unwrap();
    assert_eq!(op.state(), OpState::InProgress);

    let mut server_op: Option<Arc<Op<_>>> = None;
    for _ in 0..MAX_POLLS {
        client.poll();
        server.poll();
        if server_op.is_none() {
            if let Some(incoming) = server.receive_op() {
                assert!(incoming.is_server_op());
                assert_eq!(incoming.payload().unwrap(), b"ping");
                incoming.append(b"pong").unwrap();
                server.send_reply(&incoming).unwrap();
                server_op = Some(incoming);
            }
        }
        if op.state() == OpState::Completed {
            break;
        }
    }

    assert_eq!(op.state(), OpState::Completed);
    assert_eq!(op.payload().unwrap(), b"pong");

    // The server op finishes once its reply is fully sent.
    let server_op = server_op.expect("server never saw the request");
    for _ in 0..8 {
        client.poll();
        server.poll();
    }
    assert_eq!(server_op.state(), OpState::Completed);

    server.release_op(&server_op);
    client.release_op(&op);
    client.poll();
    server.poll();
}

#[test]
fn test_large_request_paced_by_grants() {
    let network = FakeNetwork::with_max_payload(1032);
    let client = new_transport(&network, 1);
    let server = new_transport(&network, 2);

    // Well past the 10 kB unscheduled window, so completion requires the
    // server's GRANT packets to reach the client.
    let payload: Vec<u8> = (0..30_000u32).map(|i| (i % 241) as u8).collect();
    let op = client.alloc_op();
    op.append(&payload).unwrap();
    client
        .send_request(&op, server.driver().local_address())
        .unwrap();

    let mut server_op = None;
    for _ in 0..MAX_POLLS {
        client.poll();
        server.poll();
        if server_op.is_none() {
            if let Some(incoming) = server.receive_op() {
                assert_eq!(incoming.payload().unwrap(), payload);
                incoming.append(b"ok").unwrap();
                server.send_reply(&incoming).unwrap();
                server_op = Some(incoming);
            }
        }
        if op.state() == OpState::Completed {
            break;
        }
    }

    assert_eq!(op.state(), OpState::Completed);
    assert_eq!(op.payload().unwrap(), b"ok");
}

#[test]
fn test_chained_ops_complete_with_done() {
    let network = FakeNetwork::with_max_payload(1032);
    let origin = new_transport(&network, 1);
    let middle = new_transport(&network, 2);
    let worker = new_transport(&network, 3);

    let op = origin.alloc_op();
    op.append(b"job").unwrap();
    origin
        .send_request(&op, middle.driver().local_address())
        .unwrap();

    let mut middle_op: Option<Arc<Op<_>>> = None;
    let mut worker_op: Option<Arc<Op<_>>> = None;
    for _ in 0..MAX_POLLS {
        origin.poll();
        middle.poll();
        worker.poll();
        if middle_op.is_none() {
            if let Some(incoming) = middle.receive_op() {
                assert_eq!(incoming.payload().unwrap(), b"job");
                // Delegate the op instead of replying.
                incoming.append(b"job").unwrap();
                middle
                    .send_request(&incoming, worker.driver().local_address())
                    .unwrap();
                middle_op = Some(incoming);
            }
        }
        if worker_op.is_none() {
            if let Some(incoming) = worker.receive_op() {
                assert_eq!(incoming.payload().unwrap(), b"job");
                incoming.append(b"done").unwrap();
                worker.send_reply(&incoming).unwrap();
                worker_op = Some(incoming);
            }
        }
        let middle_completed = middle_op
            .as_ref()
            .is_some_and(|op| op.state() == OpState::Completed);
        if op.state() == OpState::Completed && middle_completed {
            break;
        }
    }

    // The worker's reply skipped the middle hop and reached the origin.
    assert_eq!(op.state(), OpState::Completed);
    assert_eq!(op.payload().unwrap(), b"done");

    // The worker's DONE closed out the middle hop's chained request.
    let middle_op = middle_op.expect("middle never saw the request");
    assert_eq!(middle_op.state(), OpState::Completed);
    let worker_op = worker_op.expect("worker never saw the request");
    assert_eq!(worker_op.state(), OpState::Completed);

    origin.release_op(&op);
    middle.release_op(&middle_op);
    worker.release_op(&worker_op);
    origin.poll();
    middle.poll();
    worker.poll();
}

#[test]
fn test_send_to_dead_endpoint_fails_op() {
    let network = FakeNetwork::with_max_payload(1032);
    let client = new_transport(&network, 1);

    // Resolvable address, but nothing listens there.
    let nowhere = client.driver().get_address("4242").unwrap();
    let op = client.alloc_op();
    op.append(b"anyone home").unwrap();
    client.send_request(&op, nowhere).unwrap();

    client.poll();

    assert_eq!(op.state(), OpState::Failed);
    assert!(op.payload().is_none());
    client.release_op(&op);
    client.poll();
}

#[test]
fn test_multiple_concurrent_ops() {
    let network = FakeNetwork::with_max_payload(1032);
    let client = new_transport(&network, 1);
    let server = new_transport(&network, 2);

    let ops: Vec<_> = (0..5u8)
        .map(|i| {
            let op = client.alloc_op();
            op.append(&[i; 64]).unwrap();
            client
                .send_request(&op, server.driver().local_address())
                .unwrap();
            op
        })
        .collect();

    for _ in 0..MAX_POLLS {
        client.poll();
        server.poll();
        while let Some(incoming) = server.receive_op() {
            // Echo the request payload back.
            let request = incoming.payload().unwrap();
            incoming.append(&request).unwrap();
            server.send_reply(&incoming).unwrap();
            server.release_op(&incoming);
        }
        if ops.iter().all(|op| op.state() == OpState::Completed) {
            break;
        }
    }

    for (i, op) in ops.iter().enumerate() {
        assert_eq!(op.state(), OpState::Completed);
        assert_eq!(op.payload().unwrap(), vec![i as u8; 64]);
        client.release_op(op);
    }
    client.poll();
}

#[test]
fn test_concurrent_application_threads() {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    let network = FakeNetwork::with_max_payload(1032);
    let client = Arc::new(new_transport(&network, 1));
    let server = Arc::new(new_transport(&network, 2));
    let server_address = server.driver().local_address();
    let stop = Arc::new(AtomicBool::new(false));

    // One dispatch thread drives both transports.
    let poller = {
        let client = Arc::clone(&client);
        let server = Arc::clone(&server);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                client.poll();
                server.poll();
                std::thread::yield_now();
            }
        })
    };

    // One application thread answers server ops.
    let responder = {
        let server = Arc::clone(&server);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                match server.receive_op() {
                    Some(op) => {
                        let request = op.payload().unwrap();
                        op.append(&request).unwrap();
                        server.send_reply(&op).unwrap();
                        server.release_op(&op);
                    }
                    None => std::thread::yield_now(),
                }
            }
        })
    };

    // Two application threads issue ops concurrently.
    let clients: Vec<_> = (0..2u8)
        .map(|thread_id| {
            let client = Arc::clone(&client);
            let server_address = server_address.clone();
            std::thread::spawn(move || {
                for i in 0..10u8 {
                    let op = client.alloc_op();
                    op.append(&[thread_id * 100 + i; 32]).unwrap();
                    client.send_request(&op, server_address.clone()).unwrap();

                    let deadline = Instant::now() + Duration::from_secs(10);
                    while op.state() == OpState::InProgress {
                        assert!(Instant::now() < deadline, "op timed out");
                        std::thread::yield_now();
                    }
                    assert_eq!(op.state(), OpState::Completed);
                    assert_eq!(op.payload().unwrap(), vec![thread_id * 100 + i; 32]);
                    client.release_op(&op);
                }
            })
        })
        .collect();

    for handle in clients {
        handle.join().unwrap();
    }
    stop.store(true, Ordering::Release);
    poller.join().unwrap();
    responder.join().unwrap();
}
