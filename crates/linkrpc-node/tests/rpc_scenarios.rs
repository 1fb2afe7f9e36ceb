//! Two nodes talking over an in-memory duplex link.

use std::sync::Arc;
use std::time::{Duration, Instant};

use linkrpc_node::{
    CallOutcome, FunctionInfo, FunctionStatus, Framing, LocalNode, NodeConfig, NodeError, PeerId,
    PointToPointConnection, RequestStatus,
};
use linkrpc_transport::{duplex, MemoryEndpoint};

struct Pair {
    a: Arc<LocalNode>,
    b: Arc<LocalNode>,
    a_link: Arc<MemoryEndpoint>,
    /// B as seen from A.
    b_peer: PeerId,
}

fn config(framing: Framing) -> NodeConfig {
    NodeConfig {
        call_timeout: Duration::from_millis(300),
        poll_interval: Duration::from_millis(10),
        framing,
        ..NodeConfig::default()
    }
}

/// Connect A and B; B serves `echo` (id 1). A performs the handshake.
fn connect(framing: Framing) -> Pair {
    let a = LocalNode::with_config("A", config(framing));
    let b = LocalNode::with_config("B", config(framing));
    b.register_function("echo", 1, |input| Some(input.to_vec()))
        .unwrap();

    let (a_end, b_end) = duplex();
    let (a_link, b_link) = (Arc::new(a_end), Arc::new(b_end));
    let a_conn = PointToPointConnection::from_arc(a_link.clone());
    let b_conn = PointToPointConnection::from_arc(b_link.clone());
    a_link.set_receiver(a.receiver_for(&a_conn));
    b_link.set_receiver(b.receiver_for(&b_conn));

    b.attach_peer(&b_conn).unwrap();
    let b_peer = a.register_peer(&a_conn).unwrap();

    Pair {
        a,
        b,
        a_link,
        b_peer,
    }
}

#[test]
fn handshake_learns_peer_name() {
    let pair = connect(Framing::Raw);
    assert!(pair.b_peer > 0);

    let handle = pair.a.peer_by_name("B").unwrap();
    assert_eq!(handle.peer_id(), pair.b_peer);
    assert_eq!(handle.name().as_deref(), Some("B"));
    assert_eq!(pair.b.stats().requests_served, 1);
}

#[test]
fn synchronous_echo_returns_input() {
    let pair = connect(Framing::Raw);
    let input = [0x01, 0x11, 0x21, 0x31, 0x41];

    let outcome = pair
        .a
        .call(pair.b_peer, &FunctionInfo::new("echo", 1), &input, true)
        .unwrap();
    assert_eq!(outcome, CallOutcome::Completed(input.to_vec().into()));
}

#[test]
fn call_by_name_fetches_catalog() {
    let pair = connect(Framing::Raw);
    let outcome = pair.a.call_by_name(pair.b_peer, "echo", b"hi", true).unwrap();
    assert_eq!(outcome, CallOutcome::Completed(b"hi".to_vec().into()));

    let err = pair.a.call_by_name(pair.b_peer, "missing", b"", true).unwrap_err();
    assert!(matches!(err, NodeError::InvalidFunction(_)));
}

#[test]
fn asynchronous_call_is_pollable() {
    let pair = connect(Framing::Raw);
    let handle = pair.a.peer(pair.b_peer).unwrap();

    let token = handle.call_async(&FunctionInfo::new("echo", 1), b"async").unwrap();
    // The in-memory link delivers inline, so the response is already here.
    assert_eq!(handle.poll(token), Some(RequestStatus::Responded));
    assert_eq!(handle.take_result(token).unwrap().as_ref(), b"async");
    assert_eq!(handle.poll(token), None);
}

#[test]
fn unknown_function_gets_no_response_and_times_out() {
    let pair = connect(Framing::Raw);
    let started = Instant::now();
    let err = pair
        .a
        .call(pair.b_peer, &FunctionInfo::new("ghost", 77), b"", true)
        .unwrap_err();

    let elapsed = started.elapsed();
    let limits = config(Framing::Raw);
    assert!(matches!(err, NodeError::Timeout(_)));
    assert!(elapsed >= limits.call_timeout);
    assert!(
        elapsed < limits.call_timeout + limits.poll_interval + Duration::from_millis(150),
        "timed out late: {elapsed:?}"
    );
    assert_eq!(pair.b.stats().dispatch_failures, 1);
}

#[test]
fn function_status_reflects_remote_registry() {
    let pair = connect(Framing::Raw);
    pair.b
        .register_function("retired", 2, |_| Some(Vec::new()))
        .unwrap();
    pair.b.functions().disable(2);

    let handle = pair.a.peer(pair.b_peer).unwrap();
    assert_eq!(handle.query_function_status("echo").unwrap(), FunctionStatus::Valid);
    assert_eq!(handle.query_function_status("retired").unwrap(), FunctionStatus::Invalid);
    assert_eq!(handle.query_function_status("nope").unwrap(), FunctionStatus::NotExist);
}

#[test]
fn sequence_numbers_are_distinct_across_calls() {
    let pair = connect(Framing::Raw);
    let handle = pair.a.peer(pair.b_peer).unwrap();
    let function = FunctionInfo::new("ghost", 50);

    let first = handle.call_async(&function, b"").unwrap();
    let second = handle.call_async(&function, b"").unwrap();
    assert_ne!(first, second);
    assert_eq!(handle.pending_len(), 2);
}

#[test]
fn duplicate_registration_keeps_original_handler() {
    let pair = connect(Framing::Raw);
    let err = pair
        .b
        .register_function("echo", 5, |_| Some(b"imposter".to_vec()))
        .unwrap_err();
    assert!(matches!(err, NodeError::DuplicateFunction { .. }));

    let output = pair
        .a
        .peer(pair.b_peer)
        .unwrap()
        .call_sync(&FunctionInfo::new("echo", 1), b"real")
        .unwrap();
    assert_eq!(output.as_ref(), b"real");
}

#[test]
fn bytes_for_unknown_peer_are_ignored() {
    let pair = connect(Framing::Raw);
    let before = pair.b.stats();
    pair.b.on_packet_in(&[0xAA, 0x00, 0x55], 999);
    let after = pair.b.stats();
    assert_eq!(after.packets_from_unknown_peers, before.packets_from_unknown_peers + 1);
    assert_eq!(after.packets_malformed, before.packets_malformed);
}

#[test]
fn handshake_fails_without_responder() {
    let a = LocalNode::with_config("A", config(Framing::Raw));
    let (a_end, _b_end) = duplex();
    let a_link = Arc::new(a_end);
    let a_conn = PointToPointConnection::from_arc(a_link.clone());
    a_link.set_receiver(a.receiver_for(&a_conn));

    let err = a.register_peer(&a_conn).unwrap_err();
    assert!(matches!(err, NodeError::HandshakeFailed(_)));
    assert!(a.peer_ids().is_empty());
}

#[test]
fn closed_link_fails_synchronous_call() {
    let pair = connect(Framing::Raw);
    pair.a_link.close();
    let err = pair
        .a
        .call(pair.b_peer, &FunctionInfo::new("echo", 1), b"x", true)
        .unwrap_err();
    assert!(matches!(err, NodeError::SendFailed { .. }));
}

#[test]
fn framed_mode_round_trip() {
    let pair = connect(Framing::Framed);
    assert_eq!(pair.a.peer(pair.b_peer).unwrap().framing(), Framing::Framed);

    let output = pair
        .a
        .peer(pair.b_peer)
        .unwrap()
        .call_sync(&FunctionInfo::new("echo", 1), &[0xAA, 0x55, 0x00, 0x55])
        .unwrap();
    assert_eq!(output.as_ref(), &[0xAA, 0x55, 0x00, 0x55]);
}

#[test]
fn framed_mode_survives_line_noise() {
    let pair = connect(Framing::Framed);
    pair.a_link.set_interceptor(|bytes| {
        let mut noisy = vec![0x00, 0x13, 0x37];
        noisy.extend_from_slice(bytes);
        noisy.push(0x42);
        noisy
    });

    for round in 0u8..5 {
        let output = pair
            .a
            .peer(pair.b_peer)
            .unwrap()
            .call_sync(&FunctionInfo::new("echo", 1), &[round, round])
            .unwrap();
        assert_eq!(output.as_ref(), &[round, round]);
    }
}

#[test]
fn framed_mode_retransmits_after_corruption() {
    let pair = connect(Framing::Framed);

    // Corrupt only the first request frame after the handshake.
    let corrupted = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = Arc::clone(&corrupted);
    pair.a_link.set_interceptor(move |bytes| {
        let mut out = bytes.to_vec();
        if !flag.swap(true, std::sync::atomic::Ordering::SeqCst) && out.len() > 8 {
            let checksum_at = out.len() - 2;
            out[checksum_at] ^= 0x01;
        }
        out
    });

    let output = pair
        .a
        .peer(pair.b_peer)
        .unwrap()
        .call_sync(&FunctionInfo::new("echo", 1), b"again")
        .unwrap();
    assert_eq!(output.as_ref(), b"again");
    assert!(corrupted.load(std::sync::atomic::Ordering::SeqCst));
}
