//! Failure-path tests: nodes that misbehave, vanish, or never show up.
//!
//! Each case checks that the bad node is contained: other nodes keep
//! flowing, `finish` stays bounded, and the failure callback fires only
//! for transport failures of registered nodes.

mod common;

use std::io::Write;
use std::net::TcpStream;
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use common::{
    close_streams, connect_node, init_tracing, loopback_config, node_addr, start_step, wait_for,
    SharedOutput, SIGNATURE, WAIT,
};
use stepio_core::sim::SimNode;
use stepio_core::{FrameHeader, FrameKind, Handshake, LocalIo, OutputTarget};

// =============================================================================
// Connection setup
// =============================================================================

#[test]
fn chaos_silent_socket_does_not_block_others() {
    init_tracing();
    let out = SharedOutput::new();
    let local = LocalIo::default().with_stdout(OutputTarget::Writer(out.boxed()));
    let (mut io, failures) = start_step(2, 1, false, local, loopback_config());

    // Connects but never sends a handshake
    let silent = TcpStream::connect(node_addr(&io, 1)).unwrap();

    let mut node = connect_node(&io, 0, 1);
    node.send_stdout(0, b"still flowing\n").unwrap();
    close_streams(&mut node, 0..1);

    assert!(!io.wait_for_connections(Duration::from_millis(600)));
    io.mark_nodes_down(&[1]);
    assert!(io.wait_for_completion(WAIT));

    let started = Instant::now();
    io.finish().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(out.text(), "still flowing\n");
    assert!(failures.entries().is_empty());
    drop(silent);
}

#[test]
fn chaos_duplicate_node_rejected() {
    init_tracing();
    let (mut io, _) = start_step(2, 1, false, LocalIo::default(), loopback_config());

    let mut first = connect_node(&io, 0, 1);
    assert!(wait_for(|| io.stats().connected == 1));

    let mut duplicate = connect_node(&io, 0, 1);
    assert!(matches!(duplicate.read_frame(), Ok(None) | Err(_)));
    assert_eq!(io.stats().connected, 1);

    close_streams(&mut first, 0..1);
    io.mark_nodes_down(&[1]);
    assert!(io.wait_for_completion(WAIT));
    io.finish().unwrap();
}

#[test]
fn chaos_bad_signature_rejected() {
    init_tracing();
    let (mut io, failures) = start_step(1, 1, false, LocalIo::default(), loopback_config());

    let forged = Handshake::new(0, b"forged".to_vec(), 1, 1);
    let mut node = SimNode::connect_with(node_addr(&io, 0), &forged).unwrap();
    node.set_read_timeout(Some(WAIT)).unwrap();
    assert!(matches!(node.read_frame(), Ok(None) | Err(_)));

    assert_eq!(io.stats().connected, 0);
    assert!(!io.wait_for_connections(Duration::from_millis(50)));

    // The real node can still claim the slot
    let mut real = connect_node(&io, 0, 1);
    close_streams(&mut real, 0..1);
    assert!(io.wait_for_completion(WAIT));
    io.finish().unwrap();
    assert!(failures.entries().is_empty());
}

#[test]
fn chaos_node_id_out_of_range_rejected() {
    init_tracing();
    let (mut io, _) = start_step(1, 1, false, LocalIo::default(), loopback_config());

    let mut stray = SimNode::connect(node_addr(&io, 0), 7, SIGNATURE, 1, 1).unwrap();
    stray.set_read_timeout(Some(WAIT)).unwrap();
    assert!(matches!(stray.read_frame(), Ok(None) | Err(_)));
    assert_eq!(io.stats().connected, 0);
    io.finish().unwrap();
}

#[test]
fn chaos_late_handshake_from_down_node() {
    init_tracing();
    let (mut io, failures) = start_step(2, 1, false, LocalIo::default(), loopback_config());

    io.mark_nodes_down(&[1]);
    let mut late = connect_node(&io, 1, 1);
    assert!(matches!(late.read_frame(), Ok(None) | Err(_)));

    let mut node = connect_node(&io, 0, 1);
    close_streams(&mut node, 0..1);
    assert!(io.wait_for_completion(WAIT));
    io.finish().unwrap();

    let stats = io.stats();
    assert_eq!((stats.connected, stats.down), (1, 1));
    assert!(failures.entries().is_empty());
}

// =============================================================================
// Transport failures
// =============================================================================

#[test]
fn chaos_disconnect_with_open_streams_reports_failure() {
    init_tracing();
    let out = SharedOutput::new();
    let local = LocalIo::default().with_stdout(OutputTarget::Writer(out.boxed()));
    let (mut io, failures) = start_step(2, 1, false, local, loopback_config());

    let mut healthy = connect_node(&io, 0, 1);
    let mut doomed = connect_node(&io, 1, 1);
    doomed.send_stdout(1, b"partial work\n").unwrap();
    doomed.disconnect().unwrap();

    healthy.send_stdout(0, b"done\n").unwrap();
    close_streams(&mut healthy, 0..1);

    assert!(io.wait_for_completion(WAIT));
    io.finish().unwrap();

    assert_eq!(failures.entries(), vec![(1, "node1".to_string())]);
    assert_eq!(out.sorted_lines(), vec!["done".to_string(), "partial work".to_string()]);
}

#[test]
fn chaos_disconnect_mid_frame_reports_failure() {
    init_tracing();
    let (mut io, failures) = start_step(1, 1, false, LocalIo::default(), loopback_config());

    let mut node = connect_node(&io, 0, 1);
    let header = FrameHeader {
        kind: FrameKind::Stdout,
        global_task_id: 0,
        local_task_id: 0,
        length: 100,
    };
    node.send_raw(&header.encode()).unwrap();
    node.send_raw(b"only part of it").unwrap();
    node.disconnect().unwrap();

    assert!(io.wait_for_completion(WAIT));
    io.finish().unwrap();
    assert_eq!(failures.entries(), vec![(0, "node0".to_string())]);
}

#[test]
fn chaos_garbage_frame_reports_failure() {
    init_tracing();
    let (mut io, failures) = start_step(2, 1, false, LocalIo::default(), loopback_config());

    let mut bad = connect_node(&io, 0, 1);
    let mut good = connect_node(&io, 1, 1);

    // Unknown frame kind
    bad.send_raw(&[0xff, 0xff, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap();
    assert!(matches!(bad.read_frame(), Ok(None) | Err(_)));

    close_streams(&mut good, 1..2);
    assert!(io.wait_for_completion(WAIT));
    io.finish().unwrap();
    assert_eq!(failures.entries(), vec![(0, "node0".to_string())]);
}

#[test]
fn chaos_finish_with_nodes_still_streaming() {
    init_tracing();
    let (mut io, failures) = start_step(2, 1, false, LocalIo::default(), loopback_config());

    let mut nodes: Vec<_> = (0..2).map(|id| connect_node(&io, id, 1)).collect();
    assert!(io.wait_for_connections(WAIT));
    for node in &mut nodes {
        node.send_stdout(0, b"never closed\n").ok();
    }

    let started = Instant::now();
    io.finish().unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    for node in &mut nodes {
        let _ = node.read_until_closed();
    }
    assert!(failures.entries().is_empty());
    io.destroy().unwrap();
}

#[test]
fn chaos_raw_bytes_before_handshake_length() {
    init_tracing();
    let (mut io, _) = start_step(1, 1, false, LocalIo::default(), loopback_config());

    // A length prefix far beyond any sane handshake
    let mut stream = TcpStream::connect(node_addr(&io, 0)).unwrap();
    stream.write_all(&u32::MAX.to_be_bytes()).unwrap();
    stream.set_read_timeout(Some(WAIT)).unwrap();
    let mut byte = [0u8; 1];
    assert!(matches!(std::io::Read::read(&mut stream, &mut byte), Ok(0) | Err(_)));

    assert_eq!(io.stats().connected, 0);
    io.finish().unwrap();
}
