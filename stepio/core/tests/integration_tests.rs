//! End-to-end tests: a real controller on loopback sockets, simulated node
//! agents on plain threads.

mod common;

use std::io::Cursor;
use std::thread;

use pretty_assertions::assert_eq;

use common::{
    close_streams, connect_node, init_tracing, loopback_config, start_step, SharedOutput, WAIT,
};
use stepio_core::{FrameKind, IoConfig, LocalIo, OutputTarget, StdinSource, StdinTarget};

// =============================================================================
// Output
// =============================================================================

#[test]
fn test_labelled_output_from_every_task() {
    init_tracing();
    let out = SharedOutput::new();
    let local = LocalIo::default()
        .with_stdout(OutputTarget::Writer(out.boxed()))
        .with_stderr(OutputTarget::SameAsStdout);
    let (mut io, failures) = start_step(4, 2, true, local, loopback_config());

    for node_id in 0..4u32 {
        let mut node = connect_node(&io, node_id, 2);
        let first = u16::try_from(node_id * 2).unwrap();
        for task in first..first + 2 {
            node.send_stdout(task, format!("hello from task {task}\n").as_bytes())
                .unwrap();
        }
        close_streams(&mut node, first..first + 2);
    }

    assert!(io.wait_for_connections(WAIT));
    assert!(io.wait_for_completion(WAIT));
    io.finish().unwrap();

    let expected: Vec<String> = (0..8).map(|t| format!("{t}: hello from task {t}")).collect();
    assert_eq!(out.sorted_lines(), expected);
    assert!(failures.entries().is_empty());

    let stats = io.stats();
    assert_eq!((stats.connected, stats.finished), (4, 4));
    assert_eq!(stats.incoming.free, stats.incoming.allocated);
    io.destroy().unwrap();
}

#[test]
fn test_large_output_is_byte_exact() {
    init_tracing();
    let out = SharedOutput::new();
    let local = LocalIo::default().with_stdout(OutputTarget::Writer(out.boxed()));
    let (mut io, _) = start_step(1, 1, false, local, loopback_config());

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let mut node = connect_node(&io, 0, 1);
    node.send_stdout(0, &payload).unwrap();
    close_streams(&mut node, 0..1);

    assert!(io.wait_for_completion(WAIT));
    io.finish().unwrap();
    assert!(out.bytes() == payload, "output differs from what the task wrote");
}

#[test]
fn test_stderr_routed_separately() {
    init_tracing();
    let out = SharedOutput::new();
    let err = SharedOutput::new();
    let local = LocalIo::default()
        .with_stdout(OutputTarget::Writer(out.boxed()))
        .with_stderr(OutputTarget::Writer(err.boxed()));
    let (mut io, _) = start_step(1, 1, false, local, loopback_config());

    let mut node = connect_node(&io, 0, 1);
    node.send_stdout(0, b"to stdout\n").unwrap();
    node.send_stderr(0, b"to stderr\n").unwrap();
    close_streams(&mut node, 0..1);

    assert!(io.wait_for_completion(WAIT));
    io.finish().unwrap();
    assert_eq!(out.text(), "to stdout\n");
    assert_eq!(err.text(), "to stderr\n");
}

#[test]
fn test_output_filter_keeps_one_task() {
    init_tracing();
    let out = SharedOutput::new();
    let local = LocalIo::default()
        .with_stdout(OutputTarget::Writer(out.boxed()))
        .with_output_filter(1);
    let (mut io, _) = start_step(1, 2, false, local, loopback_config());

    let mut node = connect_node(&io, 0, 2);
    node.send_stdout(0, b"task zero\n").unwrap();
    node.send_stdout(1, b"task one\n").unwrap();
    close_streams(&mut node, 0..2);

    assert!(io.wait_for_completion(WAIT));
    io.finish().unwrap();
    assert_eq!(out.text(), "task one\n");
}

#[test]
fn test_per_task_output_files() {
    init_tracing();
    let dir = tempfile::TempDir::new().unwrap();
    let pattern = dir.path().join("out-%t.txt").display().to_string();
    let local = LocalIo::default().with_stdout(OutputTarget::File(pattern));
    let (mut io, _) = start_step(2, 1, false, local, loopback_config());

    for node_id in 0..2u32 {
        let mut node = connect_node(&io, node_id, 1);
        let task = u16::try_from(node_id).unwrap();
        node.send_stdout(task, format!("task {task}\n").as_bytes()).unwrap();
        close_streams(&mut node, task..task + 1);
    }

    assert!(io.wait_for_completion(WAIT));
    io.finish().unwrap();

    for task in 0..2 {
        let written = std::fs::read_to_string(dir.path().join(format!("out-{task}.txt"))).unwrap();
        assert_eq!(written, format!("task {task}\n"));
    }
}

// =============================================================================
// Stdin
// =============================================================================

#[test]
fn test_broadcast_stdin_reaches_every_node() {
    init_tracing();
    let input = b"line one\nline two\n".to_vec();
    let out = SharedOutput::new();
    let local = LocalIo::default()
        .with_stdin(
            StdinSource::Reader(Box::new(Cursor::new(input.clone()))),
            StdinTarget::Broadcast,
        )
        .with_stdout(OutputTarget::Writer(out.boxed()));
    let (mut io, _) = start_step(2, 1, false, local, loopback_config());

    let agents: Vec<_> = (0..2u32)
        .map(|node_id| {
            let mut node = connect_node(&io, node_id, 1);
            thread::spawn(move || {
                let mut received = Vec::new();
                while let Some((header, payload)) = node.read_frame().unwrap() {
                    assert_eq!(header.kind, FrameKind::AllStdin);
                    if header.is_end_marker() {
                        break;
                    }
                    received.extend_from_slice(&payload);
                }
                let task = u16::try_from(node_id).unwrap();
                close_streams(&mut node, task..task + 1);
                received
            })
        })
        .collect();

    for agent in agents {
        assert_eq!(agent.join().unwrap(), input);
    }
    assert!(io.wait_for_completion(WAIT));
    io.finish().unwrap();
    assert_eq!(io.stats().outgoing.free, io.stats().outgoing.allocated);
}

#[test]
fn test_stdin_frames_fit_queue_capacity() {
    init_tracing();
    let input: Vec<u8> = (0..5_000u32).map(|i| b'a' + (i % 26) as u8).collect();
    let config = IoConfig {
        outbound_queue_bytes: 300,
        ..loopback_config()
    };
    let local = LocalIo::default().with_stdin(
        StdinSource::Reader(Box::new(Cursor::new(input.clone()))),
        StdinTarget::Broadcast,
    );
    let (mut io, _) = start_step(2, 1, false, local, config);

    // Node 1 reads nothing until node 0 has seen the end marker; every
    // frame on the wire must still fit one outbound queue
    let mut slow = connect_node(&io, 1, 1);
    let mut fast = connect_node(&io, 0, 1);

    let mut fast_bytes = Vec::new();
    while let Some((header, payload)) = fast.read_frame().unwrap() {
        assert!(header.payload_len() <= 300, "chunk of {} bytes", header.payload_len());
        if header.is_end_marker() {
            break;
        }
        fast_bytes.extend_from_slice(&payload);
    }
    let mut slow_bytes = Vec::new();
    while let Some((header, payload)) = slow.read_frame().unwrap() {
        assert!(header.payload_len() <= 300);
        if header.is_end_marker() {
            break;
        }
        slow_bytes.extend_from_slice(&payload);
    }

    assert!(fast_bytes == input);
    assert!(slow_bytes == input);
    close_streams(&mut fast, 0..1);
    close_streams(&mut slow, 1..2);
    assert!(io.wait_for_completion(WAIT));
    io.finish().unwrap();
}

#[test]
fn test_stdin_to_single_task() {
    init_tracing();
    let local = LocalIo::default().with_stdin(
        StdinSource::Reader(Box::new(Cursor::new(b"only for task 3\n".to_vec()))),
        StdinTarget::Task(3),
    );
    let (mut io, _) = start_step(2, 2, false, local, loopback_config());

    let mut other = connect_node(&io, 0, 2);
    let mut target = connect_node(&io, 1, 2);

    let (header, payload) = target.read_frame().unwrap().unwrap();
    assert_eq!(header.kind, FrameKind::Stdin);
    assert_eq!(header.global_task_id, 3);
    assert_eq!(payload, b"only for task 3\n".to_vec());
    let (end, _) = target.read_frame().unwrap().unwrap();
    assert!(end.is_end_marker());

    close_streams(&mut target, 2..4);
    close_streams(&mut other, 0..2);
    assert!(io.wait_for_completion(WAIT));
    io.finish().unwrap();

    // Node 0 never hosted task 3 and saw nothing but the close
    assert!(other.read_until_closed().unwrap().is_empty());
}

// =============================================================================
// Controller operations
// =============================================================================

#[test]
fn test_connection_test_reaches_node() {
    init_tracing();
    let (mut io, _) = start_step(1, 1, false, LocalIo::default(), loopback_config());

    let mut node = connect_node(&io, 0, 1);
    assert!(io.wait_for_connections(WAIT));
    assert!(io.send_connection_test(0));

    let (header, payload) = node.read_frame().unwrap().unwrap();
    assert_eq!(header.kind, FrameKind::ConnectionTest);
    assert!(payload.is_empty());

    // Probes from the node are swallowed
    node.send_connection_test().unwrap();
    close_streams(&mut node, 0..1);
    assert!(io.wait_for_completion(WAIT));
    assert!(!io.send_connection_test(0));
    io.finish().unwrap();
}

#[test]
fn test_mark_connected_node_down() {
    init_tracing();
    let (mut io, failures) = start_step(4, 1, false, LocalIo::default(), loopback_config());

    let mut nodes: Vec<_> = (0..4).map(|id| connect_node(&io, id, 1)).collect();
    assert!(io.wait_for_connections(WAIT));

    io.mark_nodes_down(&[2]);
    assert!(nodes[2].read_until_closed().unwrap().is_empty());

    for (id, node) in nodes.iter_mut().enumerate() {
        if id != 2 {
            let task = u16::try_from(id).unwrap();
            close_streams(node, task..task + 1);
        }
    }
    assert!(io.wait_for_completion(WAIT));
    io.finish().unwrap();

    let stats = io.stats();
    assert_eq!((stats.connected, stats.down, stats.finished), (4, 1, 4));
    assert!(failures.entries().is_empty());
}

#[test]
fn test_abort_closes_every_connection() {
    init_tracing();
    let (mut io, failures) = start_step(3, 1, false, LocalIo::default(), loopback_config());

    let mut nodes: Vec<_> = (0..2).map(|id| connect_node(&io, id, 1)).collect();
    io.abort();

    for node in &mut nodes {
        let _ = node.read_until_closed();
    }
    assert!(io.wait_for_completion(WAIT));
    io.finish().unwrap();
    assert!(failures.entries().is_empty());
}
