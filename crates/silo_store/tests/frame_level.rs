//! Frame-level behavior: malformed requests, the connection cap, the idle
//! reaper, compressed frames, and the info protocol.

mod common;

use std::sync::atomic::Ordering;

use common::{digest, read_request, reply_bin, start_node, test_config, TestClient};
use silo_proto::frame::{write_frame_header, PROTO_HEADER_SIZE, PROTO_SIZE_MAX};
use silo_proto::{FrameType, Particle, ResultCode};
use silo_store::namespace::Record;
use silo_proto::Bin;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversize_frame_closes_connection() {
    let (handle, _fabric, _scripts) = start_node(test_config()).await;

    let mut client = TestClient::connect(&handle).await;
    client
        .send_raw_header(2, FrameType::Data as u8, PROTO_SIZE_MAX + 1)
        .await;

    // No reply frame; the server closes the connection and counts the
    // failure.
    assert!(client.expect_eof().await);
    common::wait_for(|| {
        handle.state.stats.demarshal_error.load(Ordering::Relaxed) == 1
    })
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_version_closes_connection() {
    let (handle, _fabric, _scripts) = start_node(test_config()).await;

    let mut client = TestClient::connect(&handle).await;
    client.send_raw_header(9, FrameType::Data as u8, 64).await;
    assert!(client.expect_eof().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn partial_frame_reassembled_across_writes() {
    let (handle, _fabric, _scripts) = start_node(test_config()).await;
    let keyd = digest(1);
    let ns = handle.state.namespace_by_name(b"test").unwrap();
    ns.store.put(
        &keyd,
        &Record {
            generation: 1,
            bins: vec![Bin::new("a", Particle::Integer(42))],
            ..Default::default()
        },
    );

    let frame = read_request("test", keyd);
    let mut client = TestClient::connect(&handle).await;

    // Dribble the frame: split header, then split body.
    client.send(&frame[..3]).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    client.send(&frame[3..PROTO_HEADER_SIZE + 5]).await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    client.send(&frame[PROTO_HEADER_SIZE + 5..]).await;

    let msg = client.read_msg().await;
    assert_eq!(msg.header.result_code, ResultCode::Ok as u8);
    assert_eq!(reply_bin(&msg, "a"), Some(Particle::Integer(42)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_frames_in_one_write() {
    let (handle, _fabric, _scripts) = start_node(test_config()).await;
    let ns = handle.state.namespace_by_name(b"test").unwrap();
    for i in 1..=2u8 {
        ns.store.put(
            &digest(i),
            &Record {
                generation: 1,
                bins: vec![Bin::new("a", Particle::Integer(i as i64))],
                ..Default::default()
            },
        );
    }

    // Both frames land in the reader's buffer; the second is consumed after
    // the first transaction resumes reads.
    let mut combined = read_request("test", digest(1)).to_vec();
    combined.extend_from_slice(&read_request("test", digest(2)));

    let mut client = TestClient::connect(&handle).await;
    client.send(&combined).await;

    let first = client.read_msg().await;
    assert_eq!(reply_bin(&first, "a"), Some(Particle::Integer(1)));
    let second = client.read_msg().await;
    assert_eq!(reply_bin(&second, "a"), Some(Particle::Integer(2)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn compressed_frame_round_trip() {
    let (handle, _fabric, _scripts) = start_node(test_config()).await;
    let keyd = digest(3);
    let ns = handle.state.namespace_by_name(b"test").unwrap();
    ns.store.put(
        &keyd,
        &Record {
            generation: 1,
            bins: vec![Bin::new("a", Particle::Integer(7))],
            ..Default::default()
        },
    );

    // Wrap a whole data frame in a compressed envelope.
    let inner = read_request("test", keyd);
    let compressed = zstd::stream::encode_all(&inner[..], 0).unwrap();
    let mut body = (inner.len() as u64).to_be_bytes().to_vec();
    body.extend_from_slice(&compressed);

    let mut frame = vec![0u8; PROTO_HEADER_SIZE];
    write_frame_header(&mut frame, FrameType::DataCompressed, body.len() as u64);
    frame.extend_from_slice(&body);

    let mut client = TestClient::connect(&handle).await;
    client.send(&frame).await;

    let msg = client.read_msg().await;
    assert_eq!(msg.header.result_code, ResultCode::Ok as u8);
    assert_eq!(reply_bin(&msg, "a"), Some(Particle::Integer(7)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn connection_cap_drops_excess_accepts() {
    let mut cfg = test_config();
    cfg.proto_fd_max = 1;
    let (handle, _fabric, _scripts) = start_node(cfg).await;

    let mut a = TestClient::connect(&handle).await;
    let mut b = TestClient::connect(&handle).await;
    // Exercise both so they are fully established server-side.
    a.send(&read_request("test", digest(1))).await;
    a.read_msg().await;
    b.send(&read_request("test", digest(1))).await;
    b.read_msg().await;

    common::wait_for(|| handle.state.stats.open_connections() >= 2).await;

    let mut c = TestClient::connect(&handle).await;
    assert!(c.expect_eof().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_connection_reaped() {
    let mut cfg = test_config();
    cfg.proto_fd_idle_ms = 1_000;
    let (handle, _fabric, _scripts) = start_node(cfg).await;

    let mut client = TestClient::connect(&handle).await;
    // Establish server-side state with one round trip, then go idle.
    client.send(&read_request("test", digest(1))).await;
    client.read_msg().await;

    // The reaper runs once per second; within a few seconds the idle
    // connection is shut down and the peer sees EOF.
    assert!(client.expect_eof().await);
    assert!(handle.state.stats.reaper_count.load(Ordering::Relaxed) >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn info_commands_answer_lines() {
    let (handle, _fabric, _scripts) = start_node(test_config()).await;

    let text = b"status;build;namespaces;rw-hash";
    let mut frame = vec![0u8; PROTO_HEADER_SIZE];
    write_frame_header(&mut frame, FrameType::Info, text.len() as u64);
    frame.extend_from_slice(text);

    let mut client = TestClient::connect(&handle).await;
    client.send(&frame).await;

    let (header, body) = client.read_frame().await;
    assert_eq!(header.frame_type, FrameType::Info);
    let text = String::from_utf8(body.to_vec()).unwrap();

    let mut lines = std::collections::HashMap::new();
    for line in text.lines() {
        let (k, v) = line.split_once('\t').unwrap();
        lines.insert(k.to_string(), v.to_string());
    }
    assert_eq!(lines["status"], "ok");
    assert_eq!(lines["namespaces"], "test");
    assert_eq!(lines["rw-hash"], "0");
    assert!(!lines["build"].is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_thread_resize_via_info() {
    let (handle, _fabric, _scripts) = start_node(test_config()).await;
    assert_eq!(handle.state.batch.thread_count(), 4);

    for (cmd, expect_threads) in [
        ("batch-index-threads=6", 6usize),
        ("batch-index-threads=2", 2),
    ] {
        let mut frame = vec![0u8; PROTO_HEADER_SIZE];
        write_frame_header(&mut frame, FrameType::Info, cmd.len() as u64);
        frame.extend_from_slice(cmd.as_bytes());

        let mut client = TestClient::connect(&handle).await;
        client.send(&frame).await;
        let (_, body) = client.read_frame().await;
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("ok"), "resize reply: {text}");
        assert_eq!(handle.state.batch.thread_count(), expect_threads);
    }

    // The shrunken pool still serves batches.
    let ns = handle.state.namespace_by_name(b"test").unwrap();
    ns.store.put(
        &digest(9),
        &Record {
            generation: 1,
            bins: vec![Bin::new("a", Particle::Integer(9))],
            ..Default::default()
        },
    );
    let mut client = TestClient::connect(&handle).await;
    client
        .send(&common::batch_request("test", &[(0, digest(9))], None))
        .await;
    let row = client.read_msg().await;
    assert_eq!(row.header.result_code, ResultCode::Ok as u8);
    let trailer = client.read_msg().await;
    assert_ne!(trailer.header.info3 & silo_proto::msg::INFO3_LAST, 0);
}
