//! Batch read pipeline over the wire: row fan-out, shared response blocks,
//! per-row indices, the LAST trailer, and the error taxonomy.

mod common;

use std::collections::HashMap;

use common::{batch_request, digest, start_node, test_config, TestClient};
use silo_proto::msg::INFO3_LAST;
use silo_proto::{Bin, ParsedMsg, Particle, ResultCode};
use silo_store::namespace::Record;

fn seed(ns: &silo_store::namespace::Namespace, last: u8, value: i64) {
    ns.store.put(
        &digest(last),
        &Record {
            generation: 1,
            bins: vec![Bin::new("a", Particle::Integer(value))],
            ..Default::default()
        },
    );
}

/// Collect sub-replies until the trailer; returns rows by batch index.
async fn collect_batch(client: &mut TestClient) -> (HashMap<u32, ParsedMsg>, ParsedMsg) {
    let mut rows = HashMap::new();
    loop {
        let msg = client.read_msg().await;
        if msg.header.info3 & INFO3_LAST != 0 {
            return (rows, msg);
        }
        // Sub-replies carry the row index in the transaction-ttl slot.
        rows.insert(msg.header.transaction_ttl, msg);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn four_reads_one_missing() {
    let (handle, _fabric, _scripts) = start_node(test_config()).await;
    let ns = handle.state.namespace_by_name(b"test").unwrap();
    seed(&ns, 0x10, 1);
    // 0x11 missing.
    seed(&ns, 0x12, 2);
    seed(&ns, 0x13, 3);

    let rows = [
        (0u32, digest(0x10)),
        (1, digest(0x11)),
        (2, digest(0x12)),
        (3, digest(0x13)),
    ];

    let mut client = TestClient::connect(&handle).await;
    client.send(&batch_request("test", &rows, None)).await;

    let (replies, trailer) = collect_batch(&mut client).await;

    assert_eq!(replies.len(), 4);
    for (index, expect) in [(0u32, Some(1i64)), (1, None), (2, Some(2)), (3, Some(3))] {
        let msg = replies.get(&index).expect("missing batch row");
        match expect {
            Some(v) => {
                assert_eq!(msg.header.result_code, ResultCode::Ok as u8);
                assert_eq!(common::reply_bin(msg, "a"), Some(Particle::Integer(v)));
                // Result rows carry the row digest.
                assert!(msg.digest().is_some());
            }
            None => {
                assert_eq!(msg.header.result_code, ResultCode::NotFound as u8);
                assert_eq!(msg.header.n_ops, 0);
            }
        }
    }

    assert_ne!(trailer.header.info3 & INFO3_LAST, 0);
    assert_eq!(trailer.header.result_code, ResultCode::Ok as u8);

    // The shared state drained: exactly one completed batch.
    let stats = &handle.state.stats;
    assert_eq!(
        stats
            .batch_index_complete
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );

    // The connection survives for the next request.
    client.send(&batch_request("test", &rows[..1], None)).await;
    let (replies, trailer) = collect_batch(&mut client).await;
    assert_eq!(replies.len(), 1);
    assert_eq!(trailer.header.result_code, ResultCode::Ok as u8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn large_batch_spans_buffers() {
    let (handle, _fabric, _scripts) = start_node(test_config()).await;
    let ns = handle.state.namespace_by_name(b"test").unwrap();

    // Fat rows so the 128 KiB blocks roll over.
    for i in 0..200u8 {
        ns.store.put(
            &digest(i),
            &Record {
                generation: 1,
                bins: vec![Bin::new("blob", Particle::Blob(vec![i; 4096]))],
                ..Default::default()
            },
        );
    }

    let rows: Vec<(u32, silo_proto::Digest)> =
        (0..200u32).map(|i| (i, digest(i as u8))).collect();

    let mut client = TestClient::connect(&handle).await;
    client.send(&batch_request("test", &rows, None)).await;

    let (replies, trailer) = collect_batch(&mut client).await;
    assert_eq!(replies.len(), 200);
    assert_eq!(trailer.header.result_code, ResultCode::Ok as u8);
    for (index, msg) in &replies {
        assert_eq!(msg.header.result_code, ResultCode::Ok as u8, "row {index}");
    }

    // Block rollover produced more than one response buffer.
    let created = handle
        .state
        .stats
        .batch_index_created_buffers
        .load(std::sync::atomic::Ordering::Relaxed);
    assert!(created > 1, "expected multiple blocks, created {created}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn zero_rows_is_parameter_error() {
    let (handle, _fabric, _scripts) = start_node(test_config()).await;

    let mut client = TestClient::connect(&handle).await;
    client.send(&batch_request("test", &[], None)).await;

    let msg = client.read_msg().await;
    assert_ne!(msg.header.info3 & INFO3_LAST, 0);
    assert_eq!(msg.header.result_code, ResultCode::Parameter as u8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn over_max_requests_rejected() {
    let mut cfg = test_config();
    cfg.batch_max_requests = 3;
    let (handle, _fabric, _scripts) = start_node(cfg).await;

    let rows: Vec<(u32, silo_proto::Digest)> = (0..4u32).map(|i| (i, digest(i as u8))).collect();

    let mut client = TestClient::connect(&handle).await;
    client.send(&batch_request("test", &rows, None)).await;

    let msg = client.read_msg().await;
    assert_eq!(msg.header.result_code, ResultCode::BatchMaxRequests as u8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn short_batch_flushes_with_phantoms() {
    let (handle, _fabric, _scripts) = start_node(test_config()).await;
    let ns = handle.state.namespace_by_name(b"test").unwrap();
    seed(&ns, 1, 7);

    // Declare three rows but ship only one; phantom accounting must still
    // flush the batch exactly once, as an error.
    let rows = [(0u32, digest(1))];
    let mut client = TestClient::connect(&handle).await;
    client.send(&batch_request("test", &rows, Some(3))).await;

    let (replies, trailer) = collect_batch(&mut client).await;
    assert!(replies.len() <= 1);
    assert_ne!(trailer.header.info3 & INFO3_LAST, 0);
    assert_eq!(trailer.header.result_code, ResultCode::Parameter as u8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_disabled_when_no_workers() {
    let mut cfg = test_config();
    cfg.batch_index_threads = 0;
    let (handle, _fabric, _scripts) = start_node(cfg).await;

    let rows = [(0u32, digest(1))];
    let mut client = TestClient::connect(&handle).await;
    client.send(&batch_request("test", &rows, None)).await;

    let msg = client.read_msg().await;
    assert_eq!(msg.header.result_code, ResultCode::BatchDisabled as u8);
}
