//! UDF pipeline over the wire: master apply, classification, replication
//! pickles, cross-DC events, and the respond-on-master-complete path.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::{digest, read_request, reply_bin, start_node, start_node_with_xdr, test_config,
    udf_request, write_request, TestClient};
use silo_proto::{Bin, Particle, ResultCode};
use silo_store::inflight::HashKey;
use silo_store::namespace::Record;
use silo_store::replica::CaptureXdrSink;
use silo_store::script::ScriptOutcome;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn udf_read_only_returns_value() {
    let (handle, _fabric, scripts) = start_node(test_config()).await;
    let keyd = digest(1);
    let ns = handle.state.namespace_by_name(b"test").unwrap();
    ns.store.put(
        &keyd,
        &Record {
            generation: 3,
            bins: vec![Bin::new("c", Particle::Integer(10))],
            ..Default::default()
        },
    );

    scripts.register("kv", "peek", |rec, _args, _t| {
        let v = match rec.bin("c") {
            Some(Particle::Integer(v)) => *v,
            _ => -1,
        };
        Ok(ScriptOutcome::ok(Particle::Integer(v)))
    });

    let mut client = TestClient::connect(&handle).await;
    client.send(&udf_request("test", keyd, "kv", "peek", b"")).await;

    let msg = client.read_msg().await;
    assert_eq!(msg.header.result_code, ResultCode::Ok as u8);
    assert_eq!(reply_bin(&msg, "SUCCESS"), Some(Particle::Integer(10)));

    // Read-only apply: no replica traffic, record untouched.
    assert_eq!(ns.store.get(&keyd).unwrap().generation, 3);
    let stats = &ns.stats;
    assert_eq!(stats.udf_read_reqs.load(Ordering::Relaxed), 1);
    assert_eq!(stats.udf_read_success.load(Ordering::Relaxed), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn udf_write_updates_and_pickles() {
    let (handle, fabric, scripts) = start_node(test_config()).await;
    let keyd = digest(2);
    let ns = handle.state.namespace_by_name(b"test").unwrap();
    ns.store.put(
        &keyd,
        &Record {
            generation: 1,
            bins: vec![Bin::new("c", Particle::Integer(10))],
            ..Default::default()
        },
    );

    // One replica peer so the repl-write phase runs.
    ns.set_replicas(keyd.partition_id(), vec![2]);

    scripts.register("kv", "incr", |rec, _args, _t| {
        let v = match rec.bin("c") {
            Some(Particle::Integer(v)) => *v,
            _ => 0,
        };
        rec.set_bin("c", Particle::Integer(v + 1));
        Ok(ScriptOutcome::ok(Particle::Integer(v + 1)))
    });

    let mut client = TestClient::connect(&handle).await;
    client.send(&udf_request("test", keyd, "kv", "incr", b"")).await;

    let msg = client.read_msg().await;
    assert_eq!(msg.header.result_code, ResultCode::Ok as u8);
    assert_eq!(reply_bin(&msg, "SUCCESS"), Some(Particle::Integer(11)));

    let rec = ns.store.get(&keyd).unwrap();
    assert_eq!(rec.generation, 2);
    assert_eq!(rec.bin(b"c"), Some(&Bin::new("c", Particle::Integer(11))));

    // The replica received a pickle of the written record.
    {
        let sent = fabric.repl_writes_sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (dest, req) = &sent[0];
        assert_eq!(dest, &vec![2u64]);
        assert!(!req.is_delete);
        let pickled = silo_proto::pickle::unpickle(req.pickle.as_ref().unwrap()).unwrap();
        assert_eq!(pickled.generation, 2);
        assert_eq!(pickled.bins[0].value, Particle::Integer(11));
    }

    // The in-flight record fully drained.
    common::wait_for(|| handle.state.inflight.is_empty()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn udf_writes_twice_then_removes_is_a_delete() {
    let mut cfg = test_config();
    cfg.namespaces[0].xdr_enabled = true;
    let xdr = Arc::new(CaptureXdrSink::default());
    let (handle, fabric, scripts) =
        start_node_with_xdr(cfg, Arc::clone(&xdr) as Arc<dyn silo_store::replica::XdrSink>).await;

    let keyd = digest(3);
    let ns = handle.state.namespace_by_name(b"test").unwrap();
    ns.store.put(
        &keyd,
        &Record {
            generation: 1,
            bins: vec![Bin::new("c", Particle::Integer(10))],
            ..Default::default()
        },
    );
    ns.set_replicas(keyd.partition_id(), vec![7]);

    scripts.register("kv", "incr_twice_remove", |rec, _args, _t| {
        for _ in 0..2 {
            let v = match rec.bin("c") {
                Some(Particle::Integer(v)) => *v,
                _ => 0,
            };
            rec.set_bin("c", Particle::Integer(v + 1));
        }
        rec.remove();
        Ok(ScriptOutcome::ok(Particle::Null))
    });

    let mut client = TestClient::connect(&handle).await;
    client
        .send(&udf_request("test", keyd, "kv", "incr_twice_remove", b""))
        .await;

    let msg = client.read_msg().await;
    assert_eq!(msg.header.result_code, ResultCode::Ok as u8);

    // Classified as a delete: record gone, replica pickle is a delete, and
    // the cross-DC event has the delete flag.
    assert!(ns.store.get(&keyd).is_none());

    let sent = fabric.repl_writes_sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.is_delete);
    assert!(sent[0].1.pickle.is_none());

    let events = xdr.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_delete);

    assert_eq!(ns.stats.udf_delete_reqs.load(Ordering::Relaxed), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn udf_zero_bins_left_promotes_to_delete() {
    let (handle, _fabric, scripts) = start_node(test_config()).await;
    let keyd = digest(4);
    let ns = handle.state.namespace_by_name(b"test").unwrap();
    ns.store.put(
        &keyd,
        &Record {
            generation: 1,
            bins: vec![Bin::new("only", Particle::Integer(1))],
            ..Default::default()
        },
    );

    scripts.register("kv", "strip", |rec, _args, _t| {
        rec.remove_bin("only");
        Ok(ScriptOutcome::ok(Particle::Null))
    });

    let mut client = TestClient::connect(&handle).await;
    client.send(&udf_request("test", keyd, "kv", "strip", b"")).await;
    let msg = client.read_msg().await;
    assert_eq!(msg.header.result_code, ResultCode::Ok as u8);

    assert!(ns.store.get(&keyd).is_none());
    assert_eq!(ns.stats.deleted_last_bin.load(Ordering::Relaxed), 1);
    assert_eq!(ns.stats.udf_delete_reqs.load(Ordering::Relaxed), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn udf_script_failure_reports_failure_bin() {
    let (handle, _fabric, scripts) = start_node(test_config()).await;
    let keyd = digest(5);

    scripts.register("kv", "boom", |_rec, _args, _t| {
        Ok(ScriptOutcome::fail("assert failed"))
    });

    let mut client = TestClient::connect(&handle).await;
    client.send(&udf_request("test", keyd, "kv", "boom", b"")).await;

    let msg = client.read_msg().await;
    assert_eq!(msg.header.result_code, ResultCode::UdfExecution as u8);
    assert_eq!(
        reply_bin(&msg, "FAILURE"),
        Some(Particle::String("assert failed".into()))
    );

    let ns = handle.state.namespace_by_name(b"test").unwrap();
    assert_eq!(ns.stats.lang_error.load(Ordering::Relaxed), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn udf_missing_function_is_execution_error() {
    let (handle, _fabric, _scripts) = start_node(test_config()).await;

    let mut client = TestClient::connect(&handle).await;
    client
        .send(&udf_request("test", digest(6), "no", "such", b""))
        .await;

    let msg = client.read_msg().await;
    assert_eq!(msg.header.result_code, ResultCode::UdfExecution as u8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_respond_on_master_completion() {
    let mut cfg = test_config();
    cfg.respond_client_on_master_completion = true;
    let (handle, fabric, _scripts) = start_node(cfg).await;

    let keyd = digest(7);
    let ns = handle.state.namespace_by_name(b"test").unwrap();
    ns.set_replicas(keyd.partition_id(), vec![2]);

    // Withhold replica acks; the client must still get its reply.
    fabric.set_manual_ack(true);

    let mut client = TestClient::connect(&handle).await;
    client
        .send(&write_request(
            "test",
            keyd,
            &[("x", Particle::String("hi".into()))],
        ))
        .await;

    let msg = client.read_msg().await;
    assert_eq!(msg.header.result_code, ResultCode::Ok as u8);

    // The replica write went out but is still unacked.
    common::wait_for(|| fabric.repl_writes_sent.lock().unwrap().len() == 1).await;
    assert_eq!(handle.state.inflight.len(), 1);

    // Deliver the ack; the record drains without a second response.
    let hkey = HashKey {
        ns_id: ns.id,
        keyd,
    };
    silo_store::inflight::on_repl_write_ack(&handle.state, hkey, 2).await;
    assert!(handle.state.inflight.is_empty());

    // The connection is resumed and serves the next request; no stray
    // second reply precedes it.
    client.send(&read_request("test", keyd)).await;
    let msg = client.read_msg().await;
    assert_eq!(msg.header.result_code, ResultCode::Ok as u8);
    assert_eq!(reply_bin(&msg, "x"), Some(Particle::String("hi".into())));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unacked_replica_write_times_out() {
    let mut cfg = test_config();
    cfg.transaction_max_ms = 300;
    let (handle, fabric, _scripts) = start_node(cfg).await;

    let keyd = digest(8);
    let ns = handle.state.namespace_by_name(b"test").unwrap();
    ns.set_replicas(keyd.partition_id(), vec![2]);
    fabric.set_manual_ack(true);

    let mut client = TestClient::connect(&handle).await;
    client
        .send(&write_request("test", keyd, &[("x", Particle::Integer(1))]))
        .await;

    // No ack arrives; the sweeper fires the timeout, which force-closes the
    // client connection rather than leaving it waiting on stale state.
    assert!(client.expect_eof().await);
    common::wait_for(|| handle.state.inflight.is_empty()).await;
    assert_eq!(ns.stats.client_tsvc_timeout.load(Ordering::Relaxed), 1);

    // A late ack is quietly ignored.
    let hkey = HashKey {
        ns_id: ns.id,
        keyd,
    };
    silo_store::inflight::on_repl_write_ack(&handle.state, hkey, 2).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overloaded_storage_sheds_udfs() {
    let (handle, _fabric, scripts) = start_node(test_config()).await;
    let ns = handle.state.namespace_by_name(b"test").unwrap();
    ns.store.set_overloaded(true);

    scripts.register("kv", "noop", |_rec, _args, _t| {
        Ok(ScriptOutcome::ok(Particle::Null))
    });

    let mut client = TestClient::connect(&handle).await;
    client
        .send(&udf_request("test", digest(30), "kv", "noop", b""))
        .await;

    let msg = client.read_msg().await;
    assert_eq!(msg.header.result_code, ResultCode::DeviceOverload as u8);

    // Lifting the backpressure lets the next request through.
    ns.store.set_overloaded(false);
    client
        .send(&udf_request("test", digest(30), "kv", "noop", b""))
        .await;
    let msg = client.read_msg().await;
    assert_eq!(msg.header.result_code, ResultCode::Ok as u8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn internal_udf_completes_via_callback() {
    let (handle, _fabric, scripts) = start_node(test_config()).await;
    let keyd = digest(20);
    let ns = handle.state.namespace_by_name(b"test").unwrap();
    ns.store.put(
        &keyd,
        &Record {
            generation: 1,
            bins: vec![Bin::new("c", Particle::Integer(1))],
            ..Default::default()
        },
    );

    scripts.register("job", "bump", |rec, _args, _t| {
        rec.set_bin("c", Particle::Integer(2));
        Ok(ScriptOutcome::ok(Particle::Null))
    });

    let (tx, rx) = std::sync::mpsc::channel();
    let orig = Arc::new(silo_store::transaction::IudfOrigin::new(
        silo_store::script::ScriptDef {
            module: "job".into(),
            function: "bump".into(),
            ..Default::default()
        },
        move |rc| {
            let _ = tx.send(rc);
        },
    ));

    let tr = silo_store::transaction::create_internal_udf("test", keyd, orig).unwrap();
    silo_store::tsvc::process_transaction(&handle.state, tr).await;

    // The job callback fires exactly once with the final code.
    let rc = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
    assert_eq!(rc, ResultCode::Ok);
    assert_eq!(
        ns.store.get(&keyd).unwrap().bin(b"c"),
        Some(&Bin::new("c", Particle::Integer(2)))
    );
    assert_eq!(ns.stats.udf_sub_udf_complete.load(Ordering::Relaxed), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn internal_udf_must_not_create_records() {
    let (handle, _fabric, _scripts) = start_node(test_config()).await;
    let keyd = digest(21);

    let (tx, rx) = std::sync::mpsc::channel();
    let orig = Arc::new(silo_store::transaction::IudfOrigin::new(
        silo_store::script::ScriptDef {
            module: "job".into(),
            function: "bump".into(),
            ..Default::default()
        },
        move |rc| {
            let _ = tx.send(rc);
        },
    ));

    let tr = silo_store::transaction::create_internal_udf("test", keyd, orig).unwrap();
    silo_store::tsvc::process_transaction(&handle.state, tr).await;

    let rc = rx.recv_timeout(std::time::Duration::from_secs(2)).unwrap();
    assert_eq!(rc, ResultCode::NotFound);
    let ns = handle.state.namespace_by_name(b"test").unwrap();
    assert!(ns.store.get(&keyd).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_resolution_runs_before_master() {
    let (handle, fabric, scripts) = start_node(test_config()).await;
    let keyd = digest(9);
    let ns = handle.state.namespace_by_name(b"test").unwrap();

    // A duplicate-holding peer forces the dup-res phase; the loopback
    // fabric acks it, after which master apply proceeds.
    ns.set_duplicates(keyd.partition_id(), vec![5]);

    scripts.register("kv", "touch", |rec, _args, _t| {
        rec.set_bin("t", Particle::Integer(1));
        Ok(ScriptOutcome::ok(Particle::Integer(1)))
    });

    let mut client = TestClient::connect(&handle).await;
    client.send(&udf_request("test", keyd, "kv", "touch", b"")).await;

    let msg = client.read_msg().await;
    assert_eq!(msg.header.result_code, ResultCode::Ok as u8);

    assert_eq!(fabric.dup_res_sent.lock().unwrap().len(), 1);
    assert!(ns.store.get(&keyd).is_some());
    common::wait_for(|| handle.state.inflight.is_empty()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dup_res_skipped_when_disabled() {
    let mut cfg = test_config();
    cfg.write_duplicate_resolution_disable = true;
    let (handle, fabric, scripts) = start_node(cfg).await;

    let keyd = digest(10);
    let ns = handle.state.namespace_by_name(b"test").unwrap();
    ns.set_duplicates(keyd.partition_id(), vec![5]);

    scripts.register("kv", "touch", |rec, _args, _t| {
        rec.set_bin("t", Particle::Integer(1));
        Ok(ScriptOutcome::ok(Particle::Integer(1)))
    });

    let mut client = TestClient::connect(&handle).await;
    client.send(&udf_request("test", keyd, "kv", "touch", b"")).await;

    let msg = client.read_msg().await;
    assert_eq!(msg.header.result_code, ResultCode::Ok as u8);
    assert!(fabric.dup_res_sent.lock().unwrap().is_empty());
}
