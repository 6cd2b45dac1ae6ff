//! The UDF transaction pipeline.
//!
//! An asynchronous state machine: start -> (dup-res) -> master-apply ->
//! (repl-write) -> respond. Phase transitions ride on peer acks delivered
//! through the in-flight table; the recyclable in-hash record carries the
//! transaction between phases without reallocation.
//!
//! With respond-on-master-complete configured, the client response goes out
//! as soon as master apply succeeds; taking the record's origin at that point
//! is what stops the replica-write completion from responding again.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use silo_proto::msg::INFO3_COMMIT_MASTER;
use silo_proto::reply::make_reply;
use silo_proto::{Bin, Particle, ResultCode};

use crate::config::WriteCommitLevel;
use crate::fault::Context;
use crate::inflight::{HashKey, RwRecord, RwStage, RwTimeoutTag, RwWaitTag};
use crate::namespace::Record;
use crate::replica::{DupResRequest, ReplWriteRequest, XdrEvent};
use crate::script::{ScriptDef, ScriptError, ScriptOutcome, ScriptRecord, TimeTracker};
use crate::stats::{now_ms, now_secs};
use crate::transaction::{Origin, TransStatus, Transaction};
use crate::NodeState;

/// Operation the script turned out to perform, classified after apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpClass {
    Read,
    Write,
    Delete,
    None,
}

/// Should the client be released at master completion for this transaction?
pub(crate) fn respond_on_master_complete(state: &NodeState, tr: &Transaction) -> bool {
    if state.cfg.respond_client_on_master_completion {
        return true;
    }
    if tr.msg.header.info3 & INFO3_COMMIT_MASTER != 0 {
        return true;
    }
    tr.ns()
        .map(|ns| ns.cfg.write_commit_level_override == WriteCommitLevel::Master)
        .unwrap_or(false)
}

/// Entry point: run a UDF transaction. Consumes the transaction; the
/// in-flight record owns everything from here.
pub async fn start(state: &Arc<NodeState>, mut tr: Transaction) -> TransStatus {
    let ns = Arc::clone(tr.ns().expect("udf transaction without reservation"));

    // Apply the cross-DC filter before anything else.
    if tr.msg.is_xdr() && ns.cfg.forbid_xdr_writes {
        tr.result_code = ResultCode::Forbidden;
        crate::transaction::send_error(state, &mut tr, ResultCode::Forbidden).await;
        return TransStatus::DoneError;
    }

    // Unknown whether the UDF reads or writes - shed if storage is backed up.
    if ns.store.overloaded() {
        tr.result_code = ResultCode::DeviceOverload;
        crate::transaction::send_error(state, &mut tr, ResultCode::DeviceOverload).await;
        return TransStatus::DoneError;
    }

    let def = match &tr.origin {
        Some(Origin::InternalUdf(orig)) => Some(orig.def.clone()),
        _ => ScriptDef::from_msg(&tr.msg),
    };
    let Some(def) = def else {
        tracing::warn!(target: "udf", "failed script def init from message");
        crate::transaction::send_error(state, &mut tr, ResultCode::Parameter).await;
        return TransStatus::DoneError;
    };

    let respond_on_master = respond_on_master_complete(state, &tr);
    let hkey = HashKey {
        ns_id: ns.id,
        keyd: tr.keyd,
    };

    // The in-hash record takes ownership of the message, reservation and
    // origin; everything from here works through it.
    let rw = RwRecord::new(
        hkey,
        tr.rsv.take().unwrap(),
        tr.msg.clone(),
        tr.origin.take().unwrap(),
        tr.start_time,
        tr.end_time,
        respond_on_master,
        RwTimeoutTag::Udf,
        Some(def),
    );

    let status = state.inflight.insert(Arc::clone(&rw));
    if status != TransStatus::InProgress {
        // A prior transaction on this key is active; reject rather than
        // chain. Reclaim the origin to deliver the error.
        let origin = rw.take_origin();
        let trid = rw.trid();
        respond_busy(state, origin, trid).await;
        return TransStatus::Waiting;
    }

    let mut duplicates = rw.rsv.duplicates.clone();
    if state.cfg.write_duplicate_resolution_disable {
        duplicates.clear();
    }

    if !duplicates.is_empty() {
        start_dup_res(state, &rw, duplicates).await;
        return TransStatus::InProgress;
    }

    master_and_continue(state, &rw).await
}

async fn respond_busy(state: &Arc<NodeState>, origin: Option<Origin>, trid: u64) {
    match origin {
        Some(Origin::Client(conn)) => {
            let reply = silo_proto::reply::make_error_reply(ResultCode::KeyBusy, trid);
            crate::transaction::send_client_reply(state, &conn, reply).await;
        }
        Some(Origin::Proxy { node, tid }) => {
            let reply = silo_proto::reply::make_error_reply(ResultCode::KeyBusy, trid);
            state.fabric.send_proxy_response(node, tid, reply).await;
        }
        Some(Origin::BatchSub { shared, index }) => {
            crate::batch::add_error(state, &shared, index, ResultCode::KeyBusy).await;
        }
        Some(Origin::InternalUdf(orig)) => orig.complete(ResultCode::KeyBusy),
        Some(Origin::InternalNsup) | None => {}
    }
}

async fn start_dup_res(state: &Arc<NodeState>, rw: &Arc<RwRecord>, duplicates: Vec<u64>) {
    {
        let mut inner = rw.inner.lock().unwrap();
        inner.stage = RwStage::AwaitingDupRes;
        inner.wait_tag = RwWaitTag::UdfDupRes;
        inner.pending = duplicates.clone();
    }
    state
        .fabric
        .send_dup_res(
            &duplicates,
            DupResRequest {
                hkey: rw.hkey,
                origin_node: state.cfg.node_id,
            },
        )
        .await;
}

/// Dup-res acks drained; duplicates resolved, apply on master. The record is
/// recycled for the replica-write phase.
pub async fn dup_res_complete(state: &Arc<NodeState>, rw: &Arc<RwRecord>) {
    {
        let mut inner = rw.inner.lock().unwrap();
        inner.benchmark_time = crate::stats::now_ns();
        inner.stage = RwStage::Initial;
    }
    master_and_continue(state, rw).await;
}

/// Replica-write acks drained; the transaction is finished.
pub async fn repl_write_complete(state: &Arc<NodeState>, rw: &Arc<RwRecord>) {
    {
        let mut inner = rw.inner.lock().unwrap();
        inner.stage = RwStage::Done;
    }
    send_response(state, rw).await;
    state.inflight.remove(rw);
}

async fn master_and_continue(state: &Arc<NodeState>, rw: &Arc<RwRecord>) -> TransStatus {
    let status = master(state, rw);

    if status != TransStatus::InProgress {
        send_response(state, rw).await;
        state.inflight.remove(rw);
        return status;
    }

    // Set up the nodes to which we'll write replicas.
    let dest = rw.rsv.replicas.clone();

    if dest.is_empty() {
        send_response(state, rw).await;
        state.inflight.remove(rw);
        return TransStatus::DoneSuccess;
    }

    start_repl_write(state, rw, dest).await;
    TransStatus::InProgress
}

async fn start_repl_write(state: &Arc<NodeState>, rw: &Arc<RwRecord>, dest: Vec<u64>) {
    if rw.respond_on_master {
        // Don't wait for replication. Taking the origin here is what keeps
        // the repl-write completion from responding again.
        send_response(state, rw).await;
    }

    let req = {
        let mut inner = rw.inner.lock().unwrap();
        inner.stage = RwStage::AwaitingReplWrite;
        inner.wait_tag = RwWaitTag::UdfReplWrite;
        inner.pending = dest.clone();
        ReplWriteRequest {
            hkey: rw.hkey,
            pickle: inner.pickle.clone(),
            is_delete: inner.is_delete,
            generation: inner.generation,
            origin_node: state.cfg.node_id,
        }
    };

    state.fabric.send_repl_write(&dest, req).await;
}

/// Master apply: open the record by digest, hand the façade to the script
/// engine, classify the result, update the index and storage, produce the
/// replication pickle and cross-DC event.
///
/// Returns `InProgress` when replica writes are needed, otherwise done.
fn master(state: &Arc<NodeState>, rw: &Arc<RwRecord>) -> TransStatus {
    let ns = &rw.ns;
    let keyd = rw.hkey.keyd;

    let Some(def) = rw.udf_def.clone() else {
        rw.inner.lock().unwrap().result_code = ResultCode::Parameter;
        return TransStatus::DoneError;
    };

    let is_internal = {
        let inner = rw.inner.lock().unwrap();
        matches!(inner.origin, Some(Origin::InternalUdf(_)))
    };

    let existing = ns.get_live(&keyd);

    if existing.is_none() && is_internal {
        // Internal UDFs must not create records.
        compose_failure(rw, ResultCode::NotFound, None);
        return TransStatus::DoneSuccess;
    }

    // Build the record façade.
    let mut srec = match &existing {
        Some(rec) => ScriptRecord {
            open: true,
            preexists: true,
            has_updates: false,
            generation: rec.generation,
            void_time: rec.void_time,
            set_name: rec.set_name.clone(),
            bins: rec.bins.clone(),
        },
        None => ScriptRecord::default(),
    };

    // If both the record and the message have keys, check them.
    let msg_key = rw.msg.key().map(|k| k.to_vec());
    let stored_key = existing.as_ref().and_then(|r| r.key.clone());
    if let (Some(stored), Some(sent)) = (&stored_key, &msg_key) {
        if stored != sent {
            compose_failure(rw, ResultCode::KeyMismatch, None);
            return TransStatus::DoneSuccess;
        }
    }

    let tracker = TimeTracker {
        end_time_ns: rw.end_time,
    };

    let apply = state.scripts.apply(&def, &mut srec, &tracker);

    let outcome = match apply {
        Ok(outcome) => outcome,
        Err(err) => {
            let (rc, text) = match err {
                ScriptError::Timeout => (ResultCode::Timeout, "script deadline exceeded".into()),
                ScriptError::NotFound => (
                    ResultCode::UdfExecution,
                    format!("function not found: {}/{}", def.module, def.function),
                ),
                ScriptError::Runtime(e) => (ResultCode::UdfExecution, e),
            };
            ns.stats.lang_error.fetch_add(1, Ordering::Relaxed);
            compose_failure(rw, rc, Some(text));
            return TransStatus::DoneSuccess;
        }
    };

    // Classify the operation the script performed.
    let zero_bins_left = srec.open && srec.bins.is_empty();
    let mut class = if srec.has_updates {
        if srec.open {
            OpClass::Write
        } else if srec.preexists {
            OpClass::Delete
        } else {
            // Created then deleted: a no-op.
            OpClass::None
        }
    } else if srec.preexists && !srec.open {
        OpClass::Delete
    } else {
        OpClass::Read
    };

    // A write that left zero bins is promoted to a delete.
    if zero_bins_left {
        if class == OpClass::Write {
            ns.stats.deleted_last_bin.fetch_add(1, Ordering::Relaxed);
        }
        class = OpClass::Delete;
    }

    if crate::fault::enabled(Context::Udf, crate::fault::Severity::Detail) {
        tracing::trace!(
            target: "udf",
            "{{{}}} applied {}/{} to {} class {:?}",
            ns.name,
            def.module,
            def.function,
            crate::fault::format_binary(&keyd.0, crate::fault::DisplayStyle::HexDigest),
            class
        );
    }

    let mut xdr_event = None;

    match class {
        OpClass::Write => {
            let generation = existing.as_ref().map(|r| r.generation).unwrap_or(0) + 1;
            let record_ttl = rw.msg.header.record_ttl;
            let void_time = if record_ttl != 0 {
                (now_secs() + u64::from(record_ttl)) as u32
            } else {
                existing.as_ref().map(|r| r.void_time).unwrap_or(0)
            };
            let set_name = rw
                .msg
                .set_name()
                .map(|s| String::from_utf8_lossy(s).into_owned())
                .or_else(|| existing.as_ref().and_then(|r| r.set_name.clone()));

            // Store a key sent with the message, keep a stored one otherwise.
            let key = msg_key.or(stored_key);

            let rec = Record {
                generation,
                void_time,
                last_update_time: now_ms(),
                set_name: set_name.clone(),
                key,
                bins: srec.bins.clone(),
            };
            ns.store.put(&keyd, &rec);

            let mut inner = rw.inner.lock().unwrap();
            inner.generation = generation;
            inner.void_time = void_time;
            inner.pickle = Some(silo_proto::pickle::pickle(&rec.to_pickled()));
            inner.is_delete = false;

            if ns.cfg.xdr_enabled {
                xdr_event = Some(XdrEvent {
                    namespace: ns.name.clone(),
                    keyd,
                    generation,
                    is_delete: false,
                    set_name,
                });
            }
        }
        OpClass::Delete => {
            let generation = existing.as_ref().map(|r| r.generation).unwrap_or(0);
            let set_name = existing.as_ref().and_then(|r| r.set_name.clone());
            ns.store.delete(&keyd);

            let mut inner = rw.inner.lock().unwrap();
            inner.pickle = None;
            inner.is_delete = true;
            inner.generation = generation;

            if ns.cfg.xdr_enabled {
                xdr_event = Some(XdrEvent {
                    namespace: ns.name.clone(),
                    keyd,
                    generation,
                    is_delete: true,
                    set_name,
                });
            }
        }
        OpClass::Read | OpClass::None => {}
    }

    // The storage record is closed above; only now emit the cross-DC event
    // so record locks were released promptly.
    if let Some(event) = xdr_event {
        state.xdr.ship(event);
    }

    update_apply_stats(ns, class, outcome.success);
    compose_outcome(rw, &def, &outcome);

    match class {
        OpClass::Write | OpClass::Delete => TransStatus::InProgress,
        OpClass::Read | OpClass::None => TransStatus::DoneSuccess,
    }
}

fn update_apply_stats(ns: &crate::namespace::Namespace, class: OpClass, success: bool) {
    match class {
        OpClass::Read => {
            ns.stats.udf_read_reqs.fetch_add(1, Ordering::Relaxed);
            if success {
                ns.stats.udf_read_success.fetch_add(1, Ordering::Relaxed);
            }
        }
        OpClass::Write => {
            ns.stats.udf_write_reqs.fetch_add(1, Ordering::Relaxed);
            if success {
                ns.stats.udf_write_success.fetch_add(1, Ordering::Relaxed);
            }
        }
        OpClass::Delete => {
            ns.stats.udf_delete_reqs.fetch_add(1, Ordering::Relaxed);
            if success {
                ns.stats.udf_delete_success.fetch_add(1, Ordering::Relaxed);
            }
        }
        OpClass::None => {}
    }
    if !success {
        ns.stats.lang_error.fetch_add(1, Ordering::Relaxed);
    }
}

/// Compose the response for a script that ran: a SUCCESS or FAILURE bin
/// carrying the script's value. Background ops get a bare reply.
fn compose_outcome(rw: &Arc<RwRecord>, def: &ScriptDef, outcome: &ScriptOutcome) {
    let mut inner = rw.inner.lock().unwrap();

    if !outcome.success {
        inner.result_code = ResultCode::UdfExecution;
    }

    if def.op_type == crate::script::ScriptOpType::Background {
        return;
    }

    let bin_name = if outcome.success { "SUCCESS" } else { "FAILURE" };
    let bins = [Bin::new(bin_name, outcome.value.clone())];
    inner.response = Some(make_reply(
        inner.result_code,
        inner.generation,
        inner.void_time,
        &bins,
        rw.trid(),
    ));
}

/// Compose a failure response with the given code and optional FAILURE text.
fn compose_failure(rw: &Arc<RwRecord>, rc: ResultCode, text: Option<String>) {
    let mut inner = rw.inner.lock().unwrap();
    inner.result_code = rc;
    let bins = text
        .map(|t| vec![Bin::new("FAILURE", Particle::String(t))])
        .unwrap_or_default();
    inner.response = Some(make_reply(rc, 0, 0, &bins, rw.trid()));
}

/// Deliver the one response for this record. Dispatches on origin; a `None`
/// origin means the timeout (or respond-on-master) already answered.
async fn send_response(state: &Arc<NodeState>, rw: &Arc<RwRecord>) {
    let origin = rw.take_origin();

    let (result_code, generation, void_time, response) = {
        let inner = rw.inner.lock().unwrap();
        (
            inner.result_code,
            inner.generation,
            inner.void_time,
            inner.response.clone(),
        )
    };

    let ns = &rw.ns;

    match origin {
        None => {
            // Lost the race with the timeout, or respond-on-master already
            // answered. Either way the response went out exactly once.
        }
        Some(Origin::Client(conn)) => {
            let reply = response
                .unwrap_or_else(|| make_reply(result_code, generation, void_time, &[], rw.trid()));
            crate::transaction::send_client_reply(state, &conn, reply).await;
            state.stats.udf_hist.insert_data_point(rw.start_time);
            match result_code {
                ResultCode::Ok => ns.stats.client_udf_complete.fetch_add(1, Ordering::Relaxed),
                ResultCode::Timeout => ns.stats.client_udf_timeout.fetch_add(1, Ordering::Relaxed),
                _ => ns.stats.client_udf_error.fetch_add(1, Ordering::Relaxed),
            };
        }
        Some(Origin::Proxy { node, tid }) => {
            let reply = response
                .unwrap_or_else(|| make_reply(result_code, generation, void_time, &[], rw.trid()));
            state.fabric.send_proxy_response(node, tid, reply).await;
        }
        Some(Origin::InternalUdf(orig)) => {
            orig.complete(result_code);
            match result_code {
                ResultCode::Ok => ns
                    .stats
                    .udf_sub_udf_complete
                    .fetch_add(1, Ordering::Relaxed),
                ResultCode::Timeout => ns
                    .stats
                    .udf_sub_udf_timeout
                    .fetch_add(1, Ordering::Relaxed),
                _ => ns.stats.udf_sub_udf_error.fetch_add(1, Ordering::Relaxed),
            };
        }
        Some(other) => {
            crate::crash!(
                Context::Rw,
                "unexpected transaction origin {} in udf response",
                other.name()
            );
        }
    }
}
