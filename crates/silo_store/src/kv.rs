//! Single-record read and write transactions.
//!
//! Reads answer from the master copy and respond inline. Writes share the
//! UDF pipeline's machinery: the in-flight record, optional duplicate
//! resolution, replica fanout, and the respond-on-master-complete
//! optimization - without a script engine in the middle.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use silo_proto::msg::{INFO1_GET_ALL, INFO2_DELETE, INFO2_GENERATION, OP_WRITE};
use silo_proto::reply::{make_error_reply, make_reply};
use silo_proto::{Bin, Particle, ResultCode};

use crate::fault::Context;
use crate::inflight::{HashKey, RwRecord, RwStage, RwTimeoutTag, RwWaitTag};
use crate::namespace::Record;
use crate::replica::{DupResRequest, ReplWriteRequest, XdrEvent};
use crate::stats::{now_ms, now_secs};
use crate::transaction::{Origin, TransStatus, Transaction};
use crate::NodeState;

/// Run a single-record read and respond to the origin.
pub async fn read(state: &Arc<NodeState>, mut tr: Transaction) -> TransStatus {
    let ns = Arc::clone(tr.ns().expect("read without reservation"));
    let rec = ns.get_live(&tr.keyd);

    let Some(rec) = rec else {
        tr.result_code = ResultCode::NotFound;
        match tr.origin.take() {
            Some(Origin::Client(conn)) => {
                let reply = make_error_reply(ResultCode::NotFound, tr.msg.trid());
                crate::transaction::send_client_reply(state, &conn, reply).await;
                state.stats.read_hist.insert_data_point(tr.start_time);
                ns.stats
                    .client_read_not_found
                    .fetch_add(1, Ordering::Relaxed);
            }
            Some(Origin::Proxy { node, tid }) => {
                let reply = make_error_reply(ResultCode::NotFound, tr.msg.trid());
                state.fabric.send_proxy_response(node, tid, reply).await;
            }
            Some(Origin::BatchSub { shared, index }) => {
                crate::batch::add_error(state, &shared, index, ResultCode::NotFound).await;
                ns.stats
                    .batch_sub_read_not_found
                    .fetch_add(1, Ordering::Relaxed);
            }
            Some(other) => {
                crate::crash!(
                    Context::Rw,
                    "unexpected transaction origin {} in read response",
                    other.name()
                );
            }
            None => {}
        }
        return TransStatus::DoneError;
    };

    // Select bins: everything on get-all or a bare read, otherwise the bins
    // the read ops name.
    let bins: Vec<Bin> =
        if tr.msg.header.info1 & INFO1_GET_ALL != 0 || tr.msg.ops.is_empty() {
            rec.bins.clone()
        } else {
            tr.msg
                .ops
                .iter()
                .filter_map(|op| rec.bin(tr.msg.op_name(op)).cloned())
                .collect()
        };

    tr.generation = rec.generation;
    tr.void_time = rec.void_time;

    match tr.origin.take() {
        Some(Origin::Client(conn)) => {
            let reply = make_reply(
                ResultCode::Ok,
                rec.generation,
                rec.void_time,
                &bins,
                tr.msg.trid(),
            );
            crate::transaction::send_client_reply(state, &conn, reply).await;
            state.stats.read_hist.insert_data_point(tr.start_time);
            ns.stats.client_read_success.fetch_add(1, Ordering::Relaxed);
        }
        Some(Origin::Proxy { node, tid }) => {
            let reply = make_reply(
                ResultCode::Ok,
                rec.generation,
                rec.void_time,
                &bins,
                tr.msg.trid(),
            );
            state.fabric.send_proxy_response(node, tid, reply).await;
        }
        Some(Origin::BatchSub { shared, index }) => {
            crate::batch::add_result(
                state,
                &shared,
                index,
                &tr.keyd,
                ResultCode::Ok,
                rec.generation,
                rec.void_time,
                rec.set_name.as_deref(),
                &bins,
            )
            .await;
            ns.stats
                .batch_sub_read_success
                .fetch_add(1, Ordering::Relaxed);
        }
        Some(other) => {
            crate::crash!(
                Context::Rw,
                "unexpected transaction origin {} in read response",
                other.name()
            );
        }
        None => {}
    }

    TransStatus::DoneSuccess
}

/// Start a single-record write (or delete). Follows the same phase structure
/// as the UDF pipeline.
pub async fn write_start(state: &Arc<NodeState>, mut tr: Transaction) -> TransStatus {
    let ns = Arc::clone(tr.ns().expect("write without reservation"));

    if tr.msg.is_xdr() && ns.cfg.forbid_xdr_writes {
        crate::transaction::send_error(state, &mut tr, ResultCode::Forbidden).await;
        return TransStatus::DoneError;
    }

    if ns.store.overloaded() {
        crate::transaction::send_error(state, &mut tr, ResultCode::DeviceOverload).await;
        return TransStatus::DoneError;
    }

    let respond_on_master = crate::udf::respond_on_master_complete(state, &tr);
    let hkey = HashKey {
        ns_id: ns.id,
        keyd: tr.keyd,
    };

    let rw = RwRecord::new(
        hkey,
        tr.rsv.take().unwrap(),
        tr.msg.clone(),
        tr.origin.take().unwrap(),
        tr.start_time,
        tr.end_time,
        respond_on_master,
        RwTimeoutTag::Write,
        None,
    );

    let status = state.inflight.insert(Arc::clone(&rw));
    if status != TransStatus::InProgress {
        // A prior transaction on this key is active; reject rather than
        // chain behind it.
        match rw.take_origin() {
            Some(Origin::Client(conn)) => {
                let reply = make_error_reply(ResultCode::KeyBusy, rw.trid());
                crate::transaction::send_client_reply(state, &conn, reply).await;
            }
            Some(Origin::Proxy { node, tid }) => {
                let reply = make_error_reply(ResultCode::KeyBusy, rw.trid());
                state.fabric.send_proxy_response(node, tid, reply).await;
            }
            _ => {}
        }
        return TransStatus::Waiting;
    }

    let mut duplicates = rw.rsv.duplicates.clone();
    if state.cfg.write_duplicate_resolution_disable {
        duplicates.clear();
    }

    if !duplicates.is_empty() {
        {
            let mut inner = rw.inner.lock().unwrap();
            inner.stage = RwStage::AwaitingDupRes;
            inner.wait_tag = RwWaitTag::WriteDupRes;
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
        return TransStatus::InProgress;
    }

    write_master_and_continue(state, &rw).await
}

/// Dup-res acks drained for a write.
pub async fn write_dup_res_complete(state: &Arc<NodeState>, rw: &Arc<RwRecord>) {
    rw.inner.lock().unwrap().stage = RwStage::Initial;
    write_master_and_continue(state, rw).await;
}

/// Replica-write acks drained for a write; finish.
pub async fn write_repl_complete(state: &Arc<NodeState>, rw: &Arc<RwRecord>) {
    rw.inner.lock().unwrap().stage = RwStage::Done;
    send_write_response(state, rw).await;
    state.inflight.remove(rw);
}

async fn write_master_and_continue(state: &Arc<NodeState>, rw: &Arc<RwRecord>) -> TransStatus {
    let status = write_master(state, rw);

    if status != TransStatus::InProgress {
        send_write_response(state, rw).await;
        state.inflight.remove(rw);
        return status;
    }

    let dest = rw.rsv.replicas.clone();
    if dest.is_empty() {
        send_write_response(state, rw).await;
        state.inflight.remove(rw);
        return TransStatus::DoneSuccess;
    }

    if rw.respond_on_master {
        // Release the client now; the replica-write completion will observe
        // the taken origin and stay silent.
        send_write_response(state, rw).await;
    }

    let req = {
        let mut inner = rw.inner.lock().unwrap();
        inner.stage = RwStage::AwaitingReplWrite;
        inner.wait_tag = RwWaitTag::WriteReplWrite;
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

    TransStatus::InProgress
}

/// Apply the write ops (or delete) to the master copy, producing the
/// replication pickle and the cross-DC event.
fn write_master(state: &Arc<NodeState>, rw: &Arc<RwRecord>) -> TransStatus {
    let ns = &rw.ns;
    let keyd = rw.hkey.keyd;
    let existing = ns.get_live(&keyd);

    // Generation predicate.
    if rw.msg.header.info2 & INFO2_GENERATION != 0 {
        let expect = rw.msg.header.generation;
        let have = existing.as_ref().map(|r| r.generation).unwrap_or(0);
        if expect != have {
            rw.inner.lock().unwrap().result_code = ResultCode::Generation;
            return TransStatus::DoneError;
        }
    }

    let is_delete = rw.msg.header.info2 & INFO2_DELETE != 0;

    if is_delete {
        if existing.is_none() {
            rw.inner.lock().unwrap().result_code = ResultCode::NotFound;
            return TransStatus::DoneError;
        }
        let generation = existing.as_ref().map(|r| r.generation).unwrap_or(0);
        let set_name = existing.as_ref().and_then(|r| r.set_name.clone());
        ns.store.delete(&keyd);

        {
            let mut inner = rw.inner.lock().unwrap();
            inner.is_delete = true;
            inner.pickle = None;
            inner.generation = generation;
        }

        if ns.cfg.xdr_enabled {
            state.xdr.ship(XdrEvent {
                namespace: ns.name.clone(),
                keyd,
                generation,
                is_delete: true,
                set_name,
            });
        }
        return TransStatus::InProgress;
    }

    // Apply write ops over the existing bins.
    let mut bins = existing.as_ref().map(|r| r.bins.clone()).unwrap_or_default();
    for op in &rw.msg.ops {
        if op.op != OP_WRITE {
            continue;
        }
        let name = String::from_utf8_lossy(rw.msg.op_name(op)).into_owned();
        let Some(value) = Particle::from_wire(op.particle_type, rw.msg.op_value(op)) else {
            rw.inner.lock().unwrap().result_code = ResultCode::Parameter;
            return TransStatus::DoneError;
        };
        match bins.iter_mut().find(|b| b.name == name) {
            Some(bin) => bin.value = value,
            None => bins.push(Bin::new(name, value)),
        }
    }

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
    let key = rw
        .msg
        .key()
        .map(|k| k.to_vec())
        .or_else(|| existing.as_ref().and_then(|r| r.key.clone()));

    let rec = Record {
        generation,
        void_time,
        last_update_time: now_ms(),
        set_name: set_name.clone(),
        key,
        bins,
    };
    ns.store.put(&keyd, &rec);

    {
        let mut inner = rw.inner.lock().unwrap();
        inner.generation = generation;
        inner.void_time = void_time;
        inner.pickle = Some(silo_proto::pickle::pickle(&rec.to_pickled()));
        inner.is_delete = false;
    }

    if ns.cfg.xdr_enabled {
        state.xdr.ship(XdrEvent {
            namespace: ns.name.clone(),
            keyd,
            generation,
            is_delete: false,
            set_name,
        });
    }

    TransStatus::InProgress
}

async fn send_write_response(state: &Arc<NodeState>, rw: &Arc<RwRecord>) {
    let origin = rw.take_origin();

    let (result_code, generation, void_time) = {
        let inner = rw.inner.lock().unwrap();
        (inner.result_code, inner.generation, inner.void_time)
    };

    let ns = &rw.ns;

    match origin {
        None => {}
        Some(Origin::Client(conn)) => {
            let reply = make_reply(result_code, generation, void_time, &[], rw.trid());
            crate::transaction::send_client_reply(state, &conn, reply).await;
            state.stats.write_hist.insert_data_point(rw.start_time);
            if result_code.is_ok() {
                ns.stats.client_write_success.fetch_add(1, Ordering::Relaxed);
            } else {
                ns.stats.client_write_error.fetch_add(1, Ordering::Relaxed);
            }
        }
        Some(Origin::Proxy { node, tid }) => {
            let reply = make_reply(result_code, generation, void_time, &[], rw.trid());
            state.fabric.send_proxy_response(node, tid, reply).await;
        }
        Some(Origin::InternalNsup) => {}
        Some(other) => {
            crate::crash!(
                Context::Rw,
                "unexpected transaction origin {} in write response",
                other.name()
            );
        }
    }
}
