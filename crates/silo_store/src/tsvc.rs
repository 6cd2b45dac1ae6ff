//! Transaction service: reservation, routing, and dispatch of a prepared
//! transaction into the read / write / UDF pipelines.

use std::sync::Arc;

use silo_proto::{FieldType, ResultCode};

use crate::stats::now_ns;
use crate::transaction::{TransStatus, Transaction};
use crate::NodeState;

/// Process one transaction: resolve the namespace, reserve the partition,
/// set the deadline, and route by request shape. Every path emits exactly one
/// response (or hands the duty to the in-flight record).
pub async fn process_transaction(state: &Arc<NodeState>, mut tr: Transaction) -> TransStatus {
    // Resolve the namespace field.
    let ns = tr
        .msg
        .namespace()
        .and_then(|name| state.namespace_by_name(name));
    let Some(ns) = ns else {
        tracing::warn!(target: "tsvc", "transaction with unknown namespace");
        crate::transaction::send_error(state, &mut tr, ResultCode::Namespace).await;
        return TransStatus::DoneError;
    };

    // Batch rows carry their digest in the row header; everything else needs
    // the digest field.
    if !tr.is_batch_sub() {
        match tr.msg.digest() {
            Some(keyd) => tr.keyd = keyd,
            None => {
                tracing::warn!(target: "tsvc", "transaction without digest field");
                crate::transaction::send_error(state, &mut tr, ResultCode::Parameter).await;
                return TransStatus::DoneError;
            }
        }
    }

    tr.rsv = Some(ns.reserve(tr.keyd.partition_id()));

    // Deadline: the message's transaction ttl (milliseconds) or the
    // configured default.
    if tr.start_time == 0 {
        tr.start_time = now_ns();
    }
    let ttl_ms = match tr.msg.header.transaction_ttl {
        0 => state.cfg.transaction_max_ms,
        // Batch sub-replies overload this slot with the batch index, but that
        // rewrite happens on the response side; requests carry a timeout.
        ms => u64::from(ms),
    };
    tr.end_time = tr.start_time + ttl_ms * 1_000_000;

    // Scans and queries belong to the job subsystem, not this core.
    if tr.msg.has_field(FieldType::ScanOptions) || tr.msg.has_field(FieldType::IndexRange) {
        crate::transaction::send_error(state, &mut tr, ResultCode::UnsupportedFeature).await;
        return TransStatus::DoneError;
    }

    let is_internal_udf = matches!(
        tr.origin,
        Some(crate::transaction::Origin::InternalUdf(_))
    );
    if tr.msg.is_udf() || is_internal_udf {
        if tr.is_batch_sub() {
            // Batch rows are reads; a script call inside one is malformed.
            crate::transaction::send_error(state, &mut tr, ResultCode::Parameter).await;
            return TransStatus::DoneError;
        }
        return crate::udf::start(state, tr).await;
    }

    if tr.msg.is_write() {
        if tr.is_batch_sub() {
            crate::transaction::send_error(state, &mut tr, ResultCode::Parameter).await;
            return TransStatus::DoneError;
        }
        return crate::kv::write_start(state, tr).await;
    }

    crate::kv::read(state, tr).await
}
