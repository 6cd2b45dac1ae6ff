//! The transaction object: request-scoped state moving through the pipeline,
//! the tagged origin that decides response delivery, and the per-origin error
//! emitter.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use silo_proto::reply::make_error_reply;
use silo_proto::{Digest, ParsedMsg, ResultCode};

use crate::conn::{end_of_transaction, ClientConn};
use crate::fault::Context;
use crate::namespace::{Namespace, Reservation};
use crate::script::ScriptDef;
use crate::NodeState;

/// Transaction status, as returned by pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransStatus {
    DoneSuccess,
    DoneError,
    InProgress,
    /// A prior transaction on the same key is active.
    Waiting,
}

/// Origin of an internal UDF transaction (a scan or query job row). The
/// completion callback fires exactly once with the final result code.
pub struct IudfOrigin {
    pub def: ScriptDef,
    cb: Mutex<Option<Box<dyn FnOnce(ResultCode) + Send>>>,
}

impl IudfOrigin {
    pub fn new(def: ScriptDef, cb: impl FnOnce(ResultCode) + Send + 'static) -> IudfOrigin {
        IudfOrigin {
            def,
            cb: Mutex::new(Some(Box::new(cb))),
        }
    }

    pub fn complete(&self, rc: ResultCode) {
        match self.cb.lock().unwrap().take() {
            Some(cb) => cb(rc),
            None => crate::crash!(Context::Tsvc, "internal udf origin completed twice"),
        }
    }
}

/// Who asked for this transaction; determines how the one response is
/// delivered. The shared variants are arcs; transfer between pipeline stages
/// is a move of this value with the source left empty.
pub enum Origin {
    /// A client connection; holds a handle reference for the transaction's
    /// lifetime.
    Client(Arc<ClientConn>),
    /// A peer node proxying on behalf of its client.
    Proxy { node: u64, tid: u64 },
    /// A row of a batch request.
    BatchSub {
        shared: Arc<crate::batch::BatchShared>,
        index: u32,
    },
    /// A scan/query job applying a UDF.
    InternalUdf(Arc<IudfOrigin>),
    /// Internal housekeeping delete; fire and forget.
    InternalNsup,
}

impl Origin {
    pub fn name(&self) -> &'static str {
        match self {
            Origin::Client(_) => "client",
            Origin::Proxy { .. } => "proxy",
            Origin::BatchSub { .. } => "batch-sub",
            Origin::InternalUdf(_) => "internal-udf",
            Origin::InternalNsup => "internal-nsup",
        }
    }
}

/// Request-scoped state. Mutable only by the pipeline stage that currently
/// owns it; destroyed after response emission and reservation release.
pub struct Transaction {
    /// The parsed request frame; owns the raw bytes.
    pub msg: ParsedMsg,
    /// `None` once the response has been handed off (or lost to a timeout).
    pub origin: Option<Origin>,
    pub keyd: Digest,
    pub rsv: Option<Reservation>,
    pub start_time: u64,
    pub end_time: u64,
    pub benchmark_time: u64,
    pub result_code: ResultCode,
    pub generation: u32,
    pub void_time: u32,
    pub last_update_time: u64,
}

impl Transaction {
    pub fn new(msg: ParsedMsg, origin: Origin, start_time: u64) -> Transaction {
        Transaction {
            msg,
            origin: Some(origin),
            keyd: Digest([0; 20]),
            rsv: None,
            start_time,
            end_time: 0,
            benchmark_time: 0,
            result_code: ResultCode::Ok,
            generation: 0,
            void_time: 0,
            last_update_time: 0,
        }
    }

    pub fn ns(&self) -> Option<&Arc<Namespace>> {
        self.rsv.as_ref().map(|r| &r.ns)
    }

    pub fn trid(&self) -> u64 {
        self.msg.trid()
    }

    pub fn is_batch_sub(&self) -> bool {
        matches!(self.origin, Some(Origin::BatchSub { .. }))
    }
}

/// Build an internal UDF transaction (for a UDF scan or query job row).
/// Composes a minimal write message carrying namespace and digest - no set,
/// since these transactions are not security checked and cannot create
/// records.
pub fn create_internal_udf(
    ns_name: &str,
    keyd: Digest,
    orig: Arc<IudfOrigin>,
) -> Result<Transaction, silo_proto::ParseError> {
    let mut b = silo_proto::msg::MsgBuilder::new();
    b.info2 = silo_proto::msg::INFO2_WRITE;
    let body = b
        .field(silo_proto::FieldType::Namespace, ns_name.as_bytes().to_vec())
        .field(silo_proto::FieldType::Digest, keyd.0.to_vec())
        .build_body();

    let msg = ParsedMsg::parse(bytes::Bytes::from(body))?;

    // Stamp the start last, to exclude setup time.
    let mut tr = Transaction::new(msg, Origin::InternalUdf(orig), crate::stats::now_ns());
    tr.keyd = keyd;
    Ok(tr)
}

/// Send a composed reply to a client connection and finish the transaction.
/// A send failure force-closes the connection.
pub async fn send_client_reply(state: &NodeState, conn: &Arc<ClientConn>, reply: Bytes) -> bool {
    let ok = match conn.send(&reply).await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(target: "proto", "reply send failed on slot {}: {e}", conn.slot);
            false
        }
    };
    end_of_transaction(&state.stats, conn, !ok).await;
    ok
}

/// Emit an error reply for a request that failed before a transaction was
/// created (frame-level parse failures). Keeps the connection open.
pub async fn demarshal_error(state: &NodeState, conn: &Arc<ClientConn>, code: ResultCode) {
    let reply = make_error_reply(code, 0);
    send_client_reply(state, conn, reply).await;
    state.stats.demarshal_error.fetch_add(1, Ordering::Relaxed);
}

/// The per-origin error emitter. Dispatches the error exactly once on the
/// origin, and bumps per-namespace (or global, when no reservation was made)
/// error counters.
///
/// The origin-null guards exist for the race between duplicate-resolution's
/// re-queue handling and sweeper timeouts; they stay even though the known
/// race is handled upstream.
pub async fn send_error(state: &Arc<NodeState>, tr: &mut Transaction, error_code: ResultCode) {
    let error_code = if error_code == ResultCode::Ok {
        tracing::warn!(target: "proto", "converting error code 0 to 1 (unknown)");
        ResultCode::Unknown
    } else {
        error_code
    };

    let ns = tr.rsv.as_ref().map(|r| Arc::clone(&r.ns));
    let is_timeout = error_code == ResultCode::Timeout;

    match tr.origin.take() {
        Some(Origin::Client(conn)) => {
            let reply = make_error_reply(error_code, tr.trid());
            send_client_reply(state, &conn, reply).await;
            match &ns {
                Some(ns) if is_timeout => {
                    ns.stats.client_tsvc_timeout.fetch_add(1, Ordering::Relaxed)
                }
                Some(ns) => ns.stats.client_tsvc_error.fetch_add(1, Ordering::Relaxed),
                None => state.stats.tsvc_client_error.fetch_add(1, Ordering::Relaxed),
            };
        }
        Some(Origin::Proxy { node, tid }) => {
            let reply = make_error_reply(error_code, tr.trid());
            state.fabric.send_proxy_response(node, tid, reply).await;
        }
        Some(Origin::BatchSub { shared, index }) => {
            crate::batch::add_error(state, &shared, index, error_code).await;
            match &ns {
                Some(ns) if is_timeout => ns
                    .stats
                    .batch_sub_tsvc_timeout
                    .fetch_add(1, Ordering::Relaxed),
                Some(ns) => ns
                    .stats
                    .batch_sub_tsvc_error
                    .fetch_add(1, Ordering::Relaxed),
                None => state
                    .stats
                    .tsvc_batch_sub_error
                    .fetch_add(1, Ordering::Relaxed),
            };
        }
        Some(Origin::InternalUdf(orig)) => {
            orig.complete(error_code);
            match &ns {
                Some(ns) if is_timeout => ns
                    .stats
                    .udf_sub_tsvc_timeout
                    .fetch_add(1, Ordering::Relaxed),
                Some(ns) => ns.stats.udf_sub_tsvc_error.fetch_add(1, Ordering::Relaxed),
                None => state
                    .stats
                    .tsvc_udf_sub_error
                    .fetch_add(1, Ordering::Relaxed),
            };
        }
        Some(Origin::InternalNsup) => {}
        None => {
            // Lost the race against a timeout; the timeout already answered.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use silo_proto::msg::MsgBuilder;
    use silo_proto::FieldType;

    #[test]
    fn iudf_origin_fires_once() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let fired2 = Arc::clone(&fired);
        let orig = IudfOrigin::new(ScriptDef::default(), move |rc| {
            fired2.lock().unwrap().push(rc);
        });
        orig.complete(ResultCode::NotFound);
        assert_eq!(*fired.lock().unwrap(), vec![ResultCode::NotFound]);
    }

    #[test]
    #[should_panic(expected = "completed twice")]
    fn iudf_double_complete_is_critical() {
        crate::fault::set_panic_on_crash(true);
        let orig = IudfOrigin::new(ScriptDef::default(), |_| {});
        orig.complete(ResultCode::Ok);
        orig.complete(ResultCode::Ok);
    }

    #[test]
    fn transaction_carries_trid() {
        let body = MsgBuilder::new()
            .field(FieldType::Namespace, &b"test"[..])
            .field(FieldType::Trid, 77u64.to_be_bytes().to_vec())
            .build_body();
        let msg = ParsedMsg::parse(bytes::Bytes::from(body)).unwrap();
        let tr = Transaction::new(msg, Origin::InternalNsup, 0);
        assert_eq!(tr.trid(), 77);
    }
}
