//! The in-flight transaction table (request hash) and its timeout sweeper.
//!
//! Keyed by (namespace id, digest): at most one in-flight pipeline record per
//! key. The table is sharded; each shard has its own lock and the sweeper
//! walks shards independently.
//!
//! The pipeline record is recyclable: the same record carries a transaction
//! through duplicate resolution and is reset for the replica-write phase.
//! Exactly one of {natural completion, timeout} responds: the winner takes
//! the record's origin under the record's lock, the loser observes `None` and
//! no-ops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use silo_proto::{Digest, ParsedMsg, ResultCode};

use crate::conn::end_of_transaction;
use crate::namespace::{Namespace, Reservation};
use crate::script::ScriptDef;
use crate::transaction::{Origin, TransStatus};
use crate::NodeState;

const N_SHARDS: usize = 32;
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HashKey {
    pub ns_id: u32,
    pub keyd: Digest,
}

/// Pipeline stage of an in-flight record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwStage {
    Initial,
    AwaitingDupRes,
    AwaitingReplWrite,
    Done,
}

/// Which continuation runs when the pending ack set drains. A flat tag
/// matched at the single dispatch site, rather than a trait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwWaitTag {
    None,
    UdfDupRes,
    UdfReplWrite,
    WriteDupRes,
    WriteReplWrite,
}

/// Which pipeline owns the record, for timeout-side statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RwTimeoutTag {
    Udf,
    Write,
}

/// Mutable state of an in-flight record, guarded by the record's lock.
pub struct RwInner {
    pub origin: Option<Origin>,
    pub stage: RwStage,
    pub wait_tag: RwWaitTag,
    /// Peer nodes whose acks are outstanding.
    pub pending: Vec<u64>,
    pub result_code: ResultCode,
    pub generation: u32,
    pub void_time: u32,
    /// Pre-composed response frame (UDF result payload).
    pub response: Option<Bytes>,
    /// Replication pickle produced by master apply; `None` for deletes.
    pub pickle: Option<Vec<u8>>,
    pub is_delete: bool,
    /// Respond-on-master-complete already answered the client.
    pub responded: bool,
    pub benchmark_time: u64,
}

/// The recyclable in-hash pipeline record. The record owns the message, the
/// reservation, and the origin; a derived transaction view is constructed
/// under the record's lock when a stage needs one.
pub struct RwRecord {
    pub hkey: HashKey,
    pub ns: Arc<Namespace>,
    pub rsv: Reservation,
    pub msg: ParsedMsg,
    pub start_time: u64,
    pub end_time: u64,
    pub respond_on_master: bool,
    pub timeout_tag: RwTimeoutTag,
    pub udf_def: Option<ScriptDef>,
    pub inner: Mutex<RwInner>,
}

impl RwRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hkey: HashKey,
        rsv: Reservation,
        msg: ParsedMsg,
        origin: Origin,
        start_time: u64,
        end_time: u64,
        respond_on_master: bool,
        timeout_tag: RwTimeoutTag,
        udf_def: Option<ScriptDef>,
    ) -> Arc<RwRecord> {
        let ns = Arc::clone(&rsv.ns);
        Arc::new(RwRecord {
            hkey,
            ns,
            rsv,
            msg,
            start_time,
            end_time,
            respond_on_master,
            timeout_tag,
            udf_def,
            inner: Mutex::new(RwInner {
                origin: Some(origin),
                stage: RwStage::Initial,
                wait_tag: RwWaitTag::None,
                pending: Vec::new(),
                result_code: ResultCode::Ok,
                generation: 0,
                void_time: 0,
                response: None,
                pickle: None,
                is_delete: false,
                responded: false,
                benchmark_time: 0,
            }),
        })
    }

    /// Take the origin under the record's lock. The winner of the
    /// completion/timeout race gets `Some`; the loser sees `None`.
    pub fn take_origin(&self) -> Option<Origin> {
        self.inner.lock().unwrap().origin.take()
    }

    pub fn trid(&self) -> u64 {
        self.msg.trid()
    }
}

pub struct InflightTable {
    shards: Vec<Mutex<HashMap<HashKey, Arc<RwRecord>>>>,
    count: AtomicU64,
}

impl InflightTable {
    pub fn new() -> InflightTable {
        InflightTable {
            shards: (0..N_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            count: AtomicU64::new(0),
        }
    }

    fn shard(&self, hkey: &HashKey) -> &Mutex<HashMap<HashKey, Arc<RwRecord>>> {
        let b = hkey.keyd.0[19] as usize;
        &self.shards[b % N_SHARDS]
    }

    /// Insert a record; `Waiting` when the key already has one in flight.
    pub fn insert(&self, rw: Arc<RwRecord>) -> TransStatus {
        let mut shard = self.shard(&rw.hkey).lock().unwrap();
        if shard.contains_key(&rw.hkey) {
            return TransStatus::Waiting;
        }
        shard.insert(rw.hkey, rw);
        self.count.fetch_add(1, Ordering::Relaxed);
        TransStatus::InProgress
    }

    pub fn get(&self, hkey: &HashKey) -> Option<Arc<RwRecord>> {
        self.shard(hkey).lock().unwrap().get(hkey).cloned()
    }

    /// Remove the record, provided it is still the one in the table.
    pub fn remove(&self, rw: &Arc<RwRecord>) {
        let mut shard = self.shard(&rw.hkey).lock().unwrap();
        let is_ours = shard
            .get(&rw.hkey)
            .is_some_and(|held| Arc::ptr_eq(held, rw));
        if is_ours {
            shard.remove(&rw.hkey);
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expired(&self, now_ns: u64) -> Vec<Arc<RwRecord>> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock().unwrap();
            for rw in shard.values() {
                if rw.end_time != 0 && now_ns > rw.end_time {
                    out.push(Arc::clone(rw));
                }
            }
        }
        out
    }
}

impl Default for InflightTable {
    fn default() -> Self {
        InflightTable::new()
    }
}

/// Deliver a duplicate-resolution ack from a peer.
pub async fn on_dup_res_ack(state: &Arc<NodeState>, hkey: HashKey, node: u64) {
    on_ack(state, hkey, node, false).await;
}

/// Deliver a replica-write ack from a peer.
pub async fn on_repl_write_ack(state: &Arc<NodeState>, hkey: HashKey, node: u64) {
    on_ack(state, hkey, node, true).await;
}

async fn on_ack(state: &Arc<NodeState>, hkey: HashKey, node: u64, is_repl: bool) {
    let Some(rw) = state.inflight.get(&hkey) else {
        // Record already finished (timeout or terminal error path).
        tracing::debug!(target: "rw", "ack from node {node:x} for finished record");
        return;
    };

    let tag = {
        let mut inner = rw.inner.lock().unwrap();
        inner.pending.retain(|n| *n != node);
        if !inner.pending.is_empty() {
            return;
        }
        let expect_repl = matches!(
            inner.wait_tag,
            RwWaitTag::UdfReplWrite | RwWaitTag::WriteReplWrite
        );
        if expect_repl != is_repl {
            tracing::debug!(target: "rw", "stale ack kind from node {node:x}");
            return;
        }
        std::mem::replace(&mut inner.wait_tag, RwWaitTag::None)
    };

    // The pending set drained; run the next stage. One flat dispatch site.
    match tag {
        RwWaitTag::UdfDupRes => crate::udf::dup_res_complete(state, &rw).await,
        RwWaitTag::UdfReplWrite => crate::udf::repl_write_complete(state, &rw).await,
        RwWaitTag::WriteDupRes => crate::kv::write_dup_res_complete(state, &rw).await,
        RwWaitTag::WriteReplWrite => crate::kv::write_repl_complete(state, &rw).await,
        RwWaitTag::None => {}
    }
}

/// Timeout sweeper: walks the shards and fires the timeout path for every
/// record past its end time. Exactly one of natural completion and timeout
/// wins the record's origin.
pub async fn run_sweeper(state: Arc<NodeState>) {
    loop {
        tokio::time::sleep(SWEEP_INTERVAL).await;
        if state.is_shutdown() {
            return;
        }

        let now = crate::stats::now_ns();
        for rw in state.inflight.expired(now) {
            handle_timeout(&state, rw).await;
        }
    }
}

async fn handle_timeout(state: &Arc<NodeState>, rw: Arc<RwRecord>) {
    let origin = {
        let mut inner = rw.inner.lock().unwrap();
        inner.stage = RwStage::Done;
        inner.origin.take()
    };

    let ns = &rw.ns;

    match origin {
        None => {
            // Lost the race against a callback; it responds (or responded).
        }
        Some(Origin::Client(conn)) => {
            // Force-close so the client does not wait on stale state.
            // Timeouts aren't included in latency histograms.
            end_of_transaction(&state.stats, &conn, true).await;
            match rw.timeout_tag {
                RwTimeoutTag::Udf => ns.stats.client_udf_timeout.fetch_add(1, Ordering::Relaxed),
                RwTimeoutTag::Write => {
                    ns.stats.client_tsvc_timeout.fetch_add(1, Ordering::Relaxed)
                }
            };
        }
        Some(Origin::Proxy { .. }) => {
            // The proxying node runs its own timeout.
        }
        Some(Origin::BatchSub { shared, index }) => {
            crate::batch::add_error(state, &shared, index, ResultCode::Timeout).await;
            ns.stats
                .batch_sub_tsvc_timeout
                .fetch_add(1, Ordering::Relaxed);
        }
        Some(Origin::InternalUdf(orig)) => {
            orig.complete(ResultCode::Timeout);
            ns.stats
                .udf_sub_udf_timeout
                .fetch_add(1, Ordering::Relaxed);
        }
        Some(Origin::InternalNsup) => {}
    }

    state.inflight.remove(&rw);
}
