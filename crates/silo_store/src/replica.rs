//! Peer fabric and cross-DC shipping contracts.
//!
//! Cluster transport internals are external collaborators; the transaction
//! core only depends on these traits. Duplicate-resolution and replica-write
//! requests go out through [`Fabric`]; peer acks come back into the in-flight
//! table, which advances the owning pipeline.
//!
//! The loopback implementation serves single-node operation and tests: it
//! records every message and (unless a test withholds them) acks immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{FuturesUnordered, StreamExt};
use silo_proto::Digest;

use crate::inflight::{self, HashKey};
use crate::NodeState;

pub type NodeId = u64;

/// Ask duplicate-holding peers to vote their newest copy before a write.
#[derive(Debug, Clone)]
pub struct DupResRequest {
    pub hkey: HashKey,
    pub origin_node: NodeId,
}

/// Ship a master-applied record (or delete) to replica peers.
#[derive(Debug, Clone)]
pub struct ReplWriteRequest {
    pub hkey: HashKey,
    /// Pickled record; `None` for deletes.
    pub pickle: Option<Vec<u8>>,
    pub is_delete: bool,
    pub generation: u32,
    pub origin_node: NodeId,
}

#[async_trait]
pub trait Fabric: Send + Sync {
    async fn send_dup_res(&self, dest: &[NodeId], req: DupResRequest);
    async fn send_repl_write(&self, dest: &[NodeId], req: ReplWriteRequest);
    /// Deliver a response for a proxied transaction back to the proxying
    /// node.
    async fn send_proxy_response(&self, node: NodeId, tid: u64, reply: Bytes);
}

/// A write event for cross-datacenter shipping, produced after master apply
/// once the storage record is closed.
#[derive(Debug, Clone)]
pub struct XdrEvent {
    pub namespace: String,
    pub keyd: Digest,
    pub generation: u32,
    pub is_delete: bool,
    pub set_name: Option<String>,
}

pub trait XdrSink: Send + Sync {
    fn ship(&self, event: XdrEvent);
}

/// Default sink: log-only.
pub struct LogXdrSink;

impl XdrSink for LogXdrSink {
    fn ship(&self, event: XdrEvent) {
        tracing::debug!(
            target: "xdr",
            "{{{}}} ship {} gen {} delete {}",
            event.namespace,
            event.keyd,
            event.generation,
            event.is_delete
        );
    }
}

/// Capturing sink for tests.
#[derive(Default)]
pub struct CaptureXdrSink {
    pub events: Mutex<Vec<XdrEvent>>,
}

impl XdrSink for CaptureXdrSink {
    fn ship(&self, event: XdrEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// In-process fabric. Messages are recorded for inspection; acks are spawned
/// immediately unless a test has taken manual control of them.
pub struct LoopbackFabric {
    node: OnceLock<Weak<NodeState>>,
    pub dup_res_sent: Mutex<Vec<(Vec<NodeId>, DupResRequest)>>,
    pub repl_writes_sent: Mutex<Vec<(Vec<NodeId>, ReplWriteRequest)>>,
    pub proxy_responses: Mutex<Vec<(NodeId, u64, Bytes)>>,
    manual_ack: AtomicBool,
}

impl LoopbackFabric {
    pub fn new() -> LoopbackFabric {
        LoopbackFabric {
            node: OnceLock::new(),
            dup_res_sent: Mutex::new(Vec::new()),
            repl_writes_sent: Mutex::new(Vec::new()),
            proxy_responses: Mutex::new(Vec::new()),
            manual_ack: AtomicBool::new(false),
        }
    }

    /// Late wiring: the fabric needs the node to deliver acks, the node needs
    /// the fabric to send. Registered once at composition.
    pub fn set_node(&self, state: &std::sync::Arc<NodeState>) {
        let _ = self.node.set(std::sync::Arc::downgrade(state));
    }

    /// Withhold automatic acks; the test drives `inflight::on_*_ack` itself.
    pub fn set_manual_ack(&self, on: bool) {
        self.manual_ack.store(on, Ordering::Relaxed);
    }

    fn state(&self) -> Option<std::sync::Arc<NodeState>> {
        self.node.get().and_then(Weak::upgrade)
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        LoopbackFabric::new()
    }
}

#[async_trait]
impl Fabric for LoopbackFabric {
    async fn send_dup_res(&self, dest: &[NodeId], req: DupResRequest) {
        self.dup_res_sent
            .lock()
            .unwrap()
            .push((dest.to_vec(), req.clone()));

        if self.manual_ack.load(Ordering::Relaxed) {
            return;
        }
        let Some(state) = self.state() else { return };
        let dest = dest.to_vec();
        tokio::spawn(async move {
            let mut acks: FuturesUnordered<_> = dest
                .iter()
                .map(|n| inflight::on_dup_res_ack(&state, req.hkey, *n))
                .collect();
            while acks.next().await.is_some() {}
        });
    }

    async fn send_repl_write(&self, dest: &[NodeId], req: ReplWriteRequest) {
        self.repl_writes_sent
            .lock()
            .unwrap()
            .push((dest.to_vec(), req.clone()));

        if self.manual_ack.load(Ordering::Relaxed) {
            return;
        }
        let Some(state) = self.state() else { return };
        let dest = dest.to_vec();
        tokio::spawn(async move {
            let mut acks: FuturesUnordered<_> = dest
                .iter()
                .map(|n| inflight::on_repl_write_ack(&state, req.hkey, *n))
                .collect();
            while acks.next().await.is_some() {}
        });
    }

    async fn send_proxy_response(&self, node: NodeId, tid: u64, reply: Bytes) {
        self.proxy_responses.lock().unwrap().push((node, tid, reply));
    }
}
