//! Silo key-value node: client-facing transaction and request-processing
//! core.
//!
//! This crate wires the network front end, the transaction service, the
//! batch read engine, and the UDF pipeline over pluggable collaborator
//! contracts (record storage, script engine, peer fabric, cross-DC sink).
//! The composition root lives in [`start_node`]; `main.rs` is a thin CLI over
//! it, and tests embed nodes through the same entry point.

pub mod batch;
pub mod config;
pub mod conn;
pub mod fault;
pub mod info;
pub mod inflight;
pub mod kv;
pub mod namespace;
pub mod replica;
pub mod script;
pub mod server;
pub mod stats;
pub mod ticker;
pub mod transaction;
pub mod tsvc;
pub mod udf;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use batch::BatchEngine;
use config::Config;
use conn::{ConnKind, ConnRegistry};
use inflight::InflightTable;
use namespace::Namespace;
use replica::{Fabric, LoopbackFabric, LogXdrSink, XdrSink};
use script::{NativeScriptEngine, ScriptEngine};
use stats::Stats;

/// Fallback connection-table size when the cap is configured as zero.
const DEFAULT_FD_TABLE: usize = 1024;

/// Everything the pipeline components share, wired once at startup and
/// passed as an explicit handle rather than global state.
pub struct NodeState {
    pub cfg: Config,
    pub stats: Stats,
    pub namespaces: Vec<Arc<Namespace>>,
    pub conns: ConnRegistry,
    pub inflight: InflightTable,
    pub batch: BatchEngine,
    pub fabric: Arc<dyn Fabric>,
    pub scripts: Arc<dyn ScriptEngine>,
    pub xdr: Arc<dyn XdrSink>,
    cluster_size: AtomicUsize,
    shutdown: AtomicBool,
}

impl NodeState {
    pub fn new(
        cfg: Config,
        fabric: Arc<dyn Fabric>,
        scripts: Arc<dyn ScriptEngine>,
        xdr: Arc<dyn XdrSink>,
    ) -> anyhow::Result<Arc<NodeState>> {
        let namespaces = namespace::build_namespaces(&cfg.namespaces)?;

        // The slot table is sized to the descriptor limit; the configured
        // cap sheds accepts before slots run out.
        let fd_table = if cfg.proto_fd_max == 0 {
            tracing::info!(
                target: "service",
                "setting default client file descriptors to {DEFAULT_FD_TABLE}"
            );
            DEFAULT_FD_TABLE
        } else {
            (cfg.proto_fd_max as usize).max(DEFAULT_FD_TABLE)
        };

        Ok(Arc::new(NodeState {
            cfg,
            stats: Stats::new(),
            namespaces,
            conns: ConnRegistry::new(fd_table),
            inflight: InflightTable::new(),
            batch: BatchEngine::new(),
            fabric,
            scripts,
            xdr,
            cluster_size: AtomicUsize::new(1),
            shutdown: AtomicBool::new(false),
        }))
    }

    pub fn namespace_by_name(&self, name: &[u8]) -> Option<Arc<Namespace>> {
        self.namespaces
            .iter()
            .find(|ns| ns.name.as_bytes() == name)
            .cloned()
    }

    pub fn cluster_size(&self) -> usize {
        self.cluster_size.load(Ordering::Relaxed)
    }

    pub fn set_cluster_size(&self, n: usize) {
        self.cluster_size.store(n, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    pub fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// A running node, embeddable in another process (tests run nodes this way).
pub struct NodeHandle {
    pub state: Arc<NodeState>,
    pub service_addr: SocketAddr,
    pub xdr_addr: Option<SocketAddr>,
}

impl NodeHandle {
    /// Signal shutdown; background tasks observe the flag and wind down.
    pub fn shutdown(&self) {
        self.state.signal_shutdown();
    }
}

/// Composition root: build the node state, start the batch workers, bind the
/// listeners, and spawn the background tasks (reaper, timeout sweeper,
/// ticker).
pub async fn start_node(
    cfg: Config,
    fabric: Arc<dyn Fabric>,
    scripts: Arc<dyn ScriptEngine>,
    xdr: Arc<dyn XdrSink>,
) -> anyhow::Result<NodeHandle> {
    fault::init_subscriber();

    let state = NodeState::new(cfg, fabric, scripts, xdr)?;

    tracing::info!(
        target: "service",
        "transaction service: {} queues x {} threads, {} reactor threads",
        state.cfg.transaction_queues,
        state.cfg.transaction_threads_per_queue,
        state.cfg.service_threads
    );

    BatchEngine::start(&state);

    let bound = server::run_listeners(&state).await?;
    let service_addr = bound
        .iter()
        .find(|(kind, _)| *kind == ConnKind::Service)
        .map(|(_, addr)| *addr)
        .expect("service listener not bound");
    let xdr_addr = bound
        .iter()
        .find(|(kind, _)| *kind == ConnKind::Xdr)
        .map(|(_, addr)| *addr);

    tokio::spawn(conn::run_reaper(Arc::clone(&state)));
    tokio::spawn(inflight::run_sweeper(Arc::clone(&state)));
    tokio::spawn(ticker::run_ticker(Arc::clone(&state)));

    Ok(NodeHandle {
        state,
        service_addr,
        xdr_addr,
    })
}

/// Start a node with the default collaborators: loopback fabric, native
/// script engine, log-only cross-DC sink. Returns the collaborators so
/// embedders can register script functions or inspect fabric traffic.
pub async fn start_default_node(
    cfg: Config,
) -> anyhow::Result<(NodeHandle, Arc<LoopbackFabric>, Arc<NativeScriptEngine>)> {
    let fabric = Arc::new(LoopbackFabric::new());
    let scripts = Arc::new(NativeScriptEngine::new());
    let handle = start_node(
        cfg,
        Arc::clone(&fabric) as Arc<dyn Fabric>,
        Arc::clone(&scripts) as Arc<dyn ScriptEngine>,
        Arc::new(LogXdrSink),
    )
    .await?;
    fabric.set_node(&handle.state);
    Ok((handle, fabric, scripts))
}
