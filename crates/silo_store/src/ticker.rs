//! Periodic aggregate statistics frames.
//!
//! Wakes once per second and emits a frame every `ticker-interval` seconds:
//! node identity, system memory, in-progress depths, descriptor counters,
//! early failures, batch-index counters, per-namespace breakdowns, and
//! histogram dumps. Frames stop once shutdown is signaled.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use sysinfo::System;

use crate::namespace::Namespace;
use crate::stats::now_ns;
use crate::NodeState;

pub async fn run_ticker(state: Arc<NodeState>) {
    let mut sys = System::new();
    let mut last_time = now_ns();

    loop {
        // Wake every second to check the interval.
        tokio::time::sleep(Duration::from_secs(1)).await;

        let curr_time = now_ns();
        if curr_time - last_time < state.cfg.ticker_interval * 1_000_000_000 {
            continue;
        }
        last_time = curr_time;

        // Reduce the likelihood of frames after the shutdown signal.
        if state.is_shutdown() {
            return;
        }

        log_frame(&state, &mut sys);
    }
}

fn log_frame(state: &Arc<NodeState>, sys: &mut System) {
    tracing::info!(
        target: "info",
        "NODE-ID {:x} CLUSTER-SIZE {}",
        state.cfg.node_id,
        state.cluster_size()
    );

    log_line_system_memory(sys);
    log_line_in_progress(state);
    log_line_fds(state);
    log_line_early_fail(state);
    log_line_batch_index(state);

    state.stats.dump_histograms();

    for ns in &state.namespaces {
        log_namespace(ns);
    }
}

fn log_line_system_memory(sys: &mut System) {
    sys.refresh_memory();
    let total = sys.total_memory();
    let free = sys.available_memory();
    let free_pct = if total > 0 { free * 100 / total } else { 0 };
    tracing::info!(
        target: "info",
        "   system-memory: free-kbytes {} free-pct {}",
        free / 1024,
        free_pct
    );
}

fn log_line_in_progress(state: &Arc<NodeState>) {
    tracing::info!(
        target: "info",
        "   in-progress: rw-hash {} open-batches {}",
        state.inflight.len(),
        state.batch.queues_info()
    );
}

fn log_line_fds(state: &Arc<NodeState>) {
    let s = &state.stats;
    let opened = s.proto_connections_opened.load(Ordering::Relaxed);
    let closed = s.proto_connections_closed.load(Ordering::Relaxed);
    let hb_opened = s.heartbeat_connections_opened.load(Ordering::Relaxed);
    let hb_closed = s.heartbeat_connections_closed.load(Ordering::Relaxed);
    let fab_opened = s.fabric_connections_opened.load(Ordering::Relaxed);
    let fab_closed = s.fabric_connections_closed.load(Ordering::Relaxed);
    tracing::info!(
        target: "info",
        "   fds: proto ({},{},{}) heartbeat ({},{},{}) fabric ({},{},{})",
        opened - closed,
        opened,
        closed,
        hb_opened - hb_closed,
        hb_opened,
        hb_closed,
        fab_opened - fab_closed,
        fab_opened,
        fab_closed
    );
}

fn log_line_early_fail(state: &Arc<NodeState>) {
    let s = &state.stats;
    let demarshal = s.demarshal_error.load(Ordering::Relaxed);
    let tsvc_client = s.tsvc_client_error.load(Ordering::Relaxed);
    let tsvc_batch_sub = s.tsvc_batch_sub_error.load(Ordering::Relaxed);
    let tsvc_udf_sub = s.tsvc_udf_sub_error.load(Ordering::Relaxed);
    if demarshal + tsvc_client + tsvc_batch_sub + tsvc_udf_sub == 0 {
        return;
    }
    tracing::info!(
        target: "info",
        "   early-fail: demarshal {demarshal} tsvc-client {tsvc_client} tsvc-batch-sub {tsvc_batch_sub} tsvc-udf-sub {tsvc_udf_sub}"
    );
}

fn log_line_batch_index(state: &Arc<NodeState>) {
    let s = &state.stats;
    let initiate = s.batch_index_initiate.load(Ordering::Relaxed);
    if initiate == 0 {
        return;
    }
    tracing::info!(
        target: "info",
        "   batch-index: batches ({},{},{}) buffers ({},{},{})",
        s.batch_index_complete.load(Ordering::Relaxed),
        s.batch_index_errors.load(Ordering::Relaxed),
        s.batch_index_timeout.load(Ordering::Relaxed),
        state.batch.unused_buffers(),
        s.batch_index_created_buffers.load(Ordering::Relaxed),
        s.batch_index_destroyed_buffers.load(Ordering::Relaxed)
    );
}

fn log_namespace(ns: &Arc<Namespace>) {
    let s = &ns.stats;

    tracing::info!(
        target: "info",
        "{{{}}} objects: all {} master {} prole 0",
        ns.name,
        ns.store.object_count(),
        ns.store.object_count()
    );

    tracing::info!(
        target: "info",
        "{{{}}} client: reads ({},{},{}) writes ({},{}) udf ({},{},{})",
        ns.name,
        s.client_read_success.load(Ordering::Relaxed),
        s.client_read_not_found.load(Ordering::Relaxed),
        s.client_read_error.load(Ordering::Relaxed),
        s.client_write_success.load(Ordering::Relaxed),
        s.client_write_error.load(Ordering::Relaxed),
        s.client_udf_complete.load(Ordering::Relaxed),
        s.client_udf_error.load(Ordering::Relaxed),
        s.client_udf_timeout.load(Ordering::Relaxed)
    );

    let batch_sub_total = s.batch_sub_read_success.load(Ordering::Relaxed)
        + s.batch_sub_read_not_found.load(Ordering::Relaxed)
        + s.batch_sub_read_error.load(Ordering::Relaxed);
    if batch_sub_total != 0 {
        tracing::info!(
            target: "info",
            "{{{}}} batch-sub: reads ({},{},{})",
            ns.name,
            s.batch_sub_read_success.load(Ordering::Relaxed),
            s.batch_sub_read_not_found.load(Ordering::Relaxed),
            s.batch_sub_read_error.load(Ordering::Relaxed)
        );
    }

    let udf_sub_total = s.udf_sub_udf_complete.load(Ordering::Relaxed)
        + s.udf_sub_udf_error.load(Ordering::Relaxed)
        + s.udf_sub_udf_timeout.load(Ordering::Relaxed);
    if udf_sub_total != 0 {
        tracing::info!(
            target: "info",
            "{{{}}} udf-sub: udf ({},{},{})",
            ns.name,
            s.udf_sub_udf_complete.load(Ordering::Relaxed),
            s.udf_sub_udf_error.load(Ordering::Relaxed),
            s.udf_sub_udf_timeout.load(Ordering::Relaxed)
        );
    }
}
