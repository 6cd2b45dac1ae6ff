//! Counters and latency histograms wired through the pipeline.
//!
//! Counters are plain atomics bumped at the point of the event; snapshot
//! structs exist for the ticker and the info protocol so a frame reads one
//! coherent view instead of re-loading atomics mid-line.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

pub fn now_ms() -> u64 {
    now_ns() / 1_000_000
}

pub fn now_secs() -> u64 {
    now_ns() / 1_000_000_000
}

const HIST_BUCKETS: usize = 18;

/// Latency histogram with power-of-two millisecond buckets: bucket 0 holds
/// sub-millisecond points, bucket n holds [2^(n-1), 2^n) ms.
pub struct Histogram {
    name: &'static str,
    count: AtomicU64,
    buckets: [AtomicU64; HIST_BUCKETS],
}

impl Histogram {
    pub fn new(name: &'static str) -> Histogram {
        Histogram {
            name,
            count: AtomicU64::new(0),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Record a data point whose work started at `start_ns`. Returns the
    /// current time so chained stages can reuse it as their start.
    pub fn insert_data_point(&self, start_ns: u64) -> u64 {
        let now = now_ns();
        let ms = now.saturating_sub(start_ns) / 1_000_000;
        self.insert_raw(ms);
        now
    }

    pub fn insert_raw(&self, value_ms: u64) {
        let bucket = if value_ms == 0 {
            0
        } else {
            ((64 - value_ms.leading_zeros()) as usize).min(HIST_BUCKETS - 1)
        };
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Log one frame line; silent when the histogram is empty.
    pub fn dump(&self) {
        let total = self.count();
        if total == 0 {
            return;
        }
        let mut line = String::new();
        for (i, b) in self.buckets.iter().enumerate() {
            let v = b.load(Ordering::Relaxed);
            if v != 0 {
                line.push_str(&format!(" ({i:02}: {v})"));
            }
        }
        tracing::info!(target: "info", "histogram dump: {} ({} total){}", self.name, total, line);
    }
}

/// Node-wide statistics.
pub struct Stats {
    pub proto_connections_opened: AtomicU64,
    pub proto_connections_closed: AtomicU64,
    pub heartbeat_connections_opened: AtomicU64,
    pub heartbeat_connections_closed: AtomicU64,
    pub fabric_connections_opened: AtomicU64,
    pub fabric_connections_closed: AtomicU64,

    pub demarshal_error: AtomicU64,
    pub tsvc_client_error: AtomicU64,
    pub tsvc_batch_sub_error: AtomicU64,
    pub tsvc_udf_sub_error: AtomicU64,
    pub reaper_count: AtomicU64,
    pub info_complete: AtomicU64,

    pub batch_index_initiate: AtomicU64,
    pub batch_index_complete: AtomicU64,
    pub batch_index_errors: AtomicU64,
    pub batch_index_timeout: AtomicU64,
    pub batch_index_created_buffers: AtomicU64,
    pub batch_index_destroyed_buffers: AtomicU64,
    pub batch_index_huge_buffers: AtomicU64,

    pub svc_demarshal_hist: Histogram,
    pub read_hist: Histogram,
    pub write_hist: Histogram,
    pub udf_hist: Histogram,
    pub batch_index_hist: Histogram,
    pub info_hist: Histogram,
}

impl Stats {
    pub fn new() -> Stats {
        Stats {
            proto_connections_opened: AtomicU64::new(0),
            proto_connections_closed: AtomicU64::new(0),
            heartbeat_connections_opened: AtomicU64::new(0),
            heartbeat_connections_closed: AtomicU64::new(0),
            fabric_connections_opened: AtomicU64::new(0),
            fabric_connections_closed: AtomicU64::new(0),
            demarshal_error: AtomicU64::new(0),
            tsvc_client_error: AtomicU64::new(0),
            tsvc_batch_sub_error: AtomicU64::new(0),
            tsvc_udf_sub_error: AtomicU64::new(0),
            reaper_count: AtomicU64::new(0),
            info_complete: AtomicU64::new(0),
            batch_index_initiate: AtomicU64::new(0),
            batch_index_complete: AtomicU64::new(0),
            batch_index_errors: AtomicU64::new(0),
            batch_index_timeout: AtomicU64::new(0),
            batch_index_created_buffers: AtomicU64::new(0),
            batch_index_destroyed_buffers: AtomicU64::new(0),
            batch_index_huge_buffers: AtomicU64::new(0),
            svc_demarshal_hist: Histogram::new("demarshal"),
            read_hist: Histogram::new("reads"),
            write_hist: Histogram::new("writes"),
            udf_hist: Histogram::new("udf"),
            batch_index_hist: Histogram::new("batch-index"),
            info_hist: Histogram::new("info"),
        }
    }

    pub fn open_connections(&self) -> u64 {
        self.proto_connections_opened
            .load(Ordering::Relaxed)
            .saturating_sub(self.proto_connections_closed.load(Ordering::Relaxed))
    }

    pub fn dump_histograms(&self) {
        self.svc_demarshal_hist.dump();
        self.read_hist.dump();
        self.write_hist.dump();
        self.udf_hist.dump();
        self.batch_index_hist.dump();
        self.info_hist.dump();
    }

    /// `k=v;…` rendering for the info protocol.
    pub fn render(&self) -> String {
        let pairs: [(&str, u64); 14] = [
            (
                "proto_connections_opened",
                self.proto_connections_opened.load(Ordering::Relaxed),
            ),
            (
                "proto_connections_closed",
                self.proto_connections_closed.load(Ordering::Relaxed),
            ),
            ("open_connections", self.open_connections()),
            (
                "demarshal_error",
                self.demarshal_error.load(Ordering::Relaxed),
            ),
            ("reaper_count", self.reaper_count.load(Ordering::Relaxed)),
            (
                "batch_index_initiate",
                self.batch_index_initiate.load(Ordering::Relaxed),
            ),
            (
                "batch_index_complete",
                self.batch_index_complete.load(Ordering::Relaxed),
            ),
            (
                "batch_index_errors",
                self.batch_index_errors.load(Ordering::Relaxed),
            ),
            (
                "batch_index_timeout",
                self.batch_index_timeout.load(Ordering::Relaxed),
            ),
            (
                "batch_index_created_buffers",
                self.batch_index_created_buffers.load(Ordering::Relaxed),
            ),
            (
                "batch_index_destroyed_buffers",
                self.batch_index_destroyed_buffers.load(Ordering::Relaxed),
            ),
            (
                "batch_index_huge_buffers",
                self.batch_index_huge_buffers.load(Ordering::Relaxed),
            ),
            (
                "tsvc_client_error",
                self.tsvc_client_error.load(Ordering::Relaxed),
            ),
            ("info_complete", self.info_complete.load(Ordering::Relaxed)),
        ];
        pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(";")
    }
}

impl Default for Stats {
    fn default() -> Self {
        Stats::new()
    }
}

/// Per-namespace statistics.
#[derive(Default)]
pub struct NamespaceStats {
    pub client_tsvc_error: AtomicU64,
    pub client_tsvc_timeout: AtomicU64,
    pub batch_sub_tsvc_error: AtomicU64,
    pub batch_sub_tsvc_timeout: AtomicU64,
    pub udf_sub_tsvc_error: AtomicU64,
    pub udf_sub_tsvc_timeout: AtomicU64,

    pub client_read_success: AtomicU64,
    pub client_read_not_found: AtomicU64,
    pub client_read_error: AtomicU64,
    pub client_write_success: AtomicU64,
    pub client_write_error: AtomicU64,

    pub batch_sub_read_success: AtomicU64,
    pub batch_sub_read_not_found: AtomicU64,
    pub batch_sub_read_error: AtomicU64,

    pub client_udf_complete: AtomicU64,
    pub client_udf_error: AtomicU64,
    pub client_udf_timeout: AtomicU64,
    pub udf_sub_udf_complete: AtomicU64,
    pub udf_sub_udf_error: AtomicU64,
    pub udf_sub_udf_timeout: AtomicU64,

    pub udf_read_reqs: AtomicU64,
    pub udf_read_success: AtomicU64,
    pub udf_write_reqs: AtomicU64,
    pub udf_write_success: AtomicU64,
    pub udf_delete_reqs: AtomicU64,
    pub udf_delete_success: AtomicU64,
    pub lang_error: AtomicU64,

    pub deleted_last_bin: AtomicU64,
}
