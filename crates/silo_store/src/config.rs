//! Node configuration: defaults, JSON config file, CLI overrides.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use serde::{Deserialize, Serialize};

/// Hard ceiling on batch response workers.
pub const MAX_BATCH_THREADS: usize = 64;

/// Read consistency override for a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReadConsistency {
    #[default]
    One,
    All,
}

/// Write commit level override for a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum WriteCommitLevel {
    #[default]
    All,
    Master,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NamespaceConfig {
    pub name: String,
    /// In-memory namespaces are eligible for inline batch sub-transactions.
    pub data_in_memory: bool,
    /// Flash-backed namespaces keep records in a keyspace under this path.
    pub storage_path: Option<PathBuf>,
    pub replication_factor: u32,
    /// Arms cross-DC shipping of write events.
    pub xdr_enabled: bool,
    /// Reject writes that arrived via cross-DC when set.
    pub forbid_xdr_writes: bool,
    pub read_consistency_level_override: ReadConsistency,
    pub write_commit_level_override: WriteCommitLevel,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        NamespaceConfig {
            name: "test".into(),
            data_in_memory: true,
            storage_path: None,
            replication_factor: 1,
            xdr_enabled: false,
            forbid_xdr_writes: false,
            read_consistency_level_override: ReadConsistency::One,
            write_commit_level_override: WriteCommitLevel::All,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SinkConfig {
    /// File path; absent means stdout.
    pub path: Option<PathBuf>,
    /// Default severity for every context: critical|warning|info|debug|detail.
    pub level: String,
    /// Per-context overrides, e.g. `{"batch": "detail"}`.
    pub contexts: std::collections::HashMap<String, String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            path: None,
            level: "info".into(),
            contexts: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub node_id: u64,
    pub service_addr: SocketAddr,
    pub localhost_addr: Option<SocketAddr>,
    pub xdr_addr: Option<SocketAddr>,

    pub service_threads: usize,
    pub transaction_queues: usize,
    pub transaction_threads_per_queue: usize,

    /// Open connection cap; zero means derive from the fd limit.
    pub proto_fd_max: u64,
    pub proto_fd_idle_ms: u64,
    /// Seconds between authentication refreshes by the reaper.
    pub privilege_refresh_period: u64,

    pub batch_index_threads: usize,
    pub batch_max_buffers_per_queue: usize,
    pub batch_max_unused_buffers: usize,
    pub batch_max_requests: u32,

    pub allow_inline_transactions: bool,
    pub transaction_max_ms: u64,
    pub respond_client_on_master_completion: bool,
    pub write_duplicate_resolution_disable: bool,

    pub ticker_interval: u64,

    pub namespaces: Vec<NamespaceConfig>,
    pub log: Vec<SinkConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            node_id: 0,
            service_addr: "127.0.0.1:3000".parse().unwrap(),
            localhost_addr: None,
            xdr_addr: None,
            service_threads: 4,
            transaction_queues: 4,
            transaction_threads_per_queue: 4,
            proto_fd_max: 15_000,
            proto_fd_idle_ms: 60_000,
            privilege_refresh_period: 300,
            batch_index_threads: 4,
            batch_max_buffers_per_queue: 255,
            batch_max_unused_buffers: 256,
            batch_max_requests: 5_000,
            allow_inline_transactions: true,
            transaction_max_ms: 1_000,
            respond_client_on_master_completion: false,
            write_duplicate_resolution_disable: false,
            ticker_interval: 10,
            namespaces: vec![NamespaceConfig::default()],
            log: vec![SinkConfig::default()],
        }
    }
}

impl Config {
    pub fn namespace(&self, name: &str) -> Option<&NamespaceConfig> {
        self.namespaces.iter().find(|n| n.name == name)
    }
}

/// Command line for the node binary. Flags override the config file.
#[derive(Debug, Parser)]
#[command(name = "silo-node", about = "Silo key-value node")]
pub struct NodeArgs {
    /// JSON configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub node_id: Option<u64>,

    #[arg(long)]
    pub service_addr: Option<SocketAddr>,

    #[arg(long)]
    pub localhost_addr: Option<SocketAddr>,

    #[arg(long)]
    pub xdr_addr: Option<SocketAddr>,

    #[arg(long)]
    pub service_threads: Option<usize>,

    #[arg(long)]
    pub batch_index_threads: Option<usize>,

    #[arg(long)]
    pub proto_fd_max: Option<u64>,

    #[arg(long)]
    pub proto_fd_idle_ms: Option<u64>,

    #[arg(long)]
    pub transaction_max_ms: Option<u64>,

    #[arg(long)]
    pub ticker_interval: Option<u64>,

    #[arg(long)]
    pub respond_client_on_master_completion: bool,
}

impl NodeArgs {
    /// Resolve the effective configuration: file, then flag overrides.
    pub fn resolve(&self) -> anyhow::Result<Config> {
        let mut cfg = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Config::default(),
        };

        if let Some(v) = self.node_id {
            cfg.node_id = v;
        }
        if let Some(v) = self.service_addr {
            cfg.service_addr = v;
        }
        if let Some(v) = self.localhost_addr {
            cfg.localhost_addr = Some(v);
        }
        if let Some(v) = self.xdr_addr {
            cfg.xdr_addr = Some(v);
        }
        if let Some(v) = self.service_threads {
            cfg.service_threads = v;
        }
        if let Some(v) = self.batch_index_threads {
            cfg.batch_index_threads = v;
        }
        if let Some(v) = self.proto_fd_max {
            cfg.proto_fd_max = v;
        }
        if let Some(v) = self.proto_fd_idle_ms {
            cfg.proto_fd_idle_ms = v;
        }
        if let Some(v) = self.transaction_max_ms {
            cfg.transaction_max_ms = v;
        }
        if let Some(v) = self.ticker_interval {
            cfg.ticker_interval = v;
        }
        if self.respond_client_on_master_completion {
            cfg.respond_client_on_master_completion = true;
        }

        if cfg.batch_index_threads > MAX_BATCH_THREADS {
            anyhow::bail!(
                "batch-index-threads {} exceeds max {MAX_BATCH_THREADS}",
                cfg.batch_index_threads
            );
        }
        if cfg.namespaces.is_empty() {
            anyhow::bail!("at least one namespace must be configured");
        }

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.batch_max_requests, 5_000);
        assert!(cfg.allow_inline_transactions);
        assert_eq!(cfg.namespaces.len(), 1);
    }

    #[test]
    fn config_json_round_trip() {
        let cfg = Config::default();
        let raw = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.transaction_max_ms, cfg.transaction_max_ms);
        assert_eq!(back.namespaces[0].name, "test");
    }

    #[test]
    fn partial_config_fills_defaults() {
        let back: Config =
            serde_json::from_str(r#"{"ticker-interval": 3, "namespaces": [{"name": "prod"}]}"#)
                .unwrap();
        assert_eq!(back.ticker_interval, 3);
        assert_eq!(back.namespaces[0].name, "prod");
        assert!(back.namespaces[0].data_in_memory);
        assert_eq!(back.proto_fd_max, 15_000);
    }
}
