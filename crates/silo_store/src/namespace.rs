//! Namespaces, partitions, reservations, and the record store contract.
//!
//! The storage engine proper (defrag, eviction, device management) lives
//! behind the [`RecordStore`] trait; this module provides the two engines the
//! node runs with - an in-memory map and a flash-backed fjall keyspace - plus
//! the partition reservation bookkeeping the transaction core depends on.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle};
use silo_proto::pickle::{self, PickledRecord};
use silo_proto::{Bin, Digest};

use crate::config::NamespaceConfig;
use crate::fault::Context;
use crate::stats::{now_secs, NamespaceStats};

/// Partitions per namespace. Partition id is the low 12 bits of the digest.
pub const N_PARTITIONS: usize = 4096;

/// A stored record. The storage engine owns durability; this is the view the
/// transaction core reads and writes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub generation: u32,
    /// Epoch seconds at which the record expires; zero means never.
    pub void_time: u32,
    pub last_update_time: u64,
    pub set_name: Option<String>,
    pub key: Option<Vec<u8>>,
    pub bins: Vec<Bin>,
}

impl Record {
    pub fn is_expired(&self, now_secs: u64) -> bool {
        self.void_time != 0 && now_secs > u64::from(self.void_time)
    }

    pub fn bin(&self, name: &[u8]) -> Option<&Bin> {
        self.bins.iter().find(|b| b.name.as_bytes() == name)
    }

    pub fn to_pickled(&self) -> PickledRecord {
        PickledRecord {
            generation: self.generation,
            void_time: self.void_time,
            last_update_time: self.last_update_time,
            set_name: self.set_name.clone(),
            key: self.key.clone(),
            bins: self.bins.clone(),
        }
    }

    pub fn from_pickled(p: PickledRecord) -> Record {
        Record {
            generation: p.generation,
            void_time: p.void_time,
            last_update_time: p.last_update_time,
            set_name: p.set_name,
            key: p.key,
            bins: p.bins,
        }
    }
}

/// Contract with the storage engine beneath the transaction core.
pub trait RecordStore: Send + Sync {
    fn get(&self, keyd: &Digest) -> Option<Record>;
    fn put(&self, keyd: &Digest, rec: &Record);
    /// Returns true when a record existed.
    fn delete(&self, keyd: &Digest) -> bool;
    fn object_count(&self) -> u64;
    /// Storage write-queue backpressure signal; transactions are shed while
    /// this holds.
    fn overloaded(&self) -> bool {
        false
    }

    /// Force the backpressure signal (operational tooling and tests).
    fn set_overloaded(&self, _on: bool) {}
}

/// In-memory record store.
pub struct MemoryStore {
    map: RwLock<HashMap<Digest, Record>>,
    overloaded: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore {
            map: RwLock::new(HashMap::new()),
            overloaded: AtomicBool::new(false),
        }
    }

}

impl Default for MemoryStore {
    fn default() -> Self {
        MemoryStore::new()
    }
}

impl RecordStore for MemoryStore {
    fn get(&self, keyd: &Digest) -> Option<Record> {
        self.map.read().unwrap().get(keyd).cloned()
    }

    fn put(&self, keyd: &Digest, rec: &Record) {
        self.map.write().unwrap().insert(*keyd, rec.clone());
    }

    fn delete(&self, keyd: &Digest) -> bool {
        self.map.write().unwrap().remove(keyd).is_some()
    }

    fn object_count(&self) -> u64 {
        self.map.read().unwrap().len() as u64
    }

    fn overloaded(&self) -> bool {
        self.overloaded.load(Ordering::Relaxed)
    }

    fn set_overloaded(&self, on: bool) {
        self.overloaded.store(on, Ordering::Relaxed);
    }
}

/// Flash-backed record store over a fjall keyspace partition. Records are
/// stored pickled, keyed by digest.
pub struct FjallStore {
    _keyspace: Arc<Keyspace>,
    records: PartitionHandle,
    count: AtomicU64,
}

impl FjallStore {
    pub fn open(keyspace: Arc<Keyspace>, ns_name: &str) -> anyhow::Result<FjallStore> {
        let records = keyspace.open_partition(
            &format!("records_{ns_name}"),
            PartitionCreateOptions::default(),
        )?;
        let count = records.approximate_len() as u64;
        Ok(FjallStore {
            _keyspace: keyspace,
            records,
            count: AtomicU64::new(count),
        })
    }
}

impl RecordStore for FjallStore {
    fn get(&self, keyd: &Digest) -> Option<Record> {
        match self.records.get(keyd.0) {
            Ok(Some(bytes)) => match pickle::unpickle(&bytes) {
                Ok(p) => Some(Record::from_pickled(p)),
                Err(e) => {
                    tracing::warn!(target: "storage", "bad pickled record for {}: {e}", keyd);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(target: "storage", "flash read failed for {}: {e}", keyd);
                None
            }
        }
    }

    fn put(&self, keyd: &Digest, rec: &Record) {
        let existed = matches!(self.records.get(keyd.0), Ok(Some(_)));
        if let Err(e) = self.records.insert(keyd.0, pickle::pickle(&rec.to_pickled())) {
            tracing::warn!(target: "storage", "flash write failed for {}: {e}", keyd);
            return;
        }
        if !existed {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn delete(&self, keyd: &Digest) -> bool {
        let existed = matches!(self.records.get(keyd.0), Ok(Some(_)));
        if existed {
            if let Err(e) = self.records.remove(keyd.0) {
                tracing::warn!(target: "storage", "flash delete failed for {}: {e}", keyd);
                return false;
            }
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        existed
    }

    fn object_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Per-partition state owned by the placement layer; the core reads replica
/// and duplicate sets and tracks in-flight reservations.
#[derive(Default)]
pub struct Partition {
    in_flight: AtomicI32,
    /// Peer nodes holding replicas of this partition.
    pub replicas: Mutex<Vec<u64>>,
    /// Peer nodes that may hold newer copies, pending migration.
    pub duplicates: Mutex<Vec<u64>>,
}

pub struct Namespace {
    pub id: u32,
    pub name: String,
    pub cfg: NamespaceConfig,
    pub store: Box<dyn RecordStore>,
    pub partitions: Vec<Partition>,
    pub stats: NamespaceStats,
}

impl Namespace {
    pub fn new(id: u32, cfg: NamespaceConfig, store: Box<dyn RecordStore>) -> Namespace {
        let mut partitions = Vec::with_capacity(N_PARTITIONS);
        partitions.resize_with(N_PARTITIONS, Partition::default);
        Namespace {
            id,
            name: cfg.name.clone(),
            cfg,
            store,
            partitions,
            stats: NamespaceStats::default(),
        }
    }

    /// Reserve a partition for the duration of a transaction. The reservation
    /// snapshots the partition's duplicate and replica sets.
    pub fn reserve(self: &Arc<Namespace>, pid: u16) -> Reservation {
        let p = &self.partitions[pid as usize];
        p.in_flight.fetch_add(1, Ordering::Relaxed);
        Reservation {
            ns: Arc::clone(self),
            pid,
            duplicates: p.duplicates.lock().unwrap().clone(),
            replicas: p.replicas.lock().unwrap().clone(),
            released: false,
        }
    }

    fn release(&self, pid: u16) {
        let left = self.partitions[pid as usize]
            .in_flight
            .fetch_sub(1, Ordering::Relaxed);
        if left <= 0 {
            crate::crash!(
                Context::Namespace,
                "{{{}}} partition {} released more than reserved",
                self.name,
                pid
            );
        }
    }

    /// Set a partition's duplicate-holding peers (placement layer / tests).
    pub fn set_duplicates(&self, pid: u16, nodes: Vec<u64>) {
        *self.partitions[pid as usize].duplicates.lock().unwrap() = nodes;
    }

    /// Set a partition's replica peers (placement layer / tests).
    pub fn set_replicas(&self, pid: u16, nodes: Vec<u64>) {
        *self.partitions[pid as usize].replicas.lock().unwrap() = nodes;
    }

    /// Open a record, treating expired records as absent.
    pub fn get_live(&self, keyd: &Digest) -> Option<Record> {
        let rec = self.store.get(keyd)?;
        if rec.is_expired(now_secs()) {
            return None;
        }
        Some(rec)
    }
}

/// A held claim on one namespace partition. Released exactly once: either
/// explicitly or on drop.
pub struct Reservation {
    pub ns: Arc<Namespace>,
    pub pid: u16,
    pub duplicates: Vec<u64>,
    pub replicas: Vec<u64>,
    released: bool,
}

impl Reservation {
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.ns.release(self.pid);
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Build the namespaces from configuration. Flash-backed namespaces open
/// their keyspace under the configured path.
pub fn build_namespaces(configs: &[NamespaceConfig]) -> anyhow::Result<Vec<Arc<Namespace>>> {
    let mut out = Vec::with_capacity(configs.len());
    for (i, cfg) in configs.iter().enumerate() {
        let store: Box<dyn RecordStore> = match (&cfg.storage_path, cfg.data_in_memory) {
            (Some(path), _) => {
                let keyspace = Arc::new(fjall::Config::new(path).open()?);
                Box::new(FjallStore::open(keyspace, &cfg.name)?)
            }
            (None, true) => Box::new(MemoryStore::new()),
            (None, false) => anyhow::bail!(
                "namespace {} is not in-memory and has no storage path",
                cfg.name
            ),
        };
        out.push(Arc::new(Namespace::new(i as u32, cfg.clone(), store)));
    }
    Ok(out)
}
