//! Reference-counted client connection handles and the idle reaper.
//!
//! Handles live in a process-wide slot table sized from the file-descriptor
//! limit, with free slots tracked in a queue. The logical reference count is
//! explicit (table + reader task + one per in-flight transaction); the drop
//! to zero is the single close event. The reaper walks the table once per
//! second, refreshing authentication on a period and killing idle handles.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Notify;

use crate::fault::Context;
use crate::stats::{now_ms, Stats};

/// Which listener accepted the connection. XDR connections are exempt from
/// the open-connection cap and get enlarged socket buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnKind {
    Service,
    Loopback,
    Xdr,
}

pub struct ClientConn {
    pub slot: usize,
    pub peer: SocketAddr,
    pub kind: ConnKind,
    write: tokio::sync::Mutex<OwnedWriteHalf>,
    pub last_used_ms: AtomicU64,
    refs: AtomicI32,
    pub reap_me: AtomicBool,
    pub do_not_reap: AtomicBool,
    trans_active: AtomicBool,
    /// Authentication cache slot; the reaper refreshes it on a period.
    pub auth_refreshed_ms: AtomicU64,
    resume: Notify,
    kill: Notify,
    killed: AtomicBool,
    closed: AtomicBool,
}

impl ClientConn {
    fn new(slot: usize, peer: SocketAddr, kind: ConnKind, write: OwnedWriteHalf) -> ClientConn {
        let now = now_ms();
        ClientConn {
            slot,
            peer,
            kind,
            write: tokio::sync::Mutex::new(write),
            last_used_ms: AtomicU64::new(now),
            refs: AtomicI32::new(2), // table + reader task
            reap_me: AtomicBool::new(false),
            do_not_reap: AtomicBool::new(false),
            trans_active: AtomicBool::new(false),
            auth_refreshed_ms: AtomicU64::new(now),
            resume: Notify::new(),
            kill: Notify::new(),
            killed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn touch(&self) {
        self.last_used_ms.store(now_ms(), Ordering::Relaxed);
    }

    /// Stop reading from the connection while a transaction is in flight.
    pub fn pause(&self) {
        self.trans_active.store(true, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.trans_active.load(Ordering::Acquire)
    }

    /// Take another logical reference (one per in-flight transaction).
    pub fn reserve(self: &Arc<Self>) -> Arc<ClientConn> {
        self.refs.fetch_add(1, Ordering::AcqRel);
        Arc::clone(self)
    }

    /// Release one logical reference. Reaching zero is the single close
    /// event; going below is corruption.
    pub fn release(&self, stats: &Stats) {
        let left = self.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        if left > 0 {
            return;
        }
        if left < 0 {
            crate::crash!(Context::Conn, "release file handle: negative ref-count {left}");
        }
        if self.closed.swap(true, Ordering::AcqRel) {
            crate::crash!(Context::Conn, "file handle {} closed twice", self.slot);
        }
        stats.proto_connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Write a full buffer to the peer.
    pub async fn send(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut w = self.write.lock().await;
        w.write_all(bytes).await
    }

    /// Write a header-prefixed block as one logical send: both parts go out
    /// under a single hold of the writer, so blocks never interleave.
    pub async fn send_parts(&self, head: &[u8], body: &[u8]) -> std::io::Result<()> {
        let mut w = self.write.lock().await;
        w.write_all(head).await?;
        w.write_all(body).await
    }

    /// Shut the socket down so the peer sees EOF and the reader task exits.
    pub async fn kill(&self) {
        if !self.killed.swap(true, Ordering::AcqRel) {
            let mut w = self.write.lock().await;
            let _ = w.shutdown().await;
        }
        self.kill.notify_waiters();
        self.kill.notify_one();
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub async fn wait_kill(&self) {
        self.kill.notified().await;
    }

    pub async fn wait_resume(&self) {
        self.resume.notified().await;
    }

    fn idle_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_used_ms.load(Ordering::Relaxed))
    }
}

/// End of transaction: the single operation every origin invokes after
/// emitting its response. Resumes reads on the connection and releases the
/// transaction's reference. The force-close variant shuts the socket first so
/// the peer sees EOF.
pub async fn end_of_transaction(stats: &Stats, conn: &Arc<ClientConn>, force_close: bool) {
    if !conn.trans_active.swap(false, Ordering::AcqRel) {
        crate::crash!(
            Context::Conn,
            "end of transaction on idle handle (slot {})",
            conn.slot
        );
    }

    if force_close {
        conn.kill().await;
    }

    // Reads were paused at dispatch; hand the connection back to its reader.
    conn.resume.notify_one();
    conn.release(stats);
}

pub struct ConnRegistry {
    slots: Mutex<Vec<Option<Arc<ClientConn>>>>,
    free: Mutex<VecDeque<usize>>,
}

impl ConnRegistry {
    pub fn new(size: usize) -> ConnRegistry {
        ConnRegistry {
            slots: Mutex::new((0..size).map(|_| None).collect()),
            free: Mutex::new((0..size).collect()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn in_use(&self) -> usize {
        self.capacity() - self.free.lock().unwrap().len()
    }

    /// Insert a freshly accepted connection. `None` when the table is full.
    pub fn insert(
        &self,
        peer: SocketAddr,
        kind: ConnKind,
        write: OwnedWriteHalf,
    ) -> Option<Arc<ClientConn>> {
        let slot = self.free.lock().unwrap().pop_front()?;
        let conn = Arc::new(ClientConn::new(slot, peer, kind, write));
        self.slots.lock().unwrap()[slot] = Some(Arc::clone(&conn));
        Some(conn)
    }

    /// Remove a connection from the table (reader exit path), releasing the
    /// table's reference.
    pub fn remove(&self, stats: &Stats, conn: &Arc<ClientConn>) {
        let taken = {
            let mut slots = self.slots.lock().unwrap();
            let is_ours = slots[conn.slot]
                .as_ref()
                .is_some_and(|held| Arc::ptr_eq(held, conn));
            if is_ours {
                slots[conn.slot].take()
            } else {
                None
            }
        };
        if let Some(held) = taken {
            self.free.lock().unwrap().push_back(conn.slot);
            held.release(stats);
        }
    }

    fn snapshot(&self) -> Vec<Arc<ClientConn>> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .cloned()
            .collect()
    }
}

/// Reaper task: runs once per second, closing handles idle past the
/// threshold (unless protected) and refreshing authentication on its period.
pub async fn run_reaper(state: Arc<crate::NodeState>) {
    let mut last_refresh = now_ms();

    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if state.is_shutdown() {
            return;
        }

        let now = now_ms();
        let kill_ms = state.cfg.proto_fd_idle_ms;
        let refresh = now - last_refresh > state.cfg.privilege_refresh_period * 1000;
        if refresh {
            last_refresh = now;
        }

        let mut inuse = 0u64;
        for conn in state.conns.snapshot() {
            if refresh {
                // External authentication is a collaborator; the cache slot
                // just records the refresh.
                conn.auth_refreshed_ms.store(now, Ordering::Relaxed);
            }

            if conn.reap_me.load(Ordering::Relaxed) {
                tracing::debug!(target: "conn", "reaping slot {} as requested", conn.slot);
                conn.kill().await;
            } else if kill_ms != 0 && conn.idle_ms(now) > kill_ms {
                if conn.do_not_reap.load(Ordering::Relaxed) {
                    inuse += 1;
                    continue;
                }
                tracing::debug!(target: "conn", "reaping idle connection slot {} ({})", conn.slot, conn.peer);
                conn.kill().await;
                state.stats.reaper_count.fetch_add(1, Ordering::Relaxed);
            } else {
                inuse += 1;
            }
        }

        let capacity = state.conns.capacity() as u64;
        if capacity / 10 > capacity.saturating_sub(inuse) {
            tracing::warn!(target: "conn", "less than ten percent file handles remaining: {} max {} inuse", capacity, inuse);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pair() -> (OwnedWriteHalf, tokio::net::TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_read, write) = server.into_split();
        (write, client)
    }

    #[tokio::test]
    async fn registry_slots_cycle() {
        let registry = ConnRegistry::new(2);
        let stats = Stats::new();

        let (w1, _c1) = test_pair().await;
        let (w2, _c2) = test_pair().await;
        let (w3, _c3) = test_pair().await;

        let a = registry
            .insert("127.0.0.1:9999".parse().unwrap(), ConnKind::Service, w1)
            .unwrap();
        let _b = registry
            .insert("127.0.0.1:9998".parse().unwrap(), ConnKind::Service, w2)
            .unwrap();
        assert!(registry
            .insert("127.0.0.1:9997".parse().unwrap(), ConnKind::Service, w3)
            .is_none());

        registry.remove(&stats, &a);
        a.release(&stats); // reader's own reference
        assert_eq!(registry.in_use(), 1);
        assert_eq!(stats.proto_connections_closed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn transaction_reference_defers_close() {
        let registry = ConnRegistry::new(1);
        let stats = Stats::new();
        let (w, _c) = test_pair().await;
        let conn = registry
            .insert("127.0.0.1:9999".parse().unwrap(), ConnKind::Service, w)
            .unwrap();

        let txn_ref = conn.reserve();
        registry.remove(&stats, &conn);
        conn.release(&stats); // reader reference
        assert_eq!(stats.proto_connections_closed.load(Ordering::Relaxed), 0);

        conn.pause();
        end_of_transaction(&stats, &txn_ref, false).await;
        assert_eq!(stats.proto_connections_closed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "end of transaction on idle handle")]
    async fn double_end_of_transaction_is_critical() {
        crate::fault::set_panic_on_crash(true);
        let registry = ConnRegistry::new(1);
        let stats = Stats::new();
        let (w, _c) = test_pair().await;
        let conn = registry
            .insert("127.0.0.1:9999".parse().unwrap(), ConnKind::Service, w)
            .unwrap();

        conn.pause();
        let r1 = conn.reserve();
        let r2 = conn.reserve();
        end_of_transaction(&stats, &r1, false).await;
        end_of_transaction(&stats, &r2, false).await;
    }
}
