//! The batch read engine.
//!
//! A batch request is split into per-row sub-transactions which run
//! independently; their results are packed into fixed-size response blocks
//! shared across sub-transactions and streamed back over the one connection
//! by a pool of response workers.
//!
//! The accounting invariants:
//!
//! - a buffer is created with `writers = 2`: one hold for "the buffer is
//!   current", one for the first reservation. The current-buffer hold is
//!   released the moment the buffer stops being current, so a full buffer can
//!   flush as soon as its last writer commits;
//! - a buffer is enqueued to its response queue exactly when `writers`
//!   reaches zero, and is never touched after that;
//! - the final sub-transaction releases one extra writer so the enclosing
//!   buffer and the trailer can flush;
//! - short batches synthesize phantom rows so the counts still balance and
//!   the shared state is freed exactly once, when the drained response count
//!   reaches the expected row count.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use silo_proto::batch::{parse_batch_header, BatchRows};
use silo_proto::frame::{write_frame_header, FrameType, PROTO_HEADER_SIZE};
use silo_proto::reply::{
    batch_result_size, make_trailer, write_batch_error, write_batch_result, BATCH_ERROR_SIZE,
};
use silo_proto::{Bin, Digest, FieldType, ResultCode};
use tokio::sync::{mpsc, oneshot};

use crate::config::MAX_BATCH_THREADS;
use crate::conn::{end_of_transaction, ClientConn};
use crate::transaction::{Origin, Transaction};
use crate::NodeState;

/// Response block allocation size, including block bookkeeping and the frame
/// header the block is sent under.
pub const BATCH_BLOCK_SIZE: usize = 128 * 1024;

/// Block bookkeeping overhead; the data region holds the rest.
const BATCH_BLOCK_HEADER: usize = 24;

/// Data capacity of a pooled block.
pub const BATCH_BLOCK_CAPACITY: usize = BATCH_BLOCK_SIZE - BATCH_BLOCK_HEADER;

/// Per-row response cap; a larger result errors the row.
pub const BATCH_MAX_RESULT_SIZE: usize = 10 * 1024 * 1024;

/// A response block. Writers copy into disjoint reserved ranges; the
/// `writers` count dropping to zero is the only path to the send queue.
pub struct BatchBuffer {
    capacity: usize,
    data: Mutex<Box<[u8]>>,
    /// Bytes reserved so far. Written only under the owning shared lock.
    size: AtomicUsize,
    /// Rows packed into this block. Written only under the shared lock.
    tran_count: AtomicU32,
    writers: AtomicU32,
    /// Pooled blocks return to the free pool; oversize ones are freed.
    pooled: bool,
}

impl BatchBuffer {
    fn new(capacity: usize, pooled: bool) -> BatchBuffer {
        BatchBuffer {
            capacity,
            data: Mutex::new(vec![0u8; capacity].into_boxed_slice()),
            size: AtomicUsize::new(0),
            tran_count: AtomicU32::new(0),
            writers: AtomicU32::new(0),
            pooled,
        }
    }

    /// Reset for reuse; called under the shared lock at pop time.
    fn reset(&self, first_size: usize) {
        self.size.store(first_size, Ordering::Relaxed);
        self.tran_count.store(1, Ordering::Relaxed);
        // One hold for "buffer is current", one for the first reservation.
        self.writers.store(2, Ordering::Relaxed);
    }

    fn fill(&self, off: usize, len: usize, write: impl FnOnce(&mut [u8])) {
        let mut data = self.data.lock().unwrap();
        write(&mut data[off..off + len]);
    }
}

/// A reserved slot in a block.
struct Slot {
    buffer: Arc<BatchBuffer>,
    off: usize,
    len: usize,
}

/// One entry on a response queue; `None` is the worker stop sentinel.
type WorkItem = Option<BatchResponse>;

struct BatchResponse {
    shared: Arc<BatchShared>,
    buffer: Arc<BatchBuffer>,
}

/// A response worker's queue.
pub struct BatchQueue {
    tx: mpsc::UnboundedSender<WorkItem>,
    /// Buffers queued and not yet drained (soft backpressure signal).
    depth: AtomicI32,
    /// Batches currently assigned to this queue.
    count: AtomicU32,
    active: AtomicBool,
    done: Mutex<Option<oneshot::Receiver<()>>>,
}

impl BatchQueue {
    pub fn buffer_depth(&self) -> i32 {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn batch_count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    fn accepts(&self, max_depth: usize) -> bool {
        self.active.load(Ordering::Relaxed) && self.buffer_depth() < max_depth as i32
    }
}

/// Shared state for one in-flight batch.
pub struct BatchShared {
    start_time: u64,
    tran_max: u32,
    /// First non-ok, non-not-found error sticks; last-writer-wins is
    /// acceptable since any error is sufficient.
    result_code: AtomicU8,
    /// The owning connection; nulled on any send error.
    fd: Mutex<Option<Arc<ClientConn>>>,
    queue: Arc<BatchQueue>,
    /// Serializes response-buffer writers: guards the current-buffer pointer
    /// and the continue-vs-switch decision. Slot writes happen outside it.
    inner: Mutex<BatchSharedInner>,
    /// Rows already drained onto the wire; touched only by the one response
    /// worker draining this batch's queue.
    tran_count_response: AtomicU32,
}

struct BatchSharedInner {
    buffer: Option<Arc<BatchBuffer>>,
    tran_count: u32,
}

impl BatchShared {
    fn stick_result(&self, rc: ResultCode) {
        if !(rc == ResultCode::Ok || rc == ResultCode::NotFound) {
            self.result_code.store(rc as u8, Ordering::Relaxed);
        }
    }

    fn result(&self) -> ResultCode {
        ResultCode::from_wire(self.result_code.load(Ordering::Relaxed))
    }
}

/// Free pool of pooled blocks, capped by configuration.
struct BufferPool {
    free: Mutex<Vec<Arc<BatchBuffer>>>,
}

impl BufferPool {
    fn pop(&self, state: &NodeState, size: usize) -> Arc<BatchBuffer> {
        if size > BATCH_BLOCK_CAPACITY {
            // Oversize result: dedicated allocation, never pooled.
            state
                .stats
                .batch_index_created_buffers
                .fetch_add(1, Ordering::Relaxed);
            state
                .stats
                .batch_index_huge_buffers
                .fetch_add(1, Ordering::Relaxed);
            return Arc::new(BatchBuffer::new(size, false));
        }

        if let Some(buf) = self.free.lock().unwrap().pop() {
            return buf;
        }

        state
            .stats
            .batch_index_created_buffers
            .fetch_add(1, Ordering::Relaxed);
        Arc::new(BatchBuffer::new(BATCH_BLOCK_CAPACITY, true))
    }

    /// Return a drained block to the pool, unless over the unused cap or not
    /// poolable.
    fn push_limit(&self, state: &NodeState, buffer: Arc<BatchBuffer>) {
        if buffer.pooled {
            let mut free = self.free.lock().unwrap();
            if free.len() < state.cfg.batch_max_unused_buffers {
                free.push(buffer);
                return;
            }
        }
        state
            .stats
            .batch_index_destroyed_buffers
            .fetch_add(1, Ordering::Relaxed);
    }

    fn unused(&self) -> usize {
        self.free.lock().unwrap().len()
    }
}

pub struct BatchEngine {
    queues: RwLock<Vec<Arc<BatchQueue>>>,
    pool: BufferPool,
    resize_lock: tokio::sync::Mutex<()>,
}

impl BatchEngine {
    pub fn new() -> BatchEngine {
        BatchEngine {
            queues: RwLock::new(Vec::new()),
            pool: BufferPool {
                free: Mutex::new(Vec::new()),
            },
            resize_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Spawn the configured response workers. Called once at startup, after
    /// the node state exists.
    pub fn start(state: &Arc<NodeState>) {
        let n = state.cfg.batch_index_threads;
        tracing::info!(target: "batch", "initialize batch-index-threads to {n}");
        let mut queues = state.batch.queues.write().unwrap();
        for _ in 0..n {
            queues.push(create_queue(state));
        }
    }

    pub fn thread_count(&self) -> usize {
        self.queues.read().unwrap().len()
    }

    pub fn unused_buffers(&self) -> usize {
        self.pool.unused()
    }

    /// `count:depth` per queue, for the info protocol.
    pub fn queues_info(&self) -> String {
        let queues = self.queues.read().unwrap();
        queues
            .iter()
            .map(|q| format!("{}:{}", q.batch_count(), q.buffer_depth()))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Default for BatchEngine {
    fn default() -> Self {
        BatchEngine::new()
    }
}

fn create_queue(state: &Arc<NodeState>) -> Arc<BatchQueue> {
    let (tx, rx) = mpsc::unbounded_channel();
    let (done_tx, done_rx) = oneshot::channel();
    let queue = Arc::new(BatchQueue {
        tx,
        depth: AtomicI32::new(0),
        count: AtomicU32::new(0),
        active: AtomicBool::new(true),
        done: Mutex::new(Some(done_rx)),
    });
    tokio::spawn(run_worker(Arc::clone(state), rx, done_tx));
    queue
}

/// Search for an alternate queue: backward from the preferred index, then
/// forward. An inactive queue ends the forward search since later queues
/// cannot be active either.
fn find_queue(
    queues: &[Arc<BatchQueue>],
    queue_index: usize,
    max_depth: usize,
) -> Option<Arc<BatchQueue>> {
    for index in (0..queue_index).rev() {
        if queues[index].accepts(max_depth) {
            return Some(Arc::clone(&queues[index]));
        }
    }
    for q in queues.iter().skip(queue_index + 1) {
        if !q.active.load(Ordering::Relaxed) {
            break;
        }
        if q.accepts(max_depth) {
            return Some(Arc::clone(q));
        }
    }
    None
}

/// Send a pre-shared failure: one trailer-shaped error reply, then finish the
/// (parent) transaction.
async fn send_error(state: &Arc<NodeState>, btr: &mut Transaction, rc: ResultCode) {
    if let Some(Origin::Client(conn)) = btr.origin.take() {
        let reply = make_trailer(rc);
        crate::transaction::send_client_reply(state, &conn, reply).await;
    }

    if rc == ResultCode::Timeout {
        state
            .stats
            .batch_index_timeout
            .fetch_add(1, Ordering::Relaxed);
    } else {
        state
            .stats
            .batch_index_errors
            .fetch_add(1, Ordering::Relaxed);
    }
}

/// Entry point: validate and split an incoming batch request, dispatching a
/// sub-transaction per row. Returns once all rows are dispatched (inline rows
/// complete in place); responses stream asynchronously.
pub async fn queue_task(state: &Arc<NodeState>, mut btr: Transaction) {
    let counter = state
        .stats
        .batch_index_initiate
        .fetch_add(1, Ordering::Relaxed);

    let thread_size = state.batch.thread_count();
    if thread_size == 0 || thread_size > MAX_BATCH_THREADS {
        tracing::warn!(target: "batch", "batch-index-threads has been disabled: {thread_size}");
        send_error(state, &mut btr, ResultCode::BatchDisabled).await;
        return;
    }
    let queue_index = (counter % thread_size as u64) as usize;

    // Locate the batch field.
    let batch_field = btr
        .msg
        .fields
        .iter()
        .find(|f| f.ftype == FieldType::Batch || f.ftype == FieldType::BatchWithSet)
        .map(|f| f.value.start);
    let Some(field_off) = batch_field else {
        tracing::warn!(target: "batch", "batch index field not found");
        send_error(state, &mut btr, ResultCode::Parameter).await;
        return;
    };

    let header = match parse_batch_header(&btr.msg.body, field_off) {
        Ok(h) => h,
        Err(_) => {
            send_error(state, &mut btr, ResultCode::Parameter).await;
            return;
        }
    };

    let tran_count = header.tran_count;
    if tran_count == 0 {
        tracing::warn!(target: "batch", "batch request size is zero");
        send_error(state, &mut btr, ResultCode::Parameter).await;
        return;
    }
    if tran_count > state.cfg.batch_max_requests {
        tracing::warn!(
            target: "batch",
            "batch request size {tran_count} exceeds max {}",
            state.cfg.batch_max_requests
        );
        send_error(state, &mut btr, ResultCode::BatchMaxRequests).await;
        return;
    }

    // Pick the response queue; the depth cap is soft but checked first.
    let max_depth = state.cfg.batch_max_buffers_per_queue;
    let queue = {
        let queues = state.batch.queues.read().unwrap();
        let preferred = queues.get(queue_index).cloned();
        match preferred {
            Some(q) if q.accepts(max_depth) => Some(q),
            _ => find_queue(&queues, queue_index, max_depth),
        }
    };
    let Some(queue) = queue else {
        tracing::warn!(target: "batch", "failed to find active batch queue that is not full");
        send_error(state, &mut btr, ResultCode::BatchQueuesFull).await;
        return;
    };
    queue.count.fetch_add(1, Ordering::Relaxed);

    // The batch shared state takes over the connection handle.
    let Some(Origin::Client(conn)) = btr.origin.take() else {
        crate::crash!(crate::fault::Context::Batch, "batch request from non-client origin");
    };

    let shared = Arc::new(BatchShared {
        start_time: btr.start_time,
        tran_max: tran_count,
        result_code: AtomicU8::new(0),
        fd: Mutex::new(Some(conn)),
        queue,
        inner: Mutex::new(BatchSharedInner {
            buffer: None,
            tran_count: 0,
        }),
        tran_count_response: AtomicU32::new(0),
    });

    // Inline eligibility mirrors the namespace storage shape: fully
    // in-memory namespaces may run rows in the dispatching task.
    let any_in_memory = state.namespaces.iter().any(|ns| ns.cfg.data_in_memory);
    let all_in_memory = state.namespaces.iter().all(|ns| ns.cfg.data_in_memory);
    let allow_inline =
        state.cfg.allow_inline_transactions && header.allow_inline != 0 && any_in_memory;
    let check_inline = allow_inline && !all_in_memory;

    // Split rows into single-record read sub-transactions. Row messages
    // reference the original request buffer; no per-row copy is made.
    let mut rows = BatchRows::new(btr.msg.body.clone(), header.rows_off, btr.msg.header.transaction_ttl);
    let mut tran_row = 0u32;

    while tran_row < tran_count {
        let Some(row) = rows.next_row() else { break };

        let mut tr = Transaction::new(
            row.msg,
            Origin::BatchSub {
                shared: Arc::clone(&shared),
                index: row.index,
            },
            btr.start_time,
        );
        tr.keyd = row.keyd;

        let should_inline = if !allow_inline {
            false
        } else if check_inline {
            tr.msg
                .namespace()
                .and_then(|name| state.namespace_by_name(name))
                .map(|ns| ns.cfg.data_in_memory)
                .unwrap_or(false)
        } else {
            true
        };

        if should_inline {
            crate::tsvc::process_transaction(state, tr).await;
        } else {
            let state = Arc::clone(state);
            tokio::spawn(async move {
                crate::tsvc::process_transaction(&state, tr).await;
            });
        }
        tran_row += 1;
    }

    if tran_row < tran_count {
        // Mismatch between the declared count and the data that fit;
        // phantom rows balance the accounting so everything still flushes
        // exactly once.
        tracing::warn!(
            target: "batch",
            "batch keys mismatch, expected {tran_count} received {tran_row}"
        );
        terminate(state, &shared, tran_count - tran_row, ResultCode::Parameter).await;
    }
}

/// Reserve a slot for a result of `size` bytes. The lock covers the
/// current-buffer decision; the returned slot is written outside it.
fn reserve(
    state: &Arc<NodeState>,
    shared: &Arc<BatchShared>,
    size: usize,
    rc: ResultCode,
) -> (Slot, Arc<BatchBuffer>, bool) {
    let (slot, buffer, complete, flushed_prev) = {
        let mut inner = shared.inner.lock().unwrap();
        inner.tran_count += 1;
        let complete = inner.tran_count == shared.tran_max;

        match inner.buffer.clone() {
            None => {
                // No current buffer; open one.
                let buf = state.batch.pool.pop(state, size);
                buf.reset(size);
                inner.buffer = Some(Arc::clone(&buf));
                (
                    Slot {
                        buffer: Arc::clone(&buf),
                        off: 0,
                        len: size,
                    },
                    buf,
                    complete,
                    None,
                )
            }
            Some(buf) if buf.size.load(Ordering::Relaxed) + size <= buf.capacity => {
                // Fits in the current block; take a slot.
                let off = buf.size.fetch_add(size, Ordering::Relaxed);
                buf.tran_count.fetch_add(1, Ordering::Relaxed);
                buf.writers.fetch_add(1, Ordering::Relaxed);
                (
                    Slot {
                        buffer: Arc::clone(&buf),
                        off,
                        len: size,
                    },
                    buf,
                    complete,
                    None,
                )
            }
            Some(prev) => {
                // Doesn't fit; open a new block. The previous one stops
                // being current, which releases its current-buffer hold
                // (outside the lock).
                let buf = state.batch.pool.pop(state, size);
                buf.reset(size);
                inner.buffer = Some(Arc::clone(&buf));
                (
                    Slot {
                        buffer: Arc::clone(&buf),
                        off: 0,
                        len: size,
                    },
                    buf,
                    complete,
                    Some(prev),
                )
            }
        }
    };

    if let Some(prev) = flushed_prev {
        buffer_complete(shared, &prev);
    }

    // Any transaction's error code will do, as long as it's an error.
    shared.stick_result(rc);

    (slot, buffer, complete)
}

/// Release one writer; at zero the block goes to the response queue and is
/// never modified again.
fn buffer_complete(shared: &Arc<BatchShared>, buffer: &Arc<BatchBuffer>) {
    let prev = buffer.writers.fetch_sub(1, Ordering::AcqRel);
    if prev == 0 {
        crate::crash!(
            crate::fault::Context::Batch,
            "batch buffer released after flush"
        );
    }
    if prev == 1 {
        shared.queue.depth.fetch_add(1, Ordering::Relaxed);
        let _ = shared.queue.tx.send(Some(BatchResponse {
            shared: Arc::clone(shared),
            buffer: Arc::clone(buffer),
        }));
    }
}

/// Commit a finished sub-transaction: release its writer, plus the extra
/// completion writer when this was the batch's final row.
fn transaction_end(shared: &Arc<BatchShared>, buffer: &Arc<BatchBuffer>, complete: bool) {
    buffer_complete(shared, buffer);
    if complete {
        buffer_complete(shared, buffer);
    }
}

/// Append one row result.
#[allow(clippy::too_many_arguments)]
pub async fn add_result(
    state: &Arc<NodeState>,
    shared: &Arc<BatchShared>,
    index: u32,
    keyd: &Digest,
    rc: ResultCode,
    generation: u32,
    void_time: u32,
    set_name: Option<&str>,
    bins: &[Bin],
) {
    let set_bytes = set_name.map(|s| s.as_bytes().to_vec());
    let size = batch_result_size(set_bytes.as_deref(), bins);

    if size > BATCH_MAX_RESULT_SIZE {
        tracing::warn!(target: "batch", "record size {size} exceeds max {BATCH_MAX_RESULT_SIZE}");
        add_error(state, shared, index, ResultCode::RecordTooBig).await;
        return;
    }

    let (slot, buffer, complete) = reserve(state, shared, size, rc);
    slot.buffer.fill(slot.off, slot.len, |out| {
        write_batch_result(
            out,
            index,
            keyd,
            rc,
            generation,
            void_time,
            set_bytes.as_deref(),
            bins,
        );
    });
    transaction_end(shared, &buffer, complete);
}

/// Append one row error.
pub async fn add_error(
    state: &Arc<NodeState>,
    shared: &Arc<BatchShared>,
    index: u32,
    rc: ResultCode,
) {
    let (slot, buffer, complete) = reserve(state, shared, BATCH_ERROR_SIZE, rc);
    slot.buffer.fill(slot.off, slot.len, |out| {
        write_batch_error(out, index, rc);
    });
    transaction_end(shared, &buffer, complete);
}

/// Terminate a short batch by adding phantom rows to the shared and buffer
/// counts, so memory is released at the end exactly once.
async fn terminate(
    state: &Arc<NodeState>,
    shared: &Arc<BatchShared>,
    phantom_count: u32,
    rc: ResultCode,
) {
    let (buffer, complete) = {
        let mut inner = shared.inner.lock().unwrap();
        shared.result_code.store(rc as u8, Ordering::Relaxed);
        inner.tran_count += phantom_count;
        let complete = inner.tran_count == shared.tran_max;

        match inner.buffer.clone() {
            None => {
                let buf = state.batch.pool.pop(state, 0);
                buf.reset(0);
                // Phantom rows only; override the first-reservation count.
                buf.tran_count.store(phantom_count, Ordering::Relaxed);
                inner.buffer = Some(Arc::clone(&buf));
                (buf, complete)
            }
            Some(buf) => {
                buf.tran_count.fetch_add(phantom_count, Ordering::Relaxed);
                buf.writers.fetch_add(1, Ordering::Relaxed);
                (buf, complete)
            }
        }
    };

    transaction_end(shared, &buffer, complete);
}

/// Response worker: drains one queue, sending blocks to each batch's
/// connection and finishing batches whose rows have all drained.
async fn run_worker(
    state: Arc<NodeState>,
    mut rx: mpsc::UnboundedReceiver<WorkItem>,
    done: oneshot::Sender<()>,
) {
    while let Some(item) = rx.recv().await {
        let Some(response) = item else {
            // Stop sentinel (downward resize).
            break;
        };

        let shared = response.shared;
        let buffer = response.buffer;
        shared.queue.depth.fetch_sub(1, Ordering::Relaxed);

        let drained = shared
            .tran_count_response
            .fetch_add(buffer.tran_count.load(Ordering::Relaxed), Ordering::Relaxed)
            + buffer.tran_count.load(Ordering::Relaxed);

        send_buffer(&state, &shared, &buffer).await;
        state.batch.pool.push_limit(&state, buffer);

        // All rows drained: send the trailer and free the shared state.
        if drained == shared.tran_max {
            send_final(&state, &shared).await;
            shared.queue.count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    let _ = done.send(());
}

async fn send_buffer(state: &Arc<NodeState>, shared: &Arc<BatchShared>, buffer: &Arc<BatchBuffer>) {
    // Don't send data blocks once an error has stuck or the connection died;
    // the trailer carries the error.
    if !shared.result().is_ok() {
        return;
    }
    let conn = {
        let fd = shared.fd.lock().unwrap();
        fd.clone()
    };
    let Some(conn) = conn else { return };

    let size = buffer.size.load(Ordering::Acquire);
    let mut head = [0u8; PROTO_HEADER_SIZE];
    write_frame_header(&mut head, FrameType::Data, size as u64);

    // No writers remain once a block is queued; snapshot the filled region
    // for the send.
    let body: Vec<u8> = {
        let data = buffer.data.lock().unwrap();
        data[..size].to_vec()
    };

    if let Err(e) = conn.send_parts(&head, &body).await {
        // Frequent when clients time out; keep it quiet.
        tracing::debug!(target: "batch", "batch send response error: {e}");
        end_of_transaction(&state.stats, &conn, true).await;
        *shared.fd.lock().unwrap() = None;
        state
            .stats
            .batch_index_errors
            .fetch_add(1, Ordering::Relaxed);
    }
}

async fn send_final(state: &Arc<NodeState>, shared: &Arc<BatchShared>) {
    let rc = shared.result();

    let conn = shared.fd.lock().unwrap().take();
    if let Some(conn) = conn {
        let trailer = make_trailer(rc);
        let ok = conn.send(&trailer).await.is_ok();
        end_of_transaction(&state.stats, &conn, !ok).await;

        // Timeouts stay out of the histogram but are counted.
        if rc != ResultCode::Timeout {
            state
                .stats
                .batch_index_hist
                .insert_data_point(shared.start_time);
        }

        if ok && rc.is_ok() {
            state
                .stats
                .batch_index_complete
                .fetch_add(1, Ordering::Relaxed);
            return;
        }
    }

    if rc == ResultCode::Timeout {
        state
            .stats
            .batch_index_timeout
            .fetch_add(1, Ordering::Relaxed);
    } else {
        state
            .stats
            .batch_index_errors
            .fetch_add(1, Ordering::Relaxed);
    }
}

/// Resize the response worker pool. Growing creates queues and workers
/// upward; shrinking drains the surplus queues (30 s limit, abort and
/// reactivate on timeout) before stopping their workers.
pub async fn threads_resize(state: &Arc<NodeState>, threads: usize) -> anyhow::Result<()> {
    if threads > MAX_BATCH_THREADS {
        anyhow::bail!("batch-index-threads {threads} exceeds max {MAX_BATCH_THREADS}");
    }

    let _guard = state.batch.resize_lock.lock().await;

    let orig = state.batch.thread_count();
    tracing::info!(target: "batch", "resize batch-index-threads from {orig} to {threads}");

    if threads == orig {
        return Ok(());
    }

    if threads > orig {
        let mut queues = state.batch.queues.write().unwrap();
        for _ in orig..threads {
            queues.push(create_queue(state));
        }
        return Ok(());
    }

    // Shrink: deactivate the surplus so new batches are not assigned there.
    let surplus: Vec<Arc<BatchQueue>> = {
        let queues = state.batch.queues.read().unwrap();
        queues[threads..].to_vec()
    };
    for q in &surplus {
        q.active.store(false, Ordering::Relaxed);
    }

    // Wait for in-flight batches to drain, up to 30 seconds.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    tokio::time::sleep(Duration::from_millis(50)).await;
    loop {
        if surplus.iter().all(|q| q.batch_count() == 0) {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            tracing::warn!(
                target: "batch",
                "batch shutdown threads failed on timeout, transactions remain on queue"
            );
            for q in &surplus {
                q.active.store(true, Ordering::Relaxed);
            }
            anyhow::bail!("batch thread resize timed out");
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    // Stop the surplus workers and collect their completions.
    for q in &surplus {
        let _ = q.tx.send(None);
    }
    for q in &surplus {
        let done = q.done.lock().unwrap().take();
        if let Some(done) = done {
            let _ = done.await;
        }
    }

    state.batch.queues.write().unwrap().truncate(threads);
    Ok(())
}
