//! Network front end: listeners, per-connection receive state, and dispatch
//! of completed frames into the transaction service.
//!
//! Each accepted connection is pinned to one reader task for its lifetime.
//! The reader accumulates partial header and body bytes across reads,
//! validates the frame header as soon as it is complete (rejecting over-cap
//! sizes before allocating the body), and pauses reading while a dispatched
//! transaction is in flight. End-of-transaction resumes the reader; any
//! bytes that arrived alongside the previous frame are already buffered and
//! are consumed on resume.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use silo_proto::frame::{parse_frame_header, HeaderDecode, ProtoHeader, PROTO_HEADER_SIZE};
use silo_proto::msg::MSG_HEADER_SIZE;
use silo_proto::{FrameType, ParsedMsg, ResultCode};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};

use crate::conn::{ClientConn, ConnKind};
use crate::stats::{now_ms, now_ns};
use crate::transaction::{Origin, Transaction};
use crate::NodeState;

/// XDR connections carry bulk shipping traffic and get enlarged buffers.
const XDR_READ_BUFFER_SIZE: usize = 15 * 1024 * 1024;
const XDR_WRITE_BUFFER_SIZE: usize = 5 * 1024 * 1024;

/// Bind the configured listeners and spawn their accept loops. Returns the
/// bound addresses (useful when binding port zero).
pub async fn run_listeners(state: &Arc<NodeState>) -> anyhow::Result<Vec<(ConnKind, SocketAddr)>> {
    let mut bound = Vec::new();

    let service = TcpListener::bind(state.cfg.service_addr).await?;
    let addr = service.local_addr()?;
    tracing::info!(target: "service", "service started: socket {addr}");
    bound.push((ConnKind::Service, addr));
    tokio::spawn(accept_loop(Arc::clone(state), service, ConnKind::Service));

    if let Some(loopback) = state.cfg.localhost_addr {
        let listener = TcpListener::bind(loopback).await?;
        let addr = listener.local_addr()?;
        tracing::info!(target: "service", "service also listening on localhost socket {addr}");
        bound.push((ConnKind::Loopback, addr));
        tokio::spawn(accept_loop(Arc::clone(state), listener, ConnKind::Loopback));
    }

    if let Some(xdr) = state.cfg.xdr_addr {
        let listener = TcpListener::bind(xdr).await?;
        let addr = listener.local_addr()?;
        tracing::info!(target: "service", "service also listening on XDR socket {addr}");
        bound.push((ConnKind::Xdr, addr));
        tokio::spawn(accept_loop(Arc::clone(state), listener, ConnKind::Xdr));
    }

    Ok(bound)
}

async fn accept_loop(state: Arc<NodeState>, listener: TcpListener, kind: ConnKind) {
    let mut last_cap_warn_ms = 0u64;

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                // Out of descriptors or a transient accept failure; don't
                // take the listener down over it.
                tracing::warn!(target: "service", "accept failed: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };

        if state.is_shutdown() {
            return;
        }

        tracing::trace!(target: "service", "new connection: {peer}");

        // Enforce the open-connection cap, except for XDR listeners.
        let open = state.stats.open_connections();
        if kind != ConnKind::Xdr && open > state.cfg.proto_fd_max {
            let now = now_ms();
            if now - last_cap_warn_ms > 5_000 {
                tracing::warn!(
                    target: "service",
                    "dropping incoming client connection: hit limit {open} connections"
                );
                last_cap_warn_ms = now;
            }
            drop(stream);
            continue;
        }

        let _ = stream.set_nodelay(true);
        if kind == ConnKind::Xdr {
            configure_xdr_socket(&stream);
        }

        let (read, write) = stream.into_split();
        let Some(conn) = state.conns.insert(peer, kind, write) else {
            tracing::info!(target: "service", "unable to add socket to file handle table");
            continue;
        };

        state
            .stats
            .proto_connections_opened
            .fetch_add(1, Ordering::Relaxed);
        tokio::spawn(run_connection(Arc::clone(&state), conn, read));
    }
}

/// Verify and apply the enlarged XDR socket buffers, checking the kernel
/// limits the way an operator would.
fn configure_xdr_socket(stream: &TcpStream) {
    verify_buffer_limit("/proc/sys/net/core/rmem_max", XDR_READ_BUFFER_SIZE);
    verify_buffer_limit("/proc/sys/net/core/wmem_max", XDR_WRITE_BUFFER_SIZE);

    let sock = socket2::SockRef::from(stream);
    if let Err(e) = sock.set_recv_buffer_size(XDR_READ_BUFFER_SIZE) {
        tracing::warn!(target: "service", "failed to set XDR receive buffer: {e}");
    }
    if let Err(e) = sock.set_send_buffer_size(XDR_WRITE_BUFFER_SIZE) {
        tracing::warn!(target: "service", "failed to set XDR send buffer: {e}");
    }
}

fn verify_buffer_limit(proc_path: &str, want: usize) {
    match std::fs::read_to_string(proc_path) {
        Ok(raw) => match raw.trim().parse::<usize>() {
            Ok(have) if have < want => {
                tracing::warn!(
                    target: "service",
                    "buffer limit is {have}, should be at least {want}; please set {proc_path} accordingly"
                );
            }
            Ok(_) => {}
            Err(_) => {
                tracing::warn!(target: "service", "invalid integer value in {proc_path}");
            }
        },
        Err(_) => {
            tracing::warn!(target: "service", "failed to read {proc_path}; should be at least {want}");
        }
    }
}

/// Per-connection reader: accumulate, validate, dispatch, pause, resume.
async fn run_connection(state: Arc<NodeState>, conn: Arc<ClientConn>, mut read: OwnedReadHalf) {
    let mut buf = BytesMut::with_capacity(8 * 1024);

    'conn: loop {
        // Assemble the fixed header; reject bad frames before reading the
        // body so an over-cap size never allocates.
        let header = loop {
            match parse_frame_header(&buf) {
                HeaderDecode::Complete(h) => break h,
                HeaderDecode::Incomplete => {
                    if !read_some(&conn, &mut read, &mut buf).await {
                        break 'conn;
                    }
                }
                HeaderDecode::Invalid(e) => {
                    tracing::warn!(
                        target: "service",
                        "proto input from {}: {e}, closing connection",
                        conn.peer
                    );
                    state.stats.demarshal_error.fetch_add(1, Ordering::Relaxed);
                    break 'conn;
                }
            }
        };

        // Drain body reads until the frame is complete; short reads leave
        // the already-received bytes buffered.
        let frame_len = PROTO_HEADER_SIZE + header.sz as usize;
        while buf.len() < frame_len {
            if !read_some(&conn, &mut read, &mut buf).await {
                break 'conn;
            }
        }

        buf.advance(PROTO_HEADER_SIZE);
        let body = buf.split_to(header.sz as usize).freeze();

        // It's only really live if it's injecting a transaction.
        conn.touch();

        // Pause reads while the transaction is in progress; the response
        // path resumes them via end-of-transaction.
        conn.pause();
        let txn_ref = conn.reserve();
        dispatch_frame(&state, txn_ref, header, body).await;

        conn.wait_resume().await;
        if conn.is_killed() {
            break 'conn;
        }
    }

    state.conns.remove(&state.stats, &conn);
    conn.release(&state.stats);
}

/// One read from the socket into the accumulation buffer; false on EOF,
/// error, or kill.
async fn read_some(conn: &Arc<ClientConn>, read: &mut OwnedReadHalf, buf: &mut BytesMut) -> bool {
    tokio::select! {
        n = read.read_buf(buf) => match n {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(target: "service", "receive socket: {e}, closing connection");
                false
            }
        },
        _ = conn.wait_kill() => false,
    }
}

/// Route one complete frame.
async fn dispatch_frame(
    state: &Arc<NodeState>,
    conn: Arc<ClientConn>,
    header: ProtoHeader,
    body: Bytes,
) {
    match header.frame_type {
        FrameType::Info => crate::info::handle(state, conn, body).await,
        FrameType::Security => {
            // Authentication is an external collaborator; answer plainly so
            // old clients keep working, and keep the descriptor.
            let reply = silo_proto::reply::make_error_reply(ResultCode::UnsupportedFeature, 0);
            crate::transaction::send_client_reply(state, &conn, reply).await;
        }
        FrameType::DataCompressed => {
            match decompress_frame(&body) {
                Ok((inner_header, inner_body)) => {
                    Box::pin(dispatch_frame(state, conn, inner_header, inner_body)).await;
                }
                Err(e) => {
                    tracing::warn!(target: "service", "proto decompression failed: {e}");
                    crate::transaction::demarshal_error(state, &conn, ResultCode::Unknown).await;
                }
            }
        }
        FrameType::Data => handle_data(state, conn, body).await,
    }
}

/// Compressed body: `uncompressed_size u64 BE` followed by a zstd block
/// holding a complete inner frame.
fn decompress_frame(body: &[u8]) -> anyhow::Result<(ProtoHeader, Bytes)> {
    anyhow::ensure!(body.len() > 8, "short compressed body");
    let declared = u64::from_be_bytes(body[..8].try_into().unwrap());

    let raw = zstd::stream::decode_all(&body[8..])?;
    anyhow::ensure!(
        raw.len() as u64 == declared,
        "unwrapped size {} does not match declared {declared}",
        raw.len()
    );

    let header = match parse_frame_header(&raw) {
        HeaderDecode::Complete(h) => h,
        other => anyhow::bail!("unusable unwrapped proto: {other:?}"),
    };
    anyhow::ensure!(
        header.frame_type == FrameType::Data,
        "unwrapped frame is not a data frame"
    );
    anyhow::ensure!(
        raw.len() == PROTO_HEADER_SIZE + header.sz as usize,
        "unwrapped frame length mismatch"
    );

    let inner = Bytes::from(raw).slice(PROTO_HEADER_SIZE..);
    Ok((header, inner))
}

async fn handle_data(state: &Arc<NodeState>, conn: Arc<ClientConn>, body: Bytes) {
    if body.len() < MSG_HEADER_SIZE {
        tracing::warn!(
            target: "proto",
            "proto body size {} smaller than message header",
            body.len()
        );
        crate::transaction::demarshal_error(state, &conn, ResultCode::Unknown).await;
        return;
    }

    // Walk fields and ops to host order and flag which fields are present,
    // so downstream stages never re-parse.
    let msg = match ParsedMsg::parse(body) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(target: "proto", "bad data message from {}: {e}", conn.peer);
            crate::transaction::demarshal_error(state, &conn, ResultCode::Parameter).await;
            return;
        }
    };

    let start = now_ns();
    let mut tr = Transaction::new(msg, Origin::Client(conn), start);
    tr.benchmark_time = state.stats.svc_demarshal_hist.insert_data_point(start);

    // Fast path for batch requests.
    if tr.msg.is_batch() {
        crate::batch::queue_task(state, tr).await;
        return;
    }

    crate::tsvc::process_transaction(state, tr).await;
}
