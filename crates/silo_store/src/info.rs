//! Info protocol: newline/semicolon separated text commands answered with
//! `name\tvalue\n` lines over an info-type frame.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use silo_proto::frame::{write_frame_header, FrameType, PROTO_HEADER_SIZE};

use crate::conn::ClientConn;
use crate::NodeState;

/// Handle one info request and finish the transaction.
pub async fn handle(state: &Arc<NodeState>, conn: Arc<ClientConn>, body: Bytes) {
    let start = crate::stats::now_ns();
    let text = String::from_utf8_lossy(&body);
    let mut out = String::new();

    for cmd in text.split(|c| c == ';' || c == '\n').map(str::trim) {
        if cmd.is_empty() {
            continue;
        }
        answer(state, cmd, &mut out).await;
    }

    let mut reply = vec![0u8; PROTO_HEADER_SIZE];
    write_frame_header(&mut reply, FrameType::Info, out.len() as u64);
    reply.extend_from_slice(out.as_bytes());

    crate::transaction::send_client_reply(state, &conn, Bytes::from(reply)).await;
    state.stats.info_complete.fetch_add(1, Ordering::Relaxed);
    state.stats.info_hist.insert_data_point(start);
}

async fn answer(state: &Arc<NodeState>, cmd: &str, out: &mut String) {
    let value = match cmd {
        "status" => "ok".to_string(),
        "build" => env!("CARGO_PKG_VERSION").to_string(),
        "node" => format!("{:x}", state.cfg.node_id),
        "namespaces" => state
            .namespaces
            .iter()
            .map(|ns| ns.name.clone())
            .collect::<Vec<_>>()
            .join(";"),
        "statistics" => state.stats.render(),
        "batch-index" => state.batch.queues_info(),
        "batch-index-unused-buffers" => state.batch.unused_buffers().to_string(),
        "rw-hash" => state.inflight.len().to_string(),
        "logs" => crate::fault::sink_list(),
        "log-roll" => {
            crate::fault::log_roll();
            "ok".to_string()
        }
        _ => match cmd.split_once('=') {
            Some(("batch-index-threads", n)) => match n.parse::<usize>() {
                Ok(n) => match crate::batch::threads_resize(state, n).await {
                    Ok(()) => "ok".to_string(),
                    Err(e) => format!("error: {e}"),
                },
                Err(_) => "error: bad value".to_string(),
            },
            // Unknown commands answer empty rather than failing the frame.
            _ => String::new(),
        },
    };

    out.push_str(cmd);
    out.push('\t');
    out.push_str(&value);
    out.push('\n');
}
