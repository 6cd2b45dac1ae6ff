//! Shared helpers for integration tests: an embedded node plus a minimal
//! wire-protocol client.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use silo_proto::frame::{parse_frame_header, HeaderDecode, ProtoHeader, PROTO_HEADER_SIZE};
use silo_proto::msg::{MsgBuilder, INFO1_BATCH, INFO1_GET_ALL, INFO1_READ, INFO2_WRITE, OP_WRITE};
use silo_proto::{Bin, Digest, FieldType, FrameType, ParsedMsg, Particle};
use silo_store::config::Config;
use silo_store::replica::{Fabric, LoopbackFabric, XdrSink};
use silo_store::script::{NativeScriptEngine, ScriptEngine};
use silo_store::NodeHandle;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Per-operation timeout for wire round-trips.
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.service_addr = "127.0.0.1:0".parse().unwrap();
    cfg.node_id = 0xbeef;
    cfg.ticker_interval = 3600;
    cfg
}

/// Start a node with the default loopback collaborators.
pub async fn start_node(
    cfg: Config,
) -> (NodeHandle, Arc<LoopbackFabric>, Arc<NativeScriptEngine>) {
    silo_store::start_default_node(cfg)
        .await
        .expect("node failed to start")
}

/// Start a node with a capturing cross-DC sink.
pub async fn start_node_with_xdr(
    cfg: Config,
    xdr: Arc<dyn XdrSink>,
) -> (NodeHandle, Arc<LoopbackFabric>, Arc<NativeScriptEngine>) {
    let fabric = Arc::new(LoopbackFabric::new());
    let scripts = Arc::new(NativeScriptEngine::new());
    let handle = silo_store::start_node(
        cfg,
        Arc::clone(&fabric) as Arc<dyn Fabric>,
        Arc::clone(&scripts) as Arc<dyn ScriptEngine>,
        xdr,
    )
    .await
    .expect("node failed to start");
    fabric.set_node(&handle.state);
    (handle, fabric, scripts)
}

pub fn digest(last: u8) -> Digest {
    let mut d = [0u8; 20];
    d[19] = last;
    Digest(d)
}

/// Minimal wire client.
pub struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    pub async fn connect(handle: &NodeHandle) -> TestClient {
        let stream = TcpStream::connect(handle.service_addr)
            .await
            .expect("connect failed");
        stream.set_nodelay(true).unwrap();
        TestClient { stream }
    }

    pub async fn send(&mut self, frame: &[u8]) {
        tokio::time::timeout(IO_TIMEOUT, self.stream.write_all(frame))
            .await
            .expect("send timed out")
            .expect("send failed");
    }

    pub async fn send_raw_header(&mut self, version: u8, frame_type: u8, sz: u64) {
        let mut head = [0u8; PROTO_HEADER_SIZE];
        head[0] = version;
        head[1] = frame_type;
        head[2..8].copy_from_slice(&sz.to_be_bytes()[2..8]);
        self.send(&head).await;
    }

    /// Read one frame; panics on timeout or EOF.
    pub async fn read_frame(&mut self) -> (ProtoHeader, Bytes) {
        match self.try_read_frame().await {
            Some(frame) => frame,
            None => panic!("connection closed while expecting a frame"),
        }
    }

    /// Read one frame; `None` on clean EOF.
    pub async fn try_read_frame(&mut self) -> Option<(ProtoHeader, Bytes)> {
        let mut head = [0u8; PROTO_HEADER_SIZE];
        let n = tokio::time::timeout(IO_TIMEOUT, self.stream.read_exact(&mut head))
            .await
            .expect("read timed out");
        if n.is_err() {
            return None;
        }

        let header = match parse_frame_header(&head) {
            HeaderDecode::Complete(h) => h,
            other => panic!("bad reply frame header: {other:?}"),
        };

        let mut body = BytesMut::with_capacity(header.sz as usize);
        body.resize(header.sz as usize, 0);
        tokio::time::timeout(IO_TIMEOUT, self.stream.read_exact(&mut body))
            .await
            .expect("read timed out")
            .expect("body read failed");

        Some((header, body.freeze()))
    }

    /// Read one data frame and parse its message.
    pub async fn read_msg(&mut self) -> ParsedMsg {
        let (header, body) = self.read_frame().await;
        assert_eq!(header.frame_type, FrameType::Data);
        ParsedMsg::parse(body).expect("unparseable reply")
    }

    /// True when the server has closed the connection (EOF), polling up to
    /// the timeout.
    pub async fn expect_eof(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(
            tokio::time::timeout(IO_TIMEOUT, self.stream.read(&mut byte)).await,
            Ok(Ok(0))
        )
    }
}

/// Build a single-record read request (get-all).
pub fn read_request(ns: &str, keyd: Digest) -> Bytes {
    let mut b = MsgBuilder::new();
    b.info1 = INFO1_READ | INFO1_GET_ALL;
    b.field(FieldType::Namespace, ns.as_bytes().to_vec())
        .field(FieldType::Digest, keyd.0.to_vec())
        .build_frame()
}

/// Build a single-record write request.
pub fn write_request(ns: &str, keyd: Digest, bins: &[(&str, Particle)]) -> Bytes {
    let mut b = MsgBuilder::new();
    b.info2 = INFO2_WRITE;
    let mut b = b
        .field(FieldType::Namespace, ns.as_bytes().to_vec())
        .field(FieldType::Digest, keyd.0.to_vec());
    for (name, value) in bins {
        b = b.op(OP_WRITE, Bin::new(*name, value.clone()));
    }
    b.build_frame()
}

/// Build a UDF apply request.
pub fn udf_request(ns: &str, keyd: Digest, module: &str, function: &str, args: &[u8]) -> Bytes {
    MsgBuilder::new()
        .field(FieldType::Namespace, ns.as_bytes().to_vec())
        .field(FieldType::Digest, keyd.0.to_vec())
        .field(FieldType::UdfFilename, module.as_bytes().to_vec())
        .field(FieldType::UdfFunction, function.as_bytes().to_vec())
        .field(FieldType::UdfArgList, args.to_vec())
        .build_frame()
}

/// Build a batch read request: full first row per digest-run, repeat rows
/// reuse the previous namespace.
pub fn batch_request(ns: &str, rows: &[(u32, Digest)], declared_count: Option<u32>) -> Bytes {
    let mut payload = Vec::new();
    let count = declared_count.unwrap_or(rows.len() as u32);
    payload.extend_from_slice(&count.to_be_bytes());
    payload.push(1); // allow inline

    for (i, (index, keyd)) in rows.iter().enumerate() {
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&keyd.0);
        if i == 0 {
            payload.push(0); // full row
            payload.push(INFO1_READ | INFO1_GET_ALL);
            payload.extend_from_slice(&1u16.to_be_bytes()); // n_fields
            payload.extend_from_slice(&0u16.to_be_bytes()); // n_ops
            payload.extend_from_slice(&((ns.len() + 1) as u32).to_be_bytes());
            payload.push(FieldType::Namespace as u8);
            payload.extend_from_slice(ns.as_bytes());
        } else {
            payload.push(1); // repeat row
        }
    }

    let mut b = MsgBuilder::new();
    b.info1 = INFO1_READ | INFO1_BATCH;
    b.raw_field(FieldType::Batch as u8, payload).build_frame()
}

/// Poll a condition until it holds or a second passes.
pub async fn wait_for(mut cond: impl FnMut() -> bool) {
    for _ in 0..100 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within one second");
}

/// Pull the value of a named bin out of a reply message.
pub fn reply_bin(msg: &ParsedMsg, name: &str) -> Option<Particle> {
    msg.ops.iter().find_map(|op| {
        if msg.op_name(op) == name.as_bytes() {
            Particle::from_wire(op.particle_type, msg.op_value(op))
        } else {
            None
        }
    })
}
