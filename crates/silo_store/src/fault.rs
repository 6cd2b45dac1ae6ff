//! Severity-filtered logging with per-subsystem contexts and runtime
//! configurable sinks.
//!
//! Events flow through `tracing`; call sites tag a subsystem context via the
//! event target (`warn!(target: "batch", ...)`). The [`SinkLayer`] installed
//! at startup routes each event to every sink whose per-context severity
//! threshold admits it. Thresholds are atomics so the hot-path filter never
//! locks.
//!
//! A critical event terminates the process with a backtrace; the no-stack
//! variant terminates without collecting one (for use inside backtrace
//! handling itself). Tests flip [`set_panic_on_crash`] so the termination
//! paths become catchable panics.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context as LayerContext, Layer};
use tracing_subscriber::registry::LookupSpan;

/// Maximum number of registered sinks.
pub const MAX_SINKS: usize = 8;

/// Subsystem contexts. One per major component; the string form doubles as
/// the tracing target at call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    Misc,
    Alloc,
    Socket,
    Service,
    Proto,
    Conn,
    Tsvc,
    Rw,
    Batch,
    Udf,
    Namespace,
    Storage,
    Fabric,
    Info,
    Security,
    Xdr,
}

pub const N_CONTEXTS: usize = 16;

impl Context {
    pub const ALL: [Context; N_CONTEXTS] = [
        Context::Misc,
        Context::Alloc,
        Context::Socket,
        Context::Service,
        Context::Proto,
        Context::Conn,
        Context::Tsvc,
        Context::Rw,
        Context::Batch,
        Context::Udf,
        Context::Namespace,
        Context::Storage,
        Context::Fabric,
        Context::Info,
        Context::Security,
        Context::Xdr,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Context::Misc => "misc",
            Context::Alloc => "alloc",
            Context::Socket => "socket",
            Context::Service => "service",
            Context::Proto => "proto",
            Context::Conn => "conn",
            Context::Tsvc => "tsvc",
            Context::Rw => "rw",
            Context::Batch => "batch",
            Context::Udf => "udf",
            Context::Namespace => "namespace",
            Context::Storage => "storage",
            Context::Fabric => "fabric",
            Context::Info => "info",
            Context::Security => "security",
            Context::Xdr => "xdr",
        }
    }

    pub fn from_name(name: &str) -> Option<Context> {
        Context::ALL.iter().copied().find(|c| c.name() == name)
    }

    /// Map an event target to a context. Targets that aren't one of ours
    /// (dependencies logging under module paths) land in `Misc`.
    fn from_target(target: &str) -> Context {
        Context::from_name(target).unwrap_or(Context::Misc)
    }

    fn index(self) -> usize {
        Context::ALL.iter().position(|c| *c == self).unwrap()
    }
}

/// Ordered severities; lower value is more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Severity {
    Critical = 0,
    Warning = 1,
    Info = 2,
    Debug = 3,
    Detail = 4,
}

impl Severity {
    pub fn name(self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::Warning => "WARNING",
            Severity::Info => "INFO",
            Severity::Debug => "DEBUG",
            Severity::Detail => "DETAIL",
        }
    }

    pub fn from_name(name: &str) -> Option<Severity> {
        match name {
            "critical" => Some(Severity::Critical),
            "warning" => Some(Severity::Warning),
            "info" => Some(Severity::Info),
            "debug" => Some(Severity::Debug),
            "detail" => Some(Severity::Detail),
            _ => None,
        }
    }

    fn from_level(level: &Level) -> Severity {
        match *level {
            Level::ERROR => Severity::Critical,
            Level::WARN => Severity::Warning,
            Level::INFO => Severity::Info,
            Level::DEBUG => Severity::Debug,
            Level::TRACE => Severity::Detail,
        }
    }

    fn from_u8(v: u8) -> Severity {
        match v {
            0 => Severity::Critical,
            1 => Severity::Warning,
            2 => Severity::Info,
            3 => Severity::Debug,
            _ => Severity::Detail,
        }
    }
}

/// One log endpoint: stdout or a file path, with per-context thresholds.
pub struct Sink {
    path: Option<PathBuf>,
    out: Mutex<Box<dyn Write + Send>>,
    thresholds: [AtomicU8; N_CONTEXTS],
}

impl Sink {
    fn stdout(default: Severity) -> Sink {
        Sink {
            path: None,
            out: Mutex::new(Box::new(io::stdout())),
            thresholds: std::array::from_fn(|_| AtomicU8::new(default as u8)),
        }
    }

    fn file(path: PathBuf, default: Severity) -> io::Result<Sink> {
        let f = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Sink {
            path: Some(path),
            out: Mutex::new(Box::new(f)),
            thresholds: std::array::from_fn(|_| AtomicU8::new(default as u8)),
        })
    }

    pub fn set_context(&self, ctx: Context, sev: Severity) {
        self.thresholds[ctx.index()].store(sev as u8, Ordering::Relaxed);
    }

    pub fn set_all(&self, sev: Severity) {
        for t in &self.thresholds {
            t.store(sev as u8, Ordering::Relaxed);
        }
    }

    fn admits(&self, ctx: Context, sev: Severity) -> bool {
        sev as u8 <= self.thresholds[ctx.index()].load(Ordering::Relaxed)
    }

    /// Reopen a file-backed sink under its path, to cooperate with external
    /// rotation. Stdout sinks are untouched.
    fn reopen(&self) -> io::Result<()> {
        if let Some(path) = &self.path {
            let f = OpenOptions::new().create(true).append(true).open(path)?;
            *self.out.lock().unwrap() = Box::new(f);
        }
        Ok(())
    }
}

struct Fault {
    sinks: RwLock<Vec<std::sync::Arc<Sink>>>,
    /// Fast-path pre-filter: per context, the most permissive threshold across
    /// all sinks. Call sites read one atomic to short-circuit argument
    /// evaluation.
    filter: [AtomicU8; N_CONTEXTS],
    panic_on_crash: AtomicBool,
}

static FAULT: OnceLock<Fault> = OnceLock::new();

fn fault() -> &'static Fault {
    FAULT.get_or_init(|| Fault {
        sinks: RwLock::new(vec![std::sync::Arc::new(Sink::stdout(Severity::Info))]),
        filter: std::array::from_fn(|_| AtomicU8::new(Severity::Info as u8)),
        panic_on_crash: AtomicBool::new(false),
    })
}

fn refresh_filter() {
    let f = fault();
    let sinks = f.sinks.read().unwrap();
    for ctx in Context::ALL {
        let max = sinks
            .iter()
            .map(|s| s.thresholds[ctx.index()].load(Ordering::Relaxed))
            .max()
            .unwrap_or(Severity::Critical as u8);
        f.filter[ctx.index()].store(max, Ordering::Relaxed);
    }
}

/// Fast-path filter check; true when at least one sink would emit.
pub fn enabled(ctx: Context, sev: Severity) -> bool {
    sev as u8 <= fault().filter[ctx.index()].load(Ordering::Relaxed)
}

/// Current effective threshold for a context (most permissive sink).
pub fn threshold(ctx: Context) -> Severity {
    Severity::from_u8(fault().filter[ctx.index()].load(Ordering::Relaxed))
}

/// Register a sink. `path` of `None` means stdout. Returns the sink handle so
/// the caller can adjust per-context thresholds.
pub fn add_sink(
    path: Option<PathBuf>,
    default: Severity,
) -> anyhow::Result<std::sync::Arc<Sink>> {
    let sink = match path {
        None => Sink::stdout(default),
        Some(p) => Sink::file(p, default)?,
    };
    let sink = std::sync::Arc::new(sink);
    {
        let mut sinks = fault().sinks.write().unwrap();
        if sinks.len() >= MAX_SINKS {
            anyhow::bail!("too many log sinks ({MAX_SINKS} max)");
        }
        sinks.push(sink.clone());
    }
    refresh_filter();
    Ok(sink)
}

/// Replace the default stdout sink; used by startup before adding configured
/// sinks.
pub fn clear_sinks() {
    fault().sinks.write().unwrap().clear();
    refresh_filter();
}

/// Apply a threshold change to a sink and refresh the fast-path filter.
pub fn set_sink_context(sink: &Sink, ctx: Context, sev: Severity) {
    sink.set_context(ctx, sev);
    refresh_filter();
}

pub fn set_sink_all(sink: &Sink, sev: Severity) {
    sink.set_all(sev);
    refresh_filter();
}

/// Reopen all file-backed sinks under their paths.
pub fn log_roll() {
    let sinks = fault().sinks.read().unwrap();
    for sink in sinks.iter() {
        if let Err(e) = sink.reopen() {
            // Can't use the sinks to report this; stderr is the fallback.
            eprintln!("log roll failed: {e}");
        }
    }
}

/// One line per sink: `id:path:contexts` summary for the info protocol.
pub fn sink_list() -> String {
    let sinks = fault().sinks.read().unwrap();
    sinks
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let path = s
                .path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "stdout".into());
            format!("{i}:{path}")
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// When set, the crash paths panic instead of aborting the process.
pub fn set_panic_on_crash(on: bool) {
    fault().panic_on_crash.store(on, Ordering::Relaxed);
}

/// Terminate the process after logging a critical event and a backtrace.
pub fn crash(ctx: Context, msg: String) -> ! {
    tracing::error!(target: "misc", "{}", format_args!("({}) {}", ctx.name(), msg));
    let bt = std::backtrace::Backtrace::force_capture();
    for line in bt.to_string().lines() {
        tracing::warn!(target: "misc", "stacktrace: {line}");
    }
    terminate(msg)
}

/// Terminate without collecting a backtrace.
pub fn crash_nostack(ctx: Context, msg: String) -> ! {
    tracing::error!(target: "misc", "{}", format_args!("({}) {}", ctx.name(), msg));
    terminate(msg)
}

fn terminate(msg: String) -> ! {
    if fault().panic_on_crash.load(Ordering::Relaxed) {
        panic!("{msg}");
    }
    std::process::exit(1);
}

/// `crash!(Context::Batch, "...")` - critical failure, with backtrace.
#[macro_export]
macro_rules! crash {
    ($ctx:expr, $($arg:tt)*) => {
        $crate::fault::crash($ctx, format!($($arg)*))
    };
}

/// `crash_nostack!(Context::Misc, "...")` - critical failure, no backtrace.
#[macro_export]
macro_rules! crash_nostack {
    ($ctx:expr, $($arg:tt)*) => {
        $crate::fault::crash_nostack($ctx, format!($($arg)*))
    };
}

/// The tracing layer that fans events out to the registered sinks.
pub struct SinkLayer;

impl<S> Layer<S> for SinkLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let meta = event.metadata();
        let ctx = Context::from_target(meta.target());
        let sev = Severity::from_level(meta.level());

        if !enabled(ctx, sev) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let line = format!(
            "{}: {} ({}): ({}:{}) {}\n",
            format_timestamp(),
            sev.name(),
            ctx.name(),
            meta.file().unwrap_or("?"),
            meta.line().unwrap_or(0),
            visitor.message
        );

        let sinks = fault().sinks.read().unwrap();
        for sink in sinks.iter() {
            if sink.admits(ctx, sev) {
                if let Ok(mut out) = sink.out.lock() {
                    let _ = out.write_all(line.as_bytes());
                }
            }
        }
    }
}

/// Install the sink layer as the global subscriber. Idempotent so embedded
/// nodes in tests can call it freely.
pub fn init_subscriber() {
    use tracing_subscriber::layer::SubscriberExt;
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(SinkLayer),
    );
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        use std::fmt::Write;
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            let _ = write!(self.message, "{}={value:?}", field.name());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        use std::fmt::Write;
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            if !self.message.is_empty() {
                self.message.push(' ');
            }
            let _ = write!(self.message, "{}={value}", field.name());
        }
    }
}

/// `Mon DD YYYY HH:MM:SS GMT` from the wall clock.
fn format_timestamp() -> String {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];

    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let days = (secs / 86_400) as i64;
    let tod = secs % 86_400;
    let (y, m, d) = civil_from_days(days);

    format!(
        "{} {:02} {} {:02}:{:02}:{:02} GMT",
        MONTHS[(m - 1) as usize],
        d,
        y,
        tod / 3600,
        (tod % 3600) / 60,
        tod % 60
    )
}

// Gregorian date from days since the epoch (Howard Hinnant's civil algorithm).
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Display styles for binary payload logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayStyle {
    /// Packed hex, no prefix - the digest form.
    HexDigest,
    /// `0x` prefixed, one space between bytes.
    HexSpaced,
    /// `0x` prefixed, packed.
    HexPacked,
    /// Rows of sixteen space-separated bytes.
    HexColumns,
    Base64,
    /// One space between each byte's bits.
    BitsSpaced,
    /// Rows of eight space-separated bit groups.
    BitsColumns,
}

/// Render a binary payload per the requested style, for inclusion in a log
/// message.
pub fn format_binary(data: &[u8], style: DisplayStyle) -> String {
    match style {
        DisplayStyle::HexDigest => data.iter().map(|b| format!("{b:02x}")).collect(),
        DisplayStyle::HexPacked => {
            let mut s = String::from("0x");
            for b in data {
                s.push_str(&format!("{b:02x}"));
            }
            s
        }
        DisplayStyle::HexSpaced => {
            let mut s = String::from("0x");
            for (i, b) in data.iter().enumerate() {
                if i > 0 {
                    s.push(' ');
                }
                s.push_str(&format!("{b:02x}"));
            }
            s
        }
        DisplayStyle::HexColumns => {
            let mut s = String::new();
            for (i, b) in data.iter().enumerate() {
                if i > 0 {
                    s.push(if i % 16 == 0 { '\n' } else { ' ' });
                }
                s.push_str(&format!("{b:02x}"));
            }
            s
        }
        DisplayStyle::Base64 => base64::engine::general_purpose::STANDARD.encode(data),
        DisplayStyle::BitsSpaced => {
            let mut s = String::new();
            for (i, b) in data.iter().enumerate() {
                if i > 0 {
                    s.push(' ');
                }
                s.push_str(&format!("{b:08b}"));
            }
            s
        }
        DisplayStyle::BitsColumns => {
            let mut s = String::new();
            for (i, b) in data.iter().enumerate() {
                if i > 0 {
                    s.push(if i % 8 == 0 { '\n' } else { ' ' });
                }
                s.push_str(&format!("{b:08b}"));
            }
            s
        }
    }
}
