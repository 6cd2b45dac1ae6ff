//! Silo node binary: configuration, log sinks, and the runtime.

use clap::Parser;
use silo_store::config::NodeArgs;
use silo_store::fault::{self, Context, Severity};

fn main() -> anyhow::Result<()> {
    let args = NodeArgs::parse();
    let cfg = args.resolve()?;

    configure_logging(&cfg)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cfg.service_threads.max(1))
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let (handle, _fabric, _scripts) = silo_store::start_default_node(cfg).await?;
        tracing::info!(
            target: "service",
            "silo node {:x} ready on {}",
            handle.state.cfg.node_id,
            handle.service_addr
        );

        tokio::signal::ctrl_c().await?;
        tracing::info!(target: "service", "shutdown signaled");
        handle.shutdown();

        // Give in-flight responses a moment to drain.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        Ok(())
    })
}

/// Replace the default stdout sink with the configured set.
fn configure_logging(cfg: &silo_store::config::Config) -> anyhow::Result<()> {
    fault::init_subscriber();

    if cfg.log.is_empty() {
        return Ok(());
    }

    fault::clear_sinks();
    for sink_cfg in &cfg.log {
        let default = Severity::from_name(&sink_cfg.level)
            .ok_or_else(|| anyhow::anyhow!("bad log level {}", sink_cfg.level))?;
        let sink = fault::add_sink(sink_cfg.path.clone(), default)?;
        for (ctx_name, sev_name) in &sink_cfg.contexts {
            let ctx = Context::from_name(ctx_name)
                .ok_or_else(|| anyhow::anyhow!("unknown log context {ctx_name}"))?;
            let sev = Severity::from_name(sev_name)
                .ok_or_else(|| anyhow::anyhow!("bad log level {sev_name}"))?;
            fault::set_sink_context(&sink, ctx, sev);
        }
    }

    Ok(())
}
