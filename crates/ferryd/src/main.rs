use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod daemon;
mod dispatch;
mod disposition;
mod ingest;
mod metrics;
mod resolve;
mod sched;

use config::FerrydConfig;
use dispatch::{DeliveryAgent, PipeAgent, SinkAgent};
use disposition::DispositionLog;
use resolve::RuleResolver;

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum LogFormat {
    Full,
    Compact,
    Json,
}

/// Ferrymta delivery scheduler daemon.
///
/// Watches the spool for queue files and dispatches their
/// recipients to delivery workers, subject to per-destination
/// concurrency windows, recipient batching, destination back-off
/// and the global in-core recipient budget.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Opt {
    /// Configuration file to load.
    #[arg(long, default_value = "/etc/ferrymta/ferryd.toml")]
    config: PathBuf,

    /// Override the configured spool root.
    #[arg(long)]
    spool: Option<PathBuf>,

    /// Parse the configuration, report problems, and exit without
    /// starting the scheduler.
    #[arg(long)]
    validate: bool,

    /// Accept every delivery without running workers. Useful for
    /// smoke-testing a spool.
    #[arg(long)]
    sink: bool,

    /// How diagnostic logs render. full and compact are intended
    /// for human consumption; json outputs machine readable records.
    #[arg(long, default_value = "full")]
    log_format: LogFormat,
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_env("FERRYD_LOG")
        .unwrap_or_else(|_| EnvFilter::new("ferryd=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Full => builder.init(),
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();
    init_logging(opts.log_format);

    let mut cfg = if opts.config.exists() {
        FerrydConfig::load(&opts.config)?
    } else if opts.validate {
        anyhow::bail!("configuration file {} does not exist", opts.config.display());
    } else {
        tracing::warn!(
            "configuration file {} does not exist, using defaults",
            opts.config.display()
        );
        FerrydConfig::default()
    };
    if let Some(spool) = &opts.spool {
        cfg.spool_path = spool.clone();
    }
    if opts.validate {
        if !opts.sink && cfg.worker_command.is_empty() {
            anyhow::bail!("worker_command is not configured");
        }
        println!("{} is valid", opts.config.display());
        return Ok(());
    }
    let cfg = Arc::new(cfg);

    // The scheduler core is strictly single-threaded; worker
    // subprocesses provide all the parallelism there is.
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(run(cfg, opts.sink))
}

async fn run(cfg: Arc<FerrydConfig>, sink: bool) -> anyhow::Result<()> {
    let spool: spool::SpoolHandle = Arc::new(
        spool::LocalDiskSpool::new(&cfg.spool_path).context("failed to open spool")?,
    );

    let log = Arc::new(match &cfg.disposition_log {
        Some(path) => DispositionLog::to_file(path)
            .with_context(|| format!("failed to open {}", path.display()))?,
        None => DispositionLog::to_stdout(),
    });

    let (completion_tx, completion_rx) = tokio::sync::mpsc::unbounded_channel();
    let agent: Arc<dyn DeliveryAgent> = if sink {
        tracing::info!("using the sink delivery agent; nothing will actually be delivered");
        Arc::new(SinkAgent::new(completion_tx))
    } else {
        Arc::new(
            PipeAgent::new(cfg.worker_command.clone(), completion_tx)
                .context("worker_command is not usable")?,
        )
    };

    let resolver = Arc::new(RuleResolver::new(cfg.effective_hostname()));

    daemon::Daemon::new(cfg, resolver, spool, agent, log, completion_rx)
        .run()
        .await
}
