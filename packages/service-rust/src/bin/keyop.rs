//! `keyop`: runs JSON request envelopes through a dispatcher and prints every
//! reply message as a JSON line on stdout.
//!
//! Input is one envelope per line, read from `--input` or stdin. Logs go to
//! stderr. With `--sync-keys` the process also runs background key sync and
//! keeps running after the input is done, until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use keyop_core::{KeyRing, ReplyMessage};
use keyop_service::service::{KeySyncRunnable, MaintenanceTask};
use keyop_service::{
    Dispatcher, DispatcherConfig, KeyRepository, MemoryKeyRepository, OperationDeps, ReplyTarget,
};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "keyop", version, about = "Dispatch key-management requests")]
struct Args {
    /// File with one JSON request envelope per line. Reads stdin if omitted.
    #[arg(long, env = "KEYOP_INPUT")]
    input: Option<PathBuf>,

    /// JSON array of key rings to seed the repository with.
    #[arg(long, env = "KEYOP_KEYRING")]
    keyring: Option<PathBuf>,

    /// Write the repository back to `--keyring` after all requests finish.
    #[arg(long, requires = "keyring")]
    write_back: bool,

    #[arg(long, env = "KEYOP_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Operations allowed to run at once.
    #[arg(long, env = "KEYOP_MAX_CONCURRENT")]
    max_concurrent: Option<usize>,

    /// Seconds an idle blocking worker thread is kept alive.
    #[arg(long, env = "KEYOP_WORKER_IDLE_SECS")]
    worker_idle_secs: Option<u64>,

    /// Seconds to wait for in-flight dispatches on shutdown.
    #[arg(long, env = "KEYOP_SHUTDOWN_GRACE_SECS")]
    shutdown_grace_secs: Option<u64>,

    /// Default number of benchmark rounds.
    #[arg(long, env = "KEYOP_BENCHMARK_ROUNDS")]
    benchmark_rounds: Option<u32>,

    /// Refresh stale keys from the keyserver now and every
    /// `--key-sync-interval-secs`, and stay up until interrupted.
    #[arg(long, env = "KEYOP_SYNC_KEYS")]
    sync_keys: bool,

    /// Seconds between background key-sync runs.
    #[arg(long, env = "KEYOP_KEY_SYNC_INTERVAL_SECS")]
    key_sync_interval_secs: Option<u64>,
}

impl Args {
    fn config(&self) -> DispatcherConfig {
        let mut config = DispatcherConfig::default();
        if let Some(n) = self.max_concurrent {
            config.max_concurrent_operations = n;
        }
        if let Some(secs) = self.worker_idle_secs {
            config.worker_idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.shutdown_grace_secs {
            config.shutdown_grace = Duration::from_secs(secs);
        }
        if let Some(rounds) = self.benchmark_rounds {
            config.benchmark_rounds = rounds;
        }
        if let Some(secs) = self.key_sync_interval_secs {
            config.key_sync_interval = Duration::from_secs(secs);
        }
        config
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);
    let config = args.config();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_keep_alive(config.worker_idle_timeout)
        .build()
        .context("failed to build runtime")?;
    runtime.block_on(run(args, config))
}

async fn run(args: Args, config: DispatcherConfig) -> anyhow::Result<()> {
    let rings: Vec<KeyRing> = match &args.keyring {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&text).context("keyring file is not a JSON array of rings")?
        }
        None => Vec::new(),
    };
    tracing::info!(keys = rings.len(), "repository loaded");
    let repository = Arc::new(MemoryKeyRepository::from_rings(rings));

    let grace = config.shutdown_grace;
    let config = Arc::new(config);
    let deps = OperationDeps {
        config: Arc::clone(&config),
        ..OperationDeps::default()
    };
    let dispatcher = Dispatcher::with_builtin(Arc::clone(&repository) as Arc<dyn KeyRepository>, &deps);

    let mut key_sync = None;
    if args.sync_keys {
        let worker = KeySyncRunnable::spawn(dispatcher.clone(), &config);
        worker.submit(MaintenanceTask::SyncStaleKeys).await?;
        key_sync = Some(worker);
    }

    let input = match &args.input {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut text = String::new();
            tokio::io::stdin().read_to_string(&mut text).await?;
            text
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<ReplyMessage>();
    let printer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::error!(error = %e, "failed to encode reply"),
            }
        }
    });

    let target: Arc<dyn ReplyTarget> = Arc::new(tx);
    let mut handles = Vec::new();
    for (line_no, line) in input.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match dispatcher.dispatch_json(line.as_bytes(), Arc::clone(&target)) {
            Ok(handle) => handles.push(handle),
            Err(e) => tracing::error!(line = line_no + 1, error = %e, "request rejected"),
        }
    }
    drop(target);

    let serving = key_sync.is_some();
    let finished = async {
        for handle in handles {
            handle.wait().await;
        }
        if serving {
            tracing::info!("input done, serving background key sync until interrupted");
            std::future::pending::<()>().await;
        }
    };
    tokio::select! {
        () = finished => {}
        _ = tokio::signal::ctrl_c() => {
            let cancelled = dispatcher.cancel_all();
            tracing::warn!(cancelled, "interrupted, cancelling outstanding requests");
        }
    }
    if let Some(mut worker) = key_sync {
        worker.stop().await;
    }
    if dispatcher.shutdown(grace).await {
        // Every reply target clone is gone once the dispatches have completed.
        printer.await?;
    } else {
        tracing::warn!("some dispatches did not finish, replies may be incomplete");
    }

    if args.write_back {
        if let Some(path) = &args.keyring {
            let json = serde_json::to_string_pretty(&repository.snapshot())?;
            tokio::fs::write(path, json)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            tracing::info!(keys = repository.len(), path = %path.display(), "repository written");
        }
    }
    Ok(())
}
