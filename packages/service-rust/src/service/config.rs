use std::time::Duration;

/// Dispatcher-level configuration.
///
/// Controls worker capacity, background key synchronization, and shutdown.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of operations allowed to run at once. Further dispatches queue
    /// in FIFO order until a slot frees up.
    pub max_concurrent_operations: usize,
    /// Idle time after which a blocking worker thread exits. Applied to the
    /// runtime by the binary; the dispatcher itself only reports it.
    pub worker_idle_timeout: Duration,
    /// Interval between background key-sync runs.
    pub key_sync_interval: Duration,
    /// A key whose metadata is older than this is refreshed by key sync.
    pub key_stale_after: Duration,
    /// Time allowed for in-flight dispatches to finish during shutdown.
    pub shutdown_grace: Duration,
    /// Default number of benchmark rounds.
    pub benchmark_rounds: u32,
    /// Size of the data block hashed per benchmark round.
    pub benchmark_block_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: 4,
            worker_idle_timeout: Duration::from_secs(10),
            key_sync_interval: Duration::from_secs(24 * 60 * 60),
            key_stale_after: Duration::from_secs(7 * 24 * 60 * 60),
            shutdown_grace: Duration::from_secs(30),
            benchmark_rounds: 8,
            benchmark_block_size: 1024 * 1024,
        }
    }
}
