pub mod bus;
pub mod classify;
pub mod config;
pub mod connectivity;
pub mod errors;
pub mod layer;
pub mod models;
pub mod queue;
pub mod remote;
pub mod retry;
pub mod snapshot;
pub mod store;

pub use bus::{BusEnvelope, Notification, NotificationBus};
pub use config::SyncSettings;
pub use connectivity::{Banner, ConnectivityMonitor, HealthProbe, HttpHealthProbe, MonitorEvent, ProbeOutcome};
pub use errors::{AppError, AppResult};
pub use layer::{DataLayer, DataSource, DrainReport, ReadOutcome, WriteOutcome};
pub use models::{
    CacheEntry, ChangeStatus, Collection, ConnectivityState, DegradedReason, Device, Entity, Operation, PendingChange,
    Pin, Project, RetryPolicy,
};
pub use queue::{EnqueueOutcome, MutationQueue};
pub use remote::{HttpBackend, RemoteBackend, RemoteError, RemoteErrorKind, RemoteResult};
pub use retry::RetryExecutor;
pub use snapshot::{RecentPinValue, RecentPinValues, SnapshotCache};
pub use store::{MemoryBackend, PersistentStore, SqliteBackend, StorageBackend};

use anyhow::Context;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// JSON logs to a daily rolling file under `log_dir`. Level from `RUST_LOG`, default `info`.
pub fn init_tracing(log_dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(log_dir).with_context(|| format!("creating log directory {}", log_dir.display()))?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "devicehub-sync.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| anyhow::anyhow!(error.to_string()))
        .context("installing tracing subscriber")
}
