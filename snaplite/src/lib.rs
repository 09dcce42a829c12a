//! Snaplite daemon core.
//!
//! This crate provides the task-graph orchestration engine of the snap
//! daemon: the persistent [`state`], the [`runner`] executing change
//! graphs, conflict detection, refresh inhibition, the bootloader
//! contract, and the auto-refresh scheduler.

use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

// Global guard for tracing-appender to keep the writer thread alive
static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

pub mod boot;
pub mod conflict;
pub mod inhibit;
pub mod layout;
pub mod refresh;
pub mod runner;
pub mod schedule;
pub mod snapop;
pub mod state;

mod runtime;

pub use runtime::{Collaborators, SnapliteOptions, SnapliteRuntime};

use snaplite_shared::errors::{SnapError, SnapResult};

pub use boot::{BootOutcome, BootSnapKind, Bootloader, MemBootloader};
pub use conflict::ConnRef;
pub use inhibit::{FakeTracker, ProcessTracker, SnapPids};
pub use layout::SnapDirs;
pub use refresh::{AutoRefresh, NoopRefreshBuilder, RefreshBuilder, RefreshPolicy};
pub use runner::{HandlerCtx, HandlerOutcome, TaskRunner, Tomb};
pub use snapop::{FakeBackend, SnapBackend, SnapEntry, SnapSetup, SnapType};
pub use state::{Change, State, StateLock, Status, Task, TaskSet};

/// Initialize tracing for Snaplite using the provided filesystem layout.
///
/// Logs are written to `<layout.home_dir()>/logs/snaplite.log` with daily
/// rotation. Uses the `RUST_LOG` environment variable for filtering
/// (defaults to `info`). Idempotent: subsequent calls return immediately
/// once initialized.
pub fn init_logging_for(layout: &SnapDirs) -> SnapResult<()> {
    let logs_dir = layout.logs_dir();
    std::fs::create_dir_all(&logs_dir).map_err(|e| {
        SnapError::Storage(format!(
            "Failed to create logs directory {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    let _ = LOG_GUARD.get_or_init(|| {
        let file_appender = tracing_appender::rolling::daily(logs_dir, "snaplite.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new("info"))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        // If a global default subscriber is already set this is a no-op;
        // we do not interfere with host-configured tracing.
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(non_blocking)
            .with_ansi(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);

        guard
    });

    Ok(())
}
