//! # harvest-dl
//!
//! Resumable batch downloader for quota-limited, authenticated services.
//!
//! ## Design Philosophy
//!
//! harvest-dl is designed to be:
//! - **Resumable** - Every outcome is committed to a SQLite ledger; a killed
//!   run picks up exactly where it stopped
//! - **Quota-safe** - Identities are leased from a pool that never lets a
//!   daily quota be exceeded, even across restarts
//! - **Library-first** - The CLI is a thin driver over the public API
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use harvest_dl::{Config, Ledger, Scheduler};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file(std::path::Path::new("harvest.json"))?;
//!     let ledger = Ledger::open(&config.ledger.path).await?;
//!
//!     let items = harvest_dl::discovery::load_manifest(
//!         std::path::Path::new("books.json"),
//!         &config.paths,
//!     )?;
//!     ledger.import(items).await?;
//!
//!     let scheduler = Scheduler::from_config(&config, ledger.clone());
//!
//!     // Subscribe to events
//!     let mut events = scheduler.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let report = scheduler.run(CancellationToken::new()).await;
//!     ledger.close().await?;
//!     std::process::exit(report.exit_code());
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Manifest adapter turning scraper output into items
pub mod discovery;
/// Error types
pub mod error;
/// Single-item download attempts, transport and authentication seams
pub mod fetch;
/// Identity pool with quotas and rotation
pub mod identity;
/// Durable per-item state
pub mod ledger;
/// Retry decisions for failed attempts
pub mod retry;
/// Batch scheduler
pub mod scheduler;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, FetchError, PersistenceError, Result};
pub use fetch::{AccessContext, Authenticator, FetchWorker, Transport};
pub use identity::{Identity, IdentityPool};
pub use ledger::{Ledger, LedgerRecord, PendingFilter, RecordUpdate};
pub use retry::RetryPolicy;
pub use scheduler::{RunOutcome, RunReport, RunSummary, Scheduler};
pub use types::{ArtifactKind, Event, IdentityId, Item, ItemId, Status};

/// Cancel `token` when a termination signal arrives
///
/// Spawns a task that waits for SIGTERM/SIGINT (Ctrl+C elsewhere) and then
/// cancels the token, so a running [`Scheduler::run`] stops dispatching and
/// settles its in-flight items.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub fn cancel_on_signal(
    token: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            signal = wait_for_signal() => {
                tracing::info!(signal, "stop requested, settling in-flight items");
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    })
}

/// Wait for the first termination signal and return its name
#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{Signal, SignalKind, signal};

    async fn next(listener: Option<&mut Signal>) {
        match listener {
            Some(listener) => {
                listener.recv().await;
            }
            None => std::future::pending().await,
        }
    }

    // Registration can fail in restricted environments; keep whichever works
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| tracing::warn!(error = %e, "cannot listen for SIGTERM"))
        .ok();
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| tracing::warn!(error = %e, "cannot listen for SIGINT"))
        .ok();

    if sigterm.is_none() && sigint.is_none() {
        tokio::signal::ctrl_c().await.ok();
        return "ctrl-c";
    }

    tokio::select! {
        _ = next(sigterm.as_mut()) => "SIGTERM",
        _ = next(sigint.as_mut()) => "SIGINT",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for Ctrl+C, stop requests are ignored");
        std::future::pending::<()>().await;
    }
    "ctrl-c"
}
