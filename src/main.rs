//! harvest-dl: resumable batch downloader driver

use clap::{Args, Parser, Subcommand, ValueEnum};
use harvest_dl::discovery::load_manifest;
use harvest_dl::{
    ArtifactKind, Config, Event, Identity, IdentityPool, ItemId, Ledger, Result, RunOutcome,
    RunReport, Scheduler,
};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "harvest-dl")]
#[command(about = "Resumable batch downloader for quota-limited services")]
#[command(version)]
struct Cli {
    /// Configuration file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Ledger database path (overrides the config file)
    #[arg(long)]
    ledger: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Download every pending item (default)
    Run(RunArgs),

    /// Add the items of a scraper manifest to the ledger
    Import {
        /// Manifest file (JSON array of book records)
        manifest: PathBuf,
    },

    /// Show ledger counts, failed items and identity usage today
    Status,

    /// Move permanently failed items back to pending
    ResetFailed,
}

#[derive(Args, Default)]
struct RunArgs {
    /// Import this manifest before running
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    /// Concurrent document downloads
    #[arg(long)]
    file_concurrency: Option<usize>,

    /// Concurrent cover downloads
    #[arg(long)]
    cover_concurrency: Option<usize>,

    /// Maximum attempts per item
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Consecutive failures before an identity is rotated out
    #[arg(long)]
    rotation_threshold: Option<u32>,

    /// Only download one kind of artifact
    #[arg(long, value_enum)]
    kind: Option<KindArg>,

    /// Only download these items (repeatable; covers are `<id>:cover`)
    #[arg(long = "id", value_name = "ITEM_ID")]
    ids: Vec<String>,

    /// Stop after this many items
    #[arg(long, value_name = "N")]
    limit: Option<usize>,

    /// Leave items that failed permanently in earlier runs alone
    #[arg(long)]
    skip_failed: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    File,
    Cover,
}

impl From<KindArg> for ArtifactKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::File => ArtifactKind::File,
            KindArg::Cover => ArtifactKind::Cover,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match execute(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %e, "harvest-dl failed");
            eprintln!("error: {}", e);
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(2))
        }
    }
}

async fn execute(cli: Cli) -> Result<u8> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(ledger) = cli.ledger {
        config.ledger.path = ledger;
    }

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(config, args).await,
        Commands::Import { manifest } => import(config, manifest).await,
        Commands::Status => status(config).await,
        Commands::ResetFailed => reset_failed(config).await,
    }
}

async fn run(mut config: Config, args: RunArgs) -> Result<u8> {
    if let Some(n) = args.file_concurrency {
        config.scheduler.file_concurrency = n;
    }
    if let Some(n) = args.cover_concurrency {
        config.scheduler.cover_concurrency = n;
    }
    if let Some(n) = args.max_attempts {
        config.retry.max_attempts = n;
    }
    if let Some(n) = args.rotation_threshold {
        config.rotation.failure_threshold = n;
    }
    if let Some(kind) = args.kind {
        config.scheduler.only_kind = Some(kind.into());
    }
    if args.skip_failed {
        config.scheduler.retry_failed = false;
    }
    if !args.ids.is_empty() {
        config.scheduler.only_items = args.ids.into_iter().map(ItemId::new).collect();
    }
    if let Some(limit) = args.limit {
        config.scheduler.batch_limit = Some(limit);
    }
    config.validate()?;

    let ledger = Ledger::open(&config.ledger.path).await?;

    if let Some(manifest) = args.manifest {
        let items = load_manifest(&manifest, &config.paths)?;
        let summary = ledger.import(items).await?;
        println!(
            "Imported manifest: {} new, {} updated, {} unchanged",
            summary.inserted, summary.updated, summary.unchanged
        );
    }

    let scheduler = Scheduler::from_config(&config, ledger.clone());

    let mut events = scheduler.subscribe();
    let progress = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "progress output fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let cancel = CancellationToken::new();
    let signals = harvest_dl::cancel_on_signal(cancel.clone());

    let report = scheduler.run(cancel).await;

    signals.abort();
    drop(scheduler);
    progress.await.ok();

    print_report(&report);
    ledger.close().await?;

    report.into_result()?;
    Ok(0)
}

async fn import(config: Config, manifest: PathBuf) -> Result<u8> {
    let ledger = Ledger::open(&config.ledger.path).await?;
    let items = load_manifest(&manifest, &config.paths)?;
    let summary = ledger.import(items).await?;
    ledger.close().await?;

    println!(
        "Imported {}: {} new, {} updated, {} unchanged",
        manifest.display(),
        summary.inserted,
        summary.updated,
        summary.unchanged
    );
    Ok(0)
}

async fn status(config: Config) -> Result<u8> {
    let ledger = Ledger::open(&config.ledger.path).await?;
    let counts = ledger.counts().await?;

    println!("Ledger: {}", config.ledger.path.display());
    println!("  pending:          {}", counts.pending);
    println!("  in progress:      {}", counts.in_progress);
    println!("  succeeded:        {}", counts.succeeded);
    println!("  failed permanent: {}", counts.failed_permanent);
    println!("  total:            {}", counts.total());

    let failed = ledger.failed().await?;
    if !failed.is_empty() {
        println!("\nFailed items:");
        for record in &failed {
            println!(
                "  {} [{}] after {} attempts: {}",
                record.id,
                record.kind,
                record.attempts,
                record.last_error.as_deref().unwrap_or("no reason recorded")
            );
        }
    }

    if !config.identities.is_empty() {
        let pool = IdentityPool::new(
            config.identities.iter().map(Identity::from).collect(),
            config.rotation.clone(),
            config.scheduler.request_delay,
        );
        let usage = ledger.usage_since(pool.day_start_timestamp()).await?;
        pool.seed_usage(&usage).await;

        println!("\nIdentity usage today:");
        for identity in pool.snapshot().await {
            let mark = if identity.usage < identity.quota { "✓" } else { "✗" };
            println!("  {} {} - {}/{}", mark, identity.id, identity.usage, identity.quota);
        }
    }

    ledger.close().await?;
    Ok(0)
}

async fn reset_failed(config: Config) -> Result<u8> {
    let ledger = Ledger::open(&config.ledger.path).await?;
    let moved = ledger.reset_failed().await?;
    ledger.close().await?;

    println!("Moved {} failed items back to pending", moved);
    Ok(0)
}

fn print_event(event: &Event) {
    match event {
        Event::ItemSucceeded {
            id,
            identity,
            bytes,
            skipped: false,
        } => {
            let identity = identity.as_ref().map(|i| i.as_str()).unwrap_or("-");
            println!("✓ {} ({} bytes via {})", id, bytes, identity);
        }
        Event::ItemSucceeded { id, skipped: true, .. } => println!("= {} (already on disk)", id),
        Event::ItemFailed { id, reason, .. } => println!("✗ {}: {}", id, reason),
        Event::IdentityRotated { from, to, reason } => match to {
            Some(to) => println!("↻ identity {} -> {} ({})", from, to, reason),
            None => println!("↻ identity {} retired ({})", from, reason),
        },
        Event::IdentitiesExhausted => println!("! all identities exhausted, stopping"),
        _ => {}
    }
}

fn print_report(report: &RunReport) {
    let summary = &report.summary;

    println!("\nRun summary:");
    println!("  succeeded:        {} ({} already on disk)", summary.succeeded, summary.skipped);
    println!("  failed permanent: {}", summary.failed_permanent.len());
    println!("  not served:       {}", summary.failed_exhausted.len());
    println!("  cancelled:        {}", summary.cancelled);

    if !summary.failed_permanent.is_empty() {
        println!("\nFailed permanently:");
        for item in &summary.failed_permanent {
            println!("  {}: {}", item.id, item.reason);
        }
    }

    if !summary.failed_exhausted.is_empty() {
        println!("\nNot downloaded (identities exhausted):");
        for item in &summary.failed_exhausted {
            println!("  {}: {}", item.id, item.reason);
        }
    }

    match &report.outcome {
        RunOutcome::Drained => println!("\nBatch drained."),
        RunOutcome::IdentitiesExhausted => {
            println!("\nStopped early: no identity has quota left. Rerun tomorrow to continue.")
        }
        RunOutcome::Cancelled => println!("\nStopped early: cancelled. Rerun to continue."),
        RunOutcome::Fatal(e) => println!("\nStopped: ledger failure: {}", e),
    }
}
