//! Batch scheduler: moves pending items through download attempts.
//!
//! Each item goes `PENDING -> IN_PROGRESS -> {SUCCEEDED | FAILED_PERMANENT |
//! FAILED_EXHAUSTED}`. `IN_PROGRESS` is written before the first attempt and
//! the final state after the last one; `FAILED_EXHAUSTED` and cancelled items
//! are written back as `PENDING` so the next run picks them up.
//!
//! Every artifact kind gets its own dispatch loop with its own slot limit,
//! drawing from the ledger's pending stream for that kind. A slot holds one
//! item for all of its attempts. Between attempts the item gives its identity
//! lease back, so a retry may run under a different identity.
//!
//! A run stops dispatching when:
//! - the pending stream ends or the batch limit is reached (exit code 0),
//! - no identity can serve further downloads (exit code 1, as long as some
//!   item was actually left unserved),
//! - the cancellation token fires (exit code 1),
//! - the ledger fails (exit code 2).
//!
//! In-flight items always settle and are recorded before [`Scheduler::run`]
//! returns.

use crate::config::{Config, SchedulerConfig};
use crate::error::{FetchError, PersistenceError};
use crate::fetch::{
    Authenticator, FetchSuccess, FetchWorker, FormLoginAuthenticator, HttpTransport, Transport,
};
use crate::identity::{AttemptOutcome, Identity, IdentityPool, Lease, Rotation};
use crate::ledger::{Ledger, LedgerRecord, PendingFilter, RecordUpdate};
use crate::retry::{AbortReason, Decision, RetryPolicy, add_jitter};
use crate::types::{ArtifactKind, Event, IdentityId, Item, Status};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Mutex, Semaphore, broadcast};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

mod session;
mod summary;

use session::SessionCache;
pub use summary::{FailedItem, RunOutcome, RunReport, RunSummary};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Reason recorded for items no identity could serve
const EXHAUSTED_REASON: &str =
    "AllIdentitiesExhaustedError: no identity left with quota or below the failure threshold";

/// Reason recorded for items interrupted by cancellation
const CANCELLED_REASON: &str = "Cancelled: run cancelled before the item finished";

/// How an item settled in this run
#[derive(Debug)]
enum ItemOutcome {
    Succeeded {
        identity: Option<IdentityId>,
        bytes: u64,
        skipped: bool,
    },
    FailedPermanent(String),
    FailedExhausted(String),
    Cancelled,
}

/// Final outcome plus the number of attempts made for it
#[derive(Debug)]
struct Settled {
    outcome: ItemOutcome,
    attempts: u32,
}

impl Settled {
    fn new(outcome: ItemOutcome, attempts: u32) -> Self {
        Self { outcome, attempts }
    }
}

/// State shared by the dispatch loops and item tasks of one run
struct RunState {
    /// Caller's cancellation signal, aborts attempts in flight
    cancel: CancellationToken,
    /// Stops dispatch of new items
    halt: CancellationToken,
    exhausted: AtomicBool,
    announced: AtomicBool,
    /// Items counted against `limit` so far
    claimed: AtomicUsize,
    limit: Option<usize>,
    fatal: Mutex<Option<PersistenceError>>,
    summary: Mutex<RunSummary>,
}

impl RunState {
    fn new(cancel: &CancellationToken, limit: Option<usize>) -> Self {
        Self {
            cancel: cancel.clone(),
            halt: cancel.child_token(),
            exhausted: AtomicBool::new(false),
            announced: AtomicBool::new(false),
            claimed: AtomicUsize::new(0),
            limit,
            fatal: Mutex::new(None),
            summary: Mutex::new(RunSummary::default()),
        }
    }

    /// Count one more item against the batch limit; false once it is reached
    fn claim(&self) -> bool {
        match self.limit {
            None => true,
            Some(limit) => self
                .claimed
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < limit).then_some(n + 1)
                })
                .is_ok(),
        }
    }

    /// Record a ledger failure and stop dispatch; the first failure wins
    async fn fail(&self, error: PersistenceError) {
        tracing::error!(error = %error, "ledger failure, halting dispatch");
        let mut fatal = self.fatal.lock().await;
        if fatal.is_none() {
            *fatal = Some(error);
        }
        self.halt.cancel();
    }

    async fn has_failed(&self) -> bool {
        self.fatal.lock().await.is_some()
    }

    /// Flag identity exhaustion and stop dispatch
    fn mark_exhausted(&self) {
        self.exhausted.store(true, Ordering::SeqCst);
        self.halt.cancel();
    }

    /// True the first time exhaustion cost this run an item
    fn announce(&self) -> bool {
        !self.announced.swap(true, Ordering::SeqCst)
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }
}

struct SchedulerInner {
    config: SchedulerConfig,
    ledger: Ledger,
    pool: Arc<IdentityPool>,
    sessions: SessionCache,
    worker: FetchWorker,
    retry: RetryPolicy,
    event_tx: broadcast::Sender<Event>,
}

/// Drives a batch of ledger items to completion
///
/// Cheap to clone; clones share the ledger, the identity pool and the event
/// channel.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Wire a scheduler from its collaborators
    pub fn new(
        config: &Config,
        ledger: Ledger,
        pool: Arc<IdentityPool>,
        authenticator: Arc<dyn Authenticator>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let worker = FetchWorker::new(
            transport,
            config.validation_for(ArtifactKind::File).clone(),
            config.validation_for(ArtifactKind::Cover).clone(),
        );
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(SchedulerInner {
                config: config.scheduler.clone(),
                ledger,
                pool,
                sessions: SessionCache::new(authenticator),
                worker,
                retry: RetryPolicy::new(config.retry.clone()),
                event_tx,
            }),
        }
    }

    /// Wire a scheduler with the HTTP transport and form-login authenticator
    pub fn from_config(config: &Config, ledger: Ledger) -> Self {
        let identities = config.identities.iter().map(Identity::from).collect();
        let pool = Arc::new(IdentityPool::new(
            identities,
            config.rotation.clone(),
            config.scheduler.request_delay,
        ));
        Self::new(
            config,
            ledger,
            pool,
            Arc::new(FormLoginAuthenticator::new(config.auth.clone())),
            Arc::new(HttpTransport::new()),
        )
    }

    /// Subscribe to run events
    ///
    /// Slow subscribers miss events once the channel's buffer is full.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.event_tx.subscribe()
    }

    /// Identity pool used by the run
    pub fn pool(&self) -> &Arc<IdentityPool> {
        &self.inner.pool
    }

    /// Process every pending item until the batch drains or the run stops
    ///
    /// The identity pool's daily usage is first seeded from the ledger so a
    /// restart on the same day cannot exceed a quota. Item-level failures are
    /// recorded per item and never end the run.
    pub async fn run(&self, cancel: CancellationToken) -> RunReport {
        let inner = &self.inner;
        let state = Arc::new(RunState::new(&cancel, inner.config.batch_limit));

        match inner
            .ledger
            .usage_since(inner.pool.day_start_timestamp())
            .await
        {
            Ok(usage) => inner.pool.seed_usage(&usage).await,
            Err(e) => {
                tracing::error!(error = %e, "failed to read identity usage from the ledger");
                return RunReport {
                    outcome: RunOutcome::Fatal(e),
                    summary: RunSummary::default(),
                };
            }
        }

        // Announced only once an item is actually left unserved
        if !inner.pool.all_available().await {
            tracing::debug!("every identity is spent before the run started");
            state.mark_exhausted();
        }

        let kinds: Vec<ArtifactKind> = match inner.config.only_kind {
            Some(kind) => vec![kind],
            None => ArtifactKind::ALL.to_vec(),
        };

        tracing::info!(
            kinds = ?kinds,
            retry_failed = inner.config.retry_failed,
            only_items = inner.config.only_items.len(),
            batch_limit = ?inner.config.batch_limit,
            "run started"
        );

        let loops = kinds
            .into_iter()
            .map(|kind| Arc::clone(inner).dispatch(kind, Arc::clone(&state)));
        futures::future::join_all(loops).await;

        let summary = state.summary.lock().await.clone();
        let outcome = match state.fatal.lock().await.take() {
            Some(error) => RunOutcome::Fatal(error),
            None if cancel.is_cancelled() => RunOutcome::Cancelled,
            None if !summary.failed_exhausted.is_empty() => RunOutcome::IdentitiesExhausted,
            None => RunOutcome::Drained,
        };

        tracing::info!(
            outcome = ?outcome,
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed_permanent = summary.failed_permanent.len(),
            failed_exhausted = summary.failed_exhausted.len(),
            cancelled = summary.cancelled,
            "run finished"
        );

        inner.emit_event(Event::RunFinished {
            succeeded: summary.succeeded,
            failed_permanent: summary.failed_permanent.len() as u64,
            failed_exhausted: summary.failed_exhausted.len() as u64,
        });

        RunReport { outcome, summary }
    }
}

impl SchedulerInner {
    fn emit_event(&self, event: Event) {
        // send() returns Err if there are no receivers, which is fine
        self.event_tx.send(event).ok();
    }

    fn emit_rotation(&self, rotation: Option<Rotation>) {
        if let Some(rotation) = rotation {
            self.emit_event(Event::IdentityRotated {
                from: rotation.from,
                to: rotation.to,
                reason: rotation.reason,
            });
        }
    }

    fn note_exhausted(&self, state: &RunState) {
        state.mark_exhausted();
        self.announce_exhausted(state);
    }

    fn announce_exhausted(&self, state: &RunState) {
        if state.announce() {
            tracing::warn!("no identity can serve further downloads, stopping dispatch");
            self.emit_event(Event::IdentitiesExhausted);
        }
    }

    /// Dispatch loop for one artifact kind
    async fn dispatch(self: Arc<Self>, kind: ArtifactKind, state: Arc<RunState>) {
        let limit = self.config.concurrency_for(kind);
        let slots = Arc::new(Semaphore::new(limit));
        let filter = PendingFilter::all()
            .for_kind(kind)
            .for_ids(self.config.only_items.iter().cloned())
            .include_failed(self.config.retry_failed);
        let mut pending = self.ledger.pending_records(filter);
        let mut tasks = JoinSet::new();

        tracing::debug!(kind = %kind, limit, "dispatch started");

        loop {
            // Wait for a free slot before pulling, so the item read is the
            // next one to start
            let permit = tokio::select! {
                biased;
                _ = state.halt.cancelled() => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let next = tokio::select! {
                biased;
                _ = state.halt.cancelled() => break,
                next = pending.next() => next,
            };

            let item = match next {
                Some(Ok(record)) => record.to_item(),
                Some(Err(e)) => {
                    state.fail(e).await;
                    break;
                }
                None => break,
            };

            if !state.claim() {
                tracing::debug!(kind = %kind, "batch limit reached");
                break;
            }

            let inner = Arc::clone(&self);
            let state = Arc::clone(&state);
            tasks.spawn(async move {
                let _permit = permit;
                inner.process(item, &state).await;
            });
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(kind = %kind, error = %e, "item task panicked");
            }
        }

        if state.is_exhausted() && !state.cancel.is_cancelled() && !state.has_failed().await {
            self.sweep_exhausted(pending, &state).await;
        }

        tracing::debug!(kind = %kind, "dispatch finished");
    }

    /// Account for every item left in `pending` as exhausted for this run
    ///
    /// Open items are written back as exhausted. Items that already failed
    /// permanently keep their stored state and reason and are only listed in
    /// the summary.
    async fn sweep_exhausted(
        &self,
        mut pending: BoxStream<'static, Result<LedgerRecord, PersistenceError>>,
        state: &RunState,
    ) {
        while let Some(next) = pending.next().await {
            let record = match next {
                Ok(record) => record,
                Err(e) => {
                    state.fail(e).await;
                    return;
                }
            };
            if !state.claim() {
                return;
            }
            self.announce_exhausted(state);

            if record.status == Status::FailedPermanent {
                let reason = format!(
                    "{} (kept earlier failure: {})",
                    EXHAUSTED_REASON,
                    record.last_error.as_deref().unwrap_or("no reason recorded")
                );
                tracing::debug!(item_id = %record.id, "failed item not retried, no identity left");
                state.summary.lock().await.failed_exhausted.push(FailedItem {
                    id: record.id,
                    reason,
                });
                continue;
            }

            let item = record.to_item();
            let settled = Settled::new(ItemOutcome::FailedExhausted(EXHAUSTED_REASON.to_string()), 0);
            if let Err(e) = self.settle(&item, settled, state).await {
                state.fail(e).await;
                return;
            }
        }
    }

    /// Run one item from IN_PROGRESS to its recorded outcome
    async fn process(&self, item: Item, state: &RunState) {
        tracing::debug!(item_id = %item.id, kind = %item.kind, "item started");
        self.emit_event(Event::ItemStarted {
            id: item.id.clone(),
            kind: item.kind,
        });

        if let Err(e) = self
            .ledger
            .record(RecordUpdate::new(&item, Status::InProgress))
            .await
        {
            state.fail(e).await;
            return;
        }

        let settled = self.attempts(&item, state).await;

        if let Err(e) = self.settle(&item, settled, state).await {
            state.fail(e).await;
        }
    }

    /// Attempt `item` until it succeeds, fails for good or cannot continue
    async fn attempts(&self, item: &Item, state: &RunState) -> Settled {
        // An artifact already on disk needs no identity
        match self.worker.existing(item).await {
            Ok(Some(bytes)) => {
                let outcome = ItemOutcome::Succeeded {
                    identity: None,
                    bytes,
                    skipped: true,
                };
                return Settled::new(outcome, 0);
            }
            Ok(None) => {}
            Err(e @ FetchError::ContentValidation(_)) => {
                return Settled::new(ItemOutcome::FailedPermanent(e.reason()), 0);
            }
            Err(e) => {
                tracing::debug!(item_id = %item.id, error = %e, "could not inspect target, downloading");
            }
        }

        // Attempts against the retry budget; quota signals are not counted
        let mut counted: u32 = 0;
        let mut made: u32 = 0;

        loop {
            let lease = match self.lease(state).await {
                Ok(lease) => lease,
                Err(outcome) => return Settled::new(outcome, made),
            };
            made += 1;
            let identity = lease.id().clone();

            let error = match self.attempt(item, &lease, state).await {
                Ok(success) => return self.succeed(lease, success, made).await,
                Err(error) => error,
            };

            self.sessions.invalidate(&identity).await;

            let outcome = match &error {
                FetchError::QuotaExhausted { .. } => AttemptOutcome::QuotaExhausted,
                e if e.counts_against_identity() => AttemptOutcome::Failure,
                _ => AttemptOutcome::ItemFault,
            };
            let rotation = self.pool.release(lease, outcome).await;
            self.emit_rotation(rotation);

            if outcome != AttemptOutcome::QuotaExhausted {
                counted += 1;
            }

            match self.retry.decide(counted, &error) {
                Decision::Retry { after } => {
                    if !self.pool.all_available().await {
                        self.note_exhausted(state);
                        let reason = format!("{} (last error: {})", EXHAUSTED_REASON, error.reason());
                        return Settled::new(ItemOutcome::FailedExhausted(reason), made);
                    }

                    let delay = if self.retry.jitter() && !after.is_zero() {
                        add_jitter(after)
                    } else {
                        after
                    };

                    tracing::warn!(
                        item_id = %item.id,
                        identity = %identity,
                        attempt = made,
                        delay_ms = delay.as_millis() as u64,
                        error = %error.reason(),
                        "attempt failed, retrying"
                    );
                    self.emit_event(Event::AttemptFailed {
                        id: item.id.clone(),
                        attempt: made,
                        error: error.reason(),
                        retry_in_ms: delay.as_millis() as u64,
                    });

                    if !delay.is_zero() {
                        tokio::select! {
                            biased;
                            _ = state.cancel.cancelled() => {
                                return Settled::new(ItemOutcome::Cancelled, made);
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                Decision::Abort(AbortReason::Cancelled) => {
                    return Settled::new(ItemOutcome::Cancelled, made);
                }
                Decision::Abort(reason) => {
                    return Settled::new(ItemOutcome::FailedPermanent(reason.describe()), made);
                }
            }
        }
    }

    /// Wait for an identity lease
    ///
    /// Keeps waiting while identities are merely busy; gives up once none
    /// can serve downloads any more.
    async fn lease(&self, state: &RunState) -> Result<Lease, ItemOutcome> {
        loop {
            let lease = tokio::select! {
                biased;
                _ = state.cancel.cancelled() => return Err(ItemOutcome::Cancelled),
                lease = self.pool.acquire_wait(self.config.acquire_wait) => lease,
            };

            if let Some(lease) = lease {
                return Ok(lease);
            }

            if !self.pool.all_available().await {
                self.note_exhausted(state);
                return Err(ItemOutcome::FailedExhausted(EXHAUSTED_REASON.to_string()));
            }

            tracing::debug!("all identities busy, still waiting");
        }
    }

    /// One download attempt under `lease`
    async fn attempt(
        &self,
        item: &Item,
        lease: &Lease,
        state: &RunState,
    ) -> Result<FetchSuccess, FetchError> {
        let context = self.sessions.get(lease.identity()).await?;

        tokio::select! {
            biased;
            _ = state.cancel.cancelled() => return Err(FetchError::Cancelled),
            _ = self.pool.pace(lease) => {}
        }

        let limit = self.config.timeout_for(item.kind);
        match tokio::time::timeout(limit, self.worker.fetch(item, &context, &state.cancel)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::TransientNetwork(format!(
                "attempt timed out after {:?}",
                limit
            ))),
        }
    }

    async fn succeed(&self, lease: Lease, success: FetchSuccess, made: u32) -> Settled {
        let identity = lease.id().clone();
        // A file that appeared between the check and the attempt used nothing
        let outcome = if success.skipped {
            AttemptOutcome::Unused
        } else {
            AttemptOutcome::Success
        };
        let rotation = self.pool.release(lease, outcome).await;
        self.emit_rotation(rotation);

        let outcome = ItemOutcome::Succeeded {
            identity: (!success.skipped).then_some(identity),
            bytes: success.bytes,
            skipped: success.skipped,
        };
        Settled::new(outcome, made)
    }

    /// Write the final state of an item and account for it
    async fn settle(
        &self,
        item: &Item,
        settled: Settled,
        state: &RunState,
    ) -> Result<(), PersistenceError> {
        let Settled { outcome, attempts } = settled;

        match outcome {
            ItemOutcome::Succeeded {
                identity,
                bytes,
                skipped,
            } => {
                let update = RecordUpdate::new(item, Status::Succeeded)
                    .with_identity(identity.clone())
                    .with_attempts(attempts);
                self.ledger.record(update).await?;

                tracing::info!(
                    item_id = %item.id,
                    identity = ?identity.as_ref().map(|id| id.as_str()),
                    bytes,
                    skipped,
                    "item succeeded"
                );

                let mut summary = state.summary.lock().await;
                summary.succeeded += 1;
                if skipped {
                    summary.skipped += 1;
                }
                drop(summary);

                self.emit_event(Event::ItemSucceeded {
                    id: item.id.clone(),
                    identity,
                    bytes,
                    skipped,
                });
            }
            ItemOutcome::FailedPermanent(reason) => {
                self.settle_failed(item, Status::FailedPermanent, reason, attempts, state)
                    .await?;
            }
            ItemOutcome::FailedExhausted(reason) => {
                self.settle_failed(item, Status::FailedExhausted, reason, attempts, state)
                    .await?;
            }
            ItemOutcome::Cancelled => {
                let update = RecordUpdate::new(item, Status::Pending)
                    .with_error(CANCELLED_REASON)
                    .with_attempts(attempts);
                self.ledger.record(update).await?;

                tracing::info!(item_id = %item.id, "item cancelled, left pending");
                state.summary.lock().await.cancelled += 1;
            }
        }

        Ok(())
    }

    async fn settle_failed(
        &self,
        item: &Item,
        status: Status,
        reason: String,
        attempts: u32,
        state: &RunState,
    ) -> Result<(), PersistenceError> {
        let update = RecordUpdate::new(item, status)
            .with_error(reason.clone())
            .with_attempts(attempts);
        self.ledger.record(update).await?;

        tracing::warn!(item_id = %item.id, status = %status, reason = %reason, "item failed");

        let failed = FailedItem {
            id: item.id.clone(),
            reason: reason.clone(),
        };
        let mut summary = state.summary.lock().await;
        match status {
            Status::FailedPermanent => summary.failed_permanent.push(failed),
            _ => summary.failed_exhausted.push(failed),
        }
        drop(summary);

        self.emit_event(Event::ItemFailed {
            id: item.id.clone(),
            status,
            reason,
        });
        Ok(())
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
