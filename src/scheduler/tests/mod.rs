use super::*;
use crate::config::IdentityConfig;
use crate::error::AuthError;
use crate::fetch::{AccessContext, TransportResponse};
use crate::identity::Identity;
use async_trait::async_trait;
use futures::stream;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::time::Duration;
use tempfile::TempDir;

const BODY_SIZE: usize = 2048;

type Responder = dyn Fn(&str, usize) -> u16 + Send + Sync;

/// Answers with a status chosen from (identity, nth request for the locator)
struct ScriptedTransport {
    respond: Box<Responder>,
    calls: std::sync::Mutex<Vec<(String, String)>>,
}

impl ScriptedTransport {
    fn new(respond: impl Fn(&str, usize) -> u16 + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            calls: std::sync::Mutex::new(Vec::new()),
        })
    }

    fn always(status: u16) -> Arc<Self> {
        Self::new(move |_, _| status)
    }

    fn requests(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn identities_used(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(identity, _)| identity.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(
        &self,
        locator: &str,
        context: &AccessContext,
    ) -> Result<TransportResponse, FetchError> {
        let nth = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((context.identity().to_string(), locator.to_string()));
            calls.iter().filter(|(_, l)| l == locator).count()
        };

        let status = (self.respond)(context.identity().as_str(), nth);
        let (content_type, body) = if status == 200 {
            ("application/pdf", vec![7u8; BODY_SIZE])
        } else {
            ("text/plain", b"error".to_vec())
        };

        Ok(TransportResponse {
            status,
            content_type: Some(content_type.to_string()),
            content_length: Some(body.len() as u64),
            body: stream::iter(vec![Ok(body)]).boxed(),
        })
    }
}

/// Sends headers and a first chunk, then never finishes the body
#[derive(Default)]
struct StallingTransport {
    started: tokio::sync::Notify,
    requests: AtomicUsize,
}

#[async_trait]
impl Transport for StallingTransport {
    async fn get(
        &self,
        _locator: &str,
        _context: &AccessContext,
    ) -> Result<TransportResponse, FetchError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();

        let first = stream::iter(vec![Ok(vec![7u8; BODY_SIZE / 2])]);
        Ok(TransportResponse {
            status: 200,
            content_type: Some("application/pdf".to_string()),
            content_length: Some(BODY_SIZE as u64),
            body: first.chain(stream::pending()).boxed(),
        })
    }
}

/// Hands out anonymous sessions, refusing the listed identities
#[derive(Default)]
struct StaticAuthenticator {
    rejected: HashSet<String>,
    logins: AtomicUsize,
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, identity: &Identity) -> Result<AccessContext, AuthError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        if self.rejected.contains(identity.id.as_str()) {
            return Err(AuthError::Rejected("bad password".to_string()));
        }
        Ok(AccessContext::new(identity.id.clone(), reqwest::Client::new()))
    }
}

struct Harness {
    dir: TempDir,
    config: Config,
    ledger: Ledger,
}

impl Harness {
    async fn new(identities: &[(&str, u32)]) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.identities = identities
            .iter()
            .map(|(id, quota)| IdentityConfig {
                id: id.to_string(),
                secret: "secret".to_string(),
                max_daily_downloads: *quota,
            })
            .collect();
        config.ledger.path = dir.path().join("ledger.db");
        config.scheduler.request_delay = Duration::ZERO;
        config.scheduler.acquire_wait = Duration::from_secs(1);
        config.retry.initial_delay = Duration::from_millis(1);
        config.retry.max_delay = Duration::from_millis(5);
        config.rotation.rotate_after_downloads = None;

        let ledger = Ledger::open(&config.ledger.path).await.unwrap();
        Self {
            dir,
            config,
            ledger,
        }
    }

    fn files_dir(&self) -> PathBuf {
        self.dir.path().join("files")
    }

    fn item(&self, n: usize) -> Item {
        Item::new(
            format!("item-{}", n),
            Some(format!("https://cdn.example.com/{}.pdf", n)),
            self.files_dir().join(format!("{}.pdf", n)),
            ArtifactKind::File,
        )
    }

    async fn import(&self, count: usize) -> Vec<Item> {
        let items: Vec<Item> = (1..=count).map(|n| self.item(n)).collect();
        self.ledger.import(items.clone()).await.unwrap();
        items
    }

    fn scheduler(&self, transport: Arc<dyn Transport>) -> Scheduler {
        self.scheduler_with_auth(transport, StaticAuthenticator::default())
    }

    fn scheduler_with_auth(
        &self,
        transport: Arc<dyn Transport>,
        authenticator: StaticAuthenticator,
    ) -> Scheduler {
        let identities = self.config.identities.iter().map(Identity::from).collect();
        let pool = Arc::new(IdentityPool::new(
            identities,
            self.config.rotation.clone(),
            self.config.scheduler.request_delay,
        ));
        Scheduler::new(
            &self.config,
            self.ledger.clone(),
            pool,
            Arc::new(authenticator),
            transport,
        )
    }
}

fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).unwrap().len()
}

#[tokio::test]
async fn test_run_drains_batch() {
    let h = Harness::new(&[("a", 10)]).await;
    let items = h.import(4).await;
    let transport = ScriptedTransport::always(200);
    let scheduler = h.scheduler(transport.clone());
    let mut events = scheduler.subscribe();

    let report = scheduler.run(CancellationToken::new()).await;

    assert!(matches!(report.outcome, RunOutcome::Drained));
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.summary.succeeded, 4);
    assert_eq!(transport.requests(), 4);

    for item in &items {
        assert_eq!(file_len(&item.target_path), BODY_SIZE as u64);
        let record = h.ledger.get(&item.id).await.unwrap().unwrap();
        assert_eq!(record.status, Status::Succeeded);
        assert_eq!(record.identity_used, Some(IdentityId::from("a")));
        assert_eq!(record.attempts, 1);
    }

    let events = drain_events(&mut events);
    let started = events
        .iter()
        .filter(|e| matches!(e, Event::ItemStarted { .. }))
        .count();
    assert_eq!(started, 4);
    assert!(matches!(
        events.last(),
        Some(Event::RunFinished {
            succeeded: 4,
            failed_permanent: 0,
            failed_exhausted: 0
        })
    ));
}

#[tokio::test]
async fn test_quota_exhaustion_stops_run() {
    let h = Harness::new(&[("a", 2), ("b", 2), ("c", 2)]).await;
    h.import(10).await;
    let transport = ScriptedTransport::always(200);
    let scheduler = h.scheduler(transport.clone());
    let mut events = scheduler.subscribe();

    let report = scheduler.run(CancellationToken::new()).await;

    assert!(matches!(report.outcome, RunOutcome::IdentitiesExhausted));
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.summary.succeeded, 6);
    assert_eq!(report.summary.failed_exhausted.len(), 4);
    assert!(
        report.summary.failed_exhausted[0]
            .reason
            .starts_with("AllIdentitiesExhaustedError")
    );
    assert_eq!(transport.requests(), 6);

    let counts = h.ledger.counts().await.unwrap();
    assert_eq!(counts.succeeded, 6);
    assert_eq!(counts.pending, 4);

    for snapshot in scheduler.pool().snapshot().await {
        assert_eq!(snapshot.usage, 2);
    }

    let events = drain_events(&mut events);
    let exhausted = events
        .iter()
        .filter(|e| matches!(e, Event::IdentitiesExhausted))
        .count();
    assert_eq!(exhausted, 1);
}

#[tokio::test]
async fn test_existing_file_is_skipped_without_identity() {
    let h = Harness::new(&[("a", 1)]).await;
    let items = h.import(1).await;
    std::fs::create_dir_all(h.files_dir()).unwrap();
    std::fs::write(&items[0].target_path, vec![1u8; 4096]).unwrap();

    let transport = ScriptedTransport::always(200);
    let scheduler = h.scheduler(transport.clone());
    let report = scheduler.run(CancellationToken::new()).await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.summary.skipped, 1);
    assert_eq!(transport.requests(), 0);
    assert_eq!(file_len(&items[0].target_path), 4096);

    let record = h.ledger.get(&items[0].id).await.unwrap().unwrap();
    assert_eq!(record.status, Status::Succeeded);
    assert_eq!(record.identity_used, None);
    assert_eq!(scheduler.pool().snapshot().await[0].usage, 0);
}

#[tokio::test]
async fn test_not_found_fails_permanently_without_blaming_identity() {
    let h = Harness::new(&[("a", 5)]).await;
    let items = h.import(1).await;
    let transport = ScriptedTransport::always(404);
    let scheduler = h.scheduler(transport.clone());

    let report = scheduler.run(CancellationToken::new()).await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.summary.failed_permanent.len(), 1);
    assert_eq!(transport.requests(), 1);

    let record = h.ledger.get(&items[0].id).await.unwrap().unwrap();
    assert_eq!(record.status, Status::FailedPermanent);
    assert_eq!(record.attempts, 1);
    assert!(
        record
            .last_error
            .unwrap()
            .starts_with("PermanentRemoteError: HTTP 404")
    );
    assert_eq!(scheduler.pool().snapshot().await[0].consecutive_failures, 0);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let h = Harness::new(&[("a", 5)]).await;
    let items = h.import(1).await;
    let transport = ScriptedTransport::new(|_, nth| if nth == 1 { 503 } else { 200 });
    let scheduler = h.scheduler(transport.clone());
    let mut events = scheduler.subscribe();

    let report = scheduler.run(CancellationToken::new()).await;

    assert_eq!(report.summary.succeeded, 1);
    assert_eq!(transport.requests(), 2);

    let record = h.ledger.get(&items[0].id).await.unwrap().unwrap();
    assert_eq!(record.status, Status::Succeeded);
    assert_eq!(record.attempts, 2);

    let retried = drain_events(&mut events).into_iter().any(|e| {
        matches!(e, Event::AttemptFailed { attempt: 1, ref error, .. }
            if error.starts_with("TransientNetworkError"))
    });
    assert!(retried);
}

#[tokio::test]
async fn test_transient_failures_give_up_after_max_attempts() {
    let h = Harness::new(&[("a", 5)]).await;
    let items = h.import(1).await;
    let transport = ScriptedTransport::always(503);
    let scheduler = h.scheduler(transport.clone());

    let report = scheduler.run(CancellationToken::new()).await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(transport.requests(), 3);

    let record = h.ledger.get(&items[0].id).await.unwrap().unwrap();
    assert_eq!(record.status, Status::FailedPermanent);
    assert_eq!(record.attempts, 3);
    let reason = record.last_error.unwrap();
    assert!(reason.starts_with("TransientNetworkError: HTTP 503"));
    assert!(reason.ends_with("(gave up after 3 attempts)"));
    assert!(!items[0].target_path.exists());
}

#[tokio::test]
async fn test_failure_threshold_rotates_to_next_identity() {
    let mut h = Harness::new(&[("a", 5), ("b", 5)]).await;
    h.config.rotation.failure_threshold = 2;
    let items = h.import(1).await;
    let transport = ScriptedTransport::new(|identity, _| if identity == "a" { 500 } else { 200 });
    let scheduler = h.scheduler(transport.clone());
    let mut events = scheduler.subscribe();

    let report = scheduler.run(CancellationToken::new()).await;

    assert_eq!(report.summary.succeeded, 1);
    assert_eq!(transport.identities_used(), vec!["a", "a", "b"]);

    let record = h.ledger.get(&items[0].id).await.unwrap().unwrap();
    assert_eq!(record.identity_used, Some(IdentityId::from("b")));
    assert_eq!(record.attempts, 3);

    let rotated = drain_events(&mut events).into_iter().any(|e| {
        matches!(e, Event::IdentityRotated { ref from, to: Some(ref to), .. }
            if *from == "a" && *to == "b")
    });
    assert!(rotated);
}

#[tokio::test]
async fn test_quota_signal_does_not_consume_attempt_budget() {
    let mut h = Harness::new(&[("a", 5), ("b", 5)]).await;
    h.config.retry.max_attempts = 1;
    let items = h.import(1).await;
    let transport = ScriptedTransport::new(|identity, _| if identity == "a" { 429 } else { 200 });
    let scheduler = h.scheduler(transport.clone());

    let report = scheduler.run(CancellationToken::new()).await;

    assert_eq!(report.summary.succeeded, 1);
    let record = h.ledger.get(&items[0].id).await.unwrap().unwrap();
    assert_eq!(record.identity_used, Some(IdentityId::from("b")));
    assert_eq!(record.attempts, 2);

    let snapshot = scheduler.pool().snapshot().await;
    assert_eq!(snapshot[0].usage, snapshot[0].quota);
}

#[tokio::test]
async fn test_authentication_failure_counts_against_identity() {
    let mut h = Harness::new(&[("a", 5), ("b", 5)]).await;
    h.config.rotation.failure_threshold = 1;
    let items = h.import(1).await;
    let transport = ScriptedTransport::always(200);
    let authenticator = StaticAuthenticator {
        rejected: HashSet::from(["a".to_string()]),
        ..Default::default()
    };
    let scheduler = h.scheduler_with_auth(transport.clone(), authenticator);

    let report = scheduler.run(CancellationToken::new()).await;

    assert_eq!(report.summary.succeeded, 1);
    assert_eq!(transport.identities_used(), vec!["b"]);
    let record = h.ledger.get(&items[0].id).await.unwrap().unwrap();
    assert_eq!(record.identity_used, Some(IdentityId::from("b")));

    let snapshot = scheduler.pool().snapshot().await;
    assert!(snapshot[0].rotated_out);
}

#[tokio::test]
async fn test_sessions_are_reused_across_items() {
    let h = Harness::new(&[("a", 10)]).await;
    h.import(3).await;
    let authenticator = Arc::new(StaticAuthenticator::default());

    struct Shared(Arc<StaticAuthenticator>);

    #[async_trait]
    impl Authenticator for Shared {
        async fn authenticate(&self, identity: &Identity) -> Result<AccessContext, AuthError> {
            self.0.authenticate(identity).await
        }
    }

    let identities = h.config.identities.iter().map(Identity::from).collect();
    let pool = Arc::new(IdentityPool::new(identities, h.config.rotation.clone(), Duration::ZERO));
    let mut config = h.config.clone();
    config.scheduler.file_concurrency = 1;
    let scheduler = Scheduler::new(
        &config,
        h.ledger.clone(),
        pool,
        Arc::new(Shared(authenticator.clone())),
        ScriptedTransport::always(200),
    );

    let report = scheduler.run(CancellationToken::new()).await;

    assert_eq!(report.summary.succeeded, 3);
    assert_eq!(authenticator.logins.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cancelled_run_dispatches_nothing() {
    let h = Harness::new(&[("a", 10)]).await;
    h.import(3).await;
    let transport = ScriptedTransport::always(200);
    let scheduler = h.scheduler(transport.clone());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = scheduler.run(cancel).await;

    assert!(matches!(report.outcome, RunOutcome::Cancelled));
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.summary.processed(), 0);
    assert_eq!(transport.requests(), 0);
    assert_eq!(h.ledger.counts().await.unwrap().pending, 3);
}

#[tokio::test]
async fn test_usage_is_seeded_from_ledger() {
    let h = Harness::new(&[("a", 2), ("b", 5)]).await;
    let items = h.import(3).await;
    for item in &items[..2] {
        let update = RecordUpdate::new(item, Status::Succeeded)
            .with_identity(Some(IdentityId::from("a")))
            .with_attempts(1);
        h.ledger.record(update).await.unwrap();
    }

    let transport = ScriptedTransport::always(200);
    let scheduler = h.scheduler(transport.clone());
    let report = scheduler.run(CancellationToken::new()).await;

    assert_eq!(report.summary.succeeded, 1);
    assert_eq!(transport.identities_used(), vec!["b"]);
}

#[tokio::test]
async fn test_resume_leaves_succeeded_items_alone() {
    let h = Harness::new(&[("a", 20)]).await;
    let items = h.import(5).await;

    let first = h.scheduler(ScriptedTransport::always(200));
    assert_eq!(first.run(CancellationToken::new()).await.summary.succeeded, 5);
    let before = h.ledger.get(&items[0].id).await.unwrap().unwrap();

    let transport = ScriptedTransport::always(200);
    let second = h.scheduler(transport.clone());
    let report = second.run(CancellationToken::new()).await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.summary.processed(), 0);
    assert_eq!(transport.requests(), 0);
    assert_eq!(h.ledger.get(&items[0].id).await.unwrap().unwrap(), before);
}

#[tokio::test]
async fn test_failed_items_stay_put_without_retry_failed() {
    let mut h = Harness::new(&[("a", 5)]).await;
    h.config.scheduler.retry_failed = false;
    let items = h.import(1).await;
    let update = RecordUpdate::new(&items[0], Status::FailedPermanent).with_error("PermanentRemoteError: gone");
    h.ledger.record(update).await.unwrap();

    let transport = ScriptedTransport::always(200);
    let report = h.scheduler(transport.clone()).run(CancellationToken::new()).await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(transport.requests(), 0);
    let record = h.ledger.get(&items[0].id).await.unwrap().unwrap();
    assert_eq!(record.status, Status::FailedPermanent);
}

#[tokio::test]
async fn test_closed_ledger_is_fatal() {
    let h = Harness::new(&[("a", 5)]).await;
    h.import(2).await;
    h.ledger.close().await.unwrap();

    let report = h
        .scheduler(ScriptedTransport::always(200))
        .run(CancellationToken::new())
        .await;

    assert!(matches!(report.outcome, RunOutcome::Fatal(_)));
    assert_eq!(report.exit_code(), 2);
}

#[tokio::test]
async fn test_exhaustion_keeps_earlier_permanent_failures() {
    let h = Harness::new(&[("a", 1)]).await;
    let items = h.import(3).await;
    let done = RecordUpdate::new(&items[0], Status::Succeeded)
        .with_identity(Some(IdentityId::from("a")))
        .with_attempts(1);
    h.ledger.record(done).await.unwrap();
    let failed = RecordUpdate::new(&items[1], Status::FailedPermanent)
        .with_error("PermanentRemoteError: HTTP 404")
        .with_attempts(1);
    h.ledger.record(failed).await.unwrap();

    let transport = ScriptedTransport::always(200);
    let report = h.scheduler(transport.clone()).run(CancellationToken::new()).await;

    assert!(matches!(report.outcome, RunOutcome::IdentitiesExhausted));
    assert_eq!(transport.requests(), 0);
    assert_eq!(report.summary.failed_exhausted.len(), 2);

    let kept = h.ledger.get(&items[1].id).await.unwrap().unwrap();
    assert_eq!(kept.status, Status::FailedPermanent);
    assert_eq!(kept.last_error.as_deref(), Some("PermanentRemoteError: HTTP 404"));
    assert_eq!(kept.attempts, 1);

    let open = h.ledger.get(&items[2].id).await.unwrap().unwrap();
    assert_eq!(open.status, Status::Pending);
    assert!(open.last_error.unwrap().starts_with("AllIdentitiesExhaustedError"));
}

#[tokio::test]
async fn test_drained_rerun_on_spent_quota_day_exits_cleanly() {
    let h = Harness::new(&[("a", 2)]).await;
    h.import(2).await;

    let first = h.scheduler(ScriptedTransport::always(200));
    let report = first.run(CancellationToken::new()).await;
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.summary.succeeded, 2);

    let transport = ScriptedTransport::always(200);
    let second = h.scheduler(transport.clone());
    let mut events = second.subscribe();
    let report = second.run(CancellationToken::new()).await;

    assert!(matches!(report.outcome, RunOutcome::Drained));
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.summary.processed(), 0);
    assert_eq!(transport.requests(), 0);
    assert!(
        !drain_events(&mut events)
            .iter()
            .any(|e| matches!(e, Event::IdentitiesExhausted))
    );
}

#[tokio::test]
async fn test_attempt_timeout_is_retried_as_transient() {
    let mut h = Harness::new(&[("a", 5)]).await;
    h.config.scheduler.file_timeout = Duration::from_millis(100);
    h.config.retry.max_attempts = 2;
    let items = h.import(1).await;
    let transport = Arc::new(StallingTransport::default());

    let report = h.scheduler(transport.clone()).run(CancellationToken::new()).await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(transport.requests.load(Ordering::SeqCst), 2);

    let record = h.ledger.get(&items[0].id).await.unwrap().unwrap();
    assert_eq!(record.status, Status::FailedPermanent);
    assert_eq!(record.attempts, 2);
    let reason = record.last_error.unwrap();
    assert!(reason.starts_with("TransientNetworkError: attempt timed out after"));
    assert!(reason.ends_with("(gave up after 2 attempts)"));

    let left: Vec<_> = std::fs::read_dir(h.files_dir())
        .map(|entries| entries.map(|e| e.unwrap().path()).collect())
        .unwrap_or_default();
    assert!(left.is_empty(), "left on disk: {:?}", left);
}

#[tokio::test]
async fn test_cancel_mid_download_leaves_item_pending() {
    let h = Harness::new(&[("a", 5)]).await;
    let items = h.import(1).await;
    let transport = Arc::new(StallingTransport::default());
    let scheduler = h.scheduler(transport.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let watcher = Arc::clone(&transport);
    tokio::spawn(async move {
        watcher.started.notified().await;
        // Let the first chunk reach the partial file
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(Duration::from_secs(10), scheduler.run(cancel))
        .await
        .expect("run did not stop after cancellation");

    assert!(matches!(report.outcome, RunOutcome::Cancelled));
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.summary.cancelled, 1);

    let record = h.ledger.get(&items[0].id).await.unwrap().unwrap();
    assert_eq!(record.status, Status::Pending);
    assert!(record.last_error.unwrap().starts_with("Cancelled"));

    let left: Vec<_> = std::fs::read_dir(h.files_dir())
        .map(|entries| entries.map(|e| e.unwrap().path()).collect())
        .unwrap_or_default();
    assert!(left.is_empty(), "left on disk: {:?}", left);
    assert_eq!(scheduler.pool().snapshot().await[0].usage, 0);
}

#[tokio::test]
async fn test_run_restricted_to_item_ids() {
    let mut h = Harness::new(&[("a", 10)]).await;
    let items = h.import(4).await;
    h.config.scheduler.only_items = vec![items[1].id.clone(), items[3].id.clone()];

    let transport = ScriptedTransport::always(200);
    let report = h.scheduler(transport.clone()).run(CancellationToken::new()).await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.summary.succeeded, 2);
    assert_eq!(transport.requests(), 2);

    for (n, item) in items.iter().enumerate() {
        let record = h.ledger.get(&item.id).await.unwrap().unwrap();
        let expected = if n == 1 || n == 3 {
            Status::Succeeded
        } else {
            Status::Pending
        };
        assert_eq!(record.status, expected, "{}", item.id);
    }
}

#[tokio::test]
async fn test_batch_limit_caps_items_per_run() {
    let mut h = Harness::new(&[("a", 10)]).await;
    h.config.scheduler.batch_limit = Some(2);
    h.config.scheduler.file_concurrency = 1;
    h.import(5).await;

    let transport = ScriptedTransport::always(200);
    let report = h.scheduler(transport.clone()).run(CancellationToken::new()).await;

    assert!(matches!(report.outcome, RunOutcome::Drained));
    assert_eq!(report.summary.succeeded, 2);
    assert_eq!(transport.requests(), 2);

    let counts = h.ledger.counts().await.unwrap();
    assert_eq!(counts.succeeded, 2);
    assert_eq!(counts.pending, 3);
}
