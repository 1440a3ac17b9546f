//! Common test utilities for harvest-dl batch scenarios
//!
//! Each [`TestEnv`] owns a temporary directory (ledger, files, covers) and a
//! `wiremock` server standing in for the remote service. Identities get
//! anonymous sessions, since no login URL is configured.

#![allow(dead_code)]

use harvest_dl::config::IdentityConfig;
use harvest_dl::{ArtifactKind, Config, Item, Ledger, RunReport, Scheduler};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Size of every artifact the mock service serves
pub const ARTIFACT_SIZE: usize = 4096;

/// Temporary workspace plus mock service
pub struct TestEnv {
    pub dir: TempDir,
    pub server: MockServer,
    pub config: Config,
}

impl TestEnv {
    /// Environment with `identities` as (id, daily quota) pairs
    pub async fn new(identities: &[(&str, u32)]) -> Self {
        let dir = TempDir::new().unwrap();
        let server = MockServer::start().await;
        let config = test_config(dir.path(), identities);
        Self {
            dir,
            server,
            config,
        }
    }

    /// Replace the identity list, keeping everything else
    pub fn set_identities(&mut self, identities: &[(&str, u32)]) {
        self.config.identities = identity_configs(identities);
    }

    pub async fn open_ledger(&self) -> Ledger {
        Ledger::open(&self.config.ledger.path).await.unwrap()
    }

    /// Document item served from `/files/<id>`
    pub fn file_item(&self, id: &str) -> Item {
        Item::new(
            id,
            Some(format!("{}/files/{}", self.server.uri(), id)),
            self.config.paths.files_dir.join(format!("{}.pdf", id)),
            ArtifactKind::File,
        )
    }

    pub fn file_items(&self, count: usize) -> Vec<Item> {
        (1..=count)
            .map(|n| self.file_item(&format!("book-{:02}", n)))
            .collect()
    }

    /// Serve a valid PDF for every `/files/...` path
    pub async fn serve_files(&self) {
        Mock::given(method("GET"))
            .and(path_regex(r"^/files/.+$"))
            .respond_with(artifact("application/pdf"))
            .mount(&self.server)
            .await;
    }

    /// Serve a valid PNG for every `/covers/...` path
    pub async fn serve_covers(&self) {
        Mock::given(method("GET"))
            .and(path_regex(r"^/covers/.+$"))
            .respond_with(artifact("image/png"))
            .mount(&self.server)
            .await;
    }

    pub async fn requests(&self) -> usize {
        self.server.received_requests().await.unwrap_or_default().len()
    }

    /// Run the production scheduler against the mock service
    pub async fn run(&self, ledger: &Ledger) -> RunReport {
        Scheduler::from_config(&self.config, ledger.clone())
            .run(CancellationToken::new())
            .await
    }
}

/// Config pointing every path into `root` with test-friendly timings
pub fn test_config(root: &Path, identities: &[(&str, u32)]) -> Config {
    let mut config = Config::default();
    config.identities = identity_configs(identities);
    config.ledger.path = root.join("ledger.db");
    config.paths.files_dir = root.join("files");
    config.paths.covers_dir = root.join("covers");
    config.scheduler.request_delay = Duration::ZERO;
    config.scheduler.acquire_wait = Duration::from_secs(2);
    config.scheduler.file_timeout = Duration::from_secs(10);
    config.scheduler.cover_timeout = Duration::from_secs(10);
    config.retry.initial_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(20);
    config.rotation.rotate_after_downloads = None;
    config
}

fn identity_configs(identities: &[(&str, u32)]) -> Vec<IdentityConfig> {
    identities
        .iter()
        .map(|(id, quota)| IdentityConfig {
            id: id.to_string(),
            secret: format!("{}-secret", id),
            max_daily_downloads: *quota,
        })
        .collect()
}

/// 200 response with a valid artifact body
pub fn artifact(content_type: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(vec![0x25u8; ARTIFACT_SIZE], content_type)
}

/// Files under `dir`, including hidden partial files
pub fn files_in(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}
