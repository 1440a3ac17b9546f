//! Manifest adapter for the scraper's output
//!
//! The scraper writes a JSON array of book records. Each record expands into
//! up to two items: the document itself (`<id>`) and its cover
//! (`<id>:cover`). Records without a URL still produce items; they have no
//! locator and fail permanently when attempted, so the gap stays visible in
//! the ledger.

use crate::config::PathsConfig;
use crate::error::{Error, Result};
use crate::types::{ArtifactKind, Item};
use crate::utils::{cover_extension, sanitize_component, sanitize_filename};
use serde::Deserialize;
use std::path::Path;

/// Suffix of cover item identifiers
pub const COVER_SUFFIX: &str = ":cover";

/// Identifier as the scraper wrote it
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RecordId {
    Text(String),
    Number(u64),
}

impl RecordId {
    fn into_string(self) -> String {
        match self {
            RecordId::Text(id) => id.trim().to_string(),
            RecordId::Number(id) => id.to_string(),
        }
    }
}

/// One record of the scraper's manifest
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestRecord {
    id: RecordId,
    /// Book title
    #[serde(default = "default_unknown")]
    pub title: String,
    /// Book author
    #[serde(default = "default_unknown")]
    pub author: String,
    /// Document file extension
    #[serde(default = "default_extension")]
    pub extension: String,
    /// Document download URL
    #[serde(default)]
    pub download_url: Option<String>,
    /// Cover image URL
    #[serde(default)]
    pub cover_url: Option<String>,
}

impl ManifestRecord {
    /// Record identifier
    pub fn id(&self) -> String {
        self.id.clone().into_string()
    }
}

fn default_unknown() -> String {
    "Unknown".to_string()
}

fn default_extension() -> String {
    "pdf".to_string()
}

/// Read a manifest file and expand it into items
pub fn load_manifest(path: &Path, paths: &PathsConfig) -> Result<Vec<Item>> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::InvalidManifest {
        path: path.to_path_buf(),
        reason: format!("failed to read: {}", e),
    })?;

    let records: Vec<ManifestRecord> =
        serde_json::from_str(&content).map_err(|e| Error::InvalidManifest {
            path: path.to_path_buf(),
            reason: format!("not a JSON array of book records: {}", e),
        })?;

    let mut items = Vec::with_capacity(records.len() * 2);
    for (index, record) in records.iter().enumerate() {
        if record.id().is_empty() {
            return Err(Error::InvalidManifest {
                path: path.to_path_buf(),
                reason: format!("record {} has an empty id", index),
            });
        }
        items.extend(expand_record(record, paths));
    }

    tracing::info!(
        path = %path.display(),
        records = records.len(),
        items = items.len(),
        "loaded manifest"
    );
    Ok(items)
}

/// Items for one record: the document and its cover
pub fn expand_record(record: &ManifestRecord, paths: &PathsConfig) -> [Item; 2] {
    let id = record.id();

    let mut stem = sanitize_filename(&record.title, &record.author, paths.max_filename_length);
    if stem.is_empty() {
        stem = sanitize_component(&id);
    }
    if stem.is_empty() {
        stem = "untitled".to_string();
    }

    let extension = sanitize_component(&record.extension).replace(' ', "");
    let extension = if extension.is_empty() { "pdf" } else { extension.as_str() };

    let download_url = non_empty(record.download_url.as_deref());
    let cover_url = non_empty(record.cover_url.as_deref());

    let file = Item::new(
        id.clone(),
        download_url.map(str::to_string),
        paths.files_dir.join(format!("{}.{}", stem, extension)),
        ArtifactKind::File,
    );

    let cover = Item::new(
        format!("{}{}", id, COVER_SUFFIX),
        cover_url.map(str::to_string),
        paths
            .covers_dir
            .join(format!("{}.{}", stem, cover_extension(cover_url))),
        ArtifactKind::Cover,
    );

    [file, cover]
}

fn non_empty(url: Option<&str>) -> Option<&str> {
    url.map(str::trim).filter(|u| !u.is_empty())
}
