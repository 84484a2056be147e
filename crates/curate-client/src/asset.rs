// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 The spb-curate Authors.

use crate::{Error, api::AssetId};
use itertools::Itertools as _;
use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    fmt::Display,
    path::{Path, PathBuf},
};

/// Scalar metadata value attached to an asset.  Metadata is flat: nested
/// objects and arrays are not accepted by the service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum MetadataValue {
    Boolean(bool),
    Integer(i64),
    Real(f64),
    String(String),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::String(value.to_owned())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::String(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Integer(value)
    }
}

impl From<f64> for MetadataValue {
    fn from(value: f64) -> Self {
        MetadataValue::Real(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Boolean(value)
    }
}

/// Flat metadata map.  Ordered so that serialized job parameters are
/// deterministic.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// Where the bytes of an asset come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssetSource {
    /// A file on the local filesystem, uploaded by the client.
    LocalFile(PathBuf),
    /// A remote http(s) or ftp(s) URL.  Whether the service or the client
    /// fetches it is decided by [`UrlUploadMode`][crate::UrlUploadMode].
    Url(String),
}

impl AssetSource {
    pub fn local(path: impl AsRef<Path>) -> Self {
        AssetSource::LocalFile(path.as_ref().to_path_buf())
    }

    /// Validates and wraps a remote URL.
    ///
    /// ```rust
    /// use curate_client::AssetSource;
    ///
    /// assert!(AssetSource::url("https://cdn.example.com/cat.jpg").is_ok());
    /// assert!(AssetSource::url("ftp://10.0.0.2:2121/dog.png").is_ok());
    /// assert!(AssetSource::url("file:///etc/passwd").is_err());
    /// assert!(AssetSource::url("not a url").is_err());
    /// ```
    pub fn url(url: &str) -> Result<Self, Error> {
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::InvalidUrl(format!("{}: {}", url, e)))?;
        match parsed.scheme() {
            "http" | "https" | "ftp" | "ftps" => {}
            scheme => {
                return Err(Error::InvalidUrl(format!(
                    "{}: unsupported scheme '{}'",
                    url, scheme
                )));
            }
        }
        match parsed.host_str() {
            Some(host) if !host.is_empty() => Ok(AssetSource::Url(url.to_owned())),
            _ => Err(Error::InvalidUrl(format!("{}: missing host", url))),
        }
    }
}

/// One asset of a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct AssetDescriptor {
    key: String,
    source: AssetSource,
    metadata: Metadata,
}

impl AssetDescriptor {
    /// Creates a descriptor.  `key` must be unique within its batch.
    pub fn new(key: impl Into<String>, source: AssetSource) -> Self {
        AssetDescriptor {
            key: key.into(),
            source,
            metadata: Metadata::new(),
        }
    }

    pub fn local(key: impl Into<String>, path: impl AsRef<Path>) -> Self {
        AssetDescriptor::new(key, AssetSource::local(path))
    }

    pub fn url(key: impl Into<String>, url: &str) -> Result<Self, Error> {
        Ok(AssetDescriptor::new(key, AssetSource::url(url)?))
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn source(&self) -> &AssetSource {
        &self.source
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

/// Rejects batches with an empty or repeated key.
pub(crate) fn validate_keys(assets: &[AssetDescriptor]) -> Result<(), Error> {
    let mut seen = HashSet::with_capacity(assets.len());
    for asset in assets {
        if asset.key.trim().is_empty() {
            return Err(Error::InvalidParameters(
                "asset key must not be empty".to_string(),
            ));
        }
        if !seen.insert(asset.key.as_str()) {
            return Err(Error::DuplicateKey(asset.key.clone()));
        }
    }
    Ok(())
}

/// Image formats accepted by the service, as sniffed from file content.
const SUPPORTED_IMAGE_TYPES: &[&str] = &["image/bmp", "image/jpeg", "image/png", "image/webp"];

/// Finds the image files under `dir` and describes them as local assets.
///
/// Files are recognized by content, not extension; MPO files sniff as JPEG.
/// The key of each asset is its path relative to `dir`, with `/`
/// separators.  Only the top level is searched unless `recursive` is set.
pub fn discover_images(dir: &Path, recursive: bool) -> Result<Vec<AssetDescriptor>, Error> {
    if !dir.is_dir() {
        return Err(Error::InvalidParameters(format!(
            "{} is not a directory",
            dir.display()
        )));
    }

    let walker = walkdir::WalkDir::new(dir)
        .follow_links(true)
        .sort_by_file_name()
        .max_depth(if recursive { usize::MAX } else { 1 });

    let mut assets = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| Error::IoError(std::io::Error::other(e.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let mime = match infer::get_from_path(path) {
            Ok(Some(kind)) => kind.mime_type(),
            Ok(None) => continue,
            Err(err) => {
                debug!("Skipping unreadable {}: {}", path.display(), err);
                continue;
            }
        };
        if !SUPPORTED_IMAGE_TYPES.contains(&mime) {
            continue;
        }

        let relative = path.strip_prefix(dir).unwrap_or(path);
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .join("/");
        assets.push(AssetDescriptor::local(key, path));
    }

    debug!("Found {} images in {}", assets.len(), dir.display());
    Ok(assets)
}

/// Server-side handle for a staged asset, consumed by the job submitter.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum AssetReference {
    /// Bytes uploaded by the client.
    #[serde(rename = "LOCAL")]
    Asset { asset_id: AssetId },
    /// A URL the service fetches itself.
    Url { url: String },
}

/// Category of a per-item upload failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Missing, unreadable or oversized local file.
    LocalAsset,
    /// Transient failure that persisted through every retry.
    Transport,
    /// The service or storage rejected the request.
    Rejected,
}

impl Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            FailureKind::LocalAsset => "local asset",
            FailureKind::Transport => "transport",
            FailureKind::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

/// Failure record of one asset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&Error> for UploadFailure {
    fn from(err: &Error) -> Self {
        let kind = match err {
            Error::LocalAsset { .. } => FailureKind::LocalAsset,
            err if err.is_retryable() => FailureKind::Transport,
            _ => FailureKind::Rejected,
        };
        UploadFailure {
            kind,
            message: err.to_string(),
        }
    }
}

impl Display for UploadFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} failure: {}", self.kind, self.message)
    }
}

/// Outcome of one asset of a bulk upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadResult {
    Uploaded(AssetReference),
    Failed(UploadFailure),
    /// Not started because the batch was cancelled.
    Cancelled,
}

impl UploadResult {
    pub fn is_uploaded(&self) -> bool {
        matches!(self, UploadResult::Uploaded(_))
    }

    pub fn reference(&self) -> Option<&AssetReference> {
        match self {
            UploadResult::Uploaded(reference) => Some(reference),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&UploadFailure> {
        match self {
            UploadResult::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Counts of a batch's outcomes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub uploaded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    pub fn from_results(results: &[UploadResult]) -> Self {
        results.iter().fold(BatchSummary::default(), |mut s, r| {
            match r {
                UploadResult::Uploaded(_) => s.uploaded += 1,
                UploadResult::Failed(_) => s.failed += 1,
                UploadResult::Cancelled => s.cancelled += 1,
            }
            s
        })
    }

    pub fn total(&self) -> usize {
        self.uploaded + self.failed + self.cancelled
    }

    /// Some items failed while others succeeded.
    pub fn is_partial(&self) -> bool {
        self.uploaded > 0 && (self.failed > 0 || self.cancelled > 0)
    }
}

impl Display for BatchSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} uploaded, {} failed, {} cancelled",
            self.uploaded, self.failed, self.cancelled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_validate_keys() {
        let assets = vec![
            AssetDescriptor::local("a", "/tmp/a.jpg"),
            AssetDescriptor::local("b", "/tmp/b.jpg"),
        ];
        assert!(validate_keys(&assets).is_ok());

        let assets = vec![
            AssetDescriptor::local("a", "/tmp/a.jpg"),
            AssetDescriptor::local("b", "/tmp/b.jpg"),
            AssetDescriptor::local("a", "/tmp/c.jpg"),
        ];
        match validate_keys(&assets) {
            Err(Error::DuplicateKey(key)) => assert_eq!(key, "a"),
            other => panic!("expected duplicate key, got {:?}", other),
        }

        let assets = vec![AssetDescriptor::local(" ", "/tmp/a.jpg")];
        assert!(matches!(
            validate_keys(&assets),
            Err(Error::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_reference_serialization() {
        let asset = AssetReference::Asset {
            asset_id: AssetId::from_str("as-1").unwrap(),
        };
        assert_eq!(
            serde_json::to_value(&asset).unwrap(),
            serde_json::json!({"type": "LOCAL", "asset_id": "as-1"})
        );

        let url = AssetReference::Url {
            url: "https://example.com/a.png".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&url).unwrap(),
            serde_json::json!({"type": "URL", "url": "https://example.com/a.png"})
        );
    }

    #[test]
    fn test_metadata_serialization() {
        let asset = AssetDescriptor::local("a", "/tmp/a.jpg")
            .with_metadata("weather", "rain")
            .with_metadata("frame", 12i64)
            .with_metadata("score", 0.5)
            .with_metadata("reviewed", true);
        assert_eq!(
            serde_json::to_value(asset.metadata()).unwrap(),
            serde_json::json!({"frame": 12, "reviewed": true, "score": 0.5, "weather": "rain"})
        );
    }

    #[test]
    fn test_failure_kind() {
        let local = Error::LocalAsset {
            key: "a".to_string(),
            message: "missing".to_string(),
        };
        assert_eq!(UploadFailure::from(&local).kind, FailureKind::LocalAsset);

        let throttled = Error::FileTransfer {
            status: 503,
            message: "slow down".to_string(),
        };
        assert_eq!(UploadFailure::from(&throttled).kind, FailureKind::Transport);

        let denied = Error::FileTransfer {
            status: 403,
            message: "expired".to_string(),
        };
        assert_eq!(UploadFailure::from(&denied).kind, FailureKind::Rejected);
    }

    #[test]
    fn test_discover_images() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("a.png"), b"\x89PNG\r\n\x1a\n0000").unwrap();
        std::fs::write(dir.path().join("nested/b.jpg"), b"\xff\xd8\xff\xe0000000").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        // Named like an image but not one.
        std::fs::write(dir.path().join("fake.png"), b"not an image").unwrap();

        let flat = discover_images(dir.path(), false).unwrap();
        assert_eq!(
            flat.iter().map(|a| a.key()).collect::<Vec<_>>(),
            vec!["a.png"]
        );

        let all = discover_images(dir.path(), true).unwrap();
        assert_eq!(
            all.iter().map(|a| a.key()).collect::<Vec<_>>(),
            vec!["a.png", "nested/b.jpg"]
        );
        assert_eq!(
            all[1].source(),
            &AssetSource::LocalFile(dir.path().join("nested/b.jpg"))
        );

        assert!(discover_images(&dir.path().join("a.png"), true).is_err());
    }

    #[test]
    fn test_batch_summary() {
        let results = vec![
            UploadResult::Uploaded(AssetReference::Url {
                url: "https://example.com/a.png".to_string(),
            }),
            UploadResult::Failed(UploadFailure {
                kind: FailureKind::LocalAsset,
                message: "missing".to_string(),
            }),
            UploadResult::Cancelled,
        ];
        let summary = BatchSummary::from_results(&results);
        assert_eq!(summary.uploaded, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.total(), 3);
        assert!(summary.is_partial());
    }
}
