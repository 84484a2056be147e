// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 The spb-curate Authors.

//! Bulk asset upload.
//!
//! [`BulkUploader`] turns an ordered batch of [`AssetDescriptor`] into one
//! [`UploadResult`] per descriptor, in input order.  Local bytes go through
//! the service's two-step staging protocol:
//!
//! 1. payloads are grouped into chunks bounded by
//!    [`UploadOptions::bulk_upload_object_max`] objects and
//!    [`UploadOptions::bulk_upload_bytes_max`] bytes,
//! 2. one presigned upload URL per object is requested for each chunk,
//! 3. every payload is PUT to its URL, at most
//!    [`UploadOptions::max_concurrency`] at a time.
//!
//! Each request runs through the client's [`RetryPolicy`].  A failure that
//! survives the retries is recorded on the affected items only; the rest of
//! the batch carries on.

use crate::{
    Error,
    api::{AssetUploadParams, PresignedAsset, PresignedAssets},
    asset::{
        AssetDescriptor, AssetReference, AssetSource, BatchSummary, UploadFailure, UploadResult,
        validate_keys,
    },
    config::{Credentials, missing_credentials},
    retry::RetryPolicy,
    transport::{Request, RequestBody, Target, Transport},
};
use futures::future::join_all;
use log::{debug, info, warn};
use std::{
    future::Future,
    ops::Range,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::{
    io::AsyncReadExt as _,
    sync::{Semaphore, mpsc::Sender},
};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_CONCURRENCY: usize = 8;
pub const BULK_UPLOAD_BYTES_MAX: u64 = 256_000_000;
pub const BULK_UPLOAD_OBJECT_MAX: usize = 100;
pub const ASSET_BYTES_MAX: u64 = 20_000_000;

const BULK_ASSETS_PATH: &str = "/curate/batch/assets/bulk/";
const SNIFF_BYTES: usize = 8192;

/// Progress information for long-running operations.
///
/// Sent after each item of a batch is settled, whether it was uploaded or
/// failed.
///
/// ```rust
/// use curate_client::Progress;
///
/// let progress = Progress {
///     current: 25,
///     total: 100,
/// };
/// let percentage = (progress.current as f64 / progress.total as f64) * 100.0;
/// assert_eq!(percentage, 25.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Number of settled items.
    pub current: usize,
    /// Number of items in the batch.
    pub total: usize,
}

/// How [`AssetSource::Url`] assets are handled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UrlUploadMode {
    /// Forward the URL; the service fetches the image itself.
    #[default]
    ByReference,
    /// Download the bytes and upload them like a local file.
    Download,
}

/// Tuning of a [`BulkUploader`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadOptions {
    max_concurrency: usize,
    bulk_upload_bytes_max: u64,
    bulk_upload_object_max: usize,
    asset_bytes_max: u64,
    url_mode: UrlUploadMode,
}

impl Default for UploadOptions {
    fn default() -> Self {
        UploadOptions {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            bulk_upload_bytes_max: BULK_UPLOAD_BYTES_MAX,
            bulk_upload_object_max: BULK_UPLOAD_OBJECT_MAX,
            asset_bytes_max: ASSET_BYTES_MAX,
            url_mode: UrlUploadMode::default(),
        }
    }
}

impl UploadOptions {
    /// Maximum number of uploads in flight (at least one).
    pub fn with_max_concurrency(self, max_concurrency: usize) -> Self {
        UploadOptions {
            max_concurrency: max_concurrency.max(1),
            ..self
        }
    }

    pub fn with_bulk_upload_bytes_max(self, bytes: u64) -> Self {
        UploadOptions {
            bulk_upload_bytes_max: bytes.max(1),
            ..self
        }
    }

    pub fn with_bulk_upload_object_max(self, objects: usize) -> Self {
        UploadOptions {
            bulk_upload_object_max: objects.max(1),
            ..self
        }
    }

    pub fn with_asset_bytes_max(self, bytes: u64) -> Self {
        UploadOptions {
            asset_bytes_max: bytes,
            ..self
        }
    }

    pub fn with_url_mode(self, url_mode: UrlUploadMode) -> Self {
        UploadOptions { url_mode, ..self }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn bulk_upload_bytes_max(&self) -> u64 {
        self.bulk_upload_bytes_max
    }

    pub fn bulk_upload_object_max(&self) -> usize {
        self.bulk_upload_object_max
    }

    pub fn asset_bytes_max(&self) -> u64 {
        self.asset_bytes_max
    }

    pub fn url_mode(&self) -> UrlUploadMode {
        self.url_mode
    }
}

/// Bytes ready to be staged.
#[derive(Debug)]
struct Payload {
    index: usize,
    key: String,
    size: u64,
    body: RequestBody,
}

/// Shared progress counter of one batch.
struct Tracker {
    current: AtomicUsize,
    total: usize,
    progress: Option<Sender<Progress>>,
}

impl Tracker {
    fn new(total: usize, progress: Option<Sender<Progress>>) -> Self {
        Tracker {
            current: AtomicUsize::new(0),
            total,
            progress,
        }
    }

    async fn advance(&self) {
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(progress) = &self.progress {
            let _ = progress
                .send(Progress {
                    current,
                    total: self.total,
                })
                .await;
        }
    }
}

/// Splits consecutive payload sizes into staging chunks.  A chunk is closed
/// once it holds `max_objects` payloads or its total reaches `max_bytes`.
pub(crate) fn chunk_ranges(sizes: &[u64], max_objects: usize, max_bytes: u64) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut bytes = 0u64;

    for (i, size) in sizes.iter().enumerate() {
        bytes = bytes.saturating_add(*size);
        if bytes >= max_bytes || i + 1 - start == max_objects {
            ranges.push(start..i + 1);
            start = i + 1;
            bytes = 0;
        }
    }

    if start < sizes.len() {
        ranges.push(start..sizes.len());
    }

    ranges
}

/// Runs `work_fn` over `items` on spawned tasks, at most as many at once as
/// `sem` has permits.  Returns one slot per item in input order; the slot is
/// `None` when the token was cancelled before the item started.
async fn bounded_foreach<T, R, F, Fut>(
    sem: &Arc<Semaphore>,
    cancel: &CancellationToken,
    items: Vec<T>,
    work_fn: F,
) -> Result<Vec<Option<R>>, Error>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let work_fn = Arc::new(work_fn);

    let tasks = items
        .into_iter()
        .map(|item| {
            let sem = sem.clone();
            let cancel = cancel.clone();
            let work_fn = work_fn.clone();

            tokio::spawn(async move {
                let _permit = match sem.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(err) => return Err(Error::from(err)),
                };
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                Ok(Some(work_fn(item).await))
            })
        })
        .collect::<Vec<_>>();

    join_all(tasks)
        .await
        .into_iter()
        .map(|joined| match joined {
            Ok(slot) => slot,
            Err(err) => Err(Error::from(err)),
        })
        .collect()
}

/// Uploads batches of assets.  Cheap to clone; clones share the transport.
#[derive(Clone)]
pub struct BulkUploader {
    transport: Arc<dyn Transport>,
    credentials: Option<Credentials>,
    retry: RetryPolicy,
    options: UploadOptions,
}

impl std::fmt::Debug for BulkUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkUploader")
            .field("credentials", &self.credentials)
            .field("retry", &self.retry)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl BulkUploader {
    pub fn new(
        transport: Arc<dyn Transport>,
        credentials: Option<Credentials>,
        retry: RetryPolicy,
        options: UploadOptions,
    ) -> Self {
        BulkUploader {
            transport,
            credentials,
            retry,
            options,
        }
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    /// Uploads `assets` and returns one result per asset, in input order.
    ///
    /// Fails as a whole only when the batch itself is invalid (an empty or
    /// duplicate key) or bytes must be staged without credentials, before
    /// any request is sent.  Everything else that goes
    /// wrong is reported in the affected item's [`UploadResult`].
    pub async fn upload(
        &self,
        assets: &[AssetDescriptor],
        progress: Option<Sender<Progress>>,
    ) -> Result<Vec<UploadResult>, Error> {
        self.upload_with_cancel(assets, progress, &CancellationToken::new())
            .await
    }

    /// Like [`upload`][Self::upload] but stops starting new uploads once
    /// `cancel` is triggered.  Uploads already in flight run to completion;
    /// items that never started report [`UploadResult::Cancelled`].
    #[cfg_attr(
        feature = "profiling",
        tracing::instrument(skip_all, fields(count = assets.len()))
    )]
    pub async fn upload_with_cancel(
        &self,
        assets: &[AssetDescriptor],
        progress: Option<Sender<Progress>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<UploadResult>, Error> {
        validate_keys(assets)?;

        let stages_bytes = assets.iter().any(|asset| match asset.source() {
            AssetSource::LocalFile(_) => true,
            AssetSource::Url(_) => self.options.url_mode == UrlUploadMode::Download,
        });
        if stages_bytes && self.credentials.is_none() {
            return Err(missing_credentials());
        }

        let total = assets.len();
        let tracker = Arc::new(Tracker::new(total, progress));
        let sem = Arc::new(Semaphore::new(self.options.max_concurrency));
        let mut results: Vec<Option<UploadResult>> = vec![None; total];

        info!(
            "Uploading {} assets (max concurrency {})",
            total, self.options.max_concurrency
        );

        let mut payloads = Vec::new();
        let mut downloads = Vec::new();

        for (index, asset) in assets.iter().enumerate() {
            match asset.source() {
                AssetSource::Url(url) if self.options.url_mode == UrlUploadMode::ByReference => {
                    results[index] = Some(UploadResult::Uploaded(AssetReference::Url {
                        url: url.clone(),
                    }));
                    tracker.advance().await;
                }
                AssetSource::Url(url) => {
                    downloads.push((index, asset.key().to_owned(), url.clone()));
                }
                AssetSource::LocalFile(path) => {
                    match stat_local(asset.key(), path, self.options.asset_bytes_max).await {
                        Ok((size, body)) => payloads.push(Payload {
                            index,
                            key: asset.key().to_owned(),
                            size,
                            body,
                        }),
                        Err(err) => {
                            warn!("Skipping asset '{}': {}", asset.key(), err);
                            results[index] = Some(UploadResult::Failed(UploadFailure::from(&err)));
                            tracker.advance().await;
                        }
                    }
                }
            }
        }

        // Downloads are spooled to disk and staged like local files.
        let staging = if downloads.is_empty() {
            None
        } else {
            Some(tempfile::Builder::new().prefix("curate-download-").tempdir()?)
        };

        if let Some(dir) = &staging {
            debug!(
                "Downloading {} remote assets to {}",
                downloads.len(),
                dir.path().display()
            );
            let root = dir.path().to_path_buf();
            let this = self.clone();
            let tracker_ = tracker.clone();
            let fetched = bounded_foreach(&sem, cancel, downloads, move |(index, key, url)| {
                let this = this.clone();
                let tracker = tracker_.clone();
                let dest = root.join(format!("{:06}", index));
                async move {
                    let fetched = this.download(&key, &url, &dest).await;
                    if fetched.is_err() {
                        tracker.advance().await;
                    }
                    (index, key, fetched)
                }
            })
            .await?;

            for (index, key, fetched) in fetched.into_iter().flatten() {
                match fetched {
                    Ok((size, body)) => payloads.push(Payload {
                        index,
                        key,
                        size,
                        body,
                    }),
                    Err(err) => {
                        warn!("Failed to download asset '{}': {}", key, err);
                        results[index] = Some(UploadResult::Failed(UploadFailure::from(&err)));
                    }
                }
            }
            // Keep staging order aligned with input order.
            payloads.sort_by_key(|p| p.index);
        }

        let sizes = payloads.iter().map(|p| p.size).collect::<Vec<_>>();
        let ranges = chunk_ranges(
            &sizes,
            self.options.bulk_upload_object_max,
            self.options.bulk_upload_bytes_max,
        );
        let chunks = ranges.len();
        let mut payloads = payloads.into_iter();

        for (n, range) in ranges.into_iter().enumerate() {
            let chunk = payloads.by_ref().take(range.len()).collect::<Vec<_>>();
            if cancel.is_cancelled() {
                debug!("Upload cancelled before chunk {}/{}", n + 1, chunks);
                break;
            }

            let presigned = match self.presign(&chunk).await {
                Ok(presigned) => presigned,
                Err(err) => {
                    warn!(
                        "Failed to stage chunk {}/{} ({} assets): {}",
                        n + 1,
                        chunks,
                        chunk.len(),
                        err
                    );
                    let failure = UploadFailure::from(&err);
                    for payload in &chunk {
                        results[payload.index] = Some(UploadResult::Failed(failure.clone()));
                        tracker.advance().await;
                    }
                    continue;
                }
            };

            let this = self.clone();
            let tracker_ = tracker.clone();
            let work = chunk.into_iter().zip(presigned).collect::<Vec<_>>();
            let uploaded = bounded_foreach(&sem, cancel, work, move |(payload, presigned)| {
                let this = this.clone();
                let tracker = tracker_.clone();
                async move {
                    let index = payload.index;
                    let result = this.put(payload, presigned).await;
                    tracker.advance().await;
                    (index, result)
                }
            })
            .await?;

            for (index, result) in uploaded.into_iter().flatten() {
                results[index] = Some(result);
            }

            info!(
                "Uploading local assets: chunk {}/{} done ({} of {} settled)",
                n + 1,
                chunks,
                tracker.current.load(Ordering::SeqCst),
                total
            );
        }

        let results = results
            .into_iter()
            .map(|r| r.unwrap_or(UploadResult::Cancelled))
            .collect::<Vec<_>>();

        info!("Upload finished: {}", BatchSummary::from_results(&results));
        Ok(results)
    }

    /// Requests one presigned URL per payload of a chunk.
    async fn presign(&self, chunk: &[Payload]) -> Result<Vec<PresignedAsset>, Error> {
        let params = AssetUploadParams {
            file_sizes: chunk.iter().map(|p| p.size).collect(),
        };
        let body = serde_json::to_value(&params)?;
        let idempotency_key = Some(uuid::Uuid::new_v4().to_string());

        let response = self
            .retry
            .run("presign assets", || {
                let request = Request::post(Target::Api(BULK_ASSETS_PATH.to_owned()))
                    .with_json(body.clone())
                    .with_credentials(self.credentials.clone())
                    .with_idempotency_key(idempotency_key.clone());
                self.transport.send(request)
            })
            .await?;

        let presigned: PresignedAssets = response.json()?;
        if presigned.results.len() != chunk.len() {
            return Err(Error::InvalidResponse(format!(
                "requested {} upload URLs but received {}",
                chunk.len(),
                presigned.results.len()
            )));
        }
        Ok(presigned.results)
    }

    /// PUTs one payload to its presigned URL.
    async fn put(&self, payload: Payload, presigned: PresignedAsset) -> UploadResult {
        let what = format!("upload '{}'", payload.key);
        let sent = self
            .retry
            .run(&what, || {
                let request = Request::put(Target::Url(presigned.upload_url.clone()))
                    .with_body(payload.body.clone());
                self.transport.send(request)
            })
            .await;

        match sent {
            Ok(_) => {
                debug!("Uploaded '{}' as asset {}", payload.key, presigned.id);
                UploadResult::Uploaded(AssetReference::Asset {
                    asset_id: presigned.id,
                })
            }
            Err(err) => {
                warn!("Failed to upload '{}': {}", payload.key, err);
                UploadResult::Failed(UploadFailure::from(&err))
            }
        }
    }

    /// Fetches a remote asset for [`UrlUploadMode::Download`] into `dest`.
    async fn download(&self, key: &str, url: &str, dest: &Path) -> Result<(u64, RequestBody), Error> {
        let what = format!("download '{}'", key);
        let limit = self.options.asset_bytes_max;
        let fetched = self
            .retry
            .run(&what, || {
                self.transport
                    .download(Request::get(Target::Url(url.to_owned())), dest, limit)
            })
            .await;

        match fetched {
            Ok(size) => debug!("Downloaded '{}' ({} bytes)", key, size),
            Err(Error::PayloadTooLarge { limit, size }) => {
                let message = match size {
                    Some(size) => format!("{} is {} bytes, above the {} byte limit", url, size, limit),
                    None => format!("{} is above the {} byte limit", url, limit),
                };
                return Err(Error::LocalAsset {
                    key: key.to_owned(),
                    message,
                });
            }
            Err(err) => return Err(err),
        }

        stat_local(key, dest, limit).await
    }
}

/// Checks a local file and prepares its streamed body.
async fn stat_local(key: &str, path: &Path, max_bytes: u64) -> Result<(u64, RequestBody), Error> {
    let local = |message: String| Error::LocalAsset {
        key: key.to_owned(),
        message,
    };

    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|e| local(format!("{}: {}", path.display(), e)))?;
    if !meta.is_file() {
        return Err(local(format!("{} is not a file", path.display())));
    }
    if meta.len() > max_bytes {
        return Err(local(format!(
            "{} is {} bytes, above the {} byte limit",
            path.display(),
            meta.len(),
            max_bytes
        )));
    }

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| local(format!("{}: {}", path.display(), e)))?;
    let mut head = vec![0u8; SNIFF_BYTES];
    let n = file
        .read(&mut head)
        .await
        .map_err(|e| local(format!("{}: {}", path.display(), e)))?;
    let content_type = infer::get(&head[..n]).map(|t| t.mime_type().to_owned());

    Ok((
        meta.len(),
        RequestBody::File {
            path: path.to_path_buf(),
            length: meta.len(),
            content_type,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_by_objects() {
        let sizes = vec![1; 250];
        let ranges = chunk_ranges(&sizes, 100, u64::MAX);
        assert_eq!(ranges, vec![0..100, 100..200, 200..250]);
    }

    #[test]
    fn test_chunk_by_bytes() {
        let sizes = vec![40, 40, 30, 10, 90, 5];
        let ranges = chunk_ranges(&sizes, 100, 100);
        assert_eq!(ranges, vec![0..3, 3..5, 5..6]);
        assert!(chunk_ranges(&[], 100, 100).is_empty());
    }

    #[test]
    fn test_options() {
        let options = UploadOptions::default();
        assert_eq!(options.max_concurrency(), DEFAULT_MAX_CONCURRENCY);
        assert_eq!(options.url_mode(), UrlUploadMode::ByReference);
        assert_eq!(options.bulk_upload_object_max(), 100);

        let options = options
            .with_max_concurrency(0)
            .with_url_mode(UrlUploadMode::Download);
        assert_eq!(options.max_concurrency(), 1);
        assert_eq!(options.url_mode(), UrlUploadMode::Download);
    }

    #[tokio::test]
    async fn test_stat_local() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("a.png");
        std::fs::write(&png, b"\x89PNG\r\n\x1a\n0000").unwrap();

        let (size, body) = stat_local("a", &png, 1024).await.unwrap();
        assert_eq!(size, 12);
        match body {
            RequestBody::File { content_type, .. } => {
                assert_eq!(content_type.as_deref(), Some("image/png"))
            }
            other => panic!("unexpected body: {:?}", other),
        }

        assert!(matches!(
            stat_local("a", &png, 4).await,
            Err(Error::LocalAsset { .. })
        ));
        assert!(matches!(
            stat_local("d", dir.path(), 1024).await,
            Err(Error::LocalAsset { .. })
        ));
        assert!(matches!(
            stat_local("m", &dir.path().join("missing.jpg"), 1024).await,
            Err(Error::LocalAsset { .. })
        ));
    }
}
