// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 The spb-curate Authors.

use crate::{
    Error,
    api::{
        Annotation, CursorPage, Dataset, DatasetCreateParams, DatasetId, ImageRef, Job, JobId,
        JobType, Slice, SliceCreateParams, SliceId, SliceImages,
    },
    asset::{AssetDescriptor, BatchSummary, UploadResult, discover_images},
    config::{ClientConfig, Credentials, missing_credentials},
    job::{JobHandle, JobSubmitter, PollOptions},
    retry::RetryPolicy,
    transport::{HttpTransport, Request, Response, Target, Transport},
    upload::{BulkUploader, Progress, UploadOptions},
};
use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info};
use reqwest::Method;
use serde::Serialize;
use serde_json::json;
use std::{path::Path, sync::Arc};
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;

/// Page size used when listing.
const FETCH_PAGE_LIMIT: usize = 100;

/// Options of an image import.
#[derive(Clone, Debug, Default)]
pub struct ImportOptions {
    slice: Option<String>,
    wait: bool,
    cancel: Option<CancellationToken>,
}

impl ImportOptions {
    /// Also adds the imported images to the slice named `slice`, which must
    /// exist.
    pub fn with_slice(self, slice: &str) -> Self {
        ImportOptions {
            slice: Some(slice.to_owned()),
            ..self
        }
    }

    /// Waits for the import job with the client's [`PollOptions`] before
    /// returning.  The outcome is reported in [`ImageImport::wait`].
    pub fn with_wait(self, wait: bool) -> Self {
        ImportOptions { wait, ..self }
    }

    pub fn with_cancel(self, cancel: CancellationToken) -> Self {
        ImportOptions {
            cancel: Some(cancel),
            ..self
        }
    }
}

/// Outcome of [`Client::add_images`].
#[derive(Debug)]
pub struct ImageImport {
    /// One result per input asset, in input order.
    pub results: Vec<UploadResult>,
    pub summary: BatchSummary,
    /// The import job, absent when no asset could be staged.
    pub job: Option<JobHandle>,
    /// Outcome of waiting for the job, present when a wait was requested
    /// and a job was created.  An [`Error::Timeout`] here means the job is
    /// still running; the upload results above are final either way.
    pub wait: Option<Result<Job, Error>>,
}

#[derive(Serialize)]
struct ImageItem<'a> {
    key: &'a str,
    source: &'a crate::asset::AssetReference,
    metadata: &'a crate::asset::Metadata,
}

/// Client for the Superb AI Curate API.
///
/// A client holds its configuration explicitly: credentials, retry policy,
/// upload and polling options.  It is cheap to clone and every clone shares
/// the same connection pool, so a per-call override such as
/// [`with_credentials`][Self::with_credentials] costs nothing.
///
/// # Examples
///
/// ```no_run
/// use curate_client::{AssetDescriptor, Client, DatasetId, ImportOptions};
/// use std::str::FromStr;
///
/// # async fn example() -> Result<(), curate_client::Error> {
/// let client = Client::new()?;
///
/// let dataset = client.create_dataset("street-scenes", "Dashcam frames").await?;
/// let images = vec![
///     AssetDescriptor::local("0001.jpg", "frames/0001.jpg").with_metadata("weather", "rain"),
///     AssetDescriptor::url("0002.jpg", "https://cdn.example.com/0002.jpg")?,
/// ];
///
/// let import = client
///     .add_images(dataset.id(), &images, ImportOptions::default(), None)
///     .await?;
/// println!("{}", import.summary);
///
/// if let Some(mut job) = import.job {
///     let job = job.wait().await?;
///     println!("import finished: {}", job.status());
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn Transport>,
    credentials: Option<Credentials>,
    retry: RetryPolicy,
    upload: UploadOptions,
    poll: PollOptions,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("credentials", &self.credentials)
            .field("retry", &self.retry)
            .field("upload", &self.upload)
            .field("poll", &self.poll)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a client configured from `SPB_*` environment variables and the
    /// `~/.spb/config` credentials file.  See [`ClientConfig::from_env`].
    pub fn new() -> Result<Self, Error> {
        Self::from_config(ClientConfig::from_env()?)
    }

    /// Creates a client talking HTTPS to `config.api_base`.
    pub fn from_config(config: ClientConfig) -> Result<Self, Error> {
        let transport = HttpTransport::new(&config.api_base, config.timeout)?;
        Ok(Self::with_transport(Arc::new(transport), config))
    }

    /// Creates a client over a custom [`Transport`].  `config.api_base` and
    /// `config.timeout` are left to the transport.
    pub fn with_transport(transport: Arc<dyn Transport>, config: ClientConfig) -> Self {
        Client {
            transport,
            credentials: config.credentials,
            retry: config.retry,
            upload: config.upload,
            poll: config.poll,
        }
    }

    /// Returns a client that authenticates as `credentials` and shares this
    /// client's transport.
    pub fn with_credentials(&self, credentials: Credentials) -> Self {
        Client {
            credentials: Some(credentials),
            ..self.clone()
        }
    }

    pub fn with_retry(&self, retry: RetryPolicy) -> Self {
        Client {
            retry,
            ..self.clone()
        }
    }

    pub fn with_upload_options(&self, upload: UploadOptions) -> Self {
        Client {
            upload,
            ..self.clone()
        }
    }

    pub fn with_poll_options(&self, poll: PollOptions) -> Self {
        Client {
            poll,
            ..self.clone()
        }
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn upload_options(&self) -> &UploadOptions {
        &self.upload
    }

    pub fn poll_options(&self) -> PollOptions {
        self.poll
    }

    /// A bulk uploader sharing this client's transport and settings.
    pub fn uploader(&self) -> BulkUploader {
        BulkUploader::new(
            self.transport.clone(),
            self.credentials.clone(),
            self.retry.clone(),
            self.upload.clone(),
        )
    }

    /// A job submitter sharing this client's transport and settings.
    pub fn submitter(&self) -> JobSubmitter {
        JobSubmitter::new(self.clone())
    }

    /// Sends `request` through the retry policy.  API requests are
    /// authenticated, and writes carry one idempotency key shared by all of
    /// their attempts.
    pub(crate) async fn call(&self, what: &str, request: Request) -> Result<Response, Error> {
        let request = if request.target.is_api() {
            if self.credentials.is_none() {
                return Err(missing_credentials());
            }
            let idempotency_key = match request.method {
                Method::POST | Method::PUT | Method::PATCH => {
                    Some(uuid::Uuid::new_v4().to_string())
                }
                _ => None,
            };
            request
                .with_credentials(self.credentials.clone())
                .with_idempotency_key(idempotency_key)
        } else {
            request
        };

        self.retry
            .run(what, || self.transport.send(request.clone()))
            .await
    }

    /// Creates an empty dataset.
    pub async fn create_dataset(&self, name: &str, description: &str) -> Result<Dataset, Error> {
        if name.trim().is_empty() {
            return Err(Error::InvalidParameters(
                "dataset name must not be empty".to_string(),
            ));
        }
        let body = serde_json::to_value(DatasetCreateParams { name, description })?;
        let request =
            Request::post(Target::Api("/curate/dataset-core/datasets/".to_owned())).with_json(body);
        let dataset: Dataset = self.call("create dataset", request).await?.json()?;
        info!("Created dataset {}", dataset);
        Ok(dataset)
    }

    pub async fn dataset(&self, dataset_id: &DatasetId) -> Result<Dataset, Error> {
        let request = Request::get(Target::Api(format!(
            "/curate/dataset-query/datasets/{}/",
            dataset_id
        )))
        .with_query("expand", "image_count");
        self.call("fetch dataset", request).await?.json()
    }

    /// Deletes a dataset and its images.
    pub async fn delete_dataset(&self, dataset_id: &DatasetId) -> Result<(), Error> {
        let request = Request::delete(Target::Api(format!(
            "/curate/dataset-core/datasets/{}/",
            dataset_id
        )));
        self.call("delete dataset", request).await?;
        info!("Deleted dataset {}", dataset_id);
        Ok(())
    }

    /// Looks up a slice of a dataset by its exact name.
    pub async fn slice(&self, dataset_id: &DatasetId, name: &str) -> Result<Slice, Error> {
        let request = Request::get(Target::Api(format!(
            "/curate/dataset-query/datasets/{}/slices/",
            dataset_id
        )))
        .with_query("name", name)
        .with_query("size", FETCH_PAGE_LIMIT);
        let page: CursorPage<Slice> = self.call("fetch slice", request).await?.json()?;

        page.results
            .into_iter()
            .find(|slice| slice.name() == name)
            .ok_or_else(|| Error::InvalidParameters(format!("slice '{}' not found", name)))
    }

    /// Creates an empty slice in a dataset.
    pub async fn create_slice(
        &self,
        dataset_id: &DatasetId,
        name: &str,
        description: &str,
    ) -> Result<Slice, Error> {
        if name.trim().is_empty() {
            return Err(Error::InvalidParameters(
                "slice name must not be empty".to_string(),
            ));
        }
        let body = serde_json::to_value(SliceCreateParams { name, description })?;
        let request = Request::post(Target::Api(format!(
            "/curate/dataset-core/datasets/{}/slices/",
            dataset_id
        )))
        .with_json(body);
        let slice: Slice = self.call("create slice", request).await?.json()?;
        info!("Created slice {} '{}' in dataset {}", slice.id(), slice.name(), dataset_id);
        Ok(slice)
    }

    /// Deletes a slice.  Its images stay in the dataset.
    pub async fn delete_slice(&self, dataset_id: &DatasetId, slice_id: &SliceId) -> Result<(), Error> {
        let request = Request::delete(Target::Api(format!(
            "/curate/dataset-core/datasets/{}/slices/{}/",
            dataset_id, slice_id
        )));
        self.call("delete slice", request).await?;
        info!("Deleted slice {} of dataset {}", slice_id, dataset_id);
        Ok(())
    }

    /// Creates a job adding existing images to a slice.
    pub async fn add_images_to_slice(
        &self,
        dataset_id: &DatasetId,
        slice_id: &SliceId,
        images: &SliceImages,
    ) -> Result<JobHandle, Error> {
        self.update_slice(dataset_id, slice_id, images, false).await
    }

    /// Creates a job removing images from a slice.  The images stay in the
    /// dataset.
    pub async fn remove_images_from_slice(
        &self,
        dataset_id: &DatasetId,
        slice_id: &SliceId,
        images: &SliceImages,
    ) -> Result<JobHandle, Error> {
        self.update_slice(dataset_id, slice_id, images, true).await
    }

    async fn update_slice(
        &self,
        dataset_id: &DatasetId,
        slice_id: &SliceId,
        images: &SliceImages,
        remove: bool,
    ) -> Result<JobHandle, Error> {
        let submitter = self.submitter();
        match images {
            SliceImages::Images(images) if images.is_empty() => Err(Error::InvalidParameters(
                "no images to update the slice with".to_string(),
            )),
            SliceImages::Images(images) => {
                let param_id = submitter.upload_params(images).await?;
                let param = json!({
                    "dataset_id": dataset_id,
                    "images": { "param_id": param_id },
                    "slice_id": slice_id,
                    "remove": remove,
                });
                submitter.create(JobType::UpdateSlice, param).await
            }
            SliceImages::Query(query) if query.trim().is_empty() => Err(Error::InvalidParameters(
                "slice query must not be empty".to_string(),
            )),
            SliceImages::Query(query) => {
                let param = json!({
                    "dataset_id": dataset_id,
                    "image_filters": { "slice": null, "query": query },
                    "slice_id": slice_id,
                    "remove": remove,
                });
                submitter.create(JobType::UpdateSliceByQuery, param).await
            }
        }
    }

    /// Uploads `assets` without creating a job.  See [`BulkUploader::upload`].
    pub async fn upload_assets(
        &self,
        assets: &[AssetDescriptor],
        progress: Option<Sender<Progress>>,
    ) -> Result<Vec<UploadResult>, Error> {
        self.uploader().upload(assets, progress).await
    }

    /// Creates an image import job for the assets whose upload succeeded.
    ///
    /// `results` must be the output of uploading `assets`.  Returns `None`
    /// when no asset was uploaded.
    pub async fn submit_images(
        &self,
        dataset_id: &DatasetId,
        assets: &[AssetDescriptor],
        results: &[UploadResult],
        slice_id: Option<&SliceId>,
    ) -> Result<Option<JobHandle>, Error> {
        if assets.len() != results.len() {
            return Err(Error::InvalidParameters(format!(
                "{} assets but {} upload results",
                assets.len(),
                results.len()
            )));
        }

        let items = assets
            .iter()
            .zip(results)
            .filter_map(|(asset, result)| {
                result.reference().map(|source| ImageItem {
                    key: asset.key(),
                    source,
                    metadata: asset.metadata(),
                })
            })
            .collect::<Vec<_>>();

        if items.is_empty() {
            return Ok(None);
        }

        let job = self
            .submitter()
            .submit(JobType::ImageImport, dataset_id, "images", &items, slice_id)
            .await?;
        Ok(Some(job))
    }

    /// Uploads `assets` and imports them into a dataset.
    ///
    /// Per-asset failures do not fail the call: they are listed in
    /// [`ImageImport::results`] and the job is created for the rest.  Once
    /// the job exists, a failed or abandoned wait is reported in
    /// [`ImageImport::wait`] rather than raised.
    #[cfg_attr(
        feature = "profiling",
        tracing::instrument(skip_all, fields(dataset_id = %dataset_id, count = assets.len()))
    )]
    pub async fn add_images(
        &self,
        dataset_id: &DatasetId,
        assets: &[AssetDescriptor],
        options: ImportOptions,
        progress: Option<Sender<Progress>>,
    ) -> Result<ImageImport, Error> {
        let slice = match &options.slice {
            Some(name) => Some(self.slice(dataset_id, name).await?),
            None => None,
        };

        let cancel = options.cancel.unwrap_or_else(CancellationToken::new);
        let results = self
            .uploader()
            .upload_with_cancel(assets, progress, &cancel)
            .await?;
        let summary = BatchSummary::from_results(&results);

        let mut job = self
            .submit_images(dataset_id, assets, &results, slice.as_ref().map(|s| s.id()))
            .await?;

        let wait = match &mut job {
            Some(job) if options.wait => Some(job.wait().await),
            Some(_) => None,
            None => {
                info!("No assets were uploaded, skipping the import job");
                None
            }
        };

        Ok(ImageImport {
            results,
            summary,
            job,
            wait,
        })
    }

    /// Imports every image file found under `dir`.  Keys are paths relative
    /// to `dir`.
    pub async fn upload_images_from_directory(
        &self,
        dataset_id: &DatasetId,
        dir: &Path,
        recursive: bool,
        options: ImportOptions,
        progress: Option<Sender<Progress>>,
    ) -> Result<ImageImport, Error> {
        let assets = discover_images(dir, recursive)?;
        if assets.is_empty() {
            return Err(Error::InvalidParameters(format!(
                "no image files in {}",
                dir.display()
            )));
        }
        self.add_images(dataset_id, &assets, options, progress).await
    }

    /// Creates an annotation import job.
    pub async fn add_annotations(
        &self,
        dataset_id: &DatasetId,
        annotations: &[Annotation],
    ) -> Result<JobHandle, Error> {
        if annotations.is_empty() {
            return Err(Error::InvalidParameters(
                "no annotations to add".to_string(),
            ));
        }
        self.submitter()
            .submit(
                JobType::AnnotationImport,
                dataset_id,
                "annotations",
                annotations,
                None,
            )
            .await
    }

    /// Creates a job deleting images by ID or key.
    pub async fn delete_images(
        &self,
        dataset_id: &DatasetId,
        images: &[ImageRef],
    ) -> Result<JobHandle, Error> {
        if images.is_empty() {
            return Err(Error::InvalidParameters("no images to delete".to_string()));
        }
        self.submitter()
            .submit(JobType::DeleteImages, dataset_id, "images", images, None)
            .await
    }

    /// Creates a job from a raw parameter object.
    pub async fn create_job(
        &self,
        job_type: JobType,
        param: serde_json::Value,
    ) -> Result<JobHandle, Error> {
        self.submitter().create(job_type, param).await
    }

    /// Fetches the current state of a job.
    pub async fn job(&self, job_id: &JobId) -> Result<Job, Error> {
        let request = Request::get(Target::Api(format!("/curate/batch/jobs/{}/", job_id)));
        self.call("fetch job", request).await?.json()
    }

    /// A fresh handle on an existing job, for example to resume a wait that
    /// timed out.
    pub async fn job_handle(&self, job_id: &JobId) -> Result<JobHandle, Error> {
        let job = self.job(job_id).await?;
        Ok(JobHandle::new(self.clone(), job))
    }

    /// Lists jobs, optionally only those created at or after `from_date`.
    pub async fn jobs(&self, from_date: Option<DateTime<Utc>>) -> Result<Vec<Job>, Error> {
        let mut jobs = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut request = Request::get(Target::Api("/curate/batch/jobs/".to_owned()))
                .with_query("limit", FETCH_PAGE_LIMIT);
            if let Some(from_date) = &from_date {
                request = request
                    .with_query("from_date", from_date.to_rfc3339_opts(SecondsFormat::Secs, true));
            }
            if let Some(cursor) = &cursor {
                request = request.with_query("cursor", cursor);
            }

            let page: CursorPage<Job> = self.call("list jobs", request).await?.json()?;
            debug!(
                "Fetched {} jobs, next cursor {:?}",
                page.results.len(),
                page.next_cursor
            );
            let short_page = page.results.len() < FETCH_PAGE_LIMIT;
            jobs.extend(page.results);

            match page.next_cursor {
                Some(next) if !next.is_empty() && !short_page => cursor = Some(next),
                _ => break,
            }
        }

        Ok(jobs)
    }
}
