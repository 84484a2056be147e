// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 The spb-curate Authors.

//! # Superb AI Curate Client Library
//!
//! A Rust client for Superb AI Curate, a service for curating computer
//! vision datasets.  The library covers the bulk workflows of the service:
//! staging many image assets concurrently, submitting the asynchronous jobs
//! that import or delete them, and waiting for those jobs to finish.
//!
//! ## Features
//!
//! - **Bulk upload**: bounded-concurrency asset staging with per-item
//!   results in input order; one bad file never sinks the batch
//! - **Retries**: capped exponential backoff for transient network,
//!   throttling and server failures, with fail-fast on client errors
//! - **Jobs**: image import, annotation import and image deletion jobs, and
//!   a [`JobHandle`] that polls them to completion under a deadline
//! - **Configuration**: explicit [`ClientConfig`] loaded from `SPB_*`
//!   environment variables and `~/.spb/config`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use curate_client::{Client, DatasetId, Error, ImportOptions};
//! use std::{path::Path, str::FromStr};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let client = Client::new()?;
//!     let dataset_id = DatasetId::from_str("b1a1d7c0-0000-4000-8000-000000000001")?;
//!
//!     let import = client
//!         .upload_images_from_directory(
//!             &dataset_id,
//!             Path::new("./frames"),
//!             true,
//!             ImportOptions::default().with_wait(true),
//!             None,
//!         )
//!         .await?;
//!     println!("{}", import.summary);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Optional Features
//!
//! - `profiling`: instruments the upload and job pipelines with `tracing`
//!   spans

mod api;
mod asset;
mod client;
mod config;
mod error;
mod job;
mod retry;
mod transport;
mod upload;

pub use crate::{
    api::{
        Annotation, AssetId, Dataset, DatasetId, ImageId, ImageRef, Job, JobId, JobProgress,
        JobStatus, JobType, ParamId, Slice, SliceId, SliceImages,
    },
    asset::{
        AssetDescriptor, AssetReference, AssetSource, BatchSummary, FailureKind, Metadata,
        MetadataValue, UploadFailure, UploadResult, discover_images,
    },
    client::{Client, ImageImport, ImportOptions},
    config::{
        ClientConfig, Credentials, DEFAULT_API_BASE, DEFAULT_PROFILE, DEFAULT_TIMEOUT,
        credentials_path,
    },
    error::Error,
    job::{DEFAULT_POLL_INTERVAL, DEFAULT_WAIT_TIMEOUT, JobHandle, JobSubmitter, PollOptions},
    retry::{Classification, DEFAULT_MAX_ATTEMPTS, RetryContext, RetryPolicy, classify},
    transport::{HttpTransport, Request, RequestBody, Response, Target, Transport, USER_AGENT},
    upload::{
        ASSET_BYTES_MAX, BULK_UPLOAD_BYTES_MAX, BULK_UPLOAD_OBJECT_MAX, BulkUploader,
        DEFAULT_MAX_CONCURRENCY, Progress, UploadOptions, UrlUploadMode,
    },
};

pub use tokio_util::sync::CancellationToken;
