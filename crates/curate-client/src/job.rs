// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 The spb-curate Authors.

use crate::{
    Client, Error,
    api::{
        DatasetId, Job, JobCreateParams, JobId, JobStatus, JobType, ParamId, ParamUpload,
        ParamUploadParams, SliceId,
    },
    transport::{Request, RequestBody, Target},
};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
const JOBS_PATH: &str = "/curate/batch/jobs/";
const PARAMS_PATH: &str = "/curate/batch/params/";

/// Default interval and deadline of [`JobHandle::wait`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollOptions {
    interval: Duration,
    timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        PollOptions {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

impl PollOptions {
    pub fn with_interval(self, interval: Duration) -> Self {
        PollOptions { interval, ..self }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        PollOptions { timeout, ..self }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Creates bulk jobs.
///
/// The items a job operates on are not sent inline: they are serialized to
/// a JSON parameter document, uploaded to a presigned URL, and the job
/// refers to that document by its [`ParamId`].
#[derive(Clone, Debug)]
pub struct JobSubmitter {
    client: Client,
}

impl JobSubmitter {
    pub fn new(client: Client) -> Self {
        JobSubmitter { client }
    }

    /// Uploads `data` as a job parameter document.
    pub async fn upload_params<T: Serialize + ?Sized>(&self, data: &T) -> Result<ParamId, Error> {
        let document = serde_json::to_vec(data)?;

        let request = Request::post(Target::Api(PARAMS_PATH.to_owned())).with_json(
            serde_json::to_value(ParamUploadParams {
                file_size: document.len() as u64,
            })?,
        );
        let upload: ParamUpload = self.client.call("upload params", request).await?.json()?;

        let put = Request::put(Target::Url(upload.upload_url.clone())).with_body(
            RequestBody::Bytes {
                data: document,
                content_type: Some("application/json".to_owned()),
            },
        );
        self.client.call("put params", put).await?;

        debug!("Uploaded job parameters {}", upload.id);
        Ok(upload.id)
    }

    /// Creates a job of `job_type` with an already assembled `param`.
    ///
    /// [`JobType::Other`] only describes jobs read back from the server and
    /// is rejected.
    pub async fn create(&self, job_type: JobType, param: serde_json::Value) -> Result<JobHandle, Error> {
        if job_type == JobType::Other {
            return Err(Error::InvalidParameters(
                "cannot create a job of unknown type".to_string(),
            ));
        }
        let body = serde_json::to_value(JobCreateParams {
            job_type,
            param: &param,
        })?;
        let request = Request::post(Target::Api(JOBS_PATH.to_owned())).with_json(body);
        let job: Job = self.client.call("create job", request).await?.json()?;

        info!("Created {} job {} [{}]", job_type, job.id(), job.status());
        Ok(JobHandle::new(self.client.clone(), job))
    }

    /// Uploads `items` and creates a job of `job_type` on `dataset_id` that
    /// refers to them under `field`.
    #[cfg_attr(feature = "profiling", tracing::instrument(skip_all, fields(%job_type)))]
    pub async fn submit<T: Serialize + ?Sized>(
        &self,
        job_type: JobType,
        dataset_id: &DatasetId,
        field: &str,
        items: &T,
        slice_id: Option<&SliceId>,
    ) -> Result<JobHandle, Error> {
        let param_id = self.upload_params(items).await?;

        let mut param = json!({ "dataset_id": dataset_id });
        param[field] = json!({ "param_id": param_id });
        if let Some(slice_id) = slice_id {
            param["slice_id"] = json!(slice_id);
        }

        self.create(job_type, param).await
    }
}

/// Observes a server-side [`Job`] until it reaches a terminal state.
///
/// A handle remembers the last status it saw.  Dropping it, or giving up on
/// a wait, never affects the job itself; a new handle from
/// [`Client::job_handle`] picks up where this one left off.
#[derive(Clone, Debug)]
pub struct JobHandle {
    client: Client,
    job: Job,
}

impl JobHandle {
    pub(crate) fn new(client: Client, job: Job) -> Self {
        JobHandle { client, job }
    }

    pub fn id(&self) -> &JobId {
        self.job.id()
    }

    /// Last observed state.
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn status(&self) -> JobStatus {
        self.job.status()
    }

    pub fn into_job(self) -> Job {
        self.job
    }

    /// Fetches the current state of the job.
    pub async fn refresh(&mut self) -> Result<&Job, Error> {
        let job = self.client.job(self.job.id()).await?;
        if job.status() != self.job.status() {
            info!(
                "Job {} {} -> {}",
                job.id(),
                self.job.status(),
                job.status()
            );
        }
        if let Some(progress) = job.progress() {
            debug!(
                "Job {} progress: {}/{} succeeded, {} failed",
                job.id(),
                progress.success_count,
                progress.total_count,
                progress.fail_count
            );
        }
        self.job = job;
        Ok(&self.job)
    }

    /// Waits with the client's [`PollOptions`].
    pub async fn wait(&mut self) -> Result<Job, Error> {
        let poll = self.client.poll_options();
        self.wait_until_complete(poll.interval(), poll.timeout()).await
    }

    /// Polls every `interval` until the job is `Succeeded`, `Failed` or
    /// `PartiallySucceeded` and returns it.  A failed job is returned, not
    /// raised; inspect [`Job::status`] and [`Job::result`].
    ///
    /// Returns [`Error::Timeout`] once `timeout` has elapsed without a
    /// terminal status.  The job keeps running on the server.
    ///
    /// A poll that still fails after the client's retries is logged and
    /// polling continues until the deadline, unless the failure is terminal
    /// (for example an unknown job ID or rejected credentials).
    #[cfg_attr(feature = "profiling", tracing::instrument(skip(self), fields(job_id = %self.job.id())))]
    pub async fn wait_until_complete(
        &mut self,
        interval: Duration,
        timeout: Duration,
    ) -> Result<Job, Error> {
        let interval = interval.max(MIN_POLL_INTERVAL);
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            if self.job.is_terminal() {
                info!(
                    "Job {} finished {} after {:.1}s",
                    self.job.id(),
                    self.job.status(),
                    started.elapsed().as_secs_f64()
                );
                return Ok(self.job.clone());
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "Gave up waiting for job {} after {:.1}s, last status {}",
                    self.job.id(),
                    started.elapsed().as_secs_f64(),
                    self.job.status()
                );
                return Err(Error::Timeout {
                    job_id: self.job.id().clone(),
                    elapsed: started.elapsed(),
                });
            }

            tokio::time::sleep(interval.min(deadline - now)).await;

            match self.refresh().await {
                Ok(_) => {}
                Err(err) if err.is_retryable() => {
                    warn!("Polling job {} failed: {}", self.job.id(), err);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_defaults() {
        let poll = PollOptions::default();
        assert_eq!(poll.interval(), Duration::from_secs(2));
        assert_eq!(poll.timeout(), Duration::from_secs(300));

        let poll = poll
            .with_interval(Duration::from_millis(250))
            .with_timeout(Duration::from_secs(5));
        assert_eq!(poll.interval(), Duration::from_millis(250));
        assert_eq!(poll.timeout(), Duration::from_secs(5));
    }
}
