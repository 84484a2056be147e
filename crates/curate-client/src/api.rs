// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 The spb-curate Authors.

use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt::Display, str::FromStr};

/// Declares a string identifier newtype.  Curate identifiers are opaque
/// server-assigned strings (usually UUIDs) so, unlike numeric IDs, they are
/// only validated for emptiness.
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn value(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.trim();
                if s.is_empty() {
                    return Err(Error::InvalidParameters(format!(
                        "{} must not be empty",
                        $label
                    )));
                }
                Ok($name(s.to_owned()))
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(s: &str) -> Result<Self, Self::Error> {
                $name::from_str(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                $name::from_str(&s)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

string_id!(
    /// Unique identifier for a dataset.
    ///
    /// ```rust
    /// use curate_client::DatasetId;
    /// use std::str::FromStr;
    ///
    /// let id = DatasetId::from_str("b1a1d7c0-0000-4000-8000-000000000001").unwrap();
    /// assert_eq!(id.to_string(), "b1a1d7c0-0000-4000-8000-000000000001");
    /// assert!(DatasetId::from_str("  ").is_err());
    /// ```
    DatasetId,
    "Dataset ID"
);
string_id!(
    /// Unique identifier for an asynchronous server-side job.
    JobId,
    "Job ID"
);
string_id!(
    /// Unique identifier for a slice of a dataset.
    SliceId,
    "Slice ID"
);
string_id!(
    /// Identifier of an uploaded binary asset, usable in image imports.
    AssetId,
    "Asset ID"
);
string_id!(
    /// Identifier of an image within a dataset.
    ImageId,
    "Image ID"
);
string_id!(
    /// Identifier of an uploaded job parameter document.
    ParamId,
    "Param ID"
);

/// A dataset in Curate.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Dataset {
    id: DatasetId,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    image_count: Option<u64>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl Display for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} {}", self.id, self.name)
    }
}

impl Dataset {
    pub fn id(&self) -> &DatasetId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn image_count(&self) -> Option<u64> {
        self.image_count
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }
}

/// A named subset of the images of a dataset.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Slice {
    id: SliceId,
    name: String,
    #[serde(default)]
    description: String,
}

impl Slice {
    pub fn id(&self) -> &SliceId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

/// Available types of a job.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    AnnotationImport,
    DeleteImages,
    ImageImport,
    ImportPredictions,
    UpdateSlice,
    UpdateSliceByQuery,
    /// A job type this client does not know about.
    #[serde(other)]
    Other,
}

impl Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            JobType::AnnotationImport => "ANNOTATION_IMPORT",
            JobType::DeleteImages => "DELETE_IMAGES",
            JobType::ImageImport => "IMAGE_IMPORT",
            JobType::ImportPredictions => "IMPORT_PREDICTIONS",
            JobType::UpdateSlice => "UPDATE_SLICE",
            JobType::UpdateSliceByQuery => "UPDATE_SLICE_BY_QUERY",
            JobType::Other => "OTHER",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle state of a [`Job`].
///
/// The server moves a job from `Pending` through `Running` into one of the
/// terminal states.  The client only observes these transitions.
///
/// Status strings are matched case-insensitively and the service's legacy
/// spellings (`COMPLETE`, `IN_PROGRESS`, ...) are accepted.
///
/// ```rust
/// use curate_client::JobStatus;
/// use std::str::FromStr;
///
/// assert_eq!(JobStatus::from_str("COMPLETE").unwrap(), JobStatus::Succeeded);
/// assert_eq!(JobStatus::from_str("in_progress").unwrap(), JobStatus::Running);
/// assert!(JobStatus::PartiallySucceeded.is_terminal());
/// assert!(!JobStatus::Pending.is_terminal());
/// ```
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    PartiallySucceeded,
}

impl JobStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::PartiallySucceeded
        )
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" | "QUEUED" | "WAITING" => Ok(JobStatus::Pending),
            "RUNNING" | "IN_PROGRESS" | "PROCESSING" => Ok(JobStatus::Running),
            "SUCCEEDED" | "COMPLETE" | "COMPLETED" => Ok(JobStatus::Succeeded),
            "FAILED" => Ok(JobStatus::Failed),
            "PARTIALLY_SUCCEEDED" | "PARTIALLY_COMPLETE" | "PARTIALLY_COMPLETED" => {
                Ok(JobStatus::PartiallySucceeded)
            }
            other => Err(Error::InvalidResponse(format!(
                "unknown job status '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<String> for JobStatus {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        JobStatus::from_str(&s)
    }
}

impl From<JobStatus> for String {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Failed => "FAILED",
            JobStatus::PartiallySucceeded => "PARTIALLY_SUCCEEDED",
        }
        .to_owned()
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::PartiallySucceeded => "partially_succeeded",
        };
        write!(f, "{}", s)
    }
}

/// Item counters reported by the server while a job runs.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct JobProgress {
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub fail_count: u64,
}

/// An asynchronous server-side operation.
///
/// Jobs are created by bulk operations such as
/// [`Client::add_images`][crate::Client::add_images] and observed through a
/// [`JobHandle`][crate::JobHandle].  A job that ends `Failed` or
/// `PartiallySucceeded` carries per-item error detail in its
/// [`result`][Job::result] payload.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Job {
    id: JobId,
    #[serde(default)]
    job_type: Option<JobType>,
    status: JobStatus,
    #[serde(default)]
    progress: Option<JobProgress>,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.job_type {
            Some(job_type) => write!(f, "{} {} [{}]", self.id, job_type, self.status),
            None => write!(f, "{} [{}]", self.id, self.status),
        }
    }
}

impl Job {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn job_type(&self) -> Option<JobType> {
        self.job_type
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn progress(&self) -> Option<&JobProgress> {
        self.progress.as_ref()
    }

    /// Result payload reported by the server, including per-item error
    /// detail for failed and partially succeeded jobs.
    pub fn result(&self) -> Option<&serde_json::Value> {
        self.result.as_ref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}

/// Identifies an image of a dataset, either by server ID or by its key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(untagged)]
pub enum ImageRef {
    Id { id: ImageId },
    Key { key: String },
}

impl From<ImageId> for ImageRef {
    fn from(id: ImageId) -> Self {
        ImageRef::Id { id }
    }
}

impl ImageRef {
    pub fn key(key: impl Into<String>) -> Self {
        ImageRef::Key { key: key.into() }
    }
}

/// A new annotation for an image that already exists in a dataset.
///
/// `annotation_value` is passed through to the service unchanged; its shape
/// depends on `annotation_type` (`box`, `polygon`, `category`, ...).
///
/// ```rust
/// use curate_client::{Annotation, ImageRef};
/// use serde_json::json;
///
/// let box_ = Annotation::new(
///     ImageRef::key("frames/0001.jpg"),
///     "person",
///     "box",
///     json!({"x": 10, "y": 20, "width": 30, "height": 40}),
/// )
/// .with_metadata("iou", 0.8);
///
/// let value = serde_json::to_value(&box_).unwrap();
/// assert_eq!(value["image_key"], "frames/0001.jpg");
/// assert_eq!(value["metadata"]["iou"], 0.8);
/// ```
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Annotation {
    #[serde(skip_serializing_if = "Option::is_none")]
    image_id: Option<ImageId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_key: Option<String>,
    annotation_class: String,
    annotation_type: String,
    annotation_value: serde_json::Value,
    metadata: crate::asset::Metadata,
}

impl Annotation {
    pub fn new(
        image: ImageRef,
        annotation_class: impl Into<String>,
        annotation_type: impl Into<String>,
        annotation_value: serde_json::Value,
    ) -> Self {
        let (image_id, image_key) = match image {
            ImageRef::Id { id } => (Some(id), None),
            ImageRef::Key { key } => (None, Some(key)),
        };
        Annotation {
            image_id,
            image_key,
            annotation_class: annotation_class.into(),
            annotation_type: annotation_type.into(),
            annotation_value,
            metadata: Default::default(),
        }
    }

    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<crate::asset::MetadataValue>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn annotation_class(&self) -> &str {
        &self.annotation_class
    }

    pub fn annotation_type(&self) -> &str {
        &self.annotation_type
    }
}

/// Selects the images of a slice update.
///
/// ```rust
/// use curate_client::{ImageRef, SliceImages};
///
/// let by_key = SliceImages::Images(vec![ImageRef::key("frames/0001.jpg")]);
/// let by_query = SliceImages::Query("weather = \"rain\"".to_string());
/// # let _ = (by_key, by_query);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SliceImages {
    /// These images, by ID or key.
    Images(Vec<ImageRef>),
    /// Every image of the dataset matching a Curate query string.
    Query(String),
}

#[derive(Deserialize, Debug)]
pub(crate) struct CursorPage<T> {
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[derive(Serialize, Debug)]
pub(crate) struct DatasetCreateParams<'a> {
    pub name: &'a str,
    pub description: &'a str,
}

#[derive(Serialize, Debug)]
pub(crate) struct SliceCreateParams<'a> {
    pub name: &'a str,
    pub description: &'a str,
}

#[derive(Serialize, Debug)]
pub(crate) struct AssetUploadParams {
    pub file_sizes: Vec<u64>,
}

/// One presigned upload slot returned by the bulk asset endpoint.
#[derive(Deserialize, Clone, Debug)]
pub(crate) struct PresignedAsset {
    pub id: AssetId,
    pub upload_url: String,
}

#[derive(Deserialize, Debug)]
pub(crate) struct PresignedAssets {
    #[serde(default = "Vec::new")]
    pub results: Vec<PresignedAsset>,
}

#[derive(Serialize, Debug)]
pub(crate) struct ParamUploadParams {
    pub file_size: u64,
}

#[derive(Deserialize, Clone, Debug)]
pub(crate) struct ParamUpload {
    pub id: ParamId,
    pub upload_url: String,
}

#[derive(Serialize, Debug)]
pub(crate) struct JobCreateParams<'a> {
    pub job_type: JobType,
    pub param: &'a serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_aliases() {
        for (raw, expected) in [
            ("PENDING", JobStatus::Pending),
            ("running", JobStatus::Running),
            ("IN_PROGRESS", JobStatus::Running),
            ("COMPLETE", JobStatus::Succeeded),
            ("succeeded", JobStatus::Succeeded),
            ("FAILED", JobStatus::Failed),
            ("partially_succeeded", JobStatus::PartiallySucceeded),
        ] {
            assert_eq!(JobStatus::from_str(raw).unwrap(), expected, "{}", raw);
        }
        assert!(JobStatus::from_str("EXPLODED").is_err());
    }

    #[test]
    fn test_job_deserialize() {
        let job: Job = serde_json::from_str(
            r#"{
                "id": "5c8f3d0e-job",
                "job_type": "IMAGE_IMPORT",
                "status": "COMPLETE",
                "progress": {"total_count": 3, "success_count": 2, "fail_count": 1},
                "result": {"fail_detail": [{"key": "b.png", "reason": "corrupt"}]},
                "created_at": "2025-03-01T10:00:00Z"
            }"#,
        )
        .unwrap();

        assert_eq!(job.id().value(), "5c8f3d0e-job");
        assert_eq!(job.job_type(), Some(JobType::ImageImport));
        assert_eq!(job.status(), JobStatus::Succeeded);
        assert!(job.is_terminal());
        assert_eq!(job.progress().unwrap().fail_count, 1);
        assert!(job.result().unwrap()["fail_detail"].is_array());
    }

    #[test]
    fn test_job_unknown_type() {
        let job: Job =
            serde_json::from_str(r#"{"id": "j", "job_type": "REINDEX", "status": "PENDING"}"#)
                .unwrap();
        assert_eq!(job.job_type(), Some(JobType::Other));
        assert!(!job.is_terminal());
    }

    #[test]
    fn test_job_type_serialize() {
        let value = serde_json::to_value(JobType::UpdateSliceByQuery).unwrap();
        assert_eq!(value, "UPDATE_SLICE_BY_QUERY");
        assert_eq!(JobType::ImageImport.to_string(), "IMAGE_IMPORT");
    }

    #[test]
    fn test_empty_id_rejected() {
        assert!(JobId::from_str("").is_err());
        assert_eq!(JobId::try_from(" abc ").unwrap().value(), "abc");
    }
}
