// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 The spb-curate Authors.

//! Single-request HTTP transport.
//!
//! The [`Transport`] trait is the leaf of the client: it sends exactly one
//! request and returns either a successful [`Response`] or a classified
//! [`Error`].  Retrying is never done here; see [`RetryPolicy`][crate::RetryPolicy].
//!
//! [`HttpTransport`] is the production implementation backed by a single
//! pooled `reqwest::Client` shared by every clone of the
//! [`Client`][crate::Client].  Tests substitute their own implementation.

use crate::{Error, config::Credentials};
use async_trait::async_trait;
use base64::Engine as _;
use futures::StreamExt as _;
use log::{Level, debug, log_enabled, trace};
use reqwest::{Body, Method, RequestBuilder, header::CONTENT_LENGTH, header::CONTENT_TYPE};
use serde::de::DeserializeOwned;
use std::{
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{fs::File, io::AsyncWriteExt as _};
use tokio_util::codec::{BytesCodec, FramedRead};

/// Identifies the client in the `User-Agent` header.
pub const USER_AGENT: &str = concat!("SPB/v0 RustBindings/", env!("CARGO_PKG_VERSION"));

/// Where a request goes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    /// A Curate API path relative to the configured API base, such as
    /// `/curate/batch/jobs/`.  Authentication headers are attached.
    Api(String),
    /// An absolute URL outside the API, such as a presigned storage URL or a
    /// remote image.  No authentication headers are attached.
    Url(String),
}

impl Target {
    pub fn is_api(&self) -> bool {
        matches!(self, Target::Api(_))
    }
}

/// Request payload.
#[derive(Clone, Debug, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Serialized as `application/json`.
    Json(serde_json::Value),
    /// Raw bytes held in memory.
    Bytes {
        data: Vec<u8>,
        content_type: Option<String>,
    },
    /// A local file streamed from disk.
    File {
        path: PathBuf,
        length: u64,
        content_type: Option<String>,
    },
}

impl RequestBody {
    /// Number of bytes the body will send, when known up front.
    pub fn len(&self) -> Option<u64> {
        match self {
            RequestBody::Empty => Some(0),
            RequestBody::Json(_) => None,
            RequestBody::Bytes { data, .. } => Some(data.len() as u64),
            RequestBody::File { length, .. } => Some(*length),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

/// A single HTTP request as seen by a [`Transport`].
#[derive(Clone, Debug)]
pub struct Request {
    pub method: Method,
    pub target: Target,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    /// Credentials for [`Target::Api`] requests.
    pub credentials: Option<Credentials>,
    /// Sent as `Idempotency-Key`.  Reused by every attempt of one logical
    /// operation so the server can discard duplicates.
    pub idempotency_key: Option<String>,
}

impl Request {
    pub fn new(method: Method, target: Target) -> Self {
        Request {
            method,
            target,
            query: Vec::new(),
            body: RequestBody::Empty,
            credentials: None,
            idempotency_key: None,
        }
    }

    pub fn get(target: Target) -> Self {
        Request::new(Method::GET, target)
    }

    pub fn post(target: Target) -> Self {
        Request::new(Method::POST, target)
    }

    pub fn put(target: Target) -> Self {
        Request::new(Method::PUT, target)
    }

    pub fn delete(target: Target) -> Self {
        Request::new(Method::DELETE, target)
    }

    pub fn with_query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_owned(), value.to_string()));
        self
    }

    pub fn with_json(self, body: serde_json::Value) -> Self {
        Request {
            body: RequestBody::Json(body),
            ..self
        }
    }

    pub fn with_body(self, body: RequestBody) -> Self {
        Request { body, ..self }
    }

    pub fn with_credentials(self, credentials: Option<Credentials>) -> Self {
        Request {
            credentials,
            ..self
        }
    }

    pub fn with_idempotency_key(self, key: Option<String>) -> Self {
        Request {
            idempotency_key: key,
            ..self
        }
    }
}

/// A successful (2xx) response.
#[derive(Clone, Debug, Default)]
pub struct Response {
    pub status: u16,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Response {
            status,
            body: body.into(),
        }
    }

    /// Convenience constructor for a `200 OK` JSON response.
    pub fn json_ok(value: &serde_json::Value) -> Self {
        Response::new(200, value.to_string())
    }

    /// Deserializes the response body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        match serde_json::from_slice(&self.body) {
            Ok(value) => Ok(value),
            Err(err) => {
                log::error!("Invalid JSON Response: {}", String::from_utf8_lossy(&self.body));
                Err(err.into())
            }
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Sends one request.  Implementations must be safe to share between the
/// concurrent upload tasks of a batch.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: Request) -> Result<Response, Error>;

    /// Writes the body of a successful `request` to `dest` and returns its
    /// length.  Fails with [`Error::PayloadTooLarge`] as soon as the body is
    /// known to exceed `max_bytes`.
    ///
    /// The default buffers the response of [`send`][Self::send];
    /// [`HttpTransport`] streams it and stops reading at the limit.
    async fn download(&self, request: Request, dest: &Path, max_bytes: u64) -> Result<u64, Error> {
        let response = self.send(request).await?;
        let size = response.body.len() as u64;
        if size > max_bytes {
            return Err(Error::PayloadTooLarge {
                limit: max_bytes,
                size: Some(size),
            });
        }
        tokio::fs::write(dest, &response.body).await?;
        Ok(size)
    }
}

/// Builds the classified error for a non-success API response.
///
/// Recognized bodies are `{"code", "message"}`, `{"detail", "type"}` and
/// `{"detail": {"message"}}`.  Anything else, including non-JSON bodies,
/// becomes an opaque error carrying the raw body text.
pub fn api_error(status: u16, body: &[u8]) -> Error {
    let text = String::from_utf8_lossy(body).trim().to_owned();
    let parsed: Option<serde_json::Value> = serde_json::from_slice(body).ok();

    let as_string = |v: &serde_json::Value| match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    };

    let (code, message) = match parsed.as_ref().and_then(|v| v.as_object()) {
        Some(obj) if obj.contains_key("message") => (
            obj.get("code").and_then(as_string),
            obj.get("message").and_then(as_string),
        ),
        Some(obj) if obj.contains_key("detail") => {
            let code = obj.get("type").and_then(as_string);
            let message = match obj.get("detail") {
                Some(serde_json::Value::Object(detail)) => {
                    detail.get("message").and_then(as_string)
                }
                Some(detail) => as_string(detail),
                None => None,
            };
            (code, message)
        }
        _ => (None, None),
    };

    Error::Api {
        status,
        code,
        message: message.unwrap_or(text),
    }
}

/// [`Transport`] over a pooled `reqwest::Client`.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    http: reqwest::Client,
    api_base: String,
}

impl HttpTransport {
    /// Creates a transport for the API at `api_base` with the given
    /// per-request timeout.
    pub fn new(api_base: &str, timeout: Duration) -> Result<Self, Error> {
        let api_base = url::Url::parse(api_base)?;
        if api_base.host_str().is_none() {
            return Err(Error::InvalidUrl(format!("API base has no host: {}", api_base)));
        }

        // Retrying is handled by RetryPolicy so every attempt is visible to
        // it; the pool itself never retries.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(HttpTransport {
            http,
            api_base: api_base.as_str().trim_end_matches('/').to_owned(),
        })
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn url(&self, target: &Target) -> String {
        match target {
            Target::Api(path) if path.starts_with('/') => format!("{}{}", self.api_base, path),
            Target::Api(path) => format!("{}/{}", self.api_base, path),
            Target::Url(url) => url.clone(),
        }
    }
}

fn auth_header(credentials: &Credentials) -> String {
    let raw = format!("{}:{}", credentials.team_name(), credentials.access_key());
    format!(
        "Basic {}",
        base64::engine::general_purpose::STANDARD.encode(raw)
    )
}

impl HttpTransport {
    /// Builds the reqwest request for `request`: authentication headers for
    /// API targets, query string and body.
    async fn prepare(&self, request: Request, url: &str) -> Result<RequestBuilder, Error> {
        let mut req = self.http.request(request.method.clone(), url);

        if request.target.is_api() {
            let credentials = request.credentials.as_ref().ok_or_else(|| {
                Error::MissingCredentials(
                    "no access key or team name was provided".to_string(),
                )
            })?;
            req = req
                .header("Accept", "application/json")
                .header("X-Api-Key", credentials.access_key())
                .header("X-Tenant-Id", credentials.team_name())
                .header("Authorization", auth_header(credentials));
        }

        if let Some(key) = &request.idempotency_key {
            req = req.header("Idempotency-Key", key);
        }

        if !request.query.is_empty() {
            req = req.query(&request.query);
        }

        Ok(match request.body {
            RequestBody::Empty => req,
            RequestBody::Json(value) => {
                if log_enabled!(Level::Trace) {
                    trace!("{} {} body: {}", request.method, url, value);
                }
                req.json(&value)
            }
            RequestBody::Bytes { data, content_type } => {
                let req = req.header(CONTENT_LENGTH, data.len());
                let req = match content_type {
                    Some(ct) => req.header(CONTENT_TYPE, ct),
                    None => req,
                };
                req.body(data)
            }
            RequestBody::File {
                path,
                length,
                content_type,
            } => {
                let file = File::open(&path).await?;
                let stream = FramedRead::new(file, BytesCodec::new());
                let req = req.header(CONTENT_LENGTH, length);
                let req = match content_type {
                    Some(ct) => req.header(CONTENT_TYPE, ct),
                    None => req,
                };
                req.body(Body::wrap_stream(stream))
            }
        })
    }
}

fn status_error(target: &Target, status: u16, body: &[u8]) -> Error {
    if target.is_api() {
        api_error(status, body)
    } else {
        Error::FileTransfer {
            status,
            message: String::from_utf8_lossy(body).trim().to_owned(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: Request) -> Result<Response, Error> {
        let url = self.url(&request.target);
        let method = request.method.clone();
        let target = request.target.clone();
        let req = self.prepare(request, &url).await?;

        debug!("{} {}", method, url);
        let res = req.send().await?;
        let status = res.status().as_u16();
        let body = res.bytes().await?.to_vec();

        if log_enabled!(Level::Trace) {
            trace!("{} {} -> {}: {}", method, url, status, String::from_utf8_lossy(&body));
        } else {
            debug!("{} {} -> {}", method, url, status);
        }

        if (200..300).contains(&status) {
            Ok(Response { status, body })
        } else {
            Err(status_error(&target, status, &body))
        }
    }

    async fn download(&self, request: Request, dest: &Path, max_bytes: u64) -> Result<u64, Error> {
        let url = self.url(&request.target);
        let method = request.method.clone();
        let target = request.target.clone();
        let req = self.prepare(request, &url).await?;

        debug!("{} {} -> {}", method, url, dest.display());
        let res = req.send().await?;
        let status = res.status().as_u16();
        if !(200..300).contains(&status) {
            let body = res.bytes().await?;
            return Err(status_error(&target, status, &body));
        }

        if let Some(length) = res.content_length() {
            if length > max_bytes {
                return Err(Error::PayloadTooLarge {
                    limit: max_bytes,
                    size: Some(length),
                });
            }
        }

        let mut file = File::create(dest).await?;
        let mut written = 0u64;
        let mut stream = res.bytes_stream();
        while let Some(item) = stream.next().await {
            let chunk = item?;
            written += chunk.len() as u64;
            if written > max_bytes {
                drop(file);
                let _ = tokio::fs::remove_file(dest).await;
                return Err(Error::PayloadTooLarge {
                    limit: max_bytes,
                    size: None,
                });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        debug!("{} {} -> {} ({} bytes)", method, url, status, written);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_code_message() {
        let err = api_error(400, br#"{"code": "INVALID", "message": "bad name"}"#);
        match err {
            Error::Api {
                status,
                code,
                message,
            } => {
                assert_eq!(status, 400);
                assert_eq!(code.as_deref(), Some("INVALID"));
                assert_eq!(message, "bad name");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_api_error_detail_type() {
        let err = api_error(400, br#"{"detail": "Syntax error", "type": "QUERY_SYNTAX"}"#);
        match err {
            Error::Api { code, message, .. } => {
                assert_eq!(code.as_deref(), Some("QUERY_SYNTAX"));
                assert_eq!(message, "Syntax error");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        let err = api_error(409, br#"{"detail": {"message": "exists"}}"#);
        match err {
            Error::Api { code, message, .. } => {
                assert_eq!(code, None);
                assert_eq!(message, "exists");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_api_error_opaque() {
        let err = api_error(502, b"<html>Bad Gateway</html>");
        match &err {
            Error::Api { code, message, .. } => {
                assert_eq!(*code, None);
                assert_eq!(message, "<html>Bad Gateway</html>");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(err.is_retryable());
    }

    #[test]
    fn test_url_join() {
        let transport =
            HttpTransport::new("https://api.example.com/", Duration::from_secs(5)).unwrap();
        assert_eq!(transport.api_base(), "https://api.example.com");
        assert_eq!(
            transport.url(&Target::Api("/curate/batch/jobs/".to_string())),
            "https://api.example.com/curate/batch/jobs/"
        );
        assert_eq!(
            transport.url(&Target::Api("curate/x".to_string())),
            "https://api.example.com/curate/x"
        );
        assert_eq!(
            transport.url(&Target::Url("https://s3.example.com/a?sig=1".to_string())),
            "https://s3.example.com/a?sig=1"
        );
    }

    #[test]
    fn test_auth_header() {
        let credentials = Credentials::new("key", "team");
        // base64("team:key")
        assert_eq!(auth_header(&credentials), "Basic dGVhbTprZXk=");
    }
}
