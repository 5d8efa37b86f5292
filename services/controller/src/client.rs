//! Kubernetes API server client.
//!
//! Provides:
//! - The [`ServiceApi`] seam the controller writes through
//! - Typed list and watch calls that feed the informers
//!
//! Paths are derived from the `k8s_openapi::Resource` constants of the kind
//! being requested, so the same client serves core and custom resources.

use std::marker::PhantomData;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ListMeta, Status};
use k8s_openapi::Resource;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, trace};

/// Timeout for non-watch requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Server-side timeout asked for on each watch.
pub const WATCH_TIMEOUT_SECS: u32 = 290;

/// Errors returned by the API server or the transport.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The requested resource version is too old to watch from.
    #[error("resource version expired: {0}")]
    Gone(String),

    #[error("API server returned {code} {reason}: {message}")]
    Status {
        code: u16,
        reason: String,
        message: String,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    /// Whether the target object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }

    /// Map an API server `Status` to the matching variant.
    pub fn from_status(code: u16, status: &Status) -> Self {
        let reason = status.reason.clone().unwrap_or_default();
        let message = status.message.clone().unwrap_or_default();
        match (code, reason.as_str()) {
            (404, _) | (_, "NotFound") => ApiError::NotFound(message),
            (_, "AlreadyExists") => ApiError::AlreadyExists(message),
            (409, _) | (_, "Conflict") => ApiError::Conflict(message),
            (410, _) | (_, "Expired") | (_, "Gone") => ApiError::Gone(message),
            _ => ApiError::Status {
                code,
                reason,
                message,
            },
        }
    }
}

/// Operations on VNC Services the controller depends on.
#[async_trait]
pub trait ServiceApi: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Service, ApiError>;

    async fn create(&self, namespace: &str, service: &Service) -> Result<Service, ApiError>;

    async fn update(&self, namespace: &str, service: &Service) -> Result<Service, ApiError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ApiError>;
}

/// A list response.
#[derive(Debug, Deserialize)]
pub struct ObjectList<K> {
    #[serde(default)]
    pub metadata: ListMeta,

    #[serde(default = "Vec::new")]
    pub items: Vec<K>,
}

/// Resource version carried by a bookmark.
#[derive(Debug, Clone, Deserialize)]
pub struct Bookmark {
    pub metadata: BookmarkMeta,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkMeta {
    pub resource_version: String,
}

/// One event of a watch stream.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "object")]
pub enum WatchEvent<K> {
    #[serde(rename = "ADDED")]
    Added(K),

    #[serde(rename = "MODIFIED")]
    Modified(K),

    #[serde(rename = "DELETED")]
    Deleted(K),

    #[serde(rename = "BOOKMARK")]
    Bookmark(Bookmark),

    #[serde(rename = "ERROR")]
    Error(Status),
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ApiError>> + Send>>;

/// Decoder for a newline-delimited watch response body.
pub struct WatchStream<K> {
    body: ByteStream,
    buf: Vec<u8>,
    _kind: PhantomData<fn() -> K>,
}

impl<K: DeserializeOwned> WatchStream<K> {
    /// Wrap a raw body stream.
    pub fn new(body: impl Stream<Item = Result<Bytes, ApiError>> + Send + 'static) -> Self {
        Self {
            body: Box::pin(body),
            buf: Vec::new(),
            _kind: PhantomData,
        }
    }

    /// Next decoded event, or `None` once the server closes the watch.
    pub async fn next_event(&mut self) -> Option<Result<WatchEvent<K>, ApiError>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                let line = line.trim_ascii();
                if line.is_empty() {
                    continue;
                }
                return Some(serde_json::from_slice(line).map_err(ApiError::from));
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.buf.extend_from_slice(&chunk),
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    let rest = std::mem::take(&mut self.buf);
                    let rest = rest.trim_ascii();
                    if rest.is_empty() {
                        return None;
                    }
                    return Some(serde_json::from_slice(rest).map_err(ApiError::from));
                }
            }
        }
    }
}

/// Path of the API group/version serving `K`.
fn api_prefix<K: Resource>() -> String {
    if K::GROUP.is_empty() {
        format!("/api/{}", K::VERSION)
    } else {
        format!("/apis/{}/{}", K::GROUP, K::VERSION)
    }
}

/// Collection path of `K`, cluster-wide when `namespace` is `None`.
pub fn collection_path<K: Resource>(namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) => format!(
            "{}/namespaces/{}/{}",
            api_prefix::<K>(),
            ns,
            K::URL_PATH_SEGMENT
        ),
        None => format!("{}/{}", api_prefix::<K>(), K::URL_PATH_SEGMENT),
    }
}

/// Path of a single namespaced object of kind `K`.
pub fn object_path<K: Resource>(namespace: &str, name: &str) -> String {
    format!("{}/{}", collection_path::<K>(Some(namespace)), name)
}

/// HTTP client for the API server.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a client for `base_url`.
    ///
    /// `ca_pem` adds a trusted root for the server certificate; `token` is
    /// sent as a bearer credential.
    pub fn new(
        base_url: impl Into<String>,
        token: Option<String>,
        ca_pem: Option<&[u8]>,
    ) -> Result<Self, ApiError> {
        let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));
        if let Some(pem) = ca_pem {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
        }

        Ok(Self {
            http: builder.build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    /// API server base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(response: Response) -> Result<Response, ApiError> {
        let code = response.status();
        if code.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let status = serde_json::from_str::<Status>(&body).unwrap_or_else(|_| Status {
            code: Some(i32::from(code.as_u16())),
            message: Some(body.clone()),
            reason: code.canonical_reason().map(str::to_string),
            ..Default::default()
        });
        debug!(status = %code, reason = ?status.reason, "API request rejected");
        Err(ApiError::from_status(code.as_u16(), &status))
    }

    async fn send_json<T: DeserializeOwned>(builder: RequestBuilder) -> Result<T, ApiError> {
        let response = Self::check(builder.timeout(REQUEST_TIMEOUT).send().await?).await?;
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// List every object of kind `K` across all namespaces.
    pub async fn list<K>(&self, label_selector: Option<&str>) -> Result<ObjectList<K>, ApiError>
    where
        K: Resource + DeserializeOwned,
    {
        let mut builder = self.request(Method::GET, &collection_path::<K>(None));
        if let Some(selector) = label_selector {
            builder = builder.query(&[("labelSelector", selector)]);
        }

        let list: ObjectList<K> = Self::send_json(builder).await?;
        debug!(
            kind = K::KIND,
            items = list.items.len(),
            resource_version = ?list.metadata.resource_version,
            "Listed objects"
        );
        Ok(list)
    }

    /// Watch objects of kind `K` from `resource_version`.
    pub async fn watch<K>(
        &self,
        resource_version: &str,
        label_selector: Option<&str>,
    ) -> Result<WatchStream<K>, ApiError>
    where
        K: Resource + DeserializeOwned,
    {
        let timeout = WATCH_TIMEOUT_SECS.to_string();
        let mut query = vec![
            ("watch", "true"),
            ("allowWatchBookmarks", "true"),
            ("resourceVersion", resource_version),
            ("timeoutSeconds", timeout.as_str()),
        ];
        if let Some(selector) = label_selector {
            query.push(("labelSelector", selector));
        }

        trace!(kind = K::KIND, resource_version, "Opening watch");
        let response = self
            .request(Method::GET, &collection_path::<K>(None))
            .query(&query)
            .send()
            .await?;
        let response = Self::check(response).await?;

        Ok(WatchStream::new(
            response.bytes_stream().map_err(ApiError::from),
        ))
    }
}

#[async_trait]
impl ServiceApi for ApiClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Service, ApiError> {
        Self::send_json(self.request(Method::GET, &object_path::<Service>(namespace, name))).await
    }

    async fn create(&self, namespace: &str, service: &Service) -> Result<Service, ApiError> {
        let builder = self
            .request(Method::POST, &collection_path::<Service>(Some(namespace)))
            .json(service);
        Self::send_json(builder).await
    }

    async fn update(&self, namespace: &str, service: &Service) -> Result<Service, ApiError> {
        let name = service.metadata.name.as_deref().unwrap_or_default();
        let builder = self
            .request(Method::PUT, &object_path::<Service>(namespace, name))
            .json(service);
        Self::send_json(builder).await
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        let response = self
            .request(Method::DELETE, &object_path::<Service>(namespace, name))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
