use std::fs::File;
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response, multipart};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{
    Collection, CollectionItem, CollectionPage, ItemKind, JobStatus, RemoteJob,
};
use crate::error::BatchError;

pub const DEFAULT_BASE_URL: &str = "https://api.infinidream.ai/api/v1";

/// Connection settings for the job store. Built once at startup and passed
/// down explicitly.
#[derive(Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub api_key: String,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateJobRequest {
    pub name: String,
    pub description: String,
    /// Serialized algorithm payload.
    pub prompt: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateJobRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Dream,
}

impl UploadKind {
    fn as_str(self) -> &'static str {
        match self {
            UploadKind::Dream => "dream",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Image,
}

impl MediaType {
    fn as_str(self) -> &'static str {
        match self {
            MediaType::Image => "image",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UploadOptions {
    pub media_type: MediaType,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateCollectionRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub nsfw: bool,
}

/// Operations the orchestrator needs from the remote job store.
pub trait JobStore: Send + Sync {
    fn create_job(&self, request: &CreateJobRequest) -> Result<RemoteJob, BatchError>;
    fn get_job(&self, id: &str) -> Result<RemoteJob, BatchError>;
    fn update_job(&self, id: &str, update: &UpdateJobRequest) -> Result<(), BatchError>;
    fn upload_file(
        &self,
        path: &Path,
        kind: UploadKind,
        options: &UploadOptions,
    ) -> Result<RemoteJob, BatchError>;
    fn list_collection_items(
        &self,
        collection_id: &str,
        skip: usize,
        take: usize,
    ) -> Result<CollectionPage, BatchError>;
    fn create_collection(
        &self,
        request: &CreateCollectionRequest,
    ) -> Result<Collection, BatchError>;
    fn add_item_to_collection(
        &self,
        collection_id: &str,
        kind: ItemKind,
        item_id: &str,
    ) -> Result<(), BatchError>;
    fn get_collection(&self, id: &str, auto_populate: bool) -> Result<Collection, BatchError>;
    /// Streams the body of `url` into `destination`, returning the byte count.
    fn download(&self, url: &str, destination: &Path) -> Result<u64, BatchError>;
}

#[derive(Clone)]
pub struct HttpJobStore {
    client: Client,
    base_url: String,
    auth: HeaderValue,
}

impl HttpJobStore {
    pub fn new(config: &ClientConfig) -> Result<Self, BatchError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("edream-batch/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| BatchError::InvalidConfig(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| BatchError::Http(err.to_string()))?;

        let mut auth = HeaderValue::from_str(&format!("Api-Key {}", config.api_key.trim()))
            .map_err(|_| BatchError::InvalidConfig("API key is not a valid header".to_string()))?;
        auth.set_sensitive(true);

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header(AUTHORIZATION, self.auth.clone())
    }

    fn handle_status(response: Response) -> Result<Response, BatchError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "request failed".to_string());
        Err(BatchError::Status { status, message })
    }

    fn read_json(response: Response) -> Result<Value, BatchError> {
        let response = Self::handle_status(response)?;
        response
            .json()
            .map_err(|err| BatchError::Decode(err.to_string()))
    }

    /// Single attempt. Used for calls that create or mutate remote state,
    /// where a retry after a lost response could duplicate the effect.
    fn send_once(&self, request: RequestBuilder) -> Result<Response, BatchError> {
        request
            .send()
            .map_err(|err| BatchError::Http(err.to_string()))
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, BatchError>
    where
        F: FnMut() -> RequestBuilder,
    {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = make_req().send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tracing::debug!(status, attempt, "retrying request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tracing::debug!(error = %err, attempt, "retrying request");
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(BatchError::Http(err.to_string()));
                }
            }
        }
    }
}

impl JobStore for HttpJobStore {
    fn create_job(&self, request: &CreateJobRequest) -> Result<RemoteJob, BatchError> {
        let url = self.url("/dream");
        let response = self.send_once(self.authorized(self.client.post(&url)).json(request))?;
        parse_job(Self::read_json(response)?)
    }

    fn get_job(&self, id: &str) -> Result<RemoteJob, BatchError> {
        let url = self.url(&format!("/dream/{id}"));
        let response = self.send_with_retries(|| self.authorized(self.client.get(&url)))?;
        parse_job(Self::read_json(response)?)
    }

    fn update_job(&self, id: &str, update: &UpdateJobRequest) -> Result<(), BatchError> {
        let url = self.url(&format!("/dream/{id}"));
        let response = self.send_once(self.authorized(self.client.put(&url)).json(update))?;
        Self::handle_status(response)?;
        Ok(())
    }

    fn upload_file(
        &self,
        path: &Path,
        kind: UploadKind,
        options: &UploadOptions,
    ) -> Result<RemoteJob, BatchError> {
        let url = self.url("/dream/upload");
        let form = multipart::Form::new()
            .text("type", kind.as_str())
            .text("mediaType", options.media_type.as_str())
            .file("file", path)
            .map_err(|err| {
                BatchError::Filesystem(format!("open {}: {err}", path.display()))
            })?;
        let response = self.send_once(self.authorized(self.client.post(&url)).multipart(form))?;
        parse_job(Self::read_json(response)?)
    }

    fn list_collection_items(
        &self,
        collection_id: &str,
        skip: usize,
        take: usize,
    ) -> Result<CollectionPage, BatchError> {
        let url = self.url(&format!("/playlist/{collection_id}/items"));
        let response = self.send_with_retries(|| {
            self.authorized(self.client.get(&url))
                .query(&[("take", take), ("skip", skip)])
        })?;
        let page: PageRecord = decode(unwrap_envelope(Self::read_json(response)?, "page"))?;
        Ok(CollectionPage {
            items: page.items.into_iter().map(CollectionItem::from).collect(),
            total_count: page.total_count.unwrap_or(0),
        })
    }

    fn create_collection(
        &self,
        request: &CreateCollectionRequest,
    ) -> Result<Collection, BatchError> {
        let url = self.url("/playlist");
        let response = self.send_once(self.authorized(self.client.post(&url)).json(request))?;
        parse_collection(Self::read_json(response)?)
    }

    fn add_item_to_collection(
        &self,
        collection_id: &str,
        kind: ItemKind,
        item_id: &str,
    ) -> Result<(), BatchError> {
        let url = self.url(&format!("/playlist/{collection_id}/add-item"));
        let body = serde_json::json!({ "type": kind.as_str(), "uuid": item_id });
        let response = self.send_once(self.authorized(self.client.put(&url)).json(&body))?;
        Self::handle_status(response)?;
        Ok(())
    }

    fn get_collection(&self, id: &str, auto_populate: bool) -> Result<Collection, BatchError> {
        let url = self.url(&format!("/playlist/{id}"));
        let response = self.send_with_retries(|| {
            let request = self.authorized(self.client.get(&url));
            if auto_populate {
                request.query(&[("auto_populate", "true")])
            } else {
                request
            }
        })?;
        parse_collection(Self::read_json(response)?)
    }

    fn download(&self, url: &str, destination: &Path) -> Result<u64, BatchError> {
        // Result URLs are presigned; they must not carry the API key.
        let response = self.send_with_retries(|| self.client.get(url))?;
        let mut response = Self::handle_status(response)?;
        let mut file =
            File::create(destination).map_err(|err| BatchError::Filesystem(err.to_string()))?;
        std::io::copy(&mut response, &mut file)
            .map_err(|err| BatchError::Filesystem(err.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct DreamRecord {
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default, alias = "originalVideo")]
    original_video: Option<String>,
    #[serde(default)]
    video: Option<String>,
    #[serde(default)]
    thumbnail: Option<String>,
}

impl DreamRecord {
    fn into_job(self) -> Result<RemoteJob, BatchError> {
        let id = self
            .uuid
            .filter(|uuid| !uuid.is_empty())
            .or_else(|| self.id.as_ref().and_then(value_to_id))
            .ok_or_else(|| BatchError::Decode("job record without id".to_string()))?;
        Ok(RemoteJob {
            id,
            name: self.name,
            description: self.description,
            status: Some(JobStatus::from_service(self.status.as_deref())),
            error: self.error.as_ref().and_then(error_detail),
            original_video: self.original_video,
            video: self.video,
            thumbnail: self.thumbnail,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ItemRecord {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, rename = "type")]
    kind: Option<ItemKind>,
    #[serde(default, rename = "dreamItem", alias = "dream_item")]
    dream_item: Option<DreamRecord>,
}

impl From<ItemRecord> for CollectionItem {
    fn from(record: ItemRecord) -> Self {
        let job = record.dream_item.and_then(|dream| dream.into_job().ok());
        CollectionItem {
            id: record.id.as_ref().and_then(value_to_id).unwrap_or_default(),
            kind: record.kind.unwrap_or(ItemKind::Other),
            job,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PageRecord {
    #[serde(default)]
    items: Vec<ItemRecord>,
    #[serde(default, rename = "totalCount", alias = "total_count")]
    total_count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct PlaylistRecord {
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    items: Vec<ItemRecord>,
}

fn parse_job(value: Value) -> Result<RemoteJob, BatchError> {
    let record: DreamRecord = decode(unwrap_envelope(value, "dream"))?;
    record.into_job()
}

fn parse_collection(value: Value) -> Result<Collection, BatchError> {
    let record: PlaylistRecord = decode(unwrap_envelope(value, "playlist"))?;
    let id = record
        .uuid
        .filter(|uuid| !uuid.is_empty())
        .or_else(|| record.id.as_ref().and_then(value_to_id))
        .ok_or_else(|| BatchError::Decode("playlist record without id".to_string()))?;
    Ok(Collection {
        id,
        name: record.name,
        items: record.items.into_iter().map(CollectionItem::from).collect(),
    })
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, BatchError> {
    serde_json::from_value(value).map_err(|err| BatchError::Decode(err.to_string()))
}

/// Responses come either bare or as `{"success": .., "data": {<key>: ..}}`.
fn unwrap_envelope(value: Value, key: &str) -> Value {
    take_field(take_field(value, "data"), key)
}

fn take_field(value: Value, key: &str) -> Value {
    match value {
        Value::Object(mut map) => match map.remove(key) {
            Some(inner) => inner,
            None => Value::Object(map),
        },
        other => other,
    }
}

fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn error_detail(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(text) if text.is_empty() => None,
        Value::String(text) => Some(text.clone()),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(value.to_string())),
        other => Some(other.to_string()),
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
