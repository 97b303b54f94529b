//! HTTP client for the DocSync backend.
//!
//! [`ChatTransport`] is the port the session controller talks to; the
//! controller never sees `reqwest` types. [`HttpTransport`] implements it and
//! also carries the non-streaming endpoints (`/process`, `/report`).

use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response, StatusCode};
use tracing::debug;

use crate::api::{ChatRequest, ComparisonResult};
use crate::config::ClientConfig;
use crate::error::{ChatError, Result};

/// Raw response body, one item per network read.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Successful `/chat` response.
pub enum ChatBody {
    /// Body to be read incrementally.
    Stream(ByteStream),
    /// The response had no body to stream; this is its full text.
    Complete(String),
}

impl std::fmt::Debug for ChatBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatBody::Stream(_) => write!(f, "ChatBody::Stream(..)"),
            ChatBody::Complete(text) => write!(f, "ChatBody::Complete({text:?})"),
        }
    }
}

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Issue `POST /chat` and return once response headers arrive.
    ///
    /// A non-2xx status is reported as [`ChatError::Server`] carrying the
    /// response body text.
    async fn open_chat(&self, request: &ChatRequest) -> Result<ChatBody>;
}

/// `reqwest`-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    config: ClientConfig,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(HttpTransport { client, config: config.clone() })
    }

    /// Upload one or two files to `POST /process`.
    pub async fn process_files(&self, paths: &[PathBuf]) -> Result<ComparisonResult> {
        if paths.is_empty() || paths.len() > 2 {
            return Err(ChatError::InvalidInput(format!(
                "select one or two files to compare (got {})",
                paths.len()
            )));
        }

        let mut form = Form::new();
        for path in paths {
            let bytes = tokio::fs::read(path).await.map_err(|e| {
                ChatError::InvalidInput(format!("cannot read {}: {}", path.display(), e))
            })?;
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "upload".to_string());
            form = form.part("files", Part::bytes(bytes).file_name(file_name));
        }

        let url = self.config.endpoint("/process");
        debug!(%url, files = paths.len(), "uploading files");
        let response = self.client.post(&url).multipart(form).send().await?;
        let response = ensure_success(response).await?;
        Ok(response.json::<ComparisonResult>().await?)
    }

    /// Download the generated report from `GET /report`.
    pub async fn fetch_report(&self) -> Result<Vec<u8>> {
        let url = self.config.endpoint("/report");
        let response = self.client.get(&url).send().await?;
        let response = ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open_chat(&self, request: &ChatRequest) -> Result<ChatBody> {
        let url = self.config.endpoint("/chat");
        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        if response.status() == StatusCode::NO_CONTENT || response.content_length() == Some(0) {
            return Ok(ChatBody::Complete(response.text().await?));
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(ChatError::from));
        Ok(ChatBody::Stream(Box::pin(stream)))
    }
}

/// Whether a `/report` failure means no comparison has been processed yet.
pub fn report_unavailable(err: &ChatError) -> bool {
    matches!(err, ChatError::Server { status: 400 | 404, .. })
}

/// Turn a non-2xx response into [`ChatError::Server`] with its body text.
async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ChatError::Server { status: status.as_u16(), body })
}
