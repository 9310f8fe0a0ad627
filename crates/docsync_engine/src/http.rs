//! HTTP transport implementation.
//!
//! This module provides an HTTP-based transport for the sync engine.
//! The actual HTTP client is abstracted via a trait to allow different
//! implementations (reqwest, hyper, etc.). [`LoopbackClient`] routes
//! requests to an in-process backend, which the demo and the integration
//! tests use.

use crate::error::{ErrorClassifier, SyncError, SyncResult};
use crate::transport::{ProgressFn, SyncTransport};
use async_trait::async_trait;
use docsync_protocol::{
    AttachmentDownloadRequest, AttachmentPayload, AttachmentPushResponse, AttachmentRef,
    AttachmentUpload, PullRequest, PullResponse, PushRequest, PushResponse, WireMessage,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Endpoint for pulling remote changes.
pub const PULL_PATH: &str = "/sync/pull";
/// Endpoint for pushing one document.
pub const PUSH_PATH: &str = "/sync/push";
/// Endpoint for downloading an attachment payload.
pub const DOWNLOAD_PATH: &str = "/sync/attachments/download";
/// Endpoint for uploading an attachment payload.
pub const UPLOAD_PATH: &str = "/sync/attachments/upload";

/// A POST request with a CBOR body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Absolute URL.
    pub url: String,
    /// Bearer token, if any.
    pub access_token: Option<String>,
    /// Encoded body.
    pub body: Vec<u8>,
    /// Timeout the engine enforces for this request.
    pub timeout: Duration,
}

/// A response with a status and a CBOR body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status.
    pub status: u16,
    /// Encoded body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response.
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }

    /// Creates a `200 OK` response.
    pub fn ok(body: Vec<u8>) -> Self {
        Self::new(200, body)
    }
}

/// Failure raised by the HTTP client before any status was received.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientFailure {
    /// The request timed out in the client.
    #[error("request timed out")]
    TimedOut,
    /// The connection failed.
    #[error("i/o failure: {0}")]
    Io(String),
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
/// This allows using different HTTP libraries (reqwest, hyper, ureq, etc.)
/// or even non-HTTP transports.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request, reporting body transfer progress if asked to.
    async fn post(
        &self,
        request: HttpRequest,
        progress: Option<&ProgressFn>,
    ) -> Result<HttpResponse, ClientFailure>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// HTTP-based sync transport.
///
/// Uses CBOR encoding for request/response bodies and sends the access
/// token as a bearer credential.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the backend (e.g., "https://sync.example.com").
    base_url: String,
    /// HTTP client implementation.
    client: C,
    /// Current access token.
    access_token: RwLock<Option<String>>,
    /// Connection state.
    connected: AtomicBool,
    /// Last error message.
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into(),
            client,
            access_token: RwLock::new(None),
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Sets the access token sent with every request.
    #[must_use]
    pub fn with_access_token(self, token: impl Into<String>) -> Self {
        *self.access_token.write() = Some(token.into());
        self
    }

    /// Replaces the access token, e.g. after the backend reported it gone.
    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write() = token;
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn set_error(&self, err: &SyncError) {
        *self.last_error.write() = Some(err.to_string());
    }

    fn clear_error(&self) {
        *self.last_error.write() = None;
    }

    async fn post_cbor<Req, Res>(
        &self,
        endpoint: &str,
        request: &Req,
        timeout: Duration,
        progress: Option<&ProgressFn>,
    ) -> SyncResult<Res>
    where
        Req: WireMessage + Sync,
        Res: WireMessage,
    {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::transport_fatal("transport is closed"));
        }

        let body = request.encode()?;
        let http_request = HttpRequest {
            url: format!("{}{}", self.base_url, endpoint),
            access_token: self.access_token.read().clone(),
            body,
            timeout,
        };

        let response = match self.client.post(http_request, progress).await {
            Ok(response) => response,
            Err(failure) => {
                let err = ErrorClassifier::classify_failure(&failure);
                self.set_error(&err);
                return Err(err);
            }
        };
        if let Some(err) = ErrorClassifier::classify_status(response.status) {
            tracing::debug!(endpoint, status = response.status, "backend refused request");
            self.set_error(&err);
            return Err(err);
        }

        self.clear_error();
        Res::decode(&response.body).map_err(|e| {
            let err = SyncError::Protocol(format!("failed to decode response: {e}"));
            self.set_error(&err);
            err
        })
    }
}

#[async_trait]
impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    async fn pull(&self, request: &PullRequest, timeout: Duration) -> SyncResult<PullResponse> {
        self.post_cbor(PULL_PATH, request, timeout, None).await
    }

    async fn push(&self, request: &PushRequest, timeout: Duration) -> SyncResult<PushResponse> {
        self.post_cbor(PUSH_PATH, request, timeout, None).await
    }

    async fn download_attachment(
        &self,
        solution: &str,
        attachment: &AttachmentRef,
        timeout: Duration,
        progress: &ProgressFn,
    ) -> SyncResult<AttachmentPayload> {
        let request = AttachmentDownloadRequest::new(solution, attachment.clone());
        self.post_cbor(DOWNLOAD_PATH, &request, timeout, Some(progress))
            .await
    }

    async fn upload_attachment(
        &self,
        upload: &AttachmentUpload,
        timeout: Duration,
        progress: &ProgressFn,
    ) -> SyncResult<AttachmentPushResponse> {
        self.post_cbor(UPLOAD_PATH, upload, timeout, Some(progress))
            .await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// A backend reachable without a network.
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST to `path` and returns the response.
    fn handle(&self, path: &str, access_token: Option<&str>, body: &[u8]) -> HttpResponse;
}

impl<S: LoopbackServer + ?Sized> LoopbackServer for Arc<S> {
    fn handle(&self, path: &str, access_token: Option<&str>, body: &[u8]) -> HttpResponse {
        (**self).handle(path, access_token, body)
    }
}

/// Default number of bytes per progress step.
pub const DEFAULT_LOOPBACK_CHUNK: usize = 16 * 1024;

/// An [`HttpClient`] that hands requests to an in-process [`LoopbackServer`].
///
/// Body transfer is simulated in chunks so progress callbacks fire the way
/// they would over a network.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
    chunk_size: usize,
    online: AtomicBool,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a client for `server`.
    pub fn new(server: S) -> Self {
        Self {
            server,
            chunk_size: DEFAULT_LOOPBACK_CHUNK,
            online: AtomicBool::new(true),
        }
    }

    /// Sets the number of bytes per progress step.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Simulates losing or regaining connectivity.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Returns the server.
    pub fn server(&self) -> &S {
        &self.server
    }
}

fn request_path(url: &str) -> &str {
    match url.find("/sync/") {
        Some(start) => &url[start..],
        None => url,
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn post(
        &self,
        request: HttpRequest,
        progress: Option<&ProgressFn>,
    ) -> Result<HttpResponse, ClientFailure> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(ClientFailure::Io("connection refused".into()));
        }

        let response = self.server.handle(
            request_path(&request.url),
            request.access_token.as_deref(),
            &request.body,
        );

        if let Some(progress) = progress {
            let total = request.body.len() + response.body.len();
            let mut sent = 0;
            while sent < total {
                sent = (sent + self.chunk_size).min(total);
                progress(sent as f64 / total as f64);
                tokio::task::yield_now().await;
            }
            if total == 0 {
                progress(1.0);
            }
        }
        Ok(response)
    }

    fn is_healthy(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::{Checkpoint, Document, RemoteChange};
    use parking_lot::Mutex;

    /// Answers every request with a fixed response and records tokens.
    struct FixedServer {
        status: u16,
        body: Vec<u8>,
        tokens: Mutex<Vec<Option<String>>>,
        paths: Mutex<Vec<String>>,
    }

    impl FixedServer {
        fn new(status: u16, body: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                status,
                body,
                tokens: Mutex::new(Vec::new()),
                paths: Mutex::new(Vec::new()),
            })
        }
    }

    impl LoopbackServer for FixedServer {
        fn handle(&self, path: &str, access_token: Option<&str>, _body: &[u8]) -> HttpResponse {
            self.tokens.lock().push(access_token.map(str::to_string));
            self.paths.lock().push(path.to_string());
            HttpResponse::new(self.status, self.body.clone())
        }
    }

    fn pull() -> PullRequest {
        PullRequest::new("crm", Checkpoint::ORIGIN, 10)
    }

    #[tokio::test]
    async fn pull_decodes_page_and_sends_token() {
        let page = PullResponse::new(
            vec![RemoteChange::create(Document::new("a", "order", 1, vec![]))],
            Checkpoint::new(1),
            false,
        );
        let server = FixedServer::new(200, page.encode().unwrap());
        let transport = HttpTransport::new(
            "https://sync.example.com",
            LoopbackClient::new(Arc::clone(&server)),
        )
        .with_access_token("secret");

        let decoded = transport.pull(&pull(), Duration::from_secs(1)).await.unwrap();
        assert_eq!(decoded, page);
        assert_eq!(server.tokens.lock()[0].as_deref(), Some("secret"));
        assert_eq!(server.paths.lock()[0], PULL_PATH);
        assert!(transport.last_error().is_none());
    }

    #[tokio::test]
    async fn gone_status_maps_to_gone() {
        let server = FixedServer::new(410, Vec::new());
        let transport = HttpTransport::new("http://local", LoopbackClient::new(server));
        let err = transport.pull(&pull(), Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_gone());
        assert!(transport.last_error().is_some());
    }

    #[tokio::test]
    async fn undecodable_body_is_a_protocol_error() {
        let server = FixedServer::new(200, vec![0xff, 0x00]);
        let transport = HttpTransport::new("http://local", LoopbackClient::new(server));
        let err = transport.pull(&pull(), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[tokio::test]
    async fn offline_client_is_retryable() {
        let server = FixedServer::new(200, Vec::new());
        let client = LoopbackClient::new(server);
        client.set_online(false);
        let transport = HttpTransport::new("http://local", client);
        assert!(!transport.is_connected());
        let err = transport.pull(&pull(), Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_retryable());

        transport.client().set_online(true);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn progress_is_reported_in_chunks() {
        let payload = AttachmentPayload {
            content_type: "application/octet-stream".into(),
            revision: 1,
            data: vec![0; 4096],
        };
        let server = FixedServer::new(200, payload.encode().unwrap());
        let transport = HttpTransport::new(
            "http://local",
            LoopbackClient::new(server).with_chunk_size(1024),
        );

        let steps = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&steps);
        let progress = move |p: f64| sink.lock().push(p);
        let downloaded = transport
            .download_attachment(
                "crm",
                &AttachmentRef::new("a", "blob"),
                Duration::from_secs(1),
                &progress,
            )
            .await
            .unwrap();
        assert_eq!(downloaded.data.len(), 4096);

        let steps = steps.lock();
        assert!(steps.len() > 1);
        assert!(steps.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(steps.last().copied(), Some(1.0));
    }

    #[tokio::test]
    async fn closed_transport_refuses_requests() {
        let server = FixedServer::new(200, Vec::new());
        let transport = HttpTransport::new("http://local", LoopbackClient::new(server));
        transport.close().unwrap();
        assert!(transport.pull(&pull(), Duration::from_secs(1)).await.is_err());
    }
}
