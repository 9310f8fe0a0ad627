//! Transport layer abstraction for sync operations.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use docsync_protocol::{
    AttachmentPayload, AttachmentPushResponse, AttachmentRef, AttachmentUpload, PullRequest,
    PullResponse, PushOutcome, PushRequest, PushResponse,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Progress callback for attachment transfers, called with `0.0..=1.0`.
pub type ProgressFn = dyn Fn(f64) + Send + Sync;

/// A sync transport handles network communication with the backend.
///
/// This trait abstracts the network layer, allowing for different implementations
/// (HTTP, in-process loopback, mock for testing, etc.). Each call receives
/// the timeout the engine enforces so the implementation can configure its
/// own client accordingly.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Fetches one page of remote changes.
    async fn pull(&self, request: &PullRequest, timeout: Duration) -> SyncResult<PullResponse>;

    /// Submits one local document change.
    async fn push(&self, request: &PushRequest, timeout: Duration) -> SyncResult<PushResponse>;

    /// Fetches the current payload of an attachment.
    async fn download_attachment(
        &self,
        solution: &str,
        attachment: &AttachmentRef,
        timeout: Duration,
        progress: &ProgressFn,
    ) -> SyncResult<AttachmentPayload>;

    /// Submits a local attachment payload.
    async fn upload_attachment(
        &self,
        upload: &AttachmentUpload,
        timeout: Duration,
        progress: &ProgressFn,
    ) -> SyncResult<AttachmentPushResponse>;

    /// Checks if the transport is usable.
    fn is_connected(&self) -> bool {
        true
    }

    /// Closes the transport.
    fn close(&self) -> SyncResult<()> {
        Ok(())
    }
}

#[async_trait]
impl<T: SyncTransport + ?Sized> SyncTransport for Arc<T> {
    async fn pull(&self, request: &PullRequest, timeout: Duration) -> SyncResult<PullResponse> {
        (**self).pull(request, timeout).await
    }

    async fn push(&self, request: &PushRequest, timeout: Duration) -> SyncResult<PushResponse> {
        (**self).push(request, timeout).await
    }

    async fn download_attachment(
        &self,
        solution: &str,
        attachment: &AttachmentRef,
        timeout: Duration,
        progress: &ProgressFn,
    ) -> SyncResult<AttachmentPayload> {
        (**self)
            .download_attachment(solution, attachment, timeout, progress)
            .await
    }

    async fn upload_attachment(
        &self,
        upload: &AttachmentUpload,
        timeout: Duration,
        progress: &ProgressFn,
    ) -> SyncResult<AttachmentPushResponse> {
        (**self).upload_attachment(upload, timeout, progress).await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn close(&self) -> SyncResult<()> {
        (**self).close()
    }
}

/// A scripted transport for testing.
///
/// Responses are queued per operation and consumed in order. When a queue
/// is empty, pulls return an empty final page and pushes are accepted.
/// Downloads can be held open with [`hold_download`](Self::hold_download)
/// until [`release_download`](Self::release_download) is called.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    pulls: Mutex<VecDeque<SyncResult<PullResponse>>>,
    pushes: Mutex<VecDeque<SyncResult<PushOutcome>>>,
    uploads: Mutex<VecDeque<SyncResult<PushOutcome>>>,
    downloads: Mutex<HashMap<AttachmentRef, SyncResult<AttachmentPayload>>>,
    gates: Mutex<HashMap<AttachmentRef, Arc<Notify>>>,
    pull_delay: Mutex<Option<Duration>>,
    pull_log: Mutex<Vec<PullRequest>>,
    push_log: Mutex<Vec<PushRequest>>,
    upload_log: Mutex<Vec<AttachmentUpload>>,
    download_log: Mutex<Vec<AttachmentRef>>,
    timeouts: Mutex<Vec<Duration>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            pulls: Mutex::new(VecDeque::new()),
            pushes: Mutex::new(VecDeque::new()),
            uploads: Mutex::new(VecDeque::new()),
            downloads: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            pull_delay: Mutex::new(None),
            pull_log: Mutex::new(Vec::new()),
            push_log: Mutex::new(Vec::new()),
            upload_log: Mutex::new(Vec::new()),
            download_log: Mutex::new(Vec::new()),
            timeouts: Mutex::new(Vec::new()),
        }
    }

    /// Queues a pull page.
    pub fn queue_pull(&self, response: PullResponse) {
        self.pulls.lock().push_back(Ok(response));
    }

    /// Queues a pull failure.
    pub fn queue_pull_error(&self, error: SyncError) {
        self.pulls.lock().push_back(Err(error));
    }

    /// Queues the verdict for the next pushed document.
    pub fn queue_push(&self, outcome: PushOutcome) {
        self.pushes.lock().push_back(Ok(outcome));
    }

    /// Queues a failure for the next pushed document.
    pub fn queue_push_error(&self, error: SyncError) {
        self.pushes.lock().push_back(Err(error));
    }

    /// Queues the verdict for the next uploaded attachment.
    pub fn queue_upload(&self, outcome: PushOutcome) {
        self.uploads.lock().push_back(Ok(outcome));
    }

    /// Queues a failure for the next uploaded attachment.
    pub fn queue_upload_error(&self, error: SyncError) {
        self.uploads.lock().push_back(Err(error));
    }

    /// Sets what downloading `attachment` returns.
    pub fn set_download(&self, attachment: AttachmentRef, result: SyncResult<AttachmentPayload>) {
        self.downloads.lock().insert(attachment, result);
    }

    /// Holds downloads of `attachment` open until released.
    pub fn hold_download(&self, attachment: AttachmentRef) {
        self.gates.lock().insert(attachment, Arc::new(Notify::new()));
    }

    /// Lets one held download of `attachment` complete.
    pub fn release_download(&self, attachment: &AttachmentRef) {
        if let Some(gate) = self.gates.lock().remove(attachment) {
            gate.notify_one();
        }
    }

    /// Delays every pull by `delay`.
    pub fn set_pull_delay(&self, delay: Duration) {
        *self.pull_delay.lock() = Some(delay);
    }

    /// Sets the connection status.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Returns every pull request received.
    pub fn pull_requests(&self) -> Vec<PullRequest> {
        self.pull_log.lock().clone()
    }

    /// Returns every push request received.
    pub fn push_requests(&self) -> Vec<PushRequest> {
        self.push_log.lock().clone()
    }

    /// Returns every attachment upload received.
    pub fn upload_requests(&self) -> Vec<AttachmentUpload> {
        self.upload_log.lock().clone()
    }

    /// Returns every attachment download requested.
    pub fn download_requests(&self) -> Vec<AttachmentRef> {
        self.download_log.lock().clone()
    }

    /// Returns the timeout passed with every request, in call order.
    pub fn observed_timeouts(&self) -> Vec<Duration> {
        self.timeouts.lock().clone()
    }

    fn ensure_connected(&self, timeout: Duration) -> SyncResult<()> {
        self.timeouts.lock().push(timeout);
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::transport_fatal("not connected"));
        }
        Ok(())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn pull(&self, request: &PullRequest, timeout: Duration) -> SyncResult<PullResponse> {
        self.ensure_connected(timeout)?;
        self.pull_log.lock().push(request.clone());

        let delay = *self.pull_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.pulls.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(PullResponse::empty(request.checkpoint)))
    }

    async fn push(&self, request: &PushRequest, timeout: Duration) -> SyncResult<PushResponse> {
        self.ensure_connected(timeout)?;
        self.push_log.lock().push(request.clone());

        let scripted = self.pushes.lock().pop_front();
        let outcome = scripted.unwrap_or_else(|| {
            Ok(PushOutcome::Accepted {
                revision: request.upload.base_revision.unwrap_or(0) + 1,
            })
        })?;
        Ok(PushResponse::new(&request.upload.document_id, outcome))
    }

    async fn download_attachment(
        &self,
        _solution: &str,
        attachment: &AttachmentRef,
        timeout: Duration,
        progress: &ProgressFn,
    ) -> SyncResult<AttachmentPayload> {
        self.ensure_connected(timeout)?;
        self.download_log.lock().push(attachment.clone());

        let gate = self.gates.lock().get(attachment).cloned();
        progress(0.0);
        if let Some(gate) = gate {
            gate.notified().await;
        }
        progress(0.5);

        let scripted = self.downloads.lock().get(attachment).cloned();
        let payload = scripted.unwrap_or_else(|| {
            Err(SyncError::Protocol(format!("no payload for {attachment}")))
        })?;
        progress(1.0);
        Ok(payload)
    }

    async fn upload_attachment(
        &self,
        upload: &AttachmentUpload,
        timeout: Duration,
        progress: &ProgressFn,
    ) -> SyncResult<AttachmentPushResponse> {
        self.ensure_connected(timeout)?;
        self.upload_log.lock().push(upload.clone());
        progress(0.0);

        let scripted = self.uploads.lock().pop_front();
        let outcome = scripted.unwrap_or_else(|| {
            Ok(PushOutcome::Accepted {
                revision: upload.base_revision.unwrap_or(0) + 1,
            })
        })?;
        progress(1.0);
        Ok(AttachmentPushResponse {
            attachment: upload.attachment.clone(),
            outcome,
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> SyncResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}
