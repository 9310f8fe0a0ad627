//! Attachment transfers.
//!
//! Attachment payloads move independently of the document cycle: a pulled
//! document enqueues its downloads right away and the run does not wait for
//! them. Transfers run on a bounded pool. Requests for an attachment that is
//! already transferring join the running transfer instead of starting a
//! second one, so a download and an upload of the same attachment never
//! overlap.

use crate::cancel::{guarded, CancelToken};
use crate::config::SyncConfig;
use crate::error::{ErrorClassifier, ErrorKind, SyncError, SyncResult};
use crate::events::{EventKind, EventPublisher, SyncEvent};
use crate::store::{AttachmentState, LocalStore, PushResolution, StoreError, StoreResult};
use crate::transport::SyncTransport;
use docsync_protocol::{AttachmentRef, AttachmentUpload, ErrorCode, PushOutcome};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// Direction of an attachment transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    /// Backend to device.
    Download,
    /// Device to backend.
    Upload,
}

/// Result of asking for a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// A new transfer was started.
    Started,
    /// A transfer of this attachment was already running.
    Joined(TransferDirection),
}

/// Drives attachment downloads and uploads.
pub struct AttachmentSynchronizer<T: SyncTransport + 'static, S: LocalStore + 'static> {
    shared: Arc<Shared<T, S>>,
}

impl<T: SyncTransport + 'static, S: LocalStore + 'static> Clone for AttachmentSynchronizer<T, S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

struct Shared<T, S> {
    transport: Arc<T>,
    store: Arc<S>,
    events: EventPublisher,
    solution: String,
    timeout: Duration,
    max_attempts: u32,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashMap<AttachmentRef, TransferDirection>>,
    active: watch::Sender<usize>,
    shutdown: CancelToken,
    runtime: Handle,
}

/// Treats a vanished attachment as nothing left to do.
fn ignore_missing(result: StoreResult<()>) -> StoreResult<()> {
    match result {
        Err(StoreError::AttachmentNotFound(_)) => Ok(()),
        other => other,
    }
}

impl<T: SyncTransport + 'static, S: LocalStore + 'static> AttachmentSynchronizer<T, S> {
    pub(crate) fn new(
        config: &SyncConfig,
        transport: Arc<T>,
        store: Arc<S>,
        events: EventPublisher,
        runtime: Handle,
    ) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                transport,
                store,
                events,
                solution: config.solution.clone(),
                timeout: config.attachment_timeout,
                max_attempts: config.max_attachment_attempts,
                permits: Arc::new(Semaphore::new(config.max_concurrent_transfers)),
                in_flight: Mutex::new(HashMap::new()),
                active,
                shutdown: CancelToken::new(),
                runtime,
            }),
        }
    }

    /// Requests a download of `key`.
    pub fn download(&self, key: AttachmentRef) -> SyncResult<Enqueued> {
        self.enqueue(key, TransferDirection::Download)
    }

    /// Requests an upload of `key`.
    pub fn upload(&self, key: AttachmentRef) -> SyncResult<Enqueued> {
        self.enqueue(key, TransferDirection::Upload)
    }

    fn enqueue(&self, key: AttachmentRef, direction: TransferDirection) -> SyncResult<Enqueued> {
        if self.shared.shutdown.is_cancelled() {
            return Err(SyncError::Closed);
        }
        {
            let mut in_flight = self.shared.in_flight.lock();
            if let Some(running) = in_flight.get(&key) {
                debug!(attachment = %key, ?running, "transfer already running");
                return Ok(Enqueued::Joined(*running));
            }
            in_flight.insert(key.clone(), direction);
        }
        self.shared.active.send_modify(|active| *active += 1);

        let shared = Arc::clone(&self.shared);
        self.shared.runtime.spawn(shared.run(key, direction));
        Ok(Enqueued::Started)
    }

    /// Returns true while a transfer of `key` is running or queued.
    pub fn is_transferring(&self, key: &AttachmentRef) -> bool {
        self.shared.in_flight.lock().contains_key(key)
    }

    /// Returns the number of running or queued transfers.
    pub fn active_transfers(&self) -> usize {
        *self.shared.active.borrow()
    }

    /// Waits until no transfer is running or queued.
    pub async fn wait_idle(&self) {
        let mut active = self.shared.active.subscribe();
        // The sender lives in `shared`, so this only fails once it is gone.
        let _ = active.wait_for(|count| *count == 0).await;
    }

    /// Restarts downloads that are pending or failed transiently.
    ///
    /// Attachments left mid-transfer by an earlier process are reset to
    /// pending first.
    pub fn resume_downloads(&self) -> SyncResult<usize> {
        let store = &self.shared.store;
        for key in store.attachments_in(&[AttachmentState::Downloading, AttachmentState::Uploading])? {
            if !self.is_transferring(&key) {
                ignore_missing(store.set_attachment_state(&key, AttachmentState::Pending))?;
            }
        }

        let mut started = 0;
        for key in store.attachments_in(&[AttachmentState::Pending, AttachmentState::Unavailable])? {
            if self.download(key)? == Enqueued::Started {
                started += 1;
            }
        }
        Ok(started)
    }

    /// Drops attachments whose owning document no longer exists.
    pub fn reconcile_orphans(&self) -> SyncResult<usize> {
        let mut removed = 0;
        for key in self.shared.store.orphaned_attachments()? {
            if self.is_transferring(&key) {
                continue;
            }
            self.shared.store.remove_attachment(&key)?;
            self.shared.events.publish(SyncEvent::attachment(
                EventKind::DidDeleteAttachment,
                &self.shared.solution,
                &key,
            ));
            removed += 1;
        }
        if removed > 0 {
            debug!(removed, "dropped orphaned attachments");
        }
        Ok(removed)
    }

    /// Interrupts every transfer and refuses new ones.
    ///
    /// Interrupted attachments go back to pending without an event.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }
}

impl<T: SyncTransport + 'static, S: LocalStore + 'static> Shared<T, S> {
    async fn run(self: Arc<Self>, key: AttachmentRef, direction: TransferDirection) {
        let result = match self.acquire().await {
            Some(_permit) => match direction {
                TransferDirection::Download => self.download(&key).await,
                TransferDirection::Upload => self.upload(&key).await,
            },
            None => Ok(()),
        };
        if let Err(err) = result {
            warn!(attachment = %key, ?direction, error = %err, "attachment transfer aborted");
        }

        self.in_flight.lock().remove(&key);
        self.active.send_modify(|active| *active = active.saturating_sub(1));
    }

    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
        }
    }

    fn publish(&self, kind: EventKind, key: &AttachmentRef) {
        self.events
            .publish(SyncEvent::attachment(kind, &self.solution, key));
    }

    fn progress_reporter(&self, key: &AttachmentRef) -> impl Fn(f64) + Send + Sync + 'static {
        let store = Arc::clone(&self.store);
        let events = self.events.clone();
        let solution = self.solution.clone();
        let key = key.clone();
        move |fraction: f64| {
            if let Err(err) = store.set_attachment_progress(&key, fraction) {
                debug!(attachment = %key, error = %err, "progress not recorded");
            }
            events.publish(SyncEvent::attachment_progress(&solution, &key, fraction));
        }
    }

    async fn download(&self, key: &AttachmentRef) -> SyncResult<()> {
        let Some(local) = self.store.attachment(key)? else {
            return Ok(());
        };
        // A newer local payload wins until it is uploaded.
        if local.dirty
            || matches!(
                local.state,
                AttachmentState::Available | AttachmentState::Failed
            )
        {
            return Ok(());
        }

        ignore_missing(
            self.store
                .set_attachment_state(key, AttachmentState::Downloading),
        )?;
        self.publish(EventKind::WillDownloadAttachment, key);

        let progress = self.progress_reporter(key);
        let result = guarded(
            &self.shutdown,
            self.timeout,
            self.transport
                .download_attachment(&self.solution, key, self.timeout, &progress),
        )
        .await;

        match result {
            Ok(payload) => {
                let revision = payload.revision;
                match self.store.store_attachment_payload(key, payload) {
                    Ok(()) => {
                        debug!(attachment = %key, revision, "attachment downloaded");
                        self.publish(EventKind::AttachmentDidBecomeAvailable, key);
                        Ok(())
                    }
                    Err(StoreError::AttachmentNotFound(_)) => Ok(()),
                    Err(err) => Err(err.into()),
                }
            }
            Err(SyncError::Cancelled) => Ok(ignore_missing(
                self.store.set_attachment_state(key, AttachmentState::Pending),
            )?),
            Err(err) => self.download_failed(key, &err),
        }
    }

    fn download_failed(&self, key: &AttachmentRef, err: &SyncError) -> SyncResult<()> {
        if err.is_gone() {
            self.credential_revoked(key, TransferDirection::Download)?;
            self.publish(EventKind::AttachmentDidBecomeUnavailable, key);
            return Ok(());
        }
        let attempts = match self.store.record_attachment_failure(key) {
            Ok(attempts) => attempts,
            Err(StoreError::AttachmentNotFound(_)) => return Ok(()),
            Err(store_err) => return Err(store_err.into()),
        };
        let permanent = err.kind() == ErrorKind::Protocol || attempts >= self.max_attempts;
        if permanent {
            warn!(attachment = %key, attempts, error = %err, "attachment download failed");
            ignore_missing(self.store.set_attachment_state(key, AttachmentState::Failed))?;
            self.events.publish(SyncEvent::attachment_failure(
                EventKind::AttachmentDidFail,
                &self.solution,
                key,
                err.error_code(),
            ));
        } else {
            debug!(attachment = %key, attempts, error = %err, "attachment unavailable");
            ignore_missing(
                self.store
                    .set_attachment_state(key, AttachmentState::Unavailable),
            )?;
            self.publish(EventKind::AttachmentDidBecomeUnavailable, key);
        }
        Ok(())
    }

    /// A revoked credential says nothing about the attachment itself: no
    /// attempt is counted and the transfer stays eligible for the next
    /// trigger.
    fn credential_revoked(
        &self,
        key: &AttachmentRef,
        direction: TransferDirection,
    ) -> SyncResult<()> {
        warn!(attachment = %key, ?direction, "access token rejected, transfer postponed");
        Ok(ignore_missing(
            self.store
                .set_attachment_state(key, AttachmentState::Unavailable),
        )?)
    }

    async fn upload(&self, key: &AttachmentRef) -> SyncResult<()> {
        let Some(local) = self.store.attachment(key)? else {
            return Ok(());
        };
        if !local.dirty || local.state == AttachmentState::Failed {
            return Ok(());
        }
        let Some(data) = local.payload.clone() else {
            return Ok(());
        };
        // The backend must know the owning document before it takes payloads.
        match self.store.document(&key.document_id)? {
            Some(doc) if !doc.is_new() && !doc.deleted => {}
            _ => {
                debug!(attachment = %key, "upload deferred until the document is synchronized");
                return Ok(());
            }
        }

        ignore_missing(self.store.set_attachment_state(key, AttachmentState::Uploading))?;
        let upload = AttachmentUpload {
            solution: self.solution.clone(),
            attachment: key.clone(),
            content_type: local.content_type.clone(),
            base_revision: (local.revision > 0).then_some(local.revision),
            data: data.to_vec(),
        };

        let progress = self.progress_reporter(key);
        let result = guarded(
            &self.shutdown,
            self.timeout,
            self.transport
                .upload_attachment(&upload, self.timeout, &progress),
        )
        .await;

        let outcome = match result {
            Ok(response) => response.outcome,
            Err(SyncError::Cancelled) => {
                return Ok(ignore_missing(
                    self.store.set_attachment_state(key, AttachmentState::Pending),
                )?);
            }
            Err(err) => PushOutcome::Error {
                code: err.error_code(),
            },
        };

        match outcome {
            PushOutcome::Accepted { revision } => {
                self.store.complete_attachment_upload(
                    key,
                    local.change_seq,
                    PushResolution::Accepted { revision },
                )?;
                ignore_missing(self.store.set_attachment_state(key, AttachmentState::Available))?;
                debug!(attachment = %key, revision, "attachment uploaded");
                self.publish(EventKind::DidSynchronizeAttachment, key);
            }
            PushOutcome::Rejected { reason } => {
                self.store.complete_attachment_upload(
                    key,
                    local.change_seq,
                    PushResolution::Rejected,
                )?;
                ignore_missing(self.store.set_attachment_state(key, AttachmentState::Failed))?;
                warn!(attachment = %key, %reason, "attachment rejected");
                self.events.publish(SyncEvent::attachment_rejected(
                    &self.solution,
                    key,
                    reason,
                ));
            }
            PushOutcome::Error { code } => self.upload_failed(key, code)?,
        }
        Ok(())
    }

    fn upload_failed(&self, key: &AttachmentRef, code: ErrorCode) -> SyncResult<()> {
        if ErrorClassifier::classify_code(code) == ErrorKind::Gone {
            return self.credential_revoked(key, TransferDirection::Upload);
        }
        let attempts = match self.store.record_attachment_failure(key) {
            Ok(attempts) => attempts,
            Err(StoreError::AttachmentNotFound(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let state = if attempts >= self.max_attempts {
            AttachmentState::Failed
        } else {
            AttachmentState::Unavailable
        };
        debug!(attachment = %key, attempts, %code, %state, "attachment upload failed");
        ignore_missing(self.store.set_attachment_state(key, state))?;
        self.events.publish(SyncEvent::attachment_failure(
            EventKind::AttachmentError,
            &self.solution,
            key,
            code,
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::transport::MockTransport;
    use docsync_protocol::{
        AttachmentDescriptor, AttachmentPayload, Document, RejectionReason, RemoteChange,
    };

    struct Fixture {
        transport: Arc<MockTransport>,
        store: Arc<MemoryStore>,
        events: EventPublisher,
        seen: Arc<Mutex<Vec<SyncEvent>>>,
        sync: AttachmentSynchronizer<MockTransport, MemoryStore>,
    }

    fn fixture(config: SyncConfig) -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let store = Arc::new(MemoryStore::new());
        let events = EventPublisher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        events.subscribe_all(move |event| {
            if event.kind != EventKind::AttachmentDidProgress {
                sink.lock().push(event.clone());
            }
        });
        let sync = AttachmentSynchronizer::new(
            &config,
            Arc::clone(&transport),
            Arc::clone(&store),
            events.clone(),
            Handle::current(),
        );
        Fixture {
            transport,
            store,
            events,
            seen,
            sync,
        }
    }

    fn remote_attachment(store: &MemoryStore, doc: &str, name: &str) -> AttachmentRef {
        let document = Document::new(doc, "order", 1, vec![])
            .with_attachment(AttachmentDescriptor::new(name, "image/png", 1, 3));
        store
            .apply_remote_change(&RemoteChange::create(document))
            .unwrap();
        AttachmentRef::new(doc, name)
    }

    fn payload() -> AttachmentPayload {
        AttachmentPayload {
            content_type: "image/png".into(),
            revision: 1,
            data: vec![1, 2, 3],
        }
    }

    fn kinds(seen: &Mutex<Vec<SyncEvent>>) -> Vec<EventKind> {
        seen.lock().iter().map(|e| e.kind).collect()
    }

    async fn wait_for_state(store: &MemoryStore, key: &AttachmentRef, state: AttachmentState) {
        for _ in 0..200 {
            if store.attachment(key).unwrap().map(|a| a.state) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{key} never reached {state}");
    }

    #[tokio::test]
    async fn download_makes_attachment_available() {
        let f = fixture(SyncConfig::new("crm"));
        let key = remote_attachment(&f.store, "a", "photo");
        f.transport.set_download(key.clone(), Ok(payload()));

        assert_eq!(f.sync.download(key.clone()).unwrap(), Enqueued::Started);
        f.sync.wait_idle().await;

        let local = f.store.attachment(&key).unwrap().unwrap();
        assert_eq!(local.state, AttachmentState::Available);
        assert_eq!(f.store.attachment_payload(&key).unwrap().as_ref(), &[1, 2, 3]);
        assert_eq!(
            kinds(&f.seen),
            vec![
                EventKind::WillDownloadAttachment,
                EventKind::AttachmentDidBecomeAvailable
            ]
        );
    }

    #[tokio::test]
    async fn progress_events_are_published() {
        let f = fixture(SyncConfig::new("crm"));
        let key = remote_attachment(&f.store, "a", "photo");
        f.transport.set_download(key.clone(), Ok(payload()));
        let steps = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&steps);
        f.events
            .subscribe(EventKind::AttachmentDidProgress, move |event| {
                sink.lock().push(event.payload.progress.unwrap_or(-1.0));
            });

        f.sync.download(key).unwrap();
        f.sync.wait_idle().await;
        assert_eq!(*steps.lock(), vec![0.0, 0.5, 1.0]);
    }

    #[tokio::test]
    async fn duplicate_requests_collapse() {
        let f = fixture(SyncConfig::new("crm"));
        let key = remote_attachment(&f.store, "a", "photo");
        f.transport.set_download(key.clone(), Ok(payload()));
        f.transport.hold_download(key.clone());

        assert_eq!(f.sync.download(key.clone()).unwrap(), Enqueued::Started);
        assert_eq!(
            f.sync.download(key.clone()).unwrap(),
            Enqueued::Joined(TransferDirection::Download)
        );
        assert_eq!(
            f.sync.upload(key.clone()).unwrap(),
            Enqueued::Joined(TransferDirection::Download)
        );
        assert_eq!(f.sync.active_transfers(), 1);

        f.transport.release_download(&key);
        f.sync.wait_idle().await;
        assert_eq!(f.transport.download_requests().len(), 1);
        assert!(!f.sync.is_transferring(&key));
    }

    #[tokio::test]
    async fn pool_bounds_concurrent_transfers() {
        let f = fixture(SyncConfig::new("crm").with_max_concurrent_transfers(1));
        let first = remote_attachment(&f.store, "a", "photo");
        let second = remote_attachment(&f.store, "b", "photo");
        for key in [&first, &second] {
            f.transport.set_download(key.clone(), Ok(payload()));
            f.transport.hold_download(key.clone());
        }

        f.sync.download(first.clone()).unwrap();
        f.sync.download(second.clone()).unwrap();
        wait_for_state(&f.store, &first, AttachmentState::Downloading).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.transport.download_requests(), vec![first.clone()]);

        f.transport.release_download(&first);
        wait_for_state(&f.store, &second, AttachmentState::Downloading).await;
        f.transport.release_download(&second);
        f.sync.wait_idle().await;
        assert_eq!(f.transport.download_requests().len(), 2);
    }

    #[tokio::test]
    async fn transient_failures_become_permanent_after_max_attempts() {
        let f = fixture(SyncConfig::new("crm").with_max_attachment_attempts(2));
        let key = remote_attachment(&f.store, "a", "photo");
        f.transport.set_download(
            key.clone(),
            Err(SyncError::transport_retryable("connection reset")),
        );

        f.sync.download(key.clone()).unwrap();
        f.sync.wait_idle().await;
        assert_eq!(
            f.store.attachment(&key).unwrap().unwrap().state,
            AttachmentState::Unavailable
        );

        assert_eq!(f.sync.resume_downloads().unwrap(), 1);
        f.sync.wait_idle().await;
        assert_eq!(
            f.store.attachment(&key).unwrap().unwrap().state,
            AttachmentState::Failed
        );
        assert_eq!(
            kinds(&f.seen),
            vec![
                EventKind::WillDownloadAttachment,
                EventKind::AttachmentDidBecomeUnavailable,
                EventKind::WillDownloadAttachment,
                EventKind::AttachmentDidFail,
            ]
        );

        // Failed attachments are not retried.
        assert_eq!(f.sync.resume_downloads().unwrap(), 0);
    }

    #[tokio::test]
    async fn revoked_token_postpones_download_until_renewed() {
        let f = fixture(SyncConfig::new("crm").with_max_attachment_attempts(1));
        let key = remote_attachment(&f.store, "a", "photo");
        f.transport.set_download(key.clone(), Err(SyncError::Gone));

        f.sync.download(key.clone()).unwrap();
        f.sync.wait_idle().await;
        let local = f.store.attachment(&key).unwrap().unwrap();
        assert_eq!(local.state, AttachmentState::Unavailable);
        assert_eq!(
            kinds(&f.seen),
            vec![
                EventKind::WillDownloadAttachment,
                EventKind::AttachmentDidBecomeUnavailable
            ]
        );

        f.transport.set_download(key.clone(), Ok(payload()));
        assert_eq!(f.sync.resume_downloads().unwrap(), 1);
        f.sync.wait_idle().await;
        assert_eq!(
            f.store.attachment(&key).unwrap().unwrap().state,
            AttachmentState::Available
        );
    }

    #[tokio::test]
    async fn revoked_token_keeps_upload_pending() {
        let f = fixture(SyncConfig::new("crm").with_max_attachment_attempts(1));
        remote_attachment(&f.store, "a", "photo");
        let key = f
            .store
            .put_attachment("a", "signature", "image/png", vec![1u8])
            .unwrap();
        f.transport.queue_upload_error(SyncError::Gone);

        f.sync.upload(key.clone()).unwrap();
        f.sync.wait_idle().await;
        let local = f.store.attachment(&key).unwrap().unwrap();
        assert!(local.dirty);
        assert_eq!(local.state, AttachmentState::Unavailable);
        assert!(f.seen.lock().is_empty());

        f.sync.upload(key.clone()).unwrap();
        f.sync.wait_idle().await;
        let local = f.store.attachment(&key).unwrap().unwrap();
        assert!(!local.dirty);
        assert_eq!(local.state, AttachmentState::Available);
        assert_eq!(kinds(&f.seen), vec![EventKind::DidSynchronizeAttachment]);
    }

    #[tokio::test]
    async fn protocol_errors_fail_immediately() {
        let f = fixture(SyncConfig::new("crm"));
        let key = remote_attachment(&f.store, "a", "photo");

        f.sync.download(key.clone()).unwrap();
        f.sync.wait_idle().await;
        assert_eq!(
            f.store.attachment(&key).unwrap().unwrap().state,
            AttachmentState::Failed
        );
        let failed = f.seen.lock().last().cloned().unwrap();
        assert_eq!(failed.kind, EventKind::AttachmentDidFail);
        assert_eq!(failed.payload.error_code, Some(ErrorCode::PROTOCOL));
    }

    #[tokio::test]
    async fn shutdown_returns_interrupted_transfers_to_pending() {
        let f = fixture(SyncConfig::new("crm"));
        let key = remote_attachment(&f.store, "a", "photo");
        f.transport.set_download(key.clone(), Ok(payload()));
        f.transport.hold_download(key.clone());

        f.sync.download(key.clone()).unwrap();
        wait_for_state(&f.store, &key, AttachmentState::Downloading).await;
        f.sync.shutdown();
        f.sync.wait_idle().await;

        assert_eq!(
            f.store.attachment(&key).unwrap().unwrap().state,
            AttachmentState::Pending
        );
        assert_eq!(kinds(&f.seen), vec![EventKind::WillDownloadAttachment]);
        assert!(matches!(f.sync.download(key), Err(SyncError::Closed)));
    }

    #[tokio::test]
    async fn upload_accepted() {
        let f = fixture(SyncConfig::new("crm"));
        remote_attachment(&f.store, "a", "photo");
        let key = f
            .store
            .put_attachment("a", "signature", "image/png", vec![9u8; 4])
            .unwrap();

        f.sync.upload(key.clone()).unwrap();
        f.sync.wait_idle().await;

        let local = f.store.attachment(&key).unwrap().unwrap();
        assert!(!local.dirty);
        assert_eq!(local.revision, 1);
        assert_eq!(local.state, AttachmentState::Available);
        assert_eq!(f.transport.upload_requests()[0].base_revision, None);
        assert_eq!(kinds(&f.seen), vec![EventKind::DidSynchronizeAttachment]);
    }

    #[tokio::test]
    async fn upload_rejected_is_final() {
        let f = fixture(SyncConfig::new("crm"));
        remote_attachment(&f.store, "a", "photo");
        let key = f
            .store
            .put_attachment("a", "video", "video/mp4", vec![0u8; 16])
            .unwrap();
        f.transport.queue_upload(PushOutcome::Rejected {
            reason: RejectionReason::LargeAttachment,
        });

        f.sync.upload(key.clone()).unwrap();
        f.sync.wait_idle().await;

        let local = f.store.attachment(&key).unwrap().unwrap();
        assert!(!local.dirty);
        assert_eq!(local.state, AttachmentState::Failed);
        let event = f.seen.lock()[0].clone();
        assert_eq!(event.kind, EventKind::DidRejectAttachment);
        assert_eq!(
            event.payload.rejection_reason,
            Some(RejectionReason::LargeAttachment)
        );
    }

    #[tokio::test]
    async fn upload_error_keeps_attachment_dirty() {
        let f = fixture(SyncConfig::new("crm"));
        remote_attachment(&f.store, "a", "photo");
        let key = f
            .store
            .put_attachment("a", "signature", "image/png", vec![1u8])
            .unwrap();
        f.transport.queue_upload(PushOutcome::Error {
            code: ErrorCode::UNAVAILABLE,
        });

        f.sync.upload(key.clone()).unwrap();
        f.sync.wait_idle().await;

        let local = f.store.attachment(&key).unwrap().unwrap();
        assert!(local.dirty);
        assert_eq!(local.state, AttachmentState::Unavailable);
        let event = f.seen.lock()[0].clone();
        assert_eq!(event.kind, EventKind::AttachmentError);
        assert_eq!(event.payload.error_code, Some(ErrorCode::UNAVAILABLE));
    }

    #[tokio::test]
    async fn upload_waits_for_document_to_reach_backend() {
        let f = fixture(SyncConfig::new("crm"));
        let id = f.store.create_document("order", vec![]).unwrap();
        let key = f
            .store
            .put_attachment(&id, "signature", "image/png", vec![1u8])
            .unwrap();

        f.sync.upload(key.clone()).unwrap();
        f.sync.wait_idle().await;

        assert!(f.transport.upload_requests().is_empty());
        assert!(f.store.attachment(&key).unwrap().unwrap().dirty);
        assert!(f.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn orphans_are_reconciled() {
        let f = fixture(SyncConfig::new("crm"));
        let key = remote_attachment(&f.store, "a", "photo");
        f.store
            .apply_remote_change(&RemoteChange::delete("a", "order", 2))
            .unwrap();

        assert_eq!(f.sync.reconcile_orphans().unwrap(), 1);
        assert!(f.store.attachment(&key).unwrap().is_none());
        assert_eq!(kinds(&f.seen), vec![EventKind::DidDeleteAttachment]);
        assert_eq!(f.sync.reconcile_orphans().unwrap(), 0);
    }
}
