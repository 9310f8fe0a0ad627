//! Store double that fails selected operations.

use crate::memory::MemoryStore;
use crate::store::{
    ApplyReport, AttachmentState, LocalAttachment, LocalDocument, LocalStore, PendingDocument,
    PushResolution, StoreError, StoreResult,
};
use docsync_protocol::{AttachmentPayload, AttachmentRef, Checkpoint, RemoteChange};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Wraps a [`MemoryStore`] and fails named operations a set number of times.
#[derive(Default)]
pub(crate) struct FaultyStore {
    pub(crate) inner: MemoryStore,
    faults: Mutex<HashMap<&'static str, usize>>,
}

impl FaultyStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Makes the next `times` calls of `operation` fail.
    pub(crate) fn fail(&self, operation: &'static str, times: usize) {
        self.faults.lock().insert(operation, times);
    }

    fn check(&self, operation: &'static str) -> StoreResult<()> {
        let mut faults = self.faults.lock();
        match faults.get_mut(operation) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StoreError::Backend(format!("{operation}: io")))
            }
            _ => Ok(()),
        }
    }
}

impl LocalStore for FaultyStore {
    fn checkpoint(&self) -> StoreResult<Checkpoint> {
        self.check("checkpoint")?;
        self.inner.checkpoint()
    }
    fn advance_checkpoint(&self, checkpoint: Checkpoint) -> StoreResult<()> {
        self.check("advance_checkpoint")?;
        self.inner.advance_checkpoint(checkpoint)
    }
    fn apply_remote_change(&self, change: &RemoteChange) -> StoreResult<ApplyReport> {
        self.check("apply_remote_change")?;
        self.inner.apply_remote_change(change)
    }
    fn begin_push(&self) -> StoreResult<Vec<PendingDocument>> {
        self.check("begin_push")?;
        self.inner.begin_push()
    }
    fn complete_push(&self, id: &str, seq: u64, resolution: PushResolution) -> StoreResult<()> {
        self.check("complete_push")?;
        self.inner.complete_push(id, seq, resolution)
    }
    fn document(&self, id: &str) -> StoreResult<Option<LocalDocument>> {
        self.inner.document(id)
    }
    fn attachment(&self, key: &AttachmentRef) -> StoreResult<Option<LocalAttachment>> {
        self.inner.attachment(key)
    }
    fn attachments_in(&self, states: &[AttachmentState]) -> StoreResult<Vec<AttachmentRef>> {
        self.inner.attachments_in(states)
    }
    fn dirty_attachments(&self) -> StoreResult<Vec<AttachmentRef>> {
        self.check("dirty_attachments")?;
        self.inner.dirty_attachments()
    }
    fn set_attachment_state(&self, key: &AttachmentRef, state: AttachmentState) -> StoreResult<()> {
        self.inner.set_attachment_state(key, state)
    }
    fn set_attachment_progress(&self, key: &AttachmentRef, progress: f64) -> StoreResult<()> {
        self.inner.set_attachment_progress(key, progress)
    }
    fn store_attachment_payload(
        &self,
        key: &AttachmentRef,
        payload: AttachmentPayload,
    ) -> StoreResult<()> {
        self.inner.store_attachment_payload(key, payload)
    }
    fn complete_attachment_upload(
        &self,
        key: &AttachmentRef,
        seq: u64,
        resolution: PushResolution,
    ) -> StoreResult<()> {
        self.inner.complete_attachment_upload(key, seq, resolution)
    }
    fn record_attachment_failure(&self, key: &AttachmentRef) -> StoreResult<u32> {
        self.inner.record_attachment_failure(key)
    }
    fn orphaned_attachments(&self) -> StoreResult<Vec<AttachmentRef>> {
        self.inner.orphaned_attachments()
    }
    fn remove_attachment(&self, key: &AttachmentRef) -> StoreResult<()> {
        self.inner.remove_attachment(key)
    }
}
