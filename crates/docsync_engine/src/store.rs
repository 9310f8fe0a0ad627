//! Local persistence seam used by the sync engine.
//!
//! The engine never owns document data. It reads and writes through a
//! [`LocalStore`], which is expected to apply each call atomically.
//! [`MemoryStore`](crate::MemoryStore) is the in-memory implementation used
//! by tests and the demo.

use bytes::Bytes;
use docsync_protocol::{
    AttachmentPayload, AttachmentRef, ChangeKind, Checkpoint, Document, DocumentUpload,
    RejectionReason, RemoteChange,
};
use std::fmt;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a [`LocalStore`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The underlying storage failed.
    #[error("storage backend failure: {0}")]
    Backend(String),

    /// No document with this identifier exists.
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    /// No attachment with this identifier exists.
    #[error("attachment not found: {0}")]
    AttachmentNotFound(AttachmentRef),

    /// The change breaks a local constraint and was not stored.
    #[error("constraint violation on {document_id}: {reason}")]
    Constraint {
        /// Offending document.
        document_id: String,
        /// Why the change was refused.
        reason: RejectionReason,
    },

    /// A checkpoint older than the stored one was proposed.
    #[error("checkpoint regression: stored {current}, proposed {proposed}")]
    CheckpointRegression {
        /// Stored checkpoint.
        current: Checkpoint,
        /// Proposed checkpoint.
        proposed: Checkpoint,
    },
}

/// A document as held by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalDocument {
    /// The document. `revision` is 0 until the backend accepted it once.
    pub document: Document,
    /// Whether the document holds an unpushed local change.
    pub dirty: bool,
    /// Whether the unpushed change is a deletion.
    pub deleted: bool,
    /// Whether the document is part of the batch currently being pushed.
    pub in_flight: bool,
    /// Monotonic local change counter, bumped on every local edit.
    pub change_seq: u64,
}

impl LocalDocument {
    /// Returns the document identifier.
    pub fn id(&self) -> &str {
        &self.document.id
    }

    /// Returns true if the backend has never accepted this document.
    pub fn is_new(&self) -> bool {
        self.document.revision == 0
    }
}

/// Lifecycle state of a locally tracked attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentState {
    /// Known from metadata, payload not yet transferred.
    Pending,
    /// Download in progress.
    Downloading,
    /// Upload in progress.
    Uploading,
    /// Payload stored locally and current.
    Available,
    /// Last transfer failed transiently; will be retried.
    Unavailable,
    /// Transfer failed permanently.
    Failed,
}

impl AttachmentState {
    /// Returns the state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AttachmentState::Pending => "pending",
            AttachmentState::Downloading => "downloading",
            AttachmentState::Uploading => "uploading",
            AttachmentState::Available => "available",
            AttachmentState::Unavailable => "unavailable",
            AttachmentState::Failed => "failed",
        }
    }

    /// Returns true while a transfer is running.
    pub fn is_transferring(&self) -> bool {
        matches!(self, AttachmentState::Downloading | AttachmentState::Uploading)
    }
}

impl fmt::Display for AttachmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An attachment as held by the device.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalAttachment {
    /// Owning document and name.
    pub key: AttachmentRef,
    /// MIME type.
    pub content_type: String,
    /// Backend revision of the payload; 0 if never uploaded.
    pub revision: u64,
    /// Transfer state.
    pub state: AttachmentState,
    /// Progress of the running transfer in `0.0..=1.0`.
    pub progress: f64,
    /// Whether the local payload has not been uploaded yet.
    pub dirty: bool,
    /// Consecutive failed transfers.
    pub failed_attempts: u32,
    /// Monotonic local change counter.
    pub change_seq: u64,
    /// Payload, once available.
    pub payload: Option<Bytes>,
}

/// What applying a remote change did to the local copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedChange {
    /// A new local document was created.
    Created,
    /// An existing document was replaced.
    Updated {
        /// Whether an unpushed local edit was overwritten.
        discarded_local_edit: bool,
    },
    /// The local document was removed.
    Deleted {
        /// Whether an unpushed local edit was overwritten.
        discarded_local_edit: bool,
    },
    /// The change was already applied.
    Unchanged,
}

impl AppliedChange {
    /// Returns true if an unpushed local edit was overwritten.
    pub fn discarded_local_edit(&self) -> bool {
        match self {
            AppliedChange::Updated {
                discarded_local_edit,
            }
            | AppliedChange::Deleted {
                discarded_local_edit,
            } => *discarded_local_edit,
            AppliedChange::Created | AppliedChange::Unchanged => false,
        }
    }
}

/// Attachment metadata change caused by a remote document change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentChange {
    /// A new attachment appeared; its payload must be downloaded.
    Created(AttachmentRef),
    /// The attachment revision changed; its payload must be downloaded.
    Updated(AttachmentRef),
    /// The document no longer references the attachment.
    Removed(AttachmentRef),
}

impl AttachmentChange {
    /// Returns the attachment concerned.
    pub fn key(&self) -> &AttachmentRef {
        match self {
            AttachmentChange::Created(key)
            | AttachmentChange::Updated(key)
            | AttachmentChange::Removed(key) => key,
        }
    }

    /// Returns true if the payload must be fetched.
    pub fn needs_download(&self) -> bool {
        !matches!(self, AttachmentChange::Removed(_))
    }
}

/// Report returned by [`LocalStore::apply_remote_change`].
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyReport {
    /// Effect on the document.
    pub applied: AppliedChange,
    /// Effect on its attachment metadata.
    pub attachments: Vec<AttachmentChange>,
}

impl ApplyReport {
    /// Creates a report with no attachment changes.
    pub fn new(applied: AppliedChange) -> Self {
        Self {
            applied,
            attachments: Vec::new(),
        }
    }
}

/// A dirty document handed to the push phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingDocument {
    /// Kind of local change.
    pub kind: ChangeKind,
    /// Document identifier.
    pub document_id: String,
    /// Document type.
    pub document_type: String,
    /// Revision the local change was based on.
    pub base_revision: Option<u64>,
    /// Current local content.
    pub content: Vec<u8>,
    /// Change counter at batch construction.
    pub change_seq: u64,
}

impl PendingDocument {
    /// Builds the wire upload for this change.
    pub fn to_upload(&self) -> DocumentUpload {
        DocumentUpload {
            kind: self.kind,
            document_id: self.document_id.clone(),
            document_type: self.document_type.clone(),
            base_revision: self.base_revision,
            content: self.content.clone(),
        }
    }
}

/// How a pushed document was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResolution {
    /// The backend stored the change under `revision`.
    Accepted {
        /// New backend revision.
        revision: u64,
    },
    /// The backend declined the change; it is not retried.
    Rejected,
    /// The change was not settled; keep it for the next run.
    Retained,
}

/// Persistence operations the engine needs.
///
/// Every method must be atomic with respect to the others. Local edits made
/// by the application while a push is in flight bump `change_seq`, which is
/// how the store tells a settled change from a newer one.
pub trait LocalStore: Send + Sync {
    /// Returns the last fully applied checkpoint.
    fn checkpoint(&self) -> StoreResult<Checkpoint>;

    /// Persists a new checkpoint. Fails if it is older than the stored one.
    fn advance_checkpoint(&self, checkpoint: Checkpoint) -> StoreResult<()>;

    /// Applies a pulled change, remote-wins.
    ///
    /// Re-applying a change that is already reflected locally must report
    /// [`AppliedChange::Unchanged`].
    fn apply_remote_change(&self, change: &RemoteChange) -> StoreResult<ApplyReport>;

    /// Marks every dirty document not already in flight as in flight and
    /// returns them.
    fn begin_push(&self) -> StoreResult<Vec<PendingDocument>>;

    /// Settles a document previously returned by [`begin_push`](Self::begin_push).
    fn complete_push(
        &self,
        document_id: &str,
        submitted_seq: u64,
        resolution: PushResolution,
    ) -> StoreResult<()>;

    /// Returns a document.
    fn document(&self, document_id: &str) -> StoreResult<Option<LocalDocument>>;

    /// Returns an attachment.
    fn attachment(&self, key: &AttachmentRef) -> StoreResult<Option<LocalAttachment>>;

    /// Returns every attachment currently in one of `states`.
    fn attachments_in(&self, states: &[AttachmentState]) -> StoreResult<Vec<AttachmentRef>>;

    /// Returns every attachment with an unpushed local payload.
    ///
    /// Attachments in [`AttachmentState::Failed`] are never retried and are
    /// left out.
    fn dirty_attachments(&self) -> StoreResult<Vec<AttachmentRef>>;

    /// Sets the transfer state of an attachment.
    fn set_attachment_state(&self, key: &AttachmentRef, state: AttachmentState) -> StoreResult<()>;

    /// Records transfer progress.
    fn set_attachment_progress(&self, key: &AttachmentRef, progress: f64) -> StoreResult<()>;

    /// Stores a downloaded payload and marks the attachment available.
    fn store_attachment_payload(
        &self,
        key: &AttachmentRef,
        payload: AttachmentPayload,
    ) -> StoreResult<()>;

    /// Settles an uploaded attachment.
    fn complete_attachment_upload(
        &self,
        key: &AttachmentRef,
        submitted_seq: u64,
        resolution: PushResolution,
    ) -> StoreResult<()>;

    /// Counts a failed transfer and returns the number of consecutive failures.
    fn record_attachment_failure(&self, key: &AttachmentRef) -> StoreResult<u32>;

    /// Returns attachments whose owning document no longer exists.
    fn orphaned_attachments(&self) -> StoreResult<Vec<AttachmentRef>>;

    /// Removes an attachment and its payload.
    fn remove_attachment(&self, key: &AttachmentRef) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discarded_local_edit_flag() {
        assert!(AppliedChange::Updated {
            discarded_local_edit: true
        }
        .discarded_local_edit());
        assert!(!AppliedChange::Created.discarded_local_edit());
        assert!(!AppliedChange::Unchanged.discarded_local_edit());
    }

    #[test]
    fn attachment_change_download_rule() {
        let key = AttachmentRef::new("doc", "photo");
        assert!(AttachmentChange::Created(key.clone()).needs_download());
        assert!(AttachmentChange::Updated(key.clone()).needs_download());
        assert!(!AttachmentChange::Removed(key.clone()).needs_download());
        assert_eq!(AttachmentChange::Removed(key.clone()).key(), &key);
    }

    #[test]
    fn pending_document_upload() {
        let pending = PendingDocument {
            kind: ChangeKind::Update,
            document_id: "doc-1".into(),
            document_type: "order".into(),
            base_revision: Some(3),
            content: b"{}".to_vec(),
            change_seq: 9,
        };
        let upload = pending.to_upload();
        assert_eq!(upload.base_revision, Some(3));
        assert_eq!(upload.document_id, "doc-1");
    }

    #[test]
    fn transferring_states() {
        assert!(AttachmentState::Downloading.is_transferring());
        assert!(AttachmentState::Uploading.is_transferring());
        assert!(!AttachmentState::Unavailable.is_transferring());
        assert_eq!(AttachmentState::Failed.to_string(), "failed");
    }
}
