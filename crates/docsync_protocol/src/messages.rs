//! Protocol messages for pull and push.

use crate::attachment::{AttachmentPayload, AttachmentRef, AttachmentUpload};
use crate::codec::WireMessage;
use crate::document::{Checkpoint, DocumentUpload, RemoteChange};
use crate::outcome::PushOutcome;
use serde::{Deserialize, Serialize};

/// Pull request from the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Solution whose documents are requested.
    pub solution: String,
    /// Last fully applied position.
    pub checkpoint: Checkpoint,
    /// Maximum number of changes in the page.
    pub limit: u32,
}

impl PullRequest {
    /// Creates a new pull request.
    pub fn new(solution: impl Into<String>, checkpoint: Checkpoint, limit: u32) -> Self {
        Self {
            solution: solution.into(),
            checkpoint,
            limit,
        }
    }
}

/// One page of the remote change stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Changes after the requested checkpoint, in stream order.
    pub changes: Vec<RemoteChange>,
    /// Checkpoint to store once every change of this page is applied.
    pub next_checkpoint: Checkpoint,
    /// Whether the backend holds further changes.
    pub has_more: bool,
}

impl PullResponse {
    /// Creates a new page.
    pub fn new(changes: Vec<RemoteChange>, next_checkpoint: Checkpoint, has_more: bool) -> Self {
        Self {
            changes,
            next_checkpoint,
            has_more,
        }
    }

    /// Creates the page returned when nothing changed.
    pub fn empty(checkpoint: Checkpoint) -> Self {
        Self::new(Vec::new(), checkpoint, false)
    }
}

/// Push request carrying a single local change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Solution the document belongs to.
    pub solution: String,
    /// The change.
    pub upload: DocumentUpload,
}

impl PushRequest {
    /// Creates a new push request.
    pub fn new(solution: impl Into<String>, upload: DocumentUpload) -> Self {
        Self {
            solution: solution.into(),
            upload,
        }
    }
}

/// Backend verdict on a pushed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    /// Document identifier.
    pub document_id: String,
    /// Verdict.
    pub outcome: PushOutcome,
}

impl PushResponse {
    /// Creates a new push response.
    pub fn new(document_id: impl Into<String>, outcome: PushOutcome) -> Self {
        Self {
            document_id: document_id.into(),
            outcome,
        }
    }
}

/// Backend verdict on an uploaded attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPushResponse {
    /// Which attachment.
    pub attachment: AttachmentRef,
    /// Verdict.
    pub outcome: PushOutcome,
}

/// Request for the current payload of one attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDownloadRequest {
    /// Solution the owning document belongs to.
    pub solution: String,
    /// Which attachment.
    pub attachment: AttachmentRef,
}

impl AttachmentDownloadRequest {
    /// Creates a new download request.
    pub fn new(solution: impl Into<String>, attachment: AttachmentRef) -> Self {
        Self {
            solution: solution.into(),
            attachment,
        }
    }
}

impl WireMessage for PullRequest {}
impl WireMessage for PullResponse {}
impl WireMessage for PushRequest {}
impl WireMessage for PushResponse {}
impl WireMessage for AttachmentDownloadRequest {}
impl WireMessage for AttachmentUpload {}
impl WireMessage for AttachmentPayload {}
impl WireMessage for AttachmentPushResponse {}
