//! Documents and the changes that move them between device and backend.

use crate::attachment::AttachmentDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Cursor into the backend's remote change stream.
///
/// The engine treats the value as opaque apart from its ordering: a
/// checkpoint only ever moves forward.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Checkpoint(u64);

impl Checkpoint {
    /// The position before any change has been applied.
    pub const ORIGIN: Checkpoint = Checkpoint(0);

    /// Creates a checkpoint at the given stream position.
    pub fn new(position: u64) -> Self {
        Self(position)
    }

    /// Returns the stream position.
    pub fn position(&self) -> u64 {
        self.0
    }

    /// Returns true if no change has been applied yet.
    pub fn is_origin(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of change carried by a remote change or a local upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// The document did not exist before.
    Create,
    /// The document content was replaced.
    Update,
    /// The document was removed.
    Delete,
}

impl ChangeKind {
    /// Returns a short lowercase label.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

/// A business document as known by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Document identifier.
    pub id: String,
    /// Type tag.
    pub document_type: String,
    /// Backend-assigned revision. Zero means never accepted.
    pub revision: u64,
    /// Content payload.
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
    /// Attachments referenced by this document.
    #[serde(default)]
    pub attachments: Vec<AttachmentDescriptor>,
}

impl Document {
    /// Creates a document without attachments.
    pub fn new(
        id: impl Into<String>,
        document_type: impl Into<String>,
        revision: u64,
        content: Vec<u8>,
    ) -> Self {
        Self {
            id: id.into(),
            document_type: document_type.into(),
            revision,
            content,
            attachments: Vec::new(),
        }
    }

    /// Adds an attachment descriptor.
    pub fn with_attachment(mut self, descriptor: AttachmentDescriptor) -> Self {
        self.attachments.push(descriptor);
        self
    }
}

/// One entry of the backend's change stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChange {
    /// What happened to the document.
    pub kind: ChangeKind,
    /// Document identifier.
    pub document_id: String,
    /// Type tag.
    pub document_type: String,
    /// Revision after this change.
    pub revision: u64,
    /// New content. Empty for deletions.
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
    /// Attachments referenced after this change.
    #[serde(default)]
    pub attachments: Vec<AttachmentDescriptor>,
}

impl RemoteChange {
    /// Creates a change announcing a new document.
    pub fn create(document: Document) -> Self {
        Self::from_document(ChangeKind::Create, document)
    }

    /// Creates a change replacing an existing document.
    pub fn update(document: Document) -> Self {
        Self::from_document(ChangeKind::Update, document)
    }

    /// Creates a deletion change.
    pub fn delete(
        document_id: impl Into<String>,
        document_type: impl Into<String>,
        revision: u64,
    ) -> Self {
        Self {
            kind: ChangeKind::Delete,
            document_id: document_id.into(),
            document_type: document_type.into(),
            revision,
            content: Vec::new(),
            attachments: Vec::new(),
        }
    }

    fn from_document(kind: ChangeKind, document: Document) -> Self {
        Self {
            kind,
            document_id: document.id,
            document_type: document.document_type,
            revision: document.revision,
            content: document.content,
            attachments: document.attachments,
        }
    }

    /// Returns the document carried by a create or update.
    pub fn document(&self) -> Option<Document> {
        match self.kind {
            ChangeKind::Delete => None,
            ChangeKind::Create | ChangeKind::Update => Some(Document {
                id: self.document_id.clone(),
                document_type: self.document_type.clone(),
                revision: self.revision,
                content: self.content.clone(),
                attachments: self.attachments.clone(),
            }),
        }
    }
}

/// A local change submitted to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentUpload {
    /// What the device did to the document.
    pub kind: ChangeKind,
    /// Document identifier.
    pub document_id: String,
    /// Type tag.
    pub document_type: String,
    /// Revision the local edit was based on; `None` for new documents.
    pub base_revision: Option<u64>,
    /// Content payload. Empty for deletions.
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
}

impl DocumentUpload {
    /// Returns the size of the payload in bytes.
    pub fn payload_size(&self) -> usize {
        self.content.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn checkpoint_ordering() {
        assert!(Checkpoint::ORIGIN.is_origin());
        assert!(Checkpoint::new(3) > Checkpoint::new(2));
        assert_eq!(Checkpoint::new(7).position(), 7);
        assert_eq!(Checkpoint::new(7).to_string(), "#7");
    }

    #[test]
    fn delete_change_has_no_document() {
        let change = RemoteChange::delete("doc-1", "order", 4);
        assert_eq!(change.kind, ChangeKind::Delete);
        assert!(change.document().is_none());
        assert!(change.content.is_empty());
    }

    #[test]
    fn update_change_carries_document() {
        let doc = Document::new("doc-1", "order", 2, b"{}".to_vec())
            .with_attachment(AttachmentDescriptor::new("photo", "image/png", 1, 10));
        let change = RemoteChange::update(doc.clone());
        assert_eq!(change.document(), Some(doc));
    }

    proptest! {
        #[test]
        fn checkpoint_order_follows_position(a in any::<u64>(), b in any::<u64>()) {
            prop_assert_eq!(Checkpoint::new(a) < Checkpoint::new(b), a < b);
        }
    }
}
