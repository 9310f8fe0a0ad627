//! Attachment descriptors and transfer messages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Metadata for an attachment referenced by a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    /// Attachment name, unique within its document.
    pub name: String,
    /// MIME type of the payload.
    pub content_type: String,
    /// Backend-assigned revision of the payload.
    pub revision: u64,
    /// Payload length in bytes.
    pub length: u64,
}

impl AttachmentDescriptor {
    /// Creates a new descriptor.
    pub fn new(
        name: impl Into<String>,
        content_type: impl Into<String>,
        revision: u64,
        length: u64,
    ) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            revision,
            length,
        }
    }
}

/// Identifies one attachment: owning document plus attachment name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Owning document identifier.
    pub document_id: String,
    /// Attachment name.
    pub name: String,
}

impl AttachmentRef {
    /// Creates a new reference.
    pub fn new(document_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for AttachmentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.document_id, self.name)
    }
}

/// A downloaded attachment payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    /// MIME type.
    pub content_type: String,
    /// Revision of the payload.
    pub revision: u64,
    /// Raw bytes.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// A local attachment submitted to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentUpload {
    /// Solution the owning document belongs to.
    pub solution: String,
    /// Which attachment is being uploaded.
    pub attachment: AttachmentRef,
    /// MIME type.
    pub content_type: String,
    /// Revision the local payload replaced; `None` for new attachments.
    pub base_revision: Option<u64>,
    /// Raw bytes.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attachment_ref_display() {
        let key = AttachmentRef::new("doc-7", "signature.png");
        assert_eq!(key.to_string(), "doc-7/signature.png");
    }

    #[test]
    fn attachment_refs_order_by_document_then_name() {
        let mut keys = vec![
            AttachmentRef::new("b", "a"),
            AttachmentRef::new("a", "z"),
            AttachmentRef::new("a", "b"),
        ];
        keys.sort();
        assert_eq!(keys[0], AttachmentRef::new("a", "b"));
        assert_eq!(keys[2], AttachmentRef::new("b", "a"));
    }
}
