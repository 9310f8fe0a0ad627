//! Collects dirty local items for the push phase.

use crate::error::SyncResult;
use crate::store::{LocalStore, PendingDocument};
use docsync_protocol::AttachmentRef;

/// Everything the push phase has to submit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedChanges {
    /// Dirty documents, ordered by local change sequence then identifier.
    pub documents: Vec<PendingDocument>,
    /// Attachments with unpushed payloads.
    pub attachments: Vec<AttachmentRef>,
}

impl CollectedChanges {
    /// Returns true if nothing needs pushing.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty() && self.attachments.is_empty()
    }
}

pub(crate) struct LocalChangeCollector<'a, S: LocalStore> {
    store: &'a S,
}

impl<'a, S: LocalStore> LocalChangeCollector<'a, S> {
    pub(crate) fn new(store: &'a S) -> Self {
        Self { store }
    }

    /// Marks dirty documents in flight and returns them with dirty attachments.
    ///
    /// Marking happens inside the store call, so an edit racing with
    /// collection is either part of this batch or left for the next one.
    /// It is the last fallible step: once documents are in flight the
    /// dispatcher owns releasing them.
    pub(crate) fn collect(&self) -> SyncResult<CollectedChanges> {
        let attachments = self.store.dirty_attachments()?;
        let mut documents = self.store.begin_push()?;
        documents.sort_by(|a, b| {
            a.change_seq
                .cmp(&b.change_seq)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        tracing::debug!(
            documents = documents.len(),
            attachments = attachments.len(),
            "collected local changes"
        );
        Ok(CollectedChanges {
            documents,
            attachments,
        })
    }
}
