//! Backend document store and change log.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use docsync_protocol::{
    AttachmentDescriptor, AttachmentPayload, AttachmentRef, AttachmentUpload, ChangeKind,
    Checkpoint, Document, DocumentUpload, PullResponse, PushOutcome, RejectionReason,
    RemoteChange,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// An entry of the change log.
#[derive(Debug, Clone)]
struct LoggedChange {
    sequence: u64,
    change: RemoteChange,
}

#[derive(Debug, Default)]
struct Solution {
    documents: HashMap<String, Document>,
    blobs: HashMap<AttachmentRef, AttachmentPayload>,
    log: Vec<LoggedChange>,
    next_sequence: u64,
}

impl Solution {
    fn record(&mut self, change: RemoteChange) {
        self.next_sequence += 1;
        self.log.push(LoggedChange {
            sequence: self.next_sequence,
            change,
        });
    }

    /// Logs the current version of a live document.
    fn record_document(&mut self, created: bool, id: &str) {
        if let Some(doc) = self.documents.get(id).cloned() {
            let change = if created {
                RemoteChange::create(doc)
            } else {
                RemoteChange::update(doc)
            };
            self.record(change);
        }
    }

    fn remove_document(&mut self, id: &str) -> Option<Document> {
        let doc = self.documents.remove(id)?;
        self.blobs.retain(|key, _| key.document_id != id);
        let revision = doc.revision + 1;
        self.record(RemoteChange::delete(id, &doc.document_type, revision));
        Some(doc)
    }
}

/// Per-solution documents, attachment payloads and the ordered change log.
///
/// Every accepted mutation appends one change. Checkpoints handed to clients
/// are log sequence numbers, so they increase strictly.
pub struct ChangeLog {
    solutions: RwLock<HashMap<String, Solution>>,
}

impl ChangeLog {
    /// Creates an empty change log.
    pub fn new() -> Self {
        Self {
            solutions: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the latest checkpoint of `solution`.
    pub fn checkpoint(&self, solution: &str) -> Checkpoint {
        self.solutions
            .read()
            .get(solution)
            .map_or(Checkpoint::ORIGIN, |s| Checkpoint::new(s.next_sequence))
    }

    /// Returns the number of logged changes.
    pub fn len(&self, solution: &str) -> usize {
        self.solutions.read().get(solution).map_or(0, |s| s.log.len())
    }

    /// Returns true if nothing was logged for `solution`.
    pub fn is_empty(&self, solution: &str) -> bool {
        self.len(solution) == 0
    }

    /// Returns the current version of a document.
    pub fn document(&self, solution: &str, id: &str) -> Option<Document> {
        self.solutions
            .read()
            .get(solution)
            .and_then(|s| s.documents.get(id).cloned())
    }

    /// Returns the number of live documents.
    pub fn document_count(&self, solution: &str) -> usize {
        self.solutions.read().get(solution).map_or(0, |s| s.documents.len())
    }

    /// Returns up to `limit` changes after `checkpoint`.
    pub fn changes_since(&self, solution: &str, checkpoint: Checkpoint, limit: u32) -> PullResponse {
        let solutions = self.solutions.read();
        let Some(log) = solutions.get(solution).map(|s| &s.log) else {
            return PullResponse::empty(checkpoint);
        };

        let mut pending = log
            .iter()
            .filter(|entry| entry.sequence > checkpoint.position());
        let page: Vec<&LoggedChange> = pending.by_ref().take(limit as usize).collect();
        let has_more = pending.next().is_some();
        let next = page
            .last()
            .map_or(checkpoint, |entry| Checkpoint::new(entry.sequence));

        PullResponse::new(
            page.into_iter().map(|entry| entry.change.clone()).collect(),
            next,
            has_more,
        )
    }

    /// Applies a pushed document change.
    pub fn apply_upload(
        &self,
        solution: &str,
        upload: &DocumentUpload,
        config: &ServerConfig,
    ) -> PushOutcome {
        if config.is_restricted(&upload.document_type) {
            return rejected(RejectionReason::TypeRestricted);
        }
        if upload.payload_size() > config.max_content_len {
            return rejected(RejectionReason::ConstraintViolation);
        }

        let mut solutions = self.solutions.write();
        let state = solutions.entry(solution.to_string()).or_default();
        let current = state.documents.get(&upload.document_id).map(|d| d.revision);

        let outcome = match (upload.kind, current) {
            (ChangeKind::Create, Some(_)) => rejected(RejectionReason::CreateConflict),
            (ChangeKind::Create, None) => {
                let doc = Document::new(
                    &upload.document_id,
                    &upload.document_type,
                    1,
                    upload.content.clone(),
                );
                state.documents.insert(upload.document_id.clone(), doc);
                state.record_document(true, &upload.document_id);
                PushOutcome::Accepted { revision: 1 }
            }
            (ChangeKind::Update, None) => rejected(RejectionReason::UpdateConflict),
            (ChangeKind::Update, Some(revision)) if upload.base_revision != Some(revision) => {
                rejected(RejectionReason::UpdateConflict)
            }
            (ChangeKind::Update, Some(revision)) => {
                if let Some(doc) = state.documents.get_mut(&upload.document_id) {
                    doc.revision = revision + 1;
                    doc.content = upload.content.clone();
                }
                state.record_document(false, &upload.document_id);
                PushOutcome::Accepted {
                    revision: revision + 1,
                }
            }
            // Deleting what is already gone succeeds.
            (ChangeKind::Delete, None) => PushOutcome::Accepted {
                revision: upload.base_revision.unwrap_or_default(),
            },
            (ChangeKind::Delete, Some(revision)) if upload.base_revision != Some(revision) => {
                rejected(RejectionReason::UpdateConflict)
            }
            (ChangeKind::Delete, Some(revision)) => {
                state.remove_document(&upload.document_id);
                PushOutcome::Accepted {
                    revision: revision + 1,
                }
            }
        };
        debug!(
            solution,
            document_id = %upload.document_id,
            kind = upload.kind.as_str(),
            ?outcome,
            "push handled"
        );
        outcome
    }

    /// Applies a pushed attachment payload.
    ///
    /// An accepted payload bumps the owning document's revision so other
    /// devices learn about it from the change stream.
    pub fn apply_attachment_upload(&self, upload: &AttachmentUpload, config: &ServerConfig) -> PushOutcome {
        if upload.data.len() > config.max_attachment_len {
            return rejected(RejectionReason::LargeAttachment);
        }

        let mut solutions = self.solutions.write();
        let state = solutions.entry(upload.solution.clone()).or_default();
        let key = &upload.attachment;
        let Some(doc) = state.documents.get_mut(&key.document_id) else {
            return rejected(RejectionReason::ConstraintViolation);
        };
        if config.is_restricted(&doc.document_type) {
            return rejected(RejectionReason::TypeRestricted);
        }

        let current = doc
            .attachments
            .iter()
            .position(|a| a.name == key.name);
        let current_revision = current.map(|i| doc.attachments[i].revision);
        if current_revision != upload.base_revision {
            return rejected(RejectionReason::UpdateConflict);
        }

        let revision = current_revision.unwrap_or_default() + 1;
        let descriptor = AttachmentDescriptor::new(
            &key.name,
            &upload.content_type,
            revision,
            upload.data.len() as u64,
        );
        match current {
            Some(i) => doc.attachments[i] = descriptor,
            None => doc.attachments.push(descriptor),
        }
        doc.revision += 1;

        state.blobs.insert(
            key.clone(),
            AttachmentPayload {
                content_type: upload.content_type.clone(),
                revision,
                data: upload.data.clone(),
            },
        );
        state.record_document(false, &key.document_id);
        debug!(attachment = %key, revision, "attachment stored");
        PushOutcome::Accepted { revision }
    }

    /// Returns the stored payload of an attachment.
    pub fn attachment(&self, solution: &str, key: &AttachmentRef) -> Option<AttachmentPayload> {
        self.solutions
            .read()
            .get(solution)
            .and_then(|s| s.blobs.get(key).cloned())
    }

    /// Creates or replaces a document on behalf of another client.
    ///
    /// Returns the new revision.
    pub fn put_document(
        &self,
        solution: &str,
        id: &str,
        document_type: &str,
        content: Vec<u8>,
    ) -> u64 {
        let mut solutions = self.solutions.write();
        let state = solutions.entry(solution.to_string()).or_default();
        match state.documents.get_mut(id) {
            Some(doc) => {
                doc.revision += 1;
                doc.document_type = document_type.to_string();
                doc.content = content;
                let revision = doc.revision;
                state.record_document(false, id);
                revision
            }
            None => {
                state
                    .documents
                    .insert(id.to_string(), Document::new(id, document_type, 1, content));
                state.record_document(true, id);
                1
            }
        }
    }

    /// Deletes a document on behalf of another client.
    pub fn delete_document(&self, solution: &str, id: &str) -> bool {
        self.solutions
            .write()
            .get_mut(solution)
            .and_then(|s| s.remove_document(id))
            .is_some()
    }

    /// Attaches a payload to a document on behalf of another client.
    ///
    /// Returns the attachment revision.
    pub fn put_attachment(
        &self,
        solution: &str,
        document_id: &str,
        name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> ServerResult<u64> {
        let mut solutions = self.solutions.write();
        let state = solutions
            .get_mut(solution)
            .ok_or_else(|| ServerError::NotFound(format!("solution {solution}")))?;
        let doc = state
            .documents
            .get_mut(document_id)
            .ok_or_else(|| ServerError::NotFound(format!("document {document_id}")))?;

        let revision = doc
            .attachments
            .iter()
            .find(|a| a.name == name)
            .map_or(1, |a| a.revision + 1);
        let descriptor = AttachmentDescriptor::new(name, content_type, revision, data.len() as u64);
        doc.attachments.retain(|a| a.name != name);
        doc.attachments.push(descriptor);
        doc.revision += 1;

        state.blobs.insert(
            AttachmentRef::new(document_id, name),
            AttachmentPayload {
                content_type: content_type.to_string(),
                revision,
                data,
            },
        );
        state.record_document(false, document_id);
        Ok(revision)
    }
}

impl Default for ChangeLog {
    fn default() -> Self {
        Self::new()
    }
}

fn rejected(reason: RejectionReason) -> PushOutcome {
    PushOutcome::Rejected { reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(kind: ChangeKind, id: &str, base: Option<u64>) -> DocumentUpload {
        DocumentUpload {
            kind,
            document_id: id.to_string(),
            document_type: "order".to_string(),
            base_revision: base,
            content: b"body".to_vec(),
        }
    }

    fn attachment(doc: &str, base: Option<u64>, len: usize) -> AttachmentUpload {
        AttachmentUpload {
            solution: "crm".to_string(),
            attachment: AttachmentRef::new(doc, "photo"),
            content_type: "image/png".to_string(),
            base_revision: base,
            data: vec![7; len],
        }
    }

    #[test]
    fn empty_log() {
        let log = ChangeLog::new();
        assert_eq!(log.checkpoint("crm"), Checkpoint::ORIGIN);
        assert!(log.is_empty("crm"));
        let page = log.changes_since("crm", Checkpoint::ORIGIN, 10);
        assert!(page.changes.is_empty());
        assert!(!page.has_more);
    }

    #[test]
    fn paging_through_changes() {
        let log = ChangeLog::new();
        for i in 0..5 {
            log.put_document("crm", &format!("d{i}"), "order", vec![]);
        }

        let first = log.changes_since("crm", Checkpoint::ORIGIN, 2);
        assert_eq!(first.changes.len(), 2);
        assert!(first.has_more);
        assert_eq!(first.next_checkpoint, Checkpoint::new(2));

        let second = log.changes_since("crm", first.next_checkpoint, 2);
        assert!(second.has_more);
        let last = log.changes_since("crm", second.next_checkpoint, 2);
        assert_eq!(last.changes.len(), 1);
        assert!(!last.has_more);
        assert_eq!(last.next_checkpoint, log.checkpoint("crm"));

        let idle = log.changes_since("crm", last.next_checkpoint, 2);
        assert!(idle.changes.is_empty());
        assert_eq!(idle.next_checkpoint, last.next_checkpoint);
    }

    #[test]
    fn solutions_are_isolated() {
        let log = ChangeLog::new();
        log.put_document("crm", "a", "order", vec![]);
        assert!(log.changes_since("hr", Checkpoint::ORIGIN, 10).changes.is_empty());
        assert!(log.document("hr", "a").is_none());
    }

    #[test]
    fn create_then_conflicting_create() {
        let log = ChangeLog::new();
        let config = ServerConfig::default();
        assert_eq!(
            log.apply_upload("crm", &upload(ChangeKind::Create, "a", None), &config),
            PushOutcome::Accepted { revision: 1 }
        );
        assert_eq!(
            log.apply_upload("crm", &upload(ChangeKind::Create, "a", None), &config),
            rejected(RejectionReason::CreateConflict)
        );
        assert_eq!(log.len("crm"), 1);
    }

    #[test]
    fn stale_update_is_a_conflict() {
        let log = ChangeLog::new();
        let config = ServerConfig::default();
        log.put_document("crm", "a", "order", vec![]);
        log.put_document("crm", "a", "order", vec![1]);

        assert_eq!(
            log.apply_upload("crm", &upload(ChangeKind::Update, "a", Some(1)), &config),
            rejected(RejectionReason::UpdateConflict)
        );
        assert_eq!(
            log.apply_upload("crm", &upload(ChangeKind::Update, "a", Some(2)), &config),
            PushOutcome::Accepted { revision: 3 }
        );
        assert_eq!(log.document("crm", "a").unwrap().content, b"body");
    }

    #[test]
    fn limits_and_restrictions() {
        let log = ChangeLog::new();
        let config = ServerConfig::new()
            .with_restricted_type("order")
            .with_max_content_len(2);
        assert_eq!(
            log.apply_upload("crm", &upload(ChangeKind::Create, "a", None), &config),
            rejected(RejectionReason::TypeRestricted)
        );

        let config = ServerConfig::new().with_max_content_len(2);
        assert_eq!(
            log.apply_upload("crm", &upload(ChangeKind::Create, "a", None), &config),
            rejected(RejectionReason::ConstraintViolation)
        );
        assert!(log.is_empty("crm"));
    }

    #[test]
    fn delete_logs_a_tombstone() {
        let log = ChangeLog::new();
        let config = ServerConfig::default();
        log.put_document("crm", "a", "order", vec![]);

        assert_eq!(
            log.apply_upload("crm", &upload(ChangeKind::Delete, "a", Some(1)), &config),
            PushOutcome::Accepted { revision: 2 }
        );
        assert!(log.document("crm", "a").is_none());
        let page = log.changes_since("crm", Checkpoint::new(1), 10);
        assert_eq!(page.changes[0].kind, ChangeKind::Delete);

        // Repeating the delete is harmless.
        assert!(matches!(
            log.apply_upload("crm", &upload(ChangeKind::Delete, "a", Some(1)), &config),
            PushOutcome::Accepted { .. }
        ));
    }

    #[test]
    fn attachment_upload_bumps_document() {
        let log = ChangeLog::new();
        let config = ServerConfig::default();
        log.put_document("crm", "a", "order", vec![]);

        assert_eq!(
            log.apply_attachment_upload(&attachment("a", None, 3), &config),
            PushOutcome::Accepted { revision: 1 }
        );
        let doc = log.document("crm", "a").unwrap();
        assert_eq!(doc.revision, 2);
        assert_eq!(doc.attachments[0].length, 3);
        assert_eq!(
            log.attachment("crm", &AttachmentRef::new("a", "photo")).unwrap().data,
            vec![7; 3]
        );

        assert_eq!(
            log.apply_attachment_upload(&attachment("a", None, 3), &config),
            rejected(RejectionReason::UpdateConflict)
        );
        assert_eq!(
            log.apply_attachment_upload(&attachment("a", Some(1), 4), &config),
            PushOutcome::Accepted { revision: 2 }
        );
    }

    #[test]
    fn attachment_limits() {
        let log = ChangeLog::new();
        log.put_document("crm", "a", "order", vec![]);
        let config = ServerConfig::new().with_max_attachment_len(2);
        assert_eq!(
            log.apply_attachment_upload(&attachment("a", None, 3), &config),
            rejected(RejectionReason::LargeAttachment)
        );
        assert_eq!(
            log.apply_attachment_upload(&attachment("missing", None, 1), &ServerConfig::default()),
            rejected(RejectionReason::ConstraintViolation)
        );
    }

    #[test]
    fn deleting_a_document_drops_its_blobs() {
        let log = ChangeLog::new();
        log.put_document("crm", "a", "order", vec![]);
        log.put_attachment("crm", "a", "photo", "image/png", vec![1]).unwrap();
        assert!(log.delete_document("crm", "a"));
        assert!(log.attachment("crm", &AttachmentRef::new("a", "photo")).is_none());
        assert!(!log.delete_document("crm", "a"));
        assert!(log.put_attachment("crm", "a", "photo", "image/png", vec![]).is_err());
    }
}
