//! In-memory local store.

use crate::store::{
    AppliedChange, ApplyReport, AttachmentChange, AttachmentState, LocalAttachment, LocalDocument,
    LocalStore, PendingDocument, PushResolution, StoreError, StoreResult,
};
use bytes::Bytes;
use docsync_protocol::{
    AttachmentPayload, AttachmentRef, ChangeKind, Checkpoint, Document, RejectionReason,
    RemoteChange,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};

/// A [`LocalStore`] that keeps everything in memory.
///
/// Besides the engine-facing trait it exposes the local editing API an
/// application would use: creating, updating and deleting documents and
/// attaching payloads. Every edit marks the item dirty so the next run
/// pushes it.
///
/// # Thread Safety
///
/// All operations take a single lock, so each one is atomic.
///
/// # Example
///
/// ```rust
/// use docsync_engine::MemoryStore;
///
/// let store = MemoryStore::new();
/// let id = store.create_document("order", b"{}".to_vec()).unwrap();
/// assert!(store.document_snapshot(&id).unwrap().dirty);
/// ```
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    max_content_len: Option<usize>,
}

#[derive(Debug, Default)]
struct MemoryState {
    documents: BTreeMap<String, LocalDocument>,
    attachments: BTreeMap<AttachmentRef, LocalAttachment>,
    checkpoint: Checkpoint,
    last_seq: u64,
}

impl MemoryState {
    fn next_seq(&mut self) -> u64 {
        self.last_seq += 1;
        self.last_seq
    }

    fn attachment_mut(&mut self, key: &AttachmentRef) -> StoreResult<&mut LocalAttachment> {
        self.attachments
            .get_mut(key)
            .ok_or_else(|| StoreError::AttachmentNotFound(key.clone()))
    }

    fn diff_attachments(&mut self, change: &RemoteChange) -> Vec<AttachmentChange> {
        let mut changes = Vec::new();
        for descriptor in &change.attachments {
            let key = AttachmentRef::new(&change.document_id, &descriptor.name);
            match self.attachments.get_mut(&key) {
                None => {
                    self.attachments.insert(
                        key.clone(),
                        LocalAttachment {
                            key: key.clone(),
                            content_type: descriptor.content_type.clone(),
                            revision: descriptor.revision,
                            state: AttachmentState::Pending,
                            progress: 0.0,
                            dirty: false,
                            failed_attempts: 0,
                            change_seq: 0,
                            payload: None,
                        },
                    );
                    changes.push(AttachmentChange::Created(key));
                }
                Some(local) if local.revision != descriptor.revision => {
                    local.content_type = descriptor.content_type.clone();
                    local.revision = descriptor.revision;
                    local.state = AttachmentState::Pending;
                    local.progress = 0.0;
                    local.dirty = false;
                    local.failed_attempts = 0;
                    local.payload = None;
                    changes.push(AttachmentChange::Updated(key));
                }
                Some(_) => {}
            }
        }

        let listed: HashSet<&str> = change
            .attachments
            .iter()
            .map(|descriptor| descriptor.name.as_str())
            .collect();
        let dropped: Vec<AttachmentRef> = self
            .attachments
            .values()
            .filter(|local| local.key.document_id == change.document_id)
            .filter(|local| !listed.contains(local.key.name.as_str()))
            // Local attachments the backend has never seen stay until pushed.
            .filter(|local| !(local.dirty && local.revision == 0))
            .map(|local| local.key.clone())
            .collect();
        for key in dropped {
            self.attachments.remove(&key);
            changes.push(AttachmentChange::Removed(key));
        }
        changes
    }
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuses documents whose content exceeds `len` bytes.
    ///
    /// Remote changes breaking the limit are reported as constraint
    /// violations instead of being stored.
    #[must_use]
    pub fn with_max_content_len(mut self, len: usize) -> Self {
        self.max_content_len = Some(len);
        self
    }

    fn check_content(&self, document_id: &str, content: &[u8]) -> StoreResult<()> {
        match self.max_content_len {
            Some(max) if content.len() > max => Err(StoreError::Constraint {
                document_id: document_id.to_string(),
                reason: RejectionReason::ConstraintViolation,
            }),
            _ => Ok(()),
        }
    }

    /// Creates a local document with a generated identifier.
    pub fn create_document(
        &self,
        document_type: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> StoreResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.create_document_with_id(id.clone(), document_type, content)?;
        Ok(id)
    }

    /// Creates a local document with a caller-chosen identifier.
    pub fn create_document_with_id(
        &self,
        id: impl Into<String>,
        document_type: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> StoreResult<()> {
        let id = id.into();
        let content = content.into();
        self.check_content(&id, &content)?;

        let mut state = self.state.write();
        if state.documents.contains_key(&id) {
            return Err(StoreError::Constraint {
                document_id: id,
                reason: RejectionReason::CreateConflict,
            });
        }
        let change_seq = state.next_seq();
        state.documents.insert(
            id.clone(),
            LocalDocument {
                document: Document::new(id, document_type, 0, content),
                dirty: true,
                deleted: false,
                in_flight: false,
                change_seq,
            },
        );
        Ok(())
    }

    /// Replaces the content of a local document.
    pub fn update_document(&self, id: &str, content: impl Into<Vec<u8>>) -> StoreResult<()> {
        let content = content.into();
        self.check_content(id, &content)?;

        let mut state = self.state.write();
        let change_seq = state.next_seq();
        let doc = state
            .documents
            .get_mut(id)
            .filter(|doc| !doc.deleted)
            .ok_or_else(|| StoreError::DocumentNotFound(id.to_string()))?;
        doc.document.content = content;
        doc.dirty = true;
        doc.change_seq = change_seq;
        Ok(())
    }

    /// Deletes a local document.
    ///
    /// Documents the backend has never accepted are dropped immediately;
    /// others become tombstones until the deletion is pushed.
    pub fn delete_document(&self, id: &str) -> StoreResult<()> {
        let mut state = self.state.write();
        let change_seq = state.next_seq();
        let doc = state
            .documents
            .get_mut(id)
            .filter(|doc| !doc.deleted)
            .ok_or_else(|| StoreError::DocumentNotFound(id.to_string()))?;
        if doc.is_new() && !doc.in_flight {
            state.documents.remove(id);
            return Ok(());
        }
        doc.deleted = true;
        doc.dirty = true;
        doc.change_seq = change_seq;
        Ok(())
    }

    /// Stores a local attachment payload and marks it for upload.
    pub fn put_attachment(
        &self,
        document_id: &str,
        name: impl Into<String>,
        content_type: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> StoreResult<AttachmentRef> {
        let mut state = self.state.write();
        if !state
            .documents
            .get(document_id)
            .is_some_and(|doc| !doc.deleted)
        {
            return Err(StoreError::DocumentNotFound(document_id.to_string()));
        }

        let key = AttachmentRef::new(document_id, name);
        let change_seq = state.next_seq();
        let content_type = content_type.into();
        let data = data.into();
        let entry = state
            .attachments
            .entry(key.clone())
            .or_insert_with(|| LocalAttachment {
                key: key.clone(),
                content_type: content_type.clone(),
                revision: 0,
                state: AttachmentState::Available,
                progress: 0.0,
                dirty: true,
                failed_attempts: 0,
                change_seq,
                payload: None,
            });
        entry.content_type = content_type;
        entry.state = AttachmentState::Available;
        entry.progress = 1.0;
        entry.dirty = true;
        entry.failed_attempts = 0;
        entry.change_seq = change_seq;
        entry.payload = Some(data);
        Ok(key)
    }

    /// Returns a copy of a document, including tombstones.
    pub fn document_snapshot(&self, id: &str) -> Option<LocalDocument> {
        self.state.read().documents.get(id).cloned()
    }

    /// Returns all live documents.
    pub fn documents(&self) -> Vec<LocalDocument> {
        self.state
            .read()
            .documents
            .values()
            .filter(|doc| !doc.deleted)
            .cloned()
            .collect()
    }

    /// Returns the number of live documents.
    pub fn document_count(&self) -> usize {
        self.state
            .read()
            .documents
            .values()
            .filter(|doc| !doc.deleted)
            .count()
    }

    /// Returns the number of documents waiting to be pushed.
    pub fn dirty_count(&self) -> usize {
        self.state
            .read()
            .documents
            .values()
            .filter(|doc| doc.dirty)
            .count()
    }

    /// Returns the number of tracked attachments.
    pub fn attachment_count(&self) -> usize {
        self.state.read().attachments.len()
    }

    /// Returns the stored payload of an attachment.
    pub fn attachment_payload(&self, key: &AttachmentRef) -> Option<Bytes> {
        self.state
            .read()
            .attachments
            .get(key)
            .and_then(|local| local.payload.clone())
    }
}

impl LocalStore for MemoryStore {
    fn checkpoint(&self) -> StoreResult<Checkpoint> {
        Ok(self.state.read().checkpoint)
    }

    fn advance_checkpoint(&self, checkpoint: Checkpoint) -> StoreResult<()> {
        let mut state = self.state.write();
        if checkpoint < state.checkpoint {
            return Err(StoreError::CheckpointRegression {
                current: state.checkpoint,
                proposed: checkpoint,
            });
        }
        state.checkpoint = checkpoint;
        Ok(())
    }

    fn apply_remote_change(&self, change: &RemoteChange) -> StoreResult<ApplyReport> {
        if change.kind != ChangeKind::Delete {
            self.check_content(&change.document_id, &change.content)?;
        }

        let mut state = self.state.write();
        if change.kind == ChangeKind::Delete {
            return Ok(match state.documents.remove(&change.document_id) {
                Some(local) => ApplyReport::new(AppliedChange::Deleted {
                    discarded_local_edit: local.dirty,
                }),
                None => ApplyReport::new(AppliedChange::Unchanged),
            });
        }

        // Only a newer revision wins over the local copy, so replayed
        // changes leave unpushed edits alone.
        let applied = match state.documents.get(&change.document_id) {
            Some(local) if local.document.revision >= change.revision => {
                return Ok(ApplyReport::new(AppliedChange::Unchanged));
            }
            Some(local) => AppliedChange::Updated {
                discarded_local_edit: local.dirty,
            },
            None => AppliedChange::Created,
        };

        let change_seq = state.next_seq();
        let document = Document {
            id: change.document_id.clone(),
            document_type: change.document_type.clone(),
            revision: change.revision,
            content: change.content.clone(),
            attachments: change.attachments.clone(),
        };
        state.documents.insert(
            change.document_id.clone(),
            LocalDocument {
                document,
                dirty: false,
                deleted: false,
                in_flight: false,
                change_seq,
            },
        );
        let attachments = state.diff_attachments(change);
        Ok(ApplyReport {
            applied,
            attachments,
        })
    }

    fn begin_push(&self) -> StoreResult<Vec<PendingDocument>> {
        let mut state = self.state.write();

        // Tombstones of documents the backend never saw have nothing to push.
        state
            .documents
            .retain(|_, doc| !(doc.deleted && doc.is_new() && !doc.in_flight));

        let mut batch: Vec<PendingDocument> = state
            .documents
            .values_mut()
            .filter(|doc| doc.dirty && !doc.in_flight)
            .map(|doc| {
                doc.in_flight = true;
                let kind = if doc.deleted {
                    ChangeKind::Delete
                } else if doc.is_new() {
                    ChangeKind::Create
                } else {
                    ChangeKind::Update
                };
                PendingDocument {
                    kind,
                    document_id: doc.document.id.clone(),
                    document_type: doc.document.document_type.clone(),
                    base_revision: (!doc.is_new()).then_some(doc.document.revision),
                    content: if doc.deleted {
                        Vec::new()
                    } else {
                        doc.document.content.clone()
                    },
                    change_seq: doc.change_seq,
                }
            })
            .collect();
        batch.sort_by(|a, b| {
            a.change_seq
                .cmp(&b.change_seq)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        Ok(batch)
    }

    fn complete_push(
        &self,
        document_id: &str,
        submitted_seq: u64,
        resolution: PushResolution,
    ) -> StoreResult<()> {
        let mut state = self.state.write();
        let Some(doc) = state.documents.get_mut(document_id) else {
            return Ok(());
        };
        doc.in_flight = false;
        let settled = doc.change_seq == submitted_seq;

        let remove = match resolution {
            PushResolution::Accepted { revision } => {
                doc.document.revision = doc.document.revision.max(revision);
                if settled {
                    doc.dirty = false;
                }
                settled && doc.deleted
            }
            PushResolution::Rejected => {
                if settled {
                    doc.dirty = false;
                    if doc.deleted {
                        doc.deleted = false;
                    }
                }
                false
            }
            PushResolution::Retained => false,
        };
        if remove {
            state.documents.remove(document_id);
        }
        Ok(())
    }

    fn document(&self, document_id: &str) -> StoreResult<Option<LocalDocument>> {
        Ok(self.document_snapshot(document_id))
    }

    fn attachment(&self, key: &AttachmentRef) -> StoreResult<Option<LocalAttachment>> {
        Ok(self.state.read().attachments.get(key).cloned())
    }

    fn attachments_in(&self, states: &[AttachmentState]) -> StoreResult<Vec<AttachmentRef>> {
        Ok(self
            .state
            .read()
            .attachments
            .values()
            .filter(|local| states.contains(&local.state))
            .map(|local| local.key.clone())
            .collect())
    }

    fn dirty_attachments(&self) -> StoreResult<Vec<AttachmentRef>> {
        let state = self.state.read();
        let mut dirty: Vec<&LocalAttachment> = state
            .attachments
            .values()
            .filter(|local| local.dirty && local.state != AttachmentState::Failed)
            .collect();
        dirty.sort_by(|a, b| a.change_seq.cmp(&b.change_seq).then_with(|| a.key.cmp(&b.key)));
        Ok(dirty.into_iter().map(|local| local.key.clone()).collect())
    }

    fn set_attachment_state(&self, key: &AttachmentRef, state: AttachmentState) -> StoreResult<()> {
        let mut guard = self.state.write();
        let local = guard.attachment_mut(key)?;
        local.state = state;
        if state.is_transferring() {
            local.progress = 0.0;
        }
        Ok(())
    }

    fn set_attachment_progress(&self, key: &AttachmentRef, progress: f64) -> StoreResult<()> {
        let mut state = self.state.write();
        state.attachment_mut(key)?.progress = progress.clamp(0.0, 1.0);
        Ok(())
    }

    fn store_attachment_payload(
        &self,
        key: &AttachmentRef,
        payload: AttachmentPayload,
    ) -> StoreResult<()> {
        let mut state = self.state.write();
        let local = state.attachment_mut(key)?;
        local.content_type = payload.content_type;
        local.revision = payload.revision;
        local.payload = Some(Bytes::from(payload.data));
        local.state = AttachmentState::Available;
        local.progress = 1.0;
        local.failed_attempts = 0;
        Ok(())
    }

    fn complete_attachment_upload(
        &self,
        key: &AttachmentRef,
        submitted_seq: u64,
        resolution: PushResolution,
    ) -> StoreResult<()> {
        let mut state = self.state.write();
        let Some(local) = state.attachments.get_mut(key) else {
            return Ok(());
        };
        let settled = local.change_seq == submitted_seq;
        match resolution {
            PushResolution::Accepted { revision } => {
                local.revision = local.revision.max(revision);
                local.failed_attempts = 0;
                if settled {
                    local.dirty = false;
                }
            }
            PushResolution::Rejected => {
                if settled {
                    local.dirty = false;
                }
            }
            PushResolution::Retained => {}
        }
        Ok(())
    }

    fn record_attachment_failure(&self, key: &AttachmentRef) -> StoreResult<u32> {
        let mut state = self.state.write();
        let local = state.attachment_mut(key)?;
        local.failed_attempts += 1;
        Ok(local.failed_attempts)
    }

    fn orphaned_attachments(&self) -> StoreResult<Vec<AttachmentRef>> {
        let state = self.state.read();
        Ok(state
            .attachments
            .keys()
            .filter(|key| !state.documents.contains_key(&key.document_id))
            .cloned()
            .collect())
    }

    fn remove_attachment(&self, key: &AttachmentRef) -> StoreResult<()> {
        self.state.write().attachments.remove(key);
        Ok(())
    }
}
