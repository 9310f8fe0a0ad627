//! Pull phase: fetches remote changes page by page and applies them.

use crate::attachments::AttachmentSynchronizer;
use crate::cancel::{guarded, CancelToken};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{EventKind, EventPublisher, SyncEvent};
use crate::store::{AppliedChange, AttachmentChange, LocalStore, StoreError};
use crate::transport::SyncTransport;
use docsync_protocol::{PullRequest, RemoteChange};
use tracing::{debug, warn};

/// Counters for one pull phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullSummary {
    /// Pages fetched.
    pub pages: u64,
    /// Changes that altered local state.
    pub applied: u64,
    /// Local edits overwritten by remote changes.
    pub discarded_local_edits: u64,
    /// Changes the local store refused.
    pub rejected: u64,
    /// Attachment downloads requested.
    pub downloads_requested: u64,
}

/// Fetches remote changes from the checkpoint onwards.
///
/// The checkpoint is advanced only after every change of a page has been
/// applied, so a failure part-way through a page leaves the page to be
/// fetched again. Re-applying changes is harmless because the store
/// recognizes them as unchanged.
pub(crate) struct RemoteChangeFetcher<'a, T: SyncTransport + 'static, S: LocalStore + 'static> {
    config: &'a SyncConfig,
    transport: &'a T,
    store: &'a S,
    events: &'a EventPublisher,
    attachments: &'a AttachmentSynchronizer<T, S>,
}

impl<'a, T: SyncTransport + 'static, S: LocalStore + 'static> RemoteChangeFetcher<'a, T, S> {
    pub(crate) fn new(
        config: &'a SyncConfig,
        transport: &'a T,
        store: &'a S,
        events: &'a EventPublisher,
        attachments: &'a AttachmentSynchronizer<T, S>,
    ) -> Self {
        Self {
            config,
            transport,
            store,
            events,
            attachments,
        }
    }

    /// Pulls until the backend reports no further changes.
    pub(crate) async fn fetch(&self, token: &CancelToken) -> SyncResult<PullSummary> {
        let mut summary = PullSummary::default();
        let timeout = self.config.document_timeout;

        loop {
            if token.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let checkpoint = self.store.checkpoint()?;
            let request = PullRequest::new(
                &self.config.solution,
                checkpoint,
                self.config.pull_page_size,
            );
            let page = guarded(token, timeout, self.transport.pull(&request, timeout)).await?;

            if page.next_checkpoint < checkpoint {
                return Err(SyncError::Protocol(format!(
                    "checkpoint moved backwards from {checkpoint} to {}",
                    page.next_checkpoint
                )));
            }
            debug!(
                %checkpoint,
                next = %page.next_checkpoint,
                changes = page.changes.len(),
                has_more = page.has_more,
                "pulled page"
            );

            for change in &page.changes {
                self.apply(change, &mut summary)?;
            }
            self.store.advance_checkpoint(page.next_checkpoint)?;
            summary.pages += 1;

            if !page.has_more {
                return Ok(summary);
            }
            if page.changes.is_empty() && page.next_checkpoint == checkpoint {
                return Err(SyncError::Protocol(
                    "backend reported more changes without advancing".into(),
                ));
            }
        }
    }

    fn apply(&self, change: &RemoteChange, summary: &mut PullSummary) -> SyncResult<()> {
        let solution = &self.config.solution;
        let report = match self.store.apply_remote_change(change) {
            Ok(report) => report,
            Err(StoreError::Constraint { reason, .. }) => {
                warn!(document_id = %change.document_id, %reason, "pulled change refused locally");
                summary.rejected += 1;
                self.events.publish(SyncEvent::document_rejected(
                    solution,
                    &change.document_id,
                    &change.document_type,
                    reason,
                ));
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let kind = match report.applied {
            AppliedChange::Created => EventKind::DidCreateDocument,
            AppliedChange::Updated { .. } => EventKind::DidUpdateDocument,
            AppliedChange::Deleted { .. } => EventKind::DidDeleteDocument,
            AppliedChange::Unchanged => return Ok(()),
        };
        if report.applied.discarded_local_edit() {
            warn!(document_id = %change.document_id, "remote change overwrote unpushed local edit");
            summary.discarded_local_edits += 1;
        }
        summary.applied += 1;
        self.events.publish(SyncEvent::document(
            kind,
            solution,
            &change.document_id,
            &change.document_type,
        ));

        for attachment in report.attachments {
            let kind = match &attachment {
                AttachmentChange::Created(_) => EventKind::DidCreateAttachment,
                AttachmentChange::Updated(_) => EventKind::DidUpdateAttachment,
                AttachmentChange::Removed(_) => EventKind::DidDeleteAttachment,
            };
            self.events
                .publish(SyncEvent::attachment(kind, solution, attachment.key()));
            if attachment.needs_download() {
                summary.downloads_requested += 1;
                if let Err(err) = self.attachments.download(attachment.key().clone()) {
                    debug!(attachment = %attachment.key(), error = %err, "download not queued");
                }
            }
        }
        Ok(())
    }
}
