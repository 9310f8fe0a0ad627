//! Push phase: submits collected documents one at a time.

use crate::cancel::{guarded, CancelToken};
use crate::config::SyncConfig;
use crate::error::{ErrorClassifier, ErrorKind, SyncError, SyncResult};
use crate::events::{EventKind, EventPublisher, SyncEvent};
use crate::store::{LocalStore, PendingDocument, PushResolution};
use crate::transport::SyncTransport;
use docsync_protocol::{PushOutcome, PushRequest};
use tracing::{debug, warn};

/// Counters for one push phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushSummary {
    /// Documents the backend accepted.
    pub accepted: u64,
    /// Documents the backend rejected.
    pub rejected: u64,
    /// Documents that failed and stay dirty.
    pub errored: u64,
}

/// Submits documents in batch order and settles each with the store.
///
/// Every item produces exactly one event. A `Gone` answer aborts the batch
/// without a per-item event; the rest of the batch is released untouched.
/// Any failure, a storage failure while settling included, releases the
/// current item as well so it is pushed again by the next run.
pub(crate) struct UploadDispatcher<'a, T: SyncTransport, S: LocalStore> {
    config: &'a SyncConfig,
    transport: &'a T,
    store: &'a S,
    events: &'a EventPublisher,
}

impl<'a, T: SyncTransport, S: LocalStore> UploadDispatcher<'a, T, S> {
    pub(crate) fn new(
        config: &'a SyncConfig,
        transport: &'a T,
        store: &'a S,
        events: &'a EventPublisher,
    ) -> Self {
        Self {
            config,
            transport,
            store,
            events,
        }
    }

    pub(crate) async fn dispatch(
        &self,
        documents: Vec<PendingDocument>,
        token: &CancelToken,
    ) -> SyncResult<PushSummary> {
        let mut summary = PushSummary::default();
        let timeout = self.config.document_timeout;
        let mut queue = documents.into_iter();

        while let Some(item) = queue.next() {
            if token.is_cancelled() {
                self.release(std::iter::once(item).chain(queue));
                return Err(SyncError::Cancelled);
            }

            let request = PushRequest::new(&self.config.solution, item.to_upload());
            let answer = guarded(token, timeout, self.transport.push(&request, timeout))
                .await
                .and_then(|response| {
                    if response.document_id == item.document_id {
                        Ok(response.outcome)
                    } else {
                        Err(SyncError::Protocol(format!(
                            "received verdict for {} while pushing {}",
                            response.document_id, item.document_id
                        )))
                    }
                });

            let settled = match answer {
                Ok(outcome) => self.settle(&item, outcome, &mut summary),
                Err(err) => {
                    if !matches!(err, SyncError::Gone | SyncError::Cancelled) {
                        summary.errored += 1;
                        self.publish_error(&item, &err);
                    }
                    Err(err)
                }
            };
            // An unsettled item goes back to the dirty pool with the rest.
            if let Err(err) = settled {
                self.release(std::iter::once(item).chain(queue));
                return Err(err);
            }
        }

        debug!(
            accepted = summary.accepted,
            rejected = summary.rejected,
            errored = summary.errored,
            "push phase finished"
        );
        Ok(summary)
    }

    fn settle(
        &self,
        item: &PendingDocument,
        outcome: PushOutcome,
        summary: &mut PushSummary,
    ) -> SyncResult<()> {
        let solution = &self.config.solution;
        match outcome {
            PushOutcome::Accepted { revision } => {
                self.store.complete_push(
                    &item.document_id,
                    item.change_seq,
                    PushResolution::Accepted { revision },
                )?;
                summary.accepted += 1;
                self.events.publish(SyncEvent::document(
                    EventKind::DidSynchronizeDocument,
                    solution,
                    &item.document_id,
                    &item.document_type,
                ));
            }
            PushOutcome::Rejected { reason } => {
                self.store.complete_push(
                    &item.document_id,
                    item.change_seq,
                    PushResolution::Rejected,
                )?;
                summary.rejected += 1;
                warn!(document_id = %item.document_id, kind = item.kind.as_str(), %reason, "push rejected");
                self.events.publish(SyncEvent::document_rejected(
                    solution,
                    &item.document_id,
                    &item.document_type,
                    reason,
                ));
            }
            PushOutcome::Error { code }
                if ErrorClassifier::classify_code(code) == ErrorKind::Gone =>
            {
                return Err(SyncError::Gone);
            }
            PushOutcome::Error { code } => {
                self.store.complete_push(
                    &item.document_id,
                    item.change_seq,
                    PushResolution::Retained,
                )?;
                summary.errored += 1;
                debug!(document_id = %item.document_id, %code, "push failed, kept for retry");
                self.events.publish(SyncEvent::document_error(
                    solution,
                    &item.document_id,
                    &item.document_type,
                    code,
                ));
            }
        }
        Ok(())
    }

    fn publish_error(&self, item: &PendingDocument, err: &SyncError) {
        warn!(document_id = %item.document_id, error = %err, "push aborted");
        self.events.publish(SyncEvent::document_error(
            &self.config.solution,
            &item.document_id,
            &item.document_type,
            err.error_code(),
        ));
    }

    /// Returns unsettled documents to the dirty pool.
    fn release(&self, items: impl IntoIterator<Item = PendingDocument>) {
        for item in items {
            if let Err(err) =
                self.store
                    .complete_push(&item.document_id, item.change_seq, PushResolution::Retained)
            {
                warn!(document_id = %item.document_id, error = %err, "could not release document");
            }
        }
    }
}
