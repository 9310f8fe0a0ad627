//! Named synchronization events and their publisher.
//!
//! Every event carries a payload with the solution, the document and,
//! where relevant, the attachment name, rejection reason, error code or
//! transfer progress. Subscribers are called synchronously in publish
//! order.

use docsync_protocol::{AttachmentRef, ErrorCode, RejectionReason};
use parking_lot::{ReentrantMutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The kinds of event the engine publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A pulled change created a local document.
    DidCreateDocument,
    /// A pulled change replaced a local document.
    DidUpdateDocument,
    /// A pulled change removed a local document.
    DidDeleteDocument,
    /// A pushed document was accepted.
    DidSynchronizeDocument,
    /// A pushed or pulled document was rejected.
    DidRejectDocument,
    /// A pushed document failed and stays dirty.
    DocumentError,
    /// A pulled document introduced an attachment.
    DidCreateAttachment,
    /// A pulled document changed an attachment revision.
    DidUpdateAttachment,
    /// An attachment was dropped locally.
    DidDeleteAttachment,
    /// An attachment download is starting.
    WillDownloadAttachment,
    /// An attachment payload is stored locally.
    AttachmentDidBecomeAvailable,
    /// An attachment transfer failed and will be retried.
    AttachmentDidBecomeUnavailable,
    /// An attachment transfer failed permanently.
    AttachmentDidFail,
    /// Transfer progress.
    AttachmentDidProgress,
    /// An uploaded attachment was accepted.
    DidSynchronizeAttachment,
    /// An uploaded attachment was rejected.
    DidRejectAttachment,
    /// An attachment upload failed and stays dirty.
    AttachmentError,
}

impl EventKind {
    /// Every event kind.
    pub const ALL: [EventKind; 17] = [
        EventKind::DidCreateDocument,
        EventKind::DidUpdateDocument,
        EventKind::DidDeleteDocument,
        EventKind::DidSynchronizeDocument,
        EventKind::DidRejectDocument,
        EventKind::DocumentError,
        EventKind::DidCreateAttachment,
        EventKind::DidUpdateAttachment,
        EventKind::DidDeleteAttachment,
        EventKind::WillDownloadAttachment,
        EventKind::AttachmentDidBecomeAvailable,
        EventKind::AttachmentDidBecomeUnavailable,
        EventKind::AttachmentDidFail,
        EventKind::AttachmentDidProgress,
        EventKind::DidSynchronizeAttachment,
        EventKind::DidRejectAttachment,
        EventKind::AttachmentError,
    ];

    /// Returns the published event name.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::DidCreateDocument => "DidCreateDocument",
            EventKind::DidUpdateDocument => "DidUpdateDocument",
            EventKind::DidDeleteDocument => "DidDeleteDocument",
            EventKind::DidSynchronizeDocument => "DidSynchronizeDocument",
            EventKind::DidRejectDocument => "DidRejectDocument",
            EventKind::DocumentError => "DocumentError",
            EventKind::DidCreateAttachment => "DidCreateAttachment",
            EventKind::DidUpdateAttachment => "DidUpdateAttachment",
            EventKind::DidDeleteAttachment => "DidDeleteAttachment",
            EventKind::WillDownloadAttachment => "WillDownloadAttachment",
            EventKind::AttachmentDidBecomeAvailable => "AttachmentDidBecomeAvailable",
            EventKind::AttachmentDidBecomeUnavailable => "AttachmentDidBecomeUnavailable",
            EventKind::AttachmentDidFail => "AttachmentDidFail",
            EventKind::AttachmentDidProgress => "AttachmentDidProgress",
            EventKind::DidSynchronizeAttachment => "DidSynchronizeAttachment",
            EventKind::DidRejectAttachment => "DidRejectAttachment",
            EventKind::AttachmentError => "AttachmentError",
        }
    }

    /// Looks an event kind up by name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }

    /// Returns true for attachment events.
    pub fn is_attachment_event(&self) -> bool {
        matches!(
            self,
            EventKind::DidCreateAttachment
                | EventKind::DidUpdateAttachment
                | EventKind::DidDeleteAttachment
                | EventKind::WillDownloadAttachment
                | EventKind::AttachmentDidBecomeAvailable
                | EventKind::AttachmentDidBecomeUnavailable
                | EventKind::AttachmentDidFail
                | EventKind::AttachmentDidProgress
                | EventKind::DidSynchronizeAttachment
                | EventKind::DidRejectAttachment
                | EventKind::AttachmentError
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Event payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    /// Solution.
    pub solution: String,
    /// Document identifier.
    pub document_id: String,
    /// Document type, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    /// Attachment name, for attachment events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment_name: Option<String>,
    /// Rejection reason, for rejection events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<RejectionReason>,
    /// Error code, for error events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    /// Transfer progress in `0.0..=1.0`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
}

impl EventPayload {
    fn new(solution: &str, document_id: &str) -> Self {
        Self {
            solution: solution.to_string(),
            document_id: document_id.to_string(),
            document_type: None,
            attachment_name: None,
            rejection_reason: None,
            error_code: None,
            progress: None,
        }
    }

    /// Returns the attachment this payload refers to, if any.
    pub fn attachment(&self) -> Option<AttachmentRef> {
        self.attachment_name
            .as_ref()
            .map(|name| AttachmentRef::new(&self.document_id, name))
    }
}

/// A published event.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncEvent {
    /// What happened.
    pub kind: EventKind,
    /// Details.
    pub payload: EventPayload,
}

impl SyncEvent {
    /// Creates a document event.
    pub fn document(kind: EventKind, solution: &str, document_id: &str, document_type: &str) -> Self {
        let mut payload = EventPayload::new(solution, document_id);
        payload.document_type = Some(document_type.to_string());
        Self { kind, payload }
    }

    /// Creates a `DidRejectDocument` event.
    pub fn document_rejected(
        solution: &str,
        document_id: &str,
        document_type: &str,
        reason: RejectionReason,
    ) -> Self {
        let mut event = Self::document(EventKind::DidRejectDocument, solution, document_id, document_type);
        event.payload.rejection_reason = Some(reason);
        event
    }

    /// Creates a `DocumentError` event.
    pub fn document_error(
        solution: &str,
        document_id: &str,
        document_type: &str,
        code: ErrorCode,
    ) -> Self {
        let mut event = Self::document(EventKind::DocumentError, solution, document_id, document_type);
        event.payload.error_code = Some(code);
        event
    }

    /// Creates an attachment event.
    pub fn attachment(kind: EventKind, solution: &str, key: &AttachmentRef) -> Self {
        let mut payload = EventPayload::new(solution, &key.document_id);
        payload.attachment_name = Some(key.name.clone());
        Self { kind, payload }
    }

    /// Creates an `AttachmentDidProgress` event.
    pub fn attachment_progress(solution: &str, key: &AttachmentRef, progress: f64) -> Self {
        let mut event = Self::attachment(EventKind::AttachmentDidProgress, solution, key);
        event.payload.progress = Some(progress);
        event
    }

    /// Creates a `DidRejectAttachment` event.
    pub fn attachment_rejected(solution: &str, key: &AttachmentRef, reason: RejectionReason) -> Self {
        let mut event = Self::attachment(EventKind::DidRejectAttachment, solution, key);
        event.payload.rejection_reason = Some(reason);
        event
    }

    /// Creates an attachment failure event with an error code.
    pub fn attachment_failure(
        kind: EventKind,
        solution: &str,
        key: &AttachmentRef,
        code: ErrorCode,
    ) -> Self {
        let mut event = Self::attachment(kind, solution, key);
        event.payload.error_code = Some(code);
        event
    }

    /// Returns the event name.
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }
}

/// Identifies a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// An event handler.
pub type EventHandler = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    filter: Option<EventKind>,
    handler: EventHandler,
}

struct PublisherInner {
    subscriptions: RwLock<Vec<Subscription>>,
    // Serializes delivery so handlers observe events in publish order.
    // Reentrant so a handler may publish.
    dispatch: ReentrantMutex<()>,
    next_id: AtomicU64,
}

/// Fans events out to subscribers.
///
/// Handlers run on the publishing task and must not block. Cloning the
/// publisher shares the subscriber list.
#[derive(Clone)]
pub struct EventPublisher {
    inner: Arc<PublisherInner>,
}

impl EventPublisher {
    /// Creates a publisher without subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                subscriptions: RwLock::new(Vec::new()),
                dispatch: ReentrantMutex::new(()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    fn add(&self, filter: Option<EventKind>, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.subscriptions.write().push(Subscription {
            id,
            filter,
            handler,
        });
        id
    }

    /// Subscribes to one event kind.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.add(Some(kind), Arc::new(handler))
    }

    /// Subscribes to every event.
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.add(None, Arc::new(handler))
    }

    /// Removes a subscription. Returns false if it did not exist.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.inner.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|sub| sub.id != id);
        subscriptions.len() != before
    }

    /// Removes every subscription.
    pub fn clear(&self) {
        self.inner.subscriptions.write().clear();
    }

    /// Returns the number of subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    /// Delivers an event to every matching subscriber.
    pub fn publish(&self, event: SyncEvent) {
        let _ordered = self.inner.dispatch.lock();
        let handlers: Vec<EventHandler> = self
            .inner
            .subscriptions
            .read()
            .iter()
            .filter(|sub| sub.filter.map_or(true, |kind| kind == event.kind))
            .map(|sub| Arc::clone(&sub.handler))
            .collect();

        tracing::trace!(
            event = event.name(),
            document_id = %event.payload.document_id,
            subscribers = handlers.len(),
            "publishing event"
        );
        for handler in handlers {
            handler(&event);
        }
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder() -> (Arc<Mutex<Vec<SyncEvent>>>, impl Fn(&SyncEvent) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |event: &SyncEvent| sink.lock().push(event.clone()))
    }

    #[test]
    fn names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(EventKind::from_name("Nope"), None);
    }

    #[test]
    fn subscribers_receive_matching_events_in_order() {
        let publisher = EventPublisher::new();
        let (created, handler) = recorder();
        publisher.subscribe(EventKind::DidCreateDocument, handler);
        let (all, handler) = recorder();
        publisher.subscribe_all(handler);

        publisher.publish(SyncEvent::document(EventKind::DidCreateDocument, "s", "a", "order"));
        publisher.publish(SyncEvent::document(EventKind::DidDeleteDocument, "s", "b", "order"));
        publisher.publish(SyncEvent::document(EventKind::DidCreateDocument, "s", "c", "order"));

        let created: Vec<String> = created
            .lock()
            .iter()
            .map(|e| e.payload.document_id.clone())
            .collect();
        assert_eq!(created, vec!["a", "c"]);
        assert_eq!(all.lock().len(), 3);
        assert_eq!(all.lock()[1].kind, EventKind::DidDeleteDocument);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let publisher = EventPublisher::new();
        let (seen, handler) = recorder();
        let id = publisher.subscribe_all(handler);
        assert!(publisher.unsubscribe(id));
        assert!(!publisher.unsubscribe(id));

        publisher.publish(SyncEvent::document(EventKind::DidUpdateDocument, "s", "a", "order"));
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn handler_may_publish() {
        let publisher = EventPublisher::new();
        let (seen, handler) = recorder();
        publisher.subscribe(EventKind::DidSynchronizeDocument, handler);
        let inner = publisher.clone();
        publisher.subscribe(EventKind::DidCreateDocument, move |event| {
            inner.publish(SyncEvent::document(
                EventKind::DidSynchronizeDocument,
                &event.payload.solution,
                &event.payload.document_id,
                "order",
            ));
        });

        publisher.publish(SyncEvent::document(EventKind::DidCreateDocument, "s", "a", "order"));
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn payload_serializes_only_present_fields() {
        let event = SyncEvent::attachment_rejected(
            "crm",
            &AttachmentRef::new("doc-1", "photo"),
            RejectionReason::LargeAttachment,
        );
        let json = serde_json::to_value(&event.payload).unwrap();
        assert_eq!(json["solution"], "crm");
        assert_eq!(json["documentId"], "doc-1");
        assert_eq!(json["attachmentName"], "photo");
        assert_eq!(json["rejectionReason"], "LargeAttachment");
        assert!(json.get("errorCode").is_none());
        assert!(json.get("progress").is_none());
    }

    #[test]
    fn error_payload_carries_code() {
        let event = SyncEvent::document_error("crm", "doc-1", "order", ErrorCode::UNAVAILABLE);
        assert_eq!(event.payload.error_code, Some(ErrorCode::UNAVAILABLE));
        let json = serde_json::to_value(&event.payload).unwrap();
        assert_eq!(json["errorCode"], 503);
    }
}
