//! # docsync Engine
//!
//! Offline-first synchronization of documents and their attachments with a
//! remote backend.
//!
//! This crate provides:
//! - Sync state machine (idle → pulling → pushing → idle, with cancelling)
//! - Checkpointed paging through the backend's change stream
//! - Per-document push verdicts reported as events
//! - Attachment transfers decoupled from document runs
//! - Error classification into retryable, terminal and fatal failures
//! - HTTP transport abstraction plus an in-process loopback client
//! - An in-memory local store
//!
//! ## Architecture
//!
//! A run pulls first, then pushes:
//! 1. Fetch remote changes page by page from the stored checkpoint
//! 2. Apply them locally; the remote version always wins
//! 3. Submit dirty local documents one at a time
//! 4. Hand attachment work to the [`AttachmentSynchronizer`], which keeps
//!    running after the run has reported its result
//!
//! ## Key Invariants
//!
//! - At most one run is active per engine
//! - The checkpoint only moves forward, and only after a page is applied
//! - Every pushed document yields exactly one verdict event
//! - A revoked token (`Gone`) fails the run without retrying
//! - Cancelling never touches attachment transfers

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod attachments;
mod cancel;
mod collector;
mod config;
mod dispatcher;
mod error;
mod events;
mod fetcher;
mod http;
mod memory;
mod state;
mod store;
#[cfg(test)]
mod testing;
mod transport;

pub use attachments::{AttachmentSynchronizer, Enqueued, TransferDirection};
pub use cancel::CancelToken;
pub use collector::CollectedChanges;
pub use config::{
    SyncConfig, DEFAULT_ATTACHMENT_TIMEOUT, DEFAULT_DOCUMENT_TIMEOUT,
    DEFAULT_MAX_ATTACHMENT_ATTEMPTS, DEFAULT_MAX_CONCURRENT_TRANSFERS, DEFAULT_PULL_PAGE_SIZE,
};
pub use dispatcher::PushSummary;
pub use error::{ErrorClassifier, ErrorKind, SyncError, SyncResult};
pub use events::{EventHandler, EventKind, EventPayload, EventPublisher, SubscriptionId, SyncEvent};
pub use fetcher::PullSummary;
pub use http::{
    ClientFailure, HttpClient, HttpRequest, HttpResponse, HttpTransport, LoopbackClient,
    LoopbackServer, DEFAULT_LOOPBACK_CHUNK, DOWNLOAD_PATH, PULL_PATH, PUSH_PATH, UPLOAD_PATH,
};
pub use memory::MemoryStore;
pub use state::{
    SyncCycleResult, SyncEngine, SyncListener, SyncOutcome, SyncResultKind, SyncState, SyncStats,
    SyncTicket,
};
pub use store::{
    AppliedChange, ApplyReport, AttachmentChange, AttachmentState, LocalAttachment, LocalDocument,
    LocalStore, PendingDocument, PushResolution, StoreError, StoreResult,
};
pub use transport::{MockTransport, ProgressFn, SyncTransport};
