//! # docsync Protocol
//!
//! Wire types and CBOR codecs shared by the docsync engine and backends.
//!
//! This crate provides:
//! - `Document` and `RemoteChange` for the pulled change stream
//! - `DocumentUpload` for pushed local changes
//! - `Checkpoint`, the cursor into the backend's change stream
//! - Attachment descriptors and transfer messages
//! - `PushOutcome`, `RejectionReason` and `ErrorCode` for per-item results
//! - CBOR encoding/decoding through [`WireMessage`]
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod attachment;
mod codec;
mod document;
mod messages;
mod outcome;

pub use attachment::{AttachmentDescriptor, AttachmentPayload, AttachmentRef, AttachmentUpload};
pub use codec::{from_cbor, to_cbor, CodecError, CodecResult, WireMessage};
pub use document::{ChangeKind, Checkpoint, Document, DocumentUpload, RemoteChange};
pub use messages::{
    AttachmentDownloadRequest, AttachmentPushResponse, PullRequest, PullResponse, PushRequest,
    PushResponse,
};
pub use outcome::{ErrorCode, PushOutcome, RejectionReason};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;
