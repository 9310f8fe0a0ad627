//! # docsync Server
//!
//! Reference backend for the docsync engine.
//!
//! This crate provides:
//! - POST endpoints for pull, push, attachment download and upload
//! - A per-solution document store with an ordered change log
//! - Revision-checked pushes with typed rejection reasons
//! - Authentication (HMAC-SHA256 tokens with device revocation)
//!
//! # Authentication
//!
//! Authentication is optional:
//!
//! ```rust
//! use docsync_server::{ServerConfig, SyncServer};
//!
//! let server = SyncServer::new(ServerConfig::default().with_auth(b"secret".to_vec()));
//! let token = server.issue_token([7u8; 16]).unwrap();
//!
//! // A revoked device receives `410 Gone` on every request.
//! server.revoke_token(&token).unwrap();
//! ```
//!
//! # Protocol
//!
//! Clients pull first, then push:
//! 1. Pull pages of changes after their checkpoint
//! 2. Push each local document change with its base revision
//! 3. Transfer attachment payloads independently of documents

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod changelog;
mod config;
mod error;
mod handler;
mod server;

pub use auth::{AuthConfig, TokenValidator};
pub use changelog::ChangeLog;
pub use config::{
    ServerConfig, DEFAULT_MAX_ATTACHMENT_LEN, DEFAULT_MAX_CONTENT_LEN, DEFAULT_MAX_PULL_PAGE,
};
pub use error::{ServerError, ServerResult};
pub use handler::{
    HandlerContext, RequestHandler, Response, DOWNLOAD_ROUTE, PULL_ROUTE, PUSH_ROUTE, UPLOAD_ROUTE,
};
pub use server::SyncServer;
