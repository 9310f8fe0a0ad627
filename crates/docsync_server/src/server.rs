//! Main sync server.

use crate::changelog::ChangeLog;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::{HandlerContext, RequestHandler, Response};
use docsync_protocol::{Checkpoint, Document, ErrorCode};
use std::sync::Arc;
use tracing::info;

/// The reference sync backend.
///
/// Requests arrive as `(path, access token, CBOR body)` triples and are
/// answered with a status code and a CBOR body, so the server can sit
/// behind any HTTP front end or be called in-process.
///
/// # Example
///
/// ```
/// use docsync_server::{ServerConfig, SyncServer};
///
/// let server = SyncServer::new(ServerConfig::default());
/// server.put_document("crm", "order-1", "order", b"{}".to_vec());
/// assert_eq!(server.document_count("crm"), 1);
/// ```
pub struct SyncServer {
    handler: RequestHandler,
    context: Arc<HandlerContext>,
}

impl SyncServer {
    /// Creates a new sync server.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_log(config, Arc::new(ChangeLog::new()))
    }

    /// Creates a sync server over an existing change log.
    pub fn with_log(config: ServerConfig, log: Arc<ChangeLog>) -> Self {
        let context = Arc::new(HandlerContext::new(config, log));
        let handler = RequestHandler::new(Arc::clone(&context));
        Self { handler, context }
    }

    /// Handles one POST request.
    pub fn handle_request(&self, path: &str, access_token: Option<&str>, body: &[u8]) -> Response {
        self.handler.route(path, access_token, body)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.context.config
    }

    /// Returns the change log.
    pub fn log(&self) -> &Arc<ChangeLog> {
        &self.context.log
    }

    /// Issues an access token for a device.
    pub fn issue_token(&self, device_id: [u8; 16]) -> ServerResult<String> {
        self.validator()?.create_token(device_id)
    }

    /// Revokes every token of a device.
    ///
    /// Clients holding one get `410 Gone` from then on.
    pub fn revoke_device(&self, device_id: [u8; 16]) -> ServerResult<()> {
        self.validator()?.revoke(device_id);
        info!(device = %hex::encode(device_id), "device revoked");
        Ok(())
    }

    /// Revokes the device that `token` was issued to.
    pub fn revoke_token(&self, token: &str) -> ServerResult<()> {
        let device_id = self.validator()?.validate_token(token)?;
        self.revoke_device(device_id)
    }

    /// Makes the next push answer with a per-item error.
    pub fn inject_push_error(&self, code: ErrorCode) {
        self.context.inject_push_error(code);
    }

    /// Creates or replaces a document as another client would.
    pub fn put_document(&self, solution: &str, id: &str, document_type: &str, content: Vec<u8>) -> u64 {
        self.context.log.put_document(solution, id, document_type, content)
    }

    /// Deletes a document as another client would.
    pub fn delete_document(&self, solution: &str, id: &str) -> bool {
        self.context.log.delete_document(solution, id)
    }

    /// Attaches a payload to a document as another client would.
    pub fn put_attachment(
        &self,
        solution: &str,
        document_id: &str,
        name: &str,
        content_type: &str,
        data: Vec<u8>,
    ) -> ServerResult<u64> {
        self.context
            .log
            .put_attachment(solution, document_id, name, content_type, data)
    }

    /// Returns the current version of a document.
    pub fn document(&self, solution: &str, id: &str) -> Option<Document> {
        self.context.log.document(solution, id)
    }

    /// Returns the number of live documents.
    pub fn document_count(&self, solution: &str) -> usize {
        self.context.log.document_count(solution)
    }

    /// Returns the latest checkpoint of `solution`.
    pub fn checkpoint(&self, solution: &str) -> Checkpoint {
        self.context.log.checkpoint(solution)
    }

    fn validator(&self) -> ServerResult<&crate::auth::TokenValidator> {
        self.context
            .tokens()
            .ok_or_else(|| ServerError::InvalidRequest("authentication is disabled".into()))
    }
}
