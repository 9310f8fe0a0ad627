//! Request handlers for sync endpoints.

use crate::auth::{AuthConfig, TokenValidator};
use crate::changelog::ChangeLog;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use docsync_protocol::{
    AttachmentDownloadRequest, AttachmentPayload, AttachmentPushResponse, AttachmentUpload,
    ErrorCode, PullRequest, PullResponse, PushOutcome, PushRequest, PushResponse, WireMessage,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// Route for pulling changes.
pub const PULL_ROUTE: &str = "/sync/pull";
/// Route for pushing one document change.
pub const PUSH_ROUTE: &str = "/sync/push";
/// Route for fetching an attachment payload.
pub const DOWNLOAD_ROUTE: &str = "/sync/attachments/download";
/// Route for submitting an attachment payload.
pub const UPLOAD_ROUTE: &str = "/sync/attachments/upload";

/// A handled request: status code and CBOR body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP status.
    pub status: u16,
    /// Encoded body, empty on errors.
    pub body: Vec<u8>,
}

impl Response {
    fn ok(body: Vec<u8>) -> Self {
        Self { status: 200, body }
    }

    fn error(err: &ServerError) -> Self {
        Self {
            status: err.status_code(),
            body: Vec::new(),
        }
    }
}

/// Context for request handling.
pub struct HandlerContext {
    /// Server configuration.
    pub config: ServerConfig,
    /// Backend state (shared across all handlers).
    pub log: Arc<ChangeLog>,
    tokens: Option<TokenValidator>,
    injected: Mutex<VecDeque<ErrorCode>>,
}

impl HandlerContext {
    /// Creates a new handler context.
    pub fn new(config: ServerConfig, log: Arc<ChangeLog>) -> Self {
        let tokens = config
            .auth_secret
            .clone()
            .filter(|_| config.require_auth)
            .map(|secret| TokenValidator::new(AuthConfig::new(secret)));
        Self {
            config,
            log,
            tokens,
            injected: Mutex::new(VecDeque::new()),
        }
    }

    /// Returns the token validator when authentication is enabled.
    pub fn tokens(&self) -> Option<&TokenValidator> {
        self.tokens.as_ref()
    }

    /// Makes the next pushes answer with `code` instead of being applied.
    pub fn inject_push_error(&self, code: ErrorCode) {
        self.injected.lock().push_back(code);
    }

    fn take_injected(&self) -> Option<ErrorCode> {
        self.injected.lock().pop_front()
    }
}

/// Handler for sync requests.
pub struct RequestHandler {
    context: Arc<HandlerContext>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(context: Arc<HandlerContext>) -> Self {
        Self { context }
    }

    /// Routes a POST to its handler.
    pub fn route(&self, path: &str, access_token: Option<&str>, body: &[u8]) -> Response {
        let result = self.authenticate(access_token).and_then(|()| match path {
            PULL_ROUTE => self.handle_pull(&PullRequest::decode(body)?)?.encode().map_err(Into::into),
            PUSH_ROUTE => self.handle_push(&PushRequest::decode(body)?)?.encode().map_err(Into::into),
            DOWNLOAD_ROUTE => self
                .handle_download(&AttachmentDownloadRequest::decode(body)?)?
                .encode()
                .map_err(Into::into),
            UPLOAD_ROUTE => self
                .handle_upload(&AttachmentUpload::decode(body)?)?
                .encode()
                .map_err(Into::into),
            other => Err(ServerError::NoRoute(other.to_string())),
        });

        match result {
            Ok(body) => Response::ok(body),
            Err(err) => {
                if err.is_server_error() {
                    warn!(path, error = %err, "request failed");
                } else {
                    debug!(path, error = %err, "request refused");
                }
                Response::error(&err)
            }
        }
    }

    fn authenticate(&self, access_token: Option<&str>) -> ServerResult<()> {
        let Some(tokens) = self.context.tokens() else {
            return Ok(());
        };
        let token = access_token.ok_or(ServerError::MissingToken)?;
        tokens.validate_token(token).map(|_| ())
    }

    /// Handles a pull request.
    pub fn handle_pull(&self, request: &PullRequest) -> ServerResult<PullResponse> {
        if request.solution.is_empty() {
            return Err(ServerError::InvalidRequest("missing solution".into()));
        }
        let limit = request.limit.clamp(1, self.context.config.max_pull_page);
        Ok(self
            .context
            .log
            .changes_since(&request.solution, request.checkpoint, limit))
    }

    /// Handles a push request.
    pub fn handle_push(&self, request: &PushRequest) -> ServerResult<PushResponse> {
        let document_id = &request.upload.document_id;
        if document_id.is_empty() {
            return Err(ServerError::InvalidRequest("missing document id".into()));
        }
        let outcome = match self.context.take_injected() {
            Some(code) => PushOutcome::Error { code },
            None => self
                .context
                .log
                .apply_upload(&request.solution, &request.upload, &self.context.config),
        };
        Ok(PushResponse::new(document_id, outcome))
    }

    /// Handles an attachment download.
    pub fn handle_download(
        &self,
        request: &AttachmentDownloadRequest,
    ) -> ServerResult<AttachmentPayload> {
        self.context
            .log
            .attachment(&request.solution, &request.attachment)
            .ok_or_else(|| ServerError::NotFound(request.attachment.to_string()))
    }

    /// Handles an attachment upload.
    pub fn handle_upload(&self, upload: &AttachmentUpload) -> ServerResult<AttachmentPushResponse> {
        let outcome = self.context.log.apply_attachment_upload(upload, &self.context.config);
        Ok(AttachmentPushResponse {
            attachment: upload.attachment.clone(),
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docsync_protocol::{AttachmentRef, ChangeKind, Checkpoint, DocumentUpload, RejectionReason};

    fn create_handler(config: ServerConfig) -> (RequestHandler, Arc<HandlerContext>) {
        let context = Arc::new(HandlerContext::new(config, Arc::new(ChangeLog::new())));
        (RequestHandler::new(Arc::clone(&context)), context)
    }

    fn push(id: &str) -> PushRequest {
        PushRequest::new(
            "crm",
            DocumentUpload {
                kind: ChangeKind::Create,
                document_id: id.to_string(),
                document_type: "order".to_string(),
                base_revision: None,
                content: vec![1],
            },
        )
    }

    #[test]
    fn pull_empty() {
        let (handler, _) = create_handler(ServerConfig::default());
        let body = PullRequest::new("crm", Checkpoint::ORIGIN, 10).encode().unwrap();

        let response = handler.route(PULL_ROUTE, None, &body);
        assert_eq!(response.status, 200);
        let page = PullResponse::decode(&response.body).unwrap();
        assert!(page.changes.is_empty());
        assert!(!page.has_more);
    }

    #[test]
    fn push_and_pull() {
        let (handler, _) = create_handler(ServerConfig::default());
        let response = handler.route(PUSH_ROUTE, None, &push("a").encode().unwrap());
        let verdict = PushResponse::decode(&response.body).unwrap();
        assert_eq!(verdict.outcome, PushOutcome::Accepted { revision: 1 });

        let page = handler
            .handle_pull(&PullRequest::new("crm", Checkpoint::ORIGIN, 10))
            .unwrap();
        assert_eq!(page.changes.len(), 1);
        assert_eq!(page.changes[0].document_id, "a");
    }

    #[test]
    fn page_size_is_capped() {
        let (handler, context) = create_handler(ServerConfig::new().with_max_pull_page(2));
        for i in 0..5 {
            context.log.put_document("crm", &format!("d{i}"), "order", vec![]);
        }
        let page = handler
            .handle_pull(&PullRequest::new("crm", Checkpoint::ORIGIN, 100))
            .unwrap();
        assert_eq!(page.changes.len(), 2);
        assert!(page.has_more);
    }

    #[test]
    fn restricted_type_is_rejected() {
        let (handler, _) = create_handler(ServerConfig::new().with_restricted_type("order"));
        let verdict = handler.handle_push(&push("a")).unwrap();
        assert_eq!(
            verdict.outcome,
            PushOutcome::Rejected {
                reason: RejectionReason::TypeRestricted
            }
        );
    }

    #[test]
    fn injected_errors_are_consumed_in_order() {
        let (handler, context) = create_handler(ServerConfig::default());
        context.inject_push_error(ErrorCode::UNAVAILABLE);

        let first = handler.handle_push(&push("a")).unwrap();
        assert_eq!(
            first.outcome,
            PushOutcome::Error {
                code: ErrorCode::UNAVAILABLE
            }
        );
        assert!(handler.handle_push(&push("a")).unwrap().outcome.is_accepted());
    }

    #[test]
    fn download_round_trip() {
        let (handler, context) = create_handler(ServerConfig::default());
        context.log.put_document("crm", "a", "order", vec![]);
        context
            .log
            .put_attachment("crm", "a", "photo", "image/png", vec![1, 2])
            .unwrap();

        let request = AttachmentDownloadRequest::new("crm", AttachmentRef::new("a", "photo"));
        let response = handler.route(DOWNLOAD_ROUTE, None, &request.encode().unwrap());
        assert_eq!(response.status, 200);
        assert_eq!(AttachmentPayload::decode(&response.body).unwrap().data, vec![1, 2]);

        let missing = AttachmentDownloadRequest::new("crm", AttachmentRef::new("a", "nope"));
        assert_eq!(
            handler.route(DOWNLOAD_ROUTE, None, &missing.encode().unwrap()).status,
            404
        );
    }

    #[test]
    fn malformed_and_unknown_requests() {
        let (handler, _) = create_handler(ServerConfig::default());
        assert_eq!(handler.route(PULL_ROUTE, None, b"\xff\x00").status, 400);
        assert_eq!(handler.route("/sync/nope", None, &[]).status, 404);
    }

    #[test]
    fn authentication() {
        let (handler, context) = create_handler(ServerConfig::new().with_auth(b"secret".to_vec()));
        let body = PullRequest::new("crm", Checkpoint::ORIGIN, 10).encode().unwrap();
        assert_eq!(handler.route(PULL_ROUTE, None, &body).status, 401);
        assert_eq!(handler.route(PULL_ROUTE, Some("00ff"), &body).status, 410);

        let tokens = context.tokens().unwrap();
        let token = tokens.create_token([3u8; 16]).unwrap();
        assert_eq!(handler.route(PULL_ROUTE, Some(&token), &body).status, 200);

        tokens.revoke([3u8; 16]);
        assert_eq!(handler.route(PULL_ROUTE, Some(&token), &body).status, 410);
    }
}
