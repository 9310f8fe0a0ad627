//! Server configuration.

use std::collections::HashSet;

/// Default maximum number of changes per pull page.
pub const DEFAULT_MAX_PULL_PAGE: u32 = 500;

/// Default maximum document content size in bytes.
pub const DEFAULT_MAX_CONTENT_LEN: usize = 1024 * 1024;

/// Default maximum attachment size in bytes.
pub const DEFAULT_MAX_ATTACHMENT_LEN: usize = 16 * 1024 * 1024;

/// Configuration for the reference backend.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upper bound on the page size a client may request.
    pub max_pull_page: u32,
    /// Largest document content accepted on push.
    pub max_content_len: usize,
    /// Largest attachment payload accepted on upload.
    pub max_attachment_len: usize,
    /// Document types clients may not create or modify.
    pub restricted_types: HashSet<String>,
    /// Whether to require an access token.
    pub require_auth: bool,
    /// Secret key for token signing (if auth enabled).
    pub auth_secret: Option<Vec<u8>>,
}

impl ServerConfig {
    /// Creates a configuration with default limits and no authentication.
    pub fn new() -> Self {
        Self {
            max_pull_page: DEFAULT_MAX_PULL_PAGE,
            max_content_len: DEFAULT_MAX_CONTENT_LEN,
            max_attachment_len: DEFAULT_MAX_ATTACHMENT_LEN,
            restricted_types: HashSet::new(),
            require_auth: false,
            auth_secret: None,
        }
    }

    /// Sets the maximum pull page size.
    pub fn with_max_pull_page(mut self, size: u32) -> Self {
        self.max_pull_page = size.max(1);
        self
    }

    /// Sets the maximum document content size.
    pub fn with_max_content_len(mut self, len: usize) -> Self {
        self.max_content_len = len;
        self
    }

    /// Sets the maximum attachment size.
    pub fn with_max_attachment_len(mut self, len: usize) -> Self {
        self.max_attachment_len = len;
        self
    }

    /// Marks a document type as read-only for clients.
    pub fn with_restricted_type(mut self, document_type: impl Into<String>) -> Self {
        self.restricted_types.insert(document_type.into());
        self
    }

    /// Enables authentication with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.require_auth = true;
        self.auth_secret = Some(secret);
        self
    }

    /// Returns true if clients may not push documents of this type.
    pub fn is_restricted(&self, document_type: &str) -> bool {
        self.restricted_types.contains(document_type)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_pull_page, DEFAULT_MAX_PULL_PAGE);
        assert!(!config.require_auth);
        assert!(!config.is_restricted("order"));
    }

    #[test]
    fn config_builder() {
        let config = ServerConfig::new()
            .with_max_pull_page(0)
            .with_max_attachment_len(10)
            .with_restricted_type("invoice")
            .with_auth(vec![1, 2, 3, 4]);

        assert_eq!(config.max_pull_page, 1);
        assert_eq!(config.max_attachment_len, 10);
        assert!(config.is_restricted("invoice"));
        assert!(config.require_auth);
        assert_eq!(config.auth_secret, Some(vec![1, 2, 3, 4]));
    }
}
