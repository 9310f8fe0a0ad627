//! Configuration for the sync engine.

use std::time::Duration;

/// Default timeout for document pull and push requests.
pub const DEFAULT_DOCUMENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout for attachment transfers.
pub const DEFAULT_ATTACHMENT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default number of changes requested per pull page.
pub const DEFAULT_PULL_PAGE_SIZE: u32 = 100;

/// Default number of attachment transfers running at once.
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 4;

/// Default number of failed transfers before an attachment is marked failed.
pub const DEFAULT_MAX_ATTACHMENT_ATTEMPTS: u32 = 3;

/// Configuration for sync operations.
///
/// The configuration is fixed once the engine is built.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Solution (application namespace) whose documents are synchronized.
    pub solution: String,
    /// Maximum number of changes per pull page.
    pub pull_page_size: u32,
    /// Timeout for document requests.
    pub document_timeout: Duration,
    /// Timeout for attachment transfers.
    pub attachment_timeout: Duration,
    /// Size of the attachment worker pool.
    pub max_concurrent_transfers: usize,
    /// Failed transfers tolerated before an attachment is marked failed.
    pub max_attachment_attempts: u32,
}

impl SyncConfig {
    /// Creates a new sync configuration with default limits.
    pub fn new(solution: impl Into<String>) -> Self {
        Self {
            solution: solution.into(),
            pull_page_size: DEFAULT_PULL_PAGE_SIZE,
            document_timeout: DEFAULT_DOCUMENT_TIMEOUT,
            attachment_timeout: DEFAULT_ATTACHMENT_TIMEOUT,
            max_concurrent_transfers: DEFAULT_MAX_CONCURRENT_TRANSFERS,
            max_attachment_attempts: DEFAULT_MAX_ATTACHMENT_ATTEMPTS,
        }
    }

    /// Sets the pull page size.
    pub fn with_pull_page_size(mut self, size: u32) -> Self {
        self.pull_page_size = size.max(1);
        self
    }

    /// Sets the document request timeout.
    pub fn with_document_timeout(mut self, timeout: Duration) -> Self {
        self.document_timeout = timeout;
        self
    }

    /// Sets the attachment transfer timeout.
    pub fn with_attachment_timeout(mut self, timeout: Duration) -> Self {
        self.attachment_timeout = timeout;
        self
    }

    /// Sets the size of the attachment worker pool.
    pub fn with_max_concurrent_transfers(mut self, transfers: usize) -> Self {
        self.max_concurrent_transfers = transfers.max(1);
        self
    }

    /// Sets how many failed transfers are tolerated per attachment.
    pub fn with_max_attachment_attempts(mut self, attempts: u32) -> Self {
        self.max_attachment_attempts = attempts.max(1);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_declared_constants() {
        let config = SyncConfig::new("field-service");
        assert_eq!(config.solution, "field-service");
        assert_eq!(config.document_timeout, DEFAULT_DOCUMENT_TIMEOUT);
        assert_eq!(config.attachment_timeout, DEFAULT_ATTACHMENT_TIMEOUT);
        assert_eq!(config.pull_page_size, DEFAULT_PULL_PAGE_SIZE);
    }

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("crm")
            .with_pull_page_size(25)
            .with_document_timeout(Duration::from_secs(5))
            .with_attachment_timeout(Duration::from_secs(50))
            .with_max_concurrent_transfers(2)
            .with_max_attachment_attempts(5);

        assert_eq!(config.pull_page_size, 25);
        assert_eq!(config.document_timeout, Duration::from_secs(5));
        assert_eq!(config.attachment_timeout, Duration::from_secs(50));
        assert_eq!(config.max_concurrent_transfers, 2);
        assert_eq!(config.max_attachment_attempts, 5);
    }

    #[test]
    fn zero_limits_are_clamped() {
        let config = SyncConfig::default()
            .with_pull_page_size(0)
            .with_max_concurrent_transfers(0)
            .with_max_attachment_attempts(0);
        assert_eq!(config.pull_page_size, 1);
        assert_eq!(config.max_concurrent_transfers, 1);
        assert_eq!(config.max_attachment_attempts, 1);
    }
}
