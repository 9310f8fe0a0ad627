//! Per-item push outcomes, rejection reasons and error codes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why the backend declined a pushed change.
///
/// A rejection is a business decision, not a failure: the change is final
/// and is never retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RejectionReason {
    /// The backend gave no reason.
    Unknown,
    /// The user may not modify this document.
    PermissionDenied,
    /// Documents of this type cannot be written from devices.
    TypeRestricted,
    /// A document with the same identifier already exists.
    CreateConflict,
    /// The document changed on the backend since the local edit was made.
    UpdateConflict,
    /// The attachment exceeds the size the backend accepts.
    LargeAttachment,
    /// The local store refused a pulled change.
    ConstraintViolation,
}

impl RejectionReason {
    /// Converts to a numeric code.
    pub fn to_code(&self) -> u8 {
        match self {
            RejectionReason::Unknown => 0,
            RejectionReason::PermissionDenied => 1,
            RejectionReason::TypeRestricted => 2,
            RejectionReason::CreateConflict => 3,
            RejectionReason::UpdateConflict => 4,
            RejectionReason::LargeAttachment => 5,
            RejectionReason::ConstraintViolation => 6,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(RejectionReason::Unknown),
            1 => Some(RejectionReason::PermissionDenied),
            2 => Some(RejectionReason::TypeRestricted),
            3 => Some(RejectionReason::CreateConflict),
            4 => Some(RejectionReason::UpdateConflict),
            5 => Some(RejectionReason::LargeAttachment),
            6 => Some(RejectionReason::ConstraintViolation),
            _ => None,
        }
    }

    /// Returns the name used in event payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::Unknown => "Unknown",
            RejectionReason::PermissionDenied => "PermissionDenied",
            RejectionReason::TypeRestricted => "TypeRestricted",
            RejectionReason::CreateConflict => "CreateConflict",
            RejectionReason::UpdateConflict => "UpdateConflict",
            RejectionReason::LargeAttachment => "LargeAttachment",
            RejectionReason::ConstraintViolation => "ConstraintViolation",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric code attached to per-item failures.
///
/// Codes below 900 follow HTTP status semantics. The 9xx range is reserved
/// for failures detected on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    /// The request was malformed.
    pub const BAD_REQUEST: ErrorCode = ErrorCode(400);
    /// The document or attachment does not exist on the backend.
    pub const NOT_FOUND: ErrorCode = ErrorCode(404);
    /// The request timed out.
    pub const TIMEOUT: ErrorCode = ErrorCode(408);
    /// The access credential is no longer valid.
    pub const GONE: ErrorCode = ErrorCode(410);
    /// The backend failed while processing the item.
    pub const INTERNAL: ErrorCode = ErrorCode(500);
    /// The backend is temporarily unavailable.
    pub const UNAVAILABLE: ErrorCode = ErrorCode(503);
    /// The network transport failed.
    pub const TRANSPORT: ErrorCode = ErrorCode(900);
    /// The response could not be understood.
    pub const PROTOCOL: ErrorCode = ErrorCode(901);
    /// The local store failed.
    pub const STORAGE: ErrorCode = ErrorCode(902);

    /// Returns the raw code.
    pub fn value(&self) -> u16 {
        self.0
    }

    /// Returns true for the reserved credential-invalidated code.
    pub fn is_gone(&self) -> bool {
        *self == Self::GONE
    }

    /// Returns true for codes detected on the device rather than the backend.
    pub fn is_local(&self) -> bool {
        self.0 >= 900
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The backend's answer to one pushed document or attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PushOutcome {
    /// The change was stored under a new revision.
    Accepted {
        /// Revision assigned by the backend.
        revision: u64,
    },
    /// The backend declined the change.
    Rejected {
        /// Why.
        reason: RejectionReason,
    },
    /// The backend failed to process the change; it may be retried.
    Error {
        /// Failure code.
        code: ErrorCode,
    },
}

impl PushOutcome {
    /// Returns true for `Accepted`.
    pub fn is_accepted(&self) -> bool {
        matches!(self, PushOutcome::Accepted { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_codes() {
        for code in 0..=6 {
            let reason = RejectionReason::from_code(code).unwrap();
            assert_eq!(reason.to_code(), code);
        }
        assert_eq!(RejectionReason::from_code(7), None);
    }

    #[test]
    fn gone_code() {
        assert!(ErrorCode::GONE.is_gone());
        assert!(!ErrorCode::INTERNAL.is_gone());
        assert_eq!(ErrorCode::GONE.value(), 410);
    }

    #[test]
    fn local_codes() {
        assert!(ErrorCode::STORAGE.is_local());
        assert!(ErrorCode::TRANSPORT.is_local());
        assert!(!ErrorCode::UNAVAILABLE.is_local());
    }

    #[test]
    fn rejection_display() {
        assert_eq!(RejectionReason::UpdateConflict.to_string(), "UpdateConflict");
    }
}
