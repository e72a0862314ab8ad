//! Typed failures for nimbus server calls.

use thiserror::Error;

/// A failure reported by (or while talking to) the nimbus server.
///
/// Server-reported failures are produced by [`ApiError::from_envelope`]
/// from the `(code, message)` pair of a non-ok envelope; the mapping is
/// normative and shared by every transport.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// The server cannot perform this operation on this storage.
    #[error("operation unsupported by the server")]
    Unsupported,

    /// The account is not allowed to perform the operation.
    #[error("access denied: {0}")]
    Denied(String),

    /// Credentials were rejected.
    #[error("authentication failed")]
    AuthFailed,

    /// The account requires a two-factor code.
    #[error("two-factor code required")]
    TwoFactor,

    /// The server database or the target filesystem is read-only.
    #[error("read-only {0}")]
    ReadOnlyFs(String),

    /// The named entity does not exist on the server.
    #[error("not found: {0}")]
    NotFound(String),

    /// Any other server-reported failure, verbatim.
    #[error("server error {code}: {message}")]
    Api { code: u16, message: String },

    /// The transport could not complete the request (refused, timeout).
    #[error("transport failure: {0}")]
    Connection(String),

    /// The response body was not a well-formed envelope.
    #[error("malformed server response: {0}")]
    Json(String),
}

impl ApiError {
    /// Map a non-ok envelope's `(code, message)` to a typed failure.
    ///
    /// Messages may carry a `:detail` suffix which does not participate
    /// in the mapping.
    #[must_use]
    pub fn from_envelope(code: u16, message: &str) -> Self {
        let head = message.split(':').next().unwrap_or(message);
        match (code, head) {
            (400, "FILESYSTEM_MISMATCH" | "STORAGE_FOLDERS_UNSUPPORTED") => Self::Unsupported,
            (400, "ACCOUNT_CRYPTO_NOT_UNLOCKED") => Self::Denied(head.to_owned()),
            (403, "AUTHENTICATION_FAILED") => Self::AuthFailed,
            (403, "TWOFACTOR_REQUIRED") => Self::TwoFactor,
            (403, "READ_ONLY_DATABASE") => Self::ReadOnlyFs("database".to_owned()),
            (403, "READ_ONLY_FILESYSTEM") => Self::ReadOnlyFs("filesystem".to_owned()),
            (403, _) => Self::Denied(message.to_owned()),
            (404, _) => Self::NotFound(message.to_owned()),
            _ => Self::Api {
                code,
                message: message.to_owned(),
            },
        }
    }

    /// True if the failure indicates the request body exceeded the
    /// server's per-call size limit, so the caller should shrink its
    /// upload chunk and retry.
    #[must_use]
    pub fn is_size_limit(&self) -> bool {
        match self {
            Self::Api { code: 413, .. } => true,
            Self::Api { code: 400, message } => message.starts_with("INPUT_TOO_LARGE"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ApiError;

    #[test]
    fn envelope_mapping_table() {
        assert!(matches!(
            ApiError::from_envelope(400, "FILESYSTEM_MISMATCH"),
            ApiError::Unsupported
        ));
        assert!(matches!(
            ApiError::from_envelope(400, "STORAGE_FOLDERS_UNSUPPORTED"),
            ApiError::Unsupported
        ));
        assert!(matches!(
            ApiError::from_envelope(400, "ACCOUNT_CRYPTO_NOT_UNLOCKED"),
            ApiError::Denied(_)
        ));
        assert!(matches!(
            ApiError::from_envelope(403, "AUTHENTICATION_FAILED"),
            ApiError::AuthFailed
        ));
        assert!(matches!(
            ApiError::from_envelope(403, "TWOFACTOR_REQUIRED"),
            ApiError::TwoFactor
        ));
        assert!(matches!(
            ApiError::from_envelope(403, "READ_ONLY_DATABASE"),
            ApiError::ReadOnlyFs(_)
        ));
        assert!(matches!(
            ApiError::from_envelope(403, "READ_ONLY_FILESYSTEM"),
            ApiError::ReadOnlyFs(_)
        ));
        assert!(matches!(
            ApiError::from_envelope(403, "SOMETHING_ELSE"),
            ApiError::Denied(_)
        ));
        assert!(matches!(
            ApiError::from_envelope(404, "UNKNOWN_FILE"),
            ApiError::NotFound(_)
        ));
        assert!(matches!(
            ApiError::from_envelope(500, "SERVER_ERROR"),
            ApiError::Api { code: 500, .. }
        ));
    }

    #[test]
    fn detail_suffix_is_ignored_for_mapping() {
        assert!(matches!(
            ApiError::from_envelope(400, "FILESYSTEM_MISMATCH:fs123"),
            ApiError::Unsupported
        ));
    }

    #[test]
    fn size_limit_detection() {
        assert!(ApiError::from_envelope(413, "anything").is_size_limit());
        assert!(ApiError::from_envelope(400, "INPUT_TOO_LARGE:file").is_size_limit());
        assert!(!ApiError::from_envelope(404, "x").is_size_limit());
    }
}
