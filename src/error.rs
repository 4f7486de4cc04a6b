//! Error types shared across the stores and the RPC surface.

/// Convenience alias used throughout the crate.
pub type Result<T, E = CompanyError> = std::result::Result<T, E>;

/// Error surfaced by store operations and request handlers.
///
/// The first three variants are client errors and carry a message suitable
/// for the wire verbatim. Everything else maps to `UNAVAILABLE`: the request
/// never partially commits (multi-row changes are transactional), so the
/// caller may retry.
#[derive(Debug, thiserror::Error)]
pub enum CompanyError {
    /// Missing or malformed parameter; the message names the bad field.
    #[error("{0}")]
    InvalidRequest(String),

    /// Unknown id or name. Surfaced on the wire as `INVALID_REQUEST`
    /// with a "not found" message for compatibility.
    #[error("{0}")]
    NotFound(String),

    /// Duplicate unique key (e.g. channel name collision).
    #[error("{0}")]
    AlreadyExists(String),

    /// Database failure: busy, disk full, constraint breach.
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Filesystem failure (bootstrap, workspace templates, call log).
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Anything else, with context attached at the point of failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CompanyError {
    /// Wire error code for the RPC envelope.
    ///
    /// `NotFound` deliberately maps to `INVALID_REQUEST`: existing clients
    /// match on that code plus a "not found" message.
    pub fn code(&self) -> &'static str {
        match self {
            CompanyError::InvalidRequest(_) | CompanyError::NotFound(_) => "INVALID_REQUEST",
            CompanyError::AlreadyExists(_) => "ALREADY_EXISTS",
            CompanyError::Database(_) | CompanyError::Io(_) | CompanyError::Other(_) => {
                "UNAVAILABLE"
            }
        }
    }

    /// True when the error is a client error (no retry expected).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CompanyError::InvalidRequest(_)
                | CompanyError::NotFound(_)
                | CompanyError::AlreadyExists(_)
        )
    }
}

/// Maps a sqlx error to `AlreadyExists` when it is a unique-constraint
/// violation, otherwise passes it through as a backend failure.
pub(crate) fn map_unique_violation(error: sqlx::Error, message: impl Into<String>) -> CompanyError {
    if let sqlx::Error::Database(ref db_error) = error {
        if db_error.is_unique_violation() {
            return CompanyError::AlreadyExists(message.into());
        }
    }
    CompanyError::Database(error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_surfaces_as_invalid_request() {
        let error = CompanyError::NotFound("channel not found: eng".into());
        assert_eq!(error.code(), "INVALID_REQUEST");
        assert!(error.to_string().contains("not found"));
    }

    #[test]
    fn backend_errors_surface_as_unavailable() {
        let error = CompanyError::Database(sqlx::Error::PoolClosed);
        assert_eq!(error.code(), "UNAVAILABLE");
        assert!(!error.is_client_error());
    }
}
