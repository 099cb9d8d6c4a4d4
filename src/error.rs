//! Error types for proximity-guard.
//!
//! The distance, presence and alert layers never return errors for missing
//! data; they skip evaluation instead. Errors here surface from the
//! relationship graph, the document store boundary and route synthesis.

use thiserror::Error;

/// The main error type for proximity-guard operations.
#[derive(Error, Debug)]
#[cfg_attr(feature = "ffi", derive(uniffi::Error))]
#[cfg_attr(feature = "ffi", uniffi(flat_error))]
pub enum ProximityError {
    /// Geolocation or push permission was refused by the user.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Routing service or document store unreachable.
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// A referenced account does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The owner already has an edge to this contact.
    #[error("{email} is already linked to this account")]
    AlreadyLinked {
        /// Email of the contact that is already linked.
        email: String,
    },

    /// An external payload (polyline, document, route response) is malformed.
    #[error("decode error: {0}")]
    Decode(String),

    /// Bidirectional edges are out of sync.
    #[error("inconsistent relationship state: {0}")]
    InconsistentState(String),

    /// A coordinate is outside WGS84 ranges or not finite.
    #[error("invalid coordinate: ({latitude}, {longitude})")]
    InvalidCoordinate {
        /// Latitude in degrees.
        latitude: f64,
        /// Longitude in degrees.
        longitude: f64,
    },

    /// Caller supplied an argument that cannot be acted on.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    ConfigValidation(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for proximity-guard operations.
pub type Result<T> = std::result::Result<T, ProximityError>;

impl ProximityError {
    /// Create a new network failure.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkFailure(message.into())
    }

    /// Create a new decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Create a new not-found error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Whether falling back to a local computation is the right recovery.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NetworkFailure(_) | Self::Decode(_) | Self::Json(_)
        )
    }

    /// Check if this error is a permission issue.
    #[must_use]
    pub fn is_permission_error(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }
}
