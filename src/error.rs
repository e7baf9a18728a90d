//! Error messages returned by this library

use crate::router::RouterError;

/// Error messages returned by this library
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No dispatcher is registered for the requested route
    #[error("No dispatcher registered for this route")]
    NotFound,
    /// Request limit was reached during fetch
    #[error("Request limit was reached during fetch")]
    RequestLimit,
    /// Response body limit was reached during fetch
    #[error("Response body limit was reached during fetch")]
    ResponseBodyLimit,
    /// Object to be fetched was deleted
    #[error("Object to be fetched was deleted")]
    ObjectDeleted,
    /// Url verification error
    #[error("URL failed verification: {0}")]
    UrlVerificationError(&'static str),
    /// Incoming activity has invalid digest for body
    #[error("Incoming activity has invalid digest for body")]
    ActivityBodyDigestInvalid,
    /// Incoming activity has invalid signature
    #[error("Incoming activity has invalid signature")]
    ActivitySignatureInvalid,
    /// Signer key is not owned by the activity's actor
    #[error("Signing key is not owned by the activity actor")]
    KeyOwnerMismatch,
    /// Failed to resolve actor via webfinger
    #[error("Failed to resolve actor via webfinger")]
    WebfingerResolveFailed,
    /// A collection's authorize predicate rejected the request
    #[error("Not authorized to view this collection")]
    Unauthorized,
    /// A route was misregistered
    #[error(transparent)]
    Router(#[from] RouterError),
    /// Error parsing a URL
    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),
    /// Error (de)serializing JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Other error, usually from a host application callback
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn other<T>(error: T) -> Self
    where
        T: Into<anyhow::Error>,
    {
        Error::Other(error.into())
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}
