//! Wrapper for federated structs which handles the `@context` field.
//!
//! Used when serializing outgoing activities/objects so callers don't have
//! to repeat `@context` on every struct, and so nested structs don't each
//! carry their own context.
//!
//! ```
//! # use fedikit::protocol::context::WithContext;
//! #[derive(serde::Serialize)]
//! struct Note {
//!     content: String,
//! }
//! let note = Note { content: "Hello world".to_string() };
//! let note_with_context = WithContext::new_default(note);
//! let serialized = serde_json::to_string(&note_with_context)?;
//! assert_eq!(serialized, r#"{"@context":["https://www.w3.org/ns/activitystreams"],"content":"Hello world"}"#);
//! Ok::<(), serde_json::error::Error>(())
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::helpers::deserialize_one_or_many;

const ACTIVITYSTREAMS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Wrapper for federated structs which handles the `@context` field.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WithContext<T> {
    #[serde(rename = "@context")]
    #[serde(deserialize_with = "deserialize_one_or_many")]
    context: Vec<Value>,
    #[serde(flatten)]
    inner: T,
}

impl<T> WithContext<T> {
    /// Wrap `inner` with the default `https://www.w3.org/ns/activitystreams` context.
    pub fn new_default(inner: T) -> WithContext<T> {
        WithContext::new(inner, vec![Value::String(ACTIVITYSTREAMS_CONTEXT.to_string())])
    }

    /// Wrap `inner` with custom context entries, e.g. for security or
    /// data-integrity extensions.
    pub fn new(inner: T, context: Vec<Value>) -> WithContext<T> {
        WithContext { context, inner }
    }

    /// Borrow the wrapped value.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Consume the wrapper, returning the inner value.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

/// Context entries commonly layered on top of the base activitystreams
/// context when an object carries security/data-integrity fields.
pub fn security_context() -> Value {
    Value::String("https://w3id.org/security/v1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(serde::Serialize, serde::Deserialize)]
    struct Note {
        content: String,
    }

    #[test]
    fn serializes_with_default_context() {
        let note = WithContext::new_default(Note { content: "hi".to_string() });
        let json = serde_json::to_string(&note).unwrap();
        assert_eq!(json, r#"{"@context":["https://www.w3.org/ns/activitystreams"],"content":"hi"}"#);
    }
}
