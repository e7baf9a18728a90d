//! Serde deserialization helpers for data shaped differently by different
//! fediverse implementations.

use serde::{Deserialize, Deserializer};

/// Deserialize a single JSON value or a JSON array into a `Vec`.
///
/// ```
/// # use fedikit::protocol::helpers::deserialize_one_or_many;
/// # use url::Url;
/// #[derive(serde::Deserialize)]
/// struct Note {
///     #[serde(deserialize_with = "deserialize_one_or_many")]
///     to: Vec<Url>,
/// }
///
/// let single: Note = serde_json::from_str(r#"{"to": "https://example.com/u/alice" }"#)?;
/// assert_eq!(single.to.len(), 1);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn deserialize_one_or_many<'de, T, D>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        One(T),
        Many(Vec<T>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(list) => list,
        OneOrMany::One(value) => vec![value],
    })
}

/// Deserialize a single value or a single-element array into an `Option`,
/// taking the last element if several are present.
pub fn deserialize_last<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum MaybeArray<T> {
        Simple(T),
        Array(Vec<T>),
        None,
    }

    Ok(match MaybeArray::deserialize(deserializer)? {
        MaybeArray::Simple(value) => Some(value),
        MaybeArray::Array(value) => value.into_iter().last(),
        MaybeArray::None => None,
    })
}

/// Deserialize a field, falling back to the type's default on any shape
/// mismatch. Pair with `#[serde(default)]` so a missing field isn't an
/// error either.
pub fn deserialize_skip_error<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: Deserialize<'de> + Default,
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    #[derive(serde::Deserialize)]
    struct Note {
        #[serde(deserialize_with = "deserialize_one_or_many")]
        to: Vec<Url>,
    }

    #[test]
    fn single_value_becomes_one_element_vec() {
        let note: Note = serde_json::from_str(r#"{"to": "https://example.com/u/alice"}"#).unwrap();
        assert_eq!(note.to.len(), 1);
    }

    #[test]
    fn array_value_is_preserved() {
        let note: Note =
            serde_json::from_str(r#"{"to": ["https://example.com/u/alice", "https://example.com/u/bob"]}"#).unwrap();
        assert_eq!(note.to.len(), 2);
    }
}
