//! Minimal Activity Streams 2.0 envelope and the static type-hierarchy table
//! used to dispatch inbound activities to listeners.
//!
//! The full Activity Streams object model (typed subclasses, `to_json_ld`/
//! `from_json_ld`) is treated as an external capability the host
//! application brings; this module only knows the handful of top-level
//! fields (`id`, `type`, `actor`) the engine itself needs to route,
//! deduplicate, and verify an incoming activity before handing the raw
//! JSON to a listener.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::protocol::helpers::deserialize_one_or_many;

/// The fields of an incoming activity the engine reads before dispatch.
/// Extra fields are preserved in `rest` so the full document can still be
/// handed to the matched listener unmodified.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ActivityEnvelope {
    /// Activity id. Absent on some broadcast-only activities (e.g. some
    /// `Delete` announcements); such activities cannot be deduplicated.
    pub id: Option<Url>,
    /// Activity type tag, e.g. `"Follow"`, `"Create"`.
    #[serde(rename = "type")]
    pub kind: String,
    /// The actor attributed to this activity.
    #[serde(deserialize_with = "deserialize_one_or_many")]
    pub actor: Vec<Url>,
    /// Embedded Data Integrity proof, if present.
    #[serde(default)]
    pub proof: Option<Value>,
}

/// Static supertype chain for known Activity Streams activity types, walked
/// by the listener set until a registered listener matches or the chain is
/// exhausted at `"Activity"`. Compiled in rather than derived by reflection,
/// since the object model living outside this crate has no runtime type
/// information to query.
const TYPE_HIERARCHY: &[(&str, &str)] = &[
    ("Accept", "Activity"),
    ("TentativeAccept", "Accept"),
    ("Add", "Activity"),
    ("Announce", "Activity"),
    ("Arrive", "Activity"),
    ("Block", "Ignore"),
    ("Create", "Activity"),
    ("Delete", "Activity"),
    ("Dislike", "Activity"),
    ("Flag", "Activity"),
    ("Follow", "Activity"),
    ("Ignore", "Activity"),
    ("Invite", "Offer"),
    ("Join", "Activity"),
    ("Leave", "Activity"),
    ("Like", "Activity"),
    ("Listen", "Activity"),
    ("Move", "Activity"),
    ("Offer", "Activity"),
    ("Question", "Activity"),
    ("Reject", "Activity"),
    ("TentativeReject", "Reject"),
    ("Read", "Activity"),
    ("Remove", "Activity"),
    ("Undo", "Activity"),
    ("Update", "Activity"),
    ("View", "Activity"),
];

/// Base tag every other activity type ultimately chains to.
pub const BASE_ACTIVITY_TYPE: &str = "Activity";

/// The supertype of `kind`, per [`TYPE_HIERARCHY`]. Unknown types are
/// treated as direct children of `"Activity"`.
pub fn supertype_of(kind: &str) -> &'static str {
    TYPE_HIERARCHY
        .iter()
        .find(|(tag, _)| *tag == kind)
        .map(|(_, parent)| *parent)
        .unwrap_or(BASE_ACTIVITY_TYPE)
}

/// Walk `kind`'s static supertype chain, starting with `kind` itself and
/// ending at `"Activity"` (inclusive). `kind` need not appear in
/// [`TYPE_HIERARCHY`] at all — an unrecognized extension type is kept as
/// the chain's first entry and treated as a direct child of `"Activity"`.
pub fn type_chain(kind: &str) -> Vec<String> {
    let mut chain = vec![kind.to_string()];
    let mut current = kind;
    while current != BASE_ACTIVITY_TYPE {
        current = supertype_of(current);
        chain.push(current.to_string());
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn follow_chains_directly_to_activity() {
        assert_eq!(type_chain("Follow"), vec!["Follow", "Activity"]);
    }

    #[test]
    fn tentative_accept_chains_through_accept() {
        assert_eq!(type_chain("TentativeAccept"), vec!["TentativeAccept", "Accept", "Activity"]);
    }

    #[test]
    fn unknown_type_falls_back_to_activity() {
        assert_eq!(type_chain("SomeExtensionType"), vec!["SomeExtensionType", "Activity"]);
    }
}
