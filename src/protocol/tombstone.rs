//! Response body for deleted objects

use serde::{Deserialize, Serialize};
use url::Url;

use crate::kinds::object::TombstoneType;

/// Served in place of an object whose dispatcher reports it as deleted.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    /// Id of the deleted object
    pub id: Url,
    #[serde(rename = "type")]
    pub(crate) kind: TombstoneType,
}

impl Tombstone {
    /// Build a tombstone for `id`.
    pub fn new(id: Url) -> Tombstone {
        Tombstone {
            id,
            kind: TombstoneType::Tombstone,
        }
    }
}
