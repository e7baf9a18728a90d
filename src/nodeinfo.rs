//! NodeInfo 2.1 response builder for `/.well-known/nodeinfo` and the
//! document it links to.
//!
//! Like WebFinger, NodeInfo is a small, mostly-static wire format; the
//! engine only supplies the link-discovery document and a typed builder
//! for the 2.1 schema, leaving usage/software metadata to the host.

use serde::{Deserialize, Serialize};
use url::Url;

/// The `/.well-known/nodeinfo` response: a list of links to the actual
/// NodeInfo document, one per supported schema version.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeInfoWellKnown {
    /// Links to NodeInfo documents, usually just one
    pub links: Vec<NodeInfoWellKnownLink>,
}

/// A single link within [`NodeInfoWellKnown`].
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeInfoWellKnownLink {
    /// Schema version URI, e.g. `http://nodeinfo.diaspora.software/ns/schema/2.1`
    pub rel: String,
    /// URL of the actual NodeInfo document
    pub href: Url,
}

impl NodeInfoWellKnown {
    /// Build a well-known document pointing at a single 2.1 NodeInfo
    /// endpoint.
    pub fn new_2_1(node_info_url: Url) -> Self {
        NodeInfoWellKnown {
            links: vec![NodeInfoWellKnownLink {
                rel: "http://nodeinfo.diaspora.software/ns/schema/2.1".to_string(),
                href: node_info_url,
            }],
        }
    }
}

/// NodeInfo 2.1 document.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeInfo {
    /// Schema version, always `"2.1"`
    pub version: String,
    /// Server software
    pub software: NodeInfoSoftware,
    /// Protocols the server supports, e.g. `["activitypub"]`
    pub protocols: Vec<String>,
    /// Inbound/outbound service integrations; this crate reports none
    pub services: NodeInfoServices,
    /// Whether the server allows open registration
    pub open_registrations: bool,
    /// Aggregate usage counts
    pub usage: NodeInfoUsage,
    /// Arbitrary extra metadata
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Server software identification.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeInfoSoftware {
    /// Software name, lowercase, no spaces
    pub name: String,
    /// Software version string
    pub version: String,
}

/// Third-party service integrations; always empty for this crate.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct NodeInfoServices {
    /// Services this server can receive messages from
    #[serde(default)]
    pub inbound: Vec<String>,
    /// Services this server can deliver messages to
    #[serde(default)]
    pub outbound: Vec<String>,
}

/// Aggregate usage counts reported in a NodeInfo document.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct NodeInfoUsage {
    /// User account counts
    #[serde(default)]
    pub users: NodeInfoUsageUsers,
    /// Total number of posts on the server, if tracked
    pub local_posts: Option<u64>,
    /// Total number of comments on the server, if tracked
    pub local_comments: Option<u64>,
}

/// User counts within [`NodeInfoUsage`].
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct NodeInfoUsageUsers {
    /// Total registered users
    pub total: Option<u64>,
    /// Users active in the last 180 days
    pub active_half_year: Option<u64>,
    /// Users active in the last 30 days
    pub active_month: Option<u64>,
}

impl NodeInfo {
    /// Start building a NodeInfo 2.1 document for `software_name` /
    /// `software_version`, supporting the `activitypub` protocol.
    pub fn new(software_name: impl Into<String>, software_version: impl Into<String>) -> Self {
        NodeInfo {
            version: "2.1".to_string(),
            software: NodeInfoSoftware {
                name: software_name.into(),
                version: software_version.into(),
            },
            protocols: vec!["activitypub".to_string()],
            services: NodeInfoServices::default(),
            open_registrations: false,
            usage: NodeInfoUsage::default(),
            metadata: serde_json::Value::Object(Default::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_known_points_at_21_schema() {
        let url = Url::parse("https://example.com/nodeinfo/2.1").unwrap();
        let doc = NodeInfoWellKnown::new_2_1(url.clone());
        assert_eq!(doc.links[0].href, url);
        assert_eq!(doc.links[0].rel, "http://nodeinfo.diaspora.software/ns/schema/2.1");
    }

    #[test]
    fn new_node_info_defaults_to_activitypub_protocol() {
        let info = NodeInfo::new("fedikit-example", "0.1.0");
        assert_eq!(info.protocols, vec!["activitypub".to_string()]);
        assert_eq!(info.version, "2.1");
    }
}
