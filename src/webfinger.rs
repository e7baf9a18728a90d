//! WebFinger JRD responses for `/.well-known/webfinger`
//!
//! A full WebFinger *client* (resolving `name@example.com` against a remote
//! server) is out of scope here; the engine only needs to answer incoming
//! WebFinger requests for its own actors, translating the host's actor
//! dispatcher into the JRD wire format.

use std::collections::HashMap;

use http::HeaderValue;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

/// Content-type served for WebFinger responses.
pub static WEBFINGER_CONTENT_TYPE: HeaderValue = HeaderValue::from_static("application/jrd+json");

/// Errors produced while handling an incoming WebFinger query.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum WebFingerError {
    /// The `resource` query parameter is not a well-formed `acct:` URI
    #[error("webfinger resource parameter has the wrong format")]
    WrongFormat,
    /// The queried domain does not match this server's configured domain
    #[error("webfinger resource domain does not match this server")]
    WrongDomain,
}

/// A WebFinger JRD response describing one actor (or several actors
/// sharing the same `acct:` subject, e.g. a user and a group with the same
/// handle).
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct Webfinger {
    /// The queried subject, e.g. `acct:alice@example.com`
    pub subject: String,
    /// Links to representations of the subject
    pub links: Vec<WebfingerLink>,
    /// Other URIs identifying the same subject
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<Url>,
    /// Extra JRD properties
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<Url, String>,
}

/// A single link within a [`Webfinger`] response.
#[derive(Serialize, Deserialize, Debug, Default, Clone)]
pub struct WebfingerLink {
    /// Link relation, e.g. `self` or `http://webfinger.net/rel/profile-page`
    pub rel: Option<String>,
    /// Media type of the linked resource
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Target of the link
    pub href: Option<Url>,
    /// URI template, used for remote-follow links
    pub template: Option<String>,
    /// Extra JRD properties
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<Url, String>,
}

/// Build a JRD response for `subject` pointing at a single actor `url`,
/// viewable as HTML and fetchable as `application/activity+json`.
pub fn build_webfinger_response(subject: String, url: Url) -> Webfinger {
    build_webfinger_response_with_type(subject, vec![(url, None)])
}

/// Build a JRD response for `subject` describing several actors sharing
/// the handle, each optionally tagged with an Activity Streams type.
pub fn build_webfinger_response_with_type(subject: String, urls: Vec<(Url, Option<&str>)>) -> Webfinger {
    let links = urls.into_iter().fold(Vec::new(), |mut acc, (url, kind)| {
        let properties: HashMap<Url, String> = kind
            .map(|kind| {
                HashMap::from([(
                    "https://www.w3.org/ns/activitystreams#type".parse().expect("static url parses"),
                    kind.to_string(),
                )])
            })
            .unwrap_or_default();
        acc.push(WebfingerLink {
            rel: Some("http://webfinger.net/rel/profile-page".to_string()),
            kind: Some("text/html".to_string()),
            href: Some(url.clone()),
            ..Default::default()
        });
        acc.push(WebfingerLink {
            rel: Some("self".to_string()),
            kind: Some("application/activity+json".to_string()),
            href: Some(url),
            properties,
            ..Default::default()
        });
        acc
    });
    Webfinger {
        subject,
        links,
        aliases: vec![],
        properties: HashMap::new(),
    }
}

/// Extract the account name from a WebFinger `resource` query parameter of
/// the form `acct:name@domain`, verifying it matches `expected_domain`.
///
/// ```
/// # use fedikit::webfinger::extract_webfinger_name;
/// let name = extract_webfinger_name("acct:alice@example.com", "example.com").unwrap();
/// assert_eq!(name, "alice");
/// ```
pub fn extract_webfinger_name<'q>(resource: &'q str, expected_domain: &str) -> Result<&'q str, WebFingerError> {
    static WEBFINGER_REGEX: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^acct:([\p{L}0-9_.\-]+)@(.*)$").expect("static regex compiles"));

    let captures = WEBFINGER_REGEX.captures(resource).ok_or(WebFingerError::WrongFormat)?;
    let name = captures.get(1).ok_or(WebFingerError::WrongFormat)?.as_str();
    let domain = captures.get(2).ok_or(WebFingerError::WrongFormat)?.as_str();

    if domain != expected_domain {
        return Err(WebFingerError::WrongDomain);
    }
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_name_for_matching_domain() {
        assert_eq!(extract_webfinger_name("acct:alice@example.com", "example.com").unwrap(), "alice");
    }

    #[test]
    fn rejects_mismatched_domain() {
        assert_eq!(
            extract_webfinger_name("acct:alice@example.com", "other.example"),
            Err(WebFingerError::WrongDomain)
        );
    }

    #[test]
    fn rejects_malformed_resource() {
        assert_eq!(extract_webfinger_name("not-an-acct-uri", "example.com"), Err(WebFingerError::WrongFormat));
    }

    #[test]
    fn builds_self_and_profile_links() {
        let url = Url::parse("https://example.com/users/alice").unwrap();
        let response = build_webfinger_response("acct:alice@example.com".to_string(), url.clone());
        assert_eq!(response.links.len(), 2);
        assert!(response.links.iter().any(|link| link.rel.as_deref() == Some("self") && link.href.as_ref() == Some(&url)));
    }
}
