//! `OrderedCollection`/`OrderedCollectionPage` building for actor collections
//! (outbox, following, followers, liked, featured, ...)
//!
//! A collection can be unpaged (the dispatcher returns every item at once)
//! or cursor-paged (the dispatcher is called again with `cursor` on each
//! page request). [`build_collection_page`] implements both shapes from one
//! dispatcher result plus the request URL, so route handlers don't
//! reimplement cursor query-string handling themselves.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// One page (or the whole collection, if unpaged) returned by a collection
/// dispatcher.
#[derive(Clone, Debug, Default)]
pub struct CollectionPageData {
    /// Items on this page. Plain `Url`s and full `Object`/`Link` JSON values
    /// are both accepted; recipients should already be reduced to their id
    /// by the dispatcher.
    pub items: Vec<Value>,
    /// Total item count across the whole collection, if known.
    pub total_items: Option<u64>,
    /// Cursor for the next page, if any.
    pub next_cursor: Option<String>,
    /// Cursor for the previous page, if any.
    pub prev_cursor: Option<String>,
}

/// An unpaged or head-of-collection `OrderedCollection`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderedCollection {
    /// `OrderedCollection`
    #[serde(rename = "type")]
    pub kind: String,
    /// Total number of items, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_items: Option<u64>,
    /// All items, for an unpaged collection
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ordered_items: Vec<Value>,
    /// URL of the first page, for a paged collection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first: Option<Url>,
    /// URL of the last page, for a paged collection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<Url>,
}

/// One page of a paged collection.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct OrderedCollectionPage {
    /// `OrderedCollectionPage`
    #[serde(rename = "type")]
    pub kind: String,
    /// URL of the parent collection, with `cursor` removed
    pub part_of: Url,
    /// Items on this page
    pub ordered_items: Vec<Value>,
    /// URL of the previous page, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev: Option<Url>,
    /// URL of the next page, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<Url>,
}

/// Either shape a collection route can respond with.
#[derive(Debug, Clone)]
pub enum CollectionResponse {
    /// An unpaged or paged-head `OrderedCollection`
    Collection(OrderedCollection),
    /// One page of a paged collection
    Page(OrderedCollectionPage),
}

fn with_cursor(base: &Url, cursor: &str) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut().clear().append_pair("cursor", cursor);
    url
}

fn without_cursor(base: &Url) -> Url {
    let pairs: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(key, _)| key != "cursor")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    let mut url = base.clone();
    {
        let mut mut_pairs = url.query_pairs_mut();
        mut_pairs.clear();
        for (key, value) in &pairs {
            mut_pairs.append_pair(key, value);
        }
    }
    if pairs.is_empty() {
        url.set_query(None);
    }
    url
}

/// Build the collection response for `collection_url`, given the requested
/// `cursor` (from the `?cursor=` query parameter, if present) and the
/// dispatcher's `page`.
///
/// `paged` controls whether the no-cursor case returns a full
/// `OrderedCollection` (dispatcher supports only one page, `paged = false`)
/// or a paged head pointing at `first`/`last` cursors (`paged = true`, with
/// `first_cursor`/`last_cursor` supplied by the registered collection).
pub fn build_collection_page(
    collection_url: &Url,
    cursor: Option<&str>,
    page: CollectionPageData,
    first_cursor: Option<&str>,
    last_cursor: Option<&str>,
) -> CollectionResponse {
    match cursor {
        None => {
            if let Some(first_cursor) = first_cursor {
                CollectionResponse::Collection(OrderedCollection {
                    kind: "OrderedCollection".to_string(),
                    total_items: page.total_items,
                    ordered_items: Vec::new(),
                    first: Some(with_cursor(collection_url, first_cursor)),
                    last: last_cursor.map(|cursor| with_cursor(collection_url, cursor)),
                })
            } else {
                CollectionResponse::Collection(OrderedCollection {
                    kind: "OrderedCollection".to_string(),
                    total_items: page.total_items,
                    ordered_items: page.items,
                    first: None,
                    last: None,
                })
            }
        }
        Some(_) => CollectionResponse::Page(OrderedCollectionPage {
            kind: "OrderedCollectionPage".to_string(),
            part_of: without_cursor(collection_url),
            ordered_items: page.items,
            prev: page.prev_cursor.map(|cursor| with_cursor(collection_url, &cursor)),
            next: page.next_cursor.map(|cursor| with_cursor(collection_url, &cursor)),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> Url {
        Url::parse("https://example.com/users/alice/followers").unwrap()
    }

    #[test]
    fn no_cursor_unpaged_returns_full_collection() {
        let page = CollectionPageData {
            items: vec![Value::String("https://remote.example/users/bob".to_string())],
            total_items: Some(1),
            ..Default::default()
        };
        let response = build_collection_page(&url(), None, page, None, None);
        match response {
            CollectionResponse::Collection(collection) => {
                assert_eq!(collection.ordered_items.len(), 1);
                assert!(collection.first.is_none());
            }
            CollectionResponse::Page(_) => panic!("expected a collection"),
        }
    }

    #[test]
    fn no_cursor_paged_returns_head_with_first_last() {
        let page = CollectionPageData {
            total_items: Some(42),
            ..Default::default()
        };
        let response = build_collection_page(&url(), None, page, Some("0"), Some("9"));
        match response {
            CollectionResponse::Collection(collection) => {
                assert_eq!(collection.first.unwrap().query(), Some("cursor=0"));
                assert_eq!(collection.last.unwrap().query(), Some("cursor=9"));
                assert_eq!(collection.total_items, Some(42));
            }
            CollectionResponse::Page(_) => panic!("expected a collection head"),
        }
    }

    #[test]
    fn cursor_present_returns_page_with_part_of_stripped() {
        let page = CollectionPageData {
            items: vec![],
            next_cursor: Some("20".to_string()),
            prev_cursor: Some("0".to_string()),
            ..Default::default()
        };
        let mut requested = url();
        requested.set_query(Some("cursor=10"));
        let response = build_collection_page(&requested, Some("10"), page, None, None);
        match response {
            CollectionResponse::Page(page) => {
                assert_eq!(page.part_of.query(), None);
                assert_eq!(page.next.unwrap().query(), Some("cursor=20"));
                assert_eq!(page.prev.unwrap().query(), Some("cursor=0"));
            }
            CollectionResponse::Collection(_) => panic!("expected a page"),
        }
    }
}
