//! URI-template path matcher and builder for registered federation endpoints
//!
//! This is an internal building block: the federation engine registers one
//! route per endpoint kind (actor, inbox, outbox, object, ...) and uses the
//! router to go from an incoming request path to a route name plus variable
//! bindings, and from a route name plus values back to a path.

use std::collections::{HashMap, HashSet};

/// Errors that can occur while registering routes. These are programmer
/// errors: they are raised at registration time, not at request time.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RouterError {
    /// A route with this name was already registered
    #[error("Route '{0}' is already registered")]
    DuplicateName(String),
    /// The template does not start with `/`
    #[error("Route template '{0}' must start with '/'")]
    NotRooted(String),
    /// The template contains an empty variable name, e.g. `{}`
    #[error("Route template '{0}' contains an empty variable name")]
    EmptyVariable(String),
    /// The template's variable set doesn't match what this route kind requires
    #[error("Route '{0}' has the wrong variable set for its kind")]
    WrongVariableSet(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
}

struct Route {
    name: String,
    segments: Vec<Segment>,
}

/// Result of successfully matching a path against the router.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Matched {
    /// Name of the route that matched
    pub name: String,
    /// Values bound to the route's variables, keyed by variable name
    pub values: HashMap<String, String>,
}

/// Whether `/x` and `/x/` are treated as the same route.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrailingSlash {
    /// `/x` and `/x/` match the same route
    Insensitive,
    /// `/x` and `/x/` are distinct
    Sensitive,
}

/// URI-template path matcher and builder.
///
/// Templates use `{name}` to mark a path variable, which matches exactly one
/// non-`/` path segment. Literal segments always take priority over variable
/// segments when multiple routes could match the same path.
pub struct Router {
    routes: Vec<Route>,
    names: HashSet<String>,
    trailing_slash: TrailingSlash,
}

impl Router {
    /// Create a new, empty router.
    pub fn new(trailing_slash: TrailingSlash) -> Self {
        Router {
            routes: Vec::new(),
            names: HashSet::new(),
            trailing_slash,
        }
    }

    /// Register a new route. Returns the set of variable names found in the
    /// template, or a [`RouterError`] if the template or name is invalid.
    pub fn add(&mut self, template: &str, name: &str) -> Result<HashSet<String>, RouterError> {
        if !template.starts_with('/') {
            return Err(RouterError::NotRooted(template.to_string()));
        }
        if self.names.contains(name) {
            return Err(RouterError::DuplicateName(name.to_string()));
        }

        let mut segments = Vec::new();
        let mut variables = HashSet::new();
        for raw in template.trim_matches('/').split('/').filter(|s| !s.is_empty()) {
            if let Some(var) = raw.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                if var.is_empty() {
                    return Err(RouterError::EmptyVariable(template.to_string()));
                }
                variables.insert(var.to_string());
                segments.push(Segment::Variable(var.to_string()));
            } else {
                segments.push(Segment::Literal(raw.to_string()));
            }
        }

        self.names.insert(name.to_string());
        self.routes.push(Route {
            name: name.to_string(),
            segments,
        });
        Ok(variables)
    }

    /// Match an incoming request path against all registered routes.
    ///
    /// Exact literal segments beat variable segments when both could match;
    /// ties among equally-specific routes are broken by registration order.
    pub fn route(&self, path: &str) -> Option<Matched> {
        let path = self.normalize(path);
        let parts: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();

        let mut best: Option<(u32, Matched)> = None;
        for route in &self.routes {
            if route.segments.len() != parts.len() {
                continue;
            }
            let mut values = HashMap::new();
            let mut specificity = 0u32;
            let mut matched = true;
            for (seg, part) in route.segments.iter().zip(parts.iter()) {
                match seg {
                    Segment::Literal(lit) => {
                        if lit != part {
                            matched = false;
                            break;
                        }
                        specificity += 1;
                    }
                    Segment::Variable(name) => {
                        values.insert(name.clone(), (*part).to_string());
                    }
                }
            }
            if !matched {
                continue;
            }
            let candidate = Matched {
                name: route.name.clone(),
                values,
            };
            match &best {
                Some((best_spec, _)) if *best_spec >= specificity => {}
                _ => best = Some((specificity, candidate)),
            }
        }
        best.map(|(_, m)| m)
    }

    /// Build a path for the named route, substituting `values` for its
    /// variables. Returns `None` if the route is unknown or `values` is
    /// missing a required variable.
    pub fn build(&self, name: &str, values: &HashMap<String, String>) -> Option<String> {
        let route = self.routes.iter().find(|r| r.name == name)?;
        let mut out = String::new();
        for seg in &route.segments {
            out.push('/');
            match seg {
                Segment::Literal(lit) => out.push_str(lit),
                Segment::Variable(name) => out.push_str(values.get(name)?),
            }
        }
        if out.is_empty() {
            out.push('/');
        }
        Some(out)
    }

    /// Returns true if a route with this name is already registered.
    pub fn has_name(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    fn normalize(&self, path: &str) -> String {
        match self.trailing_slash {
            TrailingSlash::Insensitive => {
                if path.len() > 1 && path.ends_with('/') {
                    path.trim_end_matches('/').to_string()
                } else {
                    path.to_string()
                }
            }
            TrailingSlash::Sensitive => path.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn add_rejects_duplicate_name() {
        let mut router = Router::new(TrailingSlash::Insensitive);
        router.add("/users/{identifier}", "actor").unwrap();
        let err = router.add("/other/{identifier}", "actor").unwrap_err();
        assert_eq!(err, RouterError::DuplicateName("actor".to_string()));
    }

    #[test]
    fn add_rejects_unrooted_template() {
        let mut router = Router::new(TrailingSlash::Insensitive);
        let err = router.add("users/{identifier}", "actor").unwrap_err();
        assert_eq!(err, RouterError::NotRooted("users/{identifier}".to_string()));
    }

    #[test]
    fn route_extracts_variables() {
        let mut router = Router::new(TrailingSlash::Insensitive);
        router.add("/users/{identifier}/inbox", "inbox").unwrap();
        let matched = router.route("/users/alice/inbox").unwrap();
        assert_eq!(matched.name, "inbox");
        assert_eq!(matched.values.get("identifier").unwrap(), "alice");
    }

    #[test]
    fn route_build_roundtrip() {
        let mut router = Router::new(TrailingSlash::Insensitive);
        router.add("/users/{identifier}", "actor").unwrap();
        let path = router.build("actor", &values(&[("identifier", "alice")])).unwrap();
        assert_eq!(path, "/users/alice");
        let matched = router.route(&path).unwrap();
        assert_eq!(matched.name, "actor");
        assert_eq!(matched.values.get("identifier").unwrap(), "alice");
    }

    #[test]
    fn trailing_slash_insensitive_matches_both() {
        let mut router = Router::new(TrailingSlash::Insensitive);
        router.add("/users/{identifier}", "actor").unwrap();
        assert!(router.route("/users/alice").is_some());
        assert!(router.route("/users/alice/").is_some());
    }

    #[test]
    fn trailing_slash_sensitive_distinguishes() {
        let mut router = Router::new(TrailingSlash::Sensitive);
        router.add("/users/{identifier}", "actor").unwrap();
        assert!(router.route("/users/alice").is_some());
        assert!(router.route("/users/alice/").is_none());
    }

    #[test]
    fn literal_beats_variable() {
        let mut router = Router::new(TrailingSlash::Insensitive);
        router.add("/{identifier}", "actor").unwrap();
        router.add("/nodeinfo", "node_info").unwrap();
        let matched = router.route("/nodeinfo").unwrap();
        assert_eq!(matched.name, "node_info");
    }

    #[test]
    fn build_missing_value_returns_none() {
        let mut router = Router::new(TrailingSlash::Insensitive);
        router.add("/users/{identifier}", "actor").unwrap();
        assert!(router.build("actor", &HashMap::new()).is_none());
    }
}
