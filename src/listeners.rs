//! Inbox listener registration and dispatch by activity type chain
//!
//! Listeners are registered against an activity type tag (`"Follow"`,
//! `"Create"`, ...). Dispatch walks [`crate::vocab::type_chain`] from the
//! incoming activity's own type up to `"Activity"`, invoking the first
//! listener found. Registering two listeners for the same tag is a
//! programmer error, caught at registration time.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::InboxContext;
use crate::vocab::type_chain;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A registered inbox listener: given the context of one incoming activity,
/// process it and resolve once durably handled.
pub type Listener<T> = Arc<dyn Fn(InboxContext<T>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Error returned when registering a listener for an activity type tag that
/// already has one.
#[derive(thiserror::Error, Debug)]
#[error("a listener is already registered for activity type '{0}'")]
pub struct DuplicateListener(pub String);

/// The set of registered inbox listeners, keyed by activity type tag.
pub struct InboxListenerSet<T: Clone> {
    listeners: HashMap<String, Listener<T>>,
}

impl<T: Clone> Default for InboxListenerSet<T> {
    fn default() -> Self {
        InboxListenerSet { listeners: HashMap::new() }
    }
}

impl<T: Clone> InboxListenerSet<T> {
    /// Create an empty listener set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `activity_type`. Fails if a listener is
    /// already registered for that exact tag (supertype tags are not
    /// checked for conflicts: registering both `"Accept"` and
    /// `"TentativeAccept"` is fine).
    pub fn register(&mut self, activity_type: impl Into<String>, listener: Listener<T>) -> Result<(), DuplicateListener> {
        let activity_type = activity_type.into();
        if self.listeners.contains_key(&activity_type) {
            return Err(DuplicateListener(activity_type));
        }
        self.listeners.insert(activity_type, listener);
        Ok(())
    }

    /// Find the listener to invoke for an activity of type `kind`, walking
    /// its static supertype chain. `None` if no listener matches anywhere
    /// in the chain, including the `"Activity"` base.
    pub fn find(&self, kind: &str) -> Option<Listener<T>> {
        type_chain(kind).into_iter().find_map(|tag| self.listeners.get(&tag).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn listener(counter: Arc<AtomicUsize>) -> Listener<()> {
        Arc::new(move |_ctx| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    #[test]
    fn register_rejects_duplicate_tag() {
        let mut set: InboxListenerSet<()> = InboxListenerSet::new();
        set.register("Follow", listener(Arc::new(AtomicUsize::new(0)))).unwrap();
        let err = set.register("Follow", listener(Arc::new(AtomicUsize::new(0)))).unwrap_err();
        assert_eq!(err.0, "Follow");
    }

    #[test]
    fn find_walks_supertype_chain() {
        let mut set: InboxListenerSet<()> = InboxListenerSet::new();
        set.register("Accept", listener(Arc::new(AtomicUsize::new(0)))).unwrap();
        assert!(set.find("TentativeAccept").is_some());
        assert!(set.find("Follow").is_none());
    }

    #[test]
    fn find_falls_back_to_base_activity_listener() {
        let mut set: InboxListenerSet<()> = InboxListenerSet::new();
        set.register("Activity", listener(Arc::new(AtomicUsize::new(0)))).unwrap();
        assert!(set.find("SomeExtensionType").is_some());
    }
}
