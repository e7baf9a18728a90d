//! Pluggable outgoing-activity delivery queue
//!
//! Sending an activity to a remote inbox can fail transiently (the remote
//! server is down, overloaded, or mid-deploy); the federation engine hands
//! each delivery off to a [`MessageQueue`] so that failures are retried in
//! the background rather than blocking the request that triggered them.
//! Host applications are expected to back this with durable storage
//! (a database table, a message broker); this crate ships an in-memory,
//! parallel-worker reference implementation for tests and small
//! deployments.
//!
//! `enqueue` and `listen` are deliberately separate: a queue can be built
//! (and started accepting messages) before its consumer is known, which is
//! what lets the inbox pipeline and the outbox pipeline share the same
//! abstraction even though only [`crate::federation::Federation`] can build
//! an inbox handler (it needs `&Federation` to dispatch to listeners) while
//! only a [`crate::context::Context`] is needed to build an outbox handler.

mod worker;

pub use worker::ParallelWorkerQueue;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use url::Url;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A signing key carried alongside a queued outbox delivery, so a worker can
/// produce (or reproduce, on retry) a valid HTTP Signature without needing
/// to go back through the actor key-pairs dispatcher.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedSigningKey {
    /// `keyId` to sign with, e.g. `{actor_id}#main-key`
    pub key_id: Url,
    /// PKCS#8 PEM private key matching `key_id`
    pub private_key_pem: String,
}

/// A single outgoing delivery: an already-serialized, already-signed
/// activity body destined for one recipient inbox.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// id of the activity being delivered, used for logging
    pub activity_id: Url,
    /// Destination inbox URL
    pub inbox: Url,
    /// Signed, ready-to-send JSON body
    pub body: Vec<u8>,
    /// Actor id the activity is signed as
    pub signed_by: Url,
    /// Key material to (re-)sign the HTTP request with at delivery time.
    /// Absent for inbox messages, which don't produce an outgoing signature.
    pub signing_key: Option<QueuedSigningKey>,
    /// Precomputed `Collection-Synchronization` header value, set when this
    /// delivery went to a shared inbox chosen during `"followers"` recipient
    /// expansion.
    pub collection_sync: Option<String>,
}

/// Invoked once per message a [`MessageQueue::listen`] loop dequeues.
pub type QueueHandler = Arc<dyn Fn(QueuedMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Cancels a running [`MessageQueue::listen`] loop. Cheap to clone; every
/// clone shares the same underlying signal, so cancelling through any one of
/// them stops the loop.
#[derive(Clone, Default)]
pub struct Cancellation(Arc<Notify>);

impl Cancellation {
    /// Build a cancellation signal that hasn't fired yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.notify_waiters();
    }

    pub(crate) async fn cancelled(&self) {
        self.0.notified().await;
    }
}

/// Pluggable delivery queue. Implementations own retry scheduling;
/// [`MessageQueue::enqueue`] returning `Ok` only means the message was
/// accepted for delivery, not that it was delivered.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Accept a message for delivery, to be sent now or retried later.
    async fn enqueue(&self, message: QueuedMessage) -> anyhow::Result<()>;

    /// Start consuming messages, invoking `handler` once per delivery
    /// attempt. Resolves (does not fail) once `cancel` fires; in-flight
    /// handler calls are allowed to finish. Calling this more than once on
    /// the same queue is a no-op after the first call.
    async fn listen(&self, handler: QueueHandler, cancel: Cancellation);
}
