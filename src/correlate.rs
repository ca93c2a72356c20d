//! Correlation keys and the pending-operation table
//!
//! Every outbound request that expects an asynchronous answer registers a
//! single-resolution waiter here, keyed by an opaque correlation key. The
//! router resolves waiters as frames arrive; the workflow layer claims the
//! receiving half when it is ready to wait. Resolution is a one-shot send,
//! so a waiter can observe its answer exactly once.

use crate::protocol::{AssertionsFrame, EvidenceFrame, TokenFrame};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::oneshot;

const TOKEN_SUFFIX: &str = "token";

/// Opaque identifier linking one outbound request to its inbound answer.
///
/// Content keys name a conversational artifact; token keys name the
/// continuation-token handoff for that artifact. Both derive from the same
/// base id, and the fixed suffix keeps the two namespaces disjoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    /// Key for the artifact itself.
    pub fn content(id: &str) -> Self {
        Self(id.to_string())
    }

    /// Key for the artifact's continuation-token handoff.
    pub fn token(id: &str) -> Self {
        Self(format!("{id}-{TOKEN_SUFFIX}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload a resolved waiter observes.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// A statement assembled by the stream aggregator.
    Statement { id: String, text: String },
    Token(TokenFrame),
    Assertions(AssertionsFrame),
    Evidence(EvidenceFrame),
}

/// Mapping from correlation key to a parked single-resolution waiter.
///
/// Registration is last-register-wins: re-registering a key drops the
/// previous resolver, silently orphaning any waiter still holding the old
/// receiver. Resolving a key nobody registered is a no-op.
#[derive(Default)]
pub struct PendingTable {
    resolvers: Mutex<HashMap<CorrelationKey, oneshot::Sender<Delivery>>>,
    parked: Mutex<HashMap<CorrelationKey, oneshot::Receiver<Delivery>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a waiter for `key`, parking the receiving half for a later
    /// [`claim`](Self::claim).
    pub fn register(&self, key: CorrelationKey) {
        let (tx, rx) = oneshot::channel();
        self.resolvers.lock().unwrap().insert(key.clone(), tx);
        self.parked.lock().unwrap().insert(key, rx);
    }

    /// Arm a waiter for `key` and hand the receiving half straight to the
    /// caller, for requests whose issuer awaits the answer itself.
    pub fn register_claimed(&self, key: CorrelationKey) -> oneshot::Receiver<Delivery> {
        let (tx, rx) = oneshot::channel();
        self.resolvers.lock().unwrap().insert(key.clone(), tx);
        self.parked.lock().unwrap().remove(&key);
        rx
    }

    /// Take the parked receiver for `key`, if one was registered and not
    /// yet claimed.
    pub fn claim(&self, key: &CorrelationKey) -> Option<oneshot::Receiver<Delivery>> {
        self.parked.lock().unwrap().remove(key)
    }

    /// Resolve the waiter registered under `key`, if any. Returns whether a
    /// waiter was resolved; a miss leaves every other entry untouched.
    pub fn resolve(&self, key: &CorrelationKey, delivery: Delivery) -> bool {
        let Some(tx) = self.resolvers.lock().unwrap().remove(key) else {
            tracing::debug!(%key, "no waiter for frame, dropping");
            return false;
        };
        // The claimed receiver may itself have been dropped; that is the
        // same late-frame situation and equally ignorable.
        tx.send(delivery).is_ok()
    }

    /// Whether a waiter (claimed or parked) is outstanding for `key`.
    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.resolvers.lock().unwrap().contains_key(key)
            || self.parked.lock().unwrap().contains_key(key)
    }
}
