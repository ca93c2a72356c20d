//! Client core for the veritas statement-validation chat service
//!
//! Turns one multiplexed WebSocket into independent, typed
//! request/response conversations: a correlation engine parks a
//! single-resolution waiter per outbound request and resolves it from the
//! matching inbound frame, while a workflow layer walks the
//! utterance → statement → token → assertions → token → evidence chain.
//! Completed responses are written through to a durable cache so a
//! reloaded client resumes an in-progress token chain without re-issuing
//! requests.

pub mod auth;
pub mod cache;
pub mod correlate;
pub mod db;
pub mod protocol;
pub mod router;
pub mod session;
pub mod stream;
pub mod topic;
pub mod transport;
pub mod workflow;

pub use auth::{AuthError, Backend, HttpBackend, UserIdentity};
pub use session::{ProductionSession, Session, SessionError, Update};
pub use topic::{Message, Topic};
pub use transport::{LinkState, WsDialer};
pub use workflow::{TurnPhase, WorkflowError};
