//! Client session facade
//!
//! One `Session` owns the pending-operation table, the stream aggregator,
//! the cache store, the topic book, and the per-chat turn phase: all the
//! shared state the correlator and the workflow touch. It exposes
//! the conversational operations on top of them. Collaborators (the HTTP
//! backend, the socket dialer, the durable stores) come in through traits;
//! `ProductionSession` pins the real adapters.

use crate::auth::{AuthError, Backend, HttpBackend, UserIdentity};
use crate::cache::{CacheBackend, CacheStore, CachedArtifact};
use crate::correlate::{CorrelationKey, Delivery, PendingTable};
use crate::protocol::{
    now_ts, Action, AssertionsFrame, CustomAssertionBody, Envelope, EvidenceFrame, HumanInputBody,
    ResolveTokenBody, TokenFrame,
};
use crate::router::Router;
use crate::stream::StreamAggregator;
use crate::topic::{Message, Topic, TopicBook, TopicStore};
use crate::transport::{Dialer, LinkState, LinkTask, TransportError, WsDialer};
use crate::workflow::{advance, TurnEvent, TurnPhase, WorkflowError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Everything a subscriber can observe live: stream progress, message and
/// phase changes, connection lifecycle.
#[derive(Debug, Clone)]
pub enum Update {
    Link(LinkState),
    StreamChunk { chat_id: String, text: String },
    StreamEnded { chat_id: String },
    MessageAdded { chat_id: String, message: Message },
    MessageRemoved { chat_id: String, message_id: String },
    MessagesTruncated { chat_id: String, kept: Vec<String> },
    PhaseChanged { chat_id: String, phase: TurnPhase },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error("backend request failed: {0}")]
    Backend(String),
    #[error("unknown chat: {0}")]
    UnknownChat(String),
    #[error("unknown message: {0}")]
    UnknownMessage(String),
}

/// The client core. Generic over its collaborators; see
/// [`ProductionSession`] for the wired-up variant.
pub struct Session<B, D> {
    backend: B,
    dialer: Arc<D>,
    ws_url: String,

    pending: Arc<PendingTable>,
    stream: Arc<StreamAggregator>,
    cache: Arc<CacheStore>,
    topics: TopicBook,
    phases: Mutex<HashMap<String, TurnPhase>>,

    updates: broadcast::Sender<Update>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    session_token: Mutex<Option<String>>,
    user: Mutex<Option<UserIdentity>>,
}

/// Session with the production adapters.
pub type ProductionSession = Session<HttpBackend, WsDialer>;

impl<B, D> Session<B, D>
where
    B: Backend,
    D: Dialer + 'static,
{
    /// Build the session and restore persisted state: the topic list, then
    /// the cached responses for every known topic.
    pub fn new(
        backend: B,
        dialer: D,
        ws_url: impl Into<String>,
        cache_backend: Arc<dyn CacheBackend>,
        topic_store: Arc<dyn TopicStore>,
    ) -> Self {
        let topics = TopicBook::load(topic_store);
        let cache = Arc::new(CacheStore::new(cache_backend));
        cache.restore(&topics.ids());

        let (updates, _) = broadcast::channel(128);
        Self {
            backend,
            dialer: Arc::new(dialer),
            ws_url: ws_url.into(),
            pending: Arc::new(PendingTable::new()),
            stream: Arc::new(StreamAggregator::new()),
            cache,
            topics,
            phases: Mutex::new(HashMap::new()),
            updates,
            outbound: Mutex::new(None),
            session_token: Mutex::new(None),
            user: Mutex::new(None),
        }
    }

    // ==================== Connection ====================

    /// Validate the session against the authenticator, then open the
    /// socket and start the link task. An authenticator error leaves the
    /// session unestablished; the caller must force a login flow.
    pub async fn connect(&self, session_token: &str) -> Result<UserIdentity, SessionError> {
        let user = self.backend.get_user().await?;
        tracing::info!(name = %user.name, "session validated");

        let target = format!("{}?session={}", self.ws_url, session_token);
        let link = self.dialer.dial(&target).await?;

        let router = Router::new(
            self.pending.clone(),
            self.stream.clone(),
            self.cache.clone(),
            self.updates.clone(),
        );
        let outbound_tx = LinkTask::spawn(
            link,
            self.dialer.clone(),
            target,
            router,
            self.updates.clone(),
        );

        *self.outbound.lock().unwrap() = Some(outbound_tx);
        *self.session_token.lock().unwrap() = Some(session_token.to_string());
        *self.user.lock().unwrap() = Some(user.clone());
        Ok(user)
    }

    /// Observe stream progress, message/phase changes and link state.
    pub fn subscribe(&self) -> broadcast::Receiver<Update> {
        self.updates.subscribe()
    }

    pub fn user(&self) -> Option<UserIdentity> {
        self.user.lock().unwrap().clone()
    }

    /// Live buffer of the in-progress statement, for progressive display.
    pub fn stream_snapshot(&self) -> String {
        self.stream.snapshot()
    }

    pub fn stream_active(&self) -> bool {
        self.stream.is_active()
    }

    // ==================== Topics ====================

    /// Create a chat session on the service and a matching local topic.
    pub async fn create_topic(&self, title: &str) -> Result<Topic, SessionError> {
        let chat = self
            .backend
            .create_chat(&now_ts())
            .await
            .map_err(SessionError::Backend)?;
        Ok(self.topics.add(&chat.id, title))
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.topics.list()
    }

    pub fn topic(&self, chat_id: &str) -> Option<Topic> {
        self.topics.get(chat_id)
    }

    pub fn rename_topic(&self, chat_id: &str, title: &str) -> bool {
        self.topics.rename(chat_id, title)
    }

    /// Delete a topic and prune its cached responses.
    pub fn delete_topic(&self, chat_id: &str) -> bool {
        let removed = self.topics.delete(chat_id);
        if removed {
            self.cache.remove_chat(chat_id);
            self.phases.lock().unwrap().remove(chat_id);
        }
        removed
    }

    pub fn delete_message(&self, chat_id: &str, message_id: &str) -> bool {
        let removed = self.topics.delete_message(chat_id, message_id);
        if removed {
            let _ = self.updates.send(Update::MessageRemoved {
                chat_id: chat_id.to_string(),
                message_id: message_id.to_string(),
            });
        }
        removed
    }

    /// Current turn phase for a chat.
    pub fn phase(&self, chat_id: &str) -> TurnPhase {
        self.phases
            .lock()
            .unwrap()
            .get(chat_id)
            .cloned()
            .unwrap_or_default()
    }

    // ==================== Workflow operations ====================

    /// Send a human utterance and wait for the streamed statement.
    pub async fn submit_utterance(
        &self,
        chat_id: &str,
        text: &str,
    ) -> Result<Message, SessionError> {
        if self.topics.get(chat_id).is_none() {
            return Err(SessionError::UnknownChat(chat_id.to_string()));
        }
        self.advance_phase(chat_id, TurnEvent::UtteranceSent)?;

        let extra = Uuid::new_v4().to_string();
        let rx = self.pending.register_claimed(CorrelationKey::content(&extra));

        self.push_message(chat_id, Message::user(text));
        self.topics.touch(chat_id);

        let now = now_ts();
        self.send_action(
            Action::HumanInput,
            &HumanInputBody {
                chat_id: chat_id.to_string(),
                chat_ts: now.clone(),
                ts: now,
                human_input: text.to_string(),
                extra,
            },
        );

        match rx.await {
            Ok(Delivery::Statement { id, text }) => {
                self.advance_phase(chat_id, TurnEvent::StatementArrived)?;
                let message = Message::bot(id, text);
                self.push_message(chat_id, message.clone());
                Ok(message)
            }
            Ok(other) => {
                tracing::warn!(?other, "utterance waiter resolved with a foreign kind");
                self.fail_turn(chat_id, "statement", "unexpected reply to utterance");
                Err(WorkflowError::Server("unexpected reply to utterance".to_string()).into())
            }
            Err(_) => Err(WorkflowError::Superseded.into()),
        }
    }

    /// Retrieve the continuation token for an artifact, from the cache (a
    /// reloaded client resumes purely from there) or from live delivery.
    pub async fn fetch_token(
        &self,
        chat_id: &str,
        artifact_id: &str,
    ) -> Result<TokenFrame, SessionError> {
        let key = CorrelationKey::token(artifact_id);
        if let Some(CachedArtifact::TaskToken(token)) = self.cache.get(chat_id, key.as_str()) {
            // The cached copy supersedes the live handoff; drop the parked
            // waiter so the key does not read as still-pending.
            let _ = self.pending.claim(&key);
            return Ok(token);
        }
        let Some(rx) = self.pending.claim(&key) else {
            return Err(WorkflowError::MissingToken(artifact_id.to_string()).into());
        };
        match rx.await {
            Ok(Delivery::Token(token)) => Ok(token),
            Ok(other) => {
                tracing::warn!(?other, "token waiter resolved with a foreign kind");
                Err(WorkflowError::Server("unexpected reply to token wait".to_string()).into())
            }
            Err(_) => Err(WorkflowError::Superseded.into()),
        }
    }

    /// Whether a continuation token for this artifact is in hand or on its
    /// way. This is the test that separates server-known assertions from
    /// free-typed ones.
    pub fn token_available(&self, chat_id: &str, artifact_id: &str) -> bool {
        let key = CorrelationKey::token(artifact_id);
        self.cache.contains(chat_id, key.as_str()) || self.pending.contains(&key)
    }

    /// Present the statement's token back and wait for the derived
    /// assertions. Presenting consumes the token.
    pub async fn request_assertions(
        &self,
        chat_id: &str,
        statement_id: &str,
    ) -> Result<AssertionsFrame, SessionError> {
        self.advance_phase(chat_id, TurnEvent::TokenRequested)?;
        let token = match self.fetch_token(chat_id, statement_id).await {
            Ok(token) => token,
            Err(e) => {
                self.fail_turn(chat_id, statement_id, &e.to_string());
                return Err(e);
            }
        };
        self.advance_phase(chat_id, TurnEvent::TokenArrived)?;

        let rx = self
            .pending
            .register_claimed(CorrelationKey::content(statement_id));
        self.cache
            .delete_one(chat_id, CorrelationKey::token(statement_id).as_str());

        let now = now_ts();
        self.send_action(
            Action::TaskToken,
            &ResolveTokenBody {
                ts: now.clone(),
                chat_ts: now,
                id: statement_id.to_string(),
                chat_id: chat_id.to_string(),
                task_token: token.task_token,
            },
        );
        self.advance_phase(chat_id, TurnEvent::TokenPresented)?;

        match rx.await {
            Ok(Delivery::Assertions(frame)) => {
                if let Some(error) = frame.error.clone() {
                    self.fail_turn(chat_id, statement_id, &error);
                    return Err(WorkflowError::Server(error).into());
                }
                self.advance_phase(chat_id, TurnEvent::AssertionsArrived)?;
                Ok(frame)
            }
            Ok(other) => {
                tracing::warn!(?other, "assertions waiter resolved with a foreign kind");
                self.fail_turn(chat_id, statement_id, "unexpected reply to token");
                Err(WorkflowError::Server("unexpected reply to token".to_string()).into())
            }
            Err(_) => Err(WorkflowError::Superseded.into()),
        }
    }

    /// Derive evidence for an assertion. A server-known assertion (token
    /// in hand or pending) presents that token; a free-typed one submits
    /// the text as a custom assertion, correlated by its own id.
    pub async fn request_evidence(
        &self,
        chat_id: &str,
        assertion_id: &str,
        assertion_text: &str,
        statement_id: Option<&str>,
    ) -> Result<EvidenceFrame, SessionError> {
        let token_key = CorrelationKey::token(assertion_id);
        let server_known = self.token_available(chat_id, assertion_id);

        let (rx, custom) = if server_known {
            self.advance_phase(chat_id, TurnEvent::EvidenceTokenRequested)?;
            let token = match self.fetch_token(chat_id, assertion_id).await {
                Ok(token) => token,
                Err(e) => {
                    self.fail_turn(chat_id, assertion_id, &e.to_string());
                    return Err(e);
                }
            };
            self.advance_phase(chat_id, TurnEvent::EvidenceTokenArrived)?;

            let rx = self
                .pending
                .register_claimed(CorrelationKey::content(assertion_id));
            self.cache.delete_one(chat_id, token_key.as_str());

            let now = now_ts();
            self.send_action(
                Action::TaskToken,
                &ResolveTokenBody {
                    ts: now.clone(),
                    chat_ts: now,
                    id: assertion_id.to_string(),
                    chat_id: chat_id.to_string(),
                    task_token: token.task_token,
                },
            );
            self.advance_phase(chat_id, TurnEvent::EvidenceTokenPresented)?;
            (rx, false)
        } else {
            self.advance_phase(chat_id, TurnEvent::CustomAssertionSent)?;
            self.push_message(chat_id, Message::user(assertion_text));
            self.topics.touch(chat_id);

            let rx = self
                .pending
                .register_claimed(CorrelationKey::content(assertion_id));
            if let Some(statement_id) = statement_id {
                self.cache
                    .append_assertion(chat_id, statement_id, assertion_id, assertion_text);
            }

            let now = now_ts();
            self.send_action(
                Action::CustomAssertion,
                &CustomAssertionBody {
                    chat_id: chat_id.to_string(),
                    chat_ts: now.clone(),
                    ts: now,
                    assertion: assertion_text.to_string(),
                    extra: assertion_id.to_string(),
                    statement_id: statement_id.map(String::from),
                },
            );
            (rx, true)
        };

        match rx.await {
            Ok(Delivery::Evidence(frame)) => {
                if let Some(error) = frame.error.clone() {
                    self.fail_turn(chat_id, &frame.id, &error);
                    return Err(WorkflowError::Server(error).into());
                }
                self.advance_phase(chat_id, TurnEvent::EvidenceArrived)?;
                if custom {
                    if let Some(evidence) = frame.evidence.clone() {
                        self.push_message(
                            chat_id,
                            Message::evidence(
                                &frame.id,
                                format!("Assertion: {assertion_text}"),
                                evidence,
                            ),
                        );
                    }
                }
                Ok(frame)
            }
            Ok(other) => {
                tracing::warn!(?other, "evidence waiter resolved with a foreign kind");
                self.fail_turn(chat_id, assertion_id, "unexpected reply to evidence request");
                Err(WorkflowError::Server("unexpected reply to evidence request".to_string()).into())
            }
            Err(_) => Err(WorkflowError::Superseded.into()),
        }
    }

    /// Edit a prior user message: truncate the conversation there, prune
    /// cache entries for the discarded tail, and resubmit from `Idle`.
    pub async fn edit_message(
        &self,
        chat_id: &str,
        message_id: &str,
        new_text: &str,
    ) -> Result<Message, SessionError> {
        let kept = self
            .topics
            .truncate_at(chat_id, message_id)
            .ok_or_else(|| SessionError::UnknownMessage(message_id.to_string()))?;
        self.cache.retain_only(chat_id, &kept);
        let _ = self.updates.send(Update::MessagesTruncated {
            chat_id: chat_id.to_string(),
            kept,
        });

        self.set_phase(chat_id, TurnPhase::Idle);
        self.submit_utterance(chat_id, new_text).await
    }

    // ==================== Internals ====================

    /// Encode and hand a frame to the link task. Fire-and-forget: with no
    /// open session the frame is dropped, per the no-queueing contract.
    fn send_action<T: Serialize>(&self, action: Action, body: &T) {
        let Some(tx) = self.outbound.lock().unwrap().clone() else {
            tracing::warn!(action = action.as_str(), "no open session, frame dropped");
            return;
        };
        let Some(session) = self.session_token.lock().unwrap().clone() else {
            tracing::warn!(action = action.as_str(), "no session token, frame dropped");
            return;
        };
        let body = match serde_json::to_string(body) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = %e, "body encode failed, frame dropped");
                return;
            }
        };
        tracing::debug!(action = action.as_str(), body = %body, "sending frame");
        let envelope = Envelope {
            action,
            session,
            body,
        };
        match serde_json::to_string(&envelope) {
            Ok(text) => {
                if tx.try_send(text).is_err() {
                    tracing::warn!(action = action.as_str(), "link task unavailable, frame dropped");
                }
            }
            Err(e) => tracing::warn!(error = %e, "envelope encode failed, frame dropped"),
        }
    }

    fn advance_phase(&self, chat_id: &str, event: TurnEvent) -> Result<(), SessionError> {
        let next = {
            let mut phases = self.phases.lock().unwrap();
            let current = phases.get(chat_id).cloned().unwrap_or_default();
            let next = advance(&current, event)?;
            phases.insert(chat_id.to_string(), next.clone());
            next
        };
        let _ = self.updates.send(Update::PhaseChanged {
            chat_id: chat_id.to_string(),
            phase: next,
        });
        Ok(())
    }

    fn set_phase(&self, chat_id: &str, phase: TurnPhase) {
        self.phases
            .lock()
            .unwrap()
            .insert(chat_id.to_string(), phase.clone());
        let _ = self.updates.send(Update::PhaseChanged {
            chat_id: chat_id.to_string(),
            phase,
        });
    }

    /// Surface a failed leg: inline error message, turn back to `Idle`.
    fn fail_turn(&self, chat_id: &str, artifact_id: &str, message: &str) {
        tracing::warn!(chat_id, artifact_id, error = message, "workflow leg failed");
        self.set_phase(chat_id, TurnPhase::Idle);
        self.push_message(chat_id, Message::error(artifact_id, message));
    }

    fn push_message(&self, chat_id: &str, message: Message) {
        self.topics.push_message(chat_id, message.clone());
        let _ = self.updates.send(Update::MessageAdded {
            chat_id: chat_id.to_string(),
            message,
        });
    }
}
