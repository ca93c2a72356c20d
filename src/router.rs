//! Inbound frame router
//!
//! Decodes arrive upstream; this layer takes a typed frame and dispatches
//! on its kind: resolve the matching pending operation, drive the stream
//! aggregator, write through to the cache. Late and duplicate frames are
//! expected under reconnection, so a resolution with no waiter is a no-op,
//! never an error.

use crate::cache::{CacheStore, CachedArtifact};
use crate::correlate::{CorrelationKey, Delivery, PendingTable};
use crate::protocol::Inbound;
use crate::session::Update;
use crate::stream::StreamAggregator;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct Router {
    pending: Arc<PendingTable>,
    stream: Arc<StreamAggregator>,
    cache: Arc<CacheStore>,
    updates: broadcast::Sender<Update>,
}

impl Router {
    pub fn new(
        pending: Arc<PendingTable>,
        stream: Arc<StreamAggregator>,
        cache: Arc<CacheStore>,
        updates: broadcast::Sender<Update>,
    ) -> Self {
        Self {
            pending,
            stream,
            cache,
            updates,
        }
    }

    /// Dispatch one inbound frame. Exhaustive over the frame kinds; a kind
    /// with no handling is dropped here, visibly.
    pub fn route(&self, frame: Inbound) {
        match frame {
            Inbound::TaskToken(frame) => {
                tracing::debug!(id = %frame.id, chat_id = %frame.chat_id, "task token frame");
                let key = CorrelationKey::token(&frame.id);
                self.cache.put(
                    &frame.chat_id,
                    key.as_str(),
                    CachedArtifact::TaskToken(frame.clone()),
                );
                self.pending.resolve(&key, Delivery::Token(frame));
            }

            Inbound::Stream(frame) => {
                self.stream.begin();
                self.stream.append(&frame.message);
                let _ = self.updates.send(Update::StreamChunk {
                    chat_id: frame.chat_id.clone(),
                    text: frame.message.clone(),
                });

                // Empty chunk is the end-of-stream sentinel; a sentinel
                // with nothing accumulated finalizes nothing.
                if frame.message.is_empty() {
                    if let Some(text) = self.stream.finish() {
                        tracing::debug!(id = %frame.id, "stream finalized");
                        // The next leg of the chain waits on this
                        // statement's token; arm it before waking the
                        // utterance's waiter.
                        self.pending.register(CorrelationKey::token(&frame.id));
                        self.pending.resolve(
                            &CorrelationKey::content(&frame.extra),
                            Delivery::Statement {
                                id: frame.id,
                                text,
                            },
                        );
                        let _ = self.updates.send(Update::StreamEnded {
                            chat_id: frame.chat_id,
                        });
                    }
                }
            }

            Inbound::Assertions(frame) => {
                tracing::debug!(
                    statement_id = %frame.statement_id,
                    error = frame.is_error(),
                    "assertions frame"
                );
                if !frame.is_error() {
                    self.cache.put(
                        &frame.chat_id,
                        &frame.statement_id,
                        CachedArtifact::Assertions(frame.clone()),
                    );
                    // Every produced assertion gets an evidence-token
                    // waiter so the subsequent delivery has somewhere to
                    // land.
                    for id in &frame.ids {
                        self.pending.register(CorrelationKey::token(id));
                    }
                }
                let key = CorrelationKey::content(&frame.statement_id);
                self.pending.resolve(&key, Delivery::Assertions(frame));
            }

            Inbound::Evidence(frame) => {
                // `extra` marks evidence for a free-typed assertion; the
                // listed path correlates by the assertion id.
                let key = frame.correlation_id().to_string();
                tracing::debug!(%key, "evidence frame");
                self.cache
                    .put(&frame.chat_id, &key, CachedArtifact::Evidence(frame.clone()));
                self.pending
                    .resolve(&CorrelationKey::content(&key), Delivery::Evidence(frame));
            }

            Inbound::Statement(frame) => {
                // Statements travel as streams; the whole-statement frame
                // is a legacy kind and is dropped.
                tracing::debug!(id = %frame.id, "dropping legacy statement frame");
            }
        }
    }
}
