//! Transport session
//!
//! Owns the physical WebSocket for its lifetime: one spawned task drives a
//! `select!` loop over the outbound channel and the socket read half,
//! hands decoded frames to the router, and applies the bounded reconnect
//! policy on unexpected close. The socket itself sits behind the
//! `Dialer`/`Link` seam so tests substitute a scripted fake.

use crate::protocol::Inbound;
use crate::router::Router;
use crate::session::Update;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Reconnect attempts available for the lifetime of the process. The
/// budget is not replenished by a successful reconnect.
pub const RECONNECT_BUDGET: u32 = 5;

/// Fixed wait before each reconnect attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(3000);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
}

/// Connection lifecycle, surfaced to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
    Reconnecting { attempts_left: u32 },
    /// Terminal: the reconnect budget ran out. No further attempts.
    Exhausted,
}

/// What the read half produced.
#[derive(Debug)]
pub enum LinkEvent {
    Frame(String),
    Closed,
}

/// An open bidirectional connection.
#[async_trait]
pub trait Link: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;
    async fn recv(&mut self) -> LinkEvent;
}

/// Opens connections to a recorded target.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &str) -> Result<Box<dyn Link>, TransportError>;
}

/// The task that owns the link.
pub struct LinkTask {
    link: Option<Box<dyn Link>>,
    dialer: Arc<dyn Dialer>,
    /// Fully-qualified target recorded at connect time; reconnection
    /// reuses it without re-authenticating.
    target: String,
    attempts_left: u32,
    router: Router,
    outbound_rx: mpsc::Receiver<String>,
    updates: broadcast::Sender<Update>,
}

impl LinkTask {
    /// Spawn the task around an already-open link. The returned sender is
    /// the outbound half; dropping it stops the task.
    pub fn spawn(
        link: Box<dyn Link>,
        dialer: Arc<dyn Dialer>,
        target: String,
        router: Router,
        updates: broadcast::Sender<Update>,
    ) -> mpsc::Sender<String> {
        let (outbound_tx, outbound_rx) = mpsc::channel(32);
        let task = Self {
            link: Some(link),
            dialer,
            target,
            attempts_left: RECONNECT_BUDGET,
            router,
            outbound_rx,
            updates,
        };
        task.notify(LinkState::Connected);
        tokio::spawn(task.run());
        outbound_tx
    }

    async fn run(mut self) {
        loop {
            if let Some(mut link) = self.link.take() {
                tokio::select! {
                    maybe = self.outbound_rx.recv() => match maybe {
                        Some(text) => {
                            if let Err(e) = link.send(text).await {
                                // The close will surface on the read half.
                                tracing::warn!(error = %e, "frame send failed");
                            }
                            self.link = Some(link);
                        }
                        None => break,
                    },
                    event = link.recv() => match event {
                        LinkEvent::Frame(text) => {
                            self.handle_frame(&text);
                            self.link = Some(link);
                        }
                        LinkEvent::Closed => {
                            tracing::warn!("connection died");
                            self.notify(LinkState::Disconnected);
                        }
                    },
                }
            } else if self.attempts_left == 0 {
                tracing::error!(
                    budget = RECONNECT_BUDGET,
                    "reconnection budget exhausted, giving up"
                );
                self.notify(LinkState::Exhausted);
                self.drain_outbound().await;
                break;
            } else {
                self.notify(LinkState::Reconnecting {
                    attempts_left: self.attempts_left,
                });
                if !self.reconnect_delay().await {
                    break;
                }
                self.attempts_left -= 1;
                tracing::info!(attempts_left = self.attempts_left, "reconnect attempt");
                match self.dialer.dial(&self.target).await {
                    Ok(link) => {
                        self.link = Some(link);
                        self.notify(LinkState::Connected);
                    }
                    Err(e) => tracing::warn!(error = %e, "reconnect failed"),
                }
            }
        }
        tracing::debug!("link task stopped");
    }

    fn handle_frame(&self, text: &str) {
        tracing::debug!(frame = text, "received frame");
        match serde_json::from_str::<Inbound>(text) {
            Ok(frame) => self.router.route(frame),
            Err(e) => tracing::warn!(error = %e, "undecodable frame dropped"),
        }
    }

    /// Wait out the fixed delay, dropping (not queueing) anything the
    /// caller tries to send meanwhile. Returns false when the outbound
    /// channel closed.
    async fn reconnect_delay(&mut self) -> bool {
        let delay = tokio::time::sleep(RECONNECT_DELAY);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                () = &mut delay => return true,
                maybe = self.outbound_rx.recv() => match maybe {
                    Some(_) => tracing::warn!("no open connection, frame dropped"),
                    None => return false,
                },
            }
        }
    }

    async fn drain_outbound(&mut self) {
        while self.outbound_rx.recv().await.is_some() {
            tracing::warn!("connection exhausted, frame dropped");
        }
    }

    fn notify(&self, state: LinkState) {
        let _ = self.updates.send(Update::Link(state));
    }
}

// ============================================================================
// Production adapter
// ============================================================================

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// tokio-tungstenite-backed [`Dialer`].
pub struct WsDialer;

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, target: &str) -> Result<Box<dyn Link>, TransportError> {
        let (ws, _response) = connect_async(target)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Box::new(WsLink { ws }))
    }
}

struct WsLink {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WsLink {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.ws
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> LinkEvent {
        loop {
            match self.ws.next().await {
                Some(Ok(WsMessage::Text(text))) => return LinkEvent::Frame(text),
                Some(Ok(WsMessage::Close(_))) | None => return LinkEvent::Closed,
                Some(Ok(_)) => continue, // ping/pong/binary
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "socket read error");
                    return LinkEvent::Closed;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted links for transport and session tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// A link whose inbound side is fed by the test and whose outbound
    /// side is observed by it. Dropping the feed sender closes the link.
    pub struct FakeLink {
        pub incoming: mpsc::UnboundedReceiver<String>,
        pub outgoing: mpsc::UnboundedSender<String>,
    }

    impl FakeLink {
        /// Returns (link, feed-inbound, observe-outbound).
        pub fn pair() -> (
            Self,
            mpsc::UnboundedSender<String>,
            mpsc::UnboundedReceiver<String>,
        ) {
            let (feed_tx, incoming) = mpsc::unbounded_channel();
            let (outgoing, sent_rx) = mpsc::unbounded_channel();
            (Self { incoming, outgoing }, feed_tx, sent_rx)
        }
    }

    #[async_trait]
    impl Link for FakeLink {
        async fn send(&mut self, text: String) -> Result<(), TransportError> {
            self.outgoing
                .send(text)
                .map_err(|e| TransportError::Send(e.to_string()))
        }

        async fn recv(&mut self) -> LinkEvent {
            match self.incoming.recv().await {
                Some(text) => LinkEvent::Frame(text),
                None => LinkEvent::Closed,
            }
        }
    }

    /// Hands out pre-scripted links in order; dials fail once the script
    /// runs dry.
    pub struct FakeDialer {
        scripted: Mutex<VecDeque<FakeLink>>,
        pub dials: AtomicU32,
    }

    impl FakeDialer {
        pub fn new(links: Vec<FakeLink>) -> Self {
            Self {
                scripted: Mutex::new(links.into_iter().collect()),
                dials: AtomicU32::new(0),
            }
        }

        pub fn empty() -> Self {
            Self::new(Vec::new())
        }

        pub fn dial_count(&self) -> u32 {
            self.dials.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Dialer for FakeDialer {
        async fn dial(&self, _target: &str) -> Result<Box<dyn Link>, TransportError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            match self.scripted.lock().unwrap().pop_front() {
                Some(link) => Ok(Box::new(link)),
                None => Err(TransportError::Connect("connection refused".to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeDialer, FakeLink};
    use super::*;
    use crate::cache::CacheStore;
    use crate::correlate::{CorrelationKey, Delivery, PendingTable};
    use crate::stream::StreamAggregator;
    use serde_json::json;

    fn router_fixture() -> (Router, Arc<PendingTable>, broadcast::Sender<Update>) {
        let pending = Arc::new(PendingTable::new());
        let (updates, _) = broadcast::channel(128);
        let router = Router::new(
            pending.clone(),
            Arc::new(StreamAggregator::new()),
            Arc::new(CacheStore::in_memory()),
            updates.clone(),
        );
        (router, pending, updates)
    }

    async fn next_link_state(rx: &mut broadcast::Receiver<Update>) -> LinkState {
        loop {
            match rx.recv().await.unwrap() {
                Update::Link(state) => return state,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn inbound_frames_reach_the_router() {
        let (router, pending, updates) = router_fixture();
        let rx = pending.register_claimed(CorrelationKey::token("st-1"));

        let (link, feed, _sent) = FakeLink::pair();
        let _outbound = LinkTask::spawn(
            Box::new(link),
            Arc::new(FakeDialer::empty()),
            "wss://example/ws?session=s".to_string(),
            router,
            updates,
        );

        feed.send(
            json!({
                "type": "task_token",
                "id": "st-1",
                "chat_id": "c-1",
                "task_token": "opaque",
                "step_type": "statement",
                "ts": "t",
                "chat_ts": "t"
            })
            .to_string(),
        )
        .unwrap();

        assert!(matches!(rx.await.unwrap(), Delivery::Token(_)));
    }

    #[tokio::test]
    async fn outbound_frames_reach_the_link() {
        let (router, _pending, updates) = router_fixture();
        let (link, _feed, mut sent) = FakeLink::pair();
        let outbound = LinkTask::spawn(
            Box::new(link),
            Arc::new(FakeDialer::empty()),
            "wss://example/ws?session=s".to_string(),
            router,
            updates,
        );

        outbound.send("{\"action\":\"human_input\"}".to_string()).await.unwrap();
        assert_eq!(sent.recv().await.unwrap(), "{\"action\":\"human_input\"}");
    }

    #[tokio::test(start_paused = true)]
    async fn budget_of_five_allows_five_redials_then_exhausts() {
        let (router, _pending, updates) = router_fixture();
        let mut state_rx = updates.subscribe();

        // The initial link and all five scripted reconnect links close
        // immediately (their feed senders are dropped on the spot).
        let (initial, _, _) = FakeLink::pair();
        let scripted: Vec<FakeLink> = (0..RECONNECT_BUDGET)
            .map(|_| FakeLink::pair().0)
            .collect();
        let dialer = Arc::new(FakeDialer::new(scripted));

        let _outbound = LinkTask::spawn(
            Box::new(initial),
            dialer.clone(),
            "wss://example/ws?session=s".to_string(),
            router,
            updates,
        );

        assert_eq!(next_link_state(&mut state_rx).await, LinkState::Connected);
        for n in (1..=RECONNECT_BUDGET).rev() {
            assert_eq!(next_link_state(&mut state_rx).await, LinkState::Disconnected);
            assert_eq!(
                next_link_state(&mut state_rx).await,
                LinkState::Reconnecting { attempts_left: n }
            );
            assert_eq!(next_link_state(&mut state_rx).await, LinkState::Connected);
        }

        // The sixth close finds the budget spent: terminal, no sixth dial.
        assert_eq!(next_link_state(&mut state_rx).await, LinkState::Disconnected);
        assert_eq!(next_link_state(&mut state_rx).await, LinkState::Exhausted);
        assert_eq!(dialer.dial_count(), RECONNECT_BUDGET);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_dials_consume_the_budget_too() {
        let (router, _pending, updates) = router_fixture();
        let mut state_rx = updates.subscribe();

        let (initial, _, _) = FakeLink::pair();
        let dialer = Arc::new(FakeDialer::empty());

        let _outbound = LinkTask::spawn(
            Box::new(initial),
            dialer.clone(),
            "wss://example/ws?session=s".to_string(),
            router,
            updates,
        );

        loop {
            if next_link_state(&mut state_rx).await == LinkState::Exhausted {
                break;
            }
        }
        assert_eq!(dialer.dial_count(), RECONNECT_BUDGET);
    }

    #[tokio::test(start_paused = true)]
    async fn frames_sent_while_disconnected_are_dropped_not_queued() {
        let (router, _pending, updates) = router_fixture();
        let mut state_rx = updates.subscribe();

        let (initial, _, _) = FakeLink::pair();
        let (replacement, _feed, mut sent) = FakeLink::pair();
        let dialer = Arc::new(FakeDialer::new(vec![replacement]));

        let outbound = LinkTask::spawn(
            Box::new(initial),
            dialer,
            "wss://example/ws?session=s".to_string(),
            router,
            updates,
        );

        assert_eq!(next_link_state(&mut state_rx).await, LinkState::Connected);
        assert_eq!(next_link_state(&mut state_rx).await, LinkState::Disconnected);

        // Sent during the reconnect delay: dropped, never flushed later.
        outbound.send("stale".to_string()).await.unwrap();

        assert!(matches!(
            next_link_state(&mut state_rx).await,
            LinkState::Reconnecting { .. }
        ));
        assert_eq!(next_link_state(&mut state_rx).await, LinkState::Connected);

        outbound.send("fresh".to_string()).await.unwrap();
        assert_eq!(sent.recv().await.unwrap(), "fresh");
    }
}
