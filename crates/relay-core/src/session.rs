//! One live connection and its two loops.
//!
//! A session reads frames from a [`FrameSource`] and hands data frames to
//! the hub, while writing its outbound queue and keepalive probes to a
//! [`FrameSink`]. Whichever loop ends first ends the session, but a frame
//! already handed to the hub is always routed to completion first.

use relay_protocol::Payload;
use relay_transport::{ConnectionId, FrameSink, FrameSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tracing::{debug, info, trace};

use crate::hub::{Hub, RouteOutcome, SessionHandle, DEFAULT_QUEUE_CAPACITY};
use crate::message::UserId;
use crate::ratelimit::RateLimiter;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Outbound queue capacity.
    pub queue_capacity: usize,
    /// Interval between keepalive probes.
    pub ping_interval: Duration,
    /// How long the peer may stay silent before it is considered dead.
    pub pong_wait: Duration,
    /// Data frames admitted per window.
    pub rate_limit: usize,
    /// Rate limit window.
    pub rate_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            ping_interval: Duration::from_secs(50),
            pong_wait: Duration::from_secs(60),
            rate_limit: 10,
            rate_window: Duration::from_secs(1),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the connection.
    PeerClosed,
    /// Reading from the transport failed.
    TransportError,
    /// Nothing was heard from the peer within the read deadline.
    ReadTimeout,
    /// Writing to the transport failed.
    WriteFailed,
    /// The hub closed the outbound queue.
    Evicted,
}

impl CloseReason {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::TransportError => "transport_error",
            CloseReason::ReadTimeout => "read_timeout",
            CloseReason::WriteFailed => "write_failed",
            CloseReason::Evicted => "evicted",
        }
    }
}

/// What happened during a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    /// Why the session ended.
    pub reason: CloseReason,
    /// Data frames read from the peer.
    pub frames: u64,
    /// Frames stored and routed.
    pub routed: u64,
    /// Frames over the rate limit.
    pub rate_limited: u64,
    /// Malformed, empty or oversized frames.
    pub dropped: u64,
    /// Frames the store failed to persist.
    pub persist_failed: u64,
    /// Payloads written to the peer.
    pub delivered: u64,
}

#[derive(Debug, Default)]
struct InboundStats {
    frames: u64,
    routed: u64,
    rate_limited: u64,
    dropped: u64,
    persist_failed: u64,
}

/// A registered connection that has not started its loops yet.
pub struct Session {
    hub: Arc<Hub>,
    handle: SessionHandle,
    outbound: mpsc::Receiver<Payload>,
    limiter: RateLimiter,
    config: SessionConfig,
}

impl Session {
    /// Create a session for `user` and register it with the hub.
    #[must_use]
    pub fn open(hub: Arc<Hub>, user: UserId, config: SessionConfig) -> Self {
        let (handle, outbound) = SessionHandle::new(user, config.queue_capacity);
        let registered = hub.register(handle.clone());
        debug_assert!(registered, "fresh session handle must register");

        Self {
            hub,
            handle,
            outbound,
            limiter: RateLimiter::new(config.rate_limit, config.rate_window),
            config,
        }
    }

    /// Get the session id.
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.handle.id()
    }

    /// Get the owning user.
    #[must_use]
    pub fn user(&self) -> UserId {
        self.handle.user()
    }

    /// Run both loops until one ends, then unregister and close the sink.
    pub async fn run<S, K>(self, mut source: S, mut sink: K) -> SessionSummary
    where
        S: FrameSource,
        K: FrameSink,
    {
        let Session {
            hub,
            handle,
            mut outbound,
            limiter,
            config,
        } = self;
        let user = handle.user();
        let id = handle.id();

        info!(user = %user, session = %id, "Session started");

        let mut inbound = InboundLoop {
            hub: &hub,
            user,
            key: user.to_string(),
            limiter: &limiter,
            pong_wait: config.pong_wait,
            stats: InboundStats::default(),
        };
        let mut delivered = 0;

        // The write loop only signals its end; the inbound loop stops at its
        // next read so a route in progress is never cancelled.
        let (writer_done_tx, writer_done_rx) = watch::channel(None);
        let writer = async {
            let reason =
                write_loop(&mut sink, &mut outbound, config.ping_interval, &mut delivered).await;
            writer_done_tx.send_replace(Some(reason));
            std::future::pending::<CloseReason>().await
        };

        let reason = tokio::select! {
            reason = inbound.run(&mut source, writer_done_rx) => reason,
            reason = writer => reason,
        };

        hub.unregister(&user, id);
        if let Err(e) = sink.close().await {
            trace!(session = %id, error = %e, "Close after session end failed");
        }

        let stats = inbound.stats;
        info!(
            user = %user,
            session = %id,
            reason = reason.as_str(),
            frames = stats.frames,
            delivered,
            "Session ended"
        );

        SessionSummary {
            reason,
            frames: stats.frames,
            routed: stats.routed,
            rate_limited: stats.rate_limited,
            dropped: stats.dropped,
            persist_failed: stats.persist_failed,
            delivered,
        }
    }
}

struct InboundLoop<'a> {
    hub: &'a Hub,
    user: UserId,
    key: String,
    limiter: &'a RateLimiter,
    pong_wait: Duration,
    stats: InboundStats,
}

impl InboundLoop<'_> {
    async fn run<S: FrameSource>(
        &mut self,
        source: &mut S,
        mut writer_done: watch::Receiver<Option<CloseReason>>,
    ) -> CloseReason {
        let mut deadline = Instant::now() + self.pong_wait;

        loop {
            let read = tokio::select! {
                biased;

                _ = writer_done.changed() => {
                    return (*writer_done.borrow()).unwrap_or(CloseReason::WriteFailed);
                }
                read = time::timeout_at(deadline, source.recv()) => read,
            };

            let frame = match read {
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => return CloseReason::PeerClosed,
                Ok(Err(e)) => {
                    debug!(user = %self.user, error = %e, "Read failed");
                    return CloseReason::TransportError;
                }
                Err(_) => {
                    debug!(user = %self.user, "Read deadline expired");
                    return CloseReason::ReadTimeout;
                }
            };

            // Any traffic proves the peer is alive
            deadline = Instant::now() + self.pong_wait;

            let Some(data) = frame.data() else {
                continue;
            };
            self.stats.frames += 1;

            if !self.limiter.allow(&self.key) {
                self.stats.rate_limited += 1;
                continue;
            }

            match self.hub.route_direct_message(&self.user, data).await {
                RouteOutcome::Delivered { .. } => self.stats.routed += 1,
                RouteOutcome::Dropped(_) => self.stats.dropped += 1,
                RouteOutcome::PersistFailed => self.stats.persist_failed += 1,
            }
        }
    }
}

async fn write_loop<K: FrameSink>(
    sink: &mut K,
    outbound: &mut mpsc::Receiver<Payload>,
    ping_interval: Duration,
    delivered: &mut u64,
) -> CloseReason {
    let mut ticker = time::interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        tokio::select! {
            biased;

            payload = outbound.recv() => {
                let Some(payload) = payload else {
                    return CloseReason::Evicted;
                };
                if let Err(e) = sink.send_text(&payload).await {
                    debug!(error = %e, "Write failed");
                    return CloseReason::WriteFailed;
                }
                *delivered += 1;
            }

            _ = ticker.tick() => {
                if let Err(e) = sink.send_ping().await {
                    debug!(error = %e, "Ping failed");
                    return CloseReason::WriteFailed;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{HistoryQuery, Message, MessageId};
    use crate::store::{MemoryStore, MessageStore, StoreError};
    use async_trait::async_trait;
    use relay_transport::memory::{self, MemoryPeer, Outbound};
    use tokio::task::JoinHandle;

    /// Commits writes on a spawned task, like a store backed by the blocking pool.
    struct DetachedStore {
        inner: Arc<MemoryStore>,
        delay: Duration,
    }

    #[async_trait]
    impl MessageStore for DetachedStore {
        async fn create(
            &self,
            sender: UserId,
            receiver: UserId,
            content: &str,
        ) -> Result<Message, StoreError> {
            let inner = Arc::clone(&self.inner);
            let delay = self.delay;
            let content = content.to_string();
            tokio::spawn(async move {
                time::sleep(delay).await;
                inner.create(sender, receiver, &content).await
            })
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
        }

        async fn edit(
            &self,
            id: MessageId,
            requester: UserId,
            content: &str,
        ) -> Result<Message, StoreError> {
            self.inner.edit(id, requester, content).await
        }

        async fn soft_delete(&self, id: MessageId, requester: UserId) -> Result<Message, StoreError> {
            self.inner.soft_delete(id, requester).await
        }

        async fn history(
            &self,
            a: UserId,
            b: UserId,
            query: &HistoryQuery,
        ) -> Result<Vec<Message>, StoreError> {
            self.inner.history(a, b, query).await
        }
    }

    fn hub() -> (Arc<MemoryStore>, Arc<Hub>) {
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(Hub::new(store.clone()));
        (store, hub)
    }

    fn spawn(hub: &Arc<Hub>, user: UserId) -> (ConnectionId, MemoryPeer, JoinHandle<SessionSummary>) {
        let session = Session::open(Arc::clone(hub), user, SessionConfig::default());
        let id = session.id();
        let (source, sink, peer) = memory::pair();
        (id, peer, tokio::spawn(session.run(source, sink)))
    }

    fn direct_message(to: UserId, content: &str) -> String {
        serde_json::json!({ "type": "direct_message", "to": to, "content": content }).to_string()
    }

    /// Next text frame, skipping keepalive probes.
    async fn next_text(peer: &mut MemoryPeer) -> Option<serde_json::Value> {
        loop {
            match peer.recv().await? {
                Outbound::Text(text) => return serde_json::from_str(&text).ok(),
                Outbound::Ping => continue,
                Outbound::Close => return None,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_registers() {
        let (_, hub) = hub();
        let user = UserId::random();

        let session = Session::open(Arc::clone(&hub), user, SessionConfig::default());
        assert!(hub.is_online(&user));
        assert_eq!(session.user(), user);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_to_two_sessions() {
        let (store, hub) = hub();
        let (alice, bob) = (UserId::random(), UserId::random());

        let (_, mut alice_peer, alice_task) = spawn(&hub, alice);
        let (_, mut bob_phone, _) = spawn(&hub, bob);
        let (_, mut bob_laptop, _) = spawn(&hub, bob);

        alice_peer.send_text(direct_message(bob, "hello"));

        let on_phone = next_text(&mut bob_phone).await.unwrap();
        let on_laptop = next_text(&mut bob_laptop).await.unwrap();
        assert_eq!(on_phone, on_laptop);
        assert_eq!(on_phone["content"], "hello");
        assert_eq!(on_phone["from"], alice.to_string());

        let history = store
            .history(alice, bob, &HistoryQuery::new())
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(on_phone["timestamp"], history[0].timestamp());

        alice_peer.disconnect();
        let summary = alice_task.await.unwrap();
        assert_eq!(summary.reason, CloseReason::PeerClosed);
        assert_eq!(summary.routed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_frames_dropped_connection_kept() {
        let (store, hub) = hub();
        let (alice, bob) = (UserId::random(), UserId::random());

        let (_, mut alice_peer, alice_task) = spawn(&hub, alice);
        let (_, mut bob_peer, _) = spawn(&hub, bob);

        for i in 0..15 {
            alice_peer.send_text(direct_message(bob, &format!("burst {i}")));
        }
        for i in 0..10 {
            let frame = next_text(&mut bob_peer).await.unwrap();
            assert_eq!(frame["content"], format!("burst {i}"));
        }

        // Still connected once the window has passed
        time::advance(Duration::from_millis(1100)).await;
        alice_peer.send_text(direct_message(bob, "after"));
        let frame = next_text(&mut bob_peer).await.unwrap();
        assert_eq!(frame["content"], "after");
        assert!(hub.is_online(&alice));
        assert_eq!(store.len(), 11);

        alice_peer.disconnect();
        let summary = alice_task.await.unwrap();
        assert_eq!(summary.frames, 16);
        assert_eq!(summary.routed, 11);
        assert_eq!(summary.rate_limited, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frames_keep_connection() {
        let (store, hub) = hub();
        let (alice, bob) = (UserId::random(), UserId::random());
        let (_, mut alice_peer, alice_task) = spawn(&hub, alice);
        let (_, mut bob_peer, _) = spawn(&hub, bob);

        alice_peer.send_text("garbage");
        alice_peer.send_text(r#"{"type":"typing"}"#);
        alice_peer.send_text(direct_message(bob, "fine"));

        let frame = next_text(&mut bob_peer).await.unwrap();
        assert_eq!(frame["content"], "fine");
        assert_eq!(store.len(), 1);

        alice_peer.disconnect();
        let summary = alice_task.await.unwrap();
        assert_eq!(summary.dropped, 2);
        assert_eq!(summary.routed, 1);
        assert!(alice_peer.drain_text().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_peer_times_out() {
        let (_, hub) = hub();
        let user = UserId::random();
        let (_, mut peer, task) = spawn(&hub, user);

        let summary = task.await.unwrap();
        assert_eq!(summary.reason, CloseReason::ReadTimeout);
        assert!(!hub.is_online(&user));

        // One probe at 50s, then the close at 60s
        assert_eq!(peer.try_recv(), Some(Outbound::Ping));
        assert_eq!(peer.try_recv(), Some(Outbound::Close));
        assert_eq!(peer.try_recv(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keeps_session_alive() {
        let (_, hub) = hub();
        let user = UserId::random();
        let (_, mut peer, task) = spawn(&hub, user);

        let started = Instant::now();
        for _ in 0..3 {
            assert_eq!(peer.recv().await, Some(Outbound::Ping));
            peer.send_pong();
        }
        assert!(started.elapsed() >= Duration::from_secs(150));
        assert!(hub.is_online(&user));

        peer.disconnect();
        assert_eq!(task.await.unwrap().reason, CloseReason::PeerClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_ends_session() {
        let (_, hub) = hub();
        let user = UserId::random();
        let (_, peer, task) = spawn(&hub, user);

        peer.send_error("connection reset");
        assert_eq!(task.await.unwrap().reason, CloseReason::TransportError);
        assert!(!hub.is_online(&user));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_ends_session() {
        let (_, hub) = hub();
        let user = UserId::random();
        let (id, mut peer, task) = spawn(&hub, user);

        assert!(hub.unregister(&user, id));
        let summary = task.await.unwrap();
        assert_eq!(summary.reason, CloseReason::Evicted);
        assert_eq!(peer.try_recv(), Some(Outbound::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_unregisters() {
        let (_, hub) = hub();
        let user = UserId::random();
        let (_, peer, task) = spawn(&hub, user);

        peer.fail_writes();
        let payload: Payload = Arc::from(r#"{"type":"message_deleted"}"#);
        assert_eq!(hub.broadcast_to_users(&[user], &payload), 1);

        let summary = task.await.unwrap();
        assert_eq!(summary.reason, CloseReason::WriteFailed);
        assert_eq!(summary.delivered, 0);
        assert!(!hub.is_online(&user));
    }

    #[tokio::test(start_paused = true)]
    async fn test_route_in_flight_finishes_after_write_failure() {
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(Hub::new(Arc::new(DetachedStore {
            inner: Arc::clone(&store),
            delay: Duration::from_millis(100),
        })));
        let (alice, bob) = (UserId::random(), UserId::random());
        let (_, alice_peer, alice_task) = spawn(&hub, alice);
        let (_, mut bob_peer, _) = spawn(&hub, bob);

        alice_peer.send_text(direct_message(bob, "in flight"));
        time::sleep(Duration::from_millis(10)).await;

        // Alice's own socket dies while her message is being stored
        alice_peer.fail_writes();
        let payload: Payload = Arc::from(r#"{"type":"message_deleted"}"#);
        assert_eq!(hub.broadcast_to_users(&[alice], &payload), 1);

        let summary = alice_task.await.unwrap();
        assert_eq!(summary.reason, CloseReason::WriteFailed);
        assert_eq!(summary.routed, 1);
        assert!(!hub.is_online(&alice));

        assert_eq!(store.len(), 1);
        let frame = next_text(&mut bob_peer).await.unwrap();
        assert_eq!(frame["content"], "in flight");
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_waits_for_route_in_flight() {
        let store = Arc::new(MemoryStore::new());
        let hub = Arc::new(Hub::new(Arc::new(DetachedStore {
            inner: Arc::clone(&store),
            delay: Duration::from_millis(100),
        })));
        let (alice, bob) = (UserId::random(), UserId::random());
        let (alice_id, alice_peer, alice_task) = spawn(&hub, alice);
        let (_, mut bob_peer, _) = spawn(&hub, bob);

        alice_peer.send_text(direct_message(bob, "still routed"));
        time::sleep(Duration::from_millis(10)).await;
        assert!(hub.unregister(&alice, alice_id));

        let summary = alice_task.await.unwrap();
        assert_eq!(summary.reason, CloseReason::Evicted);
        assert_eq!(summary.routed, 1);

        let frame = next_text(&mut bob_peer).await.unwrap();
        assert_eq!(frame["content"], "still routed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_sessions_survive() {
        let (_, hub) = hub();
        let user = UserId::random();
        let (_, mut first, first_task) = spawn(&hub, user);
        let (_, mut second, _) = spawn(&hub, user);

        first.disconnect();
        first_task.await.unwrap();
        assert_eq!(hub.session_count(&user), 1);

        let payload: Payload = Arc::from(r#"{"type":"message_deleted"}"#);
        assert_eq!(hub.broadcast_to_users(&[user], &payload), 1);
        assert_eq!(
            second.recv().await,
            Some(Outbound::Text(r#"{"type":"message_deleted"}"#.into()))
        );
        assert_eq!(first.try_recv(), Some(Outbound::Close));
    }
}
