//! UDP relay engine with NAT-style session tracking.
//!
//! Each client address gets a dedicated ephemeral socket connected to the
//! target, so replies can be routed back without parsing payloads. A session
//! is stored in the LRU table under two keys: the client address (forward
//! path) and the ephemeral socket's local address (reply path). Touching
//! either key refreshes the whole flow's recency.
//!
//! All table and pool mutation happens on one event-loop task. Listener and
//! ephemeral sockets each get a small receive task that forwards datagrams
//! into a bounded channel; when the channel is full the datagram is dropped,
//! which is the honest UDP overload behavior.

use crate::cache::LruCache;
use crate::config::{Binding, HostPort};
use crate::error::{ForwardError, Result};
use crate::logger::log;
use crate::pool::Pool;
use crate::stats::{format_bytes, whole_secs, RelayStats};
use bytes::Bytes;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Inbound events queued ahead of the engine loop. Receive tasks drop
/// datagrams rather than block when this backs up.
const INBOUND_CHANNEL_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Receive buffer per socket. Validated at startup to exceed the 65535
    /// byte datagram limit, so recv never truncates.
    pub buffer_size: usize,
    pub idle_timeout: Duration,
    pub idle_check_interval: Duration,
    pub stats_interval: Duration,
    /// Maximum tracked client flows. The session table stores two keys per
    /// flow, so its internal capacity is double this.
    pub conn_track_max: usize,
}

/// The two lookup paths into the session table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKey {
    /// Datagram arrived on a listener: keyed by the client's source address.
    Client(SocketAddr),
    /// Reply arrived on an ephemeral socket: keyed by its local address.
    Ephemeral(SocketAddr),
}

/// One tracked client flow. Immutable once published to the session table;
/// shells are recycled through the session pool between flows.
pub struct Session {
    client: SocketAddr,
    target: SocketAddr,
    ephemeral_addr: SocketAddr,
    listener: Option<Arc<UdpSocket>>,
    ephemeral: Option<Arc<UdpSocket>>,
    cancel: CancellationToken,
    /// First cleanup wins; the sibling-key eviction becomes a no-op.
    closed: AtomicBool,
    link_up: Instant,
    /// Bytes client -> target, registered under the client address.
    sent: Option<Arc<AtomicU64>>,
    /// Bytes target -> client, registered under the ephemeral address.
    received: Option<Arc<AtomicU64>>,
}

impl Session {
    fn blank() -> Self {
        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        Self {
            client: unspecified,
            target: unspecified,
            ephemeral_addr: unspecified,
            listener: None,
            ephemeral: None,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            link_up: Instant::now(),
            sent: None,
            received: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn init(
        &mut self,
        client: SocketAddr,
        target: SocketAddr,
        ephemeral_addr: SocketAddr,
        listener: Arc<UdpSocket>,
        ephemeral: Arc<UdpSocket>,
        cancel: CancellationToken,
        sent: Arc<AtomicU64>,
        received: Arc<AtomicU64>,
    ) {
        self.client = client;
        self.target = target;
        self.ephemeral_addr = ephemeral_addr;
        self.listener = Some(listener);
        self.ephemeral = Some(ephemeral);
        self.cancel = cancel;
        self.closed.store(false, Ordering::Release);
        self.link_up = Instant::now();
        self.sent = Some(sent);
        self.received = Some(received);
    }

    /// Soft reset on release back to the pool: drop socket and counter
    /// handles so a pooled shell pins no resources.
    fn clear(&mut self) {
        self.listener = None;
        self.ephemeral = None;
        self.sent = None;
        self.received = None;
    }
}

/// A datagram delivered to the engine loop by a receive task.
pub(crate) enum Inbound {
    /// From a client, via listener `listener_idx`.
    Client {
        listener_idx: usize,
        peer: SocketAddr,
        payload: Bytes,
    },
    /// From the target, via the ephemeral socket bound at `local`.
    Target { local: SocketAddr, payload: Bytes },
}

struct ListenerEntry {
    socket: Arc<UdpSocket>,
    target: HostPort,
    local: SocketAddr,
}

pub struct UdpEngine {
    cfg: UdpConfig,
    stats: Arc<RelayStats>,
    sessions: LruCache<SessionKey, Arc<Session>>,
    session_pool: Pool<Session>,
    socket_pool: Pool<Arc<UdpSocket>>,
    listeners: Vec<ListenerEntry>,
    inbound_tx: mpsc::Sender<Inbound>,
}

impl UdpEngine {
    pub(crate) fn new(cfg: UdpConfig, stats: Arc<RelayStats>) -> (Self, mpsc::Receiver<Inbound>) {
        let (tx, rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);
        let capacity = cfg.conn_track_max.saturating_mul(2);
        let pool_max = cfg.conn_track_max;
        let engine = Self {
            cfg,
            stats,
            sessions: LruCache::new(capacity),
            session_pool: Pool::new(pool_max).with_reset(Session::clear),
            socket_pool: Pool::new(pool_max),
            listeners: Vec::new(),
            inbound_tx: tx,
        };
        (engine, rx)
    }

    /// Bind a listener for one forwarding rule and start its receive task.
    /// Returns the bound local address.
    pub async fn add_listener(&mut self, binding: &Binding) -> Result<SocketAddr> {
        let socket = UdpSocket::bind((binding.bind.host.as_str(), binding.bind.port))
            .await
            .map_err(|e| ForwardError::Bind(format!("udp {}: {}", binding.bind, e)))?;
        let local = socket.local_addr()?;
        let socket = Arc::new(socket);
        let idx = self.listeners.len();
        tokio::spawn(listener_recv_loop(
            idx,
            socket.clone(),
            self.inbound_tx.clone(),
            self.cfg.buffer_size,
        ));
        log::info!(bind = %local, target = %binding.target, "UDP forwarding active");
        self.listeners.push(ListenerEntry {
            socket,
            target: binding.target.clone(),
            local,
        });
        Ok(local)
    }

    /// Run the engine until the process shuts down. All session state is
    /// owned here; receive tasks only feed the inbound channel.
    pub(crate) async fn event_loop(mut self, mut rx: mpsc::Receiver<Inbound>) {
        let mut idle_tick = interval(self.cfg.idle_check_interval);
        idle_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats_tick = interval(self.cfg.stats_interval);
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Consume the immediate first tick of each interval.
        idle_tick.tick().await;
        stats_tick.tick().await;

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(Inbound::Client { listener_idx, peer, payload }) => {
                        self.handle_client_datagram(listener_idx, peer, payload).await;
                    }
                    Some(Inbound::Target { local, payload }) => {
                        self.handle_target_datagram(local, payload).await;
                    }
                    None => return,
                },
                _ = idle_tick.tick() => self.evict_idle(),
                _ = stats_tick.tick() => self.report(),
            }
        }
    }

    /// A datagram from a client: forward through the flow's ephemeral socket,
    /// setting the session up first if this client is new (or was evicted).
    async fn handle_client_datagram(&mut self, listener_idx: usize, peer: SocketAddr, payload: Bytes) {
        let key = SessionKey::Client(peer);
        if let Some(session) = self.sessions.get(&key).cloned() {
            self.forward_to_target(&session, &payload).await;
            return;
        }
        self.setup_session(listener_idx, peer, payload).await;
    }

    /// A reply from the target: route back to the client recorded under the
    /// ephemeral socket's local address.
    async fn handle_target_datagram(&mut self, local: SocketAddr, payload: Bytes) {
        let key = SessionKey::Ephemeral(local);
        let Some(session) = self.sessions.get(&key).cloned() else {
            // The flow raced an eviction; nothing to route to.
            log::warn!(
                bytes = payload.len(),
                via = %local,
                "Dropping reply for unknown session, client might be evicted"
            );
            return;
        };
        let Some(listener) = session.listener.as_ref() else {
            return;
        };
        match listener.send_to(&payload, session.client).await {
            Ok(n) => {
                if let Some(counter) = &session.received {
                    counter.fetch_add(n as u64, Ordering::Relaxed);
                }
                self.stats.add_bytes(n as u64);
            }
            Err(e) => {
                log::warn!(
                    client = %session.client,
                    error = %e,
                    "Failed to write back to client, data might be lost"
                );
            }
        }
    }

    async fn forward_to_target(&self, session: &Session, payload: &[u8]) {
        let Some(socket) = session.ephemeral.as_ref() else {
            return;
        };
        match socket.send(payload).await {
            Ok(n) => {
                if let Some(counter) = &session.sent {
                    counter.fetch_add(n as u64, Ordering::Relaxed);
                }
                self.stats.add_bytes(n as u64);
            }
            Err(e) => {
                log::warn!(
                    target = %session.target,
                    error = %e,
                    "Failed to write to target, data might be lost"
                );
            }
        }
    }

    /// Build a session for a first-seen client and forward its datagram.
    /// Failures here drop the datagram; the client's retry starts over.
    async fn setup_session(&mut self, listener_idx: usize, peer: SocketAddr, payload: Bytes) {
        let (listener_socket, listener_local, target) = {
            let entry = &self.listeners[listener_idx];
            (entry.socket.clone(), entry.local, entry.target.clone())
        };
        let target_addr = match lookup_host((target.host.as_str(), target.port)).await {
            Ok(mut addrs) => match addrs.next() {
                Some(addr) => addr,
                None => {
                    log::warn!(target = %target, "Target resolved to no addresses");
                    return;
                }
            },
            Err(e) => {
                log::warn!(target = %target, error = %e, "Failed to resolve target");
                return;
            }
        };

        let ephemeral = match self.socket_pool.try_acquire() {
            Some(socket) => {
                // The kernel kept queuing the old target's datagrams while
                // the socket sat in the pool; flush them so they cannot leak
                // into this flow.
                drain_pending(&socket);
                socket
            }
            None => {
                let wildcard: SocketAddr = if listener_local.is_ipv6() {
                    "[::]:0".parse().unwrap_or(listener_local)
                } else {
                    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
                };
                match UdpSocket::bind(wildcard).await {
                    Ok(socket) => Arc::new(socket),
                    Err(e) => {
                        log::warn!(error = %e, "Failed to bind ephemeral socket");
                        return;
                    }
                }
            }
        };
        // Pooled sockets carry a stale association; connect() replaces it.
        if let Err(e) = ephemeral.connect(target_addr).await {
            log::warn!(target = %target_addr, error = %e, "Failed to connect ephemeral socket");
            self.socket_pool.release(ephemeral);
            return;
        }
        let ephemeral_addr = match ephemeral.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!(error = %e, "Failed to read ephemeral local address");
                return;
            }
        };

        let cancel = CancellationToken::new();
        tokio::spawn(ephemeral_recv_loop(
            ephemeral.clone(),
            ephemeral_addr,
            self.inbound_tx.clone(),
            cancel.clone(),
            self.cfg.buffer_size,
        ));

        let mut shell = self.session_pool.acquire_with(Session::blank);
        shell.init(
            peer,
            target_addr,
            ephemeral_addr,
            listener_socket,
            ephemeral,
            cancel,
            self.stats.register(peer),
            self.stats.register(ephemeral_addr),
        );
        let session = Arc::new(shell);

        // Dual insert. Either put can push out an old flow's key; its
        // cleanup then also drops the sibling key, so at most two distinct
        // flows are torn down here.
        let first = self.sessions.put(SessionKey::Client(peer), session.clone());
        let second = self
            .sessions
            .put(SessionKey::Ephemeral(ephemeral_addr), session.clone());
        let evicted: Vec<Arc<Session>> = [first, second].into_iter().flatten().collect();
        if !evicted.is_empty() {
            log::info!(
                count = evicted.len(),
                limit = self.cfg.conn_track_max,
                "Session table full, evicting oldest flows"
            );
            for old in evicted {
                self.cleanup_session(old, "capacity");
            }
        }

        self.stats.open_request();
        log::info!(
            client = %peer,
            target = %target_addr,
            via = %ephemeral_addr,
            "Pipe open"
        );
        self.forward_to_target(&session, &payload).await;
    }

    /// Tear a flow down: both table keys, both stats counters, the receive
    /// task, and the pooled resources. Safe to call once per key.
    fn cleanup_session(&mut self, session: Arc<Session>, reason: &str) {
        if !session.closed.swap(true, Ordering::AcqRel) {
            session.cancel.cancel();
            self.sessions.remove(&SessionKey::Client(session.client));
            self.sessions
                .remove(&SessionKey::Ephemeral(session.ephemeral_addr));

            let sent = session
                .sent
                .as_ref()
                .map(|c| c.load(Ordering::Relaxed))
                .unwrap_or(0);
            let received = session
                .received
                .as_ref()
                .map(|c| c.load(Ordering::Relaxed))
                .unwrap_or(0);
            log::info!(
                client = %session.client,
                target = %session.target,
                reason,
                "Pipe closed"
            );
            log::info!(
                client = %session.client,
                sent = %format_bytes(sent),
                received = %format_bytes(received),
                link_up = %humantime::format_duration(whole_secs(session.link_up.elapsed())),
                "Transfer stats"
            );

            self.stats.unregister(&session.client);
            self.stats.unregister(&session.ephemeral_addr);
            if let Some(socket) = session.ephemeral.clone() {
                self.socket_pool.release(socket);
            }
            self.stats.close_request();
        }
        // Whichever caller drops the last handle recycles the shell.
        if let Ok(shell) = Arc::try_unwrap(session) {
            self.session_pool.release(shell);
        }
    }

    /// Evict every flow idle past the timeout. The table is recency-ordered,
    /// so only the expired prefix is walked.
    fn evict_idle(&mut self) {
        let Some(watermark) = Instant::now().checked_sub(self.cfg.idle_timeout) else {
            return;
        };
        let expired = self.sessions.evict_before(watermark);
        if expired.is_empty() {
            return;
        }
        log::info!(
            count = expired.len(),
            timeout = %humantime::format_duration(self.cfg.idle_timeout),
            "Evicting idle UDP sessions"
        );
        for session in expired {
            self.cleanup_session(session, "idle");
        }
    }

    fn report(&self) {
        log::info!(
            proto = "udp",
            uptime = %humantime::format_duration(whole_secs(self.stats.uptime())),
            active = self.stats.active_requests(),
            total = self.stats.total_requests(),
            transferred = %format_bytes(self.stats.total_bytes()),
            session_pool_hit_rate = %format!("{:.2}", self.session_pool.hit_rate()),
            socket_pool_hit_rate = %format!("{:.2}", self.socket_pool.hit_rate()),
            "Status update"
        );
    }
}

/// Bind all listeners, then run the engine loop to completion.
pub async fn run(cfg: UdpConfig, stats: Arc<RelayStats>, bindings: Vec<Binding>) -> Result<()> {
    let (mut engine, rx) = UdpEngine::new(cfg, stats);
    for binding in &bindings {
        engine.add_listener(binding).await?;
    }
    engine.event_loop(rx).await;
    Ok(())
}

/// Discard every datagram already queued on a socket. A short scratch buffer
/// is enough: a truncated recv still dequeues the whole datagram.
fn drain_pending(socket: &UdpSocket) {
    let mut scratch = [0u8; 64];
    let mut discarded = 0usize;
    loop {
        match socket.try_recv(&mut scratch) {
            Ok(_) => discarded += 1,
            Err(_) => break,
        }
    }
    if discarded > 0 {
        log::debug!(count = discarded, "Discarded stale datagrams on pooled socket");
    }
}

/// Receive task for one listener socket. Lives for the process lifetime.
async fn listener_recv_loop(
    listener_idx: usize,
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<Inbound>,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                let payload = Bytes::copy_from_slice(&buf[..len]);
                match tx.try_send(Inbound::Client {
                    listener_idx,
                    peer,
                    payload,
                }) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        log::debug!(client = %peer, "Inbound channel full, dropping datagram");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                }
            }
            Err(e) => {
                log::warn!(error = %e, "Failed to receive on UDP listener");
            }
        }
    }
}

/// Receive task for one flow's ephemeral socket. Exits on cancellation when
/// the session is torn down; the socket itself survives in the pool.
async fn ephemeral_recv_loop(
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    tx: mpsc::Sender<Inbound>,
    cancel: CancellationToken,
    buffer_size: usize,
) {
    let mut buf = vec![0u8; buffer_size];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = socket.recv(&mut buf) => match result {
                Ok(len) => {
                    let payload = Bytes::copy_from_slice(&buf[..len]);
                    match tx.try_send(Inbound::Target { local, payload }) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            log::debug!(via = %local, "Inbound channel full, dropping reply");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return,
                    }
                }
                Err(e) => {
                    log::debug!(via = %local, error = %e, "Ephemeral socket receive error");
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    const RECV_TIMEOUT: Duration = Duration::from_secs(2);

    fn test_cfg(conn_track_max: usize, idle_timeout: Duration) -> UdpConfig {
        UdpConfig {
            buffer_size: 100_000,
            idle_timeout,
            idle_check_interval: Duration::from_millis(50),
            stats_interval: Duration::from_secs(3600),
            conn_track_max,
        }
    }

    async fn spawn_udp_echo() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..len], peer).await;
            }
        });
        addr
    }

    /// Port 0 means "any free port", which the operator-facing spec syntax
    /// rejects, so tests assemble the binding from its parts.
    fn binding_to(target: SocketAddr) -> Binding {
        Binding {
            bind: HostPort {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            target: HostPort {
                host: target.ip().to_string(),
                port: target.port(),
            },
        }
    }

    /// Engine with one listener pointed at a quiet target socket. Returns the
    /// target socket so tests can observe forwarded datagrams.
    async fn engine_with_listener(
        cfg: UdpConfig,
    ) -> (UdpEngine, mpsc::Receiver<Inbound>, UdpSocket) {
        let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let stats = Arc::new(RelayStats::new());
        let (mut engine, rx) = UdpEngine::new(cfg, stats);
        engine.add_listener(&binding_to(target_addr)).await.unwrap();
        (engine, rx, target)
    }

    #[tokio::test]
    async fn test_session_stored_under_both_keys() {
        let cfg = test_cfg(16, Duration::from_secs(3600));
        let (mut engine, _rx, target) = engine_with_listener(cfg).await;
        let client: SocketAddr = "127.0.0.1:41001".parse().unwrap();

        engine
            .handle_client_datagram(0, client, Bytes::from_static(b"hello"))
            .await;

        assert_eq!(engine.sessions.len(), 2);
        let session = engine
            .sessions
            .peek(&SessionKey::Client(client))
            .cloned()
            .unwrap();
        assert!(engine
            .sessions
            .peek(&SessionKey::Ephemeral(session.ephemeral_addr))
            .is_some());
        assert_eq!(engine.stats.active_requests(), 1);
        assert!(engine.stats.is_tracked(&client));
        assert!(engine.stats.is_tracked(&session.ephemeral_addr));

        // The first datagram was forwarded during setup.
        let mut buf = [0u8; 64];
        let (len, from) = timeout(RECV_TIMEOUT, target.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"hello");
        // The ephemeral socket is wildcard-bound, so only ports compare.
        assert_eq!(from.port(), session.ephemeral_addr.port());
    }

    #[tokio::test]
    async fn test_second_datagram_reuses_session() {
        let cfg = test_cfg(16, Duration::from_secs(3600));
        let (mut engine, _rx, target) = engine_with_listener(cfg).await;
        let client: SocketAddr = "127.0.0.1:41002".parse().unwrap();

        engine
            .handle_client_datagram(0, client, Bytes::from_static(b"one"))
            .await;
        engine
            .handle_client_datagram(0, client, Bytes::from_static(b"two"))
            .await;

        assert_eq!(engine.sessions.len(), 2);
        assert_eq!(engine.stats.total_requests(), 1);

        let mut buf = [0u8; 64];
        let (len, first_from) = timeout(RECV_TIMEOUT, target.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"one");
        let (len, second_from) = timeout(RECV_TIMEOUT, target.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"two");
        // Same ephemeral socket both times.
        assert_eq!(first_from, second_from);
    }

    #[tokio::test]
    async fn test_cleanup_removes_both_keys_and_recycles() {
        let cfg = test_cfg(16, Duration::from_secs(3600));
        let (mut engine, _rx, _target) = engine_with_listener(cfg).await;
        let client: SocketAddr = "127.0.0.1:41003".parse().unwrap();

        engine
            .handle_client_datagram(0, client, Bytes::from_static(b"x"))
            .await;
        let session = engine
            .sessions
            .remove(&SessionKey::Client(client))
            .unwrap();
        let ephemeral_addr = session.ephemeral_addr;
        engine.cleanup_session(session, "test");

        assert!(engine.sessions.is_empty());
        assert!(!engine.stats.is_tracked(&client));
        assert!(!engine.stats.is_tracked(&ephemeral_addr));
        assert_eq!(engine.stats.active_requests(), 0);
        // Both the socket and the session shell went back to their pools.
        assert_eq!(engine.socket_pool.size(), 1);
        assert_eq!(engine.session_pool.size(), 1);
    }

    #[tokio::test]
    async fn test_idle_eviction_returns_resources_to_pools() {
        let cfg = test_cfg(16, Duration::from_millis(50));
        let (mut engine, _rx, _target) = engine_with_listener(cfg).await;
        let client: SocketAddr = "127.0.0.1:41004".parse().unwrap();

        engine
            .handle_client_datagram(0, client, Bytes::from_static(b"x"))
            .await;
        assert_eq!(engine.sessions.len(), 2);

        tokio::time::sleep(Duration::from_millis(120)).await;
        engine.evict_idle();

        assert!(engine.sessions.is_empty());
        assert_eq!(engine.stats.active_requests(), 0);
        assert_eq!(engine.socket_pool.size(), 1);
        assert_eq!(engine.session_pool.size(), 1);

        // A new flow reuses the pooled shell and socket.
        let client2: SocketAddr = "127.0.0.1:41005".parse().unwrap();
        engine
            .handle_client_datagram(0, client2, Bytes::from_static(b"y"))
            .await;
        assert_eq!(engine.socket_pool.size(), 0);
        assert_eq!(engine.session_pool.size(), 0);
        assert!((engine.session_pool.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_one_sided_flow_ages_out_via_reply_key() {
        let cfg = test_cfg(16, Duration::from_millis(200));
        let (mut engine, _rx, _target) = engine_with_listener(cfg).await;
        let client: SocketAddr = "127.0.0.1:41006".parse().unwrap();

        engine
            .handle_client_datagram(0, client, Bytes::from_static(b"x"))
            .await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        // Only the client key is refreshed; the reply key keeps aging.
        engine
            .handle_client_datagram(0, client, Bytes::from_static(b"y"))
            .await;
        tokio::time::sleep(Duration::from_millis(120)).await;
        engine.evict_idle();

        // The stale reply key expires and takes the whole flow with it,
        // including the still-fresh client key.
        assert!(engine.sessions.is_empty());
        assert_eq!(engine.stats.active_requests(), 0);
    }

    #[tokio::test]
    async fn test_capacity_pressure_evicts_oldest_flow() {
        // One tracked flow max: table capacity 2, so a second client pushes
        // the first one's keys out entirely.
        let cfg = test_cfg(1, Duration::from_secs(3600));
        let (mut engine, _rx, _target) = engine_with_listener(cfg).await;
        let first: SocketAddr = "127.0.0.1:41007".parse().unwrap();
        let second: SocketAddr = "127.0.0.1:41008".parse().unwrap();

        engine
            .handle_client_datagram(0, first, Bytes::from_static(b"a"))
            .await;
        engine
            .handle_client_datagram(0, second, Bytes::from_static(b"b"))
            .await;

        assert_eq!(engine.sessions.len(), 2);
        assert!(engine.sessions.peek(&SessionKey::Client(first)).is_none());
        assert!(engine.sessions.peek(&SessionKey::Client(second)).is_some());
        assert_eq!(engine.stats.active_requests(), 1);
        assert!(!engine.stats.is_tracked(&first));
        // The evicted flow's shell was recycled.
        assert_eq!(engine.session_pool.size(), 1);
    }

    #[tokio::test]
    async fn test_stale_reply_is_dropped() {
        let cfg = test_cfg(16, Duration::from_secs(3600));
        let (mut engine, _rx, _target) = engine_with_listener(cfg).await;
        let unknown: SocketAddr = "127.0.0.1:41009".parse().unwrap();
        // No session registered under this address: the reply is dropped
        // without disturbing the table.
        engine
            .handle_target_datagram(unknown, Bytes::from_static(b"late"))
            .await;
        assert!(engine.sessions.is_empty());
    }

    #[tokio::test]
    async fn test_reused_socket_does_not_replay_stale_datagrams() {
        let cfg = test_cfg(16, Duration::from_secs(3600));
        let (mut engine, mut rx, target) = engine_with_listener(cfg).await;
        let first: SocketAddr = "127.0.0.1:41010".parse().unwrap();

        engine
            .handle_client_datagram(0, first, Bytes::from_static(b"hi"))
            .await;
        let session = engine.sessions.remove(&SessionKey::Client(first)).unwrap();
        let stale_port = session.ephemeral_addr.port();
        engine.cleanup_session(session, "test");
        assert_eq!(engine.socket_pool.size(), 1);
        // Let the cancelled receive task exit before the late reply lands.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A late reply reaches the pooled socket while no flow owns it.
        target
            .send_to(b"stale", ("127.0.0.1", stale_port))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // A new client reuses the pooled socket; its queue must come up
        // empty, or this client would read the previous flow's traffic.
        let second: SocketAddr = "127.0.0.1:41011".parse().unwrap();
        engine
            .handle_client_datagram(0, second, Bytes::from_static(b"fresh"))
            .await;
        assert_eq!(engine.socket_pool.size(), 0);
        let leaked = timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(leaked.is_err(), "stale datagram surfaced for the new flow");
    }

    #[tokio::test]
    async fn test_udp_round_trip() {
        let echo = spawn_udp_echo().await;
        let stats = Arc::new(RelayStats::new());
        let cfg = test_cfg(16, Duration::from_secs(3600));
        let (mut engine, rx) = UdpEngine::new(cfg, stats.clone());
        let listen_addr = engine.add_listener(&binding_to(echo)).await.unwrap();
        tokio::spawn(engine.event_loop(rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"ping", listen_addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (len, from) = timeout(RECV_TIMEOUT, client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"ping");
        // Replies come from the listener address, not the target.
        assert_eq!(from, listen_addr);

        client.send_to(b"pong", listen_addr).await.unwrap();
        let (len, _) = timeout(RECV_TIMEOUT, client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"pong");
        assert_eq!(stats.total_requests(), 1);
    }

    #[tokio::test]
    async fn test_two_clients_get_distinct_ephemeral_sockets() {
        let echo = spawn_udp_echo().await;
        let stats = Arc::new(RelayStats::new());
        let cfg = test_cfg(16, Duration::from_secs(3600));
        let (mut engine, rx) = UdpEngine::new(cfg, stats.clone());
        let listen_addr = engine.add_listener(&binding_to(echo)).await.unwrap();
        tokio::spawn(engine.event_loop(rx));

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.send_to(b"from-a", listen_addr).await.unwrap();
        b.send_to(b"from-b", listen_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = timeout(RECV_TIMEOUT, a.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"from-a");
        let (len, _) = timeout(RECV_TIMEOUT, b.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"from-b");
        assert_eq!(stats.total_requests(), 2);
    }

    #[tokio::test]
    async fn test_add_listener_bind_conflict() {
        let stats = Arc::new(RelayStats::new());
        let cfg = test_cfg(16, Duration::from_secs(3600));
        let (mut engine, _rx) = UdpEngine::new(cfg, stats);
        let target: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let first = engine.add_listener(&binding_to(target)).await.unwrap();
        let conflicting = Binding::parse(&format!("{}::{}", first, target)).unwrap();
        let err = engine.add_listener(&conflicting).await.unwrap_err();
        assert!(matches!(err, ForwardError::Bind(_)));
    }
}
