//! TCP relay engine.
//!
//! One listener per binding. Each accepted client gets a flow task that
//! issues the outbound connect, then pumps bytes in both directions with
//! per-flow buffers. A flow performs one bounded read followed by a full
//! flush of that chunk before reading again, so a saturated peer can never
//! queue more than one buffer of data inside the forwarder. End-of-stream or
//! an I/O error on either direction tears down both sockets through the
//! single cleanup path at the end of the flow task; failures never propagate
//! past it.

use crate::config::{Binding, HostPort};
use crate::error::{ForwardError, Result};
use crate::logger::log;
use crate::stats::{format_bytes, whole_secs, RelayStats};

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub buffer_size: usize,
    pub connect_timeout: Duration,
    pub stats_interval: Duration,
}

pub struct TcpEngine {
    cfg: TcpConfig,
    stats: Arc<RelayStats>,
}

impl TcpEngine {
    pub fn new(cfg: TcpConfig, stats: Arc<RelayStats>) -> Self {
        Self { cfg, stats }
    }

    /// Bind every listener up front, then serve them until shutdown.
    /// Any bind failure is fatal before any traffic is accepted.
    pub async fn run(self, bindings: Vec<Binding>) -> Result<()> {
        let mut listeners = Vec::with_capacity(bindings.len());
        for binding in &bindings {
            let listener = Self::bind(&binding.bind).await?;
            log::info!(bind = %binding.bind, target = %binding.target, "Bound TCP listener");
            listeners.push((listener, binding.target.clone()));
        }

        let mut tasks = JoinSet::new();
        tasks.spawn(report_loop(
            Arc::clone(&self.stats),
            self.cfg.stats_interval,
        ));
        for (listener, target) in listeners {
            let cfg = self.cfg.clone();
            let stats = Arc::clone(&self.stats);
            tasks.spawn(serve_listener(listener, target, cfg, stats));
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    pub async fn bind(bind: &HostPort) -> Result<TcpListener> {
        TcpListener::bind((bind.host.as_str(), bind.port))
            .await
            .map_err(|e| ForwardError::Bind(format!("{}: {}", bind, e)))
    }
}

/// Accept loop for one listener. Accept failures are logged and the loop
/// keeps serving; they only affect the connection that failed.
pub(crate) async fn serve_listener(
    listener: TcpListener,
    target: HostPort,
    cfg: TcpConfig,
    stats: Arc<RelayStats>,
) {
    loop {
        let (client, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                log::warn!(error = %e, "Failed to accept a connection");
                continue;
            }
        };
        log::debug!(client = %peer, "Accepted new incoming connection");
        let target = target.clone();
        let cfg = cfg.clone();
        let stats = Arc::clone(&stats);
        tokio::spawn(async move {
            handle_connection(client, target, cfg, stats).await;
        });
    }
}

/// One complete flow: connect out, relay both directions, clean up.
async fn handle_connection(
    client: TcpStream,
    target: HostPort,
    cfg: TcpConfig,
    stats: Arc<RelayStats>,
) {
    let peer = match client.peer_addr() {
        Ok(addr) => addr,
        Err(e) => {
            log::warn!(error = %e, "Dropping connection without a peer address");
            return;
        }
    };
    stats.open_request();

    let connect = TcpStream::connect((target.host.as_str(), target.port));
    let remote = match tokio::time::timeout(cfg.connect_timeout, connect).await {
        Ok(Ok(remote)) => remote,
        Ok(Err(e)) => {
            log::error!(client = %peer, target = %target, error = %e, "Pipe NOT open");
            stats.close_request();
            return;
        }
        Err(_) => {
            log::error!(client = %peer, target = %target, "Pipe NOT open (connect timeout)");
            stats.close_request();
            return;
        }
    };

    let _ = client.set_nodelay(true);
    let _ = remote.set_nodelay(true);
    let local = client
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "[closed]".to_string());
    // The remote socket's local address is unique per flow; it keys the
    // download direction the way the client's peer address keys the upload.
    let remote_key = match remote.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            log::error!(client = %peer, target = %target, error = %e, "Pipe NOT open");
            stats.close_request();
            return;
        }
    };

    let link_up = Instant::now();
    let up_counter = stats.register(peer);
    let down_counter = stats.register(remote_key);
    log::info!(client = %peer, via = %local, target = %target, "Pipe open");

    let (client_read, client_write) = client.into_split();
    let (remote_read, remote_write) = remote.into_split();
    let buffer_size = cfg.buffer_size;

    let up = copy_chunks(
        client_read,
        remote_write,
        buffer_size,
        Arc::clone(&up_counter),
        Arc::clone(&stats),
    );
    let down = copy_chunks(
        remote_read,
        client_write,
        buffer_size,
        Arc::clone(&down_counter),
        Arc::clone(&stats),
    );

    // First direction to finish (EOF or error) wins; dropping the other
    // future closes the remaining socket halves immediately.
    tokio::select! {
        result = up => {
            if let Err(e) = result {
                log::warn!(client = %peer, error = %e, "Read from client side failed");
            }
        }
        result = down => {
            if let Err(e) = result {
                log::warn!(client = %peer, error = %e, "Read from target side failed");
            }
        }
    }

    let uploaded = up_counter.load(Ordering::Relaxed);
    let downloaded = down_counter.load(Ordering::Relaxed);
    log::info!(client = %peer, target = %target, "Pipe closed");
    log::info!(
        client = %peer,
        target = %target,
        sent = %format_bytes(uploaded),
        received = %format_bytes(downloaded),
        link_up = %humantime::format_duration(whole_secs(link_up.elapsed())),
        "Transfer stats"
    );
    stats.unregister(&peer);
    stats.unregister(&remote_key);
    stats.close_request();
}

/// One relay direction: bounded read, then flush the whole chunk before the
/// next read. Returns the copied byte count on clean EOF.
async fn copy_chunks<R, W>(
    mut src: R,
    mut dst: W,
    buffer_size: usize,
    counter: Arc<AtomicU64>,
    stats: Arc<RelayStats>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut copied = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(copied);
        }
        dst.write_all(&buf[..n]).await?;
        copied += n as u64;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        stats.add_bytes(n as u64);
    }
}

async fn report_loop(stats: Arc<RelayStats>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        log::info!(
            proto = "tcp",
            uptime = %humantime::format_duration(whole_secs(stats.uptime())),
            active = stats.active_requests(),
            total = stats.total_requests(),
            transferred = %format_bytes(stats.total_bytes()),
            "Status update"
        );
    }
}
