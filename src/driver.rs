//! Background connection driver
//!
//! One [`Driver`] per client connection is the sole reader and writer of the
//! transport. Handles talk to it only through [`Shared`]: atomics for stream
//! bookkeeping, a `watch` channel for the connection status and two `Notify`
//! permits for shutdown and idle wakeups.

use bytes::Bytes;
use futures::future;
use h2::{Ping, PingPong};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, watch};
use tracing::{Instrument, debug, info, info_span, trace, warn};
use uuid::Uuid;

use crate::config::KeepAliveConfig;
use crate::error::ConnectionError;

/// Unique identifier of one connection, used in logs and service contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Lifecycle of a connection as published by its driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Accepting new streams
    Open,
    /// Shutting down: in-flight streams continue, new ones are refused
    Draining,
    /// Terminated cleanly
    Closed,
    /// Terminated with an error; every outstanding stream saw the same value
    Failed(ConnectionError),
}

impl ConnectionStatus {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionStatus::Open)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionStatus::Closed | ConnectionStatus::Failed(_))
    }
}

/// Point-in-time stream counters for one connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStats {
    pub connection_id: String,
    pub streams_opened: u64,
    pub streams_closed: u64,
    pub live_streams: usize,
    pub last_stream_id: u32,
}

/// State shared between a driver and the handles of its connection.
#[derive(Debug)]
pub(crate) struct Shared {
    id: ConnectionId,
    status: watch::Sender<ConnectionStatus>,
    live_streams: AtomicUsize,
    streams_opened: AtomicU64,
    streams_closed: AtomicU64,
    last_stream_id: AtomicU32,
    idle: Notify,
    shutdown: Notify,
}

impl Shared {
    pub(crate) fn new() -> Arc<Self> {
        let (status, _) = watch::channel(ConnectionStatus::Open);
        Arc::new(Self {
            id: ConnectionId::new(),
            status,
            live_streams: AtomicUsize::new(0),
            streams_opened: AtomicU64::new(0),
            streams_closed: AtomicU64::new(0),
            last_stream_id: AtomicU32::new(0),
            idle: Notify::new(),
            shutdown: Notify::new(),
        })
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Wait until the driver publishes a terminal status.
    pub(crate) async fn terminated(&self) -> ConnectionStatus {
        let mut rx = self.subscribe();
        match rx.wait_for(ConnectionStatus::is_terminal).await {
            Ok(status) => status.clone(),
            Err(_) => ConnectionStatus::Closed,
        }
    }

    /// Record a freshly allocated stream.
    pub(crate) fn register(&self, stream_id: u32) {
        self.live_streams.fetch_add(1, Ordering::AcqRel);
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
        self.last_stream_id.fetch_max(stream_id, Ordering::AcqRel);
        trace!(stream = stream_id, "stream registered");
    }

    /// Record a stream reaching its end, reset or abandonment.
    pub(crate) fn release(&self, stream_id: u32) {
        self.live_streams.fetch_sub(1, Ordering::AcqRel);
        self.streams_closed.fetch_add(1, Ordering::Relaxed);
        self.idle.notify_one();
        trace!(stream = stream_id, "stream released");
    }

    pub(crate) fn live_streams(&self) -> usize {
        self.live_streams.load(Ordering::Acquire)
    }

    pub(crate) fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            connection_id: self.id.to_string(),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            streams_closed: self.streams_closed.load(Ordering::Relaxed),
            live_streams: self.live_streams(),
            last_stream_id: self.last_stream_id.load(Ordering::Acquire),
        }
    }

    /// Ask the driver to stop accepting new streams.
    pub(crate) fn begin_shutdown(&self) {
        self.mark_draining();
        self.shutdown.notify_one();
    }

    pub(crate) fn mark_draining(&self) {
        self.status.send_if_modified(|status| {
            if status.is_open() {
                *status = ConnectionStatus::Draining;
                true
            } else {
                false
            }
        });
    }

    /// Publish the final status. The first terminal status wins.
    pub(crate) fn finish(&self, outcome: ConnectionStatus) {
        self.status.send_if_modified(|status| {
            if status.is_terminal() {
                false
            } else {
                *status = outcome;
                true
            }
        });
    }

    async fn shutdown_requested(&self) {
        self.shutdown.notified().await
    }

    async fn stream_released(&self) {
        self.idle.notified().await
    }
}

/// Drives one client connection until it closes or fails.
///
/// Returned by [`client::Builder::handshake`](crate::client::Builder::handshake)
/// for callers that schedule the driver themselves.
#[must_use = "the connection makes no progress unless the driver is run"]
pub struct Driver<T> {
    connection: h2::client::Connection<T, Bytes>,
    ping_pong: Option<PingPong>,
    keep_alive: KeepAliveConfig,
    shared: Arc<Shared>,
    abandoned: Abandoned,
}

impl<T> Driver<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(
        mut connection: h2::client::Connection<T, Bytes>,
        keep_alive: KeepAliveConfig,
        shared: Arc<Shared>,
    ) -> Self {
        let ping_pong = connection.ping_pong();
        Self {
            connection,
            ping_pong,
            keep_alive,
            abandoned: Abandoned(shared.clone()),
            shared,
        }
    }

    /// Identifier of the connection this driver serves
    pub fn connection_id(&self) -> ConnectionId {
        self.shared.id()
    }

    /// Run until the connection terminates.
    ///
    /// The terminal status is also published to every handle, so callers
    /// scheduling the driver may ignore the result.
    pub async fn run(self) -> Result<(), ConnectionError> {
        let span = info_span!("h2_client", connection = %self.shared.id());
        self.drive().instrument(span).await
    }

    async fn drive(self) -> Result<(), ConnectionError> {
        let Driver {
            connection,
            ping_pong,
            keep_alive,
            shared,
            abandoned: _abandoned,
        } = self;
        let mut connection = std::pin::pin!(connection);
        let mut keep_alive = std::pin::pin!(keep_alive_loop(ping_pong, keep_alive));
        let mut draining = false;

        info!("🚀 connection driver started");

        let outcome = loop {
            tokio::select! {
                biased;

                res = &mut connection => break res.map_err(ConnectionError::from),
                err = &mut keep_alive => break Err(err),
                _ = shared.shutdown_requested(), if !draining => {
                    draining = true;
                    shared.mark_draining();
                    info!(live = shared.live_streams(), "draining connection");
                }
                _ = shared.stream_released(), if draining => {}
            }

            if draining && shared.live_streams() == 0 {
                debug!("all streams finished, closing connection");
                break Ok(());
            }
        };

        let live = shared.live_streams();
        let status = match &outcome {
            Ok(()) if live > 0 && !draining => {
                ConnectionStatus::Failed(ConnectionError::PeerClosed { in_flight: live })
            }
            Ok(()) => ConnectionStatus::Closed,
            Err(e) => ConnectionStatus::Failed(e.clone()),
        };

        match &status {
            ConnectionStatus::Failed(e) => warn!(live, "connection failed: {}", e),
            _ => info!("connection closed"),
        }
        shared.finish(status.clone());

        match status {
            ConnectionStatus::Failed(e) => Err(e),
            _ => Ok(()),
        }
    }
}

impl<T> fmt::Debug for Driver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Driver")
            .field("connection", &self.shared.id())
            .field("keep_alive", &self.keep_alive.enabled)
            .finish()
    }
}

/// Publishes a terminal status if a driver is dropped before it finishes,
/// so no handle waits on a connection nobody drives.
#[derive(Debug)]
pub(crate) struct Abandoned(pub(crate) Arc<Shared>);

impl Drop for Abandoned {
    fn drop(&mut self) {
        let live = self.0.live_streams();
        if live > 0 {
            self.0
                .finish(ConnectionStatus::Failed(ConnectionError::Closed));
        } else {
            self.0.finish(ConnectionStatus::Closed);
        }
    }
}

/// PING the peer every interval; resolves only when a PONG is overdue or the
/// ping machinery fails.
pub(crate) async fn keep_alive_loop(
    ping_pong: Option<PingPong>,
    config: KeepAliveConfig,
) -> ConnectionError {
    let mut ping_pong = match ping_pong {
        Some(ping_pong) if config.enabled => ping_pong,
        _ => return future::pending().await,
    };

    let mut ticker = tokio::time::interval(config.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        trace!("sending keep-alive ping");
        match tokio::time::timeout(config.timeout(), ping_pong.ping(Ping::opaque())).await {
            Ok(Ok(_)) => trace!("keep-alive pong received"),
            Ok(Err(e)) => {
                debug!("keep-alive ping failed: {}", e);
                return ConnectionError::from(e);
            }
            Err(_) => {
                warn!(timeout = ?config.timeout(), "keep-alive pong overdue");
                return ConnectionError::KeepAliveTimeout;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_stream_bookkeeping() {
        let shared = Shared::new();
        shared.register(1);
        shared.register(3);
        assert_eq!(shared.live_streams(), 2);

        shared.release(1);
        let stats = shared.stats();
        assert_eq!(stats.streams_opened, 2);
        assert_eq!(stats.streams_closed, 1);
        assert_eq!(stats.live_streams, 1);
        assert_eq!(stats.last_stream_id, 3);
        assert_eq!(stats.connection_id, shared.id().to_string());
    }

    #[test]
    fn test_first_terminal_status_wins() {
        let shared = Shared::new();
        assert!(shared.status().is_open());

        shared.begin_shutdown();
        assert_eq!(shared.status(), ConnectionStatus::Draining);

        shared.finish(ConnectionStatus::Failed(ConnectionError::KeepAliveTimeout));
        shared.finish(ConnectionStatus::Closed);
        assert_eq!(
            shared.status(),
            ConnectionStatus::Failed(ConnectionError::KeepAliveTimeout)
        );

        // draining never overwrites a terminal status
        shared.mark_draining();
        assert!(shared.status().is_terminal());
    }

    #[tokio::test]
    async fn test_terminated_waits_for_driver() {
        let shared = Shared::new();
        let waiter = tokio::spawn({
            let shared = shared.clone();
            async move { shared.terminated().await }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        shared.finish(ConnectionStatus::Closed);
        assert_eq!(waiter.await.unwrap(), ConnectionStatus::Closed);
    }

    #[tokio::test]
    async fn test_keep_alive_disabled_never_fires() {
        let fired = tokio::time::timeout(
            Duration::from_millis(20),
            keep_alive_loop(None, KeepAliveConfig::default()),
        )
        .await;
        assert!(fired.is_err());
    }

    #[test]
    fn test_abandoned_driver_publishes_status() {
        let shared = Shared::new();
        shared.register(1);
        drop(Abandoned(shared.clone()));
        assert_eq!(
            shared.status(),
            ConnectionStatus::Failed(ConnectionError::Closed)
        );
    }

    #[test]
    fn test_stats_serialize() {
        let stats = ConnectionStats {
            connection_id: "abc".to_string(),
            streams_opened: 3,
            streams_closed: 2,
            live_streams: 1,
            last_stream_id: 5,
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"last_stream_id\":5"));
    }
}
