//! Server role: dispatch inbound streams to `tower` services
//!
//! A [`Server`] holds a service factory `M`. For every accepted stream the
//! factory is asked for a service with a [`ConnectionContext`], and the
//! service is invoked on its own task so a slow handler never blocks
//! dispatch of new streams.

use bytes::Bytes;
use h2::Reason;
use http::{Request, Response};
use std::fmt;
use std::future::{Future, poll_fn};
use std::pin::pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tower::Service;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::body::{Body, RecvBody};
use crate::config::{ConnectionConfig, KeepAliveConfig};
use crate::driver::{Abandoned, ConnectionId, ConnectionStatus, Shared, keep_alive_loop};
use crate::error::{BoxError, ConnectionError, Error, HandshakeError};
use crate::executor::{Executor, TokioExecutor};
use crate::handshake;

pub mod builder;
mod dispatch;

pub use builder::Builder;

/// Handed to the service factory for each stream and inserted into the
/// request's extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionContext {
    pub connection_id: ConnectionId,
    pub stream_id: u32,
}

/// Rewrites a request head before it reaches the service factory.
pub trait Modify {
    fn modify(&mut self, request: &mut Request<()>);
}

impl Modify for () {
    fn modify(&mut self, _request: &mut Request<()>) {}
}

impl<F> Modify for F
where
    F: FnMut(&mut Request<()>),
{
    fn modify(&mut self, request: &mut Request<()>) {
        self(request)
    }
}

/// Serves HTTP/2 connections with services produced by `M`.
#[derive(Clone)]
pub struct Server<M, E = TokioExecutor> {
    make_service: M,
    config: ConnectionConfig,
    keep_alive: KeepAliveConfig,
    exec: E,
}

impl Server<(), TokioExecutor> {
    /// Create a new server builder
    pub fn builder() -> Builder<TokioExecutor> {
        Builder::new()
    }
}

impl<M, E> Server<M, E> {
    pub(crate) fn new(make_service: M, config: ConnectionConfig, keep_alive: KeepAliveConfig, exec: E) -> Self {
        Self {
            make_service,
            config,
            keep_alive,
            exec,
        }
    }

    /// Connection settings advertised to every peer
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

impl<M, S, B, E> Server<M, E>
where
    M: Service<ConnectionContext, Response = S> + Clone + Send + 'static,
    M::Error: Into<BoxError>,
    M::Future: Send + 'static,
    S: Service<Request<RecvBody>, Response = Response<B>> + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
    B: Body + Send + 'static,
    E: Executor,
{
    /// Serve one connection until the peer closes it or it fails.
    pub async fn serve<T>(&self, io: T) -> Result<(), Error>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        self.serve_modified(io, (), std::future::pending()).await
    }

    /// Serve one connection; when `signal` resolves, send GOAWAY and let
    /// in-flight streams finish.
    pub async fn serve_with_shutdown<T, F>(&self, io: T, signal: F) -> Result<(), Error>
    where
        T: AsyncRead + AsyncWrite + Unpin,
        F: Future<Output = ()>,
    {
        self.serve_modified(io, (), signal).await
    }

    /// Like [`serve_with_shutdown`](Self::serve_with_shutdown), applying
    /// `modify` to every request head before dispatch.
    pub async fn serve_modified<T, D, F>(&self, io: T, modify: D, signal: F) -> Result<(), Error>
    where
        T: AsyncRead + AsyncWrite + Unpin,
        D: Modify,
        F: Future<Output = ()>,
    {
        self.keep_alive
            .validate()
            .map_err(|e| HandshakeError::IncompatibleSettings(e.to_string()))?;

        let connection = handshake::server(io, &self.config).await?;
        let shared = Shared::new();
        let span = info_span!("h2_server", connection = %shared.id());

        self.run(connection, shared, modify, signal)
            .instrument(span)
            .await
    }

    async fn run<T, D, F>(
        &self,
        mut connection: h2::server::Connection<T, Bytes>,
        shared: std::sync::Arc<Shared>,
        mut modify: D,
        signal: F,
    ) -> Result<(), Error>
    where
        T: AsyncRead + AsyncWrite + Unpin,
        D: Modify,
        F: Future<Output = ()>,
    {
        let _abandoned = Abandoned(shared.clone());
        let mut keep_alive = pin!(keep_alive_loop(connection.ping_pong(), self.keep_alive.clone()));
        let mut signal = pin!(signal);
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<BoxError>();
        let mut draining = false;

        info!("🚀 HTTP/2 server connection established");

        loop {
            tokio::select! {
                biased;

                Some(err) = fatal_rx.recv() => {
                    warn!("aborting connection after fatal factory error");
                    connection.abrupt_shutdown(Reason::INTERNAL_ERROR);
                    let _ = poll_fn(|cx| connection.poll_closed(cx)).await;
                    shared.finish(ConnectionStatus::Failed(ConnectionError::GoAway {
                        reason: Reason::INTERNAL_ERROR,
                        remote: false,
                    }));
                    return Err(Error::NewService(err));
                }
                err = &mut keep_alive => {
                    warn!("connection failed: {}", err);
                    shared.finish(ConnectionStatus::Failed(err.clone()));
                    return Err(Error::Connection(err));
                }
                _ = &mut signal, if !draining => {
                    draining = true;
                    shared.mark_draining();
                    info!(live = shared.live_streams(), "graceful shutdown, sending GOAWAY");
                    connection.graceful_shutdown();
                }
                accepted = connection.accept() => match accepted {
                    Some(Ok((request, respond))) => {
                        let stream_id = respond.stream_id().as_u32();
                        let ctx = ConnectionContext {
                            connection_id: shared.id(),
                            stream_id,
                        };

                        let (parts, recv) = request.into_parts();
                        let mut head = Request::from_parts(parts, ());
                        modify.modify(&mut head);
                        head.extensions_mut().insert(ctx);
                        let (parts, ()) = head.into_parts();
                        let request = Request::from_parts(parts, RecvBody::new(recv));

                        debug!(stream = stream_id, "accepted stream");
                        let task = dispatch::stream(
                            self.make_service.clone(),
                            ctx,
                            request,
                            respond,
                            shared.clone(),
                            fatal_tx.clone(),
                        );
                        if let Err(e) = self.exec.execute(Box::pin(task)) {
                            warn!("failed to spawn stream task: {}", e);
                            connection.abrupt_shutdown(Reason::INTERNAL_ERROR);
                            let _ = poll_fn(|cx| connection.poll_closed(cx)).await;
                            shared.finish(ConnectionStatus::Failed(ConnectionError::GoAway {
                                reason: Reason::INTERNAL_ERROR,
                                remote: false,
                            }));
                            return Err(Error::Execute(e));
                        }
                    }
                    Some(Err(e)) => {
                        let err = ConnectionError::from(e);
                        warn!("connection failed: {}", err);
                        shared.finish(ConnectionStatus::Failed(err.clone()));
                        return Err(Error::Connection(err));
                    }
                    None => break,
                },
            }
        }

        let stats = shared.stats();
        info!(
            streams = stats.streams_opened,
            last_stream_id = stats.last_stream_id,
            "connection closed"
        );
        shared.finish(ConnectionStatus::Closed);
        Ok(())
    }
}

impl<M, E> fmt::Debug for Server<M, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}
