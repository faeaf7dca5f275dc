//! Client role: one [`Connection`] handle per HTTP/2 connection
//!
//! Requests are sent through a cloneable [`Connection`] (also a
//! `tower::Service`), while a [`Driver`] owns the transport. Every exchange
//! holds a [`StreamGuard`] that resets abandoned streams. A stream stays live
//! until both its response and its request body are done.

use bytes::Bytes;
use h2::{Reason, SendStream};
use http::{Request, Response};
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tower::Service;
use tracing::{debug, info, trace};

use crate::body::{Body, RecvBody};
use crate::driver::{ConnectionId, ConnectionStats, ConnectionStatus, Driver, Shared};
use crate::error::{ConnectError, ConnectionError, Error};
use crate::executor::{Executor, TokioExecutor};
use crate::flush::flush;

pub mod builder;
pub mod future;

pub use builder::Builder;
pub use future::ResponseFuture;

/// Handshake with default settings.
///
/// The returned [`Driver`] must be run (for example on `exec`) for the
/// connection to make progress.
pub async fn handshake<T, E>(io: T, exec: E) -> Result<(Connection<E>, Driver<T>), Error>
where
    T: AsyncRead + AsyncWrite + Unpin,
    E: Executor + Clone,
{
    Builder::new().executor(exec).handshake(io).await
}

/// Cloneable handle for sending requests on one HTTP/2 connection.
#[derive(Clone)]
pub struct Connection<E = TokioExecutor> {
    send_request: h2::client::SendRequest<Bytes>,
    shared: Arc<Shared>,
    exec: E,
}

impl<E> Connection<E>
where
    E: Executor + Clone,
{
    pub(crate) fn new(send_request: h2::client::SendRequest<Bytes>, shared: Arc<Shared>, exec: E) -> Self {
        Self {
            send_request,
            shared,
            exec,
        }
    }

    /// Send a request, resolving once the response head arrives.
    ///
    /// The request body is streamed by a separate task as the peer grants
    /// window. Exactly one stream is allocated per call, and none at all if
    /// the connection is not open.
    pub fn send<B>(&self, request: Request<B>) -> ResponseFuture
    where
        B: Body + Send + 'static,
    {
        let send_request = self.send_request.clone();
        let shared = self.shared.clone();
        let exec = self.exec.clone();
        ResponseFuture::new(Box::pin(exchange(send_request, shared, exec, request)))
    }

    /// Unique id of this connection
    pub fn id(&self) -> ConnectionId {
        self.shared.id()
    }

    /// Current status as published by the driver
    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    pub fn is_open(&self) -> bool {
        self.shared.status().is_open()
    }

    /// Number of streams allocated and not yet finished, reset or dropped
    pub fn live_streams(&self) -> usize {
        self.shared.live_streams()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.stats()
    }

    /// Refuse new streams, let in-flight ones finish, then close.
    pub fn shutdown(&self) {
        info!(connection = %self.shared.id(), "shutdown requested");
        self.shared.begin_shutdown();
    }

    /// Wait until the connection reaches `Closed` or `Failed`.
    pub async fn closed(&self) -> ConnectionStatus {
        self.shared.terminated().await
    }
}

impl<E> fmt::Debug for Connection<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id())
            .field("status", &self.shared.status())
            .field("live_streams", &self.shared.live_streams())
            .finish()
    }
}

impl<B, E> Service<Request<B>> for Connection<E>
where
    B: Body + Send + 'static,
    E: Executor + Clone,
{
    type Response = Response<RecvBody>;
    type Error = Error;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        ensure_open(&self.shared)?;
        self.send_request
            .poll_ready(cx)
            .map_err(|e| open_failed(e, &self.shared))
    }

    fn call(&mut self, request: Request<B>) -> Self::Future {
        self.send(request)
    }
}

async fn exchange<B, E>(
    send_request: h2::client::SendRequest<Bytes>,
    shared: Arc<Shared>,
    exec: E,
    request: Request<B>,
) -> Result<Response<RecvBody>, Error>
where
    B: Body + Send + 'static,
    E: Executor,
{
    ensure_open(&shared)?;

    // wait for stream concurrency; a dying connection must not leave us parked
    let mut send_request = tokio::select! {
        biased;
        ready = send_request.ready() => ready.map_err(|e| open_failed(e, &shared))?,
        status = shared.terminated() => return Err(connect_error(status)),
    };
    ensure_open(&shared)?;

    let (parts, body) = request.into_parts();
    let eos = body.is_end_stream();
    let (response, send) = send_request
        .send_request(Request::from_parts(parts, ()), eos)
        .map_err(|e| open_failed(e, &shared))?;

    let stream_id = response.stream_id().as_u32();
    let registration = Registration::new(stream_id, shared.clone());
    let mut guard = StreamGuard::new(stream_id, shared.clone(), registration.clone());
    debug!(connection = %shared.id(), stream = stream_id, eos, "request sent");

    if eos {
        drop(registration);
        guard.hold(send);
    } else {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        exec.execute(Box::pin(pump(body, send, cancel_rx, registration)))?;
        guard.cancel_on_drop(cancel_tx);
    }

    let response = tokio::select! {
        biased;
        res = response => res,
        status = shared.terminated() => return Err(connection_error(status)),
    };

    match response {
        Ok(response) => {
            trace!(stream = stream_id, status = %response.status(), "response head received");
            let (parts, recv) = response.into_parts();
            Ok(Response::from_parts(parts, RecvBody::with_guard(recv, guard)))
        }
        Err(e) if e.is_io() => {
            // the transport is gone; report the value every other stream sees
            Err(connection_error(shared.terminated().await))
        }
        Err(e) => {
            debug!(stream = stream_id, "exchange failed: {}", e);
            note_go_away(&e, &shared);
            Err(Error::from_stream(e, stream_id))
        }
    }
}

/// Stream the request body until it ends or the exchange is abandoned.
///
/// The stream counts as live until this returns, even when the response
/// finished first.
async fn pump<B: Body>(
    body: B,
    mut send: SendStream<Bytes>,
    mut cancel: oneshot::Receiver<()>,
    _registration: Arc<Registration>,
) {
    let stream_id = send.stream_id().as_u32();
    let mut flushing = Box::pin(flush(body, &mut send));

    let outcome = tokio::select! {
        biased;
        res = &mut flushing => Some(res),
        finished = &mut cancel => match finished {
            // response complete; the rest of the request body is still owed
            Ok(()) => Some((&mut flushing).await),
            Err(_) => None,
        },
    };
    drop(flushing);

    match outcome {
        Some(Ok(())) => trace!(stream = stream_id, "request body sent"),
        Some(Err(e)) => debug!(stream = stream_id, "request body failed: {}", e),
        None => {
            debug!(stream = stream_id, "exchange abandoned, resetting stream");
            send.send_reset(Reason::CANCEL);
        }
    }
}

fn ensure_open(shared: &Shared) -> Result<(), Error> {
    match shared.status() {
        ConnectionStatus::Open => Ok(()),
        status => Err(connect_error(status)),
    }
}

fn connect_error(status: ConnectionStatus) -> Error {
    match status {
        ConnectionStatus::Failed(e) => ConnectError::Failed(e).into(),
        ConnectionStatus::Draining => ConnectError::Draining.into(),
        ConnectionStatus::Open | ConnectionStatus::Closed => ConnectError::Closed.into(),
    }
}

fn connection_error(status: ConnectionStatus) -> Error {
    match status {
        ConnectionStatus::Failed(e) => Error::Connection(e),
        _ => Error::Connection(ConnectionError::Closed),
    }
}

fn open_failed(err: h2::Error, shared: &Shared) -> Error {
    note_go_away(&err, shared);
    match shared.status() {
        ConnectionStatus::Failed(e) => ConnectError::Failed(e).into(),
        _ => Error::from_open(err),
    }
}

/// A GOAWAY from the peer stops new streams even though in-flight ones may
/// still complete.
fn note_go_away(err: &h2::Error, shared: &Shared) {
    if err.is_go_away() && err.is_remote() {
        debug!(reason = ?err.reason(), "peer sent GOAWAY, draining");
        shared.mark_draining();
    }
}

/// Live-stream slot shared by the response side and the request body pump.
/// The stream is released when the last holder drops it.
pub(crate) struct Registration {
    stream_id: u32,
    shared: Arc<Shared>,
}

impl Registration {
    fn new(stream_id: u32, shared: Arc<Shared>) -> Arc<Self> {
        shared.register(stream_id);
        Arc::new(Self { stream_id, shared })
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.shared.release(self.stream_id);
    }
}

/// Response side of one client stream.
///
/// Finishing gives up its hold on the registration; dropping an unfinished
/// guard resets the stream with `CANCEL` first.
pub(crate) struct StreamGuard {
    stream_id: u32,
    shared: Arc<Shared>,
    registration: Option<Arc<Registration>>,
    send: Option<SendStream<Bytes>>,
    cancel: Option<oneshot::Sender<()>>,
    done: bool,
}

impl StreamGuard {
    fn new(stream_id: u32, shared: Arc<Shared>, registration: Arc<Registration>) -> Self {
        Self {
            stream_id,
            shared,
            registration: Some(registration),
            send: None,
            cancel: None,
            done: false,
        }
    }

    fn hold(&mut self, send: SendStream<Bytes>) {
        self.send = Some(send);
    }

    fn cancel_on_drop(&mut self, cancel: oneshot::Sender<()>) {
        self.cancel = Some(cancel);
    }

    /// The response reached end-of-stream.
    pub(crate) fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        self.send = None;
        self.registration = None;
    }

    /// Classify an error seen on the response body.
    pub(crate) fn classify(&self, err: h2::Error) -> Error {
        note_go_away(&err, &self.shared);
        if err.is_io() {
            if let ConnectionStatus::Failed(e) = self.shared.status() {
                return Error::Connection(e);
            }
        }
        Error::from_stream(err, self.stream_id)
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(mut send) = self.send.take() {
            send.send_reset(Reason::CANCEL);
        }
        // a dropped sender tells the pump to reset
        self.cancel = None;
        debug!(stream = self.stream_id, "stream dropped before completion");
        self.registration = None;
    }
}

impl fmt::Debug for StreamGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamGuard")
            .field("stream_id", &self.stream_id)
            .field("done", &self.done)
            .field("registered", &self.registration.is_some())
            .finish()
    }
}
