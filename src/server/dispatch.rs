//! Per-stream service invocation

use bytes::Bytes;
use h2::Reason;
use h2::server::SendResponse;
use http::{Request, Response};
use std::future::poll_fn;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower::{Service, ServiceExt};
use tracing::{debug, trace, warn};

use super::ConnectionContext;
use crate::body::{Body, RecvBody};
use crate::driver::Shared;
use crate::error::{BoxError, Error, Fatal};
use crate::flush::flush;

enum Failure {
    /// Factory failed for this stream only
    Factory(BoxError),
    /// Factory failed in a way that poisons the connection
    Fatal(BoxError),
    Service(BoxError),
}

/// Drive one stream: obtain a service, call it, write the response.
///
/// The invocation is dropped as soon as the peer resets the stream or the
/// connection terminates.
pub(crate) async fn stream<M, S, B>(
    factory: M,
    ctx: ConnectionContext,
    request: Request<RecvBody>,
    respond: SendResponse<Bytes>,
    shared: Arc<Shared>,
    fatal: mpsc::UnboundedSender<BoxError>,
) where
    M: Service<ConnectionContext, Response = S>,
    M::Error: Into<BoxError>,
    S: Service<Request<RecvBody>, Response = Response<B>>,
    S::Error: Into<BoxError>,
    B: Body,
{
    let stream_id = ctx.stream_id;
    let mut respond = Respond::new(respond, stream_id, shared.clone());
    trace!(stream = stream_id, method = %request.method(), uri = %request.uri(), "dispatching");

    let outcome = tokio::select! {
        biased;
        reason = respond.peer_reset() => {
            debug!(stream = stream_id, ?reason, "peer reset stream, dropping invocation");
            return;
        }
        _ = shared.terminated() => {
            debug!(stream = stream_id, "connection terminated, dropping invocation");
            return;
        }
        outcome = invoke(factory, ctx, request) => outcome,
    };

    match outcome {
        Ok(response) => {
            if let Err(e) = respond.send(response).await {
                debug!(stream = stream_id, "failed to send response: {}", e);
            }
        }
        Err(Failure::Factory(e)) => {
            warn!(stream = stream_id, "service factory failed: {}", e);
            respond.reset(Reason::INTERNAL_ERROR);
        }
        Err(Failure::Fatal(e)) => {
            warn!(stream = stream_id, "service factory failed fatally: {}", e);
            respond.reset(Reason::INTERNAL_ERROR);
            let _ = fatal.send(e);
        }
        Err(Failure::Service(e)) => {
            debug!(stream = stream_id, "service failed: {}", e);
            respond.reset(Reason::INTERNAL_ERROR);
        }
    }
}

async fn invoke<M, S, B>(
    mut factory: M,
    ctx: ConnectionContext,
    request: Request<RecvBody>,
) -> Result<Response<B>, Failure>
where
    M: Service<ConnectionContext, Response = S>,
    M::Error: Into<BoxError>,
    S: Service<Request<RecvBody>, Response = Response<B>>,
    S::Error: Into<BoxError>,
{
    let ready = factory
        .ready()
        .await
        .map_err(|e| Failure::Fatal(e.into()))?;

    let service = ready.call(ctx).await.map_err(|e| {
        let e: BoxError = e.into();
        if Fatal::is_fatal(&e) {
            Failure::Fatal(e)
        } else {
            Failure::Factory(e)
        }
    })?;

    service
        .oneshot(request)
        .await
        .map_err(|e| Failure::Service(e.into()))
}

/// Response half of a stream. Dropped before anything was sent, it resets
/// the stream with `CANCEL`.
struct Respond {
    inner: SendResponse<Bytes>,
    stream_id: u32,
    shared: Arc<Shared>,
    sent: bool,
}

impl Respond {
    fn new(inner: SendResponse<Bytes>, stream_id: u32, shared: Arc<Shared>) -> Self {
        shared.register(stream_id);
        Self {
            inner,
            stream_id,
            shared,
            sent: false,
        }
    }

    async fn peer_reset(&mut self) -> Result<Reason, h2::Error> {
        poll_fn(|cx| self.inner.poll_reset(cx)).await
    }

    fn reset(&mut self, reason: Reason) {
        self.sent = true;
        self.inner.send_reset(reason);
    }

    async fn send<B: Body>(&mut self, response: Response<B>) -> Result<(), Error> {
        let (parts, body) = response.into_parts();
        let eos = body.is_end_stream();
        self.sent = true;

        let mut stream = self
            .inner
            .send_response(Response::from_parts(parts, ()), eos)
            .map_err(|e| Error::from_stream(e, self.stream_id))?;
        trace!(stream = self.stream_id, eos, "response head sent");

        if eos {
            return Ok(());
        }
        flush(body, &mut stream).await
    }
}

impl Drop for Respond {
    fn drop(&mut self) {
        if !self.sent {
            debug!(stream = self.stream_id, "invocation dropped, resetting stream");
            self.inner.send_reset(Reason::CANCEL);
        }
        self.shared.release(self.stream_id);
    }
}
