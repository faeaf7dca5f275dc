//! Streaming request/response payloads
//!
//! A [`Body`] is a lazy sequence of [`Bytes`] chunks followed by optional
//! trailers. Bodies are pulled one chunk at a time and are not restartable.
//!
//! [`RecvBody`] is the receive half of a stream. Every chunk it hands out
//! releases the same amount of flow-control window back to the peer.

use bytes::{Bytes, BytesMut};
use futures::Stream;
use http::HeaderMap;
use std::fmt;
use std::future::poll_fn;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::trace;

use crate::client::StreamGuard;
use crate::error::{BoxError, Error};

/// A streaming payload bound to one stream direction.
pub trait Body {
    type Error: Into<BoxError>;

    /// Returns `true` when no more data (or trailers) will be produced.
    ///
    /// Used to set END_STREAM on the HEADERS frame when possible.
    fn is_end_stream(&self) -> bool {
        false
    }

    /// Poll the next data chunk.
    fn poll_data(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>>;

    /// Poll trailing headers, once data is exhausted.
    fn poll_trailers(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        Poll::Ready(Ok(None))
    }
}

impl<B: Body + Unpin + ?Sized> Body for Box<B> {
    type Error = B::Error;

    fn is_end_stream(&self) -> bool {
        (**self).is_end_stream()
    }

    fn poll_data(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        Pin::new(&mut **self).poll_data(cx)
    }

    fn poll_trailers(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        Pin::new(&mut **self).poll_trailers(cx)
    }
}

// ===== simple bodies =====

impl Body for () {
    type Error = std::convert::Infallible;

    fn is_end_stream(&self) -> bool {
        true
    }

    fn poll_data(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        Poll::Ready(None)
    }
}

impl Body for Bytes {
    type Error = std::convert::Infallible;

    fn is_end_stream(&self) -> bool {
        self.is_empty()
    }

    fn poll_data(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        let this = self.get_mut();
        if this.is_empty() {
            Poll::Ready(None)
        } else {
            Poll::Ready(Some(Ok(std::mem::take(this))))
        }
    }
}

impl Body for String {
    type Error = std::convert::Infallible;

    fn is_end_stream(&self) -> bool {
        self.is_empty()
    }

    fn poll_data(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        let this = self.get_mut();
        if this.is_empty() {
            Poll::Ready(None)
        } else {
            Poll::Ready(Some(Ok(Bytes::from(std::mem::take(this)))))
        }
    }
}

impl Body for &'static str {
    type Error = std::convert::Infallible;

    fn is_end_stream(&self) -> bool {
        self.is_empty()
    }

    fn poll_data(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        let this = self.get_mut();
        if this.is_empty() {
            Poll::Ready(None)
        } else {
            Poll::Ready(Some(Ok(Bytes::from_static(std::mem::take(this).as_bytes()))))
        }
    }
}

/// Adapts a `Stream` of chunks into a [`Body`], with optional trailers.
pub struct StreamBody<S> {
    stream: S,
    trailers: Option<HeaderMap>,
    done: bool,
}

impl<S> StreamBody<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            trailers: None,
            done: false,
        }
    }

    /// Send `trailers` after the last chunk
    pub fn with_trailers(mut self, trailers: HeaderMap) -> Self {
        self.trailers = Some(trailers);
        self
    }
}

impl<S, E> Body for StreamBody<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<BoxError>,
{
    type Error = E;

    fn is_end_stream(&self) -> bool {
        self.done && self.trailers.is_none()
    }

    fn poll_data(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.stream).poll_next(cx) {
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            other => other,
        }
    }

    fn poll_trailers(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        Poll::Ready(Ok(self.get_mut().trailers.take()))
    }
}

impl<S> fmt::Debug for StreamBody<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamBody")
            .field("trailers", &self.trailers.is_some())
            .field("done", &self.done)
            .finish()
    }
}

// ===== BoxBody =====

/// A type-erased, `Send` body.
pub struct BoxBody {
    inner: Pin<Box<dyn Body<Error = BoxError> + Send + 'static>>,
}

impl BoxBody {
    pub fn new<B>(body: B) -> Self
    where
        B: Body + Send + 'static,
    {
        Self {
            inner: Box::pin(MapErr { inner: Box::pin(body) }),
        }
    }

    pub fn empty() -> Self {
        Self::new(())
    }
}

impl Default for BoxBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for BoxBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxBody").finish()
    }
}

impl Body for BoxBody {
    type Error = BoxError;

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn poll_data(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        self.inner.as_mut().poll_data(cx)
    }

    fn poll_trailers(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        self.inner.as_mut().poll_trailers(cx)
    }
}

struct MapErr<B> {
    inner: Pin<Box<B>>,
}

impl<B: Body> Body for MapErr<B> {
    type Error = BoxError;

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn poll_data(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        self.inner
            .as_mut()
            .poll_data(cx)
            .map(|chunk| chunk.map(|res| res.map_err(Into::into)))
    }

    fn poll_trailers(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        self.inner.as_mut().poll_trailers(cx).map_err(Into::into)
    }
}

// ===== RecvBody =====

/// Receive half of a stream, handed to services (server) and callers (client).
pub struct RecvBody {
    inner: h2::RecvStream,
    guard: Option<StreamGuard>,
}

impl RecvBody {
    pub(crate) fn new(inner: h2::RecvStream) -> Self {
        Self { inner, guard: None }
    }

    pub(crate) fn with_guard(inner: h2::RecvStream, guard: StreamGuard) -> Self {
        let mut body = Self {
            inner,
            guard: Some(guard),
        };
        body.finish_if_done();
        body
    }

    /// Identifier of the stream this body belongs to
    pub fn stream_id(&self) -> u32 {
        self.inner.stream_id().as_u32()
    }

    /// Receive the next data chunk.
    pub async fn data(&mut self) -> Option<Result<Bytes, Error>> {
        poll_fn(|cx| Pin::new(&mut *self).poll_data(cx)).await
    }

    /// Receive trailers once all data has been consumed.
    pub async fn trailers(&mut self) -> Result<Option<HeaderMap>, Error> {
        poll_fn(|cx| Pin::new(&mut *self).poll_trailers(cx)).await
    }

    /// Buffer the whole body.
    pub async fn collect(mut self) -> Result<Bytes, Error> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.data().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    fn finish_if_done(&mut self) {
        if self.inner.is_end_stream() {
            if let Some(guard) = self.guard.as_mut() {
                guard.finish();
            }
        }
    }

    fn map_err(&self, err: h2::Error) -> Error {
        let stream_id = self.stream_id();
        match &self.guard {
            Some(guard) => guard.classify(err),
            None => Error::from_stream(err, stream_id),
        }
    }
}

impl Body for RecvBody {
    type Error = Error;

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn poll_data(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Bytes, Self::Error>>> {
        let this = self.get_mut();
        let polled = this.inner.poll_data(cx);
        match polled {
            Poll::Ready(Some(Ok(chunk))) => {
                // local consumption acknowledgement: hand window back to the peer
                if let Err(err) = this.inner.flow_control().release_capacity(chunk.len()) {
                    return Poll::Ready(Some(Err(this.map_err(err))));
                }
                trace!(stream = this.stream_id(), len = chunk.len(), "recv data");
                this.finish_if_done();
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => Poll::Ready(Some(Err(this.map_err(err)))),
            Poll::Ready(None) => {
                this.finish_if_done();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_trailers(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        let this = self.get_mut();
        match this.inner.poll_trailers(cx) {
            Poll::Ready(Ok(trailers)) => {
                this.finish_if_done();
                Poll::Ready(Ok(trailers))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(this.map_err(err))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for RecvBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecvBody")
            .field("stream_id", &self.stream_id())
            .field("end_stream", &self.inner.is_end_stream())
            .finish()
    }
}

/// Collect any body into a single buffer.
pub async fn to_bytes<B: Body>(body: B) -> Result<Bytes, BoxError> {
    let mut body = std::pin::pin!(body);
    let mut buf = BytesMut::new();
    while let Some(chunk) = poll_fn(|cx| body.as_mut().poll_data(cx)).await {
        buf.extend_from_slice(&chunk.map_err(Into::into)?);
    }
    Ok(buf.freeze())
}
