use futures::future::BoxFuture;
use http::Response;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::body::RecvBody;
use crate::error::Error;

/// Resolves exactly once with the response head or an error.
///
/// Dropping it before resolution resets the stream with `CANCEL`.
#[must_use = "futures do nothing unless polled"]
pub struct ResponseFuture {
    inner: BoxFuture<'static, Result<Response<RecvBody>, Error>>,
}

impl ResponseFuture {
    pub(crate) fn new(inner: BoxFuture<'static, Result<Response<RecvBody>, Error>>) -> Self {
        Self { inner }
    }
}

impl Future for ResponseFuture {
    type Output = Result<Response<RecvBody>, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.as_mut().poll(cx)
    }
}

impl fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture").finish()
    }
}
