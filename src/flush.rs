//! Outbound body pump shared by both roles

use bytes::Bytes;
use h2::{Reason, SendStream};
use std::future::poll_fn;
use std::pin::pin;
use std::task::Poll;
use tracing::{debug, trace};

use crate::body::Body;
use crate::error::{BoxError, Error, StreamError};

enum Next {
    Chunk(Bytes),
    Done,
    Reset(Reason),
    Failed(h2::Error),
    Broken(BoxError),
}

/// Write `body` onto `stream`, honouring the peer's flow-control window.
///
/// Each frame carries at most the capacity granted so far, so one stream
/// never monopolises the connection writer.
pub(crate) async fn flush<B: Body>(body: B, stream: &mut SendStream<Bytes>) -> Result<(), Error> {
    let mut body = pin!(body);
    let stream_id = stream.stream_id().as_u32();

    loop {
        let next = poll_fn(|cx| {
            match stream.poll_reset(cx) {
                Poll::Ready(Ok(reason)) => return Poll::Ready(Next::Reset(reason)),
                Poll::Ready(Err(e)) => return Poll::Ready(Next::Failed(e)),
                Poll::Pending => {}
            }
            body.as_mut().poll_data(cx).map(|chunk| match chunk {
                Some(Ok(chunk)) => Next::Chunk(chunk),
                Some(Err(e)) => Next::Broken(e.into()),
                None => Next::Done,
            })
        })
        .await;

        match next {
            Next::Chunk(chunk) => {
                if chunk.is_empty() {
                    continue;
                }
                let eos = body.is_end_stream();
                send_chunk(stream, chunk, eos, stream_id).await?;
                if eos {
                    return Ok(());
                }
            }
            Next::Done => break,
            Next::Reset(reason) => {
                debug!(stream = stream_id, %reason, "peer reset stream while sending body");
                return Err(Error::Stream(StreamError {
                    stream_id,
                    reason,
                    remote: true,
                }));
            }
            Next::Failed(e) => return Err(Error::from_stream(e, stream_id)),
            Next::Broken(e) => {
                debug!(stream = stream_id, error = %e, "body failed, resetting stream");
                stream.send_reset(Reason::INTERNAL_ERROR);
                return Err(Error::Body(e));
            }
        }
    }

    match poll_fn(|cx| body.as_mut().poll_trailers(cx)).await {
        Ok(Some(trailers)) => stream
            .send_trailers(trailers)
            .map_err(|e| Error::from_stream(e, stream_id)),
        Ok(None) => stream
            .send_data(Bytes::new(), true)
            .map_err(|e| Error::from_stream(e, stream_id)),
        Err(e) => {
            stream.send_reset(Reason::INTERNAL_ERROR);
            Err(Error::Body(e.into()))
        }
    }
}

async fn send_chunk(
    stream: &mut SendStream<Bytes>,
    mut chunk: Bytes,
    eos: bool,
    stream_id: u32,
) -> Result<(), Error> {
    while !chunk.is_empty() {
        stream.reserve_capacity(chunk.len());

        let granted = match poll_fn(|cx| stream.poll_capacity(cx)).await {
            Some(Ok(0)) => continue,
            Some(Ok(n)) => n,
            Some(Err(e)) => return Err(Error::from_stream(e, stream_id)),
            None => {
                return Err(Error::Stream(StreamError {
                    stream_id,
                    reason: Reason::STREAM_CLOSED,
                    remote: false,
                }));
            }
        };

        let piece = chunk.split_to(granted.min(chunk.len()));
        let last = chunk.is_empty() && eos;
        trace!(stream = stream_id, len = piece.len(), eos = last, "send data");
        stream
            .send_data(piece, last)
            .map_err(|e| Error::from_stream(e, stream_id))?;
    }
    Ok(())
}
