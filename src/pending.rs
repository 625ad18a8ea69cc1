//! Request/response pairs and the caller-facing response future.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;

use crate::error::{BatchError, BatchResult};

/// An accepted request paired with its one-shot completion slot.
///
/// A pair is uniquely owned at every moment: it moves from `submit` either
/// directly into a worker or into a queue slot, from which exactly one worker
/// extracts it. Resolution consumes the pair (or the [`Completion`] split off
/// it), so resolving twice is unrepresentable.
pub struct PendingResponse<Req, Resp, E> {
    request: Req,
    completion: Completion<Resp, E>,
}

impl<Req, Resp, E> PendingResponse<Req, Resp, E> {
    /// Creates an unresolved pair and the future the caller will hold.
    pub fn new(request: Req) -> (Self, ResponseFuture<Resp, E>) {
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                request,
                completion: Completion { sender },
            },
            ResponseFuture { receiver },
        )
    }

    /// Borrows the stored request.
    pub fn request(&self) -> &Req {
        &self.request
    }

    /// Splits the pair into the owned request (handed to the multiplexer)
    /// and the completion half (kept for the response fan-out).
    pub fn split(self) -> (Req, Completion<Resp, E>) {
        (self.request, self.completion)
    }

    /// Resolves the pair with a response. Returns `false` if the caller has
    /// already dropped its future.
    pub fn set_response(self, response: Resp) -> bool {
        self.completion.set_response(response)
    }

    /// Resolves the pair with an error. Returns `false` if the caller has
    /// already dropped its future.
    pub fn set_error(self, error: BatchError<E>) -> bool {
        self.completion.set_error(error)
    }
}

/// The resolution half of a split pair.
pub struct Completion<Resp, E> {
    sender: oneshot::Sender<BatchResult<Resp, E>>,
}

impl<Resp, E> Completion<Resp, E> {
    pub fn set_response(self, response: Resp) -> bool {
        self.sender.send(Ok(response)).is_ok()
    }

    pub fn set_error(self, error: BatchError<E>) -> bool {
        self.sender.send(Err(error)).is_ok()
    }
}

/// Caller-facing future for one submitted request.
///
/// Resolves exactly once, with the response, a batch-level error, or
/// [`BatchError::Disconnected`] when the batcher is torn down with the
/// request still queued.
pub struct ResponseFuture<Resp, E> {
    receiver: oneshot::Receiver<BatchResult<Resp, E>>,
}

impl<Resp, E> ResponseFuture<Resp, E> {
    /// Blocks the calling thread until the response arrives.
    pub fn wait(self) -> BatchResult<Resp, E> {
        futures::executor::block_on(self)
    }
}

impl<Resp, E> Future for ResponseFuture<Resp, E> {
    type Output = BatchResult<Resp, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(BatchError::Disconnected)),
            Poll::Pending => Poll::Pending,
        }
    }
}
