//! Error types for batchmux.

use std::fmt;
use std::sync::Arc;

/// Errors delivered through a [`ResponseFuture`](crate::ResponseFuture).
///
/// `E` is the multiplexer's own error type. A single multiplexer failure is
/// shared by every request in the failed batch, so that variant carries an
/// `Arc` and `Clone` does not require `E: Clone`.
#[derive(Debug)]
pub enum BatchError<E> {
    /// The multiplexer failed the batch containing this request.
    Multiplexer(Arc<E>),
    /// The multiplexer returned a response list whose length does not match
    /// the batch it was given.
    ResponseCountMismatch { expected: usize, actual: usize },
    /// The submitting thread received the cooperative cancellation signal
    /// while waiting for queue space. The request was never enqueued.
    Interrupted,
    /// The batcher was torn down before the request was executed.
    Disconnected,
}

impl<E> Clone for BatchError<E> {
    fn clone(&self) -> Self {
        match self {
            BatchError::Multiplexer(e) => BatchError::Multiplexer(Arc::clone(e)),
            BatchError::ResponseCountMismatch { expected, actual } => {
                BatchError::ResponseCountMismatch {
                    expected: *expected,
                    actual: *actual,
                }
            }
            BatchError::Interrupted => BatchError::Interrupted,
            BatchError::Disconnected => BatchError::Disconnected,
        }
    }
}

impl<E: fmt::Display> fmt::Display for BatchError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchError::Multiplexer(e) => write!(f, "multiplexer error: {}", e),
            BatchError::ResponseCountMismatch { expected, actual } => {
                write!(
                    f,
                    "expected {} responses for the batch, but got {}",
                    expected, actual
                )
            }
            BatchError::Interrupted => write!(f, "interrupted while waiting for queue space"),
            BatchError::Disconnected => write!(f, "batcher was dropped before execution"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BatchError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BatchError::Multiplexer(e) => Some(&**e),
            _ => None,
        }
    }
}

/// Result type carried by response futures.
pub type BatchResult<Resp, E> = std::result::Result<Resp, BatchError<E>>;
