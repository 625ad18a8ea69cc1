//! # batchmux - request batching over a unary interface
//!
//! This crate provides a [`Batcher`] that accepts requests one at a time and
//! executes them in batches through a user-supplied [`Multiplexer`]. It is
//! built for hot paths where the downstream cost per call is dominated by
//! per-call overhead (remote cache RPCs and similar), where coalescing raises
//! throughput by orders of magnitude.
//!
//! ## Features
//!
//! - **Unary contract, batched execution**: `submit` returns a future per
//!   request; batches are an internal concern
//! - **Lock-free coordination**: a packed atomic counter arbitrates between
//!   producers and workers, backed by a bounded MPMC queue
//! - **Non-blocking producers**: `submit` never waits on workers except under
//!   queue saturation, where it sleeps in coarse backoff
//! - **Exactly-once execution**: every accepted request reaches exactly one
//!   batch and its future resolves exactly once
//!
//! ## Usage
//!
//! ```ignore
//! use batchmux::{Batcher, Multiplexer};
//! use futures::executor::ThreadPool;
//! use futures::future::{BoxFuture, FutureExt};
//!
//! struct CacheLookup { /* connection handle */ }
//!
//! impl Multiplexer for CacheLookup {
//!     type Request = Digest;
//!     type Response = Blob;
//!     type Error = RpcError;
//!
//!     fn execute(&self, requests: Vec<Digest>) -> BoxFuture<'static, Result<Vec<Blob>, RpcError>> {
//!         // One RPC for the whole batch; responses positionally aligned.
//!         self.bulk_lookup(requests).boxed()
//!     }
//! }
//!
//! let batcher = Batcher::new(ThreadPool::new()?, CacheLookup::connect()?, 4);
//!
//! // Hot path: unary submits, batched RPCs.
//! let blob = batcher.submit(digest).wait()?;
//! ```
//!
//! ## Architecture
//!
//! - [`batcher`]: the front-end and worker protocol ([`Batcher`],
//!   [`Executor`], [`Multiplexer`])
//! - [`fifo`]: bounded lock-free MPMC queue ([`ConcurrentFifo`])
//! - [`counter`]: packed (active-workers, request-count) word
//!   ([`counter::PackedCounter`])
//! - [`pending`]: request/response pairs and response futures
//!   ([`PendingResponse`], [`ResponseFuture`])
//! - [`error`]: error types ([`BatchError`])

pub mod batcher;
pub mod common;
pub mod counter;
pub mod error;
pub mod fifo;
pub mod pending;

pub use batcher::{Batcher, Executor, Multiplexer, BATCH_SIZE, QUEUE_CAPACITY, QUEUE_FULL_SLEEP};
pub use error::{BatchError, BatchResult};
pub use fifo::ConcurrentFifo;
pub use pending::{Completion, PendingResponse, ResponseFuture};
