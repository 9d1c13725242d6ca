// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by the runtime. Synchronous calls return these directly;
/// asynchronous failures arrive through `on_forward_response` carrying the
/// same values.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid parameters: {0}")]
    Params(&'static str),

    /// The subsystem is shutting down and cannot accept the operation.
    #[error("shutting down")]
    Closing,

    /// The subsystem has already shut down.
    #[error("closed")]
    Closed,

    /// An endpoint's pending-byte or pending-count cap was reached.
    #[error("endpoint buffer limit reached")]
    BufferLimit,

    /// A pending message expired before any connection became ready.
    #[error("peer timed out")]
    NodeTimeout,

    /// The worker id is valid but no such worker exists in the current pool.
    #[error("no available worker for id {0}")]
    NoAvailableWorker(u32),

    /// The target worker's private queue is at its configured cap.
    #[error("worker queue is full")]
    Busy,

    /// A module's `init()` missed its initialize deadline.
    #[error("operation timed out")]
    OperationTimeout,

    /// The registry rejected a request for missing or expired credentials.
    #[error("registry authentication missing or expired")]
    Unauthenticated,

    /// Opaque transport-level failure reported by a bus connector.
    #[error("transport failure: {0}")]
    Transport(String),

    /// A registry request failed with a network error or 5xx; it will be
    /// retried automatically.
    #[error("transient registry failure: {0}")]
    RegistryTransient(String),
}
