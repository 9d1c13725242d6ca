// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

mod app;
mod context;
mod discovery;
mod endpoint;
mod error;
mod metrics;
pub mod registry;
mod sender;
mod worker_pool;

pub use app::{
    App, AppCore, AppModule, AppState, CommandHandler, ConnectionEventHandler, EndpointKey,
    ForwardRequestHandler, ForwardResponseHandler, PlainEventHandler,
};
pub use context::Context;
pub use discovery::{
    DiscoveryNode, DiscoverySet, HashPoint, HashSearchMode, NodeHandle, HASH_POINT_PER_INS,
};
pub use endpoint::{ConnectionHandle, Connector, Endpoint, EndpointEvents, ForwardFrame};
pub use error::{CoreError, CoreResult};
pub use metrics::{test_metrics, Metrics};
pub use sender::Destination;
pub use worker_pool::{
    JobAction, TickAction, TickCallbackHandle, WorkerContext, WorkerMeta, WorkerPool,
    WorkerPoolModule, WorkerScalingMode, WorkerStatus,
};
