// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Session to the external strongly-consistent key-value registry: member
//! discovery, authentication, lease keepalive, ranged watches, and the app
//! module mirroring registry state into the discovery set.

mod client;
mod http;
mod keepalive;
mod kv;
mod module;
mod watcher;

pub use client::{EventCallback, EventHandle, RegistryClient, RequestStats};
pub use http::{
    HttpMethod, HttpMultiplexer, HttpPoll, HttpRequest, HttpRequestHandle, HttpRequestState,
    HttpResponse,
};
pub use keepalive::KeepaliveActor;
pub use kv::{
    lexicographic_successor, KeyValue, ResponseHeader, WatchBatch, WatchEvent, WatchEventKind,
    RANGE_END_SUCCESSOR,
};
pub use module::RegistryModule;
pub use watcher::{WatchHandler, Watcher};
