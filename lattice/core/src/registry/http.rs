// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{CoreError, CoreResult};

/// HTTP verb. The registry's logical API is POST-only but the multiplexer
/// does not need to know that.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// One request handed to the multiplexer.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Overall deadline; `None` leaves the multiplexer's default in place.
    pub timeout: Option<Duration>,
    /// Enable TCP keepalive on the underlying socket (watch long-polls).
    pub tcp_keepalive: bool,
    /// Whether the connection may be pooled. Watch streams opt out.
    pub reuse_connection: bool,
}

impl HttpRequest {
    pub fn post(url: String, body: Vec<u8>) -> HttpRequest {
        HttpRequest {
            method: HttpMethod::Post,
            url,
            headers: Vec::new(),
            body,
            timeout: None,
            tcp_keepalive: false,
            reuse_connection: true,
        }
    }
}

/// Terminal outcome of a request.
#[derive(Clone, Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Progress of an in-flight request.
#[derive(Clone, Debug)]
pub enum HttpPoll {
    InFlight,
    /// The transport-level error case means the peer was never reached or the
    /// connection died; HTTP error statuses are `Ok` responses here. A request
    /// that hit its own deadline completes as `Err(OperationTimeout)`.
    Done(Result<HttpResponse, CoreError>),
}

/// An in-flight request. The owner polls it from the main-loop tick; body
/// fragments stream out through `take_chunks` ahead of completion so watch
/// long-polls can be consumed incrementally.
pub trait HttpRequestState: Send + Sync {
    /// Drains body fragments received since the last call.
    fn take_chunks(&self) -> Vec<Bytes>;

    fn poll(&self) -> HttpPoll;

    /// Abandons the request. Late chunks and the completion are dropped.
    fn cancel(&self);
}

pub type HttpRequestHandle = Arc<dyn HttpRequestState>;

/// The capabilities the registry client needs from an HTTP client: submit a
/// request with headers and body, observe the streaming body, observe
/// completion with a status code, cancel, and bound each request with a
/// timeout. Any HTTP/1 or HTTP/2 implementation can sit behind this.
pub trait HttpMultiplexer: Send + Sync {
    fn submit(&self, request: HttpRequest) -> CoreResult<HttpRequestHandle>;
}
