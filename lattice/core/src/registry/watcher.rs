// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, Instant};

use rand::Rng as _;
use serde_json::Value;
use tracing::{debug, info, warn};

use lattice_config::RegistryParameters;

use crate::error::CoreError;
use crate::registry::http::{HttpPoll, HttpRequestHandle};
use crate::registry::kv::{
    unpack_bool, unpack_header, unpack_i64, unpack_key_value, unpack_string, ResponseHeader,
    WatchBatch, WatchEvent, WatchEventKind,
};

/// Services a watcher needs from its owning session.
pub(crate) trait WatcherHost {
    fn start_range_request(
        &mut self,
        key: &[u8],
        range_end: &[u8],
        timeout: Option<Duration>,
    ) -> Option<HttpRequestHandle>;

    fn start_watch_request(
        &mut self,
        key: &[u8],
        range_end: &[u8],
        start_revision: i64,
        prev_kv: bool,
        progress_notify: bool,
    ) -> Option<HttpRequestHandle>;

    fn on_transport_error(&mut self, error: &CoreError);

    fn on_http_failure(&mut self, status: u16, body: &[u8]);

    fn on_request_success(&mut self);
}

/// The watch stream has no explicit framing: logical objects are delimited by
/// bracket balance over the raw octets, across arbitrary chunk boundaries.
/// Values inside are base64, so content bytes cannot unbalance the count.
#[derive(Default)]
pub(crate) struct BalancedJsonStream {
    depth: i64,
    buffer: Vec<u8>,
}

impl BalancedJsonStream {
    pub(crate) fn reset(&mut self) {
        self.depth = 0;
        self.buffer.clear();
    }

    pub(crate) fn push(&mut self, mut input: &[u8], mut emit: impl FnMut(&[u8])) {
        while !input.is_empty() {
            if self.depth <= 0 {
                while let Some(&byte) = input.first() {
                    if byte == b'{' || byte == b'[' {
                        break;
                    }
                    input = &input[1..];
                }
                if input.is_empty() {
                    return;
                }
            }

            let mut depth = self.depth;
            let mut balanced_at = None;
            for (index, &byte) in input.iter().enumerate() {
                if byte == b'{' || byte == b'[' {
                    depth += 1;
                }
                if byte == b'}' || byte == b']' {
                    depth -= 1;
                    if depth <= 0 {
                        balanced_at = Some(index + 1);
                        break;
                    }
                }
            }

            match balanced_at {
                Some(length) => {
                    self.buffer.extend_from_slice(&input[..length]);
                    input = &input[length..];
                    let payload = std::mem::take(&mut self.buffer);
                    self.depth = 0;
                    emit(&payload);
                }
                None => {
                    self.buffer.extend_from_slice(input);
                    self.depth = depth;
                    return;
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WatcherPhase {
    /// Never started, or idle between requests.
    IdleInitial,
    /// Full snapshot (or retry-mode auth probe) in flight.
    RangeGet,
    /// Long-poll watch in flight.
    WatchOpen,
    /// Waiting out a retry interval after a failure.
    BackoffIdle,
}

pub type WatchHandler = Box<dyn FnMut(&ResponseHeader, &WatchBatch) + Send>;

/// One ranged watch against the registry. Drives
/// `RangeGet -> WatchOpen -> (restart | resnapshot | backoff)` per the
/// session tick; events are delivered through the registered handler.
pub struct Watcher {
    path: Vec<u8>,
    range_end: Vec<u8>,

    retry_interval: Duration,
    get_request_timeout: Duration,
    startup_delay_min: Duration,
    startup_delay_max: Duration,
    enable_progress_notify: bool,
    enable_prev_kv: bool,

    phase: WatcherPhase,
    retry_mode: bool,
    last_revision: i64,
    started: bool,
    next_request_time: Option<Instant>,

    rpc: Option<HttpRequestHandle>,
    stream: BalancedJsonStream,
    cancel_requested: bool,

    handler: Option<WatchHandler>,
}

impl Watcher {
    pub fn new(path: Vec<u8>, range_end: Vec<u8>, parameters: &RegistryParameters) -> Watcher {
        Watcher {
            path,
            range_end,
            retry_interval: parameters.watcher_retry_interval,
            get_request_timeout: parameters.watcher_get_request_timeout,
            startup_delay_min: parameters.watcher_startup_delay_min,
            startup_delay_max: parameters.watcher_startup_delay_max,
            enable_progress_notify: true,
            enable_prev_kv: false,
            phase: WatcherPhase::IdleInitial,
            retry_mode: false,
            last_revision: 0,
            started: false,
            next_request_time: None,
            rpc: None,
            stream: BalancedJsonStream::default(),
            cancel_requested: false,
            handler: None,
        }
    }

    pub fn set_handler(&mut self, handler: WatchHandler) {
        self.handler = Some(handler);
    }

    pub fn set_enable_prev_kv(&mut self, enable: bool) {
        self.enable_prev_kv = enable;
    }

    pub fn path(&self) -> &[u8] {
        &self.path
    }

    pub fn last_revision(&self) -> i64 {
        self.last_revision
    }

    /// Tears the watcher down; pending requests are cancelled and the handler
    /// dropped.
    pub(crate) fn close(&mut self) {
        if let Some(rpc) = self.rpc.take() {
            debug!("watcher cancels in-flight request");
            rpc.cancel();
        }
        self.phase = WatcherPhase::IdleInitial;
        self.retry_mode = false;
        self.last_revision = 0;
        self.stream.reset();
        self.handler = None;
    }

    /// Starts the next request when idle and due.
    pub(crate) fn maybe_start(&mut self, now: Instant, host: &mut dyn WatcherHost) {
        if self.rpc.is_some() {
            return;
        }

        if !self.started {
            self.started = true;
            if self.startup_delay_max > self.startup_delay_min
                && self.startup_delay_max > Duration::ZERO
            {
                let window = self.startup_delay_max - self.startup_delay_min;
                let jitter = rand::thread_rng().gen_range(Duration::ZERO..window);
                self.next_request_time = Some(now + self.startup_delay_min + jitter);
            } else if self.startup_delay_min > Duration::ZERO {
                self.next_request_time = Some(now + self.startup_delay_min);
            }
        }

        if let Some(due) = self.next_request_time {
            if now < due {
                return;
            }
        }
        self.next_request_time = None;

        if self.last_revision == 0 || self.retry_mode {
            // A retry-mode range probe uses an empty range-end and the default
            // timeout: it only exercises authentication before reopening.
            let (range_end, timeout): (&[u8], _) = if self.retry_mode {
                (&[], None)
            } else {
                (&self.range_end, Some(self.get_request_timeout))
            };
            match host.start_range_request(&self.path, range_end, timeout) {
                Some(rpc) => {
                    self.rpc = Some(rpc);
                    self.phase = WatcherPhase::RangeGet;
                }
                None => {
                    self.next_request_time = Some(now + self.retry_interval);
                    self.phase = WatcherPhase::BackoffIdle;
                }
            }
            return;
        }

        match host.start_watch_request(
            &self.path,
            &self.range_end,
            self.last_revision + 1,
            self.enable_prev_kv,
            self.enable_progress_notify,
        ) {
            Some(rpc) => {
                info!(
                    start_revision = self.last_revision + 1,
                    "watch stream opened"
                );
                self.rpc = Some(rpc);
                self.stream.reset();
                self.cancel_requested = false;
                self.phase = WatcherPhase::WatchOpen;
            }
            None => {
                self.next_request_time = Some(now + self.retry_interval);
                self.phase = WatcherPhase::BackoffIdle;
            }
        }
    }

    /// Drains streamed fragments and handles request completion.
    pub(crate) fn poll(&mut self, now: Instant, host: &mut dyn WatcherHost) {
        let Some(rpc) = self.rpc.clone() else {
            return;
        };

        if self.phase == WatcherPhase::WatchOpen {
            let chunks = rpc.take_chunks();
            if !chunks.is_empty() {
                let mut stream = std::mem::take(&mut self.stream);
                for chunk in &chunks {
                    let mut payloads: Vec<Vec<u8>> = Vec::new();
                    stream.push(chunk, |payload| payloads.push(payload.to_vec()));
                    for payload in payloads {
                        self.handle_watch_payload(&payload);
                    }
                }
                self.stream = stream;
            }

            if self.cancel_requested {
                self.cancel_requested = false;
                rpc.cancel();
                self.rpc = None;
                self.stream.reset();
                self.retry_mode = true;
                self.phase = WatcherPhase::IdleInitial;
                return;
            }
        }

        let outcome = match rpc.poll() {
            HttpPoll::InFlight => return,
            HttpPoll::Done(outcome) => outcome,
        };
        self.rpc = None;

        match self.phase {
            WatcherPhase::RangeGet => self.on_range_completed(outcome, now, host),
            WatcherPhase::WatchOpen => self.on_watch_completed(outcome, now, host),
            WatcherPhase::IdleInitial | WatcherPhase::BackoffIdle => {}
        }
    }

    fn on_range_completed(
        &mut self,
        outcome: Result<crate::registry::http::HttpResponse, CoreError>,
        now: Instant,
        host: &mut dyn WatcherHost,
    ) {
        let response = match outcome {
            Err(error) => {
                warn!(%error, "watch snapshot request failed");
                host.on_transport_error(&error);
                self.next_request_time = Some(now + self.retry_interval);
                self.phase = WatcherPhase::BackoffIdle;
                return;
            }
            Ok(response) if !response.is_success() => {
                warn!(status = response.status, "watch snapshot request rejected");
                host.on_http_failure(response.status, &response.body);
                self.next_request_time = Some(now + self.retry_interval);
                self.phase = WatcherPhase::BackoffIdle;
                return;
            }
            Ok(response) => response,
        };

        host.on_request_success();

        // The retry-mode probe only refreshes credentials; reopen right away.
        if self.retry_mode {
            self.retry_mode = false;
            self.next_request_time = None;
            self.phase = WatcherPhase::IdleInitial;
            return;
        }

        let Ok(document) = serde_json::from_slice::<Value>(&response.body) else {
            warn!("watch snapshot response is not valid JSON");
            self.next_request_time = Some(now + self.retry_interval);
            self.phase = WatcherPhase::BackoffIdle;
            return;
        };

        let header = document
            .get("header")
            .map(unpack_header)
            .unwrap_or_default();
        if header.revision == 0 {
            warn!("watch snapshot response has no header revision");
            self.next_request_time = Some(now + self.retry_interval);
            self.phase = WatcherPhase::BackoffIdle;
            return;
        }
        self.last_revision = header.revision;

        let mut events = Vec::new();
        if let Some(Value::Array(kvs)) = document.get("kvs") {
            events.reserve(kvs.len());
            for kv in kvs {
                events.push(WatchEvent {
                    // Snapshot rows all read as PUT.
                    kind: WatchEventKind::Put,
                    kv: unpack_key_value(kv),
                    prev_kv: None,
                });
            }
        }
        debug!(
            revision = header.revision,
            events = events.len(),
            "watch snapshot applied"
        );

        let batch = WatchBatch::new_snapshot(events);
        if let Some(handler) = self.handler.as_mut() {
            handler(&header, &batch);
        }

        self.next_request_time = None;
        self.phase = WatcherPhase::IdleInitial;
    }

    fn on_watch_completed(
        &mut self,
        outcome: Result<crate::registry::http::HttpResponse, CoreError>,
        now: Instant,
        host: &mut dyn WatcherHost,
    ) {
        // Any watch termination goes through a retry-mode probe first, which
        // exercises a possibly rotated auth token cheaply.
        self.retry_mode = true;
        self.stream.reset();
        self.phase = WatcherPhase::IdleInitial;

        match outcome {
            // Hitting the long-poll deadline is the normal keepalive path.
            Err(CoreError::OperationTimeout) => {
                self.next_request_time = None;
            }
            Err(error) => {
                warn!(%error, "watch stream failed");
                host.on_transport_error(&error);
                self.next_request_time = Some(now + self.retry_interval);
                self.phase = WatcherPhase::BackoffIdle;
            }
            Ok(response) if response.is_success() => {
                host.on_request_success();
                self.next_request_time = None;
            }
            Ok(response) => {
                warn!(status = response.status, "watch stream rejected");
                host.on_http_failure(response.status, &response.body);
                self.next_request_time = Some(now + self.retry_interval);
                self.phase = WatcherPhase::BackoffIdle;
            }
        }
    }

    fn handle_watch_payload(&mut self, payload: &[u8]) {
        let Ok(document) = serde_json::from_slice::<Value>(payload) else {
            return;
        };
        if !document.is_object() {
            return;
        }

        let root = document.get("result").unwrap_or(&document);

        let previous_revision = self.last_revision;
        let header = root.get("header").map(unpack_header).unwrap_or_default();
        if header.revision != 0 {
            self.last_revision = header.revision;
        }

        let mut batch = WatchBatch {
            watch_id: unpack_i64(root, "watch_id"),
            compact_revision: unpack_i64(root, "compact_revision"),
            created: unpack_bool(root, "created"),
            canceled: unpack_bool(root, "canceled"),
            cancel_reason: unpack_string(root, "cancel_reason").unwrap_or_default(),
            snapshot: false,
            events: Vec::new(),
        };

        if let Some(Value::Array(events)) = root.get("events") {
            batch.events.reserve(events.len());
            for event in events {
                let kind = match event.get("type") {
                    Some(Value::String(text)) if text.eq_ignore_ascii_case("DELETE") => {
                        WatchEventKind::Delete
                    }
                    Some(Value::Number(number)) if number.as_i64() == Some(1) => {
                        WatchEventKind::Delete
                    }
                    // The server may omit the default (PUT) value entirely.
                    _ => WatchEventKind::Put,
                };
                batch.events.push(WatchEvent {
                    kind,
                    kv: event.get("kv").map(unpack_key_value).unwrap_or_default(),
                    prev_kv: event.get("prev_kv").map(unpack_key_value),
                });
            }
        }

        debug!(
            watch_id = batch.watch_id,
            canceled = batch.canceled,
            events = batch.events.len(),
            "watch batch received"
        );

        let canceled = batch.canceled;
        let compact_revision = batch.compact_revision;
        if let Some(handler) = self.handler.as_mut() {
            handler(&header, &batch);
        }

        if canceled {
            info!(
                previous_revision,
                compact_revision,
                reason = %batch.cancel_reason,
                "watch canceled by server"
            );
            // Past the compaction horizon the incremental stream is unusable;
            // force a fresh snapshot.
            if previous_revision < compact_revision {
                self.last_revision = 0;
            }
            self.cancel_requested = true;
        }
    }
}
