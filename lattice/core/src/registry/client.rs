// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng as _};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::context::Context;
use crate::error::{CoreError, CoreResult};
use crate::registry::http::{
    HttpMultiplexer, HttpPoll, HttpRequest, HttpRequestHandle, HttpResponse,
};
use crate::registry::keepalive::{KeepaliveActor, KeepaliveWriteOutcome};
use crate::registry::kv::{pack_base64, pack_key_range, unpack_i64, unpack_string};
use crate::registry::watcher::{Watcher, WatcherHost};

const API_AUTHENTICATE: &str = "/v3/auth/authenticate";
const API_AUTH_USER_GET: &str = "/v3/auth/user/get";
const API_MEMBER_LIST: &str = "/v3/cluster/member/list";
const API_LEASE_GRANT: &str = "/v3/lease/grant";
const API_LEASE_KEEPALIVE: &str = "/v3/lease/keepalive";
const API_LEASE_REVOKE: &str = "/v3/lease/revoke";
const API_KV_RANGE: &str = "/v3/kv/range";
const API_KV_PUT: &str = "/v3/kv/put";
const API_KV_DELETE: &str = "/v3/kv/deleterange";
const API_WATCH: &str = "/v3/watch";

/// HTTP status the registry uses for expired or missing credentials.
const STATUS_UNAUTHENTICATED: u16 = 401;
/// gRPC-gateway code carried in error bodies for the same condition.
const GRPC_CODE_UNAUTHENTICATED: i64 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RequestKind {
    MemberList,
    Authenticate,
    UserGet,
    LeaseGrant,
    LeaseKeepalive,
    LeaseRevoke,
    KvGet,
    KvSet,
    KvDel,
    Watch,
}

impl RequestKind {
    fn label(self) -> &'static str {
        match self {
            RequestKind::MemberList => "member_list",
            RequestKind::Authenticate => "authenticate",
            RequestKind::UserGet => "user_get",
            RequestKind::LeaseGrant => "lease_grant",
            RequestKind::LeaseKeepalive => "lease_keepalive",
            RequestKind::LeaseRevoke => "lease_revoke",
            RequestKind::KvGet => "kv_get",
            RequestKind::KvSet => "kv_set",
            RequestKind::KvDel => "kv_del",
            RequestKind::Watch => "watch",
        }
    }
}

/// Aggregate request accounting, exposed for operators and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestStats {
    pub sum_created: u64,
    pub sum_success: u64,
    pub sum_error: u64,
    pub continue_success: u64,
    pub continue_error: u64,
}

/// Session lifecycle. Booleans like "running" and "closing" derive from this
/// instead of living as independent flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SessionPhase {
    /// Constructed, no multiplexer yet.
    Created,
    /// Connected to the cluster but the lease (when required) is not held.
    Connecting,
    /// Lease held (or not required); keepalive actors are live.
    Running,
    /// Shutting down; only the lease revoke may still be in flight.
    Closing,
    Closed,
}

pub type EventCallback = Box<dyn FnMut() + Send>;

/// Handle for removing an up/down event callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventHandle(u64);

struct PathDeletor {
    path: String,
    attempts: u32,
    rpc: Option<HttpRequestHandle>,
}

/// Long-lived session to the registry: member discovery, authentication,
/// lease keepalive, keepalive actors, ranged watchers and deferred path
/// deletes, all advanced from the main-loop tick.
pub struct RegistryClient {
    context: Arc<Context>,
    multiplexer: Option<Arc<dyn HttpMultiplexer>>,

    phase: SessionPhase,
    lease_enabled: bool,
    lease: i64,

    conf_hosts: Vec<String>,
    hosts: Vec<String>,
    selected_host: String,

    auth_header: Option<String>,
    auth_roles: Vec<String>,

    next_members_update: Option<Instant>,
    next_keepalive: Option<Instant>,
    next_authenticate: Option<Instant>,
    next_auth_user_get: Option<Instant>,
    last_tick_time: Instant,

    rpc_members: Option<HttpRequestHandle>,
    rpc_auth: Option<HttpRequestHandle>,
    auth_rpc_is_user_get: bool,
    rpc_lease: Option<HttpRequestHandle>,
    lease_rpc_is_grant: bool,
    rpc_lease_revoke: Option<HttpRequestHandle>,

    keepalive_actors: Vec<Arc<Mutex<KeepaliveActor>>>,
    watchers: Vec<Arc<Mutex<Watcher>>>,
    deletors: HashMap<String, PathDeletor>,

    on_event_up: Vec<(u64, EventCallback)>,
    on_event_down: Vec<(u64, EventCallback)>,
    next_event_handle: u64,

    stats: RequestStats,
    rng: StdRng,
}

impl RegistryClient {
    pub fn new(context: Arc<Context>) -> RegistryClient {
        let conf_hosts = context.parameters.registry.hosts.clone();
        RegistryClient {
            context,
            multiplexer: None,
            phase: SessionPhase::Created,
            lease_enabled: false,
            lease: 0,
            conf_hosts,
            hosts: Vec::new(),
            selected_host: String::new(),
            auth_header: None,
            auth_roles: Vec::new(),
            next_members_update: None,
            next_keepalive: None,
            next_authenticate: None,
            next_auth_user_get: None,
            last_tick_time: Instant::now(),
            rpc_members: None,
            rpc_auth: None,
            auth_rpc_is_user_get: false,
            rpc_lease: None,
            lease_rpc_is_grant: false,
            rpc_lease_revoke: None,
            keepalive_actors: Vec::new(),
            watchers: Vec::new(),
            deletors: HashMap::new(),
            on_event_up: Vec::new(),
            on_event_down: Vec::new(),
            next_event_handle: 0,
            stats: RequestStats::default(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Binds the HTTP multiplexer and arms the session. With cluster
    /// auto-update disabled the host list is fixed to the configured seeds.
    pub fn init(&mut self, multiplexer: Arc<dyn HttpMultiplexer>) {
        self.multiplexer = Some(multiplexer);
        self.phase = SessionPhase::Connecting;
        if !self.context.parameters.registry.cluster_auto_update && !self.conf_hosts.is_empty() {
            let index = self.rng.gen_range(0..self.conf_hosts.len());
            self.selected_host = self.conf_hosts[index].clone();
            info!(host = %self.selected_host, "registry host pinned from configuration");
        }
    }

    pub fn is_available(&self) -> bool {
        self.multiplexer.is_some()
            && !matches!(self.phase, SessionPhase::Closing | SessionPhase::Closed)
            && !self.selected_host.is_empty()
            && self.check_authorization()
    }

    pub fn is_running(&self) -> bool {
        self.phase == SessionPhase::Running
    }

    pub fn is_closed(&self) -> bool {
        self.phase == SessionPhase::Closed
    }

    pub fn lease(&self) -> i64 {
        self.lease
    }

    pub fn set_lease_enabled(&mut self, enable: bool) {
        self.lease_enabled = enable;
    }

    pub fn selected_host(&self) -> &str {
        &self.selected_host
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn stats(&self) -> RequestStats {
        self.stats
    }

    pub fn auth_roles(&self) -> &[String] {
        &self.auth_roles
    }

    pub fn tick(&mut self) -> usize {
        self.tick_at(Instant::now())
    }

    /// One advance of the session. Each step starts at most one request of
    /// its kind; the return value counts requests started.
    pub fn tick_at(&mut self, now: Instant) -> usize {
        if self.multiplexer.is_none() {
            return 0;
        }
        self.last_tick_time = now;

        if matches!(self.phase, SessionPhase::Closing | SessionPhase::Closed) {
            self.poll_lease_revoke();
            return 0;
        }

        self.poll_completions(now);
        if matches!(self.phase, SessionPhase::Closing | SessionPhase::Closed) {
            return 0;
        }

        let mut started = 0;

        if self.context.parameters.registry.cluster_auto_update && due(self.next_members_update, now)
        {
            started += usize::from(self.create_request_member_update(now));
        }

        if self.selected_host.is_empty() {
            return started;
        }

        if !self.check_authorization() {
            if self.rpc_auth.is_none() {
                started += usize::from(self.create_request_authenticate(now));
            }
            return started;
        }

        if !self.context.parameters.registry.authorization.is_empty()
            && self.rpc_auth.is_none()
            && due(self.next_auth_user_get, now)
        {
            started += usize::from(self.create_request_auth_user_get(now));
        }

        if self.lease_enabled {
            if self.lease == 0 {
                started += usize::from(self.create_request_lease_grant(now));
                // Everything else waits for the lease.
                return started;
            }
            if due(self.next_keepalive, now) {
                started += usize::from(self.create_request_lease_keepalive(now));
            }
        } else if self.phase == SessionPhase::Connecting {
            self.set_running(true);
        }

        self.retry_pending_actions(now);
        started
    }

    /// Shuts the session down, revoking a held lease. `wait` blocks on the
    /// revoke round-trip; otherwise later ticks complete it.
    pub fn close(&mut self, wait: bool) {
        if matches!(self.phase, SessionPhase::Closing | SessionPhase::Closed) {
            return;
        }
        info!(lease = self.lease, "registry session closing");

        if self.phase == SessionPhase::Running {
            self.set_running(false);
        }
        self.phase = SessionPhase::Closing;

        for rpc in [
            self.rpc_members.take(),
            self.rpc_auth.take(),
            self.rpc_lease.take(),
        ]
        .into_iter()
        .flatten()
        {
            rpc.cancel();
        }
        for watcher in &self.watchers {
            watcher.lock().close();
        }
        self.watchers.clear();
        for actor in &self.keepalive_actors {
            actor.lock().cancel_rpc();
        }
        self.keepalive_actors.clear();
        for deletor in self.deletors.values_mut() {
            if let Some(rpc) = deletor.rpc.take() {
                rpc.cancel();
            }
        }
        self.deletors.clear();

        if self.lease != 0 && !self.selected_host.is_empty() {
            let mut body = Map::new();
            body.insert("ID".to_string(), Value::from(self.lease));
            self.rpc_lease_revoke =
                self.start_request(RequestKind::LeaseRevoke, API_LEASE_REVOKE, body, None, false);
        }
        self.lease = 0;

        if wait {
            let deadline =
                Instant::now() + self.context.parameters.registry.request_timeout;
            while self.rpc_lease_revoke.is_some() && Instant::now() < deadline {
                self.poll_lease_revoke();
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        if self.rpc_lease_revoke.is_none() {
            self.phase = SessionPhase::Closed;
        }
    }

    // ---- keepalive actors ------------------------------------------------

    pub fn add_keepalive(&mut self, actor: Arc<Mutex<KeepaliveActor>>) -> bool {
        if matches!(self.phase, SessionPhase::Closing | SessionPhase::Closed) {
            return false;
        }
        if self
            .keepalive_actors
            .iter()
            .any(|existing| Arc::ptr_eq(existing, &actor))
        {
            return false;
        }

        self.lease_enabled = true;
        // A pending delete for the same path would race the new actor.
        if let Some(mut deletor) = self.deletors.remove(actor.lock().path()) {
            if let Some(rpc) = deletor.rpc.take() {
                rpc.cancel();
            }
        }
        self.keepalive_actors.push(actor);
        true
    }

    /// Removes an actor; if it ever wrote data the path is deleted through a
    /// bounded-retry deletor that outlives the actor.
    pub fn remove_keepalive(&mut self, actor: &Arc<Mutex<KeepaliveActor>>) -> bool {
        let Some(position) = self
            .keepalive_actors
            .iter()
            .position(|existing| Arc::ptr_eq(existing, actor))
        else {
            return false;
        };
        self.keepalive_actors.swap_remove(position);

        let mut guard = actor.lock();
        guard.cancel_rpc();
        if guard.has_data() {
            let path = guard.path().to_string();
            drop(guard);
            if let Some(mut previous) = self.deletors.remove(&path) {
                if let Some(rpc) = previous.rpc.take() {
                    rpc.cancel();
                }
            }
            self.deletors.insert(
                path.clone(),
                PathDeletor {
                    path,
                    attempts: 0,
                    rpc: None,
                },
            );
        }
        true
    }

    // ---- watchers --------------------------------------------------------

    pub fn add_watcher(&mut self, watcher: Arc<Mutex<Watcher>>) -> bool {
        if matches!(self.phase, SessionPhase::Closing | SessionPhase::Closed) {
            return false;
        }
        if self
            .watchers
            .iter()
            .any(|existing| Arc::ptr_eq(existing, &watcher))
        {
            return false;
        }
        self.watchers.push(watcher);
        true
    }

    pub fn remove_watcher(&mut self, watcher: &Arc<Mutex<Watcher>>) -> bool {
        let Some(position) = self
            .watchers
            .iter()
            .position(|existing| Arc::ptr_eq(existing, watcher))
        else {
            return false;
        };
        self.watchers.swap_remove(position);
        watcher.lock().close();
        true
    }

    // ---- up/down events --------------------------------------------------

    pub fn add_on_event_up(
        &mut self,
        mut callback: EventCallback,
        trigger_if_running: bool,
    ) -> EventHandle {
        if trigger_if_running && self.phase == SessionPhase::Running {
            callback();
        }
        let handle = EventHandle(self.next_event_handle);
        self.next_event_handle += 1;
        self.on_event_up.push((handle.0, callback));
        handle
    }

    pub fn remove_on_event_up(&mut self, handle: EventHandle) {
        self.on_event_up.retain(|(id, _)| *id != handle.0);
    }

    pub fn add_on_event_down(
        &mut self,
        mut callback: EventCallback,
        trigger_if_not_running: bool,
    ) -> EventHandle {
        if trigger_if_not_running && self.phase != SessionPhase::Running {
            callback();
        }
        let handle = EventHandle(self.next_event_handle);
        self.next_event_handle += 1;
        self.on_event_down.push((handle.0, callback));
        handle
    }

    pub fn remove_on_event_down(&mut self, handle: EventHandle) {
        self.on_event_down.retain(|(id, _)| *id != handle.0);
    }

    // ---- request builders ------------------------------------------------

    pub fn create_request_kv_get(
        &mut self,
        key: &[u8],
        range_end: &[u8],
        limit: i64,
        revision: i64,
    ) -> CoreResult<HttpRequestHandle> {
        self.ensure_open()?;
        let mut body = Map::new();
        pack_key_range(&mut body, key, range_end);
        body.insert("limit".to_string(), Value::from(limit));
        body.insert("revision".to_string(), Value::from(revision));
        self.start_request(RequestKind::KvGet, API_KV_RANGE, body, None, false)
            .ok_or_else(|| CoreError::RegistryTransient("kv_get submit failed".to_string()))
    }

    pub fn create_request_kv_set(
        &mut self,
        key: &[u8],
        value: &[u8],
        assign_lease: bool,
        prev_kv: bool,
        ignore_value: bool,
        ignore_lease: bool,
    ) -> CoreResult<HttpRequestHandle> {
        self.ensure_open()?;
        if assign_lease && self.lease == 0 {
            return Err(CoreError::Params("no lease to assign"));
        }
        let mut body = Map::new();
        pack_base64(&mut body, "key", key);
        pack_base64(&mut body, "value", value);
        if assign_lease {
            body.insert("lease".to_string(), Value::from(self.lease));
        }
        body.insert("prev_kv".to_string(), Value::from(prev_kv));
        body.insert("ignore_value".to_string(), Value::from(ignore_value));
        body.insert("ignore_lease".to_string(), Value::from(ignore_lease));
        self.start_request(RequestKind::KvSet, API_KV_PUT, body, None, false)
            .ok_or_else(|| CoreError::RegistryTransient("kv_set submit failed".to_string()))
    }

    pub fn create_request_kv_del(
        &mut self,
        key: &[u8],
        range_end: &[u8],
        prev_kv: bool,
    ) -> CoreResult<HttpRequestHandle> {
        self.ensure_open()?;
        let mut body = Map::new();
        pack_key_range(&mut body, key, range_end);
        body.insert("prev_kv".to_string(), Value::from(prev_kv));
        self.start_request(RequestKind::KvDel, API_KV_DELETE, body, None, false)
            .ok_or_else(|| CoreError::RegistryTransient("kv_del submit failed".to_string()))
    }

    pub fn create_request_watch(
        &mut self,
        key: &[u8],
        range_end: &[u8],
        start_revision: i64,
        prev_kv: bool,
        progress_notify: bool,
    ) -> CoreResult<HttpRequestHandle> {
        self.ensure_open()?;
        let mut create_request = Map::new();
        pack_key_range(&mut create_request, key, range_end);
        if prev_kv {
            create_request.insert("prev_kv".to_string(), Value::from(true));
        }
        if progress_notify {
            create_request.insert("progress_notify".to_string(), Value::from(true));
        }
        if start_revision != 0 {
            create_request.insert("start_revision".to_string(), Value::from(start_revision));
        }
        let mut body = Map::new();
        body.insert(
            "create_request".to_string(),
            Value::Object(create_request),
        );
        let timeout = self.context.parameters.registry.watcher_request_timeout;
        self.start_request(RequestKind::Watch, API_WATCH, body, Some(timeout), true)
            .ok_or_else(|| CoreError::RegistryTransient("watch submit failed".to_string()))
    }

    // ---- internals -------------------------------------------------------

    fn ensure_open(&self) -> CoreResult<()> {
        match self.phase {
            SessionPhase::Closed => Err(CoreError::Closed),
            SessionPhase::Closing => Err(CoreError::Closing),
            _ if self.multiplexer.is_none() || self.selected_host.is_empty() => {
                Err(CoreError::Params("registry session not connected"))
            }
            _ => Ok(()),
        }
    }

    fn check_authorization(&self) -> bool {
        self.context.parameters.registry.authorization.is_empty() || self.auth_header.is_some()
    }

    fn authorization_user(&self) -> (String, String) {
        let authorization = &self.context.parameters.registry.authorization;
        match authorization.split_once(':') {
            Some((user, password)) => (user.to_string(), password.to_string()),
            None => (authorization.clone(), String::new()),
        }
    }

    fn start_request(
        &mut self,
        kind: RequestKind,
        api_path: &str,
        body: Map<String, Value>,
        timeout: Option<Duration>,
        watch_stream: bool,
    ) -> Option<HttpRequestHandle> {
        let multiplexer = self.multiplexer.clone()?;
        let url = format!("{}{}", self.selected_host, api_path);
        self.stats_created(kind);

        let mut request = HttpRequest::post(
            url,
            serde_json::to_vec(&Value::Object(body)).unwrap_or_default(),
        );
        request
            .headers
            .push(("Content-Type".to_string(), "application/json".to_string()));
        if let Some(token) = &self.auth_header {
            request
                .headers
                .push(("Authorization".to_string(), token.clone()));
        }
        request.timeout =
            Some(timeout.unwrap_or(self.context.parameters.registry.request_timeout));
        if watch_stream {
            request.tcp_keepalive = true;
            request.reuse_connection = false;
        }

        match multiplexer.submit(request) {
            Ok(handle) => Some(handle),
            Err(submit_error) => {
                warn!(kind = kind.label(), %submit_error, "registry request submit failed");
                self.stats_error(kind);
                None
            }
        }
    }

    fn create_request_member_update(&mut self, now: Instant) -> bool {
        if self.rpc_members.is_some() {
            return false;
        }
        let pool = if !self.hosts.is_empty() {
            &self.hosts
        } else {
            &self.conf_hosts
        };
        if pool.is_empty() {
            return false;
        }

        let interval = self.context.parameters.registry.members_update_interval;
        self.next_members_update = Some(now + interval.max(Duration::from_secs(1)));

        let host = pool[self.rng.gen_range(0..pool.len())].clone();
        let multiplexer = match self.multiplexer.clone() {
            Some(multiplexer) => multiplexer,
            None => return false,
        };
        self.stats_created(RequestKind::MemberList);

        let mut request = HttpRequest::post(format!("{host}{API_MEMBER_LIST}"), b"{}".to_vec());
        request
            .headers
            .push(("Content-Type".to_string(), "application/json".to_string()));
        if let Some(token) = &self.auth_header {
            request
                .headers
                .push(("Authorization".to_string(), token.clone()));
        }
        request.timeout = Some(self.context.parameters.registry.request_timeout);

        match multiplexer.submit(request) {
            Ok(handle) => {
                debug!(%host, "registry member list requested");
                self.rpc_members = Some(handle);
                true
            }
            Err(submit_error) => {
                warn!(%submit_error, "registry member list submit failed");
                self.stats_error(RequestKind::MemberList);
                false
            }
        }
    }

    fn create_request_authenticate(&mut self, now: Instant) -> bool {
        if self.context.parameters.registry.authorization.is_empty() {
            self.auth_header = None;
            return false;
        }
        if !due(self.next_authenticate, now) {
            return false;
        }
        let retry = self
            .context
            .parameters
            .registry
            .authorization_retry_interval
            .max(Duration::from_secs(1));
        self.next_authenticate = Some(now + retry);

        let (user, password) = self.authorization_user();
        let mut body = Map::new();
        body.insert("name".to_string(), Value::from(user.clone()));
        body.insert("password".to_string(), Value::from(password));
        match self.start_request(RequestKind::Authenticate, API_AUTHENTICATE, body, None, false) {
            Some(handle) => {
                info!(%user, "registry authenticate requested");
                self.rpc_auth = Some(handle);
                self.auth_rpc_is_user_get = false;
                true
            }
            None => false,
        }
    }

    fn create_request_auth_user_get(&mut self, now: Instant) -> bool {
        let interval = self.context.parameters.registry.auth_user_get_interval;
        self.next_auth_user_get = Some(now + interval.max(Duration::from_secs(1)));

        let (user, _) = self.authorization_user();
        let mut body = Map::new();
        body.insert("name".to_string(), Value::from(user));
        match self.start_request(RequestKind::UserGet, API_AUTH_USER_GET, body, None, false) {
            Some(handle) => {
                self.rpc_auth = Some(handle);
                self.auth_rpc_is_user_get = true;
                true
            }
            None => false,
        }
    }

    fn create_request_lease_grant(&mut self, now: Instant) -> bool {
        if self.rpc_lease.is_some() {
            return false;
        }
        let interval = self
            .context
            .parameters
            .registry
            .keepalive_interval
            .max(Duration::from_secs(1));
        self.next_keepalive = Some(now + interval);

        let ttl = self.context.parameters.registry.lease_ttl.as_secs() as i64;
        let mut body = Map::new();
        body.insert("ID".to_string(), Value::from(self.lease));
        body.insert("TTL".to_string(), Value::from(ttl));
        match self.start_request(RequestKind::LeaseGrant, API_LEASE_GRANT, body, None, false) {
            Some(handle) => {
                debug!(ttl, "registry lease grant requested");
                self.rpc_lease = Some(handle);
                self.lease_rpc_is_grant = true;
                true
            }
            None => false,
        }
    }

    fn create_request_lease_keepalive(&mut self, now: Instant) -> bool {
        if self.rpc_lease.is_some() || self.lease == 0 {
            return false;
        }
        let interval = self
            .context
            .parameters
            .registry
            .keepalive_interval
            .max(Duration::from_secs(1));
        self.next_keepalive = Some(now + interval);

        let mut body = Map::new();
        body.insert("ID".to_string(), Value::from(self.lease));
        match self.start_request(
            RequestKind::LeaseKeepalive,
            API_LEASE_KEEPALIVE,
            body,
            None,
            false,
        ) {
            Some(handle) => {
                self.rpc_lease = Some(handle);
                self.lease_rpc_is_grant = false;
                true
            }
            None => false,
        }
    }

    fn poll_completions(&mut self, now: Instant) {
        if let Some(rpc) = self.rpc_members.clone() {
            if let HttpPoll::Done(outcome) = rpc.poll() {
                self.rpc_members = None;
                self.on_member_update_response(outcome);
            }
        }

        if let Some(rpc) = self.rpc_auth.clone() {
            if let HttpPoll::Done(outcome) = rpc.poll() {
                self.rpc_auth = None;
                if self.auth_rpc_is_user_get {
                    self.on_auth_user_get_response(outcome);
                } else {
                    self.on_authenticate_response(outcome, now);
                }
            }
        }

        if let Some(rpc) = self.rpc_lease.clone() {
            if let HttpPoll::Done(outcome) = rpc.poll() {
                self.rpc_lease = None;
                let is_grant = self.lease_rpc_is_grant;
                self.on_lease_response(outcome, is_grant);
            }
        }

        for actor in self.keepalive_actors.clone() {
            let outcome = actor.lock().poll_rpc();
            match outcome {
                None => {}
                Some(KeepaliveWriteOutcome::Success) => self.stats_success(RequestKind::KvSet),
                Some(KeepaliveWriteOutcome::HttpRejected { status, body }) => {
                    self.stats_error(RequestKind::KvSet);
                    self.check_authorization_expired(status, &body);
                }
                Some(KeepaliveWriteOutcome::TransportFailed(_)) => {
                    self.stats_error(RequestKind::KvSet);
                    self.note_network_error();
                }
            }
        }

        for watcher in self.watchers.clone() {
            watcher.lock().poll(now, self);
        }

        self.poll_deletors();
    }

    fn poll_deletors(&mut self) {
        let mut finished = Vec::new();
        let mut failed = Vec::new();
        for (path, deletor) in self.deletors.iter_mut() {
            let Some(rpc) = deletor.rpc.as_ref() else {
                continue;
            };
            match rpc.poll() {
                HttpPoll::InFlight => {}
                HttpPoll::Done(Ok(response))
                    if response.is_success() || response.status == 404 =>
                {
                    info!(%path, "keepalive path deleted");
                    deletor.rpc = None;
                    finished.push(path.clone());
                }
                HttpPoll::Done(Ok(response)) => {
                    deletor.rpc = None;
                    failed.push((path.clone(), Some(response)));
                }
                HttpPoll::Done(Err(_)) => {
                    deletor.rpc = None;
                    failed.push((path.clone(), None));
                }
            }
        }

        for path in finished {
            self.stats_success(RequestKind::KvDel);
            self.deletors.remove(&path);
        }
        for (path, response) in failed {
            warn!(%path, "keepalive path delete failed");
            self.stats_error(RequestKind::KvDel);
            match response {
                Some(response) => {
                    self.check_authorization_expired(response.status, &response.body)
                }
                None => self.note_network_error(),
            }
        }
    }

    /// Re-activates deferred work: keepalive writes while the lease is held,
    /// watcher restarts, and pending path deletes.
    fn retry_pending_actions(&mut self, now: Instant) {
        if self.lease != 0 {
            for actor in self.keepalive_actors.clone() {
                self.ensure_keepalive_write(&actor);
            }
        }

        for watcher in self.watchers.clone() {
            watcher.lock().maybe_start(now, self);
        }

        let max_attempts = self.context.parameters.registry.keepalive_retry_times.max(1);
        let idle_paths: Vec<String> = self
            .deletors
            .values()
            .filter(|deletor| deletor.rpc.is_none())
            .map(|deletor| deletor.path.clone())
            .collect();
        for path in idle_paths {
            let attempts = match self.deletors.get(&path) {
                Some(deletor) => deletor.attempts,
                None => continue,
            };
            if attempts >= max_attempts {
                error!(%path, attempts, "keepalive path delete exhausted retries");
                self.deletors.remove(&path);
                continue;
            }
            let rpc = self
                .create_request_kv_del(path.as_bytes(), b"+1", false)
                .ok();
            if let Some(deletor) = self.deletors.get_mut(&path) {
                deletor.attempts += 1;
                deletor.rpc = rpc;
            }
        }
    }

    fn ensure_keepalive_write(&mut self, actor: &Arc<Mutex<KeepaliveActor>>) {
        let (path, value, needed) = {
            let guard = actor.lock();
            (
                guard.path().to_string(),
                guard.value().to_vec(),
                guard.needs_write(),
            )
        };
        if !needed {
            return;
        }
        match self.create_request_kv_set(path.as_bytes(), &value, true, false, false, false) {
            Ok(rpc) => actor.lock().attach_rpc(rpc),
            Err(create_error) => {
                debug!(%path, %create_error, "keepalive write deferred");
            }
        }
    }

    fn on_member_update_response(&mut self, outcome: Result<HttpResponse, CoreError>) {
        let response = match outcome {
            Err(request_error) => {
                warn!(%request_error, "registry member list failed");
                self.stats_error(RequestKind::MemberList);
                self.note_network_error();
                return;
            }
            Ok(response) if !response.is_success() => {
                warn!(status = response.status, "registry member list rejected");
                self.stats_error(RequestKind::MemberList);
                return;
            }
            Ok(response) => response,
        };

        let Ok(document) = serde_json::from_slice::<Value>(&response.body) else {
            self.stats_error(RequestKind::MemberList);
            return;
        };
        let Some(Value::Array(members)) = document.get("members") else {
            warn!("registry member list response has no members array");
            self.stats_error(RequestKind::MemberList);
            return;
        };

        self.hosts.clear();
        let mut selected_still_known = false;
        for member in members {
            let Some(Value::Array(urls)) = member.get("clientURLs") else {
                continue;
            };
            for url in urls {
                if let Value::String(url) = url {
                    if url.is_empty() {
                        continue;
                    }
                    if *url == self.selected_host {
                        selected_still_known = true;
                    }
                    self.hosts.push(url.clone());
                }
            }
        }

        if !self.hosts.is_empty() && !selected_still_known {
            let index = self.rng.gen_range(0..self.hosts.len());
            self.selected_host = self.hosts[index].clone();
            info!(host = %self.selected_host, "registry host selected");
        }
        self.stats_success(RequestKind::MemberList);
    }

    fn on_authenticate_response(&mut self, outcome: Result<HttpResponse, CoreError>, now: Instant) {
        let response = match outcome {
            Err(request_error) => {
                warn!(%request_error, "registry authenticate failed");
                self.stats_error(RequestKind::Authenticate);
                self.note_network_error();
                return;
            }
            Ok(response) if !response.is_success() => {
                warn!(status = response.status, "registry authenticate rejected");
                self.stats_error(RequestKind::Authenticate);
                self.check_authorization_expired(response.status, &response.body);
                return;
            }
            Ok(response) => response,
        };

        let Ok(document) = serde_json::from_slice::<Value>(&response.body) else {
            self.stats_error(RequestKind::Authenticate);
            return;
        };
        let Some(token) = unpack_string(&document, "token") else {
            error!("registry authenticate response carries no token");
            self.stats_error(RequestKind::Authenticate);
            return;
        };

        debug!("registry authenticate token refreshed");
        self.auth_header = Some(token);
        self.stats_success(RequestKind::Authenticate);
        let interval = self.context.parameters.registry.auth_user_get_interval;
        self.next_auth_user_get = Some(now + interval.max(Duration::from_secs(1)));
    }

    fn on_auth_user_get_response(&mut self, outcome: Result<HttpResponse, CoreError>) {
        let response = match outcome {
            Err(request_error) => {
                warn!(%request_error, "registry user get failed");
                self.stats_error(RequestKind::UserGet);
                self.note_network_error();
                return;
            }
            Ok(response) if !response.is_success() => {
                if response.status == STATUS_UNAUTHENTICATED {
                    info!("registry token expired, re-authenticating");
                } else {
                    warn!(status = response.status, "registry user get rejected");
                }
                self.stats_error(RequestKind::UserGet);
                self.check_authorization_expired(response.status, &response.body);
                return;
            }
            Ok(response) => response,
        };

        let Ok(document) = serde_json::from_slice::<Value>(&response.body) else {
            self.stats_error(RequestKind::UserGet);
            return;
        };
        if let Some(Value::Array(roles)) = document.get("roles") {
            self.auth_roles = roles
                .iter()
                .filter_map(|role| role.as_str().map(str::to_string))
                .collect();
        }
        self.stats_success(RequestKind::UserGet);
    }

    fn on_lease_response(&mut self, outcome: Result<HttpResponse, CoreError>, is_grant: bool) {
        let kind = if is_grant {
            RequestKind::LeaseGrant
        } else {
            RequestKind::LeaseKeepalive
        };
        let response = match outcome {
            Err(request_error) => {
                warn!(%request_error, is_grant, "registry lease request failed");
                self.stats_error(kind);
                self.note_network_error();
                return;
            }
            Ok(response) if !response.is_success() => {
                warn!(status = response.status, is_grant, "registry lease request rejected");
                self.stats_error(kind);
                self.check_authorization_expired(response.status, &response.body);
                return;
            }
            Ok(response) => response,
        };

        let Ok(document) = serde_json::from_slice::<Value>(&response.body) else {
            self.stats_error(kind);
            return;
        };
        // Keepalive responses nest under `result`; grant responses do not.
        let root = document.get("result").unwrap_or(&document);

        if root.get("TTL").is_none() {
            if is_grant {
                error!("registry lease grant failed");
            } else {
                // Lease lost. The next tick grants a new one and every
                // keepalive actor re-activates.
                warn!(lease = self.lease, "registry lease lost, will re-grant");
                self.set_running(false);
                self.set_lease(0, false);
                self.next_keepalive = None;
            }
            self.stats_error(kind);
            return;
        }

        let new_lease = unpack_i64(root, "ID");
        if new_lease == 0 {
            error!("registry lease response carries no id");
            self.stats_error(kind);
            return;
        }

        debug!(lease = new_lease, is_grant, "registry lease refreshed");
        self.stats_success(kind);
        if !matches!(self.phase, SessionPhase::Closing | SessionPhase::Closed) {
            self.set_running(true);
        }
        self.set_lease(new_lease, is_grant);
    }

    fn poll_lease_revoke(&mut self) {
        let Some(rpc) = self.rpc_lease_revoke.clone() else {
            if self.phase == SessionPhase::Closing {
                self.phase = SessionPhase::Closed;
            }
            return;
        };
        match rpc.poll() {
            HttpPoll::InFlight => {}
            HttpPoll::Done(outcome) => {
                match outcome {
                    Ok(response) if response.is_success() => {
                        self.stats_success(RequestKind::LeaseRevoke)
                    }
                    _ => self.stats_error(RequestKind::LeaseRevoke),
                }
                self.rpc_lease_revoke = None;
                if self.phase == SessionPhase::Closing {
                    self.phase = SessionPhase::Closed;
                }
            }
        }
    }

    fn set_lease(&mut self, lease: i64, force_activate: bool) {
        let previous = self.lease;
        self.lease = lease;
        if previous == lease && !force_activate {
            return;
        }
        if lease != 0 {
            for actor in &self.keepalive_actors {
                actor.lock().reset_value_changed();
            }
        }
    }

    fn set_running(&mut self, running: bool) {
        match (self.phase, running) {
            (SessionPhase::Connecting, true) => {
                info!("registry session up");
                self.phase = SessionPhase::Running;
                self.context.metrics.registry_session_up.set(1);
                self.dispatch_events(true);
            }
            (SessionPhase::Running, false) => {
                info!("registry session down");
                self.phase = SessionPhase::Connecting;
                self.context.metrics.registry_session_up.set(0);
                self.dispatch_events(false);
            }
            _ => {}
        }
    }

    fn dispatch_events(&mut self, up: bool) {
        let mut callbacks = if up {
            std::mem::take(&mut self.on_event_up)
        } else {
            std::mem::take(&mut self.on_event_down)
        };
        for (_, callback) in callbacks.iter_mut() {
            callback();
        }
        let target = if up {
            &mut self.on_event_up
        } else {
            &mut self.on_event_down
        };
        callbacks.extend(std::mem::take(target));
        *target = callbacks;
    }

    /// Clears credentials when a response smells like an auth problem: a 401,
    /// a gRPC `Unauthenticated` code in the body, or a 400/412 whose body
    /// mentions authentication. The next tick re-authenticates.
    fn check_authorization_expired(&mut self, status: u16, body: &[u8]) {
        if status == STATUS_UNAUTHENTICATED {
            self.auth_header = None;
            return;
        }
        if let Ok(document) = serde_json::from_slice::<Value>(body) {
            if unpack_i64(&document, "code") == GRPC_CODE_UNAUTHENTICATED {
                self.auth_header = None;
                return;
            }
        }
        if (status == 400 || status == 412)
            && String::from_utf8_lossy(body).contains("authenticat")
        {
            self.auth_header = None;
        }
    }

    /// A network-level failure may mean the selected host is dead; schedule
    /// an immediate member re-list.
    fn note_network_error(&mut self) {
        if self.context.parameters.registry.cluster_auto_update {
            self.next_members_update = Some(self.last_tick_time);
        }
    }

    fn stats_created(&mut self, kind: RequestKind) {
        self.stats.sum_created += 1;
        self.context
            .metrics
            .registry_requests_created
            .with_label_values(&[kind.label()])
            .inc();
    }

    fn stats_success(&mut self, kind: RequestKind) {
        self.stats.sum_success += 1;
        self.stats.continue_success += 1;
        self.stats.continue_error = 0;
        self.context
            .metrics
            .registry_requests_succeeded
            .with_label_values(&[kind.label()])
            .inc();
    }

    fn stats_error(&mut self, kind: RequestKind) {
        self.stats.sum_error += 1;
        self.stats.continue_error += 1;
        self.stats.continue_success = 0;
        self.context
            .metrics
            .registry_requests_failed
            .with_label_values(&[kind.label()])
            .inc();
    }
}

impl WatcherHost for RegistryClient {
    fn start_range_request(
        &mut self,
        key: &[u8],
        range_end: &[u8],
        timeout: Option<Duration>,
    ) -> Option<HttpRequestHandle> {
        let mut body = Map::new();
        pack_key_range(&mut body, key, range_end);
        body.insert("limit".to_string(), Value::from(0));
        body.insert("revision".to_string(), Value::from(0));
        if self.ensure_open().is_err() {
            return None;
        }
        self.start_request(RequestKind::KvGet, API_KV_RANGE, body, timeout, false)
    }

    fn start_watch_request(
        &mut self,
        key: &[u8],
        range_end: &[u8],
        start_revision: i64,
        prev_kv: bool,
        progress_notify: bool,
    ) -> Option<HttpRequestHandle> {
        self.create_request_watch(key, range_end, start_revision, prev_kv, progress_notify)
            .ok()
    }

    fn on_transport_error(&mut self, _watch_error: &CoreError) {
        self.stats_error(RequestKind::Watch);
        self.note_network_error();
    }

    fn on_http_failure(&mut self, status: u16, body: &[u8]) {
        self.stats_error(RequestKind::Watch);
        self.check_authorization_expired(status, body);
    }

    fn on_request_success(&mut self) {
        self.stats_success(RequestKind::Watch);
    }
}

fn due(deadline: Option<Instant>, now: Instant) -> bool {
    deadline.map_or(true, |deadline| now >= deadline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::registry::http::testing::FakeHttpMultiplexer;
    use crate::registry::http::HttpRequestState;
    use lattice_config::Parameters;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const MEMBERS_BODY: &[u8] =
        br#"{"members":[{"clientURLs":["http://reg-a:2379"]},{"clientURLs":["http://reg-b:2379"]}]}"#;

    fn authed_client() -> (RegistryClient, Arc<FakeHttpMultiplexer>, Instant) {
        let mut parameters = Parameters::default();
        parameters.registry.hosts = vec!["http://seed:2379".to_string()];
        parameters.registry.authorization = "svc:secret".to_string();
        let context = Arc::new(Context::new_for_test(1).with_parameters(parameters));
        let mut client = RegistryClient::new(context);
        let multiplexer = FakeHttpMultiplexer::new();
        client.init(multiplexer.clone());
        (client, multiplexer, Instant::now())
    }

    fn bring_up_to_authenticated(
        client: &mut RegistryClient,
        multiplexer: &FakeHttpMultiplexer,
        now: Instant,
    ) {
        assert_eq!(client.tick_at(now), 1);
        multiplexer
            .find_request(API_MEMBER_LIST)
            .unwrap()
            .complete(200, MEMBERS_BODY);

        assert_eq!(client.tick_at(now), 1);
        assert!(!client.selected_host().is_empty());
        multiplexer
            .find_request(API_AUTHENTICATE)
            .unwrap()
            .complete(200, br#"{"token":"tok-1"}"#);
    }

    #[test]
    fn tick_ladder_discovers_members_then_authenticates() {
        let (mut client, multiplexer, now) = authed_client();
        bring_up_to_authenticated(&mut client, &multiplexer, now);
        assert!(client.hosts().len() == 2);

        // Authorized and lease-free: the session reports running.
        client.tick_at(now);
        assert!(client.is_available());
        assert!(client.is_running());
        assert!(multiplexer.find_request(API_AUTH_USER_GET).is_none());

        // The user-get token probe fires on its own cadence.
        let user_get_due = now + Parameters::default().registry.auth_user_get_interval;
        client.tick_at(user_get_due);
        let user_get = multiplexer.find_request(API_AUTH_USER_GET).unwrap();
        assert_eq!(
            user_get
                .request
                .headers
                .iter()
                .find(|(name, _)| name == "Authorization")
                .map(|(_, value)| value.as_str()),
            Some("tok-1")
        );
        user_get.complete(200, br#"{"roles":["root","ops"]}"#);
        client.tick_at(user_get_due);
        assert_eq!(client.auth_roles(), ["root", "ops"]);
    }

    #[test]
    fn lease_loss_regrants_and_reactivates_keepalives() {
        let (mut client, multiplexer, now) = authed_client();
        bring_up_to_authenticated(&mut client, &multiplexer, now);

        let ups = Arc::new(AtomicUsize::new(0));
        let downs = Arc::new(AtomicUsize::new(0));
        {
            let ups = ups.clone();
            client.add_on_event_up(Box::new(move || {
                ups.fetch_add(1, Ordering::SeqCst);
            }), true);
            let downs = downs.clone();
            client.add_on_event_down(Box::new(move || {
                downs.fetch_add(1, Ordering::SeqCst);
            }), false);
        }

        let actor = Arc::new(Mutex::new(KeepaliveActor::new(
            "/lattice/by_id/1".to_string(),
            b"record-v1".to_vec(),
        )));
        assert!(client.add_keepalive(actor.clone()));

        // Lease enabled: the next tick grants.
        client.tick_at(now);
        multiplexer
            .find_request(API_LEASE_GRANT)
            .unwrap()
            .complete(200, br#"{"ID":"7001","TTL":"31"}"#);
        client.tick_at(now);

        assert_eq!(client.lease(), 7001);
        assert!(client.is_running());
        assert_eq!(ups.load(Ordering::SeqCst), 1);
        // The actor's first write went out under the fresh lease.
        let write = multiplexer.find_request(API_KV_PUT).unwrap();
        write.complete(200, br#"{"header":{"revision":5}}"#);
        client.tick_at(now);
        assert!(actor.lock().has_data());

        // Keepalive due: respond without a TTL, meaning the lease is gone.
        let keepalive_due = now + Parameters::default().registry.keepalive_interval;
        client.tick_at(keepalive_due);
        multiplexer
            .find_request(API_LEASE_KEEPALIVE)
            .unwrap()
            .complete(200, br#"{"result":{"ID":"7001"}}"#);
        client.tick_at(keepalive_due);

        assert_eq!(client.lease(), 0);
        assert!(!client.is_running());
        assert_eq!(downs.load(Ordering::SeqCst), 1);

        // Next tick grants a new lease, re-emits up, and re-activates the
        // actor even though its value did not change.
        client.tick_at(keepalive_due);
        multiplexer
            .requests_matching(API_LEASE_GRANT)[1]
            .complete(200, br#"{"ID":"7002","TTL":"31"}"#);
        client.tick_at(keepalive_due);

        assert_eq!(client.lease(), 7002);
        assert_eq!(ups.load(Ordering::SeqCst), 2);
        client.tick_at(keepalive_due);
        assert_eq!(multiplexer.requests_matching(API_KV_PUT).len(), 2);
    }

    #[test]
    fn auth_expiry_clears_header_and_reauthenticates() {
        let (mut client, multiplexer, now) = authed_client();
        bring_up_to_authenticated(&mut client, &multiplexer, now);
        client.tick_at(now);
        assert!(client.is_available());

        // A kv request bounces with 401: credentials are cleared.
        let rpc = client
            .create_request_kv_get(b"/lattice/x", b"", 0, 0)
            .unwrap();
        multiplexer
            .find_request(API_KV_RANGE)
            .unwrap()
            .complete(401, b"");
        if let HttpPoll::Done(Ok(response)) = rpc.poll() {
            client.check_authorization_expired(response.status, &response.body);
        }
        assert!(!client.is_available());

        // Re-auth is bounded below by the retry interval.
        assert_eq!(client.tick_at(now), 0);
        let retry_at = now
            + Parameters::default()
                .registry
                .authorization_retry_interval
            + Duration::from_secs(1);
        assert_eq!(client.tick_at(retry_at), 1);
        assert_eq!(multiplexer.requests_matching(API_AUTHENTICATE).len(), 2);
    }

    #[test]
    fn auth_smells_in_error_bodies_clear_header() {
        let (mut client, multiplexer, now) = authed_client();
        bring_up_to_authenticated(&mut client, &multiplexer, now);
        client.tick_at(now);
        let _ = multiplexer;

        // 400/412 bodies that mention authentication.
        client.check_authorization_expired(400, br#"{"error":"invalid user ID: authenticat"}"#);
        assert!(!client.is_available());

        // gRPC code 16 in any error body.
        client.auth_header = Some("tok-stale".to_string());
        assert!(client.is_available());
        client.check_authorization_expired(500, br#"{"code":16,"message":"token expired"}"#);
        assert!(!client.is_available());

        // Unrelated errors leave credentials alone.
        client.auth_header = Some("tok-good".to_string());
        client.check_authorization_expired(500, br#"{"code":13}"#);
        assert!(client.is_available());
    }

    #[test]
    fn removed_keepalive_with_data_leaves_bounded_deletor() {
        let (mut client, multiplexer, now) = authed_client();
        bring_up_to_authenticated(&mut client, &multiplexer, now);

        let actor = Arc::new(Mutex::new(KeepaliveActor::new(
            "/lattice/by_name/echo".to_string(),
            b"record".to_vec(),
        )));
        client.add_keepalive(actor.clone());
        client.tick_at(now);
        multiplexer
            .find_request(API_LEASE_GRANT)
            .unwrap()
            .complete(200, br#"{"ID":8,"TTL":31}"#);
        client.tick_at(now);
        multiplexer
            .find_request(API_KV_PUT)
            .unwrap()
            .complete(200, b"{}");
        client.tick_at(now);
        assert!(actor.lock().has_data());

        assert!(client.remove_keepalive(&actor));
        client.tick_at(now);
        let delete = multiplexer.find_request(API_KV_DELETE).unwrap();
        // Deletes cover the path's whole subtree.
        let body: Value = serde_json::from_slice(&delete.request.body).unwrap();
        assert!(body.get("range_end").is_some());

        // Failures retry up to the configured bound, then give up.
        delete.fail_transport("connection reset");
        for _ in 0..16 {
            client.tick_at(now);
            if let Some(pending) = multiplexer.requests_matching(API_KV_DELETE).last().cloned() {
                if matches!(pending.poll(), HttpPoll::InFlight) {
                    pending.fail_transport("connection reset");
                }
            }
        }
        let total = multiplexer.requests_matching(API_KV_DELETE).len();
        assert!(total <= Parameters::default().registry.keepalive_retry_times as usize);
        client.tick_at(now);
        assert_eq!(multiplexer.requests_matching(API_KV_DELETE).len(), total);
    }

    #[test]
    fn network_error_forces_member_relist() {
        let (mut client, multiplexer, now) = authed_client();
        bring_up_to_authenticated(&mut client, &multiplexer, now);
        client.set_lease_enabled(true);

        client.tick_at(now);
        multiplexer
            .find_request(API_LEASE_GRANT)
            .unwrap()
            .fail_transport("host unreachable");

        // The failure marks the selected host suspect; the same tick that
        // observes it re-lists the members.
        client.tick_at(now);
        assert_eq!(multiplexer.requests_matching(API_MEMBER_LIST).len(), 2);
    }

    #[test]
    fn close_revokes_held_lease() {
        let (mut client, multiplexer, now) = authed_client();
        bring_up_to_authenticated(&mut client, &multiplexer, now);
        client.set_lease_enabled(true);
        client.tick_at(now);
        multiplexer
            .find_request(API_LEASE_GRANT)
            .unwrap()
            .complete(200, br#"{"ID":99,"TTL":31}"#);
        client.tick_at(now);
        assert_eq!(client.lease(), 99);

        client.close(false);
        let revoke = multiplexer.find_request(API_LEASE_REVOKE).unwrap();
        let body: Value = serde_json::from_slice(&revoke.request.body).unwrap();
        assert_eq!(body.get("ID").and_then(Value::as_i64), Some(99));

        revoke.complete(200, b"{}");
        client.tick_at(now);
        assert!(!client.is_available());
        assert_eq!(client.lease(), 0);
    }
}
