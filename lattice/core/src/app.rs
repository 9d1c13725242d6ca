// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use lattice_types::{MessageSenderInfo, MetadataRecord};

use crate::context::Context;
use crate::discovery::{DiscoverySet, NodeHandle};
use crate::endpoint::{Endpoint, EndpointEvents, ForwardFrame};
use crate::error::{CoreError, CoreResult};

/// Lifecycle of one app. Transitions only move forward; `tick` is a no-op
/// outside `Running`/`Stopping`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppState {
    Created,
    Initializing,
    Running,
    Stopping,
    Stopped,
}

/// A pluggable unit of the runtime. The app drives every module through
/// setup/init/tick and the stop sequence; modules receive the shared core to
/// reach endpoints, discovery and events.
pub trait AppModule {
    fn name(&self) -> &str;

    /// Pre-init configuration; a module may raise the initialize deadline
    /// here via `AppCore::set_initialize_timeout`.
    fn setup(&mut self, _core: &mut AppCore) -> CoreResult<()> {
        Ok(())
    }

    fn init(&mut self, _core: &mut AppCore) -> CoreResult<()> {
        Ok(())
    }

    fn reload(&mut self, _core: &mut AppCore) -> CoreResult<()> {
        Ok(())
    }

    /// Returns a progress count; zero means idle.
    fn tick(&mut self, _core: &mut AppCore) -> usize {
        0
    }

    /// Cooperative stop; return `true` once the module finished stopping.
    fn stop(&mut self, _core: &mut AppCore) -> bool {
        true
    }

    fn timeout(&mut self, _core: &mut AppCore) {}

    fn cleanup(&mut self, _core: &mut AppCore) {}
}

pub type ForwardResponseHandler =
    Box<dyn FnMut(&MessageSenderInfo, &ForwardFrame<'_>, &CoreError) + Send>;
pub type ForwardRequestHandler =
    Box<dyn FnMut(&MessageSenderInfo, &ForwardFrame<'_>) -> CoreResult<()> + Send>;
pub type ConnectionEventHandler = Box<dyn FnMut(u64) + Send>;
pub type PlainEventHandler = Box<dyn FnMut() + Send>;
pub type CommandHandler = Box<dyn FnMut(&[String]) -> Option<String> + Send>;

#[derive(Default)]
struct AppEvents {
    on_forward_request: Option<ForwardRequestHandler>,
    on_forward_response: Option<ForwardResponseHandler>,
    on_app_connected: Option<ConnectionEventHandler>,
    on_app_disconnected: Option<ConnectionEventHandler>,
    on_all_module_inited: Option<PlainEventHandler>,
}

/// How an endpoint is addressed in the waker queue and the endpoint table:
/// by id when the peer has one, by name otherwise.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EndpointKey {
    Id(u64),
    Name(String),
}

#[derive(PartialEq, Eq)]
struct WakerEntry {
    when: Instant,
    key: EndpointKey,
}

impl Ord for WakerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.when
            .cmp(&other.when)
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl PartialOrd for WakerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The state every module and the app loop share: lifecycle, endpoint table,
/// waker queue, discovery set, event slots and the command/option registries.
pub struct AppCore {
    context: Arc<Context>,
    state: AppState,
    init_timeout_flag: bool,
    init_deadline: Option<Instant>,
    initialize_timeout: Duration,
    last_tick_time: Instant,

    discovery: Arc<RwLock<DiscoverySet>>,
    endpoints_by_id: HashMap<u64, Arc<Mutex<Endpoint>>>,
    endpoints_by_name: HashMap<String, Arc<Mutex<Endpoint>>>,
    endpoint_wakers: BinaryHeap<Reverse<WakerEntry>>,

    events: AppEvents,
    commands: HashMap<String, Vec<CommandHandler>>,
    options: HashMap<String, Vec<CommandHandler>>,

    sequence_allocator: u64,
}

struct CoreEndpointEvents<'a> {
    events: &'a mut AppEvents,
    wakers: &'a mut BinaryHeap<Reverse<WakerEntry>>,
    key: EndpointKey,
}

impl EndpointEvents for CoreEndpointEvents<'_> {
    fn on_forward_response(
        &mut self,
        sender: &MessageSenderInfo,
        frame: &ForwardFrame<'_>,
        error: &CoreError,
    ) {
        if let Some(handler) = self.events.on_forward_response.as_mut() {
            handler(sender, frame, error);
        }
    }

    fn add_endpoint_waker(&mut self, when: Instant) {
        self.wakers.push(Reverse(WakerEntry {
            when,
            key: self.key.clone(),
        }));
    }
}

impl AppCore {
    fn new(context: Arc<Context>) -> AppCore {
        let initialize_timeout = context.parameters.timer.initialize_timeout;
        AppCore {
            context,
            state: AppState::Created,
            init_timeout_flag: false,
            init_deadline: None,
            initialize_timeout,
            last_tick_time: Instant::now(),
            discovery: Arc::new(RwLock::new(DiscoverySet::new())),
            endpoints_by_id: HashMap::new(),
            endpoints_by_name: HashMap::new(),
            endpoint_wakers: BinaryHeap::new(),
            events: AppEvents::default(),
            commands: HashMap::new(),
            options: HashMap::new(),
            sequence_allocator: 0,
        }
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn state(&self) -> AppState {
        self.state
    }

    pub fn last_tick_time(&self) -> Instant {
        self.last_tick_time
    }

    pub fn discovery(&self) -> Arc<RwLock<DiscoverySet>> {
        self.discovery.clone()
    }

    /// Whether the initialize deadline has passed; checking also latches the
    /// timeout flag, so long-running module inits can poll this.
    pub fn poll_init_deadline(&mut self) -> bool {
        if !self.init_timeout_flag {
            if let Some(deadline) = self.init_deadline {
                if Instant::now() >= deadline {
                    self.init_timeout_flag = true;
                }
            }
        }
        self.init_timeout_flag
    }

    pub fn init_timed_out(&self) -> bool {
        self.init_timeout_flag
    }

    /// Raises the initialize deadline. Only ever extends; modules asking for
    /// less than the current value keep the current one.
    pub fn set_initialize_timeout(&mut self, timeout: Duration) {
        if timeout > self.initialize_timeout {
            self.initialize_timeout = timeout;
        }
    }

    pub fn alloc_sequence(&mut self) -> u64 {
        self.sequence_allocator += 1;
        self.sequence_allocator
    }

    // ---- event slots -----------------------------------------------------

    pub fn set_on_forward_request(&mut self, handler: ForwardRequestHandler) {
        self.events.on_forward_request = Some(handler);
    }

    pub fn set_on_forward_response(&mut self, handler: ForwardResponseHandler) {
        self.events.on_forward_response = Some(handler);
    }

    pub fn set_on_app_connected(&mut self, handler: ConnectionEventHandler) {
        self.events.on_app_connected = Some(handler);
    }

    pub fn set_on_app_disconnected(&mut self, handler: ConnectionEventHandler) {
        self.events.on_app_disconnected = Some(handler);
    }

    pub fn set_on_all_module_inited(&mut self, handler: PlainEventHandler) {
        self.events.on_all_module_inited = Some(handler);
    }

    /// Entry point for connectors delivering an inbound message.
    pub fn trigger_on_forward_request(
        &mut self,
        sender: &MessageSenderInfo,
        frame: &ForwardFrame<'_>,
    ) -> CoreResult<()> {
        match self.events.on_forward_request.as_mut() {
            Some(handler) => handler(sender, frame),
            None => Ok(()),
        }
    }

    pub fn trigger_on_app_connected(&mut self, handle_id: u64) {
        if let Some(handler) = self.events.on_app_connected.as_mut() {
            handler(handle_id);
        }
    }

    pub fn trigger_on_app_disconnected(&mut self, handle_id: u64) {
        if let Some(handler) = self.events.on_app_disconnected.as_mut() {
            handler(handle_id);
        }
    }

    // ---- command / option registries ------------------------------------

    pub fn register_command(&mut self, name: &str, handler: CommandHandler) {
        self.commands.entry(name.to_string()).or_default().push(handler);
    }

    /// Invokes every handler registered for `name` and accumulates their
    /// responses. Unknown commands yield an empty response set.
    pub fn dispatch_command(&mut self, name: &str, arguments: &[String]) -> Vec<String> {
        let mut responses = Vec::new();
        if let Some(handlers) = self.commands.get_mut(name) {
            for handler in handlers.iter_mut() {
                if let Some(response) = handler(arguments) {
                    responses.push(response);
                }
            }
        }
        responses
    }

    pub fn register_option(&mut self, name: &str, handler: CommandHandler) {
        self.options.entry(name.to_string()).or_default().push(handler);
    }

    pub fn dispatch_option(&mut self, name: &str, arguments: &[String]) -> Vec<String> {
        let mut responses = Vec::new();
        if let Some(handlers) = self.options.get_mut(name) {
            for handler in handlers.iter_mut() {
                if let Some(response) = handler(arguments) {
                    responses.push(response);
                }
            }
        }
        responses
    }

    // ---- endpoint table --------------------------------------------------

    pub fn get_endpoint_by_id(&self, id: u64) -> Option<Arc<Mutex<Endpoint>>> {
        self.endpoints_by_id.get(&id).cloned()
    }

    pub fn get_endpoint_by_name(&self, name: &str) -> Option<Arc<Mutex<Endpoint>>> {
        self.endpoints_by_name.get(name).cloned()
    }

    /// The endpoint for `node`, created and indexed on first use. At most one
    /// endpoint exists per peer id or name.
    pub fn mutable_endpoint(&mut self, node: &NodeHandle) -> Arc<Mutex<Endpoint>> {
        if node.id() != 0 {
            if let Some(endpoint) = self.endpoints_by_id.get(&node.id()) {
                endpoint.lock().update_discovery(Some(node.clone()));
                return endpoint.clone();
            }
        }
        if !node.name().is_empty() {
            if let Some(endpoint) = self.endpoints_by_name.get(node.name()) {
                endpoint.lock().update_discovery(Some(node.clone()));
                return endpoint.clone();
            }
        }

        let mut endpoint = Endpoint::new(
            self.context.clone(),
            node.id(),
            node.name().to_string(),
        );
        endpoint.update_discovery(Some(node.clone()));
        let endpoint = Arc::new(Mutex::new(endpoint));
        if node.id() != 0 {
            self.endpoints_by_id.insert(node.id(), endpoint.clone());
        }
        if !node.name().is_empty() {
            self.endpoints_by_name
                .insert(node.name().to_string(), endpoint.clone());
        }
        endpoint
    }

    /// Drops an endpoint, surfacing its buffered messages as closing
    /// failures.
    pub fn remove_endpoint(&mut self, key: &EndpointKey) {
        let endpoint = match key {
            EndpointKey::Id(id) => self.endpoints_by_id.remove(id),
            EndpointKey::Name(name) => self.endpoints_by_name.remove(name),
        };
        let Some(endpoint) = endpoint else {
            return;
        };

        // Unindex the complementary key as well.
        {
            let guard = endpoint.lock();
            let peer_id = guard.peer_id();
            let peer_name = guard.peer_name().to_string();
            drop(guard);
            if let EndpointKey::Name(_) = key {
                if peer_id != 0 {
                    self.endpoints_by_id.remove(&peer_id);
                }
            }
            if let EndpointKey::Id(_) = key {
                if !peer_name.is_empty() {
                    self.endpoints_by_name.remove(&peer_name);
                }
            }
        }

        let endpoint_key = key.clone();
        let mut sink = CoreEndpointEvents {
            events: &mut self.events,
            wakers: &mut self.endpoint_wakers,
            key: endpoint_key,
        };
        endpoint.lock().reset(&mut sink);
    }

    /// Sends (or buffers) a message on an endpoint already resolved by the
    /// caller. Returns the sequence actually used.
    pub(crate) fn forward_through_endpoint(
        &mut self,
        endpoint: &Arc<Mutex<Endpoint>>,
        message_type: i32,
        sequence: u64,
        payload: &[u8],
        metadata: Option<&MetadataRecord>,
    ) -> CoreResult<u64> {
        let sequence = if sequence == 0 {
            self.alloc_sequence()
        } else {
            sequence
        };

        let key = {
            let guard = endpoint.lock();
            if guard.peer_id() != 0 {
                EndpointKey::Id(guard.peer_id())
            } else {
                EndpointKey::Name(guard.peer_name().to_string())
            }
        };
        let now = self.last_tick_time;
        let mut sink = CoreEndpointEvents {
            events: &mut self.events,
            wakers: &mut self.endpoint_wakers,
            key,
        };
        endpoint
            .lock()
            .push_forward_message(message_type, sequence, payload, metadata, now, &mut sink)?;
        Ok(sequence)
    }

    /// Pops due wakers and retries their endpoints. Entries whose endpoint
    /// vanished or re-armed to a different time are skipped.
    fn process_endpoint_wakers(&mut self, now: Instant) -> usize {
        let mut progress = 0;
        let budget = self.context.parameters.bus.loop_times.max(1) as i32;

        while let Some(Reverse(entry)) = self.endpoint_wakers.peek() {
            if entry.when > now {
                break;
            }
            let Reverse(entry) = self.endpoint_wakers.pop().expect("non-empty heap");

            let endpoint = match &entry.key {
                EndpointKey::Id(id) => self.endpoints_by_id.get(id).cloned(),
                EndpointKey::Name(name) => self.endpoints_by_name.get(name).cloned(),
            };
            let Some(endpoint) = endpoint else {
                continue;
            };
            // The waker moved since this entry was queued.
            if endpoint.lock().nearest_waker() != Some(entry.when) {
                continue;
            }

            let mut sink = CoreEndpointEvents {
                events: &mut self.events,
                wakers: &mut self.endpoint_wakers,
                key: entry.key.clone(),
            };
            progress += endpoint.lock().retry_pending_messages(now, budget, &mut sink);
        }
        progress
    }

    fn reset_all_endpoints(&mut self) {
        let endpoints: Vec<(EndpointKey, Arc<Mutex<Endpoint>>)> = self
            .endpoints_by_id
            .iter()
            .map(|(id, endpoint)| (EndpointKey::Id(*id), endpoint.clone()))
            .chain(
                self.endpoints_by_name
                    .iter()
                    .filter(|(_, endpoint)| endpoint.lock().peer_id() == 0)
                    .map(|(name, endpoint)| (EndpointKey::Name(name.clone()), endpoint.clone())),
            )
            .collect();

        for (key, endpoint) in endpoints {
            let mut sink = CoreEndpointEvents {
                events: &mut self.events,
                wakers: &mut self.endpoint_wakers,
                key,
            };
            endpoint.lock().reset(&mut sink);
        }
        self.endpoints_by_id.clear();
        self.endpoints_by_name.clear();
        self.endpoint_wakers.clear();
    }
}

/// One process built on the framework: a lifecycle state machine driving a
/// module list, the endpoint waker loop, and the shared core.
pub struct App {
    core: AppCore,
    modules: Vec<Box<dyn AppModule>>,
    stopped_modules: Vec<bool>,
    stop_deadline: Option<Instant>,
}

impl App {
    pub fn new(context: Arc<Context>) -> App {
        App {
            core: AppCore::new(context),
            modules: Vec::new(),
            stopped_modules: Vec::new(),
            stop_deadline: None,
        }
    }

    pub fn core(&self) -> &AppCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut AppCore {
        &mut self.core
    }

    pub fn state(&self) -> AppState {
        self.core.state
    }

    /// Modules must be added before `init`.
    pub fn add_module(&mut self, module: Box<dyn AppModule>) {
        self.modules.push(module);
        self.stopped_modules.push(false);
    }

    /// Runs setup and init on every module in order. A module overrunning the
    /// initialize deadline flips the app to timed-out and init reports
    /// `OperationTimeout`.
    pub fn init(&mut self) -> CoreResult<()> {
        if self.core.state != AppState::Created {
            return Err(CoreError::Params("app already initialized"));
        }
        self.core.state = AppState::Initializing;

        for module in self.modules.iter_mut() {
            debug!(module = module.name(), "module setup");
            module.setup(&mut self.core)?;
        }

        self.core.init_deadline = Some(Instant::now() + self.core.initialize_timeout);

        for index in 0..self.modules.len() {
            debug!(module = self.modules[index].name(), "module init");
            let result = self.modules[index].init(&mut self.core);
            self.core.poll_init_deadline();

            if self.core.init_timeout_flag {
                warn!(
                    module = self.modules[index].name(),
                    "module init overran the deadline"
                );
                for module in self.modules.iter_mut() {
                    module.timeout(&mut self.core);
                }
                self.core.state = AppState::Stopped;
                return Err(CoreError::OperationTimeout);
            }
            result?;
        }

        self.core.state = AppState::Running;
        self.core.last_tick_time = Instant::now();
        info!(
            id = self.core.context.own_id,
            name = %self.core.context.own_name,
            "app initialized"
        );
        if let Some(handler) = self.core.events.on_all_module_inited.as_mut() {
            handler();
        }
        Ok(())
    }

    pub fn reload(&mut self) -> CoreResult<()> {
        for module in self.modules.iter_mut() {
            module.reload(&mut self.core)?;
        }
        Ok(())
    }

    /// One pass of the event loop: drain due endpoint wakers, then tick every
    /// module. Idempotent when nothing is due. Returns a progress count.
    pub fn tick(&mut self) -> usize {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&mut self, now: Instant) -> usize {
        match self.core.state {
            AppState::Running => {}
            AppState::Stopping => return self.tick_stopping(now),
            _ => return 0,
        }
        self.core.last_tick_time = now;

        let mut progress = self.core.process_endpoint_wakers(now);
        for module in self.modules.iter_mut() {
            progress += module.tick(&mut self.core);
        }
        progress
    }

    /// Runs ticks until idle, `max_event_count` progress steps, or stop.
    pub fn run_noblock(&mut self, max_event_count: usize) -> usize {
        let mut total = 0;
        loop {
            let progress = self.tick();
            total += progress;
            if progress == 0 || total >= max_event_count || self.core.state == AppState::Stopped {
                break;
            }
        }
        total
    }

    /// Begins a cooperative stop: buffered endpoint messages fail with
    /// `Closing` and modules stop in registration order across subsequent
    /// ticks.
    pub fn stop(&mut self) {
        if matches!(self.core.state, AppState::Stopping | AppState::Stopped) {
            return;
        }
        info!("app stopping");
        self.core.state = AppState::Stopping;
        self.stop_deadline =
            Some(Instant::now() + self.core.context.parameters.timer.stop_timeout);
        self.core.reset_all_endpoints();
    }

    fn tick_stopping(&mut self, now: Instant) -> usize {
        self.core.last_tick_time = now;
        let mut progress = 0;

        let mut all_stopped = true;
        for (module, stopped) in self.modules.iter_mut().zip(self.stopped_modules.iter_mut())
        {
            if *stopped {
                continue;
            }
            if module.stop(&mut self.core) {
                *stopped = true;
                progress += 1;
            } else {
                all_stopped = false;
            }
        }

        let timed_out = self
            .stop_deadline
            .map_or(false, |deadline| now >= deadline);
        if !all_stopped && timed_out {
            warn!("stop deadline passed, forcing shutdown");
            for (module, stopped) in self.modules.iter_mut().zip(self.stopped_modules.iter())
            {
                if !stopped {
                    module.timeout(&mut self.core);
                }
            }
            all_stopped = true;
        }

        if all_stopped {
            for module in self.modules.iter_mut() {
                module.cleanup(&mut self.core);
            }
            self.core.state = AppState::Stopped;
            info!("app stopped");
            progress += 1;
        }
        progress
    }
}
