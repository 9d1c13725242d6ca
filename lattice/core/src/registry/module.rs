// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use tracing::{debug, info, warn};

use lattice_types::NodeRecord;

use crate::app::{AppCore, AppModule, EndpointKey};
use crate::context::Context;
use crate::discovery::{DiscoveryNode, DiscoverySet};
use crate::error::CoreResult;
use crate::registry::client::RegistryClient;
use crate::registry::http::HttpMultiplexer;
use crate::registry::keepalive::KeepaliveActor;
use crate::registry::kv::{WatchBatch, WatchEventKind};
use crate::registry::watcher::Watcher;

/// Which subtree a watcher covers; DELETE events only carry the key, so the
/// peer identity has to be recovered from it.
#[derive(Clone, Copy)]
enum SubtreeKind {
    ById,
    ByName,
}

/// Binds the registry session to the app: registers this process under the
/// lease at `<root>/by_id/<hex id>` and `<root>/by_name/<urlencoded name>`,
/// watches both subtrees, and mirrors PUT/DELETE events into the discovery
/// set. Peers that vanish get their endpoints torn down.
pub struct RegistryModule {
    context: Arc<Context>,
    client: RegistryClient,
    multiplexer: Arc<dyn HttpMultiplexer>,
    keepalive_by_id: Option<Arc<Mutex<KeepaliveActor>>>,
    keepalive_by_name: Option<Arc<Mutex<KeepaliveActor>>>,
    removed_peers: Arc<Mutex<Vec<EndpointKey>>>,
}

impl RegistryModule {
    pub fn new(context: Arc<Context>, multiplexer: Arc<dyn HttpMultiplexer>) -> RegistryModule {
        RegistryModule {
            client: RegistryClient::new(context.clone()),
            context,
            multiplexer,
            keepalive_by_id: None,
            keepalive_by_name: None,
            removed_peers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn client(&self) -> &RegistryClient {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut RegistryClient {
        &mut self.client
    }

    pub fn is_available(&self) -> bool {
        self.client.is_available()
    }

    fn registry_root(&self) -> String {
        self.context
            .parameters
            .registry
            .path
            .trim_end_matches('/')
            .to_string()
    }

    fn self_record(&self) -> NodeRecord {
        NodeRecord {
            id: self.context.own_id,
            name: self.context.own_name.clone(),
            pid: std::process::id() as i32,
            hostname: std::env::var("HOSTNAME").unwrap_or_default(),
            listen: self.context.parameters.bus.listen.clone(),
            ..NodeRecord::default()
        }
    }

    fn path_by_id(&self) -> String {
        format!("{}/by_id/{:x}", self.registry_root(), self.context.own_id)
    }

    fn path_by_name(&self) -> String {
        let encoded = utf8_percent_encode(&self.context.own_name, NON_ALPHANUMERIC);
        format!("{}/by_name/{}", self.registry_root(), encoded)
    }

    fn subtree_watcher(
        &self,
        kind: SubtreeKind,
        discovery: Arc<RwLock<DiscoverySet>>,
    ) -> Arc<Mutex<Watcher>> {
        let prefix = match kind {
            SubtreeKind::ById => format!("{}/by_id/", self.registry_root()),
            SubtreeKind::ByName => format!("{}/by_name/", self.registry_root()),
        };
        let removed_peers = self.removed_peers.clone();
        let handler_prefix = prefix.clone();

        let mut watcher = Watcher::new(
            prefix.into_bytes(),
            b"+1".to_vec(),
            &self.context.parameters.registry,
        );
        watcher.set_handler(Box::new(move |_header, batch| {
            apply_watch_batch(&discovery, &removed_peers, kind, &handler_prefix, batch);
        }));
        Arc::new(Mutex::new(watcher))
    }
}

fn apply_watch_batch(
    discovery: &Arc<RwLock<DiscoverySet>>,
    removed_peers: &Arc<Mutex<Vec<EndpointKey>>>,
    kind: SubtreeKind,
    prefix: &str,
    batch: &WatchBatch,
) {
    for event in &batch.events {
        match event.kind {
            WatchEventKind::Put => {
                let record = match NodeRecord::from_json_bytes(&event.kv.value) {
                    Ok(record) => record,
                    Err(decode_error) => {
                        warn!(%decode_error, "discovery record rejected");
                        continue;
                    }
                };
                debug!(id = record.id, name = %record.name, "discovery node published");
                discovery.write().add_node(DiscoveryNode::new(record));
            }
            WatchEventKind::Delete => {
                let key_text = String::from_utf8_lossy(&event.kv.key);
                let Some(suffix) = key_text.strip_prefix(prefix) else {
                    continue;
                };
                match kind {
                    SubtreeKind::ById => {
                        let Ok(id) = u64::from_str_radix(suffix, 16) else {
                            continue;
                        };
                        info!(id, "discovery node withdrawn");
                        discovery.write().remove_by_id(id);
                        removed_peers.lock().push(EndpointKey::Id(id));
                    }
                    SubtreeKind::ByName => {
                        let name = percent_decode_str(suffix)
                            .decode_utf8_lossy()
                            .into_owned();
                        info!(name, "discovery node withdrawn");
                        discovery.write().remove_by_name(&name);
                        removed_peers.lock().push(EndpointKey::Name(name));
                    }
                }
            }
        }
    }
}

impl AppModule for RegistryModule {
    fn name(&self) -> &str {
        "lattice: registry module"
    }

    fn init(&mut self, core: &mut AppCore) -> CoreResult<()> {
        self.client.init(self.multiplexer.clone());

        let record = self.self_record().to_json_bytes().map_err(|encode_error| {
            warn!(%encode_error, "self discovery record failed to encode");
            crate::error::CoreError::Params("self discovery record failed to encode")
        })?;

        let by_id = Arc::new(Mutex::new(KeepaliveActor::new(
            self.path_by_id(),
            record.clone(),
        )));
        let by_name = Arc::new(Mutex::new(KeepaliveActor::new(self.path_by_name(), record)));
        self.client.add_keepalive(by_id.clone());
        self.client.add_keepalive(by_name.clone());
        self.keepalive_by_id = Some(by_id);
        self.keepalive_by_name = Some(by_name);

        let discovery = core.discovery();
        self.client
            .add_watcher(self.subtree_watcher(SubtreeKind::ById, discovery.clone()));
        self.client
            .add_watcher(self.subtree_watcher(SubtreeKind::ByName, discovery));

        info!(path = %self.registry_root(), "registry module initialized");
        Ok(())
    }

    fn reload(&mut self, _core: &mut AppCore) -> CoreResult<()> {
        // Listen addresses or metadata may have changed; keepalive actors
        // only rewrite when the serialized record differs.
        let record = self
            .self_record()
            .to_json_bytes()
            .unwrap_or_default();
        if let Some(actor) = &self.keepalive_by_id {
            actor.lock().set_value(record.clone());
        }
        if let Some(actor) = &self.keepalive_by_name {
            actor.lock().set_value(record);
        }
        Ok(())
    }

    fn tick(&mut self, core: &mut AppCore) -> usize {
        let mut progress = self.client.tick_at(core.last_tick_time());

        let removed: Vec<EndpointKey> = std::mem::take(&mut *self.removed_peers.lock());
        for key in removed {
            core.remove_endpoint(&key);
            progress += 1;
        }
        progress
    }

    fn stop(&mut self, core: &mut AppCore) -> bool {
        self.client.close(false);
        self.client.tick_at(core.last_tick_time());
        self.client.is_closed()
    }

    fn cleanup(&mut self, _core: &mut AppCore) {
        self.client.close(false);
    }
}
