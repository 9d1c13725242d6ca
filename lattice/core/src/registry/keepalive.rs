// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use tracing::{debug, warn};

use crate::error::CoreError;
use crate::registry::http::{HttpPoll, HttpRequestHandle};

/// Result of polling an actor's in-flight write.
pub(crate) enum KeepaliveWriteOutcome {
    Success,
    HttpRejected { status: u16, body: Vec<u8> },
    TransportFailed(CoreError),
}

/// A key/value pair kept alive against the session lease. While the session
/// is up the owning client rewrites the value whenever it changed (and once
/// after every lease grant, since a new lease invalidates old bindings).
pub struct KeepaliveActor {
    path: String,
    value: Vec<u8>,
    value_changed: bool,
    has_data: bool,
    rpc: Option<HttpRequestHandle>,
}

impl KeepaliveActor {
    pub fn new(path: String, value: Vec<u8>) -> KeepaliveActor {
        KeepaliveActor {
            path,
            value,
            value_changed: true,
            has_data: false,
            rpc: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Whether this actor has ever written its path; a removed actor with
    /// data leaves a deferred delete behind.
    pub fn has_data(&self) -> bool {
        self.has_data
    }

    pub fn set_value(&mut self, value: Vec<u8>) {
        if self.value != value {
            self.value = value;
            self.value_changed = true;
        }
    }

    /// Forces the next activation to rewrite the value, used after a lease
    /// re-grant re-activates every actor.
    pub fn reset_value_changed(&mut self) {
        self.value_changed = true;
    }

    /// Whether a write is currently needed and none is in flight.
    pub(crate) fn needs_write(&self) -> bool {
        self.rpc.is_none() && (self.value_changed || !self.has_data)
    }

    pub(crate) fn attach_rpc(&mut self, rpc: HttpRequestHandle) {
        self.rpc = Some(rpc);
    }

    pub(crate) fn cancel_rpc(&mut self) {
        if let Some(rpc) = self.rpc.take() {
            rpc.cancel();
        }
    }

    /// Polls the in-flight write; `None` while idle or still in flight.
    pub(crate) fn poll_rpc(&mut self) -> Option<KeepaliveWriteOutcome> {
        let rpc = self.rpc.as_ref()?;
        match rpc.poll() {
            HttpPoll::InFlight => None,
            HttpPoll::Done(Ok(response)) if response.is_success() => {
                debug!(path = %self.path, "keepalive value written");
                self.rpc = None;
                self.has_data = true;
                self.value_changed = false;
                Some(KeepaliveWriteOutcome::Success)
            }
            HttpPoll::Done(Ok(response)) => {
                warn!(path = %self.path, status = response.status, "keepalive write rejected");
                self.rpc = None;
                self.value_changed = true;
                Some(KeepaliveWriteOutcome::HttpRejected {
                    status: response.status,
                    body: response.body.to_vec(),
                })
            }
            HttpPoll::Done(Err(error)) => {
                warn!(path = %self.path, %error, "keepalive write failed");
                self.rpc = None;
                self.value_changed = true;
                Some(KeepaliveWriteOutcome::TransportFailed(error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_actor_needs_write_until_success() {
        let mut actor = KeepaliveActor::new("/lattice/by_id/2a".to_string(), b"v1".to_vec());
        assert!(actor.needs_write());
        assert!(!actor.has_data());

        // Unchanged values stay clean after a successful write.
        actor.has_data = true;
        actor.value_changed = false;
        assert!(!actor.needs_write());

        actor.set_value(b"v1".to_vec());
        assert!(!actor.needs_write());

        actor.set_value(b"v2".to_vec());
        assert!(actor.needs_write());

        actor.value_changed = false;
        actor.reset_value_changed();
        assert!(actor.needs_write());
    }
}
