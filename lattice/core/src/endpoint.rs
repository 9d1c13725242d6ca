// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info};

use lattice_types::{MessageSenderInfo, MetadataRecord};

use crate::context::Context;
use crate::discovery::NodeHandle;
use crate::error::{CoreError, CoreResult};

/// Borrowed view of one outbound message.
#[derive(Clone, Copy)]
pub struct ForwardFrame<'a> {
    pub message_type: i32,
    pub sequence: u64,
    pub payload: &'a [u8],
    pub metadata: Option<&'a MetadataRecord>,
}

/// A bus transport. The runtime never opens sockets itself; connectors do,
/// and report asynchronous failures back through
/// `on_receive_forward_response`.
pub trait Connector: Send + Sync {
    /// Attempts to send synchronously. An error here is returned to the
    /// caller and also synthesized as a forward-response failure.
    fn send_forward_request(
        &self,
        handle: &ConnectionHandle,
        frame: &ForwardFrame<'_>,
    ) -> CoreResult<()>;

    /// Delivery outcome for a message previously accepted on `handle`.
    fn on_receive_forward_response(
        &self,
        handle: &ConnectionHandle,
        frame: &ForwardFrame<'_>,
        error: &CoreError,
    );
}

/// A transport-level connection bound to an endpoint. The back-reference to
/// the endpoint is carried as plain peer identity, not an owning pointer, so
/// handle and endpoint can drop in either order.
pub struct ConnectionHandle {
    id: u64,
    ready: AtomicBool,
    connector: Arc<dyn Connector>,
    remote: Mutex<Option<MessageSenderInfo>>,
}

impl ConnectionHandle {
    pub fn new(id: u64, connector: Arc<dyn Connector>) -> Arc<ConnectionHandle> {
        Arc::new(ConnectionHandle {
            id,
            ready: AtomicBool::new(false),
            connector,
            remote: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// Identity of the endpoint this handle is bound to, if any.
    pub fn bound_remote(&self) -> Option<MessageSenderInfo> {
        self.remote.lock().clone()
    }

    fn bind_remote(&self, remote: MessageSenderInfo) {
        *self.remote.lock() = Some(remote);
    }

    fn unbind_remote(&self) {
        *self.remote.lock() = None;
    }
}

/// Where an endpoint reports asynchronous outcomes: the app-level forward
/// response event, and the waker queue that drives retry ticks.
pub trait EndpointEvents {
    fn on_forward_response(
        &mut self,
        sender: &MessageSenderInfo,
        frame: &ForwardFrame<'_>,
        error: &CoreError,
    );

    fn add_endpoint_waker(&mut self, when: Instant);
}

struct PendingMessage {
    message_type: i32,
    sequence: u64,
    payload: Vec<u8>,
    metadata: Option<MetadataRecord>,
    expires_at: Instant,
}

/// The app's view of one remote peer: the outbound queue, its buffering
/// bounds, and the transport handles that can currently carry traffic.
pub struct Endpoint {
    context: Arc<Context>,
    peer_id: u64,
    peer_name: String,
    closing: bool,
    discovery: Option<NodeHandle>,
    handles: Vec<Arc<ConnectionHandle>>,
    pending: VecDeque<PendingMessage>,
    pending_bytes: usize,
    nearest_waker: Option<Instant>,
}

impl Endpoint {
    pub fn new(context: Arc<Context>, peer_id: u64, peer_name: String) -> Endpoint {
        info!(peer_id, peer_name, "endpoint created");
        Endpoint {
            context,
            peer_id,
            peer_name,
            closing: false,
            discovery: None,
            handles: Vec::new(),
            pending: VecDeque::new(),
            pending_bytes: 0,
            nearest_waker: None,
        }
    }

    pub fn peer_id(&self) -> u64 {
        self.discovery
            .as_ref()
            .map(|node| node.id())
            .unwrap_or(self.peer_id)
    }

    pub fn peer_name(&self) -> &str {
        self.discovery
            .as_ref()
            .map(|node| node.name())
            .unwrap_or(&self.peer_name)
    }

    pub fn discovery(&self) -> Option<&NodeHandle> {
        self.discovery.as_ref()
    }

    pub fn update_discovery(&mut self, node: Option<NodeHandle>) {
        self.discovery = node;
    }

    pub fn pending_message_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_message_size(&self) -> usize {
        self.pending_bytes
    }

    pub fn nearest_waker(&self) -> Option<Instant> {
        self.nearest_waker
    }

    /// Binds a transport handle. Binding is bidirectional: the handle learns
    /// the peer identity it serves.
    pub fn add_connection_handle(&mut self, handle: Arc<ConnectionHandle>) {
        if self.closing {
            return;
        }
        if self.handles.iter().any(|bound| bound.id() == handle.id()) {
            return;
        }
        handle.bind_remote(self.sender_identity());
        self.handles.push(handle);
    }

    pub fn remove_connection_handle(&mut self, handle_id: u64) {
        if let Some(position) = self.handles.iter().position(|bound| bound.id() == handle_id) {
            let handle = self.handles.remove(position);
            handle.unbind_remote();
        }
    }

    /// First handle in insertion order that reports ready.
    pub fn get_ready_connection_handle(&self) -> Option<Arc<ConnectionHandle>> {
        self.handles.iter().find(|handle| handle.is_ready()).cloned()
    }

    /// Sends or buffers one message. The synchronous path is taken only when
    /// nothing is queued ahead (FIFO) and a ready handle exists.
    pub fn push_forward_message(
        &mut self,
        message_type: i32,
        sequence: u64,
        payload: &[u8],
        metadata: Option<&MetadataRecord>,
        now: Instant,
        events: &mut dyn EndpointEvents,
    ) -> CoreResult<()> {
        let frame = ForwardFrame {
            message_type,
            sequence,
            payload,
            metadata,
        };

        if self.closing {
            self.synthesize_failure(&frame, &CoreError::Closing, events);
            return Err(CoreError::Closing);
        }

        if payload.is_empty() {
            return Ok(());
        }

        let bus = &self.context.parameters.bus;
        if bus.message_size > 0 && payload.len() > bus.message_size {
            return Err(CoreError::Params("payload exceeds bus message size"));
        }

        if self.pending.is_empty() {
            if let Some(handle) = self.get_ready_connection_handle() {
                return match handle.connector().send_forward_request(&handle, &frame) {
                    Ok(()) => {
                        self.context.metrics.endpoint_messages_forwarded.inc();
                        Ok(())
                    }
                    Err(send_error) => {
                        self.synthesize_failure(&frame, &send_error, events);
                        Err(send_error)
                    }
                };
            }
        }

        let over_count = bus.send_buffer_number > 0
            && self.pending.len() + 1 > bus.send_buffer_number;
        let over_bytes = bus.send_buffer_size > 0
            && self.pending_bytes + payload.len() > bus.send_buffer_size;
        if over_count || over_bytes {
            self.synthesize_failure(&frame, &CoreError::BufferLimit, events);
            return Err(CoreError::BufferLimit);
        }

        let expires_at = now + self.context.parameters.timer.message_timeout;
        self.pending.push_back(PendingMessage {
            message_type,
            sequence,
            payload: payload.to_vec(),
            metadata: metadata.cloned(),
            expires_at,
        });
        self.pending_bytes += payload.len();
        self.context.metrics.endpoint_pending_messages.inc();
        self.context
            .metrics
            .endpoint_pending_bytes
            .add(payload.len() as i64);

        self.add_waker(expires_at, events);
        Ok(())
    }

    /// Walks the queue from the head: sends while a ready handle and budget
    /// allow, expires what has waited too long, and leaves the rest. Returns
    /// the number of messages disposed of either way.
    pub fn retry_pending_messages(
        &mut self,
        now: Instant,
        max_count: i32,
        events: &mut dyn EndpointEvents,
    ) -> usize {
        if let Some(waker) = self.nearest_waker {
            if waker <= now {
                self.nearest_waker = None;
            }
        }

        if self.pending.is_empty() {
            return 0;
        }
        let mut budget = if max_count <= 0 { i32::MAX } else { max_count };

        let handle = self.get_ready_connection_handle();
        if let Some(handle) = &handle {
            debug!(
                peer_id = self.peer_id(),
                handle = handle.id(),
                pending = self.pending.len(),
                "retrying pending messages"
            );
        }

        let mut disposed = 0;
        while let Some(message) = self.pending.front() {
            let outcome = if budget > 0 && handle.is_some() {
                budget -= 1;
                let handle = handle.as_ref().unwrap();
                let frame = ForwardFrame {
                    message_type: message.message_type,
                    sequence: message.sequence,
                    payload: &message.payload,
                    metadata: message.metadata.as_ref(),
                };
                let result = handle.connector().send_forward_request(handle, &frame);
                if result.is_ok() {
                    self.context.metrics.endpoint_messages_forwarded.inc();
                }
                result
            } else if message.expires_at > now || budget <= 0 {
                break;
            } else {
                Err(CoreError::NodeTimeout)
            };

            let message = self.pending.pop_front().expect("non-empty queue");
            self.pending_bytes = self.pending_bytes.saturating_sub(message.payload.len());
            self.context.metrics.endpoint_pending_messages.dec();
            self.context
                .metrics
                .endpoint_pending_bytes
                .sub(message.payload.len() as i64);
            disposed += 1;

            if let Err(failure) = outcome {
                let frame = ForwardFrame {
                    message_type: message.message_type,
                    sequence: message.sequence,
                    payload: &message.payload,
                    metadata: message.metadata.as_ref(),
                };
                self.synthesize_failure(&frame, &failure, events);
            }
        }

        if self.pending.is_empty() {
            self.pending_bytes = 0;
        } else if let Some(front) = self.pending.front() {
            let expires_at = front.expires_at;
            self.add_waker(expires_at, events);
        }
        disposed
    }

    /// Tears the endpoint down: every buffered message surfaces a `Closing`
    /// failure and all transport handles are unbound.
    pub fn reset(&mut self, events: &mut dyn EndpointEvents) {
        if self.closing {
            return;
        }
        self.closing = true;
        info!(peer_id = self.peer_id(), peer_name = %self.peer_name(), "endpoint reset");

        while let Some(message) = self.pending.pop_front() {
            self.pending_bytes = self.pending_bytes.saturating_sub(message.payload.len());
            self.context.metrics.endpoint_pending_messages.dec();
            self.context
                .metrics
                .endpoint_pending_bytes
                .sub(message.payload.len() as i64);
            let frame = ForwardFrame {
                message_type: message.message_type,
                sequence: message.sequence,
                payload: &message.payload,
                metadata: message.metadata.as_ref(),
            };
            self.synthesize_failure(&frame, &CoreError::Closing, events);
        }
        self.pending_bytes = 0;
        self.nearest_waker = None;

        for handle in self.handles.drain(..) {
            handle.unbind_remote();
        }
        self.closing = false;
    }

    fn sender_identity(&self) -> MessageSenderInfo {
        MessageSenderInfo {
            id: self.peer_id(),
            name: self.peer_name().to_string(),
        }
    }

    fn add_waker(&mut self, when: Instant, events: &mut dyn EndpointEvents) {
        let earlier = match self.nearest_waker {
            None => true,
            Some(existing) => when < existing,
        };
        if earlier {
            self.nearest_waker = Some(when);
            events.add_endpoint_waker(when);
        }
    }

    /// Routes a failure to the transport that accepted the message when one
    /// exists, otherwise to the app-level forward-response event.
    fn synthesize_failure(
        &self,
        frame: &ForwardFrame<'_>,
        failure: &CoreError,
        events: &mut dyn EndpointEvents,
    ) {
        self.context.metrics.endpoint_messages_failed.inc();
        if let Some(handle) = self.get_ready_connection_handle() {
            handle
                .connector()
                .on_receive_forward_response(&handle, frame, failure);
            return;
        }
        let sender = self
            .handles
            .first()
            .and_then(|handle| handle.bound_remote())
            .unwrap_or_default();
        events.on_forward_response(&sender, frame, failure);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Connector that records every frame and can be told to fail sends.
    #[derive(Default)]
    pub(crate) struct FakeConnector {
        pub(crate) sent: Mutex<Vec<(i32, u64, Vec<u8>)>>,
        pub(crate) responses: Mutex<Vec<(u64, CoreError)>>,
        pub(crate) fail_with: Mutex<Option<CoreError>>,
    }

    impl FakeConnector {
        pub(crate) fn new() -> Arc<FakeConnector> {
            Arc::new(FakeConnector::default())
        }

        pub(crate) fn sent_sequences(&self) -> Vec<u64> {
            self.sent.lock().iter().map(|(_, seq, _)| *seq).collect()
        }
    }

    impl Connector for FakeConnector {
        fn send_forward_request(
            &self,
            _handle: &ConnectionHandle,
            frame: &ForwardFrame<'_>,
        ) -> CoreResult<()> {
            if let Some(failure) = self.fail_with.lock().clone() {
                return Err(failure);
            }
            self.sent.lock().push((
                frame.message_type,
                frame.sequence,
                frame.payload.to_vec(),
            ));
            Ok(())
        }

        fn on_receive_forward_response(
            &self,
            _handle: &ConnectionHandle,
            frame: &ForwardFrame<'_>,
            error: &CoreError,
        ) {
            self.responses.lock().push((frame.sequence, error.clone()));
        }
    }

    /// Sink that records app-level failures and waker registrations.
    #[derive(Default)]
    pub(crate) struct RecordingEvents {
        pub(crate) responses: Vec<(u64, CoreError)>,
        pub(crate) wakers: Vec<Instant>,
    }

    impl EndpointEvents for RecordingEvents {
        fn on_forward_response(
            &mut self,
            _sender: &MessageSenderInfo,
            frame: &ForwardFrame<'_>,
            error: &CoreError,
        ) {
            self.responses.push((frame.sequence, error.clone()));
        }

        fn add_endpoint_waker(&mut self, when: Instant) {
            self.wakers.push(when);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeConnector, RecordingEvents};
    use super::*;
    use lattice_config::Parameters;
    use std::time::Duration;

    fn endpoint_with_limits(send_buffer_number: usize, message_timeout: Duration) -> Endpoint {
        let mut parameters = Parameters::default();
        parameters.bus.send_buffer_number = send_buffer_number;
        parameters.timer.message_timeout = message_timeout;
        let context = Arc::new(Context::new_for_test(1).with_parameters(parameters));
        Endpoint::new(context, 9, "peer-9".to_string())
    }

    #[test]
    fn zero_length_payload_succeeds_without_enqueuing() {
        let mut endpoint = endpoint_with_limits(4, Duration::from_secs(8));
        let mut events = RecordingEvents::default();
        let now = Instant::now();

        endpoint
            .push_forward_message(1, 1, b"", None, now, &mut events)
            .unwrap();
        assert_eq!(endpoint.pending_message_count(), 0);
        assert!(events.responses.is_empty());
        assert!(events.wakers.is_empty());
    }

    #[test]
    fn oversized_payload_is_rejected_outright() {
        let mut parameters = Parameters::default();
        parameters.bus.message_size = 8;
        let context = Arc::new(Context::new_for_test(1).with_parameters(parameters));
        let mut endpoint = Endpoint::new(context, 9, "peer-9".to_string());

        let mut events = RecordingEvents::default();
        let result = endpoint.push_forward_message(
            1,
            1,
            b"way too large for the bus",
            None,
            Instant::now(),
            &mut events,
        );
        assert_eq!(
            result,
            Err(CoreError::Params("payload exceeds bus message size"))
        );
        assert_eq!(endpoint.pending_message_count(), 0);
    }

    #[test]
    fn sync_path_sends_through_ready_handle() {
        let mut endpoint = endpoint_with_limits(4, Duration::from_secs(8));
        let connector = FakeConnector::new();
        let handle = ConnectionHandle::new(1, connector.clone());
        handle.set_ready(true);
        endpoint.add_connection_handle(handle.clone());

        assert_eq!(
            handle.bound_remote(),
            Some(MessageSenderInfo {
                id: 9,
                name: "peer-9".to_string()
            })
        );

        let mut events = RecordingEvents::default();
        endpoint
            .push_forward_message(7, 100, b"ping", None, Instant::now(), &mut events)
            .unwrap();
        assert_eq!(connector.sent_sequences(), vec![100]);
        assert_eq!(endpoint.pending_message_count(), 0);
    }

    #[test]
    fn sync_send_failure_is_synthesized_and_returned() {
        let mut endpoint = endpoint_with_limits(4, Duration::from_secs(8));
        let connector = FakeConnector::new();
        *connector.fail_with.lock() = Some(CoreError::Transport("broken pipe".to_string()));
        let handle = ConnectionHandle::new(1, connector.clone());
        handle.set_ready(true);
        endpoint.add_connection_handle(handle);

        let mut events = RecordingEvents::default();
        let result =
            endpoint.push_forward_message(7, 100, b"ping", None, Instant::now(), &mut events);
        assert_eq!(
            result,
            Err(CoreError::Transport("broken pipe".to_string()))
        );
        // The ready handle exists, so the failure went to the connector.
        assert_eq!(connector.responses.lock().len(), 1);
        assert!(events.responses.is_empty());
    }

    #[test]
    fn backpressure_limits_then_times_out_in_order() {
        // send_buffer_number = 2, message_timeout = 100ms, no ready handle.
        let mut endpoint = endpoint_with_limits(2, Duration::from_millis(100));
        let mut events = RecordingEvents::default();
        let now = Instant::now();

        endpoint
            .push_forward_message(1, 1, b"one", None, now, &mut events)
            .unwrap();
        endpoint
            .push_forward_message(1, 2, b"two", None, now, &mut events)
            .unwrap();
        assert_eq!(
            endpoint.push_forward_message(1, 3, b"three", None, now, &mut events),
            Err(CoreError::BufferLimit)
        );
        assert_eq!(endpoint.pending_message_count(), 2);
        assert_eq!(endpoint.pending_message_size(), 6);
        assert_eq!(events.responses, vec![(3, CoreError::BufferLimit)]);
        assert_eq!(endpoint.nearest_waker(), Some(now + Duration::from_millis(100)));

        // Before expiry nothing is disposed.
        let early = now + Duration::from_millis(50);
        assert_eq!(endpoint.retry_pending_messages(early, 0, &mut events), 0);

        // After expiry both queued messages time out in submission order.
        let late = now + Duration::from_millis(150);
        assert_eq!(endpoint.retry_pending_messages(late, 0, &mut events), 2);
        assert_eq!(
            events.responses,
            vec![
                (3, CoreError::BufferLimit),
                (1, CoreError::NodeTimeout),
                (2, CoreError::NodeTimeout),
            ]
        );
        assert_eq!(endpoint.pending_message_count(), 0);
        assert_eq!(endpoint.pending_message_size(), 0);
        assert_eq!(endpoint.nearest_waker(), None);
    }

    #[test]
    fn retry_flushes_fifo_once_a_handle_is_ready() {
        let mut endpoint = endpoint_with_limits(8, Duration::from_secs(8));
        let mut events = RecordingEvents::default();
        let now = Instant::now();

        for sequence in 1..=3 {
            endpoint
                .push_forward_message(1, sequence, b"payload", None, now, &mut events)
                .unwrap();
        }
        assert_eq!(endpoint.pending_message_size(), 21);

        let connector = FakeConnector::new();
        let handle = ConnectionHandle::new(1, connector.clone());
        handle.set_ready(true);
        endpoint.add_connection_handle(handle);

        // Budget of 2 sends only the first two.
        assert_eq!(endpoint.retry_pending_messages(now, 2, &mut events), 2);
        assert_eq!(connector.sent_sequences(), vec![1, 2]);
        assert_eq!(endpoint.pending_message_count(), 1);
        assert_eq!(endpoint.pending_message_size(), 7);

        assert_eq!(endpoint.retry_pending_messages(now, 0, &mut events), 1);
        assert_eq!(connector.sent_sequences(), vec![1, 2, 3]);
        assert_eq!(endpoint.pending_message_size(), 0);
    }

    #[test]
    fn closing_endpoint_fails_fast() {
        let mut endpoint = endpoint_with_limits(8, Duration::from_secs(8));
        let mut events = RecordingEvents::default();
        let now = Instant::now();

        endpoint
            .push_forward_message(1, 1, b"queued", None, now, &mut events)
            .unwrap();
        endpoint.reset(&mut events);
        assert_eq!(events.responses, vec![(1, CoreError::Closing)]);
        assert_eq!(endpoint.pending_message_count(), 0);
    }

    #[test]
    fn pending_bytes_always_equal_queue_sum() {
        let mut endpoint = endpoint_with_limits(16, Duration::from_secs(8));
        let mut events = RecordingEvents::default();
        let now = Instant::now();

        let payloads: Vec<Vec<u8>> = (1..=5u8).map(|n| vec![0u8; n as usize * 3]).collect();
        for (index, payload) in payloads.iter().enumerate() {
            endpoint
                .push_forward_message(1, index as u64, payload, None, now, &mut events)
                .unwrap();
        }
        let expected: usize = payloads.iter().map(Vec::len).sum();
        assert_eq!(endpoint.pending_message_size(), expected);

        let connector = FakeConnector::new();
        let handle = ConnectionHandle::new(1, connector);
        handle.set_ready(true);
        endpoint.add_connection_handle(handle);
        endpoint.retry_pending_messages(now, 2, &mut events);
        let remaining: usize = payloads[2..].iter().map(Vec::len).sum();
        assert_eq!(endpoint.pending_message_size(), remaining);
    }

    #[test]
    fn removing_handle_unbinds_it() {
        let mut endpoint = endpoint_with_limits(8, Duration::from_secs(8));
        let connector = FakeConnector::new();
        let handle = ConnectionHandle::new(3, connector);
        endpoint.add_connection_handle(handle.clone());
        assert!(handle.bound_remote().is_some());

        endpoint.remove_connection_handle(3);
        assert!(handle.bound_remote().is_none());
        assert!(endpoint.get_ready_connection_handle().is_none());
    }
}
