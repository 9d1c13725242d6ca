// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, IntCounter, IntCounterVec, IntGauge, Registry,
};

/// Runtime metrics, shared by every component through `Context`.
pub struct Metrics {
    /// Registry requests started, by request kind.
    pub registry_requests_created: IntCounterVec,
    /// Registry requests finished successfully, by request kind.
    pub registry_requests_succeeded: IntCounterVec,
    /// Registry requests finished with an error, by request kind.
    pub registry_requests_failed: IntCounterVec,
    /// Current lease id is non-zero and the session is running.
    pub registry_session_up: IntGauge,

    /// Messages handed to a connector synchronously or from the retry walk.
    pub endpoint_messages_forwarded: IntCounter,
    /// Failures surfaced through `on_forward_response`.
    pub endpoint_messages_failed: IntCounter,
    /// Pending messages buffered across all endpoints.
    pub endpoint_pending_messages: IntGauge,
    /// Pending bytes buffered across all endpoints.
    pub endpoint_pending_bytes: IntGauge,

    /// Worker count the autoscaler currently wants.
    pub worker_pool_expect_workers: IntGauge,
    /// Jobs accepted by `spawn`.
    pub worker_pool_jobs_spawned: IntCounter,
    /// Jobs moved back to the shared queue by exiting workers.
    pub worker_pool_jobs_requeued: IntCounter,
}

impl Metrics {
    pub fn new(registry: &Registry) -> Arc<Metrics> {
        Arc::new(Metrics {
            registry_requests_created: register_int_counter_vec_with_registry!(
                "registry_requests_created",
                "Registry requests started, by request kind",
                &["kind"],
                registry
            )
            .unwrap(),
            registry_requests_succeeded: register_int_counter_vec_with_registry!(
                "registry_requests_succeeded",
                "Registry requests finished successfully, by request kind",
                &["kind"],
                registry
            )
            .unwrap(),
            registry_requests_failed: register_int_counter_vec_with_registry!(
                "registry_requests_failed",
                "Registry requests finished with an error, by request kind",
                &["kind"],
                registry
            )
            .unwrap(),
            registry_session_up: register_int_gauge_with_registry!(
                "registry_session_up",
                "Whether the registry session is currently up",
                registry
            )
            .unwrap(),
            endpoint_messages_forwarded: register_int_counter_with_registry!(
                "endpoint_messages_forwarded",
                "Messages handed to a connector",
                registry
            )
            .unwrap(),
            endpoint_messages_failed: register_int_counter_with_registry!(
                "endpoint_messages_failed",
                "Message failures surfaced through on_forward_response",
                registry
            )
            .unwrap(),
            endpoint_pending_messages: register_int_gauge_with_registry!(
                "endpoint_pending_messages",
                "Pending messages buffered across all endpoints",
                registry
            )
            .unwrap(),
            endpoint_pending_bytes: register_int_gauge_with_registry!(
                "endpoint_pending_bytes",
                "Pending bytes buffered across all endpoints",
                registry
            )
            .unwrap(),
            worker_pool_expect_workers: register_int_gauge_with_registry!(
                "worker_pool_expect_workers",
                "Worker count the autoscaler currently wants",
                registry
            )
            .unwrap(),
            worker_pool_jobs_spawned: register_int_counter_with_registry!(
                "worker_pool_jobs_spawned",
                "Jobs accepted by spawn",
                registry
            )
            .unwrap(),
            worker_pool_jobs_requeued: register_int_counter_with_registry!(
                "worker_pool_jobs_requeued",
                "Jobs moved back to the shared queue by exiting workers",
                registry
            )
            .unwrap(),
        })
    }
}

/// Metrics backed by a throwaway registry, for tests.
pub fn test_metrics() -> Arc<Metrics> {
    Metrics::new(&Registry::new())
}
