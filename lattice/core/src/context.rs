// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;

use lattice_config::Parameters;

use crate::metrics::Metrics;
#[cfg(test)]
use crate::metrics::test_metrics;

/// Context carries this process's identity, configuration and metrics, shared
/// by every component of the runtime.
#[derive(Clone)]
pub struct Context {
    /// Stable numeric id of this process in the cluster.
    pub own_id: u64,
    /// Stable name of this process, unique within the cluster.
    pub own_name: String,
    /// Operational parameters.
    pub parameters: Parameters,
    /// Runtime metrics.
    pub metrics: Arc<Metrics>,
}

impl Context {
    pub fn new(
        own_id: u64,
        own_name: String,
        parameters: Parameters,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            own_id,
            own_name,
            parameters,
            metrics,
        }
    }

    /// Create a test context with default parameters.
    #[cfg(test)]
    pub(crate) fn new_for_test(own_id: u64) -> Self {
        Context::new(
            own_id,
            format!("test-node-{own_id}"),
            Parameters::default(),
            test_metrics(),
        )
    }

    #[cfg(test)]
    pub(crate) fn with_parameters(mut self, parameters: Parameters) -> Self {
        self.parameters = parameters;
        self
    }
}
