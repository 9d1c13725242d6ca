// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Operational configuration of one lattice process.
///
/// All fields tolerate differences between peers; nothing here has to agree
/// cluster-wide. Defaults should make sense, so most operators only need to
/// set the registry hosts and the bus listen addresses.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Parameters {
    #[serde(default)]
    pub bus: BusParameters,
    #[serde(default)]
    pub timer: TimerParameters,
    #[serde(default)]
    pub registry: RegistryParameters,
    #[serde(default)]
    pub worker_pool: WorkerPoolParameters,
}

/// Bus transport tuning. The transports themselves live behind connectors;
/// these values bound the runtime's buffering and pacing around them.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BusParameters {
    /// Addresses this process listens on, in `scheme://…` form.
    #[serde(default)]
    pub listen: Vec<String>,

    #[serde(default = "BusParameters::default_first_idle_timeout")]
    pub first_idle_timeout: Duration,

    #[serde(default = "BusParameters::default_ping_interval")]
    pub ping_interval: Duration,

    #[serde(default = "BusParameters::default_retry_interval")]
    pub retry_interval: Duration,

    /// Allowed consecutive failures before a connection is torn down.
    #[serde(default = "BusParameters::default_fault_tolerant")]
    pub fault_tolerant: u32,

    /// Upper bound for a single message payload, in bytes.
    #[serde(default = "BusParameters::default_message_size")]
    pub message_size: usize,

    /// Per-endpoint cap on buffered outbound bytes. Zero disables the cap.
    #[serde(default = "BusParameters::default_send_buffer_size")]
    pub send_buffer_size: usize,

    /// Per-endpoint cap on buffered outbound messages. Zero disables the cap.
    #[serde(default)]
    pub send_buffer_number: usize,

    #[serde(default = "BusParameters::default_receive_buffer_size")]
    pub receive_buffer_size: usize,

    /// Events drained from the bus per loop iteration.
    #[serde(default = "BusParameters::default_loop_times")]
    pub loop_times: u32,

    /// Relay hop limit for forwarded messages.
    #[serde(default = "BusParameters::default_ttl")]
    pub ttl: u32,
}

impl BusParameters {
    pub fn default_first_idle_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn default_ping_interval() -> Duration {
        Duration::from_secs(8)
    }

    pub fn default_retry_interval() -> Duration {
        Duration::from_secs(3)
    }

    pub fn default_fault_tolerant() -> u32 {
        2
    }

    pub fn default_message_size() -> usize {
        64 * 1024
    }

    pub fn default_send_buffer_size() -> usize {
        2 * 1024 * 1024
    }

    pub fn default_receive_buffer_size() -> usize {
        8 * 1024 * 1024
    }

    pub fn default_loop_times() -> u32 {
        2000
    }

    pub fn default_ttl() -> u32 {
        16
    }
}

impl Default for BusParameters {
    fn default() -> Self {
        BusParameters {
            listen: Vec::new(),
            first_idle_timeout: Self::default_first_idle_timeout(),
            ping_interval: Self::default_ping_interval(),
            retry_interval: Self::default_retry_interval(),
            fault_tolerant: Self::default_fault_tolerant(),
            message_size: Self::default_message_size(),
            send_buffer_size: Self::default_send_buffer_size(),
            send_buffer_number: 0,
            receive_buffer_size: Self::default_receive_buffer_size(),
            loop_times: Self::default_loop_times(),
            ttl: Self::default_ttl(),
        }
    }
}

/// Main-loop pacing and deadline configuration.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TimerParameters {
    #[serde(default = "TimerParameters::default_tick_interval")]
    pub tick_interval: Duration,

    /// Hard deadline for a graceful stop.
    #[serde(default = "TimerParameters::default_stop_timeout")]
    pub stop_timeout: Duration,

    /// Poll interval while waiting for modules to finish stopping.
    #[serde(default = "TimerParameters::default_stop_interval")]
    pub stop_interval: Duration,

    /// How long a pending outbound message may wait for a ready connection.
    #[serde(default = "TimerParameters::default_message_timeout")]
    pub message_timeout: Duration,

    /// Default per-module `init()` deadline; a module may raise its own
    /// during `setup()`.
    #[serde(default = "TimerParameters::default_initialize_timeout")]
    pub initialize_timeout: Duration,
}

impl TimerParameters {
    pub fn default_tick_interval() -> Duration {
        Duration::from_millis(32)
    }

    pub fn default_stop_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn default_stop_interval() -> Duration {
        Duration::from_millis(256)
    }

    pub fn default_message_timeout() -> Duration {
        Duration::from_secs(8)
    }

    pub fn default_initialize_timeout() -> Duration {
        Duration::from_secs(30)
    }
}

impl Default for TimerParameters {
    fn default() -> Self {
        TimerParameters {
            tick_interval: Self::default_tick_interval(),
            stop_timeout: Self::default_stop_timeout(),
            stop_interval: Self::default_stop_interval(),
            message_timeout: Self::default_message_timeout(),
            initialize_timeout: Self::default_initialize_timeout(),
        }
    }
}

/// Registry bootstrap configuration (tick pacing and deadline used before the
/// app reaches `Running`).
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RegistryInitParameters {
    #[serde(default = "RegistryInitParameters::default_tick_interval")]
    pub tick_interval: Duration,
    #[serde(default = "RegistryInitParameters::default_timeout")]
    pub timeout: Duration,
}

impl RegistryInitParameters {
    pub fn default_tick_interval() -> Duration {
        Duration::from_millis(256)
    }

    pub fn default_timeout() -> Duration {
        Duration::from_secs(5)
    }
}

impl Default for RegistryInitParameters {
    fn default() -> Self {
        RegistryInitParameters {
            tick_interval: Self::default_tick_interval(),
            timeout: Self::default_timeout(),
        }
    }
}

/// Session configuration for the strongly-consistent registry.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RegistryParameters {
    /// Seed hosts. The live host list is refreshed from the cluster's member
    /// list unless `cluster_auto_update` is off.
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Root path all of this cluster's keys live under.
    #[serde(default = "RegistryParameters::default_path")]
    pub path: String,

    /// `user:password`, empty when the registry is unauthenticated.
    #[serde(default)]
    pub authorization: String,

    #[serde(default)]
    pub init: RegistryInitParameters,

    #[serde(default = "RegistryParameters::default_cluster_auto_update")]
    pub cluster_auto_update: bool,

    #[serde(default = "RegistryParameters::default_members_update_interval")]
    pub members_update_interval: Duration,

    #[serde(default = "RegistryParameters::default_members_retry_interval")]
    pub members_retry_interval: Duration,

    /// Per-request timeout for everything except watch long-polls.
    #[serde(default = "RegistryParameters::default_request_timeout")]
    pub request_timeout: Duration,

    /// TTL requested on lease grant.
    #[serde(default = "RegistryParameters::default_lease_ttl")]
    pub lease_ttl: Duration,

    #[serde(default = "RegistryParameters::default_keepalive_interval")]
    pub keepalive_interval: Duration,

    /// Bounded retries for deferred path deletes left behind by removed
    /// keepalive actors.
    #[serde(default = "RegistryParameters::default_keepalive_retry_times")]
    pub keepalive_retry_times: u32,

    #[serde(default = "RegistryParameters::default_authorization_retry_interval")]
    pub authorization_retry_interval: Duration,

    /// Cadence of the user-get token refresh probe.
    #[serde(default = "RegistryParameters::default_auth_user_get_interval")]
    pub auth_user_get_interval: Duration,

    #[serde(default = "RegistryParameters::default_watcher_retry_interval")]
    pub watcher_retry_interval: Duration,

    /// Watch long-poll timeout; hitting it is the normal keepalive path.
    #[serde(default = "RegistryParameters::default_watcher_request_timeout")]
    pub watcher_request_timeout: Duration,

    /// Timeout for the full-snapshot range read, sized for large result sets.
    #[serde(default = "RegistryParameters::default_watcher_get_request_timeout")]
    pub watcher_get_request_timeout: Duration,

    /// Optional random delay window applied before a watcher's first request,
    /// spreading load after mass restarts. Zero disables the delay.
    #[serde(default)]
    pub watcher_startup_delay_min: Duration,
    #[serde(default)]
    pub watcher_startup_delay_max: Duration,
}

impl RegistryParameters {
    pub fn default_path() -> String {
        "/lattice".to_string()
    }

    pub fn default_cluster_auto_update() -> bool {
        true
    }

    pub fn default_members_update_interval() -> Duration {
        Duration::from_secs(300)
    }

    pub fn default_members_retry_interval() -> Duration {
        Duration::from_secs(15)
    }

    pub fn default_request_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn default_lease_ttl() -> Duration {
        Duration::from_secs(31)
    }

    pub fn default_keepalive_interval() -> Duration {
        Duration::from_secs(10)
    }

    pub fn default_keepalive_retry_times() -> u32 {
        8
    }

    pub fn default_authorization_retry_interval() -> Duration {
        Duration::from_secs(5)
    }

    pub fn default_auth_user_get_interval() -> Duration {
        Duration::from_secs(3600)
    }

    pub fn default_watcher_retry_interval() -> Duration {
        Duration::from_secs(15)
    }

    pub fn default_watcher_request_timeout() -> Duration {
        Duration::from_secs(3600)
    }

    pub fn default_watcher_get_request_timeout() -> Duration {
        Duration::from_secs(180)
    }
}

impl Default for RegistryParameters {
    fn default() -> Self {
        RegistryParameters {
            hosts: Vec::new(),
            path: Self::default_path(),
            authorization: String::new(),
            init: RegistryInitParameters::default(),
            cluster_auto_update: Self::default_cluster_auto_update(),
            members_update_interval: Self::default_members_update_interval(),
            members_retry_interval: Self::default_members_retry_interval(),
            request_timeout: Self::default_request_timeout(),
            lease_ttl: Self::default_lease_ttl(),
            keepalive_interval: Self::default_keepalive_interval(),
            keepalive_retry_times: Self::default_keepalive_retry_times(),
            authorization_retry_interval: Self::default_authorization_retry_interval(),
            auth_user_get_interval: Self::default_auth_user_get_interval(),
            watcher_retry_interval: Self::default_watcher_retry_interval(),
            watcher_request_timeout: Self::default_watcher_request_timeout(),
            watcher_get_request_timeout: Self::default_watcher_get_request_timeout(),
            watcher_startup_delay_min: Duration::ZERO,
            watcher_startup_delay_max: Duration::ZERO,
        }
    }
}

/// Autoscaling thresholds. CPU thresholds are permillage of one core over the
/// stabilization window; queue thresholds are jobs-per-worker and zero
/// disables the queue rule.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ScalingRules {
    #[serde(default = "ScalingRules::default_scaling_up_queue_size")]
    pub scaling_up_queue_size: u32,

    #[serde(default = "ScalingRules::default_scaling_up_cpu_permillage")]
    pub scaling_up_cpu_permillage: i64,

    #[serde(default = "ScalingRules::default_stabilization_window")]
    pub scaling_up_stabilization_window: Duration,

    #[serde(default = "ScalingRules::default_scaling_down_queue_size")]
    pub scaling_down_queue_size: u32,

    #[serde(default = "ScalingRules::default_scaling_down_cpu_permillage")]
    pub scaling_down_cpu_permillage: i64,

    #[serde(default = "ScalingRules::default_stabilization_window")]
    pub scaling_down_stabilization_window: Duration,

    /// Cadence of the scan that renumbers around leaked (exited-in-place)
    /// workers.
    #[serde(default = "ScalingRules::default_leak_scan_interval")]
    pub leak_scan_interval: Duration,
}

impl ScalingRules {
    pub fn default_scaling_up_queue_size() -> u32 {
        16
    }

    pub fn default_scaling_up_cpu_permillage() -> i64 {
        600
    }

    pub fn default_scaling_down_queue_size() -> u32 {
        12
    }

    pub fn default_scaling_down_cpu_permillage() -> i64 {
        500
    }

    pub fn default_stabilization_window() -> Duration {
        Duration::from_secs(10)
    }

    pub fn default_leak_scan_interval() -> Duration {
        Duration::from_secs(300)
    }
}

impl Default for ScalingRules {
    fn default() -> Self {
        ScalingRules {
            scaling_up_queue_size: Self::default_scaling_up_queue_size(),
            scaling_up_cpu_permillage: Self::default_scaling_up_cpu_permillage(),
            scaling_up_stabilization_window: Self::default_stabilization_window(),
            scaling_down_queue_size: Self::default_scaling_down_queue_size(),
            scaling_down_cpu_permillage: Self::default_scaling_down_cpu_permillage(),
            scaling_down_stabilization_window: Self::default_stabilization_window(),
            leak_scan_interval: Self::default_leak_scan_interval(),
        }
    }
}

/// Worker pool sizing and pacing.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WorkerPoolParameters {
    #[serde(default = "WorkerPoolParameters::default_worker_number_min")]
    pub worker_number_min: u32,

    #[serde(default = "WorkerPoolParameters::default_worker_number_max")]
    pub worker_number_max: u32,

    /// Per-worker private queue cap; spawns beyond it fail busy.
    #[serde(default = "WorkerPoolParameters::default_queue_size")]
    pub queue_size: u32,

    #[serde(default = "WorkerPoolParameters::default_tick_min_interval")]
    pub tick_min_interval: Duration,

    #[serde(default = "WorkerPoolParameters::default_tick_max_interval")]
    pub tick_max_interval: Duration,

    #[serde(default)]
    pub scaling_rules: ScalingRules,
}

impl WorkerPoolParameters {
    pub fn default_worker_number_min() -> u32 {
        1
    }

    pub fn default_worker_number_max() -> u32 {
        8
    }

    pub fn default_queue_size() -> u32 {
        20480
    }

    pub fn default_tick_min_interval() -> Duration {
        Duration::from_millis(4)
    }

    pub fn default_tick_max_interval() -> Duration {
        Duration::from_millis(128)
    }

    /// Min/max corrected the way `reload` applies them: min at least 1, max
    /// at least min.
    pub fn normalized_worker_bounds(&self) -> (u32, u32) {
        let min = self.worker_number_min.max(1);
        let max = self.worker_number_max.max(min);
        (min, max)
    }
}

impl Default for WorkerPoolParameters {
    fn default() -> Self {
        WorkerPoolParameters {
            worker_number_min: Self::default_worker_number_min(),
            worker_number_max: Self::default_worker_number_max(),
            queue_size: Self::default_queue_size(),
            tick_min_interval: Self::default_tick_min_interval(),
            tick_max_interval: Self::default_tick_max_interval(),
            scaling_rules: ScalingRules::default(),
        }
    }
}
