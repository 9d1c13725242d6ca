// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{CoreError, CoreResult};

/// Identifies the worker an action runs on. Id 0 is the main thread (shared
/// queue); real workers are numbered from 1 by position in the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerContext {
    pub worker_id: u32,
}

pub type JobAction = Box<dyn FnOnce(&WorkerContext) + Send>;
pub type TickAction = Arc<dyn Fn(&WorkerContext) + Send + Sync>;

struct Job {
    action: Option<JobAction>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerStatus {
    Created = 0,
    Running = 1,
    Sleeping = 2,
    Exiting = 3,
    Exited = 4,
}

impl WorkerStatus {
    fn from_u8(value: u8) -> WorkerStatus {
        match value {
            0 => WorkerStatus::Created,
            1 => WorkerStatus::Running,
            2 => WorkerStatus::Sleeping,
            3 => WorkerStatus::Exiting,
            _ => WorkerStatus::Exited,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerScalingMode {
    /// `worker_id <= min_workers`: always kept.
    Stable,
    /// Between the minimum and the current expected count.
    Dynamic,
    /// Beyond the expected count; exits once its tick callbacks are gone.
    PendingToDestroy,
}

#[derive(Clone, Copy, Debug)]
pub struct WorkerMeta {
    pub scaling_mode: WorkerScalingMode,
}

/// Handle to a registered tick callback. Carries the list version observed at
/// registration so removal can detect a recycled worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickCallbackHandle {
    worker_id: u32,
    slot: u64,
    version: u64,
}

/// Scheduler key: least-loaded first, with sub-8ms last-second differences
/// ignored so selection does not flap on noise.
#[derive(Clone, Copy, Debug)]
struct WorkerCompareKey {
    pending_jobs: usize,
    last_second_busy_us: i64,
    last_minute_busy_us: i64,
    worker_id: u32,
}

const LAST_SECOND_BUSY_BAND_US: i64 = 8000;

impl Ord for WorkerCompareKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        if self.pending_jobs != other.pending_jobs {
            return self.pending_jobs.cmp(&other.pending_jobs);
        }
        if (self.last_second_busy_us >= LAST_SECOND_BUSY_BAND_US
            || other.last_second_busy_us >= LAST_SECOND_BUSY_BAND_US)
            && self.last_second_busy_us != other.last_second_busy_us
        {
            return self.last_second_busy_us.cmp(&other.last_second_busy_us);
        }
        if self.last_minute_busy_us != other.last_minute_busy_us {
            return self.last_minute_busy_us.cmp(&other.last_minute_busy_us);
        }
        self.worker_id.cmp(&other.worker_id)
    }
}

impl PartialOrd for WorkerCompareKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for WorkerCompareKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for WorkerCompareKey {}

struct TickHandleList {
    version: u64,
    next_slot: u64,
    items: Vec<(u64, TickAction)>,
}

struct Worker {
    worker_id: AtomicU32,
    status: AtomicU8,
    private_jobs: SegQueue<Job>,
    tick_handles: Mutex<TickHandleList>,
    current_tick_interval_us: AtomicI64,

    cpu_busy_us: AtomicI64,
    cpu_sleep_us: AtomicI64,
    last_second_busy_us: AtomicI64,
    last_minute_busy_us: AtomicI64,
    collect_scaling_up_us: AtomicI64,
    collect_scaling_down_us: AtomicI64,

    waker_lock: Mutex<()>,
    waker_cv: Condvar,
}

impl Worker {
    fn new(worker_id: u32, initial_tick_interval_us: i64) -> Arc<Worker> {
        Arc::new(Worker {
            worker_id: AtomicU32::new(worker_id),
            status: AtomicU8::new(WorkerStatus::Created as u8),
            private_jobs: SegQueue::new(),
            tick_handles: Mutex::new(TickHandleList {
                version: 0,
                next_slot: 0,
                items: Vec::new(),
            }),
            current_tick_interval_us: AtomicI64::new(initial_tick_interval_us),
            cpu_busy_us: AtomicI64::new(0),
            cpu_sleep_us: AtomicI64::new(0),
            last_second_busy_us: AtomicI64::new(0),
            last_minute_busy_us: AtomicI64::new(0),
            collect_scaling_up_us: AtomicI64::new(0),
            collect_scaling_down_us: AtomicI64::new(0),
            waker_lock: Mutex::new(()),
            waker_cv: Condvar::new(),
        })
    }

    fn id(&self) -> u32 {
        self.worker_id.load(Ordering::Acquire)
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    fn is_exiting(&self) -> bool {
        matches!(self.status(), WorkerStatus::Exiting | WorkerStatus::Exited)
    }

    fn pending_job_size(&self) -> usize {
        self.private_jobs.len()
    }

    fn compare_key(&self) -> WorkerCompareKey {
        WorkerCompareKey {
            pending_jobs: self.pending_job_size(),
            last_second_busy_us: self.last_second_busy_us.load(Ordering::Acquire),
            last_minute_busy_us: self.last_minute_busy_us.load(Ordering::Acquire),
            worker_id: self.id(),
        }
    }

    fn emplace(&self, job: Job) {
        let need_wakeup = self.private_jobs.is_empty();
        self.private_jobs.push(job);
        if need_wakeup {
            self.wakeup();
        }
    }

    fn wakeup(&self) {
        self.waker_cv.notify_one();
    }

    fn collect_scaling_up_cpu_time(&self) -> i64 {
        let current = self.cpu_busy_us.load(Ordering::Acquire);
        let before = self.collect_scaling_up_us.swap(current, Ordering::AcqRel);
        (current - before).max(0)
    }

    fn collect_scaling_down_cpu_time(&self) -> i64 {
        let current = self.cpu_busy_us.load(Ordering::Acquire);
        let before = self.collect_scaling_down_us.swap(current, Ordering::AcqRel);
        (current - before).max(0)
    }

    /// Drains the private queue (bounded by 256 consecutive empty actions or
    /// the tick interval), runs every tick callback once, then adapts the
    /// interval to the measured cost.
    fn background_job_tick(
        &self,
        mut tick_current_interval: Duration,
        mut tick_min_interval: Duration,
        mut tick_max_interval: Duration,
    ) {
        let start = Instant::now();
        let worker_context = WorkerContext { worker_id: self.id() };

        let mut no_action_counter = 256i32;
        while let Some(job) = self.private_jobs.pop() {
            match job.action {
                Some(action) => {
                    no_action_counter = 0;
                    action(&worker_context);
                }
                None => no_action_counter -= 1,
            }
            if no_action_counter <= 0 && start.elapsed() >= tick_current_interval {
                break;
            }
        }

        // Snapshot under lock, run unlocked: a callback may deregister
        // itself through the pool without deadlocking.
        let callbacks: Vec<TickAction> = {
            let handles = self.tick_handles.lock();
            handles.items.iter().map(|(_, action)| action.clone()).collect()
        };
        if callbacks.is_empty() {
            return;
        }
        for callback in &callbacks {
            callback(&worker_context);
        }

        let tick_cost = start.elapsed();
        if tick_cost + tick_cost <= tick_current_interval {
            tick_current_interval /= 2;
        } else if tick_cost >= tick_current_interval {
            tick_current_interval *= 2;
        }

        if tick_min_interval < Duration::from_micros(1) {
            tick_min_interval = Duration::from_micros(4);
        }
        if tick_max_interval < tick_min_interval {
            tick_max_interval = tick_min_interval;
        }
        tick_current_interval = tick_current_interval.clamp(tick_min_interval, tick_max_interval);
        self.current_tick_interval_us
            .store(tick_current_interval.as_micros() as i64, Ordering::Release);
    }

    fn start(self: &Arc<Worker>, owner: Arc<WorkerSet>) {
        let worker = self.clone();
        let builder = thread::Builder::new().name(format!("lattice-worker-{}", worker.id()));
        let spawned = builder.spawn(move || worker.run(owner));
        if let Err(spawn_error) = spawned {
            warn!(%spawn_error, "worker thread spawn failed");
            self.status
                .store(WorkerStatus::Exited as u8, Ordering::Release);
        }
    }

    fn run(self: Arc<Worker>, owner: Arc<WorkerSet>) {
        self.status
            .store(WorkerStatus::Running as u8, Ordering::Release);
        debug!(worker_id = self.id(), "worker started");

        let mut checkpoint_second = u64::MAX;
        let mut checkpoint_minute = u64::MAX;

        while !owner.cleaning.load(Ordering::Acquire) {
            if owner.closing.load(Ordering::Acquire)
                || self.id() > owner.current_expect_workers.load(Ordering::Acquire)
            {
                // Workers keep running while they still host tick callbacks.
                if self.tick_handles.lock().items.is_empty() {
                    break;
                }
            }

            let tick_interval = Duration::from_micros(
                self.current_tick_interval_us.load(Ordering::Acquire).max(0) as u64,
            );
            let tick_min = Duration::from_micros(
                owner.tick_min_interval_us.load(Ordering::Acquire).max(0) as u64,
            );
            let tick_max = Duration::from_micros(
                owner.tick_max_interval_us.load(Ordering::Acquire).max(0) as u64,
            );

            let start = Instant::now();
            self.background_job_tick(tick_interval, tick_min, tick_max);
            let busy_end = Instant::now();
            let busy = busy_end.saturating_duration_since(start);
            let busy_us = busy.as_micros() as i64;
            self.cpu_busy_us.fetch_add(busy_us, Ordering::AcqRel);

            let second_now = busy_end.saturating_duration_since(owner.epoch).as_secs();
            if second_now != checkpoint_second {
                checkpoint_second = second_now;
                let second_start = owner.epoch + Duration::from_secs(second_now);
                self.last_second_busy_us.store(
                    busy_end.saturating_duration_since(second_start).as_micros() as i64,
                    Ordering::Release,
                );

                if checkpoint_minute > checkpoint_second
                    || checkpoint_minute + 60 < checkpoint_second
                {
                    checkpoint_minute = checkpoint_second - checkpoint_second % 60;
                    let minute_start = owner.epoch + Duration::from_secs(checkpoint_minute);
                    self.last_minute_busy_us.store(
                        busy_end.saturating_duration_since(minute_start).as_micros() as i64,
                        Ordering::Release,
                    );
                } else {
                    self.last_minute_busy_us.fetch_add(busy_us, Ordering::AcqRel);
                }
            } else {
                self.last_second_busy_us.fetch_add(busy_us, Ordering::AcqRel);
                self.last_minute_busy_us.fetch_add(busy_us, Ordering::AcqRel);
            }

            if busy < tick_interval {
                let mut guard = self.waker_lock.lock();
                self.status
                    .store(WorkerStatus::Sleeping as u8, Ordering::Release);
                self.waker_cv.wait_for(&mut guard, tick_interval - busy);
                self.status
                    .store(WorkerStatus::Running as u8, Ordering::Release);
                drop(guard);
                let slept = Instant::now().saturating_duration_since(busy_end);
                self.cpu_sleep_us
                    .fetch_add(slept.as_micros() as i64, Ordering::AcqRel);
            }
        }

        self.status
            .store(WorkerStatus::Exiting as u8, Ordering::Release);

        // Unfinished jobs become pool-wide; callbacks registered here are
        // invalid from now on.
        {
            let mut handles = self.tick_handles.lock();
            handles.version += 1;
            handles.items.clear();
        }
        while let Some(job) = self.private_jobs.pop() {
            owner.shared_jobs.push(job);
            owner.metrics_requeued();
        }

        debug!(worker_id = self.id(), "worker exited");
        self.status
            .store(WorkerStatus::Exited as u8, Ordering::Release);
    }
}

struct WorkerSet {
    epoch: Instant,
    workers: Mutex<Vec<Arc<Worker>>>,
    shared_jobs: SegQueue<Job>,
    closing: AtomicBool,
    cleaning: AtomicBool,
    current_expect_workers: AtomicU32,
    tick_min_interval_us: AtomicI64,
    tick_max_interval_us: AtomicI64,
    need_scaling_up: AtomicBool,
    context: Arc<Context>,
}

impl WorkerSet {
    fn metrics_requeued(&self) {
        self.context.metrics.worker_pool_jobs_requeued.inc();
    }
}

#[derive(Clone, Copy, Debug)]
struct ScalingSettings {
    min_workers: u32,
    max_workers: u32,
    queue_size_limit: usize,
    scaling_up_queue_size: u32,
    scaling_up_cpu_permillage: i64,
    scaling_up_window: Duration,
    scaling_down_queue_size: u32,
    scaling_down_cpu_permillage: i64,
    scaling_down_window: Duration,
    leak_scan_interval: Duration,
}

impl ScalingSettings {
    fn from_context(context: &Context) -> ScalingSettings {
        let pool = &context.parameters.worker_pool;
        let rules = &pool.scaling_rules;
        let (min_workers, max_workers) = pool.normalized_worker_bounds();

        let scaling_up_cpu_permillage = if rules.scaling_up_cpu_permillage <= 0 {
            600
        } else {
            rules.scaling_up_cpu_permillage
        };
        let mut scaling_down_cpu_permillage = if rules.scaling_down_cpu_permillage <= 0 {
            500
        } else {
            rules.scaling_down_cpu_permillage
        };
        if scaling_down_cpu_permillage > scaling_up_cpu_permillage {
            scaling_down_cpu_permillage = scaling_up_cpu_permillage;
        }

        let window_or = |window: Duration| {
            if window.is_zero() {
                Duration::from_secs(10)
            } else {
                window
            }
        };

        ScalingSettings {
            min_workers,
            max_workers,
            queue_size_limit: pool.queue_size.max(1) as usize,
            scaling_up_queue_size: rules.scaling_up_queue_size,
            scaling_up_cpu_permillage,
            scaling_up_window: window_or(rules.scaling_up_stabilization_window),
            scaling_down_queue_size: rules.scaling_down_queue_size,
            scaling_down_cpu_permillage,
            scaling_down_window: window_or(rules.scaling_down_stabilization_window),
            leak_scan_interval: if rules.leak_scan_interval.is_zero() {
                Duration::from_secs(300)
            } else {
                rules.leak_scan_interval
            },
        }
    }
}

/// Main-thread scaling bookkeeping: window checkpoints and the CPU time
/// collected from workers that were popped or renumbered away.
struct ScalingState {
    last_scaling_up_checkpoint: Instant,
    last_scaling_down_checkpoint: Instant,
    leak_scan_checkpoint: Instant,
    carry_scaling_up_us: i64,
    carry_scaling_down_us: i64,
}

/// Elastic pool of background workers with per-worker job queues, periodic
/// tick callbacks, CPU-based autoscaling and orderly drain on stop.
///
/// `spawn`, tick-callback management and the statistics getters are
/// thread-safe; `tick`, `stop` and `cleanup` belong to the main thread.
pub struct WorkerPool {
    context: Arc<Context>,
    set: Arc<WorkerSet>,
    scaling: ScalingSettings,
    scaling_state: Mutex<ScalingState>,
}

impl WorkerPool {
    pub fn new(context: Arc<Context>) -> WorkerPool {
        let scaling = ScalingSettings::from_context(&context);
        let pool = &context.parameters.worker_pool;
        let tick_min = pool.tick_min_interval.max(Duration::from_micros(4));
        let tick_max = pool.tick_max_interval.max(tick_min);
        let now = Instant::now();

        let set = Arc::new(WorkerSet {
            epoch: now,
            workers: Mutex::new(Vec::new()),
            shared_jobs: SegQueue::new(),
            closing: AtomicBool::new(false),
            cleaning: AtomicBool::new(false),
            current_expect_workers: AtomicU32::new(scaling.min_workers),
            tick_min_interval_us: AtomicI64::new(tick_min.as_micros() as i64),
            tick_max_interval_us: AtomicI64::new(tick_max.as_micros() as i64),
            need_scaling_up: AtomicBool::new(true),
            context: context.clone(),
        });
        context
            .metrics
            .worker_pool_expect_workers
            .set(scaling.min_workers as i64);

        WorkerPool {
            context,
            set,
            scaling,
            scaling_state: Mutex::new(ScalingState {
                last_scaling_up_checkpoint: now,
                last_scaling_down_checkpoint: now,
                leak_scan_checkpoint: now,
                carry_scaling_up_us: 0,
                carry_scaling_down_us: 0,
            }),
        }
    }

    // ---- spawn -----------------------------------------------------------

    /// Runs `action` on the least-loaded worker. Returns the worker the job
    /// landed on; id 0 means the shared queue (no live worker yet).
    pub fn spawn(
        &self,
        action: impl FnOnce(&WorkerContext) + Send + 'static,
    ) -> CoreResult<WorkerContext> {
        self.do_scaling_up();

        let selected = self.select_worker();
        let Some(worker) = selected else {
            if self.set.cleaning.load(Ordering::Acquire) {
                return Err(CoreError::Closed);
            }
            self.set.shared_jobs.push(Job {
                action: Some(Box::new(action)),
            });
            self.context.metrics.worker_pool_jobs_spawned.inc();
            return Ok(WorkerContext { worker_id: 0 });
        };

        if worker.pending_job_size() >= self.scaling.queue_size_limit {
            return Err(CoreError::Busy);
        }
        let worker_context = WorkerContext {
            worker_id: worker.id(),
        };
        worker.emplace(Job {
            action: Some(Box::new(action)),
        });
        self.context.metrics.worker_pool_jobs_spawned.inc();
        Ok(worker_context)
    }

    /// Runs `action` on the specific worker named by `context`.
    pub fn spawn_with_context(
        &self,
        action: impl FnOnce(&WorkerContext) + Send + 'static,
        worker_context: &WorkerContext,
    ) -> CoreResult<()> {
        let worker = self.select_worker_by_id(worker_context.worker_id)?;
        if worker.pending_job_size() >= self.scaling.queue_size_limit {
            return Err(CoreError::Busy);
        }
        worker.emplace(Job {
            action: Some(Box::new(action)),
        });
        self.context.metrics.worker_pool_jobs_spawned.inc();
        Ok(())
    }

    // ---- tick callbacks --------------------------------------------------

    /// Registers a callback run once per background tick on one worker.
    pub fn add_tick_callback(
        &self,
        action: impl Fn(&WorkerContext) + Send + Sync + 'static,
        worker_context: &WorkerContext,
    ) -> CoreResult<TickCallbackHandle> {
        let worker = self.select_worker_by_id(worker_context.worker_id)?;
        let mut handles = worker.tick_handles.lock();
        let slot = handles.next_slot;
        handles.next_slot += 1;
        handles.items.push((slot, Arc::new(action)));
        let handle = TickCallbackHandle {
            worker_id: worker.id(),
            slot,
            version: handles.version,
        };
        drop(handles);
        worker.wakeup();
        Ok(handle)
    }

    /// Removal succeeds only when the handle still names a live registration:
    /// the worker exists, the list version matches, and the slot is present.
    pub fn remove_tick_callback(&self, handle: TickCallbackHandle) -> bool {
        let Some(worker) = self.find_worker_any(handle.worker_id) else {
            return false;
        };
        let mut handles = worker.tick_handles.lock();
        if handles.version != handle.version {
            return false;
        }
        let before = handles.items.len();
        handles.items.retain(|(slot, _)| *slot != handle.slot);
        let removed = handles.items.len() != before;
        let now_empty = handles.items.is_empty();
        drop(handles);
        if removed && now_empty {
            // Lets a pending-to-destroy worker notice it can exit.
            worker.wakeup();
        }
        removed
    }

    pub fn reset_tick_interval(
        &self,
        worker_context: &WorkerContext,
        new_tick_interval: Duration,
    ) -> bool {
        let Ok(worker) = self.select_worker_by_id(worker_context.worker_id) else {
            return false;
        };
        let min = Duration::from_micros(
            self.set.tick_min_interval_us.load(Ordering::Acquire).max(0) as u64,
        );
        let max = Duration::from_micros(
            self.set.tick_max_interval_us.load(Ordering::Acquire).max(0) as u64,
        );
        let clamped = new_tick_interval.clamp(min, max);
        worker
            .current_tick_interval_us
            .store(clamped.as_micros() as i64, Ordering::Release);
        true
    }

    pub fn get_tick_interval(&self, worker_context: &WorkerContext) -> Option<Duration> {
        let worker = self.select_worker_by_id(worker_context.worker_id).ok()?;
        Some(Duration::from_micros(
            worker.current_tick_interval_us.load(Ordering::Acquire).max(0) as u64,
        ))
    }

    // ---- introspection ---------------------------------------------------

    pub fn get_current_worker_count(&self) -> usize {
        self.set.workers.lock().len()
    }

    pub fn get_configure_worker_expect_count(&self) -> u32 {
        self.set.current_expect_workers.load(Ordering::Acquire)
    }

    pub fn get_configure_worker_min_count(&self) -> u32 {
        self.scaling.min_workers
    }

    pub fn get_configure_worker_max_count(&self) -> u32 {
        self.scaling.max_workers
    }

    pub fn get_configure_worker_queue_size(&self) -> usize {
        self.scaling.queue_size_limit
    }

    pub fn get_configure_tick_min_interval(&self) -> Duration {
        Duration::from_micros(self.set.tick_min_interval_us.load(Ordering::Acquire).max(0) as u64)
    }

    pub fn get_configure_tick_max_interval(&self) -> Duration {
        Duration::from_micros(self.set.tick_max_interval_us.load(Ordering::Acquire).max(0) as u64)
    }

    pub fn get_statistics_last_second_busy_cpu_time(&self) -> Duration {
        let workers = self.set.workers.lock();
        let total: i64 = workers
            .iter()
            .map(|worker| worker.last_second_busy_us.load(Ordering::Acquire))
            .sum();
        Duration::from_micros(total.max(0) as u64)
    }

    pub fn get_statistics_last_minute_busy_cpu_time(&self) -> Duration {
        let workers = self.set.workers.lock();
        let total: i64 = workers
            .iter()
            .map(|worker| worker.last_minute_busy_us.load(Ordering::Acquire))
            .sum();
        Duration::from_micros(total.max(0) as u64)
    }

    /// Visits stable workers synthetically and live workers beyond the
    /// minimum under the pool lock. Return `false` to stop.
    pub fn foreach_worker_quickly(
        &self,
        mut visit: impl FnMut(&WorkerContext, &WorkerMeta) -> bool,
    ) {
        let expect = self.get_configure_worker_expect_count();
        let min = self.scaling.min_workers;

        for worker_id in 1..=min {
            if !visit(
                &WorkerContext { worker_id },
                &WorkerMeta {
                    scaling_mode: WorkerScalingMode::Stable,
                },
            ) {
                return;
            }
        }

        let workers = self.set.workers.lock();
        for worker in workers.iter() {
            if worker.is_exiting() || worker.id() <= min {
                continue;
            }
            let scaling_mode = if worker.id() <= expect {
                WorkerScalingMode::Dynamic
            } else {
                WorkerScalingMode::PendingToDestroy
            };
            if !visit(
                &WorkerContext {
                    worker_id: worker.id(),
                },
                &WorkerMeta { scaling_mode },
            ) {
                return;
            }
        }
    }

    /// Like `foreach_worker_quickly` but iterates over a snapshot, so the
    /// visitor may call back into the pool.
    pub fn foreach_worker(&self, mut visit: impl FnMut(&WorkerContext, &WorkerMeta) -> bool) {
        let expect = self.get_configure_worker_expect_count();
        let min = self.scaling.min_workers;

        for worker_id in 1..=min {
            if !visit(
                &WorkerContext { worker_id },
                &WorkerMeta {
                    scaling_mode: WorkerScalingMode::Stable,
                },
            ) {
                return;
            }
        }

        let snapshot = self.set.workers.lock().clone();
        for worker in snapshot {
            if worker.is_exiting() || worker.id() <= min {
                continue;
            }
            let scaling_mode = if worker.id() <= expect {
                WorkerScalingMode::Dynamic
            } else {
                WorkerScalingMode::PendingToDestroy
            };
            if !visit(
                &WorkerContext {
                    worker_id: worker.id(),
                },
                &WorkerMeta { scaling_mode },
            ) {
                return;
            }
        }
    }

    // ---- main-thread driving ---------------------------------------------

    pub fn tick(&self, now: Instant) {
        if self.set.closing.load(Ordering::Acquire) {
            self.internal_reduce_workers();
            self.rebalance_jobs();
            self.do_shared_jobs_on_main_thread();
            return;
        }

        let mut state = self.scaling_state.lock();
        let mut expect = self.get_configure_worker_expect_count();
        if expect == 0 {
            expect = self.scaling.min_workers;
        }

        // Scale up: ceil targets, never reduce here.
        if now >= state.last_scaling_up_checkpoint + self.scaling.scaling_up_window {
            let offset = now - state.last_scaling_up_checkpoint;
            state.last_scaling_up_checkpoint = now;
            let offset_us = offset.as_micros() as i64;
            if offset_us > 0 {
                let mut collected_us = state.carry_scaling_up_us;
                state.carry_scaling_up_us = 0;
                let mut queued_jobs = 0usize;
                {
                    let workers = self.set.workers.lock();
                    for worker in workers.iter() {
                        collected_us += worker.collect_scaling_up_cpu_time();
                        queued_jobs += worker.pending_job_size();
                    }
                }

                let mut target = ((collected_us * 1000 / offset_us)
                    / self.scaling.scaling_up_cpu_permillage)
                    as u32
                    + 1;
                if self.scaling.scaling_up_queue_size > 0 {
                    let by_queue =
                        (queued_jobs / self.scaling.scaling_up_queue_size as usize) as u32 + 1;
                    target = target.max(by_queue);
                }
                target = target.min(self.scaling.max_workers);
                if target > expect {
                    debug!(target, expect, "worker pool scaling up");
                    expect = target;
                }
            }
        }

        // Scale down: floor targets, never raise here.
        if now >= state.last_scaling_down_checkpoint + self.scaling.scaling_down_window {
            let offset = now - state.last_scaling_down_checkpoint;
            state.last_scaling_down_checkpoint = now;
            let offset_us = offset.as_micros() as i64;
            if offset_us > 0 {
                let mut collected_us = state.carry_scaling_down_us;
                state.carry_scaling_down_us = 0;
                let mut queued_jobs = 0usize;
                {
                    let workers = self.set.workers.lock();
                    for worker in workers.iter() {
                        collected_us += worker.collect_scaling_down_cpu_time();
                        queued_jobs += worker.pending_job_size();
                    }
                }

                let mut target = ((collected_us * 1000 / offset_us)
                    / self.scaling.scaling_down_cpu_permillage)
                    as u32;
                if self.scaling.scaling_down_queue_size > 0 {
                    let by_queue =
                        (queued_jobs / self.scaling.scaling_down_queue_size as usize) as u32;
                    target = target.max(by_queue);
                }
                target = target.max(self.scaling.min_workers);
                if target < expect {
                    debug!(target, expect, "worker pool scaling down");
                    expect = target;
                }
            }
        }

        if expect
            != self
                .set
                .current_expect_workers
                .swap(expect, Ordering::AcqRel)
        {
            self.set.need_scaling_up.store(true, Ordering::Release);
        }
        self.context
            .metrics
            .worker_pool_expect_workers
            .set(expect as i64);

        let leak_scan_due = now >= state.leak_scan_checkpoint + self.scaling.leak_scan_interval;
        if leak_scan_due {
            state.leak_scan_checkpoint = now;
        }
        drop(state);

        if leak_scan_due {
            self.internal_autofix_workers();
        } else {
            self.internal_reduce_workers();
        }

        self.rebalance_jobs();
    }

    /// Begins (or continues) a cooperative stop. Returns `true` once every
    /// live worker is exiting with an empty private queue and the shared
    /// queue is drained.
    pub fn stop(&self) -> bool {
        if !self.set.closing.swap(true, Ordering::AcqRel) {
            info!("worker pool stopping");
            self.set.current_expect_workers.store(0, Ordering::Release);
            let workers = self.set.workers.lock();
            for worker in workers.iter() {
                worker.wakeup();
            }
        }

        self.internal_reduce_workers();

        {
            let workers = self.set.workers.lock();
            for worker in workers.iter() {
                if worker.is_exiting() {
                    continue;
                }
                if worker.pending_job_size() > 0 {
                    return false;
                }
            }
        }

        self.set.shared_jobs.is_empty()
    }

    /// Tears the pool down, blocking until every worker thread has drained.
    pub fn cleanup(&self) {
        self.set.closing.store(true, Ordering::Release);
        self.set.cleaning.store(true, Ordering::Release);
        {
            let workers = self.set.workers.lock();
            for worker in workers.iter() {
                worker.wakeup();
            }
        }

        let mut sleep_interval = Duration::from_micros(
            self.set.tick_min_interval_us.load(Ordering::Acquire).max(1) as u64,
        );
        let max_interval = Duration::from_micros(
            self.set.tick_max_interval_us.load(Ordering::Acquire).max(1) as u64,
        );
        while self.internal_reduce_workers() {
            thread::sleep(sleep_interval);
            sleep_interval = (sleep_interval * 2).min(max_interval);
        }
    }

    // ---- internals -------------------------------------------------------

    fn do_scaling_up(&self) {
        if !self.set.need_scaling_up.swap(false, Ordering::AcqRel) {
            return;
        }
        let expect = self.set.current_expect_workers.load(Ordering::Acquire);
        let initial_interval = self.set.tick_min_interval_us.load(Ordering::Acquire);
        let mut workers = self.set.workers.lock();
        for index in workers.len()..expect as usize {
            let worker = Worker::new(index as u32 + 1, initial_interval);
            worker.start(self.set.clone());
            workers.push(worker);
        }
    }

    /// Pops exited tail workers; a live worker in the shrink region is woken
    /// so it can notice and exit on its own.
    fn internal_reduce_workers(&self) -> bool {
        let expect = if self.set.closing.load(Ordering::Acquire) {
            0
        } else {
            self.set.current_expect_workers.load(Ordering::Acquire)
        };

        let mut workers = self.set.workers.lock();
        while workers.len() > expect as usize {
            let last = workers.last().expect("non-empty list").clone();
            if last.status() != WorkerStatus::Exited {
                last.wakeup();
                break;
            }
            let mut state = self.scaling_state.lock();
            state.carry_scaling_up_us += last.collect_scaling_up_cpu_time();
            state.carry_scaling_down_us += last.collect_scaling_down_cpu_time();
            drop(state);
            workers.pop();
        }
        !workers.is_empty()
    }

    /// Rebuilds the pool around workers that exited in place, renumbering
    /// ids by position.
    fn internal_autofix_workers(&self) {
        let expect = if self.set.closing.load(Ordering::Acquire) {
            0
        } else {
            self.set.current_expect_workers.load(Ordering::Acquire)
        };

        let mut workers = self.set.workers.lock();
        let leaked = workers
            .iter()
            .take(expect as usize)
            .any(|worker| worker.status() == WorkerStatus::Exited);
        if !leaked {
            return;
        }

        info!("worker pool renumbering around exited workers");
        let mut state = self.scaling_state.lock();
        let mut alive = Vec::with_capacity(workers.len());
        for worker in workers.drain(..) {
            if worker.status() == WorkerStatus::Exited {
                state.carry_scaling_up_us += worker.collect_scaling_up_cpu_time();
                state.carry_scaling_down_us += worker.collect_scaling_down_cpu_time();
                continue;
            }
            alive.push(worker);
        }
        for (index, worker) in alive.iter().enumerate() {
            worker.worker_id.store(index as u32 + 1, Ordering::Release);
        }
        *workers = alive;
    }

    /// Drains the shared queue into workers keyed least-loaded-first,
    /// re-keying the target after each placement.
    fn rebalance_jobs(&self) {
        if self.set.shared_jobs.is_empty() {
            return;
        }
        self.do_scaling_up();

        let expect = self.set.current_expect_workers.load(Ordering::Acquire);
        let mut ordered: BTreeMap<WorkerCompareKey, Arc<Worker>> = BTreeMap::new();
        {
            let workers = self.set.workers.lock();
            for worker in workers.iter() {
                if worker.is_exiting() {
                    continue;
                }
                if worker.id() > expect {
                    break;
                }
                ordered.insert(worker.compare_key(), worker.clone());
            }
        }
        if ordered.is_empty() {
            return;
        }

        while let Some(job) = self.set.shared_jobs.pop() {
            let (_, worker) = ordered.pop_first().expect("non-empty map");
            worker.emplace(job);
            ordered.insert(worker.compare_key(), worker);
        }
    }

    /// Pumps shared jobs on the main thread; used while closing so nothing
    /// is stranded after the workers left.
    fn do_shared_jobs_on_main_thread(&self) {
        let tick_interval = Duration::from_micros(
            self.set.tick_max_interval_us.load(Ordering::Acquire).max(1) as u64,
        );
        let main_context = WorkerContext { worker_id: 0 };
        let start = Instant::now();
        let mut no_action_counter = 256i32;
        while let Some(job) = self.set.shared_jobs.pop() {
            match job.action {
                Some(action) => {
                    no_action_counter = 0;
                    action(&main_context);
                }
                None => no_action_counter -= 1,
            }
            if no_action_counter <= 0 && start.elapsed() >= tick_interval {
                break;
            }
        }
    }

    fn select_worker(&self) -> Option<Arc<Worker>> {
        let expect = self.set.current_expect_workers.load(Ordering::Acquire);
        let workers = self.set.workers.lock();
        let mut best: Option<(WorkerCompareKey, Arc<Worker>)> = None;
        for worker in workers.iter() {
            if worker.is_exiting() {
                continue;
            }
            if worker.id() > expect {
                break;
            }
            let key = worker.compare_key();
            let better = match &best {
                None => true,
                Some((best_key, _)) => key < *best_key,
            };
            if better {
                best = Some((key, worker.clone()));
            }
        }
        best.map(|(_, worker)| worker)
    }

    fn select_worker_by_id(&self, worker_id: u32) -> CoreResult<Arc<Worker>> {
        self.do_scaling_up();

        if worker_id == 0 {
            return Err(CoreError::Params("worker id must be positive"));
        }
        let closing = self.set.closing.load(Ordering::Acquire);
        let expect = self.set.current_expect_workers.load(Ordering::Acquire);
        if worker_id > expect {
            return Err(if closing {
                CoreError::Closed
            } else {
                CoreError::NoAvailableWorker(worker_id)
            });
        }

        let workers = self.set.workers.lock();
        // By position first, by id scan as fallback after renumbering.
        let mut found = workers
            .get(worker_id as usize - 1)
            .filter(|worker| worker.id() == worker_id)
            .cloned();
        if found.is_none() {
            found = workers
                .iter()
                .find(|worker| worker.id() == worker_id)
                .cloned();
        }
        drop(workers);

        match found {
            Some(worker) if !worker.is_exiting() => Ok(worker),
            _ => Err(if closing {
                CoreError::Closed
            } else {
                CoreError::NoAvailableWorker(worker_id)
            }),
        }
    }

    /// Lookup that also sees pending-to-destroy workers, for tick-callback
    /// removal.
    fn find_worker_any(&self, worker_id: u32) -> Option<Arc<Worker>> {
        let workers = self.set.workers.lock();
        workers
            .iter()
            .find(|worker| worker.id() == worker_id)
            .cloned()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Runs a shared `WorkerPool` as an app module: ticked from the main loop,
/// stopped cooperatively, torn down in cleanup.
pub struct WorkerPoolModule {
    pool: Arc<WorkerPool>,
}

impl WorkerPoolModule {
    pub fn new(context: Arc<Context>) -> WorkerPoolModule {
        WorkerPoolModule {
            pool: Arc::new(WorkerPool::new(context)),
        }
    }

    /// The pool itself; `spawn` and the callback registration methods are
    /// safe to call from any thread.
    pub fn pool(&self) -> Arc<WorkerPool> {
        self.pool.clone()
    }
}

impl crate::app::AppModule for WorkerPoolModule {
    fn name(&self) -> &str {
        "lattice: worker pool module"
    }

    fn tick(&mut self, core: &mut crate::app::AppCore) -> usize {
        self.pool.tick(core.last_tick_time());
        0
    }

    fn stop(&mut self, _core: &mut crate::app::AppCore) -> bool {
        self.pool.stop()
    }

    fn cleanup(&mut self, _core: &mut crate::app::AppCore) {
        self.pool.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_config::Parameters;
    use std::sync::atomic::AtomicUsize;

    fn pool_with(
        min: u32,
        max: u32,
        configure: impl FnOnce(&mut Parameters),
    ) -> WorkerPool {
        let mut parameters = Parameters::default();
        parameters.worker_pool.worker_number_min = min;
        parameters.worker_pool.worker_number_max = max;
        parameters.worker_pool.scaling_rules.scaling_up_stabilization_window =
            Duration::from_secs(1);
        parameters
            .worker_pool
            .scaling_rules
            .scaling_down_stabilization_window = Duration::from_secs(1);
        configure(&mut parameters);
        let context = Arc::new(Context::new_for_test(1).with_parameters(parameters));
        WorkerPool::new(context)
    }

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    #[test]
    fn spawn_runs_jobs_on_workers() {
        let pool = pool_with(2, 4, |_| {});
        let executed = Arc::new(AtomicUsize::new(0));

        for _ in 0..16 {
            let executed = executed.clone();
            let placed = pool
                .spawn(move |worker_context| {
                    assert!(worker_context.worker_id >= 1);
                    executed.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            assert!(placed.worker_id >= 1);
        }

        assert!(wait_until(Duration::from_secs(5), || {
            executed.load(Ordering::SeqCst) == 16
        }));
        assert_eq!(pool.get_current_worker_count(), 2);
    }

    #[test]
    fn context_spawns_preserve_submission_order() {
        let pool = pool_with(2, 4, |_| {});
        // Pin everything to worker 1.
        let target = WorkerContext { worker_id: 1 };
        let order = Arc::new(Mutex::new(Vec::new()));

        for index in 0..32u32 {
            let order = order.clone();
            pool.spawn_with_context(
                move |_| {
                    order.lock().push(index);
                },
                &target,
            )
            .unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || order.lock().len() == 32));
        assert_eq!(*order.lock(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn spawn_error_taxonomy() {
        let pool = pool_with(1, 1, |parameters| {
            parameters.worker_pool.queue_size = 1;
        });

        assert_eq!(
            pool.spawn_with_context(|_| {}, &WorkerContext { worker_id: 0 }),
            Err(CoreError::Params("worker id must be positive"))
        );
        assert_eq!(
            pool.spawn_with_context(|_| {}, &WorkerContext { worker_id: 9 }),
            Err(CoreError::NoAvailableWorker(9))
        );

        // Block worker 1, then fill its one queue slot.
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        {
            let gate = gate.clone();
            pool.spawn(move |_| {
                let (lock, condvar) = &*gate;
                let mut open = lock.lock();
                while !*open {
                    condvar.wait(&mut open);
                }
            })
            .unwrap();
        }
        // Wait for the worker to pick up the blocking job.
        let target = WorkerContext { worker_id: 1 };
        assert!(wait_until(Duration::from_secs(5), || {
            pool.spawn_with_context(|_| {}, &target).is_ok()
        }));
        assert_eq!(
            pool.spawn_with_context(|_| {}, &target),
            Err(CoreError::Busy)
        );

        // Release and stop; afterwards every spawn reports closed.
        {
            let (lock, condvar) = &*gate;
            *lock.lock() = true;
            condvar.notify_all();
        }
        assert!(wait_until(Duration::from_secs(5), || pool.stop()));
        assert_eq!(
            pool.spawn_with_context(|_| {}, &target),
            Err(CoreError::Closed)
        );
    }

    #[test]
    fn autoscaling_rises_on_queue_and_falls_when_idle() {
        let pool = pool_with(1, 4, |parameters| {
            parameters.worker_pool.scaling_rules.scaling_up_queue_size = 16;
        });
        let t0 = Instant::now();

        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let executed = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let gate = gate.clone();
            let executed = executed.clone();
            pool.spawn(move |_| {
                let (lock, condvar) = &*gate;
                let mut open = lock.lock();
                while !*open {
                    condvar.wait(&mut open);
                }
                drop(open);
                executed.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        // One stabilization window later the queue rule forces the maximum.
        pool.tick(t0 + Duration::from_millis(1100));
        assert_eq!(pool.get_configure_worker_expect_count(), 4);

        // Drain and idle out; within three windows the pool shrinks to the
        // minimum.
        {
            let (lock, condvar) = &*gate;
            *lock.lock() = true;
            condvar.notify_all();
        }
        assert!(wait_until(Duration::from_secs(5), || {
            executed.load(Ordering::SeqCst) == 64
        }));

        pool.tick(t0 + Duration::from_millis(2200));
        pool.tick(t0 + Duration::from_millis(3300));
        pool.tick(t0 + Duration::from_millis(4400));
        assert_eq!(pool.get_configure_worker_expect_count(), 1);
    }

    #[test]
    fn stop_moves_private_jobs_to_shared_and_drains() {
        let pool = pool_with(1, 1, |_| {});
        let executed = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new((Mutex::new(false), Condvar::new()));

        {
            let gate = gate.clone();
            pool.spawn(move |_| {
                let (lock, condvar) = &*gate;
                let mut open = lock.lock();
                while !*open {
                    condvar.wait(&mut open);
                }
            })
            .unwrap();
        }
        for _ in 0..8 {
            let executed = executed.clone();
            pool.spawn(move |_| {
                executed.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        // Not stoppable while the worker still holds queued jobs.
        assert!(!pool.stop());

        {
            let (lock, condvar) = &*gate;
            *lock.lock() = true;
            condvar.notify_all();
        }

        // The worker exits, its leftover jobs land on the shared queue, and
        // closing ticks pump them on the main thread.
        let done = wait_until(Duration::from_secs(5), || {
            pool.tick(Instant::now());
            pool.stop()
        });
        assert!(done);
        assert_eq!(executed.load(Ordering::SeqCst), 8);
        assert!(pool.set.shared_jobs.is_empty());
    }

    #[test]
    fn tick_callbacks_run_and_handles_detect_reuse() {
        let pool = pool_with(1, 2, |_| {});
        // Make sure worker 1 exists.
        pool.spawn(|_| {}).unwrap();

        let ticks = Arc::new(AtomicUsize::new(0));
        let handle = {
            let ticks = ticks.clone();
            pool.add_tick_callback(
                move |worker_context| {
                    assert_eq!(worker_context.worker_id, 1);
                    ticks.fetch_add(1, Ordering::SeqCst);
                },
                &WorkerContext { worker_id: 1 },
            )
            .unwrap()
        };

        assert!(wait_until(Duration::from_secs(5), || {
            ticks.load(Ordering::SeqCst) >= 3
        }));

        assert!(pool.remove_tick_callback(handle));
        assert!(!pool.remove_tick_callback(handle));

        let after_removal = ticks.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        // A few in-flight ticks may still land; the counter must settle.
        let settled = ticks.load(Ordering::SeqCst);
        assert!(settled <= after_removal + 1);
    }

    #[test]
    fn worker_pool_module_drives_pool_through_app_lifecycle() {
        let context = Arc::new(Context::new_for_test(1));
        let mut app = crate::app::App::new(context.clone());
        let module = WorkerPoolModule::new(context);
        let pool = module.pool();
        app.add_module(Box::new(module));
        app.init().unwrap();

        let executed = Arc::new(AtomicUsize::new(0));
        {
            let executed = executed.clone();
            pool.spawn(move |_| {
                executed.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        app.tick();
        assert!(wait_until(Duration::from_secs(5), || {
            executed.load(Ordering::SeqCst) == 1
        }));

        app.stop();
        assert!(wait_until(Duration::from_secs(5), || {
            app.tick();
            app.state() == crate::app::AppState::Stopped
        }));
    }

    #[test]
    fn reset_tick_interval_clamps_to_bounds() {
        let pool = pool_with(1, 2, |parameters| {
            parameters.worker_pool.tick_min_interval = Duration::from_millis(4);
            parameters.worker_pool.tick_max_interval = Duration::from_millis(64);
        });
        pool.spawn(|_| {}).unwrap();
        let target = WorkerContext { worker_id: 1 };

        assert!(pool.reset_tick_interval(&target, Duration::from_secs(10)));
        assert_eq!(
            pool.get_tick_interval(&target),
            Some(Duration::from_millis(64))
        );
        assert!(pool.reset_tick_interval(&target, Duration::from_micros(1)));
        assert_eq!(
            pool.get_tick_interval(&target),
            Some(Duration::from_millis(4))
        );
    }

    #[test]
    fn foreach_worker_classifies_scaling_modes() {
        let pool = pool_with(1, 4, |parameters| {
            parameters.worker_pool.scaling_rules.scaling_up_queue_size = 1;
        });
        let t0 = Instant::now();

        // Force a scale-up via queued jobs so workers 2..4 become dynamic.
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        for _ in 0..8 {
            let gate = gate.clone();
            pool.spawn(move |_| {
                let (lock, condvar) = &*gate;
                let mut open = lock.lock();
                while !*open {
                    condvar.wait(&mut open);
                }
            })
            .unwrap();
        }
        pool.tick(t0 + Duration::from_millis(1100));
        assert_eq!(pool.get_configure_worker_expect_count(), 4);
        // Materialize the new workers.
        pool.spawn(|_| {}).unwrap();

        let mut seen = Vec::new();
        pool.foreach_worker(|worker_context, meta| {
            seen.push((worker_context.worker_id, meta.scaling_mode));
            true
        });
        assert!(seen.contains(&(1, WorkerScalingMode::Stable)));
        assert!(seen
            .iter()
            .any(|(id, mode)| *id > 1 && *mode == WorkerScalingMode::Dynamic));

        let (lock, condvar) = &*gate;
        *lock.lock() = true;
        condvar.notify_all();
    }
}
