//! Per-VM worker: one bounded idle queue, one CPU/memory pool, one loop.
//!
//! A worker is either constructed *live* (its VM exists and its runner is
//! connected) or *dormant* (a placeholder created before the cloud has
//! acknowledged the VM). A dormant worker queues requests behind a gate and
//! starts serving them only once a discovered VM is bound to it.
//!
//! Admission is a single critical section: capacity check, pool debit and
//! idle-counter decrement happen under one lock, so there is no window
//! between "has capacity" and "reserved". Executions run concurrently on the
//! same worker, bounded only by the pool.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use commands::{RunnerCommand, RunnerReply, StartArgs};
use protocol::RunnerRegistry;
use serde_json::Value;
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::dto::{JudgeRequest, JudgeResult, causes};

/// Bound on requests accepted but not yet admitted to execution.
pub const MAX_IDLE: u32 = 3;

/// Granularity of the capacity wait fallback poll.
const CAPACITY_POLL: Duration = Duration::from_secs(1);

/// Health probes answer fast or not at all.
const CHECK_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for a physical VM to be bound
    Dormant,
    /// Bound to a VM with a connected runner
    Live,
    /// Reaped; queued requests are failed, nothing new is accepted
    Dead,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SubmitError {
    /// `idle_count` already at the bound
    IdleQueueFull,
    /// The worker is dead or its loop is gone
    WorkerStopped,
}

/// Notifications a worker sends its owning manager.
#[derive(Debug)]
pub enum WorkerEvent {
    /// The worker finished its last request and holds an empty queue.
    /// `epoch` lets the manager detect that it became busy again before an
    /// idle timer fired.
    Idle { vm_name: String, epoch: u64 },
}

#[derive(Debug, Clone)]
struct VmBinding {
    vm_name: String,
    machine_name: String,
}

#[derive(Debug)]
struct ResourcePool {
    total_cpus: u32,
    total_memory_mb: u32,
    free_cpus: u32,
    free_memory_mb: u32,
    idle_count: u32,
}

struct WorkerInner {
    id: String,
    pool: Mutex<ResourcePool>,
    binding: Mutex<Option<VmBinding>>,
    death_cause: Mutex<Option<String>>,
    /// Set when the cloud rejected the capacity change that was supposed to
    /// produce this (dormant) worker's VM
    provision_rejected: AtomicBool,
    state_tx: watch::Sender<WorkerState>,
    queue_tx: mpsc::UnboundedSender<Arc<JudgeRequest>>,
    executing: AtomicUsize,
    busy_epoch: AtomicU64,
    released: Notify,
    registry: Arc<RunnerRegistry>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    start_timeout: Option<Duration>,
}

/// Cloneable handle to one worker. The serving loop runs as its own task and
/// stops when the last handle is dropped or the worker dies.
#[derive(Clone)]
pub struct VmWorker {
    inner: Arc<WorkerInner>,
}

impl VmWorker {
    /// Worker for an already-discovered VM with a connected runner.
    pub fn live(
        vm_name: &str,
        machine_name: &str,
        cpus: u32,
        memory_mb: u32,
        registry: Arc<RunnerRegistry>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        start_timeout: Option<Duration>,
    ) -> Self {
        Self::start(
            WorkerState::Live,
            Some(VmBinding {
                vm_name: vm_name.to_string(),
                machine_name: machine_name.to_string(),
            }),
            cpus,
            memory_mb,
            registry,
            events,
            start_timeout,
        )
    }

    /// Placeholder worker sized to the request that triggered provisioning.
    pub fn dormant(
        seed_cpus: u32,
        seed_memory_mb: u32,
        registry: Arc<RunnerRegistry>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        start_timeout: Option<Duration>,
    ) -> Self {
        Self::start(
            WorkerState::Dormant,
            None,
            seed_cpus,
            seed_memory_mb,
            registry,
            events,
            start_timeout,
        )
    }

    fn start(
        state: WorkerState,
        binding: Option<VmBinding>,
        cpus: u32,
        memory_mb: u32,
        registry: Arc<RunnerRegistry>,
        events: mpsc::UnboundedSender<WorkerEvent>,
        start_timeout: Option<Duration>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(state);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(WorkerInner {
            id: uuid::Uuid::now_v7().to_string(),
            pool: Mutex::new(ResourcePool {
                total_cpus: cpus,
                total_memory_mb: memory_mb,
                free_cpus: cpus,
                free_memory_mb: memory_mb,
                idle_count: 0,
            }),
            binding: Mutex::new(binding),
            death_cause: Mutex::new(None),
            provision_rejected: AtomicBool::new(false),
            state_tx,
            queue_tx,
            executing: AtomicUsize::new(0),
            busy_epoch: AtomicU64::new(0),
            released: Notify::new(),
            registry,
            events,
            start_timeout,
        });
        tokio::spawn(run(inner.clone(), queue_rx, state_rx));
        Self { inner }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn state(&self) -> WorkerState {
        *self.inner.state_tx.borrow()
    }

    pub fn vm_name(&self) -> Option<String> {
        self.inner
            .binding
            .lock()
            .unwrap()
            .as_ref()
            .map(|b| b.vm_name.clone())
    }

    pub fn machine_name(&self) -> Option<String> {
        self.inner
            .binding
            .lock()
            .unwrap()
            .as_ref()
            .map(|b| b.machine_name.clone())
    }

    /// Snapshot: can one more request enter the idle queue?
    pub fn has_idle_slot(&self) -> bool {
        self.inner.pool.lock().unwrap().idle_count < MAX_IDLE
    }

    /// Snapshot: would `cpus`/`memory_mb` fit the free pools right now?
    pub fn has_capacity(&self, cpus: u32, memory_mb: u32) -> bool {
        let pool = self.inner.pool.lock().unwrap();
        pool.free_cpus >= cpus && pool.free_memory_mb >= memory_mb
    }

    pub fn is_busy(&self) -> bool {
        self.inner.executing.load(Ordering::SeqCst) > 0
            || self.inner.pool.lock().unwrap().idle_count > 0
    }

    pub fn busy_epoch(&self) -> u64 {
        self.inner.busy_epoch.load(Ordering::SeqCst)
    }

    pub fn free(&self) -> (u32, u32) {
        let pool = self.inner.pool.lock().unwrap();
        (pool.free_cpus, pool.free_memory_mb)
    }

    pub fn totals(&self) -> (u32, u32) {
        let pool = self.inner.pool.lock().unwrap();
        (pool.total_cpus, pool.total_memory_mb)
    }

    pub(crate) fn idle_count(&self) -> u32 {
        self.inner.pool.lock().unwrap().idle_count
    }

    /// Enqueue a request. The idle bound is re-checked under the lock.
    pub fn submit(&self, request: Arc<JudgeRequest>) -> Result<(), SubmitError> {
        {
            let mut pool = self.inner.pool.lock().unwrap();
            if self.state() == WorkerState::Dead {
                return Err(SubmitError::WorkerStopped);
            }
            if pool.idle_count >= MAX_IDLE {
                return Err(SubmitError::IdleQueueFull);
            }
            pool.idle_count += 1;
        }
        self.inner.busy_epoch.fetch_add(1, Ordering::SeqCst);

        if self.inner.queue_tx.send(request).is_err() {
            self.inner.pool.lock().unwrap().idle_count -= 1;
            return Err(SubmitError::WorkerStopped);
        }
        Ok(())
    }

    /// Bind a discovered VM to this dormant worker: measured pools replace
    /// the seed, the runner name is installed, the gate opens. Returns false
    /// if the worker already died (lost the race with the provisioning
    /// watchdog); the caller must then treat the VM as unowned.
    pub fn bind(&self, vm_name: &str, machine_name: &str, cpus: u32, memory_mb: u32) -> bool {
        {
            let mut pool = self.inner.pool.lock().unwrap();
            pool.total_cpus = cpus;
            pool.total_memory_mb = memory_mb;
            pool.free_cpus = cpus;
            pool.free_memory_mb = memory_mb;
        }
        *self.inner.binding.lock().unwrap() = Some(VmBinding {
            vm_name: vm_name.to_string(),
            machine_name: machine_name.to_string(),
        });
        self.inner.state_tx.send_if_modified(|state| {
            if *state == WorkerState::Dormant {
                *state = WorkerState::Live;
                true
            } else {
                false
            }
        })
    }

    /// Record that the capacity change backing this dormant worker was
    /// rejected by the cloud. Read by the provisioning watchdog to pick the
    /// failure cause; later grow attempts for other workers must not touch
    /// this one's outcome.
    pub(crate) fn note_provision_rejected(&self) {
        self.inner.provision_rejected.store(true, Ordering::SeqCst);
    }

    pub(crate) fn provision_rejected(&self) -> bool {
        self.inner.provision_rejected.load(Ordering::SeqCst)
    }

    /// Kill a dormant worker whose VM never materialized. Queued requests
    /// are failed with `cause`. No-op if the worker went live first.
    pub fn fail_provisioning(&self, cause: &str) -> bool {
        *self.inner.death_cause.lock().unwrap() = Some(cause.to_string());
        self.inner.state_tx.send_if_modified(|state| {
            if *state == WorkerState::Dormant {
                *state = WorkerState::Dead;
                true
            } else {
                false
            }
        })
    }

    /// Mark a live worker dead (failed health check or idle eviction).
    pub fn mark_dead(&self) {
        self.inner.state_tx.send_if_modified(|state| {
            if *state != WorkerState::Dead {
                *state = WorkerState::Dead;
                true
            } else {
                false
            }
        });
    }

    /// CHECK probe with a 3 second deadline. Only meaningful when live.
    pub async fn health_check(&self) -> bool {
        let Some(machine_name) = self.machine_name() else {
            return false;
        };
        let Some(channel) = self.inner.registry.get(&machine_name) else {
            return false;
        };
        matches!(
            channel
                .send_command(RunnerCommand::Check, Some(CHECK_TIMEOUT))
                .await,
            Ok(RunnerReply::Ok(_))
        )
    }
}

// ─── Serving loop ──────────────────────────────────────────────────────────

async fn run(
    inner: Arc<WorkerInner>,
    mut queue_rx: mpsc::UnboundedReceiver<Arc<JudgeRequest>>,
    mut state_rx: watch::Receiver<WorkerState>,
) {
    // Dormancy gate: nothing runs until a VM is bound.
    if *state_rx.borrow() == WorkerState::Dormant {
        if state_rx
            .wait_for(|state| *state != WorkerState::Dormant)
            .await
            .is_err()
        {
            return;
        }
    }
    if *state_rx.borrow() == WorkerState::Dead {
        let cause = inner
            .death_cause
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| causes::PROVISIONING_TIMEOUT.to_string());
        drain_queue(&inner, &mut queue_rx, &cause);
        return;
    }

    info!(worker = %inner.id, vm = ?vm_name(&inner), "worker serving");

    loop {
        let request = tokio::select! {
            request = queue_rx.recv() => match request {
                Some(request) => request,
                // Every handle dropped: the manager let go of this worker.
                None => break,
            },
            _ = state_rx.wait_for(|state| *state == WorkerState::Dead) => {
                drain_queue(&inner, &mut queue_rx, causes::RUNNER_UNREACHABLE);
                break;
            }
        };

        // A request bigger than the whole VM can never be admitted; failing
        // it here keeps its rendezvous from hanging forever.
        let oversized = {
            let pool = inner.pool.lock().unwrap();
            request.cpus() > pool.total_cpus || request.memory_mb() > pool.total_memory_mb
        };
        if oversized {
            error!(
                worker = %inner.id,
                request = request.id(),
                cpus = request.cpus(),
                memory_mb = request.memory_mb(),
                "request exceeds vm capacity"
            );
            inner.pool.lock().unwrap().idle_count -= 1;
            request
                .rendezvous()
                .signal(JudgeResult::error(causes::JUDGE_INTERNAL));
            notify_if_idle(&inner);
            continue;
        }

        // Wait until the pools fit the request, then admit atomically.
        let admitted = loop {
            if try_admit(&inner, request.cpus(), request.memory_mb()) {
                break true;
            }
            if *state_rx.borrow() == WorkerState::Dead {
                break false;
            }
            let released = inner.released.notified();
            tokio::select! {
                _ = released => {}
                _ = tokio::time::sleep(CAPACITY_POLL) => {}
                _ = state_rx.changed() => {}
            }
        };
        if !admitted {
            inner.pool.lock().unwrap().idle_count -= 1;
            request
                .rendezvous()
                .signal(JudgeResult::error(causes::RUNNER_UNREACHABLE));
            continue;
        }

        inner.executing.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(execute(inner.clone(), request));
    }
}

fn vm_name(inner: &WorkerInner) -> Option<String> {
    inner
        .binding
        .lock()
        .unwrap()
        .as_ref()
        .map(|b| b.vm_name.clone())
}

fn try_admit(inner: &WorkerInner, cpus: u32, memory_mb: u32) -> bool {
    let mut pool = inner.pool.lock().unwrap();
    if pool.free_cpus >= cpus && pool.free_memory_mb >= memory_mb {
        pool.free_cpus -= cpus;
        pool.free_memory_mb -= memory_mb;
        pool.idle_count -= 1;
        true
    } else {
        false
    }
}

fn drain_queue(
    inner: &Arc<WorkerInner>,
    queue_rx: &mut mpsc::UnboundedReceiver<Arc<JudgeRequest>>,
    cause: &str,
) {
    queue_rx.close();
    while let Ok(request) = queue_rx.try_recv() {
        warn!(worker = %inner.id, request = request.id(), cause, "failing queued request");
        inner.pool.lock().unwrap().idle_count -= 1;
        request.rendezvous().signal(JudgeResult::error(cause));
    }
}

// ─── Execution ─────────────────────────────────────────────────────────────

async fn execute(inner: Arc<WorkerInner>, request: Arc<JudgeRequest>) {
    debug!(worker = %inner.id, request = request.id(), "executing");
    let result = run_on_runner(&inner, &request).await;

    // Release before signaling: a submit caller that wakes up must observe
    // the pools restored to their pre-admission values.
    {
        let mut pool = inner.pool.lock().unwrap();
        pool.free_cpus += request.cpus();
        pool.free_memory_mb += request.memory_mb();
    }
    inner.executing.fetch_sub(1, Ordering::SeqCst);
    inner.released.notify_one();

    if !request.rendezvous().signal(result) {
        warn!(request = request.id(), "result was already signaled");
    }
    notify_if_idle(&inner);
}

async fn run_on_runner(inner: &WorkerInner, request: &JudgeRequest) -> JudgeResult {
    let Some(machine_name) = inner
        .binding
        .lock()
        .unwrap()
        .as_ref()
        .map(|b| b.machine_name.clone())
    else {
        error!(worker = %inner.id, "executing on a worker with no bound vm");
        return JudgeResult::error(causes::JUDGE_INTERNAL);
    };

    let Some(channel) = inner.registry.get(&machine_name) else {
        warn!(machine_name = %machine_name, "runner not connected");
        return JudgeResult::error(causes::RUNNER_UNREACHABLE);
    };

    let command = RunnerCommand::Start(StartArgs {
        evaluation_settings: request.evaluation_settings().clone(),
        benchmark_instances: request.benchmark_instances().clone(),
        submission_url: request.submission().source_url().to_string(),
        validator_url: request.submission().validator_url().to_string(),
    });

    match channel.send_command(command, inner.start_timeout).await {
        Ok(RunnerReply::Ok(ok)) => JudgeResult::success(ok.results.unwrap_or(Value::Null)),
        Ok(RunnerReply::Error { cause }) => JudgeResult::error(cause),
        Err(err) => {
            warn!(machine_name = %machine_name, error = %err, "runner exchange failed");
            JudgeResult::error(causes::RUNNER_UNREACHABLE)
        }
    }
}

fn notify_if_idle(inner: &WorkerInner) {
    let idle = inner.pool.lock().unwrap().idle_count == 0
        && inner.executing.load(Ordering::SeqCst) == 0;
    if !idle {
        return;
    }
    let Some(binding) = inner.binding.lock().unwrap().clone() else {
        return;
    };
    let _ = inner.events.send(WorkerEvent::Idle {
        vm_name: binding.vm_name,
        epoch: inner.busy_epoch.load(Ordering::SeqCst),
    });
}
