//! Per-machine-profile manager: owns the workers of one scale set.
//!
//! The dispatcher loop pulls requests off the manager's queue and places
//! them live-first, then dormant, each tier in insertion order. When neither
//! tier admits a request the manager creates a dormant worker sized to it,
//! grows the scale set and discovers the new VM in the background.
//!
//! Discovery is the rendezvous between abstract and physical VMs: a new VM's
//! runner is awaited, its size measured, and the oldest dormant worker is
//! rebound to it without losing anything it queued.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use protocol::RunnerRegistry;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cloud::{CloudClient, CloudError, VmHandle, VmssHandle};
use crate::config::Limits;
use crate::dto::{JudgeRequest, JudgeResult, MachineProfile, causes};
use crate::vm_worker::{SubmitError, VmWorker, WorkerEvent, WorkerState};

/// Granularity of the runner-connect wait during discovery.
const CONNECT_POLL: Duration = Duration::from_secs(1);

#[derive(Debug)]
enum DiscoveryError {
    Cloud(CloudError),
    /// The VM's runner never connected within the budget
    RunnerConnectTimeout(String),
    /// VM size minus overheads left nothing to schedule on
    VmTooSmall {
        vm_name: String,
        raw_cpus: u32,
        raw_memory_mb: u32,
    },
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryError::Cloud(err) => write!(f, "{err}"),
            DiscoveryError::RunnerConnectTimeout(machine_name) => {
                write!(f, "runner {machine_name} never connected")
            }
            DiscoveryError::VmTooSmall {
                vm_name,
                raw_cpus,
                raw_memory_mb,
            } => write!(
                f,
                "vm {vm_name} too small after overheads ({raw_cpus} cpus, {raw_memory_mb} MB)"
            ),
        }
    }
}

impl From<CloudError> for DiscoveryError {
    fn from(err: CloudError) -> Self {
        DiscoveryError::Cloud(err)
    }
}

struct WorkerEntry {
    vm_name: String,
    worker: VmWorker,
}

struct ManagerInner {
    name: String,
    profile: MachineProfile,
    cloud: Arc<dyn CloudClient>,
    registry: Arc<RunnerRegistry>,
    limits: Limits,
    /// Bound workers in insertion order; placement iterates front to back
    workers: Mutex<Vec<WorkerEntry>>,
    /// Dormant workers, oldest first
    dormant: Mutex<VecDeque<VmWorker>>,
    /// Serializes capacity changes and discovery passes
    discovery: tokio::sync::Mutex<()>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
}

/// Handle to one scale set's dispatcher.
#[derive(Clone)]
pub struct VmssManager {
    inner: Arc<ManagerInner>,
    queue_tx: mpsc::UnboundedSender<Arc<JudgeRequest>>,
}

impl VmssManager {
    pub fn new(
        profile: MachineProfile,
        vmss: VmssHandle,
        cloud: Arc<dyn CloudClient>,
        registry: Arc<RunnerRegistry>,
        limits: Limits,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ManagerInner {
            name: vmss.name().to_string(),
            profile,
            cloud,
            registry,
            limits,
            workers: Mutex::new(Vec::new()),
            dormant: Mutex::new(VecDeque::new()),
            discovery: tokio::sync::Mutex::new(()),
            events_tx,
        });

        // A seeded scale set may already own VMs; pick them up right away so
        // the first requests don't have to provision.
        if vmss.capacity() > 0 {
            let discover = inner.clone();
            tokio::spawn(async move {
                refresh_workers(&discover).await;
            });
        }

        tokio::spawn(run(inner.clone(), queue_rx, events_rx));
        Self { inner, queue_tx }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn profile(&self) -> &MachineProfile {
        &self.inner.profile
    }

    /// Hand a request to the dispatcher. Fails the request's rendezvous if
    /// the dispatcher is gone, so the caller can fire and forget.
    pub fn submit(&self, request: Arc<JudgeRequest>) {
        if self.queue_tx.send(request.clone()).is_err() {
            error!(vmss = %self.inner.name, request = request.id(), "dispatcher is gone");
            request
                .rendezvous()
                .signal(JudgeResult::error(causes::JUDGE_INTERNAL));
        }
    }

    /// Run one discovery pass now. Also used by tests to avoid waiting on
    /// background scheduling.
    pub async fn refresh(&self) {
        refresh_workers(&self.inner).await;
    }

    pub(crate) fn live_vm_names(&self) -> Vec<String> {
        self.inner
            .workers
            .lock()
            .unwrap()
            .iter()
            .map(|entry| entry.vm_name.clone())
            .collect()
    }

    pub(crate) fn dormant_count(&self) -> usize {
        self.inner.dormant.lock().unwrap().len()
    }

    pub(crate) fn worker(&self, vm_name: &str) -> Option<VmWorker> {
        self.inner
            .workers
            .lock()
            .unwrap()
            .iter()
            .find(|entry| entry.vm_name == vm_name)
            .map(|entry| entry.worker.clone())
    }
}

// ─── Dispatcher loop ───────────────────────────────────────────────────────

async fn run(
    inner: Arc<ManagerInner>,
    mut queue_rx: mpsc::UnboundedReceiver<Arc<JudgeRequest>>,
    mut events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
) {
    info!(vmss = %inner.name, "dispatcher started");
    loop {
        tokio::select! {
            request = queue_rx.recv() => match request {
                Some(request) => dispatch(&inner, request).await,
                None => break,
            },
            event = events_rx.recv() => {
                if let Some(event) = event {
                    handle_event(&inner, event);
                }
            }
        }
    }
    info!(vmss = %inner.name, "dispatcher stopped");
}

async fn dispatch(inner: &Arc<ManagerInner>, request: Arc<JudgeRequest>) {
    debug!(vmss = %inner.name, request = request.id(), "placing request");

    // Pass 1: live workers, insertion order.
    let live: Vec<VmWorker> = {
        let workers = inner.workers.lock().unwrap();
        workers.iter().map(|entry| entry.worker.clone()).collect()
    };
    for worker in live {
        if worker.has_capacity(request.cpus(), request.memory_mb()) || worker.has_idle_slot() {
            match worker.submit(request.clone()) {
                Ok(()) => return,
                // Lost the snapshot race; try the next worker.
                Err(SubmitError::IdleQueueFull | SubmitError::WorkerStopped) => continue,
            }
        }
    }

    // Pass 2: dormant workers, oldest first. Capacity is not consulted: the
    // worker was sized for its progenitor and later requests ride the idle
    // queue until the VM materializes.
    let dormant: Vec<VmWorker> = {
        let dormant = inner.dormant.lock().unwrap();
        dormant.iter().cloned().collect()
    };
    for worker in dormant {
        if worker.has_idle_slot() && worker.submit(request.clone()).is_ok() {
            return;
        }
    }

    // Pass 3: provision a new dormant worker sized to this request.
    provision(inner, request);
}

fn provision(inner: &Arc<ManagerInner>, request: Arc<JudgeRequest>) {
    info!(
        vmss = %inner.name,
        request = request.id(),
        cpus = request.cpus(),
        memory_mb = request.memory_mb(),
        "no capacity anywhere, provisioning a new vm"
    );
    let worker = VmWorker::dormant(
        request.cpus(),
        request.memory_mb(),
        inner.registry.clone(),
        inner.events_tx.clone(),
        inner.limits.start_timeout,
    );
    if worker.submit(request.clone()).is_err() {
        // A fresh dormant worker always has idle slots; not reaching it is an
        // internal fault, but the request must still resolve.
        error!(vmss = %inner.name, request = request.id(), "fresh dormant worker rejected request");
        request
            .rendezvous()
            .signal(JudgeResult::error(causes::JUDGE_INTERNAL));
        return;
    }
    inner.dormant.lock().unwrap().push_back(worker.clone());

    tokio::spawn(provision_watchdog(inner.clone(), worker.clone()));
    tokio::spawn(grow_capacity(inner.clone(), worker));
}

// ─── Capacity & discovery ──────────────────────────────────────────────────

/// Grow the scale set by one instance on behalf of `worker`, the dormant
/// worker whose request triggered the growth. A rejection is recorded on
/// that worker alone, so its watchdog reports the right cause no matter how
/// later grow attempts for the same profile fare.
async fn grow_capacity(inner: Arc<ManagerInner>, worker: VmWorker) {
    // Read-modify-write on the instance count; concurrent growers must not
    // observe the same capacity and lose an increment.
    let grown = {
        let _guard = inner.discovery.lock().await;
        match inner.cloud.get_vmss(&inner.name).await {
            Ok(vmss) => {
                inner
                    .cloud
                    .set_capacity(vmss.capacity() + 1, &inner.name)
                    .await
            }
            Err(err) => Err(err),
        }
    };

    match grown {
        Ok(()) => refresh_workers(&inner).await,
        Err(err) => {
            // Leave the dormant worker in place; a later pass may still bind
            // it, otherwise the watchdog fails its queue.
            error!(vmss = %inner.name, worker = %worker.id(), error = %err, "capacity increase failed");
            worker.note_provision_rejected();
        }
    }
}

/// List the scale set's VMs, install unknown ones, reap unhealthy ones.
async fn refresh_workers(inner: &Arc<ManagerInner>) {
    let _guard = inner.discovery.lock().await;

    let vms = match inner.cloud.list_vms(&inner.name).await {
        Ok(vms) => vms,
        Err(err) => {
            error!(vmss = %inner.name, error = %err, "listing vms failed");
            return;
        }
    };

    for vm in &vms {
        let known = inner
            .workers
            .lock()
            .unwrap()
            .iter()
            .any(|entry| entry.vm_name == vm.name());
        if known {
            continue;
        }
        if let Err(err) = install_vm(inner, vm).await {
            warn!(vmss = %inner.name, vm = %vm.name(), error = %err, "not installing vm");
        }
    }

    // Health pass over everything currently installed.
    let entries: Vec<(String, VmWorker)> = {
        let workers = inner.workers.lock().unwrap();
        workers
            .iter()
            .map(|entry| (entry.vm_name.clone(), entry.worker.clone()))
            .collect()
    };
    let checks = entries.iter().map(|(_, worker)| worker.health_check());
    let healthy = futures::future::join_all(checks).await;
    for ((vm_name, _), healthy) in entries.into_iter().zip(healthy) {
        if !healthy {
            warn!(vmss = %inner.name, vm = %vm_name, "vm failed health check, deleting");
            remove_worker(inner, &vm_name);
        }
    }
}

async fn install_vm(inner: &Arc<ManagerInner>, vm: &VmHandle) -> Result<(), DiscoveryError> {
    let expanded = inner.cloud.get_vm(vm.name()).await?;
    let machine_name = expanded.computer_name().to_string();

    // The runner dials in on its own schedule; wait for it, bounded.
    let deadline = tokio::time::Instant::now() + inner.limits.provision_timeout;
    while !inner.registry.is_connected(&machine_name) {
        if tokio::time::Instant::now() >= deadline {
            return Err(DiscoveryError::RunnerConnectTimeout(machine_name));
        }
        debug!(vm = %vm.name(), machine_name = %machine_name, "waiting for runner to connect");
        tokio::time::sleep(CONNECT_POLL).await;
    }

    let (raw_cpus, raw_memory_mb) = inner.cloud.get_vm_size(vm.name()).await?;
    let too_small = DiscoveryError::VmTooSmall {
        vm_name: vm.name().to_string(),
        raw_cpus,
        raw_memory_mb,
    };
    let Some(cpus) = raw_cpus
        .checked_sub(inner.limits.min_cpus)
        .filter(|cpus| *cpus > 0)
    else {
        return Err(too_small);
    };
    let Some(memory_mb) = raw_memory_mb
        .checked_sub(inner.limits.min_memory_mb)
        .filter(|memory| *memory > 0)
    else {
        return Err(too_small);
    };

    // Oldest dormant worker gets the VM; its queue survives the rebind.
    let worker = loop {
        match inner.dormant.lock().unwrap().pop_front() {
            Some(dormant) => {
                if dormant.bind(vm.name(), &machine_name, cpus, memory_mb) {
                    info!(
                        vmss = %inner.name,
                        vm = %vm.name(),
                        machine_name = %machine_name,
                        cpus,
                        memory_mb,
                        "bound vm to dormant worker"
                    );
                    break dormant;
                }
                // Died under the watchdog while queued; try the next one.
                continue;
            }
            None => {
                info!(
                    vmss = %inner.name,
                    vm = %vm.name(),
                    machine_name = %machine_name,
                    cpus,
                    memory_mb,
                    "new live worker"
                );
                break VmWorker::live(
                    vm.name(),
                    &machine_name,
                    cpus,
                    memory_mb,
                    inner.registry.clone(),
                    inner.events_tx.clone(),
                    inner.limits.start_timeout,
                );
            }
        }
    };

    inner.workers.lock().unwrap().push(WorkerEntry {
        vm_name: vm.name().to_string(),
        worker,
    });
    Ok(())
}

async fn provision_watchdog(inner: Arc<ManagerInner>, worker: VmWorker) {
    tokio::time::sleep(inner.limits.provision_timeout).await;
    if worker.state() != WorkerState::Dormant {
        return;
    }
    inner
        .dormant
        .lock()
        .unwrap()
        .retain(|dormant| dormant.id() != worker.id());

    let cause = if worker.provision_rejected() {
        causes::PROVISIONING_FAILED
    } else {
        causes::PROVISIONING_TIMEOUT
    };
    error!(vmss = %inner.name, worker = %worker.id(), cause, "provisioning never completed");
    worker.fail_provisioning(cause);
}

// ─── Eviction ──────────────────────────────────────────────────────────────

fn handle_event(inner: &Arc<ManagerInner>, event: WorkerEvent) {
    match event {
        WorkerEvent::Idle { vm_name, epoch } => {
            if inner.limits.no_down_sizing {
                return;
            }
            let Some(worker) = lookup(inner, &vm_name) else {
                return;
            };
            let grace = inner.limits.max_vm_idle;
            let inner = inner.clone();
            tokio::spawn(async move {
                if !grace.is_zero() {
                    tokio::time::sleep(grace).await;
                }
                // Busy again, or already replaced: let it be.
                if worker.busy_epoch() != epoch || worker.is_busy() {
                    return;
                }
                info!(vmss = %inner.name, vm = %vm_name, "deleting idle vm");
                remove_worker(&inner, &vm_name);
            });
        }
    }
}

fn lookup(inner: &ManagerInner, vm_name: &str) -> Option<VmWorker> {
    inner
        .workers
        .lock()
        .unwrap()
        .iter()
        .find(|entry| entry.vm_name == vm_name)
        .map(|entry| entry.worker.clone())
}

/// Drop a worker from the table and ask the cloud to delete its VM.
fn remove_worker(inner: &Arc<ManagerInner>, vm_name: &str) {
    let removed = {
        let mut workers = inner.workers.lock().unwrap();
        match workers.iter().position(|entry| entry.vm_name == vm_name) {
            Some(index) => Some(workers.remove(index)),
            None => None,
        }
    };
    let Some(entry) = removed else {
        return;
    };
    entry.worker.mark_dead();

    let cloud = inner.cloud.clone();
    let vmss_name = inner.name.clone();
    let vm_name = vm_name.to_string();
    tokio::spawn(async move {
        if let Err(err) = cloud.delete_vm(&vm_name, &vmss_name, false).await {
            error!(vmss = %vmss_name, vm = %vm_name, error = %err, "vm deletion failed");
        }
    });
}
