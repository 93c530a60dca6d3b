//! Top-level submission entry point.
//!
//! Holds one [`VmssManager`] per machine profile. The dispatcher task is the
//! sole owner of the manager map: it forwards each request to the matching
//! manager, creating the scale set first when no manager exists for the
//! request's profile.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use protocol::RunnerRegistry;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::cloud::{CloudClient, CloudError};
use crate::config::Limits;
use crate::dto::{JudgeRequest, JudgeResult, MachineProfile, Submission, causes};
use crate::vmss_manager::VmssManager;

/// Scale sets created by the evaluator are named after the machine type.
const VMSS_NAME_PREFIX: &str = "benchlab_judge_";

struct EvaluatorInner {
    cloud: Arc<dyn CloudClient>,
    registry: Arc<RunnerRegistry>,
    limits: Limits,
    queue_tx: mpsc::UnboundedSender<Arc<JudgeRequest>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct Evaluator {
    inner: Arc<EvaluatorInner>,
}

impl Evaluator {
    /// Build the evaluator, seeding one manager per scale set that already
    /// exists in the subscription, then start the dispatcher.
    pub async fn new(
        cloud: Arc<dyn CloudClient>,
        registry: Arc<RunnerRegistry>,
        limits: Limits,
    ) -> Result<Self, CloudError> {
        let mut managers = HashMap::new();
        for vmss in cloud.list_vmss().await? {
            let profile = vmss.profile();
            info!(vmss = %vmss.name(), machine_type = %profile.name(), "found existing scale set");
            let manager = VmssManager::new(
                profile.clone(),
                vmss,
                cloud.clone(),
                registry.clone(),
                limits.clone(),
            );
            managers.insert(profile, manager);
        }

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(EvaluatorInner {
            cloud,
            registry,
            limits,
            queue_tx,
            next_id: AtomicU64::new(1),
        });
        tokio::spawn(run(inner.clone(), managers, queue_rx));
        Ok(Self { inner })
    }

    /// Queue a judge request and block until its result is in.
    pub async fn submit(
        &self,
        submission: Submission,
        machine_profile: MachineProfile,
        cpus: u32,
        memory_mb: u32,
        evaluation_settings: Value,
        benchmark_instances: HashMap<String, String>,
    ) -> JudgeResult {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Arc::new(JudgeRequest::new(
            id,
            submission,
            machine_profile,
            cpus,
            memory_mb,
            evaluation_settings,
            benchmark_instances,
        ));
        info!(request = id, machine_type = %request.machine_profile().name(), "judge request queued");

        if self.inner.queue_tx.send(request.clone()).is_err() {
            error!(request = id, "evaluator dispatcher is gone");
            return JudgeResult::error(causes::JUDGE_INTERNAL);
        }
        request.rendezvous().wait().await
    }
}

// ─── Dispatcher loop ───────────────────────────────────────────────────────

async fn run(
    inner: Arc<EvaluatorInner>,
    mut managers: HashMap<MachineProfile, VmssManager>,
    mut queue_rx: mpsc::UnboundedReceiver<Arc<JudgeRequest>>,
) {
    info!("evaluator dispatcher started");
    while let Some(request) = queue_rx.recv().await {
        let profile = request.machine_profile().clone();
        if let Some(manager) = managers.get(&profile) {
            manager.submit(request);
            continue;
        }
        match create_manager(&inner, &profile).await {
            Ok(manager) => {
                managers.insert(profile, manager.clone());
                manager.submit(request);
            }
            Err(err) => {
                error!(
                    request = request.id(),
                    machine_type = %profile.name(),
                    error = %err,
                    "scale set creation failed"
                );
                request
                    .rendezvous()
                    .signal(JudgeResult::error(causes::PROVISIONING_FAILED));
            }
        }
    }
    info!("evaluator dispatcher stopped");
}

async fn create_manager(
    inner: &Arc<EvaluatorInner>,
    profile: &MachineProfile,
) -> Result<VmssManager, CloudError> {
    let name = format!("{VMSS_NAME_PREFIX}{}", profile.name());
    info!(vmss = %name, "creating scale set");
    inner.cloud.create_vmss(&name, profile).await?;
    let vmss = inner.cloud.get_vmss(&name).await?;
    Ok(VmssManager::new(
        profile.clone(),
        vmss,
        inner.cloud.clone(),
        inner.registry.clone(),
        inner.limits.clone(),
    ))
}
