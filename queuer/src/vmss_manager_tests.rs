#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use commands::{RunnerCommand, RunnerReply};
    use protocol::{RunnerChannel, RunnerRegistry};
    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::cloud::mock::{CloudCallTracker, MockCloud, MockCloudConfig};
    use crate::cloud::CloudClient;
    use crate::config::Limits;
    use crate::dto::{
        JudgeRequest, JudgeResult, MachineProfile, Submission, SubmissionKind, causes,
    };
    use crate::vmss_manager::VmssManager;

    const VMSS: &str = "benchlab_judge_Standard_B1s";

    // ─── Helpers ───────────────────────────────────────────────────────

    fn profile() -> MachineProfile {
        MachineProfile::from_name("Standard_B1s").unwrap()
    }

    fn request(id: u64, cpus: u32, memory_mb: u32) -> Arc<JudgeRequest> {
        Arc::new(JudgeRequest::new(
            id,
            Submission::new(
                SubmissionKind::Code,
                "https://blob/submission.zip",
                "https://blob/validator.zip",
            ),
            profile(),
            cpus,
            memory_mb,
            json!({}),
            HashMap::new(),
        ))
    }

    fn connect_runner<F>(registry: &Arc<RunnerRegistry>, machine_name: &str, mut script: F)
    where
        F: FnMut(RunnerCommand) -> RunnerReply + Send + 'static,
    {
        let (channel, mut exchanges) = RunnerChannel::new(32);
        registry.register(machine_name, channel).unwrap();
        tokio::spawn(async move {
            while let Some(exchange) = exchanges.recv().await {
                let (command, reply) = exchange.into_parts();
                let _ = reply.send(Ok(script(command)));
            }
        });
    }

    /// Runner that holds START replies behind a test-controlled gate but
    /// answers CHECK immediately.
    fn connect_gated_runner(
        registry: &Arc<RunnerRegistry>,
        machine_name: &str,
    ) -> mpsc::UnboundedSender<RunnerReply> {
        let (channel, mut exchanges) = RunnerChannel::new(32);
        registry.register(machine_name, channel).unwrap();
        let (gate_tx, mut gate_rx) = mpsc::unbounded_channel::<RunnerReply>();
        tokio::spawn(async move {
            while let Some(exchange) = exchanges.recv().await {
                let (command, reply) = exchange.into_parts();
                match command {
                    RunnerCommand::Start(_) => {
                        let scripted = gate_rx
                            .recv()
                            .await
                            .unwrap_or_else(|| RunnerReply::error("gate closed"));
                        let _ = reply.send(Ok(scripted));
                    }
                    _ => {
                        let _ = reply.send(Ok(RunnerReply::ok()));
                    }
                }
            }
        });
        gate_tx
    }

    struct Rig {
        registry: Arc<RunnerRegistry>,
        tracker: CloudCallTracker,
        manager: VmssManager,
    }

    async fn rig(limits: Limits, cloud_config: MockCloudConfig) -> Rig {
        let (cloud, tracker) = MockCloud::with_config(cloud_config);
        cloud.seed_vmss(VMSS, &profile(), 0);
        let cloud: Arc<dyn CloudClient> = Arc::new(cloud);
        let registry = Arc::new(RunnerRegistry::new());
        let vmss = cloud.get_vmss(VMSS).await.unwrap();
        let manager = VmssManager::new(
            profile(),
            vmss,
            cloud.clone(),
            registry.clone(),
            limits,
        );
        Rig {
            registry,
            tracker,
            manager,
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
        for _ in 0..1000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    // ─── Provisioning & discovery ──────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn provisioning_binds_dormant_worker_to_new_vm() {
        let rig = rig(
            Limits {
                no_down_sizing: true,
                ..Limits::default()
            },
            MockCloudConfig::with_vm_size(4, 2048),
        )
        .await;
        // The first scale-out instance will identify as this machine name.
        connect_runner(
            &rig.registry,
            &MockCloud::computer_name(VMSS, 0),
            |command| match command {
                RunnerCommand::Start(_) => RunnerReply::results(json!({"verdict": "ok"})),
                _ => RunnerReply::ok(),
            },
        );

        let req = request(1, 2, 1024);
        rig.manager.submit(req.clone());

        let result = req.rendezvous().wait().await;
        assert_eq!(result, JudgeResult::success(json!({"verdict": "ok"})));

        // One capacity bump, dormant worker consumed by the rebind.
        assert_eq!(rig.tracker.capacity_set_count(), 1);
        assert_eq!(rig.manager.dormant_count(), 0);
        let names = rig.manager.live_vm_names();
        assert_eq!(names, vec![format!("{VMSS}_0")]);

        // Usable size is the raw size minus the configured overheads.
        let worker = rig.manager.worker(&names[0]).unwrap();
        assert_eq!(worker.totals(), (3, 1536));
        assert_eq!(worker.free(), (3, 1536));
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_beyond_idle_bound_spills_to_dormant_tier() {
        // Raw (2, 768) → usable (1, 256): one request executes at a time.
        let rig = rig(
            Limits {
                no_down_sizing: true,
                ..Limits::default()
            },
            MockCloudConfig::with_vm_size(2, 768),
        )
        .await;
        let gate = connect_gated_runner(&rig.registry, &MockCloud::computer_name(VMSS, 0));

        let first = request(1, 1, 256);
        rig.manager.submit(first.clone());
        wait_until(|| rig.manager.live_vm_names().len() == 1, "vm discovery").await;
        let vm_name = rig.manager.live_vm_names().remove(0);
        let worker = rig.manager.worker(&vm_name).unwrap();
        wait_until(|| worker.free() == (0, 0), "first admission").await;

        // Three waiters fill the idle queue.
        let queued: Vec<_> = (2..=4).map(|id| request(id, 1, 256)).collect();
        for req in &queued {
            rig.manager.submit(req.clone());
        }
        wait_until(|| worker.idle_count() == 3, "idle queue to fill").await;

        // The next request cannot ride the live worker: dormant tier.
        let overflow = request(5, 1, 256);
        rig.manager.submit(overflow.clone());
        wait_until(|| rig.manager.dormant_count() == 1, "dormant worker").await;
        assert_eq!(rig.tracker.capacity_set_count(), 2);

        // Once the live worker frees an idle slot, placement prefers it over
        // the dormant tier again.
        gate.send(RunnerReply::results(json!(1))).unwrap();
        assert!(first.rendezvous().wait().await.is_success());
        wait_until(|| worker.idle_count() == 2, "slot to free").await;

        let sixth = request(6, 1, 256);
        rig.manager.submit(sixth.clone());
        wait_until(|| worker.idle_count() == 3, "live placement").await;
        assert_eq!(rig.manager.dormant_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn too_small_vm_is_not_installed() {
        // Raw (1, 512) leaves nothing after the (1, 512) overheads.
        let rig = rig(
            Limits {
                provision_timeout: Duration::from_secs(3),
                no_down_sizing: true,
                ..Limits::default()
            },
            MockCloudConfig::with_vm_size(1, 512),
        )
        .await;
        connect_runner(&rig.registry, &MockCloud::computer_name(VMSS, 0), |_| {
            RunnerReply::ok()
        });

        let req = request(1, 1, 256);
        rig.manager.submit(req.clone());

        // The request can only resolve through the provisioning watchdog.
        let result = req.rendezvous().wait().await;
        assert_eq!(result, JudgeResult::error(causes::PROVISIONING_TIMEOUT));
        assert!(rig.manager.live_vm_names().is_empty());
        assert_eq!(rig.manager.dormant_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_capacity_increase_fails_requests_as_provisioning_failed() {
        let rig = rig(
            Limits {
                provision_timeout: Duration::from_secs(3),
                no_down_sizing: true,
                ..Limits::default()
            },
            MockCloudConfig {
                set_capacity_error: Some("quota exceeded".to_string()),
                ..MockCloudConfig::with_vm_size(4, 2048)
            },
        )
        .await;

        let req = request(1, 2, 1024);
        rig.manager.submit(req.clone());

        let result = req.rendezvous().wait().await;
        assert_eq!(result, JudgeResult::error(causes::PROVISIONING_FAILED));
        assert_eq!(rig.manager.dormant_count(), 0);
    }

    // ─── Health & eviction ─────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn failed_health_check_reaps_worker_but_in_flight_result_arrives() {
        let rig = rig(
            Limits {
                no_down_sizing: true,
                ..Limits::default()
            },
            MockCloudConfig::with_vm_size(4, 2048),
        )
        .await;
        let machine_name = MockCloud::computer_name(VMSS, 0);

        // Runner stays reachable but starts failing health checks on demand.
        let healthy = Arc::new(AtomicBool::new(true));
        let gate = {
            let (channel, mut exchanges) = RunnerChannel::new(32);
            rig.registry.register(&machine_name, channel).unwrap();
            let healthy = healthy.clone();
            let (gate_tx, mut gate_rx) = mpsc::unbounded_channel::<RunnerReply>();
            tokio::spawn(async move {
                while let Some(exchange) = exchanges.recv().await {
                    let (command, reply) = exchange.into_parts();
                    let response = match command {
                        RunnerCommand::Check => {
                            if healthy.load(Ordering::SeqCst) {
                                RunnerReply::ok()
                            } else {
                                RunnerReply::error("not feeling well")
                            }
                        }
                        RunnerCommand::Start(_) => gate_rx
                            .recv()
                            .await
                            .unwrap_or_else(|| RunnerReply::error("gate closed")),
                        RunnerCommand::Info => RunnerReply::machine_name("unused"),
                    };
                    let _ = reply.send(Ok(response));
                }
            });
            gate_tx
        };

        let req = request(1, 1, 256);
        rig.manager.submit(req.clone());
        wait_until(|| rig.manager.live_vm_names().len() == 1, "vm discovery").await;
        let vm_name = rig.manager.live_vm_names().remove(0);
        let worker = rig.manager.worker(&vm_name).unwrap();
        // Wait for admission (pools debited), not just enqueueing, so the
        // request is genuinely in flight when the worker is reaped.
        wait_until(|| worker.free() == (2, 1280), "request admission").await;

        // Health flips; the next discovery pass reaps the worker.
        healthy.store(false, Ordering::SeqCst);
        rig.manager.refresh().await;
        assert!(rig.manager.live_vm_names().is_empty());
        wait_until(|| rig.tracker.vm_delete_count() == 1, "vm deletion").await;

        // The in-flight request still resolves through its rendezvous.
        gate.send(RunnerReply::results(json!("late but fine"))).unwrap();
        assert_eq!(
            req.rendezvous().wait().await,
            JudgeResult::success(json!("late but fine"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_idle_time_deletes_vm_on_first_idle() {
        let rig = rig(
            Limits {
                max_vm_idle: Duration::ZERO,
                ..Limits::default()
            },
            MockCloudConfig::with_vm_size(4, 2048),
        )
        .await;
        connect_runner(
            &rig.registry,
            &MockCloud::computer_name(VMSS, 0),
            |command| match command {
                RunnerCommand::Start(_) => RunnerReply::results(json!(null)),
                _ => RunnerReply::ok(),
            },
        );

        let req = request(1, 1, 256);
        rig.manager.submit(req.clone());
        assert!(req.rendezvous().wait().await.is_success());

        wait_until(|| rig.manager.live_vm_names().is_empty(), "idle eviction").await;
        wait_until(|| rig.tracker.vm_delete_count() == 1, "vm deletion").await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_down_sizing_keeps_idle_vm() {
        let rig = rig(
            Limits {
                max_vm_idle: Duration::ZERO,
                no_down_sizing: true,
                ..Limits::default()
            },
            MockCloudConfig::with_vm_size(4, 2048),
        )
        .await;
        connect_runner(
            &rig.registry,
            &MockCloud::computer_name(VMSS, 0),
            |command| match command {
                RunnerCommand::Start(_) => RunnerReply::results(json!(null)),
                _ => RunnerReply::ok(),
            },
        );

        let req = request(1, 1, 256);
        rig.manager.submit(req.clone());
        assert!(req.rendezvous().wait().await.is_success());

        // Give any (wrong) eviction plenty of chances to run.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rig.manager.live_vm_names().len(), 1);
        assert_eq!(rig.tracker.vm_delete_count(), 0);
    }

    // ─── Placement counters ────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn requests_with_capacity_share_one_worker() {
        let rig = rig(
            Limits {
                no_down_sizing: true,
                ..Limits::default()
            },
            MockCloudConfig::with_vm_size(5, 2560),
        )
        .await;
        let starts = Arc::new(AtomicUsize::new(0));
        {
            let starts = starts.clone();
            connect_runner(
                &rig.registry,
                &MockCloud::computer_name(VMSS, 0),
                move |command| match command {
                    RunnerCommand::Start(_) => {
                        starts.fetch_add(1, Ordering::SeqCst);
                        RunnerReply::results(json!(null))
                    }
                    _ => RunnerReply::ok(),
                },
            );
        }

        // Usable (4, 2048): both fit concurrently on one VM.
        let first = request(1, 2, 512);
        let second = request(2, 2, 512);
        rig.manager.submit(first.clone());
        rig.manager.submit(second.clone());

        assert!(first.rendezvous().wait().await.is_success());
        assert!(second.rendezvous().wait().await.is_success());
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        // A single provisioning round was enough.
        assert_eq!(rig.tracker.capacity_set_count(), 1);
        assert_eq!(rig.manager.live_vm_names().len(), 1);
    }
}
