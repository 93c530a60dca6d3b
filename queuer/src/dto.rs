//! Data model of the judge queuer.
//!
//! Requests flow Evaluator → VmssManager → VmWorker and come back through
//! the completion rendezvous attached to each request. Everything here is
//! plain data except [`Rendezvous`], the one-shot signaling primitive the
//! submit caller blocks on.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::Notify;

// ─── Error causes reported on the rendezvous ───────────────────────────────

/// Cause strings carried by [`JudgeResult::Error`] for failures the queuer
/// itself produces. Runner-reported causes are propagated verbatim instead.
pub mod causes {
    pub const RUNNER_UNREACHABLE: &str = "runner_unreachable";
    pub const JUDGE_INTERNAL: &str = "judge_internal_error";
    pub const PROVISIONING_TIMEOUT: &str = "provisioning_timeout";
    pub const PROVISIONING_FAILED: &str = "provisioning_failed";
}

// ─── Machine profile ───────────────────────────────────────────────────────

/// The `(name, tier)` pair identifying a cloud VM SKU. Keys one VMSS.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MachineProfile {
    name: String,
    tier: String,
}

#[derive(Debug)]
pub struct InvalidProfile(String);

impl fmt::Display for InvalidProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid machine type name: {:?}", self.0)
    }
}

impl std::error::Error for InvalidProfile {}

impl MachineProfile {
    pub fn new(name: impl Into<String>, tier: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tier: tier.into(),
        }
    }

    /// Parse a SKU name such as `Standard_B1s`: the tier is everything before
    /// the first underscore, the name is the full string.
    pub fn from_name(name: &str) -> Result<Self, InvalidProfile> {
        match name.split_once('_') {
            Some((tier, rest)) if !tier.is_empty() && !rest.is_empty() => Ok(Self {
                name: name.to_string(),
                tier: tier.to_string(),
            }),
            _ => Err(InvalidProfile(name.to_string())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tier(&self) -> &str {
        &self.tier
    }
}

// ─── Submission ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionKind {
    Code,
    Solution,
}

#[derive(Debug, Clone)]
pub struct Submission {
    kind: SubmissionKind,
    source_url: String,
    validator_url: String,
}

impl Submission {
    pub fn new(
        kind: SubmissionKind,
        source_url: impl Into<String>,
        validator_url: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            source_url: source_url.into(),
            validator_url: validator_url.into(),
        }
    }

    pub fn kind(&self) -> SubmissionKind {
        self.kind
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn validator_url(&self) -> &str {
        &self.validator_url
    }
}

// ─── Judge result ──────────────────────────────────────────────────────────

/// Outcome of one judge request.
#[derive(Debug, Clone, PartialEq)]
pub enum JudgeResult {
    Success(Value),
    Error(String),
}

impl JudgeResult {
    pub fn success(payload: Value) -> Self {
        JudgeResult::Success(payload)
    }

    pub fn error(cause: impl Into<String>) -> Self {
        JudgeResult::Error(cause.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JudgeResult::Success(_))
    }
}

// ─── Completion rendezvous ─────────────────────────────────────────────────

/// One-shot, multi-waiter completion signal.
///
/// `signal` publishes the result at most once; every `wait` call, before or
/// after the signal, observes the same result. Replaces the condition
/// variable idiom with a tagged slot so readers can never see an
/// uninitialized result.
#[derive(Clone, Default)]
pub struct Rendezvous {
    inner: Arc<RendezvousInner>,
}

#[derive(Default)]
struct RendezvousInner {
    slot: Mutex<Option<JudgeResult>>,
    signal: Notify,
}

impl Rendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish the result. Returns false if the rendezvous was already
    /// signaled; the first result stays.
    pub fn signal(&self, result: JudgeResult) -> bool {
        {
            let mut slot = self.inner.slot.lock().unwrap();
            if slot.is_some() {
                return false;
            }
            *slot = Some(result);
        }
        self.inner.signal.notify_waiters();
        true
    }

    /// Block until the result is published, then return a copy of it.
    pub async fn wait(&self) -> JudgeResult {
        loop {
            // Register interest before checking the slot, so a signal between
            // the check and the await cannot be missed.
            let notified = self.inner.signal.notified();
            if let Some(result) = self.inner.slot.lock().unwrap().clone() {
                return result;
            }
            notified.await;
        }
    }

    /// Non-blocking read of the published result.
    pub fn result(&self) -> Option<JudgeResult> {
        self.inner.slot.lock().unwrap().clone()
    }
}

// ─── Judge request ─────────────────────────────────────────────────────────

/// A submitted unit of work. Immutable once constructed; the scheduler
/// communicates back exclusively through the rendezvous.
pub struct JudgeRequest {
    id: u64,
    submission: Submission,
    machine_profile: MachineProfile,
    cpus: u32,
    memory_mb: u32,
    evaluation_settings: Value,
    benchmark_instances: HashMap<String, String>,
    rendezvous: Rendezvous,
}

impl JudgeRequest {
    pub fn new(
        id: u64,
        submission: Submission,
        machine_profile: MachineProfile,
        cpus: u32,
        memory_mb: u32,
        evaluation_settings: Value,
        benchmark_instances: HashMap<String, String>,
    ) -> Self {
        Self {
            id,
            submission,
            machine_profile,
            cpus,
            memory_mb,
            evaluation_settings,
            benchmark_instances,
            rendezvous: Rendezvous::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn submission(&self) -> &Submission {
        &self.submission
    }

    pub fn machine_profile(&self) -> &MachineProfile {
        &self.machine_profile
    }

    pub fn cpus(&self) -> u32 {
        self.cpus
    }

    pub fn memory_mb(&self) -> u32 {
        self.memory_mb
    }

    pub fn evaluation_settings(&self) -> &Value {
        &self.evaluation_settings
    }

    pub fn benchmark_instances(&self) -> &HashMap<String, String> {
        &self.benchmark_instances
    }

    pub fn rendezvous(&self) -> &Rendezvous {
        &self.rendezvous
    }
}

impl fmt::Debug for JudgeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JudgeRequest")
            .field("id", &self.id)
            .field("machine_profile", &self.machine_profile)
            .field("cpus", &self.cpus)
            .field("memory_mb", &self.memory_mb)
            .finish_non_exhaustive()
    }
}
