//! In-memory cloud for unit tests and local runs.
//!
//! Tracks VMSS and VM tables without touching any control plane. Capacity
//! changes materialize deterministically named VMs, the way the real cloud
//! implicitly creates instances on scale-out. Failures can be injected via
//! [`MockCloudConfig`], and every mutating call is counted in
//! [`CloudCallTracker`] so tests can assert on the sequence of operations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{CloudClient, CloudError, VmHandle, VmssHandle};
use crate::dto::MachineProfile;

// ─── Configuration for failure injection ──────────────────────────────────

/// Which operations should fail. All default to `None` (success).
#[derive(Debug, Clone, Default)]
pub struct MockCloudConfig {
    /// If set, `create_vmss()` returns this error
    pub create_vmss_error: Option<String>,
    /// If set, `set_capacity()` returns this error
    pub set_capacity_error: Option<String>,
    /// If set, `delete_vm()` returns this error
    pub delete_vm_error: Option<String>,
    /// Raw vCPUs reported for every VM
    pub vm_cpus: u32,
    /// Raw memory (MB) reported for every VM
    pub vm_memory_mb: u32,
}

impl MockCloudConfig {
    pub fn with_vm_size(vm_cpus: u32, vm_memory_mb: u32) -> Self {
        Self {
            vm_cpus,
            vm_memory_mb,
            ..Self::default()
        }
    }
}

// ─── Call tracker ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct CloudCallTracker {
    pub vmss_creates: Arc<AtomicUsize>,
    pub vmss_deletes: Arc<AtomicUsize>,
    pub capacity_sets: Arc<AtomicUsize>,
    pub vm_deletes: Arc<AtomicUsize>,
}

impl CloudCallTracker {
    pub fn vmss_create_count(&self) -> usize {
        self.vmss_creates.load(Ordering::Relaxed)
    }

    pub fn vmss_delete_count(&self) -> usize {
        self.vmss_deletes.load(Ordering::Relaxed)
    }

    pub fn capacity_set_count(&self) -> usize {
        self.capacity_sets.load(Ordering::Relaxed)
    }

    pub fn vm_delete_count(&self) -> usize {
        self.vm_deletes.load(Ordering::Relaxed)
    }
}

// ─── State ─────────────────────────────────────────────────────────────────

struct VmRecord {
    name: String,
    computer_name: String,
}

struct VmssRecord {
    sku_name: String,
    sku_tier: String,
    capacity: u64,
    vms: Vec<VmRecord>,
    /// Monotonic instance counter so deleted VM names are never reused
    next_instance: u64,
}

impl VmssRecord {
    fn handle(&self, name: &str) -> VmssHandle {
        VmssHandle::new(name, &self.sku_name, &self.sku_tier, self.capacity)
    }
}

#[derive(Default)]
struct CloudState {
    sets: HashMap<String, VmssRecord>,
}

pub struct MockCloud {
    state: Mutex<CloudState>,
    config: MockCloudConfig,
    tracker: CloudCallTracker,
}

impl MockCloud {
    /// Mock with default VM size (4 cpus, 2048 MB) and no injected failures.
    pub fn new() -> (Self, CloudCallTracker) {
        Self::with_config(MockCloudConfig::with_vm_size(4, 2048))
    }

    pub fn with_config(config: MockCloudConfig) -> (Self, CloudCallTracker) {
        let tracker = CloudCallTracker::default();
        let cloud = Self {
            state: Mutex::default(),
            config,
            tracker: tracker.clone(),
        };
        (cloud, tracker)
    }

    /// Deterministic hostname of the `index`-th VM of a VMSS; tests use this
    /// to pre-register runners.
    pub fn computer_name(vmss_name: &str, index: u64) -> String {
        format!("{vmss_name}-n{index}")
    }

    /// Seed a VMSS as if it already existed in the subscription.
    pub fn seed_vmss(&self, name: &str, profile: &MachineProfile, capacity: u64) {
        let mut state = self.state.lock().unwrap();
        let mut record = VmssRecord {
            sku_name: profile.name().to_string(),
            sku_tier: profile.tier().to_string(),
            capacity: 0,
            vms: Vec::new(),
            next_instance: 0,
        };
        grow_to(&mut record, name, capacity);
        record.capacity = capacity;
        state.sets.insert(name.to_string(), record);
    }
}

fn grow_to(record: &mut VmssRecord, vmss_name: &str, capacity: u64) {
    while (record.vms.len() as u64) < capacity {
        let index = record.next_instance;
        record.next_instance += 1;
        record.vms.push(VmRecord {
            name: format!("{vmss_name}_{index}"),
            computer_name: MockCloud::computer_name(vmss_name, index),
        });
    }
    while (record.vms.len() as u64) > capacity {
        record.vms.pop();
    }
}

#[async_trait]
impl CloudClient for MockCloud {
    async fn list_vmss(&self) -> Result<Vec<VmssHandle>, CloudError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .sets
            .iter()
            .map(|(name, record)| record.handle(name))
            .collect())
    }

    async fn create_vmss(&self, name: &str, profile: &MachineProfile) -> Result<(), CloudError> {
        self.tracker.vmss_creates.fetch_add(1, Ordering::Relaxed);
        if let Some(ref cause) = self.config.create_vmss_error {
            return Err(CloudError::Api(cause.clone()));
        }
        let mut state = self.state.lock().unwrap();
        state.sets.insert(
            name.to_string(),
            VmssRecord {
                sku_name: profile.name().to_string(),
                sku_tier: profile.tier().to_string(),
                capacity: 0,
                vms: Vec::new(),
                next_instance: 0,
            },
        );
        Ok(())
    }

    async fn get_vmss(&self, name: &str) -> Result<VmssHandle, CloudError> {
        let state = self.state.lock().unwrap();
        state
            .sets
            .get(name)
            .map(|record| record.handle(name))
            .ok_or_else(|| CloudError::NotFound(name.to_string()))
    }

    async fn delete_vmss(&self, name: &str) -> Result<(), CloudError> {
        self.tracker.vmss_deletes.fetch_add(1, Ordering::Relaxed);
        let mut state = self.state.lock().unwrap();
        state
            .sets
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| CloudError::NotFound(name.to_string()))
    }

    async fn list_vms(&self, vmss_name: &str) -> Result<Vec<VmHandle>, CloudError> {
        let state = self.state.lock().unwrap();
        let record = state
            .sets
            .get(vmss_name)
            .ok_or_else(|| CloudError::NotFound(vmss_name.to_string()))?;
        Ok(record
            .vms
            .iter()
            .map(|vm| VmHandle::new(&vm.name, &vm.computer_name))
            .collect())
    }

    async fn get_vm(&self, vm_name: &str) -> Result<VmHandle, CloudError> {
        let state = self.state.lock().unwrap();
        for record in state.sets.values() {
            if let Some(vm) = record.vms.iter().find(|vm| vm.name == vm_name) {
                return Ok(VmHandle::new(&vm.name, &vm.computer_name));
            }
        }
        Err(CloudError::NotFound(vm_name.to_string()))
    }

    async fn get_vm_size(&self, vm_name: &str) -> Result<(u32, u32), CloudError> {
        let state = self.state.lock().unwrap();
        let exists = state
            .sets
            .values()
            .any(|record| record.vms.iter().any(|vm| vm.name == vm_name));
        if !exists {
            return Err(CloudError::NotFound(vm_name.to_string()));
        }
        Ok((self.config.vm_cpus, self.config.vm_memory_mb))
    }

    async fn set_capacity(&self, capacity: u64, vmss_name: &str) -> Result<(), CloudError> {
        self.tracker.capacity_sets.fetch_add(1, Ordering::Relaxed);
        if let Some(ref cause) = self.config.set_capacity_error {
            return Err(CloudError::Api(cause.clone()));
        }
        let mut state = self.state.lock().unwrap();
        let record = state
            .sets
            .get_mut(vmss_name)
            .ok_or_else(|| CloudError::NotFound(vmss_name.to_string()))?;
        grow_to(record, vmss_name, capacity);
        record.capacity = capacity;
        Ok(())
    }

    async fn delete_vm(
        &self,
        vm_name: &str,
        vmss_name: &str,
        _block: bool,
    ) -> Result<(), CloudError> {
        self.tracker.vm_deletes.fetch_add(1, Ordering::Relaxed);
        if let Some(ref cause) = self.config.delete_vm_error {
            return Err(CloudError::Api(cause.clone()));
        }
        let mut state = self.state.lock().unwrap();
        let record = state
            .sets
            .get_mut(vmss_name)
            .ok_or_else(|| CloudError::NotFound(vmss_name.to_string()))?;
        let before = record.vms.len();
        record.vms.retain(|vm| vm.name != vm_name);
        if record.vms.len() == before {
            return Err(CloudError::NotFound(vm_name.to_string()));
        }
        record.capacity = record.capacity.saturating_sub(1);
        Ok(())
    }
}
