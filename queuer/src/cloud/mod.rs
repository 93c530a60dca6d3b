//! Facade over the cloud control plane.
//!
//! The scheduler only ever sees opaque descriptors and the async operations
//! below; everything provider-specific stays behind [`CloudClient`]. The
//! in-memory [`mock::MockCloud`] implements the same trait for tests and for
//! running the queuer without a cloud subscription.

pub mod mock;

use std::fmt;

use async_trait::async_trait;

use crate::dto::MachineProfile;

// ─── Descriptors ───────────────────────────────────────────────────────────

/// One virtual machine scale set as the control plane reports it.
#[derive(Debug, Clone)]
pub struct VmssHandle {
    name: String,
    sku_name: String,
    sku_tier: String,
    capacity: u64,
}

impl VmssHandle {
    pub fn new(
        name: impl Into<String>,
        sku_name: impl Into<String>,
        sku_tier: impl Into<String>,
        capacity: u64,
    ) -> Self {
        Self {
            name: name.into(),
            sku_name: sku_name.into(),
            sku_tier: sku_tier.into(),
            capacity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sku_name(&self) -> &str {
        &self.sku_name
    }

    pub fn sku_tier(&self) -> &str {
        &self.sku_tier
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn profile(&self) -> MachineProfile {
        MachineProfile::new(&self.sku_name, &self.sku_tier)
    }
}

/// One VM inside a scale set. `computer_name` is the OS-level hostname the
/// runner identifies itself with.
#[derive(Debug, Clone)]
pub struct VmHandle {
    name: String,
    computer_name: String,
}

impl VmHandle {
    pub fn new(name: impl Into<String>, computer_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            computer_name: computer_name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn computer_name(&self) -> &str {
        &self.computer_name
    }
}

// ─── Errors ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum CloudError {
    /// The named VMSS or VM does not exist
    NotFound(String),
    /// The control plane rejected the call
    Api(String),
}

impl fmt::Display for CloudError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudError::NotFound(name) => write!(f, "not found: {name}"),
            CloudError::Api(msg) => write!(f, "cloud api error: {msg}"),
        }
    }
}

impl std::error::Error for CloudError {}

// ─── Facade trait ──────────────────────────────────────────────────────────

#[async_trait]
pub trait CloudClient: Send + Sync {
    /// List every VMSS in the resource group.
    async fn list_vmss(&self) -> Result<Vec<VmssHandle>, CloudError>;

    /// Create a VMSS for the given machine profile, initially at capacity 0.
    async fn create_vmss(&self, name: &str, profile: &MachineProfile) -> Result<(), CloudError>;

    async fn get_vmss(&self, name: &str) -> Result<VmssHandle, CloudError>;

    async fn delete_vmss(&self, name: &str) -> Result<(), CloudError>;

    /// List the VMs currently part of a VMSS.
    async fn list_vms(&self, vmss_name: &str) -> Result<Vec<VmHandle>, CloudError>;

    /// Fetch one VM expanded with its OS profile (computer name).
    async fn get_vm(&self, vm_name: &str) -> Result<VmHandle, CloudError>;

    /// Raw `(cpus, memory_mb)` of the VM's SKU, before overheads.
    async fn get_vm_size(&self, vm_name: &str) -> Result<(u32, u32), CloudError>;

    /// Set the instance count of a VMSS. The control plane creates or deletes
    /// VMs to match.
    async fn set_capacity(&self, capacity: u64, vmss_name: &str) -> Result<(), CloudError>;

    /// Delete one VM from a VMSS, adjusting capacity accordingly.
    async fn delete_vm(&self, vm_name: &str, vmss_name: &str, block: bool)
        -> Result<(), CloudError>;
}
