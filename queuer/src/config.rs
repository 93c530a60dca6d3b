//! Scheduler limits, read once from the environment at startup.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone)]
pub struct Limits {
    /// CPU overhead reserved for the OS on every VM
    pub min_cpus: u32,
    /// Memory overhead (MB) reserved for the OS on every VM
    pub min_memory_mb: u32,
    /// How long a VM may sit idle before it is deleted. Zero deletes on the
    /// first transition to not-busy.
    pub max_vm_idle: Duration,
    /// Disables idle VM deletion entirely
    pub no_down_sizing: bool,
    /// How long a dormant worker may wait for its VM before its queued
    /// requests are failed
    pub provision_timeout: Duration,
    /// Optional bound on START exchanges; unbounded when None
    pub start_timeout: Option<Duration>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            min_cpus: 1,
            min_memory_mb: 512,
            max_vm_idle: Duration::from_secs(60),
            no_down_sizing: false,
            provision_timeout: Duration::from_secs(600),
            start_timeout: None,
        }
    }
}

impl Limits {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            min_cpus: env_or("MIN_CPUS", defaults.min_cpus),
            min_memory_mb: env_or("MIN_MEMORY", defaults.min_memory_mb),
            max_vm_idle: Duration::from_secs(env_or(
                "MAX_VM_IDLE_TIME",
                defaults.max_vm_idle.as_secs(),
            )),
            no_down_sizing: flag_is_true(std::env::var("NO_DOWN_SIZING").ok().as_deref()),
            provision_timeout: Duration::from_secs(env_or(
                "PROVISION_TIMEOUT",
                defaults.provision_timeout.as_secs(),
            )),
            start_timeout: std::env::var("START_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs),
        }
    }
}

fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(var = key, value = %raw, "unparseable value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn flag_is_true(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.eq_ignore_ascii_case("true"))
}
