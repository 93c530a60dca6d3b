//! Registry of connected runners, keyed by machine name.
//!
//! The registry references channels, it never owns sockets. Connection
//! lifecycle is driven from the judge accept loop: registration after the
//! INFO handshake, unregistration through a [`CloseHook`] that fires exactly
//! once when the socket closes.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::channel::RunnerChannel;

#[derive(Debug)]
pub enum RegistryError {
    /// A runner with that machine name is already connected
    DuplicateRunner(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::DuplicateRunner(name) => {
                write!(f, "runner with machine name {name} is already connected")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Default)]
pub struct RunnerRegistry {
    runners: Mutex<HashMap<String, RunnerChannel>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a channel under `machine_name`. The first registration wins.
    pub fn register(
        &self,
        machine_name: &str,
        channel: RunnerChannel,
    ) -> Result<(), RegistryError> {
        let mut runners = self.runners.lock().unwrap();
        if runners.contains_key(machine_name) {
            return Err(RegistryError::DuplicateRunner(machine_name.to_string()));
        }
        runners.insert(machine_name.to_string(), channel);
        Ok(())
    }

    pub fn is_connected(&self, machine_name: &str) -> bool {
        self.runners.lock().unwrap().contains_key(machine_name)
    }

    pub fn get(&self, machine_name: &str) -> Option<RunnerChannel> {
        self.runners.lock().unwrap().get(machine_name).cloned()
    }

    pub fn unregister(&self, machine_name: &str) {
        self.runners.lock().unwrap().remove(machine_name);
    }

    /// Hook that unregisters `machine_name` when fired. Firing twice is a
    /// no-op, so a connection task can call it from every exit path.
    pub fn close_hook(self: &Arc<Self>, machine_name: &str) -> CloseHook {
        CloseHook {
            registry: Arc::clone(self),
            machine_name: machine_name.to_string(),
            fired: AtomicBool::new(false),
        }
    }
}

pub struct CloseHook {
    registry: Arc<RunnerRegistry>,
    machine_name: String,
    fired: AtomicBool,
}

impl CloseHook {
    pub fn fire(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.unregister(&self.machine_name);
        info!(machine_name = %self.machine_name, "runner disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> RunnerChannel {
        // The receiver is dropped; these tests never exchange commands.
        RunnerChannel::new(1).0
    }

    #[test]
    fn register_then_lookup() {
        let registry = RunnerRegistry::new();
        assert!(!registry.is_connected("m1"));
        assert!(registry.get("m1").is_none());

        registry.register("m1", channel()).unwrap();
        assert!(registry.is_connected("m1"));
        assert!(registry.get("m1").is_some());
    }

    #[test]
    fn duplicate_register_fails() {
        let registry = RunnerRegistry::new();
        registry.register("m1", channel()).unwrap();

        let err = registry.register("m1", channel()).unwrap_err();
        match err {
            RegistryError::DuplicateRunner(name) => assert_eq!(name, "m1"),
        }
        // The first registration stays authoritative.
        assert!(registry.is_connected("m1"));
    }

    #[test]
    fn unregister_removes_entry() {
        let registry = RunnerRegistry::new();
        registry.register("m1", channel()).unwrap();
        registry.unregister("m1");
        assert!(!registry.is_connected("m1"));
    }

    #[test]
    fn close_hook_fires_once() {
        let registry = Arc::new(RunnerRegistry::new());
        registry.register("m1", channel()).unwrap();

        let hook = registry.close_hook("m1");
        hook.fire();
        assert!(!registry.is_connected("m1"));

        // A runner may reconnect between the two fires; the second fire must
        // not tear the new registration down.
        registry.register("m1", channel()).unwrap();
        hook.fire();
        assert!(registry.is_connected("m1"));
    }
}
