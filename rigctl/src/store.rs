//! Remembered port selections.

use std::collections::HashMap;

use crate::error::Result;
use crate::protocol::Role;

/// Key-value store for the last selected device of each role.
///
/// The controller writes only after a successful (re)bind.
pub trait SelectionStore: Send {
    /// Read a value.
    fn get(&self, key: &str) -> Option<String>;

    /// Write a value.
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
}

/// Store key holding a role's device.
pub fn selection_key(role: Role) -> &'static str {
    match role {
        Role::Master => "master_port_device",
        Role::Target => "target_port_device",
    }
}

/// Volatile store, used by tests and when persistence is disabled.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: HashMap<String, String>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectionStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_per_role() {
        assert_eq!(selection_key(Role::Master), "master_port_device");
        assert_eq!(selection_key(Role::Target), "target_port_device");
    }

    #[test]
    fn test_memory_store_round_trip() {
        let mut store = MemoryStore::new();
        assert_eq!(store.get("master_port_device"), None);
        store.set("master_port_device", "COM3").unwrap();
        store.set("master_port_device", "COM4").unwrap();
        assert_eq!(store.get("master_port_device").as_deref(), Some("COM4"));
    }
}
