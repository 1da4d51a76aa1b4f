//! Loader settings and the registry of live instances of a template

use crate::{
    elf::{ExecutableCode, InstanceAddresses, LoadedInstance, SharedAddresses},
    error::Result,
    limits::MAX_EXECUTABLE_SIZE,
};
use log::debug;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

#[cfg(not(feature = "shuttle-test"))]
use std::sync::Arc;

#[cfg(feature = "shuttle-test")]
use shuttle::sync::Arc;

/// Loader configuration settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Largest accepted sum of all bucket sizes, capped at [MAX_EXECUTABLE_SIZE]
    pub max_executable_size: u64,
    /// Resolve undefined weak symbols to address 0 instead of failing
    pub resolve_weak_symbols_to_zero: bool,
    /// Make every PLT stub of an instance jump through its GOT slot
    pub rewrite_plt_stubs: bool,
}

impl Config {
    /// Returns the executable size ceiling that is actually enforced
    pub fn max_executable_size(&self) -> u64 {
        self.max_executable_size.min(MAX_EXECUTABLE_SIZE)
    }

    /// Parses a JSON document, missing fields take their default value
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_executable_size: MAX_EXECUTABLE_SIZE,
            resolve_weak_symbols_to_zero: true,
            rewrite_plt_stubs: true,
        }
    }
}

/// Identifies an instance within its [InstanceSupervisor]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct InstanceId(u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Owns a shared-relocated template and the instances loaded from it
#[derive(Debug)]
pub struct InstanceSupervisor {
    template: Arc<ExecutableCode>,
    instances: BTreeMap<InstanceId, LoadedInstance>,
    next_id: u64,
}

impl InstanceSupervisor {
    /// Relocates the shared sections of `template` and takes ownership of it
    pub fn new(mut template: ExecutableCode, addresses: SharedAddresses) -> Result<Self> {
        template.load_shared(addresses)?;
        Ok(Self {
            template: Arc::new(template),
            instances: BTreeMap::new(),
            next_id: 0,
        })
    }

    /// Get the template, shared with every instance
    pub fn template(&self) -> &Arc<ExecutableCode> {
        &self.template
    }

    /// Loads a new instance at the given addresses
    pub fn spawn(&mut self, addresses: InstanceAddresses) -> Result<InstanceId> {
        let instance = self.template.load_instance(addresses)?;
        let id = InstanceId(self.next_id);
        self.next_id = self.next_id.saturating_add(1);
        self.instances.insert(id, instance);
        debug!("spawned instance {} ({} live)", id, self.instances.len());
        Ok(id)
    }

    /// Get a live instance
    pub fn get(&self, id: InstanceId) -> Option<&LoadedInstance> {
        self.instances.get(&id)
    }

    /// Drops an instance, returning it if it was live
    pub fn terminate(&mut self, id: InstanceId) -> Option<LoadedInstance> {
        let instance = self.instances.remove(&id);
        if instance.is_some() {
            debug!("terminated instance {} ({} live)", id, self.instances.len());
        }
        instance
    }

    /// Iterate over the live instances
    pub fn iter(&self) -> impl Iterator<Item = (InstanceId, &LoadedInstance)> + '_ {
        self.instances.iter().map(|(id, instance)| (*id, instance))
    }

    /// Number of live instances
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether no instance is live
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_json() {
        assert_eq!(Config::from_json("{}").unwrap(), Config::default());
        let config = Config::from_json(
            r#"{"max_executable_size": 4096, "rewrite_plt_stubs": false}"#,
        )
        .unwrap();
        assert_eq!(config.max_executable_size(), 4096);
        assert!(config.resolve_weak_symbols_to_zero);
        assert!(!config.rewrite_plt_stubs);
        assert!(Config::from_json(r#"{"max_executable_size": "big"}"#).is_err());
    }

    #[test]
    fn test_max_executable_size_is_capped() {
        let config = Config {
            max_executable_size: u64::MAX,
            ..Config::default()
        };
        assert_eq!(config.max_executable_size(), MAX_EXECUTABLE_SIZE);
    }
}
