//! Common interface shared by every template loaded with the same settings
use {
    crate::runtime::Config,
    std::collections::{btree_map::Entry, BTreeMap},
};

/// Error definitions
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum SymbolRegistryError {
    /// A symbol was registered twice with different addresses
    #[error("symbol '{0}' is already registered at a different address")]
    DuplicateSymbol(String),
}

/// Holds the addresses of the symbols the runtime provides to programs
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct SymbolRegistry {
    map: BTreeMap<String, u64>,
}

impl SymbolRegistry {
    /// Register a symbol by name
    pub fn register_symbol(
        &mut self,
        name: impl Into<String>,
        address: u64,
    ) -> Result<(), SymbolRegistryError> {
        match self.map.entry(name.into()) {
            Entry::Vacant(entry) => {
                entry.insert(address);
            }
            Entry::Occupied(entry) => {
                if *entry.get() != address {
                    return Err(SymbolRegistryError::DuplicateSymbol(entry.key().clone()));
                }
            }
        }
        Ok(())
    }

    /// Unregister a symbol again
    pub fn unregister_symbol(&mut self, name: &str) {
        self.map.remove(name);
    }

    /// Get the address of a symbol by its name
    pub fn lookup_by_name(&self, name: &str) -> Option<u64> {
        self.map.get(name).copied()
    }

    /// Iterate over all entries
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.map
            .iter()
            .map(|(name, address)| (name.as_str(), *address))
    }

    /// Number of registered symbols
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether no symbol is registered
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Configuration and imported symbols used to load executables
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct Loader {
    config: Config,
    symbol_registry: SymbolRegistry,
}

impl Loader {
    /// Constructs a loader with an empty symbol registry
    pub fn new(config: Config) -> Self {
        Self {
            config,
            symbol_registry: SymbolRegistry::default(),
        }
    }

    /// Constructs a loader with the given symbols
    pub fn new_with_symbols(config: Config, symbol_registry: SymbolRegistry) -> Self {
        Self {
            config,
            symbol_registry,
        }
    }

    /// Get the configuration settings
    pub fn get_config(&self) -> &Config {
        &self.config
    }

    /// Get the symbols provided by the runtime
    pub fn get_symbol_registry(&self) -> &SymbolRegistry {
        &self.symbol_registry
    }

    /// Register a symbol provided by the runtime
    pub fn register_symbol(
        &mut self,
        name: impl Into<String>,
        address: u64,
    ) -> Result<(), SymbolRegistryError> {
        self.symbol_registry.register_symbol(name, address)
    }
}
