//! # Service Registry
//!
//! Name-to-capability directory for inter-task service discovery.
//!
//! ## Philosophy
//!
//! Children publish a service as a (name, capability) pair; other
//! children resolve the name and receive the capability. There are no
//! paths, no ports and no ambient namespaces: holding the capability is
//! what grants the right to call.

use cap_types::{ChildId, ObjectRef};
use thiserror::Error;

/// Fixed number of service slots
pub const MAX_SERVICES: usize = 32;

/// Error types for registry operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// All service slots are in use
    #[error("service registry is full")]
    Full,

    /// A service of the same name is already registered
    #[error("service name already registered: {0}")]
    DuplicateName(String),

    /// No service of that name exists
    #[error("unknown service: {0}")]
    UnknownService(String),
}

/// One published service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub name: String,
    pub cap: ObjectRef,
    pub owner: ChildId,
}

/// Supervisor-global service directory with fixed capacity.
pub struct ServiceRegistry {
    entries: Vec<ServiceEntry>,
    capacity: usize,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::with_capacity(MAX_SERVICES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    /// Publishes a service. On failure the registry is left unchanged.
    pub fn register(
        &mut self,
        name: &str,
        cap: ObjectRef,
        owner: ChildId,
    ) -> Result<(), RegistryError> {
        if self.entries.iter().any(|e| e.name == name) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        if self.entries.len() == self.capacity {
            return Err(RegistryError::Full);
        }
        self.entries.push(ServiceEntry {
            name: name.to_string(),
            cap,
            owner,
        });
        Ok(())
    }

    /// Resolves a service name to its capability
    pub fn lookup(&self, name: &str) -> Result<ObjectRef, RegistryError> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.cap)
            .ok_or_else(|| RegistryError::UnknownService(name.to_string()))
    }

    /// Withdraws one service by name; only its owner may do so
    pub fn unregister(&mut self, name: &str, owner: ChildId) -> Result<(), RegistryError> {
        let index = self
            .entries
            .iter()
            .position(|e| e.name == name && e.owner == owner)
            .ok_or_else(|| RegistryError::UnknownService(name.to_string()))?;
        self.entries.remove(index);
        Ok(())
    }

    /// Withdraws every service a child published; returns how many
    pub fn remove_owner(&mut self, owner: ChildId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.owner != owner);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ServiceEntry] {
        &self.entries
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
