//! Capability registry
//!
//! Built once at startup and then shared read-only (behind an `Arc`) by every
//! request, so lookups take no locks.

use std::collections::HashMap;
use std::sync::Arc;

use crate::capability::CapabilityDescriptor;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Capability '{0}' is registered twice")]
    DuplicateKey(String),

    #[error("Capability '{0}' declares no accepted extensions")]
    NoAcceptedExtensions(String),

    #[error("Capability '{0}' not found")]
    NotFound(String),
}

#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    descriptors: HashMap<String, Arc<CapabilityDescriptor>>,
    /// Registration order, used for listings.
    order: Vec<String>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability. Duplicate keys and empty extension sets are
    /// rejected; callers treat either as a fatal startup error.
    pub fn register(&mut self, descriptor: CapabilityDescriptor) -> Result<(), RegistryError> {
        if self.descriptors.contains_key(&descriptor.key) {
            return Err(RegistryError::DuplicateKey(descriptor.key));
        }
        if descriptor.accepted_extensions.is_empty() {
            return Err(RegistryError::NoAcceptedExtensions(descriptor.key));
        }

        tracing::debug!(
            capability = %descriptor.key,
            group = descriptor.group.as_str(),
            extensions = descriptor.accepted_extensions.len(),
            "Registered capability"
        );
        self.order.push(descriptor.key.clone());
        self.descriptors
            .insert(descriptor.key.clone(), Arc::new(descriptor));
        Ok(())
    }

    pub fn resolve(&self, key: &str) -> Result<Arc<CapabilityDescriptor>, RegistryError> {
        self.descriptors
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))
    }

    pub fn is_accepted_extension(descriptor: &CapabilityDescriptor, extension: &str) -> bool {
        descriptor.is_accepted_extension(extension)
    }

    /// Descriptors in registration order.
    pub fn list(&self) -> impl Iterator<Item = &Arc<CapabilityDescriptor>> {
        self.order.iter().filter_map(|key| self.descriptors.get(key))
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
