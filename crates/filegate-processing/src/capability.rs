//! Capability descriptors: what the registry stores per key.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use filegate_core::{CapabilityGroup, InputPolicy, OptionSchema};

use crate::traits::CapabilityHandler;

/// A registered capability. Immutable once it is in the registry.
#[derive(Clone)]
pub struct CapabilityDescriptor {
    pub key: String,
    pub group: CapabilityGroup,
    /// Lower-case extensions without the dot. Never empty.
    pub accepted_extensions: BTreeSet<String>,
    pub options: OptionSchema,
    pub input: InputPolicy,
    pub handler: Arc<dyn CapabilityHandler>,
}

impl CapabilityDescriptor {
    pub fn new(
        key: impl Into<String>,
        group: CapabilityGroup,
        handler: Arc<dyn CapabilityHandler>,
    ) -> Self {
        Self {
            key: key.into(),
            group,
            accepted_extensions: BTreeSet::new(),
            options: OptionSchema::new(),
            input: InputPolicy::Required,
            handler,
        }
    }

    pub fn accepts<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.accepted_extensions.extend(
            extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase()),
        );
        self
    }

    pub fn options(mut self, options: OptionSchema) -> Self {
        self.options = options;
        self
    }

    pub fn input(mut self, input: InputPolicy) -> Self {
        self.input = input;
        self
    }

    /// Case-insensitive membership test against the accepted set.
    pub fn is_accepted_extension(&self, extension: &str) -> bool {
        self.accepted_extensions
            .contains(&extension.trim_start_matches('.').to_ascii_lowercase())
    }

    /// HTTP route the capability is exposed on.
    pub fn route(&self) -> String {
        format!("/{}", self.key)
    }
}

impl fmt::Debug for CapabilityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityDescriptor")
            .field("key", &self.key)
            .field("group", &self.group)
            .field("accepted_extensions", &self.accepted_extensions)
            .field("input", &self.input)
            .finish_non_exhaustive()
    }
}
