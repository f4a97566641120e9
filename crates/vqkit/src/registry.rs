//! Name-based device construction.

use crate::device::{StubDevice, VirtioDevice};
use crate::devices::VirtioRng;
use std::collections::BTreeMap;
use thiserror::Error;

pub type DeviceConstructor = Box<dyn Fn() -> Box<dyn VirtioDevice> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("virtio device \"{0}\" already registered")]
    Duplicate(String),
    #[error("unknown virtio device \"{0}\"")]
    Unknown(String),
}

/// Maps device kind names to constructors.
#[derive(Default)]
pub struct DeviceRegistry {
    constructors: BTreeMap<String, DeviceConstructor>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every device model shipped in this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        let builtin: [(&str, DeviceConstructor); 2] = [
            ("stub", Box::new(|| Box::new(StubDevice) as Box<dyn VirtioDevice>)),
            ("rng", Box::new(|| Box::new(VirtioRng::new()) as Box<dyn VirtioDevice>)),
        ];
        registry.constructors.extend(
            builtin
                .into_iter()
                .map(|(name, ctor)| (name.to_owned(), ctor)),
        );
        registry
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        ctor: DeviceConstructor,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if self.constructors.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        tracing::debug!(name = %name, "registered virtio device");
        self.constructors.insert(name, ctor);
        Ok(())
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn VirtioDevice>, RegistryError> {
        let ctor = self
            .constructors
            .get(name)
            .ok_or_else(|| RegistryError::Unknown(name.to_owned()))?;
        Ok(ctor())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

impl core::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}
