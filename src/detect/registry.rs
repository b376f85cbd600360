use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::backend::{DetectionCapability, DetectorBackend};

/// Shared handle to a registered backend.
pub type SharedBackend = Arc<Mutex<dyn DetectorBackend>>;

/// Registry of detector backends, selected by name or capability.
///
/// Backends are wrapped in `Mutex` because `DetectorBackend::detect` takes `&mut self`.
pub struct BackendRegistry {
    backends: HashMap<String, SharedBackend>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    pub fn get(&self, name: &str) -> Option<SharedBackend> {
        self.backends.get(name).cloned()
    }

    pub fn default_backend(&self) -> Option<SharedBackend> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    /// Registered backend names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Select a backend that supports the requested capability.
    ///
    /// Prefers the default backend when it supports the capability.
    pub fn backend_for_capability(
        &self,
        capability: DetectionCapability,
    ) -> Result<SharedBackend> {
        if let Some(default_backend) = self.default_backend() {
            if supports(&default_backend, capability)? {
                return Ok(default_backend);
            }
        }

        for name in self.list() {
            if let Some(backend) = self.get(&name) {
                if supports(&backend, capability)? {
                    return Ok(backend);
                }
            }
        }

        Err(anyhow!(
            "no registered backend supports capability {:?}",
            capability
        ))
    }

    /// Resolve a configured backend name, or the default when none is given.
    pub fn select(&self, name: Option<&str>) -> Result<SharedBackend> {
        match name {
            Some(name) => self.get(name).ok_or_else(|| {
                anyhow!(
                    "backend '{}' not registered (available: {})",
                    name,
                    self.list().join(", ")
                )
            }),
            None => self
                .default_backend()
                .ok_or_else(|| anyhow!("no detector backends registered")),
        }
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn supports(backend: &SharedBackend, capability: DetectionCapability) -> Result<bool> {
    let guard = backend
        .lock()
        .map_err(|_| anyhow!("backend lock poisoned"))?;
    Ok(guard.supports(capability))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::{ColorBackend, ScriptedBackend};

    #[test]
    fn capability_lookup_skips_default_when_unsupported() -> Result<()> {
        let mut registry = BackendRegistry::new();
        registry.register(ScriptedBackend::new(Vec::new()));
        registry.register(ColorBackend::default());
        let backend = registry.backend_for_capability(DetectionCapability::ColorSegmentation)?;
        let name = backend.lock().map_err(|_| anyhow!("poisoned"))?.name();
        assert_eq!(name, "color");
        Ok(())
    }

    #[test]
    fn select_by_unknown_name_lists_available() {
        let mut registry = BackendRegistry::new();
        registry.register(ColorBackend::default());
        let err = registry.select(Some("yolo")).err().map(|e| e.to_string());
        assert_eq!(
            err.as_deref(),
            Some("backend 'yolo' not registered (available: color)")
        );
        assert!(registry.select(None).is_ok());
    }
}
