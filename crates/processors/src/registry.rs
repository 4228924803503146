//! Thread-safe processor registry.
//!
//! Processors are keyed by `name:version`; registrations without an explicit
//! version land under the `default` version, which is the one the executor
//! resolves when it looks a processor up by node name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::{RegistryError, TaskProcessor};

pub const DEFAULT_VERSION: &str = "default";

/// A registered processor together with its metadata.
#[derive(Clone)]
pub struct ProcessorEntry {
    pub name: String,
    pub version: String,
    pub processor: Arc<dyn TaskProcessor>,
    /// Monotonic registration sequence number.
    pub sequence: u64,
}

impl std::fmt::Debug for ProcessorEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorEntry")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("sequence", &self.sequence)
            .finish()
    }
}

/// Point-in-time registry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub active: usize,
    pub total_registered: u64,
    pub total_unregistered: u64,
}

#[derive(Default)]
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<String, ProcessorEntry>>,
    total_registered: AtomicU64,
    total_unregistered: AtomicU64,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor` under `name` with the default version.
    ///
    /// # Errors
    /// - [`RegistryError::InvalidName`] for names outside `[A-Za-z0-9_.-]+`.
    /// - [`RegistryError::AlreadyRegistered`] if the name is taken.
    pub fn register(
        &self,
        name: &str,
        processor: Arc<dyn TaskProcessor>,
    ) -> Result<(), RegistryError> {
        self.register_versioned(name, None, processor, false)
    }

    /// Register a processor under an explicit version, optionally replacing
    /// an existing registration.
    pub fn register_versioned(
        &self,
        name: &str,
        version: Option<&str>,
        processor: Arc<dyn TaskProcessor>,
        allow_overwrite: bool,
    ) -> Result<(), RegistryError> {
        let name = validate_segment(name)?;
        let version = match version.map(str::trim).filter(|v| !v.is_empty()) {
            Some(v) => validate_segment(v)?,
            None => DEFAULT_VERSION,
        };
        let key = processor_key(name, version);

        let mut processors = self.processors.write();
        if processors.contains_key(&key) && !allow_overwrite {
            return Err(RegistryError::AlreadyRegistered {
                name: name.to_owned(),
                version: version.to_owned(),
            });
        }

        let sequence = self.total_registered.fetch_add(1, Ordering::Relaxed) + 1;
        processors.insert(
            key,
            ProcessorEntry {
                name: name.to_owned(),
                version: version.to_owned(),
                processor,
                sequence,
            },
        );

        info!(
            "Registered processor [{}] version [{}] (overwrite: {})",
            name, version, allow_overwrite
        );
        Ok(())
    }

    /// Resolve the default version of a processor.
    pub fn find(&self, name: &str) -> Option<Arc<dyn TaskProcessor>> {
        self.find_versioned(name, None)
    }

    pub fn find_versioned(&self, name: &str, version: Option<&str>) -> Option<Arc<dyn TaskProcessor>> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        let key = processor_key(name, version.unwrap_or(DEFAULT_VERSION));
        self.processors
            .read()
            .get(&key)
            .map(|entry| Arc::clone(&entry.processor))
    }

    /// Every registered version of `name`, ordered by registration.
    pub fn find_all_versions(&self, name: &str) -> Vec<ProcessorEntry> {
        let prefix = format!("{}:", name.trim());
        let mut entries: Vec<ProcessorEntry> = self
            .processors
            .read()
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, entry)| entry.clone())
            .collect();
        entries.sort_by_key(|e| e.sequence);
        entries
    }

    /// Remove the default version of `name`. Returns `true` if one was removed.
    pub fn unregister(&self, name: &str) -> bool {
        self.unregister_versioned(name, None)
    }

    pub fn unregister_versioned(&self, name: &str, version: Option<&str>) -> bool {
        let version = version.unwrap_or(DEFAULT_VERSION);
        let removed = self
            .processors
            .write()
            .remove(&processor_key(name.trim(), version))
            .is_some();
        if removed {
            self.total_unregistered.fetch_add(1, Ordering::Relaxed);
            info!("Unregistered processor [{}] version [{}]", name, version);
        }
        removed
    }

    /// All registrations, ordered by registration.
    pub fn list(&self) -> Vec<ProcessorEntry> {
        let mut entries: Vec<ProcessorEntry> = self.processors.read().values().cloned().collect();
        entries.sort_by_key(|e| e.sequence);
        entries
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active: self.processors.read().len(),
            total_registered: self.total_registered.load(Ordering::Relaxed),
            total_unregistered: self.total_unregistered.load(Ordering::Relaxed),
        }
    }

    /// Drop every registration.
    pub fn clear(&self) {
        self.processors.write().clear();
        info!(
            "Processor registry cleared (registered: {}, unregistered: {})",
            self.total_registered.load(Ordering::Relaxed),
            self.total_unregistered.load(Ordering::Relaxed)
        );
    }
}

fn processor_key(name: &str, version: &str) -> String {
    format!("{name}:{version}")
}

fn validate_segment(raw: &str) -> Result<&str, RegistryError> {
    let trimmed = raw.trim();
    let valid = !trimmed.is_empty()
        && trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(trimmed)
    } else {
        Err(RegistryError::InvalidName(raw.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::NoopProcessor;

    fn noop() -> Arc<dyn TaskProcessor> {
        Arc::new(NoopProcessor)
    }

    #[test]
    fn register_and_find_default_version() {
        let registry = ProcessorRegistry::new();
        registry.register("http.call", noop()).expect("valid name");
        assert!(registry.find("http.call").is_some());
        assert!(registry.find("missing").is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected_unless_overwriting() {
        let registry = ProcessorRegistry::new();
        registry.register("sync", noop()).unwrap();

        assert_eq!(
            registry.register("sync", noop()),
            Err(RegistryError::AlreadyRegistered {
                name: "sync".into(),
                version: DEFAULT_VERSION.into(),
            })
        );

        registry
            .register_versioned("sync", None, noop(), true)
            .expect("overwrite allowed");
        assert_eq!(registry.stats().active, 1);
        assert_eq!(registry.stats().total_registered, 2);
    }

    #[test]
    fn invalid_names_are_rejected() {
        let registry = ProcessorRegistry::new();
        assert!(matches!(
            registry.register("bad name!", noop()),
            Err(RegistryError::InvalidName(_))
        ));
        assert!(matches!(registry.register("   ", noop()), Err(RegistryError::InvalidName(_))));
        assert!(matches!(
            registry.register_versioned("ok", Some("v/1"), noop(), false),
            Err(RegistryError::InvalidName(_))
        ));
    }

    #[test]
    fn versions_are_tracked_independently() {
        let registry = ProcessorRegistry::new();
        registry.register("report", noop()).unwrap();
        registry.register_versioned("report", Some("v2"), noop(), false).unwrap();

        let versions: Vec<String> = registry
            .find_all_versions("report")
            .into_iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(versions, vec!["default", "v2"]);

        assert!(registry.unregister_versioned("report", Some("v2")));
        assert!(!registry.unregister_versioned("report", Some("v2")));
        assert!(registry.find("report").is_some());
        assert_eq!(registry.stats().total_unregistered, 1);
    }
}
