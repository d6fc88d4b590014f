//! Namespace registry cache.
//!
//! A [`RegistryCache`] maps namespace names to their configuration
//! directories and memoizes the built [`RuleRegistry`]. `load` builds at
//! most once; `reparse` forces a rebuild and republishes atomically with a
//! bumped version. A failed rebuild keeps the previously published registry
//! in place, so readers never observe a partial namespace.

use crate::error::{CompileError, CompileResult};
use crate::extensions::ExtensionSet;
use crate::registry::{RegistryBuilder, RuleRegistry};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use log::debug;

struct CacheEntry {
    dir: PathBuf,
    extensions: ExtensionSet,
    registry: Option<Arc<RuleRegistry>>,
    version: u64,
}

/// Memoized per-namespace registries.
#[derive(Default)]
pub struct RegistryCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl RegistryCache {
    /// An empty cache with no namespaces registered.
    #[must_use]
    pub fn new() -> Self {
        RegistryCache::default()
    }

    /// Register a namespace backed by a configuration directory, using the
    /// built-in extension sections.
    pub fn register(&self, namespace: impl Into<String>, dir: impl Into<PathBuf>) {
        self.register_with_extensions(namespace, dir, ExtensionSet::with_builtins());
    }

    /// Register a namespace with a custom extension set.
    pub fn register_with_extensions(
        &self,
        namespace: impl Into<String>,
        dir: impl Into<PathBuf>,
        extensions: ExtensionSet,
    ) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            namespace.into(),
            CacheEntry {
                dir: dir.into(),
                extensions,
                registry: None,
                version: 0,
            },
        );
    }

    /// Fetch the namespace's registry, building it on first use.
    ///
    /// # Errors
    ///
    /// [`CompileError::UnknownNamespace`] for unregistered names, or any
    /// compile error from the first build.
    pub fn load(&self, namespace: &str) -> CompileResult<Arc<RuleRegistry>> {
        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            match entries.get(namespace) {
                Some(entry) => {
                    if let Some(registry) = &entry.registry {
                        return Ok(Arc::clone(registry));
                    }
                },
                None => {
                    return Err(CompileError::UnknownNamespace(namespace.to_string()));
                },
            }
        }
        self.rebuild(namespace, false)
    }

    /// Force a rebuild and atomically republish with a bumped version.
    ///
    /// # Errors
    ///
    /// [`CompileError::UnknownNamespace`] or any compile error; on failure
    /// the previously published registry stays in place.
    pub fn reparse(&self, namespace: &str) -> CompileResult<Arc<RuleRegistry>> {
        self.rebuild(namespace, true)
    }

    fn rebuild(&self, namespace: &str, force: bool) -> CompileResult<Arc<RuleRegistry>> {
        // Build under the write lock so a republish is a single step and
        // concurrent loaders see either the old or the new registry.
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = entries.get_mut(namespace) else {
            return Err(CompileError::UnknownNamespace(namespace.to_string()));
        };
        if !force {
            if let Some(registry) = &entry.registry {
                // Another thread built it while we waited for the lock.
                return Ok(Arc::clone(registry));
            }
        }
        let version = entry.version + 1;
        let mut builder =
            RegistryBuilder::new(namespace).with_extensions(entry.extensions.clone());
        builder.load_directory(&entry.dir)?;
        let registry = Arc::new(builder.build(version)?);
        entry.registry = Some(Arc::clone(&registry));
        entry.version = version;
        debug!("namespace '{namespace}' published at v{version}");
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_namespace() {
        let cache = RegistryCache::new();
        assert!(matches!(
            cache.load("missing"),
            Err(CompileError::UnknownNamespace(_))
        ));
    }
}
