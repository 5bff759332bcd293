//! The module registry.
//!
//! One registry lives per process, owned by the engine and handed to it at
//! construction. Registration happens at startup (or on hot reload);
//! executions capture an immutable [`RegistrySnapshot`] when they begin,
//! so a reload mid-flight never changes a running execution's view.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aster_core::ModuleId;
use parking_lot::RwLock;

use crate::error::RegistryError;
use crate::handler::ModuleHandler;
use crate::lint::{has_blocking, lint};
use crate::metadata::ModuleMetadata;

/// Three-valued connection compatibility verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectVerdict {
    /// The connection is allowed.
    Ok,
    /// Both ports exist but their types (or allowlists) are incompatible.
    IncompatibleType,
    /// A named port does not exist on its module.
    PortNotFound,
}

/// A registered module: metadata plus its handler(s).
pub struct RegisteredModule {
    /// The module's metadata literal.
    pub metadata: ModuleMetadata,
    /// Primary handler (per routing preference).
    pub handler: Arc<dyn ModuleHandler>,
    /// Optional fallback handler, used when the primary fails to route.
    pub fallback: Option<Arc<dyn ModuleHandler>>,
}

impl std::fmt::Debug for RegisteredModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredModule")
            .field("module_id", &self.metadata.module_id)
            .field("has_fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Immutable registry view captured at execution start.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    modules: Arc<HashMap<ModuleId, Arc<RegisteredModule>>>,
    /// The catalog version this snapshot was taken at.
    pub catalog_version: u64,
}

impl RegistrySnapshot {
    /// Look up a module.
    pub fn get(&self, id: &ModuleId) -> Result<Arc<RegisteredModule>, RegistryError> {
        self.modules
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    /// Look up metadata only.
    pub fn metadata(&self, id: &ModuleId) -> Result<ModuleMetadata, RegistryError> {
        self.get(id).map(|m| m.metadata.clone())
    }

    /// Whether a module exists.
    #[must_use]
    pub fn contains(&self, id: &ModuleId) -> bool {
        self.modules.contains_key(id)
    }

    /// All metadata entries, sorted by module id.
    #[must_use]
    pub fn all_metadata(&self) -> Vec<ModuleMetadata> {
        let mut entries: Vec<ModuleMetadata> =
            self.modules.values().map(|m| m.metadata.clone()).collect();
        entries.sort_by(|a, b| a.module_id.cmp(&b.module_id));
        entries
    }

    /// Modules that may start a workflow.
    #[must_use]
    pub fn startable(&self) -> Vec<ModuleId> {
        let mut ids: Vec<ModuleId> = self
            .modules
            .values()
            .filter(|m| m.metadata.effective_can_be_start())
            .map(|m| m.metadata.module_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Decide whether `from_id.from_port → to_id.to_port` is a legal edge.
    pub fn can_connect(
        &self,
        from_id: &ModuleId,
        from_port: &str,
        to_id: &ModuleId,
        to_port: &str,
    ) -> Result<ConnectVerdict, RegistryError> {
        let from = self.get(from_id)?;
        let to = self.get(to_id)?;

        let Some(source) = from.metadata.output_port(from_port) else {
            return Ok(ConnectVerdict::PortNotFound);
        };
        let Some(target) = to.metadata.input_port(to_port) else {
            return Ok(ConnectVerdict::PortNotFound);
        };

        if !from.metadata.allows_target(to_id) || !to.metadata.accepts_source(from_id) {
            return Ok(ConnectVerdict::IncompatibleType);
        }
        if !target.data_type.accepts(source.data_type) {
            return Ok(ConnectVerdict::IncompatibleType);
        }
        Ok(ConnectVerdict::Ok)
    }
}

/// The mutable process-wide registry.
pub struct ModuleRegistry {
    modules: RwLock<HashMap<ModuleId, Arc<RegisteredModule>>>,
    catalog_version: AtomicU64,
}

impl ModuleRegistry {
    /// An empty registry at catalog version 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
            catalog_version: AtomicU64::new(1),
        }
    }

    /// Register a module.
    ///
    /// Re-registering identical metadata is a no-op (the handler is
    /// refreshed); colliding with different metadata fails. Blocking lint
    /// findings fail registration.
    pub fn register(
        &self,
        metadata: ModuleMetadata,
        handler: Arc<dyn ModuleHandler>,
    ) -> Result<(), RegistryError> {
        self.register_with_fallback(metadata, handler, None)
    }

    /// Register a module with a fallback handler.
    ///
    /// The primary handler reflects the routing preference (plugin-first
    /// or legacy-first); the fallback is consulted by the invoker when the
    /// primary is unavailable or fails to route.
    pub fn register_with_fallback(
        &self,
        metadata: ModuleMetadata,
        handler: Arc<dyn ModuleHandler>,
        fallback: Option<Arc<dyn ModuleHandler>>,
    ) -> Result<(), RegistryError> {
        let findings = lint(&metadata);
        if has_blocking(&findings) {
            return Err(RegistryError::Lint {
                module: metadata.module_id.clone(),
                findings,
            });
        }

        let mut modules = self.modules.write();
        if let Some(existing) = modules.get(&metadata.module_id) {
            if existing.metadata != metadata {
                return Err(RegistryError::Conflict(metadata.module_id.clone()));
            }
        }
        tracing::debug!(module = %metadata.module_id, "registering module");
        modules.insert(
            metadata.module_id.clone(),
            Arc::new(RegisteredModule {
                metadata,
                handler,
                fallback,
            }),
        );
        Ok(())
    }

    /// Look up a module.
    pub fn get(&self, id: &ModuleId) -> Result<Arc<RegisteredModule>, RegistryError> {
        self.modules
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.clone()))
    }

    /// Look up metadata only.
    pub fn metadata(&self, id: &ModuleId) -> Result<ModuleMetadata, RegistryError> {
        self.get(id).map(|m| m.metadata.clone())
    }

    /// Look up the handler for a module.
    pub fn get_handler(&self, id: &ModuleId) -> Result<Arc<dyn ModuleHandler>, RegistryError> {
        self.get(id).map(|m| m.handler.clone())
    }

    /// Number of registered modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }

    /// The current catalog version; bumped by [`Self::bump_catalog_version`].
    #[must_use]
    pub fn catalog_version(&self) -> u64 {
        self.catalog_version.load(Ordering::Acquire)
    }

    /// Bump the catalog version after a reload re-registration pass.
    pub fn bump_catalog_version(&self) -> u64 {
        self.catalog_version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Remove every registration (reload preparation). Snapshots taken
    /// earlier are unaffected.
    pub fn clear(&self) {
        self.modules.write().clear();
    }

    /// Capture an immutable snapshot of the current state.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            modules: Arc::new(self.modules.read().clone()),
            catalog_version: self.catalog_version(),
        }
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("count", &self.len())
            .field("catalog_version", &self.catalog_version())
            .finish()
    }
}
