//! Export registry.
//!
//! Maps export names to [`Export`] records. All access goes through
//! [`ExportRegistry`], which owns the locking discipline:
//!
//! - `add` and `remove` take the write lock. `add` keeps it across the backend
//!   factory call so two registrations of one name cannot both succeed.
//! - `lookup` and `list` take the read lock only long enough to clone `Arc`s;
//!   callers never iterate while holding it.
//!
//! Sessions hold an `Arc<Export>` for their whole lifetime. Removing an
//! export marks it retired: the bound sessions keep their connection but the
//! transmission phase refuses further commands with `NBD_ESHUTDOWN`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::backend::Backend;
use crate::error::{BackendResult, RegistryError};

/// A named block-storage region bound to a backend.
pub struct Export {
    name: String,
    description: String,
    backend: Arc<dyn Backend>,
    size_bytes: u64,
    retired: AtomicBool,
}

impl Export {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Size in bytes, queried from the backend at registration.
    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    /// Whether the export has been removed from its registry.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Export {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Export")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("backend", &self.backend.to_string())
            .field("size_bytes", &self.size_bytes)
            .field("retired", &self.is_retired())
            .finish()
    }
}

fn validate_name(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() || name.chars().any(char::is_whitespace) {
        return Err(RegistryError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Concurrency-safe set of exports, keyed by name.
#[derive(Default)]
pub struct ExportRegistry {
    exports: RwLock<HashMap<String, Arc<Export>>>,
}

impl ExportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an export.
    ///
    /// `factory` is invoked exactly once, after the name has been validated
    /// and found free, and the export only becomes visible once the backend
    /// is built and its size known.
    pub async fn add<F>(
        &self,
        name: &str,
        description: &str,
        factory: F,
    ) -> Result<Arc<Export>, RegistryError>
    where
        F: FnOnce() -> BackendResult<Arc<dyn Backend>>,
    {
        validate_name(name)?;

        let mut exports = self.exports.write().await;
        if exports.contains_key(name) {
            return Err(RegistryError::DuplicateExport {
                name: name.to_string(),
            });
        }

        let construction = |source| RegistryError::BackendConstruction {
            name: name.to_string(),
            source,
        };
        let backend = factory().map_err(construction)?;
        let size_bytes = backend.size().await.map_err(construction)?;

        let export = Arc::new(Export {
            name: name.to_string(),
            description: description.to_string(),
            backend,
            size_bytes,
            retired: AtomicBool::new(false),
        });
        exports.insert(name.to_string(), Arc::clone(&export));

        info!(
            export = name,
            size_bytes,
            backend = %export.backend,
            "added export"
        );
        Ok(export)
    }

    /// Unregister an export and retire it.
    ///
    /// The backend is synced before returning; a sync failure is logged but
    /// does not undo the removal.
    pub async fn remove(&self, name: &str) -> Result<Arc<Export>, RegistryError> {
        let export = self
            .exports
            .write()
            .await
            .remove(name)
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
            })?;
        export.retired.store(true, Ordering::Release);

        if let Err(e) = export.backend.sync().await {
            warn!(export = name, error = %e, "failed to sync removed export");
        }
        info!(export = name, "removed export");
        Ok(export)
    }

    /// Check that `name` is valid and not registered yet.
    ///
    /// Only a hint for callers that want to skip expensive backend
    /// construction; [`add`](Self::add) re-checks under its lock.
    pub async fn check_available(&self, name: &str) -> Result<(), RegistryError> {
        validate_name(name)?;
        if self.exports.read().await.contains_key(name) {
            return Err(RegistryError::DuplicateExport {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    pub async fn lookup(&self, name: &str) -> Result<Arc<Export>, RegistryError> {
        self.exports
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
            })
    }

    /// Snapshot of all exports, sorted by name.
    pub async fn list(&self) -> Vec<Arc<Export>> {
        let mut exports: Vec<_> = self.exports.read().await.values().cloned().collect();
        exports.sort_by(|a, b| a.name.cmp(&b.name));
        exports
    }

    pub async fn len(&self) -> usize {
        self.exports.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.exports.read().await.is_empty()
    }
}
