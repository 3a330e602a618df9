//! Descriptor registry - process-wide store of compiled schema descriptors.

use prost_reflect::{DescriptorPool, MessageDescriptor, ServiceDescriptor};
use prost_types::FileDescriptorSet;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to register {files:?}: {source}")]
    Register {
        files: Vec<String>,
        #[source]
        source: prost_reflect::DescriptorError,
    },
}

/// Shared registry of schema files, messages and services.
///
/// Readers take a [`DescriptorPool`] snapshot (a cheap, reference-counted
/// clone); writers build a new pool off to the side and [`install`] it in
/// one step, so callers never observe a half-registered file set.
///
/// [`install`]: DescriptorRegistry::install
#[derive(Debug, Default)]
pub struct DescriptorRegistry {
    pool: RwLock<DescriptorPool>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current pool, for lookups or as the base of a rebuild.
    pub fn snapshot(&self) -> DescriptorPool {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the current pool with a fully built one.
    pub fn install(&self, pool: DescriptorPool) {
        *self.pool.write().unwrap_or_else(PoisonError::into_inner) = pool;
    }

    /// Drop every registered file. Only used on a full reboot.
    pub fn clear(&self) {
        self.install(DescriptorPool::new());
    }

    pub fn contains_file(&self, name: &str) -> bool {
        self.snapshot().get_file_by_name(name).is_some()
    }

    pub fn message(&self, full_name: &str) -> Option<MessageDescriptor> {
        self.snapshot().get_message_by_name(full_name)
    }

    pub fn service(&self, full_name: &str) -> Option<ServiceDescriptor> {
        self.snapshot().get_service_by_name(full_name)
    }

    /// Number of registered files
    pub fn len(&self) -> usize {
        self.snapshot().files().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Add every file of `set` that `pool` does not know yet.
///
/// A file path is registered at most once. Files already present are
/// skipped with a warning, which keeps overlapping import graphs from
/// failing the whole set. Returns the number of newly added files.
pub fn register_into(
    pool: &mut DescriptorPool,
    set: FileDescriptorSet,
) -> Result<usize, RegistryError> {
    let mut fresh = Vec::with_capacity(set.file.len());
    for file in set.file {
        let name = file.name().to_string();
        if pool.get_file_by_name(&name).is_some() {
            warn!(name = %name, "File already registered");
            continue;
        }
        if fresh
            .iter()
            .any(|f: &prost_types::FileDescriptorProto| f.name() == name)
        {
            continue;
        }
        fresh.push(file);
    }

    if fresh.is_empty() {
        return Ok(0);
    }

    let files: Vec<String> = fresh.iter().map(|f| f.name().to_string()).collect();
    let added = fresh.len();
    pool.add_file_descriptor_set(FileDescriptorSet { file: fresh })
        .map_err(|source| RegistryError::Register {
            files: files.clone(),
            source,
        })?;

    debug!(files = ?files, "Registered schema files");
    Ok(added)
}
