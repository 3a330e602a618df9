//! Schema compiler - turns proto sources and descriptor sets into registered descriptors.

use crate::registry::{self, DescriptorRegistry, RegistryError};
use crate::wellknown::FallbackResolver;
use prost::Message;
use prost_reflect::DescriptorPool;
use prost_types::FileDescriptorSet;
use protox::Compiler;
use protox::file::{ChainFileResolver, IncludeFileResolver};
use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use walkdir::WalkDir;

pub const PROTO_EXT: &str = "proto";
pub const DESCRIPTOR_EXTS: &[&str] = &["pb", "protoset"];

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to resolve path {path}: {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to stat path {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unsupported file type: {0}")]
    UnsupportedFileType(PathBuf),
    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("failed to read descriptor {path}: {source}")]
    ReadDescriptor {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode descriptor {path}: {source}")]
    DecodeDescriptor {
        path: PathBuf,
        #[source]
        source: prost::DecodeError,
    },
    #[error("failed to resolve imports {missing:?} of {path}: {source}")]
    Fallback {
        path: PathBuf,
        missing: Vec<String>,
        #[source]
        source: Box<protox::Error>,
    },
    #[error("failed to compile {files:?}: {source}")]
    Compile {
        files: Vec<String>,
        #[source]
        source: Box<protox::Error>,
    },
    #[error(transparent)]
    Register(#[from] RegistryError),
    #[error("schema build cancelled")]
    Cancelled,
}

/// Deduplicated inputs for one compile pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configure {
    imports: Vec<PathBuf>,
    protos: Vec<String>,
    descriptors: Vec<PathBuf>,
}

impl Configure {
    /// Minimal set of import roots
    pub fn imports(&self) -> &[PathBuf] {
        &self.imports
    }

    /// Proto sources, as names relative to an import root
    pub fn protos(&self) -> &[String] {
        &self.protos
    }

    /// Absolute paths of precompiled descriptor sets
    pub fn descriptors(&self) -> &[PathBuf] {
        &self.descriptors
    }
}

/// Compiles schema inputs and registers them into a [`DescriptorRegistry`].
pub struct SchemaCompiler {
    registry: Arc<DescriptorRegistry>,
    cancel: CancellationToken,
}

impl SchemaCompiler {
    pub fn new(registry: Arc<DescriptorRegistry>) -> Self {
        Self {
            registry,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort the build with [`SchemaError::Cancelled`] once `token` fires.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Compile `paths` (files or directories) using `imports` as extra roots.
    ///
    /// Returns one set per descriptor-set input, plus one aggregate set for
    /// all proto sources if there were any. The registry is only updated
    /// when every input compiled; on error it keeps its previous contents.
    pub fn build(
        &self,
        imports: &[PathBuf],
        paths: &[PathBuf],
    ) -> Result<Vec<FileDescriptorSet>, SchemaError> {
        let configure = configure(imports, paths, &self.cancel)?;

        debug!(
            imports = ?configure.imports,
            protos = ?configure.protos,
            descriptors = ?configure.descriptors,
            "Resolved schema inputs"
        );

        let mut pool = self.registry.snapshot();
        let sets = compile(&configure, &mut pool, &self.cancel)?;

        self.check_cancelled()?;
        self.registry.install(pool);
        Ok(sets)
    }

    fn check_cancelled(&self) -> Result<(), SchemaError> {
        if self.cancel.is_cancelled() {
            return Err(SchemaError::Cancelled);
        }
        Ok(())
    }
}

/// Normalize and classify the inputs of one compile pass.
pub fn configure(
    imports: &[PathBuf],
    paths: &[PathBuf],
    cancel: &CancellationToken,
) -> Result<Configure, SchemaError> {
    let imports = imports
        .iter()
        .map(|p| absolute(p))
        .collect::<Result<Vec<_>, _>>()?;
    let paths = uniq(
        paths
            .iter()
            .map(|p| absolute(p))
            .collect::<Result<Vec<_>, _>>()?,
    );

    let mut processor = Processor::new(find_minimal_paths(&imports), cancel);
    processor.process(&paths)?;
    Ok(processor.finish())
}

/// Drop every path that lives under another path of the list.
///
/// Candidates are visited shortest first; a candidate is kept only when no
/// already kept path is an ancestor of it (or equal to it).
pub fn find_minimal_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut sorted = paths.to_vec();
    sorted.sort_by_key(|p| p.as_os_str().len());

    let mut result: Vec<PathBuf> = Vec::with_capacity(sorted.len());
    for path in sorted {
        if !result.iter().any(|existing| path.starts_with(existing)) {
            result.push(path);
        }
    }
    result
}

fn absolute(path: &Path) -> Result<PathBuf, SchemaError> {
    std::path::absolute(path).map_err(|source| SchemaError::Resolve {
        path: path.to_path_buf(),
        source,
    })
}

fn uniq<T: Clone + Eq + std::hash::Hash>(items: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Proto,
    Descriptor,
}

fn classify(path: &Path) -> Option<FileKind> {
    let ext = path.extension()?.to_str()?;
    if ext == PROTO_EXT {
        Some(FileKind::Proto)
    } else if DESCRIPTOR_EXTS.contains(&ext) {
        Some(FileKind::Descriptor)
    } else {
        None
    }
}

struct Processor<'a> {
    imports: Vec<PathBuf>,
    protos: Vec<PathBuf>,
    descriptors: Vec<PathBuf>,
    seen_dirs: HashSet<PathBuf>,
    seen_files: HashSet<PathBuf>,
    cancel: &'a CancellationToken,
}

impl<'a> Processor<'a> {
    fn new(imports: Vec<PathBuf>, cancel: &'a CancellationToken) -> Self {
        Self {
            imports,
            protos: Vec::new(),
            descriptors: Vec::new(),
            seen_dirs: HashSet::new(),
            seen_files: HashSet::new(),
            cancel,
        }
    }

    fn process(&mut self, paths: &[PathBuf]) -> Result<(), SchemaError> {
        for path in paths {
            if self.cancel.is_cancelled() {
                return Err(SchemaError::Cancelled);
            }

            debug!(path = %path.display(), "Processing path");

            let meta = std::fs::metadata(path).map_err(|source| SchemaError::Stat {
                path: path.clone(),
                source,
            })?;

            if meta.is_dir() {
                self.process_directory(path)?;
            } else {
                self.process_file(path)?;
            }
        }
        Ok(())
    }

    fn process_directory(&mut self, dir: &Path) -> Result<(), SchemaError> {
        self.add_import(dir);

        for entry in WalkDir::new(dir).follow_links(true) {
            if self.cancel.is_cancelled() {
                return Err(SchemaError::Cancelled);
            }

            let entry = entry?;
            if entry.file_type().is_dir() {
                continue;
            }

            match classify(entry.path()) {
                Some(kind) => self.add_file(entry.path(), kind),
                None => debug!(file = %entry.path().display(), "Skipping unsupported file type"),
            }
        }
        Ok(())
    }

    fn process_file(&mut self, file: &Path) -> Result<(), SchemaError> {
        let kind =
            classify(file).ok_or_else(|| SchemaError::UnsupportedFileType(file.to_path_buf()))?;
        if let Some(parent) = file.parent() {
            self.add_import(parent);
        }
        self.add_file(file, kind);
        Ok(())
    }

    fn add_import(&mut self, dir: &Path) {
        if !self.seen_dirs.insert(dir.to_path_buf()) {
            return;
        }
        let before = self.imports.len();
        self.imports.push(dir.to_path_buf());
        self.imports = find_minimal_paths(&self.imports);
        if self.imports.len() > before {
            debug!(import = %dir.display(), "Added import path");
        }
    }

    fn add_file(&mut self, file: &Path, kind: FileKind) {
        if !self.seen_files.insert(file.to_path_buf()) {
            debug!(file = %file.display(), "File already processed");
            return;
        }
        match kind {
            FileKind::Proto => self.protos.push(file.to_path_buf()),
            FileKind::Descriptor => self.descriptors.push(file.to_path_buf()),
        }
    }

    /// Proto names are resolved against the final import list, after every
    /// input had a chance to widen it.
    fn finish(self) -> Configure {
        let imports = uniq(self.imports);
        let protos = uniq(
            self.protos
                .iter()
                .map(|file| proto_name(file, &imports))
                .collect(),
        );
        Configure {
            imports,
            protos,
            descriptors: uniq(self.descriptors),
        }
    }
}

/// Name of `file` relative to the deepest import root containing it.
fn proto_name(file: &Path, imports: &[PathBuf]) -> String {
    let relative = imports
        .iter()
        .filter_map(|import| file.strip_prefix(import).ok())
        .min_by_key(|rel| rel.as_os_str().len())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| file.file_name().map(PathBuf::from).unwrap_or_default());

    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn compile(
    configure: &Configure,
    pool: &mut DescriptorPool,
    cancel: &CancellationToken,
) -> Result<Vec<FileDescriptorSet>, SchemaError> {
    let mut results = Vec::with_capacity(configure.descriptors.len() + 1);

    for path in &configure.descriptors {
        if cancel.is_cancelled() {
            return Err(SchemaError::Cancelled);
        }

        let bytes = std::fs::read(path).map_err(|source| SchemaError::ReadDescriptor {
            path: path.clone(),
            source,
        })?;
        let set = FileDescriptorSet::decode(bytes.as_slice()).map_err(|source| {
            SchemaError::DecodeDescriptor {
                path: path.clone(),
                source,
            }
        })?;

        resolve_missing_imports(path, &set, pool)?;
        let added = registry::register_into(pool, set.clone())?;
        info!(path = %path.display(), files = set.file.len(), added, "Loaded descriptor set");
        results.push(set);
    }

    if configure.protos.is_empty() {
        return Ok(results);
    }

    if cancel.is_cancelled() {
        return Err(SchemaError::Cancelled);
    }

    let mut resolver = ChainFileResolver::new();
    for import in &configure.imports {
        resolver.add(IncludeFileResolver::new(import.clone()));
    }
    resolver.add(FallbackResolver::new());

    let mut compiler = Compiler::with_file_resolver(resolver);
    compiler.include_imports(true);
    compiler
        .open_files(&configure.protos)
        .map_err(|source| SchemaError::Compile {
            files: configure.protos.clone(),
            source: Box::new(source),
        })?;

    let set = compiler.file_descriptor_set();
    let added = registry::register_into(pool, set.clone())?;
    info!(
        protos = configure.protos.len(),
        files = set.file.len(),
        added,
        "Compiled proto sources"
    );
    results.push(set);

    Ok(results)
}

/// Descriptor sets do not always carry their well-known imports. Pull any
/// import that is neither in the set nor in the pool from the fallback.
fn resolve_missing_imports(
    path: &Path,
    set: &FileDescriptorSet,
    pool: &mut DescriptorPool,
) -> Result<(), SchemaError> {
    let known: HashSet<&str> = set.file.iter().map(|f| f.name()).collect();
    let missing: Vec<String> = uniq(
        set.file
            .iter()
            .flat_map(|f| f.dependency.iter())
            .filter(|dep| !known.contains(dep.as_str()) && pool.get_file_by_name(dep).is_none())
            .cloned()
            .collect(),
    );

    if missing.is_empty() {
        return Ok(());
    }

    debug!(path = %path.display(), missing = ?missing, "Resolving imports from fallback");
    let extra = FallbackResolver::compile(missing.iter().map(String::as_str)).map_err(|source| {
        SchemaError::Fallback {
            path: path.to_path_buf(),
            missing: missing.clone(),
            source: Box::new(source),
        }
    })?;
    registry::register_into(pool, extra)?;
    Ok(())
}
