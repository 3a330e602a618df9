//! Embedded well-known schemas, served when an import is missing on disk.

use protox::file::{File, FileResolver, GoogleFileResolver};
use protox::{Compiler, Error};
use prost_types::FileDescriptorSet;

const GOOGLEAPIS: &[(&str, &str)] = &[
    (
        "google/api/annotations.proto",
        include_str!("../protos/google/api/annotations.proto"),
    ),
    (
        "google/api/http.proto",
        include_str!("../protos/google/api/http.proto"),
    ),
    (
        "google/rpc/code.proto",
        include_str!("../protos/google/rpc/code.proto"),
    ),
    (
        "google/rpc/status.proto",
        include_str!("../protos/google/rpc/status.proto"),
    ),
];

/// Resolver for `google/protobuf/*` plus a handful of googleapis files.
///
/// Meant to sit last in a resolver chain so that anything the caller vendors
/// on an import path wins.
pub struct FallbackResolver {
    google: GoogleFileResolver,
}

impl Default for FallbackResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl FallbackResolver {
    pub fn new() -> Self {
        Self {
            google: GoogleFileResolver::new(),
        }
    }

    /// Compile the named fallback files (and their imports) into a set.
    pub fn compile<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<FileDescriptorSet, Error> {
        let mut compiler = Compiler::with_file_resolver(FallbackResolver::new());
        compiler.include_imports(true);
        for name in names {
            compiler.open_file(name)?;
        }
        Ok(compiler.file_descriptor_set())
    }
}

impl FileResolver for FallbackResolver {
    fn open_file(&self, name: &str) -> Result<File, Error> {
        match GOOGLEAPIS.iter().find(|(path, _)| *path == name) {
            Some((_, source)) => File::from_source(name, source),
            None => self.google.open_file(name),
        }
    }
}
