//! Dynamic gRPC mock server.
//!
//! Proto files (or precompiled descriptor sets) are compiled at startup into
//! descriptors; every declared method is then served by a generic handler
//! that decodes the request with the descriptor alone, looks up a matching
//! JSON stub and encodes the canned response.

pub mod admin;
pub mod cli;
pub mod codec;
pub mod convert;
pub mod dispatch;
pub mod grpc;
pub mod matcher;
pub mod registry;
pub mod schema;
pub mod server;
pub mod store;
pub mod stub;
pub mod wellknown;

#[cfg(test)]
pub(crate) mod test_support {
    use crate::wellknown::FallbackResolver;
    use prost_reflect::DescriptorPool;
    use protox::Compiler;
    use protox::file::{ChainFileResolver, IncludeFileResolver};

    /// Compile a single proto source (plus well-known imports) into a pool.
    pub fn pool_from_source(name: &str, source: &str) -> DescriptorPool {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join(name), source).unwrap();

        let mut resolver = ChainFileResolver::new();
        resolver.add(IncludeFileResolver::new(dir.path().to_path_buf()));
        resolver.add(FallbackResolver::new());
        let mut compiler = Compiler::with_file_resolver(resolver);
        compiler.include_imports(true);
        compiler.open_file(name).unwrap();
        DescriptorPool::from_file_descriptor_set(compiler.file_descriptor_set()).unwrap()
    }
}
