//! Command-line interface for grpcmock.

use crate::dispatch::Dispatcher;
use crate::registry::DescriptorRegistry;
use crate::schema::SchemaCompiler;
use crate::server::{DEFAULT_ADMIN_ADDR, DEFAULT_GRPC_ADDR, MockServer, ServerConfig};
use crate::store::StubStore;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "grpcmock")]
#[command(about = "Dynamic gRPC mock server - serve any proto with JSON stubs")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile schemas and serve the gRPC and admin APIs
    Serve {
        #[command(flatten)]
        schema: SchemaArgs,
        /// gRPC listen address
        #[arg(long, env = "GRPCMOCK_GRPC_ADDR", default_value = DEFAULT_GRPC_ADDR)]
        grpc_addr: SocketAddr,
        /// Admin HTTP listen address
        #[arg(long, env = "GRPCMOCK_ADMIN_ADDR", default_value = DEFAULT_ADMIN_ADDR)]
        admin_addr: SocketAddr,
        /// Directory of JSON stub files to load
        #[arg(long, env = "GRPCMOCK_STUB_DIR")]
        stub: Option<PathBuf>,
    },

    /// Compile schemas and list the methods they declare
    Check {
        #[command(flatten)]
        schema: SchemaArgs,
    },
}

#[derive(Args)]
struct SchemaArgs {
    /// Extra import directories (repeatable or comma separated)
    #[arg(short = 'I', long, env = "GRPCMOCK_IMPORTS", value_delimiter = ',')]
    imports: Vec<PathBuf>,
    /// Proto files, descriptor sets (.pb, .protoset) or directories
    #[arg(required = true, num_args = 1..)]
    paths: Vec<PathBuf>,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Serve {
                schema,
                grpc_addr,
                admin_addr,
                stub,
            } => {
                info!(paths = ?schema.paths, "Starting mock server");
                MockServer::run(ServerConfig {
                    grpc_addr,
                    admin_addr,
                    stub_dir: stub,
                    imports: schema.imports,
                    paths: schema.paths,
                })
                .await
            }

            Commands::Check { schema } => {
                let registry = Arc::new(DescriptorRegistry::new());
                let compiler = SchemaCompiler::new(registry.clone());
                let (imports, paths) = (schema.imports, schema.paths);
                tokio::task::spawn_blocking(move || compiler.build(&imports, &paths))
                    .await
                    .context("Schema compile task failed")?
                    .context("Failed to compile schemas")?;

                let dispatcher = Dispatcher::new(Arc::new(StubStore::new()));
                dispatcher.install(&registry.snapshot());
                let methods = dispatcher.methods();
                if methods.is_empty() {
                    println!("No services found");
                    return Ok(());
                }

                println!("Methods ({}):", methods.len());
                for method in methods {
                    println!(
                        "  {} [{}] {} -> {}",
                        method.path, method.kind, method.input, method.output
                    );
                }
                Ok(())
            }
        }
    }
}
