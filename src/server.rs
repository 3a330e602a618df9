//! Mock server - owns the registry, stub store and dispatcher, and serves
//! the gRPC and admin surfaces.

use crate::admin;
use crate::dispatch::Dispatcher;
use crate::grpc;
use crate::registry::DescriptorRegistry;
use crate::schema::SchemaCompiler;
use crate::store::StubStore;
use anyhow::{Context, Result};
use axum::Router;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const DEFAULT_GRPC_ADDR: &str = "0.0.0.0:4770";
pub const DEFAULT_ADMIN_ADDR: &str = "0.0.0.0:4771";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub grpc_addr: SocketAddr,
    pub admin_addr: SocketAddr,
    /// Directory of JSON stubs loaded at boot and on reset.
    pub stub_dir: Option<PathBuf>,
    pub imports: Vec<PathBuf>,
    /// Proto files, descriptor sets, or directories of them.
    pub paths: Vec<PathBuf>,
}

pub struct MockServer {
    config: ServerConfig,
    registry: Arc<DescriptorRegistry>,
    store: Arc<StubStore>,
    dispatcher: Arc<Dispatcher>,
    reload: Mutex<()>,
    shutdown: CancellationToken,
}

impl MockServer {
    pub fn new(config: ServerConfig) -> Self {
        let store = Arc::new(StubStore::new());
        Self {
            config,
            registry: Arc::new(DescriptorRegistry::new()),
            dispatcher: Arc::new(Dispatcher::new(store.clone())),
            store,
            reload: Mutex::new(()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Compile schemas and seed stubs. Any failure here is fatal.
    pub async fn boot(config: ServerConfig) -> Result<Arc<Self>> {
        let server = Arc::new(Self::new(config));
        server.reload().await?;
        if let Some(dir) = &server.config.stub_dir {
            server
                .store
                .load_dir(dir)
                .with_context(|| format!("Failed to load stubs from {}", dir.display()))?;
        }
        Ok(server)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DescriptorRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<StubStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Recompile the configured schemas and reinstall every method handler.
    ///
    /// Reloads run one at a time. The new registry is built off to the side
    /// and swapped in only when the whole compile succeeds; calls already in
    /// flight keep the handlers they started with. Returns the method count.
    pub async fn reload(&self) -> Result<usize> {
        let _guard = self.reload.lock().await;

        let staging = Arc::new(DescriptorRegistry::new());
        let compiler =
            SchemaCompiler::new(staging.clone()).with_cancel(self.shutdown.child_token());
        let imports = self.config.imports.clone();
        let paths = self.config.paths.clone();

        let sets = tokio::task::spawn_blocking(move || compiler.build(&imports, &paths))
            .await
            .context("Schema compile task failed")?
            .context("Failed to compile schemas")?;

        let pool = staging.snapshot();
        self.registry.install(pool.clone());
        let methods = self.dispatcher.install(&pool);
        info!(
            sets = sets.len(),
            files = self.registry.len(),
            methods,
            "Schemas loaded"
        );
        Ok(methods)
    }

    /// Clear stubs and reload them from the stub directory, if configured.
    pub fn reset_stubs(&self) -> Result<usize> {
        self.store.reset(self.config.stub_dir.as_deref())
    }

    /// Stop serving and abort any running reload.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn grpc_router(&self) -> Router {
        Router::new()
            .fallback(grpc::handle)
            .with_state(self.dispatcher.clone())
    }

    /// Serve both surfaces until [`shutdown`](Self::shutdown) is called.
    pub async fn serve(self: Arc<Self>, grpc: TcpListener, admin: TcpListener) -> Result<()> {
        info!(addr = %local_addr(&grpc), "Serving gRPC");
        info!(addr = %local_addr(&admin), "Serving admin API");

        let grpc_shutdown = self.shutdown.clone();
        let admin_shutdown = self.shutdown.clone();
        let grpc_app = self.grpc_router();
        let admin_app = admin::router(self.clone());

        let grpc_task = async move {
            axum::serve(grpc, grpc_app)
                .with_graceful_shutdown(async move { grpc_shutdown.cancelled().await })
                .await
                .context("gRPC server failed")
        };
        let admin_task = async move {
            axum::serve(admin, admin_app)
                .with_graceful_shutdown(async move { admin_shutdown.cancelled().await })
                .await
                .context("Admin server failed")
        };

        let result = tokio::try_join!(grpc_task, admin_task).map(|_| ());
        if let Err(e) = &result {
            error!(error = %format!("{e:#}"), "Server stopped with error");
            self.shutdown();
        }
        result
    }

    /// Boot, bind the configured addresses and serve until Ctrl-C.
    pub async fn run(config: ServerConfig) -> Result<()> {
        let grpc = TcpListener::bind(config.grpc_addr)
            .await
            .with_context(|| format!("Failed to bind gRPC address {}", config.grpc_addr))?;
        let admin = TcpListener::bind(config.admin_addr)
            .await
            .with_context(|| format!("Failed to bind admin address {}", config.admin_addr))?;

        let server = Self::boot(config).await?;

        let signal = server.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutting down");
                signal.shutdown();
            }
        });

        server.serve(grpc, admin).await
    }
}

fn local_addr(listener: &TcpListener) -> String {
    listener
        .local_addr()
        .map_or_else(|_| "unknown".to_string(), |addr| addr.to_string())
}
