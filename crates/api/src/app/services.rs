//! Store, queue and orchestrator wiring for the HTTP surface.

use std::sync::Arc;

use tokio::runtime::Handle;

use shardmap_infra::{
    EntityStore, InMemoryEntityStore, InMemoryTaskQueue, MapperConfig, NamespaceSource, NoopProcessor,
    Orchestrator, ProcessorRegistry, StaticNamespaceSource, TaskRunner, TaskRunnerConfig, TaskRunnerHandle,
};

#[cfg(feature = "postgres")]
use shardmap_infra::store::PostgresEntityStore;
#[cfg(feature = "postgres")]
use sqlx::PgPool;

/// Everything the routes need, shared behind an `Arc`.
pub struct AppServices {
    pub orchestrator: Orchestrator,
    /// Queue drained by the embedded task runner.
    pub queue: Arc<InMemoryTaskQueue>,
}

impl AppServices {
    /// In-memory store and queue; used by tests and the default binary.
    pub fn in_memory(
        config: MapperConfig,
        source: impl NamespaceSource + 'static,
        processors: ProcessorRegistry,
    ) -> Self {
        Self::with_store(config, Arc::new(InMemoryEntityStore::new()), source, processors)
    }

    pub fn with_store(
        config: MapperConfig,
        store: Arc<dyn EntityStore>,
        source: impl NamespaceSource + 'static,
        processors: ProcessorRegistry,
    ) -> Self {
        let queue = Arc::new(InMemoryTaskQueue::new());
        let orchestrator = Orchestrator::builder(config, store, queue.clone())
            .source(source)
            .processors(processors)
            .build();
        Self { orchestrator, queue }
    }

    /// Start a background thread delivering queued tasks to the orchestrator.
    ///
    /// Handlers run inside `runtime` so that stores bridging to async drivers
    /// can block on it from the runner thread.
    pub fn spawn_runner(&self, runtime: Handle) -> std::io::Result<TaskRunnerHandle> {
        let retry = self.orchestrator.config().retry.clone();
        let mut runner = TaskRunner::new(self.queue.clone(), self.orchestrator.datastore().clone(), retry);
        for (path, route) in self.orchestrator.routes() {
            let orchestrator = self.orchestrator.clone();
            let runtime = runtime.clone();
            runner.register(path, move |delivery| {
                let _guard = runtime.enter();
                orchestrator.dispatch(route, delivery)
            });
        }
        runner.spawn(TaskRunnerConfig::default().with_name("shardmap-runner"))
    }
}

/// Processors built into the binary.
pub fn default_processors() -> ProcessorRegistry {
    ProcessorRegistry::new().with("noop", NoopProcessor)
}

/// Namespaces served by the static source, from a comma separated list.
pub fn static_source(list: &str) -> StaticNamespaceSource {
    StaticNamespaceSource::new(list.split(',').map(str::trim).filter(|s| !s.is_empty()))
}

/// Build services from the environment.
///
/// `USE_POSTGRES=true` selects the Postgres entity store (requires the
/// `postgres` feature and `DATABASE_URL`); otherwise everything is in memory.
/// `SHARDMAP_NAMESPACES` lists the namespaces of the static source.
pub async fn build_services(config: MapperConfig) -> anyhow::Result<AppServices> {
    let source = static_source(&std::env::var("SHARDMAP_NAMESPACES").unwrap_or_default());
    let use_postgres = std::env::var("USE_POSTGRES")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    if use_postgres {
        #[cfg(feature = "postgres")]
        {
            let store = build_postgres_store().await?;
            tracing::info!("using postgres entity store");
            return Ok(AppServices::with_store(config, store, source, default_processors()));
        }
        #[cfg(not(feature = "postgres"))]
        {
            tracing::warn!("USE_POSTGRES=true but postgres feature not enabled, falling back to in-memory");
        }
    }

    Ok(AppServices::in_memory(config, source, default_processors()))
}

#[cfg(feature = "postgres")]
async fn build_postgres_store() -> anyhow::Result<Arc<dyn EntityStore>> {
    use anyhow::Context;

    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set when USE_POSTGRES=true")?;
    let pool = PgPool::connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PostgresEntityStore::new(pool);
    store.ensure_schema().await?;
    Ok(Arc::new(store))
}
