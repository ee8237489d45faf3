//! Synchronous facade over the async flows
//!
//! An [`Engine`] owns its runtime, job pool and diagnostics. Nothing is
//! installed process-wide: log output goes to the engine's own
//! [`Dispatch`] and failed invariants go to its assert hook.
//!
//! Engine methods block the calling thread and must not be called from
//! inside an async context.

use crate::config::EngineConfig;
use crate::flows::{self, FlowContext, UpdateOptions, UploadOptions, UploadedVersion};
use crate::writer::{self, ChangeVersionContext};
use depot_core::{
    create_version_index, get_files_recursively, Blake3Hasher, CancelToken, ContentHasher, Error, FileInfos,
    HashRegistry, JobPool, PathFilter, Progress, Result, Storage, StoreIndex, VersionDiff, VersionIndex,
    VersionIndexOptions,
};
use depot_store::{BlockStore, BlockStoreStats, FsBlockStore, RetryBlockStore};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::dispatcher::{self, Dispatch};
use tracing::instrument::WithSubscriber;
use tracing_subscriber::EnvFilter;

/// Receives `(expression, file, line)` of a failed invariant
pub type AssertHook = Arc<dyn Fn(&str, &str, u32) + Send + Sync>;

/// Per-call progress and cancellation
#[derive(Clone, Default)]
pub struct CallOptions {
    pub progress: Option<Arc<dyn Progress>>,
    pub cancel: Option<CancelToken>,
}

pub struct Engine {
    config: EngineConfig,
    runtime: Runtime,
    jobs: JobPool,
    registry: Arc<HashRegistry>,
    hasher: Arc<dyn ContentHasher>,
    dispatch: Dispatch,
    assert_hook: Option<AssertHook>,
}

fn default_dispatch(level: &str) -> Result<Dispatch> {
    let filter = EnvFilter::try_new(level).map_err(|e| Error::invalid(format!("log level {:?}: {}", level, e)))?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    Ok(Dispatch::new(subscriber))
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let dispatch = default_dispatch(&config.engine.log_level)?;
        let worker_count = config.worker_count();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_count)
            .thread_name("depot-engine")
            .enable_all()
            .build()
            .map_err(|e| Error::from_io(e, "engine runtime"))?;
        Ok(Self {
            config,
            runtime,
            jobs: JobPool::new(worker_count)?,
            registry: Arc::new(HashRegistry::full()),
            hasher: Arc::new(Blake3Hasher),
            dispatch,
            assert_hook: None,
        })
    }

    /// Send this engine's diagnostics to `dispatch` instead of stderr
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_assert_hook(mut self, hook: AssertHook) -> Self {
        self.assert_hook = Some(hook);
        self
    }

    /// Hasher used for new versions; it must be registered in the engine's registry
    pub fn with_hasher(mut self, hasher: Arc<dyn ContentHasher>) -> Self {
        let mut registry = (*self.registry).clone();
        registry.register(hasher.clone());
        self.registry = Arc::new(registry);
        self.hasher = hasher;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn hasher(&self) -> &Arc<dyn ContentHasher> {
        &self.hasher
    }

    pub fn registry(&self) -> &Arc<HashRegistry> {
        &self.registry
    }

    fn flow_context(&self, call: &CallOptions) -> FlowContext {
        FlowContext {
            registry: self.registry.clone(),
            hasher: self.hasher.clone(),
            jobs: self.jobs.clone(),
            progress: call.progress.clone(),
            cancel: call.cancel.clone(),
        }
    }

    /// Report a failed invariant to the hook and pass the result through
    fn report<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(Error::Invariant { expression, file, line }) = &result {
            dispatcher::with_default(&self.dispatch, || {
                tracing::error!(expression, file, line, "invariant failed");
            });
            if let Some(hook) = &self.assert_hook {
                hook(expression, file, *line);
            }
        }
        result
    }

    fn run<T, F>(&self, fut: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let fut = fut.with_subscriber(self.dispatch.clone());
        self.runtime.spawn(async move {
            let _ = tx.send(fut.await);
        });
        let result = rx
            .blocking_recv()
            .map_err(|_| Error::io("engine task ended without a result"))?;
        self.report(result)
    }

    fn run_sync<T>(&self, work: impl FnOnce() -> Result<T>) -> Result<T> {
        let result = dispatcher::with_default(&self.dispatch, work);
        self.report(result)
    }

    /// Open a durable block store at `root`, retrying transient failures per the config
    pub fn open_block_store(&self, storage: Arc<dyn Storage>, root: &str) -> Result<Arc<dyn BlockStore>> {
        let root = root.to_string();
        let blocks = self.config.blocks.clone();
        let policy = self.config.retry_policy();
        self.run(async move {
            let store = FsBlockStore::open(storage, &root, blocks.max_block_size, blocks.max_chunks_per_block).await?;
            Ok(Arc::new(RetryBlockStore::new(Arc::new(store), policy)) as Arc<dyn BlockStore>)
        })
    }

    pub fn get_files_recursively(
        &self,
        storage: &dyn Storage,
        root: &str,
        filter: Option<&dyn PathFilter>,
        call: &CallOptions,
    ) -> Result<FileInfos> {
        self.run_sync(|| get_files_recursively(storage, root, filter, call.cancel.as_ref()))
    }

    /// Index `file_infos` under `root` with the configured chunk size
    pub fn create_version_index(
        &self,
        storage: &dyn Storage,
        root: &str,
        file_infos: &FileInfos,
        call: &CallOptions,
    ) -> Result<VersionIndex> {
        let mut options = VersionIndexOptions::new(self.config.chunking.target_chunk_size);
        options.progress = call.progress.as_deref();
        options.cancel = call.cancel.as_ref();
        self.run_sync(|| create_version_index(storage, self.hasher.as_ref(), &self.jobs, root, file_infos, &options))
    }

    pub fn upload_version(
        &self,
        storage: Arc<dyn Storage>,
        root: &str,
        filter: Option<Arc<dyn PathFilter>>,
        block_store: Arc<dyn BlockStore>,
        call: &CallOptions,
    ) -> Result<UploadedVersion> {
        let ctx = self.flow_context(call);
        let options = UploadOptions::from_config(&self.config)?;
        let root = root.to_string();
        self.run(async move { flows::upload_version(&ctx, storage, &root, filter, block_store, &options).await })
    }

    pub fn get_current_version_index(
        &self,
        storage: Arc<dyn Storage>,
        path: &str,
        filter: Option<Arc<dyn PathFilter>>,
        target_version: Arc<VersionIndex>,
        call: &CallOptions,
    ) -> Result<VersionIndex> {
        let ctx = self.flow_context(call);
        let path = path.to_string();
        self.run(async move { flows::get_current_version_index(&ctx, storage, &path, filter, &target_version).await })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_version(
        &self,
        cache_storage: Arc<dyn Storage>,
        cache_path: &str,
        remote_store: Arc<dyn BlockStore>,
        install_storage: Arc<dyn Storage>,
        install_path: &str,
        current: Arc<VersionIndex>,
        target: Arc<VersionIndex>,
        retain_permissions: bool,
        call: &CallOptions,
    ) -> Result<BlockStoreStats> {
        let ctx = self.flow_context(call);
        let options = UpdateOptions {
            retain_permissions,
            ..UpdateOptions::from_config(&self.config)
        };
        let cache_path = cache_path.to_string();
        let install_path = install_path.to_string();
        self.run(async move {
            flows::update_version(
                &ctx,
                cache_storage,
                &cache_path,
                remote_store,
                install_storage,
                &install_path,
                &current,
                &target,
                &options,
            )
            .await
        })
    }

    /// Apply `diff` with blocks taken from `block_store`
    #[allow(clippy::too_many_arguments)]
    pub fn change_version(
        &self,
        block_store: Arc<dyn BlockStore>,
        storage: Arc<dyn Storage>,
        store_index: Arc<StoreIndex>,
        source: Arc<VersionIndex>,
        target: Arc<VersionIndex>,
        diff: Arc<VersionDiff>,
        version_path: &str,
        retain_permissions: bool,
        call: &CallOptions,
    ) -> Result<()> {
        let hasher = self.registry.get(target.hash_identifier())?;
        let ctx = ChangeVersionContext {
            block_store,
            storage,
            hasher,
            worker_count: self.jobs.worker_count(),
            progress: call.progress.clone(),
            cancel: call.cancel.clone(),
        };
        let version_path = version_path.to_string();
        self.run(async move {
            writer::change_version(&ctx, &store_index, &source, &target, &diff, &version_path, retain_permissions)
                .await
        })
    }
}
