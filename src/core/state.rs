//! Application state

use std::sync::Arc;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::db::{
    Database, MemoryRepository, RunRepository, ThreadRepository, TodosRepository,
    TranscriptRepository,
};
use crate::tools::{register_builtin_tools, RecordingInterceptor, RegistryError, ToolRegistry, ToolScheduler};

use super::coordinator::RunCoordinator;

/// Everything a command or agent loop needs, wired from one config
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub threads: ThreadRepository,
    pub transcript: TranscriptRepository,
    pub runs: RunRepository,
    pub todos: TodosRepository,
    pub memory: MemoryRepository,
    pub checkpoints: Arc<CheckpointStore>,
    pub registry: Arc<ToolRegistry>,
    pub scheduler: Arc<ToolScheduler>,
    pub coordinator: RunCoordinator,
}

impl AppState {
    pub fn new(db: Database, config: Config) -> Result<Self, RegistryError> {
        let registry = Arc::new(ToolRegistry::new(config.scheduler.source_ranking.clone()));
        register_builtin_tools(&registry, &db)?;

        let scheduler = Arc::new(
            ToolScheduler::new(registry.clone())
                .with_max_parallel(config.scheduler.max_parallel)
                .with_interceptor(Arc::new(RecordingInterceptor::new(db.clone()))),
        );
        let checkpoints = Arc::new(CheckpointStore::with_retention(
            db.clone(),
            config.checkpoint.retention,
        ));
        let coordinator = RunCoordinator::new(db.clone(), checkpoints.clone(), scheduler.clone());

        Ok(Self {
            threads: ThreadRepository::new(db.clone()),
            transcript: TranscriptRepository::new(db.clone()),
            runs: RunRepository::new(db.clone()),
            todos: TodosRepository::new(db.clone()),
            memory: MemoryRepository::new(db.clone()),
            checkpoints,
            registry,
            scheduler,
            coordinator,
            config,
            db,
        })
    }
}
