pub mod api;
pub mod classifier;
pub mod command;
pub mod config;
pub mod engine;
pub mod model;
pub mod observer;
pub mod store;

use std::sync::Arc;

use axum::Router;
use drivechat_core::{Authenticator, Module, ServiceError};
use drivechat_sql::SQLStore;

use classifier::CommandClassifier;
use command::CommandRouter;
use config::TaskConfig;
use engine::TaskEngine;
use observer::TaskObserver;
use store::SqlTaskStore;

/// The task module: command routing plus background task tracking.
///
/// Embed this in the server to get command classification, task creation,
/// executor reporting, cancellation, long-poll and list/stats reads. It
/// does not execute tasks.
pub struct TaskModule {
    engine: Arc<TaskEngine>,
    observer: Arc<TaskObserver>,
    commands: Arc<CommandRouter>,
    auth: Arc<dyn Authenticator>,
}

impl TaskModule {
    /// Create the module over a SQL database, initialising the schema.
    pub fn new(
        db: Arc<dyn SQLStore>,
        auth: Arc<dyn Authenticator>,
        config: TaskConfig,
    ) -> Result<Self, ServiceError> {
        let store = Arc::new(SqlTaskStore::new(db)?);
        let engine = TaskEngine::new(store)
            .with_max_long_poll(std::time::Duration::from_secs(config.max_long_poll_secs));
        Ok(Self::with_engine(engine, auth, config))
    }

    /// Wrap an engine built by the caller (custom store, trigger).
    pub fn with_engine(
        engine: TaskEngine,
        auth: Arc<dyn Authenticator>,
        config: TaskConfig,
    ) -> Self {
        let engine = Arc::new(engine);
        let observer = Arc::new(TaskObserver::new(Arc::clone(&engine), config));
        let commands = Arc::new(CommandRouter::new(
            CommandClassifier::default(),
            Arc::clone(&engine),
        ));
        Self {
            engine,
            observer,
            commands,
            auth,
        }
    }

    pub fn engine(&self) -> &Arc<TaskEngine> {
        &self.engine
    }

    pub fn observer(&self) -> &Arc<TaskObserver> {
        &self.observer
    }

    pub fn commands(&self) -> &Arc<CommandRouter> {
        &self.commands
    }
}

impl Module for TaskModule {
    fn name(&self) -> &str {
        "task"
    }

    fn routes(&self) -> Router {
        api::router(api::ApiState {
            engine: Arc::clone(&self.engine),
            observer: Arc::clone(&self.observer),
            commands: Arc::clone(&self.commands),
            auth: Arc::clone(&self.auth),
        })
    }
}
