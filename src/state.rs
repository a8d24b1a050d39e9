//! Shared application state. The container is swapped for a freshly compiled
//! one after the stored setting changes.

use crate::config::{load_from_pool, RuntimeConfig, Setting};
use crate::container::Container;
use crate::error::AppError;
use sqlx::PgPool;
use std::sync::{Arc, RwLock};

/// Builds a registered container from a setting. Consumers that register
/// handlers or script engines supply their own so a reload keeps them.
pub type ContainerBuilder = Arc<dyn Fn(Setting) -> Result<Container, AppError> + Send + Sync>;

#[derive(Clone)]
pub struct AppState {
    pub container: Arc<RwLock<Arc<Container>>>,
    /// Database holding the _sys_* setting tables, when settings are stored.
    pub pool: Option<PgPool>,
    pub runtime: RuntimeConfig,
    builder: ContainerBuilder,
}

impl AppState {
    pub fn new(container: Container) -> Self {
        let runtime = container.runtime().clone();
        let builder_runtime = runtime.clone();
        AppState {
            container: Arc::new(RwLock::new(Arc::new(container))),
            pool: None,
            runtime,
            builder: Arc::new(move |setting| {
                let c = Container::with_runtime(builder_runtime.clone());
                c.register_setting(setting)?;
                Ok(c)
            }),
        }
    }

    pub fn with_pool(mut self, pool: PgPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_builder(mut self, builder: ContainerBuilder) -> Self {
        self.builder = builder;
        self
    }

    pub fn container(&self) -> Result<Arc<Container>, AppError> {
        self.container
            .read()
            .map(|c| c.clone())
            .map_err(|_| AppError::BadRequest("state lock".into()))
    }

    pub fn pool(&self) -> Result<&PgPool, AppError> {
        self.pool
            .as_ref()
            .ok_or_else(|| AppError::NotFound("setting store is not configured".into()))
    }

    /// Load the stored setting, build and compile a new container, then swap
    /// it in. The current container keeps serving if any step fails.
    pub async fn reload(&self) -> Result<(), AppError> {
        let setting = load_from_pool(self.pool()?, self.runtime.env.as_deref()).await?;
        let next = (self.builder)(setting)?;
        next.compile()?;
        let mut guard = self
            .container
            .write()
            .map_err(|_| AppError::BadRequest("state lock".into()))?;
        *guard = Arc::new(next);
        tracing::info!("container reloaded from stored setting");
        Ok(())
    }
}
