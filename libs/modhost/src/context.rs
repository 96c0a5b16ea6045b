use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{ConfigError, HostConfig, module_config_or_default};
use crate::container::ContainerHandle;
use crate::environment::Environment;
use crate::facades::{ModuleLog, ModuleMetric};

/// Everything a module receives at construction time.
///
/// ```ignore
/// fn build(ctx: ModuleCtx, deps: &Resolved) -> anyhow::Result<Self> {
///     let cfg: CacheConfig = ctx.config("cache")?;
///     ctx.log().info(format!("cache namespace {}", cfg.namespace));
///     Ok(Cache { ctx, cfg, store: deps.get::<Store>()? })
/// }
/// ```
///
/// The context is cheap to clone; modules usually keep it.
#[derive(Clone)]
pub struct ModuleCtx {
    pub(crate) container_name: Arc<str>,
    pub(crate) module_name: &'static str,
    pub(crate) identity: Arc<str>,
    pub(crate) instance_id: Uuid,
    pub(crate) environment: Environment,
    pub(crate) log: ModuleLog,
    pub(crate) metric: ModuleMetric,
    pub(crate) container: ContainerHandle,
    pub(crate) cancellation_token: CancellationToken,
}

impl ModuleCtx {
    #[inline]
    #[must_use]
    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    #[inline]
    #[must_use]
    pub fn module_name(&self) -> &'static str {
        self.module_name
    }

    /// `container.module`, the `source` of every record this module emits.
    #[inline]
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Instance id of the owning container.
    #[inline]
    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    #[inline]
    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    #[inline]
    #[must_use]
    pub fn log(&self) -> &ModuleLog {
        &self.log
    }

    #[inline]
    #[must_use]
    pub fn metric(&self) -> &ModuleMetric {
        &self.metric
    }

    /// Weak handle to the owning container.
    #[inline]
    #[must_use]
    pub fn container(&self) -> &ContainerHandle {
        &self.container
    }

    /// Cancelled when the container is destroyed.
    #[inline]
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Typed `MODHOST_<SECTION>_*` configuration, defaults when absent.
    ///
    /// # Errors
    /// `ConfigError::InvalidSection` when present values do not deserialize.
    pub fn config<T>(&self, section: &str) -> Result<T, ConfigError>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        module_config_or_default(&self.environment, section)
    }

    /// # Errors
    /// `ConfigError::InvalidHost` when a `MODHOST_*` value does not parse.
    pub fn host_config(&self) -> Result<HostConfig, ConfigError> {
        HostConfig::load(&self.environment)
    }
}
