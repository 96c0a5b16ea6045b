#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![forbid(unsafe_code)]

//! # `ModHost` core
//!
//! Modules are registered into a [`Container`], constructed eagerly in
//! dependency order, brought up concurrently (each module waits only for its own
//! dependencies) and brought down in reverse order.
//!
//! ```ignore
//! use modhost::{Container, Dependencies, Module, ModuleCtx, ModuleFactory, Resolved};
//!
//! struct Store;
//!
//! #[async_trait::async_trait]
//! impl Module for Store {}
//!
//! impl ModuleFactory for Store {
//!     const NAME: &'static str = "store";
//!     fn build(_ctx: ModuleCtx, _deps: &Resolved) -> anyhow::Result<Self> {
//!         Ok(Store)
//!     }
//! }
//!
//! struct Api {
//!     store: std::sync::Arc<Store>,
//! }
//!
//! #[async_trait::async_trait]
//! impl Module for Api {}
//!
//! impl ModuleFactory for Api {
//!     const NAME: &'static str = "api";
//!     fn dependencies() -> Dependencies {
//!         Dependencies::new().with::<Store>()
//!     }
//!     fn build(_ctx: ModuleCtx, deps: &Resolved) -> anyhow::Result<Self> {
//!         Ok(Api { store: deps.get::<Store>()? })
//!     }
//! }
//!
//! let container = Container::new("app");
//! container.register_module::<Store>()?;
//! container.register_module::<Api>()?;
//! container.up(std::time::Duration::from_secs(30)).await?;
//! ```

pub mod bus;
pub mod config;
pub mod container;
pub mod context;
pub mod contracts;
pub mod deps;
pub mod environment;
pub mod error;
pub mod facades;
pub mod logging;
pub mod records;
pub mod runtime;
pub mod scope;

pub use bus::{Bus, BusStream};
pub use config::{ConfigError, HostConfig, LogFormat, module_config_or_default};
pub use container::{Container, ContainerHandle, StateTable};
pub use context::ModuleCtx;
pub use contracts::{CallableModule, MethodError, MethodStream, Module, ModuleFactory};
pub use deps::{Dependencies, DependencySpec, Resolved};
pub use environment::Environment;
pub use error::{ContainerError, Direction, RemoteError};
pub use facades::{ModuleLog, ModuleMetric};
pub use records::{LogLevel, LogMessage, LogRecord, MetricKind, MetricRecord};

// Re-exported so module crates can implement `Module` without a direct dependency.
pub use async_trait::async_trait;
