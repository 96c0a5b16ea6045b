//! Container - registry and lifecycle engine for modules.
//!
//! Lifecycle:
//! - `register_module` / `register_callable_module` (before build only)
//! - `build`: graph validation (unknown dependencies, cycles), then eager
//!   construction in topological order
//! - `up`: every module concurrently waits for its dependencies to be up, then
//!   runs its own hook
//! - `down`: the mirror image, gated on dependents
//! - `destroy`: synchronous teardown hooks, then the buses close
//!
//! The module-state table is a `watch` channel written only here; hooks wait on
//! it with predicates. A failed module is recorded in the same table so that
//! modules waiting on it give up instead of waiting for the timeout.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::bus::{Bus, BusStream, DEFAULT_CAPACITY};
use crate::context::ModuleCtx;
use crate::contracts::{CallableModule, Module, ModuleFactory};
use crate::deps::{Dependencies, Instance, Resolved, TypeKey};
use crate::environment::Environment;
use crate::error::{ContainerError, Direction};
use crate::facades::{ModuleLog, ModuleMetric};
use crate::records::{LogLevel, LogRecord, MetricKind, MetricRecord};

type Factory = Arc<dyn Fn(ModuleCtx, &Resolved) -> anyhow::Result<Built> + Send + Sync>;

struct Built {
    module: Arc<dyn Module>,
    instance: Instance,
    callable: Option<Arc<dyn CallableModule>>,
}

#[derive(Clone)]
struct Registration {
    name: &'static str,
    key: TypeKey,
    dependencies: Dependencies,
    factory: Factory,
}

#[derive(Clone)]
struct Entry {
    name: &'static str,
    key: TypeKey,
    dependencies: Vec<&'static str>,
    module: Arc<dyn Module>,
    instance: Instance,
    callable: Option<Arc<dyn CallableModule>>,
}

#[derive(Default)]
struct Registry {
    registrations: Vec<Registration>,
    /// Constructed modules in topological order; `Some` once built.
    modules: Option<Arc<[Entry]>>,
}

/// Snapshot of module states.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StateTable {
    states: BTreeMap<String, bool>,
    failed: BTreeSet<String>,
}

impl StateTable {
    #[must_use]
    pub fn is_up(&self, module: &str) -> bool {
        self.states.get(module).copied().unwrap_or(false)
    }

    #[must_use]
    pub fn is_registered(&self, module: &str) -> bool {
        self.states.contains_key(module)
    }

    /// Modules whose hook failed or timed out during the current `up`/`down`.
    #[must_use]
    pub fn has_failed(&self, module: &str) -> bool {
        self.failed.contains(module)
    }

    #[must_use]
    pub fn states(&self) -> &BTreeMap<String, bool> {
        &self.states
    }

    #[must_use]
    pub fn all_down(&self) -> bool {
        self.states.values().all(|up| !up)
    }
}

struct Shared {
    name: Arc<str>,
    instance_id: Uuid,
    environment: Environment,
    logs: Bus<LogRecord>,
    metrics: Bus<MetricRecord>,
    registry: RwLock<Registry>,
    build_lock: Mutex<()>,
    states: watch::Sender<StateTable>,
    cancel: CancellationToken,
}

/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Container {
    shared: Arc<Shared>,
}

impl Container {
    /// A container over the current process environment.
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self::with_environment(name, Environment::from_process())
    }

    #[must_use]
    pub fn with_environment(name: impl Into<Arc<str>>, environment: Environment) -> Self {
        let (states, _) = watch::channel(StateTable::default());
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                instance_id: Uuid::now_v7(),
                environment,
                logs: Bus::new("logs", DEFAULT_CAPACITY),
                metrics: Bus::new("metrics", DEFAULT_CAPACITY),
                registry: RwLock::new(Registry::default()),
                build_lock: Mutex::new(()),
                states,
                cancel: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn instance_id(&self) -> Uuid {
        self.shared.instance_id
    }

    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.shared.environment
    }

    #[must_use]
    pub fn handle(&self) -> ContainerHandle {
        ContainerHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Cancelled by [`Container::destroy`].
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// # Errors
    /// `DuplicateModule` when `M::NAME` is taken (the original stays),
    /// `AlreadyBuilt` after [`Container::build`].
    pub fn register_module<M: ModuleFactory>(&self) -> Result<(), ContainerError> {
        let factory: Factory = Arc::new(|ctx: ModuleCtx, deps: &Resolved| {
            let module = Arc::new(M::build(ctx, deps)?);
            Ok(Built {
                module: module.clone(),
                instance: module,
                callable: None,
            })
        });
        self.register::<M>(factory)
    }

    /// Registers `M` and exposes it to inbound remote calls under `M::NAME`.
    ///
    /// # Errors
    /// Same as [`Container::register_module`].
    pub fn register_callable_module<M>(&self) -> Result<(), ContainerError>
    where
        M: ModuleFactory + CallableModule,
    {
        let factory: Factory = Arc::new(|ctx: ModuleCtx, deps: &Resolved| {
            let module = Arc::new(M::build(ctx, deps)?);
            Ok(Built {
                module: module.clone(),
                callable: Some(module.clone() as Arc<dyn CallableModule>),
                instance: module,
            })
        });
        self.register::<M>(factory)
    }

    fn register<M: ModuleFactory>(&self, factory: Factory) -> Result<(), ContainerError> {
        let _build = self.shared.build_lock.lock();
        {
            let mut registry = self.shared.registry.write();
            if registry.modules.is_some() {
                return Err(ContainerError::AlreadyBuilt {
                    container: self.shared.name.to_string(),
                    module: M::NAME.to_owned(),
                });
            }
            if registry.registrations.iter().any(|r| r.name == M::NAME) {
                return Err(ContainerError::DuplicateModule {
                    module: M::NAME.to_owned(),
                });
            }
            registry.registrations.push(Registration {
                name: M::NAME,
                key: TypeKey::of::<M>(),
                dependencies: M::dependencies(),
                factory,
            });
        }
        self.shared.states.send_modify(|table| {
            table.states.insert(M::NAME.to_owned(), false);
        });
        tracing::debug!(container = %self.shared.name, module = M::NAME, "Registered module");
        Ok(())
    }

    /// Validates the graph and constructs every module. Idempotent.
    ///
    /// # Errors
    /// `UnknownDependency`, `CyclicDependency`, or `Construct` wrapping the
    /// constructor's error. Nothing is kept from a failed build.
    pub fn build(&self) -> Result<(), ContainerError> {
        let _build = self.shared.build_lock.lock();
        let registrations = {
            let registry = self.shared.registry.read();
            if registry.modules.is_some() {
                return Ok(());
            }
            registry.registrations.clone()
        };

        let order = resolve_order(&registrations)?;
        let mut instances: HashMap<TypeKey, (&'static str, Instance)> = HashMap::new();
        let mut entries = Vec::with_capacity(order.len());
        for idx in order {
            let reg = &registrations[idx];
            let resolved = Resolved::new(
                reg.name,
                reg.dependencies.iter().filter_map(|dep| {
                    instances
                        .get(&dep.key)
                        .map(|(name, instance)| (dep.key, *name, instance.clone()))
                }),
            );
            let built = (reg.factory)(self.module_ctx(reg.name), &resolved).map_err(|source| {
                ContainerError::Construct {
                    module: reg.name.to_owned(),
                    source,
                }
            })?;
            tracing::debug!(container = %self.shared.name, module = reg.name, "Constructed module");
            instances.insert(reg.key, (reg.name, built.instance.clone()));
            entries.push(Entry {
                name: reg.name,
                key: reg.key,
                dependencies: reg.dependencies.names().collect(),
                module: built.module,
                instance: built.instance,
                callable: built.callable,
            });
        }

        self.shared.registry.write().modules = Some(entries.into());
        Ok(())
    }

    fn module_ctx(&self, module: &'static str) -> ModuleCtx {
        let identity: Arc<str> = format!("{}.{module}", self.shared.name).into();
        ModuleCtx {
            container_name: self.shared.name.clone(),
            module_name: module,
            identity: identity.clone(),
            instance_id: self.shared.instance_id,
            environment: self.shared.environment.clone(),
            log: ModuleLog::new(identity.clone(), self.shared.logs.clone()),
            metric: ModuleMetric::new(identity, self.shared.metrics.clone()),
            container: self.handle(),
            cancellation_token: self.shared.cancel.child_token(),
        }
    }

    fn entries(&self) -> Option<Arc<[Entry]>> {
        self.shared.registry.read().modules.clone()
    }

    /// Builds if needed, then brings every module up in dependency order.
    ///
    /// # Errors
    /// Build errors, or the root lifecycle failure: a failing hook or a timed
    /// out hook in preference to modules that merely gave up waiting. Modules
    /// that came up stay up.
    pub async fn up(&self, timeout: Duration) -> Result<(), ContainerError> {
        self.build()?;
        self.drive(Direction::Up, timeout).await
    }

    /// Brings every up module down, dependents first. Modules that are not up
    /// are skipped; an unbuilt container has nothing to do.
    ///
    /// # Errors
    /// Same selection rules as [`Container::up`].
    pub async fn down(&self, timeout: Duration) -> Result<(), ContainerError> {
        if self.entries().is_none() {
            return Ok(());
        }
        self.drive(Direction::Down, timeout).await
    }

    async fn drive(&self, direction: Direction, timeout: Duration) -> Result<(), ContainerError> {
        let entries = self.entries().ok_or_else(|| ContainerError::NotBuilt {
            container: self.shared.name.to_string(),
        })?;
        self.shared.states.send_modify(|table| table.failed.clear());

        let started = Instant::now();
        tracing::info!(container = %self.shared.name, modules = entries.len(), "Phase: {direction}");

        let runs = entries.iter().map(|entry| {
            let gate: Vec<&'static str> = match direction {
                Direction::Up => entry.dependencies.clone(),
                Direction::Down => entries
                    .iter()
                    .filter(|other| other.dependencies.contains(&entry.name))
                    .map(|other| other.name)
                    .collect(),
            };
            self.run_hook(direction, entry, gate, timeout)
        });
        let results = join_all(runs).await;

        match root_failure(results) {
            Some(err) => {
                tracing::error!(
                    container = %self.shared.name,
                    %direction,
                    error = %err,
                    "Lifecycle phase failed"
                );
                Err(err)
            }
            None => {
                tracing::info!(
                    container = %self.shared.name,
                    %direction,
                    elapsed_ms = started.elapsed().as_millis(),
                    "Lifecycle phase finished"
                );
                Ok(())
            }
        }
    }

    async fn run_hook(
        &self,
        direction: Direction,
        entry: &Entry,
        gate: Vec<&'static str>,
        timeout: Duration,
    ) -> Result<(), ContainerError> {
        let target = direction == Direction::Up;
        if self.shared.states.borrow().is_up(entry.name) == target {
            return Ok(());
        }

        let mut rx = self.shared.states.subscribe();
        let mut in_hook = false;
        let outcome = tokio::time::timeout(timeout, async {
            let blocked_by = {
                let table = rx
                    .wait_for(|t| {
                        gate.iter().all(|g| t.is_up(g) == target)
                            || gate.iter().any(|g| t.has_failed(g))
                    })
                    .await
                    .map_err(|_| ContainerError::NotBuilt {
                        container: self.shared.name.to_string(),
                    })?;
                gate.iter().find(|g| table.has_failed(g)).copied()
            };
            if let Some(dependency) = blocked_by {
                return Err(ContainerError::DependencyAborted {
                    direction,
                    module: entry.name.to_owned(),
                    dependency: dependency.to_owned(),
                });
            }

            in_hook = true;
            tracing::debug!(module = entry.name, %direction, "Running hook");
            let hook = match direction {
                Direction::Up => entry.module.up().await,
                Direction::Down => entry.module.down().await,
            };
            hook.map_err(|source| ContainerError::Hook {
                direction,
                module: entry.name.to_owned(),
                source,
            })
        })
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(ContainerError::Timeout {
                direction,
                module: entry.name.to_owned(),
                timeout,
                in_hook,
            }),
        };

        match &result {
            Ok(()) => {
                self.shared.states.send_modify(|table| {
                    table.states.insert(entry.name.to_owned(), target);
                });
                tracing::info!(module = entry.name, %direction, "Module is {direction}");
            }
            Err(err) => {
                self.shared.states.send_modify(|table| {
                    table.failed.insert(entry.name.to_owned());
                });
                tracing::debug!(module = entry.name, %direction, error = %err, "Module hook failed");
            }
        }
        result
    }

    /// Runs every `destroy` hook, then closes the buses. Idempotent.
    pub fn destroy(&self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        self.shared.cancel.cancel();
        if let Some(entries) = self.entries() {
            for entry in entries.iter() {
                entry.module.destroy();
            }
        }
        self.shared.logs.close();
        self.shared.metrics.close();
        tracing::debug!(container = %self.shared.name, "Container destroyed");
    }

    /// Typed access to a constructed module.
    ///
    /// # Errors
    /// `NotBuilt` before [`Container::build`], `ModuleNotFound` if `M` is not
    /// registered.
    pub fn module<M: ModuleFactory>(&self) -> Result<Arc<M>, ContainerError> {
        let entries = self.entries().ok_or_else(|| ContainerError::NotBuilt {
            container: self.shared.name.to_string(),
        })?;
        let key = TypeKey::of::<M>();
        entries
            .iter()
            .find(|e| e.key == key)
            .and_then(|e| e.instance.clone().downcast::<M>().ok())
            .ok_or_else(|| ContainerError::ModuleNotFound {
                module: M::NAME.to_owned(),
            })
    }

    #[must_use]
    pub fn callable(&self, name: &str) -> Option<Arc<dyn CallableModule>> {
        callable_in(&self.shared, name)
    }

    /// Registered names; topological order once built.
    #[must_use]
    pub fn module_names(&self) -> Vec<&'static str> {
        let registry = self.shared.registry.read();
        match &registry.modules {
            Some(entries) => entries.iter().map(|e| e.name).collect(),
            None => registry.registrations.iter().map(|r| r.name).collect(),
        }
    }

    #[must_use]
    pub fn states(&self) -> StateTable {
        self.shared.states.borrow().clone()
    }

    /// Receiver notified on every state change.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<StateTable> {
        self.shared.states.subscribe()
    }

    pub fn send_log(&self, record: LogRecord) {
        self.shared.logs.publish(record);
    }

    pub fn send_metric(&self, record: MetricRecord) {
        self.shared.metrics.publish(record);
    }

    /// Records at `min_level` or more severe.
    #[must_use]
    pub fn subscribe_logs(&self, min_level: LogLevel) -> BusStream<LogRecord> {
        self.shared
            .logs
            .subscribe()
            .filter(move |record| futures::future::ready(record.level.passes(min_level)))
            .boxed()
    }

    /// Records of the given kinds; all kinds when `kinds` is empty.
    #[must_use]
    pub fn subscribe_metrics(&self, kinds: &[MetricKind]) -> BusStream<MetricRecord> {
        let kinds = kinds.to_vec();
        self.shared
            .metrics
            .subscribe()
            .filter(move |record| {
                futures::future::ready(kinds.is_empty() || kinds.contains(&record.kind))
            })
            .boxed()
    }

    #[must_use]
    pub fn log_bus(&self) -> Bus<LogRecord> {
        self.shared.logs.clone()
    }

    #[must_use]
    pub fn metric_bus(&self) -> Bus<MetricRecord> {
        self.shared.metrics.clone()
    }
}

fn callable_in(shared: &Shared, name: &str) -> Option<Arc<dyn CallableModule>> {
    let registry = shared.registry.read();
    registry
        .modules
        .as_ref()?
        .iter()
        .find(|e| e.name == name)
        .and_then(|e| e.callable.clone())
}

/// Non-owning container reference held by module contexts.
#[derive(Clone)]
pub struct ContainerHandle {
    shared: Weak<Shared>,
}

impl ContainerHandle {
    #[must_use]
    pub fn upgrade(&self) -> Option<Container> {
        self.shared.upgrade().map(|shared| Container { shared })
    }

    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.shared.upgrade().map(|s| s.name.to_string())
    }

    /// Callable module registered under `name`, once the container is built.
    #[must_use]
    pub fn callable(&self, name: &str) -> Option<Arc<dyn CallableModule>> {
        let shared = self.shared.upgrade()?;
        callable_in(&shared, name)
    }

    #[must_use]
    pub fn log_bus(&self) -> Option<Bus<LogRecord>> {
        self.shared.upgrade().map(|s| s.logs.clone())
    }

    #[must_use]
    pub fn metric_bus(&self) -> Option<Bus<MetricRecord>> {
        self.shared.upgrade().map(|s| s.metrics.clone())
    }
}

/// Prefers the failure that caused the others: hook errors, then hooks that
/// timed out while running, then everything else.
fn root_failure(results: Vec<Result<(), ContainerError>>) -> Option<ContainerError> {
    results
        .into_iter()
        .filter_map(Result::err)
        .min_by_key(|err| match err {
            ContainerError::Hook { .. } => 0,
            ContainerError::Timeout { in_hook: true, .. } => 1,
            ContainerError::Timeout { .. } => 2,
            _ => 3,
        })
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    New,
    Active,
    Done,
}

/// Kahn's algorithm over registration indices; ties keep registration order.
fn resolve_order(registrations: &[Registration]) -> Result<Vec<usize>, ContainerError> {
    let index: HashMap<TypeKey, usize> = registrations
        .iter()
        .enumerate()
        .map(|(i, r)| (r.key, i))
        .collect();

    let mut deps: Vec<Vec<usize>> = Vec::with_capacity(registrations.len());
    for reg in registrations {
        let mut edges = Vec::with_capacity(reg.dependencies.len());
        for dep in reg.dependencies.iter() {
            let Some(&target) = index.get(&dep.key) else {
                return Err(ContainerError::UnknownDependency {
                    module: reg.name.to_owned(),
                    dependency: dep.name.to_owned(),
                });
            };
            edges.push(target);
        }
        deps.push(edges);
    }

    let mut pending: Vec<usize> = deps.iter().map(Vec::len).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); registrations.len()];
    for (module, edges) in deps.iter().enumerate() {
        for &dep in edges {
            dependents[dep].push(module);
        }
    }

    let mut ready: VecDeque<usize> = (0..registrations.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(registrations.len());
    while let Some(next) = ready.pop_front() {
        order.push(next);
        for &dependent in &dependents[next] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.push_back(dependent);
            }
        }
    }

    if order.len() < registrations.len() {
        let stuck: Vec<bool> = pending.iter().map(|&n| n > 0).collect();
        let cycle = find_cycle(&deps, &stuck)
            .into_iter()
            .map(|i| registrations[i].name.to_owned())
            .collect();
        return Err(ContainerError::CyclicDependency { cycle });
    }
    Ok(order)
}

fn find_cycle(deps: &[Vec<usize>], stuck: &[bool]) -> Vec<usize> {
    let mut marks = vec![Mark::New; deps.len()];
    let mut path = Vec::new();
    for start in (0..deps.len()).filter(|&i| stuck[i]) {
        if let Some(cycle) = visit(start, deps, &mut marks, &mut path) {
            return cycle;
        }
    }
    Vec::new()
}

fn visit(
    node: usize,
    deps: &[Vec<usize>],
    marks: &mut [Mark],
    path: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    match marks[node] {
        Mark::Done => return None,
        Mark::Active => {
            let pos = path.iter().position(|&n| n == node)?;
            let mut cycle = path[pos..].to_vec();
            cycle.push(node);
            return Some(cycle);
        }
        Mark::New => {}
    }
    marks[node] = Mark::Active;
    path.push(node);
    for &next in &deps[node] {
        if let Some(cycle) = visit(next, deps, marks, path) {
            return Some(cycle);
        }
    }
    path.pop();
    marks[node] = Mark::Done;
    None
}
