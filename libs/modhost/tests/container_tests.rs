#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Lifecycle ordering and failure semantics of the container.

use std::sync::Arc;
use std::time::Duration;

use modhost::{
    Container, ContainerError, Dependencies, Direction, Environment, Module, ModuleCtx,
    ModuleFactory, Resolved, async_trait,
};
use parking_lot::Mutex;

/// Shared event log; every test module depends on it.
#[derive(Default)]
struct Journal {
    events: Mutex<Vec<String>>,
}

impl Journal {
    fn record(&self, event: String) {
        self.events.lock().push(event);
    }

    async fn step(&self, module: &str, phase: &str) {
        self.record(format!("{module}:{phase}:start"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.record(format!("{module}:{phase}:end"));
    }

    fn position(&self, event: &str) -> usize {
        self.events
            .lock()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("missing event {event}"))
    }

    fn count(&self, prefix: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl Module for Journal {}

impl ModuleFactory for Journal {
    const NAME: &'static str = "journal";
    fn build(_ctx: ModuleCtx, _deps: &Resolved) -> anyhow::Result<Self> {
        Ok(Journal::default())
    }
}

macro_rules! step_module {
    ($ty:ident, $name:literal, [$($dep:ty),*]) => {
        struct $ty {
            journal: Arc<Journal>,
        }

        #[async_trait]
        impl Module for $ty {
            async fn up(&self) -> anyhow::Result<()> {
                self.journal.step($name, "up").await;
                Ok(())
            }
            async fn down(&self) -> anyhow::Result<()> {
                self.journal.step($name, "down").await;
                Ok(())
            }
        }

        impl ModuleFactory for $ty {
            const NAME: &'static str = $name;
            fn dependencies() -> Dependencies {
                Dependencies::new().with::<Journal>()$(.with::<$dep>())*
            }
            fn build(_ctx: ModuleCtx, deps: &Resolved) -> anyhow::Result<Self> {
                Ok(Self { journal: deps.get::<Journal>()? })
            }
        }
    };
}

// Diamond: top -> (left, right) -> base.
step_module!(Base, "base", []);
step_module!(Left, "left", [Base]);
step_module!(Right, "right", [Base]);
step_module!(Top, "top", [Left, Right]);
step_module!(Loner, "loner", []);

const EDGES: [(&str, &str); 4] = [
    ("left", "base"),
    ("right", "base"),
    ("top", "left"),
    ("top", "right"),
];

const T: Duration = Duration::from_secs(5);

fn container() -> Container {
    Container::with_environment("app", Environment::new())
}

#[tokio::test]
async fn up_respects_dependencies_and_down_reverses() {
    let c = container();
    // Registration order deliberately opposite to dependency order.
    c.register_module::<Top>().unwrap();
    c.register_module::<Right>().unwrap();
    c.register_module::<Left>().unwrap();
    c.register_module::<Loner>().unwrap();
    c.register_module::<Base>().unwrap();
    c.register_module::<Journal>().unwrap();

    c.up(T).await.unwrap();
    let journal = c.module::<Journal>().unwrap();

    for name in ["base", "left", "right", "top", "loner"] {
        assert_eq!(journal.count(&format!("{name}:up:start")), 1, "{name} up once");
        assert!(c.states().is_up(name));
    }
    for (module, dependency) in EDGES {
        assert!(
            journal.position(&format!("{dependency}:up:end"))
                < journal.position(&format!("{module}:up:start")),
            "{dependency} must be up before {module} starts"
        );
    }
    // Independent siblings overlap.
    assert!(journal.position("right:up:start") < journal.position("left:up:end"));

    c.down(T).await.unwrap();
    for (module, dependency) in EDGES {
        assert!(
            journal.position(&format!("{module}:down:end"))
                < journal.position(&format!("{dependency}:down:start")),
            "{module} must be down before {dependency} goes down"
        );
    }
    assert!(c.states().all_down());
}

#[tokio::test]
async fn up_is_idempotent_for_started_modules() {
    let c = container();
    c.register_module::<Journal>().unwrap();
    c.register_module::<Base>().unwrap();
    c.up(T).await.unwrap();
    c.up(T).await.unwrap();
    assert_eq!(c.module::<Journal>().unwrap().count("base:up:start"), 1);
}

#[tokio::test]
async fn duplicate_registration_keeps_original() {
    let c = container();
    c.register_module::<Journal>().unwrap();
    c.register_module::<Base>().unwrap();
    let err = c.register_module::<Base>().unwrap_err();
    assert!(matches!(err, ContainerError::DuplicateModule { ref module } if module == "base"));
    assert_eq!(c.module_names(), ["journal", "base"]);
    c.up(T).await.unwrap();
    assert!(c.states().is_up("base"));
}

#[tokio::test]
async fn unknown_dependency_is_rejected() {
    let c = container();
    c.register_module::<Base>().unwrap();
    let err = c.build().unwrap_err();
    assert!(matches!(
        err,
        ContainerError::UnknownDependency { ref module, ref dependency }
            if module == "base" && dependency == "journal"
    ));
}

struct Ping;
struct Pong;

#[async_trait]
impl Module for Ping {
    async fn up(&self) -> anyhow::Result<()> {
        panic!("hooks must not run for a cyclic graph");
    }
}

#[async_trait]
impl Module for Pong {}

impl ModuleFactory for Ping {
    const NAME: &'static str = "ping";
    fn dependencies() -> Dependencies {
        Dependencies::new().with::<Pong>()
    }
    fn build(_ctx: ModuleCtx, _deps: &Resolved) -> anyhow::Result<Self> {
        Ok(Ping)
    }
}

impl ModuleFactory for Pong {
    const NAME: &'static str = "pong";
    fn dependencies() -> Dependencies {
        Dependencies::new().with::<Ping>()
    }
    fn build(_ctx: ModuleCtx, _deps: &Resolved) -> anyhow::Result<Self> {
        Ok(Pong)
    }
}

#[tokio::test]
async fn cycles_are_rejected_before_hooks() {
    let c = container();
    c.register_module::<Ping>().unwrap();
    c.register_module::<Pong>().unwrap();
    let err = c.up(T).await.unwrap_err();
    let ContainerError::CyclicDependency { cycle } = err else {
        panic!("expected a cycle error, got {err}");
    };
    assert_eq!(cycle, ["ping", "pong", "ping"]);
    assert!(!c.states().is_up("pong"));
}

struct Hang;

#[async_trait]
impl Module for Hang {
    async fn up(&self) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

impl ModuleFactory for Hang {
    const NAME: &'static str = "hang";
    fn build(_ctx: ModuleCtx, _deps: &Resolved) -> anyhow::Result<Self> {
        Ok(Hang)
    }
}

struct AfterHang;

#[async_trait]
impl Module for AfterHang {}

impl ModuleFactory for AfterHang {
    const NAME: &'static str = "after_hang";
    fn dependencies() -> Dependencies {
        Dependencies::new().with::<Hang>()
    }
    fn build(_ctx: ModuleCtx, _deps: &Resolved) -> anyhow::Result<Self> {
        Ok(AfterHang)
    }
}

#[tokio::test]
async fn hanging_hook_times_out_naming_the_module() {
    let c = container();
    // Waiting module registered first so it is not picked by position.
    c.register_module::<AfterHang>().unwrap();
    c.register_module::<Hang>().unwrap();
    let err = c.up(Duration::from_millis(200)).await.unwrap_err();
    match err {
        ContainerError::Timeout {
            direction,
            module,
            in_hook,
            ..
        } => {
            assert_eq!(direction, Direction::Up);
            assert_eq!(module, "hang");
            assert!(in_hook);
        }
        other => panic!("expected timeout, got {other}"),
    }
    assert!(!c.states().is_up("after_hang"));
}

struct Failing;

#[async_trait]
impl Module for Failing {
    async fn up(&self) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("socket in use").context("binding listener"))
    }
    async fn down(&self) -> anyhow::Result<()> {
        panic!("down must be skipped for a module that never came up");
    }
}

impl ModuleFactory for Failing {
    const NAME: &'static str = "failing";
    fn build(_ctx: ModuleCtx, _deps: &Resolved) -> anyhow::Result<Self> {
        Ok(Failing)
    }
}

struct NeedsFailing;

#[async_trait]
impl Module for NeedsFailing {
    async fn up(&self) -> anyhow::Result<()> {
        panic!("must not start after its dependency failed");
    }
}

impl ModuleFactory for NeedsFailing {
    const NAME: &'static str = "needs_failing";
    fn dependencies() -> Dependencies {
        Dependencies::new().with::<Failing>()
    }
    fn build(_ctx: ModuleCtx, _deps: &Resolved) -> anyhow::Result<Self> {
        Ok(NeedsFailing)
    }
}

#[tokio::test]
async fn hook_failure_aborts_dependents_without_rollback() {
    let c = container();
    c.register_module::<Journal>().unwrap();
    c.register_module::<Loner>().unwrap();
    c.register_module::<NeedsFailing>().unwrap();
    c.register_module::<Failing>().unwrap();

    let started = std::time::Instant::now();
    let err = c.up(T).await.unwrap_err();
    assert!(started.elapsed() < T, "dependents must not wait for the timeout");

    let ContainerError::Hook {
        direction,
        module,
        source,
    } = err
    else {
        panic!("expected hook error");
    };
    assert_eq!(direction, Direction::Up);
    assert_eq!(module, "failing");
    assert_eq!(source.root_cause().to_string(), "socket in use");

    let states = c.states();
    assert!(states.is_up("loner"));
    assert!(!states.is_up("needs_failing"));
    assert!(states.has_failed("needs_failing"));

    // Only started modules are brought down.
    c.down(T).await.unwrap();
    assert!(c.states().all_down());
}

/// Comes up, then never finishes going down.
struct Stuck;

#[async_trait]
impl Module for Stuck {
    async fn down(&self) -> anyhow::Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

impl ModuleFactory for Stuck {
    const NAME: &'static str = "stuck";
    fn dependencies() -> Dependencies {
        Dependencies::new().with::<Base>()
    }
    fn build(_ctx: ModuleCtx, _deps: &Resolved) -> anyhow::Result<Self> {
        Ok(Stuck)
    }
}

#[tokio::test]
async fn hanging_down_hook_times_out_and_keeps_dependencies_up() {
    let c = container();
    c.register_module::<Journal>().unwrap();
    c.register_module::<Base>().unwrap();
    c.register_module::<Stuck>().unwrap();
    c.up(T).await.unwrap();

    let err = c.down(Duration::from_millis(200)).await.unwrap_err();
    match err {
        ContainerError::Timeout {
            direction,
            module,
            in_hook,
            ..
        } => {
            assert_eq!(direction, Direction::Down);
            assert_eq!(module, "stuck");
            assert!(in_hook);
        }
        other => panic!("expected timeout, got {other}"),
    }
    let states = c.states();
    assert!(states.is_up("base"));
    assert!(states.is_up("stuck"));
    assert_eq!(c.module::<Journal>().unwrap().count("base:down"), 0);
}

struct BrokenDown;

#[async_trait]
impl Module for BrokenDown {
    async fn down(&self) -> anyhow::Result<()> {
        anyhow::bail!("flush rejected")
    }
}

impl ModuleFactory for BrokenDown {
    const NAME: &'static str = "broken_down";
    fn dependencies() -> Dependencies {
        Dependencies::new().with::<Base>()
    }
    fn build(_ctx: ModuleCtx, _deps: &Resolved) -> anyhow::Result<Self> {
        Ok(BrokenDown)
    }
}

#[tokio::test]
async fn failing_down_hook_aborts_its_dependencies() {
    let c = container();
    c.register_module::<Journal>().unwrap();
    c.register_module::<Base>().unwrap();
    c.register_module::<BrokenDown>().unwrap();
    c.register_module::<Loner>().unwrap();
    c.up(T).await.unwrap();

    let started = std::time::Instant::now();
    let err = c.down(T).await.unwrap_err();
    assert!(started.elapsed() < T, "dependencies must not wait for the timeout");
    let ContainerError::Hook {
        direction, module, ..
    } = err
    else {
        panic!("expected hook error, got {err}");
    };
    assert_eq!(direction, Direction::Down);
    assert_eq!(module, "broken_down");

    // `base` gave up with DependencyAborted instead of running its hook.
    let states = c.states();
    assert!(states.has_failed("broken_down"));
    assert!(states.has_failed("base"));
    assert!(states.is_up("base"));
    assert!(!states.is_up("loner"));
    let journal = c.module::<Journal>().unwrap();
    assert_eq!(journal.count("base:down"), 0);
    assert_eq!(journal.count("loner:down:end"), 1);
}

struct Unbuildable;

#[async_trait]
impl Module for Unbuildable {}

impl ModuleFactory for Unbuildable {
    const NAME: &'static str = "unbuildable";
    fn build(_ctx: ModuleCtx, _deps: &Resolved) -> anyhow::Result<Self> {
        anyhow::bail!("missing credentials")
    }
}

#[tokio::test]
async fn construction_errors_name_the_module() {
    let c = container();
    c.register_module::<Unbuildable>().unwrap();
    let err = c.build().unwrap_err();
    assert_eq!(err.module(), Some("unbuildable"));
    assert_eq!(err.as_label(), "construct_failed");
    // A failed build can be retried and keeps failing the same way.
    assert!(c.build().is_err());
}

struct Identity {
    ctx: ModuleCtx,
}

#[async_trait]
impl Module for Identity {}

impl ModuleFactory for Identity {
    const NAME: &'static str = "identity";
    fn build(ctx: ModuleCtx, _deps: &Resolved) -> anyhow::Result<Self> {
        Ok(Identity { ctx })
    }
}

#[tokio::test]
async fn context_carries_identity_and_environment() {
    let c = Container::with_environment("billing", Environment::from_pairs([("REGION", "eu")]));
    c.register_module::<Identity>().unwrap();
    c.build().unwrap();
    let module = c.module::<Identity>().unwrap();
    assert_eq!(module.ctx.identity(), "billing.identity");
    assert_eq!(module.ctx.container_name(), "billing");
    assert_eq!(module.ctx.environment().get("REGION"), Some("eu"));
    assert_eq!(module.ctx.log().source(), "billing.identity");
    assert_eq!(module.ctx.instance_id(), c.instance_id());
}
