use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::contracts::MethodError;

/// Lifecycle direction a hook was running in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration, construction and lifecycle failures of a [`crate::Container`].
#[derive(thiserror::Error, Debug)]
pub enum ContainerError {
    #[error("module '{module}' is already registered")]
    DuplicateModule { module: String },

    #[error("container '{container}' is already built; cannot register '{module}'")]
    AlreadyBuilt { container: String, module: String },

    #[error("module '{module}' depends on '{dependency}', which is not registered")]
    UnknownDependency { module: String, dependency: String },

    #[error("cyclic module dependencies: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("module '{module}' did not declare a dependency on '{dependency}'")]
    UndeclaredDependency { module: String, dependency: String },

    #[error("failed to construct module '{module}'")]
    Construct {
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("module '{module}' did not finish '{direction}' within {timeout:?}")]
    Timeout {
        direction: Direction,
        module: String,
        timeout: Duration,
        /// `true` when the hook itself was running, `false` when the module was
        /// still waiting on other modules.
        in_hook: bool,
    },

    #[error("module '{module}' failed during '{direction}'")]
    Hook {
        direction: Direction,
        module: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("module '{module}' abandoned '{direction}' because '{dependency}' failed")]
    DependencyAborted {
        direction: Direction,
        module: String,
        dependency: String,
    },

    #[error("module '{module}' is not registered")]
    ModuleNotFound { module: String },

    #[error("container '{container}' has not been built")]
    NotBuilt { container: String },
}

impl ContainerError {
    #[must_use]
    pub fn as_label(&self) -> &'static str {
        match self {
            ContainerError::DuplicateModule { .. } => "duplicate_module",
            ContainerError::AlreadyBuilt { .. } => "already_built",
            ContainerError::UnknownDependency { .. } => "unknown_dependency",
            ContainerError::CyclicDependency { .. } => "cyclic_dependency",
            ContainerError::UndeclaredDependency { .. } => "undeclared_dependency",
            ContainerError::Construct { .. } => "construct_failed",
            ContainerError::Timeout { .. } => "lifecycle_timeout",
            ContainerError::Hook { .. } => "hook_failed",
            ContainerError::DependencyAborted { .. } => "dependency_aborted",
            ContainerError::ModuleNotFound { .. } => "module_not_found",
            ContainerError::NotBuilt { .. } => "not_built",
        }
    }

    /// Module the error is attributed to, when there is one.
    #[must_use]
    pub fn module(&self) -> Option<&str> {
        match self {
            ContainerError::DuplicateModule { module }
            | ContainerError::AlreadyBuilt { module, .. }
            | ContainerError::UnknownDependency { module, .. }
            | ContainerError::UndeclaredDependency { module, .. }
            | ContainerError::Construct { module, .. }
            | ContainerError::Timeout { module, .. }
            | ContainerError::Hook { module, .. }
            | ContainerError::DependencyAborted { module, .. }
            | ContainerError::ModuleNotFound { module } => Some(module),
            ContainerError::CyclicDependency { .. } | ContainerError::NotBuilt { .. } => None,
        }
    }
}

/// Serializable error chain.
///
/// Used wherever an error leaves the process: remote call failures and
/// structured log messages. `name` is a stable snake_case label, `cause` is the
/// next link of the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<RemoteError>>,
}

/// Resolves a stable label for an error type the core does not know about.
pub type ErrorNamer = fn(&(dyn StdError + 'static)) -> Option<&'static str>;

impl RemoteError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            data: None,
            cause: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: RemoteError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Walks `source()` links, labelling each layer.
    #[must_use]
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        Self::from_error_with(err, |_| None)
    }

    /// Same as [`RemoteError::from_error`] with extra labels supplied by `namer`.
    #[must_use]
    pub fn from_error_with(err: &(dyn StdError + 'static), namer: ErrorNamer) -> Self {
        let mut layers = Vec::new();
        let mut current = Some(err);
        let mut tail = None;
        while let Some(e) = current {
            // An embedded remote chain is kept as-is.
            if let Some(remote) = e.downcast_ref::<RemoteError>() {
                tail = Some(remote.clone());
                break;
            }
            layers.push(RemoteError::new(label_of(e, namer), e.to_string()));
            current = e.source();
        }
        layers.into_iter().rev().fold(tail, |cause, mut layer| {
            layer.cause = cause.map(Box::new);
            Some(layer)
        })
        .unwrap_or_else(|| RemoteError::new("error", err.to_string()))
    }

    #[must_use]
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        Self::from_anyhow_with(err, |_| None)
    }

    #[must_use]
    pub fn from_anyhow_with(err: &anyhow::Error, namer: ErrorNamer) -> Self {
        let root: &(dyn StdError + 'static) = err.as_ref();
        Self::from_error_with(root, namer)
    }

    /// Iterates the chain starting at `self`.
    pub fn chain(&self) -> impl Iterator<Item = &RemoteError> {
        std::iter::successors(Some(self), |e| e.cause.as_deref())
    }

    /// Names of every link, outermost first.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.chain().map(|e| e.name.as_str())
    }

    #[must_use]
    pub fn root_cause(&self) -> &RemoteError {
        self.chain().last().unwrap_or(self)
    }
}

fn label_of(err: &(dyn StdError + 'static), namer: ErrorNamer) -> &'static str {
    if let Some(name) = namer(err) {
        return name;
    }
    if let Some(e) = err.downcast_ref::<ContainerError>() {
        return e.as_label();
    }
    if let Some(e) = err.downcast_ref::<MethodError>() {
        return e.as_label();
    }
    if err.is::<std::io::Error>() {
        return "io_error";
    }
    if err.is::<serde_json::Error>() {
        return "json_error";
    }
    "error"
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl StdError for RemoteError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn StdError + 'static))
    }
}
