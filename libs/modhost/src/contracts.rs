use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;

use crate::context::ModuleCtx;
use crate::deps::{Dependencies, Resolved};

/// Lifecycle hooks of a registered module.
///
/// `up` runs after every dependency finished its own `up`; `down` runs after
/// every dependent finished its own `down`.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    async fn up(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn down(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Synchronous, best-effort teardown. Must not block.
    fn destroy(&self) {}
}

/// Construction side of a module: its name, dependency list and constructor.
pub trait ModuleFactory: Module + Sized {
    const NAME: &'static str;

    /// Merge inherited lists with [`Dependencies::merge`].
    fn dependencies() -> Dependencies {
        Dependencies::new()
    }

    /// Called once, after every dependency was constructed.
    ///
    /// # Errors
    /// Any error aborts the container build.
    fn build(ctx: ModuleCtx, deps: &Resolved) -> anyhow::Result<Self>;
}

/// Result stream of a method invocation.
pub type MethodStream = BoxStream<'static, anyhow::Result<Value>>;

/// Modules reachable through inbound remote calls.
pub trait CallableModule: Send + Sync + 'static {
    /// Resolves `method` and starts it. Values are pulled by the caller.
    ///
    /// # Errors
    /// `MethodError::NotFound` for an unknown method, `InvalidArguments` when
    /// the arguments cannot be used.
    fn call(&self, method: &str, args: Vec<Value>) -> Result<MethodStream, MethodError>;
}

#[derive(thiserror::Error, Debug)]
pub enum MethodError {
    #[error("method '{method}' not found on '{target}'")]
    NotFound { target: String, method: String },

    #[error("call target '{target}' not found")]
    TargetNotFound { target: String },

    #[error("invalid arguments for '{method}': {reason}")]
    InvalidArguments { method: String, reason: String },
}

impl MethodError {
    #[must_use]
    pub fn as_label(&self) -> &'static str {
        match self {
            MethodError::NotFound { .. } => "method_not_found",
            MethodError::TargetNotFound { .. } => "target_not_found",
            MethodError::InvalidArguments { .. } => "invalid_arguments",
        }
    }

    pub fn not_found(target: impl Into<String>, method: impl Into<String>) -> Self {
        MethodError::NotFound {
            target: target.into(),
            method: method.into(),
        }
    }

    pub fn invalid_arguments(method: impl Into<String>, reason: impl Into<String>) -> Self {
        MethodError::InvalidArguments {
            method: method.into(),
            reason: reason.into(),
        }
    }
}

/// Helpers for building [`MethodStream`]s.
pub mod method {
    use super::{MethodStream, StreamExt, Value, stream};
    use std::future::Future;

    /// A single value.
    #[must_use]
    pub fn value(v: Value) -> MethodStream {
        stream::iter([Ok(v)]).boxed()
    }

    /// A finite sequence of values.
    pub fn values<I>(values: I) -> MethodStream
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        stream::iter(values.into_iter().map(Ok)).boxed()
    }

    /// The single result of an async computation.
    pub fn once<F>(fut: F) -> MethodStream
    where
        F: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        stream::once(fut).boxed()
    }

    /// A stream that fails immediately.
    #[must_use]
    pub fn error(err: anyhow::Error) -> MethodStream {
        stream::iter([Err(err)]).boxed()
    }

    /// Never yields and never completes.
    #[must_use]
    pub fn pending() -> MethodStream {
        stream::pending().boxed()
    }
}

/// Reads the numeric argument at `index`.
///
/// # Errors
/// `InvalidArguments` when the argument is missing or not a number.
pub fn number_arg(method: &str, args: &[Value], index: usize) -> Result<f64, MethodError> {
    args.get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| MethodError::invalid_arguments(method, format!("argument {index} must be a number")))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn method_helpers() {
        let all: Vec<_> = method::values([json!(1), json!(2)])
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(all, [json!(1), json!(2)]);

        let one: Vec<_> = method::once(async { Ok(json!("x")) })
            .map(Result::unwrap)
            .collect()
            .await;
        assert_eq!(one, [json!("x")]);

        let mut failing = method::error(anyhow::anyhow!("nope"));
        assert!(failing.next().await.unwrap().is_err());
        assert!(failing.next().await.is_none());
    }

    #[test]
    fn number_arg_validates() {
        let n = number_arg("double", &[json!(4)], 0).unwrap();
        assert!((n - 4.0).abs() < f64::EPSILON);
        let err = number_arg("double", &[json!("x")], 0).unwrap_err();
        assert_eq!(err.as_label(), "invalid_arguments");
        assert!(number_arg("double", &[], 0).is_err());
    }
}
