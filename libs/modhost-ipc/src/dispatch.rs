use modhost::{ContainerHandle, MethodError, MethodStream};
use serde_json::Value;

/// Resolves inbound `CallRequest`s to method streams.
pub trait CallDispatcher: Send + Sync + 'static {
    /// # Errors
    /// `TargetNotFound` for an unknown target, otherwise whatever the target's
    /// method lookup reports.
    fn dispatch(&self, target: &str, method: &str, args: Vec<Value>)
    -> Result<MethodStream, MethodError>;
}

/// Callable modules of the container, by module name.
impl CallDispatcher for ContainerHandle {
    fn dispatch(
        &self,
        target: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<MethodStream, MethodError> {
        let module = self.callable(target).ok_or_else(|| MethodError::TargetNotFound {
            target: target.to_owned(),
        })?;
        module.call(method, args)
    }
}

/// Rejects every call; used by channels that only carry events and telemetry.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDispatch;

impl CallDispatcher for NoDispatch {
    fn dispatch(
        &self,
        target: &str,
        _method: &str,
        _args: Vec<Value>,
    ) -> Result<MethodStream, MethodError> {
        Err(MethodError::TargetNotFound {
            target: target.to_owned(),
        })
    }
}
