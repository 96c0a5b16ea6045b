//! Values bound to the execution of one future, readable anywhere inside it.
//!
//! Inbound remote calls run inside a scope carrying `call.id`, `call.target`
//! and `call.method`, so code deep inside a method can tell which call it is
//! serving without threading the data through every signature.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

tokio::task_local! {
    static SCOPE: ScopeValues;
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScopeValues {
    values: Arc<BTreeMap<String, Value>>,
}

impl ScopeValues {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        Arc::make_mut(&mut self.values).insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    fn layered_on(&self, outer: &ScopeValues) -> ScopeValues {
        let mut merged = (*outer.values).clone();
        merged.extend(self.values.iter().map(|(k, v)| (k.clone(), v.clone())));
        ScopeValues {
            values: Arc::new(merged),
        }
    }
}

/// Runs `fut` with `values` in scope. Nested scopes see the outer values
/// unless they override the same key.
pub async fn run<F>(values: ScopeValues, fut: F) -> F::Output
where
    F: Future,
{
    let values = match current() {
        Some(outer) => values.layered_on(&outer),
        None => values,
    };
    SCOPE.scope(values, fut).await
}

/// Value of `key` in the current scope.
#[must_use]
pub fn get(key: &str) -> Option<Value> {
    SCOPE
        .try_with(|scope| scope.get(key).cloned())
        .ok()
        .flatten()
}

/// All values of the current scope, or `None` outside any scope.
#[must_use]
pub fn current() -> Option<ScopeValues> {
    SCOPE.try_with(Clone::clone).ok()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn values_visible_only_inside() {
        assert!(get("call.id").is_none());
        let inside = run(ScopeValues::new().with("call.id", 7), async { get("call.id") }).await;
        assert_eq!(inside, Some(json!(7)));
        assert!(get("call.id").is_none());
    }

    #[tokio::test]
    async fn nested_scopes_layer() {
        let outer = ScopeValues::new().with("a", 1).with("b", 2);
        let (a, b) = run(outer, async {
            run(ScopeValues::new().with("b", 3), async { (get("a"), get("b")) }).await
        })
        .await;
        assert_eq!(a, Some(json!(1)));
        assert_eq!(b, Some(json!(3)));
    }

    #[tokio::test]
    async fn scope_survives_awaits() {
        let got = run(ScopeValues::new().with("k", "v"), async {
            tokio::task::yield_now().await;
            tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            get("k")
        })
        .await;
        assert_eq!(got, Some(json!("v")));
    }
}
