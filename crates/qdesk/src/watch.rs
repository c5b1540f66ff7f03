//! Watched expressions: small auxiliary queries re-evaluated after every
//! primary query, for live-value monitoring.

use std::sync::Mutex;

use futures::future::BoxFuture;
use tracing::debug;

use crate::driver::Value;
use crate::error::Result;

/// One watched expression and its latest observed value.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchedExpression {
    pub expression: String,
    /// Latest result; `None` before the first refresh or after a failure.
    pub last: Option<Value>,
    /// Whether the last refresh produced a different value.
    pub changed: bool,
}

impl WatchedExpression {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            last: None,
            changed: false,
        }
    }
}

/// The set of watched expressions, refreshed as a batch.
#[derive(Default)]
pub struct WatchList {
    items: Mutex<Vec<WatchedExpression>>,
}

impl WatchList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an expression. Duplicates are ignored.
    pub fn add(&self, expression: impl Into<String>) {
        let expression = expression.into();
        let mut items = self.items.lock().unwrap();
        if !items.iter().any(|w| w.expression == expression) {
            items.push(WatchedExpression::new(expression));
        }
    }

    pub fn remove(&self, expression: &str) {
        self.items.lock().unwrap().retain(|w| w.expression != expression);
    }

    pub fn clear(&self) {
        self.items.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<WatchedExpression> {
        self.items.lock().unwrap().clone()
    }

    /// Re-evaluate every expression sequentially through `eval`.
    ///
    /// A failing expression has its last value set to `None` instead of
    /// aborting the batch. The changed flag compares against the previous
    /// value. Expressions removed mid-refresh are skipped when results are
    /// written back.
    pub async fn refresh<F>(&self, eval: F)
    where
        F: Fn(String) -> BoxFuture<'static, Result<Value>>,
    {
        let expressions: Vec<String> = self
            .items
            .lock()
            .unwrap()
            .iter()
            .map(|w| w.expression.clone())
            .collect();

        let mut results = Vec::with_capacity(expressions.len());
        for expression in expressions {
            let value = match eval(expression.clone()).await {
                Ok(value) => Some(value),
                Err(e) => {
                    debug!("watched expression '{}' failed: {}", expression, e);
                    None
                }
            };
            results.push((expression, value));
        }

        let mut items = self.items.lock().unwrap();
        for (expression, value) in results {
            if let Some(watch) = items.iter_mut().find(|w| w.expression == expression) {
                watch.changed = watch.last != value;
                watch.last = value;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QdeskError;

    fn eval_ok(value: i64) -> impl Fn(String) -> BoxFuture<'static, Result<Value>> {
        move |_| Box::pin(async move { Ok(Value::Long(value)) })
    }

    #[tokio::test]
    async fn test_refresh_sets_values_and_changed_flags() {
        let watches = WatchList::new();
        watches.add(".z.t");
        watches.add("count trade");

        watches.refresh(eval_ok(1)).await;
        let snap = watches.snapshot();
        assert!(snap.iter().all(|w| w.last == Some(Value::Long(1))));
        assert!(snap.iter().all(|w| w.changed));

        // Same values again: nothing changed.
        watches.refresh(eval_ok(1)).await;
        assert!(watches.snapshot().iter().all(|w| !w.changed));

        watches.refresh(eval_ok(2)).await;
        assert!(watches.snapshot().iter().all(|w| w.changed));
    }

    #[tokio::test]
    async fn test_failure_nulls_value_without_aborting_batch() {
        let watches = WatchList::new();
        watches.add("bad");
        watches.add("good");

        watches
            .refresh(|expr| {
                Box::pin(async move {
                    if expr == "bad" {
                        Err(QdeskError::remote("type"))
                    } else {
                        Ok(Value::Long(7))
                    }
                })
            })
            .await;

        let snap = watches.snapshot();
        assert_eq!(snap[0].last, None);
        assert!(!snap[0].changed); // was None, still None
        assert_eq!(snap[1].last, Some(Value::Long(7)));
        assert!(snap[1].changed);
    }

    #[tokio::test]
    async fn test_duplicate_add_ignored_and_remove() {
        let watches = WatchList::new();
        watches.add("x");
        watches.add("x");
        assert_eq!(watches.len(), 1);

        watches.remove("x");
        assert!(watches.is_empty());
    }
}
