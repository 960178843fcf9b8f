// Request Context
// Immutable carrier threaded through every call that can reach the database.
// Holds request-scoped values (the tenant id among them), an optional deadline
// and a cancellation token.

use crate::error::{DatabaseError, Result};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type Value = Arc<dyn Any + Send + Sync>;

/// Request-scoped context. Cloning is cheap; deriving never mutates the parent.
#[derive(Clone)]
pub struct Context {
    values: Arc<HashMap<&'static str, Value>>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Context {
    /// Root context: no values, no deadline, never cancelled unless derived
    pub fn background() -> Self {
        Self {
            values: Arc::new(HashMap::new()),
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Derive a context carrying `value` under `key`
    pub fn with_value<T>(&self, key: &'static str, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        let mut values = (*self.values).clone();
        values.insert(key, Arc::new(value));
        Self {
            values: Arc::new(values),
            deadline: self.deadline,
            cancel: self.cancel.clone(),
        }
    }

    /// Typed lookup; `None` when the key is absent or holds another type
    pub fn value<T: Any>(&self, key: &str) -> Option<&T> {
        self.raw_value(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub(crate) fn raw_value(&self, key: &str) -> Option<&(dyn Any + Send + Sync)> {
        self.values.get(key).map(|v| v.as_ref())
    }

    /// Derive a context that expires after `timeout`, or earlier if the parent does
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context with the earlier of the parent's deadline and `deadline`
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            values: Arc::clone(&self.values),
            deadline: Some(deadline),
            cancel: self.cancel.clone(),
        }
    }

    /// Derive a cancellable context. Cancelling the parent also cancels the child.
    pub fn with_cancel(&self) -> (Self, CancellationToken) {
        let token = self.cancel.child_token();
        let ctx = Self {
            values: Arc::clone(&self.values),
            deadline: self.deadline,
            cancel: token.clone(),
        };
        (ctx, token)
    }

    /// Same values and cancellation, but the deadline is replaced by now + `timeout`
    /// regardless of what the parent allowed
    pub fn detached_with_timeout(&self, timeout: Duration) -> Self {
        Self {
            values: Arc::clone(&self.values),
            deadline: Some(Instant::now() + timeout),
            cancel: self.cancel.clone(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancelled, or past the deadline
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Drive `fut` to completion unless the context is cancelled or expires first.
    /// On cancellation the future is dropped, releasing any pooled connection it holds.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancel.is_cancelled() {
            return Err(DatabaseError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(DatabaseError::DeadlineExceeded);
        }

        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DatabaseError::Cancelled),
            _ = expired => Err(DatabaseError::DeadlineExceeded),
            result = fut => result,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&&str> = self.values.keys().collect();
        keys.sort();
        f.debug_struct("Context")
            .field("keys", &keys)
            .field("deadline", &self.deadline)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
