use std::{collections::HashMap, fmt::Debug, hash::Hash, sync::Arc};

use serde_json::Value;

use crate::error::JobsError;
use crate::jobs::context::{HandlerError, JobContext};
use crate::tx::BoxFuture;

/// A closed set of job types, usually an application enum.
///
/// `as_str` is what gets stored in `worker_jobs.type`; `parse` is its inverse
/// and returns `None` for names this build does not know.
pub trait JobKind: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    fn as_str(&self) -> &'static str;
    fn parse(s: &str) -> Option<Self>;
}

pub type HandlerFuture = BoxFuture<'static, Result<Value, HandlerError>>;
pub type HandlerFn = dyn Fn(JobContext) -> HandlerFuture + Send + Sync;

/// Maps each job kind to its handler. Built once at startup, then shared
/// read-only behind an `Arc`.
pub struct JobRegistry<K: JobKind> {
    handlers: HashMap<K, Arc<HandlerFn>>,
}

impl<K: JobKind> Default for JobRegistry<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: JobKind> JobRegistry<K> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn register<F>(&mut self, kind: K, handler: F) -> &mut Self
    where
        F: Fn(JobContext) -> HandlerFuture + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn contains(&self, kind: K) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Resolves a stored type name. Unknown names and known kinds without a
    /// handler both come back as `UnknownJobType`.
    pub fn handler_for(&self, job_type: &str) -> Result<Arc<HandlerFn>, JobsError> {
        K::parse(job_type)
            .and_then(|kind| self.handlers.get(&kind).cloned())
            .ok_or_else(|| JobsError::UnknownJobType(job_type.to_string()))
    }
}

/// Boxes a handler future.
pub fn boxed<F>(fut: F) -> HandlerFuture
where
    F: std::future::Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Box::pin(fut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        Ping,
        Unhandled,
    }

    impl JobKind for Kind {
        fn as_str(&self) -> &'static str {
            match self {
                Kind::Ping => "ping",
                Kind::Unhandled => "unhandled",
            }
        }

        fn parse(s: &str) -> Option<Self> {
            match s {
                "ping" => Some(Kind::Ping),
                "unhandled" => Some(Kind::Unhandled),
                _ => None,
            }
        }
    }

    #[test]
    fn resolves_registered_kinds_only() {
        let mut registry = JobRegistry::new();
        registry.register(Kind::Ping, |_ctx| boxed(async { Ok(json!({"pong": true})) }));

        assert!(registry.contains(Kind::Ping));
        assert!(registry.handler_for("ping").is_ok());
        assert!(matches!(
            registry.handler_for("unhandled"),
            Err(JobsError::UnknownJobType(t)) if t == "unhandled"
        ));
        assert!(matches!(
            registry.handler_for("nope"),
            Err(JobsError::UnknownJobType(_))
        ));
    }
}
