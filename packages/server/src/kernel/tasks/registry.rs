//! Registry mapping queue names to stage executors.
//!
//! The worker runtime claims tasks from the database and dispatches them
//! through this registry without knowing the concrete stage types. Each
//! queue may also register an exhaustion hook, invoked when a task runs out
//! of retries, so the owning stage can be marked failed.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::task::{Task, TaskFailure};
use crate::kernel::deps::ServerDeps;

type BoxedHandler = Box<
    dyn Fn(Task, Arc<ServerDeps>) -> Pin<Box<dyn Future<Output = Result<(), TaskFailure>> + Send>>
        + Send
        + Sync,
>;

type BoxedExhaustedHook = Box<
    dyn Fn(Task, String, Arc<ServerDeps>) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

struct QueueRegistration {
    handler: BoxedHandler,
    on_exhausted: Option<BoxedExhaustedHook>,
}

#[derive(Default)]
pub struct TaskRegistry {
    registrations: HashMap<&'static str, QueueRegistration>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            registrations: HashMap::new(),
        }
    }

    /// Register the executor for a queue.
    pub fn register<F, Fut>(&mut self, queue: &'static str, handler: F)
    where
        F: Fn(Task, Arc<ServerDeps>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskFailure>> + Send + 'static,
    {
        let boxed: BoxedHandler = Box::new(move |task, deps| Box::pin(handler(task, deps)));
        self.registrations.insert(
            queue,
            QueueRegistration {
                handler: boxed,
                on_exhausted: None,
            },
        );
    }

    /// Register the exhaustion hook for a queue. Must be called after
    /// `register` for the same queue.
    pub fn on_exhausted<F, Fut>(&mut self, queue: &'static str, hook: F)
    where
        F: Fn(Task, String, Arc<ServerDeps>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if let Some(registration) = self.registrations.get_mut(queue) {
            registration.on_exhausted = Some(Box::new(move |task, error, deps| {
                Box::pin(hook(task, error, deps))
            }));
        }
    }

    /// Execute a claimed task via its registered handler.
    pub async fn execute(&self, task: &Task, deps: Arc<ServerDeps>) -> Result<(), TaskFailure> {
        let registration = self
            .registrations
            .get(task.queue.as_str())
            .ok_or_else(|| TaskFailure::permanent(format!("unknown queue: {}", task.queue)))?;

        (registration.handler)(task.clone(), deps).await
    }

    /// Invoke the exhaustion hook for a dead-lettered task.
    pub async fn exhausted(&self, task: &Task, error: &str, deps: Arc<ServerDeps>) {
        if let Some(registration) = self.registrations.get(task.queue.as_str()) {
            if let Some(hook) = &registration.on_exhausted {
                hook(task.clone(), error.to_string(), deps).await;
            }
        }
    }

    pub fn is_registered(&self, queue: &str) -> bool {
        self.registrations.contains_key(queue)
    }

    /// All registered queue names.
    pub fn queues(&self) -> Vec<&'static str> {
        self.registrations.keys().copied().collect()
    }
}

/// Thread-safe registry wrapped in Arc.
pub type SharedTaskRegistry = Arc<TaskRegistry>;
