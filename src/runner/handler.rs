//! Execution-engine seam: handlers that run one event's workload.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ExecutionError;
use crate::runner::task::TaskAssignment;

/// Runs the workload for one kind of event.
///
/// Implementations must be safe to invoke concurrently for distinct tasks
/// and should stop promptly once `cancel` fires; the supervisor stops
/// waiting at that point whether or not they do.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Event name this handler accepts (e.g. `push`).
    fn event(&self) -> &str;

    async fn run(
        &self,
        cancel: CancellationToken,
        task: &TaskAssignment,
    ) -> Result<(), ExecutionError>;
}

/// Registry of event handlers, keyed by event name.
///
/// Populated at startup and read-only afterwards.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. A later registration for the same event wins.
    pub fn register(&mut self, handler: Arc<dyn EventHandler>) {
        let event = handler.event().to_string();
        if self.handlers.insert(event.clone(), handler).is_some() {
            tracing::warn!(event = %event, "Replaced existing event handler");
        } else {
            tracing::debug!(event = %event, "Registered event handler");
        }
    }

    pub fn get(&self, event: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(event).cloned()
    }

    /// Registered event names, sorted.
    pub fn events(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Script, ScriptedHandler};
    use super::*;

    #[test]
    fn register_and_get() {
        let mut registry = HandlerRegistry::new();
        registry.register(ScriptedHandler::new("push", Script::Succeed));
        registry.register(ScriptedHandler::new("pull_request", Script::Succeed));

        assert!(registry.get("deploy").is_none());
        assert_eq!(registry.get("push").unwrap().event(), "push");
        assert_eq!(registry.events(), vec!["pull_request", "push"]);
    }

    #[test]
    fn later_registration_wins() {
        let mut registry = HandlerRegistry::new();
        registry.register(ScriptedHandler::new("push", Script::Succeed));
        registry.register(ScriptedHandler::new("push", Script::Fail("x".into())));
        assert_eq!(registry.events(), vec!["push"]);
        assert_eq!(registry.get("push").unwrap().event(), "push");
    }
}
