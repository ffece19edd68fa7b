//! Execution lifecycle events
//!
//! Per module node, `ModuleStart` happens-before `ModuleComplete` or
//! `ModuleFailed`; `ExecutionStart` precedes all module events and exactly
//! one of `ExecutionComplete`/`ExecutionCancelled` follows them. Listeners
//! are invoked fire-and-forget: a panicking listener is contained and
//! cannot affect execution or the other listeners.

use crate::dag::ModuleNodeId;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use uuid::Uuid;

/// One lifecycle event
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    ExecutionStart {
        execution_id: Uuid,
        dag_name: String,
    },
    ModuleStart {
        module: ModuleNodeId,
        name: String,
    },
    ModuleComplete {
        module: ModuleNodeId,
        name: String,
        duration_ms: u64,
    },
    ModuleFailed {
        module: ModuleNodeId,
        name: String,
        error: String,
    },
    ExecutionComplete {
        execution_id: Uuid,
        succeeded: bool,
        duration_ms: u64,
    },
    ExecutionCancelled {
        execution_id: Uuid,
    },
}

/// A registered listener callback
pub type EventListener = Arc<dyn Fn(&ExecutionEvent) + Send + Sync>;

/// Fans events out to listeners, containing their failures
#[derive(Clone, Default)]
pub struct EventSink {
    listeners: Vec<EventListener>,
}

impl EventSink {
    pub fn new(listeners: Vec<EventListener>) -> Self {
        EventSink { listeners }
    }

    pub fn emit(&self, event: &ExecutionEvent) {
        for listener in &self.listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(event)));
            if outcome.is_err() {
                tracing::warn!(?event, "event_listener_panicked");
            }
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
