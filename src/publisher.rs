//! Event publisher hook (C10): best-effort fire-and-forget notifications to
//! a pluggable external bus, invoked only after the owning transaction has
//! committed. Represented as an optional trait object so call sites compile
//! away entirely when no publisher is attached (§9 "Dynamic dispatch").

pub trait EventPublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: serde_json::Value);
}

/// Topics published by the store. Not exhaustive of caller-defined topics,
/// but these are the ones the store itself emits (§4.10).
pub mod topics {
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_CANCELED: &str = "task.canceled";
    pub const TASK_TOKENS: &str = "task.tokens";
    pub const TASK_METRICS: &str = "task.metrics";
    pub const PLAN_EXECUTION_STARTED: &str = "plan.execution.started";
    pub const PLAN_STEP_COMPLETED: &str = "plan.step.completed";
    pub const PLAN_EXECUTION_COMPLETED: &str = "plan.execution.completed";
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::EventPublisher;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingPublisher {
        pub events: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl EventPublisher for RecordingPublisher {
        fn publish(&self, topic: &str, payload: serde_json::Value) {
            self.events.lock().unwrap().push((topic.to_string(), payload));
        }
    }
}
