/// Payload published on the notification channel whenever the response log grows.
pub const NEW_RESPONSE_NOTIFICATION: &str = "new";

/// Value stored under the liveness key while a run is active.
pub const LIVENESS_MARKER: &str = "running";

/// Coordination-store key and channel names for a single run.
///
/// Every component derives names from here so workers and readers agree on the
/// namespace without sharing any other state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunKeys {
    run_id: String,
}

impl RunKeys {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn lock(&self) -> String {
        format!("agent_run_lock:{}", self.run_id)
    }

    pub fn responses(&self) -> String {
        format!("agent_run:{}:responses", self.run_id)
    }

    pub fn notifications(&self) -> String {
        format!("agent_run:{}:new_response", self.run_id)
    }

    pub fn broadcast_control(&self) -> String {
        format!("agent_run:{}:control", self.run_id)
    }

    pub fn instance_control(&self, instance_id: &str) -> String {
        format!("agent_run:{}:control:{}", self.run_id, instance_id)
    }

    pub fn liveness(&self, instance_id: &str) -> String {
        format!("active_run:{}:{}", instance_id, self.run_id)
    }
}
