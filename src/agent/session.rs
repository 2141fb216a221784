//! Agent sessions and their steps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actions::ActionDecision;

/// Session lifecycle errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Device {0} already has a running session")]
    DeviceBusy(String),
    #[error("Device not connected: {0}")]
    DeviceNotConnected(String),
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Goal text is empty")]
    EmptyGoal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Outcome of dispatching a step's action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub success: bool,
    pub message: String,
}

/// One loop iteration that reached a decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub number: u32,
    pub decision: ActionDecision,
    /// Digest of the screen the decision was made on.
    pub screen_hash: String,
    /// Attached once, after dispatch.
    pub result: Option<StepOutcome>,
    pub created_at: DateTime<Utc>,
}

impl Step {
    pub fn new(number: u32, decision: ActionDecision, screen_hash: impl Into<String>) -> Self {
        Self {
            number,
            decision,
            screen_hash: screen_hash.into(),
            result: None,
            created_at: Utc::now(),
        }
    }
}

/// A goal being pursued on one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSession {
    pub id: String,
    pub device_id: String,
    pub account_id: String,
    pub goal: String,
    pub status: SessionStatus,
    pub steps: Vec<Step>,
    pub steps_used: u32,
    /// Final message: the done message, or why the session failed.
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl AgentSession {
    pub fn new(
        device_id: impl Into<String>,
        account_id: impl Into<String>,
        goal: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            account_id: account_id.into(),
            goal: goal.into(),
            status: SessionStatus::Running,
            steps: Vec::new(),
            steps_used: 0,
            message: None,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == SessionStatus::Running
    }
}

/// Cooperative cancellation flag shared between a session and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session_is_running() {
        let session = AgentSession::new("d1", "acct", "open settings");
        assert!(session.is_running());
        assert!(!session.status.is_terminal());
        assert_eq!(session.steps_used, 0);
        assert_ne!(session.id, AgentSession::new("d1", "acct", "x").id);
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_cancelled());
        clone.cancel();
        assert!(flag.is_cancelled());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(SessionStatus::Completed).unwrap(),
            serde_json::json!("completed")
        );
    }
}
