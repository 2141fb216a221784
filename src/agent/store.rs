//! Session persistence.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;

use super::session::{AgentSession, SessionStatus, Step, StepOutcome};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Session {session_id} already has step {step}")]
    DuplicateStep { session_id: String, step: u32 },
    #[error("Session {session_id} has no step {step}")]
    StepNotFound { session_id: String, step: u32 },
    #[error("Step {step} of session {session_id} already has a result")]
    ResultAlreadyAttached { session_id: String, step: u32 },
}

/// Where sessions and their steps are kept.
///
/// A step is recorded once; only its result is attached afterwards.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, session: &AgentSession) -> Result<(), StoreError>;

    async fn record_step(&self, session_id: &str, step: &Step) -> Result<(), StoreError>;

    async fn attach_result(
        &self,
        session_id: &str,
        step: u32,
        outcome: &StepOutcome,
    ) -> Result<(), StoreError>;

    async fn finish(
        &self,
        session_id: &str,
        status: SessionStatus,
        steps_used: u32,
        message: Option<String>,
    ) -> Result<(), StoreError>;

    async fn get(&self, session_id: &str) -> Result<Option<AgentSession>, StoreError>;

    async fn list_for_account(&self, account_id: &str) -> Result<Vec<AgentSession>, StoreError>;
}

/// In-process [`SessionStore`].
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: DashMap<String, AgentSession>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: &AgentSession) -> Result<(), StoreError> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn record_step(&self, session_id: &str, step: &Step) -> Result<(), StoreError> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        if session.steps.iter().any(|s| s.number == step.number) {
            return Err(StoreError::DuplicateStep {
                session_id: session_id.to_string(),
                step: step.number,
            });
        }
        session.steps_used = session.steps_used.max(step.number);
        session.steps.push(step.clone());
        Ok(())
    }

    async fn attach_result(
        &self,
        session_id: &str,
        step: u32,
        outcome: &StepOutcome,
    ) -> Result<(), StoreError> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        let record = session
            .steps
            .iter_mut()
            .find(|s| s.number == step)
            .ok_or_else(|| StoreError::StepNotFound {
                session_id: session_id.to_string(),
                step,
            })?;
        if record.result.is_some() {
            return Err(StoreError::ResultAlreadyAttached {
                session_id: session_id.to_string(),
                step,
            });
        }
        record.result = Some(outcome.clone());
        Ok(())
    }

    async fn finish(
        &self,
        session_id: &str,
        status: SessionStatus,
        steps_used: u32,
        message: Option<String>,
    ) -> Result<(), StoreError> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        session.status = status;
        session.steps_used = steps_used;
        session.message = message;
        session.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<AgentSession>, StoreError> {
        Ok(self.sessions.get(session_id).map(|s| s.clone()))
    }

    async fn list_for_account(&self, account_id: &str) -> Result<Vec<AgentSession>, StoreError> {
        let mut sessions: Vec<AgentSession> = self
            .sessions
            .iter()
            .filter(|s| s.account_id == account_id)
            .map(|s| s.clone())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{Action, ActionDecision};

    fn step(number: u32) -> Step {
        Step::new(number, ActionDecision::new(Action::Back, "go back"), "abc")
    }

    #[tokio::test]
    async fn test_step_recorded_once_result_attached_once() {
        let store = MemorySessionStore::new();
        let session = AgentSession::new("d1", "acct", "goal");
        store.create(&session).await.unwrap();

        store.record_step(&session.id, &step(1)).await.unwrap();
        assert!(matches!(
            store.record_step(&session.id, &step(1)).await,
            Err(StoreError::DuplicateStep { step: 1, .. })
        ));

        let outcome = StepOutcome {
            success: true,
            message: "ok".to_string(),
        };
        store.attach_result(&session.id, 1, &outcome).await.unwrap();
        assert!(matches!(
            store.attach_result(&session.id, 1, &outcome).await,
            Err(StoreError::ResultAlreadyAttached { .. })
        ));
        assert!(matches!(
            store.attach_result(&session.id, 2, &outcome).await,
            Err(StoreError::StepNotFound { step: 2, .. })
        ));

        let stored = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.steps.len(), 1);
        assert_eq!(stored.steps[0].result, Some(outcome));
    }

    #[tokio::test]
    async fn test_finish_and_list() {
        let store = MemorySessionStore::new();
        let a = AgentSession::new("d1", "acct", "a");
        let b = AgentSession::new("d2", "other", "b");
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();

        store
            .finish(&a.id, SessionStatus::Failed, 3, Some("max steps".to_string()))
            .await
            .unwrap();
        let listed = store.list_for_account("acct").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, SessionStatus::Failed);
        assert_eq!(listed[0].steps_used, 3);
        assert!(listed[0].finished_at.is_some());

        assert_eq!(
            store.finish("nope", SessionStatus::Completed, 0, None).await,
            Err(StoreError::NotFound("nope".to_string()))
        );
    }
}
