//! Starts, tracks and cancels sessions across devices.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::info;

use super::runner::{SessionOutcome, SessionRunner};
use super::session::{AgentSession, CancelFlag, SessionError};
use crate::ledger::ConnectionLedger;
use crate::skills::LedgerDevice;

/// A session currently owned by a device.
#[derive(Debug, Clone)]
struct RunningSession {
    session_id: String,
    account_id: String,
    cancel: CancelFlag,
}

/// At most one running session per device.
pub struct SessionManager {
    ledger: Arc<ConnectionLedger>,
    runner: Arc<SessionRunner>,
    /// Keyed by persistent device id.
    running: Arc<DashMap<String, RunningSession>>,
}

impl SessionManager {
    pub fn new(ledger: Arc<ConnectionLedger>, runner: Arc<SessionRunner>) -> Self {
        Self {
            ledger,
            runner,
            running: Arc::new(DashMap::new()),
        }
    }

    pub fn runner(&self) -> &Arc<SessionRunner> {
        &self.runner
    }

    /// Start a goal on a device owned by `account_id`.
    ///
    /// Returns the new session id and the task driving it.
    pub fn start_goal(
        &self,
        account_id: &str,
        device_id: &str,
        goal: &str,
    ) -> Result<(String, JoinHandle<SessionOutcome>), SessionError> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(SessionError::EmptyGoal);
        }
        match self.ledger.device(device_id) {
            Some(device) if device.account_id == account_id => {}
            _ => return Err(SessionError::DeviceNotConnected(device_id.to_string())),
        }

        let session = AgentSession::new(device_id, account_id, goal);
        let session_id = session.id.clone();
        let cancel = CancelFlag::new();

        match self.running.entry(device_id.to_string()) {
            Entry::Occupied(_) => return Err(SessionError::DeviceBusy(device_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(RunningSession {
                    session_id: session_id.clone(),
                    account_id: account_id.to_string(),
                    cancel: cancel.clone(),
                });
            }
        }

        let runner = self.runner.clone();
        let running = self.running.clone();
        let link = LedgerDevice::new(self.ledger.clone(), device_id);
        let device_key = device_id.to_string();
        let task_session_id = session_id.clone();

        let handle = tokio::spawn(async move {
            let outcome = runner.run(session, &link, &cancel).await;
            running.remove_if(&device_key, |_, r| r.session_id == task_session_id);
            outcome
        });

        info!(account_id, device_id, session_id = %session_id, "Goal started");
        Ok((session_id, handle))
    }

    /// Request cancellation of a running session owned by `account_id`.
    pub fn cancel(&self, account_id: &str, session_id: &str) -> Result<(), SessionError> {
        let running = self
            .running
            .iter()
            .find(|r| r.session_id == session_id && r.account_id == account_id)
            .map(|r| r.cancel.clone())
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        running.cancel();
        info!(account_id, session_id, "Session cancellation requested");
        Ok(())
    }

    pub fn is_busy(&self, device_id: &str) -> bool {
        self.running.contains_key(device_id)
    }

    /// Id of the session running on a device.
    pub fn session_for_device(&self, device_id: &str) -> Option<String> {
        self.running.get(device_id).map(|r| r.session_id.clone())
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }
}
