//! The perception-reason-act loop for one session.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::detector::{ActionRecord, Detectors, DEFAULT_STUCK_THRESHOLD};
use super::session::{AgentSession, CancelFlag, SessionStatus, Step, StepOutcome};
use super::store::SessionStore;
use crate::actions::{
    parse_decision, Action, ActionDecision, ActionHandler, ActionResult, CoordinateSystem, Dispatch,
};
use crate::config::get_system_prompt;
use crate::ledger::ConnectionLedger;
use crate::model::{DecisionOracle, MessageBuilder, ModelError, Observation};
use crate::protocol::{DashboardEvent, ServerMessage};
use crate::screen::{diff, ScreenDiff, ScreenDigest, ScreenSnapshot};
use crate::skills::{DeviceLink, SkillDispatcher, DEFAULT_SCREEN_SIZE};

/// Configuration for the session loop.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Maximum number of steps before the session fails.
    pub max_steps: u32,
    /// Consecutive unchanged screens before the stuck hint appears.
    pub stuck_threshold: u32,
    /// Pause after each step for the UI to settle.
    pub settle_delay: Duration,
    /// Recent actions repeated back to the oracle.
    pub history_len: usize,
    /// Fewer meaningful elements than this attaches a screenshot.
    pub sparse_threshold: usize,
    /// How oracle coordinates are interpreted.
    pub coordinates: CoordinateSystem,
    /// Language code ("en" or "zh").
    pub lang: String,
    /// Custom system prompt (if None, uses default based on lang).
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 30,
            stuck_threshold: DEFAULT_STUCK_THRESHOLD,
            settle_delay: Duration::from_millis(800),
            history_len: 5,
            sparse_threshold: 3,
            coordinates: CoordinateSystem::Absolute,
            lang: "en".to_string(),
            system_prompt: None,
        }
    }
}

impl AgentConfig {
    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_stuck_threshold(mut self, threshold: u32) -> Self {
        self.stuck_threshold = threshold;
        self
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_history_len(mut self, len: usize) -> Self {
        self.history_len = len;
        self
    }

    pub fn with_sparse_threshold(mut self, threshold: usize) -> Self {
        self.sparse_threshold = threshold;
        self
    }

    pub fn with_coordinates(mut self, coordinates: CoordinateSystem) -> Self {
        self.coordinates = coordinates;
        self
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Get the system prompt (custom or default based on language).
    pub fn get_system_prompt(&self, width: u32, height: u32) -> String {
        self.system_prompt
            .clone()
            .unwrap_or_else(|| get_system_prompt(&self.lang, self.coordinates, width, height))
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOutcome {
    pub session_id: String,
    pub status: SessionStatus,
    pub steps_used: u32,
    pub message: Option<String>,
}

/// Why the oracle produced no usable decision this step.
enum DecideError {
    Transport(ModelError),
    Malformed(String),
}

/// Per-session mutable loop state.
struct LoopState {
    detectors: Detectors,
    previous: Option<ScreenDigest>,
    feedback: Option<String>,
    history: VecDeque<String>,
    want_screenshot: bool,
}

/// Drives sessions: observe, decide, act, record.
pub struct SessionRunner {
    config: AgentConfig,
    oracle: Arc<dyn DecisionOracle>,
    store: Arc<dyn SessionStore>,
    ledger: Arc<ConnectionLedger>,
    skills: SkillDispatcher,
    handler: ActionHandler,
}

impl SessionRunner {
    pub fn new(
        config: AgentConfig,
        oracle: Arc<dyn DecisionOracle>,
        store: Arc<dyn SessionStore>,
        ledger: Arc<ConnectionLedger>,
        skills: SkillDispatcher,
    ) -> Self {
        let handler = ActionHandler::new(config.coordinates);
        Self {
            config,
            oracle,
            store,
            ledger,
            skills,
            handler,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Run a session until done, cancellation or the step cap.
    pub async fn run(
        &self,
        session: AgentSession,
        link: &dyn DeviceLink,
        cancel: &CancelFlag,
    ) -> SessionOutcome {
        if let Err(e) = self.store.create(&session).await {
            warn!(session_id = %session.id, error = %e, "Failed to persist session");
        }
        info!(
            session_id = %session.id,
            device_id = %session.device_id,
            goal = %session.goal,
            max_steps = self.config.max_steps,
            "Session started"
        );
        self.notify_started(&session);

        let mut state = LoopState {
            detectors: Detectors::new(self.config.stuck_threshold),
            previous: None,
            feedback: None,
            history: VecDeque::with_capacity(self.config.history_len),
            want_screenshot: false,
        };
        let mut steps_used = 0;

        for step in 1..=self.config.max_steps {
            if cancel.is_cancelled() {
                return self.cancelled(&session, steps_used).await;
            }
            steps_used = step;

            if let Some(done) = self.iterate(&session, link, cancel, step, &mut state).await {
                return self.finish(&session, SessionStatus::Completed, step, done).await;
            }
            if cancel.is_cancelled() {
                return self.cancelled(&session, steps_used).await;
            }
            if !self.config.settle_delay.is_zero() {
                sleep(self.config.settle_delay).await;
            }
        }

        self.finish(
            &session,
            SessionStatus::Failed,
            steps_used,
            Some(format!("Reached max steps ({})", self.config.max_steps)),
        )
        .await
    }

    /// One loop iteration. Returns `Some(message)` when the oracle declared the goal done.
    async fn iterate(
        &self,
        session: &AgentSession,
        link: &dyn DeviceLink,
        cancel: &CancelFlag,
        step: u32,
        state: &mut LoopState,
    ) -> Option<Option<String>> {
        // 1. Observe
        let snapshot = match link.screen(state.want_screenshot).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(session_id = %session.id, step, error = %e, "Failed to read screen");
                state.feedback = Some(format!("Could not read the screen: {}", e));
                return None;
            }
        };
        if cancel.is_cancelled() {
            return None;
        }

        // 2. Diff and detect
        let digest = ScreenDigest::of(&snapshot);
        let screen_diff = match &state.previous {
            Some(previous) => diff(previous, &digest),
            None => ScreenDiff::initial(),
        };
        let warnings = state.detectors.observe(&screen_diff);
        if !warnings.is_empty() {
            debug!(session_id = %session.id, step, warnings = ?warnings, "Detector warnings");
        }
        let (width, height) = link.screen_size().unwrap_or(DEFAULT_SCREEN_SIZE);

        let screenshot = self.screenshot_for(link, &snapshot, state).await;
        state.want_screenshot = false;
        if cancel.is_cancelled() {
            return None;
        }

        // 3. Decide
        let history: Vec<String> = state.history.iter().cloned().collect();
        let observation = Observation {
            goal: &session.goal,
            step,
            max_steps: self.config.max_steps,
            feedback: state.feedback.as_deref(),
            history: &history,
            diff: &screen_diff,
            warnings: &warnings,
            snapshot: &snapshot,
            screenshot: screenshot.as_deref(),
            coordinates: self.config.coordinates,
            screen_size: (width, height),
        };
        let messages = observation.to_messages(&self.config.get_system_prompt(width, height));
        let screen_hash = digest.short_hash();
        state.previous = Some(digest);

        let decision = match self.decide(messages).await {
            Ok(decision) => decision,
            Err(error) => {
                let feedback = match error {
                    DecideError::Transport(e) => {
                        warn!(session_id = %session.id, step, error = %e, "Oracle unavailable");
                        format!("The decision service failed: {}. No action was taken.", e)
                    }
                    DecideError::Malformed(reason) => {
                        warn!(
                            session_id = %session.id,
                            step,
                            reason = %reason,
                            "Oracle output unusable after retry"
                        );
                        format!("Your reply could not be parsed ({}). No action was taken.", reason)
                    }
                };
                let fallback = ActionDecision::fallback(feedback.clone());
                self.record_step(session, &Step::new(step, fallback, screen_hash))
                    .await;
                self.attach_result(session, step, &ActionResult::failure(feedback.clone()))
                    .await;
                state.feedback = Some(feedback);
                return None;
            }
        };

        if cancel.is_cancelled() {
            return None;
        }

        info!(
            session_id = %session.id,
            step,
            action = %decision.action.signature(),
            reasoning = %decision.reasoning,
            "Step decided"
        );
        let step_record = Step::new(step, decision.clone(), screen_hash.clone());
        self.record_step(session, &step_record).await;

        // 4. Terminal sentinel
        if let Action::Done { message } = &decision.action {
            self.attach_result(session, step, &ActionResult::finish(message.clone())).await;
            return Some(message.clone());
        }

        // 5. Dispatch
        let result = self
            .execute(&decision, link, width, height, &mut state.want_screenshot)
            .await;
        self.attach_result(session, step, &result).await;

        let signature = decision.action.signature();
        let feedback = match &result.message {
            Some(message) if result.success => format!("{} succeeded: {}", signature, message),
            Some(message) => format!("{} FAILED: {}", signature, message),
            None if result.success => format!("{} succeeded", signature),
            None => format!("{} FAILED", signature),
        };
        debug!(session_id = %session.id, step, feedback = %feedback, "Step executed");
        state.feedback = Some(feedback);

        if self.config.history_len > 0 {
            if state.history.len() == self.config.history_len {
                state.history.pop_front();
            }
            state.history.push_back(signature);
        }
        state
            .detectors
            .record(ActionRecord::new(&decision.action, screen_hash));

        None
    }

    /// Screenshot to attach: only for empty, sparse or stuck screens, or on request.
    async fn screenshot_for(
        &self,
        link: &dyn DeviceLink,
        snapshot: &ScreenSnapshot,
        state: &LoopState,
    ) -> Option<String> {
        let needed = state.want_screenshot
            || snapshot.is_empty()
            || state.detectors.is_stuck()
            || snapshot.is_sparse(self.config.sparse_threshold);
        if !needed {
            return None;
        }
        if snapshot.screenshot.is_some() {
            return snapshot.screenshot.clone();
        }
        match link.screen(true).await {
            Ok(with_image) => with_image.screenshot,
            Err(e) => {
                debug!(device_id = link.device_id(), error = %e, "Screenshot fetch failed");
                None
            }
        }
    }

    /// Query the oracle, retrying once with a correction on malformed output.
    async fn decide(&self, mut messages: Vec<Value>) -> Result<ActionDecision, DecideError> {
        let response = self
            .oracle
            .query(&messages)
            .await
            .map_err(DecideError::Transport)?;

        let error = match parse_decision(&response.action) {
            Ok(mut decision) => {
                if decision.reasoning.is_empty() {
                    decision.reasoning = response.thinking;
                }
                return Ok(decision);
            }
            Err(error) => error,
        };

        warn!(error = %error, "Malformed oracle output, asking again");
        messages.push(MessageBuilder::create_assistant_message(&response.raw_content));
        messages.push(MessageBuilder::create_user_message(&error.correction(), None));

        let retry = self
            .oracle
            .query(&messages)
            .await
            .map_err(DecideError::Transport)?;
        let mut decision =
            parse_decision(&retry.action).map_err(|e| DecideError::Malformed(e.to_string()))?;
        if decision.reasoning.is_empty() {
            decision.reasoning = retry.thinking;
        }
        Ok(decision)
    }

    /// Carry out a non-terminal decision on the device.
    async fn execute(
        &self,
        decision: &ActionDecision,
        link: &dyn DeviceLink,
        width: u32,
        height: u32,
        want_screenshot: &mut bool,
    ) -> ActionResult {
        let planned = match self.handler.plan(&decision.action, width, height) {
            Ok(planned) => planned,
            Err(message) => return ActionResult::failure(message),
        };

        let mut result = match planned.dispatch {
            Dispatch::Command(command) => match link.run(command).await {
                Ok(outcome) if outcome.success => match outcome.data {
                    Some(data) => ActionResult::success().with_message(format!("returned {}", data)),
                    None => ActionResult::success(),
                },
                Ok(outcome) => ActionResult::failure(
                    outcome
                        .error
                        .unwrap_or_else(|| "device reported failure".to_string()),
                ),
                Err(e) => ActionResult::failure(e.to_string()),
            },
            Dispatch::Skill(call) => {
                let skill = self.skills.run(link, &call).await;
                if skill.success {
                    ActionResult::success().with_message(skill.message)
                } else {
                    ActionResult::failure(skill.message)
                }
            }
            Dispatch::Pause(duration) => {
                sleep(duration).await;
                ActionResult::success()
                    .with_message(format!("waited {:.1}s", duration.as_secs_f64()))
            }
            Dispatch::Screenshot => {
                *want_screenshot = true;
                ActionResult::success()
                    .with_message("a screenshot will be attached to the next observation")
            }
            Dispatch::Finish(message) => ActionResult::finish(message),
        };

        if !planned.adjustments.is_empty() {
            let note = planned.adjustments.join("; ");
            result.message = Some(match result.message.take() {
                Some(message) => format!("{} ({})", message, note),
                None => note,
            });
        }
        result
    }

    async fn record_step(&self, session: &AgentSession, step: &Step) {
        if let Err(e) = self.store.record_step(&session.id, step).await {
            warn!(session_id = %session.id, step = step.number, error = %e, "Failed to persist step");
        }
        let event = DashboardEvent::Step {
            session_id: session.id.clone(),
            step: step.number,
            action: step.decision.action.to_value(),
            reasoning: step.decision.reasoning.clone(),
            screen_hash: step.screen_hash.clone(),
        };
        self.ledger.broadcast_to_account(&session.account_id, &event);
    }

    async fn attach_result(&self, session: &AgentSession, step: u32, result: &ActionResult) {
        let outcome = StepOutcome {
            success: result.success,
            message: result.message.clone().unwrap_or_default(),
        };
        if let Err(e) = self.store.attach_result(&session.id, step, &outcome).await {
            warn!(session_id = %session.id, step, error = %e, "Failed to attach step result");
        }
    }

    fn notify_started(&self, session: &AgentSession) {
        let message = ServerMessage::GoalStarted {
            session_id: session.id.clone(),
            goal: session.goal.clone(),
        };
        if let Err(e) = self.ledger.send_to_device(&session.device_id, &message) {
            debug!(session_id = %session.id, error = %e, "Could not notify device of goal start");
        }
        self.ledger.broadcast_to_account(
            &session.account_id,
            &DashboardEvent::GoalStarted {
                session_id: session.id.clone(),
                device_id: session.device_id.clone(),
                goal: session.goal.clone(),
            },
        );
    }

    async fn cancelled(&self, session: &AgentSession, steps_used: u32) -> SessionOutcome {
        self.finish(
            session,
            SessionStatus::Failed,
            steps_used,
            Some("cancelled".to_string()),
        )
        .await
    }

    async fn finish(
        &self,
        session: &AgentSession,
        status: SessionStatus,
        steps_used: u32,
        message: Option<String>,
    ) -> SessionOutcome {
        let success = status == SessionStatus::Completed;
        if let Err(e) = self
            .store
            .finish(&session.id, status, steps_used, message.clone())
            .await
        {
            warn!(session_id = %session.id, error = %e, "Failed to persist session end");
        }
        info!(
            session_id = %session.id,
            status = ?status,
            steps_used,
            message = message.as_deref().unwrap_or(""),
            "Session finished"
        );

        let completed = ServerMessage::GoalCompleted {
            session_id: session.id.clone(),
            success,
            steps_used,
        };
        if let Err(e) = self.ledger.send_to_device(&session.device_id, &completed) {
            debug!(session_id = %session.id, error = %e, "Could not notify device of goal end");
        }
        self.ledger.broadcast_to_account(
            &session.account_id,
            &DashboardEvent::GoalCompleted {
                session_id: session.id.clone(),
                success,
                steps_used,
            },
        );

        SessionOutcome {
            session_id: session.id.clone(),
            status,
            steps_used,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::store::MemorySessionStore;
    use crate::ledger::{DeviceConnection, LedgerConfig};
    use crate::model::ModelResponse;
    use crate::protocol::{CommandOutcome, DeviceInfo, DeviceResponse, OutboundFrame};
    use crate::screen::{Rect, UiElement};
    use crate::skills::{LedgerDevice, SkillConfig};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Replies from a script, repeating the last entry once the script runs out.
    struct ScriptedOracle {
        replies: Mutex<VecDeque<String>>,
        queries: Mutex<Vec<Vec<Value>>>,
        cancel_on_query: Option<CancelFlag>,
    }

    impl ScriptedOracle {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
                queries: Mutex::new(Vec::new()),
                cancel_on_query: None,
            }
        }

        /// Text of the last user message of every query.
        fn prompts(&self) -> Vec<String> {
            self.queries
                .lock()
                .unwrap()
                .iter()
                .map(|messages| {
                    let content = &messages.last().unwrap()["content"];
                    content
                        .as_array()
                        .unwrap()
                        .iter()
                        .filter_map(|c| c["text"].as_str())
                        .collect::<Vec<_>>()
                        .join("")
                })
                .collect()
        }
    }

    #[async_trait]
    impl DecisionOracle for ScriptedOracle {
        async fn query(&self, messages: &[Value]) -> Result<ModelResponse, ModelError> {
            self.queries.lock().unwrap().push(messages.to_vec());
            if let Some(flag) = &self.cancel_on_query {
                flag.cancel();
            }
            let mut replies = self.replies.lock().unwrap();
            let reply = if replies.len() > 1 {
                replies.pop_front().unwrap_or_default()
            } else {
                replies.front().cloned().unwrap_or_default()
            };
            Ok(ModelResponse::from_content(reply))
        }
    }

    struct FailingOracle;

    #[async_trait]
    impl DecisionOracle for FailingOracle {
        async fn query(&self, _: &[Value]) -> Result<ModelResponse, ModelError> {
            Err(ModelError::ApiError {
                status: 503,
                message: "down".to_string(),
            })
        }
    }

    fn home_screen() -> ScreenSnapshot {
        ScreenSnapshot::new(
            ["Messages", "Settings", "Camera", "Chrome"]
                .iter()
                .enumerate()
                .map(|(i, label)| UiElement {
                    text: label.to_string(),
                    bounds: Rect::new(0, i as i32 * 200, 1080, i as i32 * 200 + 150),
                    clickable: true,
                    enabled: true,
                    ..Default::default()
                })
                .collect(),
        )
    }

    /// Register a device that answers every request until `stop_after` requests.
    fn spawn_device(
        ledger: &Arc<ConnectionLedger>,
        device_id: &str,
        stop_after: Option<usize>,
    ) -> Arc<Mutex<Vec<Value>>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let info = DeviceInfo {
            screen_width: 1080,
            screen_height: 1920,
            ..Default::default()
        };
        ledger
            .register_device(DeviceConnection::new(device_id, "acct", info, tx))
            .unwrap();

        let frames = Arc::new(Mutex::new(Vec::new()));
        let seen = frames.clone();
        let ledger = ledger.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            let mut answered = 0;
            while let Some(frame) = rx.recv().await {
                let OutboundFrame::Json(frame) = frame else {
                    break;
                };
                let Some(id) = frame["requestId"].as_str().map(str::to_string) else {
                    continue;
                };
                seen.lock().unwrap().push(frame.clone());
                if stop_after.is_some_and(|n| answered >= n) {
                    continue;
                }
                answered += 1;
                let response = if frame["type"] == "get_screen" {
                    DeviceResponse::Screen(home_screen())
                } else {
                    DeviceResponse::Result(CommandOutcome::ok())
                };
                ledger.resolve_request(&device_id, &id, response);
            }
        });
        frames
    }

    fn setup(
        oracle: Arc<dyn DecisionOracle>,
        config: AgentConfig,
        timeout: Duration,
    ) -> (Arc<ConnectionLedger>, Arc<MemorySessionStore>, SessionRunner) {
        let ledger = Arc::new(ConnectionLedger::new(
            LedgerConfig::default().with_command_timeout(timeout),
        ));
        let store = Arc::new(MemorySessionStore::new());
        let runner = SessionRunner::new(
            config.with_settle_delay(Duration::ZERO),
            oracle,
            store.clone(),
            ledger.clone(),
            SkillDispatcher::new(SkillConfig::default().with_settle_interval(Duration::ZERO)),
        );
        (ledger, store, runner)
    }

    #[tokio::test]
    async fn test_always_wait_exhausts_max_steps() {
        let oracle = Arc::new(ScriptedOracle::new(&[r#"{"action":"wait","seconds":0}"#]));
        let (ledger, store, runner) = setup(
            oracle.clone(),
            AgentConfig::default().with_max_steps(3),
            Duration::from_secs(2),
        );
        spawn_device(&ledger, "d1", None);

        let session = AgentSession::new("d1", "acct", "do nothing");
        let link = LedgerDevice::new(ledger.clone(), "d1");
        let outcome = runner.run(session.clone(), &link, &CancelFlag::new()).await;

        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(outcome.steps_used, 3);
        let stored = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Failed);
        assert_eq!(stored.steps.len(), 3);
        assert!(stored.steps.iter().all(|s| s.result.is_some()));
    }

    #[tokio::test]
    async fn test_tap_then_done_completes() {
        let oracle = Arc::new(ScriptedOracle::new(&[
            r#"{"action":"tap","x":540,"y":275,"reasoning":"open settings"}"#,
            r#"{"action":"done","message":"opened"}"#,
        ]));
        let (ledger, store, runner) = setup(
            oracle.clone(),
            AgentConfig::default().with_max_steps(10),
            Duration::from_secs(2),
        );
        let frames = spawn_device(&ledger, "d1", None);

        let (dash_tx, mut dash_rx) = mpsc::unbounded_channel();
        ledger.register_dashboard("acct", dash_tx).unwrap();

        let session = AgentSession::new("d1", "acct", "open settings");
        let link = LedgerDevice::new(ledger.clone(), "d1");
        let outcome = runner.run(session.clone(), &link, &CancelFlag::new()).await;

        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.steps_used, 2);
        assert_eq!(outcome.message.as_deref(), Some("opened"));

        let taps: Vec<Value> = frames
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f["type"] == "tap")
            .cloned()
            .collect();
        assert_eq!(taps.len(), 1);
        assert_eq!(taps[0]["x"], 540);

        // The second query reports the tap outcome.
        let prompts = oracle.prompts();
        assert!(prompts[1].contains("tap(540,275) succeeded"));

        let stored = store.get(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert_eq!(stored.steps_used, 2);

        let mut kinds = Vec::new();
        while let Ok(OutboundFrame::Json(event)) = dash_rx.try_recv() {
            kinds.push(event["type"].as_str().unwrap_or_default().to_string());
        }
        assert_eq!(kinds, vec!["goal_started", "step", "step", "goal_completed"]);
    }

    #[tokio::test]
    async fn test_device_silence_times_out_and_loop_continues() {
        let oracle = Arc::new(ScriptedOracle::new(&[r#"{"action":"back"}"#]));
        let (ledger, _store, runner) = setup(
            oracle.clone(),
            AgentConfig::default().with_max_steps(2),
            Duration::from_millis(50),
        );
        // Answers the first get_screen, then goes silent.
        spawn_device(&ledger, "d1", Some(1));

        let session = AgentSession::new("d1", "acct", "go back");
        let link = LedgerDevice::new(ledger.clone(), "d1");
        let outcome = runner.run(session, &link, &CancelFlag::new()).await;

        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(outcome.steps_used, 2);
        assert_eq!(oracle.prompts().len(), 1);
        assert_eq!(ledger.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_feedback_reaches_next_query() {
        let oracle = Arc::new(ScriptedOracle::new(&[r#"{"action":"back"}"#]));
        let (ledger, _store, runner) = setup(
            oracle.clone(),
            AgentConfig::default().with_max_steps(2),
            Duration::from_millis(200),
        );
        spawn_device(&ledger, "d1", Some(1));

        let session = AgentSession::new("d1", "acct", "go back");
        let link = LedgerDevice::new(ledger.clone(), "d1");
        let cancel = CancelFlag::new();
        let run = runner.run(session, &link, &cancel);
        let reconnect = async {
            // While the back command is in flight, a fresh connection replaces the old one.
            sleep(Duration::from_millis(100)).await;
            spawn_device(&ledger, "d1", None);
        };
        let (outcome, _) = tokio::join!(run, reconnect);

        assert_eq!(outcome.steps_used, 2);
        let prompts = oracle.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[1].contains("back FAILED"));
        assert!(prompts[1].contains("timed out"));
    }

    #[tokio::test]
    async fn test_malformed_output_retried_once_with_correction() {
        let oracle = Arc::new(ScriptedOracle::new(&[
            "I think I should tap settings",
            r#"{"action":"done"}"#,
        ]));
        let (ledger, _store, runner) = setup(
            oracle.clone(),
            AgentConfig::default().with_max_steps(5),
            Duration::from_secs(2),
        );
        spawn_device(&ledger, "d1", None);

        let link = LedgerDevice::new(ledger.clone(), "d1");
        let outcome = runner
            .run(AgentSession::new("d1", "acct", "g"), &link, &CancelFlag::new())
            .await;

        assert_eq!(outcome.status, SessionStatus::Completed);
        assert_eq!(outcome.steps_used, 1);
        assert!(oracle.prompts()[1].contains("could not be used"));
        let queries = oracle.queries.lock().unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[1].len(), 4);
        assert_eq!(queries[1][2]["role"], "assistant");
    }

    #[tokio::test]
    async fn test_malformed_twice_degrades_and_continues() {
        let oracle = Arc::new(ScriptedOracle::new(&["nonsense"]));
        let (ledger, store, runner) = setup(
            oracle.clone(),
            AgentConfig::default().with_max_steps(2),
            Duration::from_secs(2),
        );
        let frames = spawn_device(&ledger, "d1", None);

        let session = AgentSession::new("d1", "acct", "g");
        let link = LedgerDevice::new(ledger.clone(), "d1");
        let outcome = runner.run(session.clone(), &link, &CancelFlag::new()).await;

        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(outcome.steps_used, 2);
        assert_eq!(oracle.prompts().len(), 4);
        assert!(oracle.prompts()[2].contains("could not be parsed"));
        // Only screen reads reached the device.
        assert!(frames.lock().unwrap().iter().all(|f| f["type"] == "get_screen"));
        let stored = store.get(&session.id).await.unwrap().unwrap();
        assert!(stored.steps.iter().all(|s| s.result.as_ref().is_some_and(|r| !r.success)));
    }

    #[tokio::test]
    async fn test_oracle_transport_failure_degrades() {
        let (ledger, _store, runner) = setup(
            Arc::new(FailingOracle),
            AgentConfig::default().with_max_steps(2),
            Duration::from_secs(2),
        );
        spawn_device(&ledger, "d1", None);
        let link = LedgerDevice::new(ledger.clone(), "d1");
        let outcome = runner
            .run(AgentSession::new("d1", "acct", "g"), &link, &CancelFlag::new())
            .await;
        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(outcome.steps_used, 2);
    }

    #[tokio::test]
    async fn test_cancelled_session_is_not_completed() {
        let cancel = CancelFlag::new();
        let mut oracle = ScriptedOracle::new(&[r#"{"action":"done"}"#]);
        oracle.cancel_on_query = Some(cancel.clone());
        let (ledger, _store, runner) = setup(
            Arc::new(oracle),
            AgentConfig::default(),
            Duration::from_secs(2),
        );
        spawn_device(&ledger, "d1", None);

        let link = LedgerDevice::new(ledger.clone(), "d1");
        let outcome = runner
            .run(AgentSession::new("d1", "acct", "g"), &link, &cancel)
            .await;
        // Cancellation wins over a terminal decision made in the same step.
        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(outcome.steps_used, 1);

        let cancel = CancelFlag::new();
        cancel.cancel();
        let outcome = runner
            .run(AgentSession::new("d1", "acct", "g"), &link, &cancel)
            .await;
        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(outcome.steps_used, 0);
        assert_eq!(outcome.message.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_cancel_during_step_stops_before_next() {
        let cancel = CancelFlag::new();
        let mut oracle = ScriptedOracle::new(&[r#"{"action":"back"}"#]);
        oracle.cancel_on_query = Some(cancel.clone());
        let oracle = Arc::new(oracle);
        let (ledger, _store, runner) = setup(
            oracle.clone(),
            AgentConfig::default().with_max_steps(10),
            Duration::from_secs(2),
        );
        spawn_device(&ledger, "d1", None);

        let link = LedgerDevice::new(ledger.clone(), "d1");
        let outcome = runner
            .run(AgentSession::new("d1", "acct", "g"), &link, &cancel)
            .await;
        assert_eq!(outcome.status, SessionStatus::Failed);
        assert_eq!(outcome.steps_used, 1);
        assert_eq!(oracle.prompts().len(), 1);
    }

    #[tokio::test]
    async fn test_stuck_hint_in_fourth_query() {
        let oracle = Arc::new(ScriptedOracle::new(&[r#"{"action":"tap","x":5,"y":5}"#]));
        let (ledger, _store, runner) = setup(
            oracle.clone(),
            AgentConfig::default().with_max_steps(4),
            Duration::from_secs(2),
        );
        spawn_device(&ledger, "d1", None);

        let link = LedgerDevice::new(ledger.clone(), "d1");
        runner
            .run(AgentSession::new("d1", "acct", "g"), &link, &CancelFlag::new())
            .await;

        let prompts = oracle.prompts();
        assert_eq!(prompts.len(), 4);
        assert!(!prompts[2].contains("appear stuck"));
        assert!(prompts[3].contains("appear stuck"));
        assert!(prompts[3].contains("tap(5,5) 3 times"));
    }
}
