//! Deterministic multi-step routines built from device primitives.
//!
//! Each skill replaces several oracle round-trips with a fixed procedure that
//! only talks to the device. Skills never return errors: ledger failures are
//! folded into a failed [`SkillResult`].

use std::collections::HashSet;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use super::link::DeviceLink;
use crate::ledger::LedgerError;
use crate::protocol::DeviceCommand;
use crate::screen::{ScreenDigest, ScreenSnapshot, UiElement};

/// Screen size assumed when the device never reported one.
pub const DEFAULT_SCREEN_SIZE: (u32, u32) = (1080, 1920);

/// Labels listed back to the oracle when a target could not be found.
pub const MAX_LISTED_LABELS: usize = 10;

const SEND_KEYWORDS: &[&str] = &["send", "submit", "post", "reply", "发送", "提交"];

/// A skill invocation decoded from an action.
#[derive(Debug, Clone, PartialEq)]
pub enum SkillCall {
    FindAndTap { query: String },
    ReadScreen { max_scrolls: Option<u32> },
    SubmitMessage,
    WaitForContent { timeout: Option<Duration> },
}

impl SkillCall {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FindAndTap { .. } => "find_and_tap",
            Self::ReadScreen { .. } => "read_screen",
            Self::SubmitMessage => "submit_message",
            Self::WaitForContent { .. } => "wait_for_content",
        }
    }
}

/// Uniform skill outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillResult {
    pub success: bool,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl SkillResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<LedgerError> for SkillResult {
    fn from(error: LedgerError) -> Self {
        Self::failure(format!("Device command failed: {}", error))
    }
}

/// Skill tuning.
#[derive(Debug, Clone)]
pub struct SkillConfig {
    /// Scroll-and-rescan attempts for `find_and_tap`.
    pub max_scroll_attempts: u32,
    /// Default page budget for `read_screen`.
    pub read_max_scrolls: u32,
    /// Pause after each gesture before reading the screen again.
    pub settle_interval: Duration,
    /// Poll interval for `wait_for_content`.
    pub poll_interval: Duration,
    /// Default deadline for `wait_for_content`.
    pub wait_timeout: Duration,
}

impl Default for SkillConfig {
    fn default() -> Self {
        Self {
            max_scroll_attempts: 3,
            read_max_scrolls: 5,
            settle_interval: Duration::from_millis(600),
            poll_interval: Duration::from_secs(1),
            wait_timeout: Duration::from_secs(10),
        }
    }
}

impl SkillConfig {
    pub fn with_max_scroll_attempts(mut self, attempts: u32) -> Self {
        self.max_scroll_attempts = attempts;
        self
    }

    pub fn with_read_max_scrolls(mut self, scrolls: u32) -> Self {
        self.read_max_scrolls = scrolls;
        self
    }

    pub fn with_settle_interval(mut self, interval: Duration) -> Self {
        self.settle_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }
}

/// Runs skills against a [`DeviceLink`].
#[derive(Debug, Clone, Default)]
pub struct SkillDispatcher {
    config: SkillConfig,
}

impl SkillDispatcher {
    pub fn new(config: SkillConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SkillConfig {
        &self.config
    }

    /// Run a skill to completion.
    pub async fn run(&self, link: &dyn DeviceLink, call: &SkillCall) -> SkillResult {
        debug!(device_id = link.device_id(), skill = call.name(), "Running skill");
        let result = match call {
            SkillCall::FindAndTap { query } => self.find_and_tap(link, query).await,
            SkillCall::ReadScreen { max_scrolls } => {
                self.read_screen(link, max_scrolls.unwrap_or(self.config.read_max_scrolls))
                    .await
            }
            SkillCall::SubmitMessage => self.submit_message(link).await,
            SkillCall::WaitForContent { timeout } => {
                self.wait_for_content(link, timeout.unwrap_or(self.config.wait_timeout))
                    .await
            }
        };
        let result = result.unwrap_or_else(SkillResult::from);
        info!(
            device_id = link.device_id(),
            skill = call.name(),
            success = result.success,
            "Skill finished"
        );
        result
    }

    /// Locate an element by text and tap it, scrolling down between attempts.
    pub async fn find_and_tap(
        &self,
        link: &dyn DeviceLink,
        query: &str,
    ) -> Result<SkillResult, LedgerError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(SkillResult::failure("find_and_tap needs a non-empty query"));
        }
        let matcher = QueryMatcher::new(query);
        let mut last_screen = ScreenSnapshot::default();

        for attempt in 0..=self.config.max_scroll_attempts {
            let screen = link.screen(false).await?;
            if let Some(element) = matcher.best(&screen) {
                let (x, y) = element.center();
                let outcome = link.run(DeviceCommand::Tap { x, y }).await?;
                let label = element.label().to_string();
                return Ok(if outcome.success {
                    SkillResult::success(format!(
                        "Tapped '{}' at ({}, {}) after {} scroll(s)",
                        label, x, y, attempt
                    ))
                    .with_data(json!({ "x": x, "y": y, "label": label, "scrolls": attempt }))
                } else {
                    SkillResult::failure(format!(
                        "Found '{}' but the tap failed: {}",
                        label,
                        outcome.error.unwrap_or_default()
                    ))
                });
            }
            last_screen = screen;
            if attempt < self.config.max_scroll_attempts {
                self.scroll_down(link).await?;
            }
        }

        let visible: Vec<String> = last_screen
            .labels()
            .into_iter()
            .take(MAX_LISTED_LABELS)
            .collect();
        Ok(SkillResult::failure(format!(
            "No element matching '{}' after {} scroll(s). Visible: {}",
            query,
            self.config.max_scroll_attempts,
            if visible.is_empty() {
                "(nothing)".to_string()
            } else {
                visible.join(", ")
            }
        ))
        .with_data(json!({ "visible": visible })))
    }

    /// Scroll through the page collecting every text label, then put it on the clipboard.
    pub async fn read_screen(
        &self,
        link: &dyn DeviceLink,
        max_scrolls: u32,
    ) -> Result<SkillResult, LedgerError> {
        let mut seen = HashSet::new();
        let mut lines = Vec::new();
        let mut previous: Option<ScreenDigest> = None;
        let mut pages = 0;

        for scroll in 0..=max_scrolls {
            let screen = link.screen(false).await?;
            let digest = ScreenDigest::of(&screen);
            if previous.as_ref().is_some_and(|p| p.same_screen(&digest)) {
                // Scrolling no longer moves the content.
                break;
            }
            pages += 1;
            for label in screen.labels() {
                if seen.insert(label.clone()) {
                    lines.push(label);
                }
            }
            previous = Some(digest);
            if scroll < max_scrolls {
                self.scroll_down(link).await?;
            }
        }

        let text = lines.join("\n");
        let outcome = link
            .run(DeviceCommand::ClipboardSet { text: text.clone() })
            .await?;
        let preview: String = text.chars().take(500).collect();
        let data = json!({ "lines": lines.len(), "pages": pages, "text": text });

        Ok(if outcome.success {
            SkillResult::success(format!(
                "Read {} line(s) over {} page(s) into the clipboard: {}",
                lines.len(),
                pages,
                preview
            ))
            .with_data(data)
        } else {
            SkillResult::failure(format!(
                "Read {} line(s) but setting the clipboard failed: {}",
                lines.len(),
                outcome.error.unwrap_or_default()
            ))
            .with_data(data)
        })
    }

    /// Find the send/submit control of a compose box and tap it.
    pub async fn submit_message(&self, link: &dyn DeviceLink) -> Result<SkillResult, LedgerError> {
        let screen = link.screen(false).await?;
        let (width, height) = link.screen_size().unwrap_or(DEFAULT_SCREEN_SIZE);

        let Some(element) = best_submit_control(&screen, width, height) else {
            let visible: Vec<String> = screen.labels().into_iter().take(MAX_LISTED_LABELS).collect();
            return Ok(SkillResult::failure(format!(
                "No send/submit control found. Visible: {}",
                visible.join(", ")
            ))
            .with_data(json!({ "visible": visible })));
        };

        let (x, y) = element.center();
        let outcome = link.run(DeviceCommand::Tap { x, y }).await?;
        Ok(if outcome.success {
            SkillResult::success(format!("Tapped submit control at ({}, {})", x, y))
                .with_data(json!({ "x": x, "y": y }))
        } else {
            SkillResult::failure(format!(
                "Submit tap failed: {}",
                outcome.error.unwrap_or_default()
            ))
        })
    }

    /// Poll until text that was not on the screen before appears.
    pub async fn wait_for_content(
        &self,
        link: &dyn DeviceLink,
        timeout: Duration,
    ) -> Result<SkillResult, LedgerError> {
        let baseline = link.screen(false).await?.labels();
        let known: HashSet<&str> = baseline.iter().map(String::as_str).collect();
        let deadline = Instant::now() + timeout;

        loop {
            if Instant::now() >= deadline {
                return Ok(SkillResult::failure(format!(
                    "No new content after {:.1}s",
                    timeout.as_secs_f64()
                )));
            }
            sleep(self.config.poll_interval).await;

            let appeared: Vec<String> = link
                .screen(false)
                .await?
                .labels()
                .into_iter()
                .filter(|label| !known.contains(label.as_str()))
                .collect();
            if !appeared.is_empty() {
                let listed: Vec<String> = appeared.iter().take(MAX_LISTED_LABELS).cloned().collect();
                return Ok(SkillResult::success(format!(
                    "New content appeared: {}",
                    listed.join(", ")
                ))
                .with_data(json!({ "appeared": appeared })));
            }
        }
    }

    async fn scroll_down(&self, link: &dyn DeviceLink) -> Result<(), LedgerError> {
        let (width, height) = link.screen_size().unwrap_or(DEFAULT_SCREEN_SIZE);
        let x = (width / 2) as i32;
        let outcome = link
            .run(DeviceCommand::Swipe {
                x1: x,
                y1: (height as f64 * 0.7) as i32,
                x2: x,
                y2: (height as f64 * 0.3) as i32,
                duration_ms: 300,
            })
            .await?;
        if !outcome.success {
            debug!(device_id = link.device_id(), "Scroll gesture reported failure");
        }
        sleep(self.config.settle_interval).await;
        Ok(())
    }
}

/// Scores elements against a text query.
struct QueryMatcher {
    query: String,
    word: Option<Regex>,
}

impl QueryMatcher {
    fn new(query: &str) -> Self {
        let word = Regex::new(&format!(r"(?i)\b{}\b", regex::escape(query))).ok();
        Self {
            query: query.to_lowercase(),
            word,
        }
    }

    fn score(&self, element: &UiElement) -> u32 {
        if !element.enabled {
            return 0;
        }
        let label = element.label().to_lowercase();
        let mut score = if label.is_empty() {
            0
        } else if label == self.query {
            100
        } else if label.starts_with(&self.query) {
            80
        } else if self.word.as_ref().is_some_and(|re| re.is_match(&label)) {
            60
        } else if label.contains(&self.query) {
            40
        } else {
            0
        };
        if score == 0 && element.id.to_lowercase().contains(&self.query) {
            score = 20;
        }
        if score > 0 && element.is_interactive() {
            score += 10;
        }
        score
    }

    /// Highest-scoring element; earlier elements win ties.
    fn best<'a>(&self, screen: &'a ScreenSnapshot) -> Option<&'a UiElement> {
        let mut best: Option<(&UiElement, u32)> = None;
        for element in &screen.elements {
            let score = self.score(element);
            if score > 0 && best.map_or(true, |(_, s)| score > s) {
                best = Some((element, score));
            }
        }
        best.map(|(element, _)| element)
    }
}

fn keyword_score(element: &UiElement) -> u32 {
    let label = element.label().to_lowercase();
    let id = element.id.to_lowercase();
    let mut score = 0;
    for keyword in SEND_KEYWORDS {
        if label == *keyword {
            score = score.max(100);
        } else if label.contains(keyword) {
            score = score.max(60);
        } else if id.contains(keyword) {
            score = score.max(50);
        }
    }
    score
}

/// Bonus of up to 40 for elements near the bottom-right corner.
fn position_score(element: &UiElement, width: u32, height: u32) -> u32 {
    let (cx, cy) = element.center();
    let fx = (cx.max(0) as f64 / width.max(1) as f64).min(1.0);
    let fy = (cy.max(0) as f64 / height.max(1) as f64).min(1.0);
    ((fx + fy) * 20.0).round() as u32
}

fn best_submit_control(screen: &ScreenSnapshot, width: u32, height: u32) -> Option<&UiElement> {
    let candidates = screen
        .elements
        .iter()
        .filter(|e| e.enabled && !e.editable && !e.bounds.is_empty());

    let mut best: Option<(&UiElement, u32)> = None;
    for element in candidates {
        let keyword = keyword_score(element);
        let score = if keyword > 0 {
            keyword + position_score(element, width, height)
        } else if element.clickable && element.label().is_empty() {
            // Unlabelled icon button: only plausible in the bottom-right corner.
            let (cx, cy) = element.center();
            if cx as f64 > width as f64 * 0.75 && cy as f64 > height as f64 * 0.6 {
                position_score(element, width, height)
            } else {
                0
            }
        } else {
            0
        };
        if score > 0 && best.map_or(true, |(_, s)| score > s) {
            best = Some((element, score));
        }
    }
    best.map(|(element, _)| element)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandOutcome, DeviceResponse};
    use crate::screen::Rect;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Serves queued screens (repeating the last one) and records commands.
    struct FakeLink {
        screens: Mutex<VecDeque<ScreenSnapshot>>,
        commands: Mutex<Vec<DeviceCommand>>,
        clipboard_ok: bool,
    }

    impl FakeLink {
        fn new(screens: Vec<ScreenSnapshot>) -> Self {
            Self {
                screens: Mutex::new(screens.into()),
                commands: Mutex::new(Vec::new()),
                clipboard_ok: true,
            }
        }

        fn commands(&self) -> Vec<DeviceCommand> {
            self.commands.lock().unwrap().clone()
        }

        fn swipes(&self) -> usize {
            self.commands()
                .iter()
                .filter(|c| matches!(c, DeviceCommand::Swipe { .. }))
                .count()
        }
    }

    #[async_trait]
    impl DeviceLink for FakeLink {
        fn device_id(&self) -> &str {
            "fake"
        }

        async fn execute(&self, command: DeviceCommand) -> Result<DeviceResponse, LedgerError> {
            if let DeviceCommand::GetScreen { .. } = command {
                let mut screens = self.screens.lock().unwrap();
                let screen = if screens.len() > 1 {
                    screens.pop_front().unwrap()
                } else {
                    screens.front().cloned().unwrap_or_default()
                };
                return Ok(DeviceResponse::Screen(screen));
            }
            let ok = !matches!(command, DeviceCommand::ClipboardSet { .. }) || self.clipboard_ok;
            self.commands.lock().unwrap().push(command);
            Ok(DeviceResponse::Result(if ok {
                CommandOutcome::ok()
            } else {
                CommandOutcome::failed("denied")
            }))
        }

        fn screen_size(&self) -> Option<(u32, u32)> {
            Some((1000, 2000))
        }
    }

    fn el(text: &str, bounds: Rect, clickable: bool) -> UiElement {
        UiElement {
            text: text.to_string(),
            bounds,
            clickable,
            enabled: true,
            ..Default::default()
        }
    }

    fn screen(labels: &[&str]) -> ScreenSnapshot {
        ScreenSnapshot::new(
            labels
                .iter()
                .enumerate()
                .map(|(i, l)| el(l, Rect::new(0, i as i32 * 100, 1000, i as i32 * 100 + 80), true))
                .collect(),
        )
    }

    fn dispatcher() -> SkillDispatcher {
        SkillDispatcher::new(
            SkillConfig::default()
                .with_settle_interval(Duration::ZERO)
                .with_poll_interval(Duration::from_millis(5)),
        )
    }

    #[tokio::test]
    async fn test_find_and_tap_prefers_exact_match() {
        let link = FakeLink::new(vec![screen(&["Send later", "Send", "Inbox"])]);
        let result = dispatcher().find_and_tap(&link, "send").await.unwrap();
        assert!(result.success, "{}", result.message);
        assert_eq!(link.commands(), vec![DeviceCommand::Tap { x: 500, y: 140 }]);
    }

    #[tokio::test]
    async fn test_find_and_tap_scrolls_then_finds() {
        let link = FakeLink::new(vec![
            screen(&["Alpha", "Beta"]),
            screen(&["Gamma", "Settings"]),
        ]);
        let result = dispatcher().find_and_tap(&link, "Settings").await.unwrap();
        assert!(result.success);
        assert_eq!(link.swipes(), 1);
        assert_eq!(result.data.unwrap()["scrolls"], 1);
    }

    #[tokio::test]
    async fn test_find_and_tap_failure_lists_at_most_ten_labels() {
        let labels: Vec<String> = (0..15).map(|i| format!("Item {}", i)).collect();
        let refs: Vec<&str> = labels.iter().map(String::as_str).collect();
        let link = FakeLink::new(vec![screen(&refs)]);

        let result = dispatcher()
            .run(&link, &SkillCall::FindAndTap { query: "Missing".to_string() })
            .await;
        assert!(!result.success);
        assert!(result.message.contains("No element matching 'Missing'"));
        assert_eq!(result.data.unwrap()["visible"].as_array().unwrap().len(), 10);
        assert_eq!(link.swipes(), 3);
    }

    #[tokio::test]
    async fn test_find_and_tap_ignores_disabled() {
        let mut disabled = el("Pay", Rect::new(0, 0, 100, 100), true);
        disabled.enabled = false;
        let link = FakeLink::new(vec![ScreenSnapshot::new(vec![disabled])]);
        let result = dispatcher().find_and_tap(&link, "Pay").await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_read_screen_collects_until_content_stops_moving() {
        let link = FakeLink::new(vec![
            screen(&["Line 1", "Line 2"]),
            screen(&["Line 2", "Line 3"]),
            screen(&["Line 3"]),
        ]);
        let result = dispatcher().read_screen(&link, 5).await.unwrap();
        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["text"], "Line 1\nLine 2\nLine 3");
        assert_eq!(data["pages"], 3);
        assert!(link.commands().iter().any(|c| matches!(
            c,
            DeviceCommand::ClipboardSet { text } if text == "Line 1\nLine 2\nLine 3"
        )));
    }

    #[tokio::test]
    async fn test_read_screen_reports_clipboard_failure() {
        let mut link = FakeLink::new(vec![screen(&["Only"])]);
        link.clipboard_ok = false;
        let result = dispatcher().read_screen(&link, 0).await.unwrap();
        assert!(!result.success);
        assert!(result.message.contains("denied"));
    }

    #[tokio::test]
    async fn test_submit_message_prefers_keyword_near_bottom_right() {
        let mut input = el("", Rect::new(0, 1800, 800, 1900), true);
        input.editable = true;
        let top_send = el("Send feedback", Rect::new(0, 0, 300, 100), true);
        let send = el("Send", Rect::new(850, 1800, 1000, 1900), true);
        let link = FakeLink::new(vec![ScreenSnapshot::new(vec![top_send, input, send])]);

        let result = dispatcher().submit_message(&link).await.unwrap();
        assert!(result.success);
        assert_eq!(link.commands(), vec![DeviceCommand::Tap { x: 925, y: 1850 }]);
    }

    #[tokio::test]
    async fn test_submit_message_falls_back_to_unlabelled_icon() {
        let icon = el("", Rect::new(900, 1850, 1000, 1950), true);
        let link = FakeLink::new(vec![ScreenSnapshot::new(vec![
            el("Hello", Rect::new(0, 100, 500, 200), false),
            icon,
        ])]);
        let result = dispatcher().submit_message(&link).await.unwrap();
        assert!(result.success);
        assert_eq!(link.commands(), vec![DeviceCommand::Tap { x: 950, y: 1900 }]);
    }

    #[tokio::test]
    async fn test_submit_message_without_candidates_fails() {
        let link = FakeLink::new(vec![screen(&["Hello"])]);
        let result = dispatcher().submit_message(&link).await.unwrap();
        assert!(!result.success);
        assert!(link.commands().is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_content_sees_new_text() {
        let link = FakeLink::new(vec![
            screen(&["Typing"]),
            screen(&["Typing"]),
            screen(&["Typing", "Reply arrived"]),
        ]);
        let result = dispatcher()
            .wait_for_content(&link, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(result.success);
        assert!(result.message.contains("Reply arrived"));
    }

    #[tokio::test]
    async fn test_wait_for_content_times_out() {
        let link = FakeLink::new(vec![screen(&["Static"])]);
        let result = dispatcher()
            .wait_for_content(&link, Duration::from_millis(30))
            .await
            .unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_ledger_error_becomes_failure() {
        struct Offline;

        #[async_trait]
        impl DeviceLink for Offline {
            fn device_id(&self) -> &str {
                "offline"
            }
            async fn execute(&self, _: DeviceCommand) -> Result<DeviceResponse, LedgerError> {
                Err(LedgerError::DeviceNotConnected("offline".to_string()))
            }
            fn screen_size(&self) -> Option<(u32, u32)> {
                None
            }
        }

        let result = dispatcher().run(&Offline, &SkillCall::SubmitMessage).await;
        assert!(!result.success);
        assert!(result.message.contains("Device not connected"));
    }
}
