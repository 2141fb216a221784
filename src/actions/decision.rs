//! Action decisions produced by the decision oracle.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised while turning oracle output into an [`ActionDecision`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    #[error("No JSON object found in model output")]
    NoJson,
    #[error("Missing \"action\" field")]
    MissingAction,
    #[error("Unknown action: {0}")]
    UnknownAction(String),
    #[error("Invalid parameters for '{action}': {message}")]
    InvalidParameters { action: String, message: String },
}

impl ActionError {
    /// Correction appended to the conversation when the oracle is re-asked.
    pub fn correction(&self) -> String {
        format!(
            "Your previous reply could not be used: {}. Reply with exactly one JSON object, \
             for example {{\"action\": \"tap\", \"x\": 540, \"y\": 1200, \"reasoning\": \"...\"}}. \
             Valid actions: {}.",
            self,
            Action::KINDS.join(", ")
        )
    }
}

/// Scroll direction, in terms of where the content moves into view from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

/// Coarse grouping used by the stuck detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionFamily {
    /// Tap, double tap, long press.
    Touch,
    /// Swipe and scroll.
    Gesture,
    /// Typing, clipboard and editing keys.
    Text,
    /// Back, home, recents, notifications, key events.
    System,
    /// Launching apps and URLs.
    App,
    Wait,
    Skill,
    Terminal,
}

impl ActionFamily {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Touch => "tap/long-press",
            Self::Gesture => "swipe/scroll",
            Self::Text => "text entry",
            Self::System => "system navigation",
            Self::App => "app launch",
            Self::Wait => "wait",
            Self::Skill => "skill",
            Self::Terminal => "done",
        }
    }
}

/// One action chosen by the oracle.
///
/// Coordinates are as the oracle emitted them; the handler maps them to
/// device pixels according to the configured coordinate system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    #[serde(alias = "click")]
    Tap { x: f64, y: f64 },
    DoubleTap { x: f64, y: f64 },
    LongPress {
        x: f64,
        y: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    Swipe {
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    Scroll { direction: ScrollDirection },
    #[serde(alias = "input", alias = "type_text")]
    Type { text: String },
    ClearText,
    Enter,
    Back,
    Home,
    Recents,
    #[serde(alias = "open_app")]
    Launch {
        #[serde(alias = "package", alias = "package_name")]
        app: String,
    },
    OpenUrl { url: String },
    OpenNotifications,
    KeyEvent { code: u32 },
    ClipboardSet { text: String },
    ClipboardGet,
    Paste,
    Wait {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seconds: Option<f64>,
    },
    RequestScreenshot,
    FindAndTap {
        #[serde(alias = "text", alias = "target")]
        query: String,
    },
    ReadScreen {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_scrolls: Option<u32>,
    },
    SubmitMessage,
    WaitForContent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_secs: Option<u64>,
    },
    #[serde(alias = "finish")]
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Action {
    /// Every action name accepted on the wire.
    pub const KINDS: [&'static str; 25] = [
        "tap",
        "double_tap",
        "long_press",
        "swipe",
        "scroll",
        "type",
        "clear_text",
        "enter",
        "back",
        "home",
        "recents",
        "launch",
        "open_url",
        "open_notifications",
        "key_event",
        "clipboard_set",
        "clipboard_get",
        "paste",
        "wait",
        "request_screenshot",
        "find_and_tap",
        "read_screen",
        "submit_message",
        "wait_for_content",
        "done",
    ];

    /// The fallback used when a step produced no usable decision.
    pub fn fallback() -> Self {
        Self::Wait { seconds: None }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tap { .. } => "tap",
            Self::DoubleTap { .. } => "double_tap",
            Self::LongPress { .. } => "long_press",
            Self::Swipe { .. } => "swipe",
            Self::Scroll { .. } => "scroll",
            Self::Type { .. } => "type",
            Self::ClearText => "clear_text",
            Self::Enter => "enter",
            Self::Back => "back",
            Self::Home => "home",
            Self::Recents => "recents",
            Self::Launch { .. } => "launch",
            Self::OpenUrl { .. } => "open_url",
            Self::OpenNotifications => "open_notifications",
            Self::KeyEvent { .. } => "key_event",
            Self::ClipboardSet { .. } => "clipboard_set",
            Self::ClipboardGet => "clipboard_get",
            Self::Paste => "paste",
            Self::Wait { .. } => "wait",
            Self::RequestScreenshot => "request_screenshot",
            Self::FindAndTap { .. } => "find_and_tap",
            Self::ReadScreen { .. } => "read_screen",
            Self::SubmitMessage => "submit_message",
            Self::WaitForContent { .. } => "wait_for_content",
            Self::Done { .. } => "done",
        }
    }

    pub fn family(&self) -> ActionFamily {
        match self {
            Self::Tap { .. } | Self::DoubleTap { .. } | Self::LongPress { .. } => {
                ActionFamily::Touch
            }
            Self::Swipe { .. } | Self::Scroll { .. } => ActionFamily::Gesture,
            Self::Type { .. }
            | Self::ClearText
            | Self::Enter
            | Self::ClipboardSet { .. }
            | Self::ClipboardGet
            | Self::Paste => ActionFamily::Text,
            Self::Back
            | Self::Home
            | Self::Recents
            | Self::OpenNotifications
            | Self::KeyEvent { .. } => ActionFamily::System,
            Self::Launch { .. } | Self::OpenUrl { .. } => ActionFamily::App,
            Self::Wait { .. } | Self::RequestScreenshot => ActionFamily::Wait,
            Self::FindAndTap { .. }
            | Self::ReadScreen { .. }
            | Self::SubmitMessage
            | Self::WaitForContent { .. } => ActionFamily::Skill,
            Self::Done { .. } => ActionFamily::Terminal,
        }
    }

    /// Moves around without interacting with anything.
    pub fn is_navigation(&self) -> bool {
        matches!(
            self,
            Self::Scroll { .. }
                | Self::Swipe { .. }
                | Self::Back
                | Self::Home
                | Self::Wait { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { .. })
    }

    /// Compact form including coordinates, e.g. `tap(10,20)`.
    pub fn signature(&self) -> String {
        fn px(v: f64) -> i64 {
            v.round() as i64
        }
        match self {
            Self::Tap { x, y } | Self::DoubleTap { x, y } | Self::LongPress { x, y, .. } => {
                format!("{}({},{})", self.kind(), px(*x), px(*y))
            }
            Self::Swipe { x1, y1, x2, y2, .. } => {
                format!("swipe({},{}->{},{})", px(*x1), px(*y1), px(*x2), px(*y2))
            }
            Self::Scroll { direction } => format!("scroll({})", direction.as_str()),
            Self::Type { text } | Self::ClipboardSet { text } => {
                format!("{}({})", self.kind(), text)
            }
            Self::Launch { app } => format!("launch({})", app),
            Self::OpenUrl { url } => format!("open_url({})", url),
            Self::KeyEvent { code } => format!("key_event({})", code),
            Self::FindAndTap { query } => format!("find_and_tap({})", query),
            Self::Wait { seconds: Some(s) } => format!("wait({})", s),
            _ => self.kind().to_string(),
        }
    }

    /// Wire form used in step records and dashboard events.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({ "action": self.kind() }))
    }
}

/// A single decision: the action plus the oracle's rationale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDecision {
    pub action: Action,
    pub reasoning: String,
    pub plan: Option<String>,
}

impl ActionDecision {
    pub fn new(action: Action, reasoning: impl Into<String>) -> Self {
        Self {
            action,
            reasoning: reasoning.into(),
            plan: None,
        }
    }

    /// Decision recorded for a step whose oracle output was unusable.
    pub fn fallback(reason: impl Into<String>) -> Self {
        Self::new(Action::fallback(), reason)
    }
}

/// Remove `<think>...</think>` blocks, returning the remaining text and the thoughts.
fn split_thinking(text: &str) -> (String, String) {
    let mut rest = String::new();
    let mut thinking = String::new();
    let mut remaining = text;
    while let Some(start) = remaining.find("<think>") {
        rest.push_str(&remaining[..start]);
        let after = &remaining[start + "<think>".len()..];
        match after.find("</think>") {
            Some(end) => {
                thinking.push_str(after[..end].trim());
                remaining = &after[end + "</think>".len()..];
            }
            None => {
                // Unclosed block: everything after it is thought.
                thinking.push_str(after.trim());
                remaining = "";
            }
        }
    }
    rest.push_str(remaining);
    (rest, thinking)
}

/// Locate the first balanced `{...}` in `text` that parses as a JSON object.
pub fn extract_json_object(text: &str) -> Option<Map<String, Value>> {
    let bytes = text.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = text[search_from..].find('{') {
        let start = search_from + offset;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;
        for (i, &b) in bytes.iter().enumerate().skip(start) {
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
                continue;
            }
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(i);
                        break;
                    }
                }
                _ => {}
            }
        }
        if let Some(end) = end {
            if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&text[start..=end]) {
                return Some(map);
            }
        }
        search_from = start + 1;
    }
    None
}

fn normalize_kind(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .replace([' ', '-'], "_")
}

fn take_text(map: &mut Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match map.remove(*key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    })
}

/// Parse raw oracle output into a decision.
///
/// Accepts prose, `<think>` blocks and markdown fences around a single JSON
/// object carrying an `action` tag.
pub fn parse_decision(text: &str) -> Result<ActionDecision, ActionError> {
    let (body, thinking) = split_thinking(text);
    let mut map = extract_json_object(&body).ok_or(ActionError::NoJson)?;

    let raw_kind = match map.get("action") {
        Some(Value::String(s)) => s.clone(),
        _ => return Err(ActionError::MissingAction),
    };
    let kind = normalize_kind(&raw_kind);

    let reasoning = take_text(&mut map, &["reasoning", "reason", "thought", "thinking"])
        .unwrap_or(thinking);
    let plan = take_text(&mut map, &["plan"]);

    map.insert("action".to_string(), Value::String(kind.clone()));
    let action: Action = serde_json::from_value(Value::Object(map)).map_err(|e| {
        if e.to_string().contains("unknown variant") {
            ActionError::UnknownAction(raw_kind.clone())
        } else {
            ActionError::InvalidParameters {
                action: kind.clone(),
                message: e.to_string(),
            }
        }
    })?;

    Ok(ActionDecision {
        action,
        reasoning,
        plan,
    })
}
