//! Wire messages exchanged with devices and dashboards.
//!
//! Every frame is a JSON object with a snake_case `type` tag and camelCase fields.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::screen::{ScreenSnapshot, UiElement};

/// Device metadata sent with `auth` and refreshed by `heartbeat`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    /// Stable device identifier chosen by the device app, if any.
    pub device_id: Option<String>,
    pub model: String,
    pub manufacturer: Option<String>,
    pub android_version: Option<String>,
    pub screen_width: u32,
    pub screen_height: u32,
    pub battery_level: Option<u8>,
    pub is_charging: Option<bool>,
}

/// Device -> server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    #[serde(rename_all = "camelCase")]
    Auth {
        api_key: String,
        #[serde(default)]
        device_info: DeviceInfo,
    },
    #[serde(rename_all = "camelCase")]
    Screen {
        request_id: String,
        #[serde(default)]
        elements: Vec<UiElement>,
        #[serde(default)]
        screenshot: Option<String>,
        #[serde(default)]
        package_name: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Result {
        request_id: String,
        success: bool,
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        data: Option<Value>,
    },
    Goal {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        #[serde(default)]
        battery_level: Option<u8>,
        #[serde(default)]
        is_charging: Option<bool>,
    },
    Pong,
}

/// Server -> device, for everything that is not a correlated command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    AuthOk { device_id: String },
    AuthError { message: String },
    Ping,
    #[serde(rename_all = "camelCase")]
    GoalStarted { session_id: String, goal: String },
    #[serde(rename_all = "camelCase")]
    GoalCompleted {
        session_id: String,
        success: bool,
        steps_used: u32,
    },
    Error { message: String },
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Primitive command executed by the device. Sent with a `requestId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceCommand {
    #[serde(rename_all = "camelCase")]
    GetScreen {
        #[serde(default, skip_serializing_if = "is_false")]
        include_screenshot: bool,
    },
    Tap { x: i32, y: i32 },
    DoubleTap { x: i32, y: i32 },
    #[serde(rename_all = "camelCase")]
    LongPress { x: i32, y: i32, duration_ms: u64 },
    #[serde(rename_all = "camelCase")]
    Swipe {
        x1: i32,
        y1: i32,
        x2: i32,
        y2: i32,
        duration_ms: u64,
    },
    Type { text: String },
    ClearText,
    Enter,
    Back,
    Home,
    Recents,
    #[serde(rename_all = "camelCase")]
    Launch { package_name: String },
    OpenUrl { url: String },
    OpenNotifications,
    KeyEvent { code: u32 },
    ClipboardSet { text: String },
    ClipboardGet,
    Paste,
}

impl DeviceCommand {
    pub fn get_screen() -> Self {
        Self::GetScreen {
            include_screenshot: false,
        }
    }

    /// The `type` tag as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetScreen { .. } => "get_screen",
            Self::Tap { .. } => "tap",
            Self::DoubleTap { .. } => "double_tap",
            Self::LongPress { .. } => "long_press",
            Self::Swipe { .. } => "swipe",
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
        }
    }

    /// Wire frame: the command fields plus the correlation id.
    pub fn to_frame(&self, request_id: &str) -> Value {
        let mut frame = serde_json::to_value(self).unwrap_or_else(|_| json!({ "type": self.name() }));
        if let Value::Object(ref mut map) = frame {
            map.insert("requestId".to_string(), json!(request_id));
        }
        frame
    }
}

/// Outcome reported by the device in a `result` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub data: Option<Value>,
}

impl CommandOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            data: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Correlated answer to a [`DeviceCommand`].
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceResponse {
    Screen(ScreenSnapshot),
    Result(CommandOutcome),
}

impl DeviceMessage {
    /// Split a correlated response into its request id and payload.
    pub fn into_response(self) -> Option<(String, DeviceResponse)> {
        match self {
            Self::Screen {
                request_id,
                elements,
                screenshot,
                package_name,
            } => Some((
                request_id,
                DeviceResponse::Screen(ScreenSnapshot {
                    elements,
                    screenshot,
                    package_name,
                }),
            )),
            Self::Result {
                request_id,
                success,
                error,
                data,
            } => Some((
                request_id,
                DeviceResponse::Result(CommandOutcome {
                    success,
                    error,
                    data,
                }),
            )),
            _ => None,
        }
    }
}

/// Dashboard -> server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardMessage {
    #[serde(rename_all = "camelCase")]
    Auth { api_key: String },
    #[serde(rename_all = "camelCase")]
    StartGoal { device_id: String, goal: String },
    #[serde(rename_all = "camelCase")]
    CancelGoal { session_id: String },
    Pong,
}

/// Server -> dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashboardEvent {
    #[serde(rename_all = "camelCase")]
    AuthOk { account_id: String },
    AuthError { message: String },
    #[serde(rename_all = "camelCase")]
    DeviceOnline {
        device_id: String,
        model: String,
        screen_width: u32,
        screen_height: u32,
    },
    #[serde(rename_all = "camelCase")]
    DeviceOffline { device_id: String },
    #[serde(rename_all = "camelCase")]
    DeviceStatus {
        device_id: String,
        battery_level: Option<u8>,
        is_charging: Option<bool>,
    },
    #[serde(rename_all = "camelCase")]
    GoalStarted {
        session_id: String,
        device_id: String,
        goal: String,
    },
    #[serde(rename_all = "camelCase")]
    Step {
        session_id: String,
        step: u32,
        action: Value,
        reasoning: String,
        screen_hash: String,
    },
    #[serde(rename_all = "camelCase")]
    GoalCompleted {
        session_id: String,
        success: bool,
        steps_used: u32,
    },
    Error { message: String },
    Ping,
}

/// Frame queued for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Json(Value),
    /// Ask the writer to close the socket.
    Close,
}

impl OutboundFrame {
    pub fn message<T: Serialize>(message: &T) -> Self {
        Self::Json(serde_json::to_value(message).unwrap_or(Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_auth_message() {
        let json = r#"{"type":"auth","apiKey":"k1","deviceInfo":{"model":"Pixel 8","screenWidth":1080,"screenHeight":2400}}"#;
        let msg: DeviceMessage = serde_json::from_str(json).unwrap();
        match msg {
            DeviceMessage::Auth {
                api_key,
                device_info,
            } => {
                assert_eq!(api_key, "k1");
                assert_eq!(device_info.model, "Pixel 8");
                assert_eq!(device_info.screen_height, 2400);
                assert!(device_info.device_id.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_screen_message_into_response() {
        let json = r#"{"type":"screen","requestId":"r1","elements":[{"text":"Hi"}],"packageName":"com.app"}"#;
        let msg: DeviceMessage = serde_json::from_str(json).unwrap();
        let (id, response) = msg.into_response().unwrap();
        assert_eq!(id, "r1");
        match response {
            DeviceResponse::Screen(snapshot) => {
                assert_eq!(snapshot.elements[0].text, "Hi");
                assert_eq!(snapshot.package_name.as_deref(), Some("com.app"));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_result_message_without_optional_fields() {
        let msg: DeviceMessage =
            serde_json::from_str(r#"{"type":"result","requestId":"r2","success":false}"#).unwrap();
        let (_, response) = msg.into_response().unwrap();
        assert_eq!(
            response,
            DeviceResponse::Result(CommandOutcome {
                success: false,
                error: None,
                data: None
            })
        );
    }

    #[test]
    fn test_goal_and_pong_have_no_response() {
        let goal: DeviceMessage = serde_json::from_str(r#"{"type":"goal","text":"open settings"}"#).unwrap();
        assert!(goal.into_response().is_none());
        let pong: DeviceMessage = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert_eq!(pong, DeviceMessage::Pong);
    }

    #[test]
    fn test_command_frame_carries_request_id() {
        let frame = DeviceCommand::Tap { x: 10, y: 20 }.to_frame("req-1");
        assert_eq!(frame["type"], "tap");
        assert_eq!(frame["x"], 10);
        assert_eq!(frame["requestId"], "req-1");

        let frame = DeviceCommand::get_screen().to_frame("req-2");
        assert_eq!(frame["type"], "get_screen");
        assert!(frame.get("includeScreenshot").is_none());

        let frame = DeviceCommand::Launch {
            package_name: "com.android.settings".to_string(),
        }
        .to_frame("req-3");
        assert_eq!(frame["packageName"], "com.android.settings");
    }

    #[test]
    fn test_server_message_serialization() {
        let value = serde_json::to_value(ServerMessage::GoalCompleted {
            session_id: "s1".to_string(),
            success: true,
            steps_used: 4,
        })
        .unwrap();
        assert_eq!(value["type"], "goal_completed");
        assert_eq!(value["stepsUsed"], 4);
        assert_eq!(value["sessionId"], "s1");
    }

    #[test]
    fn test_dashboard_message_parse() {
        let msg: DashboardMessage =
            serde_json::from_str(r#"{"type":"start_goal","deviceId":"d1","goal":"call mom"}"#).unwrap();
        assert_eq!(
            msg,
            DashboardMessage::StartGoal {
                device_id: "d1".to_string(),
                goal: "call mom".to_string()
            }
        );
    }

    #[test]
    fn test_command_name_matches_tag() {
        let commands = vec![
            DeviceCommand::get_screen(),
            DeviceCommand::ClipboardSet {
                text: "x".to_string(),
            },
            DeviceCommand::OpenNotifications,
            DeviceCommand::Swipe {
                x1: 0,
                y1: 0,
                x2: 1,
                y2: 1,
                duration_ms: 300,
            },
        ];
        for command in commands {
            let value = serde_json::to_value(&command).unwrap();
            assert_eq!(value["type"], command.name());
        }
    }
}
