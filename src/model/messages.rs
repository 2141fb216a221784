//! Conversation building for oracle queries.

use serde_json::{json, Value};
use std::fmt::Write;

use crate::actions::CoordinateSystem;
use crate::screen::{ScreenDiff, ScreenSnapshot};

/// Elements listed per observation; the rest are summarised by count.
pub const MAX_LISTED_ELEMENTS: usize = 80;

/// Helper for building conversation messages.
pub struct MessageBuilder;

impl MessageBuilder {
    /// Create a system message.
    pub fn create_system_message(content: &str) -> Value {
        json!({
            "role": "system",
            "content": content
        })
    }

    /// Create a user message with optional image.
    ///
    /// # Arguments
    /// * `text` - Text content.
    /// * `image_base64` - Optional base64-encoded PNG.
    pub fn create_user_message(text: &str, image_base64: Option<&str>) -> Value {
        let mut content = Vec::new();

        if let Some(img_data) = image_base64 {
            content.push(json!({
                "type": "image_url",
                "image_url": {
                    "url": format!("data:image/png;base64,{}", img_data)
                }
            }));
        }

        content.push(json!({
            "type": "text",
            "text": text
        }));

        json!({
            "role": "user",
            "content": content
        })
    }

    /// Create an assistant message.
    pub fn create_assistant_message(content: &str) -> Value {
        json!({
            "role": "assistant",
            "content": content
        })
    }

    /// Remove image content from a message to save context space.
    pub fn remove_images_from_message(message: &mut Value) {
        if let Some(Value::Array(arr)) = message.get_mut("content") {
            arr.retain(|item| {
                item.get("type")
                    .and_then(|t| t.as_str())
                    .map(|t| t == "text")
                    .unwrap_or(false)
            });
        }
    }
}

/// Everything the oracle is shown for one step.
#[derive(Debug, Clone, Copy)]
pub struct Observation<'a> {
    pub goal: &'a str,
    pub step: u32,
    pub max_steps: u32,
    /// Outcome of the previous action, if any.
    pub feedback: Option<&'a str>,
    /// Most recent actions, oldest first.
    pub history: &'a [String],
    pub diff: &'a ScreenDiff,
    /// Detector output.
    pub warnings: &'a [String],
    pub snapshot: &'a ScreenSnapshot,
    /// Attached only when the text view is not enough.
    pub screenshot: Option<&'a str>,
    /// Space element positions are listed in, matching what the oracle answers in.
    pub coordinates: CoordinateSystem,
    /// Device pixels, `(width, height)`.
    pub screen_size: (u32, u32),
}

impl Observation<'_> {
    /// Render the observation as the text of a user message.
    pub fn render(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(text, "Goal: {}", self.goal);
        let _ = writeln!(text, "Step {} of {}", self.step, self.max_steps);
        if let Some(feedback) = self.feedback {
            let _ = writeln!(text, "Last action result: {}", feedback);
        }
        if !self.history.is_empty() {
            let _ = writeln!(text, "Recent actions: {}", self.history.join(" -> "));
        }
        let _ = writeln!(text, "Screen: {}", self.diff.summary);
        for warning in self.warnings {
            let _ = writeln!(text, "WARNING: {}", warning);
        }
        if let Some(package) = &self.snapshot.package_name {
            let _ = writeln!(text, "Foreground app: {}", package);
        }

        let meaningful: Vec<_> = self.snapshot.meaningful_elements().collect();
        if meaningful.is_empty() {
            let _ = writeln!(text, "No UI elements were reported for this screen.");
        } else {
            let _ = writeln!(text, "UI elements:");
            for (index, element) in meaningful.iter().take(MAX_LISTED_ELEMENTS).enumerate() {
                let (cx, cy) = self
                    .coordinates
                    .from_pixels(element.center(), self.screen_size);
                let _ = write!(text, "[{}] \"{}\" at ({}, {})", index, element.label(), cx, cy);
                if !element.id.is_empty() {
                    let short_id = element.id.rsplit('/').next().unwrap_or(&element.id);
                    let _ = write!(text, " id={}", short_id);
                }
                let mut flags = Vec::new();
                if element.clickable {
                    flags.push("clickable");
                }
                if element.editable {
                    flags.push("editable");
                }
                if element.scrollable {
                    flags.push("scrollable");
                }
                if element.checked {
                    flags.push("checked");
                }
                if element.focused {
                    flags.push("focused");
                }
                if !element.enabled {
                    flags.push("disabled");
                }
                if !flags.is_empty() {
                    let _ = write!(text, " [{}]", flags.join(", "));
                }
                text.push('\n');
            }
            if meaningful.len() > MAX_LISTED_ELEMENTS {
                let _ = writeln!(
                    text,
                    "... and {} more elements",
                    meaningful.len() - MAX_LISTED_ELEMENTS
                );
            }
        }
        text
    }

    /// Build the full message list for this observation.
    pub fn to_messages(&self, system_prompt: &str) -> Vec<Value> {
        vec![
            MessageBuilder::create_system_message(system_prompt),
            MessageBuilder::create_user_message(&self.render(), self.screenshot),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::{Rect, UiElement};

    #[test]
    fn test_message_builder() {
        let system_msg = MessageBuilder::create_system_message("You are an assistant");
        assert_eq!(system_msg["role"], "system");

        let mut user_msg = MessageBuilder::create_user_message("Look at this", Some("base64data"));
        assert_eq!(user_msg["content"][0]["type"], "image_url");
        MessageBuilder::remove_images_from_message(&mut user_msg);
        assert_eq!(user_msg["content"].as_array().unwrap().len(), 1);
        assert_eq!(user_msg["content"][0]["text"], "Look at this");
    }

    #[test]
    fn test_observation_render() {
        let snapshot = ScreenSnapshot::new(vec![
            UiElement {
                id: "com.app:id/send".to_string(),
                text: "Send".to_string(),
                bounds: Rect::new(0, 0, 100, 50),
                clickable: true,
                enabled: true,
                ..Default::default()
            },
            UiElement {
                enabled: true,
                ..Default::default()
            },
        ])
        .with_package("com.app");
        let diff = ScreenDiff::initial();
        let history = vec!["tap(1,2)".to_string(), "back".to_string()];
        let warnings = vec!["Do not repeat tap(1,2)".to_string()];
        let observation = Observation {
            goal: "send hi",
            step: 2,
            max_steps: 10,
            feedback: Some("tap succeeded"),
            history: &history,
            diff: &diff,
            warnings: &warnings,
            snapshot: &snapshot,
            screenshot: None,
            coordinates: CoordinateSystem::Absolute,
            screen_size: (1080, 2400),
        };

        let text = observation.render();
        assert!(text.contains("Goal: send hi"));
        assert!(text.contains("Step 2 of 10"));
        assert!(text.contains("Recent actions: tap(1,2) -> back"));
        assert!(text.contains("WARNING: Do not repeat tap(1,2)"));
        assert!(text.contains("[0] \"Send\" at (50, 25) id=send [clickable]"));
        assert!(!text.contains("[1]"));

        let messages = observation.to_messages("system");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["content"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_relative_mode_lists_relative_centers() {
        let snapshot = ScreenSnapshot::new(vec![UiElement {
            text: "Settings".to_string(),
            bounds: Rect::new(440, 1100, 640, 1300),
            clickable: true,
            enabled: true,
            ..Default::default()
        }]);
        let diff = ScreenDiff::initial();
        let mut observation = Observation {
            goal: "open settings",
            step: 1,
            max_steps: 5,
            feedback: None,
            history: &[],
            diff: &diff,
            warnings: &[],
            snapshot: &snapshot,
            screenshot: None,
            coordinates: CoordinateSystem::Relative,
            screen_size: (1080, 2400),
        };
        assert!(observation.render().contains("[0] \"Settings\" at (500, 500)"));

        observation.coordinates = CoordinateSystem::Absolute;
        assert!(observation.render().contains("[0] \"Settings\" at (540, 1200)"));
    }

    #[test]
    fn test_observation_empty_screen_with_screenshot() {
        let snapshot = ScreenSnapshot::default();
        let diff = ScreenDiff::initial();
        let observation = Observation {
            goal: "g",
            step: 1,
            max_steps: 1,
            feedback: None,
            history: &[],
            diff: &diff,
            warnings: &[],
            snapshot: &snapshot,
            screenshot: Some("png"),
            coordinates: CoordinateSystem::Relative,
            screen_size: (0, 0),
        };
        assert!(observation.render().contains("No UI elements"));
        let messages = observation.to_messages("system");
        assert_eq!(messages[1]["content"][0]["type"], "image_url");
    }
}
