//! Screen snapshot types reported by the device.

use serde::{Deserialize, Serialize};

/// Element bounds in device pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Center point of the rectangle. Bounds come from the device, so any
    /// `i32` values are accepted.
    pub fn center(&self) -> (i32, i32) {
        (midpoint(self.left, self.right), midpoint(self.top, self.bottom))
    }

    pub fn width(&self) -> i32 {
        span(self.left, self.right)
    }

    pub fn height(&self) -> i32 {
        span(self.top, self.bottom)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

fn midpoint(a: i32, b: i32) -> i32 {
    // The mean of two i32 values always fits back into i32.
    ((i64::from(a) + i64::from(b)) / 2) as i32
}

fn span(from: i32, to: i32) -> i32 {
    (i64::from(to) - i64::from(from)).clamp(0, i64::from(i32::MAX)) as i32
}

fn default_enabled() -> bool {
    true
}

/// A single accessibility node as flattened by the device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UiElement {
    /// Resource id (may be empty).
    pub id: String,
    /// Visible text.
    pub text: String,
    /// Accessibility content description.
    pub content_desc: String,
    /// Widget class name, e.g. `android.widget.Button`.
    pub class_name: String,
    pub bounds: Rect,
    pub clickable: bool,
    pub long_clickable: bool,
    pub editable: bool,
    pub scrollable: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub checked: bool,
    pub focused: bool,
}

impl UiElement {
    /// Text shown to the user: the text itself, falling back to the content description.
    pub fn label(&self) -> &str {
        let text = self.text.trim();
        if text.is_empty() {
            self.content_desc.trim()
        } else {
            text
        }
    }

    pub fn is_interactive(&self) -> bool {
        self.clickable || self.long_clickable || self.editable || self.scrollable
    }

    pub fn center(&self) -> (i32, i32) {
        self.bounds.center()
    }
}

/// Transient view of the device screen. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScreenSnapshot {
    pub elements: Vec<UiElement>,
    /// Base64-encoded PNG, only when the device chose to attach one.
    pub screenshot: Option<String>,
    /// Foreground app package.
    pub package_name: Option<String>,
}

impl ScreenSnapshot {
    pub fn new(elements: Vec<UiElement>) -> Self {
        Self {
            elements,
            screenshot: None,
            package_name: None,
        }
    }

    pub fn with_package(mut self, package_name: impl Into<String>) -> Self {
        self.package_name = Some(package_name.into());
        self
    }

    pub fn with_screenshot(mut self, screenshot: impl Into<String>) -> Self {
        self.screenshot = Some(screenshot.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Elements worth showing to the oracle: labelled or interactive ones.
    pub fn meaningful_elements(&self) -> impl Iterator<Item = &UiElement> {
        self.elements
            .iter()
            .filter(|e| !e.label().is_empty() || e.is_interactive())
    }

    /// A screen with very few meaningful nodes usually means a canvas, game or webview.
    pub fn is_sparse(&self, threshold: usize) -> bool {
        self.meaningful_elements().count() < threshold
    }

    /// Non-empty labels in screen order, duplicates removed.
    pub fn labels(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        self.elements
            .iter()
            .map(|e| e.label())
            .filter(|l| !l.is_empty())
            .filter(|l| seen.insert(l.to_string()))
            .map(|l| l.to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_center() {
        let rect = Rect::new(0, 100, 200, 300);
        assert_eq!(rect.center(), (100, 200));
        assert_eq!(rect.width(), 200);
        assert!(!rect.is_empty());
        assert!(Rect::default().is_empty());
    }

    #[test]
    fn test_rect_extreme_bounds_do_not_overflow() {
        let rect = Rect::new(i32::MAX - 1, i32::MIN, i32::MAX, i32::MAX);
        assert_eq!(rect.center(), (i32::MAX - 1, 0));
        assert_eq!(rect.width(), 1);
        assert_eq!(rect.height(), i32::MAX);

        let inverted = Rect::new(i32::MAX, 0, i32::MIN, 10);
        assert_eq!(inverted.center(), (0, 5));
        assert!(inverted.is_empty());
    }

    #[test]
    fn test_element_label_falls_back_to_description() {
        let element = UiElement {
            content_desc: "Send".to_string(),
            ..Default::default()
        };
        assert_eq!(element.label(), "Send");
    }

    #[test]
    fn test_snapshot_deserialize_camel_case() {
        let json = r#"{
            "elements": [
                {"id": "btn", "text": "OK", "bounds": {"left": 0, "top": 0, "right": 10, "bottom": 10},
                 "clickable": true, "contentDesc": "confirm"}
            ],
            "packageName": "com.example"
        }"#;
        let snapshot: ScreenSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.elements.len(), 1);
        assert!(snapshot.elements[0].enabled);
        assert_eq!(snapshot.elements[0].content_desc, "confirm");
        assert_eq!(snapshot.package_name.as_deref(), Some("com.example"));
    }

    #[test]
    fn test_labels_dedup() {
        let snapshot = ScreenSnapshot::new(vec![
            UiElement {
                text: "Chats".to_string(),
                ..Default::default()
            },
            UiElement {
                text: "Chats".to_string(),
                ..Default::default()
            },
            UiElement::default(),
        ]);
        assert_eq!(snapshot.labels(), vec!["Chats".to_string()]);
        assert!(snapshot.is_sparse(3));
    }
}
