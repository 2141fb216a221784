//! Maps oracle actions onto device commands.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::decision::{Action, ScrollDirection};
use crate::config::resolve_package;
use crate::protocol::DeviceCommand;
use crate::skills::SkillCall;

/// Upper bound of the relative coordinate space.
pub const RELATIVE_COORDINATE_MAX: f64 = 1000.0;

/// Default long-press hold time.
pub const DEFAULT_LONG_PRESS_MS: u64 = 800;

/// Default swipe duration.
pub const DEFAULT_SWIPE_MS: u64 = 300;

/// Longest wait the oracle may request in one step.
pub const MAX_WAIT_SECS: f64 = 10.0;

/// How oracle coordinates are interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateSystem {
    /// Device pixels.
    #[default]
    Absolute,
    /// 0..=1000 on both axes, scaled to the reported screen size.
    Relative,
}

impl FromStr for CoordinateSystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "absolute" | "abs" | "pixel" | "pixels" => Ok(Self::Absolute),
            "relative" | "rel" => Ok(Self::Relative),
            other => Err(format!("Unknown coordinate system: {}", other)),
        }
    }
}

impl CoordinateSystem {
    /// Express a device pixel in this coordinate space. Inverse of the
    /// scaling applied when planning an action.
    pub fn from_pixels(&self, (x, y): (i32, i32), (width, height): (u32, u32)) -> (i32, i32) {
        match self {
            Self::Relative if width > 0 && height > 0 => (
                (x as f64 * RELATIVE_COORDINATE_MAX / width as f64).round() as i32,
                (y as f64 * RELATIVE_COORDINATE_MAX / height as f64).round() as i32,
            ),
            _ => (x, y),
        }
    }
}

/// What the session loop should do with an action.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    /// Send one primitive command.
    Command(DeviceCommand),
    /// Run a skill in-process.
    Skill(SkillCall),
    /// Sleep without touching the device.
    Pause(Duration),
    /// Attach a screenshot to the next observation.
    Screenshot,
    /// Terminal sentinel.
    Finish(Option<String>),
}

/// A dispatch plus notes about any coordinate adjustments made.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedAction {
    pub dispatch: Dispatch,
    pub adjustments: Vec<String>,
}

/// Result of an action execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionResult {
    pub success: bool,
    pub should_finish: bool,
    pub message: Option<String>,
}

impl ActionResult {
    /// Create a successful result.
    pub fn success() -> Self {
        Self {
            success: true,
            should_finish: false,
            message: None,
        }
    }

    /// Create a failure result.
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            should_finish: false,
            message: Some(message.into()),
        }
    }

    /// Create a finish result.
    pub fn finish(message: Option<String>) -> Self {
        Self {
            success: true,
            should_finish: true,
            message,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Turns [`Action`]s into [`Dispatch`]es for a given screen size.
#[derive(Debug, Clone, Default)]
pub struct ActionHandler {
    coordinates: CoordinateSystem,
}

impl ActionHandler {
    /// Create a new ActionHandler.
    ///
    /// # Arguments
    /// * `coordinates` - How the oracle's coordinates are to be read.
    pub fn new(coordinates: CoordinateSystem) -> Self {
        Self { coordinates }
    }

    pub fn coordinate_system(&self) -> CoordinateSystem {
        self.coordinates
    }

    /// Plan the execution of an action.
    ///
    /// # Arguments
    /// * `action` - The action chosen by the oracle.
    /// * `screen_width` - Current screen width in pixels.
    /// * `screen_height` - Current screen height in pixels.
    ///
    /// # Returns
    /// The dispatch, or a message explaining why the action cannot run.
    pub fn plan(
        &self,
        action: &Action,
        screen_width: u32,
        screen_height: u32,
    ) -> Result<PlannedAction, String> {
        let screen = (screen_width.max(1), screen_height.max(1));
        let mut adjustments = Vec::new();
        let mut point = |x: f64, y: f64| self.map_point(x, y, screen, &mut adjustments);

        let dispatch = match action {
            Action::Tap { x, y } => {
                let (x, y) = point(*x, *y);
                Dispatch::Command(DeviceCommand::Tap { x, y })
            }
            Action::DoubleTap { x, y } => {
                let (x, y) = point(*x, *y);
                Dispatch::Command(DeviceCommand::DoubleTap { x, y })
            }
            Action::LongPress { x, y, duration_ms } => {
                let (x, y) = point(*x, *y);
                Dispatch::Command(DeviceCommand::LongPress {
                    x,
                    y,
                    duration_ms: duration_ms.unwrap_or(DEFAULT_LONG_PRESS_MS).clamp(100, 10_000),
                })
            }
            Action::Swipe {
                x1,
                y1,
                x2,
                y2,
                duration_ms,
            } => {
                let (x1, y1) = point(*x1, *y1);
                let (x2, y2) = point(*x2, *y2);
                Dispatch::Command(DeviceCommand::Swipe {
                    x1,
                    y1,
                    x2,
                    y2,
                    duration_ms: duration_ms.unwrap_or(DEFAULT_SWIPE_MS).clamp(50, 5_000),
                })
            }
            Action::Scroll { direction } => Dispatch::Command(scroll_swipe(*direction, screen)),
            Action::Type { text } => Dispatch::Command(DeviceCommand::Type { text: text.clone() }),
            Action::ClearText => Dispatch::Command(DeviceCommand::ClearText),
            Action::Enter => Dispatch::Command(DeviceCommand::Enter),
            Action::Back => Dispatch::Command(DeviceCommand::Back),
            Action::Home => Dispatch::Command(DeviceCommand::Home),
            Action::Recents => Dispatch::Command(DeviceCommand::Recents),
            Action::Launch { app } => {
                if app.trim().is_empty() {
                    return Err("launch needs an app name or package".to_string());
                }
                Dispatch::Command(DeviceCommand::Launch {
                    package_name: resolve_package(app),
                })
            }
            Action::OpenUrl { url } => {
                if url.trim().is_empty() {
                    return Err("open_url needs a url".to_string());
                }
                Dispatch::Command(DeviceCommand::OpenUrl {
                    url: url.trim().to_string(),
                })
            }
            Action::OpenNotifications => Dispatch::Command(DeviceCommand::OpenNotifications),
            Action::KeyEvent { code } => Dispatch::Command(DeviceCommand::KeyEvent { code: *code }),
            Action::ClipboardSet { text } => {
                Dispatch::Command(DeviceCommand::ClipboardSet { text: text.clone() })
            }
            Action::ClipboardGet => Dispatch::Command(DeviceCommand::ClipboardGet),
            Action::Paste => Dispatch::Command(DeviceCommand::Paste),
            Action::Wait { seconds } => {
                let seconds = match seconds {
                    Some(s) if s.is_finite() => s.clamp(0.0, MAX_WAIT_SECS),
                    _ => 1.0,
                };
                Dispatch::Pause(Duration::from_secs_f64(seconds))
            }
            Action::RequestScreenshot => Dispatch::Screenshot,
            Action::FindAndTap { query } => {
                if query.trim().is_empty() {
                    return Err("find_and_tap needs a query".to_string());
                }
                Dispatch::Skill(SkillCall::FindAndTap {
                    query: query.trim().to_string(),
                })
            }
            Action::ReadScreen { max_scrolls } => Dispatch::Skill(SkillCall::ReadScreen {
                max_scrolls: *max_scrolls,
            }),
            Action::SubmitMessage => Dispatch::Skill(SkillCall::SubmitMessage),
            Action::WaitForContent { timeout_secs } => Dispatch::Skill(SkillCall::WaitForContent {
                timeout: timeout_secs.map(|s| Duration::from_secs(s.min(60))),
            }),
            Action::Done { message } => Dispatch::Finish(message.clone()),
        };

        Ok(PlannedAction {
            dispatch,
            adjustments,
        })
    }

    /// Convert oracle coordinates to device pixels, clamping into the screen.
    fn map_point(
        &self,
        x: f64,
        y: f64,
        (width, height): (u32, u32),
        adjustments: &mut Vec<String>,
    ) -> (i32, i32) {
        let (px, py) = match self.coordinates {
            CoordinateSystem::Absolute => (x, y),
            CoordinateSystem::Relative => (
                x / RELATIVE_COORDINATE_MAX * width as f64,
                y / RELATIVE_COORDINATE_MAX * height as f64,
            ),
        };
        let cx = clamp_axis(px, width);
        let cy = clamp_axis(py, height);
        if cx as f64 != px.round() || cy as f64 != py.round() {
            adjustments.push(format!(
                "Coordinate ({}, {}) was outside the {}x{} screen and was clamped to ({}, {})",
                x.round(),
                y.round(),
                width,
                height,
                cx,
                cy
            ));
        }
        (cx, cy)
    }
}

fn clamp_axis(value: f64, extent: u32) -> i32 {
    let max = extent.saturating_sub(1) as f64;
    if !value.is_finite() {
        return 0;
    }
    value.round().clamp(0.0, max) as i32
}

/// Swipe covering the middle 40% of the screen, moving content in `direction`.
fn scroll_swipe(direction: ScrollDirection, (width, height): (u32, u32)) -> DeviceCommand {
    let w = width as f64;
    let h = height as f64;
    let (cx, cy) = ((w / 2.0) as i32, (h / 2.0) as i32);
    let (near_y, far_y) = ((h * 0.3) as i32, (h * 0.7) as i32);
    let (near_x, far_x) = ((w * 0.2) as i32, (w * 0.8) as i32);
    let (x1, y1, x2, y2) = match direction {
        // Reveal content below: finger moves up.
        ScrollDirection::Down => (cx, far_y, cx, near_y),
        ScrollDirection::Up => (cx, near_y, cx, far_y),
        ScrollDirection::Right => (far_x, cy, near_x, cy),
        ScrollDirection::Left => (near_x, cy, far_x, cy),
    };
    DeviceCommand::Swipe {
        x1,
        y1,
        x2,
        y2,
        duration_ms: DEFAULT_SWIPE_MS,
    }
}
