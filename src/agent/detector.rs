//! Stuck, repetition and drift detection.
//!
//! Detectors only annotate the next oracle query. They never veto or rewrite
//! an action.

use std::collections::{HashMap, VecDeque};

use crate::actions::{Action, ActionFamily};
use crate::screen::ScreenDiff;

/// Default stuck threshold (consecutive unchanged screens).
pub const DEFAULT_STUCK_THRESHOLD: u32 = 3;

/// Actions inspected for repetition.
pub const REPETITION_WINDOW: usize = 8;

/// Occurrences of one signature inside the window that trigger a warning.
pub const REPETITION_LIMIT: usize = 3;

/// Actions inspected for drift.
pub const DRIFT_WINDOW: usize = 5;

/// Navigation-only actions inside the drift window that trigger a warning.
pub const DRIFT_LIMIT: usize = 4;

/// One executed action as seen by the detectors.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRecord {
    pub signature: String,
    pub family: ActionFamily,
    pub navigation: bool,
    /// Digest of the screen the action was taken on.
    pub screen_hash: String,
}

impl ActionRecord {
    pub fn new(action: &Action, screen_hash: impl Into<String>) -> Self {
        Self {
            signature: action.signature(),
            family: action.family(),
            navigation: action.is_navigation(),
            screen_hash: screen_hash.into(),
        }
    }
}

/// Counts consecutive unchanged screens.
#[derive(Debug, Clone)]
pub struct StuckTracker {
    threshold: u32,
    count: u32,
}

impl Default for StuckTracker {
    fn default() -> Self {
        Self::new(DEFAULT_STUCK_THRESHOLD)
    }
}

impl StuckTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            count: 0,
        }
    }

    /// Feed one diff. Returns the updated count.
    pub fn observe(&mut self, diff: &ScreenDiff) -> u32 {
        if diff.changed {
            self.count = 0;
        } else {
            self.count += 1;
        }
        self.count
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn is_stuck(&self) -> bool {
        self.count >= self.threshold
    }
}

/// Most common family among the `recent` latest records.
fn dominant_family(window: &[ActionRecord], recent: usize) -> Option<ActionFamily> {
    let mut counts: HashMap<ActionFamily, usize> = HashMap::new();
    let start = window.len().saturating_sub(recent);
    let mut best: Option<(ActionFamily, usize)> = None;
    // Later records win ties.
    for record in &window[start..] {
        let n = counts.entry(record.family).or_insert(0);
        *n += 1;
        if best.map_or(true, |(_, m)| *n >= m) {
            best = Some((record.family, *n));
        }
    }
    best.map(|(family, _)| family)
}

fn side_channel_for(family: Option<ActionFamily>) -> &'static str {
    match family {
        Some(ActionFamily::Touch) => {
            "Tapping is not working here. Enter text directly with type, or use clipboard_set followed by paste, or find_and_tap a different label."
        }
        Some(ActionFamily::Gesture) => {
            "Scrolling is not moving the content. Use find_and_tap to jump to the target, or launch/open_url to reach it directly."
        }
        Some(ActionFamily::Text) => {
            "Text entry is not changing the screen. Tap the input field first, or use clipboard_set followed by paste."
        }
        _ => "Try a completely different approach: back, relaunch the app, or open the target with open_url.",
    }
}

/// Escalating hint once the tracker reaches its threshold.
pub fn stuck_hint(tracker: &StuckTracker, window: &[ActionRecord]) -> Option<String> {
    if !tracker.is_stuck() {
        return None;
    }
    let family = dominant_family(window, tracker.count() as usize);
    let family_name = family.map(|f| f.describe()).unwrap_or("recent");
    let advice = side_channel_for(family);
    if tracker.count() >= tracker.threshold() * 2 {
        Some(format!(
            "STILL STUCK: the screen has not changed for {} steps. STOP using {} actions. {}",
            tracker.count(),
            family_name,
            advice
        ))
    } else {
        Some(format!(
            "You appear stuck: the screen has not changed for {} steps and your {} actions had no effect. {}",
            tracker.count(),
            family_name,
            advice
        ))
    }
}

/// Warn when one exact action keeps recurring in the recent window.
pub fn repetition_warning(window: &[ActionRecord]) -> Option<String> {
    let start = window.len().saturating_sub(REPETITION_WINDOW);
    let mut counts: HashMap<&str, usize> = HashMap::new();
    let mut worst: Option<(&str, usize)> = None;
    for record in &window[start..] {
        let n = counts.entry(record.signature.as_str()).or_insert(0);
        *n += 1;
        if worst.map_or(true, |(_, m)| *n > m) {
            worst = Some((record.signature.as_str(), *n));
        }
    }
    match worst {
        Some((signature, n)) if n >= REPETITION_LIMIT => Some(format!(
            "You have performed {} {} times in your last {} actions. Do NOT repeat it; choose a different action.",
            signature,
            n,
            window.len() - start
        )),
        _ => None,
    }
}

/// Warn when the recent actions only move around without interacting.
pub fn drift_warning(window: &[ActionRecord]) -> Option<String> {
    let start = window.len().saturating_sub(DRIFT_WINDOW);
    let navigation = window[start..].iter().filter(|r| r.navigation).count();
    if navigation >= DRIFT_LIMIT {
        Some(format!(
            "{} of your last {} actions were only navigation (scroll/swipe/back/home/wait). Your next action must interact with a concrete element.",
            navigation,
            window.len() - start
        ))
    } else {
        None
    }
}

/// Rolling window plus stuck tracker for one session.
#[derive(Debug, Clone, Default)]
pub struct Detectors {
    stuck: StuckTracker,
    window: VecDeque<ActionRecord>,
}

impl Detectors {
    pub fn new(stuck_threshold: u32) -> Self {
        Self {
            stuck: StuckTracker::new(stuck_threshold),
            window: VecDeque::with_capacity(REPETITION_WINDOW),
        }
    }

    /// Remember an executed action.
    pub fn record(&mut self, record: ActionRecord) {
        if self.window.len() == REPETITION_WINDOW.max(DRIFT_WINDOW) {
            self.window.pop_front();
        }
        self.window.push_back(record);
    }

    /// Feed the latest diff and collect every warning for the next query.
    pub fn observe(&mut self, diff: &ScreenDiff) -> Vec<String> {
        self.stuck.observe(diff);
        let window: Vec<ActionRecord> = self.window.iter().cloned().collect();
        [
            stuck_hint(&self.stuck, &window),
            repetition_warning(&window),
            drift_warning(&window),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    pub fn is_stuck(&self) -> bool {
        self.stuck.is_stuck()
    }

    pub fn stuck_count(&self) -> u32 {
        self.stuck.count()
    }
}
