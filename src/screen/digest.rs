//! Screen fingerprinting and step-to-step diffing.
//!
//! The fingerprint is order- and attribute-sensitive on purpose: two screens
//! holding the same elements in a different order are reported as changed.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use super::snapshot::ScreenSnapshot;

/// Maximum labels reported per direction in a diff.
pub const MAX_DIFF_LABELS: usize = 5;

/// Deterministic summary of a snapshot used only for equality between steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenDigest {
    fingerprint: String,
    hash: u64,
    labels: Vec<String>,
}

impl ScreenDigest {
    /// Compute the digest of a snapshot.
    pub fn of(snapshot: &ScreenSnapshot) -> Self {
        // One JSON array per element keeps field boundaries unambiguous.
        let mut fingerprint = String::new();
        for element in &snapshot.elements {
            let (cx, cy) = element.center();
            let entry = serde_json::json!([
                element.id,
                element.text,
                cx,
                cy,
                element.enabled,
                element.checked
            ]);
            fingerprint.push_str(&entry.to_string());
        }

        let mut hasher = DefaultHasher::new();
        fingerprint.hash(&mut hasher);

        Self {
            fingerprint,
            hash: hasher.finish(),
            labels: snapshot.labels(),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Short hex form, used in step records and dashboard events.
    pub fn short_hash(&self) -> String {
        format!("{:016x}", self.hash)
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn same_screen(&self, other: &ScreenDigest) -> bool {
        self.fingerprint == other.fingerprint
    }
}

/// What changed between two consecutive screens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenDiff {
    pub changed: bool,
    pub appeared: Vec<String>,
    pub disappeared: Vec<String>,
    /// One line, fed verbatim into the next oracle query.
    pub summary: String,
}

impl ScreenDiff {
    /// Diff for the first observed screen of a session.
    pub fn initial() -> Self {
        Self {
            changed: true,
            appeared: Vec::new(),
            disappeared: Vec::new(),
            summary: "First observation of the screen.".to_string(),
        }
    }
}

fn missing_from(source: &[String], other: &[String]) -> Vec<String> {
    let other: HashSet<&str> = other.iter().map(String::as_str).collect();
    source
        .iter()
        .filter(|label| !other.contains(label.as_str()))
        .take(MAX_DIFF_LABELS)
        .cloned()
        .collect()
}

/// Compare two digests.
pub fn diff(prev: &ScreenDigest, curr: &ScreenDigest) -> ScreenDiff {
    let changed = !prev.same_screen(curr);
    if !changed {
        return ScreenDiff {
            changed,
            appeared: Vec::new(),
            disappeared: Vec::new(),
            summary: "Screen did NOT change after the last action.".to_string(),
        };
    }

    let appeared = missing_from(&curr.labels, &prev.labels);
    let disappeared = missing_from(&prev.labels, &curr.labels);

    let summary = if appeared.is_empty() && disappeared.is_empty() {
        "Screen changed (layout or state only, no new text).".to_string()
    } else {
        let mut parts = vec!["Screen changed.".to_string()];
        if !appeared.is_empty() {
            parts.push(format!("New: {}.", appeared.join(", ")));
        }
        if !disappeared.is_empty() {
            parts.push(format!("Gone: {}.", disappeared.join(", ")));
        }
        parts.join(" ")
    };

    ScreenDiff {
        changed,
        appeared,
        disappeared,
        summary,
    }
}
