//! Deterministic device skills.

mod dispatcher;
mod link;

pub use dispatcher::{
    SkillCall, SkillConfig, SkillDispatcher, SkillResult, DEFAULT_SCREEN_SIZE, MAX_LISTED_LABELS,
};
pub use link::{DeviceLink, LedgerDevice};
