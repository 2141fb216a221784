//! Oracle action decisions and their mapping onto device commands.

mod decision;
mod handler;

pub use decision::{
    extract_json_object, parse_decision, Action, ActionDecision, ActionError, ActionFamily,
    ScrollDirection,
};
pub use handler::{
    ActionHandler, ActionResult, CoordinateSystem, Dispatch, PlannedAction, DEFAULT_LONG_PRESS_MS,
    DEFAULT_SWIPE_MS, MAX_WAIT_SECS, RELATIVE_COORDINATE_MAX,
};
