//! Screen state: snapshots from the device and the digest used to detect change.

mod digest;
mod snapshot;

pub use digest::{diff, ScreenDiff, ScreenDigest, MAX_DIFF_LABELS};
pub use snapshot::{Rect, ScreenSnapshot, UiElement};
