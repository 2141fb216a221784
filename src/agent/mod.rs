//! Agent sessions: the observe/decide/act loop and what surrounds it.

mod detector;
mod manager;
mod runner;
mod session;
mod store;

pub use detector::{
    drift_warning, repetition_warning, stuck_hint, ActionRecord, Detectors, StuckTracker,
    DEFAULT_STUCK_THRESHOLD, DRIFT_LIMIT, DRIFT_WINDOW, REPETITION_LIMIT, REPETITION_WINDOW,
};
pub use manager::SessionManager;
pub use runner::{AgentConfig, SessionOutcome, SessionRunner};
pub use session::{AgentSession, CancelFlag, SessionError, SessionStatus, Step, StepOutcome};
pub use store::{MemorySessionStore, SessionStore, StoreError};
