//! Decision oracle: HTTP client, conversation building and the oracle trait.

mod client;
mod messages;
mod oracle;

pub use client::{
    parse_response, ModelClient, ModelConfig, ModelError, ModelResponse, DEFAULT_MAX_RETRIES,
    DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_RETRY_DELAY_SECS,
};
pub use messages::{MessageBuilder, Observation, MAX_LISTED_ELEMENTS};
pub use oracle::DecisionOracle;
