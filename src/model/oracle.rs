//! The decision oracle seam.

use async_trait::async_trait;
use serde_json::Value;

use super::client::{ModelError, ModelResponse};

/// One request/response call to whatever chooses the next action.
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    /// Ask for the next action given an OpenAI-style message list.
    async fn query(&self, messages: &[Value]) -> Result<ModelResponse, ModelError>;
}
