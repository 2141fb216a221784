//! Socket authentication.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::Message;
use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Default deadline for the first `auth` frame.
pub const DEFAULT_AUTH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    #[error("Invalid API key")]
    InvalidKey,
    #[error("No auth message within {0}s")]
    Timeout(u64),
    #[error("Connection closed before authenticating")]
    Closed,
    #[error("Expected an auth message first")]
    NotAuth,
    #[error("Invalid auth message: {0}")]
    Malformed(String),
}

/// Maps an API key to the account that owns it.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, api_key: &str) -> Result<String, AuthError>;
}

/// Fixed key -> account table.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyAuthenticator {
    keys: HashMap<String, String>,
}

impl StaticKeyAuthenticator {
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self { keys }
    }

    pub fn with_key(mut self, api_key: impl Into<String>, account_id: impl Into<String>) -> Self {
        self.keys.insert(api_key.into(), account_id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticKeyAuthenticator {
    async fn authenticate(&self, api_key: &str) -> Result<String, AuthError> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(AuthError::InvalidKey);
        }
        self.keys.get(api_key).cloned().ok_or(AuthError::InvalidKey)
    }
}

/// Read the first data frame of a socket and decode it.
///
/// Control frames are skipped. Anything else that arrives first, or nothing
/// arriving within `timeout`, is an error.
pub async fn first_message<T, S, E>(stream: &mut S, timeout: Duration) -> Result<T, AuthError>
where
    T: DeserializeOwned,
    S: Stream<Item = Result<Message, E>> + Unpin,
{
    let read = async {
        while let Some(frame) = stream.next().await {
            let text = match frame {
                Ok(Message::Text(text)) => text,
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => text,
                    Err(e) => return Err(AuthError::Malformed(e.to_string())),
                },
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                Ok(Message::Close(_)) | Err(_) => return Err(AuthError::Closed),
            };
            return serde_json::from_str(&text).map_err(|e| AuthError::Malformed(e.to_string()));
        }
        Err(AuthError::Closed)
    };
    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| AuthError::Timeout(timeout.as_secs()))?
}
