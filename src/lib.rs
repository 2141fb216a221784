// Copyright 2025 Zhipu AI (Original Python implementation)
// Copyright 2025 ModerRAS (Rust implementation)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Phone Agent Hub
//!
//! Command-and-control hub for remote Android devices.
//!
//! Devices and dashboards connect over websockets. A goal sent by either side
//! starts a session: the hub repeatedly reads the device screen, asks a
//! decision oracle (an OpenAI-compatible chat model) for the next action, and
//! executes it on the device through a request/response ledger layered on
//! the socket.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use phone_agent_hub::agent::{MemorySessionStore, SessionManager, SessionRunner};
//! use phone_agent_hub::ledger::ConnectionLedger;
//! use phone_agent_hub::server::{self, AppState, ServerConfig, StaticKeyAuthenticator};
//! use phone_agent_hub::skills::SkillDispatcher;
//! use phone_agent_hub::{AgentConfig, ModelClient, ModelConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ledger = Arc::new(ConnectionLedger::default());
//!     let runner = SessionRunner::new(
//!         AgentConfig::default().with_max_steps(20),
//!         Arc::new(ModelClient::new(ModelConfig::default())),
//!         Arc::new(MemorySessionStore::new()),
//!         ledger.clone(),
//!         SkillDispatcher::default(),
//!     );
//!     let sessions = Arc::new(SessionManager::new(ledger.clone(), Arc::new(runner)));
//!     let auth = StaticKeyAuthenticator::default().with_key("secret", "my-account");
//!     let state = AppState::new(ledger, sessions, Arc::new(auth), ServerConfig::default());
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, server::router(state)).await?;
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod agent;
pub mod config;
pub mod ledger;
pub mod model;
pub mod protocol;
pub mod screen;
pub mod server;
pub mod settings;
pub mod skills;

pub use actions::{Action, ActionDecision, CoordinateSystem, RELATIVE_COORDINATE_MAX};
pub use agent::{AgentConfig, AgentSession, SessionManager, SessionRunner, SessionStatus};
pub use ledger::{ConnectionLedger, LedgerConfig, LedgerError};
pub use model::{DecisionOracle, ModelClient, ModelConfig, ModelResponse};
pub use screen::{ScreenDiff, ScreenDigest, ScreenSnapshot};
pub use server::{AppState, ServerConfig};
pub use settings::ServerSettings;
pub use skills::{SkillDispatcher, SkillResult};
