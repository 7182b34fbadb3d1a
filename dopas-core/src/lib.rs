//! dopas-core — doctor-patient simulator agent core.
//!
//! A student doctor converses with an AI-driven virtual patient. The core
//! of the system is the agent orchestration layer: prompt assembly, tool
//! schemas, history reconstruction, model dispatch, response
//! classification, and transactional turn persistence. The transport and
//! presentation layers live in `dopas-server` and `dopas-cli`.

pub mod agent;
pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod history;
pub mod model;
pub mod models;
pub mod prompt;
pub mod store;
pub mod tools;

pub use agent::{HistorySource, Orchestrator, RetryPolicy, SessionReply, SoftFailure, TurnSink};
pub use classify::{classify, PatientResponse, ResponseData, ResponseKind};
pub use config::DopasConfig;
pub use error::DopasError;
pub use history::{to_chat_messages, HistoryError};
pub use model::{ChatMessage, ChatModel, ModelError, ModelReply, OpenAiChatClient};
pub use prompt::{AgentPrompt, PatientProfile};
pub use store::PgTurnStore;
pub use tools::{tool_specs, ToolArgs, ToolError, ToolSpec};
