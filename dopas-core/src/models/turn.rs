//! Row types for one model invocation's persisted output (a "turn") and
//! its tool data. A turn owns zero or more tool invocations (the calls the
//! model chose to make) and zero or more tool results (their materialized
//! outputs, paired by `tool_id`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of `model_outputs`.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TurnRow {
    pub id: i32,
    /// Internal session identity; a turn may exist without a session.
    pub session_id: Option<i32>,
    pub role: Option<String>,
    pub answer: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of `tool_responses`: a tool the model called while producing
/// the owning turn.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ToolInvocationRow {
    pub id: i32,
    pub model_output_id: i32,
    pub name: String,
    pub args: serde_json::Value,
    /// Provider-assigned call identifier; required to pair with a result.
    pub tool_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One row of `tool_call_results`: the materialized output of one
/// invocation, matched by `tool_id` within the same turn.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ToolResultRow {
    pub id: i32,
    pub model_output_id: i32,
    pub tool_id: String,
    pub tool: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A turn enriched with its tool data — the load unit of the repository
/// and the input unit of the history adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub turn: TurnRow,
    pub invocations: Vec<ToolInvocationRow>,
    pub results: Vec<ToolResultRow>,
}

/// The persist unit: everything inserted atomically for one model call.
#[derive(Debug, Clone, Default)]
pub struct NewTurn {
    pub role: Option<String>,
    pub answer: Option<String>,
    pub invocations: Vec<NewToolInvocation>,
    pub results: Vec<NewToolResult>,
}

#[derive(Debug, Clone)]
pub struct NewToolInvocation {
    pub name: String,
    pub args: serde_json::Value,
    pub tool_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewToolResult {
    pub tool_id: String,
    pub tool: String,
    pub content: String,
}
