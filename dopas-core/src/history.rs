//! History adapter: reconstructs the linear model-facing transcript from
//! persisted turn records.
//!
//! This is the one place where the relational shape (turn + invocation rows
//! + result rows) and the model's expected message sequence are reconciled.
//! A turn that called tools becomes one assistant tool-call message followed
//! by one tool-result message per invocation, paired by `tool_id` and in
//! invocation order. Pairing is strict: an invocation whose result cannot be
//! found indicates a corrupted or partially-persisted turn and aborts the
//! reconstruction instead of being dropped.

use thiserror::Error;

use crate::model::{ChatMessage, FunctionCallPayload, ToolCallPayload};
use crate::models::TurnRecord;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("tool invocation {tool_id:?} of '{name}' in turn {turn_id} has no matching tool result")]
    UnpairedInvocation {
        turn_id: i32,
        name: String,
        tool_id: Option<String>,
    },
}

/// Convert an ordered history of persisted turns into chat messages.
pub fn to_chat_messages(history: &[TurnRecord]) -> Result<Vec<ChatMessage>, HistoryError> {
    let mut messages = Vec::new();

    for record in history {
        if record.invocations.is_empty() {
            messages.push(ChatMessage::plain(
                record.turn.role.clone().unwrap_or_else(|| "assistant".to_string()),
                record.turn.answer.clone(),
            ));
            continue;
        }

        let mut tool_calls = Vec::with_capacity(record.invocations.len());
        for invocation in &record.invocations {
            // An invocation persisted without a tool_id can never satisfy the
            // pairing invariant, so it is rejected here as well.
            let tool_id = invocation.tool_id.clone().ok_or_else(|| {
                HistoryError::UnpairedInvocation {
                    turn_id: record.turn.id,
                    name: invocation.name.clone(),
                    tool_id: None,
                }
            })?;
            tool_calls.push(ToolCallPayload {
                id: tool_id,
                call_type: "function".to_string(),
                function: FunctionCallPayload {
                    name: invocation.name.clone(),
                    arguments: serde_json::to_string(&invocation.args)
                        .unwrap_or_else(|_| "{}".to_string()),
                },
            });
        }
        messages.push(ChatMessage::assistant_tool_calls(tool_calls));

        for invocation in &record.invocations {
            let tool_id = invocation.tool_id.as_deref().unwrap_or_default();
            let matching = record
                .results
                .iter()
                .find(|r| r.tool_id == tool_id)
                .ok_or_else(|| HistoryError::UnpairedInvocation {
                    turn_id: record.turn.id,
                    name: invocation.name.clone(),
                    tool_id: invocation.tool_id.clone(),
                })?;
            messages.push(ChatMessage::tool_result(tool_id, matching.content.clone()));
        }
    }

    Ok(messages)
}
