//! Agent orchestrator: drives one conversational turn end to end.
//!
//! For each doctor message the orchestrator loads the session history,
//! builds the full prompt, invokes the chat model, materializes the
//! passthrough tool results, classifies the output, and persists the turn
//! before returning the normalized response.
//!
//! Failure asymmetry (deliberate): read-side reconstruction inconsistencies
//! and model failures abort the call; a history *load* failure degrades to
//! an empty history, and a persist failure after a successful model call
//! still returns the computed response. Both soft paths are logged and
//! surfaced as `SoftFailure` values so callers and tests can observe them.
//!
//! Concurrency contract: calls for one session are expected to be issued
//! sequentially (the UI blocks input while a call is outstanding). The core
//! does not serialize concurrent calls for the same session; interleaved
//! persisted order under external concurrency is unspecified.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_retry::Retry;

use crate::classify::{classify, PatientResponse};
use crate::config::ModelConfig;
use crate::error::DopasError;
use crate::model::ChatModel;
use crate::models::{NewToolInvocation, NewToolResult, NewTurn, TurnRecord, TurnRow};
use crate::prompt::AgentPrompt;
use crate::tools::{tool_specs, ToolArgs, ToolSpec};
use crate::history;

// ============================================================================
// Ports
// ============================================================================

/// History-loading port. Implemented by `PgTurnStore` in production and by
/// in-memory doubles in tests.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn load_history(&self, session_key: &str) -> Result<Vec<TurnRecord>, DopasError>;
}

/// Persistence port for finished turns.
#[async_trait]
pub trait TurnSink: Send + Sync {
    async fn persist_turn(
        &self,
        turn: NewTurn,
        session_key: Option<&str>,
    ) -> Result<TurnRow, DopasError>;
}

// ============================================================================
// Reply types
// ============================================================================

/// A non-fatal fault that occurred while handling a turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SoftFailure {
    /// History could not be loaded; the turn proceeded context-free.
    HistoryLoad(String),
    /// The turn could not be saved; the response was still returned.
    Persist(String),
}

/// The orchestrator's output for one turn.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionReply {
    pub response: PatientResponse,
    pub soft_failures: Vec<SoftFailure>,
}

// ============================================================================
// Retry policy
// ============================================================================

/// Linear backoff around the whole send path: re-attempt N waits
/// N * base_delay_ms, up to max_retries re-attempts, last error surfaced.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 1000,
        }
    }
}

impl From<&ModelConfig> for RetryPolicy {
    fn from(config: &ModelConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.retry_delay_ms,
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

pub struct Orchestrator {
    history: Arc<dyn HistorySource>,
    sink: Arc<dyn TurnSink>,
    model: Arc<dyn ChatModel>,
    prompt: AgentPrompt,
    tools: Vec<ToolSpec>,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(
        history: Arc<dyn HistorySource>,
        sink: Arc<dyn TurnSink>,
        model: Arc<dyn ChatModel>,
        prompt: AgentPrompt,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            history,
            sink,
            model,
            prompt,
            tools: tool_specs(),
            retry,
        }
    }

    /// Handle one doctor message for a session.
    pub async fn handle(
        &self,
        user_message: &str,
        session_id: &str,
    ) -> Result<SessionReply, DopasError> {
        let mut soft_failures = Vec::new();

        // 1. Load history. A load failure is non-fatal: the conversation
        // proceeds context-free.
        let records = match self.history.load_history(session_id).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(
                    session = %session_id,
                    error = %e,
                    "History load failed, continuing with empty history"
                );
                soft_failures.push(SoftFailure::HistoryLoad(e.to_string()));
                Vec::new()
            }
        };

        // 2. Reconstruct the transcript (fatal on pairing inconsistencies)
        // and build the prompt.
        let history_messages = history::to_chat_messages(&records)?;
        let messages = self.prompt.build_messages(history_messages, user_message);

        // 3. Invoke the model.
        let reply = self.model.complete(&messages, &self.tools).await?;

        // 4. Validate the chosen tool calls and run the passthrough handlers.
        let mut invocations = Vec::with_capacity(reply.tool_calls.len());
        let mut results = Vec::with_capacity(reply.tool_calls.len());
        for call in &reply.tool_calls {
            let args = ToolArgs::parse(&call.name, &call.args)?;
            let echoed = args.handle();
            invocations.push(NewToolInvocation {
                name: call.name.clone(),
                args: call.args.clone(),
                tool_id: Some(call.id.clone()),
            });
            results.push(NewToolResult {
                tool_id: call.id.clone(),
                tool: call.name.clone(),
                content: serde_json::to_string(&echoed)
                    .unwrap_or_else(|_| "{}".to_string()),
            });
        }

        // 5. Classify from the first tool result's echoed payload, falling
        // back to the free-text answer.
        let payload: Value = match results.first() {
            Some(first) => serde_json::from_str(&first.content)
                .unwrap_or_else(|_| serde_json::json!({ "answer": reply.answer })),
            None => serde_json::json!({ "answer": reply.answer }),
        };
        let response = classify(&payload);

        // 6. Persist the turn. A failure here is non-fatal: the doctor still
        // sees the computed response.
        let turn = NewTurn {
            role: Some("assistant".to_string()),
            answer: Some(reply.answer.clone()),
            invocations,
            results,
        };
        if let Err(e) = self.sink.persist_turn(turn, Some(session_id)).await {
            tracing::error!(
                session = %session_id,
                error = %e,
                "Failed to persist turn"
            );
            soft_failures.push(SoftFailure::Persist(e.to_string()));
        }

        Ok(SessionReply {
            response,
            soft_failures,
        })
    }

    /// `handle` wrapped in the caller-level retry: up to `max_retries`
    /// re-attempts with linear backoff, surfacing the last error.
    pub async fn handle_with_retry(
        &self,
        user_message: &str,
        session_id: &str,
    ) -> Result<SessionReply, DopasError> {
        let base = self.retry.base_delay_ms;
        let strategy = (1u64..)
            .map(|attempt| Duration::from_millis(base * attempt))
            .take(self.retry.max_retries);

        Retry::spawn(strategy, || self.handle(user_message, session_id)).await
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{ResponseKind, FALLBACK_TEXT, REPORT_LABEL, TEST_RESULTS_LABEL};
    use crate::model::{ChatMessage, ModelError, ModelReply, ToolCallRequest};
    use crate::prompt::PatientProfile;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    // --- in-memory store implementing both ports ---

    #[derive(Default)]
    struct MemoryStore {
        sessions: Mutex<HashMap<String, Vec<TurnRecord>>>,
        next_id: AtomicUsize,
        fail_loads: bool,
        fail_persists: bool,
    }

    impl MemoryStore {
        fn turn_count(&self, session: &str) -> usize {
            self.sessions
                .lock()
                .unwrap()
                .get(session)
                .map(|t| t.len())
                .unwrap_or(0)
        }

        fn last_turn(&self, session: &str) -> Option<TurnRecord> {
            self.sessions
                .lock()
                .unwrap()
                .get(session)
                .and_then(|t| t.last().cloned())
        }
    }

    #[async_trait]
    impl HistorySource for MemoryStore {
        async fn load_history(&self, session_key: &str) -> Result<Vec<TurnRecord>, DopasError> {
            if self.fail_loads {
                return Err(DopasError::Other("history store offline".to_string()));
            }
            Ok(self
                .sessions
                .lock()
                .unwrap()
                .get(session_key)
                .cloned()
                .unwrap_or_default())
        }
    }

    #[async_trait]
    impl TurnSink for MemoryStore {
        async fn persist_turn(
            &self,
            turn: NewTurn,
            session_key: Option<&str>,
        ) -> Result<TurnRow, DopasError> {
            if self.fail_persists {
                return Err(DopasError::Other("persist store offline".to_string()));
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) as i32 + 1;
            let row = TurnRow {
                id,
                session_id: Some(1),
                role: turn.role.clone(),
                answer: turn.answer.clone(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            };
            let record = TurnRecord {
                turn: row.clone(),
                invocations: turn
                    .invocations
                    .iter()
                    .enumerate()
                    .map(|(i, inv)| crate::models::ToolInvocationRow {
                        id: i as i32 + 1,
                        model_output_id: id,
                        name: inv.name.clone(),
                        args: inv.args.clone(),
                        tool_id: inv.tool_id.clone(),
                        created_at: Utc::now(),
                    })
                    .collect(),
                results: turn
                    .results
                    .iter()
                    .enumerate()
                    .map(|(i, r)| crate::models::ToolResultRow {
                        id: i as i32 + 1,
                        model_output_id: id,
                        tool_id: r.tool_id.clone(),
                        tool: r.tool.clone(),
                        content: r.content.clone(),
                        created_at: Utc::now(),
                    })
                    .collect(),
            };
            if let Some(key) = session_key {
                self.sessions
                    .lock()
                    .unwrap()
                    .entry(key.to_string())
                    .or_default()
                    .push(record);
            }
            Ok(row)
        }
    }

    // --- scripted model ---

    struct ScriptedModel {
        replies: Mutex<Vec<Result<ModelReply, ModelError>>>,
        calls: AtomicUsize,
        seen_messages: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl ScriptedModel {
        /// Replies are consumed front to back, one per call.
        fn new(replies: Vec<Result<ModelReply, ModelError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                calls: AtomicUsize::new(0),
                seen_messages: Mutex::new(Vec::new()),
            }
        }

        fn tool_reply(name: &str, args: Value, id: &str) -> ModelReply {
            ModelReply {
                answer: String::new(),
                tool_calls: vec![ToolCallRequest {
                    name: name.to_string(),
                    args,
                    id: id.to_string(),
                }],
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedModel {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            _tools: &[ToolSpec],
        ) -> Result<ModelReply, ModelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_messages.lock().unwrap().push(messages.to_vec());
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(ModelError::Api {
                    code: 500,
                    message: "script exhausted".to_string(),
                });
            }
            replies.remove(0)
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn orchestrator(
        store: Arc<MemoryStore>,
        model: Arc<ScriptedModel>,
        retry: RetryPolicy,
    ) -> Orchestrator {
        Orchestrator::new(
            store.clone(),
            store,
            model,
            AgentPrompt::with_report(&PatientProfile::default()),
            retry,
        )
    }

    fn no_backoff(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 1,
        }
    }

    // --- scenarios ---

    #[tokio::test]
    async fn test_scenario_answer_doctor() {
        let store = Arc::new(MemoryStore::default());
        let model = Arc::new(ScriptedModel::new(vec![Ok(ScriptedModel::tool_reply(
            "answerDoctor",
            serde_json::json!({ "answer": "My stomach really hurts" }),
            "call_1",
        ))]));
        let agent = orchestrator(store.clone(), model, no_backoff(0));

        let reply = agent
            .handle("Hello, how are you feeling?", "session_a")
            .await
            .unwrap();

        assert_eq!(reply.response.kind, ResponseKind::Text);
        assert_eq!(reply.response.content, "My stomach really hurts");
        assert!(reply.soft_failures.is_empty());

        assert_eq!(store.turn_count("session_a"), 1);
        let turn = store.last_turn("session_a").unwrap();
        assert_eq!(turn.invocations.len(), 1);
        assert_eq!(turn.results.len(), 1);
        assert_eq!(turn.invocations[0].tool_id.as_deref(), Some("call_1"));
        assert_eq!(turn.results[0].tool_id, "call_1");
    }

    #[tokio::test]
    async fn test_scenario_test_results() {
        let store = Arc::new(MemoryStore::default());
        let model = Arc::new(ScriptedModel::new(vec![Ok(ScriptedModel::tool_reply(
            "provideTestResults",
            serde_json::json!({
                "results": [
                    { "result": "Lipase 890 U/L", "description": "Markedly elevated" },
                    { "result": "WBC 13.2", "description": "Mild leukocytosis" }
                ]
            }),
            "call_t",
        ))]));
        let agent = orchestrator(store, model, no_backoff(0));

        let reply = agent.handle("/tests", "session_b").await.unwrap();

        assert_eq!(reply.response.kind, ResponseKind::TestResults);
        assert_eq!(reply.response.content, TEST_RESULTS_LABEL);
        let data = reply.response.data.unwrap();
        assert_eq!(data.results.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_scenario_report() {
        let markdown = "## Examiner Report\n\n**History taking:** thorough.";
        let store = Arc::new(MemoryStore::default());
        let model = Arc::new(ScriptedModel::new(vec![Ok(ScriptedModel::tool_reply(
            "provideReport",
            serde_json::json!({ "report": markdown }),
            "call_r",
        ))]));
        let agent = orchestrator(store, model, no_backoff(0));

        let reply = agent.handle("/report", "session_c").await.unwrap();

        assert_eq!(reply.response.kind, ResponseKind::Report);
        assert_eq!(reply.response.content, REPORT_LABEL);
        assert_eq!(reply.response.data.unwrap().report.as_deref(), Some(markdown));
    }

    #[tokio::test]
    async fn test_no_tool_call_falls_back_to_answer() {
        let store = Arc::new(MemoryStore::default());
        let model = Arc::new(ScriptedModel::new(vec![Ok(ModelReply {
            answer: "Just text".to_string(),
            tool_calls: vec![],
        })]));
        let agent = orchestrator(store.clone(), model, no_backoff(0));

        let reply = agent.handle("hi", "s").await.unwrap();
        assert_eq!(reply.response.kind, ResponseKind::Text);
        assert_eq!(reply.response.content, "Just text");

        // Turn persisted even without tool calls.
        let turn = store.last_turn("s").unwrap();
        assert!(turn.invocations.is_empty());
        assert_eq!(turn.turn.answer.as_deref(), Some("Just text"));
    }

    #[tokio::test]
    async fn test_empty_model_output_uses_fallback_text() {
        let store = Arc::new(MemoryStore::default());
        let model = Arc::new(ScriptedModel::new(vec![Ok(ModelReply::default())]));
        let agent = orchestrator(store, model, no_backoff(0));

        let reply = agent.handle("hi", "s").await.unwrap();
        assert_eq!(reply.response.content, FALLBACK_TEXT);
    }

    #[tokio::test]
    async fn test_second_turn_sees_history() {
        let store = Arc::new(MemoryStore::default());
        let model = Arc::new(ScriptedModel::new(vec![
            Ok(ScriptedModel::tool_reply(
                "answerDoctor",
                serde_json::json!({ "answer": "it hurts" }),
                "call_1",
            )),
            Ok(ScriptedModel::tool_reply(
                "answerDoctor",
                serde_json::json!({ "answer": "since yesterday" }),
                "call_2",
            )),
        ]));
        let agent = orchestrator(store, model.clone(), no_backoff(0));

        agent.handle("What is wrong?", "s").await.unwrap();
        agent.handle("Since when?", "s").await.unwrap();

        let seen = model.seen_messages.lock().unwrap();
        // First call: 2 system + new message. Second call additionally carries
        // the first turn as assistant tool-call + tool-result messages.
        assert_eq!(seen[0].len(), 3);
        assert_eq!(seen[1].len(), 5);
        assert!(seen[1][2].tool_calls.is_some());
        assert_eq!(seen[1][3].role, "tool");
    }

    // --- failure asymmetry ---

    #[tokio::test]
    async fn test_history_load_failure_is_soft() {
        let store = Arc::new(MemoryStore {
            fail_loads: true,
            ..Default::default()
        });
        let model = Arc::new(ScriptedModel::new(vec![Ok(ScriptedModel::tool_reply(
            "answerDoctor",
            serde_json::json!({ "answer": "ok" }),
            "call_1",
        ))]));
        let agent = orchestrator(store, model, no_backoff(0));

        let reply = agent.handle("hi", "s").await.unwrap();
        assert_eq!(reply.response.content, "ok");
        assert!(matches!(
            reply.soft_failures.as_slice(),
            [SoftFailure::HistoryLoad(_)]
        ));
    }

    #[tokio::test]
    async fn test_persist_failure_is_soft() {
        let store = Arc::new(MemoryStore {
            fail_persists: true,
            ..Default::default()
        });
        let model = Arc::new(ScriptedModel::new(vec![Ok(ScriptedModel::tool_reply(
            "answerDoctor",
            serde_json::json!({ "answer": "still here" }),
            "call_1",
        ))]));
        let agent = orchestrator(store, model, no_backoff(0));

        let reply = agent.handle("hi", "s").await.unwrap();
        assert_eq!(reply.response.content, "still here");
        assert!(matches!(
            reply.soft_failures.as_slice(),
            [SoftFailure::Persist(_)]
        ));
    }

    #[tokio::test]
    async fn test_corrupted_history_is_fatal() {
        let store = Arc::new(MemoryStore::default());
        // Seed a turn whose invocation has no matching result.
        store.sessions.lock().unwrap().insert(
            "s".to_string(),
            vec![TurnRecord {
                turn: TurnRow {
                    id: 1,
                    session_id: Some(1),
                    role: Some("assistant".to_string()),
                    answer: None,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                },
                invocations: vec![crate::models::ToolInvocationRow {
                    id: 1,
                    model_output_id: 1,
                    name: "answerDoctor".to_string(),
                    args: serde_json::json!({}),
                    tool_id: Some("call_lost".to_string()),
                    created_at: Utc::now(),
                }],
                results: vec![],
            }],
        );
        let model = Arc::new(ScriptedModel::new(vec![Ok(ModelReply::default())]));
        let agent = orchestrator(store, model.clone(), no_backoff(0));

        let err = agent.handle("hi", "s").await.unwrap_err();
        assert!(matches!(err, DopasError::History(_)));
        // The model was never consulted.
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_from_model_is_fatal() {
        let store = Arc::new(MemoryStore::default());
        let model = Arc::new(ScriptedModel::new(vec![Ok(ScriptedModel::tool_reply(
            "orderSurgery",
            serde_json::json!({}),
            "call_x",
        ))]));
        let agent = orchestrator(store.clone(), model, no_backoff(0));

        let err = agent.handle("hi", "s").await.unwrap_err();
        assert!(matches!(err, DopasError::Tool(_)));
        assert_eq!(store.turn_count("s"), 0);
    }

    // --- retry wrapper ---

    #[tokio::test]
    async fn test_retry_succeeds_on_third_attempt() {
        let store = Arc::new(MemoryStore::default());
        let model = Arc::new(ScriptedModel::new(vec![
            Err(ModelError::Api {
                code: 503,
                message: "unavailable".to_string(),
            }),
            Err(ModelError::Api {
                code: 503,
                message: "unavailable".to_string(),
            }),
            Ok(ScriptedModel::tool_reply(
                "answerDoctor",
                serde_json::json!({ "answer": "third time lucky" }),
                "call_1",
            )),
        ]));
        let agent = orchestrator(store, model.clone(), no_backoff(2));

        let reply = agent.handle_with_retry("hi", "s").await.unwrap();
        assert_eq!(reply.response.content, "third time lucky");
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_surfaces_last_error_when_exhausted() {
        let store = Arc::new(MemoryStore::default());
        let model = Arc::new(ScriptedModel::new(vec![
            Err(ModelError::Api {
                code: 500,
                message: "first".to_string(),
            }),
            Err(ModelError::Api {
                code: 500,
                message: "second".to_string(),
            }),
            Err(ModelError::Api {
                code: 500,
                message: "last".to_string(),
            }),
        ]));
        let agent = orchestrator(store, model.clone(), no_backoff(2));

        let err = agent.handle_with_retry("hi", "s").await.unwrap_err();
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
        match err {
            DopasError::Model(ModelError::Api { message, .. }) => assert_eq!(message, "last"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
