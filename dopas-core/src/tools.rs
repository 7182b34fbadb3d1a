//! The fixed tool table of the patient simulator.
//!
//! Tools exist to constrain and label the model's structured output, not to
//! perform side effects: every handler is a passthrough that echoes its
//! validated arguments. The echoed JSON becomes the tool result content
//! that is persisted and later classified.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const ANSWER_DOCTOR: &str = "answerDoctor";
pub const ASK_DOCTOR: &str = "askDoctor";
pub const PROVIDE_TEST_RESULTS: &str = "provideTestResults";
pub const PROVIDE_REPORT: &str = "provideReport";

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid arguments for '{tool}': {source}")]
    InvalidArgs {
        tool: String,
        source: serde_json::Error,
    },
}

/// Declarative description of one callable tool, in the shape the
/// chat-completions API expects (`parameters` is a JSON schema).
#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// The four tools the patient agent may call.
pub fn tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: ANSWER_DOCTOR.to_string(),
            description: "Answer a question asked by the doctor".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "answer": { "type": "string" }
                },
                "required": ["answer"]
            }),
        },
        ToolSpec {
            name: ASK_DOCTOR.to_string(),
            description: "Ask the doctor about your condition or diagnosis".to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "question": { "type": "string" }
                },
                "required": ["question"]
            }),
        },
        ToolSpec {
            name: PROVIDE_TEST_RESULTS.to_string(),
            description:
                "Provide laboratory test results. Use only when the doctor explicitly requests tests"
                    .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "results": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "result": { "type": "string" },
                                "description": { "type": "string" }
                            },
                            "required": ["result", "description"]
                        }
                    }
                },
                "required": ["results"]
            }),
        },
        ToolSpec {
            name: PROVIDE_REPORT.to_string(),
            description:
                "Switch to the examiner role and provide a structured evaluation of the doctor's performance"
                    .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "report": { "type": "string" }
                },
                "required": ["report"]
            }),
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub result: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerArgs {
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskArgs {
    pub question: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResultsArgs {
    pub results: Vec<TestResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportArgs {
    pub report: String,
}

/// Tagged union over the fixed tool set. The model's raw argument blobs are
/// validated into one of these variants at the parse boundary; nothing
/// downstream handles untyped JSON keyed by tool name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolArgs {
    AnswerDoctor(AnswerArgs),
    AskDoctor(AskArgs),
    ProvideTestResults(TestResultsArgs),
    ProvideReport(ReportArgs),
}

impl ToolArgs {
    /// Validate a raw argument object against the schema of the named tool.
    pub fn parse(name: &str, args: &Value) -> Result<Self, ToolError> {
        let invalid = |source| ToolError::InvalidArgs {
            tool: name.to_string(),
            source,
        };
        match name {
            ANSWER_DOCTOR => serde_json::from_value(args.clone())
                .map(ToolArgs::AnswerDoctor)
                .map_err(invalid),
            ASK_DOCTOR => serde_json::from_value(args.clone())
                .map(ToolArgs::AskDoctor)
                .map_err(invalid),
            PROVIDE_TEST_RESULTS => serde_json::from_value(args.clone())
                .map(ToolArgs::ProvideTestResults)
                .map_err(invalid),
            PROVIDE_REPORT => serde_json::from_value(args.clone())
                .map(ToolArgs::ProvideReport)
                .map_err(invalid),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    /// The tool's "effect": echo the validated arguments as structured data.
    pub fn handle(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }

    pub fn tool_name(&self) -> &'static str {
        match self {
            ToolArgs::AnswerDoctor(_) => ANSWER_DOCTOR,
            ToolArgs::AskDoctor(_) => ASK_DOCTOR,
            ToolArgs::ProvideTestResults(_) => PROVIDE_TEST_RESULTS,
            ToolArgs::ProvideReport(_) => PROVIDE_REPORT,
        }
    }
}
