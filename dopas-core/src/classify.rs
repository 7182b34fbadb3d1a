//! Response classifier: decides how a turn should be rendered.
//!
//! Inspects the structured payload echoed by the turn's first tool call (or
//! the raw answer when no tool was called) and classifies the turn as free
//! text, a lab-results payload, or an evaluation report. Rule order is a
//! fixed priority: `results` beats `report` beats text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::TestResult;

pub const TEST_RESULTS_LABEL: &str = "Test Results Available";
pub const REPORT_LABEL: &str = "Medical Report";
pub const FALLBACK_TEXT: &str = "Failed to load response..., try again";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Text,
    TestResults,
    Report,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ResponseData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<TestResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
}

/// The normalized turn handed back to the transport and rendered by the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatientResponse {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

/// Classify the structured payload of one turn.
pub fn classify(payload: &Value) -> PatientResponse {
    if let Some(results) = payload.get("results").and_then(Value::as_array) {
        let results: Vec<TestResult> =
            serde_json::from_value(Value::Array(results.clone())).unwrap_or_default();
        return PatientResponse {
            kind: ResponseKind::TestResults,
            content: TEST_RESULTS_LABEL.to_string(),
            data: Some(ResponseData {
                results: Some(results),
                report: None,
            }),
        };
    }

    if let Some(report) = payload.get("report").and_then(Value::as_str) {
        return PatientResponse {
            kind: ResponseKind::Report,
            content: REPORT_LABEL.to_string(),
            data: Some(ResponseData {
                results: None,
                report: Some(report.to_string()),
            }),
        };
    }

    let content = payload
        .get("answer")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .or_else(|| payload.get("question").and_then(Value::as_str))
        .unwrap_or(FALLBACK_TEXT);

    PatientResponse {
        kind: ResponseKind::Text,
        content: content.to_string(),
        data: None,
    }
}
