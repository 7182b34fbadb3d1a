//! dopas-cli — console frontend for the doctor-patient simulator
//!
//! Talks to the dopas-server HTTP API. The doctor types messages, the
//! virtual patient answers; `/tests` and `/report` request the prepared
//! test results and the medical report for the running case.
//!
//! # Subcommands
//! - `send <message> [--session <id>] [--json]` — one message, one reply
//! - `exam [--session <id>]`                    — interactive examination
//! - `status`                                   — show server health

use std::io::{BufRead, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:8750";
const DEFAULT_RETRIES: usize = 2;
const RETRY_BASE_DELAY_MS: u64 = 1000;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "dopas-cli",
    version,
    about = "Doctor-patient simulator — console client"
)]
struct Cli {
    /// Dopas HTTP server URL (overrides DOPAS_HTTP_URL env var)
    #[arg(long, env = "DOPAS_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Re-attempts after a failed send
    #[arg(long, default_value_t = DEFAULT_RETRIES)]
    retries: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Send a single doctor message and print the patient's reply
    Send {
        /// Message text ("/tests" and "/report" are recognised)
        message: String,

        /// Session key; a fresh one is generated when absent
        #[arg(long)]
        session: Option<String>,

        /// Print the raw response JSON instead of formatted text
        #[arg(long)]
        json: bool,
    },

    /// Interactive examination: a read-eval loop against one session
    Exam {
        /// Session key; a fresh one is generated when absent
        #[arg(long)]
        session: Option<String>,
    },

    /// Show Dopas server status
    Status,
}

// ============================================================================
// API Response Types
// ============================================================================

/// A classified patient reply from POST /message
#[derive(Debug, Deserialize)]
pub struct PatientReply {
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    #[serde(default)]
    pub data: Option<ReplyData>,
    pub session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReplyData {
    #[serde(default)]
    pub results: Option<Vec<TestResultEntry>>,
    #[serde(default)]
    pub report: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TestResultEntry {
    pub result: String,
    pub description: String,
}

// ============================================================================
// Rendering
// ============================================================================

/// Format a classified reply for the console. Test results and reports get
/// their payload expanded under the headline; plain text prints as-is.
pub fn render_reply(reply: &PatientReply) -> String {
    let mut out = String::new();

    match reply.kind.as_str() {
        "test_results" => {
            out.push_str(&reply.content);
            if let Some(results) = reply.data.as_ref().and_then(|d| d.results.as_ref()) {
                for entry in results {
                    out.push_str(&format!("\n  {}: {}", entry.result, entry.description));
                }
            }
        }
        "report" => {
            out.push_str(&reply.content);
            if let Some(report) = reply.data.as_ref().and_then(|d| d.report.as_ref()) {
                out.push_str("\n\n");
                out.push_str(report);
            }
        }
        _ => out.push_str(&reply.content),
    }

    out
}

/// Client-side session keys: `session_<millis>_<random>`, matching the
/// shape the server mints when the client sends none.
pub fn new_session_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("session_{}_{}", millis, &random[..9])
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

/// Send one message, retrying with a linear backoff on transport errors.
/// Re-attempt N waits N * RETRY_BASE_DELAY_MS before firing.
fn send_message(
    server: &str,
    message: &str,
    session_id: &str,
    retries: usize,
) -> anyhow::Result<PatientReply> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?;

    let url = format!("{}/message", server);
    let body = serde_json::json!({
        "message": message,
        "session_id": session_id,
    });

    let mut last_error = None;
    for attempt in 0..=retries {
        if attempt > 0 {
            std::thread::sleep(Duration::from_millis(RETRY_BASE_DELAY_MS * attempt as u64));
        }

        match client.post(&url).json(&body).send() {
            Ok(resp) if resp.status().is_success() => {
                return resp.json::<PatientReply>().map_err(Into::into);
            }
            Ok(resp) => {
                let status = resp.status();
                let text = resp.text().unwrap_or_default();
                let detail = serde_json::from_str::<serde_json::Value>(&text)
                    .ok()
                    .and_then(|v| v["error"].as_str().map(str::to_string))
                    .unwrap_or(text);
                last_error = Some(anyhow::anyhow!("server returned {}: {}", status, detail));
            }
            Err(e) => {
                last_error = Some(anyhow::anyhow!("connection failed to {}: {}", url, e));
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("send failed")))
}

fn do_send(
    server: &str,
    message: &str,
    session: Option<String>,
    json_output: bool,
    retries: usize,
) -> anyhow::Result<()> {
    let session_id = session.unwrap_or_else(new_session_id);
    let reply = send_message(server, message, &session_id, retries)?;

    if json_output {
        println!(
            "{}",
            serde_json::json!({
                "type": reply.kind,
                "content": reply.content,
                "session_id": reply.session_id.as_deref().unwrap_or(&session_id),
            })
        );
    } else {
        println!("{}", render_reply(&reply));
        eprintln!("(session: {})", reply.session_id.as_deref().unwrap_or(&session_id));
    }

    Ok(())
}

/// Interactive loop: one session, doctor prompts on stdin until EOF or
/// "exit"/"quit".
fn do_exam(server: &str, session: Option<String>, retries: usize) -> anyhow::Result<()> {
    let session_id = session.unwrap_or_else(new_session_id);
    println!("Examination started (session: {})", session_id);
    println!("Type your questions; /tests and /report are available. \"exit\" to leave.\n");

    let stdin = std::io::stdin();
    let mut line = String::new();

    loop {
        print!("doctor> ");
        std::io::stdout().flush()?;

        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let message = line.trim();
        if message.is_empty() {
            continue;
        }
        if message == "exit" || message == "quit" {
            break;
        }

        match send_message(server, message, &session_id, retries) {
            Ok(reply) => println!("patient> {}\n", render_reply(&reply)),
            Err(e) => eprintln!("dopas-cli: {}\n", e),
        }
    }

    println!("Examination ended (session: {})", session_id);
    Ok(())
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;

    let url = format!("{}/health", server);
    let resp = client.get(&url).send();

    match resp {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!("Dopas server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:      {}", body["version"].as_str().unwrap_or("?"));
            println!("PostgreSQL:   {}", body["postgresql"].as_str().unwrap_or("?"));
        }
        Ok(r) => {
            let status = r.status();
            eprintln!("dopas-cli: server unhealthy (HTTP {})", status);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("dopas-cli: cannot reach {} — {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();

    let result = match cli.command {
        Commands::Send {
            message,
            session,
            json,
        } => do_send(&server, &message, session, json, cli.retries),
        Commands::Exam { session } => do_exam(&server, session, cli.retries),
        Commands::Status => do_status(&server),
    };

    if let Err(e) = result {
        eprintln!("dopas-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
