//! Wire types shared by the queuer and its two peers.
//!
//! The runner protocol is command/reply over one connection, one exchange at
//! a time: the queuer sends a [`RunnerCommand`], the runner answers with a
//! [`RunnerReply`]. The website protocol carries an `id` on every envelope so
//! replies can be correlated while submissions are in flight.
//!
//! Everything here is plain serde data — no sockets, no channels.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Runner protocol ───────────────────────────────────────────────────────

/// Commands the queuer issues to a runner agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum RunnerCommand {
    /// Health probe; the runner answers `status: ok` if it is able to judge.
    Check,
    /// Asks the runner for its OS-level machine name.
    Info,
    /// Starts evaluation of one judge request.
    Start(StartArgs),
}

/// Payload of a START command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartArgs {
    /// Opaque settings forwarded verbatim from the website.
    pub evaluation_settings: Value,
    /// Benchmark instance id → download URL.
    #[serde(default)]
    pub benchmark_instances: HashMap<String, String>,
    pub submission_url: String,
    pub validator_url: String,
}

/// A runner's answer to any command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunnerReply {
    Ok(OkReply),
    Error { cause: String },
}

/// Payload of an `ok` reply. Which fields are present depends on the command:
/// INFO fills `machine_name`, START fills `results`, CHECK fills neither.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OkReply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
}

impl RunnerReply {
    pub fn ok() -> Self {
        RunnerReply::Ok(OkReply::default())
    }

    pub fn machine_name(name: impl Into<String>) -> Self {
        RunnerReply::Ok(OkReply {
            machine_name: Some(name.into()),
            results: None,
        })
    }

    pub fn results(results: Value) -> Self {
        RunnerReply::Ok(OkReply {
            machine_name: None,
            results: Some(results),
        })
    }

    pub fn error(cause: impl Into<String>) -> Self {
        RunnerReply::Error {
            cause: cause.into(),
        }
    }
}

// ─── Website protocol ──────────────────────────────────────────────────────

/// Envelope for commands arriving from the website.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebsiteEnvelope {
    /// Correlation id, echoed back on the reply.
    pub id: u64,
    #[serde(flatten)]
    pub command: WebsiteCommand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum WebsiteCommand {
    Start(WebsiteStartArgs),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebsiteStartArgs {
    pub evaluation_settings: EvaluationSettings,
    #[serde(default)]
    pub benchmark_instances: HashMap<String, String>,
    pub submission_url: String,
    pub validator_url: String,
}

/// The fields of `evaluation_settings` the queuer itself consumes. Anything
/// else is kept in `extra` and forwarded to the runner untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSettings {
    pub machine_type: String,
    pub cpu: u32,
    pub memory: u32,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Envelope for replies sent back to the website.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebsiteReplyEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub reply: WebsiteReply,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebsiteReply {
    Ok { result: Value },
    Error { cause: String },
}
