//! JSON-lines protocol spoken by `runner serve`.
//!
//! Each stdin line is one [`Envelope`]. Each stdout line is a [`Response`],
//! a [`SandboxEvent`], or a [`ProcessExited`] notice for a process started
//! with `exec`.

use std::path::PathBuf;

use sandbox::{SandboxConfig, SandboxEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RunnerError;

#[derive(Debug, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Request {
    Create {
        sandbox: SandboxConfig,
    },
    Run {
        id: String,
        command: String,
    },
    Exec {
        id: String,
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    Test {
        id: String,
    },
    Promote {
        id: String,
        #[serde(default)]
        target: Option<PathBuf>,
    },
    Destroy {
        id: String,
    },
    Get {
        id: String,
    },
    List {
        #[serde(default)]
        user_id: Option<String>,
    },
    Stats,
}

/// A request plus an optional caller-chosen sequence number, echoed back
/// on the response.
#[derive(Debug, PartialEq, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(flatten)]
    pub request: Request,
}

/// Parse one request line. The sequence number is recovered even when the
/// request itself is malformed, so the error can be correlated.
pub fn parse(line: &str) -> (Option<u64>, Result<Request, RunnerError>) {
    match serde_json::from_str::<Envelope>(line) {
        Ok(envelope) => (envelope.seq, Ok(envelope.request)),
        Err(e) => {
            let seq = serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|v| v.get("seq").and_then(Value::as_u64));
            (seq, Err(RunnerError::Request(e.to_string())))
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn new(seq: Option<u64>, outcome: Result<Value, RunnerError>) -> Self {
        match outcome {
            Ok(result) => Self {
                seq,
                ok: true,
                result: Some(result),
                error: None,
            },
            Err(e) => Self {
                seq,
                ok: false,
                result: None,
                error: Some(ErrorBody {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                }),
            },
        }
    }
}

/// Completion notice for a process started with `exec`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessExited {
    pub event: &'static str,
    pub sandbox_id: String,
    pub pid: u32,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessExited {
    pub const EVENT: &'static str = "process:exited";
}

/// One line of output.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Output {
    Response(Response),
    Event(SandboxEvent),
    Exited(ProcessExited),
}
