use std::path::PathBuf;

use serde::Serialize;

use crate::types::{LimitKind, SandboxSession};

/// Lifecycle notifications published by the manager.
///
/// Serialized with an `event` tag carrying the wire name
/// (`sandbox:created`, `sandbox:promoted`, ...).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum SandboxEvent {
    #[serde(rename = "sandbox:created")]
    Created { session: Box<SandboxSession> },

    #[serde(rename = "sandbox:promoted", rename_all = "camelCase")]
    Promoted { sandbox_id: String, new_path: PathBuf },

    #[serde(rename = "sandbox:destroyed", rename_all = "camelCase")]
    Destroyed { sandbox_id: String },

    #[serde(rename = "sandbox:limit-exceeded", rename_all = "camelCase")]
    LimitExceeded {
        sandbox_id: String,
        #[serde(rename = "type")]
        kind: LimitKind,
    },
}

impl SandboxEvent {
    pub fn sandbox_id(&self) -> &str {
        match self {
            Self::Created { session } => &session.id,
            Self::Promoted { sandbox_id, .. }
            | Self::Destroyed { sandbox_id }
            | Self::LimitExceeded { sandbox_id, .. } => sandbox_id,
        }
    }
}
