//! Error types shared by the orchestrator, the remote API client and the cache policy.

use thiserror::Error;

use crate::model::{FileKind, TargetFormat};

/// Failures surfaced to the user. All of them render as plain strings.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolkitError {
    /// Non-2xx from the conversion service. `detail` comes from the response body.
    #[error("{detail}")]
    RemoteRequestFailed { status: u16, detail: String },

    /// Local file content could not be decoded as text for the edit fallback.
    #[error("Could not read file '{name}' as text")]
    UnreadableFile { name: String },

    /// 503 synthesized by the cache policy while the network is unreachable.
    #[error("{detail}")]
    OfflineSynthesized { detail: String },

    #[error("Network error: {0}")]
    Transport(String),

    #[error("Invalid response from conversion service: {0}")]
    InvalidResponse(String),

    #[error("Cannot convert {from} to {to}")]
    UnsupportedConversion { from: FileKind, to: TargetFormat },

    #[error("No file selected")]
    NoActiveFile,

    #[error("{0}")]
    InvalidInput(String),
}

impl ToolkitError {
    /// The message shown in the error banner.
    pub fn user_message(&self) -> String {
        self.to_string()
    }

    /// Whether the failure came back from the conversion service (or its offline stand-in)
    /// rather than from the local side.
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            Self::RemoteRequestFailed { .. } | Self::OfflineSynthesized { .. } | Self::Transport(_)
        )
    }
}

impl From<reqwest::Error> for ToolkitError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ToolkitError>;
