//! Error taxonomy shared by the executor and the HTTP layer.
//!
//! None of these are fatal: every variant ends up as a structured
//! result (`success: false` + message) returned to the caller.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The base executable of the command is not allow-listed.
    #[error("Command not in allowed list: '{command}'. Allowed: {preview}")]
    PolicyRejected { command: String, preview: String },

    /// The request body could not be decoded.
    #[error("{0}")]
    MalformedRequest(String),

    /// The OS refused to start the process.
    #[error("Failed to start command: {0}")]
    SpawnFailure(#[source] std::io::Error),

    #[error("Command timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Process {job_id} not found")]
    NotFound { job_id: u64 },

    /// Unexpected I/O failure while supervising a running job.
    #[error("Failed to wait for process: {0}")]
    Wait(#[source] std::io::Error),

    /// The task running a job panicked or was cancelled.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// HTTP status used when the error is returned at the request boundary.
    ///
    /// Only a malformed body is a client error; everything else is
    /// reported in a 200 response with `success: false`.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AgentError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::OK,
        }
    }
}

impl IntoResponse for AgentError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}
