use flow_core::FlowError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HookError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error("Daemon unavailable: {0}")]
    DaemonUnavailable(String),

    /// The daemon answered with an error response.
    #[error("{code}: {message}")]
    Daemon { code: String, message: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl HookError {
    /// Process exit code: 2 for caller mistakes, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            HookError::InvalidInput(_) => 2,
            HookError::Flow(err) if err.kind().is_some() => 2,
            HookError::Daemon { code, .. }
                if matches!(
                    code.as_str(),
                    "bad_request" | "conflict" | "invalid_params" | "missing_field" | "not_found"
                ) =>
            {
                2
            }
            _ => 1,
        }
    }
}
