//! Session commands. Each one is a single request to the daemon.

use flowd_protocol::{Method, SessionSignal, StartSessionParams};
use serde_json::{json, Value};
use std::time::Duration;

use crate::daemon_client::{self, SLOW_READ_TIMEOUT_MS};
use crate::error::HookError;

pub fn start(params: StartSessionParams) -> Result<Value, HookError> {
    let params = serde_json::to_value(params)?;
    daemon_client::call_with_timeout(
        Method::StartSession,
        Some(params),
        Duration::from_millis(SLOW_READ_TIMEOUT_MS),
    )
}

pub fn signal(session_id: &str, signal: SessionSignal) -> Result<Value, HookError> {
    signal.validate().map_err(|err| HookError::Daemon {
        code: err.code,
        message: err.message,
    })?;
    daemon_client::call(Method::SignalSession, Some(signal_params(session_id, &signal)?))
}

pub fn status(session_id: &str) -> Result<Value, HookError> {
    daemon_client::call(Method::GetSessionStatus, Some(query_params(session_id)))
}

pub fn result(session_id: &str) -> Result<Value, HookError> {
    daemon_client::call(Method::GetSessionResult, Some(query_params(session_id)))
}

fn signal_params(session_id: &str, signal: &SessionSignal) -> Result<Value, HookError> {
    Ok(json!({
        "session_id": session_id,
        "signal": serde_json::to_value(signal)?,
    }))
}

fn query_params(session_id: &str) -> Value {
    json!({ "session_id": session_id })
}
