//! Client helper for talking to flowd.
//!
//! The daemon is the only writer. Transport failures and error responses are
//! surfaced to the caller; events are retried once because their id is
//! computed here, so a duplicate delivery is deduped by the router.

use flow_core::StorageConfig;
use flowd_protocol::{EventSignal, Method, Request, Response, MAX_REQUEST_BYTES};
use serde_json::Value;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::HookError;

const READ_TIMEOUT_MS: u64 = 2_000;
const WRITE_TIMEOUT_MS: u64 = 600;
/// Session starts wait on the terminal spawn, including its retries.
pub const SLOW_READ_TIMEOUT_MS: u64 = 120_000;
const RETRY_DELAY_MS: u64 = 50;

pub fn call(method: Method, params: Option<Value>) -> Result<Value, HookError> {
    call_with_timeout(method, params, Duration::from_millis(READ_TIMEOUT_MS))
}

pub fn call_with_timeout(
    method: Method,
    params: Option<Value>,
    read_timeout: Duration,
) -> Result<Value, HookError> {
    let request = Request::new(method, Some(request_id(method)), params);
    into_result(send_request(&request, read_timeout)?)
}

/// Sends one event, retrying once if the daemon could not be reached or the
/// router was briefly unavailable.
pub fn send_event(event: &EventSignal) -> Result<Value, HookError> {
    let params = serde_json::to_value(event)?;
    let request = Request::new(Method::Event, Some(event.event_id.clone()), Some(params));
    let timeout = Duration::from_millis(READ_TIMEOUT_MS);

    match send_request(&request, timeout).and_then(into_result) {
        Ok(data) => Ok(data),
        Err(err) if is_retryable(&err) => {
            tracing::warn!(error = %err, event_id = %event.event_id, "Failed to send event to daemon; retrying");
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            send_request(&request, timeout)
                .and_then(into_result)
                .map_err(|retry_err| {
                    tracing::warn!(
                        error = %retry_err,
                        event_id = %event.event_id,
                        "Retry failed sending event to daemon"
                    );
                    retry_err
                })
        }
        Err(err) => Err(err),
    }
}

fn is_retryable(err: &HookError) -> bool {
    match err {
        HookError::DaemonUnavailable(_) => true,
        HookError::Daemon { code, .. } => code == "router_unavailable",
        _ => false,
    }
}

fn into_result(response: Response) -> Result<Value, HookError> {
    if response.ok {
        return Ok(response.data.unwrap_or(Value::Null));
    }
    Err(match response.error {
        Some(err) => HookError::Daemon {
            code: err.code,
            message: err.message,
        },
        None => HookError::Daemon {
            code: "unknown".to_string(),
            message: "Unknown daemon error".to_string(),
        },
    })
}

fn socket_path() -> PathBuf {
    StorageConfig::default().resolve_socket_path()
}

fn request_id(method: Method) -> String {
    format!(
        "flow-hook-{}-{}",
        std::process::id(),
        serde_json::to_value(method)
            .ok()
            .and_then(|value| value.as_str().map(str::to_string))
            .unwrap_or_default()
    )
}

fn send_request(request: &Request, read_timeout: Duration) -> Result<Response, HookError> {
    let socket = socket_path();
    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        HookError::DaemonUnavailable(format!(
            "Failed to connect to daemon socket {}: {}",
            socket.display(),
            err
        ))
    })?;
    let _ = stream.set_read_timeout(Some(read_timeout));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, request)
        .map_err(|err| HookError::DaemonUnavailable(format!("Failed to write request: {}", err)))?;
    stream
        .write_all(b"\n")
        .map_err(|err| HookError::DaemonUnavailable(format!("Failed to flush request: {}", err)))?;
    stream.flush().ok();

    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, HookError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES * 8 {
                    return Err(HookError::DaemonUnavailable(
                        "Response exceeded maximum size".to_string(),
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(HookError::DaemonUnavailable(
                    "Timed out waiting for daemon response".to_string(),
                ));
            }
            Err(err) => {
                return Err(HookError::DaemonUnavailable(format!(
                    "Failed to read response: {}",
                    err
                )))
            }
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err(HookError::DaemonUnavailable(
            "Daemon response was empty".to_string(),
        ));
    }

    Ok(serde_json::from_slice(response_bytes)?)
}
