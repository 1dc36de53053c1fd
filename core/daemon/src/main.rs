//! flowd entrypoint.
//!
//! A single-writer service that owns the flow configuration, the router and
//! every session process. Clients talk to it over a Unix socket, one
//! line-delimited JSON request per connection.

use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use flow_core::{Config, FlowBundle, StorageConfig};
use flowd_protocol::{
    parse_event_signal, parse_session_query, parse_session_signal, parse_start_session,
    ErrorInfo, Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde::Serialize;
use serde_json::Value;

mod dispatch;
mod host;
mod journal;
mod replay;
mod retry;
mod router;
mod session;
mod sessions;
mod settings;
mod state;

use host::LoggingHost;
use state::SharedState;

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

fn main() {
    init_logging();

    let storage = StorageConfig::default();
    if let Err(err) = storage.ensure_dirs() {
        error!(error = %err, root = %storage.root().display(), "Failed to create storage directories");
        std::process::exit(1);
    }

    let socket_path = storage.resolve_socket_path();
    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let settings = settings::load_settings(&storage.settings_file());
    let shared_state = match SharedState::new(storage, settings, Arc::new(LoggingHost)) {
        Ok(state) => Arc::new(state),
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon state");
            std::process::exit(1);
        }
    };

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(path = %socket_path.display(), "flowd started");
    spawn_maintenance(Arc::clone(&shared_state));

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&shared_state);
                thread::spawn(|| handle_connection(stream, state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn spawn_maintenance(state: Arc<SharedState>) {
    let interval = Duration::from_secs(state.settings().maintenance.interval_secs.max(1));
    thread::spawn(move || loop {
        thread::sleep(interval);
        if let Err(err) = state.prune_closed() {
            warn!(error = %err, "Periodic journal pruning failed");
        }
    });
}

fn init_logging() {
    let debug_enabled = env::var("FLOWD_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: Arc<SharedState>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, &state);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
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
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => {
            if buffer[index + 1..].iter().any(|b| !b.is_ascii_whitespace()) {
                warn!("Extra bytes detected after newline; ignoring trailing data");
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, state: &SharedState) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let id = request.id;
    let params = request.params;
    let result = match request.method {
        Method::GetHealth => {
            let mut data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
            });
            if let (Some(data), Value::Object(health)) = (data.as_object_mut(), state.health()) {
                data.extend(health);
            }
            Ok(data)
        }
        Method::Event => require_params(params, "event payload is required")
            .and_then(parse_event_signal)
            .and_then(|event| {
                debug!(
                    event_type = event.fields.get("type").map(String::as_str).unwrap_or(""),
                    session_id = ?event.fields.get("session.id"),
                    "Received event"
                );
                state.ingest_event(event)
            })
            .map(|event_id| serde_json::json!({ "accepted": true, "event_id": event_id })),
        Method::ReplaceConfig => require_params(params, "config is required")
            .and_then(|params| parse_params::<Config>(params, "config"))
            .and_then(|config| state.replace_config(config))
            .map(|written| {
                serde_json::json!({
                    "replaced": true,
                    "files": written
                        .iter()
                        .map(|path| path.display().to_string())
                        .collect::<Vec<_>>(),
                })
            }),
        Method::GetConfig => to_value(&state.config_snapshot(), "config"),
        Method::ExportBundle => to_value(&state.export_bundle(), "bundle"),
        Method::ImportBundle => require_params(params, "bundle is required")
            .and_then(|params| parse_params::<FlowBundle>(params, "bundle"))
            .and_then(|bundle| state.import_bundle(bundle))
            .map(|config| serde_json::json!({ "imported": config.triggers.len() })),
        Method::GetActivityCatalog => to_value(state.catalog(), "activity catalog"),
        Method::StartSession => require_params(params, "session params are required")
            .and_then(parse_start_session)
            .and_then(|params| state.sessions().start(params))
            .and_then(|session| to_value(&session, "session state")),
        Method::SignalSession => require_params(params, "signal params are required")
            .and_then(parse_session_signal)
            .and_then(|params| state.sessions().signal(&params.session_id, params.signal))
            .map(|seq| serde_json::json!({ "accepted": true, "seq": seq })),
        Method::GetSessionStatus => require_params(params, "session_id is required")
            .and_then(parse_session_query)
            .and_then(|query| state.sessions().status(&query.session_id))
            .and_then(|session| to_value(&session, "session state")),
        Method::GetSessionResult => require_params(params, "session_id is required")
            .and_then(parse_session_query)
            .and_then(|query| state.sessions().result(&query.session_id))
            .and_then(|result| to_value(&result, "session result")),
    };

    match result {
        Ok(data) => Response::ok(id, data),
        Err(err) => {
            debug!(code = %err.code, message = %err.message, "Request failed");
            Response::error_with_info(id, err)
        }
    }
}

fn require_params(params: Option<Value>, message: &str) -> Result<Value, ErrorInfo> {
    params.ok_or_else(|| ErrorInfo::new("invalid_params", message))
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Value, what: &str) -> Result<T, ErrorInfo> {
    serde_json::from_value(params)
        .map_err(|err| ErrorInfo::new("invalid_params", format!("{} is invalid: {}", what, err)))
}

fn to_value<T: Serialize>(value: &T, what: &str) -> Result<Value, ErrorInfo> {
    serde_json::to_value(value).map_err(|err| {
        ErrorInfo::new(
            "serialization_error",
            format!("Failed to serialize {}: {}", what, err),
        )
    })
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
