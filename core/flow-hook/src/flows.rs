//! Flow bundle commands: export, import and offline validation.

use flow_core::{import_bundle, parse_bundle, ActivityCatalog, FlowBundle};
use flowd_protocol::Method;
use serde_json::{json, Value};
use std::path::Path;

use crate::daemon_client;
use crate::error::HookError;

/// Fetches the daemon's bundle. With `out`, writes it atomically and returns
/// a short summary instead.
pub fn export(out: Option<&Path>) -> Result<Value, HookError> {
    let bundle = daemon_client::call(Method::ExportBundle, None)?;
    let Some(out) = out else {
        return Ok(bundle);
    };

    let mut content = serde_json::to_vec_pretty(&bundle)?;
    content.push(b'\n');
    flow_core::atomic_write(out, &content)?;
    let flows = bundle["flows"].as_array().map(Vec::len).unwrap_or(0);
    tracing::info!(path = %out.display(), flows, "Exported flow bundle");
    Ok(json!({ "written": out.display().to_string(), "flows": flows }))
}

/// Validates locally first so a bad file never reaches the daemon.
pub fn import(path: &Path) -> Result<Value, HookError> {
    let bundle = read_bundle(path)?;
    import_bundle(bundle.clone(), &ActivityCatalog::builtin())?;
    let params = serde_json::to_value(&bundle)?;
    daemon_client::call(Method::ImportBundle, Some(params))
}

/// Parses and validates a bundle against the built-in catalog. No daemon.
pub fn validate(path: &Path) -> Result<Value, HookError> {
    let bundle = read_bundle(path)?;
    let config = import_bundle(bundle, &ActivityCatalog::builtin())?;
    let bindings: usize = config
        .bindings_by_trigger_id
        .values()
        .map(Vec::len)
        .sum();
    Ok(json!({
        "valid": true,
        "triggers": config.triggers.len(),
        "bindings": bindings,
    }))
}

fn read_bundle(path: &Path) -> Result<FlowBundle, HookError> {
    let content = fs_err::read_to_string(path)?;
    Ok(parse_bundle(&content, path)?)
}
