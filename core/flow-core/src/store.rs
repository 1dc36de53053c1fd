//! Durable flow storage: one JSON file per trigger.
//!
//! ## File layout
//!
//! ```text
//! <flows_dir>/
//! ├── deploy-finished.flow.json   ← managed (derived from trigger id)
//! ├── coder-turn.flow.json        ← managed
//! └── notes.txt                   ← unmanaged, never touched
//! ```
//!
//! - Writes are atomic per file (temp file, fsync, rename).
//! - Saving validates everything, including filename collisions, before the
//!   first write.
//! - Saving removes managed files whose trigger is gone; unmanaged files stay.
//! - Loading fails as a whole if any managed file is malformed or the result
//!   does not validate. Nothing is deleted on failure.

use crate::catalog::ActivityCatalog;
use crate::error::{FlowError, Result, ValidationError};
use crate::flow::{ActivityBinding, Config, EventTrigger};
use crate::validate::validate_config;
use fs_err as fs;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const FLOW_FILE_SUFFIX: &str = ".flow.json";

/// Persisted shape of one trigger and its bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowFile {
    pub id: String,
    #[serde(default)]
    pub label: String,
    pub event_type: String,
    #[serde(default, rename = "where")]
    pub where_clause: BTreeMap<String, String>,
    #[serde(default)]
    pub bindings: Vec<FlowBindingFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowBindingFile {
    pub activity_id: String,
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// Bulk import/export shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowBundle {
    pub version: u32,
    #[serde(default)]
    pub flows: Vec<FlowFile>,
}

#[derive(Debug, Clone)]
pub struct FlowStore {
    dir: PathBuf,
}

impl FlowStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Loads every managed file in the directory. A missing directory is an
    /// empty config.
    pub fn load(&self, catalog: &ActivityCatalog) -> Result<Config> {
        let mut flows = Vec::new();
        for path in self.managed_files()? {
            let content = fs::read_to_string(&path)
                .map_err(|e| FlowError::io(format!("reading {}", path.display()), e))?;
            let flow: FlowFile =
                serde_json::from_str(&content).map_err(|e| FlowError::InvalidConfig {
                    path: path.clone(),
                    line: Some(e.line()),
                    column: Some(e.column()),
                    message: e.to_string(),
                })?;
            flows.push(flow);
        }

        let config = config_from_flows(crate::flow::FLOW_CONFIG_VERSION, flows);
        validate_config(&config, catalog).map_err(|err| FlowError::InvalidConfig {
            path: self.dir.clone(),
            line: None,
            column: None,
            message: err.to_string(),
        })?;
        Ok(config)
    }

    /// Like [`FlowStore::load`], but an invalid store yields the default
    /// config. The files are left in place for inspection.
    pub fn load_or_default(&self, catalog: &ActivityCatalog) -> Config {
        match self.load(catalog) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    dir = %self.dir.display(),
                    "Flow store is invalid; starting with an empty config"
                );
                Config::default()
            }
        }
    }

    /// Validates and writes `config`, then removes stale managed files.
    /// Returns the paths written.
    pub fn save(&self, config: &Config, catalog: &ActivityCatalog) -> Result<Vec<PathBuf>> {
        validate_config(config, catalog)?;
        let planned = plan_flow_files(config)?;

        fs::create_dir_all(&self.dir)
            .map_err(|e| FlowError::io(format!("creating {}", self.dir.display()), e))?;

        let mut written = Vec::new();
        let mut keep = HashSet::new();
        for (file_name, flow) in &planned {
            let path = self.dir.join(file_name);
            let body = serde_json::to_vec_pretty(flow).map_err(|e| FlowError::Json {
                context: format!("serializing flow `{}`", flow.id),
                source: e,
            })?;
            atomic_write(&path, &body)?;
            keep.insert(path.clone());
            written.push(path);
        }

        for path in self.managed_files()? {
            if keep.contains(&path) {
                continue;
            }
            tracing::debug!(path = %path.display(), "Removing stale flow file");
            fs::remove_file(&path)
                .map_err(|e| FlowError::io(format!("removing {}", path.display()), e))?;
        }

        Ok(written)
    }

    fn managed_files(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(FlowError::io(
                    format!("listing {}", self.dir.display()),
                    e,
                ))
            }
        };

        let mut paths = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| FlowError::io(format!("listing {}", self.dir.display()), e))?;
            let path = entry.path();
            let is_managed = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(is_managed_file_name)
                .unwrap_or(false);
            if is_managed && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

fn is_managed_file_name(name: &str) -> bool {
    !name.starts_with('.') && name.len() > FLOW_FILE_SUFFIX.len() && name.ends_with(FLOW_FILE_SUFFIX)
}

/// Lower-cases the id and collapses whitespace/punctuation runs into single
/// hyphens. Returns `None` when nothing usable is left.
pub fn flow_file_name(trigger_id: &str) -> Option<String> {
    let mut slug = String::new();
    let mut pending_separator = false;
    for ch in trigger_id.trim().to_lowercase().chars() {
        if ch.is_alphanumeric() {
            if pending_separator && !slug.is_empty() {
                slug.push('-');
            }
            pending_separator = false;
            slug.push(ch);
        } else {
            pending_separator = true;
        }
    }
    if slug.is_empty() {
        None
    } else {
        Some(format!("{}{}", slug, FLOW_FILE_SUFFIX))
    }
}

/// Maps each trigger to its file, rejecting ids that collide on disk.
pub fn plan_flow_files(
    config: &Config,
) -> std::result::Result<Vec<(String, FlowFile)>, ValidationError> {
    let mut owners: HashMap<String, String> = HashMap::new();
    let mut planned = Vec::new();
    for flow in flows_from_config(config) {
        let file_name = flow_file_name(&flow.id).ok_or_else(|| {
            ValidationError::bad_request(format!(
                "trigger id `{}` does not produce a usable file name",
                flow.id
            ))
        })?;
        if let Some(owner) = owners.get(&file_name) {
            return Err(ValidationError::conflict(format!(
                "triggers `{}` and `{}` both map to {}",
                owner, flow.id, file_name
            )));
        }
        owners.insert(file_name.clone(), flow.id.clone());
        planned.push((file_name, flow));
    }
    Ok(planned)
}

pub fn flows_from_config(config: &Config) -> Vec<FlowFile> {
    config
        .triggers
        .iter()
        .map(|trigger| FlowFile {
            id: trigger.id.clone(),
            label: trigger.label.clone(),
            event_type: trigger.event_type.clone(),
            where_clause: trigger.where_clause.clone(),
            bindings: config
                .bindings_for(&trigger.id)
                .iter()
                .map(|binding| FlowBindingFile {
                    activity_id: binding.activity_id.clone(),
                    config: binding.config.clone(),
                })
                .collect(),
        })
        .collect()
}

pub fn config_from_flows(version: u32, flows: Vec<FlowFile>) -> Config {
    let mut config = Config {
        version,
        ..Config::default()
    };
    for flow in flows {
        let bindings = flow
            .bindings
            .into_iter()
            .map(|binding| ActivityBinding {
                activity_id: binding.activity_id,
                config: binding.config,
            })
            .collect();
        config.add_trigger(
            EventTrigger {
                id: flow.id,
                label: flow.label,
                event_type: flow.event_type,
                where_clause: flow.where_clause,
            },
            bindings,
        );
    }
    config
}

pub fn export_bundle(config: &Config) -> FlowBundle {
    FlowBundle {
        version: config.version,
        flows: flows_from_config(config),
    }
}

/// Builds and validates a config from an imported bundle.
pub fn import_bundle(bundle: FlowBundle, catalog: &ActivityCatalog) -> Result<Config> {
    let config = config_from_flows(bundle.version, bundle.flows);
    validate_config(&config, catalog)?;
    plan_flow_files(&config)?;
    Ok(config)
}

/// Parses bundle JSON, reporting line/column on malformed input.
pub fn parse_bundle(content: &str, source: &Path) -> Result<FlowBundle> {
    serde_json::from_str(content).map_err(|e| FlowError::InvalidConfig {
        path: source.to_path_buf(),
        line: Some(e.line()),
        column: Some(e.column()),
        message: e.to_string(),
    })
}

/// Writes `content` to `path` via a synced temp file in the same directory.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| FlowError::io(format!("creating temp file in {}", dir.display()), e))?;
    tmp.write_all(content)
        .map_err(|e| FlowError::io("writing temp file", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| FlowError::io("syncing temp file", e))?;
    tmp.persist(path).map_err(|e| FlowError::Io {
        context: format!("persisting {}", path.display()),
        source: e.error,
    })?;
    Ok(())
}
