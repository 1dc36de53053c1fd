//! # flow-core
//!
//! Shared logic for flowd and its clients: source event normalization,
//! trigger matching, flow configuration, validation and the on-disk store.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime. The daemon runs this on plain threads.
//! - **Plain values**: Configs and events are cloned, never shared mutably.
//! - **Validate before write**: Nothing reaches disk until the whole config
//!   passes validation and filename planning.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flow_core::{normalize, match_bindings, ActivityCatalog, FlowStore, StorageConfig};
//!
//! let storage = StorageConfig::default();
//! let catalog = ActivityCatalog::builtin();
//! let config = FlowStore::new(storage.flows_dir()).load_or_default(&catalog);
//! let fields = normalize(&source_event);
//! for matched in match_bindings(&config, &fields) { /* dispatch */ }
//! ```

pub mod catalog;
pub mod dedupe;
pub mod error;
pub mod flow;
pub mod matcher;
pub mod normalize;
pub mod storage;
pub mod store;
pub mod validate;

pub use catalog::{ActivityCatalog, ActivityDef, ActivityField, FieldType};
pub use dedupe::{build_event_id, build_idempotency_key, dispatch_identity, EventDeduper};
pub use error::{ErrorKind, FlowError, Result, ValidationError};
pub use flow::{ActivityBinding, ActivityRequest, Config, EventTrigger, FLOW_CONFIG_VERSION};
pub use matcher::{match_bindings, matches, session_id_matches, MatchedBinding};
pub use normalize::{normalize, normalize_workflow, SourceEvent, WorkflowEventKind, WorkflowLifecycleEvent};
pub use storage::StorageConfig;
pub use store::{atomic_write, export_bundle, import_bundle, parse_bundle, FlowBundle, FlowFile, FlowStore};
pub use validate::validate_config;
