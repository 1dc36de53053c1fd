//! Daemon-wide state: the flow store, the journal and the processes built on
//! top of it.
//!
//! Startup order matters. Dispatches are resumed before the router replays
//! (a replayed event must find its dispatch identity already taken), and the
//! router exists before sessions recover so their lifecycle events have
//! somewhere to go.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use flow_core::{
    build_event_id, export_bundle, import_bundle, normalize_workflow, ActivityCatalog, Config,
    FlowBundle, FlowError, FlowStore, StorageConfig, WorkflowLifecycleEvent,
};
use flowd_protocol::{ErrorInfo, EventSignal};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::host::{ActivityHost, LifecycleSink};
use crate::journal::{ExecutionKind, Journal};
use crate::router::{start_router, RouterHandle, RouterSignal};
use crate::sessions::{SessionOptions, SessionRegistry};
use crate::settings::DaemonSettings;

pub struct SharedState {
    storage: StorageConfig,
    settings: DaemonSettings,
    catalog: ActivityCatalog,
    store: FlowStore,
    journal: Arc<Journal>,
    router: Arc<RouterHandle>,
    sessions: Arc<SessionRegistry>,
    /// Serializes save-then-signal so disk and router agree on order.
    config_lock: Mutex<()>,
    started_at: DateTime<Utc>,
}

impl SharedState {
    pub fn new(
        storage: StorageConfig,
        settings: DaemonSettings,
        host: Arc<dyn ActivityHost>,
    ) -> Result<Self, String> {
        let catalog = ActivityCatalog::builtin();
        let store = FlowStore::new(storage.flows_dir());
        let disk_config = store.load_or_default(&catalog);
        info!(
            triggers = disk_config.triggers.len(),
            dir = %store.dir().display(),
            "Flow store loaded"
        );

        let journal = Arc::new(Journal::new(storage.journal_db())?);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&journal),
            Arc::clone(&host),
            settings.retry_policy(),
            settings.activity_timeout(),
            settings.output_tail_timeout(),
        ));
        dispatcher.resume_open()?;

        let router = start_router(
            Arc::clone(&journal),
            dispatcher,
            disk_config,
            &settings.router,
        )?;
        let feed = Arc::new(RouterFeed {
            router: Arc::clone(&router),
        });
        let sessions = Arc::new(SessionRegistry::new(
            Arc::clone(&journal),
            host,
            feed,
            SessionOptions::from_settings(&settings),
        ));
        sessions.recover()?;

        Ok(Self {
            storage,
            settings,
            catalog,
            store,
            journal,
            router,
            sessions,
            config_lock: Mutex::new(()),
            started_at: Utc::now(),
        })
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    pub fn catalog(&self) -> &ActivityCatalog {
        &self.catalog
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Queues one normalized event for the router. Returns the event id the
    /// router will dedupe on.
    pub fn ingest_event(&self, mut event: EventSignal) -> Result<String, ErrorInfo> {
        event.canonicalize();
        event.validate()?;
        if event.event_id.is_empty() {
            event.event_id = build_event_id(&event.fields);
        }
        let event_id = event.event_id.clone();
        self.router
            .signal(RouterSignal::Event { event })
            .map_err(router_unavailable)?;
        debug!(event_id = %event_id, "Event queued for router");
        Ok(event_id)
    }

    /// Validates, persists and then hands `config` to the router. Nothing is
    /// written when validation fails.
    pub fn replace_config(&self, config: Config) -> Result<Vec<PathBuf>, ErrorInfo> {
        let config = config.with_defaults();
        let _guard = self
            .config_lock
            .lock()
            .map_err(|_| ErrorInfo::new("internal_error", "config lock poisoned"))?;
        let written = self
            .store
            .save(&config, &self.catalog)
            .map_err(flow_error)?;
        self.router
            .signal(RouterSignal::ReplaceConfig { config })
            .map_err(router_unavailable)?;
        info!(files = written.len(), "Flow config replaced");
        Ok(written)
    }

    pub fn config_snapshot(&self) -> Config {
        self.router.config_snapshot()
    }

    pub fn export_bundle(&self) -> FlowBundle {
        export_bundle(&self.config_snapshot())
    }

    pub fn import_bundle(&self, bundle: FlowBundle) -> Result<Config, ErrorInfo> {
        let config = import_bundle(bundle, &self.catalog).map_err(flow_error)?;
        self.replace_config(config.clone())?;
        Ok(config)
    }

    pub fn health(&self) -> Value {
        let open_dispatches = self
            .journal
            .count_open(ExecutionKind::Dispatch)
            .unwrap_or_else(|err| {
                warn!(error = %err, "Failed to count open dispatches");
                -1
            });
        json!({
            "root": self.storage.root().display().to_string(),
            "started_at": self.started_at.to_rfc3339(),
            "router": self.router.stats(),
            "triggers": self.router.config_snapshot().triggers.len(),
            "open_dispatches": open_dispatches,
            "open_sessions": self.sessions.open_count(),
        })
    }

    /// Deletes closed executions past the retention window.
    pub fn prune_closed(&self) -> Result<usize, String> {
        let cutoff =
            retention_cutoff(Utc::now(), self.settings.maintenance.closed_retention_hours)?;
        let removed = self.journal.prune_closed(cutoff)?;
        if removed > 0 {
            info!(removed, "Pruned closed executions");
        }
        Ok(removed)
    }
}

/// Oldest close time that survives pruning. Errors instead of wrapping when
/// `retention_hours` reaches past the representable range.
fn retention_cutoff(now: DateTime<Utc>, retention_hours: u64) -> Result<DateTime<Utc>, String> {
    i64::try_from(retention_hours)
        .ok()
        .and_then(ChronoDuration::try_hours)
        .and_then(|retention| now.checked_sub_signed(retention))
        .ok_or_else(|| {
            format!(
                "closed_retention_hours {} is out of range",
                retention_hours
            )
        })
}

/// Feeds session lifecycle events back into the router as normalized events.
struct RouterFeed {
    router: Arc<RouterHandle>,
}

impl LifecycleSink for RouterFeed {
    fn emit(&self, event: WorkflowLifecycleEvent) {
        let fields = normalize_workflow(&event);
        let mut signal = EventSignal::new(fields);
        signal.event_id = build_event_id(&signal.fields);
        if let Err(err) = self.router.signal(RouterSignal::Event { event: signal }) {
            warn!(
                session_id = %event.session_id,
                kind = event.kind.as_str(),
                error = %err,
                "Failed to forward lifecycle event to router"
            );
        }
    }
}

pub fn flow_error(err: FlowError) -> ErrorInfo {
    ErrorInfo::new(err.code(), err.to_string())
}

fn router_unavailable(err: String) -> ErrorInfo {
    ErrorInfo::new("router_unavailable", err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::RecordingHost;
    use flow_core::{ActivityBinding, EventTrigger};
    use flowd_protocol::{SessionSignal, StartSessionParams};
    use std::thread;
    use std::time::{Duration, Instant};

    fn shared_state(root: &std::path::Path, host: Arc<RecordingHost>) -> SharedState {
        let storage = StorageConfig::with_root(root.to_path_buf());
        storage.ensure_dirs().unwrap();
        let mut settings = DaemonSettings::default();
        settings.retry.initial_interval_ms = 1;
        settings.retry.max_interval_ms = 2;
        SharedState::new(storage, settings, host).unwrap()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("condition not met in time");
    }

    fn toast_on(event_type: &str) -> Config {
        let mut config = Config::default();
        config.add_trigger(
            EventTrigger::new("paused", event_type),
            vec![ActivityBinding::new("toast").with_config("message", Value::from("paused"))],
        );
        config
    }

    #[test]
    fn replace_config_persists_and_routes() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(RecordingHost::default());
        let state = shared_state(dir.path(), host.clone());

        let written = state.replace_config(toast_on("file_changed")).unwrap();
        assert_eq!(written.len(), 1);
        wait_until(|| state.config_snapshot().triggers.len() == 1);

        let mut event = EventSignal::default();
        event.fields.insert("type".to_string(), "file_changed".to_string());
        let event_id = state.ingest_event(event.clone()).unwrap();
        assert!(!event_id.is_empty());
        // Same fields, same id: deduped.
        assert_eq!(state.ingest_event(event).unwrap(), event_id);

        wait_until(|| host.executed().len() == 1);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(host.executed().len(), 1);
    }

    #[test]
    fn ingested_fields_are_canonicalized_before_id_and_matching() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(RecordingHost::default());
        let state = shared_state(dir.path(), host.clone());

        let mut config = Config::default();
        config.add_trigger(
            EventTrigger::new("on-x", "file_changed").with_where("path", "/x"),
            vec![ActivityBinding::new("toast").with_config("message", Value::from("x"))],
        );
        state.replace_config(config).unwrap();
        wait_until(|| state.config_snapshot().triggers.len() == 1);

        let mut messy = EventSignal::default();
        messy.fields.insert("Type".to_string(), "file_changed".to_string());
        messy.fields.insert(" Path ".to_string(), "/x".to_string());
        messy.fields.insert("op".to_string(), String::new());
        let mut plain = EventSignal::default();
        plain.fields.insert("type".to_string(), "file_changed".to_string());
        plain.fields.insert("path".to_string(), "/x".to_string());

        let messy_id = state.ingest_event(messy).unwrap();
        assert_eq!(state.ingest_event(plain).unwrap(), messy_id);

        wait_until(|| host.executed().len() == 1);
        thread::sleep(Duration::from_millis(50));
        let executed = host.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].trigger_id, "on-x");
        assert_eq!(executed[0].event["path"], "/x");
        assert!(!executed[0].event.contains_key("op"));
    }

    #[test]
    fn ingest_rejects_events_without_type() {
        let dir = tempfile::tempdir().unwrap();
        let state = shared_state(dir.path(), Arc::new(RecordingHost::default()));
        let mut event = EventSignal::default();
        event.fields.insert(" TYPE ".to_string(), "  ".to_string());
        assert_eq!(state.ingest_event(event).unwrap_err().code, "missing_field");
    }

    #[test]
    fn retention_cutoff_rejects_unrepresentable_windows() {
        let now = Utc::now();
        assert_eq!(
            retention_cutoff(now, 24).unwrap(),
            now - ChronoDuration::hours(24)
        );
        assert!(retention_cutoff(now, u64::MAX).is_err());
        assert!(retention_cutoff(now, i64::MAX as u64).is_err());
        assert!(retention_cutoff(now, 2_500_000_000).is_err());
    }

    #[test]
    fn prune_with_huge_retention_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig::with_root(dir.path().to_path_buf());
        storage.ensure_dirs().unwrap();
        let mut settings = DaemonSettings::default();
        settings.maintenance.closed_retention_hours = u64::MAX;
        let state =
            SharedState::new(storage, settings, Arc::new(RecordingHost::default())).unwrap();
        let err = state.prune_closed().unwrap_err();
        assert!(err.contains("out of range"), "{}", err);
    }

    #[test]
    fn invalid_config_is_rejected_before_routing() {
        let dir = tempfile::tempdir().unwrap();
        let state = shared_state(dir.path(), Arc::new(RecordingHost::default()));

        let mut config = Config::default();
        config.add_trigger(
            EventTrigger::new("t", "file_changed"),
            vec![ActivityBinding::new("teleport")],
        );
        let err = state.replace_config(config).unwrap_err();
        assert_eq!(err.code, "conflict");
        assert!(state.config_snapshot().triggers.is_empty());
    }

    #[test]
    fn session_lifecycle_events_reach_the_router() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(RecordingHost::default());
        let state = shared_state(dir.path(), host.clone());
        state.replace_config(toast_on("workflow_paused")).unwrap();
        wait_until(|| state.config_snapshot().triggers.len() == 1);

        state
            .sessions()
            .start(StartSessionParams {
                session_id: "coder 1".to_string(),
                agent_id: "coder".to_string(),
                l1: String::new(),
                l2: String::new(),
                cwd: None,
            })
            .unwrap();
        state
            .sessions()
            .signal(
                "coder 1",
                SessionSignal::Bell {
                    timestamp: None,
                    context: Some("need input".to_string()),
                },
            )
            .unwrap();

        wait_until(|| host.executed().len() == 1);
        let request = &host.executed()[0];
        assert_eq!(request.trigger_id, "paused");
        assert_eq!(request.event["session.id"], "coder 1");
    }

    #[test]
    fn restart_reconciles_router_with_flow_store() {
        let dir = tempfile::tempdir().unwrap();
        {
            let state = shared_state(dir.path(), Arc::new(RecordingHost::default()));
            state.replace_config(toast_on("file_changed")).unwrap();
            wait_until(|| state.config_snapshot().triggers.len() == 1);
        }

        // Flow files edited while the daemon was down.
        let store = FlowStore::new(StorageConfig::with_root(dir.path().to_path_buf()).flows_dir());
        store
            .save(&toast_on("config_changed"), &ActivityCatalog::builtin())
            .unwrap();

        let state = shared_state(dir.path(), Arc::new(RecordingHost::default()));
        wait_until(|| {
            state
                .config_snapshot()
                .triggers
                .first()
                .map(|trigger| trigger.event_type == "config_changed")
                .unwrap_or(false)
        });
    }
}
