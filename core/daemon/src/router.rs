//! The router: one long-lived durable process holding the live flow config.
//!
//! Config replacements and events share a single ordered inbox. Each signal
//! is appended to the journal before it is queued, so the journal order is
//! the processing order and recovery replays the same choices.
//!
//! `RouterState::apply` is pure: it turns one signal into commands. The
//! runtime thread executes those commands (dispatch starts, continue-as-new)
//! and then advances the applied cursor.

use chrono::{DateTime, Utc};
use flow_core::{
    build_event_id, dispatch_identity, match_bindings, ActivityRequest, Config, EventDeduper,
};
use flowd_protocol::EventSignal;
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::journal::{ExecutionKind, HistoryEntry, Journal, StartOutcome};
use crate::replay::{split_signals, ReplaySignal};
use crate::settings::RouterSettings;

pub const ROUTER_EXECUTION_ID: &str = "flow-router";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum RouterSignal {
    ReplaceConfig { config: Config },
    Event { event: EventSignal },
}

impl RouterSignal {
    pub fn name(&self) -> &'static str {
        match self {
            RouterSignal::ReplaceConfig { .. } => "replace_config",
            RouterSignal::Event { .. } => "event",
        }
    }
}

/// State carried across continue-as-new.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterInput {
    pub config: Config,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouterCommand {
    StartDispatch {
        identity: String,
        request: ActivityRequest,
    },
    ContinueAsNew,
}

#[derive(Debug, Clone)]
pub struct RouterState {
    config: Config,
    deduper: EventDeduper,
    events_processed: u32,
    continue_as_new_after: u32,
}

impl RouterState {
    pub fn new(config: Config, settings: &RouterSettings) -> Self {
        Self {
            config,
            deduper: EventDeduper::new(settings.dedupe_capacity),
            events_processed: 0,
            continue_as_new_after: settings.continue_as_new_after.max(1),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events_processed(&self) -> u32 {
        self.events_processed
    }

    pub fn apply(&mut self, signal: &RouterSignal) -> Vec<RouterCommand> {
        match signal {
            RouterSignal::ReplaceConfig { config } => {
                self.config = config.clone().with_defaults();
                Vec::new()
            }
            RouterSignal::Event { event } => self.apply_event(event),
        }
    }

    fn apply_event(&mut self, event: &EventSignal) -> Vec<RouterCommand> {
        let event_id = if event.event_id.is_empty() {
            build_event_id(&event.fields)
        } else {
            event.event_id.clone()
        };
        if event_id.is_empty() || self.deduper.seen(&event_id) {
            return Vec::new();
        }
        self.events_processed += 1;

        let mut commands: Vec<RouterCommand> = match_bindings(&self.config, &event.fields)
            .into_iter()
            .map(|matched| RouterCommand::StartDispatch {
                identity: dispatch_identity(
                    &event_id,
                    &matched.trigger.id,
                    &matched.binding.activity_id,
                ),
                request: ActivityRequest {
                    event_id: event_id.clone(),
                    trigger_id: matched.trigger.id,
                    activity_id: matched.binding.activity_id,
                    event: event.fields.clone(),
                    config: matched.binding.config,
                    output_tail: None,
                },
            })
            .collect();

        if self.events_processed >= self.continue_as_new_after {
            commands.push(RouterCommand::ContinueAsNew);
        }
        commands
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RouterStats {
    pub run_id: String,
    pub events_processed: u32,
    pub dispatches_started: u64,
    pub continued_as_new: u64,
}

struct Inbound {
    seq: i64,
    recorded_at: DateTime<Utc>,
    signal: RouterSignal,
}

/// Cloneable entry point used by request handlers and lifecycle feedback.
pub struct RouterHandle {
    journal: Arc<Journal>,
    inbox: Mutex<Sender<Inbound>>,
    config: Arc<RwLock<Config>>,
    stats: Arc<Mutex<RouterStats>>,
}

impl RouterHandle {
    /// Journals `signal` and queues it. Returns its history seq.
    pub fn signal(&self, signal: RouterSignal) -> Result<i64, String> {
        let inbox = self
            .inbox
            .lock()
            .map_err(|_| "Router inbox lock poisoned".to_string())?;
        let recorded_at = Utc::now();
        let seq = self.journal.append(
            ROUTER_EXECUTION_ID,
            recorded_at,
            &HistoryEntry::Signal {
                name: signal.name().to_string(),
                payload: serde_json::to_value(&signal)
                    .map_err(|err| format!("Failed to serialize router signal: {}", err))?,
            },
        )?;
        inbox
            .send(Inbound {
                seq,
                recorded_at,
                signal,
            })
            .map_err(|_| "Router is not running".to_string())?;
        Ok(seq)
    }

    pub fn config_snapshot(&self) -> Config {
        match self.config.read() {
            Ok(config) => config.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn stats(&self) -> RouterStats {
        match self.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

struct RouterRuntime {
    state: RouterState,
    settings: RouterSettings,
    journal: Arc<Journal>,
    dispatcher: Arc<Dispatcher>,
    config: Arc<RwLock<Config>>,
    stats: Arc<Mutex<RouterStats>>,
}

/// Starts (or recovers) the router and reconciles it with `disk_config`.
pub fn start_router(
    journal: Arc<Journal>,
    dispatcher: Arc<Dispatcher>,
    disk_config: Config,
    settings: &RouterSettings,
) -> Result<Arc<RouterHandle>, String> {
    let run_id = ulid::Ulid::new().to_string();
    let input = serde_json::to_value(RouterInput {
        config: disk_config.clone(),
    })
    .map_err(|err| format!("Failed to serialize router input: {}", err))?;

    let (state, pending, run_id) = match journal.start_execution(
        ROUTER_EXECUTION_ID,
        ExecutionKind::Router,
        &input,
        &run_id,
        Utc::now(),
    )? {
        StartOutcome::Started => {
            info!(run_id = %run_id, "Router started");
            (RouterState::new(disk_config.clone(), settings), Vec::new(), run_id)
        }
        StartOutcome::AlreadyExists(_) => recover_router(&journal, &disk_config, settings)?,
    };

    // Config the router will hold once pending signals drain.
    let expected_config = pending
        .iter()
        .rev()
        .find_map(|pending: &ReplaySignal<RouterSignal>| match &pending.signal {
            RouterSignal::ReplaceConfig { config } => Some(config.clone().with_defaults()),
            _ => None,
        })
        .unwrap_or_else(|| state.config().clone());

    let (tx, rx) = mpsc::channel();
    let config = Arc::new(RwLock::new(state.config().clone()));
    let stats = Arc::new(Mutex::new(RouterStats {
        run_id,
        events_processed: state.events_processed(),
        ..RouterStats::default()
    }));

    let runtime = RouterRuntime {
        state,
        settings: settings.clone(),
        journal: Arc::clone(&journal),
        dispatcher,
        config: Arc::clone(&config),
        stats: Arc::clone(&stats),
    };
    let pending = pending
        .into_iter()
        .map(|pending| Inbound {
            seq: pending.seq,
            recorded_at: pending.recorded_at,
            signal: pending.signal,
        })
        .collect();
    thread::Builder::new()
        .name("flow-router".to_string())
        .spawn(move || runtime.run(pending, rx))
        .map_err(|err| format!("Failed to spawn router thread: {}", err))?;

    let handle = Arc::new(RouterHandle {
        journal,
        inbox: Mutex::new(tx),
        config,
        stats,
    });

    if expected_config != disk_config.clone().with_defaults() {
        info!("Router config differs from flow store; reconciling");
        handle.signal(RouterSignal::ReplaceConfig {
            config: disk_config,
        })?;
    }

    Ok(handle)
}

type Recovered = (RouterState, Vec<ReplaySignal<RouterSignal>>, String);

fn recover_router(
    journal: &Journal,
    disk_config: &Config,
    settings: &RouterSettings,
) -> Result<Recovered, String> {
    let row = journal
        .get(ROUTER_EXECUTION_ID)?
        .ok_or_else(|| "Router execution vanished during recovery".to_string())?;
    let input: RouterInput = match serde_json::from_value(row.input.clone()) {
        Ok(input) => input,
        Err(err) => {
            warn!(error = %err, "Router input unreadable; starting from flow store config");
            RouterInput {
                config: disk_config.clone(),
            }
        }
    };

    let history = journal.load_history(ROUTER_EXECUTION_ID)?;
    let (applied, pending) = split_signals::<RouterSignal>(&history, row.applied_through);

    let mut state = RouterState::new(input.config, settings);
    for replayed in &applied {
        // Commands for applied signals already ran before the restart.
        let _ = state.apply(&replayed.signal);
    }

    info!(
        run_id = %row.run_id,
        replayed = applied.len(),
        pending = pending.len(),
        "Router recovered from journal"
    );
    Ok((state, pending, row.run_id))
}

impl RouterRuntime {
    fn run(mut self, pending: Vec<Inbound>, inbox: Receiver<Inbound>) {
        for inbound in pending {
            self.process(inbound);
        }
        for inbound in inbox {
            self.process(inbound);
        }
        info!("Router inbox closed; router stopping");
    }

    fn process(&mut self, inbound: Inbound) {
        let commands = self.state.apply(&inbound.signal);
        if let RouterSignal::ReplaceConfig { .. } = inbound.signal {
            self.publish_config();
            info!(
                triggers = self.state.config().triggers.len(),
                "Router config replaced"
            );
        }

        let mut continue_as_new = false;
        let mut started = 0u64;
        for command in commands {
            match command {
                RouterCommand::StartDispatch { identity, request } => {
                    match self.dispatcher.start(&identity, request) {
                        Ok(Some(_)) => started += 1,
                        Ok(None) => debug!(identity = %identity, "Dispatch already exists"),
                        Err(err) => warn!(
                            identity = %identity,
                            error = %err,
                            "Failed to start dispatch"
                        ),
                    }
                }
                RouterCommand::ContinueAsNew => continue_as_new = true,
            }
        }

        if continue_as_new {
            self.continue_as_new(inbound.seq);
        } else if let Err(err) = self.journal.advance_cursor(ROUTER_EXECUTION_ID, inbound.seq) {
            warn!(error = %err, seq = inbound.seq, "Failed to advance router cursor");
        }

        if let Ok(mut stats) = self.stats.lock() {
            stats.events_processed = self.state.events_processed();
            stats.dispatches_started += started;
        }
        debug!(
            seq = inbound.seq,
            signal = inbound.signal.name(),
            recorded_at = %inbound.recorded_at,
            "Router signal applied"
        );
    }

    fn continue_as_new(&mut self, through_seq: i64) {
        let run_id = ulid::Ulid::new().to_string();
        let config = self.state.config().clone();
        let input = match serde_json::to_value(RouterInput {
            config: config.clone(),
        }) {
            Ok(input) => input,
            Err(err) => {
                warn!(error = %err, "Failed to serialize router input; continuing on current run");
                return;
            }
        };

        match self
            .journal
            .continue_as_new(ROUTER_EXECUTION_ID, through_seq, &input, &run_id)
        {
            Ok(removed) => {
                info!(
                    run_id = %run_id,
                    truncated = removed,
                    events = self.state.events_processed(),
                    "Router continued as new"
                );
                self.state = RouterState::new(config, &self.settings);
                if let Ok(mut stats) = self.stats.lock() {
                    stats.run_id = run_id;
                    stats.continued_as_new += 1;
                }
            }
            Err(err) => {
                warn!(error = %err, "Router continue-as-new failed; will retry on next event");
            }
        }
    }

    fn publish_config(&self) {
        let config = self.state.config().clone();
        match self.config.write() {
            Ok(mut guard) => *guard = config,
            Err(poisoned) => *poisoned.into_inner() = config,
        }
    }
}
