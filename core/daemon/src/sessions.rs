//! Session runtime: one durable execution and one worker thread per agent
//! session.
//!
//! Signals are journaled before they are queued, and the worker applies them
//! one at a time through [`SessionMachine`]. Queries read a published
//! snapshot, so they never wait on a transition (or on a slow side effect).
//! Closed sessions are answered by replaying their history.

use chrono::{DateTime, Utc};
use flow_core::{WorkflowEventKind, WorkflowLifecycleEvent};
use flowd_protocol::{
    ErrorInfo, SessionResult, SessionSignal, SessionWorkflowState, StartSessionParams,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::host::{ActivityHost, LifecycleSink};
use crate::journal::{
    EffectOutcome, ExecutionKind, ExecutionRow, ExecutionStatus, HistoryEntry, HistoryRecord,
    Journal, StartOutcome,
};
use crate::replay::{split_signals, ReplaySignal};
use crate::retry::{call_with_policy, RetryPolicy};
use crate::session::{SessionCommand, SessionMachine, SignalContext};
use crate::settings::DaemonSettings;

pub const SESSION_EXECUTION_PREFIX: &str = "session:";

const SPAWN_EFFECT: &str = "spawn";
const OUTPUT_TAIL_EFFECT: &str = "output_tail";
const PERSIST_TASK_EFFECT: &str = "persist_task";
const PERSIST_BELL_EFFECT: &str = "persist_bell";

pub fn execution_id(session_id: &str) -> String {
    format!("{}{}", SESSION_EXECUTION_PREFIX, session_id)
}

/// Execution input: everything a replay needs to rebuild the initial state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInput {
    pub params: StartSessionParams,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub policy: RetryPolicy,
    pub spawn_timeout: Duration,
    pub output_tail_timeout: Duration,
    pub persist_timeout: Duration,
    pub bell_output_lines: u32,
}

impl SessionOptions {
    pub fn from_settings(settings: &DaemonSettings) -> Self {
        Self {
            policy: settings.retry_policy(),
            spawn_timeout: settings.spawn_timeout(),
            output_tail_timeout: settings.output_tail_timeout(),
            persist_timeout: settings.activity_timeout(),
            bell_output_lines: settings.session.bell_output_lines.max(1),
        }
    }
}

struct Inbound {
    seq: i64,
    recorded_at: DateTime<Utc>,
    signal: SessionSignal,
}

/// Sending half of a session's queue. `closed` flips under the lock as soon
/// as a stop signal is queued, so nothing is journaled behind it.
struct Inbox {
    sender: Sender<Inbound>,
    closed: bool,
}

struct LiveSession {
    run_id: String,
    inbox: Mutex<Inbox>,
    snapshot: Arc<RwLock<SessionWorkflowState>>,
}

impl LiveSession {
    fn snapshot(&self) -> SessionWorkflowState {
        match self.snapshot.read() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

pub struct SessionRegistry {
    journal: Arc<Journal>,
    host: Arc<dyn ActivityHost>,
    sink: Arc<dyn LifecycleSink>,
    options: SessionOptions,
    live: Mutex<HashMap<String, Arc<LiveSession>>>,
}

impl SessionRegistry {
    pub fn new(
        journal: Arc<Journal>,
        host: Arc<dyn ActivityHost>,
        sink: Arc<dyn LifecycleSink>,
        options: SessionOptions,
    ) -> Self {
        Self {
            journal,
            host,
            sink,
            options,
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a session: journals it, spawns its terminal and starts the
    /// signal loop. A closed session id is reused with a fresh run.
    pub fn start(
        self: &Arc<Self>,
        params: StartSessionParams,
    ) -> Result<SessionWorkflowState, ErrorInfo> {
        let id = execution_id(&params.session_id);
        let started_at = Utc::now();
        let run_id = ulid::Ulid::new().to_string();
        let input = serde_json::to_value(SessionInput {
            params: params.clone(),
            started_at,
        })
        .map_err(|err| internal(format!("Failed to serialize session input: {}", err)))?;

        match self
            .journal
            .start_execution(&id, ExecutionKind::Session, &input, &run_id, started_at)
            .map_err(internal)?
        {
            StartOutcome::Started => {}
            StartOutcome::AlreadyExists(ExecutionStatus::Open) => {
                return Err(ErrorInfo::new(
                    "conflict",
                    format!("session {} is already running", params.session_id),
                ));
            }
            StartOutcome::AlreadyExists(_) => {
                self.journal
                    .reopen_execution(&id, &input, &run_id, started_at)
                    .map_err(internal)?;
                debug!(session_id = %params.session_id, "Reusing closed session id");
            }
        }

        if let Err(err) = self.spawn_terminal(&id, &params, &[]) {
            warn!(session_id = %params.session_id, error = %err, "Session spawn failed");
            if let Err(fail_err) = self.journal.fail(&id, &err, Utc::now()) {
                warn!(session_id = %params.session_id, error = %fail_err, "Failed to close session execution");
            }
            return Err(ErrorInfo::new(
                "session_start_failed",
                format!("failed to start session {}: {}", params.session_id, err),
            ));
        }

        let machine = SessionMachine::start(&params, started_at);
        self.emit_started(&machine, started_at);
        let state = machine.state().clone();
        self.launch(id, run_id, machine, Vec::new(), Vec::new())
            .map_err(internal)?;
        info!(session_id = %params.session_id, agent_id = %params.agent_id, "Session started");
        Ok(state)
    }

    /// Journals `signal` for the session and queues it. Returns its seq.
    pub fn signal(&self, session_id: &str, signal: SessionSignal) -> Result<i64, ErrorInfo> {
        let live = match self.live_session(session_id) {
            Some(live) => live,
            None => return Err(self.missing_session(session_id)),
        };
        let mut inbox = live
            .inbox
            .lock()
            .map_err(|_| internal("Session inbox lock poisoned".to_string()))?;
        if inbox.closed || live.snapshot().status.is_terminal() {
            return Err(stopped(session_id));
        }

        let stops = SessionMachine::is_stop_signal(&signal);
        let payload = serde_json::to_value(&signal)
            .map_err(|err| internal(format!("Failed to serialize session signal: {}", err)))?;
        let recorded_at = Utc::now();
        let seq = self
            .journal
            .append(
                &execution_id(session_id),
                recorded_at,
                &HistoryEntry::Signal {
                    name: signal.name().to_string(),
                    payload,
                },
            )
            .map_err(internal)?;
        inbox
            .sender
            .send(Inbound {
                seq,
                recorded_at,
                signal,
            })
            .map_err(|_| stopped(session_id))?;
        if stops {
            inbox.closed = true;
        }
        Ok(seq)
    }

    pub fn status(&self, session_id: &str) -> Result<SessionWorkflowState, ErrorInfo> {
        if let Some(live) = self.live_session(session_id) {
            return Ok(live.snapshot());
        }
        let row = self.closed_row(session_id)?;
        let machine = self.replay_closed(&row).map_err(internal)?;
        Ok(machine.state().clone())
    }

    pub fn result(&self, session_id: &str) -> Result<SessionResult, ErrorInfo> {
        let row = match self
            .journal
            .get(&execution_id(session_id))
            .map_err(internal)?
        {
            Some(row) => row,
            None => return Err(not_found(session_id)),
        };
        match row.status {
            ExecutionStatus::Open => Err(ErrorInfo::new(
                "not_finished",
                format!("session {} has not stopped yet", session_id),
            )),
            ExecutionStatus::Failed => Err(failed(session_id, &row)),
            ExecutionStatus::Completed => {
                let value = row.result.clone().unwrap_or(Value::Null);
                serde_json::from_value(value).map_err(|err| {
                    internal(format!("Stored session result is unreadable: {}", err))
                })
            }
        }
    }

    pub fn open_count(&self) -> usize {
        match self.live.lock() {
            Ok(live) => live
                .values()
                .filter(|session| !session.snapshot().status.is_terminal())
                .count(),
            Err(_) => 0,
        }
    }

    /// Rebuilds every open session from the journal and resumes its loop.
    pub fn recover(self: &Arc<Self>) -> Result<usize, String> {
        let open = self.journal.list_open(ExecutionKind::Session)?;
        let mut recovered = 0;
        for row in open {
            match self.recover_session(&row) {
                Ok(()) => recovered += 1,
                Err(err) => {
                    warn!(execution_id = %row.id, error = %err, "Session recovery failed; failing it");
                    self.journal.fail(&row.id, &err, Utc::now())?;
                }
            }
        }
        if recovered > 0 {
            info!(recovered, "Recovered open sessions");
        }
        Ok(recovered)
    }

    fn recover_session(self: &Arc<Self>, row: &ExecutionRow) -> Result<(), String> {
        let input: SessionInput = serde_json::from_value(row.input.clone())
            .map_err(|err| format!("unreadable session input: {}", err))?;
        let history = self.journal.load_history(&row.id)?;

        let spawn_recorded = HistoryRecord::find_effect(&history, 0, SPAWN_EFFECT).is_some();
        self.spawn_terminal(&row.id, &input.params, &history)?;

        let mut machine = SessionMachine::start(&input.params, input.started_at);
        if !spawn_recorded {
            self.emit_started(&machine, input.started_at);
        }
        let (applied, pending) = split_signals::<SessionSignal>(&history, row.applied_through);
        replay(&mut machine, &applied, &history);

        let session_id = input.params.session_id.clone();
        info!(
            session_id = %session_id,
            replayed = applied.len(),
            pending = pending.len(),
            "Session recovered from journal"
        );

        let pending = pending
            .into_iter()
            .map(|pending| Inbound {
                seq: pending.seq,
                recorded_at: pending.recorded_at,
                signal: pending.signal,
            })
            .collect();
        self.launch(row.id.clone(), row.run_id.clone(), machine, pending, history)
    }

    fn launch(
        self: &Arc<Self>,
        id: String,
        run_id: String,
        machine: SessionMachine,
        pending: Vec<Inbound>,
        history: Vec<HistoryRecord>,
    ) -> Result<(), String> {
        let session_id = machine.state().session_id.clone();
        let (tx, rx) = mpsc::channel();
        let snapshot = Arc::new(RwLock::new(machine.state().clone()));
        let closed = machine.is_stopped()
            || pending
                .iter()
                .any(|inbound| SessionMachine::is_stop_signal(&inbound.signal));
        let live = Arc::new(LiveSession {
            run_id: run_id.clone(),
            inbox: Mutex::new(Inbox {
                sender: tx,
                closed,
            }),
            snapshot: Arc::clone(&snapshot),
        });
        self.live
            .lock()
            .map_err(|_| "Session registry lock poisoned".to_string())?
            .insert(session_id, live);

        let worker = SessionWorker {
            registry: Arc::clone(self),
            id,
            run_id,
            machine,
            snapshot,
            history,
        };
        thread::Builder::new()
            .name("flow-session".to_string())
            .spawn(move || worker.run(pending, rx))
            .map_err(|err| format!("Failed to spawn session thread: {}", err))?;
        Ok(())
    }

    /// Spawns the session's terminal unless a previous run already did.
    fn spawn_terminal(
        &self,
        id: &str,
        params: &StartSessionParams,
        history: &[HistoryRecord],
    ) -> Result<(), String> {
        if let Some(recorded) = HistoryRecord::find_effect(history, 0, SPAWN_EFFECT) {
            return recorded.map(|_| ());
        }
        let host = Arc::clone(&self.host);
        let payload = params.clone();
        let result = call_with_policy(
            "spawn_terminal",
            &self.options.policy,
            self.options.spawn_timeout,
            move || host.spawn_terminal(&payload).map(|_| Value::Null),
        );
        self.record_effect(id, SPAWN_EFFECT, 0, &result);
        result.map(|_| ())
    }

    fn record_effect(&self, id: &str, name: &str, signal_seq: i64, result: &Result<Value, String>) {
        let entry = HistoryEntry::Effect {
            name: name.to_string(),
            signal_seq,
            outcome: EffectOutcome::from_result(result),
        };
        if let Err(err) = self.journal.append(id, Utc::now(), &entry) {
            warn!(execution_id = id, effect = name, error = %err, "Failed to record effect");
        }
    }

    fn emit_started(&self, machine: &SessionMachine, started_at: DateTime<Utc>) {
        self.sink.emit(lifecycle_event(
            machine,
            WorkflowEventKind::WorkflowStarted,
            None,
            Map::new(),
            started_at,
        ));
    }

    fn live_session(&self, session_id: &str) -> Option<Arc<LiveSession>> {
        match self.live.lock() {
            Ok(live) => live.get(session_id).cloned(),
            Err(poisoned) => poisoned.into_inner().get(session_id).cloned(),
        }
    }

    fn forget(&self, session_id: &str, run_id: &str) {
        let mut live = match self.live.lock() {
            Ok(live) => live,
            Err(poisoned) => poisoned.into_inner(),
        };
        if live
            .get(session_id)
            .map(|session| session.run_id == run_id)
            .unwrap_or(false)
        {
            live.remove(session_id);
        }
    }

    fn missing_session(&self, session_id: &str) -> ErrorInfo {
        match self.journal.get(&execution_id(session_id)) {
            Ok(Some(row)) if row.status.is_closed() => stopped(session_id),
            Ok(_) => not_found(session_id),
            Err(err) => internal(err),
        }
    }

    fn closed_row(&self, session_id: &str) -> Result<ExecutionRow, ErrorInfo> {
        match self
            .journal
            .get(&execution_id(session_id))
            .map_err(internal)?
        {
            Some(row) if row.status == ExecutionStatus::Failed => Err(failed(session_id, &row)),
            Some(row) => Ok(row),
            None => Err(not_found(session_id)),
        }
    }

    fn replay_closed(&self, row: &ExecutionRow) -> Result<SessionMachine, String> {
        let input: SessionInput = serde_json::from_value(row.input.clone())
            .map_err(|err| format!("Stored session input is unreadable: {}", err))?;
        let history = self.journal.load_history(&row.id)?;
        let (applied, _) = split_signals::<SessionSignal>(&history, i64::MAX);
        let mut machine = SessionMachine::start(&input.params, input.started_at);
        replay(&mut machine, &applied, &history);
        Ok(machine)
    }
}

/// Re-applies already-applied signals. Commands are dropped; fetched output
/// tails come from the recorded effects so the rebuilt state is identical.
fn replay(
    machine: &mut SessionMachine,
    applied: &[ReplaySignal<SessionSignal>],
    history: &[HistoryRecord],
) {
    for replayed in applied {
        let ctx = SignalContext {
            recorded_at: replayed.recorded_at,
            output_tail: recorded_tail(history, replayed.seq),
        };
        let _ = machine.apply(&replayed.signal, &ctx);
    }
}

fn recorded_tail(history: &[HistoryRecord], seq: i64) -> Option<String> {
    HistoryRecord::find_effect(history, seq, OUTPUT_TAIL_EFFECT)
        .and_then(Result::ok)
        .and_then(|value| value.as_str().map(str::to_string))
}

struct SessionWorker {
    registry: Arc<SessionRegistry>,
    id: String,
    run_id: String,
    machine: SessionMachine,
    snapshot: Arc<RwLock<SessionWorkflowState>>,
    history: Vec<HistoryRecord>,
}

impl SessionWorker {
    fn run(mut self, pending: Vec<Inbound>, inbox: Receiver<Inbound>) {
        if self.machine.is_stopped() {
            // Stopped before the last run could close the execution.
            self.finish(Utc::now());
            return;
        }
        for inbound in pending.into_iter().chain(inbox) {
            if self.process(inbound) {
                return;
            }
        }
        debug!(execution_id = %self.id, "Session inbox closed");
    }

    /// Applies one signal. Returns true once the session has stopped.
    fn process(&mut self, inbound: Inbound) -> bool {
        let mut ctx = SignalContext {
            recorded_at: inbound.recorded_at,
            output_tail: None,
        };
        if !self.machine.is_stopped() && SessionMachine::needs_output_tail(&inbound.signal) {
            ctx.output_tail = self.fetch_output_tail(inbound.seq);
        }

        let commands = self.machine.apply(&inbound.signal, &ctx);
        for command in commands {
            self.perform(inbound.seq, inbound.recorded_at, command);
        }

        if let Err(err) = self.registry.journal.advance_cursor(&self.id, inbound.seq) {
            warn!(execution_id = %self.id, seq = inbound.seq, error = %err, "Failed to advance session cursor");
        }
        self.publish();
        debug!(
            session_id = %self.machine.state().session_id,
            signal = inbound.signal.name(),
            status = self.machine.state().status.as_str(),
            "Session signal applied"
        );

        if self.machine.is_stopped() {
            self.finish(inbound.recorded_at);
            return true;
        }
        false
    }

    fn fetch_output_tail(&self, seq: i64) -> Option<String> {
        let session_id = self.machine.state().session_id.clone();
        let host = Arc::clone(&self.registry.host);
        let lines = self.registry.options.bell_output_lines;
        let result = self.effect(seq, OUTPUT_TAIL_EFFECT, self.registry.options.output_tail_timeout, move || {
            host.get_output_tail(&session_id, lines).map(Value::String)
        });
        match result {
            Ok(Value::String(tail)) => Some(tail),
            Ok(_) => None,
            Err(err) => {
                warn!(execution_id = %self.id, error = %err, "Output tail unavailable for bell");
                None
            }
        }
    }

    fn perform(&self, seq: i64, recorded_at: DateTime<Utc>, command: SessionCommand) {
        let session_id = self.machine.state().session_id.clone();
        let host = Arc::clone(&self.registry.host);
        let timeout = self.registry.options.persist_timeout;
        let result = match command {
            SessionCommand::PersistTask(task) => self.effect(seq, PERSIST_TASK_EFFECT, timeout, move || {
                host.persist_task(&session_id, &task).map(|_| Value::Null)
            }),
            SessionCommand::PersistBell(bell) => self.effect(seq, PERSIST_BELL_EFFECT, timeout, move || {
                host.persist_bell(&session_id, &bell).map(|_| Value::Null)
            }),
            SessionCommand::Emit {
                kind,
                context,
                data,
            } => {
                self.registry
                    .sink
                    .emit(lifecycle_event(&self.machine, kind, context, data, recorded_at));
                Ok(Value::Null)
            }
        };
        if let Err(err) = result {
            warn!(execution_id = %self.id, error = %err, "Session side effect failed");
        }
    }

    fn effect<F>(&self, seq: i64, name: &str, timeout: Duration, op: F) -> Result<Value, String>
    where
        F: Fn() -> Result<Value, String> + Send + Sync + 'static,
    {
        if let Some(recorded) = HistoryRecord::find_effect(&self.history, seq, name) {
            return recorded;
        }
        let result = call_with_policy(name, &self.registry.options.policy, timeout, op);
        self.registry.record_effect(&self.id, name, seq, &result);
        result
    }

    fn publish(&self) {
        let mut snapshot = match self.snapshot.write() {
            Ok(snapshot) => snapshot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *snapshot = self.machine.state().clone();
    }

    fn finish(&mut self, end_time: DateTime<Utc>) {
        let result = self.machine.result(end_time);
        self.registry.sink.emit(lifecycle_event(
            &self.machine,
            WorkflowEventKind::WorkflowCompleted,
            self.machine.completion_context().map(str::to_string),
            Map::new(),
            end_time,
        ));

        let closed = serde_json::to_value(&result)
            .map_err(|err| format!("Failed to serialize session result: {}", err))
            .and_then(|value| self.registry.journal.complete(&self.id, &value, end_time));
        if let Err(err) = closed {
            warn!(execution_id = %self.id, error = %err, "Failed to close session execution");
        }
        self.publish();
        self.registry
            .forget(&result.session_id, &self.run_id);
        info!(
            session_id = %result.session_id,
            event_count = result.event_count,
            context = ?self.machine.completion_context(),
            "Session stopped"
        );
    }
}

fn lifecycle_event(
    machine: &SessionMachine,
    kind: WorkflowEventKind,
    context: Option<String>,
    data: Map<String, Value>,
    timestamp: DateTime<Utc>,
) -> WorkflowLifecycleEvent {
    let state = machine.state();
    WorkflowLifecycleEvent {
        kind,
        session_id: state.session_id.clone(),
        agent_id: state.agent_id.clone(),
        status: Some(state.status.as_str().to_string()),
        context,
        timestamp: Some(timestamp),
        data,
    }
}

fn internal(message: String) -> ErrorInfo {
    ErrorInfo::new("internal_error", message)
}

fn not_found(session_id: &str) -> ErrorInfo {
    ErrorInfo::new("not_found", format!("unknown session {}", session_id))
}

fn stopped(session_id: &str) -> ErrorInfo {
    ErrorInfo::new(
        "conflict",
        format!("session {} has already stopped", session_id),
    )
}

fn failed(session_id: &str, row: &ExecutionRow) -> ErrorInfo {
    let reason = row
        .result
        .as_ref()
        .and_then(|result| result.get("error"))
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    ErrorInfo::new(
        "session_failed",
        format!("session {} failed: {}", session_id, reason),
    )
}
