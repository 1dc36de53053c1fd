//! Dispatch executions: one short-lived durable run per
//! (event, trigger, activity) match.
//!
//! Starting is insert-if-absent on the dispatch identity, so the same match
//! never runs twice. Runs are detached threads that outlive whatever started
//! them. Each side effect is journaled once it settles; a resumed run reuses
//! recorded outcomes instead of repeating the call.

use chrono::Utc;
use flow_core::catalog::{DEFAULT_OUTPUT_LINES, INCLUDE_OUTPUT_KEY, OUTPUT_LINES_KEY, SEND_TO_TERMINAL};
use flow_core::ActivityRequest;
use serde_json::{json, Value};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::host::ActivityHost;
use crate::journal::{
    EffectOutcome, ExecutionKind, HistoryEntry, HistoryRecord, Journal, StartOutcome,
};
use crate::retry::{call_with_policy, RetryPolicy};

const OUTPUT_TAIL_EFFECT: &str = "output_tail";
const EXECUTE_EFFECT: &str = "execute";

pub struct Dispatcher {
    journal: Arc<Journal>,
    host: Arc<dyn ActivityHost>,
    policy: RetryPolicy,
    activity_timeout: Duration,
    output_tail_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        journal: Arc<Journal>,
        host: Arc<dyn ActivityHost>,
        policy: RetryPolicy,
        activity_timeout: Duration,
        output_tail_timeout: Duration,
    ) -> Self {
        Self {
            journal,
            host,
            policy,
            activity_timeout,
            output_tail_timeout,
        }
    }

    /// Starts the dispatch unless `identity` already exists. Returns the
    /// run's thread when a new run was started; dropping it detaches the run.
    pub fn start(
        self: &Arc<Self>,
        identity: &str,
        request: ActivityRequest,
    ) -> Result<Option<JoinHandle<()>>, String> {
        let input = serde_json::to_value(&request)
            .map_err(|err| format!("Failed to serialize activity request: {}", err))?;
        let run_id = ulid::Ulid::new().to_string();
        match self.journal.start_execution(
            identity,
            ExecutionKind::Dispatch,
            &input,
            &run_id,
            Utc::now(),
        )? {
            StartOutcome::Started => {
                debug!(identity, activity_id = %request.activity_id, "Dispatch started");
                self.spawn(identity.to_string(), request, Vec::new()).map(Some)
            }
            StartOutcome::AlreadyExists(status) => {
                debug!(identity, status = status.as_str(), "Dispatch identity exists; ignoring");
                Ok(None)
            }
        }
    }

    /// Resumes every dispatch left open by a previous daemon run.
    pub fn resume_open(self: &Arc<Self>) -> Result<usize, String> {
        let open = self.journal.list_open(ExecutionKind::Dispatch)?;
        let mut resumed = 0;
        for row in open {
            let request: ActivityRequest = match serde_json::from_value(row.input.clone()) {
                Ok(request) => request,
                Err(err) => {
                    warn!(identity = %row.id, error = %err, "Unreadable dispatch input; failing it");
                    self.journal
                        .fail(&row.id, &format!("unreadable input: {}", err), Utc::now())?;
                    continue;
                }
            };
            let history = self.journal.load_history(&row.id)?;
            self.spawn(row.id, request, history)?;
            resumed += 1;
        }
        if resumed > 0 {
            info!(resumed, "Resumed open dispatches");
        }
        Ok(resumed)
    }

    fn spawn(
        self: &Arc<Self>,
        identity: String,
        request: ActivityRequest,
        history: Vec<HistoryRecord>,
    ) -> Result<JoinHandle<()>, String> {
        let dispatcher = Arc::clone(self);
        thread::Builder::new()
            .name("flow-dispatch".to_string())
            .spawn(move || dispatcher.run(&identity, request, &history))
            .map_err(|err| format!("Failed to spawn dispatch thread: {}", err))
    }

    fn run(&self, identity: &str, mut request: ActivityRequest, history: &[HistoryRecord]) {
        if let Some((session_id, lines)) = output_tail_target(&request) {
            let host = Arc::clone(&self.host);
            let policy = self.policy.clone();
            let timeout = self.output_tail_timeout;
            let tail = self.effect(identity, history, OUTPUT_TAIL_EFFECT, move || {
                call_with_policy("get_output_tail", &policy, timeout, move || {
                    host.get_output_tail(&session_id, lines).map(Value::String)
                })
            });
            match tail {
                Ok(Value::String(tail)) => request.output_tail = Some(tail),
                Ok(_) => {}
                Err(err) => warn!(
                    identity,
                    error = %err,
                    "Output tail unavailable; dispatching without it"
                ),
            }
        }

        let host = Arc::clone(&self.host);
        let policy = self.policy.clone();
        let timeout = self.activity_timeout;
        let payload = request.clone();
        let outcome = self.effect(identity, history, EXECUTE_EFFECT, move || {
            call_with_policy("execute_activity", &policy, timeout, move || {
                host.execute(&payload).map(|_| Value::Null)
            })
        });

        let result = match &outcome {
            Ok(_) => json!({ "activity_ok": true }),
            Err(err) => {
                warn!(
                    identity,
                    activity_id = %request.activity_id,
                    error = %err,
                    "Activity failed after retries"
                );
                json!({ "activity_ok": false, "error": err })
            }
        };

        if let Err(err) = self.journal.complete(identity, &result, Utc::now()) {
            warn!(identity, error = %err, "Failed to close dispatch execution");
        }
    }

    fn effect(
        &self,
        identity: &str,
        history: &[HistoryRecord],
        name: &str,
        perform: impl FnOnce() -> Result<Value, String>,
    ) -> Result<Value, String> {
        if let Some(recorded) = HistoryRecord::find_effect(history, 0, name) {
            debug!(identity, effect = name, "Reusing recorded effect");
            return recorded;
        }
        let result = perform();
        let entry = HistoryEntry::Effect {
            name: name.to_string(),
            signal_seq: 0,
            outcome: EffectOutcome::from_result(&result),
        };
        if let Err(err) = self.journal.append(identity, Utc::now(), &entry) {
            warn!(identity, effect = name, error = %err, "Failed to record effect");
        }
        result
    }
}

/// `(session_id, lines)` when the request asks for terminal output first.
fn output_tail_target(request: &ActivityRequest) -> Option<(String, u32)> {
    if request.activity_id != SEND_TO_TERMINAL {
        return None;
    }
    let include = request
        .config
        .get(INCLUDE_OUTPUT_KEY)
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !include {
        return None;
    }
    let session_id = match request.session_id() {
        Some(session_id) if !session_id.trim().is_empty() => session_id.to_string(),
        _ => {
            warn!(
                event_id = %request.event_id,
                "include_output requested but event has no session id"
            );
            return None;
        }
    };
    let lines = request
        .config
        .get(OUTPUT_LINES_KEY)
        .and_then(Value::as_f64)
        .filter(|lines| *lines >= 1.0)
        .map(|lines| lines.min(f64::from(u32::MAX)) as u32)
        .unwrap_or(DEFAULT_OUTPUT_LINES);
    Some((session_id, lines))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::{HostCall, RecordingHost};
    use crate::journal::ExecutionStatus;
    use flowd_protocol::NormalizedEvent;
    use serde_json::Map;

    fn setup() -> (tempfile::TempDir, Arc<Journal>, Arc<RecordingHost>, Arc<Dispatcher>) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let journal = Arc::new(Journal::new(temp_dir.path().join("journal.db")).unwrap());
        let host = Arc::new(RecordingHost::default());
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&journal),
            host.clone(),
            RetryPolicy {
                initial_interval: Duration::from_millis(1),
                max_interval: Duration::from_millis(2),
                max_attempts: 2,
            },
            Duration::from_secs(2),
            Duration::from_secs(2),
        ));
        (temp_dir, journal, host, dispatcher)
    }

    fn request(activity_id: &str, config: Map<String, Value>) -> ActivityRequest {
        let mut event = NormalizedEvent::new();
        event.insert("type".to_string(), "agent-turn-complete".to_string());
        event.insert("session.id".to_string(), "coder 1".to_string());
        ActivityRequest {
            event_id: "e1".to_string(),
            trigger_id: "t1".to_string(),
            activity_id: activity_id.to_string(),
            event,
            config,
            output_tail: None,
        }
    }

    #[test]
    fn identical_identity_executes_once() {
        let (_dir, journal, host, dispatcher) = setup();
        let first = dispatcher
            .start("flow/e1/t1/toast", request("toast", Map::new()))
            .unwrap();
        let second = dispatcher
            .start("flow/e1/t1/toast", request("toast", Map::new()))
            .unwrap();
        assert!(second.is_none());
        first.expect("first start runs").join().unwrap();

        assert_eq!(host.executed().len(), 1);
        let row = journal.get("flow/e1/t1/toast").unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Completed);
    }

    #[test]
    fn send_to_terminal_fetches_output_tail_first() {
        let (_dir, _journal, host, dispatcher) = setup();
        *host.output_tail.lock().unwrap() = Some(Ok("last lines".to_string()));
        let mut config = Map::new();
        config.insert("message".to_string(), json!("look"));
        config.insert("include_output".to_string(), json!(true));
        config.insert("output_lines".to_string(), json!(12));

        dispatcher
            .start("flow/e1/t1/send_to_terminal", request("send_to_terminal", config))
            .unwrap()
            .unwrap()
            .join()
            .unwrap();

        let calls = host.calls();
        assert_eq!(calls[0], HostCall::OutputTail("coder 1".to_string(), 12));
        let executed = host.executed();
        assert_eq!(executed[0].output_tail.as_deref(), Some("last lines"));
    }

    #[test]
    fn activity_failure_is_isolated() {
        let (_dir, journal, host, dispatcher) = setup();
        host.fail_activities
            .lock()
            .unwrap()
            .insert("webhook".to_string(), "connection refused".to_string());

        dispatcher
            .start("flow/e1/t1/webhook", request("webhook", Map::new()))
            .unwrap()
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(host.executed().len(), 2);
        let row = journal.get("flow/e1/t1/webhook").unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Completed);
        assert_eq!(row.result.unwrap()["activity_ok"], json!(false));
    }

    #[test]
    fn retried_activity_keeps_its_idempotency_key() {
        let (_dir, _journal, host, dispatcher) = setup();
        host.fail_activities
            .lock()
            .unwrap()
            .insert("webhook".to_string(), "503".to_string());

        dispatcher
            .start("flow/e1/t1/webhook", request("webhook", Map::new()))
            .unwrap()
            .unwrap()
            .join()
            .unwrap();

        let keys: Vec<String> = host
            .executed()
            .iter()
            .map(ActivityRequest::idempotency_key)
            .collect();
        assert_eq!(keys, vec!["e1/t1/webhook", "e1/t1/webhook"]);
    }

    #[test]
    fn resumed_dispatch_reuses_recorded_effects() {
        let (_dir, journal, host, dispatcher) = setup();
        let identity = "flow/e1/t1/toast";
        let request = request("toast", Map::new());
        journal
            .start_execution(
                identity,
                ExecutionKind::Dispatch,
                &serde_json::to_value(&request).unwrap(),
                "r1",
                Utc::now(),
            )
            .unwrap();
        journal
            .append(
                identity,
                Utc::now(),
                &HistoryEntry::Effect {
                    name: EXECUTE_EFFECT.to_string(),
                    signal_seq: 0,
                    outcome: EffectOutcome::Completed { value: Value::Null },
                },
            )
            .unwrap();

        assert_eq!(dispatcher.resume_open().unwrap(), 1);
        for _ in 0..200 {
            if journal.get(identity).unwrap().unwrap().status.is_closed() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(journal.get(identity).unwrap().unwrap().status.is_closed());
        assert!(host.executed().is_empty());
    }

    #[test]
    fn output_lines_default_and_integral_floats() {
        let mut config = Map::new();
        config.insert("include_output".to_string(), json!(true));
        let target = output_tail_target(&request("send_to_terminal", config.clone()));
        assert_eq!(target, Some(("coder 1".to_string(), DEFAULT_OUTPUT_LINES)));

        config.insert("output_lines".to_string(), json!(20.0));
        let target = output_tail_target(&request("send_to_terminal", config));
        assert_eq!(target.map(|t| t.1), Some(20));

        assert_eq!(output_tail_target(&request("toast", Map::new())), None);
    }
}
