//! Session state machine.
//!
//! Pure transitions over [`SessionWorkflowState`]: every input a transition
//! needs (the signal's recorded time, a fetched output tail) is handed in,
//! and every side effect comes back out as a [`SessionCommand`]. Replaying
//! the same journal therefore rebuilds the same state.
//!
//! ```text
//!            bell                resume(continue|handoff|"")
//!   running ──────────▶ paused ────────────────────────────▶ running
//!      │                  │
//!      │ terminate        │ resume(abort) / terminate
//!      ▼                  ▼
//!   stopped ◀─────────────┘          (terminal)
//! ```

use chrono::{DateTime, Utc};
use flow_core::normalize::format_timestamp;
use flow_core::WorkflowEventKind;
use flowd_protocol::{
    BellEvent, SessionResult, SessionSignal, SessionStatus, SessionWorkflowState,
    StartSessionParams, TaskEvent,
};
use serde_json::{Map, Value};
use tracing::warn;

pub const RESUME_ABORT: &str = "abort";
pub const RESUME_CONTINUE: &str = "continue";
pub const RESUME_HANDOFF: &str = "handoff";

/// Inputs resolved for one transition before it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalContext {
    pub recorded_at: DateTime<Utc>,
    /// Fetched terminal output for a bell without inline context. `None`
    /// when nothing was fetched or the fetch failed.
    pub output_tail: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    PersistTask(TaskEvent),
    PersistBell(BellEvent),
    Emit {
        kind: WorkflowEventKind,
        context: Option<String>,
        data: Map<String, Value>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionMachine {
    state: SessionWorkflowState,
    event_count: u32,
    completion_context: Option<String>,
}

impl SessionMachine {
    pub fn start(params: &StartSessionParams, started_at: DateTime<Utc>) -> Self {
        Self {
            state: SessionWorkflowState {
                session_id: params.session_id.clone(),
                agent_id: params.agent_id.clone(),
                current_l1: params.l1.clone(),
                current_l2: params.l2.clone(),
                status: SessionStatus::Running,
                start_time: format_timestamp(started_at),
                bell_events: Vec::new(),
                task_events: Vec::new(),
            },
            event_count: 0,
            completion_context: None,
        }
    }

    pub fn state(&self) -> &SessionWorkflowState {
        &self.state
    }

    pub fn event_count(&self) -> u32 {
        self.event_count
    }

    pub fn is_stopped(&self) -> bool {
        self.state.status.is_terminal()
    }

    pub fn completion_context(&self) -> Option<&str> {
        self.completion_context.as_deref()
    }

    /// Whether applying `signal` always stops the session.
    pub fn is_stop_signal(signal: &SessionSignal) -> bool {
        match signal {
            SessionSignal::Terminate { .. } => true,
            SessionSignal::Resume { action } => action.trim().eq_ignore_ascii_case(RESUME_ABORT),
            _ => false,
        }
    }

    /// Whether `signal` needs recent terminal output before it can apply.
    pub fn needs_output_tail(signal: &SessionSignal) -> bool {
        match signal {
            SessionSignal::Bell { context, .. } => context
                .as_deref()
                .map(|context| context.trim().is_empty())
                .unwrap_or(true),
            _ => false,
        }
    }

    pub fn apply(&mut self, signal: &SessionSignal, ctx: &SignalContext) -> Vec<SessionCommand> {
        if self.is_stopped() {
            return Vec::new();
        }
        self.event_count += 1;
        let now = format_timestamp(ctx.recorded_at);

        match signal {
            SessionSignal::UpdateTask { l1, l2 } => {
                let task = TaskEvent {
                    timestamp: now,
                    l1: l1.clone(),
                    l2: l2.clone(),
                };
                self.state.current_l1 = l1.clone();
                self.state.current_l2 = l2.clone();
                self.state.task_events.push(task.clone());
                vec![SessionCommand::PersistTask(task)]
            }
            SessionSignal::Bell { timestamp, context } => {
                let context = context
                    .clone()
                    .filter(|context| !context.trim().is_empty())
                    .or_else(|| ctx.output_tail.clone())
                    .unwrap_or_default();
                let bell = BellEvent {
                    timestamp: timestamp.clone().unwrap_or(now),
                    context: context.clone(),
                };
                self.state.bell_events.push(bell.clone());
                self.state.status = SessionStatus::Paused;
                vec![
                    SessionCommand::PersistBell(bell),
                    emit(WorkflowEventKind::WorkflowPaused, non_empty(context)),
                ]
            }
            SessionSignal::Notify {
                event_type,
                event_id,
            } => {
                let mut data = Map::new();
                if let Some(event_type) = event_type.as_deref().filter(|v| !v.is_empty()) {
                    data.insert("event_type".to_string(), Value::from(event_type));
                }
                if let Some(event_id) = event_id.as_deref().filter(|v| !v.is_empty()) {
                    data.insert("event_id".to_string(), Value::from(event_id));
                }
                vec![SessionCommand::Emit {
                    kind: WorkflowEventKind::NotifyEvent,
                    context: None,
                    data,
                }]
            }
            SessionSignal::Resume { action } => {
                let action = action.trim().to_lowercase();
                if action == RESUME_ABORT {
                    self.stop(Some(action));
                    return Vec::new();
                }
                if !matches!(action.as_str(), "" | RESUME_CONTINUE | RESUME_HANDOFF) {
                    warn!(
                        session_id = %self.state.session_id,
                        action = %action,
                        "Unknown resume action; treating as continue"
                    );
                }
                self.state.status = SessionStatus::Running;
                vec![emit(WorkflowEventKind::WorkflowResumed, non_empty(action))]
            }
            SessionSignal::Terminate { reason } => {
                self.stop(reason.clone().and_then(non_empty));
                Vec::new()
            }
        }
    }

    fn stop(&mut self, context: Option<String>) {
        self.state.status = SessionStatus::Stopped;
        self.completion_context = context;
    }

    pub fn result(&self, end_time: DateTime<Utc>) -> SessionResult {
        SessionResult {
            session_id: self.state.session_id.clone(),
            end_time: format_timestamp(end_time),
            final_status: self.state.status,
            event_count: self.event_count,
        }
    }
}

fn emit(kind: WorkflowEventKind, context: Option<String>) -> SessionCommand {
    SessionCommand::Emit {
        kind,
        context,
        data: Map::new(),
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn params() -> StartSessionParams {
        StartSessionParams {
            session_id: "coder 1".to_string(),
            agent_id: "coder".to_string(),
            l1: "setup".to_string(),
            l2: String::new(),
            cwd: None,
        }
    }

    fn ctx(offset_secs: i64) -> SignalContext {
        SignalContext {
            recorded_at: DateTime::parse_from_rfc3339("2026-03-01T10:00:00Z")
                .unwrap()
                .with_timezone(&Utc)
                + Duration::seconds(offset_secs),
            output_tail: None,
        }
    }

    fn kinds(commands: &[SessionCommand]) -> Vec<WorkflowEventKind> {
        commands
            .iter()
            .filter_map(|command| match command {
                SessionCommand::Emit { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn bell_pause_resume_terminate() {
        let mut machine = SessionMachine::start(&params(), ctx(0).recorded_at);

        let commands = machine.apply(
            &SessionSignal::UpdateTask {
                l1: "implement".to_string(),
                l2: "parser".to_string(),
            },
            &ctx(1),
        );
        assert!(matches!(commands[0], SessionCommand::PersistTask(_)));
        assert_eq!(machine.state().status, SessionStatus::Running);
        assert_eq!(machine.state().current_l1, "implement");

        let commands = machine.apply(
            &SessionSignal::Bell {
                timestamp: None,
                context: Some("x".to_string()),
            },
            &ctx(2),
        );
        assert_eq!(kinds(&commands), vec![WorkflowEventKind::WorkflowPaused]);
        assert_eq!(machine.state().status, SessionStatus::Paused);

        let commands = machine.apply(
            &SessionSignal::Resume {
                action: "continue".to_string(),
            },
            &ctx(3),
        );
        assert_eq!(kinds(&commands), vec![WorkflowEventKind::WorkflowResumed]);
        assert_eq!(machine.state().status, SessionStatus::Running);

        machine.apply(
            &SessionSignal::Terminate {
                reason: Some("done".to_string()),
            },
            &ctx(4),
        );
        let result = machine.result(ctx(4).recorded_at);
        assert_eq!(result.final_status, SessionStatus::Stopped);
        assert_eq!(result.event_count, 4);
        assert_eq!(machine.state().bell_events.len(), 1);
        assert_eq!(machine.state().bell_events[0].context, "x");
        assert_eq!(machine.completion_context(), Some("done"));
    }

    #[test]
    fn abort_stops_without_running_again() {
        let mut machine = SessionMachine::start(&params(), ctx(0).recorded_at);
        machine.apply(
            &SessionSignal::Bell {
                timestamp: None,
                context: Some("stuck".to_string()),
            },
            &ctx(1),
        );
        let commands = machine.apply(
            &SessionSignal::Resume {
                action: "abort".to_string(),
            },
            &ctx(2),
        );
        assert!(kinds(&commands).is_empty());
        assert_eq!(machine.state().status, SessionStatus::Stopped);
        assert_eq!(machine.completion_context(), Some("abort"));
    }

    #[test]
    fn bell_without_context_uses_output_tail() {
        let signal = SessionSignal::Bell {
            timestamp: Some("2026-03-01T09:59:00Z".to_string()),
            context: None,
        };
        assert!(SessionMachine::needs_output_tail(&signal));

        let mut machine = SessionMachine::start(&params(), ctx(0).recorded_at);
        let mut context = ctx(1);
        context.output_tail = Some("$ cargo test\nok".to_string());
        machine.apply(&signal, &context);
        let bell = &machine.state().bell_events[0];
        assert_eq!(bell.context, "$ cargo test\nok");
        assert_eq!(bell.timestamp, "2026-03-01T09:59:00Z");

        // Failed fetch: context stays empty.
        let mut machine = SessionMachine::start(&params(), ctx(0).recorded_at);
        machine.apply(&signal, &ctx(1));
        assert_eq!(machine.state().bell_events[0].context, "");
        assert_eq!(machine.state().status, SessionStatus::Paused);
    }

    #[test]
    fn unknown_resume_action_is_continue() {
        let mut machine = SessionMachine::start(&params(), ctx(0).recorded_at);
        let commands = machine.apply(
            &SessionSignal::Resume {
                action: "sideways".to_string(),
            },
            &ctx(1),
        );
        assert_eq!(kinds(&commands), vec![WorkflowEventKind::WorkflowResumed]);
        assert_eq!(machine.state().status, SessionStatus::Running);
    }

    #[test]
    fn notify_keeps_status_and_carries_data() {
        let mut machine = SessionMachine::start(&params(), ctx(0).recorded_at);
        let commands = machine.apply(
            &SessionSignal::Notify {
                event_type: Some("plan-new".to_string()),
                event_id: None,
            },
            &ctx(1),
        );
        match &commands[0] {
            SessionCommand::Emit { kind, data, .. } => {
                assert_eq!(*kind, WorkflowEventKind::NotifyEvent);
                assert_eq!(data["event_type"], "plan-new");
                assert!(!data.contains_key("event_id"));
            }
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(machine.state().status, SessionStatus::Running);
    }

    #[test]
    fn stopped_machine_ignores_signals() {
        let mut machine = SessionMachine::start(&params(), ctx(0).recorded_at);
        machine.apply(&SessionSignal::Terminate { reason: None }, &ctx(1));
        let commands = machine.apply(
            &SessionSignal::UpdateTask {
                l1: "late".to_string(),
                l2: String::new(),
            },
            &ctx(2),
        );
        assert!(commands.is_empty());
        assert_eq!(machine.event_count(), 1);
        assert_eq!(machine.completion_context(), None);
    }

    #[test]
    fn stop_signals_are_terminate_and_abort() {
        assert!(SessionMachine::is_stop_signal(&SessionSignal::Terminate {
            reason: None
        }));
        assert!(SessionMachine::is_stop_signal(&SessionSignal::Resume {
            action: " Abort ".to_string()
        }));
        assert!(!SessionMachine::is_stop_signal(&SessionSignal::Resume {
            action: "continue".to_string()
        }));
        assert!(!SessionMachine::is_stop_signal(&SessionSignal::Bell {
            timestamp: None,
            context: None
        }));
    }

    #[test]
    fn timestamps_come_from_recorded_time() {
        let mut machine = SessionMachine::start(&params(), ctx(0).recorded_at);
        machine.apply(
            &SessionSignal::UpdateTask {
                l1: "a".to_string(),
                l2: String::new(),
            },
            &ctx(5),
        );
        assert_eq!(
            machine.state().task_events[0].timestamp,
            format_timestamp(ctx(5).recorded_at)
        );
        assert_eq!(machine.state().start_time, format_timestamp(ctx(0).recorded_at));
    }
}
