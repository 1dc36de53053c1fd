//! Seams to the outside world.
//!
//! `ActivityHost` is everything a dispatch or session may do that touches
//! a terminal, the network or the desktop. `LifecycleSink` is where session
//! state changes go so automations can react to them. Both are injected,
//! which lets tests record calls instead of performing them.

use flow_core::{ActivityRequest, WorkflowLifecycleEvent};
use flowd_protocol::{BellEvent, StartSessionParams, TaskEvent};
use tracing::info;

pub trait ActivityHost: Send + Sync {
    /// Performs one activity. Webhook implementations send
    /// `request.idempotency_key()` as the `Idempotency-Key` header.
    fn execute(&self, request: &ActivityRequest) -> Result<(), String>;

    fn get_output_tail(&self, session_id: &str, lines: u32) -> Result<String, String>;

    fn spawn_terminal(&self, session: &StartSessionParams) -> Result<(), String>;

    fn persist_task(&self, session_id: &str, task: &TaskEvent) -> Result<(), String>;

    fn persist_bell(&self, session_id: &str, bell: &BellEvent) -> Result<(), String>;
}

pub trait LifecycleSink: Send + Sync {
    fn emit(&self, event: WorkflowLifecycleEvent);
}

/// Default host for a bare daemon: every call is logged and succeeds.
/// Output tails are empty.
#[derive(Debug, Default)]
pub struct LoggingHost;

impl ActivityHost for LoggingHost {
    fn execute(&self, request: &ActivityRequest) -> Result<(), String> {
        info!(
            activity_id = %request.activity_id,
            trigger_id = %request.trigger_id,
            event_id = %request.event_id,
            idempotency_key = %request.idempotency_key(),
            has_output_tail = request.output_tail.is_some(),
            "Activity dispatched"
        );
        Ok(())
    }

    fn get_output_tail(&self, session_id: &str, lines: u32) -> Result<String, String> {
        info!(session_id, lines, "Output tail requested");
        Ok(String::new())
    }

    fn spawn_terminal(&self, session: &StartSessionParams) -> Result<(), String> {
        info!(
            session_id = %session.session_id,
            agent_id = %session.agent_id,
            cwd = ?session.cwd,
            "Terminal spawn requested"
        );
        Ok(())
    }

    fn persist_task(&self, session_id: &str, task: &TaskEvent) -> Result<(), String> {
        info!(session_id, l1 = %task.l1, l2 = %task.l2, "Task update persisted");
        Ok(())
    }

    fn persist_bell(&self, session_id: &str, bell: &BellEvent) -> Result<(), String> {
        info!(session_id, timestamp = %bell.timestamp, "Bell persisted");
        Ok(())
    }
}
