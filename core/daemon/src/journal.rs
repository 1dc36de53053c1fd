//! SQLite journal backing every durable execution in flowd.
//!
//! Two tables:
//!
//! - `executions`: one row per router, dispatch or session run, keyed by its
//!   deterministic identity. `applied_through` is the highest history seq
//!   whose transition has been fully applied.
//! - `history`: append-only signal and effect entries per execution.
//!
//! Inserting an execution is insert-if-absent, which is what makes dispatch
//! starts idempotent.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    Router,
    Dispatch,
    Session,
}

impl ExecutionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionKind::Router => "router",
            ExecutionKind::Dispatch => "dispatch",
            ExecutionKind::Session => "session",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Open,
    Completed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Open => "open",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Self {
        match value {
            "completed" => ExecutionStatus::Completed,
            "failed" => ExecutionStatus::Failed,
            _ => ExecutionStatus::Open,
        }
    }

    pub fn is_closed(&self) -> bool {
        !matches!(self, ExecutionStatus::Open)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyExists(ExecutionStatus),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRow {
    pub id: String,
    pub kind: String,
    pub status: ExecutionStatus,
    pub run_id: String,
    pub input: Value,
    pub result: Option<Value>,
    pub applied_through: i64,
    pub started_at: String,
    pub updated_at: String,
    pub closed_at: Option<String>,
}

/// One journaled entry. Effects point at the signal whose transition
/// produced them (`0` for effects outside any signal, like a spawn).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
pub enum HistoryEntry {
    Signal {
        name: String,
        payload: Value,
    },
    Effect {
        name: String,
        signal_seq: i64,
        outcome: EffectOutcome,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EffectOutcome {
    Completed { value: Value },
    Failed { error: String },
}

impl EffectOutcome {
    pub fn from_result(result: &Result<Value, String>) -> Self {
        match result {
            Ok(value) => EffectOutcome::Completed {
                value: value.clone(),
            },
            Err(error) => EffectOutcome::Failed {
                error: error.clone(),
            },
        }
    }

    pub fn into_result(self) -> Result<Value, String> {
        match self {
            EffectOutcome::Completed { value } => Ok(value),
            EffectOutcome::Failed { error } => Err(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub seq: i64,
    pub recorded_at: DateTime<Utc>,
    pub entry: HistoryEntry,
}

impl HistoryRecord {
    /// Recorded outcome of effect `name` for the signal at `signal_seq`.
    pub fn find_effect(
        history: &[HistoryRecord],
        signal_seq: i64,
        name: &str,
    ) -> Option<Result<Value, String>> {
        history.iter().find_map(|record| match &record.entry {
            HistoryEntry::Effect {
                name: effect,
                signal_seq: seq,
                outcome,
            } if *seq == signal_seq && effect == name => Some(outcome.clone().into_result()),
            _ => None,
        })
    }
}

pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let journal = Self { path };
        journal.init_schema()?;
        Ok(journal)
    }

    pub fn start_execution(
        &self,
        id: &str,
        kind: ExecutionKind,
        input: &Value,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<StartOutcome, String> {
        let input = serde_json::to_string(input)
            .map_err(|err| format!("Failed to serialize execution input: {}", err))?;
        let now = format_ts(now);
        self.with_connection(|conn| {
            let inserted = conn
                .execute(
                    "INSERT INTO executions \
                        (id, kind, status, run_id, input, applied_through, started_at, updated_at) \
                     VALUES (?1, ?2, 'open', ?3, ?4, 0, ?5, ?5) \
                     ON CONFLICT(id) DO NOTHING",
                    params![id, kind.as_str(), run_id, input, now],
                )
                .map_err(|err| format!("Failed to insert execution: {}", err))?;
            if inserted == 1 {
                return Ok(StartOutcome::Started);
            }
            let status: String = conn
                .query_row(
                    "SELECT status FROM executions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .map_err(|err| format!("Failed to read existing execution: {}", err))?;
            Ok(StartOutcome::AlreadyExists(ExecutionStatus::parse(&status)))
        })
    }

    /// Starts a fresh run under an existing closed identity, discarding the
    /// previous run's history.
    pub fn reopen_execution(
        &self,
        id: &str,
        input: &Value,
        run_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        let input = serde_json::to_string(input)
            .map_err(|err| format!("Failed to serialize execution input: {}", err))?;
        let now = format_ts(now);
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to start reopen transaction: {}", err))?;
            tx.execute("DELETE FROM history WHERE execution_id = ?1", params![id])
                .map_err(|err| format!("Failed to clear history: {}", err))?;
            let updated = tx
                .execute(
                    "UPDATE executions SET status = 'open', run_id = ?2, input = ?3, \
                        result = NULL, applied_through = 0, started_at = ?4, updated_at = ?4, \
                        closed_at = NULL \
                     WHERE id = ?1 AND status != 'open'",
                    params![id, run_id, input, now],
                )
                .map_err(|err| format!("Failed to reopen execution: {}", err))?;
            if updated != 1 {
                return Err(format!("Execution {} is not closed", id));
            }
            tx.commit()
                .map_err(|err| format!("Failed to commit reopen: {}", err))
        })
    }

    pub fn append(
        &self,
        execution_id: &str,
        recorded_at: DateTime<Utc>,
        entry: &HistoryEntry,
    ) -> Result<i64, String> {
        let payload = serde_json::to_string(entry)
            .map_err(|err| format!("Failed to serialize history entry: {}", err))?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO history (execution_id, recorded_at, entry) VALUES (?1, ?2, ?3)",
                params![execution_id, format_ts(recorded_at), payload],
            )
            .map_err(|err| format!("Failed to append history: {}", err))?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn load_history(&self, execution_id: &str) -> Result<Vec<HistoryRecord>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT seq, recorded_at, entry FROM history \
                     WHERE execution_id = ?1 ORDER BY seq ASC",
                )
                .map_err(|err| format!("Failed to prepare history query: {}", err))?;
            let rows = stmt
                .query_map(params![execution_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(|err| format!("Failed to read history rows: {}", err))?;

            let mut records = Vec::new();
            for row in rows {
                let (seq, recorded_at, payload) =
                    row.map_err(|err| format!("Failed to decode history row: {}", err))?;
                let entry: HistoryEntry = match serde_json::from_str(&payload) {
                    Ok(entry) => entry,
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            execution_id,
                            seq,
                            "Skipping malformed history entry"
                        );
                        continue;
                    }
                };
                let recorded_at = parse_rfc3339(&recorded_at)
                    .ok_or_else(|| format!("History entry {} has an invalid timestamp", seq))?;
                records.push(HistoryRecord {
                    seq,
                    recorded_at,
                    entry,
                });
            }
            Ok(records)
        })
    }

    pub fn advance_cursor(&self, execution_id: &str, seq: i64) -> Result<(), String> {
        let now = format_ts(Utc::now());
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE executions SET applied_through = MAX(applied_through, ?2), updated_at = ?3 \
                 WHERE id = ?1",
                params![execution_id, seq, now],
            )
            .map_err(|err| format!("Failed to advance applied cursor: {}", err))?;
            Ok(())
        })
    }

    /// Marks `through_seq` applied, drops every applied history entry and
    /// swaps in the carried-forward input under a new run id, atomically.
    pub fn continue_as_new(
        &self,
        execution_id: &str,
        through_seq: i64,
        input: &Value,
        run_id: &str,
    ) -> Result<usize, String> {
        let input = serde_json::to_string(input)
            .map_err(|err| format!("Failed to serialize execution input: {}", err))?;
        let now = format_ts(Utc::now());
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to start continue-as-new transaction: {}", err))?;
            tx.execute(
                "UPDATE executions SET applied_through = MAX(applied_through, ?2), \
                    input = ?3, run_id = ?4, updated_at = ?5 \
                 WHERE id = ?1",
                params![execution_id, through_seq, input, run_id, now],
            )
            .map_err(|err| format!("Failed to swap execution input: {}", err))?;
            let removed = tx
                .execute(
                    "DELETE FROM history WHERE execution_id = ?1 AND seq <= \
                        (SELECT applied_through FROM executions WHERE id = ?1)",
                    params![execution_id],
                )
                .map_err(|err| format!("Failed to truncate history: {}", err))?;
            tx.commit()
                .map_err(|err| format!("Failed to commit continue-as-new: {}", err))?;
            Ok(removed)
        })
    }

    pub fn complete(&self, id: &str, result: &Value, now: DateTime<Utc>) -> Result<(), String> {
        self.close(id, ExecutionStatus::Completed, result, now)
    }

    pub fn fail(&self, id: &str, error: &str, now: DateTime<Utc>) -> Result<(), String> {
        self.close(
            id,
            ExecutionStatus::Failed,
            &serde_json::json!({ "error": error }),
            now,
        )
    }

    fn close(
        &self,
        id: &str,
        status: ExecutionStatus,
        result: &Value,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        let result = serde_json::to_string(result)
            .map_err(|err| format!("Failed to serialize execution result: {}", err))?;
        let now = format_ts(now);
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE executions SET status = ?2, result = ?3, updated_at = ?4, closed_at = ?4 \
                 WHERE id = ?1 AND status = 'open'",
                params![id, status.as_str(), result, now],
            )
            .map_err(|err| format!("Failed to close execution: {}", err))?;
            Ok(())
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<ExecutionRow>, String> {
        self.with_connection(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS),
                params![id],
                |row| Ok(read_execution_row(row)),
            )
            .optional()
            .map_err(|err| format!("Failed to query execution: {}", err))?
            .transpose()
        })
    }

    pub fn list_open(&self, kind: ExecutionKind) -> Result<Vec<ExecutionRow>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM executions WHERE kind = ?1 AND status = 'open' \
                     ORDER BY started_at ASC, id ASC",
                    EXECUTION_COLUMNS
                ))
                .map_err(|err| format!("Failed to prepare open executions query: {}", err))?;
            let rows = stmt
                .query_map(params![kind.as_str()], |row| Ok(read_execution_row(row)))
                .map_err(|err| format!("Failed to read execution rows: {}", err))?;

            let mut executions = Vec::new();
            for row in rows {
                let row = row.map_err(|err| format!("Failed to decode execution row: {}", err))?;
                executions.push(row?);
            }
            Ok(executions)
        })
    }

    pub fn count_open(&self, kind: ExecutionKind) -> Result<i64, String> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM executions WHERE kind = ?1 AND status = 'open'",
                params![kind.as_str()],
                |row| row.get(0),
            )
            .map_err(|err| format!("Failed to count executions: {}", err))
        })
    }

    /// Deletes closed executions (and their history) closed before `cutoff`.
    pub fn prune_closed(&self, cutoff: DateTime<Utc>) -> Result<usize, String> {
        let cutoff = format_ts(cutoff);
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| format!("Failed to start prune transaction: {}", err))?;
            tx.execute(
                "DELETE FROM history WHERE execution_id IN \
                    (SELECT id FROM executions WHERE status != 'open' AND closed_at < ?1)",
                params![cutoff],
            )
            .map_err(|err| format!("Failed to prune history: {}", err))?;
            let removed = tx
                .execute(
                    "DELETE FROM executions WHERE status != 'open' AND closed_at < ?1",
                    params![cutoff],
                )
                .map_err(|err| format!("Failed to prune executions: {}", err))?;
            tx.commit()
                .map_err(|err| format!("Failed to commit prune: {}", err))?;
            Ok(removed)
        })
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS executions (
                    id TEXT PRIMARY KEY,
                    kind TEXT NOT NULL,
                    status TEXT NOT NULL,
                    run_id TEXT NOT NULL,
                    input TEXT NOT NULL,
                    result TEXT,
                    applied_through INTEGER NOT NULL DEFAULT 0,
                    started_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    closed_at TEXT
                 );
                 CREATE TABLE IF NOT EXISTS history (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    execution_id TEXT NOT NULL,
                    recorded_at TEXT NOT NULL,
                    entry TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS history_execution ON history (execution_id, seq);
                 CREATE INDEX IF NOT EXISTS executions_kind_status ON executions (kind, status);
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create daemon data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}

const EXECUTION_COLUMNS: &str =
    "id, kind, status, run_id, input, result, applied_through, started_at, updated_at, closed_at";

fn read_execution_row(row: &rusqlite::Row<'_>) -> Result<ExecutionRow, String> {
    let get_err = |err: rusqlite::Error| format!("Failed to decode execution column: {}", err);
    let input: String = row.get(4).map_err(get_err)?;
    let result: Option<String> = row.get(5).map_err(get_err)?;
    let status: String = row.get(2).map_err(get_err)?;
    Ok(ExecutionRow {
        id: row.get(0).map_err(get_err)?,
        kind: row.get(1).map_err(get_err)?,
        status: ExecutionStatus::parse(&status),
        run_id: row.get(3).map_err(get_err)?,
        input: serde_json::from_str(&input)
            .map_err(|err| format!("Failed to parse execution input: {}", err))?,
        result: result
            .map(|value| serde_json::from_str(&value))
            .transpose()
            .map_err(|err| format!("Failed to parse execution result: {}", err))?,
        applied_through: row.get(6).map_err(get_err)?,
        started_at: row.get(7).map_err(get_err)?,
        updated_at: row.get(8).map_err(get_err)?,
        closed_at: row.get(9).map_err(get_err)?,
    })
}

/// Fixed-width UTC timestamps so stored values compare correctly as text.
fn format_ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn journal() -> (tempfile::TempDir, Journal) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let journal = Journal::new(temp_dir.path().join("journal.db")).expect("journal");
        (temp_dir, journal)
    }

    fn signal(name: &str) -> HistoryEntry {
        HistoryEntry::Signal {
            name: name.to_string(),
            payload: json!({}),
        }
    }

    #[test]
    fn start_is_insert_if_absent() {
        let (_dir, journal) = journal();
        let now = Utc::now();
        let first = journal
            .start_execution("flow/e/t/a", ExecutionKind::Dispatch, &json!({}), "r1", now)
            .unwrap();
        let second = journal
            .start_execution("flow/e/t/a", ExecutionKind::Dispatch, &json!({}), "r2", now)
            .unwrap();
        assert_eq!(first, StartOutcome::Started);
        assert_eq!(second, StartOutcome::AlreadyExists(ExecutionStatus::Open));
        assert_eq!(journal.get("flow/e/t/a").unwrap().unwrap().run_id, "r1");
    }

    #[test]
    fn history_round_trips_in_order() {
        let (_dir, journal) = journal();
        let now = Utc::now();
        journal
            .start_execution("s1", ExecutionKind::Session, &json!({}), "r1", now)
            .unwrap();
        let a = journal.append("s1", now, &signal("bell")).unwrap();
        let effect = HistoryEntry::Effect {
            name: "output_tail".to_string(),
            signal_seq: a,
            outcome: EffectOutcome::Failed {
                error: "no tty".to_string(),
            },
        };
        journal.append("s1", now, &effect).unwrap();

        let history = journal.load_history("s1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].seq, a);
        assert_eq!(
            HistoryRecord::find_effect(&history, a, "output_tail"),
            Some(Err("no tty".to_string()))
        );
        assert_eq!(HistoryRecord::find_effect(&history, a, "spawn"), None);
    }

    #[test]
    fn continue_as_new_truncates_applied_history_only() {
        let (_dir, journal) = journal();
        let now = Utc::now();
        journal
            .start_execution("router", ExecutionKind::Router, &json!({"v": 1}), "r1", now)
            .unwrap();
        let first = journal.append("router", now, &signal("event")).unwrap();
        let second = journal.append("router", now, &signal("event")).unwrap();
        let pending = journal.append("router", now, &signal("event")).unwrap();

        let removed = journal
            .continue_as_new("router", second, &json!({"v": 2}), "r2")
            .unwrap();
        assert_eq!(removed, 2);

        let row = journal.get("router").unwrap().unwrap();
        assert_eq!(row.input, json!({"v": 2}));
        assert_eq!(row.run_id, "r2");
        assert_eq!(row.applied_through, second);
        let history = journal.load_history("router").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].seq, pending);
        assert!(first < pending);
    }

    #[test]
    fn closed_execution_can_be_reopened_once() {
        let (_dir, journal) = journal();
        let now = Utc::now();
        journal
            .start_execution("s1", ExecutionKind::Session, &json!({}), "r1", now)
            .unwrap();
        journal.append("s1", now, &signal("terminate")).unwrap();
        assert!(journal.reopen_execution("s1", &json!({}), "r2", now).is_err());

        journal.complete("s1", &json!({"ok": true}), now).unwrap();
        assert_eq!(
            journal
                .start_execution("s1", ExecutionKind::Session, &json!({}), "r2", now)
                .unwrap(),
            StartOutcome::AlreadyExists(ExecutionStatus::Completed)
        );
        journal.reopen_execution("s1", &json!({"n": 2}), "r2", now).unwrap();

        let row = journal.get("s1").unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Open);
        assert_eq!(row.result, None);
        assert!(journal.load_history("s1").unwrap().is_empty());
    }

    #[test]
    fn list_open_filters_kind_and_status() {
        let (_dir, journal) = journal();
        let now = Utc::now();
        for id in ["flow/1", "flow/2"] {
            journal
                .start_execution(id, ExecutionKind::Dispatch, &json!({}), "r", now)
                .unwrap();
        }
        journal
            .start_execution("s1", ExecutionKind::Session, &json!({}), "r", now)
            .unwrap();
        journal.complete("flow/1", &json!({}), now).unwrap();

        let open = journal.list_open(ExecutionKind::Dispatch).unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, "flow/2");
        assert_eq!(journal.count_open(ExecutionKind::Session).unwrap(), 1);
    }

    #[test]
    fn prune_removes_only_old_closed_executions() {
        let (_dir, journal) = journal();
        let old = Utc::now() - Duration::hours(48);
        let now = Utc::now();
        journal
            .start_execution("old", ExecutionKind::Dispatch, &json!({}), "r", old)
            .unwrap();
        journal.append("old", old, &signal("x")).unwrap();
        journal.complete("old", &json!({}), old).unwrap();
        journal
            .start_execution("fresh", ExecutionKind::Dispatch, &json!({}), "r", now)
            .unwrap();
        journal.complete("fresh", &json!({}), now).unwrap();
        journal
            .start_execution("open", ExecutionKind::Dispatch, &json!({}), "r", old)
            .unwrap();

        let removed = journal.prune_closed(now - Duration::hours(24)).unwrap();
        assert_eq!(removed, 1);
        assert!(journal.get("old").unwrap().is_none());
        assert!(journal.load_history("old").unwrap().is_empty());
        assert!(journal.get("fresh").unwrap().is_some());
        assert!(journal.get("open").unwrap().is_some());
    }
}
