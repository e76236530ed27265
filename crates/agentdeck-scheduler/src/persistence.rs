//! SQLite-backed persistence for triggers, work items and the firing log.

use agentdeck_core::error::{DeckError, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::store::TriggerStore;
use crate::trigger::{
    FiringLogEntry, FiringStatus, NewWorkItem, Priority, Trigger, TriggerType, WorkItem,
    WorkItemId, WorkItemStatus,
};

/// SQLite store shared by the scheduler and the operator CLI.
///
/// The `TriggerStore` methods run on tokio's blocking pool, so a caller's
/// timeout still fires while SQLite waits on a locked database.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

/// Shared SELECT column list for trigger queries.
const TRIGGER_SELECT: &str = "SELECT id, agent_id, workspace_id, trigger_type, cron_expression, task_title_template, task_description_template, enabled, last_fired_at, created_at FROM triggers";

const WORK_ITEM_SELECT: &str = "SELECT id, workspace_id, title, description, assignee_agent_id, creator_agent_id, trigger_id, fire_key, status, priority, scheduled_at, created_at FROM work_items";

/// Fixed-width UTC timestamps so that string comparison orders them.
fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn row_to_trigger(row: &rusqlite::Row) -> rusqlite::Result<Trigger> {
    let trigger_type: String = row.get(3)?;
    let last_fired_at: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;
    Ok(Trigger {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        workspace_id: row.get(2)?,
        trigger_type: TriggerType::from_str_value(&trigger_type),
        cron_expression: row.get(4)?,
        task_title_template: row.get(5)?,
        task_description_template: row.get(6)?,
        enabled: row.get::<_, i32>(7)? != 0,
        last_fired_at: last_fired_at.as_deref().and_then(parse_ts),
        created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
    })
}

fn row_to_work_item(row: &rusqlite::Row) -> rusqlite::Result<WorkItem> {
    let status: String = row.get(8)?;
    let priority: String = row.get(9)?;
    let scheduled_at: String = row.get(10)?;
    let created_at: String = row.get(11)?;
    Ok(WorkItem {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        assignee_agent_id: row.get(4)?,
        creator_agent_id: row.get(5)?,
        trigger_id: row.get(6)?,
        fire_key: row.get(7)?,
        status: WorkItemStatus::from_str_value(&status),
        priority: Priority::from_str_value(&priority),
        scheduled_at: parse_ts(&scheduled_at).unwrap_or_else(Utc::now),
        created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
    })
}

fn row_to_firing(row: &rusqlite::Row) -> rusqlite::Result<FiringLogEntry> {
    let status: String = row.get(3)?;
    let created_at: String = row.get(5)?;
    Ok(FiringLogEntry {
        id: row.get(0)?,
        trigger_id: row.get(1)?,
        work_item_id: row.get(2)?,
        status: FiringStatus::from_str_value(&status),
        error: row.get(4)?,
        created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
    })
}

fn db_err(context: &str, e: rusqlite::Error) -> DeckError {
    DeckError::Store(format!("{context}: {e}"))
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|e| DeckError::Store(format!("DB lock poisoned: {e}")))
}

fn is_unique_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

impl SqliteStore {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|e| db_err("DB open", e))?;

        // WAL lets the dashboard read while the scheduler writes.
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| db_err("DB pragma", e))?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open a throwaway in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| db_err("DB open", e))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        lock(&self.conn)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, context: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&*lock(&conn)?))
            .await
            .map_err(|e| DeckError::Store(format!("{context}: blocking task failed: {e}")))?
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS triggers (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                trigger_type TEXT NOT NULL DEFAULT 'cron',   -- 'cron', 'webhook', 'manual'
                cron_expression TEXT,
                task_title_template TEXT NOT NULL DEFAULT '',
                task_description_template TEXT NOT NULL DEFAULT '',
                enabled INTEGER NOT NULL DEFAULT 1,
                last_fired_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_triggers_due
                ON triggers (trigger_type, enabled);

            CREATE TABLE IF NOT EXISTS work_items (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                assignee_agent_id TEXT NOT NULL,
                creator_agent_id TEXT NOT NULL,
                trigger_id TEXT,
                fire_key TEXT UNIQUE,                        -- trigger id + matched minute
                status TEXT NOT NULL DEFAULT 'pending',
                priority TEXT NOT NULL DEFAULT 'medium',
                scheduled_at TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_work_items_workspace
                ON work_items (workspace_id, created_at);

            CREATE TABLE IF NOT EXISTS trigger_firings (
                id TEXT PRIMARY KEY,
                trigger_id TEXT NOT NULL,
                work_item_id TEXT,
                status TEXT NOT NULL,                        -- 'fired', 'failed'
                error TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_trigger_firings_trigger
                ON trigger_firings (trigger_id, created_at);
         ",
            )
            .map_err(|e| db_err("Migration", e))?;
        Ok(())
    }

    // ─── Triggers ──────────────────────────────────────────

    /// Insert or replace a trigger definition.
    pub fn create_trigger(&self, trigger: &Trigger) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO triggers
                 (id, agent_id, workspace_id, trigger_type, cron_expression, task_title_template,
                  task_description_template, enabled, last_fired_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    trigger.id,
                    trigger.agent_id,
                    trigger.workspace_id,
                    trigger.trigger_type.as_str(),
                    trigger.cron_expression,
                    trigger.task_title_template,
                    trigger.task_description_template,
                    trigger.enabled as i32,
                    trigger.last_fired_at.as_ref().map(ts),
                    ts(&trigger.created_at),
                ],
            )
            .map_err(|e| db_err("Save trigger", e))?;
        Ok(())
    }

    pub fn get_trigger(&self, id: &str) -> Result<Option<Trigger>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("{TRIGGER_SELECT} WHERE id = ?1"),
            params![id],
            row_to_trigger,
        )
        .optional()
        .map_err(|e| db_err("Get trigger", e))
    }

    pub fn list_triggers(&self) -> Result<Vec<Trigger>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("{TRIGGER_SELECT} ORDER BY created_at"))
            .map_err(|e| db_err("List triggers", e))?;
        let rows = stmt
            .query_map([], row_to_trigger)
            .map_err(|e| db_err("List triggers", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("List triggers", e))
    }

    pub fn set_trigger_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let changed = self
            .conn()?
            .execute(
                "UPDATE triggers SET enabled = ?1 WHERE id = ?2",
                params![enabled as i32, id],
            )
            .map_err(|e| db_err("Update trigger", e))?;
        if changed == 0 {
            return Err(DeckError::TriggerNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Remove a trigger definition. Its work items and firing history stay.
    pub fn delete_trigger(&self, id: &str) -> Result<()> {
        let changed = self
            .conn()?
            .execute("DELETE FROM triggers WHERE id = ?1", params![id])
            .map_err(|e| db_err("Delete trigger", e))?;
        if changed == 0 {
            return Err(DeckError::TriggerNotFound(id.to_string()));
        }
        Ok(())
    }

    // ─── Work items & history ──────────────────────────────

    /// Most recent work items of a workspace.
    pub fn list_work_items(&self, workspace_id: &str, limit: usize) -> Result<Vec<WorkItem>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "{WORK_ITEM_SELECT} WHERE workspace_id = ?1 ORDER BY created_at DESC LIMIT ?2"
            ))
            .map_err(|e| db_err("List work items", e))?;
        let rows = stmt
            .query_map(params![workspace_id, limit as i64], row_to_work_item)
            .map_err(|e| db_err("List work items", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("List work items", e))
    }

    /// Trigger history, newest first.
    pub fn recent_firings(&self, trigger_id: &str, limit: usize) -> Result<Vec<FiringLogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, trigger_id, work_item_id, status, error, created_at
                 FROM trigger_firings WHERE trigger_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            )
            .map_err(|e| db_err("List firings", e))?;
        let rows = stmt
            .query_map(params![trigger_id, limit as i64], row_to_firing)
            .map_err(|e| db_err("List firings", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("List firings", e))
    }
}

#[async_trait]
impl TriggerStore for SqliteStore {
    async fn list_due_candidates(&self) -> Result<Vec<Trigger>> {
        self.blocking("List candidates", |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "{TRIGGER_SELECT}
                     WHERE trigger_type = 'cron' AND enabled = 1 AND cron_expression IS NOT NULL
                     ORDER BY created_at"
                ))
                .map_err(|e| db_err("List candidates", e))?;
            let rows = stmt
                .query_map([], row_to_trigger)
                .map_err(|e| db_err("List candidates", e))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| db_err("List candidates", e))
        })
        .await
    }

    async fn insert_work_item(&self, item: &NewWorkItem) -> Result<WorkItemId> {
        let item = item.clone();
        self.blocking("Insert work item", move |conn| {
            let id = uuid::Uuid::new_v4().to_string();
            let result = conn.execute(
                "INSERT INTO work_items
                 (id, workspace_id, title, description, assignee_agent_id, creator_agent_id,
                  trigger_id, fire_key, status, priority, scheduled_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    id,
                    item.workspace_id,
                    item.title,
                    item.description,
                    item.assignee_agent_id,
                    item.creator_agent_id,
                    item.trigger_id,
                    item.fire_key,
                    item.status.as_str(),
                    item.priority.as_str(),
                    ts(&item.scheduled_at),
                    ts(&Utc::now()),
                ],
            );
            match result {
                Ok(_) => Ok(id),
                Err(e) if is_unique_violation(&e) => Err(DeckError::Duplicate(format!(
                    "work item for {} already exists",
                    item.fire_key
                ))),
                Err(e) => Err(db_err("Insert work item", e)),
            }
        })
        .await
    }

    async fn update_last_fired(&self, trigger_id: &str, at: DateTime<Utc>) -> Result<()> {
        let trigger_id = trigger_id.to_string();
        let at = ts(&at);
        self.blocking("Update last_fired_at", move |conn| {
            let changed = conn
                .execute(
                    "UPDATE triggers SET last_fired_at = ?1
                     WHERE id = ?2 AND (last_fired_at IS NULL OR last_fired_at < ?1)",
                    params![at, trigger_id],
                )
                .map_err(|e| db_err("Update last_fired_at", e))?;
            if changed == 0 {
                let exists: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM triggers WHERE id = ?1",
                        params![trigger_id],
                        |r| r.get(0),
                    )
                    .map_err(|e| db_err("Update last_fired_at", e))?;
                if exists == 0 {
                    return Err(DeckError::TriggerNotFound(trigger_id));
                }
            }
            Ok(())
        })
        .await
    }

    async fn append_firing_log(&self, entry: &FiringLogEntry) -> Result<()> {
        let entry = entry.clone();
        self.blocking("Append firing log", move |conn| {
            conn.execute(
                "INSERT INTO trigger_firings (id, trigger_id, work_item_id, status, error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.id,
                    entry.trigger_id,
                    entry.work_item_id,
                    entry.status.as_str(),
                    entry.error,
                    ts(&entry.created_at),
                ],
            )
            .map_err(|e| db_err("Append firing log", e))?;
            Ok(())
        })
        .await
    }
}
