pub mod assignments;
pub mod audit;
pub mod generator;
pub mod key_types;
mod notify;
pub mod projects;
pub mod properties;
pub mod query;
pub mod tasks;
pub mod users;

pub use assignments::{AssignmentCompletion, AssignmentCreated, NewAssignment, ResetReport};
pub use audit::AuditEntry;
pub use generator::{BatchOutcome, GenerationPlan, GenerationReport, PlannedProject, UploadPlan};
pub use key_types::TermRegistry;
pub use projects::{NewProject, ProjectDeletion};
pub use query::{FilterSet, QueryRows, QueryView, RenderedQuery};
pub use tasks::TaskCompletion;
pub use users::NewUser;

use am_core::{
    AssignmentRecord, ManagerError, ManagerPolicy, NotificationBus, NullSearchIndex,
    ProjectRecord, ProtocolRegistry, SearchIndex, TaskRecord, TracingBus, WorkCalendar,
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::error;

pub const ASSIGNMENT_SCHEMA_VERSION: i64 = 2;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

impl From<StorageError> for ManagerError {
    fn from(err: StorageError) -> Self {
        error!(event = "store_error", error = %err);
        ManagerError::store("database operation failed")
    }
}

/// Process-scoped collaborators and tunables shared by every connection.
#[derive(Clone)]
pub struct StoreContext {
    pub terms: Arc<TermRegistry>,
    pub protocols: ProtocolRegistry,
    pub policy: ManagerPolicy,
    pub calendar: WorkCalendar,
    pub bus: Arc<dyn NotificationBus>,
    pub index: Arc<dyn SearchIndex>,
}

impl Default for StoreContext {
    fn default() -> Self {
        Self {
            terms: Arc::new(TermRegistry::new()),
            protocols: ProtocolRegistry::new(),
            policy: ManagerPolicy::default(),
            calendar: WorkCalendar::default(),
            bus: Arc::new(TracingBus),
            index: Arc::new(NullSearchIndex),
        }
    }
}

impl StoreContext {
    pub fn with_policy(mut self, policy: ManagerPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_calendar(mut self, calendar: WorkCalendar) -> Self {
        self.calendar = calendar;
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn NotificationBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_index(mut self, index: Arc<dyn SearchIndex>) -> Self {
        self.index = index;
        self
    }
}

pub struct AssignmentStore {
    conn: Connection,
    ctx: StoreContext,
}

impl AssignmentStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with(path, StoreContext::default())
    }

    pub fn open_with(path: impl AsRef<Path>, ctx: StoreContext) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        let store = Self { conn, ctx };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::open_in_memory_with(StoreContext::default())
    }

    pub fn open_in_memory_with(ctx: StoreContext) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn, ctx };
        store.migrate()?;
        Ok(store)
    }

    pub fn context(&self) -> &StoreContext {
        &self.ctx
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let mut current = self.schema_version()?;
        if current > ASSIGNMENT_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: ASSIGNMENT_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_assignment_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
            current = 1;
        }

        if current < 2 {
            let sql = include_str!("../migrations/0002_vocabulary.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 2", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Cheap liveness check.
    pub fn ping(&self) -> Result<(), StorageError> {
        self.conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    pub fn project(&self, name_or_id: &str) -> Result<Option<ProjectRecord>, StorageError> {
        load_project(&self.conn, name_or_id)
    }

    pub fn assignment(&self, name_or_id: &str) -> Result<Option<AssignmentRecord>, StorageError> {
        load_assignment(&self.conn, name_or_id)
    }

    pub fn task(&self, task_id: i64) -> Result<Option<TaskRecord>, StorageError> {
        load_task(&self.conn, task_id)
    }

    pub fn assignment_tasks(&self, assignment_id: i64) -> Result<Vec<TaskRecord>, StorageError> {
        load_assignment_tasks(&self.conn, assignment_id)
    }

    pub fn project_tasks(&self, project_id: i64) -> Result<Vec<TaskRecord>, StorageError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM task_vw WHERE project_id = ?1 ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([project_id], task_from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    pub fn unassigned_count(&self, project_id: i64) -> Result<i64, StorageError> {
        Ok(self.conn.query_row(
            "SELECT COUNT(*) FROM task WHERE project_id = ?1 AND assignment_id IS NULL",
            [project_id],
            |row| row.get(0),
        )?)
    }

    /// Tasks sharing a key, across projects.
    pub fn search_tasks(&self, key_type: &str, key_text: &str) -> Result<Vec<TaskRecord>, StorageError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM task_vw WHERE key_type = ?1 AND key_text = ?2 ORDER BY id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([key_type, key_text], task_from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?);
        }
        Ok(tasks)
    }

    /// Clears the cached vocabulary; the next lookup reloads it.
    pub fn reload_terms(&self) {
        self.ctx.terms.reload();
    }
}

pub(crate) fn begin_immediate(conn: &mut Connection) -> Result<Transaction<'_>, StorageError> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

pub(crate) fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| StorageError::Timestamp(err.to_string()))
}

fn timestamp_at(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    parse_timestamp(&raw).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            rusqlite::types::Type::Text,
            Box::new(err),
        )
    })
}

fn optional_timestamp_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|raw| {
        parse_timestamp(&raw).map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                index,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
    })
    .transpose()
}

/// Digits address a row by id, anything else by name.
pub(crate) fn numeric_id(name_or_id: &str) -> Option<i64> {
    let trimmed = name_or_id.trim();
    if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
        trimmed.parse().ok()
    } else {
        None
    }
}

pub(crate) const PROJECT_COLUMNS: &str =
    "id, name, protocol, priority, active, disposition, create_date";

pub(crate) const ASSIGNMENT_COLUMNS: &str = "id, name, project_id, project, protocol, user, \
     disposition, start_date, completion_date, duration, working_duration, create_date";

pub(crate) const TASK_COLUMNS: &str = "id, name, project_id, project, protocol, assignment_id, \
     assignment, key_type_id, key_type, key_text, user, disposition, start_date, completion_date, \
     duration, working_duration, create_date";

pub(crate) fn project_from_row(row: &Row<'_>) -> rusqlite::Result<ProjectRecord> {
    Ok(ProjectRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        protocol: row.get(2)?,
        priority: row.get(3)?,
        active: row.get::<_, i64>(4)? != 0,
        disposition: row.get(5)?,
        create_date: timestamp_at(row, 6)?,
    })
}

pub(crate) fn assignment_from_row(row: &Row<'_>) -> rusqlite::Result<AssignmentRecord> {
    Ok(AssignmentRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        project_id: row.get(2)?,
        project: row.get(3)?,
        protocol: row.get(4)?,
        user: row.get(5)?,
        disposition: row.get(6)?,
        start_date: optional_timestamp_at(row, 7)?,
        completion_date: optional_timestamp_at(row, 8)?,
        duration: row.get(9)?,
        working_duration: row.get(10)?,
        create_date: timestamp_at(row, 11)?,
    })
}

pub(crate) fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    Ok(TaskRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        project_id: row.get(2)?,
        project: row.get(3)?,
        protocol: row.get(4)?,
        assignment_id: row.get(5)?,
        assignment: row.get(6)?,
        key_type_id: row.get(7)?,
        key_type: row.get(8)?,
        key_text: row.get(9)?,
        user: row.get(10)?,
        disposition: row.get(11)?,
        start_date: optional_timestamp_at(row, 12)?,
        completion_date: optional_timestamp_at(row, 13)?,
        duration: row.get(14)?,
        working_duration: row.get(15)?,
        create_date: timestamp_at(row, 16)?,
    })
}

pub(crate) fn load_project(
    conn: &Connection,
    name_or_id: &str,
) -> Result<Option<ProjectRecord>, StorageError> {
    let row = match numeric_id(name_or_id) {
        Some(id) => conn
            .query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM project_vw WHERE id = ?1"),
                [id],
                project_from_row,
            )
            .optional()?,
        None => conn
            .query_row(
                &format!("SELECT {PROJECT_COLUMNS} FROM project_vw WHERE name = ?1"),
                [name_or_id.trim()],
                project_from_row,
            )
            .optional()?,
    };
    Ok(row)
}

pub(crate) fn load_assignment(
    conn: &Connection,
    name_or_id: &str,
) -> Result<Option<AssignmentRecord>, StorageError> {
    let row = match numeric_id(name_or_id) {
        Some(id) => conn
            .query_row(
                &format!("SELECT {ASSIGNMENT_COLUMNS} FROM assignment_vw WHERE id = ?1"),
                [id],
                assignment_from_row,
            )
            .optional()?,
        None => conn
            .query_row(
                &format!("SELECT {ASSIGNMENT_COLUMNS} FROM assignment_vw WHERE name = ?1"),
                [name_or_id.trim()],
                assignment_from_row,
            )
            .optional()?,
    };
    Ok(row)
}

pub(crate) fn load_task(conn: &Connection, task_id: i64) -> Result<Option<TaskRecord>, StorageError> {
    Ok(conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM task_vw WHERE id = ?1"),
            [task_id],
            task_from_row,
        )
        .optional()?)
}

pub(crate) fn load_assignment_tasks(
    conn: &Connection,
    assignment_id: i64,
) -> Result<Vec<TaskRecord>, StorageError> {
    let sql = format!("SELECT {TASK_COLUMNS} FROM task_vw WHERE assignment_id = ?1 ORDER BY id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([assignment_id], task_from_row)?;
    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row?);
    }
    Ok(tasks)
}

pub(crate) fn require_project(conn: &Connection, name_or_id: &str) -> Result<ProjectRecord, ManagerError> {
    load_project(conn, name_or_id)?
        .ok_or_else(|| ManagerError::not_found(format!("Project {} does not exist", name_or_id.trim())))
}

pub(crate) fn require_assignment(
    conn: &Connection,
    name_or_id: &str,
) -> Result<AssignmentRecord, ManagerError> {
    load_assignment(conn, name_or_id)?.ok_or_else(|| {
        ManagerError::not_found(format!("Assignment {} does not exist", name_or_id.trim()))
    })
}

pub(crate) fn require_task(conn: &Connection, task_id: i64) -> Result<TaskRecord, ManagerError> {
    load_task(conn, task_id)?
        .ok_or_else(|| ManagerError::not_found(format!("Task {task_id} does not exist")))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use am_core::{Actor, CandidateKey, Protocol, RecordingBus};
    use chrono::TimeZone;

    pub fn ts(hour: u32, minute: u32) -> DateTime<Utc> {
        // Tuesday, a working day.
        Utc.with_ymd_and_hms(2024, 3, 12, hour, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    pub fn recording_store() -> (AssignmentStore, Arc<RecordingBus>) {
        let bus = Arc::new(RecordingBus::new());
        let calendar = WorkCalendar::new(
            chrono::NaiveTime::from_hms_opt(6, 0, 0).expect("open"),
            chrono::NaiveTime::from_hms_opt(18, 0, 0).expect("close"),
            am_core::HolidayCalendar::us_federal(),
            Some(chrono::FixedOffset::east_opt(0).expect("utc")),
        )
        .expect("calendar");
        let ctx = StoreContext::default()
            .with_bus(bus.clone())
            .with_calendar(calendar);
        let store = AssignmentStore::open_in_memory_with(ctx).expect("open db");
        (store, bus)
    }

    pub fn admin() -> Actor {
        Actor::new("admin", ["admin", "cleave", "orphan_link", "todo"])
    }

    pub fn worker() -> Actor {
        Actor::new("userx", ["cleave", "orphan_link", "todo"])
    }

    pub fn candidates(keys: &[&str]) -> Vec<CandidateKey> {
        keys.iter().map(|key| CandidateKey::new(*key)).collect()
    }

    /// Creates users, a cleave project and its tasks.
    pub fn seeded_project(store: &mut AssignmentStore, name: &str, keys: &[&str]) -> ProjectRecord {
        for actor in [admin(), worker()] {
            if store.actor(&actor.user).expect("actor lookup").is_none() {
                store
                    .add_user(&NewUser::named(&actor.user))
                    .expect("add user");
                store
                    .grant_permissions(&actor.user, actor.permissions.iter().map(String::as_str))
                    .expect("grant");
            }
        }
        let project = store
            .create_project(
                &NewProject::new(Protocol::Cleave, name),
                &admin(),
                ts(8, 0),
            )
            .expect("create project");
        store
            .generate_tasks(
                project.id,
                &candidates(keys),
                Protocol::Cleave.definition(),
                false,
                "admin",
                ts(8, 0),
            )
            .expect("generate tasks");
        project
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn migration_creates_lifecycle_tables() {
        let db = AssignmentStore::open_in_memory().expect("open db");
        assert_eq!(db.schema_version().expect("version"), ASSIGNMENT_SCHEMA_VERSION);

        for table in [
            "cv",
            "cv_term",
            "users",
            "user_permission",
            "project",
            "project_property",
            "assignment",
            "assignment_property",
            "task",
            "task_property",
            "task_audit",
        ] {
            let exists: i64 = db
                .conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .expect("sqlite_master");
            assert_eq!(exists, 1, "missing table {table}");
        }
    }

    #[test]
    fn reopening_a_file_keeps_schema_and_rows() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let mut store = AssignmentStore::open(file.path()).expect("open db");
            seeded_project(&mut store, "demo", &["1", "2"]);
        }
        let store = AssignmentStore::open(file.path()).expect("reopen db");
        let project = store.project("demo").expect("load").expect("project");
        assert_eq!(store.project_tasks(project.id).expect("tasks").len(), 2);
        assert!(store.ping().is_ok());
    }

    #[test]
    fn newer_schema_is_rejected() {
        let db = AssignmentStore::open_in_memory().expect("open db");
        db.conn
            .execute("PRAGMA user_version = 99", [])
            .expect("bump version");
        match db.migrate() {
            Err(StorageError::UnsupportedSchemaVersion { found, supported }) => {
                assert_eq!(found, 99);
                assert_eq!(supported, ASSIGNMENT_SCHEMA_VERSION);
            }
            other => panic!("unexpected migrate result: {other:?}"),
        }
    }

    #[test]
    fn lookups_accept_names_or_ids() {
        let (mut store, _bus) = recording_store();
        let project = seeded_project(&mut store, "demo", &["7"]);
        let by_id = store
            .project(&project.id.to_string())
            .expect("load")
            .expect("by id");
        assert_eq!(by_id.name, "demo");
        assert_eq!(by_id.priority, 10);
        assert!(by_id.active);
        assert!(store.project("nope").expect("load").is_none());

        let tasks = store.search_tasks("body_id", "7").expect("search");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].name, format!("{}.7", project.id));
    }

    #[test]
    fn store_errors_are_sanitised() {
        let err: ManagerError =
            StorageError::Sqlite(rusqlite::Error::QueryReturnedNoRows).into();
        assert_eq!(err, ManagerError::store("database operation failed"));
        assert_eq!(err.status_code(), 500);
    }
}
