//! Append-only audit trail. Every lifecycle transition writes its record
//! through [`append_audit`] inside the transition's own transaction.

use crate::{format_timestamp, parse_timestamp, AssignmentStore, StorageError};
use am_core::{AuditRecord, TaskRecord};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry<'a> {
    pub task_id: Option<i64>,
    pub project_id: i64,
    pub assignment_id: Option<i64>,
    pub key_type_id: Option<i64>,
    pub key_text: Option<&'a str>,
    pub disposition: &'a str,
    pub note: Option<&'a str>,
    pub user: &'a str,
}

impl<'a> AuditEntry<'a> {
    /// Entry describing a transition of `task` within `assignment_id`.
    pub fn for_task(
        task: &'a TaskRecord,
        assignment_id: Option<i64>,
        disposition: &'a str,
        user: &'a str,
    ) -> Self {
        Self {
            task_id: Some(task.id),
            project_id: task.project_id,
            assignment_id,
            key_type_id: Some(task.key_type_id),
            key_text: Some(task.key_text.as_str()),
            disposition,
            note: None,
            user,
        }
    }

    pub fn with_note(mut self, note: &'a str) -> Self {
        self.note = Some(note);
        self
    }
}

pub(crate) fn append_audit(
    conn: &Connection,
    entry: &AuditEntry<'_>,
    now: DateTime<Utc>,
) -> Result<i64, StorageError> {
    conn.execute(
        "
        INSERT INTO task_audit (
            task_id,
            project_id,
            assignment_id,
            key_type_id,
            key_text,
            disposition,
            note,
            user,
            create_date
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ",
        params![
            entry.task_id,
            entry.project_id,
            entry.assignment_id,
            entry.key_type_id,
            entry.key_text,
            entry.disposition,
            entry.note,
            entry.user,
            format_timestamp(now),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

const AUDIT_COLUMNS: &str = "id, task_id, project_id, assignment_id, key_type, key_text, \
     disposition, note, user, create_date";

fn audit_from_row(row: &Row<'_>) -> rusqlite::Result<AuditRecord> {
    let created: String = row.get(9)?;
    let create_date = parse_timestamp(&created).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(9, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(AuditRecord {
        id: row.get(0)?,
        task_id: row.get(1)?,
        project_id: row.get(2)?,
        assignment_id: row.get(3)?,
        key_type: row.get(4)?,
        key_text: row.get(5)?,
        disposition: row.get(6)?,
        note: row.get(7)?,
        user: row.get(8)?,
        create_date,
    })
}

impl AssignmentStore {
    /// Audit records for one task, oldest first.
    pub fn task_audit_trail(&self, task_id: i64) -> Result<Vec<AuditRecord>, StorageError> {
        self.audit_where("task_id = ?1", task_id)
    }

    /// Audit records written against an assignment, oldest first.
    pub fn assignment_audit_trail(&self, assignment_id: i64) -> Result<Vec<AuditRecord>, StorageError> {
        self.audit_where("assignment_id = ?1", assignment_id)
    }

    pub fn project_audit_trail(&self, project_id: i64) -> Result<Vec<AuditRecord>, StorageError> {
        self.audit_where("project_id = ?1", project_id)
    }

    fn audit_where(&self, predicate: &str, id: i64) -> Result<Vec<AuditRecord>, StorageError> {
        let sql = format!("SELECT {AUDIT_COLUMNS} FROM task_audit_vw WHERE {predicate} ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([id], audit_from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}
