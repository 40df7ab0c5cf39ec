//! Assignment lifecycle: claim, start, complete, reset, reassign, close out
//! and delete. Every transition runs in one `BEGIN IMMEDIATE` unit of work;
//! notifications are published only after it commits.

use crate::audit::{append_audit, AuditEntry};
use crate::notify::Outbox;
use crate::properties::{delete_properties, load_properties, upsert_properties};
use crate::tasks::{complete_task_tx, start_task_tx};
use crate::users::select_user;
use crate::{
    begin_immediate, format_timestamp, load_assignment, load_assignment_tasks, require_assignment,
    require_project, task_from_row, AssignmentStore, StorageError, StoreContext, TASK_COLUMNS,
};
use am_core::protocols::typed_property_value;
use am_core::{
    default_assignment_name, working_duration, Actor, AssignmentRecord, ManagerError,
    ProjectRecord, PropertyOwner, TaskRecord, AUDIT_ASSIGNED, AUDIT_REASSIGNED, AUDIT_RESET,
    AUDIT_UNASSIGNED, DISPOSITION_COMPLETE, DISPOSITION_IN_PROGRESS,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

const SEARCH_INDEX_PATTERNS: [&str; 2] = ["assignment_start-*", "assignment_complete-*"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewAssignment {
    pub project: String,
    pub name: Option<String>,
    pub user: Option<String>,
    pub tasks: Option<usize>,
    pub start: bool,
    pub properties: BTreeMap<String, String>,
}

impl NewAssignment {
    pub fn for_project(project: &str) -> Self {
        Self {
            project: project.to_string(),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn for_user(mut self, user: &str) -> Self {
        self.user = Some(user.to_string());
        self
    }

    pub fn with_tasks(mut self, tasks: usize) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn started(mut self) -> Self {
        self.start = true;
        self
    }

    pub fn with_property(mut self, name: &str, value: &str) -> Self {
        self.properties.insert(name.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignmentCreated {
    pub assignment: AssignmentRecord,
    pub tasks: usize,
    /// Tasks requested but not available; non-zero only under the partial policy.
    pub shortfall: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AssignmentCompletion {
    Completed {
        assignment: AssignmentRecord,
        project_completed: bool,
    },
    Incomplete {
        remaining: i64,
    },
}

impl AssignmentCompletion {
    pub fn is_completed(&self) -> bool {
        matches!(self, AssignmentCompletion::Completed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub assignment: AssignmentRecord,
    pub purged: u64,
}

/// Non-admins may only act on their own assignments and tasks.
pub(crate) fn require_owner(actor: &Actor, owner: Option<&str>, action: &str) -> Result<(), ManagerError> {
    if actor.is_admin() || owner == Some(actor.user.as_str()) {
        Ok(())
    } else {
        Err(ManagerError::validation(format!("You don't have permission to {action}")))
    }
}

/// Inserts an empty assignment row. Names are globally unique.
pub(crate) fn insert_assignment(
    conn: &Connection,
    project: &ProjectRecord,
    name: &str,
    user: &str,
    now: DateTime<Utc>,
) -> Result<i64, ManagerError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ManagerError::validation("Assignment name is required"));
    }
    if load_assignment(conn, name)?.is_some() {
        return Err(ManagerError::conflict(format!("Assignment {name} already exists")));
    }
    conn.execute(
        "INSERT INTO assignment (name, project_id, user, create_date) VALUES (?1, ?2, ?3, ?4)",
        params![name, project.id, user, format_timestamp(now)],
    )
    .map_err(StorageError::from)?;
    Ok(conn.last_insert_rowid())
}

fn count(conn: &Connection, sql: &str, id: i64) -> Result<i64, StorageError> {
    Ok(conn.query_row(sql, [id], |row| row.get(0))?)
}

fn open_task_count(conn: &Connection, assignment_id: i64) -> Result<i64, StorageError> {
    count(
        conn,
        "SELECT COUNT(*) FROM task WHERE assignment_id = ?1 AND completion_date IS NULL",
        assignment_id,
    )
}

fn started_task_count(conn: &Connection, assignment_id: i64) -> Result<i64, StorageError> {
    count(
        conn,
        "SELECT COUNT(*) FROM task WHERE assignment_id = ?1 AND start_date IS NOT NULL",
        assignment_id,
    )
}

/// Claims up to `wanted` unassigned tasks in id order. A claim is a
/// conditional update; a lost race refetches instead of double claiming.
fn claim_tasks(
    conn: &Connection,
    project_id: i64,
    assignment_id: i64,
    user: &str,
    wanted: usize,
    now: DateTime<Utc>,
) -> Result<Vec<TaskRecord>, StorageError> {
    let select = format!(
        "SELECT {TASK_COLUMNS} FROM task_vw \
         WHERE project_id = ?1 AND assignment_id IS NULL ORDER BY id LIMIT ?2"
    );
    let mut claimed = Vec::with_capacity(wanted);
    while claimed.len() < wanted {
        let remaining = (wanted - claimed.len()) as i64;
        let batch = {
            let mut stmt = conn.prepare(&select)?;
            let rows = stmt.query_map(params![project_id, remaining], task_from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        if batch.is_empty() {
            break;
        }
        for task in batch {
            let changes = conn.execute(
                "UPDATE task SET assignment_id = ?1, user = ?2 WHERE id = ?3 AND assignment_id IS NULL",
                params![assignment_id, user, task.id],
            )?;
            if changes == 0 {
                debug!(event = "task_claim_lost", task_id = task.id, assignment_id);
                continue;
            }
            append_audit(conn, &AuditEntry::for_task(&task, Some(assignment_id), AUDIT_ASSIGNED, user), now)?;
            claimed.push(task);
        }
    }
    Ok(claimed)
}

pub(crate) fn start_assignment_tx(
    conn: &Connection,
    assignment: &AssignmentRecord,
    now: DateTime<Utc>,
    outbox: &mut Outbox,
) -> Result<(), ManagerError> {
    if assignment.start_date.is_some() {
        return Err(ManagerError::conflict(format!(
            "Assignment {} was already started",
            assignment.name
        )));
    }
    let changes = conn
        .execute(
            "UPDATE assignment SET start_date = ?1, disposition = ?2 WHERE id = ?3 AND start_date IS NULL",
            params![format_timestamp(now), DISPOSITION_IN_PROGRESS, assignment.id],
        )
        .map_err(StorageError::from)?;
    if changes == 0 {
        return Err(ManagerError::conflict(format!(
            "Assignment {} was already started",
            assignment.name
        )));
    }
    conn.execute(
        "UPDATE project SET disposition = ?1 WHERE id = ?2",
        params![DISPOSITION_IN_PROGRESS, assignment.project_id],
    )
    .map_err(StorageError::from)?;
    outbox.assignment_started(assignment, now);
    outbox.row_change("assignment", "update", assignment.id, 1);
    Ok(())
}

pub(crate) fn complete_assignment_tx(
    conn: &Connection,
    ctx: &StoreContext,
    assignment: &AssignmentRecord,
    allow_incomplete: bool,
    now: DateTime<Utc>,
    outbox: &mut Outbox,
) -> Result<AssignmentCompletion, ManagerError> {
    if assignment.completion_date.is_some() {
        return Err(ManagerError::conflict(format!(
            "Assignment {} was already completed",
            assignment.name
        )));
    }
    let start = assignment.start_date.ok_or_else(|| {
        ManagerError::conflict(format!("Assignment {} was not started", assignment.name))
    })?;
    let remaining = open_task_count(conn, assignment.id)?;
    if remaining > 0 {
        if allow_incomplete {
            return Ok(AssignmentCompletion::Incomplete { remaining });
        }
        return Err(ManagerError::conflict(format!(
            "Assignment {} has {remaining} incomplete task(s)",
            assignment.name
        )));
    }

    let duration = (now - start).num_seconds().max(0);
    let working = working_duration(&ctx.calendar, start, now);
    conn.execute(
        "
        UPDATE assignment
        SET completion_date = ?1, duration = ?2, working_duration = ?3, disposition = ?4
        WHERE id = ?5 AND completion_date IS NULL
        ",
        params![
            format_timestamp(now),
            duration,
            working,
            DISPOSITION_COMPLETE,
            assignment.id
        ],
    )
    .map_err(StorageError::from)?;

    let project_open = count(
        conn,
        "SELECT COUNT(*) FROM task WHERE project_id = ?1 AND completion_date IS NULL",
        assignment.project_id,
    )?;
    let project_completed = project_open == 0;
    if project_completed {
        conn.execute(
            "UPDATE project SET disposition = ?1 WHERE id = ?2",
            params![DISPOSITION_COMPLETE, assignment.project_id],
        )
        .map_err(StorageError::from)?;
        outbox.row_change("project", "update", assignment.project_id, 1);
    }
    outbox.assignment_completed(assignment, start, now, duration, working);
    outbox.row_change("assignment", "update", assignment.id, 1);

    Ok(AssignmentCompletion::Completed {
        assignment: require_assignment(conn, &assignment.id.to_string())?,
        project_completed,
    })
}

impl AssignmentStore {
    /// Creates an assignment and claims tasks for it from the project's
    /// unassigned pool.
    pub fn create_assignment(
        &mut self,
        request: &NewAssignment,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<AssignmentCreated, ManagerError> {
        let tx = begin_immediate(&mut self.conn)?;
        let project = require_project(&tx, &request.project)?;
        if !project.active {
            return Err(ManagerError::conflict(format!(
                "Project {} is not active",
                project.name
            )));
        }
        let user = select_user(&tx, &project.protocol, request.user.as_deref(), actor)?;
        let definition = self.ctx.protocols.lookup(&project.protocol)?;
        let wanted = request.tasks.unwrap_or(definition.num_tasks);
        if wanted == 0 {
            return Err(ManagerError::validation("Number of tasks must be positive"));
        }

        let available = count(
            &tx,
            "SELECT COUNT(*) FROM task WHERE project_id = ?1 AND assignment_id IS NULL",
            project.id,
        )? as usize;
        if available == 0 {
            return Err(ManagerError::conflict(format!(
                "There are no unassigned tasks in project {}",
                project.name
            )));
        }
        if available < wanted && !self.ctx.policy.allow_partial_assignments {
            return Err(ManagerError::conflict(format!(
                "Project {} has only {available} unassigned task(s), {wanted} requested",
                project.name
            )));
        }

        let name = match request.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => default_assignment_name(&project.name),
        };
        let assignment_id = insert_assignment(&tx, &project, &name, &user, now)?;
        upsert_properties(
            &tx,
            &self.ctx.terms,
            PropertyOwner::Assignment,
            assignment_id,
            &request.properties,
            now,
        )?;
        let claimed = claim_tasks(&tx, project.id, assignment_id, &user, wanted, now)?;
        if claimed.is_empty()
            || (claimed.len() < wanted && !self.ctx.policy.allow_partial_assignments)
        {
            return Err(ManagerError::conflict(format!(
                "Could not claim {wanted} task(s) from project {}",
                project.name
            )));
        }

        let mut outbox = Outbox::new();
        outbox.row_change("assignment", "insert", assignment_id, 1);
        outbox.row_change("task", "update", assignment_id, claimed.len());
        if request.start {
            let created = require_assignment(&tx, &assignment_id.to_string())?;
            start_assignment_tx(&tx, &created, now, &mut outbox)?;
        }
        let assignment = require_assignment(&tx, &assignment_id.to_string())?;
        tx.commit().map_err(StorageError::from)?;

        info!(
            event = "assignment_created",
            assignment_id,
            project = %project.name,
            user = %user,
            tasks = claimed.len()
        );
        outbox.flush(&self.ctx, &actor.user, now);
        Ok(AssignmentCreated {
            assignment,
            tasks: claimed.len(),
            shortfall: wanted - claimed.len(),
        })
    }

    pub fn start_assignment(
        &mut self,
        name_or_id: &str,
        actor: &Actor,
        properties: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<AssignmentRecord, ManagerError> {
        let tx = begin_immediate(&mut self.conn)?;
        let assignment = require_assignment(&tx, name_or_id)?;
        require_owner(actor, Some(&assignment.user), "start this assignment")?;
        let mut outbox = Outbox::new();
        start_assignment_tx(&tx, &assignment, now, &mut outbox)?;
        upsert_properties(&tx, &self.ctx.terms, PropertyOwner::Assignment, assignment.id, properties, now)?;
        let started = require_assignment(&tx, &assignment.id.to_string())?;
        tx.commit().map_err(StorageError::from)?;

        info!(event = "assignment_started", assignment_id = assignment.id, user = %actor.user);
        outbox.flush(&self.ctx, &actor.user, now);
        Ok(started)
    }

    /// Completes an assignment once every task is complete. With
    /// `allow_incomplete` an assignment with open tasks is reported, not rejected.
    pub fn complete_assignment(
        &mut self,
        name_or_id: &str,
        allow_incomplete: bool,
        actor: &Actor,
        properties: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<AssignmentCompletion, ManagerError> {
        let tx = begin_immediate(&mut self.conn)?;
        let assignment = require_assignment(&tx, name_or_id)?;
        require_owner(actor, Some(&assignment.user), "complete this assignment")?;
        let mut outbox = Outbox::new();
        let outcome =
            complete_assignment_tx(&tx, &self.ctx, &assignment, allow_incomplete, now, &mut outbox)?;
        if outcome.is_completed() {
            upsert_properties(&tx, &self.ctx.terms, PropertyOwner::Assignment, assignment.id, properties, now)?;
        }
        tx.commit().map_err(StorageError::from)?;

        match &outcome {
            AssignmentCompletion::Completed { project_completed, .. } => info!(
                event = "assignment_completed",
                assignment_id = assignment.id,
                project_completed = *project_completed,
                user = %actor.user
            ),
            AssignmentCompletion::Incomplete { remaining } => info!(
                event = "assignment_incomplete",
                assignment_id = assignment.id,
                remaining = *remaining
            ),
        }
        outbox.flush(&self.ctx, &actor.user, now);
        Ok(outcome)
    }

    /// Returns a started assignment to the created state. Refused once any
    /// task has started.
    pub fn reset_assignment(
        &mut self,
        name_or_id: &str,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<ResetReport, ManagerError> {
        let tx = begin_immediate(&mut self.conn)?;
        let assignment = require_assignment(&tx, name_or_id)?;
        require_owner(actor, Some(&assignment.user), "reset this assignment")?;
        if assignment.start_date.is_none() {
            return Err(ManagerError::conflict(format!(
                "Assignment {} was not started",
                assignment.name
            )));
        }
        let started = started_task_count(&tx, assignment.id)?;
        if started > 0 {
            return Err(ManagerError::conflict(format!(
                "Assignment {} has {started} started task(s) and cannot be reset",
                assignment.name
            )));
        }
        tx.execute(
            "
            UPDATE assignment
            SET start_date = NULL, completion_date = NULL, duration = NULL,
                working_duration = NULL, disposition = NULL
            WHERE id = ?1
            ",
            [assignment.id],
        )
        .map_err(StorageError::from)?;
        append_audit(
            &tx,
            &AuditEntry {
                task_id: None,
                project_id: assignment.project_id,
                assignment_id: Some(assignment.id),
                key_type_id: None,
                key_text: None,
                disposition: AUDIT_RESET,
                note: None,
                user: &actor.user,
            },
            now,
        )?;
        let reset = require_assignment(&tx, &assignment.id.to_string())?;
        tx.commit().map_err(StorageError::from)?;

        let mut purged = 0;
        for pattern in SEARCH_INDEX_PATTERNS {
            match self.ctx.index.purge_assignment(pattern, assignment.id) {
                Ok(removed) => purged += removed,
                Err(err) => warn!(
                    event = "search_index_purge_failed",
                    assignment_id = assignment.id,
                    index = pattern,
                    error = %err
                ),
            }
        }
        info!(event = "assignment_reset", assignment_id = assignment.id, purged, user = %actor.user);
        let mut outbox = Outbox::new();
        outbox.row_change("assignment", "update", assignment.id, 1);
        outbox.flush(&self.ctx, &actor.user, now);
        Ok(ResetReport {
            assignment: reset,
            purged,
        })
    }

    /// Moves an assignment and its open tasks to another user.
    pub fn reassign_assignment(
        &mut self,
        name_or_id: &str,
        new_user: &str,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<AssignmentRecord, ManagerError> {
        actor.require_admin("reassign assignments")?;
        let tx = begin_immediate(&mut self.conn)?;
        let assignment = require_assignment(&tx, name_or_id)?;
        if assignment.completion_date.is_some() {
            return Err(ManagerError::conflict(format!(
                "Assignment {} is already complete",
                assignment.name
            )));
        }
        let project = require_project(&tx, &assignment.project_id.to_string())?;
        let user = select_user(&tx, &project.protocol, Some(new_user), actor)?;
        tx.execute(
            "UPDATE assignment SET user = ?1 WHERE id = ?2",
            params![user, assignment.id],
        )
        .map_err(StorageError::from)?;

        let note = format!("Reassigned to {user}");
        let mut moved = 0;
        for task in load_assignment_tasks(&tx, assignment.id)? {
            if task.completion_date.is_some() {
                continue;
            }
            tx.execute("UPDATE task SET user = ?1 WHERE id = ?2", params![user, task.id])
                .map_err(StorageError::from)?;
            append_audit(
                &tx,
                &AuditEntry::for_task(&task, Some(assignment.id), AUDIT_REASSIGNED, &actor.user)
                    .with_note(&note),
                now,
            )?;
            moved += 1;
        }
        let reassigned = require_assignment(&tx, &assignment.id.to_string())?;
        tx.commit().map_err(StorageError::from)?;

        info!(
            event = "assignment_reassigned",
            assignment_id = assignment.id,
            from = %assignment.user,
            to = %user,
            tasks = moved
        );
        let mut outbox = Outbox::new();
        outbox.row_change("assignment", "update", assignment.id, 1);
        outbox.row_change("task", "update", assignment.id, moved);
        outbox.flush(&self.ctx, &actor.user, now);
        Ok(reassigned)
    }

    /// Starts and completes every open task in id order, then completes the
    /// assignment. Used to record work that was finished outside the system.
    pub fn close_out(
        &mut self,
        name_or_id: &str,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<AssignmentRecord, ManagerError> {
        actor.require_admin("close out assignments")?;
        let tx = begin_immediate(&mut self.conn)?;
        let mut assignment = require_assignment(&tx, name_or_id)?;
        if assignment.completion_date.is_some() {
            return Err(ManagerError::conflict(format!(
                "Assignment {} was already completed",
                assignment.name
            )));
        }
        let mut outbox = Outbox::new();
        if assignment.start_date.is_none() {
            start_assignment_tx(&tx, &assignment, now, &mut outbox)?;
            assignment = require_assignment(&tx, &assignment.id.to_string())?;
        }
        for task in load_assignment_tasks(&tx, assignment.id)? {
            if task.start_date.is_none() {
                start_task_tx(&tx, &self.ctx, &task, &actor.user, None, now, &mut outbox)?;
            }
            if task.completion_date.is_none() {
                let task = crate::require_task(&tx, task.id)?;
                complete_task_tx(&tx, &self.ctx, &task, &actor.user, None, now, &mut outbox)?;
            }
        }
        let outcome = complete_assignment_tx(&tx, &self.ctx, &assignment, false, now, &mut outbox)?;
        tx.commit().map_err(StorageError::from)?;

        info!(event = "assignment_closed_out", assignment_id = assignment.id, user = %actor.user);
        outbox.flush(&self.ctx, &actor.user, now);
        match outcome {
            AssignmentCompletion::Completed { assignment, .. } => Ok(assignment),
            AssignmentCompletion::Incomplete { remaining } => Err(ManagerError::conflict(format!(
                "Assignment {} has {remaining} incomplete task(s)",
                assignment.name
            ))),
        }
    }

    /// Deletes an assignment nobody has started work on; its tasks return to
    /// the unassigned pool. Returns the number of tasks released.
    pub fn delete_assignment(
        &mut self,
        name_or_id: &str,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<usize, ManagerError> {
        let tx = begin_immediate(&mut self.conn)?;
        let assignment = require_assignment(&tx, name_or_id)?;
        require_owner(actor, Some(&assignment.user), "delete this assignment")?;
        let started = started_task_count(&tx, assignment.id)?;
        if started > 0 || assignment.completion_date.is_some() {
            return Err(ManagerError::conflict(format!(
                "Assignment {} has started tasks and cannot be deleted",
                assignment.name
            )));
        }
        let tasks = load_assignment_tasks(&tx, assignment.id)?;
        for task in &tasks {
            tx.execute(
                "UPDATE task SET assignment_id = NULL, user = NULL WHERE id = ?1",
                [task.id],
            )
            .map_err(StorageError::from)?;
            append_audit(
                &tx,
                &AuditEntry::for_task(task, Some(assignment.id), AUDIT_UNASSIGNED, &actor.user),
                now,
            )?;
        }
        delete_properties(&tx, PropertyOwner::Assignment, assignment.id)?;
        tx.execute("DELETE FROM assignment WHERE id = ?1", [assignment.id])
            .map_err(StorageError::from)?;
        tx.commit().map_err(StorageError::from)?;

        info!(
            event = "assignment_deleted",
            assignment_id = assignment.id,
            released = tasks.len(),
            user = %actor.user
        );
        let mut outbox = Outbox::new();
        outbox.row_change("assignment", "delete", assignment.id, 1);
        outbox.row_change("task", "update", assignment.id, tasks.len());
        outbox.flush(&self.ctx, &actor.user, now);
        Ok(tasks.len())
    }

    /// Task list for client tools: key plus typed task properties.
    pub fn assignment_tasks_json(&self, name_or_id: &str) -> Result<Value, ManagerError> {
        let assignment = require_assignment(&self.conn, name_or_id)?;
        let mut list = Vec::new();
        for task in load_assignment_tasks(&self.conn, assignment.id)? {
            let mut entry = Map::new();
            entry.insert("assignment_manager_task_id".to_string(), json!(task.id));
            entry.insert(task.key_type.clone(), json!(task.key_text));
            for (name, value) in load_properties(&self.conn, PropertyOwner::Task, task.id)? {
                let typed = typed_property_value(&name, &value);
                entry.insert(name, typed);
            }
            list.push(Value::Object(entry));
        }
        let mut result = json!({
            "assignment": assignment.name,
            "protocol": assignment.protocol,
            "task list": list,
        });
        if assignment.protocol == "cell_type_validation" {
            result["file type"] = json!("Neu3 task list");
            result["file version"] = json!("1");
            result["ID"] = json!("1");
        }
        Ok(result)
    }
}
