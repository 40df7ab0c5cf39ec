use crate::assignments::{complete_assignment_tx, require_owner, start_assignment_tx, AssignmentCompletion};
use crate::audit::{append_audit, AuditEntry};
use crate::key_types::DISPOSITION_CV;
use crate::notify::Outbox;
use crate::properties::upsert_properties;
use crate::{
    begin_immediate, format_timestamp, require_assignment, require_project, require_task,
    AssignmentStore, StorageError, StoreContext,
};
use am_core::{
    working_duration, Actor, ManagerError, PropertyOwner, TaskRecord, DISPOSITION_COMPLETE,
    DISPOSITION_IN_PROGRESS,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskCompletion {
    pub task: TaskRecord,
    pub assignment_completed: bool,
    pub project_completed: bool,
}

fn checked_disposition<'a>(
    conn: &Connection,
    ctx: &StoreContext,
    requested: Option<&'a str>,
    default: &'a str,
) -> Result<&'a str, ManagerError> {
    let disposition = requested.map(str::trim).filter(|d| !d.is_empty()).unwrap_or(default);
    if !ctx.terms.is_valid_term(conn, DISPOSITION_CV, disposition)? {
        return Err(ManagerError::validation(format!(
            "{disposition} is not a valid disposition"
        )));
    }
    Ok(disposition)
}

/// Starts one task, starting its assignment first when needed.
pub(crate) fn start_task_tx(
    conn: &Connection,
    ctx: &StoreContext,
    task: &TaskRecord,
    user: &str,
    disposition: Option<&str>,
    now: DateTime<Utc>,
    outbox: &mut Outbox,
) -> Result<(), ManagerError> {
    let project = require_project(conn, &task.project_id.to_string())?;
    if !project.active {
        return Err(ManagerError::conflict(format!(
            "Project {} is not active",
            project.name
        )));
    }
    let assignment_id = task
        .assignment_id
        .ok_or_else(|| ManagerError::conflict(format!("Task {} is not assigned", task.id)))?;
    if task.start_date.is_some() {
        return Err(ManagerError::conflict(format!("Task {} was already started", task.id)));
    }
    let assignment = require_assignment(conn, &assignment_id.to_string())?;
    if assignment.completion_date.is_some() {
        return Err(ManagerError::conflict(format!(
            "Assignment {} was already completed",
            assignment.name
        )));
    }
    if assignment.start_date.is_none() {
        start_assignment_tx(conn, &assignment, now, outbox)?;
    }

    let disposition = checked_disposition(conn, ctx, disposition, DISPOSITION_IN_PROGRESS)?;
    let changes = conn
        .execute(
            "UPDATE task SET start_date = ?1, disposition = ?2 WHERE id = ?3 AND start_date IS NULL",
            params![format_timestamp(now), disposition, task.id],
        )
        .map_err(StorageError::from)?;
    if changes == 0 {
        return Err(ManagerError::conflict(format!("Task {} was already started", task.id)));
    }
    append_audit(
        conn,
        &AuditEntry::for_task(task, Some(assignment_id), disposition, user),
        now,
    )?;
    outbox.row_change("task", "update", task.id, 1);
    Ok(())
}

pub(crate) fn complete_task_tx(
    conn: &Connection,
    ctx: &StoreContext,
    task: &TaskRecord,
    user: &str,
    disposition: Option<&str>,
    now: DateTime<Utc>,
    outbox: &mut Outbox,
) -> Result<(), ManagerError> {
    let start = task
        .start_date
        .ok_or_else(|| ManagerError::conflict(format!("Task {} was not started", task.id)))?;
    if task.completion_date.is_some() {
        return Err(ManagerError::conflict(format!("Task {} was already completed", task.id)));
    }
    let disposition = checked_disposition(conn, ctx, disposition, DISPOSITION_COMPLETE)?;
    let duration = (now - start).num_seconds().max(0);
    let working = working_duration(&ctx.calendar, start, now);
    let changes = conn
        .execute(
            "
            UPDATE task
            SET completion_date = ?1, duration = ?2, working_duration = ?3, disposition = ?4
            WHERE id = ?5 AND completion_date IS NULL
            ",
            params![format_timestamp(now), duration, working, disposition, task.id],
        )
        .map_err(StorageError::from)?;
    if changes == 0 {
        return Err(ManagerError::conflict(format!("Task {} was already completed", task.id)));
    }
    append_audit(
        conn,
        &AuditEntry::for_task(task, task.assignment_id, disposition, user),
        now,
    )?;
    outbox.row_change("task", "update", task.id, 1);
    Ok(())
}

impl AssignmentStore {
    pub fn start_task(
        &mut self,
        task_id: i64,
        actor: &Actor,
        disposition: Option<&str>,
        properties: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<TaskRecord, ManagerError> {
        let tx = begin_immediate(&mut self.conn)?;
        let task = require_task(&tx, task_id)?;
        require_owner(actor, task.user.as_deref(), "start this task")?;
        let mut outbox = Outbox::new();
        start_task_tx(&tx, &self.ctx, &task, &actor.user, disposition, now, &mut outbox)?;
        upsert_properties(&tx, &self.ctx.terms, PropertyOwner::Task, task_id, properties, now)?;
        let started = require_task(&tx, task_id)?;
        tx.commit().map_err(StorageError::from)?;

        info!(event = "task_started", task_id, assignment_id = ?task.assignment_id, user = %actor.user);
        outbox.flush(&self.ctx, &actor.user, now);
        Ok(started)
    }

    /// Completes a task. When it was the assignment's last open task the
    /// assignment completes too; an assignment that cannot close yet never
    /// fails the task.
    pub fn complete_task(
        &mut self,
        task_id: i64,
        actor: &Actor,
        disposition: Option<&str>,
        properties: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<TaskCompletion, ManagerError> {
        let tx = begin_immediate(&mut self.conn)?;
        let task = require_task(&tx, task_id)?;
        require_owner(actor, task.user.as_deref(), "complete this task")?;
        let mut outbox = Outbox::new();
        complete_task_tx(&tx, &self.ctx, &task, &actor.user, disposition, now, &mut outbox)?;
        upsert_properties(&tx, &self.ctx.terms, PropertyOwner::Task, task_id, properties, now)?;

        let mut assignment_completed = false;
        let mut project_completed = false;
        if let Some(assignment_id) = task.assignment_id {
            let assignment = require_assignment(&tx, &assignment_id.to_string())?;
            match complete_assignment_tx(&tx, &self.ctx, &assignment, true, now, &mut outbox) {
                Ok(AssignmentCompletion::Completed { project_completed: project, .. }) => {
                    assignment_completed = true;
                    project_completed = project;
                }
                Ok(AssignmentCompletion::Incomplete { remaining }) => {
                    debug!(event = "assignment_still_open", assignment_id, remaining);
                }
                Err(ManagerError::Conflict(reason)) => {
                    debug!(event = "assignment_completion_skipped", assignment_id, reason = %reason);
                }
                Err(err) => return Err(err),
            }
        }
        let completed = require_task(&tx, task_id)?;
        tx.commit().map_err(StorageError::from)?;

        info!(
            event = "task_completed",
            task_id,
            disposition = ?completed.disposition,
            assignment_completed,
            project_completed,
            user = %actor.user
        );
        outbox.flush(&self.ctx, &actor.user, now);
        Ok(TaskCompletion {
            task: completed,
            assignment_completed,
            project_completed,
        })
    }

    pub fn update_task_properties(
        &mut self,
        task_id: i64,
        actor: &Actor,
        properties: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<usize, ManagerError> {
        let tx = begin_immediate(&mut self.conn)?;
        let task = require_task(&tx, task_id)?;
        require_owner(actor, task.user.as_deref(), "update this task")?;
        let written = upsert_properties(&tx, &self.ctx.terms, PropertyOwner::Task, task_id, properties, now)?;
        tx.commit().map_err(StorageError::from)?;

        let mut outbox = Outbox::new();
        outbox.row_change("task_property", "update", task_id, written);
        outbox.flush(&self.ctx, &actor.user, now);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use crate::NewAssignment;
    use am_core::{AssignmentState, TaskState, TOPIC_ASSIGNMENT_COMPLETE};

    fn no_props() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn assigned(store: &mut AssignmentStore, keys: &[&str], count: usize) -> Vec<TaskRecord> {
        seeded_project(store, "demo", keys);
        let created = store
            .create_assignment(&NewAssignment::for_project("demo").named("A1").with_tasks(count), &worker(), ts(9, 0))
            .expect("create");
        store.assignment_tasks(created.assignment.id).expect("tasks")
    }

    #[test]
    fn starting_a_task_starts_its_assignment_first() {
        let (mut store, bus) = recording_store();
        let tasks = assigned(&mut store, &["1", "2"], 2);
        let started = store
            .start_task(tasks[0].id, &worker(), None, &no_props(), ts(9, 15))
            .expect("start");
        assert_eq!(started.state(), TaskState::Started);
        assert_eq!(started.disposition.as_deref(), Some(DISPOSITION_IN_PROGRESS));

        let assignment = store.assignment("A1").expect("load").expect("assignment");
        assert_eq!(assignment.state(), AssignmentState::Started);
        assert_eq!(assignment.start_date, Some(ts(9, 15)));
        assert_eq!(bus.topic(am_core::TOPIC_ASSIGNMENT_START).len(), 1);

        let err = store
            .start_task(tasks[0].id, &worker(), None, &no_props(), ts(9, 16))
            .expect_err("already started");
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn start_requires_an_assignment_and_an_active_project() {
        let (mut store, _bus) = recording_store();
        let tasks = assigned(&mut store, &["1", "2"], 1);
        let project_tasks = store.project_tasks(tasks[0].project_id).expect("tasks");
        let pooled = project_tasks
            .iter()
            .find(|task| task.assignment_id.is_none())
            .expect("unassigned task");
        let err = store
            .start_task(pooled.id, &admin(), None, &no_props(), ts(9, 10))
            .expect_err("unassigned");
        assert_eq!(err, ManagerError::conflict(format!("Task {} is not assigned", pooled.id)));

        store
            .set_project_active("demo", false, &admin(), ts(9, 11))
            .expect("deactivate");
        let err = store
            .start_task(tasks[0].id, &worker(), None, &no_props(), ts(9, 12))
            .expect_err("inactive project");
        assert_eq!(err, ManagerError::conflict("Project demo is not active"));
        assert!(store.task(tasks[0].id).expect("load").expect("task").start_date.is_none());
    }

    #[test]
    fn only_the_owner_or_an_admin_may_work_a_task() {
        let (mut store, _bus) = recording_store();
        let tasks = assigned(&mut store, &["1"], 1);
        let stranger = Actor::new("other", ["cleave"]);
        let err = store
            .start_task(tasks[0].id, &stranger, None, &no_props(), ts(9, 10))
            .expect_err("not owner");
        assert_eq!(err.status_code(), 400);
        store
            .start_task(tasks[0].id, &admin(), None, &no_props(), ts(9, 10))
            .expect("admin may start");
    }

    #[test]
    fn completion_records_durations_and_validated_disposition() {
        let (mut store, _bus) = recording_store();
        let tasks = assigned(&mut store, &["1", "2"], 2);
        store
            .start_task(tasks[0].id, &worker(), None, &no_props(), ts(9, 0))
            .expect("start");

        let err = store
            .complete_task(tasks[0].id, &worker(), Some("Abandoned"), &no_props(), ts(9, 30))
            .expect_err("bad disposition");
        assert_eq!(err, ManagerError::validation("Abandoned is not a valid disposition"));

        let mut props = BTreeMap::new();
        props.insert("note".to_string(), "false merge".to_string());
        let outcome = store
            .complete_task(tasks[0].id, &worker(), Some("Skipped"), &props, ts(9, 30))
            .expect("complete");
        assert_eq!(outcome.task.disposition.as_deref(), Some("Skipped"));
        assert_eq!(outcome.task.duration, Some(1800));
        assert_eq!(outcome.task.working_duration, Some(1800));
        assert!(!outcome.assignment_completed);
        assert_eq!(
            store
                .property(PropertyOwner::Task, tasks[0].id, "note")
                .expect("load")
                .as_deref(),
            Some("false merge")
        );

        let err = store
            .complete_task(tasks[1].id, &worker(), None, &no_props(), ts(9, 31))
            .expect_err("not started");
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn last_task_completes_assignment_and_project() {
        let (mut store, bus) = recording_store();
        let tasks = assigned(&mut store, &["1", "2"], 2);
        for task in &tasks {
            store
                .start_task(task.id, &worker(), None, &no_props(), ts(9, 0))
                .expect("start");
        }
        let first = store
            .complete_task(tasks[0].id, &worker(), None, &no_props(), ts(10, 0))
            .expect("complete first");
        assert!(!first.assignment_completed);

        let last = store
            .complete_task(tasks[1].id, &worker(), None, &no_props(), ts(11, 0))
            .expect("complete last");
        assert!(last.assignment_completed);
        assert!(last.project_completed);

        let assignment = store.assignment("A1").expect("load").expect("assignment");
        assert_eq!(assignment.disposition.as_deref(), Some(DISPOSITION_COMPLETE));
        assert_eq!(assignment.duration, Some(7200));
        assert!(store.project("demo").expect("load").expect("project").is_complete());

        let messages = bus.topic(TOPIC_ASSIGNMENT_COMPLETE);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["duration"], 7200);
        assert_eq!(messages[0]["type"], "cleave");
    }

    #[test]
    fn task_properties_are_upserted_against_the_vocabulary() {
        let (mut store, _bus) = recording_store();
        let tasks = assigned(&mut store, &["1"], 1);
        let mut props = BTreeMap::new();
        props.insert("comment".to_string(), "looks fine".to_string());
        assert_eq!(
            store
                .update_task_properties(tasks[0].id, &worker(), &props, ts(9, 5))
                .expect("update"),
            1
        );
        props.insert("horoscope".to_string(), "leo".to_string());
        let err = store
            .update_task_properties(tasks[0].id, &worker(), &props, ts(9, 6))
            .expect_err("unknown property");
        assert_eq!(err.status_code(), 400);
    }
}
