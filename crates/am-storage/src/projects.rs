use crate::key_types::PROTOCOL_CV;
use crate::notify::Outbox;
use crate::properties::{upsert_properties, upsert_property};
use crate::{
    begin_immediate, format_timestamp, load_project, numeric_id, project_from_row,
    require_project, AssignmentStore, StorageError, TermRegistry, PROJECT_COLUMNS,
};
use am_core::{Actor, ManagerError, ProjectRecord, PropertyOwner, Protocol};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::info;

pub const DEFAULT_PROJECT_PRIORITY: i64 = 10;
pub const GENERATION_STATUS_PROPERTY: &str = "generation_status";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProject {
    pub protocol: Protocol,
    pub name: String,
    pub priority: Option<i64>,
    pub properties: BTreeMap<String, String>,
}

impl NewProject {
    pub fn new(protocol: Protocol, name: &str) -> Self {
        Self {
            protocol,
            name: name.trim().to_string(),
            priority: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_property(mut self, name: &str, value: &str) -> Self {
        self.properties.insert(name.to_string(), value.to_string());
        self
    }
}

/// Row counts removed by a project delete.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectDeletion {
    pub audits: usize,
    pub task_properties: usize,
    pub tasks: usize,
    pub assignment_properties: usize,
    pub assignments: usize,
    pub project_properties: usize,
}

pub(crate) fn validate_project_name(name: &str) -> Result<(), ManagerError> {
    if name.is_empty() {
        return Err(ManagerError::validation("Project name is required"));
    }
    if numeric_id(name).is_some() {
        return Err(ManagerError::validation(
            "Project name must have at least one alphabetic character",
        ));
    }
    Ok(())
}

/// Inserts the project row and its properties inside the caller's unit of work.
pub(crate) fn insert_project_row(
    conn: &Connection,
    terms: &TermRegistry,
    request: &NewProject,
    now: DateTime<Utc>,
) -> Result<ProjectRecord, ManagerError> {
    validate_project_name(&request.name)?;
    let protocol_id = terms
        .term_id(conn, PROTOCOL_CV, request.protocol.as_str())?
        .ok_or_else(|| {
            ManagerError::validation(format!("{} is not a valid protocol", request.protocol))
        })?;
    if load_project(conn, &request.name)?.is_some() {
        return Err(ManagerError::conflict(format!(
            "Project {} already exists",
            request.name
        )));
    }
    conn.execute(
        "
        INSERT INTO project (name, protocol_id, priority, active, create_date)
        VALUES (?1, ?2, ?3, 1, ?4)
        ",
        params![
            request.name,
            protocol_id,
            request.priority.unwrap_or(DEFAULT_PROJECT_PRIORITY),
            format_timestamp(now)
        ],
    )
    .map_err(StorageError::from)?;
    let project_id = conn.last_insert_rowid();
    upsert_properties(
        conn,
        terms,
        PropertyOwner::Project,
        project_id,
        &request.properties,
        now,
    )?;
    require_project(conn, &project_id.to_string())
}

impl AssignmentStore {
    pub fn create_project(
        &mut self,
        request: &NewProject,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<ProjectRecord, ManagerError> {
        actor.require_admin("create projects")?;
        self.insert_project(request, &actor.user, now)
    }

    /// Creates the project without a permission check; callers authorize.
    pub(crate) fn insert_project(
        &mut self,
        request: &NewProject,
        user: &str,
        now: DateTime<Utc>,
    ) -> Result<ProjectRecord, ManagerError> {
        let tx = begin_immediate(&mut self.conn)?;
        let project = insert_project_row(&tx, &self.ctx.terms, request, now)?;
        tx.commit().map_err(StorageError::from)?;

        info!(
            event = "project_created",
            project = %project.name,
            protocol = %request.protocol,
            user = %user
        );
        let mut outbox = Outbox::new();
        outbox.row_change("project", "insert", project.id, 1);
        outbox.flush(&self.ctx, user, now);
        Ok(project)
    }

    pub fn set_project_active(
        &mut self,
        name_or_id: &str,
        active: bool,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<ProjectRecord, ManagerError> {
        actor.require_admin("change project status")?;
        self.update_project(name_or_id, "active", i64::from(active), &actor.user, now)
    }

    pub fn set_project_priority(
        &mut self,
        name_or_id: &str,
        priority: i64,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<ProjectRecord, ManagerError> {
        actor.require_admin("reprioritize projects")?;
        self.update_project(name_or_id, "priority", priority, &actor.user, now)
    }

    fn update_project(
        &mut self,
        name_or_id: &str,
        column: &'static str,
        value: i64,
        user: &str,
        now: DateTime<Utc>,
    ) -> Result<ProjectRecord, ManagerError> {
        let tx = begin_immediate(&mut self.conn)?;
        let project = require_project(&tx, name_or_id)?;
        tx.execute(
            &format!("UPDATE project SET {column} = ?1 WHERE id = ?2"),
            params![value, project.id],
        )
        .map_err(StorageError::from)?;
        tx.commit().map_err(StorageError::from)?;

        let mut outbox = Outbox::new();
        outbox.row_change("project", "update", project.id, 1);
        outbox.flush(&self.ctx, user, now);
        require_project(&self.conn, &project.id.to_string())
    }

    /// Removes a project and everything hanging off it in one unit of work.
    pub fn delete_project(
        &mut self,
        name_or_id: &str,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<ProjectDeletion, ManagerError> {
        actor.require_super("delete projects")?;
        let tx = begin_immediate(&mut self.conn)?;
        let project = require_project(&tx, name_or_id)?;
        let id = project.id;
        let run = |sql: &str| tx.execute(sql, [id]).map_err(StorageError::from);

        let deletion = ProjectDeletion {
            audits: run("DELETE FROM task_audit WHERE project_id = ?1")?,
            task_properties: run(
                "DELETE FROM task_property WHERE task_id IN (SELECT id FROM task WHERE project_id = ?1)",
            )?,
            tasks: run("DELETE FROM task WHERE project_id = ?1")?,
            assignment_properties: run(
                "DELETE FROM assignment_property \
                 WHERE assignment_id IN (SELECT id FROM assignment WHERE project_id = ?1)",
            )?,
            assignments: run("DELETE FROM assignment WHERE project_id = ?1")?,
            project_properties: run("DELETE FROM project_property WHERE project_id = ?1")?,
        };
        run("DELETE FROM project WHERE id = ?1")?;
        tx.commit().map_err(StorageError::from)?;

        info!(
            event = "project_deleted",
            project = %project.name,
            tasks = deletion.tasks,
            assignments = deletion.assignments,
            user = %actor.user
        );
        let mut outbox = Outbox::new();
        outbox.row_change("project", "delete", id, 1);
        outbox.flush(&self.ctx, &actor.user, now);
        Ok(deletion)
    }

    /// Active projects with unassigned work the actor may pick up.
    pub fn eligible_projects(&self, actor: &Actor) -> Result<Vec<ProjectRecord>, StorageError> {
        let sql = format!(
            "
            SELECT {PROJECT_COLUMNS}
            FROM project_vw p
            WHERE p.active = 1
              AND EXISTS (
                  SELECT 1 FROM task t WHERE t.project_id = p.id AND t.assignment_id IS NULL
              )
            ORDER BY p.priority, p.name
            "
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], project_from_row)?;
        let mut projects = Vec::new();
        for row in rows {
            let project = row?;
            if actor.has_permission(&project.protocol) {
                projects.push(project);
            }
        }
        Ok(projects)
    }

    /// Records the outcome of a background generation run against the project.
    pub fn record_generation_status(
        &mut self,
        project_id: i64,
        status: &str,
        now: DateTime<Utc>,
    ) -> Result<(), ManagerError> {
        let tx = begin_immediate(&mut self.conn)?;
        upsert_property(
            &tx,
            &self.ctx.terms,
            PropertyOwner::Project,
            project_id,
            GENERATION_STATUS_PROPERTY,
            status,
            now,
        )?;
        tx.commit().map_err(StorageError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use am_core::PERMISSION_SUPER;

    #[test]
    fn project_names_need_a_letter_and_must_be_unique() {
        let (mut store, _bus) = recording_store();
        seeded_project(&mut store, "demo", &["1"]);

        let err = store
            .create_project(&NewProject::new(Protocol::Cleave, "12345"), &admin(), ts(9, 0))
            .expect_err("numeric name");
        assert_eq!(err.status_code(), 400);

        let err = store
            .create_project(&NewProject::new(Protocol::Todo, "demo"), &admin(), ts(9, 0))
            .expect_err("duplicate");
        assert_eq!(err, ManagerError::conflict("Project demo already exists"));

        let err = store
            .create_project(&NewProject::new(Protocol::Todo, "other"), &worker(), ts(9, 0))
            .expect_err("not admin");
        assert_eq!(err.status_code(), 400);
    }

    #[test]
    fn create_stores_priority_and_properties() {
        let (mut store, _bus) = recording_store();
        let project = store
            .create_project(
                &NewProject::new(Protocol::OrphanLink, "orphans")
                    .with_priority(3)
                    .with_property("roi", "FB"),
                &admin(),
                ts(9, 0),
            )
            .expect("create");
        assert_eq!(project.priority, 3);
        assert_eq!(project.protocol, "orphan_link");
        assert_eq!(
            store
                .property(PropertyOwner::Project, project.id, "roi")
                .expect("load"),
            Some("FB".to_string())
        );
    }

    #[test]
    fn activation_and_priority_changes() {
        let (mut store, _bus) = recording_store();
        seeded_project(&mut store, "demo", &["1"]);
        let project = store
            .set_project_active("demo", false, &admin(), ts(9, 0))
            .expect("deactivate");
        assert!(!project.active);
        assert!(store.eligible_projects(&worker()).expect("eligible").is_empty());

        store
            .set_project_active("demo", true, &admin(), ts(9, 1))
            .expect("activate");
        let project = store
            .set_project_priority("demo", 2, &admin(), ts(9, 2))
            .expect("priority");
        assert_eq!(project.priority, 2);
        assert_eq!(store.eligible_projects(&worker()).expect("eligible").len(), 1);
        assert!(store
            .eligible_projects(&am_core::Actor::new("x", ["todo"]))
            .expect("eligible")
            .is_empty());
    }

    #[test]
    fn delete_project_cascades_everything() {
        let (mut store, _bus) = recording_store();
        let project = seeded_project(&mut store, "demo", &["1", "2", "3"]);
        store
            .create_assignment(
                &crate::NewAssignment::for_project("demo").with_tasks(2),
                &worker(),
                ts(9, 0),
            )
            .expect("assign");

        let err = store
            .delete_project("demo", &admin(), ts(9, 5))
            .expect_err("admin is not super");
        assert_eq!(err.status_code(), 400);

        let root = am_core::Actor::new("root", [PERMISSION_SUPER]);
        let deletion = store
            .delete_project("demo", &root, ts(9, 5))
            .expect("delete");
        assert_eq!(deletion.tasks, 3);
        assert_eq!(deletion.assignments, 1);
        assert_eq!(deletion.audits, 5);
        assert!(store.project("demo").expect("load").is_none());
        assert!(store.project_tasks(project.id).expect("tasks").is_empty());
        assert!(store.project_audit_trail(project.id).expect("trail").is_empty());
    }

    #[test]
    fn generation_status_is_recorded_as_a_property() {
        let (mut store, _bus) = recording_store();
        let project = seeded_project(&mut store, "demo", &["1"]);
        store
            .record_generation_status(project.id, "complete: inserted=1 ignored=0", ts(9, 0))
            .expect("record");
        assert_eq!(
            store
                .property(PropertyOwner::Project, project.id, GENERATION_STATUS_PROPERTY)
                .expect("load")
                .as_deref(),
            Some("complete: inserted=1 ignored=0")
        );
    }
}
