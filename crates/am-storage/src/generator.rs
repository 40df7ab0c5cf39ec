//! Task generation: idempotent bulk insertion from candidate keys and
//! strict insertion from explicit task maps.

use crate::assignments::insert_assignment;
use crate::audit::{append_audit, AuditEntry};
use crate::notify::Outbox;
use crate::projects::{insert_project_row, validate_project_name, NewProject, DEFAULT_PROJECT_PRIORITY};
use crate::properties::{upsert_properties, upsert_property};
use crate::users::select_user;
use crate::{
    begin_immediate, format_timestamp, load_assignment, load_project, require_assignment,
    require_project, AssignmentStore, StorageError, TermRegistry,
};
use am_core::protocols::property_text;
use am_core::{
    Actor, AssignmentRecord, CandidateKey, KeySource, ManagerError, PopulateMethod, ProjectRecord,
    PropertyOwner, Protocol, ProtocolDefinition, TaskMap, AUDIT_ASSIGNED, AUDIT_INSERTED,
    DISPOSITION_COMPLETE, DISPOSITION_IN_PROGRESS,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use tracing::info;

/// Count reported for a batch handed to the background worker.
pub const GENERATION_IN_PROGRESS: i64 = -1;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationReport {
    pub inserted: i64,
    pub ignored: i64,
    pub properties: i64,
}

impl GenerationReport {
    pub fn in_progress() -> Self {
        Self {
            inserted: GENERATION_IN_PROGRESS,
            ignored: 0,
            properties: 0,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.inserted == GENERATION_IN_PROGRESS
    }
}

/// Project a batch writes into: one already on file, or one inserted in the
/// same transaction as the tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedProject {
    Existing(ProjectRecord),
    New(NewProject),
}

impl PlannedProject {
    pub fn name(&self) -> &str {
        match self {
            PlannedProject::Existing(project) => &project.name,
            PlannedProject::New(request) => &request.name,
        }
    }

    /// Row id, once the project has been written.
    pub fn id(&self) -> Option<i64> {
        match self {
            PlannedProject::Existing(project) => Some(project.id),
            PlannedProject::New(_) => None,
        }
    }
}

/// Candidate keys and project properties ready for [`AssignmentStore::run_generation`].
/// Nothing is written until the plan runs.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationPlan {
    pub project: PlannedProject,
    pub protocol: Protocol,
    pub existing_project: bool,
    pub properties: BTreeMap<String, String>,
    pub candidates: Vec<CandidateKey>,
}

/// Tasks, project properties and the optional assignment to create, ready
/// for [`AssignmentStore::run_upload`]. Nothing is written until the plan runs.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadPlan {
    pub project: PlannedProject,
    pub protocol: Protocol,
    pub properties: BTreeMap<String, String>,
    pub assignment: Option<String>,
    /// Assignee when an assignment is named, else the uploader.
    pub user: String,
    pub tasks: TaskMap,
}

/// Project a batch landed in and what was written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchOutcome {
    pub project: ProjectRecord,
    pub report: GenerationReport,
}

fn truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_i64().unwrap_or(0) != 0,
        Some(Value::String(text)) => matches!(text.trim(), "1" | "true" | "yes"),
        _ => false,
    }
}

fn requested_priority(payload: &Map<String, Value>) -> Result<i64, ManagerError> {
    match payload.get("priority") {
        None | Some(Value::Null) => Ok(DEFAULT_PROJECT_PRIORITY),
        Some(value) => property_text(value)
            .trim()
            .parse::<i64>()
            .map_err(|_| ManagerError::validation("priority must be an integer")),
    }
}

fn tasks_to_candidates(tasks: TaskMap) -> Vec<CandidateKey> {
    tasks
        .into_iter()
        .map(|(key, properties)| CandidateKey {
            key,
            properties,
            timestamp: None,
        })
        .collect()
}

fn key_type_id(
    terms: &TermRegistry,
    conn: &Connection,
    definition: &ProtocolDefinition,
) -> Result<i64, ManagerError> {
    terms.key_type_id(conn, definition.unit)?.ok_or_else(|| {
        ManagerError::validation(format!("{} is not a valid key type", definition.unit))
    })
}

fn reopen_completed_project(conn: &Connection, project: &ProjectRecord) -> Result<(), StorageError> {
    if project.disposition.as_deref() == Some(DISPOSITION_COMPLETE) {
        conn.execute(
            "UPDATE project SET disposition = ?1 WHERE id = ?2",
            params![DISPOSITION_IN_PROGRESS, project.id],
        )?;
    }
    Ok(())
}

/// Trimmed keys in upload order. Blank keys and keys that collide once
/// trimmed reject the batch.
fn normalized_keys(tasks: &TaskMap) -> Result<Vec<(&str, &Map<String, Value>)>, ManagerError> {
    let mut seen = HashSet::new();
    let mut keys = Vec::with_capacity(tasks.len());
    for (key, properties) in tasks {
        let trimmed = key.trim();
        if trimmed.is_empty() {
            return Err(ManagerError::validation("Task keys must not be blank"));
        }
        if !seen.insert(trimmed) {
            return Err(ManagerError::validation(format!(
                "Task key {trimmed} appears more than once"
            )));
        }
        keys.push((trimmed, properties));
    }
    Ok(keys)
}

/// Writes the planned project (or refreshes an existing one) inside the
/// caller's transaction.
fn write_planned_project(
    conn: &Connection,
    terms: &TermRegistry,
    project: &PlannedProject,
    properties: &BTreeMap<String, String>,
    outbox: &mut Outbox,
    now: DateTime<Utc>,
) -> Result<ProjectRecord, ManagerError> {
    let record = match project {
        PlannedProject::Existing(project) => require_project(conn, &project.id.to_string())?,
        PlannedProject::New(request) => {
            let record = insert_project_row(conn, terms, request, now)?;
            outbox.row_change("project", "insert", record.id, 1);
            record
        }
    };
    upsert_properties(conn, terms, PropertyOwner::Project, record.id, properties, now)?;
    Ok(record)
}

#[allow(clippy::too_many_arguments)]
fn insert_generated(
    conn: &Connection,
    terms: &TermRegistry,
    project: &ProjectRecord,
    candidates: &[CandidateKey],
    definition: &ProtocolDefinition,
    existing_project: bool,
    user: &str,
    now: DateTime<Utc>,
) -> Result<GenerationReport, ManagerError> {
    let key_type_id = key_type_id(terms, conn, definition)?;

    let mut seen = HashSet::new();
    if existing_project {
        let mut stmt = conn
            .prepare("SELECT key_text FROM task WHERE project_id = ?1 AND key_type_id = ?2")
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map(params![project.id, key_type_id], |row| row.get::<_, String>(0))
            .map_err(StorageError::from)?;
        for row in rows {
            seen.insert(row.map_err(StorageError::from)?);
        }
    }

    let mut report = GenerationReport::default();
    let created = format_timestamp(now);
    for candidate in candidates {
        let key = candidate.key.trim();
        if key.is_empty() || !seen.insert(key.to_string()) {
            report.ignored += 1;
            continue;
        }
        let changes = conn
            .execute(
                "
                INSERT OR IGNORE INTO task (name, project_id, key_type_id, key_text, user, create_date)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
                params![
                    format!("{}.{key}", project.id),
                    project.id,
                    key_type_id,
                    key,
                    user,
                    created
                ],
            )
            .map_err(StorageError::from)?;
        if changes == 0 {
            report.ignored += 1;
            continue;
        }
        let task_id = conn.last_insert_rowid();
        for (name, value) in definition.insert_properties(&candidate.properties) {
            upsert_property(conn, terms, PropertyOwner::Task, task_id, &name, &value, now)?;
            report.properties += 1;
        }
        append_audit(
            conn,
            &AuditEntry {
                task_id: Some(task_id),
                project_id: project.id,
                assignment_id: None,
                key_type_id: Some(key_type_id),
                key_text: Some(key),
                disposition: AUDIT_INSERTED,
                note: None,
                user,
            },
            now,
        )?;
        report.inserted += 1;
    }
    if report.inserted > 0 {
        reopen_completed_project(conn, project)?;
    }
    Ok(report)
}

#[allow(clippy::too_many_arguments)]
fn insert_uploaded(
    conn: &Connection,
    terms: &TermRegistry,
    project: &ProjectRecord,
    tasks: &TaskMap,
    definition: &ProtocolDefinition,
    assignment: Option<&AssignmentRecord>,
    user: &str,
    now: DateTime<Utc>,
) -> Result<GenerationReport, ManagerError> {
    definition.validate_tasks(tasks)?;
    if tasks.is_empty() {
        return Err(ManagerError::validation("No tasks found in JSON payload"));
    }
    if project.protocol != definition.protocol.as_str() {
        return Err(ManagerError::validation(format!(
            "Project {} is a {} project, not {}",
            project.name, project.protocol, definition.protocol
        )));
    }
    if let Some(assignment) = assignment {
        if assignment.project_id != project.id {
            return Err(ManagerError::validation(format!(
                "Assignment {} does not belong to project {}",
                assignment.name, project.name
            )));
        }
        if assignment.completion_date.is_some() {
            return Err(ManagerError::conflict(format!(
                "Assignment {} is already complete",
                assignment.name
            )));
        }
    }
    let keys = normalized_keys(tasks)?;
    let key_type_id = key_type_id(terms, conn, definition)?;

    let mut duplicates = Vec::new();
    {
        let mut stmt = conn
            .prepare("SELECT 1 FROM task WHERE project_id = ?1 AND key_type_id = ?2 AND key_text = ?3")
            .map_err(StorageError::from)?;
        for (key, _) in &keys {
            if stmt
                .exists(params![project.id, key_type_id, key])
                .map_err(StorageError::from)?
            {
                duplicates.push(*key);
            }
        }
    }
    if !duplicates.is_empty() {
        return Err(ManagerError::conflict(format!(
            "Task(s) already exist in project {}: {}",
            project.name,
            duplicates.join(", ")
        )));
    }

    let assignment_id = assignment.map(|assignment| assignment.id);
    let owner = assignment
        .map(|assignment| assignment.user.as_str())
        .unwrap_or(user);
    let created = format_timestamp(now);
    let mut report = GenerationReport::default();
    for (key, properties) in keys {
        conn.execute(
            "
            INSERT INTO task (name, project_id, assignment_id, key_type_id, key_text, user, create_date)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
            params![
                format!("{}.{key}", project.id),
                project.id,
                assignment_id,
                key_type_id,
                key,
                owner,
                created
            ],
        )
        .map_err(StorageError::from)?;
        let task_id = conn.last_insert_rowid();
        for (name, value) in definition.insert_properties(properties) {
            upsert_property(conn, terms, PropertyOwner::Task, task_id, &name, &value, now)?;
            report.properties += 1;
        }
        let mut entry = AuditEntry {
            task_id: Some(task_id),
            project_id: project.id,
            assignment_id: None,
            key_type_id: Some(key_type_id),
            key_text: Some(key),
            disposition: AUDIT_INSERTED,
            note: None,
            user,
        };
        append_audit(conn, &entry, now)?;
        if assignment_id.is_some() {
            entry.assignment_id = assignment_id;
            entry.disposition = AUDIT_ASSIGNED;
            entry.user = owner;
            append_audit(conn, &entry, now)?;
        }
        report.inserted += 1;
    }
    reopen_completed_project(conn, project)?;
    Ok(report)
}

impl AssignmentStore {
    /// Inserts a task for every candidate key not yet present in the project.
    /// Keys already present are counted as ignored and cause no writes.
    pub fn generate_tasks(
        &mut self,
        project_id: i64,
        candidates: &[CandidateKey],
        definition: &ProtocolDefinition,
        existing_project: bool,
        user: &str,
        now: DateTime<Utc>,
    ) -> Result<GenerationReport, ManagerError> {
        let tx = begin_immediate(&mut self.conn)?;
        let project = require_project(&tx, &project_id.to_string())?;
        let report = insert_generated(
            &tx,
            &self.ctx.terms,
            &project,
            candidates,
            definition,
            existing_project,
            user,
            now,
        )?;
        tx.commit().map_err(StorageError::from)?;

        info!(
            event = "tasks_generated",
            project = %project.name,
            inserted = report.inserted,
            ignored = report.ignored
        );
        let mut outbox = Outbox::new();
        if report.inserted > 0 {
            outbox.row_change("task", "insert", project_id, report.inserted as usize);
        }
        outbox.flush(&self.ctx, user, now);
        Ok(report)
    }

    /// Inserts exactly the supplied tasks, optionally pre-assigned. Any key
    /// already present in the project rejects the whole batch.
    pub fn create_tasks_from_json(
        &mut self,
        project_id: i64,
        tasks: &TaskMap,
        definition: &ProtocolDefinition,
        assignment_id: Option<i64>,
        user: &str,
        now: DateTime<Utc>,
    ) -> Result<GenerationReport, ManagerError> {
        let tx = begin_immediate(&mut self.conn)?;
        let project = require_project(&tx, &project_id.to_string())?;
        let assignment = match assignment_id {
            Some(id) => Some(require_assignment(&tx, &id.to_string())?),
            None => None,
        };
        let report = insert_uploaded(
            &tx,
            &self.ctx.terms,
            &project,
            tasks,
            definition,
            assignment.as_ref(),
            user,
            now,
        )?;
        tx.commit().map_err(StorageError::from)?;

        info!(
            event = "tasks_created",
            project = %project.name,
            inserted = report.inserted,
            assignment = ?assignment_id
        );
        let mut outbox = Outbox::new();
        outbox.row_change("task", "insert", project.id, report.inserted as usize);
        outbox.flush(&self.ctx, user, now);
        Ok(report)
    }

    /// Resolves candidates for a project via the protocol's population
    /// strategy. Read-only: the project (or its new properties when `append`
    /// extends it) is written by [`Self::run_generation`].
    pub fn prepare_project_generation(
        &mut self,
        protocol: Protocol,
        name: &str,
        payload: &Map<String, Value>,
        key_source: &dyn KeySource,
        actor: &Actor,
    ) -> Result<GenerationPlan, ManagerError> {
        actor.require_admin("generate projects")?;
        let name = name.trim();
        validate_project_name(name)?;
        let definition = protocol.definition();
        let append = truthy(payload.get("append"));

        let existing = load_project(&self.conn, name)?;
        let existing_project = existing.is_some();
        if let Some(project) = &existing {
            if !append {
                return Err(ManagerError::conflict(format!("Project {name} already exists")));
            }
            if project.protocol != protocol.as_str() {
                return Err(ManagerError::validation(
                    "Additional tasks for an existing project must be in the same protocol",
                ));
            }
        }

        let mut query = BTreeMap::new();
        for field in definition
            .optional_properties
            .iter()
            .chain(definition.allowable_filters.iter())
        {
            if let Some(value) = payload.get(*field).filter(|value| !value.is_null()) {
                query.insert((*field).to_string(), property_text(value));
            }
        }

        let candidates = match definition.populate {
            PopulateMethod::KeySource => {
                let found = key_source.candidates(protocol, &query)?;
                definition.select_candidates(found, &query)
            }
            PopulateMethod::JsonUpload | PopulateMethod::Explicit => {
                let tasks = definition.parse_task_payload(payload)?;
                definition.validate_tasks(&tasks)?;
                tasks_to_candidates(tasks)
            }
        };
        if candidates.is_empty() {
            return Err(ManagerError::not_found(format!(
                "No candidate tasks found for project {name}"
            )));
        }

        let mut properties = definition
            .optional_values(payload)
            .into_iter()
            .collect::<BTreeMap<_, _>>();
        if !query.is_empty() {
            let filter = serde_json::to_string(&query)
                .map_err(|err| StorageError::Serialization(err.to_string()))?;
            properties.insert("filter".to_string(), filter);
        }

        let project = match existing {
            Some(project) => PlannedProject::Existing(project),
            None => PlannedProject::New(NewProject {
                protocol,
                name: name.to_string(),
                priority: Some(requested_priority(payload)?),
                properties: BTreeMap::new(),
            }),
        };
        info!(
            event = "generation_planned",
            project = %name,
            candidates = candidates.len()
        );

        Ok(GenerationPlan {
            project,
            protocol,
            existing_project,
            properties,
            candidates,
        })
    }

    /// Writes the project, its properties and the generated tasks as one
    /// unit of work.
    pub fn run_generation(
        &mut self,
        plan: &GenerationPlan,
        user: &str,
        now: DateTime<Utc>,
    ) -> Result<BatchOutcome, ManagerError> {
        self.generate_planned(plan, plan.protocol.definition(), user, now)
    }

    fn generate_planned(
        &mut self,
        plan: &GenerationPlan,
        definition: &ProtocolDefinition,
        user: &str,
        now: DateTime<Utc>,
    ) -> Result<BatchOutcome, ManagerError> {
        let mut outbox = Outbox::new();
        let tx = begin_immediate(&mut self.conn)?;
        let project = write_planned_project(
            &tx,
            &self.ctx.terms,
            &plan.project,
            &plan.properties,
            &mut outbox,
            now,
        )?;
        let report = insert_generated(
            &tx,
            &self.ctx.terms,
            &project,
            &plan.candidates,
            definition,
            plan.existing_project,
            user,
            now,
        )?;
        tx.commit().map_err(StorageError::from)?;

        info!(
            event = "tasks_generated",
            project = %project.name,
            inserted = report.inserted,
            ignored = report.ignored
        );
        if report.inserted > 0 {
            outbox.row_change("task", "insert", project.id, report.inserted as usize);
        }
        outbox.flush(&self.ctx, user, now);
        Ok(BatchOutcome { project, report })
    }

    /// Parses an explicit task upload and resolves who any named assignment
    /// is for. Read-only: the project, the assignment and the tasks are
    /// written together by [`Self::run_upload`].
    pub fn prepare_task_upload(
        &mut self,
        protocol: Protocol,
        project_name: &str,
        assignment_name: Option<&str>,
        payload: &Map<String, Value>,
        actor: &Actor,
    ) -> Result<UploadPlan, ManagerError> {
        if !actor.is_admin() && !actor.has_permission(protocol.as_str()) {
            return Err(ManagerError::validation(format!(
                "You don't have permission to create {protocol} tasks"
            )));
        }
        let definition = protocol.definition();
        let tasks = definition.parse_task_payload(payload)?;
        definition.validate_tasks(&tasks)?;
        normalized_keys(&tasks)?;

        let project = match load_project(&self.conn, project_name)? {
            Some(project) => {
                if project.protocol != protocol.as_str() {
                    return Err(ManagerError::validation(
                        "Additional tasks for an existing project must be in the same protocol",
                    ));
                }
                PlannedProject::Existing(project)
            }
            None => {
                let name = project_name.trim();
                validate_project_name(name)?;
                PlannedProject::New(NewProject {
                    protocol,
                    name: name.to_string(),
                    priority: Some(requested_priority(payload)?),
                    properties: BTreeMap::new(),
                })
            }
        };

        let requested_user = payload.get("user").and_then(Value::as_str);
        let (assignment, user) = match assignment_name.map(str::trim) {
            Some(name) => {
                if name.is_empty() {
                    return Err(ManagerError::validation("Assignment name is required"));
                }
                if load_assignment(&self.conn, name)?.is_some() {
                    return Err(ManagerError::conflict(format!("Assignment {name} already exists")));
                }
                let user = select_user(&self.conn, protocol.as_str(), requested_user, actor)?;
                (Some(name.to_string()), user)
            }
            None => (None, actor.user.clone()),
        };
        info!(
            event = "upload_planned",
            project = %project.name(),
            tasks = tasks.len()
        );

        Ok(UploadPlan {
            project,
            protocol,
            properties: definition
                .optional_values(payload)
                .into_iter()
                .collect(),
            assignment,
            user,
            tasks,
        })
    }

    /// Writes the project, its properties, the named assignment and the
    /// tasks as one unit of work. A rejected batch leaves none of them.
    pub fn run_upload(&mut self, plan: &UploadPlan, now: DateTime<Utc>) -> Result<BatchOutcome, ManagerError> {
        let mut outbox = Outbox::new();
        let tx = begin_immediate(&mut self.conn)?;
        let project = write_planned_project(
            &tx,
            &self.ctx.terms,
            &plan.project,
            &plan.properties,
            &mut outbox,
            now,
        )?;
        let assignment = match &plan.assignment {
            Some(name) => {
                let id = insert_assignment(&tx, &project, name, &plan.user, now)?;
                outbox.row_change("assignment", "insert", id, 1);
                Some(require_assignment(&tx, &id.to_string())?)
            }
            None => None,
        };
        let report = insert_uploaded(
            &tx,
            &self.ctx.terms,
            &project,
            &plan.tasks,
            plan.protocol.definition(),
            assignment.as_ref(),
            &plan.user,
            now,
        )?;
        tx.commit().map_err(StorageError::from)?;

        info!(
            event = "tasks_created",
            project = %project.name,
            inserted = report.inserted,
            assignment = ?plan.assignment
        );
        outbox.row_change("task", "insert", project.id, report.inserted as usize);
        outbox.flush(&self.ctx, &plan.user, now);
        Ok(BatchOutcome { project, report })
    }

    /// Commits a planned new project on its own so a batch handed to the
    /// background worker has a row to report status against. The tasks
    /// still go in when the plan runs.
    pub fn stage_project(
        &mut self,
        project: &mut PlannedProject,
        user: &str,
        now: DateTime<Utc>,
    ) -> Result<ProjectRecord, ManagerError> {
        let record = match project {
            PlannedProject::Existing(record) => return Ok(record.clone()),
            PlannedProject::New(request) => self.insert_project(request, user, now)?,
        };
        *project = PlannedProject::Existing(record.clone());
        Ok(record)
    }
}
