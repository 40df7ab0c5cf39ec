use am_core::{Actor, Protocol, PERMISSION_ADMIN, PERMISSION_SUPER};
use am_storage::{AssignmentStore, FilterSet, NewAssignment, NewProject, NewUser, QueryView};
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// One store connection plus the user commands run as.
pub struct Session {
    store: AssignmentStore,
    user: String,
}

impl Session {
    pub fn open(database: &Path, user: &str) -> Result<Self> {
        let store = AssignmentStore::open(database)
            .with_context(|| format!("Failed to open {}", database.display()))?;
        Ok(Self {
            store,
            user: user.trim().to_string(),
        })
    }

    fn actor(&self) -> Result<Actor> {
        Ok(self.store.require_actor(&self.user)?)
    }

    pub fn init(&mut self, admin: Option<&str>) -> Result<Value> {
        let version = self.store.schema_version()?;
        let Some(admin) = admin else {
            return Ok(json!({ "schema_version": version }));
        };
        self.store.add_user(&NewUser::named(admin))?;
        let mut permissions = vec![PERMISSION_ADMIN, PERMISSION_SUPER];
        permissions.extend(Protocol::ALL.iter().map(Protocol::as_str));
        let granted = self.store.grant_permissions(admin, permissions)?;
        info!(event = "admin_seeded", user = admin, granted);
        Ok(json!({ "schema_version": version, "admin": admin, "granted": granted }))
    }

    pub fn add_user(&mut self, name: &str, permissions: &[String]) -> Result<Value> {
        self.actor()?.require_admin("add users")?;
        let id = self.store.add_user(&NewUser::named(name))?;
        let granted = self
            .store
            .grant_permissions(name, permissions.iter().map(String::as_str))?;
        Ok(json!({ "id": id, "user": name, "granted": granted }))
    }

    pub fn create_project(
        &mut self,
        protocol: &str,
        name: &str,
        priority: Option<i64>,
        properties: &[String],
    ) -> Result<Value> {
        let protocol: Protocol = protocol.parse().map_err(|err: String| anyhow!(err))?;
        let mut request = NewProject::new(protocol, name);
        request.priority = priority;
        request.properties = parse_assignments(properties)?;
        let actor = self.actor()?;
        let project = self.store.create_project(&request, &actor, Utc::now())?;
        Ok(serde_json::to_value(project)?)
    }

    pub fn set_project_active(&mut self, name: &str, active: bool) -> Result<Value> {
        let actor = self.actor()?;
        let project = self.store.set_project_active(name, active, &actor, Utc::now())?;
        Ok(serde_json::to_value(project)?)
    }

    pub fn reprioritize(&mut self, name: &str, priority: i64) -> Result<Value> {
        let actor = self.actor()?;
        let project = self.store.set_project_priority(name, priority, &actor, Utc::now())?;
        Ok(serde_json::to_value(project)?)
    }

    pub fn delete_project(&mut self, name: &str) -> Result<Value> {
        let actor = self.actor()?;
        let deletion = self.store.delete_project(name, &actor, Utc::now())?;
        Ok(serde_json::to_value(deletion)?)
    }

    pub fn upload(
        &mut self,
        protocol: &str,
        project: &str,
        file: &Path,
        assignment: Option<&str>,
    ) -> Result<Value> {
        let protocol: Protocol = protocol.parse().map_err(|err: String| anyhow!(err))?;
        let text = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let payload: Map<String, Value> = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse {}", file.display()))?;
        let actor = self.actor()?;
        let plan = self
            .store
            .prepare_task_upload(protocol, project, assignment, &payload, &actor)?;
        let outcome = self.store.run_upload(&plan, Utc::now())?;
        Ok(json!({ "project": outcome.project.name, "tasks": outcome.report }))
    }

    pub fn create_assignment(
        &mut self,
        project: &str,
        name: Option<String>,
        user: Option<String>,
        tasks: Option<usize>,
        start: bool,
    ) -> Result<Value> {
        let request = NewAssignment {
            project: project.to_string(),
            name,
            user,
            tasks,
            start,
            properties: BTreeMap::new(),
        };
        let actor = self.actor()?;
        let created = self.store.create_assignment(&request, &actor, Utc::now())?;
        Ok(serde_json::to_value(created)?)
    }

    pub fn start_assignment(&mut self, name: &str) -> Result<Value> {
        let actor = self.actor()?;
        let assignment = self
            .store
            .start_assignment(name, &actor, &BTreeMap::new(), Utc::now())?;
        Ok(serde_json::to_value(assignment)?)
    }

    pub fn complete_assignment(&mut self, name: &str, allow_incomplete: bool) -> Result<Value> {
        let actor = self.actor()?;
        let completion = self.store.complete_assignment(
            name,
            allow_incomplete,
            &actor,
            &BTreeMap::new(),
            Utc::now(),
        )?;
        Ok(serde_json::to_value(completion)?)
    }

    pub fn reset_assignment(&mut self, name: &str) -> Result<Value> {
        let actor = self.actor()?;
        let report = self.store.reset_assignment(name, &actor, Utc::now())?;
        Ok(serde_json::to_value(report)?)
    }

    pub fn reassign_assignment(&mut self, name: &str, user: &str) -> Result<Value> {
        let actor = self.actor()?;
        let assignment = self.store.reassign_assignment(name, user, &actor, Utc::now())?;
        Ok(serde_json::to_value(assignment)?)
    }

    pub fn close_out(&mut self, name: &str) -> Result<Value> {
        let actor = self.actor()?;
        let assignment = self.store.close_out(name, &actor, Utc::now())?;
        Ok(serde_json::to_value(assignment)?)
    }

    pub fn delete_assignment(&mut self, name: &str) -> Result<Value> {
        let actor = self.actor()?;
        let released = self.store.delete_assignment(name, &actor, Utc::now())?;
        Ok(json!({ "assignment": name, "tasks_released": released }))
    }

    pub fn assignment_json(&mut self, name: &str) -> Result<Value> {
        Ok(self.store.assignment_tasks_json(name)?)
    }

    pub fn start_task(&mut self, id: i64, disposition: Option<&str>) -> Result<Value> {
        let actor = self.actor()?;
        let task = self
            .store
            .start_task(id, &actor, disposition, &BTreeMap::new(), Utc::now())?;
        Ok(serde_json::to_value(task)?)
    }

    pub fn complete_task(&mut self, id: i64, disposition: Option<&str>) -> Result<Value> {
        let actor = self.actor()?;
        let completion = self
            .store
            .complete_task(id, &actor, disposition, &BTreeMap::new(), Utc::now())?;
        Ok(serde_json::to_value(completion)?)
    }

    pub fn query(&mut self, view: &str, filters: &[String]) -> Result<Value> {
        let view = QueryView::from_label(view).ok_or_else(|| anyhow!("Unknown view {view}"))?;
        let pairs = filters
            .iter()
            .map(|filter| split_filter(filter))
            .collect::<Result<Vec<_>>>()?;
        let rows = self.store.query_view(view, &FilterSet::from_pairs(pairs))?;
        Ok(json!({ "sql_statement": rows.statement, "rows": rows.rows }))
    }

    pub fn reload(&mut self) -> Result<Value> {
        self.actor()?.require_admin("reload protocols")?;
        self.store.reload_terms();
        Ok(json!({ "reloaded": true }))
    }
}

/// Splits `key=value` at the first `=`, as a query string would.
fn split_filter(filter: &str) -> Result<(&str, &str)> {
    match filter.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim(), value.trim())),
        _ => bail!("Filter {filter} is not of the form key=value"),
    }
}

fn parse_assignments(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    pairs
        .iter()
        .map(|pair| split_filter(pair).map(|(key, value)| (key.to_string(), value.to_string())))
        .collect()
}
