use crate::auth::bearer_user;
use crate::config::truthy;
use crate::error::HubError;
use crate::generation::{GenerationJob, JobPlan};
use crate::HubState;
use am_core::protocols::property_text;
use am_core::{Actor, ManagerError, Protocol};
use am_storage::{
    AssignmentStore, FilterSet, GenerationReport, NewAssignment, QueryRows, QueryView,
};
use axum::body::Bytes;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, Uri};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

type Shared = State<Arc<HubState>>;
type Reply = Result<Json<Value>, HubError>;

pub fn router(state: Arc<HubState>) -> Router {
    let mut app = Router::new()
        .route("/ping", get(ping))
        .route("/health", get(ping))
        .route("/protocols", get(protocols))
        .route("/protocol/:protocol/reload", post(reload_protocol))
        .route("/project/:name", post(generate_project).delete(delete_project))
        .route("/project/activate/:name", post(activate_project))
        .route("/project/deactivate/:name", post(deactivate_project))
        .route("/project/reprioritize", post(reprioritize_project))
        .route("/projects/eligible", get(eligible_projects))
        // The first segment is the protocol; its name is shared with `/tasks/:id`.
        .route("/tasks/:id/:project", post(upload_tasks))
        .route("/tasks/:id/:project/:assignment", post(upload_assigned_tasks))
        .route("/assignment/:name", post(create_assignment).delete(delete_assignment))
        .route("/assignment/:name/start", post(start_assignment))
        .route("/assignment/:name/complete", post(complete_assignment))
        .route("/assignment/:name/reset", post(reset_assignment))
        .route("/assignment/:name/reassign", post(reassign_assignment))
        .route("/assignment/:name/closeout", post(close_out_assignment))
        .route("/assignment/json/:name", get(assignment_json))
        .route("/task/:id/start", post(start_task))
        .route("/task/:id/complete", post(complete_task))
        .route("/task/properties/:id", post(update_task_properties));
    for view in QueryView::ALL {
        let label = view.label();
        app = app
            .route(&format!("/{label}"), get(read_view))
            .route(&format!("/{label}/columns"), get(read_columns))
            .route(&format!("/{label}/:id"), get(read_by_id));
    }
    app.with_state(state)
}

/// Runs `work` against a fresh connection on the blocking pool.
async fn with_store<T, F>(state: &HubState, work: F) -> Result<T, HubError>
where
    T: Send + 'static,
    F: FnOnce(&mut AssignmentStore) -> Result<T, ManagerError> + Send + 'static,
{
    let database = state.config.database.clone();
    let ctx = state.ctx.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        let mut store = AssignmentStore::open_with(&database, ctx)?;
        work(&mut store)
    })
    .await?;
    Ok(outcome?)
}

/// Like [`with_store`] but resolves the bearer token to an actor first.
async fn as_actor<T, F>(state: &HubState, headers: &HeaderMap, work: F) -> Result<T, HubError>
where
    T: Send + 'static,
    F: FnOnce(&mut AssignmentStore, &Actor) -> Result<T, ManagerError> + Send + 'static,
{
    let user = bearer_user(headers, &state.config)?;
    with_store(state, move |store| {
        let actor = store.require_actor(&user)?;
        work(store, &actor)
    })
    .await
}

fn respond(started: Instant, row_count: usize, statement: Option<String>, body: Value) -> Json<Value> {
    let mut rest = Map::new();
    rest.insert("row_count".to_string(), json!(row_count));
    rest.insert(
        "elapsed_time".to_string(),
        json!(format!("{:.4} sec", started.elapsed().as_secs_f64())),
    );
    if let Some(statement) = statement {
        rest.insert("sql_statement".to_string(), json!(statement));
    }
    let mut envelope = match body {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("data".to_string(), other);
            map
        }
    };
    envelope.insert("rest".to_string(), Value::Object(rest));
    Json(Value::Object(envelope))
}

fn rows_reply(started: Instant, rows: QueryRows) -> Json<Value> {
    let count = rows.rows.len();
    respond(started, count, Some(rows.statement), json!({ "data": rows.rows }))
}

fn parse_payload(body: &Bytes) -> Result<Map<String, Value>, HubError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ManagerError::validation("Payload must be a JSON object").into()),
        Err(err) => Err(ManagerError::validation(format!("Payload is not valid JSON: {err}")).into()),
    }
}

fn text(payload: &Map<String, Value>, key: &str) -> Option<String> {
    payload
        .get(key)
        .filter(|value| !value.is_null())
        .map(property_text)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn required(payload: &Map<String, Value>, key: &str) -> Result<String, ManagerError> {
    text(payload, key).ok_or_else(|| ManagerError::validation(format!("Missing {key}")))
}

fn flag(payload: &Map<String, Value>, key: &str) -> bool {
    match payload.get(key) {
        Some(Value::Bool(value)) => *value,
        Some(value) if !value.is_null() => truthy(&property_text(value)),
        _ => false,
    }
}

fn parse_protocol(protocol: &str) -> Result<Protocol, ManagerError> {
    protocol.parse().map_err(ManagerError::Validation)
}

/// Optional protocol properties present in the payload.
fn protocol_properties(
    store: &AssignmentStore,
    protocol: &str,
    payload: &Map<String, Value>,
) -> Result<BTreeMap<String, String>, ManagerError> {
    let definition = store.context().protocols.lookup(protocol)?;
    Ok(definition.optional_values(payload).into_iter().collect())
}

fn assignment_protocol(store: &AssignmentStore, name: &str) -> Result<String, ManagerError> {
    store
        .assignment(name)?
        .map(|assignment| assignment.protocol)
        .ok_or_else(|| ManagerError::not_found(format!("Assignment {} does not exist", name.trim())))
}

fn task_protocol(store: &AssignmentStore, task_id: i64) -> Result<String, ManagerError> {
    store
        .task(task_id)?
        .map(|task| task.protocol)
        .ok_or_else(|| ManagerError::not_found(format!("Task {task_id} does not exist")))
}

fn view_for(uri: &Uri) -> Result<QueryView, ManagerError> {
    let label = uri
        .path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or_default();
    QueryView::from_label(label)
        .ok_or_else(|| ManagerError::not_found(format!("Unknown resource {label}")))
}

async fn ping(State(state): Shared) -> Reply {
    let started = Instant::now();
    with_store(&state, |store| Ok(store.ping()?)).await?;
    Ok(respond(started, 0, None, json!({ "status": "ok" })))
}

async fn protocols(State(state): Shared) -> Reply {
    let started = Instant::now();
    let definitions: Vec<_> = state.ctx.protocols.definitions().collect();
    let count = definitions.len();
    Ok(respond(started, count, None, json!({ "data": definitions })))
}

async fn reload_protocol(
    State(state): Shared,
    Path(protocol): Path<String>,
    headers: HeaderMap,
) -> Reply {
    let started = Instant::now();
    let protocol = parse_protocol(&protocol)?;
    as_actor(&state, &headers, move |store, actor| {
        actor.require_admin("reload protocols")?;
        store.reload_terms();
        Ok(())
    })
    .await?;
    info!(event = "terms_reloaded", protocol = %protocol);
    Ok(respond(started, 0, None, json!({ "protocol": protocol.as_str(), "reloaded": true })))
}

async fn generate_project(
    State(state): Shared,
    Path(protocol): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    let started = Instant::now();
    let protocol = parse_protocol(&protocol)?;
    let payload = parse_payload(&body)?;
    let name = required(&payload, "project_name")?;
    let key_source = state.key_source.clone();
    let limit = state.ctx.policy.foreground_task_limit;
    let (project, user, deferred, report) = as_actor(&state, &headers, move |store, actor| {
        let mut plan = store.prepare_project_generation(
            protocol,
            &name,
            &payload,
            key_source.as_ref(),
            actor,
        )?;
        if plan.candidates.len() > limit {
            let project = store.stage_project(&mut plan.project, &actor.user, Utc::now())?;
            return Ok((project, actor.user.clone(), Some(plan), GenerationReport::in_progress()));
        }
        let outcome = store.run_generation(&plan, &actor.user, Utc::now())?;
        Ok((outcome.project, actor.user.clone(), None, outcome.report))
    })
    .await?;
    if let Some(plan) = deferred {
        info!(
            event = "generation_deferred",
            project = %project.name,
            candidates = plan.candidates.len()
        );
        state
            .queue
            .submit(GenerationJob::new(JobPlan::Generate(plan), &user))
            .await?;
    }
    Ok(respond(
        started,
        usize::try_from(report.inserted).unwrap_or(0),
        None,
        json!({ "project": project, "tasks": report }),
    ))
}

async fn upload(
    state: Arc<HubState>,
    headers: HeaderMap,
    protocol: String,
    project: String,
    assignment: Option<String>,
    body: Bytes,
) -> Reply {
    let started = Instant::now();
    let protocol = parse_protocol(&protocol)?;
    let payload = parse_payload(&body)?;
    let limit = state.ctx.policy.foreground_task_limit;
    let (record, deferred, report) = as_actor(&state, &headers, move |store, actor| {
        let mut plan =
            store.prepare_task_upload(protocol, &project, assignment.as_deref(), &payload, actor)?;
        if plan.tasks.len() > limit {
            let record = store.stage_project(&mut plan.project, &actor.user, Utc::now())?;
            return Ok((record, Some(plan), GenerationReport::in_progress()));
        }
        let outcome = store.run_upload(&plan, Utc::now())?;
        Ok((outcome.project, None, outcome.report))
    })
    .await?;
    if let Some(plan) = deferred {
        info!(
            event = "upload_deferred",
            project = %record.name,
            tasks = plan.tasks.len()
        );
        let user = plan.user.clone();
        state
            .queue
            .submit(GenerationJob::new(JobPlan::Upload(plan), &user))
            .await?;
    }
    Ok(respond(
        started,
        usize::try_from(report.inserted).unwrap_or(0),
        None,
        json!({ "project": record, "tasks": report }),
    ))
}

async fn upload_tasks(
    State(state): Shared,
    Path((protocol, project)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    upload(state, headers, protocol, project, None, body).await
}

async fn upload_assigned_tasks(
    State(state): Shared,
    Path((protocol, project, assignment)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    upload(state, headers, protocol, project, Some(assignment), body).await
}

async fn set_active(state: Arc<HubState>, headers: HeaderMap, name: String, active: bool) -> Reply {
    let started = Instant::now();
    let project = as_actor(&state, &headers, move |store, actor| {
        store.set_project_active(&name, active, actor, Utc::now())
    })
    .await?;
    Ok(respond(started, 1, None, json!({ "project": project })))
}

async fn activate_project(State(state): Shared, Path(name): Path<String>, headers: HeaderMap) -> Reply {
    set_active(state, headers, name, true).await
}

async fn deactivate_project(State(state): Shared, Path(name): Path<String>, headers: HeaderMap) -> Reply {
    set_active(state, headers, name, false).await
}

async fn reprioritize_project(State(state): Shared, headers: HeaderMap, body: Bytes) -> Reply {
    let started = Instant::now();
    let payload = parse_payload(&body)?;
    let name = required(&payload, "project_name")?;
    let priority = required(&payload, "priority")?
        .parse::<i64>()
        .map_err(|_| ManagerError::validation("Priority must be an integer"))?;
    let project = as_actor(&state, &headers, move |store, actor| {
        store.set_project_priority(&name, priority, actor, Utc::now())
    })
    .await?;
    Ok(respond(started, 1, None, json!({ "project": project })))
}

async fn delete_project(State(state): Shared, Path(name): Path<String>, headers: HeaderMap) -> Reply {
    let started = Instant::now();
    let deletion = as_actor(&state, &headers, move |store, actor| {
        store.delete_project(&name, actor, Utc::now())
    })
    .await?;
    Ok(respond(started, deletion.tasks, None, json!({ "deleted": deletion })))
}

async fn eligible_projects(State(state): Shared, headers: HeaderMap) -> Reply {
    let started = Instant::now();
    let projects = as_actor(&state, &headers, |store, actor| {
        Ok(store.eligible_projects(actor)?)
    })
    .await?;
    let count = projects.len();
    Ok(respond(started, count, None, json!({ "data": projects })))
}

async fn create_assignment(
    State(state): Shared,
    Path(project): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    let started = Instant::now();
    let payload = parse_payload(&body)?;
    let tasks = match text(&payload, "tasks") {
        Some(count) => Some(
            count
                .parse::<usize>()
                .map_err(|_| ManagerError::validation("tasks must be a non-negative integer"))?,
        ),
        None => None,
    };
    let created = as_actor(&state, &headers, move |store, actor| {
        let record = store
            .project(&project)?
            .ok_or_else(|| ManagerError::not_found(format!("Project {} does not exist", project.trim())))?;
        let request = NewAssignment {
            project: project.clone(),
            name: text(&payload, "name"),
            user: text(&payload, "user"),
            tasks,
            start: flag(&payload, "start"),
            properties: protocol_properties(store, &record.protocol, &payload)?,
        };
        store.create_assignment(&request, actor, Utc::now())
    })
    .await?;
    let count = created.tasks;
    Ok(respond(started, count, None, json!(created)))
}

async fn start_assignment(
    State(state): Shared,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    let started = Instant::now();
    let payload = parse_payload(&body)?;
    let assignment = as_actor(&state, &headers, move |store, actor| {
        let protocol = assignment_protocol(store, &name)?;
        let properties = protocol_properties(store, &protocol, &payload)?;
        store.start_assignment(&name, actor, &properties, Utc::now())
    })
    .await?;
    Ok(respond(started, 1, None, json!({ "assignment": assignment })))
}

async fn complete_assignment(
    State(state): Shared,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    let started = Instant::now();
    let payload = parse_payload(&body)?;
    let allow_incomplete = flag(&payload, "allow_incomplete");
    let completion = as_actor(&state, &headers, move |store, actor| {
        let protocol = assignment_protocol(store, &name)?;
        let properties = protocol_properties(store, &protocol, &payload)?;
        store.complete_assignment(&name, allow_incomplete, actor, &properties, Utc::now())
    })
    .await?;
    let count = usize::from(completion.is_completed());
    Ok(respond(started, count, None, json!(completion)))
}

async fn reset_assignment(State(state): Shared, Path(name): Path<String>, headers: HeaderMap) -> Reply {
    let started = Instant::now();
    let report = as_actor(&state, &headers, move |store, actor| {
        store.reset_assignment(&name, actor, Utc::now())
    })
    .await?;
    Ok(respond(started, 1, None, json!(report)))
}

async fn reassign_assignment(
    State(state): Shared,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    let started = Instant::now();
    let payload = parse_payload(&body)?;
    let user = required(&payload, "user")?;
    let assignment = as_actor(&state, &headers, move |store, actor| {
        store.reassign_assignment(&name, &user, actor, Utc::now())
    })
    .await?;
    Ok(respond(started, 1, None, json!({ "assignment": assignment })))
}

async fn close_out_assignment(
    State(state): Shared,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Reply {
    let started = Instant::now();
    let assignment = as_actor(&state, &headers, move |store, actor| {
        store.close_out(&name, actor, Utc::now())
    })
    .await?;
    Ok(respond(started, 1, None, json!({ "assignment": assignment })))
}

async fn delete_assignment(State(state): Shared, Path(name): Path<String>, headers: HeaderMap) -> Reply {
    let started = Instant::now();
    let released = as_actor(&state, &headers, move |store, actor| {
        store.delete_assignment(&name, actor, Utc::now())
    })
    .await?;
    Ok(respond(started, released, None, json!({ "tasks_released": released })))
}

async fn assignment_json(State(state): Shared, Path(name): Path<String>) -> Result<Json<Value>, HubError> {
    let document = with_store(&state, move |store| store.assignment_tasks_json(&name)).await?;
    Ok(Json(document))
}

async fn start_task(
    State(state): Shared,
    Path(task_id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    let started = Instant::now();
    let payload = parse_payload(&body)?;
    let task = as_actor(&state, &headers, move |store, actor| {
        let protocol = task_protocol(store, task_id)?;
        let properties = protocol_properties(store, &protocol, &payload)?;
        let disposition = text(&payload, "disposition");
        store.start_task(task_id, actor, disposition.as_deref(), &properties, Utc::now())
    })
    .await?;
    Ok(respond(started, 1, None, json!({ "task": task })))
}

async fn complete_task(
    State(state): Shared,
    Path(task_id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    let started = Instant::now();
    let payload = parse_payload(&body)?;
    let completion = as_actor(&state, &headers, move |store, actor| {
        let protocol = task_protocol(store, task_id)?;
        let properties = protocol_properties(store, &protocol, &payload)?;
        let disposition = text(&payload, "disposition");
        store.complete_task(task_id, actor, disposition.as_deref(), &properties, Utc::now())
    })
    .await?;
    Ok(respond(started, 1, None, json!(completion)))
}

async fn update_task_properties(
    State(state): Shared,
    Path(task_id): Path<i64>,
    headers: HeaderMap,
    body: Bytes,
) -> Reply {
    let started = Instant::now();
    let payload = parse_payload(&body)?;
    let properties: BTreeMap<String, String> = payload
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(name, value)| (name.clone(), property_text(value)))
        .collect();
    if properties.is_empty() {
        return Err(ManagerError::validation("No properties to update").into());
    }
    let updated = as_actor(&state, &headers, move |store, actor| {
        store.update_task_properties(task_id, actor, &properties, Utc::now())
    })
    .await?;
    Ok(respond(started, updated, None, json!({ "task_id": task_id, "updated": updated })))
}

async fn read_view(State(state): Shared, uri: Uri, RawQuery(query): RawQuery) -> Reply {
    let started = Instant::now();
    let view = view_for(&uri)?;
    let filters = FilterSet::from_query_string(query.as_deref().unwrap_or_default());
    let rows = with_store(&state, move |store| store.query_view(view, &filters)).await?;
    Ok(rows_reply(started, rows))
}

async fn read_by_id(State(state): Shared, uri: Uri, Path(id): Path<String>) -> Reply {
    let started = Instant::now();
    let view = view_for(&uri)?;
    let id = id
        .trim()
        .parse::<i64>()
        .map_err(|_| ManagerError::validation(format!("{id} is not a valid id")))?;
    let rows = with_store(&state, move |store| store.query_by_id(view, id)).await?;
    Ok(rows_reply(started, rows))
}

async fn read_columns(State(state): Shared, uri: Uri) -> Reply {
    let started = Instant::now();
    let view = view_for(&uri)?;
    let columns = with_store(&state, move |store| Ok(store.view_columns(view)?)).await?;
    let count = columns.len();
    Ok(respond(started, count, None, json!({ "columns": columns })))
}
