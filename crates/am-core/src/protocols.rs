//! Protocol registry: the closed set of proofreading protocols and the
//! declarative behaviour each one contributes to task generation.

use crate::{CandidateKey, ManagerError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Task key mapped to that task's properties.
pub type TaskMap = BTreeMap<String, Map<String, Value>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    CellTypeValidation,
    Cleave,
    ConnectionValidation,
    FocusedMerge,
    OrphanLink,
    Todo,
}

/// How a protocol obtains its candidate task keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopulateMethod {
    /// Candidates come from the external key source.
    KeySource,
    /// Candidates come from a `task list` array in the request payload.
    JsonUpload,
    /// Candidates are supplied as an explicit `tasks` map.
    Explicit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtocolDefinition {
    pub protocol: Protocol,
    pub unit: &'static str,
    pub num_tasks: usize,
    pub populate: PopulateMethod,
    pub optional_properties: &'static [&'static str],
    pub allowable_filters: &'static [&'static str],
    pub required_task_props: &'static [&'static str],
    pub task_insert_props: &'static [&'static str],
    /// Fields joined with `_` to build a task key from an uploaded record.
    #[serde(skip)]
    pub key_fields: &'static [&'static str],
    #[serde(skip)]
    pub allowed_todo_types: &'static [&'static str],
}

const CELL_TYPE_PROPS: &[&str] = &[
    "original_uuid",
    "match_score",
    "task id",
    "comment",
    "assigned",
    "task type",
];

const FOCUSED_MERGE_PROPS: &[&str] = &[
    "supervoxel ID 1",
    "supervoxel ID 2",
    "task type",
    "supervoxel point 1",
    "supervoxel point 2",
];

const TODO_TYPES: &[&str] = &[
    "diagnostic",
    "irrelevant",
    "merge",
    "no_soma",
    "split",
    "svsplit",
    "trace_to_soma",
];

static DEFINITIONS: [ProtocolDefinition; 6] = [
    ProtocolDefinition {
        protocol: Protocol::CellTypeValidation,
        unit: "multibody",
        num_tasks: 100,
        populate: PopulateMethod::JsonUpload,
        optional_properties: &["note", "group", "source"],
        allowable_filters: &[],
        required_task_props: CELL_TYPE_PROPS,
        task_insert_props: CELL_TYPE_PROPS,
        key_fields: &["body ID A", "body ID B"],
        allowed_todo_types: &[],
    },
    ProtocolDefinition {
        protocol: Protocol::Cleave,
        unit: "body_id",
        num_tasks: 100,
        populate: PopulateMethod::KeySource,
        optional_properties: &["size", "roi", "status", "note", "group"],
        allowable_filters: &[],
        required_task_props: &[],
        task_insert_props: &["cluster_name", "post", "pre", "status"],
        key_fields: &[],
        allowed_todo_types: &[],
    },
    ProtocolDefinition {
        protocol: Protocol::ConnectionValidation,
        unit: "xyz",
        num_tasks: 1,
        populate: PopulateMethod::Explicit,
        optional_properties: &["note", "group"],
        allowable_filters: &[],
        required_task_props: &[],
        task_insert_props: &[],
        key_fields: &[],
        allowed_todo_types: &[],
    },
    ProtocolDefinition {
        protocol: Protocol::FocusedMerge,
        unit: "multibody",
        num_tasks: 250,
        populate: PopulateMethod::JsonUpload,
        optional_properties: &["note", "group", "source"],
        allowable_filters: &[],
        required_task_props: FOCUSED_MERGE_PROPS,
        task_insert_props: FOCUSED_MERGE_PROPS,
        key_fields: &["supervoxel ID 1", "supervoxel ID 2"],
        allowed_todo_types: &[],
    },
    ProtocolDefinition {
        protocol: Protocol::OrphanLink,
        unit: "body_id",
        num_tasks: 100,
        populate: PopulateMethod::KeySource,
        optional_properties: &["roi", "status", "note"],
        allowable_filters: &["post", "pre", "size"],
        required_task_props: &[],
        task_insert_props: &[],
        key_fields: &[],
        allowed_todo_types: &[],
    },
    ProtocolDefinition {
        protocol: Protocol::Todo,
        unit: "xyz",
        num_tasks: 1,
        populate: PopulateMethod::Explicit,
        optional_properties: &["note", "group", "source"],
        allowable_filters: &[],
        required_task_props: &["priority", "todo_type"],
        task_insert_props: &["priority", "todo_type"],
        key_fields: &[],
        allowed_todo_types: TODO_TYPES,
    },
];

impl Protocol {
    pub const ALL: [Protocol; 6] = [
        Protocol::CellTypeValidation,
        Protocol::Cleave,
        Protocol::ConnectionValidation,
        Protocol::FocusedMerge,
        Protocol::OrphanLink,
        Protocol::Todo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::CellTypeValidation => "cell_type_validation",
            Protocol::Cleave => "cleave",
            Protocol::ConnectionValidation => "connection_validation",
            Protocol::FocusedMerge => "focused_merge",
            Protocol::OrphanLink => "orphan_link",
            Protocol::Todo => "todo",
        }
    }

    pub fn definition(&self) -> &'static ProtocolDefinition {
        let index = match self {
            Protocol::CellTypeValidation => 0,
            Protocol::Cleave => 1,
            Protocol::ConnectionValidation => 2,
            Protocol::FocusedMerge => 3,
            Protocol::OrphanLink => 4,
            Protocol::Todo => 5,
        };
        &DEFINITIONS[index]
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        Protocol::ALL
            .into_iter()
            .find(|protocol| protocol.as_str() == normalized)
            .ok_or_else(|| format!("Unknown protocol: {normalized}"))
    }
}

impl ProtocolDefinition {
    /// Builds the task map for a creation request.
    ///
    /// Upload protocols read the `task list` array and synthesise keys from
    /// `key_fields`; the others expect a `tasks` object keyed by task key.
    pub fn parse_task_payload(&self, payload: &Map<String, Value>) -> Result<TaskMap, ManagerError> {
        match self.populate {
            PopulateMethod::JsonUpload => self.parse_task_list(payload),
            _ => {
                let tasks = payload
                    .get("tasks")
                    .ok_or_else(|| ManagerError::validation("No tasks found in JSON payload"))?;
                let tasks = tasks.as_object().ok_or_else(|| {
                    ManagerError::validation("tasks payload must be a JSON dictionary")
                })?;
                let mut parsed = TaskMap::new();
                for (key, properties) in tasks {
                    let properties = match properties {
                        Value::Object(map) => map.clone(),
                        Value::Null => Map::new(),
                        _ => {
                            return Err(ManagerError::validation(format!(
                                "Properties for task {key} must be a JSON dictionary"
                            )))
                        }
                    };
                    parsed.insert(key.clone(), properties);
                }
                if parsed.is_empty() {
                    return Err(ManagerError::validation("No tasks found in JSON payload"));
                }
                Ok(parsed)
            }
        }
    }

    fn parse_task_list(&self, payload: &Map<String, Value>) -> Result<TaskMap, ManagerError> {
        let list = payload.get("task list").ok_or_else(|| {
            ManagerError::validation(format!("{} requires a task list", self.protocol))
        })?;
        let list = list
            .as_array()
            .ok_or_else(|| ManagerError::validation("tasks payload must be a JSON list"))?;

        let mut parsed = TaskMap::new();
        for entry in list {
            let record = entry
                .as_object()
                .ok_or_else(|| ManagerError::validation("task list entries must be JSON objects"))?;
            let mut parts = Vec::with_capacity(self.key_fields.len());
            for field in self.key_fields {
                let value = record.get(*field).ok_or_else(|| {
                    ManagerError::validation(format!("Missing {field} in task list entry"))
                })?;
                parts.push(property_text(value));
            }
            let key = parts.join("_");
            let mut properties = Map::new();
            for prop in self.task_insert_props {
                match record.get(*prop) {
                    Some(value) => {
                        properties.insert((*prop).to_string(), value.clone());
                    }
                    None if self.required_task_props.contains(prop) => {
                        return Err(ManagerError::validation(format!(
                            "Missing {prop} for task {key}"
                        )));
                    }
                    None => {}
                }
            }
            parsed.insert(key, properties);
        }
        if parsed.is_empty() {
            return Err(ManagerError::validation("No tasks found in JSON payload"));
        }
        Ok(parsed)
    }

    pub fn validate_tasks(&self, tasks: &TaskMap) -> Result<(), ManagerError> {
        for (key, properties) in tasks {
            for prop in self.required_task_props {
                if !properties.contains_key(*prop) {
                    return Err(ManagerError::validation(format!(
                        "Missing task property {prop} for task {key}"
                    )));
                }
            }
            if !self.allowed_todo_types.is_empty() {
                let todo_type = properties
                    .get("todo_type")
                    .map(property_text)
                    .unwrap_or_default();
                if !self.allowed_todo_types.contains(&todo_type.as_str()) {
                    return Err(ManagerError::validation(format!(
                        "Invalid task type {todo_type} for task {key}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// True when every allowable filter present in `filters` is met by the
    /// candidate (numeric value at or above the threshold).
    pub fn passes_filters(&self, candidate: &CandidateKey, filters: &BTreeMap<String, String>) -> bool {
        for name in self.allowable_filters {
            let Some(threshold) = filters.get(*name) else {
                continue;
            };
            let Ok(threshold) = threshold.trim().parse::<i64>() else {
                return false;
            };
            let value = candidate
                .properties
                .get(*name)
                .and_then(numeric_value)
                .unwrap_or(0);
            if value < threshold {
                return false;
            }
        }
        true
    }

    /// Applies the allowable filters and orders the survivors by timestamp.
    pub fn select_candidates(
        &self,
        candidates: Vec<CandidateKey>,
        filters: &BTreeMap<String, String>,
    ) -> Vec<CandidateKey> {
        let mut selected = candidates
            .into_iter()
            .filter(|candidate| self.passes_filters(candidate, filters))
            .collect::<Vec<_>>();
        selected.sort_by(|left, right| left.timestamp.cmp(&right.timestamp));
        selected
    }

    /// The subset of `properties` this protocol stores on a new task, rendered as text.
    pub fn insert_properties(&self, properties: &Map<String, Value>) -> Vec<(String, String)> {
        self.task_insert_props
            .iter()
            .filter_map(|name| {
                properties
                    .get(*name)
                    .map(|value| ((*name).to_string(), property_text(value)))
            })
            .collect()
    }

    pub fn optional_values(&self, payload: &Map<String, Value>) -> Vec<(String, String)> {
        self.optional_properties
            .iter()
            .filter_map(|name| {
                payload
                    .get(*name)
                    .filter(|value| !value.is_null())
                    .map(|value| ((*name).to_string(), property_text(value)))
            })
            .collect()
    }
}

/// Name-keyed lookup over the protocol definitions.
#[derive(Debug, Clone)]
pub struct ProtocolRegistry {
    by_name: BTreeMap<&'static str, &'static ProtocolDefinition>,
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        let by_name = DEFINITIONS
            .iter()
            .map(|definition| (definition.protocol.as_str(), definition))
            .collect();
        Self { by_name }
    }

    pub fn lookup(&self, name: &str) -> Result<&'static ProtocolDefinition, ManagerError> {
        self.by_name
            .get(name.trim())
            .copied()
            .ok_or_else(|| ManagerError::validation(format!("{} is not a valid protocol", name.trim())))
    }

    pub fn definitions(&self) -> impl Iterator<Item = &'static ProtocolDefinition> + '_ {
        self.by_name.values().copied()
    }
}

/// Text form of a JSON property value: strings verbatim, everything else as JSON.
pub fn property_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

const INTEGER_PROPERTIES: &[&str] = &["body ID A", "body ID B", "supervoxel ID 1", "supervoxel ID 2"];
const POINT_PROPERTIES: &[&str] = &[
    "body point 1",
    "body point 2",
    "supervoxel point 1",
    "supervoxel point 2",
];

/// Renders a stored property back into the JSON type client tools expect.
pub fn typed_property_value(name: &str, stored: &str) -> Value {
    if INTEGER_PROPERTIES.contains(&name) {
        if let Ok(number) = stored.trim().parse::<i64>() {
            return Value::from(number);
        }
    }
    if POINT_PROPERTIES.contains(&name) {
        if let Ok(point) = serde_json::from_str::<Value>(stored) {
            return point;
        }
    }
    Value::String(stored.to_string())
}

fn numeric_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64)),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn registry_resolves_every_protocol_by_name() {
        let registry = ProtocolRegistry::new();
        for protocol in Protocol::ALL {
            let definition = registry.lookup(protocol.as_str()).expect("registered");
            assert_eq!(definition.protocol, protocol);
            assert_eq!(protocol.definition().protocol, protocol);
        }
        let err = registry.lookup("telepathy").expect_err("unknown protocol");
        assert_eq!(err.status_code(), 400);
        assert_eq!("Focused_Merge".parse::<Protocol>(), Ok(Protocol::FocusedMerge));
    }

    #[test]
    fn focused_merge_builds_keys_from_supervoxel_ids() {
        let payload = object(json!({
            "task list": [{
                "supervoxel ID 1": 101,
                "supervoxel ID 2": 202,
                "task type": "merge",
                "supervoxel point 1": [1, 2, 3],
                "supervoxel point 2": [4, 5, 6]
            }]
        }));
        let tasks = Protocol::FocusedMerge
            .definition()
            .parse_task_payload(&payload)
            .expect("parse");
        let properties = tasks.get("101_202").expect("synthesised key");
        assert_eq!(properties["task type"], "merge");
        assert_eq!(properties.len(), 5);
    }

    #[test]
    fn upload_rejects_missing_required_property() {
        let payload = object(json!({
            "task list": [{"body ID A": 1, "body ID B": 2, "original_uuid": "x"}]
        }));
        let err = Protocol::CellTypeValidation
            .definition()
            .parse_task_payload(&payload)
            .expect_err("missing props");
        assert_eq!(err, ManagerError::validation("Missing match_score for task 1_2"));

        let err = Protocol::CellTypeValidation
            .definition()
            .parse_task_payload(&Map::new())
            .expect_err("no task list");
        assert!(err.to_string().contains("requires a task list"));
    }

    #[test]
    fn explicit_tasks_must_be_a_dictionary() {
        let definition = Protocol::ConnectionValidation.definition();
        let err = definition
            .parse_task_payload(&object(json!({"tasks": [1, 2]})))
            .expect_err("list payload");
        assert_eq!(err.to_string(), "tasks payload must be a JSON dictionary");

        let tasks = definition
            .parse_task_payload(&object(json!({"tasks": {"1_2_3": {}, "4_5_6": null}})))
            .expect("parse");
        assert_eq!(tasks.keys().cloned().collect::<Vec<_>>(), vec!["1_2_3", "4_5_6"]);
    }

    #[test]
    fn todo_validation_checks_required_props_and_type() {
        let definition = Protocol::Todo.definition();
        let mut tasks = TaskMap::new();
        tasks.insert(
            "10_20_30".to_string(),
            object(json!({"priority": 1, "todo_type": "split"})),
        );
        definition.validate_tasks(&tasks).expect("valid todo");

        tasks.insert(
            "40_50_60".to_string(),
            object(json!({"priority": 1, "todo_type": "tidy"})),
        );
        let err = definition.validate_tasks(&tasks).expect_err("bad type");
        assert_eq!(err.to_string(), "Invalid task type tidy for task 40_50_60");

        tasks.clear();
        tasks.insert("1_1_1".to_string(), object(json!({"todo_type": "merge"})));
        let err = definition.validate_tasks(&tasks).expect_err("missing priority");
        assert_eq!(err.to_string(), "Missing task property priority for task 1_1_1");
    }

    #[test]
    fn orphan_link_filters_keep_candidates_at_or_above_threshold() {
        let definition = Protocol::OrphanLink.definition();
        let candidate = |key: &str, size: i64, timestamp: &str| CandidateKey {
            key: key.to_string(),
            properties: object(json!({"size": size, "pre": 3})),
            timestamp: Some(timestamp.to_string()),
        };
        let mut filters = BTreeMap::new();
        filters.insert("size".to_string(), "50".to_string());
        filters.insert("roi".to_string(), "ignored".to_string());

        let selected = definition.select_candidates(
            vec![
                candidate("3", 70, "2024-03-01"),
                candidate("1", 49, "2024-01-01"),
                candidate("2", 50, "2024-02-01"),
            ],
            &filters,
        );
        let keys = selected.iter().map(|c| c.key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["2", "3"]);
    }

    #[test]
    fn typed_values_restore_ids_and_points() {
        assert_eq!(typed_property_value("body ID A", "12345"), json!(12345));
        assert_eq!(typed_property_value("supervoxel point 1", "[1,2,3]"), json!([1, 2, 3]));
        assert_eq!(typed_property_value("note", "12"), json!("12"));
    }

    #[test]
    fn insert_properties_render_text() {
        let definition = Protocol::Cleave.definition();
        let rendered = definition.insert_properties(&object(json!({
            "cluster_name": "alpha",
            "post": 12,
            "unrelated": true
        })));
        assert_eq!(
            rendered,
            vec![
                ("cluster_name".to_string(), "alpha".to_string()),
                ("post".to_string(), "12".to_string()),
            ]
        );
    }
}
