pub mod collaborators;
pub mod protocols;
pub mod working_hours;

pub use collaborators::{
    CandidateKey, KeySource, NotificationBus, NullSearchIndex, RecordingBus, SearchIndex,
    StaticKeySource, TracingBus, UnavailableKeySource,
};
pub use protocols::{PopulateMethod, Protocol, ProtocolDefinition, ProtocolRegistry, TaskMap};
pub use working_hours::{working_duration, HolidayCalendar, WorkCalendar};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DISPOSITION_IN_PROGRESS: &str = "In progress";
pub const DISPOSITION_COMPLETE: &str = "Complete";

pub const AUDIT_INSERTED: &str = "Inserted";
pub const AUDIT_ASSIGNED: &str = "Assigned";
pub const AUDIT_REASSIGNED: &str = "Reassigned";
pub const AUDIT_UNASSIGNED: &str = "Unassigned";
pub const AUDIT_RESET: &str = "Reset";

pub const PERMISSION_ADMIN: &str = "admin";
pub const PERMISSION_SUPER: &str = "super";

pub const TOPIC_ASSIGNMENT_START: &str = "assignment_start";
pub const TOPIC_ASSIGNMENT_COMPLETE: &str = "assignment_complete";

/// Broad failure classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    NotFound,
    Conflict,
    Store,
    Upstream,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Validation => "validation",
            ErrorClass::NotFound => "not_found",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Store => "store",
            ErrorClass::Upstream => "upstream",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ManagerError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    /// Message is already sanitised; driver details are logged, never returned.
    #[error("{0}")]
    Store(String),
    #[error("{message}")]
    Upstream { status: Option<u16>, message: String },
}

impl ManagerError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Upstream {
            status,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ManagerError::Validation(_) => ErrorClass::Validation,
            ManagerError::NotFound(_) => ErrorClass::NotFound,
            ManagerError::Conflict(_) => ErrorClass::Conflict,
            ManagerError::Store(_) => ErrorClass::Store,
            ManagerError::Upstream { .. } => ErrorClass::Upstream,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            ManagerError::Validation(_) => 400,
            ManagerError::NotFound(_) => 404,
            ManagerError::Conflict(_) => 409,
            ManagerError::Store(_) => 500,
            ManagerError::Upstream { status, .. } => status.unwrap_or(502),
        }
    }

    pub fn payload(&self) -> Value {
        json!({
            "rest": {
                "error": self.to_string(),
                "status": self.status_code(),
                "class": self.class().as_str(),
            }
        })
    }
}

/// Tunables shared by every lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerPolicy {
    pub allow_partial_assignments: bool,
    pub foreground_task_limit: usize,
    pub enable_cdc: bool,
    pub cdc_topic: String,
}

impl Default for ManagerPolicy {
    fn default() -> Self {
        Self {
            allow_partial_assignments: false,
            foreground_task_limit: 1000,
            enable_cdc: false,
            cdc_topic: "assignment_manager_cdc".to_string(),
        }
    }
}

/// The user an operation is performed on behalf of, with the permissions
/// the identity collaborator reported for them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user: String,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
}

impl Actor {
    pub fn new<I, S>(user: impl Into<String>, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user: user.into(),
            permissions: permissions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    pub fn is_admin(&self) -> bool {
        self.has_permission(PERMISSION_ADMIN) || self.is_super()
    }

    pub fn is_super(&self) -> bool {
        self.has_permission(PERMISSION_SUPER)
    }

    pub fn require_admin(&self, action: &str) -> Result<(), ManagerError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(ManagerError::validation(format!(
                "You don't have permission to {action}"
            )))
        }
    }

    pub fn require_super(&self, action: &str) -> Result<(), ManagerError> {
        if self.is_super() {
            Ok(())
        } else {
            Err(ManagerError::validation(format!(
                "You don't have permission to {action}"
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Unassigned,
    Assigned,
    Started,
    Completed,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Unassigned => "unassigned",
            TaskState::Assigned => "assigned",
            TaskState::Started => "started",
            TaskState::Completed => "completed",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentState {
    Created,
    Started,
    Completed,
}

impl AssignmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentState::Created => "created",
            AssignmentState::Started => "started",
            AssignmentState::Completed => "completed",
        }
    }
}

impl fmt::Display for AssignmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entities that carry a free-form property map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyOwner {
    Project,
    Assignment,
    Task,
}

impl PropertyOwner {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyOwner::Project => "project",
            PropertyOwner::Assignment => "assignment",
            PropertyOwner::Task => "task",
        }
    }
}

impl fmt::Display for PropertyOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropertyOwner {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "project" => Ok(PropertyOwner::Project),
            "assignment" => Ok(PropertyOwner::Assignment),
            "task" => Ok(PropertyOwner::Task),
            other => Err(format!("Unknown property owner: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: i64,
    pub name: String,
    pub protocol: String,
    pub priority: i64,
    pub active: bool,
    pub disposition: Option<String>,
    pub create_date: DateTime<Utc>,
}

impl ProjectRecord {
    pub fn is_complete(&self) -> bool {
        self.disposition.as_deref() == Some(DISPOSITION_COMPLETE)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub id: i64,
    pub name: String,
    pub project_id: i64,
    pub project: String,
    pub protocol: String,
    pub user: String,
    pub disposition: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub completion_date: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub working_duration: Option<i64>,
    pub create_date: DateTime<Utc>,
}

impl AssignmentRecord {
    pub fn state(&self) -> AssignmentState {
        if self.completion_date.is_some() {
            AssignmentState::Completed
        } else if self.start_date.is_some() {
            AssignmentState::Started
        } else {
            AssignmentState::Created
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub name: String,
    pub project_id: i64,
    pub project: String,
    pub protocol: String,
    pub assignment_id: Option<i64>,
    pub assignment: Option<String>,
    pub key_type_id: i64,
    pub key_type: String,
    pub key_text: String,
    pub user: Option<String>,
    pub disposition: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub completion_date: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub working_duration: Option<i64>,
    pub create_date: DateTime<Utc>,
}

impl TaskRecord {
    pub fn state(&self) -> TaskState {
        if self.completion_date.is_some() {
            TaskState::Completed
        } else if self.start_date.is_some() {
            TaskState::Started
        } else if self.assignment_id.is_some() {
            TaskState::Assigned
        } else {
            TaskState::Unassigned
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub task_id: Option<i64>,
    pub project_id: i64,
    pub assignment_id: Option<i64>,
    pub key_type: Option<String>,
    pub key_text: Option<String>,
    pub disposition: String,
    pub note: Option<String>,
    pub user: String,
    pub create_date: DateTime<Utc>,
}

/// Default assignment name: project name plus an eight character suffix.
pub fn default_assignment_name(project: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{project} {}", &suffix[..8])
}
