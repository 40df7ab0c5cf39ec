//! Seams to the systems around the lifecycle engine: the notification bus,
//! the search index holding denormalised lifecycle events, and the
//! connectome key source used to populate projects.

use crate::{ManagerError, Protocol};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::info;

pub trait NotificationBus: Send + Sync {
    fn publish(&self, topic: &str, message: &Value) -> Result<(), ManagerError>;
}

pub trait SearchIndex: Send + Sync {
    /// Removes the documents for `assignment_id` from every index matching
    /// `index_pattern`, returning how many were deleted. A missing index is
    /// reported as `ManagerError::NotFound`.
    fn purge_assignment(&self, index_pattern: &str, assignment_id: i64)
        -> Result<u64, ManagerError>;
}

pub trait KeySource: Send + Sync {
    /// Candidate keys for a new project. `query` holds the request's
    /// protocol properties (roi, status, size, ...).
    fn candidates(
        &self,
        protocol: Protocol,
        query: &BTreeMap<String, String>,
    ) -> Result<Vec<CandidateKey>, ManagerError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateKey {
    pub key: String,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl CandidateKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            properties: Map::new(),
            timestamp: None,
        }
    }
}

/// Writes every message to the log instead of a broker.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingBus;

impl NotificationBus for TracingBus {
    fn publish(&self, topic: &str, message: &Value) -> Result<(), ManagerError> {
        info!(event = "notification", topic, message = %message);
        Ok(())
    }
}

/// Keeps published messages in memory; handy for embedding and tests.
#[derive(Debug, Default)]
pub struct RecordingBus {
    messages: Mutex<Vec<(String, Value)>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, Value)> {
        self.messages
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn topic(&self, topic: &str) -> Vec<Value> {
        self.messages()
            .into_iter()
            .filter(|(name, _)| name == topic)
            .map(|(_, message)| message)
            .collect()
    }
}

impl NotificationBus for RecordingBus {
    fn publish(&self, topic: &str, message: &Value) -> Result<(), ManagerError> {
        let mut guard = self
            .messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.push((topic.to_string(), message.clone()));
        Ok(())
    }
}

/// Search index stand-in for deployments without one.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSearchIndex;

impl SearchIndex for NullSearchIndex {
    fn purge_assignment(&self, _index_pattern: &str, _assignment_id: i64) -> Result<u64, ManagerError> {
        Ok(0)
    }
}

/// Serves a fixed candidate list, optionally split per protocol.
#[derive(Debug, Default, Clone)]
pub struct StaticKeySource {
    shared: Vec<CandidateKey>,
    by_protocol: BTreeMap<Protocol, Vec<CandidateKey>>,
}

impl StaticKeySource {
    pub fn new(candidates: Vec<CandidateKey>) -> Self {
        Self {
            shared: candidates,
            by_protocol: BTreeMap::new(),
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol, candidates: Vec<CandidateKey>) -> Self {
        self.by_protocol.insert(protocol, candidates);
        self
    }
}

impl KeySource for StaticKeySource {
    fn candidates(
        &self,
        protocol: Protocol,
        _query: &BTreeMap<String, String>,
    ) -> Result<Vec<CandidateKey>, ManagerError> {
        Ok(self
            .by_protocol
            .get(&protocol)
            .unwrap_or(&self.shared)
            .clone())
    }
}

/// Key source used when no upstream is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableKeySource;

impl KeySource for UnavailableKeySource {
    fn candidates(
        &self,
        protocol: Protocol,
        _query: &BTreeMap<String, String>,
    ) -> Result<Vec<CandidateKey>, ManagerError> {
        Err(ManagerError::upstream(
            Some(503),
            format!("no key source is configured for {protocol}"),
        ))
    }
}
