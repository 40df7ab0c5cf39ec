use am_core::{CandidateKey, KeySource, ManagerError, Protocol};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Reads candidate keys from a JSON document shaped
/// `{"<protocol>": [{"key": ..., "properties": {...}, "timestamp": ...}]}`.
/// The file is re-read on every request so an exporter can refresh it.
#[derive(Debug, Clone)]
pub struct FileKeySource {
    path: PathBuf,
}

impl FileKeySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl KeySource for FileKeySource {
    fn candidates(
        &self,
        protocol: Protocol,
        query: &BTreeMap<String, String>,
    ) -> Result<Vec<CandidateKey>, ManagerError> {
        let text = std::fs::read_to_string(&self.path).map_err(|err| {
            warn!(event = "key_source_unreadable", path = %self.path.display(), error = %err);
            ManagerError::upstream(Some(503), "Key source is unavailable")
        })?;
        let mut by_protocol: BTreeMap<String, Vec<CandidateKey>> = serde_json::from_str(&text)
            .map_err(|err| {
                warn!(event = "key_source_malformed", path = %self.path.display(), error = %err);
                ManagerError::upstream(Some(502), "Key source returned malformed data")
            })?;
        let candidates = by_protocol.remove(protocol.as_str()).unwrap_or_default();
        debug!(
            event = "key_source_query",
            protocol = %protocol,
            filters = query.len(),
            candidates = candidates.len()
        );
        Ok(candidates)
    }
}
