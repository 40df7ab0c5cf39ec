//! Process-wide cache of controlled-vocabulary terms.
//!
//! Each vocabulary (`key`, `protocol`, `disposition`, property types) is
//! loaded on first use and kept until [`TermRegistry::reload`] is called.

use crate::StorageError;
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

pub const KEY_TYPE_CV: &str = "key";
pub const PROTOCOL_CV: &str = "protocol";
pub const DISPOSITION_CV: &str = "disposition";

type TermIds = HashMap<String, i64>;

#[derive(Debug, Default)]
pub struct TermRegistry {
    vocabularies: RwLock<HashMap<String, TermIds>>,
}

impl TermRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Numeric id of a key type such as `body_id`.
    pub fn key_type_id(&self, conn: &Connection, key_type: &str) -> Result<Option<i64>, StorageError> {
        self.term_id(conn, KEY_TYPE_CV, key_type)
    }

    pub fn term_id(&self, conn: &Connection, cv: &str, term: &str) -> Result<Option<i64>, StorageError> {
        {
            let cached = self
                .vocabularies
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(terms) = cached.get(cv) {
                return Ok(terms.get(term).copied());
            }
        }

        let mut cache = self
            .vocabularies
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // Another caller may have populated it while we waited for the lock.
        if !cache.contains_key(cv) {
            let terms = load_vocabulary(conn, cv)?;
            debug!(event = "vocabulary_loaded", cv, terms = terms.len());
            cache.insert(cv.to_string(), terms);
        }
        Ok(cache.get(cv).and_then(|terms| terms.get(term).copied()))
    }

    pub fn is_valid_term(&self, conn: &Connection, cv: &str, term: &str) -> Result<bool, StorageError> {
        Ok(self.term_id(conn, cv, term)?.is_some())
    }

    pub fn is_loaded(&self, cv: &str) -> bool {
        self.vocabularies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(cv)
    }

    pub fn reload(&self) {
        let mut cache = self
            .vocabularies
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        cache.clear();
        debug!(event = "vocabulary_cache_cleared");
    }
}

fn load_vocabulary(conn: &Connection, cv: &str) -> Result<TermIds, StorageError> {
    let mut stmt = conn.prepare(
        "
        SELECT t.id, t.name
        FROM cv_term t
        JOIN cv c ON (c.id = t.cv_id)
        WHERE c.name = ?1 AND t.is_current = 1
        ",
    )?;
    let rows = stmt.query_map([cv], |row| Ok((row.get::<_, String>(1)?, row.get::<_, i64>(0)?)))?;
    let mut terms = TermIds::new();
    for row in rows {
        let (name, id) = row?;
        terms.insert(name, id);
    }
    Ok(terms)
}
