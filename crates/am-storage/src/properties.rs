use crate::key_types::TermRegistry;
use crate::{format_timestamp, AssignmentStore, StorageError};
use am_core::{ManagerError, PropertyOwner};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::BTreeMap;

fn table(owner: PropertyOwner) -> &'static str {
    match owner {
        PropertyOwner::Project => "project_property",
        PropertyOwner::Assignment => "assignment_property",
        PropertyOwner::Task => "task_property",
    }
}

fn owner_column(owner: PropertyOwner) -> &'static str {
    match owner {
        PropertyOwner::Project => "project_id",
        PropertyOwner::Assignment => "assignment_id",
        PropertyOwner::Task => "task_id",
    }
}

/// Inserts or overwrites one property. The name must be a term in the
/// owner's property vocabulary.
pub(crate) fn upsert_property(
    conn: &Connection,
    terms: &TermRegistry,
    owner: PropertyOwner,
    owner_id: i64,
    name: &str,
    value: &str,
    now: DateTime<Utc>,
) -> Result<(), ManagerError> {
    let type_id = terms.term_id(conn, owner.as_str(), name)?.ok_or_else(|| {
        ManagerError::validation(format!("{name} is not a valid {owner} property"))
    })?;
    let sql = format!(
        "
        INSERT INTO {table} ({column}, type_id, value, create_date)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT({column}, type_id) DO UPDATE SET value = excluded.value
        ",
        table = table(owner),
        column = owner_column(owner),
    );
    conn.execute(&sql, params![owner_id, type_id, value, format_timestamp(now)])
        .map_err(StorageError::from)?;
    Ok(())
}

pub(crate) fn upsert_properties<'a, I>(
    conn: &Connection,
    terms: &TermRegistry,
    owner: PropertyOwner,
    owner_id: i64,
    properties: I,
    now: DateTime<Utc>,
) -> Result<usize, ManagerError>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut written = 0;
    for (name, value) in properties {
        upsert_property(conn, terms, owner, owner_id, name, value, now)?;
        written += 1;
    }
    Ok(written)
}

pub(crate) fn load_properties(
    conn: &Connection,
    owner: PropertyOwner,
    owner_id: i64,
) -> Result<BTreeMap<String, String>, StorageError> {
    let sql = format!(
        "
        SELECT t.name, p.value
        FROM {table} p
        JOIN cv_term t ON (t.id = p.type_id)
        WHERE p.{column} = ?1
        ",
        table = table(owner),
        column = owner_column(owner),
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([owner_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
    let mut properties = BTreeMap::new();
    for row in rows {
        let (name, value): (String, String) = row?;
        properties.insert(name, value);
    }
    Ok(properties)
}

pub(crate) fn delete_properties(
    conn: &Connection,
    owner: PropertyOwner,
    owner_id: i64,
) -> Result<usize, StorageError> {
    let sql = format!(
        "DELETE FROM {table} WHERE {column} = ?1",
        table = table(owner),
        column = owner_column(owner),
    );
    Ok(conn.execute(&sql, [owner_id])?)
}

impl AssignmentStore {
    pub fn properties(
        &self,
        owner: PropertyOwner,
        owner_id: i64,
    ) -> Result<BTreeMap<String, String>, StorageError> {
        load_properties(&self.conn, owner, owner_id)
    }

    pub fn property(
        &self,
        owner: PropertyOwner,
        owner_id: i64,
        name: &str,
    ) -> Result<Option<String>, StorageError> {
        Ok(self.properties(owner, owner_id)?.remove(name))
    }

    /// Upserts a batch of properties in one unit of work; an unknown name
    /// rejects the whole batch.
    pub fn set_properties(
        &mut self,
        owner: PropertyOwner,
        owner_id: i64,
        properties: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<usize, ManagerError> {
        let tx = crate::begin_immediate(&mut self.conn)?;
        let written = upsert_properties(&tx, &self.ctx.terms, owner, owner_id, properties, now)?;
        tx.commit().map_err(StorageError::from)?;
        Ok(written)
    }
}
