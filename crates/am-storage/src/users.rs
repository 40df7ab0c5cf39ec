use crate::{begin_immediate, AssignmentStore, StorageError};
use am_core::{Actor, ManagerError};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub name: String,
    #[serde(default)]
    pub first: Option<String>,
    #[serde(default)]
    pub last: Option<String>,
    #[serde(default)]
    pub janelia_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
}

impl NewUser {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

pub(crate) fn load_actor(conn: &Connection, user: &str) -> Result<Option<Actor>, StorageError> {
    let exists = conn
        .query_row("SELECT id FROM users WHERE name = ?1", [user], |row| {
            row.get::<_, i64>(0)
        })
        .optional()?;
    let Some(user_id) = exists else {
        return Ok(None);
    };
    let mut stmt = conn.prepare("SELECT permission FROM user_permission WHERE user_id = ?1")?;
    let rows = stmt.query_map([user_id], |row| row.get::<_, String>(0))?;
    let mut permissions = Vec::new();
    for row in rows {
        permissions.push(row?);
    }
    Ok(Some(Actor::new(user, permissions)))
}

/// Resolves who an assignment is for. Acting for someone else needs admin,
/// and the assignee must hold the protocol permission.
pub(crate) fn select_user(
    conn: &Connection,
    protocol: &str,
    requested: Option<&str>,
    actor: &Actor,
) -> Result<String, ManagerError> {
    let target = match requested.map(str::trim).filter(|name| !name.is_empty()) {
        Some(name) if name != actor.user => {
            if !actor.is_admin() {
                return Err(ManagerError::validation(
                    "You don't have permission to assign jobs to other users",
                ));
            }
            load_actor(conn, name)?
                .ok_or_else(|| ManagerError::validation(format!("User {name} does not exist")))?
        }
        _ => load_actor(conn, &actor.user)?.unwrap_or_else(|| actor.clone()),
    };
    if !target.has_permission(protocol) {
        return Err(ManagerError::validation(format!(
            "{} doesn't have permission to process {protocol} assignments",
            target.user
        )));
    }
    Ok(target.user)
}

impl AssignmentStore {
    pub fn add_user(&mut self, user: &NewUser) -> Result<i64, ManagerError> {
        let name = user.name.trim();
        if name.is_empty() {
            return Err(ManagerError::validation("User name is required"));
        }
        let tx = begin_immediate(&mut self.conn)?;
        let changes = tx
            .execute(
                "
                INSERT OR IGNORE INTO users (name, first, last, janelia_id, email, organization)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
                params![
                    name,
                    user.first,
                    user.last,
                    user.janelia_id,
                    user.email,
                    user.organization
                ],
            )
            .map_err(StorageError::from)?;
        if changes == 0 {
            return Err(ManagerError::conflict(format!("User {name} already exists")));
        }
        let id = tx.last_insert_rowid();
        tx.commit().map_err(StorageError::from)?;
        Ok(id)
    }

    /// Grants permissions; already-held permissions are left alone.
    pub fn grant_permissions<'a, I>(&mut self, user: &str, permissions: I) -> Result<usize, ManagerError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let tx = begin_immediate(&mut self.conn)?;
        let user_id = tx
            .query_row("SELECT id FROM users WHERE name = ?1", [user], |row| {
                row.get::<_, i64>(0)
            })
            .optional()
            .map_err(StorageError::from)?
            .ok_or_else(|| ManagerError::not_found(format!("User {user} does not exist")))?;
        let mut granted = 0;
        for permission in permissions {
            granted += tx
                .execute(
                    "INSERT OR IGNORE INTO user_permission (user_id, permission) VALUES (?1, ?2)",
                    params![user_id, permission.trim()],
                )
                .map_err(StorageError::from)?;
        }
        tx.commit().map_err(StorageError::from)?;
        Ok(granted)
    }

    pub fn revoke_permission(&mut self, user: &str, permission: &str) -> Result<bool, ManagerError> {
        let tx = begin_immediate(&mut self.conn)?;
        let removed = tx
            .execute(
                "
                DELETE FROM user_permission
                WHERE permission = ?2
                  AND user_id = (SELECT id FROM users WHERE name = ?1)
                ",
                params![user, permission],
            )
            .map_err(StorageError::from)?;
        tx.commit().map_err(StorageError::from)?;
        Ok(removed > 0)
    }

    pub fn actor(&self, user: &str) -> Result<Option<Actor>, StorageError> {
        load_actor(&self.conn, user)
    }

    pub fn require_actor(&self, user: &str) -> Result<Actor, ManagerError> {
        self.actor(user)?
            .ok_or_else(|| ManagerError::validation(format!("User {user} does not exist")))
    }
}
