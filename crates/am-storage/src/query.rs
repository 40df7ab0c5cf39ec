//! Translates a generic constraint set (query-string DSL) into a
//! parameterised read statement against one of the store's views.
//!
//! Field names carry an optional trailing operator marker: `!` negates,
//! `>` and `<` compare inclusively. A `*` in the value switches the clause
//! to a `LIKE` match. `_sort`, `_columns` and `_distinct` are control keys.

use crate::{AssignmentStore, StorageError};
use am_core::ManagerError;
use regex::Regex;
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::OnceLock;

pub const SORT_KEY: &str = "_sort";
pub const COLUMNS_KEY: &str = "_columns";
pub const DISTINCT_KEY: &str = "_distinct";

/// Always-false guard appended when any part of the request is unusable.
const REJECT_GUARD: &str = "0 = 1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Equal,
    NotEqual,
    AtLeast,
    AtMost,
    Like,
    NotLike,
}

impl Comparison {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Comparison::Equal => "=",
            Comparison::NotEqual => "!=",
            Comparison::AtLeast => ">=",
            Comparison::AtMost => "<=",
            Comparison::Like => "LIKE",
            Comparison::NotLike => "NOT LIKE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constraint {
    pub field: String,
    pub comparison: Comparison,
    pub value: String,
}

impl Constraint {
    pub fn parse(key: &str, value: &str) -> Self {
        let marker = key.chars().last().filter(|c| matches!(*c, '!' | '>' | '<'));
        let field = match marker {
            Some(c) => &key[..key.len() - c.len_utf8()],
            None => key,
        };
        let wildcard = value.contains('*');
        let comparison = match (marker, wildcard) {
            (Some('!'), true) => Comparison::NotLike,
            (_, true) => Comparison::Like,
            (Some('!'), false) => Comparison::NotEqual,
            (Some('>'), false) => Comparison::AtLeast,
            (Some('<'), false) => Comparison::AtMost,
            _ => Comparison::Equal,
        };
        let value = if wildcard {
            value.replace('*', "%")
        } else {
            value.to_string()
        };
        Self {
            field: field.trim().to_string(),
            comparison,
            value,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet {
    pairs: Vec<(String, String)>,
    sort: Option<String>,
    columns: Option<String>,
    distinct: bool,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses an `application/x-www-form-urlencoded` query string.
    pub fn from_query_string(query: &str) -> Self {
        let mut filters = Self::new();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            filters.insert(key.as_ref(), value.as_ref());
        }
        filters
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut filters = Self::new();
        for (key, value) in pairs {
            filters.insert(key.as_ref(), value.as_ref());
        }
        filters
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.insert(key, value);
        self
    }

    /// Adds a constraint or control key. A repeated key replaces the earlier
    /// value in place.
    pub fn insert(&mut self, key: &str, value: &str) {
        match key {
            SORT_KEY => self.sort = Some(value.to_string()),
            COLUMNS_KEY => self.columns = Some(value.to_string()),
            DISTINCT_KEY => self.distinct = true,
            _ => {
                if let Some(existing) = self.pairs.iter_mut().find(|(name, _)| name == key) {
                    existing.1 = value.to_string();
                } else {
                    self.pairs.push((key.to_string(), value.to_string()));
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty() && self.sort.is_none() && self.columns.is_none() && !self.distinct
    }

    pub fn constraints(&self) -> Vec<Constraint> {
        self.pairs
            .iter()
            .map(|(key, value)| Constraint::parse(key, value))
            .collect()
    }

    pub fn render(&self, base: &str) -> RenderedQuery {
        self.render_checked(base, None)
    }

    /// Renders against a base statement, rejecting any identifier that is
    /// malformed or, when `known` is given, not one of the view's columns.
    pub fn render_checked(&self, base: &str, known: Option<&BTreeSet<String>>) -> RenderedQuery {
        let mut sql = base.trim().to_string();
        let mut params = Vec::new();
        let mut rejected = false;
        let mut expand_relationships = true;

        if let Some(columns) = &self.columns {
            let list = columns
                .split(',')
                .map(str::trim)
                .filter(|column| !column.is_empty())
                .collect::<Vec<_>>();
            if list.is_empty() || list.iter().any(|column| !column_allowed(column, known)) {
                rejected = true;
            } else {
                expand_relationships = list.contains(&"id");
                sql = sql.replacen('*', &list.join(", "), 1);
            }
        }

        if self.distinct && !sql.to_uppercase().starts_with("SELECT DISTINCT") {
            sql = sql.replacen("SELECT", "SELECT DISTINCT", 1);
        }

        let order = match &self.sort {
            Some(sort) => {
                let order = order_clause(sort, known);
                rejected |= order.is_none();
                order
            }
            None => None,
        };

        let mut clauses = Vec::new();
        for constraint in self.constraints() {
            if !column_allowed(&constraint.field, known) {
                rejected = true;
                continue;
            }
            params.push(constraint.value);
            clauses.push(format!(
                "{} {} ?{}",
                constraint.field,
                constraint.comparison.as_sql(),
                params.len()
            ));
        }
        if rejected {
            clauses.push(REJECT_GUARD.to_string());
        }
        if !clauses.is_empty() {
            let joiner = if sql.to_uppercase().contains(" WHERE ") {
                " AND "
            } else {
                " WHERE "
            };
            sql.push_str(joiner);
            sql.push_str(&clauses.join(" AND "));
        }
        if let Some(order) = order {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order);
        }

        RenderedQuery {
            sql,
            params,
            expand_relationships,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedQuery {
    pub sql: String,
    pub params: Vec<String>,
    /// False when an explicit projection dropped `id`.
    pub expand_relationships: bool,
}

impl RenderedQuery {
    /// The statement with parameters substituted, for diagnostics only.
    pub fn display(&self) -> String {
        let mut rendered = String::with_capacity(self.sql.len());
        let mut chars = self.sql.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '?' {
                rendered.push(c);
                continue;
            }
            let mut digits = String::new();
            while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                digits.push(d);
                chars.next();
            }
            let param = digits
                .parse::<usize>()
                .ok()
                .and_then(|index| self.params.get(index.wrapping_sub(1)));
            match param {
                Some(value) => {
                    rendered.push('\'');
                    rendered.push_str(&value.replace('\'', "''"));
                    rendered.push('\'');
                }
                None => {
                    rendered.push('?');
                    rendered.push_str(&digits);
                }
            }
        }
        rendered
    }
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"))
}

fn column_allowed(name: &str, known: Option<&BTreeSet<String>>) -> bool {
    identifier_pattern().is_match(name) && known.map_or(true, |columns| columns.contains(name))
}

fn order_clause(sort: &str, known: Option<&BTreeSet<String>>) -> Option<String> {
    let mut parts = Vec::new();
    for entry in sort.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let mut words = entry.split_whitespace();
        let column = words.next()?;
        if !column_allowed(column, known) {
            return None;
        }
        let direction = match words.next().map(str::to_uppercase).as_deref() {
            None => "",
            Some("ASC") => " ASC",
            Some("DESC") => " DESC",
            Some(_) => return None,
        };
        if words.next().is_some() {
            return None;
        }
        parts.push(format!("{column}{direction}"));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

/// Views the filter translator may read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryView {
    Projects,
    Assignments,
    Tasks,
    TaskAudits,
    ProjectProperties,
    AssignmentProperties,
    TaskProperties,
    CvTerms,
    Users,
    UserPermissions,
}

impl QueryView {
    pub const ALL: [QueryView; 10] = [
        QueryView::Projects,
        QueryView::Assignments,
        QueryView::Tasks,
        QueryView::TaskAudits,
        QueryView::ProjectProperties,
        QueryView::AssignmentProperties,
        QueryView::TaskProperties,
        QueryView::CvTerms,
        QueryView::Users,
        QueryView::UserPermissions,
    ];

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|view| view.label() == label)
    }

    pub fn view(&self) -> &'static str {
        match self {
            QueryView::Projects => "project_vw",
            QueryView::Assignments => "assignment_vw",
            QueryView::Tasks => "task_vw",
            QueryView::TaskAudits => "task_audit_vw",
            QueryView::ProjectProperties => "project_property_vw",
            QueryView::AssignmentProperties => "assignment_property_vw",
            QueryView::TaskProperties => "task_property_vw",
            QueryView::CvTerms => "cv_term_vw",
            QueryView::Users => "user_vw",
            QueryView::UserPermissions => "user_permission_vw",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            QueryView::Projects => "projects",
            QueryView::Assignments => "assignments",
            QueryView::Tasks => "tasks",
            QueryView::TaskAudits => "task_audits",
            QueryView::ProjectProperties => "projectprops",
            QueryView::AssignmentProperties => "assignmentprops",
            QueryView::TaskProperties => "taskprops",
            QueryView::CvTerms => "cvterms",
            QueryView::Users => "users",
            QueryView::UserPermissions => "user_permissions",
        }
    }

    pub fn base_statement(&self) -> String {
        format!("SELECT * FROM {}", self.view())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRows {
    pub statement: String,
    pub rows: Vec<Map<String, Value>>,
}

impl AssignmentStore {
    pub fn view_columns(&self, view: QueryView) -> Result<Vec<String>, StorageError> {
        view_columns(&self.conn, view)
    }

    /// Runs a filtered read. Zero matching rows is reported as `NotFound`
    /// carrying the rendered statement.
    pub fn query_view(&self, view: QueryView, filters: &FilterSet) -> Result<QueryRows, ManagerError> {
        let known = view_columns(&self.conn, view)?
            .into_iter()
            .collect::<BTreeSet<_>>();
        let rendered = filters.render_checked(&view.base_statement(), Some(&known));
        let statement = rendered.display();
        let mut rows = run_rendered(&self.conn, &rendered)?;
        if rows.is_empty() {
            return Err(ManagerError::not_found(format!(
                "No rows returned for query {statement}"
            )));
        }
        if view == QueryView::CvTerms && rendered.expand_relationships {
            for row in &mut rows {
                let Some(id) = row.get("id").and_then(Value::as_i64) else {
                    continue;
                };
                let relationships = self.term_relationships(id)?;
                row.insert("relationships".to_string(), Value::Array(relationships));
            }
        }
        Ok(QueryRows { statement, rows })
    }

    /// Fetches one row of `view` by id.
    pub fn query_by_id(&self, view: QueryView, id: i64) -> Result<QueryRows, ManagerError> {
        self.query_view(view, &FilterSet::new().with("id", &id.to_string()))
    }

    fn term_relationships(&self, term_id: i64) -> Result<Vec<Value>, StorageError> {
        let rendered = RenderedQuery {
            sql: "SELECT * FROM cv_term_relationship_vw WHERE subject_id = ?1 OR object_id = ?1 ORDER BY id"
                .to_string(),
            params: vec![term_id.to_string()],
            expand_relationships: false,
        };
        Ok(run_rendered(&self.conn, &rendered)?
            .into_iter()
            .map(Value::Object)
            .collect())
    }
}

fn view_columns(conn: &Connection, view: QueryView) -> Result<Vec<String>, StorageError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", view.view()))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut columns = Vec::new();
    for row in rows {
        columns.push(row?);
    }
    Ok(columns)
}

fn run_rendered(conn: &Connection, rendered: &RenderedQuery) -> Result<Vec<Map<String, Value>>, StorageError> {
    let mut stmt = conn.prepare(&rendered.sql)?;
    let names = stmt
        .column_names()
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    let mut rows = stmt.query(params_from_iter(rendered.params.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Map::new();
        for (index, name) in names.iter().enumerate() {
            record.insert(name.clone(), json_value(row.get_ref(index)?));
        }
        out.push(record);
    }
    Ok(out)
}

fn json_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::from(number),
        ValueRef::Real(number) => Value::from(number),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).into_owned()),
        ValueRef::Blob(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
    }
}
