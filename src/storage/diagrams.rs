//! `Diagram` CRUD, optimistic updates, and the safe `Transform` primitive (§4.4).

use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};
use serde_json::Value;

use crate::error::{StorageError, StorageResult};
use crate::quota;
use crate::spec::{DiagramSpec, LenientSpec};

use super::model::{Diagram, ListFilter, Page, Share, SortBy, SortOrder, UpdateOutcome};
use super::{is_valid_user_id, new_id, now_rfc3339, Storage};

/// Re-runs the structural/referential-integrity checks from §3.2(1) on every
/// write path, not just on the JSON decode in [`crate::spec::parse_strict`] —
/// a `DiagramSpec` can also arrive here already-typed, e.g. built by the hub
/// from a `change` batch, and those never passed through the JSON boundary.
fn validate_spec(spec: &DiagramSpec) -> StorageResult<()> {
    let issues = crate::spec::validate(spec);
    if issues.is_empty() {
        Ok(())
    } else {
        Err(StorageError::Validation(crate::error::SpecError { issues }))
    }
}

impl Storage {
    /// Creates a new diagram at `version=1` with an initial `"Initial version"`
    /// history row (§3.3, §4.4).
    pub async fn create(
        &self,
        name: String,
        project: String,
        spec: DiagramSpec,
        owner_id: Option<String>,
        is_public: bool,
    ) -> StorageResult<Diagram> {
        validate_spec(&spec)?;
        quota::check_spec(&spec, self.quota())?;

        if let Some(owner) = &owner_id {
            let pool = self.pool.clone();
            let owner = owner.clone();
            let limits = *self.quota();
            let owned: i64 = tokio::task::spawn_blocking(move || {
                pool.with_reader(|conn| {
                    conn.query_row("SELECT COUNT(*) FROM diagrams WHERE owner_id = ?1", params![owner], |r| r.get(0))
                })
            })
            .await
            .expect("count task panicked")?;
            quota::check_owner_count(owned as usize, &limits)?;
        }

        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            pool.with_writer(|conn| {
                let tx = conn.transaction()?;
                let id = new_id();
                let now = now_rfc3339();
                let spec_json = serde_json::to_string(&spec).expect("DiagramSpec always serializes");

                tx.execute(
                    "INSERT INTO diagrams (id, name, project, spec, version, owner_id, is_public, shares, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, '[]', ?7, ?7)",
                    params![id, name, project, spec_json, owner_id, is_public as i64, now],
                )?;
                tx.execute(
                    "INSERT INTO diagram_versions (id, diagram_id, version, spec, message, created_at)
                     VALUES (?1, ?2, 1, ?3, ?4, ?5)",
                    params![new_id(), id, spec_json, Some("Initial version"), now],
                )?;
                let diagram = fetch_diagram(&tx, &id)?.expect("just inserted");
                tx.commit()?;
                Ok(diagram)
            })
            .map_err(StorageError::from)
        })
        .await
        .expect("create task panicked")
    }

    /// Reads a diagram, lenient-parsing its spec (§4.4).
    pub async fn get(&self, id: String) -> StorageResult<Option<Diagram>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            pool.with_reader(|conn| fetch_diagram(conn, &id)).map_err(StorageError::from)
        })
        .await
        .expect("get task panicked")
    }

    /// Optimistic update: see §4.4 for the full contract.
    pub async fn update(
        &self,
        id: String,
        spec: DiagramSpec,
        message: Option<String>,
        base_version: Option<i64>,
    ) -> StorageResult<UpdateOutcome> {
        validate_spec(&spec)?;
        quota::check_spec(&spec, self.quota())?;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            pool.with_writer(|conn| {
                let tx = conn.transaction()?;
                let outcome = apply_update(&tx, &id, &spec, message.as_deref(), base_version)?;
                tx.commit()?;
                Ok(outcome)
            })
            .map_err(StorageError::from)
        })
        .await
        .expect("update task panicked")
    }

    /// `Update` without a `baseVersion`: bumps the version unconditionally
    /// (admin-scoped; bypasses the optimistic lock). §4.4.
    pub async fn force_update(
        &self,
        id: String,
        spec: DiagramSpec,
        message: Option<String>,
    ) -> StorageResult<UpdateOutcome> {
        self.update(id, spec, message, None).await
    }

    /// Read-modify-write with bounded retry under contention (§4.4).
    ///
    /// `f` receives the current spec and returns the new one. On a version
    /// conflict, the current `(spec, version)` is re-read and `f` is re-applied;
    /// after `max_retries` conflicts this returns
    /// `Err(StorageError::MaxRetriesExceeded)`. A missing diagram short-circuits
    /// to `Ok(None)`.
    pub async fn transform(
        &self,
        id: String,
        mut f: impl FnMut(DiagramSpec) -> DiagramSpec + Send + 'static,
        message: Option<String>,
        max_retries: u32,
    ) -> StorageResult<Option<Diagram>> {
        for attempt in 0..=max_retries {
            let Some(current) = self.get(id.clone()).await? else {
                return Ok(None);
            };
            let next_spec = f(current.spec.spec.clone());
            match self
                .update(id.clone(), next_spec, message.clone(), Some(current.version))
                .await?
            {
                UpdateOutcome::Ok(diagram) => return Ok(Some(diagram)),
                UpdateOutcome::NotFound => return Ok(None),
                UpdateOutcome::Conflict { .. } if attempt < max_retries => continue,
                UpdateOutcome::Conflict { .. } => {
                    return Err(StorageError::MaxRetriesExceeded { attempts: max_retries + 1 })
                }
            }
        }
        unreachable!("loop always returns by the final iteration")
    }

    /// Transactionally deletes `diagram_versions`, `agent_runs`, and the
    /// `diagrams` row for `id`. Thumbnail deletion is attempted *after* commit
    /// and its failure is only logged — the orphan reaper is the backstop (§3.3).
    pub async fn delete(&self, id: String) -> StorageResult<bool> {
        let pool = self.pool.clone();
        let deleted = tokio::task::spawn_blocking({
            let id = id.clone();
            move || {
                pool.with_writer(|conn| {
                    let tx = conn.transaction()?;
                    tx.execute("DELETE FROM diagram_versions WHERE diagram_id = ?1", params![id])?;
                    tx.execute("DELETE FROM agent_runs WHERE diagram_id = ?1", params![id])?;
                    let changed = tx.execute("DELETE FROM diagrams WHERE id = ?1", params![id])?;
                    tx.commit()?;
                    Ok(changed > 0)
                })
                .map_err(StorageError::from)
            }
        })
        .await
        .expect("delete task panicked")?;

        if deleted {
            if let Err(e) = self.thumbnails().delete(&id) {
                tracing::warn!(diagram_id = %id, error = %e, "thumbnail delete failed after diagram delete; orphan reaper will catch it");
            }
        }
        Ok(deleted)
    }

    /// Legacy unfiltered listing, optionally scoped to a project (§4.4).
    pub async fn list(&self, project: Option<String>) -> StorageResult<Vec<Diagram>> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            pool.with_reader(|conn| {
                let mut stmt = match &project {
                    Some(_) => conn.prepare("SELECT * FROM diagrams WHERE project = ?1 ORDER BY updated_at DESC")?,
                    None => conn.prepare("SELECT * FROM diagrams ORDER BY updated_at DESC")?,
                };
                let rows = match &project {
                    Some(p) => stmt.query_map(params![p], row_to_diagram)?,
                    None => stmt.query_map(params![], row_to_diagram)?,
                };
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .map_err(StorageError::from)
        })
        .await
        .expect("list task panicked")
    }

    /// Filtered, sorted, paginated listing (§4.4).
    pub async fn list_paginated(&self, filter: ListFilter) -> StorageResult<Page<Diagram>> {
        if let Some(types) = &filter.types {
            for t in types {
                if serde_json::from_value::<crate::spec::DiagramType>(Value::String(t.clone())).is_err() {
                    return Ok(Page { data: Vec::new(), total: 0 });
                }
            }
        }

        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            pool.with_reader(|conn| run_list_paginated(conn, &filter)).map_err(StorageError::from)
        })
        .await
        .expect("list_paginated task panicked")
    }

    /// Access-scoped listing for a given user (§4.4).
    ///
    /// `owner_id = user OR owner_id IS NULL OR is_public OR shares contains user`.
    /// Anonymous callers (`user_id = None`) see only public/legacy rows.
    pub async fn list_for_user(&self, user_id: Option<String>, filter: ListFilter) -> StorageResult<Page<Diagram>> {
        if let Some(uid) = &user_id {
            if !is_valid_user_id(uid) {
                return Err(StorageError::InvalidUserId);
            }
        }
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            pool.with_reader(|conn| run_list_for_user(conn, user_id.as_deref(), &filter))
                .map_err(StorageError::from)
        })
        .await
        .expect("list_for_user task panicked")
    }

    pub(super) fn thumbnails(&self) -> &crate::thumbnails::ThumbnailStore {
        &self.thumbnails
    }
}

fn apply_update(
    tx: &Connection,
    id: &str,
    spec: &DiagramSpec,
    message: Option<&str>,
    base_version: Option<i64>,
) -> rusqlite::Result<UpdateOutcome> {
    let spec_json = serde_json::to_string(spec).expect("DiagramSpec always serializes");
    let now = now_rfc3339();

    let changed = match base_version {
        Some(base) => tx.execute(
            "UPDATE diagrams SET spec = ?1, version = version + 1, updated_at = ?2 WHERE id = ?3 AND version = ?4",
            params![spec_json, now, id, base],
        )?,
        None => tx.execute(
            "UPDATE diagrams SET spec = ?1, version = version + 1, updated_at = ?2 WHERE id = ?3",
            params![spec_json, now, id],
        )?,
    };

    if changed == 0 {
        return match current_version(tx, id)? {
            Some(current_version) if base_version.is_some() => Ok(UpdateOutcome::Conflict { current_version }),
            _ => Ok(UpdateOutcome::NotFound),
        };
    }

    let new_version: i64 = tx
        .query_row("SELECT MAX(version) FROM diagram_versions WHERE diagram_id = ?1", params![id], |r| r.get(0))
        .optional()?
        .flatten()
        .unwrap_or(0)
        + 1;

    tx.execute(
        "INSERT INTO diagram_versions (id, diagram_id, version, spec, message, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![new_id(), id, new_version, spec_json, message, now],
    )?;

    Ok(UpdateOutcome::Ok(fetch_diagram(tx, id)?.expect("row exists, just updated it")))
}

fn current_version(conn: &Connection, id: &str) -> rusqlite::Result<Option<i64>> {
    conn.query_row("SELECT version FROM diagrams WHERE id = ?1", params![id], |r| r.get(0)).optional()
}

pub(super) fn fetch_diagram(conn: &Connection, id: &str) -> rusqlite::Result<Option<Diagram>> {
    conn.query_row("SELECT * FROM diagrams WHERE id = ?1", params![id], row_to_diagram).optional()
}

pub(super) fn row_to_diagram(row: &Row) -> rusqlite::Result<Diagram> {
    let spec_raw: String = row.get("spec")?;
    let shares_raw: String = row.get("shares")?;
    let spec_value: Value = serde_json::from_str(&spec_raw).unwrap_or(Value::Null);
    let spec = decode_lenient(spec_value);
    let shares: Vec<Share> = serde_json::from_str(&shares_raw).unwrap_or_default();

    Ok(Diagram {
        id: row.get("id")?,
        name: row.get("name")?,
        project: row.get("project")?,
        spec,
        version: row.get("version")?,
        owner_id: row.get("owner_id")?,
        is_public: row.get::<_, i64>("is_public")? != 0,
        shares,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

pub(super) fn decode_lenient(value: Value) -> LenientSpec {
    match crate::spec::parse_lenient(&value) {
        Ok(lenient) => lenient,
        Err(_) => LenientSpec {
            spec: DiagramSpec::empty(crate::spec::DiagramType::Freeform),
            valid: false,
            issues: vec![crate::error::ValidationIssue {
                path: "$".into(),
                message: "stored spec could not be decoded".into(),
            }],
        },
    }
}

fn run_list_paginated(conn: &Connection, filter: &ListFilter) -> rusqlite::Result<Page<Diagram>> {
    let (where_clause, mut bind) = build_where(filter);
    let order = order_clause(filter);
    let limit = if filter.limit > 0 { filter.limit } else { 20 };
    let offset = filter.offset.max(0);

    let sql = format!(
        "SELECT * FROM diagrams {where_clause} {order} LIMIT ?{a} OFFSET ?{b}",
        a = bind.len() + 1,
        b = bind.len() + 2
    );
    bind.push(Box::new(limit));
    bind.push(Box::new(offset));

    let params_refs: Vec<&dyn ToSql> = bind.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_refs.as_slice(), row_to_diagram)?;
    let data = rows.collect::<rusqlite::Result<Vec<_>>>()?;

    let count_sql = format!("SELECT COUNT(*) FROM diagrams {where_clause}");
    let count_refs: Vec<&dyn ToSql> = bind[..bind.len() - 2].iter().map(|b| b.as_ref()).collect();
    let total: i64 = conn.query_row(&count_sql, count_refs.as_slice(), |r| r.get(0))?;

    Ok(Page { data, total })
}

fn run_list_for_user(conn: &Connection, user_id: Option<&str>, filter: &ListFilter) -> rusqlite::Result<Page<Diagram>> {
    let (where_clause, mut bind) = build_where(filter);

    let access = match user_id {
        Some(user) => {
            // GLOB wildcards (`*`, `?`, `[`) are outside the allowed userId
            // charset, so this pattern can't be used to smuggle an arbitrary
            // GLOB expression (§9 "User-id hygiene").
            let pattern = format!("*\"userId\":\"{user}\"*");
            bind.push(Box::new(user.to_string()));
            bind.push(Box::new(pattern));
            format!(
                "(owner_id = ?{a} OR owner_id IS NULL OR is_public = 1 OR shares GLOB ?{b})",
                a = bind.len() - 1,
                b = bind.len()
            )
        }
        None => "(owner_id IS NULL OR is_public = 1)".to_string(),
    };
    let where_clause = if where_clause.is_empty() {
        format!("WHERE {access}")
    } else {
        format!("{where_clause} AND {access}")
    };

    let order = order_clause(filter);
    let limit = if filter.limit > 0 { filter.limit } else { 50 };
    let offset = filter.offset.max(0);

    let sql = format!(
        "SELECT * FROM diagrams {where_clause} {order} LIMIT ?{a} OFFSET ?{b}",
        a = bind.len() + 1,
        b = bind.len() + 2
    );
    bind.push(Box::new(limit));
    bind.push(Box::new(offset));
    let params_refs: Vec<&dyn ToSql> = bind.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_refs.as_slice(), row_to_diagram)?;
    let data = rows.collect::<rusqlite::Result<Vec<_>>>()?;

    let count_sql = format!("SELECT COUNT(*) FROM diagrams {where_clause}");
    let count_refs: Vec<&dyn ToSql> = bind[..bind.len() - 2].iter().map(|b| b.as_ref()).collect();
    let total: i64 = conn.query_row(&count_sql, count_refs.as_slice(), |r| r.get(0))?;

    Ok(Page { data, total })
}

/// Builds a `WHERE ...` clause (or the empty string) plus its bound
/// parameters from the shared filter fields. Does not include access-control
/// predicates; callers append those separately.
fn build_where(filter: &ListFilter) -> (String, Vec<Box<dyn ToSql>>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut bind: Vec<Box<dyn ToSql>> = Vec::new();

    if let Some(project) = &filter.project {
        bind.push(Box::new(project.clone()));
        clauses.push(format!("project = ?{}", bind.len()));
    }
    if let Some(types) = &filter.types {
        if !types.is_empty() {
            let placeholders: Vec<String> = types
                .iter()
                .map(|t| {
                    bind.push(Box::new(t.clone()));
                    format!("?{}", bind.len())
                })
                .collect();
            clauses.push(format!("json_extract(spec, '$.type') IN ({})", placeholders.join(", ")));
        }
    }
    if let Some(after) = &filter.created_after {
        bind.push(Box::new(after.clone()));
        clauses.push(format!("created_at > ?{}", bind.len()));
    }
    if let Some(before) = &filter.created_before {
        bind.push(Box::new(before.clone()));
        clauses.push(format!("created_at < ?{}", bind.len()));
    }
    if let Some(after) = &filter.updated_after {
        bind.push(Box::new(after.clone()));
        clauses.push(format!("updated_at > ?{}", bind.len()));
    }
    if let Some(before) = &filter.updated_before {
        bind.push(Box::new(before.clone()));
        clauses.push(format!("updated_at < ?{}", bind.len()));
    }
    if let Some(search) = &filter.search {
        let trimmed = search.trim();
        if trimmed.chars().count() >= 3 {
            bind.push(Box::new(fts_match_query(trimmed)));
            clauses.push(format!("id IN (SELECT id FROM diagrams_fts WHERE diagrams_fts MATCH ?{})", bind.len()));
        } else if !trimmed.is_empty() {
            bind.push(Box::new(format!("%{trimmed}%")));
            clauses.push(format!("name LIKE ?{} COLLATE NOCASE", bind.len()));
        }
    }

    if clauses.is_empty() {
        (String::new(), bind)
    } else {
        (format!("WHERE {}", clauses.join(" AND ")), bind)
    }
}

/// Quotes a user search string for FTS5 `MATCH`, so punctuation in the query
/// can't be interpreted as FTS query syntax.
fn fts_match_query(term: &str) -> String {
    format!("\"{}\"", term.replace('"', "\"\""))
}

fn order_clause(filter: &ListFilter) -> String {
    let column = match filter.sort_by {
        Some(SortBy::CreatedAt) => "created_at",
        Some(SortBy::Name) => "name COLLATE NOCASE",
        Some(SortBy::UpdatedAt) | None => "updated_at",
    };
    let direction = match filter.sort_order {
        Some(SortOrder::Asc) => "ASC",
        Some(SortOrder::Desc) | None => "DESC",
    };
    format!("ORDER BY {column} {direction}")
}
