//! Row-level data model for the storage engine (§3.1).

use serde::{Deserialize, Serialize};

use crate::spec::LenientSpec;

/// Permission granted to a user on a diagram they don't own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Editor,
    Viewer,
}

/// A single entry in `Diagram.shares`, unique by `user_id`.
///
/// Serialized with camelCase keys (`userId`) because the on-disk JSON
/// representation is also the literal substring matched by the `shares`
/// membership GLOB in `diagrams::list_for_user` (§4.4, §9).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Share {
    pub user_id: String,
    pub permission: Permission,
}

/// The canonical diagram document (§3.1).
#[derive(Debug, Clone)]
pub struct Diagram {
    pub id: String,
    pub name: String,
    pub project: String,
    pub spec: LenientSpec,
    pub version: i64,
    pub owner_id: Option<String>,
    pub is_public: bool,
    pub shares: Vec<Share>,
    pub created_at: String,
    pub updated_at: String,
}

/// An immutable history entry (§3.1).
#[derive(Debug, Clone)]
pub struct DiagramVersion {
    pub id: String,
    pub diagram_id: String,
    pub version: i64,
    pub spec: LenientSpec,
    pub message: Option<String>,
    pub created_at: String,
}

/// A version row with the `spec` column omitted, for listings (§4.4 `GetVersionsMetadata`).
#[derive(Debug, Clone)]
pub struct DiagramVersionMetadata {
    pub id: String,
    pub diagram_id: String,
    pub version: i64,
    pub message: Option<String>,
    pub created_at: String,
}

/// The outcome of an optimistic `Update` (§4.4).
#[derive(Debug)]
pub enum UpdateOutcome {
    /// The write succeeded; the updated record is returned.
    Ok(Diagram),
    /// The caller's `baseVersion` no longer matched; the write was not applied.
    Conflict { current_version: i64 },
    /// The diagram does not exist.
    NotFound,
}

/// Sort key for [`crate::storage::Storage::list_paginated`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    UpdatedAt,
    CreatedAt,
    Name,
}

/// Sort direction for [`crate::storage::Storage::list_paginated`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Filter/pagination parameters for `ListPaginated` (§4.4).
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub project: Option<String>,
    pub limit: i64,
    pub offset: i64,
    pub sort_by: Option<SortBy>,
    pub sort_order: Option<SortOrder>,
    pub search: Option<String>,
    pub types: Option<Vec<String>>,
    pub created_after: Option<String>,
    pub created_before: Option<String>,
    pub updated_after: Option<String>,
    pub updated_before: Option<String>,
}

impl ListFilter {
    /// A filter with the defaults from §4.4 (`limit=20, offset=0`).
    pub fn defaults() -> Self {
        Self { limit: 20, offset: 0, ..Default::default() }
    }
}

/// A page of results plus the total matching row count.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: i64,
}

/// Aggregate counts returned by `Stats()` (§4.4).
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Stats {
    pub diagram_count: i64,
    pub version_count: i64,
    pub project_count: i64,
}
