//! Ownership, visibility, and per-user share management (§4.4).
//!
//! Every operation here validates its `user_id` arguments against the
//! hygiene pattern in [`super::is_valid_user_id`] *before* touching the
//! database — an invalid id is rejected without any partial write, matching
//! §3.2 invariant 5 and §9's "User-id hygiene" note, since that pattern is
//! also what makes the `shares` GLOB in [`super::diagrams::list_for_user`]
//! injection-proof.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{StorageError, StorageResult};

use super::model::{Permission, Share};
use super::{is_valid_user_id, now_rfc3339, Storage};

impl Storage {
    /// Reassigns (or clears) a diagram's owner. Returns `false` if the
    /// diagram doesn't exist.
    pub async fn update_owner(&self, diagram_id: String, owner_id: Option<String>) -> StorageResult<bool> {
        if let Some(owner) = &owner_id {
            if !is_valid_user_id(owner) {
                return Err(StorageError::InvalidUserId);
            }
        }
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            pool.with_writer(|conn| {
                let now = now_rfc3339();
                let changed = conn.execute(
                    "UPDATE diagrams SET owner_id = ?1, updated_at = ?2 WHERE id = ?3",
                    params![owner_id, now, diagram_id],
                )?;
                Ok(changed > 0)
            })
            .map_err(StorageError::from)
        })
        .await
        .expect("update_owner task panicked")
    }

    /// Flips a diagram's public-read flag. Returns `false` if the diagram
    /// doesn't exist.
    pub async fn set_public(&self, diagram_id: String, is_public: bool) -> StorageResult<bool> {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            pool.with_writer(|conn| {
                let now = now_rfc3339();
                let changed = conn.execute(
                    "UPDATE diagrams SET is_public = ?1, updated_at = ?2 WHERE id = ?3",
                    params![is_public as i64, now, diagram_id],
                )?;
                Ok(changed > 0)
            })
            .map_err(StorageError::from)
        })
        .await
        .expect("set_public task panicked")
    }

    /// Replaces a diagram's entire `shares` list. Returns `false` if the
    /// diagram doesn't exist.
    pub async fn update_shares(&self, diagram_id: String, shares: Vec<Share>) -> StorageResult<bool> {
        for share in &shares {
            if !is_valid_user_id(&share.user_id) {
                return Err(StorageError::InvalidUserId);
            }
        }
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            pool.with_writer(|conn| write_shares(conn, &diagram_id, &shares)).map_err(StorageError::from)
        })
        .await
        .expect("update_shares task panicked")
    }

    /// Grants (or updates) one user's permission on a diagram. Returns
    /// `false` if the diagram doesn't exist.
    pub async fn add_share(&self, diagram_id: String, user_id: String, permission: Permission) -> StorageResult<bool> {
        if !is_valid_user_id(&user_id) {
            return Err(StorageError::InvalidUserId);
        }
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            pool.with_writer(|conn| {
                let Some(mut shares) = read_shares(conn, &diagram_id)? else {
                    return Ok(false);
                };
                match shares.iter_mut().find(|s| s.user_id == user_id) {
                    Some(existing) => existing.permission = permission,
                    None => shares.push(Share { user_id: user_id.clone(), permission }),
                }
                write_shares(conn, &diagram_id, &shares)
            })
            .map_err(StorageError::from)
        })
        .await
        .expect("add_share task panicked")
    }

    /// Revokes one user's access to a diagram. Returns `false` if the
    /// diagram doesn't exist; revoking an absent share is a no-op success.
    pub async fn remove_share(&self, diagram_id: String, user_id: String) -> StorageResult<bool> {
        if !is_valid_user_id(&user_id) {
            return Err(StorageError::InvalidUserId);
        }
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            pool.with_writer(|conn| {
                let Some(mut shares) = read_shares(conn, &diagram_id)? else {
                    return Ok(false);
                };
                shares.retain(|s| s.user_id != user_id);
                write_shares(conn, &diagram_id, &shares)
            })
            .map_err(StorageError::from)
        })
        .await
        .expect("remove_share task panicked")
    }
}

fn read_shares(conn: &Connection, diagram_id: &str) -> rusqlite::Result<Option<Vec<Share>>> {
    let raw: Option<String> = conn
        .query_row("SELECT shares FROM diagrams WHERE id = ?1", params![diagram_id], |r| r.get(0))
        .optional()?;
    Ok(raw.map(|raw| serde_json::from_str(&raw).unwrap_or_default()))
}

fn write_shares(conn: &Connection, diagram_id: &str, shares: &[Share]) -> rusqlite::Result<bool> {
    let json = serde_json::to_string(shares).expect("Share list always serializes");
    let now = now_rfc3339();
    let changed = conn.execute(
        "UPDATE diagrams SET shares = ?1, updated_at = ?2 WHERE id = ?3",
        params![json, now, diagram_id],
    )?;
    Ok(changed > 0)
}
