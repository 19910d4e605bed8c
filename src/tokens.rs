//! Persistent token cache.
//!
//! PATs and short-lived GitHub-issued tokens live in one key/value table in
//! `token.db` under the cache directory. The store is opened per operation
//! and closed before the operation returns; the CLI is single-threaded and
//! never holds it across actions.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A GitHub token with its expiry, serialised as JSON exactly as the GitHub
/// REST API returns it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GhToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl GhToken {
    /// An expiry that is not strictly in the future counts as expired.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(cache_dir: &Path) -> Self {
        TokenStore {
            path: cache_dir.join("token.db"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open for update, creating the store (and the cache directory) if
    /// absent.
    fn open_rw(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path).map_err(|e| {
            Error::Other(format!(
                "can't open database file {} for update: {}",
                self.path.display(),
                e
            ))
        })?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tokens (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        )?;
        Ok(conn)
    }

    /// Open read-only; a missing store reads as "no token".
    fn open_ro(&self) -> Result<Connection> {
        if !self.path.exists() {
            return Err(Error::TokenNotFound);
        }
        Ok(Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?)
    }

    /// Store a token under a key, overwriting any prior value.
    pub fn save(&self, key: &str, token: &GhToken) -> Result<()> {
        let value = serde_json::to_string(token)?;
        let conn = self.open_rw()?;
        conn.execute(
            "INSERT INTO tokens (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Fetch a token without looking at its expiry.
    pub fn fetch_raw(&self, key: &str) -> Result<GhToken> {
        let conn = self.open_ro()?;
        let value: Option<String> = conn
            .query_row("SELECT value FROM tokens WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        match value {
            Some(js) => Ok(serde_json::from_str(&js)?),
            None => Err(Error::TokenNotFound),
        }
    }

    /// Fetch a live token; an expired one reads as "no token".
    pub fn fetch(&self, key: &str) -> Result<String> {
        let tok = self.fetch_raw(key)?;
        if tok.is_expired() {
            return Err(Error::TokenNotFound);
        }
        Ok(tok.token)
    }

    /// Remove a key; removing an absent key is not an error.
    pub fn delete(&self, key: &str) -> Result<()> {
        let conn = self.open_rw()?;
        conn.execute("DELETE FROM tokens WHERE key = ?1", [key])?;
        Ok(())
    }

    /// Every `(key, token)` pair whose key extends `prefix` (the prefix
    /// itself is not included), in the backend's native order. Rows are
    /// collected while the store is open; it is closed again before they are
    /// returned.
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, GhToken)>> {
        let conn = self.open_ro()?;
        let mut stmt = conn.prepare(
            "SELECT key, value FROM tokens
             WHERE substr(key, 1, length(?1)) = ?1 AND key <> ?1",
        )?;
        let rows = stmt.query_map([prefix], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (key, js) = row?;
            out.push((key, serde_json::from_str(&js)?));
        }
        Ok(out)
    }
}
