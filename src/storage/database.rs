//! SQLite database for verified users

use rusqlite::{params, Connection, ErrorCode};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{EkycError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS user_info (
    id          TEXT PRIMARY KEY NOT NULL,
    name        TEXT NOT NULL,
    id_type     TEXT NOT NULL,
    embedding   TEXT,
    created_at  TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
";

/// A row of the `user_info` table
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedUser {
    /// Document identifier, unique across the table
    pub id: String,
    pub name: String,
    /// Document type label, e.g. "PAN"
    pub id_type: String,
    /// Face embedding of the selfie, if one was stored
    pub embedding: Option<Vec<f32>>,
    /// Set by the database on insert
    pub created_at: Option<String>,
}

impl PersistedUser {
    pub fn new(id: impl Into<String>, name: impl Into<String>, id_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            id_type: id_type.into(),
            embedding: None,
            created_at: None,
        }
    }
}

/// Result of a conditional insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same id already existed; nothing was written
    AlreadyExists,
}

/// Database connection wrapper
///
/// One handle is opened by the caller and passed to whoever needs it.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create database at path
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                EkycError::Config(format!("cannot create database directory {:?}: {}", parent, e))
            })?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let db = Self { conn };
        db.init_schema()?;

        info!("Opened user database at {:?}", path);
        Ok(db)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    pub fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Insert a new user, failing if the id is taken
    pub fn insert_record(&self, user: &PersistedUser) -> Result<()> {
        let embedding = encode_embedding(user.embedding.as_deref())?;
        self.conn.execute(
            "INSERT INTO user_info (id, name, id_type, embedding) VALUES (?1, ?2, ?3, ?4)",
            params![user.id, user.name, user.id_type, embedding],
        )?;
        info!("Record for {} inserted successfully", user.id);
        Ok(())
    }

    /// Insert a new user unless the id is already present
    ///
    /// Check and write happen in one statement, so two concurrent
    /// submissions for the same id cannot both insert.
    pub fn insert_if_absent(&self, user: &PersistedUser) -> Result<InsertOutcome> {
        let embedding = encode_embedding(user.embedding.as_deref())?;
        let changed = self.conn.execute(
            "INSERT INTO user_info (id, name, id_type, embedding) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO NOTHING",
            params![user.id, user.name, user.id_type, embedding],
        )?;

        if changed == 0 {
            info!("Duplicate record found for {}", user.id);
            Ok(InsertOutcome::AlreadyExists)
        } else {
            info!("Record for {} inserted successfully", user.id);
            Ok(InsertOutcome::Inserted)
        }
    }

    /// Fetch all rows matching an id (zero or one)
    pub fn fetch_records(&self, id: &str) -> Result<Vec<PersistedUser>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, name, id_type, embedding, created_at FROM user_info WHERE id = ?1",
        )?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let users = rows
            .into_iter()
            .map(|(id, name, id_type, embedding, created_at)| {
                Ok(PersistedUser {
                    id,
                    name,
                    id_type,
                    embedding: decode_embedding(embedding.as_deref())?,
                    created_at,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if users.is_empty() {
            info!("No record found for {}", id);
        } else {
            info!("Record for {} fetched successfully", id);
        }
        Ok(users)
    }

    /// Whether a row with this id exists
    pub fn check_duplicacy(&self, id: &str) -> Result<bool> {
        let is_duplicate = !self.fetch_records(id)?.is_empty();
        if is_duplicate {
            info!("Duplicate record found for {}", id);
        } else {
            info!("No duplicate record found for {}", id);
        }
        Ok(is_duplicate)
    }

    /// Number of stored users
    pub fn count_records(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM user_info", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

/// Whether an error is a uniqueness violation
pub fn is_unique_violation(err: &EkycError) -> bool {
    matches!(
        err,
        EkycError::Storage(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation
    )
}

fn encode_embedding(embedding: Option<&[f32]>) -> Result<Option<String>> {
    embedding
        .map(|values| serde_json::to_string(values).map_err(EkycError::from))
        .transpose()
}

fn decode_embedding(raw: Option<&str>) -> Result<Option<Vec<f32>>> {
    match raw {
        Some(text) => {
            debug!("Decoding stored embedding ({} bytes)", text.len());
            Ok(Some(serde_json::from_str(text)?))
        }
        None => Ok(None),
    }
}
