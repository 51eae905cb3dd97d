// Credential storage
// The single access point for reading and writing the token pair

use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use super::types::StoredTokens;
use crate::error::Result;

const ACCESS_KEY: &str = "session:access_token";
const REFRESH_KEY: &str = "session:refresh_token";

/// Key/value storage for the access and refresh tokens.
///
/// Last write wins; no transactional guarantees beyond that.
pub trait CredentialStore: Send + Sync {
    fn get(&self) -> Result<StoredTokens>;
    fn set(&self, access_token: &str, refresh_token: &str) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

/// Process-local store
#[derive(Debug, Default)]
pub struct MemoryStore {
    tokens: RwLock<StoredTokens>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryStore {
    fn get(&self) -> Result<StoredTokens> {
        let tokens = self.tokens.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tokens.clone())
    }

    fn set(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        *tokens = StoredTokens {
            access_token: Some(access_token.to_string()),
            refresh_token: Some(refresh_token.to_string()),
        };
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        *tokens = StoredTokens::default();
        Ok(())
    }
}

/// Store backed by an `auth_kv` table in a SQLite database, so a session
/// survives restarts of the client.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    crate::error::SessionError::Storage(format!(
                        "Failed to create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        tracing::debug!("Opening credential store: {}", path.display());
        Self::init(Connection::open(path)?)
    }

    /// Non-persistent database, mostly for tests
    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS auth_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_key(conn: &Connection, key: &str) -> Result<Option<String>> {
        let value = conn
            .query_row("SELECT value FROM auth_kv WHERE key = ?", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }
}

impl CredentialStore for SqliteStore {
    fn get(&self) -> Result<StoredTokens> {
        let conn = self.conn();
        Ok(StoredTokens {
            access_token: Self::read_key(&conn, ACCESS_KEY)?,
            refresh_token: Self::read_key(&conn, REFRESH_KEY)?,
        })
    }

    fn set(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for (key, value) in [(ACCESS_KEY, access_token), (REFRESH_KEY, refresh_token)] {
            tx.execute(
                "INSERT OR REPLACE INTO auth_kv (key, value) VALUES (?1, ?2)",
                [key, value],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "DELETE FROM auth_kv WHERE key IN (?1, ?2)",
            [ACCESS_KEY, REFRESH_KEY],
        )?;
        Ok(())
    }
}
