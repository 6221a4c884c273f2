//! Opening the SQLite pool the scheduler store runs on.
//!
//! File stores run in WAL mode with a long busy timeout: every claim is a
//! CAS `UPDATE`, and concurrent claimers queue on the single write lock.
//! In-memory stores live on one connection that is never recycled, since
//! the database disappears with its last connection.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::debug;

use crate::domain::models::DatabaseConfig;

const MEMORY_URL: &str = "sqlite::memory:";

/// Failure to open a store.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Invalid database URL: {0}")]
    InvalidDatabaseUrl(String),
    #[error("Cannot create database directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Cannot open {url}: {source}")]
    Open {
        url: String,
        #[source]
        source: sqlx::Error,
    },
}

/// Where a `sqlite:` URL keeps its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    File(PathBuf),
}

impl StoreLocation {
    /// Accepts `sqlite:` and `sqlite://` URLs; query parameters are ignored.
    pub fn from_url(url: &str) -> Result<Self, ConnectionError> {
        let rest = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .ok_or_else(|| ConnectionError::InvalidDatabaseUrl(url.to_string()))?;
        let path = rest.split_once('?').map_or(rest, |(path, _)| path);
        match path {
            "" => Err(ConnectionError::InvalidDatabaseUrl(url.to_string())),
            ":memory:" => Ok(Self::Memory),
            path => Ok(Self::File(PathBuf::from(path))),
        }
    }

    /// Create the parent directory of a file store.
    fn prepare(&self) -> Result<(), ConnectionError> {
        let Self::File(path) = self else {
            return Ok(());
        };
        match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() && !dir.exists() => {
                debug!(dir = %dir.display(), "creating database directory");
                std::fs::create_dir_all(dir).map_err(|source| ConnectionError::Directory {
                    path: dir.to_path_buf(),
                    source,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Pool sizing and lock waits for a file store.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    /// How long a statement waits on SQLite's write lock before failing
    pub busy_timeout: Duration,
}

impl PoolConfig {
    /// Sizing from the `database` config section.
    pub fn from_database(config: &DatabaseConfig) -> Self {
        Self {
            max_connections: config.max_connections.max(1),
            ..Self::default()
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(3),
            busy_timeout: Duration::from_secs(30),
        }
    }
}

/// Open the store behind `database_url`, creating a missing file and its directory.
pub async fn create_pool(database_url: &str, config: Option<PoolConfig>) -> Result<SqlitePool, ConnectionError> {
    let config = config.unwrap_or_default();
    let location = StoreLocation::from_url(database_url)?;
    location.prepare()?;

    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|_| ConnectionError::InvalidDatabaseUrl(database_url.to_string()))?
        .foreign_keys(true);

    let (options, pool) = match location {
        StoreLocation::Memory => (
            options,
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None),
        ),
        StoreLocation::File(_) => (
            options
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
                .busy_timeout(config.busy_timeout),
            SqlitePoolOptions::new()
                .max_connections(config.max_connections)
                .min_connections(config.min_connections.min(config.max_connections))
                .acquire_timeout(config.acquire_timeout),
        ),
    };

    pool.connect_with(options).await.map_err(|source| ConnectionError::Open {
        url: database_url.to_string(),
        source,
    })
}

/// Empty in-memory store on a single connection.
pub async fn create_test_pool() -> Result<SqlitePool, ConnectionError> {
    create_pool(MEMORY_URL, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_location_from_url() {
        assert_eq!(StoreLocation::from_url("sqlite::memory:").unwrap(), StoreLocation::Memory);
        assert_eq!(StoreLocation::from_url("sqlite://:memory:").unwrap(), StoreLocation::Memory);
        assert_eq!(
            StoreLocation::from_url("sqlite:.taskmesh/taskmesh.db?mode=rwc").unwrap(),
            StoreLocation::File(PathBuf::from(".taskmesh/taskmesh.db"))
        );
        assert!(matches!(
            StoreLocation::from_url("postgres://localhost/db"),
            Err(ConnectionError::InvalidDatabaseUrl(_))
        ));
        assert!(StoreLocation::from_url("sqlite:").is_err());
    }

    #[tokio::test]
    async fn test_file_store_creates_directory_and_uses_wal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/state/taskmesh.db");
        let pool = create_pool(&format!("sqlite:{}", path.display()), None).await.unwrap();
        assert!(path.exists());

        let mode: String = sqlx::query_scalar("PRAGMA journal_mode").fetch_one(&pool).await.unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
        let fk: i64 = sqlx::query_scalar("PRAGMA foreign_keys").fetch_one(&pool).await.unwrap();
        assert_eq!(fk, 1);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_memory_store_is_shared_across_acquires() {
        let pool = create_test_pool().await.unwrap();
        sqlx::query("CREATE TABLE scratch (id INTEGER)").execute(&pool).await.unwrap();
        sqlx::query("INSERT INTO scratch VALUES (1)").execute(&pool).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scratch")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
