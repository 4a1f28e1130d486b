use std::path::Path;

use anyhow::Result;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::rusqlite::{params, OpenFlags, OptionalExtension};
use r2d2_sqlite::SqliteConnectionManager;

use crate::quota::metadata::{MetadataStore, OriginRecord, StorageRecord};
use crate::quota::types::PersistenceType;

pub const DATABASE_FILE: &str = "storage.sqlite";

/// SQLite-based storage metadata.
pub struct SqliteMetadataStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteMetadataStore {
    /// Opens (or creates) the metadata database at `path` and makes sure the schema exists.
    pub fn new(path: &Path) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path)
            .with_flags(
                OpenFlags::SQLITE_OPEN_READ_WRITE |
                    OpenFlags::SQLITE_OPEN_CREATE |
                    OpenFlags::SQLITE_OPEN_URI
            )
            .with_init(|c| {
                c.busy_timeout(std::time::Duration::from_millis(500))?;
                c.pragma_update(None, "journal_mode", &"WAL")?;
                c.execute_batch(
                    "CREATE TABLE IF NOT EXISTS flags (
                        name TEXT PRIMARY KEY,
                        value INTEGER NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS storage (
                        id INTEGER PRIMARY KEY CHECK (id = 0),
                        version INTEGER NOT NULL,
                        created_at INTEGER NOT NULL
                    );
                    CREATE TABLE IF NOT EXISTS origins (
                        persistence TEXT NOT NULL,
                        origin TEXT NOT NULL,
                        persisted INTEGER NOT NULL DEFAULT 0,
                        last_access INTEGER NOT NULL,
                        PRIMARY KEY(persistence, origin)
                    );"
                )?;
                Ok(())
            });

        let pool = Pool::builder()
            .max_size(4)
            .connection_timeout(std::time::Duration::from_secs(5))
            .build(manager)?;

        Ok(Self { pool })
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }
}

fn persistence_from_column(value: String) -> r2d2_sqlite::rusqlite::Result<PersistenceType> {
    value.parse().map_err(|_| {
        r2d2_sqlite::rusqlite::Error::InvalidColumnType(
            0,
            format!("persistence {value}"),
            r2d2_sqlite::rusqlite::types::Type::Text,
        )
    })
}

impl MetadataStore for SqliteMetadataStore {
    fn initialized_flag(&self) -> Result<bool> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM flags WHERE name = 'storage_initialized'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0) != 0)
    }

    fn set_initialized_flag(&self, initialized: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO flags(name, value) VALUES ('storage_initialized', ?1)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value",
            params![initialized as i64],
        )?;
        Ok(())
    }

    fn storage_record(&self) -> Result<Option<StorageRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT version, created_at FROM storage WHERE id = 0",
                [],
                |row| {
                    Ok(StorageRecord {
                        version: row.get::<_, u32>(0)?,
                        created_at: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn set_storage_record(&self, record: StorageRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO storage(id, version, created_at) VALUES (0, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET version = excluded.version, created_at = excluded.created_at",
            params![record.version, record.created_at as i64],
        )?;
        Ok(())
    }

    fn origins(&self) -> Result<Vec<OriginRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT persistence, origin, persisted, last_access FROM origins ORDER BY persistence, origin",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(OriginRecord {
                persistence: persistence_from_column(row.get(0)?)?,
                origin: row.get(1)?,
                persisted: row.get::<_, i64>(2)? != 0,
                last_access: row.get::<_, i64>(3)? as u64,
            })
        })?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    fn origin(&self, persistence: PersistenceType, origin: &str) -> Result<Option<OriginRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT persisted, last_access FROM origins WHERE persistence = ?1 AND origin = ?2",
                params![persistence.as_str(), origin],
                |row| {
                    Ok(OriginRecord {
                        persistence,
                        origin: origin.to_string(),
                        persisted: row.get::<_, i64>(0)? != 0,
                        last_access: row.get::<_, i64>(1)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn upsert_origin(&self, record: &OriginRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO origins(persistence, origin, persisted, last_access) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(persistence, origin) DO UPDATE
             SET persisted = excluded.persisted, last_access = excluded.last_access",
            params![
                record.persistence.as_str(),
                record.origin,
                record.persisted as i64,
                record.last_access as i64
            ],
        )?;
        Ok(())
    }

    fn remove_origin(&self, persistence: PersistenceType, origin: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM origins WHERE persistence = ?1 AND origin = ?2",
            params![persistence.as_str(), origin],
        )?;
        Ok(())
    }
}
