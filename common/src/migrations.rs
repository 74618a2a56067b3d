use rusqlite::{params, Connection, OptionalExtension, Result};

pub const SCHEMA_VERSION: i32 = 2;

pub struct Migrator {
    conn: Connection,
}

impl Migrator {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn run_migrations(&mut self) -> Result<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        let current_version = current_version(&self.conn)?;
        log::info!("Current job store schema version: {}", current_version);

        if current_version < SCHEMA_VERSION {
            log::info!("Migrating job store from version {} to {}", current_version, SCHEMA_VERSION);
            self.migrate_from(current_version)?;
        }

        Ok(())
    }

    fn migrate_from(&mut self, from_version: i32) -> Result<()> {
        let tx = self.conn.transaction()?;

        for version in (from_version + 1)..=SCHEMA_VERSION {
            log::info!("Applying migration to version {}", version);
            match version {
                1 => Self::migrate_to_v1_impl(&tx)?,
                2 => Self::migrate_to_v2_impl(&tx)?,
                _ => return Err(rusqlite::Error::InvalidQuery),
            }

            tx.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![version],
            )?;
        }

        tx.commit()?;
        Ok(())
    }

    fn migrate_to_v1_impl(tx: &rusqlite::Transaction) -> Result<()> {
        // AUTOINCREMENT keeps ids monotonic: a retired id is never handed out again.
        tx.execute(
            "CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                status INTEGER NOT NULL DEFAULT 0 CHECK (status IN (0, 1, 2, 3)),
                submitted TEXT,
                started TEXT,
                finished TEXT
            )",
            [],
        )?;
        Ok(())
    }

    fn migrate_to_v2_impl(tx: &rusqlite::Transaction) -> Result<()> {
        tx.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status)",
            [],
        )?;
        Ok(())
    }

    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

/// Highest applied schema version, 0 for a store that was never migrated.
pub fn current_version(conn: &Connection) -> Result<i32> {
    let has_table: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if has_table.is_none() {
        return Ok(0);
    }

    let version: Option<i32> =
        conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(version.unwrap_or(0))
}
