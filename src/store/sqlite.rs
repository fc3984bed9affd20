//! SQLite-backed primary store
//!
//! Dumps are plain SQL in the same shape as the sqlite3 shell's `.dump`:
//! schema and `INSERT` statements wrapped in a single transaction, so a dump
//! can be replayed into an empty database with one `execute_batch`.

use super::{Datastore, StoreError, TableDescriptor, TimestampFormat};
use chrono::{DateTime, Utc};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{Connection, params};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

const USER_OBJECT_FILTER: &str = "name NOT LIKE 'sqlite\\_%' ESCAPE '\\'";

/// Primary store backed by a single SQLite database file
pub struct SqliteStore {
    path: PathBuf,
    /// Live connection; `None` while detached for a restore
    live: Mutex<Option<Connection>>,
}

impl SqliteStore {
    /// Open or create the database at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = open_connection(&path)?;

        Ok(Self {
            path,
            live: Mutex::new(Some(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the live connection is currently open
    pub fn is_attached(&self) -> bool {
        self.live.lock().map(|live| live.is_some()).unwrap_or(false)
    }

    /// Run arbitrary SQL against the store
    pub fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        self.with_connection(|conn| Ok(conn.execute_batch(sql)?))
    }

    /// Names of all user tables, sorted
    pub fn table_names(&self) -> Result<Vec<String>, StoreError> {
        self.with_connection(|conn| {
            Ok(user_tables(conn)?.into_iter().map(|(name, _)| name).collect())
        })
    }

    /// Row count per user table
    pub fn table_row_counts(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        self.with_connection(|conn| {
            let mut counts = BTreeMap::new();
            for (name, _) in user_tables(conn)? {
                let count: i64 = conn.query_row(
                    &format!("SELECT count(*) FROM {}", quote_ident(&name)),
                    [],
                    |row| row.get(0),
                )?;
                counts.insert(name, count as u64);
            }
            Ok(counts)
        })
    }

    /// Number of user tables in the store
    pub fn structure_count(&self) -> Result<usize, StoreError> {
        self.with_connection(|conn| Ok(user_tables(conn)?.len()))
    }

    /// Run `f` on the live connection, or on a transient one while detached
    fn with_connection<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let live = self.live.lock().map_err(|_| StoreError::Poisoned)?;
        match live.as_ref() {
            Some(conn) => f(conn),
            None => {
                let conn = open_connection(&self.path)?;
                f(&conn)
            }
        }
    }
}

impl Datastore for SqliteStore {
    fn dump(&self) -> Result<String, StoreError> {
        self.with_connection(dump_connection)
    }

    fn tables(&self) -> Result<Vec<String>, StoreError> {
        self.table_names()
    }

    fn upserts_since(
        &self,
        descriptor: &TableDescriptor,
        anchor: DateTime<Utc>,
    ) -> Result<Vec<String>, StoreError> {
        self.with_connection(|conn| upserts_since(conn, descriptor, anchor))
    }

    fn replace_from(&self, script: &str) -> Result<(), StoreError> {
        self.with_connection(|conn| {
            conn.execute_batch("PRAGMA foreign_keys=OFF;")?;
            drop_user_objects(conn)?;
            run_script(conn, script)
        })
    }

    fn apply(&self, script: &str) -> Result<(), StoreError> {
        self.with_connection(|conn| run_script(conn, script))
    }

    fn detach(&self) -> Result<(), StoreError> {
        let mut live = self.live.lock().map_err(|_| StoreError::Poisoned)?;
        if let Some(conn) = live.take() {
            conn.close().map_err(|(_, err)| err)?;
            tracing::debug!("Detached live store {}", self.path.display());
        }
        Ok(())
    }

    fn reattach(&self) -> Result<(), StoreError> {
        let mut live = self.live.lock().map_err(|_| StoreError::Poisoned)?;
        if live.is_none() {
            *live = Some(open_connection(&self.path)?);
            tracing::debug!("Reattached live store {}", self.path.display());
        }
        Ok(())
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/// User tables as `(name, create_sql)`, sorted by name
fn user_tables(conn: &Connection) -> Result<Vec<(String, String)>, StoreError> {
    let sql = format!(
        "SELECT name, sql FROM sqlite_master \
         WHERE type = 'table' AND sql IS NOT NULL AND {USER_OBJECT_FILTER} ORDER BY name"
    );
    let mut stmt = conn.prepare(&sql)?;
    let tables = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tables)
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

fn dump_connection(conn: &Connection) -> Result<String, StoreError> {
    let mut out = String::from("PRAGMA foreign_keys=OFF;\nBEGIN TRANSACTION;\n");

    for (name, create_sql) in user_tables(conn)? {
        out.push_str(&create_sql);
        out.push_str(";\n");

        let mut stmt = conn.prepare(&format!("SELECT * FROM {}", quote_ident(&name)))?;
        let column_count = stmt.column_count();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let values = (0..column_count)
                .map(|i| row.get_ref(i).map(sql_literal))
                .collect::<Result<Vec<_>, _>>()?;
            let _ = writeln!(
                out,
                "INSERT INTO {} VALUES({});",
                quote_ident(&name),
                values.join(",")
            );
        }
    }

    // Views before triggers, which may reference them
    for object_type in ["view", "index", "trigger"] {
        let sql = format!(
            "SELECT sql FROM sqlite_master \
             WHERE type = ?1 AND sql IS NOT NULL AND {USER_OBJECT_FILTER} ORDER BY name"
        );
        let mut stmt = conn.prepare(&sql)?;
        let statements = stmt
            .query_map(params![object_type], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for statement in statements {
            out.push_str(&statement);
            out.push_str(";\n");
        }
    }

    out.push_str("COMMIT;\n");
    Ok(out)
}

fn upserts_since(
    conn: &Connection,
    descriptor: &TableDescriptor,
    anchor: DateTime<Utc>,
) -> Result<Vec<String>, StoreError> {
    let exists: i64 = conn.query_row(
        "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![descriptor.table],
        |row| row.get(0),
    )?;
    if exists == 0 {
        tracing::debug!("Table {} not present, skipping", descriptor.table);
        return Ok(Vec::new());
    }

    let columns = table_columns(conn, &descriptor.table)?;
    for required in std::iter::once(&descriptor.change_timestamp_column)
        .chain(descriptor.primary_key_columns.iter())
    {
        if !columns.contains(required) {
            return Err(StoreError::MissingColumn {
                table: descriptor.table.clone(),
                column: required.clone(),
            });
        }
    }

    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let order_by = if descriptor.primary_key_columns.is_empty() {
        "rowid".to_string()
    } else {
        descriptor
            .primary_key_columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let table = quote_ident(&descriptor.table);
    let sql = format!(
        "SELECT {column_list} FROM {table} WHERE {} > ?1 ORDER BY {order_by}",
        quote_ident(&descriptor.change_timestamp_column)
    );

    // Bound at millisecond precision, so a second-precision value from the
    // anchor's own second never compares greater
    let bound = match descriptor.timestamp_format {
        TimestampFormat::Text => Value::Text(anchor.format("%Y-%m-%d %H:%M:%S%.3f").to_string()),
        TimestampFormat::UnixSeconds => Value::Real(anchor.timestamp_millis() as f64 / 1000.0),
    };

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![bound])?;
    let mut statements = Vec::new();
    while let Some(row) = rows.next()? {
        let values = (0..columns.len())
            .map(|i| row.get_ref(i).map(sql_literal))
            .collect::<Result<Vec<_>, _>>()?;
        statements.push(format!(
            "INSERT OR REPLACE INTO {table} ({column_list}) VALUES({});",
            values.join(", ")
        ));
    }
    Ok(statements)
}

fn drop_user_objects(conn: &Connection) -> Result<(), StoreError> {
    let sql = format!(
        "SELECT type, name FROM sqlite_master \
         WHERE type IN ('view', 'table') AND {USER_OBJECT_FILTER} ORDER BY type = 'view' DESC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let objects = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    let tx = conn.unchecked_transaction()?;
    for (object_type, name) in objects {
        let keyword = if object_type == "view" { "VIEW" } else { "TABLE" };
        tx.execute_batch(&format!("DROP {keyword} IF EXISTS {};", quote_ident(&name)))?;
    }
    tx.commit()?;
    Ok(())
}

/// Execute a script, rolling back whatever transaction it left open on failure
fn run_script(conn: &Connection, script: &str) -> Result<(), StoreError> {
    if let Err(err) = conn.execute_batch(script) {
        if !conn.is_autocommit() {
            let _ = conn.execute_batch("ROLLBACK;");
        }
        return Err(err.into());
    }
    Ok(())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Render a value as a SQL literal that SQLite parses back to the same value
fn sql_literal(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) if f.is_nan() => "NULL".to_string(),
        ValueRef::Real(f) if f.is_infinite() => {
            let literal = if f > 0.0 { "1e999" } else { "-1e999" };
            literal.to_string()
        }
        ValueRef::Real(f) => format!("{f:?}"),
        ValueRef::Text(text) => {
            format!("'{}'", String::from_utf8_lossy(text).replace('\'', "''"))
        }
        ValueRef::Blob(bytes) => {
            let mut hex = String::with_capacity(bytes.len() * 2 + 3);
            hex.push_str("X'");
            for byte in bytes {
                let _ = write!(hex, "{byte:02x}");
            }
            hex.push('\'');
            hex
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn seeded_store(dir: &TempDir) -> SqliteStore {
        let store = SqliteStore::open(dir.path().join("live.db")).unwrap();
        store
            .execute_batch(
                "CREATE TABLE users (user_id INTEGER PRIMARY KEY, name TEXT, balance REAL, avatar BLOB, updated_at TEXT);
                 CREATE INDEX idx_users_name ON users(name);
                 CREATE VIEW rich_users AS SELECT user_id FROM users WHERE balance > 100;
                 INSERT INTO users VALUES (1, 'O''Brien', 150.5, X'00ff', '2024-01-01 10:00:00');
                 INSERT INTO users VALUES (2, NULL, 1e20, NULL, '2024-03-01 08:30:00');",
            )
            .unwrap();
        store
    }

    #[test]
    fn test_sql_literal_rendering() {
        assert_eq!(sql_literal(ValueRef::Null), "NULL");
        assert_eq!(sql_literal(ValueRef::Integer(-7)), "-7");
        assert_eq!(sql_literal(ValueRef::Real(1.0)), "1.0");
        assert_eq!(sql_literal(ValueRef::Text(b"it's")), "'it''s'");
        assert_eq!(sql_literal(ValueRef::Blob(&[0x00, 0xab])), "X'00ab'");
        assert_eq!(sql_literal(ValueRef::Real(f64::INFINITY)), "1e999");
    }

    #[test]
    fn test_dump_replays_into_empty_store() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir);
        let dump = store.dump().unwrap();
        assert!(dump.starts_with("PRAGMA foreign_keys=OFF;"));
        assert!(dump.trim_end().ends_with("COMMIT;"));

        let copy = SqliteStore::open(dir.path().join("copy.db")).unwrap();
        copy.replace_from(&dump).unwrap();

        assert_eq!(copy.table_row_counts().unwrap(), store.table_row_counts().unwrap());
        let (name, avatar): (String, Vec<u8>) = copy
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT name, avatar FROM users WHERE user_id = 1", [], |r| {
                    Ok((r.get(0)?, r.get(1)?))
                })?)
            })
            .unwrap();
        assert_eq!(name, "O'Brien");
        assert_eq!(avatar, vec![0x00, 0xff]);

        let views: i64 = copy
            .with_connection(|conn| {
                Ok(conn.query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type = 'view'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(views, 1);
    }

    #[test]
    fn test_replace_drops_existing_objects() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir);
        let dump = store.dump().unwrap();

        store
            .execute_batch("CREATE TABLE scratch_notes (id INTEGER); INSERT INTO users (user_id) VALUES (3);")
            .unwrap();
        store.replace_from(&dump).unwrap();

        assert_eq!(store.table_names().unwrap(), vec!["users".to_string()]);
        assert_eq!(store.table_row_counts().unwrap()["users"], 2);
    }

    #[test]
    fn test_upserts_since_filters_by_change_timestamp() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir);
        let descriptor = TableDescriptor::new("users", "updated_at", &["user_id"]);
        let anchor = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();

        let upserts = store.upserts_since(&descriptor, anchor).unwrap();
        assert_eq!(upserts.len(), 1);
        assert!(upserts[0].starts_with("INSERT OR REPLACE INTO \"users\""));
        assert!(upserts[0].contains("'2024-03-01 08:30:00'"));
    }

    #[test]
    fn test_upserts_since_unix_seconds() {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path().join("live.db")).unwrap();
        store
            .execute_batch(
                "CREATE TABLE events (id INTEGER PRIMARY KEY, changed INTEGER);
                 INSERT INTO events VALUES (1, 100), (2, 2000000000);",
            )
            .unwrap();
        let mut descriptor = TableDescriptor::new("events", "changed", &["id"]);
        descriptor.timestamp_format = TimestampFormat::UnixSeconds;

        let upserts = store
            .upserts_since(&descriptor, Utc.timestamp_opt(1_000, 0).unwrap())
            .unwrap();
        assert_eq!(upserts.len(), 1);
        assert!(upserts[0].contains("2000000000"));
    }

    #[test]
    fn test_upserts_since_excludes_rows_at_the_anchor() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir);
        store
            .execute_batch("INSERT INTO users (user_id, updated_at) VALUES (3, '2024-03-01 08:30:00.500');")
            .unwrap();
        let descriptor = TableDescriptor::new("users", "updated_at", &["user_id"]);

        let exact = Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap();
        let upserts = store.upserts_since(&descriptor, exact).unwrap();
        assert_eq!(upserts.len(), 1);
        assert!(upserts[0].contains("'2024-03-01 08:30:00.500'"));

        // Same second as the second-precision row, later than it
        let within = exact + chrono::Duration::milliseconds(250);
        let upserts = store.upserts_since(&descriptor, within).unwrap();
        assert_eq!(upserts.len(), 1);
        assert!(!upserts[0].contains("'2024-03-01 08:30:00'"));

        let after = exact + chrono::Duration::milliseconds(500);
        assert!(store.upserts_since(&descriptor, after).unwrap().is_empty());

        let mut events = TableDescriptor::new("events", "changed", &["id"]);
        events.timestamp_format = TimestampFormat::UnixSeconds;
        store
            .execute_batch("CREATE TABLE events (id INTEGER PRIMARY KEY, changed INTEGER); INSERT INTO events VALUES (1, 1000);")
            .unwrap();
        let anchor = Utc.timestamp_opt(1_000, 0).unwrap();
        assert!(store.upserts_since(&events, anchor).unwrap().is_empty());
        let before = anchor - chrono::Duration::milliseconds(1);
        assert_eq!(store.upserts_since(&events, before).unwrap().len(), 1);
    }

    #[test]
    fn test_upserts_since_missing_table_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir);
        let descriptor = TableDescriptor::new("payments", "updated_at", &["payment_id"]);
        assert!(store.upserts_since(&descriptor, Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn test_upserts_since_missing_column_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir);
        let descriptor = TableDescriptor::new("users", "modified_at", &["user_id"]);
        let err = store.upserts_since(&descriptor, Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::MissingColumn { .. }));
    }

    #[test]
    fn test_failed_script_leaves_no_open_transaction() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir);

        let result = store.apply("BEGIN TRANSACTION; INSERT INTO users (user_id) VALUES (9); INSERT INTO nope VALUES (1); COMMIT;");
        assert!(result.is_err());
        assert_eq!(store.table_row_counts().unwrap()["users"], 2);
        store.execute_batch("BEGIN; COMMIT;").unwrap();
    }

    #[test]
    fn test_detach_and_reattach() {
        let dir = TempDir::new().unwrap();
        let store = seeded_store(&dir);

        store.detach().unwrap();
        assert!(!store.is_attached());
        // Still usable through a transient connection
        assert_eq!(store.structure_count().unwrap(), 1);

        store.reattach().unwrap();
        assert!(store.is_attached());
    }
}
