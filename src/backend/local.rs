//! Local vault: an embedded DuckDB file.
//!
//! The connection is registered with a [`ConnectionGate`] at open time and
//! every statement runs through it. DuckDB calls block, so each gated
//! statement body is moved onto tokio's blocking pool while the gate's lock
//! is held.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use duckdb::{params, AccessMode, Config, Connection};
use log::debug;

use super::{fold_hex, InsertResult, KeyRecord, VaultBackend, VaultKind};
use crate::error::{Result, VaultError};
use crate::gate::{ConnectionGate, GatedConnection, Ticket};
use crate::permissions::Permissions;
use crate::schema::{local_table_ddl, ServiceTable};

/// A DuckDB connection that runs its statements off the async workers.
pub struct LocalConnection {
    inner: Arc<Mutex<Connection>>,
}

impl LocalConnection {
    fn new(connection: Connection) -> Self {
        LocalConnection {
            inner: Arc::new(Mutex::new(connection)),
        }
    }

    /// Run `op` on the blocking pool and wait for it.
    pub async fn run<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let connection = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            op(&connection)
        })
        .await
        .map_err(|e| VaultError::Backend(format!("DuckDB task failed: {}", e)))?
    }
}

#[async_trait]
impl GatedConnection for LocalConnection {
    async fn commit(&mut self) -> Result<()> {
        // Writes are autocommitted; CHECKPOINT moves the WAL into the file.
        self.run(|conn| conn.execute_batch("CHECKPOINT").map_err(VaultError::from))
            .await
    }
}

pub struct LocalStore {
    path: PathBuf,
    gate: Arc<ConnectionGate<LocalConnection>>,
    ticket: Ticket,
    permissions: Permissions,
}

impl LocalStore {
    /// Open (creating if needed) the DuckDB file at `path`.
    ///
    /// A read-only store is granted SELECT only.
    pub fn open(path: &Path, read_only: bool, gate: Arc<ConnectionGate<LocalConnection>>) -> Result<Self> {
        let connection = if read_only {
            let config = Config::default().access_mode(AccessMode::ReadOnly)?;
            Connection::open_with_flags(path, config)?
        } else {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|e| {
                    VaultError::Backend(format!("Cannot create {}: {}", parent.display(), e))
                })?;
            }
            Connection::open(path)?
        };

        let permissions = if read_only {
            Permissions::read_only()
        } else {
            Permissions::full_access()
        };
        let ticket = gate.register(LocalConnection::new(connection));
        debug!("Opened local vault {} with ticket {}", path.display(), ticket);

        Ok(LocalStore {
            path: path.to_path_buf(),
            gate,
            ticket,
            permissions,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }
}

/// `query_row` with "no rows" mapped to `None`.
fn optional<T>(result: duckdb::Result<T>) -> duckdb::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(duckdb::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

fn is_duplicate(e: &duckdb::Error) -> bool {
    let message = e.to_string();
    message.contains("Duplicate key") || message.contains("Constraint Error")
}

// ============================================================================
// STATEMENTS (run while holding the connection's gate)
// ============================================================================

fn count_tables(conn: &Connection, table: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT count(*) FROM information_schema.tables WHERE table_name = ?",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count == 1)
}

/// Look up `kid`, filling in an empty stored title when allowed.
/// The flag reports whether a backfill was written.
fn select_key(
    conn: &Connection,
    table: &str,
    kid: String,
    title: Option<String>,
    can_backfill: bool,
) -> Result<(Option<KeyRecord>, bool)> {
    let found = optional(conn.query_row(
        &format!(r#"SELECT id, key_, title FROM "{}" WHERE kid = ?"#, table),
        params![kid],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        },
    ))?;
    let Some((id, key, mut stored_title)) = found else {
        return Ok((None, false));
    };

    let mut backfilled = false;
    if stored_title.as_deref().map_or(true, str::is_empty) && can_backfill {
        if let Some(title) = title {
            conn.execute(
                &format!(r#"UPDATE "{}" SET title = ? WHERE id = ?"#, table),
                params![title, id],
            )?;
            stored_title = Some(title);
            backfilled = true;
        }
    }

    Ok((
        Some(KeyRecord {
            kid,
            key,
            title: stored_title,
        }),
        backfilled,
    ))
}

/// Dedup check and insert in one critical section.
fn insert_row(conn: &Connection, table: &str, kid: &str, key: &str, title: Option<&str>) -> Result<InsertResult> {
    let existing: i64 = conn.query_row(
        &format!(r#"SELECT count(*) FROM "{}" WHERE kid = ? AND key_ = ?"#, table),
        params![kid, key],
        |row| row.get(0),
    )?;
    if existing > 0 {
        return Ok(InsertResult::AlreadyExists);
    }

    match conn.execute(
        &format!(r#"INSERT INTO "{}" (kid, key_, title) VALUES (?, ?, ?)"#, table),
        params![kid, key, title],
    ) {
        Ok(_) => Ok(InsertResult::Success),
        Err(e) if is_duplicate(&e) => Ok(InsertResult::AlreadyExists),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl VaultBackend for LocalStore {
    fn kind(&self) -> VaultKind {
        VaultKind::Local
    }

    fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    fn has_ticket(&self) -> bool {
        self.gate.is_registered(self.ticket)
    }

    async fn table_exists(&self, table: &ServiceTable) -> Result<bool> {
        let table = table.to_string();
        self.gate
            .execute(self.ticket, move |conn: &mut LocalConnection| {
                Box::pin(async move { conn.run(move |c| count_tables(c, &table)).await })
            })
            .await
    }

    async fn create_table(&self, table: &ServiceTable) -> Result<()> {
        let ddl = local_table_ddl(table);
        self.gate
            .execute(self.ticket, move |conn: &mut LocalConnection| {
                Box::pin(async move { conn.run(move |c| c.execute_batch(&ddl).map_err(VaultError::from)).await })
            })
            .await
    }

    async fn get_key(&self, table: &ServiceTable, kid: &str, title: Option<&str>) -> Result<Option<KeyRecord>> {
        let can_backfill = self.permissions.has("UPDATE", None, Some(table.as_str()));
        let table = table.to_string();
        let kid = fold_hex(kid);
        let title = title.filter(|t| !t.is_empty()).map(str::to_owned);

        let (record, backfilled) = self
            .gate
            .execute(self.ticket, move |conn: &mut LocalConnection| {
                Box::pin(async move { conn.run(move |c| select_key(c, &table, kid, title, can_backfill)).await })
            })
            .await?;

        if backfilled {
            self.commit().await?;
        }
        Ok(record)
    }

    async fn insert_key(
        &self,
        table: &ServiceTable,
        kid: &str,
        key: &str,
        title: Option<&str>,
    ) -> Result<InsertResult> {
        if !self.table_exists(table).await? {
            return Ok(InsertResult::Failure);
        }
        let table = table.to_string();
        let kid = fold_hex(kid);
        let key = fold_hex(key);
        let title = title.map(str::to_owned);

        self.gate
            .execute(self.ticket, move |conn: &mut LocalConnection| {
                Box::pin(async move { conn.run(move |c| insert_row(c, &table, &kid, &key, title.as_deref())).await })
            })
            .await
    }

    async fn commit(&self) -> Result<()> {
        self.gate.commit(self.ticket).await
    }

    async fn close(&self) -> Result<()> {
        if self.has_ticket() {
            self.gate.release(self.ticket).await?;
        }
        Ok(())
    }
}
