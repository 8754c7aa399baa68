//! Remote vault: a shared MySQL database.
//!
//! Permissions come from the server's own `SHOW GRANTS`, so a read-only
//! account yields a vault that serves lookups but refuses inserts.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::{Connection, Row};

use super::{fold_hex, InsertResult, KeyRecord, VaultBackend, VaultKind};
use crate::error::{Result, VaultError};
use crate::gate::{ConnectionGate, GatedConnection, Ticket};
use crate::permissions::Permissions;
use crate::schema::{remote_table_ddl, ServiceTable};

#[async_trait]
impl GatedConnection for MySqlConnection {
    async fn commit(&mut self) -> Result<()> {
        sqlx::query("COMMIT").execute(&mut *self).await?;
        Ok(())
    }

    async fn close(self) -> Result<()> {
        Connection::close(self).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RemoteSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

pub struct RemoteStore {
    database: String,
    gate: Arc<ConnectionGate<MySqlConnection>>,
    ticket: Ticket,
    permissions: Permissions,
}

impl RemoteStore {
    /// Connect, load the account's grants, then park the connection behind
    /// the gate. Grant introspection failures are fatal.
    pub async fn connect(settings: RemoteSettings, gate: Arc<ConnectionGate<MySqlConnection>>) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .username(&settings.username)
            .password(&settings.password)
            .database(&settings.database);
        let mut connection = MySqlConnection::connect_with(&options)
            .await
            .map_err(|e| VaultError::Backend(format!("Cannot connect to {}: {}", settings.host, e)))?;

        let permissions = match load_permissions(&mut connection).await {
            Ok(permissions) => permissions,
            Err(e) => {
                if let Err(close_err) = Connection::close(connection).await {
                    warn!("Failed to close MySQL connection: {}", close_err);
                }
                return Err(e);
            }
        };

        let ticket = gate.register(connection);
        debug!(
            "Connected remote vault {}:{}/{} with ticket {}",
            settings.host, settings.port, settings.database, ticket
        );
        Ok(RemoteStore {
            database: settings.database,
            gate,
            ticket,
            permissions,
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn ticket(&self) -> Ticket {
        self.ticket
    }
}

async fn load_permissions(conn: &mut MySqlConnection) -> Result<Permissions> {
    let rows = sqlx::query("SHOW GRANTS")
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| VaultError::Backend(format!("SHOW GRANTS failed: {}", e)))?;
    let lines = rows
        .iter()
        .map(|row| row.try_get_unchecked::<String, _>(0))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Permissions::from_grant_lines(lines)
}

// ============================================================================
// STATEMENTS (run while holding the connection's gate)
// ============================================================================

async fn count_tables(conn: &mut MySqlConnection, table: String) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(TABLE_NAME) FROM information_schema.TABLES \
         WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?",
    )
    .bind(table)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count == 1)
}

async fn create_table(conn: &mut MySqlConnection, ddl: String) -> Result<()> {
    sqlx::query(&ddl).execute(&mut *conn).await?;
    Ok(())
}

async fn select_key(
    conn: &mut MySqlConnection,
    table: String,
    kid: String,
    title: Option<String>,
    can_backfill: bool,
) -> Result<(Option<KeyRecord>, bool)> {
    let found: Option<(i64, String, Option<String>)> =
        sqlx::query_as(&format!("SELECT `id`, `key_`, `title` FROM `{}` WHERE `kid` = ?", table))
            .bind(&kid)
            .fetch_optional(&mut *conn)
            .await?;
    let Some((id, key, mut stored_title)) = found else {
        return Ok((None, false));
    };

    let mut backfilled = false;
    if stored_title.as_deref().map_or(true, str::is_empty) && can_backfill {
        if let Some(title) = title {
            sqlx::query(&format!("UPDATE `{}` SET `title` = ? WHERE `id` = ?", table))
                .bind(&title)
                .bind(id)
                .execute(&mut *conn)
                .await?;
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

async fn insert_row(
    conn: &mut MySqlConnection,
    table: String,
    kid: String,
    key: String,
    title: Option<String>,
) -> Result<InsertResult> {
    let existing: Option<i64> = sqlx::query_scalar(&format!(
        "SELECT `id` FROM `{}` WHERE `kid` = ? AND `key_` = ? LIMIT 1",
        table
    ))
    .bind(&kid)
    .bind(&key)
    .fetch_optional(&mut *conn)
    .await?;
    if existing.is_some() {
        return Ok(InsertResult::AlreadyExists);
    }

    let inserted = sqlx::query(&format!(
        "INSERT INTO `{}` (`kid`, `key_`, `title`) VALUES (?, ?, ?)",
        table
    ))
    .bind(&kid)
    .bind(&key)
    .bind(&title)
    .execute(&mut *conn)
    .await;

    match inserted {
        Ok(_) => Ok(InsertResult::Success),
        Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(InsertResult::AlreadyExists),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl VaultBackend for RemoteStore {
    fn kind(&self) -> VaultKind {
        VaultKind::Remote
    }

    fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    fn database(&self) -> Option<&str> {
        Some(self.database.as_str())
    }

    fn has_ticket(&self) -> bool {
        self.gate.is_registered(self.ticket)
    }

    async fn table_exists(&self, table: &ServiceTable) -> Result<bool> {
        let table = table.to_string();
        self.gate
            .execute(self.ticket, move |conn: &mut MySqlConnection| Box::pin(count_tables(conn, table)))
            .await
    }

    async fn create_table(&self, table: &ServiceTable) -> Result<()> {
        let ddl = remote_table_ddl(table);
        self.gate
            .execute(self.ticket, move |conn: &mut MySqlConnection| Box::pin(create_table(conn, ddl)))
            .await
    }

    async fn get_key(&self, table: &ServiceTable, kid: &str, title: Option<&str>) -> Result<Option<KeyRecord>> {
        let can_backfill = self
            .permissions
            .has("UPDATE", Some(self.database.as_str()), Some(table.as_str()));
        let table = table.to_string();
        let kid = fold_hex(kid);
        let title = title.filter(|t| !t.is_empty()).map(str::to_owned);

        let (record, backfilled) = self
            .gate
            .execute(self.ticket, move |conn: &mut MySqlConnection| {
                Box::pin(select_key(conn, table, kid, title, can_backfill))
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
            .execute(self.ticket, move |conn: &mut MySqlConnection| {
                Box::pin(insert_row(conn, table, kid, key, title))
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
