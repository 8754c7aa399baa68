//! Per-service key tables: naming, DDL and idempotent provisioning.
//!
//! Every service gets one table named after the lower-cased service id:
//!
//! ```text
//! ┌────────────┬──────────────────────────────┐
//! │ id         │ auto-assigned primary key    │
//! │ kid        │ key id (hex, case-folded)    │
//! │ key_       │ content key (hex)            │
//! │ title      │ optional label               │
//! ├────────────┴──────────────────────────────┤
//! │ UNIQUE (kid, key_)                        │
//! └───────────────────────────────────────────┘
//! ```

use std::fmt;

use log::info;

use crate::backend::Vault;
use crate::error::{Result, VaultError};

/// A validated table name, safe to interpolate into SQL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceTable(String);

impl ServiceTable {
    pub fn new(service: &str) -> Result<Self> {
        let name = service.trim().to_lowercase();
        let mut chars = name.chars();
        let valid = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
            && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid {
            return Err(VaultError::Configuration(format!(
                "Service name [{}] cannot be used as a table name",
                service
            )));
        }
        Ok(ServiceTable(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ServiceTable {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// DuckDB has no AUTOINCREMENT; ids come from a per-table sequence.
pub(crate) fn local_table_ddl(table: &ServiceTable) -> String {
    format!(
        r#"
        CREATE SEQUENCE IF NOT EXISTS "{table}_id_seq";
        CREATE TABLE IF NOT EXISTS "{table}" (
            id      BIGINT PRIMARY KEY DEFAULT nextval('{table}_id_seq'),
            kid     VARCHAR NOT NULL,
            key_    VARCHAR NOT NULL,
            title   VARCHAR,
            UNIQUE (kid, key_)
        );
        "#,
        table = table
    )
}

pub(crate) fn remote_table_ddl(table: &ServiceTable) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS `{table}` (
            id      BIGINT AUTO_INCREMENT PRIMARY KEY,
            kid     VARCHAR(255) NOT NULL,
            key_    VARCHAR(255) NOT NULL,
            title   TEXT,
            UNIQUE (kid, key_)
        )
        "#,
        table = table
    )
}

/// Make sure `table` exists on `vault`.
///
/// Returns `true` only when this call created the table. A vault without
/// CREATE permission is left alone; inserts into it fail later with
/// [`InsertResult::Failure`](crate::backend::InsertResult::Failure).
pub async fn ensure(vault: &Vault, table: &ServiceTable) -> Result<bool> {
    if vault.table_exists(table).await? {
        return Ok(false);
    }
    if !vault.has_ticket() {
        return Err(VaultError::MissingTicket(format!(
            "Vault {} does not have a valid ticket available",
            vault
        )));
    }
    if !vault.can("CREATE", table) {
        info!(
            "Vault {} has no CREATE permission, not creating `{}` table",
            vault, table
        );
        return Ok(false);
    }

    info!("Creating `{}` table in {} key vault...", table, vault);
    vault.create_table(table).await?;
    vault.commit().await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InsertResult, KeyRecord, VaultBackend, VaultKind};
    use crate::permissions::{PermissionGrant, Permissions};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingBackend {
        permissions: Permissions,
        created: Arc<AtomicUsize>,
        ticket: bool,
        database: Option<&'static str>,
    }

    #[async_trait]
    impl VaultBackend for CountingBackend {
        fn kind(&self) -> VaultKind {
            VaultKind::Local
        }

        fn permissions(&self) -> &Permissions {
            &self.permissions
        }

        fn database(&self) -> Option<&str> {
            self.database
        }

        fn has_ticket(&self) -> bool {
            self.ticket
        }

        async fn table_exists(&self, _table: &ServiceTable) -> Result<bool> {
            Ok(self.created.load(Ordering::SeqCst) > 0)
        }

        async fn create_table(&self, _table: &ServiceTable) -> Result<()> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn get_key(&self, _: &ServiceTable, _: &str, _: Option<&str>) -> Result<Option<KeyRecord>> {
            Ok(None)
        }

        async fn insert_key(&self, _: &ServiceTable, _: &str, _: &str, _: Option<&str>) -> Result<InsertResult> {
            Ok(InsertResult::Failure)
        }
    }

    fn vault(permissions: Permissions, ticket: bool) -> (Vault, Arc<AtomicUsize>) {
        scoped_vault(permissions, ticket, None)
    }

    fn scoped_vault(permissions: Permissions, ticket: bool, database: Option<&'static str>) -> (Vault, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let backend = CountingBackend {
            permissions,
            created: created.clone(),
            ticket,
            database,
        };
        (Vault::new("Counting", Box::new(backend)).unwrap(), created)
    }

    #[test]
    fn test_service_table_is_lowercased() {
        assert_eq!(ServiceTable::new("DisneyPlus").unwrap().as_str(), "disneyplus");
        assert_eq!(ServiceTable::new(" my5 ").unwrap().as_str(), "my5");
    }

    #[test]
    fn test_service_table_rejects_injection() {
        for bad in ["", "5tv", "bbc iplayer", "x`; DROP TABLE y", "tubi\"", "now-tv"] {
            assert!(matches!(ServiceTable::new(bad), Err(VaultError::Configuration(_))), "{bad}");
        }
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let (vault, created) = vault(Permissions::full_access(), true);
        let table = ServiceTable::new("stan").unwrap();

        assert!(ensure(&vault, &table).await.unwrap());
        for _ in 0..4 {
            assert!(!ensure(&vault, &table).await.unwrap());
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ensure_without_create_is_silent() {
        let perms = Permissions::new(vec![PermissionGrant::new(["SELECT", "INSERT"], "*", "*")]);
        let (vault, created) = vault(perms, true);
        let table = ServiceTable::new("itv").unwrap();

        assert!(!ensure(&vault, &table).await.unwrap());
        assert_eq!(created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ensure_checks_create_scope() {
        let table = ServiceTable::new("itv").unwrap();
        let other_db = Permissions::new(vec![
            PermissionGrant::new(["SELECT"], "*", "*"),
            PermissionGrant::new(["CREATE"], "otherdb", "*"),
        ]);
        let (vault, created) = scoped_vault(other_db, true, Some("keys"));
        assert!(!ensure(&vault, &table).await.unwrap());
        assert_eq!(created.load(Ordering::SeqCst), 0);

        let other_table = Permissions::new(vec![
            PermissionGrant::new(["SELECT"], "*", "*"),
            PermissionGrant::new(["CREATE"], "keys", "hulu"),
        ]);
        let (vault, created) = scoped_vault(other_table, true, Some("keys"));
        assert!(!ensure(&vault, &table).await.unwrap());
        assert_eq!(created.load(Ordering::SeqCst), 0);

        let this_db = Permissions::new(vec![
            PermissionGrant::new(["SELECT"], "*", "*"),
            PermissionGrant::new(["CREATE"], "keys", "*"),
        ]);
        let (vault, created) = scoped_vault(this_db, true, Some("keys"));
        assert!(ensure(&vault, &table).await.unwrap());
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ensure_without_ticket_fails() {
        let (vault, created) = vault(Permissions::full_access(), false);
        let table = ServiceTable::new("roku").unwrap();

        let result = ensure(&vault, &table).await;
        assert!(matches!(result, Err(VaultError::MissingTicket(_))));
        assert_eq!(created.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_ddl_targets_validated_table() {
        let table = ServiceTable::new("Britbox").unwrap();
        assert!(local_table_ddl(&table).contains(r#"CREATE TABLE IF NOT EXISTS "britbox""#));
        assert!(remote_table_ddl(&table).contains("CREATE TABLE IF NOT EXISTS `britbox`"));
        assert!(remote_table_ddl(&table).contains("AUTO_INCREMENT"));
    }
}
