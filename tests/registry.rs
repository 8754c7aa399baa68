use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use keyvault::{
    ApiSession, ConnectionGate, InsertResult, KeyRecord, LocalStore, PermissionGrant, Permissions, Result,
    ServiceTable, Vault, VaultBackend, VaultError, VaultKind, VaultRegistry,
};
use tempfile::TempDir;

/// In-memory vault with scripted behaviour.
struct StubBackend {
    kind: VaultKind,
    permissions: Permissions,
    keys: HashMap<String, String>,
    has_table: bool,
    broken: bool,
    lookups: Arc<AtomicUsize>,
}

impl StubBackend {
    fn new(kind: VaultKind) -> Self {
        StubBackend {
            kind,
            permissions: Permissions::full_access(),
            keys: HashMap::new(),
            has_table: true,
            broken: false,
            lookups: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn with_key(mut self, kid: &str, key: &str) -> Self {
        self.keys.insert(kid.to_string(), key.to_string());
        self
    }

    fn broken(mut self) -> Self {
        self.broken = true;
        self
    }

    fn without_table(mut self) -> Self {
        self.has_table = false;
        self
    }

    fn with_permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }

    fn into_vault(self, name: &str) -> Vault {
        Vault::new(name, Box::new(self)).unwrap()
    }
}

#[async_trait]
impl VaultBackend for StubBackend {
    fn kind(&self) -> VaultKind {
        self.kind
    }

    fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    async fn table_exists(&self, _table: &ServiceTable) -> Result<bool> {
        Ok(self.has_table)
    }

    async fn get_key(&self, _table: &ServiceTable, kid: &str, _title: Option<&str>) -> Result<Option<KeyRecord>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.broken {
            return Err(VaultError::Backend("connection reset by peer".into()));
        }
        Ok(self.keys.get(kid).map(|key| KeyRecord {
            kid: kid.to_string(),
            key: key.clone(),
            title: None,
        }))
    }

    async fn insert_key(
        &self,
        _table: &ServiceTable,
        _kid: &str,
        _key: &str,
        _title: Option<&str>,
    ) -> Result<InsertResult> {
        Ok(InsertResult::Success)
    }
}

fn local_vault(dir: &TempDir, name: &str) -> Vault {
    let gate = Arc::new(ConnectionGate::new());
    let store = LocalStore::open(&dir.path().join(format!("{}.duckdb", name)), false, gate).unwrap();
    Vault::new(name, Box::new(store)).unwrap()
}

async fn registry(vaults: Vec<Vault>) -> VaultRegistry {
    VaultRegistry::new(vaults, "Netflix", Arc::new(ApiSession::new()))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_first_hit_in_order_wins() {
    let registry = registry(vec![
        StubBackend::new(VaultKind::Remote).into_vault("A"),
        StubBackend::new(VaultKind::Remote)
            .with_key("00aa", "deadbeef")
            .into_vault("B"),
        StubBackend::new(VaultKind::Remote)
            .with_key("00aa", "cafef00d")
            .into_vault("C"),
    ])
    .await;

    let hit = registry.get("00aa", None).await.unwrap().unwrap();
    assert_eq!(hit.key, "deadbeef");
    assert_eq!(hit.vault.name(), "B");
    assert!(registry.get("ffff", None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_local_vaults_are_searched_first() {
    let registry = registry(vec![
        StubBackend::new(VaultKind::HttpApi).into_vault("Api"),
        StubBackend::new(VaultKind::Remote).into_vault("Team"),
        StubBackend::new(VaultKind::Local).into_vault("Local"),
        StubBackend::new(VaultKind::Http).into_vault("Server"),
    ])
    .await;

    let order: Vec<_> = registry.vaults().iter().map(|v| v.name().to_string()).collect();
    assert_eq!(order, ["Local", "Api", "Team", "Server"]);
    assert_eq!(registry.service().as_str(), "netflix");
    assert_eq!(registry.len(), 4);
    assert_eq!(registry.vault("Team").unwrap().kind(), VaultKind::Remote);
    assert!(registry.vault("Nope").is_none());
}

#[tokio::test]
async fn test_failing_vault_is_skipped() {
    let registry = registry(vec![
        StubBackend::new(VaultKind::Remote).broken().into_vault("Flaky"),
        StubBackend::new(VaultKind::Remote)
            .with_key("00aa", "deadbeef")
            .into_vault("Backup"),
    ])
    .await;

    let hit = registry.get("00aa", None).await.unwrap().unwrap();
    assert_eq!(hit.vault.name(), "Backup");
}

#[tokio::test]
async fn test_vault_without_table_is_not_queried() {
    let stub = StubBackend::new(VaultKind::Remote)
        .with_key("00aa", "deadbeef")
        .without_table()
        .with_permissions(Permissions::read_only());
    let lookups = stub.lookups.clone();
    let registry = registry(vec![stub.into_vault("Empty")]).await;

    assert!(registry.get("00aa", None).await.unwrap().is_none());
    assert_eq!(lookups.load(Ordering::SeqCst), 0);
}

#[test]
fn test_vault_without_select_is_rejected() {
    let backend = StubBackend::new(VaultKind::Remote)
        .with_permissions(Permissions::new(vec![PermissionGrant::new(["INSERT"], "*", "*")]));
    let err = Vault::new("WriteOnly", Box::new(backend)).unwrap_err();
    assert!(matches!(err, VaultError::Permission { ref operation, .. } if operation == "SELECT"));
}

#[test]
fn test_usage_only_grants_fail_construction() {
    let permissions = Permissions::from_grant_lines(["GRANT USAGE ON *.* TO `bot`@`%`"]).unwrap();
    let backend = StubBackend::new(VaultKind::Remote).with_permissions(permissions);
    let err = Vault::new("Usage", Box::new(backend)).unwrap_err();
    assert!(matches!(err, VaultError::Permission { ref operation, .. } if operation == "SELECT"));
}

#[test]
fn test_admin_grants_with_proxy_line_open() {
    let permissions = Permissions::from_grant_lines([
        "GRANT ALL PRIVILEGES ON *.* TO `root`@`localhost` WITH GRANT OPTION",
        "GRANT PROXY ON ``@`` TO `root`@`localhost` WITH GRANT OPTION",
    ])
    .unwrap();
    let backend = StubBackend::new(VaultKind::Remote).with_permissions(permissions);
    assert!(Vault::new("Admin", Box::new(backend)).is_ok());
}

#[tokio::test]
async fn test_insert_requires_insert_permission() {
    let registry = registry(vec![StubBackend::new(VaultKind::Remote)
        .with_permissions(Permissions::read_only())
        .into_vault("ReadOnly")])
    .await;

    let vault = registry.vault("ReadOnly").unwrap().clone();
    let err = registry
        .insert_key(&vault, registry.service(), "00aa", "11bb", None)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Permission { ref operation, .. } if operation == "INSERT"));
}

#[tokio::test]
async fn test_local_vault_round_trip_through_registry() {
    let dir = TempDir::new().unwrap();
    let registry = registry(vec![local_vault(&dir, "Local")]).await;
    let vault = registry.vault("Local").unwrap().clone();
    let table = registry.service().clone();

    // Construction provisioned the table.
    assert!(vault.table_exists(&table).await.unwrap());

    let first = registry.insert_key(&vault, &table, "00AA", "DEADBEEF", None).await.unwrap();
    let second = registry.insert_key(&vault, &table, "00aa", "deadbeef", None).await.unwrap();
    registry.commit(&vault).await.unwrap();
    assert_eq!(first, InsertResult::Success);
    assert_eq!(second, InsertResult::AlreadyExists);

    let hit = registry.get("00aa", None).await.unwrap().unwrap();
    assert_eq!(hit.key, "deadbeef");
    assert_eq!(hit.vault.to_string(), "Local (LOCAL)");

    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_lookup_backfills_title() {
    let dir = TempDir::new().unwrap();
    let registry = registry(vec![local_vault(&dir, "Local")]).await;
    let vault = registry.vault("Local").unwrap().clone();
    let table = registry.service().clone();

    registry.insert_key(&vault, &table, "00aa", "11bb", None).await.unwrap();
    assert!(registry.get("00aa", Some("Foo")).await.unwrap().is_some());

    let record = vault.get_key(&table, "00aa", None).await.unwrap().unwrap();
    assert_eq!(record.title.as_deref(), Some("Foo"));
}

#[tokio::test]
async fn test_missing_ticket_aborts_lookup() {
    let dir = TempDir::new().unwrap();
    let registry = registry(vec![
        local_vault(&dir, "Local"),
        StubBackend::new(VaultKind::Remote)
            .with_key("00aa", "deadbeef")
            .into_vault("Team"),
    ])
    .await;

    registry.vault("Local").unwrap().close().await.unwrap();
    let err = registry.get("00aa", None).await.unwrap_err();
    assert!(err.is_missing_ticket());
}

#[tokio::test]
async fn test_invalid_service_name_is_rejected() {
    let err = VaultRegistry::new(Vec::new(), "drop table;", Arc::new(ApiSession::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::Configuration(_)));
}
