//! Key vault backends.
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                            Vault                             │
//! │  name, Box<dyn VaultBackend>                                 │
//! ├──────────────┬──────────────┬──────────────┬─────────────────┤
//! │ LocalStore   │ RemoteStore  │ HttpStore    │ HttpApiStore    │
//! │ DuckDB file  │ MySQL (sqlx) │ GET + query  │ JSON-RPC POST   │
//! │      └── ConnectionGate ──┘ │              │  └─ ApiSession  │
//! └──────────────┴──────────────┴──────────────┴─────────────────┘
//! ```

pub mod http;
pub mod http_api;
pub mod local;
pub mod remote;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::VaultConfig;
use crate::error::{Result, VaultError};
use crate::gate::ConnectionGate;
use crate::permissions::Permissions;
use crate::schema::{self, ServiceTable};

pub use http::HttpStore;
pub use http_api::{ApiSession, HttpApiStore};
pub use local::{LocalConnection, LocalStore};
pub use remote::{RemoteSettings, RemoteStore};

// ============================================================================
// DATA STRUCTURES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VaultKind {
    Local,
    Remote,
    Http,
    HttpApi,
}

impl VaultKind {
    /// Lookup order: local vaults are always searched first.
    pub fn priority(self) -> u8 {
        match self {
            VaultKind::Local => 0,
            VaultKind::Remote | VaultKind::Http | VaultKind::HttpApi => 1,
        }
    }
}

impl fmt::Display for VaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VaultKind::Local => "LOCAL",
            VaultKind::Remote => "REMOTE",
            VaultKind::Http => "HTTP",
            VaultKind::HttpApi => "HTTPAPI",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InsertResult {
    Failure,
    Success,
    AlreadyExists,
}

impl fmt::Display for InsertResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InsertResult::Failure => "FAILURE",
            InsertResult::Success => "SUCCESS",
            InsertResult::AlreadyExists => "ALREADY_EXISTS",
        })
    }
}

/// A cached content key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub kid: String,
    pub key: String,
    pub title: Option<String>,
}

/// KIDs and keys are hex; the SQL vaults store them case-folded.
pub(crate) fn fold_hex(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

// ============================================================================
// THE BACKEND CONTRACT
// ============================================================================

/// One storage protocol. Each implementor owns its connection or session.
#[async_trait]
pub trait VaultBackend: Send + Sync {
    fn kind(&self) -> VaultKind;

    fn permissions(&self) -> &Permissions;

    /// Database the grants are scoped against, for backends that have one.
    fn database(&self) -> Option<&str> {
        None
    }

    /// Whether the backend's gated connection is still registered. Backends
    /// without a connection always report `true`.
    fn has_ticket(&self) -> bool {
        true
    }

    async fn table_exists(&self, table: &ServiceTable) -> Result<bool>;

    /// Run the backend's `CREATE TABLE IF NOT EXISTS`. Permission gating
    /// happens in [`schema::ensure`].
    async fn create_table(&self, _table: &ServiceTable) -> Result<()> {
        Ok(())
    }

    async fn get_key(&self, table: &ServiceTable, kid: &str, title: Option<&str>) -> Result<Option<KeyRecord>>;

    async fn insert_key(
        &self,
        table: &ServiceTable,
        kid: &str,
        key: &str,
        title: Option<&str>,
    ) -> Result<InsertResult>;

    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// THE VAULT
// ============================================================================

/// Shared plumbing handed to backends while opening vaults from config.
pub struct BackendContext {
    pub local_gate: Arc<ConnectionGate<LocalConnection>>,
    pub remote_gate: Arc<ConnectionGate<sqlx::mysql::MySqlConnection>>,
    pub http: reqwest::Client,
    pub session: Arc<ApiSession>,
}

impl BackendContext {
    pub fn new(http: reqwest::Client, session: Arc<ApiSession>) -> Self {
        BackendContext {
            local_gate: Arc::new(ConnectionGate::new()),
            remote_gate: Arc::new(ConnectionGate::new()),
            http,
            session,
        }
    }
}

/// A named, readable key vault.
pub struct Vault {
    name: String,
    backend: Box<dyn VaultBackend>,
}

impl Vault {
    /// Wrap a backend. Every vault must be at least readable.
    pub fn new(name: impl Into<String>, backend: Box<dyn VaultBackend>) -> Result<Self> {
        let vault = Vault {
            name: name.into(),
            backend,
        };
        if !vault.has_permission("SELECT", None, None) {
            return Err(VaultError::permission(&vault, "SELECT"));
        }
        Ok(vault)
    }

    /// Connect the backend described by `config`.
    pub async fn open(config: &VaultConfig, ctx: &BackendContext) -> Result<Self> {
        let backend: Box<dyn VaultBackend> = match config {
            VaultConfig::Local { path, read_only, .. } => {
                Box::new(LocalStore::open(path, *read_only, ctx.local_gate.clone())?)
            }
            VaultConfig::Remote {
                username,
                password,
                database,
                host,
                port,
                ..
            } => {
                let settings = RemoteSettings {
                    host: host.clone(),
                    port: *port,
                    username: username.clone(),
                    password: password.clone(),
                    database: database.clone(),
                };
                Box::new(RemoteStore::connect(settings, ctx.remote_gate.clone()).await?)
            }
            VaultConfig::Http {
                host,
                username,
                password,
                ..
            } => Box::new(HttpStore::new(
                host.clone(),
                username.clone(),
                password.clone(),
                ctx.http.clone(),
            )),
            VaultConfig::HttpApi { host, password, .. } => Box::new(HttpApiStore::new(
                host.clone(),
                password.clone(),
                ctx.http.clone(),
                ctx.session.clone(),
            )),
        };
        Self::new(config.name(), backend)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> VaultKind {
        self.backend.kind()
    }

    pub fn permissions(&self) -> &Permissions {
        self.backend.permissions()
    }

    pub fn has_permission(&self, operation: &str, database: Option<&str>, table: Option<&str>) -> bool {
        self.backend.permissions().has(operation, database, table)
    }

    /// Whether `operation` is granted on `table` in this vault's database.
    pub fn can(&self, operation: &str, table: &ServiceTable) -> bool {
        self.has_permission(operation, self.backend.database(), Some(table.as_str()))
    }

    pub fn has_ticket(&self) -> bool {
        self.backend.has_ticket()
    }

    pub async fn table_exists(&self, table: &ServiceTable) -> Result<bool> {
        self.backend.table_exists(table).await
    }

    pub(crate) async fn create_table(&self, table: &ServiceTable) -> Result<()> {
        self.backend.create_table(table).await
    }

    /// Idempotently provision `table`; see [`schema::ensure`].
    pub async fn ensure_table(&self, table: &ServiceTable) -> Result<bool> {
        schema::ensure(self, table).await
    }

    pub async fn get_key(&self, table: &ServiceTable, kid: &str, title: Option<&str>) -> Result<Option<KeyRecord>> {
        self.backend.get_key(table, kid, title).await
    }

    /// Raw insert without schema or permission checks; callers normally go
    /// through [`VaultRegistry::insert_key`](crate::registry::VaultRegistry::insert_key).
    pub async fn insert_key(
        &self,
        table: &ServiceTable,
        kid: &str,
        key: &str,
        title: Option<&str>,
    ) -> Result<InsertResult> {
        self.backend.insert_key(table, kid, key, title).await
    }

    pub async fn commit(&self) -> Result<()> {
        self.backend.commit().await
    }

    pub async fn close(&self) -> Result<()> {
        self.backend.close().await
    }
}

impl fmt::Display for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.kind())
    }
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .finish()
    }
}
