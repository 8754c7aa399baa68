//! Ordered set of vaults for one service.
//!
//! Lookups walk the vaults local-first and stop at the first hit; inserts
//! target exactly one named vault.

use std::fmt;
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::backend::{ApiSession, BackendContext, InsertResult, Vault};
use crate::config::KeyVaultConfig;
use crate::error::{Result, VaultError};
use crate::schema::ServiceTable;

/// A key found during [`VaultRegistry::get`], with the vault that had it.
#[derive(Debug, Clone)]
pub struct KeyHit {
    pub key: String,
    pub vault: Arc<Vault>,
}

pub struct VaultRegistry {
    vaults: Vec<Arc<Vault>>,
    service: ServiceTable,
    session: Arc<ApiSession>,
}

impl VaultRegistry {
    /// Order `vaults` local-first and provision the service table on each.
    ///
    /// The sort is stable, so configured order is kept within a priority.
    pub async fn new(vaults: Vec<Vault>, service: &str, session: Arc<ApiSession>) -> Result<Self> {
        let service = ServiceTable::new(service)?;
        let mut vaults: Vec<Arc<Vault>> = vaults.into_iter().map(Arc::new).collect();
        vaults.sort_by_key(|vault| vault.kind().priority());

        for vault in &vaults {
            if vault.ensure_table(&service).await? {
                debug!("Provisioned `{}` on {}", service, vault);
            }
        }

        info!("Loaded {} key vault(s) for `{}`", vaults.len(), service);
        Ok(VaultRegistry {
            vaults,
            service,
            session,
        })
    }

    /// Open every configured vault and build the registry.
    pub async fn from_config(config: &KeyVaultConfig, service: &str) -> Result<Self> {
        let session = Arc::new(ApiSession::new());
        let ctx = BackendContext::new(config.http_client()?, session.clone());

        let mut vaults = Vec::with_capacity(config.vaults.len());
        for vault_config in &config.vaults {
            match Vault::open(vault_config, &ctx).await {
                Ok(vault) => vaults.push(vault),
                Err(e) => {
                    error!("Failed to open key vault {}: {}", vault_config.name(), e);
                    for opened in &vaults {
                        if let Err(close_err) = opened.close().await {
                            warn!("Failed to close {}: {}", opened, close_err);
                        }
                    }
                    return Err(e);
                }
            }
        }

        Self::new(vaults, service, session).await
    }

    /// Find `kid` in the first vault that has it.
    ///
    /// A vault that errors is logged and skipped. A missing connection
    /// ticket is a lifecycle bug and aborts the scan.
    pub async fn get(&self, kid: &str, title: Option<&str>) -> Result<Option<KeyHit>> {
        for vault in &self.vaults {
            match self.lookup(vault, kid, title).await {
                Ok(Some(key)) => {
                    debug!("Found {} in {}", kid, vault);
                    return Ok(Some(KeyHit {
                        key,
                        vault: vault.clone(),
                    }));
                }
                Ok(None) => {}
                Err(e) if e.is_missing_ticket() => return Err(e),
                Err(e) => warn!("Skipping {} for {}: {}", vault, kid, e),
            }
        }
        Ok(None)
    }

    async fn lookup(&self, vault: &Vault, kid: &str, title: Option<&str>) -> Result<Option<String>> {
        if !vault.table_exists(&self.service).await? {
            return Ok(None);
        }
        Ok(vault
            .get_key(&self.service, kid, title)
            .await?
            .map(|record| record.key))
    }

    /// Cache a key in one vault. There is no fallback to other vaults.
    pub async fn insert_key(
        &self,
        vault: &Vault,
        table: &ServiceTable,
        kid: &str,
        key: &str,
        title: Option<&str>,
    ) -> Result<InsertResult> {
        vault.ensure_table(table).await?;
        if !vault.can("INSERT", table) {
            return Err(VaultError::permission(vault, "INSERT"));
        }
        vault.insert_key(table, kid, key, title).await
    }

    pub async fn commit(&self, vault: &Vault) -> Result<()> {
        vault.commit().await
    }

    /// Vaults in lookup order.
    pub fn vaults(&self) -> &[Arc<Vault>] {
        &self.vaults
    }

    pub fn vault(&self, name: &str) -> Option<&Arc<Vault>> {
        self.vaults.iter().find(|vault| vault.name() == name)
    }

    pub fn service(&self) -> &ServiceTable {
        &self.service
    }

    pub fn session(&self) -> &Arc<ApiSession> {
        &self.session
    }

    pub fn len(&self) -> usize {
        self.vaults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vaults.is_empty()
    }

    /// Release every vault's connection. All vaults are closed even if one
    /// fails; the first error is returned.
    pub async fn close(&self) -> Result<()> {
        let mut first_error = None;
        for vault in &self.vaults {
            if let Err(e) = vault.close().await {
                error!("Failed to close {}: {}", vault, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for VaultRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultRegistry")
            .field("service", &self.service)
            .field("vaults", &self.vaults)
            .finish()
    }
}
