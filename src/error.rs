//! Error taxonomy shared by every vault backend and the registry.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Error, Debug)]
pub enum VaultError {
    /// Unknown vault type, missing field, or an unusable service name.
    #[error("Invalid vault configuration: {0}")]
    Configuration(String),

    /// The vault does not grant the operation that was attempted.
    #[error("Vault {vault} has no {operation} permission")]
    Permission { vault: String, operation: String },

    /// Grant introspection, schema or statement failure on a DB vault.
    #[error("Backend error: {0}")]
    Backend(String),

    /// A DB operation was attempted without a registered connection.
    #[error("Missing connection ticket: {0}")]
    MissingTicket(String),

    #[error("API returned an error: {status} - {message}")]
    RemoteApi { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

impl VaultError {
    /// Lifecycle defects are never recovered during a multi-vault scan.
    pub fn is_missing_ticket(&self) -> bool {
        matches!(self, VaultError::MissingTicket(_))
    }

    pub(crate) fn permission(vault: impl ToString, operation: &str) -> Self {
        VaultError::Permission {
            vault: vault.to_string(),
            operation: operation.to_uppercase(),
        }
    }
}

impl From<duckdb::Error> for VaultError {
    fn from(e: duckdb::Error) -> Self {
        VaultError::Backend(e.to_string())
    }
}

impl From<sqlx::Error> for VaultError {
    fn from(e: sqlx::Error) -> Self {
        VaultError::Backend(e.to_string())
    }
}

impl From<reqwest::Error> for VaultError {
    fn from(e: reqwest::Error) -> Self {
        VaultError::Http(e.to_string())
    }
}

impl From<VaultError> for String {
    fn from(e: VaultError) -> String {
        e.to_string()
    }
}
