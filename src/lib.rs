//! Key Vaults: cached content-key lookup.
//!
//! ```text
//! VaultRegistry (per service)
//!     │  get(kid): local first, first hit wins
//!     ▼
//! Vault ── PermissionOracle ── SchemaManager
//!     │
//!     ├─────► LocalStore   (DuckDB)  ─┐
//!     ├─────► RemoteStore  (MySQL)   ─┴─ ConnectionGate
//!     ├─────► HttpStore    (GET)
//!     └─────► HttpApiStore (JSON-RPC) ── ApiSession
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod gate;
pub mod permissions;
pub mod registry;
pub mod schema;

pub use backend::{
    ApiSession, BackendContext, HttpApiStore, HttpStore, InsertResult, KeyRecord, LocalConnection, LocalStore,
    RemoteSettings, RemoteStore, Vault, VaultBackend, VaultKind,
};
pub use config::{KeyVaultConfig, VaultConfig};
pub use error::{Result, VaultError};
pub use gate::{ConnectionGate, GatedConnection, Ticket};
pub use permissions::{PermissionGrant, Permissions};
pub use registry::{KeyHit, VaultRegistry};
pub use schema::ServiceTable;
