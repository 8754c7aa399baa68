//! JSON-RPC style key-server vault.
//!
//! Every call is a `POST` of `{method, params, token}` to one URL and comes
//! back as `{status_code, message}`. The server may hand out a `session_id`
//! which later calls echo back.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use log::{debug, error};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{InsertResult, KeyRecord, VaultBackend, VaultKind};
use crate::error::{Result, VaultError};
use crate::permissions::Permissions;
use crate::schema::ServiceTable;

/// Session id shared by every API vault of one registry.
///
/// Concurrent calls race on it and the last response wins. The server only
/// uses the id to keep a session warm, so a stale value costs a new session,
/// not a wrong answer.
#[derive(Debug, Default)]
pub struct ApiSession {
    id: RwLock<Option<String>>,
}

impl ApiSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<String> {
        self.id
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn update(&self, id: impl Into<String>) {
        *self.id.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(id.into());
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status_code: Option<u16>,
    #[serde(default)]
    message: Value,
}

pub struct HttpApiStore {
    url: String,
    token: String,
    client: reqwest::Client,
    session: Arc<ApiSession>,
    permissions: Permissions,
}

impl HttpApiStore {
    pub fn new(url: String, token: String, client: reqwest::Client, session: Arc<ApiSession>) -> Self {
        HttpApiStore {
            url,
            token,
            client,
            session,
            permissions: Permissions::full_access(),
        }
    }

    /// Issue one RPC and return its `message` payload.
    pub async fn call(&self, method: &str, mut params: Map<String, Value>) -> Result<Value> {
        params.insert(
            "session_id".to_string(),
            self.session.current().map(Value::String).unwrap_or(Value::Null),
        );
        let request = json!({
            "method": method,
            "params": params,
            "token": self.token,
        });

        debug!("{} -> {}", self.url, method);
        let response = self.client.post(&self.url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(VaultError::RemoteApi {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("Unknown").to_string(),
            });
        }

        let body = response.text().await?;
        let envelope: Envelope = serde_json::from_str(&body).map_err(|_| VaultError::RemoteApi {
            status: status.as_u16(),
            message: format!("invalid response: {}", body),
        })?;

        if envelope.status_code != Some(200) {
            let message = match envelope.message {
                Value::String(text) => text,
                other => other.to_string(),
            };
            return Err(VaultError::RemoteApi {
                status: envelope.status_code.unwrap_or_default(),
                message,
            });
        }

        if let Some(session_id) = envelope.message.get("session_id").and_then(Value::as_str) {
            self.session.update(session_id);
        }
        Ok(envelope.message)
    }

    async fn lookup(&self, table: &ServiceTable, kid: &str, title: Option<&str>) -> Result<Option<KeyRecord>> {
        let mut params = Map::new();
        params.insert("kid".into(), json!(kid));
        params.insert("service".into(), json!(table.as_str()));
        params.insert("title".into(), json!(title));

        let message = self.call("GetKey", params).await?;
        let found = message
            .get("keys")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|entry| entry.get("kid").and_then(Value::as_str) == Some(kid))
            .find_map(|entry| entry.get("key").and_then(Value::as_str))
            .map(|key| KeyRecord {
                kid: kid.to_string(),
                key: key.to_string(),
                title: title.map(str::to_owned),
            });
        Ok(found)
    }
}

#[async_trait]
impl VaultBackend for HttpApiStore {
    fn kind(&self) -> VaultKind {
        VaultKind::HttpApi
    }

    fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    async fn table_exists(&self, _table: &ServiceTable) -> Result<bool> {
        Ok(true)
    }

    /// RPC failures only cost this vault's answer.
    async fn get_key(&self, table: &ServiceTable, kid: &str, title: Option<&str>) -> Result<Option<KeyRecord>> {
        match self.lookup(table, kid, title).await {
            Ok(found) => Ok(found),
            Err(e) => {
                error!("Failed to get key from {}: {}", self.url, e);
                Ok(None)
            }
        }
    }

    /// The API reports only whether a row was written, so an existing key
    /// comes back as `Failure`, never `AlreadyExists`.
    async fn insert_key(
        &self,
        table: &ServiceTable,
        kid: &str,
        key: &str,
        title: Option<&str>,
    ) -> Result<InsertResult> {
        let mut params = Map::new();
        params.insert("kid".into(), json!(kid));
        params.insert("key".into(), json!(key));
        params.insert("service".into(), json!(table.as_str()));
        params.insert("title".into(), json!(title));

        let message = self.call("InsertKey", params).await?;
        match message.get("inserted").and_then(Value::as_bool) {
            Some(true) => Ok(InsertResult::Success),
            Some(false) => Ok(InsertResult::Failure),
            None => Err(VaultError::RemoteApi {
                status: 200,
                message: format!("invalid response: {}", message),
            }),
        }
    }
}
