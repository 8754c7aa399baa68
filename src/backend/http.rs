//! HTTP key-server vault.
//!
//! Lookups and inserts are both plain `GET` requests; the server owns its
//! schema and credentials travel as query parameters.

use async_trait::async_trait;
use log::debug;
use serde::Deserialize;

use super::{InsertResult, KeyRecord, VaultBackend, VaultKind};
use crate::error::{Result, VaultError};
use crate::permissions::Permissions;
use crate::schema::ServiceTable;

#[derive(Debug, Deserialize)]
struct KeyList {
    #[serde(default)]
    keys: Option<Vec<KeyEntry>>,
}

#[derive(Debug, Deserialize)]
struct KeyEntry {
    key: String,
}

#[derive(Debug, Deserialize)]
struct InsertStatus {
    status_code: Option<u16>,
    #[serde(default)]
    inserted: bool,
}

impl InsertStatus {
    fn result(&self) -> InsertResult {
        match (self.status_code, self.inserted) {
            (Some(200), true) => InsertResult::Success,
            (Some(200), false) => InsertResult::AlreadyExists,
            _ => InsertResult::Failure,
        }
    }
}

pub struct HttpStore {
    url: String,
    username: String,
    password: String,
    client: reqwest::Client,
    permissions: Permissions,
}

impl HttpStore {
    pub fn new(url: String, username: String, password: String, client: reqwest::Client) -> Self {
        HttpStore {
            url,
            username,
            password,
            client,
            permissions: Permissions::full_access(),
        }
    }

    async fn request<T: serde::de::DeserializeOwned>(&self, params: &[(&str, &str)]) -> Result<T> {
        let response = self
            .client
            .get(&self.url)
            .query(&[("username", self.username.as_str()), ("password", self.password.as_str())])
            .query(params)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| {
            VaultError::Http(format!("Invalid response from {} ({}): {}; body={}", self.url, status, e, body))
        })
    }
}

#[async_trait]
impl VaultBackend for HttpStore {
    fn kind(&self) -> VaultKind {
        VaultKind::Http
    }

    fn permissions(&self) -> &Permissions {
        &self.permissions
    }

    async fn table_exists(&self, _table: &ServiceTable) -> Result<bool> {
        Ok(true)
    }

    async fn get_key(&self, table: &ServiceTable, kid: &str, _title: Option<&str>) -> Result<Option<KeyRecord>> {
        let list: KeyList = self.request(&[("service", table.as_str()), ("kid", kid)]).await?;
        let keys = list.keys.unwrap_or_default();
        debug!("{} returned {} key(s) for {}", self.url, keys.len(), kid);
        Ok(keys.into_iter().next().map(|entry| KeyRecord {
            kid: kid.to_string(),
            key: entry.key,
            title: None,
        }))
    }

    async fn insert_key(
        &self,
        table: &ServiceTable,
        kid: &str,
        key: &str,
        title: Option<&str>,
    ) -> Result<InsertResult> {
        let mut params = vec![("service", table.as_str()), ("kid", kid), ("key", key)];
        if let Some(title) = title {
            params.push(("title", title));
        }
        let status: InsertStatus = self.request(&params).await?;
        Ok(status.result())
    }
}
