//! Vault configuration.
//!
//! Loaded from TOML, or JSON when the file ends in `.json`:
//!
//! ```toml
//! data_dir = "~/.local/share/keyvault"
//!
//! [http]
//! timeout_secs = 30
//!
//! [[vault]]
//! type = "local"
//! name = "Local"
//! path = "{data_dir}/vaults/keys.duckdb"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, VaultError};

const DATA_DIR_TOKEN: &str = "{data_dir}";

fn default_timeout_secs() -> u64 {
    30
}

fn default_mysql_port() -> u16 {
    3306
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        HttpSettings {
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// One `[[vault]]` record, tagged by `type`. Tags are matched without
/// regard to case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum VaultConfig {
    #[serde(rename = "local")]
    Local {
        name: String,
        path: PathBuf,
        #[serde(default)]
        read_only: bool,
    },
    #[serde(rename = "remote")]
    Remote {
        name: String,
        username: String,
        #[serde(default)]
        password: String,
        database: String,
        host: String,
        #[serde(default = "default_mysql_port")]
        port: u16,
    },
    #[serde(rename = "http")]
    Http {
        name: String,
        #[serde(alias = "url")]
        host: String,
        username: String,
        password: String,
    },
    #[serde(rename = "httpapi", alias = "http_api")]
    HttpApi {
        name: String,
        #[serde(alias = "url")]
        host: String,
        password: String,
    },
}

impl VaultConfig {
    pub fn name(&self) -> &str {
        match self {
            VaultConfig::Local { name, .. }
            | VaultConfig::Remote { name, .. }
            | VaultConfig::Http { name, .. }
            | VaultConfig::HttpApi { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyVaultConfig {
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(rename = "vault", default)]
    pub vaults: Vec<VaultConfig>,
}

impl KeyVaultConfig {
    /// Load and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| VaultError::Configuration(format!("Cannot read {}: {}", path.display(), e)))?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_toml_str(&text)
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(text).map_err(|e| VaultError::Configuration(e.to_string()))?;
        let value = serde_json::to_value(table).map_err(|e| VaultError::Configuration(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text).map_err(|e| VaultError::Configuration(e.to_string()))?;
        Self::from_value(value)
    }

    fn from_value(mut value: Value) -> Result<Self> {
        fold_type_tags(&mut value);
        let config: KeyVaultConfig =
            serde_json::from_value(value).map_err(|e| VaultError::Configuration(e.to_string()))?;
        config.validated()
    }

    /// A reqwest client honouring `[http] timeout_secs`.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(self.http.timeout_secs))
            .build()
            .map_err(VaultError::from)
    }

    fn validated(mut self) -> Result<Self> {
        let mut seen = HashSet::new();
        for vault in &self.vaults {
            if vault.name().trim().is_empty() {
                return Err(VaultError::Configuration("Vault name must not be empty".into()));
            }
            if !seen.insert(vault.name().to_string()) {
                return Err(VaultError::Configuration(format!(
                    "Duplicate vault name: {}",
                    vault.name()
                )));
            }
        }

        let data_dir = self.data_dir.as_deref().map(expand_home);
        for vault in &mut self.vaults {
            if let VaultConfig::Local { name, path, .. } = vault {
                *path = expand_path(path, data_dir.as_deref())
                    .map_err(|e| VaultError::Configuration(format!("Vault {}: {}", name, e)))?;
            }
        }
        Ok(self)
    }
}

/// Lower-case every `[[vault]]` `type` tag.
fn fold_type_tags(value: &mut Value) {
    let Some(vaults) = value.get_mut("vault").and_then(Value::as_array_mut) else {
        return;
    };
    for vault in vaults {
        if let Some(tag) = vault.get_mut("type") {
            if let Some(folded) = tag.as_str().map(str::to_ascii_lowercase) {
                *tag = Value::String(folded);
            }
        }
    }
}

fn expand_home(raw: &str) -> String {
    match (raw.strip_prefix('~'), std::env::var("HOME")) {
        (Some(rest), Ok(home)) if rest.is_empty() || rest.starts_with('/') => format!("{}{}", home, rest),
        _ => raw.to_string(),
    }
}

fn expand_path(path: &Path, data_dir: Option<&str>) -> std::result::Result<PathBuf, String> {
    let raw = path.to_string_lossy();
    let substituted = if raw.contains(DATA_DIR_TOKEN) {
        let data_dir = data_dir.ok_or_else(|| format!("{} used but data_dir is not set", DATA_DIR_TOKEN))?;
        raw.replace(DATA_DIR_TOKEN, data_dir)
    } else {
        raw.into_owned()
    };
    Ok(PathBuf::from(expand_home(&substituted)))
}
