//! keyvault: look up and cache content keys from the command line.
//!
//! Architecture:
//! ```text
//! CLI (clap) ◄──── This file
//!     │
//!     ▼
//! KeyVaultConfig (TOML/JSON)
//!     │
//!     ▼
//! VaultRegistry ──► Local / Remote / Http / HttpApi vaults
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use keyvault::{KeyVaultConfig, VaultRegistry};

#[derive(Parser, Debug)]
#[command(name = "keyvault", version, about = "Cached content-key lookup")]
struct Cli {
    /// Vault configuration file (.toml or .json)
    #[arg(long, env = "KEYVAULT_CONFIG")]
    config: PathBuf,

    /// Service whose key table is used
    #[arg(long)]
    service: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Find a key by KID
    Get {
        kid: String,
        #[arg(long)]
        title: Option<String>,
    },
    /// Cache a key in one vault
    Insert {
        #[arg(long)]
        vault: String,
        kid: String,
        key: String,
        #[arg(long)]
        title: Option<String>,
    },
    /// List vaults in lookup order
    Vaults,
}

// ============================================================================
// COMMANDS
// ============================================================================

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = KeyVaultConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let registry = VaultRegistry::from_config(&config, &cli.service)
        .await
        .context("Failed to open key vaults")?;

    let outcome = dispatch(&registry, cli.command).await;
    if let Err(e) = registry.close().await {
        log::warn!("Failed to close key vaults: {}", e);
    }
    outcome
}

async fn dispatch(registry: &VaultRegistry, command: Command) -> Result<ExitCode> {
    match command {
        Command::Get { kid, title } => match registry.get(&kid, title.as_deref()).await? {
            Some(hit) => {
                println!("{}:{}", kid, hit.key);
                println!("from {}", hit.vault);
                Ok(ExitCode::SUCCESS)
            }
            None => {
                eprintln!("No key found for {}", kid);
                Ok(ExitCode::FAILURE)
            }
        },
        Command::Insert { vault, kid, key, title } => {
            let target = registry
                .vault(&vault)
                .ok_or_else(|| anyhow!("No vault named {}", vault))?;
            let result = registry
                .insert_key(target, registry.service(), &kid, &key, title.as_deref())
                .await?;
            registry.commit(target).await?;
            println!("{}: {}", target, result);
            Ok(ExitCode::SUCCESS)
        }
        Command::Vaults => {
            let service = registry.service();
            for vault in registry.vaults() {
                let caps: Vec<&str> = ["SELECT", "INSERT", "UPDATE", "CREATE"]
                    .into_iter()
                    .filter(|op| vault.can(op, service))
                    .collect();
                println!("{:<24} {:<8} {}", vault.name(), vault.kind(), caps.join(","));
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    run(Cli::parse()).await
}
