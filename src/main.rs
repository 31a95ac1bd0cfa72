//! elohim-user-store: command-line access to the user record store
//!
//! ## Usage
//!
//! ```bash
//! # Read a record (created with defaults if unknown)
//! elohim-user-store get 100004
//!
//! # Read selected values
//! elohim-user-store get 100004 --path money --path settings.theme
//! elohim-user-store list --query '{ userID name money }'
//!
//! # Write
//! elohim-user-store set 100004 settings.theme '"dark"'
//! elohim-user-store add-money 100004 250
//!
//! # Use the relational backend in a custom directory
//! elohim-user-store --backend relational --storage-dir /data/users list
//! ```
//!
//! Results are printed to stdout as pretty JSON; logs go to stderr.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use elohim_user_store::projection::PathSelection;
use elohim_user_store::{
    parse_money, BackendKind, Change, Config, FieldPath, NoProfileProvider, ProfileInfo,
    Projection, Query, SelectionProjector, UserId, UserStore,
};

#[derive(Parser, Debug)]
#[command(name = "elohim-user-store")]
#[command(about = "Serialized user record store")]
struct Cli {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "ELOHIM_USER_STORE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Persistence backend
    #[arg(long, value_enum, env = "ELOHIM_USER_STORE_BACKEND")]
    backend: Option<BackendKind>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print one record, or values at the given paths
    Get {
        user_id: UserId,
        /// Dotted path to read (repeatable)
        #[arg(long = "path")]
        paths: Vec<FieldPath>,
        /// Selection applied before the paths
        #[arg(long)]
        query: Option<Query>,
    },
    /// Print every record
    List {
        #[arg(long)]
        path: Option<FieldPath>,
        #[arg(long)]
        query: Option<Query>,
    },
    /// Create a record
    Create {
        user_id: UserId,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        gender: Option<String>,
        #[arg(long)]
        vanity: Option<String>,
    },
    /// Set a value at a dotted path (JSON, or a bare string)
    Set {
        user_id: UserId,
        path: FieldPath,
        #[arg(allow_hyphen_values = true)]
        value: String,
    },
    /// Remove the value at a dotted path
    DeleteKey { user_id: UserId, path: FieldPath },
    /// Add to the balance
    AddMoney {
        user_id: UserId,
        #[arg(value_parser = parse_money, allow_hyphen_values = true)]
        amount: i64,
    },
    /// Subtract from the balance
    SubtractMoney {
        user_id: UserId,
        #[arg(value_parser = parse_money, allow_hyphen_values = true)]
        amount: i64,
    },
    /// Print the balance
    Money { user_id: UserId },
    /// Delete a record
    Remove { user_id: UserId },
}

fn selection(paths: Vec<FieldPath>) -> PathSelection {
    match paths.len() {
        0 => PathSelection::Whole,
        1 => paths
            .into_iter()
            .next()
            .map(|path| PathSelection::One {
                path,
                default: Value::Null,
            })
            .unwrap_or_default(),
        _ => PathSelection::Many(paths.into_iter().map(|p| (p, Value::Null)).collect()),
    }
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs on stderr; stdout carries the JSON result
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("elohim_user_store=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    // Load config
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)
            .with_context(|| format!("loading config from {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = cli.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }

    info!(
        storage_dir = %config.storage_dir.display(),
        backend = %config.backend,
        "Starting elohim-user-store"
    );

    let store = UserStore::from_config(
        &config,
        Arc::new(NoProfileProvider),
        Arc::new(SelectionProjector),
    )
    .await
    .context("opening user store")?;
    debug!(backend = %store.backend_kind(), "User store ready");

    let output = match cli.command {
        Command::Get {
            user_id,
            paths,
            query,
        } => {
            let projection = Projection {
                query,
                paths: selection(paths),
            };
            store.select(user_id, &projection).await?
        }
        Command::List { path, query } => {
            let projection = Projection {
                query,
                paths: selection(path.into_iter().collect()),
            };
            Value::Array(store.select_all(&projection).await?)
        }
        Command::Create {
            user_id,
            name,
            gender,
            vanity,
        } => {
            let seed = ProfileInfo {
                name,
                gender,
                vanity,
            };
            store.create(user_id, Some(seed)).await?.to_value()
        }
        Command::Set {
            user_id,
            path,
            value,
        } => {
            let value = serde_json::from_str(&value).unwrap_or(Value::String(value));
            store
                .set(user_id, Change::Path(path, value))
                .await
                .with_context(|| format!("updating user {}", user_id))?
                .to_value()
        }
        Command::DeleteKey { user_id, path } => {
            Value::Bool(store.delete_key(user_id, path).await?)
        }
        Command::AddMoney { user_id, amount } => {
            Value::from(store.add_money(user_id, amount).await?)
        }
        Command::SubtractMoney { user_id, amount } => {
            Value::from(store.subtract_money(user_id, amount).await?)
        }
        Command::Money { user_id } => Value::from(store.get_money(user_id).await?),
        Command::Remove { user_id } => Value::Bool(store.remove(user_id).await?),
    };

    print_json(&output)
}
