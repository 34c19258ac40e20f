use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use linkgate::config::{Config, DatabaseBackend};
use linkgate::protection::{LockoutPolicy, PasswordGate};
use linkgate::storage::{PostgresStorage, SqliteStorage, Storage, StorageError};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "linkgate-admin")]
#[command(about = "Linkgate link and protection management CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a link
    CreateLink {
        link_id: String,
        /// Owner user ID (as forwarded by the hosting layer)
        owner_id: String,
        destination_url: String,
    },
    /// Delete a link with its protection record and click events
    DeleteLink { link_id: String },
    /// Show a link, its counters and protection status
    Show { link_id: String },
    /// List the most recent click events of a link
    Clicks {
        link_id: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Password-protect a link
    SetPassword {
        link_id: String,
        owner_id: String,
        password: String,
        #[arg(long)]
        hint: Option<String>,
    },
    /// Remove password protection from a link
    ClearPassword { link_id: String, owner_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let storage: Arc<dyn Storage> = match config.database.backend {
        DatabaseBackend::Sqlite => Arc::new(
            SqliteStorage::new(&config.database.url, config.database.max_connections).await?,
        ),
        DatabaseBackend::Postgres => Arc::new(
            PostgresStorage::new(&config.database.url, config.database.max_connections).await?,
        ),
    };

    // Ensure database is initialized
    storage.init().await?;

    match cli.command {
        Commands::CreateLink {
            link_id,
            owner_id,
            destination_url,
        } => match storage
            .create_link(&link_id, &owner_id, &destination_url)
            .await
        {
            Ok(link) => println!("✓ Created link '{}' -> {}", link.link_id, link.destination_url),
            Err(StorageError::Conflict) => println!("⚠ Link '{}' already exists", link_id),
            Err(e) => return Err(e).context("failed to create link"),
        },
        Commands::DeleteLink { link_id } => {
            if storage.delete_link(&link_id).await? {
                println!("✓ Deleted link '{}'", link_id);
            } else {
                println!("⚠ Link '{}' does not exist", link_id);
            }
        }
        Commands::Show { link_id } => {
            let link = storage
                .get_link(&link_id)
                .await?
                .with_context(|| format!("link '{link_id}' not found"))?;
            let gate = PasswordGate::new(Arc::clone(&storage), LockoutPolicy::from(&config.protection));
            let info = gate.get_protection_info(&link_id).await?;

            println!("{}", serde_json::to_string_pretty(&link)?);
            println!("protection: {}", serde_json::to_string_pretty(&info)?);
        }
        Commands::Clicks { link_id, limit } => {
            let clicks = storage.list_clicks(&link_id, limit.clamp(1, 1000)).await?;
            if clicks.is_empty() {
                println!("No clicks recorded for '{}'", link_id);
            }
            for click in clicks {
                println!(
                    "{}  {:<15}  {:<8}  {:<10}  bot={}  {}",
                    click.timestamp,
                    click.ip,
                    click.device,
                    click.country.as_deref().unwrap_or("-"),
                    click.is_bot,
                    click.user_agent
                );
            }
        }
        Commands::SetPassword {
            link_id,
            owner_id,
            password,
            hint,
        } => {
            let gate = PasswordGate::new(Arc::clone(&storage), LockoutPolicy::from(&config.protection));
            gate.set_password(&link_id, &owner_id, &password, hint.as_deref())
                .await?;
            println!("✓ Link '{}' is now password protected", link_id);
        }
        Commands::ClearPassword { link_id, owner_id } => {
            let gate = PasswordGate::new(Arc::clone(&storage), LockoutPolicy::from(&config.protection));
            if gate.remove_password(&link_id, &owner_id).await? {
                println!("✓ Removed password protection from '{}'", link_id);
            } else {
                println!("⚠ Link '{}' was not protected by '{}'", link_id, owner_id);
            }
        }
    }

    Ok(())
}
