//! WireGuard Configuration Portal
//!
//! A portal daemon that manages encrypted WireGuard peer configurations:
//! self-service claiming with per-user quotas, admin assignment, and an
//! append-only audit trail.

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wg_portal::api;
use wg_portal::audit::{AuditTrail, EventType};
use wg_portal::config::{load_config, Config, DEFAULT_CONFIG_PATH};
use wg_portal::crypto::{generate_key, ConfigCipher};
use wg_portal::db::{Store, User};
use wg_portal::import::import_directory;
use wg_portal::peers::{AllocationEngine, PeerDirectory};

/// WireGuard Configuration Portal
#[derive(Parser)]
#[command(name = "wg-portal")]
#[command(about = "WireGuard configuration portal with peer claiming and quotas")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the portal daemon
    Run {
        /// Override API listen host
        #[arg(long)]
        host: Option<String>,

        /// Override API listen port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate configuration and exit
    CheckConfig,

    /// Generate a new 32-byte encryption key
    GenerateKey,

    /// Import WireGuard configuration files as available peers
    Import {
        /// Directory to scan (defaults to import.directory from config)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// User management commands
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Token management commands
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },

    /// Show portal status
    Status,

    /// Show recent audit events
    Audit {
        /// Maximum number of events to show
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Create a new user
    Create {
        /// User email
        email: String,

        /// Maximum active peers
        #[arg(short, long, default_value = "1")]
        peer_limit: i64,

        /// Grant the admin role
        #[arg(short, long)]
        admin: bool,
    },

    /// List all users
    List,

    /// Change a user's peer limit
    SetLimit {
        /// User email
        email: String,

        /// New peer limit
        limit: i64,
    },

    /// Deactivate a user account
    Deactivate {
        /// User email
        email: String,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    /// Create a new API token for a user
    Create {
        /// User email
        email: String,

        /// Token lifetime in days (unlimited if omitted)
        #[arg(long)]
        expires_days: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = load_config(Some(&cli.config)).context("Failed to load configuration")?;

    match cli.command {
        Some(Commands::CheckConfig) => cmd_check_config(&config),
        Some(Commands::GenerateKey) => cmd_generate_key(),
        Some(Commands::Import { dir }) => cmd_import(&config, dir).await,
        Some(Commands::User { action }) => cmd_user(&config, action).await,
        Some(Commands::Token { action }) => cmd_token(&config, action).await,
        Some(Commands::Status) => cmd_status(&config).await,
        Some(Commands::Audit { limit }) => cmd_audit(&config, limit).await,
        Some(Commands::Run { host, port }) => cmd_run(&config, host, port).await,
        None => cmd_run(&config, None, None).await,
    }
}

fn cmd_check_config(config: &Config) -> Result<()> {
    println!("Configuration is valid");

    println!("\nAPI:");
    println!("  Listen: {}:{}", config.api.listen_host, config.api.listen_port);

    println!("\nDatabase:");
    println!("  Path: {}", config.database.path.display());

    println!("\nEncryption:");
    match &config.encryption.key_file {
        Some(path) => println!("  Key file: {}", path.display()),
        None => println!("  Key file: (none, expecting environment variable)"),
    }

    println!("\nImport:");
    println!("  Directory: {}", config.import.directory.display());

    Ok(())
}

fn cmd_generate_key() -> Result<()> {
    let key = generate_key();

    println!("Generated 32-byte encryption key (hex):");
    println!("{key}");
    println!();
    println!("Store it in the file referenced by encryption.key_file, or export");
    println!("it as WG_PORTAL_ENCRYPTION_KEY. Losing the key makes every stored");
    println!("peer configuration unreadable.");

    Ok(())
}

async fn open_store(config: &Config) -> Result<Store> {
    Store::new(&config.database.path)
        .await
        .context("Failed to open database")
}

fn load_cipher(config: &Config) -> Result<ConfigCipher> {
    let key = config
        .encryption
        .load_key()
        .context("Failed to load encryption key")?;
    ConfigCipher::from_key_str(&key).context("Invalid encryption key")
}

async fn cmd_import(config: &Config, dir: Option<PathBuf>) -> Result<()> {
    let store = open_store(config).await?;
    let cipher = load_cipher(config)?;
    let audit = AuditTrail::new(store.clone());

    let dir = dir.unwrap_or_else(|| config.import.directory.clone());

    let summary = import_directory(&store, &cipher, &audit, &dir, None)
        .await
        .context("Import failed")?;

    println!("Import complete");
    println!("  Imported: {}", summary.imported);
    println!("  Skipped:  {} (already known)", summary.skipped);
    println!("  Failed:   {}", summary.failed);

    Ok(())
}

async fn resolve_user(store: &Store, email: &str) -> Result<User> {
    store
        .get_user_by_email(email)
        .await
        .context("Failed to look up user")?
        .with_context(|| format!("User not found: {email}"))
}

async fn cmd_user(config: &Config, action: UserAction) -> Result<()> {
    let store = open_store(config).await?;
    let audit = AuditTrail::new(store.clone());

    match action {
        UserAction::Create { email, peer_limit, admin } => {
            let user = store
                .create_user(&email, peer_limit, admin)
                .await
                .context("Failed to create user")?;

            println!("User created successfully!");
            println!("  ID:         {}", user.id);
            println!("  Email:      {}", user.email);
            println!("  Peer limit: {}", user.peer_limit);
            println!("  Admin:      {}", admin);
        }
        UserAction::List => {
            let users = store.list_users().await.context("Failed to list users")?;
            if users.is_empty() {
                println!("No users found");
            } else {
                println!(
                    "{:<38} {:<30} {:<10} {:<12} {:<6}",
                    "ID", "Email", "Status", "Peer limit", "Admin"
                );
                println!("{}", "-".repeat(98));
                for u in &users {
                    println!(
                        "{:<38} {:<30} {:<10} {:<12} {:<6}",
                        u.id,
                        u.email,
                        u.status.as_str(),
                        u.peer_limit,
                        u.is_admin(),
                    );
                }
            }
        }
        UserAction::SetLimit { email, limit } => {
            let user = resolve_user(&store, &email).await?;
            let old = store
                .set_peer_limit(&user.id, limit)
                .await
                .context("Failed to update peer limit")?;

            audit
                .record(
                    EventType::LimitChange,
                    None,
                    "users",
                    &user.id,
                    json!({ "old": old, "new": limit }),
                )
                .await;

            println!("Peer limit for {} changed: {} -> {}", email, old, limit);
        }
        UserAction::Deactivate { email } => {
            let user = resolve_user(&store, &email).await?;
            store
                .deactivate_user(&user.id)
                .await
                .context("Failed to deactivate user")?;

            audit
                .record(EventType::UserDeactivate, None, "users", &user.id, json!({}))
                .await;

            println!("User {} deactivated", email);
        }
    }

    Ok(())
}

async fn cmd_token(config: &Config, action: TokenAction) -> Result<()> {
    let store = open_store(config).await?;

    match action {
        TokenAction::Create { email, expires_days } => {
            let user = resolve_user(&store, &email).await?;
            let expires_at = expires_days.map(|days| Utc::now() + chrono::Duration::days(days));

            let (token, token_obj) = store
                .create_token(&user.id, expires_at)
                .await
                .context("Failed to create token")?;

            println!("Token created successfully!");
            println!("  User:    {}", user.email);
            println!(
                "  Expires: {}",
                token_obj
                    .expires_at
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string())
            );
            println!();
            println!("  Token: {token}");
            println!();
            println!("Save this token securely - it cannot be retrieved later!");
        }
    }

    Ok(())
}

async fn cmd_status(config: &Config) -> Result<()> {
    let store = open_store(config).await?;

    let stats = store.get_stats().await.context("Failed to get stats")?;

    println!("WireGuard Portal Status");
    println!("{}", "=".repeat(40));
    println!("Available peers:  {}", stats.available_peers);
    println!("Active peers:     {}", stats.active_peers);
    println!("Inactive peers:   {}", stats.inactive_peers);
    println!("Users:            {}", stats.total_users);

    Ok(())
}

async fn cmd_audit(config: &Config, limit: i64) -> Result<()> {
    let store = open_store(config).await?;
    let audit = AuditTrail::new(store);

    let events = audit.recent(limit).await.context("Failed to read audit log")?;

    if events.is_empty() {
        println!("No audit events found");
        return Ok(());
    }

    println!(
        "{:<22} {:<16} {:<38} {:<14} {}",
        "Time", "Event", "Actor", "Subject", "Metadata"
    );
    println!("{}", "-".repeat(110));

    for e in &events {
        println!(
            "{:<22} {:<16} {:<38} {:<14} {}",
            e.created_at.format("%Y-%m-%d %H:%M:%S"),
            e.event_type,
            e.actor_id.as_deref().unwrap_or("(none)"),
            format!("{}:{}", e.subject_table, truncate(&e.subject_id, 8)),
            e.metadata,
        );
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        format!("{}...", &s[..max])
    } else {
        s.to_string()
    }
}

async fn cmd_run(config: &Config, host: Option<String>, port: Option<u16>) -> Result<()> {
    // Initialize components
    let store = open_store(config).await?;
    let cipher = load_cipher(config)?;
    let audit = AuditTrail::new(store.clone());
    let directory = PeerDirectory::new(store.clone());
    let engine = AllocationEngine::new(store.clone(), audit.clone());

    // Determine listen address
    let listen_host = host.unwrap_or_else(|| config.api.listen_host.clone());
    let listen_port = port.unwrap_or(config.api.listen_port);
    let listen_addr = format!("{}:{}", listen_host, listen_port);

    let app_state = api::AppState {
        store,
        directory,
        engine,
        audit,
        cipher,
    };
    let app = api::create_router(app_state);

    // Create listener
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .context("Failed to bind to address")?;

    info!(listen_addr = %listen_addr, "API server listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
