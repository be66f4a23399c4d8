use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fleetd::auth;
use fleetd::db::{DbHandle, FleetDb};
use fleetd::server::{ServerConfig, start_server};

#[derive(Parser)]
#[command(name = "fleetd", version, about = "City bus fleet management backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API and WebSocket relay
    Serve {
        /// Port to listen on
        #[arg(long, default_value_t = 8080)]
        port: u16,

        /// Path to the SQLite database file
        #[arg(long, default_value = "fleet.db")]
        db: PathBuf,

        /// Enable permissive CORS for local dashboard development
        #[arg(long)]
        dev: bool,
    },
    /// Create an admin account
    CreateAdmin {
        /// Login username
        #[arg(long)]
        username: String,

        /// Password (hashed before storage)
        #[arg(long)]
        password: String,

        /// Name shown in the dashboard
        #[arg(long)]
        display_name: Option<String>,

        /// Path to the SQLite database file
        #[arg(long, default_value = "fleet.db")]
        db: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { port, db, dev } => {
            start_server(ServerConfig {
                port,
                db_path: db,
                dev_mode: dev,
                token_secret: ServerConfig::resolve_secret(),
            })
            .await
        }
        Command::CreateAdmin {
            username,
            password,
            display_name,
            db,
        } => {
            let display_name = display_name.unwrap_or_else(|| username.clone());
            let handle = DbHandle::new(FleetDb::new(&db)?);
            let admin = handle.lock_sync()?.create_admin(
                &username,
                &auth::hash_password(&password),
                &display_name,
            )?;
            println!("Created admin '{}' (id {})", admin.username, admin.id);
            Ok(())
        }
    }
}
