use clap::{Parser, Subcommand};
use fulcrum::device::SystemClock;
use fulcrum::jobs::{self, JobContext};
use fulcrum::{jwks, settings, storage, web};
use miette::Result;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "fulcrum",
    version,
    about = "OAuth 2.0 Device Authorization Grant server"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server and background jobs (default)
    Serve,
    /// Register a confidential client and print its credentials
    CreateClient {
        #[arg(long)]
        name: Option<String>,
    },
    /// Add a local user who can approve devices
    CreateUser {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        email: Option<String>,
    },
    /// Run one background job immediately
    RunJob { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // logging
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();

    // load settings
    let settings = settings::Settings::load(&cli.config)?;
    tracing::info!(?settings, "Loaded configuration");

    // init storage (database)
    let db = storage::init(&settings.database).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::CreateClient { name } => {
            let client = storage::create_client(&db, name).await?;
            println!("client_id: {}", client.client_id);
            println!("client_secret: {}", client.client_secret);
        }
        Command::CreateUser {
            username,
            password,
            email,
        } => {
            let user = storage::create_user(&db, &username, &password, email).await?;
            println!("subject: {}", user.subject);
        }
        Command::RunJob { name } => {
            let state = build_state(settings, db).await?;
            let ctx = JobContext {
                db: state.db.clone(),
                machine: state.machine.clone(),
            };
            let count = jobs::trigger_job_manually(&ctx, &name).await?;
            println!("{}: {} records processed", name, count);
        }
        Command::Serve => {
            let state = build_state(settings, db).await?;

            // Keep the scheduler alive for the lifetime of the server
            let _scheduler = jobs::init_scheduler(JobContext {
                db: state.db.clone(),
                machine: state.machine.clone(),
            })
            .await?;

            web::serve(state).await?;
        }
    }
    Ok(())
}

async fn build_state(
    settings: settings::Settings,
    db: sea_orm::DatabaseConnection,
) -> Result<web::AppState> {
    // init jwks (generate if missing)
    let jwks_mgr = jwks::JwksManager::new(settings.keys.clone()).await?;
    Ok(web::AppState::new(
        settings,
        db,
        jwks_mgr,
        Arc::new(SystemClock),
    ))
}
