use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use lacquer::schema::{SchemaConfig, SchemaPlan};
use lacquer::{NewAppointment, OwnerId, Store, SyncConfig, SyncManager};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "lacquer", version, about = "Lacquer CLI")]
struct Cli {
    /// Postgres connection string. Falls back to DATABASE_URL.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Schema holding the document tables (default: public)
    #[arg(long, default_value = "public")]
    schema: String,

    /// Account to act as. Unset means the fallback owner.
    #[arg(long, env = "LACQUER_OWNER")]
    owner: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show planned DDL changes without applying
    SchemaPlan,

    /// Apply DDL changes (create schema/tables/indexes as needed)
    SchemaSync,

    /// List clients with their appointment counts
    Clients,

    /// Add a client
    AddClient {
        name: String,
        #[arg(long)]
        phone: Option<String>,
    },

    /// Book an appointment
    Book {
        /// Client id; required once any client exists
        #[arg(long)]
        client: Option<Uuid>,
        /// Client name; defaults to the selected client's name
        #[arg(long, default_value = "")]
        name: String,
        #[arg(long)]
        service: String,
        /// RFC 3339 date-time, e.g. 2025-03-14T15:30:00Z
        #[arg(long)]
        date: DateTime<Utc>,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Delete a client with all of its appointments and designs
    DeleteClient { id: Uuid },

    /// Print the client list whenever it changes, until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> lacquer::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lacquer=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let Some(url) = cli.database_url else {
        eprintln!("error: --database-url or env DATABASE_URL is required");
        std::process::exit(2);
    };

    let store = Store::builder(url).schema(cli.schema.clone()).build().await?;
    let config = SyncConfig::from_env();
    let owner = OwnerId::resolve(
        cli.owner.map(OwnerId::new).as_ref(),
        &config.fallback_owner,
    );

    match cli.command {
        Commands::SchemaPlan => {
            let plan = store
                .schema()
                .plan(&SchemaConfig::with_base_schema(cli.schema))
                .await?;
            print_plan(&plan);
        }
        Commands::SchemaSync => {
            let plan = store
                .schema()
                .sync(&SchemaConfig::with_base_schema(cli.schema))
                .await?;
            if plan.is_empty() {
                println!("No changes needed.");
            } else {
                println!("Applied changes:");
                print_plan(&plan);
            }
        }
        Commands::Clients => {
            let session = open(&store, &owner, config).await?;
            for client in session.list_clients().iter() {
                println!(
                    "{}  {:<24} {:<14} {} appointments",
                    client.id,
                    client.name,
                    client.phone.as_deref().unwrap_or("-"),
                    session.list_appointments_for_client(client.id).len()
                );
            }
            session.stop().await;
        }
        Commands::AddClient { name, phone } => {
            let session = SyncManager::new(Arc::new(store.docs(&owner)), config);
            let client = session.add_client(&name, phone.as_deref()).await?;
            println!("{}", client.id);
        }
        Commands::Book {
            client,
            name,
            service,
            date,
            notes,
        } => {
            let session = open(&store, &owner, config).await?;
            let booked = session
                .add_appointment(NewAppointment {
                    client_id: client,
                    client_name: name,
                    service,
                    date,
                    notes,
                })
                .await;
            session.stop().await;
            let appointment = booked?;
            println!(
                "{}  {} for {} on {}",
                appointment.id, appointment.service, appointment.client_name, appointment.date
            );
        }
        Commands::DeleteClient { id } => {
            let session = SyncManager::new(Arc::new(store.docs(&owner)), config);
            let report = session.delete_client_cascade(id).await?;
            println!("{report}");
        }
        Commands::Watch => {
            let session = open(&store, &owner, config).await?;
            session.clients().observe(|clients| {
                println!("-- {} clients --", clients.len());
                for client in clients {
                    println!("{}  {}", client.id, client.name);
                }
            });
            tokio::signal::ctrl_c().await?;
            session.stop().await;
        }
    }

    Ok(())
}

async fn open(store: &Store, owner: &OwnerId, config: SyncConfig) -> lacquer::Result<SyncManager> {
    let session = SyncManager::start(Arc::new(store.docs(owner)), config).await?;
    session.ready().await;
    Ok(session)
}

fn print_plan(plan: &SchemaPlan) {
    if !plan.warnings().is_empty() {
        eprintln!("Warnings ({}):", plan.warnings().len());
        for w in plan.warnings() {
            eprintln!("  - {}", w);
        }
    }

    if plan.actions().is_empty() {
        println!("No pending DDL actions.");
        return;
    }

    println!("DDL actions ({}):", plan.actions().len());
    for (i, action) in plan.actions().iter().enumerate() {
        println!("{}. {}", i + 1, action.description());
        println!("{}\n", action.sql());
    }
}
