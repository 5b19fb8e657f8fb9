use std::path::PathBuf;

use clap::{Parser, Subcommand};
use server::config::Config;
use server::document_file::FileDocumentStore;
use server::gateway::DocumentStatus;
use server::server::{run, StartupError};
use system::DocumentId;

#[derive(Parser)]
#[command(name = "pixel-server", about = "Collaborative pixel canvas server")]
struct Cli {
    /// Path to the TOML config. Falls back to `PIXEL_SERVER_CONFIG`.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server (default).
    Serve,
    /// Create a blank document.
    Create {
        owner: String,
        width: u32,
        height: u32,
    },
    /// List stored documents.
    List,
    /// Grant a user edit access.
    Grant { document_id: DocumentId, username: String },
    /// Revoke a user's edit access.
    Revoke { document_id: DocumentId, username: String },
    /// Freeze a document; live editors are disconnected.
    Publish { document_id: DocumentId },
    /// Mark a document deleted; live editors are disconnected.
    Delete { document_id: DocumentId },
}

fn load_config(path: Option<PathBuf>) -> Result<Config, StartupError> {
    let path = path.or_else(|| std::env::var_os("PIXEL_SERVER_CONFIG").map(PathBuf::from));
    match path {
        Some(path) => {
            log::info!("Loading config from {}", path.display());
            Ok(Config::load(path)?)
        }
        None => Ok(Config::default()),
    }
}

async fn execute(config: Config, command: Command) -> Result<(), StartupError> {
    if let Command::Serve = command {
        return run(config).await;
    }
    let store = FileDocumentStore::open(&config.storage.data_dir).await?;
    match command {
        Command::Serve => {}
        Command::Create {
            owner,
            width,
            height,
        } => println!("{}", store.create_document(&owner, width, height).await?),
        Command::List => {
            for document_id in store.list_documents().await? {
                let record = store.record(document_id).await?;
                println!(
                    "{}\t{}x{}\t{:?}\t{}",
                    document_id, record.raster.width, record.raster.height, record.status, record.owner
                );
            }
        }
        Command::Grant {
            document_id,
            username,
        } => store.add_collaborator(document_id, &username).await?,
        Command::Revoke {
            document_id,
            username,
        } => store.revoke_collaborator(document_id, &username).await?,
        Command::Publish { document_id } => {
            store.set_status(document_id, DocumentStatus::Published).await?
        }
        Command::Delete { document_id } => {
            store.set_status(document_id, DocumentStatus::Deleted).await?
        }
    }
    Ok(())
}

#[actix_web::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Serve);
    let result = match load_config(cli.config) {
        Ok(config) => execute(config, command).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
