use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;
use videovault_core::cover::{check_file_exists, cover_info};
use videovault_core::db::SqliteStore;
use videovault_core::{EngineConfig, Result, ScanOrchestrator};

mod web;

#[derive(Parser, Debug)]
#[command(name = "videovault", version, about = "Video library scanner and metadata engine")]
struct Cli {
    /// Engine configuration (TOML). Missing file means defaults.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Registry and scan cache database.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage registered root folders
    Roots {
        #[command(subcommand)]
        action: RootsAction,
    },
    /// Print the folder tree of a root, from cache when valid
    Scan { root_id: String },
    /// Walk a root again, ignoring its cache
    Rescan { root_id: String },
    /// Probe the videos of one directory inside a root
    Enrich { root_id: String, directory: PathBuf },
    /// Find the cover image for a video file
    Cover { video: PathBuf },
    /// Show format, size and dimensions of an image
    CoverInfo { image: PathBuf },
    /// Print the volume key of a root's path
    VolumeKey { root_id: String },
    /// Report whether a path exists
    Exists { path: PathBuf },
    /// Engine counters for this process
    Stats,
    /// Serve the commands over HTTP/JSON for a UI shell
    Serve {
        #[arg(long, default_value_t = 7878)]
        port: u16,
    },
}

#[derive(Subcommand, Debug)]
enum RootsAction {
    List,
    Add {
        path: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    Remove { id: String },
    Enable { id: String },
    Disable { id: String },
    /// Limit how many levels below the root are listed (0 = unlimited)
    Depth { id: String, max_depth: u32 },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = real_main() {
        eprintln!("error: {err}");
        std::process::exit(2);
    }
}

fn real_main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(|| data_dir().join("config.toml"));
    let db_path = cli.db.unwrap_or_else(|| data_dir().join("videovault.db"));
    debug!(config = %config_path.display(), db = %db_path.display(), "starting");

    let config = EngineConfig::load(&config_path)?;
    let store = Arc::new(SqliteStore::open(&db_path)?);
    let engine = ScanOrchestrator::new(store, config)?;

    match cli.command {
        Command::Roots { action } => match action {
            RootsAction::List => print_json(&engine.list_roots()?),
            RootsAction::Add { path, name } => {
                let id = engine.add_root(&path, name.as_deref())?;
                print_json(&engine.get_root(&id)?)
            }
            RootsAction::Remove { id } => {
                engine.remove_root(&id)?;
                println!("removed {id}");
                Ok(())
            }
            RootsAction::Enable { id } => print_json(&engine.set_enabled(&id, true)?),
            RootsAction::Disable { id } => print_json(&engine.set_enabled(&id, false)?),
            RootsAction::Depth { id, max_depth } => {
                print_json(&engine.set_max_depth(&id, max_depth)?)
            }
        },
        Command::Scan { root_id } => print_json(&engine.scan(&root_id)?),
        Command::Rescan { root_id } => print_json(&engine.rescan(&root_id)?),
        Command::Enrich { root_id, directory } => {
            print_json(&engine.enrich(&root_id, &directory)?)
        }
        Command::Cover { video } => print_json(&engine.find_cover_for_video(&video)),
        Command::CoverInfo { image } => print_json(&cover_info(&image)?),
        Command::VolumeKey { root_id } => {
            println!("{}", engine.volume_key_for(&root_id)?);
            Ok(())
        }
        Command::Exists { path } => print_json(&check_file_exists(&path)),
        Command::Stats => print_json(&engine.stats()),
        Command::Serve { port } => web::run_web_server(Arc::new(engine), port),
    }
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("videovault")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
