//! eKYC pipeline - identity document and selfie verification
//!
//! Locates the ID card in a photo, checks that its face matches the selfie,
//! reads the card's number and holder name, and registers the user once.

mod config;
mod error;
mod extract;
mod pipeline;
mod storage;
mod vision;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs::OpenOptions;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::{AppConfig, LoggingConfig};
use crate::extract::{extract_information, DocumentType};
use crate::pipeline::{Pipeline, Submission};
use crate::storage::database::is_unique_violation;
use crate::storage::{Database, PersistedUser};
use crate::vision::{ImageSource, ModelManager, OcrOutput, RecognizedText};

/// eKYC pipeline - register users from an ID card photo and a selfie
#[derive(Parser, Debug)]
#[command(name = "ekyc")]
#[command(about = "Verify an identity document against a selfie and register the holder")]
struct Args {
    /// Configuration file (defaults to config.toml in the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a full verification and registration
    Verify {
        /// Document type: pan, aadhaar or dl
        #[arg(long)]
        id_type: DocumentType,
        /// ID card photo, or "-" to read it from stdin
        #[arg(long)]
        document: String,
        /// Selfie photo
        #[arg(long)]
        selfie: PathBuf,
    },
    /// Show the stored user with an ID
    Lookup {
        #[arg(long)]
        id: String,
    },
    /// Register a user by hand, without a face embedding
    Register {
        #[arg(long)]
        id_type: DocumentType,
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
    },
    /// Run only the field extractor over saved OCR text (one fragment per line)
    Extract {
        #[arg(long)]
        id_type: DocumentType,
        #[arg(long)]
        text_file: PathBuf,
    },
    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Download every model the pipeline needs
    FetchModels,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => storage::get_config_dir()?.join("config.toml"),
    };

    if let Command::InitConfig { force } = &args.command {
        return init_config(&config_path, *force);
    }

    let mut config = config::load_or_default(&config_path)?;
    config.resolve_paths(&storage::get_data_dir()?);
    init_logging(&config.logging)?;

    if config_path.exists() {
        info!("Loaded configuration from {:?}", config_path);
    } else {
        info!("Using default configuration");
    }

    match args.command {
        Command::Verify {
            id_type,
            document,
            selfie,
        } => verify(config, id_type, &document, selfie),
        Command::Lookup { id } => lookup(&config, &id),
        Command::Register { id_type, id, name } => register(&config, id_type, &id, &name),
        Command::Extract { id_type, text_file } => extract(id_type, &text_file),
        Command::FetchModels => fetch_models(&config),
        Command::InitConfig { force } => init_config(&config_path, force),
    }
}

/// Append to the log file; warnings are echoed to stderr
fn init_logging(logging: &LoggingConfig) -> Result<()> {
    std::fs::create_dir_all(&logging.directory)
        .with_context(|| format!("Failed to create log directory {:?}", logging.directory))?;
    let log_path = logging.directory.join(&logging.file_name);
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {:?}", log_path))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("Invalid log level")?;

    let file_layer = fmt::layer()
        .with_writer(Mutex::new(log_file))
        .with_ansi(false)
        .with_filter(filter);
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(LevelFilter::WARN);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()?;
    Ok(())
}

fn open_database(config: &AppConfig) -> Result<Database> {
    let db = Database::open(
        &config.database.path,
        Duration::from_millis(config.database.busy_timeout_ms),
    )?;
    Ok(db)
}

fn verify(config: AppConfig, id_type: DocumentType, document: &str, selfie: PathBuf) -> Result<()> {
    let document = if document == "-" {
        let mut bytes = Vec::new();
        std::io::stdin()
            .read_to_end(&mut bytes)
            .context("Failed to read the ID card image from stdin")?;
        ImageSource::from_bytes("stdin", bytes)
    } else {
        ImageSource::from_path(document)
    };

    let db = open_database(&config)?;
    let backends = vision::load_onnx_backends(&config)?;
    let mut pipeline = Pipeline::new(config, &db, backends.recognizer, backends.faces);

    let outcome = pipeline.run(&Submission::new(id_type, document, ImageSource::from_path(selfie)))?;
    println!("{}", outcome.message());
    Ok(())
}

fn lookup(config: &AppConfig, id: &str) -> Result<()> {
    let db = open_database(config)?;
    if !db.check_duplicacy(id)? {
        println!("No user registered with ID {}", id);
        return Ok(());
    }

    for user in db.fetch_records(id)? {
        let shown = serde_json::json!({
            "ID": user.id,
            "Name": user.name,
            "ID Type": user.id_type,
            "Registered": user.created_at,
            "Has Embedding": user.embedding.is_some(),
        });
        println!("{}", serde_json::to_string_pretty(&shown)?);
    }
    Ok(())
}

fn register(config: &AppConfig, id_type: DocumentType, id: &str, name: &str) -> Result<()> {
    let db = open_database(config)?;
    let user = PersistedUser::new(id.trim(), name.trim(), id_type.label());
    if user.id.is_empty() {
        anyhow::bail!("An ID is required");
    }

    match db.insert_record(&user) {
        Ok(()) => println!("Registered {} ({})", user.id, user.name),
        Err(err) if is_unique_violation(&err) => {
            println!("User already present with ID {}", user.id)
        }
        Err(err) => return Err(err.into()),
    }
    Ok(())
}

fn extract(id_type: DocumentType, text_file: &Path) -> Result<()> {
    let text = std::fs::read_to_string(text_file)
        .with_context(|| format!("Failed to read {:?}", text_file))?;
    let fragments = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| RecognizedText::new(line, 1.0))
        .collect();

    let record = extract_information(id_type, &OcrOutput::new(fragments));
    if !record.is_complete() {
        warn!("Extraction incomplete: {:?}", record);
    }
    println!("{}", serde_json::to_string_pretty(&record.to_display_json())?);
    Ok(())
}

fn fetch_models(config: &AppConfig) -> Result<()> {
    let manager = ModelManager::from_settings(&config.models)?;
    manager.ensure_all_models()?;

    for (model_type, available, size) in manager.get_model_status() {
        println!(
            "{:<22} {:<9} {}",
            model_type.display_name(),
            if available { "ready" } else { "missing" },
            size.map(|s| format!("{} bytes", s)).unwrap_or_default()
        );
    }
    Ok(())
}

fn init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{:?} already exists; pass --force to overwrite it", path);
    }
    config::save_config(&AppConfig::default(), path)?;
    println!("Wrote default configuration to {:?}", path);
    Ok(())
}
