use std::io::Read;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use log::{error, info};
use sha2::{Digest, Sha256};

use feedlot_etl::config::EtlConfig;
use feedlot_etl::pipeline::FsSourceProvider;
use feedlot_etl::state::Resolution;
use feedlot_etl::{
    db, init_logging, load_config, Database, EtlError, NewUpload, Pipeline, PipelineConfig,
    PipelineType, Poller, StateController, WorkerPool,
};

/// Feedlot CSV ingestion engine
#[derive(Debug, Parser)]
#[command(name = "feedlot-etl", version, about = "Ingest feedlot operation CSV exports")]
struct Args {
    /// Path to the JSON config file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the worker pool until interrupted
    Run,
    /// Register a CSV export for ingestion
    Submit {
        path: PathBuf,
        #[arg(long)]
        org: String,
        #[arg(long, value_parser = parse_pipeline)]
        pipeline: PipelineType,
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// Show a file's state and runs
    Status { file_id: String },
    /// Approve a file waiting in awaiting_approval
    Approve {
        file_id: String,
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// Reject a file waiting in awaiting_approval
    Reject {
        file_id: String,
        #[arg(long)]
        reason: String,
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// Cancel a file
    Cancel {
        file_id: String,
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// List pending dead-letter entries
    DeadLetters,
    /// Retry or discard a dead-letter entry
    Resolve {
        entry_id: String,
        #[arg(long, conflicts_with = "discard")]
        retry: bool,
        #[arg(long)]
        discard: bool,
        #[arg(long)]
        notes: Option<String>,
        #[arg(long, default_value = "cli")]
        user: String,
    },
}

fn parse_pipeline(value: &str) -> Result<PipelineType, String> {
    value.parse()
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(args) {
        error!("{}", e);
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), EtlError> {
    let config = read_config(args.config.as_deref())?;
    init_logging(&config.logging)?;

    let controller = open_controller(&config)?;

    match args.command {
        Command::Run => run_workers(&config, controller),
        Command::Submit {
            path,
            org,
            pipeline,
            user,
        } => submit(&controller, &config, &path, org, pipeline, user),
        Command::Status { file_id } => status(&controller, &file_id),
        Command::Approve { file_id, user } => {
            let file = controller.get_file(&file_id)?;
            let file = controller.approve(&file_id, &user, file.version)?;
            println!("{} {}", file.id, file.current_state);
            Ok(())
        }
        Command::Reject {
            file_id,
            reason,
            user,
        } => {
            let file = controller.get_file(&file_id)?;
            let file = controller.reject(&file_id, &user, file.version, &reason)?;
            println!("{} {}", file.id, file.current_state);
            Ok(())
        }
        Command::Cancel { file_id, user } => {
            let file = controller.get_file(&file_id)?;
            let file = controller.cancel(&file_id, &user, file.version)?;
            println!("{} {}", file.id, file.current_state);
            Ok(())
        }
        Command::DeadLetters => {
            for entry in controller.pending_dead_letters()? {
                println!(
                    "{}\t{}\t{:?}\t{}",
                    entry.id, entry.file_id, entry.error_kind, entry.error_message
                );
            }
            Ok(())
        }
        Command::Resolve {
            entry_id,
            retry,
            discard,
            notes,
            user,
        } => {
            let resolution = match (retry, discard) {
                (true, false) => Resolution::Retry,
                (false, true) => Resolution::Discard,
                _ => {
                    return Err(EtlError::Config(feedlot_etl::ConfigError::Validation {
                        message: "pass exactly one of --retry or --discard".to_string(),
                    }))
                }
            };
            let file =
                controller.resolve_dead_letter(&entry_id, &user, notes.as_deref(), resolution)?;
            println!("{} {}", file.id, file.current_state);
            Ok(())
        }
    }
}

/// Explicit path, then `<config dir>/feedlot-etl/config.json`, then defaults.
fn read_config(path: Option<&Path>) -> Result<EtlConfig, EtlError> {
    if let Some(path) = path {
        return Ok(load_config(path)?);
    }
    match dirs::config_dir().map(|d| d.join("feedlot-etl").join("config.json")) {
        Some(default) if default.exists() => Ok(load_config(&default)?),
        _ => Ok(EtlConfig::default()),
    }
}

fn open_controller(config: &EtlConfig) -> Result<StateController, EtlError> {
    let path = match &config.database.path {
        Some(path) => path.clone(),
        None => db::default_database_path().ok_or_else(|| {
            EtlError::Config(feedlot_etl::ConfigError::Validation {
                message: "no home directory; set database.path".to_string(),
            })
        })?,
    };
    let database = Database::open(&path)?;
    Ok(StateController::new(
        database,
        config.retry.clone(),
        config.lifecycle.clone(),
    ))
}

fn run_workers(config: &EtlConfig, controller: StateController) -> Result<(), EtlError> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        info!("Received interrupt, finishing running jobs...");
        flag.store(true, Ordering::Relaxed);
    })
    .map_err(|e| feedlot_etl::WorkerError::SpawnFailed(e.to_string()))?;

    let source = Arc::new(FsSourceProvider::new(config.storage.root.clone()));
    let pipeline = Arc::new(Pipeline::new(
        controller.clone(),
        Arc::new(PipelineConfig::from_config(config)),
        source,
    ));

    let pool = WorkerPool::new(pipeline, config.workers.count)?;
    let poller = Poller::new(controller, config.workers.poll_limit);

    let result = poller.run(
        &pool,
        Duration::from_millis(config.workers.poll_interval_ms),
        &shutdown,
    );

    pool.shutdown();
    pool.wait();
    Ok(result?)
}

fn submit(
    controller: &StateController,
    config: &EtlConfig,
    path: &Path,
    organization_id: String,
    pipeline_type: PipelineType,
    uploaded_by: String,
) -> Result<(), EtlError> {
    let (checksum, size_bytes) = checksum_file(path).map_err(|e| {
        EtlError::Pipeline(feedlot_etl::PipelineError::Source {
            location: path.display().to_string(),
            source: e,
        })
    })?;

    let storage_location = match &config.storage.root {
        Some(root) => path
            .strip_prefix(root)
            .unwrap_or(path)
            .display()
            .to_string(),
        None => path.display().to_string(),
    };

    let file = controller.register_upload(NewUpload {
        organization_id,
        storage_location,
        checksum,
        size_bytes,
        mime_type: mime_guess::from_path(path).first().map(|m| m.to_string()),
        pipeline_type,
        uploaded_by,
    })?;

    println!("{}", file.id);
    Ok(())
}

fn checksum_file(path: &Path) -> std::io::Result<(String, i64)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size: i64 = 0;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as i64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

fn status(controller: &StateController, file_id: &str) -> Result<(), EtlError> {
    let file = controller.get_file(file_id)?;
    println!(
        "{}  {}  {}  v{}  {}",
        file.id, file.pipeline_type, file.current_state, file.version, file.storage_location
    );
    if let Some(message) = &file.error_message {
        println!("  error: {}", message);
    }
    for run in controller.runs_for_file(file_id)? {
        println!(
            "  run {}  {}  total={} processed={} failed={} retries={}",
            run.run_number,
            run.current_state,
            run.records_total,
            run.records_processed,
            run.records_failed,
            run.retry_count
        );
    }
    Ok(())
}
