use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use vehicle_studio_pipeline::{
    config::AppConfig,
    models::batch::BatchProgress,
    models::item::{ItemUpdate, WorkItem},
    services::{
        gemini::GeminiClient, scheduler::BatchScheduler, store::ProjectStore, validation,
    },
};

struct Args {
    input_dir: PathBuf,
    project_dir: PathBuf,
    reference: Option<PathBuf>,
}

fn usage() {
    println!("Replace the background of every photo in a directory.");
    println!();
    println!("Usage:");
    println!("  studio-batch <input_dir> <project_dir> [reference_image]");
    println!();
    println!("Progress is saved to <project_dir> after every change; rerunning the");
    println!("command resumes unfinished photos and skips ones already processed.");
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        usage();
        std::process::exit(0);
    }
    match args.as_slice() {
        [input, project] => Ok(Args {
            input_dir: PathBuf::from(input),
            project_dir: PathBuf::from(project),
            reference: None,
        }),
        [input, project, reference] => Ok(Args {
            input_dir: PathBuf::from(input),
            project_dir: PathBuf::from(project),
            reference: Some(PathBuf::from(reference)),
        }),
        _ => Err(format!("Expected 2 or 3 arguments, got {}", args.len())),
    }
}

/// Stable id for an input file so reruns recognise photos already stored.
fn item_id_for(path: &Path) -> Uuid {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes())
}

async fn scan_inputs(
    input_dir: &Path,
    store: &ProjectStore,
) -> Result<Vec<WorkItem>, Box<dyn std::error::Error>> {
    let mut paths = Vec::new();
    let mut entries = tokio::fs::read_dir(input_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            paths.push(entry.path());
        }
    }
    paths.sort();

    let mut added = Vec::new();
    for path in paths {
        let id = item_id_for(&path);
        if store.contains(id).await {
            continue;
        }
        let bytes = tokio::fs::read(&path).await?;
        match validation::validate_source(bytes) {
            Ok(asset) => {
                let item = WorkItem::with_id(id, asset);
                store.save(&item).await?;
                tracing::info!(item_id = %id, file = %path.display(), "Added photo to project");
                added.push(item);
            }
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "Skipping file");
            }
        }
    }
    Ok(added)
}

async fn persist(store: &ProjectStore, update: &ItemUpdate) {
    if let Err(e) = store.save(&update.snapshot).await {
        tracing::error!(item_id = %update.item_id, error = %e, "Failed to save item");
    }
}

async fn run(args: Args) -> Result<BatchProgress, Box<dyn std::error::Error>> {
    let config = AppConfig::from_env()?;
    let store = ProjectStore::open(&args.project_dir).await?;
    let project = store.load().await?;
    tracing::info!(
        project = %store.root().display(),
        stored_items = project.items.len(),
        "Loaded project"
    );

    let reference = match &args.reference {
        Some(path) => {
            let asset = validation::validate_reference(tokio::fs::read(path).await?)?;
            store.save_reference(&asset).await?;
            Some(asset)
        }
        None => project.reference,
    };

    let added = scan_inputs(&args.input_dir, &store).await?;
    let mut items = project.items;
    items.extend(added);

    let gemini = GeminiClient::new(
        config.gemini_api_key.clone(),
        config.gemini_model.clone(),
        config.gemini_text_model.clone(),
        Some(config.gemini_api_base.clone()),
    );
    let scheduler = BatchScheduler::new(Arc::new(gemini), config.scheduler_config());
    let (handle, mut events) = scheduler.run(items, reference)?;

    let before = handle.progress();
    tracing::info!(
        batch_id = %handle.id(),
        total = before.total,
        queued = before.queued,
        already_completed = before.completed,
        already_failed = before.failed,
        "Batch running"
    );

    let wait = handle.wait();
    tokio::pin!(wait);
    let outcome = loop {
        tokio::select! {
            biased;
            Some(update) = events.recv() => persist(&store, &update).await,
            _ = tokio::signal::ctrl_c(), if !handle.is_cancelled() => {
                tracing::warn!("Interrupted, stopping batch; unfinished photos resume on the next run");
                handle.cancel();
            }
            outcome = &mut wait => break outcome,
        }
    };
    while let Ok(update) = events.try_recv() {
        persist(&store, &update).await;
    }

    Ok(outcome?)
}

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            usage();
            std::process::exit(2);
        }
    };

    match run(args).await {
        Ok(progress) => tracing::info!(
            total = progress.total,
            completed = progress.completed,
            failed = progress.failed,
            pending = progress.pending,
            "Batch finished"
        ),
        Err(e) => {
            tracing::error!(error = %e, "Batch run failed");
            std::process::exit(1);
        }
    }
}
