use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use wrangle::cli::{Args, ConfigDiscovery, ExecutionMode, RunConfig, Step, StepLoader};
use wrangle::session::SaveMode;
use wrangle::{
    ApplyRequest, InMemoryCatalog, InitRequest, MemoryStore, SessionDocument, SessionManager,
    SystemClock, Table,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("wrangle=info")),
        )
        .init();

    let args = Args::parse();
    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    match mode {
        ExecutionMode::Run(config) => run(config).await,
        ExecutionMode::Inspect(path) => inspect(&path),
        ExecutionMode::ShowConfig => {
            ConfigDiscovery::show_discovery_info();
            Ok(())
        }
        ExecutionMode::InitConfig => {
            let path = ConfigDiscovery::create_default_user_config()
                .context("failed to create default configuration")?;
            println!("Configuration file: {}", path.display());
            Ok(())
        }
    }
}

async fn run(config: RunConfig) -> Result<()> {
    let settings = ConfigDiscovery::load(config.config_override.as_deref())
        .context("failed to load configuration")?;
    let table = StepLoader::load_dataset(&config.dataset)?;
    let steps = StepLoader::load_steps(&config.steps)?;

    let dataset_name = config
        .dataset
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("dataset")
        .to_string();

    let clock = Arc::new(SystemClock);
    let catalog = Arc::new(InMemoryCatalog::new());
    let dataset_ref = catalog.insert(dataset_name, table);
    let store = Arc::new(MemoryStore::new(clock.clone()));
    let manager = SessionManager::new(settings.session, store, catalog, clock)
        .with_components(settings.codec, settings.engine);

    let session = manager
        .initialize(InitRequest::new(dataset_ref.as_str(), config.owner.as_str()))
        .await
        .context("failed to open session")?;
    info!("Opened session {} on {}", session.id, session.dataset_ref);

    for (index, step) in steps.into_iter().enumerate() {
        let number = index + 1;
        let label = step_label(&step);
        let result = match step {
            Step::Apply(operation) => manager
                .apply(session.id, ApplyRequest::from(operation))
                .await
                .map(|outcome| {
                    format!(
                        "sequence {}, {} operations",
                        outcome.sequence, outcome.operations_count
                    )
                }),
            Step::Undo => manager
                .undo(session.id)
                .await
                .map(|outcome| format!("cursor at sequence {}", outcome.sequence)),
            Step::Redo => manager
                .redo(session.id)
                .await
                .map(|outcome| format!("cursor at sequence {}", outcome.sequence)),
            Step::Extend(seconds) => manager
                .extend(session.id, seconds)
                .await
                .map(|expires_at| format!("expires at {}", expires_at)),
            Step::Save(name) => manager
                .save(session.id, &name, SaveMode::KeepOpen)
                .await
                .map(|dataset| format!("saved as {}", dataset)),
        };

        match result {
            Ok(summary) => {
                if config.verbose {
                    println!("  {}. {}: {}", number, label, summary);
                }
            }
            Err(e) => {
                error!("Step {} ({}) failed: {}", number, label, e);
                println!("  {}. {}: FAILED ({})", number, label, e);
            }
        }
    }

    let status = manager.status(session.id).await?;
    println!(
        "Session {}: {:?}, {} operations (undo: {}, redo: {})",
        status.session_id, status.state, status.operations_count, status.can_undo, status.can_redo
    );

    let current = manager.current_table(session.id).await?;
    print_table(&current)?;

    if let Some(path) = &config.export {
        let document = manager.export(session.id, config.export_mode).await?;
        fs::write(path, document.to_bytes()?)
            .with_context(|| format!("failed to write export to {:?}", path))?;
        println!("Exported session to {:?}", path);
    }

    manager.stop(session.id).await?;
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let bytes = fs::read(path).with_context(|| format!("failed to read {:?}", path))?;
    let document = SessionDocument::from_bytes(&bytes)?;

    println!("Session:   {}", document.metadata.id);
    println!("Dataset:   {}", document.dataset_ref());
    println!("Owner:     {}", document.metadata.owner_id);
    println!("Mode:      {:?}", document.mode);
    println!(
        "Cursor:    {} of {} operations",
        document.position,
        document.operations.len()
    );
    for (i, record) in document.operations.iter().enumerate() {
        let marker = if i < document.position { "*" } else { " " };
        println!(
            "  {} {}. {} at {}",
            marker,
            record.sequence_number,
            record.operation_type(),
            record.applied_at
        );
    }
    print_table(&document.current_snapshot)
}

fn step_label(step: &Step) -> String {
    match step {
        Step::Apply(operation) => operation.operation_type().to_string(),
        Step::Undo => "undo".to_string(),
        Step::Redo => "redo".to_string(),
        Step::Extend(_) => "extend".to_string(),
        Step::Save(_) => "save".to_string(),
    }
}

fn print_table(table: &Table) -> Result<()> {
    println!(
        "Table: {} columns x {} rows",
        table.column_count(),
        table.row_count()
    );
    println!("{}", serde_json::to_string_pretty(&table.to_records())?);
    Ok(())
}
