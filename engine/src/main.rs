use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use std::{fs, io::Read};

use anyhow::Context;
use baton_coord::{CoordinationStore, MemoryStore};
use baton_core::{check_health, health_key, RunExecutor, RunReader, ScriptedEngine, WorkerConfig};
use baton_observability::{
    emit_event, init_cli_logging, init_process_logging, logs_dir_for_state, ObservabilityEvent,
    ProcessKind,
};
use baton_persist::{RunDatabase, RunFilter, RunStatusStore};
use baton_types::{ResponseEvent, RunKeys, RunRecord, RunRequest, RunStatus};
use clap::{Parser, Subcommand};
use tracing::info;

const DB_FILE_NAME: &str = "runs.db";

#[derive(Parser, Debug)]
#[command(name = "baton-worker")]
#[command(about = "Execute and inspect coordinated agent runs")]
struct Cli {
    #[arg(long, global = true)]
    state_dir: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute one scripted run on this instance and print its responses.
    Run {
        #[arg(long)]
        run_id: String,
        /// JSONL script: inline, `@path`, or `-` for stdin.
        #[arg(long)]
        script: String,
        #[arg(long)]
        thread_id: Option<String>,
        #[arg(long)]
        instance_id: Option<String>,
        #[arg(long)]
        db: Option<String>,
        #[arg(long)]
        config: Option<String>,
        /// Publish STOP to this instance after the given delay.
        #[arg(long)]
        stop_after_ms: Option<u64>,
    },
    Status {
        #[arg(long)]
        db: Option<String>,
        #[arg(long)]
        run_id: String,
    },
    List {
        #[arg(long)]
        db: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        thread_id: Option<String>,
        #[arg(long)]
        limit: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let state_dir = resolve_state_dir(cli.state_dir);

    match cli.command {
        Command::Run {
            run_id,
            script,
            thread_id,
            instance_id,
            db,
            config,
            stop_after_ms,
        } => {
            let config = WorkerConfig::load(
                config.as_deref().map(Path::new),
                build_cli_overrides(instance_id),
            )
            .await?;
            let (_log_guard, log_info) = init_process_logging(
                ProcessKind::Worker,
                &logs_dir_for_state(&state_dir),
                config.log_retention_days,
            )?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Worker,
                ObservabilityEvent {
                    event: "logging.initialized",
                    component: "worker.main",
                    status: Some("ok"),
                    detail: Some("worker jsonl logging initialized"),
                    ..ObservabilityEvent::default()
                },
            );
            info!("worker logging initialized: {:?}", log_info);

            let engine = ScriptedEngine::from_jsonl(&read_input(&script)?)
                .context("invalid run script")?;
            let db_path = resolve_db_path(db, &state_dir);
            let database = RunDatabase::open(&db_path)
                .await
                .with_context(|| format!("open run database {}", db_path.display()))?;

            let mut request = RunRequest::new(run_id.as_str());
            if let Some(thread_id) = thread_id {
                request = request.with_thread(thread_id);
            }
            ensure_run_record(&database, &request).await?;

            let store = MemoryStore::new();
            let shared: Arc<dyn CoordinationStore> = Arc::new(store.clone());
            if let Err(err) = check_health(
                shared.as_ref(),
                &health_key(&config.instance_id),
                config.liveness_ttl(),
            )
            .await
            {
                tracing::warn!(error = %err, "health probe failed");
            }

            let instance_id = config.instance_id.clone();
            let executor = RunExecutor::new(
                shared.clone(),
                Arc::new(database.clone()),
                Arc::new(engine),
                Arc::new(config),
            );
            let stopper = stop_after_ms.map(|delay| {
                let reader = RunReader::new(shared.clone());
                let run_id = run_id.clone();
                let instance_id = instance_id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    if let Err(err) = reader.request_stop(&run_id, Some(&instance_id)).await {
                        tracing::warn!(error = %err, "failed to request stop");
                    }
                })
            });

            let report = executor.execute(request).await?;
            if let Some(stopper) = stopper {
                stopper.abort();
            }

            let responses = response_log(&store, &run_id).await?;
            let record = database.get_run(&run_id).await?;
            database.close().await?;
            let output = serde_json::json!({
                "report": report,
                "responses": responses,
                "record": record,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Status { db, run_id } => {
            init_cli_logging();
            inspected("status", Some(&run_id));
            let database = open_existing(&resolve_db_path(db, &state_dir)).await?;
            let record = database
                .get_run(&run_id)
                .await?
                .with_context(|| format!("run `{run_id}` not found"))?;
            database.close().await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::List {
            db,
            status,
            thread_id,
            limit,
        } => {
            init_cli_logging();
            inspected("list", None);
            let filter = RunFilter {
                status: parse_status(status)?,
                thread_id,
                limit,
                ..RunFilter::default()
            };
            let database = open_existing(&resolve_db_path(db, &state_dir)).await?;
            let records = database.list_runs(&filter).await?;
            database.close().await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    Ok(())
}

fn inspected(command: &str, run_id: Option<&str>) {
    emit_event(
        tracing::Level::INFO,
        ProcessKind::Cli,
        ObservabilityEvent {
            event: "runs.inspected",
            component: "cli",
            run_id,
            detail: Some(command),
            ..ObservabilityEvent::default()
        },
    );
}

fn build_cli_overrides(instance_id: Option<String>) -> Option<serde_json::Value> {
    let instance_id = instance_id.filter(|id| !id.trim().is_empty())?;
    let mut root = serde_json::Map::new();
    root.insert(
        "instance_id".to_string(),
        serde_json::Value::String(instance_id.trim().to_string()),
    );
    Some(serde_json::Value::Object(root))
}

fn parse_status(raw: Option<String>) -> anyhow::Result<Option<RunStatus>> {
    raw.map(|raw| RunStatus::from_str(&raw).context("invalid --status"))
        .transpose()
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("BATON_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::data_local_dir()
        .map(|dir| dir.join("baton"))
        .unwrap_or_else(|| PathBuf::from(".baton"))
}

fn resolve_db_path(flag: Option<String>, state_dir: &Path) -> PathBuf {
    flag.map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join(DB_FILE_NAME))
}

async fn open_existing(path: &Path) -> anyhow::Result<RunDatabase> {
    if !path.exists() {
        anyhow::bail!("run database {} does not exist", path.display());
    }
    RunDatabase::open(path)
        .await
        .with_context(|| format!("open run database {}", path.display()))
}

// Callers normally insert the run row before enqueueing; the CLI does it here
// so a fresh database works.
async fn ensure_run_record(database: &RunDatabase, request: &RunRequest) -> anyhow::Result<()> {
    if database.get_run(&request.run_id).await?.is_none() {
        let thread_id = (!request.thread_id.is_empty()).then(|| request.thread_id.clone());
        database
            .insert_run(&RunRecord::started(request.run_id.as_str(), thread_id))
            .await
            .context("insert run record")?;
    }
    Ok(())
}

async fn response_log(store: &MemoryStore, run_id: &str) -> anyhow::Result<Vec<ResponseEvent>> {
    let raw = store
        .list_range(&RunKeys::new(run_id).responses(), 0, -1)
        .await?;
    raw.iter()
        .map(|record| ResponseEvent::from_json(record).context("malformed response record"))
        .collect()
}

fn read_input(input: &str) -> anyhow::Result<String> {
    if input.trim() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        return Ok(buf);
    }
    if let Some(path) = input.strip_prefix('@') {
        return fs::read_to_string(path).with_context(|| format!("read script {path}"));
    }
    Ok(input.to_string())
}
