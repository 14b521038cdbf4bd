use async_trait::async_trait;
use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand};
use serde_json::{Map, Value};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tekstil_sync::engine::{ConflictChoice, Outcome};
use tekstil_sync::model::{Kind, Record, RecordId, Snapshot, SnapshotSummary};
use tekstil_sync::store::{LocalStore, STORE_DIR};
use tekstil_sync::sync::{Phase, PullReport, PushReport, SyncObserver, Syncer, describe_status};
use tekstil_sync::{GitHubRemote, RemoteConfig, Scheduler};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tsync", about = "Tekstil sync: local-first wage records synced to GitHub")]
struct Cli {
    /// Local store directory
    #[arg(long, global = true, env = "TSYNC_DIR", default_value = STORE_DIR)]
    dir: PathBuf,
    /// GitHub token (overrides the saved one; `setup` saves it)
    #[arg(long, global = true, env = "TSYNC_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// Answer conflicts without prompting: remote, local, merge or defer
    #[arg(long, global = true)]
    prefer: Option<ConflictChoice>,
    /// More log output on stderr (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Create the local store
    Init,
    /// Configure the GitHub repository holding the shared document
    Setup {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        repo: Option<String>,
        #[arg(long)]
        branch: Option<String>,
        #[arg(long)]
        path: Option<String>,
        #[arg(long)]
        api_base: Option<String>,
    },
    /// Add a record from a JSON object; the id is assigned when omitted
    Add { kind: Kind, json: String },
    /// Overwrite fields of a record with those of a JSON object
    Edit { kind: Kind, id: RecordId, json: String },
    /// Remove a record
    Rm { kind: Kind, id: RecordId },
    /// List records of a kind
    List { kind: Kind },
    /// Show configuration and sync state
    Status,
    /// Fetch the remote document and reconcile
    Pull,
    /// Write local state to the remote document
    Push,
    /// Pull, then push if there are unsynced changes
    Sync,
    /// Keep syncing in the background until interrupted
    Watch,
    /// List retained backups
    Backups,
    /// Restore local data from the last failed push
    RestoreFailure,
    /// Write all records to a file
    Export { file: PathBuf },
    /// Load records from an exported file
    Import { file: PathBuf },
    /// Turn periodic syncing on or off
    AutoSync {
        #[arg(value_parser = parse_switch, action = clap::ArgAction::Set)]
        enabled: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tekstil_sync={level},tsync={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<(), String> {
    let dir = cli.dir.as_path();
    match cli.command {
        Cmd::Init => {
            let store = LocalStore::init(dir).map_err(|e| e.to_string())?;
            let meta = store.read_metadata().map_err(|e| e.to_string())?;
            println!("initialized {} ({})", dir.display(), meta.device_id);
            Ok(())
        }
        Cmd::Setup {
            owner,
            repo,
            branch,
            path,
            api_base,
        } => {
            let store = open(dir)?;
            let mut config = store.read_config().map_err(|e| e.to_string())?;
            config.remote = RemoteConfig {
                owner,
                repo: repo.unwrap_or(config.remote.repo),
                branch: branch.unwrap_or(config.remote.branch),
                path: path.unwrap_or(config.remote.path),
                token: cli.token.or(config.remote.token),
                api_base: api_base.unwrap_or(config.remote.api_base),
                configured_at: Some(Utc::now()),
            };
            if !config.remote.configured() {
                return Err("owner and token are required (pass --token or set TSYNC_TOKEN)".into());
            }
            store.write_config(&config).map_err(|e| e.to_string())?;
            println!(
                "configured {}/{}@{}:{}",
                config.remote.owner, config.remote.repo, config.remote.branch, config.remote.path
            );
            Ok(())
        }
        Cmd::Add { kind, json } => {
            let store = open(dir)?;
            let record = Record::from_value(parse_json(&json)?)?;
            let id = store.insert_record(kind, record).map_err(|e| e.to_string())?;
            println!("added {kind} {id}");
            Ok(())
        }
        Cmd::Edit { kind, id, json } => {
            let store = open(dir)?;
            let Value::Object(patch) = parse_json(&json)? else {
                return Err("expected a JSON object".into());
            };
            store
                .update_record(kind, &id, patch)
                .map_err(|e| e.to_string())?;
            println!("updated {kind} {id}");
            Ok(())
        }
        Cmd::Rm { kind, id } => {
            let store = open(dir)?;
            store.remove_record(kind, &id).map_err(|e| e.to_string())?;
            println!("removed {kind} {id}");
            Ok(())
        }
        Cmd::List { kind } => {
            let store = open(dir)?;
            let collection = store.load_collection(kind);
            if collection.is_empty() {
                println!("no {kind} records");
                return Ok(());
            }
            println!("{:<8} {}", "ID", "FIELDS");
            println!("{}", "-".repeat(60));
            for record in collection.iter() {
                let id = record.id().map(|id| id.to_string()).unwrap_or_else(|| "?".into());
                let fields = record
                    .fields()
                    .map(format_fields)
                    .unwrap_or_else(|| record.as_value().to_string());
                println!("{:<8} {}", id, fields);
            }
            Ok(())
        }
        Cmd::Status => {
            let store = open(dir)?;
            let config = store.read_config().map_err(|e| e.to_string())?;
            let meta = store.read_metadata().map_err(|e| e.to_string())?;
            let configured = config.remote.configured()
                || (cli.token.is_some() && !config.remote.owner.is_empty());
            let (phase, message) = describe_status(&meta, configured, true, Utc::now());
            println!("  Status: {message} [{phase}]");
            println!("  Device: {}", meta.device_id);
            if configured {
                println!(
                    "  Remote: {}/{}@{}:{}",
                    config.remote.owner, config.remote.repo, config.remote.branch, config.remote.path
                );
            }
            println!("  Unsynced changes: {}", if meta.dirty { "yes" } else { "no" });
            if let Some(at) = meta.last_sync_at {
                println!("  Last sync: {}", at.format("%Y-%m-%d %H:%M"));
            }
            println!("  Auto-sync: {}", if config.sync.auto_sync { "on" } else { "off" });
            println!("  Local: {}", store.snapshot().map_err(|e| e.to_string())?.summary());
            if store.failure_backup().map_err(|e| e.to_string())?.is_some() {
                println!("  Failure backup present (tsync restore-failure)");
            }
            Ok(())
        }
        Cmd::Pull => {
            let syncer = connect(dir, cli.token, cli.prefer)?;
            let report = block_on(syncer.open())?.map_err(|e| e.to_string())?;
            println!("{}", describe_pull(&report));
            Ok(())
        }
        Cmd::Push => {
            let syncer = connect(dir, cli.token, cli.prefer)?;
            let report = block_on(syncer.save())?.map_err(|e| e.to_string())?;
            println!("{}", describe_push(&report));
            Ok(())
        }
        Cmd::Sync => {
            let syncer = connect(dir, cli.token, cli.prefer)?;
            let report = block_on(syncer.tick())?.map_err(|e| e.to_string())?;
            println!("{}", describe_pull(&report));
            Ok(())
        }
        Cmd::Watch => {
            let syncer = Arc::new(connect(dir, cli.token, cli.prefer)?);
            if !syncer.policy().auto_sync {
                return Err("auto-sync is off (enable with `tsync auto-sync on`)".into());
            }
            block_on(watch(syncer))?
        }
        Cmd::Backups => {
            let store = open(dir)?;
            let backups = store.backups();
            if backups.is_empty() {
                println!("no backups");
            }
            for backup in backups.iter().rev() {
                println!(
                    "{}  {}",
                    backup.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    backup.data.summary()
                );
            }
            if let Some(failure) = store.failure_backup().map_err(|e| e.to_string())? {
                println!(
                    "failed push {}  {}",
                    failure.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    failure.data.summary()
                );
            }
            Ok(())
        }
        Cmd::RestoreFailure => {
            let store = open(dir)?;
            let failure = store
                .failure_backup()
                .map_err(|e| e.to_string())?
                .ok_or("no failure backup")?;
            for kind in Kind::ALL {
                store
                    .save_collection(kind, failure.data.collection(kind))
                    .map_err(|e| e.to_string())?;
            }
            store.clear_failure_backup().map_err(|e| e.to_string())?;
            println!("restored {}", failure.data.summary());
            Ok(())
        }
        Cmd::Export { file } => {
            let store = open(dir)?;
            let snapshot = store.export_to(&file).map_err(|e| e.to_string())?;
            println!("exported {} to {}", snapshot.summary(), file.display());
            Ok(())
        }
        Cmd::Import { file } => {
            let store = open(dir)?;
            store.import_from(&file).map_err(|e| e.to_string())?;
            let snapshot = store.snapshot().map_err(|e| e.to_string())?;
            println!("imported, now {}", snapshot.summary());
            Ok(())
        }
        Cmd::AutoSync { enabled } => {
            let store = open(dir)?;
            let mut config = store.read_config().map_err(|e| e.to_string())?;
            config.sync.auto_sync = enabled;
            store.write_config(&config).map_err(|e| e.to_string())?;
            println!("auto-sync {}", if enabled { "on" } else { "off" });
            Ok(())
        }
    }
}

fn open(dir: &Path) -> Result<LocalStore, String> {
    LocalStore::open(dir).map_err(|e| e.to_string())
}

fn connect(
    dir: &Path,
    token: Option<String>,
    prefer: Option<ConflictChoice>,
) -> Result<Syncer, String> {
    let store = open(dir)?;
    let mut config = store.read_config().map_err(|e| e.to_string())?;
    if token.is_some() {
        config.remote.token = token;
    }
    let meta = store.read_metadata().map_err(|e| e.to_string())?;
    let remote = GitHubRemote::new(config.remote, meta.device_id, config.sync.request_timeout())
        .map_err(|e| e.to_string())?;
    Ok(Syncer::new(
        store,
        Arc::new(remote),
        Arc::new(CliObserver { prefer }),
        config.sync,
    ))
}

fn block_on<F: std::future::Future>(future: F) -> Result<F::Output, String> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| e.to_string())?;
    Ok(runtime.block_on(future))
}

/// Sync in the background, pushing shortly after edits made by other
/// `tsync` invocations, until Ctrl-C.
async fn watch(syncer: Arc<Syncer>) -> Result<(), String> {
    if let Err(e) = syncer.on_start().await {
        tracing::warn!(error = %e, "initial pull failed");
    }
    let scheduler = Scheduler::start(syncer.clone());
    println!("watching {} (Ctrl-C to stop)", syncer.store().dir().display());

    let mut poll = tokio::time::interval(Duration::from_secs(1));
    let mut seen = syncer.store().read_metadata().ok().and_then(|m| m.last_modified);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = poll.tick() => {
                let modified = syncer.store().read_metadata().ok().and_then(|m| m.last_modified);
                if modified != seen {
                    seen = modified;
                    scheduler.notify_change();
                }
            }
        }
    }
    scheduler.stop().await;
    println!("stopped");
    Ok(())
}

struct CliObserver {
    prefer: Option<ConflictChoice>,
}

#[async_trait]
impl SyncObserver for CliObserver {
    fn on_status(&self, phase: Phase, message: &str) {
        match phase {
            Phase::Error => tracing::warn!("{message}"),
            _ => tracing::info!("{message}"),
        }
    }

    fn on_merge_result(&self, outcome: Outcome, snapshot: &Snapshot) {
        tracing::info!(%outcome, "{}", snapshot.summary());
    }

    async fn on_conflict(&self, remote: &SnapshotSummary, local: &SnapshotSummary) -> ConflictChoice {
        if let Some(choice) = self.prefer {
            return choice;
        }
        println!("Remote and local data have both changed.");
        println!("  remote: {remote}");
        println!("  local:  {local}");
        let answer = tokio::task::spawn_blocking(prompt_choice).await;
        answer.unwrap_or(ConflictChoice::Defer)
    }
}

/// Ask on stdin until a valid choice is given. End of input defers.
fn prompt_choice() -> ConflictChoice {
    let stdin = std::io::stdin();
    loop {
        print!("Keep [r]emote, [l]ocal, [m]erge or [d]efer? ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => return ConflictChoice::Defer,
            Ok(_) => match line.parse() {
                Ok(choice) => return choice,
                Err(e) => println!("{e}"),
            },
        }
    }
}

fn parse_switch(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(format!("expected on or off, got {s}")),
    }
}

fn parse_json(json: &str) -> Result<Value, String> {
    serde_json::from_str(json).map_err(|e| format!("invalid JSON: {e}"))
}

/// `key=value` pairs without the id and timestamps.
fn format_fields(fields: &Map<String, Value>) -> String {
    fields
        .iter()
        .filter(|(k, _)| !matches!(k.as_str(), "id" | "created_at" | "updated_at"))
        .map(|(k, v)| match v {
            Value::String(s) => format!("{k}={s}"),
            other => format!("{k}={other}"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn describe_pull(report: &PullReport) -> String {
    match report {
        PullReport::Skipped => "skipped: a sync is already running".to_string(),
        PullReport::Superseded => "local data changed during sync; will retry".to_string(),
        PullReport::Applied {
            outcome,
            choice,
            pushed,
        } => {
            let mut line = outcome.to_string();
            if let Some(choice) = choice {
                line.push_str(&format!(", kept {choice}"));
            }
            if let Some(push) = pushed {
                line.push_str(&format!("; {}", describe_push(push)));
            }
            line
        }
    }
}

fn describe_push(report: &PushReport) -> String {
    match report {
        PushReport::Skipped => "skipped: a sync is already running".to_string(),
        PushReport::Clean => "nothing to push".to_string(),
        PushReport::Pushed {
            attempts,
            merged,
            dropped,
            ..
        } => {
            let mut line = format!("pushed after {attempts} attempt(s)");
            if *merged {
                line.push_str(", merged remote changes");
            }
            if *dropped > 0 {
                line.push_str(&format!(", {dropped} invalid record(s) left out"));
            }
            line
        }
    }
}
