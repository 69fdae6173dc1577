use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use blockxfer_core::config::{Settings, load_settings, parse_settings, save_settings, to_toml};
use blockxfer_core::run_log::{RunKind, start_run_log};
use blockxfer_core::{
    APP_NAME, AccessConditions, DirObjectStore, DownloadOptions, DownloadRange, ObjectAttributes,
    ObjectStore, ProgressSink, UploadOptions, download_to_file, resolve_download_size,
    upload_file,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "blockxfer")]
#[command(about = "Chunked parallel object upload/download", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    #[arg(long)]
    events: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Root of the directory object store; overrides `store.root`.
    #[arg(long)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    Upload {
        #[arg(long)]
        object: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        block_size: Option<u64>,
        #[arg(long)]
        parallelism: Option<usize>,
        #[arg(long)]
        content_type: Option<String>,
    },
    Download {
        #[arg(long)]
        object: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        count: Option<u64>,
        #[arg(long)]
        block_size: Option<u64>,
        #[arg(long)]
        parallelism: Option<usize>,
    },
    Stat {
        #[arg(long)]
        object: String,
    },
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
    Set,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

struct NdjsonProgressSink {
    task_id: String,
    kind: RunKind,
    bytes_total: Option<u64>,
}

impl ProgressSink for NdjsonProgressSink {
    fn on_progress(&self, bytes_transferred: u64) {
        let line = serde_json::json!({
            "type": "task.progress",
            "taskId": self.task_id,
            "kind": self.kind.as_str(),
            "bytesTransferred": bytes_transferred,
            "bytesTotal": self.bytes_total,
        });
        println!("{line}");
    }
}

/// Shared state of one upload/download command.
struct Task {
    id: String,
    kind: RunKind,
    events: bool,
    cancel: CancellationToken,
}

impl Task {
    fn new(kind: RunKind, events: bool) -> Self {
        let cancel = CancellationToken::new();
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!(event = "task.cancel_requested", "task.cancel_requested");
                on_signal.cancel();
            }
        });
        Self {
            id: format!("xfr_{}", uuid::Uuid::new_v4()),
            kind,
            events,
            cancel,
        }
    }

    fn emit_state(&self, state: &str, extra: serde_json::Value) {
        if !self.events {
            return;
        }
        let mut line = serde_json::json!({
            "type": "task.state",
            "taskId": self.id,
            "kind": self.kind.as_str(),
            "state": state,
        });
        if let (Some(line), Some(extra)) = (line.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                line.insert(k.clone(), v.clone());
            }
        }
        println!("{line}");
    }

    fn progress_sink(&self, bytes_total: Option<u64>) -> NdjsonProgressSink {
        NdjsonProgressSink {
            task_id: self.id.clone(),
            kind: self.kind,
            bytes_total,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = cli
        .config_dir
        .or_else(|| {
            std::env::var("BLOCKXFER_CONFIG_DIR")
                .ok()
                .map(PathBuf::from)
        })
        .unwrap_or_else(default_config_dir);
    let data_dir = cli
        .data_dir
        .or_else(|| std::env::var("BLOCKXFER_DATA_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(default_data_dir);

    match cli.cmd {
        Command::Upload {
            object,
            file,
            block_size,
            parallelism,
            content_type,
        } => {
            let settings = load_settings(&config_dir).map_err(map_core_err)?;
            let store = open_store(cli.store, &settings)?;
            upload_run(
                &store,
                &settings,
                &data_dir,
                UploadArgs {
                    object,
                    file,
                    block_size,
                    parallelism,
                    content_type,
                },
                cli.json,
                cli.events,
            )
            .await
        }
        Command::Download {
            object,
            file,
            offset,
            count,
            block_size,
            parallelism,
        } => {
            let settings = load_settings(&config_dir).map_err(map_core_err)?;
            let store = open_store(cli.store, &settings)?;
            download_run(
                &store,
                &settings,
                &data_dir,
                DownloadArgs {
                    object,
                    file,
                    range: DownloadRange::new(offset, count),
                    block_size,
                    parallelism,
                },
                cli.json,
                cli.events,
            )
            .await
        }
        Command::Stat { object } => {
            let settings = load_settings(&config_dir).map_err(map_core_err)?;
            let store = open_store(cli.store, &settings)?;
            stat(&store, &object, cli.json).await
        }
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&config_dir, cli.json),
            SettingsCmd::Set => settings_set(&config_dir, cli.json),
        },
    }
}

struct UploadArgs {
    object: String,
    file: PathBuf,
    block_size: Option<u64>,
    parallelism: Option<usize>,
    content_type: Option<String>,
}

struct DownloadArgs {
    object: String,
    file: PathBuf,
    range: DownloadRange,
    block_size: Option<u64>,
    parallelism: Option<usize>,
}

async fn upload_run(
    store: &DirObjectStore,
    settings: &Settings,
    data_dir: &Path,
    args: UploadArgs,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    let source = std::fs::File::open(&args.file)
        .map_err(|e| CliError::new("file.read_failed", e.to_string()))?;
    let size = source
        .metadata()
        .map_err(|e| CliError::new("file.read_failed", e.to_string()))?
        .len();

    let task = Task::new(RunKind::Upload, events);
    let mut run_log = start_run_log(RunKind::Upload, &task.id, data_dir)
        .map_err(|e| CliError::new("log.unavailable", e.to_string()))?;
    tracing::info!(
        event = "task.start",
        object = %args.object,
        file = %args.file.display(),
        size,
        "task.start"
    );
    task.emit_state("running", serde_json::json!({ "object": args.object }));

    let sink = task.progress_sink(Some(size));
    let options = UploadOptions {
        block_size: args.block_size.unwrap_or(settings.transfer.block_size),
        parallelism: args
            .parallelism
            .unwrap_or(settings.transfer.parallelism as usize),
        single_shot_max_bytes: settings.transfer.single_shot_max_bytes,
        attributes: ObjectAttributes {
            content_type: args.content_type,
            metadata: BTreeMap::new(),
        },
        access: AccessConditions::default(),
        progress: if events { Some(&sink) } else { None },
        cancel: Some(&task.cancel),
    };

    let res = match upload_file(store, &args.object, &source, options).await {
        Ok(res) => res,
        Err(e) => {
            tracing::error!(event = "task.failed", error = %e, "task.failed");
            task.emit_state("failed", serde_json::json!({}));
            return Err(map_core_err(e));
        }
    };
    run_log.succeeded();

    if events {
        task.emit_state(
            "succeeded",
            serde_json::json!({ "bytesUploaded": res.bytes_uploaded }),
        );
        return Ok(());
    }

    if json {
        println!(
            "{}",
            serde_json::to_string(&res)
                .map_err(|e| CliError::new("output.encode_failed", e.to_string()))?
        );
    } else {
        println!("object={}", args.object);
        println!(
            "bytesUploaded={} blocksStaged={}",
            res.bytes_uploaded, res.blocks_staged
        );
        if let Some(response) = &res.response {
            println!("etag={}", response.etag);
        }
    }
    Ok(())
}

async fn download_run(
    store: &DirObjectStore,
    settings: &Settings,
    data_dir: &Path,
    args: DownloadArgs,
    json: bool,
    events: bool,
) -> Result<(), CliError> {
    let target = open_download_target(store, &args).await?;

    let task = Task::new(RunKind::Download, events);
    let mut run_log = start_run_log(RunKind::Download, &task.id, data_dir)
        .map_err(|e| CliError::new("log.unavailable", e.to_string()))?;
    tracing::info!(
        event = "task.start",
        object = %args.object,
        file = %args.file.display(),
        offset = args.range.offset,
        size = target.size,
        "task.start"
    );
    task.emit_state("running", serde_json::json!({ "object": args.object }));

    let sink = task.progress_sink(Some(target.size));
    let options = DownloadOptions {
        block_size: args.block_size.unwrap_or(settings.transfer.block_size),
        parallelism: args
            .parallelism
            .unwrap_or(settings.transfer.parallelism as usize),
        // The size was resolved up front; this saves a second lookup.
        known_length: Some(target.end),
        access: AccessConditions::default(),
        progress: if events { Some(&sink) } else { None },
        cancel: Some(&task.cancel),
    };

    let range = DownloadRange::new(args.range.offset, None);
    let res = match download_to_file(store, &args.object, range, &target.file, options).await {
        Ok(res) => res,
        Err(e) => {
            tracing::error!(event = "task.failed", error = %e, "task.failed");
            task.emit_state("failed", serde_json::json!({}));
            return Err(map_core_err(e));
        }
    };
    run_log.succeeded();

    if events {
        task.emit_state(
            "succeeded",
            serde_json::json!({ "bytesDownloaded": res.bytes_downloaded }),
        );
        return Ok(());
    }

    if json {
        println!(
            "{}",
            serde_json::to_string(&res)
                .map_err(|e| CliError::new("output.encode_failed", e.to_string()))?
        );
    } else {
        println!("object={}", args.object);
        println!(
            "bytesDownloaded={} chunks={}",
            res.bytes_downloaded, res.chunks
        );
    }
    Ok(())
}

struct DownloadTarget {
    file: std::fs::File,
    size: u64,
    /// Object offset one past the last byte transferred.
    end: u64,
}

/// Resolves how much will be transferred before the local file is touched,
/// so a failed lookup leaves no file behind.
async fn open_download_target(
    store: &DirObjectStore,
    args: &DownloadArgs,
) -> Result<DownloadTarget, CliError> {
    let size = resolve_download_size(
        store,
        &args.object,
        args.range.offset,
        args.range.count,
        None,
        &AccessConditions::default(),
    )
    .await
    .map_err(map_core_err)?;
    let end = args.range.offset.checked_add(size).ok_or_else(|| {
        CliError::new(
            "config.invalid",
            format!(
                "range offset={} count={size} runs past u64::MAX",
                args.range.offset
            ),
        )
    })?;

    if let Some(parent) = args.file.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| CliError::new("file.write_failed", e.to_string()))?;
    }
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&args.file)
        .map_err(|e| CliError::new("file.write_failed", e.to_string()))?;

    Ok(DownloadTarget { file, size, end })
}

async fn stat(store: &DirObjectStore, object: &str, json: bool) -> Result<(), CliError> {
    let props = store
        .get_properties(object, &AccessConditions::default())
        .await
        .map_err(map_core_err)?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "object": object,
                "contentLength": props.content_length,
                "etag": props.etag,
                "contentType": props.attributes.content_type,
                "metadata": props.attributes.metadata,
            })
        );
    } else {
        println!("object={object}");
        println!("contentLength={}", props.content_length);
        println!("etag={}", props.etag);
        if let Some(content_type) = &props.attributes.content_type {
            println!("contentType={content_type}");
        }
        for (k, v) in &props.attributes.metadata {
            println!("metadata.{k}={v}");
        }
    }
    Ok(())
}

fn settings_get(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let settings = load_settings(config_dir).map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    } else {
        let text = to_toml(&settings).map_err(map_core_err)?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn settings_set(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let settings =
        parse_settings(&input).map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    save_settings(config_dir, &settings).map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    }
    Ok(())
}

fn open_store(flag: Option<PathBuf>, settings: &Settings) -> Result<DirObjectStore, CliError> {
    let root = flag
        .or_else(|| {
            (!settings.store.root.is_empty()).then(|| PathBuf::from(&settings.store.root))
        })
        .ok_or_else(|| {
            CliError::new(
                "config.invalid",
                "store root not configured (use --store or set store.root)",
            )
        })?;
    Ok(DirObjectStore::new(root))
}

fn default_config_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config").join(APP_NAME)
}

fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".local")
        .join("share")
        .join(APP_NAME)
}

fn map_core_err(e: blockxfer_core::Error) -> CliError {
    use blockxfer_core::Error;

    match e {
        Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        Error::Planning { .. } => CliError::new("config.invalid", e.to_string()),
        Error::Io(e) => CliError::new("io.failed", e.to_string()),
        Error::RemoteQuery { message } => CliError::retryable("remote.query_failed", message),
        Error::Remote { message } => CliError::retryable("remote.unavailable", message),
        Error::SizeExceeded { size, max } => CliError::new(
            "transfer.size_exceeded",
            format!("source of {size} bytes exceeds the {max} byte limit"),
        )
        .with_details(serde_json::json!({ "size": size, "max": max })),
        Error::ChunkTransfer {
            ordinal,
            offset,
            len,
            ref source,
        } => CliError::retryable("transfer.chunk_failed", source.to_string()).with_details(
            serde_json::json!({ "ordinal": ordinal, "offset": offset, "len": len }),
        ),
        Error::Commit { source } => CliError::retryable("transfer.commit_failed", source.to_string()),
        Error::ShortRead { expected, actual } => {
            CliError::retryable("transfer.short_read", e.to_string()).with_details(
                serde_json::json!({ "expected": expected, "actual": actual }),
            )
        }
        Error::Cancelled => CliError::new("task.cancelled", "cancelled"),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}
