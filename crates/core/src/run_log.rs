//! Per-run NDJSON log files fed by a process-wide `tracing` subscriber.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use chrono::Utc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "debug";

static LOG_FILE: OnceLock<LogFile> = OnceLock::new();
static SUBSCRIBER: OnceLock<()> = OnceLock::new();

/// Target of the JSON layer. Lines emitted while no run is open are dropped.
#[derive(Debug, Default)]
struct LogFile {
    active: Mutex<Option<BufWriter<File>>>,
}

impl LogFile {
    fn lock(&self) -> MutexGuard<'_, Option<BufWriter<File>>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self, path: &Path) -> io::Result<()> {
        let mut active = self.lock();
        if active.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "a run log is already open",
            ));
        }
        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        *active = Some(BufWriter::new(file));
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        let Some(mut writer) = self.lock().take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()
    }
}

/// Holds the file lock for the duration of one formatted event.
struct LogLine<'a>(MutexGuard<'a, Option<BufWriter<File>>>);

impl Write for LogLine<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.as_mut() {
            Some(writer) => writer.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.0.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for &'static LogFile {
    type Writer = LogLine<'static>;

    fn make_writer(&'a self) -> Self::Writer {
        LogLine((*self).lock())
    }
}

/// First candidate that parses as a filter wins; otherwise `debug`.
fn env_filter_from(candidates: &[Option<&str>]) -> EnvFilter {
    candidates
        .iter()
        .flatten()
        .find_map(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber once; later calls are no-ops.
pub fn init_run_logging() {
    SUBSCRIBER.get_or_init(|| {
        let file: &'static LogFile = LOG_FILE.get_or_init(LogFile::default);
        let blockxfer_log = std::env::var("BLOCKXFER_LOG").ok();
        let rust_log = std::env::var("RUST_LOG").ok();
        let filter = env_filter_from(&[blockxfer_log.as_deref(), rust_log.as_deref()]);

        let json = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(file);

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(json)
            .try_init();
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Upload,
    Download,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Upload => "upload",
            RunKind::Download => "download",
        }
    }
}

/// One transfer's NDJSON log; closed and flushed when dropped.
///
/// Emits `run.start` on creation and `run.finish` with the recorded status
/// (`failed` unless [`RunLogGuard::succeeded`] was called) on drop.
pub struct RunLogGuard {
    path: PathBuf,
    kind: RunKind,
    run_id: String,
    succeeded: bool,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn succeeded(&mut self) {
        self.succeeded = true;
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        tracing::info!(
            event = "run.finish",
            kind = self.kind.as_str(),
            run_id = %self.run_id,
            status = if self.succeeded { "succeeded" } else { "failed" },
            "run.finish"
        );
        if let Some(file) = LOG_FILE.get() {
            let _ = file.close();
        }
    }
}

pub fn start_run_log(kind: RunKind, run_id: &str, data_dir: &Path) -> io::Result<RunLogGuard> {
    init_run_logging();

    let log_dir = resolve_log_dir(data_dir);
    std::fs::create_dir_all(&log_dir)?;

    let started_at_utc = Utc::now();
    let file_name = format!(
        "xfer-{}-{}-{}.ndjson",
        kind.as_str(),
        started_at_utc.format("%Y%m%dT%H%M%SZ"),
        sanitize_filename_component(run_id)
    );
    let path = log_dir.join(file_name);

    LOG_FILE.get_or_init(LogFile::default).open(&path)?;

    tracing::info!(
        event = "run.start",
        kind = kind.as_str(),
        run_id,
        "run.start"
    );

    Ok(RunLogGuard {
        path,
        kind,
        run_id: run_id.to_string(),
        succeeded: false,
    })
}

fn resolve_log_dir(data_dir: &Path) -> PathBuf {
    if let Ok(v) = std::env::var("BLOCKXFER_LOG_DIR") {
        return PathBuf::from(v);
    }
    data_dir.join("logs")
}

fn sanitize_filename_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}
