use std::backtrace::{Backtrace, BacktraceStatus};
use std::io::{self, Write};
use std::panic::PanicHookInfo;
use std::sync::{Once, OnceLock};

use cdcflow_config::Environment;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::subscriber::{SetGlobalDefaultError, set_global_default};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{self, InitError, RollingFileAppender};
use tracing_log::{LogTracer, log_tracer::SetLoggerError};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

const LOG_DIR: &str = "logs";

/// Rotated files kept per process.
const MAX_LOG_FILES: usize = 5;

const DEFAULT_FILTER: &str = "info";

/// Key under which the project reference is added to JSON log lines.
const PROJECT_FIELD: &str = "project";

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("could not create the log file appender: {0}")]
    Appender(#[from] InitError),

    #[error("could not forward `log` records to tracing: {0}")]
    LogTracer(#[from] SetLoggerError),

    #[error("a global tracing subscriber is already installed: {0}")]
    GlobalDefault(#[from] SetGlobalDefaultError),

    #[error("could not determine the environment: {0}")]
    Environment(#[from] io::Error),
}

/// Flushes buffered log lines when dropped; hold it for the lifetime of `main`.
#[must_use]
pub enum LogFlusher {
    Flusher(WorkerGuard),
    NullFlusher,
}

/// Where log lines go.
enum LogOutput<'a> {
    /// Pretty, colored lines on stdout.
    Console,
    /// JSON lines in daily rotated files named after the application.
    Files { app_name: &'a str },
}

static PROJECT_REF: OnceLock<String> = OnceLock::new();

static INIT_TEST_TRACING: Once = Once::new();

pub fn get_global_project_ref() -> Option<&'static str> {
    PROJECT_REF.get().map(String::as_str)
}

/// Installs the global subscriber for `app_name`.
///
/// Production and staging log JSON to files under `logs/`, development logs to the console.
/// `RUST_LOG` overrides the default `info` filter. Panics are logged before the previous
/// panic hook runs.
pub fn init_tracing(app_name: &str, project_ref: Option<String>) -> Result<LogFlusher, TracingError> {
    if let Some(project_ref) = project_ref {
        let _ = PROJECT_REF.set(project_ref);
    }

    LogTracer::init()?;

    let output = if Environment::load()?.is_prod() {
        LogOutput::Files { app_name }
    } else {
        LogOutput::Console
    };
    let flusher = install_subscriber(output)?;

    let previous_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        log_panic(info);
        previous_hook(info);
    }));

    Ok(flusher)
}

/// Enables console tracing in tests when `ENABLE_TRACING` is set.
///
/// ```bash
/// ENABLE_TRACING=1 RUST_LOG=cdcflow=debug cargo test --features test-utils
/// ```
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        if std::env::var_os("ENABLE_TRACING").is_some() {
            let _ = install_subscriber(LogOutput::Console);
        }
    });
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn install_subscriber(output: LogOutput<'_>) -> Result<LogFlusher, TracingError> {
    match output {
        LogOutput::Console => {
            let layer = fmt::layer()
                .pretty()
                .with_ansi(true)
                .with_file(false)
                .with_line_number(false);
            set_global_default(Registry::default().with(env_filter()).with(layer))?;

            Ok(LogFlusher::NullFlusher)
        }
        LogOutput::Files { app_name } => {
            let appender = RollingFileAppender::builder()
                .rotation(rolling::Rotation::DAILY)
                .filename_prefix(app_name)
                .filename_suffix("log")
                .max_log_files(MAX_LOG_FILES)
                .build(LOG_DIR)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_target(false)
                .with_current_span(true)
                .with_span_list(true)
                .with_writer(move || ProjectFieldWriter::new(writer.make_writer()));
            set_global_default(Registry::default().with(env_filter()).with(layer))?;

            Ok(LogFlusher::Flusher(guard))
        }
    }
}

/// Adds the project reference to every JSON line written through it.
struct ProjectFieldWriter<W> {
    inner: W,
    project_ref: Option<&'static str>,
}

impl<W: Write> ProjectFieldWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            project_ref: get_global_project_ref(),
        }
    }

    fn with_project(line: &str, project_ref: &str) -> Option<String> {
        let mut fields: Map<String, Value> = serde_json::from_str(line).ok()?;
        if fields.contains_key(PROJECT_FIELD) {
            return None;
        }
        fields.insert(PROJECT_FIELD.to_string(), Value::from(project_ref));

        let mut output = serde_json::to_string(&fields).ok()?;
        if line.ends_with('\n') {
            output.push('\n');
        }

        Some(output)
    }
}

impl<W: Write> Write for ProjectFieldWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let rewritten = self.project_ref.and_then(|project_ref| {
            let line = std::str::from_utf8(buf).ok()?;
            Self::with_project(line, project_ref)
        });

        match rewritten {
            Some(output) => {
                self.inner.write_all(output.as_bytes())?;
                Ok(buf.len())
            }
            None => self.inner.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

fn log_panic(info: &PanicHookInfo) {
    let payload = info
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| info.payload().downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload");
    let location = info.location().map(ToString::to_string);

    let backtrace = Backtrace::capture();
    match backtrace.status() {
        BacktraceStatus::Captured => tracing::error!(
            panic.payload = payload,
            panic.location = location,
            panic.backtrace = %backtrace,
            "a panic occurred"
        ),
        _ => tracing::error!(
            panic.payload = payload,
            panic.location = location,
            "a panic occurred, set RUST_BACKTRACE=1 for a backtrace"
        ),
    }
}
