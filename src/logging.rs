//! Log service: a `tracing` subscriber with an explicit lifecycle.
//!
//! Call sites only use `tracing` macros. File output goes through a
//! background writer thread that is flushed on [`LogService::stop`].

use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;
use tracing::Subscriber;
use tracing::subscriber::{DefaultGuard, SetGlobalDefaultError};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Error)]
pub enum LogError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] ParseError),

    #[error("a global subscriber is already installed")]
    AlreadySet(#[from] SetGlobalDefaultError),

    #[error("log directory: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Filter directive, e.g. `info` or `fileloop=debug`. `RUST_LOG` wins when set.
    pub level: String,
    /// Directory for the log file; stderr only when `None`.
    pub dir: Option<PathBuf>,
    pub file_name: String,
    pub stderr: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            file_name: "fileloop.log".to_string(),
            stderr: true,
        }
    }
}

pub struct LogService {
    options: LogOptions,
    guard: Option<WorkerGuard>,
    running: bool,
}

impl LogService {
    pub fn new(options: LogOptions) -> Self {
        Self {
            options,
            guard: None,
            running: false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn build(&mut self) -> Result<impl Subscriber + Send + Sync + use<>, LogError> {
        let filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(&self.options.level)?,
        };

        let file_layer = match &self.options.dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                let appender = tracing_appender::rolling::never(dir, &self.options.file_name);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                self.guard = Some(guard);
                Some(
                    fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_thread_names(true),
                )
            }
            None => None,
        };
        let stderr_layer = self
            .options
            .stderr
            .then(|| fmt::layer().with_writer(io::stderr).with_thread_names(true));

        Ok(tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .with(file_layer))
    }

    /// Installs the subscriber for the whole process.
    pub fn start(&mut self) -> Result<(), LogError> {
        let subscriber = self.build()?;
        tracing::subscriber::set_global_default(subscriber)?;
        self.running = true;
        tracing::info!(level = %self.options.level, dir = ?self.options.dir, "log service started");
        Ok(())
    }

    /// Installs the subscriber for the current thread until the guard drops.
    pub fn scoped(&mut self) -> Result<DefaultGuard, LogError> {
        let subscriber = self.build()?;
        self.running = true;
        Ok(tracing::subscriber::set_default(subscriber))
    }

    /// Flushes the file writer. Later events only reach stderr.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        tracing::info!("log service stopping");
        self.guard.take();
        self.running = false;
    }
}

impl Drop for LogService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Hex dump of `bytes` at debug level.
pub fn dump_binary(label: &str, bytes: &[u8]) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    for (i, line) in bytes.chunks(16).enumerate() {
        tracing::debug!(label, offset = i * 16, hex = %hex::encode(line), "binary dump");
    }
}

/// Logs `msg` synchronously and aborts the process.
pub fn fatal(msg: &str) -> ! {
    tracing::error!(fatal = true, "{msg}");
    eprintln!("FATAL: {msg}");
    std::process::abort()
}
