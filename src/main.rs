//! fileloop server binary.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use fileloop::logging::{self, LogOptions, LogService};
use fileloop::{EventLoop, FileManager, FileServer, PollerKind, ServerConfig};

/// Resumable chunked file transfer server
#[derive(Parser)]
#[command(name = "fileloop")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "etc/fileserver.conf")]
    config: PathBuf,

    /// Poller backend (epoll, poll, select); overrides the config file
    #[arg(long)]
    poller: Option<PollerKind>,

    /// Number of I/O loop threads; overrides the config file
    #[arg(long)]
    io_threads: Option<usize>,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_signo: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() -> io::Result<()> {
    for signo in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only stores to an atomic.
        let rc = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = on_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signo, &action, std::ptr::null_mut())
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ServerConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if cli.poller.is_some() {
        config.poller = cli.poller;
    }
    if let Some(n) = cli.io_threads {
        config.io_threads = n;
    }

    let mut logs = LogService::new(LogOptions {
        level: config.log_level.clone(),
        dir: config.log_dir.clone(),
        file_name: config.log_file.clone(),
        stderr: true,
    });
    logs.start().context("starting log service")?;

    install_signal_handlers().context("installing signal handlers")?;

    let manager = Arc::new(
        FileManager::init(&config.file_cache_dir)
            .with_context(|| format!("initializing file cache {}", config.file_cache_dir.display()))?,
    );

    let base_loop = EventLoop::with_poller(config.poller).context("creating base loop")?;
    let server = FileServer::new(
        base_loop.clone(),
        config.listen_addr(),
        config.server_options(),
        manager,
        config.codec(),
        config.transfer_settings(),
    )
    .with_context(|| format!("binding {}", config.listen_addr()))?;
    server.start().context("starting file server")?;

    let quitter = Arc::downgrade(&base_loop);
    base_loop.run_every(Duration::from_millis(200), move || {
        if SHUTDOWN.load(Ordering::SeqCst)
            && let Some(lp) = quitter.upgrade()
        {
            tracing::info!("shutdown requested");
            lp.quit();
        }
    });

    tracing::info!(
        addr = %server.local_addr(),
        backend = %base_loop.backend(),
        io_threads = config.io_threads,
        "fileserver initialization completed"
    );
    if let Err(e) = base_loop.run() {
        logging::fatal(&format!("base loop failed: {e}"));
    }

    server.stop();
    tracing::info!("exit fileserver");
    logs.stop();
    Ok(())
}
