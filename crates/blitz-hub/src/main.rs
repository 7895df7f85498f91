use anyhow::Context;
use blitz_hub::{producers::FeedIntervals, sources::NodeModel, HubConfig};
use chrono::{Local, NaiveDate};
use clap::Parser;
use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

const DEFAULT_ADDR: &str = "127.0.0.1:8000";
const LOG_PREFIX: &str = "blitz-hub-";
const LOG_SUFFIX: &str = ".log";

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    debug: bool,
    log_dir: String,
    log_keep_days: u32,
    hub: HubConfig,
}

#[derive(Parser, Debug)]
#[command(name = "blitz-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
    /// Delete daily hub logs older than this many days; 0 keeps them all.
    #[arg(long, default_value_t = 7)]
    log_keep_days: u32,
    #[arg(long, default_value = "")]
    ui_origin: String,
    #[arg(long, default_value_t = 64)]
    queue_capacity: usize,
    #[arg(long, default_value_t = 256)]
    max_consumers: usize,
    #[arg(long, default_value_t = 30)]
    stale_seconds: u64,
    #[arg(long, default_value_t = 15)]
    keep_alive_seconds: u64,
    #[arg(long, default_value_t = 5000)]
    fetch_timeout_ms: u64,
    #[arg(long, default_value_t = 3000)]
    install_delay_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.addr))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(event = "shutdown_signal");
        }
        let _ = shutdown_tx.send(true);
    });

    let model = Arc::new(NodeModel::default());
    if let Err(err) = blitz_hub::run(listener, config.hub, model, shutdown_rx).await {
        error!(event = "hub_error", error = %err);
        return Err(err.into());
    }
    Ok(())
}

fn load_config() -> Config {
    let args = Args::parse();
    let debug = args.debug || env_true("BLITZ_HUB_DEBUG");
    Config {
        addr: resolve_flag(&args.addr, "BLITZ_HUB_ADDR", DEFAULT_ADDR),
        debug,
        log_dir: resolve_flag(&args.log_dir, "BLITZ_LOG_DIR", ".blitz/logs"),
        log_keep_days: args.log_keep_days,
        hub: HubConfig {
            outbox_capacity: args.queue_capacity,
            max_consumers: args.max_consumers,
            keep_alive: Duration::from_secs(args.keep_alive_seconds.max(1)),
            stale_after: Duration::from_secs(args.stale_seconds),
            fetch_timeout: Duration::from_millis(args.fetch_timeout_ms),
            install_delay: Duration::from_millis(args.install_delay_ms),
            ui_origin: resolve_flag(&args.ui_origin, "BLITZ_UI_ORIGIN", "http://localhost:3000"),
            intervals: FeedIntervals::default(),
        },
    }
}

fn init_logging(config: &Config) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("BLITZ_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir, config.log_keep_days) {
        Ok(log_guard) => log_guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = writer.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(writer)
}

type SharedLog = Arc<Mutex<DailyLog>>;

struct LogGuard {
    file: Option<SharedLog>,
}

/// Tees every log line to stdout and the hub's daily log.
struct MultiWriter {
    stdout: io::Stdout,
    file: Option<SharedLog>,
}

impl MultiWriter {
    fn new(file: Option<SharedLog>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.write_line(buf, Local::now().date_naive());
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.flush();
        }
        Ok(())
    }
}

/// `blitz-hub-YYYY-MM-DD.log` in the log dir. Switches files when the local
/// date changes and deletes hub logs older than `keep_days`.
struct DailyLog {
    dir: PathBuf,
    keep_days: u32,
    current: Option<(NaiveDate, File)>,
}

impl DailyLog {
    fn open(dir: PathBuf, keep_days: u32, today: NaiveDate) -> io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let mut log = Self {
            dir,
            keep_days,
            current: None,
        };
        log.roll(today)?;
        Ok(log)
    }

    fn file_name(date: NaiveDate) -> String {
        format!("{LOG_PREFIX}{}{LOG_SUFFIX}", date.format("%Y-%m-%d"))
    }

    fn write_line(&mut self, buf: &[u8], today: NaiveDate) -> io::Result<()> {
        if self.current.as_ref().map(|(date, _)| *date) != Some(today) {
            self.roll(today)?;
        }
        match &mut self.current {
            Some((_, file)) => file.write_all(buf),
            None => Ok(()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.current {
            Some((_, file)) => file.flush(),
            None => Ok(()),
        }
    }

    fn roll(&mut self, today: NaiveDate) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(Self::file_name(today)))?;
        self.current = Some((today, file));
        self.prune(today);
        Ok(())
    }

    /// Best effort; a file that cannot be removed is retried on the next roll.
    fn prune(&self, today: NaiveDate) {
        if self.keep_days == 0 {
            return;
        }
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(date) = name
                .to_str()
                .and_then(|name| name.strip_prefix(LOG_PREFIX))
                .and_then(|rest| rest.strip_suffix(LOG_SUFFIX))
                .and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok())
            else {
                continue;
            };
            if (today - date).num_days() >= i64::from(self.keep_days) {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
}

fn open_log_file(log_dir: &str, keep_days: u32) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let log = DailyLog::open(PathBuf::from(log_dir), keep_days, Local::now().date_naive())?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(log))),
    })
}

fn env_true(key: &str) -> bool {
    std::env::var(key).is_ok_and(|value| {
        matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

/// Flag value if set, else the environment variable if set, else `default`.
fn resolve_flag(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}
