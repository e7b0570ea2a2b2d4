use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter};

use triallog::config::{Config, Telemetry};
use triallog::control::Logger;
use triallog::housekeeping::Housekeeper;
use triallog::writer::Writer;
use triallog::{config, receiver, signals, writer};

#[derive(Parser, Debug)]
#[clap(author, version, about = "UDP trial logger", long_about = None)]
struct Args {
    /// Receive address: IFACE:HOST:PORT, HOST:PORT or PORT
    #[clap(short, long)]
    recv: Option<String>,

    /// Root directory for trial artifacts
    #[clap(short, long)]
    dataroot: Option<PathBuf>,

    /// Optional YAML config file
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Verbose diagnostics
    #[clap(short, long)]
    verbose: bool,
}

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error(transparent)]
    Receiver(#[from] receiver::Error),
    #[error(transparent)]
    Writer(#[from] writer::Error),
    #[error("no read/write access to data root {path}: {source}")]
    Dataroot {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to install prometheus exporter: {0}")]
    Telemetry(#[from] metrics_exporter_prometheus::BuildError),
    #[error("worker panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// 1 for configuration and bind failures, 2 for unrecoverable I/O.
    fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_)
            | Error::Dataroot { .. }
            | Error::Telemetry(_)
            | Error::Receiver(_) => 1,
            Error::Writer(_) | Error::Join(_) => 2,
        }
    }
}

async fn check_dataroot(path: &std::path::Path) -> Result<(), Error> {
    let fail = |source| Error::Dataroot {
        path: path.to_owned(),
        source,
    };
    tokio::fs::create_dir_all(path).await.map_err(fail)?;
    let probe = path.join(".write_probe");
    tokio::fs::write(&probe, b"").await.map_err(fail)?;
    tokio::fs::remove_file(&probe).await.map_err(fail)?;
    Ok(())
}

async fn run(args: Args) -> Result<(), Error> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(recv) = args.recv {
        config.recv = recv.parse()?;
    }
    if let Some(dataroot) = args.dataroot {
        config.dataroot = dataroot;
    }

    if let Telemetry::Prometheus { prometheus_addr } = config.telemetry {
        PrometheusBuilder::new()
            .with_http_listener(prometheus_addr)
            .install()?;
        info!(%prometheus_addr, "prometheus exporter installed");
    }

    check_dataroot(&config.dataroot).await?;
    info!(dataroot = %config.dataroot.display(), "trial artifacts root");

    let logger = Arc::new(Logger::new());
    let (broadcaster, watcher) = signals::channel();

    let udp = receiver::Udp::new(
        &config.recv,
        &config.receiver,
        Arc::clone(&logger),
        watcher.clone(),
    )?;
    let writer = Writer::new(
        config.dataroot.clone(),
        Arc::clone(&logger),
        watcher.clone(),
    );
    let keeper = Housekeeper::new(config.housekeeping, Arc::clone(&logger), watcher);

    let mut workers: JoinSet<Result<(), Error>> = JoinSet::new();
    workers.spawn(async move { udp.spin().await.map_err(Error::Receiver) });
    workers.spawn(async move { writer.spin().await.map_err(Error::Writer) });
    workers.spawn(async move {
        keeper.spin().await;
        Ok(())
    });

    let mut result = Ok(());
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received; shutting down");
        }
        Some(res) = workers.join_next() => {
            result = res.map_err(Error::Join).and_then(|inner| inner);
            if let Err(err) = &result {
                error!(%err, "worker exited early");
            }
        }
    }

    broadcaster.signal();
    while let Some(res) = workers.join_next().await {
        let joined = res.map_err(Error::Join).and_then(|inner| inner);
        if let Err(err) = joined {
            error!(%err, "worker failed during shutdown");
            if result.is_ok() {
                result = Err(err);
            }
        }
    }
    result
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if args.verbose {
            "triallog=debug,info"
        } else {
            "info"
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .finish()
        .init();

    if let Err(err) = run(args).await {
        error!(%err, "fatal");
        std::process::exit(err.exit_code());
    }
}
