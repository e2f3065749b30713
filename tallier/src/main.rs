use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::filter::EnvFilter;

use tallier::config::{Config, Error as ConfigError, HaroldConfig};
use tallier::graphite::Graphite;
use tallier::harold::Harold;
use tallier::server::Server;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file; flags override its settings
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// UDP port to listen for statgrams on
    #[clap(long)]
    port: Option<u16>,

    /// Number of parallel workers for parsing and accumulating stats
    #[clap(long)]
    num_workers: Option<usize>,

    /// Interval at which stats are flushed to graphite, in seconds
    #[clap(long)]
    flush_interval_seconds: Option<u64>,

    /// Address of the graphite (carbon) server
    #[clap(long)]
    graphite: Option<String>,

    /// Base URL of the harold watchdog (requires --harold-secret)
    #[clap(long)]
    harold: Option<String>,

    /// Secret for authenticating with the harold watchdog
    #[clap(long)]
    harold_secret: Option<String>,

    /// Destination for logging (stdout or stderr)
    #[clap(long, default_value = "stdout")]
    logto: String,
}

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Graphite(#[from] tallier::graphite::Error),
    #[error(transparent)]
    Server(#[from] tallier::server::Error),
}

fn assemble_config(args: &Args) -> Result<Config, ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(num_workers) = args.num_workers {
        config.num_workers = num_workers;
    }
    if let Some(seconds) = args.flush_interval_seconds {
        config.flush_interval_seconds = seconds;
    }
    if let Some(graphite) = &args.graphite {
        config.graphite = graphite.clone();
    }
    if let Some(base_url) = &args.harold {
        config.harold = Some(HaroldConfig {
            base_url: base_url.clone(),
            secret: args.harold_secret.clone().unwrap_or_default(),
            tag: "tallier".to_owned(),
        });
    }
    config.validate()?;
    Ok(config)
}

async fn run(config: Config) -> Result<(), Error> {
    let graphite = Graphite::new(&config.graphite)?;
    let harold = config
        .harold
        .as_ref()
        .map(|conf| Harold::new(&conf.base_url, &conf.secret));
    let server = Server::new(config, graphite, harold);

    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupted, shutting down");
                let _ = shutdown_tx.send(());
            }
            Err(err) => {
                error!("unable to listen for shutdown signals: {err}");
                // Hold the sender so a failed handler does not read as a
                // shutdown signal.
                std::future::pending::<()>().await;
            }
        }
    });

    server.run(shutdown_rx).await?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.logto.as_str() {
        "stdout" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stdout)
            .init(),
        "stderr" => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init(),
        other => {
            eprintln!("error: -logto must be stdout or stderr, not {other:?}");
            return ExitCode::from(2);
        }
    }

    let config = match assemble_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(2);
        }
    };

    // The receiver pool plus the flush loop.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.num_workers + 1)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(err) = runtime.block_on(run(config)) {
        eprintln!("error: {err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
