//! skeind — shared-memory streaming graph server
//!
//! Owns the graph segment for its lifetime: allocates or restores it at
//! startup, serves streaming edge updates and analysis-worker attachments,
//! and tears everything down exactly once on SIGINT/SIGTERM/SIGHUP.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::Parser;

use skein_core::batch::IdMode;
use skein_server::config::Config;
use skein_server::lifecycle::{Server, ServerOptions};

#[derive(Parser)]
#[command(name = "skeind")]
#[command(about = "Shared-memory streaming graph server")]
#[command(version)]
struct Cli {
    /// Graph segment name in the shared-memory namespace
    #[arg(short = 'n', long)]
    graph_name: Option<String>,

    /// Restore the graph from a snapshot instead of allocating fresh
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Input format (only "snapshot" is supported)
    #[arg(short = 't', long, default_value = "snapshot")]
    input_format: String,

    /// Ingestion endpoint port
    #[arg(short = 's', long)]
    ingest_port: Option<u16>,

    /// Algorithm-serving endpoint port
    #[arg(short = 'a', long)]
    serve_port: Option<u16>,

    /// Numeric vertex identifiers on the wire (default: named)
    #[arg(short = '1', long)]
    numeric_ids: bool,

    /// Run under a supervisor: suppress the interactive hint
    #[arg(short, long)]
    daemon: bool,

    /// Pipe fd for the daemon readiness status word
    #[arg(long, requires = "daemon")]
    notify_fd: Option<i32>,

    /// Persist the graph to the output directory on shutdown
    #[arg(short = 'k', long)]
    persist: bool,

    /// Record detaching workers' result regions to the output directory
    #[arg(long)]
    history: bool,

    /// Output directory for snapshots and worker history
    #[arg(short = 'f', long)]
    output_dir: Option<PathBuf>,

    /// History records kept per worker (0 = unlimited)
    #[arg(short = 'c', long)]
    history_cap: Option<usize>,

    /// Config file path (default: ./skein.toml or ~/.config/skein/config.toml)
    #[arg(short = 'C', long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Log warnings and errors only
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    skein_core::init_logging(cli.quiet, cli.debug);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Fatal: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if cli.input_format != "snapshot" {
        bail!(
            "unsupported input format {:?}: graph-file parsers live in the producers, \
             this server only restores its own snapshots",
            cli.input_format
        );
    }

    let config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };

    // CLI flags override config file values
    let opts = ServerOptions {
        graph_name: cli.graph_name.unwrap_or(config.graph.name),
        capacity: config.graph.capacity,
        input: cli.input,
        mode: config.transport.mode,
        ingest_port: cli.ingest_port.unwrap_or(config.transport.ingest_port),
        serve_port: cli.serve_port.unwrap_or(config.transport.serve_port),
        id_mode: if cli.numeric_ids || config.ids.numeric {
            IdMode::Numeric
        } else {
            IdMode::Named
        },
        persist_on_shutdown: cli.persist || config.persist.on_shutdown,
        record_history: cli.history || config.persist.history,
        output_dir: cli.output_dir.unwrap_or(config.persist.output_dir),
        history_cap: cli.history_cap.unwrap_or(config.persist.history_cap),
    };

    let server = Server::start(opts).context("server startup failed")?;
    server.install_signal_handlers()?;
    log::info!(
        "ingestion on {}, serving on {}",
        server.ingest_endpoint(),
        server.serve_endpoint()
    );

    if let Some(fd) = cli.notify_fd {
        server
            .notify_ready(fd)
            .context("readiness notification failed")?;
    } else if !cli.daemon {
        log::info!("Press Ctrl-C to shut down the server...");
    }

    server.wait();
    Ok(())
}
