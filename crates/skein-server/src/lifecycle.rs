//! Server lifecycle — deterministic startup, exactly-once shutdown
//!
//! Startup ordering: allocate (or restore) the graph segment, publish it and
//! the resolved endpoints into the registry, launch the ingestion thread,
//! then the serving thread, then install signal handlers and park the master
//! thread. Shutdown runs only on the master thread, exactly once, and works
//! through every teardown step even when individual steps fail.
//!
//! Signal handlers never call into teardown directly: they flip the stop
//! flag, and the parked master thread reacts. A second signal force-exits.

use std::fs::File;
use std::io::Write as _;
use std::os::fd::{FromRawFd, RawFd};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use skein_core::batch::IdMode;
use skein_core::shm;
use skein_core::shutdown::CancelToken;
use skein_core::{GraphSegment, VertexNames};

use crate::ingest;
use crate::serve;
use crate::state::ServerState;
use crate::transport::{self, Endpoint, Listener, TransportMode};

/// Bounded wait for a service's stopped acknowledgment before the forced
/// abandon-and-log path.
const STOP_WAIT: Duration = Duration::from_secs(5);

/// Master-thread poll interval while parked.
const PARK_POLL: Duration = Duration::from_millis(200);

/// Everything the coordinator needs to know at startup, resolved from the
/// CLI and config file by the binary.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub graph_name: String,
    pub capacity: u64,
    /// Snapshot to restore instead of allocating fresh.
    pub input: Option<PathBuf>,
    pub mode: TransportMode,
    pub ingest_port: u16,
    pub serve_port: u16,
    pub id_mode: IdMode,
    pub persist_on_shutdown: bool,
    pub record_history: bool,
    pub output_dir: PathBuf,
    pub history_cap: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            graph_name: "skein-default".to_string(),
            capacity: 1 << 16,
            input: None,
            mode: TransportMode::Tcp,
            ingest_port: 10102,
            serve_port: 10103,
            id_mode: IdMode::Named,
            persist_on_shutdown: false,
            record_history: false,
            output_dir: PathBuf::from("./skein-data"),
            history_cap: 10,
        }
    }
}

/// A service thread plus its cancellation token and stop acknowledgment.
struct ServiceHandle {
    name: &'static str,
    token: CancelToken,
    stopped: Receiver<()>,
    thread: Option<JoinHandle<()>>,
}

impl ServiceHandle {
    fn spawn<F>(name: &'static str, service: F) -> std::io::Result<Self>
    where
        F: FnOnce(CancelToken, Sender<()>) + Send + 'static,
    {
        let token = CancelToken::new();
        let (tx, rx) = mpsc::channel();
        let service_token = token.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || service(service_token, tx))?;
        Ok(Self {
            name,
            token,
            stopped: rx,
            thread: Some(thread),
        })
    }

    /// Cancel, wait for the acknowledgment, then join. Returns false on the
    /// escalation path (the service failed to stop in time and its thread
    /// was abandoned).
    fn stop(&mut self, wait: Duration) -> bool {
        self.token.cancel();
        match self.stopped.recv_timeout(wait) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                if let Some(thread) = self.thread.take() {
                    if thread.join().is_err() {
                        log::warn!("{} thread panicked during shutdown", self.name);
                    }
                }
                true
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                log::error!(
                    "{} did not acknowledge stop within {wait:?}; abandoning thread",
                    self.name
                );
                // process exit reclaims the thread
                self.thread.take();
                false
            }
        }
    }
}

impl Drop for ServiceHandle {
    fn drop(&mut self) {
        // covers services spawned but never stop()ed (startup failure)
        if let Some(thread) = self.thread.take() {
            self.token.cancel();
            let _ = thread.join();
        }
    }
}

/// A running graph server: registry plus the two service threads.
pub struct Server {
    state: Arc<ServerState>,
    ingest: ServiceHandle,
    serve: ServiceHandle,
}

impl Server {
    /// Allocate (or restore) the graph, publish the registry, bind both
    /// endpoints, and launch the service threads. Any failure here is
    /// fatal — the process must not run with a partially initialized graph.
    pub fn start(opts: ServerOptions) -> Result<Server> {
        let graph = match &opts.input {
            Some(path) => GraphSegment::restore(&opts.graph_name, path)
                .with_context(|| format!("cannot restore graph from {}", path.display()))?,
            None => GraphSegment::allocate(&opts.graph_name, opts.capacity)
                .context("cannot allocate graph segment")?,
        };
        log::info!(
            "graph {} ready: {} active vertices, {} edges, {} bytes",
            graph.name(),
            graph.active_vertices(),
            graph.total_edges(),
            graph.byte_len()
        );
        let report = graph.consistency_check();
        if report.is_clean() {
            log::info!("initial consistency check clean");
        } else {
            log::warn!("initial consistency check: {report}");
        }

        let names = match (&opts.input, opts.id_mode) {
            (Some(_), IdMode::Named) => {
                let path = opts.output_dir.join(format!("{}.names", opts.graph_name));
                if path.exists() {
                    VertexNames::load(&path)
                        .with_context(|| format!("cannot load vertex names from {}", path.display()))?
                } else {
                    log::warn!("restoring a named-identifier graph without {}", path.display());
                    VertexNames::new()
                }
            }
            _ => VertexNames::new(),
        };

        let (ingest_listener, ingest_endpoint) = Listener::bind(Endpoint {
            mode: opts.mode,
            port: opts.ingest_port,
        })
        .context("cannot bind ingestion endpoint")?;
        let (serve_listener, serve_endpoint) = Listener::bind(Endpoint {
            mode: opts.mode,
            port: opts.serve_port,
        })
        .context("cannot bind serving endpoint")?;

        // the registry must be fully populated before either service thread
        // starts: both read it without synchronization on first use
        let state = Arc::new(ServerState::new(
            graph,
            names,
            ingest_endpoint,
            serve_endpoint,
            opts,
        ));

        let ingest_state = state.clone();
        let ingest = ServiceHandle::spawn("batch-ingestion", move |token, stopped| {
            ingest::run(ingest_state, ingest_listener, token, stopped)
        })
        .context("cannot start ingestion service")?;

        let serve_state = state.clone();
        let serve = ServiceHandle::spawn("algorithm-serving", move |token, stopped| {
            serve::run(serve_state, serve_listener, token, stopped)
        })
        .context("cannot start serving service")?;

        Ok(Server {
            state,
            ingest,
            serve,
        })
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    pub fn ingest_endpoint(&self) -> Endpoint {
        self.state.ingest_endpoint
    }

    pub fn serve_endpoint(&self) -> Endpoint {
        self.state.serve_endpoint
    }

    /// Route SIGINT, SIGTERM, and SIGHUP to the stop flag. A second signal
    /// force-exits with status 130. Teardown itself runs on the parked
    /// master thread, never in signal context.
    pub fn install_signal_handlers(&self) -> Result<()> {
        use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
        for sig in [SIGINT, SIGTERM, SIGHUP] {
            let state = self.state.clone();
            // SAFETY: AtomicBool::swap and process::exit are
            // async-signal-safe
            unsafe {
                signal_hook::low_level::register(sig, move || {
                    if state.request_stop() {
                        std::process::exit(130);
                    }
                })
                .with_context(|| format!("cannot register handler for signal {sig}"))?;
            }
        }
        Ok(())
    }

    /// Daemonized readiness: write a single status word to the pipe fd
    /// inherited from the supervising parent.
    pub fn notify_ready(&self, fd: RawFd) -> std::io::Result<()> {
        // SAFETY: fd was inherited for exactly this purpose; File takes
        // ownership and closes it after the write
        let mut pipe = unsafe { File::from_raw_fd(fd) };
        pipe.write_all(&0i32.to_le_bytes())
    }

    /// Park the master thread until shutdown is requested, then tear down.
    pub fn wait(mut self) {
        while !self.state.stop_requested() {
            thread::sleep(PARK_POLL);
        }
        self.shutdown();
    }

    /// The exactly-once teardown routine. Invocations from any thread other
    /// than the one that started the server, or after teardown already ran,
    /// are no-ops. Returns true when this call performed teardown.
    ///
    /// Step order is load-bearing: ingestion stops before the consistency
    /// check and persist (no mutation may race them), and serving stops
    /// before worker regions are torn down (no live session may see its
    /// region disappear). Every step is best-effort; failures are logged
    /// and never abort the remaining steps.
    pub fn shutdown(&mut self) -> bool {
        if !self.state.is_master() {
            log::debug!("shutdown request from non-master thread ignored");
            return false;
        }
        if !self.state.begin_teardown() {
            log::debug!("shutdown already performed");
            return false;
        }

        log::info!("shutting down the batch ingestion service...");
        self.ingest.stop(STOP_WAIT);
        log::info!("shutting down the algorithm serving service...");
        self.serve.stop(STOP_WAIT);

        {
            let graph = self.state.graph.lock().expect("graph mutex poisoned");
            let report = graph.consistency_check();
            if report.is_clean() {
                log::info!("final consistency check clean");
            } else {
                // diagnostic, not a gate: a salvageable graph should still
                // attempt to persist
                log::warn!("final consistency check: {report}");
            }
            if self.state.opts.persist_on_shutdown {
                self.persist(&graph);
            }
        }

        self.state
            .graph
            .lock()
            .expect("graph mutex poisoned")
            .release();

        for endpoint in [&self.state.ingest_endpoint, &self.state.serve_endpoint] {
            match transport::remove_socket_file(endpoint) {
                Ok(true) => log::debug!("removed socket file for {endpoint}"),
                Ok(false) => {}
                Err(e) => log::warn!("cannot remove socket file for {endpoint}: {e}"),
            }
        }

        for desc in self.state.drain_workers() {
            match shm::unlink_region(&desc.region) {
                Ok(true) => log::info!("unlinked region {} of worker {}", desc.region, desc.name),
                Ok(false) => log::debug!("region {} of worker {} already gone", desc.region, desc.name),
                Err(e) => log::warn!(
                    "cannot unlink region {} of worker {}: {e}",
                    desc.region,
                    desc.name
                ),
            }
        }

        log::info!("shutdown complete");
        true
    }

    fn persist(&self, graph: &GraphSegment) {
        let opts = &self.state.opts;
        if let Err(e) = std::fs::create_dir_all(&opts.output_dir) {
            log::error!(
                "cannot create output dir {}: {e}",
                opts.output_dir.display()
            );
            return;
        }
        let snapshot = opts.output_dir.join(format!("{}.snapshot", opts.graph_name));
        match graph.persist(&snapshot) {
            Ok(()) => log::info!("graph persisted to {}", snapshot.display()),
            Err(e) => log::error!("graph persistence failed: {e}"),
        }
        if opts.id_mode == IdMode::Named {
            let names_path = opts.output_dir.join(format!("{}.names", opts.graph_name));
            let names = self.state.names.lock().expect("name table poisoned");
            match names.save(&names_path) {
                Ok(()) => log::info!("vertex names persisted to {}", names_path.display()),
                Err(e) => log::error!("vertex name persistence failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static SEQ: AtomicU32 = AtomicU32::new(0);

    fn test_opts(tag: &str, output_dir: PathBuf) -> ServerOptions {
        ServerOptions {
            graph_name: format!(
                "skein-lc-test-{}-{}-{tag}",
                std::process::id(),
                SEQ.fetch_add(1, Ordering::Relaxed)
            ),
            capacity: 256,
            mode: TransportMode::Tcp,
            ingest_port: 0,
            serve_port: 0,
            id_mode: IdMode::Numeric,
            output_dir,
            ..ServerOptions::default()
        }
    }

    #[test]
    fn startup_binds_ephemeral_ports() {
        let dir = tempfile::tempdir().unwrap();
        let mut server = Server::start(test_opts("bind", dir.path().to_path_buf())).unwrap();
        assert_ne!(server.ingest_endpoint().port, 0);
        assert_ne!(server.serve_endpoint().port, 0);
        assert_ne!(server.ingest_endpoint().port, server.serve_endpoint().port);
        assert!(server.shutdown());
    }

    #[test]
    fn shutdown_runs_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let opts = test_opts("once", dir.path().to_path_buf());
        let graph_name = opts.graph_name.clone();
        let mut server = Server::start(opts).unwrap();
        assert!(shm::region_exists(&graph_name));

        assert!(server.shutdown());
        assert!(!shm::region_exists(&graph_name));
        // the second invocation is a no-op, not an error
        assert!(!server.shutdown());
    }

    #[test]
    fn shutdown_from_foreign_thread_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let opts = test_opts("foreign", dir.path().to_path_buf());
        let graph_name = opts.graph_name.clone();
        let mut server = Server::start(opts).unwrap();

        thread::scope(|s| {
            s.spawn(|| assert!(!server.shutdown()));
        });
        assert!(shm::region_exists(&graph_name));

        assert!(server.shutdown());
        assert!(!shm::region_exists(&graph_name));
    }

    #[test]
    fn restore_failure_is_fatal_before_services_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = test_opts("badsnap", dir.path().to_path_buf());
        let bogus = dir.path().join("missing.snapshot");
        opts.input = Some(bogus);
        let graph_name = opts.graph_name.clone();
        assert!(Server::start(opts).is_err());
        assert!(!shm::region_exists(&graph_name));
    }
}
