//! Process-wide server state shared by the service loops and the coordinator

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::{self, ThreadId};

use chrono::{DateTime, Utc};
use skein_core::{GraphSegment, VertexNames};

use crate::lifecycle::ServerOptions;
use crate::transport::Endpoint;

/// An attached analysis worker and the shared region it publishes results to.
#[derive(Debug, Clone)]
pub struct WorkerDescriptor {
    pub name: String,
    /// Shared-memory region this worker owns for its results.
    pub region: String,
    pub region_len: u64,
    pub session_id: u64,
    pub attached_at: DateTime<Utc>,
}

/// Registry shared by both service threads and the lifecycle coordinator.
///
/// Constructed exactly once at startup, before either service thread exists,
/// and never reassigned afterwards — the segment reference and endpoints can
/// therefore be read without synchronization on first use. The worker
/// collection is the only field mutated during normal operation: inserts and
/// removals come from the serving service, the final drain from the
/// coordinator at shutdown.
pub struct ServerState {
    /// The graph segment. The mutex stands in for the engine's internal
    /// fine-grained concurrency control and serializes the ingestion writer
    /// against the shutdown-time consistency check and persist.
    pub graph: Mutex<GraphSegment>,
    pub names: Mutex<VertexNames>,
    pub ingest_endpoint: Endpoint,
    pub serve_endpoint: Endpoint,
    pub opts: ServerOptions,
    workers: Mutex<Vec<WorkerDescriptor>>,
    master: ThreadId,
    stop: AtomicBool,
    torn_down: AtomicBool,
    next_session: AtomicU64,
}

impl ServerState {
    /// Build the registry on the thread that will later be authorized to run
    /// teardown.
    pub fn new(
        graph: GraphSegment,
        names: VertexNames,
        ingest_endpoint: Endpoint,
        serve_endpoint: Endpoint,
        opts: ServerOptions,
    ) -> Self {
        Self {
            graph: Mutex::new(graph),
            names: Mutex::new(names),
            ingest_endpoint,
            serve_endpoint,
            opts,
            workers: Mutex::new(Vec::new()),
            master: thread::current().id(),
            stop: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            next_session: AtomicU64::new(1),
        }
    }

    /// Request shutdown. Returns true if it had already been requested.
    /// Safe from signal context: a single atomic swap.
    pub fn request_stop(&self) -> bool {
        self.stop.swap(true, Ordering::Relaxed)
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// Only the thread that constructed the state may run teardown.
    pub fn is_master(&self) -> bool {
        thread::current().id() == self.master
    }

    /// First caller wins; everyone after sees false.
    pub fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::SeqCst)
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert a descriptor unless a live worker already publishes under the
    /// same name. The check and the insert happen under one lock, so two
    /// racing attaches cannot both claim a name.
    pub fn try_register_worker(&self, desc: WorkerDescriptor) -> bool {
        let mut workers = self.workers.lock().expect("worker registry poisoned");
        if workers.iter().any(|d| d.name == desc.name) {
            return false;
        }
        log::info!(
            "worker {} attached (session {}, region {}, {} bytes)",
            desc.name,
            desc.session_id,
            desc.region,
            desc.region_len
        );
        workers.push(desc);
        true
    }

    pub fn remove_worker(&self, session_id: u64) -> Option<WorkerDescriptor> {
        let mut workers = self.workers.lock().expect("worker registry poisoned");
        let idx = workers.iter().position(|d| d.session_id == session_id)?;
        Some(workers.remove(idx))
    }

    /// Take every remaining descriptor; used once, by the coordinator's
    /// final teardown step.
    pub fn drain_workers(&self) -> Vec<WorkerDescriptor> {
        std::mem::take(&mut *self.workers.lock().expect("worker registry poisoned"))
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().expect("worker registry poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportMode;
    use skein_core::GraphSegment;

    fn test_state(tag: &str) -> ServerState {
        let name = format!("skein-state-test-{}-{tag}", std::process::id());
        let graph = GraphSegment::allocate(&name, 8).unwrap();
        let endpoint = Endpoint {
            mode: TransportMode::Tcp,
            port: 0,
        };
        ServerState::new(
            graph,
            VertexNames::new(),
            endpoint,
            endpoint,
            ServerOptions::default(),
        )
    }

    fn descriptor(state: &ServerState, name: &str) -> WorkerDescriptor {
        WorkerDescriptor {
            name: name.to_string(),
            region: format!("test.{name}"),
            region_len: 4096,
            session_id: state.next_session_id(),
            attached_at: Utc::now(),
        }
    }

    #[test]
    fn attach_detach_balance() {
        let state = test_state("balance");
        let before = state.worker_count();

        let mut sessions = Vec::new();
        for name in ["pagerank", "bfs", "cc"] {
            let desc = descriptor(&state, name);
            sessions.push(desc.session_id);
            assert!(state.try_register_worker(desc));
        }
        assert_eq!(state.worker_count(), before + 3);

        for session in sessions {
            assert!(state.remove_worker(session).is_some());
        }
        assert_eq!(state.worker_count(), before);
        state.graph.lock().unwrap().release();
    }

    #[test]
    fn remove_unknown_session_is_none() {
        let state = test_state("unknown");
        assert!(state.remove_worker(42).is_none());
        state.graph.lock().unwrap().release();
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let state = test_state("dup");
        assert!(state.try_register_worker(descriptor(&state, "pagerank")));
        assert!(!state.try_register_worker(descriptor(&state, "pagerank")));
        assert!(state.try_register_worker(descriptor(&state, "bfs")));
        assert_eq!(state.worker_count(), 2);
        assert_eq!(state.drain_workers().len(), 2);
        assert_eq!(state.worker_count(), 0);
        state.graph.lock().unwrap().release();
    }

    #[test]
    fn teardown_begins_exactly_once() {
        let state = test_state("teardown");
        assert!(state.begin_teardown());
        assert!(!state.begin_teardown());
        state.graph.lock().unwrap().release();
    }

    #[test]
    fn master_is_the_constructing_thread() {
        let state = test_state("master");
        assert!(state.is_master());
        std::thread::scope(|s| {
            s.spawn(|| assert!(!state.is_master()));
        });
        state.graph.lock().unwrap().release();
    }

    #[test]
    fn stop_request_is_sticky() {
        let state = test_state("stop");
        assert!(!state.stop_requested());
        assert!(!state.request_stop());
        assert!(state.request_stop());
        assert!(state.stop_requested());
        state.graph.lock().unwrap().release();
    }
}
