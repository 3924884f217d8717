//! Batch ingestion service — sole writer of the graph segment
//!
//! Producers connect to the ingestion endpoint and stream update batches;
//! each batch is applied in receipt order and acknowledged with the number
//! of updates applied. One producer connection is served at a time, which
//! preserves the single-writer guarantee on the segment.

use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;

use skein_core::batch::{Batch, Update, VertexKey};
use skein_core::shutdown::CancelToken;
use skein_core::VertexNames;

use crate::state::ServerState;
use crate::transport::{self, Conn, FrameEvent, FrameReader, Listener};

/// Accept loop. Runs until the token is cancelled; sends the stopped
/// acknowledgment on exit.
pub fn run(state: Arc<ServerState>, listener: Listener, token: CancelToken, stopped: Sender<()>) {
    log::info!(
        "batch ingestion service listening on {}",
        state.ingest_endpoint
    );
    while !token.is_cancelled() {
        match listener.accept() {
            Ok(Some(conn)) => serve_producer(&state, conn, &token),
            Ok(None) => thread::sleep(transport::ACCEPT_POLL),
            Err(e) => {
                log::warn!("ingestion accept failed: {e}");
                thread::sleep(transport::ACCEPT_POLL);
            }
        }
    }
    log::debug!("batch ingestion service stopped");
    let _ = stopped.send(());
}

/// Drain one producer connection. A malformed batch drops the connection;
/// the service itself keeps running.
fn serve_producer(state: &Arc<ServerState>, mut conn: Conn, token: &CancelToken) {
    let mut frames = FrameReader::new();
    loop {
        if token.is_cancelled() {
            return;
        }
        match frames.poll(&mut conn) {
            Ok(FrameEvent::Frame(payload)) => {
                let batch = match Batch::decode(&payload, state.opts.id_mode) {
                    Ok(batch) => batch,
                    Err(e) => {
                        log::warn!("malformed update batch: {e}");
                        return;
                    }
                };
                let applied = apply_batch(state, &batch);
                if let Err(e) = transport::write_frame(&mut conn, &applied.to_le_bytes()) {
                    log::warn!("producer ack failed: {e}");
                    return;
                }
            }
            Ok(FrameEvent::Incomplete) => {}
            Ok(FrameEvent::Eof) => return,
            Err(e) => {
                log::warn!("producer connection error: {e}");
                return;
            }
        }
    }
}

/// Apply updates in receipt order. A single failed update is logged and
/// skipped; it never takes the service down.
fn apply_batch(state: &Arc<ServerState>, batch: &Batch) -> u32 {
    let mut graph = state.graph.lock().expect("graph mutex poisoned");
    let mut names = state.names.lock().expect("name table poisoned");
    let mut applied = 0u32;
    for update in &batch.updates {
        let result = match update {
            Update::Insert { src, dst, weight } => {
                let src = resolve(&mut names, src);
                let dst = resolve(&mut names, dst);
                graph.insert_edge(src, dst, *weight).map(|_| ())
            }
            Update::Delete { src, dst } => {
                // deleting through an unknown name is a no-op, not an
                // excuse to allocate an id
                match (lookup(&names, src), lookup(&names, dst)) {
                    (Some(src), Some(dst)) => graph.delete_edge(src, dst).map(|_| ()),
                    _ => Ok(()),
                }
            }
        };
        match result {
            Ok(()) => applied += 1,
            Err(e) => log::warn!("update skipped: {e}"),
        }
    }
    applied
}

fn resolve(names: &mut VertexNames, key: &VertexKey) -> u64 {
    match key {
        VertexKey::Id(id) => *id,
        VertexKey::Name(name) => names.resolve(name),
    }
}

fn lookup(names: &VertexNames, key: &VertexKey) -> Option<u64> {
    match key {
        VertexKey::Id(id) => Some(*id),
        VertexKey::Name(name) => names.get(name),
    }
}
