//! Algorithm serving service — worker attach/detach and region management
//!
//! Analysis workers connect to the serving endpoint, request a named result
//! region, and read the graph segment by name. Each accepted connection runs
//! on its own session thread; the accept loop joins every session before
//! acknowledging its own stop, so descriptor teardown at shutdown never
//! races a live session.
//!
//! Descriptor ownership: a session removes its descriptor (and unlinks the
//! region) only on a worker-initiated disconnect. When a session exits
//! because of global cancellation, the descriptor stays registered — the
//! lifecycle coordinator is the sole destroyer at shutdown.

use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::Utc;
use skein_core::shm;
use skein_core::shutdown::CancelToken;

use crate::history;
use crate::state::{ServerState, WorkerDescriptor};
use crate::transport::{self, Conn, FrameEvent, FrameReader, Listener};

const MSG_ATTACH: u8 = 0;
const MSG_DETACH: u8 = 1;

pub const STATUS_OK: u8 = 0;
pub const STATUS_REJECTED: u8 = 1;

/// Accept loop. Runs until the token is cancelled; joins all worker
/// sessions, then sends the stopped acknowledgment.
pub fn run(state: Arc<ServerState>, listener: Listener, token: CancelToken, stopped: Sender<()>) {
    log::info!(
        "algorithm serving service listening on {}",
        state.serve_endpoint
    );
    let mut sessions: Vec<JoinHandle<()>> = Vec::new();
    while !token.is_cancelled() {
        match listener.accept() {
            Ok(Some(conn)) => {
                let state = state.clone();
                let token = token.clone();
                sessions.push(thread::spawn(move || worker_session(state, conn, token)));
            }
            Ok(None) => thread::sleep(transport::ACCEPT_POLL),
            Err(e) => {
                log::warn!("serving accept failed: {e}");
                thread::sleep(transport::ACCEPT_POLL);
            }
        }
        sessions.retain(|handle| !handle.is_finished());
    }
    // sessions observe the shared token at their next timed read
    for handle in sessions {
        if handle.join().is_err() {
            log::warn!("worker session panicked");
        }
    }
    log::debug!("algorithm serving service stopped");
    let _ = stopped.send(());
}

fn worker_session(state: Arc<ServerState>, mut conn: Conn, token: CancelToken) {
    let mut frames = FrameReader::new();

    let (worker, region_len) = loop {
        if token.is_cancelled() {
            return;
        }
        match frames.poll(&mut conn) {
            Ok(FrameEvent::Frame(payload)) => match decode_attach(&payload) {
                Some(request) => break request,
                None => {
                    log::warn!("malformed attach request");
                    return;
                }
            },
            Ok(FrameEvent::Incomplete) => {}
            Ok(FrameEvent::Eof) => return,
            Err(e) => {
                log::warn!("worker connection error before attach: {e}");
                return;
            }
        }
    };

    let session_id = state.next_session_id();
    let region = format!(
        "{}.{}",
        state.opts.graph_name,
        shm::sanitize_name(&worker)
    );
    let registered = state.try_register_worker(WorkerDescriptor {
        name: worker.clone(),
        region: region.clone(),
        region_len,
        session_id,
        attached_at: Utc::now(),
    });
    if !registered {
        log::warn!("rejecting worker {worker}: name already attached");
        let _ = transport::write_frame(&mut conn, &[STATUS_REJECTED]);
        return;
    }

    match shm::create_region(&region, region_len) {
        // the mapping itself is not needed here; the worker maps the
        // region by name
        Ok(map) => drop(map),
        Err(e) => {
            log::warn!("rejecting worker {worker}: region allocation failed: {e}");
            state.remove_worker(session_id);
            let _ = transport::write_frame(&mut conn, &[STATUS_REJECTED]);
            return;
        }
    }

    let graph_len = state
        .graph
        .lock()
        .expect("graph mutex poisoned")
        .byte_len();

    let reply = encode_attach_reply(&state.opts.graph_name, graph_len, &region);
    if let Err(e) = transport::write_frame(&mut conn, &reply) {
        log::warn!("attach reply to {worker} failed: {e}");
        detach(&state, session_id);
        return;
    }

    // steady state: hold the session until detach, disconnect, or cancel
    let worker_initiated = loop {
        if token.is_cancelled() {
            break false;
        }
        match frames.poll(&mut conn) {
            Ok(FrameEvent::Frame(payload)) if payload.first() == Some(&MSG_DETACH) => break true,
            Ok(FrameEvent::Frame(_)) => {} // keepalive, ignored
            Ok(FrameEvent::Incomplete) => {}
            Ok(FrameEvent::Eof) => break true,
            Err(e) => {
                log::warn!("worker {worker} connection error: {e}");
                break true;
            }
        }
    };

    if worker_initiated {
        detach(&state, session_id);
    }
}

/// Worker-initiated removal: drop the descriptor, capture history if
/// enabled, unlink the region.
fn detach(state: &Arc<ServerState>, session_id: u64) {
    let Some(desc) = state.remove_worker(session_id) else {
        return;
    };
    if state.opts.record_history {
        match shm::read_region(&desc.region) {
            Ok(data) => {
                if let Err(e) = history::record(
                    &state.opts.output_dir,
                    &desc.name,
                    &data,
                    state.opts.history_cap,
                ) {
                    log::warn!("history for {} not recorded: {e:#}", desc.name);
                }
            }
            Err(e) => log::warn!("cannot read region {} for history: {e}", desc.region),
        }
    }
    match shm::unlink_region(&desc.region) {
        Ok(_) => log::info!("worker {} detached, region {} unlinked", desc.name, desc.region),
        Err(e) => log::warn!("cannot unlink region {} of worker {}: {e}", desc.region, desc.name),
    }
}

/// Encode a worker attach request: worker name plus desired region length.
pub fn encode_attach(worker: &str, region_len: u64) -> Vec<u8> {
    let name = worker.as_bytes();
    let mut payload = Vec::with_capacity(1 + 2 + name.len() + 8);
    payload.push(MSG_ATTACH);
    payload.extend_from_slice(&(name.len() as u16).to_le_bytes());
    payload.extend_from_slice(name);
    payload.extend_from_slice(&region_len.to_le_bytes());
    payload
}

/// Encode a worker-initiated detach.
pub fn encode_detach() -> Vec<u8> {
    vec![MSG_DETACH]
}

fn decode_attach(payload: &[u8]) -> Option<(String, u64)> {
    if payload.first() != Some(&MSG_ATTACH) {
        return None;
    }
    let name_len = u16::from_le_bytes(payload.get(1..3)?.try_into().ok()?) as usize;
    let name_end = 3 + name_len;
    let name = std::str::from_utf8(payload.get(3..name_end)?).ok()?;
    if name.is_empty() {
        return None;
    }
    let region_len = u64::from_le_bytes(payload.get(name_end..name_end + 8)?.try_into().ok()?);
    if payload.len() != name_end + 8 {
        return None;
    }
    Some((name.to_string(), region_len))
}

/// Successful attach reply: where the graph lives and the worker's own
/// region name.
#[derive(Debug, PartialEq, Eq)]
pub struct AttachReply {
    pub graph_region: String,
    pub graph_len: u64,
    pub worker_region: String,
}

fn encode_attach_reply(graph_region: &str, graph_len: u64, worker_region: &str) -> Vec<u8> {
    let graph = graph_region.as_bytes();
    let region = worker_region.as_bytes();
    let mut payload = Vec::with_capacity(1 + 2 + graph.len() + 8 + 2 + region.len());
    payload.push(STATUS_OK);
    payload.extend_from_slice(&(graph.len() as u16).to_le_bytes());
    payload.extend_from_slice(graph);
    payload.extend_from_slice(&graph_len.to_le_bytes());
    payload.extend_from_slice(&(region.len() as u16).to_le_bytes());
    payload.extend_from_slice(region);
    payload
}

/// Decode an attach reply; `None` for a rejection or malformed payload.
pub fn decode_attach_reply(payload: &[u8]) -> Option<AttachReply> {
    if payload.first() != Some(&STATUS_OK) {
        return None;
    }
    let graph_len_off = 3 + u16::from_le_bytes(payload.get(1..3)?.try_into().ok()?) as usize;
    let graph_region = std::str::from_utf8(payload.get(3..graph_len_off)?).ok()?;
    let graph_len =
        u64::from_le_bytes(payload.get(graph_len_off..graph_len_off + 8)?.try_into().ok()?);
    let region_off = graph_len_off + 8;
    let region_len =
        u16::from_le_bytes(payload.get(region_off..region_off + 2)?.try_into().ok()?) as usize;
    let worker_region =
        std::str::from_utf8(payload.get(region_off + 2..region_off + 2 + region_len)?).ok()?;
    Some(AttachReply {
        graph_region: graph_region.to_string(),
        graph_len,
        worker_region: worker_region.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_request_roundtrip() {
        let payload = encode_attach("pagerank", 1 << 16);
        assert_eq!(
            decode_attach(&payload),
            Some(("pagerank".to_string(), 1 << 16))
        );
    }

    #[test]
    fn empty_worker_name_is_malformed() {
        let payload = encode_attach("", 64);
        assert_eq!(decode_attach(&payload), None);
    }

    #[test]
    fn truncated_attach_is_malformed() {
        let payload = encode_attach("bfs", 64);
        assert_eq!(decode_attach(&payload[..payload.len() - 1]), None);
    }

    #[test]
    fn attach_reply_roundtrip() {
        let payload = encode_attach_reply("g1", 4096, "g1.bfs");
        assert_eq!(
            decode_attach_reply(&payload),
            Some(AttachReply {
                graph_region: "g1".to_string(),
                graph_len: 4096,
                worker_region: "g1.bfs".to_string(),
            })
        );
    }

    #[test]
    fn rejection_reply_decodes_to_none() {
        assert_eq!(decode_attach_reply(&[STATUS_REJECTED]), None);
    }

    #[test]
    fn detach_message_is_one_byte() {
        assert_eq!(encode_detach(), vec![MSG_DETACH]);
    }
}
