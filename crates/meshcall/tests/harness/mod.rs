//! Mesh orchestrator integration test harness
//!
//! Provides in-memory stand-ins for every collaborator of the orchestrator:
//! - `RecordingFactory`: connection handles that record what they are told
//!   and let the test post transport events on their behalf
//! - `ScriptedRendezvous`: a rendezvous whose events the test injects
//! - `RendezvousServer`: a real WebSocket rendezvous on a random port
//!
//! Presentation notifications are observed through `meshcall::ChannelSink`.

#![allow(dead_code)]

pub mod fakes;
pub mod server;

use std::future::Future;
use std::time::Duration;

use meshcall::MeshEvent;
use tokio::sync::mpsc;

pub use fakes::{HandleRecord, RecordingFactory, RendezvousLink, ScriptedRendezvous};
pub use server::RendezvousServer;

/// Default wait for asynchronous conditions
pub const WAIT: Duration = Duration::from_secs(5);

/// Initialize test logging (safe to call from every test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,meshcall=debug")
        .with_test_writer()
        .try_init();
}

/// Poll `condition` until it holds or `WAIT` elapses
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Every presentation event published so far
pub fn drain_events(rx: &mut mpsc::UnboundedReceiver<MeshEvent>) -> Vec<MeshEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Number of removal notifications for `peer_id` in `events`
pub fn removals(events: &[MeshEvent], peer_id: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, MeshEvent::PeerRemoved(id) if id == peer_id))
        .count()
}
