//! Two orchestrators meeting through a real WebSocket rendezvous
//!
//! Connection handles are recorded rather than negotiated, so this checks
//! discovery, the initiator/responder split and signal routing end to end.

mod harness;

use harness::{drain_events, eventually, init_logging, removals, RecordingFactory, RendezvousServer};
use meshcall::{
    ChannelSink, MediaSourceManager, MeshConfig, MeshEvent, MeshOrchestrator, OrchestratorHandle,
    Role, SourceKind, SyntheticDevices, TransportEventKind, WebSocketRendezvous,
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

struct Participant {
    handle: OrchestratorHandle,
    factory: RecordingFactory,
    events: mpsc::UnboundedReceiver<MeshEvent>,
}

async fn join(server: &RendezvousServer) -> Participant {
    let config = MeshConfig::new(&server.url()).with_ice_servers("turn.example.com:3478");
    let rendezvous = WebSocketRendezvous::new(&config.rendezvous_url, config.connect_timeout());
    let factory = RecordingFactory::new();
    let (sink, events) = ChannelSink::new();

    let orch = MeshOrchestrator::new(
        config,
        MediaSourceManager::new(Arc::new(SyntheticDevices::new())),
        Arc::new(rendezvous),
        Arc::new(factory.clone()),
        Arc::new(sink),
    )
    .unwrap();
    let handle = orch.handle();
    tokio::spawn(orch.run());

    handle.start_call(SourceKind::CameraMic).await.unwrap();

    Participant {
        handle,
        factory,
        events,
    }
}

#[tokio::test]
async fn test_late_joiner_initiates_and_offer_reaches_responder() {
    init_logging();
    let server = RendezvousServer::start().await;

    let first = join(&server).await; // peer-1
    let second = join(&server).await; // peer-2

    // peer-2 learns peer-1 from its introduction and initiates
    eventually("initiator on peer-2", || {
        let factory = second.factory.clone();
        async move { factory.handles_for("peer-1").len() == 1 }
    })
    .await;
    let initiator = second.factory.last_for("peer-1").unwrap();
    assert_eq!(initiator.role, Role::Initiator);
    assert_eq!(
        initiator.ice_servers[0].urls,
        vec!["turn:turn.example.com:3478".to_string()]
    );

    // peer-1 only reserved a placeholder for peer-2
    eventually("placeholder on peer-1", || {
        let handle = first.handle.clone();
        async move {
            let peers = handle.peers().await.unwrap();
            peers.len() == 1 && peers[0].role.is_none()
        }
    })
    .await;
    assert!(first.factory.handles().is_empty());

    // The offer travels through the rendezvous and creates the responder
    let offer = json!({"type": "offer", "sdp": "v=0"});
    initiator.emit(TransportEventKind::Signal(offer.clone()));

    eventually("responder on peer-1", || {
        let factory = first.factory.clone();
        async move { factory.handles_for("peer-2").len() == 1 }
    })
    .await;
    let responder = first.factory.last_for("peer-2").unwrap();
    assert_eq!(responder.role, Role::Responder);
    assert_eq!(responder.log().signals, vec![offer]);
    assert_eq!(server.relayed().len(), 1);

    // The answer goes back to the initiator's handle
    let answer = json!({"type": "answer", "sdp": "v=0"});
    responder.emit(TransportEventKind::Signal(answer.clone()));

    eventually("answer on peer-2", || {
        let initiator = initiator.clone();
        async move { !initiator.log().signals.is_empty() }
    })
    .await;
    assert_eq!(initiator.log().signals, vec![answer]);
    assert_eq!(first.factory.handles().len(), 1);
    assert_eq!(second.factory.handles().len(), 1);

    first.handle.shutdown().await.unwrap();
    second.handle.shutdown().await.unwrap();
    server.shutdown();
}

#[tokio::test]
async fn test_departure_removes_peer_once() {
    init_logging();
    let server = RendezvousServer::start().await;

    let mut first = join(&server).await;
    let second = join(&server).await;

    eventually("peer-2 in peer-1's roster", || {
        let handle = first.handle.clone();
        async move { handle.peers().await.unwrap().len() == 1 }
    })
    .await;

    second.handle.shutdown().await.unwrap();

    let mut seen = Vec::new();
    eventually("peer-2 removal", || {
        seen.extend(drain_events(&mut first.events));
        let removed = removals(&seen, "peer-2") == 1;
        async move { removed }
    })
    .await;

    assert!(first.handle.peers().await.unwrap().is_empty());
    assert_eq!(removals(&seen, "peer-2"), 1);

    // peer-2's own view was torn down too
    assert!(second.factory.handles().iter().all(|h| h.is_closed()));

    first.handle.shutdown().await.unwrap();
    server.shutdown();
}
