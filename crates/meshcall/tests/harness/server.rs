//! In-process WebSocket rendezvous server
//!
//! Assigns ids `peer-1`, `peer-2`, ... in connection order, introduces each
//! newcomer to the clients already present, announces it to them, relays
//! `signal` frames to their addressee and announces departures.

use futures::{SinkExt, StreamExt};
use meshcall::signaling::{RendezvousMessage, SignalEnvelope};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};

#[derive(Default)]
struct ServerState {
    next_id: usize,
    /// Connected clients in join order
    order: Vec<String>,
    clients: HashMap<String, mpsc::UnboundedSender<RendezvousMessage>>,
    /// Every signal relayed, for assertions
    relayed: Vec<SignalEnvelope>,
}

impl ServerState {
    fn broadcast(&self, except: &str, msg: RendezvousMessage) {
        for (id, client) in &self.clients {
            if id != except {
                let _ = client.send(msg.clone());
            }
        }
    }
}

/// Rendezvous server listening on a random local port
pub struct RendezvousServer {
    addr: SocketAddr,
    state: Arc<Mutex<ServerState>>,
    task: JoinHandle<()>,
}

impl RendezvousServer {
    /// Bind to 127.0.0.1 on a random port and start accepting
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind rendezvous server");
        let addr = listener.local_addr().expect("no local address");
        let state = Arc::new(Mutex::new(ServerState::default()));

        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle_client(stream, Arc::clone(&accept_state)));
            }
        });

        info!("Rendezvous server listening on {}", addr);
        Self { addr, state, task }
    }

    /// WebSocket URL of the server
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Ids of connected clients in join order
    pub fn client_ids(&self) -> Vec<String> {
        self.state.lock().order.clone()
    }

    /// Signals relayed so far
    pub fn relayed(&self) -> Vec<SignalEnvelope> {
        self.state.lock().relayed.clone()
    }

    /// Send an arbitrary frame to one client
    pub fn send_to(&self, id: &str, msg: RendezvousMessage) -> bool {
        match self.state.lock().clients.get(id) {
            Some(client) => client.send(msg).is_ok(),
            None => false,
        }
    }

    /// Drop a client's connection from the server side
    pub fn kick(&self, id: &str) {
        // Dropping the sender ends the writer, which closes the socket
        self.state.lock().clients.remove(id);
    }

    /// Stop accepting connections
    pub fn shutdown(self) {
        self.task.abort();
    }
}

async fn handle_client(stream: TcpStream, state: Arc<Mutex<ServerState>>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("WebSocket handshake failed: {}", e);
            return;
        }
    };
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RendezvousMessage>();

    let id = {
        let mut s = state.lock();
        s.next_id += 1;
        let id = format!("peer-{}", s.next_id);

        let _ = tx.send(RendezvousMessage::Welcome { id: id.clone() });
        let _ = tx.send(RendezvousMessage::Introduction(s.order.clone()));
        s.broadcast(&id, RendezvousMessage::NewUserConnected(id.clone()));

        s.clients.insert(id.clone(), tx);
        s.order.push(id.clone());
        id
    };
    debug!("Client {} joined", id);

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let Ok(json) = msg.to_json() else { continue };
            if write.send(Message::Text(json)).await.is_err() {
                return;
            }
        }
        let _ = write.close().await;
    });

    while let Some(Ok(msg)) = read.next().await {
        match msg {
            Message::Text(text) => {
                if let Ok(RendezvousMessage::Signal(envelope)) = RendezvousMessage::from_json(&text)
                {
                    let mut s = state.lock();
                    if let Some(client) = s.clients.get(&envelope.to) {
                        let _ = client.send(RendezvousMessage::Signal(envelope.clone()));
                    }
                    s.relayed.push(envelope);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    let mut s = state.lock();
    s.clients.remove(&id);
    s.order.retain(|other| other != &id);
    s.broadcast(&id, RendezvousMessage::UserDisconnected(id.clone()));
    debug!("Client {} left", id);
}
