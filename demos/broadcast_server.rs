//! Broadcast server.
//!
//! Every message received from any client is written to all connected
//! clients. At most two clients are admitted at once.
//!
//! Usage:
//!   cargo run --example broadcast_server
//!   cargo run --example broadcast_server -- --ws
//!   cargo run --example broadcast_server -- --debug

mod common;

// ============================================================================
// Imports
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{info, warn};

use common::{Args, TCP_ADDR, WS_ADDR};
use framelink::{Agent, Connector, TcpConnector, TcpServer, WsConnector, WsServer};

// ============================================================================
// Constants
// ============================================================================

const MAX_CLIENTS: usize = 2;

// ============================================================================
// Hub
// ============================================================================

enum HubEvent {
    Join(u64, Arc<dyn Connector>),
    Leave(u64),
    Broadcast(Vec<u8>),
}

/// Relays messages between members.
struct Hub {
    members: HashMap<u64, Arc<dyn Connector>>,
    events: UnboundedReceiver<HubEvent>,
}

impl Hub {
    fn new(events: UnboundedReceiver<HubEvent>) -> Self {
        Self {
            members: HashMap::new(),
            events,
        }
    }

    /// Handles one event. Returns `false` once every sender is gone.
    async fn step(&mut self) -> bool {
        let Some(event) = self.events.recv().await else {
            return false;
        };

        match event {
            HubEvent::Join(id, conn) => {
                self.members.insert(id, conn);
            }
            HubEvent::Leave(id) => {
                self.members.remove(&id);
            }
            HubEvent::Broadcast(msg) => {
                for (id, conn) in &self.members {
                    if let Err(e) = conn.write_msg(&[msg.as_slice()]) {
                        warn!(member = id, error = %e, "Broadcast failed");
                    }
                }
            }
        }
        true
    }
}

// ============================================================================
// Member
// ============================================================================

struct Member<C> {
    id: u64,
    conn: Arc<C>,
    hub: UnboundedSender<HubEvent>,
}

#[async_trait]
impl<C: Connector> Agent for Member<C> {
    async fn run(&mut self) {
        loop {
            match self.conn.read_msg().await {
                Ok(msg) => {
                    info!(
                        peer = %self.conn.remote_addr(),
                        data = %String::from_utf8_lossy(&msg),
                        "Message received"
                    );
                    let _ = self.hub.send(HubEvent::Broadcast(msg));
                }
                Err(e) => {
                    info!(peer = %self.conn.remote_addr(), error = %e, "Read ended");
                    break;
                }
            }
        }
    }

    async fn on_close(&mut self) {
        info!(peer = %self.conn.remote_addr(), "Member left");
        let _ = self.hub.send(HubEvent::Leave(self.id));
    }
}

/// Builds the agent factory shared by both transports.
fn member_factory<C: Connector>(
    hub: UnboundedSender<HubEvent>,
) -> impl Fn(Arc<C>) -> Member<C> + Send + Sync + 'static {
    let next_id = AtomicU64::new(1);
    move |conn: Arc<C>| {
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        info!(peer = %conn.remote_addr(), member = id, "Member joined");
        let shared: Arc<dyn Connector> = conn.clone();
        let _ = hub.send(HubEvent::Join(id, shared));
        Member {
            id,
            conn,
            hub: hub.clone(),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

enum Server {
    Tcp(TcpServer),
    Ws(WsServer),
}

impl Server {
    async fn close(&self) {
        match self {
            Self::Tcp(server) => server.close().await,
            Self::Ws(server) => server.close().await,
        }
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    let args = Args::parse();
    common::init_logging(args.debug);

    if let Err(e) = run(args).await {
        eprintln!("\n[ERROR] {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let (tx, rx) = unbounded_channel();
    let mut hub = Hub::new(rx);

    let server = if args.websocket {
        let server = WsServer::builder(WS_ADDR)
            .max_connections(MAX_CLIENTS)
            .agent(member_factory::<WsConnector>(tx))
            .start()
            .await
            .context("starting WebSocket server")?;
        println!("Listening on {}", server.url());
        Server::Ws(server)
    } else {
        let server = TcpServer::builder(TCP_ADDR)
            .max_connections(MAX_CLIENTS)
            .agent(member_factory::<TcpConnector>(tx))
            .start()
            .await
            .context("starting TCP server")?;
        println!("Listening on {}", server.local_addr());
        Server::Tcp(server)
    };

    println!("Press Ctrl+C to exit...");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            running = hub.step() => {
                if !running {
                    break;
                }
            }
        }
    }

    server.close().await;
    Ok(())
}
