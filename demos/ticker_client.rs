//! Ticker client.
//!
//! Connects to the broadcast server, reconnecting whenever the connection
//! is lost, and sends `[0, 1, 2, 3, 4]` every second while connected.
//!
//! Usage:
//!   cargo run --example ticker_client
//!   cargo run --example ticker_client -- --ws
//!   cargo run --example ticker_client -- --debug

mod common;

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use common::{Args, TCP_ADDR, WS_ADDR};
use framelink::{Agent, Connector, Locker, Result, TcpClient, TcpConnector, WsClient, WsConnector};

// ============================================================================
// Constants
// ============================================================================

const TICK: Duration = Duration::from_secs(1);
const PAYLOAD: &[u8] = &[0, 1, 2, 3, 4];

// ============================================================================
// Types
// ============================================================================

/// Connection currently owned by the agent, if any.
type Current = Arc<Locker<Option<Arc<dyn Connector>>>>;

struct Printer<C> {
    conn: Arc<C>,
    current: Current,
}

#[async_trait]
impl<C: Connector> Agent for Printer<C> {
    async fn run(&mut self) {
        let shared: Arc<dyn Connector> = self.conn.clone();
        *self.current.lock() = Some(shared);

        while let Ok(msg) = self.conn.read_msg().await {
            info!(len = msg.len(), data = ?msg, "Message received");
        }
    }

    async fn on_close(&mut self) {
        self.current.lock().take();
        info!(local = %self.conn.local_addr(), "Connection closed");
    }
}

fn printer_factory<C: Connector>(
    current: &Current,
) -> impl Fn(Arc<C>) -> Printer<C> + Send + Sync + 'static {
    let current = Arc::clone(current);
    move |conn: Arc<C>| {
        info!(local = %conn.local_addr(), "Connected");
        Printer {
            conn,
            current: Arc::clone(&current),
        }
    }
}

enum Client {
    Tcp(TcpClient),
    Ws(WsClient),
}

impl Client {
    async fn close(&self) {
        match self {
            Self::Tcp(client) => client.close().await,
            Self::Ws(client) => client.close().await,
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
        eprintln!("\n[ERROR] {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let current: Current = Arc::new(Locker::new(None));

    let client = if args.websocket {
        Client::Ws(
            WsClient::builder(format!("ws://{WS_ADDR}/"))
                .auto_reconnect(true)
                .agent(printer_factory::<WsConnector>(&current))
                .start()?,
        )
    } else {
        Client::Tcp(
            TcpClient::builder(TCP_ADDR)
                .auto_reconnect(true)
                .agent(printer_factory::<TcpConnector>(&current))
                .start()?,
        )
    };

    println!("Press Ctrl+C to exit...");
    let mut ticker = tokio::time::interval(TICK);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let conn = current.lock().clone();
                if let Some(conn) = conn {
                    conn.write_msg(&[PAYLOAD])?;
                }
            }
        }
    }

    client.close().await;
    Ok(())
}
