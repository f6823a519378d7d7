// bus-core/examples/ping_pong.rs

//! Two-rank ping/pong over the bus, both ranks in one process.
//!
//! ```bash
//! cargo run --example ping_pong
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;

use bus_core::{
    BoxError, BusConfig, ListenConfig, MasterEndpoint, Message, MessageBus, Observer,
    TransportConfig,
};

struct Forward {
    tx: mpsc::UnboundedSender<Message>,
}

impl Observer for Forward {
    fn receive(&self, _msg_type: &str, message: &Message) -> Result<(), BoxError> {
        self.tx
            .send(message.clone())
            .map_err(|_| "forward channel closed".into())
    }
}

fn config(rank: u32, master_port: u16) -> BusConfig {
    BusConfig {
        rank,
        world_size: 2,
        master: MasterEndpoint::new("127.0.0.1", master_port),
        listen: ListenConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            advertise_host: "127.0.0.1".to_string(),
        },
        transport: TransportConfig {
            call_timeout_ms: 5_000,
            bootstrap_timeout_ms: 10_000,
            ..Default::default()
        },
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let master_port = std::net::TcpListener::bind("127.0.0.1:0")?
        .local_addr()?
        .port();

    let (server, client) = tokio::join!(
        MessageBus::start(config(0, master_port)),
        MessageBus::start(config(1, master_port)),
    );
    let server = Arc::new(server?);
    let client = Arc::new(client?);

    let (tx, mut server_inbox) = mpsc::unbounded_channel();
    server.add_observer(Arc::new(Forward { tx }));
    server.begin_receiving();

    let (tx, mut client_inbox) = mpsc::unbounded_channel();
    client.add_observer(Arc::new(Forward { tx }));
    client.begin_receiving();

    // Rank 0 pings, rank 1 pongs.
    server
        .send(Message::new("ping", 0, 1).add_param("round", vec![1u8]))
        .await?;

    let ping = client_inbox.recv().await.ok_or("client inbox closed")?;
    println!(
        "rank 1 received '{}' from rank {}",
        ping.msg_type(),
        ping.sender()
    );

    client.send(Message::new("pong", 1, 0)).await?;
    let pong = server_inbox.recv().await.ok_or("server inbox closed")?;
    println!(
        "rank 0 received '{}' from rank {}",
        pong.msg_type(),
        pong.sender()
    );

    client.stop().await;
    server.stop().await;
    Ok(())
}
