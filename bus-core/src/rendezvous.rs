// bus-core/src/rendezvous.rs

//! One-time world rendezvous at the master endpoint.
//!
//! Before any messages flow, every rank announces its node name and bound
//! address to the rendezvous service and waits until all ranks have joined.
//! Rank 0 hosts the service in-process; the standalone `dwb-rendezvous`
//! binary hosts the same service for deployments where the coordinator
//! process is launched separately. The master endpoint plays no role after
//! the handshake.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::time::Instant;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Request, Response, Status};

use crate::addressing::NodeName;
use crate::config::{MasterEndpoint, TransportConfig};
use crate::error::{BusError, Result};
use crate::proto;
use crate::proto::rendezvous_client::RendezvousClient;
use crate::proto::rendezvous_server::{Rendezvous, RendezvousServer};

/// A worker as seen by the rendezvous: rank, node name, and the address of
/// its bound message endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub rank: u32,
    pub node_name: NodeName,
    pub address: String,
}

impl From<Peer> for proto::PeerInfo {
    fn from(peer: Peer) -> Self {
        Self {
            rank: peer.rank,
            node_name: peer.node_name.to_string(),
            address: peer.address,
        }
    }
}

impl From<proto::PeerInfo> for Peer {
    fn from(info: proto::PeerInfo) -> Self {
        Self {
            rank: info.rank,
            node_name: NodeName::from_raw(info.node_name),
            address: info.address,
        }
    }
}

/// In-memory rendezvous state: who has joined a fixed-size world.
struct RendezvousState {
    world_size: u32,
    peers: RwLock<HashMap<u32, Peer>>,
}

impl RendezvousState {
    fn new(world_size: u32) -> Self {
        Self {
            world_size,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Records a peer, replacing any earlier registration of the same rank
    /// (a restarted worker re-announces itself). Returns the join count.
    async fn register(&self, peer: Peer) -> u32 {
        let mut peers = self.peers.write().await;
        peers.insert(peer.rank, peer);
        peers.len() as u32
    }

    async fn world(&self) -> (Vec<Peer>, bool) {
        let peers = self.peers.read().await;
        let mut list: Vec<Peer> = peers.values().cloned().collect();
        list.sort_by_key(|p| p.rank);
        let complete = list.len() as u32 == self.world_size;
        (list, complete)
    }
}

struct RendezvousService {
    state: Arc<RendezvousState>,
}

#[tonic::async_trait]
impl Rendezvous for RendezvousService {
    async fn register(
        &self,
        request: Request<proto::RegisterRequest>,
    ) -> std::result::Result<Response<proto::RegisterReply>, Status> {
        let peer = request
            .into_inner()
            .peer
            .ok_or_else(|| Status::invalid_argument("peer is required"))?;

        if peer.rank >= self.state.world_size {
            return Err(Status::out_of_range(format!(
                "rank {} out of range for world size {}",
                peer.rank, self.state.world_size
            )));
        }

        let peer = Peer::from(peer);
        tracing::info!(
            rank = peer.rank,
            node = %peer.node_name,
            address = %peer.address,
            "worker registered"
        );
        let joined = self.state.register(peer).await;

        Ok(Response::new(proto::RegisterReply {
            accepted: true,
            joined,
        }))
    }

    async fn get_world(
        &self,
        _request: Request<proto::GetWorldRequest>,
    ) -> std::result::Result<Response<proto::WorldReply>, Status> {
        let (peers, complete) = self.state.world().await;

        Ok(Response::new(proto::WorldReply {
            peers: peers.into_iter().map(Into::into).collect(),
            complete,
            world_size: self.state.world_size,
        }))
    }
}

/// Handle to a running rendezvous server.
pub struct RendezvousHost {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl RendezvousHost {
    /// Binds the rendezvous service for a world of `world_size` ranks.
    pub async fn bind(addr: &str, world_size: u32) -> Result<Self> {
        if world_size == 0 {
            return Err(BusError::config("world_size must be greater than 0"));
        }

        let listener = TcpListener::bind(addr).await.map_err(|e| {
            BusError::transport_init_with_source(
                format!("failed to bind rendezvous endpoint at {addr}"),
                e,
            )
        })?;
        let addr = listener.local_addr().map_err(|e| {
            BusError::transport_init_with_source("failed to resolve rendezvous address", e)
        })?;

        let service = RendezvousService {
            state: Arc::new(RendezvousState::new(world_size)),
        };
        let (shutdown, mut signal) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let incoming = TcpListenerStream::new(listener);
            let result = Server::builder()
                .add_service(RendezvousServer::new(service))
                .serve_with_incoming_shutdown(incoming, async move {
                    let _ = signal.changed().await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "rendezvous server failed");
            }
        });

        tracing::info!(%addr, world_size, "rendezvous listening");

        Ok(Self {
            addr,
            shutdown,
            handle,
        })
    }

    /// Address the service is actually bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stops the server and waits for it to wind down.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// Registers `self_peer` at the master endpoint and blocks until every rank
/// in the world has joined.
///
/// The whole handshake, including connecting to a not-yet-started rendezvous,
/// is bounded by the configured bootstrap timeout; expiry is fatal since no
/// partial-world operation is supported.
pub(crate) async fn join_world(
    master: &MasterEndpoint,
    transport: &TransportConfig,
    self_peer: Peer,
) -> Result<Vec<Peer>> {
    let deadline = Instant::now() + transport.bootstrap_timeout();
    let channel = connect_with_retry(master, transport, deadline).await?;
    let mut client = RendezvousClient::new(channel);

    client
        .register(proto::RegisterRequest {
            peer: Some(self_peer.into()),
        })
        .await
        .map_err(|e| {
            BusError::transport_init_with_source("rendezvous rejected registration", e)
        })?;

    loop {
        let reply = client
            .get_world(proto::GetWorldRequest {})
            .await
            .map_err(|e| BusError::transport_init_with_source("rendezvous poll failed", e))?
            .into_inner();

        if reply.complete {
            return Ok(reply.peers.into_iter().map(Into::into).collect());
        }
        if Instant::now() >= deadline {
            return Err(BusError::transport_init(format!(
                "rendezvous timed out with {}/{} ranks joined",
                reply.peers.len(),
                reply.world_size
            )));
        }
        tokio::time::sleep(Duration::from_millis(transport.rendezvous_poll_ms)).await;
    }
}

// Workers race the rendezvous host at startup, so connection refusal is
// expected early on; retry with backoff until the bootstrap deadline.
async fn connect_with_retry(
    master: &MasterEndpoint,
    transport: &TransportConfig,
    deadline: Instant,
) -> Result<Channel> {
    let endpoint = Endpoint::from_shared(format!("http://{}", master.addr()))
        .map_err(|e| {
            BusError::config_with_source(
                format!("invalid master endpoint '{}'", master.addr()),
                e,
            )
        })?
        .connect_timeout(transport.connect_timeout());

    let mut delay = Duration::from_millis(transport.reconnect_delay_ms);
    loop {
        match endpoint.connect().await {
            Ok(channel) => return Ok(channel),
            Err(e) => {
                if Instant::now() + delay >= deadline {
                    return Err(BusError::transport_init_with_source(
                        format!("could not reach rendezvous at {}", master.addr()),
                        e,
                    ));
                }
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, Duration::from_secs(1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addressing::node_name;

    fn peer(rank: u32) -> Peer {
        Peer {
            rank,
            node_name: node_name(rank),
            address: format!("127.0.0.1:{}", 40000 + rank),
        }
    }

    #[tokio::test]
    async fn test_state_completes_at_world_size() {
        let state = RendezvousState::new(2);
        assert_eq!(state.register(peer(0)).await, 1);

        let (_, complete) = state.world().await;
        assert!(!complete);

        assert_eq!(state.register(peer(1)).await, 2);
        let (peers, complete) = state.world().await;
        assert!(complete);
        assert_eq!(peers.len(), 2);
        // Sorted by rank regardless of join order.
        assert_eq!(peers[0].rank, 0);
        assert_eq!(peers[1].rank, 1);
    }

    #[tokio::test]
    async fn test_state_reregistration_replaces() {
        let state = RendezvousState::new(2);
        state.register(peer(0)).await;

        let mut restarted = peer(0);
        restarted.address = "127.0.0.1:50000".to_string();
        assert_eq!(state.register(restarted.clone()).await, 1);

        let (peers, _) = state.world().await;
        assert_eq!(peers[0].address, restarted.address);
    }

    #[tokio::test]
    async fn test_join_world_single_rank() {
        let host = RendezvousHost::bind("127.0.0.1:0", 1).await.unwrap();
        let master = MasterEndpoint::new("127.0.0.1", host.addr().port());
        let transport = TransportConfig {
            bootstrap_timeout_ms: 5_000,
            ..Default::default()
        };

        let world = join_world(&master, &transport, peer(0)).await.unwrap();
        assert_eq!(world.len(), 1);
        assert_eq!(world[0].rank, 0);

        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_join_world_times_out_without_full_world() {
        let host = RendezvousHost::bind("127.0.0.1:0", 2).await.unwrap();
        let master = MasterEndpoint::new("127.0.0.1", host.addr().port());
        let transport = TransportConfig {
            bootstrap_timeout_ms: 300,
            rendezvous_poll_ms: 50,
            ..Default::default()
        };

        // Only one of two ranks joins.
        let err = join_world(&master, &transport, peer(0)).await.unwrap_err();
        assert!(matches!(err, BusError::TransportInit { .. }));

        host.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_out_of_range_rank_rejected() {
        let host = RendezvousHost::bind("127.0.0.1:0", 1).await.unwrap();
        let master = MasterEndpoint::new("127.0.0.1", host.addr().port());
        let transport = TransportConfig {
            bootstrap_timeout_ms: 2_000,
            ..Default::default()
        };

        let err = join_world(&master, &transport, peer(5)).await.unwrap_err();
        assert!(matches!(err, BusError::TransportInit { .. }));

        host.shutdown().await;
    }
}
