// bus-core/src/session.rs

//! Transport session: one addressable endpoint per process, plus channels to
//! every peer in the world.
//!
//! Bootstrap binds the inbound endpoint, runs the rendezvous handshake, and
//! attaches the device-affinity hints. From the moment the endpoint is bound,
//! other ranks may invoke this process's inbound handler.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Endpoint, Server};
use tonic::{Request, Response, Status};

use crate::addressing::{node_name, NodeName};
use crate::affinity::{resolve_affinity, DeviceAffinityMap};
use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::message::Message;
use crate::proto;
use crate::proto::worker_bus_server::{WorkerBus, WorkerBusServer};
use crate::queue::InboundQueue;
use crate::rendezvous::{join_world, Peer, RendezvousHost};

/// Inbound half of the wire contract: enqueue and ack.
///
/// The handler never blocks on application processing, so remote-call latency
/// stays decoupled from message-handling latency.
struct WorkerBusService {
    queue: Arc<InboundQueue>,
}

#[tonic::async_trait]
impl WorkerBus for WorkerBusService {
    async fn deliver(
        &self,
        request: Request<proto::DeliverRequest>,
    ) -> std::result::Result<Response<proto::DeliverReply>, Status> {
        let req = request.into_inner();
        let wire = req
            .message
            .ok_or_else(|| Status::invalid_argument("message is required"))?;
        let message = Message::from(wire);

        tracing::trace!(
            sender = req.sender_rank,
            msg_type = message.msg_type(),
            "inbound message"
        );

        if !self.queue.push(message) {
            return Err(Status::unavailable("bus is stopping"));
        }
        Ok(Response::new(proto::DeliverReply {}))
    }
}

/// Lazily connected channel to one peer.
pub(crate) struct PeerLink {
    address: String,
    endpoint: Endpoint,
    channel: Mutex<Option<Channel>>,
}

impl PeerLink {
    fn new(peer: &Peer, connect_timeout: Duration, call_timeout: Duration) -> Result<Self> {
        let endpoint = Endpoint::from_shared(format!("http://{}", peer.address))
            .map_err(|e| {
                BusError::transport_init_with_source(
                    format!("invalid peer address '{}'", peer.address),
                    e,
                )
            })?
            .connect_timeout(connect_timeout)
            .timeout(call_timeout);

        Ok(Self {
            address: peer.address.clone(),
            endpoint,
            channel: Mutex::new(None),
        })
    }

    /// Returns the cached channel, dialing the peer on first use.
    pub(crate) async fn channel(&self, node: &NodeName) -> Result<Channel> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref() {
            return Ok(channel.clone());
        }
        let channel = self.endpoint.connect().await.map_err(|e| {
            BusError::remote_call_with_source(
                node.to_string(),
                format!("failed to connect to {}", self.address),
                e,
            )
        })?;
        *slot = Some(channel.clone());
        Ok(channel)
    }
}

/// A bootstrapped transport session, valid for the lifetime of the bus.
pub struct Session {
    rank: u32,
    node_name: NodeName,
    local_addr: SocketAddr,
    call_timeout: Duration,
    peers: HashMap<NodeName, PeerLink>,
    device_map: Option<DeviceAffinityMap>,
    shutdown: watch::Sender<bool>,
    server_handle: StdMutex<Option<JoinHandle<()>>>,
    rendezvous: StdMutex<Option<RendezvousHost>>,
}

impl Session {
    /// Establishes this process's endpoint and joins the world.
    ///
    /// Validates configuration and resolves affinity hints before binding
    /// anything, binds the inbound endpoint (rank 0 additionally hosts the
    /// rendezvous at the master endpoint), then blocks until every rank has
    /// joined or the bootstrap timeout elapses.
    pub(crate) async fn bootstrap(config: &BusConfig, queue: Arc<InboundQueue>) -> Result<Self> {
        config.validate()?;

        let rank = config.rank;
        let node = node_name(rank);
        let device_map = resolve_affinity(&config.affinity, rank)?;

        let rendezvous = if rank == 0 {
            Some(RendezvousHost::bind(&config.master.addr(), config.world_size).await?)
        } else {
            None
        };

        let listener = match TcpListener::bind(&config.listen.bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                if let Some(host) = rendezvous {
                    host.shutdown().await;
                }
                return Err(BusError::transport_init_with_source(
                    format!("failed to bind endpoint at {}", config.listen.bind_addr),
                    e,
                ));
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                if let Some(host) = rendezvous {
                    host.shutdown().await;
                }
                return Err(BusError::transport_init_with_source(
                    "failed to resolve endpoint address",
                    e,
                ));
            }
        };
        let advertise = format!("{}:{}", config.listen.advertise_host, local_addr.port());

        let service = WorkerBusService {
            queue: queue.clone(),
        };
        let (shutdown, mut signal) = watch::channel(false);
        let worker_threads = config.transport.worker_threads;

        let server_handle = tokio::spawn(async move {
            let incoming = TcpListenerStream::new(listener);
            let result = Server::builder()
                .concurrency_limit_per_connection(worker_threads)
                .add_service(WorkerBusServer::new(service))
                .serve_with_incoming_shutdown(incoming, async move {
                    let _ = signal.changed().await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "worker endpoint failed");
            }
        });

        tracing::info!(rank, node = %node, address = %advertise, "worker endpoint bound");

        let self_peer = Peer {
            rank,
            node_name: node.clone(),
            address: advertise,
        };
        let world = match join_world(&config.master, &config.transport, self_peer).await {
            Ok(world) => world,
            Err(e) => {
                // Tear the half-open session down before surfacing the error.
                let _ = shutdown.send(true);
                let _ = server_handle.await;
                if let Some(host) = rendezvous {
                    host.shutdown().await;
                }
                return Err(e);
            }
        };

        let call_timeout = config.transport.call_timeout();
        let mut peers = HashMap::new();
        for peer in &world {
            // Self included: a loopback link lets a rank address itself.
            peers.insert(
                peer.node_name.clone(),
                PeerLink::new(peer, config.transport.connect_timeout(), call_timeout)?,
            );
        }

        if let Some(map) = &device_map {
            tracing::debug!(hints = map.len(), "device affinity hints attached");
        }
        tracing::info!(rank, world_size = world.len(), "world complete");

        Ok(Self {
            rank,
            node_name: node,
            local_addr,
            call_timeout,
            peers,
            device_map,
            shutdown,
            server_handle: StdMutex::new(Some(server_handle)),
            rendezvous: StdMutex::new(rendezvous),
        })
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn node_name(&self) -> &NodeName {
        &self.node_name
    }

    /// Address the inbound endpoint is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Affinity hints attached at bootstrap, if device transfer is enabled.
    pub fn device_map(&self) -> Option<&DeviceAffinityMap> {
        self.device_map.as_ref()
    }

    pub(crate) fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub(crate) fn peer(&self, node: &NodeName) -> Result<&PeerLink> {
        self.peers.get(node).ok_or_else(|| {
            BusError::remote_call(node.to_string(), "peer is not part of this world")
        })
    }

    /// Tears the transport down; the endpoint henceforth rejects calls.
    pub(crate) async fn shutdown(&self) {
        let _ = self.shutdown.send(true);

        let server = self
            .server_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = server {
            let _ = handle.await;
        }

        let rendezvous = self
            .rendezvous
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(host) = rendezvous {
            host.shutdown().await;
        }

        tracing::info!(rank = self.rank, "transport session closed");
    }
}
