// bus-core/src/bus.rs

//! The message bus: lifecycle, send path, and the dispatch loop.
//!
//! A process starts the bus (binding its endpoint and joining the world),
//! registers observers, and begins receiving. Sending performs a synchronous
//! remote call that returns once the receiver has queued the message; the
//! receiver's dispatch loop drains its queue asynchronously and invokes every
//! observer per message.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::affinity::DeviceAffinityMap;
use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::message::Message;
use crate::observer::{Observer, ObserverRegistry};
use crate::proto;
use crate::proto::worker_bus_client::WorkerBusClient;
use crate::queue::InboundQueue;
use crate::session::Session;

/// Role a rank plays in the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Server,
    Client,
}

impl NodeRole {
    pub fn from_rank(rank: u32) -> Self {
        if rank == 0 {
            Self::Server
        } else {
            Self::Client
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => f.write_str("server"),
            Self::Client => f.write_str("client"),
        }
    }
}

/// Message delivery subsystem for one rank.
///
/// Typically held in an `Arc` and shared between the application's threads;
/// all methods take `&self`.
pub struct MessageBus {
    session: Session,
    queue: Arc<InboundQueue>,
    observers: Arc<ObserverRegistry>,
    running: watch::Sender<bool>,
    dispatch_started: AtomicBool,
    dispatch_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("rank", &self.session.rank())
            .field("role", &self.role())
            .finish_non_exhaustive()
    }
}

impl MessageBus {
    /// Bootstraps the transport session and starts the bus.
    ///
    /// Blocks until every rank in the world has joined the rendezvous.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Config`] for invalid configuration and
    /// [`BusError::TransportInit`] if the handshake fails or times out;
    /// both are fatal, there is no partial-world operation.
    pub async fn start(config: BusConfig) -> Result<Self> {
        let queue = Arc::new(InboundQueue::new());
        let session = Session::bootstrap(&config, queue.clone()).await?;
        let (running, _) = watch::channel(true);

        tracing::info!(
            rank = session.rank(),
            node = %session.node_name(),
            role = %NodeRole::from_rank(session.rank()),
            "bus started"
        );

        Ok(Self {
            session,
            queue,
            observers: Arc::new(ObserverRegistry::new()),
            running,
            dispatch_started: AtomicBool::new(false),
            dispatch_handle: StdMutex::new(None),
        })
    }

    pub fn rank(&self) -> u32 {
        self.session.rank()
    }

    pub fn role(&self) -> NodeRole {
        NodeRole::from_rank(self.session.rank())
    }

    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Affinity hints attached at bootstrap, if device transfer is enabled.
    pub fn device_affinity(&self) -> Option<&DeviceAffinityMap> {
        self.session.device_map()
    }

    pub fn add_observer(&self, observer: Arc<dyn Observer>) {
        self.observers.add(observer);
    }

    pub fn remove_observer(&self, observer: &Arc<dyn Observer>) {
        self.observers.remove(observer);
    }

    /// Sends `message` to its receiver, blocking until the remote handler has
    /// queued it (not until it is processed).
    ///
    /// # Errors
    ///
    /// Returns [`BusError::RemoteCall`] for transport-level failures and
    /// [`BusError::TimedOut`] when the configured call timeout elapses. The
    /// bus never retries; a failed send leaves it fully usable for other
    /// peers.
    pub async fn send(&self, message: Message) -> Result<()> {
        let node = message.receiver().node_name();
        tracing::debug!(to = %node, msg_type = message.msg_type(), "sending message");

        let link = self.session.peer(&node)?;
        let channel = link.channel(&node).await?;
        let mut client = WorkerBusClient::new(channel);

        let request = proto::DeliverRequest {
            sender_rank: self.session.rank(),
            message: Some(message.into()),
        };

        let timeout = self.session.call_timeout();
        match tokio::time::timeout(timeout, client.deliver(request)).await {
            Err(_) => Err(BusError::timed_out(node.to_string(), timeout)),
            Ok(Err(status)) => Err(BusError::remote_call_with_source(
                node.to_string(),
                "deliver rejected by peer",
                status,
            )),
            Ok(Ok(_)) => Ok(()),
        }
    }

    /// Spawns the dispatch loop: a single consumer that drains the inbound
    /// queue and notifies observers, one message at a time.
    ///
    /// Idempotent — repeated calls never create a second consumer.
    pub fn begin_receiving(&self) {
        if self.dispatch_started.swap(true, Ordering::SeqCst) {
            tracing::debug!(rank = self.rank(), "dispatch loop already started");
            return;
        }

        let queue = self.queue.clone();
        let observers = self.observers.clone();
        let mut running = self.running.subscribe();
        let rank = self.rank();

        let handle = tokio::spawn(async move {
            tracing::debug!(rank, "dispatch loop started");
            while *running.borrow() {
                tokio::select! {
                    message = queue.pop() => match message {
                        Some(message) => {
                            if let Err(e) = observers.notify(&message) {
                                tracing::warn!(
                                    rank,
                                    msg_type = message.msg_type(),
                                    error = %e,
                                    "observer failed; continuing with next message"
                                );
                            }
                        }
                        // Queue closed: nothing more will arrive.
                        None => break,
                    },
                    // Running flag flipped (or the bus is gone); re-check the
                    // loop condition.
                    changed = running.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!(rank, "dispatch loop stopped");
        });

        *self
            .dispatch_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Stops the bus: clears the running flag, tears down the transport, and
    /// waits for the dispatch loop to wind down.
    ///
    /// Messages still queued at this point are discarded, not drained; this
    /// is the accepted shutdown gap. In-flight sends initiated by this
    /// process are neither cancelled nor awaited.
    pub async fn stop(&self) {
        if !self.running.send_replace(false) {
            return;
        }
        tracing::info!(rank = self.rank(), "stopping bus");

        self.queue.close();
        self.session.shutdown().await;

        let dispatch = self
            .dispatch_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = dispatch {
            let _ = handle.await;
        }
    }
}
