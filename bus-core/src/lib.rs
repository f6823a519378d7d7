// bus-core/src/lib.rs

//! Distributed Worker Bus - Core Library
//!
//! This crate provides the inter-process message bus for a ranked worker
//! pool: worker addressing, transport/session bootstrap with
//! accelerator-affinity hints, the inbound queue and dispatch loop, and the
//! observer contract used to hand received messages to application logic.

pub mod addressing;
pub mod affinity;
pub mod bus;
pub mod config;
pub mod error;
pub mod message;
pub mod observer;
pub mod queue;
pub mod rendezvous;
pub mod session;

pub(crate) mod proto {
    #![allow(clippy::all)]
    include!("proto/dwb.bus.rs");
}

// Re-export commonly used types for convenience
pub use addressing::{node_name, NodeName};
pub use affinity::{build_affinity_map, AffinityFallback, DeviceAffinityMap};
pub use bus::{MessageBus, NodeRole};
pub use config::{
    AffinityConfig, BusConfig, DeviceTableEntry, ListenConfig, MasterEndpoint, TransportConfig,
};
pub use error::{BoxError, BusError, Result};
pub use message::{Message, Param, Recipient};
pub use observer::{Observer, ObserverRegistry};
pub use queue::InboundQueue;
pub use rendezvous::{Peer, RendezvousHost};
pub use session::Session;
