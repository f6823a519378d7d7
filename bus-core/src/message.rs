// bus-core/src/message.rs

//! Message model and wire conversions.
//!
//! A [`Message`] is created by application logic, immutable after handoff to
//! the bus, and consumed exactly once by the dispatch loop on the receiving
//! side. Parameter values are opaque bytes; the payload codec is entirely the
//! application's concern. Type strings carry no meaning to the bus itself —
//! a message with an unknown type is still delivered.

use bytes::Bytes;

use crate::addressing::{node_name, NodeName};
use crate::proto;

/// Target of a message: a rank, or an explicit node name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Rank(u32),
    Node(NodeName),
}

impl Recipient {
    /// The node name this recipient resolves to.
    pub fn node_name(&self) -> NodeName {
        match self {
            Self::Rank(rank) => node_name(*rank),
            Self::Node(name) => name.clone(),
        }
    }

    fn to_wire(&self) -> String {
        match self {
            Self::Rank(rank) => rank.to_string(),
            Self::Node(name) => name.to_string(),
        }
    }

    fn from_wire(raw: &str) -> Self {
        match raw.parse::<u32>() {
            Ok(rank) => Self::Rank(rank),
            Err(_) => Self::Node(NodeName::from_raw(raw)),
        }
    }
}

impl From<u32> for Recipient {
    fn from(rank: u32) -> Self {
        Self::Rank(rank)
    }
}

impl From<NodeName> for Recipient {
    fn from(name: NodeName) -> Self {
        Self::Node(name)
    }
}

/// A single named parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub key: String,
    pub value: Bytes,
}

/// A typed message exchanged between ranks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    msg_type: String,
    sender: u32,
    receiver: Recipient,
    params: Vec<Param>,
}

impl Message {
    pub fn new(
        msg_type: impl Into<String>,
        sender: u32,
        receiver: impl Into<Recipient>,
    ) -> Self {
        Self {
            msg_type: msg_type.into(),
            sender,
            receiver: receiver.into(),
            params: Vec::new(),
        }
    }

    /// Sets a parameter, replacing any existing value for the same key while
    /// keeping its original position.
    pub fn add_param(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.params.iter_mut().find(|p| p.key == key) {
            Some(param) => param.value = value,
            None => self.params.push(Param { key, value }),
        }
        self
    }

    /// Looks up a parameter value by key.
    pub fn param(&self, key: &str) -> Option<&Bytes> {
        self.params.iter().find(|p| p.key == key).map(|p| &p.value)
    }

    /// Parameters in insertion order.
    pub fn params(&self) -> &[Param] {
        &self.params
    }

    pub fn msg_type(&self) -> &str {
        &self.msg_type
    }

    pub fn sender(&self) -> u32 {
        self.sender
    }

    pub fn receiver(&self) -> &Recipient {
        &self.receiver
    }
}

impl From<Message> for proto::WireMessage {
    fn from(message: Message) -> Self {
        Self {
            msg_type: message.msg_type,
            sender: message.sender,
            receiver: message.receiver.to_wire(),
            params: message
                .params
                .into_iter()
                .map(|p| proto::Param {
                    key: p.key,
                    value: p.value.to_vec(),
                })
                .collect(),
        }
    }
}

impl From<proto::WireMessage> for Message {
    fn from(wire: proto::WireMessage) -> Self {
        Self {
            msg_type: wire.msg_type,
            sender: wire.sender,
            receiver: Recipient::from_wire(&wire.receiver),
            params: wire
                .params
                .into_iter()
                .map(|p| Param {
                    key: p.key,
                    value: Bytes::from(p.value),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_order_preserved() {
        let message = Message::new("grad", 0, 1)
            .add_param("layer0", vec![1u8])
            .add_param("layer1", vec![2u8])
            .add_param("layer2", vec![3u8]);

        let keys: Vec<_> = message.params().iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["layer0", "layer1", "layer2"]);
    }

    #[test]
    fn test_add_param_replaces_in_place() {
        let message = Message::new("grad", 0, 1)
            .add_param("a", vec![1u8])
            .add_param("b", vec![2u8])
            .add_param("a", vec![9u8]);

        let keys: Vec<_> = message.params().iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(message.param("a").unwrap().as_ref(), &[9u8]);
    }

    #[test]
    fn test_recipient_resolution() {
        assert_eq!(Recipient::Rank(3).node_name(), node_name(3));
        let named = Recipient::Node(node_name(5));
        assert_eq!(named.node_name(), node_name(5));
    }

    #[test]
    fn test_wire_roundtrip() {
        let message = Message::new("ping", 0, 1).add_param("payload", vec![7u8, 8, 9]);

        let wire: proto::WireMessage = message.clone().into();
        assert_eq!(wire.receiver, "1");

        let back = Message::from(wire);
        assert_eq!(back, message);
    }

    #[test]
    fn test_wire_receiver_node_name() {
        let message = Message::new("ping", 0, node_name(4));
        let wire: proto::WireMessage = message.into();
        assert_eq!(wire.receiver, "worker4");

        let back = Message::from(wire);
        // Node names survive the trip without being mistaken for ranks.
        assert_eq!(back.receiver().node_name(), node_name(4));
    }

    #[test]
    fn test_unknown_type_is_still_a_message() {
        let wire = proto::WireMessage {
            msg_type: String::new(),
            sender: 2,
            receiver: "0".to_string(),
            params: vec![],
        };
        let message = Message::from(wire);
        assert_eq!(message.msg_type(), "");
        assert_eq!(message.sender(), 2);
    }
}
