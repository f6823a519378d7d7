// bus-core/src/addressing.rs

//! Rank-to-node-name addressing.
//!
//! Every process in the world derives its transport-level name from its rank
//! with the same rule, so sender and receiver always agree on how a rank is
//! addressed.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Prefix shared by all worker node names.
pub(crate) const WORKER_PREFIX: &str = "worker";

/// Transport-addressable name of a worker, derived from its rank.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeName(String);

impl NodeName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn from_raw(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<u32> for NodeName {
    fn from(rank: u32) -> Self {
        node_name(rank)
    }
}

/// Maps a rank to its node name.
///
/// Pure and total over all ranks; distinct ranks never collide on a name.
pub fn node_name(rank: u32) -> NodeName {
    NodeName(format!("{WORKER_PREFIX}{rank}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_name_deterministic() {
        assert_eq!(node_name(0), node_name(0));
        assert_eq!(node_name(0).as_str(), "worker0");
        assert_eq!(node_name(42).as_str(), "worker42");
    }

    #[test]
    fn test_node_name_injective() {
        let names: Vec<_> = (0..128).map(node_name).collect();
        for (i, a) in names.iter().enumerate() {
            for b in names.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_node_name_display() {
        assert_eq!(node_name(7).to_string(), "worker7");
    }
}
