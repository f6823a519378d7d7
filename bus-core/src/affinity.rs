// bus-core/src/affinity.rs

//! Accelerator affinity mapping between ranks.
//!
//! When cross-process device-to-device transfer is enabled, the transport is
//! hinted with which local accelerator index corresponds to which remote
//! index on every peer. The pairing is computed once at bootstrap from a
//! per-rank device-index table supplied by an external collaborator.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::addressing::{node_name, NodeName};
use crate::config::AffinityConfig;
use crate::error::{BusError, Result};

/// For each peer node name, the local-device-index to remote-device-index
/// pairing used as a zero-copy transfer hint.
pub type DeviceAffinityMap = HashMap<NodeName, HashMap<u32, u32>>;

/// Default device pairing applied when affinity is enabled but no per-rank
/// table was supplied.
///
/// Makes the degrade-gracefully behavior a visible contract instead of a
/// hard-coded literal inside the bootstrap path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AffinityFallback {
    pub peer_rank: u32,
    pub local_device: u32,
    pub remote_device: u32,
}

impl Default for AffinityFallback {
    fn default() -> Self {
        Self {
            peer_rank: 1,
            local_device: 5,
            remote_device: 5,
        }
    }
}

impl AffinityFallback {
    /// The single-entry map this policy stands in for.
    pub fn to_map(&self) -> DeviceAffinityMap {
        let mut map = DeviceAffinityMap::new();
        map.insert(
            node_name(self.peer_rank),
            HashMap::from([(self.local_device, self.remote_device)]),
        );
        map
    }
}

/// Builds the affinity map for `self_rank` from a rank -> device-index table.
///
/// Every rank other than `self_rank` gets one single-pair entry keyed by its
/// node name. The table must contain an entry for `self_rank` itself; a
/// missing own entry leaves nothing to pair against and is a fatal
/// configuration error.
pub fn build_affinity_map(
    self_rank: u32,
    table: &HashMap<u32, u32>,
) -> Result<DeviceAffinityMap> {
    let local_device = *table.get(&self_rank).ok_or_else(|| {
        BusError::config(format!(
            "device affinity table has no entry for own rank {self_rank}"
        ))
    })?;

    let mut map = DeviceAffinityMap::new();
    for (&rank, &device) in table {
        if rank != self_rank {
            map.insert(node_name(rank), HashMap::from([(local_device, device)]));
        }
    }
    Ok(map)
}

/// Resolves the affinity hints for a bootstrap, if any.
///
/// Disabled affinity attaches no mapping (host-memory-only transfer). Enabled
/// affinity without a table falls back to the configured [`AffinityFallback`].
pub fn resolve_affinity(
    config: &AffinityConfig,
    self_rank: u32,
) -> Result<Option<DeviceAffinityMap>> {
    if !config.enabled {
        return Ok(None);
    }
    match config.device_table() {
        Some(table) => build_affinity_map(self_rank, &table).map(Some),
        None => Ok(Some(config.fallback.to_map())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceTableEntry;

    #[test]
    fn test_affinity_map_pairs_against_own_device() {
        let table = HashMap::from([(0, 3), (1, 7)]);
        let map = build_affinity_map(0, &table).unwrap();

        assert_eq!(map.len(), 1);
        assert_eq!(map[&node_name(1)], HashMap::from([(3, 7)]));
    }

    #[test]
    fn test_affinity_map_excludes_self() {
        let table = HashMap::from([(0, 0), (1, 1), (2, 2)]);
        let map = build_affinity_map(1, &table).unwrap();

        assert!(!map.contains_key(&node_name(1)));
        assert_eq!(map[&node_name(0)], HashMap::from([(1, 0)]));
        assert_eq!(map[&node_name(2)], HashMap::from([(1, 2)]));
    }

    #[test]
    fn test_missing_own_rank_is_config_error() {
        let table = HashMap::from([(1, 7)]);
        let err = build_affinity_map(0, &table).unwrap_err();
        assert!(matches!(err, BusError::Config { .. }));
    }

    #[test]
    fn test_fallback_map() {
        let fallback = AffinityFallback::default();
        let map = fallback.to_map();
        assert_eq!(map[&node_name(1)], HashMap::from([(5, 5)]));
    }

    #[test]
    fn test_resolve_disabled_attaches_nothing() {
        let config = AffinityConfig::default();
        assert!(resolve_affinity(&config, 0).unwrap().is_none());
    }

    #[test]
    fn test_resolve_enabled_without_table_uses_fallback() {
        let config = AffinityConfig {
            enabled: true,
            ..Default::default()
        };
        let map = resolve_affinity(&config, 0).unwrap().unwrap();
        assert_eq!(map, config.fallback.to_map());
    }

    #[test]
    fn test_resolve_enabled_with_table() {
        let config = AffinityConfig {
            enabled: true,
            table: Some(vec![
                DeviceTableEntry { rank: 0, device: 3 },
                DeviceTableEntry { rank: 1, device: 7 },
            ]),
            ..Default::default()
        };
        let map = resolve_affinity(&config, 0).unwrap().unwrap();
        assert_eq!(map[&node_name(1)], HashMap::from([(3, 7)]));
    }
}
