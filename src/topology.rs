//! Rank to node mapping
//!
//! Two ranks with the same node id communicate on-node; everything else is
//! off-node. The mapping is built once before the run and shared read-only.

use crate::error::{AppError, Result};
use crate::types::{Locality, NodeId};
use serde::Serialize;
use std::ffi::OsString;

/// Node id of every rank, indexed by rank
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankTopology {
    node_ids: Vec<NodeId>,
}

impl RankTopology {
    /// Build from an explicit per-rank list
    pub fn from_node_ids(node_ids: Vec<NodeId>) -> Result<Self> {
        if node_ids.is_empty() {
            return Err(AppError::validation("Topology needs at least one rank"));
        }
        Ok(Self { node_ids })
    }

    /// Consecutive blocks of `ranks_per_node` ranks share a node
    pub fn blocked(num_ranks: usize, ranks_per_node: usize) -> Result<Self> {
        if ranks_per_node == 0 {
            return Err(AppError::validation("ranks per node must be greater than 0"));
        }
        let node_ids = (0..num_ranks).map(|rank| (rank / ranks_per_node) as NodeId).collect();
        Self::from_node_ids(node_ids)
    }

    /// Every rank on its own node
    pub fn one_rank_per_node(num_ranks: usize) -> Result<Self> {
        Self::blocked(num_ranks, 1)
    }

    /// Every rank on the same node
    pub fn single_node(num_ranks: usize) -> Result<Self> {
        Self::from_node_ids(vec![0; num_ranks])
    }

    pub fn num_ranks(&self) -> usize {
        self.node_ids.len()
    }

    pub fn node_id(&self, rank: usize) -> Option<NodeId> {
        self.node_ids.get(rank).copied()
    }

    pub fn node_ids(&self) -> &[NodeId] {
        &self.node_ids
    }

    /// True when both ranks sit on the same node
    pub fn is_local(&self, a: usize, b: usize) -> bool {
        match (self.node_id(a), self.node_id(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    pub fn locality(&self, a: usize, b: usize) -> Locality {
        Locality::from_same_node(self.is_local(a, b))
    }

    /// Number of distinct nodes
    pub fn num_nodes(&self) -> usize {
        let mut ids = self.node_ids.clone();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    /// Mapping listing in the `#Task Rank, node_ids` format
    pub fn mapping_listing(&self) -> String {
        let mut out = String::from("#Task Rank, node_ids\n");
        for (rank, node) in self.node_ids.iter().enumerate() {
            out.push_str(&format!("{}, {}\n", rank, node));
        }
        out
    }
}

/// Node id made of all the digits in a host name, e.g. `nid00123` -> 123
///
/// Host names without digits map to node 0.
pub fn node_id_from_hostname(hostname: &str) -> Result<NodeId> {
    let digits: String = hostname.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return Ok(0);
    }
    digits
        .parse::<NodeId>()
        .map_err(|e| AppError::parse(format!("Node id from host name '{}' out of range: {}", hostname, e)))
}

/// Node id from a host name as the operating system reports it
pub fn node_id_from_os_hostname(hostname: OsString) -> Result<NodeId> {
    let hostname = hostname
        .into_string()
        .map_err(|raw| AppError::config(format!("Host name {:?} is not valid UTF-8", raw)))?;
    let hostname = hostname.trim();
    if hostname.is_empty() {
        return Err(AppError::config(
            "Host name is empty; pass --node-ids or --ranks-per-node to place the ranks",
        ));
    }
    node_id_from_hostname(hostname)
}

/// Node id of the machine this process runs on
pub fn local_node_id() -> Result<NodeId> {
    let hostname = hostname::get().map_err(|e| {
        AppError::config(format!(
            "Cannot read the host name ({}); pass --node-ids or --ranks-per-node to place the ranks",
            e
        ))
    })?;
    node_id_from_os_hostname(hostname)
}

/// Parse a comma separated node id list such as `0,0,1,1`
pub fn parse_node_ids(list: &str) -> Result<Vec<NodeId>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<NodeId>()
                .map_err(|e| AppError::parse(format!("Invalid node id '{}': {}", s, e)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_mapping() {
        let topology = RankTopology::from_node_ids(vec![0, 0, 1, 1]).unwrap();
        assert!(topology.is_local(0, 1));
        assert!(topology.is_local(2, 3));
        assert!(!topology.is_local(0, 2));
        assert!(!topology.is_local(1, 3));
        assert_eq!(topology.locality(0, 3), Locality::OffNode);
        assert_eq!(topology.num_nodes(), 2);
    }

    #[test]
    fn test_out_of_range_rank_is_not_local() {
        let topology = RankTopology::single_node(2).unwrap();
        assert!(topology.is_local(0, 1));
        assert!(!topology.is_local(0, 7));
    }

    #[test]
    fn test_blocked_mapping() {
        let topology = RankTopology::blocked(5, 2).unwrap();
        assert_eq!(topology.node_ids(), &[0, 0, 1, 1, 2]);
        assert!(RankTopology::blocked(4, 0).is_err());
        assert!(RankTopology::from_node_ids(vec![]).is_err());
    }

    #[test]
    fn test_hostname_digits() {
        assert_eq!(node_id_from_hostname("nid00123").unwrap(), 123);
        assert_eq!(node_id_from_hostname("c1-0c2s3n1").unwrap(), 10231);
        assert_eq!(node_id_from_hostname("login").unwrap(), 0);
        assert!(node_id_from_hostname("n99999999999999999999").is_err());
    }

    #[test]
    fn test_hostname_digits_beyond_u32() {
        assert_eq!(node_id_from_hostname("cn-20241018-0042").unwrap(), 202410180042);
        assert_eq!(node_id_from_hostname("node18446744073709551615").unwrap(), u64::MAX);
    }

    #[test]
    fn test_os_hostname() {
        assert_eq!(node_id_from_os_hostname(OsString::from("nid00017\n")).unwrap(), 17);
        assert!(matches!(
            node_id_from_os_hostname(OsString::from("")),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            node_id_from_os_hostname(OsString::from("  ")),
            Err(AppError::Config(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_os_hostname_rejects_invalid_utf8() {
        use std::os::unix::ffi::OsStringExt;
        let raw = OsString::from_vec(vec![b'n', 0xff, b'1']);
        assert!(matches!(node_id_from_os_hostname(raw), Err(AppError::Config(_))));
    }

    #[test]
    fn test_local_node_id_matches_system_host_name() {
        let system = hostname::get().unwrap();
        assert_eq!(local_node_id().ok(), node_id_from_os_hostname(system).ok());
    }

    #[test]
    fn test_parse_node_ids() {
        assert_eq!(parse_node_ids("0, 0,1,1").unwrap(), vec![0, 0, 1, 1]);
        assert!(parse_node_ids("0,x").is_err());
    }

    #[test]
    fn test_mapping_listing() {
        let topology = RankTopology::from_node_ids(vec![4, 7]).unwrap();
        assert_eq!(topology.mapping_listing(), "#Task Rank, node_ids\n0, 4\n1, 7\n");
    }
}
