//! NUMA node balancing.
//!
//! Instances with `limits.cpu.nodes=balanced` get assigned the least-used
//! NUMA node(s) at start. Selection reads the pinning of every other local
//! instance, so it runs under a process-wide mutex.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::{CaskError, Result};

/// Serialises NUMA node selection across concurrent starts.
pub static NUMA_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Host CPU topology as the balancer sees it.
#[derive(Debug, Clone)]
pub struct CpuTopology {
    pub total_cpus: u32,
    /// NUMA node ids present on the host.
    pub nodes: Vec<u64>,
}

impl CpuTopology {
    /// Probe `/sys/devices/system/node`. Falls back to a single node with
    /// the scheduler-visible CPU count.
    pub fn detect() -> Self {
        let mut nodes = Vec::new();

        if let Ok(entries) = std::fs::read_dir("/sys/devices/system/node") {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(id) = name.strip_prefix("node").and_then(|n| n.parse::<u64>().ok()) {
                    nodes.push(id);
                }
            }
        }

        if nodes.is_empty() {
            nodes.push(0);
        }

        nodes.sort_unstable();

        let total_cpus = std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1);

        Self { total_cpus, nodes }
    }
}

/// Parse a node set such as `0,2-3` into node ids.
pub fn parse_node_set(value: &str) -> Result<Vec<u64>> {
    let mut nodes = Vec::new();

    for part in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            None => {
                nodes.push(part.parse::<u64>().map_err(|_| {
                    CaskError::BadRequest(format!("Invalid NUMA node set {:?}", value))
                })?);
            }
            Some((start, end)) => {
                let start = start.parse::<u64>().map_err(|_| {
                    CaskError::BadRequest(format!("Invalid NUMA node set {:?}", value))
                })?;
                let end = end.parse::<u64>().map_err(|_| {
                    CaskError::BadRequest(format!("Invalid NUMA node set {:?}", value))
                })?;

                if start > end {
                    return Err(CaskError::BadRequest(format!(
                        "Invalid NUMA node set {:?}",
                        value
                    )));
                }

                nodes.extend(start..=end);
            }
        }
    }

    Ok(nodes)
}

/// Pick the node set for an instance given per-node usage counts.
///
/// Nodes sort by ascending usage with node id as the tie-break. When
/// `limits.cpu` exceeds the CPUs available per node, enough of the
/// least-used nodes are taken to cover it.
pub fn pick_nodes(
    topology: &CpuTopology,
    usage: &HashMap<u64, usize>,
    limits_cpu: Option<u32>,
) -> Vec<u64> {
    if topology.nodes.len() == 1 {
        return vec![topology.nodes[0]];
    }

    let mut nodes = topology.nodes.clone();
    nodes.sort_by_key(|n| (usage.get(n).copied().unwrap_or(0), *n));

    let cpus_per_node = (topology.total_cpus as usize / topology.nodes.len()).max(1) as u32;

    if let Some(limit) = limits_cpu {
        if limit > cpus_per_node {
            let wanted = (limit as usize).div_ceil(cpus_per_node as usize);
            return nodes.into_iter().take(wanted.min(topology.nodes.len())).collect();
        }
    }

    vec![nodes[0]]
}

/// Render a node list into the `volatile.cpu.nodes` value.
pub fn format_nodes(nodes: &[u64]) -> String {
    nodes.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology(total_cpus: u32, nodes: &[u64]) -> CpuTopology {
        CpuTopology { total_cpus, nodes: nodes.to_vec() }
    }

    #[test]
    fn test_parse_node_set() {
        assert_eq!(parse_node_set("0").unwrap(), vec![0]);
        assert_eq!(parse_node_set("0,2-3").unwrap(), vec![0, 2, 3]);
        assert!(parse_node_set("3-1").is_err());
        assert!(parse_node_set("x").is_err());
    }

    #[test]
    fn test_single_node_shortcut() {
        let usage = HashMap::new();
        assert_eq!(pick_nodes(&topology(8, &[0]), &usage, Some(16)), vec![0]);
    }

    #[test]
    fn test_least_used_node_wins() {
        let mut usage = HashMap::new();
        usage.insert(0u64, 3usize);
        usage.insert(1u64, 1usize);

        assert_eq!(pick_nodes(&topology(8, &[0, 1]), &usage, None), vec![1]);
    }

    #[test]
    fn test_large_limit_spans_nodes() {
        // 16 CPUs across 2 nodes: 8 per node; limits.cpu=12 needs 2 nodes.
        let usage = HashMap::new();
        let picked = pick_nodes(&topology(16, &[0, 1]), &usage, Some(12));
        assert_eq!(picked.len(), 2);

        // limits.cpu within one node picks a single node.
        let picked = pick_nodes(&topology(16, &[0, 1]), &usage, Some(4));
        assert_eq!(picked.len(), 1);
    }

    #[test]
    fn test_format_nodes() {
        assert_eq!(format_nodes(&[0, 2]), "0,2");
    }
}
