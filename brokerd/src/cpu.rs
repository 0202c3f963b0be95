//! CPU Topology (SPEC_FULL.md §4.4): per-NUMA-node CPU lists with
//! round-robin affinity assignment. No `numa` crate is in the
//! teacher's dependency graph, so this reads the same sysfs text
//! files the teacher's collectors read elsewhere (`collectors/psi.rs`
//! in the teacher parses `key=value` sysfs text the same way).

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use anyhow::Result;

#[derive(Debug, Clone)]
pub struct CpuTopologyRoots {
    pub node_dir: PathBuf,
    pub online_cpus_file: PathBuf,
}

impl Default for CpuTopologyRoots {
    fn default() -> Self {
        Self {
            node_dir: PathBuf::from("/sys/devices/system/node"),
            online_cpus_file: PathBuf::from("/sys/devices/system/cpu/online"),
        }
    }
}

struct NodeCpus {
    cpus: Vec<u16>,
    next: Cell<usize>,
}

pub struct CpuTopology {
    nodes: BTreeMap<u32, NodeCpus>,
}

impl CpuTopology {
    /// Builds the topology from sysfs. If no NUMA node directories are
    /// found, falls back to a single node owning every online CPU id,
    /// per spec.md §4.4 and the environmental-fallback policy in
    /// SPEC_FULL.md §8 ("NUMA unavailable... falling back to one node
    /// with all CPUs").
    pub fn discover(roots: &CpuTopologyRoots) -> Result<Self> {
        let mut nodes = BTreeMap::new();

        let node_entries = fs::read_dir(&roots.node_dir).ok();
        if let Some(entries) = node_entries {
            for entry in entries.filter_map(|e| e.ok()) {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let Some(idx_str) = name.strip_prefix("node") else { continue };
                let Ok(idx) = idx_str.parse::<u32>() else { continue };
                let cpulist_path = entry.path().join("cpulist");
                if let Ok(contents) = fs::read_to_string(&cpulist_path) {
                    let cpus = parse_cpu_list(contents.trim());
                    nodes.insert(idx, NodeCpus { cpus, next: Cell::new(0) });
                }
            }
        }

        if nodes.is_empty() {
            let cpus = fs::read_to_string(&roots.online_cpus_file)
                .map(|s| parse_cpu_list(s.trim()))
                .unwrap_or_else(|_| vec![0]);
            nodes.insert(0, NodeCpus { cpus, next: Cell::new(0) });
        }

        Ok(Self { nodes })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the next CPU id for `node` in round-robin order,
    /// advancing the node's cursor. Falls back to node 0 if `node`
    /// does not exist (e.g. a device's `numa_node` exceeds the node
    /// count actually present on this host).
    pub fn affinity(&self, node: u32) -> u16 {
        let entry = self.nodes.get(&node).or_else(|| self.nodes.values().next());
        let Some(entry) = entry else { return 0 };
        if entry.cpus.is_empty() {
            return 0;
        }
        let idx = entry.next.get();
        let cpu = entry.cpus[idx % entry.cpus.len()];
        entry.next.set((idx + 1) % entry.cpus.len());
        cpu
    }
}

/// Parses a Linux cpulist/bitmap string like `0-3,8,10-11`.
fn parse_cpu_list(s: &str) -> Vec<u16> {
    let mut out = Vec::new();
    for part in s.split(',').filter(|p| !p.is_empty()) {
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<u16>(), hi.parse::<u16>()) {
                out.extend(lo..=hi);
            }
        } else if let Ok(v) = part.parse::<u16>() {
            out.push(v);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ranges_and_singletons() {
        assert_eq!(parse_cpu_list("0-3,8,10-11"), vec![0, 1, 2, 3, 8, 10, 11]);
    }

    #[test]
    fn falls_back_to_single_node_when_no_numa_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let roots = CpuTopologyRoots {
            node_dir: tmp.path().join("nonexistent"),
            online_cpus_file: tmp.path().join("online"),
        };
        fs::write(&roots.online_cpus_file, "0-3\n").unwrap();
        let topo = CpuTopology::discover(&roots).unwrap();
        assert_eq!(topo.node_count(), 1);
        assert_eq!(topo.affinity(0), 0);
        assert_eq!(topo.affinity(0), 1);
    }

    #[test]
    fn round_robins_within_a_node() {
        let tmp = tempfile::tempdir().unwrap();
        let node0 = tmp.path().join("node0");
        fs::create_dir_all(&node0).unwrap();
        fs::write(node0.join("cpulist"), "0-1\n").unwrap();
        let roots = CpuTopologyRoots { node_dir: tmp.path().to_path_buf(), online_cpus_file: tmp.path().join("online") };
        let topo = CpuTopology::discover(&roots).unwrap();
        assert_eq!(topo.affinity(0), 0);
        assert_eq!(topo.affinity(0), 1);
        assert_eq!(topo.affinity(0), 0);
    }

    #[test]
    fn discovers_multiple_nodes_independently() {
        let tmp = tempfile::tempdir().unwrap();
        for (node, list) in [("node0", "0-1"), ("node1", "2-3")] {
            let dir = tmp.path().join(node);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("cpulist"), list).unwrap();
        }
        let roots = CpuTopologyRoots { node_dir: tmp.path().to_path_buf(), online_cpus_file: tmp.path().join("online") };
        let topo = CpuTopology::discover(&roots).unwrap();
        assert_eq!(topo.node_count(), 2);
        assert_eq!(topo.affinity(1), 2);
    }
}
