// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # CPU topology model
//!
//! A static description of the machine's CPU hierarchy (NUMA node ->
//! socket -> uncore-cache domain -> physical core -> hardware thread),
//! built once from hardware discovery and read-only thereafter. The
//! allocator never mutates a `CpuTopology`, so concurrent readers need no
//! synchronization.
//!
//! The topology can be populated either from sysfs via [`discover_cpus`]
//! or from a caller-supplied list of [`DiscoveredCpu`] records (the unit
//! tests do the latter).

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use glob::glob;
use log::info;
use sscanf::sscanf;

use crate::cpuset::CpuSet;

/// Sentinel uncore-cache id in raw discovery data meaning the last-level
/// cache id could not be determined. A single undefined id disables
/// uncore-cache accounting for the whole topology.
pub const UNCORE_CACHE_ID_UNDEFINED: i64 = -1;

/// Raw per-CPU record produced by hardware discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredCpu {
    pub cpu_id: usize,
    /// Globally unique physical core id (not the per-socket sysfs core_id).
    pub core_id: usize,
    pub socket_id: usize,
    pub numa_node_id: usize,
    pub uncore_cache_id: i64,
}

/// Options threaded through topology construction.
#[derive(Debug, Clone, Default)]
pub struct TopologyOptions {
    /// Account for uncore-cache (last-level cache) domains so the
    /// allocator can claim whole domains. When false, the uncore-cache
    /// count is forced to zero and the grouping is non-discriminating
    /// everywhere downstream.
    pub prefer_align_by_uncore_cache: bool,
}

/// Location of one hardware thread within the hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfo {
    pub core_id: usize,
    pub socket_id: usize,
    pub numa_node_id: usize,
    pub uncore_cache_id: usize,
}

/// Mapping from CPU id to its place in the hierarchy, with pure query
/// primitives over arbitrary CPU subsets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuDetails {
    map: BTreeMap<usize, CpuInfo>,
}

impl CpuDetails {
    /// Restrict the details to the CPUs present in `cpus`.
    pub fn keep_only(&self, cpus: &CpuSet) -> CpuDetails {
        CpuDetails {
            map: self
                .map
                .iter()
                .filter(|(cpu, _)| cpus.contains(**cpu))
                .map(|(cpu, info)| (*cpu, *info))
                .collect(),
        }
    }

    /// All CPU ids present in the details.
    pub fn cpus(&self) -> CpuSet {
        self.map.keys().copied().collect()
    }

    /// NUMA node ids present in the details, ascending.
    pub fn numa_nodes(&self) -> Vec<usize> {
        self.ids(|info| info.numa_node_id)
    }

    /// Socket ids present in the details, ascending.
    pub fn sockets(&self) -> Vec<usize> {
        self.ids(|info| info.socket_id)
    }

    /// Uncore-cache ids present in the details, ascending.
    pub fn uncore_caches(&self) -> Vec<usize> {
        self.ids(|info| info.uncore_cache_id)
    }

    /// Core ids present in the details, ascending.
    pub fn cores(&self) -> Vec<usize> {
        self.ids(|info| info.core_id)
    }

    pub fn cpus_in_numa_nodes(&self, ids: &[usize]) -> CpuSet {
        self.cpus_matching(|info| ids.contains(&info.numa_node_id))
    }

    pub fn cpus_in_sockets(&self, ids: &[usize]) -> CpuSet {
        self.cpus_matching(|info| ids.contains(&info.socket_id))
    }

    pub fn cpus_in_uncore_caches(&self, ids: &[usize]) -> CpuSet {
        self.cpus_matching(|info| ids.contains(&info.uncore_cache_id))
    }

    pub fn cpus_in_cores(&self, ids: &[usize]) -> CpuSet {
        self.cpus_matching(|info| ids.contains(&info.core_id))
    }

    /// Core ids with at least one CPU inside the given uncore caches,
    /// ascending.
    pub fn cores_in_uncore_caches(&self, ids: &[usize]) -> Vec<usize> {
        let set: BTreeSet<usize> = self
            .map
            .values()
            .filter(|info| ids.contains(&info.uncore_cache_id))
            .map(|info| info.core_id)
            .collect();
        set.into_iter().collect()
    }

    fn ids(&self, key: impl Fn(&CpuInfo) -> usize) -> Vec<usize> {
        let set: BTreeSet<usize> = self.map.values().map(key).collect();
        set.into_iter().collect()
    }

    fn cpus_matching(&self, pred: impl Fn(&CpuInfo) -> bool) -> CpuSet {
        self.map
            .iter()
            .filter(|(_, info)| pred(info))
            .map(|(cpu, _)| *cpu)
            .collect()
    }
}

/// Immutable description of the machine's CPU hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuTopology {
    pub num_cpus: usize,
    pub num_cores: usize,
    pub num_sockets: usize,
    pub num_numa_nodes: usize,
    /// Zero when uncore-cache accounting is disabled.
    pub num_uncore_caches: usize,
    pub cpu_details: CpuDetails,
}

impl CpuTopology {
    /// Validate raw discovery data and build the topology. Fails if the
    /// data is empty, contains duplicate CPU ids, places one core in more
    /// than one socket/NUMA node/uncore cache, or claims one uncore cache
    /// for cores in different sockets. Any such inconsistency is fatal to
    /// the caller; there is no degraded mode.
    pub fn new(cpus: &[DiscoveredCpu], opts: &TopologyOptions) -> Result<CpuTopology> {
        if cpus.is_empty() {
            bail!("topology discovery produced no CPUs");
        }

        let uncore_enabled = opts.prefer_align_by_uncore_cache
            && cpus.iter().all(|cpu| cpu.uncore_cache_id >= 0);

        let mut map = BTreeMap::new();
        let mut core_homes: BTreeMap<usize, (usize, usize, usize)> = BTreeMap::new();
        let mut cache_sockets: BTreeMap<usize, usize> = BTreeMap::new();
        for cpu in cpus {
            let uncore_cache_id = if uncore_enabled {
                cpu.uncore_cache_id as usize
            } else {
                0
            };
            let info = CpuInfo {
                core_id: cpu.core_id,
                socket_id: cpu.socket_id,
                numa_node_id: cpu.numa_node_id,
                uncore_cache_id,
            };
            if map.insert(cpu.cpu_id, info).is_some() {
                bail!("duplicate CPU id {} in topology discovery data", cpu.cpu_id);
            }

            let home = (cpu.socket_id, cpu.numa_node_id, uncore_cache_id);
            match core_homes.get(&cpu.core_id) {
                Some(prev) if *prev != home => {
                    bail!(
                        "core {} spans multiple sockets, NUMA nodes or uncore caches",
                        cpu.core_id
                    );
                }
                Some(_) => {}
                None => {
                    core_homes.insert(cpu.core_id, home);
                }
            }

            if uncore_enabled {
                match cache_sockets.get(&uncore_cache_id) {
                    Some(socket) if *socket != cpu.socket_id => {
                        bail!(
                            "uncore cache {} claimed by cores in sockets {} and {}",
                            uncore_cache_id,
                            socket,
                            cpu.socket_id
                        );
                    }
                    Some(_) => {}
                    None => {
                        cache_sockets.insert(uncore_cache_id, cpu.socket_id);
                    }
                }
            }
        }

        let details = CpuDetails { map };
        let topo = CpuTopology {
            num_cpus: cpus.len(),
            num_cores: details.cores().len(),
            num_sockets: details.sockets().len(),
            num_numa_nodes: details.numa_nodes().len(),
            num_uncore_caches: if uncore_enabled {
                details.uncore_caches().len()
            } else {
                0
            },
            cpu_details: details,
        };
        info!(
            "CPU topology: cpus={} cores={} sockets={} numa_nodes={} uncore_caches={}",
            topo.num_cpus,
            topo.num_cores,
            topo.num_sockets,
            topo.num_numa_nodes,
            topo.num_uncore_caches
        );
        Ok(topo)
    }

    /// Discover the topology from sysfs.
    pub fn discover(opts: &TopologyOptions) -> Result<CpuTopology> {
        CpuTopology::new(&discover_cpus()?, opts)
    }

    pub fn cpus_per_core(&self) -> usize {
        self.num_cpus / self.num_cores
    }

    pub fn cpus_per_socket(&self) -> usize {
        self.num_cpus / self.num_sockets
    }

    /// Zero when uncore-cache accounting is disabled.
    pub fn cpus_per_uncore_cache(&self) -> usize {
        if self.num_uncore_caches == 0 {
            return 0;
        }
        self.num_cpus / self.num_uncore_caches
    }
}

fn read_file_usize(path: &Path) -> Result<usize> {
    let val = match std::fs::read_to_string(path) {
        Ok(val) => val,
        Err(_) => {
            bail!("Failed to open or read file {:?}", path);
        }
    };

    val.trim()
        .parse::<usize>()
        .with_context(|| format!("Failed to parse {:?} from {:?}", val.trim(), path))
}

/// Enumerate the CPUs of this machine from sysfs.
///
/// Walks `/sys/devices/system/node/node*/cpu*`, reading the socket and
/// core ids from each CPU's `topology/` directory and the last-level
/// cache id from `cache/index3/id`. A missing cache id yields
/// [`UNCORE_CACHE_ID_UNDEFINED`] rather than an error since kernels
/// without cacheinfo support still have a usable core topology. Sysfs
/// core ids are only unique within a socket, so cores are renumbered
/// globally, in ascending CPU id order for determinism.
pub fn discover_cpus() -> Result<Vec<DiscoveredCpu>> {
    struct RawCpu {
        socket_id: usize,
        raw_core_id: usize,
        numa_node_id: usize,
        uncore_cache_id: i64,
    }

    let mut raw: BTreeMap<usize, RawCpu> = BTreeMap::new();

    let numa_paths = glob("/sys/devices/system/node/node*")?;
    for numa_path in numa_paths.filter_map(Result::ok) {
        let numa_str = numa_path.to_string_lossy();
        let node_id = match sscanf!(numa_str.trim(), "/sys/devices/system/node/node{usize}") {
            Ok(val) => val,
            Err(_) => {
                bail!("Failed to parse NUMA node ID {}", numa_str.trim());
            }
        };

        let cpu_pattern = numa_path.join("cpu[0-9]*");
        let cpu_paths = glob(cpu_pattern.to_string_lossy().as_ref())?;
        for cpu_path in cpu_paths.filter_map(Result::ok) {
            let cpu_str = cpu_path.to_string_lossy();
            let cpu_id = match sscanf!(
                cpu_str.trim(),
                "/sys/devices/system/node/node{usize}/cpu{usize}"
            ) {
                Ok((_, val)) => val,
                Err(_) => {
                    bail!("Failed to parse cpu ID {}", cpu_str.trim());
                }
            };

            let top_path = cpu_path.join("topology");
            let socket_id = read_file_usize(&top_path.join("physical_package_id"))?;
            let raw_core_id = read_file_usize(&top_path.join("core_id"))?;

            // L3 cache id, if the kernel exposes cacheinfo.
            let cache_path = cpu_path.join("cache").join("index3").join("id");
            let uncore_cache_id = read_file_usize(&cache_path)
                .map(|id| id as i64)
                .unwrap_or(UNCORE_CACHE_ID_UNDEFINED);

            if raw
                .insert(
                    cpu_id,
                    RawCpu {
                        socket_id,
                        raw_core_id,
                        numa_node_id: node_id,
                        uncore_cache_id,
                    },
                )
                .is_some()
            {
                bail!("Found duplicate CPU ID {}", cpu_id);
            }
        }
    }

    let mut core_ids: BTreeMap<(usize, usize), usize> = BTreeMap::new();
    let mut cpus = Vec::with_capacity(raw.len());
    for (cpu_id, cpu) in raw.iter() {
        let next_core_id = core_ids.len();
        let core_id = *core_ids
            .entry((cpu.socket_id, cpu.raw_core_id))
            .or_insert(next_core_id);
        cpus.push(DiscoveredCpu {
            cpu_id: *cpu_id,
            core_id,
            socket_id: cpu.socket_id,
            numa_node_id: cpu.numa_node_id,
            uncore_cache_id: cpu.uncore_cache_id,
        });
    }

    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(
        cpu_id: usize,
        core_id: usize,
        socket_id: usize,
        numa_node_id: usize,
        uncore_cache_id: i64,
    ) -> DiscoveredCpu {
        DiscoveredCpu {
            cpu_id,
            core_id,
            socket_id,
            numa_node_id,
            uncore_cache_id,
        }
    }

    fn uncore_opts() -> TopologyOptions {
        TopologyOptions {
            prefer_align_by_uncore_cache: true,
        }
    }

    // 1 socket, 1 NUMA node, 2 uncore caches, 4 cores, 2 threads/core.
    // Thread siblings are (0,4) (1,5) (2,6) (3,7).
    fn single_socket_uncore_cpus() -> Vec<DiscoveredCpu> {
        vec![
            cpu(0, 0, 0, 0, 0),
            cpu(1, 1, 0, 0, 0),
            cpu(2, 2, 0, 0, 1),
            cpu(3, 3, 0, 0, 1),
            cpu(4, 0, 0, 0, 0),
            cpu(5, 1, 0, 0, 0),
            cpu(6, 2, 0, 0, 1),
            cpu(7, 3, 0, 0, 1),
        ]
    }

    #[test]
    fn test_construction_counts() {
        let topo = CpuTopology::new(&single_socket_uncore_cpus(), &uncore_opts()).unwrap();
        assert_eq!(topo.num_cpus, 8);
        assert_eq!(topo.num_cores, 4);
        assert_eq!(topo.num_sockets, 1);
        assert_eq!(topo.num_numa_nodes, 1);
        assert_eq!(topo.num_uncore_caches, 2);
        assert_eq!(topo.cpus_per_core(), 2);
        assert_eq!(topo.cpus_per_socket(), 8);
        assert_eq!(topo.cpus_per_uncore_cache(), 4);
    }

    #[test]
    fn test_construction_is_input_order_independent() {
        let mut reversed = single_socket_uncore_cpus();
        reversed.reverse();
        assert_eq!(
            CpuTopology::new(&single_socket_uncore_cpus(), &uncore_opts()).unwrap(),
            CpuTopology::new(&reversed, &uncore_opts()).unwrap()
        );
    }

    #[test]
    fn test_details_queries() {
        let topo = CpuTopology::new(&single_socket_uncore_cpus(), &uncore_opts()).unwrap();
        let details = &topo.cpu_details;

        assert_eq!(details.cpus(), CpuSet::new(0..8));
        assert_eq!(details.cores(), vec![0, 1, 2, 3]);
        assert_eq!(details.uncore_caches(), vec![0, 1]);
        assert_eq!(details.cpus_in_cores(&[0]), CpuSet::new([0, 4]));
        assert_eq!(details.cpus_in_uncore_caches(&[1]), CpuSet::new([2, 3, 6, 7]));
        assert_eq!(details.cpus_in_sockets(&[0]), CpuSet::new(0..8));
        assert_eq!(details.cpus_in_numa_nodes(&[1]), CpuSet::default());
        assert_eq!(details.cores_in_uncore_caches(&[0]), vec![0, 1]);

        let narrowed = details.keep_only(&CpuSet::new([1, 3, 6]));
        assert_eq!(narrowed.cpus(), CpuSet::new([1, 3, 6]));
        assert_eq!(narrowed.cores(), vec![1, 2, 3]);
        assert_eq!(narrowed.cpus_in_uncore_caches(&[1]), CpuSet::new([3, 6]));
    }

    #[test]
    fn test_uncore_accounting_disabled_by_option() {
        let topo = CpuTopology::new(&single_socket_uncore_cpus(), &TopologyOptions::default())
            .unwrap();
        assert_eq!(topo.num_uncore_caches, 0);
        assert_eq!(topo.cpus_per_uncore_cache(), 0);
    }

    #[test]
    fn test_uncore_accounting_disabled_by_sentinel() {
        let mut cpus = single_socket_uncore_cpus();
        cpus[3].uncore_cache_id = UNCORE_CACHE_ID_UNDEFINED;
        let topo = CpuTopology::new(&cpus, &uncore_opts()).unwrap();
        assert_eq!(topo.num_uncore_caches, 0);
    }

    #[test]
    fn test_rejects_duplicate_cpu() {
        let mut cpus = single_socket_uncore_cpus();
        cpus.push(cpu(7, 3, 0, 0, 1));
        assert!(CpuTopology::new(&cpus, &uncore_opts()).is_err());
    }

    #[test]
    fn test_rejects_empty_topology() {
        assert!(CpuTopology::new(&[], &uncore_opts()).is_err());
    }

    #[test]
    fn test_rejects_core_spanning_uncore_caches() {
        let mut cpus = single_socket_uncore_cpus();
        // Second thread of core 0 claims a different cache.
        cpus[4].uncore_cache_id = 1;
        assert!(CpuTopology::new(&cpus, &uncore_opts()).is_err());
    }

    #[test]
    fn test_rejects_uncore_cache_spanning_sockets() {
        let cpus = vec![
            cpu(0, 0, 0, 0, 0),
            cpu(1, 1, 1, 1, 0),
        ];
        assert!(CpuTopology::new(&cpus, &uncore_opts()).is_err());
    }

    #[test]
    fn test_sentinel_inconsistency_is_ignored_when_disabled() {
        // With the option off, cache ids are not discriminating and an
        // inconsistent cache layout must not fail discovery.
        let mut cpus = single_socket_uncore_cpus();
        cpus[4].uncore_cache_id = 1;
        assert!(CpuTopology::new(&cpus, &TopologyOptions::default()).is_ok());
    }
}
