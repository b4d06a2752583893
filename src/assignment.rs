// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Topology-aware CPU picker
//!
//! Given the machine topology, the pool of currently free CPUs and a
//! requested CPU count, [`take_by_topology`] chooses the specific CPUs
//! that best preserve cache and memory locality. The descent is greedy
//! and strictly ordered: whole uncore-cache domains, then whole sockets
//! and NUMA nodes, then whole physical cores, then individual hardware
//! threads. At every level the most-consumed eligible group (smallest
//! free CPU count) is claimed first to avoid fragmenting larger groups,
//! with ties broken by ascending id so the result is deterministic.
//!
//! The computation is pure and stateless: it holds no shared state,
//! requires no locking, and identical inputs always produce the
//! identical CPU set.

use anyhow::Result;
use log::debug;
use thiserror::Error;

use crate::cpuset::CpuSet;
use crate::topology::CpuDetails;
use crate::topology::CpuTopology;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("not enough CPUs available to satisfy request: requested {requested}, available {available}")]
    InsufficientCpus { requested: usize, available: usize },
}

/// Which of the two outer hierarchy levels is claimed first in the
/// whole-group phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumaOrSocketsFirst {
    NumaFirst,
    SocketsFirst,
}

impl NumaOrSocketsFirst {
    /// Default ordering for a topology: claim NUMA nodes first when they
    /// are at least as large as sockets (one or more sockets per node),
    /// sockets first when sockets are subdivided into multiple nodes.
    pub fn for_topology(topo: &CpuTopology) -> NumaOrSocketsFirst {
        if topo.num_sockets >= topo.num_numa_nodes {
            NumaOrSocketsFirst::NumaFirst
        } else {
            NumaOrSocketsFirst::SocketsFirst
        }
    }
}

/// Choose exactly `num_cpus` CPUs from `available`, maximizing locality.
///
/// All-or-nothing: if the pool cannot satisfy the request the call fails
/// with [`AllocationError::InsufficientCpus`] and no partial result is
/// returned. Repeating an identical call yields an identical result (or
/// the identical error); the function has no side effects.
pub fn take_by_topology(
    topo: &CpuTopology,
    available: &CpuSet,
    num_cpus: usize,
    order: NumaOrSocketsFirst,
) -> Result<CpuSet> {
    let mut acc = CpuAccumulator::new(topo, available, num_cpus);
    if acc.is_failed() {
        return Err(AllocationError::InsufficientCpus {
            requested: num_cpus,
            available: available.size(),
        }
        .into());
    }
    if acc.is_satisfied() {
        return Ok(acc.result);
    }

    // Phase 1: whole uncore-cache domains, when accounting is enabled.
    if topo.num_uncore_caches > 0 {
        acc.take_full_uncore_caches();
        if acc.is_satisfied() {
            return Ok(acc.result);
        }
    }

    // Phase 2: whole NUMA nodes and whole sockets.
    match order {
        NumaOrSocketsFirst::NumaFirst => {
            acc.take_full_numa_nodes();
            if acc.is_satisfied() {
                return Ok(acc.result);
            }
            acc.take_full_sockets();
        }
        NumaOrSocketsFirst::SocketsFirst => {
            acc.take_full_sockets();
            if acc.is_satisfied() {
                return Ok(acc.result);
            }
            acc.take_full_numa_nodes();
        }
    }
    if acc.is_satisfied() {
        return Ok(acc.result);
    }

    // Phase 3: whole physical cores.
    acc.take_full_cores();
    if acc.is_satisfied() {
        return Ok(acc.result);
    }

    // Phase 4: individual hardware threads.
    acc.take_remaining_cpus();
    if acc.is_satisfied() {
        return Ok(acc.result);
    }

    Err(AllocationError::InsufficientCpus {
        requested: num_cpus,
        available: available.size(),
    }
    .into())
}

struct CpuAccumulator<'a> {
    topo: &'a CpuTopology,
    /// Topology details restricted to the still-free pool; re-restricted
    /// after every claim so free counts always reflect the residual pool.
    details: CpuDetails,
    num_cpus_needed: usize,
    result: CpuSet,
}

impl<'a> CpuAccumulator<'a> {
    fn new(topo: &'a CpuTopology, available: &CpuSet, num_cpus: usize) -> CpuAccumulator<'a> {
        CpuAccumulator {
            topo,
            details: topo.cpu_details.keep_only(available),
            num_cpus_needed: num_cpus,
            result: CpuSet::default(),
        }
    }

    fn is_satisfied(&self) -> bool {
        self.num_cpus_needed == 0
    }

    fn is_failed(&self) -> bool {
        self.num_cpus_needed > self.details.cpus().size()
    }

    fn needs_at_least(&self, n: usize) -> bool {
        n <= self.num_cpus_needed
    }

    fn take(&mut self, cpus: CpuSet) {
        debug!("claiming CPUs {}", cpus);
        self.num_cpus_needed -= cpus.size();
        self.details = self.details.keep_only(&self.details.cpus().difference(&cpus));
        self.result = self.result.union(&cpus);
    }

    /// Sort group ids ascending by the number of free CPUs each group
    /// still contains, ties broken by ascending id.
    fn sort_by_free_cpus(
        &self,
        mut ids: Vec<usize>,
        free_cpus: impl Fn(&CpuDetails, usize) -> CpuSet,
    ) -> Vec<usize> {
        ids.sort_by(|a, b| {
            let a_count = free_cpus(&self.details, *a).size();
            let b_count = free_cpus(&self.details, *b).size();
            a_count.cmp(&b_count).then(a.cmp(b))
        });
        ids
    }

    fn is_numa_node_free(&self, id: usize) -> bool {
        self.details.cpus_in_numa_nodes(&[id]).size()
            == self.topo.cpu_details.cpus_in_numa_nodes(&[id]).size()
    }

    fn is_socket_free(&self, id: usize) -> bool {
        self.details.cpus_in_sockets(&[id]).size()
            == self.topo.cpu_details.cpus_in_sockets(&[id]).size()
    }

    fn is_uncore_cache_free(&self, id: usize) -> bool {
        self.details.cpus_in_uncore_caches(&[id]).size()
            == self.topo.cpu_details.cpus_in_uncore_caches(&[id]).size()
    }

    fn is_core_free(&self, id: usize) -> bool {
        self.details.cpus_in_cores(&[id]).size()
            == self.topo.cpu_details.cpus_in_cores(&[id]).size()
    }

    fn sorted_uncore_caches(&self) -> Vec<usize> {
        self.sort_by_free_cpus(self.details.uncore_caches(), |details, id| {
            details.cpus_in_uncore_caches(&[id])
        })
    }

    /// Free cores in claim order. With uncore accounting enabled, cores
    /// are enumerated cache-domain-major so an allocation is not spread
    /// across cache domains needlessly.
    fn sorted_cores(&self) -> Vec<usize> {
        if self.topo.num_uncore_caches > 0 {
            let mut result = Vec::new();
            for cache in self.sorted_uncore_caches() {
                let cores = self.details.cores_in_uncore_caches(&[cache]);
                result.extend(self.sort_by_free_cpus(cores, |details, id| {
                    details.cpus_in_cores(&[id])
                }));
            }
            result
        } else {
            self.sort_by_free_cpus(self.details.cores(), |details, id| {
                details.cpus_in_cores(&[id])
            })
        }
    }

    /// Free CPUs in claim order: the core order of `sorted_cores`,
    /// ascending CPU id within a core.
    fn sorted_cpus(&self) -> Vec<usize> {
        let mut result = Vec::new();
        for core in self.sorted_cores() {
            result.extend(self.details.cpus_in_cores(&[core]).iter());
        }
        result
    }

    fn take_full_uncore_caches(&mut self) {
        for cache in self.sorted_uncore_caches() {
            let cpus = self.details.cpus_in_uncore_caches(&[cache]);
            if !self.is_uncore_cache_free(cache) || !self.needs_at_least(cpus.size()) {
                continue;
            }
            debug!("claiming whole uncore cache {}", cache);
            self.take(cpus);
        }
    }

    fn take_full_numa_nodes(&mut self) {
        for node in self.sort_by_free_cpus(self.details.numa_nodes(), |details, id| {
            details.cpus_in_numa_nodes(&[id])
        }) {
            let cpus = self.details.cpus_in_numa_nodes(&[node]);
            if !self.is_numa_node_free(node) || !self.needs_at_least(cpus.size()) {
                continue;
            }
            debug!("claiming whole NUMA node {}", node);
            self.take(cpus);
        }
    }

    fn take_full_sockets(&mut self) {
        for socket in self.sort_by_free_cpus(self.details.sockets(), |details, id| {
            details.cpus_in_sockets(&[id])
        }) {
            let cpus = self.details.cpus_in_sockets(&[socket]);
            if !self.is_socket_free(socket) || !self.needs_at_least(cpus.size()) {
                continue;
            }
            debug!("claiming whole socket {}", socket);
            self.take(cpus);
        }
    }

    fn take_full_cores(&mut self) {
        for core in self.sorted_cores() {
            let cpus = self.details.cpus_in_cores(&[core]);
            if !self.is_core_free(core) || !self.needs_at_least(cpus.size()) {
                continue;
            }
            debug!("claiming whole core {}", core);
            self.take(cpus);
        }
    }

    fn take_remaining_cpus(&mut self) {
        for cpu in self.sorted_cpus() {
            if self.is_satisfied() {
                return;
            }
            self.take(CpuSet::new([cpu]));
        }
    }
}
