// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # cpualloc
//!
//! Topology-aware exclusive CPU allocation for a node-level resource
//! manager. The crate models the machine's CPU hierarchy (NUMA node ->
//! socket -> uncore-cache domain -> core -> hardware thread), picks CPU
//! sets that preserve cache and memory locality, and keeps the resulting
//! (pod, container) assignments in a checkpointed state store that
//! survives process restarts.
//!
//! The pieces compose in one direction: a caller reads the current
//! shared pool from the [`State`] store, narrows it as needed, asks
//! [`take_by_topology`] for a concrete CPU set of the requested size,
//! and commits the choice back into the store, which synchronously
//! re-persists its checkpoint.
//!
//! ```no_run
//! use cpualloc::{CheckpointState, CpuTopology, NumaOrSocketsFirst, State, TopologyOptions};
//!
//! # fn main() -> anyhow::Result<()> {
//! let topo = CpuTopology::discover(&TopologyOptions::default())?;
//! let state = CheckpointState::new("/var/lib/cpualloc".as_ref(), "cpu_state", "static")?;
//!
//! let pool = state.default_cpu_set();
//! let order = NumaOrSocketsFirst::for_topology(&topo);
//! let cpus = cpualloc::take_by_topology(&topo, &pool, 4, order)?;
//!
//! state.set_cpu_set("pod-uid", "app", cpus.clone());
//! state.set_default_cpu_set(pool.difference(&cpus));
//! # Ok(())
//! # }
//! ```

mod assignment;
pub use assignment::take_by_topology;
pub use assignment::AllocationError;
pub use assignment::NumaOrSocketsFirst;

mod checkpoint;
pub use checkpoint::migrate_v1_to_v2;
pub use checkpoint::CheckpointError;
pub use checkpoint::CheckpointManager;
pub use checkpoint::CheckpointV1;
pub use checkpoint::CheckpointV2;
pub use checkpoint::ContainerEntry;
pub use checkpoint::FsCheckpointManager;
pub use checkpoint::GlobalEntry;
pub use checkpoint::PodEntry;

mod cpuset;
pub use cpuset::CpuSet;

mod state;
pub use state::CheckpointState;
pub use state::ContainerCpuAssignments;
pub use state::MemoryState;
pub use state::State;

mod topology;
pub use topology::discover_cpus;
pub use topology::CpuDetails;
pub use topology::CpuInfo;
pub use topology::CpuTopology;
pub use topology::DiscoveredCpu;
pub use topology::TopologyOptions;
pub use topology::UNCORE_CACHE_ID_UNDEFINED;
