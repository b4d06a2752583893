// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Assignment state store
//!
//! The authoritative mapping of (pod, container) to exclusively owned
//! CPU set, plus the shared default pool. [`MemoryState`] keeps the
//! mapping in memory only; [`CheckpointState`] mirrors every mutation to
//! a durable checkpoint before the write lock is released, so the
//! on-disk record always reflects a linearizable history of committed
//! states and two concurrent mutations can never interleave their disk
//! writes.
//!
//! A failed checkpoint write after a committed in-memory mutation is
//! logged and not rolled back; the next successful mutation re-persists
//! the full state.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use anyhow::Context;
use anyhow::Result;
use log::error;
use log::info;

use crate::checkpoint::migrate_v1_to_v2;
use crate::checkpoint::CheckpointError;
use crate::checkpoint::CheckpointManager;
use crate::checkpoint::CheckpointV1;
use crate::checkpoint::CheckpointV2;
use crate::checkpoint::FsCheckpointManager;
use crate::cpuset::CpuSet;

/// Pod UID -> container name -> exclusively assigned CPUs.
pub type ContainerCpuAssignments = BTreeMap<String, BTreeMap<String, CpuSet>>;

/// Current CPU assignments plus the shared default pool.
#[derive(Debug, Clone, Default)]
struct StateData {
    default_cpu_set: CpuSet,
    assignments: ContainerCpuAssignments,
}

impl StateData {
    fn cpu_set(&self, pod_uid: &str, container_name: &str) -> Option<CpuSet> {
        self.assignments.get(pod_uid)?.get(container_name).cloned()
    }

    fn set_cpu_set(&mut self, pod_uid: &str, container_name: &str, cpus: CpuSet) {
        self.assignments
            .entry(pod_uid.to_string())
            .or_default()
            .insert(container_name.to_string(), cpus);
    }

    fn delete(&mut self, pod_uid: &str, container_name: &str) {
        if let Some(containers) = self.assignments.get_mut(pod_uid) {
            containers.remove(container_name);
            if containers.is_empty() {
                self.assignments.remove(pod_uid);
            }
        }
    }
}

/// Read and mutate the allocator's assignment state. Implementations are
/// safe for concurrent callers; mutations appear atomic to readers.
pub trait State: Send + Sync {
    /// The CPUs exclusively assigned to a container, if any.
    fn cpu_set(&self, pod_uid: &str, container_name: &str) -> Option<CpuSet>;

    /// The shared pool of CPUs not exclusively owned by any container.
    fn default_cpu_set(&self) -> CpuSet;

    /// The container's exclusive set, or the shared pool when it has none.
    fn cpu_set_or_default(&self, pod_uid: &str, container_name: &str) -> CpuSet;

    fn cpu_assignments(&self) -> ContainerCpuAssignments;

    fn set_cpu_set(&self, pod_uid: &str, container_name: &str, cpus: CpuSet);

    fn set_default_cpu_set(&self, cpus: CpuSet);

    fn set_cpu_assignments(&self, assignments: &ContainerCpuAssignments);

    fn delete(&self, pod_uid: &str, container_name: &str);

    fn clear(&self);
}

/// Purely in-memory state, used as a building block and in tests.
#[derive(Debug, Default)]
pub struct MemoryState {
    state: RwLock<StateData>,
}

impl MemoryState {
    pub fn new() -> MemoryState {
        MemoryState::default()
    }
}

impl State for MemoryState {
    fn cpu_set(&self, pod_uid: &str, container_name: &str) -> Option<CpuSet> {
        self.state.read().unwrap().cpu_set(pod_uid, container_name)
    }

    fn default_cpu_set(&self) -> CpuSet {
        self.state.read().unwrap().default_cpu_set.clone()
    }

    fn cpu_set_or_default(&self, pod_uid: &str, container_name: &str) -> CpuSet {
        let state = self.state.read().unwrap();
        state
            .cpu_set(pod_uid, container_name)
            .unwrap_or_else(|| state.default_cpu_set.clone())
    }

    fn cpu_assignments(&self) -> ContainerCpuAssignments {
        self.state.read().unwrap().assignments.clone()
    }

    fn set_cpu_set(&self, pod_uid: &str, container_name: &str, cpus: CpuSet) {
        self.state
            .write()
            .unwrap()
            .set_cpu_set(pod_uid, container_name, cpus);
    }

    fn set_default_cpu_set(&self, cpus: CpuSet) {
        self.state.write().unwrap().default_cpu_set = cpus;
    }

    fn set_cpu_assignments(&self, assignments: &ContainerCpuAssignments) {
        self.state.write().unwrap().assignments = assignments.clone();
    }

    fn delete(&self, pod_uid: &str, container_name: &str) {
        self.state.write().unwrap().delete(pod_uid, container_name);
    }

    fn clear(&self) {
        *self.state.write().unwrap() = StateData::default();
    }
}

/// Checkpoint-backed state. The lock covers both the in-memory cache and
/// the synchronous checkpoint write of every mutation.
pub struct CheckpointState {
    cache: RwLock<StateData>,
    policy_name: String,
    checkpoint_name: String,
    manager: Box<dyn CheckpointManager>,
}

impl std::fmt::Debug for CheckpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointState")
            .field("cache", &self.cache)
            .field("policy_name", &self.policy_name)
            .field("checkpoint_name", &self.checkpoint_name)
            .finish_non_exhaustive()
    }
}

impl CheckpointState {
    /// Open (or create) the checkpoint under `state_dir` and restore from
    /// it. Policy mismatch and corruption are fatal; the error instructs
    /// the operator to drain the node and remove the checkpoint file.
    pub fn new(state_dir: &Path, checkpoint_name: &str, policy_name: &str) -> Result<CheckpointState> {
        let manager = FsCheckpointManager::new(state_dir)?;
        let path = manager.checkpoint_path(checkpoint_name);
        CheckpointState::with_manager(Box::new(manager), checkpoint_name, policy_name).with_context(
            || {
                format!(
                    "could not restore state from checkpoint; drain this node and delete \
                     the CPU allocator checkpoint file {path:?} before restarting"
                )
            },
        )
    }

    /// As [`CheckpointState::new`] but with a caller-supplied checkpoint
    /// backend.
    pub fn with_manager(
        manager: Box<dyn CheckpointManager>,
        checkpoint_name: &str,
        policy_name: &str,
    ) -> Result<CheckpointState> {
        let state = CheckpointState {
            cache: RwLock::new(StateData::default()),
            policy_name: policy_name.to_string(),
            checkpoint_name: checkpoint_name.to_string(),
            manager,
        };
        state.restore_state()?;
        Ok(state)
    }

    /// Restore from the current schema, falling back to the legacy schema
    /// with forward migration. A missing checkpoint initializes empty
    /// state and writes it out immediately.
    fn restore_state(&self) -> Result<()> {
        let mut data = self.cache.write().unwrap();

        let cp = match self.load_checkpoint() {
            Ok(cp) => cp,
            Err(err) => {
                return match err.downcast_ref::<CheckpointError>() {
                    Some(CheckpointError::NotFound(_)) => self.store_state(&data),
                    _ => Err(err),
                };
            }
        };

        if cp.policy_name != self.policy_name {
            return Err(CheckpointError::PolicyMismatch {
                configured: self.policy_name.clone(),
                stored: cp.policy_name.clone(),
            }
            .into());
        }

        let default_cpu_set = CpuSet::parse(&cp.global.cpuset)
            .with_context(|| format!("could not parse default cpu set {:?}", cp.global.cpuset))?;
        let assignments = cp.to_assignments()?;

        data.default_cpu_set = default_cpu_set;
        data.assignments = assignments;
        info!(
            "state restored from checkpoint: default_cpu_set={}",
            data.default_cpu_set
        );
        Ok(())
    }

    fn load_checkpoint(&self) -> Result<CheckpointV2> {
        let blob = self.manager.get_checkpoint(&self.checkpoint_name)?;

        // Happy path first: a checkpoint in the current schema.
        if let Ok(cp) = CheckpointV2::unmarshal(&blob) {
            if cp.verify_checksum().is_ok() {
                return Ok(cp);
            }
        }

        // A legacy checkpoint verifies under its own layout; anything
        // else is corrupt.
        let v1 = CheckpointV1::unmarshal(&blob)
            .context("failed to decode checkpoint in any supported format")?;
        v1.verify_checksum()?;
        Ok(migrate_v1_to_v2(&v1))
    }

    /// Serialize the full current state to the checkpoint. Caller holds
    /// the write lock.
    fn store_state(&self, data: &StateData) -> Result<()> {
        let mut cp = CheckpointV2 {
            policy_name: self.policy_name.clone(),
            ..Default::default()
        };
        cp.global.cpuset = data.default_cpu_set.to_string();
        cp.update_from_assignments(&data.assignments);
        let blob = cp.marshal()?;
        self.manager.create_checkpoint(&self.checkpoint_name, &blob)
    }
}

impl State for CheckpointState {
    fn cpu_set(&self, pod_uid: &str, container_name: &str) -> Option<CpuSet> {
        self.cache.read().unwrap().cpu_set(pod_uid, container_name)
    }

    fn default_cpu_set(&self) -> CpuSet {
        self.cache.read().unwrap().default_cpu_set.clone()
    }

    fn cpu_set_or_default(&self, pod_uid: &str, container_name: &str) -> CpuSet {
        let data = self.cache.read().unwrap();
        data.cpu_set(pod_uid, container_name)
            .unwrap_or_else(|| data.default_cpu_set.clone())
    }

    fn cpu_assignments(&self) -> ContainerCpuAssignments {
        self.cache.read().unwrap().assignments.clone()
    }

    fn set_cpu_set(&self, pod_uid: &str, container_name: &str, cpus: CpuSet) {
        let mut data = self.cache.write().unwrap();
        data.set_cpu_set(pod_uid, container_name, cpus);
        if let Err(err) = self.store_state(&data) {
            error!(
                "failed to write checkpoint after cpuset update: pod={pod_uid} \
                 container={container_name} err={err:#}"
            );
        }
    }

    fn set_default_cpu_set(&self, cpus: CpuSet) {
        let mut data = self.cache.write().unwrap();
        data.default_cpu_set = cpus;
        if let Err(err) = self.store_state(&data) {
            error!("failed to write checkpoint after default pool update: err={err:#}");
        }
    }

    fn set_cpu_assignments(&self, assignments: &ContainerCpuAssignments) {
        let mut data = self.cache.write().unwrap();
        data.assignments = assignments.clone();
        if let Err(err) = self.store_state(&data) {
            error!("failed to write checkpoint after assignment update: err={err:#}");
        }
    }

    fn delete(&self, pod_uid: &str, container_name: &str) {
        let mut data = self.cache.write().unwrap();
        data.delete(pod_uid, container_name);
        if let Err(err) = self.store_state(&data) {
            error!(
                "failed to write checkpoint after delete: pod={pod_uid} \
                 container={container_name} err={err:#}"
            );
        }
    }

    fn clear(&self) {
        let mut data = self.cache.write().unwrap();
        *data = StateData::default();
        if let Err(err) = self.store_state(&data) {
            error!("failed to write checkpoint after clear: err={err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path, policy: &str) -> Result<CheckpointState> {
        CheckpointState::new(dir, "cpu_state", policy)
    }

    #[test]
    fn test_memory_state_basics() {
        let state = MemoryState::new();
        assert_eq!(state.cpu_set("pod", "app"), None);

        state.set_default_cpu_set(CpuSet::new(0..8));
        state.set_cpu_set("pod", "app", CpuSet::new([0, 1]));
        assert_eq!(state.cpu_set("pod", "app"), Some(CpuSet::new([0, 1])));
        assert_eq!(state.cpu_set_or_default("pod", "app"), CpuSet::new([0, 1]));
        assert_eq!(
            state.cpu_set_or_default("pod", "other"),
            CpuSet::new(0..8)
        );

        state.delete("pod", "app");
        assert_eq!(state.cpu_set("pod", "app"), None);
        assert!(state.cpu_assignments().is_empty());

        state.set_cpu_set("pod", "app", CpuSet::new([2]));
        state.clear();
        assert!(state.cpu_assignments().is_empty());
        assert!(state.default_cpu_set().is_empty());

        let mut assignments = ContainerCpuAssignments::new();
        assignments
            .entry("pod".to_string())
            .or_default()
            .insert("app".to_string(), CpuSet::new([3]));
        state.set_cpu_assignments(&assignments);
        assert_eq!(state.cpu_assignments(), assignments);
    }

    #[test]
    fn test_empty_start_writes_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let state = open(dir.path(), "static").unwrap();
        assert!(state.default_cpu_set().is_empty());
        assert!(dir.path().join("cpu_state").exists());
    }

    #[test]
    fn test_mutate_and_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let state = open(dir.path(), "static").unwrap();
            state.set_default_cpu_set(CpuSet::new([4, 5, 6, 7]));
            state.set_cpu_set("pod-a", "app", CpuSet::new([0, 1]));
            state.set_cpu_set("pod-a", "sidecar", CpuSet::new([2]));
            state.set_cpu_set("pod-b", "app", CpuSet::new([3]));
            state.delete("pod-b", "app");
        }

        let state = open(dir.path(), "static").unwrap();
        assert_eq!(state.default_cpu_set(), CpuSet::new([4, 5, 6, 7]));
        assert_eq!(state.cpu_set("pod-a", "app"), Some(CpuSet::new([0, 1])));
        assert_eq!(state.cpu_set("pod-a", "sidecar"), Some(CpuSet::new([2])));
        assert_eq!(state.cpu_set("pod-b", "app"), None);
    }

    #[test]
    fn test_policy_mismatch_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        drop(open(dir.path(), "static").unwrap());

        let err = open(dir.path(), "none").unwrap_err();
        let root = err.root_cause().to_string();
        assert!(root.contains("policy"), "unexpected error: {root}");
        assert!(
            format!("{err:#}").contains("drain this node"),
            "missing operator instruction: {err:#}"
        );
    }

    #[test]
    fn test_corrupt_checkpoint_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        drop(open(dir.path(), "static").unwrap());

        // Flip the stored default pool without refreshing the checksum.
        let path = dir.path().join("cpu_state");
        let mut cp =
            CheckpointV2::unmarshal(&std::fs::read(&path).unwrap()).unwrap();
        cp.global.cpuset = "0-63".to_string();
        std::fs::write(&path, serde_json::to_vec(&cp).unwrap()).unwrap();

        let err = open(dir.path(), "static").unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.contains("checksum"), "unexpected error: {chain}");
    }

    #[test]
    fn test_garbage_checkpoint_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cpu_state"), b"not json").unwrap();
        assert!(open(dir.path(), "static").is_err());
    }

    #[test]
    fn test_legacy_checkpoint_restored_via_migration() {
        let dir = tempfile::tempdir().unwrap();
        let mut v1 = CheckpointV1 {
            policy_name: "static".to_string(),
            default_cpu_set: "4-7".to_string(),
            ..Default::default()
        };
        v1.entries
            .entry("pod-a".to_string())
            .or_default()
            .insert("app".to_string(), "0-3".to_string());
        std::fs::write(dir.path().join("cpu_state"), v1.marshal().unwrap()).unwrap();

        let state = open(dir.path(), "static").unwrap();
        assert_eq!(state.default_cpu_set(), CpuSet::new([4, 5, 6, 7]));
        assert_eq!(
            state.cpu_set("pod-a", "app"),
            Some(CpuSet::new([0, 1, 2, 3]))
        );
    }

    #[test]
    fn test_malformed_entry_names_pod_and_container() {
        let dir = tempfile::tempdir().unwrap();
        let mut cp = CheckpointV2 {
            policy_name: "static".to_string(),
            ..Default::default()
        };
        cp.container_entries
            .entry("pod-a".to_string())
            .or_default()
            .insert(
                "app".to_string(),
                crate::checkpoint::ContainerEntry {
                    cpuset: "7-4".to_string(),
                },
            );
        std::fs::write(dir.path().join("cpu_state"), cp.marshal().unwrap()).unwrap();

        let err = open(dir.path(), "static").unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.contains("pod-a"), "unexpected error: {chain}");
    }
}
