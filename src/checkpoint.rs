// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Assignment checkpoints
//!
//! Versioned on-disk records of the allocator's assignment state, with a
//! content checksum and forward migration from the legacy schema.
//!
//! Records serialize to JSON with `BTreeMap` fields, so the encoding is
//! canonical: the same logical state always produces the same bytes. The
//! checksum is FNV-1a over that canonical encoding with the checksum
//! field held at zero, and covers only logical field values, never a
//! type or schema tag. It guards against corruption and truncation, not
//! tampering.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::cpuset::CpuSet;
use crate::state::ContainerCpuAssignments;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("checkpoint {0:?} not found")]
    NotFound(String),
    #[error("checkpoint is corrupted: calculated checksum {actual} doesn't match stored checksum {expected}")]
    Corrupt { expected: u32, actual: u32 },
    #[error("configured policy {configured:?} differs from checkpoint policy {stored:?}")]
    PolicyMismatch { configured: String, stored: String },
}

/// Legacy two-level checkpoint schema: pod -> container -> cpuset string.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointV1 {
    #[serde(rename = "policyName", default)]
    pub policy_name: String,
    #[serde(rename = "defaultCpuSet", default)]
    pub default_cpu_set: String,
    #[serde(default)]
    pub entries: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub checksum: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalEntry {
    #[serde(default)]
    pub cpuset: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodEntry {
    #[serde(default)]
    pub cpuset: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerEntry {
    #[serde(default)]
    pub cpuset: String,
}

/// Current checkpoint schema. `default_cpu_set` and `entries` mirror
/// `global` and `container_entries` for readers of the legacy schema and
/// are recomputed on every write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointV2 {
    #[serde(rename = "policyName", default)]
    pub policy_name: String,
    #[serde(rename = "globalEntries", default)]
    pub global: GlobalEntry,
    #[serde(rename = "podEntries", default)]
    pub pod_entries: BTreeMap<String, PodEntry>,
    #[serde(rename = "containerEntries", default)]
    pub container_entries: BTreeMap<String, BTreeMap<String, ContainerEntry>>,
    #[serde(rename = "defaultCpuSet", default)]
    pub default_cpu_set: String,
    #[serde(default)]
    pub entries: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub checksum: u32,
}

fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for byte in data {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x01000193);
    }
    hash
}

impl CheckpointV1 {
    pub fn compute_checksum(&self) -> Result<u32> {
        let mut copy = self.clone();
        copy.checksum = 0;
        Ok(fnv1a32(&serde_json::to_vec(&copy)?))
    }

    /// Serialize with an embedded checksum over the rest of the record.
    pub fn marshal(&mut self) -> Result<Vec<u8>> {
        self.checksum = 0;
        self.checksum = self.compute_checksum()?;
        Ok(serde_json::to_vec(self)?)
    }

    pub fn unmarshal(blob: &[u8]) -> Result<CheckpointV1> {
        Ok(serde_json::from_slice(blob)?)
    }

    pub fn verify_checksum(&self) -> Result<()> {
        if self.checksum == 0 {
            // Accept a zero checksum for files written before checksums
            // were introduced.
            return Ok(());
        }
        let actual = self.compute_checksum()?;
        if actual != self.checksum {
            return Err(CheckpointError::Corrupt {
                expected: self.checksum,
                actual,
            }
            .into());
        }
        Ok(())
    }
}

impl CheckpointV2 {
    pub fn compute_checksum(&self) -> Result<u32> {
        let mut copy = self.clone();
        copy.checksum = 0;
        Ok(fnv1a32(&serde_json::to_vec(&copy)?))
    }

    /// Serialize with refreshed legacy mirrors and an embedded checksum
    /// over the rest of the record.
    pub fn marshal(&mut self) -> Result<Vec<u8>> {
        self.sync_compat_fields();
        self.checksum = 0;
        self.checksum = self.compute_checksum()?;
        Ok(serde_json::to_vec(self)?)
    }

    pub fn unmarshal(blob: &[u8]) -> Result<CheckpointV2> {
        Ok(serde_json::from_slice(blob)?)
    }

    pub fn verify_checksum(&self) -> Result<()> {
        let actual = self.compute_checksum()?;
        if actual != self.checksum {
            return Err(CheckpointError::Corrupt {
                expected: self.checksum,
                actual,
            }
            .into());
        }
        Ok(())
    }

    /// Recompute the legacy-schema mirrors from the current entries.
    pub fn sync_compat_fields(&mut self) {
        self.default_cpu_set = self.global.cpuset.clone();
        self.entries = self
            .container_entries
            .iter()
            .map(|(pod, containers)| {
                (
                    pod.clone(),
                    containers
                        .iter()
                        .map(|(name, entry)| (name.clone(), entry.cpuset.clone()))
                        .collect(),
                )
            })
            .collect();
    }

    /// Replace the container entries with the given assignments.
    pub fn update_from_assignments(&mut self, assignments: &ContainerCpuAssignments) {
        self.container_entries = assignments
            .iter()
            .map(|(pod, containers)| {
                (
                    pod.clone(),
                    containers
                        .iter()
                        .map(|(name, cset)| {
                            (
                                name.clone(),
                                ContainerEntry {
                                    cpuset: cset.to_string(),
                                },
                            )
                        })
                        .collect(),
                )
            })
            .collect();
    }

    /// Parse the container entries back into CPU sets. A malformed entry
    /// is an error naming the offending pod and container.
    pub fn to_assignments(&self) -> Result<ContainerCpuAssignments> {
        let mut assignments = ContainerCpuAssignments::new();
        for (pod, containers) in &self.container_entries {
            let mut parsed = BTreeMap::new();
            for (name, entry) in containers {
                let cset = CpuSet::parse(&entry.cpuset).with_context(|| {
                    format!(
                        "could not parse cpuset {:?} for container {:?} in pod {:?}",
                        entry.cpuset, name, pod
                    )
                })?;
                parsed.insert(name.clone(), cset);
            }
            assignments.insert(pod.clone(), parsed);
        }
        Ok(assignments)
    }
}

/// Pure structural transform of a legacy checkpoint into the current
/// schema: policy name and default set are copied only when the source
/// carries them, every (pod, container) cpuset string verbatim.
pub fn migrate_v1_to_v2(src: &CheckpointV1) -> CheckpointV2 {
    let mut dst = CheckpointV2::default();
    if !src.policy_name.is_empty() {
        dst.policy_name = src.policy_name.clone();
    }
    if !src.default_cpu_set.is_empty() {
        dst.global.cpuset = src.default_cpu_set.clone();
    }
    for (pod, containers) in &src.entries {
        let entries = dst.container_entries.entry(pod.clone()).or_default();
        for (name, cpuset) in containers {
            entries.insert(
                name.clone(),
                ContainerEntry {
                    cpuset: cpuset.clone(),
                },
            );
        }
    }
    dst
}

/// Durable storage for named checkpoint blobs. `get_checkpoint` fails
/// with a downcastable [`CheckpointError::NotFound`] when no checkpoint
/// of that name exists, so callers can distinguish first start from I/O
/// failure.
pub trait CheckpointManager: Send + Sync {
    fn get_checkpoint(&self, name: &str) -> Result<Vec<u8>>;
    fn create_checkpoint(&self, name: &str, data: &[u8]) -> Result<()>;
}

/// Filesystem-backed checkpoint manager. Writes go to a temporary file
/// in the state directory and are renamed into place, so a crash never
/// leaves a half-written checkpoint under the final name.
pub struct FsCheckpointManager {
    dir: PathBuf,
}

impl FsCheckpointManager {
    pub fn new(dir: &Path) -> Result<FsCheckpointManager> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create checkpoint directory {dir:?}"))?;
        Ok(FsCheckpointManager {
            dir: dir.to_path_buf(),
        })
    }

    pub fn checkpoint_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl CheckpointManager for FsCheckpointManager {
    fn get_checkpoint(&self, name: &str) -> Result<Vec<u8>> {
        match fs::read(self.checkpoint_path(name)) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(CheckpointError::NotFound(name.to_string()).into())
            }
            Err(err) => {
                Err(err).with_context(|| format!("failed to read checkpoint {name:?}"))
            }
        }
    }

    fn create_checkpoint(&self, name: &str, data: &[u8]) -> Result<()> {
        let tmp = self.dir.join(format!("{name}.tmp"));
        fs::write(&tmp, data)
            .with_context(|| format!("failed to write checkpoint {name:?}"))?;
        fs::rename(&tmp, self.checkpoint_path(name))
            .with_context(|| format!("failed to commit checkpoint {name:?}"))?;
        Ok(())
    }
}
