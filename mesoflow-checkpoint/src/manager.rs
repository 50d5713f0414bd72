use log::{error, info};
use mesoflow_core::fsutil::write_atomic;
use mesoflow_core::{PersistentChannels, ProcessGroup, SimState};
use mesoflow_transport::{SharedContainer, TransferError, TransferQueue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::dump::{dump_collection, failed_ranks, load_collection};
use crate::error::{CheckpointError, Result};

/// Name of the marker holding the id of the newest complete checkpoint.
pub const LATEST_FILE_NAME: &str = "latest";

/// How successive checkpoint ids are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointIdAdvanceMode {
    /// Alternate between ids 0 and 1: a crash while writing one never destroys the other.
    #[default]
    PingPong,
    /// A fresh id per checkpoint, keeping the full history.
    Incremental,
}

impl CheckpointIdAdvanceMode {
    pub fn next(self, id: u64) -> u64 {
        match self {
            CheckpointIdAdvanceMode::PingPong => id ^ 1,
            CheckpointIdAdvanceMode::Incremental => id + 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointPolicy {
    /// Checkpoint every this many steps; 0 disables checkpointing.
    pub every: u64,
    pub folder: PathBuf,
    #[serde(default)]
    pub mode: CheckpointIdAdvanceMode,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            every: 0,
            folder: PathBuf::from("restart"),
            mode: CheckpointIdAdvanceMode::PingPong,
        }
    }
}

impl CheckpointPolicy {
    pub fn is_enabled(&self) -> bool {
        self.every > 0
    }
}

/// Drives periodic collective checkpoints and restarts.
///
/// Layout under the policy folder:
///
/// ```text
/// latest                        id of the newest complete checkpoint
/// <id:05>/state.mflow           scalar state, written by the coordinator
/// <id:05>/<collection>.json     descriptor, written by the coordinator
/// <id:05>/<collection>.<rank:04>.bin
/// ```
#[derive(Debug)]
pub struct CheckpointManager {
    policy: CheckpointPolicy,
    current_id: u64,
}

impl CheckpointManager {
    pub fn new(policy: CheckpointPolicy) -> Self {
        Self { policy, current_id: 0 }
    }

    pub fn policy(&self) -> &CheckpointPolicy {
        &self.policy
    }

    /// Id the next checkpoint will be written under.
    pub fn current_id(&self) -> u64 {
        self.current_id
    }

    pub fn needs_checkpoint(&self, step: i64) -> bool {
        self.policy.is_enabled() && step >= 0 && step as u64 % self.policy.every == 0
    }

    pub fn checkpoint_folder(root: &Path, id: u64) -> PathBuf {
        root.join(format!("{id:05}"))
    }

    /// Collective checkpoint of `state` and the persistent channels of `collections`.
    ///
    /// Every rank must call this with the same collections in the same order.
    /// Pending transfers on `queue` are synchronized before any container is
    /// locked, so the dump sees their results. Callers must not hold a lock on
    /// any of `collections`. The `latest` marker only moves once every rank has
    /// written its part; on any failure it keeps pointing at the previous
    /// checkpoint and the id is not advanced.
    pub fn checkpoint(
        &mut self,
        group: &dyn ProcessGroup,
        state: &SimState,
        collections: &[SharedContainer],
        queue: Option<&TransferQueue>,
    ) -> Result<u64> {
        let id = self.current_id;
        let folder = Self::checkpoint_folder(&self.policy.folder, id);

        let mut local = match queue {
            Some(queue) => queue.synchronize().map_err(CheckpointError::from),
            None => Ok(()),
        };
        let mut guards = Vec::with_capacity(collections.len());
        for shared in collections {
            // A poisoned container is still dumped to keep the collectives in
            // step, but the checkpoint is not committed.
            let guard = shared.read().unwrap_or_else(|poisoned| {
                if local.is_ok() {
                    local = Err(TransferError::Poisoned("container").into());
                }
                poisoned.into_inner()
            });
            guards.push(guard);
        }
        if local.is_ok() {
            local = fs::create_dir_all(&folder).map_err(|e| CheckpointError::io(&folder, e));
        }
        if local.is_ok() {
            local = state.checkpoint(group, &folder).map_err(CheckpointError::from);
        }
        if let Err(e) = &local {
            error!("rank {} could not prepare checkpoint {}: {}", group.rank(), id, e);
        }
        let prepared = failed_ranks(group, local.is_ok());

        // Dumps are collective, so they run even after a failure elsewhere.
        let mut dumped = true;
        for container in guards.iter().map(|guard| &**guard) {
            let result = dump_collection(group, &folder, container.name(), container, PersistentChannels, state);
            if let Err(e) = result {
                error!("rank {}: checkpoint {} of '{}' failed: {}", group.rank(), id, container.name(), e);
                dumped = false;
            }
        }
        let mut failed: BTreeSet<usize> = prepared.into_iter().chain(failed_ranks(group, dumped)).collect();

        let mut marked = true;
        if failed.is_empty() && group.is_coordinator() {
            let path = self.policy.folder.join(LATEST_FILE_NAME);
            if let Err(e) = write_atomic(&path, format!("{id}\n").as_bytes()) {
                error!("failed to update {:?}: {}", path, e);
                marked = false;
            }
        }
        let unmarked = failed_ranks(group, marked);

        failed.extend(unmarked);
        if !failed.is_empty() {
            return Err(CheckpointError::PartialCheckpoint {
                id,
                ranks: failed.into_iter().collect(),
            });
        }

        if group.is_coordinator() {
            info!(
                "checkpoint {} written to {:?} at step {}",
                id, folder, state.current_step
            );
        }
        self.current_id = self.policy.mode.next(id);
        Ok(id)
    }

    /// Collective restart from the newest complete checkpoint under `root`.
    ///
    /// The coordinator restores the scalar state and shares time, step and `dt`
    /// with the other ranks; each rank keeps its own domain geometry. Each rank
    /// then validates the stored channel layout against its own registry and
    /// loads its own shard. Pending transfers on `queue` are synchronized before
    /// any container is locked. Any error means the run must not continue.
    ///
    /// Returns the restored id. Subsequent checkpoints continue after it.
    pub fn restart(
        &mut self,
        group: &dyn ProcessGroup,
        root: &Path,
        state: &mut SimState,
        collections: &[SharedContainer],
        queue: Option<&TransferQueue>,
    ) -> Result<u64> {
        let synced = match queue {
            Some(queue) => queue.synchronize().map_err(CheckpointError::from),
            None => Ok(()),
        };

        let latest = root.join(LATEST_FILE_NAME);
        let target = read_latest(&latest).map(|id| (id, Self::checkpoint_folder(root, id)));
        let restored = synced.and_then(|()| match &target {
            Ok((_, folder)) => state
                .restart(group, folder)
                .map_err(|e| CheckpointError::RestoreFileMissingOrCorrupt {
                    path: folder.clone(),
                    reason: e.to_string(),
                }),
            Err(reason) => Err(CheckpointError::RestoreFileMissingOrCorrupt {
                path: latest.clone(),
                reason: reason.clone(),
            }),
        });
        // Everyone learns whether the coordinator succeeded before going on.
        let failed = failed_ranks(group, restored.is_ok());
        restored?;
        if !failed.is_empty() {
            return Err(CheckpointError::RestoreFileMissingOrCorrupt {
                path: root.to_path_buf(),
                reason: format!("ranks {failed:?} could not restore the simulation state"),
            });
        }
        let (id, folder) = target.map_err(|reason| CheckpointError::RestoreFileMissingOrCorrupt {
            path: latest,
            reason,
        })?;

        let step = group.all_gather_u64(state.current_step as u64)[0];
        let time = group.all_gather_u64(state.current_time.to_bits())[0];
        let dt = group.all_gather_u64(u64::from(state.dt.to_bits()))[0];
        state.current_step = step as i64;
        state.current_time = f64::from_bits(time);
        state.dt = f32::from_bits(dt as u32);

        for shared in collections {
            let mut container = shared.write().map_err(|_| TransferError::Poisoned("container"))?;
            let name = container.name().to_string();
            load_collection(group, &folder, &name, &mut *container, PersistentChannels)?;
        }

        self.current_id = self.policy.mode.next(id);
        if group.is_coordinator() {
            info!(
                "restarted from checkpoint {} in {:?} at step {}",
                id, folder, state.current_step
            );
        }
        Ok(id)
    }
}

fn read_latest(path: &Path) -> std::result::Result<u64, String> {
    let text = fs::read_to_string(path).map_err(|e| e.to_string())?;
    text.trim()
        .parse()
        .map_err(|e| format!("bad checkpoint id '{}': {e}", text.trim()))
}
