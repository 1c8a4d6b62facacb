//! Checkpoint manager.
//!
//! Checkpoints are not side-files — they are ordinary blocks, written
//! through the same append-only path as everything else, tagged
//! `BlockKind::Checkpoint`. A copy-type checkpoint embeds enough of the
//! target block to reconstruct it from nothing; a reference-type
//! checkpoint just records that the target was intact as of a point in
//! time, cheaper to write but useless once the target itself is gone.
//! Pruning a checkpoint does not erase its bytes (this is an append-only
//! store) — it is recorded in a `BlockKind::Cleanup` block that later
//! history-reading code treats as a tombstone list.

use crate::block::{Block, BlockKind, PayloadEncoding};
use crate::cancel::CancelToken;
use crate::error::{BlockError, Result};
use crate::manager::BlockManager;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::{debug, info};

/// Default number of checkpoints retained per target block before older
/// ones are pruned.
pub const DEFAULT_MAX_PER_TARGET: usize = 3;

const CHECKPOINT_ID_TAG: i64 = 1 << 62;
const CLEANUP_ID_TAG: i64 = 1 << 61;

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointPayload {
    target_block_id: i64,
    created_at: i64,
    target_kind: u8,
    target_flags: u8,
    target_payload_encoding: u8,
    target_timestamp: i64,
    target_hash: [u8; 32],
    /// `Some` for a copy-type checkpoint; `None` for a reference-type one.
    copied_payload: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CleanupPayload {
    created_at: i64,
    pruned_checkpoint_ids: Vec<i64>,
}

/// One entry in a target block's checkpoint history, as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub checkpoint_block_id: i64,
    pub target_block_id: i64,
    pub created_at: i64,
    pub is_copy_type: bool,
}

/// Selects which indexed blocks a system checkpoint covers. All set
/// fields must match; a `None` field imposes no constraint.
#[derive(Debug, Clone, Default)]
pub struct CheckpointCriteria {
    pub included_kinds: Option<Vec<BlockKind>>,
    pub min_size: Option<usize>,
    /// Only blocks at most this old (relative to `now`, in the same
    /// units as `Block::timestamp`) are covered. Excludes blocks the
    /// caller considers too stale to be worth a fresh checkpoint.
    pub max_age: Option<i64>,
}

impl CheckpointCriteria {
    pub fn everything() -> Self {
        Self::default()
    }

    fn matches(&self, block: &Block, now: i64) -> bool {
        if let Some(kinds) = &self.included_kinds {
            if !kinds.contains(&block.kind) {
                return false;
            }
        }
        if let Some(min_size) = self.min_size {
            if block.payload.len() < min_size {
                return false;
            }
        }
        if let Some(max_age) = self.max_age {
            if now - block.timestamp > max_age {
                return false;
            }
        }
        true
    }
}

/// Wraps a [`BlockManager`] to add checkpoint creation, pruning, history
/// lookup, and checkpoint-backed recovery on top of it.
pub struct CheckpointManager<'a> {
    mgr: &'a BlockManager,
}

impl<'a> CheckpointManager<'a> {
    pub fn new(mgr: &'a BlockManager) -> Self {
        Self { mgr }
    }

    fn next_id(&self, tag: i64) -> i64 {
        let mut max_seq = 0i64;
        for &id in self.mgr.get_block_locations().keys() {
            if id & tag == tag {
                max_seq = max_seq.max(id & !tag);
            }
        }
        tag | (max_seq + 1)
    }

    /// Create a checkpoint for `target_block_id`. `copy` selects a
    /// copy-type checkpoint (embeds the payload, recoverable standalone)
    /// versus a reference-type one (just records intactness).
    pub fn create_checkpoint(
        &self,
        target_block_id: i64,
        copy: bool,
        now: i64,
        cancel: Option<&CancelToken>,
    ) -> Result<i64> {
        let target = self.mgr.read_block(target_block_id, cancel)?;
        let target_bytes = crate::block::encode(&target)?;
        let payload = CheckpointPayload {
            target_block_id,
            created_at: now,
            target_kind: target.kind.to_u8(),
            target_flags: target.flags,
            target_payload_encoding: target.payload_encoding.to_u8(),
            target_timestamp: target.timestamp,
            target_hash: sha256(&target_bytes),
            copied_payload: if copy { Some(target.payload.clone()) } else { None },
        };
        let serialized = serde_json::to_vec(&payload).map_err(|e| BlockError::Integrity(e.to_string()))?;
        let checkpoint_id = self.next_id(CHECKPOINT_ID_TAG);
        let block = Block::new(BlockKind::Checkpoint, 0, PayloadEncoding::Json, now, checkpoint_id, serialized);
        self.mgr.write_block(&block, cancel)?;
        debug!(target_block_id, checkpoint_id, copy, "created checkpoint");
        Ok(checkpoint_id)
    }

    /// Checkpoint every currently-indexed content block matching
    /// `criteria`. Skips the manager's own checkpoint and cleanup
    /// blocks — a system checkpoint never checkpoints itself.
    pub fn create_system_checkpoint(
        &self,
        copy: bool,
        now: i64,
        criteria: &CheckpointCriteria,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<i64>> {
        let mut created = Vec::new();
        for &block_id in self.mgr.get_block_locations().keys() {
            if block_id & CHECKPOINT_ID_TAG == CHECKPOINT_ID_TAG || block_id & CLEANUP_ID_TAG == CLEANUP_ID_TAG {
                continue;
            }
            crate::cancel::check(cancel)?;
            let block = self.mgr.read_block(block_id, cancel)?;
            if !criteria.matches(&block, now) {
                continue;
            }
            created.push(self.create_checkpoint(block_id, copy, now, cancel)?);
        }
        info!(count = created.len(), "created system checkpoint batch");
        Ok(created)
    }

    fn all_checkpoints(&self) -> Result<Vec<(i64, CheckpointPayload)>> {
        let mut out = Vec::new();
        for &block_id in self.mgr.get_block_locations().keys() {
            if block_id & CHECKPOINT_ID_TAG != CHECKPOINT_ID_TAG {
                continue;
            }
            let block = self.mgr.read_block(block_id, None)?;
            if block.kind != BlockKind::Checkpoint {
                continue;
            }
            let payload: CheckpointPayload =
                serde_json::from_slice(&block.payload).map_err(|e| BlockError::Integrity(e.to_string()))?;
            out.push((block_id, payload));
        }
        Ok(out)
    }

    fn pruned_ids(&self) -> Result<HashSet<i64>> {
        let mut pruned = HashSet::new();
        for &block_id in self.mgr.get_block_locations().keys() {
            if block_id & CLEANUP_ID_TAG != CLEANUP_ID_TAG {
                continue;
            }
            let block = self.mgr.read_block(block_id, None)?;
            if block.kind != BlockKind::Cleanup {
                continue;
            }
            let payload: CleanupPayload =
                serde_json::from_slice(&block.payload).map_err(|e| BlockError::Integrity(e.to_string()))?;
            pruned.extend(payload.pruned_checkpoint_ids);
        }
        Ok(pruned)
    }

    /// All non-pruned checkpoints for `target_block_id`, most recent first.
    pub fn get_checkpoint_history(&self, target_block_id: i64) -> Result<Vec<CheckpointRecord>> {
        let pruned = self.pruned_ids()?;
        let mut records: Vec<CheckpointRecord> = self
            .all_checkpoints()?
            .into_iter()
            .filter(|(id, p)| p.target_block_id == target_block_id && !pruned.contains(id))
            .map(|(id, p)| CheckpointRecord {
                checkpoint_block_id: id,
                target_block_id: p.target_block_id,
                created_at: p.created_at,
                is_copy_type: p.copied_payload.is_some(),
            })
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Prune checkpoint history down to `max_per_target` entries per
    /// target block, newest kept. Returns the number of checkpoints
    /// tombstoned. Writes nothing if there is nothing to prune.
    pub fn prune_old_checkpoints(
        &self,
        max_per_target: usize,
        now: i64,
        cancel: Option<&CancelToken>,
    ) -> Result<usize> {
        let pruned_already = self.pruned_ids()?;
        let all = self.all_checkpoints()?;

        let mut by_target: std::collections::HashMap<i64, Vec<(i64, i64)>> = std::collections::HashMap::new();
        for (id, p) in &all {
            if pruned_already.contains(id) {
                continue;
            }
            by_target.entry(p.target_block_id).or_default().push((*id, p.created_at));
        }

        let mut to_prune = Vec::new();
        for group in by_target.values_mut() {
            group.sort_by(|a, b| b.1.cmp(&a.1));
            for (id, _) in group.iter().skip(max_per_target) {
                to_prune.push(*id);
            }
        }

        if to_prune.is_empty() {
            return Ok(0);
        }
        crate::cancel::check(cancel)?;

        let payload = CleanupPayload { created_at: now, pruned_checkpoint_ids: to_prune.clone() };
        let serialized = serde_json::to_vec(&payload).map_err(|e| BlockError::Integrity(e.to_string()))?;
        let cleanup_id = self.next_id(CLEANUP_ID_TAG);
        let block = Block::new(BlockKind::Cleanup, 0, PayloadEncoding::Json, now, cleanup_id, serialized);
        self.mgr.write_block(&block, cancel)?;
        info!(pruned = to_prune.len(), "pruned old checkpoints");
        Ok(to_prune.len())
    }

    /// Reconstruct `target_block_id` purely from checkpoint history,
    /// ignoring whatever the live block manager currently holds for it.
    pub fn recover_block(&self, target_block_id: i64) -> Result<Block> {
        let history = self.get_checkpoint_history(target_block_id)?;
        for record in history {
            let block = self.mgr.read_block(record.checkpoint_block_id, None)?;
            let payload: CheckpointPayload =
                serde_json::from_slice(&block.payload).map_err(|e| BlockError::Integrity(e.to_string()))?;
            if let Some(copied) = payload.copied_payload {
                return Ok(Block {
                    version: crate::block::FORMAT_VERSION,
                    kind: BlockKind::from_u8(payload.target_kind),
                    flags: payload.target_flags,
                    payload_encoding: PayloadEncoding::from_u8(payload.target_payload_encoding),
                    timestamp: payload.target_timestamp,
                    block_id: target_block_id,
                    payload: copied,
                });
            }
        }
        Err(BlockError::NotFound(target_block_id))
    }

    /// Read `target_block_id` normally; on any failure (missing, torn,
    /// checksum mismatch), fall back to the most recent copy-type
    /// checkpoint that can stand in for it.
    pub fn read_block_with_recovery(&self, target_block_id: i64, cancel: Option<&CancelToken>) -> Result<Block> {
        match self.mgr.read_block(target_block_id, cancel) {
            Ok(block) => Ok(block),
            Err(live_err) => self.recover_block(target_block_id).map_err(|_| live_err),
        }
    }
}
