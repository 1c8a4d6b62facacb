//! Hash chain over appended blocks.
//!
//! Every block's encoded bytes are hashed with SHA-256; each new block's
//! hash is folded into a running chain hash:
//! `chain_hash_n = SHA256(chain_hash_{n-1} || block_hash_n)`, with
//! `chain_hash_0` (the genesis value) all zero bytes. The chain is kept
//! entirely in memory and is always reproducible from the underlying
//! file — [`HashChain::rebuild_from_manager`] replays every block in
//! append order, so there is nothing here that the file itself doesn't
//! already imply.

use crate::block::{self, Block, BlockKind, PayloadEncoding};
use crate::cancel::CancelToken;
use crate::error::{BlockError, Result};
use crate::manager::BlockManager;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use tracing::warn;

pub type Hash = [u8; 32];

const GENESIS: Hash = [0u8; 32];

/// High tag bit reserved for hash-chain entry block ids, keeping them out
/// of the caller's own `block_id` space the same way
/// `checkpoint::CHECKPOINT_ID_TAG` does for checkpoints.
const ENTRY_ID_TAG: i64 = 1 << 60;

fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Render a hash as lowercase hex, for logging and existence proofs
/// handed to a caller outside this crate.
pub fn to_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

fn hash_block(block: &Block) -> Result<Hash> {
    let encoded = block::encode(block)?;
    Ok(sha256(&encoded))
}

/// One link in the chain, recording the block it commits to and the
/// chain hash after that block was folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashChainEntry {
    pub sequence: u64,
    pub block_id: i64,
    pub block_hash: Hash,
    pub chain_hash: Hash,
    pub timestamp: i64,
    /// The `block_id` chained immediately before this one, `None` for the
    /// first entry.
    pub previous_block_id: Option<i64>,
}

/// Wire shape of a persisted `BlockKind::HashChain` entry — chain
/// entries are themselves stored as ordinary blocks. Hashes are
/// hex-encoded for the same reason `Proof`/`to_hex` render them that
/// way — readable in a dump, unambiguous in JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HashChainEntryPayload {
    sequence: u64,
    block_id: i64,
    block_hash: String,
    chain_hash: String,
    timestamp: i64,
    previous_block_id: Option<i64>,
}

fn parse_hash(hex_str: &str) -> Result<Hash> {
    let bytes = hex::decode(hex_str).map_err(|e| BlockError::Integrity(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|_| BlockError::Integrity("hash chain entry payload had a malformed hash length".into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationReport {
    pub block_id: i64,
    /// Whether the block's content, read fresh from the store, still
    /// hashes to the value recorded at chain time.
    pub matches: bool,
    pub expected_hash: Hash,
    pub actual_hash: Hash,
    /// Whether folding the recomputed `block_hash` onto the previous
    /// entry's chain hash still reproduces the recorded `chain_hash`.
    pub chain_hash_matches: bool,
    pub expected_chain_hash: Hash,
    pub actual_chain_hash: Hash,
}

/// Tri-state outcome of a full-chain verification. `Unknown` covers the
/// vacuous case — nothing has been chained yet, so nothing was checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainIntegrity {
    Valid,
    Invalid,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub total_blocks: usize,
    /// Count of entries, from genesis, whose block content and chain
    /// hash both still check out. Once one entry fails, every entry
    /// after it is also counted invalid even if it would otherwise
    /// recompute cleanly, since its chain hash was built on a tip that
    /// no longer holds.
    pub valid_blocks: usize,
    pub chain_integrity: ChainIntegrity,
}

impl ChainReport {
    pub fn is_intact(&self) -> bool {
        matches!(self.chain_integrity, ChainIntegrity::Valid)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proof {
    pub block_id: i64,
    pub sequence: u64,
    pub block_hash: Hash,
    pub chain_hash: Hash,
    /// Sibling hash and whether it sits to the left, from leaf to root.
    pub merkle_path: Vec<(Hash, bool)>,
    pub merkle_root: Hash,
}

struct ChainState {
    tip: Hash,
    entries: Vec<HashChainEntry>,
}

/// The chain itself. Cheap to hold alongside a [`BlockManager`]; nothing
/// here touches the filesystem directly.
pub struct HashChain {
    state: Mutex<ChainState>,
}

impl Default for HashChain {
    fn default() -> Self {
        Self::new()
    }
}

impl HashChain {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChainState { tip: GENESIS, entries: Vec::new() }),
        }
    }

    /// Replay every content block currently indexed by `mgr`, in offset
    /// order, folding each into a fresh chain. This is the recovery path:
    /// the chain carries no state the file itself doesn't already
    /// contain. Blocks of kind `HashChain` are the chain's own persisted
    /// entries (see [`Self::append_and_persist`]) and are skipped here —
    /// they describe the chain, they are not chained themselves.
    pub fn rebuild_from_manager(mgr: &BlockManager) -> Result<Self> {
        let chain = Self::new();
        let mut locations = mgr.scan_file()?;
        locations.sort_by_key(|l| l.offset);
        for location in locations {
            let block = mgr.read_at_location(location, None)?;
            if block.kind == BlockKind::HashChain {
                continue;
            }
            chain.append(&block)?;
        }
        Ok(chain)
    }

    /// Fold `block` into the chain and return the new tip entry. Purely
    /// in-memory; see [`Self::append_and_persist`] to also durably record
    /// the entry as a `HashChain`-kind block.
    pub fn append(&self, block: &Block) -> Result<HashChainEntry> {
        let block_hash = hash_block(block)?;
        let mut state = self.state.lock().expect("hash chain mutex poisoned");
        let mut preimage = Vec::with_capacity(64);
        preimage.extend_from_slice(&state.tip);
        preimage.extend_from_slice(&block_hash);
        let chain_hash = sha256(&preimage);

        let entry = HashChainEntry {
            sequence: state.entries.len() as u64,
            block_id: block.block_id,
            block_hash,
            chain_hash,
            timestamp: block.timestamp,
            previous_block_id: state.entries.last().map(|e| e.block_id),
        };
        state.tip = chain_hash;
        state.entries.push(entry);
        Ok(entry)
    }

    /// Fold `block` into the chain and persist the resulting entry as a
    /// `BlockKind::HashChain` block through `mgr`. The entry's own
    /// block id is tagged with [`ENTRY_ID_TAG`] so it never collides with
    /// a caller's `block_id` space, mirroring how `checkpoint.rs` tags
    /// its own administrative blocks.
    pub fn append_and_persist(
        &self,
        mgr: &BlockManager,
        block: &Block,
        cancel: Option<&CancelToken>,
    ) -> Result<HashChainEntry> {
        let entry = self.append(block)?;
        let payload = HashChainEntryPayload {
            sequence: entry.sequence,
            block_id: entry.block_id,
            block_hash: to_hex(&entry.block_hash),
            chain_hash: to_hex(&entry.chain_hash),
            timestamp: entry.timestamp,
            previous_block_id: entry.previous_block_id,
        };
        let serialized = serde_json::to_vec(&payload).map_err(|e| BlockError::Integrity(e.to_string()))?;
        let entry_block_id = ENTRY_ID_TAG | entry.sequence as i64;
        let entry_block =
            Block::new(BlockKind::HashChain, 0, PayloadEncoding::Json, entry.timestamp, entry_block_id, serialized);
        mgr.write_block(&entry_block, cancel)?;
        Ok(entry)
    }

    /// Load every persisted `HashChain`-kind entry from `mgr`, in
    /// sequence order, without recomputing anything from the content
    /// blocks they describe. Useful for inspecting chain history
    /// independent of the content blocks still being readable.
    pub fn load_persisted_entries(mgr: &BlockManager) -> Result<Vec<HashChainEntry>> {
        let mut locations = mgr.scan_file()?;
        locations.sort_by_key(|l| l.offset);
        let mut entries = Vec::new();
        for location in locations {
            let block = mgr.read_at_location(location, None)?;
            if block.kind != BlockKind::HashChain {
                continue;
            }
            let payload: HashChainEntryPayload =
                serde_json::from_slice(&block.payload).map_err(|e| BlockError::Integrity(e.to_string()))?;
            entries.push(HashChainEntry {
                sequence: payload.sequence,
                block_id: payload.block_id,
                block_hash: parse_hash(&payload.block_hash)?,
                chain_hash: parse_hash(&payload.chain_hash)?,
                timestamp: payload.timestamp,
                previous_block_id: payload.previous_block_id,
            });
        }
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    pub fn tip(&self) -> Hash {
        self.state.lock().expect("hash chain mutex poisoned").tip
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("hash chain mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read `block_id`'s current content from `mgr`, recompute its
    /// `block_hash`, and compare against the chain's recorded entry —
    /// tamper detection, since a single bit flip anywhere in the stored
    /// block changes its SHA-256 hash. Also recomputes `chain_hash` from
    /// the previous entry (or genesis, for the first one) folded with
    /// the recomputed `block_hash`, and compares that too, so a block
    /// whose own bytes are untouched but whose recorded chain hash was
    /// altered is still caught.
    pub fn verify_block(
        &self,
        block_id: i64,
        mgr: &BlockManager,
        cancel: Option<&CancelToken>,
    ) -> Result<VerificationReport> {
        let block = mgr.read_block(block_id, cancel)?;
        let state = self.state.lock().expect("hash chain mutex poisoned");
        let idx = state
            .entries
            .iter()
            .rposition(|e| e.block_id == block_id)
            .ok_or(BlockError::NotFound(block_id))?;
        let entry = state.entries[idx];
        let actual_hash = hash_block(&block)?;

        let previous_chain_hash = if idx == 0 { GENESIS } else { state.entries[idx - 1].chain_hash };
        let mut preimage = Vec::with_capacity(64);
        preimage.extend_from_slice(&previous_chain_hash);
        preimage.extend_from_slice(&actual_hash);
        let actual_chain_hash = sha256(&preimage);

        Ok(VerificationReport {
            block_id,
            matches: actual_hash == entry.block_hash,
            expected_hash: entry.block_hash,
            actual_hash,
            chain_hash_matches: actual_chain_hash == entry.chain_hash,
            expected_chain_hash: entry.chain_hash,
            actual_chain_hash,
        })
    }

    /// Walk every recorded link from genesis, reading each chained
    /// block's current content back from `mgr` and recomputing its
    /// `block_hash` and the running `chain_hash` from actual bytes on
    /// disk rather than the in-memory entry alone. Once a block fails to
    /// reproduce its recorded hash, every entry after it is also counted
    /// invalid, since the chain hash it would have been built on no
    /// longer holds.
    pub fn verify_entire_chain(&self, mgr: &BlockManager, cancel: Option<&CancelToken>) -> ChainReport {
        let state = self.state.lock().expect("hash chain mutex poisoned");
        let total_blocks = state.entries.len();
        let mut valid_blocks = 0usize;
        let mut tip = GENESIS;
        let mut broken = false;

        for entry in &state.entries {
            if broken {
                continue;
            }

            let recomputed_block_hash = match mgr.read_block(entry.block_id, cancel).and_then(|b| hash_block(&b)) {
                Ok(hash) => hash,
                Err(e) => {
                    warn!(
                        sequence = entry.sequence,
                        block_id = entry.block_id,
                        error = %e,
                        "hash chain verification could not read chained block"
                    );
                    broken = true;
                    continue;
                }
            };

            let mut preimage = Vec::with_capacity(64);
            preimage.extend_from_slice(&tip);
            preimage.extend_from_slice(&recomputed_block_hash);
            let recomputed_chain_hash = sha256(&preimage);

            if recomputed_block_hash != entry.block_hash || recomputed_chain_hash != entry.chain_hash {
                warn!(
                    sequence = entry.sequence,
                    block_id = entry.block_id,
                    expected = %to_hex(&entry.chain_hash),
                    recomputed = %to_hex(&recomputed_chain_hash),
                    "hash chain divergence detected"
                );
                broken = true;
                continue;
            }

            tip = recomputed_chain_hash;
            valid_blocks += 1;
        }

        let chain_integrity = if total_blocks == 0 {
            ChainIntegrity::Unknown
        } else if valid_blocks == total_blocks {
            ChainIntegrity::Valid
        } else {
            ChainIntegrity::Invalid
        };

        ChainReport { total_blocks, valid_blocks, chain_integrity }
    }

    /// Root of a binary Merkle tree over every recorded block hash, in
    /// chain order. Odd levels duplicate their last node, matching the
    /// common convention for an even-arity tree.
    pub fn merkle_root(&self) -> Hash {
        let state = self.state.lock().expect("hash chain mutex poisoned");
        Self::merkle_root_of(&state.entries.iter().map(|e| e.block_hash).collect::<Vec<_>>())
    }

    fn merkle_root_of(leaves: &[Hash]) -> Hash {
        if leaves.is_empty() {
            return GENESIS;
        }
        let mut level = leaves.to_vec();
        while level.len() > 1 {
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            for pair in level.chunks(2) {
                let mut preimage = Vec::with_capacity(64);
                preimage.extend_from_slice(&pair[0]);
                preimage.extend_from_slice(pair.get(1).unwrap_or(&pair[0]));
                next.push(sha256(&preimage));
            }
            level = next;
        }
        level[0]
    }

    /// Build a Merkle inclusion proof for `block_id`'s most recent entry,
    /// letting a caller prove the block belongs to this chain without
    /// handing over every other block.
    pub fn generate_existence_proof(&self, block_id: i64) -> Result<Proof> {
        let state = self.state.lock().expect("hash chain mutex poisoned");
        let idx = state
            .entries
            .iter()
            .rposition(|e| e.block_id == block_id)
            .ok_or(BlockError::NotFound(block_id))?;
        let entry = state.entries[idx];

        let leaves: Vec<Hash> = state.entries.iter().map(|e| e.block_hash).collect();
        let merkle_root = Self::merkle_root_of(&leaves);
        let merkle_path = Self::merkle_path_of(&leaves, idx);

        Ok(Proof {
            block_id: entry.block_id,
            sequence: entry.sequence,
            block_hash: entry.block_hash,
            chain_hash: entry.chain_hash,
            merkle_path,
            merkle_root,
        })
    }

    fn merkle_path_of(leaves: &[Hash], mut index: usize) -> Vec<(Hash, bool)> {
        let mut path = Vec::new();
        let mut level = leaves.to_vec();
        while level.len() > 1 {
            let sibling_index = if index % 2 == 0 { index + 1 } else { index - 1 };
            let sibling = *level.get(sibling_index).unwrap_or(&level[index]);
            path.push((sibling, index % 2 == 1)); // sibling_is_left
            let mut next = Vec::with_capacity(level.len().div_ceil(2));
            for pair in level.chunks(2) {
                let mut preimage = Vec::with_capacity(64);
                preimage.extend_from_slice(&pair[0]);
                preimage.extend_from_slice(pair.get(1).unwrap_or(&pair[0]));
                next.push(sha256(&preimage));
            }
            level = next;
            index /= 2;
        }
        path
    }
}

/// Verify a [`Proof`] against a root obtained independently (e.g. from a
/// checkpoint). Does not require holding the chain itself.
pub fn verify_proof(proof: &Proof) -> bool {
    let mut acc = proof.block_hash;
    for (sibling, sibling_is_left) in &proof.merkle_path {
        let mut preimage = Vec::with_capacity(64);
        if *sibling_is_left {
            preimage.extend_from_slice(sibling);
            preimage.extend_from_slice(&acc);
        } else {
            preimage.extend_from_slice(&acc);
            preimage.extend_from_slice(sibling);
        }
        acc = sha256(&preimage);
    }
    acc == proof.merkle_root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockKind, PayloadEncoding};
    use crate::manager::{BlockManager, ManagerOptions, Mode};
    use tempfile::NamedTempFile;

    fn sample(id: i64, payload: &[u8]) -> Block {
        Block::new(BlockKind::Metadata, 0, PayloadEncoding::RawBytes, 1000, id, payload.to_vec())
    }

    #[test]
    fn chain_grows_and_tip_changes() {
        let chain = HashChain::new();
        let genesis_tip = chain.tip();
        chain.append(&sample(1, b"a")).unwrap();
        assert_ne!(chain.tip(), genesis_tip);
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn verify_entire_chain_is_intact_after_normal_appends() {
        let tmp = NamedTempFile::new().unwrap();
        let mgr = BlockManager::open(tmp.path(), Mode::Writable, ManagerOptions { create_if_missing: true }).unwrap();
        let chain = HashChain::new();
        for i in 0..10 {
            let b = sample(i, format!("payload-{i}").as_bytes());
            mgr.write_block(&b, None).unwrap();
            chain.append(&b).unwrap();
        }
        let report = chain.verify_entire_chain(&mgr, None);
        assert!(report.is_intact());
        assert_eq!(report.total_blocks, 10);
        assert_eq!(report.valid_blocks, 10);
    }

    #[test]
    fn tampering_with_a_block_is_detected_by_verify_block() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        let mgr = BlockManager::open(&path, Mode::Writable, ManagerOptions { create_if_missing: true }).unwrap();
        let original = sample(1, b"hello");
        mgr.write_block(&original, None).unwrap();
        let chain = HashChain::new();
        chain.append(&original).unwrap();

        let mut tampered = original.clone();
        tampered.payload = b"hellp".to_vec();
        mgr.write_block(&tampered, None).unwrap();

        let report = chain.verify_block(1, &mgr, None).unwrap();
        assert!(!report.matches);
    }

    #[test]
    fn tampering_the_recorded_chain_hash_is_caught_by_full_verification() {
        let tmp = NamedTempFile::new().unwrap();
        let mgr = BlockManager::open(tmp.path(), Mode::Writable, ManagerOptions { create_if_missing: true }).unwrap();
        let chain = HashChain::new();
        for (id, payload) in [(1, b"a" as &[u8]), (2, b"b"), (3, b"c")] {
            let b = sample(id, payload);
            mgr.write_block(&b, None).unwrap();
            chain.append(&b).unwrap();
        }
        {
            let mut state = chain.state.lock().unwrap();
            state.entries[1].chain_hash[0] ^= 0xFF;
        }
        let report = chain.verify_entire_chain(&mgr, None);
        assert!(!report.is_intact());
        assert_eq!(report.valid_blocks, 1);
    }

    #[test]
    fn existence_proof_verifies_against_merkle_root() {
        let chain = HashChain::new();
        for i in 0..7 {
            chain.append(&sample(i, format!("p{i}").as_bytes())).unwrap();
        }
        for i in 0..7 {
            let proof = chain.generate_existence_proof(i).unwrap();
            assert_eq!(proof.merkle_root, chain.merkle_root());
            assert!(verify_proof(&proof));
        }
    }

    #[test]
    fn proof_for_tampered_hash_fails_verification() {
        let chain = HashChain::new();
        for i in 0..4 {
            chain.append(&sample(i, format!("p{i}").as_bytes())).unwrap();
        }
        let mut proof = chain.generate_existence_proof(2).unwrap();
        proof.block_hash[0] ^= 0xFF;
        assert!(!verify_proof(&proof));
    }

    #[test]
    fn to_hex_is_stable_and_lowercase() {
        let h = sha256(b"fixed input");
        let rendered = to_hex(&h);
        assert_eq!(rendered.len(), 64);
        assert_eq!(rendered, rendered.to_lowercase());
    }

    #[test]
    fn rebuild_from_manager_reproduces_same_chain() {
        let tmp = NamedTempFile::new().unwrap();
        let mgr = BlockManager::open(tmp.path(), Mode::Writable, ManagerOptions { create_if_missing: true }).unwrap();
        let direct = HashChain::new();
        for i in 0..5 {
            let b = sample(i, format!("p{i}").as_bytes());
            mgr.write_block(&b, None).unwrap();
            direct.append(&b).unwrap();
        }
        let rebuilt = HashChain::rebuild_from_manager(&mgr).unwrap();
        assert_eq!(rebuilt.tip(), direct.tip());
        assert_eq!(rebuilt.merkle_root(), direct.merkle_root());
    }

    #[test]
    fn append_and_persist_writes_a_hash_chain_kind_block() {
        let tmp = NamedTempFile::new().unwrap();
        let mgr = BlockManager::open(tmp.path(), Mode::Writable, ManagerOptions { create_if_missing: true }).unwrap();
        let chain = HashChain::new();
        let b = sample(1, b"content");
        mgr.write_block(&b, None).unwrap();
        let entry = chain.append_and_persist(&mgr, &b, None).unwrap();

        let persisted = HashChain::load_persisted_entries(&mgr).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].block_id, entry.block_id);
        assert_eq!(persisted[0].block_hash, entry.block_hash);
        assert_eq!(persisted[0].chain_hash, entry.chain_hash);
        assert_eq!(persisted[0].previous_block_id, None);
    }

    #[test]
    fn rebuild_from_manager_skips_persisted_hash_chain_blocks() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        let expected_tip;
        {
            let mgr = BlockManager::open(&path, Mode::Writable, ManagerOptions { create_if_missing: true }).unwrap();
            let chain = HashChain::new();
            for i in 0..4 {
                let b = sample(i, format!("p{i}").as_bytes());
                mgr.write_block(&b, None).unwrap();
                chain.append_and_persist(&mgr, &b, None).unwrap();
            }
            expected_tip = chain.tip();
            mgr.close().unwrap();
        }
        let mgr = BlockManager::open(&path, Mode::ReadOnly, ManagerOptions::default()).unwrap();
        let rebuilt = HashChain::rebuild_from_manager(&mgr).unwrap();
        assert_eq!(rebuilt.tip(), expected_tip);
        assert_eq!(rebuilt.len(), 4, "only the 4 content blocks should be chained, not their HashChain entries");
    }

    #[test]
    fn second_entry_records_previous_block_id() {
        let tmp = NamedTempFile::new().unwrap();
        let mgr = BlockManager::open(tmp.path(), Mode::Writable, ManagerOptions { create_if_missing: true }).unwrap();
        let chain = HashChain::new();
        let b1 = sample(10, b"first");
        let b2 = sample(20, b"second");
        mgr.write_block(&b1, None).unwrap();
        mgr.write_block(&b2, None).unwrap();
        chain.append_and_persist(&mgr, &b1, None).unwrap();
        let entry2 = chain.append_and_persist(&mgr, &b2, None).unwrap();
        assert_eq!(entry2.previous_block_id, Some(10));
    }
}
