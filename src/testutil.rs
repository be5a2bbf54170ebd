//! Deterministic synthetic chains shared by the crate's tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::types::{
    Block, BlockId, FileContract, FileContractId, FileContractRevision, PublicKey, SiacoinInput,
    SiacoinOutput, SiafundInput, SiafundOutput, StorageProof, Transaction, UnlockConditions,
    UnlockHash,
};

const GENESIS_TIMESTAMP: u64 = 1_433_600_000;

/// A fixed pool of payout/output addresses, each with a distinct first
/// byte so a bit-flipped probe never collides.
pub fn payout_addresses() -> Vec<UnlockHash> {
    (1u8..=6).map(|i| [i.wrapping_mul(31); 32]).collect()
}

fn conditions(rng: &mut StdRng) -> UnlockConditions {
    UnlockConditions {
        timelock: 0,
        public_keys: vec![PublicKey::ed25519(rng.gen::<[u8; 32]>().to_vec())],
        signatures_required: 1,
    }
}

fn transaction(rng: &mut StdRng, pool: &[UnlockHash], contracts: &mut Vec<FileContractId>) -> Transaction {
    let mut tx = Transaction::default();
    for _ in 0..rng.gen_range(0..=2) {
        tx.siacoin_inputs.push(SiacoinInput {
            parent_id: rng.gen(),
            unlock_conditions: conditions(rng),
        });
    }
    for _ in 0..rng.gen_range(1..=2) {
        tx.siacoin_outputs.push(SiacoinOutput {
            value: rng.gen_range(1..1_000_000),
            unlock_hash: pool[rng.gen_range(0..pool.len())],
        });
    }
    if rng.gen_ratio(1, 4) {
        tx.siafund_inputs.push(SiafundInput {
            parent_id: rng.gen(),
            unlock_conditions: conditions(rng),
            claim_unlock_hash: pool[rng.gen_range(0..pool.len())],
        });
        tx.siafund_outputs.push(SiafundOutput {
            value: rng.gen_range(1..10_000),
            unlock_hash: pool[rng.gen_range(0..pool.len())],
        });
    }
    if rng.gen_ratio(1, 3) {
        tx.file_contracts.push(FileContract {
            file_size: rng.gen_range(0..1 << 20),
            file_merkle_root: rng.gen(),
            window_start: rng.gen_range(10..100),
            window_end: rng.gen_range(100..200),
            payout: rng.gen_range(1..1_000_000),
            valid_proof_outputs: vec![SiacoinOutput {
                value: rng.gen_range(1..1000),
                unlock_hash: pool[rng.gen_range(0..pool.len())],
            }],
            missed_proof_outputs: vec![SiacoinOutput {
                value: rng.gen_range(1..1000),
                unlock_hash: pool[rng.gen_range(0..pool.len())],
            }],
            unlock_hash: pool[rng.gen_range(0..pool.len())],
            revision_number: 0,
        });
    }
    if !contracts.is_empty() && rng.gen_ratio(1, 4) {
        tx.file_contract_revisions.push(FileContractRevision {
            parent_id: contracts[rng.gen_range(0..contracts.len())],
            unlock_conditions: conditions(rng),
            new_revision_number: 1,
            new_file_size: rng.gen_range(0..1 << 20),
            new_file_merkle_root: rng.gen(),
            new_window_start: rng.gen_range(10..100),
            new_window_end: rng.gen_range(100..200),
            new_valid_proof_outputs: vec![SiacoinOutput {
                value: rng.gen_range(1..1000),
                unlock_hash: pool[rng.gen_range(0..pool.len())],
            }],
            new_missed_proof_outputs: vec![SiacoinOutput {
                value: rng.gen_range(1..1000),
                unlock_hash: pool[rng.gen_range(0..pool.len())],
            }],
            new_unlock_hash: pool[rng.gen_range(0..pool.len())],
        });
    }
    if !contracts.is_empty() && rng.gen_ratio(1, 4) {
        tx.storage_proofs.push(StorageProof {
            parent_id: contracts[rng.gen_range(0..contracts.len())],
            segment: [rng.gen(); 64],
            hash_set: vec![rng.gen()],
        });
    }
    tx.miner_fees.push(rng.gen_range(1..1000));
    for j in 0..tx.file_contracts.len() {
        contracts.push(tx.file_contract_id(j as u64));
    }
    tx
}

/// A deterministic chain: every block pays at least one pool address,
/// every block past genesis carries transactions that reference pool
/// addresses and occasionally create, revise, or prove file contracts.
pub fn chain(n: usize, seed: u64) -> Vec<Block> {
    let mut rng = StdRng::seed_from_u64(seed);
    let pool = payout_addresses();
    let mut contracts = Vec::new();
    let mut parent_id = BlockId::default();
    let mut blocks = Vec::with_capacity(n);
    for height in 0..n {
        let mut block = Block {
            parent_id,
            nonce: rng.gen(),
            timestamp: GENESIS_TIMESTAMP + 600 * height as u64,
            miner_payouts: Vec::new(),
            transactions: Vec::new(),
        };
        for p in 0..1 + height % 2 {
            block.miner_payouts.push(SiacoinOutput {
                value: 300_000 + height as u128,
                unlock_hash: pool[(height + p) % pool.len()],
            });
        }
        if height >= 1 {
            for _ in 0..rng.gen_range(1..=3) {
                let tx = transaction(&mut rng, &pool, &mut contracts);
                block.transactions.push(tx);
            }
        }
        parent_id = block.id();
        blocks.push(block);
    }
    blocks
}

/// Ids of every file contract created anywhere in `blocks`.
pub fn contract_ids(blocks: &[Block]) -> Vec<FileContractId> {
    let mut ids = Vec::new();
    for block in blocks {
        for tx in &block.transactions {
            for j in 0..tx.file_contracts.len() {
                ids.push(tx.file_contract_id(j as u64));
            }
        }
    }
    ids
}

/// A chain of `n` single-payout blocks all paying the same address; one
/// history entry per block.
pub fn payout_chain(address: &UnlockHash, n: usize) -> Vec<Block> {
    let mut parent_id = BlockId::default();
    let mut blocks = Vec::with_capacity(n);
    for height in 0..n {
        let block = Block {
            parent_id,
            nonce: (height as u64).to_le_bytes(),
            timestamp: GENESIS_TIMESTAMP + 600 * height as u64,
            miner_payouts: vec![SiacoinOutput { value: 1 + height as u128, unlock_hash: *address }],
            transactions: Vec::new(),
        };
        parent_id = block.id();
        blocks.push(block);
    }
    blocks
}
