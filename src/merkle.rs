//! Merkle tree over a block's item leaves.
//!
//! Leaves are `SHA256(0x00 || data)`, interior nodes `SHA256(0x01 || l || r)`.
//! Trees with a non-power-of-two leaf count split at the largest power of
//! two, so every stored root and proof has a single canonical shape.

use sha2::{Digest, Sha256};

use crate::types::{Hash, HASH_SIZE};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Hash of one leaf's raw serialized bytes.
pub fn leaf_hash(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(data);
    hasher.finalize().into()
}

fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Largest power of two strictly less than n. Requires n >= 2.
fn split_point(n: usize) -> usize {
    let mut k = 1;
    while k * 2 < n {
        k *= 2;
    }
    k
}

/// Root over already-hashed leaves. An empty slice yields the zero hash.
pub fn root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return Hash::default();
    }
    root_range(leaves)
}

fn root_range(leaves: &[Hash]) -> Hash {
    if leaves.len() == 1 {
        return leaves[0];
    }
    let mid = split_point(leaves.len());
    node_hash(&root_range(&leaves[..mid]), &root_range(&leaves[mid..]))
}

/// Sibling hashes proving `leaves[index]`, ordered from the leaf level up.
/// The concatenated form of this list is what the server returns.
pub fn prove(leaves: &[Hash], index: usize) -> Vec<Hash> {
    assert!(index < leaves.len(), "proof index out of range");
    let mut path = Vec::new();
    prove_range(leaves, index, &mut path);
    path
}

fn prove_range(leaves: &[Hash], index: usize, path: &mut Vec<Hash>) {
    if leaves.len() <= 1 {
        return;
    }
    let mid = split_point(leaves.len());
    if index < mid {
        prove_range(&leaves[..mid], index, path);
        path.push(root_range(&leaves[mid..]));
    } else {
        prove_range(&leaves[mid..], index - mid, path);
        path.push(root_range(&leaves[..mid]));
    }
}

/// Checks an inclusion proof for the raw item bytes at `index` in a tree
/// of `num_leaves` leaves. `proof` is the concatenation of sibling hashes
/// in proof order.
pub fn verify_proof(
    merkle_root: &Hash,
    data: &[u8],
    proof: &[u8],
    index: usize,
    num_leaves: usize,
) -> bool {
    if proof.len() % HASH_SIZE != 0 || index >= num_leaves {
        return false;
    }
    let mut node = index;
    let mut last = num_leaves - 1;
    let mut acc = leaf_hash(data);
    for sibling in proof.chunks_exact(HASH_SIZE) {
        if last == 0 {
            return false;
        }
        let sibling: Hash = sibling.try_into().expect("chunk is HASH_SIZE bytes");
        if node & 1 == 1 || node == last {
            acc = node_hash(&sibling, &acc);
            if node & 1 == 0 {
                while node & 1 == 0 && node != 0 {
                    node >>= 1;
                    last >>= 1;
                }
            }
        } else {
            acc = node_hash(&acc, &sibling);
        }
        node >>= 1;
        last >>= 1;
    }
    last == 0 && acc == *merkle_root
}
