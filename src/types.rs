//! Chain domain types and their canonical encoding.
//!
//! The byte form produced by [`Encodable`] here is what the builder hashes
//! into Merkle leaves and appends to the item store, so it is part of the
//! dataset format and must stay stable.

use std::io::{BufRead, Read, Write};

use sha2::{Digest, Sha256};

use crate::encoding::{
    read_array, read_bytes, read_list, read_u64, write_bytes, write_list, write_u64, Decodable,
    Encodable,
};
use crate::error::Result;
use crate::merkle;

pub const HASH_SIZE: usize = 32;

/// On-disk width of one block-header record:
/// `nonce (8) || timestamp LE (8) || merkle root (32)`.
pub const HEADER_LEN: usize = 48;

pub type Hash = [u8; HASH_SIZE];
pub type BlockId = Hash;
pub type UnlockHash = Hash;
pub type FileContractId = Hash;
pub type BlockNonce = [u8; 8];

/// 16-byte tag namespacing derived identifiers.
type Specifier = [u8; 16];

const SPECIFIER_FILE_CONTRACT: Specifier = *b"file contract\0\0\0";
const SPECIFIER_ED25519: Specifier = *b"ed25519\0\0\0\0\0\0\0\0\0";

fn sha256(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Currency values are encoded as a length-prefixed minimal big-endian
/// integer, so small amounts stay small on disk.
impl Encodable for u128 {
    fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        let bytes = self.to_be_bytes();
        let first = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
        write_bytes(w, &bytes[first..])
    }
}

impl Decodable for u128 {
    fn decode<R: Read>(r: &mut R) -> Result<Self> {
        let raw = read_bytes(r)?;
        if raw.len() > 16 || (raw.len() > 1 && raw[0] == 0) {
            return Err(crate::errcorrupt!("non-minimal currency encoding"));
        }
        let mut bytes = [0u8; 16];
        bytes[16 - raw.len()..].copy_from_slice(&raw);
        Ok(u128::from_be_bytes(bytes))
    }
}

impl Encodable for Hash {
    fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(self)?;
        Ok(())
    }
}

impl Decodable for Hash {
    fn decode<R: Read>(r: &mut R) -> Result<Self> {
        read_array(r)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublicKey {
    pub algorithm: Specifier,
    pub key: Vec<u8>,
}

impl PublicKey {
    pub fn ed25519(key: Vec<u8>) -> Self {
        Self { algorithm: SPECIFIER_ED25519, key }
    }
}

impl Encodable for PublicKey {
    fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.algorithm)?;
        write_bytes(w, &self.key)
    }
}

impl Decodable for PublicKey {
    fn decode<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self { algorithm: read_array(r)?, key: read_bytes(r)? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UnlockConditions {
    pub timelock: u64,
    pub public_keys: Vec<PublicKey>,
    pub signatures_required: u64,
}

impl UnlockConditions {
    /// The address form of these conditions.
    pub fn unlock_hash(&self) -> UnlockHash {
        sha256(&[&self.to_vec()])
    }
}

impl Encodable for UnlockConditions {
    fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        write_u64(w, self.timelock)?;
        write_list(w, &self.public_keys)?;
        write_u64(w, self.signatures_required)
    }
}

impl Decodable for UnlockConditions {
    fn decode<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self {
            timelock: read_u64(r)?,
            public_keys: read_list(r)?,
            signatures_required: read_u64(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SiacoinInput {
    pub parent_id: Hash,
    pub unlock_conditions: UnlockConditions,
}

impl Encodable for SiacoinInput {
    fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        self.parent_id.encode(w)?;
        self.unlock_conditions.encode(w)
    }
}

impl Decodable for SiacoinInput {
    fn decode<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self { parent_id: Decodable::decode(r)?, unlock_conditions: Decodable::decode(r)? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SiafundInput {
    pub parent_id: Hash,
    pub unlock_conditions: UnlockConditions,
    pub claim_unlock_hash: UnlockHash,
}

impl Encodable for SiafundInput {
    fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        self.parent_id.encode(w)?;
        self.unlock_conditions.encode(w)?;
        self.claim_unlock_hash.encode(w)
    }
}

impl Decodable for SiafundInput {
    fn decode<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self {
            parent_id: Decodable::decode(r)?,
            unlock_conditions: Decodable::decode(r)?,
            claim_unlock_hash: Decodable::decode(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SiacoinOutput {
    pub value: u128,
    pub unlock_hash: UnlockHash,
}

impl Encodable for SiacoinOutput {
    fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        self.value.encode(w)?;
        self.unlock_hash.encode(w)
    }
}

impl Decodable for SiacoinOutput {
    fn decode<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self { value: Decodable::decode(r)?, unlock_hash: Decodable::decode(r)? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SiafundOutput {
    pub value: u128,
    pub unlock_hash: UnlockHash,
}

impl Encodable for SiafundOutput {
    fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        self.value.encode(w)?;
        self.unlock_hash.encode(w)
    }
}

impl Decodable for SiafundOutput {
    fn decode<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self { value: Decodable::decode(r)?, unlock_hash: Decodable::decode(r)? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileContract {
    pub file_size: u64,
    pub file_merkle_root: Hash,
    pub window_start: u64,
    pub window_end: u64,
    pub payout: u128,
    pub valid_proof_outputs: Vec<SiacoinOutput>,
    pub missed_proof_outputs: Vec<SiacoinOutput>,
    pub unlock_hash: UnlockHash,
    pub revision_number: u64,
}

impl Encodable for FileContract {
    fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        write_u64(w, self.file_size)?;
        self.file_merkle_root.encode(w)?;
        write_u64(w, self.window_start)?;
        write_u64(w, self.window_end)?;
        self.payout.encode(w)?;
        write_list(w, &self.valid_proof_outputs)?;
        write_list(w, &self.missed_proof_outputs)?;
        self.unlock_hash.encode(w)?;
        write_u64(w, self.revision_number)
    }
}

impl Decodable for FileContract {
    fn decode<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self {
            file_size: read_u64(r)?,
            file_merkle_root: Decodable::decode(r)?,
            window_start: read_u64(r)?,
            window_end: read_u64(r)?,
            payout: Decodable::decode(r)?,
            valid_proof_outputs: read_list(r)?,
            missed_proof_outputs: read_list(r)?,
            unlock_hash: Decodable::decode(r)?,
            revision_number: read_u64(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileContractRevision {
    pub parent_id: FileContractId,
    pub unlock_conditions: UnlockConditions,
    pub new_revision_number: u64,
    pub new_file_size: u64,
    pub new_file_merkle_root: Hash,
    pub new_window_start: u64,
    pub new_window_end: u64,
    pub new_valid_proof_outputs: Vec<SiacoinOutput>,
    pub new_missed_proof_outputs: Vec<SiacoinOutput>,
    pub new_unlock_hash: UnlockHash,
}

impl Encodable for FileContractRevision {
    fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        self.parent_id.encode(w)?;
        self.unlock_conditions.encode(w)?;
        write_u64(w, self.new_revision_number)?;
        write_u64(w, self.new_file_size)?;
        self.new_file_merkle_root.encode(w)?;
        write_u64(w, self.new_window_start)?;
        write_u64(w, self.new_window_end)?;
        write_list(w, &self.new_valid_proof_outputs)?;
        write_list(w, &self.new_missed_proof_outputs)?;
        self.new_unlock_hash.encode(w)
    }
}

impl Decodable for FileContractRevision {
    fn decode<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self {
            parent_id: Decodable::decode(r)?,
            unlock_conditions: Decodable::decode(r)?,
            new_revision_number: read_u64(r)?,
            new_file_size: read_u64(r)?,
            new_file_merkle_root: Decodable::decode(r)?,
            new_window_start: read_u64(r)?,
            new_window_end: read_u64(r)?,
            new_valid_proof_outputs: read_list(r)?,
            new_missed_proof_outputs: read_list(r)?,
            new_unlock_hash: Decodable::decode(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageProof {
    pub parent_id: FileContractId,
    pub segment: [u8; 64],
    pub hash_set: Vec<Hash>,
}

impl Default for StorageProof {
    fn default() -> Self {
        Self { parent_id: Hash::default(), segment: [0u8; 64], hash_set: Vec::new() }
    }
}

impl Encodable for StorageProof {
    fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        self.parent_id.encode(w)?;
        w.write_all(&self.segment)?;
        write_list(w, &self.hash_set)
    }
}

impl Decodable for StorageProof {
    fn decode<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self {
            parent_id: Decodable::decode(r)?,
            segment: read_array(r)?,
            hash_set: read_list(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Transaction {
    pub siacoin_inputs: Vec<SiacoinInput>,
    pub siacoin_outputs: Vec<SiacoinOutput>,
    pub file_contracts: Vec<FileContract>,
    pub file_contract_revisions: Vec<FileContractRevision>,
    pub storage_proofs: Vec<StorageProof>,
    pub siafund_inputs: Vec<SiafundInput>,
    pub siafund_outputs: Vec<SiafundOutput>,
    pub miner_fees: Vec<u128>,
    pub arbitrary_data: Vec<Vec<u8>>,
}

impl Transaction {
    /// Id of the index-th file contract created by this transaction.
    pub fn file_contract_id(&self, index: u64) -> FileContractId {
        sha256(&[&SPECIFIER_FILE_CONTRACT, &self.to_vec(), &index.to_le_bytes()])
    }
}

impl Encodable for Transaction {
    fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        write_list(w, &self.siacoin_inputs)?;
        write_list(w, &self.siacoin_outputs)?;
        write_list(w, &self.file_contracts)?;
        write_list(w, &self.file_contract_revisions)?;
        write_list(w, &self.storage_proofs)?;
        write_list(w, &self.siafund_inputs)?;
        write_list(w, &self.siafund_outputs)?;
        write_list(w, &self.miner_fees)?;
        write_list(w, &self.arbitrary_data)
    }
}

impl Decodable for Transaction {
    fn decode<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self {
            siacoin_inputs: read_list(r)?,
            siacoin_outputs: read_list(r)?,
            file_contracts: read_list(r)?,
            file_contract_revisions: read_list(r)?,
            storage_proofs: read_list(r)?,
            siafund_inputs: read_list(r)?,
            siafund_outputs: read_list(r)?,
            miner_fees: read_list(r)?,
            arbitrary_data: read_list(r)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Block {
    pub parent_id: BlockId,
    pub nonce: BlockNonce,
    pub timestamp: u64,
    pub miner_payouts: Vec<SiacoinOutput>,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Root of the Merkle tree over this block's items: miner payouts
    /// first, then transactions, hashed over their canonical encodings.
    pub fn merkle_root(&self) -> Hash {
        let mut leaves = Vec::with_capacity(self.miner_payouts.len() + self.transactions.len());
        for payout in &self.miner_payouts {
            leaves.push(merkle::leaf_hash(&payout.to_vec()));
        }
        for tx in &self.transactions {
            leaves.push(merkle::leaf_hash(&tx.to_vec()));
        }
        merkle::root(&leaves)
    }

    /// The block id: hash of the canonical 80-byte header form.
    pub fn id(&self) -> BlockId {
        block_id(&self.parent_id, &self.nonce, self.timestamp, &self.merkle_root())
    }
}

/// Canonical block-id hashing over `parent || nonce || timestamp || root`.
pub fn block_id(parent_id: &BlockId, nonce: &BlockNonce, timestamp: u64, merkle_root: &Hash) -> BlockId {
    sha256(&[parent_id, nonce, &timestamp.to_le_bytes(), merkle_root])
}

impl Encodable for Block {
    fn encode<W: Write>(&self, w: &mut W) -> Result<()> {
        self.parent_id.encode(w)?;
        w.write_all(&self.nonce)?;
        write_u64(w, self.timestamp)?;
        write_list(w, &self.miner_payouts)?;
        write_list(w, &self.transactions)
    }
}

impl Decodable for Block {
    fn decode<R: Read>(r: &mut R) -> Result<Self> {
        Ok(Self {
            parent_id: Decodable::decode(r)?,
            nonce: read_array(r)?,
            timestamp: read_u64(r)?,
            miner_payouts: read_list(r)?,
            transactions: read_list(r)?,
        })
    }
}

/// Reads consecutive canonically-encoded blocks from a stream, e.g. a
/// blocks file recorded by the downloader.
pub struct BlockReader<R: BufRead> {
    inner: R,
}

impl<R: BufRead> BlockReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Returns the next block, or None at a clean end of stream.
    pub fn next_block(&mut self) -> Result<Option<Block>> {
        if self.inner.fill_buf()?.is_empty() {
            return Ok(None);
        }
        Ok(Some(Block::decode(&mut self.inner)?))
    }
}
