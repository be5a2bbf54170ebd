//! Dataset builder: consumes a block stream in chain order and emits the
//! complete on-disk dataset in one pass.
//!
//! Item payloads and per-item leaf hashes stream straight to disk; the
//! (prefix, wire-index) records for both secondary indexes detour through
//! external sorters whose sinks are the two multimap writers, so the maps
//! see their keys in sorted order when the build closes.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::config::{
    BuildConfig, IndexConfig, Parameters, ADDRESSES_FASTMAP_DATA_FILE,
    ADDRESSES_FASTMAP_PREFIXES_FILE, ADDRESSES_INDICES_FILE, ADDRESSES_TMP_FILE, BLOCKCHAIN_FILE,
    BLOCK_LOCATIONS_FILE, CONTRACTS_FASTMAP_DATA_FILE, CONTRACTS_FASTMAP_PREFIXES_FILE,
    CONTRACTS_INDICES_FILE, CONTRACTS_TMP_FILE, HEADERS_FILE, LEAVES_HASHES_FILE, OFFSETS_FILE,
    PARAMETERS_FILE,
};
use crate::emsort::{ExternalSorter, Sink};
use crate::encoding::Encodable;
use crate::errconfig;
use crate::error::{Error, Result};
use crate::fastmap::{Inliner, MultiMapWriter};
use crate::merkle;
use crate::types::{Block, FileContractId, Hash, UnlockHash};

type FileSink = MultiMapWriter<BufWriter<File>, BufWriter<File>, BufWriter<File>>;

impl Sink for FileSink {
    fn write(&mut self, record: &[u8]) -> Result<()> {
        MultiMapWriter::write(self, record)
    }

    fn finish(&mut self) -> Result<()> {
        MultiMapWriter::finish(self)
    }
}

#[derive(Debug)]
pub struct Builder {
    dir: PathBuf,

    blockchain: BufWriter<File>,
    blockchain_len: u64,
    offsets: BufWriter<File>,
    block_locations: BufWriter<File>,
    headers: BufWriter<File>,
    leaves_hashes: BufWriter<File>,

    addresses: ExternalSorter<FileSink>,
    contracts: ExternalSorter<FileSink>,

    snappy: snap::raw::Encoder,

    item_index: u64,
    height: u64,
    offset_len: usize,
    offset_index_len: usize,
    address_prefix_len: usize,
    contract_prefix_len: usize,
    // Largest byte offset the offsets file can express.
    offset_end: u64,
}

fn create(dir: &Path, name: &str) -> Result<BufWriter<File>> {
    let file = File::create(dir.join(name))
        .map_err(|e| Error::Io(format!("creating {name}: {e}")))?;
    Ok(BufWriter::new(file))
}

fn index_sink(dir: &Path, config: &BuildConfig, index: &IndexConfig, files: [&str; 3]) -> Result<FileSink> {
    let [data, prefixes, indices] = files;
    MultiMapWriter::new(
        index.page_len,
        index.prefix_len,
        config.offset_index_len,
        index.fastmap_prefix_len,
        index.offset_len,
        Inliner::choose(config.offset_index_len, index.offset_len),
        create(dir, data)?,
        create(dir, prefixes)?,
        create(dir, indices)?,
    )
}

fn index_sorter(dir: &Path, config: &BuildConfig, index: &IndexConfig, sink: FileSink, tmp_name: &str) -> Result<ExternalSorter<FileSink>> {
    let tmp = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(dir.join(tmp_name))
        .map_err(|e| Error::Io(format!("creating {tmp_name}: {e}")))?;
    let record_size = index.prefix_len + config.offset_index_len;
    ExternalSorter::new(sink, record_size, false, config.mem_limit, tmp)
}

impl Builder {
    /// Starts a build into `dir`, which must be empty. parameters.json is
    /// written first and never rewritten.
    pub fn new(dir: impl AsRef<Path>, config: BuildConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        config.validate()?;
        fs::create_dir_all(&dir)?;
        if fs::read_dir(&dir)?.next().is_some() {
            return Err(errconfig!("output directory {} is not empty", dir.display()));
        }

        let params = Parameters::from(&config);
        let mut params_file = File::create(dir.join(PARAMETERS_FILE))?;
        serde_json::to_writer_pretty(&mut params_file, &params)?;
        params_file.write_all(b"\n")?;

        let addresses = index_sorter(
            &dir,
            &config,
            &config.address,
            index_sink(
                &dir,
                &config,
                &config.address,
                [ADDRESSES_FASTMAP_DATA_FILE, ADDRESSES_FASTMAP_PREFIXES_FILE, ADDRESSES_INDICES_FILE],
            )?,
            ADDRESSES_TMP_FILE,
        )?;
        let contracts = index_sorter(
            &dir,
            &config,
            &config.contract,
            index_sink(
                &dir,
                &config,
                &config.contract,
                [CONTRACTS_FASTMAP_DATA_FILE, CONTRACTS_FASTMAP_PREFIXES_FILE, CONTRACTS_INDICES_FILE],
            )?,
            CONTRACTS_TMP_FILE,
        )?;

        let offset_end = if config.offset_len == 8 {
            u64::MAX
        } else {
            (1u64 << (8 * config.offset_len)) - 1
        };

        Ok(Self {
            blockchain: create(&dir, BLOCKCHAIN_FILE)?,
            blockchain_len: 0,
            offsets: create(&dir, OFFSETS_FILE)?,
            block_locations: create(&dir, BLOCK_LOCATIONS_FILE)?,
            headers: create(&dir, HEADERS_FILE)?,
            leaves_hashes: create(&dir, LEAVES_HASHES_FILE)?,
            addresses,
            contracts,
            snappy: snap::raw::Encoder::new(),
            item_index: 0,
            height: 0,
            offset_len: config.offset_len,
            offset_index_len: config.offset_index_len,
            address_prefix_len: config.address.prefix_len,
            contract_prefix_len: config.contract.prefix_len,
            offset_end,
            dir,
        })
    }

    fn write_offset(&mut self) -> Result<()> {
        let mut buf = [0u8; 8];
        LittleEndian::write_u64(&mut buf, self.blockchain_len);
        self.offsets.write_all(&buf[..self.offset_len])?;
        Ok(())
    }

    /// The on-wire item index: logical index + 1, big-endian, truncated to
    /// `offset_index_len` bytes.
    fn wire_index(&self) -> Result<[u8; 8]> {
        let wire = self.item_index + 1;
        if self.offset_index_len < 8 && wire >= 1 << (8 * self.offset_index_len) {
            return Err(Error::OffsetTooNarrow);
        }
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, wire);
        Ok(buf)
    }

    fn write_address(&mut self, unlock_hash: &UnlockHash) -> Result<()> {
        let wire = self.wire_index()?;
        let mut record = Vec::with_capacity(self.address_prefix_len + self.offset_index_len);
        record.extend_from_slice(&unlock_hash[..self.address_prefix_len]);
        record.extend_from_slice(&wire[8 - self.offset_index_len..]);
        self.addresses.write(&record)
    }

    fn write_contract(&mut self, id: &FileContractId) -> Result<()> {
        let wire = self.wire_index()?;
        let mut record = Vec::with_capacity(self.contract_prefix_len + self.offset_index_len);
        record.extend_from_slice(&id[..self.contract_prefix_len]);
        record.extend_from_slice(&wire[8 - self.offset_index_len..]);
        self.contracts.write(&record)
    }

    /// Ingests the next block in chain order.
    pub fn add(&mut self, block: &Block) -> Result<()> {
        let payout_payloads: Vec<Vec<u8>> =
            block.miner_payouts.iter().map(|p| p.to_vec()).collect();
        let tx_payloads: Vec<Vec<u8>> = block.transactions.iter().map(|t| t.to_vec()).collect();
        let leaves: Vec<Hash> = payout_payloads
            .iter()
            .chain(tx_payloads.iter())
            .map(|p| merkle::leaf_hash(p))
            .collect();
        let root = merkle::root(&leaves);

        self.headers.write_all(&block.nonce)?;
        let mut ts = [0u8; 8];
        LittleEndian::write_u64(&mut ts, block.timestamp);
        self.headers.write_all(&ts)?;
        self.headers.write_all(&root)?;

        let first_miner_payout = self.item_index;
        for (payout, payload) in block.miner_payouts.iter().zip(&payout_payloads) {
            self.write_offset()?;
            self.write_address(&payout.unlock_hash)?;
            self.leaves_hashes.write_all(&leaves[(self.item_index - first_miner_payout) as usize])?;
            self.blockchain.write_all(payload)?;
            self.blockchain_len += payload.len() as u64;
            self.item_index += 1;
        }

        let first_transaction = self.item_index;
        for (i, (tx, payload)) in block.transactions.iter().zip(&tx_payloads).enumerate() {
            self.write_offset()?;
            for input in &tx.siacoin_inputs {
                self.write_address(&input.unlock_conditions.unlock_hash())?;
            }
            for input in &tx.siafund_inputs {
                self.write_address(&input.unlock_conditions.unlock_hash())?;
                self.write_address(&input.claim_unlock_hash)?;
            }
            for output in &tx.siacoin_outputs {
                self.write_address(&output.unlock_hash)?;
            }
            for output in &tx.siafund_outputs {
                self.write_address(&output.unlock_hash)?;
            }
            for (j, contract) in tx.file_contracts.iter().enumerate() {
                self.write_contract(&tx.file_contract_id(j as u64))?;
                for output in &contract.valid_proof_outputs {
                    self.write_address(&output.unlock_hash)?;
                }
                for output in &contract.missed_proof_outputs {
                    self.write_address(&output.unlock_hash)?;
                }
            }
            for revision in &tx.file_contract_revisions {
                self.write_contract(&revision.parent_id)?;
                for output in &revision.new_valid_proof_outputs {
                    self.write_address(&output.unlock_hash)?;
                }
                for output in &revision.new_missed_proof_outputs {
                    self.write_address(&output.unlock_hash)?;
                }
            }
            for proof in &tx.storage_proofs {
                self.write_contract(&proof.parent_id)?;
            }
            let leaf = &leaves[block.miner_payouts.len() + i];
            self.leaves_hashes.write_all(leaf)?;
            let compressed = self.snappy.compress_vec(payload)?;
            self.blockchain.write_all(&compressed)?;
            self.blockchain_len += compressed.len() as u64;
            self.item_index += 1;
        }

        let mut loc = [0u8; 16];
        LittleEndian::write_u64(&mut loc[..8], first_miner_payout);
        LittleEndian::write_u64(&mut loc[8..], first_transaction);
        self.block_locations.write_all(&loc[..self.offset_index_len])?;
        self.block_locations.write_all(&loc[8..8 + self.offset_index_len])?;

        if self.blockchain_len > self.offset_end {
            return Err(Error::OffsetSpaceExhausted);
        }
        self.height += 1;
        Ok(())
    }

    /// Flushes every writer and runs the deferred sort-and-index work.
    /// The dataset is complete and immutable once this returns.
    pub fn close(mut self) -> Result<()> {
        self.blockchain.flush()?;
        self.offsets.flush()?;
        self.block_locations.flush()?;
        self.headers.flush()?;
        self.leaves_hashes.flush()?;
        self.addresses.close()?;
        self.contracts.close()?;
        fs::remove_file(self.dir.join(ADDRESSES_TMP_FILE))?;
        fs::remove_file(self.dir.join(CONTRACTS_TMP_FILE))?;
        tracing::info!(
            blocks = self.height,
            items = self.item_index,
            bytes = self.blockchain_len,
            "dataset built"
        );
        Ok(())
    }
}
