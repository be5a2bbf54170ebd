//! Read-only query engine over a built dataset.
//!
//! Every file is mmapped once at open; lookups and item fetches then run
//! without locks or shared mutable state, so concurrent queries are safe.
//! `Item::data` borrows straight from the mapped item store.

use std::borrow::Cow;
use std::fs::File;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use itertools::Itertools;
use memmap2::Mmap;

use crate::config::{
    Parameters, ADDRESSES_FASTMAP_DATA_FILE, ADDRESSES_FASTMAP_PREFIXES_FILE,
    ADDRESSES_INDICES_FILE, BLOCKCHAIN_FILE, BLOCK_LOCATIONS_FILE, CONTRACTS_FASTMAP_DATA_FILE,
    CONTRACTS_FASTMAP_PREFIXES_FILE, CONTRACTS_INDICES_FILE, HEADERS_FILE, LEAVES_HASHES_FILE,
    OFFSETS_FILE, PARAMETERS_FILE,
};
use crate::error::{Error, Result};
use crate::fastmap::{Inliner, MultiMap};
use crate::merkle;
use crate::types::{Hash, HASH_SIZE, HEADER_LEN};
use crate::{errcorrupt, errinput};

/// Upper bound on items returned by one history call.
pub const MAX_HISTORY_SIZE: usize = 20;

/// A read-only mapped file. Zero-length files stay unmapped and read as
/// empty slices.
#[derive(Debug)]
pub struct Region(Option<Mmap>);

impl AsRef<[u8]> for Region {
    fn as_ref(&self) -> &[u8] {
        self.0.as_deref().unwrap_or(&[])
    }
}

fn map_file(dir: &Path, name: &str) -> Result<Region> {
    let file = File::open(dir.join(name))
        .map_err(|e| Error::Io(format!("opening {name}: {e}")))?;
    if file.metadata()?.len() == 0 {
        return Ok(Region(None));
    }
    // SAFETY: the file is opened read-only and the dataset is immutable
    // once built; nothing remaps or truncates it while the server lives.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(Region(Some(mmap)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Snappy,
}

impl Compression {
    pub fn tag(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Snappy => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Snappy),
            other => Err(Error::UnknownCompression(other)),
        }
    }
}

/// One indexed item plus everything a client needs to verify it against
/// its block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item<'a> {
    /// Stored payload, borrowed from the item store; snappy-compressed
    /// for transactions.
    pub data: &'a [u8],
    pub compression: Compression,
    /// Height of the containing block.
    pub block: usize,
    /// Leaf position within the containing block.
    pub index: usize,
    pub num_leaves: usize,
    pub num_miner_payouts: usize,
    /// Sibling hashes in proof order, concatenated.
    pub merkle_proof: Vec<u8>,
}

impl Item<'_> {
    /// The raw serialized item: `data` as-is for payouts, decompressed for
    /// transactions. This is what the Merkle leaf commits to.
    pub fn source_data(&self) -> Result<Cow<'_, [u8]>> {
        match self.compression {
            Compression::None => Ok(Cow::Borrowed(self.data)),
            Compression::Snappy => {
                let mut decoder = snap::raw::Decoder::new();
                Ok(Cow::Owned(decoder.decompress_vec(self.data)?))
            }
        }
    }
}

#[derive(Debug)]
pub struct Server {
    blockchain: Region,
    offsets: Region,
    block_locations: Region,
    leaves_hashes: Region,
    headers: Region,

    address_map: MultiMap<Region>,
    contract_map: MultiMap<Region>,

    offset_len: usize,
    offset_index_len: usize,
    address_prefix_len: usize,
    contract_prefix_len: usize,

    nblocks: usize,
    nitems: usize,
}

impl Server {
    /// Opens a dataset directory: reads parameters.json, mmaps every file,
    /// and validates the cross-file length invariants.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let params_file = File::open(dir.join(PARAMETERS_FILE))
            .map_err(|e| Error::Io(format!("opening {PARAMETERS_FILE}: {e}")))?;
        let params: Parameters = serde_json::from_reader(params_file)?;

        let blockchain = map_file(dir, BLOCKCHAIN_FILE)?;
        let offsets = map_file(dir, OFFSETS_FILE)?;
        let block_locations = map_file(dir, BLOCK_LOCATIONS_FILE)?;
        let leaves_hashes = map_file(dir, LEAVES_HASHES_FILE)?;
        let headers = map_file(dir, HEADERS_FILE)?;

        let address_map = MultiMap::open(
            map_file(dir, ADDRESSES_FASTMAP_DATA_FILE)?,
            map_file(dir, ADDRESSES_FASTMAP_PREFIXES_FILE)?,
            map_file(dir, ADDRESSES_INDICES_FILE)?,
            params.offset_index_len,
            params.address_offset_len,
            Inliner::choose(params.offset_index_len, params.address_offset_len),
        )?;
        let contract_map = MultiMap::open(
            map_file(dir, CONTRACTS_FASTMAP_DATA_FILE)?,
            map_file(dir, CONTRACTS_FASTMAP_PREFIXES_FILE)?,
            map_file(dir, CONTRACTS_INDICES_FILE)?,
            params.offset_index_len,
            params.contract_offset_len,
            Inliner::choose(params.offset_index_len, params.contract_offset_len),
        )?;

        let location_len = 2 * params.offset_index_len;
        let nblocks = block_locations.as_ref().len() / location_len;
        if nblocks * location_len != block_locations.as_ref().len() {
            return Err(errcorrupt!("bad length of {BLOCK_LOCATIONS_FILE}"));
        }
        let nitems = offsets.as_ref().len() / params.offset_len;
        if nitems * params.offset_len != offsets.as_ref().len() {
            return Err(errcorrupt!("bad length of {OFFSETS_FILE}"));
        }
        if leaves_hashes.as_ref().len() != nitems * HASH_SIZE {
            return Err(errcorrupt!("bad length of {LEAVES_HASHES_FILE}"));
        }
        if headers.as_ref().len() != nblocks * HEADER_LEN {
            return Err(errcorrupt!("bad length of {HEADERS_FILE}"));
        }

        let server = Self {
            blockchain,
            offsets,
            block_locations,
            leaves_hashes,
            headers,
            address_map,
            contract_map,
            offset_len: params.offset_len,
            offset_index_len: params.offset_index_len,
            address_prefix_len: params.address_prefix_len,
            contract_prefix_len: params.contract_prefix_len,
            nblocks,
            nitems,
        };

        // Block locations must ascend in both columns.
        let ascending = (0..server.nblocks)
            .map(|b| server.block_location(b))
            .tuple_windows()
            .all(|((p0, t0), (p1, t1))| p0 < p1 && t0 <= t1 && p0 <= t0);
        if !ascending {
            return Err(errcorrupt!("{BLOCK_LOCATIONS_FILE} is not ascending"));
        }

        tracing::info!(nblocks = server.nblocks, nitems = server.nitems, "dataset opened");
        Ok(server)
    }

    /// Unmaps everything. Dropping the server has the same effect; this
    /// just makes the point of release explicit.
    pub fn close(self) {}

    /// Raw concatenated 48-byte header records, for the headers endpoint.
    pub fn headers(&self) -> &[u8] {
        self.headers.as_ref()
    }

    pub fn num_blocks(&self) -> usize {
        self.nblocks
    }

    pub fn num_items(&self) -> usize {
        self.nitems
    }

    fn read_le(&self, buf: &[u8]) -> u64 {
        let mut full = [0u8; 8];
        full[..buf.len()].copy_from_slice(buf);
        LittleEndian::read_u64(&full)
    }

    fn item_offset(&self, index: usize) -> u64 {
        let start = index * self.offset_len;
        self.read_le(&self.offsets.as_ref()[start..start + self.offset_len])
    }

    /// (first miner payout, first transaction) of the block at `height`.
    fn block_location(&self, height: usize) -> (usize, usize) {
        let start = height * 2 * self.offset_index_len;
        let bytes = &self.block_locations.as_ref()[start..start + 2 * self.offset_index_len];
        let payouts = self.read_le(&bytes[..self.offset_index_len]) as usize;
        let txs = self.read_le(&bytes[self.offset_index_len..]) as usize;
        (payouts, txs)
    }

    fn payouts_start(&self, height: usize) -> usize {
        self.block_location(height).0
    }

    /// History of the address with the given 32-byte unlock hash.
    pub fn address_history(&self, address: &[u8], start: &str) -> Result<(Vec<Item<'_>>, String)> {
        if address.len() != HASH_SIZE {
            return Err(errinput!("address has {} bytes, want {HASH_SIZE}", address.len()));
        }
        self.history(&self.address_map, &address[..self.address_prefix_len], start)
    }

    /// History of the file contract with the given 32-byte id.
    pub fn contract_history(&self, contract: &[u8], start: &str) -> Result<(Vec<Item<'_>>, String)> {
        if contract.len() != HASH_SIZE {
            return Err(errinput!("contract id has {} bytes, want {HASH_SIZE}", contract.len()));
        }
        self.history(&self.contract_map, &contract[..self.contract_prefix_len], start)
    }

    fn history(
        &self,
        map: &MultiMap<Region>,
        prefix: &[u8],
        start: &str,
    ) -> Result<(Vec<Item<'_>>, String)> {
        let Some(values) = map.lookup(prefix)? else {
            return Ok((Vec::new(), String::new()));
        };
        let size = values.len() / self.offset_index_len;
        let wire_at = |i: usize| -> u64 {
            let mut full = [0u8; 8];
            let bytes = &values[i * self.offset_index_len..(i + 1) * self.offset_index_len];
            full[8 - self.offset_index_len..].copy_from_slice(bytes);
            BigEndian::read_u64(&full)
        };

        let first_wire = if start.is_empty() {
            0
        } else {
            start
                .parse::<u64>()
                .map_err(|e| errinput!("failed parsing start cursor: {e}"))?
        };
        if first_wire > wire_at(size - 1) {
            return Err(Error::TooLargeIndex);
        }

        // Wire indices are stored ascending; find the first one >= start.
        let mut low = 0;
        let mut high = size;
        while low < high {
            let mid = low + (high - low) / 2;
            if wire_at(mid) < first_wire {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        let end = (low + MAX_HISTORY_SIZE).min(size);
        let next = if end == size { String::new() } else { (wire_at(end - 1) + 1).to_string() };

        let mut history = Vec::with_capacity(end - low);
        for i in low..end {
            // The wire form is shifted by one so zero can mark emptiness.
            history.push(self.get_item((wire_at(i) - 1) as usize)?);
        }
        Ok((history, next))
    }

    /// Fetches one item with its inclusion proof.
    pub fn get_item(&self, item_index: usize) -> Result<Item<'_>> {
        if item_index >= self.nitems {
            return Err(Error::TooLargeIndex);
        }
        let data_start = self.item_offset(item_index) as usize;
        let data_end = if item_index == self.nitems - 1 {
            self.blockchain.as_ref().len()
        } else {
            self.item_offset(item_index + 1) as usize
        };
        if data_start > data_end || data_end > self.blockchain.as_ref().len() {
            return Err(errcorrupt!("item {item_index} has an impossible byte range"));
        }
        let data = &self.blockchain.as_ref()[data_start..data_end];

        // Last block whose first item is <= the target.
        let mut low = 0;
        let mut high = self.nblocks;
        while low < high {
            let mid = low + (high - low) / 2;
            if self.payouts_start(mid) <= item_index {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        if low == 0 {
            return Err(errcorrupt!("item {item_index} precedes every block"));
        }
        let block = low - 1;
        let (payouts_start, txs_start) = self.block_location(block);
        let next_start =
            if block == self.nblocks - 1 { self.nitems } else { self.payouts_start(block + 1) };
        let num_leaves = next_start - payouts_start;
        let num_miner_payouts = txs_start - payouts_start;

        let hashes_start = payouts_start * HASH_SIZE;
        let hashes_end = hashes_start + num_leaves * HASH_SIZE;
        if hashes_end > self.leaves_hashes.as_ref().len() {
            return Err(errcorrupt!("leaf hashes of block {block} run past file end"));
        }
        let leaves: Vec<Hash> = self.leaves_hashes.as_ref()[hashes_start..hashes_end]
            .chunks_exact(HASH_SIZE)
            .map(|chunk| chunk.try_into().expect("chunk is HASH_SIZE bytes"))
            .collect();
        let index = item_index - payouts_start;
        let merkle_proof = merkle::prove(&leaves, index).concat();

        Ok(Item {
            data,
            compression: if item_index < txs_start { Compression::None } else { Compression::Snappy },
            block,
            index,
            num_leaves,
            num_miner_payouts,
            merkle_proof,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Builder;
    use crate::config::{BuildConfig, IndexConfig};
    use crate::encoding::Encodable;
    use crate::merkle::verify_proof;
    use crate::testutil;
    use crate::types::{Block, SiacoinOutput};

    fn build(dir: &Path, config: BuildConfig, blocks: &[Block]) {
        let mut builder = Builder::new(dir, config).unwrap();
        for block in blocks {
            builder.add(block).unwrap();
        }
        builder.close().unwrap();
    }

    fn profiles() -> Vec<BuildConfig> {
        vec![
            BuildConfig::default().mem_limit(1).offset_len(8).offset_index_len(4).address(
                IndexConfig { page_len: 4096, prefix_len: 16, fastmap_prefix_len: 5, offset_len: 4 },
            ),
            BuildConfig::default().mem_limit(1).offset_len(7).offset_index_len(2).address(
                IndexConfig { page_len: 1500, prefix_len: 32, fastmap_prefix_len: 3, offset_len: 5 },
            ),
        ]
    }

    fn header_root(server: &Server, height: usize) -> Hash {
        server.headers()[height * HEADER_LEN + 16..height * HEADER_LEN + 48]
            .try_into()
            .unwrap()
    }

    #[test]
    fn test_known_addresses_have_history() {
        let blocks = testutil::chain(24, 1);
        for config in profiles() {
            let dir = tempfile::tempdir().unwrap();
            build(dir.path(), config, &blocks);
            let server = Server::open(dir.path()).unwrap();

            for address in testutil::payout_addresses() {
                let (history, _) = server.address_history(&address, "").unwrap();
                assert!(!history.is_empty(), "no history for {address:02x?}");

                let mut flipped = address;
                flipped[0] = !flipped[0];
                let (history, next) = server.address_history(&flipped, "").unwrap();
                assert!(history.is_empty());
                assert!(next.is_empty());
            }
        }
    }

    #[test]
    fn test_history_items_verify_against_headers() {
        let blocks = testutil::chain(24, 2);
        for config in profiles() {
            let dir = tempfile::tempdir().unwrap();
            build(dir.path(), config, &blocks);
            let server = Server::open(dir.path()).unwrap();

            for address in testutil::payout_addresses() {
                let (history, _) = server.address_history(&address, "").unwrap();
                for item in &history {
                    let root = header_root(&server, item.block);
                    let source = item.source_data().unwrap();
                    assert!(verify_proof(
                        &root,
                        &source,
                        &item.merkle_proof,
                        item.index,
                        item.num_leaves,
                    ));
                }
            }
        }
    }

    #[test]
    fn test_contract_history_and_proofs() {
        let blocks = testutil::chain(24, 3);
        let dir = tempfile::tempdir().unwrap();
        build(dir.path(), BuildConfig::default(), &blocks);
        let server = Server::open(dir.path()).unwrap();

        let ids = testutil::contract_ids(&blocks);
        assert!(!ids.is_empty());
        for id in ids {
            let (history, _) = server.contract_history(&id, "").unwrap();
            assert!(!history.is_empty(), "no history for contract {id:02x?}");
            for item in &history {
                assert_eq!(item.compression, Compression::Snappy);
                let root = header_root(&server, item.block);
                let source = item.source_data().unwrap();
                assert!(verify_proof(&root, &source, &item.merkle_proof, item.index, item.num_leaves));
            }
        }
    }

    #[test]
    fn test_tampering_breaks_proofs() {
        let blocks = testutil::chain(12, 4);
        let dir = tempfile::tempdir().unwrap();
        build(dir.path(), BuildConfig::default(), &blocks);
        let server = Server::open(dir.path()).unwrap();

        let item = server.get_item(0).unwrap();
        let root = header_root(&server, item.block);
        let source = item.source_data().unwrap().into_owned();
        assert!(verify_proof(&root, &source, &item.merkle_proof, item.index, item.num_leaves));

        let mut tampered = source.clone();
        tampered[0] ^= 1;
        assert!(!verify_proof(&root, &tampered, &item.merkle_proof, item.index, item.num_leaves));

        if !item.merkle_proof.is_empty() {
            let mut proof = item.merkle_proof.clone();
            proof[0] ^= 1;
            assert!(!verify_proof(&root, &source, &proof, item.index, item.num_leaves));
        }

        let mut bad_root = root;
        bad_root[31] ^= 1;
        assert!(!verify_proof(&bad_root, &source, &item.merkle_proof, item.index, item.num_leaves));
    }

    #[test]
    fn test_pagination_cursors() {
        // One address paid in 45 consecutive blocks: pages of 20, 20, 5.
        let address = [0x42u8; 32];
        let blocks = testutil::payout_chain(&address, 45);
        let dir = tempfile::tempdir().unwrap();
        build(dir.path(), BuildConfig::default(), &blocks);
        let server = Server::open(dir.path()).unwrap();

        let mut cursor = String::new();
        let mut seen = Vec::new();
        let mut pages = Vec::new();
        loop {
            let (history, next) = server.address_history(&address, &cursor).unwrap();
            pages.push(history.len());
            seen.extend(history.iter().map(|item| item.block));
            if next.is_empty() {
                break;
            }
            cursor = next;
        }
        assert_eq!(pages, vec![20, 20, 5]);
        assert_eq!(seen, (0..45).collect::<Vec<_>>());
    }

    #[test]
    fn test_cursor_at_last_index_returns_final_item() {
        let address = [0x42u8; 32];
        let blocks = testutil::payout_chain(&address, 5);
        let dir = tempfile::tempdir().unwrap();
        build(dir.path(), BuildConfig::default(), &blocks);
        let server = Server::open(dir.path()).unwrap();

        let (all, _) = server.address_history(&address, "").unwrap();
        let last_wire = (server.num_items()).to_string(); // wire of the last item
        let (history, next) = server.address_history(&address, &last_wire).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].block, all.last().unwrap().block);
        assert!(next.is_empty());

        let beyond = (server.num_items() + 1).to_string();
        assert_eq!(server.address_history(&address, &beyond).unwrap_err(), Error::TooLargeIndex);

        assert!(matches!(
            server.address_history(&address, "not-a-number").unwrap_err(),
            Error::InvalidInput(_)
        ));
    }

    #[test]
    fn test_compression_classification_and_source_data() {
        let blocks = testutil::chain(8, 6);
        let dir = tempfile::tempdir().unwrap();
        build(dir.path(), BuildConfig::default(), &blocks);
        let server = Server::open(dir.path()).unwrap();

        let mut item_index = 0;
        for block in &blocks {
            for payout in &block.miner_payouts {
                let item = server.get_item(item_index).unwrap();
                assert_eq!(item.compression, Compression::None);
                assert_eq!(item.source_data().unwrap().as_ref(), payout.to_vec().as_slice());
                item_index += 1;
            }
            for tx in &block.transactions {
                let item = server.get_item(item_index).unwrap();
                assert_eq!(item.compression, Compression::Snappy);
                assert_eq!(item.source_data().unwrap().as_ref(), tx.to_vec().as_slice());
                item_index += 1;
            }
        }
        assert_eq!(item_index, server.num_items());
        assert_eq!(server.get_item(item_index).unwrap_err(), Error::TooLargeIndex);
    }

    #[test]
    fn test_wrong_key_sizes_rejected() {
        let blocks = testutil::chain(4, 8);
        let dir = tempfile::tempdir().unwrap();
        build(dir.path(), BuildConfig::default(), &blocks);
        let server = Server::open(dir.path()).unwrap();
        assert!(matches!(
            server.address_history(&[0u8; 31], "").unwrap_err(),
            Error::InvalidInput(_)
        ));
        assert!(matches!(
            server.contract_history(&[0u8; 33], "").unwrap_err(),
            Error::InvalidInput(_)
        ));
    }

    #[test]
    fn test_open_rejects_truncated_files() {
        let blocks = testutil::chain(6, 9);
        let dir = tempfile::tempdir().unwrap();
        build(dir.path(), BuildConfig::default(), &blocks);

        let offsets_path = dir.path().join(OFFSETS_FILE);
        let mut bytes = std::fs::read(&offsets_path).unwrap();
        bytes.pop();
        std::fs::write(&offsets_path, &bytes).unwrap();
        assert!(matches!(Server::open(dir.path()).unwrap_err(), Error::Corrupt(_)));
    }

    #[test]
    fn test_payout_values_survive_roundtrip() {
        let address = [0x42u8; 32];
        let blocks = testutil::payout_chain(&address, 3);
        let dir = tempfile::tempdir().unwrap();
        build(dir.path(), BuildConfig::default(), &blocks);
        let server = Server::open(dir.path()).unwrap();

        let item = server.get_item(0).unwrap();
        let source = item.source_data().unwrap();
        let decoded =
            <SiacoinOutput as crate::encoding::Decodable>::decode(&mut source.as_ref()).unwrap();
        assert_eq!(decoded, blocks[0].miner_payouts[0]);
    }
}
