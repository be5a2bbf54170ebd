use serde::{Deserialize, Serialize};

use crate::errconfig;
use crate::error::Result;
use crate::types::HASH_SIZE;

/// File names of the dataset, relative to its directory.
pub const PARAMETERS_FILE: &str = "parameters.json";
pub const BLOCKCHAIN_FILE: &str = "blockchain";
pub const OFFSETS_FILE: &str = "offsets";
pub const BLOCK_LOCATIONS_FILE: &str = "blockLocations";
pub const HEADERS_FILE: &str = "headers";
pub const LEAVES_HASHES_FILE: &str = "leavesHashes";
pub const ADDRESSES_FASTMAP_DATA_FILE: &str = "addressesFastmapData";
pub const ADDRESSES_FASTMAP_PREFIXES_FILE: &str = "addressesFastmapPrefixes";
pub const ADDRESSES_INDICES_FILE: &str = "addressesIndices";
pub const CONTRACTS_FASTMAP_DATA_FILE: &str = "contractsFastmapData";
pub const CONTRACTS_FASTMAP_PREFIXES_FILE: &str = "contractsFastmapPrefixes";
pub const CONTRACTS_INDICES_FILE: &str = "contractsIndices";

pub(crate) const ADDRESSES_TMP_FILE: &str = "addresses.tmp";
pub(crate) const CONTRACTS_TMP_FILE: &str = "contracts.tmp";

/// Layout of one secondary index (addresses or contracts).
///
/// All sizes are in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexConfig {
    /// Size of one page in the fastmap data file.
    pub page_len: usize,

    /// How many leading bytes of the 32-byte hash are stored as the key.
    pub prefix_len: usize,

    /// How many leading bytes of the key go into the page prefix table.
    pub fastmap_prefix_len: usize,

    /// Width of offsets into the overflow (indices) file.
    pub offset_len: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            page_len: 4096,
            prefix_len: 16,
            fastmap_prefix_len: 5,
            offset_len: 4,
        }
    }
}

/// Build-time configuration for the dataset builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    /// Memory ceiling for each external sorter, in bytes (default: 64MB).
    pub mem_limit: usize,

    /// Width of byte offsets into the blockchain file (default: 8).
    pub offset_len: usize,

    /// Width of item indices in the secondary files (default: 4).
    pub offset_index_len: usize,

    /// Address index layout.
    pub address: IndexConfig,

    /// Contract index layout.
    pub contract: IndexConfig,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            mem_limit: 64 * 1024 * 1024,
            offset_len: 8,
            offset_index_len: 4,
            address: IndexConfig::default(),
            contract: IndexConfig::default(),
        }
    }
}

impl BuildConfig {
    /// Set the sorter memory ceiling.
    pub fn mem_limit(mut self, bytes: usize) -> Self {
        self.mem_limit = bytes;
        self
    }

    /// Set the blockchain-file offset width.
    pub fn offset_len(mut self, len: usize) -> Self {
        self.offset_len = len;
        self
    }

    /// Set the item-index width.
    pub fn offset_index_len(mut self, len: usize) -> Self {
        self.offset_index_len = len;
        self
    }

    /// Configure the address index.
    pub fn address(mut self, config: IndexConfig) -> Self {
        self.address = config;
        self
    }

    /// Configure the contract index.
    pub fn contract(mut self, config: IndexConfig) -> Self {
        self.contract = config;
        self
    }

    /// Checks every width and layout constraint before any file is created.
    pub fn validate(&self) -> Result<()> {
        if self.mem_limit == 0 {
            return Err(errconfig!("mem_limit must be positive"));
        }
        if self.offset_len == 0 || self.offset_len > 8 {
            return Err(errconfig!("offset_len {} out of range 1..=8", self.offset_len));
        }
        if self.offset_index_len == 0 || self.offset_index_len > 8 {
            return Err(errconfig!(
                "offset_index_len {} out of range 1..=8",
                self.offset_index_len
            ));
        }
        self.validate_index("address", &self.address)?;
        self.validate_index("contract", &self.contract)?;
        Ok(())
    }

    fn validate_index(&self, name: &str, index: &IndexConfig) -> Result<()> {
        if index.prefix_len == 0 || index.prefix_len > HASH_SIZE {
            return Err(errconfig!(
                "{name} prefix_len {} out of range 1..={HASH_SIZE}",
                index.prefix_len
            ));
        }
        if index.fastmap_prefix_len == 0 || index.fastmap_prefix_len > index.prefix_len {
            return Err(errconfig!(
                "{name} fastmap_prefix_len {} out of range 1..={}",
                index.fastmap_prefix_len,
                index.prefix_len
            ));
        }
        if index.offset_len == 0 || index.offset_len > 8 {
            return Err(errconfig!(
                "{name} offset_len {} out of range 1..=8",
                index.offset_len
            ));
        }
        let container_len = if index.offset_len == self.offset_index_len {
            2 * self.offset_index_len
        } else {
            index.offset_len
        };
        if index.page_len < index.prefix_len + container_len {
            return Err(errconfig!(
                "{name} page_len {} holds no records",
                index.page_len
            ));
        }
        Ok(())
    }
}

/// The parameter set persisted as parameters.json next to the dataset.
///
/// Written once by the builder before any other file; the server reads it
/// before opening anything. These values fully determine the file layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameters {
    pub offset_len: usize,
    pub offset_index_len: usize,

    pub address_page_len: usize,
    pub address_prefix_len: usize,
    pub address_fastmap_prefix_len: usize,
    pub address_offset_len: usize,

    pub contract_page_len: usize,
    pub contract_prefix_len: usize,
    pub contract_fastmap_prefix_len: usize,
    pub contract_offset_len: usize,
}

impl From<&BuildConfig> for Parameters {
    fn from(config: &BuildConfig) -> Self {
        Self {
            offset_len: config.offset_len,
            offset_index_len: config.offset_index_len,
            address_page_len: config.address.page_len,
            address_prefix_len: config.address.prefix_len,
            address_fastmap_prefix_len: config.address.fastmap_prefix_len,
            address_offset_len: config.address.offset_len,
            contract_page_len: config.contract.page_len,
            contract_prefix_len: config.contract.prefix_len,
            contract_fastmap_prefix_len: config.contract.fastmap_prefix_len,
            contract_offset_len: config.contract.offset_len,
        }
    }
}
