//! Runtime options and the table of options persisted in the superblock.

use crate::checksum::CsumType;
use crate::super_block::{SuperBlockFlag, REPLICAS_MAX};

/// Checksum choice for metadata, as given on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumOpt {
    /// Don't checksum
    None,
    /// crc32c
    Crc32c,
}

impl ChecksumOpt {
    /// The checksum type used for the superblock itself
    pub fn csum_type(self) -> CsumType {
        match self {
            ChecksumOpt::None => CsumType::None,
            ChecksumOpt::Crc32c => CsumType::Crc32cNonzero,
        }
    }

    /// The value stored in the `metadata_checksum` option
    pub fn sb_value(self) -> u64 {
        match self {
            ChecksumOpt::None => 0,
            ChecksumOpt::Crc32c => 1,
        }
    }
}

impl std::str::FromStr for ChecksumOpt {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(ChecksumOpt::None),
            "crc32c" => Ok(ChecksumOpt::Crc32c),
            _ => Err(format!("unknown checksum type: {}", s)),
        }
    }
}

/// Options affecting how superblocks are read and written
#[derive(Debug, Clone)]
pub struct FsOpts {
    /// Read the superblock from this sector instead of the default
    pub sb: Option<u64>,
    /// Validate but never write anything
    pub nochanges: bool,
    /// Open the devices read only
    pub read_only: bool,
    /// Allow mounting with missing replicas
    pub degraded: bool,
    /// Allow mounting even with data lost
    pub very_degraded: bool,
    /// Stamp the newer magic on every write
    pub version_upgrade: bool,
    /// Checksum used for metadata, the superblock included
    pub metadata_checksum: ChecksumOpt,
}

impl Default for FsOpts {
    fn default() -> Self {
        FsOpts {
            sb: None,
            nochanges: false,
            read_only: false,
            degraded: false,
            very_degraded: false,
            version_upgrade: false,
            metadata_checksum: ChecksumOpt::Crc32c,
        }
    }
}

/// A filesystem option stored in the superblock flag words
#[derive(Debug)]
pub struct SbOpt {
    /// Option name
    pub name: &'static str,
    /// Where the value lives
    pub flag: SuperBlockFlag,
    /// Smallest valid value
    pub min: u64,
    /// Largest valid value
    pub max: u64,
    /// The value must be a power of two
    pub pow2: bool,
}

impl SbOpt {
    /// Whether `v` is an acceptable value for this option
    pub fn is_valid(&self, v: u64) -> bool {
        v >= self.min && v <= self.max && (!self.pow2 || v.is_power_of_two())
    }
}

const fn opt(name: &'static str, flag: SuperBlockFlag, min: u64, max: u64) -> SbOpt {
    SbOpt {
        name,
        flag,
        min,
        max,
        pow2: false,
    }
}

/// Every option persisted in the superblock
pub static SB_OPTS: [SbOpt; 14] = [
    // continue, remount-ro, panic
    opt("error_action", SuperBlockFlag::ERROR_ACTION, 0, 2),
    SbOpt {
        name: "btree_node_size",
        flag: SuperBlockFlag::BTREE_NODE_SIZE,
        min: 1,
        max: 2048,
        pow2: true,
    },
    opt("gc_reserve_percent", SuperBlockFlag::GC_RESERVE, 5, 21),
    opt("root_reserve_percent", SuperBlockFlag::ROOT_RESERVE, 0, 100),
    // none, crc32c, crc64, xxhash
    opt("metadata_checksum", SuperBlockFlag::META_CSUM_TYPE, 0, 3),
    opt("data_checksum", SuperBlockFlag::DATA_CSUM_TYPE, 0, 3),
    opt(
        "metadata_replicas",
        SuperBlockFlag::META_REPLICAS_WANT,
        1,
        REPLICAS_MAX as u64,
    ),
    opt(
        "data_replicas",
        SuperBlockFlag::DATA_REPLICAS_WANT,
        1,
        REPLICAS_MAX as u64,
    ),
    opt(
        "metadata_replicas_required",
        SuperBlockFlag::META_REPLICAS_REQ,
        1,
        REPLICAS_MAX as u64,
    ),
    opt(
        "data_replicas_required",
        SuperBlockFlag::DATA_REPLICAS_REQ,
        1,
        REPLICAS_MAX as u64,
    ),
    // crc32c, crc64, siphash
    opt("str_hash", SuperBlockFlag::STR_HASH_TYPE, 0, 2),
    // none, lz4, gzip, zstd
    opt("compression", SuperBlockFlag::COMPRESSION_TYPE, 0, 3),
    opt(
        "journal_flush_delay",
        SuperBlockFlag::JOURNAL_FLUSH_DELAY,
        1,
        u32::MAX as u64,
    ),
    opt(
        "journal_reclaim_delay",
        SuperBlockFlag::JOURNAL_RECLAIM_DELAY,
        0,
        u32::MAX as u64,
    ),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_ranges() {
        let node_size = SB_OPTS
            .iter()
            .find(|o| o.name == "btree_node_size")
            .unwrap();
        assert!(node_size.is_valid(512));
        assert!(!node_size.is_valid(384));
        assert!(!node_size.is_valid(0));

        let gc = SB_OPTS
            .iter()
            .find(|o| o.name == "gc_reserve_percent")
            .unwrap();
        assert!(gc.is_valid(8));
        assert!(!gc.is_valid(0));
    }

    #[test]
    fn checksum_opt() {
        assert_eq!("crc32c".parse(), Ok(ChecksumOpt::Crc32c));
        assert!("crc64".parse::<ChecksumOpt>().is_err());
        assert_eq!(ChecksumOpt::Crc32c.csum_type(), CsumType::Crc32cNonzero);
    }
}
