#![deny(missing_docs)]

//! Rust library for reading, validating and committing bcachefs superblocks.
//!
//! The superblock is replicated at fixed offsets on every member device. This
//! crate owns its on-disk format, the recovery path that falls back to backup
//! copies, the multi-device commit protocol with quorum accounting, and the
//! clean shutdown marker that lets a mount skip journal replay.

use std::fmt;
use std::io;

mod checksum;
mod clean;
mod counters;
mod crypt;
mod device;
mod disk_groups;
mod fields;
mod format;
mod fs;
mod journal_entry;
mod layout;
mod members;
mod opts;
mod read;
mod replicas;
mod super_block;
mod text;
mod validate;
mod write;

pub use checksum::{csum_vstruct, CsumType};
pub use clean::{CleanField, CLEAN_HEADER_BYTES};
pub use counters::{counter, CountersField, COUNTER_NAMES, COUNTER_NR};
pub use crypt::CryptField;
pub use device::{ByteDevice, FileDevice, MemDevice};
pub use disk_groups::{DiskGroup, DiskGroupCpu, DiskGroupsCpu, DiskGroupsField};
pub use fields::{FieldRef, FieldType, SbField, SbHandle, FIELD_NR};
pub use format::{format, format_device, super_write, Args as FormatArgs};
pub use fs::{
    BtreeRoot, BtreeRoots, DegradedPolicy, DevMask, Fs, FsFlags, FsSuper, MemberCpu, NoBtree,
    ReplicasPolicy, SbCache,
};
pub use journal_entry::{entry_type, jset_entries_to_text, DevUsageType, JsetEntry, UsageType};
pub use layout::Layout;
pub use members::{Member, MemberFlag, MemberState, MembersField, MEMBER_BYTES};
pub use opts::{ChecksumOpt, FsOpts, SbOpt, SB_OPTS};
pub use read::{read_super, read_super_at};
pub use replicas::{ForceFlags, ReplicasEntry, ReplicasField};
pub use super_block::{
    compat_to_text, data_type, features_to_text, Compat, DataTypes, Features, SuperBlock,
    SuperBlockFlag, SuperBlockLayout, BCACHE_MAGIC, BCHFS_MAGIC, BLOCK_SIZE_MAX, DATA_TYPE_NR,
    LAYOUT_BYTES, LAYOUT_SECTOR, MEMBERS_MAX, METADATA_VERSION_CURRENT, METADATA_VERSION_MAX,
    METADATA_VERSION_MIN, MIN_NR_NBUCKETS, REPLICAS_MAX, SB_HEADER_BYTES, SB_SECTOR,
};
pub use text::{field_to_text, layout_to_text, sb_to_text};
pub use validate::{validate_super, FieldInvalid, Rw, SbInvalid};

/// Core error type for the bcachefs tooling implementations
#[derive(Debug)]
pub enum BchError {
    /// An error that originated from io in the Rust standard library
    Io(io::Error),
    /// An error that originated from the nix crate
    Nix(nix::Error),
    /// A simple string error
    Str(String),
    /// A error from the uuid library
    Uuid(uuid::Error),
    /// The given buffer was too small
    Exhausted,
    /// The input value is invalid
    Einval(String),
    /// The superblock failed validation
    Invalid(SbInvalid),
    /// The superblock would not fit in the space reserved by its layout
    SbTooBig {
        /// Bytes required
        want: usize,
        /// Bytes available per copy
        max: usize,
    },
    /// Allocating a superblock buffer failed
    NoMem,
    /// The sequence number read back from a device did not match ours
    SeqMismatch {
        /// Device index
        dev: u8,
        /// Sequence number found on disk
        found: u64,
        /// Sequence number we last wrote
        expected: u64,
    },
    /// The superblock could not be written to enough devices
    InsufficientDevices {
        /// Number of devices successfully written
        written: usize,
    },
    /// The filesystem went read only after a fatal error
    ReadOnly,
}

impl From<io::Error> for BchError {
    fn from(other: io::Error) -> BchError {
        BchError::Io(other)
    }
}

impl From<nix::Error> for BchError {
    fn from(other: nix::Error) -> BchError {
        BchError::Nix(other)
    }
}

impl From<uuid::Error> for BchError {
    fn from(other: uuid::Error) -> BchError {
        BchError::Uuid(other)
    }
}

impl From<SbInvalid> for BchError {
    fn from(other: SbInvalid) -> BchError {
        BchError::Invalid(other)
    }
}

/// Core result type used by bcachefs tooling implementations
pub type Result<T> = std::result::Result<T, BchError>;

impl fmt::Display for BchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BchError::Io(ref err) => write!(f, "io error: {}", err),
            BchError::Nix(ref err) => write!(f, "nix error: {}", err),
            BchError::Uuid(ref err) => write!(f, "uuid error: {}", err),
            BchError::Str(ref err) => write!(f, "{}", err),
            BchError::Exhausted => write!(f, "Input buffer too short"),
            BchError::Einval(ref s) => write!(f, "Input value invalid: {}", s),
            BchError::Invalid(ref err) => write!(f, "{}", err),
            BchError::SbTooBig { want, max } => {
                write!(f, "superblock too big: want {} but have {}", want, max)
            }
            BchError::NoMem => write!(f, "error allocating memory for superblock"),
            BchError::SeqMismatch {
                dev,
                found,
                expected,
            } => {
                if found < expected {
                    write!(
                        f,
                        "dev {}: superblock write was silently dropped! (seq {} expected {})",
                        dev, found, expected
                    )
                } else {
                    write!(
                        f,
                        "dev {}: superblock modified by another process (seq {} expected {})",
                        dev, found, expected
                    )
                }
            }
            BchError::InsufficientDevices { written } => write!(
                f,
                "unable to write superblock to sufficient devices ({} written)",
                written
            ),
            BchError::ReadOnly => write!(f, "filesystem is read only after a fatal error"),
        }
    }
}

impl std::error::Error for BchError {}
