//! Structural and semantic checks run on every read and before every write.

use std::fmt;

use crate::fields::{FieldType, SbHandle};
use crate::journal_entry::{self, EntryCtx};
use crate::layout::Layout;
use crate::opts::SB_OPTS;
use crate::super_block::{
    is_magic, SuperBlockFlag, BLOCK_SIZE_MAX, FEATURE_NR, MEMBERS_MAX,
    METADATA_VERSION_BKEY_RENUMBER, METADATA_VERSION_MAX, METADATA_VERSION_MIN, NSEC_PER_SEC,
};

use log::warn;

/// Direction a superblock is being validated in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rw {
    /// Just read from disk: known legacy defects are patched up
    Read,
    /// About to be written: every problem is fatal
    Write,
}

/// A violated superblock invariant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SbInvalid {
    /// Not a bcachefs superblock
    Magic,
    /// Version outside of the supported range
    Version {
        /// Offending version
        version: u16,
    },
    /// `version_min` is greater than `version`
    VersionMin {
        /// Minimum version field
        version_min: u16,
        /// Version field
        version: u16,
    },
    /// Incompatible feature bits are set
    Features {
        /// First feature word
        features0: u64,
        /// Second feature word
        features1: u64,
    },
    /// Block size is larger than supported
    BlockSizeTooBig {
        /// Block size in sectors
        got: u16,
    },
    /// The block size is smaller than the device's physical block size
    BlockSizeTooSmall {
        /// Block size in bytes
        block_size: u64,
        /// Device block size in bytes
        device: u64,
    },
    /// The user uuid is all zeroes
    UserUuidZero,
    /// The internal uuid is all zeroes
    UuidZero,
    /// Device count is zero or too large
    NrDevices(u8),
    /// This device's index is not below the device count
    DevIdx {
        /// Device index
        dev_idx: u8,
        /// Device count
        nr_devices: u8,
    },
    /// Time precision is zero or more than a second
    TimePrecision(u32),
    /// A filesystem option stored in the flag words is out of range
    Opt {
        /// Option name
        name: &'static str,
        /// Stored value
        value: u64,
    },
    /// The layout magic is unknown
    LayoutMagic,
    /// The layout type is not zero
    LayoutType(u8),
    /// The layout lists no superblocks
    LayoutNoSuperblocks,
    /// The layout lists more superblocks than fit in it
    LayoutTooManySuperblocks(usize),
    /// Two superblock copies overlap
    LayoutOverlap {
        /// Index of the earlier copy
        idx: usize,
        /// Sector the earlier copy ends at
        prev_end: u64,
        /// Sector the next copy starts at
        next: u64,
    },
    /// The superblock is larger than the space reserved for it
    TooBig {
        /// Bytes declared
        got: usize,
        /// Bytes available
        max: usize,
    },
    /// The checksum type is past the end of the table
    CsumTypeUnknown(u64),
    /// The checksum type can't be computed here
    CsumTypeUnsupported(u64),
    /// The stored checksum does not match the contents
    BadChecksum,
    /// A field has zero length
    FieldEmpty(u32),
    /// A field extends past the declared end of the superblock
    FieldPastEnd(u32),
    /// There is no members field
    MembersMissing,
    /// A field failed its type specific validation
    Field {
        /// Field type
        field: FieldType,
        /// What went wrong
        err: FieldInvalid,
        /// The field rendered as text
        text: String,
    },
}

impl fmt::Display for SbInvalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SbInvalid::Magic => write!(f, "Not a bcachefs superblock"),
            SbInvalid::Version { version } => write!(
                f,
                "Unsupported superblock version {} (min {}, max {})",
                version, METADATA_VERSION_MIN, METADATA_VERSION_MAX
            ),
            SbInvalid::VersionMin {
                version_min,
                version,
            } => write!(
                f,
                "Bad minimum version {}, greater than version field {}",
                version_min, version
            ),
            SbInvalid::Features {
                features0,
                features1,
            } => write!(
                f,
                "Filesystem has incompatible features ({:#x} {:#x})",
                features0, features1
            ),
            SbInvalid::BlockSizeTooBig { got } => write!(
                f,
                "Block size too big (got {}, max {})",
                got, BLOCK_SIZE_MAX
            ),
            SbInvalid::BlockSizeTooSmall { block_size, device } => write!(
                f,
                "block size ({}) smaller than device block size ({})",
                block_size, device
            ),
            SbInvalid::UserUuidZero => write!(f, "Bad user UUID (got zeroes)"),
            SbInvalid::UuidZero => write!(f, "Bad internal UUID (got zeroes)"),
            SbInvalid::NrDevices(nr) => write!(
                f,
                "Bad number of member devices {} (max {})",
                nr, MEMBERS_MAX
            ),
            SbInvalid::DevIdx {
                dev_idx,
                nr_devices,
            } => write!(
                f,
                "Bad dev_idx (got {}, nr_devices {})",
                dev_idx, nr_devices
            ),
            SbInvalid::TimePrecision(p) => write!(
                f,
                "Invalid time precision: {} (min 1, max {})",
                p, NSEC_PER_SEC
            ),
            SbInvalid::Opt { name, value } => {
                write!(f, "Invalid option {}: {}", name, value)?;
                if let Some(opt) = SB_OPTS.iter().find(|o| o.name == *name) {
                    write!(f, " (min {}, max {})", opt.min, opt.max)?;
                }
                Ok(())
            }
            SbInvalid::LayoutMagic => {
                write!(f, "Invalid superblock layout: not a bcachefs layout")
            }
            SbInvalid::LayoutType(t) => {
                write!(f, "Invalid superblock layout type {}", t)
            }
            SbInvalid::LayoutNoSuperblocks => {
                write!(f, "Invalid superblock layout: no superblocks")
            }
            SbInvalid::LayoutTooManySuperblocks(nr) => {
                write!(f, "Invalid superblock layout: too many superblocks ({})", nr)
            }
            SbInvalid::LayoutOverlap {
                idx,
                prev_end,
                next,
            } => write!(
                f,
                "Invalid superblock layout: superblocks overlap (sb {} ends at {} next starts at {})",
                idx, prev_end, next
            ),
            SbInvalid::TooBig { got, max } => write!(
                f,
                "Invalid superblock: too big (got {} bytes, layout max {})",
                got, max
            ),
            SbInvalid::CsumTypeUnknown(t) => write!(f, "unknown checksum type {}", t),
            SbInvalid::CsumTypeUnsupported(t) => {
                write!(f, "unsupported superblock checksum type {}", t)
            }
            SbInvalid::BadChecksum => write!(f, "bad checksum"),
            SbInvalid::FieldEmpty(t) => write!(
                f,
                "Invalid superblock: optional field with size 0 (type {})",
                t
            ),
            SbInvalid::FieldPastEnd(t) => write!(
                f,
                "Invalid superblock: optional field extends past end of superblock (type {})",
                t
            ),
            SbInvalid::MembersMissing => {
                write!(f, "Invalid superblock: member info area missing")
            }
            SbInvalid::Field { field, err, text } => write!(
                f,
                "Invalid superblock section {}: {}\n{}",
                field.name(),
                err,
                text
            ),
        }
    }
}

/// A violated invariant of one superblock field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldInvalid {
    /// The field is smaller than its fixed part
    WrongSize {
        /// Bytes present
        got: usize,
        /// Bytes required
        want: usize,
    },
    /// The members section can't hold `nr_devices` records
    TooManyDevices,
    /// A member has more buckets than can be addressed
    TooManyBuckets {
        /// Device index
        dev: usize,
        /// Bucket count
        got: u64,
    },
    /// A member has fewer usable buckets than the minimum
    NotEnoughBuckets {
        /// Device index
        dev: usize,
        /// Usable buckets
        got: u64,
        /// Minimum
        min: u64,
    },
    /// A member's bucket is smaller than a block
    BucketSmallerThanBlock {
        /// Device index
        dev: usize,
        /// Bucket size in sectors
        bucket_size: u16,
        /// Block size in sectors
        block_size: u16,
    },
    /// A member's bucket is smaller than a btree node
    BucketSmallerThanBtreeNode {
        /// Device index
        dev: usize,
        /// Bucket size in sectors
        bucket_size: u16,
        /// Btree node size in sectors
        btree_node_size: u64,
    },
    /// The key derivation function is unknown
    BadKdfType(u64),
    /// The journal field has no member record to check against
    JournalNoMember(u8),
    /// A journal bucket lies outside the device's usable buckets
    JournalBucketRange {
        /// Bucket number
        bucket: u64,
        /// First usable bucket
        first: u64,
        /// Bucket count
        nbuckets: u64,
    },
    /// A journal bucket is listed twice
    JournalDuplicateBucket(u64),
    /// A member references a disk group that doesn't exist
    GroupMissing {
        /// Device index
        dev: usize,
        /// Group index
        group: u64,
        /// Number of groups
        nr: usize,
    },
    /// A member references a deleted disk group
    GroupDeleted {
        /// Device index
        dev: usize,
        /// Group index
        group: u64,
    },
    /// A live disk group has an empty label
    GroupLabelEmpty(usize),
    /// Two live disk groups share a parent and label
    GroupDuplicate {
        /// Index of the first group
        a: usize,
        /// Index of the second group
        b: usize,
    },
    /// A replicas entry has an invalid data type
    ReplicasDataType(u8),
    /// A replicas entry has no devices
    ReplicasNoDevices,
    /// A replicas entry's required count is out of range
    ReplicasNrRequired {
        /// Required devices
        nr_required: u8,
        /// Listed devices
        nr_devs: u8,
    },
    /// A replicas entry's devices are not sorted and unique
    ReplicasUnsorted,
    /// A replicas entry names a device that isn't a member
    ReplicasBadDevice(u8),
    /// A replicas entry is truncated by the end of the section
    ReplicasTruncated,
    /// The same replicas entry appears twice
    ReplicasDuplicate,
    /// A journal set entry is malformed
    Entry {
        /// Byte offset of the entry within the field
        offset: usize,
        /// Entry type
        ty: u8,
        /// What is wrong with it
        reason: String,
    },
}

impl fmt::Display for FieldInvalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldInvalid::WrongSize { got, want } => {
                write!(f, "wrong size (got {} should be {})", got, want)
            }
            FieldInvalid::TooManyDevices => write!(f, "too many devices for section size"),
            FieldInvalid::TooManyBuckets { dev, got } => write!(
                f,
                "device {}: too many buckets (got {}, max {})",
                dev,
                got,
                i64::MAX
            ),
            FieldInvalid::NotEnoughBuckets { dev, got, min } => write!(
                f,
                "device {}: not enough buckets (got {}, min {})",
                dev, got, min
            ),
            FieldInvalid::BucketSmallerThanBlock {
                dev,
                bucket_size,
                block_size,
            } => write!(
                f,
                "device {}: bucket size {} smaller than block size {}",
                dev, bucket_size, block_size
            ),
            FieldInvalid::BucketSmallerThanBtreeNode {
                dev,
                bucket_size,
                btree_node_size,
            } => write!(
                f,
                "device {}: bucket size {} smaller than btree node size {}",
                dev, bucket_size, btree_node_size
            ),
            FieldInvalid::BadKdfType(t) => write!(f, "bad kdf type {}", t),
            FieldInvalid::JournalNoMember(dev) => {
                write!(f, "no member record for device {}", dev)
            }
            FieldInvalid::JournalBucketRange {
                bucket,
                first,
                nbuckets,
            } => write!(
                f,
                "bucket {} outside range [{}, {})",
                bucket, first, nbuckets
            ),
            FieldInvalid::JournalDuplicateBucket(b) => write!(f, "duplicate journal bucket {}", b),
            FieldInvalid::GroupMissing { dev, group, nr } => write!(
                f,
                "disk {} has invalid label {} (have {})",
                dev, group, nr
            ),
            FieldInvalid::GroupDeleted { dev, group } => {
                write!(f, "disk {} has deleted label {}", dev, group)
            }
            FieldInvalid::GroupLabelEmpty(i) => write!(f, "label {} empty", i),
            FieldInvalid::GroupDuplicate { a, b } => {
                write!(f, "duplicate label (entries {} and {})", a, b)
            }
            FieldInvalid::ReplicasDataType(t) => write!(f, "invalid data type {}", t),
            FieldInvalid::ReplicasNoDevices => write!(f, "no devices in entry"),
            FieldInvalid::ReplicasNrRequired {
                nr_required,
                nr_devs,
            } => write!(
                f,
                "bad nr_required {} for {} devices",
                nr_required, nr_devs
            ),
            FieldInvalid::ReplicasUnsorted => write!(f, "devices not sorted and unique"),
            FieldInvalid::ReplicasBadDevice(d) => write!(f, "invalid device {}", d),
            FieldInvalid::ReplicasTruncated => write!(f, "entry extends past end of section"),
            FieldInvalid::ReplicasDuplicate => write!(f, "duplicate replicas entry"),
            FieldInvalid::Entry { offset, ty, reason } => write!(
                f,
                "invalid journal entry type {} at offset {}: {}",
                ty, offset, reason
            ),
        }
    }
}

impl std::error::Error for SbInvalid {}

/// Validate a whole superblock.
///
/// In `Rw::Read` direction zeroed journal delays are reset to their
/// default and malformed btree roots in the clean section are cleared
/// instead of failing the read.
pub fn validate_super(sb: &mut SbHandle, rw: Rw) -> Result<(), SbInvalid> {
    let (version, version_min) = {
        let s = sb.sb();
        if !is_magic(&s.magic()) {
            return Err(SbInvalid::Magic);
        }
        let version = s.version();
        let version_min = if version >= METADATA_VERSION_BKEY_RENUMBER {
            s.version_min()
        } else {
            version
        };
        (version, version_min)
    };

    if version >= METADATA_VERSION_MAX {
        return Err(SbInvalid::Version { version });
    }

    if version_min < METADATA_VERSION_MIN {
        return Err(SbInvalid::Version {
            version: version_min,
        });
    }

    if version_min > version {
        return Err(SbInvalid::VersionMin {
            version_min,
            version,
        });
    }

    {
        let s = sb.sb();
        let (features0, features1) = (s.feature(0), s.feature(1));
        if features1 != 0 || features0 & (!0u64 << FEATURE_NR) != 0 {
            return Err(SbInvalid::Features {
                features0,
                features1,
            });
        }

        if s.block_size() > BLOCK_SIZE_MAX {
            return Err(SbInvalid::BlockSizeTooBig {
                got: s.block_size(),
            });
        }

        if s.user_uuid().is_nil() {
            return Err(SbInvalid::UserUuidZero);
        }

        if s.uuid().is_nil() {
            return Err(SbInvalid::UuidZero);
        }

        let nr_devices = s.nr_devices();
        if nr_devices == 0 || nr_devices as usize > MEMBERS_MAX {
            return Err(SbInvalid::NrDevices(nr_devices));
        }

        if s.dev_idx() >= nr_devices {
            return Err(SbInvalid::DevIdx {
                dev_idx: s.dev_idx(),
                nr_devices,
            });
        }

        let precision = s.time_precision();
        if precision == 0 || u64::from(precision) > NSEC_PER_SEC {
            return Err(SbInvalid::TimePrecision(precision));
        }
    }

    if rw == Rw::Read {
        let mut s = sb.sb_mut();
        for (name, flag) in [
            ("journal_flush_delay", &SuperBlockFlag::JOURNAL_FLUSH_DELAY),
            ("journal_reclaim_delay", &SuperBlockFlag::JOURNAL_RECLAIM_DELAY),
        ] {
            if s.flag(flag) == 0 {
                warn!("superblock {} was zero, resetting to 1000", name);
                s.set_flag(flag, 1000)
                    .map_err(|_| SbInvalid::Opt { name, value: 1000 })?;
            }
        }
    }

    for opt in SB_OPTS.iter() {
        let value = sb.sb().flag(&opt.flag);
        if !opt.is_valid(value) {
            return Err(SbInvalid::Opt {
                name: opt.name,
                value,
            });
        }
    }

    Layout::from_view(&sb.sb().layout()).validate()?;

    let end = sb.sb().vstruct_bytes();
    for f in sb.fields() {
        if f.u64s == 0 {
            return Err(SbInvalid::FieldEmpty(f.ty));
        }
        if f.offset + f.bytes() > end {
            return Err(SbInvalid::FieldPastEnd(f.ty));
        }
    }

    if rw == Rw::Read {
        neutralise_clean_entries(sb)?;
    }

    // members first, the other fields refer to device indices
    let members = sb
        .field_get(FieldType::Members)
        .ok_or(SbInvalid::MembersMissing)?;
    sb.field_validate(&members)?;

    for f in sb.fields().filter(|f| f.ty != FieldType::Members as u32) {
        sb.field_validate(&f)?;
    }

    Ok(())
}

/// Run the journal entry validator over the clean section in read
/// direction, clearing entries that can be safely ignored.
fn neutralise_clean_entries(sb: &mut SbHandle) -> Result<(), SbInvalid> {
    let clean = match sb.field_get(FieldType::Clean) {
        Some(f) => f,
        None => return Ok(()),
    };
    let ctx = EntryCtx {
        rw: Rw::Read,
        devs: sb.member_mask(),
    };
    let res = match sb.field_payload_mut(&clean).get_mut(crate::clean::CLEAN_PAYLOAD_HEADER..) {
        Some(entries) => journal_entry::validate_entries(entries, &ctx),
        // undersized sections are reported by the clean validator
        None => Ok(()),
    };
    res.map_err(|err| SbInvalid::Field {
        field: FieldType::Clean,
        err,
        text: sb.field_text(&clean),
    })
}
