use std::ops::Range;

use crate::{BchError, Result};

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};
use uuid::Uuid;

/// The sector of the primary superblock
pub const SB_SECTOR: u64 = 8;
/// The sector holding the standalone copy of the superblock layout
pub const LAYOUT_SECTOR: u64 = 7;
/// Size of the on-disk layout descriptor
pub const LAYOUT_BYTES: usize = 512;
/// Maximum number of superblock copies a layout can describe
pub const LAYOUT_MAX_SUPERBLOCKS: usize = (LAYOUT_BYTES - layout_offsets::SB_OFFSET.start) / 8;
/// Size of the fixed superblock header, i.e. where the fields begin
pub const SB_HEADER_BYTES: usize = sb_offsets::FIELDS;

/// Oldest metadata version still understood
pub const METADATA_VERSION_MIN: u16 = 9;
/// Version from which `version_min` is meaningful
pub const METADATA_VERSION_BKEY_RENUMBER: u16 = 10;
/// First unsupported metadata version
pub const METADATA_VERSION_MAX: u16 = 26;
/// The metadata version written by this library
pub const METADATA_VERSION_CURRENT: u16 = METADATA_VERSION_MAX - 1;

/// Maximum number of member devices
pub const MEMBERS_MAX: usize = 64;
/// Minimum number of usable buckets on a device
pub const MIN_NR_NBUCKETS: u64 = 1 << 6;
/// Maximum replication factor
pub const REPLICAS_MAX: usize = 4;
/// Largest supported block size, in sectors
pub const BLOCK_SIZE_MAX: u16 = 1 << 6;
/// Nanoseconds per second
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// The original bcache/bcachefs superblock magic
pub const BCACHE_MAGIC: Uuid = Uuid::from_bytes([
    0xc6, 0x85, 0x73, 0xf6, 0x4e, 0x1a, 0x45, 0xca, 0x82, 0x65, 0xf5, 0x7f, 0x48, 0xba, 0x6d, 0x81,
]);

/// The newer bcachefs-only superblock magic
pub const BCHFS_MAGIC: Uuid = Uuid::from_bytes([
    0xc6, 0x85, 0x73, 0xf6, 0x66, 0xce, 0x90, 0xa9, 0xd9, 0x6a, 0x60, 0xcf, 0x80, 0x3d, 0xf7, 0xef,
]);

/// Returns true if `magic` is one of the recognised superblock magics
pub fn is_magic(magic: &Uuid) -> bool {
    *magic == BCACHE_MAGIC || *magic == BCHFS_MAGIC
}

bitflags! {
    /// Features a superblock may support
    pub struct Features: u64 {
        /// lz4 compression
        const LZ4 = 1 << 0;
        /// gzip compression
        const GZIP = 1 << 1;
        /// zstd compression
        const ZSTD = 1 << 2;
        /// Atomic nlink support
        const ATOMIC_NLINK = 1 << 3;
        /// Erasure coding
        const EC = 1 << 4;
        /// Denylist support
        const JOURNAL_SEQ_DENYLIST_V3 = 1 << 5;
        /// Reflink support
        const REFLINK = 1 << 6;
        /// Use the new shortened siphash
        const NEW_SIPHASH = 1 << 7;
        /// Allow inline data
        const INLINE_DATA = 1 << 8;
        /// Allow new extent overwrites
        const NEW_EXTENT_OVERWRITE = 1 << 9;
        /// Incompressible
        const INCOMPRESSIBLE = 1 << 10;
        /// Allow btree v2 pointers
        const BTREE_PTR_V2 = 1 << 11;
        /// Extents above btree updates
        const EXTENTS_ABOVE_BTREE_UPDATES = 1 << 12;
        /// Btree updates are journaled
        const BTREE_UPDATES_JOURNALLED = 1 << 13;
        /// Inline data may be reflinked
        const REFLINK_INLINE_DATA = 1 << 14;
        /// New varint support
        const NEW_VARINT = 1 << 15;
        /// Journal is not flushed
        const JOURNAL_NO_FLUSH = 1 << 16;
        /// Alloc v2 support
        const ALLOC_V2 = 1 << 17;
        /// Extents across btree nodes
        const EXTENTS_ACROSS_BTREE_NODES = 1 << 18;
        /// Features always set from userspace tools
        const ALWAYS = Self::NEW_EXTENT_OVERWRITE.bits |
                       Self::EXTENTS_ABOVE_BTREE_UPDATES.bits |
                       Self::BTREE_UPDATES_JOURNALLED.bits |
                       Self::ALLOC_V2.bits |
                       Self::EXTENTS_ACROSS_BTREE_NODES.bits;
        /// Bitset of all available features
        const ALL = Self::ALWAYS.bits |
                    Self::NEW_SIPHASH.bits |
                    Self::BTREE_PTR_V2.bits |
                    Self::NEW_VARINT.bits |
                    Self::JOURNAL_NO_FLUSH.bits;
    }
}

/// Number of feature bits this library knows about
pub const FEATURE_NR: u32 = 19;

const FEATURE_NAMES: [&str; FEATURE_NR as usize] = [
    "lz4",
    "gzip",
    "zstd",
    "atomic_nlink",
    "ec",
    "journal_seq_blacklist_v3",
    "reflink",
    "new_siphash",
    "inline_data",
    "new_extent_overwrite",
    "incompressible",
    "btree_ptr_v2",
    "extents_above_btree_updates",
    "btree_updates_journalled",
    "reflink_inline_data",
    "new_varint",
    "journal_no_flush",
    "alloc_v2",
    "extents_across_btree_nodes",
];

bitflags! {
    /// Compatible feature bits
    pub struct Compat: u64 {
        /// Allocation info is consistent with the btrees
        const ALLOC_INFO = 1 << 0;
        /// Allocation metadata is consistent with the btrees
        const ALLOC_METADATA = 1 << 1;
        /// Upgrade of extents above btree updates finished
        const EXTENTS_ABOVE_BTREE_UPDATES_DONE = 1 << 2;
        /// Upgrade of bformat overflow finished
        const BFORMAT_OVERFLOW_DONE = 1 << 3;
    }
}

/// Number of compat bits this library knows about
pub const COMPAT_NR: u32 = 4;

const COMPAT_NAMES: [&str; COMPAT_NR as usize] = [
    "alloc_info",
    "alloc_metadata",
    "extents_above_btree_updates_done",
    "bformat_overflow_done",
];

bitflags! {
    /// The bitmasks for data types
    pub struct DataTypes: u64 {
        /// No data may be stored on this device
        const NONE = 1 << 0;
        /// Superblock data may be stored on this device
        const SB = 1 << 1;
        /// Journal data may be stored on this device
        const JOURNAL = 1 << 2;
        /// Btree pointers may be stored on this device
        const BTREE = 1 << 3;
        /// Extents and reflinks may be stored on this device
        const USER = 1 << 4;
        // NB: The cached and parity data types do not require
        // a device allocator and therefore should not be
        // specified here.
        /// Bitset of the default data types
        const DEFAULT = Self::SB.bits |
                        Self::JOURNAL.bits |
                        Self::BTREE.bits |
                        Self::USER.bits;
    }
}

/// Number of data types
pub const DATA_TYPE_NR: usize = 10;

/// Names of the data types, indexed by their on-disk number
pub const DATA_TYPE_NAMES: [&str; DATA_TYPE_NR] = [
    "free",
    "sb",
    "journal",
    "btree",
    "user",
    "cached",
    "parity",
    "stripe",
    "need_gc_gens",
    "need_discard",
];

/// Data type numbers
pub mod data_type {
    /// Free space
    pub const FREE: u8 = 0;
    /// Superblock
    pub const SB: u8 = 1;
    /// Journal
    pub const JOURNAL: u8 = 2;
    /// Btree nodes
    pub const BTREE: u8 = 3;
    /// User data
    pub const USER: u8 = 4;
    /// Cached user data
    pub const CACHED: u8 = 5;
    /// Erasure coding parity
    pub const PARITY: u8 = 6;
}

/// Render a bitmask as a comma separated list of names
pub fn bitflags_to_text(names: &[&str], mut v: u64) -> String {
    let mut out = String::new();
    let mut bit = 0;
    while v != 0 {
        if v & 1 != 0 {
            if !out.is_empty() {
                out.push(',');
            }
            match names.get(bit) {
                Some(name) => out.push_str(name),
                None => out.push_str(&format!("({})", bit)),
            }
        }
        v >>= 1;
        bit += 1;
    }
    out
}

/// Render a feature bitmask
pub fn features_to_text(v: u64) -> String {
    bitflags_to_text(&FEATURE_NAMES, v)
}

/// Render a compat bitmask
pub fn compat_to_text(v: u64) -> String {
    bitflags_to_text(&COMPAT_NAMES, v)
}

pub(crate) mod sb_offsets {
    use super::layout_offsets;
    use std::ops::Range;

    pub const CSUM: Range<usize> = 0..16;
    pub const VERSION: Range<usize> = 16..18;
    pub const VERSION_MIN: Range<usize> = 18..20;
    // reserved four bytes
    pub const MAGIC: Range<usize> = 24..40;
    pub const UUID: Range<usize> = 40..56;
    pub const USER_UUID: Range<usize> = 56..72;
    pub const LABEL: Range<usize> = 72..104;
    pub const LABEL_SIZE: usize = LABEL.end - LABEL.start;
    pub const OFFSET: Range<usize> = 104..112;
    pub const SEQ: Range<usize> = 112..120;
    pub const BLOCK_SIZE: Range<usize> = 120..122;
    pub const DEV_IDX: usize = 122;
    pub const NR_DEVS: usize = 123;
    pub const U64S: Range<usize> = 124..128;
    pub const TIME_BASE_LO: Range<usize> = 128..136;
    pub const TIME_BASE_HI: Range<usize> = 136..140;
    pub const TIME_PRECISION: Range<usize> = 140..144;
    pub const FLAGS: Range<usize> = 144..208;
    pub const FEATURES: Range<usize> = 208..224;
    pub const COMPAT: Range<usize> = 224..240;
    pub const LAYOUT: Range<usize> = 240..(240 + layout_offsets::SB_OFFSET.end);
    pub const FIELDS: usize = LAYOUT.end;
}

pub(crate) mod layout_offsets {
    use std::ops::Range;

    pub const MAGIC: Range<usize> = 0..16;
    pub const LAYOUT_TYPE: usize = 16;
    pub const SB_MAX_SIZE_BITS: usize = 17;
    pub const NR_SUPERBLOCKS: usize = 18;
    // 5 bytes of padding
    pub const SB_OFFSET: Range<usize> = 24..512;
}

fn bitmask(width: u64) -> u64 {
    if width >= 64 {
        !0
    } else {
        (1 << width) - 1
    }
}

/// Read a bitfield out of a little endian u64 array
pub(crate) fn get_bits(buf: &[u8], word: usize, bits: &Range<u64>) -> u64 {
    let start = word * 8;
    let v = LittleEndian::read_u64(&buf[start..start + 8]);
    (v >> bits.start) & bitmask(bits.end - bits.start)
}

/// Write a bitfield into a little endian u64 array
pub(crate) fn set_bits(buf: &mut [u8], word: usize, bits: &Range<u64>, val: u64) -> Result<()> {
    let max = bitmask(bits.end - bits.start);
    let start = word * 8;
    let range = start..(start + 8);

    if buf.len() < range.end {
        Err(BchError::Exhausted)
    } else if val > max {
        Err(BchError::Einval(format!("{} > {}", val, max)))
    } else {
        let mut field = LittleEndian::read_u64(&buf[range.clone()]);
        field &= !(max << bits.start);
        field |= val << bits.start;
        LittleEndian::write_u64(&mut buf[range], field);
        Ok(())
    }
}

/// A superblock flag bitmask
#[derive(Debug)]
pub struct SuperBlockFlag(pub usize, pub Range<u64>);

impl SuperBlockFlag {
    // index 0
    /// The filesystem finished its initial format and may be written
    pub const INITIALIZED: SuperBlockFlag = SuperBlockFlag(0, 0..1);
    /// The filesystem was shut down cleanly
    pub const CLEAN: SuperBlockFlag = SuperBlockFlag(0, 1..2);
    /// Checksum type of the superblock itself
    pub const CSUM_TYPE: SuperBlockFlag = SuperBlockFlag(0, 2..8);
    /// Bitmask for action to take on error
    pub const ERROR_ACTION: SuperBlockFlag = SuperBlockFlag(0, 8..12);
    /// Bitmask for btree node size
    pub const BTREE_NODE_SIZE: SuperBlockFlag = SuperBlockFlag(0, 12..28);
    /// Bitmask for percentage of gc reserve
    pub const GC_RESERVE: SuperBlockFlag = SuperBlockFlag(0, 28..33);
    /// Bitmask for percentage of root reserve
    pub const ROOT_RESERVE: SuperBlockFlag = SuperBlockFlag(0, 33..40);
    /// Metadata checksum option
    pub const META_CSUM_TYPE: SuperBlockFlag = SuperBlockFlag(0, 40..44);
    /// Data checksum option
    pub const DATA_CSUM_TYPE: SuperBlockFlag = SuperBlockFlag(0, 44..48);
    /// Bitmask for number of metadata replicas wanted
    pub const META_REPLICAS_WANT: SuperBlockFlag = SuperBlockFlag(0, 48..52);
    /// Bitmask for number of data replicas wanted
    pub const DATA_REPLICAS_WANT: SuperBlockFlag = SuperBlockFlag(0, 52..56);
    /// Bitmask for acl flag
    pub const POSIX_ACL: SuperBlockFlag = SuperBlockFlag(0, 56..57);
    /// Bitmask for user quota flag
    pub const USRQUOTA: SuperBlockFlag = SuperBlockFlag(0, 57..58);
    /// Bitmask for group quota flag
    pub const GRPQUOTA: SuperBlockFlag = SuperBlockFlag(0, 58..59);
    /// Bitmask for project quota flag
    pub const PRJQUOTA: SuperBlockFlag = SuperBlockFlag(0, 59..60);
    /// Errors were seen while the filesystem was mounted
    pub const HAS_ERRORS: SuperBlockFlag = SuperBlockFlag(0, 60..61);
    /// Btree topology errors were seen while the filesystem was mounted
    pub const HAS_TOPOLOGY_ERRORS: SuperBlockFlag = SuperBlockFlag(0, 61..62);
    /// The superblock was last written by a big endian machine
    pub const BIG_ENDIAN: SuperBlockFlag = SuperBlockFlag(0, 62..63);
    // index 1
    /// String hash type
    pub const STR_HASH_TYPE: SuperBlockFlag = SuperBlockFlag(1, 0..4);
    /// Compression type
    pub const COMPRESSION_TYPE: SuperBlockFlag = SuperBlockFlag(1, 4..8);
    /// Encryption type, zero when unencrypted
    pub const ENCRYPTION_TYPE: SuperBlockFlag = SuperBlockFlag(1, 10..14);
    /// Bitmask for number of metadata replicas required
    pub const META_REPLICAS_REQ: SuperBlockFlag = SuperBlockFlag(1, 20..24);
    /// Bitmask for number of data replicas required
    pub const DATA_REPLICAS_REQ: SuperBlockFlag = SuperBlockFlag(1, 24..28);
    /// Bitmask for the promote target device index
    pub const PROMOTE_TARGET: SuperBlockFlag = SuperBlockFlag(1, 28..40);
    /// Bitmask for the foreground target device index
    pub const FOREGROUND_TARGET: SuperBlockFlag = SuperBlockFlag(1, 40..52);
    /// Bitmask for the background target device index
    pub const BACKGROUND_TARGET: SuperBlockFlag = SuperBlockFlag(1, 52..64);
    // index 3
    /// Bitmask for the metadata target device index
    pub const METADATA_TARGET: SuperBlockFlag = SuperBlockFlag(3, 16..28);
    /// Journal flush delay in milliseconds
    pub const JOURNAL_FLUSH_DELAY: SuperBlockFlag = SuperBlockFlag(3, 30..62);
    // index 4
    /// Journal reclaim delay in milliseconds
    pub const JOURNAL_RECLAIM_DELAY: SuperBlockFlag = SuperBlockFlag(4, 0..32);
}

/// A superblock
///
/// This is a view over the raw bytes of a superblock: the fixed header
/// followed by the variable length list of fields. The buffer must be at
/// least `SB_HEADER_BYTES` long.
pub struct SuperBlock<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> SuperBlock<T> {
    /// Create a superblock view of the given buffer
    pub fn new(buf: T) -> Result<SuperBlock<T>> {
        if buf.as_ref().len() < SB_HEADER_BYTES {
            Err(BchError::Exhausted)
        } else {
            Ok(SuperBlock { buffer: buf })
        }
    }

    /// View a buffer already known to hold a full header
    pub(crate) fn from_buf(buf: T) -> SuperBlock<T> {
        debug_assert!(buf.as_ref().len() >= SB_HEADER_BYTES);
        SuperBlock { buffer: buf }
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for SuperBlock<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

impl<T: AsRef<[u8]>> SuperBlock<T> {
    fn uuid_at(&self, range: Range<usize>) -> Uuid {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&self.buffer.as_ref()[range]);
        Uuid::from_bytes(bytes)
    }

    /// The stored checksum
    pub fn csum(&self) -> [u8; 16] {
        let mut csum = [0u8; 16];
        csum.copy_from_slice(&self.buffer.as_ref()[sb_offsets::CSUM]);
        csum
    }

    /// The current version supported
    pub fn version(&self) -> u16 {
        LittleEndian::read_u16(&self.buffer.as_ref()[sb_offsets::VERSION])
    }

    /// The minimum version supported
    pub fn version_min(&self) -> u16 {
        LittleEndian::read_u16(&self.buffer.as_ref()[sb_offsets::VERSION_MIN])
    }

    /// The identifying magic value
    pub fn magic(&self) -> Uuid {
        self.uuid_at(sb_offsets::MAGIC)
    }

    /// The generated UUID of this superblock
    pub fn uuid(&self) -> Uuid {
        self.uuid_at(sb_offsets::UUID)
    }

    /// The user set UUID of this superblock
    pub fn user_uuid(&self) -> Uuid {
        self.uuid_at(sb_offsets::USER_UUID)
    }

    /// The label of this superblock
    pub fn label(&self) -> &[u8] {
        &self.buffer.as_ref()[sb_offsets::LABEL]
    }

    /// The sector this copy was written to
    pub fn offset(&self) -> u64 {
        LittleEndian::read_u64(&self.buffer.as_ref()[sb_offsets::OFFSET])
    }

    /// The sequence number
    pub fn seq(&self) -> u64 {
        LittleEndian::read_u64(&self.buffer.as_ref()[sb_offsets::SEQ])
    }

    /// The block size of this superblock, in sectors
    pub fn block_size(&self) -> u16 {
        LittleEndian::read_u16(&self.buffer.as_ref()[sb_offsets::BLOCK_SIZE])
    }

    /// The device index of this device
    pub fn dev_idx(&self) -> u8 {
        self.buffer.as_ref()[sb_offsets::DEV_IDX]
    }

    /// The number of devices
    pub fn nr_devices(&self) -> u8 {
        self.buffer.as_ref()[sb_offsets::NR_DEVS]
    }

    /// The number of u64s in the variable TLV of fields
    pub fn u64s(&self) -> u32 {
        LittleEndian::read_u32(&self.buffer.as_ref()[sb_offsets::U64S])
    }

    /// Total size of the superblock in bytes, header included
    pub fn vstruct_bytes(&self) -> usize {
        SB_HEADER_BYTES + self.u64s() as usize * 8
    }

    /// The low bits of the time base
    pub fn time_base_lo(&self) -> u64 {
        LittleEndian::read_u64(&self.buffer.as_ref()[sb_offsets::TIME_BASE_LO])
    }

    /// The high bits of the time base
    pub fn time_base_hi(&self) -> u32 {
        LittleEndian::read_u32(&self.buffer.as_ref()[sb_offsets::TIME_BASE_HI])
    }

    /// The time precision in nanoseconds
    pub fn time_precision(&self) -> u32 {
        LittleEndian::read_u32(&self.buffer.as_ref()[sb_offsets::TIME_PRECISION])
    }

    /// The value of the given superblock flag
    pub fn flag(&self, flag: &SuperBlockFlag) -> u64 {
        get_bits(&self.buffer.as_ref()[sb_offsets::FLAGS], flag.0, &flag.1)
    }

    /// The flag u64s
    pub fn flags_u64s(&self) -> [u64; 8] {
        let mut data = [0u64; 8];
        for (i, entry) in self.buffer.as_ref()[sb_offsets::FLAGS].chunks(8).enumerate() {
            data[i] = LittleEndian::read_u64(entry);
        }
        data
    }

    /// The feature set at the given index
    pub fn feature(&self, idx: usize) -> u64 {
        let start = sb_offsets::FEATURES.start + (idx * 8);
        LittleEndian::read_u64(&self.buffer.as_ref()[start..start + 8])
    }

    /// The compat set at the given index
    pub fn compat(&self, idx: usize) -> u64 {
        let start = sb_offsets::COMPAT.start + (idx * 8);
        LittleEndian::read_u64(&self.buffer.as_ref()[start..start + 8])
    }

    /// The embedded copy of the layout
    pub fn layout(&self) -> SuperBlockLayout<&[u8]> {
        SuperBlockLayout {
            buffer: &self.buffer.as_ref()[sb_offsets::LAYOUT],
        }
    }

    /// The bytes of the field area, bounded by the buffer rather than `u64s`
    pub fn fields_area(&self) -> &[u8] {
        &self.buffer.as_ref()[sb_offsets::FIELDS..]
    }
}

impl<T: AsMut<[u8]>> AsMut<[u8]> for SuperBlock<T> {
    fn as_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut()
    }
}

impl<T: AsMut<[u8]>> SuperBlock<T> {
    /// Store the checksum
    pub fn set_csum(&mut self, csum: [u8; 16]) {
        self.buffer.as_mut()[sb_offsets::CSUM].copy_from_slice(&csum);
    }

    /// Set the version used
    pub fn set_version(&mut self, version: u16) {
        LittleEndian::write_u16(&mut self.buffer.as_mut()[sb_offsets::VERSION], version);
    }

    /// Set the version minimum
    pub fn set_version_min(&mut self, version: u16) {
        LittleEndian::write_u16(&mut self.buffer.as_mut()[sb_offsets::VERSION_MIN], version);
    }

    /// Set the magic value for this superblock
    pub fn set_magic(&mut self, magic: Uuid) {
        self.buffer.as_mut()[sb_offsets::MAGIC].copy_from_slice(magic.as_bytes());
    }

    /// Set the generated UUID of this superblock
    pub fn set_uuid(&mut self, uuid: Uuid) {
        self.buffer.as_mut()[sb_offsets::UUID].copy_from_slice(uuid.as_bytes());
    }

    /// Set the user set UUID of this superblock
    pub fn set_user_uuid(&mut self, uuid: Uuid) {
        self.buffer.as_mut()[sb_offsets::USER_UUID].copy_from_slice(uuid.as_bytes());
    }

    /// Set the label for this filesystem
    pub fn set_label(&mut self, label: &[u8]) -> Result<()> {
        if label.len() > sb_offsets::LABEL_SIZE {
            return Err(BchError::Einval(format!(
                "label of length {} too long",
                label.len()
            )));
        }
        let buf = &mut self.buffer.as_mut()[sb_offsets::LABEL];
        for b in buf.iter_mut() {
            *b = 0;
        }
        buf[..label.len()].copy_from_slice(label);
        Ok(())
    }

    /// Set the sequence number for this superblock
    pub fn set_seq(&mut self, seq: u64) {
        LittleEndian::write_u64(&mut self.buffer.as_mut()[sb_offsets::SEQ], seq);
    }

    /// Set the offset for this superblock
    pub fn set_offset(&mut self, offset: u64) {
        LittleEndian::write_u64(&mut self.buffer.as_mut()[sb_offsets::OFFSET], offset);
    }

    /// Set the block size, in sectors
    pub fn set_block_size(&mut self, block_size: u16) {
        LittleEndian::write_u16(&mut self.buffer.as_mut()[sb_offsets::BLOCK_SIZE], block_size);
    }

    /// Set the index of the given device
    pub fn set_dev_idx(&mut self, val: u8) {
        self.buffer.as_mut()[sb_offsets::DEV_IDX] = val;
    }

    /// Set the number of devices
    pub fn set_nr_devices(&mut self, val: u8) {
        self.buffer.as_mut()[sb_offsets::NR_DEVS] = val;
    }

    /// Set the number of u64s in the variable TLV of fields
    pub fn set_u64s(&mut self, u64s: u32) {
        LittleEndian::write_u32(&mut self.buffer.as_mut()[sb_offsets::U64S], u64s);
    }

    /// Set the low bits of the time base
    pub fn set_time_base_lo(&mut self, val: u64) {
        LittleEndian::write_u64(&mut self.buffer.as_mut()[sb_offsets::TIME_BASE_LO], val);
    }

    /// Set the high bits of the time base
    pub fn set_time_base_hi(&mut self, val: u32) {
        LittleEndian::write_u32(&mut self.buffer.as_mut()[sb_offsets::TIME_BASE_HI], val);
    }

    /// Set the time precision
    pub fn set_time_precision(&mut self, val: u32) {
        LittleEndian::write_u32(&mut self.buffer.as_mut()[sb_offsets::TIME_PRECISION], val);
    }

    /// Set the given superblock flag with the given value
    pub fn set_flag(&mut self, flag: &SuperBlockFlag, val: u64) -> Result<()> {
        set_bits(
            &mut self.buffer.as_mut()[sb_offsets::FLAGS],
            flag.0,
            &flag.1,
            val,
        )
    }

    /// Set a boolean superblock flag
    pub fn set_flag_bool(&mut self, flag: &SuperBlockFlag, val: bool) {
        let start = sb_offsets::FLAGS.start + flag.0 * 8;
        let word = &mut self.buffer.as_mut()[start..start + 8];
        let bit = 1u64 << flag.1.start;
        let mut v = LittleEndian::read_u64(word);
        if val {
            v |= bit;
        } else {
            v &= !bit;
        }
        LittleEndian::write_u64(word, v);
    }

    /// Set the features bits for the given features index
    pub fn set_feature(&mut self, idx: usize, val: u64) {
        let start = sb_offsets::FEATURES.start + (idx * 8);
        LittleEndian::write_u64(&mut self.buffer.as_mut()[start..start + 8], val);
    }

    /// Set the compat bits for the given compat index
    pub fn set_compat(&mut self, idx: usize, val: u64) {
        let start = sb_offsets::COMPAT.start + (idx * 8);
        LittleEndian::write_u64(&mut self.buffer.as_mut()[start..start + 8], val);
    }

    /// Set the superblock layout.
    ///
    /// **NOTE**: This does not set the superblock layout set at the layout sector. Following
    /// the base superblock info but before the variable TLV of fields another copy of the
    /// superblock layout is stored.
    pub fn set_layout<U: AsRef<[u8]>>(&mut self, layout: &SuperBlockLayout<U>) {
        let layout_buf = layout.as_ref();
        self.buffer.as_mut()[sb_offsets::LAYOUT].copy_from_slice(&layout_buf[..LAYOUT_BYTES]);
    }

    /// Mutable view of the embedded layout
    pub fn layout_mut(&mut self) -> SuperBlockLayout<&mut [u8]> {
        SuperBlockLayout {
            buffer: &mut self.buffer.as_mut()[sb_offsets::LAYOUT],
        }
    }
}

/// A superblock layout
pub struct SuperBlockLayout<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> SuperBlockLayout<T> {
    /// Create a superblock layout view for the given bytes
    pub fn new(buf: T) -> Result<SuperBlockLayout<T>> {
        if buf.as_ref().len() < LAYOUT_BYTES {
            Err(BchError::Exhausted)
        } else {
            Ok(SuperBlockLayout { buffer: buf })
        }
    }
}

impl<T: AsRef<[u8]>> AsRef<[u8]> for SuperBlockLayout<T> {
    fn as_ref(&self) -> &[u8] {
        self.buffer.as_ref()
    }
}

impl<T: AsRef<[u8]>> SuperBlockLayout<T> {
    /// Get the magic uuid for the layout
    pub fn magic(&self) -> Uuid {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&self.buffer.as_ref()[layout_offsets::MAGIC]);
        Uuid::from_bytes(bytes)
    }

    /// Get the superblock layout type
    pub fn layout_type(&self) -> u8 {
        self.buffer.as_ref()[layout_offsets::LAYOUT_TYPE]
    }

    /// Get the log2 of the maximum superblock size, in sectors
    pub fn sb_max_size_bits(&self) -> u8 {
        self.buffer.as_ref()[layout_offsets::SB_MAX_SIZE_BITS]
    }

    /// Get the number of encoded superblocks
    pub fn nr_superblocks(&self) -> u8 {
        self.buffer.as_ref()[layout_offsets::NR_SUPERBLOCKS]
    }

    /// Get the offset sector for the superblock at the given index
    pub fn sb_offset(&self, idx: usize) -> u64 {
        let start = layout_offsets::SB_OFFSET.start + (idx * 8);
        LittleEndian::read_u64(&self.buffer.as_ref()[start..start + 8])
    }

    /// Maximum size of one superblock copy, in bytes
    pub fn max_bytes(&self) -> usize {
        512usize << self.sb_max_size_bits().min(31)
    }
}

impl<T: AsMut<[u8]>> AsMut<[u8]> for SuperBlockLayout<T> {
    fn as_mut(&mut self) -> &mut [u8] {
        self.buffer.as_mut()
    }
}

impl<T: AsMut<[u8]>> SuperBlockLayout<T> {
    /// Set the magic value
    pub fn set_magic(&mut self, magic: Uuid) {
        self.buffer.as_mut()[layout_offsets::MAGIC].copy_from_slice(magic.as_bytes());
    }

    /// Set the layout type of the superblock layout
    pub fn set_layout_type(&mut self, val: u8) {
        self.buffer.as_mut()[layout_offsets::LAYOUT_TYPE] = val;
    }

    /// Set the superblock max size bits
    pub fn set_sb_max_size_bits(&mut self, val: u8) {
        self.buffer.as_mut()[layout_offsets::SB_MAX_SIZE_BITS] = val;
    }

    /// Set the number of superblocks encoded
    pub fn set_nr_superblocks(&mut self, val: u8) {
        self.buffer.as_mut()[layout_offsets::NR_SUPERBLOCKS] = val;
    }

    /// Set the offset sector for the superblock at the given index
    pub fn set_sb_offset(&mut self, idx: usize, val: u64) -> Result<()> {
        if idx >= LAYOUT_MAX_SUPERBLOCKS {
            return Err(BchError::Exhausted);
        }
        let start = layout_offsets::SB_OFFSET.start + (idx * 8);
        LittleEndian::write_u64(&mut self.buffer.as_mut()[start..start + 8], val);
        Ok(())
    }
}

#[cfg(test)]
mod test_sb {
    use super::*;

    fn example() -> Vec<u8> {
        let mut buf = vec![0u8; SB_HEADER_BYTES];
        let head: [u8; 24] = [
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, // csum
            0x34, 0x12, // version
            0x56, 0x34, // version min
            0x00, 0x00, 0x00, 0x00, // pad 4 bytes
        ];
        buf[..24].copy_from_slice(&head);
        buf[24..40].copy_from_slice(BCACHE_MAGIC.as_bytes());
        buf[104] = 0x01; // offset
        buf[112] = 0x02; // seq
        buf[120] = 0x03; // block size
        buf[122] = 0x04; // dev index
        buf[123] = 0x05; // nr devices
        buf[124] = 0x06; // u64s
        for i in 0..8 {
            buf[144 + i * 8] = 7 + i as u8; // flags
        }
        buf[208] = 0x0f; // features
        buf[216] = 0x10;
        buf[224] = 0x11; // compat
        buf[232] = 0x12;
        buf
    }

    #[test]
    fn parse_simple() {
        let buf = example();
        let sb = SuperBlock::new(&buf[..]).unwrap();
        assert_eq!(sb.version(), 0x1234);
        assert_eq!(sb.version_min(), 0x3456);
        assert_eq!(sb.magic(), BCACHE_MAGIC);
        assert!(sb.uuid().is_nil());
        assert!(sb.user_uuid().is_nil());
        assert_eq!(*sb.label().iter().max().unwrap(), 0);
        assert_eq!(sb.offset(), 1);
        assert_eq!(sb.seq(), 2);
        assert_eq!(sb.block_size(), 3);
        assert_eq!(sb.dev_idx(), 4);
        assert_eq!(sb.nr_devices(), 5);
        assert_eq!(sb.u64s(), 6);
        assert_eq!(sb.vstruct_bytes(), SB_HEADER_BYTES + 48);
        assert_eq!(sb.flags_u64s(), [7, 8, 9, 10, 11, 12, 13, 14]);
        assert_eq!([sb.feature(0), sb.feature(1)], [15, 16]);
        assert_eq!([sb.compat(0), sb.compat(1)], [17, 18]);
    }

    #[test]
    fn too_short() {
        let buf = [0u8; 240];
        assert!(matches!(
            SuperBlock::new(&buf[..]),
            Err(BchError::Exhausted)
        ));
    }

    #[test]
    fn flags_round_trip() {
        let mut buf = vec![0u8; SB_HEADER_BYTES];
        let mut sb = SuperBlock::new(&mut buf[..]).unwrap();
        sb.set_flag(&SuperBlockFlag::BTREE_NODE_SIZE, 512).unwrap();
        sb.set_flag_bool(&SuperBlockFlag::CLEAN, true);
        sb.set_flag(&SuperBlockFlag::JOURNAL_RECLAIM_DELAY, 1000)
            .unwrap();
        assert_eq!(sb.flag(&SuperBlockFlag::BTREE_NODE_SIZE), 512);
        assert_eq!(sb.flag(&SuperBlockFlag::CLEAN), 1);
        assert_eq!(sb.flag(&SuperBlockFlag::INITIALIZED), 0);
        assert_eq!(sb.flag(&SuperBlockFlag::JOURNAL_RECLAIM_DELAY), 1000);
        assert!(sb.set_flag(&SuperBlockFlag::GC_RESERVE, 32).is_err());

        sb.set_flag_bool(&SuperBlockFlag::HAS_ERRORS, true);
        sb.set_flag_bool(&SuperBlockFlag::CLEAN, false);
        assert_eq!(sb.flag(&SuperBlockFlag::HAS_ERRORS), 1);
        assert_eq!(sb.flag(&SuperBlockFlag::HAS_TOPOLOGY_ERRORS), 0);
        assert_eq!(sb.flag(&SuperBlockFlag::CLEAN), 0);
        assert_eq!(sb.flag(&SuperBlockFlag::BTREE_NODE_SIZE), 512);
    }

    #[test]
    fn bitflag_names() {
        assert_eq!(features_to_text(Features::LZ4.bits() | Features::ZSTD.bits()), "lz4,zstd");
        assert_eq!(compat_to_text(1 << 5), "(5)");
    }
}

#[cfg(test)]
mod test_layout {
    use super::*;

    const EXAMPLE: [u8; 40] = [
        0xc6, 0x85, 0x73, 0xf6, 0x4e, 0x1a, 0x45, 0xca, 0x82, 0x65, 0xf5, 0x7f, 0x48, 0xba, 0x6d,
        0x81, // magic
        0x00, // layout type
        0x0b, // superblock size
        0x02, // nr superblocks
        0x00, 0x00, 0x00, 0x00, 0x00, // padding
        0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // offset #1
        0x08, 0x08, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // offset #2
    ];

    #[test]
    fn parse_simple() {
        let mut data = [0u8; LAYOUT_BYTES];
        data[..40].copy_from_slice(&EXAMPLE);
        let layout = SuperBlockLayout::new(&data[..]).unwrap();
        assert_eq!(layout.magic(), BCACHE_MAGIC);
        assert_eq!(layout.layout_type(), 0);
        assert_eq!(layout.sb_max_size_bits(), 0x0b);
        assert_eq!(layout.nr_superblocks(), 0x02);
        assert_eq!(layout.sb_offset(0), 0x08);
        assert_eq!(layout.sb_offset(1), 0x0808);
        assert_eq!(layout.max_bytes(), 512 << 11);
    }

    #[test]
    fn build_simple() {
        let mut data = [0x00; LAYOUT_BYTES];
        let mut layout = SuperBlockLayout::new(&mut data[..]).unwrap();
        layout.set_magic(BCACHE_MAGIC);
        layout.set_layout_type(0x00);
        layout.set_sb_max_size_bits(0x0b);
        layout.set_nr_superblocks(0x02);
        layout.set_sb_offset(0, 8).unwrap();
        layout.set_sb_offset(1, 0x0808).unwrap();
        assert!(layout.set_sb_offset(LAYOUT_MAX_SUPERBLOCKS, 1).is_err());
        assert_eq!(data[..40], EXAMPLE);
    }
}
