//! The superblock buffer and its directory of typed fields.

use std::collections::BTreeSet;
use std::fmt::Write;
use std::sync::Arc;

use crate::clean::CleanField;
use crate::counters::CountersField;
use crate::crypt::CryptField;
use crate::device::ByteDevice;
use crate::disk_groups::DiskGroupsField;
use crate::fs::DevMask;
use crate::members::MembersField;
use crate::replicas::ReplicasField;
use crate::super_block::{SuperBlock, SB_HEADER_BYTES};
use crate::validate::{FieldInvalid, SbInvalid};
use crate::{BchError, Result};

use byteorder::{ByteOrder, LittleEndian};
use log::debug;

/// Number of field types known to this library
pub const FIELD_NR: u32 = 11;

const FIELD_HEADER_BYTES: usize = 8;

/// Field type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum FieldType {
    /// Journal buckets of this device
    Journal = 0,
    /// Member devices
    Members = 1,
    /// Encryption key and KDF parameters
    Crypt = 2,
    /// Old style replicas entries
    ReplicasV0 = 3,
    /// Quota limits
    Quota = 4,
    /// Disk group labels
    DiskGroups = 5,
    /// Clean shutdown snapshot
    Clean = 6,
    /// Replicas entries
    Replicas = 7,
    /// Blacklisted journal sequence numbers
    JournalSeqBlacklist = 8,
    /// Journal bucket ranges of this device
    JournalV2 = 9,
    /// Event counters
    Counters = 10,
}

impl FieldType {
    /// All field types, in tag order
    pub const ALL: [FieldType; FIELD_NR as usize] = [
        FieldType::Journal,
        FieldType::Members,
        FieldType::Crypt,
        FieldType::ReplicasV0,
        FieldType::Quota,
        FieldType::DiskGroups,
        FieldType::Clean,
        FieldType::Replicas,
        FieldType::JournalSeqBlacklist,
        FieldType::JournalV2,
        FieldType::Counters,
    ];

    /// Decode a type tag
    pub fn from_u32(v: u32) -> Option<FieldType> {
        FieldType::ALL.get(v as usize).copied()
    }

    /// Name of the field type
    pub fn name(self) -> &'static str {
        match self {
            FieldType::Journal => "journal",
            FieldType::Members => "members",
            FieldType::Crypt => "crypt",
            FieldType::ReplicasV0 => "replicas_v0",
            FieldType::Quota => "quota",
            FieldType::DiskGroups => "disk_groups",
            FieldType::Clean => "clean",
            FieldType::Replicas => "replicas",
            FieldType::JournalSeqBlacklist => "journal_seq_blacklist",
            FieldType::JournalV2 => "journal_v2",
            FieldType::Counters => "counters",
        }
    }

    /// Fields whose contents differ between the devices of a filesystem
    pub fn is_per_device(self) -> bool {
        matches!(self, FieldType::Journal | FieldType::JournalV2)
    }
}

/// Location of one field inside a superblock buffer.
///
/// Only valid until the next resize of any field in the same buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRef {
    /// Byte offset of the field header in the buffer
    pub offset: usize,
    /// Length of the field in u64s, header included
    pub u64s: u32,
    /// Raw type tag
    pub ty: u32,
}

impl FieldRef {
    /// Length in bytes, header included
    pub fn bytes(&self) -> usize {
        self.u64s as usize * 8
    }

    /// The decoded type, if known
    pub fn field_type(&self) -> Option<FieldType> {
        FieldType::from_u32(self.ty)
    }
}

/// Journal buckets of one device
#[derive(Debug, Clone, Copy)]
pub struct JournalField<'a> {
    buf: &'a [u8],
}

impl<'a> JournalField<'a> {
    /// Bucket numbers
    pub fn buckets(&self) -> impl Iterator<Item = u64> + 'a {
        self.buf.chunks_exact(8).map(LittleEndian::read_u64)
    }

    fn validate(&self, sb: &SbHandle) -> std::result::Result<(), FieldInvalid> {
        let dev = sb.sb().dev_idx();
        let member = sb
            .members()
            .and_then(|m| m.member(dev as usize))
            .ok_or(FieldInvalid::JournalNoMember(dev))?;
        let first = u64::from(member.first_bucket());
        let nbuckets = member.nbuckets();

        let mut seen = BTreeSet::new();
        for bucket in self.buckets() {
            if bucket < first || bucket >= nbuckets {
                return Err(FieldInvalid::JournalBucketRange {
                    bucket,
                    first,
                    nbuckets,
                });
            }
            if !seen.insert(bucket) {
                return Err(FieldInvalid::JournalDuplicateBucket(bucket));
            }
        }
        Ok(())
    }

    fn to_text(&self, out: &mut String) {
        out.push_str("Buckets:");
        for b in self.buckets() {
            let _ = write!(out, " {}", b);
        }
        out.push('\n');
    }
}

/// A decoded superblock field.
///
/// Field types without a typed representation are kept as raw bytes so
/// they survive a read-modify-write unchanged.
#[derive(Debug, Clone, Copy)]
pub enum SbField<'a> {
    /// Journal buckets
    Journal(JournalField<'a>),
    /// Member devices
    Members(MembersField<'a>),
    /// Encryption parameters
    Crypt(CryptField<'a>),
    /// Disk group labels
    DiskGroups(DiskGroupsField<'a>),
    /// Replicas entries
    Replicas(ReplicasField<'a>),
    /// Clean shutdown snapshot
    Clean(CleanField<'a>),
    /// Persistent counters
    Counters(CountersField<'a>),
    /// Anything else
    Unknown {
        /// Raw type tag
        ty: u32,
        /// Payload
        data: &'a [u8],
    },
}

impl<'a> SbField<'a> {
    /// Interpret the payload of a field with the given tag
    pub fn from_raw(ty: u32, data: &'a [u8]) -> SbField<'a> {
        match FieldType::from_u32(ty) {
            Some(FieldType::Journal) => SbField::Journal(JournalField { buf: data }),
            Some(FieldType::Members) => SbField::Members(MembersField::new(data)),
            Some(FieldType::Crypt) => SbField::Crypt(CryptField::new(data)),
            Some(FieldType::DiskGroups) => SbField::DiskGroups(DiskGroupsField::new(data)),
            Some(FieldType::Replicas) => SbField::Replicas(ReplicasField::new(data)),
            Some(FieldType::Clean) => SbField::Clean(CleanField::new(data)),
            Some(FieldType::Counters) => SbField::Counters(CountersField::new(data)),
            _ => SbField::Unknown { ty, data },
        }
    }

    /// Check the type specific invariants of this field
    pub fn validate(&self, sb: &SbHandle) -> std::result::Result<(), FieldInvalid> {
        match self {
            SbField::Journal(f) => f.validate(sb),
            SbField::Members(f) => f.validate(sb),
            SbField::Crypt(f) => f.validate(),
            SbField::DiskGroups(f) => f.validate(sb),
            SbField::Replicas(f) => f.validate(sb),
            SbField::Clean(f) => f.validate(),
            SbField::Counters(_) | SbField::Unknown { .. } => Ok(()),
        }
    }

    /// Describe the contents of this field
    pub fn to_text(&self, out: &mut String, sb: &SbHandle) {
        match self {
            SbField::Journal(f) => f.to_text(out),
            SbField::Members(f) => f.to_text(out, sb),
            SbField::Crypt(f) => f.to_text(out),
            SbField::DiskGroups(f) => f.to_text(out),
            SbField::Replicas(f) => f.to_text(out),
            SbField::Clean(f) => f.to_text(out),
            SbField::Counters(f) => f.to_text(out),
            SbField::Unknown { ty, data } => {
                let _ = writeln!(out, "(unknown field {}, {} bytes)", ty, data.len());
            }
        }
    }
}

/// Iterator over the fields of a superblock buffer
pub struct Fields<'a> {
    buf: &'a [u8],
    offset: usize,
    end: usize,
}

impl<'a> Iterator for Fields<'a> {
    type Item = FieldRef;

    fn next(&mut self) -> Option<FieldRef> {
        if self.offset >= self.end || self.offset + FIELD_HEADER_BYTES > self.buf.len() {
            return None;
        }
        let u64s = LittleEndian::read_u32(&self.buf[self.offset..]);
        let ty = LittleEndian::read_u32(&self.buf[self.offset + 4..]);
        let f = FieldRef {
            offset: self.offset,
            u64s,
            ty,
        };
        // a zero length field would loop forever; yield it once and stop
        self.offset = if u64s == 0 {
            self.end
        } else {
            self.offset + f.bytes()
        };
        Some(f)
    }
}

/// An owned superblock buffer, optionally tied to the device it lives on.
///
/// The buffer length is always a power of two and at least the header
/// size. Field accessors hand out offsets, never references, so growth of
/// the buffer can't leave anything dangling.
pub struct SbHandle {
    buf: Vec<u8>,
    dev: Option<Arc<dyn ByteDevice>>,
    pub(crate) have_layout: bool,
    pub(crate) seq: u64,
}

impl std::fmt::Debug for SbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SbHandle")
            .field("buffer_size", &self.buf.len())
            .field("dev", &self.dev.as_ref().map(|d| d.name().to_string()))
            .field("have_layout", &self.have_layout)
            .field("seq", &self.seq)
            .finish()
    }
}

impl SbHandle {
    /// A zeroed superblock buffer, sized for `dev` if given
    pub fn new(dev: Option<Arc<dyn ByteDevice>>) -> Result<SbHandle> {
        let mut sb = SbHandle {
            buf: Vec::new(),
            dev,
            have_layout: false,
            seq: 0,
        };
        sb.realloc(0)?;
        Ok(sb)
    }

    /// Copy a raw superblock image into a new handle
    pub fn from_bytes(bytes: &[u8]) -> Result<SbHandle> {
        let mut sb = SbHandle::new(None)?;
        let u64s = SuperBlock::new(bytes)?.u64s();
        sb.realloc(u64s)?;
        let len = bytes.len().min(sb.buf.len());
        sb.buf[..len].copy_from_slice(&bytes[..len]);
        Ok(sb)
    }

    /// The device this superblock was read from or will be written to
    pub fn device(&self) -> Option<&Arc<dyn ByteDevice>> {
        self.dev.as_ref()
    }

    /// Sequence number last read from or written to the device
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Whether the size limit of the layout applies to this buffer
    pub fn have_layout(&self) -> bool {
        self.have_layout
    }

    /// Size of the backing buffer
    pub fn buffer_size(&self) -> usize {
        self.buf.len()
    }

    /// View of the superblock
    pub fn sb(&self) -> SuperBlock<&[u8]> {
        SuperBlock::from_buf(&self.buf[..])
    }

    /// Mutable view of the superblock
    pub fn sb_mut(&mut self) -> SuperBlock<&mut [u8]> {
        SuperBlock::from_buf(&mut self.buf[..])
    }

    /// The whole backing buffer
    pub(crate) fn buffer(&self) -> &[u8] {
        &self.buf[..]
    }

    /// The whole backing buffer, mutably
    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..]
    }

    /// The bytes of the superblock, up to the end of the last field
    pub fn bytes(&self) -> &[u8] {
        let end = self.sb().vstruct_bytes().min(self.buf.len());
        &self.buf[..end]
    }

    /// Make sure the buffer can hold a superblock with `u64s` words of
    /// fields. Growing past the size reserved by the layout is refused
    /// once the layout is known.
    pub fn realloc(&mut self, u64s: u32) -> Result<()> {
        let mut new_bytes = SB_HEADER_BYTES + u64s as usize * 8;
        if let Some(dev) = &self.dev {
            new_bytes = new_bytes.max(dev.block_size() as usize);
        }
        let new_size = new_bytes.next_power_of_two();

        if !self.buf.is_empty() && self.buf.len() >= new_size {
            return Ok(());
        }

        if self.have_layout {
            let max = self.sb().layout().max_bytes();
            if new_bytes > max {
                return Err(BchError::SbTooBig {
                    want: new_bytes,
                    max,
                });
            }
        }

        let extra = new_size - self.buf.len();
        self.buf
            .try_reserve_exact(extra)
            .map_err(|_| BchError::NoMem)?;
        self.buf.resize(new_size, 0);
        debug!("superblock buffer grown to {} bytes", new_size);
        Ok(())
    }

    /// Iterate over every field, including unknown types
    pub fn fields(&self) -> Fields<'_> {
        Fields {
            buf: &self.buf,
            offset: SB_HEADER_BYTES,
            end: self.sb().vstruct_bytes().min(self.buf.len()),
        }
    }

    /// Find a field by raw tag
    pub fn field_get_raw(&self, ty: u32) -> Option<FieldRef> {
        self.fields().find(|f| f.ty == ty)
    }

    /// Find a field
    pub fn field_get(&self, ty: FieldType) -> Option<FieldRef> {
        self.field_get_raw(ty as u32)
    }

    /// Bytes of a field, header included
    pub fn field_bytes(&self, f: &FieldRef) -> &[u8] {
        let end = (f.offset + f.bytes()).min(self.buf.len());
        &self.buf[f.offset..end]
    }

    /// Bytes of a field after its header
    pub fn field_payload(&self, f: &FieldRef) -> &[u8] {
        &self.field_bytes(f)[FIELD_HEADER_BYTES.min(f.bytes())..]
    }

    /// Mutable bytes of a field after its header
    pub fn field_payload_mut(&mut self, f: &FieldRef) -> &mut [u8] {
        let end = (f.offset + f.bytes()).min(self.buf.len());
        let start = (f.offset + FIELD_HEADER_BYTES).min(end);
        &mut self.buf[start..end]
    }

    /// Decode a field
    pub fn field(&self, f: &FieldRef) -> SbField<'_> {
        SbField::from_raw(f.ty, self.field_payload(f))
    }

    /// Validate one field, wrapping failures with the field's description
    pub fn field_validate(&self, f: &FieldRef) -> std::result::Result<(), SbInvalid> {
        let field = match f.field_type() {
            Some(t) => t,
            None => return Ok(()),
        };
        self.field(f)
            .validate(self)
            .map_err(|err| SbInvalid::Field {
                field,
                err,
                text: self.field_text(f),
            })
    }

    /// Describe a field as text
    pub fn field_text(&self, f: &FieldRef) -> String {
        let mut out = String::new();
        self.field(f).to_text(&mut out, self);
        out
    }

    /// The members field, if present
    pub fn members(&self) -> Option<MembersField<'_>> {
        self.field_get(FieldType::Members)
            .map(|f| MembersField::new(self.field_payload(&f)))
    }

    /// The disk groups field, if present
    pub fn disk_groups(&self) -> Option<DiskGroupsField<'_>> {
        self.field_get(FieldType::DiskGroups)
            .map(|f| DiskGroupsField::new(self.field_payload(&f)))
    }

    /// The replicas field, if present
    pub fn replicas(&self) -> Option<ReplicasField<'_>> {
        self.field_get(FieldType::Replicas)
            .map(|f| ReplicasField::new(self.field_payload(&f)))
    }

    /// Mask of the device indices that have a member record
    pub fn member_mask(&self) -> DevMask {
        let nr = self.sb().nr_devices() as usize;
        let mut mask = DevMask::default();
        if let Some(members) = self.members() {
            for i in 0..nr {
                if members.member(i).map_or(false, |m| m.exists()) {
                    mask.set(i as u8);
                }
            }
        }
        mask
    }

    /// Resize a field within the current buffer.
    ///
    /// `u64s` counts the whole field including its header; zero deletes
    /// the field. Grown space is zeroed, the type tag is stamped and the
    /// superblock's total size is updated. The caller must have grown the
    /// buffer first.
    pub(crate) fn resize_in_place(&mut self, ty: u32, u64s: u32) -> Option<FieldRef> {
        let old = self.field_get_raw(ty);
        let old_u64s = old.map_or(0, |f| f.u64s);
        let sb_u64s = self.sb().u64s() + u64s - old_u64s;
        let sb_end = self.sb().vstruct_bytes();

        debug_assert!(SB_HEADER_BYTES + sb_u64s as usize * 8 <= self.buf.len());

        let offset = match old {
            None if u64s == 0 => return None,
            None => {
                let at = sb_end;
                for b in self.buf[at..at + u64s as usize * 8].iter_mut() {
                    *b = 0;
                }
                at
            }
            Some(f) => {
                let src = f.offset + f.bytes();
                let dst = f.offset + u64s as usize * 8;
                self.buf.copy_within(src..sb_end, dst);
                if dst > src {
                    for b in self.buf[src..dst].iter_mut() {
                        *b = 0;
                    }
                } else {
                    let new_end = sb_end - (src - dst);
                    for b in self.buf[new_end..sb_end].iter_mut() {
                        *b = 0;
                    }
                }
                f.offset
            }
        };

        self.sb_mut().set_u64s(sb_u64s);

        if u64s == 0 {
            return None;
        }
        LittleEndian::write_u32(&mut self.buf[offset..], u64s);
        LittleEndian::write_u32(&mut self.buf[offset + 4..], ty);
        Some(FieldRef { offset, u64s, ty })
    }

    /// Create, grow, shrink or delete (`u64s == 0`) a field of this buffer
    pub fn field_resize(&mut self, ty: FieldType, u64s: u32) -> Result<Option<FieldRef>> {
        let old_u64s = self.field_get(ty).map_or(0, |f| f.u64s);
        if u64s > old_u64s {
            self.realloc(self.sb().u64s() + u64s - old_u64s)?;
        }
        Ok(self.resize_in_place(ty as u32, u64s))
    }

    /// Remove a field; removing a field that doesn't exist does nothing
    pub fn field_delete(&mut self, ty: FieldType) {
        self.resize_in_place(ty as u32, 0);
    }

    /// Copy everything except per-device fields and the device specific
    /// header values from `src`.
    pub fn copy_from(&mut self, src: &SbHandle) -> Result<()> {
        {
            let s = src.sb();
            let mut d = self.sb_mut();
            d.set_version(s.version());
            d.set_version_min(s.version_min());
            d.set_seq(s.seq());
            d.set_uuid(s.uuid());
            d.set_user_uuid(s.user_uuid());
            d.set_label(s.label())?;
            d.set_block_size(s.block_size());
            d.set_nr_devices(s.nr_devices());
            d.set_time_base_lo(s.time_base_lo());
            d.set_time_base_hi(s.time_base_hi());
            d.set_time_precision(s.time_precision());
        }
        {
            use crate::super_block::sb_offsets::{COMPAT, FEATURES, FLAGS, MAGIC};
            for range in [MAGIC, FLAGS, FEATURES, COMPAT] {
                self.buf[range.clone()].copy_from_slice(&src.buf[range]);
            }
        }

        for ty in 0..FIELD_NR {
            if FieldType::from_u32(ty).map_or(false, |t| t.is_per_device()) {
                continue;
            }
            let src_f = src.field_get_raw(ty);
            let dst_u64s = self.field_get_raw(ty).map_or(0, |f| f.u64s);
            let want = src_f.map_or(0, |f| f.u64s);
            if want > dst_u64s {
                self.realloc(self.sb().u64s() + want - dst_u64s)?;
            }
            if let Some(dst_f) = self.resize_in_place(ty, want) {
                if let Some(src_f) = src_f {
                    let bytes = src.field_bytes(&src_f);
                    self.buf[dst_f.offset..dst_f.offset + bytes.len()].copy_from_slice(bytes);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::layout::Layout;
    use crate::super_block::{BCHFS_MAGIC, SB_SECTOR};

    pub(crate) fn blank() -> SbHandle {
        let mut sb = SbHandle::new(None).unwrap();
        sb.sb_mut().set_magic(BCHFS_MAGIC);
        let layout = Layout::init(512, 16, SB_SECTOR, 1 << 16).unwrap();
        layout.write_to(&mut sb.sb_mut().layout_mut()).unwrap();
        sb
    }

    fn fill(sb: &mut SbHandle, f: &FieldRef, byte: u8) {
        for b in sb.field_payload_mut(f).iter_mut() {
            *b = byte;
        }
    }

    #[test]
    fn create_grow_shrink_delete() {
        let mut sb = blank();
        let a = sb.field_resize(FieldType::Members, 3).unwrap().unwrap();
        fill(&mut sb, &a, 0xaa);
        let c = sb.field_resize(FieldType::Clean, 4).unwrap().unwrap();
        fill(&mut sb, &c, 0xcc);
        assert_eq!(sb.sb().u64s(), 7);
        assert_eq!(c.offset, SB_HEADER_BYTES + 24);

        // growing the first field shifts the second and zeroes the new space
        let a = sb.field_resize(FieldType::Members, 5).unwrap().unwrap();
        assert_eq!(sb.sb().u64s(), 9);
        let payload = sb.field_payload(&a).to_vec();
        assert_eq!(&payload[..16], &[0xaa; 16][..]);
        assert_eq!(&payload[16..], &[0u8; 16][..]);
        let c = sb.field_get(FieldType::Clean).unwrap();
        assert_eq!(c.offset, SB_HEADER_BYTES + 40);
        assert!(sb.field_payload(&c).iter().all(|b| *b == 0xcc));

        sb.field_delete(FieldType::Members);
        assert_eq!(sb.sb().u64s(), 4);
        let c = sb.field_get(FieldType::Clean).unwrap();
        assert_eq!(c.offset, SB_HEADER_BYTES);
        assert!(sb.field_payload(&c).iter().all(|b| *b == 0xcc));
        assert!(sb.field_get(FieldType::Members).is_none());
    }

    #[test]
    fn resize_idempotence() {
        let mut sb = blank();
        let a = sb.field_resize(FieldType::Replicas, 4).unwrap().unwrap();
        fill(&mut sb, &a, 0x5a);
        sb.field_resize(FieldType::DiskGroups, 7).unwrap();

        let before = sb.bytes().to_vec();
        sb.field_resize(FieldType::Replicas, 4).unwrap();
        assert_eq!(sb.bytes(), &before[..]);

        sb.field_delete(FieldType::Crypt);
        assert_eq!(sb.bytes(), &before[..]);

        // payload survives a round trip through a larger size
        sb.field_resize(FieldType::Replicas, 9).unwrap();
        sb.field_resize(FieldType::Replicas, 4).unwrap();
        assert_eq!(sb.bytes(), &before[..]);
    }

    #[test]
    fn growth_is_bounded_by_layout() {
        let mut sb = blank();
        sb.have_layout = true;
        // 16 sectors per copy
        assert!(sb.field_resize(FieldType::Members, 900).is_ok());
        assert!(matches!(
            sb.field_resize(FieldType::Members, 2000),
            Err(BchError::SbTooBig { .. })
        ));
        assert_eq!(sb.field_get(FieldType::Members).unwrap().u64s, 900);
        assert!(sb.buffer_size().is_power_of_two());
    }

    #[test]
    fn copy_skips_per_device_fields() {
        let mut src = blank();
        let j = src.field_resize(FieldType::Journal, 2).unwrap().unwrap();
        fill(&mut src, &j, 1);
        let m = src.field_resize(FieldType::Members, 3).unwrap().unwrap();
        fill(&mut src, &m, 2);
        src.sb_mut().set_seq(42);

        let mut dst = blank();
        let j = dst.field_resize(FieldType::Journal, 4).unwrap().unwrap();
        fill(&mut dst, &j, 9);

        dst.copy_from(&src).unwrap();
        assert_eq!(dst.sb().seq(), 42);
        let j = dst.field_get(FieldType::Journal).unwrap();
        assert_eq!(j.u64s, 4);
        assert!(dst.field_payload(&j).iter().all(|b| *b == 9));
        let m = dst.field_get(FieldType::Members).unwrap();
        assert_eq!(dst.field_bytes(&m), src.field_bytes(&src.field_get(FieldType::Members).unwrap()));
    }

    #[test]
    fn unknown_fields_are_opaque() {
        let mut sb = blank();
        sb.realloc(sb.sb().u64s() + 2).unwrap();
        let f = sb.resize_in_place(FIELD_NR + 3, 2).unwrap();
        fill(&mut sb, &f, 7);
        match sb.field(&f) {
            SbField::Unknown { ty, data } => {
                assert_eq!(ty, FIELD_NR + 3);
                assert_eq!(data, &[7u8; 8][..]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(sb.field_validate(&f).is_ok());
    }
}
