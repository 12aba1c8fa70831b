use std::fmt::Write;
use std::ops::Range;

use crate::fields::{FieldType, SbHandle};
use crate::super_block::{
    bitflags_to_text, get_bits, set_bits, SuperBlockFlag, DATA_TYPE_NAMES, MIN_NR_NBUCKETS,
};
use crate::text::human_bytes;
use crate::validate::FieldInvalid;
use crate::Result;

use byteorder::{ByteOrder, LittleEndian};
use uuid::Uuid;

/// Size of one on-disk member record
pub const MEMBER_BYTES: usize = 56;

mod member_offsets {
    use std::ops::Range;

    pub const UUID: Range<usize> = 0..16;
    pub const NBUCKETS: Range<usize> = 16..24;
    pub const FIRST_BUCKET: Range<usize> = 24..26;
    pub const BUCKET_SIZE: Range<usize> = 26..28;
    // 4 bytes of padding
    pub const LAST_MOUNT: Range<usize> = 32..40;
    pub const FLAGS: Range<usize> = 40..56;
}

/// A member flag bitmask
#[derive(Debug)]
pub struct MemberFlag(pub usize, pub Range<u64>);

impl MemberFlag {
    /// Bitmask for the state of the member device
    pub const STATE: MemberFlag = MemberFlag(0, 0..4);
    /// Bitmask for replacement type for member device
    pub const REPLACEMENT: MemberFlag = MemberFlag(0, 10..14);
    /// Issue discards to this device
    pub const DISCARD: MemberFlag = MemberFlag(0, 14..15);
    /// Bitmask for types of data allowed on the member device
    pub const DATA_ALLOWED: MemberFlag = MemberFlag(0, 15..20);
    /// Disk group of the member device, plus one; zero for none
    pub const GROUP: MemberFlag = MemberFlag(0, 20..28);
    /// Bitmask for durability of the member device
    pub const DURABILITY: MemberFlag = MemberFlag(0, 28..30);
    /// The free space btree has been initialised for this device
    pub const FREESPACE_INITIALIZED: MemberFlag = MemberFlag(0, 30..31);
}

/// State of a member device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemberState {
    /// In use, read write
    Rw = 0,
    /// In use, read only
    Ro = 1,
    /// Failed, its data is considered lost
    Failed = 2,
    /// Hot spare
    Spare = 3,
}

impl MemberState {
    /// Decode a member state
    pub fn from_u64(v: u64) -> Option<MemberState> {
        match v {
            0 => Some(MemberState::Rw),
            1 => Some(MemberState::Ro),
            2 => Some(MemberState::Failed),
            3 => Some(MemberState::Spare),
            _ => None,
        }
    }

    /// Name of the state
    pub fn name(self) -> &'static str {
        match self {
            MemberState::Rw => "rw",
            MemberState::Ro => "ro",
            MemberState::Failed => "failed",
            MemberState::Spare => "spare",
        }
    }
}

/// A member record
pub struct Member<T> {
    buffer: T,
}

impl<T: AsRef<[u8]>> Member<T> {
    /// Create a member view for the given bytes
    pub fn new(buf: T) -> Option<Member<T>> {
        if buf.as_ref().len() < MEMBER_BYTES {
            None
        } else {
            Some(Member { buffer: buf })
        }
    }

    /// UUID of the device, nil if the slot is unused
    pub fn uuid(&self) -> Uuid {
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&self.buffer.as_ref()[member_offsets::UUID]);
        Uuid::from_bytes(bytes)
    }

    /// A member exists if its uuid is set
    pub fn exists(&self) -> bool {
        !self.uuid().is_nil()
    }

    /// Number of buckets
    pub fn nbuckets(&self) -> u64 {
        LittleEndian::read_u64(&self.buffer.as_ref()[member_offsets::NBUCKETS])
    }

    /// First bucket usable for data
    pub fn first_bucket(&self) -> u16 {
        LittleEndian::read_u16(&self.buffer.as_ref()[member_offsets::FIRST_BUCKET])
    }

    /// Bucket size in sectors
    pub fn bucket_size(&self) -> u16 {
        LittleEndian::read_u16(&self.buffer.as_ref()[member_offsets::BUCKET_SIZE])
    }

    /// Seconds since the epoch of the last mount, zero if never mounted
    pub fn last_mount(&self) -> u64 {
        LittleEndian::read_u64(&self.buffer.as_ref()[member_offsets::LAST_MOUNT])
    }

    /// Value of a flag
    pub fn flag(&self, flag: &MemberFlag) -> u64 {
        get_bits(&self.buffer.as_ref()[member_offsets::FLAGS], flag.0, &flag.1)
    }

    /// Decoded state, `None` if the stored value is unknown
    pub fn state(&self) -> Option<MemberState> {
        MemberState::from_u64(self.flag(&MemberFlag::STATE))
    }
}

impl<T: AsMut<[u8]>> Member<T> {
    /// Set the uuid for this member device
    pub fn set_uuid(&mut self, uuid: Uuid) {
        self.buffer.as_mut()[member_offsets::UUID].copy_from_slice(uuid.as_bytes());
    }

    /// Set the number of buckets
    pub fn set_nbuckets(&mut self, val: u64) {
        LittleEndian::write_u64(&mut self.buffer.as_mut()[member_offsets::NBUCKETS], val);
    }

    /// Set the first usable bucket
    pub fn set_first_bucket(&mut self, val: u16) {
        LittleEndian::write_u16(&mut self.buffer.as_mut()[member_offsets::FIRST_BUCKET], val);
    }

    /// Set the bucket size in sectors
    pub fn set_bucket_size(&mut self, val: u16) {
        LittleEndian::write_u16(&mut self.buffer.as_mut()[member_offsets::BUCKET_SIZE], val);
    }

    /// Set the last mount time
    pub fn set_last_mount(&mut self, val: u64) {
        LittleEndian::write_u64(&mut self.buffer.as_mut()[member_offsets::LAST_MOUNT], val);
    }

    /// Set the given flag to the given value
    pub fn set_flag(&mut self, flag: &MemberFlag, val: u64) -> Result<()> {
        set_bits(
            &mut self.buffer.as_mut()[member_offsets::FLAGS],
            flag.0,
            &flag.1,
            val,
        )
    }

    /// Set the member state
    pub fn set_state(&mut self, state: MemberState) {
        // every state fits the four bit field
        let _ = self.set_flag(&MemberFlag::STATE, state as u64);
    }
}

/// The members section
#[derive(Debug, Clone, Copy)]
pub struct MembersField<'a> {
    buf: &'a [u8],
}

impl<'a> MembersField<'a> {
    /// View a members section payload
    pub fn new(buf: &'a [u8]) -> MembersField<'a> {
        MembersField { buf }
    }

    /// Number of records the section has room for
    pub fn nr(&self) -> usize {
        self.buf.len() / MEMBER_BYTES
    }

    /// The record for device `idx`, whether or not it exists
    pub fn member(&self, idx: usize) -> Option<Member<&'a [u8]>> {
        let start = idx.checked_mul(MEMBER_BYTES)?;
        self.buf.get(start..start + MEMBER_BYTES).and_then(Member::new)
    }

    pub(crate) fn validate(&self, sb: &SbHandle) -> std::result::Result<(), FieldInvalid> {
        let s = sb.sb();
        let nr_devices = s.nr_devices() as usize;
        if self.nr() < nr_devices {
            return Err(FieldInvalid::TooManyDevices);
        }

        let block_size = s.block_size();
        let btree_node_size = s.flag(&SuperBlockFlag::BTREE_NODE_SIZE);

        for dev in 0..nr_devices {
            let m = match self.member(dev) {
                Some(m) if m.exists() => m,
                _ => continue,
            };

            if m.nbuckets() > i64::MAX as u64 {
                return Err(FieldInvalid::TooManyBuckets {
                    dev,
                    got: m.nbuckets(),
                });
            }

            let usable = m.nbuckets().saturating_sub(u64::from(m.first_bucket()));
            if usable < MIN_NR_NBUCKETS {
                return Err(FieldInvalid::NotEnoughBuckets {
                    dev,
                    got: usable,
                    min: MIN_NR_NBUCKETS,
                });
            }

            if m.bucket_size() < block_size {
                return Err(FieldInvalid::BucketSmallerThanBlock {
                    dev,
                    bucket_size: m.bucket_size(),
                    block_size,
                });
            }

            if u64::from(m.bucket_size()) < btree_node_size {
                return Err(FieldInvalid::BucketSmallerThanBtreeNode {
                    dev,
                    bucket_size: m.bucket_size(),
                    btree_node_size,
                });
            }
        }

        Ok(())
    }

    pub(crate) fn to_text(&self, out: &mut String, sb: &SbHandle) {
        let groups = sb.disk_groups();
        let replicas = sb.replicas();

        for dev in 0..sb.sb().nr_devices() as usize {
            let m = match self.member(dev) {
                Some(m) if m.exists() => m,
                _ => continue,
            };
            let bucket_size = u64::from(m.bucket_size());

            let _ = writeln!(out, "Device:                 {}", dev);
            let _ = writeln!(out, "  UUID:                 {}", m.uuid());
            let _ = writeln!(
                out,
                "  Size:                 {}",
                human_bytes(m.nbuckets().saturating_mul(bucket_size) << 9)
            );
            let _ = writeln!(out, "  Bucket size:          {}", human_bytes(bucket_size << 9));
            let _ = writeln!(out, "  First bucket:         {}", m.first_bucket());
            let _ = writeln!(out, "  Buckets:              {}", m.nbuckets());
            if m.last_mount() != 0 {
                let _ = writeln!(out, "  Last mount:           {}", m.last_mount());
            } else {
                let _ = writeln!(out, "  Last mount:           (never)");
            }
            let _ = writeln!(
                out,
                "  State:                {}",
                m.state().map_or("unknown", MemberState::name)
            );

            let group = m.flag(&MemberFlag::GROUP);
            if group == 0 {
                let _ = writeln!(out, "  Label:                (none)");
            } else {
                let idx = (group - 1) as usize;
                match groups.as_ref().and_then(|g| g.entry(idx)) {
                    Some(g) => {
                        let _ = writeln!(out, "  Label:                {} ({})", g.label(), idx);
                    }
                    None => {
                        let _ = writeln!(out, "  Label:                (bad disk labels section)");
                    }
                }
            }

            let allowed = m.flag(&MemberFlag::DATA_ALLOWED);
            let _ = writeln!(
                out,
                "  Data allowed:         {}",
                if allowed != 0 {
                    bitflags_to_text(&DATA_TYPE_NAMES, allowed)
                } else {
                    "(none)".to_string()
                }
            );

            let has = replicas.as_ref().map_or(0, |r| r.dev_has_data(dev as u8));
            let _ = writeln!(
                out,
                "  Has data:             {}",
                if has != 0 {
                    bitflags_to_text(&DATA_TYPE_NAMES, has)
                } else {
                    "(none)".to_string()
                }
            );
            let _ = writeln!(
                out,
                "  Discard:              {}",
                m.flag(&MemberFlag::DISCARD)
            );
            let _ = writeln!(
                out,
                "  Freespace initialized: {}",
                m.flag(&MemberFlag::FREESPACE_INITIALIZED)
            );
        }
    }
}

impl SbHandle {
    /// Mutable view of the member record for device `idx`
    pub fn member_mut(&mut self, idx: usize) -> Option<Member<&mut [u8]>> {
        let f = self.field_get(FieldType::Members)?;
        let payload = self.field_payload_mut(&f);
        let start = idx.checked_mul(MEMBER_BYTES)?;
        payload.get_mut(start..start + MEMBER_BYTES).and_then(Member::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::tests::blank;
    use crate::validate::SbInvalid;

    fn with_member(nbuckets: u64, first_bucket: u16, bucket_size: u16) -> SbHandle {
        let mut sb = blank();
        {
            let mut s = sb.sb_mut();
            s.set_nr_devices(1);
            s.set_block_size(8);
            s.set_flag(&SuperBlockFlag::BTREE_NODE_SIZE, 16).unwrap();
        }
        sb.field_resize(FieldType::Members, 1 + (MEMBER_BYTES / 8) as u32)
            .unwrap();
        let mut m = sb.member_mut(0).unwrap();
        m.set_uuid(Uuid::new_v4());
        m.set_nbuckets(nbuckets);
        m.set_first_bucket(first_bucket);
        m.set_bucket_size(bucket_size);
        m.set_state(MemberState::Rw);
        sb
    }

    fn check(sb: &SbHandle) -> std::result::Result<(), FieldInvalid> {
        let f = sb.field_get(FieldType::Members).unwrap();
        match sb.field_validate(&f) {
            Ok(()) => Ok(()),
            Err(SbInvalid::Field { err, .. }) => Err(err),
            Err(e) => panic!("unexpected {:?}", e),
        }
    }

    #[test]
    fn valid_member() {
        let sb = with_member(1024, 1, 128);
        check(&sb).unwrap();
        let members = sb.members().unwrap();
        let m = members.member(0).unwrap();
        assert!(m.exists());
        assert_eq!(m.state(), Some(MemberState::Rw));
        assert_eq!(sb.member_mask().nr(), 1);
    }

    #[test]
    fn not_enough_buckets() {
        let sb = with_member(MIN_NR_NBUCKETS + 3, 4, 128);
        assert_eq!(
            check(&sb),
            Err(FieldInvalid::NotEnoughBuckets {
                dev: 0,
                got: MIN_NR_NBUCKETS - 1,
                min: MIN_NR_NBUCKETS,
            })
        );
    }

    #[test]
    fn bucket_smaller_than_block() {
        let sb = with_member(1024, 0, 4);
        assert_eq!(
            check(&sb),
            Err(FieldInvalid::BucketSmallerThanBlock {
                dev: 0,
                bucket_size: 4,
                block_size: 8,
            })
        );
    }

    #[test]
    fn bucket_smaller_than_btree_node() {
        let sb = with_member(1024, 0, 8);
        assert_eq!(
            check(&sb),
            Err(FieldInvalid::BucketSmallerThanBtreeNode {
                dev: 0,
                bucket_size: 8,
                btree_node_size: 16,
            })
        );
    }

    #[test]
    fn section_too_small() {
        let mut sb = with_member(1024, 0, 128);
        sb.sb_mut().set_nr_devices(2);
        assert_eq!(check(&sb), Err(FieldInvalid::TooManyDevices));
    }

    #[test]
    fn absent_members_are_skipped() {
        let mut sb = with_member(1024, 0, 128);
        sb.member_mut(0).unwrap().set_uuid(Uuid::nil());
        sb.member_mut(0).unwrap().set_nbuckets(0);
        check(&sb).unwrap();
        assert_eq!(sb.member_mask().nr(), 0);
    }

    #[test]
    fn render() {
        let sb = with_member(1024, 1, 128);
        let f = sb.field_get(FieldType::Members).unwrap();
        let text = sb.field_text(&f);
        assert!(text.contains("Device:                 0"));
        assert!(text.contains("Bucket size:          64.0 KiB"));
        assert!(text.contains("State:                rw"));
        assert!(text.contains("Last mount:           (never)"));
    }
}
