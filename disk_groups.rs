//! Disk group (device label) section and its in-memory table.

use std::collections::BTreeMap;
use std::fmt::Write;
use std::ops::Range;

use crate::fields::SbHandle;
use crate::fs::DevMask;
use crate::members::MemberFlag;
use crate::super_block::{bitflags_to_text, get_bits, DATA_TYPE_NAMES};
use crate::validate::FieldInvalid;

/// Size of one on-disk disk group entry
pub const DISK_GROUP_BYTES: usize = 48;
const LABEL_BYTES: usize = 32;

const DELETED: Range<u64> = 0..1;
const DATA_ALLOWED: Range<u64> = 1..6;
const PARENT: Range<u64> = 6..24;

/// One on-disk disk group entry
#[derive(Debug, Clone, Copy)]
pub struct DiskGroup<'a> {
    buf: &'a [u8],
}

impl<'a> DiskGroup<'a> {
    /// Label, up to the first nul byte
    pub fn label(&self) -> String {
        let raw = &self.buf[..LABEL_BYTES];
        let len = raw.iter().position(|b| *b == 0).unwrap_or(LABEL_BYTES);
        String::from_utf8_lossy(&raw[..len]).into_owned()
    }

    fn label_bytes(&self) -> &'a [u8] {
        let raw = &self.buf[..LABEL_BYTES];
        let len = raw.iter().position(|b| *b == 0).unwrap_or(LABEL_BYTES);
        &raw[..len]
    }

    fn flag(&self, bits: &Range<u64>) -> u64 {
        get_bits(&self.buf[LABEL_BYTES..], 0, bits)
    }

    /// The entry has been deleted
    pub fn deleted(&self) -> bool {
        self.flag(&DELETED) != 0
    }

    /// Data types allowed on devices of this group
    pub fn data_allowed(&self) -> u64 {
        self.flag(&DATA_ALLOWED)
    }

    /// Parent group plus one, zero for a top level group
    pub fn parent(&self) -> u64 {
        self.flag(&PARENT)
    }
}

/// The disk groups section
#[derive(Debug, Clone, Copy)]
pub struct DiskGroupsField<'a> {
    buf: &'a [u8],
}

impl<'a> DiskGroupsField<'a> {
    /// View a disk groups section payload
    pub fn new(buf: &'a [u8]) -> DiskGroupsField<'a> {
        DiskGroupsField { buf }
    }

    /// Number of entries
    pub fn nr(&self) -> usize {
        self.buf.len() / DISK_GROUP_BYTES
    }

    /// Entry `idx`
    pub fn entry(&self, idx: usize) -> Option<DiskGroup<'a>> {
        let start = idx.checked_mul(DISK_GROUP_BYTES)?;
        self.buf
            .get(start..start + DISK_GROUP_BYTES)
            .map(|buf| DiskGroup { buf })
    }

    /// All entries, deleted ones included
    pub fn entries(&self) -> impl Iterator<Item = DiskGroup<'a>> + 'a {
        self.buf
            .chunks_exact(DISK_GROUP_BYTES)
            .map(|buf| DiskGroup { buf })
    }

    pub(crate) fn validate(&self, sb: &SbHandle) -> std::result::Result<(), FieldInvalid> {
        let nr = self.nr();

        if let Some(members) = sb.members() {
            for dev in 0..sb.sb().nr_devices() as usize {
                let m = match members.member(dev) {
                    Some(m) if m.exists() => m,
                    _ => continue,
                };
                let group = m.flag(&MemberFlag::GROUP);
                if group == 0 {
                    continue;
                }
                let g = group - 1;
                match self.entry(g as usize) {
                    None => return Err(FieldInvalid::GroupMissing { dev, group: g, nr }),
                    Some(e) if e.deleted() => {
                        return Err(FieldInvalid::GroupDeleted { dev, group: g })
                    }
                    Some(_) => {}
                }
            }
        }

        let mut seen: BTreeMap<(u64, &[u8]), usize> = BTreeMap::new();
        for (i, g) in self.entries().enumerate() {
            if g.deleted() {
                continue;
            }
            if g.label_bytes().is_empty() {
                return Err(FieldInvalid::GroupLabelEmpty(i));
            }
            if let Some(prev) = seen.insert((g.parent(), g.label_bytes()), i) {
                return Err(FieldInvalid::GroupDuplicate { a: prev, b: i });
            }
        }

        Ok(())
    }

    pub(crate) fn to_text(&self, out: &mut String) {
        for (i, g) in self.entries().enumerate() {
            let _ = write!(out, "{}: label={}", i, g.label());
            if g.deleted() {
                out.push_str(" (deleted)");
            }
            if g.parent() != 0 {
                let _ = write!(out, " parent={}", g.parent() - 1);
            }
            if g.data_allowed() != 0 {
                let _ = write!(
                    out,
                    " data_allowed={}",
                    bitflags_to_text(&DATA_TYPE_NAMES, g.data_allowed())
                );
            }
            out.push('\n');
        }
    }
}

/// In-memory copy of one disk group
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskGroupCpu {
    /// Label
    pub label: String,
    /// The entry has been deleted
    pub deleted: bool,
    /// Data types allowed, including those of its member devices
    pub data_allowed: u64,
    /// Parent group plus one
    pub parent: u64,
    /// Devices in this group
    pub devs: DevMask,
}

/// In-memory disk group table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskGroupsCpu {
    /// Entries, indexed like the on-disk section
    pub entries: Vec<DiskGroupCpu>,
}

impl DiskGroupsCpu {
    /// Build the table from a superblock, folding in the member devices
    pub fn from_sb(sb: &SbHandle) -> DiskGroupsCpu {
        let groups = match sb.disk_groups() {
            Some(g) => g,
            None => return DiskGroupsCpu::default(),
        };

        let mut entries: Vec<DiskGroupCpu> = groups
            .entries()
            .map(|g| DiskGroupCpu {
                label: g.label(),
                deleted: g.deleted(),
                data_allowed: g.data_allowed(),
                parent: g.parent(),
                devs: DevMask::default(),
            })
            .collect();

        if let Some(members) = sb.members() {
            for dev in 0..sb.sb().nr_devices() as usize {
                let m = match members.member(dev) {
                    Some(m) if m.exists() => m,
                    _ => continue,
                };
                let group = m.flag(&MemberFlag::GROUP);
                if group == 0 {
                    continue;
                }
                if let Some(e) = entries.get_mut(group as usize - 1) {
                    e.devs.set(dev as u8);
                    e.data_allowed |= m.flag(&MemberFlag::DATA_ALLOWED);
                }
            }
        }

        DiskGroupsCpu { entries }
    }

    /// Index of the live top level group with the given label
    pub fn find(&self, label: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| !e.deleted && e.parent == 0 && e.label == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::tests::blank;
    use crate::fields::FieldType;
    use crate::members::MEMBER_BYTES;
    use crate::validate::SbInvalid;
    use uuid::Uuid;

    fn entry(label: &str, deleted: bool, parent: u64) -> [u8; DISK_GROUP_BYTES] {
        let mut e = [0u8; DISK_GROUP_BYTES];
        e[..label.len()].copy_from_slice(label.as_bytes());
        let flags = (deleted as u64) | (0b10000 << 1) | (parent << 6);
        e[32..40].copy_from_slice(&flags.to_le_bytes());
        e
    }

    fn sb_with(groups: &[[u8; DISK_GROUP_BYTES]], member_group: u64) -> SbHandle {
        let mut sb = blank();
        sb.sb_mut().set_nr_devices(1);
        sb.field_resize(FieldType::Members, 1 + (MEMBER_BYTES / 8) as u32)
            .unwrap();
        {
            let mut m = sb.member_mut(0).unwrap();
            m.set_uuid(Uuid::new_v4());
            m.set_flag(&MemberFlag::GROUP, member_group).unwrap();
            m.set_flag(&MemberFlag::DATA_ALLOWED, 0b1000).unwrap();
        }
        let u64s = 1 + (groups.len() * DISK_GROUP_BYTES / 8) as u32;
        let f = sb.field_resize(FieldType::DiskGroups, u64s).unwrap().unwrap();
        for (i, g) in groups.iter().enumerate() {
            sb.field_payload_mut(&f)[i * DISK_GROUP_BYTES..(i + 1) * DISK_GROUP_BYTES]
                .copy_from_slice(g);
        }
        sb
    }

    fn check(sb: &SbHandle) -> std::result::Result<(), FieldInvalid> {
        let f = sb.field_get(FieldType::DiskGroups).unwrap();
        match sb.field_validate(&f) {
            Ok(()) => Ok(()),
            Err(SbInvalid::Field { err, .. }) => Err(err),
            Err(e) => panic!("unexpected {:?}", e),
        }
    }

    #[test]
    fn valid_groups_to_cpu() {
        let sb = sb_with(&[entry("ssd", false, 0), entry("hdd", false, 0)], 2);
        check(&sb).unwrap();

        let cpu = DiskGroupsCpu::from_sb(&sb);
        assert_eq!(cpu.entries.len(), 2);
        assert_eq!(cpu.find("hdd"), Some(1));
        assert!(cpu.entries[1].devs.test(0));
        assert_eq!(cpu.entries[1].data_allowed, 0b10000 | 0b1000);
        assert!(cpu.entries[0].devs.is_empty());
    }

    #[test]
    fn member_references() {
        let sb = sb_with(&[entry("ssd", false, 0)], 3);
        assert_eq!(
            check(&sb),
            Err(FieldInvalid::GroupMissing {
                dev: 0,
                group: 2,
                nr: 1
            })
        );

        let sb = sb_with(&[entry("ssd", true, 0)], 1);
        assert_eq!(
            check(&sb),
            Err(FieldInvalid::GroupDeleted { dev: 0, group: 0 })
        );
    }

    #[test]
    fn labels() {
        let sb = sb_with(&[entry("", false, 0)], 0);
        assert_eq!(check(&sb), Err(FieldInvalid::GroupLabelEmpty(0)));

        let sb = sb_with(&[entry("a", false, 0), entry("a", false, 0)], 0);
        assert_eq!(check(&sb), Err(FieldInvalid::GroupDuplicate { a: 0, b: 1 }));

        // same label under different parents, or deleted, is fine
        let sb = sb_with(
            &[
                entry("a", false, 0),
                entry("a", false, 1),
                entry("a", true, 0),
            ],
            0,
        );
        check(&sb).unwrap();
    }
}
