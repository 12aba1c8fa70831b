//! Placement of the redundant superblock copies on one device.

use crate::super_block::{
    is_magic, SuperBlockLayout, BCHFS_MAGIC, LAYOUT_BYTES, LAYOUT_MAX_SUPERBLOCKS, SB_SECTOR,
};
use crate::validate::SbInvalid;
use crate::{BchError, Result};

use log::debug;
use uuid::Uuid;

/// Owned copy of a superblock layout descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Magic value, one of the two recognised superblock magics
    pub magic: Uuid,
    /// Layout type, must be zero
    pub layout_type: u8,
    /// log2 of the size reserved for each copy, in sectors
    pub sb_max_size_bits: u8,
    /// Sector offset of every copy, in the order they are tried
    pub offsets: Vec<u64>,
}

fn round_up(v: u64, to: u64) -> u64 {
    if to <= 1 {
        v
    } else {
        (v + to - 1) / to * to
    }
}

fn round_down(v: u64, to: u64) -> u64 {
    if to <= 1 {
        v
    } else {
        v / to * to
    }
}

impl Layout {
    /// Build a layout holding two copies within `sb_start..sb_end`.
    ///
    /// `block_size` is in bytes and `sb_size` in sectors; `sb_size` must be a
    /// power of two. The first copy stays at `sb_start` when that is the
    /// default superblock sector, otherwise every copy is aligned to the
    /// block size.
    pub fn init(block_size: u64, sb_size: u64, sb_start: u64, sb_end: u64) -> Result<Layout> {
        if sb_size == 0 || !sb_size.is_power_of_two() {
            return Err(BchError::Einval(format!(
                "superblock size {} is not a power of two",
                sb_size
            )));
        }

        let mut sb_pos = sb_start;
        let mut offsets = Vec::with_capacity(2);

        for _ in 0..2 {
            if sb_pos != SB_SECTOR {
                sb_pos = round_up(sb_pos, block_size >> 9);
            }
            offsets.push(sb_pos);
            sb_pos += sb_size;
        }

        if sb_pos > sb_end {
            return Err(BchError::Str(format!(
                "insufficient space for superblocks: start {} end {} > {} size {}",
                sb_start, sb_pos, sb_end, sb_size
            )));
        }

        debug!("superblock layout offsets={:?} size={}", offsets, sb_size);

        Ok(Layout {
            magic: BCHFS_MAGIC,
            layout_type: 0,
            sb_max_size_bits: sb_size.trailing_zeros() as u8,
            offsets,
        })
    }

    /// Append a backup copy near the end of a device of `device_sectors`
    /// sectors, aligned down to `bucket_sectors`.
    pub fn add_backup(&mut self, device_sectors: u64, bucket_sectors: u64) -> Result<u64> {
        if self.offsets.len() >= LAYOUT_MAX_SUPERBLOCKS {
            return Err(BchError::Exhausted);
        }
        let backup = device_sectors
            .checked_sub(self.sb_max_sectors())
            .ok_or(BchError::Exhausted)?;
        let backup = round_down(backup, bucket_sectors);
        self.offsets.push(backup);
        Ok(backup)
    }

    /// Sectors reserved for each copy
    pub fn sb_max_sectors(&self) -> u64 {
        1u64 << self.sb_max_size_bits.min(63)
    }

    /// Bytes reserved for each copy
    pub fn max_bytes(&self) -> usize {
        512usize << self.sb_max_size_bits.min(31)
    }

    /// Check the layout invariants: magic, type, copy count and no overlap
    pub fn validate(&self) -> std::result::Result<(), SbInvalid> {
        if !is_magic(&self.magic) {
            return Err(SbInvalid::LayoutMagic);
        }

        if self.layout_type != 0 {
            return Err(SbInvalid::LayoutType(self.layout_type));
        }

        if self.offsets.is_empty() {
            return Err(SbInvalid::LayoutNoSuperblocks);
        }

        if self.offsets.len() > LAYOUT_MAX_SUPERBLOCKS {
            return Err(SbInvalid::LayoutTooManySuperblocks(self.offsets.len()));
        }

        let max_sectors = self.sb_max_sectors();
        for (i, pair) in self.offsets.windows(2).enumerate() {
            let prev_end = pair[0].saturating_add(max_sectors);
            if pair[1] < prev_end {
                return Err(SbInvalid::LayoutOverlap {
                    idx: i,
                    prev_end,
                    next: pair[1],
                });
            }
        }

        Ok(())
    }

    /// Decode a layout descriptor.
    ///
    /// A copy count larger than the descriptor can hold is kept as is so that
    /// `validate` reports it; only the offsets that fit are decoded.
    pub fn from_view<T: AsRef<[u8]>>(view: &SuperBlockLayout<T>) -> Layout {
        let nr = view.nr_superblocks() as usize;
        let mut offsets: Vec<u64> = (0..nr.min(LAYOUT_MAX_SUPERBLOCKS))
            .map(|i| view.sb_offset(i))
            .collect();
        if nr > LAYOUT_MAX_SUPERBLOCKS {
            offsets.resize(nr, u64::MAX);
        }
        Layout {
            magic: view.magic(),
            layout_type: view.layout_type(),
            sb_max_size_bits: view.sb_max_size_bits(),
            offsets,
        }
    }

    /// Decode a layout descriptor from raw bytes
    pub fn from_bytes(buf: &[u8]) -> Result<Layout> {
        Ok(Layout::from_view(&SuperBlockLayout::new(buf)?))
    }

    /// Encode this layout into a descriptor view
    pub fn write_to<T: AsMut<[u8]>>(&self, view: &mut SuperBlockLayout<T>) -> Result<()> {
        if self.offsets.len() > LAYOUT_MAX_SUPERBLOCKS {
            return Err(BchError::Exhausted);
        }
        for b in view.as_mut()[..LAYOUT_BYTES].iter_mut() {
            *b = 0;
        }
        view.set_magic(self.magic);
        view.set_layout_type(self.layout_type);
        view.set_sb_max_size_bits(self.sb_max_size_bits);
        view.set_nr_superblocks(self.offsets.len() as u8);
        for (i, offset) in self.offsets.iter().enumerate() {
            view.set_sb_offset(i, *offset)?;
        }
        Ok(())
    }

    /// Encode this layout into a standalone 512 byte descriptor
    pub fn to_bytes(&self) -> Result<[u8; LAYOUT_BYTES]> {
        let mut buf = [0u8; LAYOUT_BYTES];
        self.write_to(&mut SuperBlockLayout::new(&mut buf[..])?)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::super_block::BCACHE_MAGIC;
    use proptest::prelude::*;

    #[test]
    fn default_placement() {
        let mut l = Layout::init(4096, 2048, SB_SECTOR, 1 << 20).unwrap();
        assert_eq!(l.offsets, vec![8, 2056]);
        assert_eq!(l.sb_max_size_bits, 11);
        l.validate().unwrap();

        let backup = l.add_backup(1 << 20, 1024).unwrap();
        assert_eq!(backup, (1 << 20) - 2048);
        assert_eq!(l.offsets.len(), 3);
        l.validate().unwrap();
    }

    #[test]
    fn explicit_start_is_block_aligned() {
        let l = Layout::init(4096, 128, 13, 4096).unwrap();
        assert_eq!(l.offsets, vec![16, 144]);
        l.validate().unwrap();
    }

    #[test]
    fn range_too_small() {
        assert!(Layout::init(512, 2048, SB_SECTOR, 2048).is_err());
        assert!(Layout::init(512, 2048, SB_SECTOR, SB_SECTOR + 4096).is_ok());
        assert!(Layout::init(512, 3, SB_SECTOR, 1 << 20).is_err());
    }

    #[test]
    fn overlap_rejected() {
        let l = Layout {
            magic: BCACHE_MAGIC,
            layout_type: 0,
            sb_max_size_bits: 4,
            offsets: vec![8, 20],
        };
        assert_eq!(
            l.validate(),
            Err(SbInvalid::LayoutOverlap {
                idx: 0,
                prev_end: 24,
                next: 20
            })
        );
    }

    #[test]
    fn bad_descriptors() {
        let mut l = Layout::init(512, 8, SB_SECTOR, 1024).unwrap();
        l.layout_type = 1;
        assert_eq!(l.validate(), Err(SbInvalid::LayoutType(1)));
        l.layout_type = 0;
        l.offsets.clear();
        assert_eq!(l.validate(), Err(SbInvalid::LayoutNoSuperblocks));
        l.magic = Uuid::nil();
        assert_eq!(l.validate(), Err(SbInvalid::LayoutMagic));
    }

    #[test]
    fn descriptor_bytes() {
        let mut l = Layout::init(512, 8, SB_SECTOR, 1024).unwrap();
        l.add_backup(1024, 8).unwrap();
        let bytes = l.to_bytes().unwrap();
        assert_eq!(&bytes[..16], BCHFS_MAGIC.as_bytes());
        assert_eq!(bytes[17], 3);
        assert_eq!(bytes[18], 3);
        assert_eq!(Layout::from_bytes(&bytes).unwrap(), l);
    }

    proptest! {
        #[test]
        fn generated_layouts_never_overlap(
            block_shift in 9u32..16,
            size_bits in 0u32..12,
            start in prop_oneof![Just(SB_SECTOR), 0u64..100_000],
            slack in 0u64..1_000_000,
        ) {
            let block_size = 1u64 << block_shift;
            let sb_size = 1u64 << size_bits;
            let end = start + 2 * sb_size + (block_size >> 9) * 2 + slack;
            let l = Layout::init(block_size, sb_size, start, end).unwrap();
            prop_assert!(l.validate().is_ok());
            for pair in l.offsets.windows(2) {
                prop_assert!(pair[1] >= pair[0] + sb_size);
            }
            prop_assert!(*l.offsets.last().unwrap() + sb_size <= end);
        }

        #[test]
        fn too_small_range_always_fails(
            size_bits in 1u32..12,
            start in 0u64..100_000,
        ) {
            let sb_size = 1u64 << size_bits;
            let end = start + 2 * sb_size - 1;
            prop_assert!(Layout::init(512, sb_size, start, end).is_err());
        }
    }
}
