//! Reading a superblock from one device, falling back to the backup copies.

use std::sync::Arc;

use crate::checksum::{csum_vstruct, CSUM_NR};
use crate::device::ByteDevice;
use crate::fields::SbHandle;
use crate::layout::Layout;
use crate::opts::FsOpts;
use crate::super_block::{is_magic, SuperBlockFlag, LAYOUT_BYTES, LAYOUT_SECTOR, SB_SECTOR};
use crate::validate::{validate_super, Rw, SbInvalid};
use crate::Result;

use log::{debug, warn};

/// Read the copy at `offset` into `sb`: magic, size and checksum checks only
fn read_one_super(sb: &mut SbHandle, dev: &dyn ByteDevice, offset: u64) -> Result<()> {
    let mut grown = false;
    loop {
        sb.have_layout = false;
        dev.read_at(offset << 9, sb.buffer_mut())?;

        if !is_magic(&sb.sb().magic()) {
            return Err(SbInvalid::Magic.into());
        }

        let bytes = sb.sb().vstruct_bytes();
        let max = sb.sb().layout().max_bytes();
        if bytes > max {
            return Err(SbInvalid::TooBig { got: bytes, max }.into());
        }

        if bytes <= sb.buffer_size() {
            break;
        }
        if grown {
            return Err(SbInvalid::TooBig {
                got: bytes,
                max: sb.buffer_size(),
            }
            .into());
        }
        let u64s = sb.sb().u64s();
        sb.realloc(u64s)?;
        grown = true;
    }

    let csum_type = sb.sb().flag(&SuperBlockFlag::CSUM_TYPE);
    if csum_type >= CSUM_NR {
        return Err(SbInvalid::CsumTypeUnknown(csum_type).into());
    }
    let csum = csum_vstruct(&sb.sb(), csum_type)?;
    if csum != sb.sb().csum() {
        return Err(SbInvalid::BadChecksum.into());
    }

    sb.seq = sb.sb().seq();
    Ok(())
}

/// Read and validate the copy at `offset`
fn read_and_validate(sb: &mut SbHandle, dev: &dyn ByteDevice, offset: u64) -> Result<()> {
    read_one_super(sb, dev, offset)?;
    sb.have_layout = true;
    validate_super(sb, Rw::Read)?;
    debug!(
        "{}: read superblock at sector {}, seq {}",
        dev.name(),
        offset,
        sb.seq
    );
    Ok(())
}

fn check_block_size(sb: &SbHandle, dev: &dyn ByteDevice) -> Result<()> {
    let block_size = u64::from(sb.sb().block_size()) << 9;
    if block_size < dev.block_size() {
        return Err(SbInvalid::BlockSizeTooSmall {
            block_size,
            device: dev.block_size(),
        }
        .into());
    }
    Ok(())
}

/// Read exactly the copy at `sector`, without trying any other
pub fn read_super_at(dev: Arc<dyn ByteDevice>, sector: u64) -> Result<SbHandle> {
    let mut sb = SbHandle::new(Some(dev.clone()))?;
    read_and_validate(&mut sb, &*dev, sector)?;
    check_block_size(&sb, &*dev)?;
    Ok(sb)
}

/// Read the superblock of a device.
///
/// The copy at the default sector (or `opts.sb`) is tried first. If that
/// fails and no explicit sector was given, the layout descriptor is read
/// from its fixed sector and every other copy it lists is tried in order.
pub fn read_super(dev: Arc<dyn ByteDevice>, opts: &FsOpts) -> Result<SbHandle> {
    let mut sb = SbHandle::new(Some(dev.clone()))?;
    let offset = opts.sb.unwrap_or(SB_SECTOR);

    if let Err(err) = read_and_validate(&mut sb, &*dev, offset) {
        if opts.sb.is_some() {
            return Err(err);
        }
        warn!(
            "{}: error reading default superblock: {}",
            dev.name(),
            err
        );

        let mut buf = [0u8; LAYOUT_BYTES];
        dev.read_at(LAYOUT_SECTOR << 9, &mut buf)?;
        let layout = Layout::from_bytes(&buf)?;
        layout.validate()?;

        let mut last = err;
        let mut found = false;
        for backup in layout.offsets.iter().filter(|o| **o != offset) {
            match read_and_validate(&mut sb, &*dev, *backup) {
                Ok(()) => {
                    warn!("{}: using backup superblock at sector {}", dev.name(), backup);
                    found = true;
                    break;
                }
                Err(e) => {
                    debug!("{}: backup at sector {}: {}", dev.name(), backup, e);
                    last = e;
                }
            }
        }
        if !found {
            return Err(last);
        }
    }

    check_block_size(&sb, &*dev)?;
    Ok(sb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::format::tests::{formatted, MEM_DEVICE_BYTES};
    use crate::super_block::SB_HEADER_BYTES;
    use crate::BchError;
    use proptest::prelude::*;

    const PRIMARY: usize = (SB_SECTOR << 9) as usize;

    fn flip_bit(dev: &MemDevice, offset: usize, bit: u8) {
        let mut b = dev.peek(offset, 1);
        b[0] ^= 1 << bit;
        dev.poke(offset, &b);
    }

    #[test]
    fn reads_primary() {
        let devs = formatted(2, true);
        let sb = read_super(devs[1].clone(), &FsOpts::default()).unwrap();
        assert_eq!(sb.sb().offset(), SB_SECTOR);
        assert_eq!(sb.sb().seq(), 2);
        assert_eq!(sb.sb().dev_idx(), 1);
        assert_eq!(sb.sb().nr_devices(), 2);
        assert!(sb.members().is_some());
    }

    #[test]
    fn falls_back_to_backup() {
        let devs = formatted(1, true);
        devs[0].poke(PRIMARY, &[0u8; 512]);

        let sb = read_super(devs[0].clone(), &FsOpts::default()).unwrap();
        assert_eq!(sb.sb().offset(), 136);
        assert_eq!(sb.sb().seq(), 2);

        // an explicit sector is never second guessed
        let opts = FsOpts {
            sb: Some(SB_SECTOR),
            ..FsOpts::default()
        };
        match read_super(devs[0].clone(), &opts) {
            Err(BchError::Invalid(SbInvalid::Magic)) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert_eq!(read_super_at(devs[0].clone(), 8064).unwrap().sb().seq(), 2);
    }

    #[test]
    fn every_copy_bad() {
        let devs = formatted(1, false);
        for sector in [8usize, 136, 8064].iter() {
            devs[0].poke(sector << 9, &[0u8; 512]);
        }
        assert!(read_super(devs[0].clone(), &FsOpts::default()).is_err());
    }

    #[test]
    fn device_block_size_too_large() {
        let devs = formatted(1, false);
        let image = devs[0].peek(0, MEM_DEVICE_BYTES);
        let big = Arc::new(MemDevice::new("big", MEM_DEVICE_BYTES, 4096));
        big.poke(0, &image);

        match read_super(big, &FsOpts::default()) {
            Err(BchError::Invalid(SbInvalid::BlockSizeTooSmall { block_size, device })) => {
                assert_eq!(block_size, 512);
                assert_eq!(device, 4096);
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn flipped_field_bit_fails_checksum(pos in 0usize..4096, bit in 0u8..8) {
            let devs = formatted(1, false);
            let sb = read_super_at(devs[0].clone(), SB_SECTOR).unwrap();
            let payload = sb.sb().vstruct_bytes() - SB_HEADER_BYTES;
            flip_bit(&devs[0], PRIMARY + SB_HEADER_BYTES + pos % payload, bit);

            match read_super_at(devs[0].clone(), SB_SECTOR) {
                Err(BchError::Invalid(SbInvalid::BadChecksum)) => {}
                other => prop_assert!(false, "unexpected result: {:?}", other.map(|_| ())),
            }
            // the backups still carry the superblock
            let recovered = read_super(devs[0].clone(), &FsOpts::default()).unwrap();
            prop_assert_eq!(recovered.sb().offset(), 136);
        }
    }
}
