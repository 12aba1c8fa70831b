//! Committing the superblock to every online device.

use std::thread;

use crate::checksum::csum_vstruct;
use crate::counters::counters_from_cpu;
use crate::device::ByteDevice;
use crate::fields::SbHandle;
use crate::fs::{DevMask, Fs, FsFlags, FsSuper};
use crate::super_block::{SuperBlock, SuperBlockFlag, BCHFS_MAGIC, SB_HEADER_BYTES};
use crate::validate::{validate_super, Rw};
use crate::{BchError, Result};

use log::{debug, error, warn};

fn round_up(v: usize, to: u64) -> usize {
    let to = to.max(1) as usize;
    (v + to - 1) / to * to
}

/// Point `sb` at copy `idx` of its layout and checksum it.
///
/// Returns the byte offset and length to write, or `None` if the layout
/// has no copy `idx`.
pub(crate) fn prepare_copy(
    sb: &mut SbHandle,
    idx: usize,
    csum_type: u64,
    block_size: u64,
) -> Result<Option<(u64, usize)>> {
    if idx >= sb.sb().layout().nr_superblocks() as usize {
        return Ok(None);
    }
    let offset = sb.sb().layout().sb_offset(idx);

    let mut s = sb.sb_mut();
    s.set_offset(offset);
    s.set_flag(&SuperBlockFlag::CSUM_TYPE, csum_type)?;
    let csum = csum_vstruct(&s, csum_type)?;
    s.set_csum(csum);

    let len = round_up(s.vstruct_bytes(), block_size);
    Ok(Some((offset << 9, len)))
}

/// Write a copy prepared by [`prepare_copy`]
pub(crate) fn write_copy(sb: &SbHandle, dev: &dyn ByteDevice, at: u64, len: usize) -> Result<()> {
    let buf = sb
        .buffer()
        .get(..len)
        .ok_or(BchError::SbTooBig {
            want: len,
            max: sb.buffer_size(),
        })?;
    dev.write_at(at, buf)
}

/// Sequence number of the first copy currently on disk
fn read_back_seq(sb: &SbHandle, dev: &dyn ByteDevice) -> Result<u64> {
    let offset = sb.sb().layout().sb_offset(0);
    let mut buf = vec![0u8; round_up(SB_HEADER_BYTES, dev.block_size())];
    dev.read_at(offset << 9, &mut buf)?;
    Ok(SuperBlock::new(&buf[..])?.seq())
}

fn device_of(sb: &SbHandle) -> Result<&dyn ByteDevice> {
    sb.device()
        .map(|d| &**d)
        .ok_or_else(|| BchError::Einval("superblock has no device".to_string()))
}

/// Run `f` for every device concurrently and wait for all of them
fn for_each_dev<A, T, F>(items: Vec<(u8, A)>, f: F) -> Vec<(u8, Result<T>)>
where
    A: Send,
    T: Send,
    F: Fn(A) -> Result<T> + Sync,
{
    let f = &f;
    thread::scope(|scope| {
        let handles: Vec<_> = items
            .into_iter()
            .map(|(dev, a)| (dev, scope.spawn(move || f(a))))
            .collect();
        handles
            .into_iter()
            .map(|(dev, h)| {
                let res = h.join().unwrap_or_else(|_| {
                    Err(BchError::Str("superblock io thread panicked".to_string()))
                });
                (dev, res)
            })
            .collect()
    })
}

impl Fs {
    /// Commit the authoritative superblock.
    ///
    /// The caller holds the superblock lock and has already made its
    /// changes to the authoritative image. The in-memory projection is
    /// refreshed whether or not the commit succeeds.
    pub fn write_super(&self, s: &mut FsSuper) -> Result<()> {
        let ret = self.write_super_locked(s);
        s.update();
        ret
    }

    fn write_super_locked(&self, s: &mut FsSuper) -> Result<()> {
        if self.is_emergency_ro() || self.opts.read_only {
            return Err(BchError::ReadOnly);
        }

        let flags = self.flags();
        {
            let mut sb = s.disk_sb.sb_mut();
            if self.opts.version_upgrade {
                sb.set_magic(BCHFS_MAGIC);
            }
            let seq = sb.seq() + 1;
            sb.set_seq(seq);
            // error bits are sticky; only fsck clears them
            if flags.contains(FsFlags::ERROR) {
                sb.set_flag_bool(&SuperBlockFlag::HAS_ERRORS, true);
            }
            if flags.contains(FsFlags::TOPOLOGY_ERROR) {
                sb.set_flag_bool(&SuperBlockFlag::HAS_TOPOLOGY_ERRORS, true);
            }
            // every integer is stored little endian
            sb.set_flag_bool(&SuperBlockFlag::BIG_ENDIAN, false);
        }

        let online = s.online();
        {
            let usage = self.usage.read();
            counters_from_cpu(s, &usage)?;
            for dev in online.iter() {
                s.from_fs(dev)?;
                if self.opts.version_upgrade {
                    if let Some(sb) = s.devs.get_mut(&dev) {
                        sb.sb_mut().layout_mut().set_magic(BCHFS_MAGIC);
                    }
                }
            }
        }

        for (dev, sb) in s.devs.iter_mut() {
            if let Err(err) = validate_super(sb, Rw::Write) {
                error!("dev {}: invalid superblock before write: {}", dev, err);
                self.set_flags(FsFlags::ERROR);
                return Err(err.into());
            }
        }

        if self.opts.nochanges {
            return Ok(());
        }

        if s.disk_sb.sb().flag(&SuperBlockFlag::INITIALIZED) == 0 {
            debug!("filesystem not initialized, not writing superblock");
            return Ok(());
        }

        let fresh = s.devs.values().all(|sb| sb.seq == 0);
        let mut failed = DevMask::default();

        let read_back = for_each_dev(
            s.devs.iter().map(|(d, sb)| (*d, sb)).collect(),
            |sb: &SbHandle| read_back_seq(sb, device_of(sb)?),
        );
        for (dev, res) in read_back {
            let expected = s.devs.get(&dev).map_or(0, |sb| sb.seq);
            match res {
                Ok(found) if found == expected => {}
                Ok(found) => {
                    if found < expected {
                        error!(
                            "dev {}: superblock write was silently dropped (read seq {} want {})",
                            dev, found, expected
                        );
                    } else {
                        error!(
                            "dev {}: superblock modified by another process (read seq {} want {})",
                            dev, found, expected
                        );
                    }
                    let err = BchError::SeqMismatch {
                        dev,
                        found,
                        expected,
                    };
                    self.fatal_error(&err);
                    return Err(err);
                }
                Err(err) => {
                    warn!("dev {}: error reading superblock: {}", dev, err);
                    failed.set(dev);
                }
            }
        }

        let csum_type = self.opts.metadata_checksum.csum_type() as u64;
        for idx in 0.. {
            let mut round = Vec::new();
            for (dev, sb) in s.devs.iter_mut() {
                if failed.test(*dev) {
                    continue;
                }
                let block_size = sb.device().map_or(512, |d| d.block_size());
                match prepare_copy(sb, idx, csum_type, block_size) {
                    Ok(Some((at, len))) => round.push((*dev, at, len)),
                    Ok(None) => {}
                    Err(err) => {
                        warn!("dev {}: error preparing superblock: {}", dev, err);
                        failed.set(*dev);
                    }
                }
            }
            if round.is_empty() {
                break;
            }

            let targets = round
                .iter()
                .filter_map(|(dev, at, len)| s.devs.get(dev).map(|sb| (*dev, (sb, *at, *len))))
                .collect();
            let results = for_each_dev(targets, |(sb, at, len): (&SbHandle, u64, usize)| {
                write_copy(sb, device_of(sb)?, at, len)
            });
            for (dev, res) in results {
                if let Err(err) = res {
                    warn!("dev {}: error writing superblock copy {}: {}", dev, idx, err);
                    failed.set(dev);
                }
            }
        }

        let written = online.difference(&failed);
        for dev in written.iter() {
            if let Some(sb) = s.devs.get_mut(&dev) {
                sb.seq = sb.sb().seq();
            }
        }

        let flags = self.degraded_flags();
        let can_mount_with_written =
            !written.is_empty() && self.degraded.have_enough_devs(&s.cache, written, flags);
        let can_mount_without_written = !failed.is_empty()
            && !fresh
            && self.degraded.have_enough_devs(&s.cache, failed, flags);

        if !can_mount_with_written || can_mount_without_written {
            let err = BchError::InsufficientDevices {
                written: written.nr(),
            };
            self.fatal_error(&err);
            return Err(err);
        }

        debug!(
            "wrote superblock seq {} to {} devices",
            s.disk_sb.sb().seq(),
            written.nr()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::format::tests::formatted;
    use crate::fs::{DegradedPolicy, NoBtree, SbCache};
    use crate::opts::FsOpts;
    use crate::read::{read_super, read_super_at};
    use crate::replicas::ForceFlags;
    use crate::super_block::SB_SECTOR;
    use std::sync::Arc;

    /// Mountable with any `k` devices
    struct AtLeast(usize);

    impl DegradedPolicy for AtLeast {
        fn have_enough_devs(&self, _: &SbCache, devs: DevMask, _: ForceFlags) -> bool {
            devs.nr() >= self.0
        }
    }

    fn open_with(devs: &[Arc<MemDevice>], opts: FsOpts, policy: Box<dyn DegradedPolicy>) -> Fs {
        let devices = devs
            .iter()
            .map(|d| d.clone() as Arc<dyn ByteDevice>)
            .collect();
        Fs::open(devices, opts, policy, Box::new(NoBtree)).unwrap()
    }

    fn open(devs: &[Arc<MemDevice>], k: usize) -> Fs {
        open_with(devs, FsOpts::default(), Box::new(AtLeast(k)))
    }

    fn commit(fs: &Fs) -> Result<()> {
        let mut s = fs.sb_lock();
        fs.write_super(&mut s)
    }

    fn disk_seq(dev: &MemDevice) -> u64 {
        read_super(Arc::new(clone_image(dev)), &FsOpts::default())
            .unwrap()
            .sb()
            .seq()
    }

    fn clone_image(dev: &MemDevice) -> MemDevice {
        let len = dev.len_bytes() as usize;
        let copy = MemDevice::new("copy", len, dev.block_size());
        copy.poke(0, &dev.peek(0, len));
        copy
    }

    #[test]
    fn commit_bumps_seq_everywhere() {
        let devs = formatted(3, true);
        let fs = open(&devs, 2);
        let seq = fs.sb_lock().disk_sb().sb().seq();
        commit(&fs).unwrap();
        for d in devs.iter() {
            assert_eq!(disk_seq(d), seq + 1);
        }
        let s = fs.sb_lock();
        assert!(s.online().iter().all(|d| s.dev_sb(d).unwrap().seq() == seq + 1));
    }

    #[test]
    fn feature_bit_committed_once() {
        let devs = formatted(2, true);
        let fs = open(&devs, 2);
        let seq = fs.sb_lock().disk_sb().sb().seq();

        fs.check_set_feature(0).unwrap();
        assert_eq!(disk_seq(&devs[1]), seq + 1);
        let s = read_super(Arc::new(clone_image(&devs[0])), &FsOpts::default()).unwrap();
        assert_eq!(s.sb().feature(0) & 1, 1);

        let writes = devs[0].writes();
        fs.check_set_feature(0).unwrap();
        assert_eq!(devs[0].writes(), writes);
        assert!(fs.check_set_feature(64).is_err());
    }

    #[test]
    fn committed_image_reads_back_identical() {
        let devs = formatted(2, true);
        let fs = open(&devs, 2);
        fs.counter_add(crate::counters::counter::IO_WRITE, 1);
        commit(&fs).unwrap();

        let s = fs.sb_lock();
        for (i, d) in devs.iter().enumerate() {
            let mem = s.dev_sb(i as u8).unwrap();
            let sb = mem.sb();
            let layout = sb.layout();
            // the in-memory image was last prepared for the final copy
            let last = layout.sb_offset(layout.nr_superblocks() as usize - 1);
            let mut disk = read_super_at(Arc::new(clone_image(d)), last).unwrap();
            assert_eq!(disk.bytes(), mem.bytes());
            validate_super(&mut disk, Rw::Write).unwrap();
            validate_super(&mut disk, Rw::Read).unwrap();
        }
    }

    #[test]
    fn error_bits_survive_later_commits() {
        let devs = formatted(2, true);
        let fs = open(&devs, 2);
        fs.set_flags(FsFlags::ERROR | FsFlags::TOPOLOGY_ERROR);
        commit(&fs).unwrap();
        drop(fs);

        // a clean mount must not clear them
        let fs = open(&devs, 2);
        commit(&fs).unwrap();
        commit(&fs).unwrap();
        for d in devs.iter() {
            let sb = read_super(Arc::new(clone_image(d)), &FsOpts::default()).unwrap();
            assert_eq!(sb.sb().flag(&SuperBlockFlag::HAS_ERRORS), 1);
            assert_eq!(sb.sb().flag(&SuperBlockFlag::HAS_TOPOLOGY_ERRORS), 1);
        }
        assert_eq!(
            fs.sb_lock().disk_sb().sb().flag(&SuperBlockFlag::HAS_ERRORS),
            1
        );
    }

    #[test]
    fn quorum_accepts_enough_devices() {
        let devs = formatted(3, true);
        let fs = open(&devs, 2);
        devs[2].set_fail_writes(true);
        commit(&fs).unwrap();
        assert!(!fs.is_emergency_ro());

        // the failed device keeps its old sequence number
        let s = fs.sb_lock();
        assert_eq!(s.dev_sb(2).unwrap().seq() + 1, s.dev_sb(0).unwrap().seq());
    }

    #[test]
    fn quorum_rejects_too_few_devices() {
        let devs = formatted(3, true);
        let fs = open(&devs, 2);
        devs[1].set_fail_writes(true);
        devs[2].set_fail_writes(true);
        match commit(&fs) {
            Err(BchError::InsufficientDevices { written }) => assert_eq!(written, 1),
            r => panic!("unexpected result {:?}", r),
        }
        assert!(fs.is_emergency_ro());
        assert!(matches!(fs.mark_dirty(), Err(BchError::ReadOnly)));
    }

    #[test]
    fn quorum_rejects_mountable_complement() {
        let devs = formatted(3, true);
        let fs = open(&devs, 1);
        devs[2].set_fail_writes(true);
        assert!(matches!(
            commit(&fs),
            Err(BchError::InsufficientDevices { written: 2 })
        ));
    }

    #[test]
    fn read_error_fails_only_that_device() {
        let devs = formatted(3, true);
        let fs = open(&devs, 2);
        devs[0].set_fail_reads(true);
        commit(&fs).unwrap();
        devs[0].set_fail_reads(false);
        let seq = fs.sb_lock().disk_sb().sb().seq();
        assert_eq!(disk_seq(&devs[0]), seq - 1);
        assert_eq!(disk_seq(&devs[1]), seq);
    }

    #[test]
    fn foreign_writer_is_fatal() {
        let devs = formatted(2, true);
        let fs = open(&devs, 1);
        let seq = fs.sb_lock().disk_sb().sb().seq();

        // bump the on-disk sequence number of the first copy behind our back
        let at = (SB_SECTOR << 9) as usize + 112;
        devs[1].poke(at, &(seq + 5).to_le_bytes());

        let writes = devs[0].writes();
        match commit(&fs) {
            Err(BchError::SeqMismatch {
                dev,
                found,
                expected,
            }) => {
                assert_eq!(dev, 1);
                assert_eq!(found, seq + 5);
                assert_eq!(expected, seq);
            }
            r => panic!("unexpected result {:?}", r),
        }
        assert_eq!(devs[0].writes(), writes);
        assert!(fs.is_emergency_ro());
    }

    #[test]
    fn dropped_write_is_detected() {
        let devs = formatted(1, true);
        let fs = open(&devs, 1);
        devs[0].drop_writes_after(Some(0));
        commit(&fs).unwrap();
        devs[0].drop_writes_after(None);
        assert!(matches!(
            commit(&fs),
            Err(BchError::SeqMismatch { dev: 0, .. })
        ));
    }

    #[test]
    fn nochanges_issues_no_io() {
        let devs = formatted(2, true);
        let opts = FsOpts {
            nochanges: true,
            ..FsOpts::default()
        };
        let fs = open_with(&devs, opts, Box::new(AtLeast(1)));
        let before: usize = devs.iter().map(|d| d.writes()).sum();
        commit(&fs).unwrap();
        assert_eq!(devs.iter().map(|d| d.writes()).sum::<usize>(), before);
        // the in-memory image still moved on
        assert_eq!(
            fs.sb_lock().disk_sb().sb().seq(),
            disk_seq(&devs[0]) + 1
        );
    }

    #[test]
    fn uninitialized_filesystem_is_not_written() {
        let devs = formatted(2, false);
        let fs = open(&devs, 1);
        let before: Vec<usize> = devs.iter().map(|d| d.writes()).collect();
        commit(&fs).unwrap();
        assert_eq!(devs.iter().map(|d| d.writes()).collect::<Vec<_>>(), before);

        fs.initialize().unwrap();
        assert!(devs.iter().zip(before.iter()).all(|(d, b)| d.writes() > *b));
        assert_eq!(disk_seq(&devs[0]), 2);
    }

    #[test]
    fn invalid_superblock_is_never_written() {
        let devs = formatted(1, true);
        let fs = open(&devs, 1);
        let before = devs[0].writes();
        {
            let mut s = fs.sb_lock();
            s.disk_sb_mut().sb_mut().set_nr_devices(0);
            assert!(matches!(
                fs.write_super(&mut s),
                Err(BchError::Invalid(_))
            ));
        }
        assert_eq!(devs[0].writes(), before);
    }
}
