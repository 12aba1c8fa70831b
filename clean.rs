//! The clean section and the clean/dirty marker.
//!
//! A cleanly shut down filesystem records its usage counters, IO clocks and
//! btree roots in the superblock so the next mount can skip journal replay.

use std::fmt::Write;
use std::sync::atomic::Ordering;

use crate::fields::FieldType;
use crate::fs::{DevMask, Fs};
use crate::journal_entry::{
    encode_entries, jset_entries_to_text, validate_entries, EntryCtx, JsetEntry, UsageType,
};
use crate::super_block::{Compat, Features, SuperBlockFlag, COMPAT_NR};
use crate::validate::{FieldInvalid, Rw};
use crate::{BchError, Result};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, info};

/// Size of the clean section with no entries, field header included
pub const CLEAN_HEADER_BYTES: usize = 24;

/// Fixed part of the clean payload before the journal entries
pub(crate) const CLEAN_PAYLOAD_HEADER: usize = CLEAN_HEADER_BYTES - 8;

/// The clean section
#[derive(Debug, Clone, Copy)]
pub struct CleanField<'a> {
    buf: &'a [u8],
}

impl<'a> CleanField<'a> {
    /// View a clean section payload
    pub fn new(buf: &'a [u8]) -> CleanField<'a> {
        CleanField { buf }
    }

    /// Flags word
    pub fn flags(&self) -> u32 {
        self.buf.get(0..4).map_or(0, LittleEndian::read_u32)
    }

    /// Journal sequence number at shutdown
    pub fn journal_seq(&self) -> u64 {
        self.buf.get(8..16).map_or(0, LittleEndian::read_u64)
    }

    /// The packed journal entries
    pub fn entries_raw(&self) -> &'a [u8] {
        self.buf.get(CLEAN_PAYLOAD_HEADER..).unwrap_or(&[])
    }

    /// Decode the journal entries
    pub fn entries(&self) -> std::result::Result<Vec<JsetEntry>, FieldInvalid> {
        JsetEntry::decode_all(self.entries_raw())
    }

    pub(crate) fn validate(&self) -> std::result::Result<(), FieldInvalid> {
        if self.buf.len() < CLEAN_PAYLOAD_HEADER {
            return Err(FieldInvalid::WrongSize {
                got: self.buf.len() + 8,
                want: CLEAN_HEADER_BYTES,
            });
        }
        Ok(())
    }

    pub(crate) fn to_text(&self, out: &mut String) {
        let _ = writeln!(out, "flags:       {:x}", self.flags());
        let _ = writeln!(out, "journal_seq: {}", self.journal_seq());
        jset_entries_to_text(self.entries_raw(), out);
    }
}

impl Fs {
    /// Snapshot of the in-memory state recorded at clean shutdown.
    ///
    /// Takes the usage lock only; the superblock lock is never taken while
    /// usage is held.
    pub(crate) fn clean_entries(&self, members: DevMask) -> Vec<JsetEntry> {
        let usage = self.usage.read();
        let mut entries = Vec::new();

        entries.push(JsetEntry::usage(
            UsageType::Inodes,
            0,
            usage.inodes.load(Ordering::Relaxed),
        ));
        entries.push(JsetEntry::usage(
            UsageType::KeyVersion,
            0,
            self.key_version.load(Ordering::SeqCst),
        ));
        for (i, r) in usage.reserved.iter().enumerate() {
            entries.push(JsetEntry::usage(
                UsageType::Reserved,
                i as u8,
                r.load(Ordering::Relaxed),
            ));
        }
        for (r, v) in usage.replicas.iter() {
            entries.push(JsetEntry::data_usage(v.load(Ordering::Relaxed), r));
        }

        for dev in members.iter() {
            if let Some(d) = usage.devs.get(dev as usize) {
                entries.push(JsetEntry::dev_usage(
                    dev,
                    d.buckets_ec.load(Ordering::Relaxed),
                    d.buckets_unavailable.load(Ordering::Relaxed),
                    &d.snapshot(),
                ));
            }
        }

        let clocks = self.clocks();
        entries.push(JsetEntry::clock(0, clocks[0]));
        entries.push(JsetEntry::clock(1, clocks[1]));

        for root in self.btree.roots() {
            entries.push(JsetEntry::btree_root(root.btree_id, root.level, &root.key));
        }
        entries
    }

    /// Mark the filesystem clean, recording the state needed to mount it
    /// without replaying the journal.
    ///
    /// Does nothing if it is already clean. On failure the filesystem stays
    /// dirty.
    pub fn mark_clean(&self) -> Result<()> {
        let members = {
            let s = self.sb.lock();
            if s.disk_sb.sb().flag(&SuperBlockFlag::CLEAN) != 0 {
                return Ok(());
            }
            s.disk_sb.member_mask()
        };

        // built with the superblock lock released; it takes the usage lock
        let entries = self.clean_entries(members);

        let mut s = self.sb.lock();
        if s.disk_sb.sb().flag(&SuperBlockFlag::CLEAN) != 0 {
            return Ok(());
        }

        let res = (|| -> Result<()> {
            let mut packed = encode_entries(&entries);
            let ctx = EntryCtx {
                rw: Rw::Write,
                devs: s.disk_sb.member_mask(),
            };
            validate_entries(&mut packed, &ctx).map_err(|err| {
                BchError::Einval(format!("clean section: {}", err))
            })?;

            let u64s = (CLEAN_PAYLOAD_HEADER + packed.len()) / 8;
            let f = s
                .field_resize(FieldType::Clean, 1 + u64s as u32)?
                .ok_or(BchError::Exhausted)?;
            let journal_seq = self.journal_seq();
            let payload = s.disk_sb.field_payload_mut(&f);
            for b in payload[..CLEAN_PAYLOAD_HEADER].iter_mut() {
                *b = 0;
            }
            LittleEndian::write_u64(&mut payload[8..16], journal_seq);
            payload[CLEAN_PAYLOAD_HEADER..].copy_from_slice(&packed);
            Ok(())
        })();
        if let Err(err) = res {
            error!("error marking filesystem clean: {}", err);
            return Err(err);
        }

        {
            let mut sb = s.disk_sb.sb_mut();
            sb.set_flag_bool(&SuperBlockFlag::CLEAN, true);
            let compat = sb.compat(0) | (Compat::ALLOC_INFO | Compat::ALLOC_METADATA).bits();
            sb.set_compat(0, compat);
            let features = sb.feature(0)
                & !(Features::EXTENTS_ABOVE_BTREE_UPDATES | Features::BTREE_UPDATES_JOURNALLED)
                    .bits();
            sb.set_feature(0, features);
        }

        match self.write_super(&mut s) {
            Ok(()) => {
                info!("marked filesystem clean, journal seq {}", self.journal_seq());
                Ok(())
            }
            Err(err) => {
                error!("error marking filesystem clean: {}", err);
                Err(err)
            }
        }
    }

    /// Mark the filesystem dirty. Always commits, so that nothing is
    /// modified while the disk still claims a clean shutdown.
    pub fn mark_dirty(&self) -> Result<()> {
        let mut s = self.sb.lock();
        {
            let mut sb = s.disk_sb.sb_mut();
            sb.set_flag_bool(&SuperBlockFlag::CLEAN, false);
            let features = sb.feature(0) | Features::ALWAYS.bits();
            sb.set_feature(0, features);
            let compat = sb.compat(0) & ((1u64 << COMPAT_NR) - 1);
            sb.set_compat(0, compat);
        }
        self.write_super(&mut s)
    }

    /// Entries of the clean section, if the filesystem is clean
    pub fn clean_snapshot(&self) -> Option<Vec<JsetEntry>> {
        let s = self.sb.lock();
        if s.disk_sb.sb().flag(&SuperBlockFlag::CLEAN) == 0 {
            return None;
        }
        let f = s.disk_sb.field_get(FieldType::Clean)?;
        CleanField::new(s.disk_sb.field_payload(&f)).entries().ok()
    }

    /// Load the counters recorded at clean shutdown
    pub(crate) fn restore_clean(&self) {
        let (entries, journal_seq) = {
            let s = self.sb.lock();
            if !s.cache.clean {
                return;
            }
            let f = match s.disk_sb.field_get(FieldType::Clean) {
                Some(f) => f,
                None => return,
            };
            let clean = CleanField::new(s.disk_sb.field_payload(&f));
            match clean.entries() {
                Ok(entries) => (entries, clean.journal_seq()),
                Err(err) => {
                    debug!("not restoring clean section: {}", err);
                    return;
                }
            }
        };

        self.set_journal_seq(journal_seq);
        let usage = self.usage.read();
        for e in entries.iter() {
            if let Some((rw, time)) = e.clock_time() {
                self.set_clock(rw as usize, time);
            } else if let Some((dev, ec, unavailable, d)) = e.dev_usage_counters() {
                if let Some(u) = usage.devs.get(dev as usize) {
                    u.buckets_ec.store(ec, Ordering::Relaxed);
                    u.buckets_unavailable.store(unavailable, Ordering::Relaxed);
                    u.restore(&d);
                }
            } else if let Some(r) = e.replicas() {
                if let Ok(i) = usage.replicas.binary_search_by(|(x, _)| x.cmp(&r)) {
                    usage.replicas[i].1.store(e.value().unwrap_or(0), Ordering::Relaxed);
                }
            } else if let Some(v) = e.value() {
                match e.btree_id {
                    t if t == UsageType::Inodes as u8 => usage.inodes.store(v, Ordering::Relaxed),
                    t if t == UsageType::KeyVersion as u8 => self.set_key_version(v),
                    t if t == UsageType::Reserved as u8 => {
                        if let Some(r) = usage.reserved.get(e.level as usize) {
                            r.store(v, Ordering::Relaxed);
                        }
                    }
                    _ => {}
                }
            }
        }
        debug!("restored usage from clean section, journal seq {}", journal_seq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ByteDevice, MemDevice};
    use crate::format::tests::formatted;
    use crate::fs::{BtreeRoot, BtreeRoots, ReplicasPolicy};
    use crate::opts::FsOpts;
    use crate::read::read_super;
    use crate::replicas::ReplicasEntry;
    use crate::super_block::data_type;
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    struct OneRoot;

    impl BtreeRoots for OneRoot {
        fn roots(&self) -> Vec<BtreeRoot> {
            let mut key = vec![0u8; 16];
            key[0] = 2;
            vec![BtreeRoot {
                btree_id: 2,
                level: 0,
                key,
            }]
        }
    }

    fn open(devs: &[Arc<MemDevice>]) -> Fs {
        let devices = devs
            .iter()
            .map(|d| d.clone() as Arc<dyn ByteDevice>)
            .collect();
        Fs::open(
            devices,
            FsOpts::default(),
            Box::new(ReplicasPolicy),
            Box::new(OneRoot),
        )
        .unwrap()
    }

    #[test]
    fn short_clean_section() {
        let f = CleanField::new(&[0u8; 8]);
        assert_eq!(
            f.validate(),
            Err(FieldInvalid::WrongSize { got: 16, want: 24 })
        );
        assert!(CleanField::new(&[0u8; 16]).validate().is_ok());
    }

    #[test]
    fn mark_clean_is_idempotent() {
        let devs = formatted(2, true);
        let fs = open(&devs);
        fs.mark_dirty().unwrap();

        let before: usize = devs.iter().map(|d| d.writes()).sum();
        fs.mark_clean().unwrap();
        let after_first: usize = devs.iter().map(|d| d.writes()).sum();
        assert!(after_first > before);

        fs.mark_clean().unwrap();
        let after_second: usize = devs.iter().map(|d| d.writes()).sum();
        assert_eq!(after_first, after_second);
    }

    #[test]
    fn clean_section_round_trips_counters() {
        let devs = formatted(2, true);
        let entry = ReplicasEntry::new(data_type::USER, 1, &[0, 1]);
        {
            let fs = open(&devs);
            fs.mark_dirty().unwrap();
            fs.mark_replicas(&entry).unwrap();
            fs.add_inodes(42);
            fs.add_replicas_sectors(&entry, 128).unwrap();
            fs.add_dev_usage(1, data_type::USER, 2, 64, 3).unwrap();
            fs.add_reserved(2, 16).unwrap();
            fs.set_journal_seq(1000);
            fs.set_clock(1, 77);
            fs.mark_clean().unwrap();

            let snapshot = fs.clean_snapshot().unwrap();
            assert!(snapshot
                .iter()
                .any(|e| e.ty == crate::journal_entry::entry_type::BTREE_ROOT));
        }

        let fs = open(&devs);
        assert!(fs.sb_cache().clean);
        assert_eq!(fs.inodes(), 42);
        assert_eq!(fs.replicas_sectors(&entry), Some(128));
        assert_eq!(fs.journal_seq(), 1000);
        assert_eq!(fs.clocks(), [0, 77]);

        let compat = fs.sb_cache().compat;
        assert_ne!(compat & Compat::ALLOC_INFO.bits(), 0);

        fs.mark_dirty().unwrap();
        let cache = fs.sb_cache();
        assert!(!cache.clean);
        assert_eq!(cache.compat & !((1u64 << COMPAT_NR) - 1), 0);
        assert_eq!(
            cache.features & Features::ALWAYS.bits(),
            Features::ALWAYS.bits()
        );
        assert!(fs.clean_snapshot().is_none());
    }

    #[test]
    fn crash_during_mark_dirty_never_reads_clean() {
        let devs = formatted(1, true);
        {
            let fs = open(&devs);
            // formatting leaves the filesystem clean
            assert!(fs.sb_cache().clean);
            // the first copy reaches the disk, the rest are lost
            devs[0].drop_writes_after(Some(1));
            fs.mark_dirty().unwrap();
        }
        devs[0].drop_writes_after(None);

        let sb = read_super(devs[0].clone(), &FsOpts::default()).unwrap();
        assert_eq!(sb.sb().flag(&SuperBlockFlag::CLEAN), 0);
    }

    #[test]
    fn clean_entries_with_superblock_locked() {
        let devs = formatted(2, true);
        let fs = Arc::new(open(&devs));
        let members = fs.sb_lock().disk_sb().member_mask();

        let guard = fs.sb_lock();
        let (tx, rx) = mpsc::channel();
        let worker = {
            let fs = fs.clone();
            thread::spawn(move || {
                let _ = tx.send(fs.clean_entries(members).len());
            })
        };
        let nr = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        drop(guard);
        worker.join().unwrap();
        assert!(nr > 0);
    }

    #[test]
    fn mark_clean_races_mark_replicas() {
        let devs = formatted(2, true);
        let fs = Arc::new(open(&devs));
        let (tx, rx) = mpsc::channel();

        let cleaner = {
            let fs = fs.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    fs.mark_dirty().unwrap();
                    fs.mark_clean().unwrap();
                }
                let _ = tx.send(());
            })
        };
        let marker = {
            let fs = fs.clone();
            thread::spawn(move || {
                let entries = [
                    ReplicasEntry::new(data_type::USER, 1, &[0]),
                    ReplicasEntry::new(data_type::USER, 1, &[1]),
                    ReplicasEntry::new(data_type::USER, 1, &[0, 1]),
                    ReplicasEntry::new(data_type::BTREE, 1, &[0, 1]),
                ];
                for e in entries.iter() {
                    fs.mark_replicas(e).unwrap();
                    fs.add_replicas_sectors(e, 8).unwrap();
                }
                let _ = tx.send(());
            })
        };

        for _ in 0..2 {
            rx.recv_timeout(Duration::from_secs(30)).unwrap();
        }
        cleaner.join().unwrap();
        marker.join().unwrap();
        assert_eq!(
            fs.replicas_sectors(&ReplicasEntry::new(data_type::BTREE, 1, &[0, 1])),
            Some(8)
        );
    }
}
