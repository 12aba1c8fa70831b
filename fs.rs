//! Filesystem wide superblock state.
//!
//! An [`Fs`] owns the authoritative superblock image, one private image per
//! online device and the in-memory projection derived from them. All of it
//! lives behind a single lock; usage counters live behind a separate
//! reader/writer lock so they can be bumped while a commit is in flight.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::counters::{counters_to_cpu, COUNTER_NR};
use crate::device::ByteDevice;
use crate::disk_groups::DiskGroupsCpu;
use crate::fields::{FieldRef, FieldType, SbHandle};
use crate::journal_entry::DevUsageType;
use crate::members::{Member, MemberFlag, MemberState};
use crate::opts::FsOpts;
use crate::read::read_super;
use crate::replicas::{encode_entries, ForceFlags, ReplicasEntry};
use crate::super_block::{
    data_type, SuperBlockFlag, DATA_TYPE_NR, MEMBERS_MAX, NSEC_PER_SEC, REPLICAS_MAX,
};
use crate::validate::SbInvalid;
use crate::{BchError, Result};

use bitflags::bitflags;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, MutexGuard, RwLock};
use uuid::Uuid;

/// A set of device indices
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DevMask(u64);

impl DevMask {
    /// Build a mask from its raw bits
    pub fn from_bits(bits: u64) -> DevMask {
        DevMask(bits)
    }

    /// Raw bits
    pub fn bits(&self) -> u64 {
        self.0
    }

    /// Add a device; indices past the member limit are ignored
    pub fn set(&mut self, dev: u8) {
        if (dev as usize) < MEMBERS_MAX {
            self.0 |= 1 << dev;
        }
    }

    /// Remove a device
    pub fn clear(&mut self, dev: u8) {
        if (dev as usize) < MEMBERS_MAX {
            self.0 &= !(1 << dev);
        }
    }

    /// Whether `dev` is in the set
    pub fn test(&self, dev: u8) -> bool {
        (dev as usize) < MEMBERS_MAX && self.0 & (1 << dev) != 0
    }

    /// The set is empty
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Number of devices in the set
    pub fn nr(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Devices in the set, lowest first
    pub fn iter(&self) -> impl Iterator<Item = u8> {
        let bits = self.0;
        (0..MEMBERS_MAX as u8).filter(move |d| bits & (1 << d) != 0)
    }

    /// Devices in `self` but not in `other`
    pub fn difference(&self, other: &DevMask) -> DevMask {
        DevMask(self.0 & !other.0)
    }
}

bitflags! {
    /// Runtime state of a filesystem
    pub struct FsFlags: u32 {
        /// An error was found in the filesystem
        const ERROR = 1 << 0;
        /// A btree topology error was found
        const TOPOLOGY_ERROR = 1 << 1;
        /// A fatal error forced the filesystem read only
        const EMERGENCY_RO = 1 << 2;
    }
}

/// Decides whether a set of devices is enough to mount the filesystem
pub trait DegradedPolicy: Send + Sync {
    /// Whether the filesystem could be mounted with only `devs`, allowing
    /// the degradation named in `flags`
    fn have_enough_devs(&self, cache: &SbCache, devs: DevMask, flags: ForceFlags) -> bool;
}

/// Counts online copies of every replicas entry against its requirements
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplicasPolicy;

impl DegradedPolicy for ReplicasPolicy {
    fn have_enough_devs(&self, cache: &SbCache, devs: DevMask, flags: ForceFlags) -> bool {
        for e in cache.replicas.iter() {
            if e.data_type == data_type::CACHED {
                continue;
            }

            let nr_online = e.devs.iter().filter(|d| devs.test(**d)).count();
            let nr_failed = e
                .devs
                .iter()
                .filter(|d| {
                    cache
                        .members
                        .get(**d as usize)
                        .map_or(false, |m| m.state == MemberState::Failed)
                })
                .count();

            if nr_failed == e.devs.len() {
                continue;
            }

            let metadata = e.is_metadata();
            let mut dflags = ForceFlags::empty();
            if nr_online < e.nr_required as usize {
                dflags |= if metadata {
                    ForceFlags::METADATA_LOST
                } else {
                    ForceFlags::DATA_LOST
                };
            }
            if nr_online < e.devs.len() {
                dflags |= if metadata {
                    ForceFlags::METADATA_DEGRADED
                } else {
                    ForceFlags::DATA_DEGRADED
                };
            }

            if !(dflags - flags).is_empty() {
                debug!(
                    "insufficient devices online ({}) for replicas entry {}",
                    nr_online, e
                );
                return false;
            }
        }
        true
    }
}

/// The root of one btree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtreeRoot {
    /// Btree id
    pub btree_id: u8,
    /// Level of the root node
    pub level: u8,
    /// Packed key pointing at the root node
    pub key: Vec<u8>,
}

/// Source of the btree roots recorded at clean shutdown
pub trait BtreeRoots: Send + Sync {
    /// Every current btree root
    fn roots(&self) -> Vec<BtreeRoot>;
}

/// No btrees; used by tools that only deal with superblocks
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBtree;

impl BtreeRoots for NoBtree {
    fn roots(&self) -> Vec<BtreeRoot> {
        Vec::new()
    }
}

/// In-memory copy of one member record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberCpu {
    /// The record is in use
    pub valid: bool,
    /// Device uuid
    pub uuid: Uuid,
    /// Number of buckets
    pub nbuckets: u64,
    /// First usable bucket
    pub first_bucket: u16,
    /// Bucket size in sectors
    pub bucket_size: u16,
    /// Device state
    pub state: MemberState,
    /// Copies each write to this device counts for
    pub durability: u64,
    /// Data types allowed
    pub data_allowed: u64,
    /// Disk group plus one, zero for none
    pub group: u64,
    /// Issue discards
    pub discard: bool,
    /// Free space tracking has been initialised
    pub freespace_initialized: bool,
}

impl MemberCpu {
    fn from_member<T: AsRef<[u8]>>(m: &Member<T>) -> MemberCpu {
        let durability = m.flag(&MemberFlag::DURABILITY);
        MemberCpu {
            valid: m.exists(),
            uuid: m.uuid(),
            nbuckets: m.nbuckets(),
            first_bucket: m.first_bucket(),
            bucket_size: m.bucket_size(),
            state: m.state().unwrap_or(MemberState::Rw),
            durability: if durability != 0 { durability - 1 } else { 1 },
            data_allowed: m.flag(&MemberFlag::DATA_ALLOWED),
            group: m.flag(&MemberFlag::GROUP),
            discard: m.flag(&MemberFlag::DISCARD) != 0,
            freespace_initialized: m.flag(&MemberFlag::FREESPACE_INITIALIZED) != 0,
        }
    }
}

/// Values derived from the superblock, kept in memory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbCache {
    /// Internal uuid
    pub uuid: Uuid,
    /// User visible uuid
    pub user_uuid: Uuid,
    /// On-disk format version
    pub version: u16,
    /// Oldest version of metadata present
    pub version_min: u16,
    /// Number of member slots
    pub nr_devices: u8,
    /// Clean flag
    pub clean: bool,
    /// Encryption type option
    pub encryption_type: u64,
    /// Nanoseconds per filesystem time unit
    pub nsec_per_time_unit: u32,
    /// Filesystem time units per second
    pub time_units_per_sec: u64,
    /// Creation time in filesystem time units
    pub time_base_lo: u64,
    /// High bits of the creation time
    pub time_base_hi: u32,
    /// First feature word
    pub features: u64,
    /// First compat word
    pub compat: u64,
    /// Member records, indexed by device
    pub members: Vec<MemberCpu>,
    /// Replicas table, sorted
    pub replicas: Vec<ReplicasEntry>,
    /// Disk group table
    pub disk_groups: DiskGroupsCpu,
}

impl Default for SbCache {
    fn default() -> Self {
        SbCache {
            uuid: Uuid::nil(),
            user_uuid: Uuid::nil(),
            version: 0,
            version_min: 0,
            nr_devices: 0,
            clean: false,
            encryption_type: 0,
            nsec_per_time_unit: 1,
            time_units_per_sec: NSEC_PER_SEC,
            time_base_lo: 0,
            time_base_hi: 0,
            features: 0,
            compat: 0,
            members: Vec::new(),
            replicas: Vec::new(),
            disk_groups: DiskGroupsCpu::default(),
        }
    }
}

/// Usage counters of one device
#[derive(Debug, Default)]
pub(crate) struct DevUsage {
    pub(crate) buckets_ec: AtomicU64,
    pub(crate) buckets_unavailable: AtomicU64,
    d: [[AtomicU64; 3]; DATA_TYPE_NR],
}

impl DevUsage {
    pub(crate) fn snapshot(&self) -> [DevUsageType; DATA_TYPE_NR] {
        let mut out = [DevUsageType::default(); DATA_TYPE_NR];
        for (o, d) in out.iter_mut().zip(self.d.iter()) {
            o.buckets = d[0].load(Ordering::Relaxed);
            o.sectors = d[1].load(Ordering::Relaxed);
            o.fragmented = d[2].load(Ordering::Relaxed);
        }
        out
    }

    pub(crate) fn restore(&self, t: &[DevUsageType]) {
        for (d, t) in self.d.iter().zip(t.iter()) {
            d[0].store(t.buckets, Ordering::Relaxed);
            d[1].store(t.sectors, Ordering::Relaxed);
            d[2].store(t.fragmented, Ordering::Relaxed);
        }
    }
}

/// Usage accounting. The counters are atomics so they can be bumped under
/// the read lock; adding or removing counters takes the write lock.
#[derive(Debug, Default)]
pub(crate) struct Usage {
    pub(crate) inodes: AtomicU64,
    pub(crate) reserved: [AtomicU64; REPLICAS_MAX],
    pub(crate) replicas: Vec<(ReplicasEntry, AtomicU64)>,
    pub(crate) devs: Vec<DevUsage>,
    pub(crate) counters: Vec<AtomicU64>,
}

impl Usage {
    fn for_cache(cache: &SbCache) -> Usage {
        Usage {
            replicas: cache
                .replicas
                .iter()
                .map(|e| (e.clone(), AtomicU64::new(0)))
                .collect(),
            devs: (0..cache.nr_devices).map(|_| DevUsage::default()).collect(),
            counters: (0..COUNTER_NR).map(|_| AtomicU64::default()).collect(),
            ..Usage::default()
        }
    }
}

/// Superblock state guarded by the filesystem wide superblock lock
#[derive(Debug)]
pub struct FsSuper {
    pub(crate) disk_sb: SbHandle,
    pub(crate) devs: BTreeMap<u8, SbHandle>,
    pub(crate) cache: SbCache,
}

impl FsSuper {
    /// The authoritative superblock image
    pub fn disk_sb(&self) -> &SbHandle {
        &self.disk_sb
    }

    /// Mutable access to the authoritative image. Use
    /// [`FsSuper::field_resize`] to resize fields so that every device's
    /// image can follow.
    pub fn disk_sb_mut(&mut self) -> &mut SbHandle {
        &mut self.disk_sb
    }

    /// The private image of an online device
    pub fn dev_sb(&self, dev: u8) -> Option<&SbHandle> {
        self.devs.get(&dev)
    }

    /// Online devices
    pub fn online(&self) -> DevMask {
        let mut mask = DevMask::default();
        for dev in self.devs.keys() {
            mask.set(*dev);
        }
        mask
    }

    /// The in-memory projection
    pub fn cache(&self) -> &SbCache {
        &self.cache
    }

    /// Resize a field of the authoritative image.
    ///
    /// Every online device's buffer is grown first; if any of them can't
    /// grow nothing is changed.
    pub fn field_resize(&mut self, ty: FieldType, u64s: u32) -> Result<Option<FieldRef>> {
        let old_u64s = self.disk_sb.field_get(ty).map_or(0, |f| f.u64s);
        if u64s > old_u64s {
            let sb_u64s = self.disk_sb.sb().u64s() + u64s - old_u64s;
            for sb in self.devs.values_mut() {
                let per_dev: u32 = sb
                    .fields()
                    .filter(|f| f.field_type().map_or(false, |t| t.is_per_device()))
                    .map(|f| f.u64s)
                    .sum();
                sb.realloc(sb_u64s + per_dev)?;
            }
        }
        self.disk_sb.field_resize(ty, u64s)
    }

    /// Make `src` the authoritative image and rebuild the projection
    pub fn to_fs(&mut self, src: &SbHandle) -> Result<()> {
        self.disk_sb.copy_from(src)?;
        let sb = &self.disk_sb;
        self.cache.replicas = match sb.replicas() {
            Some(r) => r.entries().map_err(|err| SbInvalid::Field {
                field: FieldType::Replicas,
                err,
                text: sb
                    .field_get(FieldType::Replicas)
                    .map(|f| sb.field_text(&f))
                    .unwrap_or_default(),
            })?,
            None => Vec::new(),
        };
        self.cache.replicas.sort();
        self.cache.disk_groups = DiskGroupsCpu::from_sb(&self.disk_sb);
        self.update();
        Ok(())
    }

    /// Copy the authoritative image into one device's private image,
    /// keeping that device's own per-device fields
    pub fn from_fs(&mut self, dev: u8) -> Result<()> {
        let sb = self
            .devs
            .get_mut(&dev)
            .ok_or_else(|| BchError::Einval(format!("device {} not online", dev)))?;
        sb.copy_from(&self.disk_sb)
    }

    /// Refresh the scalar values and member records of the projection
    pub fn update(&mut self) {
        let s = self.disk_sb.sb();
        let c = &mut self.cache;
        c.uuid = s.uuid();
        c.user_uuid = s.user_uuid();
        c.version = s.version();
        c.version_min = s.version_min();
        c.nr_devices = s.nr_devices();
        c.clean = s.flag(&SuperBlockFlag::CLEAN) != 0;
        c.encryption_type = s.flag(&SuperBlockFlag::ENCRYPTION_TYPE);

        let precision = s.time_precision().max(1);
        c.nsec_per_time_unit = precision;
        c.time_units_per_sec = NSEC_PER_SEC / u64::from(precision);
        c.time_base_lo = s.time_base_lo() / u64::from(precision);
        c.time_base_hi = s.time_base_hi();
        c.features = s.feature(0);
        c.compat = s.compat(0);

        c.members = match self.disk_sb.members() {
            Some(members) => (0..c.nr_devices as usize)
                .filter_map(|i| members.member(i))
                .map(|m| MemberCpu::from_member(&m))
                .collect(),
            None => Vec::new(),
        };
    }
}

/// An open, possibly multi-device, filesystem as far as its superblocks
/// are concerned
pub struct Fs {
    pub(crate) opts: FsOpts,
    pub(crate) sb: Mutex<FsSuper>,
    pub(crate) usage: RwLock<Usage>,
    flags: AtomicU32,
    pub(crate) journal_seq: AtomicU64,
    pub(crate) key_version: AtomicU64,
    pub(crate) clocks: [AtomicU64; 2],
    pub(crate) degraded: Box<dyn DegradedPolicy>,
    pub(crate) btree: Box<dyn BtreeRoots>,
}

impl std::fmt::Debug for Fs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fs")
            .field("opts", &self.opts)
            .field("flags", &self.flags())
            .finish()
    }
}

impl Fs {
    /// Read the superblock of every device and assemble a filesystem.
    ///
    /// The image with the highest sequence number is authoritative; every
    /// device must belong to the same filesystem and occupy a distinct
    /// member slot.
    pub fn open(
        devices: Vec<Arc<dyn ByteDevice>>,
        opts: FsOpts,
        degraded: Box<dyn DegradedPolicy>,
        btree: Box<dyn BtreeRoots>,
    ) -> Result<Fs> {
        if devices.is_empty() {
            return Err(BchError::Einval("no devices given".to_string()));
        }

        let mut sbs = Vec::with_capacity(devices.len());
        for dev in devices {
            sbs.push(read_super(dev, &opts)?);
        }

        let best = sbs
            .iter()
            .enumerate()
            .max_by_key(|(_, sb)| sb.sb().seq())
            .map(|(i, _)| i)
            .unwrap_or(0);
        let best_seq = sbs[best].sb().seq();
        let uuid = sbs[best].sb().uuid();
        let members = sbs[best].member_mask();

        let mut seen = DevMask::default();
        for sb in sbs.iter() {
            let name = sb.device().map_or("?", |d| d.name()).to_string();
            if sb.sb().uuid() != uuid {
                return Err(BchError::Einval(format!(
                    "{}: not a member of filesystem {}",
                    name, uuid
                )));
            }
            let idx = sb.sb().dev_idx();
            if !members.test(idx) {
                return Err(BchError::Einval(format!(
                    "{}: device index {} has no member record",
                    name, idx
                )));
            }
            if sb.sb().seq() < best_seq {
                warn!(
                    "{}: stale superblock (seq {}, newest {})",
                    name,
                    sb.sb().seq(),
                    best_seq
                );
            }
            if seen.test(idx) {
                return Err(BchError::Einval(format!(
                    "{}: duplicate device index {}",
                    name, idx
                )));
            }
            seen.set(idx);
        }

        let mut s = FsSuper {
            disk_sb: SbHandle::new(None)?,
            devs: BTreeMap::new(),
            cache: SbCache::default(),
        };
        s.to_fs(&sbs[best])?;
        for sb in sbs {
            s.devs.insert(sb.sb().dev_idx(), sb);
        }

        info!(
            "opened filesystem {} with {} of {} devices, seq {}",
            s.cache.user_uuid,
            s.devs.len(),
            s.cache.nr_devices,
            best_seq
        );

        let mut usage = Usage::for_cache(&s.cache);
        counters_to_cpu(&s.disk_sb, &mut usage);

        let fs = Fs {
            opts,
            usage: RwLock::new(usage),
            sb: Mutex::new(s),
            flags: AtomicU32::new(0),
            journal_seq: AtomicU64::new(0),
            key_version: AtomicU64::new(0),
            clocks: [AtomicU64::new(0), AtomicU64::new(0)],
            degraded,
            btree,
        };
        fs.restore_clean();
        Ok(fs)
    }

    /// Runtime options
    pub fn opts(&self) -> &FsOpts {
        &self.opts
    }

    /// Take the superblock lock. Hold it across any read-modify-commit
    /// sequence.
    pub fn sb_lock(&self) -> MutexGuard<'_, FsSuper> {
        self.sb.lock()
    }

    /// Copy of the in-memory projection
    pub fn sb_cache(&self) -> SbCache {
        self.sb.lock().cache.clone()
    }

    /// Current runtime flags
    pub fn flags(&self) -> FsFlags {
        FsFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    /// Set runtime flags; error flags are recorded in the next commit
    pub fn set_flags(&self, flags: FsFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    /// The filesystem has gone read only after a fatal error
    pub fn is_emergency_ro(&self) -> bool {
        self.flags().contains(FsFlags::EMERGENCY_RO)
    }

    /// Record a fatal error and go read only
    pub(crate) fn fatal_error(&self, err: &BchError) {
        error!("fatal error: {}; going read only", err);
        self.set_flags(FsFlags::ERROR | FsFlags::EMERGENCY_RO);
    }

    /// Force flags a commit is checked against
    pub(crate) fn degraded_flags(&self) -> ForceFlags {
        if self.opts.very_degraded {
            ForceFlags::DEGRADED | ForceFlags::LOST
        } else {
            ForceFlags::DEGRADED
        }
    }

    /// Mark the filesystem initialized and write it out for the first time
    pub fn initialize(&self) -> Result<()> {
        let mut s = self.sb.lock();
        if s.disk_sb.sb().flag(&SuperBlockFlag::INITIALIZED) != 0 {
            return Ok(());
        }
        s.disk_sb
            .sb_mut()
            .set_flag_bool(&SuperBlockFlag::INITIALIZED, true);
        self.write_super(&mut s)
    }

    /// Set an incompatible feature bit, committing if it wasn't set
    pub fn check_set_feature(&self, bit: u32) -> Result<()> {
        if bit >= 64 {
            return Err(BchError::Einval(format!("feature bit {}", bit)));
        }
        let mut s = self.sb.lock();
        if s.cache.features & (1 << bit) != 0 {
            return Ok(());
        }
        let features = s.disk_sb.sb().feature(0) | (1 << bit);
        s.disk_sb.sb_mut().set_feature(0, features);
        self.write_super(&mut s)
    }

    /// Resize a field on every device, without committing
    pub fn field_resize(&self, ty: FieldType, u64s: u32) -> Result<Option<FieldRef>> {
        self.sb.lock().field_resize(ty, u64s)
    }

    /// Record that `entry` may hold data, adding it to the replicas section
    /// and the usage table if it is new
    pub fn mark_replicas(&self, entry: &ReplicasEntry) -> Result<()> {
        let entry = ReplicasEntry::new(entry.data_type, entry.nr_required, &entry.devs);
        let mut s = self.sb.lock();
        if s.cache.replicas.contains(&entry) {
            return Ok(());
        }
        entry
            .validate(&s.disk_sb.member_mask())
            .map_err(|e| BchError::Einval(format!("replicas entry {}: {}", entry, e)))?;

        let mut entries = s.cache.replicas.clone();
        entries.push(entry.clone());
        entries.sort();
        let payload = encode_entries(&entries);
        let f = s
            .field_resize(FieldType::Replicas, 1 + (payload.len() / 8) as u32)?
            .ok_or(BchError::Exhausted)?;
        s.disk_sb.field_payload_mut(&f).copy_from_slice(&payload);

        {
            let mut usage = self.usage.write();
            usage.replicas.push((entry.clone(), AtomicU64::new(0)));
            usage.replicas.sort_by(|a, b| a.0.cmp(&b.0));
        }
        s.cache.replicas = entries;
        debug!("marked replicas entry {}", entry);

        self.write_super(&mut s)
    }

    /// Account inodes created (positive) or deleted
    pub fn add_inodes(&self, delta: i64) {
        let usage = self.usage.read();
        add_signed(&usage.inodes, delta);
    }

    /// Account sectors written to a replicas entry; the entry must have
    /// been marked
    pub fn add_replicas_sectors(&self, entry: &ReplicasEntry, sectors: i64) -> Result<()> {
        let entry = ReplicasEntry::new(entry.data_type, entry.nr_required, &entry.devs);
        let usage = self.usage.read();
        let idx = usage
            .replicas
            .binary_search_by(|(e, _)| e.cmp(&entry))
            .map_err(|_| BchError::Einval(format!("replicas entry {} not marked", entry)))?;
        add_signed(&usage.replicas[idx].1, sectors);
        Ok(())
    }

    /// Account usage of one data type on a device
    pub fn add_dev_usage(
        &self,
        dev: u8,
        data_type: u8,
        buckets: i64,
        sectors: i64,
        fragmented: i64,
    ) -> Result<()> {
        let usage = self.usage.read();
        let d = usage
            .devs
            .get(dev as usize)
            .and_then(|d| d.d.get(data_type as usize))
            .ok_or_else(|| {
                BchError::Einval(format!("dev {} data type {}", dev, data_type))
            })?;
        add_signed(&d[0], buckets);
        add_signed(&d[1], sectors);
        add_signed(&d[2], fragmented);
        Ok(())
    }

    /// Account reserved sectors at a replication level (1 based)
    pub fn add_reserved(&self, nr_replicas: usize, sectors: i64) -> Result<()> {
        let usage = self.usage.read();
        let r = nr_replicas
            .checked_sub(1)
            .and_then(|i| usage.reserved.get(i))
            .ok_or_else(|| BchError::Einval(format!("nr_replicas {}", nr_replicas)))?;
        add_signed(r, sectors);
        Ok(())
    }

    /// Record the last committed journal sequence number
    pub fn set_journal_seq(&self, seq: u64) {
        self.journal_seq.store(seq, Ordering::SeqCst);
    }

    /// Last committed journal sequence number
    pub fn journal_seq(&self) -> u64 {
        self.journal_seq.load(Ordering::SeqCst)
    }

    /// Record the current key version
    pub fn set_key_version(&self, v: u64) {
        self.key_version.store(v, Ordering::SeqCst);
    }

    /// Advance the read (`rw == 0`) or write IO clock
    pub fn set_clock(&self, rw: usize, time: u64) {
        if let Some(c) = self.clocks.get(rw) {
            c.store(time, Ordering::SeqCst);
        }
    }

    /// Current IO clocks, read then write
    pub fn clocks(&self) -> [u64; 2] {
        [
            self.clocks[0].load(Ordering::SeqCst),
            self.clocks[1].load(Ordering::SeqCst),
        ]
    }

    /// Number of inodes accounted
    pub fn inodes(&self) -> u64 {
        self.usage.read().inodes.load(Ordering::Relaxed)
    }

    /// Sectors accounted to a replicas entry
    pub fn replicas_sectors(&self, entry: &ReplicasEntry) -> Option<u64> {
        let usage = self.usage.read();
        usage
            .replicas
            .iter()
            .find(|(e, _)| e == entry)
            .map(|(_, v)| v.load(Ordering::Relaxed))
    }
}

fn add_signed(v: &AtomicU64, delta: i64) {
    if delta >= 0 {
        v.fetch_add(delta as u64, Ordering::Relaxed);
    } else {
        v.fetch_sub(delta.unsigned_abs(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::tests::formatted;

    fn member(state: MemberState) -> MemberCpu {
        MemberCpu {
            valid: true,
            uuid: Uuid::new_v4(),
            nbuckets: 128,
            first_bucket: 0,
            bucket_size: 8,
            state,
            durability: 1,
            data_allowed: 0,
            group: 0,
            discard: false,
            freespace_initialized: false,
        }
    }

    fn cache(replicas: Vec<ReplicasEntry>, states: &[MemberState]) -> SbCache {
        SbCache {
            nr_devices: states.len() as u8,
            members: states.iter().map(|s| member(*s)).collect(),
            replicas,
            ..SbCache::default()
        }
    }

    fn mask(devs: &[u8]) -> DevMask {
        let mut m = DevMask::default();
        for d in devs {
            m.set(*d);
        }
        m
    }

    #[test]
    fn dev_mask() {
        let mut m = mask(&[0, 3, 63]);
        assert_eq!(m.nr(), 3);
        assert!(m.test(3) && !m.test(2));
        m.set(64);
        assert_eq!(m.nr(), 3);
        m.clear(3);
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![0, 63]);
        assert_eq!(mask(&[0, 1, 2]).difference(&mask(&[1])), mask(&[0, 2]));
    }

    #[test]
    fn replicas_policy() {
        let c = cache(
            vec![
                ReplicasEntry::new(data_type::BTREE, 1, &[0, 1]),
                ReplicasEntry::new(data_type::USER, 1, &[0, 1]),
                ReplicasEntry::new(data_type::CACHED, 1, &[2]),
            ],
            &[MemberState::Rw; 3],
        );
        let p = ReplicasPolicy;
        assert!(p.have_enough_devs(&c, mask(&[0, 1]), ForceFlags::empty()));
        assert!(!p.have_enough_devs(&c, mask(&[0]), ForceFlags::empty()));
        assert!(p.have_enough_devs(&c, mask(&[0]), ForceFlags::DEGRADED));
        assert!(!p.have_enough_devs(&c, mask(&[2]), ForceFlags::DEGRADED));
        assert!(p.have_enough_devs(&c, mask(&[2]), ForceFlags::DEGRADED | ForceFlags::LOST));
        // only metadata may be lost
        assert!(!p.have_enough_devs(
            &c,
            mask(&[2]),
            ForceFlags::DEGRADED | ForceFlags::METADATA_LOST
        ));
    }

    fn open(devs: &[Arc<crate::device::MemDevice>]) -> Fs {
        let devices = devs
            .iter()
            .map(|d| d.clone() as Arc<dyn ByteDevice>)
            .collect();
        Fs::open(
            devices,
            FsOpts::default(),
            Box::new(ReplicasPolicy),
            Box::new(NoBtree),
        )
        .unwrap()
    }

    fn commit(fs: &Fs) {
        let mut s = fs.sb_lock();
        fs.write_super(&mut s).unwrap();
    }

    #[test]
    fn replicas_projection_rebuilt_at_open() {
        let devs = formatted(2, true);
        let user = ReplicasEntry::new(data_type::USER, 1, &[0, 1]);
        let fs = open(&devs);
        fs.mark_replicas(&user).unwrap();
        commit(&fs);
        drop(fs);

        let fs = open(&devs);
        assert!(fs.sb_cache().replicas.contains(&user));
        assert_eq!(fs.replicas_sectors(&user), Some(0));
        assert_eq!(fs.sb_cache().nr_devices, 2);
    }

    #[test]
    fn corrupt_replicas_section_names_the_field() {
        let devs = formatted(1, true);
        let fs = open(&devs);
        fs.mark_replicas(&ReplicasEntry::new(data_type::USER, 1, &[0]))
            .unwrap();
        commit(&fs);

        let mut src = read_super(devs[0].clone(), &FsOpts::default()).unwrap();
        let f = src.field_get(FieldType::Replicas).unwrap();
        // claims more devices than the section holds
        src.field_payload_mut(&f)[1] = 255;

        let mut s = fs.sb_lock();
        match s.to_fs(&src) {
            Err(BchError::Invalid(SbInvalid::Field { field, .. })) => {
                assert_eq!(field, FieldType::Replicas);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn failed_grow_changes_no_device() {
        let devs = formatted(2, true);
        let fs = open(&devs);
        let mut s = fs.sb_lock();
        if let Some(sb) = s.devs.get_mut(&1) {
            // 8KiB for device 1 only
            sb.sb_mut().layout_mut().set_sb_max_size_bits(4);
        }
        let u64s = s.disk_sb().sb().u64s();
        let journal = s.disk_sb().field_get(FieldType::Journal).map(|f| f.u64s);
        let dev_u64s: Vec<u32> = s.devs.values().map(|sb| sb.sb().u64s()).collect();

        match s.field_resize(FieldType::Journal, 2048) {
            Err(BchError::SbTooBig { max, .. }) => assert_eq!(max, 8192),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(s.disk_sb().sb().u64s(), u64s);
        assert_eq!(
            s.disk_sb().field_get(FieldType::Journal).map(|f| f.u64s),
            journal
        );
        let after: Vec<u32> = s.devs.values().map(|sb| sb.sb().u64s()).collect();
        assert_eq!(after, dev_u64s);

        // the smaller device still takes a resize that fits
        assert!(s.field_resize(FieldType::Journal, 4).unwrap().is_some());
    }

    #[test]
    fn failed_devices_are_ignored() {
        let c = cache(
            vec![ReplicasEntry::new(data_type::USER, 1, &[1])],
            &[MemberState::Rw, MemberState::Failed],
        );
        assert!(ReplicasPolicy.have_enough_devs(&c, mask(&[0]), ForceFlags::empty()));
    }
}
