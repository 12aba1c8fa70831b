use std::cmp;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::device::{ByteDevice, FileDevice};
use crate::fields::{FieldType, SbHandle};
use crate::fs::{Fs, NoBtree, ReplicasPolicy};
use crate::layout::Layout;
use crate::members::{MemberFlag, MemberState, MEMBER_BYTES};
use crate::opts::{ChecksumOpt, FsOpts};
use crate::read::read_super;
use crate::super_block::{
    DataTypes, Features, SuperBlockFlag, BCHFS_MAGIC, BLOCK_SIZE_MAX, LAYOUT_SECTOR, MEMBERS_MAX,
    METADATA_VERSION_CURRENT, MIN_NR_NBUCKETS, SB_SECTOR,
};
use crate::validate::{validate_super, Rw, SbInvalid};
use crate::write::{prepare_copy, write_copy};
use crate::{BchError, Result};

use log::{debug, info};
use uuid::Uuid;

/// Default btree node size, in sectors
const DEFAULT_BTREE_NODE_SIZE: u64 = 512;
/// Preferred bucket size, in sectors
const DEFAULT_BUCKET_SIZE: u64 = 256;
/// Preferred number of buckets; buckets shrink until a device has this many
const PREFERRED_NR_NBUCKETS: u64 = MIN_NR_NBUCKETS << 3;

/// Arguments that the format subcommand may be provided.
#[derive(Debug, Clone)]
pub struct Args {
    /// The number of metadata-replicas to be created
    pub metadata_replicas: u64,
    /// The number of data-replicas to be created
    pub data_replicas: u64,
    /// The formatted device should be encrypted
    pub encrypted: bool,
    /// Do not prompt for a passphrase on creation
    pub no_passphrase: bool,
    /// Do not attempt to initialize the device
    pub no_initialize: bool,
    /// The disk label
    pub label: Option<String>,
    /// The disk uuid
    pub uuid: Uuid,
    /// Force creation if a preexisting FS exists
    pub force: bool,
    /// Space reserved for each superblock copy, in sectors
    pub superblock_size: u64,
    /// The block size of the new FS, in bytes
    pub block_size: u16,
    /// Btree node size in sectors; defaults to the smallest bucket, at
    /// most 256k
    pub btree_node_size: Option<u64>,
    /// Checksum used for metadata
    pub metadata_checksum: ChecksumOpt,
    /// The devices to format
    pub devices: Vec<String>,
}

impl Default for Args {
    fn default() -> Self {
        Args {
            metadata_replicas: 1,
            data_replicas: 1,
            encrypted: false,
            no_passphrase: false,
            no_initialize: false,
            label: None,
            uuid: Uuid::new_v4(),
            force: false,
            superblock_size: 2048,
            block_size: 512,
            btree_node_size: None,
            metadata_checksum: ChecksumOpt::Crc32c,
            devices: Vec::new(),
        }
    }
}

/// Geometry picked for one device, in sectors
#[derive(Debug)]
struct Geometry {
    size: u64,
    bucket_size: u64,
    nbuckets: u64,
}

/// Pick a bucket size: 128k if the device is big enough to have a sensible
/// number of them, smaller otherwise, but never below a block.
fn geometry(dev: &dyn ByteDevice, block_sectors: u64) -> Result<Geometry> {
    let size = dev.len_bytes() >> 9;
    let mut bucket_size = cmp::max(DEFAULT_BUCKET_SIZE, block_sectors);

    while bucket_size > block_sectors && size / bucket_size < PREFERRED_NR_NBUCKETS {
        bucket_size /= 2;
    }

    let nbuckets = size / bucket_size;
    if nbuckets < MIN_NR_NBUCKETS {
        return Err(BchError::Str(format!(
            "cannot format {}, too small ({} sectors, min {})",
            dev.name(),
            size,
            MIN_NR_NBUCKETS * block_sectors
        )));
    }

    let g = Geometry {
        size,
        bucket_size,
        nbuckets,
    };
    debug!("device {}: {:?}", dev.name(), g);
    Ok(g)
}

fn now() -> std::time::Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
}

/// Write every copy of `sb` to `dev`, along with the layout descriptor in
/// the sector before the first copy. Used before a filesystem exists; a
/// mounted filesystem commits through [`Fs::write_super`].
pub fn super_write(dev: &dyn ByteDevice, sb: &mut SbHandle) -> Result<()> {
    let csum_type = sb.sb().flag(&SuperBlockFlag::CSUM_TYPE);
    for idx in 0.. {
        let (at, len) = match prepare_copy(sb, idx, csum_type, dev.block_size())? {
            Some(copy) => copy,
            None => break,
        };
        if at == SB_SECTOR << 9 {
            let layout = Layout::from_view(&sb.sb().layout()).to_bytes()?;
            dev.write_at(LAYOUT_SECTOR << 9, &layout)?;
        }
        write_copy(sb, dev, at, len)?;
    }
    dev.sync()
}

/// The superblock image shared by every device of a new filesystem
fn build_super(args: &Args, geoms: &[Geometry], btree_node_size: u64) -> Result<SbHandle> {
    let mut sb = SbHandle::new(None)?;
    let created = now();

    {
        let mut s = sb.sb_mut();
        s.set_version(METADATA_VERSION_CURRENT);
        s.set_version_min(METADATA_VERSION_CURRENT);
        s.set_magic(BCHFS_MAGIC);
        s.set_uuid(Uuid::new_v4());
        s.set_user_uuid(args.uuid);
        if let Some(ref label) = args.label {
            s.set_label(label.as_bytes())?;
        }
        s.set_block_size(args.block_size >> 9);
        s.set_nr_devices(geoms.len() as u8);
        s.set_time_base_lo(created.as_nanos() as u64);
        s.set_time_precision(1);

        s.set_flag(
            &SuperBlockFlag::CSUM_TYPE,
            args.metadata_checksum.csum_type() as u64,
        )?;
        s.set_flag(&SuperBlockFlag::ERROR_ACTION, 1)?;
        s.set_flag(&SuperBlockFlag::BTREE_NODE_SIZE, btree_node_size)?;
        s.set_flag(&SuperBlockFlag::GC_RESERVE, 8)?;
        s.set_flag(
            &SuperBlockFlag::META_CSUM_TYPE,
            args.metadata_checksum.sb_value(),
        )?;
        s.set_flag(&SuperBlockFlag::DATA_CSUM_TYPE, 1)?;
        s.set_flag(&SuperBlockFlag::META_REPLICAS_WANT, args.metadata_replicas)?;
        s.set_flag(&SuperBlockFlag::DATA_REPLICAS_WANT, args.data_replicas)?;
        s.set_flag(&SuperBlockFlag::META_REPLICAS_REQ, 1)?;
        s.set_flag(&SuperBlockFlag::DATA_REPLICAS_REQ, 1)?;
        s.set_flag(&SuperBlockFlag::STR_HASH_TYPE, 2)?;
        s.set_flag(&SuperBlockFlag::JOURNAL_FLUSH_DELAY, 1000)?;
        s.set_flag(&SuperBlockFlag::JOURNAL_RECLAIM_DELAY, 100)?;

        debug!("Building out features 0x{:x}", Features::ALL.bits());
        s.set_feature(0, Features::ALL.bits());
    }

    let u64s = (MEMBER_BYTES * geoms.len() / 8) as u32;
    sb.field_resize(FieldType::Members, 1 + u64s)?;
    for (i, g) in geoms.iter().enumerate() {
        let mut m = sb.member_mut(i).ok_or(BchError::Exhausted)?;
        m.set_uuid(Uuid::new_v4());
        m.set_nbuckets(g.nbuckets);
        m.set_first_bucket(0);
        m.set_bucket_size(g.bucket_size as u16);
        m.set_last_mount(created.as_secs());
        m.set_state(MemberState::Rw);
        m.set_flag(&MemberFlag::DATA_ALLOWED, DataTypes::DEFAULT.bits())?;
        m.set_flag(&MemberFlag::DURABILITY, 2)?;
    }

    Ok(sb)
}

/// Format `devices` as one new filesystem.
///
/// Every device gets its own layout: two copies after the default sector
/// and a backup near the end of the device. Unless `args.no_initialize` is
/// set the new filesystem is then opened, initialized and marked clean.
pub fn format(devices: &[Arc<dyn ByteDevice>], args: &Args) -> Result<Vec<SbHandle>> {
    if devices.is_empty() || devices.len() > MEMBERS_MAX {
        return Err(BchError::Einval(format!(
            "invalid number of devices {}",
            devices.len()
        )));
    }

    if args.encrypted {
        return Err(BchError::Einval(
            "encryption is not supported".to_string(),
        ));
    }

    let block_size = u64::from(args.block_size);
    if !block_size.is_power_of_two() || block_size < 512 || block_size >> 9 > u64::from(BLOCK_SIZE_MAX)
    {
        return Err(BchError::Einval(format!("block size {}", block_size)));
    }

    if let Some(dev) = devices.iter().find(|d| d.block_size() > block_size) {
        return Err(SbInvalid::BlockSizeTooSmall {
            block_size,
            device: dev.block_size(),
        }
        .into());
    }

    let geoms = devices
        .iter()
        .map(|d| geometry(&**d, block_size >> 9))
        .collect::<Result<Vec<_>>>()?;

    let min_bucket = geoms
        .iter()
        .map(|g| g.bucket_size)
        .min()
        .unwrap_or(DEFAULT_BTREE_NODE_SIZE);
    let btree_node_size = args
        .btree_node_size
        .unwrap_or_else(|| cmp::min(min_bucket, DEFAULT_BTREE_NODE_SIZE));

    let base = build_super(args, &geoms, btree_node_size)?;

    let mut out = Vec::with_capacity(devices.len());
    for (i, (dev, g)) in devices.iter().zip(geoms.iter()).enumerate() {
        let mut sb = SbHandle::new(Some(dev.clone()))?;
        sb.copy_from(&base)?;
        sb.sb_mut().set_dev_idx(i as u8);

        let mut layout = Layout::init(block_size, args.superblock_size, SB_SECTOR, g.size)?;
        layout.add_backup(g.size, g.bucket_size)?;
        layout.write_to(&mut sb.sb_mut().layout_mut())?;
        sb.have_layout = true;

        validate_super(&mut sb, Rw::Write)?;

        debug!("zeroing start of {}", dev.name());
        dev.write_at(0, &[0u8; (SB_SECTOR as usize) << 9])?;
        super_write(&**dev, &mut sb)?;
        info!(
            "{}: formatted, {} buckets of {} sectors, superblocks at {:?}",
            dev.name(),
            g.nbuckets,
            g.bucket_size,
            layout.offsets
        );
        out.push(sb);
    }

    if !args.no_initialize {
        let opts = FsOpts {
            metadata_checksum: args.metadata_checksum,
            ..FsOpts::default()
        };
        let fs = Fs::open(
            devices.to_vec(),
            opts,
            Box::new(ReplicasPolicy),
            Box::new(NoBtree),
        )?;
        fs.initialize()?;
        fs.mark_clean()?;
    }

    Ok(out)
}

/// Ask before overwriting a device that already holds a filesystem
fn check_device(dev: Arc<dyn ByteDevice>) -> Result<()> {
    let name = dev.name().to_string();
    let sb = match read_super(dev, &FsOpts::default()) {
        Ok(sb) => sb,
        Err(_) => return Ok(()),
    };

    let label = String::from_utf8_lossy(sb.sb().label())
        .trim_end_matches('\0')
        .to_string();
    if label.is_empty() {
        println!("{} contains a bcachefs filesystem", name);
    } else {
        println!("{} contains a bcachefs filesystem labelled `{}`", name, label);
    }

    let mut input = String::new();
    print!("Proceed anyway? ");
    io::stdout().flush()?;
    io::stdin().read_line(&mut input)?;
    let yn = input.trim();

    if yn == "y" || yn == "Y" {
        Ok(())
    } else {
        Err(BchError::Str("Existing filesystem found".to_string()))
    }
}

/// Real main function for the format subcommand
pub fn format_device(args: Args) -> Result<()> {
    let mut devices: Vec<Arc<dyn ByteDevice>> = Vec::with_capacity(args.devices.len());
    for path in args.devices.iter() {
        debug!("opening device: {}", path);
        devices.push(Arc::new(FileDevice::open(path, false)?));
    }

    if !args.force {
        for dev in devices.iter() {
            check_device(dev.clone())?;
        }
    }

    let sbs = format(&devices, &args)?;
    if let Some(sb) = sbs.first() {
        println!(
            "External UUID:  {}\nInternal UUID:  {}\nDevices:        {}",
            sb.sb().user_uuid(),
            sb.sb().uuid(),
            sbs.len()
        );
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::device::MemDevice;

    pub(crate) const MEM_DEVICE_BYTES: usize = 4 << 20;

    pub(crate) fn test_args(nr: usize) -> Args {
        Args {
            superblock_size: 128,
            devices: (0..nr).map(|i| format!("mem{}", i)).collect(),
            ..Args::default()
        }
    }

    pub(crate) fn mem_devices(nr: usize) -> Vec<Arc<MemDevice>> {
        (0..nr)
            .map(|i| Arc::new(MemDevice::new(&format!("mem{}", i), MEM_DEVICE_BYTES, 512)))
            .collect()
    }

    pub(crate) fn as_dyn(devs: &[Arc<MemDevice>]) -> Vec<Arc<dyn ByteDevice>> {
        devs.iter()
            .map(|d| d.clone() as Arc<dyn ByteDevice>)
            .collect()
    }

    /// `nr` formatted in-memory devices of one filesystem
    pub(crate) fn formatted(nr: usize, initialize: bool) -> Vec<Arc<MemDevice>> {
        let devs = mem_devices(nr);
        let args = Args {
            no_initialize: !initialize,
            ..test_args(nr)
        };
        format(&as_dyn(&devs), &args).unwrap();
        devs
    }

    #[test]
    fn small_device_geometry() {
        let dev = MemDevice::new("mem", MEM_DEVICE_BYTES, 512);
        let g = geometry(&dev, 1).unwrap();
        assert_eq!(g.size, 8192);
        assert_eq!(g.bucket_size, 16);
        assert_eq!(g.nbuckets, 512);

        let big = MemDevice::new("big", 64 << 20, 512);
        assert_eq!(geometry(&big, 1).unwrap().bucket_size, DEFAULT_BUCKET_SIZE);

        let tiny = MemDevice::new("tiny", 16 << 10, 512);
        assert!(geometry(&tiny, 8).is_err());
    }

    #[test]
    fn format_writes_three_copies() {
        let devs = mem_devices(2);
        let sbs = format(
            &as_dyn(&devs),
            &Args {
                no_initialize: true,
                ..test_args(2)
            },
        )
        .unwrap();

        for (i, sb) in sbs.iter().enumerate() {
            let s = sb.sb();
            assert_eq!(s.dev_idx(), i as u8);
            assert_eq!(s.seq(), 0);
            assert_eq!(s.flag(&SuperBlockFlag::INITIALIZED), 0);
            let layout = s.layout();
            assert_eq!(layout.nr_superblocks(), 3);
            assert_eq!(layout.sb_offset(0), SB_SECTOR);
            assert_eq!(layout.sb_offset(1), SB_SECTOR + 128);
            assert_eq!(layout.sb_offset(2), 8192 - 128);
        }
        assert_eq!(sbs[0].sb().uuid(), sbs[1].sb().uuid());

        let members = sbs[0].members().unwrap();
        assert_eq!(members.nr(), 2);
        assert_ne!(
            members.member(0).unwrap().uuid(),
            members.member(1).unwrap().uuid()
        );

        let sb = read_super(devs[1].clone(), &FsOpts::default()).unwrap();
        assert_eq!(sb.sb().dev_idx(), 1);
        let layout = Layout::from_bytes(&devs[1].peek((LAYOUT_SECTOR as usize) << 9, 512)).unwrap();
        assert_eq!(layout.offsets, vec![8, 136, 8064]);
    }

    #[test]
    fn format_initializes_and_marks_clean() {
        let devs = formatted(1, true);
        let sb = read_super(devs[0].clone(), &FsOpts::default()).unwrap();
        assert_eq!(sb.sb().flag(&SuperBlockFlag::INITIALIZED), 1);
        assert_eq!(sb.sb().flag(&SuperBlockFlag::CLEAN), 1);
        assert_eq!(sb.sb().seq(), 2);
    }

    #[test]
    fn format_rejects_bad_arguments() {
        let devs = as_dyn(&mem_devices(1));
        let encrypted = Args {
            encrypted: true,
            ..test_args(1)
        };
        assert!(matches!(format(&devs, &encrypted), Err(BchError::Einval(_))));

        let odd_block = Args {
            block_size: 1000,
            ..test_args(1)
        };
        assert!(format(&devs, &odd_block).is_err());

        let big_sector: Vec<Arc<dyn ByteDevice>> =
            vec![Arc::new(MemDevice::new("4k", MEM_DEVICE_BYTES, 4096))];
        assert!(matches!(
            format(&big_sector, &test_args(1)),
            Err(BchError::Invalid(SbInvalid::BlockSizeTooSmall { .. }))
        ));
    }
}
