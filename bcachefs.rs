#![deny(missing_docs)]
#![cfg_attr(not(test), deny(unused))]

//! Userspace tooling for creating and inspecting bcachefs superblocks

use std::convert::TryInto;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use env_logger::Builder;
use log::{debug, LevelFilter};
use uuid::Uuid;

use libbcachefs_sb::{
    format_device, read_super, sb_to_text, BchError, ChecksumOpt, FieldType, FileDevice,
    FsOpts, Result,
};

/// Bcachefs superblock tooling.
#[derive(Parser)]
#[clap(version = "0.1", author = "Dan Robertson <dan@dlrobertson.com>")]
struct Opts {
    /// Set the log level
    #[clap(short, long, parse(from_occurrences))]
    verbose: u8,
    /// The real command we will run
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Subcommand)]
enum SubCommand {
    /// Format a given device
    Format(FormatArgs),
    /// Dump the superblock of a device
    ShowSuper(ShowSuperArgs),
}

const MIN_BLOCK_SHIFT: u16 = 9;
const MAX_BLOCK_SHIFT: u16 = 15;

fn valid_label(s: &str) -> std::result::Result<(), String> {
    let len = s.bytes().len();
    if len > 32 {
        Err(format!("Label string of length `{}` too long.", len))
    } else {
        Ok(())
    }
}

fn valid_block_size(s: &str) -> std::result::Result<(), String> {
    match s.parse::<u16>() {
        Ok(size) if size >= 1 << MIN_BLOCK_SHIFT && size <= 1 << MAX_BLOCK_SHIFT => Ok(()),
        Ok(size) => Err(format!("invalid block size: {}", size)),
        _ => Err(format!("failed to parse integer: {}", s)),
    }
}

// Most of the complexity comes from sorting out the number of replicas. A
// user may specify `replicas` OR `data-replicas` AND `metadata-replicas`.
/// The arguments that the format subcommand may be provided.
#[derive(Debug, Args)]
struct FormatArgs {
    /// The number of metadata-replicas and data-replicas to be created
    #[clap(short = 'r', long = "replicas")]
    #[clap(conflicts_with_all = &["metadata-replicas", "data-replicas"])]
    replicas: Option<u64>,
    /// The number of metadata-replicas to be created
    #[clap(short = 'm', long = "metadata-replicas")]
    #[clap(requires = "data-replicas")]
    metadata_replicas: Option<u64>,
    /// The number of data-replicas to be created
    #[clap(short = 'd', long = "data-replicas")]
    #[clap(requires = "metadata-replicas")]
    data_replicas: Option<u64>,
    /// The formatted device should be encrypted
    #[clap(short = 'e', long = "encrypted")]
    encrypted: bool,
    /// Do not prompt for a passphrase on creation
    #[clap(long = "no-passphrase")]
    no_passphrase: bool,
    /// Write the superblocks but leave the filesystem uninitialized
    #[clap(long = "no-initialize")]
    no_initialize: bool,
    /// The disk label
    #[clap(short = 'l', long = "label", validator = valid_label)]
    label: Option<String>,
    /// The disk uuid
    #[clap(short = 'u', long = "uuid")]
    uuid: Option<Uuid>,
    /// Force creation if a preexisting FS exists
    #[clap(short = 'f', long = "force")]
    force: bool,
    /// Space reserved for each superblock copy, in sectors
    #[clap(long = "superblock-size", default_value = "2048")]
    superblock_size: u64,
    /// The block size of the new FS
    #[clap(long = "block-size", default_value = "512", validator = valid_block_size)]
    block_size: u16,
    /// Btree node size, in sectors
    #[clap(long = "btree-node-size")]
    btree_node_size: Option<u64>,
    /// Checksum used for metadata (none, crc32c)
    #[clap(long = "metadata-checksum", default_value = "crc32c")]
    metadata_checksum: ChecksumOpt,
    /// The devices to format
    #[clap(min_values = 1, required = true)]
    devices: Vec<String>,
}

impl FormatArgs {
    /// Resolve `(metadata, data)` replicas, checking both against the
    /// number of devices being formatted
    fn replicas(&self) -> Result<(u64, u64)> {
        let nr_devices = self.devices.len() as u64;
        let check = |flag: &str, v: u64| {
            if v == 0 || v > nr_devices {
                Err(BchError::Str(format!(
                    "Invalid --{} value `{}` for {} device(s)",
                    flag, v, nr_devices
                )))
            } else {
                Ok(v)
            }
        };

        match (self.replicas, self.metadata_replicas, self.data_replicas) {
            (None, None, None) => Ok((1, 1)),
            (Some(r), None, None) => {
                let r = check("replicas", r)?;
                Ok((r, r))
            }
            (None, Some(m), Some(d)) => Ok((
                check("metadata-replicas", m)?,
                check("data-replicas", d)?,
            )),
            (r, m, d) => Err(BchError::Str(format!(
                "Invalid replica options provided: replicas={:?} metadata={:?} data={:?}",
                r, m, d
            ))),
        }
    }
}

impl TryInto<libbcachefs_sb::FormatArgs> for FormatArgs {
    type Error = BchError;

    fn try_into(self) -> Result<libbcachefs_sb::FormatArgs> {
        let (metadata_replicas, data_replicas) = self.replicas()?;
        debug!(
            "metadata_replicas={} data_replicas={}",
            metadata_replicas, data_replicas
        );

        Ok(libbcachefs_sb::FormatArgs {
            metadata_replicas,
            data_replicas,
            encrypted: self.encrypted,
            no_passphrase: self.no_passphrase,
            no_initialize: self.no_initialize,
            label: self.label,
            uuid: self.uuid.unwrap_or_else(Uuid::new_v4),
            force: self.force,
            superblock_size: self.superblock_size,
            block_size: self.block_size,
            btree_node_size: self.btree_node_size,
            metadata_checksum: self.metadata_checksum,
            devices: self.devices,
        })
    }
}

/// The arguments that the show-super subcommand may be provided.
#[derive(Debug, Args)]
struct ShowSuperArgs {
    /// Comma separated list of sections to print, or `all`
    #[clap(short = 'f', long = "fields", default_value = "members")]
    fields: String,
    /// Print the superblock layout
    #[clap(short = 'l', long = "layout")]
    layout: bool,
    /// Read the superblock at this sector instead of the default
    #[clap(long = "superblock")]
    superblock: Option<u64>,
    /// The device to read
    device: String,
}

fn parse_fields(s: &str) -> Result<u64> {
    if s == "all" {
        return Ok(u64::MAX);
    }
    let mut mask = 0;
    for name in s.split(',').filter(|n| !n.is_empty()) {
        match FieldType::ALL.iter().find(|t| t.name() == name) {
            Some(t) => mask |= 1 << *t as u32,
            None => return Err(BchError::Einval(format!("unknown section `{}`", name))),
        }
    }
    Ok(mask)
}

fn show_super(args: ShowSuperArgs) -> Result<()> {
    let fields = parse_fields(&args.fields)?;
    let opts = FsOpts {
        sb: args.superblock,
        nochanges: true,
        read_only: true,
        ..FsOpts::default()
    };

    let dev = Arc::new(FileDevice::open(&args.device, true)?);
    let sb = read_super(dev, &opts)?;
    print!("{}", sb_to_text(&sb, args.layout, fields));
    Ok(())
}

fn main() {
    let opts: Opts = Opts::parse();

    let mut builder = Builder::new();

    match opts.verbose {
        0 => builder.filter_level(LevelFilter::Error),
        1 => builder.filter_level(LevelFilter::Warn),
        2 => builder.filter_level(LevelFilter::Info),
        3..=std::u8::MAX => builder.filter_level(LevelFilter::Debug),
    };

    builder.parse_default_env();
    builder.init();

    let res = match opts.subcmd {
        SubCommand::Format(args) => {
            debug!("format args={:?}", args);
            let args: Result<libbcachefs_sb::FormatArgs> = args.try_into();
            args.and_then(format_device)
        }
        SubCommand::ShowSuper(args) => {
            debug!("show-super args={:?}", args);
            show_super(args)
        }
    };

    if let Err(e) = res {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_format(argv: &[&str]) -> FormatArgs {
        let argv = ["bcachefs-sb", "format"].iter().chain(argv.iter());
        match Opts::try_parse_from(argv).unwrap().subcmd {
            SubCommand::Format(args) => args,
            SubCommand::ShowSuper(_) => panic!("parsed the wrong subcommand"),
        }
    }

    #[test]
    fn replicas_resolution() {
        assert_eq!(parse_format(&["a", "b"]).replicas().unwrap(), (1, 1));
        assert_eq!(parse_format(&["-r", "2", "a", "b"]).replicas().unwrap(), (2, 2));
        assert_eq!(
            parse_format(&["-m", "2", "-d", "1", "a", "b"])
                .replicas()
                .unwrap(),
            (2, 1)
        );
        assert!(parse_format(&["-r", "3", "a", "b"]).replicas().is_err());
        assert!(Opts::try_parse_from(&["bcachefs-sb", "format", "-m", "1", "a"]).is_err());
    }

    #[test]
    fn section_names() {
        assert_eq!(parse_fields("members,clean").unwrap(), (1 << 1) | (1 << 6));
        assert_eq!(parse_fields("all").unwrap(), u64::MAX);
        assert!(parse_fields("bogus").is_err());
    }
}
