//! Journal set entries, as embedded in the clean section.
//!
//! Only the entry types the clean section carries are interpreted; every
//! other type is skipped over by its length and left untouched.

use std::convert::TryFrom;
use std::fmt::Write;

use crate::fs::DevMask;
use crate::replicas::ReplicasEntry;
use crate::super_block::{DATA_TYPE_NAMES, DATA_TYPE_NR};
use crate::validate::{FieldInvalid, Rw};

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

/// Size of an entry header
pub const JSET_ENTRY_HEADER_BYTES: usize = 8;

/// Entry type numbers
pub mod entry_type {
    /// Btree keys
    pub const BTREE_KEYS: u8 = 0;
    /// Root of a btree
    pub const BTREE_ROOT: u8 = 1;
    /// Filesystem wide usage counter
    pub const USAGE: u8 = 5;
    /// Usage of one replicas entry
    pub const DATA_USAGE: u8 = 6;
    /// IO clock
    pub const CLOCK: u8 = 7;
    /// Per device usage
    pub const DEV_USAGE: u8 = 8;
}

const ENTRY_TYPE_NAMES: [&str; 11] = [
    "btree_keys",
    "btree_root",
    "prio_ptrs",
    "blacklist",
    "blacklist_v2",
    "usage",
    "data_usage",
    "clock",
    "dev_usage",
    "log",
    "overwrite",
];

/// What a usage entry counts; stored in the entry's btree id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UsageType {
    /// Reserved sectors, one entry per replication level
    Reserved = 0,
    /// Number of inodes
    Inodes = 1,
    /// Current key version
    KeyVersion = 2,
}

impl UsageType {
    fn name(v: u8) -> &'static str {
        match v {
            0 => "reserved",
            1 => "inodes",
            2 => "key_version",
            _ => "(unknown)",
        }
    }
}

const CLOCK_PAYLOAD_BYTES: usize = 16;
const DEV_USAGE_FIXED_BYTES: usize = 24;
const DEV_USAGE_TYPE_BYTES: usize = 24;
const DATA_USAGE_FIXED_BYTES: usize = 8;

/// Per data type counters of one device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DevUsageType {
    /// Buckets holding this data type
    pub buckets: u64,
    /// Sectors of this data type
    pub sectors: u64,
    /// Sectors in partially used buckets
    pub fragmented: u64,
}

/// An owned journal set entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsetEntry {
    /// Entry type
    pub ty: u8,
    /// Btree id, or the usage type for usage entries
    pub btree_id: u8,
    /// Btree level, or the replication level for reserved usage
    pub level: u8,
    /// Payload, a whole number of u64s
    pub data: Vec<u8>,
}

fn pad_to_u64s(mut data: Vec<u8>) -> Vec<u8> {
    let len = (data.len() + 7) / 8 * 8;
    data.resize(len, 0);
    data
}

impl JsetEntry {
    fn new(ty: u8, btree_id: u8, level: u8, data: Vec<u8>) -> JsetEntry {
        JsetEntry {
            ty,
            btree_id,
            level,
            data: pad_to_u64s(data),
        }
    }

    /// A usage counter
    pub fn usage(usage: UsageType, level: u8, v: u64) -> JsetEntry {
        JsetEntry::new(
            entry_type::USAGE,
            usage as u8,
            level,
            v.to_le_bytes().to_vec(),
        )
    }

    /// Sectors used by one replicas entry
    pub fn data_usage(v: u64, r: &ReplicasEntry) -> JsetEntry {
        let mut data = v.to_le_bytes().to_vec();
        r.encode(&mut data);
        JsetEntry::new(entry_type::DATA_USAGE, 0, 0, data)
    }

    /// IO clock for reads (`rw == 0`) or writes (`rw == 1`)
    pub fn clock(rw: u8, time: u64) -> JsetEntry {
        let mut data = vec![0u8; CLOCK_PAYLOAD_BYTES];
        data[0] = rw;
        LittleEndian::write_u64(&mut data[8..], time);
        JsetEntry::new(entry_type::CLOCK, 0, 0, data)
    }

    /// Usage of one device
    pub fn dev_usage(
        dev: u8,
        buckets_ec: u64,
        buckets_unavailable: u64,
        d: &[DevUsageType; DATA_TYPE_NR],
    ) -> JsetEntry {
        let mut data = vec![0u8; DEV_USAGE_FIXED_BYTES + DATA_TYPE_NR * DEV_USAGE_TYPE_BYTES];
        LittleEndian::write_u32(&mut data[0..], u32::from(dev));
        LittleEndian::write_u64(&mut data[8..], buckets_ec);
        LittleEndian::write_u64(&mut data[16..], buckets_unavailable);
        for (i, t) in d.iter().enumerate() {
            let at = DEV_USAGE_FIXED_BYTES + i * DEV_USAGE_TYPE_BYTES;
            LittleEndian::write_u64(&mut data[at..], t.buckets);
            LittleEndian::write_u64(&mut data[at + 8..], t.sectors);
            LittleEndian::write_u64(&mut data[at + 16..], t.fragmented);
        }
        JsetEntry::new(entry_type::DEV_USAGE, 0, 0, data)
    }

    /// A btree root. `key` is the packed key, whose first byte is its
    /// length in u64s.
    pub fn btree_root(btree_id: u8, level: u8, key: &[u8]) -> JsetEntry {
        JsetEntry::new(entry_type::BTREE_ROOT, btree_id, level, key.to_vec())
    }

    /// Value of a usage or data usage entry
    pub fn value(&self) -> Option<u64> {
        match self.ty {
            entry_type::USAGE | entry_type::DATA_USAGE => {
                self.data.get(0..8).map(LittleEndian::read_u64)
            }
            _ => None,
        }
    }

    /// Replicas entry a data usage entry counts against
    pub fn replicas(&self) -> Option<ReplicasEntry> {
        if self.ty != entry_type::DATA_USAGE {
            return None;
        }
        self.data
            .get(DATA_USAGE_FIXED_BYTES..)
            .and_then(ReplicasEntry::decode)
    }

    /// Direction and time of a clock entry
    pub fn clock_time(&self) -> Option<(u8, u64)> {
        if self.ty != entry_type::CLOCK || self.data.len() != CLOCK_PAYLOAD_BYTES {
            return None;
        }
        Some((self.data[0], LittleEndian::read_u64(&self.data[8..])))
    }

    /// Device index, erasure coded buckets, unavailable buckets and per
    /// data type counters of a dev usage entry. Data types missing from a
    /// short entry read as zero.
    pub fn dev_usage_counters(&self) -> Option<(u8, u64, u64, [DevUsageType; DATA_TYPE_NR])> {
        if self.ty != entry_type::DEV_USAGE || self.data.len() < DEV_USAGE_FIXED_BYTES {
            return None;
        }
        let dev = LittleEndian::read_u32(&self.data[0..]);
        let dev = u8::try_from(dev).ok()?;
        let mut d = [DevUsageType::default(); DATA_TYPE_NR];
        for (i, t) in d.iter_mut().enumerate() {
            let at = DEV_USAGE_FIXED_BYTES + i * DEV_USAGE_TYPE_BYTES;
            if let Some(w) = self.data.get(at..at + DEV_USAGE_TYPE_BYTES) {
                t.buckets = LittleEndian::read_u64(&w[0..]);
                t.sectors = LittleEndian::read_u64(&w[8..]);
                t.fragmented = LittleEndian::read_u64(&w[16..]);
            }
        }
        Some((
            dev,
            LittleEndian::read_u64(&self.data[8..]),
            LittleEndian::read_u64(&self.data[16..]),
            d,
        ))
    }

    /// Payload length in u64s
    pub fn u64s(&self) -> u16 {
        (self.data.len() / 8) as u16
    }

    /// Encoded length in bytes, header included
    pub fn bytes(&self) -> usize {
        JSET_ENTRY_HEADER_BYTES + self.data.len()
    }

    /// Append the on-disk encoding
    pub fn encode(&self, out: &mut Vec<u8>) {
        let mut hdr = [0u8; JSET_ENTRY_HEADER_BYTES];
        LittleEndian::write_u16(&mut hdr[0..], self.u64s());
        hdr[2] = self.btree_id;
        hdr[3] = self.level;
        hdr[4] = self.ty;
        out.extend_from_slice(&hdr);
        out.extend_from_slice(&self.data);
    }

    /// Decode a packed run of entries, stopping at the end of `buf`
    pub fn decode_all(buf: &[u8]) -> std::result::Result<Vec<JsetEntry>, FieldInvalid> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos + JSET_ENTRY_HEADER_BYTES <= buf.len() {
            let end = entry_end(buf, pos)?;
            out.push(JsetEntry {
                ty: buf[pos + 4],
                btree_id: buf[pos + 2],
                level: buf[pos + 3],
                data: buf[pos + JSET_ENTRY_HEADER_BYTES..end].to_vec(),
            });
            pos = end;
        }
        Ok(out)
    }
}

/// Encode a run of entries
pub fn encode_entries(entries: &[JsetEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.iter().map(JsetEntry::bytes).sum());
    for e in entries {
        e.encode(&mut out);
    }
    out
}

fn entry_end(buf: &[u8], pos: usize) -> std::result::Result<usize, FieldInvalid> {
    let u64s = LittleEndian::read_u16(&buf[pos..]) as usize;
    let end = pos + JSET_ENTRY_HEADER_BYTES + u64s * 8;
    if end > buf.len() {
        return Err(FieldInvalid::Entry {
            offset: pos,
            ty: buf[pos + 4],
            reason: format!("extends past end ({} > {})", end, buf.len()),
        });
    }
    Ok(end)
}

/// Context entries are validated in
#[derive(Debug, Clone, Copy)]
pub struct EntryCtx {
    /// Direction; in read direction some defects are repaired instead
    pub rw: Rw,
    /// Devices that are members of the filesystem
    pub devs: DevMask,
}

/// Validate a packed run of entries in place.
///
/// In read direction a btree root whose key length disagrees with the
/// entry is cleared: its length is set to zero and its payload zeroed.
pub fn validate_entries(buf: &mut [u8], ctx: &EntryCtx) -> std::result::Result<(), FieldInvalid> {
    let mut pos = 0;
    while pos + JSET_ENTRY_HEADER_BYTES <= buf.len() {
        let end = entry_end(buf, pos)?;
        validate_one(&mut buf[pos..end], pos, ctx)?;
        pos = end;
    }
    Ok(())
}

fn validate_one(
    entry: &mut [u8],
    offset: usize,
    ctx: &EntryCtx,
) -> std::result::Result<(), FieldInvalid> {
    let ty = entry[4];
    let err = |reason: String| FieldInvalid::Entry { offset, ty, reason };
    let payload_len = entry.len() - JSET_ENTRY_HEADER_BYTES;

    match ty {
        entry_type::BTREE_ROOT => {
            let u64s = payload_len / 8;
            let key_u64s = entry.get(JSET_ENTRY_HEADER_BYTES).copied().unwrap_or(0) as usize;
            if u64s == 0 || u64s != key_u64s {
                if ctx.rw == Rw::Write {
                    return Err(err(format!(
                        "btree root: wrong number of keys (entry {} key {})",
                        u64s, key_u64s
                    )));
                }
                warn!(
                    "clean section: dropping malformed btree root at offset {}",
                    offset
                );
                LittleEndian::write_u16(&mut entry[0..], 0);
                for b in entry[JSET_ENTRY_HEADER_BYTES..].iter_mut() {
                    *b = 0;
                }
            }
        }
        entry_type::USAGE => {
            if payload_len < 8 {
                return Err(err(format!("usage: bad size {}", payload_len)));
            }
        }
        entry_type::DATA_USAGE => {
            let payload = &entry[JSET_ENTRY_HEADER_BYTES..];
            let r = payload
                .get(DATA_USAGE_FIXED_BYTES..)
                .and_then(ReplicasEntry::decode)
                .ok_or_else(|| err(format!("data_usage: bad size {}", payload_len)))?;
            r.validate(&ctx.devs)
                .map_err(|e| err(format!("data_usage: invalid replicas entry: {}", e)))?;
        }
        entry_type::CLOCK => {
            if payload_len != CLOCK_PAYLOAD_BYTES {
                return Err(err(format!("clock: bad size {}", payload_len)));
            }
            let rw = entry[JSET_ENTRY_HEADER_BYTES];
            if rw > 1 {
                return Err(err(format!("clock: bad rw {}", rw)));
            }
        }
        entry_type::DEV_USAGE => {
            if payload_len < DEV_USAGE_FIXED_BYTES {
                return Err(err(format!("dev_usage: bad size {}", payload_len)));
            }
            let payload = &entry[JSET_ENTRY_HEADER_BYTES..];
            let dev = LittleEndian::read_u32(&payload[0..]);
            if dev > u32::from(u8::MAX) || !ctx.devs.test(dev as u8) {
                return Err(err(format!("dev_usage: bad dev {}", dev)));
            }
            if LittleEndian::read_u32(&payload[4..]) != 0 {
                return Err(err("dev_usage: bad pad".to_string()));
            }
        }
        _ => {}
    }
    Ok(())
}

fn entry_to_text(e: &JsetEntry, out: &mut String) {
    let name = ENTRY_TYPE_NAMES
        .get(e.ty as usize)
        .copied()
        .unwrap_or("(unknown)");
    let _ = write!(out, "{}: ", name);
    let word = |at: usize| {
        e.data
            .get(at..at + 8)
            .map(LittleEndian::read_u64)
            .unwrap_or(0)
    };

    match e.ty {
        entry_type::BTREE_ROOT => {
            let _ = write!(out, "btree={} l={} u64s={}", e.btree_id, e.level, e.u64s());
        }
        entry_type::USAGE => {
            let _ = write!(out, "type={} v={}", UsageType::name(e.btree_id), word(0));
            if e.btree_id == UsageType::Reserved as u8 {
                let _ = write!(out, " replicas={}", e.level);
            }
        }
        entry_type::DATA_USAGE => {
            match e
                .data
                .get(DATA_USAGE_FIXED_BYTES..)
                .and_then(ReplicasEntry::decode)
            {
                Some(r) => {
                    let _ = write!(out, "{}={}", r, word(0));
                }
                None => out.push_str("(truncated)"),
            }
        }
        entry_type::CLOCK => {
            let rw = if e.data.first() == Some(&1) { "write" } else { "read" };
            let _ = write!(out, "{}={}", rw, word(8));
        }
        entry_type::DEV_USAGE => {
            let dev = e.data.get(0..4).map(LittleEndian::read_u32).unwrap_or(0);
            let _ = write!(
                out,
                "dev={} buckets_ec={} buckets_unavailable={}",
                dev,
                word(8),
                word(16)
            );
            for (i, name) in DATA_TYPE_NAMES.iter().enumerate() {
                let at = DEV_USAGE_FIXED_BYTES + i * DEV_USAGE_TYPE_BYTES;
                if at + DEV_USAGE_TYPE_BYTES > e.data.len() {
                    break;
                }
                let (buckets, sectors, fragmented) = (word(at), word(at + 8), word(at + 16));
                if buckets != 0 || sectors != 0 || fragmented != 0 {
                    let _ = write!(
                        out,
                        " {}: buckets={} sectors={} fragmented={}",
                        name, buckets, sectors, fragmented
                    );
                }
            }
        }
        _ => {
            let _ = write!(out, "u64s={}", e.u64s());
        }
    }
    out.push('\n');
}

/// Render a packed run of entries, one per line
pub fn jset_entries_to_text(buf: &[u8], out: &mut String) {
    match JsetEntry::decode_all(buf) {
        Ok(entries) => {
            for e in entries.iter().filter(|e| !(e.ty == entry_type::BTREE_KEYS && e.data.is_empty())) {
                entry_to_text(e, out);
            }
        }
        Err(e) => {
            let _ = writeln!(out, "({})", e);
        }
    }
}
