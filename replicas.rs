//! Replicas section: which sets of devices hold which kind of data.

use std::collections::BTreeSet;
use std::fmt::{self, Write};

use crate::fields::SbHandle;
use crate::super_block::{DATA_TYPE_NAMES, DATA_TYPE_NR};
use crate::validate::FieldInvalid;

use bitflags::bitflags;

bitflags! {
    /// Conditions a degraded mount is allowed to proceed under
    pub struct ForceFlags: u32 {
        /// Some user data has no surviving copy
        const DATA_LOST = 1 << 0;
        /// Some metadata has no surviving copy
        const METADATA_LOST = 1 << 1;
        /// Some user data is missing copies
        const DATA_DEGRADED = 1 << 2;
        /// Some metadata is missing copies
        const METADATA_DEGRADED = 1 << 3;
        /// Either kind of loss
        const LOST = Self::DATA_LOST.bits | Self::METADATA_LOST.bits;
        /// Either kind of degradation
        const DEGRADED = Self::DATA_DEGRADED.bits | Self::METADATA_DEGRADED.bits;
    }
}

const ENTRY_HEADER_BYTES: usize = 3;

/// One replicas entry
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplicasEntry {
    /// Data type stored on this set of devices
    pub data_type: u8,
    /// Number of devices that must be present to read the data
    pub nr_required: u8,
    /// Device indices, sorted
    pub devs: Vec<u8>,
}

impl ReplicasEntry {
    /// Create an entry, sorting and deduplicating the device list
    pub fn new(data_type: u8, nr_required: u8, devs: &[u8]) -> ReplicasEntry {
        let mut devs = devs.to_vec();
        devs.sort_unstable();
        devs.dedup();
        ReplicasEntry {
            data_type,
            nr_required,
            devs,
        }
    }

    /// Encoded size in bytes
    pub fn bytes(&self) -> usize {
        ENTRY_HEADER_BYTES + self.devs.len()
    }

    /// Append the on-disk encoding
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.data_type);
        out.push(self.devs.len() as u8);
        out.push(self.nr_required);
        out.extend_from_slice(&self.devs);
    }

    /// Decode one entry from the start of `buf`
    pub fn decode(buf: &[u8]) -> Option<ReplicasEntry> {
        if buf.len() < ENTRY_HEADER_BYTES {
            return None;
        }
        let nr_devs = buf[1] as usize;
        let devs = buf.get(ENTRY_HEADER_BYTES..ENTRY_HEADER_BYTES + nr_devs)?;
        Some(ReplicasEntry {
            data_type: buf[0],
            nr_required: buf[2],
            devs: devs.to_vec(),
        })
    }

    /// Metadata is everything stored below user data
    pub fn is_metadata(&self) -> bool {
        self.data_type < crate::super_block::data_type::USER
    }

    pub(crate) fn validate(&self, members: &crate::fs::DevMask) -> std::result::Result<(), FieldInvalid> {
        if self.data_type == 0 || self.data_type as usize >= DATA_TYPE_NR {
            return Err(FieldInvalid::ReplicasDataType(self.data_type));
        }

        if self.devs.is_empty() {
            return Err(FieldInvalid::ReplicasNoDevices);
        }

        if self.nr_required == 0 || self.nr_required as usize > self.devs.len() {
            return Err(FieldInvalid::ReplicasNrRequired {
                nr_required: self.nr_required,
                nr_devs: self.devs.len() as u8,
            });
        }

        if self.devs.windows(2).any(|w| w[0] >= w[1]) {
            return Err(FieldInvalid::ReplicasUnsorted);
        }

        if let Some(dev) = self.devs.iter().find(|d| !members.test(**d)) {
            return Err(FieldInvalid::ReplicasBadDevice(*dev));
        }

        Ok(())
    }
}

impl fmt::Display for ReplicasEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match DATA_TYPE_NAMES.get(self.data_type as usize) {
            Some(name) => write!(f, "{}", name)?,
            None => write!(f, "(invalid data type {})", self.data_type)?,
        }
        write!(f, ": {}/{} [", self.nr_required, self.devs.len())?;
        for (i, d) in self.devs.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

/// Encode entries as a section payload, padded to whole u64s
pub fn encode_entries(entries: &[ReplicasEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    for e in entries {
        e.encode(&mut out);
    }
    let padded = (out.len() + 7) / 8 * 8;
    out.resize(padded, 0);
    out
}

/// The replicas section
#[derive(Debug, Clone, Copy)]
pub struct ReplicasField<'a> {
    buf: &'a [u8],
}

impl<'a> ReplicasField<'a> {
    /// View a replicas section payload
    pub fn new(buf: &'a [u8]) -> ReplicasField<'a> {
        ReplicasField { buf }
    }

    /// Decode every entry. Entries end at a zero data type or the end of
    /// the section.
    pub fn entries(&self) -> std::result::Result<Vec<ReplicasEntry>, FieldInvalid> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < self.buf.len() && self.buf[pos] != 0 {
            let e = ReplicasEntry::decode(&self.buf[pos..]).ok_or(FieldInvalid::ReplicasTruncated)?;
            pos += e.bytes();
            out.push(e);
        }
        Ok(out)
    }

    /// Data types with a copy on `dev`, as a bitmask
    pub fn dev_has_data(&self, dev: u8) -> u64 {
        self.entries()
            .unwrap_or_default()
            .iter()
            .filter(|e| e.devs.contains(&dev))
            .fold(0, |acc, e| acc | 1u64 << (e.data_type as u64 % 64))
    }

    pub(crate) fn validate(&self, sb: &SbHandle) -> std::result::Result<(), FieldInvalid> {
        let members = sb.member_mask();
        let mut seen = BTreeSet::new();
        for e in self.entries()? {
            e.validate(&members)?;
            if !seen.insert(e) {
                return Err(FieldInvalid::ReplicasDuplicate);
            }
        }
        Ok(())
    }

    pub(crate) fn to_text(&self, out: &mut String) {
        match self.entries() {
            Ok(entries) => {
                for (i, e) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    let _ = write!(out, "{}", e);
                }
                out.push('\n');
            }
            Err(e) => {
                let _ = writeln!(out, "({})", e);
            }
        }
    }
}
