//! Persistent event counters.
//!
//! The counters section is a flat array of little endian u64s indexed by
//! the stable ids below. Counters the running code doesn't know about are
//! carried through unchanged.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::fields::{FieldType, SbHandle};
use crate::fs::{Fs, FsSuper, Usage};
use crate::{BchError, Result};

use byteorder::{ByteOrder, LittleEndian};

/// Names of the persistent counters, by stable id
pub const COUNTER_NAMES: [&str; 30] = [
    "io_read",
    "io_write",
    "io_move",
    "bucket_invalidate",
    "bucket_discard",
    "bucket_alloc",
    "bucket_alloc_fail",
    "btree_cache_scan",
    "btree_cache_reap",
    "btree_cache_cannibalize",
    "btree_cache_cannibalize_lock",
    "btree_cache_cannibalize_lock_fail",
    "btree_cache_cannibalize_unlock",
    "btree_node_write",
    "btree_node_read",
    "btree_node_compact",
    "btree_node_merge",
    "btree_node_split",
    "btree_node_rewrite",
    "btree_node_alloc",
    "btree_node_free",
    "btree_node_set_root",
    "btree_path_relock_fail",
    "btree_path_upgrade_fail",
    "btree_reserve_get_fail",
    "journal_entry_full",
    "journal_full",
    "journal_reclaim_finish",
    "journal_reclaim_start",
    "journal_write",
];

/// Number of counters known to this code
pub const COUNTER_NR: usize = COUNTER_NAMES.len();

/// Stable counter ids, indices into [`COUNTER_NAMES`]
pub mod counter {
    #![allow(missing_docs)]
    pub const IO_READ: usize = 0;
    pub const IO_WRITE: usize = 1;
    pub const IO_MOVE: usize = 2;
    pub const BUCKET_ALLOC: usize = 5;
    pub const BUCKET_ALLOC_FAIL: usize = 6;
    pub const BTREE_NODE_WRITE: usize = 13;
    pub const BTREE_NODE_READ: usize = 14;
    pub const JOURNAL_FULL: usize = 26;
    pub const JOURNAL_WRITE: usize = 29;
}

/// The counters section
#[derive(Debug, Clone, Copy)]
pub struct CountersField<'a> {
    buf: &'a [u8],
}

impl<'a> CountersField<'a> {
    /// View a counters section payload
    pub fn new(buf: &'a [u8]) -> CountersField<'a> {
        CountersField { buf }
    }

    /// Number of counters stored
    pub fn nr(&self) -> usize {
        self.buf.len() / 8
    }

    /// Value of counter `idx`; counters past the end read as zero
    pub fn get(&self, idx: usize) -> u64 {
        if idx < self.nr() {
            LittleEndian::read_u64(&self.buf[idx * 8..])
        } else {
            0
        }
    }

    pub(crate) fn to_text(&self, out: &mut String) {
        for i in 0..self.nr() {
            match COUNTER_NAMES.get(i) {
                Some(name) => {
                    let _ = writeln!(out, "  {:<34}{}", format!("{}:", name), self.get(i));
                }
                None => {
                    let _ = writeln!(out, "  {:<34}{}", format!("({}):", i), self.get(i));
                }
            }
        }
    }
}

/// Load the on-disk counters into fresh usage counters
pub(crate) fn counters_to_cpu(sb: &SbHandle, usage: &mut Usage) {
    let field = match sb.field_get(FieldType::Counters) {
        Some(f) => CountersField::new(sb.field_payload(&f)),
        None => return,
    };
    if field.nr() > usage.counters.len() {
        usage.counters.resize_with(field.nr(), AtomicU64::default);
    }
    for (i, c) in usage.counters.iter().enumerate() {
        c.store(field.get(i), Ordering::Relaxed);
    }
}

/// Store the usage counters into the authoritative image, growing the
/// counters section on every online device as needed.
pub(crate) fn counters_from_cpu(s: &mut FsSuper, usage: &Usage) -> Result<()> {
    let u64s = 1 + usage.counters.len() as u32;
    let f = s
        .field_resize(FieldType::Counters, u64s)?
        .ok_or(BchError::Exhausted)?;
    let payload = s.disk_sb.field_payload_mut(&f);
    for (dst, c) in payload.chunks_exact_mut(8).zip(usage.counters.iter()) {
        LittleEndian::write_u64(dst, c.load(Ordering::Relaxed));
    }
    Ok(())
}

impl Fs {
    /// Bump a persistent counter. Unknown ids are ignored.
    pub fn counter_add(&self, idx: usize, v: u64) {
        if let Some(c) = self.usage.read().counters.get(idx) {
            c.fetch_add(v, Ordering::Relaxed);
        }
    }

    /// Current value of a persistent counter
    pub fn counter(&self, idx: usize) -> u64 {
        self.usage
            .read()
            .counters
            .get(idx)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }
}
